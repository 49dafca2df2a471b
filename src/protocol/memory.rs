//! In-memory controller used for simulation and tests.

use super::{ProtocolError, Transport};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A controller whose data blocks live in process memory.
///
/// Blocks grow on demand and read as zero until written. Reachability can be
/// toggled to simulate a lost link.
pub struct MemoryTransport {
    blocks: Mutex<HashMap<u16, Vec<u8>>>,
    bad_bytes: Mutex<HashSet<(u16, u32)>>,
    connected: AtomicBool,
    reachable: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            bad_bytes: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Marking the controller unreachable also drops the current connection.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    pub fn set_bytes(&self, db: u16, start: u32, data: &[u8]) {
        let mut blocks = self.blocks.lock();
        let block = blocks.entry(db).or_default();
        let start = start as usize;
        if block.len() < start + data.len() {
            block.resize(start + data.len(), 0);
        }
        block[start..start + data.len()].copy_from_slice(data);
    }

    pub fn bytes(&self, db: u16, start: u32, len: usize) -> Vec<u8> {
        let blocks = self.blocks.lock();
        let start = start as usize;
        let mut out = vec![0u8; len];
        if let Some(block) = blocks.get(&db) {
            for (i, b) in out.iter_mut().enumerate() {
                if let Some(v) = block.get(start + i) {
                    *b = *v;
                }
            }
        }
        out
    }

    pub fn set_word(&self, db: u16, byte: u32, value: u16) {
        self.set_bytes(db, byte, &value.to_be_bytes());
    }

    /// Make every read covering this byte fail, as a controller does for an
    /// address it cannot serve.
    pub fn fail_reads_at(&self, db: u16, byte: u32) {
        self.bad_bytes.lock().insert((db, byte));
    }

    fn readable(&self, db: u16, start: u32, len: usize) -> Result<(), ProtocolError> {
        let bad = self.bad_bytes.lock();
        let end = start as u64 + len as u64;
        match bad.iter().find(|(d, b)| *d == db && (*b as u64) >= start as u64 && (*b as u64) < end) {
            Some((d, b)) => Err(ProtocolError::Rejected(format!("DB{}.DBB{} is not readable", d, b))),
            None => Ok(()),
        }
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<(), ProtocolError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProtocolError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), ProtocolError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "simulated controller unreachable",
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read(&self, db: u16, start: u32, len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.readable(db, start, len)?;
        Ok(self.bytes(db, start, len))
    }

    async fn write(&self, db: u16, start: u32, data: &[u8]) -> Result<(), ProtocolError> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.set_bytes(db, start, data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requires_connection() {
        let plc = MemoryTransport::new();
        assert!(matches!(plc.read(1, 0, 2).await, Err(ProtocolError::NotConnected)));

        plc.connect().await.unwrap();
        assert_eq!(plc.read(1, 0, 2).await.unwrap(), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_failed_bytes_reject_reads() {
        let plc = MemoryTransport::new();
        plc.connect().await.unwrap();
        plc.fail_reads_at(4, 3);

        assert!(matches!(plc.read(4, 2, 2).await, Err(ProtocolError::Rejected(_))));
        assert!(plc.read(4, 0, 2).await.is_ok());
        assert!(plc.read(5, 2, 2).await.is_ok());
        assert!(plc.is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_drops_link() {
        let plc = MemoryTransport::new();
        plc.connect().await.unwrap();

        plc.set_reachable(false);
        assert!(!plc.is_connected());
        assert!(plc.probe().await.is_err());
        assert!(plc.connect().await.is_err());

        plc.set_reachable(true);
        plc.connect().await.unwrap();
        assert!(plc.probe().await.is_ok());
    }
}

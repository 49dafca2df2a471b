//! Transport capability injected into device sessions.

use super::{MemoryTransport, ProtocolError, S7Transport};
use crate::config::PlcConfig;
use crate::db::Controller;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Address prefix selecting the in-memory simulated controller.
pub const SIMULATED_PREFIX: &str = "sim://";

/// Raw byte access to a controller's data blocks.
///
/// Implementations own their connection state and must be safe to call from
/// several tasks at once; each call is one complete request/response exchange.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), ProtocolError>;

    /// Idempotent.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    async fn read(&self, db: u16, start: u32, len: usize) -> Result<Vec<u8>, ProtocolError>;

    /// Writes `data` as a single request; never partially.
    async fn write(&self, db: u16, start: u32, data: &[u8]) -> Result<(), ProtocolError>;

    /// Liveness check used by the session watchdog.
    async fn probe(&self) -> Result<(), ProtocolError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ProtocolError::NotConnected)
        }
    }
}

/// Builds the transport for a controller row.
pub trait TransportFactory: Send + Sync {
    fn create(&self, controller: &Controller) -> Arc<dyn Transport>;
}

/// Picks the S7 transport for network addresses and a named in-memory
/// controller for `sim://` addresses.
pub struct DefaultTransportFactory {
    config: PlcConfig,
    simulated: Mutex<HashMap<String, Arc<MemoryTransport>>>,
}

impl DefaultTransportFactory {
    pub fn new(config: PlcConfig) -> Self {
        Self {
            config,
            simulated: Mutex::new(HashMap::new()),
        }
    }

    /// The simulated controller registered under `name`, created on first use.
    ///
    /// The same instance is handed out across restarts so its memory survives
    /// a controller being reconfigured.
    pub fn simulated(&self, name: &str) -> Arc<MemoryTransport> {
        self.simulated
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryTransport::new()))
            .clone()
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, controller: &Controller) -> Arc<dyn Transport> {
        if let Some(name) = controller.address.strip_prefix(SIMULATED_PREFIX) {
            return self.simulated(name);
        }

        Arc::new(S7Transport::new(
            &controller.address,
            controller.rack,
            controller.slot,
            &self.config,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_controllers_are_shared_by_name() {
        let factory = DefaultTransportFactory::new(PlcConfig::default());
        let line = Controller {
            name: "line".to_string(),
            address: "sim://line-1".to_string(),
            ..Default::default()
        };

        let first = factory.create(&line);
        first.connect().await.unwrap();
        first.write(1, 0, &[0xAB]).await.unwrap();

        let second = factory.create(&line);
        assert!(second.is_connected());
        assert_eq!(second.read(1, 0, 1).await.unwrap(), vec![0xAB]);
    }
}

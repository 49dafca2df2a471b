//! Fault detection: word monitors feed a batch processor that commits
//! activations, deactivations and history.

mod batch;
mod monitor;

pub use batch::*;
pub use monitor::*;

use crate::config::PlcConfig;
use crate::db::{
    Acknowledgement, ActiveFault, DbError, DefinitionFilter, FaultStatus, FaultTransition, HistoryEntry,
    HistoryFilter, Store,
};
use crate::events::{Event, EventBus, FaultAcknowledged};
use crate::fleet::DeviceSession;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Fault manager error types.
#[derive(Error, Debug)]
pub enum FaultError {
    #[error("fault {0} is not active")]
    NotActive(i64),
    #[error("fault {0} not found")]
    NotFound(i64),
    #[error("database error: {0}")]
    Db(#[from] DbError),
}

/// Committed state of every active fault.
///
/// Holds exactly the rows the last successful commit left active.
#[derive(Default)]
pub struct ActiveCache {
    inner: RwLock<HashMap<i64, FaultStatus>>,
}

impl ActiveCache {
    pub fn prewarm(&self, statuses: Vec<FaultStatus>) {
        let mut inner = self.inner.write();
        inner.clear();
        for status in statuses.into_iter().filter(|s| s.active) {
            inner.insert(status.fault_id, status);
        }
    }

    pub fn get(&self, fault_id: i64) -> Option<FaultStatus> {
        self.inner.read().get(&fault_id).cloned()
    }

    pub fn started_at(&self, fault_id: i64) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .get(&fault_id)
            .map(|s| s.started_at.unwrap_or_else(Utc::now))
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn apply(&self, transitions: &[FaultTransition]) {
        let mut inner = self.inner.write();
        for t in transitions {
            match t {
                FaultTransition::Activated { fault_id, at } => {
                    inner.insert(
                        *fault_id,
                        FaultStatus {
                            fault_id: *fault_id,
                            active: true,
                            started_at: Some(*at),
                            acknowledgement: None,
                        },
                    );
                }
                FaultTransition::Deactivated { fault_id, .. } => {
                    inner.remove(fault_id);
                }
            }
        }
    }

    /// False when the fault is no longer active.
    pub fn acknowledge(&self, fault_id: i64, ack: &Acknowledgement) -> bool {
        match self.inner.write().get_mut(&fault_id) {
            Some(status) => {
                status.acknowledgement = Some(ack.clone());
                true
            }
            None => false,
        }
    }

    /// The word value implied by the active faults mapped onto `monitor`.
    pub fn seed(&self, monitor: &WordMonitor) -> u16 {
        let inner = self.inner.read();
        monitor
            .definitions()
            .filter(|(_, def)| inner.contains_key(&def.id))
            .fold(0u16, |word, (bit, _)| word | (1 << bit))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FaultStats {
    pub dropped_changes: u64,
    pub buffered_changes: usize,
    pub active_faults: usize,
    pub word_monitors: usize,
    pub monitor_tasks: usize,
}

/// Owns fault definitions at runtime, the monitor tasks and the batch processor.
pub struct FaultManager {
    store: Arc<Store>,
    config: PlcConfig,
    events: Arc<EventBus>,
    registry: Arc<WordRegistry>,
    cache: Arc<ActiveCache>,
    ledger: Arc<dyn FaultLedger>,
    change_tx: mpsc::Sender<WordChange>,
    change_rx: Mutex<Option<mpsc::Receiver<WordChange>>>,
    stop_chans: tokio::sync::RwLock<HashMap<i64, broadcast::Sender<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    dropped: Arc<AtomicU64>,
    buffered: Mutex<Arc<AtomicUsize>>,
    live_tasks: Arc<AtomicUsize>,
    processor: Mutex<Option<JoinHandle<()>>>,
}

impl FaultManager {
    pub fn new(store: Arc<Store>, events: Arc<EventBus>, config: PlcConfig) -> Self {
        let ledger: Arc<dyn FaultLedger> = store.clone();
        let (change_tx, change_rx) = mpsc::channel(config.change_capacity.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            store,
            config,
            events,
            registry: Arc::new(WordRegistry::new()),
            cache: Arc::new(ActiveCache::default()),
            ledger,
            change_tx,
            change_rx: Mutex::new(Some(change_rx)),
            stop_chans: tokio::sync::RwLock::new(HashMap::new()),
            shutdown_tx,
            dropped: Arc::new(AtomicU64::new(0)),
            buffered: Mutex::new(Arc::new(AtomicUsize::new(0))),
            live_tasks: Arc::new(AtomicUsize::new(0)),
            processor: Mutex::new(None),
        }
    }

    /// Load definitions, pre-warm the active cache and start the batch processor.
    pub async fn initialize(&self) -> Result<(), FaultError> {
        self.load_registry()?;
        self.cache.prewarm(self.store.active_statuses()?);
        tracing::info!(
            "Fault manager loaded {} word monitors, {} active faults",
            self.registry.len(),
            self.cache.len()
        );

        let rx = self.change_rx.lock().take();
        if let Some(rx) = rx {
            let processor = BatchProcessor::new(
                self.ledger.clone(),
                self.registry.clone(),
                self.cache.clone(),
                self.events.clone(),
                self.config.batch_max_size,
                self.config.batch_period,
            );
            *self.buffered.lock() = processor.buffered();
            let handle = tokio::spawn(processor.run(rx, self.shutdown_tx.subscribe()));
            *self.processor.lock() = Some(handle);
        }
        Ok(())
    }

    fn load_registry(&self) -> Result<(), FaultError> {
        let defs = self.store.list_definitions(&DefinitionFilter {
            enabled: Some(true),
            ..Default::default()
        })?;
        let names = self
            .store
            .list_controllers()?
            .into_iter()
            .map(|c| (c.id, c.name))
            .collect();
        self.registry.rebuild(defs, names);
        Ok(())
    }

    /// Start one monitor task per data block of the controller, replacing any
    /// already running for it.
    pub async fn start_monitoring(&self, session: Arc<DeviceSession>) {
        let controller_id = session.controller_id();
        self.stop_monitoring(controller_id).await;
        if session.is_retired() {
            return;
        }

        self.registry
            .set_controller_name(controller_id, &session.controller_name());
        let groups = self.registry.groups_for(controller_id);
        if groups.is_empty() {
            return;
        }

        let (stop_tx, _) = broadcast::channel(1);
        let count = groups.len();
        for (db, words) in groups {
            let group = MonitorGroup {
                db,
                words,
                session: session.clone(),
                cache: self.cache.clone(),
                tx: self.change_tx.clone(),
                dropped: self.dropped.clone(),
                period: self.config.monitor_interval,
            };
            let guard = TaskGuard::enter(&self.live_tasks);
            tokio::spawn(run_db_monitor(group, stop_tx.subscribe(), session.retirement(), guard));
        }

        self.stop_chans.write().await.insert(controller_id, stop_tx);
        if session.is_retired() {
            // retired while the groups were spawning; they exit on their own
            self.stop_monitoring(controller_id).await;
            return;
        }
        tracing::info!(
            "Fault monitoring started for controller {} ({} data blocks)",
            controller_id,
            count
        );
    }

    pub fn rename_controller(&self, controller_id: i64, name: &str) {
        self.registry.set_controller_name(controller_id, name);
    }

    pub async fn stop_monitoring(&self, controller_id: i64) {
        if let Some(stop_tx) = self.stop_chans.write().await.remove(&controller_id) {
            let _ = stop_tx.send(());
            tracing::info!("Fault monitoring stopped for controller {}", controller_id);
        }
    }

    async fn stop_all_monitoring(&self) {
        let mut chans = self.stop_chans.write().await;
        for (_, stop_tx) in chans.drain() {
            let _ = stop_tx.send(());
        }
    }

    /// Stop every monitor task and rebuild the word map from the store.
    ///
    /// Callers restart monitoring for connected controllers afterwards.
    pub async fn reload_definitions(&self) -> Result<(), FaultError> {
        self.stop_all_monitoring().await;
        self.load_registry()?;
        tracing::info!("Fault definitions reloaded: {} word monitors", self.registry.len());
        Ok(())
    }

    pub fn acknowledge_fault(&self, fault_id: i64, actor_id: i64, actor_name: &str) -> Result<Acknowledgement, FaultError> {
        if self.cache.get(fault_id).is_none() {
            return Err(FaultError::NotActive(fault_id));
        }

        let ack = Acknowledgement {
            by: actor_id,
            by_name: actor_name.to_string(),
            at: Utc::now(),
        };
        if !self.store.acknowledge_fault(fault_id, &ack)? {
            return Err(FaultError::NotActive(fault_id));
        }
        // a deactivation committed in between leaves nothing to update
        self.cache.acknowledge(fault_id, &ack);

        let controller_id = match self.registry.definition(fault_id) {
            Some(def) => def.controller_id,
            None => match self.store.get_definition(fault_id) {
                Ok(def) => def.controller_id,
                Err(DbError::NotFound) => return Err(FaultError::NotFound(fault_id)),
                Err(e) => return Err(e.into()),
            },
        };
        self.events.publish(Event::FaultAcknowledged(FaultAcknowledged {
            fault_id,
            controller_id,
            acknowledgement: ack.clone(),
        }));
        tracing::info!("Fault {} acknowledged by {}", fault_id, actor_name);
        Ok(ack)
    }

    pub fn active_faults(&self) -> Result<Vec<ActiveFault>, FaultError> {
        Ok(self.store.active_faults()?)
    }

    pub fn history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>, FaultError> {
        Ok(self.store.fault_history(filter)?)
    }

    pub fn sites(&self) -> Result<Vec<String>, FaultError> {
        Ok(self.store.sites()?)
    }

    pub fn subsystems(&self) -> Result<Vec<String>, FaultError> {
        Ok(self.store.subsystems()?)
    }

    pub fn stats(&self) -> FaultStats {
        FaultStats {
            dropped_changes: self.dropped.load(Ordering::Relaxed),
            buffered_changes: self.buffered.lock().load(Ordering::Relaxed),
            active_faults: self.cache.len(),
            word_monitors: self.registry.len(),
            monitor_tasks: self.live_tasks.load(Ordering::SeqCst),
        }
    }

    /// Stop all monitors and wait for the batch processor to flush.
    pub async fn shutdown(&self) {
        self.stop_all_monitoring().await;
        let _ = self.shutdown_tx.send(());

        let handle = self.processor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Fault batch processor failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Controller, FaultDefinition, Severity};
    use crate::protocol::{MemoryTransport, Transport};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    struct Fixture {
        _tmp: NamedTempFile,
        store: Arc<Store>,
        events: Arc<EventBus>,
        plc: Arc<MemoryTransport>,
        session: Arc<DeviceSession>,
        controller_id: i64,
    }

    fn fast_config() -> PlcConfig {
        PlcConfig {
            monitor_interval: Duration::from_millis(10),
            batch_period: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn fixture(bits: &[(u16, u32, u8)]) -> Fixture {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let mut controller = Controller {
            name: "Lock 2".to_string(),
            address: "sim://lock-2".to_string(),
            ..Default::default()
        };
        let controller_id = store.create_controller(&mut controller).unwrap();

        for (db, byte, bit) in bits {
            let mut def = FaultDefinition {
                controller_id,
                word_name: format!("DB{}.DBW{}", db, byte),
                db_number: *db,
                byte_offset: *byte,
                bit_offset: *bit,
                site: "south".to_string(),
                subsystem: "valves".to_string(),
                description: format!("bit {}", bit),
                severity: Severity::Event,
                ..Default::default()
            };
            store.create_definition(&mut def).unwrap();
        }

        let events = Arc::new(EventBus::new(256));
        let plc = Arc::new(MemoryTransport::new());
        let session = Arc::new(DeviceSession::new(
            controller,
            plc.clone(),
            Duration::from_secs(1),
            events.clone(),
        ));
        session.connect().await.unwrap();

        Fixture {
            _tmp: tmp,
            store,
            events,
            plc,
            session,
            controller_id,
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_activation_ack_and_clear() {
        let f = fixture(&[(30, 0, 0), (30, 0, 12)]).await;
        let faults = FaultManager::new(f.store.clone(), f.events.clone(), fast_config());
        faults.initialize().await.unwrap();
        faults.start_monitoring(f.session.clone()).await;
        let mut acks = f.events.subscribe(&["faults.acknowledged"]);

        f.plc.set_word(30, 0, 0x1000);
        assert!(wait_for(|| faults.stats().active_faults == 1).await);

        let active = faults.active_faults().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].bit_offset, 12);
        let fault_id = active[0].fault_id;

        faults.acknowledge_fault(fault_id, 3, "operator").unwrap();
        assert!(acks.recv().await.is_some());

        f.plc.set_word(30, 0, 0x0000);
        assert!(wait_for(|| faults.stats().active_faults == 0).await);

        let history = faults.history(&HistoryFilter::default()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].history.acknowledgement.as_ref().map(|a| a.by), Some(3));

        // acknowledging an inactive fault is rejected and leaves history alone
        assert!(matches!(
            faults.acknowledge_fault(fault_id, 3, "operator"),
            Err(FaultError::NotActive(_))
        ));
        assert_eq!(faults.history(&HistoryFilter::default()).unwrap().len(), 1);

        faults.shutdown().await;
        f.session.disconnect().await;
    }

    #[tokio::test]
    async fn test_reload_does_not_duplicate_monitors() {
        let f = fixture(&[(30, 0, 0), (30, 2, 0), (31, 0, 0)]).await;
        let faults = FaultManager::new(f.store.clone(), f.events.clone(), fast_config());
        faults.initialize().await.unwrap();

        faults.start_monitoring(f.session.clone()).await;
        assert!(wait_for(|| faults.stats().monitor_tasks == 2).await);

        for _ in 0..3 {
            faults.reload_definitions().await.unwrap();
            faults.start_monitoring(f.session.clone()).await;
        }
        assert!(wait_for(|| faults.stats().monitor_tasks == 2).await);
        assert_eq!(faults.stats().word_monitors, 3);

        faults.stop_monitoring(f.controller_id).await;
        assert!(wait_for(|| faults.stats().monitor_tasks == 0).await);
        faults.shutdown().await;
    }

    #[tokio::test]
    async fn test_cleared_while_down_is_reconciled() {
        let f = fixture(&[(30, 0, 1)]).await;
        let def = f.store.list_definitions(&DefinitionFilter::default()).unwrap().remove(0);
        // persisted as active, but the bit is clear on the controller
        f.store
            .commit_fault_transitions(&[FaultTransition::Activated {
                fault_id: def.id,
                at: Utc::now(),
            }])
            .unwrap();

        let faults = FaultManager::new(f.store.clone(), f.events.clone(), fast_config());
        faults.initialize().await.unwrap();
        assert_eq!(faults.stats().active_faults, 1);

        faults.start_monitoring(f.session.clone()).await;
        assert!(wait_for(|| faults.stats().active_faults == 0).await);
        assert_eq!(faults.history(&HistoryFilter::default()).unwrap().len(), 1);
        faults.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreadable_word_does_not_block_neighbours() {
        let f = fixture(&[(30, 0, 0), (30, 2, 0)]).await;
        let faults = FaultManager::new(f.store.clone(), f.events.clone(), fast_config());
        faults.initialize().await.unwrap();
        f.plc.fail_reads_at(30, 0);
        faults.start_monitoring(f.session.clone()).await;

        f.plc.set_word(30, 2, 1);
        assert!(wait_for(|| faults.stats().active_faults == 1).await);
        assert_eq!(faults.active_faults().unwrap()[0].byte_offset, 2);
        faults.shutdown().await;
    }

    #[tokio::test]
    async fn test_retired_session_gets_no_monitors() {
        let f = fixture(&[(30, 0, 0), (31, 0, 0)]).await;
        let faults = FaultManager::new(f.store.clone(), f.events.clone(), fast_config());
        faults.initialize().await.unwrap();

        faults.start_monitoring(f.session.clone()).await;
        assert!(wait_for(|| faults.stats().monitor_tasks == 2).await);

        // retiring alone ends the running groups
        f.session.retire();
        assert!(wait_for(|| faults.stats().monitor_tasks == 0).await);

        // a restart arriving after the controller was dropped spawns nothing
        faults.reload_definitions().await.unwrap();
        faults.start_monitoring(f.session.clone()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(faults.stats().monitor_tasks, 0);
        faults.shutdown().await;
    }

    #[tokio::test]
    async fn test_saturated_channel_counts_drops() {
        let f = fixture(&[(30, 0, 0), (30, 2, 0), (30, 4, 0)]).await;
        let config = PlcConfig {
            change_capacity: 1,
            ..fast_config()
        };
        // never initialized: nothing drains the channel
        let faults = FaultManager::new(f.store.clone(), f.events.clone(), config);
        faults.load_registry().unwrap();
        faults.start_monitoring(f.session.clone()).await;

        f.plc.set_word(30, 0, 1);
        f.plc.set_word(30, 2, 1);
        f.plc.set_word(30, 4, 1);
        assert!(wait_for(|| faults.stats().dropped_changes >= 2).await);

        // monitors keep polling while the queue is full
        let reads = f.plc.read_count();
        assert!(wait_for(|| f.plc.read_count() > reads + 3).await);

        faults.stop_monitoring(f.controller_id).await;
        assert!(f.plc.is_connected());
    }
}

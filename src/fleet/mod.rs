//! Fleet manager: live device sessions, their connect loops and tag pollers.

mod poller;
mod session;

pub use poller::*;
pub use session::*;

use crate::config::PlcConfig;
use crate::db::{Controller, DbError, Store, Tag};
use crate::events::EventBus;
use crate::faults::{FaultError, FaultManager};
use crate::protocol::{ProtocolError, TransportFactory, Value};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

/// Fleet error types.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("controller {0} is not connected")]
    NotConnected(i64),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("fault error: {0}")]
    Fault(#[from] FaultError),
}

struct TagSlot {
    state: Arc<TagState>,
    stop: Option<broadcast::Sender<()>>,
}

/// A running controller: its session, tags and connect loop.
struct ControllerEntry {
    session: Arc<DeviceSession>,
    tags: Mutex<HashMap<i64, TagSlot>>,
    stop_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ControllerEntry {
    fn start_pollers(&self, shared: &Shared) {
        let mut tags = self.tags.lock();
        for slot in tags.values_mut() {
            start_poller(slot, &self.session, shared);
        }
    }

    fn stop_pollers(&self) {
        let mut tags = self.tags.lock();
        for slot in tags.values_mut() {
            if let Some(stop) = slot.stop.take() {
                let _ = stop.send(());
            }
        }
    }

    fn tag(&self, tag_id: i64) -> Option<Arc<TagState>> {
        self.tags.lock().get(&tag_id).map(|s| s.state.clone())
    }

    fn running_pollers(&self) -> usize {
        self.tags.lock().values().filter(|s| s.stop.is_some()).count()
    }
}

fn start_poller(slot: &mut TagSlot, session: &Arc<DeviceSession>, shared: &Shared) {
    if slot.stop.is_some() || !slot.state.tag.enabled {
        return;
    }

    let period = match slot.state.tag.interval_ms {
        0 => shared.config.default_tag_interval,
        ms => Duration::from_millis(ms as u64),
    };
    let (stop_tx, _) = broadcast::channel(1);
    tokio::spawn(run_tag_poller(
        slot.state.clone(),
        session.clone(),
        shared.events.clone(),
        period,
        stop_tx.subscribe(),
    ));
    slot.stop = Some(stop_tx);
}

/// Handles the connect loops need.
#[derive(Clone)]
struct Shared {
    config: PlcConfig,
    events: Arc<EventBus>,
    faults: Arc<FaultManager>,
}

/// One controller with its tags, as seen by clients.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    #[serde(flatten)]
    pub session: SessionSnapshot,
    pub tags: Vec<TagSnapshot>,
}

/// Owns every live controller.
pub struct FleetManager {
    store: Arc<Store>,
    factory: Arc<dyn TransportFactory>,
    shared: Shared,
    controllers: RwLock<HashMap<i64, Arc<ControllerEntry>>>,
}

impl FleetManager {
    pub fn new(
        store: Arc<Store>,
        config: PlcConfig,
        factory: Arc<dyn TransportFactory>,
        events: Arc<EventBus>,
        faults: Arc<FaultManager>,
    ) -> Self {
        Self {
            store,
            factory,
            shared: Shared {
                config,
                events,
                faults,
            },
            controllers: RwLock::new(HashMap::new()),
        }
    }

    /// Start every enabled controller in the store.
    pub async fn start(&self) -> Result<(), FleetError> {
        let controllers = self.store.list_controllers()?;
        tracing::info!("Starting fleet with {} controllers", controllers.len());

        for controller in controllers {
            self.add_controller(controller).await?;
        }
        Ok(())
    }

    /// Start a controller's connect loop. Disabled or already running
    /// controllers are left alone.
    pub async fn add_controller(&self, controller: Controller) -> Result<(), FleetError> {
        if !controller.enabled {
            return Ok(());
        }
        if self.controllers.read().await.contains_key(&controller.id) {
            return Ok(());
        }

        let tags = self.store.list_tags(controller.id)?;
        let transport = self.factory.create(&controller);
        let controller_id = controller.id;
        let name = controller.name.clone();
        let session = Arc::new(DeviceSession::new(
            controller,
            transport,
            self.shared.config.connect_timeout,
            self.shared.events.clone(),
        ));
        let tags = tags
            .into_iter()
            .map(|t| {
                let slot = TagSlot {
                    state: Arc::new(TagState::new(t)),
                    stop: None,
                };
                (slot.state.tag.id, slot)
            })
            .collect();
        let (stop_tx, _) = broadcast::channel(1);
        let entry = Arc::new(ControllerEntry {
            session,
            tags: Mutex::new(tags),
            stop_tx,
            task: Mutex::new(None),
        });

        let mut controllers = self.controllers.write().await;
        if controllers.contains_key(&controller_id) {
            return Ok(());
        }
        controllers.insert(controller_id, entry.clone());
        drop(controllers);

        tracing::info!("Fleet: Adding controller {}", name);

        let stop_rx = entry.stop_tx.subscribe();
        let handle = tokio::spawn(run_connect_loop(entry.clone(), self.shared.clone(), stop_rx));
        *entry.task.lock() = Some(handle);
        Ok(())
    }

    /// Stop a controller and wait until it is disconnected.
    pub async fn remove_controller(&self, controller_id: i64) -> bool {
        let Some(entry) = self.controllers.write().await.remove(&controller_id) else {
            return false;
        };

        entry.session.retire();
        let _ = entry.stop_tx.send(());
        let handle = entry.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Connect loop for controller {} failed: {}", controller_id, e);
            }
        }
        tracing::info!("Fleet: Removed controller {}", controller_id);
        true
    }

    /// Remove and re-add a controller from its stored row.
    pub async fn restart_controller(&self, controller_id: i64) -> Result<(), FleetError> {
        self.remove_controller(controller_id).await;
        let controller = self.store.get_controller(controller_id)?;
        self.add_controller(controller).await
    }

    /// Bring the live state in line with an updated controller row.
    pub async fn apply_controller_update(&self, old: &Controller, new: Controller) -> Result<(), FleetError> {
        if !new.enabled {
            self.remove_controller(new.id).await;
            return Ok(());
        }

        let entry = self.controllers.read().await.get(&new.id).cloned();
        let Some(entry) = entry else {
            return self.add_controller(new).await;
        };

        if old.link_differs(&new) {
            return self.restart_controller(new.id).await;
        }

        entry.session.rename(&new.name);
        self.shared.faults.rename_controller(new.id, &new.name);
        self.reconcile_tags(new.id).await
    }

    pub async fn is_running(&self, controller_id: i64) -> bool {
        self.controllers.read().await.contains_key(&controller_id)
    }

    pub async fn session(&self, controller_id: i64) -> Option<Arc<DeviceSession>> {
        self.controllers
            .read()
            .await
            .get(&controller_id)
            .map(|e| e.session.clone())
    }

    async fn entry(&self, controller_id: i64) -> Result<Arc<ControllerEntry>, FleetError> {
        self.controllers
            .read()
            .await
            .get(&controller_id)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(format!("controller {}", controller_id)))
    }

    /// Start tracking a tag; polling begins at once on a connected controller.
    pub async fn add_tag(&self, tag: Tag) {
        let Ok(entry) = self.entry(tag.controller_id).await else {
            return;
        };

        let mut tags = entry.tags.lock();
        if tags.contains_key(&tag.id) {
            return;
        }
        let tag_id = tag.id;
        let mut slot = TagSlot {
            state: Arc::new(TagState::new(tag)),
            stop: None,
        };
        if entry.session.is_connected() {
            start_poller(&mut slot, &entry.session, &self.shared);
        }
        tags.insert(tag_id, slot);
    }

    pub async fn remove_tag(&self, controller_id: i64, tag_id: i64) {
        let Ok(entry) = self.entry(controller_id).await else {
            return;
        };
        let slot = entry.tags.lock().remove(&tag_id);
        if let Some(stop) = slot.and_then(|s| s.stop) {
            let _ = stop.send(());
        }
    }

    pub async fn update_tag(&self, tag: Tag) {
        self.remove_tag(tag.controller_id, tag.id).await;
        self.add_tag(tag).await;
    }

    /// Diff the live tag set of a controller against the store, restarting
    /// only the tags that changed.
    pub async fn reconcile_tags(&self, controller_id: i64) -> Result<(), FleetError> {
        let entry = self.entry(controller_id).await?;
        let stored = self.store.list_tags(controller_id)?;

        let live: HashMap<i64, Tag> = entry
            .tags
            .lock()
            .values()
            .map(|s| (s.state.tag.id, s.state.tag.clone()))
            .collect();

        for id in live.keys() {
            if !stored.iter().any(|t| t.id == *id) {
                self.remove_tag(controller_id, *id).await;
            }
        }
        for tag in stored {
            match live.get(&tag.id) {
                Some(current) if *current == tag => {}
                Some(_) => self.update_tag(tag).await,
                None => self.add_tag(tag).await,
            }
        }
        Ok(())
    }

    /// Read a tag's current value from the controller.
    pub async fn read_tag(&self, controller_id: i64, tag_id: i64) -> Result<TagSnapshot, FleetError> {
        let entry = self.entry(controller_id).await?;
        let state = entry
            .tag(tag_id)
            .ok_or_else(|| FleetError::NotFound(format!("tag {}", tag_id)))?;
        if !entry.session.is_connected() {
            return Err(FleetError::NotConnected(controller_id));
        }

        match entry.session.read(state.tag.address(), state.tag.tag_type).await {
            Ok(value) => {
                state.record_value(&value, Utc::now());
                Ok(state.snapshot())
            }
            Err(e) => {
                state.record_error(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Convert a client value to the tag's type and write it.
    pub async fn write_tag(
        &self,
        controller_id: i64,
        tag_id: i64,
        value: &serde_json::Value,
    ) -> Result<Value, FleetError> {
        let entry = self.entry(controller_id).await?;
        let state = entry
            .tag(tag_id)
            .ok_or_else(|| FleetError::NotFound(format!("tag {}", tag_id)))?;
        if !entry.session.is_connected() {
            return Err(FleetError::NotConnected(controller_id));
        }

        let tag = &state.tag;
        let value = Value::from_json(tag.tag_type, value)?;
        entry
            .session
            .write(tag.address(), tag.tag_type, tag.length as usize, &value)
            .await?;

        let now = Utc::now();
        if state.record_value(&value, now) {
            self.shared
                .events
                .publish(state.value_event(entry.session.controller_name(), value.clone(), now));
        }
        tracing::info!(
            "Wrote {} to tag {} on {}",
            value,
            tag.name,
            entry.session.controller_name()
        );
        Ok(value)
    }

    /// Every running controller with its tags, ordered by id.
    pub async fn snapshot(&self) -> Vec<ControllerSnapshot> {
        let entries: Vec<Arc<ControllerEntry>> = self.controllers.read().await.values().cloned().collect();
        let mut out: Vec<ControllerSnapshot> = entries
            .iter()
            .map(|e| {
                let mut tags: Vec<TagSnapshot> = e.tags.lock().values().map(|s| s.state.snapshot()).collect();
                tags.sort_by_key(|t| t.tag.id);
                ControllerSnapshot {
                    session: e.session.snapshot(),
                    tags,
                }
            })
            .collect();
        out.sort_by_key(|c| c.session.controller_id);
        out
    }

    pub async fn running_pollers(&self, controller_id: i64) -> usize {
        match self.controllers.read().await.get(&controller_id) {
            Some(entry) => entry.running_pollers(),
            None => 0,
        }
    }

    /// Rebuild the fault word map and restart monitoring on connected controllers.
    pub async fn reload_fault_monitoring(&self) -> Result<(), FleetError> {
        self.shared.faults.reload_definitions().await?;

        let sessions: Vec<Arc<DeviceSession>> = self
            .controllers
            .read()
            .await
            .values()
            .map(|e| e.session.clone())
            .collect();
        for session in sessions.into_iter().filter(|s| s.is_connected() && !s.is_retired()) {
            self.shared.faults.start_monitoring(session).await;
        }
        Ok(())
    }

    /// Stop every controller.
    pub async fn shutdown(&self) {
        let ids: Vec<i64> = self.controllers.read().await.keys().copied().collect();
        for id in ids {
            self.remove_controller(id).await;
        }
    }
}

/// Connect, run until the watchdog sees the link die, tear down, repeat.
async fn run_connect_loop(entry: Arc<ControllerEntry>, shared: Shared, mut stop_rx: broadcast::Receiver<()>) {
    let session = entry.session.clone();
    let controller_id = session.controller_id();

    loop {
        if let Err(e) = session.connect().await {
            tracing::warn!(
                "Controller {} connect failed: {}, retrying in {:?}",
                session.controller_name(),
                e,
                shared.config.retry_delay
            );
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = tokio::time::sleep(shared.config.retry_delay) => continue,
            }
        }

        tracing::info!("Controller {} connected", session.controller_name());
        entry.start_pollers(&shared);
        shared.faults.start_monitoring(session.clone()).await;

        let period = shared.config.check_period;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let lost = loop {
            tokio::select! {
                _ = stop_rx.recv() => break None,
                _ = interval.tick() => {
                    if let Err(e) = session.probe().await {
                        break Some(e);
                    }
                }
            }
        };

        entry.stop_pollers();
        shared.faults.stop_monitoring(controller_id).await;

        let Some(e) = lost else {
            break;
        };
        tracing::warn!("Controller {} link lost: {}", session.controller_name(), e);
        session.mark_lost(&e.to_string());
        session.disconnect().await;
    }

    entry.stop_pollers();
    session.disconnect().await;
    tracing::info!("Connect loop for controller {} stopped", controller_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{FaultDefinition, HistoryFilter};
    use crate::events::Event;
    use crate::protocol::{DefaultTransportFactory, MemoryTransport, TagType, Transport};
    use tempfile::NamedTempFile;

    struct Fixture {
        _tmp: NamedTempFile,
        store: Arc<Store>,
        events: Arc<EventBus>,
        factory: Arc<DefaultTransportFactory>,
        faults: Arc<FaultManager>,
        fleet: FleetManager,
    }

    fn fast_config() -> PlcConfig {
        PlcConfig {
            connect_timeout: Duration::from_millis(200),
            retry_delay: Duration::from_millis(20),
            check_period: Duration::from_millis(20),
            monitor_interval: Duration::from_millis(10),
            batch_period: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn fixture() -> Fixture {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let config = fast_config();
        let events = Arc::new(EventBus::new(1024));
        let factory = Arc::new(DefaultTransportFactory::new(config.clone()));
        let faults = Arc::new(FaultManager::new(store.clone(), events.clone(), config.clone()));
        faults.initialize().await.unwrap();
        let fleet = FleetManager::new(store.clone(), config, factory.clone(), events.clone(), faults.clone());
        Fixture {
            _tmp: tmp,
            store,
            events,
            factory,
            faults,
            fleet,
        }
    }

    fn controller(store: &Store, name: &str) -> Controller {
        let mut c = Controller {
            name: name.to_string(),
            address: format!("sim://{}", name),
            ..Default::default()
        };
        store.create_controller(&mut c).unwrap();
        c
    }

    fn tag(store: &Store, controller_id: i64, name: &str, db: u16, byte: u32, ty: TagType) -> Tag {
        let mut t = Tag {
            controller_id,
            name: name.to_string(),
            db_number: db,
            byte_offset: byte,
            tag_type: ty,
            interval_ms: 10,
            ..Default::default()
        };
        store.create_tag(&mut t).unwrap();
        t
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
    async fn test_polls_tags_and_stops_on_remove() {
        let f = fixture().await;
        let c = controller(&f.store, "lock-a");
        let level = tag(&f.store, c.id, "level", 1, 0, TagType::Word);
        let plc = f.factory.simulated("lock-a");
        plc.set_word(1, 0, 77);

        let topic = format!("plc.tags.updates.{}.{}", c.id, level.id);
        let mut values = f.events.subscribe(&[topic.as_str()]);
        f.fleet.start().await.unwrap();

        let event = values.recv().await.unwrap();
        assert!(matches!(event.as_ref(), Event::TagValue(v) if v.value == Value::Word(77)));
        assert_eq!(f.fleet.running_pollers(c.id).await, 1);

        assert!(f.fleet.remove_controller(c.id).await);
        assert!(!plc.is_connected());
        let reads = plc.read_count();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(plc.read_count(), reads);
        assert!(!f.fleet.remove_controller(c.id).await);
    }

    #[tokio::test]
    async fn test_watchdog_reconnects() {
        let f = fixture().await;
        let c = controller(&f.store, "lock-b");
        tag(&f.store, c.id, "level", 1, 0, TagType::Word);
        let plc: Arc<MemoryTransport> = f.factory.simulated("lock-b");
        f.fleet.add_controller(c.clone()).await.unwrap();

        let session = f.fleet.session(c.id).await.unwrap();
        assert!(wait_for(|| session.is_connected()).await);

        let mut status = f.events.subscribe(&["plc.status"]);
        plc.set_reachable(false);
        let event = status.recv().await.unwrap();
        assert!(matches!(event.as_ref(), Event::ControllerStatus(s) if !s.connected));
        assert!(wait_for(|| !session.is_connected()).await);
        assert_eq!(f.fleet.running_pollers(c.id).await, 0);

        plc.set_reachable(true);
        assert!(wait_for(|| session.is_connected()).await);
        for _ in 0..100 {
            if f.fleet.running_pollers(c.id).await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.fleet.running_pollers(c.id).await, 1);

        f.fleet.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_and_write_tag() {
        let f = fixture().await;
        let c = controller(&f.store, "lock-c");
        let mut valve = Tag {
            controller_id: c.id,
            name: "valve".to_string(),
            db_number: 2,
            byte_offset: 6,
            bit_offset: Some(3),
            tag_type: TagType::Bool,
            interval_ms: 1000,
            ..Default::default()
        };
        f.store.create_tag(&mut valve).unwrap();
        let speed = tag(&f.store, c.id, "speed", 2, 8, TagType::Int);
        let plc = f.factory.simulated("lock-c");
        plc.set_bytes(2, 6, &[0x81]);

        f.fleet.add_controller(c.clone()).await.unwrap();
        let session = f.fleet.session(c.id).await.unwrap();
        assert!(wait_for(|| session.is_connected()).await);

        let written = f
            .fleet
            .write_tag(c.id, valve.id, &serde_json::json!(true))
            .await
            .unwrap();
        assert_eq!(written, Value::Bool(true));
        assert_eq!(plc.bytes(2, 6, 1), vec![0x89]);

        f.fleet.write_tag(c.id, speed.id, &serde_json::json!(-300)).await.unwrap();
        let snap = f.fleet.read_tag(c.id, speed.id).await.unwrap();
        assert_eq!(snap.value, Some(Value::Int(-300)));

        let err = f.fleet.write_tag(c.id, speed.id, &serde_json::json!(40000)).await;
        assert!(matches!(err, Err(FleetError::Protocol(ProtocolError::InvalidValue(_)))));
        assert!(matches!(
            f.fleet.read_tag(c.id, 999).await,
            Err(FleetError::NotFound(_))
        ));

        f.fleet.shutdown().await;
    }

    #[tokio::test]
    async fn test_tag_changes_reconcile() {
        let f = fixture().await;
        let c = controller(&f.store, "lock-d");
        let mut a = tag(&f.store, c.id, "a", 1, 0, TagType::Word);
        let b = tag(&f.store, c.id, "b", 1, 2, TagType::Word);
        f.fleet.add_controller(c.clone()).await.unwrap();
        let session = f.fleet.session(c.id).await.unwrap();
        assert!(wait_for(|| session.is_connected()).await);

        a.interval_ms = 20;
        f.store.update_tag(&a).unwrap();
        f.store.delete_tag(b.id).unwrap();
        let extra = tag(&f.store, c.id, "extra", 1, 4, TagType::Word);
        f.fleet.reconcile_tags(c.id).await.unwrap();

        let snap = f.fleet.snapshot().await;
        let ids: Vec<i64> = snap[0].tags.iter().map(|t| t.tag.id).collect();
        assert_eq!(ids, vec![a.id, extra.id]);
        assert_eq!(snap[0].tags[0].tag.interval_ms, 20);
        assert_eq!(f.fleet.running_pollers(c.id).await, 2);

        // renaming keeps the session
        let mut renamed = c.clone();
        renamed.name = "lock-d2".to_string();
        f.fleet.apply_controller_update(&c, renamed.clone()).await.unwrap();
        let same = f.fleet.session(c.id).await.unwrap();
        assert!(Arc::ptr_eq(&session, &same));
        assert_eq!(same.controller_name(), "lock-d2");

        // disabling removes it
        let mut disabled = renamed.clone();
        disabled.enabled = false;
        f.fleet.apply_controller_update(&renamed, disabled).await.unwrap();
        assert!(!f.fleet.is_running(c.id).await);
    }

    #[tokio::test]
    async fn test_connect_starts_fault_monitoring() {
        let f = fixture().await;
        let c = controller(&f.store, "lock-e");
        let mut def = FaultDefinition {
            controller_id: c.id,
            word_name: "DB40.DBW0".to_string(),
            db_number: 40,
            byte_offset: 0,
            bit_offset: 4,
            description: "gate jammed".to_string(),
            ..Default::default()
        };
        f.store.create_definition(&mut def).unwrap();
        f.fleet.reload_fault_monitoring().await.unwrap();

        let plc = f.factory.simulated("lock-e");
        f.fleet.add_controller(c.clone()).await.unwrap();
        assert!(wait_for(|| f.faults.stats().monitor_tasks == 1).await);

        plc.set_word(40, 0, 0x0010);
        assert!(wait_for(|| f.faults.stats().active_faults == 1).await);

        f.fleet.remove_controller(c.id).await;
        assert!(wait_for(|| f.faults.stats().monitor_tasks == 0).await);

        let history = f.faults.history(&HistoryFilter::default()).unwrap();
        assert!(history.is_empty());
    }
}

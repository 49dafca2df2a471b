//! Word monitors and the per-data-block polling task.

use super::ActiveCache;
use crate::db::FaultDefinition;
use crate::fleet::DeviceSession;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

/// Identifies one monitored 16-bit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WordKey {
    pub controller_id: i64,
    pub db: u16,
    pub byte: u32,
}

impl From<&FaultDefinition> for WordKey {
    fn from(def: &FaultDefinition) -> Self {
        Self {
            controller_id: def.controller_id,
            db: def.db_number,
            byte: def.byte_offset,
        }
    }
}

/// A raw word change observed by a monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct WordChange {
    pub key: WordKey,
    pub old: u16,
    pub new: u16,
    pub at: DateTime<Utc>,
}

/// The enabled definitions of one word and its last observed value.
pub struct WordMonitor {
    pub key: WordKey,
    pub word_name: String,
    bits: BTreeMap<u8, Arc<FaultDefinition>>,
    last_value: Mutex<Option<u16>>,
}

impl WordMonitor {
    fn new(key: WordKey, word_name: String) -> Self {
        Self {
            key,
            word_name,
            bits: BTreeMap::new(),
            last_value: Mutex::new(None),
        }
    }

    /// Definitions in ascending bit order.
    pub fn definitions(&self) -> impl Iterator<Item = (u8, &Arc<FaultDefinition>)> {
        self.bits.iter().map(|(bit, def)| (*bit, def))
    }

    pub fn last_value(&self) -> Option<u16> {
        *self.last_value.lock()
    }

    /// Forget the last value so the next read is compared against the
    /// committed fault state instead.
    pub fn invalidate(&self) {
        *self.last_value.lock() = None;
    }

    /// Record `value`; returns the previous value when it differs.
    ///
    /// With no previous value, `seed` supplies one.
    fn observe(&self, value: u16, seed: impl FnOnce() -> u16) -> Option<u16> {
        let mut last = self.last_value.lock();
        let old = last.unwrap_or_else(seed);
        *last = Some(value);
        (old != value).then_some(old)
    }

    /// Roll back an observation whose change could not be queued.
    fn restore(&self, observed: u16, old: u16) {
        let mut last = self.last_value.lock();
        if *last == Some(observed) {
            *last = Some(old);
        }
    }
}

/// All word monitors, rebuilt whenever definitions are reloaded.
#[derive(Default)]
pub struct WordRegistry {
    monitors: RwLock<HashMap<WordKey, Arc<WordMonitor>>>,
    definitions: RwLock<HashMap<i64, Arc<FaultDefinition>>>,
    controller_names: RwLock<HashMap<i64, String>>,
}

impl WordRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every monitor with ones built from the enabled `defs`.
    pub fn rebuild(&self, defs: Vec<FaultDefinition>, controller_names: HashMap<i64, String>) {
        let mut monitors: HashMap<WordKey, WordMonitor> = HashMap::new();
        let mut by_id = HashMap::new();

        for def in defs.into_iter().filter(|d| d.enabled && d.bit_offset < 16) {
            let def = Arc::new(def);
            let key = WordKey::from(def.as_ref());
            monitors
                .entry(key)
                .or_insert_with(|| WordMonitor::new(key, def.word_name.clone()))
                .bits
                .insert(def.bit_offset, def.clone());
            by_id.insert(def.id, def);
        }

        let monitors = monitors
            .into_iter()
            .map(|(k, m)| (k, Arc::new(m)))
            .collect();
        *self.monitors.write() = monitors;
        *self.definitions.write() = by_id;
        *self.controller_names.write() = controller_names;
    }

    pub fn get(&self, key: &WordKey) -> Option<Arc<WordMonitor>> {
        self.monitors.read().get(key).cloned()
    }

    pub fn definition(&self, fault_id: i64) -> Option<Arc<FaultDefinition>> {
        self.definitions.read().get(&fault_id).cloned()
    }

    pub fn controller_name(&self, controller_id: i64) -> String {
        self.controller_names
            .read()
            .get(&controller_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_controller_name(&self, controller_id: i64, name: &str) {
        self.controller_names
            .write()
            .insert(controller_id, name.to_string());
    }

    /// Monitors of one controller grouped by data block, words in ascending
    /// byte order.
    pub fn groups_for(&self, controller_id: i64) -> BTreeMap<u16, Vec<Arc<WordMonitor>>> {
        let mut groups: BTreeMap<u16, Vec<Arc<WordMonitor>>> = BTreeMap::new();
        for monitor in self.monitors.read().values() {
            if monitor.key.controller_id == controller_id {
                groups.entry(monitor.key.db).or_default().push(monitor.clone());
            }
        }
        for words in groups.values_mut() {
            words.sort_by_key(|m| m.key.byte);
        }
        groups
    }

    pub fn len(&self) -> usize {
        self.monitors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counts live monitor tasks; decremented when the guard drops.
pub(crate) struct TaskGuard(Arc<AtomicUsize>);

impl TaskGuard {
    pub(crate) fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct MonitorGroup {
    pub db: u16,
    pub words: Vec<Arc<WordMonitor>>,
    pub session: Arc<DeviceSession>,
    pub cache: Arc<ActiveCache>,
    pub tx: mpsc::Sender<WordChange>,
    pub dropped: Arc<AtomicU64>,
    pub period: Duration,
}

/// Read every word of one data block each period and queue the changes.
///
/// Exits on its own stop signal or once the session is retired.
pub(crate) async fn run_db_monitor(
    group: MonitorGroup,
    mut stop_rx: broadcast::Receiver<()>,
    mut retired: watch::Receiver<bool>,
    _guard: TaskGuard,
) {
    let mut interval = tokio::time::interval(group.period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        if *retired.borrow_and_update() {
            break;
        }
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            changed = retired.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = interval.tick() => {
                if !group.session.is_connected() {
                    continue;
                }
                if !scan(&group).await {
                    break;
                }
            }
        }
    }

    tracing::debug!(
        "Fault monitor for controller {} DB{} stopped",
        group.session.controller_id(),
        group.db
    );
}

/// One pass over the group's words; false once the change channel is closed.
async fn scan(group: &MonitorGroup) -> bool {
    for word in &group.words {
        let value = match group.session.read_word(group.db, word.key.byte).await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(
                    "Fault word {} (DB{}.DBW{}) read failed: {}",
                    word.word_name,
                    group.db,
                    word.key.byte,
                    e
                );
                continue;
            }
        };

        let Some(old) = word.observe(value, || group.cache.seed(word)) else {
            continue;
        };

        let change = WordChange {
            key: word.key,
            old,
            new: value,
            at: Utc::now(),
        };
        match group.tx.try_send(change) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                word.restore(value, old);
                let total = group.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    "Fault change queue full, dropped change on {} ({} dropped so far)",
                    word.word_name,
                    total
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
        }
    }
    true
}

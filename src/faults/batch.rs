//! Coalesces raw word changes into committed fault transitions.

use super::{ActiveCache, WordChange, WordRegistry};
use crate::db::{DbError, FaultTransition, Store};
use crate::events::{Event, EventBus, FaultUpdate};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Persistence seam for fault transitions.
pub trait FaultLedger: Send + Sync {
    /// All of `transitions` or none.
    fn commit(&self, transitions: &[FaultTransition]) -> Result<(), DbError>;
}

impl FaultLedger for Store {
    fn commit(&self, transitions: &[FaultTransition]) -> Result<(), DbError> {
        self.commit_fault_transitions(transitions)
    }
}

/// The single consumer of the raw change channel.
pub struct BatchProcessor {
    ledger: Arc<dyn FaultLedger>,
    registry: Arc<WordRegistry>,
    cache: Arc<ActiveCache>,
    events: Arc<EventBus>,
    max_size: usize,
    period: Duration,
    buffered: Arc<AtomicUsize>,
}

impl BatchProcessor {
    pub fn new(
        ledger: Arc<dyn FaultLedger>,
        registry: Arc<WordRegistry>,
        cache: Arc<ActiveCache>,
        events: Arc<EventBus>,
        max_size: usize,
        period: Duration,
    ) -> Self {
        Self {
            ledger,
            registry,
            cache,
            events,
            max_size: max_size.max(1),
            period,
            buffered: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of changes waiting for the next flush.
    pub fn buffered(&self) -> Arc<AtomicUsize> {
        self.buffered.clone()
    }

    /// Flush when `max_size` changes are buffered or every `period`.
    pub async fn run(self, mut rx: mpsc::Receiver<WordChange>, mut stop_rx: broadcast::Receiver<()>) {
        let mut buffer: Vec<WordChange> = Vec::with_capacity(self.max_size);
        let mut interval = tokio::time::interval(self.period);

        loop {
            tokio::select! {
                change = rx.recv() => {
                    match change {
                        Some(c) => {
                            buffer.push(c);
                            self.buffered.store(buffer.len(), Ordering::Relaxed);
                            if buffer.len() >= self.max_size {
                                self.flush(&mut buffer);
                            }
                        }
                        None => {
                            self.flush(&mut buffer);
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    self.flush(&mut buffer);
                }
                _ = stop_rx.recv() => {
                    while let Ok(c) = rx.try_recv() {
                        buffer.push(c);
                    }
                    self.flush(&mut buffer);
                    break;
                }
            }
        }

        tracing::info!("Fault batch processor stopped");
    }

    fn flush(&self, buffer: &mut Vec<WordChange>) {
        if buffer.is_empty() {
            return;
        }

        if let Err(e) = self.process(buffer) {
            tracing::error!("Failed to commit {} fault changes: {}", buffer.len(), e);
        }

        buffer.clear();
        self.buffered.store(0, Ordering::Relaxed);
    }

    /// Turn a batch of word changes into transitions, commit them in one
    /// transaction, then update the cache and publish.
    ///
    /// Returns the number of committed transitions. On failure the cache is
    /// left as it was and the affected monitors re-read against it.
    pub fn process(&self, changes: &[WordChange]) -> Result<usize, DbError> {
        // fault id -> start time, as of the changes already staged in this batch
        let mut staged: HashMap<i64, Option<DateTime<Utc>>> = HashMap::new();
        let mut transitions = Vec::new();

        for change in changes {
            let Some(monitor) = self.registry.get(&change.key) else {
                continue;
            };

            for (bit, def) in monitor.definitions() {
                let was = (change.old >> bit) & 1 == 1;
                let now = (change.new >> bit) & 1 == 1;
                if was == now {
                    continue;
                }

                let started = staged
                    .get(&def.id)
                    .copied()
                    .unwrap_or_else(|| self.cache.started_at(def.id));

                match (now, started) {
                    (true, None) => {
                        transitions.push(FaultTransition::Activated {
                            fault_id: def.id,
                            at: change.at,
                        });
                        staged.insert(def.id, Some(change.at));
                    }
                    (false, Some(started_at)) => {
                        transitions.push(FaultTransition::Deactivated {
                            fault_id: def.id,
                            started_at,
                            ended_at: change.at,
                        });
                        staged.insert(def.id, None);
                    }
                    _ => {}
                }
            }
        }

        if transitions.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.ledger.commit(&transitions) {
            for change in changes {
                if let Some(monitor) = self.registry.get(&change.key) {
                    monitor.invalidate();
                }
            }
            return Err(e);
        }

        self.cache.apply(&transitions);
        for t in &transitions {
            self.publish(t);
        }
        tracing::debug!("Committed {} fault transitions", transitions.len());
        Ok(transitions.len())
    }

    fn publish(&self, transition: &FaultTransition) {
        let Some(def) = self.registry.definition(transition.fault_id()) else {
            return;
        };
        let (active, timestamp) = match transition {
            FaultTransition::Activated { at, .. } => (true, *at),
            FaultTransition::Deactivated { ended_at, .. } => (false, *ended_at),
        };

        if active {
            tracing::info!("Fault activated: {} bit {} ({})", def.word_name, def.bit_offset, def.description);
        } else {
            tracing::info!("Fault cleared: {} bit {} ({})", def.word_name, def.bit_offset, def.description);
        }

        self.events.publish(Event::FaultUpdate(FaultUpdate {
            fault_id: def.id,
            controller_id: def.controller_id,
            controller_name: self.registry.controller_name(def.controller_id),
            word_name: def.word_name.clone(),
            bit_offset: def.bit_offset,
            site: def.site.clone(),
            subsystem: def.subsystem.clone(),
            description: def.description.clone(),
            severity: def.severity,
            active,
            timestamp,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{FaultDefinition, Severity};
    use crate::faults::WordKey;
    use chrono::Duration as ChronoDuration;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingLedger {
        commits: Mutex<Vec<Vec<FaultTransition>>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl FaultLedger for RecordingLedger {
        fn commit(&self, transitions: &[FaultTransition]) -> Result<(), DbError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DbError::Migration("disk full".to_string()));
            }
            self.commits.lock().push(transitions.to_vec());
            Ok(())
        }
    }

    const KEY: WordKey = WordKey {
        controller_id: 1,
        db: 50,
        byte: 4,
    };

    fn setup() -> (Arc<RecordingLedger>, Arc<ActiveCache>, Arc<EventBus>, BatchProcessor) {
        let registry = Arc::new(WordRegistry::new());
        let defs = [(10, 0), (11, 9)]
            .into_iter()
            .map(|(id, bit)| FaultDefinition {
                id,
                controller_id: KEY.controller_id,
                word_name: "DB50.DBW4".to_string(),
                db_number: KEY.db,
                byte_offset: KEY.byte,
                bit_offset: bit,
                severity: Severity::Alarm,
                ..Default::default()
            })
            .collect();
        registry.rebuild(defs, HashMap::from([(1, "Lock 1".to_string())]));

        let ledger = Arc::new(RecordingLedger::default());
        let cache = Arc::new(ActiveCache::default());
        let events = Arc::new(EventBus::new(64));
        let processor = BatchProcessor::new(
            ledger.clone(),
            registry,
            cache.clone(),
            events.clone(),
            50,
            Duration::from_millis(200),
        );
        (ledger, cache, events, processor)
    }

    fn change(old: u16, new: u16, at: DateTime<Utc>) -> WordChange {
        WordChange { key: KEY, old, new, at }
    }

    #[test]
    fn test_rise_and_fall_in_separate_batches() {
        let (ledger, cache, events, processor) = setup();
        let mut sub = events.subscribe(&["faults.updates.1"]);
        let t0 = Utc::now();

        assert_eq!(processor.process(&[change(0x0000, 0x0001, t0)]).unwrap(), 1);
        assert!(cache.started_at(10).is_some());

        let t1 = t0 + ChronoDuration::seconds(12);
        assert_eq!(processor.process(&[change(0x0001, 0x0000, t1)]).unwrap(), 1);
        assert!(cache.started_at(10).is_none());

        let commits = ledger.commits.lock();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0], vec![FaultTransition::Activated { fault_id: 10, at: t0 }]);
        assert_eq!(
            commits[1],
            vec![FaultTransition::Deactivated {
                fault_id: 10,
                started_at: t0,
                ended_at: t1
            }]
        );

        let first = sub.try_recv().unwrap();
        assert!(matches!(first.as_ref(), Event::FaultUpdate(u) if u.active && u.controller_name == "Lock 1"));
        let second = sub.try_recv().unwrap();
        assert!(matches!(second.as_ref(), Event::FaultUpdate(u) if !u.active));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_rise_and_fall_within_one_batch() {
        let (ledger, cache, _events, processor) = setup();
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::seconds(1);

        let n = processor
            .process(&[change(0x0000, 0x0200, t0), change(0x0200, 0x0000, t1)])
            .unwrap();
        assert_eq!(n, 2);
        assert!(cache.started_at(11).is_none());

        let commits = ledger.commits.lock();
        assert_eq!(commits.len(), 1);
        assert!(matches!(commits[0][1], FaultTransition::Deactivated { fault_id: 11, started_at, .. } if started_at == t0));
    }

    #[test]
    fn test_no_duplicate_activation() {
        let (ledger, _cache, _events, processor) = setup();
        let t0 = Utc::now();

        processor.process(&[change(0x0000, 0x0001, t0)]).unwrap();
        // bit 0 reported rising again, e.g. after a monitor was reseeded
        let n = processor.process(&[change(0x0000, 0x0001, t0)]).unwrap();
        assert_eq!(n, 0);
        assert_eq!(ledger.commits.lock().len(), 1);
    }

    #[test]
    fn test_failed_commit_leaves_cache_untouched() {
        let (ledger, cache, events, processor) = setup();
        let mut sub = events.subscribe(&[">"]);
        ledger.fail.store(true, Ordering::SeqCst);

        assert!(processor.process(&[change(0x0000, 0x0001, Utc::now())]).is_err());
        assert!(cache.started_at(10).is_none());
        assert!(sub.try_recv().is_none());

        ledger.fail.store(false, Ordering::SeqCst);
        assert_eq!(processor.process(&[change(0x0000, 0x0001, Utc::now())]).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_flushes_on_size() {
        let (ledger, _cache, _events, processor) = setup();
        let processor = BatchProcessor {
            max_size: 2,
            period: Duration::from_secs(3600),
            ..processor
        };
        let (tx, rx) = mpsc::channel(16);
        let (stop_tx, _) = broadcast::channel(1);
        let handle = tokio::spawn(processor.run(rx, stop_tx.subscribe()));

        let t0 = Utc::now();
        tx.send(change(0x0000, 0x0001, t0)).await.unwrap();
        tx.send(change(0x0001, 0x0201, t0)).await.unwrap();

        for _ in 0..50 {
            if !ledger.commits.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ledger.commits.lock()[0].len(), 2);

        stop_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}

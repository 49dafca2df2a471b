//! Per-tag read loops.

use super::DeviceSession;
use crate::db::Tag;
use crate::events::{Event, EventBus, TagValue};
use crate::protocol::Value;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Default)]
struct TagRuntime {
    last_value: Option<Value>,
    last_read: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
}

/// A tag with its runtime fields.
pub struct TagState {
    pub tag: Tag,
    runtime: Mutex<TagRuntime>,
}

/// Tag row plus its latest runtime values.
#[derive(Debug, Clone, Serialize)]
pub struct TagSnapshot {
    #[serde(flatten)]
    pub tag: Tag,
    pub value: Option<Value>,
    pub last_read: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl TagState {
    pub fn new(tag: Tag) -> Self {
        Self {
            tag,
            runtime: Mutex::new(TagRuntime::default()),
        }
    }

    /// Store a successful read; returns whether it should be published.
    pub fn record_value(&self, value: &Value, at: DateTime<Utc>) -> bool {
        let mut rt = self.runtime.lock();
        if self.tag.only_on_change && rt.last_value.as_ref() == Some(value) {
            return false;
        }
        rt.last_value = Some(value.clone());
        rt.last_read = Some(at);
        true
    }

    pub fn record_error(&self, error: String) {
        let mut rt = self.runtime.lock();
        rt.last_error = Some(error);
        rt.last_error_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> TagSnapshot {
        let rt = self.runtime.lock().clone();
        TagSnapshot {
            tag: self.tag.clone(),
            value: rt.last_value,
            last_read: rt.last_read,
            last_error: rt.last_error,
            last_error_at: rt.last_error_at,
        }
    }

    pub fn value_event(&self, controller_name: String, value: Value, at: DateTime<Utc>) -> Event {
        Event::TagValue(TagValue {
            controller_id: self.tag.controller_id,
            controller_name,
            tag_id: self.tag.id,
            tag_name: self.tag.name.clone(),
            value,
            timestamp: at,
        })
    }
}

/// Read one tag every `period` until stopped.
pub async fn run_tag_poller(
    state: Arc<TagState>,
    session: Arc<DeviceSession>,
    events: Arc<EventBus>,
    period: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    // Spread the first reads of a controller's tags
    let jitter = Duration::from_millis(rand::random::<u64>() % 100);
    tokio::select! {
        _ = stop_rx.recv() => return,
        _ = tokio::time::sleep(jitter) => {}
    }

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                if !session.is_connected() {
                    continue;
                }

                let tag = &state.tag;
                match session.read(tag.address(), tag.tag_type).await {
                    Ok(value) => {
                        let now = Utc::now();
                        if state.record_value(&value, now) {
                            events.publish(state.value_event(session.controller_name(), value, now));
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Tag {} read failed: {}", tag.name, e);
                        state.record_error(e.to_string());
                    }
                }
            }
        }
    }

    tracing::debug!("Poller for tag {} stopped", state.tag.name);
}

//! One live connection to one controller.

use crate::db::Controller;
use crate::events::{ControllerStatus, Event, EventBus};
use crate::protocol::{self, Address, ProtocolError, TagType, Transport, Value};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Runtime {
    state: SessionState,
    last_error: Option<String>,
    last_read: Option<DateTime<Utc>>,
}

/// Consistent view of a session's runtime state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub controller_id: i64,
    pub name: String,
    pub address: String,
    pub state: SessionState,
    pub connected: bool,
    pub last_error: Option<String>,
    pub last_read: Option<DateTime<Utc>>,
}

/// Owns the transport of one controller and tracks its connection state.
///
/// Status changes are published on the event bus. Runtime fields are only
/// locked for the moment they are read or written, never across I/O.
pub struct DeviceSession {
    controller: RwLock<Controller>,
    transport: Arc<dyn Transport>,
    runtime: RwLock<Runtime>,
    connect_timeout: Duration,
    events: Arc<EventBus>,
    retired: watch::Sender<bool>,
}

impl DeviceSession {
    pub fn new(
        controller: Controller,
        transport: Arc<dyn Transport>,
        connect_timeout: Duration,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            controller: RwLock::new(controller),
            transport,
            runtime: RwLock::new(Runtime {
                state: SessionState::Disconnected,
                last_error: None,
                last_read: None,
            }),
            connect_timeout,
            events,
            retired: watch::channel(false).0,
        }
    }

    pub fn controller_id(&self) -> i64 {
        self.controller.read().id
    }

    pub fn controller_name(&self) -> String {
        self.controller.read().name.clone()
    }

    /// Update the descriptive fields; link fields need a new session.
    pub fn rename(&self, name: &str) {
        self.controller.write().name = name.to_string();
    }

    pub fn state(&self) -> SessionState {
        self.runtime.read().state
    }

    /// Connected as far as both the session and its transport know.
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected && self.transport.is_connected()
    }

    /// Mark the session as discarded by its controller. Permanent; tasks
    /// holding a [`retirement`](Self::retirement) receiver see it even if
    /// they subscribed afterwards.
    pub fn retire(&self) {
        self.retired.send_replace(true);
    }

    pub fn is_retired(&self) -> bool {
        *self.retired.borrow()
    }

    pub fn retirement(&self) -> watch::Receiver<bool> {
        self.retired.subscribe()
    }

    /// Open the link, bounded by the connect timeout.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        self.runtime.write().state = SessionState::Connecting;

        let result = match tokio::time::timeout(self.connect_timeout, self.transport.connect()).await {
            Ok(r) => r,
            Err(_) => Err(ProtocolError::Timeout(self.connect_timeout)),
        };

        match &result {
            Ok(()) => {
                let mut rt = self.runtime.write();
                rt.state = SessionState::Connected;
                rt.last_error = None;
            }
            Err(e) => {
                self.transport.disconnect().await;
                let mut rt = self.runtime.write();
                rt.state = SessionState::Disconnected;
                rt.last_error = Some(e.to_string());
            }
        }

        self.publish_status();
        result
    }

    /// Close the link. Idempotent; only a real transition is published.
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
        let changed = {
            let mut rt = self.runtime.write();
            let changed = rt.state != SessionState::Disconnected;
            rt.state = SessionState::Disconnected;
            changed
        };
        if changed {
            self.publish_status();
        }
    }

    /// Record a lost link without touching the transport.
    pub fn mark_lost(&self, error: &str) {
        {
            let mut rt = self.runtime.write();
            rt.state = SessionState::Disconnected;
            rt.last_error = Some(error.to_string());
        }
        self.publish_status();
    }

    pub async fn probe(&self) -> Result<(), ProtocolError> {
        if self.state() != SessionState::Connected {
            return Err(ProtocolError::NotConnected);
        }
        self.transport.probe().await
    }

    pub async fn read(&self, addr: Address, ty: TagType) -> Result<Value, ProtocolError> {
        let result = protocol::read_value(self.transport.as_ref(), addr, ty).await;
        self.record(&result);
        result
    }

    pub async fn write(
        &self,
        addr: Address,
        ty: TagType,
        declared_len: usize,
        value: &Value,
    ) -> Result<(), ProtocolError> {
        let result = protocol::write_value(self.transport.as_ref(), addr, ty, declared_len, value).await;
        if let Err(e) = &result {
            self.runtime.write().last_error = Some(e.to_string());
        }
        result
    }

    /// Read one raw 16-bit word.
    pub async fn read_word(&self, db: u16, byte: u32) -> Result<u16, ProtocolError> {
        let result = protocol::read_word(self.transport.as_ref(), db, byte).await;
        self.record(&result);
        result
    }

    fn record<T>(&self, result: &Result<T, ProtocolError>) {
        let mut rt = self.runtime.write();
        match result {
            Ok(_) => rt.last_read = Some(Utc::now()),
            Err(e) => rt.last_error = Some(e.to_string()),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let controller = self.controller.read();
        let rt = self.runtime.read();
        SessionSnapshot {
            controller_id: controller.id,
            name: controller.name.clone(),
            address: controller.address.clone(),
            state: rt.state,
            connected: rt.state == SessionState::Connected,
            last_error: rt.last_error.clone(),
            last_read: rt.last_read,
        }
    }

    pub fn status(&self) -> ControllerStatus {
        let snap = self.snapshot();
        ControllerStatus {
            controller_id: snap.controller_id,
            name: snap.name,
            connected: snap.connected,
            last_error: snap.last_error,
            last_read: snap.last_read,
            timestamp: Utc::now(),
        }
    }

    fn publish_status(&self) {
        self.events.publish(Event::ControllerStatus(self.status()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MemoryTransport;
    use tokio_test::{assert_err, assert_ok};

    fn session(plc: Arc<MemoryTransport>, events: Arc<EventBus>) -> DeviceSession {
        let controller = Controller {
            id: 7,
            name: "Lock 7".to_string(),
            address: "sim://lock-7".to_string(),
            ..Default::default()
        };
        DeviceSession::new(controller, plc, Duration::from_secs(1), events)
    }

    #[tokio::test]
    async fn test_connect_publishes_status() {
        let events = Arc::new(EventBus::new(16));
        let mut sub = events.subscribe(&["plc.status.7"]);
        let plc = Arc::new(MemoryTransport::new());
        let s = session(plc, events.clone());

        assert_ok!(s.connect().await);
        assert!(s.is_connected());
        let event = sub.recv().await.unwrap();
        assert!(matches!(event.as_ref(), Event::ControllerStatus(st) if st.connected));

        s.disconnect().await;
        s.disconnect().await;
        assert!(!s.is_connected());
        assert!(sub.recv().await.is_some());
        // the second disconnect changed nothing
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_failed_connect_records_error() {
        let events = Arc::new(EventBus::new(16));
        let plc = Arc::new(MemoryTransport::new());
        plc.set_reachable(false);
        let s = session(plc, events);

        assert_err!(s.connect().await);
        let snap = s.snapshot();
        assert_eq!(snap.state, SessionState::Disconnected);
        assert!(snap.last_error.is_some());
    }

    #[tokio::test]
    async fn test_retire_is_visible_to_late_subscribers() {
        let events = Arc::new(EventBus::new(16));
        let s = session(Arc::new(MemoryTransport::new()), events);

        let mut early = s.retirement();
        assert!(!s.is_retired());
        s.retire();
        assert!(s.is_retired());
        assert_ok!(early.changed().await);
        assert!(*early.borrow());

        let late = s.retirement();
        assert!(*late.borrow());
    }

    #[tokio::test]
    async fn test_reads_update_last_read() {
        let events = Arc::new(EventBus::new(16));
        let plc = Arc::new(MemoryTransport::new());
        plc.set_word(3, 10, 0xBEEF);
        let s = session(plc, events);
        s.connect().await.unwrap();

        assert_eq!(s.read_word(3, 10).await.unwrap(), 0xBEEF);
        assert!(s.snapshot().last_read.is_some());
        assert_eq!(
            s.read(Address::new(3, 10), TagType::Word).await.unwrap(),
            Value::Word(0xBEEF)
        );
    }
}

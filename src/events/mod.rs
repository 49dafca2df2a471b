//! Domain events and their subjects.

mod bus;

pub use bus::*;

use crate::db::{Acknowledgement, Severity};
use crate::protocol::Value;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const STATUS_SUBJECT: &str = "plc.status";
pub const TAG_SUBJECT: &str = "plc.tags.updates";
pub const FAULT_SUBJECT: &str = "faults.updates";
pub const ACK_SUBJECT: &str = "faults.acknowledged";

/// Connection state of a controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerStatus {
    pub controller_id: i64,
    pub name: String,
    pub connected: bool,
    pub last_error: Option<String>,
    pub last_read: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

/// A freshly read tag value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagValue {
    pub controller_id: i64,
    pub controller_name: String,
    pub tag_id: i64,
    pub tag_name: String,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

/// A committed fault activation or deactivation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultUpdate {
    pub fault_id: i64,
    pub controller_id: i64,
    pub controller_name: String,
    pub word_name: String,
    pub bit_offset: u8,
    pub site: String,
    pub subsystem: String,
    pub description: String,
    pub severity: Severity,
    pub active: bool,
    /// Activation or deactivation time.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultAcknowledged {
    pub fault_id: i64,
    pub controller_id: i64,
    #[serde(flatten)]
    pub acknowledgement: Acknowledgement,
}

/// Everything the core publishes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    ControllerStatus(ControllerStatus),
    TagValue(TagValue),
    FaultUpdate(FaultUpdate),
    FaultAcknowledged(FaultAcknowledged),
}

impl Event {
    /// Subjects the event is published on, most specific first.
    pub fn subjects(&self) -> Vec<String> {
        match self {
            Event::ControllerStatus(s) => vec![
                format!("{}.{}", STATUS_SUBJECT, s.controller_id),
                STATUS_SUBJECT.to_string(),
            ],
            Event::TagValue(v) => vec![
                format!("{}.{}.{}", TAG_SUBJECT, v.controller_id, v.tag_id),
                format!("{}.{}", TAG_SUBJECT, v.controller_id),
                TAG_SUBJECT.to_string(),
            ],
            Event::FaultUpdate(f) => vec![
                format!("{}.{}", FAULT_SUBJECT, f.controller_id),
                FAULT_SUBJECT.to_string(),
            ],
            Event::FaultAcknowledged(_) => vec![ACK_SUBJECT.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_value_subjects() {
        let event = Event::TagValue(TagValue {
            controller_id: 3,
            controller_name: "Lock 3".to_string(),
            tag_id: 17,
            tag_name: "level".to_string(),
            value: Value::Real(2.5),
            timestamp: Utc::now(),
        });
        assert_eq!(
            event.subjects(),
            vec!["plc.tags.updates.3.17", "plc.tags.updates.3", "plc.tags.updates"]
        );
    }

    #[test]
    fn test_event_serializes_with_discriminant() {
        let event = Event::ControllerStatus(ControllerStatus {
            controller_id: 1,
            name: "Lock 1".to_string(),
            connected: true,
            last_error: None,
            last_read: None,
            timestamp: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "controller_status");
        assert_eq!(json["data"]["connected"], true);
    }
}

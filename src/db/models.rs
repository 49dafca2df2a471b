//! Database model types.

use crate::protocol::{Address, TagType};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A controller on the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    pub id: i64,
    pub name: String,
    /// Host or host:port; `sim://<name>` selects a simulated controller.
    pub address: String,
    pub rack: u8,
    pub slot: u8,
    pub gateway: Option<String>,
    pub enabled: bool,
}

impl Default for Controller {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            address: String::new(),
            rack: 0,
            slot: 1,
            gateway: None,
            enabled: true,
        }
    }
}

impl Controller {
    /// Whether switching from `self` to `other` needs a new connection.
    pub fn link_differs(&self, other: &Controller) -> bool {
        self.address != other.address
            || self.rack != other.rack
            || self.slot != other.slot
            || self.gateway != other.gateway
    }
}

/// A polled memory location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub controller_id: i64,
    pub name: String,
    pub db_number: u16,
    pub byte_offset: u32,
    pub bit_offset: Option<u8>,
    pub tag_type: TagType,
    /// Declared length; only meaningful for strings.
    pub length: u16,
    pub interval_ms: u32,
    pub only_on_change: bool,
    pub enabled: bool,
    pub subsystem: Option<String>,
    pub description: Option<String>,
}

impl Default for Tag {
    fn default() -> Self {
        Self {
            id: 0,
            controller_id: 0,
            name: String::new(),
            db_number: 0,
            byte_offset: 0,
            bit_offset: None,
            tag_type: TagType::Word,
            length: 1,
            interval_ms: 1000,
            only_on_change: false,
            enabled: true,
            subsystem: None,
            description: None,
        }
    }
}

impl Tag {
    pub fn address(&self) -> Address {
        Address {
            db: self.db_number,
            byte: self.byte_offset,
            bit: self.bit_offset,
        }
    }
}

/// Severity class of a fault definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Alarm,
    Event,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Alarm => "alarm",
            Severity::Event => "event",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unrecognised severity string.
#[derive(Debug, thiserror::Error)]
#[error("unknown severity '{0}'")]
pub struct UnknownSeverity(pub String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "alarm" => Ok(Severity::Alarm),
            "event" => Ok(Severity::Event),
            _ => Err(UnknownSeverity(s.to_string())),
        }
    }
}

/// One monitored bit of a controller word.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultDefinition {
    pub id: i64,
    pub controller_id: i64,
    pub word_name: String,
    pub db_number: u16,
    pub byte_offset: u32,
    /// 0-15 within the big-endian word.
    pub bit_offset: u8,
    pub site: String,
    pub subsystem: String,
    pub description: String,
    pub severity: Severity,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for FaultDefinition {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            controller_id: 0,
            word_name: String::new(),
            db_number: 0,
            byte_offset: 0,
            bit_offset: 0,
            site: String::new(),
            subsystem: String::new(),
            description: String::new(),
            severity: Severity::Alarm,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Who acknowledged a fault and when.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Acknowledgement {
    pub by: i64,
    pub by_name: String,
    pub at: DateTime<Utc>,
}

/// Current state of one fault definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultStatus {
    pub fault_id: i64,
    pub active: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub acknowledgement: Option<Acknowledgement>,
}

/// A completed activation period.
#[derive(Debug, Clone, Serialize)]
pub struct FaultHistory {
    pub id: i64,
    pub fault_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub acknowledgement: Option<Acknowledgement>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// History row joined with its definition.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub history: FaultHistory,
    pub controller_id: i64,
    pub word_name: String,
    pub bit_offset: u8,
    pub site: String,
    pub subsystem: String,
    pub description: String,
    pub severity: Severity,
}

/// An active fault with the context an operator needs.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveFault {
    pub fault_id: i64,
    pub controller_id: i64,
    pub controller_name: String,
    pub word_name: String,
    pub db_number: u16,
    pub byte_offset: u32,
    pub bit_offset: u8,
    pub site: String,
    pub subsystem: String,
    pub description: String,
    pub severity: Severity,
    pub started_at: Option<DateTime<Utc>>,
    pub acknowledgement: Option<Acknowledgement>,
}

/// A state change the batch processor commits in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultTransition {
    Activated {
        fault_id: i64,
        at: DateTime<Utc>,
    },
    Deactivated {
        fault_id: i64,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    },
}

impl FaultTransition {
    pub fn fault_id(&self) -> i64 {
        match self {
            FaultTransition::Activated { fault_id, .. } => *fault_id,
            FaultTransition::Deactivated { fault_id, .. } => *fault_id,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DefinitionFilter {
    pub site: Option<String>,
    pub subsystem: Option<String>,
    pub controller_id: Option<i64>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub site: Option<String>,
    pub subsystem: Option<String>,
    /// Periods ending at or after this instant.
    pub start: Option<DateTime<Utc>>,
    /// Periods starting at or before this instant.
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Outcome of a bulk definition import.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub inserted: usize,
    pub errors: Vec<String>,
}

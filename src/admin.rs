//! Management operations shared by the HTTP API.
//!
//! Validates input, writes through the store and keeps the fleet and fault
//! monitors in step. Every mutation leaves an `audit` log record.

use crate::db::{
    ActiveFault, Controller, DbError, DefinitionFilter, FaultDefinition, HistoryEntry, HistoryFilter, ImportReport,
    Severity, Store, Tag,
};
use crate::events::{BusStats, EventBus};
use crate::faults::{FaultError, FaultManager, FaultStats};
use crate::fleet::{FleetError, FleetManager, SessionState, TagSnapshot};
use crate::protocol::{check_span, Address, ProtocolError, TagType, Value, MAX_STRING_LEN};

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Who is performing an operation, as supplied by the calling layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub id: i64,
    pub name: String,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            id: 0,
            name: "system".to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum AdminError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Invalid(String),
    #[error("controller {0} is not connected")]
    NotConnected(i64),
    #[error("database error: {0}")]
    Db(DbError),
    #[error("controller error: {0}")]
    Protocol(ProtocolError),
}

impl From<DbError> for AdminError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => AdminError::NotFound("record".to_string()),
            DbError::Conflict(msg) => AdminError::Conflict(msg),
            other => AdminError::Db(other),
        }
    }
}

impl From<FleetError> for AdminError {
    fn from(e: FleetError) -> Self {
        match e {
            FleetError::NotFound(what) => AdminError::NotFound(what),
            FleetError::NotConnected(id) => AdminError::NotConnected(id),
            FleetError::Protocol(
                e @ (ProtocolError::InvalidValue(_) | ProtocolError::TypeMismatch { .. } | ProtocolError::InvalidAddress(_)),
            ) => AdminError::Invalid(e.to_string()),
            FleetError::Protocol(e) => AdminError::Protocol(e),
            FleetError::Db(e) => e.into(),
            FleetError::Fault(e) => e.into(),
        }
    }
}

impl From<FaultError> for AdminError {
    fn from(e: FaultError) -> Self {
        match e {
            FaultError::NotActive(id) => AdminError::Conflict(format!("fault {} is not active", id)),
            FaultError::NotFound(id) => AdminError::NotFound(format!("fault {}", id)),
            FaultError::Db(e) => e.into(),
        }
    }
}

fn not_found(what: &str, id: i64) -> impl FnOnce(AdminError) -> AdminError + '_ {
    move |e| match e {
        AdminError::NotFound(_) => AdminError::NotFound(format!("{} {}", what, id)),
        other => other,
    }
}

fn audit(actor: &Actor, action: &str, entity: &str, id: i64) {
    tracing::info!(
        target: "audit",
        actor_id = actor.id,
        actor_name = %actor.name,
        action,
        entity,
        id,
        "{} {} {} by {}",
        action,
        entity,
        id,
        actor.name
    );
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerInput {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub rack: u8,
    #[serde(default = "default_slot")]
    pub slot: u8,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_slot() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u32 {
    1000
}

impl ControllerInput {
    fn into_controller(self, id: i64) -> Result<Controller, AdminError> {
        if self.name.trim().is_empty() {
            return Err(AdminError::Invalid("controller name is required".to_string()));
        }
        if self.address.trim().is_empty() {
            return Err(AdminError::Invalid("controller address is required".to_string()));
        }
        Ok(Controller {
            id,
            name: self.name.trim().to_string(),
            address: self.address.trim().to_string(),
            rack: self.rack,
            slot: self.slot,
            gateway: self.gateway.filter(|g| !g.trim().is_empty()),
            enabled: self.enabled,
        })
    }
}

/// A controller row with its live connection state.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerView {
    #[serde(flatten)]
    pub controller: Controller,
    pub state: SessionState,
    pub connected: bool,
    pub last_error: Option<String>,
    pub last_read: Option<DateTime<Utc>>,
}

/// Tag fields as supplied by a client. The location comes either from
/// `address` notation or from the numeric fields.
#[derive(Debug, Clone, Deserialize)]
pub struct TagInput {
    pub controller_id: i64,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub db_number: Option<u16>,
    #[serde(default)]
    pub byte_offset: Option<u32>,
    #[serde(default)]
    pub bit_offset: Option<u8>,
    #[serde(default)]
    pub tag_type: Option<TagType>,
    #[serde(default)]
    pub length: Option<u16>,
    #[serde(default = "default_interval")]
    pub interval_ms: u32,
    #[serde(default)]
    pub only_on_change: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub subsystem: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl TagInput {
    fn into_tag(self, id: i64) -> Result<Tag, AdminError> {
        if self.name.trim().is_empty() {
            return Err(AdminError::Invalid("tag name is required".to_string()));
        }

        let (addr, tag_type) = match &self.address {
            Some(notation) => {
                let (addr, parsed) = Address::parse(notation).map_err(|e| AdminError::Invalid(e.to_string()))?;
                (addr, self.tag_type.unwrap_or(parsed))
            }
            None => {
                let db = self
                    .db_number
                    .ok_or_else(|| AdminError::Invalid("db_number or address is required".to_string()))?;
                let addr = Address {
                    db,
                    byte: self.byte_offset.unwrap_or(0),
                    bit: self.bit_offset,
                };
                (addr, self.tag_type.unwrap_or(TagType::Word))
            }
        };

        match (tag_type, addr.bit) {
            (TagType::Bool, Some(bit)) if bit > 7 => {
                return Err(AdminError::Invalid(format!("bit offset {} outside 0-7", bit)));
            }
            (TagType::Bool, _) | (_, None) => {}
            (other, Some(_)) => {
                return Err(AdminError::Invalid(format!("bit offsets only apply to Bool tags, not {}", other)));
            }
        }

        let length = match tag_type {
            TagType::String => {
                let len = self.length.unwrap_or(MAX_STRING_LEN as u16);
                if len == 0 || len as usize > MAX_STRING_LEN {
                    return Err(AdminError::Invalid(format!(
                        "string length {} outside 1-{}",
                        len, MAX_STRING_LEN
                    )));
                }
                len
            }
            _ => 1,
        };
        // strings carry a two byte header ahead of their characters
        let span = tag_type.width().unwrap_or(length as usize + 2);
        check_span(addr.db, addr.byte, span).map_err(|e| AdminError::Invalid(e.to_string()))?;

        if self.interval_ms == 0 {
            return Err(AdminError::Invalid("interval_ms must be positive".to_string()));
        }

        Ok(Tag {
            id,
            controller_id: self.controller_id,
            name: self.name.trim().to_string(),
            db_number: addr.db,
            byte_offset: addr.byte,
            bit_offset: addr.bit,
            tag_type,
            length,
            interval_ms: self.interval_ms,
            only_on_change: self.only_on_change,
            enabled: self.enabled,
            subsystem: self.subsystem,
            description: self.description,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefinitionInput {
    pub controller_id: i64,
    pub word_name: String,
    pub db_number: u16,
    pub byte_offset: u32,
    pub bit_offset: u8,
    #[serde(default)]
    pub site: String,
    #[serde(default)]
    pub subsystem: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_severity() -> Severity {
    Severity::Alarm
}

impl DefinitionInput {
    fn into_definition(self, id: i64) -> Result<FaultDefinition, AdminError> {
        if self.word_name.trim().is_empty() {
            return Err(AdminError::Invalid("word_name is required".to_string()));
        }
        if self.bit_offset > 15 {
            return Err(AdminError::Invalid(format!("bit offset {} outside 0-15", self.bit_offset)));
        }
        check_span(self.db_number, self.byte_offset, 2).map_err(|e| AdminError::Invalid(e.to_string()))?;
        Ok(FaultDefinition {
            id,
            controller_id: self.controller_id,
            word_name: self.word_name.trim().to_string(),
            db_number: self.db_number,
            byte_offset: self.byte_offset,
            bit_offset: self.bit_offset,
            site: self.site,
            subsystem: self.subsystem,
            description: self.description,
            severity: self.severity,
            enabled: self.enabled,
            ..Default::default()
        })
    }
}

/// History query as sent by clients; dates are `YYYY-MM-DD` and the end date
/// covers its whole day.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    pub site: Option<String>,
    pub subsystem: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: Option<u32>,
}

impl HistoryQuery {
    pub fn into_filter(self) -> Result<HistoryFilter, AdminError> {
        let start = match self.start_date.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => Some(day_start(parse_date(s)?)),
            None => None,
        };
        let end = match self.end_date.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => {
                let next = parse_date(s)?
                    .succ_opt()
                    .ok_or_else(|| AdminError::Invalid(format!("end date {} out of range", s)))?;
                Some(day_start(next) - chrono::Duration::nanoseconds(1))
            }
            None => None,
        };
        Ok(HistoryFilter {
            site: self.site.filter(|s| !s.is_empty()),
            subsystem: self.subsystem.filter(|s| !s.is_empty()),
            start,
            end,
            limit: self.limit,
        })
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, AdminError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| AdminError::Invalid(format!("invalid date '{}'", s)))
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub faults: FaultStats,
    pub events: BusStats,
    pub controllers: usize,
    pub connected: usize,
}

/// Management facade over the store, the fleet and the fault manager.
pub struct Admin {
    store: Arc<Store>,
    fleet: Arc<FleetManager>,
    faults: Arc<FaultManager>,
    events: Arc<EventBus>,
}

impl Admin {
    pub fn new(store: Arc<Store>, fleet: Arc<FleetManager>, faults: Arc<FaultManager>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            fleet,
            faults,
            events,
        }
    }

    pub fn fleet(&self) -> &Arc<FleetManager> {
        &self.fleet
    }

    // --- Controllers ---

    pub async fn list_controllers(&self) -> Result<Vec<ControllerView>, AdminError> {
        let mut views = Vec::new();
        for controller in self.store.list_controllers()? {
            views.push(self.view(controller).await);
        }
        Ok(views)
    }

    pub async fn get_controller(&self, id: i64) -> Result<ControllerView, AdminError> {
        let controller = self.store.get_controller(id).map_err(AdminError::from).map_err(not_found("controller", id))?;
        Ok(self.view(controller).await)
    }

    async fn view(&self, controller: Controller) -> ControllerView {
        let snap = self.fleet.session(controller.id).await.map(|s| s.snapshot());
        ControllerView {
            state: snap.as_ref().map_or(SessionState::Disconnected, |s| s.state),
            connected: snap.as_ref().is_some_and(|s| s.connected),
            last_error: snap.as_ref().and_then(|s| s.last_error.clone()),
            last_read: snap.as_ref().and_then(|s| s.last_read),
            controller,
        }
    }

    pub async fn create_controller(&self, actor: &Actor, input: ControllerInput) -> Result<Controller, AdminError> {
        let mut controller = input.into_controller(0)?;
        self.store.create_controller(&mut controller)?;
        audit(actor, "create", "controller", controller.id);

        self.fleet.add_controller(controller.clone()).await?;
        Ok(controller)
    }

    pub async fn update_controller(
        &self,
        actor: &Actor,
        id: i64,
        input: ControllerInput,
    ) -> Result<Controller, AdminError> {
        let old = self.store.get_controller(id).map_err(AdminError::from).map_err(not_found("controller", id))?;
        let controller = input.into_controller(id)?;
        self.store.update_controller(&controller)?;
        audit(actor, "update", "controller", id);

        self.fleet.apply_controller_update(&old, controller.clone()).await?;
        Ok(controller)
    }

    pub async fn delete_controller(&self, actor: &Actor, id: i64) -> Result<(), AdminError> {
        self.store.get_controller(id).map_err(AdminError::from).map_err(not_found("controller", id))?;
        self.fleet.remove_controller(id).await;
        self.store.delete_controller(id)?;
        audit(actor, "delete", "controller", id);

        // its definitions are gone with it
        self.fleet.reload_fault_monitoring().await?;
        Ok(())
    }

    // --- Tags ---

    pub fn list_tags(&self, controller_id: i64) -> Result<Vec<Tag>, AdminError> {
        self.store
            .get_controller(controller_id)
            .map_err(AdminError::from)
            .map_err(not_found("controller", controller_id))?;
        Ok(self.store.list_tags(controller_id)?)
    }

    pub fn get_tag(&self, id: i64) -> Result<Tag, AdminError> {
        self.store.get_tag(id).map_err(AdminError::from).map_err(not_found("tag", id))
    }

    pub async fn create_tag(&self, actor: &Actor, input: TagInput) -> Result<Tag, AdminError> {
        let controller_id = input.controller_id;
        let mut tag = input.into_tag(0)?;
        self.store
            .create_tag(&mut tag)
            .map_err(AdminError::from)
            .map_err(not_found("controller", controller_id))?;
        audit(actor, "create", "tag", tag.id);

        self.fleet.add_tag(tag.clone()).await;
        Ok(tag)
    }

    pub async fn update_tag(&self, actor: &Actor, id: i64, input: TagInput) -> Result<Tag, AdminError> {
        let old = self.get_tag(id)?;
        let tag = input.into_tag(id)?;
        if tag.controller_id != old.controller_id {
            self.store
                .get_controller(tag.controller_id)
                .map_err(AdminError::from)
                .map_err(not_found("controller", tag.controller_id))?;
        }
        self.store.update_tag(&tag)?;
        audit(actor, "update", "tag", id);

        if tag.controller_id != old.controller_id {
            self.fleet.remove_tag(old.controller_id, id).await;
            self.fleet.add_tag(tag.clone()).await;
        } else {
            self.fleet.update_tag(tag.clone()).await;
        }
        Ok(tag)
    }

    pub async fn delete_tag(&self, actor: &Actor, id: i64) -> Result<(), AdminError> {
        let tag = self.get_tag(id)?;
        self.store.delete_tag(id)?;
        audit(actor, "delete", "tag", id);

        self.fleet.remove_tag(tag.controller_id, id).await;
        Ok(())
    }

    pub async fn read_tag_value(&self, id: i64) -> Result<TagSnapshot, AdminError> {
        let tag = self.get_tag(id)?;
        Ok(self.fleet.read_tag(tag.controller_id, id).await?)
    }

    pub async fn write_tag_value(
        &self,
        actor: &Actor,
        id: i64,
        value: &serde_json::Value,
    ) -> Result<Value, AdminError> {
        let tag = self.get_tag(id)?;
        let written = self.fleet.write_tag(tag.controller_id, id, value).await?;
        audit(actor, "write", "tag", id);
        Ok(written)
    }

    // --- Fault definitions ---

    pub fn list_definitions(&self, filter: &DefinitionFilter) -> Result<Vec<FaultDefinition>, AdminError> {
        Ok(self.store.list_definitions(filter)?)
    }

    pub fn get_definition(&self, id: i64) -> Result<FaultDefinition, AdminError> {
        self.store
            .get_definition(id)
            .map_err(AdminError::from)
            .map_err(not_found("fault definition", id))
    }

    pub async fn create_definition(&self, actor: &Actor, input: DefinitionInput) -> Result<FaultDefinition, AdminError> {
        let controller_id = input.controller_id;
        let mut def = input.into_definition(0)?;
        self.store
            .create_definition(&mut def)
            .map_err(AdminError::from)
            .map_err(not_found("controller", controller_id))?;
        audit(actor, "create", "fault_definition", def.id);

        self.fleet.reload_fault_monitoring().await?;
        Ok(def)
    }

    pub async fn update_definition(
        &self,
        actor: &Actor,
        id: i64,
        input: DefinitionInput,
    ) -> Result<FaultDefinition, AdminError> {
        let old = self.get_definition(id)?;
        let mut def = input.into_definition(id)?;
        def.created_at = old.created_at;
        let controller_id = def.controller_id;
        self.store
            .update_definition(&mut def)
            .map_err(AdminError::from)
            .map_err(not_found("controller", controller_id))?;
        audit(actor, "update", "fault_definition", id);

        self.fleet.reload_fault_monitoring().await?;
        Ok(def)
    }

    pub async fn delete_definition(&self, actor: &Actor, id: i64) -> Result<(), AdminError> {
        self.store
            .delete_definition(id)
            .map_err(AdminError::from)
            .map_err(not_found("fault definition", id))?;
        audit(actor, "delete", "fault_definition", id);

        self.fleet.reload_fault_monitoring().await?;
        Ok(())
    }

    /// Insert many definitions; invalid or colliding rows are reported, not fatal.
    pub async fn import_definitions(
        &self,
        actor: &Actor,
        inputs: Vec<DefinitionInput>,
    ) -> Result<ImportReport, AdminError> {
        let mut rejected = Vec::new();
        let mut defs = Vec::with_capacity(inputs.len());
        for (row, input) in inputs.into_iter().enumerate() {
            match input.into_definition(0) {
                Ok(def) => defs.push(def),
                Err(e) => rejected.push(format!("row {}: {}", row + 1, e)),
            }
        }

        let mut report = self.store.import_definitions(&mut defs)?;
        report.errors.splice(0..0, rejected);
        tracing::info!(
            target: "audit",
            actor_id = actor.id,
            actor_name = %actor.name,
            action = "import",
            entity = "fault_definition",
            inserted = report.inserted,
            "import fault_definition: {} inserted, {} errors by {}",
            report.inserted,
            report.errors.len(),
            actor.name
        );

        if report.inserted > 0 {
            self.fleet.reload_fault_monitoring().await?;
        }
        Ok(report)
    }

    // --- Faults ---

    pub fn active_faults(&self) -> Result<Vec<ActiveFault>, AdminError> {
        Ok(self.faults.active_faults()?)
    }

    pub fn fault_history(&self, query: HistoryQuery) -> Result<Vec<HistoryEntry>, AdminError> {
        let filter = query.into_filter()?;
        Ok(self.faults.history(&filter)?)
    }

    pub fn acknowledge_fault(&self, actor: &Actor, fault_id: i64) -> Result<(), AdminError> {
        self.get_definition(fault_id)?;
        self.faults.acknowledge_fault(fault_id, actor.id, &actor.name)?;
        audit(actor, "acknowledge", "fault", fault_id);
        Ok(())
    }

    pub fn sites(&self) -> Result<Vec<String>, AdminError> {
        Ok(self.faults.sites()?)
    }

    pub fn subsystems(&self) -> Result<Vec<String>, AdminError> {
        Ok(self.faults.subsystems()?)
    }

    pub async fn stats(&self) -> Stats {
        let snapshot = self.fleet.snapshot().await;
        Stats {
            faults: self.faults.stats(),
            events: self.events.stats(),
            controllers: snapshot.len(),
            connected: snapshot.iter().filter(|c| c.session.connected).count(),
        }
    }
}

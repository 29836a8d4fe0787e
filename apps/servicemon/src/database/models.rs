use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

use crate::monitoring::types::ServiceStatus;

/// Tag written as `source` on every event this daemon produces
pub const EVENT_SOURCE: &str = "serviceping";

/// Tag written as `target`: the downstream event processor
pub const EVENT_TARGET: &str = "eventEngine";

/// Sources the writer accepts; anything else is a programming error upstream
pub const ACCEPTED_SOURCES: &[&str] = &[EVENT_SOURCE, "pping"];

/// One monitored service as loaded from the datastore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckerSpec {
    pub id: i64,
    pub netbox_id: i64,
    pub device_id: Option<i64>,
    pub ip: IpAddr,
    pub sysname: String,
    /// Checker type name, e.g. `http`
    pub handler: String,
    pub args: HashMap<String, String>,
    pub status: ServiceStatus,
    pub version: Option<String>,
    pub active: bool,
}

impl CheckerSpec {
    /// True when both specs would produce an identical checker.
    pub fn same_target(&self, other: &CheckerSpec) -> bool {
        self.netbox_id == other.netbox_id
            && self.device_id == other.device_id
            && self.ip == other.ip
            && self.sysname == other.sysname
            && self.handler == other.handler
            && self.args == other.args
    }

    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// The service went up or down
    ServiceState { status: ServiceStatus },
    /// The service announced a new software version
    Version { version: String },
}

/// A fact to be persisted for the downstream event processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub source: String,
    pub target: String,
    pub service_id: i64,
    pub netbox_id: i64,
    pub device_id: Option<i64>,
    pub kind: EventKind,
    pub info: String,
    pub time: DateTime<Utc>,
}

impl Event {
    pub fn service_state(spec: &CheckerSpec, status: ServiceStatus, info: impl Into<String>) -> Self {
        Self::new(spec, EventKind::ServiceState { status }, info.into())
    }

    pub fn version(spec: &CheckerSpec, version: impl Into<String>) -> Self {
        let version = version.into();
        let info = format!("version {version}");
        Self::new(spec, EventKind::Version { version }, info)
    }

    fn new(spec: &CheckerSpec, kind: EventKind, info: String) -> Self {
        Self {
            source: EVENT_SOURCE.to_string(),
            target: EVENT_TARGET.to_string(),
            service_id: spec.id,
            netbox_id: spec.netbox_id,
            device_id: spec.device_id,
            kind,
            info,
            time: Utc::now(),
        }
    }

    /// `eventtypeid` column
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            EventKind::ServiceState { .. } => "serviceState",
            EventKind::Version { .. } => "version",
        }
    }

    /// `state` column: `s` starts a down period, `e` ends it, `x` is stateless
    pub fn state_code(&self) -> &'static str {
        match self.kind {
            EventKind::ServiceState { status: ServiceStatus::Down } => "s",
            EventKind::ServiceState { status: ServiceStatus::Up } => "e",
            EventKind::ServiceState { status: ServiceStatus::Unknown }
            | EventKind::Version { .. } => "x",
        }
    }

    /// `value` column
    pub fn value(&self) -> i64 {
        match self.kind {
            EventKind::ServiceState { status: ServiceStatus::Up } => 100,
            EventKind::ServiceState { status: ServiceStatus::Down } => 1,
            EventKind::ServiceState { status: ServiceStatus::Unknown }
            | EventKind::Version { .. } => 0,
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} service={} netbox={} state={} value={} ({})",
            self.event_type(),
            self.service_id,
            self.netbox_id,
            self.state_code(),
            self.value(),
            self.info
        )
    }
}

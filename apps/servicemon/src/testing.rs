//! Fakes shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::database::gateway::Datastore;
use crate::database::models::{CheckerSpec, Event};
use crate::error::{CheckerError, DatastoreError};
use crate::monitoring::arena::MonitoredService;
use crate::monitoring::checker::{Checker, CheckerKind};
use crate::monitoring::registry::CheckerRegistry;
use crate::monitoring::types::{ServiceStatus, Verdict};

/// An active service on 127.0.0.1 with no arguments and unknown state
pub fn spec(id: i64, handler: &str) -> CheckerSpec {
    CheckerSpec {
        id,
        netbox_id: 1000 + id,
        device_id: Some(2000 + id),
        ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        sysname: format!("host{id}.example.org"),
        handler: handler.to_string(),
        args: HashMap::new(),
        status: ServiceStatus::Unknown,
        version: None,
        active: true,
    }
}

pub fn monitored(spec: CheckerSpec, checker: ScriptedChecker) -> Arc<MonitoredService> {
    Arc::new(MonitoredService::new(spec, Box::new(checker)))
}

/// Service id and start time of every scripted execution
pub type ExecutionLog = Arc<Mutex<Vec<(i64, Instant)>>>;

pub const FAKE: CheckerKind = CheckerKind {
    type_name: "fake",
    description: "Scripted checker for tests",
    ipv6_support: true,
    default_port: 0,
    required_args: &[],
    optional_args: &[],
};

/// Registry whose only kind, `fake`, is always up and logs each execution
pub fn recording_registry() -> (CheckerRegistry, ExecutionLog) {
    let log = ExecutionLog::default();
    let mut registry = CheckerRegistry::default();
    let factory_log = Arc::clone(&log);
    registry.register(FAKE, move |spec, _| {
        Ok(Box::new(ScriptedChecker::always(Verdict::up("OK")).recording(spec.id, Arc::clone(&factory_log))))
    });
    (registry, log)
}

pub struct ScriptedChecker {
    script: Mutex<VecDeque<Verdict>>,
    fallback: Verdict,
    error: Option<String>,
    hang: bool,
    timeout: Duration,
    calls: Arc<AtomicUsize>,
    log: Option<(i64, ExecutionLog)>,
}

impl ScriptedChecker {
    pub fn always(verdict: Verdict) -> Self {
        Self::sequence(vec![verdict])
    }

    /// Verdicts in order, repeating the last one
    pub fn sequence(mut verdicts: Vec<Verdict>) -> Self {
        let fallback = verdicts.pop().unwrap_or_else(|| Verdict::down("empty script"));
        Self {
            script: Mutex::new(verdicts.into()),
            fallback,
            error: None,
            hang: false,
            timeout: Duration::from_secs(10),
            calls: Arc::default(),
            log: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self { error: Some(message.to_string()), ..Self::always(Verdict::up("unused")) }
    }

    /// Never finishes; reports `timeout` as its own limit
    pub fn hanging(timeout: Duration) -> Self {
        Self { hang: true, timeout, ..Self::always(Verdict::up("unused")) }
    }

    pub fn recording(self, id: i64, log: ExecutionLog) -> Self {
        Self { log: Some((id, log)), ..self }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Checker for ScriptedChecker {
    async fn execute(&self) -> Result<Verdict, CheckerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((id, log)) = &self.log {
            log.lock().unwrap().push((*id, Instant::now()));
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(message) = &self.error {
            return Err(CheckerError::Protocol(message.clone()));
        }
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// In-memory datastore with failure injection
pub struct MemoryDatastore {
    specs: Mutex<Vec<CheckerSpec>>,
    reachable: AtomicBool,
    failing_commits: AtomicUsize,
    committed: Mutex<Vec<Event>>,
    commit_attempts: Mutex<Vec<Instant>>,
    fetches: Mutex<Vec<(Instant, bool)>>,
    fetch_delays: Mutex<VecDeque<Duration>>,
}

impl MemoryDatastore {
    pub fn new(specs: Vec<CheckerSpec>) -> Self {
        Self {
            specs: Mutex::new(specs),
            reachable: AtomicBool::new(true),
            failing_commits: AtomicUsize::new(0),
            committed: Mutex::default(),
            commit_attempts: Mutex::default(),
            fetches: Mutex::default(),
            fetch_delays: Mutex::default(),
        }
    }

    pub fn set_specs(&self, specs: Vec<CheckerSpec>) {
        *self.specs.lock().unwrap() = specs;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Make the next fetches take this long, one delay per fetch
    pub fn delay_fetches(&self, delays: impl IntoIterator<Item = Duration>) {
        self.fetch_delays.lock().unwrap().extend(delays);
    }

    pub fn committed(&self) -> Vec<Event> {
        self.committed.lock().unwrap().clone()
    }

    pub fn commit_attempts(&self) -> Vec<Instant> {
        self.commit_attempts.lock().unwrap().clone()
    }

    /// Start time and `force_full_refresh` flag of every fetch
    pub fn fetches(&self) -> Vec<(Instant, bool)> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn fetch_checker_specs(&self, force_full_refresh: bool) -> Vec<CheckerSpec> {
        self.fetches.lock().unwrap().push((Instant::now(), force_full_refresh));
        let delay = self.fetch_delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.specs.lock().unwrap().clone()
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn commit_event(&self, event: &Event) -> Result<(), DatastoreError> {
        self.commit_attempts.lock().unwrap().push(Instant::now());
        let failing = self.failing_commits.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_commits.store(failing - 1, Ordering::SeqCst);
            return Err(DatastoreError::Connection("injected failure".into()));
        }
        self.committed.lock().unwrap().push(event.clone());
        Ok(())
    }
}

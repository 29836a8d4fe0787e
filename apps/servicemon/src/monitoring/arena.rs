//! Keyed store of the services being monitored.
//!
//! Entries are replaced wholesale on every refresh, but the mutable part of
//! a service (last status and version) lives behind its own mutex that is
//! handed from one entry to the next, so a check that was running during a
//! refresh still updates the live state.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use super::checker::{CheckDefaults, Checker};
use super::registry::CheckerRegistry;
use super::types::ServiceStatus;
use crate::database::models::CheckerSpec;

/// Last known state of one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    pub status: ServiceStatus,
    pub version: Option<String>,
}

pub struct MonitoredService {
    pub spec: CheckerSpec,
    pub checker: Box<dyn Checker>,
    state: Arc<Mutex<ServiceState>>,
}

impl MonitoredService {
    pub fn new(spec: CheckerSpec, checker: Box<dyn Checker>) -> Self {
        let state = ServiceState { status: spec.status, version: spec.version.clone() };
        Self { spec, checker, state: Arc::new(Mutex::new(state)) }
    }

    /// New configuration, same live state
    fn succeed(&self, spec: CheckerSpec, checker: Box<dyn Checker>) -> Self {
        Self { spec, checker, state: Arc::clone(&self.state) }
    }

    pub fn id(&self) -> i64 {
        self.spec.id
    }

    /// Lock the live state. A panic while holding the lock cannot leave the
    /// state half-written, so poisoning is ignored.
    pub fn state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> ServiceStatus {
        self.state().status
    }
}

impl std::fmt::Debug for MonitoredService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoredService")
            .field("id", &self.spec.id)
            .field("handler", &self.spec.handler)
            .field("sysname", &self.spec.sysname)
            .field("state", &*self.state())
            .finish()
    }
}

impl std::fmt::Display for MonitoredService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} (service {})", self.spec.sysname, self.spec.handler, self.spec.id)
    }
}

/// What a merge did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    /// Services whose checker could not be built
    pub failed: usize,
}

#[derive(Default)]
pub struct CheckerArena {
    services: BTreeMap<i64, Arc<MonitoredService>>,
}

impl CheckerArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&Arc<MonitoredService>> {
        self.services.get(&id)
    }

    /// Handles to every scheduled service, ordered by id
    pub fn services(&self) -> Vec<Arc<MonitoredService>> {
        self.services.values().cloned().collect()
    }

    /// Replace the arena contents with `fresh`.
    ///
    /// Known ids keep their state. An empty refresh only clears the arena
    /// when the datastore is reachable, since an unreachable datastore
    /// yields the cached (possibly empty) list.
    pub fn merge(
        &mut self,
        fresh: Vec<CheckerSpec>,
        registry: &CheckerRegistry,
        defaults: &CheckDefaults,
        reachable: bool,
    ) -> MergeSummary {
        let mut summary = MergeSummary::default();

        if fresh.is_empty() {
            if reachable && !self.services.is_empty() {
                info!("Datastore returned no services, clearing {} checkers", self.services.len());
                summary.removed = self.services.len();
                self.services.clear();
            } else if !self.services.is_empty() {
                warn!("Empty refresh while datastore is unreachable, keeping {} checkers", self.services.len());
            }
            return summary;
        }

        let mut next = BTreeMap::new();
        for spec in fresh {
            if !spec.active {
                debug!("Skipping inactive service {}", spec.id);
                continue;
            }
            if next.contains_key(&spec.id) {
                warn!("Duplicate service id {} in refresh, ignoring {}:{}", spec.id, spec.sysname, spec.handler);
                continue;
            }

            let id = spec.id;
            let service = match self.services.get(&id) {
                Some(existing) if existing.spec.same_target(&spec) => {
                    summary.unchanged += 1;
                    Arc::clone(existing)
                }
                existing => match registry.build(&spec, defaults) {
                    Ok(checker) => match existing {
                        Some(existing) => {
                            summary.updated += 1;
                            Arc::new(existing.succeed(spec, checker))
                        }
                        None => {
                            summary.added += 1;
                            Arc::new(MonitoredService::new(spec, checker))
                        }
                    },
                    Err(e) => {
                        warn!("Cannot check {}:{} (service {}): {}", spec.sysname, spec.handler, id, e);
                        summary.failed += 1;
                        continue;
                    }
                },
            };
            next.insert(id, service);
        }

        summary.removed = self.services.keys().filter(|id| !next.contains_key(id)).count();
        self.services = next;
        summary
    }
}

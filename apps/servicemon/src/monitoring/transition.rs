use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::arena::MonitoredService;
use super::types::Verdict;
use crate::database::models::Event;
use crate::database::writer::EventQueue;

/// A finished execution on its way to the result handler
#[derive(Debug)]
pub struct CheckOutcome {
    pub service: Arc<MonitoredService>,
    pub verdict: Verdict,
}

/// Apply `verdict` to the service state and return the events it causes.
///
/// The state lock is held for the whole comparison, so two results for the
/// same service racing each other report a transition at most once.
pub fn record_verdict(service: &MonitoredService, verdict: &Verdict) -> Vec<Event> {
    let mut events = Vec::new();
    let mut state = service.state();

    let previous = state.status;
    if previous.is_transition(verdict.status) {
        info!("{} is {} (was {}): {}", service, verdict.status, previous, verdict.info);
        events.push(Event::service_state(&service.spec, verdict.status, verdict.info.clone()));
    } else if previous != verdict.status {
        debug!("{} is {}: {}", service, verdict.status, verdict.info);
    }
    state.status = verdict.status;

    if let Some(version) = &verdict.version {
        if state.version.as_ref() != Some(version) {
            info!("{} reports version {}", service, version);
            events.push(Event::version(&service.spec, version.clone()));
            state.version = Some(version.clone());
        }
    }

    events
}

/// Consumes check outcomes and feeds the resulting events to the writer
#[derive(Clone)]
pub struct ResultHandler {
    events: EventQueue,
}

impl ResultHandler {
    pub fn new(events: EventQueue) -> Self {
        Self { events }
    }

    pub fn handle(&self, outcome: CheckOutcome) {
        for event in record_verdict(&outcome.service, &outcome.verdict) {
            self.events.enqueue(event);
        }
    }

    /// Handle outcomes until every sender is gone
    pub async fn run(self, mut outcomes: mpsc::UnboundedReceiver<CheckOutcome>) {
        while let Some(outcome) = outcomes.recv().await {
            self.handle(outcome);
        }
        debug!("Result handler stopped");
    }
}

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::arena::{CheckerArena, MergeSummary};
use super::checker::CheckDefaults;
use super::registry::CheckerRegistry;
use super::run_queue::RunQueue;
use crate::database::gateway::Datastore;
use crate::database::writer::WriterHandle;

/// Lifecycle of the scheduling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Initializing,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub check_interval: Duration,
    /// How long running checks may take to finish on shutdown
    pub terminate_grace: Duration,
}

/// Owns the arena and drives the check cycles
pub struct Controller {
    config: ControllerConfig,
    datastore: Arc<dyn Datastore>,
    registry: Arc<CheckerRegistry>,
    defaults: CheckDefaults,
    arena: CheckerArena,
    run_queue: RunQueue,
    writer: Option<WriterHandle>,
    state: watch::Sender<ControllerState>,
    full_refresh: bool,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        datastore: Arc<dyn Datastore>,
        registry: Arc<CheckerRegistry>,
        defaults: CheckDefaults,
        run_queue: RunQueue,
        writer: Option<WriterHandle>,
    ) -> Self {
        let (state, _) = watch::channel(ControllerState::Initializing);
        Self {
            config,
            datastore,
            registry,
            defaults,
            arena: CheckerArena::new(),
            run_queue,
            writer,
            state,
            full_refresh: true,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    pub fn arena(&self) -> &CheckerArena {
        &self.arena
    }

    fn set_state(&self, state: ControllerState) {
        debug!("Controller state: {:?}", state);
        self.state.send_replace(state);
    }

    /// Reload checker definitions and merge them into the arena.
    ///
    /// Last-known status is only read from the datastore until the first
    /// refresh that reached it.
    pub async fn refresh(&mut self) -> MergeSummary {
        let specs = self.datastore.fetch_checker_specs(self.full_refresh).await;
        let reachable = self.datastore.is_reachable();
        if reachable {
            self.full_refresh = false;
        }

        let summary = self.arena.merge(specs, &self.registry, &self.defaults, reachable);
        if summary.added + summary.updated + summary.removed > 0 {
            info!(
                added = summary.added,
                updated = summary.updated,
                removed = summary.removed,
                failed = summary.failed,
                "Refreshed checkers, {} scheduled",
                self.arena.len()
            );
        }
        summary
    }

    /// One cycle: refresh, spread the checks over the interval, then wait
    /// for the next interval boundary. Returns false once cancelled.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> bool {
        let interval = self.config.check_interval;
        let started = Instant::now();

        self.refresh().await;
        if cancel.is_cancelled() {
            return false;
        }

        let elapsed = started.elapsed();
        let budget = if elapsed >= interval {
            warn!("Refresh took {:.1}s, longer than the check interval; correcting for clock drift", elapsed.as_secs_f64());
            interval
        } else {
            interval - elapsed
        };

        let mut services = self.arena.services();
        services.shuffle(&mut rand::thread_rng());
        if !services.is_empty() {
            let pause = budget / u32::try_from(services.len() * 2).unwrap_or(u32::MAX);
            debug!("Dispatching {} checks, {:.2}s apart", services.len(), pause.as_secs_f64());
            for (index, service) in services.into_iter().enumerate() {
                if index > 0 && !sleep_or_cancel(pause, cancel).await {
                    return false;
                }
                self.run_queue.enqueue(service);
            }
        }

        let now = Instant::now();
        let elapsed = now - started;
        let wait = if elapsed < interval {
            interval - elapsed
        } else {
            let overrun = elapsed - interval;
            warn!("Cycle overran the check interval by {:.1}s", overrun.as_secs_f64());
            let into_interval = overrun.as_nanos() % interval.as_nanos().max(1);
            interval - Duration::from_nanos(u64::try_from(into_interval).unwrap_or(0))
        };
        sleep_until_or_cancel(now + wait, cancel).await
    }

    /// Run cycles until `cancel` fires, then drain the workers and flush
    /// the event writer.
    pub async fn run(mut self, cancel: CancellationToken) {
        self.set_state(ControllerState::Running);
        info!("Checking services every {}s", self.config.check_interval.as_secs());

        while self.run_cycle(&cancel).await {}

        info!("Shutting down");
        self.set_state(ControllerState::Draining);
        let Self { run_queue, writer, state, config, .. } = self;
        run_queue.terminate(config.terminate_grace).await;
        if let Some(writer) = writer {
            writer.shutdown().await;
        }
        debug!("Controller state: {:?}", ControllerState::Stopped);
        state.send_replace(ControllerState::Stopped);
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

async fn sleep_until_or_cancel(deadline: Instant, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep_until(deadline) => true,
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::arena::MonitoredService;
use super::executor::CheckExecutor;
use super::transition::{CheckOutcome, ResultHandler};

type Jobs = Arc<Mutex<mpsc::UnboundedReceiver<Arc<MonitoredService>>>>;

/// Fixed pool of workers pulling services from one FIFO queue
pub struct RunQueue {
    jobs: mpsc::UnboundedSender<Arc<MonitoredService>>,
    workers: JoinSet<()>,
    results: JoinHandle<()>,
    stop: CancellationToken,
}

impl RunQueue {
    /// Spawn `max_workers` workers and the result handling task.
    pub fn new(max_workers: usize, executor: Arc<CheckExecutor>, handler: ResultHandler) -> Self {
        let (jobs, job_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let job_rx: Jobs = Arc::new(Mutex::new(job_rx));
        let stop = CancellationToken::new();

        let mut workers = JoinSet::new();
        for worker in 0..max_workers.max(1) {
            workers.spawn(work(worker, Arc::clone(&job_rx), Arc::clone(&executor), result_tx.clone(), stop.clone()));
        }
        let results = tokio::spawn(handler.run(result_rx));
        info!("Started {} check workers", workers.len());

        Self { jobs, workers, results, stop }
    }

    /// Queue one execution; never blocks
    pub fn enqueue(&self, service: Arc<MonitoredService>) {
        if let Err(mpsc::error::SendError(service)) = self.jobs.send(service) {
            warn!("Run queue is closed, not checking {}", service);
        }
    }

    /// Stop taking jobs and wait up to `grace` for running checks and the
    /// result handler. Anything still running after that is aborted.
    pub async fn terminate(self, grace: Duration) {
        let Self { jobs, mut workers, mut results, stop } = self;
        stop.cancel();
        drop(jobs);

        let drained = timeout(grace, async { while workers.join_next().await.is_some() {} }).await;
        if drained.is_err() {
            warn!("{} checks still running after {:?}, aborting them", workers.len(), grace);
            workers.shutdown().await;
        }

        // Workers own the only result senders, so the handler is finishing.
        if timeout(grace, &mut results).await.is_err() {
            warn!("Result handler did not finish within {:?}, aborting it", grace);
            results.abort();
        }
        debug!("Run queue terminated");
    }
}

async fn work(
    worker: usize,
    jobs: Jobs,
    executor: Arc<CheckExecutor>,
    results: mpsc::UnboundedSender<CheckOutcome>,
    stop: CancellationToken,
) {
    loop {
        let next = {
            let mut jobs = jobs.lock().await;
            tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                job = jobs.recv() => job,
            }
        };
        let Some(service) = next else { break };

        debug!(worker, "Checking {}", service);
        let verdict = executor.execute(&service).await;
        if results.send(CheckOutcome { service, verdict }).is_err() {
            break;
        }
    }
    debug!(worker, "Check worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::writer::EventWriter;
    use crate::monitoring::types::{ServiceStatus, Verdict};
    use crate::testing::{MemoryDatastore, ScriptedChecker, monitored, spec};
    use std::sync::atomic::Ordering;

    fn handler() -> (ResultHandler, EventWriter) {
        let store = Arc::new(MemoryDatastore::new(vec![]));
        let (queue, writer) = EventWriter::channel(store, Default::default());
        (ResultHandler::new(queue), writer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_run_queued_services() {
        let (handler, _writer) = handler();
        let queue = RunQueue::new(2, Arc::new(CheckExecutor::new(0, Duration::ZERO)), handler);

        let services: Vec<_> = (1..=5)
            .map(|id| monitored(spec(id, "fake"), ScriptedChecker::always(Verdict::down("refused"))))
            .collect();
        for service in &services {
            queue.enqueue(Arc::clone(service));
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.terminate(Duration::from_secs(5)).await;

        for service in &services {
            assert_eq!(service.status(), ServiceStatus::Down);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_aborts_hung_checks_after_grace() {
        let (handler, _writer) = handler();
        // The executor gives up after 600s; the grace period is much shorter.
        let queue = RunQueue::new(1, Arc::new(CheckExecutor::new(0, Duration::ZERO)), handler);

        let checker = ScriptedChecker::hanging(Duration::from_secs(600));
        let calls = checker.calls();
        let service = monitored(spec(1, "fake"), checker);
        queue.enqueue(Arc::clone(&service));
        queue.enqueue(Arc::clone(&service));
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        queue.terminate(Duration::from_secs(2)).await;

        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "queued job must not start after terminate");
        assert_eq!(service.status(), ServiceStatus::Unknown);
    }
}

//! Single consumer of the event queue.
//!
//! Producers append through [`EventQueue`]. The writer commits events one by
//! one; an event that fails to commit goes back to the tail of the queue and
//! the writer sleeps for the retry backoff before taking the next one.
//! Delivery is at-least-once with unbounded retries unless a cap is set.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::gateway::Datastore;
use super::models::Event;

/// Writer tuning
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Pause after a failed commit
    pub retry_backoff: Duration,
    /// Time allowed for the final flush on shutdown
    pub flush_timeout: Duration,
    /// Events held beyond this are logged and dropped
    pub max_pending: Option<usize>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self { retry_backoff: Duration::from_secs(5), flush_timeout: Duration::from_secs(10), max_pending: None }
    }
}

/// Counters reported when the writer stops
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub committed: u64,
    pub retried: u64,
    pub dropped: u64,
}

/// Producer side of the event queue; cheap to clone
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventQueue {
    pub fn enqueue(&self, event: Event) {
        debug!("Queueing event: {}", event);
        if let Err(mpsc::error::SendError(event)) = self.tx.send(event) {
            error!("Event writer has stopped, losing event: {}", event);
        }
    }
}

pub struct EventWriter {
    store: Arc<dyn Datastore>,
    rx: mpsc::UnboundedReceiver<Event>,
    pending: VecDeque<Event>,
    config: WriterConfig,
    stats: WriterStats,
}

/// Running writer task
pub struct WriterHandle {
    stop: CancellationToken,
    task: JoinHandle<WriterStats>,
}

impl WriterHandle {
    /// Ask the writer to flush what it holds and wait for it to finish
    pub async fn shutdown(self) -> WriterStats {
        self.stop.cancel();
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Event writer task failed: {}", e);
                WriterStats::default()
            }
        }
    }
}

impl EventWriter {
    /// Create the queue and its writer
    pub fn channel(store: Arc<dyn Datastore>, config: WriterConfig) -> (EventQueue, EventWriter) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer =
            EventWriter { store, rx, pending: VecDeque::new(), config, stats: WriterStats::default() };
        (EventQueue { tx }, writer)
    }

    pub fn spawn(self) -> WriterHandle {
        let stop = CancellationToken::new();
        let task = tokio::spawn(self.run(stop.clone()));
        WriterHandle { stop, task }
    }

    /// Commit events until `stop` fires or every producer is gone
    pub async fn run(mut self, stop: CancellationToken) -> WriterStats {
        info!("Event writer started");
        loop {
            self.drain_incoming();

            let event = match self.pending.pop_front() {
                Some(event) => event,
                None => tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    received = self.rx.recv() => match received {
                        Some(event) => event,
                        None => break,
                    },
                },
            };

            match self.store.commit_event(&event).await {
                Ok(()) => {
                    self.stats.committed += 1;
                    debug!("Committed event: {}", event);
                }
                Err(e) => {
                    warn!("Failed to commit event, rescheduling: {} ({})", event, e);
                    self.stats.retried += 1;
                    self.push(event);
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(self.config.retry_backoff) => {}
                    }
                }
            }
        }

        self.flush().await;
        info!(
            committed = self.stats.committed,
            retried = self.stats.retried,
            dropped = self.stats.dropped,
            "Event writer stopped"
        );
        self.stats
    }

    fn drain_incoming(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.push(event);
        }
    }

    fn push(&mut self, event: Event) {
        if let Some(max) = self.config.max_pending {
            if self.pending.len() >= max {
                error!("Event retry queue is full ({} events), dropping: {}", max, event);
                self.stats.dropped += 1;
                return;
            }
        }
        self.pending.push_back(event);
    }

    /// One last attempt per queued event, bounded by the flush timeout.
    async fn flush(&mut self) {
        self.rx.close();
        self.drain_incoming();
        if self.pending.is_empty() {
            return;
        }

        info!("Flushing {} queued events", self.pending.len());
        let store = Arc::clone(&self.store);
        let pending = &mut self.pending;
        let stats = &mut self.stats;
        let flushed = tokio::time::timeout(self.config.flush_timeout, async {
            while let Some(event) = pending.pop_front() {
                match store.commit_event(&event).await {
                    Ok(()) => stats.committed += 1,
                    Err(e) => {
                        error!("Dropping event at shutdown: {} ({})", event, e);
                        stats.dropped += 1;
                    }
                }
            }
        })
        .await;

        if flushed.is_err() {
            error!("Flush timed out, dropping {} events", self.pending.len());
            for event in self.pending.drain(..) {
                error!("Dropped event: {}", event);
                self.stats.dropped += 1;
            }
        }
    }
}

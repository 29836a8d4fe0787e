use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info};

use super::arena::MonitoredService;
use super::checker::{Checker, error_chain};
use super::types::Verdict;
use crate::error::CheckerError;

/// Extra time granted on top of a checker's own timeout before the
/// execution is abandoned.
const TIMEOUT_SLACK: Duration = Duration::from_secs(1);

/// Runs checkers and turns every outcome into a verdict
#[derive(Debug, Clone)]
pub struct CheckExecutor {
    /// Re-runs used to confirm a status change
    retry: u32,
    retry_delay: Duration,
}

impl CheckExecutor {
    pub fn new(retry: u32, retry_delay: Duration) -> Self {
        Self { retry, retry_delay }
    }

    /// One execution. Checker errors and hangs become DOWN verdicts.
    pub async fn run_once(&self, checker: &dyn Checker) -> Verdict {
        let limit = checker.timeout().saturating_add(TIMEOUT_SLACK);
        match timeout(limit, checker.execute()).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => Verdict::down(error_chain(&e)),
            Err(_) => Verdict::down(CheckerError::Timeout(limit).to_string()),
        }
    }

    /// Execute a service's checker, confirming any status change.
    ///
    /// When the verdict would be reported as a transition, the check is
    /// repeated up to `retry` times. Retrying stops at the first verdict
    /// that would no longer be reported.
    pub async fn execute(&self, service: &MonitoredService) -> Verdict {
        let previous = service.status();
        let mut verdict = self.run_once(service.checker.as_ref()).await;
        if !previous.is_transition(verdict.status) {
            return verdict;
        }

        for attempt in 1..=self.retry {
            debug!("{} looks {}, confirming ({}/{}): {}", service, verdict.status, attempt, self.retry, verdict.info);
            tokio::time::sleep(self.retry_delay).await;

            let retried = self.run_once(service.checker.as_ref()).await;
            if !previous.is_transition(retried.status) {
                info!("{} is {} after {} retries, ignoring glitch", service, retried.status, attempt);
                return retried;
            }
            verdict = retried;
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::types::ServiceStatus;
    use crate::testing::{ScriptedChecker, monitored, spec};
    use std::sync::atomic::Ordering;

    #[tokio::test(start_paused = true)]
    async fn test_checker_error_is_down() {
        let executor = CheckExecutor::new(0, Duration::from_secs(5));
        let verdict = executor.run_once(&ScriptedChecker::failing("connection reset")).await;

        assert_eq!(verdict.status, ServiceStatus::Down);
        assert!(verdict.info.contains("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_checker_is_down() {
        let executor = CheckExecutor::new(0, Duration::from_secs(5));
        let started = tokio::time::Instant::now();
        let verdict = executor.run_once(&ScriptedChecker::hanging(Duration::from_secs(2))).await;

        assert_eq!(verdict.status, ServiceStatus::Down);
        assert!(verdict.info.contains("timeout"));
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_status_is_not_retried() {
        let executor = CheckExecutor::new(3, Duration::from_secs(5));
        let checker = ScriptedChecker::always(Verdict::down("refused"));
        let calls = checker.calls();

        let mut spec = spec(1, "fake");
        spec.status = ServiceStatus::Down;
        let service = monitored(spec, checker);

        assert_eq!(executor.execute(&service).await.status, ServiceStatus::Down);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_glitch_is_discarded() {
        let executor = CheckExecutor::new(3, Duration::from_secs(5));
        let checker = ScriptedChecker::sequence(vec![Verdict::down("timeout"), Verdict::up("OK (200)")]);
        let calls = checker.calls();

        let mut spec = spec(1, "fake");
        spec.status = ServiceStatus::Up;
        let service = monitored(spec, checker);

        let started = tokio::time::Instant::now();
        let verdict = executor.execute(&service).await;
        assert_eq!(verdict.status, ServiceStatus::Up);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_change_after_all_retries() {
        let executor = CheckExecutor::new(3, Duration::from_secs(5));
        let checker = ScriptedChecker::always(Verdict::down("refused"));
        let calls = checker.calls();

        let mut spec = spec(1, "fake");
        spec.status = ServiceStatus::Up;
        let service = monitored(spec, checker);

        assert_eq!(executor.execute(&service).await.status, ServiceStatus::Down);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_stops_retrying_once_up() {
        let executor = CheckExecutor::new(3, Duration::from_secs(5));
        let checker = ScriptedChecker::sequence(vec![Verdict::down("refused"), Verdict::up("OK")]);
        let calls = checker.calls();
        let service = monitored(spec(1, "fake"), checker);

        let started = tokio::time::Instant::now();
        assert_eq!(executor.execute(&service).await.status, ServiceStatus::Up);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_going_up_needs_no_confirmation() {
        let executor = CheckExecutor::new(3, Duration::from_secs(5));
        let checker = ScriptedChecker::always(Verdict::up("OK"));
        let calls = checker.calls();
        let service = monitored(spec(1, "fake"), checker);

        assert_eq!(executor.execute(&service).await.status, ServiceStatus::Up);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

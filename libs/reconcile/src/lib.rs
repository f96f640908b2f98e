//! Reconciliation loop primitives.
//!
//! This library provides the scheduling side of a reconciler:
//!
//! - **Scheduler**: runs a named reconciliation function once inline, then
//!   periodically in a background task until shutdown is signalled.
//! - **Join barrier**: every loop (and any other long-lived task handed to
//!   the scheduler) is tracked so the caller can wait for all of them.
//! - **Backoff**: exponential delay policy for restart loops.
//!
//! # Invariants
//!
//! - A failing first run is returned to the caller; no loop is started
//! - Errors from later runs are logged and never stop the loop
//! - Ticks of one schedule never overlap; the next sleep starts after the
//!   previous run returns
//! - Shutdown wins over a due tick

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// The first run of a schedule failed; the loop was not started.
#[derive(Debug, Error)]
#[error("reconciling {name} failed")]
pub struct ScheduleError<E: std::error::Error + 'static> {
    /// Schedule name.
    pub name: String,

    /// Error returned by the first run.
    #[source]
    pub source: E,
}

/// Periodic reconciliation driver with a shared shutdown signal.
pub struct Scheduler {
    /// Shutdown signal shared by every loop.
    shutdown: watch::Receiver<bool>,

    /// Running loops and supervised tasks.
    tasks: JoinSet<()>,
}

impl Scheduler {
    /// Create a scheduler bound to a shutdown signal.
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            shutdown,
            tasks: JoinSet::new(),
        }
    }

    /// Get a copy of the shutdown signal.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    /// Number of tasks currently tracked.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if no task is tracked.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run `reconcile` now, then every `interval` until shutdown.
    ///
    /// Only an error from the first run is returned. Errors from periodic
    /// runs are logged at warning level and the loop keeps going.
    pub async fn schedule<F, Fut, E>(
        &mut self,
        interval: Duration,
        name: &str,
        mut reconcile: F,
    ) -> Result<(), ScheduleError<E>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        debug!(name, "Reconciling");
        reconcile().await.map_err(|source| ScheduleError {
            name: name.to_string(),
            source,
        })?;

        let name = name.to_string();
        let mut shutdown = self.shutdown.clone();

        self.tasks.spawn(async move {
            debug!(name = %name, interval_secs = interval.as_secs(), "Starting reconcile loop");

            loop {
                tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut shutdown) => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                debug!(name = %name, "Reconciling");
                if let Err(e) = reconcile().await {
                    warn!(name = %name, error = %ErrorChain(&e), "Reconciling failed");
                }
            }

            debug!(name = %name, "Stopped reconcile loop");
        });

        Ok(())
    }

    /// Track an arbitrary long-lived task in the join barrier.
    ///
    /// The task is expected to observe the shutdown signal on its own.
    pub fn spawn<Fut>(&mut self, name: &str, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        debug!(name, "Starting task");
        self.tasks.spawn(task);
    }

    /// Wait until every tracked task has exited.
    pub async fn wait(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "Reconcile task panicked");
                }
            }
        }
    }

    /// Abort every tracked task and wait for them to unwind.
    pub async fn abort(mut self) {
        self.tasks.shutdown().await;
    }
}

/// Resolve once shutdown has been signalled (or the sender is gone).
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Displays an error together with its source chain.
pub struct ErrorChain<'a>(pub &'a (dyn std::error::Error + 'static));

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(cause) = source {
            write!(f, ": {}", cause)?;
            source = cause.source();
        }
        Ok(())
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for the first retry. Zero disables backoff.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Policy that never waits.
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }

        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(32) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = if self.jitter > 0.0 {
            delay * self.jitter * rand::random::<f64>()
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter) as u64)
    }
}

/// Attempt counter driving a `BackoffPolicy`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Create a counter starting at attempt zero.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay for the next retry; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Current attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    fn counting(
        calls: &Arc<AtomicUsize>,
        fail_on: &'static [usize],
    ) -> impl FnMut() -> std::future::Ready<Result<(), Boom>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if fail_on.contains(&n) {
                std::future::ready(Err(Boom))
            } else {
                std::future::ready(Ok(()))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_error_is_returned_and_no_loop_started() {
        let (_tx, rx) = watch::channel(false);
        let mut scheduler = Scheduler::new(rx);
        let calls = Arc::new(AtomicUsize::new(0));

        let err = scheduler
            .schedule(Duration::from_secs(10), "haproxy", counting(&calls, &[0]))
            .await
            .unwrap_err();

        assert_eq!(err.name, "haproxy");
        assert_eq!(err.to_string(), "reconciling haproxy failed");
        assert!(scheduler.is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_every_interval_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let mut scheduler = Scheduler::new(rx);
        let calls = Arc::new(AtomicUsize::new(0));

        scheduler
            .schedule(Duration::from_secs(10), "firewall", counting(&calls, &[]))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        tx.send(true).unwrap();
        scheduler.wait().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_errors_do_not_stop_the_loop() {
        let (tx, rx) = watch::channel(false);
        let mut scheduler = Scheduler::new(rx);
        let calls = Arc::new(AtomicUsize::new(0));

        scheduler
            .schedule(Duration::from_secs(1), "flaky", counting(&calls, &[1, 2]))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        tx.send(true).unwrap();
        scheduler.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_first_tick_stops_loop() {
        let (tx, rx) = watch::channel(false);
        let mut scheduler = Scheduler::new(rx);
        let calls = Arc::new(AtomicUsize::new(0));

        scheduler
            .schedule(Duration::from_secs(300), "haproxy", counting(&calls, &[]))
            .await
            .unwrap();
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), scheduler.wait())
            .await
            .expect("loop should exit on shutdown");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spawned_tasks_join_barrier() {
        let (tx, rx) = watch::channel(false);
        let mut scheduler = Scheduler::new(rx);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let mut shutdown = scheduler.shutdown_signal();
            let done = Arc::clone(&done);
            scheduler.spawn("worker", async move {
                wait_for_shutdown(&mut shutdown).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(scheduler.len(), 2);

        tx.send(true).unwrap();
        scheduler.wait().await;
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(1000),
            max: Duration::from_secs(10),
            jitter: 0.5,
        };

        for _ in 0..50 {
            let delay = policy.delay(0);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_backoff_none_never_waits() {
        let mut backoff = Backoff::new(BackoffPolicy::none());
        for _ in 0..5 {
            assert_eq!(backoff.next_delay(), Duration::ZERO);
        }
    }

    #[test]
    fn test_backoff_counter_reset() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_secs(1),
            jitter: 0.0,
        });

        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }
}

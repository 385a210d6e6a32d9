//! Repeating task execution.
//!
//! Every worker component implements [`WorkerTask`]: one call performs one
//! pass and returns the delay before the next. [`TaskRunner`] drives
//! `instance_count` independent loops of a task until cancelled.
//!
//! A failed pass is logged and counted, then the loop sleeps for the
//! configured exception delay. Failures never stop a loop; only the
//! cancellation token does.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use recon_core::error::{Error, Result};
use recon_core::observability::task_span;

use crate::config::TaskConfig;
use crate::metrics;

/// Pause returned by queue-driven tasks when their queue was empty.
pub const IDLE_DELAY: Duration = Duration::from_secs(15);

/// One repeatable unit of background work.
#[async_trait]
pub trait WorkerTask: Send + Sync + 'static {
    /// Task name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Runs a single pass and returns how long to wait before the next one.
    async fn run_once(&self, instance: usize) -> Result<Duration>;
}

/// Drives concurrent instances of a task.
pub struct TaskRunner {
    task: Arc<dyn WorkerTask>,
    config: TaskConfig,
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("task", &self.task.name())
            .field("config", &self.config)
            .finish()
    }
}

impl TaskRunner {
    /// Creates a runner for `task`.
    #[must_use]
    pub fn new(task: Arc<dyn WorkerTask>, config: TaskConfig) -> Self {
        Self { task, config }
    }

    /// Starts all instances and waits until they have stopped.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if an instance panicked.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let handles: Vec<JoinHandle<()>> = (0..self.config.instance_count.max(1))
            .map(|instance| {
                let task = Arc::clone(&self.task);
                let cancel = cancel.clone();
                let delay_on_exception = self.config.delay_on_exception();
                let span = task_span(task.name(), instance);
                tokio::spawn(
                    run_instance(task, instance, delay_on_exception, cancel).instrument(span),
                )
            })
            .collect();

        tracing::info!(
            task = self.task.name(),
            instances = handles.len(),
            "task started"
        );

        let mut panicked = 0usize;
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(task = self.task.name(), error = %e, "task instance panicked");
                panicked += 1;
            }
        }

        tracing::info!(task = self.task.name(), "task stopped");
        if panicked > 0 {
            return Err(Error::Internal {
                message: format!("{panicked} instance(s) of {} panicked", self.task.name()),
            });
        }
        Ok(())
    }
}

/// Runs one pass of `task` outside the loop, recording the outcome.
///
/// # Errors
///
/// Returns the error of the failed pass.
pub async fn run_single_pass(task: &dyn WorkerTask, instance: usize) -> Result<Duration> {
    let started = Instant::now();
    let result = task.run_once(instance).await;
    metrics::record_pass(task.name(), started.elapsed(), result.is_err());
    result
}

async fn run_instance(
    task: Arc<dyn WorkerTask>,
    instance: usize,
    delay_on_exception: Duration,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        let delay = match run_single_pass(task.as_ref(), instance).await {
            Ok(delay) => delay,
            Err(e) => {
                tracing::error!(error = %e, "task pass failed");
                delay_on_exception
            }
        };

        if delay.is_zero() {
            // Yield so a busy loop still observes cancellation.
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        passes: AtomicUsize,
        fail_first: bool,
        cancel_after: usize,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl WorkerTask for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run_once(&self, _instance: usize) -> Result<Duration> {
            let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
            if pass >= self.cancel_after {
                self.cancel.cancel();
            }
            if self.fail_first && pass == 1 {
                return Err(Error::storage("unavailable"));
            }
            Ok(Duration::from_secs(1))
        }
    }

    fn counting(fail_first: bool, cancel_after: usize) -> (Arc<Counting>, CancellationToken) {
        let cancel = CancellationToken::new();
        let task = Arc::new(Counting {
            passes: AtomicUsize::new(0),
            fail_first,
            cancel_after,
            cancel: cancel.clone(),
        });
        (task, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn runs_until_cancelled() {
        let (task, cancel) = counting(false, 3);
        let runner = TaskRunner::new(task.clone(), TaskConfig::default());
        runner.run(cancel).await.expect("run");
        assert_eq!(task.passes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_loop() {
        let (task, cancel) = counting(true, 2);
        let runner = TaskRunner::new(task.clone(), TaskConfig::default());
        runner.run(cancel).await.expect("run");
        assert_eq!(task.passes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_configured_instances() {
        let (task, cancel) = counting(false, usize::MAX);
        let config = TaskConfig {
            instance_count: 4,
            ..TaskConfig::default()
        };
        let runner = TaskRunner::new(task.clone(), config);
        cancel.cancel();
        runner.run(cancel).await.expect("run");
        assert_eq!(task.passes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn single_pass_propagates_errors() {
        let (task, _cancel) = counting(true, usize::MAX);
        let err = run_single_pass(task.as_ref(), 0).await.expect_err("first pass fails");
        assert!(err.is_transient());
        let delay = run_single_pass(task.as_ref(), 0).await.expect("second pass");
        assert_eq!(delay, Duration::from_secs(1));
    }
}

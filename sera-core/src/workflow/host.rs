//! Embedded durable-execution runtime.
//!
//! Coordinators advance single-threaded through explicit suspension points:
//! activity calls, child coordinators, and condition waits over signal
//! state. Each completed step is checkpointed to the run journal, so a
//! process crash between any two steps resumes without re-doing completed
//! work — replay returns recorded results and the first unrecorded step runs
//! live. Coordinators themselves never read the clock or touch the
//! filesystem; everything effectful lives behind an activity.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{OrganizeError, Result};
use crate::workflow::journal::{ActivityOutcome, Journal};
use crate::workflow::progress::{ProgressRegistry, Signal, SignalStore};

/// Liveness beacon for long-running activities. Transfers beat this on a
/// 30 s cadence; the watchdog aborts an attempt whose beacon goes stale.
#[derive(Clone)]
pub struct Heartbeat {
    last: Arc<Mutex<Instant>>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn beat(&self) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// Handed to every activity attempt.
pub struct ActivityContext {
    pub heartbeat: Heartbeat,
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ActivityOptions {
    pub start_to_close: Duration,
    pub heartbeat_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl ActivityOptions {
    /// Local filesystem work.
    pub fn quick() -> Self {
        Self {
            start_to_close: Duration::from_secs(30),
            heartbeat_timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Catalogue and other short network calls.
    pub fn network() -> Self {
        Self {
            start_to_close: Duration::from_secs(60),
            heartbeat_timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Bulk transfers: generous budget, liveness enforced by heartbeat.
    pub fn transfer() -> Self {
        Self {
            start_to_close: Duration::from_secs(2 * 60 * 60),
            heartbeat_timeout: Some(Duration::from_secs(120)),
            retry: RetryPolicy::default(),
        }
    }

    /// Model calls and subtitle extraction.
    pub fn slow() -> Self {
        Self {
            start_to_close: Duration::from_secs(300),
            heartbeat_timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-coordinator execution context. Child coordinators share the signal
/// hub, progress registry, and activity gate of their parent but own a
/// private journal, so a crash mid-disc resumes that disc's own history.
pub struct WorkflowCtx {
    workflow_id: String,
    run_dir: PathBuf,
    journal: Arc<Journal>,
    signals: Arc<crate::workflow::progress::SignalHub>,
    progress: Arc<ProgressRegistry>,
    activity_gate: Arc<Semaphore>,
    next_seq: AtomicU64,
}

impl WorkflowCtx {
    /// Open (or resume) the root context for one run. Signals journaled by a
    /// previous incarnation are restored into the store before the
    /// coordinator observes anything.
    pub async fn open_root(
        workflow_id: &str,
        run_dir: PathBuf,
        max_concurrent_activities: usize,
    ) -> Result<Self> {
        let journal = Journal::open(run_dir.join("workflow.journal")).await?;
        let signals = Arc::new(crate::workflow::progress::SignalHub::default());
        for signal in journal.recorded_signals().await {
            signals.apply(signal).await;
        }
        Ok(Self {
            workflow_id: workflow_id.to_string(),
            run_dir,
            journal: Arc::new(journal),
            signals,
            progress: Arc::new(ProgressRegistry::default()),
            activity_gate: Arc::new(Semaphore::new(max_concurrent_activities.max(1))),
            next_seq: AtomicU64::new(0),
        })
    }

    /// Context for one child coordinator, journaled separately.
    pub async fn child_ctx(&self, child_id: &str) -> Result<WorkflowCtx> {
        let file_name = format!("child-{}.journal", sanitize_id(child_id));
        let journal = Journal::open(self.run_dir.join(file_name)).await?;
        Ok(WorkflowCtx {
            workflow_id: format!("{}/{}", self.workflow_id, child_id),
            run_dir: self.run_dir.clone(),
            journal: Arc::new(journal),
            signals: self.signals.clone(),
            progress: self.progress.clone(),
            activity_gate: self.activity_gate.clone(),
            next_seq: AtomicU64::new(0),
        })
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn progress(&self) -> &ProgressRegistry {
        &self.progress
    }

    pub fn progress_handle(&self) -> Arc<ProgressRegistry> {
        self.progress.clone()
    }

    /// Run one checkpointed side effect. A journaled outcome short-circuits;
    /// otherwise the closure runs under the retry policy, the start-to-close
    /// budget, and the heartbeat watchdog, and its outcome is journaled.
    pub async fn activity<T, F, Fut>(
        &self,
        name: &str,
        options: ActivityOptions,
        mut run: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(ActivityContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.journal.activity_outcome(seq).await {
            return match outcome {
                ActivityOutcome::Completed(value) => {
                    debug!(target: "organize::workflow", workflow = %self.workflow_id, activity = name, seq, "replaying recorded activity result");
                    Ok(serde_json::from_value(value)?)
                }
                ActivityOutcome::Failed(error) => Err(OrganizeError::ActivityExhausted {
                    activity: name.to_string(),
                    attempts: options.retry.max_attempts,
                    last_error: error,
                }),
            };
        }

        let _permit = self
            .activity_gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OrganizeError::Internal("activity gate closed".to_string()))?;

        let mut backoff = options.retry.initial_backoff;
        let mut last_error = String::new();
        for attempt in 1..=options.retry.max_attempts.max(1) {
            let heartbeat = Heartbeat::new();
            let context = ActivityContext {
                heartbeat: heartbeat.clone(),
            };
            let watchdog = watch_heartbeat(heartbeat, options.heartbeat_timeout);
            tokio::pin!(watchdog);

            let attempt_result = tokio::select! {
                outcome = tokio::time::timeout(options.start_to_close, run(context)) => match outcome {
                    Ok(inner) => inner,
                    Err(_) => Err(OrganizeError::ActivityTimeout(name.to_string())),
                },
                _ = &mut watchdog => Err(OrganizeError::ActivityTimeout(name.to_string())),
            };

            match attempt_result {
                Ok(value) => {
                    let recorded = serde_json::to_value(&value)?;
                    self.journal
                        .record_activity_completed(seq, name, recorded)
                        .await?;
                    return Ok(value);
                }
                Err(e) => {
                    warn!(
                        target: "organize::workflow",
                        workflow = %self.workflow_id,
                        activity = name,
                        attempt,
                        error = %e,
                        "activity attempt failed"
                    );
                    last_error = e.to_string();
                    if attempt < options.retry.max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.mul_f64(options.retry.backoff_factor);
                    }
                }
            }
        }

        self.journal
            .record_activity_failed(seq, name, &last_error)
            .await?;
        Err(OrganizeError::ActivityExhausted {
            activity: name.to_string(),
            attempts: options.retry.max_attempts,
            last_error,
        })
    }

    /// Run one child coordinator to completion, keyed by id rather than by
    /// sequence so that out-of-order completions across a fan-out window
    /// replay correctly.
    pub async fn child<T, F, Fut>(&self, child_id: &str, make: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(value) = self.journal.child_result(child_id).await {
            debug!(target: "organize::workflow", workflow = %self.workflow_id, child = child_id, "replaying recorded child result");
            return Ok(serde_json::from_value(value)?);
        }
        let result = make().await;
        self.journal
            .record_child_completed(child_id, serde_json::to_value(&result)?)
            .await?;
        Ok(result)
    }

    /// Suspend until the predicate yields over signal state.
    pub async fn condition<T>(&self, f: impl FnMut(&mut SignalStore) -> Option<T>) -> T {
        self.signals.wait_until(f).await
    }

    /// Journal and apply one inbound signal. Called from the handle, never
    /// from inside a coordinator.
    pub async fn deliver_signal(&self, signal: Signal) -> Result<()> {
        self.journal.record_signal(signal.clone()).await?;
        self.signals.apply(signal).await;
        Ok(())
    }
}

async fn watch_heartbeat(heartbeat: Heartbeat, timeout: Option<Duration>) {
    let Some(timeout) = timeout else {
        return std::future::pending::<()>().await;
    };
    loop {
        let elapsed = heartbeat.elapsed();
        if elapsed >= timeout {
            return;
        }
        tokio::time::sleep(timeout - elapsed).await;
    }
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

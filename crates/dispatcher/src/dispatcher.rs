//! Delivery of one task per call, with retry scheduling and cancellation.
//!
//! The dispatcher never holds task state of its own. Every step is a
//! compare-and-swap through [`TaskStore::transition`]:
//!
//! 1. claim: `Pending -> Dispatching` (a lost race means another worker owns it)
//! 2. deliver: one HTTP call bounded by the per-attempt timeout
//! 3. settle: `Dispatching -> Succeeded | Pending | Failed`, written together
//!    with the attempt record
//!
//! If the task was cancelled while the call was in flight, step 3 loses its
//! compare-and-swap and the result is discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use bridge::{
    DeliveryRequest, DispatchAttempt, DispatchError, RegistryError, RetryPolicy, Task,
    TaskFilter, TaskId, TaskStatus, TaskStore, Timestamp, TransitionMetadata, Transport,
};

use crate::DispatchConfig;

/// Page size used when sweeping the pending queue.
const SWEEP_PAGE_SIZE: usize = 100;

/// What a single [`Dispatcher::dispatch`] call did.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The target accepted the payload.
    Succeeded { attempt: u32, http_status: u16 },
    /// The attempt failed and the task is `Pending` again.
    RetryScheduled {
        attempt: u32,
        next_attempt_at: Timestamp,
    },
    /// The attempt failed and no budget remains, or the failure is not retryable.
    Failed { attempt: u32 },
    /// Another worker claimed or rescheduled the task first.
    Contended { actual: TaskStatus },
    /// The task was not claimable: not `Pending`, or its retry delay has not elapsed.
    Skipped { status: TaskStatus },
    /// The task was cancelled while the attempt was in flight; its result was dropped.
    Discarded { attempt: u32 },
}

/// Result of one sweep over the pending queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sweep {
    /// Tasks this sweep claimed and attempted.
    pub dispatched: usize,
    /// Earliest `next_attempt_at` among pending tasks that were not yet due.
    pub next_due: Option<Timestamp>,
}

/// Claims, delivers, and settles tasks through the registry.
///
/// Shared by every worker in a [`crate::WorkerPool`] and by the listener,
/// which calls [`Dispatcher::cancel`] and [`Dispatcher::wake`].
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    transport: Arc<dyn Transport>,
    config: DispatchConfig,
    wake: Notify,
    claim_conflicts: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        transport: Arc<dyn Transport>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            wake: Notify::new(),
            claim_conflicts: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Number of claims the registry rejected because another worker changed
    /// the task first.
    pub fn claim_conflicts(&self) -> u64 {
        self.claim_conflicts.load(Ordering::Relaxed)
    }

    /// Wakes idle workers, e.g. after a new event was accepted.
    pub fn wake(&self) {
        self.wake.notify_waiters();
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }

    /// Claims `task_id`, makes one delivery attempt, and settles the result.
    ///
    /// The claim is conditional on the task still being due, so a worker
    /// holding a stale read cannot bypass a retry delay another worker just
    /// scheduled. Losing the claim is not an error: the outcome is
    /// [`DispatchOutcome::Contended`] and the caller moves on.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn dispatch(&self, task_id: TaskId) -> Result<DispatchOutcome, RegistryError> {
        let task = self.store.get(task_id).await?;
        let now = Timestamp::now();
        if !task.is_due(now) {
            return Ok(DispatchOutcome::Skipped {
                status: task.status,
            });
        }
        let event = self.store.event(&task.event_id).await?;

        let claimed = match self
            .store
            .transition(
                task_id,
                TaskStatus::Pending,
                TaskStatus::Dispatching,
                TransitionMetadata::when_due(now),
            )
            .await
        {
            Ok(task) => task,
            Err(RegistryError::Conflict { actual, .. }) => {
                self.claim_conflicts.fetch_add(1, Ordering::Relaxed);
                debug!(%actual, "Claim lost to another worker");
                return Ok(DispatchOutcome::Contended { actual });
            }
            Err(RegistryError::NotDue {
                next_attempt_at, ..
            }) => {
                self.claim_conflicts.fetch_add(1, Ordering::Relaxed);
                debug!(%next_attempt_at, "Task was rescheduled by another worker");
                return Ok(DispatchOutcome::Contended {
                    actual: TaskStatus::Pending,
                });
            }
            Err(e) => return Err(e),
        };

        let attempt_number = claimed.attempts + 1;
        let request = DeliveryRequest {
            task_id,
            idempotency_key: event.id,
            event_type: event.event_type,
            target: claimed.target_endpoint.clone(),
            payload: event.payload,
            attempt_number,
            timeout: self.config.attempt_timeout,
        };

        let started_at = Timestamp::now();
        let result = tokio::time::timeout(
            self.config.attempt_timeout,
            self.transport.deliver(&request),
        )
        .await
        .unwrap_or(Err(DispatchError::Timeout));
        let finished_at = Timestamp::now();

        self.settle(&claimed, attempt_number, started_at, finished_at, result)
            .await
    }

    async fn settle(
        &self,
        task: &Task,
        attempt_number: u32,
        started_at: Timestamp,
        finished_at: Timestamp,
        result: Result<bridge::DeliveryResponse, DispatchError>,
    ) -> Result<DispatchOutcome, RegistryError> {
        let backoff = &self.config.backoff;
        let mut attempt = DispatchAttempt {
            task_id: task.id,
            attempt_number,
            started_at,
            finished_at,
            http_status: None,
            error: None,
        };

        let (next, next_attempt_at) = match &result {
            Ok(response) => {
                attempt.http_status = Some(response.status);
                (TaskStatus::Succeeded, None)
            }
            Err(err) => {
                attempt.http_status = err.http_status();
                attempt.error = Some(err.to_string());
                match err.retry_policy() {
                    RetryPolicy::Retryable { after } if backoff.has_budget(attempt_number) => {
                        let delay = backoff.delay_after(attempt_number, after);
                        (TaskStatus::Pending, Some(finished_at.after(delay)))
                    }
                    _ => (TaskStatus::Failed, None),
                }
            }
        };

        let metadata = TransitionMetadata {
            attempt: Some(attempt),
            next_attempt_at,
            ..Default::default()
        };
        match self
            .store
            .transition(task.id, TaskStatus::Dispatching, next, metadata)
            .await
        {
            Ok(_) => {}
            Err(RegistryError::Conflict {
                actual: TaskStatus::Cancelled,
                ..
            }) => {
                info!(attempt = attempt_number, "Task cancelled during dispatch; result discarded");
                return Ok(DispatchOutcome::Discarded {
                    attempt: attempt_number,
                });
            }
            Err(e) => return Err(e),
        }

        Ok(match (next, result) {
            (TaskStatus::Succeeded, Ok(response)) => {
                info!(attempt = attempt_number, http_status = response.status, "Delivered");
                DispatchOutcome::Succeeded {
                    attempt: attempt_number,
                    http_status: response.status,
                }
            }
            (TaskStatus::Pending, Err(err)) => {
                let at = next_attempt_at.unwrap_or(finished_at);
                warn!(
                    attempt = attempt_number,
                    error = %err,
                    next_attempt_at = %at,
                    "Delivery failed; retry scheduled"
                );
                DispatchOutcome::RetryScheduled {
                    attempt: attempt_number,
                    next_attempt_at: at,
                }
            }
            (_, result) => {
                let error = result.err().map(|e| e.to_string()).unwrap_or_default();
                warn!(attempt = attempt_number, %error, "Delivery failed permanently");
                DispatchOutcome::Failed {
                    attempt: attempt_number,
                }
            }
        })
    }

    /// Cancels a `Pending` or `Dispatching` task.
    ///
    /// An attempt already in flight completes, but its result is discarded.
    /// Terminal tasks yield [`RegistryError::InvalidTransition`].
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn cancel(&self, task_id: TaskId) -> Result<Task, RegistryError> {
        loop {
            let current = self.store.get(task_id).await?;
            match self
                .store
                .transition(
                    task_id,
                    current.status,
                    TaskStatus::Cancelled,
                    TransitionMetadata::default(),
                )
                .await
            {
                Ok(task) => {
                    info!(from = %current.status, "Task cancelled");
                    return Ok(task);
                }
                // Status moved between the read and the swap; look again.
                Err(RegistryError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Walks the pending queue once, dispatching every due task.
    ///
    /// Stops early between tasks when `shutdown` fires; an attempt already
    /// started always runs to completion.
    pub async fn sweep(&self, shutdown: &CancellationToken) -> Result<Sweep, RegistryError> {
        let filter = TaskFilter {
            status: Some(TaskStatus::Pending),
            ..Default::default()
        };
        let mut pending = bridge::task_stream(self.store.as_ref(), filter, None, SWEEP_PAGE_SIZE);
        let mut sweep = Sweep::default();

        while let Some(task) = pending.next().await {
            if shutdown.is_cancelled() {
                break;
            }
            let task = task?;
            if !task.is_due(Timestamp::now()) {
                sweep.next_due = match (sweep.next_due, task.next_attempt_at) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                continue;
            }
            match self.dispatch(task.id).await {
                Ok(DispatchOutcome::Contended { .. } | DispatchOutcome::Skipped { .. }) => {}
                Ok(_) => sweep.dispatched += 1,
                // Another task's failure must not stop the sweep.
                Err(e) => warn!(task_id = %task.id, error = %e, "Dispatch failed"),
            }
        }
        Ok(sweep)
    }
}

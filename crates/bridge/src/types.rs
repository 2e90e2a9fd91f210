//! Bridge data model: events, tasks, dispatch attempts, and the task state
//! machine.
//!
//! [`Event`] is immutable once accepted. [`Task`] is owned by the registry and
//! only changes through [`crate::TaskStore::transition`]. [`DispatchAttempt`]
//! records form an append-only audit trail per task.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EventId, EventType, TargetEndpoint, TaskId};

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// Parses an RFC 3339 timestamp (e.g. `2026-10-16T09:30:00Z`).
    pub fn parse_rfc3339(value: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|dt| Self(dt.with_timezone(&Utc)))
    }

    /// Returns this timestamp shifted forward by `delay`, saturating at the
    /// latest representable instant.
    pub fn after(self, delay: Duration) -> Self {
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| self.0.checked_add_signed(d))
            .map(Self)
            .unwrap_or(Self(DateTime::<Utc>::MAX_UTC))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Where an event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// A webhook or API call from outside the deployment.
    External,
    /// An event raised by a service inside the deployment.
    Internal,
}

impl EventSource {
    /// Returns the wire name (`"external"` / `"internal"`).
    pub fn as_str(self) -> &'static str {
        match self {
            EventSource::External => "external",
            EventSource::Internal => "internal",
        }
    }
}

impl std::str::FromStr for EventSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "external" => Ok(EventSource::External),
            "internal" => Ok(EventSource::Internal),
            other => Err(format!("unknown event source '{other}'")),
        }
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An accepted event. Never mutated after the gateway creates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Idempotency key; unique across the registry.
    pub id: EventId,
    pub source: EventSource,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Opaque JSON forwarded verbatim to the target endpoint.
    pub payload: serde_json::Value,
    pub received_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`Task`].
///
/// ```text
/// Pending --claim--> Dispatching --2xx--> Succeeded
/// Dispatching --failure, budget left--> Pending
/// Dispatching --failure, budget spent--> Failed
/// Pending | Dispatching --cancel--> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting for a worker, possibly until `next_attempt_at`.
    Pending,
    /// Claimed by exactly one worker; an attempt is in flight.
    Dispatching,
    /// The target acknowledged delivery.
    Succeeded,
    /// Retries exhausted or the failure was permanent.
    Failed,
    /// Cancelled before delivery was acknowledged.
    Cancelled,
}

impl TaskStatus {
    /// Returns `true` for states that admit no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Returns `true` if the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Dispatching)
                | (Pending, Cancelled)
                | (Dispatching, Succeeded)
                | (Dispatching, Pending)
                | (Dispatching, Failed)
                | (Dispatching, Cancelled)
        )
    }

    /// Wire name of the status, as accepted by [`str::parse`].
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Dispatching => "Dispatching",
            TaskStatus::Succeeded => "Succeeded",
            TaskStatus::Failed => "Failed",
            TaskStatus::Cancelled => "Cancelled",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "dispatching" => Ok(TaskStatus::Dispatching),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tasks and attempts
// ---------------------------------------------------------------------------

/// The unit of work tracking delivery of one [`Event`] to one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Idempotency key of the event this task delivers.
    pub event_id: EventId,
    pub event_type: EventType,
    /// Where the payload goes, resolved once at accept time.
    pub target_endpoint: TargetEndpoint,
    pub status: TaskStatus,
    /// Number of recorded [`DispatchAttempt`]s.
    pub attempts: u32,
    /// Error of the most recent failed attempt.
    pub last_error: Option<String>,
    /// Earliest time a worker may claim the task again. `None` means now.
    pub next_attempt_at: Option<Timestamp>,
    pub created_at: Timestamp,
    /// Time of the last status transition.
    pub updated_at: Timestamp,
}

impl Task {
    /// Builds a freshly accepted task in the `Pending` state.
    pub fn pending(event: &Event, target_endpoint: TargetEndpoint) -> Self {
        let now = Timestamp::now();
        Self {
            id: TaskId::new_random(),
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            target_endpoint,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` if the task is `Pending` and its retry delay (if any)
    /// has elapsed at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == TaskStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// One HTTP call made on behalf of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchAttempt {
    pub task_id: TaskId,
    /// 1-based; strictly increasing per task.
    pub attempt_number: u32,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub http_status: Option<u16>,
    pub error: Option<String>,
}

impl DispatchAttempt {
    /// Returns `true` if the attempt received a 2xx response.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.http_status.is_some_and(|s| (200..300).contains(&s))
    }
}

// ---------------------------------------------------------------------------
// Projections
// ---------------------------------------------------------------------------

/// Returned by the gateway for an accepted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: TaskId,
    pub event_id: EventId,
    /// `false` when the event was a resubmission of an existing key.
    #[serde(skip)]
    pub created: bool,
}

/// Read-only projection of a task plus its attempt history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub event_id: EventId,
    pub event_type: EventType,
    pub target_endpoint: TargetEndpoint,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub history: Vec<DispatchAttempt>,
}

impl TaskStatusView {
    pub fn new(task: Task, history: Vec<DispatchAttempt>) -> Self {
        Self {
            task_id: task.id,
            event_id: task.event_id,
            event_type: task.event_type,
            target_endpoint: task.target_endpoint,
            status: task.status,
            attempts: task.attempts,
            last_error: task.last_error,
            next_attempt_at: task.next_attempt_at,
            created_at: task.created_at,
            updated_at: task.updated_at,
            history,
        }
    }
}

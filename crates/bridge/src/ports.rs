//! Port traits implemented by infrastructure crates.
//!
//! | Trait | Implemented by |
//! |-------|----------------|
//! | [`TaskStore`] | `registry` (in-memory); an embedded or external database can sit behind the same contract |
//! | [`Transport`] | `http-transport` (reqwest) |

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use crate::{
    DispatchAttempt, DispatchError, Event, EventId, EventType, RegistryError, TargetEndpoint,
    Task, TaskId, TaskStatus, TaskStatusView, Timestamp,
};

/// Default number of tasks per listed page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Largest page a store will return regardless of the requested limit.
pub const MAX_PAGE_SIZE: usize = 1000;

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Opaque, store-issued position in a task listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Wraps a cursor string previously issued by a store.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Selects tasks in [`TaskStore::list`]. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    /// Only tasks updated at or after this instant.
    pub since: Option<Timestamp>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self.since.map_or(true, |t| task.updated_at >= t)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    /// Resume after this position; `None` starts from the oldest task.
    pub cursor: Option<Cursor>,
    pub limit: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            cursor: None,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// The limit clamped to `1..=MAX_PAGE_SIZE`.
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }
}

/// One page of results. `next_cursor` is `None` on the last page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<Cursor>,
}

// ---------------------------------------------------------------------------
// Task store
// ---------------------------------------------------------------------------

/// Side data written together with a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionMetadata {
    /// Appended to the attempt history; increments `attempts` and replaces
    /// `last_error` with the attempt's error.
    pub attempt: Option<DispatchAttempt>,
    /// Replaces the task's `next_attempt_at`.
    pub next_attempt_at: Option<Timestamp>,
    /// Applies the write only if the task is due at this instant; a task
    /// whose retry delay has not elapsed fails with [`RegistryError::NotDue`].
    pub due_at: Option<Timestamp>,
}

impl TransitionMetadata {
    pub fn with_attempt(attempt: DispatchAttempt) -> Self {
        Self {
            attempt: Some(attempt),
            ..Default::default()
        }
    }

    /// Metadata for a claim that must not bypass a scheduled retry delay.
    pub fn when_due(now: Timestamp) -> Self {
        Self {
            due_at: Some(now),
            ..Default::default()
        }
    }
}

/// The task registry: the single source of truth for task state.
///
/// Every mutation after [`TaskStore::create`] goes through
/// [`TaskStore::transition`], a compare-and-swap on the task status. Readers
/// never observe a partially applied write.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Stores `event` and one `Pending` task for it, atomically.
    ///
    /// Fails with [`RegistryError::DuplicateEvent`] if the event id exists.
    async fn create(&self, event: Event, target: TargetEndpoint) -> Result<Task, RegistryError>;

    async fn get(&self, task_id: TaskId) -> Result<Task, RegistryError>;

    async fn find_by_event(&self, event_id: &EventId) -> Result<Option<Task>, RegistryError>;

    async fn event(&self, event_id: &EventId) -> Result<Event, RegistryError>;

    /// Moves the task from `expected` to `next`, applying `metadata` in the
    /// same write.
    ///
    /// Fails with [`RegistryError::Conflict`] if the current status is not
    /// `expected`, with [`RegistryError::InvalidTransition`] if the state
    /// machine forbids `expected -> next`, and with [`RegistryError::NotDue`]
    /// if `metadata.due_at` is set and the task's retry delay has not elapsed.
    async fn transition(
        &self,
        task_id: TaskId,
        expected: TaskStatus,
        next: TaskStatus,
        metadata: TransitionMetadata,
    ) -> Result<Task, RegistryError>;

    /// Lists matching tasks oldest first, resuming after `page.cursor`.
    async fn list(&self, filter: &TaskFilter, page: PageRequest)
        -> Result<Page<Task>, RegistryError>;

    /// Task and its attempt history, ordered by `attempt_number`, read as one
    /// consistent snapshot.
    async fn view(&self, task_id: TaskId) -> Result<TaskStatusView, RegistryError>;
}

/// Lazily walks every page of a listing, starting after `start`.
///
/// Each page is fetched only when the previous one has been consumed, so a
/// caller can stop early and later resume from the last cursor it saw.
pub fn task_stream<'a, S>(
    store: &'a S,
    filter: TaskFilter,
    start: Option<Cursor>,
    page_size: usize,
) -> BoxStream<'a, Result<Task, RegistryError>>
where
    S: TaskStore + ?Sized,
{
    enum Position {
        At(Option<Cursor>),
        Exhausted,
    }

    stream::try_unfold(Position::At(start), move |position| {
        let filter = filter.clone();
        async move {
            let cursor = match position {
                Position::Exhausted => return Ok::<_, RegistryError>(None),
                Position::At(cursor) => cursor,
            };
            let page = store
                .list(
                    &filter,
                    PageRequest {
                        cursor,
                        limit: page_size,
                    },
                )
                .await?;
            let next = match page.next_cursor {
                Some(c) => Position::At(Some(c)),
                None => Position::Exhausted,
            };
            Ok(Some((page.items, next)))
        }
    })
    .map_ok(|items| stream::iter(items.into_iter().map(Ok::<Task, RegistryError>)))
    .try_flatten()
    .boxed()
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// One outbound delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRequest {
    pub task_id: TaskId,
    /// Sent as the correlation header so the target can de-duplicate.
    pub idempotency_key: EventId,
    pub event_type: EventType,
    pub target: TargetEndpoint,
    pub payload: serde_json::Value,
    pub attempt_number: u32,
    pub timeout: Duration,
}

/// A 2xx answer from the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryResponse {
    pub status: u16,
}

/// Delivers a payload to a target endpoint.
///
/// Implementations return `Ok` only for 2xx responses; every other outcome
/// is a [`DispatchError`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryResponse, DispatchError>;
}

//! In-memory task registry.
//!
//! Implements [`bridge::TaskStore`] over a single `parking_lot::RwLock`. Every
//! operation takes the lock once, so each write is applied completely or not
//! at all and readers always see a consistent task + history snapshot.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** State lives only in process memory and is lost on
//! restart. A durable store implements the same trait without changes to the
//! gateway, dispatcher, or status reporter.
//!
//! ## Listing order and cursors
//!
//! Tasks are listed in creation order. Each task receives a monotonically
//! increasing sequence number at creation; a [`Cursor`] is the hex-encoded
//! sequence number of the last task on the previous page.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use bridge::{
    Cursor, DispatchAttempt, Event, EventId, Page, PageRequest, RegistryError, TargetEndpoint,
    Task, TaskFilter, TaskId, TaskStatus, TaskStatusView, TaskStore, Timestamp,
    TransitionMetadata,
};

struct Entry {
    task: Task,
    history: Vec<DispatchAttempt>,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    /// Creation-ordered tasks keyed by sequence number.
    entries: BTreeMap<u64, Entry>,
    seq_by_task: HashMap<TaskId, u64>,
    events: HashMap<EventId, (Event, TaskId)>,
}

impl State {
    fn entry(&self, task_id: TaskId) -> Result<&Entry, RegistryError> {
        self.seq_by_task
            .get(&task_id)
            .and_then(|seq| self.entries.get(seq))
            .ok_or(RegistryError::TaskNotFound { task_id })
    }

    fn entry_mut(&mut self, task_id: TaskId) -> Result<&mut Entry, RegistryError> {
        self.seq_by_task
            .get(&task_id)
            .and_then(|seq| self.entries.get_mut(seq))
            .ok_or(RegistryError::TaskNotFound { task_id })
    }
}

/// Process-local [`TaskStore`].
#[derive(Default)]
pub struct InMemoryTaskStore {
    state: RwLock<State>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn encode_cursor(seq: u64) -> Cursor {
    Cursor::new(format!("{seq:016x}"))
}

fn decode_cursor(cursor: &Cursor, next_seq: u64) -> Result<u64, RegistryError> {
    let invalid = || RegistryError::InvalidCursor {
        cursor: cursor.to_string(),
    };
    let raw = cursor.as_str();
    if raw.len() != 16 {
        return Err(invalid());
    }
    let seq = u64::from_str_radix(raw, 16).map_err(|_| invalid())?;
    if seq >= next_seq {
        return Err(invalid());
    }
    Ok(seq)
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, event: Event, target: TargetEndpoint) -> Result<Task, RegistryError> {
        let mut state = self.state.write();
        if let Some((_, existing)) = state.events.get(&event.id) {
            return Err(RegistryError::DuplicateEvent {
                event_id: event.id.clone(),
                existing: *existing,
            });
        }

        let task = Task::pending(&event, target);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.seq_by_task.insert(task.id, seq);
        state.entries.insert(
            seq,
            Entry {
                task: task.clone(),
                history: Vec::new(),
            },
        );
        state.events.insert(event.id.clone(), (event, task.id));

        debug!(task_id = %task.id, event_id = %task.event_id, "Task registered");
        Ok(task)
    }

    async fn get(&self, task_id: TaskId) -> Result<Task, RegistryError> {
        Ok(self.state.read().entry(task_id)?.task.clone())
    }

    async fn find_by_event(&self, event_id: &EventId) -> Result<Option<Task>, RegistryError> {
        let state = self.state.read();
        match state.events.get(event_id) {
            Some((_, task_id)) => Ok(Some(state.entry(*task_id)?.task.clone())),
            None => Ok(None),
        }
    }

    async fn event(&self, event_id: &EventId) -> Result<Event, RegistryError> {
        self.state
            .read()
            .events
            .get(event_id)
            .map(|(event, _)| event.clone())
            .ok_or_else(|| RegistryError::EventNotFound {
                event_id: event_id.clone(),
            })
    }

    async fn transition(
        &self,
        task_id: TaskId,
        expected: TaskStatus,
        next: TaskStatus,
        metadata: TransitionMetadata,
    ) -> Result<Task, RegistryError> {
        let mut state = self.state.write();
        let entry = state.entry_mut(task_id)?;

        if !expected.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                task_id,
                from: expected,
                to: next,
            });
        }
        if entry.task.status != expected {
            return Err(RegistryError::Conflict {
                task_id,
                expected,
                actual: entry.task.status,
            });
        }
        if let Some(now) = metadata.due_at {
            if !entry.task.is_due(now) {
                return Err(RegistryError::NotDue {
                    task_id,
                    next_attempt_at: entry.task.next_attempt_at.unwrap_or(now),
                });
            }
        }
        if let Some(attempt) = &metadata.attempt {
            let wanted = entry.task.attempts + 1;
            if attempt.task_id != task_id || attempt.attempt_number != wanted {
                return Err(RegistryError::AttemptOutOfOrder {
                    task_id,
                    expected: wanted,
                    got: attempt.attempt_number,
                });
            }
        }

        // All checks passed; apply the whole write.
        let task = &mut entry.task;
        task.status = next;
        task.next_attempt_at = metadata.next_attempt_at;
        task.updated_at = Timestamp::now();
        if let Some(attempt) = metadata.attempt {
            task.attempts = attempt.attempt_number;
            task.last_error = attempt.error.clone();
            entry.history.push(attempt);
        }

        debug!(
            %task_id,
            from = %expected,
            to = %next,
            attempts = entry.task.attempts,
            "Task transitioned"
        );
        Ok(entry.task.clone())
    }

    async fn list(
        &self,
        filter: &TaskFilter,
        page: PageRequest,
    ) -> Result<Page<Task>, RegistryError> {
        let limit = page.effective_limit();
        let state = self.state.read();
        let start = match &page.cursor {
            Some(cursor) => decode_cursor(cursor, state.next_seq)?.saturating_add(1),
            None => 0,
        };

        let mut items = Vec::with_capacity(limit.min(state.entries.len()));
        let mut last_seq = None;
        let mut more = false;
        for (seq, entry) in state.entries.range(start..) {
            if !filter.matches(&entry.task) {
                continue;
            }
            if items.len() == limit {
                more = true;
                break;
            }
            items.push(entry.task.clone());
            last_seq = Some(*seq);
        }

        Ok(Page {
            items,
            next_cursor: if more { last_seq.map(encode_cursor) } else { None },
        })
    }

    async fn view(&self, task_id: TaskId) -> Result<TaskStatusView, RegistryError> {
        let state = self.state.read();
        let entry = state.entry(task_id)?;
        Ok(TaskStatusView::new(entry.task.clone(), entry.history.clone()))
    }
}

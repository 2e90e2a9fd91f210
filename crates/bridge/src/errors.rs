//! Error taxonomy and retry-policy types for the event bridge.
//!
//! Each component owns one error enum:
//!
//! | Error | Raised by | Handling |
//! |-------|-----------|----------|
//! | [`GatewayError`] | inbound gateway | surfaced to the caller, never retried |
//! | [`RegistryError`] | [`crate::TaskStore`] implementations | `Conflict` is recovered locally by the losing caller |
//! | [`DispatchError`] | [`crate::Transport`] implementations | recovered through the retry budget |
//! | [`ConfigError`] | configuration validation | aborts startup |
//!
//! [`RetryPolicy`] is how a transport tells the dispatcher whether an attempt
//! is worth repeating.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{EventId, TaskId, TaskStatus, Timestamp};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether a failed dispatch attempt is safe to retry and, if so, after what
/// minimum delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The attempt may be retried while budget remains.
    Retryable {
        /// Minimum back-off before the next attempt (e.g. from `Retry-After`).
        /// `None` means apply the configured backoff schedule only.
        after: Option<Duration>,
    },
    /// Repeating the attempt cannot succeed; the task fails immediately.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Errors returned by [`crate::Gateway::accept`].
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The event envelope is malformed or incomplete.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// No route exists for the event type and no default target is configured.
    #[error("No target endpoint configured for event type '{event_type}'")]
    Unroutable { event_type: String },

    /// The registry could not complete the write.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl GatewayError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Errors returned by [`crate::TaskStore`] operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    /// An event with this idempotency key already exists.
    ///
    /// Not a failure from the caller's point of view: the gateway maps it to
    /// an idempotent accept of `existing`.
    #[error("Event '{event_id}' already registered as task {existing}")]
    DuplicateEvent { event_id: EventId, existing: TaskId },

    #[error("Task {task_id} not found")]
    TaskNotFound { task_id: TaskId },

    #[error("Event '{event_id}' not found")]
    EventNotFound { event_id: EventId },

    /// Compare-and-swap lost: the task is no longer in the expected state.
    #[error("Task {task_id} is {actual}, expected {expected}")]
    Conflict {
        task_id: TaskId,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    /// A conditional claim found the task rescheduled: its retry delay runs
    /// until `next_attempt_at`.
    #[error("Task {task_id} is not due until {next_attempt_at}")]
    NotDue {
        task_id: TaskId,
        next_attempt_at: Timestamp,
    },

    /// The requested transition is not permitted by the task state machine.
    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// A recorded attempt does not continue the task's attempt sequence.
    #[error("Task {task_id} expected attempt {expected}, got {got}")]
    AttemptOutOfOrder {
        task_id: TaskId,
        expected: u32,
        got: u32,
    },

    /// The pagination cursor was not issued by this store.
    #[error("Invalid cursor '{cursor}'")]
    InvalidCursor { cursor: String },

    /// The backing store cannot serve the request. No partial write was made.
    #[error("Task store unavailable: {message}")]
    Unavailable { message: String },
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// A failed dispatch attempt.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    /// The per-attempt timeout elapsed before a response arrived.
    #[error("timeout")]
    Timeout,

    /// The target answered with a non-2xx status.
    #[error("http {status}")]
    HttpStatus {
        status: u16,
        /// Parsed `Retry-After` header, if the target sent one.
        retry_after: Option<Duration>,
    },

    /// Connection refused, reset, DNS failure, TLS failure and the like.
    #[error("network error: {message}")]
    Network { message: String },

    /// The request could not be constructed (e.g. the target URL is invalid).
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl DispatchError {
    /// Classifies this error for the dispatcher's retry decision.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            DispatchError::Timeout | DispatchError::Network { .. } => {
                RetryPolicy::Retryable { after: None }
            }
            DispatchError::HttpStatus { retry_after, .. } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            DispatchError::InvalidRequest { .. } => RetryPolicy::NonRetryable,
        }
    }

    /// The HTTP status carried by the error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            DispatchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// The bridge configuration is invalid. Produced at load time; the bridge
/// never starts with an invalid configuration.
#[derive(Debug, Error)]
#[error("Configuration error: {message}")]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

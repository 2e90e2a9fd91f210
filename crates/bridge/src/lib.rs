//! Core domain for the event bridge.
//!
//! This crate holds every domain concept of the bridge: identifiers, the
//! event/task/attempt data model, the task state machine, the error taxonomy,
//! the retry backoff policy, event routing, the port traits that storage and
//! transport adapters implement, and the inbound gateway.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`EventId`, `TaskId`, `TargetEndpoint`, ...) |
//! | [`types`] | `Event`, `Task`, `DispatchAttempt`, `TaskStatus`, views |
//! | [`errors`] | Per-component error enums and `RetryPolicy` |
//! | [`backoff`] | Exponential backoff with jitter |
//! | [`routing`] | Event type to target endpoint mapping |
//! | [`ports`] | `TaskStore` and `Transport` traits, listing types |
//! | [`gateway`] | Envelope validation, idempotency keys, `Gateway::accept` |

pub mod backoff;
pub mod errors;
pub mod gateway;
pub mod identifiers;
pub mod ports;
pub mod routing;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use backoff::BackoffPolicy;
pub use errors::{ConfigError, DispatchError, GatewayError, RegistryError, RetryPolicy};
pub use gateway::{Gateway, RawEvent};
pub use identifiers::{EventId, EventType, TargetEndpoint, TaskId};
pub use ports::{
    task_stream, Cursor, DeliveryRequest, DeliveryResponse, Page, PageRequest, TaskFilter,
    TaskStore, TransitionMetadata, Transport,
};
pub use routing::RouteTable;
pub use types::{
    DispatchAttempt, Event, EventSource, Task, TaskHandle, TaskStatus, TaskStatusView, Timestamp,
};

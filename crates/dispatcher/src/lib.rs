//! Event bridge orchestration.
//!
//! Sequences calls between the domain rules in [`bridge`] and the
//! [`bridge::TaskStore`] / [`bridge::Transport`] ports. Holds no task state of
//! its own.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`dispatcher`] | `Dispatcher`: claim, deliver, settle, cancel, sweep |
//! | [`worker`] | `WorkerPool`: concurrent sweepers with cooperative shutdown |
//! | [`status`] | `StatusReporter`: `get_status`, `subscribe`, listing |
//! | [`config`] | `DispatchConfig` |

pub mod config;
pub mod dispatcher;
pub mod status;
pub mod worker;

pub use config::DispatchConfig;
pub use dispatcher::{DispatchOutcome, Dispatcher, Sweep};
pub use status::StatusReporter;
pub use worker::WorkerPool;

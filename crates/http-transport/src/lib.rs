//! Outbound HTTP delivery adapter.
//!
//! Implements [`bridge::Transport`] with `reqwest`. Each delivery is a JSON
//! `POST` of the original event payload to the task's target endpoint.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Connection handling, TLS, header encoding and error
//! classification live here. The dispatcher sees only [`bridge::Transport`]
//! and [`bridge::DispatchError`].
//!
//! ## Headers
//!
//! | Header | Value |
//! |--------|-------|
//! | `Idempotency-Key` | event id; lets the target de-duplicate redeliveries |
//! | `X-Bridge-Task-Id` | task id |
//! | `X-Bridge-Event-Type` | event type |
//! | `X-Bridge-Attempt` | 1-based attempt number |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use tracing::debug;

use bridge::{DeliveryRequest, DeliveryResponse, DispatchError, Transport};

/// Carries the event id so the target can drop redeliveries.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
/// Carries the task id of the delivery.
pub const TASK_ID_HEADER: &str = "X-Bridge-Task-Id";
pub const EVENT_TYPE_HEADER: &str = "X-Bridge-Event-Type";
/// 1-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Bridge-Attempt";

const USER_AGENT: &str = concat!("eventbridge/", env!("CARGO_PKG_VERSION"));

/// [`Transport`] over a shared `reqwest` connection pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Builds a transport with its own connection pool.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryResponse, DispatchError> {
        let response = self
            .client
            .post(request.target.as_str())
            .timeout(request.timeout)
            .header(IDEMPOTENCY_KEY_HEADER, request.idempotency_key.as_str())
            .header(TASK_ID_HEADER, request.task_id.to_string())
            .header(EVENT_TYPE_HEADER, request.event_type.as_str())
            .header(ATTEMPT_HEADER, request.attempt_number.to_string())
            .json(&request.payload)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        debug!(
            task_id = %request.task_id,
            target = %request.target,
            status = status.as_u16(),
            "Target responded"
        );
        if status.is_success() {
            Ok(DeliveryResponse {
                status: status.as_u16(),
            })
        } else {
            Err(DispatchError::HttpStatus {
                status: status.as_u16(),
                retry_after: retry_after(response.headers()),
            })
        }
    }
}

fn classify(err: reqwest::Error) -> DispatchError {
    if err.is_timeout() {
        DispatchError::Timeout
    } else if err.is_builder() {
        DispatchError::InvalidRequest {
            message: err.to_string(),
        }
    } else {
        DispatchError::Network {
            message: err.to_string(),
        }
    }
}

/// Parses a delta-seconds `Retry-After` header. HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

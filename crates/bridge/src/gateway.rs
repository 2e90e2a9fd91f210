//! Inbound gateway: validates event envelopes, assigns idempotency keys, and
//! registers one task per new event.
//!
//! The gateway makes no network calls. Its only side effects are registry
//! writes.

use std::sync::Arc;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::{
    Event, EventId, EventSource, EventType, GatewayError, RegistryError, RouteTable, Task,
    TaskHandle, TaskStore, Timestamp,
};

/// Prefix marking an idempotency key derived from event content.
pub const CONTENT_HASH_PREFIX: &str = "sha256:";

/// An event envelope as received, before validation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// Key from the `Idempotency-Key` request header; used when `id` is absent.
    #[serde(skip)]
    pub idempotency_key: Option<String>,
}

impl RawEvent {
    /// Validates the envelope and stamps it as received now.
    pub fn into_event(self) -> Result<Event, GatewayError> {
        let source: EventSource = self
            .source
            .as_deref()
            .ok_or_else(|| GatewayError::validation("missing required field 'source'"))?
            .parse()
            .map_err(GatewayError::validation)?;

        let event_type = self
            .event_type
            .and_then(EventType::new)
            .ok_or_else(|| GatewayError::validation("missing required field 'type'"))?;

        let payload = match self.payload {
            Some(p) if !is_empty_payload(&p) => p,
            _ => return Err(GatewayError::validation("payload must be present and non-empty")),
        };

        let supplied = match (self.id, self.idempotency_key) {
            (Some(id), _) => Some(("id", id)),
            (None, Some(key)) => Some(("Idempotency-Key", key)),
            (None, None) => None,
        };
        let id = match supplied {
            Some((origin, key)) => EventId::new(key)
                .ok_or_else(|| GatewayError::validation(format!("'{origin}' must not be blank")))?,
            None => content_key(source, &event_type, &payload),
        };

        Ok(Event {
            id,
            source,
            event_type,
            payload,
            received_at: Timestamp::now(),
        })
    }
}

/// `null`, `""`, `[]` and `{}` carry nothing to deliver.
pub fn is_empty_payload(payload: &serde_json::Value) -> bool {
    match payload {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Derives an idempotency key from event content.
///
/// `serde_json::Value` objects serialise with sorted keys, so payloads that
/// differ only in key order hash the same.
pub fn content_key(
    source: EventSource,
    event_type: &EventType,
    payload: &serde_json::Value,
) -> EventId {
    let mut hasher = Sha256::new();
    hasher.update(source.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(event_type.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(payload.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    EventId::new(format!("{CONTENT_HASH_PREFIX}{digest}"))
        .unwrap_or_else(|| unreachable!("hash keys are never blank"))
}

// ---------------------------------------------------------------------------

/// Accepts events into the registry.
#[derive(Clone)]
pub struct Gateway {
    store: Arc<dyn TaskStore>,
    routes: RouteTable,
}

impl Gateway {
    /// Creates a gateway that registers tasks in `store` for the targets
    /// `routes` resolves.
    pub fn new(store: Arc<dyn TaskStore>, routes: RouteTable) -> Self {
        Self { store, routes }
    }

    /// Validates `raw` and registers it.
    ///
    /// A resubmitted idempotency key returns the existing task's handle with
    /// `created == false`; no second task is created.
    #[instrument(
        skip_all,
        fields(event_id = tracing::field::Empty, event_type = tracing::field::Empty)
    )]
    pub async fn accept(&self, raw: RawEvent) -> Result<TaskHandle, GatewayError> {
        let event = raw.into_event()?;
        let span = tracing::Span::current();
        span.record("event_id", event.id.as_str());
        span.record("event_type", event.event_type.as_str());

        if let Some(existing) = self.store.find_by_event(&event.id).await? {
            debug!(task_id = %existing.id, "Duplicate event; returning existing task");
            return Ok(handle(&existing, false));
        }

        let target = self
            .routes
            .resolve(&event.event_type)
            .cloned()
            .ok_or_else(|| GatewayError::Unroutable {
                event_type: event.event_type.to_string(),
            })?;

        match self.store.create(event, target).await {
            Ok(task) => {
                info!(task_id = %task.id, target = %task.target_endpoint, "Event accepted");
                Ok(handle(&task, true))
            }
            // Lost a race with a concurrent accept of the same key.
            Err(RegistryError::DuplicateEvent { event_id, existing }) => {
                debug!(task_id = %existing, "Duplicate event; returning existing task");
                Ok(TaskHandle {
                    task_id: existing,
                    event_id,
                    created: false,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn handle(task: &Task, created: bool) -> TaskHandle {
    TaskHandle {
        task_id: task.id,
        event_id: task.event_id.clone(),
        created,
    }
}

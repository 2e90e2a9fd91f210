//! Event bridge HTTP surface.
//!
//! Receives events from external systems and internal services, and serves
//! task status to pollers and subscribers.
//!
//! ## Endpoints
//!
//! | Method | Path | Result |
//! |--------|------|--------|
//! | `POST` | `/events` | `202` new task, `200` idempotent replay |
//! | `GET` | `/tasks` | one page of task views (`status`, `since`, `cursor`, `limit`) |
//! | `GET` | `/tasks/:id` | task view with attempt history |
//! | `POST` | `/tasks/:id/cancel` | cancels a pending or in-flight task |
//! | `GET` | `/tasks/:id/events` | server-sent status updates until terminal |
//! | `GET` | `/health` | liveness |
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Request parsing and status-code mapping live here.
//! All behaviour is delegated to [`bridge::Gateway`], [`dispatcher::Dispatcher`]
//! and [`dispatcher::StatusReporter`].

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use bridge::{
    Cursor, Gateway, PageRequest, RawEvent, TaskFilter, TaskHandle, TaskId, TaskStatus,
    TaskStatusView, Timestamp,
};
use dispatcher::{Dispatcher, StatusReporter};

pub mod error;

pub use error::{ApiError, ApiErrorBody};

/// Request header carrying a caller-chosen idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub dispatcher: Arc<Dispatcher>,
    pub status: StatusReporter,
    /// Ends open status subscriptions so graceful shutdown is not held by them.
    pub shutdown: CancellationToken,
}

/// Builds the listener's router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/events", post(accept_event))
        .route("/tasks", get(list_tasks))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/tasks/:id/events", get(task_events))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves [`router`] on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Listening for events");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> &'static str {
    "OK"
}

async fn accept_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RawEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<TaskHandle>), ApiError> {
    let Json(mut raw) = body.map_err(|e| ApiError::validation(e.body_text()))?;
    if let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) {
        let key = value
            .to_str()
            .map_err(|_| ApiError::validation("'Idempotency-Key' must be visible ASCII"))?;
        raw.idempotency_key = Some(key.to_owned());
    }

    let handle = state.gateway.accept(raw).await?;
    if handle.created {
        state.dispatcher.wake();
        Ok((StatusCode::ACCEPTED, Json(handle)))
    } else {
        Ok((StatusCode::OK, Json(handle)))
    }
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskStatusView>, ApiError> {
    let task_id = parse_task_id(&id)?;
    Ok(Json(state.status.get_status(task_id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    status: Option<String>,
    since: Option<String>,
    cursor: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct TaskList {
    tasks: Vec<TaskStatusView>,
    next_cursor: Option<Cursor>,
}

async fn list_tasks(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<TaskList>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::validation(e.body_text()))?;

    let status = params
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(ApiError::validation)?;
    let since = params
        .since
        .as_deref()
        .map(|s| {
            Timestamp::parse_rfc3339(s).ok_or_else(|| {
                ApiError::validation(format!("'since' is not an RFC 3339 timestamp: {s}"))
            })
        })
        .transpose()?;

    let filter = TaskFilter { status, since };
    let mut page = PageRequest {
        cursor: params.cursor.map(Cursor::new),
        ..Default::default()
    };
    if let Some(limit) = params.limit {
        page.limit = limit;
    }

    let result = state.status.list(&filter, page).await?;
    Ok(Json(TaskList {
        tasks: result.items,
        next_cursor: result.next_cursor,
    }))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskStatusView>, ApiError> {
    let task_id = parse_task_id(&id)?;
    state.dispatcher.cancel(task_id).await?;
    Ok(Json(state.status.get_status(task_id).await?))
}

async fn task_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let task_id = parse_task_id(&id)?;
    let updates = state.status.subscribe(task_id).await?;

    let events = updates
        .take_until(state.shutdown.clone().cancelled_owned())
        .map(|update| {
            let event = match update {
                Ok(view) => SseEvent::default()
                    .event("status")
                    .json_data(&view)
                    .unwrap_or_else(|e| SseEvent::default().event("error").data(e.to_string())),
                Err(e) => SseEvent::default().event("error").data(e.to_string()),
            };
            Ok::<_, Infallible>(event)
        });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// A malformed id cannot name a task, so it is reported as not found.
fn parse_task_id(raw: &str) -> Result<TaskId, ApiError> {
    TaskId::parse(raw).ok_or_else(|| ApiError::not_found(format!("Task {raw} not found")))
}

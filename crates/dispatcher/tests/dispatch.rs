//! End-to-end behaviour of the dispatcher against the in-memory registry and
//! a scripted transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use bridge::{
    BackoffPolicy, DeliveryRequest, DeliveryResponse, DispatchError, Event, EventId, Gateway,
    Page, PageRequest, RawEvent, RegistryError, RouteTable, TargetEndpoint, Task, TaskFilter,
    TaskHandle, TaskId, TaskStatus, TaskStatusView, TaskStore, TransitionMetadata, Transport,
};
use dispatcher::{DispatchConfig, DispatchOutcome, Dispatcher, StatusReporter, WorkerPool};
use registry::InMemoryTaskStore;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Answers from a script, then from `fallback` once the script is used up.
struct ScriptedTransport {
    script: Mutex<VecDeque<Result<DeliveryResponse, DispatchError>>>,
    fallback: Result<DeliveryResponse, DispatchError>,
    delay: Duration,
    seen: Mutex<Vec<DeliveryRequest>>,
}

impl ScriptedTransport {
    fn always(result: Result<DeliveryResponse, DispatchError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: result,
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn ok() -> Self {
        Self::always(Ok(DeliveryResponse { status: 200 }))
    }

    fn http(status: u16) -> Self {
        Self::always(Err(DispatchError::HttpStatus {
            status,
            retry_after: None,
        }))
    }

    fn then(self, result: Result<DeliveryResponse, DispatchError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryResponse, DispatchError> {
        self.seen.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}

/// In-memory registry whose first `held` event reads wait for
/// [`HeldEventReads::release`], widening the gap between a worker's due check
/// and its claim.
struct HeldEventReads {
    inner: InMemoryTaskStore,
    held: AtomicUsize,
    parked: AtomicUsize,
    gate: Semaphore,
}

impl HeldEventReads {
    fn new(held: usize) -> Self {
        Self {
            inner: InMemoryTaskStore::new(),
            held: AtomicUsize::new(held),
            parked: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        }
    }

    async fn wait_until_parked(&self, count: usize) {
        for _ in 0..500 {
            if self.parked.load(Ordering::SeqCst) >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("only {} reads parked", self.parked.load(Ordering::SeqCst));
    }

    fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }
}

#[async_trait]
impl TaskStore for HeldEventReads {
    async fn create(&self, event: Event, target: TargetEndpoint) -> Result<Task, RegistryError> {
        self.inner.create(event, target).await
    }

    async fn get(&self, task_id: TaskId) -> Result<Task, RegistryError> {
        self.inner.get(task_id).await
    }

    async fn find_by_event(&self, event_id: &EventId) -> Result<Option<Task>, RegistryError> {
        self.inner.find_by_event(event_id).await
    }

    async fn event(&self, event_id: &EventId) -> Result<Event, RegistryError> {
        let hold = self
            .held
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hold {
            self.parked.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await.unwrap().forget();
        }
        self.inner.event(event_id).await
    }

    async fn transition(
        &self,
        task_id: TaskId,
        expected: TaskStatus,
        next: TaskStatus,
        metadata: TransitionMetadata,
    ) -> Result<Task, RegistryError> {
        self.inner.transition(task_id, expected, next, metadata).await
    }

    async fn list(
        &self,
        filter: &TaskFilter,
        page: PageRequest,
    ) -> Result<Page<Task>, RegistryError> {
        self.inner.list(filter, page).await
    }

    async fn view(&self, task_id: TaskId) -> Result<TaskStatusView, RegistryError> {
        self.inner.view(task_id).await
    }
}

struct Harness {
    store: Arc<HeldEventReads>,
    transport: Arc<ScriptedTransport>,
    gateway: Gateway,
    dispatcher: Arc<Dispatcher>,
    status: StatusReporter,
}

fn fast_config(max_attempts: u32) -> DispatchConfig {
    DispatchConfig {
        workers: 2,
        poll_interval: Duration::from_millis(10),
        attempt_timeout: Duration::from_secs(1),
        status_poll_interval: Duration::from_millis(5),
        backoff: BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        },
    }
}

fn harness(transport: ScriptedTransport, config: DispatchConfig) -> Harness {
    harness_holding(transport, config, 0)
}

fn harness_holding(transport: ScriptedTransport, config: DispatchConfig, held: usize) -> Harness {
    let store = Arc::new(HeldEventReads::new(held));
    let transport = Arc::new(transport);
    let routes = RouteTable::single(TargetEndpoint::new("http://target.invalid/hook").unwrap());
    let gateway = Gateway::new(store.clone(), routes);
    let status = StatusReporter::new(store.clone(), config.status_poll_interval);
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), transport.clone(), config));
    Harness {
        store,
        transport,
        gateway,
        dispatcher,
        status,
    }
}

fn event(id: &str) -> RawEvent {
    RawEvent {
        id: Some(id.into()),
        source: Some("external".into()),
        event_type: Some("message".into()),
        payload: Some(json!({"text": "hi"})),
        idempotency_key: None,
    }
}

impl Harness {
    async fn accept(&self, id: &str) -> TaskHandle {
        self.gateway.accept(event(id)).await.unwrap()
    }

    /// Dispatches until the task leaves the retry loop, waiting out backoff.
    async fn drive(&self, handle: &TaskHandle) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::new();
        for _ in 0..200 {
            match self.dispatcher.dispatch(handle.task_id).await.unwrap() {
                DispatchOutcome::Skipped { status } if status == TaskStatus::Pending => {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                DispatchOutcome::Skipped { .. } => return outcomes,
                outcome => outcomes.push(outcome),
            }
        }
        panic!("task never settled: {outcomes:?}");
    }
}

// ---------------------------------------------------------------------------
// Accept
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resubmitted_event_returns_the_same_task() {
    let h = harness(ScriptedTransport::ok(), fast_config(3));

    let first = h.accept("evt-1").await;
    let second = h.accept("evt-1").await;

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.task_id, second.task_id);
    assert_eq!(h.store.inner.len(), 1);
}

#[tokio::test]
async fn resubmission_after_delivery_does_not_deliver_again() {
    let h = harness(ScriptedTransport::ok(), fast_config(3));
    let handle = h.accept("evt-1").await;
    h.drive(&handle).await;

    let again = h.accept("evt-1").await;
    assert_eq!(again.task_id, handle.task_id);
    assert!(h.drive(&again).await.is_empty());
    assert_eq!(h.transport.calls(), 1);
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_delivery_records_one_attempt() {
    let h = harness(ScriptedTransport::ok(), fast_config(3));
    let handle = h.accept("evt-1").await;

    let outcomes = h.drive(&handle).await;
    assert_eq!(
        outcomes,
        vec![DispatchOutcome::Succeeded {
            attempt: 1,
            http_status: 200
        }]
    );

    let view = h.status.get_status(handle.task_id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Succeeded);
    assert_eq!(view.attempts, 1);
    assert!(view.history[0].succeeded());

    let seen = h.transport.seen.lock().unwrap();
    assert_eq!(seen[0].idempotency_key.as_str(), "evt-1");
    assert_eq!(seen[0].attempt_number, 1);
    assert_eq!(seen[0].payload, json!({"text": "hi"}));
}

#[tokio::test]
async fn failing_target_exhausts_the_retry_budget() {
    let h = harness(ScriptedTransport::http(500), fast_config(3));
    let handle = h.accept("evt-1").await;

    let outcomes = h.drive(&handle).await;
    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[0], DispatchOutcome::RetryScheduled { attempt: 1, .. }));
    assert!(matches!(outcomes[1], DispatchOutcome::RetryScheduled { attempt: 2, .. }));
    assert_eq!(outcomes[2], DispatchOutcome::Failed { attempt: 3 });

    let view = h.status.get_status(handle.task_id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.attempts, 3);
    assert_eq!(view.last_error.as_deref(), Some("http 500"));

    let numbers: Vec<u32> = view.history.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    for pair in view.history.windows(2) {
        assert!(pair[0].finished_at < pair[1].started_at);
    }
    assert!(view.history.iter().all(|a| a.http_status == Some(500)));
}

#[tokio::test]
async fn transient_failure_then_success() {
    let transport = ScriptedTransport::ok().then(Err(DispatchError::HttpStatus {
        status: 503,
        retry_after: None,
    }));
    let h = harness(transport, fast_config(3));
    let handle = h.accept("evt-1").await;

    let outcomes = h.drive(&handle).await;
    assert_eq!(
        outcomes.last(),
        Some(&DispatchOutcome::Succeeded {
            attempt: 2,
            http_status: 200
        })
    );
    let view = h.status.get_status(handle.task_id).await.unwrap();
    assert_eq!(view.attempts, 2);
    assert_eq!(view.history[0].error.as_deref(), Some("http 503"));
    assert_eq!(view.history[1].error, None);
}

#[tokio::test]
async fn retry_is_not_claimable_before_its_delay() {
    let mut config = fast_config(3);
    config.backoff.base_delay = Duration::from_secs(60);
    config.backoff.max_delay = Duration::from_secs(60);
    let h = harness(ScriptedTransport::http(500), config);
    let handle = h.accept("evt-1").await;

    let first = h.dispatcher.dispatch(handle.task_id).await.unwrap();
    assert!(matches!(first, DispatchOutcome::RetryScheduled { attempt: 1, .. }));

    let second = h.dispatcher.dispatch(handle.task_id).await.unwrap();
    assert_eq!(
        second,
        DispatchOutcome::Skipped {
            status: TaskStatus::Pending
        }
    );
    assert_eq!(h.transport.calls(), 1);
}

#[tokio::test]
async fn slow_target_is_recorded_as_timeout() {
    let mut config = fast_config(1);
    config.attempt_timeout = Duration::from_millis(20);
    let h = harness(ScriptedTransport::ok().slow(Duration::from_millis(500)), config);
    let handle = h.accept("evt-1").await;

    assert_eq!(h.drive(&handle).await, vec![DispatchOutcome::Failed { attempt: 1 }]);

    let view = h.status.get_status(handle.task_id).await.unwrap();
    assert_eq!(view.history[0].error.as_deref(), Some("timeout"));
    assert_eq!(view.history[0].http_status, None);
}

#[tokio::test]
async fn non_retryable_failure_skips_remaining_budget() {
    let h = harness(
        ScriptedTransport::always(Err(DispatchError::InvalidRequest {
            message: "bad header".into(),
        })),
        fast_config(5),
    );
    let handle = h.accept("evt-1").await;

    assert_eq!(h.drive(&handle).await, vec![DispatchOutcome::Failed { attempt: 1 }]);
    assert_eq!(h.transport.calls(), 1);
}

#[tokio::test]
async fn concurrent_dispatch_delivers_once() {
    const WORKERS: usize = 8;
    let h = harness_holding(
        ScriptedTransport::ok().slow(Duration::from_millis(20)),
        fast_config(3),
        WORKERS,
    );
    let handle = h.accept("evt-1").await;

    // Every worker reads the task as due before any of them claims it.
    let attempts: Vec<_> = (0..WORKERS)
        .map(|_| {
            let dispatcher = h.dispatcher.clone();
            let task_id = handle.task_id;
            tokio::spawn(async move { dispatcher.dispatch(task_id).await })
        })
        .collect();
    h.store.wait_until_parked(WORKERS).await;
    h.store.release(WORKERS);

    let outcomes: Vec<DispatchOutcome> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let winners = outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Succeeded { .. }))
        .count();
    let contended = outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Contended { .. }))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(contended, WORKERS - 1);
    assert_eq!(h.dispatcher.claim_conflicts(), (WORKERS - 1) as u64);
    assert_eq!(h.transport.calls(), 1);
}

#[tokio::test]
async fn stale_claim_does_not_bypass_retry_delay() {
    let mut config = fast_config(3);
    config.backoff.base_delay = Duration::from_secs(60);
    config.backoff.max_delay = Duration::from_secs(60);
    let h = harness_holding(ScriptedTransport::http(500), config, 1);
    let handle = h.accept("evt-1").await;

    // The first worker reads the task as due, then stalls before claiming.
    let dispatcher = h.dispatcher.clone();
    let task_id = handle.task_id;
    let stalled = tokio::spawn(async move { dispatcher.dispatch(task_id).await });
    h.store.wait_until_parked(1).await;

    // Meanwhile a second worker fails the attempt and schedules a retry.
    let rescheduled = h.dispatcher.dispatch(task_id).await.unwrap();
    assert!(matches!(
        rescheduled,
        DispatchOutcome::RetryScheduled { attempt: 1, .. }
    ));

    h.store.release(1);
    let outcome = stalled.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Contended {
            actual: TaskStatus::Pending
        }
    );
    assert_eq!(h.transport.calls(), 1);
    assert_eq!(h.dispatcher.claim_conflicts(), 1);

    let view = h.status.get_status(task_id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Pending);
    assert_eq!(view.attempts, 1);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelling_a_pending_task() {
    let h = harness(ScriptedTransport::ok(), fast_config(3));
    let handle = h.accept("evt-1").await;

    let task = h.dispatcher.cancel(handle.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);

    assert!(h.drive(&handle).await.is_empty());
    assert_eq!(h.transport.calls(), 0);
}

#[tokio::test]
async fn cancelling_a_terminal_task_is_rejected() {
    let h = harness(ScriptedTransport::ok(), fast_config(3));
    let handle = h.accept("evt-1").await;
    h.drive(&handle).await;

    let err = h.dispatcher.cancel(handle.task_id).await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::InvalidTransition {
            from: TaskStatus::Succeeded,
            to: TaskStatus::Cancelled,
            ..
        }
    ));
}

#[tokio::test]
async fn result_arriving_after_cancel_is_discarded() {
    let h = harness(
        ScriptedTransport::ok().slow(Duration::from_millis(200)),
        fast_config(3),
    );
    let handle = h.accept("evt-1").await;

    let dispatcher = h.dispatcher.clone();
    let task_id = handle.task_id;
    let in_flight = tokio::spawn(async move { dispatcher.dispatch(task_id).await });

    for _ in 0..100 {
        if h.status.get_status(task_id).await.unwrap().status == TaskStatus::Dispatching {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    h.dispatcher.cancel(task_id).await.unwrap();

    let outcome = in_flight.await.unwrap().unwrap();
    assert_eq!(outcome, DispatchOutcome::Discarded { attempt: 1 });

    let view = h.status.get_status(task_id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Cancelled);
    assert_eq!(view.attempts, 0);
    assert!(view.history.is_empty());
}

// ---------------------------------------------------------------------------
// Workers and status
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_pool_delivers_every_accepted_event() {
    let h = harness(ScriptedTransport::ok(), fast_config(3));
    let shutdown = CancellationToken::new();
    let pool = WorkerPool::spawn(h.dispatcher.clone(), shutdown.clone());

    let mut handles = Vec::new();
    for i in 0..5 {
        handles.push(h.accept(&format!("evt-{i}")).await);
        h.dispatcher.wake();
    }

    let settled = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let page = h
                .status
                .list(
                    &TaskFilter {
                        status: Some(TaskStatus::Succeeded),
                        ..Default::default()
                    },
                    PageRequest::default(),
                )
                .await
                .unwrap();
            if page.items.len() == handles.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(settled.is_ok(), "workers did not deliver every task");

    pool.shutdown().await;
    assert_eq!(h.transport.calls(), 5);
}

#[tokio::test]
async fn worker_pool_stops_on_shutdown() {
    let h = harness(ScriptedTransport::ok(), fast_config(3));
    let shutdown = CancellationToken::new();
    let pool = WorkerPool::spawn(h.dispatcher.clone(), shutdown.clone());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), pool.join())
        .await
        .expect("workers should exit once cancelled");
}

#[tokio::test]
async fn subscription_ends_after_terminal_status() {
    let h = harness(ScriptedTransport::ok(), fast_config(3));
    let handle = h.accept("evt-1").await;

    let updates = h.status.subscribe(handle.task_id).await.unwrap();

    let dispatcher = h.dispatcher.clone();
    let task_id = handle.task_id;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.dispatch(task_id).await
    });

    let views: Vec<_> = tokio::time::timeout(Duration::from_secs(2), updates.collect::<Vec<_>>())
        .await
        .expect("subscription should end");
    let statuses: Vec<TaskStatus> = views.into_iter().map(|v| v.unwrap().status).collect();
    assert_eq!(statuses.first(), Some(&TaskStatus::Pending));
    assert_eq!(statuses.last(), Some(&TaskStatus::Succeeded));
}

#[tokio::test]
async fn subscribing_to_unknown_task_fails_immediately() {
    let h = harness(ScriptedTransport::ok(), fast_config(3));
    let result = h.status.subscribe(bridge::TaskId::new_random()).await;
    assert!(matches!(result, Err(RegistryError::TaskNotFound { .. })));
}

#[tokio::test]
async fn status_listing_pages_through_tasks() {
    let h = harness(ScriptedTransport::ok(), fast_config(3));
    for i in 0..5 {
        h.accept(&format!("evt-{i}")).await;
    }

    let first = h
        .status
        .list(&TaskFilter::default(), PageRequest { cursor: None, limit: 2 })
        .await
        .unwrap();
    assert_eq!(first.items.len(), 2);
    assert!(first.next_cursor.is_some());

    let all: Vec<_> = h
        .status
        .stream_tasks(TaskFilter::default(), first.next_cursor.clone())
        .collect()
        .await;
    assert_eq!(all.len(), 3);
}

//! Task broker: task lifecycle, queueing and event fan-out.
//!
//! The broker is the single writer of task state. It owns:
//!
//! - the FIFO queue of `open` tasks that workers claim from
//! - the [`TaskRegistry`] used for point-in-time queries
//! - the [`EventStore`] holding each task's event log
//! - one append lock and one watermark channel per task
//!
//! Every mutation of a task (log append, stage update, completion) takes the
//! task's append lock, checks the task status, appends to the event store,
//! updates the registry and finally publishes the new watermark. Observers
//! are woken by the watermark and read the store themselves, so appends never
//! wait on observers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::metrics::MetricsCollector;

use super::event_store::{EventStore, MemoryEventStore};
use super::registry::TaskRegistry;
use super::subscription::{deliver, EventCallback, EventStream, Subscription, Watermark};
use super::types::{
    EventBody, StageUpdate, Task, TaskEvent, TaskFailure, TaskSnapshot, TaskSpec, TaskStatus,
};

/// Task lifecycle and queueing operations.
///
/// Implementations must be safe under concurrent callers: two concurrent
/// `claim` calls never return the same task, and at most one `completion`
/// event is ever appended per task.
#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Creates an `open` task and returns its id immediately.
    async fn dispatch(&self, spec: TaskSpec) -> Result<Uuid, BrokerError>;

    /// Takes the oldest `open` task and moves it to `processing`.
    ///
    /// Returns `Ok(None)` when nothing is open; that is not an error.
    async fn claim(&self) -> Result<Option<Task>, BrokerError>;

    /// Records that the worker holding a claim is still alive.
    async fn heartbeat(&self, task_id: Uuid) -> Result<(), BrokerError>;

    /// Appends a `log` event to a `processing` task.
    async fn emit_log(&self, task_id: Uuid, body: EventBody) -> Result<u64, BrokerError>;

    /// Records a stage transition for a `processing` task.
    async fn update_stage(
        &self,
        task_id: Uuid,
        stage: &str,
        update: StageUpdate,
    ) -> Result<(), BrokerError>;

    /// Appends the `completion` event and sets the terminal status.
    async fn complete(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        error: Option<TaskFailure>,
        output: Option<Value>,
    ) -> Result<u64, BrokerError>;

    /// Registers a callback for every event appended after `after`.
    ///
    /// `after = None` replays the whole stream.
    async fn observe(
        &self,
        task_id: Uuid,
        after: Option<u64>,
        on_events: EventCallback,
    ) -> Result<Subscription, BrokerError>;

    /// Returns the current view of a task.
    async fn get(&self, task_id: Uuid) -> Result<TaskSnapshot, BrokerError>;

    /// Suspends until a task may be available or `timeout` elapses.
    async fn wait_for_dispatch(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }

    /// Opens a [`futures::Stream`] of a task's events.
    async fn subscribe(&self, task_id: Uuid, after: Option<u64>) -> Result<EventStream, BrokerError> {
        let (callback, rx) = EventStream::channel();
        let subscription = self.observe(task_id, after, callback).await?;
        Ok(EventStream::new(rx, subscription))
    }
}

/// Per-task append serialization and watermark publication.
struct TaskSlot {
    append_lock: tokio::sync::Mutex<()>,
    watermark: watch::Sender<Watermark>,
}

impl TaskSlot {
    fn new() -> Self {
        let (watermark, _) = watch::channel(Watermark::default());
        Self {
            append_lock: tokio::sync::Mutex::new(()),
            watermark,
        }
    }
}

/// In-process task broker.
pub struct MemoryTaskBroker {
    store: Arc<dyn EventStore>,
    registry: Arc<TaskRegistry>,
    queue: Mutex<VecDeque<Uuid>>,
    slots: RwLock<HashMap<Uuid, Arc<TaskSlot>>>,
    dispatched: Notify,
    metrics: MetricsCollector,
}

impl Default for MemoryTaskBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskBroker {
    /// Creates a broker backed by a [`MemoryEventStore`].
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryEventStore::new()))
    }

    /// Creates a broker over an existing event store.
    pub fn with_store(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            registry: Arc::new(TaskRegistry::new()),
            queue: Mutex::new(VecDeque::new()),
            slots: RwLock::new(HashMap::new()),
            dispatched: Notify::new(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Read access to the task registry.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Number of tasks waiting to be claimed.
    pub fn open_tasks(&self) -> usize {
        self.queue.lock().expect("queue lock poisoned").len()
    }

    /// Reads a task's events with `offset >= from`.
    pub async fn events(&self, task_id: Uuid, from: u64) -> Result<Vec<TaskEvent>, BrokerError> {
        Ok(self.store.read_from(task_id, from).await?)
    }

    fn slot(&self, task_id: Uuid) -> Result<Arc<TaskSlot>, BrokerError> {
        self.slots
            .read()
            .expect("slots read lock poisoned")
            .get(&task_id)
            .cloned()
            .ok_or(BrokerError::TaskNotFound(task_id))
    }

    fn require_processing(&self, task_id: Uuid, action: &str) -> Result<(), BrokerError> {
        match self.registry.status(task_id) {
            None => Err(BrokerError::TaskNotFound(task_id)),
            Some(TaskStatus::Processing) => Ok(()),
            Some(status) => Err(BrokerError::InvalidState {
                task_id,
                status,
                reason: format!("cannot {action} unless the task is processing"),
            }),
        }
    }

    /// Publishes a new watermark; `finished` once the completion is stored.
    fn publish(slot: &TaskSlot, offset: u64, finished: bool) {
        slot.watermark.send_replace(Watermark { offset, finished });
    }

    /// Appends while the caller holds the task's append lock.
    async fn append_locked(
        &self,
        task_id: Uuid,
        body: EventBody,
    ) -> Result<TaskEvent, BrokerError> {
        let event = self.store.append(task_id, body).await?;
        self.registry.set_offset(task_id, event.offset);
        Ok(event)
    }
}

#[async_trait]
impl TaskBroker for MemoryTaskBroker {
    async fn dispatch(&self, spec: TaskSpec) -> Result<Uuid, BrokerError> {
        let task_id = Uuid::new_v4();
        let template = spec.template_name().to_string();
        let slot = Arc::new(TaskSlot::new());

        self.store.create_stream(task_id).await?;
        self.registry.insert(Task::new(task_id, spec));
        self.slots
            .write()
            .expect("slots write lock poisoned")
            .insert(task_id, Arc::clone(&slot));

        {
            let _guard = slot.append_lock.lock().await;
            let event = self
                .append_locked(task_id, EventBody::Dispatch { template: template.clone() })
                .await?;
            Self::publish(&slot, event.offset, false);
        }

        let depth = {
            let mut queue = self.queue.lock().expect("queue lock poisoned");
            queue.push_back(task_id);
            queue.len()
        };
        self.dispatched.notify_one();
        self.metrics.record_dispatch(depth);

        info!(task_id = %task_id, template = %template, "Task dispatched");
        Ok(task_id)
    }

    async fn claim(&self) -> Result<Option<Task>, BrokerError> {
        loop {
            let (next, depth) = {
                let mut queue = self.queue.lock().expect("queue lock poisoned");
                let next = queue.pop_front();
                (next, queue.len())
            };
            let Some(task_id) = next else {
                return Ok(None);
            };
            self.metrics.set_open_tasks(depth);

            match self
                .registry
                .transition(task_id, TaskStatus::Open, TaskStatus::Processing)
            {
                Ok(Some(task)) => {
                    info!(task_id = %task_id, "Task claimed");
                    return Ok(Some(task));
                }
                // popped ids are unique, so this only happens if the record
                // vanished or moved on; skip it and try the next one
                Ok(None) | Err(_) => {
                    debug!(task_id = %task_id, "Skipping queued task that is no longer open");
                }
            }
        }
    }

    async fn heartbeat(&self, task_id: Uuid) -> Result<(), BrokerError> {
        self.require_processing(task_id, "heartbeat")?;
        self.registry.touch_heartbeat(task_id);
        Ok(())
    }

    async fn emit_log(&self, task_id: Uuid, body: EventBody) -> Result<u64, BrokerError> {
        let slot = self.slot(task_id)?;
        let _guard = slot.append_lock.lock().await;
        self.require_processing(task_id, "append a log event")?;

        if let EventBody::Log {
            message,
            stage: Some(stage),
        } = &body
        {
            self.registry.append_stage_log(task_id, stage, message);
        }

        let event = self.append_locked(task_id, body).await?;
        Self::publish(&slot, event.offset, false);
        Ok(event.offset)
    }

    async fn update_stage(
        &self,
        task_id: Uuid,
        stage: &str,
        update: StageUpdate,
    ) -> Result<(), BrokerError> {
        let slot = self.slot(task_id)?;
        let _guard = slot.append_lock.lock().await;
        self.require_processing(task_id, "update a stage")?;
        self.registry.update_stage(task_id, stage, update);
        Ok(())
    }

    async fn complete(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        error: Option<TaskFailure>,
        output: Option<Value>,
    ) -> Result<u64, BrokerError> {
        let slot = self.slot(task_id)?;
        let _guard = slot.append_lock.lock().await;

        let current = self
            .registry
            .status(task_id)
            .ok_or(BrokerError::TaskNotFound(task_id))?;
        if current.is_terminal() {
            return Err(BrokerError::InvalidState {
                task_id,
                status: current,
                reason: "task already has a completion event".to_string(),
            });
        }
        if current != TaskStatus::Processing {
            return Err(BrokerError::InvalidState {
                task_id,
                status: current,
                reason: "task was never claimed".to_string(),
            });
        }
        if !status.is_terminal() {
            return Err(BrokerError::InvalidState {
                task_id,
                status: current,
                reason: format!("'{status}' is not a terminal status"),
            });
        }

        let event = self
            .append_locked(
                task_id,
                EventBody::Completion {
                    status,
                    error: error.clone(),
                    output,
                },
            )
            .await?;
        self.registry.finish(task_id, status, error);
        Self::publish(&slot, event.offset, true);

        info!(task_id = %task_id, status = %status, "Task completed");
        Ok(event.offset)
    }

    async fn observe(
        &self,
        task_id: Uuid,
        after: Option<u64>,
        on_events: EventCallback,
    ) -> Result<Subscription, BrokerError> {
        let slot = self.slot(task_id)?;
        let subscription = Subscription::new(task_id);

        tokio::spawn(deliver(
            Arc::clone(&self.store),
            subscription.clone(),
            slot.watermark.subscribe(),
            after.unwrap_or(0),
            on_events,
        ));

        debug!(task_id = %task_id, after = ?after, "Subscription opened");
        Ok(subscription)
    }

    async fn get(&self, task_id: Uuid) -> Result<TaskSnapshot, BrokerError> {
        self.registry
            .get(task_id)
            .ok_or(BrokerError::TaskNotFound(task_id))
    }

    async fn wait_for_dispatch(&self, timeout: Duration) {
        if self.open_tasks() > 0 {
            return;
        }
        let _ = tokio::time::timeout(timeout, self.dispatched.notified()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TemplateEntity;
    use crate::error::ErrorKind;
    use crate::tasks::ObservedEvents;
    use futures::StreamExt;
    use serde_json::json;
    use std::collections::HashSet;

    fn spec(name: &str) -> TaskSpec {
        TaskSpec::new(TemplateEntity::new(name, "tera"), json!({"component_id": "foo"}))
    }

    #[tokio::test]
    async fn test_dispatch_creates_open_task() {
        let broker = MemoryTaskBroker::new();
        let id = broker.dispatch(spec("react-app")).await.unwrap();

        let snapshot = broker.get(id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Open);
        assert_eq!(snapshot.last_offset, 1);
        assert_eq!(broker.open_tasks(), 1);

        let events = broker.events(id, 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].body.event_type(), "dispatch");
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_empty_is_none() {
        let broker = MemoryTaskBroker::new();
        assert!(broker.claim().await.unwrap().is_none());

        let first = broker.dispatch(spec("a")).await.unwrap();
        let second = broker.dispatch(spec("b")).await.unwrap();

        let claimed = broker.claim().await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(broker.claim().await.unwrap().unwrap().id, second);
        assert!(broker.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let broker = Arc::new(MemoryTaskBroker::new());
        for i in 0..50 {
            broker.dispatch(spec(&format!("t{i}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let broker = Arc::clone(&broker);
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(task) = broker.claim().await.unwrap() {
                    claimed.push(task.id);
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "task {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[tokio::test]
    async fn test_complete_twice_is_rejected() {
        let broker = MemoryTaskBroker::new();
        let id = broker.dispatch(spec("a")).await.unwrap();
        broker.claim().await.unwrap();

        broker
            .complete(id, TaskStatus::Completed, None, None)
            .await
            .unwrap();
        let err = broker
            .complete(id, TaskStatus::Failed, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let completions = broker
            .events(id, 0)
            .await
            .unwrap()
            .into_iter()
            .filter(TaskEvent::is_completion)
            .count();
        assert_eq!(completions, 1);
        assert_eq!(broker.get(id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_complete_requires_claim_and_terminal_status() {
        let broker = MemoryTaskBroker::new();
        let id = broker.dispatch(spec("a")).await.unwrap();

        let err = broker
            .complete(id, TaskStatus::Completed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidState { status: TaskStatus::Open, .. }));

        broker.claim().await.unwrap();
        let err = broker
            .complete(id, TaskStatus::Open, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let broker = MemoryTaskBroker::new();
        let id = Uuid::new_v4();

        assert!(matches!(broker.get(id).await, Err(BrokerError::TaskNotFound(_))));
        assert!(matches!(
            broker.emit_log(id, EventBody::log("x")).await,
            Err(BrokerError::TaskNotFound(_))
        ));
        assert!(matches!(
            broker.complete(id, TaskStatus::Failed, None, None).await,
            Err(BrokerError::TaskNotFound(_))
        ));
        assert!(broker
            .observe(id, None, Box::new(|_| {}))
            .await
            .is_err());
        assert!(matches!(broker.heartbeat(id).await, Err(BrokerError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_log_after_completion_is_rejected() {
        let broker = MemoryTaskBroker::new();
        let id = broker.dispatch(spec("a")).await.unwrap();
        broker.claim().await.unwrap();
        broker.emit_log(id, EventBody::log("working")).await.unwrap();
        broker
            .complete(id, TaskStatus::Failed, None, None)
            .await
            .unwrap();

        let err = broker.emit_log(id, EventBody::log("late")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_heartbeat_only_while_processing() {
        let broker = MemoryTaskBroker::new();
        let id = broker.dispatch(spec("a")).await.unwrap();
        assert!(broker.heartbeat(id).await.is_err());

        broker.claim().await.unwrap();
        broker.heartbeat(id).await.unwrap();
        let task = broker.registry().task(id).unwrap();
        assert!(task.last_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn test_subscribe_replays_and_closes_on_completion() {
        let broker = MemoryTaskBroker::new();
        let id = broker.dispatch(spec("a")).await.unwrap();
        broker.claim().await.unwrap();
        broker.emit_log(id, EventBody::log("one")).await.unwrap();

        let mut stream = broker.subscribe(id, None).await.unwrap();

        broker.emit_log(id, EventBody::log("two")).await.unwrap();
        broker
            .complete(id, TaskStatus::Completed, None, Some(json!({"ok": true})))
            .await
            .unwrap();

        let events: Vec<TaskEvent> = (&mut stream).collect().await;
        let offsets: Vec<u64> = events.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![1, 2, 3, 4]);
        assert!(events.last().unwrap().is_completion());
        assert!(stream.subscription().is_closed());
    }

    #[tokio::test]
    async fn test_subscribe_after_offset() {
        let broker = MemoryTaskBroker::new();
        let id = broker.dispatch(spec("a")).await.unwrap();
        broker.claim().await.unwrap();
        for i in 0..3 {
            broker.emit_log(id, EventBody::log(i.to_string())).await.unwrap();
        }
        broker
            .complete(id, TaskStatus::Completed, None, None)
            .await
            .unwrap();

        let stream = broker.subscribe(id, Some(3)).await.unwrap();
        let offsets: Vec<u64> = stream.map(|e| e.offset).collect().await;
        assert_eq!(offsets, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_wait_for_dispatch_wakes_on_new_task() {
        let broker = Arc::new(MemoryTaskBroker::new());
        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                let started = std::time::Instant::now();
                broker.wait_for_dispatch(Duration::from_secs(30)).await;
                started.elapsed()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.dispatch(spec("a")).await.unwrap();

        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_subscribe_at_or_past_completion_ends() {
        let broker = MemoryTaskBroker::new();
        let id = broker.dispatch(spec("a")).await.unwrap();
        broker.claim().await.unwrap();
        broker.emit_log(id, EventBody::log("only")).await.unwrap();
        let last = broker
            .complete(id, TaskStatus::Completed, None, None)
            .await
            .unwrap();

        for after in [last, last + 5] {
            let mut stream = broker.subscribe(id, Some(after)).await.unwrap();
            let next = tokio::time::timeout(Duration::from_secs(2), stream.next_event())
                .await
                .expect("stream should end instead of waiting");
            assert!(next.is_none());
            assert!(stream.subscription().is_closed());
        }
    }

    #[tokio::test]
    async fn test_panicking_observer_does_not_affect_task() {
        let broker = MemoryTaskBroker::new();
        let id = broker.dispatch(spec("a")).await.unwrap();
        broker.claim().await.unwrap();

        let broken = broker
            .observe(id, None, Box::new(|_| panic!("client gone")))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), broken.closed())
            .await
            .expect("panicking observer should be closed");

        let mut healthy = broker.subscribe(id, None).await.unwrap();
        broker.emit_log(id, EventBody::log("still running")).await.unwrap();
        broker
            .complete(id, TaskStatus::Completed, None, None)
            .await
            .unwrap();

        let offsets: Vec<u64> = (&mut healthy).map(|e| e.offset).collect().await;
        assert_eq!(offsets, vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_subscribe_and_unsubscribe_during_appends() {
        const LINES: u64 = 300;

        let broker = Arc::new(MemoryTaskBroker::new());
        let id = broker.dispatch(spec("busy")).await.unwrap();
        broker.claim().await.unwrap();

        let writer = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                for i in 0..LINES {
                    broker
                        .emit_log(id, EventBody::log(format!("line {i}")))
                        .await
                        .unwrap();
                    if i % 25 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                broker
                    .complete(id, TaskStatus::Completed, None, None)
                    .await
                    .unwrap()
            })
        };

        // observers join at staggered points; some start from an offset and
        // every third one leaves early
        let mut observers = Vec::new();
        for i in 0..24_u64 {
            let broker = Arc::clone(&broker);
            observers.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_micros(i * 150)).await;
                let after = (i % 4 == 1).then_some(i * 5);
                let leave_at = (i % 3 == 0).then_some(i * 7 + 10);

                let seen = Arc::new(Mutex::new(Vec::<u64>::new()));
                let sink = Arc::clone(&seen);
                let subscription = broker
                    .observe(
                        id,
                        after,
                        Box::new(move |observed: ObservedEvents<'_>| {
                            let mut seen = sink.lock().unwrap();
                            seen.extend(observed.events.iter().map(|e| e.offset));
                            let reached = seen.last().copied().unwrap_or(0);
                            if leave_at.is_some_and(|limit| reached >= limit) {
                                observed.subscription.unsubscribe();
                            }
                        }),
                    )
                    .await
                    .unwrap();

                tokio::time::timeout(Duration::from_secs(10), subscription.closed())
                    .await
                    .expect("subscription should close");
                let seen = seen.lock().unwrap().clone();
                (after.unwrap_or(0), leave_at, seen)
            }));
        }

        // streams dropped part way through
        let mut dropped = Vec::new();
        for i in 0..8_u64 {
            let broker = Arc::clone(&broker);
            dropped.push(tokio::spawn(async move {
                let mut stream = broker.subscribe(id, None).await.unwrap();
                let mut offsets = Vec::new();
                while let Some(event) = stream.next_event().await {
                    offsets.push(event.offset);
                    if offsets.len() as u64 > 20 + i * 10 {
                        break;
                    }
                }
                offsets
            }));
        }

        let final_offset = writer.await.unwrap();
        assert_eq!(final_offset, LINES + 2);

        for observer in observers {
            let (after, leave_at, seen) = observer.await.unwrap();
            let expected: Vec<u64> = (after + 1..=after + seen.len() as u64).collect();
            assert_eq!(seen, expected, "offsets must be gap-free and duplicate-free");
            if leave_at.is_none() {
                assert_eq!(seen.last().copied(), Some(final_offset));
            }
        }
        for stream in dropped {
            let offsets = stream.await.unwrap();
            let expected: Vec<u64> = (1..=offsets.len() as u64).collect();
            assert_eq!(offsets, expected);
        }

        assert_eq!(broker.get(id).await.unwrap().status, TaskStatus::Completed);
    }
}

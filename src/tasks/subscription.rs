//! Observer subscriptions over a task's event stream.
//!
//! Every subscription is driven by its own tokio task: it reads the event
//! store from its cursor, hands each non-empty batch to the callback, and
//! then parks until the broker signals a new append or the subscriber
//! unsubscribes. A slow callback therefore only delays its own subscription,
//! never the worker or other observers.
//!
//! Delivery contract: batches arrive in offset order, with no gaps and no
//! duplicates, starting right after the requested offset. The subscription
//! closes itself after the batch that carries the completion event.

use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics::MetricsCollector;

use super::event_store::EventStore;
use super::types::TaskEvent;

/// Highest appended offset of a task, and whether it was the completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Watermark {
    pub offset: u64,
    pub finished: bool,
}

/// Handle controlling one subscription.
///
/// Cloning yields another handle to the same subscription. `unsubscribe` is
/// idempotent and may be called from inside the delivery callback.
#[derive(Debug, Clone)]
pub struct Subscription {
    task_id: Uuid,
    closed: Arc<watch::Sender<bool>>,
}

impl Subscription {
    pub(crate) fn new(task_id: Uuid) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            task_id,
            closed: Arc::new(closed),
        }
    }

    /// Task this subscription observes.
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Stops further delivery.
    pub fn unsubscribe(&self) {
        self.closed.send_if_modified(|closed| !std::mem::replace(closed, true));
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the subscription is closed, by the client or after the
    /// completion event was delivered.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// One delivery to a subscription callback.
pub struct ObservedEvents<'a> {
    /// New events, in offset order.
    pub events: &'a [TaskEvent],
    /// The subscription being delivered to.
    pub subscription: &'a Subscription,
}

/// Callback invoked with every new batch of events.
pub type EventCallback = Box<dyn FnMut(ObservedEvents<'_>) + Send + 'static>;

/// Runs one subscription until it is closed.
pub(crate) async fn deliver(
    store: Arc<dyn EventStore>,
    subscription: Subscription,
    mut appended: watch::Receiver<Watermark>,
    after: u64,
    mut on_events: EventCallback,
) {
    let task_id = subscription.task_id();
    let mut cursor = after;
    let mut closed = subscription.closed.subscribe();
    MetricsCollector::new().subscription_opened();

    loop {
        if subscription.is_closed() {
            break;
        }

        // mark the watermark as seen before reading so an append racing
        // with the read still wakes us below
        let mark = *appended.borrow_and_update();

        let events = match store.read_from(task_id, cursor + 1).await {
            Ok(events) => events,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Subscription read failed, closing");
                break;
            }
        };

        if let Some(last) = events.last() {
            cursor = last.offset;
            let finished = events.iter().any(TaskEvent::is_completion);

            debug!(task_id = %task_id, count = events.len(), cursor, "Delivering events");
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                on_events(ObservedEvents {
                    events: &events,
                    subscription: &subscription,
                })
            }));
            if delivered.is_err() {
                warn!(task_id = %task_id, cursor, "Subscription callback panicked, closing");
                break;
            }

            if finished {
                break;
            }
            continue;
        }

        // started at or past the completion event: nothing left to deliver
        if mark.finished && cursor >= mark.offset {
            break;
        }

        tokio::select! {
            changed = appended.changed() => {
                if changed.is_err() {
                    // broker dropped the task stream
                    break;
                }
            }
            _ = closed.wait_for(|closed| *closed) => break,
        }
    }

    subscription.unsubscribe();
    MetricsCollector::new().subscription_closed();
    debug!(task_id = %task_id, cursor, "Subscription closed");
}

/// Stream of a task's events built on top of a subscription.
///
/// Ends after the completion event. Dropping the stream unsubscribes.
pub struct EventStream {
    inner: UnboundedReceiverStream<TaskEvent>,
    subscription: Subscription,
}

impl EventStream {
    /// Returns a callback that feeds the receiver half of a new stream.
    pub(crate) fn channel() -> (EventCallback, mpsc::UnboundedReceiver<TaskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let callback: EventCallback = Box::new(move |observed: ObservedEvents<'_>| {
            for event in observed.events {
                if tx.send(event.clone()).is_err() {
                    // receiver went away; stop feeding it
                    observed.subscription.unsubscribe();
                    return;
                }
            }
        });

        (callback, rx)
    }

    pub(crate) fn new(rx: mpsc::UnboundedReceiver<TaskEvent>, subscription: Subscription) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
            subscription,
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Receives the next event, `None` once the stream ended.
    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        futures::StreamExt::next(self).await
    }
}

impl Stream for EventStream {
    type Item = TaskEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::event_store::MemoryEventStore;
    use crate::tasks::types::{EventBody, TaskStatus};
    use std::time::Duration;

    async fn finished_stream(store: &MemoryEventStore, task_id: Uuid) -> Watermark {
        store.create_stream(task_id).await.unwrap();
        store.append(task_id, EventBody::log("hello")).await.unwrap();
        let completion = store
            .append(
                task_id,
                EventBody::Completion {
                    status: TaskStatus::Completed,
                    error: None,
                    output: None,
                },
            )
            .await
            .unwrap();
        Watermark {
            offset: completion.offset,
            finished: true,
        }
    }

    #[tokio::test]
    async fn test_subscription_past_completion_closes() {
        let store = Arc::new(MemoryEventStore::new());
        let task_id = Uuid::new_v4();
        let mark = finished_stream(&store, task_id).await;
        let (_tx, rx) = watch::channel(mark);

        let subscription = Subscription::new(task_id);
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        tokio::spawn(deliver(
            store,
            subscription.clone(),
            rx,
            mark.offset,
            Box::new(move |_| {
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        ));

        tokio::time::timeout(Duration::from_secs(2), subscription.closed())
            .await
            .expect("subscription should close");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_callback_closes_subscription() {
        let store = Arc::new(MemoryEventStore::new());
        let task_id = Uuid::new_v4();
        store.create_stream(task_id).await.unwrap();
        let event = store.append(task_id, EventBody::log("hello")).await.unwrap();
        let (_tx, rx) = watch::channel(Watermark {
            offset: event.offset,
            finished: false,
        });

        let subscription = Subscription::new(task_id);
        tokio::spawn(deliver(
            store,
            subscription.clone(),
            rx,
            0,
            Box::new(|_| panic!("client gone")),
        ));

        tokio::time::timeout(Duration::from_secs(2), subscription.closed())
            .await
            .expect("subscription should close after the callback panicked");
        assert!(subscription.is_closed());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let subscription = Subscription::new(Uuid::new_v4());
        assert!(!subscription.is_closed());

        subscription.unsubscribe();
        subscription.unsubscribe();
        assert!(subscription.is_closed());

        // resolves immediately once closed
        subscription.closed().await;
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let subscription = Subscription::new(Uuid::new_v4());
        let other = subscription.clone();

        let waiter = tokio::spawn(async move { other.closed().await });
        subscription.unsubscribe();
        waiter.await.expect("waiter should finish");
    }
}

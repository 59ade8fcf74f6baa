//! Topic-keyed publish/subscribe for multi-message result streams.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Event published on a topic.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// Enumeration result (JSON array).
    Enumeration(Value),
    /// One memory scan match.
    ScanMatch { address: String, metadata: Value },
    /// Zero-payload terminal event, published on the completion topic.
    Complete,
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Name of the completion topic paired with `topic`.
#[must_use]
pub fn completion_topic(topic: &str) -> String {
    format!("{topic} complete")
}

/// Mapping from topic to ordered subscriber callbacks.
///
/// Emission is synchronous: every subscriber present at the time of the call
/// runs in subscription order before `emit` returns. Nothing is queued for
/// later subscribers and stale subscriptions are never collected.
#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<String, Vec<(SubscriptionId, Subscriber)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `topic`.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.topics
            .lock()
            .entry(topic.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut topics = self.topics.lock();
        let Some(subscribers) = topics.get_mut(topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    /// Deliver `event` to every current subscriber of `topic`.
    ///
    /// Returns the number of subscribers invoked. Handlers may subscribe or
    /// unsubscribe re-entrantly; such changes apply to the next emission.
    pub fn emit(&self, topic: &str, event: &BusEvent) -> usize {
        let subscribers: Vec<Subscriber> = self
            .topics
            .lock()
            .get(topic)
            .map(|subs| subs.iter().map(|(_, s)| Arc::clone(s)).collect())
            .unwrap_or_default();

        if subscribers.is_empty() {
            tracing::debug!(%topic, "Event with no subscribers");
        }
        for subscriber in &subscribers {
            subscriber(event);
        }
        subscribers.len()
    }

    /// Number of subscribers on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, Vec::len)
    }

    /// Stream of events on `topic` that ends at the completion event.
    ///
    /// Subscribes to both `topic` and its completion topic immediately, so
    /// it must be called before the triggering request is issued. Both
    /// subscriptions are removed when completion is observed or the stream is
    /// dropped.
    #[must_use]
    pub fn stream(self: &Arc<Self>, topic: &str) -> TopicStream {
        let (tx, rx) = mpsc::unbounded_channel();

        let match_tx = tx.clone();
        let matches = self.subscribe(topic, move |event| {
            let _ = match_tx.send(event.clone());
        });
        let done = self.subscribe(completion_topic(topic), move |_| {
            let _ = tx.send(BusEvent::Complete);
        });

        TopicStream {
            bus: Arc::downgrade(self),
            topic: topic.to_string(),
            subscriptions: Some((matches, done)),
            rx: UnboundedReceiverStream::new(rx),
        }
    }
}

/// Self-unsubscribing stream over one topic. See [`EventBus::stream`].
pub struct TopicStream {
    bus: Weak<EventBus>,
    topic: String,
    subscriptions: Option<(SubscriptionId, SubscriptionId)>,
    rx: UnboundedReceiverStream<BusEvent>,
}

impl TopicStream {
    /// Topic this stream listens on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn close(&mut self) {
        let Some((matches, done)) = self.subscriptions.take() else {
            return;
        };
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(&self.topic, matches);
            bus.unsubscribe(&completion_topic(&self.topic), done);
        }
    }
}

impl Stream for TopicStream {
    type Item = BusEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.subscriptions.is_none() {
            return Poll::Ready(None);
        }
        match this.rx.poll_next_unpin(cx) {
            Poll::Ready(Some(BusEvent::Complete) | None) => {
                this.close();
                Poll::Ready(None)
            }
            Poll::Ready(Some(event)) => Poll::Ready(Some(event)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TopicStream {
    fn drop(&mut self) {
        self.close();
    }
}

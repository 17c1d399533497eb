//! Topic-based fan-out over tokio channels.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Identifies one attached subscriber.
pub type SubscriberId = u64;

/// A payload as delivered, together with the topic it was published on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<M> {
    pub topic: String,
    pub payload: M,
}

struct Inner<M> {
    next_id: SubscriberId,
    queues: BTreeMap<SubscriberId, mpsc::UnboundedSender<Message<M>>>,
    topics: BTreeMap<String, BTreeSet<SubscriberId>>,
}

impl<M> Inner<M> {
    fn detach(&mut self, id: SubscriberId) {
        self.queues.remove(&id);
        self.topics.retain(|_, subscribers| {
            subscribers.remove(&id);
            !subscribers.is_empty()
        });
    }
}

type Shared<M> = Arc<Mutex<Inner<M>>>;

fn lock<M>(inner: &Mutex<Inner<M>>) -> MutexGuard<'_, Inner<M>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-process publish/subscribe broker.
///
/// Every subscriber owns an unbounded FIFO queue, so a subscriber sees the
/// messages of its topics in publish order. Cloning a broker yields another
/// handle to the same topics.
///
/// # Example
///
/// ```ignore
/// let broker = Broker::new();
/// let mut subscriber = broker.attach();
/// broker.subscribe(&subscriber, ["orders"]);
///
/// broker.publish("orders", "created".to_string());
/// let message = subscriber.next_message().await.unwrap();
/// assert_eq!(message.payload, "created");
/// ```
pub struct Broker<M> {
    inner: Shared<M>,
}

impl<M> Clone for Broker<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> Default for Broker<M> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                queues: BTreeMap::new(),
                topics: BTreeMap::new(),
            })),
        }
    }
}

impl<M: Clone + Send> Broker<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a subscriber with an empty topic set.
    pub fn attach(&self) -> Subscriber<M> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.queues.insert(id, tx);
        trace!(subscriber = id, "attached");

        Subscriber {
            id,
            rx,
            broker: Arc::downgrade(&self.inner),
        }
    }

    /// Add topics to a subscriber. Subscribing twice to a topic is a no-op.
    pub fn subscribe<I, T>(&self, subscriber: &Subscriber<M>, topics: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut inner = lock(&self.inner);
        if !inner.queues.contains_key(&subscriber.id) {
            return;
        }
        for topic in topics {
            let topic = topic.into();
            debug!(subscriber = subscriber.id, %topic, "subscribed");
            inner.topics.entry(topic).or_default().insert(subscriber.id);
        }
    }

    /// Remove topics from a subscriber. Messages already queued stay queued.
    pub fn unsubscribe<I, T>(&self, subscriber: &Subscriber<M>, topics: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut inner = lock(&self.inner);
        for topic in topics {
            let topic = topic.into();
            if let Some(subscribers) = inner.topics.get_mut(&topic) {
                subscribers.remove(&subscriber.id);
                if subscribers.is_empty() {
                    inner.topics.remove(&topic);
                }
            }
        }
    }

    /// Deliver `payload` to every subscriber of `topic`, returning how many
    /// received it.
    pub fn publish(&self, topic: &str, payload: M) -> usize {
        let mut inner = lock(&self.inner);
        let Some(subscribers) = inner.topics.get(topic) else {
            trace!(topic, "published with no subscribers");
            return 0;
        };

        let mut delivered = 0;
        let mut gone = Vec::new();
        for id in subscribers {
            let sent = inner.queues.get(id).is_some_and(|tx| {
                tx.send(Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
            });
            if sent {
                delivered += 1;
            } else {
                gone.push(*id);
            }
        }

        for id in gone {
            debug!(subscriber = id, "pruning closed subscriber");
            inner.detach(id);
        }
        trace!(topic, delivered, "published");
        delivered
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).queues.len()
    }

    /// Number of subscribers currently on `topic`.
    pub fn topic_subscribers(&self, topic: &str) -> usize {
        lock(&self.inner).topics.get(topic).map_or(0, BTreeSet::len)
    }
}

/// The receiving end of a broker attachment.
///
/// Dropping a subscriber detaches it from every topic.
pub struct Subscriber<M> {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<Message<M>>,
    broker: Weak<Mutex<Inner<M>>>,
}

impl<M> Subscriber<M> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next message. Returns `None` once the broker is gone
    /// and the queue is drained.
    pub async fn next_message(&mut self) -> Option<Message<M>> {
        self.rx.recv().await
    }

    /// Take the next queued message without waiting.
    pub fn try_next_message(&mut self) -> Option<Message<M>> {
        self.rx.try_recv().ok()
    }
}

impl<M> Drop for Subscriber<M> {
    fn drop(&mut self) {
        if let Some(inner) = self.broker.upgrade() {
            lock(&inner).detach(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let broker = Broker::new();
        let mut subscriber = broker.attach();
        broker.subscribe(&subscriber, ["a", "b"]);

        broker.publish("a", 1);
        broker.publish("b", 2);
        broker.publish("a", 3);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let message = subscriber.next_message().await.unwrap();
            seen.push((message.topic, message.payload));
        }
        assert_eq!(
            seen,
            vec![("a".to_string(), 1), ("b".to_string(), 2), ("a".to_string(), 3)]
        );
    }

    #[test]
    fn fans_out_to_every_subscriber() {
        let broker = Broker::new();
        let mut first = broker.attach();
        let mut second = broker.attach();
        let mut other = broker.attach();
        broker.subscribe(&first, ["topic"]);
        broker.subscribe(&second, ["topic"]);
        broker.subscribe(&other, ["elsewhere"]);

        assert_eq!(broker.publish("topic", "hi"), 2);
        assert_eq!(first.try_next_message().unwrap().payload, "hi");
        assert_eq!(second.try_next_message().unwrap().payload, "hi");
        assert!(other.try_next_message().is_none());
    }

    #[test]
    fn publish_without_subscribers_delivers_nothing() {
        let broker: Broker<u8> = Broker::new();
        assert_eq!(broker.publish("void", 0), 0);
    }

    #[test]
    fn duplicate_subscribe_delivers_once() {
        let broker = Broker::new();
        let mut subscriber = broker.attach();
        broker.subscribe(&subscriber, ["t"]);
        broker.subscribe(&subscriber, ["t"]);

        assert_eq!(broker.publish("t", ()), 1);
        assert!(subscriber.try_next_message().is_some());
        assert!(subscriber.try_next_message().is_none());
    }

    #[test]
    fn unsubscribe_stops_delivery_but_keeps_queue() {
        let broker = Broker::new();
        let mut subscriber = broker.attach();
        broker.subscribe(&subscriber, ["t"]);
        broker.publish("t", 1);
        broker.unsubscribe(&subscriber, ["t"]);

        assert_eq!(broker.publish("t", 2), 0);
        assert_eq!(broker.topic_subscribers("t"), 0);
        assert_eq!(subscriber.try_next_message().unwrap().payload, 1);
        assert!(subscriber.try_next_message().is_none());
    }

    #[test]
    fn dropped_subscriber_detaches() {
        let broker = Broker::new();
        let subscriber = broker.attach();
        broker.subscribe(&subscriber, ["t"]);
        assert_eq!(broker.subscriber_count(), 1);

        drop(subscriber);
        assert_eq!(broker.subscriber_count(), 0);
        assert_eq!(broker.publish("t", 1), 0);
    }

    #[tokio::test]
    async fn next_message_ends_when_broker_is_dropped() {
        let broker = Broker::new();
        let mut subscriber = broker.attach();
        broker.subscribe(&subscriber, ["t"]);
        broker.publish("t", 7);
        drop(broker);

        assert_eq!(subscriber.next_message().await.unwrap().payload, 7);
        assert!(subscriber.next_message().await.is_none());
    }

    #[tokio::test]
    async fn concurrent_publishers_reach_one_subscriber() {
        let broker = Broker::new();
        let mut subscriber = broker.attach();
        broker.subscribe(&subscriber, ["t"]);

        let mut tasks = Vec::new();
        for worker in 0..4u32 {
            let broker = broker.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..25u32 {
                    broker.publish("t", worker * 100 + i);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut per_worker = vec![Vec::new(); 4];
        while let Some(message) = subscriber.try_next_message() {
            per_worker[(message.payload / 100) as usize].push(message.payload % 100);
        }
        for received in per_worker {
            assert_eq!(received, (0..25).collect::<Vec<_>>());
        }
    }
}

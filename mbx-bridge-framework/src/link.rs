//! The publish/subscribe surface bridges talk to.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use mbx_common::TopicRoot;
use rumqttc::QoS;

use crate::settings::WillMessage;

/// Future returned by a topic handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback invoked with the payload of every message on a topic.
pub type TopicHandler = Arc<dyn Fn(String) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a [`TopicHandler`].
///
/// # Example
///
/// ```
/// use mbx_bridge_framework::topic_handler;
///
/// let handler = topic_handler(|payload| async move {
///     println!("received {}", payload);
/// });
/// # drop(handler);
/// ```
pub fn topic_handler<F, Fut>(f: F) -> TopicHandler
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

/// Connection to a message broker as seen by a bridge.
///
/// [`MqttSession`](crate::MqttSession) is the production implementation;
/// [`MemoryLink`](crate::MemoryLink) records traffic in memory.
pub trait MqttLink: Send + Sync {
    /// Whether the broker connection is currently up.
    fn is_connected(&self) -> bool;

    /// Counter bumped on every successful connect.
    fn connection_epoch(&self) -> u64;

    /// Root topic of the current settings.
    fn root_topic(&self) -> TopicRoot;

    /// Publish at the given QoS. Returns false if the message was not queued.
    fn publish_qos(&self, topic: &str, payload: &str, qos: QoS, retain: bool) -> bool;

    /// Best-effort QoS 0 publish.
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> bool {
        self.publish_qos(topic, payload, QoS::AtMostOnce, retain)
    }

    /// Replace the Last-Will used on the next connect.
    fn set_will(&self, will: Option<WillMessage>);

    /// Register a handler for a topic.
    fn add_handler(&self, topic: &str, handler: TopicHandler);

    /// Drop all handlers of the given topics.
    fn remove_handlers(&self, topics: &[String]);
}

/// Topic to handler table.
#[derive(Default, Clone)]
pub struct HandlerTable {
    entries: BTreeMap<String, Vec<TopicHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler. Returns true if the topic was not present before.
    pub fn add(&mut self, topic: &str, handler: TopicHandler) -> bool {
        let handlers = self.entries.entry(topic.to_string()).or_default();
        handlers.push(handler);
        handlers.len() == 1
    }

    /// Remove every handler of a topic. Returns true if the topic existed.
    pub fn remove(&mut self, topic: &str) -> bool {
        self.entries.remove(topic).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Registered topics in lexical order.
    pub fn topics(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Handlers for an exact topic.
    pub fn handlers_for(&self, topic: &str) -> Vec<TopicHandler> {
        self.entries.get(topic).cloned().unwrap_or_default()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("topics", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_add_reports_new_topics() {
        let mut table = HandlerTable::new();
        assert!(table.add("a", topic_handler(|_| async {})));
        assert!(!table.add("a", topic_handler(|_| async {})));
        assert!(table.add("b", topic_handler(|_| async {})));

        assert_eq!(table.topics(), vec!["a", "b"]);
        assert_eq!(table.handlers_for("a").len(), 2);
        assert!(table.handlers_for("c").is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let mut table = HandlerTable::new();
        table.add("a", topic_handler(|_| async {}));
        table.add("b", topic_handler(|_| async {}));

        assert!(table.remove("a"));
        assert!(!table.remove("a"));
        assert_eq!(table.len(), 1);

        table.clear();
        assert!(table.is_empty());
    }

    #[test]
    fn test_handler_receives_payload() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handler = topic_handler(move |payload| {
            let counter = counter.clone();
            async move {
                if payload == "ping" {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        tokio_test::block_on(handler("ping".to_string()));
        tokio_test::block_on(handler("pong".to_string()));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

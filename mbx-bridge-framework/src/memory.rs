//! In-memory [`MqttLink`] for tests and dry runs.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use mbx_common::TopicRoot;
use rumqttc::QoS;

use crate::link::{HandlerTable, MqttLink, TopicHandler};
use crate::settings::WillMessage;

/// A message recorded by [`MemoryLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

/// Link that records publishes and lets callers inject inbound messages.
#[derive(Debug)]
pub struct MemoryLink {
    root: TopicRoot,
    connected: AtomicBool,
    epoch: AtomicU64,
    accept_publishes: AtomicBool,
    refused_topics: Mutex<BTreeSet<String>>,
    published: Mutex<Vec<PublishedMessage>>,
    will: Mutex<Option<WillMessage>>,
    handlers: Mutex<HandlerTable>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryLink {
    /// Create a disconnected link for the given root topic.
    pub fn new(root: impl AsRef<str>) -> Self {
        Self {
            root: TopicRoot::new(root),
            connected: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            accept_publishes: AtomicBool::new(true),
            refused_topics: Mutex::new(BTreeSet::new()),
            published: Mutex::new(Vec::new()),
            will: Mutex::new(None),
            handlers: Mutex::new(HandlerTable::new()),
        }
    }

    /// Simulate a successful connect.
    pub fn connect(&self) {
        self.connected.store(true, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Simulate a lost connection.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Make publishes fail while connected, as with a full outgoing queue.
    pub fn set_accept_publishes(&self, accept: bool) {
        self.accept_publishes.store(accept, Ordering::Release);
    }

    /// Make publishes to one topic fail, or accept them again.
    pub fn refuse_topic(&self, topic: &str, refuse: bool) {
        let mut refused = lock(&self.refused_topics);
        if refuse {
            refused.insert(topic.to_string());
        } else {
            refused.remove(topic);
        }
    }

    /// Every message published so far.
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    /// Messages published to a topic.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        lock(&self.published)
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Forget recorded publishes.
    pub fn clear_published(&self) {
        lock(&self.published).clear();
    }

    /// Will currently configured.
    pub fn will(&self) -> Option<WillMessage> {
        lock(&self.will).clone()
    }

    /// Topics with registered handlers.
    pub fn handler_topics(&self) -> Vec<String> {
        lock(&self.handlers).topics()
    }

    /// Deliver an inbound message to the handlers of `topic`.
    ///
    /// Returns the number of handlers invoked.
    pub async fn deliver(&self, topic: &str, payload: &str) -> usize {
        let handlers = lock(&self.handlers).handlers_for(topic);
        for handler in &handlers {
            handler(payload.to_string()).await;
        }
        handlers.len()
    }
}

impl MqttLink for MemoryLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn connection_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn root_topic(&self) -> TopicRoot {
        self.root.clone()
    }

    fn publish_qos(&self, topic: &str, payload: &str, qos: QoS, retain: bool) -> bool {
        if !self.is_connected() || !self.accept_publishes.load(Ordering::Acquire) {
            return false;
        }
        if lock(&self.refused_topics).contains(topic) {
            return false;
        }
        lock(&self.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos,
            retain,
        });
        true
    }

    fn set_will(&self, will: Option<WillMessage>) {
        *lock(&self.will) = will;
    }

    fn add_handler(&self, topic: &str, handler: TopicHandler) {
        lock(&self.handlers).add(topic, handler);
    }

    fn remove_handlers(&self, topics: &[String]) {
        let mut table = lock(&self.handlers);
        for topic in topics {
            table.remove(topic);
        }
    }
}

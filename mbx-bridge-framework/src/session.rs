//! Long-lived MQTT session with automatic reconnect.
//!
//! [`MqttSession`] owns one broker connection. Its [`run`](MqttSession::run)
//! loop connects, re-subscribes every registered topic after each successful
//! CONNECT, and dispatches inbound messages to the handler table. Handlers
//! run inline on the loop, so two messages of the same topic are never
//! handled concurrently.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use mbx_common::TopicRoot;
use rand::Rng;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    QoS, SubscribeFilter,
};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::link::{HandlerTable, MqttLink, TopicHandler, topic_handler};
use crate::settings::{MqttConfig, MqttSettings, SecretStore, WillMessage};

/// Prefix of generated client identifiers.
pub const CLIENT_ID_PREFIX: &str = "MBX_CLIENT-";

const LOOP_DELAY: Duration = Duration::from_millis(100);
const REQUEST_CAPACITY: usize = 64;
/// Topic filters carried by one SUBSCRIBE packet.
const SUBSCRIBE_BATCH: usize = 16;
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Factory for bridge-specific handlers on the system topics.
///
/// Called with the current root topic every time the handler table is
/// rebuilt.
pub type SystemHandlers = Arc<dyn Fn(&TopicRoot) -> Vec<(String, TopicHandler)> + Send + Sync>;

/// Connection state of the session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disabled,
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disabled => "disabled",
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Generate a fresh client identifier.
pub fn generate_client_id() -> String {
    let suffix: u16 = rand::rng().random();
    format!("{}{:04X}", CLIENT_ID_PREFIX, suffix)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// MQTT session manager.
pub struct MqttSession {
    settings_path: Option<PathBuf>,
    secrets: SecretStore,
    settings: RwLock<MqttSettings>,
    will: Mutex<Option<WillMessage>>,
    handlers: Mutex<HandlerTable>,
    pending_subscriptions: Mutex<BTreeSet<String>>,
    system_handlers: Mutex<Option<SystemHandlers>>,
    client: Mutex<Option<AsyncClient>>,
    client_id: Mutex<String>,
    state: Mutex<SessionState>,
    enabled: AtomicBool,
    connected: AtomicBool,
    restart: AtomicBool,
    epoch: AtomicU64,
    wake: Notify,
}

impl MqttSession {
    /// Create a session from in-memory settings.
    ///
    /// The session starts disabled; call [`set_enabled`](Self::set_enabled)
    /// and spawn [`run`](Self::run).
    pub fn new(settings: MqttSettings) -> Self {
        let session = Self {
            settings_path: None,
            secrets: SecretStore::default(),
            settings: RwLock::new(settings),
            will: Mutex::new(None),
            handlers: Mutex::new(HandlerTable::new()),
            pending_subscriptions: Mutex::new(BTreeSet::new()),
            system_handlers: Mutex::new(None),
            client: Mutex::new(None),
            client_id: Mutex::new(String::new()),
            state: Mutex::new(SessionState::Disabled),
            enabled: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            restart: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            wake: Notify::new(),
        };
        session.install_system_handlers();
        session
    }

    /// Create a session backed by a settings document.
    pub fn from_config(config: &MqttConfig) -> Result<Self> {
        let secrets = config.secret_store();
        let settings = MqttSettings::load(&config.settings_path, &secrets)?;
        let mut session = Self::new(settings);
        session.settings_path = Some(config.settings_path.clone());
        session.secrets = secrets;
        Ok(session)
    }

    /// Replace the settings. Takes effect on the next connect.
    pub fn configure(&self, settings: MqttSettings) {
        *self
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Current settings.
    pub fn settings(&self) -> MqttSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install bridge-specific system handlers.
    pub fn set_system_handlers(&self, factory: SystemHandlers) {
        let root = self.root_topic();
        for (topic, handler) in factory(&root) {
            self.add_handler(&topic, handler);
        }
        *lock(&self.system_handlers) = Some(factory);
    }

    /// Enable or pause the session loop.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        self.wake.notify_one();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Client identifier of the current or last connection attempt.
    pub fn client_id(&self) -> String {
        lock(&self.client_id).clone()
    }

    /// Topics currently in the handler table.
    pub fn handler_topics(&self) -> Vec<String> {
        lock(&self.handlers).topics()
    }

    /// Drop every handler, including the system handlers.
    pub fn clear_handlers(&self) {
        let topics = {
            let mut table = lock(&self.handlers);
            let topics = table.topics();
            table.clear();
            topics
        };
        self.unsubscribe_all(&topics);
    }

    /// Clear the Last-Will for the next connect.
    pub fn clear_will(&self) {
        *lock(&self.will) = None;
    }

    /// Last-Will that will be used on the next connect.
    pub fn will(&self) -> Option<WillMessage> {
        lock(&self.will).clone()
    }

    /// Reload settings and rebuild the session.
    ///
    /// Pauses the loop, drops the connection, reloads the settings document,
    /// rebuilds the system handlers for the new root topic, runs
    /// `before_resume` so the caller can re-register its own handlers and
    /// will, then resumes and reconnects immediately. A failed reload keeps
    /// the previous settings.
    pub fn reconfigure<F: FnOnce()>(&self, before_resume: F) -> Result<()> {
        self.enabled.store(false, Ordering::Release);
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        let client = lock(&self.client).clone();
        if let Some(client) = client {
            if was_connected {
                self.publish_will_before_disconnect(&client);
            }
            let _ = client.try_disconnect();
        }
        self.wake.notify_one();

        let reloaded = match &self.settings_path {
            Some(path) => MqttSettings::load(path, &self.secrets).map(|s| self.configure(s)),
            None => Ok(()),
        };
        if let Err(e) = &reloaded {
            warn!(error = %e, "MQTT settings reload failed, keeping previous settings");
        }

        lock(&self.handlers).clear();
        self.install_system_handlers();

        before_resume();

        self.restart.store(true, Ordering::Release);
        self.set_enabled(true);
        info!("MQTT session reconfigured");
        reloaded
    }

    /// Stop the session: disconnect gracefully and pause the loop.
    pub fn shutdown(&self) {
        self.enabled.store(false, Ordering::Release);
        self.wake.notify_one();
    }

    /// Run the session loop forever.
    pub async fn run(self: Arc<Self>) {
        let mut last_attempt: Option<Instant> = None;
        let mut warned_unconfigured = false;

        loop {
            if self.restart.swap(false, Ordering::AcqRel) {
                last_attempt = None;
            }

            if !self.is_enabled() {
                self.set_state(SessionState::Disabled);
                self.idle(LOOP_DELAY).await;
                continue;
            }

            let settings = self.settings();
            if !settings.is_configured() {
                if !warned_unconfigured {
                    warn!("MQTT broker not configured; skipping connection attempt");
                    warned_unconfigured = true;
                }
                self.set_state(SessionState::Idle);
                self.idle(settings.reconnect_interval).await;
                continue;
            }
            warned_unconfigured = false;

            if let Some(at) = last_attempt {
                let elapsed = at.elapsed();
                if elapsed < settings.reconnect_interval {
                    self.idle(settings.reconnect_interval - elapsed).await;
                    continue;
                }
            }
            last_attempt = Some(Instant::now());

            self.connect_and_serve(&settings).await;
        }
    }

    async fn idle(&self, delay: Duration) {
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    fn should_stop(&self) -> bool {
        !self.is_enabled() || self.restart.load(Ordering::Acquire)
    }

    async fn connect_and_serve(&self, settings: &MqttSettings) {
        let client_id = generate_client_id();
        *lock(&self.client_id) = client_id.clone();

        let mut options = MqttOptions::new(&client_id, &settings.broker, settings.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(true);
        if !settings.username.is_empty() {
            options.set_credentials(&settings.username, &settings.password);
        }
        if let Some(will) = self.will() {
            options.set_last_will(LastWill::new(
                will.topic,
                will.payload,
                will.qos,
                will.retain,
            ));
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        *lock(&self.client) = Some(client.clone());
        self.set_state(SessionState::Connecting);

        info!(
            broker = %settings.broker,
            port = settings.port,
            client_id = %client_id,
            "Connecting to MQTT broker"
        );

        loop {
            if self.should_stop() {
                if self.connected.swap(false, Ordering::AcqRel) {
                    self.publish_will_before_disconnect(&client);
                }
                let _ = client.try_disconnect();
                drain_disconnect(&mut eventloop).await;
                break;
            }

            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            self.on_connected(&client);
                        } else {
                            error!(code = ?ack.code, "MQTT broker refused connection");
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                        self.dispatch(&publish.topic, payload).await;
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("MQTT broker sent disconnect");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if self.connected.load(Ordering::Acquire) {
                            warn!(error = %e, "MQTT connection lost");
                        } else {
                            error!(error = %e, "MQTT connect failed");
                        }
                        break;
                    }
                },
                _ = self.wake.notified() => {}
            }

            if self.is_connected() {
                self.flush_pending_subscriptions(&client);
            }
        }

        self.connected.store(false, Ordering::Release);
        *lock(&self.client) = None;
        self.set_state(if self.is_enabled() {
            SessionState::Disconnected
        } else {
            SessionState::Disabled
        });
    }

    fn on_connected(&self, client: &AsyncClient) {
        self.connected.store(true, Ordering::Release);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.set_state(SessionState::Connected);
        info!(client_id = %self.client_id(), epoch, "Connected to MQTT broker");

        lock(&self.pending_subscriptions).clear();
        let topics = self.handler_topics();
        self.subscribe_topics(client, &topics);

        let deferred = lock(&self.pending_subscriptions).len();
        if deferred > 0 {
            warn!(deferred, "MQTT request queue full, subscriptions deferred");
        }
    }

    /// Queue SUBSCRIBE packets for `topics`, several filters per packet.
    ///
    /// Topics the request queue cannot take stay pending and are retried by
    /// [`flush_pending_subscriptions`](Self::flush_pending_subscriptions)
    /// once the event loop has drained the queue.
    fn subscribe_topics(&self, client: &AsyncClient, topics: &[String]) {
        for batch in topics.chunks(SUBSCRIBE_BATCH) {
            let filters = batch
                .iter()
                .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce));

            let mut pending = lock(&self.pending_subscriptions);
            match client.try_subscribe_many(filters) {
                Ok(()) => {
                    for topic in batch {
                        pending.remove(topic);
                    }
                    info!(topics = ?batch, "MQTT subscribe");
                }
                Err(e) => {
                    debug!(topics = batch.len(), error = %e, "MQTT subscribe deferred");
                    pending.extend(batch.iter().cloned());
                }
            }
        }
    }

    /// Retry deferred subscriptions whose handler is still registered.
    fn flush_pending_subscriptions(&self, client: &AsyncClient) {
        let topics: Vec<String> = {
            let table = lock(&self.handlers);
            let mut pending = lock(&self.pending_subscriptions);
            pending.retain(|topic| table.contains(topic));
            pending.iter().cloned().collect()
        };
        if !topics.is_empty() {
            self.subscribe_topics(client, &topics);
        }
    }

    /// Queue the Last-Will as a regular publish.
    ///
    /// A clean DISCONNECT makes the broker discard the will, so a graceful
    /// stop announces it itself.
    fn publish_will_before_disconnect(&self, client: &AsyncClient) -> bool {
        let Some(will) = self.will() else {
            return false;
        };
        match client.try_publish(
            will.topic.as_str(),
            will.qos,
            will.retain,
            will.payload.into_bytes(),
        ) {
            Ok(()) => {
                debug!(topic = %will.topic, "Last-Will published before disconnect");
                true
            }
            Err(e) => {
                warn!(topic = %will.topic, error = %e, "Failed to publish Last-Will before disconnect");
                false
            }
        }
    }

    async fn dispatch(&self, topic: &str, payload: String) {
        let handlers = lock(&self.handlers).handlers_for(topic);
        if handlers.is_empty() {
            debug!(%topic, "No handler for MQTT message");
            return;
        }

        debug!(%topic, handlers = handlers.len(), "Dispatching MQTT message");
        for handler in handlers {
            handler(payload.clone()).await;
        }
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    fn install_system_handlers(&self) {
        let root = self.root_topic();

        let echo = root.system("log/echo");
        self.add_handler(
            &echo,
            topic_handler(|payload| async move {
                info!(message = %payload, "Echo requested over MQTT");
            }),
        );

        let factory = lock(&self.system_handlers).clone();
        if let Some(factory) = factory {
            for (topic, handler) in factory(&root) {
                self.add_handler(&topic, handler);
            }
        }
    }

    fn unsubscribe_all(&self, topics: &[String]) {
        if !self.is_connected() {
            return;
        }
        if let Some(client) = lock(&self.client).as_ref() {
            for topic in topics {
                if let Err(e) = client.try_unsubscribe(topic.as_str()) {
                    warn!(%topic, error = %e, "MQTT unsubscribe failed");
                }
            }
        }
    }
}

impl MqttLink for MqttSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn connection_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn root_topic(&self) -> TopicRoot {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .topic_root()
    }

    fn publish_qos(&self, topic: &str, payload: &str, qos: QoS, retain: bool) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(client) = lock(&self.client).clone() else {
            return false;
        };

        match client.try_publish(topic, qos, retain, payload.as_bytes().to_vec()) {
            Ok(()) => true,
            Err(e) => {
                warn!(%topic, error = %e, "MQTT publish failed");
                false
            }
        }
    }

    fn set_will(&self, will: Option<WillMessage>) {
        *lock(&self.will) = will;
    }

    fn add_handler(&self, topic: &str, handler: TopicHandler) {
        let added = lock(&self.handlers).add(topic, handler);
        if !added || !self.is_connected() {
            return;
        }
        let client = lock(&self.client).clone();
        if let Some(client) = client {
            self.subscribe_topics(&client, &[topic.to_string()]);
        }
    }

    fn remove_handlers(&self, topics: &[String]) {
        let removed: Vec<String> = {
            let mut table = lock(&self.handlers);
            topics
                .iter()
                .filter(|topic| table.remove(topic))
                .cloned()
                .collect()
        };
        {
            let mut pending = lock(&self.pending_subscriptions);
            for topic in &removed {
                pending.remove(topic);
            }
        }
        self.unsubscribe_all(&removed);
    }
}

async fn drain_disconnect(eventloop: &mut EventLoop) {
    let _ = tokio::time::timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
}

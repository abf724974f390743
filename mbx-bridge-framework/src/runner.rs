//! Bridge runner for lifecycle management.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use mbx_common::init_tracing;

use crate::BridgeArgs;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::health::{BridgeHealth, Indicator};
use crate::link::MqttLink;
use crate::session::MqttSession;
use crate::status::StatusPublisher;

const REPORT_POLL: Duration = Duration::from_secs(1);
const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_millis(300);

/// Bridge runner that manages the lifecycle of a gateway bridge.
///
/// Handles:
/// - Logging initialization
/// - MQTT session creation and its connection loop
/// - Task spawning and management
/// - Status and health publishing
/// - Graceful shutdown on Ctrl+C or SIGTERM
///
/// # Example
///
/// ```ignore
/// use mbx_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = BridgeArgs::parse_with_default("mybridge.json5");
///     let config = MyBridgeConfig::load(&args.config)?;
///
///     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args))?
///         .with_status_publishing();
///
///     let session = runner.session();
///     runner.spawn(async move {
///         // Worker logic here
///     });
///
///     runner.run().await
/// }
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging and status.
    name: String,
    /// Bridge version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// MQTT session shared with workers.
    session: Arc<MqttSession>,
    /// Health counters shared with workers.
    health: Arc<BridgeHealth>,
    /// Status publisher (optional).
    status_publisher: Option<Arc<StatusPublisher>>,
    /// Interval between health publishes.
    health_interval: Duration,
    /// Spawned tasks.
    tasks: Vec<JoinHandle<()>>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new bridge runner.
    pub fn new(name: impl Into<String>, config: C) -> Result<Self> {
        Self::new_with_args(name, config, None)
    }

    /// Create a new bridge runner with CLI args for log level override.
    ///
    /// This will:
    /// 1. Initialize logging based on config (with optional CLI override)
    /// 2. Load the MQTT settings and create the session
    pub fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let log_config = config
            .logging()
            .with_level_override(args.and_then(|a| a.log_level.as_deref()));
        init_tracing(&log_config).map_err(|e| BridgeError::config(e.to_string()))?;

        tracing::info!(bridge = %name, version = %version, "Starting bridge");

        let session = Arc::new(MqttSession::from_config(config.mqtt())?);
        let settings = session.settings();
        tracing::info!(
            broker = %settings.broker,
            port = settings.port,
            root_topic = %settings.root_topic,
            "MQTT session configured"
        );

        let health = Arc::new(BridgeHealth::new(&name));

        Ok(Self {
            name,
            version,
            config,
            session,
            health,
            status_publisher: None,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            tasks: Vec::new(),
        })
    }

    /// Enable status publishing.
    ///
    /// When enabled, the runner publishes a retained "running" status after
    /// every connect and an "offline" status on shutdown.
    pub fn with_status_publishing(mut self) -> Self {
        self.status_publisher = Some(Arc::new(StatusPublisher::new(&self.name, &self.version)));
        self
    }

    /// Set the interval between health publishes.
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Get the bridge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the bridge version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a handle to the MQTT session.
    pub fn session(&self) -> Arc<MqttSession> {
        self.session.clone()
    }

    /// Get a handle to the health tracker.
    pub fn health(&self) -> Arc<BridgeHealth> {
        self.health.clone()
    }

    /// Spawn a worker task.
    ///
    /// The task will be tracked and aborted on shutdown.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.push(handle);
    }

    /// Spawn a worker task that returns a Result.
    ///
    /// Errors are logged automatically.
    pub fn spawn_with_error<F, E>(&mut self, name: String, future: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if let Err(e) = future.await {
                tracing::error!(worker = %name, error = %e, "Worker failed");
            }
        });
        self.tasks.push(handle);
    }

    /// Run the bridge until a shutdown signal is received.
    pub async fn run(self) -> Result<()> {
        self.run_with_metadata(None).await
    }

    /// Run the bridge with custom status metadata.
    ///
    /// This will:
    /// 1. Start the MQTT session loop
    /// 2. Publish "running" status after each connect (if enabled)
    /// 3. Wait for Ctrl+C or SIGTERM
    /// 4. Abort all spawned tasks
    /// 5. Publish "offline" status (if enabled) and disconnect
    pub async fn run_with_metadata(mut self, metadata: Option<serde_json::Value>) -> Result<()> {
        self.session.set_enabled(true);
        let session_task = tokio::spawn(self.session.clone().run());

        let reporter = tokio::spawn(report(
            self.session.clone(),
            self.health.clone(),
            self.status_publisher.clone(),
            metadata,
            self.health_interval,
        ));
        self.tasks.push(reporter);

        tracing::info!(
            bridge = %self.name,
            tasks = self.tasks.len(),
            "Bridge running. Press Ctrl+C to stop."
        );

        shutdown_signal().await;

        tracing::info!(bridge = %self.name, "Received shutdown signal");

        for task in &self.tasks {
            task.abort();
        }

        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_offline(self.session.as_ref()) {
                tracing::warn!(error = %e, "Failed to publish offline status");
            }
        }

        self.session.shutdown();
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        session_task.abort();

        tracing::info!(bridge = %self.name, "Goodbye!");

        Ok(())
    }
}

async fn report<L: MqttLink>(
    session: Arc<L>,
    health: Arc<BridgeHealth>,
    status: Option<Arc<StatusPublisher>>,
    metadata: Option<serde_json::Value>,
    health_interval: Duration,
) {
    let mut ticker = tokio::time::interval(REPORT_POLL);
    let mut announced_epoch = 0;
    let mut last_health: Option<Instant> = None;

    loop {
        ticker.tick().await;

        let connected = session.is_connected();
        health.set_indicator(Indicator::Mqtt, connected);
        if !connected {
            continue;
        }

        let epoch = session.connection_epoch();
        if epoch != announced_epoch {
            match &status {
                Some(status) => match status.publish_running(session.as_ref(), metadata.clone()) {
                    Ok(()) => announced_epoch = epoch,
                    Err(e) => tracing::warn!(error = %e, "Failed to publish running status"),
                },
                None => announced_epoch = epoch,
            }
        }

        if last_health.is_none_or(|at| at.elapsed() >= health_interval) {
            if let Err(e) = health.publish_health(session.as_ref()) {
                tracing::debug!(error = %e, "Failed to publish health");
            }
            last_health = Some(Instant::now());
        }
    }
}

/// Wait for Ctrl+C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                        }
                    }
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
    }
}

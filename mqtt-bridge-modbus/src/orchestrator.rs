//! The periodic driver of the bridge.
//!
//! One task ticks the [`Bridge`] and serves admin commands in between ticks,
//! so a reload never interleaves with a poll pass.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mbx_bridge_framework::{BridgeHealth, MqttSession};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::admin::AdminCommand;
use crate::bridge::Bridge;
use crate::error::AdminError;

/// Default period of the poll tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// A broker session that can be reconfigured under load.
pub trait Reconfigure: Send + Sync {
    /// Pause, reload settings, run `before_resume`, then resume.
    fn reconfigure(&self, before_resume: &mut dyn FnMut()) -> mbx_bridge_framework::Result<()>;
}

impl Reconfigure for MqttSession {
    fn reconfigure(&self, before_resume: &mut dyn FnMut()) -> mbx_bridge_framework::Result<()> {
        MqttSession::reconfigure(self, before_resume)
    }
}

pub struct Orchestrator {
    bridge: Bridge,
    session: Arc<dyn Reconfigure>,
    commands: mpsc::Receiver<AdminCommand>,
    accepting: bool,
    config_path: PathBuf,
    tick_interval: Duration,
    health: Arc<BridgeHealth>,
    started: Instant,
}

impl Orchestrator {
    pub fn new(
        bridge: Bridge,
        session: Arc<dyn Reconfigure>,
        commands: mpsc::Receiver<AdminCommand>,
        config_path: impl Into<PathBuf>,
        health: Arc<BridgeHealth>,
    ) -> Self {
        Self {
            bridge,
            session,
            commands,
            accepting: true,
            config_path: config_path.into(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            health,
            started: Instant::now(),
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.tick_interval = interval;
        }
        self
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Milliseconds since start, truncated to the scheduler's 32-bit clock.
    fn now_ms(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    /// Load the configuration at startup. Failures leave an empty bridge.
    pub async fn start(&mut self) {
        if let Err(e) = self.bridge.apply_new_config(&self.config_path).await {
            warn!(
                path = %self.config_path.display(),
                error = %e,
                "Starting without a Modbus configuration"
            );
        }
    }

    /// Drive the bridge forever.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_ms = self.tick_interval.as_millis() as u64,
            "Orchestrator running"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                command = self.commands.recv(), if self.accepting => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("Admin channel closed");
                        self.accepting = false;
                    }
                },
            }
        }
    }

    /// Run one bridge tick and record its duration.
    pub async fn tick(&mut self) {
        let started = Instant::now();
        let now_ms = self.now_ms();
        self.bridge.tick(now_ms).await;
        self.health
            .record_tick_duration(started.elapsed().as_millis() as u64);
    }

    /// Execute an admin command and answer its caller.
    pub async fn handle_command(&mut self, mut command: AdminCommand) {
        let reply = command.take_reply();
        let name = command.name();

        let result = match command {
            AdminCommand::ReloadConfiguration { .. } => {
                self.bridge.apply_new_config(&self.config_path).await
            }
            AdminCommand::ReloadMqtt { .. } => self.reload_mqtt(),
            AdminCommand::SetBusEnabled { enabled, .. } => self
                .bridge
                .set_bus_enabled(enabled)
                .await
                .map_err(AdminError::from),
        };

        if let Err(e) = &result {
            warn!(command = name, error = %e, "Admin command failed");
        }
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    fn reload_mqtt(&mut self) -> Result<(), AdminError> {
        let bridge = &mut self.bridge;
        self.session
            .reconfigure(&mut || bridge.rebind_mqtt())
            .map_err(AdminError::from)
    }
}

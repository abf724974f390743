//! Administrative entry points.
//!
//! Reload and bus-switch requests are posted to the orchestrator as
//! [`AdminCommand`]s and run between two ticks. Raw transactions skip the
//! orchestrator and take the bus directly, failing with `Busy` when it is
//! held. A slave scan takes the bus once per id and waits its turn.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use mbx_bridge_framework::{MqttLink, SystemHandlers, TopicRoot, topic_handler};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bus::{BusGuard, ModbusBus, ModbusStatus, Request};
use crate::error::{AdminError, BusError};
use crate::model::FunctionCode;

/// Commands queued before the orchestrator stops accepting more.
pub const COMMAND_QUEUE: usize = 16;

/// Attempts to take a held bus before a scanned id is skipped.
const SCAN_BUSY_RETRIES: u32 = 50;
const SCAN_BUSY_WAIT: Duration = Duration::from_millis(20);

/// Reply channel of a command.
pub type Reply = oneshot::Sender<Result<(), AdminError>>;

/// Requests served by the orchestrator.
#[derive(Debug)]
pub enum AdminCommand {
    /// Reload the Modbus configuration document.
    ReloadConfiguration { reply: Option<Reply> },
    /// Reload the MQTT settings and rebind the session.
    ReloadMqtt { reply: Option<Reply> },
    /// Switch polling on or off.
    SetBusEnabled { enabled: bool, reply: Option<Reply> },
}

impl AdminCommand {
    pub fn name(&self) -> &'static str {
        match self {
            AdminCommand::ReloadConfiguration { .. } => "reload_configuration",
            AdminCommand::ReloadMqtt { .. } => "reload_mqtt",
            AdminCommand::SetBusEnabled { .. } => "set_bus_enabled",
        }
    }

    /// Detach the reply channel.
    pub fn take_reply(&mut self) -> Option<Reply> {
        match self {
            AdminCommand::ReloadConfiguration { reply }
            | AdminCommand::ReloadMqtt { reply }
            | AdminCommand::SetBusEnabled { reply, .. } => reply.take(),
        }
    }
}

/// A raw Modbus transaction requested by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRequest {
    pub slave_id: u8,
    pub function: u8,
    #[serde(default)]
    pub address: u16,
    #[serde(default = "default_length")]
    pub length: u16,
    #[serde(default)]
    pub value: Option<u16>,
}

fn default_length() -> u16 {
    1
}

impl RawRequest {
    fn to_request(&self) -> Result<Request, AdminError> {
        let function = FunctionCode::from_code(self.function).ok_or_else(|| {
            AdminError::InvalidRequest(format!("unknown function code {}", self.function))
        })?;

        if function.is_read() {
            return Ok(Request::read(self.slave_id, function, self.address, self.length));
        }
        let value = self.value.ok_or_else(|| {
            AdminError::InvalidRequest(format!("function {} needs a value", function))
        })?;
        Ok(Request::write(self.slave_id, function, self.address, value))
    }
}

/// Result of a raw transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOutcome {
    pub status: u8,
    pub status_text: String,
    pub words: Vec<u16>,
    pub rx: String,
    /// RFC 3339 time of completion.
    pub timestamp: String,
}

impl RawOutcome {
    fn new(status: ModbusStatus, words: Vec<u16>, rx: String) -> Self {
        Self {
            status: status.code(),
            status_text: status.to_string(),
            words,
            rx,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn modbus_status(&self) -> ModbusStatus {
        ModbusStatus::from_code(self.status)
    }
}

/// A bus scan: slave ids `first..=last`, each asked for one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanRequest {
    pub first: u8,
    pub last: u8,
    pub function: u8,
    pub address: u16,
    pub length: u16,
}

impl Default for ScanRequest {
    fn default() -> Self {
        Self {
            first: 1,
            last: 247,
            function: FunctionCode::ReadHolding.code(),
            address: 0,
            length: 1,
        }
    }
}

impl ScanRequest {
    /// Ids `first..=last`.
    pub fn ids(first: u8, last: u8) -> Self {
        Self {
            first,
            last,
            ..Self::default()
        }
    }

    fn read_function(&self) -> Result<FunctionCode, AdminError> {
        if self.first == 0 || self.first > self.last || self.last > 247 {
            return Err(AdminError::InvalidRequest(format!(
                "invalid slave range {}..={}",
                self.first, self.last
            )));
        }
        match FunctionCode::from_code(self.function) {
            Some(function) if function.is_read() => Ok(function),
            _ => Err(AdminError::InvalidRequest(format!(
                "scan needs a read function, got {}",
                self.function
            ))),
        }
    }
}

/// Slaves found by a bus scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub present: Vec<u8>,
    /// Ids skipped because the bus stayed held.
    pub skipped: Vec<u8>,
    pub timestamp: String,
}

/// Whether a failed transaction still proves a slave answered.
fn slave_answered(status: ModbusStatus) -> bool {
    matches!(
        status,
        ModbusStatus::IllegalFunction
            | ModbusStatus::IllegalDataAddress
            | ModbusStatus::IllegalDataValue
            | ModbusStatus::SlaveDeviceFailure
            | ModbusStatus::Exception(_)
    )
}

async fn acquire_with_retry(bus: &ModbusBus) -> Option<BusGuard<'_>> {
    for _ in 0..SCAN_BUSY_RETRIES {
        if let Some(guard) = bus.acquire() {
            return Some(guard);
        }
        tokio::time::sleep(SCAN_BUSY_WAIT).await;
    }
    bus.acquire()
}

/// Cloneable handle to the admin surface.
#[derive(Debug, Clone)]
pub struct AdminHandle {
    tx: mpsc::Sender<AdminCommand>,
    bus: Weak<ModbusBus>,
}

impl AdminHandle {
    /// Create a handle and the receiver the orchestrator drains.
    pub fn channel(bus: &Arc<ModbusBus>) -> (Self, mpsc::Receiver<AdminCommand>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        (
            Self {
                tx,
                bus: Arc::downgrade(bus),
            },
            rx,
        )
    }

    /// Queue a command without waiting. Returns false if it was dropped.
    pub fn post(&self, command: AdminCommand) -> bool {
        let name = command.name();
        match self.tx.try_send(command) {
            Ok(()) => {
                debug!(command = name, "Admin command queued");
                true
            }
            Err(e) => {
                warn!(command = name, error = %e, "Admin command dropped");
                false
            }
        }
    }

    async fn request(
        &self,
        command: impl FnOnce(Reply) -> AdminCommand,
    ) -> Result<(), AdminError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| AdminError::Closed)?;
        response.await.map_err(|_| AdminError::Closed)?
    }

    pub async fn reload_configuration(&self) -> Result<(), AdminError> {
        self.request(|reply| AdminCommand::ReloadConfiguration { reply: Some(reply) })
            .await
    }

    pub async fn reload_mqtt(&self) -> Result<(), AdminError> {
        self.request(|reply| AdminCommand::ReloadMqtt { reply: Some(reply) })
            .await
    }

    pub async fn set_bus_enabled(&self, enabled: bool) -> Result<(), AdminError> {
        self.request(|reply| AdminCommand::SetBusEnabled {
            enabled,
            reply: Some(reply),
        })
        .await
    }

    /// Run one transaction outside the poll schedule.
    ///
    /// Bus statuses, `Busy` included, are reported in the outcome.
    pub async fn execute_raw(&self, raw: &RawRequest) -> Result<RawOutcome, AdminError> {
        let request = raw.to_request()?;
        let bus = self.bus.upgrade().ok_or(AdminError::Closed)?;

        let Some(guard) = bus.acquire() else {
            return Ok(RawOutcome::new(ModbusStatus::Busy, Vec::new(), String::new()));
        };
        let result = guard.execute(&request).await;
        drop(guard);

        match result {
            Ok(words) => Ok(RawOutcome::new(ModbusStatus::Success, words, bus.dump_rx())),
            Err(BusError::Transaction { status }) => {
                Ok(RawOutcome::new(status, Vec::new(), bus.dump_rx()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send the scan read request to every id.
    ///
    /// A slave is present when it answers, with data or with an exception.
    /// The bus is released between ids so polling can interleave.
    pub async fn scan_slaves(&self, scan: ScanRequest) -> Result<ScanReport, AdminError> {
        let function = scan.read_function()?;
        let bus = self.bus.upgrade().ok_or(AdminError::Closed)?;

        let mut present = Vec::new();
        let mut skipped = Vec::new();
        for slave_id in scan.first..=scan.last {
            let Some(guard) = acquire_with_retry(&bus).await else {
                skipped.push(slave_id);
                continue;
            };
            let request = Request::read(slave_id, function, scan.address, scan.length);
            let result = guard.execute(&request).await;
            drop(guard);

            match result {
                Ok(_) => present.push(slave_id),
                Err(BusError::Transaction { status }) if slave_answered(status) => {
                    present.push(slave_id)
                }
                Err(BusError::Transaction { status }) => {
                    debug!(slave_id, %status, "No slave at id");
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(?present, skipped = skipped.len(), "Modbus slave scan finished");
        Ok(ScanReport {
            present,
            skipped,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }
}

fn parse_switch(payload: &str) -> Option<bool> {
    match payload.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" => Some(true),
        "false" | "0" | "off" => Some(false),
        _ => None,
    }
}

/// System topic handlers of the gateway, rebuilt for every root topic.
pub fn system_handlers<L>(handle: AdminHandle, link: Weak<L>) -> SystemHandlers
where
    L: MqttLink + 'static,
{
    Arc::new(move |root: &TopicRoot| {
        let mut handlers = Vec::new();

        let admin = handle.clone();
        handlers.push((
            root.system("modbus/reload"),
            topic_handler(move |_payload: String| {
                let admin = admin.clone();
                async move {
                    info!("Modbus reload requested over MQTT");
                    admin.post(AdminCommand::ReloadConfiguration { reply: None });
                }
            }),
        ));

        let admin = handle.clone();
        handlers.push((
            root.system("mqtt/reload"),
            topic_handler(move |_payload: String| {
                let admin = admin.clone();
                async move {
                    info!("MQTT reload requested over MQTT");
                    admin.post(AdminCommand::ReloadMqtt { reply: None });
                }
            }),
        ));

        let admin = handle.clone();
        handlers.push((
            root.system("modbus/enabled"),
            topic_handler(move |payload: String| {
                let admin = admin.clone();
                async move {
                    match parse_switch(&payload) {
                        Some(enabled) => {
                            admin.post(AdminCommand::SetBusEnabled {
                                enabled,
                                reply: None,
                            });
                        }
                        None => warn!(payload = %payload, "Invalid bus switch payload"),
                    }
                }
            }),
        ));

        let admin = handle.clone();
        let exec_link = link.clone();
        let result_topic = root.system("modbus/execute/result");
        handlers.push((
            root.system("modbus/execute"),
            topic_handler(move |payload: String| {
                let admin = admin.clone();
                let link = exec_link.clone();
                let result_topic = result_topic.clone();
                async move {
                    let raw: RawRequest = match serde_json::from_str(&payload) {
                        Ok(raw) => raw,
                        Err(e) => {
                            warn!(error = %e, "Invalid raw execute request");
                            return;
                        }
                    };
                    let body = match admin.execute_raw(&raw).await {
                        Ok(outcome) => serde_json::to_string(&outcome),
                        Err(e) => serde_json::to_string(&serde_json::json!({
                            "error": e.to_string(),
                        })),
                    };
                    match (body, link.upgrade()) {
                        (Ok(body), Some(link)) => {
                            if !link.publish(&result_topic, &body, false) {
                                warn!(topic = %result_topic, "Failed to publish raw execute result");
                            }
                        }
                        (Err(e), _) => warn!(error = %e, "Failed to encode raw execute result"),
                        (_, None) => {}
                    }
                }
            }),
        ));

        let admin = handle.clone();
        let scan_link = link.clone();
        let result_topic = root.system("modbus/scan/result");
        handlers.push((
            root.system("modbus/scan"),
            topic_handler(move |payload: String| {
                let admin = admin.clone();
                let link = scan_link.clone();
                let result_topic = result_topic.clone();
                async move {
                    let scan = if payload.trim().is_empty() {
                        ScanRequest::default()
                    } else {
                        match serde_json::from_str::<ScanRequest>(&payload) {
                            Ok(scan) => scan,
                            Err(e) => {
                                warn!(error = %e, "Invalid scan request");
                                return;
                            }
                        }
                    };
                    info!(first = scan.first, last = scan.last, "Modbus slave scan requested");

                    // A scan spans many timeouts; keep it off the MQTT loop.
                    tokio::spawn(async move {
                        let body = match admin.scan_slaves(scan).await {
                            Ok(report) => serde_json::to_string(&report),
                            Err(e) => serde_json::to_string(&serde_json::json!({
                                "error": e.to_string(),
                            })),
                        };
                        match (body, link.upgrade()) {
                            (Ok(body), Some(link)) => {
                                if !link.publish(&result_topic, &body, false) {
                                    warn!(topic = %result_topic, "Failed to publish scan result");
                                }
                            }
                            (Err(e), _) => warn!(error = %e, "Failed to encode scan result"),
                            (_, None) => {}
                        }
                    });
                }
            }),
        ));

        handlers
    })
}

/// Reload everything on `SIGHUP`.
#[cfg(unix)]
pub async fn forward_hangup(handle: AdminHandle) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "SIGHUP handler unavailable");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        info!("SIGHUP received, reloading configuration");
        if !handle.post(AdminCommand::ReloadConfiguration { reply: None }) {
            continue;
        }
        handle.post(AdminCommand::ReloadMqtt { reply: None });
    }
}

#[cfg(not(unix))]
pub async fn forward_hangup(_handle: AdminHandle) {
    std::future::pending::<()>().await;
}

//! Modbus to MQTT bridging.
//!
//! The [`Bridge`] owns the Modbus configuration. Each tick it follows the
//! broker connection, reads the due datapoints and publishes their values.
//! Write datapoints are served by topic handlers that hold a weak reference
//! to the bus, never to the bridge itself.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use mbx_bridge_framework::{
    BridgeHealth, Indicator, MqttLink, QoS, WillMessage, topic_handler,
};
use tracing::{debug, error, info, warn};

use crate::bus::{ModbusBus, Request};
use crate::discovery::{PAYLOAD_AVAILABLE, PAYLOAD_NOT_AVAILABLE, device_discovery};
use crate::error::{AdminError, BusError, ConfigError, WriteError};
use crate::model::{Configuration, Device, FunctionCode};
use crate::payload::{decode_payload, parse_write_value};
use crate::scheduler;
use crate::topic::TopicBuilder;

/// Longest wait for an in-flight transaction before a reload.
pub const RELOAD_BARRIER: Duration = Duration::from_millis(250);

const BARRIER_POLL: Duration = Duration::from_millis(5);

/// What a write handler needs to reach its register.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteTarget {
    pub topic: String,
    pub slave_id: u8,
    pub function: FunctionCode,
    pub address: u16,
    pub scale: f32,
}

/// Bridges the Modbus bus to the broker.
pub struct Bridge {
    link: Arc<dyn MqttLink>,
    bus: Arc<ModbusBus>,
    health: Arc<BridgeHealth>,
    config: Configuration,
    write_topics: Vec<String>,
    last_connected: bool,
    last_epoch: u64,
    due: Vec<usize>,
}

impl Bridge {
    pub fn new(link: Arc<dyn MqttLink>, bus: Arc<ModbusBus>, health: Arc<BridgeHealth>) -> Self {
        Self {
            link,
            bus,
            health,
            config: Configuration::default(),
            write_topics: Vec::new(),
            last_connected: false,
            last_epoch: 0,
            due: Vec::new(),
        }
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    pub fn bus(&self) -> &Arc<ModbusBus> {
        &self.bus
    }

    /// Topics with a write handler installed.
    pub fn write_topics(&self) -> &[String] {
        &self.write_topics
    }

    fn topics(&self) -> TopicBuilder {
        TopicBuilder::new(self.link.root_topic())
    }

    /// Load a configuration document and make it current.
    ///
    /// On error the current configuration stays in place.
    pub fn load_configuration(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let config = Configuration::load(path)?;
        self.apply_configuration(config);
        Ok(())
    }

    /// Replace the configuration and rebind will and write handlers.
    pub fn apply_configuration(&mut self, mut config: Configuration) {
        config.reset_ha_flags();
        self.clear_write_subscriptions();
        self.config = config;
        self.health
            .set_devices(self.config.devices.iter().map(|d| d.id.clone()));
        self.configure_will();
        self.rebuild_write_subscriptions();

        info!(
            devices = self.config.devices.len(),
            write_topics = self.write_topics.len(),
            "Modbus configuration applied"
        );
    }

    /// Point the Last-Will at the first device taking part in discovery.
    pub fn configure_will(&self) {
        let mut announcing = self.config.devices.iter().filter(|d| d.announces());

        let Some(first) = announcing.next() else {
            self.link.set_will(None);
            return;
        };

        let topic = self.topics().availability_topic(first);
        debug!(topic = %topic, "Last-Will set to device availability");
        self.link.set_will(WillMessage::new(
            &topic,
            PAYLOAD_NOT_AVAILABLE,
            QoS::AtLeastOnce,
            true,
        ));

        if announcing.next().is_some() {
            warn!(
                device = %first.id,
                "Several devices request Home-Assistant discovery; the Last-Will covers the first"
            );
        }
    }

    fn clear_write_subscriptions(&mut self) {
        if !self.write_topics.is_empty() {
            self.link.remove_handlers(&self.write_topics);
            self.write_topics.clear();
        }
    }

    /// Install one handler per write datapoint of MQTT-enabled devices.
    pub fn rebuild_write_subscriptions(&mut self) {
        self.clear_write_subscriptions();
        let topics = self.topics();

        for device in self.config.devices.iter().filter(|d| d.mqtt_enabled) {
            for dp in device.datapoints.iter().filter(|dp| dp.function.is_write()) {
                let topic = topics.datapoint_topic(device, dp);
                if topic.is_empty() {
                    warn!(device = %device.id, datapoint = %dp.id, "Empty topic for write datapoint");
                    continue;
                }

                let target = WriteTarget {
                    topic: topic.clone(),
                    slave_id: device.slave_id,
                    function: dp.function,
                    address: dp.address,
                    scale: dp.scale,
                };
                let bus = Arc::downgrade(&self.bus);
                let health = self.health.clone();
                self.link.add_handler(
                    &topic,
                    topic_handler(move |payload: String| {
                        let bus = bus.clone();
                        let target = target.clone();
                        let health = health.clone();
                        async move {
                            let result = handle_write_command(&bus, &target, &payload).await;
                            health.record_command(result.is_ok());
                        }
                    }),
                );
                self.write_topics.push(topic);
            }
        }
    }

    /// Rebind everything the broker session owns after a reconfigure.
    ///
    /// The session already dropped its handler table.
    pub fn rebind_mqtt(&mut self) {
        self.write_topics.clear();
        self.config.reset_ha_flags();
        self.last_connected = false;
        self.configure_will();
        self.rebuild_write_subscriptions();
    }

    /// Execute a write command for a target.
    pub async fn handle_write_command(
        &self,
        target: &WriteTarget,
        payload: &str,
    ) -> Result<u16, WriteError> {
        handle_write_command(&Arc::downgrade(&self.bus), target, payload).await
    }

    /// One scheduling pass.
    pub async fn tick(&mut self, now_ms: u32) {
        self.track_connection();

        if !self.bus.is_active() {
            self.health.set_indicator(Indicator::Modbus, false);
            return;
        }

        let bus = self.bus.clone();
        let mut due = std::mem::take(&mut self.due);
        let mut attempted = false;
        let mut any_success = false;

        for device_index in 0..self.config.devices.len() {
            due.clear();
            scheduler::collect_due_read_datapoints(
                &self.config.devices[device_index],
                now_ms,
                &mut due,
            );

            for &dp_index in &due {
                let Some(guard) = bus.acquire() else {
                    debug!("Modbus bus busy, read deferred to the next tick");
                    continue;
                };

                let device = &self.config.devices[device_index];
                let dp = &device.datapoints[dp_index];
                let request =
                    Request::read(device.slave_id, dp.function, dp.address, dp.num_of_registers);

                attempted = true;
                let result = guard.execute(&request).await;
                drop(guard);

                match result {
                    Ok(words) => {
                        any_success = true;
                        self.health.record_device_success(&device.id);
                        match decode_payload(dp, &words) {
                            Some(payload) => {
                                self.publish_datapoint(device_index, dp_index, &payload);
                            }
                            None => warn!(
                                device = %device.id,
                                datapoint = %dp.id,
                                "Read returned no data"
                            ),
                        }
                    }
                    Err(e) => {
                        self.health.record_device_failure(&device.id, &e.to_string());
                        self.log_read_failure(device_index, dp_index, &request, &e);
                    }
                }

                scheduler::schedule_next(
                    &mut self.config.devices[device_index].datapoints[dp_index],
                    now_ms,
                );
            }
        }

        self.due = due;
        if attempted {
            self.health.set_indicator(Indicator::Modbus, any_success);
        }
    }

    fn log_read_failure(&self, device_index: usize, dp_index: usize, request: &Request, e: &BusError) {
        let device = &self.config.devices[device_index];
        let dp = &device.datapoints[dp_index];

        match e {
            BusError::Transaction { status } => {
                let line = self.bus.config().unwrap_or_default();
                error!(
                    device = %device.id,
                    datapoint = %dp.id,
                    slave_id = request.slave_id,
                    function = %request.function,
                    address = request.address,
                    length = request.quantity,
                    baud = line.baud,
                    format = %line.serial_format,
                    status = %status,
                    rx = %self.bus.dump_rx(),
                    "Modbus read failed"
                );
            }
            other => debug!(device = %device.id, datapoint = %dp.id, error = %other, "Modbus read skipped"),
        }
    }

    fn track_connection(&mut self) {
        let connected = self.link.is_connected();
        let epoch = self.link.connection_epoch();

        if connected && !self.last_connected {
            self.on_connected();
        } else if connected && epoch != self.last_epoch {
            // Lost and regained between two ticks.
            self.on_disconnected();
            self.on_connected();
        } else if !connected && self.last_connected {
            self.on_disconnected();
        }

        self.last_connected = connected;
        self.last_epoch = epoch;
    }

    fn on_connected(&mut self) {
        info!("MQTT connected, announcing devices");
        self.rebuild_write_subscriptions();

        let topics = self.topics();
        let publisher = Publisher {
            link: self.link.as_ref(),
            health: &self.health,
            topics: &topics,
        };
        for device in self.config.devices.iter_mut().filter(|d| d.announces()) {
            publisher.availability(device);
            publisher.discovery(device);
        }
    }

    fn on_disconnected(&mut self) {
        debug!("MQTT disconnected, discovery state reset");
        self.config.reset_ha_flags();
    }

    /// Publish a datapoint value, announcing its device first if needed.
    ///
    /// Returns whether the value itself was published.
    pub fn publish_datapoint(&mut self, device_index: usize, dp_index: usize, payload: &str) -> bool {
        let topics = self.topics();
        let publisher = Publisher {
            link: self.link.as_ref(),
            health: &self.health,
            topics: &topics,
        };
        match self.config.devices.get_mut(device_index) {
            Some(device) => publisher.datapoint(device, dp_index, payload),
            None => false,
        }
    }

    /// Reload the configuration document behind a bus barrier.
    ///
    /// Polling stops, an in-flight transaction gets [`RELOAD_BARRIER`] to
    /// finish, then the document is loaded and the bus reopened. A failed
    /// reload keeps the current configuration and restores the bus switch.
    pub async fn apply_new_config(&mut self, path: impl AsRef<Path>) -> Result<(), AdminError> {
        let path = path.as_ref();
        let was_active = self.bus.is_active();
        self.bus.set_active(false);

        let deadline = tokio::time::Instant::now() + RELOAD_BARRIER;
        while self.bus.is_busy() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(BARRIER_POLL).await;
        }
        if self.bus.is_busy() {
            warn!("Modbus bus still busy after the reload barrier");
        }

        let result = self.reload(path).await;
        match &result {
            Ok(()) => {
                let enabled = self.config.bus.enabled && self.bus.is_initialized();
                self.bus.set_active(enabled);
                self.health.set_indicator(Indicator::Modbus, enabled);
                info!(path = %path.display(), bus_enabled = enabled, "Modbus configuration reloaded");
            }
            Err(e) => {
                self.bus.set_active(was_active);
                error!(path = %path.display(), error = %e, "Modbus configuration reload failed");
            }
        }
        result
    }

    async fn reload(&mut self, path: &Path) -> Result<(), AdminError> {
        let config = Configuration::load(path)?;
        if config.bus.enabled {
            self.bus.begin(&config.bus).await?;
        }
        self.apply_configuration(config);
        Ok(())
    }

    /// Turn polling on or off, opening the port on first use.
    pub async fn set_bus_enabled(&mut self, enabled: bool) -> Result<(), BusError> {
        if enabled && !self.bus.is_initialized() {
            self.bus.begin(&self.config.bus).await?;
        }
        self.config.bus.enabled = enabled;
        self.bus.set_active(enabled);
        self.health.set_indicator(Indicator::Modbus, enabled);
        info!(enabled, "Modbus bus switched");
        Ok(())
    }
}

/// Publishing through the link on behalf of the bridge.
struct Publisher<'a> {
    link: &'a dyn MqttLink,
    health: &'a BridgeHealth,
    topics: &'a TopicBuilder,
}

impl Publisher<'_> {
    fn availability(&self, device: &mut Device) {
        if !device.announces() || !self.link.is_connected() {
            return;
        }
        let topic = self.topics.availability_topic(device);
        if self
            .link
            .publish_qos(&topic, PAYLOAD_AVAILABLE, QoS::AtLeastOnce, true)
        {
            device.ha_availability_online_published = true;
            debug!(topic = %topic, "Device availability published");
        } else {
            warn!(topic = %topic, "Failed to publish device availability");
        }
    }

    fn discovery(&self, device: &mut Device) {
        if !device.announces() || !self.link.is_connected() {
            return;
        }

        let discovery = device_discovery(self.topics, device);
        let mut complete = true;
        for message in &discovery.messages {
            let payload = match message.payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(topic = %message.topic, error = %e, "Failed to encode discovery descriptor");
                    continue;
                }
            };
            if self
                .link
                .publish_qos(&message.topic, &payload, QoS::AtLeastOnce, true)
            {
                debug!(topic = %message.topic, "Discovery descriptor published");
            } else {
                complete = false;
                warn!(topic = %message.topic, "Failed to publish discovery descriptor");
            }
        }

        // Retried on the next publish until every descriptor went out.
        if complete || !discovery.eligible {
            device.ha_discovery_published = true;
        }
    }

    fn datapoint(&self, device: &mut Device, dp_index: usize, payload: &str) -> bool {
        if !device.mqtt_enabled {
            return false;
        }

        if device.ha_discovery_enabled {
            if !device.ha_availability_online_published {
                self.availability(device);
            }
            if !device.ha_discovery_published {
                self.discovery(device);
            }
            if !device.ha_availability_online_published || !device.ha_discovery_published {
                return false;
            }
        }

        let Some(dp) = device.datapoints.get(dp_index) else {
            return false;
        };
        let topic = self.topics.datapoint_topic(device, dp);
        if topic.is_empty() {
            warn!(device = %device.id, datapoint = %dp.id, "Empty topic, publish skipped");
            return false;
        }

        let accepted = self.link.publish(&topic, payload, false);
        self.health.record_publish(accepted);
        if accepted {
            debug!(topic = %topic, payload, "Datapoint published");
        } else {
            warn!(topic = %topic, "Failed to publish datapoint");
        }
        accepted
    }
}

/// Parse a write payload and execute it on the bus.
///
/// Returns the word or coil value written. Payload errors never touch the
/// bus; a held bus yields [`BusError::Busy`].
pub async fn handle_write_command(
    bus: &Weak<ModbusBus>,
    target: &WriteTarget,
    payload: &str,
) -> Result<u16, WriteError> {
    let result = write_value(bus, target, payload).await;

    match &result {
        Ok(value) => debug!(
            topic = %target.topic,
            address = target.address,
            value,
            "Modbus write OK"
        ),
        Err(e @ (WriteError::InvalidPayload { .. } | WriteError::UnsupportedFunction(_))) => {
            warn!(topic = %target.topic, error = %e, "Write command rejected")
        }
        Err(WriteError::Bus(BusError::Transaction { status })) => {
            let rx = bus.upgrade().map(|b| b.dump_rx()).unwrap_or_default();
            error!(
                topic = %target.topic,
                slave_id = target.slave_id,
                function = %target.function,
                address = target.address,
                status = %status,
                rx = %rx,
                "Modbus write failed"
            );
        }
        Err(e) => warn!(topic = %target.topic, error = %e, "Modbus write not executed"),
    }

    result
}

async fn write_value(
    bus: &Weak<ModbusBus>,
    target: &WriteTarget,
    payload: &str,
) -> Result<u16, WriteError> {
    let value = parse_write_value(target.function, target.scale, payload)?;
    let bus = bus.upgrade().ok_or(WriteError::BusGone)?;
    let guard = bus.acquire().ok_or(BusError::Busy)?;

    let request = Request::write(target.slave_id, target.function, target.address, value);
    guard.execute(&request).await?;
    Ok(value)
}

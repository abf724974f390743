//! Modbus-RTU to MQTT gateway daemon.
//!
//! Polls the slaves of one RS-485 bus and publishes their datapoints to an
//! MQTT broker, with Home-Assistant discovery and MQTT driven writes.

use std::sync::Arc;

use anyhow::{Context, Result};
use mbx_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner, MqttLink};

use mqtt_bridge_modbus::admin::{AdminHandle, forward_hangup, system_handlers};
use mqtt_bridge_modbus::bridge::Bridge;
use mqtt_bridge_modbus::bus::{ModbusBus, SerialOpener};
use mqtt_bridge_modbus::config::GatewayConfig;
use mqtt_bridge_modbus::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("mqtt-bridge-modbus.json5");

    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    let health_interval = config.health.publish_interval();

    let mut runner = BridgeRunner::new_with_args("modbus", config, Some(&args))
        .context("Failed to start bridge")?
        .with_status_publishing()
        .with_health_interval(health_interval);

    let modbus = runner.config().modbus.clone();
    let session = runner.session();
    let health = runner.health();

    let bus = Arc::new(ModbusBus::new(
        SerialOpener::new(&modbus.serial.port, modbus.serial.direction),
        modbus.serial.timing(),
    ));

    let (admin, commands) = AdminHandle::channel(&bus);
    session.set_system_handlers(system_handlers(admin.clone(), Arc::downgrade(&session)));

    let link: Arc<dyn MqttLink> = session.clone();
    let bridge = Bridge::new(link, bus, health.clone());
    let mut orchestrator = Orchestrator::new(
        bridge,
        session.clone(),
        commands,
        &modbus.config_path,
        health,
    )
    .with_tick_interval(modbus.tick_interval());
    orchestrator.start().await;

    tracing::info!(
        port = %modbus.serial.port,
        config = %modbus.config_path.display(),
        tick_ms = modbus.tick_interval_ms,
        "Modbus gateway running"
    );

    let metadata = serde_json::json!({
        "serial_port": modbus.serial.port,
        "config_path": modbus.config_path.display().to_string(),
        "tick_interval_ms": modbus.tick_interval_ms,
    });

    runner.spawn(orchestrator.run());
    runner.spawn(forward_hangup(admin));

    runner
        .run_with_metadata(Some(metadata))
        .await
        .context("Bridge stopped with an error")
}

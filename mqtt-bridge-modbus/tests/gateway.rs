//! End-to-end behaviour of the gateway against a simulated slave.

mod common;

use std::sync::Arc;
use std::time::Duration;

use mbx_bridge_framework::{MqttLink, QoS};
use mqtt_bridge_modbus::admin::{AdminHandle, RawOutcome, RawRequest, ScanRequest, system_handlers};
use mqtt_bridge_modbus::bus::{BusTiming, ModbusStatus, append_crc};

use common::{SimulatedSlave, bridge, fast_timing, write_config};

const BOILER: &str = r#"{
    "bus": { "baud": 115200, "serialFormat": "8N1", "enabled": true },
    "devices": [{
        "name": "Boiler", "slaveId": 3, "mqttEnabled": true,
        "dataPoints": [
            { "name": "Temperature", "function": 3, "address": 100,
              "scale": 0.1, "unit": "°C", "poll_interval_ms": 1000 },
            { "name": "Setpoint", "function": 6, "address": 40 }
        ]
    }]
}"#;

fn slow_timing() -> BusTiming {
    BusTiming {
        response_timeout: Duration::from_millis(1000),
        ..fast_timing()
    }
}

#[tokio::test]
async fn test_periodic_read_is_published() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), BOILER);
    let slave = SimulatedSlave::new();
    slave.set_register(3, 100, 245);

    let (mut bridge, link, health) = bridge(&slave, fast_timing());
    bridge.apply_new_config(&path).await.unwrap();
    link.connect();

    bridge.tick(0).await;
    let values = link.published_to("mbx_root/boiler/temperature");
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].payload, "24.5");
    assert_eq!(values[0].qos, QoS::AtMostOnce);
    assert!(!values[0].retain);

    // Not due again before its interval.
    bridge.tick(500).await;
    assert_eq!(slave.requests().len(), 1);

    slave.set_register(3, 100, 251);
    bridge.tick(1000).await;
    let values = link.published_to("mbx_root/boiler/temperature");
    assert_eq!(values.len(), 2);
    assert_eq!(values[1].payload, "25.1");

    let snapshot = health.snapshot();
    assert_eq!(snapshot.transactions_ok, 2);
    assert_eq!(snapshot.messages_published, 2);
    assert!(snapshot.modbus_active);
}

#[tokio::test]
async fn test_crc_failure_is_counted_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), BOILER);
    let slave = SimulatedSlave::new();
    slave.set_register(3, 100, 245);
    slave.corrupt_crc(true);

    let (mut bridge, link, health) = bridge(&slave, fast_timing());
    bridge.apply_new_config(&path).await.unwrap();
    link.connect();

    bridge.tick(0).await;
    assert!(link.published_to("mbx_root/boiler/temperature").is_empty());
    assert_eq!(bridge.bus().error_count(), 1);
    assert!(bridge.bus().dump_rx().starts_with("03 03 02 00 f5"));

    let liveness = health.device_liveness("boiler").unwrap();
    assert_eq!(liveness.consecutive_failures, 1);
    assert_eq!(health.snapshot().transactions_failed, 1);

    // A failed read still waits for its next slot.
    slave.corrupt_crc(false);
    bridge.tick(10).await;
    assert_eq!(slave.requests().len(), 1);

    bridge.tick(1000).await;
    assert_eq!(link.published_to("mbx_root/boiler/temperature").len(), 1);
    assert_eq!(bridge.bus().error_count(), 1);
    assert_eq!(
        health.device_liveness("boiler").unwrap().consecutive_failures,
        0
    );
}

#[tokio::test]
async fn test_mqtt_write_reaches_the_register() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), BOILER);
    let slave = SimulatedSlave::new();

    let (mut bridge, link, health) = bridge(&slave, fast_timing());
    bridge.apply_new_config(&path).await.unwrap();

    assert_eq!(link.deliver("mbx_root/boiler/setpoint", "25").await, 1);
    assert_eq!(slave.register(3, 40), Some(25));

    let mut expected = vec![0x03, 0x06, 0x00, 0x28, 0x00, 0x19];
    append_crc(&mut expected);
    assert_eq!(slave.requests(), vec![expected]);

    // Rejected payloads never reach the line.
    link.deliver("mbx_root/boiler/setpoint", "warm").await;
    assert_eq!(slave.requests().len(), 1);

    let snapshot = health.snapshot();
    assert_eq!(snapshot.commands_handled, 1);
    assert_eq!(snapshot.commands_failed, 1);
}

#[tokio::test]
async fn test_reload_waits_for_transaction_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), BOILER);
    let slave = SimulatedSlave::new();
    slave.set_register(3, 100, 245);
    slave.set_delay(Duration::from_millis(60));

    let (mut bridge, link, _) = bridge(&slave, slow_timing());
    bridge.apply_new_config(&path).await.unwrap();
    link.connect();
    let (admin, _commands) = AdminHandle::channel(bridge.bus());

    let raw: RawRequest =
        serde_json::from_str(r#"{ "slaveId": 3, "function": 3, "address": 100 }"#).unwrap();
    let in_flight = tokio::spawn(async move { admin.execute_raw(&raw).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(bridge.bus().is_busy());

    let renamed = BOILER
        .replace("\"Boiler\"", "\"Furnace\"")
        .replace("115200", "57600");
    write_config(dir.path(), &renamed);
    bridge.apply_new_config(&path).await.unwrap();

    let outcome: RawOutcome = in_flight.await.unwrap().unwrap();
    assert_eq!(outcome.modbus_status(), ModbusStatus::Success);
    assert_eq!(outcome.words, vec![245]);

    assert!(!bridge.bus().is_busy());
    assert!(bridge.bus().is_active());
    assert_eq!(bridge.bus().config().map(|c| c.baud), Some(57600));
    assert_eq!(link.handler_topics(), vec!["mbx_root/furnace/setpoint"]);

    slave.set_delay(Duration::ZERO);
    bridge.tick(0).await;
    assert_eq!(
        link.published_to("mbx_root/furnace/temperature")[0].payload,
        "24.5"
    );
}

#[tokio::test]
async fn test_failed_reload_keeps_running_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), BOILER);
    let slave = SimulatedSlave::new();

    let (mut bridge, _, _) = bridge(&slave, fast_timing());
    bridge.apply_new_config(&path).await.unwrap();

    write_config(dir.path(), r#"{ "bus": { "serialFormat": "7E1" } }"#);
    assert!(bridge.apply_new_config(&path).await.is_err());
    assert_eq!(bridge.configuration().devices[0].id, "boiler");
    assert!(bridge.bus().is_active());
}

#[tokio::test]
async fn test_will_targets_first_discovery_device() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"{
            "bus": { "baud": 115200, "enabled": true },
            "devices": [
                { "name": "Pump", "slaveId": 1, "mqttEnabled": true },
                { "name": "Meter", "slaveId": 2, "mqttEnabled": true,
                  "homeassistantDiscoveryEnabled": true,
                  "dataPoints": [{ "name": "Energy", "function": 4, "address": 0 }] },
                { "name": "Boiler", "slaveId": 3, "mqttEnabled": true,
                  "homeassistantDiscoveryEnabled": true }
            ]
        }"#,
    );
    let slave = SimulatedSlave::new();
    slave.set_register(2, 0, 7);

    let (mut bridge, link, _) = bridge(&slave, fast_timing());
    bridge.apply_new_config(&path).await.unwrap();

    let will = link.will().unwrap();
    assert_eq!(will.topic, "mbx_root/meter/status");
    assert_eq!(will.payload, "offline");
    assert!(will.retain);

    link.connect();
    bridge.tick(0).await;

    let status = link.published_to("mbx_root/meter/status");
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].payload, "online");
    assert!(status[0].retain);
    assert_eq!(
        link.published_to("homeassistant/sensor/meter/energy/config").len(),
        1
    );
    assert_eq!(link.published_to("mbx_root/meter/energy")[0].payload, "7");
}

#[tokio::test]
async fn test_raw_execute_reports_busy_during_poll() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), BOILER);
    let slave = SimulatedSlave::new();
    slave.set_register(3, 100, 245);
    slave.set_delay(Duration::from_millis(80));

    let (mut bridge, link, _) = bridge(&slave, slow_timing());
    bridge.apply_new_config(&path).await.unwrap();
    link.connect();

    let (admin, _commands) = AdminHandle::channel(bridge.bus());
    let handlers = system_handlers(admin, Arc::downgrade(&link));
    for (topic, handler) in handlers(&link.root_topic()) {
        link.add_handler(&topic, handler);
    }

    let poll = tokio::spawn(async move {
        bridge.tick(0).await;
        bridge
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let delivered = link
        .deliver(
            "mbx_root/system/modbus/execute",
            r#"{ "slaveId": 3, "function": 3, "address": 100 }"#,
        )
        .await;
    assert_eq!(delivered, 1);

    let results = link.published_to("mbx_root/system/modbus/execute/result");
    assert_eq!(results.len(), 1);
    let result: serde_json::Value = serde_json::from_str(&results[0].payload).unwrap();
    assert_eq!(result["status"], 0xE4);
    assert_eq!(result["rx"], "");
    assert_eq!(result["words"], serde_json::json!([]));

    let bridge = poll.await.unwrap();
    assert!(!bridge.bus().is_busy());
    assert_eq!(
        link.published_to("mbx_root/boiler/temperature")[0].payload,
        "24.5"
    );
}

#[tokio::test]
async fn test_slave_scan_reports_answering_ids() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), BOILER);
    let slave = SimulatedSlave::new();
    slave.silence(2);

    let (mut bridge, link, _) = bridge(&slave, fast_timing());
    bridge.apply_new_config(&path).await.unwrap();
    link.connect();

    let (admin, _commands) = AdminHandle::channel(bridge.bus());
    let report = admin
        .scan_slaves(ScanRequest::ids(1, 4))
        .await
        .unwrap();
    assert_eq!(report.present, vec![1, 3, 4]);
    assert!(report.skipped.is_empty());
    assert_eq!(slave.requests().len(), 4);
    assert!(!bridge.bus().is_busy());

    // Same scan over the system topic, result published asynchronously.
    let handlers = system_handlers(admin, Arc::downgrade(&link));
    for (topic, handler) in handlers(&link.root_topic()) {
        link.add_handler(&topic, handler);
    }
    link.deliver("mbx_root/system/modbus/scan", r#"{ "first": 2, "last": 3 }"#)
        .await;

    let mut results = Vec::new();
    for _ in 0..50 {
        results = link.published_to("mbx_root/system/modbus/scan/result");
        if !results.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(results.len(), 1);
    let result: serde_json::Value = serde_json::from_str(&results[0].payload).unwrap();
    assert_eq!(result["present"], serde_json::json!([3]));
}

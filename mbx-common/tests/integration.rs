//! Integration tests for mbx-common library.

use mbx_common::{
    LogFormat, LoggingConfig, TopicRoot, ha_config_topic, load_config, slugify, title_case,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct GatewayFile {
    root_topic: String,
    #[serde(default)]
    logging: LoggingConfig,
}

#[test]
fn test_load_json5_file_and_build_topics() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("gateway.json5");
    std::fs::write(
        &path,
        r#"{
            root_topic: "plant/",
            logging: { level: "warn", format: "json" },
        }"#,
    )
    .expect("write config");

    let config: GatewayFile = load_config(&path).expect("load config");
    assert_eq!(config.logging.level, "warn");
    assert_eq!(config.logging.format, LogFormat::Json);

    let root = TopicRoot::new(&config.root_topic);
    let device = slugify("Heat Pump");
    assert_eq!(root.join(&format!("{}/status", device)), "plant/heat_pump/status");
    assert_eq!(root.system("health"), "plant/system/health");
}

#[test]
fn test_discovery_topic_uses_slugs() {
    let topic = ha_config_topic("number", &slugify("Heat Pump"), &slugify("Set-Point"));
    assert_eq!(topic, "homeassistant/number/heat_pump/set_point/config");
}

#[test]
fn test_title_case_of_slug_round_trips_words() {
    assert_eq!(title_case(&slugify("Supply Temp")), "Supply Temp");
}

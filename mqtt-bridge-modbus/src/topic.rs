//! MQTT topics and display names of devices and datapoints.

use mbx_common::{TopicRoot, slug_token, title_case};

use crate::model::{Datapoint, Device};

const DATAPOINT_FALLBACK: &str = "datapoint";
const DEVICE_FALLBACK: &str = "device";

/// Builds the topics of a configuration under one root topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicBuilder {
    root: TopicRoot,
}

impl TopicBuilder {
    pub fn new(root: TopicRoot) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &TopicRoot {
        &self.root
    }

    /// Topic a datapoint publishes to, or listens on for writes.
    ///
    /// A non-blank override topic is used verbatim.
    ///
    /// # Example
    /// ```
    /// use mbx_common::TopicRoot;
    /// use mqtt_bridge_modbus::model::{Datapoint, Device};
    /// use mqtt_bridge_modbus::topic::TopicBuilder;
    ///
    /// let builder = TopicBuilder::new(TopicRoot::new("plant"));
    /// let device = Device::new("boiler", "Boiler Room", 3);
    /// let dp = Datapoint { id: "boiler.supply_temp".into(), ..Datapoint::default() };
    /// assert_eq!(builder.datapoint_topic(&device, &dp), "plant/boiler_room/supply_temp");
    /// ```
    pub fn datapoint_topic(&self, device: &Device, dp: &Datapoint) -> String {
        let custom = dp.topic.trim();
        if !custom.is_empty() {
            return custom.to_string();
        }
        self.root.join(&format!(
            "{}/{}",
            device_segment(device),
            datapoint_segment(dp)
        ))
    }

    /// Retained reachability topic of a device.
    pub fn availability_topic(&self, device: &Device) -> String {
        self.root.join(&format!("{}/status", device_segment(device)))
    }
}

/// Topic segment of a device: its name, else its id, else `device_<slave>`.
pub fn device_segment(device: &Device) -> String {
    slug_token(&device.name)
        .or_else(|| {
            let id = device.id.trim();
            if id.is_empty() {
                slug_token(&format!("device_{}", device.slave_id))
            } else {
                slug_token(id)
            }
        })
        .unwrap_or_else(|| DEVICE_FALLBACK.to_string())
}

/// Topic segment of a datapoint: its name, else the last part of its id.
pub fn datapoint_segment(dp: &Datapoint) -> String {
    slug_token(&dp.name)
        .or_else(|| {
            let tail = match dp.id.rfind('.') {
                Some(pos) if pos + 1 < dp.id.len() => &dp.id[pos + 1..],
                _ => dp.id.as_str(),
            };
            slug_token(tail)
        })
        .unwrap_or_else(|| DATAPOINT_FALLBACK.to_string())
}

/// Display name of a datapoint: title-cased device and datapoint labels.
pub fn friendly_name(device: &Device, dp: &Datapoint) -> String {
    let device_label = first_label([
        title_case(&device.name),
        title_case(&device.id),
        title_case(&device_segment(device)),
    ]);
    let datapoint_label = first_label([title_case(&dp.name), title_case(&dp.id)]);

    match (device_label.is_empty(), datapoint_label.is_empty()) {
        (false, false) => format!("{} {}", device_label, datapoint_label),
        (false, true) => device_label,
        _ => datapoint_label,
    }
}

fn first_label<const N: usize>(labels: [String; N]) -> String {
    labels
        .into_iter()
        .find(|label| !label.is_empty())
        .unwrap_or_default()
}

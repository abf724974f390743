//! MQTT topic helpers.
//!
//! Every topic the gateway publishes or subscribes to is rooted at a
//! configurable root topic:
//!
//! ```text
//! <root>/<device>/<datapoint>     datapoint values
//! <root>/<device>/status          device availability
//! <root>/system/<path>            gateway system surface
//! homeassistant/<kind>/<device>/<datapoint>/config
//! ```

/// Root topic used when the MQTT settings do not name one.
pub const DEFAULT_ROOT_TOPIC: &str = "mbx_root";

/// Prefix for Home-Assistant discovery descriptors.
pub const HA_DISCOVERY_PREFIX: &str = "homeassistant";

/// Fallback segment used when a label slugifies to nothing.
pub const FALLBACK_SLUG: &str = "device";

/// Builder for topics under a root topic.
///
/// Leading and trailing whitespace of the root is ignored, and a trailing
/// `/` is never doubled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRoot {
    root: String,
}

impl TopicRoot {
    /// Create a builder for the given root topic.
    pub fn new(root: impl AsRef<str>) -> Self {
        let root = root.as_ref().trim();
        let root = root.strip_suffix('/').unwrap_or(root);
        Self {
            root: root.to_string(),
        }
    }

    /// The normalized root topic (may be empty).
    pub fn as_str(&self) -> &str {
        &self.root
    }

    /// Join a relative path onto the root.
    ///
    /// # Example
    /// ```
    /// use mbx_common::topic::TopicRoot;
    ///
    /// assert_eq!(TopicRoot::new("plant/").join("boiler/status"), "plant/boiler/status");
    /// assert_eq!(TopicRoot::new("").join("boiler/status"), "boiler/status");
    /// ```
    pub fn join(&self, path: &str) -> String {
        if self.root.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.root, path)
        }
    }

    /// Build a topic on the gateway system surface.
    ///
    /// # Example
    /// ```
    /// use mbx_common::topic::TopicRoot;
    ///
    /// let root = TopicRoot::new("mbx_root");
    /// assert_eq!(root.system("log/echo"), "mbx_root/system/log/echo");
    /// ```
    pub fn system(&self, path: &str) -> String {
        self.join(&format!("system/{}", path))
    }
}

impl Default for TopicRoot {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT_TOPIC)
    }
}

/// Build the topic of a Home-Assistant discovery descriptor.
///
/// # Example
/// ```
/// use mbx_common::topic::ha_config_topic;
///
/// assert_eq!(
///     ha_config_topic("sensor", "boiler", "temperature"),
///     "homeassistant/sensor/boiler/temperature/config"
/// );
/// ```
pub fn ha_config_topic(kind: &str, device: &str, object: &str) -> String {
    format!("{}/{}/{}/{}/config", HA_DISCOVERY_PREFIX, kind, device, object)
}

/// Slugify a label, returning `None` when nothing alphanumeric remains.
///
/// ASCII alphanumerics are lowercased and kept; every other run of bytes
/// becomes a single `_` between tokens.
pub fn slug_token(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut last_underscore = false;

    for byte in text.bytes() {
        if byte.is_ascii_alphanumeric() {
            out.push(byte.to_ascii_lowercase() as char);
            last_underscore = false;
        } else if !last_underscore && !out.is_empty() {
            out.push('_');
            last_underscore = true;
        }
    }

    while out.ends_with('_') {
        out.pop();
    }

    if out.is_empty() { None } else { Some(out) }
}

/// Slugify a label into a topic segment.
///
/// # Example
/// ```
/// use mbx_common::topic::slugify;
///
/// assert_eq!(slugify("Boiler Room #2"), "boiler_room_2");
/// assert_eq!(slugify("  --  "), "device");
/// ```
pub fn slugify(text: &str) -> String {
    slug_token(text).unwrap_or_else(|| FALLBACK_SLUG.to_string())
}

/// Title-case a label for display.
///
/// `_`, `-` and `.` separate words and become single spaces.
///
/// # Example
/// ```
/// use mbx_common::topic::title_case;
///
/// assert_eq!(title_case("boiler_room.supply-temp"), "Boiler Room Supply Temp");
/// ```
pub fn title_case(text: &str) -> String {
    let text = text.trim();
    let mut out = String::with_capacity(text.len() + 4);
    let mut new_word = true;

    for ch in text.chars() {
        if matches!(ch, '_' | '-' | '.') {
            if !out.is_empty() && !out.ends_with(' ') {
                out.push(' ');
            }
            new_word = true;
            continue;
        }
        if new_word {
            out.extend(ch.to_uppercase());
            new_word = false;
        } else {
            out.extend(ch.to_lowercase());
        }
    }

    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Check whether a string can be used as a publish topic.
///
/// Publish topics must be non-empty and free of wildcards and NUL.
pub fn is_publish_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_normalization() {
        assert_eq!(TopicRoot::new(" plant/ ").as_str(), "plant");
        assert_eq!(TopicRoot::new("plant").join("a/b"), "plant/a/b");
        assert_eq!(TopicRoot::default().as_str(), "mbx_root");
    }

    #[test]
    fn test_slugify_collapses_separators() {
        assert_eq!(slugify("Boiler  --  Room"), "boiler_room");
        assert_eq!(slugify("__leading"), "leading");
        assert_eq!(slugify("trailing!!"), "trailing");
        assert_eq!(slugify("Zähler 1"), "z_hler_1");
    }

    #[test]
    fn test_slugify_is_idempotent() {
        for input in ["Boiler Room", "a..b", "X-1_y", "", "___", "Temp °C"] {
            let once = slugify(input);
            assert_eq!(slugify(&once), once);
            assert!(
                once.bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
            );
        }
    }

    #[test]
    fn test_slug_token_empty() {
        assert_eq!(slug_token(""), None);
        assert_eq!(slug_token(" / "), None);
        assert_eq!(slug_token("A"), Some("a".to_string()));
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("heat_pump"), "Heat Pump");
        assert_eq!(title_case("  FLOW..rate_ "), "Flow Rate");
        assert_eq!(title_case(""), "");
    }

    #[test]
    fn test_publish_topic_validation() {
        assert!(is_publish_topic("a/b"));
        assert!(!is_publish_topic(""));
        assert!(!is_publish_topic("a/+/b"));
        assert!(!is_publish_topic("a/#"));
    }
}

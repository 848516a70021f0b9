//! Process settings for producers, consumers and the command line.
//!
//! Settings come from an optional TOML file and are then overlaid with
//! environment variables:
//!
//! | key               | variable                 |
//! |-------------------|--------------------------|
//! | `service_variant` | `SERVICE_VARIANT`        |
//! | `topic_prefix`    | `EVENT_BUS_TOPIC_PREFIX` |
//! | `producer`        | `EVENT_BUS_PRODUCER`     |
//! | `consumer`        | `EVENT_BUS_CONSUMER`     |
//! | `kurrent_url`     | `EVENT_BUS_KURRENT_URL`  |
//!
//! `debug` and the `producer_config` table are file-only.

use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value as Json};

use crate::error::Error;
use crate::event::SignalRegistry;
use crate::producer::ProducerConfig;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub service_variant: Option<String>,
    /// Emit in fail-fast mode so receiver errors surface to the caller.
    pub debug: bool,
    pub topic_prefix: Option<String>,
    /// Loader reference of the producer factory.
    pub producer: Option<String>,
    /// Loader reference of the consumer factory.
    pub consumer: Option<String>,
    pub kurrent_url: Option<String>,
    /// Raw producer configuration; see [`ProducerConfig::from_value`].
    pub producer_config: Map<String, Json>,
}

impl Settings {
    /// Reads `path` when given, then applies the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let settings = match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        Ok(settings.with_env(|name| std::env::var(name).ok()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        Ok(toml::from_str(text)?)
    }

    /// Overlays values found through `lookup`. Blank values are ignored.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let overlays = [
            ("SERVICE_VARIANT", &mut self.service_variant),
            ("EVENT_BUS_TOPIC_PREFIX", &mut self.topic_prefix),
            ("EVENT_BUS_PRODUCER", &mut self.producer),
            ("EVENT_BUS_CONSUMER", &mut self.consumer),
            ("EVENT_BUS_KURRENT_URL", &mut self.kurrent_url),
        ];
        for (name, slot) in overlays {
            if let Some(value) = read(name) {
                *slot = Some(value);
            }
        }
        self
    }

    /// Validates `producer_config` against the registered signals.
    pub fn producer_config(&self, registry: &SignalRegistry) -> Result<ProducerConfig, Error> {
        ProducerConfig::from_value(&Json::Object(self.producer_config.clone()), registry)
    }

    pub fn topic_prefix(&self) -> Option<&str> {
        self.topic_prefix.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use std::collections::HashMap;
    use std::io::Write;

    const FILE: &str = r#"
service_variant = "lms"
debug = true
topic_prefix = "dev"
producer = "hermes.memory.create_producer"

[producer_config."org.openedx.content_authoring.xblock.published.v1".xblock-published]
key_field_path = "xblock_info.usage_key"
enabled = true
"#;

    #[test]
    fn file_values_are_read() {
        let settings = Settings::from_toml_str(FILE).unwrap();
        assert_eq!(settings.service_variant.as_deref(), Some("lms"));
        assert!(settings.debug);
        assert_eq!(settings.topic_prefix(), Some("dev"));
        assert_eq!(settings.consumer, None);

        let config = settings.producer_config(&catalog::registry().unwrap()).unwrap();
        let topics = config.topics(catalog::XBLOCK_PUBLISHED).unwrap();
        assert!(topics["xblock-published"].enabled);
    }

    #[test]
    fn environment_overrides_the_file() {
        let env = HashMap::from([
            ("EVENT_BUS_PRODUCER", "hermes.kurrent.create_producer"),
            ("EVENT_BUS_CONSUMER", "hermes.kurrent.create_consumer"),
            ("EVENT_BUS_TOPIC_PREFIX", "  "),
        ]);
        let settings = Settings::from_toml_str(FILE)
            .unwrap()
            .with_env(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(settings.producer.as_deref(), Some("hermes.kurrent.create_producer"));
        assert_eq!(settings.consumer.as_deref(), Some("hermes.kurrent.create_consumer"));
        assert_eq!(settings.topic_prefix(), Some("dev"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Settings::from_toml_str("produce = \"x\"").unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
    }

    #[test]
    fn load_reads_a_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"debug = true\n").unwrap();
        let settings = Settings::load(Some(file.path())).unwrap();
        assert!(settings.debug);
        assert!(Settings::load(Some(Path::new("/nonexistent/hermes.toml"))).is_err());
    }
}

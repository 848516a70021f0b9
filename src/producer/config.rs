use std::collections::BTreeMap;

use serde_json::{Map, Value as Json};

use super::validate_key_path;
use crate::error::Error;
use crate::event::SignalRegistry;

/// Where one topic's events are keyed from, and whether the topic is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub key_field_path: String,
    pub enabled: bool,
}

/// Validated producer configuration: event type to topic to [`TopicConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerConfig {
    events: BTreeMap<String, BTreeMap<String, TopicConfig>>,
}

impl ProducerConfig {
    /// Validates a raw configuration against the registered signals.
    ///
    /// The whole configuration is rejected on the first problem: a non-mapping
    /// where a mapping is expected, an unregistered event type, a topic entry
    /// without exactly a string `key_field_path` and a bool `enabled`, or a key
    /// path that does not lead to a scalar in the signal's data.
    pub fn from_value(value: &Json, registry: &SignalRegistry) -> Result<Self, Error> {
        let Some(events) = value.as_object() else {
            return Err(Error::producer_configuration(
                None,
                format!("producer_config should be a dictionary, got {}", json_kind(value)),
            ));
        };

        let mut config = ProducerConfig::default();
        for (event_type, topics) in events {
            let signal = registry.get(event_type).ok_or_else(|| {
                Error::producer_configuration(
                    Some(event_type),
                    format!("No registered signal of type '{event_type}'"),
                )
            })?;
            let Some(topics) = topics.as_object() else {
                return Err(Error::producer_configuration(
                    Some(event_type),
                    format!("Configuration for event type '{event_type}' should be a dictionary"),
                ));
            };

            let mut parsed = BTreeMap::new();
            for (topic, entry) in topics {
                let topic_config = parse_topic(event_type, topic, entry)?;
                validate_key_path(signal, &topic_config.key_field_path)?;
                parsed.insert(topic.clone(), topic_config);
            }
            config.events.insert(event_type.clone(), parsed);
        }
        Ok(config)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }

    pub fn topics(&self, event_type: &str) -> Option<&BTreeMap<String, TopicConfig>> {
        self.events.get(event_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, TopicConfig>)> {
        self.events.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn parse_topic(event_type: &str, topic: &str, entry: &Json) -> Result<TopicConfig, Error> {
    let fail = |message: String| Error::producer_configuration(Some(event_type), message);

    let Some(entry) = entry.as_object() else {
        return Err(fail(format!(
            "Configuration for topic '{topic}' should be a dictionary"
        )));
    };
    if let Some(unexpected) = entry
        .keys()
        .find(|key| !matches!(key.as_str(), "key_field_path" | "enabled"))
    {
        return Err(fail(format!(
            "Configuration for topic '{topic}' has unexpected key '{unexpected}'"
        )));
    }

    let key_field_path = match entry.get("key_field_path") {
        None => {
            return Err(fail(format!(
                "Configuration for topic '{topic}' is missing 'key_field_path' key"
            )));
        }
        Some(Json::String(path)) => path.clone(),
        Some(other) => {
            return Err(fail(format!(
                "'key_field_path' should be a string, got {}",
                json_kind(other)
            )));
        }
    };
    let enabled = match entry.get("enabled") {
        None => {
            return Err(fail(format!(
                "Configuration for topic '{topic}' is missing 'enabled' key"
            )));
        }
        Some(Json::Bool(enabled)) => *enabled,
        Some(other) => {
            return Err(fail(format!("'enabled' should be a bool, got {}", json_kind(other))));
        }
    };

    Ok(TopicConfig {
        key_field_path,
        enabled,
    })
}

fn json_kind(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "list",
        Json::Object(_) => "dictionary",
    }
}

/// Overlays `overrides` on `base`, one topic entry at a time.
///
/// Keys set in an override entry replace the same keys in the base entry;
/// topics and event types only present on one side pass through. Neither input
/// is modified.
pub fn merge_producer_configs(base: &Map<String, Json>, overrides: &Map<String, Json>) -> Map<String, Json> {
    let mut merged = base.clone();
    for (event_type, override_topics) in overrides {
        match (merged.get_mut(event_type), override_topics) {
            (Some(Json::Object(base_topics)), Json::Object(override_topics)) => {
                overlay_topics(base_topics, override_topics);
            }
            _ => {
                merged.insert(event_type.clone(), override_topics.clone());
            }
        }
    }
    merged
}

fn overlay_topics(base_topics: &mut Map<String, Json>, override_topics: &Map<String, Json>) {
    for (topic, override_entry) in override_topics {
        match (base_topics.get_mut(topic), override_entry) {
            (Some(Json::Object(base_entry)), Json::Object(override_entry)) => {
                for (key, value) in override_entry {
                    base_entry.insert(key.clone(), value.clone());
                }
            }
            _ => {
                base_topics.insert(topic.clone(), override_entry.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use serde_json::json;

    fn registry() -> SignalRegistry {
        catalog::registry().unwrap()
    }

    fn validate(value: Json) -> Result<ProducerConfig, Error> {
        ProducerConfig::from_value(&value, &registry())
    }

    #[test]
    fn accepts_a_well_formed_config() {
        let config = validate(json!({
            catalog::XBLOCK_PUBLISHED: {
                "topic-a": {"key_field_path": "xblock_info.usage_key", "enabled": true},
                "topic-c": {"key_field_path": "xblock_info.usage_key", "enabled": false},
            }
        }))
        .unwrap();
        let topics = config.topics(catalog::XBLOCK_PUBLISHED).unwrap();
        assert!(topics["topic-a"].enabled);
        assert!(!topics["topic-c"].enabled);
    }

    #[test]
    fn non_mapping_config_is_rejected() {
        let err = validate(json!([])).unwrap_err();
        assert!(err.to_string().contains("should be a dictionary"));
    }

    #[test]
    fn unknown_event_types_are_rejected() {
        let err = validate(json!({"org.example.nope.v1": {}})).unwrap_err();
        assert!(err.to_string().contains("No registered signal of type"));
    }

    #[test]
    fn topic_entries_need_exactly_two_typed_keys() {
        let cases = [
            (json!("nope"), "should be a dictionary"),
            (json!({"enabled": true}), "missing 'key_field_path' key"),
            (json!({"key_field_path": "xblock_info.usage_key"}), "missing 'enabled' key"),
            (json!({"key_field_path": 3, "enabled": true}), "'key_field_path' should be a string"),
            (
                json!({"key_field_path": "xblock_info.usage_key", "enabled": "yes"}),
                "'enabled' should be a bool",
            ),
            (
                json!({"key_field_path": "xblock_info.usage_key", "enabled": true, "extra": 1}),
                "unexpected key",
            ),
        ];
        for (entry, expected) in cases {
            let err = validate(json!({catalog::XBLOCK_PUBLISHED: {"topic": entry}})).unwrap_err();
            assert!(matches!(err, Error::ProducerConfiguration { .. }));
            assert!(err.to_string().contains(expected), "{err} lacks {expected}");
        }
    }

    #[test]
    fn unreachable_key_paths_are_rejected() {
        for path in ["xblock_info.missing", "nope", "xblock_info"] {
            let err = validate(json!({
                catalog::XBLOCK_PUBLISHED: {"topic": {"key_field_path": path, "enabled": true}}
            }))
            .unwrap_err();
            assert!(matches!(err, Error::ProducerConfiguration { .. }), "{path}");
        }
    }

    #[test]
    fn merge_overlays_per_topic_without_touching_inputs() {
        let base = json!({
            "event.a.v1": {
                "topic-1": {"key_field_path": "x.id", "enabled": true},
                "topic-2": {"key_field_path": "x.id", "enabled": true},
            },
            "event.b.v1": {"topic-3": {"key_field_path": "y.id", "enabled": true}},
        });
        let overrides = json!({
            "event.a.v1": {
                "topic-2": {"enabled": false},
                "topic-4": {"key_field_path": "x.other", "enabled": true},
            },
        });
        let base_map = base.as_object().unwrap().clone();
        let overrides_map = overrides.as_object().unwrap().clone();

        let merged = Json::Object(merge_producer_configs(&base_map, &overrides_map));
        assert_eq!(
            merged,
            json!({
                "event.a.v1": {
                    "topic-1": {"key_field_path": "x.id", "enabled": true},
                    "topic-2": {"key_field_path": "x.id", "enabled": false},
                    "topic-4": {"key_field_path": "x.other", "enabled": true},
                },
                "event.b.v1": {"topic-3": {"key_field_path": "y.id", "enabled": true}},
            })
        );
        assert_eq!(Json::Object(base_map), base);
        assert_eq!(Json::Object(overrides_map), overrides);
    }
}

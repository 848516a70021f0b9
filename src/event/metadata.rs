use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::EventType;
use crate::error::Error;

pub const SPEC_VERSION: &str = "1.0";
pub const CONTENT_TYPE: &str = "application/avro";

/// Where emitted events say they come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub service_variant: String,
    pub host: String,
}

impl SourceInfo {
    /// Reads `SERVICE_VARIANT` and `HOSTNAME`, falling back to `/etc/hostname`.
    pub fn from_env() -> Self {
        let service_variant = std::env::var("SERVICE_VARIANT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let host = std::env::var("HOSTNAME")
            .ok()
            .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            service_variant,
            host,
        }
    }
}

static SOURCE: OnceLock<SourceInfo> = OnceLock::new();

/// Fixes the source stamped on every event. Only the first call wins; later calls
/// (and calls after the first emission) return the rejected value.
pub fn configure_source(info: SourceInfo) -> Result<(), SourceInfo> {
    SOURCE.set(info)
}

fn source() -> &'static SourceInfo {
    SOURCE.get_or_init(SourceInfo::from_env)
}

fn library_version() -> (u16, u16, u16) {
    (
        env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
    )
}

/// CloudEvents-style attributes generated once per emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub id: Uuid,
    pub event_type: String,
    pub minor_version: u32,
    pub source: String,
    pub sourcehost: String,
    pub time: DateTime<Utc>,
    pub sourcelib: (u16, u16, u16),
    pub specversion: String,
}

impl EventMetadata {
    pub fn generate(event_type: &EventType, minor_version: u32) -> Self {
        let source = source();
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            minor_version,
            source: format!("openedx/{}/web", source.service_variant),
            sourcehost: source.host.clone(),
            time: Utc::now(),
            sourcelib: library_version(),
            specversion: SPEC_VERSION.to_string(),
        }
    }

    /// Transport headers for this event.
    pub fn to_headers(&self) -> BTreeMap<String, String> {
        let (major, minor, patch) = self.sourcelib;
        [
            ("ce_id", self.id.hyphenated().to_string()),
            ("ce_type", self.event_type.clone()),
            ("ce_source", self.source.clone()),
            ("ce_specversion", self.specversion.clone()),
            ("ce_time", self.time.to_rfc3339_opts(SecondsFormat::AutoSi, false)),
            ("sourcehost", self.sourcehost.clone()),
            ("sourcelib", format!("{major}.{minor}.{patch}")),
            ("minorversion", self.minor_version.to_string()),
            ("content-type", CONTENT_TYPE.to_string()),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
    }

    /// Parses headers written by [`to_headers`](Self::to_headers).
    ///
    /// # Errors
    ///
    /// [`Error::Decode`] when a header is missing or malformed.
    pub fn from_headers(headers: &BTreeMap<String, String>) -> Result<Self, Error> {
        let id = Uuid::parse_str(header(headers, "ce_id")?)
            .map_err(|e| Error::decode(format!("invalid ce_id: {e}")))?;
        let time = DateTime::parse_from_rfc3339(header(headers, "ce_time")?)
            .map_err(|e| Error::decode(format!("invalid ce_time: {e}")))?
            .with_timezone(&Utc);
        let minor_version = header(headers, "minorversion")?
            .parse::<u32>()
            .map_err(|e| Error::decode(format!("invalid minorversion: {e}")))?;
        let sourcelib = parse_version(header(headers, "sourcelib")?)?;

        Ok(Self {
            id,
            event_type: header(headers, "ce_type")?.to_string(),
            minor_version,
            source: header(headers, "ce_source")?.to_string(),
            sourcehost: header(headers, "sourcehost")?.to_string(),
            time,
            sourcelib,
            specversion: header(headers, "ce_specversion")?.to_string(),
        })
    }
}

fn header<'h>(headers: &'h BTreeMap<String, String>, name: &str) -> Result<&'h str, Error> {
    headers
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| Error::decode(format!("missing header '{name}'")))
}

fn parse_version(text: &str) -> Result<(u16, u16, u16), Error> {
    let parts = text
        .split('.')
        .map(str::parse::<u16>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::decode(format!("invalid sourcelib '{text}': {e}")))?;
    match parts.as_slice() {
        [major, minor, patch] => Ok((*major, *minor, *patch)),
        _ => Err(Error::decode(format!("invalid sourcelib '{text}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> EventMetadata {
        EventMetadata::generate(&EventType::try_new("org.example.thing.v1").unwrap(), 2)
    }

    #[test]
    fn generated_metadata_is_fresh_per_call() {
        let first = metadata();
        let second = metadata();
        assert_ne!(first.id, second.id);
        assert_eq!(first.specversion, "1.0");
        assert_eq!(first.minor_version, 2);
        assert!(first.source.starts_with("openedx/"));
        assert!(first.source.ends_with("/web"));
    }

    #[test]
    fn headers_carry_every_attribute() {
        let headers = metadata().to_headers();
        for name in [
            "ce_id",
            "ce_type",
            "ce_source",
            "ce_specversion",
            "ce_time",
            "sourcehost",
            "sourcelib",
            "minorversion",
            "content-type",
        ] {
            assert!(headers.contains_key(name), "missing {name}");
        }
        assert_eq!(headers["ce_type"], "org.example.thing.v1");
        assert_eq!(headers["sourcelib"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn headers_parse_back_to_the_same_metadata() {
        let original = metadata();
        let parsed = EventMetadata::from_headers(&original.to_headers()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn missing_headers_are_decode_errors() {
        let mut headers = metadata().to_headers();
        headers.remove("ce_id");
        let err = EventMetadata::from_headers(&headers).unwrap_err();
        assert!(err.to_string().contains("missing header 'ce_id'"));
    }
}

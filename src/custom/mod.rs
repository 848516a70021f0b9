//! Custom scalar types and the codecs that carry them over the wire.
//!
//! A custom type is identified by a dotted [`CustomTypeId`]. Ids form families:
//! `opaque-key.usage` belongs to `opaque-key`, so a codec registered for the
//! parent also handles every child. Each codec reports the primitive kind it
//! produces (the schema leaf) and converts in both directions.
//!
//! The registry ships codecs for timestamps with offsets, UUIDs, and the opaque
//! key family. Callers overlay their own codecs; later registrations win.

mod opaque_key;

pub use opaque_key::{KeyKind, OpaqueKey};

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, SecondsFormat};
use uuid::Uuid;

use crate::error::Error;
use crate::types::{Datum, PrimitiveKind};

pub const TIMESTAMP: CustomTypeId = CustomTypeId::from_static("timestamp");
pub const UUID: CustomTypeId = CustomTypeId::from_static("uuid");
pub const OPAQUE_KEY: CustomTypeId = CustomTypeId::from_static("opaque-key");
pub const COURSE_KEY: CustomTypeId = CustomTypeId::from_static("opaque-key.course");
pub const USAGE_KEY: CustomTypeId = CustomTypeId::from_static("opaque-key.usage");
pub const LIBRARY_LOCATOR: CustomTypeId = CustomTypeId::from_static("opaque-key.library");

/// Dotted identifier of a custom scalar type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CustomTypeId(Cow<'static, str>);

impl CustomTypeId {
    pub const fn from_static(id: &'static str) -> Self {
        Self(Cow::Borrowed(id))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(Cow::Owned(id.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The enclosing family, if any.
    pub fn parent(&self) -> Option<CustomTypeId> {
        self.0
            .rsplit_once('.')
            .map(|(parent, _)| CustomTypeId::new(parent))
    }

    /// True when `self` is `ancestor` or one of its descendants.
    pub fn is_within(&self, ancestor: &CustomTypeId) -> bool {
        self == ancestor
            || self
                .0
                .strip_prefix(ancestor.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    }

    /// This id followed by each of its ancestors, nearest first.
    pub fn lineage(&self) -> impl Iterator<Item = CustomTypeId> {
        std::iter::successors(Some(self.clone()), CustomTypeId::parent)
    }
}

impl fmt::Display for CustomTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for CustomTypeId {
    fn from(id: &'static str) -> Self {
        Self::from_static(id)
    }
}

impl From<String> for CustomTypeId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// A value of a custom scalar type.
#[derive(Debug, Clone, PartialEq)]
pub enum CustomValue {
    Timestamp(DateTime<FixedOffset>),
    Uuid(Uuid),
    Key(OpaqueKey),
    /// A caller-defined scalar carried in its canonical textual form.
    Extension { type_id: CustomTypeId, repr: String },
}

impl CustomValue {
    pub fn custom_type(&self) -> CustomTypeId {
        match self {
            CustomValue::Timestamp(_) => TIMESTAMP,
            CustomValue::Uuid(_) => UUID,
            CustomValue::Key(key) => key.kind().type_id(),
            CustomValue::Extension { type_id, .. } => type_id.clone(),
        }
    }
}

/// Converts one family of custom values to and from its primitive form.
pub trait CustomCodec: Send + Sync {
    /// The primitive kind written in the schema for this type.
    fn leaf_type(&self) -> PrimitiveKind;

    fn to_primitive(&self, value: &CustomValue) -> Result<Datum, Error>;

    /// `type_id` is the id declared by the descriptor being decoded, which may be
    /// a child of the id this codec was registered under.
    fn from_primitive(&self, type_id: &CustomTypeId, datum: &Datum) -> Result<CustomValue, Error>;
}

fn expect_string<'a>(type_id: &CustomTypeId, datum: &'a Datum) -> Result<&'a str, Error> {
    match datum {
        Datum::String(s) => Ok(s),
        other => Err(Error::decode(format!(
            "expected a string for custom type '{type_id}', got {}",
            other.kind_name()
        ))),
    }
}

fn mismatch(codec: &str, value: &CustomValue) -> Error {
    Error::encode(format!(
        "{codec} codec cannot convert a value of custom type '{}'",
        value.custom_type()
    ))
}

/// ISO-8601 extended format with an explicit offset.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampCodec;

impl CustomCodec for TimestampCodec {
    fn leaf_type(&self) -> PrimitiveKind {
        PrimitiveKind::String
    }

    fn to_primitive(&self, value: &CustomValue) -> Result<Datum, Error> {
        match value {
            CustomValue::Timestamp(time) => Ok(Datum::String(
                time.to_rfc3339_opts(SecondsFormat::AutoSi, false),
            )),
            other => Err(mismatch("timestamp", other)),
        }
    }

    fn from_primitive(&self, type_id: &CustomTypeId, datum: &Datum) -> Result<CustomValue, Error> {
        let text = expect_string(type_id, datum)?;
        DateTime::parse_from_rfc3339(text)
            .map(CustomValue::Timestamp)
            .map_err(|e| Error::decode(format!("invalid timestamp '{text}': {e}")))
    }
}

/// Canonical hyphenated lowercase UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidCodec;

impl CustomCodec for UuidCodec {
    fn leaf_type(&self) -> PrimitiveKind {
        PrimitiveKind::String
    }

    fn to_primitive(&self, value: &CustomValue) -> Result<Datum, Error> {
        match value {
            CustomValue::Uuid(id) => Ok(Datum::String(id.hyphenated().to_string())),
            other => Err(mismatch("uuid", other)),
        }
    }

    fn from_primitive(&self, type_id: &CustomTypeId, datum: &Datum) -> Result<CustomValue, Error> {
        let text = expect_string(type_id, datum)?;
        Uuid::parse_str(text)
            .map(CustomValue::Uuid)
            .map_err(|e| Error::decode(format!("invalid uuid '{text}': {e}")))
    }
}

/// Course, usage and library keys in their canonical string form.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpaqueKeyCodec;

impl CustomCodec for OpaqueKeyCodec {
    fn leaf_type(&self) -> PrimitiveKind {
        PrimitiveKind::String
    }

    fn to_primitive(&self, value: &CustomValue) -> Result<Datum, Error> {
        match value {
            CustomValue::Key(key) => Ok(Datum::String(key.to_string())),
            other => Err(mismatch("opaque key", other)),
        }
    }

    fn from_primitive(&self, type_id: &CustomTypeId, datum: &Datum) -> Result<CustomValue, Error> {
        let text = expect_string(type_id, datum)?;
        let key = match KeyKind::from_type_id(type_id) {
            Some(kind) => OpaqueKey::parse(kind, text)?,
            None => text.parse::<OpaqueKey>()?,
        };
        Ok(CustomValue::Key(key))
    }
}

/// Codec for caller-defined scalars that travel as plain strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl CustomCodec for TextCodec {
    fn leaf_type(&self) -> PrimitiveKind {
        PrimitiveKind::String
    }

    fn to_primitive(&self, value: &CustomValue) -> Result<Datum, Error> {
        match value {
            CustomValue::Extension { repr, .. } => Ok(Datum::String(repr.clone())),
            other => Err(mismatch("text", other)),
        }
    }

    fn from_primitive(&self, type_id: &CustomTypeId, datum: &Datum) -> Result<CustomValue, Error> {
        let text = expect_string(type_id, datum)?;
        Ok(CustomValue::Extension {
            type_id: type_id.clone(),
            repr: text.to_string(),
        })
    }
}

/// Maps custom type ids to their codecs.
#[derive(Clone)]
pub struct CustomTypeRegistry {
    codecs: HashMap<CustomTypeId, Arc<dyn CustomCodec>>,
}

impl CustomTypeRegistry {
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// The registry with the built-in timestamp, UUID and opaque key codecs.
    pub fn with_defaults() -> Self {
        Self::empty()
            .with(TIMESTAMP, TimestampCodec)
            .with(UUID, UuidCodec)
            .with(OPAQUE_KEY, OpaqueKeyCodec)
    }

    pub fn with(mut self, id: impl Into<CustomTypeId>, codec: impl CustomCodec + 'static) -> Self {
        self.register(id, Arc::new(codec));
        self
    }

    pub fn register(&mut self, id: impl Into<CustomTypeId>, codec: Arc<dyn CustomCodec>) {
        self.codecs.insert(id.into(), codec);
    }

    /// Returns a registry where every entry of `other` replaces ours.
    pub fn overlay(mut self, other: &CustomTypeRegistry) -> Self {
        for (id, codec) in &other.codecs {
            self.codecs.insert(id.clone(), Arc::clone(codec));
        }
        self
    }

    /// Finds the codec for `id`, falling back to the nearest registered ancestor.
    pub fn lookup(&self, id: &CustomTypeId) -> Option<&Arc<dyn CustomCodec>> {
        id.lineage().find_map(|candidate| self.codecs.get(&candidate))
    }

    pub fn leaf_type(&self, id: &CustomTypeId) -> Option<PrimitiveKind> {
        self.lookup(id).map(|codec| codec.leaf_type())
    }

    pub fn to_primitive(&self, value: &CustomValue) -> Result<Datum, Error> {
        let id = value.custom_type();
        let codec = self
            .lookup(&id)
            .ok_or_else(|| Error::encode(format!("no codec registered for custom type '{id}'")))?;
        codec.to_primitive(value)
    }

    pub fn from_primitive(&self, id: &CustomTypeId, datum: &Datum) -> Result<CustomValue, Error> {
        let codec = self
            .lookup(id)
            .ok_or_else(|| Error::decode(format!("no codec registered for custom type '{id}'")))?;
        codec.from_primitive(id, datum)
    }
}

impl Default for CustomTypeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for CustomTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.codecs.keys().map(CustomTypeId::as_str).collect();
        ids.sort_unstable();
        f.debug_struct("CustomTypeRegistry").field("codecs", &ids).finish()
    }
}

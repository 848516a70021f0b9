use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Utc};
use uuid::Uuid;

use super::PrimitiveKind;
use crate::custom::{CustomValue, OpaqueKey};

/// A typed event value, as built by producers and rebuilt by consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Long(i64),
    Double(f64),
    Bytes(Vec<u8>),
    String(String),
    Record(RecordValue),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Custom(CustomValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub(crate) fn primitive_kind(&self) -> Option<PrimitiveKind> {
        match self {
            Value::Bool(_) => Some(PrimitiveKind::Bool),
            Value::Long(_) => Some(PrimitiveKind::Long),
            Value::Double(_) => Some(PrimitiveKind::Double),
            Value::Bytes(_) => Some(PrimitiveKind::Bytes),
            Value::String(_) => Some(PrimitiveKind::String),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Long(_) => "long",
            Value::Double(_) => "double",
            Value::Bytes(_) => "bytes",
            Value::String(_) => "string",
            Value::Record(_) => "record",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Custom(_) => "custom",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Long(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<RecordValue> for Value {
    fn from(v: RecordValue) -> Self {
        Value::Record(v)
    }
}

impl From<CustomValue> for Value {
    fn from(v: CustomValue) -> Self {
        Value::Custom(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Custom(CustomValue::Uuid(v))
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(v: DateTime<FixedOffset>) -> Self {
        Value::Custom(CustomValue::Timestamp(v))
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Custom(CustomValue::Timestamp(v.fixed_offset()))
    }
}

impl From<OpaqueKey> for Value {
    fn from(v: OpaqueKey) -> Self {
        Value::Custom(CustomValue::Key(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

/// An instance of a [`RecordType`](super::RecordType): its name plus field values
/// in insertion order.
///
/// Equality ignores field order and treats an absent field as null, so a record
/// rebuilt from the wire compares equal to the one that was sent.
#[derive(Debug, Clone)]
pub struct RecordValue {
    name: String,
    fields: Vec<(String, Value)>,
}

impl RecordValue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Sets a field, replacing an earlier value of the same name in place.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        let field = field.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| *name == field) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((field, value)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }
}

impl PartialEq for RecordValue {
    fn eq(&self, other: &Self) -> bool {
        let covers = |a: &RecordValue, b: &RecordValue| {
            a.fields
                .iter()
                .all(|(name, value)| b.get(name).unwrap_or(&Value::Null) == value)
        };
        self.name == other.name && covers(self, other) && covers(other, self)
    }
}

/// The keyword arguments of one emission: parameter name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventData(BTreeMap<String, Value>);

impl EventData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for EventData {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for EventData {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_fields_keep_insertion_order_and_replace_in_place() {
        let record = RecordValue::new("R")
            .with("b", 1_i64)
            .with("a", 2_i64)
            .with("b", 3_i64);
        let names: Vec<_> = record.fields().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(record.get("b"), Some(&Value::Long(3)));
    }

    #[test]
    fn record_equality_ignores_order_and_absent_nulls() {
        let sent = RecordValue::new("R").with("b", 1_i64).with("a", "x");
        let rebuilt = RecordValue::new("R")
            .with("a", "x")
            .with("b", 1_i64)
            .with("c", Value::Null);
        assert_eq!(sent, rebuilt);
        assert_ne!(sent, rebuilt.with("c", 2_i64));
    }

    #[test]
    fn options_map_to_null() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::String("x".to_string()));
    }
}

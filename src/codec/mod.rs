//! Conversion between typed event values and the primitive tree.
//!
//! Serialization walks a [`Value`] alongside its declared [`DataType`], so record
//! fields come out in declaration order and absent nullable fields come out as
//! null. Custom scalars go through the [`CustomTypeRegistry`].
//!
//! Deserialization is the inverse. Absent or null fields that declare a default
//! get the default back; absent required fields are an error, as are primitives
//! of the wrong kind and custom types with no codec.

use std::collections::BTreeMap;

use crate::custom::CustomTypeRegistry;
use crate::error::Error;
use crate::event::EventSignal;
use crate::types::{
    DataType, Datum, EventData, FieldDefault, PrimitiveKind, RecordScope, RecordType, RecordValue,
    Value,
};

/// Serializer and deserializer for event values, bound to a codec registry.
#[derive(Debug, Clone, Default)]
pub struct ValueCodec {
    registry: CustomTypeRegistry,
}

impl ValueCodec {
    /// A codec using the default custom types, overlaid with `extra`.
    pub fn new(extra: Option<&CustomTypeRegistry>) -> Self {
        let registry = match extra {
            Some(extra) => CustomTypeRegistry::with_defaults().overlay(extra),
            None => CustomTypeRegistry::with_defaults(),
        };
        Self { registry }
    }

    pub fn with_registry(registry: CustomTypeRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CustomTypeRegistry {
        &self.registry
    }

    /// Converts the emitted data of a signal into the `CloudEvent` record datum,
    /// one field per declared parameter in declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encode`] when a parameter is missing or does not match its
    /// declared type.
    pub fn serialize_event_data(&self, signal: &EventSignal, data: &EventData) -> Result<Datum, Error> {
        let scope = signal.record_scope();
        let fields = signal
            .init_data()
            .iter()
            .map(|(name, data_type)| {
                let value = data.get(name).ok_or_else(|| {
                    Error::encode(format!(
                        "event data for '{}' has no value for '{name}'",
                        signal.event_type()
                    ))
                })?;
                Ok((name.clone(), self.serialize_in(value, data_type, &scope, name)?))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Datum::Record(fields))
    }

    /// Rebuilds emitted data from a `CloudEvent` record datum.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] when a parameter is missing or cannot be rebuilt.
    pub fn deserialize_event_data(&self, signal: &EventSignal, datum: &Datum) -> Result<EventData, Error> {
        let Datum::Record(_) = datum else {
            return Err(Error::decode(format!(
                "expected a record for '{}', got {}",
                signal.event_type(),
                datum.kind_name()
            )));
        };
        let scope = signal.record_scope();
        let mut data = EventData::new();
        for (name, data_type) in signal.init_data() {
            let value = match datum.get(name) {
                Some(Datum::Null) | None => {
                    return Err(Error::decode(format!(
                        "missing required field '{name}' for '{}'",
                        signal.event_type()
                    )));
                }
                Some(field) => self.deserialize_in(field, data_type, &scope, name)?,
            };
            data.insert(name.clone(), value);
        }
        Ok(data)
    }

    /// Converts one typed value to its primitive tree.
    pub fn serialize(&self, value: &Value, data_type: &DataType) -> Result<Datum, Error> {
        self.serialize_in(value, data_type, &RecordScope::of(data_type), "value")
    }

    /// Rebuilds one typed value from its primitive tree.
    pub fn deserialize(&self, datum: &Datum, data_type: &DataType) -> Result<Value, Error> {
        self.deserialize_in(datum, data_type, &RecordScope::of(data_type), "value")
    }

    /// Converts a value without a descriptor. Record fields keep the value's own
    /// order.
    pub fn to_datum(&self, value: &Value) -> Result<Datum, Error> {
        Ok(match value {
            Value::Null => Datum::Null,
            Value::Bool(b) => Datum::Boolean(*b),
            Value::Long(n) => Datum::Long(*n),
            Value::Double(n) => Datum::Double(*n),
            Value::Bytes(b) => Datum::Bytes(b.clone()),
            Value::String(s) => Datum::String(s.clone()),
            Value::Record(record) => Datum::Record(
                record
                    .fields()
                    .iter()
                    .map(|(name, v)| Ok((name.clone(), self.to_datum(v)?)))
                    .collect::<Result<_, Error>>()?,
            ),
            Value::List(items) => Datum::Array(
                items
                    .iter()
                    .map(|v| self.to_datum(v))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(entries) => Datum::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.to_datum(v)?)))
                    .collect::<Result<_, Error>>()?,
            ),
            Value::Custom(custom) => self.registry.to_primitive(custom)?,
        })
    }

    fn serialize_in(
        &self,
        value: &Value,
        data_type: &DataType,
        scope: &RecordScope,
        path: &str,
    ) -> Result<Datum, Error> {
        let mismatch = || {
            Error::encode(format!(
                "'{path}' should be {}, got {}",
                data_type.type_name(),
                value.kind_name()
            ))
        };

        match (data_type, value) {
            (DataType::Primitive(kind), _) => match (kind, value) {
                (PrimitiveKind::Bool, Value::Bool(b)) => Ok(Datum::Boolean(*b)),
                (PrimitiveKind::Long, Value::Long(n)) => Ok(Datum::Long(*n)),
                (PrimitiveKind::Double, Value::Double(n)) => Ok(Datum::Double(*n)),
                (PrimitiveKind::Bytes, Value::Bytes(b)) => Ok(Datum::Bytes(b.clone())),
                (PrimitiveKind::String, Value::String(s)) => Ok(Datum::String(s.clone())),
                _ => Err(mismatch()),
            },
            (DataType::Record(record), Value::Record(value)) => {
                self.serialize_record(record, value, scope, path)
            }
            (DataType::Named(name), Value::Record(value)) => {
                let record = scope
                    .get(name)
                    .ok_or_else(|| Error::encode(format!("'{path}' refers to undeclared record '{name}'")))?;
                self.serialize_record(record, value, scope, path)
            }
            (DataType::List(item), Value::List(items)) => Ok(Datum::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| match item {
                        Some(item) => self.serialize_in(v, item, scope, &format!("{path}[{i}]")),
                        None => self.to_datum(v),
                    })
                    .collect::<Result<_, _>>()?,
            )),
            (DataType::Map(item), Value::Map(entries)) => Ok(Datum::Map(
                entries
                    .iter()
                    .map(|(k, v)| {
                        let datum = match item {
                            Some(item) => self.serialize_in(v, item, scope, &format!("{path}.{k}"))?,
                            None => self.to_datum(v)?,
                        };
                        Ok((k.clone(), datum))
                    })
                    .collect::<Result<BTreeMap<_, _>, Error>>()?,
            )),
            (DataType::Custom(id), Value::Custom(custom)) if custom.custom_type().is_within(id) => {
                self.registry.to_primitive(custom)
            }
            _ => Err(mismatch()),
        }
    }

    fn serialize_record(
        &self,
        record: &RecordType,
        value: &RecordValue,
        scope: &RecordScope,
        path: &str,
    ) -> Result<Datum, Error> {
        if value.name() != record.name() {
            return Err(Error::encode(format!(
                "'{path}' should be a {} record, got {}",
                record.name(),
                value.name()
            )));
        }
        if let Some((unknown, _)) = value
            .fields()
            .iter()
            .find(|(name, _)| record.field(name).is_none())
        {
            return Err(Error::encode(format!(
                "'{path}' has field '{unknown}' not declared by {}",
                record.name()
            )));
        }

        let fields = record
            .fields()
            .iter()
            .map(|field| {
                let field_path = format!("{path}.{}", field.name());
                let datum = match value.get(field.name()) {
                    None | Some(Value::Null) if !field.is_required() => Datum::Null,
                    None | Some(Value::Null) => {
                        return Err(Error::encode(format!("'{field_path}' is required")));
                    }
                    Some(v) => self.serialize_in(v, field.data_type(), scope, &field_path)?,
                };
                Ok((field.name().to_string(), datum))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Datum::Record(fields))
    }

    fn deserialize_in(
        &self,
        datum: &Datum,
        data_type: &DataType,
        scope: &RecordScope,
        path: &str,
    ) -> Result<Value, Error> {
        let mismatch = || {
            Error::decode(format!(
                "'{path}' should be {}, got {}",
                data_type.type_name(),
                datum.kind_name()
            ))
        };

        match data_type {
            DataType::Primitive(kind) => match (kind, datum) {
                (PrimitiveKind::Bool, Datum::Boolean(b)) => Ok(Value::Bool(*b)),
                (PrimitiveKind::Long, Datum::Long(n)) => Ok(Value::Long(*n)),
                (PrimitiveKind::Double, Datum::Double(n)) => Ok(Value::Double(*n)),
                (PrimitiveKind::Bytes, Datum::Bytes(b)) => Ok(Value::Bytes(b.clone())),
                (PrimitiveKind::String, Datum::String(s)) => Ok(Value::String(s.clone())),
                _ => Err(mismatch()),
            },
            DataType::Record(record) => self.deserialize_record(record, datum, scope, path),
            DataType::Named(name) => {
                let record = scope
                    .get(name)
                    .ok_or_else(|| Error::decode(format!("'{path}' refers to undeclared record '{name}'")))?;
                self.deserialize_record(record, datum, scope, path)
            }
            DataType::List(item) => match datum {
                Datum::Array(items) => Ok(Value::List(
                    items
                        .iter()
                        .enumerate()
                        .map(|(i, d)| match item {
                            Some(item) => self.deserialize_in(d, item, scope, &format!("{path}[{i}]")),
                            None => Ok(untyped(d)),
                        })
                        .collect::<Result<_, _>>()?,
                )),
                _ => Err(mismatch()),
            },
            DataType::Map(item) => match datum {
                Datum::Map(entries) => Ok(Value::Map(
                    entries
                        .iter()
                        .map(|(k, d)| {
                            let value = match item {
                                Some(item) => {
                                    self.deserialize_in(d, item, scope, &format!("{path}.{k}"))?
                                }
                                None => untyped(d),
                            };
                            Ok((k.clone(), value))
                        })
                        .collect::<Result<BTreeMap<_, _>, Error>>()?,
                )),
                _ => Err(mismatch()),
            },
            DataType::Custom(id) => Ok(Value::Custom(self.registry.from_primitive(id, datum)?)),
        }
    }

    fn deserialize_record(
        &self,
        record: &RecordType,
        datum: &Datum,
        scope: &RecordScope,
        path: &str,
    ) -> Result<Value, Error> {
        if !matches!(datum, Datum::Record(_) | Datum::Map(_)) {
            return Err(Error::decode(format!(
                "'{path}' should be a {} record, got {}",
                record.name(),
                datum.kind_name()
            )));
        }

        let mut value = RecordValue::new(record.name());
        for field in record.fields() {
            let field_path = format!("{path}.{}", field.name());
            let field_value = match (datum.get(field.name()), field.default()) {
                (Some(Datum::Null) | None, FieldDefault::Null) => Value::Null,
                (Some(Datum::Null) | None, FieldDefault::Value(default)) => self.deserialize_in(
                    &Datum::from_json(default),
                    field.data_type(),
                    scope,
                    &field_path,
                )?,
                (Some(Datum::Null) | None, FieldDefault::Required) => {
                    return Err(Error::decode(format!(
                        "missing required field '{field_path}'"
                    )));
                }
                (Some(d), _) => self.deserialize_in(d, field.data_type(), scope, &field_path)?,
            };
            value.set(field.name(), field_value);
        }
        Ok(Value::Record(value))
    }
}

/// Structural conversion used for bare containers, which carry no item type.
fn untyped(datum: &Datum) -> Value {
    match datum {
        Datum::Null => Value::Null,
        Datum::Boolean(b) => Value::Bool(*b),
        Datum::Long(n) => Value::Long(*n),
        Datum::Double(n) => Value::Double(*n),
        Datum::Bytes(b) => Value::Bytes(b.clone()),
        Datum::String(s) => Value::String(s.clone()),
        Datum::Array(items) => Value::List(items.iter().map(untyped).collect()),
        Datum::Map(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), untyped(v)))
                .collect(),
        ),
        Datum::Record(fields) => Value::Map(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), untyped(v)))
                .collect(),
        ),
    }
}

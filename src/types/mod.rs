//! Type descriptors for event payloads.
//!
//! A signal declares the shape of each of its parameters with a [`DataType`]. The
//! descriptor is a plain tagged tree: primitives, named records with ordered
//! fields, lists and maps of a declared item type, and custom scalars whose wire
//! form is supplied by a codec in [`crate::custom`].
//!
//! Records are shared behind an [`Arc`], so the same record type can appear in
//! several places of a tree without being copied. A record that refers to itself
//! (or to any record declared earlier in the same tree) does so with
//! [`DataType::Named`].
//!
//! # Examples
//!
//! ```rust
//! use hermes::types::{DataType, RecordType};
//! use hermes::custom;
//!
//! let xblock = RecordType::builder("XBlockData")
//!     .field("usage_key", DataType::custom(custom::USAGE_KEY))
//!     .field("block_type", DataType::string())
//!     .nullable("version", DataType::long())
//!     .build();
//!
//! let data_type = DataType::record(xblock);
//! assert_eq!(data_type.type_name(), "XBlockData");
//! ```

mod datum;
mod value;

pub use datum::Datum;
pub use value::{EventData, RecordValue, Value};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::custom::CustomTypeId;

/// The scalar kinds every wire format understands natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Bool,
    Long,
    Double,
    Bytes,
    String,
}

impl PrimitiveKind {
    /// Name of the matching Avro primitive.
    pub fn schema_name(self) -> &'static str {
        match self {
            PrimitiveKind::Bool => "boolean",
            PrimitiveKind::Long => "long",
            PrimitiveKind::Double => "double",
            PrimitiveKind::Bytes => "bytes",
            PrimitiveKind::String => "string",
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.schema_name())
    }
}

/// Describes the type of one event parameter or record field.
#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    Primitive(PrimitiveKind),
    Record(Arc<RecordType>),
    /// A list whose items all have the given type. `None` is a bare list, which
    /// schema derivation rejects.
    List(Option<Box<DataType>>),
    /// A map from string keys to values of the given type. `None` is a bare map.
    Map(Option<Box<DataType>>),
    Custom(CustomTypeId),
    /// Reference to a record declared elsewhere in the same tree.
    Named(String),
}

impl DataType {
    pub fn bool() -> Self {
        Self::Primitive(PrimitiveKind::Bool)
    }

    pub fn long() -> Self {
        Self::Primitive(PrimitiveKind::Long)
    }

    pub fn double() -> Self {
        Self::Primitive(PrimitiveKind::Double)
    }

    pub fn bytes() -> Self {
        Self::Primitive(PrimitiveKind::Bytes)
    }

    pub fn string() -> Self {
        Self::Primitive(PrimitiveKind::String)
    }

    pub fn record(record: impl Into<Arc<RecordType>>) -> Self {
        Self::Record(record.into())
    }

    pub fn list_of(item: DataType) -> Self {
        Self::List(Some(Box::new(item)))
    }

    pub fn map_of(value: DataType) -> Self {
        Self::Map(Some(Box::new(value)))
    }

    pub fn bare_list() -> Self {
        Self::List(None)
    }

    pub fn bare_map() -> Self {
        Self::Map(None)
    }

    pub fn custom(id: impl Into<CustomTypeId>) -> Self {
        Self::Custom(id.into())
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    /// Human readable name used in validation messages.
    pub fn type_name(&self) -> String {
        match self {
            DataType::Primitive(kind) => kind.schema_name().to_string(),
            DataType::Record(record) => record.name().to_string(),
            DataType::List(_) => "list".to_string(),
            DataType::Map(_) => "map".to_string(),
            DataType::Custom(id) => id.to_string(),
            DataType::Named(name) => name.clone(),
        }
    }

    /// True when the value is an instance of this type, checked all the way down.
    ///
    /// Nested record fields that are nullable accept [`Value::Null`]; required
    /// fields do not.
    pub fn accepts(&self, value: &Value) -> bool {
        let scope = RecordScope::of(self);
        self.accepts_in(value, &scope)
    }

    pub(crate) fn accepts_in(&self, value: &Value, scope: &RecordScope) -> bool {
        match (self, value) {
            (DataType::Primitive(kind), value) => value.primitive_kind() == Some(*kind),
            (DataType::Record(record), Value::Record(_)) => record.accepts_in(value, scope),
            (DataType::Named(name), Value::Record(_)) => scope
                .get(name)
                .is_some_and(|record| record.accepts_in(value, scope)),
            (DataType::List(item), Value::List(items)) => match item {
                Some(item) => items.iter().all(|v| item.accepts_in(v, scope)),
                None => true,
            },
            (DataType::Map(item), Value::Map(entries)) => match item {
                Some(item) => entries.values().all(|v| item.accepts_in(v, scope)),
                None => true,
            },
            (DataType::Custom(id), Value::Custom(custom)) => custom.custom_type().is_within(id),
            _ => false,
        }
    }

    /// Follows one path segment into a record field or map value.
    pub(crate) fn descend(&self, segment: &str, scope: &RecordScope) -> Option<DataType> {
        match self {
            DataType::Record(record) => record.field(segment).map(|f| f.data_type().clone()),
            DataType::Named(name) => scope
                .get(name)
                .and_then(|record| record.field(segment))
                .map(|f| f.data_type().clone()),
            DataType::Map(Some(value)) => Some((**value).clone()),
            _ => None,
        }
    }

    /// True for types that render as a single scalar on the wire.
    pub fn is_scalar(&self) -> bool {
        matches!(self, DataType::Primitive(_) | DataType::Custom(_))
    }

    fn collect_records(&self, into: &mut HashMap<String, Arc<RecordType>>) {
        match self {
            DataType::Record(record) => {
                if into.contains_key(record.name()) {
                    return;
                }
                into.insert(record.name().to_string(), Arc::clone(record));
                for field in record.fields() {
                    field.data_type().collect_records(into);
                }
            }
            DataType::List(Some(item)) | DataType::Map(Some(item)) => item.collect_records(into),
            _ => {}
        }
    }
}

impl From<RecordType> for DataType {
    fn from(record: RecordType) -> Self {
        DataType::record(record)
    }
}

/// Every record type reachable from a set of descriptors, by name.
///
/// [`DataType::Named`] references are resolved against this table.
#[derive(Debug, Clone, Default)]
pub struct RecordScope {
    records: HashMap<String, Arc<RecordType>>,
}

impl RecordScope {
    pub fn of(data_type: &DataType) -> Self {
        Self::of_all(std::iter::once(data_type))
    }

    pub fn of_all<'a>(types: impl IntoIterator<Item = &'a DataType>) -> Self {
        let mut records = HashMap::new();
        for data_type in types {
            data_type.collect_records(&mut records);
        }
        Self { records }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<RecordType>> {
        self.records.get(name)
    }
}

/// What a record field falls back to when the incoming data omits it.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDefault {
    /// No default: the field must always be present.
    Required,
    /// Nullable; absent values become null.
    Null,
    /// Any other default. Describable, but not representable in a derived schema.
    Value(serde_json::Value),
}

/// One named, typed slot of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    name: String,
    data_type: DataType,
    default: FieldDefault,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, default: FieldDefault) -> Self {
        Self {
            name: name.into(),
            data_type,
            default,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn default(&self) -> &FieldDefault {
        &self.default
    }

    pub fn is_required(&self) -> bool {
        self.default == FieldDefault::Required
    }
}

/// A named record with ordered fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordType {
    name: String,
    fields: Vec<Field>,
}

impl RecordType {
    pub fn builder(name: impl Into<String>) -> RecordTypeBuilder {
        RecordTypeBuilder {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn accepts_in(&self, value: &Value, scope: &RecordScope) -> bool {
        let Value::Record(record) = value else {
            return false;
        };
        if record.name() != self.name {
            return false;
        }
        let known = record
            .fields()
            .iter()
            .all(|(name, _)| self.field(name).is_some());
        known
            && self.fields.iter().all(|field| match record.get(field.name()) {
                None | Some(Value::Null) => !field.is_required(),
                Some(v) => field.data_type().accepts_in(v, scope),
            })
    }
}

pub struct RecordTypeBuilder {
    name: String,
    fields: Vec<Field>,
}

impl RecordTypeBuilder {
    /// Adds a required field.
    pub fn field(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.fields
            .push(Field::new(name, data_type, FieldDefault::Required));
        self
    }

    /// Adds a field that may be null and defaults to null.
    pub fn nullable(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.fields.push(Field::new(name, data_type, FieldDefault::Null));
        self
    }

    /// Adds a field with a non-null default.
    pub fn field_with_default(
        mut self,
        name: impl Into<String>,
        data_type: DataType,
        default: serde_json::Value,
    ) -> Self {
        let default = if default.is_null() {
            FieldDefault::Null
        } else {
            FieldDefault::Value(default)
        };
        self.fields.push(Field::new(name, data_type, default));
        self
    }

    pub fn build(self) -> RecordType {
        RecordType {
            name: self.name,
            fields: self.fields,
        }
    }
}

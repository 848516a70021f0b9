//! Avro schema derivation.
//!
//! [`derive_schema`] turns a signal's init data into the schema its events are
//! written with: a `CloudEvent` record with one field per parameter, in declared
//! order. Nested records are defined the first time they appear and referenced
//! by bare name afterwards, which is also how self-referencing records stay
//! finite. Nullable fields become `["null", T]` unions defaulting to null.
//!
//! The rendered JSON is canonical: object keys are sorted and the output is
//! pretty-printed with two-space indentation, so the same signal always yields
//! byte-identical text.
//!
//! # Examples
//!
//! ```rust
//! use hermes::event::EventSignal;
//! use hermes::schema::derive_schema;
//! use hermes::types::{DataType, RecordType};
//! use hermes::custom::CustomTypeRegistry;
//!
//! let signal = EventSignal::builder("org.example.user.created.v1")
//!     .init_data(
//!         "user",
//!         DataType::record(RecordType::builder("UserData").field("id", DataType::long()).build()),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let schema = derive_schema(&signal, &CustomTypeRegistry::default()).unwrap();
//! assert!(schema.to_canonical_json().unwrap().contains("\"UserData\""));
//! ```

mod derive;
mod parse;

pub use derive::{derive_schema, derive_schema_for};
pub use parse::parse_schema;

use std::collections::HashMap;

use serde_json::{Map, Value as Json};

use crate::error::Error;

pub const CLOUD_EVENT_RECORD: &str = "CloudEvent";
pub const CLOUD_EVENT_DOC: &str = "Avro Event Format for CloudEvents created with hermes/schema";

/// An Avro schema tree, restricted to what this crate derives and reads.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    Null,
    Boolean,
    Long,
    /// Written by other producers only; decoded as four bytes and widened.
    Float,
    Double,
    Bytes,
    String,
    Array(Box<Schema>),
    Map(Box<Schema>),
    Union(Vec<Schema>),
    Record(RecordSchema),
    /// Reference to a record defined earlier in the same schema.
    Named(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordSchema {
    pub name: String,
    pub namespace: Option<String>,
    pub doc: Option<String>,
    pub fields: Vec<SchemaField>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaField {
    pub name: String,
    pub schema: Schema,
    /// `Some(Json::Null)` is a null default; `None` means the field is required.
    pub default: Option<Json>,
}

impl RecordSchema {
    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

impl Schema {
    pub fn as_record(&self) -> Option<&RecordSchema> {
        match self {
            Schema::Record(record) => Some(record),
            _ => None,
        }
    }

    /// The JSON form of this schema with every object's keys in sorted order.
    pub fn to_json(&self) -> Json {
        match self {
            Schema::Null => Json::from("null"),
            Schema::Boolean => Json::from("boolean"),
            Schema::Long => Json::from("long"),
            Schema::Float => Json::from("float"),
            Schema::Double => Json::from("double"),
            Schema::Bytes => Json::from("bytes"),
            Schema::String => Json::from("string"),
            Schema::Array(items) => sorted_object(vec![
                ("type", Json::from("array")),
                ("items", items.to_json()),
            ]),
            Schema::Map(values) => sorted_object(vec![
                ("type", Json::from("map")),
                ("values", values.to_json()),
            ]),
            Schema::Union(branches) => Json::Array(branches.iter().map(Schema::to_json).collect()),
            Schema::Record(record) => {
                let fields = record
                    .fields
                    .iter()
                    .map(|field| {
                        let mut entries = vec![
                            ("name", Json::from(field.name.clone())),
                            ("type", field.schema.to_json()),
                        ];
                        if let Some(default) = &field.default {
                            entries.push(("default", default.clone()));
                        }
                        sorted_object(entries)
                    })
                    .collect();
                let mut entries = vec![
                    ("name", Json::from(record.name.clone())),
                    ("type", Json::from("record")),
                    ("fields", Json::Array(fields)),
                ];
                if let Some(namespace) = &record.namespace {
                    entries.push(("namespace", Json::from(namespace.clone())));
                }
                if let Some(doc) = &record.doc {
                    entries.push(("doc", Json::from(doc.clone())));
                }
                sorted_object(entries)
            }
            Schema::Named(name) => Json::from(name.clone()),
        }
    }

    /// Sorted keys, two-space indentation.
    pub fn to_canonical_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(&self.to_json())?)
    }

    /// Sorted keys, no whitespace. Used inside container headers.
    pub fn to_compact_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(&self.to_json())?)
    }

    /// Every record defined in this schema, by name.
    pub fn named_records(&self) -> HashMap<String, RecordSchema> {
        let mut names = HashMap::new();
        self.collect_records(&mut names);
        names
    }

    fn collect_records(&self, into: &mut HashMap<String, RecordSchema>) {
        match self {
            Schema::Record(record) => {
                if into.contains_key(&record.name) {
                    return;
                }
                into.insert(record.name.clone(), record.clone());
                for field in &record.fields {
                    field.schema.collect_records(into);
                }
            }
            Schema::Array(inner) | Schema::Map(inner) => inner.collect_records(into),
            Schema::Union(branches) => branches.iter().for_each(|b| b.collect_records(into)),
            _ => {}
        }
    }
}

/// Inserts entries in key order, independent of how `serde_json::Map` orders keys.
fn sorted_object(mut entries: Vec<(&str, Json)>) -> Json {
    entries.sort_by(|a, b| a.0.cmp(b.0));
    let mut map = Map::new();
    for (key, value) in entries {
        map.insert(key.to_string(), value);
    }
    Json::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_json_has_sorted_keys_and_ordered_fields() {
        let schema = Schema::Record(RecordSchema {
            name: "CloudEvent".to_string(),
            namespace: Some("org.example.thing.v1".to_string()),
            doc: None,
            fields: vec![
                SchemaField {
                    name: "zeta".to_string(),
                    schema: Schema::String,
                    default: None,
                },
                SchemaField {
                    name: "alpha".to_string(),
                    schema: Schema::Union(vec![Schema::Null, Schema::Long]),
                    default: Some(Json::Null),
                },
            ],
        });
        let text = schema.to_compact_json().unwrap();
        assert_eq!(
            text,
            r#"{"fields":[{"name":"zeta","type":"string"},{"default":null,"name":"alpha","type":["null","long"]}],"name":"CloudEvent","namespace":"org.example.thing.v1","type":"record"}"#
        );
    }

    #[test]
    fn named_records_collects_nested_definitions_once() {
        let inner = Schema::Record(RecordSchema {
            name: "Inner".to_string(),
            namespace: None,
            doc: None,
            fields: vec![],
        });
        let outer = Schema::Record(RecordSchema {
            name: "Outer".to_string(),
            namespace: None,
            doc: None,
            fields: vec![
                SchemaField {
                    name: "a".to_string(),
                    schema: inner,
                    default: None,
                },
                SchemaField {
                    name: "b".to_string(),
                    schema: Schema::Array(Box::new(Schema::Named("Inner".to_string()))),
                    default: None,
                },
            ],
        });
        let names = outer.named_records();
        assert_eq!(names.len(), 2);
        assert!(names.contains_key("Inner"));
    }
}

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value as Json;

use super::{CLOUD_EVENT_DOC, CLOUD_EVENT_RECORD, RecordSchema, Schema, SchemaField};
use crate::custom::CustomTypeRegistry;
use crate::error::Error;
use crate::event::EventSignal;
use crate::types::{DataType, FieldDefault, PrimitiveKind, RecordScope, RecordType};

/// Derives the `CloudEvent` schema for a signal.
///
/// # Errors
///
/// Returns [`Error::UnsupportedType`] for bare lists or maps, custom types with no
/// registered codec, non-null defaults, duplicate field names, and references to
/// records that are not declared anywhere in the signal's init data.
pub fn derive_schema(signal: &EventSignal, registry: &CustomTypeRegistry) -> Result<Schema, Error> {
    derive_schema_for(signal.event_type().as_ref(), signal.init_data(), registry)
}

/// Derives a `CloudEvent` schema from raw parameters, with `namespace` as the
/// record namespace.
pub fn derive_schema_for(
    namespace: &str,
    params: &[(String, DataType)],
    registry: &CustomTypeRegistry,
) -> Result<Schema, Error> {
    let mut deriver = Deriver {
        registry,
        scope: RecordScope::of_all(params.iter().map(|(_, data_type)| data_type)),
        emitted: HashSet::new(),
    };

    let fields = params
        .iter()
        .map(|(name, data_type)| deriver.field(name, data_type, &FieldDefault::Required))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Schema::Record(RecordSchema {
        name: CLOUD_EVENT_RECORD.to_string(),
        namespace: Some(namespace.to_string()),
        doc: Some(CLOUD_EVENT_DOC.to_string()),
        fields,
    }))
}

struct Deriver<'a> {
    registry: &'a CustomTypeRegistry,
    scope: RecordScope,
    emitted: HashSet<String>,
}

impl Deriver<'_> {
    fn field(
        &mut self,
        name: &str,
        data_type: &DataType,
        default: &FieldDefault,
    ) -> Result<SchemaField, Error> {
        let schema = self.type_of(data_type)?;
        match default {
            FieldDefault::Required => Ok(SchemaField {
                name: name.to_string(),
                schema,
                default: None,
            }),
            FieldDefault::Null => Ok(SchemaField {
                name: name.to_string(),
                schema: Schema::Union(vec![Schema::Null, schema]),
                default: Some(Json::Null),
            }),
            FieldDefault::Value(value) => Err(Error::unsupported_type(format!(
                "field '{name}' declares default {value}; only null defaults are supported"
            ))),
        }
    }

    fn type_of(&mut self, data_type: &DataType) -> Result<Schema, Error> {
        match data_type {
            DataType::Custom(id) => self
                .registry
                .leaf_type(id)
                .map(primitive)
                .ok_or_else(|| {
                    Error::unsupported_type(format!("no codec registered for custom type '{id}'"))
                }),
            DataType::Primitive(kind) => Ok(primitive(*kind)),
            DataType::List(Some(item)) => Ok(Schema::Array(Box::new(self.type_of(item)?))),
            DataType::List(None) => Err(Error::unsupported_type(
                "list fields must declare their item type",
            )),
            DataType::Map(Some(value)) => Ok(Schema::Map(Box::new(self.type_of(value)?))),
            DataType::Map(None) => Err(Error::unsupported_type(
                "map fields must declare their value type",
            )),
            DataType::Record(record) => self.record(record),
            DataType::Named(name) => {
                if self.emitted.contains(name) {
                    return Ok(Schema::Named(name.clone()));
                }
                let record = self.scope.get(name).cloned().ok_or_else(|| {
                    Error::unsupported_type(format!("reference to undeclared record '{name}'"))
                })?;
                self.record(&record)
            }
        }
    }

    fn record(&mut self, record: &Arc<RecordType>) -> Result<Schema, Error> {
        let name = record.name();
        if name == CLOUD_EVENT_RECORD {
            return Err(Error::unsupported_type(format!(
                "record name '{CLOUD_EVENT_RECORD}' is reserved for the event envelope"
            )));
        }
        if self.emitted.contains(name) {
            return Ok(Schema::Named(name.to_string()));
        }
        self.emitted.insert(name.to_string());

        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(record.fields().len());
        for field in record.fields() {
            if !seen.insert(field.name()) {
                return Err(Error::unsupported_type(format!(
                    "record '{name}' declares field '{}' twice",
                    field.name()
                )));
            }
            fields.push(self.field(field.name(), field.data_type(), field.default())?);
        }

        Ok(Schema::Record(RecordSchema {
            name: name.to_string(),
            namespace: None,
            doc: None,
            fields,
        }))
    }
}

fn primitive(kind: PrimitiveKind) -> Schema {
    match kind {
        PrimitiveKind::Bool => Schema::Boolean,
        PrimitiveKind::Long => Schema::Long,
        PrimitiveKind::Double => Schema::Double,
        PrimitiveKind::Bytes => Schema::Bytes,
        PrimitiveKind::String => Schema::String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom;
    use serde_json::json;

    fn params(items: Vec<(&str, DataType)>) -> Vec<(String, DataType)> {
        items
            .into_iter()
            .map(|(name, data_type)| (name.to_string(), data_type))
            .collect()
    }

    fn derive(items: Vec<(&str, DataType)>) -> Result<Schema, Error> {
        derive_schema_for(
            "org.example.test.v1",
            &params(items),
            &CustomTypeRegistry::with_defaults(),
        )
    }

    #[test]
    fn simple_record_keeps_primitive_field_order() {
        let data = RecordType::builder("SimpleAttrs")
            .field("boolean_field", DataType::bool())
            .field("int_field", DataType::long())
            .field("float_field", DataType::double())
            .field("bytes_field", DataType::bytes())
            .field("string_field", DataType::string())
            .build();
        let schema = derive(vec![("data", DataType::record(data))]).unwrap();

        assert_eq!(
            schema.to_json(),
            json!({
                "name": "CloudEvent",
                "type": "record",
                "doc": CLOUD_EVENT_DOC,
                "namespace": "org.example.test.v1",
                "fields": [{
                    "name": "data",
                    "type": {
                        "name": "SimpleAttrs",
                        "type": "record",
                        "fields": [
                            {"name": "boolean_field", "type": "boolean"},
                            {"name": "int_field", "type": "long"},
                            {"name": "float_field", "type": "double"},
                            {"name": "bytes_field", "type": "bytes"},
                            {"name": "string_field", "type": "string"},
                        ]
                    }
                }]
            })
        );
    }

    #[test]
    fn nullable_fields_become_null_unions_with_null_default() {
        let data = RecordType::builder("Optional")
            .nullable("count", DataType::long())
            .nullable("label", DataType::string())
            .build();
        let schema = derive(vec![("data", DataType::record(data))]).unwrap();
        let json = schema.to_json();
        let fields = &json["fields"][0]["type"]["fields"];
        assert_eq!(
            fields[0],
            json!({"name": "count", "type": ["null", "long"], "default": null})
        );
        assert_eq!(
            fields[1],
            json!({"name": "label", "type": ["null", "string"], "default": null})
        );
    }

    #[test]
    fn non_null_defaults_are_unsupported() {
        let data = RecordType::builder("Defaults")
            .field_with_default("count", DataType::long(), json!(1))
            .build();
        let err = derive(vec![("data", DataType::record(data))]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedType { .. }));
    }

    #[test]
    fn bare_containers_are_unsupported() {
        assert!(matches!(
            derive(vec![("items", DataType::bare_list())]),
            Err(Error::UnsupportedType { .. })
        ));
        assert!(matches!(
            derive(vec![("labels", DataType::bare_map())]),
            Err(Error::UnsupportedType { .. })
        ));
    }

    #[test]
    fn containers_recurse_into_their_item_types() {
        let schema = derive(vec![
            ("tags", DataType::list_of(DataType::string())),
            ("scores", DataType::map_of(DataType::list_of(DataType::double()))),
        ])
        .unwrap();
        let json = schema.to_json();
        assert_eq!(json["fields"][0]["type"], json!({"type": "array", "items": "string"}));
        assert_eq!(
            json["fields"][1]["type"],
            json!({"type": "map", "values": {"type": "array", "items": "double"}})
        );
    }

    #[test]
    fn custom_types_use_their_codec_leaf_and_unknown_ones_fail() {
        let schema = derive(vec![
            ("when", DataType::custom(custom::TIMESTAMP)),
            ("block", DataType::custom(custom::USAGE_KEY)),
        ])
        .unwrap();
        let json = schema.to_json();
        assert_eq!(json["fields"][0]["type"], json!("string"));
        assert_eq!(json["fields"][1]["type"], json!("string"));

        assert!(matches!(
            derive(vec![("money", DataType::custom("currency"))]),
            Err(Error::UnsupportedType { .. })
        ));
    }

    #[test]
    fn repeated_records_are_defined_once_then_referenced() {
        let user = Arc::new(
            RecordType::builder("UserData")
                .field("id", DataType::long())
                .build(),
        );
        let enrollment = RecordType::builder("Enrollment")
            .field("user", DataType::Record(Arc::clone(&user)))
            .nullable("created_by", DataType::Record(Arc::clone(&user)))
            .build();
        let schema = derive(vec![("enrollment", DataType::record(enrollment))]).unwrap();
        let json = schema.to_json();
        let fields = &json["fields"][0]["type"]["fields"];
        assert_eq!(fields[0]["type"]["name"], json!("UserData"));
        assert_eq!(fields[1]["type"], json!(["null", "UserData"]));
    }

    #[test]
    fn self_referencing_records_terminate() {
        let node = RecordType::builder("TreeNode")
            .field("label", DataType::string())
            .field("children", DataType::list_of(DataType::named("TreeNode")))
            .build();
        let schema = derive(vec![("root", DataType::record(node))]).unwrap();
        let json = schema.to_json();
        assert_eq!(
            json["fields"][0]["type"]["fields"][1]["type"],
            json!({"type": "array", "items": "TreeNode"})
        );
    }

    #[test]
    fn undeclared_references_fail() {
        assert!(matches!(
            derive(vec![("ghost", DataType::named("Ghost"))]),
            Err(Error::UnsupportedType { .. })
        ));
    }

    #[test]
    fn reordering_record_fields_changes_the_schema() {
        let ab = RecordType::builder("Pair")
            .field("a", DataType::long())
            .field("b", DataType::long())
            .build();
        let ba = RecordType::builder("Pair")
            .field("b", DataType::long())
            .field("a", DataType::long())
            .build();
        let first = derive(vec![("pair", DataType::record(ab))]).unwrap();
        let second = derive(vec![("pair", DataType::record(ba))]).unwrap();
        assert_ne!(
            first.to_canonical_json().unwrap(),
            second.to_canonical_json().unwrap()
        );
    }

    #[test]
    fn every_catalog_signal_derives_the_same_schema_twice() {
        let registry = crate::catalog::registry().unwrap();
        let custom = CustomTypeRegistry::with_defaults();
        for signal in registry.iter() {
            if crate::catalog::is_unserializable(signal.event_type().as_ref()) {
                continue;
            }
            let first = derive_schema(signal, &custom).unwrap();
            let second = derive_schema(signal, &custom).unwrap();
            assert_eq!(
                first.to_canonical_json().unwrap(),
                second.to_canonical_json().unwrap(),
                "{}",
                signal.event_type()
            );
        }
    }
}

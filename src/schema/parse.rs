use std::collections::HashSet;

use serde_json::Value as Json;

use super::{RecordSchema, Schema, SchemaField};
use crate::error::Error;

/// Parses schema JSON, as found in a container header, back into a [`Schema`].
///
/// `int` is read as `long`; `float` keeps its four-byte encoding and is widened
/// to a double when decoded. Enums, fixed types and
/// logical types are not supported.
pub fn parse_schema(json: &Json) -> Result<Schema, Error> {
    Parser::default().parse(json)
}

#[derive(Default)]
struct Parser {
    defined: HashSet<String>,
}

impl Parser {
    fn parse(&mut self, json: &Json) -> Result<Schema, Error> {
        match json {
            Json::String(name) => self.named(name),
            Json::Array(branches) => Ok(Schema::Union(
                branches
                    .iter()
                    .map(|branch| self.parse(branch))
                    .collect::<Result<_, _>>()?,
            )),
            Json::Object(object) => {
                let kind = object
                    .get("type")
                    .ok_or_else(|| Error::decode("schema object without a 'type'"))?;
                match kind.as_str() {
                    Some("record") => self.record(json),
                    Some("array") => {
                        let items = object
                            .get("items")
                            .ok_or_else(|| Error::decode("array schema without 'items'"))?;
                        Ok(Schema::Array(Box::new(self.parse(items)?)))
                    }
                    Some("map") => {
                        let values = object
                            .get("values")
                            .ok_or_else(|| Error::decode("map schema without 'values'"))?;
                        Ok(Schema::Map(Box::new(self.parse(values)?)))
                    }
                    _ => self.parse(kind),
                }
            }
            other => Err(Error::decode(format!("unexpected schema JSON: {other}"))),
        }
    }

    fn named(&self, name: &str) -> Result<Schema, Error> {
        match name {
            "null" => Ok(Schema::Null),
            "boolean" => Ok(Schema::Boolean),
            "int" | "long" => Ok(Schema::Long),
            "float" => Ok(Schema::Float),
            "double" => Ok(Schema::Double),
            "bytes" => Ok(Schema::Bytes),
            "string" => Ok(Schema::String),
            other => {
                let short = other.rsplit('.').next().unwrap_or(other);
                if self.defined.contains(short) {
                    Ok(Schema::Named(short.to_string()))
                } else {
                    Err(Error::unsupported_type(format!("unknown schema type '{other}'")))
                }
            }
        }
    }

    fn record(&mut self, json: &Json) -> Result<Schema, Error> {
        let name = json
            .get("name")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::decode("record schema without a 'name'"))?
            .to_string();
        self.defined.insert(name.clone());

        let fields = json
            .get("fields")
            .and_then(Json::as_array)
            .ok_or_else(|| Error::decode(format!("record '{name}' without 'fields'")))?
            .iter()
            .map(|field| {
                let field_name = field
                    .get("name")
                    .and_then(Json::as_str)
                    .ok_or_else(|| Error::decode(format!("field of record '{name}' without a name")))?;
                let field_type = field
                    .get("type")
                    .ok_or_else(|| Error::decode(format!("field '{field_name}' without a type")))?;
                Ok(SchemaField {
                    name: field_name.to_string(),
                    schema: self.parse(field_type)?,
                    default: field.get("default").cloned(),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Schema::Record(RecordSchema {
            name,
            namespace: json.get("namespace").and_then(Json::as_str).map(str::to_string),
            doc: json.get("doc").and_then(Json::as_str).map(str::to_string),
            fields,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_what_derivation_renders() {
        let json = json!({
            "name": "CloudEvent",
            "type": "record",
            "namespace": "org.example.v1",
            "fields": [
                {"name": "node", "type": {
                    "name": "Node",
                    "type": "record",
                    "fields": [
                        {"name": "label", "type": ["null", "string"], "default": null},
                        {"name": "children", "type": {"type": "array", "items": "Node"}},
                        {"name": "weights", "type": {"type": "map", "values": "int"}}
                    ]
                }}
            ]
        });
        let schema = parse_schema(&json).unwrap();
        assert_eq!(schema.to_json()["fields"][0]["type"]["fields"][2]["type"]["values"], json!("long"));
        assert_eq!(schema.to_json()["fields"][0]["type"]["fields"][1]["type"]["items"], json!("Node"));
    }

    #[test]
    fn floats_stay_distinct_from_doubles() {
        assert_eq!(parse_schema(&json!("float")).unwrap(), Schema::Float);
        assert_eq!(parse_schema(&json!("double")).unwrap(), Schema::Double);
        assert_eq!(Schema::Float.to_json(), json!("float"));
    }

    #[test]
    fn unknown_type_names_are_rejected() {
        assert!(parse_schema(&json!("Mystery")).is_err());
        assert!(parse_schema(&json!({"type": "enum", "name": "E", "symbols": []})).is_err());
    }
}

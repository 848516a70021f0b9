use std::collections::HashMap;

use crate::error::Error;
use crate::schema::{RecordSchema, Schema};
use crate::types::Datum;

/// Reshapes a datum decoded with the writer's schema into the reader's schema.
///
/// Record fields are matched by name. Writer fields the reader does not know
/// are dropped; reader fields the writer did not send take the reader's
/// default, and are an error when the reader declares none. Longs promote to
/// doubles, and strings and bytes convert into each other. For a reader union
/// the null branch takes nulls, otherwise the first branch that resolves wins.
pub fn resolve(datum: Datum, reader: &Schema) -> Result<Datum, Error> {
    Resolver {
        names: reader.named_records(),
    }
    .resolve(datum, reader)
}

struct Resolver {
    names: HashMap<String, RecordSchema>,
}

impl Resolver {
    fn resolve(&self, datum: Datum, reader: &Schema) -> Result<Datum, Error> {
        match (reader, datum) {
            (Schema::Null, Datum::Null) => Ok(Datum::Null),
            (Schema::Boolean, d @ Datum::Boolean(_)) => Ok(d),
            (Schema::Long, d @ Datum::Long(_)) => Ok(d),
            (Schema::Double | Schema::Float, d @ Datum::Double(_)) => Ok(d),
            (Schema::Double | Schema::Float, Datum::Long(n)) => Ok(Datum::Double(n as f64)),
            (Schema::Bytes, d @ Datum::Bytes(_)) => Ok(d),
            (Schema::Bytes, Datum::String(s)) => Ok(Datum::Bytes(s.into_bytes())),
            (Schema::String, d @ Datum::String(_)) => Ok(d),
            (Schema::String, Datum::Bytes(b)) => String::from_utf8(b)
                .map(Datum::String)
                .map_err(|e| Error::decode(format!("bytes are not valid utf-8: {e}"))),
            (Schema::Array(items), Datum::Array(values)) => Ok(Datum::Array(
                values
                    .into_iter()
                    .map(|v| self.resolve(v, items))
                    .collect::<Result<_, _>>()?,
            )),
            (Schema::Map(values), Datum::Map(entries)) => Ok(Datum::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, self.resolve(v, values)?)))
                    .collect::<Result<_, Error>>()?,
            )),
            (Schema::Union(branches), Datum::Null) if branches.contains(&Schema::Null) => Ok(Datum::Null),
            (Schema::Union(branches), datum) => branches
                .iter()
                .filter(|branch| **branch != Schema::Null)
                .find_map(|branch| self.resolve(datum.clone(), branch).ok())
                .ok_or_else(|| {
                    Error::decode(format!("no reader union branch accepts a {}", datum.kind_name()))
                }),
            (Schema::Record(record), datum) => self.resolve_record(record, datum),
            (Schema::Named(name), datum) => {
                let record = self
                    .names
                    .get(name)
                    .ok_or_else(|| Error::decode(format!("unknown record '{name}'")))?;
                self.resolve_record(record, datum)
            }
            (reader, datum) => Err(Error::decode(format!(
                "writer sent a {} where the reader expects {}",
                datum.kind_name(),
                reader.to_json()
            ))),
        }
    }

    fn resolve_record(&self, record: &RecordSchema, datum: Datum) -> Result<Datum, Error> {
        let mut written = match datum {
            Datum::Record(fields) => fields,
            other => {
                return Err(Error::decode(format!(
                    "writer sent a {} where the reader expects record {}",
                    other.kind_name(),
                    record.name
                )));
            }
        };

        let fields = record
            .fields
            .iter()
            .map(|field| {
                let value = match written.iter().position(|(name, _)| *name == field.name) {
                    Some(index) => written.swap_remove(index).1,
                    None => match &field.default {
                        Some(default) => Datum::from_json(default),
                        None => {
                            return Err(Error::decode(format!(
                                "reader field '{}.{}' has no default and the writer did not send it",
                                record.name, field.name
                            )));
                        }
                    },
                };
                Ok((field.name.clone(), self.resolve(value, &field.schema)?))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Datum::Record(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaField;
    use serde_json::Value as Json;

    fn record(fields: Vec<(&str, Schema, Option<Json>)>) -> Schema {
        Schema::Record(RecordSchema {
            name: "Thing".to_string(),
            namespace: None,
            doc: None,
            fields: fields
                .into_iter()
                .map(|(name, schema, default)| SchemaField {
                    name: name.to_string(),
                    schema,
                    default,
                })
                .collect(),
        })
    }

    #[test]
    fn new_nullable_reader_fields_take_their_default() {
        let reader = record(vec![
            ("id", Schema::Long, None),
            ("note", Schema::Union(vec![Schema::Null, Schema::String]), Some(Json::Null)),
        ]);
        let written = Datum::Record(vec![("id".to_string(), Datum::Long(3))]);
        let resolved = resolve(written, &reader).unwrap();
        assert_eq!(resolved.get("note"), Some(&Datum::Null));
    }

    #[test]
    fn writer_fields_unknown_to_the_reader_are_dropped() {
        let reader = record(vec![("id", Schema::Long, None)]);
        let written = Datum::Record(vec![
            ("extra".to_string(), Datum::String("x".to_string())),
            ("id".to_string(), Datum::Long(3)),
        ]);
        assert_eq!(
            resolve(written, &reader).unwrap(),
            Datum::Record(vec![("id".to_string(), Datum::Long(3))])
        );
    }

    #[test]
    fn missing_field_without_default_fails() {
        let reader = record(vec![("id", Schema::Long, None)]);
        let err = resolve(Datum::Record(vec![]), &reader).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn promotions_apply() {
        assert_eq!(resolve(Datum::Long(2), &Schema::Double).unwrap(), Datum::Double(2.0));
        assert_eq!(
            resolve(Datum::String("ab".to_string()), &Schema::Bytes).unwrap(),
            Datum::Bytes(b"ab".to_vec())
        );
        assert!(resolve(Datum::Double(2.0), &Schema::Long).is_err());
    }

    #[test]
    fn unions_pick_the_first_matching_branch() {
        let reader = Schema::Union(vec![Schema::Null, Schema::Double, Schema::Long]);
        assert_eq!(resolve(Datum::Long(1), &reader).unwrap(), Datum::Double(1.0));
        assert_eq!(resolve(Datum::Null, &reader).unwrap(), Datum::Null);
    }
}

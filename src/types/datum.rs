use std::collections::BTreeMap;

/// The plain primitive tree that sits between typed values and the wire.
///
/// Records keep their fields as ordered `(name, datum)` pairs; the record name
/// lives in the schema, not here.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Boolean(bool),
    Long(i64),
    Double(f64),
    Bytes(Vec<u8>),
    String(String),
    Array(Vec<Datum>),
    Map(BTreeMap<String, Datum>),
    Record(Vec<(String, Datum)>),
}

impl Datum {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Datum::Null => "null",
            Datum::Boolean(_) => "boolean",
            Datum::Long(_) => "long",
            Datum::Double(_) => "double",
            Datum::Bytes(_) => "bytes",
            Datum::String(_) => "string",
            Datum::Array(_) => "array",
            Datum::Map(_) => "map",
            Datum::Record(_) => "record",
        }
    }

    /// Looks up a record field or map entry.
    pub fn get(&self, name: &str) -> Option<&Datum> {
        match self {
            Datum::Record(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, d)| d),
            Datum::Map(entries) => entries.get(name),
            _ => None,
        }
    }

    /// Renders a scalar as a plain string. Containers have no scalar form.
    pub fn scalar_string(&self) -> Option<String> {
        match self {
            Datum::Null => Some("null".to_string()),
            Datum::Boolean(b) => Some(b.to_string()),
            Datum::Long(n) => Some(n.to_string()),
            Datum::Double(n) => Some(n.to_string()),
            Datum::String(s) => Some(s.clone()),
            Datum::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            Datum::Array(_) | Datum::Map(_) | Datum::Record(_) => None,
        }
    }

    /// Builds a datum from a JSON default value.
    pub fn from_json(json: &serde_json::Value) -> Datum {
        match json {
            serde_json::Value::Null => Datum::Null,
            serde_json::Value::Bool(b) => Datum::Boolean(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(long) => Datum::Long(long),
                None => Datum::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Datum::String(s.clone()),
            serde_json::Value::Array(items) => Datum::Array(items.iter().map(Datum::from_json).collect()),
            serde_json::Value::Object(entries) => Datum::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Datum::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// JSON rendering for logs and debugging. Bytes become arrays of numbers.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Datum::Null => serde_json::Value::Null,
            Datum::Boolean(b) => serde_json::Value::Bool(*b),
            Datum::Long(n) => serde_json::Value::from(*n),
            Datum::Double(n) => serde_json::Value::from(*n),
            Datum::Bytes(b) => serde_json::Value::from(b.clone()),
            Datum::String(s) => serde_json::Value::String(s.clone()),
            Datum::Array(items) => items.iter().map(Datum::to_json).collect(),
            Datum::Map(entries) => serde_json::Value::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Datum::Record(fields) => serde_json::Value::Object(
                fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_reads_records_and_maps() {
        let datum = Datum::Record(vec![(
            "labels".to_string(),
            Datum::Map(BTreeMap::from([("a".to_string(), Datum::Long(1))])),
        )]);
        let labels = datum.get("labels").unwrap();
        assert_eq!(labels.get("a"), Some(&Datum::Long(1)));
        assert_eq!(datum.get("nope"), None);
    }

    #[test]
    fn json_defaults_become_datums() {
        assert_eq!(Datum::from_json(&json!(null)), Datum::Null);
        assert_eq!(Datum::from_json(&json!(3)), Datum::Long(3));
        assert_eq!(Datum::from_json(&json!(1.5)), Datum::Double(1.5));
        assert_eq!(Datum::from_json(&json!("x")), Datum::String("x".to_string()));
    }
}

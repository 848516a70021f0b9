use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use super::{Decoder, Encoder, Reader, check_block, write_bytes, write_long};
use crate::error::Error;
use crate::schema::{Schema, parse_schema};
use crate::types::Datum;

const MAGIC: &[u8; 4] = b"Obj\x01";
const SYNC_LEN: usize = 16;
const SCHEMA_KEY: &str = "avro.schema";
const CODEC_KEY: &str = "avro.codec";

/// The contents of an Object Container File: its writer schema and records.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub schema: Schema,
    pub datums: Vec<Datum>,
}

/// Writes `datums` as one block of a null-codec container with a fresh sync marker.
pub fn write_container(schema: &Schema, datums: &[Datum]) -> Result<Bytes, Error> {
    let sync: [u8; SYNC_LEN] = rand::random();
    let schema_json = schema.to_compact_json()?;

    let mut buf = BytesMut::new();
    buf.put_slice(MAGIC);

    write_long(&mut buf, 2);
    write_bytes(&mut buf, CODEC_KEY.as_bytes());
    write_bytes(&mut buf, b"null");
    write_bytes(&mut buf, SCHEMA_KEY.as_bytes());
    write_bytes(&mut buf, schema_json.as_bytes());
    write_long(&mut buf, 0);
    buf.put_slice(&sync);

    if !datums.is_empty() {
        let encoder = Encoder::new(schema);
        let mut block = BytesMut::new();
        for datum in datums {
            encoder.write(schema, datum, &mut block)?;
        }
        write_long(&mut buf, datums.len() as i64);
        write_long(&mut buf, block.len() as i64);
        buf.put_slice(&block);
        buf.put_slice(&sync);
    }

    Ok(buf.freeze())
}

/// Reads a container, decoding every record with the schema from its header.
///
/// # Errors
///
/// [`Error::Decode`] for a bad magic, a codec other than `null`, a missing or
/// unparsable schema, a sync marker mismatch, or truncated blocks.
pub fn read_container(bytes: &[u8]) -> Result<Container, Error> {
    let mut reader = Reader::new(bytes);
    if reader.read_fixed(MAGIC.len())? != MAGIC {
        return Err(Error::decode("not an Avro object container"));
    }

    let mut metadata = BTreeMap::new();
    loop {
        let count = reader.read_block_count()?;
        if count == 0 {
            break;
        }
        for _ in 0..count {
            let key = reader.read_string()?;
            let value = reader.read_bytes()?;
            metadata.insert(key, value);
        }
    }

    match metadata.get(CODEC_KEY) {
        None => {}
        Some(codec) if *codec == b"null" => {}
        Some(codec) => {
            return Err(Error::decode(format!(
                "unsupported container codec '{}'",
                String::from_utf8_lossy(codec)
            )));
        }
    }
    let schema_json = metadata
        .get(SCHEMA_KEY)
        .ok_or_else(|| Error::decode("container header has no schema"))?;
    let schema = parse_schema(&serde_json::from_slice(schema_json)?)?;

    let sync = reader.read_fixed(SYNC_LEN)?;
    let decoder = Decoder::new(&schema);
    let datum_size = decoder.min_size(&schema);
    let mut datums = Vec::new();
    while !reader.is_empty() {
        let count = reader.read_block_count()?;
        let size = usize::try_from(reader.read_long()?)
            .map_err(|_| Error::decode("negative block size"))?;
        let mut block = Reader::new(reader.read_fixed(size)?);
        check_block(count, datum_size, datums.len(), &block)?;
        for _ in 0..count {
            datums.push(decoder.read(&schema, &mut block)?);
        }
        if !block.is_empty() {
            return Err(Error::decode("block size does not match its records"));
        }
        if reader.read_fixed(SYNC_LEN)? != sync {
            return Err(Error::decode("sync marker mismatch"));
        }
    }

    Ok(Container { schema, datums })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RecordSchema, SchemaField};

    fn schema() -> Schema {
        Schema::Record(RecordSchema {
            name: "CloudEvent".to_string(),
            namespace: Some("org.example.thing.v1".to_string()),
            doc: None,
            fields: vec![SchemaField {
                name: "count".to_string(),
                schema: Schema::Long,
                default: None,
            }],
        })
    }

    fn record(n: i64) -> Datum {
        Datum::Record(vec![("count".to_string(), Datum::Long(n))])
    }

    #[test]
    fn container_starts_with_magic_and_carries_its_schema() {
        let bytes = write_container(&schema(), &[record(1), record(2)]).unwrap();
        assert_eq!(&bytes[..4], b"Obj\x01");

        let container = read_container(&bytes).unwrap();
        assert_eq!(container.schema, schema());
        assert_eq!(container.datums, vec![record(1), record(2)]);
    }

    #[test]
    fn sync_markers_differ_between_files() {
        let a = write_container(&schema(), &[record(1)]).unwrap();
        let b = write_container(&schema(), &[record(1)]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn corrupted_sync_marker_is_detected() {
        let mut bytes = write_container(&schema(), &[record(1)]).unwrap().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(read_container(&bytes), Err(Error::Decode { .. })));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(read_container(b"not avro at all").is_err());
        assert!(read_container(b"Obj").is_err());
    }
}

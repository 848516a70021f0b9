//! Avro binary encoding of [`Datum`] trees.
//!
//! Longs are zigzag varints, doubles are little-endian IEEE-754, bytes and
//! strings are length prefixed. Arrays and maps are written as a single block
//! followed by a zero count; readers also accept the negative-count form with a
//! byte size. A union value is its branch index followed by the branch value.
//!
//! Events travel as Object Container Files with the null codec, see
//! [`write_container`] and [`read_container`]. A reader whose schema differs
//! from the writer's goes through [`resolve`].

mod container;
mod resolve;

pub use container::{Container, read_container, write_container};
pub use resolve::resolve;

use std::collections::{BTreeMap, HashMap};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::schema::{RecordSchema, Schema};
use crate::types::Datum;

/// Encodes one datum with `schema`.
pub fn encode_datum(schema: &Schema, datum: &Datum) -> Result<Vec<u8>, Error> {
    let mut buf = BytesMut::new();
    Encoder::new(schema).write(schema, datum, &mut buf)?;
    Ok(buf.to_vec())
}

/// Decodes exactly one datum written with `schema`.
pub fn decode_datum(schema: &Schema, bytes: &[u8]) -> Result<Datum, Error> {
    let mut reader = Reader::new(bytes);
    let datum = Decoder::new(schema).read(schema, &mut reader)?;
    if !reader.is_empty() {
        return Err(Error::decode(format!(
            "{} trailing bytes after datum",
            reader.remaining()
        )));
    }
    Ok(datum)
}

/// Frames a single event datum as a container file.
pub fn encode_event(schema: &Schema, datum: &Datum) -> Result<Bytes, Error> {
    write_container(schema, std::slice::from_ref(datum))
}

/// Reads a single-event container and resolves its datum against `reader`.
pub fn decode_event(bytes: &[u8], reader: &Schema) -> Result<Datum, Error> {
    let container = read_container(bytes)?;
    let mut datums = container.datums.into_iter();
    let datum = datums
        .next()
        .ok_or_else(|| Error::decode("container holds no records"))?;
    if datums.next().is_some() {
        return Err(Error::decode("container holds more than one record"));
    }
    resolve(datum, reader)
}

pub(crate) fn write_long(buf: &mut BytesMut, n: i64) {
    let mut zigzag = ((n << 1) ^ (n >> 63)) as u64;
    while zigzag >= 0x80 {
        buf.put_u8((zigzag as u8 & 0x7f) | 0x80);
        zigzag >>= 7;
    }
    buf.put_u8(zigzag as u8);
}

pub(crate) fn write_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    write_long(buf, bytes.len() as i64);
    buf.put_slice(bytes);
}

/// Cursor over an input buffer. Every read checks the remaining length first.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), Error> {
        if self.buf.remaining() < n {
            return Err(Error::decode(format!(
                "unexpected end of input: needed {n} bytes, {} left",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub(crate) fn read_long(&mut self) -> Result<i64, Error> {
        let mut value = 0_u64;
        for shift in (0..70).step_by(7) {
            self.need(1)?;
            let byte = self.buf.get_u8();
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(((value >> 1) as i64) ^ -((value & 1) as i64));
            }
        }
        Err(Error::decode("varint longer than ten bytes"))
    }

    fn read_len(&mut self) -> Result<usize, Error> {
        let len = self.read_long()?;
        usize::try_from(len).map_err(|_| Error::decode(format!("negative length {len}")))
    }

    pub(crate) fn read_fixed(&mut self, n: usize) -> Result<&'a [u8], Error> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn read_bytes(&mut self) -> Result<&'a [u8], Error> {
        let len = self.read_len()?;
        self.read_fixed(len)
    }

    pub(crate) fn read_string(&mut self) -> Result<String, Error> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::decode(format!("invalid utf-8: {e}")))
    }

    fn read_double(&mut self) -> Result<f64, Error> {
        self.need(8)?;
        Ok(self.buf.get_f64_le())
    }

    fn read_float(&mut self) -> Result<f64, Error> {
        self.need(4)?;
        Ok(f64::from(self.buf.get_f32_le()))
    }

    fn read_bool(&mut self) -> Result<bool, Error> {
        self.need(1)?;
        match self.buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::decode(format!("invalid boolean byte {other}"))),
        }
    }

    /// Item count of the next array or map block; zero ends the sequence.
    pub(crate) fn read_block_count(&mut self) -> Result<usize, Error> {
        let count = self.read_long()?;
        if count < 0 {
            // Negative counts are followed by the block size in bytes.
            self.read_long()?;
        }
        usize::try_from(count.unsigned_abs())
            .map_err(|_| Error::decode(format!("block count {count} out of range")))
    }
}

pub(crate) struct Encoder {
    names: HashMap<String, RecordSchema>,
}

impl Encoder {
    pub(crate) fn new(schema: &Schema) -> Self {
        Self {
            names: schema.named_records(),
        }
    }

    pub(crate) fn write(&self, schema: &Schema, datum: &Datum, buf: &mut BytesMut) -> Result<(), Error> {
        match (schema, datum) {
            (Schema::Null, Datum::Null) => Ok(()),
            (Schema::Boolean, Datum::Boolean(b)) => {
                buf.put_u8(u8::from(*b));
                Ok(())
            }
            (Schema::Long, Datum::Long(n)) => {
                write_long(buf, *n);
                Ok(())
            }
            (Schema::Double, Datum::Double(n)) => {
                buf.put_f64_le(*n);
                Ok(())
            }
            (Schema::Float, Datum::Double(n)) => {
                buf.put_f32_le(*n as f32);
                Ok(())
            }
            (Schema::Bytes, Datum::Bytes(b)) => {
                write_bytes(buf, b);
                Ok(())
            }
            (Schema::String, Datum::String(s)) => {
                write_bytes(buf, s.as_bytes());
                Ok(())
            }
            (Schema::Array(items), Datum::Array(values)) => {
                if !values.is_empty() {
                    write_long(buf, values.len() as i64);
                    for value in values {
                        self.write(items, value, buf)?;
                    }
                }
                write_long(buf, 0);
                Ok(())
            }
            (Schema::Map(values), Datum::Map(entries)) => {
                if !entries.is_empty() {
                    write_long(buf, entries.len() as i64);
                    for (key, value) in entries {
                        write_bytes(buf, key.as_bytes());
                        self.write(values, value, buf)?;
                    }
                }
                write_long(buf, 0);
                Ok(())
            }
            (Schema::Union(branches), datum) => {
                let index = branches
                    .iter()
                    .position(|branch| self.branch_matches(branch, datum))
                    .ok_or_else(|| {
                        Error::encode(format!("no union branch accepts a {}", datum.kind_name()))
                    })?;
                write_long(buf, index as i64);
                self.write(&branches[index], datum, buf)
            }
            (Schema::Record(record), datum) => self.write_record(record, datum, buf),
            (Schema::Named(name), datum) => {
                let record = self
                    .names
                    .get(name)
                    .ok_or_else(|| Error::encode(format!("unknown record '{name}'")))?;
                self.write_record(record, datum, buf)
            }
            (schema, datum) => Err(Error::encode(format!(
                "cannot write a {} as {}",
                datum.kind_name(),
                schema_kind(schema)
            ))),
        }
    }

    fn write_record(&self, record: &RecordSchema, datum: &Datum, buf: &mut BytesMut) -> Result<(), Error> {
        if !matches!(datum, Datum::Record(_) | Datum::Map(_)) {
            return Err(Error::encode(format!(
                "cannot write a {} as record {}",
                datum.kind_name(),
                record.name
            )));
        }
        for field in &record.fields {
            match (datum.get(&field.name), &field.default) {
                (Some(value), _) => self.write(&field.schema, value, buf)?,
                (None, Some(default)) => self.write(&field.schema, &Datum::from_json(default), buf)?,
                (None, None) => {
                    return Err(Error::encode(format!(
                        "record {} is missing field '{}'",
                        record.name, field.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn branch_matches(&self, branch: &Schema, datum: &Datum) -> bool {
        matches!(
            (branch, datum),
            (Schema::Null, Datum::Null)
                | (Schema::Boolean, Datum::Boolean(_))
                | (Schema::Long, Datum::Long(_))
                | (Schema::Double | Schema::Float, Datum::Double(_))
                | (Schema::Bytes, Datum::Bytes(_))
                | (Schema::String, Datum::String(_))
                | (Schema::Array(_), Datum::Array(_))
                | (Schema::Map(_), Datum::Map(_))
                | (Schema::Record(_) | Schema::Named(_), Datum::Record(_))
        )
    }
}

/// Deepest nesting of records, containers and unions a decoder follows.
const MAX_DEPTH: usize = 64;

/// Items a single array or map may hold when its items encode to no bytes.
const MAX_EMPTY_ITEMS: usize = 1 << 16;

pub(crate) struct Decoder {
    names: HashMap<String, RecordSchema>,
}

impl Decoder {
    pub(crate) fn new(schema: &Schema) -> Self {
        Self {
            names: schema.named_records(),
        }
    }

    pub(crate) fn read(&self, schema: &Schema, reader: &mut Reader<'_>) -> Result<Datum, Error> {
        self.read_at(schema, reader, 0)
    }

    fn read_at(&self, schema: &Schema, reader: &mut Reader<'_>, depth: usize) -> Result<Datum, Error> {
        if depth > MAX_DEPTH {
            return Err(Error::decode(format!(
                "schema nests deeper than {MAX_DEPTH} levels"
            )));
        }
        let depth = depth + 1;
        Ok(match schema {
            Schema::Null => Datum::Null,
            Schema::Boolean => Datum::Boolean(reader.read_bool()?),
            Schema::Long => Datum::Long(reader.read_long()?),
            Schema::Float => Datum::Double(reader.read_float()?),
            Schema::Double => Datum::Double(reader.read_double()?),
            Schema::Bytes => Datum::Bytes(reader.read_bytes()?.to_vec()),
            Schema::String => Datum::String(reader.read_string()?),
            Schema::Array(items) => {
                let item_size = self.min_size(items);
                let mut values = Vec::new();
                loop {
                    let count = reader.read_block_count()?;
                    if count == 0 {
                        break;
                    }
                    check_block(count, item_size, values.len(), reader)?;
                    for _ in 0..count {
                        values.push(self.read_at(items, reader, depth)?);
                    }
                }
                Datum::Array(values)
            }
            Schema::Map(values) => {
                // Every entry carries at least its key's length byte.
                let entry_size = self.min_size(values) + 1;
                let mut entries = BTreeMap::new();
                loop {
                    let count = reader.read_block_count()?;
                    if count == 0 {
                        break;
                    }
                    check_block(count, entry_size, entries.len(), reader)?;
                    for _ in 0..count {
                        let key = reader.read_string()?;
                        entries.insert(key, self.read_at(values, reader, depth)?);
                    }
                }
                Datum::Map(entries)
            }
            Schema::Union(branches) => {
                let index = reader.read_long()?;
                let branch = usize::try_from(index)
                    .ok()
                    .and_then(|i| branches.get(i))
                    .ok_or_else(|| Error::decode(format!("union branch {index} out of range")))?;
                self.read_at(branch, reader, depth)?
            }
            Schema::Record(record) => self.read_record(record, reader, depth)?,
            Schema::Named(name) => {
                let record = self
                    .names
                    .get(name)
                    .ok_or_else(|| Error::decode(format!("unknown record '{name}'")))?;
                self.read_record(record, reader, depth)?
            }
        })
    }

    fn read_record(
        &self,
        record: &RecordSchema,
        reader: &mut Reader<'_>,
        depth: usize,
    ) -> Result<Datum, Error> {
        let fields = record
            .fields
            .iter()
            .map(|field| Ok((field.name.clone(), self.read_at(&field.schema, reader, depth)?)))
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Datum::Record(fields))
    }

    /// Fewest bytes one value of `schema` can occupy.
    pub(crate) fn min_size(&self, schema: &Schema) -> usize {
        self.min_size_within(schema, &mut Vec::new())
    }

    fn min_size_within<'s>(&'s self, schema: &'s Schema, open: &mut Vec<&'s str>) -> usize {
        match schema {
            Schema::Null => 0,
            Schema::Boolean | Schema::Long | Schema::Bytes | Schema::String => 1,
            Schema::Array(_) | Schema::Map(_) | Schema::Union(_) => 1,
            Schema::Float => 4,
            Schema::Double => 8,
            Schema::Record(record) => self.record_min_size(record, open),
            Schema::Named(name) => match self.names.get(name) {
                // A record met again while measuring itself adds nothing.
                Some(record) if !open.contains(&name.as_str()) => self.record_min_size(record, open),
                _ => 0,
            },
        }
    }

    fn record_min_size<'s>(&'s self, record: &'s RecordSchema, open: &mut Vec<&'s str>) -> usize {
        open.push(&record.name);
        let size = record
            .fields
            .iter()
            .map(|field| self.min_size_within(&field.schema, open))
            .fold(0_usize, usize::saturating_add);
        open.pop();
        size
    }
}

/// Rejects a block of `count` items that cannot fit in what is left of the
/// input, and caps sequences of items that take no space at all.
pub(crate) fn check_block(
    count: usize,
    item_size: usize,
    seen: usize,
    reader: &Reader<'_>,
) -> Result<(), Error> {
    if item_size == 0 {
        if seen.saturating_add(count) > MAX_EMPTY_ITEMS {
            return Err(Error::decode(format!(
                "block of {count} empty items exceeds the limit of {MAX_EMPTY_ITEMS}"
            )));
        }
        return Ok(());
    }
    if count.saturating_mul(item_size) > reader.remaining() {
        return Err(Error::decode(format!(
            "block of {count} items needs at least {} bytes, {} left",
            count.saturating_mul(item_size),
            reader.remaining()
        )));
    }
    Ok(())
}

fn schema_kind(schema: &Schema) -> &'static str {
    match schema {
        Schema::Null => "null",
        Schema::Boolean => "boolean",
        Schema::Long => "long",
        Schema::Float => "float",
        Schema::Double => "double",
        Schema::Bytes => "bytes",
        Schema::String => "string",
        Schema::Array(_) => "array",
        Schema::Map(_) => "map",
        Schema::Union(_) => "union",
        Schema::Record(_) | Schema::Named(_) => "record",
    }
}

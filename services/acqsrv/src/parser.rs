//! Block Parser
//!
//! Applies a [`BlockSchema`] to the raw bytes of one read. A buffer shorter
//! than the declared size is a hard error; any single field that cannot be
//! decoded is reported as [`RawValue::Invalid`] and the rest of the block is
//! still returned.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::ParseError;
use crate::schema::{BlockSchema, FieldDescriptor, FieldKind};

/// Decoded value of one field, before unit conversion
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RawValue {
    Int(i64),
    Float(f64),
    Bit(bool),
    Invalid,
}

impl RawValue {
    /// Numeric view; `None` for invalid values and non-finite floats
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Int(v) => Some(v as f64),
            Self::Float(v) if v.is_finite() => Some(v),
            Self::Float(_) | Self::Invalid => None,
            Self::Bit(b) => Some(if b { 1.0 } else { 0.0 }),
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::Invalid)
    }
}

/// Field name → decoded value for one block read
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FieldMap {
    values: BTreeMap<String, RawValue>,
}

impl FieldMap {
    pub fn get(&self, name: &str) -> Option<RawValue> {
        self.values.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: RawValue) {
        self.values.insert(name.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, RawValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Names of fields that failed to decode
    pub fn invalid_fields(&self) -> Vec<&str> {
        self.values
            .iter()
            .filter(|(_, v)| !v.is_valid())
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

/// Combine a high/low word pair into one 32-bit value
#[inline]
pub fn combine_words(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

/// Decode every field of `schema` from `raw`
///
/// Only `raw[..schema.size]` is read. Composites are computed after all
/// plain fields and are invalid whenever one of their words is.
pub fn parse(schema: &BlockSchema, raw: &[u8]) -> Result<FieldMap, ParseError> {
    if raw.len() < schema.size {
        return Err(ParseError::ShortBuffer {
            block: schema.id.clone(),
            expected: schema.size,
            actual: raw.len(),
        });
    }
    let data = &raw[..schema.size];

    let mut map = FieldMap::default();
    for field in &schema.fields {
        if schema.is_excluded(field) {
            continue;
        }
        map.insert(field.name.clone(), decode_field(data, field));
    }

    for composite in &schema.composites {
        let value = match (map.get(&composite.high), map.get(&composite.low)) {
            (Some(RawValue::Int(high)), Some(RawValue::Int(low))) => {
                match (u16::try_from(high), u16::try_from(low)) {
                    (Ok(h), Ok(l)) => RawValue::Int(i64::from(combine_words(h, l))),
                    _ => RawValue::Int(high * 65_536 + low),
                }
            }
            _ => RawValue::Invalid,
        };
        map.insert(composite.name.clone(), value);
    }

    Ok(map)
}

fn decode_field(data: &[u8], field: &FieldDescriptor) -> RawValue {
    let Some(bytes) = data.get(field.offset..field.end()) else {
        return RawValue::Invalid;
    };

    match field.kind {
        FieldKind::Bit => RawValue::Bit((bytes[0] >> field.bit) & 1 == 1),
        FieldKind::Unsigned8 => RawValue::Int(i64::from(bytes[0])),
        FieldKind::Signed16 => RawValue::Int(i64::from(i16::from_be_bytes([bytes[0], bytes[1]]))),
        FieldKind::Unsigned16 => RawValue::Int(i64::from(u16::from_be_bytes([bytes[0], bytes[1]]))),
        FieldKind::Signed32 => RawValue::Int(i64::from(i32::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        FieldKind::Unsigned32 => RawValue::Int(i64::from(u32::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        FieldKind::Float32 => {
            let value = f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            if value.is_finite() {
                RawValue::Float(f64::from(value))
            } else {
                RawValue::Invalid
            }
        }
    }
}

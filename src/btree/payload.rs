//! Typed tuples stored in tree keys and values.
//!
//! A payload is a flat byte image: one null-flag byte per field followed by
//! the fixed-width big-endian field images. Strings are NUL-padded to their
//! declared width and read back up to the first NUL.

use std::cmp::Ordering;
use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Field type of one payload column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Long,
    Float,
    Double,
    /// Fixed-width string of the given byte length.
    Str(usize),
}

impl FieldType {
    /// On-disk type code: 1-4 for the numeric types, 16 + length for strings.
    pub fn code(self) -> u32 {
        match self {
            FieldType::Int => 1,
            FieldType::Long => 2,
            FieldType::Float => 3,
            FieldType::Double => 4,
            FieldType::Str(len) => 16 + len as u32,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(FieldType::Int),
            2 => Ok(FieldType::Long),
            3 => Ok(FieldType::Float),
            4 => Ok(FieldType::Double),
            c if c > 16 => Ok(FieldType::Str((c - 16) as usize)),
            other => Err(Error::Corrupt(format!("unknown field type code {other}"))),
        }
    }

    /// Byte width of the field image (the null flag is counted separately).
    pub fn size(self) -> usize {
        match self {
            FieldType::Int | FieldType::Float => 4,
            FieldType::Long | FieldType::Double => 8,
            FieldType::Str(len) => len,
        }
    }

    /// Whether values of one type can be compared with the other. Strings of
    /// different widths are mutually compatible.
    pub fn compatible(self, other: FieldType) -> bool {
        matches!(
            (self, other),
            (FieldType::Int, FieldType::Int)
                | (FieldType::Long, FieldType::Long)
                | (FieldType::Float, FieldType::Float)
                | (FieldType::Double, FieldType::Double)
                | (FieldType::Str(_), FieldType::Str(_))
        )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Int => write!(f, "INT"),
            FieldType::Long => write!(f, "LONG"),
            FieldType::Float => write!(f, "FLOAT"),
            FieldType::Double => write!(f, "DOUBLE"),
            FieldType::Str(len) => write!(f, "STRING({len})"),
        }
    }
}

/// One field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Int(_) => "INT",
            Value::Long(_) => "LONG",
            Value::Float(_) => "FLOAT",
            Value::Double(_) => "DOUBLE",
            Value::Str(_) => "STRING",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// A typed tuple with its byte image.
#[derive(Debug, Clone)]
pub struct Payload {
    types: Vec<FieldType>,
    data: Vec<u8>,
}

impl Payload {
    /// Byte size of a payload with the given column types.
    pub fn size_of(types: &[FieldType]) -> usize {
        types.len() + types.iter().map(|t| t.size()).sum::<usize>()
    }

    /// All-zero payload: every field non-null with a zero image.
    pub fn empty(types: Vec<FieldType>) -> Self {
        let data = vec![0u8; Self::size_of(&types)];
        Payload { types, data }
    }

    /// Wraps an existing byte image.
    pub fn new(types: Vec<FieldType>, data: Vec<u8>) -> Result<Self> {
        if data.len() != Self::size_of(&types) {
            return Err(Error::Corrupt(format!(
                "payload image is {} bytes, layout needs {}",
                data.len(),
                Self::size_of(&types)
            )));
        }
        Ok(Payload { types, data })
    }

    /// Builds a payload from values, validating each against its column type.
    pub fn from_values(types: &[FieldType], values: &[Value]) -> Result<Self> {
        if values.len() != types.len() {
            return Err(Error::InvalidArgument(format!(
                "{} values for {} columns",
                values.len(),
                types.len()
            )));
        }
        let mut payload = Payload::empty(types.to_vec());
        for (i, value) in values.iter().enumerate() {
            payload.set(i, value)?;
        }
        Ok(payload)
    }

    pub fn types(&self) -> &[FieldType] {
        &self.types
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Whether two column lists are mutually comparable.
    pub fn compatible(a: &[FieldType], b: &[FieldType]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.compatible(*y))
    }

    fn image_offset(&self, idx: usize) -> usize {
        self.types.len() + self.types[..idx].iter().map(|t| t.size()).sum::<usize>()
    }

    /// Reads field `idx`.
    pub fn get(&self, idx: usize) -> Result<Value> {
        if idx >= self.types.len() {
            return Err(Error::InvalidArgument(format!(
                "field index {idx} out of range ({} columns)",
                self.types.len()
            )));
        }
        if self.data[idx] != 0 {
            return Ok(Value::Null);
        }
        let image = &self.data[self.image_offset(idx)..];
        Ok(match self.types[idx] {
            FieldType::Int => Value::Int(BigEndian::read_i32(image)),
            FieldType::Long => Value::Long(BigEndian::read_i64(image)),
            FieldType::Float => Value::Float(BigEndian::read_f32(image)),
            FieldType::Double => Value::Double(BigEndian::read_f64(image)),
            FieldType::Str(len) => {
                let bytes = &image[..len];
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(len);
                let text = std::str::from_utf8(&bytes[..end])
                    .map_err(|_| Error::Corrupt(format!("field {idx} is not valid UTF-8")))?;
                Value::Str(text.to_string())
            }
        })
    }

    /// Writes field `idx`, validating the value against the column type.
    pub fn set(&mut self, idx: usize, value: &Value) -> Result<()> {
        if idx >= self.types.len() {
            return Err(Error::InvalidArgument(format!(
                "field index {idx} out of range ({} columns)",
                self.types.len()
            )));
        }
        let field_type = self.types[idx];
        let offset = self.image_offset(idx);
        let image = &mut self.data[offset..offset + field_type.size()];
        image.fill(0);
        match (field_type, value) {
            (_, Value::Null) => {
                self.data[idx] = 1;
                return Ok(());
            }
            (FieldType::Int, Value::Int(v)) => BigEndian::write_i32(image, *v),
            (FieldType::Long, Value::Long(v)) => BigEndian::write_i64(image, *v),
            (FieldType::Float, Value::Float(v)) => BigEndian::write_f32(image, *v),
            (FieldType::Double, Value::Double(v)) => BigEndian::write_f64(image, *v),
            (FieldType::Str(len), Value::Str(v)) => {
                if v.len() > len {
                    return Err(Error::ValueTooLong {
                        field: format!("field {idx}"),
                        len: v.len(),
                        max: len,
                    });
                }
                image[..v.len()].copy_from_slice(v.as_bytes());
            }
            (expected, actual) => {
                return Err(Error::TypeMismatch {
                    expected: expected.to_string(),
                    actual: actual.type_name().to_string(),
                });
            }
        }
        self.data[idx] = 0;
        Ok(())
    }

    /// Total order used for keys: lexicographic by field position, with a
    /// null field strictly below every non-null value of that field.
    ///
    /// Assumes compatible column lists (callers validate at the tree
    /// boundary); undecodable strings compare by their lossy decoding so the
    /// order stays total.
    pub fn key_cmp(&self, other: &Payload) -> Ordering {
        let fields = self.types.len().min(other.types.len());
        for i in 0..fields {
            let ord = match (self.data[i] != 0, other.data[i] != 0) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => self.field_cmp(other, i),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.types.len().cmp(&other.types.len())
    }

    fn field_cmp(&self, other: &Payload, idx: usize) -> Ordering {
        let a = &self.data[self.image_offset(idx)..];
        let b = &other.data[other.image_offset(idx)..];
        match (self.types[idx], other.types[idx]) {
            (FieldType::Int, _) => BigEndian::read_i32(a).cmp(&BigEndian::read_i32(b)),
            (FieldType::Long, _) => BigEndian::read_i64(a).cmp(&BigEndian::read_i64(b)),
            (FieldType::Float, _) => BigEndian::read_f32(a).total_cmp(&BigEndian::read_f32(b)),
            (FieldType::Double, _) => BigEndian::read_f64(a).total_cmp(&BigEndian::read_f64(b)),
            (FieldType::Str(la), FieldType::Str(lb)) => {
                let sa = str_prefix(&a[..la]);
                let sb = str_prefix(&b[..lb]);
                sa.cmp(&sb)
            }
            // Unreachable for compatible payloads.
            _ => Ordering::Equal,
        }
    }
}

fn str_prefix(bytes: &[u8]) -> std::borrow::Cow<'_, str> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end])
}

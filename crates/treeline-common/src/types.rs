//! Field types, field values, and comparison predicates.

use crate::error::{Result, TreelineError};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Fixed on-disk length of string field payloads, in bytes.
///
/// Strings are stored as a 4-byte big-endian length prefix followed by a
/// fixed block of this many bytes; shorter strings are zero padded.
pub const STRING_LEN: usize = 128;

/// Identifier for the supported fixed-width field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FieldType {
    /// 32-bit signed integer, big-endian two's complement.
    Int = 0,
    /// Fixed-width string: 4-byte length prefix + [`STRING_LEN`] bytes.
    Str = 1,
}

impl FieldType {
    /// Returns the serialized byte width of a field of this type.
    pub fn byte_len(&self) -> usize {
        match self {
            FieldType::Int => 4,
            FieldType::Str => 4 + STRING_LEN,
        }
    }

    /// Reads a field of this type from the cursor.
    pub fn read(&self, buf: &mut impl Buf) -> Result<Field> {
        match self {
            FieldType::Int => Ok(Field::Int(buf.get_i32())),
            FieldType::Str => {
                let len = buf.get_u32() as usize;
                if len > STRING_LEN {
                    return Err(TreelineError::InvalidEntry(format!(
                        "string length {} exceeds maximum {}",
                        len, STRING_LEN
                    )));
                }
                let mut block = [0u8; STRING_LEN];
                buf.copy_to_slice(&mut block);
                let s = std::str::from_utf8(&block[..len])
                    .map_err(|e| TreelineError::InvalidEntry(format!("invalid utf-8: {}", e)))?;
                Ok(Field::Str(s.to_string()))
            }
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::Int => write!(f, "INT"),
            FieldType::Str => write!(f, "STRING"),
        }
    }
}

/// A field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    Int(i32),
    Str(String),
}

impl Field {
    /// Returns the type of this field.
    pub fn field_type(&self) -> FieldType {
        match self {
            Field::Int(_) => FieldType::Int,
            Field::Str(_) => FieldType::Str,
        }
    }

    /// Writes this field to the cursor in its fixed-width encoding.
    pub fn write(&self, buf: &mut impl BufMut) {
        match self {
            Field::Int(v) => buf.put_i32(*v),
            Field::Str(s) => {
                let bytes = s.as_bytes();
                let len = bytes.len().min(STRING_LEN);
                buf.put_u32(len as u32);
                buf.put_slice(&bytes[..len]);
                buf.put_bytes(0, STRING_LEN - len);
            }
        }
    }

    /// Compares two fields of the same type, ordering by value.
    pub fn cmp_value(&self, other: &Field) -> Result<Ordering> {
        match (self, other) {
            (Field::Int(a), Field::Int(b)) => Ok(a.cmp(b)),
            (Field::Str(a), Field::Str(b)) => Ok(a.cmp(b)),
            _ => Err(TreelineError::TypeMismatch {
                expected: self.field_type().to_string(),
                actual: other.field_type().to_string(),
            }),
        }
    }

    /// Applies a comparison operator against another field of the same type.
    pub fn compare(&self, op: Op, other: &Field) -> Result<bool> {
        let ord = self.cmp_value(other)?;
        Ok(match op {
            Op::Equals => ord == Ordering::Equal,
            Op::NotEqual => ord != Ordering::Equal,
            Op::GreaterThan => ord == Ordering::Greater,
            Op::GreaterThanOrEq => ord != Ordering::Less,
            Op::LessThan => ord == Ordering::Less,
            Op::LessThanOrEq => ord != Ordering::Greater,
        })
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Field::Int(v) => write!(f, "{}", v),
            Field::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// Comparison operators for predicated index scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Equals,
    GreaterThan,
    GreaterThanOrEq,
    LessThan,
    LessThanOrEq,
    NotEqual,
}

/// A predicate over the index key: `key <op> value`.
#[derive(Debug, Clone)]
pub struct IndexPredicate {
    pub op: Op,
    pub value: Field,
}

impl IndexPredicate {
    /// Creates a new index predicate.
    pub fn new(op: Op, value: Field) -> Self {
        Self { op, value }
    }
}

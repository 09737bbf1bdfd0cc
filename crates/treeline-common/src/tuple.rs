//! Tuple representation and serialization.

use crate::error::{Result, TreelineError};
use crate::page::PageId;
use crate::types::{Field, FieldType};
use bytes::{Buf, BufMut};

/// Ordered field types describing the serialized shape of a tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleLayout {
    field_types: Vec<FieldType>,
}

impl TupleLayout {
    /// Creates a layout from an ordered list of field types.
    pub fn new(field_types: Vec<FieldType>) -> Self {
        Self { field_types }
    }

    /// Returns the number of fields per tuple.
    pub fn num_fields(&self) -> usize {
        self.field_types.len()
    }

    /// Returns the type of field `i`.
    pub fn field_type(&self, i: usize) -> FieldType {
        self.field_types[i]
    }

    /// Returns the serialized byte width of one tuple.
    pub fn byte_len(&self) -> usize {
        self.field_types.iter().map(|t| t.byte_len()).sum()
    }

    /// Reads one tuple from the cursor.
    pub fn read(&self, buf: &mut impl Buf) -> Result<Tuple> {
        let mut fields = Vec::with_capacity(self.field_types.len());
        for ty in &self.field_types {
            fields.push(ty.read(buf)?);
        }
        Ok(Tuple::new(fields))
    }
}

/// Identifier of a tuple's physical location: a page and a slot within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: usize,
}

impl RecordId {
    /// Creates a new record id.
    pub fn new(page_id: PageId, slot: usize) -> Self {
        Self { page_id, slot }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.page_id, self.slot)
    }
}

/// A fixed-width tuple of field values.
///
/// The record id is absent until the tuple is stored on a leaf page; moving
/// a tuple between slots rewrites it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    record_id: Option<RecordId>,
    fields: Vec<Field>,
}

impl Tuple {
    /// Creates a tuple with no record id.
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            record_id: None,
            fields,
        }
    }

    /// Returns the record id, if the tuple is stored on a page.
    pub fn record_id(&self) -> Option<RecordId> {
        self.record_id
    }

    /// Sets or clears the record id.
    pub fn set_record_id(&mut self, rid: Option<RecordId>) {
        self.record_id = rid;
    }

    /// Returns the number of fields.
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Returns field `i`.
    pub fn field(&self, i: usize) -> &Field {
        &self.fields[i]
    }

    /// Returns all fields.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Returns true if the field values match the given layout.
    pub fn matches_layout(&self, layout: &TupleLayout) -> bool {
        self.fields.len() == layout.num_fields()
            && self
                .fields
                .iter()
                .enumerate()
                .all(|(i, f)| f.field_type() == layout.field_type(i))
    }

    /// Writes this tuple's fields to the cursor.
    pub fn write(&self, buf: &mut impl BufMut) {
        for field in &self.fields {
            field.write(buf);
        }
    }

    /// Returns an error unless the tuple matches the layout.
    pub fn check_layout(&self, layout: &TupleLayout) -> Result<()> {
        if self.matches_layout(layout) {
            Ok(())
        } else {
            Err(TreelineError::TypeMismatch {
                expected: format!("{} fields of the index layout", layout.num_fields()),
                actual: format!("{} fields", self.fields.len()),
            })
        }
    }
}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", field)?;
        }
        write!(f, ")")
    }
}

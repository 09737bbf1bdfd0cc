//! Leaf pages: sorted fixed-width tuples in a slotted bitmap layout.

use super::{PageId, PageKind, PAGE_SIZE};
use crate::error::{Result, TreelineError};
use crate::tuple::{RecordId, Tuple, TupleLayout};
use crate::types::Field;
use bytes::{Buf, BufMut};

/// A B+ tree leaf page.
///
/// Layout: parent pointer (4B), left sibling (4B), right sibling (4B),
/// occupancy bitmap, then `capacity` fixed-width tuple slots and zero
/// padding. Tuples in used slots are sorted by the key field in slot order;
/// deletes leave holes that inserts re-fill by shifting the fewest records.
#[derive(Debug, Clone)]
pub struct LeafPage {
    id: PageId,
    layout: TupleLayout,
    key_field: usize,
    parent: u32,
    left_sibling: u32,
    right_sibling: u32,
    slots: Vec<Option<Tuple>>,
    old_data: Vec<u8>,
}

impl PartialEq for LeafPage {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.parent == other.parent
            && self.left_sibling == other.left_sibling
            && self.right_sibling == other.right_sibling
            && self.slots == other.slots
    }
}

/// Number of tuple slots on a leaf page for the given layout.
pub(crate) fn leaf_capacity(layout: &TupleLayout) -> usize {
    (PAGE_SIZE * 8 - 3 * 32) / (layout.byte_len() * 8 + 1)
}

fn bitmap_len(capacity: usize) -> usize {
    capacity.div_ceil(8)
}

impl LeafPage {
    /// Decodes a leaf page from its on-disk bytes.
    pub fn decode(id: PageId, data: &[u8], layout: &TupleLayout, key_field: usize) -> Result<Self> {
        let capacity = leaf_capacity(layout);
        let mut buf = data;

        let parent = buf.get_i32() as u32;
        let left_sibling = buf.get_i32() as u32;
        let right_sibling = buf.get_i32() as u32;

        let mut bitmap = vec![0u8; bitmap_len(capacity)];
        buf.copy_to_slice(&mut bitmap);

        let tuple_len = layout.byte_len();
        let mut slots = Vec::with_capacity(capacity);
        for slot in 0..capacity {
            if bitmap[slot / 8] & (1 << (slot % 8)) != 0 {
                let mut tuple = layout.read(&mut buf)?;
                tuple.set_record_id(Some(RecordId::new(id, slot)));
                slots.push(Some(tuple));
            } else {
                buf.advance(tuple_len);
                slots.push(None);
            }
        }

        Ok(Self {
            id,
            layout: layout.clone(),
            key_field,
            parent,
            left_sibling,
            right_sibling,
            slots,
            old_data: data.to_vec(),
        })
    }

    /// Encodes this page to exactly [`PAGE_SIZE`] bytes.
    pub fn encode(&self) -> Vec<u8> {
        let capacity = self.slots.len();
        let mut buf = Vec::with_capacity(PAGE_SIZE);

        buf.put_i32(self.parent as i32);
        buf.put_i32(self.left_sibling as i32);
        buf.put_i32(self.right_sibling as i32);

        let mut bitmap = vec![0u8; bitmap_len(capacity)];
        for (slot, tuple) in self.slots.iter().enumerate() {
            if tuple.is_some() {
                bitmap[slot / 8] |= 1 << (slot % 8);
            }
        }
        buf.put_slice(&bitmap);

        let tuple_len = self.layout.byte_len();
        for tuple in &self.slots {
            match tuple {
                Some(t) => t.write(&mut buf),
                None => buf.put_bytes(0, tuple_len),
            }
        }

        buf.resize(PAGE_SIZE, 0);
        buf
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// Returns the total number of tuple slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of used slots.
    pub fn tuple_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Returns the number of free slots.
    pub fn empty_slot_count(&self) -> usize {
        self.capacity() - self.tuple_count()
    }

    /// Returns the key field of the given tuple.
    pub fn key_of<'t>(&self, tuple: &'t Tuple) -> &'t Field {
        tuple.field(self.key_field)
    }

    /// Iterates the stored tuples in slot (key) order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Tuple> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    /// Returns clones of all stored tuples in slot (key) order.
    pub fn tuples(&self) -> Vec<Tuple> {
        self.iter().cloned().collect()
    }

    /// Returns the first stored tuple, if any.
    pub fn first_tuple(&self) -> Option<&Tuple> {
        self.iter().next()
    }

    /// Inserts a tuple, keeping slot order sorted by the key field.
    ///
    /// The nearest empty slot is pulled to the insertion point by shifting
    /// records; each moved record's id is rewritten. The inserted tuple gets
    /// a record id on this page.
    pub fn insert_tuple(&mut self, tuple: &mut Tuple) -> Result<()> {
        tuple.check_layout(&self.layout)?;

        let empty_slot = match self.slots.iter().position(|s| s.is_none()) {
            Some(slot) => slot,
            None => return Err(TreelineError::PageFull),
        };

        // Last used slot whose key is <= the new key.
        let key = tuple.field(self.key_field).clone();
        let mut less_or_eq: Option<usize> = None;
        for (slot, stored) in self.slots.iter().enumerate() {
            if let Some(t) = stored {
                let stored_key = t.field(self.key_field);
                if stored_key.cmp_value(&key)? != std::cmp::Ordering::Greater {
                    less_or_eq = Some(slot);
                } else {
                    break;
                }
            }
        }

        let target = match less_or_eq {
            Some(le) if empty_slot < le => {
                for slot in empty_slot + 1..=le {
                    self.move_record(slot, slot - 1);
                }
                le
            }
            Some(le) => {
                for slot in (le + 1..empty_slot).rev() {
                    self.move_record(slot, slot + 1);
                }
                le + 1
            }
            None => {
                for slot in (0..empty_slot).rev() {
                    self.move_record(slot, slot + 1);
                }
                0
            }
        };

        tuple.set_record_id(Some(RecordId::new(self.id, target)));
        self.slots[target] = Some(tuple.clone());
        Ok(())
    }

    /// Deletes the tuple at its record id's slot.
    ///
    /// The slot is cleared without compaction. Errors if the record id is
    /// missing, names a different page, or points at an empty slot.
    pub fn delete_tuple(&mut self, tuple: &Tuple) -> Result<()> {
        let rid = tuple
            .record_id()
            .ok_or_else(|| TreelineError::TupleNotFound("tuple has no record id".to_string()))?;
        if rid.page_id != self.id {
            return Err(TreelineError::TupleNotFound(format!(
                "record id {} does not name page {}",
                rid, self.id
            )));
        }
        if rid.slot >= self.slots.len() || self.slots[rid.slot].is_none() {
            return Err(TreelineError::TupleNotFound(format!(
                "slot {} of page {} is empty",
                rid.slot, self.id
            )));
        }
        self.slots[rid.slot] = None;
        Ok(())
    }

    fn move_record(&mut self, from: usize, to: usize) {
        if self.slots[to].is_none() {
            if let Some(mut tuple) = self.slots[from].take() {
                tuple.set_record_id(Some(RecordId::new(self.id, to)));
                self.slots[to] = Some(tuple);
            }
        }
    }

    /// Returns the parent page id; page number 0 means the root pointer.
    pub fn parent_id(&self) -> PageId {
        if self.parent == 0 {
            PageId::root_ptr(self.id.table_id)
        } else {
            PageId::new(self.id.table_id, self.parent, PageKind::Internal)
        }
    }

    /// Sets the parent page id.
    pub fn set_parent_id(&mut self, parent: PageId) -> Result<()> {
        if parent.table_id != self.id.table_id {
            return Err(TreelineError::InvalidParent(format!(
                "parent {} belongs to a different table than {}",
                parent, self.id
            )));
        }
        match parent.kind {
            PageKind::RootPtr => self.parent = 0,
            PageKind::Internal => self.parent = parent.page_no,
            kind => {
                return Err(TreelineError::InvalidParent(format!(
                    "leaf parent must be internal or root pointer, got {}",
                    kind
                )))
            }
        }
        Ok(())
    }

    /// Returns the left sibling leaf, if any.
    pub fn left_sibling_id(&self) -> Option<PageId> {
        if self.left_sibling == 0 {
            None
        } else {
            Some(PageId::new(
                self.id.table_id,
                self.left_sibling,
                PageKind::Leaf,
            ))
        }
    }

    /// Returns the right sibling leaf, if any.
    pub fn right_sibling_id(&self) -> Option<PageId> {
        if self.right_sibling == 0 {
            None
        } else {
            Some(PageId::new(
                self.id.table_id,
                self.right_sibling,
                PageKind::Leaf,
            ))
        }
    }

    pub fn set_left_sibling_id(&mut self, sibling: Option<PageId>) -> Result<()> {
        self.left_sibling = self.check_sibling(sibling)?;
        Ok(())
    }

    pub fn set_right_sibling_id(&mut self, sibling: Option<PageId>) -> Result<()> {
        self.right_sibling = self.check_sibling(sibling)?;
        Ok(())
    }

    fn check_sibling(&self, sibling: Option<PageId>) -> Result<u32> {
        match sibling {
            None => Ok(0),
            Some(pid) => {
                if pid.table_id != self.id.table_id || pid.kind != PageKind::Leaf {
                    return Err(TreelineError::InvalidParent(format!(
                        "sibling {} is not a leaf of table {}",
                        pid, self.id.table_id
                    )));
                }
                Ok(pid.page_no)
            }
        }
    }

    /// Returns a fresh decode of the before-image snapshot.
    pub fn before_image(&self) -> Result<Self> {
        Self::decode(self.id, &self.old_data, &self.layout, self.key_field)
    }

    /// Overwrites the before-image snapshot with the current contents.
    pub fn set_before_image(&mut self) {
        self.old_data = self.encode();
    }
}

//! Internal pages: separator keys and child pointers.

use super::{PageId, PageKind, PAGE_SIZE};
use crate::error::{Result, TreelineError};
use crate::types::{Field, FieldType};
use bytes::{Buf, BufMut};
use std::cmp::Ordering;

/// Extra bits per internal page: parent pointer, child-kind byte, the one
/// surplus child pointer (m keys have m+1 children), and the slot-0 header
/// bit.
const EXTRA_BITS: usize = 2 * 32 + 8 + 1;

/// One separator of an internal page together with its two adjacent child
/// pointers. The slot is assigned when the entry is stored on a page.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: Field,
    pub left_child: PageId,
    pub right_child: PageId,
    slot: Option<usize>,
}

impl Entry {
    /// Creates an entry not yet stored on any page.
    pub fn new(key: Field, left_child: PageId, right_child: PageId) -> Self {
        Self {
            key,
            left_child,
            right_child,
            slot: None,
        }
    }

    /// Returns the slot this entry occupies on its page, if stored.
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }
}

/// A B+ tree internal page.
///
/// Layout: parent pointer (4B), child-kind byte, occupancy bitmap over
/// `capacity + 1` slots, `capacity` keys (the slot-0 key bytes stay zero),
/// and `capacity + 1` child page numbers. Slot 0 holds only the leftmost
/// child pointer; slot `i >= 1` holds key `i` and the child to its right.
#[derive(Debug, Clone)]
pub struct InternalPage {
    id: PageId,
    key_type: FieldType,
    parent: u32,
    child_kind: Option<PageKind>,
    used: Vec<bool>,
    keys: Vec<Option<Field>>,
    children: Vec<u32>,
    old_data: Vec<u8>,
}

impl PartialEq for InternalPage {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.parent == other.parent
            && self.child_kind == other.child_kind
            && self.used == other.used
            && self.keys == other.keys
            && self.children == other.children
    }
}

/// Maximum number of entries (keys) on an internal page for the given key
/// type.
pub(crate) fn internal_capacity(key_type: FieldType) -> usize {
    let entry_bits = key_type.byte_len() * 8 + 32 + 1;
    (PAGE_SIZE * 8 - EXTRA_BITS) / entry_bits
}

fn bitmap_len(slots: usize) -> usize {
    slots.div_ceil(8)
}

impl InternalPage {
    /// Decodes an internal page from its on-disk bytes.
    pub fn decode(id: PageId, data: &[u8], key_type: FieldType) -> Result<Self> {
        let capacity = internal_capacity(key_type);
        let slots = capacity + 1;
        let mut buf = data;

        let parent = buf.get_i32() as u32;
        let kind_code = buf.get_u8();
        let child_kind = match kind_code {
            0 => None,
            code => {
                let kind = PageKind::from_code(code)?;
                if kind != PageKind::Leaf && kind != PageKind::Internal {
                    return Err(TreelineError::PageCorrupted {
                        page_no: id.page_no,
                        reason: format!("child kind must be leaf or internal, got {}", kind),
                    });
                }
                Some(kind)
            }
        };

        let mut bitmap = vec![0u8; bitmap_len(slots)];
        buf.copy_to_slice(&mut bitmap);
        let used: Vec<bool> = (0..slots)
            .map(|i| bitmap[i / 8] & (1 << (i % 8)) != 0)
            .collect();

        if child_kind.is_none() && used.iter().any(|u| *u) {
            return Err(TreelineError::PageCorrupted {
                page_no: id.page_no,
                reason: "page has entries but no child kind".to_string(),
            });
        }

        let key_len = key_type.byte_len();
        let mut keys: Vec<Option<Field>> = vec![None; slots];
        for (slot, key) in keys.iter_mut().enumerate().take(slots).skip(1) {
            if used[slot] {
                *key = Some(key_type.read(&mut buf)?);
            } else {
                buf.advance(key_len);
            }
        }

        let mut children = vec![0u32; slots];
        for (slot, child) in children.iter_mut().enumerate() {
            if used[slot] {
                *child = buf.get_i32() as u32;
            } else {
                buf.advance(4);
            }
        }

        Ok(Self {
            id,
            key_type,
            parent,
            child_kind,
            used,
            keys,
            children,
            old_data: data.to_vec(),
        })
    }

    /// Encodes this page to exactly [`PAGE_SIZE`] bytes.
    pub fn encode(&self) -> Vec<u8> {
        let slots = self.used.len();
        let mut buf = Vec::with_capacity(PAGE_SIZE);

        buf.put_i32(self.parent as i32);
        buf.put_u8(self.child_kind.map(|k| k as u8).unwrap_or(0));

        let mut bitmap = vec![0u8; bitmap_len(slots)];
        for (slot, used) in self.used.iter().enumerate() {
            if *used {
                bitmap[slot / 8] |= 1 << (slot % 8);
            }
        }
        buf.put_slice(&bitmap);

        let key_len = self.key_type.byte_len();
        for slot in 1..slots {
            match (&self.keys[slot], self.used[slot]) {
                (Some(key), true) => key.write(&mut buf),
                _ => buf.put_bytes(0, key_len),
            }
        }
        for slot in 0..slots {
            if self.used[slot] {
                buf.put_i32(self.children[slot] as i32);
            } else {
                buf.put_bytes(0, 4);
            }
        }

        buf.resize(PAGE_SIZE, 0);
        buf
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// Returns the maximum number of entries (keys).
    pub fn capacity(&self) -> usize {
        self.used.len() - 1
    }

    /// Returns the number of stored entries.
    pub fn entry_count(&self) -> usize {
        self.used[1..].iter().filter(|u| **u).count()
    }

    /// Returns the number of free entry slots.
    pub fn empty_slot_count(&self) -> usize {
        self.capacity() - self.entry_count()
    }

    /// Returns the kind of this page's children, or None if it has none.
    pub fn child_kind(&self) -> Option<PageKind> {
        self.child_kind
    }

    /// Returns the stored entries in slot (key) order.
    ///
    /// Each entry's left child is the previous used slot's child pointer,
    /// so adjacent entries share a child.
    pub fn entries(&self) -> Vec<Entry> {
        let kind = match self.child_kind {
            Some(kind) => kind,
            None => return Vec::new(),
        };
        if !self.used[0] {
            return Vec::new();
        }

        let child_id = |no: u32| PageId::new(self.id.table_id, no, kind);
        let mut entries = Vec::with_capacity(self.entry_count());
        let mut prev = self.children[0];
        for slot in 1..self.used.len() {
            if self.used[slot] {
                if let Some(key) = &self.keys[slot] {
                    entries.push(Entry {
                        key: key.clone(),
                        left_child: child_id(prev),
                        right_child: child_id(self.children[slot]),
                        slot: Some(slot),
                    });
                }
                prev = self.children[slot];
            }
        }
        entries
    }

    /// Returns the ids of every referenced child, in slot order.
    pub fn child_ids(&self) -> Vec<PageId> {
        let kind = match self.child_kind {
            Some(kind) => kind,
            None => return Vec::new(),
        };
        self.used
            .iter()
            .enumerate()
            .filter(|(_, used)| **used)
            .map(|(slot, _)| PageId::new(self.id.table_id, self.children[slot], kind))
            .collect()
    }

    /// Inserts an entry, keeping keys sorted.
    ///
    /// One of the entry's children must already be referenced by this page;
    /// that pointer anchors the insertion position and is replaced by the
    /// entry's left child, while the right child lands in the new slot.
    pub fn insert_entry(&mut self, entry: &mut Entry) -> Result<()> {
        if entry.key.field_type() != self.key_type {
            return Err(TreelineError::TypeMismatch {
                expected: self.key_type.to_string(),
                actual: entry.key.field_type().to_string(),
            });
        }
        if entry.left_child.table_id != self.id.table_id
            || entry.right_child.table_id != self.id.table_id
        {
            return Err(TreelineError::InvalidEntry(
                "entry children belong to a different table".to_string(),
            ));
        }

        match self.child_kind {
            None => {
                if entry.left_child.kind != entry.right_child.kind {
                    return Err(TreelineError::InvalidEntry(
                        "entry children disagree on page kind".to_string(),
                    ));
                }
                if entry.left_child.kind != PageKind::Leaf
                    && entry.left_child.kind != PageKind::Internal
                {
                    return Err(TreelineError::InvalidEntry(format!(
                        "children must be leaf or internal pages, got {}",
                        entry.left_child.kind
                    )));
                }
                self.child_kind = Some(entry.left_child.kind);
            }
            Some(kind) => {
                if entry.left_child.kind != kind || entry.right_child.kind != kind {
                    return Err(TreelineError::InvalidEntry(format!(
                        "entry children must be {} pages",
                        kind
                    )));
                }
            }
        }

        // First entry claims slot 0 for the left child and slot 1 for the
        // key and right child.
        if self.entry_count() == 0 {
            self.children[0] = entry.left_child.page_no;
            self.children[1] = entry.right_child.page_no;
            self.keys[1] = Some(entry.key.clone());
            self.used[0] = true;
            self.used[1] = true;
            entry.slot = Some(1);
            return Ok(());
        }

        let slots = self.used.len();
        let empty_slot = match (1..slots).find(|slot| !self.used[*slot]) {
            Some(slot) => slot,
            None => return Err(TreelineError::PageFull),
        };

        // Find the used slot whose child pointer matches one of the entry's
        // children; that is the last slot with a key <= the new key.
        let mut less_or_eq: Option<usize> = None;
        for slot in 0..slots {
            if !self.used[slot] {
                continue;
            }
            if self.children[slot] == entry.left_child.page_no
                || self.children[slot] == entry.right_child.page_no
            {
                if slot > 0 {
                    if let Some(key) = &self.keys[slot] {
                        if key.cmp_value(&entry.key)? == Ordering::Greater {
                            return Err(TreelineError::InvalidEntry(format!(
                                "entry with key {} would break key order at slot {}",
                                entry.key, slot
                            )));
                        }
                    }
                }
                less_or_eq = Some(slot);
                if self.children[slot] == entry.right_child.page_no {
                    self.children[slot] = entry.left_child.page_no;
                }
            } else if less_or_eq.is_some() {
                if let Some(key) = &self.keys[slot] {
                    if key.cmp_value(&entry.key)? == Ordering::Less {
                        return Err(TreelineError::InvalidEntry(format!(
                            "entry with key {} would break key order at slot {}",
                            entry.key, slot
                        )));
                    }
                }
                break;
            }
        }

        let less_or_eq = less_or_eq.ok_or_else(|| {
            TreelineError::InvalidEntry(format!(
                "neither child of entry with key {} is referenced by page {}",
                entry.key, self.id
            ))
        })?;

        // Pull the empty slot next to the insertion point.
        let target = if empty_slot < less_or_eq {
            for slot in empty_slot + 1..=less_or_eq {
                self.move_entry(slot, slot - 1);
            }
            less_or_eq
        } else {
            for slot in ((less_or_eq + 2)..=empty_slot).rev() {
                self.move_entry(slot - 1, slot);
            }
            less_or_eq + 1
        };

        self.used[target] = true;
        self.keys[target] = Some(entry.key.clone());
        self.children[target] = entry.right_child.page_no;
        entry.slot = Some(target);
        Ok(())
    }

    fn move_entry(&mut self, from: usize, to: usize) {
        if self.used[from] && !self.used[to] {
            self.keys[to] = self.keys[from].take();
            self.children[to] = self.children[from];
            self.children[from] = 0;
            self.used[to] = true;
            self.used[from] = false;
        }
    }

    /// Deletes an entry's key and its right child pointer.
    pub fn delete_key_and_right_child(&mut self, entry: &Entry) -> Result<()> {
        let slot = self.check_stored(entry)?;
        self.clear_slot(slot);
        Ok(())
    }

    /// Deletes an entry's key and its left child pointer.
    ///
    /// The entry's right child takes over the preceding slot's pointer.
    pub fn delete_key_and_left_child(&mut self, entry: &Entry) -> Result<()> {
        let slot = self.check_stored(entry)?;
        for prev in (0..slot).rev() {
            if self.used[prev] {
                self.children[prev] = self.children[slot];
                self.clear_slot(slot);
                return Ok(());
            }
        }
        Err(TreelineError::InvalidEntry(format!(
            "entry at slot {} of page {} has no preceding child",
            slot, self.id
        )))
    }

    /// Rewrites the key and right child of a stored entry in place.
    ///
    /// The new key must preserve the ordering against neighboring entries.
    pub fn update_entry(&mut self, entry: &Entry) -> Result<()> {
        let slot = self.check_stored(entry)?;

        for prev in (1..slot).rev() {
            if self.used[prev] {
                if let Some(key) = &self.keys[prev] {
                    if key.cmp_value(&entry.key)? == Ordering::Greater {
                        return Err(TreelineError::InvalidEntry(format!(
                            "updated key {} would break key order at slot {}",
                            entry.key, prev
                        )));
                    }
                }
                break;
            }
        }
        for next in slot + 1..self.used.len() {
            if self.used[next] {
                if let Some(key) = &self.keys[next] {
                    if key.cmp_value(&entry.key)? == Ordering::Less {
                        return Err(TreelineError::InvalidEntry(format!(
                            "updated key {} would break key order at slot {}",
                            entry.key, next
                        )));
                    }
                }
                break;
            }
        }

        self.keys[slot] = Some(entry.key.clone());
        self.children[slot] = entry.right_child.page_no;
        Ok(())
    }

    fn check_stored(&self, entry: &Entry) -> Result<usize> {
        let slot = entry.slot.ok_or_else(|| {
            TreelineError::InvalidEntry("entry is not stored on any page".to_string())
        })?;
        if slot == 0 || slot >= self.used.len() || !self.used[slot] {
            return Err(TreelineError::InvalidEntry(format!(
                "slot {} of page {} holds no entry",
                slot, self.id
            )));
        }
        Ok(slot)
    }

    fn clear_slot(&mut self, slot: usize) {
        self.used[slot] = false;
        self.keys[slot] = None;
        self.children[slot] = 0;
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
                    "internal parent must be internal or root pointer, got {}",
                    kind
                )))
            }
        }
        Ok(())
    }

    /// Returns a fresh decode of the before-image snapshot.
    pub fn before_image(&self) -> Result<Self> {
        Self::decode(self.id, &self.old_data, self.key_type)
    }

    /// Overwrites the before-image snapshot with the current contents.
    pub fn set_before_image(&mut self) {
        self.old_data = self.encode();
    }
}

//! Header pages: the free-list bitmap chain.

use super::{PageId, PageKind, PAGE_SIZE};
use crate::error::Result;
use bytes::{Buf, BufMut};

/// Number of page slots tracked by one header page.
const SLOT_COUNT: usize = (PAGE_SIZE - 2 * 4) * 8;

/// One page of the doubly linked free-list bitmap.
///
/// Each bit corresponds to one file page number; 1 means the page is in use,
/// 0 means it is free. Header pages chain through prev/next pointers, with
/// page number 0 as the "none" sentinel on disk.
#[derive(Debug, Clone)]
pub struct HeaderPage {
    id: PageId,
    prev: u32,
    next: u32,
    bits: Vec<u8>,
    old_data: Vec<u8>,
}

impl PartialEq for HeaderPage {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.prev == other.prev
            && self.next == other.next
            && self.bits == other.bits
    }
}

impl HeaderPage {
    /// Returns the number of page slots tracked by one header page.
    pub const fn slot_count() -> usize {
        SLOT_COUNT
    }

    /// Decodes a header page from its on-disk bytes.
    pub fn decode(id: PageId, data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let prev = buf.get_i32() as u32;
        let next = buf.get_i32() as u32;
        let bits = buf.to_vec();
        debug_assert_eq!(bits.len(), SLOT_COUNT / 8);

        Ok(Self {
            id,
            prev,
            next,
            bits,
            old_data: data.to_vec(),
        })
    }

    /// Encodes this page to exactly [`PAGE_SIZE`] bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PAGE_SIZE);
        buf.put_i32(self.prev as i32);
        buf.put_i32(self.next as i32);
        buf.put_slice(&self.bits);
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        buf
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// Marks every slot used.
    ///
    /// A freshly created header page covers pages that all exist and are
    /// presumed live; the caller then clears the bits it knows are free.
    pub fn init(&mut self) {
        self.bits.fill(0xFF);
    }

    /// Returns the previous header page in the chain, if any.
    pub fn prev_id(&self) -> Option<PageId> {
        if self.prev == 0 {
            None
        } else {
            Some(PageId::new(self.id.table_id, self.prev, PageKind::Header))
        }
    }

    /// Returns the next header page in the chain, if any.
    pub fn next_id(&self) -> Option<PageId> {
        if self.next == 0 {
            None
        } else {
            Some(PageId::new(self.id.table_id, self.next, PageKind::Header))
        }
    }

    pub fn set_prev_id(&mut self, prev: Option<PageId>) {
        self.prev = prev.map(|p| p.page_no).unwrap_or(0);
    }

    pub fn set_next_id(&mut self, next: Option<PageId>) {
        self.next = next.map(|p| p.page_no).unwrap_or(0);
    }

    /// Returns true if slot `i` is marked in use.
    pub fn is_slot_used(&self, i: usize) -> bool {
        self.bits[i / 8] & (1 << (i % 8)) != 0
    }

    /// Marks slot `i` used or free.
    pub fn mark_slot_used(&mut self, i: usize, used: bool) {
        if used {
            self.bits[i / 8] |= 1 << (i % 8);
        } else {
            self.bits[i / 8] &= !(1 << (i % 8));
        }
    }

    /// Returns the first free slot on this page, if any.
    pub fn empty_slot(&self) -> Option<usize> {
        for (byte_idx, byte) in self.bits.iter().enumerate() {
            if *byte != 0xFF {
                let bit = byte.trailing_ones() as usize;
                return Some(byte_idx * 8 + bit);
            }
        }
        None
    }

    /// Returns a fresh decode of the before-image snapshot.
    pub fn before_image(&self) -> Result<Self> {
        Self::decode(self.id, &self.old_data)
    }

    /// Overwrites the before-image snapshot with the current contents.
    pub fn set_before_image(&mut self) {
        self.old_data = self.encode();
    }
}

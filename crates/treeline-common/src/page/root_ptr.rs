//! The root-pointer page: one per file, page number 0.

use super::{PageId, PageKind, ROOT_PTR_SIZE};
use crate::error::{Result, TreelineError};
use bytes::{Buf, BufMut};

/// The distinguished first page of a tree file.
///
/// Holds the page number and kind of the current root, and the page number
/// of the first header page. A page number of 0 encodes "none" for both
/// pointers; page 0 is always this page, so the sentinel is unambiguous.
#[derive(Debug, Clone)]
pub struct RootPtrPage {
    id: PageId,
    root: Option<(u32, PageKind)>,
    header: u32,
    old_data: Vec<u8>,
}

impl PartialEq for RootPtrPage {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.root == other.root && self.header == other.header
    }
}

impl RootPtrPage {
    /// Decodes a root-pointer page from its on-disk bytes.
    pub fn decode(id: PageId, data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let root_no = buf.get_i32() as u32;
        let kind_code = buf.get_u8();
        let header = buf.get_i32() as u32;

        let root = if root_no == 0 {
            None
        } else {
            let kind = PageKind::from_code(kind_code)?;
            if kind != PageKind::Leaf && kind != PageKind::Internal {
                return Err(TreelineError::PageCorrupted {
                    page_no: id.page_no,
                    reason: format!("root kind must be leaf or internal, got {}", kind),
                });
            }
            Some((root_no, kind))
        };

        Ok(Self {
            id,
            root,
            header,
            old_data: data.to_vec(),
        })
    }

    /// Encodes this page to exactly [`ROOT_PTR_SIZE`] bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ROOT_PTR_SIZE);
        match self.root {
            Some((no, kind)) => {
                buf.put_i32(no as i32);
                buf.put_u8(kind as u8);
            }
            None => {
                buf.put_i32(0);
                buf.put_u8(0);
            }
        }
        buf.put_i32(self.header as i32);
        debug_assert_eq!(buf.len(), ROOT_PTR_SIZE);
        buf
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// Returns the id of the current root page, or None for an empty tree.
    pub fn root_id(&self) -> Option<PageId> {
        self.root
            .map(|(no, kind)| PageId::new(self.id.table_id, no, kind))
    }

    /// Points the tree at a new root page.
    pub fn set_root_id(&mut self, root: PageId) -> Result<()> {
        if root.table_id != self.id.table_id {
            return Err(TreelineError::InvalidParent(format!(
                "root {} belongs to a different table than {}",
                root, self.id
            )));
        }
        if root.kind != PageKind::Leaf && root.kind != PageKind::Internal {
            return Err(TreelineError::InvalidParent(format!(
                "root must be a leaf or internal page, got {}",
                root.kind
            )));
        }
        self.root = Some((root.page_no, root.kind));
        Ok(())
    }

    /// Returns the id of the first header page, or None if there is none.
    pub fn header_id(&self) -> Option<PageId> {
        if self.header == 0 {
            None
        } else {
            Some(PageId::new(self.id.table_id, self.header, PageKind::Header))
        }
    }

    /// Points the free list at a new first header page.
    pub fn set_header_id(&mut self, header: Option<PageId>) -> Result<()> {
        match header {
            None => self.header = 0,
            Some(pid) => {
                if pid.table_id != self.id.table_id || pid.kind != PageKind::Header {
                    return Err(TreelineError::InvalidParent(format!(
                        "header pointer {} is not a header page of table {}",
                        pid, self.id.table_id
                    )));
                }
                self.header = pid.page_no;
            }
        }
        Ok(())
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

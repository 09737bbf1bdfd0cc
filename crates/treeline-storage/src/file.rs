//! Single-file page store.
//!
//! One file per table: the root-pointer page occupies the first
//! `ROOT_PTR_SIZE` bytes, and page `k >= 1` starts at byte offset
//! `ROOT_PTR_SIZE + (k - 1) * PAGE_SIZE`.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use treeline_buffer::PageSource;
use treeline_common::{
    PageId, PageKind, Result, StorageConfig, TreePage, TreelineError, TupleLayout, PAGE_SIZE,
    ROOT_PTR_SIZE,
};

/// Reads and writes the pages of one B+ tree file.
///
/// All file access is serialized under an internal monitor, which also makes
/// extend and truncate atomic with respect to `num_pages`.
pub struct TreeFile {
    table_id: u32,
    key_field: usize,
    layout: TupleLayout,
    path: PathBuf,
    file: Mutex<File>,
    fsync_enabled: bool,
}

impl TreeFile {
    /// Opens (or creates) the backing file for a table.
    pub fn open(
        path: impl AsRef<Path>,
        table_id: u32,
        key_field: usize,
        layout: TupleLayout,
        config: &StorageConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Ok(Self {
            table_id,
            key_field,
            layout,
            path,
            file: Mutex::new(file),
            fsync_enabled: config.fsync_enabled,
        })
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the index of the key field within the tuple layout.
    pub fn key_field(&self) -> usize {
        self.key_field
    }

    /// Returns the tuple layout of this file.
    pub fn layout(&self) -> &TupleLayout {
        &self.layout
    }

    fn offset_of(pid: PageId) -> u64 {
        match pid.kind {
            PageKind::RootPtr => 0,
            _ => (ROOT_PTR_SIZE + (pid.page_no as usize - 1) * PAGE_SIZE) as u64,
        }
    }

    fn num_pages_locked(file: &File) -> Result<u32> {
        let len = file.metadata()?.len() as usize;
        if len < ROOT_PTR_SIZE {
            Ok(0)
        } else {
            Ok(((len - ROOT_PTR_SIZE) / PAGE_SIZE) as u32)
        }
    }

    /// Returns the number of pages in the file, excluding the root pointer.
    pub fn num_pages(&self) -> Result<u32> {
        Self::num_pages_locked(&self.file.lock())
    }

    /// Writes the blank root-pointer page and one blank page if the file is
    /// empty. The blank page becomes the root leaf on first insert.
    pub fn bootstrap_if_empty(&self) -> Result<()> {
        let mut file = self.file.lock();
        if file.metadata()?.len() == 0 {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&TreePage::empty_bytes(PageKind::RootPtr))?;
            file.write_all(&TreePage::empty_bytes(PageKind::Leaf))?;
            if self.fsync_enabled {
                file.sync_all()?;
            }
            debug!(table_id = self.table_id, "bootstrapped empty tree file");
        }
        Ok(())
    }

    /// Extends the file by one blank page and returns its page number.
    pub fn append_blank_page(&self) -> Result<u32> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(&[0u8; PAGE_SIZE])?;
        if self.fsync_enabled {
            file.sync_all()?;
        }
        let page_no = Self::num_pages_locked(&file)?;
        debug!(table_id = self.table_id, page_no, "extended file by one page");
        Ok(page_no)
    }

    /// Overwrites the given page slot with a blank page image.
    pub fn write_blank_page(&self, page_no: u32) -> Result<()> {
        let mut file = self.file.lock();
        let offset = (ROOT_PTR_SIZE + (page_no as usize - 1) * PAGE_SIZE) as u64;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&[0u8; PAGE_SIZE])?;
        if self.fsync_enabled {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Shrinks the file by one page.
    pub fn truncate_tail(&self) -> Result<()> {
        let file = self.file.lock();
        let len = file.metadata()?.len();
        if len < (ROOT_PTR_SIZE + PAGE_SIZE) as u64 {
            return Err(TreelineError::Internal(
                "cannot truncate a file with no pages".to_string(),
            ));
        }
        file.set_len(len - PAGE_SIZE as u64)?;
        if self.fsync_enabled {
            file.sync_all()?;
        }
        debug!(table_id = self.table_id, "truncated file tail");
        Ok(())
    }

    fn read_page_inner(&self, pid: PageId) -> Result<TreePage> {
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        let offset = Self::offset_of(pid);
        let size = pid.kind.byte_len();
        if offset + size as u64 > len {
            return Err(TreelineError::ReadPastEnd {
                page_no: pid.page_no,
            });
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size];
        file.read_exact(&mut buf)?;
        TreePage::decode(pid, &buf, &self.layout, self.key_field)
    }

    fn write_page_inner(&self, page: &TreePage) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(Self::offset_of(page.id())))?;
        file.write_all(&page.encode())?;
        if self.fsync_enabled {
            file.sync_all()?;
        }
        Ok(())
    }
}

impl PageSource for TreeFile {
    fn table_id(&self) -> u32 {
        self.table_id
    }

    fn read_page(&self, pid: PageId) -> Result<TreePage> {
        self.read_page_inner(pid)
    }

    fn write_page(&self, page: &TreePage) -> Result<()> {
        self.write_page_inner(page)
    }
}

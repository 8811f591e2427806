//! File-backed arena regions
//!
//! A writable trie with a `file_path` keeps its image header and arena inside one shared
//! file mapping, so [`FileRegion::finish`] only has to write the header, flush and truncate.
//! Loading maps an existing image copy-on-write; nothing is read into heap memory.

use crate::error::{PatriciaError, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// A memory-mapped file holding a trie image.
#[derive(Debug)]
pub struct FileRegion {
    mmap: MmapMut,
    ptr: NonNull<u8>,
    file: File,
    path: PathBuf,
    writable: bool,
}

// SAFETY: the mapping is owned by this value; concurrent access to its contents only happens
// through the arena's atomic word view.
unsafe impl Send for FileRegion {}
unsafe impl Sync for FileRegion {}

impl FileRegion {
    /// Create (or truncate) `path` and map `len` bytes of it read-write.
    pub fn create<P: AsRef<Path>>(path: P, len: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(len as u64)?;
        // SAFETY: the file was just created and sized by us; no other mapping aliases it.
        let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let ptr = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| PatriciaError::io_error("file mapping returned null"))?;
        log::debug!("mapped trie file {} ({} bytes)", path.display(), len);
        Ok(Self {
            mmap,
            ptr,
            file,
            path,
            writable: true,
        })
    }

    /// Map an existing image copy-on-write; modifications never reach the file.
    pub fn open_image<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(PatriciaError::corrupted_image("image file is empty"));
        }
        // SAFETY: private copy-on-write mapping; external truncation of the file while mapped
        // is outside the supported usage.
        let mut mmap = unsafe { MmapOptions::new().len(len).map_copy(&file)? };
        let ptr = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| PatriciaError::io_error("file mapping returned null"))?;
        Ok(Self {
            mmap,
            ptr,
            file,
            path,
            writable: false,
        })
    }

    /// Base pointer of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// True when nothing is mapped.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The first `n` bytes of the mapping, for header validation.
    pub fn prefix(&self, n: usize) -> &[u8] {
        &self.mmap[..n.min(self.mmap.len())]
    }

    /// Write `header` at offset 0, flush the mapping and cut the file to `total_len` bytes.
    pub fn finish(&self, header: &[u8], total_len: usize) -> Result<()> {
        if !self.writable {
            return Err(PatriciaError::read_only("finish a copy-on-write image"));
        }
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(header)?;
        self.mmap.flush()?;
        self.file.set_len(total_len as u64)?;
        self.file.sync_all()?;
        log::info!(
            "trie image {} finished at {} bytes",
            self.path.display(),
            total_len
        );
        Ok(())
    }
}

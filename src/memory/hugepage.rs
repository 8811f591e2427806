//! Anonymous arena regions with optional huge page backing
//!
//! A trie arena is reserved once at its full capacity and never moves; pages are committed
//! by the kernel as the bump pointer reaches them. On Linux the reservation is made with
//! `MAP_NORESERVE`, and huge pages can be requested either explicitly (`MAP_HUGETLB`) or
//! transparently (`madvise(MADV_HUGEPAGE)`).

use crate::config::HugePageMode;
use crate::error::{PatriciaError, Result};
use std::ptr::NonNull;

/// Standard hugepage size on x86_64 Linux (2MB)
pub const HUGEPAGE_SIZE_2MB: usize = 2 * 1024 * 1024;

/// Regular page size assumed for commit granularity
pub const PAGE_SIZE: usize = 4096;

/// A zero-initialized anonymous memory region.
pub struct AnonRegion {
    ptr: NonNull<u8>,
    len: usize,
    huge: bool,
}

// SAFETY: the region is plain memory owned exclusively by this value; all shared access
// goes through atomic words handed out by the arena.
unsafe impl Send for AnonRegion {}
unsafe impl Sync for AnonRegion {}

impl AnonRegion {
    /// Reserve `len` bytes of zeroed memory.
    pub fn reserve(len: usize, mode: HugePageMode) -> Result<Self> {
        if len == 0 {
            return Err(PatriciaError::invalid_data("region size cannot be zero"));
        }
        match mode {
            HugePageMode::Mmap => {
                let aligned = align_up(len, HUGEPAGE_SIZE_2MB);
                match Self::map(aligned, true) {
                    Ok(region) => Ok(region),
                    Err(err) => {
                        log::warn!(
                            "MAP_HUGETLB reservation of {} bytes failed ({}), using regular pages",
                            aligned,
                            err
                        );
                        Self::map(align_up(len, PAGE_SIZE), false)
                    }
                }
            }
            HugePageMode::Transparent => {
                let region = Self::map(align_up(len, HUGEPAGE_SIZE_2MB), false)?;
                region.advise_transparent();
                Ok(region)
            }
            HugePageMode::None => Self::map(align_up(len, PAGE_SIZE), false),
        }
    }

    /// Base pointer of the region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; zero-sized regions are rejected at construction.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the region is backed by explicit huge pages.
    #[inline]
    pub fn is_huge(&self) -> bool {
        self.huge
    }

    #[cfg(unix)]
    fn map(len: usize, huge: bool) -> Result<Self> {
        #[cfg(target_os = "linux")]
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        #[cfg(not(target_os = "linux"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;

        #[cfg(target_os = "linux")]
        if huge {
            flags |= libc::MAP_HUGETLB;
        }
        #[cfg(not(target_os = "linux"))]
        if huge {
            return Err(PatriciaError::not_supported(
                "explicit hugepages only supported on Linux",
            ));
        }

        // SAFETY: anonymous mapping request with no address hint; the result is checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PatriciaError::out_of_memory(len));
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| PatriciaError::out_of_memory(len))?;
        Ok(Self { ptr, len, huge })
    }

    #[cfg(not(unix))]
    fn map(len: usize, huge: bool) -> Result<Self> {
        if huge {
            return Err(PatriciaError::not_supported(
                "hugepages only supported on Linux",
            ));
        }
        let layout = std::alloc::Layout::from_size_align(len, PAGE_SIZE)
            .map_err(|_| PatriciaError::out_of_memory(len))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| PatriciaError::out_of_memory(len))?;
        Ok(Self { ptr, len, huge: false })
    }

    fn advise_transparent(&self) {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: the range is exactly the mapping owned by self.
            let rc = unsafe {
                libc::madvise(
                    self.ptr.as_ptr() as *mut libc::c_void,
                    self.len,
                    libc::MADV_HUGEPAGE,
                )
            };
            if rc != 0 {
                log::warn!(
                    "madvise(MADV_HUGEPAGE) failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

impl Drop for AnonRegion {
    fn drop(&mut self) {
        #[cfg(unix)]
        // SAFETY: ptr/len describe a mapping created by `map` and not yet unmapped.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
        #[cfg(not(unix))]
        // SAFETY: allocated in `map` with the same layout.
        unsafe {
            let layout = std::alloc::Layout::from_size_align_unchecked(self.len, PAGE_SIZE);
            std::alloc::dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

impl std::fmt::Debug for AnonRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnonRegion")
            .field("ptr", &(self.ptr.as_ptr() as usize))
            .field("len", &self.len)
            .field("huge", &self.huge)
            .finish()
    }
}

#[inline]
pub(crate) fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_regular() {
        let region = AnonRegion::reserve(10_000, HugePageMode::None).unwrap();
        assert_eq!(region.len(), 12_288);
        assert!(!region.is_huge());
        // SAFETY: freshly mapped, exclusively owned.
        let first = unsafe { *region.as_ptr() };
        assert_eq!(first, 0);
    }

    #[test]
    fn test_reserve_transparent() {
        let region = AnonRegion::reserve(1 << 20, HugePageMode::Transparent).unwrap();
        assert_eq!(region.len(), HUGEPAGE_SIZE_2MB);
    }

    #[test]
    fn test_reserve_explicit_falls_back() {
        // Succeeds whether or not the system has a hugepage pool configured.
        let region = AnonRegion::reserve(1 << 20, HugePageMode::Mmap).unwrap();
        assert!(region.len() >= 1 << 20);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(AnonRegion::reserve(0, HugePageMode::None).is_err());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(8, 4), 8);
        assert_eq!(align_up(4097, PAGE_SIZE), 8192);
    }
}

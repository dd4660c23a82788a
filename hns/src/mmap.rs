//! Device memory mappings.
//!
//! The kernel driver hands out device pages through `mmap(2)` on the command
//! channel's file descriptor, with the page offset encoding a (command, index)
//! pair per [`hns_uapi`]. This module performs those maps and owns the unmap.

use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, BorrowedFd};
use std::ptr::NonNull;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use hns_uapi::{uar_offset, CQ_DB_BUF_SIZE, MMAP_DCA_PAGE, MMAP_REGULAR_PAGE};

use crate::error::{Error, Result};

/// A live device mapping, unmapped on drop.
///
/// Owns the mapping's lifetime only. The contents may be written by the
/// kernel side (the DCA status region is), so holding a `MappedRegion` never
/// implies exclusive access to the bytes behind it.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    fn map(fd: BorrowedFd<'_>, len: usize, offset: i64) -> io::Result<Self> {
        let len_nz = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "length must be non-zero"))?;

        let ptr = unsafe {
            mmap(
                None,
                len_nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                offset,
            )
        }
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        Ok(Self {
            ptr: unsafe { NonNull::new_unchecked(ptr.as_ptr().cast()) },
            len,
        })
    }

    /// Returns a pointer to the start of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Returns the mapping length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // Best effort; an unmap failure must not propagate out of teardown.
        unsafe {
            let _ = munmap(
                NonNull::new_unchecked(self.ptr.as_ptr() as *mut _),
                self.len,
            );
        }
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Maps the doorbell page: one page at regular-page index 0.
pub(crate) fn map_primary<F: AsFd>(fd: &F, page_size: usize) -> Result<MappedRegion> {
    let offset = uar_offset(0, page_size, MMAP_REGULAR_PAGE);
    MappedRegion::map(fd.as_fd(), page_size, offset).map_err(|e| Error::Map {
        command: MMAP_REGULAR_PAGE,
        source: e,
    })
}

/// Maps the legacy completion-queue tail-pointer region at regular-page
/// index 1. Only meaningful on the first hardware generation.
pub(crate) fn map_legacy<F: AsFd>(fd: &F, page_size: usize) -> Result<MappedRegion> {
    let offset = uar_offset(1, page_size, MMAP_REGULAR_PAGE);
    MappedRegion::map(fd.as_fd(), CQ_DB_BUF_SIZE, offset).map_err(|e| Error::Map {
        command: MMAP_REGULAR_PAGE,
        source: e,
    })
}

/// Maps the shared DCA status region at DCA-page index 0.
pub(crate) fn map_dca_status<F: AsFd>(fd: &F, page_size: usize, size: usize) -> Result<MappedRegion> {
    let offset = uar_offset(0, page_size, MMAP_DCA_PAGE);
    MappedRegion::map(fd.as_fd(), size, offset).map_err(|e| Error::Map {
        command: MMAP_DCA_PAGE,
        source: e,
    })
}

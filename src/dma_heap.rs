// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Allocation of DMA-BUFs from the kernel's DMA heaps.
//!
//! A DMA heap is a character device under `/dev/dma_heap/` that hands out DMA-BUF file
//! descriptors of a requested size. These descriptors can then be imported by both the video
//! decoder and the display controller without copying their content.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;
use zerocopy::FromZeroes;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("no DMA heap could be opened among {0:?}")]
    NoHeap(Vec<PathBuf>),
    #[error("failed to open DMA heap {0}: {1}")]
    OpenHeap(PathBuf, io::Error),
    #[error("allocation size cannot be zero")]
    ZeroSize,
    #[error("pool capacity of {0} regions exhausted")]
    CapacityExhausted(usize),
    #[error("allocation of {0} bytes failed: {1}")]
    Allocation(usize, Errno),
    #[error("failed to set size of memfd: {0}")]
    SetSize(io::Error),
    #[error("failed to seal memfd: {0}")]
    Seal(io::Error),
}

/// Source of kernel-backed memory regions.
///
/// Implementors return an owned descriptor for a region of at least `len` bytes. The pool is
/// the only caller of this trait.
pub trait RegionAllocator: Send + Sync {
    /// Human-readable name of the allocator, used for logging.
    fn name(&self) -> String;

    /// Allocate a new region of `len` bytes.
    fn allocate(&self, len: usize) -> Result<OwnedFd, AllocError>;

    /// Whether the descriptors returned by `allocate` are DMA-BUFs, and thus require
    /// `DMA_BUF_IOCTL_SYNC` around CPU accesses.
    fn is_dma_buf(&self) -> bool {
        true
    }
}

#[repr(C)]
#[derive(Debug, FromZeroes)]
struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

nix::ioctl_readwrite!(dma_heap_ioctl_alloc, b'H', 0x0, DmaHeapAllocationData);

/// An opened DMA heap.
///
/// The heap descriptor stays open for as long as this object lives.
pub struct DmaHeap {
    file: File,
    path: PathBuf,
}

impl DmaHeap {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, AllocError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| AllocError::OpenHeap(path.to_path_buf(), e))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Open the first heap of `paths` that can be opened.
    pub fn open_first<P: AsRef<Path>>(paths: &[P]) -> Result<Self, AllocError> {
        for path in paths {
            match Self::open(path) {
                Ok(heap) => {
                    log::debug!("using DMA heap {}", heap.path.display());
                    return Ok(heap);
                }
                Err(e) => log::debug!("{}", e),
            }
        }

        Err(AllocError::NoHeap(
            paths.iter().map(|p| p.as_ref().to_path_buf()).collect(),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegionAllocator for DmaHeap {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn allocate(&self, len: usize) -> Result<OwnedFd, AllocError> {
        if len == 0 {
            return Err(AllocError::ZeroSize);
        }

        let mut data = DmaHeapAllocationData::new_zeroed();
        data.len = len as u64;
        data.fd_flags = (libc::O_RDWR | libc::O_CLOEXEC) as u32;

        // SAFETY: `data` is a properly initialized `dma_heap_allocation_data` and the heap
        // descriptor is valid for the lifetime of `self`.
        unsafe { dma_heap_ioctl_alloc(self.file.as_raw_fd(), &mut data) }
            .map_err(|e| AllocError::Allocation(len, e))?;

        // SAFETY: the kernel returned a new descriptor that nobody else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(data.fd as i32) })
    }
}

/// Direction of a CPU access to a DMA-BUF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAccess {
    Read,
    Write,
    ReadWrite,
}

const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u64 = 1 << 1;
const DMA_BUF_SYNC_START: u64 = 0 << 2;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

#[repr(C)]
#[derive(Debug, FromZeroes)]
struct DmaBufSync {
    flags: u64,
}

nix::ioctl_write_ptr!(dma_buf_ioctl_sync, b'b', 0, DmaBufSync);

fn dma_buf_sync(fd: BorrowedFd, access: SyncAccess, end: bool) -> Result<(), Errno> {
    let mut sync = DmaBufSync::new_zeroed();
    sync.flags = match access {
        SyncAccess::Read => DMA_BUF_SYNC_READ,
        SyncAccess::Write => DMA_BUF_SYNC_WRITE,
        SyncAccess::ReadWrite => DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE,
    };
    sync.flags |= if end {
        DMA_BUF_SYNC_END
    } else {
        DMA_BUF_SYNC_START
    };

    // SAFETY: `sync` is a valid `dma_buf_sync` and `fd` is a valid descriptor.
    unsafe { dma_buf_ioctl_sync(fd.as_raw_fd(), &sync) }.map(|_| ())
}

/// Signal the start of a CPU access to the DMA-BUF `fd`.
pub fn begin_cpu_access(fd: BorrowedFd, access: SyncAccess) -> Result<(), Errno> {
    dma_buf_sync(fd, access, false)
}

/// Signal the end of a CPU access started with [`begin_cpu_access`].
pub fn end_cpu_access(fd: BorrowedFd, access: SyncAccess) -> Result<(), Errno> {
    dma_buf_sync(fd, access, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_heap_available() {
        let dir = tempfile::tempdir().unwrap();
        let paths = [dir.path().join("reserved"), dir.path().join("system")];

        match DmaHeap::open_first(&paths) {
            Err(AllocError::NoHeap(tried)) => assert_eq!(tried.len(), 2),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("no heap should have been opened"),
        }
    }

    #[test]
    fn first_openable_heap_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("linux,cma");
        File::create(&present).unwrap();
        let paths = [dir.path().join("reserved"), present.clone()];

        let heap = DmaHeap::open_first(&paths).unwrap();
        assert_eq!(heap.path(), present.as_path());
        assert!(matches!(heap.allocate(0), Err(AllocError::ZeroSize)));
    }
}

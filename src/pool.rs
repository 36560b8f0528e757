// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ownership tracking of the memory regions shared between the decoder and the display.
//!
//! The [`BufferPool`] is the only component that performs raw allocations. Every region it
//! returns is a reference-counted [`MemoryRegion`] carrying an ownership state. The region's
//! descriptor is closed when the last handle to it is dropped, which happens exactly once.

use std::fmt;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::mman;
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::PoolConfig;
use crate::dma_heap;
use crate::dma_heap::AllocError;
use crate::dma_heap::DmaHeap;
use crate::dma_heap::RegionAllocator;
use crate::dma_heap::SyncAccess;

/// Ownership state of a [`MemoryRegion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Free,
    AllocatedToDecoder,
    Decoded,
    ImportedByDisplay,
    Presented,
}

impl RegionState {
    /// Returns whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: RegionState) -> bool {
        use RegionState::*;

        matches!(
            (self, next),
            (Free, AllocatedToDecoder)
                | (AllocatedToDecoder, Decoded)
                | (Decoded, ImportedByDisplay)
                | (ImportedByDisplay, Presented)
                | (Presented, Free)
                // Release edges for frames that never reach the screen.
                | (AllocatedToDecoder, Free)
                | (Decoded, Free)
                | (ImportedByDisplay, Free)
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal region state transition {from:?} -> {to:?} for region {id}")]
pub struct TransitionError {
    pub id: u64,
    pub from: RegionState,
    pub to: RegionState,
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("mmap call returned error: {0}")]
    Mmap(Errno),
    #[error("DMA-BUF sync failed: {0}")]
    Sync(Errno),
}

/// Accounting shared between a pool and its regions.
#[derive(Debug)]
struct PoolShared {
    capacity: usize,
    outstanding: AtomicUsize,
    next_id: AtomicU64,
}

struct RegionInner {
    id: u64,
    fd: OwnedFd,
    len: usize,
    dma_buf: bool,
    state: Mutex<RegionState>,
    pool: Arc<PoolShared>,
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        let state = *self.state.get_mut();
        if state != RegionState::Free {
            log::debug!("region {} released while in state {:?}", self.id, state);
        }
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        log::trace!("closing region {}", self.id);
        // `self.fd` is closed right after this.
    }
}

/// A kernel-backed memory region.
///
/// Cloning a region creates a new handle to the same memory. The underlying descriptor is
/// closed once all handles have been dropped or [`release`](MemoryRegion::release)d.
#[derive(Clone)]
pub struct MemoryRegion(Arc<RegionInner>);

impl MemoryRegion {
    /// Unique identifier of the region within its pool.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn len(&self) -> usize {
        self.0.len
    }

    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    pub fn state(&self) -> RegionState {
        *self.0.state.lock()
    }

    /// Whether the region is a DMA-BUF that hardware can import.
    pub fn is_dma_buf(&self) -> bool {
        self.0.dma_buf
    }

    /// Move the region to state `to`, returning the previous state.
    pub fn transition(&self, to: RegionState) -> Result<RegionState, TransitionError> {
        let mut state = self.0.state.lock();
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(TransitionError {
                id: self.0.id,
                from,
                to,
            });
        }
        *state = to;
        Ok(from)
    }

    /// Move the region back to `Free` from whichever state it is in, if that edge is legal.
    ///
    /// Returns `false` if the region was in a state that cannot be released directly.
    pub fn release_to_free(&self) -> bool {
        let mut state = self.0.state.lock();
        if *state == RegionState::Free {
            return true;
        }
        if state.can_transition_to(RegionState::Free) {
            *state = RegionState::Free;
            true
        } else {
            false
        }
    }

    /// Number of live handles to this region.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Drop this handle. The descriptor is closed if it was the last one.
    pub fn release(self) {}

    /// Map the region into the address space of the process.
    pub fn map(&self) -> Result<RegionMapping, MapError> {
        // A zero-sized region can never be allocated.
        let len = NonZeroUsize::new(self.0.len).ok_or(MapError::Mmap(Errno::EINVAL))?;

        // SAFETY: `self.0.fd` is a valid descriptor of at least `len` bytes.
        let data = unsafe {
            mman::mmap(
                None,
                len,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_SHARED,
                &self.0.fd,
                0,
            )
        }
        .map_err(MapError::Mmap)?;

        Ok(RegionMapping {
            region: self.clone(),
            data: data.cast(),
            len: len.get(),
            access: None,
        })
    }
}

impl AsFd for MemoryRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("id", &self.0.id)
            .field("len", &self.0.len)
            .field("state", &self.state())
            .finish()
    }
}

/// A CPU mapping of a [`MemoryRegion`].
///
/// The mapping holds a handle to its region, so the region stays alive while it is mapped.
pub struct RegionMapping {
    region: MemoryRegion,
    // A mapping remains valid until we munmap it, that is, until this object is dropped.
    data: NonNull<u8>,
    len: usize,
    access: Option<SyncAccess>,
}

// SAFETY: the mapping is exclusively owned and the memory it points to is shared memory.
unsafe impl Send for RegionMapping {}

impl RegionMapping {
    pub fn size(&self) -> usize {
        self.len
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    /// Make the mapping read-only. This is best effort: failure is logged and reported through
    /// the return value.
    pub fn make_read_only(&mut self) -> bool {
        // SAFETY: `data` and `len` describe a mapping created by `mmap`.
        match unsafe { mman::mprotect(self.data.cast(), self.len, mman::ProtFlags::PROT_READ) } {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "failed to make mapping of region {} read-only: {}",
                    self.region.id(),
                    e
                );
                false
            }
        }
    }

    /// Start a CPU access to the mapped memory. This is a no-op for regions that are not
    /// DMA-BUFs.
    pub fn begin_access(&mut self, access: SyncAccess) -> Result<(), MapError> {
        if self.region.is_dma_buf() {
            dma_heap::begin_cpu_access(self.region.as_fd(), access).map_err(MapError::Sync)?;
        }
        self.access = Some(access);
        Ok(())
    }

    /// End the CPU access started by [`begin_access`](RegionMapping::begin_access).
    pub fn end_access(&mut self) -> Result<(), MapError> {
        match self.access.take() {
            Some(access) if self.region.is_dma_buf() => {
                dma_heap::end_cpu_access(self.region.as_fd(), access).map_err(MapError::Sync)
            }
            _ => Ok(()),
        }
    }
}

impl AsRef<[u8]> for RegionMapping {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: `data` points to `len` mapped bytes that live as long as `self`.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }
}

impl AsMut<[u8]> for RegionMapping {
    fn as_mut(&mut self) -> &mut [u8] {
        // SAFETY: `data` points to `len` mapped bytes that live as long as `self`, and `self` is
        // borrowed mutably.
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }
}

impl Drop for RegionMapping {
    fn drop(&mut self) {
        if let Err(e) = self.end_access() {
            log::error!("error while ending CPU access: {}", e);
        }
        // Safe because the pointer and length were constructed in mmap() and
        // are always valid.
        unsafe { mman::munmap(self.data.cast(), self.len) }.unwrap_or_else(|e| {
            log::error!("error while unmapping region {}: {:#}", self.region.id(), e);
        });
    }
}

/// Allocator of [`MemoryRegion`]s with a bounded number of live regions.
pub struct BufferPool {
    allocator: Arc<dyn RegionAllocator>,
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(allocator: Arc<dyn RegionAllocator>, capacity: usize) -> Self {
        Self {
            allocator,
            shared: Arc::new(PoolShared {
                capacity,
                outstanding: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Create a pool backed by the first DMA heap of `config` that can be opened.
    pub fn open(config: &PoolConfig) -> Result<Self, AllocError> {
        let heap = DmaHeap::open_first(&config.heap_paths)?;
        Ok(Self::new(Arc::new(heap), config.capacity))
    }

    /// Allocate a new region of `size` bytes, in the `Free` state.
    pub fn allocate(&self, size: usize) -> Result<MemoryRegion, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }

        let capacity = self.shared.capacity;
        self.shared
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|_| AllocError::CapacityExhausted(capacity))?;

        let fd = match self.allocator.allocate(size) {
            Ok(fd) => fd,
            Err(e) => {
                self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        };

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "allocated region {} of {} bytes from {}",
            id,
            size,
            self.allocator.name()
        );

        Ok(MemoryRegion(Arc::new(RegionInner {
            id,
            fd,
            len: size,
            dma_buf: self.allocator.is_dma_buf(),
            state: Mutex::new(RegionState::Free),
            pool: Arc::clone(&self.shared),
        })))
    }

    /// Map `region` for CPU access.
    pub fn map(&self, region: &MemoryRegion) -> Result<RegionMapping, MapError> {
        region.map()
    }

    /// Number of regions currently alive.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn allocator(&self) -> &Arc<dyn RegionAllocator> {
        &self.allocator
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;
    use crate::memfd::MemFdAllocator;

    fn memfd_pool(capacity: usize) -> BufferPool {
        BufferPool::new(Arc::new(MemFdAllocator), capacity)
    }

    /// Inode currently behind `fd`, if it is open.
    fn fd_inode(fd: i32) -> Option<u64> {
        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: `stat` is large enough to receive the result.
        if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } < 0 {
            return None;
        }
        // SAFETY: fstat succeeded and initialized `stat`.
        Some(unsafe { stat.assume_init() }.st_ino)
    }

    #[test]
    fn capacity_is_enforced() {
        let pool = memfd_pool(4);
        let regions = (0..4)
            .map(|_| pool.allocate(4096).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(pool.outstanding(), 4);

        assert!(matches!(
            pool.allocate(4096),
            Err(AllocError::CapacityExhausted(4))
        ));

        drop(regions);
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.allocate(4096).is_ok());
    }

    #[test]
    fn zero_size_allocation() {
        let pool = memfd_pool(1);
        assert!(matches!(pool.allocate(0), Err(AllocError::ZeroSize)));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn descriptor_closed_once_after_last_release() {
        let pool = memfd_pool(2);
        let region = pool.allocate(4096).unwrap();
        let raw_fd = region.as_fd().as_raw_fd();
        let inode = fd_inode(raw_fd);
        assert!(inode.is_some());
        let other = region.clone();
        assert_eq!(region.handle_count(), 2);

        region.release();
        assert_eq!(fd_inode(raw_fd), inode);
        assert_eq!(pool.outstanding(), 1);

        other.release();
        // The descriptor number may have been reused by another test, but not for this region.
        assert_ne!(fd_inode(raw_fd), inode);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn state_transitions() {
        let pool = memfd_pool(1);
        let region = pool.allocate(64).unwrap();
        assert_eq!(region.state(), RegionState::Free);

        assert!(region.transition(RegionState::Decoded).is_err());
        region.transition(RegionState::AllocatedToDecoder).unwrap();
        region.transition(RegionState::Decoded).unwrap();
        region.transition(RegionState::ImportedByDisplay).unwrap();
        assert_eq!(
            region.transition(RegionState::AllocatedToDecoder),
            Err(TransitionError {
                id: region.id(),
                from: RegionState::ImportedByDisplay,
                to: RegionState::AllocatedToDecoder,
            })
        );
        region.transition(RegionState::Presented).unwrap();
        assert!(region.release_to_free());
        assert_eq!(region.state(), RegionState::Free);
    }

    #[test]
    fn mapping_shares_memory() {
        let pool = memfd_pool(1);
        let region = pool.allocate(4096).unwrap();

        let mut writer = pool.map(&region).unwrap();
        writer.begin_access(SyncAccess::Write).unwrap();
        writer.as_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        writer.end_access().unwrap();

        let mut reader = region.map().unwrap();
        assert!(reader.make_read_only());
        assert_eq!(&reader.as_ref()[..4], &[1, 2, 3, 4]);

        // Mappings keep the region alive.
        drop(region);
        assert_eq!(pool.outstanding(), 1);
        drop(writer);
        drop(reader);
        assert_eq!(pool.outstanding(), 0);
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Provides a software region allocator using `memfd`.
//!
//! Regions allocated this way can be mapped and shared like DMA-BUFs, but cannot be imported by
//! hardware. They are useful for headless operation and for testing the ownership logic of the
//! pool without a DMA heap.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;

use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MemFdCreateFlag;

use crate::dma_heap::AllocError;
use crate::dma_heap::RegionAllocator;

/// Allocates fixed-size, sealed `memfd` regions.
#[derive(Debug, Default)]
pub struct MemFdAllocator;

impl RegionAllocator for MemFdAllocator {
    fn name(&self) -> String {
        "memfd".into()
    }

    fn allocate(&self, len: usize) -> Result<OwnedFd, AllocError> {
        if len == 0 {
            return Err(AllocError::ZeroSize);
        }

        let fd = memfd_create(c"hwdec-region", MemFdCreateFlag::MFD_ALLOW_SEALING)
            .map_err(|e| AllocError::Allocation(len, e))?;

        let file: File = fd.into();

        file.set_len(len as u64).map_err(AllocError::SetSize)?;

        // Seal so the memory size cannot be changed.
        //
        // SAFETY: `file` is a valid file.
        if unsafe {
            libc::fcntl(
                file.as_raw_fd(),
                libc::F_ADD_SEALS,
                libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_SEAL,
            )
        } < 0
        {
            return Err(AllocError::Seal(std::io::Error::last_os_error()));
        }

        Ok(file.into())
    }

    fn is_dma_buf(&self) -> bool {
        false
    }
}

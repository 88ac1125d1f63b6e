// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest memory backed by a `memfd`.
//!
//! VMMs that allocate the RAM of a guest as a single memfd can share it with the backend through
//! [`MemFdGuestMemory`], which implements [`GuestMemoryBridge`] on top of one host mapping of the
//! whole RAM and keeps track of the mappings handed out to requests.

use core::slice;
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::num::NonZeroU64;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use nix::errno::Errno;
use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MemFdCreateFlag;
use nix::sys::mman;
use thiserror::Error;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::io::LeWrapper;
use crate::io::WireType;
use crate::GuestId;
use crate::GuestMemoryBridge;
use crate::MapError;

/// A chunk of memory allocated through `memfd`.
///
/// Buffers allocated this way are of fixed size, and can be manipulated as files.
pub struct MemFdBuffer {
    file: File,
    size: NonZeroU64,
}

#[derive(Debug, Error)]
pub enum NewMemFdBufferError {
    #[error("MemFdBuffer size cannot be zero")]
    ZeroSize,
    #[error("call to memfd_create failed: {0}")]
    FailedToCreate(#[from] Errno),
    #[error("failed to set size of memfd: {0}")]
    FailedToSetSize(io::Error),
    #[error("failed to seal memfd: {0}")]
    FailedToSeal(io::Error),
}

#[derive(Debug, Error)]
pub enum MemFdMmapError {
    #[error("buffer size {0} larger than usize")]
    BufferTooLarge(u64),
    #[error("mmap call returned error: {0}")]
    Mmap(#[from] Errno),
}

impl MemFdBuffer {
    pub fn new(size: u64) -> Result<Self, NewMemFdBufferError> {
        let size = NonZeroU64::new(size).ok_or(NewMemFdBufferError::ZeroSize)?;

        let fd = memfd_create(c"guest-ram", MemFdCreateFlag::MFD_ALLOW_SEALING)?;

        let file: File = fd.into();

        // Allocate requested size.
        file.set_len(size.into())
            .map_err(NewMemFdBufferError::FailedToSetSize)?;

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
            return Err(NewMemFdBufferError::FailedToSeal(io::Error::last_os_error()));
        }

        Ok(Self { file, size })
    }

    pub fn size(&self) -> u64 {
        self.size.get()
    }

    pub fn mmap(&self) -> Result<MemFdMapping, MemFdMmapError> {
        let size = NonZeroUsize::try_from(self.size)
            .map_err(|_| MemFdMmapError::BufferTooLarge(self.size.into()))?;

        // SAFETY: `self.file` is a valid file.
        let data = unsafe {
            mman::mmap(
                None,
                size,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_SHARED,
                &self.file,
                0,
            )?
        };

        Ok(MemFdMapping {
            // SAFETY: `data` is non-null and obtained through a `mmap` of size `self.size`.
            data: unsafe { slice::from_raw_parts_mut(data.as_ptr().cast(), size.into()) },
        })
    }
}

impl AsFd for MemFdBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// A CPU mapping of a `MemFdBuffer`.
pub struct MemFdMapping {
    // A mapping remains valid until we munmap it, that is, until the
    // MemFdMapping object is deleted. Hence the static lifetime.
    data: &'static mut [u8],
}

impl MemFdMapping {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl Drop for MemFdMapping {
    fn drop(&mut self) {
        // Safe because the pointer and length were constructed in mmap() and
        // are always valid.
        unsafe {
            mman::munmap(
                NonNull::new_unchecked(self.data.as_mut_ptr().cast()),
                self.data.len(),
            )
        }
        .unwrap_or_else(|e| {
            log::error!("error while unmapping MemFdBuffer: {:#}", e);
        });
    }
}

impl AsMut<[u8]> for MemFdMapping {
    fn as_mut(&mut self) -> &mut [u8] {
        self.data
    }
}

#[derive(Debug, Error)]
pub enum NewGuestMemoryError {
    #[error("failed to allocate guest memory: {0}")]
    Alloc(#[from] NewMemFdBufferError),
    #[error("failed to map guest memory: {0}")]
    Mmap(#[from] MemFdMmapError),
}

/// Counters of the mapping activity of a [`MemFdGuestMemory`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MappingStats {
    /// Successful `map` calls.
    pub maps: usize,
    /// `unmap` calls matching a live mapping.
    pub unmaps: usize,
    /// Failed `map` calls.
    pub failures: usize,
}

#[derive(Default)]
struct MappingTable {
    /// Number of live mappings per guest-physical address.
    live: BTreeMap<u64, usize>,
    stats: MappingStats,
}

/// RAM of a single guest, backed by a memfd and mapped once into the host.
///
/// Guest-physical addresses `base..base + size` are valid. Each `map` returns a pointer into the
/// host mapping and is recorded until the matching `unmap`.
pub struct MemFdGuestMemory {
    guest_id: GuestId,
    base: u64,
    size: usize,
    host_base: NonNull<u8>,
    table: Mutex<MappingTable>,
    // Must be dropped before `buffer`.
    _mapping: MemFdMapping,
    buffer: MemFdBuffer,
}

// SAFETY: `host_base` points into `_mapping`, which lives as long as `self`, and all bookkeeping
// is protected by a mutex.
unsafe impl Send for MemFdGuestMemory {}
// SAFETY: see above.
unsafe impl Sync for MemFdGuestMemory {}

impl MemFdGuestMemory {
    /// Allocate `size` bytes of RAM for guest `guest_id`, visible at guest-physical address
    /// `base`.
    pub fn new(guest_id: GuestId, base: u64, size: u64) -> Result<Self, NewGuestMemoryError> {
        let buffer = MemFdBuffer::new(size)?;
        let mut mapping = buffer.mmap()?;
        let size = mapping.size();
        let host_base = NonNull::from(mapping.as_mut()).cast::<u8>();

        Ok(Self {
            guest_id,
            base,
            size,
            host_base,
            table: Default::default(),
            _mapping: mapping,
            buffer,
        })
    }

    fn lock(&self) -> MutexGuard<MappingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Translate `gpa..gpa + len` into an offset of the host mapping.
    fn offset_of(&self, gpa: u64, len: usize) -> Result<usize, MapError> {
        let out_of_range = MapError::OutOfRange { gpa, len };
        let offset = gpa
            .checked_sub(self.base)
            .and_then(|o| usize::try_from(o).ok())
            .ok_or_else(|| out_of_range.clone())?;
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(offset),
            _ => Err(out_of_range),
        }
    }

    pub fn guest_id(&self) -> GuestId {
        self.guest_id
    }

    /// First guest-physical address of the RAM.
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stats(&self) -> MappingStats {
        self.lock().stats
    }

    /// Number of mappings currently live.
    pub fn live_mappings(&self) -> usize {
        self.lock().live.values().sum()
    }

    /// Copy `data` into guest memory at `gpa`, as the guest itself would.
    pub fn write_bytes(&self, gpa: u64, data: &[u8]) -> Result<(), MapError> {
        let offset = self.offset_of(gpa, data.len())?;
        // SAFETY: `offset..offset + data.len()` is within the host mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.host_base.as_ptr().add(offset),
                data.len(),
            )
        };
        Ok(())
    }

    /// Read `len` bytes of guest memory at `gpa`.
    pub fn read_bytes(&self, gpa: u64, len: usize) -> Result<Vec<u8>, MapError> {
        let offset = self.offset_of(gpa, len)?;
        let mut data = vec![0u8; len];
        // SAFETY: `offset..offset + len` is within the host mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.host_base.as_ptr().add(offset),
                data.as_mut_ptr(),
                len,
            )
        };
        Ok(data)
    }

    /// Write `obj` at `gpa` in the little-endian layout the guest uses.
    pub fn write_obj<T: WireType + Copy>(&self, gpa: u64, obj: &T) -> Result<(), MapError> {
        self.write_bytes(gpa, WireType::to_le(*obj).as_bytes())
    }

    pub fn read_obj<T: WireType>(&self, gpa: u64) -> Result<T, MapError> {
        let len = std::mem::size_of::<T>();
        let data = self.read_bytes(gpa, len)?;
        LeWrapper::<T>::read_from(data.as_slice())
            .map(LeWrapper::into_native)
            .ok_or(MapError::OutOfRange { gpa, len })
    }
}

impl AsFd for MemFdGuestMemory {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.buffer.as_fd()
    }
}

impl GuestMemoryBridge for MemFdGuestMemory {
    fn map(&self, guest_id: GuestId, gpa: u64, len: usize) -> Result<NonNull<u8>, MapError> {
        let res = if guest_id != self.guest_id {
            Err(MapError::UnknownGuest(guest_id))
        } else {
            self.offset_of(gpa, len)
        };

        let mut table = self.lock();
        match res {
            Ok(offset) => {
                *table.live.entry(gpa).or_default() += 1;
                table.stats.maps += 1;
                // SAFETY: `offset` is within the host mapping, which is not null.
                Ok(unsafe { NonNull::new_unchecked(self.host_base.as_ptr().add(offset)) })
            }
            Err(e) => {
                table.stats.failures += 1;
                Err(e)
            }
        }
    }

    fn unmap(&self, guest_id: GuestId, gpa: u64) {
        if guest_id != self.guest_id {
            log::error!("unmap requested for unknown guest {}", guest_id);
            return;
        }

        let mut table = self.lock();
        match table.live.get_mut(&gpa) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    table.live.remove(&gpa);
                }
                table.stats.unmaps += 1;
            }
            None => log::error!("unmap of guest address 0x{:x} which is not mapped", gpa),
        }
    }
}

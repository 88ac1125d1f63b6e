// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Request-scoped import of guest memory.
//!
//! Every guest region a request touches is held as a [`GuestMapping`], which unmaps the region
//! when dropped. Handlers therefore cannot leak a mapping past the request, whichever path they
//! return through.

use std::ptr::NonNull;

use log::debug;
use log::error;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::error::StreamError;
use crate::error::StreamResult;
use crate::io::LeWrapper;
use crate::io::WireType;
use crate::protocol::FramePlane;
use crate::protocol::MAX_PAGES_PER_PLANE;
use crate::protocol::PAGE_REF_SIZE;
use crate::protocol::PAGE_SIZE;
use crate::GuestId;
use crate::GuestMemoryBridge;
use crate::MapError;

/// A live mapping of guest memory, released when dropped.
pub struct GuestMapping<'a, B: GuestMemoryBridge + ?Sized> {
    bridge: &'a B,
    guest_id: GuestId,
    gpa: u64,
    ptr: NonNull<u8>,
    len: usize,
}

impl<'a, B: GuestMemoryBridge + ?Sized> GuestMapping<'a, B> {
    /// Map `len` bytes of guest memory at `gpa`.
    pub fn new(bridge: &'a B, guest_id: GuestId, gpa: u64, len: usize) -> Result<Self, MapError> {
        let ptr = bridge.map(guest_id, gpa, len)?;

        Ok(Self {
            bridge,
            guest_id,
            gpa,
            ptr,
            len,
        })
    }

    /// Guest-physical address this mapping starts at.
    pub fn gpa(&self) -> u64 {
        self.gpa
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the bridge guarantees `ptr` is valid for `len` bytes until we unmap it, which
        // only happens when `self` is dropped.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `as_slice`. `&mut self` guarantees exclusive access through this mapping.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Copy an object out of the start of the mapping, converting it from the little-endian
    /// representation used by the guest.
    pub fn read_obj<T: WireType>(&self) -> Result<T, MapError> {
        LeWrapper::<T>::read_from_prefix(self.as_slice())
            .map(LeWrapper::into_native)
            .ok_or(MapError::OutOfRange {
                gpa: self.gpa,
                len: std::mem::size_of::<T>(),
            })
    }

    /// Copy `obj` into the start of the mapping, in little-endian representation.
    pub fn write_obj<T: WireType + Copy>(&mut self, obj: &T) -> Result<(), MapError> {
        let gpa = self.gpa;
        WireType::to_le(*obj)
            .write_to_prefix(self.as_mut_slice())
            .ok_or(MapError::OutOfRange {
                gpa,
                len: std::mem::size_of::<T>(),
            })
    }
}

impl<'a, B: GuestMemoryBridge + ?Sized> Drop for GuestMapping<'a, B> {
    fn drop(&mut self) {
        self.bridge.unmap(self.guest_id, self.gpa);
    }
}

/// Run `f` on a copy of the object of type `T` stored in guest memory at `gpa`, then write the
/// object back.
///
/// The object is written back even if `f` fails, as native devices may report details of the
/// failure in it. The payload is unmapped before returning.
pub fn with_guest_obj<B, T, R, F>(bridge: &B, guest_id: GuestId, gpa: u64, f: F) -> StreamResult<R>
where
    B: GuestMemoryBridge + ?Sized,
    T: WireType + Copy,
    F: FnOnce(&mut T) -> StreamResult<R>,
{
    let mut mapping = GuestMapping::new(bridge, guest_id, gpa, std::mem::size_of::<T>())?;
    let mut obj = mapping.read_obj::<T>()?;

    let res = f(&mut obj);
    mapping.write_obj(&obj)?;

    res
}

/// Guest pages backing one plane of a frame buffer.
///
/// Fields are dropped in declaration order, so the page table is unmapped before the pages.
pub struct PlanePages<'a, B: GuestMemoryBridge + ?Sized> {
    table: GuestMapping<'a, B>,
    pages: Vec<GuestMapping<'a, B>>,
}

impl<'a, B: GuestMemoryBridge + ?Sized> PlanePages<'a, B> {
    /// Import the page table of `plane` and every page it references.
    ///
    /// Acquisition is all-or-nothing: if any page fails to map, the pages mapped so far and the
    /// page table are released and the error is returned.
    pub fn import(bridge: &'a B, guest_id: GuestId, plane: &FramePlane) -> StreamResult<Self> {
        if plane.npages == 0 {
            return Err(StreamError::InvalidDescriptor("plane without pages"));
        }
        if plane.npages > MAX_PAGES_PER_PLANE {
            return Err(StreamError::InvalidDescriptor("too many pages in plane"));
        }
        let npages = plane.npages as usize;

        let table = GuestMapping::new(
            bridge,
            guest_id,
            plane.page_table_ref,
            npages * PAGE_REF_SIZE,
        )
        .map_err(|e| {
            error!("failed to map page table at 0x{:x}: {}", plane.page_table_ref, e);
            e
        })?;
        debug!(
            "mapped page table at 0x{:x} ({} pages)",
            plane.page_table_ref, npages
        );

        let pages = table
            .as_slice()
            .chunks_exact(PAGE_REF_SIZE)
            .filter_map(LeWrapper::<u64>::read_from)
            .map(LeWrapper::into_native)
            .enumerate()
            .map(|(i, page_gpa)| {
                GuestMapping::new(bridge, guest_id, page_gpa, PAGE_SIZE).map_err(|e| {
                    error!("cannot map page {} at 0x{:x}: {}", i, page_gpa, e);
                    e
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { table, pages })
    }

    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Guest-physical address of the page table.
    pub fn table_gpa(&self) -> u64 {
        self.table.gpa()
    }

    /// Mappings of the pages, in page-table order.
    pub fn pages_mut(&mut self) -> &mut [GuestMapping<'a, B>] {
        &mut self.pages
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Traits and implementations for reading requests from and writing responses to the transport.
//!
//! Records exchanged with the frontend use little-endian representation, but there is no
//! guarantee that the host also uses the same endianness. The [`WireType`] trait needs to be
//! implemented for all types transiting through the transport in order to ensure they are
//! converted from/to the correct representation if needed.
//!
//! Requests and responses can be read and written from any type implementing [`std::io::Read`] or
//! [`std::io::Write`] respectively. The [`ReadFromTransport`] and [`WriteToTransport`] sealed
//! extension traits are the only way to read or write records. They ensure that transiting data is
//! always in little-endian representation by using [`WireType`] to wrap it into [`LeWrapper`].

use std::io::Result as IoResult;
use std::mem::MaybeUninit;

use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

#[cfg(target_endian = "little")]
mod le;
#[cfg(target_endian = "little")]
pub use le::*;

#[cfg(target_endian = "big")]
mod be;
#[cfg(target_endian = "big")]
pub use be::*;

use crate::protocol::StreamResponse;

/// Seals for [`ReadFromTransport`] and [`WriteToTransport`] so no new implementations can be
/// created outside of this crate.
mod private {
    pub trait RSealed {}
    impl<R> RSealed for R where R: std::io::Read {}

    pub trait WSealed {}
    impl<W> WSealed for W where W: std::io::Write {}
}

/// Extension trait for reading records posted by the frontend, converting them from little-endian
/// to the native endianness of the system.
pub trait ReadFromTransport: private::RSealed {
    fn read_obj<T: WireType>(&mut self) -> std::io::Result<T>;
}

/// Any implementor of [`std::io::Read`] can be used to read requests.
impl<R> ReadFromTransport for R
where
    R: std::io::Read,
{
    fn read_obj<T: WireType>(&mut self) -> std::io::Result<T> {
        // We use `zeroed` instead of `uninit` because `read_exact` cannot be called with
        // uninitialized memory. Since `T` implements `FromBytes`, its zeroed form is valid and
        // initialized.
        let mut obj: MaybeUninit<LeWrapper<T>> = std::mem::MaybeUninit::zeroed();
        // Safe because the slice boundaries cover `obj`, and the slice doesn't outlive it.
        let slice = unsafe {
            std::slice::from_raw_parts_mut(obj.as_mut_ptr() as *mut u8, std::mem::size_of::<T>())
        };

        self.read_exact(slice)?;

        // Safe because obj can be initialized from an array of bytes.
        Ok(unsafe { obj.assume_init() }.into_native())
    }
}

/// Extension trait for writing records back to the frontend, after converting them to
/// little-endian representation.
pub trait WriteToTransport: private::WSealed {
    /// Write an arbitrary record to the frontend.
    fn write_obj<T: WireType>(&mut self, obj: T) -> IoResult<()>;

    /// Write a completion record.
    fn write_response(&mut self, response: StreamResponse) -> IoResult<()> {
        self.write_obj(response)
    }
}

/// Any implementor of [`std::io::Write`] can be used to write responses.
impl<W> WriteToTransport for W
where
    W: std::io::Write,
{
    fn write_obj<T: WireType>(&mut self, obj: T) -> IoResult<()> {
        self.write_all(obj.to_le().as_bytes())
    }
}

/// Private wrapper for all types that can be sent/received over the transport. Wrapped objects
/// are guaranteed to use little-endian representation.
///
/// Wrapped objects are inaccessible and can only be passed to methods writing to the transport.
/// [`Self::into_native`] can be used to retrieve the object in its native ordering.
#[repr(transparent)]
pub struct LeWrapper<T: WireType>(T);

impl<T: WireType> LeWrapper<T> {
    /// Convert the wrapped object back to native ordering and return it.
    pub fn into_native(self) -> T {
        T::from_le(self)
    }
}

unsafe impl<T: WireType> FromZeroes for LeWrapper<T> {
    fn only_derive_is_allowed_to_implement_this_trait() {}
}

unsafe impl<T: WireType> FromBytes for LeWrapper<T> {
    fn only_derive_is_allowed_to_implement_this_trait() {}
}

unsafe impl<T: WireType> AsBytes for LeWrapper<T> {
    fn only_derive_is_allowed_to_implement_this_trait()
    where
        Self: Sized,
    {
    }
}

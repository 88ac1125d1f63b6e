// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side backend of the paravirtualized IPU camera stream device.
//!
//! The frontend driver of a guest posts requests (open a stream, set its format, queue and
//! retrieve buffers, poll for readiness...) identified by a guest-chosen virtual stream id. This
//! crate services these requests by multiplexing the virtual stream ids onto native stream
//! devices of the host, importing the guest memory each request needs for exactly the duration of
//! the request.
//!
//! The backend is VMM-independent and relies on a handful of traits being implemented to operate
//! on a given VMM:
//!
//! * The guest memory must be made accessible through an implementation of
//!   [`GuestMemoryBridge`]. [`memfd::MemFdGuestMemory`] is a ready-made implementation for VMMs
//!   that back guest RAM with a single memfd.
//! * The native stream device is provided as an implementation of [`NativeStreamDevice`].
//!   [`devices::SimpleStreamDevice`] generates frames in software and can be used to test guests
//!   without camera hardware.
//! * Completions are delivered to the guest through an implementation of [`ResultChannel`].
//!
//! The VMM then wraps these into a [`dispatch::StreamBackend`], and either calls
//! [`dispatch::StreamBackend::handle_command`] for each request read from its transport, or hands
//! requests to [`worker::spawn_request`] to process each of them on its own worker thread. When a
//! guest goes away without closing its streams, [`recovery::RecoveryHandler::reclaim`] releases
//! everything it held.

pub mod config;
#[cfg(feature = "simple-device")]
pub mod devices;
pub mod dispatch;
pub mod error;
pub mod guest_mem;
pub mod io;
pub mod memfd;
pub mod poll;
pub mod protocol;
pub mod recovery;
pub mod registry;
pub mod worker;

#[cfg(test)]
mod test_utils;

use std::ptr::NonNull;

pub use config::BackendConfig;
pub use dispatch::StreamBackend;
pub use error::MapError;
pub use error::StreamError;
pub use poll::ReadyQueue;
pub use recovery::RecoveryHandler;
pub use registry::StreamRegistry;

use protocol::FrameBufWrapper;
use protocol::FrameInfo;
use protocol::StreamFormat;
use protocol::StreamResponse;

/// Identifier of a guest (domain) as supplied by the transport.
pub type GuestId = u32;
/// Guest-chosen identifier of a virtual stream.
pub type StreamId = u32;

/// Trait enabling the host to access guest-physical memory.
///
/// Every successful [`map`](Self::map) must eventually be balanced by an [`unmap`](Self::unmap)
/// of the same address. Devices never call these directly but go through
/// [`guest_mem::GuestMapping`], which guarantees the unmap.
pub trait GuestMemoryBridge: Send + Sync {
    /// Maps `len` bytes of guest `guest_id` starting at guest-physical address `gpa` into the
    /// host's address space.
    ///
    /// The returned pointer must remain valid for reads and writes of `len` bytes until `unmap` is
    /// called for `gpa`.
    fn map(&self, guest_id: GuestId, gpa: u64, len: usize) -> Result<NonNull<u8>, MapError>;

    /// Releases a mapping previously created at `gpa`.
    fn unmap(&self, guest_id: GuestId, gpa: u64);
}

/// An open session of a native stream device.
///
/// Methods take `&self` because a stream can be used concurrently by several workers (a `Poll`
/// blocked on the stream while a `StreamOff` arrives, for instance). Implementations are
/// responsible for their own locking.
///
/// Errors are reported as `libc` error codes.
pub trait NativeStream: Send + Sync {
    /// Tell the native stream which virtual stream id it is bound to.
    fn set_virtual_id(&self, _stream_id: StreamId) {}

    /// Apply `format`, updating it with the format actually negotiated.
    fn set_format(&self, format: &mut StreamFormat) -> Result<(), i32>;

    /// Queue a buffer for capture.
    fn put_buffer(&self, info: &mut FrameInfo) -> Result<(), i32>;

    /// Retrieve a completed buffer into the guest pages `pages`, filling `buffer` with the frame
    /// information.
    fn get_buffer(
        &self,
        buffer: &mut FrameBufWrapper,
        pages: &mut [&mut [u8]],
    ) -> Result<(), i32>;

    fn stream_on(&self) -> Result<(), i32>;

    fn stream_off(&self) -> Result<(), i32>;

    /// Readiness state and wait condition of this stream, used to emulate `poll`.
    fn ready_queue(&self) -> &ReadyQueue;
}

/// A native stream device, able to open stream sessions by node name.
pub trait NativeStreamDevice: Send + Sync {
    type Stream: NativeStream;

    /// Open the native node `name`.
    fn open(&self, name: &str) -> Result<Self::Stream, i32>;

    /// Close a stream. Called exactly once per successfully opened stream.
    fn close(&self, stream: Self::Stream);
}

/// Trait for delivering request completions back to the guest that issued them.
pub trait ResultChannel: Send + Sync {
    fn notify(&self, guest_id: GuestId, response: StreamResponse);
}

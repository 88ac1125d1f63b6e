// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Failure causes of stream requests.
//!
//! The frontend only ever sees [`ReqStatus::Error`] for a failed request. The variants below are
//! kept for host-side diagnostics.

use thiserror::Error;

use crate::poll::PollError;
use crate::protocol::ReqStatus;
use crate::GuestId;
use crate::StreamId;

/// Which guest already holds a stream that is being opened again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    SameGuest,
    OtherGuest(GuestId),
}

impl Owner {
    /// Classifies the holder `owner` of a stream against the guest `requester` trying to open it.
    pub fn of(owner: GuestId, requester: GuestId) -> Self {
        if owner == requester {
            Owner::SameGuest
        } else {
            Owner::OtherGuest(owner)
        }
    }
}

/// Errors returned by a [`crate::GuestMemoryBridge`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MapError {
    #[error("guest memory bridge is unavailable")]
    Unavailable,
    #[error("no memory registered for guest {0}")]
    UnknownGuest(GuestId),
    #[error("range 0x{gpa:x}+0x{len:x} is outside of guest memory")]
    OutOfRange { gpa: u64, len: usize },
    #[error("mapping failed: errno {0}")]
    Failed(i32),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream {stream_id} is not open for guest {guest_id}")]
    NotFound {
        stream_id: StreamId,
        guest_id: GuestId,
    },
    #[error("stream {stream_id} is already open ({owner:?})")]
    AlreadyOpen { stream_id: StreamId, owner: Owner },
    #[error("failed to map guest memory: {0}")]
    Mapping(#[from] MapError),
    #[error("native {op} failed: errno {errno}")]
    Native { op: &'static str, errno: i32 },
    #[error("poll failed: {0}")]
    Poll(#[from] PollError),
    #[error("unsupported command {0}")]
    UnsupportedCommand(u32),
    #[error("invalid stream id {0}")]
    InvalidOperand(u32),
    #[error("invalid buffer descriptor: {0}")]
    InvalidDescriptor(&'static str),
}

impl StreamError {
    /// Status reported to the frontend for this error.
    pub fn status(&self) -> ReqStatus {
        ReqStatus::Error
    }

    /// Helper to build the closure converting a native errno into a [`StreamError::Native`].
    pub fn native(op: &'static str) -> impl FnOnce(i32) -> Self {
        move |errno| StreamError::Native { op, errno }
    }
}

pub type StreamResult<T> = Result<T, StreamError>;

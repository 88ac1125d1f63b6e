// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Since the wire format of the stream protocol uses little-endian, a host using the same ordering
//! does not need to perform any swapping - hence the definitions here are no-ops.

use crate::io::LeWrapper;
use crate::protocol::FrameBufWrapper;
use crate::protocol::FrameInfo;
use crate::protocol::FramePlane;
use crate::protocol::StreamFormat;
use crate::protocol::StreamRequest;
use crate::protocol::StreamResponse;

/// Trait for types that can be sent as part of the stream protocol.
pub trait WireType: Sized {
    fn to_le(self) -> LeWrapper<Self> {
        LeWrapper(self)
    }
    fn from_le(le: LeWrapper<Self>) -> Self {
        le.0
    }
}

impl WireType for () {}
impl WireType for u32 {}
impl WireType for i32 {}
impl WireType for u64 {}

impl WireType for StreamRequest {}
impl WireType for StreamResponse {}
impl WireType for StreamFormat {}
impl WireType for FramePlane {}
impl WireType for FrameInfo {}
impl WireType for FrameBufWrapper {}

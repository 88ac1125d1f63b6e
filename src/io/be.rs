// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Big-endian hosts need to swap every multi-byte field of the records exchanged with the
//! frontend.

use crate::io::LeWrapper;
use crate::protocol::FrameBufWrapper;
use crate::protocol::FrameInfo;
use crate::protocol::FramePlane;
use crate::protocol::StreamFormat;
use crate::protocol::StreamRequest;
use crate::protocol::StreamResponse;

/// Trait for types that can be sent as part of the stream protocol.
pub trait WireType: Sized {
    /// Reverse the byte order of every field. Must be an involution.
    fn swap_fields(self) -> Self;

    fn to_le(self) -> LeWrapper<Self> {
        LeWrapper(self.swap_fields())
    }

    fn from_le(le: LeWrapper<Self>) -> Self {
        le.0.swap_fields()
    }
}

impl WireType for () {
    fn swap_fields(self) -> Self {}
}

macro_rules! wire_int {
    ($($t:ty),*) => {
        $(impl WireType for $t {
            fn swap_fields(self) -> Self {
                self.swap_bytes()
            }
        })*
    };
}

wire_int!(u32, i32, u64);

impl WireType for StreamRequest {
    fn swap_fields(mut self) -> Self {
        self.req_id = self.req_id.swap_bytes();
        self.stat = self.stat.swap_bytes();
        self.cmd = self.cmd.swap_bytes();
        self.func_ret = self.func_ret.swap_bytes();
        self.op = self.op.map(u32::swap_bytes);
        self.payload = self.payload.swap_bytes();
        self
    }
}

impl WireType for StreamResponse {
    fn swap_fields(mut self) -> Self {
        self.req_id = self.req_id.swap_bytes();
        self.stat = self.stat.swap_bytes();
        self.func_ret = self.func_ret.swap_bytes();
        self
    }
}

impl WireType for StreamFormat {
    fn swap_fields(mut self) -> Self {
        for field in [
            &mut self.width,
            &mut self.height,
            &mut self.pixelformat,
            &mut self.field,
            &mut self.colorspace,
            &mut self.bytesperline,
            &mut self.sizeimage,
            &mut self.flags,
        ] {
            *field = field.swap_bytes();
        }
        self
    }
}

impl WireType for FramePlane {
    fn swap_fields(mut self) -> Self {
        self.bytes_used = self.bytes_used.swap_bytes();
        self.length = self.length.swap_bytes();
        self.mem = self.mem.swap_bytes();
        self.page_table_ref = self.page_table_ref.swap_bytes();
        self.npages = self.npages.swap_bytes();
        self.data_offset = self.data_offset.swap_bytes();
        self
    }
}

impl WireType for FrameInfo {
    fn swap_fields(mut self) -> Self {
        for field in [
            &mut self.frame_type,
            &mut self.num_planes,
            &mut self.field,
            &mut self.flag,
            &mut self.frame_buf_id,
            &mut self.sequence,
        ] {
            *field = field.swap_bytes();
        }
        self.timestamp = self.timestamp.swap_bytes();
        self.planes = self.planes.map(FramePlane::swap_fields);
        self
    }
}

impl WireType for FrameBufWrapper {
    fn swap_fields(mut self) -> Self {
        self.frame_info = self.frame_info.swap_fields();
        self.buf_id = self.buf_id.swap_bytes();
        self.state = self.state.swap_bytes();
        self
    }
}

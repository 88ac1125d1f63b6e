// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Request records, command codes and guest-visible payload layouts of the IPU stream protocol.

use enumn::N;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

/// Number of operands carried by every request.
pub const MAX_NUMBER_OF_OPERANDS: usize = 64;
/// Number of native stream nodes a backend can multiplex.
pub const MAX_STREAM_DEVICES: usize = 64;
/// Maximum number of planes a frame buffer can describe.
pub const MAX_PLANES: usize = 3;
/// Upper bound on the number of pages a single plane may reference.
///
/// This is a host-side limit rather than part of the frontend protocol: 8192 pages of
/// [`PAGE_SIZE`] bytes cap a plane at 32 MiB.
pub const MAX_PAGES_PER_PLANE: u32 = 8192;
/// Granularity at which guest pixel buffers are imported.
pub const PAGE_SIZE: usize = 0x1000;
/// Size of one entry of a plane's page table. Guest-physical addresses are 64-bit.
pub const PAGE_REF_SIZE: usize = std::mem::size_of::<u64>();

/// Native node prefix. The virtual stream id is appended in decimal, e.g. `/dev/intel_stream3`.
pub const STREAM_DEVICE_PREFIX: &str = "/dev/intel_stream";

/// Commands understood by the frontend driver.
///
/// Only the stream commands are serviced by this backend. The pipeline and processing-system
/// (`Psys*`) codes belong to companion device classes and are rejected.
#[derive(PartialEq, Eq, PartialOrd, Ord, N, Clone, Copy, Debug)]
#[repr(u32)]
pub enum Command {
    DeviceOpen = 1,
    DeviceClose = 2,
    StreamOn = 3,
    StreamOff = 4,
    GetBuf = 5,
    PutBuf = 6,
    SetFormat = 7,
    EnumNodes = 8,
    EnumLinks = 9,
    SetupPipe = 10,
    SetFramefmt = 11,
    GetFramefmt = 12,
    GetSupportedFramefmt = 13,
    SetSelection = 14,
    GetSelection = 15,
    Poll = 16,
    PipelineOpen = 17,
    PipelineClose = 18,
    PsysMapbuf = 19,
    PsysUnmapbuf = 20,
    PsysQuerycap = 21,
    PsysGetbuf = 22,
    PsysPutbuf = 23,
    PsysQcmd = 24,
    PsysDqevent = 25,
    PsysGetManifest = 26,
    PsysOpen = 27,
    PsysClose = 28,
    PsysPoll = 29,
}

impl Command {
    /// Returns whether this command targets a stream device, i.e. is handled by this backend.
    pub fn is_stream_command(self) -> bool {
        matches!(
            self,
            Command::DeviceOpen
                | Command::DeviceClose
                | Command::StreamOn
                | Command::StreamOff
                | Command::GetBuf
                | Command::PutBuf
                | Command::SetFormat
                | Command::Poll
        )
    }
}

/// Completion status reported back to the frontend in [`StreamResponse::stat`].
#[derive(PartialEq, Eq, N, Clone, Copy, Debug)]
#[repr(i32)]
pub enum ReqStatus {
    Error = -1,
    Processed = 0,
    /// Reserved for asynchronous completion. No handler currently returns it.
    Pending = 1,
    NotResponded = 2,
}

/// A request as posted by the frontend.
#[repr(C)]
#[derive(Clone, Debug, FromZeroes, FromBytes, AsBytes)]
pub struct StreamRequest {
    pub req_id: u32,
    pub stat: i32,
    pub cmd: u32,
    pub func_ret: u32,
    /// `op[0]` is the virtual stream id for every stream command.
    pub op: [u32; MAX_NUMBER_OF_OPERANDS],
    /// Guest-physical address of the command payload, `0` if unused.
    pub payload: u64,
}

impl StreamRequest {
    pub fn new(req_id: u32, cmd: Command, stream_id: u32, payload: u64) -> Self {
        let mut req = Self::new_zeroed();
        req.req_id = req_id;
        req.cmd = cmd as u32;
        req.op[0] = stream_id;
        req.payload = payload;
        req
    }

    pub fn stream_id(&self) -> u32 {
        self.op[0]
    }
}

/// Completion record sent back through the result channel.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
pub struct StreamResponse {
    pub req_id: u32,
    pub stat: i32,
    /// Command-specific return value. `Poll` stores its readiness mask here.
    pub func_ret: u32,
    _padding: u32,
}

impl StreamResponse {
    pub fn new(req_id: u32, status: ReqStatus, func_ret: u32) -> Self {
        Self {
            req_id,
            stat: status as i32,
            func_ret,
            _padding: 0,
        }
    }

    pub fn processed(req_id: u32, func_ret: u32) -> Self {
        Self::new(req_id, ReqStatus::Processed, func_ret)
    }

    pub fn err(req_id: u32) -> Self {
        Self::new(req_id, ReqStatus::Error, 0)
    }

    pub fn status(&self) -> Option<ReqStatus> {
        ReqStatus::n(self.stat)
    }
}

/// Format payload of [`Command::SetFormat`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub colorspace: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub flags: u32,
}

/// One plane of a frame buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
pub struct FramePlane {
    pub bytes_used: u32,
    pub length: u32,
    /// Guest-side handle of the plane memory, opaque to the host.
    pub mem: u64,
    /// Guest-physical address of the plane's page table, an array of `npages` 64-bit
    /// guest-physical page addresses.
    pub page_table_ref: u64,
    pub npages: u32,
    pub data_offset: u32,
}

/// Frame description exchanged with [`Command::PutBuf`], and embedded in [`FrameBufWrapper`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
pub struct FrameInfo {
    pub frame_type: u32,
    pub num_planes: u32,
    pub field: u32,
    pub flag: u32,
    pub frame_buf_id: u32,
    pub sequence: u32,
    pub timestamp: u64,
    pub planes: [FramePlane; MAX_PLANES],
}

/// Buffer descriptor payload of [`Command::GetBuf`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
pub struct FrameBufWrapper {
    pub frame_info: FrameInfo,
    pub buf_id: u32,
    pub state: u32,
}

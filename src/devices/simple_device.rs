// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Simple software stream device with no dependency.
//!
//! This module illustrates how to write a native stream device. It exposes capture streams that
//! generate a YUYV pattern into the buffers queued by the guest.

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use log::debug;
use log::warn;

use crate::protocol::FrameBufWrapper;
use crate::protocol::FrameInfo;
use crate::protocol::StreamFormat;
use crate::protocol::STREAM_DEVICE_PREFIX;
use crate::NativeStream;
use crate::NativeStreamDevice;
use crate::ReadyQueue;
use crate::StreamId;

const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

pub const PIXELFORMAT: u32 = fourcc(b"YUYV");
const BYTES_PER_PIXEL: u32 = 2;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const MAX_DIMENSION: u32 = 8192;
/// Maximum number of buffers a stream accepts before the guest retrieves some.
const MAX_QUEUED_BUFFERS: usize = 32;

const FIELD_NONE: u32 = 1;
const COLORSPACE_SRGB: u32 = 8;

/// Frame interval used to compute timestamps, in nanoseconds.
const FRAME_INTERVAL_NS: u64 = 33_333_333;

fn format_for(width: u32, height: u32) -> StreamFormat {
    let bytesperline = width * BYTES_PER_PIXEL;

    StreamFormat {
        width,
        height,
        pixelformat: PIXELFORMAT,
        field: FIELD_NONE,
        colorspace: COLORSPACE_SRGB,
        bytesperline,
        sizeimage: bytesperline * height,
        flags: 0,
    }
}

/// YUYV macropixel repeated over the whole frame of sequence `sequence`.
pub fn pattern(sequence: u32) -> [u8; 4] {
    let y = 0x10 + (sequence % 0xd0) as u8;
    let u = 0x55 * (sequence % 3) as u8;

    [y, u, y, 0xff - u]
}

/// Fill `len` bytes of `pages` with the pattern of `sequence`, and return the number of bytes
/// actually written.
fn fill_pattern(pages: &mut [&mut [u8]], sequence: u32, len: usize) -> usize {
    let color = pattern(sequence);
    let mut written = 0;

    for page in pages.iter_mut() {
        let n = std::cmp::min(len - written, page.len());
        for (i, byte) in page[..n].iter_mut().enumerate() {
            *byte = color[(written + i) % color.len()];
        }
        written += n;
        if written == len {
            break;
        }
    }

    written
}

struct SimpleStreamState {
    format: StreamFormat,
    streaming: bool,
    /// Current iteration of the pattern generation cycle.
    iteration: u64,
    /// FIFO of buffers queued by the guest, awaiting processing.
    queued: VecDeque<FrameInfo>,
    /// FIFO of processed buffers, awaiting retrieval by the guest.
    done: VecDeque<FrameInfo>,
}

/// Stream of [`SimpleStreamDevice`].
pub struct SimpleStream {
    /// Index of the native node this stream has been opened from.
    index: u32,
    virtual_id: AtomicU32,
    state: Mutex<SimpleStreamState>,
    ready: ReadyQueue,
}

impl SimpleStream {
    fn new(index: u32) -> Self {
        Self {
            index,
            virtual_id: AtomicU32::new(index),
            state: Mutex::new(SimpleStreamState {
                format: format_for(DEFAULT_WIDTH, DEFAULT_HEIGHT),
                streaming: false,
                iteration: 0,
                queued: Default::default(),
                done: Default::default(),
            }),
            ready: ReadyQueue::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn virtual_id(&self) -> StreamId {
        self.virtual_id.load(Ordering::Relaxed)
    }

    /// Current format of the stream.
    pub fn format(&self) -> StreamFormat {
        self.lock().format
    }

    fn lock(&self) -> MutexGuard<SimpleStreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Complete all queued buffers and signal them as ready.
    fn process_queued_buffers(&self, state: &mut SimpleStreamState) {
        while let Some(mut info) = state.queued.pop_front() {
            let sequence = state.iteration as u32;

            info.sequence = sequence;
            info.timestamp = (state.iteration + 1) * FRAME_INTERVAL_NS;
            info.field = state.format.field;
            info.planes[0].bytes_used = state.format.sizeimage;
            state.iteration += 1;

            debug!(
                "stream {}: completed buffer {} (sequence {})",
                self.virtual_id(),
                info.frame_buf_id,
                sequence
            );
            state.done.push_back(info);
            self.ready.push_ready();
        }
    }
}

impl NativeStream for SimpleStream {
    fn set_virtual_id(&self, stream_id: StreamId) {
        self.virtual_id.store(stream_id, Ordering::Relaxed);
    }

    fn set_format(&self, format: &mut StreamFormat) -> Result<(), i32> {
        let mut state = self.lock();
        if state.streaming {
            return Err(libc::EBUSY);
        }
        if !(1..=MAX_DIMENSION).contains(&format.width)
            || !(1..=MAX_DIMENSION).contains(&format.height)
        {
            return Err(libc::EINVAL);
        }

        // Only one pixel format is supported, whatever the guest asks for.
        *format = format_for(format.width, format.height);
        state.format = *format;

        Ok(())
    }

    fn put_buffer(&self, info: &mut FrameInfo) -> Result<(), i32> {
        let mut state = self.lock();
        if state.queued.len() + state.done.len() >= MAX_QUEUED_BUFFERS {
            return Err(libc::ENOBUFS);
        }

        state.queued.push_back(*info);
        if state.streaming {
            self.process_queued_buffers(&mut state);
        }

        Ok(())
    }

    fn get_buffer(
        &self,
        buffer: &mut FrameBufWrapper,
        pages: &mut [&mut [u8]],
    ) -> Result<(), i32> {
        let mut state = self.lock();
        let available = pages.iter().map(|p| p.len()).sum::<usize>();
        if available < state.format.sizeimage as usize {
            return Err(libc::ENOSPC);
        }
        let info = state.done.pop_front().ok_or(libc::EAGAIN)?;
        self.ready.pop_ready();
        drop(state);

        let written = fill_pattern(pages, info.sequence, info.planes[0].bytes_used as usize);

        let frame = &mut buffer.frame_info;
        frame.frame_type = info.frame_type;
        frame.field = info.field;
        frame.flag = info.flag;
        frame.frame_buf_id = info.frame_buf_id;
        frame.sequence = info.sequence;
        frame.timestamp = info.timestamp;
        frame.planes[0].bytes_used = written as u32;
        buffer.buf_id = info.frame_buf_id;

        Ok(())
    }

    fn stream_on(&self) -> Result<(), i32> {
        let mut state = self.lock();
        state.streaming = true;
        self.ready.set_streaming(true);
        self.process_queued_buffers(&mut state);

        Ok(())
    }

    fn stream_off(&self) -> Result<(), i32> {
        let mut state = self.lock();
        state.streaming = false;
        state.queued.clear();
        state.done.clear();
        self.ready.clear();
        self.ready.set_streaming(false);

        Ok(())
    }

    fn ready_queue(&self) -> &ReadyQueue {
        &self.ready
    }
}

/// Native device opening [`SimpleStream`]s for nodes named `<prefix><index>`.
///
/// Each node can only be opened once at a time.
pub struct SimpleStreamDevice {
    prefix: String,
    /// Indices of the nodes currently open.
    open_nodes: Mutex<BTreeSet<u32>>,
}

impl Default for SimpleStreamDevice {
    fn default() -> Self {
        Self::new(STREAM_DEVICE_PREFIX)
    }
}

impl SimpleStreamDevice {
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self {
            prefix: prefix.into(),
            open_nodes: Default::default(),
        }
    }

    /// Number of streams currently open.
    pub fn num_open(&self) -> usize {
        self.open_nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl NativeStreamDevice for SimpleStreamDevice {
    type Stream = SimpleStream;

    fn open(&self, name: &str) -> Result<SimpleStream, i32> {
        let index = name
            .strip_prefix(self.prefix.as_str())
            .and_then(|index| index.parse::<u32>().ok())
            .ok_or(libc::ENOENT)?;

        let mut open_nodes = self.open_nodes.lock().unwrap_or_else(PoisonError::into_inner);
        if !open_nodes.insert(index) {
            return Err(libc::EBUSY);
        }

        debug!("opened simple stream {}", name);
        Ok(SimpleStream::new(index))
    }

    fn close(&self, stream: SimpleStream) {
        if let Err(e) = stream.stream_off() {
            warn!("failed to stop simple stream {} on close: {}", stream.index, e);
        }
        self.open_nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&stream.index);
        debug!("closed simple stream {}", stream.index);
    }
}

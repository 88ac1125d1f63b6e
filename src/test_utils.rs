// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Native device doubles shared by the unit tests.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::protocol::FrameBufWrapper;
use crate::protocol::FrameInfo;
use crate::protocol::StreamFormat;
use crate::NativeStream;
use crate::NativeStreamDevice;
use crate::ReadyQueue;
use crate::StreamId;

/// Stream that records what it is asked to do, and fails every operation with `fail_errno` if it
/// is non-zero.
#[derive(Default)]
pub struct DummyStream {
    pub virtual_id: AtomicU32,
    pub fail_errno: AtomicI32,
    pub format: Mutex<Option<StreamFormat>>,
    pub put_buffers: AtomicUsize,
    /// Number of pages received by each `get_buffer` call.
    pub get_pages: Mutex<Vec<usize>>,
    pub ready: ReadyQueue,
}

impl DummyStream {
    pub fn fail_with(&self, errno: i32) {
        self.fail_errno.store(errno, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), i32> {
        match self.fail_errno.load(Ordering::SeqCst) {
            0 => Ok(()),
            errno => Err(errno),
        }
    }
}

impl NativeStream for DummyStream {
    fn set_virtual_id(&self, stream_id: StreamId) {
        self.virtual_id.store(stream_id, Ordering::SeqCst);
    }

    fn set_format(&self, format: &mut StreamFormat) -> Result<(), i32> {
        self.check()?;
        format.sizeimage = format.width * format.height * 2;
        *self.format.lock().unwrap() = Some(*format);
        Ok(())
    }

    fn put_buffer(&self, _info: &mut FrameInfo) -> Result<(), i32> {
        self.check()?;
        self.put_buffers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_buffer(
        &self,
        buffer: &mut FrameBufWrapper,
        pages: &mut [&mut [u8]],
    ) -> Result<(), i32> {
        self.check()?;
        self.get_pages.lock().unwrap().push(pages.len());
        for page in pages.iter_mut() {
            page.fill(0xa5);
        }
        buffer.frame_info.sequence = 42;
        self.ready.pop_ready();
        Ok(())
    }

    fn stream_on(&self) -> Result<(), i32> {
        self.check()?;
        self.ready.set_streaming(true);
        Ok(())
    }

    fn stream_off(&self) -> Result<(), i32> {
        self.check()?;
        self.ready.set_streaming(false);
        Ok(())
    }

    fn ready_queue(&self) -> &ReadyQueue {
        &self.ready
    }
}

/// Device counting opened and closed streams.
#[derive(Default)]
pub struct DummyDevice {
    opened: AtomicUsize,
    closed: AtomicUsize,
    pub fail_open: AtomicBool,
    pub names: Mutex<Vec<String>>,
}

impl DummyDevice {
    pub fn open_stream(&self) -> DummyStream {
        self.opened.fetch_add(1, Ordering::SeqCst);
        DummyStream::default()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl NativeStreamDevice for DummyDevice {
    type Stream = DummyStream;

    fn open(&self, name: &str) -> Result<DummyStream, i32> {
        self.names.lock().unwrap().push(name.to_string());
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(libc::ENOENT);
        }
        Ok(self.open_stream())
    }

    fn close(&self, _stream: DummyStream) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

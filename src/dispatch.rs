// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Servicing of stream requests.
//!
//! [`StreamBackend`] owns the registry of open streams and turns each request of a guest into
//! calls to the native stream device, importing the guest memory the request carries for the
//! duration of the call.

use std::sync::Arc;

use anyhow::Context;
use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::config::BackendConfig;
use crate::error::Owner;
use crate::error::StreamError;
use crate::error::StreamResult;
use crate::guest_mem::with_guest_obj;
use crate::guest_mem::GuestMapping;
use crate::guest_mem::PlanePages;
use crate::io::ReadFromTransport;
use crate::io::WriteToTransport;
use crate::protocol::Command;
use crate::protocol::FrameBufWrapper;
use crate::protocol::FrameInfo;
use crate::protocol::StreamFormat;
use crate::protocol::StreamRequest;
use crate::protocol::StreamResponse;
use crate::protocol::MAX_PLANES;
use crate::recovery::RecoveryHandler;
use crate::registry::StreamEntry;
use crate::registry::StreamRegistry;
use crate::GuestId;
use crate::GuestMemoryBridge;
use crate::NativeStream;
use crate::NativeStreamDevice;
use crate::StreamId;

/// Readiness mask returned by a successful `Poll`.
const POLL_READABLE: u32 = libc::POLLIN as u32;

/// Backend servicing the stream requests of any number of guests.
///
/// All methods take `&self`, so a backend wrapped into an `Arc` can serve requests from several
/// worker threads at once.
pub struct StreamBackend<D: NativeStreamDevice, B: GuestMemoryBridge> {
    device: Arc<D>,
    mem: B,
    registry: Arc<StreamRegistry<D>>,
    config: BackendConfig,
}

impl<D, B> StreamBackend<D, B>
where
    D: NativeStreamDevice,
    B: GuestMemoryBridge,
{
    pub fn new(device: D, mem: B, config: BackendConfig) -> Self {
        Self {
            device: Arc::new(device),
            mem,
            registry: Arc::new(StreamRegistry::new()),
            config,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn guest_memory(&self) -> &B {
        &self.mem
    }

    pub fn registry(&self) -> &Arc<StreamRegistry<D>> {
        &self.registry
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Returns a handler able to release the streams of guests that went away.
    pub fn recovery(&self) -> RecoveryHandler<D> {
        RecoveryHandler::new(Arc::clone(&self.registry))
    }

    /// Read a single request from `reader`, process it, and write its response to `writer`.
    ///
    /// This method never returns an error, as doing so would halt the caller's transport loop.
    /// Failures of the request itself are reported to the guest through the response status;
    /// failures to read the request or write the response are logged on the host side.
    pub fn handle_command<R, W>(&self, guest_id: GuestId, reader: &mut R, writer: &mut W)
    where
        R: std::io::Read,
        W: std::io::Write,
    {
        let res = reader
            .read_obj::<StreamRequest>()
            .context("while reading request")
            .and_then(|request| {
                let response = self.handle_request(guest_id, &request);
                writer
                    .write_response(response)
                    .with_context(|| {
                        format!("while writing response to request {}", request.req_id)
                    })
            });

        if let Err(e) = res {
            error!("error while processing request of guest {}: {:#}", guest_id, e);
        }
    }

    /// Process `request` on behalf of `guest_id` and return its completion record.
    pub fn handle_request(&self, guest_id: GuestId, request: &StreamRequest) -> StreamResponse {
        match self.dispatch(guest_id, request) {
            Ok(func_ret) => StreamResponse::processed(request.req_id, func_ret),
            Err(e) => {
                match e {
                    StreamError::NotFound { .. } => warn!(
                        "guest {} request {} (cmd {}): {}",
                        guest_id, request.req_id, request.cmd, e
                    ),
                    _ => error!(
                        "guest {} request {} (cmd {}): {}",
                        guest_id, request.req_id, request.cmd, e
                    ),
                }
                StreamResponse::new(request.req_id, e.status(), 0)
            }
        }
    }

    /// Run the handler of `request` and return its function return value.
    fn dispatch(&self, guest_id: GuestId, request: &StreamRequest) -> StreamResult<u32> {
        let cmd = Command::n(request.cmd)
            .filter(|cmd| cmd.is_stream_command())
            .ok_or(StreamError::UnsupportedCommand(request.cmd))?;
        let stream_id = request.stream_id();
        let payload = request.payload;

        debug!(
            "guest {} request {}: {:?} on stream {}",
            guest_id, request.req_id, cmd, stream_id
        );

        let res = match cmd {
            Command::DeviceOpen => self.device_open(guest_id, stream_id),
            Command::DeviceClose => self.device_close(guest_id, stream_id),
            Command::SetFormat => self.set_format(guest_id, stream_id, payload),
            Command::StreamOn => self.stream_on(guest_id, stream_id),
            Command::StreamOff => self.stream_off(guest_id, stream_id),
            Command::PutBuf => self.put_buffer(guest_id, stream_id, payload),
            Command::GetBuf => self.get_buffer(guest_id, stream_id, payload),
            Command::Poll => return self.poll(guest_id, stream_id),
            _ => Err(StreamError::UnsupportedCommand(request.cmd)),
        };

        res.map(|()| 0)
    }

    /// Returns the entry of `stream_id` if it has been opened by `guest_id`.
    fn find_stream(
        &self,
        guest_id: GuestId,
        stream_id: StreamId,
    ) -> StreamResult<Arc<StreamEntry<D>>> {
        self.registry
            .lookup_owned(stream_id, guest_id)
            .ok_or(StreamError::NotFound {
                stream_id,
                guest_id,
            })
    }

    fn device_open(&self, guest_id: GuestId, stream_id: StreamId) -> StreamResult<()> {
        if stream_id as usize >= self.config.max_streams {
            return Err(StreamError::InvalidOperand(stream_id));
        }

        // Fail early without touching the native device if the stream is already bound. The
        // insertion below settles concurrent opens.
        if let Some(entry) = self.registry.lookup(stream_id) {
            return Err(StreamError::AlreadyOpen {
                stream_id,
                owner: Owner::of(entry.guest_id(), guest_id),
            });
        }

        let name = self.config.device_name(stream_id);
        let stream = self
            .device
            .open(&name)
            .map_err(StreamError::native("open"))?;
        stream.set_virtual_id(stream_id);

        let entry = StreamEntry::new(stream_id, guest_id, Arc::clone(&self.device), stream);
        self.registry
            .insert_if_absent(entry)
            .map_err(|owner| StreamError::AlreadyOpen { stream_id, owner })?;

        info!("guest {} opened {} as stream {}", guest_id, name, stream_id);
        Ok(())
    }

    fn device_close(&self, guest_id: GuestId, stream_id: StreamId) -> StreamResult<()> {
        let entry = self
            .registry
            .remove_owned(stream_id, guest_id)
            .ok_or(StreamError::NotFound {
                stream_id,
                guest_id,
            })?;

        // Pollers still hold a reference to the entry, and the native stream is closed once the
        // last one returns.
        entry.stream().ready_queue().interrupt();
        info!("guest {} closed stream {}", guest_id, stream_id);

        Ok(())
    }

    fn set_format(&self, guest_id: GuestId, stream_id: StreamId, payload: u64) -> StreamResult<()> {
        let entry = self.find_stream(guest_id, stream_id)?;

        with_guest_obj(&self.mem, guest_id, payload, |format: &mut StreamFormat| {
            entry
                .stream()
                .set_format(format)
                .map_err(StreamError::native("set_format"))
        })
    }

    fn stream_on(&self, guest_id: GuestId, stream_id: StreamId) -> StreamResult<()> {
        self.find_stream(guest_id, stream_id)?
            .stream()
            .stream_on()
            .map_err(StreamError::native("stream_on"))
    }

    fn stream_off(&self, guest_id: GuestId, stream_id: StreamId) -> StreamResult<()> {
        let entry = self.find_stream(guest_id, stream_id)?;
        let stream = entry.stream();

        stream
            .stream_off()
            .map_err(StreamError::native("stream_off"))?;
        stream.ready_queue().wake_all();

        Ok(())
    }

    fn put_buffer(&self, guest_id: GuestId, stream_id: StreamId, payload: u64) -> StreamResult<()> {
        let entry = self.find_stream(guest_id, stream_id)?;

        with_guest_obj(&self.mem, guest_id, payload, |info: &mut FrameInfo| {
            entry
                .stream()
                .put_buffer(info)
                .map_err(StreamError::native("put_buffer"))
        })
    }

    /// Import the buffer described at `payload` together with all its guest pages, and have the
    /// native stream fill it with the next completed frame.
    ///
    /// Either every page of every plane is mapped and the native device is called, or nothing
    /// remains mapped and the request fails.
    fn get_buffer(&self, guest_id: GuestId, stream_id: StreamId, payload: u64) -> StreamResult<()> {
        let entry = self.find_stream(guest_id, stream_id)?;

        let mut descriptor = GuestMapping::new(
            &self.mem,
            guest_id,
            payload,
            std::mem::size_of::<FrameBufWrapper>(),
        )?;
        let mut buffer = descriptor.read_obj::<FrameBufWrapper>()?;

        // Single-plane frontends leave `num_planes` unset.
        let num_planes = match buffer.frame_info.num_planes as usize {
            0 => 1,
            n if n <= MAX_PLANES => n,
            _ => return Err(StreamError::InvalidDescriptor("too many planes")),
        };

        let mut planes = buffer.frame_info.planes[..num_planes]
            .iter()
            .map(|plane| PlanePages::import(&self.mem, guest_id, plane))
            .collect::<StreamResult<Vec<_>>>()?;
        let mut pages = planes
            .iter_mut()
            .flat_map(|plane| plane.pages_mut().iter_mut())
            .map(GuestMapping::as_mut_slice)
            .collect::<Vec<_>>();
        debug!(
            "stream {}: retrieving buffer into {} guest pages",
            stream_id,
            pages.len()
        );

        let res = entry
            .stream()
            .get_buffer(&mut buffer, &mut pages)
            .map_err(StreamError::native("get_buffer"));

        drop(pages);
        drop(planes);
        descriptor.write_obj(&buffer)?;

        res
    }

    fn poll(&self, guest_id: GuestId, stream_id: StreamId) -> StreamResult<u32> {
        let entry = self.find_stream(guest_id, stream_id)?;

        entry
            .stream()
            .ready_queue()
            .wait_ready(self.config.poll_timeout)?;

        Ok(POLL_READABLE)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::ptr::NonNull;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;
    use std::time::Instant;

    use zerocopy::AsBytes;

    use crate::config::BackendConfig;
    use crate::error::Owner;
    use crate::error::StreamError;
    use crate::io::ReadFromTransport;
    use crate::memfd::MemFdGuestMemory;
    use crate::poll::PollError;
    use crate::protocol::Command;
    use crate::protocol::FrameBufWrapper;
    use crate::protocol::FrameInfo;
    use crate::protocol::FramePlane;
    use crate::protocol::ReqStatus;
    use crate::protocol::StreamFormat;
    use crate::protocol::StreamRequest;
    use crate::protocol::StreamResponse;
    use crate::protocol::PAGE_SIZE;
    use crate::test_utils::DummyDevice;
    use crate::GuestId;
    use crate::GuestMemoryBridge;
    use crate::MapError;

    use super::StreamBackend;

    const GUEST: GuestId = 1;
    const OTHER_GUEST: GuestId = 2;
    const BASE: u64 = 0x4000_0000;
    const MEM_SIZE: u64 = 0x40_0000;

    const PAYLOAD: u64 = BASE;
    const PAGE_TABLE: u64 = BASE + 0x1000;
    const PAGES: u64 = BASE + 0x10_0000;

    type TestBackend = StreamBackend<DummyDevice, MemFdGuestMemory>;

    fn backend_with(config: BackendConfig) -> TestBackend {
        let mem = MemFdGuestMemory::new(GUEST, BASE, MEM_SIZE).unwrap();
        StreamBackend::new(DummyDevice::default(), mem, config)
    }

    fn backend() -> TestBackend {
        backend_with(BackendConfig::default())
    }

    fn request(
        backend: &TestBackend,
        guest: GuestId,
        cmd: Command,
        stream_id: u32,
        payload: u64,
    ) -> Result<u32, StreamError> {
        backend.dispatch(guest, &StreamRequest::new(0, cmd, stream_id, payload))
    }

    fn open(backend: &TestBackend, stream_id: u32) {
        request(backend, GUEST, Command::DeviceOpen, stream_id, 0).unwrap();
    }

    /// Lay out a single-plane buffer of `npages` pages in guest memory, with page `bad_page`
    /// pointing outside of it.
    fn setup_buffer(mem: &MemFdGuestMemory, npages: u32, bad_page: Option<usize>) {
        let table = (0..npages as usize)
            .map(|i| match bad_page {
                Some(bad) if bad == i => 0x10u64,
                _ => PAGES + (i * PAGE_SIZE) as u64,
            })
            .map(u64::to_le)
            .collect::<Vec<_>>();
        mem.write_bytes(PAGE_TABLE, table.as_bytes()).unwrap();

        let mut buffer = FrameBufWrapper::default();
        buffer.frame_info.num_planes = 1;
        buffer.frame_info.planes[0] = FramePlane {
            length: npages * PAGE_SIZE as u32,
            page_table_ref: PAGE_TABLE,
            npages,
            ..Default::default()
        };
        mem.write_obj(PAYLOAD, &buffer).unwrap();
    }

    #[test]
    fn open_close() {
        let backend = backend();
        open(&backend, 3);
        assert_eq!(backend.device().opened(), 1);
        assert_eq!(*backend.device().names.lock().unwrap(), vec!["/dev/intel_stream3"]);

        let entry = backend.registry().lookup(3).unwrap();
        assert_eq!(entry.guest_id(), GUEST);
        assert_eq!(entry.stream().virtual_id.load(Ordering::SeqCst), 3);
        drop(entry);

        request(&backend, GUEST, Command::DeviceClose, 3, 0).unwrap();
        assert!(backend.registry().is_empty());
        assert_eq!(backend.device().closed(), 1);

        assert_eq!(
            request(&backend, GUEST, Command::DeviceClose, 3, 0),
            Err(StreamError::NotFound {
                stream_id: 3,
                guest_id: GUEST
            })
        );
        assert_eq!(backend.device().closed(), 1);
    }

    #[test]
    fn open_failures() {
        let backend = backend_with(BackendConfig::default().with_max_streams(4));
        assert_eq!(
            request(&backend, GUEST, Command::DeviceOpen, 4, 0),
            Err(StreamError::InvalidOperand(4))
        );

        backend.device().fail_open.store(true, Ordering::SeqCst);
        assert_eq!(
            request(&backend, GUEST, Command::DeviceOpen, 1, 0),
            Err(StreamError::Native {
                op: "open",
                errno: libc::ENOENT
            })
        );
        assert!(backend.registry().is_empty());
        backend.device().fail_open.store(false, Ordering::SeqCst);

        open(&backend, 1);
        assert_eq!(
            request(&backend, GUEST, Command::DeviceOpen, 1, 0),
            Err(StreamError::AlreadyOpen {
                stream_id: 1,
                owner: Owner::SameGuest
            })
        );
        // The native device is not touched for an already bound stream.
        assert_eq!(backend.device().names.lock().unwrap().len(), 2);
    }

    #[test]
    fn open_by_other_guest() {
        let backend = backend();
        open(&backend, 5);

        assert_eq!(
            request(&backend, OTHER_GUEST, Command::DeviceOpen, 5, 0),
            Err(StreamError::AlreadyOpen {
                stream_id: 5,
                owner: Owner::OtherGuest(GUEST)
            })
        );
        // The other guest can neither use nor close the stream.
        assert!(matches!(
            request(&backend, OTHER_GUEST, Command::StreamOn, 5, 0),
            Err(StreamError::NotFound { .. })
        ));
        assert!(matches!(
            request(&backend, OTHER_GUEST, Command::DeviceClose, 5, 0),
            Err(StreamError::NotFound { .. })
        ));

        let entry = backend.registry().lookup(5).unwrap();
        assert_eq!(entry.guest_id(), GUEST);
        assert!(!entry.stream().ready.is_streaming());
        assert_eq!(backend.device().closed(), 0);
    }

    #[test]
    fn concurrent_open() {
        const THREADS: usize = 8;

        let backend = Arc::new(backend());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles = (0..THREADS)
            .map(|i| {
                let backend = Arc::clone(&backend);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let req = StreamRequest::new(i as u32, Command::DeviceOpen, 9, 0);
                    backend.handle_request(GUEST + i as u32, &req).status()
                })
            })
            .collect::<Vec<_>>();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&status| status == Some(ReqStatus::Processed))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(backend.registry().len(), 1);
        // Losers that got to open the native device released it.
        assert_eq!(
            backend.device().opened() - backend.device().closed(),
            1
        );
    }

    #[test]
    fn concurrent_close() {
        const THREADS: usize = 8;

        let backend = Arc::new(backend());
        open(&backend, 3);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles = (0..THREADS)
            .map(|i| {
                let backend = Arc::clone(&backend);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let req = StreamRequest::new(i as u32, Command::DeviceClose, 3, 0);
                    backend.handle_request(GUEST, &req).status()
                })
            })
            .collect::<Vec<_>>();

        let statuses = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>();
        let count = |wanted| statuses.iter().filter(|&&status| status == Some(wanted)).count();
        assert_eq!(count(ReqStatus::Processed), 1);
        // Every other close found no stream left.
        assert_eq!(count(ReqStatus::Error), THREADS - 1);
        assert!(backend.registry().is_empty());
        assert_eq!(backend.device().opened(), 1);
        assert_eq!(backend.device().closed(), 1);
    }

    #[test]
    fn commands_without_stream() {
        let backend = backend();
        for cmd in [
            Command::DeviceClose,
            Command::SetFormat,
            Command::StreamOn,
            Command::StreamOff,
            Command::PutBuf,
            Command::GetBuf,
            Command::Poll,
        ] {
            assert_eq!(
                request(&backend, GUEST, cmd, 2, PAYLOAD),
                Err(StreamError::NotFound {
                    stream_id: 2,
                    guest_id: GUEST
                }),
                "{:?}",
                cmd
            );
        }
        assert_eq!(backend.guest_memory().stats().maps, 0);
    }

    #[test]
    fn unsupported_commands() {
        let backend = backend();
        open(&backend, 0);

        assert_eq!(
            request(&backend, GUEST, Command::PsysQcmd, 0, 0),
            Err(StreamError::UnsupportedCommand(Command::PsysQcmd as u32))
        );
        assert_eq!(
            request(&backend, GUEST, Command::EnumNodes, 0, 0),
            Err(StreamError::UnsupportedCommand(Command::EnumNodes as u32))
        );

        let mut req = StreamRequest::new(4, Command::DeviceOpen, 0, 0);
        req.cmd = 0xdead;
        assert_eq!(
            backend.dispatch(GUEST, &req),
            Err(StreamError::UnsupportedCommand(0xdead))
        );
        assert_eq!(
            backend.handle_request(GUEST, &req),
            StreamResponse::err(4)
        );
    }

    #[test]
    fn set_format() {
        let backend = backend();
        open(&backend, 0);
        let format = StreamFormat {
            width: 1920,
            height: 1080,
            ..Default::default()
        };
        backend.guest_memory().write_obj(PAYLOAD, &format).unwrap();

        request(&backend, GUEST, Command::SetFormat, 0, PAYLOAD).unwrap();

        // The negotiated format is written back to the guest.
        let written = backend
            .guest_memory()
            .read_obj::<StreamFormat>(PAYLOAD)
            .unwrap();
        assert_eq!(written.sizeimage, 1920 * 1080 * 2);
        let entry = backend.registry().lookup(0).unwrap();
        assert_eq!(*entry.stream().format.lock().unwrap(), Some(written));

        let stats = backend.guest_memory().stats();
        assert_eq!((stats.maps, stats.unmaps), (1, 1));

        assert!(matches!(
            request(&backend, GUEST, Command::SetFormat, 0, 0x10),
            Err(StreamError::Mapping(MapError::OutOfRange { .. }))
        ));
        entry.stream().fail_with(libc::EINVAL);
        assert_eq!(
            request(&backend, GUEST, Command::SetFormat, 0, PAYLOAD),
            Err(StreamError::Native {
                op: "set_format",
                errno: libc::EINVAL
            })
        );
        assert_eq!(backend.guest_memory().live_mappings(), 0);
    }

    #[test]
    fn put_buffer_and_streaming() {
        let backend = backend();
        open(&backend, 0);
        backend
            .guest_memory()
            .write_obj(PAYLOAD, &FrameInfo::default())
            .unwrap();

        request(&backend, GUEST, Command::PutBuf, 0, PAYLOAD).unwrap();
        request(&backend, GUEST, Command::StreamOn, 0, 0).unwrap();
        let entry = backend.registry().lookup(0).unwrap();
        assert_eq!(entry.stream().put_buffers.load(Ordering::SeqCst), 1);
        assert!(entry.stream().ready.is_streaming());

        request(&backend, GUEST, Command::StreamOff, 0, 0).unwrap();
        assert!(!entry.stream().ready.is_streaming());

        entry.stream().fail_with(libc::EIO);
        assert_eq!(
            request(&backend, GUEST, Command::StreamOn, 0, 0),
            Err(StreamError::Native {
                op: "stream_on",
                errno: libc::EIO
            })
        );
        assert!(matches!(
            request(&backend, GUEST, Command::PutBuf, 0, PAYLOAD),
            Err(StreamError::Native {
                op: "put_buffer",
                ..
            })
        ));
        assert_eq!(backend.guest_memory().live_mappings(), 0);
    }

    #[test]
    fn get_buffer() {
        const NPAGES: u32 = 5;

        let backend = backend();
        open(&backend, 0);
        setup_buffer(backend.guest_memory(), NPAGES, None);

        request(&backend, GUEST, Command::GetBuf, 0, PAYLOAD).unwrap();

        let entry = backend.registry().lookup(0).unwrap();
        assert_eq!(*entry.stream().get_pages.lock().unwrap(), vec![NPAGES as usize]);
        let mem = backend.guest_memory();
        let last_page = PAGES + ((NPAGES - 1) as usize * PAGE_SIZE) as u64;
        assert_eq!(mem.read_bytes(last_page, PAGE_SIZE).unwrap(), vec![0xa5; PAGE_SIZE]);
        // Frame information is written back to the guest.
        let buffer = mem.read_obj::<FrameBufWrapper>(PAYLOAD).unwrap();
        assert_eq!(buffer.frame_info.sequence, 42);

        // N pages, one page table and one payload.
        let stats = mem.stats();
        assert_eq!(stats.maps, NPAGES as usize + 2);
        assert_eq!(stats.unmaps, NPAGES as usize + 2);
        assert_eq!(mem.live_mappings(), 0);
    }

    #[test]
    fn get_buffer_page_failure() {
        const NPAGES: u32 = 6;
        const BAD_PAGE: usize = 3;

        let backend = backend();
        open(&backend, 0);
        setup_buffer(backend.guest_memory(), NPAGES, Some(BAD_PAGE));

        assert!(matches!(
            request(&backend, GUEST, Command::GetBuf, 0, PAYLOAD),
            Err(StreamError::Mapping(MapError::OutOfRange { gpa: 0x10, .. }))
        ));

        // The native device never saw the buffer.
        let entry = backend.registry().lookup(0).unwrap();
        assert!(entry.stream().get_pages.lock().unwrap().is_empty());

        // Pages before the failing one, the page table and the payload were all released.
        let stats = backend.guest_memory().stats();
        assert_eq!(stats.maps, BAD_PAGE + 2);
        assert_eq!(stats.unmaps, BAD_PAGE + 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(backend.guest_memory().live_mappings(), 0);
    }

    #[test]
    fn get_buffer_invalid_descriptor() {
        let backend = backend();
        open(&backend, 0);

        let mut buffer = FrameBufWrapper::default();
        buffer.frame_info.num_planes = 4;
        backend.guest_memory().write_obj(PAYLOAD, &buffer).unwrap();
        assert!(matches!(
            request(&backend, GUEST, Command::GetBuf, 0, PAYLOAD),
            Err(StreamError::InvalidDescriptor(_))
        ));

        // A plane without pages.
        buffer.frame_info.num_planes = 1;
        backend.guest_memory().write_obj(PAYLOAD, &buffer).unwrap();
        assert!(matches!(
            request(&backend, GUEST, Command::GetBuf, 0, PAYLOAD),
            Err(StreamError::InvalidDescriptor(_))
        ));
        assert_eq!(backend.guest_memory().live_mappings(), 0);
    }

    #[test]
    fn get_buffer_native_failure() {
        let backend = backend();
        open(&backend, 0);
        setup_buffer(backend.guest_memory(), 2, None);
        backend
            .registry()
            .lookup(0)
            .unwrap()
            .stream()
            .fail_with(libc::EAGAIN);

        assert_eq!(
            request(&backend, GUEST, Command::GetBuf, 0, PAYLOAD),
            Err(StreamError::Native {
                op: "get_buffer",
                errno: libc::EAGAIN
            })
        );
        let stats = backend.guest_memory().stats();
        assert_eq!((stats.maps, stats.unmaps), (4, 4));
    }

    #[test]
    fn poll_ready() {
        let backend = backend();
        open(&backend, 0);
        backend.registry().lookup(0).unwrap().stream().ready.push_ready();

        assert_eq!(
            request(&backend, GUEST, Command::Poll, 0, 0),
            Ok(libc::POLLIN as u32)
        );
    }

    #[test]
    fn poll_timeout() {
        let backend = backend_with(
            BackendConfig::default().with_poll_timeout(Duration::from_millis(50)),
        );
        open(&backend, 0);
        request(&backend, GUEST, Command::StreamOn, 0, 0).unwrap();

        let start = Instant::now();
        assert_eq!(
            request(&backend, GUEST, Command::Poll, 0, 0),
            Err(StreamError::Poll(PollError::Timeout))
        );
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn poll_stopped_by_streamoff() {
        let backend = Arc::new(backend());
        open(&backend, 0);
        request(&backend, GUEST, Command::StreamOn, 0, 0).unwrap();

        let poller = {
            let backend = Arc::clone(&backend);
            thread::spawn(move || request(&backend, GUEST, Command::Poll, 0, 0))
        };
        thread::sleep(Duration::from_millis(50));
        request(&backend, GUEST, Command::StreamOff, 0, 0).unwrap();

        assert_eq!(
            poller.join().unwrap(),
            Err(StreamError::Poll(PollError::StreamStopped))
        );
    }

    #[test]
    fn poll_interrupted_by_close() {
        let backend = Arc::new(backend());
        open(&backend, 0);
        request(&backend, GUEST, Command::StreamOn, 0, 0).unwrap();

        let poller = {
            let backend = Arc::clone(&backend);
            thread::spawn(move || request(&backend, GUEST, Command::Poll, 0, 0))
        };
        thread::sleep(Duration::from_millis(50));
        request(&backend, GUEST, Command::DeviceClose, 0, 0).unwrap();

        assert_eq!(
            poller.join().unwrap(),
            Err(StreamError::Poll(PollError::Interrupted))
        );
        assert_eq!(backend.device().closed(), 1);
    }

    /// Bridge for a VMM that failed to provide access to guest memory.
    struct NoGuestMemory;

    impl GuestMemoryBridge for NoGuestMemory {
        fn map(&self, _guest_id: GuestId, _gpa: u64, _len: usize) -> Result<NonNull<u8>, MapError> {
            Err(MapError::Unavailable)
        }

        fn unmap(&self, _guest_id: GuestId, _gpa: u64) {
            panic!("unmap without map");
        }
    }

    #[test]
    fn guest_memory_unavailable() {
        let backend = StreamBackend::new(
            DummyDevice::default(),
            NoGuestMemory,
            BackendConfig::default(),
        );
        backend
            .dispatch(GUEST, &StreamRequest::new(0, Command::DeviceOpen, 0, 0))
            .unwrap();

        for cmd in [Command::SetFormat, Command::PutBuf, Command::GetBuf] {
            assert_eq!(
                backend.dispatch(GUEST, &StreamRequest::new(0, cmd, 0, PAYLOAD)),
                Err(StreamError::Mapping(MapError::Unavailable))
            );
        }
        // Commands without payload still work.
        backend
            .dispatch(GUEST, &StreamRequest::new(0, Command::StreamOn, 0, 0))
            .unwrap();
    }

    #[test]
    fn handle_command() {
        let backend = backend();
        let mut input = Vec::new();
        input.extend_from_slice(StreamRequest::new(10, Command::DeviceOpen, 1, 0).as_bytes());
        input.extend_from_slice(StreamRequest::new(11, Command::DeviceOpen, 1, 0).as_bytes());
        input.extend_from_slice(&[0u8; 12]);
        let mut reader = Cursor::new(input);
        let mut writer = Vec::new();

        backend.handle_command(GUEST, &mut reader, &mut writer);
        backend.handle_command(GUEST, &mut reader, &mut writer);
        // Truncated request: nothing is written.
        backend.handle_command(GUEST, &mut reader, &mut writer);

        let mut responses = Cursor::new(writer);
        assert_eq!(
            responses.read_obj::<StreamResponse>().unwrap(),
            StreamResponse::processed(10, 0)
        );
        assert_eq!(
            responses.read_obj::<StreamResponse>().unwrap(),
            StreamResponse::err(11)
        );
        assert!(responses.read_obj::<StreamResponse>().is_err());
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Processing of requests on dedicated worker threads.
//!
//! A `Poll` request can block for a long time, so each request is processed on its own
//! short-lived thread and its completion delivered through a [`ResultChannel`].

use std::io::Result as IoResult;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread::Builder;
use std::thread::JoinHandle;

use log::error;

use crate::dispatch::StreamBackend;
use crate::protocol::StreamRequest;
use crate::protocol::StreamResponse;
use crate::GuestId;
use crate::GuestMemoryBridge;
use crate::NativeStreamDevice;
use crate::ResultChannel;

/// Process `request` of `guest_id` on a new thread, and deliver its response to `channel`.
pub fn spawn_request<D, B, C>(
    backend: &Arc<StreamBackend<D, B>>,
    guest_id: GuestId,
    request: StreamRequest,
    channel: Arc<C>,
) -> IoResult<JoinHandle<()>>
where
    D: NativeStreamDevice + 'static,
    B: GuestMemoryBridge + 'static,
    C: ResultChannel + ?Sized + 'static,
{
    let backend = Arc::clone(backend);

    Builder::new()
        .name(format!("guest {} - req {}", guest_id, request.req_id))
        .spawn(move || {
            let response = backend.handle_request(guest_id, &request);
            channel.notify(guest_id, response);
        })
}

/// A response along with the guest it is destined to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub guest_id: GuestId,
    pub response: StreamResponse,
}

/// [`ResultChannel`] forwarding completions to a [`mpsc::Receiver`], for VMMs that deliver them
/// from a single thread.
pub struct ChannelResultSink {
    sender: Mutex<mpsc::Sender<Completion>>,
}

impl ChannelResultSink {
    pub fn new() -> (Self, mpsc::Receiver<Completion>) {
        let (sender, receiver) = mpsc::channel();

        (
            Self {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }
}

impl ResultChannel for ChannelResultSink {
    fn notify(&self, guest_id: GuestId, response: StreamResponse) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if sender.send(Completion { guest_id, response }).is_err() {
            error!(
                "cannot deliver response to request {} of guest {}: receiver is gone",
                response.req_id, guest_id
            );
        }
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Readiness tracking of native streams, used to emulate a blocking `poll` for the guest.
//!
//! The guest cannot share a wait primitive with the host, so a `Poll` request is serviced by a
//! worker that blocks on the [`ReadyQueue`] of the target stream until a buffer becomes ready,
//! streaming stops, the stream is torn down, or a timeout expires.

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use thiserror::Error;

/// Reasons for a `Poll` to return without a buffer being ready.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PollError {
    #[error("no buffer became ready before the timeout")]
    Timeout,
    #[error("stream was closed while waiting")]
    Interrupted,
    #[error("stream is not streaming")]
    StreamStopped,
}

#[derive(Debug, Default)]
struct ReadyState {
    /// Number of completed buffers waiting to be retrieved.
    ready: usize,
    streaming: bool,
    /// Set once the stream is torn down. Sticky.
    interrupted: bool,
}

/// Ready-buffer counter and the condition `Poll` waits on.
///
/// Native streams own one of these and update it as buffers complete and streaming starts or
/// stops. Every state change wakes all waiters.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    state: Mutex<ReadyState>,
    cond: Condvar,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<ReadyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal that one more buffer is ready to be retrieved.
    pub fn push_ready(&self) {
        self.lock().ready += 1;
        self.cond.notify_all();
    }

    /// Consume one ready buffer. Returns `false` if none was ready.
    pub fn pop_ready(&self) -> bool {
        let mut state = self.lock();
        if state.ready == 0 {
            return false;
        }
        state.ready -= 1;
        true
    }

    /// Drop all ready buffers.
    pub fn clear(&self) {
        self.lock().ready = 0;
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready > 0
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.lock().streaming = streaming;
        self.cond.notify_all();
    }

    /// Wake every waiter so it re-evaluates the stream state.
    pub fn wake_all(&self) {
        self.cond.notify_all();
    }

    /// Mark the stream as torn down and release all waiters with [`PollError::Interrupted`].
    pub fn interrupt(&self) {
        self.lock().interrupted = true;
        self.cond.notify_all();
    }

    /// Block until a buffer is ready, or fail with the reason the wait ended.
    ///
    /// Returns immediately if a buffer is already ready, and fails immediately with
    /// [`PollError::StreamStopped`] if the stream is not streaming.
    pub fn wait_ready(&self, timeout: Duration) -> Result<(), PollError> {
        let state = self.lock();
        if state.ready > 0 {
            return Ok(());
        }

        let (state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |s| {
                s.ready == 0 && s.streaming && !s.interrupted
            })
            .unwrap_or_else(PoisonError::into_inner);

        if state.interrupted {
            Err(PollError::Interrupted)
        } else if !state.streaming {
            Err(PollError::StreamStopped)
        } else if state.ready > 0 {
            Ok(())
        } else {
            Err(PollError::Timeout)
        }
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;

use crate::protocol::MAX_STREAM_DEVICES;
use crate::protocol::STREAM_DEVICE_PREFIX;
use crate::StreamId;

/// How long a `Poll` request may block before failing with a timeout.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(20);

/// Settings of a [`crate::dispatch::StreamBackend`], fixed at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Upper bound of a blocking `Poll`.
    pub poll_timeout: Duration,
    /// Prefix of native stream nodes.
    pub device_prefix: String,
    /// Number of stream ids accepted by `Open`, i.e. valid ids are `0..max_streams`.
    pub max_streams: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            device_prefix: STREAM_DEVICE_PREFIX.to_string(),
            max_streams: MAX_STREAM_DEVICES,
        }
    }
}

impl BackendConfig {
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_device_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.device_prefix = prefix.into();
        self
    }

    pub fn with_max_streams(mut self, max_streams: usize) -> Self {
        self.max_streams = max_streams;
        self
    }

    /// Name of the native node backing virtual stream `stream_id`.
    pub fn device_name(&self, stream_id: StreamId) -> String {
        format!("{}{}", self.device_prefix, stream_id)
    }
}

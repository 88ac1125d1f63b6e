// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Release of the streams left open by guests that went away.

use std::sync::Arc;

use log::info;
use log::warn;

use crate::registry::StreamEntry;
use crate::registry::StreamRegistry;
use crate::GuestId;
use crate::NativeStream;
use crate::NativeStreamDevice;

/// Handler invoked by the VMM when a guest is destroyed or its frontend resets.
pub struct RecoveryHandler<D: NativeStreamDevice> {
    registry: Arc<StreamRegistry<D>>,
}

impl<D: NativeStreamDevice> Clone for RecoveryHandler<D> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<D: NativeStreamDevice> RecoveryHandler<D> {
    pub fn new(registry: Arc<StreamRegistry<D>>) -> Self {
        Self { registry }
    }

    /// Release every stream owned by `guest_id`, and return how many there were.
    ///
    /// Streams of other guests are left untouched.
    pub fn reclaim(&self, guest_id: GuestId) -> usize {
        let reclaimed = Self::release(self.registry.remove_all_owned_by(guest_id));
        if reclaimed > 0 {
            info!("reclaimed {} streams of guest {}", reclaimed, guest_id);
        }

        reclaimed
    }

    /// Release every open stream, whichever guest owns it.
    ///
    /// Only suitable for configurations where a single guest uses the device.
    pub fn reclaim_all(&self) -> usize {
        let reclaimed = Self::release(self.registry.remove_all());
        if reclaimed > 0 {
            info!("reclaimed all {} open streams", reclaimed);
        }

        reclaimed
    }

    fn release(entries: Vec<Arc<StreamEntry<D>>>) -> usize {
        for entry in &entries {
            warn!(
                "force-releasing stream {} of guest {}",
                entry.stream_id(),
                entry.guest_id()
            );
            entry.stream().ready_queue().interrupt();
        }

        entries.len()
    }
}

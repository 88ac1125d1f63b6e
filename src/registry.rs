// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Table of the open virtual streams and the native streams backing them.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::error::Owner;
use crate::GuestId;
use crate::NativeStreamDevice;
use crate::StreamId;

/// Binding of a virtual stream id to an open native stream.
///
/// The native stream is closed when the entry is dropped. Entries are shared through `Arc`s, so
/// a worker still using a stream that has just been removed from the registry keeps it open
/// until it is done, and the native stream is closed exactly once, by whoever drops the last
/// reference.
pub struct StreamEntry<D: NativeStreamDevice> {
    stream_id: StreamId,
    guest_id: GuestId,
    device: Arc<D>,
    stream: ManuallyDrop<D::Stream>,
}

impl<D: NativeStreamDevice> StreamEntry<D> {
    pub fn new(stream_id: StreamId, guest_id: GuestId, device: Arc<D>, stream: D::Stream) -> Self {
        Self {
            stream_id,
            guest_id,
            device,
            stream: ManuallyDrop::new(stream),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Guest that opened the stream.
    pub fn guest_id(&self) -> GuestId {
        self.guest_id
    }

    pub fn stream(&self) -> &D::Stream {
        &self.stream
    }
}

impl<D: NativeStreamDevice> Drop for StreamEntry<D> {
    fn drop(&mut self) {
        log::debug!(
            "closing native stream {} of guest {}",
            self.stream_id,
            self.guest_id
        );
        // SAFETY: `stream` is never accessed again after this point.
        let stream = unsafe { ManuallyDrop::take(&mut self.stream) };
        self.device.close(stream);
    }
}

/// Concurrent map of virtual stream ids to their [`StreamEntry`].
///
/// All operations are atomic with respect to each other. The table lock is only held for the
/// table operation itself: entries removed from the table are returned to the caller and their
/// native streams are closed outside of the lock.
pub struct StreamRegistry<D: NativeStreamDevice> {
    streams: Mutex<HashMap<StreamId, Arc<StreamEntry<D>>>>,
}

impl<D: NativeStreamDevice> Default for StreamRegistry<D> {
    fn default() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
        }
    }
}

impl<D: NativeStreamDevice> StreamRegistry<D> {
    pub fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<HashMap<StreamId, Arc<StreamEntry<D>>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the entry bound to `stream_id`, whoever owns it.
    pub fn lookup(&self, stream_id: StreamId) -> Option<Arc<StreamEntry<D>>> {
        self.lock().get(&stream_id).cloned()
    }

    /// Returns the entry bound to `stream_id` if it is owned by `guest_id`.
    pub fn lookup_owned(
        &self,
        stream_id: StreamId,
        guest_id: GuestId,
    ) -> Option<Arc<StreamEntry<D>>> {
        self.lookup(stream_id).filter(|e| e.guest_id() == guest_id)
    }

    /// Insert `entry` unless its stream id is already bound.
    ///
    /// On failure the guest currently holding the stream id is returned, and `entry` is dropped
    /// (closing its native stream) after the table lock has been released.
    pub fn insert_if_absent(&self, entry: StreamEntry<D>) -> Result<Arc<StreamEntry<D>>, Owner> {
        let owner = {
            let mut streams = self.lock();
            match streams.entry(entry.stream_id()) {
                Entry::Vacant(slot) => return Ok(Arc::clone(slot.insert(Arc::new(entry)))),
                Entry::Occupied(existing) => {
                    Owner::of(existing.get().guest_id(), entry.guest_id())
                }
            }
        };

        drop(entry);
        Err(owner)
    }

    /// Remove and return the entry bound to `stream_id`.
    pub fn remove(&self, stream_id: StreamId) -> Option<Arc<StreamEntry<D>>> {
        self.lock().remove(&stream_id)
    }

    /// Remove and return the entry bound to `stream_id` if, and only if, it is owned by
    /// `guest_id`.
    pub fn remove_owned(
        &self,
        stream_id: StreamId,
        guest_id: GuestId,
    ) -> Option<Arc<StreamEntry<D>>> {
        let mut streams = self.lock();
        match streams.get(&stream_id) {
            Some(entry) if entry.guest_id() == guest_id => streams.remove(&stream_id),
            _ => None,
        }
    }

    /// Remove and return all the entries owned by `guest_id`.
    pub fn remove_all_owned_by(&self, guest_id: GuestId) -> Vec<Arc<StreamEntry<D>>> {
        let mut streams = self.lock();
        let ids = streams
            .iter()
            .filter(|(_, e)| e.guest_id() == guest_id)
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();

        ids.into_iter()
            .filter_map(|id| streams.remove(&id))
            .collect()
    }

    /// Remove and return all the entries, regardless of their owner.
    pub fn remove_all(&self) -> Vec<Arc<StreamEntry<D>>> {
        self.lock().drain().map(|(_, e)| e).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Native stream devices.
//!
//! Any VMM can plug these into a [`crate::StreamBackend`] in place of the hardware stream nodes.
//!
//! [simple_device] implements a capture stream that generates frames in software. It can be used
//! as a reference for how to write native devices, or as a way to test the guest without any
//! camera hardware on the host.

pub mod simple_device;
pub use simple_device::SimpleStreamDevice;

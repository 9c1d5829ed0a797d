// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Argus NVR recording engine core.
//!
//! Ingests RTSP camera feeds, persists them as playable fragmented-MP4
//! segment sequences, and drives event-based recording with pre/post-roll.
//! The HTTP/HLS layer, web UI, and concrete detection backends sit on top
//! of this crate: they drive the [`registry::Registry`] control surface and
//! exchange [`detect::DetectionSample`]s for [`detect::DetectionVerdict`]s.

pub mod buffer;
pub mod config;
pub mod controller;
pub mod detect;
pub mod fmp4;
pub mod h264;
pub mod pkt;
pub mod registry;
pub mod status;
pub mod stream;
pub mod streamer;
pub mod timestamp;
pub mod writer;

#[cfg(test)]
mod testutil;

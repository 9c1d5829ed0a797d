// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Media packet and codec parameter value types.
//!
//! A [`Packet`] is one compressed media unit as produced by the demuxer.
//! It is immutable once constructed and cheap to clone: the payload is
//! reference-counted [`Bytes`], so the pre-roll buffer, the writer, and the
//! detection sampler can all hold the same frame without copies.

use base::time::{Duration, Time};
use bytes::Bytes;

/// Which elementary stream a packet belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
}

/// A rational time base: seconds per tick is `num / den`.
///
/// Video over RTP is effectively always `1/90_000`; audio uses the codec's
/// clock rate (e.g. `1/8_000` for G.711, `1/48_000` for AAC at 48 kHz).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    pub const VIDEO_90K: TimeBase = TimeBase { num: 1, den: 90_000 };

    pub fn per_second(den: u32) -> Self {
        TimeBase { num: 1, den }
    }
}

/// When a packet arrived, on both clocks: the monotonic clock orders packets
/// and drives timeouts; the realtime clock names recordings and satisfies
/// "give me the last N seconds" requests.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Wallclock {
    pub monotonic: Duration,
    pub realtime: Time,
}

/// One compressed media unit. Immutable once constructed.
#[derive(Clone)]
pub struct Packet {
    pub stream: StreamKind,

    /// Presentation timestamp in `time_base` units, as the demuxer supplied it.
    pub pts: i64,

    /// Decode timestamp. RTSP cameras virtually never send B-frames, so this
    /// equals `pts` at ingest; the normalizer and writer keep it strictly
    /// monotonic downstream regardless.
    pub dts: i64,

    pub time_base: TimeBase,
    pub is_keyframe: bool,
    pub payload: Bytes,

    /// Duration in `time_base` units, if the demuxer provided one.
    pub duration: Option<i64>,

    pub arrival: Wallclock,
}

impl Packet {
    /// The packet's duration: the demuxer-provided value if any, otherwise
    /// derived from the successor's DTS.
    pub fn duration_until(&self, next_dts: i64) -> i64 {
        self.duration.unwrap_or(next_dts - self.dts)
    }

    pub fn is_video_keyframe(&self) -> bool {
        self.stream == StreamKind::Video && self.is_keyframe
    }
}

/// Custom `Debug` impl that skips the verbose `payload` field.
impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("stream", &self.stream)
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("is_keyframe", &self.is_keyframe)
            .field("payload_len", &self.payload.len())
            .field("arrival", &self.arrival.realtime)
            .finish_non_exhaustive()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CodecId {
    H264,
    H265,
    Aac,

    /// An audio codec we can put in a `.mp4` but don't otherwise understand
    /// (e.g. G.711 as `ulaw`/`alaw`).
    OtherAudio,
}

impl CodecId {
    pub fn is_video(self) -> bool {
        matches!(self, CodecId::H264 | CodecId::H265)
    }
}

/// Per-input-stream codec parameters, captured once at stream open and
/// attached to every segment that consumes the stream.
#[derive(Clone, PartialEq)]
pub struct CodecParameters {
    pub codec: CodecId,

    /// Raw codec extradata (e.g. SPS/PPS for H.264), used by the Annex-B
    /// conversion when the demuxer did not supply a ready sample entry.
    pub extradata: Bytes,

    /// A ready-to-mux MP4 sample entry (`avc1`, `hvc1`, `mp4a`, ...).
    pub sample_entry: Vec<u8>,

    /// RFC 6381 codec string, e.g. `avc1.4d401f`; carries the profile/level.
    pub rfc6381_codec: String,

    // Video only.
    pub width: u16,
    pub height: u16,

    /// Timestamp clock rate; 90 kHz for video.
    pub clock_rate: u32,

    // Audio only.
    pub sample_rate: u32,
    pub channels: u16,
}

/// Custom `Debug` impl that skips the binary fields.
impl std::fmt::Debug for CodecParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecParameters")
            .field("codec", &self.codec)
            .field("rfc6381_codec", &self.rfc6381_codec)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("clock_rate", &self.clock_rate)
            .finish_non_exhaustive()
    }
}

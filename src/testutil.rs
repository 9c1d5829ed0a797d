// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing of the recording core.

use crate::pkt::{CodecId, CodecParameters, Packet, StreamKind, TimeBase, Wallclock};
use base::time::{Duration, Time, TIME_UNITS_PER_SEC};
use bytes::Bytes;

pub use db::testutil::init;

/// A baseline-profile, level-3.0 SPS for a 640x480 stream, encoded by hand
/// for these tests: pic_order_cnt_type 2, one reference frame, frame MBs
/// only, no cropping, no VUI.
pub const TEST_SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1e, 0xda, 0x02, 0x80, 0xf6, 0x40];

/// A minimal PPS to pair with [`TEST_SPS`]: CAVLC, one slice group, all
/// offsets zero.
pub const TEST_PPS: &[u8] = &[0x68, 0xce, 0x38, 0x80];

/// [`TEST_SPS`]/[`TEST_PPS`] as an `AVCDecoderConfigurationRecord`
/// declaring 4-byte sample lengths, assembled field by field here so codec
/// parsing tests have an independently-built expectation.
pub fn avcc_extradata() -> Vec<u8> {
    let mut v = vec![1, TEST_SPS[1], TEST_SPS[2], TEST_SPS[3], 0xff, 0xe1];
    v.extend_from_slice(&(TEST_SPS.len() as u16).to_be_bytes());
    v.extend_from_slice(TEST_SPS);
    v.push(1);
    v.extend_from_slice(&(TEST_PPS.len() as u16).to_be_bytes());
    v.extend_from_slice(TEST_PPS);
    v
}

/// The same parameter sets in Annex B form, as an ffmpeg-era camera would
/// supply them.
pub fn annex_b_extradata() -> Vec<u8> {
    let mut v = Vec::new();
    for nal in [TEST_SPS, TEST_PPS] {
        v.extend_from_slice(&[0, 0, 0, 1]);
        v.extend_from_slice(nal);
    }
    v
}

pub fn video_params() -> CodecParameters {
    let extradata = avcc_extradata();
    let parsed =
        crate::h264::ExtraData::parse(&extradata, 640, 480).expect("test extradata is valid");
    CodecParameters {
        codec: CodecId::H264,
        extradata: Bytes::from(extradata),
        sample_entry: parsed.sample_entry,
        rfc6381_codec: parsed.rfc6381_codec,
        width: 640,
        height: 480,
        clock_rate: 90_000,
        sample_rate: 0,
        channels: 0,
    }
}

pub fn audio_params() -> CodecParameters {
    // A skeletal `mp4a` entry; mux tests only check box placement.
    let mut entry = Vec::new();
    entry.extend_from_slice(&36u32.to_be_bytes());
    entry.extend_from_slice(b"mp4a");
    entry.extend_from_slice(&[0u8; 28]);
    CodecParameters {
        codec: CodecId::Aac,
        extradata: Bytes::new(),
        sample_entry: entry,
        rfc6381_codec: "mp4a.40.2".to_owned(),
        width: 0,
        height: 0,
        clock_rate: 48_000,
        sample_rate: 48_000,
        channels: 2,
    }
}

/// Generates a deterministic synthetic packet stream: video at a fixed frame
/// rate with a keyframe every `gop` frames, and optionally interleaved audio.
pub struct PacketGen {
    fps: u32,
    gop: u64,
    frame: u64,
    now: Time,
    monotonic: Duration,
    frame_size: usize,
    audio_pts: i64,
}

impl PacketGen {
    pub fn new(fps: u32, gop: u64) -> Self {
        PacketGen {
            fps,
            gop,
            frame: 0,
            now: Time::from_unix_secs(1_700_000_000),
            monotonic: Duration::from_secs(1_000),
            frame_size: 100,
            audio_pts: 0,
        }
    }

    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    /// The arrival wallclock the next produced packet will carry.
    pub fn now(&self) -> Time {
        self.now
    }

    fn tick(&self) -> i64 {
        TIME_UNITS_PER_SEC / i64::from(self.fps)
    }

    /// Produces the next video frame and advances the clock by one frame
    /// interval.
    pub fn next_video(&mut self) -> Packet {
        let pts = self.frame as i64 * self.tick();
        let is_keyframe = self.frame % self.gop == 0;
        let p = Packet {
            stream: StreamKind::Video,
            pts,
            dts: pts,
            time_base: TimeBase::VIDEO_90K,
            is_keyframe,
            payload: Bytes::from(vec![0u8; self.frame_size]),
            duration: None,
            arrival: Wallclock {
                monotonic: self.monotonic,
                realtime: self.now,
            },
        };
        self.frame += 1;
        self.now += Duration(self.tick());
        self.monotonic += Duration(self.tick());
        p
    }

    /// Produces an audio packet stamped at the current clock, without
    /// advancing it.
    pub fn next_audio(&mut self) -> Packet {
        let pts = self.audio_pts;
        self.audio_pts += 960; // 20 ms at 48 kHz
        Packet {
            stream: StreamKind::Audio,
            pts,
            dts: pts,
            time_base: TimeBase::per_second(48_000),
            is_keyframe: false,
            payload: Bytes::from(vec![0u8; 20]),
            duration: Some(960),
            arrival: Wallclock {
                monotonic: self.monotonic,
                realtime: self.now,
            },
        }
    }

    /// Skips `n` video frames (advancing clocks) without producing them, as
    /// if they were lost on the network.
    pub fn skip_video(&mut self, n: u64) {
        self.frame += n;
        self.now += Duration(self.tick() * n as i64);
        self.monotonic += Duration(self.tick() * n as i64);
    }
}

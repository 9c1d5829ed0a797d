// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-stream timestamp normalization.
//!
//! Cameras restart their RTP clocks on reconnect, occasionally step them
//! backward, and sometimes repeat a timestamp outright. The MP4 muxer needs
//! none of that: within a segment the decode timeline must be strictly
//! monotonic, and across the segments of one recording the timeline must
//! continue seamlessly even when a reconnect happened in between. This
//! module owns that transformation; corrections are counted, not errored.

use base::time::TIME_UNITS_PER_SEC;
use tracing::debug;

/// Fallback frame duration before any delta has been observed: 1/25 s in
/// 90 kHz units, a typical IP camera rate.
const DEFAULT_FRAME_DURATION: i64 = TIME_UNITS_PER_SEC / 25;

/// Minimum inter-packet gap treated as a discontinuity.
const MIN_GAP_BOUND: i64 = 10 * TIME_UNITS_PER_SEC;

/// Normalized timestamps for one packet, in the stream's time base.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Normalized {
    pub pts: i64,
    pub dts: i64,
}

/// Tracks and rewrites one elementary stream's timestamps.
pub struct TimestampTracker {
    /// Raw timestamps of the first packet since open/rebase; rewrites are
    /// relative to these.
    base: Option<(i64, i64)>,

    /// Accumulated rebase applied after reconnects and gap corrections.
    offset: i64,

    last_emitted: Option<Normalized>,

    /// Inferred duration of one packet, from observed DTS deltas.
    frame_duration: i64,

    discontinuity_count: u64,

    /// UDP transports may reorder; noted in logs when correcting.
    is_udp: bool,
}

impl TimestampTracker {
    pub fn new(is_udp: bool) -> Self {
        TimestampTracker {
            base: None,
            offset: 0,
            last_emitted: None,
            frame_duration: DEFAULT_FRAME_DURATION,
            discontinuity_count: 0,
            is_udp,
        }
    }

    pub fn discontinuity_count(&self) -> u64 {
        self.discontinuity_count
    }

    /// The current estimate of one packet's duration, in time-base units.
    pub fn frame_duration(&self) -> i64 {
        self.frame_duration
    }

    fn gap_bound(&self) -> i64 {
        MIN_GAP_BOUND.max(5 * self.frame_duration)
    }

    /// Rewrites one packet's timestamps. The emitted DTS is strictly greater
    /// than the previously emitted DTS.
    pub fn normalize(&mut self, pts: i64, dts: i64) -> Normalized {
        let (base_pts, base_dts) = *self.base.get_or_insert((pts, dts));
        let mut out = Normalized {
            pts: pts - base_pts + self.offset,
            dts: dts - base_dts + self.offset,
        };

        let Some(last) = self.last_emitted else {
            self.last_emitted = Some(out);
            return out;
        };

        let delta = out.dts - last.dts;
        if delta <= 0 {
            // Reordered or backward sample: force forward progress by one
            // tick, preserving the presentation offset.
            let cts = out.pts - out.dts;
            out.dts = last.dts + 1;
            out.pts = out.dts + cts;
            self.discontinuity_count += 1;
            debug!(
                raw_dts = dts,
                emitted_dts = out.dts,
                udp = self.is_udp,
                "backward timestamp corrected"
            );
        } else if delta > self.gap_bound() {
            // Stream jumped forward (camera clock step or long stall): close
            // the gap so playback doesn't freeze-frame for the difference.
            let target = last.dts + self.frame_duration;
            let correction = target - out.dts;
            self.offset += correction;
            let cts = out.pts - out.dts;
            out.dts = target;
            out.pts = out.dts + cts;
            self.discontinuity_count += 1;
            debug!(
                gap = delta,
                correction, "timestamp discontinuity; timeline rebased"
            );
        } else {
            // Ordinary packet; refine the duration estimate.
            self.frame_duration = delta;
        }

        self.last_emitted = Some(out);
        out
    }

    /// Rebases after a reconnect: the next packet's raw timestamps become the
    /// new base, and its emitted DTS lands one frame after the last emitted
    /// DTS, so a recording straddling the reconnect stays continuous.
    pub fn rebase(&mut self) {
        self.base = None;
        if let Some(last) = self.last_emitted {
            self.offset = last.dts + self.frame_duration;
        }
    }
}

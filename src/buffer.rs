// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The per-stream circular packet buffer backing pre-roll.
//!
//! Holds the most recent seconds of packets so that a late detection verdict
//! can retroactively include video from before the trigger. Invariants
//! preserved by every mutation:
//!
//! * memory stays within the buffer's slice of the global byte budget;
//! * if non-empty, the first video packet is a keyframe (never mid-GOP);
//! * under pressure, non-keyframes are shed before keyframes, so a thinned
//!   buffer degrades to a keyframe strip rather than losing whole spans.

use crate::pkt::{Packet, StreamKind};
use base::time::{Duration, Time};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// The process-wide buffer byte budget, shared by all streams.
///
/// A single atomic ledger; claims and releases happen only on the buffer's
/// own mutation paths, so it cannot drift.
pub struct GlobalBudget {
    limit: i64,
    used: AtomicI64,
}

impl GlobalBudget {
    pub fn new(limit_bytes: i64) -> Arc<Self> {
        Arc::new(GlobalBudget {
            limit: limit_bytes,
            used: AtomicI64::new(0),
        })
    }

    /// Claims `bytes` unconditionally; returns false if the pool is now over
    /// its limit and the caller should shed.
    fn claim(&self, bytes: i64) -> bool {
        self.used.fetch_add(bytes, Ordering::Relaxed) + bytes <= self.limit
    }

    fn release(&self, bytes: i64) {
        let prev = self.used.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "budget release of {bytes} underflows {prev}");
    }

    pub fn used_bytes(&self) -> i64 {
        self.used.load(Ordering::Relaxed)
    }
}

/// A snapshot of buffer state, as returned by [`PacketBuffer::stats`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BufferStats {
    pub count: usize,
    pub memory_bytes: usize,
    pub duration: Duration,
    pub keyframe_count: usize,
    pub dropped_packets: u64,
    pub dropped_bytes: u64,
    pub dropped_keyframes: u64,
    pub total_keyframes: u64,
    pub duplicate_packets: u64,
}

/// Circular packet FIFO scoped to one camera.
pub struct PacketBuffer {
    packets: VecDeque<Packet>,

    /// This stream's slice of the global budget, in bytes.
    slice_bytes: usize,

    /// A hard cap on packet count, to bound deque growth on absurd streams.
    capacity_packets: usize,

    /// What the buffer is sized to hold; used by `stats` consumers to judge
    /// whether pre-roll is fully covered.
    pub target_duration: Duration,

    global: Arc<GlobalBudget>,
    memory_bytes: usize,
    keyframe_count: usize,

    dropped_packets: u64,
    dropped_bytes: u64,
    dropped_keyframes: u64,
    total_keyframes: u64,
    duplicate_packets: u64,
}

impl PacketBuffer {
    pub fn new(
        slice_bytes: usize,
        capacity_packets: usize,
        target_duration: Duration,
        global: Arc<GlobalBudget>,
    ) -> Self {
        PacketBuffer {
            packets: VecDeque::new(),
            slice_bytes,
            capacity_packets,
            target_duration,
            global,
            memory_bytes: 0,
            keyframe_count: 0,
            dropped_packets: 0,
            dropped_bytes: 0,
            dropped_keyframes: 0,
            total_keyframes: 0,
            duplicate_packets: 0,
        }
    }

    /// Appends a packet, evicting as needed. Never blocks.
    pub fn push(&mut self, packet: Packet) {
        // Cameras occasionally repeat a frame after an RTSP hiccup;
        // deduplicate on the identifying tuple.
        if let Some(back) = self.packets.back() {
            if back.stream == packet.stream && back.pts == packet.pts && back.dts == packet.dts {
                self.duplicate_packets += 1;
                return;
            }
        }

        if packet.is_video_keyframe() {
            self.total_keyframes += 1;
            self.keyframe_count += 1;
        }
        let bytes = packet.payload.len();
        self.memory_bytes += bytes;
        let global_ok = self.global.claim(bytes as i64);
        self.packets.push_back(packet);

        while self.over_limit(global_ok) {
            if !self.evict_one() {
                break;
            }
        }
        self.fix_head();
    }

    fn over_limit(&self, global_ok: bool) -> bool {
        self.memory_bytes > self.slice_bytes
            || self.packets.len() > self.capacity_packets
            || (!global_ok && self.global.used_bytes() > self.global.limit)
    }

    /// Evicts one packet, preferring the oldest non-keyframe. Returns false
    /// when nothing can be evicted (only the just-pushed packet remains).
    fn evict_one(&mut self) -> bool {
        if self.packets.len() <= 1 {
            return false;
        }
        // The head is normally a keyframe, so the oldest non-keyframe sits
        // within the first GOP; this scan is short in practice.
        let last = self.packets.len() - 1; // never evict the newest packet
        let victim = match self
            .packets
            .iter()
            .take(last)
            .position(|p| !p.is_video_keyframe())
        {
            Some(i) => self.packets.remove(i).expect("position() yields a valid index"),
            None => self.packets.pop_front().expect("len checked above"),
        };
        self.account_drop(&victim);
        true
    }

    /// Restores the head invariant: the buffer either is empty or starts with
    /// a video keyframe.
    fn fix_head(&mut self) {
        while let Some(front) = self.packets.front() {
            if front.is_video_keyframe() {
                return;
            }
            let p = self.packets.pop_front().expect("front() was Some");
            self.account_drop(&p);
        }
    }

    fn account_drop(&mut self, p: &Packet) {
        let bytes = p.payload.len();
        self.memory_bytes -= bytes;
        self.global.release(bytes as i64);
        self.dropped_packets += 1;
        self.dropped_bytes += bytes as u64;
        if p.is_video_keyframe() {
            self.dropped_keyframes += 1;
            self.keyframe_count -= 1;
        }
    }

    /// Returns an iterator over buffered packets in arrival order, starting
    /// at the newest video keyframe whose arrival time is at or before
    /// `since` — the nearest prior keyframe, so a pre-roll request of N
    /// seconds yields at least N seconds when the buffer reaches back that
    /// far. Falls back to the oldest keyframe when the whole buffer is
    /// newer than `since`. Empty if the buffer holds no video keyframe.
    pub fn drain_from_keyframe(&self, since: Time) -> impl Iterator<Item = &Packet> + '_ {
        let mut first_keyframe: Option<usize> = None;
        let mut best: Option<usize> = None;
        for (i, p) in self.packets.iter().enumerate() {
            if !p.is_video_keyframe() {
                continue;
            }
            first_keyframe.get_or_insert(i);
            if p.arrival.realtime <= since {
                best = Some(i);
            } else {
                break;
            }
        }
        let start = match best.or(first_keyframe) {
            Some(i) => i,
            None => self.packets.len(),
        };
        self.packets.iter().skip(start)
    }

    pub fn stats(&self) -> BufferStats {
        let duration = match (self.packets.front(), self.packets.back()) {
            (Some(f), Some(b)) => b.arrival.realtime - f.arrival.realtime,
            _ => Duration(0),
        };
        BufferStats {
            count: self.packets.len(),
            memory_bytes: self.memory_bytes,
            duration,
            keyframe_count: self.keyframe_count,
            dropped_packets: self.dropped_packets,
            dropped_bytes: self.dropped_bytes,
            dropped_keyframes: self.dropped_keyframes,
            total_keyframes: self.total_keyframes,
            duplicate_packets: self.duplicate_packets,
        }
    }

    /// Logical reset; payload refcounts are released. Drop counters survive
    /// (they describe the stream's whole life, not one connection).
    pub fn clear(&mut self) {
        if !self.packets.is_empty() {
            debug!(
                count = self.packets.len(),
                bytes = self.memory_bytes,
                "clearing packet buffer"
            );
        }
        self.global.release(self.memory_bytes as i64);
        self.memory_bytes = 0;
        self.keyframe_count = 0;
        self.packets.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        self.global.release(self.memory_bytes as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::PacketGen;

    fn new_buffer(slice_bytes: usize, global: &Arc<GlobalBudget>) -> PacketBuffer {
        PacketBuffer::new(slice_bytes, 10_000, Duration::from_secs(5), global.clone())
    }

    #[test]
    fn head_is_always_a_keyframe() {
        let global = GlobalBudget::new(1 << 20);
        let mut buf = new_buffer(1 << 20, &global);
        let mut gen = PacketGen::new(25, 5);
        for _ in 0..40 {
            buf.push(gen.next_video());
            if !buf.is_empty() {
                assert!(buf.drain_from_keyframe(Time::MIN).next().is_some());
                assert!(buf
                    .drain_from_keyframe(Time::MIN)
                    .next()
                    .expect("non-empty buffer yields a packet")
                    .is_video_keyframe());
            }
        }
        // Leading delta frames (before the first keyframe) never enter.
        assert!(buf.stats().count > 0);
    }

    #[test]
    fn memory_bound_holds() {
        let global = GlobalBudget::new(1 << 30);
        let frame_size = 1000;
        let mut buf = new_buffer(frame_size * 20, &global);
        let mut gen = PacketGen::new(25, 5).with_frame_size(frame_size);
        for _ in 0..500 {
            buf.push(gen.next_video());
            assert!(buf.stats().memory_bytes <= frame_size * 20);
        }
        assert!(buf.stats().dropped_packets > 0);
    }

    #[test]
    fn keyframes_survive_pressure() {
        let global = GlobalBudget::new(1 << 30);
        let frame_size = 1000;
        // Room for ~3 GOPs of 10 frames each.
        let mut buf = new_buffer(frame_size * 30, &global);
        let mut gen = PacketGen::new(25, 10).with_frame_size(frame_size);
        for _ in 0..250 {
            buf.push(gen.next_video());
        }
        let stats = buf.stats();
        // 25 GOPs pushed; most delta frames shed, keyframes retained.
        assert!(stats.dropped_packets > 0);
        assert!(
            stats.dropped_keyframes * 20 < stats.total_keyframes,
            "dropped {} of {} keyframes",
            stats.dropped_keyframes,
            stats.total_keyframes,
        );
        assert!(stats.keyframe_count >= 20);
    }

    #[test]
    fn drain_picks_nearest_prior_keyframe() {
        let global = GlobalBudget::new(1 << 30);
        let mut buf = new_buffer(1 << 20, &global);
        let mut gen = PacketGen::new(25, 25); // keyframe every second
        let t0 = gen.now();
        for _ in 0..100 {
            buf.push(gen.next_video());
        }
        // Keyframes at t0, t0+1s, t0+2s, t0+3s.
        let since = t0 + Duration::from_millis(1_500);
        let first = buf
            .drain_from_keyframe(since)
            .next()
            .expect("keyframe exists before since");
        assert!(first.is_video_keyframe());
        assert_eq!(first.arrival.realtime, t0 + Duration::from_secs(1));

        // A request reaching into the future starts at the newest keyframe.
        let since = gen.now() + Duration::from_secs(100);
        let first = buf
            .drain_from_keyframe(since)
            .next()
            .expect("newest keyframe qualifies");
        assert_eq!(first.arrival.realtime, t0 + Duration::from_secs(3));
    }

    #[test]
    fn drain_falls_back_to_oldest_keyframe() {
        let global = GlobalBudget::new(1 << 30);
        let mut buf = new_buffer(1 << 20, &global);
        let mut gen = PacketGen::new(25, 25);
        let t0 = gen.now();
        for _ in 0..100 {
            buf.push(gen.next_video());
        }
        // Asking for more pre-roll than the buffer holds: start at the
        // oldest keyframe, pre-roll is best-effort.
        let since = t0 - Duration::from_secs(100);
        let first = buf
            .drain_from_keyframe(since)
            .next()
            .expect("falls back to oldest keyframe");
        assert!(first.is_video_keyframe());
        assert_eq!(first.arrival.realtime, t0);
    }

    #[test]
    fn drain_empty_without_keyframe() {
        let global = GlobalBudget::new(1 << 30);
        let buf = new_buffer(1 << 20, &global);
        assert!(buf.drain_from_keyframe(Time::MIN).next().is_none());
    }

    #[test]
    fn dedupes_equal_timestamp_packets() {
        let global = GlobalBudget::new(1 << 30);
        let mut buf = new_buffer(1 << 20, &global);
        let mut gen = PacketGen::new(25, 5);
        let p = gen.next_video();
        buf.push(p.clone());
        buf.push(p);
        assert_eq!(buf.stats().count, 1);
        assert_eq!(buf.stats().duplicate_packets, 1);
    }

    #[test]
    fn clear_releases_global_budget() {
        let global = GlobalBudget::new(1 << 30);
        let mut buf = new_buffer(1 << 20, &global);
        let mut gen = PacketGen::new(25, 5);
        for _ in 0..20 {
            buf.push(gen.next_video());
        }
        assert!(global.used_bytes() > 0);
        buf.clear();
        assert_eq!(global.used_bytes(), 0);
        assert_eq!(buf.stats().count, 0);
    }

    #[test]
    fn global_pressure_forces_shedding() {
        let frame_size = 1000;
        let global = GlobalBudget::new((frame_size * 10) as i64);
        let mut a = new_buffer(1 << 20, &global);
        let mut b = new_buffer(1 << 20, &global);
        let mut gen_a = PacketGen::new(25, 5).with_frame_size(frame_size);
        let mut gen_b = PacketGen::new(25, 5).with_frame_size(frame_size);
        for _ in 0..50 {
            a.push(gen_a.next_video());
            b.push(gen_b.next_video());
        }
        assert!(a.stats().dropped_packets + b.stats().dropped_packets > 0);
    }
}

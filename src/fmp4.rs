// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Fragmented `.mp4` writing.
//!
//! Layout: `ftyp` + `moov` (written at open, before any sample), then one
//! `moof`/`mdat` pair per GOP. Because every fragment is self-describing,
//! the file on disk is playable up to the last completed fragment even if
//! the process is killed mid-write; no index rewrite happens on close.
//!
//! See the BMFF spec, ISO/IEC 14496-12:2015.

use crate::pkt::CodecParameters;
use base::{err, Error};
use bytes::{BufMut, BytesMut};
use std::io::Write;

/// Writes a complete box of the given type: a `u32` length placeholder and
/// fourcc, the body, then the patched length.
macro_rules! write_box {
    ($buf:expr, $fourcc:expr, $b:block) => {{
        let pos_start = $buf.len();
        $buf.put_u32(0); // length placeholder
        $buf.extend_from_slice(&$fourcc[..]);
        $b;
        let len = u32::try_from($buf.len() - pos_start).expect("box length fits in u32");
        $buf[pos_start..pos_start + 4].copy_from_slice(&len.to_be_bytes());
    }};
}
pub(crate) use write_box;

// Sample flags, ISO/IEC 14496-12 section 8.8.3.1.
// sample_depends_on=2: an independently decodable (sync) sample.
const SYNC_SAMPLE_FLAGS: u32 = 0x0200_0000;
// sample_depends_on=1 plus sample_is_non_sync_sample.
const NON_SYNC_SAMPLE_FLAGS: u32 = 0x0101_0000;

// trun flags, ISO/IEC 14496-12 section 8.8.8.1.
const TRUN_DATA_OFFSET: u32 = 0x000001;
const TRUN_SAMPLE_DURATION: u32 = 0x000100;
const TRUN_SAMPLE_SIZE: u32 = 0x000200;
const TRUN_SAMPLE_FLAGS: u32 = 0x000400;
const TRUN_SAMPLE_CTS: u32 = 0x000800;

const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;

#[derive(Copy, Clone, Debug)]
struct Sample {
    duration: u32,
    size: u32,
    flags: u32,

    /// `pts - dts`, signed (trun version 1).
    cts_offset: i32,
}

/// Per-track accumulation for the fragment in progress.
struct TrakState {
    track_id: u32,
    timescale: u32,
    samples: Vec<Sample>,
    data: Vec<u8>,

    /// `baseMediaDecodeTime` of the pending fragment: its first sample's DTS.
    fragment_start_dts: i64,

    last_dts: Option<i64>,

    /// Estimate for the one sample per fragment whose successor is unknown.
    default_duration: u32,

    total_samples: u64,
    total_duration: u64,
}

impl TrakState {
    fn new(track_id: u32, timescale: u32, default_duration: u32) -> Self {
        TrakState {
            track_id,
            timescale,
            samples: Vec::new(),
            data: Vec::new(),
            fragment_start_dts: 0,
            last_dts: None,
            default_duration,
            total_samples: 0,
            total_duration: 0,
        }
    }

    fn add_sample(&mut self, data: &[u8], dts: i64, cts_offset: i32, flags: u32, duration: Option<u32>) {
        if self.samples.is_empty() {
            self.fragment_start_dts = dts;
        } else if let Some(prev_dts) = self.last_dts {
            // Close out the previous sample's duration now that its
            // successor's DTS is known.
            let d = u32::try_from(dts - prev_dts).expect("normalizer keeps DTS monotonic");
            let prev = self.samples.last_mut().expect("samples is non-empty");
            if prev.duration == 0 {
                prev.duration = d;
            }
        }
        self.samples.push(Sample {
            duration: duration.unwrap_or(0), // patched by the next sample or at flush
            size: u32::try_from(data.len()).expect("sample fits in u32"),
            flags,
            cts_offset,
        });
        self.last_dts = Some(dts);
        self.data.extend_from_slice(data);
    }

    /// Finalizes pending sample durations. `end_dts` is the DTS at which the
    /// fragment ends (the next sample's DTS), when known.
    fn close_fragment(&mut self, end_dts: Option<i64>) {
        if let (Some(last), Some(last_dts)) = (self.samples.last_mut(), self.last_dts) {
            if last.duration == 0 {
                last.duration = match end_dts {
                    Some(end) if end > last_dts => {
                        u32::try_from(end - last_dts).expect("duration fits in u32")
                    }
                    _ => self.default_duration,
                };
            }
            // Refine the estimate from what this fragment observed.
            if let Some(first) = self.samples.first() {
                if first.duration > 0 {
                    self.default_duration = first.duration;
                }
            }
        }
        for s in &self.samples {
            self.total_duration += u64::from(s.duration);
        }
        self.total_samples += self.samples.len() as u64;
    }

    /// Writes tfhd + tfdt + trun inside a traf. Returns the moof-relative
    /// byte position of the trun's i32 `data_offset`.
    fn write_traf(&self, buf: &mut BytesMut, is_video: bool) -> usize {
        let data_offset_pos;
        write_box!(buf, b"traf", {
            write_box!(buf, b"tfhd", {
                buf.put_u32(0x020000); // default-base-is-moof
                buf.put_u32(self.track_id);
            });
            write_box!(buf, b"tfdt", {
                buf.put_u32(1 << 24); // version=1, flags=0
                buf.put_u64(u64::try_from(self.fragment_start_dts).expect("DTS is non-negative"));
            });
            write_box!(buf, b"trun", {
                let mut flags = TRUN_DATA_OFFSET | TRUN_SAMPLE_DURATION | TRUN_SAMPLE_SIZE;
                if is_video {
                    flags |= TRUN_SAMPLE_FLAGS | TRUN_SAMPLE_CTS;
                }
                buf.put_u32((1 << 24) | flags); // version=1
                buf.put_u32(u32::try_from(self.samples.len()).expect("count fits in u32"));
                data_offset_pos = buf.len();
                buf.put_i32(0); // patched later
                for s in &self.samples {
                    buf.put_u32(s.duration);
                    buf.put_u32(s.size);
                    if is_video {
                        buf.put_u32(s.flags);
                        buf.put_i32(s.cts_offset);
                    }
                }
            });
        });
        data_offset_pos
    }

    fn clear_fragment(&mut self) {
        self.samples.clear();
        self.data.clear();
    }
}

/// Statistics for a finished file.
#[derive(Copy, Clone, Debug, Default)]
pub struct Fmp4Stats {
    pub fragments: u32,
    pub video_samples: u64,
    pub audio_samples: u64,
    pub bytes_written: u64,
}

/// Writes fragmented `.mp4` data to `inner`.
pub struct Fmp4Writer<W: Write> {
    inner: W,
    video: TrakState,
    audio: Option<TrakState>,
    seq_no: u32,
    bytes_written: u64,
}

impl<W: Write> Fmp4Writer<W> {
    /// Creates a writer and emits the `ftyp` and `moov` header; no samples
    /// are admitted yet.
    pub fn new(
        video_params: &CodecParameters,
        audio_params: Option<&CodecParameters>,
        inner: W,
    ) -> Result<Self, Error> {
        let video_rate = video_params.clock_rate;
        let mut w = Fmp4Writer {
            inner,
            // Default one-sample duration guess: 1/25 s until observed.
            video: TrakState::new(VIDEO_TRACK_ID, video_rate, (video_rate / 25).max(1)),
            audio: audio_params
                .map(|a| TrakState::new(AUDIO_TRACK_ID, a.clock_rate, (a.clock_rate / 50).max(1))),
            seq_no: 0,
            bytes_written: 0,
        };
        let mut buf = BytesMut::with_capacity(
            1024 + video_params.sample_entry.len()
                + audio_params.map(|a| a.sample_entry.len()).unwrap_or(0),
        );
        write_box!(&mut buf, b"ftyp", {
            buf.extend_from_slice(b"isom"); // major_brand
            buf.put_u32(0x200); // minor_version
            buf.extend_from_slice(b"isom"); // compatible_brands
            buf.extend_from_slice(b"iso6"); // (iso6: tfdt et al)
            buf.extend_from_slice(b"mp41");
        });
        w.write_moov(&mut buf, video_params, audio_params);
        w.inner.write_all(&buf)?;
        w.bytes_written += buf.len() as u64;
        Ok(w)
    }

    fn write_moov(
        &self,
        buf: &mut BytesMut,
        video_params: &CodecParameters,
        audio_params: Option<&CodecParameters>,
    ) {
        write_box!(buf, b"moov", {
            write_box!(buf, b"mvhd", {
                buf.put_u32(1 << 24); // version=1, flags=0
                buf.put_u64(0); // creation_time
                buf.put_u64(0); // modification_time
                buf.put_u32(self.video.timescale);
                buf.put_u64(0); // duration: unknown/growing
                buf.put_u32(0x00010000); // rate
                buf.put_u16(0x0100); // volume
                buf.put_u16(0); // reserved
                buf.put_u64(0); // reserved
                for v in &[0x00010000u32, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
                    buf.put_u32(*v); // matrix
                }
                for _ in 0..6 {
                    buf.put_u32(0); // pre_defined
                }
                buf.put_u32(if audio_params.is_some() { 3 } else { 2 }); // next_track_id
            });
            self.write_video_trak(buf, video_params);
            if let (Some(a), Some(t)) = (audio_params, self.audio.as_ref()) {
                write_audio_trak(buf, a, t);
            }
            write_box!(buf, b"mvex", {
                for t in std::iter::once(&self.video).chain(self.audio.as_ref()) {
                    write_box!(buf, b"trex", {
                        buf.put_u32(0); // version, flags
                        buf.put_u32(t.track_id);
                        buf.put_u32(1); // default sample description index
                        buf.put_u32(0); // default sample duration (use trun)
                        buf.put_u32(0); // default sample size (use trun)
                        buf.put_u32(NON_SYNC_SAMPLE_FLAGS); // default sample flags
                    });
                }
            });
        });
    }

    fn write_video_trak(&self, buf: &mut BytesMut, params: &CodecParameters) {
        write_box!(buf, b"trak", {
            write_box!(buf, b"tkhd", {
                buf.put_u32(7); // version=0, flags=enabled|in_movie|in_preview
                buf.put_u32(0); // creation_time
                buf.put_u32(0); // modification_time
                buf.put_u32(VIDEO_TRACK_ID);
                buf.put_u32(0); // reserved
                buf.put_u32(0); // duration
                buf.put_u64(0); // reserved
                buf.put_u16(0); // layer
                buf.put_u16(0); // alternate_group
                buf.put_u16(0); // volume
                buf.put_u16(0); // reserved
                for v in &[0x00010000u32, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
                    buf.put_u32(*v); // matrix
                }
                buf.put_u32(u32::from(params.width) << 16);
                buf.put_u32(u32::from(params.height) << 16);
            });
            write_box!(buf, b"mdia", {
                write_box!(buf, b"mdhd", {
                    buf.put_u32(0); // version, flags
                    buf.put_u32(0); // creation_time
                    buf.put_u32(0); // modification_time
                    buf.put_u32(self.video.timescale);
                    buf.put_u32(0); // duration
                    buf.put_u16(0x55c4); // language=und
                    buf.put_u16(0); // pre_defined
                });
                write_hdlr(buf, b"vide", b"Video\0");
                write_box!(buf, b"minf", {
                    write_box!(buf, b"vmhd", {
                        buf.put_u32(1); // version, flags
                        buf.put_u64(0); // graphicsmode, opcolor
                    });
                    write_dinf(buf);
                    write_stbl(buf, &params.sample_entry);
                });
            });
        });
    }

    /// Admits one video sample. A sync sample closes the fragment in
    /// progress first, so fragments are exactly GOPs.
    pub fn video(&mut self, data: &[u8], dts: i64, pts: i64, is_sync: bool) -> Result<(), Error> {
        if is_sync && !self.video.samples.is_empty() {
            self.flush_fragment(Some(dts))?;
        }
        let flags = if is_sync {
            SYNC_SAMPLE_FLAGS
        } else {
            NON_SYNC_SAMPLE_FLAGS
        };
        let cts = i32::try_from(pts - dts)
            .map_err(|_| err!(OutOfRange, msg("pts-dts offset {} too large", pts - dts)))?;
        self.video.add_sample(data, dts, cts, flags, None);
        Ok(())
    }

    /// Admits one audio sample into whichever fragment is current.
    pub fn audio(&mut self, data: &[u8], dts: i64, duration: u32) -> Result<(), Error> {
        let audio = self
            .audio
            .as_mut()
            .ok_or_else(|| err!(FailedPrecondition, msg("no audio track in this file")))?;
        audio.add_sample(data, dts, 0, NON_SYNC_SAMPLE_FLAGS, Some(duration));
        Ok(())
    }

    /// True if any sample is pending in the current fragment.
    pub fn has_pending(&self) -> bool {
        !self.video.samples.is_empty()
            || self.audio.as_ref().is_some_and(|a| !a.samples.is_empty())
    }

    /// Writes out the pending fragment as a `moof`/`mdat` pair.
    /// `video_end_dts` is the DTS at which the video run ends, when known
    /// (i.e. when flushing because the next keyframe arrived).
    pub fn flush_fragment(&mut self, video_end_dts: Option<i64>) -> Result<(), Error> {
        if !self.has_pending() {
            return Ok(());
        }
        self.video.close_fragment(video_end_dts);
        if let Some(a) = self.audio.as_mut() {
            a.close_fragment(None);
        }

        self.seq_no += 1;
        let mut moof = BytesMut::with_capacity(
            256 + 20 * self.video.samples.len()
                + 12 * self.audio.as_ref().map(|a| a.samples.len()).unwrap_or(0),
        );
        let mut video_offset_pos = None;
        let mut audio_offset_pos = None;
        write_box!(&mut moof, b"moof", {
            write_box!(&mut moof, b"mfhd", {
                moof.put_u32(0); // version, flags
                moof.put_u32(self.seq_no);
            });
            if !self.video.samples.is_empty() {
                video_offset_pos = Some(self.video.write_traf(&mut moof, true));
            }
            if let Some(a) = self.audio.as_ref() {
                if !a.samples.is_empty() {
                    audio_offset_pos = Some(a.write_traf(&mut moof, false));
                }
            }
        });

        // Patch trun data offsets: sample data begins just past the mdat
        // header, video bytes first, then audio.
        let mdat_header = 8;
        let base = i32::try_from(moof.len() + mdat_header).expect("moof fits in i32");
        if let Some(pos) = video_offset_pos {
            moof[pos..pos + 4].copy_from_slice(&base.to_be_bytes());
        }
        if let Some(pos) = audio_offset_pos {
            let off = base + i32::try_from(self.video.data.len()).expect("mdat fits in i32");
            moof[pos..pos + 4].copy_from_slice(&off.to_be_bytes());
        }

        let audio_len = self.audio.as_ref().map(|a| a.data.len()).unwrap_or(0);
        let mdat_len =
            u32::try_from(mdat_header + self.video.data.len() + audio_len).map_err(|_| {
                err!(OutOfRange, msg("fragment too large for 32-bit mdat length"))
            })?;

        // `From<io::Error>` maps ENOSPC and friends to error kinds the
        // controller switches on.
        self.inner.write_all(&moof)?;
        self.inner.write_all(&mdat_len.to_be_bytes())?;
        self.inner.write_all(b"mdat")?;
        self.inner.write_all(&self.video.data)?;
        if let Some(a) = self.audio.as_ref() {
            self.inner.write_all(&a.data)?;
        }
        self.inner.flush()?;
        self.bytes_written += moof.len() as u64 + u64::from(mdat_len);

        self.video.clear_fragment();
        if let Some(a) = self.audio.as_mut() {
            a.clear_fragment();
        }
        Ok(())
    }

    /// Flushes the pending fragment and returns the sink plus statistics.
    pub fn finish(mut self) -> Result<(W, Fmp4Stats), Error> {
        self.flush_fragment(None)?;
        Ok((
            self.inner,
            Fmp4Stats {
                fragments: self.seq_no,
                video_samples: self.video.total_samples,
                audio_samples: self.audio.as_ref().map(|a| a.total_samples).unwrap_or(0),
                bytes_written: self.bytes_written,
            },
        ))
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Total video media duration written so far, in timescale units,
    /// including the pending fragment.
    pub fn video_duration(&self) -> i64 {
        let pending: u64 = self.video.samples.iter().map(|s| u64::from(s.duration)).sum();
        i64::try_from(self.video.total_duration + pending).expect("duration fits in i64")
    }
}

fn write_hdlr(buf: &mut BytesMut, handler: &[u8; 4], name: &[u8]) {
    write_box!(buf, b"hdlr", {
        buf.put_u32(0); // version, flags
        buf.put_u32(0); // pre_defined
        buf.extend_from_slice(handler);
        for _ in 0..3 {
            buf.put_u32(0); // reserved
        }
        buf.extend_from_slice(name); // includes NUL
    });
}

fn write_dinf(buf: &mut BytesMut) {
    write_box!(buf, b"dinf", {
        write_box!(buf, b"dref", {
            buf.put_u32(0); // version, flags
            buf.put_u32(1); // entry_count
            write_box!(buf, b"url ", {
                buf.put_u32(1); // version=0, flags=self-contained
            });
        });
    });
}

/// An stbl whose sample tables are empty; all samples live in fragments.
fn write_stbl(buf: &mut BytesMut, sample_entry: &[u8]) {
    write_box!(buf, b"stbl", {
        write_box!(buf, b"stsd", {
            buf.put_u32(0); // version, flags
            buf.put_u32(1); // entry_count
            buf.extend_from_slice(sample_entry);
        });
        write_box!(buf, b"stts", {
            buf.put_u64(0); // version, flags, entry_count
        });
        write_box!(buf, b"stsc", {
            buf.put_u64(0);
        });
        write_box!(buf, b"stsz", {
            buf.put_u32(0); // version, flags
            buf.put_u64(0); // sample_size, sample_count
        });
        write_box!(buf, b"stco", {
            buf.put_u64(0);
        });
    });
}

fn write_audio_trak(buf: &mut BytesMut, params: &CodecParameters, t: &TrakState) {
    write_box!(buf, b"trak", {
        write_box!(buf, b"tkhd", {
            buf.put_u32(7); // version=0, flags=enabled|in_movie|in_preview
            buf.put_u32(0); // creation_time
            buf.put_u32(0); // modification_time
            buf.put_u32(AUDIO_TRACK_ID);
            buf.put_u32(0); // reserved
            buf.put_u32(0); // duration
            buf.put_u64(0); // reserved
            buf.put_u16(0); // layer
            buf.put_u16(0); // alternate_group
            buf.put_u16(0x0100); // volume
            buf.put_u16(0); // reserved
            for v in &[0x00010000u32, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
                buf.put_u32(*v); // matrix
            }
            buf.put_u64(0); // width, height
        });
        write_box!(buf, b"mdia", {
            write_box!(buf, b"mdhd", {
                buf.put_u32(0); // version, flags
                buf.put_u32(0); // creation_time
                buf.put_u32(0); // modification_time
                buf.put_u32(t.timescale);
                buf.put_u32(0); // duration
                buf.put_u16(0x55c4); // language=und
                buf.put_u16(0); // pre_defined
            });
            write_hdlr(buf, b"soun", b"Audio\0");
            write_box!(buf, b"minf", {
                write_box!(buf, b"smhd", {
                    buf.put_u32(0); // version, flags
                    buf.put_u32(0); // balance, reserved
                });
                write_dinf(buf);
                write_stbl(buf, &params.sample_entry);
            });
        });
    });
}

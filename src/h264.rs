// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! H.264 byte stream handling.
//!
//! Argus mostly treats video as opaque bytes, but H.264 arrives in two
//! wire forms and `.mp4` accepts only one of them. Start-code-delimited
//! Annex B data (ISO/IEC 14496-10 Annex B) must become length-prefixed AVC
//! access units (ISO/IEC 14496-15), and loose SPS/PPS extradata must
//! become an `AVCDecoderConfigurationRecord` inside the `avc1` sample
//! entry. Retina hands us AVC form already; this module covers demuxers
//! and cameras that don't. The start-code split applies unchanged to
//! H.265 samples; H.265 sample entries always come ready-made.

use crate::fmp4::write_box;
use base::{bail, err, Error};
use bytes::{BufMut, BytesMut};
use h264_reader::nal::sps::{SeqParamSetId, SeqParameterSet};
use h264_reader::nal::Nal as _;

const START_CODE: &[u8] = b"\x00\x00\x01";

// NAL unit types, ISO/IEC 14496-10 table 7-1.
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;

fn nal_type(unit: &[u8]) -> u8 {
    unit[0] & 0x1f
}

/// Splits an Annex B byte stream into its NAL units: the byte runs between
/// start codes, minus zero padding (which also covers the four-byte start
/// code form). Emulation prevention bytes are left in place.
///
/// See ISO/IEC 14496-10 section B.2.
fn nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut from = 0;
    for code in memchr::memmem::find_iter(data, START_CODE) {
        push_unit(data, from, code, &mut units);
        from = code + START_CODE.len();
    }
    push_unit(data, from, data.len(), &mut units);
    units
}

fn push_unit<'a>(data: &'a [u8], from: usize, to: usize, units: &mut Vec<&'a [u8]>) {
    let mut unit = &data[from..to];
    while let [head @ .., 0] = unit {
        unit = head;
    }
    if !unit.is_empty() {
        units.push(unit);
    }
}

/// Converts one Annex B sample into the 4-byte-length-prefixed form `.mp4`
/// sample data uses (ISO/IEC 14496-15 section 5.3.2). Reuses `out`'s
/// allocation from sample to sample. The prefix width must agree with the
/// sample entry's `lengthSizeMinusOne`; see [`build_avcc`].
pub fn to_length_prefixed(annexb_sample: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(annexb_sample.len() + 4);
    for unit in nal_units(annexb_sample) {
        let len = u32::try_from(unit.len()).expect("slice length fits in u32");
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(unit);
    }
}

/// Parsed codec extradata: a ready `avc1` sample entry, plus whether
/// sample data needs Annex B → AVC conversion. (Extradata and samples
/// always share a wire form.)
#[derive(Debug, PartialEq, Eq)]
pub struct ExtraData {
    pub sample_entry: Vec<u8>,
    pub rfc6381_codec: String,
    pub width: u16,
    pub height: u16,
    pub need_transform: bool,
}

impl ExtraData {
    /// Parses extradata in either Annex B form (raw SPS/PPS with start
    /// codes) or as an `AVCDecoderConfigurationRecord`.
    pub fn parse(extradata: &[u8], width: u16, height: u16) -> Result<ExtraData, Error> {
        let annex_b = extradata.starts_with(b"\x00\x00\x00\x01")
            || extradata.starts_with(START_CODE);
        let (avcc_body, sps) = if annex_b {
            let (sps_nal, pps_nal) = find_parameter_sets(extradata)?;
            (build_avcc(sps_nal, pps_nal)?, parse_sps(sps_nal)?)
        } else {
            (extradata.to_vec(), sps_from_avcc(extradata)?)
        };
        if avcc_body.len() < 4 {
            bail!(
                InvalidArgument,
                msg("AVC configuration of {} bytes is truncated", avcc_body.len())
            );
        }
        // The configuration's profile/compatibility/level triple doubles as
        // the RFC 6381 codec suffix.
        let rfc6381_codec = format!(
            "avc1.{:02x}{:02x}{:02x}",
            avcc_body[1], avcc_body[2], avcc_body[3]
        );
        let pasp = pixel_aspect_ratio(&sps, width, height);
        Ok(ExtraData {
            sample_entry: build_avc1(width, height, &avcc_body, pasp),
            rfc6381_codec,
            width,
            height,
            need_transform: annex_b,
        })
    }
}

/// Locates the SPS and PPS NAL units within Annex B extradata.
fn find_parameter_sets(data: &[u8]) -> Result<(&[u8], &[u8]), Error> {
    let mut sps = None;
    let mut pps = None;
    for unit in nal_units(data) {
        match nal_type(unit) {
            NAL_SPS => sps = Some(unit),
            NAL_PPS => pps = Some(unit),
            t => bail!(InvalidArgument, msg("unexpected NAL type {t} in extradata")),
        }
    }
    match (sps, pps) {
        (Some(s), Some(p)) => Ok((s, p)),
        _ => bail!(InvalidArgument, msg("extradata must contain both SPS and PPS")),
    }
}

fn parse_sps(nal: &[u8]) -> Result<SeqParameterSet, Error> {
    let nal = h264_reader::nal::RefNal::new(nal, &[], true);
    SeqParameterSet::from_bits(nal.rbsp_bits())
        .map_err(|e| err!(InvalidArgument, msg("bad SPS: {e:?}")))
}

/// Pulls the (single supported) SPS out of an existing
/// `AVCDecoderConfigurationRecord`.
fn sps_from_avcc(extradata: &[u8]) -> Result<SeqParameterSet, Error> {
    let record = h264_reader::avcc::AvcDecoderConfigurationRecord::try_from(extradata)
        .map_err(|e| err!(InvalidArgument, msg("bad AVC configuration: {e:?}")))?;
    if record.num_of_sequence_parameter_sets() != 1 {
        bail!(Unimplemented, msg("expected exactly one SPS"));
    }
    let ctx = record
        .create_context()
        .map_err(|e| err!(InvalidArgument, msg("bad parameter sets: {e:?}")))?;
    ctx.sps_by_id(SeqParamSetId::from_u32(0).expect("0 is a valid id"))
        .cloned()
        .ok_or_else(|| err!(InvalidArgument, msg("no SPS with id 0")))
}

/// Builds an `AVCDecoderConfigurationRecord` (ISO/IEC 14496-15 section
/// 5.2.4.1) from one SPS and one PPS, declaring 4-byte sample lengths to
/// match [`to_length_prefixed`].
fn build_avcc(sps: &[u8], pps: &[u8]) -> Result<Vec<u8>, Error> {
    if sps.len() < 4 {
        bail!(InvalidArgument, msg("SPS of {} bytes is truncated", sps.len()));
    }
    let mut rec = Vec::with_capacity(11 + sps.len() + pps.len());
    rec.push(1); // configurationVersion
    rec.extend_from_slice(&sps[1..4]); // profile, compatibility, level
    rec.push(0xff); // reserved bits + lengthSizeMinusOne=3
    rec.push(0xe1); // reserved bits + numOfSequenceParameterSets=1
    append_param_set(&mut rec, sps)?;
    rec.push(1); // numOfPictureParameterSets
    append_param_set(&mut rec, pps)?;
    Ok(rec)
}

fn append_param_set(rec: &mut Vec<u8>, nal: &[u8]) -> Result<(), Error> {
    let len = u16::try_from(nal.len()).map_err(|_| {
        err!(
            InvalidArgument,
            msg("parameter set of {} bytes doesn't fit", nal.len())
        )
    })?;
    rec.extend_from_slice(&len.to_be_bytes());
    rec.extend_from_slice(nal);
    Ok(())
}

fn pixel_aspect_ratio(sps: &SeqParameterSet, width: u16, height: u16) -> (u16, u16) {
    // The SPS VUI may declare the aspect ratio; many cameras leave it out
    // even on anamorphic sub streams, so fall back to a guess from the
    // well-known modes. For `.mp4` muxing the PixelAspectRatioBox overrides
    // the H.264-level declaration, so the SPS itself needs no fixup.
    sps.vui_parameters
        .as_ref()
        .and_then(|v| v.aspect_ratio_info.as_ref())
        .and_then(|a| a.clone().get())
        .unwrap_or_else(|| default_pixel_aspect_ratio(width, height))
}

fn default_pixel_aspect_ratio(width: u16, height: u16) -> (u16, u16) {
    match (width, height) {
        (320, 240) | (640, 480) => (4, 3),
        (352, 240) | (704, 480) => (40, 33),
        _ => (1, 1),
    }
}

/// Assembles the `avc1` sample entry: a VisualSampleEntry (ISO/IEC
/// 14496-12 sections 8.5.2, 12.1.3) wrapping the configuration box and,
/// for non-square pixels, a PixelAspectRatioBox.
fn build_avc1(width: u16, height: u16, avcc_body: &[u8], pasp: (u16, u16)) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(128 + avcc_body.len());
    write_box!(&mut buf, b"avc1", {
        buf.put_bytes(0, 6); // reserved
        buf.put_u16(1); // data_reference_index
        buf.put_bytes(0, 16); // pre_defined + reserved
        buf.put_u16(width);
        buf.put_u16(height);
        buf.put_u32(0x0048_0000); // horizresolution: 72 dpi
        buf.put_u32(0x0048_0000); // vertresolution
        buf.put_u32(0); // reserved
        buf.put_u16(1); // frame_count
        buf.put_bytes(0, 32); // compressorname
        buf.put_u16(0x0018); // depth
        buf.put_i16(-1); // pre_defined
        write_box!(&mut buf, b"avcC", {
            buf.extend_from_slice(avcc_body);
        });
        if pasp != (1, 1) {
            write_box!(&mut buf, b"pasp", {
                buf.put_u32(pasp.0.into());
                buf.put_u32(pasp.1.into());
            });
        }
    });
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmp4::testutil::{boxes, find};
    use crate::testutil::{self, TEST_PPS, TEST_SPS};

    #[test]
    fn nal_units_handles_both_start_code_forms() {
        // Four-byte code, three-byte code, then a unit with zero padding
        // before the next code.
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x09, 0xf0, // AUD
            0x00, 0x00, 0x01, 0x41, 0x11, 0x22, 0x00, // slice, padded
            0x00, 0x00, 0x01, 0x41, 0x33,
        ];
        let units = nal_units(&data);
        assert_eq!(
            units,
            vec![&[0x09, 0xf0][..], &[0x41, 0x11, 0x22][..], &[0x41, 0x33][..]]
        );
    }

    #[test]
    fn nal_units_of_garbage_is_empty() {
        assert!(nal_units(&[]).is_empty());
        assert!(nal_units(&[0x00, 0x00, 0x00, 0x00]).is_empty());
    }

    #[test]
    fn length_prefixing() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x65, 0xaa, 0xbb, 0xcc,
            0x00, 0x00, 0x01, 0x06, 0x05,
        ];
        let mut out = Vec::new();
        to_length_prefixed(&data, &mut out);
        assert_eq!(
            out,
            [
                0x00, 0x00, 0x00, 0x04, 0x65, 0xaa, 0xbb, 0xcc,
                0x00, 0x00, 0x00, 0x02, 0x06, 0x05,
            ]
        );

        // The output buffer is reused, not appended to.
        to_length_prefixed(&[0x00, 0x00, 0x01, 0x41, 0x07], &mut out);
        assert_eq!(out, [0x00, 0x00, 0x00, 0x02, 0x41, 0x07]);
    }

    /// Walks an `avc1` sample entry, returning `(body, avcc_body)`.
    fn split_entry(entry: &[u8]) -> (&[u8], &[u8]) {
        let body_range = {
            let top = boxes(entry);
            assert_eq!(top.len(), 1);
            assert_eq!(top[0].0, *b"avc1");
            top[0].1.clone()
        };
        let body = &entry[body_range];
        // Children start after the fixed VisualSampleEntry fields.
        let avcc = find(&body[78..], b"avcC");
        (body, &body[78..][avcc])
    }

    #[test]
    fn parse_from_avc_configuration() {
        testutil::init();
        let avcc = testutil::avcc_extradata();
        let e = ExtraData::parse(&avcc, 640, 480).unwrap();
        assert!(!e.need_transform);
        assert_eq!(e.rfc6381_codec, "avc1.42001e");
        assert_eq!((e.width, e.height), (640, 480));

        let (body, avcc_body) = split_entry(&e.sample_entry);
        // A ready-made configuration passes through unchanged.
        assert_eq!(avcc_body, &avcc[..]);
        assert_eq!(&body[24..26], &640u16.to_be_bytes());
        assert_eq!(&body[26..28], &480u16.to_be_bytes());
        // 640x480 is a known anamorphic sub-stream mode: pasp present.
        let pasp = find(&body[78..], b"pasp");
        assert_eq!(&body[78..][pasp], &[0, 0, 0, 4, 0, 0, 0, 3]);
    }

    #[test]
    fn parse_from_annex_b_matches_avcc_path() {
        testutil::init();
        let from_annex_b = ExtraData::parse(&testutil::annex_b_extradata(), 640, 480).unwrap();
        assert!(from_annex_b.need_transform);

        // Both forms describe the same stream, so everything but the
        // transform flag must agree.
        let from_avcc = ExtraData::parse(&testutil::avcc_extradata(), 640, 480).unwrap();
        assert_eq!(from_annex_b.sample_entry, from_avcc.sample_entry);
        assert_eq!(from_annex_b.rfc6381_codec, from_avcc.rfc6381_codec);
    }

    #[test]
    fn built_avcc_layout() {
        let rec = build_avcc(TEST_SPS, TEST_PPS).unwrap();
        // Header: version, then profile/compat/level lifted from the SPS.
        assert_eq!(&rec[..4], &[1, TEST_SPS[1], TEST_SPS[2], TEST_SPS[3]]);
        assert_eq!(rec[4], 0xff); // 4-byte lengths
        assert_eq!(rec[5], 0xe1); // one SPS
        let sps_end = 8 + TEST_SPS.len();
        assert_eq!(&rec[6..8], &(TEST_SPS.len() as u16).to_be_bytes());
        assert_eq!(&rec[8..sps_end], TEST_SPS);
        assert_eq!(rec[sps_end], 1); // one PPS
        assert_eq!(&rec[sps_end + 3..], TEST_PPS);
    }

    #[test]
    fn bad_extradata_is_rejected() {
        testutil::init();
        let e = ExtraData::parse(&[0xde, 0xad, 0xbe, 0xef, 0x42], 640, 480).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidArgument);
        // Annex B extradata with no PPS.
        let mut data = vec![0x00, 0x00, 0x00, 0x01];
        data.extend_from_slice(TEST_SPS);
        let e = ExtraData::parse(&data, 640, 480).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidArgument);
    }

    #[test]
    fn default_aspect_ratios() {
        assert_eq!(default_pixel_aspect_ratio(640, 480), (4, 3));
        assert_eq!(default_pixel_aspect_ratio(704, 480), (40, 33));
        assert_eq!(default_pixel_aspect_ratio(1920, 1080), (1, 1));
    }
}

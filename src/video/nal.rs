//! H264 Annex-B bitstream helpers
//!
//! Splits byte buffers on start codes (`00 00 01` / `00 00 00 01`), classifies
//! NAL unit types, and pulls the coded picture size out of an SPS.

use bytes::{BufMut, Bytes, BytesMut};
use std::ops::Range;

use crate::error::{AppError, Result};

/// 4-byte Annex-B start code used when we emit NAL units
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// H264 NAL unit types the media layer cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NalType {
    /// Coded slice of a non-IDR picture (1)
    NonIdrSlice,
    /// Coded slice of an IDR picture (5)
    IdrSlice,
    /// Supplemental enhancement information (6)
    Sei,
    /// Sequence parameter set (7)
    Sps,
    /// Picture parameter set (8)
    Pps,
    /// Access unit delimiter (9)
    Aud,
    /// Filler data (12)
    Filler,
    /// RTP single-time aggregation packet (24)
    StapA,
    /// RTP fragmentation unit A (28)
    FuA,
    Other(u8),
}

impl NalType {
    /// Classify from the first byte of a NAL unit (the NAL header)
    pub fn from_header(header: u8) -> Self {
        match header & 0x1F {
            1 => NalType::NonIdrSlice,
            5 => NalType::IdrSlice,
            6 => NalType::Sei,
            7 => NalType::Sps,
            8 => NalType::Pps,
            9 => NalType::Aud,
            12 => NalType::Filler,
            24 => NalType::StapA,
            28 => NalType::FuA,
            other => NalType::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            NalType::NonIdrSlice => 1,
            NalType::IdrSlice => 5,
            NalType::Sei => 6,
            NalType::Sps => 7,
            NalType::Pps => 8,
            NalType::Aud => 9,
            NalType::Filler => 12,
            NalType::StapA => 24,
            NalType::FuA => 28,
            NalType::Other(t) => t,
        }
    }

    /// Slice data that a decoder actually consumes
    pub fn is_vcl(self) -> bool {
        matches!(self, NalType::NonIdrSlice | NalType::IdrSlice)
    }

    pub fn is_parameter_set(self) -> bool {
        matches!(self, NalType::Sps | NalType::Pps)
    }
}

impl std::fmt::Display for NalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NalType::NonIdrSlice => write!(f, "non-IDR slice"),
            NalType::IdrSlice => write!(f, "IDR slice"),
            NalType::Sei => write!(f, "SEI"),
            NalType::Sps => write!(f, "SPS"),
            NalType::Pps => write!(f, "PPS"),
            NalType::Aud => write!(f, "AUD"),
            NalType::Filler => write!(f, "filler"),
            NalType::StapA => write!(f, "STAP-A"),
            NalType::FuA => write!(f, "FU-A"),
            NalType::Other(t) => write!(f, "type {}", t),
        }
    }
}

/// Find the next start code at or after `from`, returning `(position, length)`
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                return Some((i, 4));
            }
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
        }
        i += 1;
    }
    None
}

/// Byte ranges of every NAL unit in `buffer`, each range including its
/// leading start code. Bytes before the first start code are ignored and
/// empty units (back-to-back start codes) are skipped.
pub fn nal_unit_ranges(buffer: &[u8]) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let Some((mut unit_start, mut code_len)) = find_start_code(buffer, 0) else {
        return ranges;
    };

    loop {
        let payload_start = unit_start + code_len;
        match find_start_code(buffer, payload_start) {
            Some((next, next_len)) => {
                if next > payload_start {
                    ranges.push(unit_start..next);
                }
                unit_start = next;
                code_len = next_len;
            }
            None => {
                if buffer.len() > payload_start {
                    ranges.push(unit_start..buffer.len());
                }
                break;
            }
        }
    }

    ranges
}

/// Split an Annex-B buffer into NAL units (start codes kept, input order)
pub fn find_nal_units(buffer: &Bytes) -> Vec<Bytes> {
    nal_unit_ranges(buffer)
        .into_iter()
        .map(|r| buffer.slice(r))
        .collect()
}

/// Drop a leading 3- or 4-byte start code if present
pub fn strip_start_code(unit: &[u8]) -> &[u8] {
    if unit.starts_with(&START_CODE) {
        &unit[4..]
    } else if unit.starts_with(&[0, 0, 1]) {
        &unit[3..]
    } else {
        unit
    }
}

/// NAL type of a unit, with or without its start code
pub fn nal_type(unit: &[u8]) -> Option<NalType> {
    strip_start_code(unit).first().map(|h| NalType::from_header(*h))
}

/// Whether an Annex-B access unit contains an IDR slice
pub fn is_keyframe(data: &[u8]) -> bool {
    nal_unit_ranges(data)
        .into_iter()
        .any(|r| nal_type(&data[r]) == Some(NalType::IdrSlice))
}

/// SPS/PPS found in an access unit, without start codes
#[derive(Debug, Clone, Default)]
pub struct ParameterSets {
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

impl ParameterSets {
    pub fn is_complete(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }
}

/// Extract the last SPS and PPS present in `data`
pub fn extract_parameter_sets(data: &Bytes) -> ParameterSets {
    let mut sets = ParameterSets::default();
    for unit in find_nal_units(data) {
        let code_len = unit.len() - strip_start_code(&unit).len();
        match nal_type(&unit) {
            Some(NalType::Sps) => sets.sps = Some(unit.slice(code_len..)),
            Some(NalType::Pps) => sets.pps = Some(unit.slice(code_len..)),
            _ => {}
        }
    }
    sets
}

/// Convert length-prefixed (AVCC, 4-byte big-endian) NAL units to Annex-B
pub fn avcc_to_annexb(data: &[u8]) -> Result<Bytes> {
    let mut out = BytesMut::with_capacity(data.len());
    let mut pos = 0;

    while pos < data.len() {
        if pos + 4 > data.len() {
            return Err(AppError::VideoError(format!(
                "Truncated AVCC length prefix at offset {}",
                pos
            )));
        }
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        pos += 4;
        if pos + len > data.len() {
            return Err(AppError::VideoError(format!(
                "AVCC NAL unit of {} bytes overruns buffer ({} left)",
                len,
                data.len() - pos
            )));
        }
        out.put_slice(&START_CODE);
        out.put_slice(&data[pos..pos + len]);
        pos += len;
    }

    Ok(out.freeze())
}

/// Largest picture side accepted from a remote SPS
pub const MAX_SPS_DIMENSION: u32 = 16384;

/// Fields recovered from a sequence parameter set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    /// Display width after frame cropping
    pub width: u32,
    /// Display height after frame cropping
    pub height: u32,
}

/// Remove emulation prevention bytes (`00 00 03` -> `00 00`)
fn to_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Some(bit as u32)
    }

    fn bits(&mut self, n: u32) -> Option<u32> {
        let mut v = 0;
        for _ in 0..n {
            v = (v << 1) | self.bit()?;
        }
        Some(v)
    }

    fn ue(&mut self) -> Option<u32> {
        let mut zeros = 0;
        while self.bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return None;
            }
        }
        let rest = self.bits(zeros)?;
        Some((1u32 << zeros) - 1 + rest)
    }

    fn se(&mut self) -> Option<i32> {
        let k = self.ue()?;
        let magnitude = ((k + 1) / 2) as i32;
        Some(if k % 2 == 1 { magnitude } else { -magnitude })
    }
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Option<()> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = r.se()?;
            next = (i64::from(last) + i64::from(delta)).rem_euclid(256) as i32;
        }
        if next != 0 {
            last = next;
        }
    }
    Some(())
}

/// Parse an SPS NAL unit (start code optional) for profile, level and size
pub fn parse_sps(unit: &[u8]) -> Option<SpsInfo> {
    let nal = strip_start_code(unit);
    if nal.len() < 4 || NalType::from_header(nal[0]) != NalType::Sps {
        return None;
    }
    let rbsp = to_rbsp(&nal[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.bits(8)? as u8;
    let _constraints = r.bits(8)?;
    let level_idc = r.bits(8)? as u8;
    let _sps_id = r.ue()?;

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.ue()?;
        if chroma_format_idc == 3 {
            separate_colour_plane = r.bit()? == 1;
        }
        let _bit_depth_luma = r.ue()?;
        let _bit_depth_chroma = r.ue()?;
        let _qpprime_bypass = r.bit()?;
        if r.bit()? == 1 {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let _log2_max_frame_num = r.ue()?;
    match r.ue()? {
        0 => {
            let _log2_max_poc_lsb = r.ue()?;
        }
        1 => {
            let _delta_always_zero = r.bit()?;
            let _offset_non_ref = r.se()?;
            let _offset_top_bottom = r.se()?;
            let cycle = r.ue()?;
            for _ in 0..cycle {
                r.se()?;
            }
        }
        _ => {}
    }
    let _max_ref_frames = r.ue()?;
    let _gaps_allowed = r.bit()?;
    let width_mbs = r.ue()? + 1;
    let height_map_units = r.ue()? + 1;
    let frame_mbs_only = r.bit()?;
    if frame_mbs_only == 0 {
        let _mb_adaptive = r.bit()?;
    }
    let _direct_8x8 = r.bit()?;

    let mut width = width_mbs.checked_mul(16)?;
    let mut height = (2 - frame_mbs_only)
        .checked_mul(height_map_units)?
        .checked_mul(16)?;

    if r.bit()? == 1 {
        let left = r.ue()?;
        let right = r.ue()?;
        let top = r.ue()?;
        let bottom = r.ue()?;

        let chroma_array_type = if separate_colour_plane {
            0
        } else {
            chroma_format_idc
        };
        let (sub_w, sub_h) = match chroma_array_type {
            1 => (2, 2),
            2 => (2, 1),
            _ => (1, 1),
        };
        let (crop_x, crop_y) = if chroma_array_type == 0 {
            (1, 2 - frame_mbs_only)
        } else {
            (sub_w, sub_h * (2 - frame_mbs_only))
        };
        width = width.checked_sub(left.checked_add(right)?.checked_mul(crop_x)?)?;
        height = height.checked_sub(top.checked_add(bottom)?.checked_mul(crop_y)?)?;
    }

    if width == 0 || height == 0 || width > MAX_SPS_DIMENSION || height > MAX_SPS_DIMENSION {
        return None;
    }

    Some(SpsInfo {
        profile_idc,
        level_idc,
        width,
        height,
    })
}

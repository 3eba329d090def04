// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! In-band H.264 SPS parsing.
//!
//! Some cameras advertise 0x0 dimensions in their SDP and only reveal the
//! real frame size inside the bitstream. This module recovers width/height
//! from sequence parameter sets found in Annex B data, and collects SPS/PPS
//! NAL units as extradata for the muxers.

use bytes::Bytes;

const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;

/// Exp-Golomb bit reader over an RBSP (emulation-prevention bytes removed).
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize, // in bits
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Option<u32> {
        let byte = self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Some(u32::from(bit))
    }

    fn read_bits(&mut self, count: u32) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()?;
        }
        Some(value)
    }

    /// ue(v): unsigned Exp-Golomb.
    fn read_ue(&mut self) -> Option<u32> {
        let mut zeros = 0u32;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return None;
            }
        }
        let suffix = self.read_bits(zeros)?;
        Some((1u32 << zeros) - 1 + suffix)
    }

    /// se(v): signed Exp-Golomb.
    fn read_se(&mut self) -> Option<i32> {
        let ue = self.read_ue()?;
        let value = ((ue + 1) / 2) as i32;
        Some(if ue % 2 == 0 { -value } else { value })
    }
}

/// Strip emulation-prevention bytes (00 00 03 xx → 00 00 xx).
fn to_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0u32;
    for &b in data {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: u32) -> Option<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Some(())
}

/// Parse one SPS RBSP payload (after the NAL header byte) and return
/// `(width, height)`.
pub fn parse_sps_dimensions(payload: &[u8]) -> Option<(u32, u32)> {
    let rbsp = to_rbsp(payload);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.read_bits(8)?;
    r.read_bits(8)?; // constraint flags + reserved
    r.read_bits(8)?; // level_idc
    r.read_ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = 0;
    if matches!(profile_idc, 100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135) {
        chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            separate_colour_plane = r.read_bit()?;
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.read_bit()?; // qpprime_y_zero_transform_bypass
        if r.read_bit()? == 1 {
            // seq_scaling_matrix_present
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.read_bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = r.read_ue()?;
    if pic_order_cnt_type == 0 {
        r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        r.read_bit()?; // delta_pic_order_always_zero
        r.read_se()?; // offset_for_non_ref_pic
        r.read_se()?; // offset_for_top_to_bottom_field
        let cycles = r.read_ue()?;
        for _ in 0..cycles {
            r.read_se()?;
        }
    }
    r.read_ue()?; // max_num_ref_frames
    r.read_bit()?; // gaps_in_frame_num_value_allowed

    let pic_width_in_mbs = r.read_ue()? + 1;
    let pic_height_in_map_units = r.read_ue()? + 1;
    let frame_mbs_only = r.read_bit()?;
    if frame_mbs_only == 0 {
        r.read_bit()?; // mb_adaptive_frame_field
    }
    r.read_bit()?; // direct_8x8_inference

    let mut width = pic_width_in_mbs * 16;
    let mut height = (2 - frame_mbs_only) * pic_height_in_map_units * 16;

    if r.read_bit()? == 1 {
        // frame_cropping
        let crop_left = r.read_ue()?;
        let crop_right = r.read_ue()?;
        let crop_top = r.read_ue()?;
        let crop_bottom = r.read_ue()?;

        let chroma_array_type = if separate_colour_plane == 1 { 0 } else { chroma_format_idc };
        let (sub_width, sub_height) = match chroma_array_type {
            1 => (2, 2),
            2 => (2, 1),
            3 => (1, 1),
            _ => (1, 1),
        };
        let crop_unit_x = if chroma_array_type == 0 { 1 } else { sub_width };
        let crop_unit_y = if chroma_array_type == 0 {
            2 - frame_mbs_only
        } else {
            sub_height * (2 - frame_mbs_only)
        };

        width = width.saturating_sub((crop_left + crop_right) * crop_unit_x);
        height = height.saturating_sub((crop_top + crop_bottom) * crop_unit_y);
    }

    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

/// Iterate Annex B NAL units in `data`, yielding `(nal_type, unit)` where
/// the unit includes its NAL header byte.
fn nal_units(data: &[u8]) -> Vec<(u8, &[u8])> {
    let mut units = Vec::new();
    let mut i = 0;
    let mut start: Option<usize> = None;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && (data[i + 2] == 1 || (i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1)) {
            let code_len = if data[i + 2] == 1 { 3 } else { 4 };
            if let Some(s) = start {
                push_unit(data, s, i, &mut units);
            }
            start = Some(i + code_len);
            i += code_len;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        push_unit(data, s, data.len(), &mut units);
    }
    units
}

fn push_unit<'a>(data: &'a [u8], start: usize, end: usize, units: &mut Vec<(u8, &'a [u8])>) {
    if start >= end {
        return;
    }
    let nal_type = data[start] & 0x1F;
    units.push((nal_type, &data[start..end]));
}

/// Scan an Annex B access unit for an SPS and return its dimensions.
pub fn find_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    nal_units(data)
        .into_iter()
        .find(|(t, _)| *t == NAL_SPS)
        .and_then(|(_, unit)| parse_sps_dimensions(&unit[1..]))
}

/// Collect SPS and PPS NAL units (with start codes) as muxer extradata.
pub fn extract_parameter_sets(data: &[u8]) -> Option<Bytes> {
    let mut out = Vec::new();
    let mut have_sps = false;
    for (nal_type, unit) in nal_units(data) {
        if nal_type == NAL_SPS || nal_type == NAL_PPS {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(unit);
            if nal_type == NAL_SPS {
                have_sps = true;
            }
        }
    }
    if have_sps {
        Some(Bytes::from(out))
    } else {
        None
    }
}

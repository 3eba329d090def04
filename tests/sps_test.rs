// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! SPS dimension recovery. Test bitstreams are built with a small
//! Exp-Golomb writer so every expectation is correct by construction.

use sentinel_nvr::ingest::sps;

/// Minimal bit writer producing SPS RBSP payloads.
#[derive(Default)]
struct BitWriter {
    bits: Vec<bool>,
}

impl BitWriter {
    fn put_bits(&mut self, value: u32, count: u32) {
        for i in (0..count).rev() {
            self.bits.push((value >> i) & 1 == 1);
        }
    }

    /// ue(v): unsigned Exp-Golomb.
    fn put_ue(&mut self, value: u32) {
        let k = value + 1;
        let len = 32 - k.leading_zeros();
        self.put_bits(0, len - 1);
        self.put_bits(k, len);
    }

    fn finish(mut self) -> Vec<u8> {
        // rbsp_stop_one_bit + alignment.
        self.bits.push(true);
        while self.bits.len() % 8 != 0 {
            self.bits.push(false);
        }
        self.bits
            .chunks(8)
            .map(|byte| byte.iter().fold(0u8, |acc, &b| (acc << 1) | u8::from(b)))
            .collect()
    }
}

/// Common SPS tail shared by the test payloads: frame_num/POC bookkeeping,
/// dimensions, and optional cropping.
fn sps_tail(w: &mut BitWriter, width_mbs: u32, height_map_units: u32, crop_bottom: Option<u32>) {
    w.put_ue(0); // seq_parameter_set_id
    w.put_ue(0); // log2_max_frame_num_minus4
    w.put_ue(0); // pic_order_cnt_type
    w.put_ue(0); // log2_max_pic_order_cnt_lsb_minus4
    w.put_ue(1); // max_num_ref_frames
    w.put_bits(0, 1); // gaps_in_frame_num_value_allowed
    w.put_ue(width_mbs - 1);
    w.put_ue(height_map_units - 1);
    w.put_bits(1, 1); // frame_mbs_only_flag
    w.put_bits(1, 1); // direct_8x8_inference
    match crop_bottom {
        None => w.put_bits(0, 1),
        Some(bottom) => {
            w.put_bits(1, 1);
            w.put_ue(0); // left
            w.put_ue(0); // right
            w.put_ue(0); // top
            w.put_ue(bottom);
        }
    }
    w.put_bits(0, 1); // vui_parameters_present
}

fn baseline_sps_720p() -> Vec<u8> {
    let mut w = BitWriter::default();
    w.put_bits(66, 8); // profile_idc: baseline
    w.put_bits(0, 8); // constraint flags
    w.put_bits(30, 8); // level_idc
    sps_tail(&mut w, 80, 45, None); // 1280x720, no cropping
    w.finish()
}

#[test]
fn test_baseline_sps_dimensions() {
    let payload = baseline_sps_720p();
    assert_eq!(sps::parse_sps_dimensions(&payload), Some((1280, 720)));
}

#[test]
fn test_cropped_sps_dimensions() {
    // 1920x1088 coded size with 8 rows of bottom cropping → 1920x1080.
    let mut w = BitWriter::default();
    w.put_bits(66, 8);
    w.put_bits(0, 8);
    w.put_bits(40, 8);
    sps_tail(&mut w, 120, 68, Some(4));
    assert_eq!(sps::parse_sps_dimensions(&w.finish()), Some((1920, 1080)));
}

#[test]
fn test_high_profile_sps_dimensions() {
    // profile 100 adds chroma/bit-depth/scaling-matrix fields before the
    // dimension block.
    let mut w = BitWriter::default();
    w.put_bits(100, 8);
    w.put_bits(0, 8);
    w.put_bits(40, 8);
    w.put_ue(1); // chroma_format_idc 4:2:0
    w.put_ue(0); // bit_depth_luma_minus8
    w.put_ue(0); // bit_depth_chroma_minus8
    w.put_bits(0, 1); // qpprime_y_zero_transform_bypass
    w.put_bits(0, 1); // seq_scaling_matrix_present
    sps_tail(&mut w, 80, 45, None);
    assert_eq!(sps::parse_sps_dimensions(&w.finish()), Some((1280, 720)));
}

#[test]
fn test_garbage_is_rejected() {
    assert_eq!(sps::parse_sps_dimensions(&[]), None);
    assert_eq!(sps::parse_sps_dimensions(&[0xFF]), None);
}

fn annexb_access_unit() -> Vec<u8> {
    let sps_payload = baseline_sps_720p();
    let mut data = Vec::new();
    data.extend_from_slice(&[0, 0, 0, 1, 0x67]);
    data.extend_from_slice(&sps_payload);
    data.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE, 0x38, 0x80]); // PPS
    data.extend_from_slice(&[0, 0, 1, 0x65, 0x88, 0x84, 0x00, 0x33]); // IDR slice
    data
}

#[test]
fn test_find_dimensions_in_access_unit() {
    let data = annexb_access_unit();
    assert_eq!(sps::find_dimensions(&data), Some((1280, 720)));

    // An access unit without an SPS yields nothing.
    let delta = [0u8, 0, 0, 1, 0x41, 0x9A, 0x00];
    assert_eq!(sps::find_dimensions(&delta), None);
}

#[test]
fn test_extract_parameter_sets() {
    let data = annexb_access_unit();
    let extradata = sps::extract_parameter_sets(&data).expect("sps+pps present");

    let sps_payload = baseline_sps_720p();
    let mut expected = Vec::new();
    expected.extend_from_slice(&[0, 0, 0, 1, 0x67]);
    expected.extend_from_slice(&sps_payload);
    expected.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE, 0x38, 0x80]);
    assert_eq!(extradata.as_ref(), expected.as_slice(), "slice data excluded, headers kept");

    let delta = [0u8, 0, 0, 1, 0x41, 0x9A];
    assert!(sps::extract_parameter_sets(&delta).is_none());
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Generation of small synthetic H.264 streams for tests.

use super::NalUnit;

/// Writes RBSP bits, and produces a NAL unit with emulation prevention applied.
pub struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    bits: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            current: 0,
            bits: 0,
        }
    }

    pub fn put_bit(&mut self, bit: bool) {
        self.current = (self.current << 1) | bit as u8;
        self.bits += 1;
        if self.bits == 8 {
            self.bytes.push(self.current);
            self.current = 0;
            self.bits = 0;
        }
    }

    pub fn put_bits(&mut self, value: u32, n: u32) {
        for i in (0..n).rev() {
            self.put_bit((value >> i) & 1 == 1);
        }
    }

    pub fn put_ue(&mut self, value: u32) {
        let v = value as u64 + 1;
        let len = 64 - v.leading_zeros();
        for _ in 0..len - 1 {
            self.put_bit(false);
        }
        for i in (0..len).rev() {
            self.put_bit((v >> i) & 1 == 1);
        }
    }

    pub fn put_se(&mut self, value: i32) {
        let code = if value > 0 {
            2 * value as u32 - 1
        } else {
            (-2 * value) as u32
        };
        self.put_ue(code);
    }

    pub fn put_trailing_bits(&mut self) {
        self.put_bit(true);
        while self.bits != 0 {
            self.put_bit(false);
        }
    }

    /// Build a NAL unit with header byte `header` from the written RBSP.
    pub fn into_nal(self, header: u8) -> NalUnit {
        let mut data = vec![header];
        let mut zeros = 0;
        for byte in self.bytes {
            if zeros >= 2 && byte <= 3 {
                data.push(0x03);
                zeros = 0;
            }
            zeros = if byte == 0 { zeros + 1 } else { 0 };
            data.push(byte);
        }
        NalUnit::new(data, 4).unwrap()
    }
}

pub struct SpsParams {
    pub profile_idc: u8,
    pub max_num_ref_frames: u32,
    pub width_mbs: u32,
    pub height_mbs: u32,
    pub crop_bottom: u32,
    pub scaling_matrix: bool,
    pub pic_order_cnt_type: u32,
    /// Cycle of `pic_order_cnt_type` 1. Slices carry no POC deltas in that case.
    pub offset_for_ref_frame: Vec<i32>,
    pub offset_for_non_ref_pic: i32,
}

impl Default for SpsParams {
    fn default() -> Self {
        Self {
            profile_idc: 66,
            max_num_ref_frames: 1,
            width_mbs: 20,
            height_mbs: 15,
            crop_bottom: 0,
            scaling_matrix: false,
            pic_order_cnt_type: 0,
            offset_for_ref_frame: vec![2],
            offset_for_non_ref_pic: -1,
        }
    }
}

/// Progressive SPS with id 0, `log2_max_frame_num` of 4 and `log2_max_pic_order_cnt_lsb` of 6.
pub fn sps_nal(params: &SpsParams) -> NalUnit {
    let mut w = BitWriter::new();
    w.put_bits(params.profile_idc as u32, 8);
    w.put_bits(0, 8); // constraint_set_flags
    w.put_bits(30, 8); // level_idc
    w.put_ue(0); // seq_parameter_set_id
    if params.profile_idc == 100 {
        w.put_ue(1); // chroma_format_idc
        w.put_ue(0); // bit_depth_luma_minus8
        w.put_ue(0); // bit_depth_chroma_minus8
        w.put_bit(false); // qpprime_y_zero_transform_bypass_flag
        w.put_bit(params.scaling_matrix);
        if params.scaling_matrix {
            // First list signals the default one, the others are not transmitted.
            w.put_bit(true);
            w.put_se(-8);
            for _ in 1..8 {
                w.put_bit(false);
            }
        }
    }
    w.put_ue(0); // log2_max_frame_num_minus4
    w.put_ue(params.pic_order_cnt_type);
    match params.pic_order_cnt_type {
        0 => w.put_ue(2), // log2_max_pic_order_cnt_lsb_minus4
        1 => {
            w.put_bit(true); // delta_pic_order_always_zero_flag
            w.put_se(params.offset_for_non_ref_pic);
            w.put_se(0); // offset_for_top_to_bottom_field
            w.put_ue(params.offset_for_ref_frame.len() as u32);
            for &offset in &params.offset_for_ref_frame {
                w.put_se(offset);
            }
        }
        _ => (),
    }
    w.put_ue(params.max_num_ref_frames);
    w.put_bit(false); // gaps_in_frame_num_value_allowed_flag
    w.put_ue(params.width_mbs - 1);
    w.put_ue(params.height_mbs - 1);
    w.put_bit(true); // frame_mbs_only_flag
    w.put_bit(true); // direct_8x8_inference_flag
    w.put_bit(params.crop_bottom != 0);
    if params.crop_bottom != 0 {
        w.put_ue(0);
        w.put_ue(0);
        w.put_ue(0);
        w.put_ue(params.crop_bottom);
    }
    w.put_bit(false); // vui_parameters_present_flag
    w.put_trailing_bits();
    w.into_nal(0x67)
}

#[derive(Default)]
pub struct PpsParams {
    pub init_qp_minus26: i32,
    pub transform_8x8: bool,
    pub entropy_coding: bool,
}

/// PPS with id 0 referring to SPS 0, with deblocking filter control present.
pub fn pps_nal(params: &PpsParams) -> NalUnit {
    let mut w = BitWriter::new();
    w.put_ue(0); // pic_parameter_set_id
    w.put_ue(0); // seq_parameter_set_id
    w.put_bit(params.entropy_coding);
    w.put_bit(false); // bottom_field_pic_order_in_frame_present_flag
    w.put_ue(0); // num_slice_groups_minus1
    w.put_ue(0); // num_ref_idx_l0_default_active_minus1
    w.put_ue(0); // num_ref_idx_l1_default_active_minus1
    w.put_bit(false); // weighted_pred_flag
    w.put_bits(0, 2); // weighted_bipred_idc
    w.put_se(params.init_qp_minus26);
    w.put_se(0); // pic_init_qs_minus26
    w.put_se(0); // chroma_qp_index_offset
    w.put_bit(true); // deblocking_filter_control_present_flag
    w.put_bit(false); // constrained_intra_pred_flag
    w.put_bit(false); // redundant_pic_cnt_present_flag
    if params.transform_8x8 {
        w.put_bit(true);
        w.put_bit(false); // pic_scaling_matrix_present_flag
        w.put_se(2); // second_chroma_qp_index_offset
    }
    w.put_trailing_bits();
    w.into_nal(0x68)
}

fn put_slice_tail(w: &mut BitWriter) {
    w.put_se(0); // slice_qp_delta
    w.put_ue(1); // disable_deblocking_filter_idc
    // Some slice data.
    w.put_bits(0xa5a5, 16);
    w.put_bits(0, 24);
    w.put_trailing_bits();
}

/// Writes `pic_order_cnt_lsb` for streams with `pic_order_cnt_type` 0, nothing otherwise.
fn put_pic_order_cnt(w: &mut BitWriter, pic_order_cnt_lsb: Option<u32>) {
    if let Some(lsb) = pic_order_cnt_lsb {
        // log2_max_pic_order_cnt_lsb is 6, and the PPS has no bottom field POC.
        w.put_bits(lsb % 64, 6);
    }
}

/// IDR I slice for the streams produced by [`sps_nal`] and [`pps_nal`].
pub fn idr_slice_nal(idr_pic_id: u32, pic_order_cnt_lsb: u32) -> NalUnit {
    idr_slice_nal_with_poc(idr_pic_id, Some(pic_order_cnt_lsb))
}

pub fn idr_slice_nal_with_poc(idr_pic_id: u32, pic_order_cnt_lsb: Option<u32>) -> NalUnit {
    let mut w = BitWriter::new();
    w.put_ue(0); // first_mb_in_slice
    w.put_ue(7); // slice_type: I
    w.put_ue(0); // pic_parameter_set_id
    w.put_bits(0, 4); // frame_num
    w.put_ue(idr_pic_id);
    put_pic_order_cnt(&mut w, pic_order_cnt_lsb);
    w.put_bit(false); // no_output_of_prior_pics_flag
    w.put_bit(false); // long_term_reference_flag
    put_slice_tail(&mut w);
    w.into_nal(0x65)
}

/// Reference P slice for the streams produced by [`sps_nal`] and [`pps_nal`].
pub fn p_slice_nal(frame_num: u32, pic_order_cnt_lsb: u32) -> NalUnit {
    p_slice_nal_with_ref_idc(frame_num, Some(pic_order_cnt_lsb), 2)
}

/// P slice with `nal_ref_idc` of `ref_idc`. `pic_order_cnt_lsb` must be `None` for streams
/// whose SPS does not use `pic_order_cnt_type` 0.
pub fn p_slice_nal_with_ref_idc(
    frame_num: u32,
    pic_order_cnt_lsb: Option<u32>,
    ref_idc: u8,
) -> NalUnit {
    let mut w = BitWriter::new();
    w.put_ue(0); // first_mb_in_slice
    w.put_ue(5); // slice_type: P
    w.put_ue(0); // pic_parameter_set_id
    w.put_bits(frame_num % 16, 4);
    put_pic_order_cnt(&mut w, pic_order_cnt_lsb);
    w.put_bit(false); // num_ref_idx_active_override_flag
    w.put_bit(false); // ref_pic_list_modification_flag_l0
    if ref_idc != 0 {
        w.put_bit(false); // adaptive_ref_pic_marking_mode_flag
    }
    put_slice_tail(&mut w);
    w.into_nal((ref_idc << 5) | 1)
}

/// SPS, PPS, an IDR frame and `p_frames` reference P frames.
pub fn simple_stream(max_num_ref_frames: u32, p_frames: u32) -> Vec<NalUnit> {
    let mut nals = vec![
        sps_nal(&SpsParams {
            max_num_ref_frames,
            ..Default::default()
        }),
        pps_nal(&PpsParams::default()),
        idr_slice_nal(0, 0),
    ];
    nals.extend((1..=p_frames).map(|i| p_slice_nal(i, 2 * i)));
    nals
}

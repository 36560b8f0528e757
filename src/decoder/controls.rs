// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateless H.264 codec controls.
//!
//! These mirror the `v4l2_ctrl_h264_*` structures of the V4L2 stateless codec uAPI and are
//! passed as compound controls along with every decode request.

use zerocopy::FromZeroes;

use crate::h264::dpb::Dpb;
use crate::h264::dpb::Picture;
use crate::h264::Pps;
use crate::h264::SliceHeader;
use crate::h264::Sps;

const V4L2_CID_CODEC_STATELESS_BASE: u32 = 0x00a4_0900;
pub const V4L2_CID_STATELESS_H264_DECODE_MODE: u32 = V4L2_CID_CODEC_STATELESS_BASE;
pub const V4L2_CID_STATELESS_H264_START_CODE: u32 = V4L2_CID_CODEC_STATELESS_BASE + 1;
pub const V4L2_CID_STATELESS_H264_SPS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 2;
pub const V4L2_CID_STATELESS_H264_PPS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 3;
pub const V4L2_CID_STATELESS_H264_SCALING_MATRIX: u32 = V4L2_CID_CODEC_STATELESS_BASE + 4;
pub const V4L2_CID_STATELESS_H264_PRED_WEIGHTS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 5;
pub const V4L2_CID_STATELESS_H264_SLICE_PARAMS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 6;
pub const V4L2_CID_STATELESS_H264_DECODE_PARAMS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 7;

pub const V4L2_STATELESS_H264_DECODE_MODE_SLICE_BASED: i32 = 0;
pub const V4L2_STATELESS_H264_DECODE_MODE_FRAME_BASED: i32 = 1;
pub const V4L2_STATELESS_H264_START_CODE_NONE: i32 = 0;
pub const V4L2_STATELESS_H264_START_CODE_ANNEX_B: i32 = 1;

const V4L2_H264_SPS_FLAG_SEPARATE_COLOUR_PLANE: u32 = 0x01;
const V4L2_H264_SPS_FLAG_QPPRIME_Y_ZERO_TRANSFORM_BYPASS: u32 = 0x02;
const V4L2_H264_SPS_FLAG_DELTA_PIC_ORDER_ALWAYS_ZERO: u32 = 0x04;
const V4L2_H264_SPS_FLAG_GAPS_IN_FRAME_NUM_VALUE_ALLOWED: u32 = 0x08;
const V4L2_H264_SPS_FLAG_FRAME_MBS_ONLY: u32 = 0x10;
const V4L2_H264_SPS_FLAG_MB_ADAPTIVE_FRAME_FIELD: u32 = 0x20;
const V4L2_H264_SPS_FLAG_DIRECT_8X8_INFERENCE: u32 = 0x40;

const V4L2_H264_PPS_FLAG_ENTROPY_CODING_MODE: u16 = 0x01;
const V4L2_H264_PPS_FLAG_BOTTOM_FIELD_PIC_ORDER_IN_FRAME_PRESENT: u16 = 0x02;
const V4L2_H264_PPS_FLAG_WEIGHTED_PRED: u16 = 0x04;
const V4L2_H264_PPS_FLAG_DEBLOCKING_FILTER_CONTROL_PRESENT: u16 = 0x08;
const V4L2_H264_PPS_FLAG_CONSTRAINED_INTRA_PRED: u16 = 0x10;
const V4L2_H264_PPS_FLAG_REDUNDANT_PIC_CNT_PRESENT: u16 = 0x20;
const V4L2_H264_PPS_FLAG_TRANSFORM_8X8_MODE: u16 = 0x40;
const V4L2_H264_PPS_FLAG_SCALING_MATRIX_PRESENT: u16 = 0x80;

const V4L2_H264_SLICE_FLAG_DIRECT_SPATIAL_MV_PRED: u32 = 0x01;
const V4L2_H264_SLICE_FLAG_SP_FOR_SWITCH: u32 = 0x02;

pub const V4L2_H264_DPB_ENTRY_FLAG_VALID: u32 = 0x01;
pub const V4L2_H264_DPB_ENTRY_FLAG_ACTIVE: u32 = 0x02;
pub const V4L2_H264_DPB_ENTRY_FLAG_LONG_TERM: u32 = 0x04;

pub const V4L2_H264_DECODE_PARAM_FLAG_IDR_PIC: u32 = 0x01;
pub const V4L2_H264_DECODE_PARAM_FLAG_PFRAME: u32 = 0x08;
pub const V4L2_H264_DECODE_PARAM_FLAG_BFRAME: u32 = 0x10;

pub const V4L2_H264_FRAME_REF: u8 = 0x03;

pub const V4L2_H264_NUM_DPB_ENTRIES: usize = 16;
pub const V4L2_H264_REF_LIST_LEN: usize = 32;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes)]
pub struct H264Sps {
    pub profile_idc: u8,
    pub constraint_set_flags: u8,
    pub level_idc: u8,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub max_num_ref_frames: u8,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: [i32; 255],
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes)]
pub struct H264Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub num_slice_groups_minus1: u8,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub second_chroma_qp_index_offset: i8,
    pub flags: u16,
}

/// Scaling lists in raster scan order.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes)]
pub struct H264ScalingMatrix {
    pub scaling_list_4x4: [[u8; 16]; 6],
    pub scaling_list_8x8: [[u8; 64]; 6],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes)]
pub struct H264WeightFactors {
    pub luma_weight: [i16; 32],
    pub luma_offset: [i16; 32],
    pub chroma_weight: [[i16; 2]; 32],
    pub chroma_offset: [[i16; 2]; 32],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes)]
pub struct H264PredWeights {
    pub luma_log2_weight_denom: u16,
    pub chroma_log2_weight_denom: u16,
    pub weight_factors: [H264WeightFactors; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromZeroes)]
pub struct H264Reference {
    pub fields: u8,
    /// Index of the reference in the `dpb` array of the decode parameters.
    pub index: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes)]
pub struct H264SliceParams {
    pub header_bit_size: u32,
    pub first_mb_in_slice: u32,
    pub slice_type: u8,
    pub colour_plane_id: u8,
    pub redundant_pic_cnt: u8,
    pub cabac_init_idc: u8,
    pub slice_qp_delta: i8,
    pub slice_qs_delta: i8,
    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub reserved: u8,
    pub ref_pic_list0: [H264Reference; V4L2_H264_REF_LIST_LEN],
    pub ref_pic_list1: [H264Reference; V4L2_H264_REF_LIST_LEN],
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes)]
pub struct H264DpbEntry {
    pub reference_ts: u64,
    pub pic_num: u32,
    pub frame_num: u16,
    pub fields: u8,
    pub reserved: [u8; 5],
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes)]
pub struct H264DecodeParams {
    pub dpb: [H264DpbEntry; V4L2_H264_NUM_DPB_ENTRIES],
    pub nal_ref_idc: u16,
    pub frame_num: u16,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt0: i32,
    pub delta_pic_order_cnt1: i32,
    pub dec_ref_pic_marking_bit_size: u32,
    pub pic_order_cnt_bit_size: u32,
    pub slice_group_change_cycle: u32,
    pub reserved: u32,
    pub flags: u32,
}

/// Per-slice controls, only used in slice-based decoding mode.
#[derive(Debug, Clone)]
pub struct SliceControls {
    pub slice_params: H264SliceParams,
    pub pred_weights: H264PredWeights,
}

/// All the controls attached to one decode request.
#[derive(Debug, Clone)]
pub struct FrameControls {
    pub sps: H264Sps,
    pub pps: H264Pps,
    pub scaling_matrix: H264ScalingMatrix,
    pub decode_params: H264DecodeParams,
    pub slice: Option<SliceControls>,
}

/// Converts a frame timestamp into the nanosecond value the driver derives from the `timeval`
/// of the OUTPUT buffer.
pub fn reference_ts(timestamp: u64) -> u64 {
    timestamp * 1000
}

const ZIGZAG_4X4: [usize; 16] = [0, 1, 4, 8, 5, 2, 3, 6, 9, 12, 13, 10, 7, 11, 14, 15];

const ZIGZAG_8X8: [usize; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, 12, 19, 26, 33, 40, 48, 41, 34, 27,
    20, 13, 6, 7, 14, 21, 28, 35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51, 58,
    59, 52, 45, 38, 31, 39, 46, 53, 60, 61, 54, 47, 55, 62, 63,
];

fn zigzag_to_raster<const N: usize>(list: &[u8; N], scan: &[usize; N]) -> [u8; N] {
    let mut raster = [0u8; N];
    for (value, &pos) in list.iter().zip(scan.iter()) {
        raster[pos] = *value;
    }
    raster
}

pub fn sps_control(sps: &Sps) -> H264Sps {
    let mut ctrl = H264Sps::new_zeroed();

    ctrl.profile_idc = sps.profile_idc;
    ctrl.constraint_set_flags = sps.constraint_set_flags;
    ctrl.level_idc = sps.level_idc;
    ctrl.seq_parameter_set_id = sps.seq_parameter_set_id;
    ctrl.chroma_format_idc = sps.chroma_format_idc;
    ctrl.bit_depth_luma_minus8 = sps.bit_depth_luma_minus8;
    ctrl.bit_depth_chroma_minus8 = sps.bit_depth_chroma_minus8;
    ctrl.log2_max_frame_num_minus4 = sps.log2_max_frame_num_minus4;
    ctrl.pic_order_cnt_type = sps.pic_order_cnt_type;
    ctrl.log2_max_pic_order_cnt_lsb_minus4 = sps.log2_max_pic_order_cnt_lsb_minus4;
    ctrl.max_num_ref_frames = sps.max_num_ref_frames;
    ctrl.num_ref_frames_in_pic_order_cnt_cycle = sps.offset_for_ref_frame.len() as u8;
    for (dst, src) in ctrl
        .offset_for_ref_frame
        .iter_mut()
        .zip(sps.offset_for_ref_frame.iter())
    {
        *dst = *src;
    }
    ctrl.offset_for_non_ref_pic = sps.offset_for_non_ref_pic;
    ctrl.offset_for_top_to_bottom_field = sps.offset_for_top_to_bottom_field;
    ctrl.pic_width_in_mbs_minus1 = sps.pic_width_in_mbs_minus1;
    ctrl.pic_height_in_map_units_minus1 = sps.pic_height_in_map_units_minus1;

    for (set, flag) in [
        (
            sps.separate_colour_plane_flag,
            V4L2_H264_SPS_FLAG_SEPARATE_COLOUR_PLANE,
        ),
        (
            sps.qpprime_y_zero_transform_bypass_flag,
            V4L2_H264_SPS_FLAG_QPPRIME_Y_ZERO_TRANSFORM_BYPASS,
        ),
        (
            sps.delta_pic_order_always_zero_flag,
            V4L2_H264_SPS_FLAG_DELTA_PIC_ORDER_ALWAYS_ZERO,
        ),
        (
            sps.gaps_in_frame_num_value_allowed_flag,
            V4L2_H264_SPS_FLAG_GAPS_IN_FRAME_NUM_VALUE_ALLOWED,
        ),
        (sps.frame_mbs_only_flag, V4L2_H264_SPS_FLAG_FRAME_MBS_ONLY),
        (
            sps.mb_adaptive_frame_field_flag,
            V4L2_H264_SPS_FLAG_MB_ADAPTIVE_FRAME_FIELD,
        ),
        (
            sps.direct_8x8_inference_flag,
            V4L2_H264_SPS_FLAG_DIRECT_8X8_INFERENCE,
        ),
    ] {
        if set {
            ctrl.flags |= flag;
        }
    }

    ctrl
}

pub fn pps_control(pps: &Pps) -> H264Pps {
    let mut ctrl = H264Pps::new_zeroed();

    ctrl.pic_parameter_set_id = pps.pic_parameter_set_id;
    ctrl.seq_parameter_set_id = pps.seq_parameter_set_id;
    ctrl.num_slice_groups_minus1 = pps.num_slice_groups_minus1;
    ctrl.num_ref_idx_l0_default_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
    ctrl.num_ref_idx_l1_default_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
    ctrl.weighted_bipred_idc = pps.weighted_bipred_idc;
    ctrl.pic_init_qp_minus26 = pps.pic_init_qp_minus26;
    ctrl.pic_init_qs_minus26 = pps.pic_init_qs_minus26;
    ctrl.chroma_qp_index_offset = pps.chroma_qp_index_offset;
    ctrl.second_chroma_qp_index_offset = pps.second_chroma_qp_index_offset;

    for (set, flag) in [
        (
            pps.entropy_coding_mode_flag,
            V4L2_H264_PPS_FLAG_ENTROPY_CODING_MODE,
        ),
        (
            pps.bottom_field_pic_order_in_frame_present_flag,
            V4L2_H264_PPS_FLAG_BOTTOM_FIELD_PIC_ORDER_IN_FRAME_PRESENT,
        ),
        (pps.weighted_pred_flag, V4L2_H264_PPS_FLAG_WEIGHTED_PRED),
        (
            pps.deblocking_filter_control_present_flag,
            V4L2_H264_PPS_FLAG_DEBLOCKING_FILTER_CONTROL_PRESENT,
        ),
        (
            pps.constrained_intra_pred_flag,
            V4L2_H264_PPS_FLAG_CONSTRAINED_INTRA_PRED,
        ),
        (
            pps.redundant_pic_cnt_present_flag,
            V4L2_H264_PPS_FLAG_REDUNDANT_PIC_CNT_PRESENT,
        ),
        (
            pps.transform_8x8_mode_flag,
            V4L2_H264_PPS_FLAG_TRANSFORM_8X8_MODE,
        ),
        // The scaling matrix control is always provided.
        (true, V4L2_H264_PPS_FLAG_SCALING_MATRIX_PRESENT),
    ] {
        if set {
            ctrl.flags |= flag;
        }
    }

    ctrl
}

/// Scaling matrix in effect for pictures using `pps`, converted to raster order.
pub fn scaling_matrix_control(pps: &Pps) -> H264ScalingMatrix {
    let mut ctrl = H264ScalingMatrix::new_zeroed();
    let lists = &pps.scaling_lists;

    for (dst, src) in ctrl.scaling_list_4x4.iter_mut().zip(lists.list_4x4.iter()) {
        *dst = zigzag_to_raster(src, &ZIGZAG_4X4);
    }
    for (dst, src) in ctrl.scaling_list_8x8.iter_mut().zip(lists.list_8x8.iter()) {
        *dst = zigzag_to_raster(src, &ZIGZAG_8X8);
    }

    ctrl
}

/// Decode parameters for `pic`, whose references are the current content of `dpb`.
pub fn decode_params_control(hdr: &SliceHeader, pic: &Picture, dpb: &Dpb) -> H264DecodeParams {
    let mut ctrl = H264DecodeParams::new_zeroed();

    for (dst, entry) in ctrl.dpb.iter_mut().zip(dpb.entries()) {
        dst.reference_ts = reference_ts(entry.timestamp);
        dst.frame_num = if entry.long_term {
            entry.long_term_frame_idx as u16
        } else {
            entry.frame_num
        };
        dst.pic_num = if entry.long_term {
            entry.long_term_pic_num() as u32
        } else {
            entry.pic_num() as u32
        };
        dst.fields = V4L2_H264_FRAME_REF;
        dst.top_field_order_cnt = entry.top_field_order_cnt;
        dst.bottom_field_order_cnt = entry.bottom_field_order_cnt;
        dst.flags = V4L2_H264_DPB_ENTRY_FLAG_VALID | V4L2_H264_DPB_ENTRY_FLAG_ACTIVE;
        if entry.long_term {
            dst.flags |= V4L2_H264_DPB_ENTRY_FLAG_LONG_TERM;
        }
    }

    ctrl.nal_ref_idc = hdr.nal_ref_idc as u16;
    ctrl.frame_num = hdr.frame_num;
    ctrl.top_field_order_cnt = pic.top_field_order_cnt;
    ctrl.bottom_field_order_cnt = pic.bottom_field_order_cnt;
    ctrl.idr_pic_id = hdr.idr_pic_id;
    ctrl.pic_order_cnt_lsb = hdr.pic_order_cnt_lsb;
    ctrl.delta_pic_order_cnt_bottom = hdr.delta_pic_order_cnt_bottom;
    ctrl.delta_pic_order_cnt0 = hdr.delta_pic_order_cnt[0];
    ctrl.delta_pic_order_cnt1 = hdr.delta_pic_order_cnt[1];
    ctrl.dec_ref_pic_marking_bit_size = hdr.dec_ref_pic_marking_bit_size;
    ctrl.pic_order_cnt_bit_size = hdr.pic_order_cnt_bit_size;
    ctrl.slice_group_change_cycle = hdr.slice_group_change_cycle;

    if hdr.idr_pic_flag {
        ctrl.flags |= V4L2_H264_DECODE_PARAM_FLAG_IDR_PIC;
    }
    if hdr.slice_type.is_p() {
        ctrl.flags |= V4L2_H264_DECODE_PARAM_FLAG_PFRAME;
    } else if hdr.slice_type.is_b() {
        ctrl.flags |= V4L2_H264_DECODE_PARAM_FLAG_BFRAME;
    }

    ctrl
}

fn fill_ref_list(dst: &mut [H264Reference; V4L2_H264_REF_LIST_LEN], list: &[usize]) {
    for (dst, &index) in dst.iter_mut().zip(list.iter()) {
        *dst = H264Reference {
            fields: V4L2_H264_FRAME_REF,
            index: index as u8,
        };
    }
}

/// Slice parameters of `hdr`, using the final reference lists `list0` and `list1`, expressed as
/// indices into the DPB array of the decode parameters.
pub fn slice_controls(hdr: &SliceHeader, list0: &[usize], list1: &[usize]) -> SliceControls {
    let mut slice_params = H264SliceParams::new_zeroed();

    slice_params.header_bit_size = hdr.header_bit_size;
    slice_params.first_mb_in_slice = hdr.first_mb_in_slice;
    slice_params.slice_type = hdr.slice_type as u8;
    slice_params.colour_plane_id = hdr.colour_plane_id;
    slice_params.redundant_pic_cnt = hdr.redundant_pic_cnt;
    slice_params.cabac_init_idc = hdr.cabac_init_idc;
    slice_params.slice_qp_delta = hdr.slice_qp_delta;
    slice_params.slice_qs_delta = hdr.slice_qs_delta;
    slice_params.disable_deblocking_filter_idc = hdr.disable_deblocking_filter_idc;
    slice_params.slice_alpha_c0_offset_div2 = hdr.slice_alpha_c0_offset_div2;
    slice_params.slice_beta_offset_div2 = hdr.slice_beta_offset_div2;
    slice_params.num_ref_idx_l0_active_minus1 = hdr.num_ref_idx_l0_active_minus1;
    slice_params.num_ref_idx_l1_active_minus1 = hdr.num_ref_idx_l1_active_minus1;
    fill_ref_list(&mut slice_params.ref_pic_list0, list0);
    fill_ref_list(&mut slice_params.ref_pic_list1, list1);
    if hdr.direct_spatial_mv_pred_flag {
        slice_params.flags |= V4L2_H264_SLICE_FLAG_DIRECT_SPATIAL_MV_PRED;
    }
    if hdr.sp_for_switch_flag {
        slice_params.flags |= V4L2_H264_SLICE_FLAG_SP_FOR_SWITCH;
    }

    let table = &hdr.pred_weight_table;
    let mut pred_weights = H264PredWeights::new_zeroed();
    pred_weights.luma_log2_weight_denom = table.luma_log2_weight_denom as u16;
    pred_weights.chroma_log2_weight_denom = table.chroma_log2_weight_denom as u16;
    pred_weights.weight_factors[0] = H264WeightFactors {
        luma_weight: table.luma_weight_l0,
        luma_offset: table.luma_offset_l0,
        chroma_weight: table.chroma_weight_l0,
        chroma_offset: table.chroma_offset_l0,
    };
    pred_weights.weight_factors[1] = H264WeightFactors {
        luma_weight: table.luma_weight_l1,
        luma_offset: table.luma_offset_l1,
        chroma_weight: table.chroma_weight_l1,
        chroma_offset: table.chroma_offset_l1,
    };

    SliceControls {
        slice_params,
        pred_weights,
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsing of parameter sets and slice headers.

use std::sync::Arc;

use enumn::N;

use super::BitReader;
use super::NalUnit;
use super::NaluType;
use super::ParseError;

/// Slice types, as signaled by `slice_type % 5`.
#[derive(N, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SliceType {
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P | SliceType::Sp)
    }

    pub fn is_b(&self) -> bool {
        *self == SliceType::B
    }

    pub fn is_intra(&self) -> bool {
        matches!(self, SliceType::I | SliceType::Si)
    }
}

/// Result of [`map_nalu_type_to_slice_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluSliceMapping {
    Slice(SliceType),
    /// Not a picture slice, the NAL unit type is passed through.
    Other(u8),
}

/// Coarse slice type implied by the NAL unit type alone: IDR slices are intra, other coded
/// slices are treated as predicted. Every other type is passed through unmodified.
pub fn map_nalu_type_to_slice_type(nal_type: u8) -> NaluSliceMapping {
    match NaluType::n(nal_type) {
        Some(NaluType::SliceIdr) => NaluSliceMapping::Slice(SliceType::I),
        Some(NaluType::Slice) => NaluSliceMapping::Slice(SliceType::P),
        _ => NaluSliceMapping::Other(nal_type),
    }
}

const DEFAULT_4X4_INTRA: [u8; 16] = [6, 13, 13, 20, 20, 20, 28, 28, 28, 28, 32, 32, 32, 37, 37, 42];
const DEFAULT_4X4_INTER: [u8; 16] = [
    10, 14, 14, 20, 20, 20, 24, 24, 24, 24, 27, 27, 27, 30, 30, 34,
];
const DEFAULT_8X8_INTRA: [u8; 64] = [
    6, 10, 10, 13, 11, 13, 16, 16, 16, 16, 18, 18, 18, 18, 18, 23, 23, 23, 23, 23, 23, 25, 25, 25,
    25, 25, 25, 25, 27, 27, 27, 27, 27, 27, 27, 27, 29, 29, 29, 29, 29, 29, 29, 31, 31, 31, 31, 31,
    31, 33, 33, 33, 33, 33, 36, 36, 36, 36, 38, 38, 38, 40, 40, 42,
];
const DEFAULT_8X8_INTER: [u8; 64] = [
    9, 13, 13, 15, 13, 15, 17, 17, 17, 17, 19, 19, 19, 19, 19, 21, 21, 21, 21, 21, 21, 22, 22, 22,
    22, 22, 22, 22, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 27, 27, 27, 27, 27,
    27, 28, 28, 28, 28, 28, 30, 30, 30, 30, 32, 32, 32, 33, 33, 35,
];

/// Scaling lists in zigzag scan order.
///
/// 4x4 lists are ordered Intra Y, Cb, Cr then Inter Y, Cb, Cr. 8x8 lists are ordered Intra Y,
/// Inter Y, Intra Cb, Inter Cb, Intra Cr, Inter Cr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingLists {
    pub list_4x4: [[u8; 16]; 6],
    pub list_8x8: [[u8; 64]; 6],
}

impl Default for ScalingLists {
    /// Flat lists, used when no scaling matrix is signaled.
    fn default() -> Self {
        Self {
            list_4x4: [[16; 16]; 6],
            list_8x8: [[16; 64]; 6],
        }
    }
}

impl ScalingLists {
    /// The default lists of table 7-3 and 7-4, used by fall-back rule A.
    fn defaults() -> Self {
        let mut lists = Self::default();
        for (i, list) in lists.list_4x4.iter_mut().enumerate() {
            *list = default_4x4(i);
        }
        for (i, list) in lists.list_8x8.iter_mut().enumerate() {
            *list = default_8x8(i);
        }
        lists
    }

    /// Parse `count` scaling lists. Lists that are not transmitted fall back on `fallback` for
    /// the first list of each kind, and on the previous list of the same kind otherwise.
    fn parse(r: &mut BitReader, count: usize, fallback: &ScalingLists) -> Result<Self, ParseError> {
        let mut lists = fallback.clone();

        for i in 0..count {
            let present = r.read_flag()?;
            if i < 6 {
                if present {
                    if parse_scaling_list(r, &mut lists.list_4x4[i])? {
                        lists.list_4x4[i] = default_4x4(i);
                    }
                } else if i != 0 && i != 3 {
                    lists.list_4x4[i] = lists.list_4x4[i - 1];
                }
            } else {
                let j = i - 6;
                if present {
                    if parse_scaling_list(r, &mut lists.list_8x8[j])? {
                        lists.list_8x8[j] = default_8x8(j);
                    }
                } else if j >= 2 {
                    lists.list_8x8[j] = lists.list_8x8[j - 2];
                }
            }
        }

        // Chroma 8x8 lists are only transmitted for 4:4:4 streams.
        for j in count.saturating_sub(6).max(2)..6 {
            lists.list_8x8[j] = lists.list_8x8[j - 2];
        }

        Ok(lists)
    }
}

fn default_4x4(i: usize) -> [u8; 16] {
    if i < 3 {
        DEFAULT_4X4_INTRA
    } else {
        DEFAULT_4X4_INTER
    }
}

fn default_8x8(i: usize) -> [u8; 64] {
    if i % 2 == 0 {
        DEFAULT_8X8_INTRA
    } else {
        DEFAULT_8X8_INTER
    }
}

/// Parse one scaling list into `list`. Returns `true` if the default list must be used instead.
fn parse_scaling_list(r: &mut BitReader, list: &mut [u8]) -> Result<bool, ParseError> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    let mut use_default = false;

    for j in 0..list.len() {
        if next_scale != 0 {
            let delta_scale = r.read_se_bounded("delta_scale", -128, 127)?;
            next_scale = (last_scale + delta_scale + 256) % 256;
            use_default = j == 0 && next_scale == 0;
        }
        list[j] = if next_scale == 0 {
            last_scale as u8
        } else {
            next_scale as u8
        };
        last_scale = list[j] as i32;
    }

    Ok(use_default)
}

/// Sequence parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sps {
    pub profile_idc: u8,
    pub constraint_set_flags: u8,
    pub level_idc: u8,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,
    pub seq_scaling_matrix_present_flag: bool,
    pub scaling_lists: ScalingLists,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub offset_for_ref_frame: Vec<i32>,
    pub max_num_ref_frames: u8,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,
    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,
    pub vui_parameters_present_flag: bool,
}

impl Sps {
    /// Width of the coded frame in pixels.
    pub fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * 16
    }

    /// Height of the coded frame in pixels.
    pub fn height(&self) -> u32 {
        let map_units = self.pic_height_in_map_units_minus1 as u32 + 1;
        let frame_height_in_mbs = (2 - self.frame_mbs_only_flag as u32) * map_units;
        frame_height_in_mbs * 16
    }

    pub fn chroma_array_type(&self) -> u8 {
        if self.separate_colour_plane_flag {
            0
        } else {
            self.chroma_format_idc
        }
    }

    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    pub fn max_pic_order_cnt_lsb(&self) -> u32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    /// Visible size of the frame after cropping, as `(width, height)`.
    pub fn visible_size(&self) -> (u32, u32) {
        if !self.frame_cropping_flag {
            return (self.width(), self.height());
        }

        let (crop_unit_x, crop_unit_y) = match self.chroma_array_type() {
            0 => (1, 2 - self.frame_mbs_only_flag as u32),
            1 => (2, 2 * (2 - self.frame_mbs_only_flag as u32)),
            2 => (2, 2 - self.frame_mbs_only_flag as u32),
            _ => (1, 2 - self.frame_mbs_only_flag as u32),
        };

        let crop_x = crop_unit_x * (self.frame_crop_left_offset + self.frame_crop_right_offset);
        let crop_y = crop_unit_y * (self.frame_crop_top_offset + self.frame_crop_bottom_offset);

        (
            self.width().saturating_sub(crop_x),
            self.height().saturating_sub(crop_y),
        )
    }
}

const HIGH_PROFILES: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// Parse the sequence parameter set contained in `nal`.
pub fn parse_sps(nal: &NalUnit) -> Result<Sps, ParseError> {
    if nal.nalu_type() != Some(NaluType::Sps) {
        return Err(ParseError::UnexpectedNalType(nal.raw_type(), "SPS"));
    }

    let mut r = BitReader::new(nal.payload());
    let mut sps = Sps {
        profile_idc: r.read_bits(8)? as u8,
        constraint_set_flags: r.read_bits(8)? as u8,
        level_idc: r.read_bits(8)? as u8,
        seq_parameter_set_id: r.read_ue_max("seq_parameter_set_id", 31)? as u8,
        chroma_format_idc: 1,
        ..Default::default()
    };

    if HIGH_PROFILES.contains(&sps.profile_idc) {
        sps.chroma_format_idc = r.read_ue_max("chroma_format_idc", 3)? as u8;
        if sps.chroma_format_idc == 3 {
            sps.separate_colour_plane_flag = r.read_flag()?;
        }
        sps.bit_depth_luma_minus8 = r.read_ue_max("bit_depth_luma_minus8", 6)? as u8;
        sps.bit_depth_chroma_minus8 = r.read_ue_max("bit_depth_chroma_minus8", 6)? as u8;
        sps.qpprime_y_zero_transform_bypass_flag = r.read_flag()?;
        sps.seq_scaling_matrix_present_flag = r.read_flag()?;
        if sps.seq_scaling_matrix_present_flag {
            let count = if sps.chroma_format_idc != 3 { 8 } else { 12 };
            sps.scaling_lists = ScalingLists::parse(&mut r, count, &ScalingLists::defaults())?;
        }
    }

    sps.log2_max_frame_num_minus4 = r.read_ue_max("log2_max_frame_num_minus4", 12)? as u8;
    sps.pic_order_cnt_type = r.read_ue_max("pic_order_cnt_type", 2)? as u8;
    match sps.pic_order_cnt_type {
        0 => {
            sps.log2_max_pic_order_cnt_lsb_minus4 =
                r.read_ue_max("log2_max_pic_order_cnt_lsb_minus4", 12)? as u8;
        }
        1 => {
            sps.delta_pic_order_always_zero_flag = r.read_flag()?;
            sps.offset_for_non_ref_pic = r.read_se()?;
            sps.offset_for_top_to_bottom_field = r.read_se()?;
            let num_ref_frames_in_cycle = r.read_ue_max("num_ref_frames_in_pic_order_cnt_cycle", 254)?;
            sps.offset_for_ref_frame = (0..num_ref_frames_in_cycle)
                .map(|_| r.read_se())
                .collect::<Result<_, _>>()?;
        }
        _ => (),
    }

    sps.max_num_ref_frames = r.read_ue_max("max_num_ref_frames", 16)? as u8;
    sps.gaps_in_frame_num_value_allowed_flag = r.read_flag()?;
    sps.pic_width_in_mbs_minus1 = r.read_ue_max("pic_width_in_mbs_minus1", 1023)? as u16;
    sps.pic_height_in_map_units_minus1 = r.read_ue_max("pic_height_in_map_units_minus1", 1023)? as u16;
    sps.frame_mbs_only_flag = r.read_flag()?;
    if !sps.frame_mbs_only_flag {
        sps.mb_adaptive_frame_field_flag = r.read_flag()?;
    }
    sps.direct_8x8_inference_flag = r.read_flag()?;
    sps.frame_cropping_flag = r.read_flag()?;
    if sps.frame_cropping_flag {
        sps.frame_crop_left_offset = r.read_ue()?;
        sps.frame_crop_right_offset = r.read_ue()?;
        sps.frame_crop_top_offset = r.read_ue()?;
        sps.frame_crop_bottom_offset = r.read_ue()?;
    }
    // VUI parameters are not needed for decoding and are skipped.
    sps.vui_parameters_present_flag = r.read_flag()?;

    let (visible_width, visible_height) = sps.visible_size();
    if visible_width == 0 || visible_height == 0 {
        return Err(ParseError::InvalidValue {
            field: "frame_cropping",
            value: 0,
        });
    }

    Ok(sps)
}

/// Picture parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_slice_groups_minus1: u8,
    pub slice_group_map_type: u8,
    pub slice_group_change_rate_minus1: u32,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub transform_8x8_mode_flag: bool,
    pub pic_scaling_matrix_present_flag: bool,
    /// Scaling lists in effect for pictures using this PPS, with all fall-back rules applied.
    pub scaling_lists: ScalingLists,
    pub second_chroma_qp_index_offset: i8,
}

/// Parse the picture parameter set contained in `nal`.
///
/// The SPS it refers to must have been received already, as some syntax elements depend on it.
pub fn parse_pps(nal: &NalUnit, state: &ParameterSetState) -> Result<Pps, ParseError> {
    if nal.nalu_type() != Some(NaluType::Pps) {
        return Err(ParseError::UnexpectedNalType(nal.raw_type(), "PPS"));
    }

    let mut r = BitReader::new(nal.payload());
    let mut pps = Pps {
        pic_parameter_set_id: r.read_ue_max("pic_parameter_set_id", 255)? as u8,
        seq_parameter_set_id: r.read_ue_max("seq_parameter_set_id", 31)? as u8,
        ..Default::default()
    };
    let sps = state.lookup_sps(pps.seq_parameter_set_id)?;

    pps.entropy_coding_mode_flag = r.read_flag()?;
    pps.bottom_field_pic_order_in_frame_present_flag = r.read_flag()?;
    pps.num_slice_groups_minus1 = r.read_ue_max("num_slice_groups_minus1", 7)? as u8;
    if pps.num_slice_groups_minus1 > 0 {
        let num_slice_groups = pps.num_slice_groups_minus1 as u32 + 1;
        pps.slice_group_map_type = r.read_ue_max("slice_group_map_type", 6)? as u8;
        match pps.slice_group_map_type {
            0 => {
                for _ in 0..num_slice_groups {
                    r.read_ue()?; // run_length_minus1
                }
            }
            2 => {
                for _ in 0..num_slice_groups - 1 {
                    r.read_ue()?; // top_left
                    r.read_ue()?; // bottom_right
                }
            }
            3..=5 => {
                r.read_flag()?; // slice_group_change_direction_flag
                pps.slice_group_change_rate_minus1 = r.read_ue()?;
            }
            6 => {
                let pic_size_in_map_units = r.read_ue()? + 1;
                let bits = u32::BITS - (num_slice_groups - 1).leading_zeros();
                for _ in 0..pic_size_in_map_units {
                    r.read_bits(bits)?; // slice_group_id
                }
            }
            _ => (),
        }
    }

    pps.num_ref_idx_l0_default_active_minus1 =
        r.read_ue_max("num_ref_idx_l0_default_active_minus1", 31)? as u8;
    pps.num_ref_idx_l1_default_active_minus1 =
        r.read_ue_max("num_ref_idx_l1_default_active_minus1", 31)? as u8;
    pps.weighted_pred_flag = r.read_flag()?;
    pps.weighted_bipred_idc = r.read_bits(2)? as u8;
    let qp_bd_offset_y = 6 * sps.bit_depth_luma_minus8 as i32;
    pps.pic_init_qp_minus26 = r.read_se_bounded("pic_init_qp_minus26", -(26 + qp_bd_offset_y), 25)? as i8;
    pps.pic_init_qs_minus26 = r.read_se_bounded("pic_init_qs_minus26", -26, 25)? as i8;
    pps.chroma_qp_index_offset = r.read_se_bounded("chroma_qp_index_offset", -12, 12)? as i8;
    pps.deblocking_filter_control_present_flag = r.read_flag()?;
    pps.constrained_intra_pred_flag = r.read_flag()?;
    pps.redundant_pic_cnt_present_flag = r.read_flag()?;

    pps.scaling_lists = sps.scaling_lists.clone();
    pps.second_chroma_qp_index_offset = pps.chroma_qp_index_offset;

    if r.more_rbsp_data() {
        pps.transform_8x8_mode_flag = r.read_flag()?;
        pps.pic_scaling_matrix_present_flag = r.read_flag()?;
        if pps.pic_scaling_matrix_present_flag {
            let count = 6 + if pps.transform_8x8_mode_flag {
                if sps.chroma_format_idc == 3 {
                    6
                } else {
                    2
                }
            } else {
                0
            };
            // Fall-back rule B uses the sequence lists, rule A the default ones.
            let fallback = if sps.seq_scaling_matrix_present_flag {
                sps.scaling_lists.clone()
            } else {
                ScalingLists::defaults()
            };
            pps.scaling_lists = ScalingLists::parse(&mut r, count, &fallback)?;
        }
        pps.second_chroma_qp_index_offset =
            r.read_se_bounded("second_chroma_qp_index_offset", -12, 12)? as i8;
    }

    Ok(pps)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefPicListModification {
    pub modification_of_pic_nums_idc: u8,
    pub abs_diff_pic_num_minus1: u32,
    pub long_term_pic_num: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,
    pub luma_weight_l0: [i16; 32],
    pub luma_offset_l0: [i16; 32],
    pub chroma_weight_l0: [[i16; 2]; 32],
    pub chroma_offset_l0: [[i16; 2]; 32],
    pub luma_weight_l1: [i16; 32],
    pub luma_offset_l1: [i16; 32],
    pub chroma_weight_l1: [[i16; 2]; 32],
    pub chroma_offset_l1: [[i16; 2]; 32],
}

impl Default for PredWeightTable {
    fn default() -> Self {
        Self {
            luma_log2_weight_denom: 0,
            chroma_log2_weight_denom: 0,
            luma_weight_l0: [0; 32],
            luma_offset_l0: [0; 32],
            chroma_weight_l0: [[0; 2]; 32],
            chroma_offset_l0: [[0; 2]; 32],
            luma_weight_l1: [0; 32],
            luma_offset_l1: [0; 32],
            chroma_weight_l1: [[0; 2]; 32],
            chroma_offset_l1: [[0; 2]; 32],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryManagementOperation {
    pub memory_management_control_operation: u8,
    pub difference_of_pic_nums_minus1: u32,
    pub long_term_pic_num: u32,
    pub long_term_frame_idx: u32,
    pub max_long_term_frame_idx_plus1: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecRefPicMarking {
    pub no_output_of_prior_pics_flag: bool,
    pub long_term_reference_flag: bool,
    pub adaptive_ref_pic_marking_mode_flag: bool,
    pub operations: Vec<MemoryManagementOperation>,
}

/// Slice header fields needed to program a stateless decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceHeader {
    pub nal_ref_idc: u8,
    pub idr_pic_flag: bool,
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u8,
    pub colour_plane_id: u8,
    pub frame_num: u16,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub redundant_pic_cnt: u8,
    pub direct_spatial_mv_pred_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,
    pub pred_weight_table: PredWeightTable,
    pub dec_ref_pic_marking: DecRefPicMarking,
    pub cabac_init_idc: u8,
    pub slice_qp_delta: i8,
    pub sp_for_switch_flag: bool,
    pub slice_qs_delta: i8,
    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,
    pub slice_group_change_cycle: u32,
    /// Size of the slice header in bits, i.e. offset of `slice_data()`.
    pub header_bit_size: u32,
    /// Size in bits of the `pic_order_cnt_lsb` and `delta_pic_order_cnt*` elements.
    pub pic_order_cnt_bit_size: u32,
    /// Size in bits of the `dec_ref_pic_marking()` syntax structure.
    pub dec_ref_pic_marking_bit_size: u32,
}

impl SliceHeader {
    pub fn has_mmco5(&self) -> bool {
        self.dec_ref_pic_marking
            .operations
            .iter()
            .any(|op| op.memory_management_control_operation == 5)
    }
}

fn parse_ref_pic_list_modification(
    r: &mut BitReader,
) -> Result<Vec<RefPicListModification>, ParseError> {
    let mut modifications = Vec::new();
    if !r.read_flag()? {
        return Ok(modifications);
    }

    loop {
        let idc = r.read_ue_max("modification_of_pic_nums_idc", 5)? as u8;
        let mut modification = RefPicListModification {
            modification_of_pic_nums_idc: idc,
            ..Default::default()
        };
        match idc {
            0 | 1 => modification.abs_diff_pic_num_minus1 = r.read_ue()?,
            2 => modification.long_term_pic_num = r.read_ue()?,
            3 => break,
            // MVC-only operations.
            _ => return Err(ParseError::Unsupported("inter-view reference list modification")),
        }
        if modifications.len() >= 33 {
            return Err(ParseError::InvalidValue {
                field: "ref_pic_list_modification",
                value: modifications.len() as i64,
            });
        }
        modifications.push(modification);
    }

    Ok(modifications)
}

fn parse_pred_weight_table(
    r: &mut BitReader,
    sps: &Sps,
    hdr: &SliceHeader,
) -> Result<PredWeightTable, ParseError> {
    let mut pwt = PredWeightTable {
        luma_log2_weight_denom: r.read_ue_max("luma_log2_weight_denom", 7)? as u8,
        ..Default::default()
    };
    let chroma = sps.chroma_array_type() != 0;
    if chroma {
        pwt.chroma_log2_weight_denom = r.read_ue_max("chroma_log2_weight_denom", 7)? as u8;
    }

    let default_luma = 1i16 << pwt.luma_log2_weight_denom;
    let default_chroma = 1i16 << pwt.chroma_log2_weight_denom;

    let parse_list = |r: &mut BitReader,
                          count: usize,
                          luma_weight: &mut [i16; 32],
                          luma_offset: &mut [i16; 32],
                          chroma_weight: &mut [[i16; 2]; 32],
                          chroma_offset: &mut [[i16; 2]; 32]|
     -> Result<(), ParseError> {
        for i in 0..count {
            luma_weight[i] = default_luma;
            if r.read_flag()? {
                luma_weight[i] = r.read_se_bounded("luma_weight", -128, 127)? as i16;
                luma_offset[i] = r.read_se_bounded("luma_offset", -128, 127)? as i16;
            }
            if chroma {
                chroma_weight[i] = [default_chroma; 2];
                if r.read_flag()? {
                    for j in 0..2 {
                        chroma_weight[i][j] = r.read_se_bounded("chroma_weight", -128, 127)? as i16;
                        chroma_offset[i][j] = r.read_se_bounded("chroma_offset", -128, 127)? as i16;
                    }
                }
            }
        }
        Ok(())
    };

    parse_list(
        r,
        hdr.num_ref_idx_l0_active_minus1 as usize + 1,
        &mut pwt.luma_weight_l0,
        &mut pwt.luma_offset_l0,
        &mut pwt.chroma_weight_l0,
        &mut pwt.chroma_offset_l0,
    )?;
    if hdr.slice_type.is_b() {
        parse_list(
            r,
            hdr.num_ref_idx_l1_active_minus1 as usize + 1,
            &mut pwt.luma_weight_l1,
            &mut pwt.luma_offset_l1,
            &mut pwt.chroma_weight_l1,
            &mut pwt.chroma_offset_l1,
        )?;
    }

    Ok(pwt)
}

fn parse_dec_ref_pic_marking(
    r: &mut BitReader,
    idr: bool,
) -> Result<DecRefPicMarking, ParseError> {
    let mut marking = DecRefPicMarking::default();

    if idr {
        marking.no_output_of_prior_pics_flag = r.read_flag()?;
        marking.long_term_reference_flag = r.read_flag()?;
        return Ok(marking);
    }

    marking.adaptive_ref_pic_marking_mode_flag = r.read_flag()?;
    if marking.adaptive_ref_pic_marking_mode_flag {
        loop {
            let mmco = r.read_ue_max("memory_management_control_operation", 6)? as u8;
            if mmco == 0 {
                break;
            }
            let mut op = MemoryManagementOperation {
                memory_management_control_operation: mmco,
                ..Default::default()
            };
            if mmco == 1 || mmco == 3 {
                op.difference_of_pic_nums_minus1 = r.read_ue()?;
            }
            if mmco == 2 {
                op.long_term_pic_num = r.read_ue()?;
            }
            if mmco == 3 || mmco == 6 {
                op.long_term_frame_idx = r.read_ue()?;
            }
            if mmco == 4 {
                op.max_long_term_frame_idx_plus1 = r.read_ue()?;
            }
            if marking.operations.len() >= 66 {
                return Err(ParseError::InvalidValue {
                    field: "memory_management_control_operation",
                    value: mmco as i64,
                });
            }
            marking.operations.push(op);
        }
    }

    Ok(marking)
}

/// Parse the header of the slice contained in `nal`, using the active parameter sets.
pub fn parse_slice_header(
    nal: &NalUnit,
    state: &ParameterSetState,
) -> Result<SliceHeader, ParseError> {
    if !nal.is_slice() {
        return Err(ParseError::UnexpectedNalType(nal.raw_type(), "slice"));
    }

    let mut r = BitReader::new(nal.payload());
    let first_mb_in_slice = r.read_ue()?;
    let slice_type_raw = r.read_ue_max("slice_type", 9)?;
    let slice_type = SliceType::n((slice_type_raw % 5) as u8).ok_or(ParseError::InvalidValue {
        field: "slice_type",
        value: slice_type_raw as i64,
    })?;
    let pic_parameter_set_id = r.read_ue_max("pic_parameter_set_id", 255)? as u8;

    let pps = state.lookup_pps(pic_parameter_set_id)?;
    let sps = state.lookup_sps(pps.seq_parameter_set_id)?;

    let idr_pic_flag = nal.is_idr();
    if idr_pic_flag && !slice_type.is_intra() {
        return Err(ParseError::InvalidValue {
            field: "slice_type",
            value: slice_type_raw as i64,
        });
    }

    let mut hdr = SliceHeader {
        nal_ref_idc: nal.ref_idc(),
        idr_pic_flag,
        first_mb_in_slice,
        slice_type,
        pic_parameter_set_id,
        colour_plane_id: 0,
        frame_num: 0,
        field_pic_flag: false,
        bottom_field_flag: false,
        idr_pic_id: 0,
        pic_order_cnt_lsb: 0,
        delta_pic_order_cnt_bottom: 0,
        delta_pic_order_cnt: [0; 2],
        redundant_pic_cnt: 0,
        direct_spatial_mv_pred_flag: false,
        num_ref_idx_active_override_flag: false,
        num_ref_idx_l0_active_minus1: pps.num_ref_idx_l0_default_active_minus1,
        num_ref_idx_l1_active_minus1: pps.num_ref_idx_l1_default_active_minus1,
        ref_pic_list_modification_l0: Vec::new(),
        ref_pic_list_modification_l1: Vec::new(),
        pred_weight_table: Default::default(),
        dec_ref_pic_marking: Default::default(),
        cabac_init_idc: 0,
        slice_qp_delta: 0,
        sp_for_switch_flag: false,
        slice_qs_delta: 0,
        disable_deblocking_filter_idc: 0,
        slice_alpha_c0_offset_div2: 0,
        slice_beta_offset_div2: 0,
        slice_group_change_cycle: 0,
        header_bit_size: 0,
        pic_order_cnt_bit_size: 0,
        dec_ref_pic_marking_bit_size: 0,
    };

    if sps.separate_colour_plane_flag {
        hdr.colour_plane_id = r.read_bits(2)? as u8;
    }
    hdr.frame_num = r.read_bits(sps.log2_max_frame_num_minus4 as u32 + 4)? as u16;
    if !sps.frame_mbs_only_flag {
        hdr.field_pic_flag = r.read_flag()?;
        if hdr.field_pic_flag {
            hdr.bottom_field_flag = r.read_flag()?;
        }
    }
    if idr_pic_flag {
        hdr.idr_pic_id = r.read_ue_max("idr_pic_id", 65535)? as u16;
    }

    let poc_start = r.position();
    if sps.pic_order_cnt_type == 0 {
        hdr.pic_order_cnt_lsb = r.read_bits(sps.log2_max_pic_order_cnt_lsb_minus4 as u32 + 4)? as u16;
        if pps.bottom_field_pic_order_in_frame_present_flag && !hdr.field_pic_flag {
            hdr.delta_pic_order_cnt_bottom = r.read_se()?;
        }
    }
    if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
        hdr.delta_pic_order_cnt[0] = r.read_se()?;
        if pps.bottom_field_pic_order_in_frame_present_flag && !hdr.field_pic_flag {
            hdr.delta_pic_order_cnt[1] = r.read_se()?;
        }
    }
    hdr.pic_order_cnt_bit_size = (r.position() - poc_start) as u32;

    if pps.redundant_pic_cnt_present_flag {
        hdr.redundant_pic_cnt = r.read_ue_max("redundant_pic_cnt", 127)? as u8;
    }
    if slice_type.is_b() {
        hdr.direct_spatial_mv_pred_flag = r.read_flag()?;
    }
    if slice_type.is_p() || slice_type.is_b() {
        hdr.num_ref_idx_active_override_flag = r.read_flag()?;
        if hdr.num_ref_idx_active_override_flag {
            hdr.num_ref_idx_l0_active_minus1 = r.read_ue_max("num_ref_idx_l0_active_minus1", 31)? as u8;
            if slice_type.is_b() {
                hdr.num_ref_idx_l1_active_minus1 =
                    r.read_ue_max("num_ref_idx_l1_active_minus1", 31)? as u8;
            }
        }
    }

    if !slice_type.is_intra() {
        hdr.ref_pic_list_modification_l0 = parse_ref_pic_list_modification(&mut r)?;
    }
    if slice_type.is_b() {
        hdr.ref_pic_list_modification_l1 = parse_ref_pic_list_modification(&mut r)?;
    }

    if (pps.weighted_pred_flag && slice_type.is_p())
        || (pps.weighted_bipred_idc == 1 && slice_type.is_b())
    {
        hdr.pred_weight_table = parse_pred_weight_table(&mut r, sps, &hdr)?;
    }

    if hdr.nal_ref_idc != 0 {
        let marking_start = r.position();
        hdr.dec_ref_pic_marking = parse_dec_ref_pic_marking(&mut r, idr_pic_flag)?;
        hdr.dec_ref_pic_marking_bit_size = (r.position() - marking_start) as u32;
    }

    if pps.entropy_coding_mode_flag && !slice_type.is_intra() {
        hdr.cabac_init_idc = r.read_ue_max("cabac_init_idc", 2)? as u8;
    }
    let qp_bd_offset_y = 6 * sps.bit_depth_luma_minus8 as i32;
    hdr.slice_qp_delta = r.read_se_bounded("slice_qp_delta", -(51 + qp_bd_offset_y), 51)? as i8;
    if matches!(slice_type, SliceType::Sp | SliceType::Si) {
        if slice_type == SliceType::Sp {
            hdr.sp_for_switch_flag = r.read_flag()?;
        }
        hdr.slice_qs_delta = r.read_se_bounded("slice_qs_delta", -51, 51)? as i8;
    }
    if pps.deblocking_filter_control_present_flag {
        hdr.disable_deblocking_filter_idc = r.read_ue_max("disable_deblocking_filter_idc", 2)? as u8;
        if hdr.disable_deblocking_filter_idc != 1 {
            hdr.slice_alpha_c0_offset_div2 = r.read_se_bounded("slice_alpha_c0_offset_div2", -6, 6)? as i8;
            hdr.slice_beta_offset_div2 = r.read_se_bounded("slice_beta_offset_div2", -6, 6)? as i8;
        }
    }
    if pps.num_slice_groups_minus1 > 0 && (3..=5).contains(&pps.slice_group_map_type) {
        let pic_size_in_map_units = (sps.pic_width_in_mbs_minus1 as u32 + 1)
            * (sps.pic_height_in_map_units_minus1 as u32 + 1);
        let change_rate = pps.slice_group_change_rate_minus1 + 1;
        let max = pic_size_in_map_units.div_ceil(change_rate);
        // Ceil(Log2(max + 1))
        let bits = u32::BITS - max.leading_zeros();
        hdr.slice_group_change_cycle = r.read_bits(bits)?;
    }

    hdr.header_bit_size = r.position() as u32;

    Ok(hdr)
}

/// Parameter sets in effect for the stream being decoded.
///
/// Only one SPS and one PPS are kept: a newly received set replaces the previous one.
#[derive(Debug, Default, Clone)]
pub struct ParameterSetState {
    sps: Option<Arc<Sps>>,
    pps: Option<Arc<Pps>>,
}

impl ParameterSetState {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn sps(&self) -> Option<&Arc<Sps>> {
        self.sps.as_ref()
    }

    pub fn pps(&self) -> Option<&Arc<Pps>> {
        self.pps.as_ref()
    }

    pub fn lookup_sps(&self, id: u8) -> Result<&Arc<Sps>, ParseError> {
        self.sps
            .as_ref()
            .filter(|sps| sps.seq_parameter_set_id == id)
            .ok_or(ParseError::MissingSps(id as u32))
    }

    pub fn lookup_pps(&self, id: u8) -> Result<&Arc<Pps>, ParseError> {
        self.pps
            .as_ref()
            .filter(|pps| pps.pic_parameter_set_id == id)
            .ok_or(ParseError::MissingPps(id as u32))
    }

    /// Parse `nal` if it is a parameter set, and install it on success.
    ///
    /// Returns `Ok(true)` if a parameter set has been installed, `Ok(false)` if `nal` was not
    /// a parameter set. Malformed sets are not installed.
    pub fn process(&mut self, nal: &NalUnit) -> Result<bool, ParseError> {
        match nal.nalu_type() {
            Some(NaluType::Sps) => {
                let sps = parse_sps(nal)?;
                log::debug!(
                    "new SPS {}: {}x{}, profile {}, {} reference frames",
                    sps.seq_parameter_set_id,
                    sps.width(),
                    sps.height(),
                    sps.profile_idc,
                    sps.max_num_ref_frames
                );
                self.sps = Some(Arc::new(sps));
                Ok(true)
            }
            Some(NaluType::Pps) => {
                let pps = parse_pps(nal, self)?;
                log::debug!("new PPS {}", pps.pic_parameter_set_id);
                self.pps = Some(Arc::new(pps));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use super::map_nalu_type_to_slice_type;
use super::parse_slice_header;
use super::NalUnit;
use super::NaluSliceMapping;
use super::NaluType;
use super::ParameterSetState;
use super::SliceHeader;

/// The slices making up one coded picture.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub nals: Vec<NalUnit>,
}

impl AccessUnit {
    pub fn is_idr(&self) -> bool {
        self.nals.first().is_some_and(NalUnit::is_idr)
    }

    /// Slice type implied by the NAL type of the first slice.
    pub fn frame_kind(&self) -> NaluSliceMapping {
        self.nals
            .first()
            .map_or(NaluSliceMapping::Other(0), |nal| {
                map_nalu_type_to_slice_type(nal.raw_type())
            })
    }
}

/// Fields whose change between two slices marks the first slice of a new picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PictureKey {
    frame_num: u16,
    pic_parameter_set_id: u8,
    field_pic_flag: bool,
    bottom_field_flag: bool,
    is_reference: bool,
    idr_pic_flag: bool,
    idr_pic_id: u16,
    pic_order_cnt_lsb: u16,
    delta_pic_order_cnt_bottom: i32,
    delta_pic_order_cnt: [i32; 2],
}

impl From<&SliceHeader> for PictureKey {
    fn from(hdr: &SliceHeader) -> Self {
        Self {
            frame_num: hdr.frame_num,
            pic_parameter_set_id: hdr.pic_parameter_set_id,
            field_pic_flag: hdr.field_pic_flag,
            bottom_field_flag: hdr.bottom_field_flag,
            is_reference: hdr.nal_ref_idc != 0,
            idr_pic_flag: hdr.idr_pic_flag,
            idr_pic_id: hdr.idr_pic_id,
            pic_order_cnt_lsb: hdr.pic_order_cnt_lsb,
            delta_pic_order_cnt_bottom: hdr.delta_pic_order_cnt_bottom,
            delta_pic_order_cnt: hdr.delta_pic_order_cnt,
        }
    }
}

/// Groups slice NAL units into access units.
///
/// An access unit is complete when the first slice of the next picture arrives, or when a NAL
/// unit that can only appear between pictures (delimiter, parameter set, SEI, end of sequence)
/// is pushed.
#[derive(Default)]
pub struct AccessUnitAssembler {
    current: Vec<NalUnit>,
    key: Option<PictureKey>,
}

impl AccessUnitAssembler {
    pub fn new() -> Self {
        Default::default()
    }

    /// Push `nal`, returning the access unit it completes, if any.
    ///
    /// Slices are parsed using `state`, which must reflect the parameter sets received before
    /// `nal`. Slices that cannot be parsed are dropped with a warning.
    pub fn push(&mut self, nal: NalUnit, state: &ParameterSetState) -> Option<AccessUnit> {
        if nal.is_slice() {
            let hdr = match parse_slice_header(&nal, state) {
                Ok(hdr) => hdr,
                Err(e) => {
                    log::warn!("dropping slice: {}", e);
                    return None;
                }
            };
            let key = PictureKey::from(&hdr);

            let completed = if hdr.first_mb_in_slice == 0 || self.key != Some(key) {
                self.flush()
            } else {
                None
            };
            self.key = Some(key);
            self.current.push(nal);
            return completed;
        }

        match nal.nalu_type() {
            Some(
                NaluType::AuDelimiter
                | NaluType::Sps
                | NaluType::Pps
                | NaluType::Sei
                | NaluType::SeqEnd
                | NaluType::StreamEnd
                | NaluType::PrefixUnit
                | NaluType::SubsetSps
                | NaluType::DepthSps,
            ) => self.flush(),
            _ => None,
        }
    }

    /// Return the access unit being assembled, if any.
    pub fn flush(&mut self) -> Option<AccessUnit> {
        self.key = None;
        if self.current.is_empty() {
            return None;
        }
        Some(AccessUnit {
            nals: std::mem::take(&mut self.current),
        })
    }
}

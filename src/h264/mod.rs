// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 bitstream parsing.
//!
//! This module splits Annex-B streams into NAL units, parses parameter sets and slice headers,
//! groups slices into access units and keeps track of the decoded picture buffer, which is all
//! a stateless decoder needs from the host.

mod access_unit;
mod bitreader;
pub mod dpb;
mod nalu;
mod parser;
#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;

pub use access_unit::AccessUnit;
pub use access_unit::AccessUnitAssembler;
pub use bitreader::BitReader;
pub use nalu::AnnexBReader;
pub use nalu::AnnexBScanner;
pub use nalu::NalSource;
pub use nalu::NalUnit;
pub use nalu::NaluType;
pub use parser::map_nalu_type_to_slice_type;
pub use parser::parse_pps;
pub use parser::parse_slice_header;
pub use parser::parse_sps;
pub use parser::DecRefPicMarking;
pub use parser::MemoryManagementOperation;
pub use parser::NaluSliceMapping;
pub use parser::ParameterSetState;
pub use parser::Pps;
pub use parser::PredWeightTable;
pub use parser::RefPicListModification;
pub use parser::ScalingLists;
pub use parser::SliceHeader;
pub use parser::SliceType;
pub use parser::Sps;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected end of bitstream")]
    EndOfStream,
    #[error("exp-golomb code longer than 32 bits")]
    InvalidExpGolomb,
    #[error("invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: i64 },
    #[error("unsupported stream feature: {0}")]
    Unsupported(&'static str),
    #[error("NAL unit is empty")]
    EmptyNal,
    #[error("forbidden_zero_bit is set")]
    ForbiddenBit,
    #[error("NAL unit of type {0} is not a {1}")]
    UnexpectedNalType(u8, &'static str),
    #[error("no SPS with id {0} has been received")]
    MissingSps(u32),
    #[error("no PPS with id {0} has been received")]
    MissingPps(u32),
}

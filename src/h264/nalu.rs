// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Splitting of Annex-B byte streams into NAL units.

use std::io::Read;

use enumn::N;

use super::ParseError;

/// NAL unit types, as defined in table 7-1 of the H.264 specification.
#[derive(N, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

/// A single NAL unit, header byte included, without its start code.
#[derive(Clone, PartialEq, Eq)]
pub struct NalUnit {
    data: Vec<u8>,
    start_code_len: usize,
}

impl NalUnit {
    /// Build a NAL unit from the bytes following a start code of `start_code_len` bytes.
    ///
    /// Trailing zero bytes belong to the stream and not to the unit, so they are stripped.
    pub fn new(mut data: Vec<u8>, start_code_len: usize) -> Result<Self, ParseError> {
        let len = data.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
        data.truncate(len);

        match data.first() {
            None => Err(ParseError::EmptyNal),
            Some(header) if header & 0x80 != 0 => Err(ParseError::ForbiddenBit),
            Some(_) => Ok(Self {
                data,
                start_code_len,
            }),
        }
    }

    /// Raw `nal_unit_type` of the unit.
    pub fn raw_type(&self) -> u8 {
        self.data[0] & 0x1f
    }

    /// Type of the unit, or `None` if it is reserved or unspecified.
    pub fn nalu_type(&self) -> Option<NaluType> {
        NaluType::n(self.raw_type())
    }

    pub fn ref_idc(&self) -> u8 {
        (self.data[0] >> 5) & 0x3
    }

    pub fn is_slice(&self) -> bool {
        matches!(self.raw_type(), 1 | 5)
    }

    pub fn is_idr(&self) -> bool {
        self.raw_type() == NaluType::SliceIdr as u8
    }

    /// Whole unit, starting with the NAL header byte.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Unit content following the NAL header byte.
    pub fn payload(&self) -> &[u8] {
        &self.data[1..]
    }

    /// Length of the start code this unit was found behind, 3 or 4.
    pub fn start_code_len(&self) -> usize {
        self.start_code_len
    }
}

impl std::fmt::Debug for NalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NalUnit")
            .field("type", &self.raw_type())
            .field("ref_idc", &self.ref_idc())
            .field("len", &self.data.len())
            .finish()
    }
}

/// Producer of NAL units fed to the pipeline.
pub trait NalSource: Send {
    /// Returns the next NAL unit of the stream, or `None` at its end.
    fn next_nal(&mut self) -> Option<NalUnit>;
}

impl<I: Iterator<Item = NalUnit> + Send> NalSource for I {
    fn next_nal(&mut self) -> Option<NalUnit> {
        self.next()
    }
}

/// Returns the position and length of the first start code found in `data` at or after `from`.
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let pos = data
        .get(from..)?
        .windows(3)
        .position(|w| w == [0, 0, 1])?
        + from;

    if pos > from && data[pos - 1] == 0 {
        Some((pos - 1, 4))
    } else {
        Some((pos, 3))
    }
}

/// Builds a unit, skipping it with a warning if it is corrupted.
fn checked_unit(data: &[u8], start_code_len: usize) -> Option<NalUnit> {
    match NalUnit::new(data.to_vec(), start_code_len) {
        Ok(nal) => Some(nal),
        Err(e) => {
            log::warn!("skipping NAL unit: {}", e);
            None
        }
    }
}

/// Iterator over the NAL units of an in-memory Annex-B stream.
pub struct AnnexBScanner<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AnnexBScanner<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for AnnexBScanner<'a> {
    type Item = NalUnit;

    fn next(&mut self) -> Option<NalUnit> {
        loop {
            let (start, len) = find_start_code(self.data, self.pos)?;
            let payload_start = start + len;
            let end = find_start_code(self.data, payload_start)
                .map_or(self.data.len(), |(next, _)| next);
            self.pos = end;

            if let Some(nal) = checked_unit(&self.data[payload_start..end], len) {
                return Some(nal);
            }
        }
    }
}

/// Streaming source of NAL units over any reader producing an Annex-B stream.
///
/// Data is read in chunks, and units spanning several chunks are carried over until their end is
/// found. The last unit is flushed when the reader reaches its end.
pub struct AnnexBReader<R: Read> {
    reader: R,
    buf: Vec<u8>,
    /// Offset from which to resume looking for the end of the current unit.
    scan_from: usize,
    chunk_size: usize,
    eof: bool,
}

impl<R: Read> AnnexBReader<R> {
    pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, Self::DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            scan_from: 0,
            chunk_size: chunk_size.max(1),
            eof: false,
        }
    }

    fn fill(&mut self) {
        let old_len = self.buf.len();
        self.buf.resize(old_len + self.chunk_size, 0);
        match self.reader.read(&mut self.buf[old_len..]) {
            Ok(0) => {
                self.buf.truncate(old_len);
                self.eof = true;
            }
            Ok(n) => self.buf.truncate(old_len + n),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => self.buf.truncate(old_len),
            Err(e) => {
                log::error!("error while reading bitstream: {}", e);
                self.buf.truncate(old_len);
                self.eof = true;
            }
        }
    }
}

impl<R: Read> Iterator for AnnexBReader<R> {
    type Item = NalUnit;

    fn next(&mut self) -> Option<NalUnit> {
        loop {
            match find_start_code(&self.buf, 0) {
                Some((start, len)) => {
                    let payload_start = start + len;
                    let scan_from = self.scan_from.max(payload_start);
                    if let Some((end, _)) = find_start_code(&self.buf, scan_from) {
                        let nal = checked_unit(&self.buf[payload_start..end], len);
                        self.buf.drain(..end);
                        self.scan_from = 0;
                        match nal {
                            Some(nal) => return Some(nal),
                            None => continue,
                        }
                    }

                    if self.eof {
                        let nal = checked_unit(&self.buf[payload_start..], len);
                        self.buf.clear();
                        self.scan_from = 0;
                        match nal {
                            Some(nal) => return Some(nal),
                            None => return None,
                        }
                    }

                    // A start code may straddle the chunk boundary.
                    self.scan_from = self.buf.len().saturating_sub(3).max(payload_start);
                }
                None if self.eof => {
                    self.buf.clear();
                    return None;
                }
                None => {
                    // Garbage before the first start code, only keep what could be a partial one.
                    let keep_from = self.buf.len().saturating_sub(3);
                    self.buf.drain(..keep_from);
                }
            }

            self.fill();
        }
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use super::ParseError;

/// Bit-level reader over the content of a NAL unit.
///
/// Emulation prevention bytes (the `03` of `00 00 03`) are removed on the fly, so the reader
/// yields the RBSP and [`position`](BitReader::position) counts RBSP bits.
pub struct BitReader<'a> {
    data: &'a [u8],
    /// Index of the next byte of `data` to load.
    next: usize,
    current: u8,
    bits_left: u8,
    zeros: u32,
    epb: usize,
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            next: 0,
            current: 0,
            bits_left: 0,
            zeros: 0,
            epb: 0,
            position: 0,
        }
    }

    fn load_byte(&mut self) -> Result<(), ParseError> {
        loop {
            let byte = *self.data.get(self.next).ok_or(ParseError::EndOfStream)?;
            self.next += 1;

            if self.zeros >= 2 && byte == 0x03 {
                self.zeros = 0;
                self.epb += 1;
                continue;
            }

            self.zeros = if byte == 0 { self.zeros + 1 } else { 0 };
            self.current = byte;
            self.bits_left = 8;
            return Ok(());
        }
    }

    pub fn read_bit(&mut self) -> Result<bool, ParseError> {
        if self.bits_left == 0 {
            self.load_byte()?;
        }
        self.bits_left -= 1;
        self.position += 1;
        Ok((self.current >> self.bits_left) & 1 == 1)
    }

    pub fn read_flag(&mut self) -> Result<bool, ParseError> {
        self.read_bit()
    }

    /// Read `n` bits, most significant first. `n` must not exceed 32.
    pub fn read_bits(&mut self, n: u32) -> Result<u32, ParseError> {
        debug_assert!(n <= 32);
        let mut value = 0u32;
        for _ in 0..n {
            value = (value << 1) | self.read_bit()? as u32;
        }
        Ok(value)
    }

    pub fn skip_bits(&mut self, n: usize) -> Result<(), ParseError> {
        for _ in 0..n {
            self.read_bit()?;
        }
        Ok(())
    }

    /// Read an unsigned Exp-Golomb code.
    pub fn read_ue(&mut self) -> Result<u32, ParseError> {
        let mut leading_zeros = 0;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(ParseError::InvalidExpGolomb);
            }
        }

        let suffix = self.read_bits(leading_zeros)?;
        ((1u64 << leading_zeros) - 1 + suffix as u64)
            .try_into()
            .map_err(|_| ParseError::InvalidExpGolomb)
    }

    /// Read an unsigned Exp-Golomb code that must not exceed `max`.
    pub fn read_ue_max(&mut self, field: &'static str, max: u32) -> Result<u32, ParseError> {
        let value = self.read_ue()?;
        if value > max {
            return Err(ParseError::InvalidValue {
                field,
                value: value as i64,
            });
        }
        Ok(value)
    }

    /// Read a signed Exp-Golomb code.
    pub fn read_se(&mut self) -> Result<i32, ParseError> {
        let code = self.read_ue()? as i64;
        let value = if code & 1 == 1 {
            (code + 1) / 2
        } else {
            -(code / 2)
        };
        Ok(value as i32)
    }

    /// Read a signed Exp-Golomb code that must lie within `min..=max`.
    pub fn read_se_bounded(
        &mut self,
        field: &'static str,
        min: i32,
        max: i32,
    ) -> Result<i32, ParseError> {
        let value = self.read_se()?;
        if !(min..=max).contains(&value) {
            return Err(ParseError::InvalidValue {
                field,
                value: value as i64,
            });
        }
        Ok(value)
    }

    /// Number of RBSP bits read so far.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of emulation prevention bytes skipped so far.
    pub fn num_epb(&self) -> usize {
        self.epb
    }

    /// Returns whether there is more data before the RBSP trailing bits.
    pub fn more_rbsp_data(&self) -> bool {
        let Some(last) = self.data.iter().rposition(|&b| b != 0) else {
            return false;
        };
        // Raw index of the rbsp_stop_one_bit.
        let stop_bit = last * 8 + 7 - self.data[last].trailing_zeros() as usize;
        let next_bit = if self.bits_left > 0 {
            (self.next - 1) * 8 + (8 - self.bits_left as usize)
        } else {
            self.next * 8
        };

        next_bit < stop_bit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exp_golomb() {
        // 1 | 010 | 011 | 00100 | 00101 -> ue 0, 1, 2, 3, se(4) = -2
        let data = [0b1010_0110, 0b0100_0010, 0b1000_0000];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_ue().unwrap(), 0);
        assert_eq!(reader.read_ue().unwrap(), 1);
        assert_eq!(reader.read_ue().unwrap(), 2);
        assert_eq!(reader.read_ue().unwrap(), 3);
        assert_eq!(reader.read_se().unwrap(), -2);
        assert_eq!(reader.position(), 17);
        assert!(!reader.more_rbsp_data());
    }

    #[test]
    fn emulation_prevention_is_removed() {
        let data = [0x00, 0x00, 0x03, 0x01, 0xff];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bits(16).unwrap(), 0);
        assert_eq!(reader.read_bits(8).unwrap(), 0x01);
        assert_eq!(reader.num_epb(), 1);
        assert_eq!(reader.position(), 24);
        assert_eq!(reader.read_bits(8).unwrap(), 0xff);
        assert_eq!(reader.read_bit(), Err(ParseError::EndOfStream));
    }

    #[test]
    fn more_rbsp_data() {
        // One data bit, then the stop bit.
        let data = [0b1100_0000];
        let mut reader = BitReader::new(&data);
        assert!(reader.more_rbsp_data());
        reader.read_bit().unwrap();
        assert!(!reader.more_rbsp_data());
    }

    #[test]
    fn overlong_exp_golomb() {
        let data = [0u8, 0, 0, 0, 0, 1];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_ue(), Err(ParseError::InvalidExpGolomb));
    }
}

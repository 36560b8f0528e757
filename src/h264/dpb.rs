// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoded picture buffer management.
//!
//! A stateless decoder does not track reference pictures itself: the host computes picture
//! order counts, marks pictures as short or long term references and passes the resulting set
//! of references along with every frame. Only frame (progressive) decoding is supported.

use std::cmp::Reverse;

use super::ParseError;
use super::RefPicListModification;
use super::SliceHeader;
use super::Sps;

/// A reference picture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpbEntry {
    /// Timestamp identifying the picture to the decoder.
    pub timestamp: u64,
    /// CAPTURE buffer holding the decoded picture, once decoding has completed.
    pub capture_index: Option<u32>,
    pub frame_num: u16,
    pub frame_num_wrap: i32,
    pub long_term: bool,
    pub long_term_frame_idx: u32,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
}

impl DpbEntry {
    pub fn pic_num(&self) -> i32 {
        self.frame_num_wrap
    }

    pub fn long_term_pic_num(&self) -> i32 {
        self.long_term_frame_idx as i32
    }

    pub fn pic_order_cnt(&self) -> i32 {
        self.top_field_order_cnt.min(self.bottom_field_order_cnt)
    }
}

/// The picture currently being decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture {
    pub timestamp: u64,
    pub frame_num: u16,
    pub nal_ref_idc: u8,
    pub idr: bool,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    frame_num_offset: i32,
    pic_order_cnt_msb: i32,
    pic_order_cnt_lsb: i32,
}

impl Picture {
    pub fn pic_order_cnt(&self) -> i32 {
        self.top_field_order_cnt.min(self.bottom_field_order_cnt)
    }
}

/// State carried from one picture to the next for picture order count computation.
#[derive(Debug, Default, Clone)]
struct PocState {
    prev_pic_order_cnt_msb: i32,
    prev_pic_order_cnt_lsb: i32,
    prev_frame_num_offset: i32,
    prev_frame_num: u16,
    prev_has_mmco5: bool,
}

#[derive(Debug, Default, Clone)]
pub struct Dpb {
    entries: Vec<DpbEntry>,
    max_num_ref_frames: usize,
    max_frame_num: i32,
    max_long_term_frame_idx: Option<u32>,
    poc: PocState,
    prev_ref_frame_num: u16,
}

impl Dpb {
    pub fn new() -> Self {
        Self {
            max_num_ref_frames: 1,
            max_frame_num: 16,
            ..Default::default()
        }
    }

    /// Adopt the reference parameters of `sps`.
    pub fn configure(&mut self, sps: &Sps) {
        self.max_num_ref_frames = (sps.max_num_ref_frames as usize).max(1);
        self.max_frame_num = sps.max_frame_num() as i32;
    }

    pub fn entries(&self) -> &[DpbEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every reference picture.
    pub fn flush(&mut self) {
        self.entries.clear();
        self.max_long_term_frame_idx = None;
    }

    /// Record that the picture identified by `timestamp` has been decoded into CAPTURE buffer
    /// `capture_index`.
    pub fn bind_capture(&mut self, timestamp: u64, capture_index: u32) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.timestamp == timestamp) {
            entry.capture_index = Some(capture_index);
        }
    }

    /// Whether CAPTURE buffer `capture_index` holds a reference picture.
    pub fn is_referenced(&self, capture_index: u32) -> bool {
        self.entries
            .iter()
            .any(|e| e.capture_index == Some(capture_index))
    }

    /// Prepare the decoding of the picture whose first slice header is `hdr`: compute its
    /// picture order count and update the picture numbers of the references.
    pub fn start_picture(
        &mut self,
        sps: &Sps,
        hdr: &SliceHeader,
        timestamp: u64,
    ) -> Result<Picture, ParseError> {
        if hdr.field_pic_flag {
            return Err(ParseError::Unsupported("field pictures"));
        }

        if hdr.idr_pic_flag {
            self.flush();
        } else if hdr.nal_ref_idc != 0 || sps.gaps_in_frame_num_value_allowed_flag {
            let expected = (self.prev_ref_frame_num as i32 + 1) % self.max_frame_num;
            if hdr.frame_num as i32 != expected && hdr.frame_num != self.prev_ref_frame_num {
                // Missing frames are not synthesized, their references are simply absent.
                log::warn!(
                    "gap in frame_num: expected {}, got {}",
                    expected,
                    hdr.frame_num
                );
            }
        }

        let mut pic = Picture {
            timestamp,
            frame_num: hdr.frame_num,
            nal_ref_idc: hdr.nal_ref_idc,
            idr: hdr.idr_pic_flag,
            top_field_order_cnt: 0,
            bottom_field_order_cnt: 0,
            frame_num_offset: 0,
            pic_order_cnt_msb: 0,
            pic_order_cnt_lsb: 0,
        };
        self.compute_pic_order_cnt(sps, hdr, &mut pic);

        for entry in self.entries.iter_mut().filter(|e| !e.long_term) {
            entry.frame_num_wrap = if entry.frame_num > hdr.frame_num {
                entry.frame_num as i32 - self.max_frame_num
            } else {
                entry.frame_num as i32
            };
        }

        Ok(pic)
    }

    fn compute_pic_order_cnt(&self, sps: &Sps, hdr: &SliceHeader, pic: &mut Picture) {
        let prev = &self.poc;

        match sps.pic_order_cnt_type {
            0 => {
                let (prev_msb, prev_lsb) = if hdr.idr_pic_flag {
                    (0, 0)
                } else if prev.prev_has_mmco5 {
                    (0, prev.prev_pic_order_cnt_lsb)
                } else {
                    (prev.prev_pic_order_cnt_msb, prev.prev_pic_order_cnt_lsb)
                };
                let max_lsb = sps.max_pic_order_cnt_lsb() as i32;
                let lsb = hdr.pic_order_cnt_lsb as i32;

                let msb = if lsb < prev_lsb && prev_lsb - lsb >= max_lsb / 2 {
                    prev_msb.wrapping_add(max_lsb)
                } else if lsb > prev_lsb && lsb - prev_lsb > max_lsb / 2 {
                    prev_msb.wrapping_sub(max_lsb)
                } else {
                    prev_msb
                };

                pic.pic_order_cnt_msb = msb;
                pic.pic_order_cnt_lsb = lsb;
                pic.top_field_order_cnt = msb.wrapping_add(lsb);
                pic.bottom_field_order_cnt = pic
                    .top_field_order_cnt
                    .wrapping_add(hdr.delta_pic_order_cnt_bottom);
            }
            1 => {
                // Offsets come straight from the SPS, sums wrap instead of overflowing.
                pic.frame_num_offset = self.frame_num_offset(hdr);
                let cycle = &sps.offset_for_ref_frame;

                let mut abs_frame_num = if cycle.is_empty() {
                    0
                } else {
                    pic.frame_num_offset.wrapping_add(hdr.frame_num as i32)
                };
                if hdr.nal_ref_idc == 0 && abs_frame_num > 0 {
                    abs_frame_num -= 1;
                }

                let mut expected = 0i32;
                if abs_frame_num > 0 {
                    let n = cycle.len() as i32;
                    let cycle_cnt = (abs_frame_num - 1) / n;
                    let frame_num_in_cycle = ((abs_frame_num - 1) % n) as usize;
                    let expected_delta_per_cycle =
                        cycle.iter().fold(0i32, |sum, &o| sum.wrapping_add(o));
                    expected = cycle_cnt.wrapping_mul(expected_delta_per_cycle).wrapping_add(
                        cycle[..=frame_num_in_cycle]
                            .iter()
                            .fold(0i32, |sum, &o| sum.wrapping_add(o)),
                    );
                }
                if hdr.nal_ref_idc == 0 {
                    expected = expected.wrapping_add(sps.offset_for_non_ref_pic);
                }

                pic.top_field_order_cnt = expected.wrapping_add(hdr.delta_pic_order_cnt[0]);
                pic.bottom_field_order_cnt = pic
                    .top_field_order_cnt
                    .wrapping_add(sps.offset_for_top_to_bottom_field)
                    .wrapping_add(hdr.delta_pic_order_cnt[1]);
            }
            _ => {
                pic.frame_num_offset = self.frame_num_offset(hdr);
                let frame = pic.frame_num_offset.wrapping_add(hdr.frame_num as i32);
                let temp = if hdr.idr_pic_flag {
                    0
                } else if hdr.nal_ref_idc == 0 {
                    frame.wrapping_mul(2).wrapping_sub(1)
                } else {
                    frame.wrapping_mul(2)
                };
                pic.top_field_order_cnt = temp;
                pic.bottom_field_order_cnt = temp;
            }
        }
    }

    fn frame_num_offset(&self, hdr: &SliceHeader) -> i32 {
        let prev_offset = if self.poc.prev_has_mmco5 {
            0
        } else {
            self.poc.prev_frame_num_offset
        };

        if hdr.idr_pic_flag {
            0
        } else if self.poc.prev_frame_num > hdr.frame_num {
            prev_offset.wrapping_add(self.max_frame_num)
        } else {
            prev_offset
        }
    }

    fn short_term(&self) -> impl Iterator<Item = (usize, &DpbEntry)> {
        self.entries.iter().enumerate().filter(|(_, e)| !e.long_term)
    }

    fn long_term_sorted(&self) -> Vec<usize> {
        let mut long_term = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.long_term)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        long_term.sort_by_key(|&i| self.entries[i].long_term_pic_num());
        long_term
    }

    /// Initial reference list for P slices, as indices into [`entries`](Dpb::entries): short
    /// term references by descending picture number, then long term ones by ascending long term
    /// picture number.
    pub fn ref_pic_list_p(&self) -> Vec<usize> {
        let mut list = self.short_term().map(|(i, _)| i).collect::<Vec<_>>();
        list.sort_by_key(|&i| Reverse(self.entries[i].pic_num()));
        list.extend(self.long_term_sorted());
        list
    }

    /// Initial reference lists for B slices, as indices into [`entries`](Dpb::entries).
    pub fn ref_pic_list_b(&self, cur_pic_order_cnt: i32) -> (Vec<usize>, Vec<usize>) {
        let mut before = self
            .short_term()
            .filter(|(_, e)| e.pic_order_cnt() < cur_pic_order_cnt)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        before.sort_by_key(|&i| Reverse(self.entries[i].pic_order_cnt()));

        let mut after = self
            .short_term()
            .filter(|(_, e)| e.pic_order_cnt() > cur_pic_order_cnt)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        after.sort_by_key(|&i| self.entries[i].pic_order_cnt());

        let long_term = self.long_term_sorted();

        let mut list0 = before.clone();
        list0.extend(&after);
        list0.extend(&long_term);

        let mut list1 = after;
        list1.extend(&before);
        list1.extend(&long_term);

        if list1.len() > 1 && list0 == list1 {
            list1.swap(0, 1);
        }

        (list0, list1)
    }

    /// Apply the reference list modifications of a slice to `list`, then truncate it to
    /// `num_ref_idx_active` entries.
    pub fn modify_ref_pic_list(
        &self,
        list: &mut Vec<usize>,
        modifications: &[RefPicListModification],
        cur_frame_num: u16,
        num_ref_idx_active: usize,
    ) {
        let max_pic_num = self.max_frame_num;
        let curr_pic_num = cur_frame_num as i32;
        let mut pic_num_pred = curr_pic_num;
        let mut ref_idx = 0;

        for modification in modifications {
            let found = match modification.modification_of_pic_nums_idc {
                0 | 1 => {
                    let abs_diff = modification.abs_diff_pic_num_minus1 as i32 + 1;
                    let mut no_wrap = if modification.modification_of_pic_nums_idc == 0 {
                        pic_num_pred - abs_diff
                    } else {
                        pic_num_pred + abs_diff
                    };
                    if no_wrap < 0 {
                        no_wrap += max_pic_num;
                    } else if no_wrap >= max_pic_num {
                        no_wrap -= max_pic_num;
                    }
                    pic_num_pred = no_wrap;
                    let pic_num = if no_wrap > curr_pic_num {
                        no_wrap - max_pic_num
                    } else {
                        no_wrap
                    };
                    self.short_term()
                        .find(|(_, e)| e.pic_num() == pic_num)
                        .map(|(i, _)| i)
                }
                2 => self
                    .entries
                    .iter()
                    .position(|e| {
                        e.long_term && e.long_term_pic_num() == modification.long_term_pic_num as i32
                    }),
                _ => None,
            };

            let Some(pic) = found else {
                log::warn!("reference list modification refers to a missing picture");
                continue;
            };

            list.insert(ref_idx.min(list.len()), pic);
            ref_idx += 1;
            if let Some(dup) = list.iter().skip(ref_idx).position(|&i| i == pic) {
                list.remove(ref_idx + dup);
            }
        }

        list.truncate(num_ref_idx_active);
    }

    /// Mark `pic` as a reference picture if it is one, using the marking process signaled in
    /// `hdr`.
    pub fn finish_picture(&mut self, pic: &Picture, hdr: &SliceHeader) {
        let has_mmco5 = hdr.has_mmco5();
        let mut top = pic.top_field_order_cnt;
        let mut bottom = pic.bottom_field_order_cnt;

        if pic.nal_ref_idc != 0 {
            let mut current_long_term = None;

            if pic.idr {
                self.flush();
                if hdr.dec_ref_pic_marking.long_term_reference_flag {
                    current_long_term = Some(0);
                    self.max_long_term_frame_idx = Some(0);
                }
            } else if hdr.dec_ref_pic_marking.adaptive_ref_pic_marking_mode_flag {
                current_long_term = self.apply_mmcos(pic, hdr);
            } else {
                self.sliding_window();
            }

            if has_mmco5 {
                let temp = top.min(bottom);
                top = top.wrapping_sub(temp);
                bottom = bottom.wrapping_sub(temp);
            }

            if let Some(idx) = current_long_term {
                self.entries
                    .retain(|e| !(e.long_term && e.long_term_frame_idx == idx));
            }

            if self.entries.len() >= self.max_num_ref_frames {
                log::warn!("DPB overflow, dropping the oldest short term reference");
                self.sliding_window();
            }

            self.entries.push(DpbEntry {
                timestamp: pic.timestamp,
                capture_index: None,
                frame_num: if has_mmco5 { 0 } else { pic.frame_num },
                frame_num_wrap: if has_mmco5 { 0 } else { pic.frame_num as i32 },
                long_term: current_long_term.is_some(),
                long_term_frame_idx: current_long_term.unwrap_or(0),
                top_field_order_cnt: top,
                bottom_field_order_cnt: bottom,
            });

            self.prev_ref_frame_num = if has_mmco5 { 0 } else { pic.frame_num };
            self.poc.prev_pic_order_cnt_msb = pic.pic_order_cnt_msb;
            self.poc.prev_pic_order_cnt_lsb = if has_mmco5 { top } else { pic.pic_order_cnt_lsb };
        }

        self.poc.prev_has_mmco5 = has_mmco5;
        self.poc.prev_frame_num = if has_mmco5 { 0 } else { pic.frame_num };
        self.poc.prev_frame_num_offset = pic.frame_num_offset;
    }

    /// Remove the short term reference with the smallest `FrameNumWrap` if the buffer is full.
    fn sliding_window(&mut self) {
        if self.entries.len() < self.max_num_ref_frames {
            return;
        }

        if let Some((oldest, _)) = self
            .short_term()
            .min_by_key(|(_, e)| e.frame_num_wrap)
        {
            self.entries.remove(oldest);
        }
    }

    /// Apply the memory management control operations of `hdr`. Returns the long term frame
    /// index assigned to the current picture, if any.
    fn apply_mmcos(&mut self, pic: &Picture, hdr: &SliceHeader) -> Option<u32> {
        let curr_pic_num = pic.frame_num as i32;
        let mut current_long_term = None;

        for op in &hdr.dec_ref_pic_marking.operations {
            let pic_num_x = curr_pic_num - (op.difference_of_pic_nums_minus1 as i32 + 1);

            match op.memory_management_control_operation {
                1 => self
                    .entries
                    .retain(|e| e.long_term || e.pic_num() != pic_num_x),
                2 => self.entries.retain(|e| {
                    !e.long_term || e.long_term_pic_num() != op.long_term_pic_num as i32
                }),
                3 => {
                    let idx = op.long_term_frame_idx;
                    self.entries
                        .retain(|e| !(e.long_term && e.long_term_frame_idx == idx && e.pic_num() != pic_num_x));
                    if let Some(entry) = self
                        .entries
                        .iter_mut()
                        .find(|e| !e.long_term && e.pic_num() == pic_num_x)
                    {
                        entry.long_term = true;
                        entry.long_term_frame_idx = idx;
                    }
                }
                4 => {
                    self.max_long_term_frame_idx = op.max_long_term_frame_idx_plus1.checked_sub(1);
                    let max = self.max_long_term_frame_idx;
                    self.entries.retain(|e| {
                        !e.long_term || max.is_some_and(|max| e.long_term_frame_idx <= max)
                    });
                }
                5 => {
                    self.flush();
                }
                6 => current_long_term = Some(op.long_term_frame_idx),
                _ => (),
            }
        }

        current_long_term
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software decoder backend for tests.
//!
//! Jobs "decode" instantly (or when told to) into the oldest queued CAPTURE buffer, in
//! submission order.

use std::collections::VecDeque;
use std::fs::File;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::sync::Arc;

use nix::errno::Errno;
use parking_lot::Mutex;

use super::controls::V4L2_H264_DPB_ENTRY_FLAG_VALID;
use super::BackendError;
use super::BackendEvent;
use super::DecodeJob;
use super::StatelessDecoderBackend;
use crate::config::DecoderConfig;
use crate::pool::MemoryRegion;
use crate::FrameLayout;

/// What the backend saw of a submitted job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub request: usize,
    pub output_index: u32,
    pub timestamp: u64,
    pub bytes_used: usize,
    pub hold_capture: bool,
    pub has_slice_controls: bool,
    /// Number of valid entries in the DPB of the decode parameters.
    pub num_references: usize,
}

struct PendingJob {
    request: usize,
    output_index: u32,
    timestamp: u64,
    hold_capture: bool,
}

struct DummyState {
    auto_complete: bool,
    queued_captures: VecDeque<u32>,
    /// CAPTURE buffer kept between the slices of a frame.
    held_capture: Option<u32>,
    held_timestamp: u64,
    pending: VecDeque<PendingJob>,
    events: VecDeque<BackendEvent>,
    jobs: Vec<JobRecord>,
    payloads: Vec<Vec<u8>>,
    /// Number of successful submissions before the next rejected one.
    reject_after: Option<usize>,
    failing: Vec<u64>,
    stop_count: usize,
}

impl DummyState {
    fn complete(&mut self, job: PendingJob) {
        self.events.push_back(BackendEvent::InputBufferDone {
            output_index: job.output_index,
            request: job.request,
        });

        let capture_index = match self.held_capture.take() {
            Some(index) => index,
            None => self
                .queued_captures
                .pop_front()
                .expect("job completed without a queued CAPTURE buffer"),
        };

        if job.hold_capture {
            self.held_capture = Some(capture_index);
            self.held_timestamp = job.timestamp;
        } else {
            self.events.push_back(BackendEvent::FrameCompleted {
                capture_index,
                timestamp: job.timestamp,
                error: self.failing.contains(&job.timestamp),
            });
        }
    }
}

pub struct DummyBackend {
    state: Arc<Mutex<DummyState>>,
    /// Always readable, like a V4L2 device polled with no CAPTURE buffer queued.
    ready_fd: Option<File>,
}

/// Handle to inspect and drive a [`DummyBackend`] after it has been moved into a session.
#[derive(Clone)]
pub struct DummyControl {
    state: Arc<Mutex<DummyState>>,
}

impl DummyBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DummyState {
                auto_complete: true,
                queued_captures: VecDeque::new(),
                held_capture: None,
                held_timestamp: 0,
                pending: VecDeque::new(),
                events: VecDeque::new(),
                jobs: Vec::new(),
                payloads: Vec::new(),
                reject_after: None,
                failing: Vec::new(),
                stop_count: 0,
            })),
            ready_fd: None,
        }
    }

    /// A backend whose poll descriptor never blocks.
    pub fn with_ready_poll_fd() -> Self {
        Self {
            ready_fd: Some(tempfile::tempfile().unwrap()),
            ..Self::new()
        }
    }

    pub fn control(&self) -> DummyControl {
        DummyControl {
            state: Arc::clone(&self.state),
        }
    }
}

impl DummyControl {
    /// Whether jobs complete as soon as they are submitted.
    pub fn set_auto_complete(&self, auto_complete: bool) {
        self.state.lock().auto_complete = auto_complete;
    }

    /// Complete all the jobs submitted so far.
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        while let Some(job) = state.pending.pop_front() {
            state.complete(job);
        }
    }

    pub fn reject_next_submit(&self) {
        self.reject_submit_after(0);
    }

    /// Accept `count` more jobs, then reject one.
    pub fn reject_submit_after(&self, count: usize) {
        self.state.lock().reject_after = Some(count);
    }

    /// CAPTURE buffer held between the slices of a frame.
    pub fn held_capture(&self) -> Option<u32> {
        self.state.lock().held_capture
    }

    /// Report a decoding error for the frame with `timestamp`.
    pub fn fail_timestamp(&self, timestamp: u64) {
        self.state.lock().failing.push(timestamp);
    }

    pub fn queued_captures(&self) -> Vec<u32> {
        self.state.lock().queued_captures.iter().copied().collect()
    }

    pub fn jobs(&self) -> Vec<JobRecord> {
        self.state.lock().jobs.clone()
    }

    /// Content of the OUTPUT buffer of each job.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.state.lock().payloads.clone()
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().stop_count
    }
}

impl StatelessDecoderBackend for DummyBackend {
    fn configure(
        &mut self,
        coded_size: (u32, u32),
        _config: &DecoderConfig,
    ) -> Result<FrameLayout, BackendError> {
        Ok(FrameLayout::nv12(
            coded_size.0,
            coded_size.1,
            coded_size.0 as usize,
        ))
    }

    fn start(
        &mut self,
        _output: &[MemoryRegion],
        _capture: &[MemoryRegion],
        _requests: usize,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    fn queue_capture(&mut self, index: u32, _region: &MemoryRegion) -> Result<(), BackendError> {
        self.state.lock().queued_captures.push_back(index);
        Ok(())
    }

    fn submit(&mut self, job: &DecodeJob) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        match state.reject_after {
            Some(0) => {
                state.reject_after = None;
                return Err(BackendError::Rejected(Errno::EINVAL));
            }
            Some(count) => state.reject_after = Some(count - 1),
            None => (),
        }

        let mapping = job
            .output
            .map()
            .map_err(|_| BackendError::Ioctl("mmap", Errno::EIO))?;
        state
            .payloads
            .push(mapping.as_ref()[..job.bytes_used].to_vec());
        state.jobs.push(JobRecord {
            request: job.request,
            output_index: job.output_index,
            timestamp: job.timestamp,
            bytes_used: job.bytes_used,
            hold_capture: job.hold_capture,
            has_slice_controls: job.controls.slice.is_some(),
            num_references: job
                .controls
                .decode_params
                .dpb
                .iter()
                .filter(|e| e.flags & V4L2_H264_DPB_ENTRY_FLAG_VALID != 0)
                .count(),
        });

        let pending = PendingJob {
            request: job.request,
            output_index: job.output_index,
            timestamp: job.timestamp,
            hold_capture: job.hold_capture,
        };
        if state.auto_complete {
            state.complete(pending);
        } else {
            state.pending.push_back(pending);
        }

        Ok(())
    }

    fn release_held_capture(&mut self) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if let Some(job) = state.pending.iter_mut().rev().find(|job| job.hold_capture) {
            job.hold_capture = false;
        } else if let Some(capture_index) = state.held_capture.take() {
            let timestamp = state.held_timestamp;
            state.events.push_back(BackendEvent::FrameCompleted {
                capture_index,
                timestamp,
                error: false,
            });
        }
        Ok(())
    }

    fn next_event(&mut self) -> Result<Option<BackendEvent>, BackendError> {
        Ok(self.state.lock().events.pop_front())
    }

    fn poll_fd(&self) -> Option<BorrowedFd> {
        self.ready_fd.as_ref().map(File::as_fd)
    }

    fn stop(&mut self) {
        let mut state = self.state.lock();
        state.stop_count += 1;
        state.queued_captures.clear();
        state.held_capture = None;
        state.pending.clear();
        state.events.clear();
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Driving of a stateless H.264 decoder.
//!
//! A [`DecodeSession`] takes access units, computes everything a stateless decoder needs to
//! decode them (parameter sets, decoded picture buffer, reference lists), and hands the result
//! to a [`StatelessDecoderBackend`] along with the slice data. Decoded frames are returned as
//! [`DecodeBuffer`]s, which the caller owns until it gives them back with
//! [`DecodeSession::requeue_capture_buffer`].

pub mod controls;
#[cfg(test)]
pub(crate) mod dummy;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::os::fd::BorrowedFd;
use std::path::PathBuf;
use std::sync::Arc;

use nix::errno::Errno;
use thiserror::Error;

use crate::config::DecodeMode;
use crate::config::DecoderConfig;
use crate::config::StartCode;
use crate::dma_heap::AllocError;
use crate::dma_heap::SyncAccess;
use crate::h264::dpb::Dpb;
use crate::h264::dpb::Picture;
use crate::h264::parse_slice_header;
use crate::h264::NalUnit;
use crate::h264::ParameterSetState;
use crate::h264::ParseError;
use crate::h264::SliceHeader;
use crate::h264::Sps;
use crate::pool::BufferPool;
use crate::pool::MapError;
use crate::pool::MemoryRegion;
use crate::pool::RegionMapping;
use crate::pool::RegionState;
use crate::pool::TransitionError;
use crate::stats::PipelineStatistics;
use crate::FrameLayout;

use controls::FrameControls;

const ANNEX_B_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to open {0}: {1}")]
    Open(PathBuf, Errno),
    #[error("{0} failed: {1}")]
    Ioctl(&'static str, Errno),
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
    /// The decoder refused the parameters or data of a single frame.
    #[error("frame rejected by the decoder: {0}")]
    Rejected(Errno),
}

/// Errors that abort the decode session.
#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("decoder backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("failed to allocate decoder buffers: {0}")]
    Alloc(#[from] AllocError),
    #[error("failed to map OUTPUT buffer: {0}")]
    Map(#[from] MapError),
    #[error("{0}")]
    Transition(#[from] TransitionError),
    #[error("session has not been initialized")]
    NotInitialized,
    #[error("session is already initialized")]
    AlreadyInitialized,
    #[error("resolution changed from {from:?} to {to:?}")]
    ResolutionChange { from: (u32, u32), to: (u32, u32) },
    #[error("CAPTURE buffer {0} does not belong to this session or is already queued")]
    InvalidBuffer(u32),
    #[error("session stopped after a fatal error")]
    Stopped,
}

/// Errors that only affect a single frame. The frame is dropped and decoding goes on.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("access unit contains no slice")]
    NoSlices,
    #[error("invalid slice: {0}")]
    Parse(#[from] ParseError),
    #[error("frame data of {size} bytes exceeds the OUTPUT buffer size of {max} bytes")]
    TooLarge { size: usize, max: usize },
    #[error("frame has {0} slices, more than the decoder can take at once")]
    TooManySlices(usize),
    #[error("{0}")]
    Rejected(BackendError),
}

/// Result of [`DecodeSession::submit_frame`].
#[derive(Debug)]
pub enum SubmitResult {
    /// The frame has been queued. Its decoded picture will be returned by
    /// [`DecodeSession::reclaim`] with the same `timestamp`.
    Submitted { timestamp: u64 },
    /// No request, OUTPUT buffer or CAPTURE buffer is available. Retry after reclaiming.
    Busy,
    /// The frame could not be decoded and has been dropped.
    FrameError(FrameError),
}

/// Position of a CAPTURE buffer in the decode queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeQueueState {
    /// Owned by the session, not queued. Buffers still holding a reference picture stay here.
    Idle,
    QueuedToHardware,
    /// Contains a decoded frame and is owned by the caller.
    Ready,
}

/// A CAPTURE buffer and the frame it contains.
#[derive(Debug)]
pub struct DecodeBuffer {
    index: u32,
    region: MemoryRegion,
    layout: FrameLayout,
    state: DecodeQueueState,
    timestamp: u64,
}

impl DecodeBuffer {
    /// Index of the buffer in the CAPTURE queue.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn state(&self) -> DecodeQueueState {
        self.state
    }

    /// Timestamp of the frame, as returned by [`DecodeSession::submit_frame`].
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

/// A single decode request to be executed by the backend.
pub struct DecodeJob<'a> {
    /// Index of the request to use, in `0..requests` as passed to
    /// [`StatelessDecoderBackend::start`].
    pub request: usize,
    pub output_index: u32,
    /// OUTPUT buffer containing the compressed data.
    pub output: &'a MemoryRegion,
    pub bytes_used: usize,
    pub timestamp: u64,
    pub controls: &'a FrameControls,
    /// Keep the CAPTURE buffer for the next request, i.e. more slices of the same frame follow.
    pub hold_capture: bool,
}

/// Events reported by [`StatelessDecoderBackend::next_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// The OUTPUT buffer and request of a job can be reused.
    InputBufferDone { output_index: u32, request: usize },
    /// A frame has been written into a CAPTURE buffer.
    FrameCompleted {
        capture_index: u32,
        timestamp: u64,
        error: bool,
    },
}

/// Interface to the decoding hardware.
pub trait StatelessDecoderBackend: Send {
    /// Set up the decoder for a stream of `coded_size`, and return the layout of the decoded
    /// frames.
    fn configure(
        &mut self,
        coded_size: (u32, u32),
        config: &DecoderConfig,
    ) -> Result<FrameLayout, BackendError>;

    /// Import the `output` and `capture` regions as buffers of their respective queues, allocate
    /// `requests` requests and start streaming.
    fn start(
        &mut self,
        output: &[MemoryRegion],
        capture: &[MemoryRegion],
        requests: usize,
    ) -> Result<(), BackendError>;

    /// Make CAPTURE buffer `index` available for decoding.
    fn queue_capture(&mut self, index: u32, region: &MemoryRegion) -> Result<(), BackendError>;

    /// Queue a decode request. Errors other than [`BackendError::Rejected`] are fatal.
    fn submit(&mut self, job: &DecodeJob) -> Result<(), BackendError>;

    /// Complete the frame whose last job was queued with `hold_capture` once the jobs already
    /// queued are done, without waiting for more slices.
    fn release_held_capture(&mut self) -> Result<(), BackendError>;

    /// Returns the next pending event, or `None` if there is none at the moment.
    fn next_event(&mut self) -> Result<Option<BackendEvent>, BackendError>;

    /// Returns a descriptor that signals `POLLIN` when [`next_event`](Self::next_event) has
    /// something to return, if the backend supports it.
    fn poll_fd(&self) -> Option<BorrowedFd> {
        None
    }

    /// Stop streaming and release all buffers. Must be callable several times.
    fn stop(&mut self);
}

struct OutputBuffer {
    region: MemoryRegion,
    mapping: RegionMapping,
    queued: bool,
}

/// A decode session for one H.264 stream.
pub struct DecodeSession<B: StatelessDecoderBackend> {
    backend: B,
    pool: Arc<BufferPool>,
    config: DecoderConfig,
    stats: Arc<PipelineStatistics>,

    coded_size: Option<(u32, u32)>,
    output: Vec<OutputBuffer>,
    /// CAPTURE buffers, `None` while they are owned by the caller.
    capture: Vec<Option<DecodeBuffer>>,
    /// Idle CAPTURE buffers waiting for their picture to stop being used as reference.
    parked: Vec<u32>,
    requests_busy: Vec<bool>,
    /// Number of frames submitted but not completed yet.
    pending_frames: usize,
    /// Frames rejected after some of their slices had been queued. Their CAPTURE buffer is
    /// recycled as soon as it completes.
    discarded: Vec<u64>,

    dpb: Dpb,
    next_timestamp: u64,
    failed: bool,
}

impl<B: StatelessDecoderBackend> DecodeSession<B> {
    pub fn new(
        backend: B,
        pool: Arc<BufferPool>,
        config: DecoderConfig,
        stats: Arc<PipelineStatistics>,
    ) -> Self {
        Self {
            backend,
            pool,
            config,
            stats,
            coded_size: None,
            output: Vec::new(),
            capture: Vec::new(),
            parked: Vec::new(),
            requests_busy: Vec::new(),
            pending_frames: 0,
            discarded: Vec::new(),
            dpb: Dpb::new(),
            next_timestamp: 1,
            failed: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.coded_size.is_some()
    }

    pub fn poll_fd(&self) -> Option<BorrowedFd> {
        self.backend.poll_fd()
    }

    /// Coded size of the stream, once initialized.
    pub fn coded_size(&self) -> Option<(u32, u32)> {
        self.coded_size
    }

    /// Number of frames submitted and not completed yet.
    pub fn pending_frames(&self) -> usize {
        self.pending_frames
    }

    /// Number of CAPTURE buffers queued to the hardware or handed out to the caller.
    pub fn capture_in_flight(&self) -> usize {
        self.capture
            .iter()
            .filter(|b| {
                b.as_ref()
                    .map_or(true, |b| b.state == DecodeQueueState::QueuedToHardware)
            })
            .count()
    }

    fn fail<E: Into<DecoderError>>(&mut self, e: E) -> DecoderError {
        self.failed = true;
        e.into()
    }

    fn check_running(&self) -> Result<(), DecoderError> {
        if self.failed {
            Err(DecoderError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Allocate `output_count` OUTPUT and `capture_count` CAPTURE buffers for the stream
    /// described by `sps`, and start decoding.
    pub fn initialize(
        &mut self,
        output_count: usize,
        capture_count: usize,
        sps: &Sps,
    ) -> Result<(), DecoderError> {
        self.check_running()?;
        if self.coded_size.is_some() {
            return Err(DecoderError::AlreadyInitialized);
        }

        let res = self.do_initialize(output_count, capture_count, sps);
        if let Err(e) = res {
            self.backend.stop();
            self.output.clear();
            self.capture.clear();
            return Err(self.fail(e));
        }

        Ok(())
    }

    fn do_initialize(
        &mut self,
        output_count: usize,
        capture_count: usize,
        sps: &Sps,
    ) -> Result<(), DecoderError> {
        let coded_size = (sps.width(), sps.height());
        let layout = self.backend.configure(coded_size, &self.config)?;

        // Reference pictures are kept out of the CAPTURE queue, make sure some buffers are left
        // to decode into.
        let min_capture = sps.max_num_ref_frames as usize + 2;
        let capture_count = if capture_count < min_capture {
            log::warn!(
                "stream needs {} reference frames, using {} CAPTURE buffers instead of {}",
                sps.max_num_ref_frames,
                min_capture,
                capture_count
            );
            min_capture
        } else {
            capture_count
        };
        let output_count = output_count.max(1);

        let mut output = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let region = self.pool.allocate(self.config.max_slice_size)?;
            let mapping = self.pool.map(&region)?;
            output.push(OutputBuffer {
                region,
                mapping,
                queued: false,
            });
        }

        let mut capture = Vec::with_capacity(capture_count);
        for index in 0..capture_count {
            capture.push(DecodeBuffer {
                index: index as u32,
                region: self.pool.allocate(layout.size)?,
                layout: layout.clone(),
                state: DecodeQueueState::Idle,
                timestamp: 0,
            });
        }

        let requests = self.config.requests.max(1);
        self.backend.start(
            &output.iter().map(|b| b.region.clone()).collect::<Vec<_>>(),
            &capture.iter().map(|b| b.region.clone()).collect::<Vec<_>>(),
            requests,
        )?;

        log::debug!(
            "decoding {}x{} stream with {} OUTPUT, {} CAPTURE buffers and {} requests",
            coded_size.0,
            coded_size.1,
            output_count,
            capture_count,
            requests
        );

        self.output = output;
        self.capture = capture.into_iter().map(Some).collect();
        self.requests_busy = vec![false; requests];
        self.coded_size = Some(coded_size);

        for index in 0..capture_count as u32 {
            self.queue_capture(index)?;
        }

        Ok(())
    }

    fn queue_capture(&mut self, index: u32) -> Result<(), DecoderError> {
        let Some(buffer) = self.capture.get_mut(index as usize).and_then(Option::as_mut) else {
            return Err(DecoderError::InvalidBuffer(index));
        };

        buffer.region.transition(RegionState::AllocatedToDecoder)?;
        self.backend.queue_capture(index, &buffer.region)?;
        buffer.state = DecodeQueueState::QueuedToHardware;

        Ok(())
    }

    /// Number of CAPTURE buffers the hardware can decode into.
    pub fn queued_capture_buffers(&self) -> usize {
        self.capture
            .iter()
            .flatten()
            .filter(|b| b.state == DecodeQueueState::QueuedToHardware)
            .count()
    }

    /// Queue the parked buffers whose picture is not a reference anymore.
    fn flush_parked(&mut self) -> Result<(), DecoderError> {
        let (release, keep) = self
            .parked
            .iter()
            .copied()
            .partition::<Vec<u32>, _>(|&index| !self.dpb.is_referenced(index));
        self.parked = keep;

        for index in release {
            self.queue_capture(index)?;
        }

        Ok(())
    }

    /// Size of the compressed data for `slices` once written into an OUTPUT buffer.
    fn payload_size(&self, slices: &[&NalUnit]) -> usize {
        let start_code_len = match self.config.start_code {
            StartCode::AnnexB => ANNEX_B_START_CODE.len(),
            StartCode::None => 0,
        };
        slices.iter().map(|nal| start_code_len + nal.data().len()).sum()
    }

    /// Decode the access unit made of `nal_units`, using the parameter sets in `params`.
    ///
    /// Non-slice units are ignored.
    pub fn submit_frame(
        &mut self,
        nal_units: &[NalUnit],
        params: &ParameterSetState,
    ) -> Result<SubmitResult, DecoderError> {
        self.check_running()?;

        let slices = nal_units.iter().filter(|nal| nal.is_slice()).collect::<Vec<_>>();
        if slices.is_empty() {
            return Ok(self.frame_error(FrameError::NoSlices));
        }

        let headers = match slices
            .iter()
            .map(|nal| parse_slice_header(nal, params))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(headers) => headers,
            Err(e) => return Ok(self.frame_error(e.into())),
        };
        let hdr = &headers[0];
        let (sps, pps) = match params
            .lookup_pps(hdr.pic_parameter_set_id)
            .and_then(|pps| Ok((params.lookup_sps(pps.seq_parameter_set_id)?, pps)))
        {
            Ok((sps, pps)) => (Arc::clone(sps), Arc::clone(pps)),
            Err(e) => return Ok(self.frame_error(e.into())),
        };

        let Some(coded_size) = self.coded_size else {
            return Err(DecoderError::NotInitialized);
        };
        if (sps.width(), sps.height()) != coded_size {
            return Err(self.fail(DecoderError::ResolutionChange {
                from: coded_size,
                to: (sps.width(), sps.height()),
            }));
        }

        // One request per frame, or per slice in slice-based mode.
        let jobs: Vec<Vec<&NalUnit>> = match self.config.decode_mode {
            DecodeMode::FrameBased => vec![slices.clone()],
            DecodeMode::SliceBased => slices.iter().map(|nal| vec![*nal]).collect(),
        };
        if jobs.len() > self.output.len() || jobs.len() > self.requests_busy.len() {
            return Ok(self.frame_error(FrameError::TooManySlices(jobs.len())));
        }
        let max = self.config.max_slice_size;
        if let Some(size) = jobs
            .iter()
            .map(|job| self.payload_size(job))
            .find(|&size| size > max)
        {
            return Ok(self.frame_error(FrameError::TooLarge { size, max }));
        }

        let free_outputs = self.output.iter().filter(|b| !b.queued).count();
        let free_requests = self.requests_busy.iter().filter(|busy| !**busy).count();
        if free_outputs < jobs.len()
            || free_requests < jobs.len()
            || self.queued_capture_buffers() <= self.pending_frames
        {
            return Ok(SubmitResult::Busy);
        }

        // Reference state only changes once the whole frame is queued.
        let dpb = self.dpb.clone();
        let timestamp = self.next_timestamp;
        self.next_timestamp += 1;
        self.dpb.configure(&sps);
        let pic = match self.dpb.start_picture(&sps, hdr, timestamp) {
            Ok(pic) => pic,
            Err(e) => {
                self.dpb = dpb;
                return Ok(self.frame_error(e.into()));
            }
        };

        let mut controls = FrameControls {
            sps: controls::sps_control(&sps),
            pps: controls::pps_control(&pps),
            scaling_matrix: controls::scaling_matrix_control(&pps),
            decode_params: controls::decode_params_control(hdr, &pic, &self.dpb),
            slice: None,
        };

        let num_jobs = jobs.len();
        for (i, job) in jobs.into_iter().enumerate() {
            if self.config.decode_mode == DecodeMode::SliceBased {
                controls.slice = Some(self.slice_controls(&headers[i], &pic));
            }

            match self.submit_job(&job, timestamp, &controls, i + 1 < num_jobs) {
                Ok(()) => (),
                Err(DecoderError::Backend(BackendError::Rejected(errno))) => {
                    log::warn!("frame {} rejected by the decoder: {}", timestamp, errno);
                    self.dpb = dpb;
                    if i > 0 {
                        self.discard_partial_frame(timestamp)?;
                    }
                    return Ok(self.frame_error(FrameError::Rejected(BackendError::Rejected(
                        errno,
                    ))));
                }
                Err(e) => return Err(self.fail(e)),
            }
        }

        self.dpb.finish_picture(&pic, hdr);
        self.flush_parked()?;

        self.pending_frames += 1;
        log::trace!("submitted frame {} ({} slices)", timestamp, slices.len());

        Ok(SubmitResult::Submitted { timestamp })
    }

    /// Some slices of frame `timestamp` are queued and hold a CAPTURE buffer: let the decoder
    /// complete it, and recycle the buffer when it does.
    fn discard_partial_frame(&mut self, timestamp: u64) -> Result<(), DecoderError> {
        if let Err(e) = self.backend.release_held_capture() {
            return Err(self.fail(e));
        }
        self.discarded.push(timestamp);
        self.pending_frames += 1;
        Ok(())
    }

    fn frame_error(&self, e: FrameError) -> SubmitResult {
        log::warn!("dropping frame: {}", e);
        self.stats.record_decode_error();
        SubmitResult::FrameError(e)
    }

    fn slice_controls(&self, hdr: &SliceHeader, pic: &Picture) -> controls::SliceControls {
        let num_l0 = hdr.num_ref_idx_l0_active_minus1 as usize + 1;
        let num_l1 = hdr.num_ref_idx_l1_active_minus1 as usize + 1;

        let (list0, list1) = if hdr.slice_type.is_p() {
            let mut list0 = self.dpb.ref_pic_list_p();
            self.dpb.modify_ref_pic_list(
                &mut list0,
                &hdr.ref_pic_list_modification_l0,
                hdr.frame_num,
                num_l0,
            );
            (list0, Vec::new())
        } else if hdr.slice_type.is_b() {
            let (mut list0, mut list1) = self.dpb.ref_pic_list_b(pic.pic_order_cnt());
            self.dpb.modify_ref_pic_list(
                &mut list0,
                &hdr.ref_pic_list_modification_l0,
                hdr.frame_num,
                num_l0,
            );
            self.dpb.modify_ref_pic_list(
                &mut list1,
                &hdr.ref_pic_list_modification_l1,
                hdr.frame_num,
                num_l1,
            );
            (list0, list1)
        } else {
            (Vec::new(), Vec::new())
        };

        controls::slice_controls(hdr, &list0, &list1)
    }

    /// Write `slices` into a free OUTPUT buffer and submit them with a free request.
    fn submit_job(
        &mut self,
        slices: &[&NalUnit],
        timestamp: u64,
        controls: &FrameControls,
        hold_capture: bool,
    ) -> Result<(), DecoderError> {
        let (Some(output_index), Some(request)) = (
            self.output.iter().position(|b| !b.queued),
            self.requests_busy.iter().position(|busy| !busy),
        ) else {
            // Availability has been checked before.
            return Err(BackendError::Rejected(Errno::EBUSY).into());
        };
        let start_code = self.config.start_code;

        let output = &mut self.output[output_index];
        output.mapping.begin_access(SyncAccess::Write)?;
        let data = output.mapping.as_mut();
        let mut offset = 0;
        for nal in slices {
            if start_code == StartCode::AnnexB {
                let end = offset + ANNEX_B_START_CODE.len();
                data[offset..end].copy_from_slice(&ANNEX_B_START_CODE);
                offset = end;
            }
            let payload = nal.data();
            data[offset..offset + payload.len()].copy_from_slice(payload);
            offset += payload.len();
        }
        output.mapping.end_access()?;

        output.region.transition(RegionState::AllocatedToDecoder)?;
        let res = self.backend.submit(&DecodeJob {
            request,
            output_index: output_index as u32,
            output: &output.region,
            bytes_used: offset,
            timestamp,
            controls,
            hold_capture,
        });
        if let Err(e) = res {
            output.region.release_to_free();
            return Err(e.into());
        }

        output.queued = true;
        self.requests_busy[request] = true;

        Ok(())
    }

    /// Process the completion events of the backend and return the frames decoded since the last
    /// call, in decode order.
    pub fn reclaim(&mut self) -> Result<Vec<DecodeBuffer>, DecoderError> {
        self.check_running()?;

        let mut frames = Vec::new();
        loop {
            let event = match self.backend.next_event() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => return Err(self.fail(e)),
            };

            match event {
                BackendEvent::InputBufferDone {
                    output_index,
                    request,
                } => {
                    if let Some(output) = self.output.get_mut(output_index as usize) {
                        output.queued = false;
                        output.region.release_to_free();
                    }
                    if let Some(busy) = self.requests_busy.get_mut(request) {
                        *busy = false;
                    }
                }
                BackendEvent::FrameCompleted {
                    capture_index,
                    timestamp,
                    error,
                } => {
                    let Some(mut buffer) = self
                        .capture
                        .get_mut(capture_index as usize)
                        .and_then(Option::take)
                    else {
                        log::warn!("completion for unknown CAPTURE buffer {}", capture_index);
                        continue;
                    };
                    self.pending_frames = self.pending_frames.saturating_sub(1);
                    buffer.timestamp = timestamp;

                    if let Some(pos) = self.discarded.iter().position(|&ts| ts == timestamp) {
                        // Already reported when it was rejected.
                        self.discarded.swap_remove(pos);
                        log::debug!("recycling CAPTURE buffer {} of rejected frame", capture_index);
                        buffer.state = DecodeQueueState::Ready;
                        self.requeue_capture_buffer(buffer)?;
                        continue;
                    }

                    self.dpb.bind_capture(timestamp, capture_index);
                    if error {
                        log::warn!("decoder reported an error for frame {}", timestamp);
                        self.stats.record_decode_error();
                        buffer.state = DecodeQueueState::Ready;
                        self.requeue_capture_buffer(buffer)?;
                        continue;
                    }

                    if let Err(e) = buffer.region.transition(RegionState::Decoded) {
                        return Err(self.fail(e));
                    }
                    buffer.state = DecodeQueueState::Ready;
                    self.stats.record_decoded();
                    frames.push(buffer);
                }
            }
        }

        Ok(frames)
    }

    /// Give `buffer` back to the session so it can be decoded into again.
    ///
    /// If the buffer holds a picture still used as reference, it is only queued to the hardware
    /// once the picture stops being referenced.
    pub fn requeue_capture_buffer(&mut self, mut buffer: DecodeBuffer) -> Result<(), DecoderError> {
        let index = buffer.index;
        match self.capture.get(index as usize) {
            Some(None) => (),
            _ => return Err(DecoderError::InvalidBuffer(index)),
        }

        if !buffer.region.release_to_free() {
            log::warn!(
                "CAPTURE buffer {} returned in state {:?}",
                index,
                buffer.region.state()
            );
        }
        buffer.state = DecodeQueueState::Idle;
        self.capture[index as usize] = Some(buffer);

        if self.failed {
            return Ok(());
        }

        if self.dpb.is_referenced(index) {
            log::trace!("CAPTURE buffer {} holds a reference picture, parking", index);
            self.parked.push(index);
            Ok(())
        } else {
            self.queue_capture(index).map_err(|e| self.fail(e))
        }
    }

    /// Stop the hardware. Frames still being decoded are lost and buffers returned afterwards are
    /// kept idle.
    pub fn stop(&mut self) {
        self.backend.stop();
        self.failed = true;
        self.pending_frames = 0;
        self.discarded.clear();
        for buffer in self.capture.iter_mut().flatten() {
            buffer.state = DecodeQueueState::Idle;
            buffer.region.release_to_free();
        }
        for output in &mut self.output {
            output.queued = false;
            output.region.release_to_free();
        }
    }
}

impl<B: StatelessDecoderBackend> Drop for DecodeSession<B> {
    fn drop(&mut self) {
        // Buffers must not be freed while the hardware may still write into them.
        self.backend.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::dummy::DummyBackend;
    use super::*;
    use crate::h264::testing::*;
    use crate::h264::AccessUnit;
    use crate::h264::AccessUnitAssembler;
    use crate::memfd::MemFdAllocator;

    fn session(
        backend: DummyBackend,
        config: DecoderConfig,
    ) -> (DecodeSession<DummyBackend>, Arc<PipelineStatistics>) {
        let pool = Arc::new(BufferPool::new(Arc::new(MemFdAllocator), 32));
        let stats = Arc::new(PipelineStatistics::new());
        (
            DecodeSession::new(backend, pool, config, Arc::clone(&stats)),
            stats,
        )
    }

    fn small_config(capture_buffers: usize) -> DecoderConfig {
        DecoderConfig {
            capture_buffers,
            max_slice_size: 4096,
            ..Default::default()
        }
    }

    /// Submit `au`, reclaiming and requeueing decoded frames while the session is busy.
    /// Returns the number of frames reclaimed.
    fn submit_retrying(
        session: &mut DecodeSession<DummyBackend>,
        au: &AccessUnit,
        state: &ParameterSetState,
        capture_buffers: usize,
    ) -> usize {
        let mut decoded = 0;
        loop {
            match session.submit_frame(&au.nals, state).unwrap() {
                SubmitResult::Submitted { .. } => return decoded,
                SubmitResult::Busy => (),
                SubmitResult::FrameError(e) => panic!("unexpected frame error: {}", e),
            }
            for frame in session.reclaim().unwrap() {
                decoded += 1;
                session.requeue_capture_buffer(frame).unwrap();
            }
            assert!(session.capture_in_flight() <= capture_buffers);
        }
    }

    /// Feed `nals` through an access unit assembler into `session`, requeueing decoded frames
    /// immediately. Returns the number of frames decoded.
    fn decode_stream(
        session: &mut DecodeSession<DummyBackend>,
        nals: Vec<NalUnit>,
        capture_buffers: usize,
    ) -> usize {
        let mut state = ParameterSetState::new();
        let mut assembler = AccessUnitAssembler::new();
        let mut decoded = 0;

        for nal in nals {
            if let Some(au) = assembler.push(nal.clone(), &state) {
                if !session.is_initialized() {
                    session
                        .initialize(2, capture_buffers, state.sps().unwrap())
                        .unwrap();
                }
                decoded += submit_retrying(session, &au, &state, capture_buffers);
            }
            state.process(&nal).unwrap();
        }
        if let Some(au) = assembler.flush() {
            decoded += submit_retrying(session, &au, &state, capture_buffers);
        }
        while session.pending_frames() > 0 {
            for frame in session.reclaim().unwrap() {
                decoded += 1;
                session.requeue_capture_buffer(frame).unwrap();
            }
        }

        decoded
    }

    #[test]
    fn sps_pps_and_49_frames() {
        let (mut session, stats) = session(DummyBackend::new(), small_config(6));
        // SPS, PPS, IDR and 48 P frames.
        let nals = simple_stream(1, 48);

        let decoded = decode_stream(&mut session, nals, 6);
        assert_eq!(decoded, 49);
        assert_eq!(stats.snapshot().decoded, 49);
        assert_eq!(stats.snapshot().decode_errors, 0);
        assert!(session.capture_in_flight() <= 6);
    }

    #[test]
    fn busy_when_requests_exhausted() {
        let backend = DummyBackend::new();
        let control = backend.control();
        control.set_auto_complete(false);
        let (mut session, _) = session(
            backend,
            DecoderConfig {
                requests: 2,
                output_buffers: 4,
                ..small_config(8)
            },
        );

        let mut state = ParameterSetState::new();
        let nals = simple_stream(1, 4);
        for nal in &nals[..2] {
            state.process(nal).unwrap();
        }
        session.initialize(4, 8, state.sps().unwrap()).unwrap();

        assert!(matches!(
            session.submit_frame(&nals[2..3], &state).unwrap(),
            SubmitResult::Submitted { timestamp: 1 }
        ));
        assert!(matches!(
            session.submit_frame(&nals[3..4], &state).unwrap(),
            SubmitResult::Submitted { timestamp: 2 }
        ));
        assert!(matches!(
            session.submit_frame(&nals[4..5], &state).unwrap(),
            SubmitResult::Busy
        ));

        control.complete_all();
        let frames = session.reclaim().unwrap();
        assert_eq!(
            frames.iter().map(DecodeBuffer::timestamp).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(frames.iter().all(|f| f.state() == DecodeQueueState::Ready));
        assert!(frames
            .iter()
            .all(|f| f.region().state() == RegionState::Decoded));
        assert!(matches!(
            session.submit_frame(&nals[4..5], &state).unwrap(),
            SubmitResult::Submitted { timestamp: 3 }
        ));
    }

    #[test]
    fn reference_buffer_is_parked() {
        let backend = DummyBackend::new();
        let control = backend.control();
        let (mut session, _) = session(backend, small_config(4));

        let mut state = ParameterSetState::new();
        let nals = simple_stream(1, 2);
        for nal in &nals[..2] {
            state.process(nal).unwrap();
        }
        session.initialize(2, 4, state.sps().unwrap()).unwrap();

        session.submit_frame(&nals[2..3], &state).unwrap();
        let idr = session.reclaim().unwrap().pop().unwrap();
        let idr_index = idr.index();

        // The IDR picture is the reference of the next frame, so it must not be decoded into.
        session.requeue_capture_buffer(idr).unwrap();
        assert!(!control.queued_captures().contains(&idr_index));

        // Once the P frame replaced it in the DPB, it is queued again.
        session.submit_frame(&nals[3..4], &state).unwrap();
        assert!(control.queued_captures().contains(&idr_index));
    }

    #[test]
    fn annex_b_start_codes_are_written() {
        let backend = DummyBackend::new();
        let control = backend.control();
        let (mut session, _) = session(backend, small_config(4));

        let mut state = ParameterSetState::new();
        let nals = simple_stream(1, 0);
        for nal in &nals[..2] {
            state.process(nal).unwrap();
        }
        session.initialize(2, 4, state.sps().unwrap()).unwrap();
        session.submit_frame(&nals[2..3], &state).unwrap();

        let payloads = control.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(&payloads[0][..3], &[0, 0, 1]);
        assert_eq!(&payloads[0][3..], nals[2].data());
    }

    #[test]
    fn slice_based_mode_uses_one_request_per_slice() {
        let backend = DummyBackend::new();
        let control = backend.control();
        let (mut session, _) = session(
            backend,
            DecoderConfig {
                decode_mode: DecodeMode::SliceBased,
                start_code: StartCode::None,
                ..small_config(4)
            },
        );

        let mut state = ParameterSetState::new();
        let nals = simple_stream(1, 1);
        for nal in &nals[..2] {
            state.process(nal).unwrap();
        }
        session.initialize(2, 4, state.sps().unwrap()).unwrap();
        session.submit_frame(&nals[2..3], &state).unwrap();
        session.reclaim().unwrap();
        session.submit_frame(&nals[3..4], &state).unwrap();

        let jobs = control.jobs();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|job| job.has_slice_controls && !job.hold_capture));
        // The P slice refers to the IDR picture.
        assert_eq!(jobs[1].num_references, 1);
        assert_eq!(control.payloads()[1], nals[3].data());
    }

    #[test]
    fn decode_errors_are_per_frame() {
        let backend = DummyBackend::new();
        let control = backend.control();
        let (mut session, stats) = session(backend, small_config(4));

        let mut state = ParameterSetState::new();
        let nals = simple_stream(1, 3);
        for nal in &nals[..2] {
            state.process(nal).unwrap();
        }
        session.initialize(2, 4, state.sps().unwrap()).unwrap();

        // Rejected at submission.
        control.reject_next_submit();
        assert!(matches!(
            session.submit_frame(&nals[2..3], &state).unwrap(),
            SubmitResult::FrameError(FrameError::Rejected(_))
        ));
        // Failed during decoding.
        control.fail_timestamp(2);
        session.submit_frame(&nals[2..3], &state).unwrap();
        assert!(session.reclaim().unwrap().is_empty());
        // Decoding goes on.
        session.submit_frame(&nals[2..3], &state).unwrap();
        assert_eq!(session.reclaim().unwrap().len(), 1);

        // Garbage.
        let sei = NalUnit::new(vec![0x06, 0x05, 0x80], 4).unwrap();
        assert!(matches!(
            session.submit_frame(&[sei], &state).unwrap(),
            SubmitResult::FrameError(FrameError::NoSlices)
        ));

        assert_eq!(stats.snapshot().decode_errors, 3);
        assert_eq!(stats.snapshot().decoded, 1);
    }

    #[test]
    fn rejected_slice_recycles_held_buffer() {
        let backend = DummyBackend::new();
        let control = backend.control();
        let (mut session, stats) = session(
            backend,
            DecoderConfig {
                decode_mode: DecodeMode::SliceBased,
                ..small_config(4)
            },
        );

        let mut state = ParameterSetState::new();
        let nals = simple_stream(1, 1);
        for nal in &nals[..2] {
            state.process(nal).unwrap();
        }
        session.initialize(2, 4, state.sps().unwrap()).unwrap();

        // The first slice goes through and holds a CAPTURE buffer, the second one is refused.
        let two_slices = [nals[2].clone(), nals[2].clone()];
        control.reject_submit_after(1);
        assert!(matches!(
            session.submit_frame(&two_slices, &state).unwrap(),
            SubmitResult::FrameError(FrameError::Rejected(_))
        ));
        assert!(control.jobs()[0].hold_capture);
        assert_eq!(session.pending_frames(), 1);

        assert!(session.reclaim().unwrap().is_empty());
        assert_eq!(session.pending_frames(), 0);
        assert_eq!(control.held_capture(), None);
        assert_eq!(control.queued_captures().len(), 4);

        // The rejected IDR never became a reference.
        assert!(matches!(
            session.submit_frame(&two_slices, &state).unwrap(),
            SubmitResult::Submitted { timestamp: 2 }
        ));
        assert_eq!(control.jobs()[1].num_references, 0);
        let frames = session.reclaim().unwrap();
        assert_eq!(
            frames.iter().map(DecodeBuffer::timestamp).collect::<Vec<_>>(),
            vec![2]
        );

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.decode_errors, 1);
        assert_eq!(snapshot.decoded, 1);
    }

    #[test]
    fn rejected_idr_keeps_references() {
        let backend = DummyBackend::new();
        let control = backend.control();
        let (mut session, _) = session(backend, small_config(4));

        let mut state = ParameterSetState::new();
        let nals = simple_stream(1, 2);
        for nal in &nals[..2] {
            state.process(nal).unwrap();
        }
        session.initialize(2, 4, state.sps().unwrap()).unwrap();

        for nal in &nals[2..4] {
            session.submit_frame(std::slice::from_ref(nal), &state).unwrap();
            for frame in session.reclaim().unwrap() {
                session.requeue_capture_buffer(frame).unwrap();
            }
        }

        control.reject_next_submit();
        assert!(matches!(
            session.submit_frame(&nals[2..3], &state).unwrap(),
            SubmitResult::FrameError(FrameError::Rejected(_))
        ));
        assert_eq!(session.pending_frames(), 0);

        // The second P frame still predicts from the first one.
        assert!(matches!(
            session.submit_frame(&nals[4..5], &state).unwrap(),
            SubmitResult::Submitted { .. }
        ));
        let jobs = control.jobs();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[2].num_references, 1);
        assert_eq!(session.reclaim().unwrap().len(), 1);
    }

    #[test]
    fn resolution_change_is_fatal() {
        let (mut session, _) = session(DummyBackend::new(), small_config(4));

        let mut state = ParameterSetState::new();
        let nals = simple_stream(1, 0);
        for nal in &nals[..2] {
            state.process(nal).unwrap();
        }
        session.initialize(2, 4, state.sps().unwrap()).unwrap();

        state
            .process(&sps_nal(&SpsParams {
                width_mbs: 40,
                ..Default::default()
            }))
            .unwrap();
        assert!(matches!(
            session.submit_frame(&nals[2..3], &state),
            Err(DecoderError::ResolutionChange { .. })
        ));
        assert!(matches!(
            session.submit_frame(&nals[2..3], &state),
            Err(DecoderError::Stopped)
        ));
    }

    #[test]
    fn oversized_frame() {
        let (mut session, _) = session(
            DummyBackend::new(),
            DecoderConfig {
                max_slice_size: 8,
                ..small_config(4)
            },
        );

        let mut state = ParameterSetState::new();
        let nals = simple_stream(1, 0);
        for nal in &nals[..2] {
            state.process(nal).unwrap();
        }
        session.initialize(2, 4, state.sps().unwrap()).unwrap();
        assert!(matches!(
            session.submit_frame(&nals[2..3], &state).unwrap(),
            SubmitResult::FrameError(FrameError::TooLarge { max: 8, .. })
        ));
    }

    #[test]
    fn unknown_buffer_is_refused() {
        let (mut session, _) = session(DummyBackend::new(), small_config(4));

        let mut state = ParameterSetState::new();
        let nals = simple_stream(1, 0);
        for nal in &nals[..2] {
            state.process(nal).unwrap();
        }
        session.initialize(2, 4, state.sps().unwrap()).unwrap();
        session.submit_frame(&nals[2..3], &state).unwrap();
        let frame = session.reclaim().unwrap().pop().unwrap();
        let index = frame.index();
        session.requeue_capture_buffer(frame).unwrap();

        // Same index again while the session owns it.
        let pool = BufferPool::new(Arc::new(MemFdAllocator), 1);
        let fake = DecodeBuffer {
            index,
            region: pool.allocate(16).unwrap(),
            layout: FrameLayout::nv12(4, 4, 4),
            state: DecodeQueueState::Ready,
            timestamp: 0,
        };
        assert!(matches!(
            session.requeue_capture_buffer(fake),
            Err(DecoderError::InvalidBuffer(i)) if i == index
        ));
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Backend for V4L2 stateless H.264 decoders.
//!
//! Compressed data goes to the `OUTPUT_MPLANE` queue in the `S264` format, decoded frames come
//! out of the `CAPTURE_MPLANE` queue as `NV12`. Both queues use DMA-BUF memory from the buffer
//! pool. Codec controls are attached to each OUTPUT buffer through a media request.

use std::collections::VecDeque;
use std::fs::File;
use std::fs::OpenOptions;
use std::mem::size_of;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;

use nix::errno::Errno;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use v4l2r::bindings;
use v4l2r::device::Device as V4l2Device;
use v4l2r::device::DeviceConfig;
use v4l2r::device::DeviceOpenError;
use v4l2r::ioctl::BufferFlags;
use v4l2r::ioctl::CtrlWhich;
use v4l2r::ioctl::DqBufError;
use v4l2r::ioctl::DqBufIoctlError;
use v4l2r::ioctl::IntoErrno;
use v4l2r::ioctl::QueryCapError;
use v4l2r::ioctl::V4l2Buffer;
use v4l2r::memory::MemoryType;
use v4l2r::Format;
use v4l2r::PixelFormat;
use v4l2r::QueueType;
use zerocopy::FromZeroes;

use super::controls::*;
use super::BackendError;
use super::BackendEvent;
use super::DecodeJob;
use super::StatelessDecoderBackend;
use crate::config::DecodeMode;
use crate::config::DecoderConfig;
use crate::config::StartCode;
use crate::pool::MemoryRegion;
use crate::FrameLayout;

const V4L2_BUF_FLAG_M2M_HOLD_CAPTURE_BUF: u32 = 0x0000_0200;
const V4L2_BUF_FLAG_REQUEST_FD: u32 = 0x0080_0000;
const V4L2_FIELD_NONE: u32 = 1;
const V4L2_DEC_CMD_FLUSH: u32 = 4;

/// `struct v4l2_plane`.
#[repr(C)]
#[allow(dead_code)]
#[derive(FromZeroes)]
struct RawV4l2Plane {
    bytesused: u32,
    length: u32,
    /// Union of `mem_offset`, `userptr` and `fd`.
    m: libc::c_ulong,
    data_offset: u32,
    reserved: [u32; 11],
}

/// `struct v4l2_buffer`, declared here because `v4l2r` does not let us attach a request to a
/// queued buffer.
#[repr(C)]
#[allow(dead_code)]
#[derive(FromZeroes)]
struct RawV4l2Buffer {
    index: u32,
    type_: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp: [libc::c_long; 2],
    timecode: [u32; 4],
    sequence: u32,
    memory: u32,
    /// Union of `offset`, `userptr`, `planes` and `fd`.
    m: libc::c_ulong,
    length: u32,
    reserved2: u32,
    request_fd: i32,
}

/// `struct v4l2_decoder_cmd`, with its argument union seen as raw words.
#[repr(C)]
#[allow(dead_code)]
#[derive(FromZeroes)]
struct RawDecoderCmd {
    cmd: u32,
    flags: u32,
    raw: [u32; 16],
}

nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, RawV4l2Buffer);
nix::ioctl_readwrite!(vidioc_decoder_cmd, b'V', 96, RawDecoderCmd);
nix::ioctl_read!(media_ioc_request_alloc, b'|', 0x05, libc::c_int);
nix::ioctl_none!(media_request_ioc_queue, b'|', 0x80);
nix::ioctl_none!(media_request_ioc_reinit, b'|', 0x81);

fn timeval_from_timestamp(timestamp: u64) -> [libc::c_long; 2] {
    [
        (timestamp / 1_000_000) as libc::c_long,
        (timestamp % 1_000_000) as libc::c_long,
    ]
}

fn timestamp_from_timeval(tv: &bindings::timeval) -> u64 {
    tv.tv_sec as u64 * 1_000_000 + tv.tv_usec as u64
}

/// Arguments of a raw `VIDIOC_QBUF` on a single-plane DMA-BUF buffer.
struct QueueArgs<'a> {
    queue: QueueType,
    index: u32,
    dmabuf: BorrowedFd<'a>,
    length: usize,
    bytes_used: usize,
    timestamp: u64,
    request: Option<BorrowedFd<'a>>,
    hold_capture: bool,
}

fn ext_control<T>(id: u32, payload: &T) -> bindings::v4l2_ext_control {
    let mut ctrl = bindings::v4l2_ext_control {
        id,
        size: size_of::<T>() as u32,
        ..Default::default()
    };
    // The kernel only reads compound payloads passed to S_EXT_CTRLS.
    ctrl.__bindgen_anon_1.ptr = payload as *const T as *mut libc::c_void;
    ctrl
}

fn menu_control(id: u32, value: i32) -> bindings::v4l2_ext_control {
    let mut ctrl = bindings::v4l2_ext_control {
        id,
        ..Default::default()
    };
    ctrl.__bindgen_anon_1.value = value;
    ctrl
}

pub struct V4l2StatelessBackend {
    device: V4l2Device,
    media: File,
    requests: Vec<OwnedFd>,
    /// Request attached to each OUTPUT buffer while it is queued.
    output_requests: Vec<Option<usize>>,
    /// OUTPUT buffers dequeued whose request has not signaled completion yet.
    completing: VecDeque<(u32, usize)>,
    events: VecDeque<BackendEvent>,
    output_size: usize,
    streaming: bool,
}

impl V4l2StatelessBackend {
    /// Open the decoder and media devices named in `config`.
    pub fn open(config: &DecoderConfig) -> Result<Self, BackendError> {
        let device = match V4l2Device::open(
            &config.video_device,
            DeviceConfig::new().non_blocking_dqbuf(),
        ) {
            Ok(device) => device,
            Err(DeviceOpenError::OpenError(e)) => {
                return Err(BackendError::Open(
                    config.video_device.clone(),
                    Errno::from_raw(e as i32),
                ))
            }
            Err(DeviceOpenError::QueryCapError(QueryCapError::IoctlError(e))) => {
                return Err(BackendError::Open(
                    config.video_device.clone(),
                    Errno::from_raw(e as i32),
                ))
            }
        };

        let media = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.media_device)
            .map_err(|e| {
                BackendError::Open(
                    config.media_device.clone(),
                    Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)),
                )
            })?;

        log::debug!(
            "opened stateless decoder {} with media device {}",
            config.video_device.display(),
            config.media_device.display()
        );

        Ok(Self {
            device,
            media,
            requests: Vec::new(),
            output_requests: Vec::new(),
            completing: VecDeque::new(),
            events: VecDeque::new(),
            output_size: config.max_slice_size,
            streaming: false,
        })
    }

    fn alloc_request(&self) -> Result<OwnedFd, BackendError> {
        let mut fd: libc::c_int = -1;
        // SAFETY: `self.media` is a valid media device and `fd` a valid destination.
        unsafe { media_ioc_request_alloc(self.media.as_raw_fd(), &mut fd) }
            .map_err(|e| BackendError::Ioctl("MEDIA_IOC_REQUEST_ALLOC", e))?;
        // SAFETY: the kernel has just given us ownership of `fd`.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn qbuf(&self, args: QueueArgs) -> Result<(), Errno> {
        let mut plane = RawV4l2Plane::new_zeroed();
        plane.bytesused = args.bytes_used as u32;
        plane.length = args.length as u32;
        plane.m = args.dmabuf.as_raw_fd() as libc::c_ulong;

        let mut buffer = RawV4l2Buffer::new_zeroed();
        buffer.index = args.index;
        buffer.type_ = args.queue as u32;
        buffer.memory = MemoryType::DmaBuf as u32;
        buffer.field = V4L2_FIELD_NONE;
        buffer.timestamp = timeval_from_timestamp(args.timestamp);
        buffer.m = &mut plane as *mut RawV4l2Plane as libc::c_ulong;
        buffer.length = 1;
        if let Some(request) = args.request {
            buffer.flags |= V4L2_BUF_FLAG_REQUEST_FD;
            buffer.request_fd = request.as_raw_fd();
        }
        if args.hold_capture {
            buffer.flags |= V4L2_BUF_FLAG_M2M_HOLD_CAPTURE_BUF;
        }

        // SAFETY: `buffer` and the plane it points to are valid for the duration of the call.
        unsafe { vidioc_qbuf(self.device.as_raw_fd(), &mut buffer) }.map(|_| ())
    }

    fn set_format(
        &mut self,
        queue: QueueType,
        format: &Format,
    ) -> Result<Format, BackendError> {
        let format: Format = v4l2r::ioctl::s_fmt(&mut self.device, (queue, format))
            .map_err(|e| BackendError::Ioctl("VIDIOC_S_FMT", Errno::from_raw(e.into_errno())))?;
        Ok(format)
    }

    /// Poll the device and the pending requests, and turn whatever completed into events.
    fn collect_events(&mut self) -> Result<(), BackendError> {
        // Requests signal completion with POLLPRI.
        while let Some(&(output_index, request)) = self.completing.front() {
            let fd = self.requests[request].as_fd();
            let mut fds = [PollFd::new(fd, PollFlags::POLLPRI)];
            let ready = poll(&mut fds, PollTimeout::ZERO)
                .map_err(|e| BackendError::Ioctl("poll", e))?;
            if ready == 0 {
                break;
            }

            // SAFETY: `fd` is a valid request.
            unsafe { media_request_ioc_reinit(fd.as_raw_fd()) }
                .map_err(|e| BackendError::Ioctl("MEDIA_REQUEST_IOC_REINIT", e))?;
            self.completing.pop_front();
            self.events.push_back(BackendEvent::InputBufferDone {
                output_index,
                request,
            });
        }

        loop {
            match v4l2r::ioctl::dqbuf::<V4l2Buffer>(&self.device, QueueType::VideoOutputMplane) {
                Ok(buffer) => {
                    let index = buffer.index();
                    match self.output_requests.get_mut(index as usize).and_then(Option::take) {
                        Some(request) => self.completing.push_back((index, request)),
                        None => log::warn!("dequeued unknown OUTPUT buffer {}", index),
                    }
                }
                Err(DqBufError::IoctlError(DqBufIoctlError::NotReady))
                | Err(DqBufError::IoctlError(DqBufIoctlError::Eos)) => break,
                Err(e) => {
                    return Err(BackendError::Ioctl(
                        "VIDIOC_DQBUF",
                        Errno::from_raw(e.into_errno()),
                    ))
                }
            }
        }

        loop {
            match v4l2r::ioctl::dqbuf::<V4l2Buffer>(&self.device, QueueType::VideoCaptureMplane) {
                Ok(buffer) => {
                    self.events.push_back(BackendEvent::FrameCompleted {
                        capture_index: buffer.index(),
                        timestamp: timestamp_from_timeval(&buffer.timestamp()),
                        error: buffer.flags().contains(BufferFlags::ERROR),
                    });
                }
                Err(DqBufError::IoctlError(DqBufIoctlError::NotReady))
                | Err(DqBufError::IoctlError(DqBufIoctlError::Eos)) => break,
                Err(e) => {
                    return Err(BackendError::Ioctl(
                        "VIDIOC_DQBUF",
                        Errno::from_raw(e.into_errno()),
                    ))
                }
            }
        }

        Ok(())
    }
}

impl StatelessDecoderBackend for V4l2StatelessBackend {
    fn configure(
        &mut self,
        coded_size: (u32, u32),
        config: &DecoderConfig,
    ) -> Result<FrameLayout, BackendError> {
        let (width, height) = coded_size;

        let output_format = self.set_format(
            QueueType::VideoOutputMplane,
            &Format {
                width,
                height,
                pixelformat: PixelFormat::from_fourcc(b"S264"),
                plane_fmt: vec![v4l2r::PlaneLayout {
                    sizeimage: config.max_slice_size as u32,
                    bytesperline: 0,
                }],
            },
        )?;
        if output_format.pixelformat != PixelFormat::from_fourcc(b"S264") {
            return Err(BackendError::Unsupported(format!(
                "decoder does not accept S264, got {}",
                output_format.pixelformat
            )));
        }
        if let Some(plane) = output_format.plane_fmt.first() {
            self.output_size = plane.sizeimage as usize;
        }

        let mode = match config.decode_mode {
            DecodeMode::FrameBased => V4L2_STATELESS_H264_DECODE_MODE_FRAME_BASED,
            DecodeMode::SliceBased => V4L2_STATELESS_H264_DECODE_MODE_SLICE_BASED,
        };
        let start_code = match config.start_code {
            StartCode::AnnexB => V4L2_STATELESS_H264_START_CODE_ANNEX_B,
            StartCode::None => V4L2_STATELESS_H264_START_CODE_NONE,
        };
        let mut ctrls = [
            menu_control(V4L2_CID_STATELESS_H264_DECODE_MODE, mode),
            menu_control(V4L2_CID_STATELESS_H264_START_CODE, start_code),
        ];
        v4l2r::ioctl::s_ext_ctrls(&self.device, CtrlWhich::Current, &mut ctrls).map_err(|e| {
            BackendError::Unsupported(format!(
                "decode mode {:?} with start code {:?} refused: {}",
                config.decode_mode,
                config.start_code,
                Errno::from_raw(e.into_errno())
            ))
        })?;

        let capture_format: Format =
            v4l2r::ioctl::g_fmt(&self.device, QueueType::VideoCaptureMplane).map_err(|e| {
                BackendError::Ioctl("VIDIOC_G_FMT", Errno::from_raw(e.into_errno()))
            })?;
        let capture_format = self.set_format(
            QueueType::VideoCaptureMplane,
            &Format {
                pixelformat: PixelFormat::from_fourcc(b"NV12"),
                ..capture_format
            },
        )?;
        if capture_format.pixelformat != PixelFormat::from_fourcc(b"NV12") {
            return Err(BackendError::Unsupported(format!(
                "decoder cannot produce NV12, got {}",
                capture_format.pixelformat
            )));
        }

        let plane = capture_format
            .plane_fmt
            .first()
            .ok_or_else(|| BackendError::Unsupported("CAPTURE format has no plane".into()))?;
        let mut layout = FrameLayout::nv12(
            capture_format.width,
            capture_format.height,
            plane.bytesperline as usize,
        );
        layout.size = layout.size.max(plane.sizeimage as usize);

        log::debug!(
            "CAPTURE format: {}x{} NV12, pitch {}, {} bytes",
            layout.width,
            layout.height,
            plane.bytesperline,
            layout.size
        );

        Ok(layout)
    }

    fn start(
        &mut self,
        output: &[MemoryRegion],
        capture: &[MemoryRegion],
        requests: usize,
    ) -> Result<(), BackendError> {
        for (queue, count) in [
            (QueueType::VideoOutputMplane, output.len()),
            (QueueType::VideoCaptureMplane, capture.len()),
        ] {
            let reqbufs: bindings::v4l2_requestbuffers =
                v4l2r::ioctl::reqbufs(&self.device, queue, MemoryType::DmaBuf, count as u32)
                    .map_err(|e| {
                        BackendError::Ioctl("VIDIOC_REQBUFS", Errno::from_raw(e.into_errno()))
                    })?;
            if (reqbufs.count as usize) < count {
                return Err(BackendError::Unsupported(format!(
                    "only {} buffers available on {:?}, {} needed",
                    reqbufs.count, queue, count
                )));
            }
        }

        self.requests = (0..requests)
            .map(|_| self.alloc_request())
            .collect::<Result<_, _>>()?;
        self.output_requests = vec![None; output.len()];

        for queue in [QueueType::VideoOutputMplane, QueueType::VideoCaptureMplane] {
            v4l2r::ioctl::streamon(&self.device, queue).map_err(|e| {
                BackendError::Ioctl("VIDIOC_STREAMON", Errno::from_raw(e.into_errno()))
            })?;
        }
        self.streaming = true;

        Ok(())
    }

    fn queue_capture(&mut self, index: u32, region: &MemoryRegion) -> Result<(), BackendError> {
        self.qbuf(QueueArgs {
            queue: QueueType::VideoCaptureMplane,
            index,
            dmabuf: region.as_fd(),
            length: region.len(),
            bytes_used: 0,
            timestamp: 0,
            request: None,
            hold_capture: false,
        })
        .map_err(|e| BackendError::Ioctl("VIDIOC_QBUF", e))
    }

    fn submit(&mut self, job: &DecodeJob) -> Result<(), BackendError> {
        let request = self
            .requests
            .get(job.request)
            .ok_or(BackendError::Rejected(Errno::EINVAL))?;
        let controls = job.controls;

        let mut ctrls = vec![
            ext_control(V4L2_CID_STATELESS_H264_SPS, &controls.sps),
            ext_control(V4L2_CID_STATELESS_H264_PPS, &controls.pps),
            ext_control(
                V4L2_CID_STATELESS_H264_SCALING_MATRIX,
                &controls.scaling_matrix,
            ),
            ext_control(
                V4L2_CID_STATELESS_H264_DECODE_PARAMS,
                &controls.decode_params,
            ),
        ];
        if let Some(slice) = &controls.slice {
            ctrls.push(ext_control(
                V4L2_CID_STATELESS_H264_SLICE_PARAMS,
                &slice.slice_params,
            ));
            ctrls.push(ext_control(
                V4L2_CID_STATELESS_H264_PRED_WEIGHTS,
                &slice.pred_weights,
            ));
        }

        // Invalid controls are a property of the frame, not of the device.
        v4l2r::ioctl::s_ext_ctrls(
            &self.device,
            CtrlWhich::Request(request.as_raw_fd()),
            ctrls.as_mut_slice(),
        )
        .map_err(|e| BackendError::Rejected(Errno::from_raw(e.into_errno())))?;

        let res = self.qbuf(QueueArgs {
            queue: QueueType::VideoOutputMplane,
            index: job.output_index,
            dmabuf: job.output.as_fd(),
            length: self.output_size.min(job.output.len()),
            bytes_used: job.bytes_used,
            timestamp: job.timestamp,
            request: Some(request.as_fd()),
            hold_capture: job.hold_capture,
        });
        if let Err(e) = res {
            // Controls are still attached to the request.
            // SAFETY: `request` is a valid request.
            let _ = unsafe { media_request_ioc_reinit(request.as_raw_fd()) };
            return Err(match e {
                Errno::EINVAL => BackendError::Rejected(e),
                e => BackendError::Ioctl("VIDIOC_QBUF", e),
            });
        }

        // SAFETY: `request` is a valid request.
        unsafe { media_request_ioc_queue(request.as_raw_fd()) }
            .map_err(|e| BackendError::Ioctl("MEDIA_REQUEST_IOC_QUEUE", e))?;

        if let Some(slot) = self.output_requests.get_mut(job.output_index as usize) {
            *slot = Some(job.request);
        }

        Ok(())
    }

    fn release_held_capture(&mut self) -> Result<(), BackendError> {
        let mut cmd = RawDecoderCmd::new_zeroed();
        cmd.cmd = V4L2_DEC_CMD_FLUSH;
        // SAFETY: `cmd` is a valid `v4l2_decoder_cmd` for the duration of the call.
        unsafe { vidioc_decoder_cmd(self.device.as_raw_fd(), &mut cmd) }
            .map_err(|e| BackendError::Ioctl("VIDIOC_DECODER_CMD", e))?;
        Ok(())
    }

    fn next_event(&mut self) -> Result<Option<BackendEvent>, BackendError> {
        if self.events.is_empty() && self.streaming {
            self.collect_events()?;
        }
        Ok(self.events.pop_front())
    }

    fn poll_fd(&self) -> Option<BorrowedFd> {
        // SAFETY: the device descriptor lives as long as `self`.
        Some(unsafe { BorrowedFd::borrow_raw(self.device.as_raw_fd()) })
    }

    fn stop(&mut self) {
        if !self.streaming {
            return;
        }
        self.streaming = false;

        for queue in [QueueType::VideoOutputMplane, QueueType::VideoCaptureMplane] {
            if let Err(e) = v4l2r::ioctl::streamoff(&self.device, queue) {
                log::error!("failed to stop {:?} queue: {}", queue, e);
            }
            let res: Result<bindings::v4l2_requestbuffers, _> =
                v4l2r::ioctl::reqbufs(&self.device, queue, MemoryType::DmaBuf, 0);
            if let Err(e) = res {
                log::error!("failed to free {:?} buffers: {}", queue, e);
            }
        }

        self.requests.clear();
        self.output_requests.clear();
        self.completing.clear();
        self.events.clear();
    }
}

impl Drop for V4l2StatelessBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

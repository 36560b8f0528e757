// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Zero-copy H.264 decode-and-display pipeline.
//!
//! Compressed H.264 elementary-stream data is split into NAL units by the [`h264`] parser,
//! decoded by a stateless V4L2 decoder driven through a [`decoder::DecodeSession`], and the
//! decoded frames are scanned out directly from the same DMA-BUF memory by the
//! [`display::Presenter`]. The [`pipeline::Pipeline`] runs the feed, render and page-flip
//! threads and connects them through [`queue::BoundedQueue`]s.
//!
//! All memory shared between the decoder and the display comes from a [`pool::BufferPool`],
//! which is the only place performing raw allocations.
//!
//! The crate does not install a logger: it emits messages through the `log` facade and lets the
//! application decide where they end up.

pub mod config;
pub mod decoder;
pub mod display;
pub mod dma_heap;
pub mod h264;
pub mod memfd;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod stats;
#[cfg(test)]
mod test_utils;

pub use config::PipelineConfig;
pub use pipeline::Pipeline;
pub use pool::BufferPool;
pub use pool::MemoryRegion;
pub use stats::PipelineStatistics;
pub use stats::StatisticsSnapshot;

/// Layout of a single plane within a frame buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Offset of the first byte of the plane from the start of the buffer.
    pub offset: usize,
    /// Number of bytes between two consecutive lines of the plane.
    pub stride: usize,
}

/// Pixel formats that can travel from the decoder to the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PixelFormat {
    /// 4:2:0 luma plane followed by an interleaved CbCr plane.
    Nv12,
    /// 32-bit packed RGB, alpha ignored.
    Xrgb8888,
    /// 32-bit packed RGB with alpha.
    Argb8888,
}

impl PixelFormat {
    /// DRM fourcc code of the format.
    pub fn drm_fourcc(&self) -> u32 {
        match self {
            PixelFormat::Nv12 => fourcc(b"NV12"),
            PixelFormat::Xrgb8888 => fourcc(b"XR24"),
            PixelFormat::Argb8888 => fourcc(b"AR24"),
        }
    }

    pub fn num_planes(&self) -> usize {
        match self {
            PixelFormat::Nv12 => 2,
            PixelFormat::Xrgb8888 | PixelFormat::Argb8888 => 1,
        }
    }
}

/// Builds a little-endian fourcc code as used by both V4L2 and DRM.
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

/// Memory layout of a decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    pub format: PixelFormat,
    /// Width of the frame in pixels.
    pub width: u32,
    /// Height of the frame in pixels.
    pub height: u32,
    /// Layout of each plane, in plane order.
    pub planes: Vec<PlaneLayout>,
    /// Total size of the buffer backing the frame.
    pub size: usize,
}

impl FrameLayout {
    /// Layout of an NV12 frame: `pitch * height` bytes of luma directly followed by
    /// `pitch * height / 2` bytes of interleaved chroma using the same pitch.
    pub fn nv12(width: u32, height: u32, pitch: usize) -> Self {
        let luma_size = pitch * height as usize;
        Self {
            format: PixelFormat::Nv12,
            width,
            height,
            planes: vec![
                PlaneLayout {
                    offset: 0,
                    stride: pitch,
                },
                PlaneLayout {
                    offset: luma_size,
                    stride: pitch,
                },
            ],
            size: luma_size + luma_size / 2,
        }
    }

    /// Layout of a single-plane 32-bit packed frame.
    pub fn packed32(format: PixelFormat, width: u32, height: u32) -> Self {
        let stride = width as usize * 4;
        Self {
            format,
            width,
            height,
            planes: vec![PlaneLayout { offset: 0, stride }],
            size: stride * height as usize,
        }
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed configuration of the pipeline components.
//!
//! Every structure implements `Default` and can be (de)serialized, so the embedding application
//! may load it from whichever format it uses.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::queue::OverflowPolicy;
use crate::PixelFormat;

/// DMA heaps tried in order when opening the buffer pool.
pub const DEFAULT_HEAP_PATHS: [&str; 3] = [
    "/dev/dma_heap/reserved",
    "/dev/dma_heap/linux,cma",
    "/dev/dma_heap/system",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Candidate DMA heap devices, in order of preference.
    pub heap_paths: Vec<PathBuf>,
    /// Maximum number of regions alive at the same time.
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            heap_paths: DEFAULT_HEAP_PATHS.iter().map(PathBuf::from).collect(),
            capacity: 32,
        }
    }
}

/// Granularity of the work submitted to the decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodeMode {
    /// One request per frame, all slices of the frame in a single OUTPUT buffer.
    #[default]
    FrameBased,
    /// One request per slice, the CAPTURE buffer is held until the last slice.
    SliceBased,
}

/// Whether slice data written to the decoder is prefixed with Annex-B start codes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartCode {
    None,
    #[default]
    AnnexB,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// V4L2 video node of the stateless decoder.
    pub video_device: PathBuf,
    /// Media controller node used to allocate requests.
    pub media_device: PathBuf,
    /// Number of OUTPUT (compressed) buffers.
    pub output_buffers: usize,
    /// Number of CAPTURE (decoded frame) buffers.
    pub capture_buffers: usize,
    /// Number of media requests kept in the request pool.
    pub requests: usize,
    /// Size of each OUTPUT staging buffer, i.e. the largest frame or slice accepted.
    pub max_slice_size: usize,
    pub decode_mode: DecodeMode,
    pub start_code: StartCode,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            video_device: PathBuf::from("/dev/video0"),
            media_device: PathBuf::from("/dev/media0"),
            output_buffers: 4,
            capture_buffers: 8,
            requests: 4,
            max_slice_size: 4 << 20,
            decode_mode: DecodeMode::default(),
            start_code: StartCode::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// DRM card node.
    pub card: PathBuf,
    /// Preferred mode size, `None` to use the size of the decoded stream.
    pub mode_size: Option<(u32, u32)>,
    /// Preferred refresh rate in Hz.
    pub refresh: u32,
    /// Format the decoder produces and the plane must accept.
    pub format: PixelFormat,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            card: PathBuf::from("/dev/dri/card0"),
            mode_size: None,
            refresh: 60,
            format: PixelFormat::Nv12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of decoded frames that can wait between the feed and the render thread.
    pub capacity: usize,
    pub policy: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 3,
            policy: OverflowPolicy::DropOldest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pool: PoolConfig,
    pub decoder: DecoderConfig,
    pub display: DisplayConfig,
    pub queue: QueueConfig,
    /// How long `stop` waits for in-flight frames before releasing resources.
    #[serde(with = "duration_ms")]
    pub drain_timeout: Duration,
}

impl PipelineConfig {
    pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool: Default::default(),
            decoder: Default::default(),
            display: Default::default(),
            queue: Default::default(),
            drain_timeout: Self::DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.queue.capacity, 3);
        assert_eq!(config.queue.policy, OverflowPolicy::DropOldest);
        assert_eq!(config.pool.heap_paths.len(), 3);
        assert!(config.pool.heap_paths[1].ends_with("linux,cma"));
        assert_eq!(config.decoder.start_code, StartCode::AnnexB);
        assert_eq!(config.drain_timeout, Duration::from_millis(500));
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Serialize;

/// Monotonic frame counters updated concurrently by the pipeline threads.
#[derive(Debug, Default)]
pub struct PipelineStatistics {
    decoded: AtomicU64,
    presented: AtomicU64,
    dropped: AtomicU64,
    decode_errors: AtomicU64,
    present_errors: AtomicU64,
}

/// Point-in-time copy of [`PipelineStatistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    /// Frames successfully decoded.
    pub decoded: u64,
    /// Frames that reached the screen.
    pub presented: u64,
    /// Decoded frames discarded before reaching the screen.
    pub dropped: u64,
    /// Frames rejected by the parser or the decoder.
    pub decode_errors: u64,
    /// Failed plane updates.
    pub present_errors: u64,
}

impl StatisticsSnapshot {
    /// Decoded frames neither presented nor dropped yet.
    pub fn in_flight(&self) -> u64 {
        self.decoded
            .saturating_sub(self.presented.saturating_add(self.dropped))
    }
}

impl PipelineStatistics {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn record_decoded(&self) {
        self.decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_presented(&self) {
        self.presented.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_present_error(&self) {
        self.present_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            decoded: self.decoded.load(Ordering::Relaxed),
            presented: self.presented.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            present_errors: self.present_errors.load(Ordering::Relaxed),
        }
    }
}

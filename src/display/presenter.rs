// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use crate::config::DisplayConfig;
use crate::decoder::DecodeBuffer;
use crate::pool::RegionState;
use crate::stats::PipelineStatistics;

use super::select_target;
use super::DisplayBuffer;
use super::DisplayDevice;
use super::DisplayError;
use super::Rect;
use super::Target;

/// Shows decoded frames on the plane selected at creation, one per vblank.
///
/// A frame replaced on the plane may still be scanned out until the next vblank, so it only
/// becomes available from [`Presenter::retired_buffers`] after the following call to
/// [`Presenter::wait_vblank`].
pub struct Presenter<D: DisplayDevice + ?Sized> {
    device: Arc<D>,
    target: Target,
    stats: Arc<PipelineStatistics>,
    on_screen: Option<DisplayBuffer>,
    /// Frames removed from the plane since the last vblank.
    retiring: Vec<DisplayBuffer>,
    retired: Vec<DisplayBuffer>,
}

impl<D: DisplayDevice + ?Sized> Presenter<D> {
    /// Select the display path for `config` and set its mode if needed.
    pub fn new(
        device: Arc<D>,
        config: &DisplayConfig,
        stats: Arc<PipelineStatistics>,
    ) -> Result<Self, DisplayError> {
        let resources = device.resources()?;
        let target = select_target(&resources, config)?;
        if target.fallback_mode {
            log::warn!(
                "presenting with fallback mode {}x{}@{}",
                target.mode.width,
                target.mode.height,
                target.mode.refresh
            );
        }
        if target.needs_modeset {
            device.set_mode(&target)?;
        }

        Ok(Self {
            device,
            target,
            stats,
            on_screen: None,
            retiring: Vec::new(),
            retired: Vec::new(),
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Put `frame` on the plane.
    ///
    /// On failure the frame is dropped and the previous one stays on screen.
    pub fn present(&mut self, frame: DisplayBuffer) -> bool {
        let layout = frame.buffer().layout();
        let src = Rect::new(0, 0, layout.width, layout.height);
        let (width, height) = self.target.mode.size();
        let dst = Rect::new(0, 0, width, height).fit(layout.width, layout.height);

        if let Err(e) = self.device.set_plane(&self.target, frame.fb_id(), src, dst) {
            log::warn!(
                "failed to present frame {}: {}",
                frame.buffer().timestamp(),
                e
            );
            self.stats.record_present_error();
            self.stats.record_dropped();
            self.retired.push(frame);
            return false;
        }

        if let Err(e) = frame.buffer().region().transition(RegionState::Presented) {
            log::error!("{}", e);
        }
        log::trace!("presented frame {}", frame.buffer().timestamp());
        self.stats.record_presented();
        if let Some(previous) = self.on_screen.replace(frame) {
            self.retiring.push(previous);
        }

        true
    }

    /// Wait for the next vblank. Frames replaced before it can be reused afterwards.
    pub fn wait_vblank(&mut self) -> Result<(), DisplayError> {
        self.device.wait_vblank(self.target.crtc_index)?;
        self.retired.append(&mut self.retiring);
        Ok(())
    }

    /// Take the buffers not used by the display anymore.
    pub fn retired_buffers(&mut self) -> Vec<DecodeBuffer> {
        self.retired
            .drain(..)
            .map(|frame| frame.discard(&*self.device))
            .collect()
    }

    /// Disable the plane and return every buffer still held.
    pub fn shutdown(&mut self) -> Vec<DecodeBuffer> {
        if let Err(e) = self.device.disable_plane(&self.target) {
            log::error!("failed to disable plane {}: {}", self.target.plane_id, e);
        }

        self.retired.append(&mut self.retiring);
        self.retired.extend(self.on_screen.take());
        self.retired_buffers()
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Display device for tests, with a simulated vblank.

use std::collections::BTreeSet;
use std::time::Duration;

use nix::errno::Errno;
use parking_lot::Mutex;

use super::Connector;
use super::Crtc;
use super::DisplayDevice;
use super::DisplayError;
use super::DisplayResources;
use super::Encoder;
use super::Mode;
use super::ModeTimings;
use super::Plane;
use super::Rect;
use super::Target;
use crate::pool::MemoryRegion;
use crate::FrameLayout;

pub fn dummy_mode(width: u32, height: u32, refresh: u32) -> Mode {
    Mode {
        name: format!("{}x{}", width, height),
        width,
        height,
        refresh,
        preferred: false,
        timings: ModeTimings::default(),
    }
}

/// Resources with one connector, encoder, CRTC and plane, all connected to each other.
pub fn dummy_resources(modes: &[(u32, u32, u32)], plane_formats: &[u32]) -> DisplayResources {
    DisplayResources {
        connectors: vec![Connector {
            id: 30,
            connected: true,
            encoder_id: 40,
            encoders: vec![40],
            modes: modes
                .iter()
                .map(|&(w, h, refresh)| dummy_mode(w, h, refresh))
                .collect(),
        }],
        encoders: vec![Encoder {
            id: 40,
            crtc_id: 50,
            possible_crtcs: 0b1,
        }],
        crtcs: vec![Crtc {
            id: 50,
            index: 0,
            mode: None,
        }],
        planes: vec![Plane {
            id: 60,
            possible_crtcs: 0b1,
            formats: plane_formats.to_vec(),
            fb_id: 0,
        }],
    }
}

#[derive(Default)]
struct DummyDisplayState {
    next_fb_id: u32,
    framebuffers: BTreeSet<u32>,
    /// Framebuffer currently on the plane.
    on_plane: Option<u32>,
    plane_updates: usize,
    failing_updates: usize,
    modesets: usize,
    vblanks: u64,
}

pub struct DummyDisplay {
    resources: DisplayResources,
    vblank_interval: Duration,
    state: Mutex<DummyDisplayState>,
}

impl DummyDisplay {
    pub fn new(resources: DisplayResources, vblank_interval: Duration) -> Self {
        Self {
            resources,
            vblank_interval,
            state: Mutex::new(DummyDisplayState {
                next_fb_id: 100,
                ..Default::default()
            }),
        }
    }

    /// A 1920x1080@60 NV12-capable display.
    pub fn nv12(vblank_interval: Duration) -> Self {
        Self::new(
            dummy_resources(&[(1920, 1080, 60)], &[crate::fourcc(b"NV12")]),
            vblank_interval,
        )
    }

    /// Make the next `count` plane updates fail.
    pub fn fail_plane_updates(&self, count: usize) {
        self.state.lock().failing_updates = count;
    }

    /// Framebuffers created and not removed yet.
    pub fn live_framebuffers(&self) -> Vec<u32> {
        self.state.lock().framebuffers.iter().copied().collect()
    }

    pub fn on_plane(&self) -> Option<u32> {
        self.state.lock().on_plane
    }

    pub fn plane_updates(&self) -> usize {
        self.state.lock().plane_updates
    }

    pub fn modesets(&self) -> usize {
        self.state.lock().modesets
    }

    pub fn vblanks(&self) -> u64 {
        self.state.lock().vblanks
    }
}

impl DisplayDevice for DummyDisplay {
    fn resources(&self) -> Result<DisplayResources, DisplayError> {
        Ok(self.resources.clone())
    }

    fn set_mode(&self, _target: &Target) -> Result<(), DisplayError> {
        self.state.lock().modesets += 1;
        Ok(())
    }

    fn create_framebuffer(
        &self,
        _region: &MemoryRegion,
        layout: &FrameLayout,
    ) -> Result<u32, DisplayError> {
        if layout.width == 0 || layout.height == 0 {
            return Err(DisplayError::InvalidLayout("empty frame".into()));
        }

        let mut state = self.state.lock();
        let fb_id = state.next_fb_id;
        state.next_fb_id += 1;
        state.framebuffers.insert(fb_id);
        Ok(fb_id)
    }

    fn remove_framebuffer(&self, fb_id: u32) {
        let mut state = self.state.lock();
        assert!(
            state.framebuffers.remove(&fb_id),
            "removing unknown framebuffer {}",
            fb_id
        );
        assert_ne!(state.on_plane, Some(fb_id), "removing framebuffer on screen");
    }

    fn set_plane(
        &self,
        _target: &Target,
        fb_id: u32,
        _src: Rect,
        _dst: Rect,
    ) -> Result<(), DisplayError> {
        let mut state = self.state.lock();
        if state.failing_updates > 0 {
            state.failing_updates -= 1;
            return Err(DisplayError::Ioctl("DRM_IOCTL_MODE_SETPLANE", Errno::EINVAL));
        }
        assert!(state.framebuffers.contains(&fb_id));
        state.on_plane = Some(fb_id);
        state.plane_updates += 1;
        Ok(())
    }

    fn wait_vblank(&self, _crtc_index: u32) -> Result<(), DisplayError> {
        std::thread::sleep(self.vblank_interval);
        self.state.lock().vblanks += 1;
        Ok(())
    }

    fn disable_plane(&self, _target: &Target) -> Result<(), DisplayError> {
        self.state.lock().on_plane = None;
        Ok(())
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Scan-out of decoded frames.
//!
//! A [`DisplayDevice`] exposes the mode-setting resources of a display controller and lets
//! decoded buffers be wrapped into framebuffers and shown on a hardware plane. The
//! [`Presenter`] picks a connector, CRTC and plane once with [`select_target`], then shows one
//! frame per vblank.

pub mod drm;
#[cfg(test)]
pub(crate) mod dummy;
mod presenter;

use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

use crate::config::DisplayConfig;
use crate::decoder::DecodeBuffer;
use crate::pool::MemoryRegion;
use crate::pool::RegionState;
use crate::pool::TransitionError;
use crate::FrameLayout;

pub use presenter::Presenter;

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("failed to open display device {0}: {1}")]
    Open(PathBuf, io::Error),
    #[error("no usable display: {0}")]
    NoDisplay(String),
    #[error("no plane of CRTC {crtc} supports format {format:#010x}")]
    NoCompatiblePlane { crtc: u32, format: u32 },
    #[error("{0} failed: {1}")]
    Ioctl(&'static str, Errno),
    #[error("frame layout cannot be scanned out: {0}")]
    InvalidLayout(String),
    #[error("{0}")]
    Transition(#[from] TransitionError),
}

impl DisplayError {
    /// Whether the error means that there is nothing frames could be displayed on.
    pub fn is_no_display(&self) -> bool {
        matches!(
            self,
            DisplayError::NoDisplay(_) | DisplayError::NoCompatiblePlane { .. }
        )
    }
}

/// Timings of a display mode, as reported by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeTimings {
    /// Pixel clock in kHz.
    pub clock: u32,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub flags: u32,
    pub type_: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mode {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Vertical refresh rate in Hz.
    pub refresh: u32,
    /// Whether this is the mode the sink prefers.
    pub preferred: bool,
    pub timings: ModeTimings,
}

impl Mode {
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Whether both modes drive the sink identically. Names and type flags are ignored.
    pub fn same_timings(&self, other: &Mode) -> bool {
        let timings = |m: &Mode| ModeTimings {
            type_: 0,
            ..m.timings
        };
        self.size() == other.size()
            && self.refresh == other.refresh
            && timings(self) == timings(other)
    }
}

/// Bit of the CRTC at `index` in a possible-CRTCs mask.
fn crtc_mask(index: u32) -> u32 {
    1u32.checked_shl(index).unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connector {
    pub id: u32,
    pub connected: bool,
    /// Encoder currently driving the connector, 0 if none.
    pub encoder_id: u32,
    /// Encoders that can drive the connector.
    pub encoders: Vec<u32>,
    pub modes: Vec<Mode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoder {
    pub id: u32,
    /// CRTC currently feeding the encoder, 0 if none.
    pub crtc_id: u32,
    /// Bitmask of the CRTC indices that can feed the encoder.
    pub possible_crtcs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crtc {
    pub id: u32,
    /// Position of the CRTC in the resources list, used by possible-CRTC masks and vblank waits.
    pub index: u32,
    /// Mode currently programmed, if any.
    pub mode: Option<Mode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub id: u32,
    pub possible_crtcs: u32,
    /// Supported DRM fourcc codes.
    pub formats: Vec<u32>,
    /// Framebuffer currently shown by the plane, 0 if idle.
    pub fb_id: u32,
}

/// Snapshot of the mode-setting objects of a display device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayResources {
    pub connectors: Vec<Connector>,
    pub encoders: Vec<Encoder>,
    pub crtcs: Vec<Crtc>,
    pub planes: Vec<Plane>,
}

/// Rectangle in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Largest rectangle of aspect ratio `width:height` centered in `self`.
    pub fn fit(&self, width: u32, height: u32) -> Rect {
        if width == 0 || height == 0 {
            return *self;
        }

        let (w, h) = (self.width as u64, self.height as u64);
        let (fit_w, fit_h) = if w * height as u64 > h * width as u64 {
            ((h * width as u64 / height as u64) as u32, self.height)
        } else {
            (self.width, (w * height as u64 / width as u64) as u32)
        };

        Rect {
            x: self.x + ((self.width - fit_w) / 2) as i32,
            y: self.y + ((self.height - fit_h) / 2) as i32,
            width: fit_w,
            height: fit_h,
        }
    }
}

/// The display path frames are shown on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub connector_id: u32,
    pub crtc_id: u32,
    pub crtc_index: u32,
    pub plane_id: u32,
    pub mode: Mode,
    /// Whether `mode` does not have the requested refresh rate.
    pub fallback_mode: bool,
    /// Whether the CRTC needs to be programmed with `mode` before use.
    pub needs_modeset: bool,
}

/// Choose the mode the connector should be driven with.
///
/// Returns the mode and whether it is a fallback.
fn select_mode<'a>(modes: &'a [Mode], config: &DisplayConfig) -> Option<(&'a Mode, bool)> {
    let preferred = modes.iter().find(|m| m.preferred).or_else(|| modes.first())?;

    let size = match config.mode_size {
        Some(size) if modes.iter().any(|m| m.size() == size) => size,
        Some(size) => {
            log::warn!(
                "no {}x{} mode available, falling back to {}x{}@{}",
                size.0,
                size.1,
                preferred.width,
                preferred.height,
                preferred.refresh
            );
            return Some((preferred, true));
        }
        None => preferred.size(),
    };

    if let Some(mode) = modes
        .iter()
        .find(|m| m.size() == size && m.refresh == config.refresh)
    {
        return Some((mode, false));
    }

    let mode = modes
        .iter()
        .filter(|m| m.size() == size)
        .max_by_key(|m| m.refresh)?;
    log::warn!(
        "no {}x{}@{} mode available, falling back to {}x{}@{}",
        size.0,
        size.1,
        config.refresh,
        mode.width,
        mode.height,
        mode.refresh
    );
    Some((mode, true))
}

/// Pick the connector, mode, CRTC and plane frames will be presented with.
pub fn select_target(
    resources: &DisplayResources,
    config: &DisplayConfig,
) -> Result<Target, DisplayError> {
    let connector = resources
        .connectors
        .iter()
        .find(|c| c.connected && !c.modes.is_empty())
        .ok_or_else(|| DisplayError::NoDisplay("no connected connector".into()))?;

    let (mode, fallback_mode) = select_mode(&connector.modes, config).ok_or_else(|| {
        DisplayError::NoDisplay(format!("no mode available on connector {}", connector.id))
    })?;

    let encoder = resources
        .encoders
        .iter()
        .find(|e| e.id == connector.encoder_id)
        .or_else(|| {
            resources
                .encoders
                .iter()
                .find(|e| connector.encoders.contains(&e.id))
        })
        .ok_or_else(|| {
            DisplayError::NoDisplay(format!("no encoder for connector {}", connector.id))
        })?;

    let crtc = resources
        .crtcs
        .iter()
        .find(|c| c.id == encoder.crtc_id)
        .or_else(|| {
            resources
                .crtcs
                .iter()
                .find(|c| encoder.possible_crtcs & crtc_mask(c.index) != 0)
        })
        .ok_or_else(|| DisplayError::NoDisplay(format!("no CRTC for encoder {}", encoder.id)))?;

    let format = config.format.drm_fourcc();
    let mut candidates = resources
        .planes
        .iter()
        .filter(|p| p.possible_crtcs & crtc_mask(crtc.index) != 0 && p.formats.contains(&format));
    let first = candidates.clone().next();
    let plane = candidates
        .find(|p| p.fb_id == 0)
        .or(first)
        .ok_or(DisplayError::NoCompatiblePlane {
            crtc: crtc.id,
            format,
        })?;

    let target = Target {
        connector_id: connector.id,
        crtc_id: crtc.id,
        crtc_index: crtc.index,
        plane_id: plane.id,
        mode: mode.clone(),
        fallback_mode,
        needs_modeset: !crtc.mode.as_ref().is_some_and(|m| m.same_timings(mode)),
    };
    log::debug!(
        "display target: connector {}, CRTC {}, plane {}, mode {}x{}@{}",
        target.connector_id,
        target.crtc_id,
        target.plane_id,
        target.mode.width,
        target.mode.height,
        target.mode.refresh
    );

    Ok(target)
}

/// A display controller frames can be presented on.
///
/// All methods take `&self` so the device can be shared between the thread importing frames and
/// the thread flipping them.
pub trait DisplayDevice: Send + Sync {
    fn resources(&self) -> Result<DisplayResources, DisplayError>;

    /// Program the CRTC of `target` with its mode and route it to its connector.
    fn set_mode(&self, target: &Target) -> Result<(), DisplayError>;

    /// Wrap `region` into a framebuffer described by `layout`. Returns the framebuffer ID.
    fn create_framebuffer(
        &self,
        region: &MemoryRegion,
        layout: &FrameLayout,
    ) -> Result<u32, DisplayError>;

    /// Release a framebuffer created by `create_framebuffer`. Failures are logged.
    fn remove_framebuffer(&self, fb_id: u32);

    /// Show the `src` part of framebuffer `fb_id` in the `dst` part of the CRTC of `target`.
    fn set_plane(&self, target: &Target, fb_id: u32, src: Rect, dst: Rect)
        -> Result<(), DisplayError>;

    /// Block until the next vblank of the CRTC at `crtc_index`.
    fn wait_vblank(&self, crtc_index: u32) -> Result<(), DisplayError>;

    fn disable_plane(&self, target: &Target) -> Result<(), DisplayError>;
}

/// A decoded frame wrapped into a framebuffer.
#[derive(Debug)]
pub struct DisplayBuffer {
    buffer: DecodeBuffer,
    fb_id: u32,
}

impl DisplayBuffer {
    /// Create a framebuffer for `buffer`. The buffer is given back if that fails.
    pub fn import<D: DisplayDevice + ?Sized>(
        device: &D,
        buffer: DecodeBuffer,
    ) -> Result<Self, (DecodeBuffer, DisplayError)> {
        if let Err(e) = buffer.region().transition(RegionState::ImportedByDisplay) {
            return Err((buffer, e.into()));
        }

        match device.create_framebuffer(buffer.region(), buffer.layout()) {
            Ok(fb_id) => Ok(Self { buffer, fb_id }),
            Err(e) => Err((buffer, e)),
        }
    }

    pub fn fb_id(&self) -> u32 {
        self.fb_id
    }

    pub fn buffer(&self) -> &DecodeBuffer {
        &self.buffer
    }

    /// Remove the framebuffer and return the decoded buffer it wrapped.
    pub fn discard<D: DisplayDevice + ?Sized>(self, device: &D) -> DecodeBuffer {
        device.remove_framebuffer(self.fb_id);
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::dummy::*;
    use super::*;
    use crate::fourcc;
    use crate::PixelFormat;

    fn config(refresh: u32) -> DisplayConfig {
        DisplayConfig {
            mode_size: Some((1920, 1080)),
            refresh,
            ..Default::default()
        }
    }

    #[test]
    fn exact_mode_is_preferred() {
        let resources = dummy_resources(
            &[(1920, 1080, 30), (1920, 1080, 60), (1280, 720, 60)],
            &[fourcc(b"NV12")],
        );

        let target = select_target(&resources, &config(60)).unwrap();
        assert_eq!(target.mode.size(), (1920, 1080));
        assert_eq!(target.mode.refresh, 60);
        assert!(!target.fallback_mode);
    }

    #[test]
    fn refresh_fallback_is_reported() {
        let resources = dummy_resources(&[(1920, 1080, 30), (1280, 720, 60)], &[fourcc(b"NV12")]);

        let target = select_target(&resources, &config(60)).unwrap();
        assert_eq!(target.mode.size(), (1920, 1080));
        assert_eq!(target.mode.refresh, 30);
        assert!(target.fallback_mode);
    }

    #[test]
    fn preferred_mode_without_size() {
        let mut resources = dummy_resources(&[(1280, 720, 60), (1920, 1080, 60)], &[fourcc(b"NV12")]);
        resources.connectors[0].modes[1].preferred = true;

        let target = select_target(&resources, &DisplayConfig::default()).unwrap();
        assert_eq!(target.mode.size(), (1920, 1080));
        assert!(!target.fallback_mode);
        assert!(target.needs_modeset);
    }

    #[test]
    fn nv12_on_rgb_only_planes() {
        let resources = dummy_resources(
            &[(1920, 1080, 60)],
            &[fourcc(b"XR24"), fourcc(b"AR24")],
        );

        let e = select_target(&resources, &config(60)).unwrap_err();
        assert!(matches!(e, DisplayError::NoCompatiblePlane { .. }));
        assert!(e.is_no_display());

        let rgb = DisplayConfig {
            format: PixelFormat::Xrgb8888,
            ..config(60)
        };
        assert!(select_target(&resources, &rgb).is_ok());
    }

    #[test]
    fn no_connected_connector() {
        let mut resources = dummy_resources(&[(1920, 1080, 60)], &[fourcc(b"NV12")]);
        resources.connectors[0].connected = false;

        let e = select_target(&resources, &config(60)).unwrap_err();
        assert!(matches!(e, DisplayError::NoDisplay(_)));
    }

    #[test]
    fn idle_plane_and_possible_crtcs() {
        let mut resources = dummy_resources(&[(1920, 1080, 60)], &[fourcc(b"NV12")]);
        // The encoder is not driving anything yet but can use the second CRTC only.
        resources.encoders[0].crtc_id = 0;
        resources.encoders[0].possible_crtcs = 0b10;
        resources.crtcs.push(Crtc {
            id: 51,
            index: 1,
            mode: None,
        });
        resources.planes = vec![
            Plane {
                id: 60,
                possible_crtcs: 0b01,
                formats: vec![fourcc(b"NV12")],
                fb_id: 0,
            },
            Plane {
                id: 61,
                possible_crtcs: 0b10,
                formats: vec![fourcc(b"NV12")],
                fb_id: 7,
            },
            Plane {
                id: 62,
                possible_crtcs: 0b11,
                formats: vec![fourcc(b"NV12")],
                fb_id: 0,
            },
        ];

        let target = select_target(&resources, &config(60)).unwrap();
        assert_eq!(target.crtc_id, 51);
        assert_eq!(target.crtc_index, 1);
        assert_eq!(target.plane_id, 62);
    }

    #[test]
    fn running_mode_is_kept() {
        let mut resources = dummy_resources(&[(1920, 1080, 60)], &[fourcc(b"NV12")]);
        let mut current = resources.connectors[0].modes[0].clone();
        current.name = "1920x1080i".into();
        current.preferred = true;
        current.timings.type_ = 1 << 3;
        resources.crtcs[0].mode = Some(current.clone());

        assert!(!select_target(&resources, &config(60)).unwrap().needs_modeset);

        current.timings.clock += 1;
        resources.crtcs[0].mode = Some(current);
        assert!(select_target(&resources, &config(60)).unwrap().needs_modeset);
    }

    #[test]
    fn out_of_range_crtc_index() {
        let mut resources = dummy_resources(&[(1920, 1080, 60)], &[fourcc(b"NV12")]);
        resources.encoders[0].crtc_id = 0;
        resources.encoders[0].possible_crtcs = u32::MAX;
        resources.crtcs[0].index = 40;

        let e = select_target(&resources, &config(60)).unwrap_err();
        assert!(matches!(e, DisplayError::NoDisplay(_)));
    }

    #[test]
    fn fit_rect() {
        let screen = Rect::new(0, 0, 1920, 1080);
        assert_eq!(screen.fit(1920, 1080), screen);
        assert_eq!(screen.fit(640, 480), Rect::new(240, 0, 1440, 1080));
        assert_eq!(
            Rect::new(0, 0, 1080, 1920).fit(1920, 1080),
            Rect::new(0, 656, 1080, 607)
        );
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! [`DisplayDevice`] over the legacy DRM mode-setting ioctls.

use std::collections::BTreeSet;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::path::Path;

use nix::errno::Errno;
use parking_lot::Mutex;
use zerocopy::FromZeroes;

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
use crate::PixelFormat;

const DRM_CLIENT_CAP_UNIVERSAL_PLANES: u64 = 2;
const DRM_MODE_CONNECTED: u32 = 1;
const DRM_MODE_TYPE_PREFERRED: u32 = 1 << 3;
const DRM_DISPLAY_MODE_LEN: usize = 32;

const DRM_VBLANK_RELATIVE: u32 = 0x0000_0001;
const DRM_VBLANK_SECONDARY: u32 = 0x2000_0000;
const DRM_VBLANK_HIGH_CRTC_SHIFT: u32 = 1;
const DRM_VBLANK_HIGH_CRTC_MASK: u32 = 0x0000_003e;

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, FromZeroes)]
struct DrmModeInfo {
    clock: u32,
    hdisplay: u16,
    hsync_start: u16,
    hsync_end: u16,
    htotal: u16,
    hskew: u16,
    vdisplay: u16,
    vsync_start: u16,
    vsync_end: u16,
    vtotal: u16,
    vscan: u16,
    vrefresh: u32,
    flags: u32,
    type_: u32,
    name: [u8; DRM_DISPLAY_MODE_LEN],
}

impl From<&DrmModeInfo> for Mode {
    fn from(info: &DrmModeInfo) -> Self {
        let name_len = info
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(DRM_DISPLAY_MODE_LEN);
        let refresh = if info.vrefresh != 0 {
            info.vrefresh
        } else if info.htotal != 0 && info.vtotal != 0 {
            // `clock` is in kHz.
            ((info.clock as u64 * 1000) / (info.htotal as u64 * info.vtotal as u64)) as u32
        } else {
            0
        };

        Mode {
            name: String::from_utf8_lossy(&info.name[..name_len]).into_owned(),
            width: info.hdisplay as u32,
            height: info.vdisplay as u32,
            refresh,
            preferred: info.type_ & DRM_MODE_TYPE_PREFERRED != 0,
            timings: ModeTimings {
                clock: info.clock,
                hsync_start: info.hsync_start,
                hsync_end: info.hsync_end,
                htotal: info.htotal,
                hskew: info.hskew,
                vsync_start: info.vsync_start,
                vsync_end: info.vsync_end,
                vtotal: info.vtotal,
                vscan: info.vscan,
                flags: info.flags,
                type_: info.type_,
            },
        }
    }
}

impl From<&Mode> for DrmModeInfo {
    fn from(mode: &Mode) -> Self {
        let t = &mode.timings;
        let mut info = DrmModeInfo {
            clock: t.clock,
            hdisplay: mode.width as u16,
            hsync_start: t.hsync_start,
            hsync_end: t.hsync_end,
            htotal: t.htotal,
            hskew: t.hskew,
            vdisplay: mode.height as u16,
            vsync_start: t.vsync_start,
            vsync_end: t.vsync_end,
            vtotal: t.vtotal,
            vscan: t.vscan,
            vrefresh: mode.refresh,
            flags: t.flags,
            type_: t.type_,
            name: [0; DRM_DISPLAY_MODE_LEN],
        };
        let name = mode.name.as_bytes();
        let len = name.len().min(DRM_DISPLAY_MODE_LEN - 1);
        info.name[..len].copy_from_slice(&name[..len]);
        info
    }
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, FromZeroes)]
struct DrmModeCardRes {
    fb_id_ptr: u64,
    crtc_id_ptr: u64,
    connector_id_ptr: u64,
    encoder_id_ptr: u64,
    count_fbs: u32,
    count_crtcs: u32,
    count_connectors: u32,
    count_encoders: u32,
    min_width: u32,
    max_width: u32,
    min_height: u32,
    max_height: u32,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, FromZeroes)]
struct DrmModeCrtc {
    set_connectors_ptr: u64,
    count_connectors: u32,
    crtc_id: u32,
    fb_id: u32,
    x: u32,
    y: u32,
    gamma_size: u32,
    mode_valid: u32,
    mode: DrmModeInfo,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, FromZeroes)]
struct DrmModeGetEncoder {
    encoder_id: u32,
    encoder_type: u32,
    crtc_id: u32,
    possible_crtcs: u32,
    possible_clones: u32,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, FromZeroes)]
struct DrmModeGetConnector {
    encoders_ptr: u64,
    modes_ptr: u64,
    props_ptr: u64,
    prop_values_ptr: u64,
    count_modes: u32,
    count_props: u32,
    count_encoders: u32,
    encoder_id: u32,
    connector_id: u32,
    connector_type: u32,
    connector_type_id: u32,
    connection: u32,
    mm_width: u32,
    mm_height: u32,
    subpixel: u32,
    pad: u32,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, FromZeroes)]
struct DrmModeGetPlaneRes {
    plane_id_ptr: u64,
    count_planes: u32,
    pad: u32,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, FromZeroes)]
struct DrmModeGetPlane {
    plane_id: u32,
    crtc_id: u32,
    fb_id: u32,
    possible_crtcs: u32,
    gamma_size: u32,
    count_format_types: u32,
    format_type_ptr: u64,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, FromZeroes)]
struct DrmModeSetPlane {
    plane_id: u32,
    crtc_id: u32,
    fb_id: u32,
    flags: u32,
    crtc_x: i32,
    crtc_y: i32,
    crtc_w: u32,
    crtc_h: u32,
    // Source coordinates are 16.16 fixed point.
    src_x: u32,
    src_y: u32,
    src_h: u32,
    src_w: u32,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, FromZeroes)]
struct DrmModeFbCmd2 {
    fb_id: u32,
    width: u32,
    height: u32,
    pixel_format: u32,
    flags: u32,
    handles: [u32; 4],
    pitches: [u32; 4],
    offsets: [u32; 4],
    modifier: [u64; 4],
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, FromZeroes)]
struct DrmModeCreateDumb {
    height: u32,
    width: u32,
    bpp: u32,
    flags: u32,
    handle: u32,
    pitch: u32,
    size: u64,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, FromZeroes)]
struct DrmModeDestroyDumb {
    handle: u32,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, FromZeroes)]
struct DrmPrimeHandle {
    handle: u32,
    flags: u32,
    fd: i32,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, FromZeroes)]
struct DrmGemClose {
    handle: u32,
    pad: u32,
}

/// `union drm_wait_vblank`: the request's `signal` overlaps the reply's `tval_sec`.
#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, FromZeroes)]
struct DrmWaitVblank {
    type_: u32,
    sequence: u32,
    tval_sec: libc::c_long,
    tval_usec: libc::c_long,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, FromZeroes)]
struct DrmSetClientCap {
    capability: u64,
    value: u64,
}

nix::ioctl_write_ptr!(drm_ioctl_gem_close, b'd', 0x09, DrmGemClose);
nix::ioctl_write_ptr!(drm_ioctl_set_client_cap, b'd', 0x0d, DrmSetClientCap);
nix::ioctl_readwrite!(drm_ioctl_prime_fd_to_handle, b'd', 0x2e, DrmPrimeHandle);
nix::ioctl_readwrite!(drm_ioctl_wait_vblank, b'd', 0x3a, DrmWaitVblank);
nix::ioctl_readwrite!(drm_ioctl_mode_getresources, b'd', 0xa0, DrmModeCardRes);
nix::ioctl_readwrite!(drm_ioctl_mode_getcrtc, b'd', 0xa1, DrmModeCrtc);
nix::ioctl_readwrite!(drm_ioctl_mode_setcrtc, b'd', 0xa2, DrmModeCrtc);
nix::ioctl_readwrite!(drm_ioctl_mode_getencoder, b'd', 0xa6, DrmModeGetEncoder);
nix::ioctl_readwrite!(drm_ioctl_mode_getconnector, b'd', 0xa7, DrmModeGetConnector);
nix::ioctl_readwrite!(drm_ioctl_mode_rmfb, b'd', 0xaf, libc::c_uint);
nix::ioctl_readwrite!(drm_ioctl_mode_create_dumb, b'd', 0xb2, DrmModeCreateDumb);
nix::ioctl_readwrite!(drm_ioctl_mode_destroy_dumb, b'd', 0xb4, DrmModeDestroyDumb);
nix::ioctl_readwrite!(drm_ioctl_mode_getplaneresources, b'd', 0xb5, DrmModeGetPlaneRes);
nix::ioctl_readwrite!(drm_ioctl_mode_getplane, b'd', 0xb6, DrmModeGetPlane);
nix::ioctl_readwrite!(drm_ioctl_mode_setplane, b'd', 0xb7, DrmModeSetPlane);
nix::ioctl_readwrite!(drm_ioctl_mode_addfb2, b'd', 0xb8, DrmModeFbCmd2);

fn ptr_of<T>(v: &mut [T]) -> u64 {
    v.as_mut_ptr() as u64
}

/// `type` field of a vblank wait on the CRTC at `crtc_index`.
fn vblank_type(crtc_index: u32) -> u32 {
    let crtc = match crtc_index {
        0 => 0,
        1 => DRM_VBLANK_SECONDARY,
        i => (i << DRM_VBLANK_HIGH_CRTC_SHIFT) & DRM_VBLANK_HIGH_CRTC_MASK,
    };
    DRM_VBLANK_RELATIVE | crtc
}

/// Black framebuffer used to light up a CRTC before frames are shown on a plane.
struct Scanout {
    handle: u32,
    fb_id: u32,
}

/// A DRM card opened for mode setting.
///
/// Every framebuffer created through this device is tracked and removed when it is dropped,
/// before the card is closed.
pub struct DrmDevice {
    file: File,
    framebuffers: Mutex<BTreeSet<u32>>,
    scanout: Mutex<Option<Scanout>>,
}

impl DrmDevice {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DisplayError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| DisplayError::Open(path.to_path_buf(), e))?;

        let device = Self {
            file,
            framebuffers: Default::default(),
            scanout: Default::default(),
        };

        let cap = DrmSetClientCap {
            capability: DRM_CLIENT_CAP_UNIVERSAL_PLANES,
            value: 1,
        };
        // SAFETY: `cap` is a valid `drm_set_client_cap`.
        unsafe { drm_ioctl_set_client_cap(device.fd(), &cap) }
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_SET_CLIENT_CAP", e))?;

        log::debug!("opened DRM device {}", path.display());
        Ok(device)
    }

    fn fd(&self) -> libc::c_int {
        self.file.as_raw_fd()
    }

    fn get_crtc(&self, id: u32, index: u32) -> Result<Crtc, DisplayError> {
        let mut crtc = DrmModeCrtc::new_zeroed();
        crtc.crtc_id = id;
        // SAFETY: `crtc` is a valid `drm_mode_crtc` with no connector array.
        unsafe { drm_ioctl_mode_getcrtc(self.fd(), &mut crtc) }
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_GETCRTC", e))?;

        Ok(Crtc {
            id,
            index,
            mode: (crtc.mode_valid != 0).then(|| Mode::from(&crtc.mode)),
        })
    }

    fn get_encoder(&self, id: u32) -> Result<Encoder, DisplayError> {
        let mut encoder = DrmModeGetEncoder::new_zeroed();
        encoder.encoder_id = id;
        // SAFETY: `encoder` is a valid `drm_mode_get_encoder`.
        unsafe { drm_ioctl_mode_getencoder(self.fd(), &mut encoder) }
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_GETENCODER", e))?;

        Ok(Encoder {
            id,
            crtc_id: encoder.crtc_id,
            possible_crtcs: encoder.possible_crtcs,
        })
    }

    fn get_connector(&self, id: u32) -> Result<Connector, DisplayError> {
        let mut conn = DrmModeGetConnector::new_zeroed();
        conn.connector_id = id;
        // First call to learn the array sizes.
        // SAFETY: `conn` is a valid `drm_mode_get_connector` with no arrays.
        unsafe { drm_ioctl_mode_getconnector(self.fd(), &mut conn) }
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_GETCONNECTOR", e))?;

        let mut modes = vec![DrmModeInfo::new_zeroed(); conn.count_modes as usize];
        let mut encoders = vec![0u32; conn.count_encoders as usize];
        conn.modes_ptr = ptr_of(&mut modes);
        conn.encoders_ptr = ptr_of(&mut encoders);
        conn.count_props = 0;
        // SAFETY: the arrays are as large as the counts passed to the kernel.
        unsafe { drm_ioctl_mode_getconnector(self.fd(), &mut conn) }
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_GETCONNECTOR", e))?;
        // Counts may have shrunk if the connector changed in between.
        modes.truncate(conn.count_modes as usize);
        encoders.truncate(conn.count_encoders as usize);

        Ok(Connector {
            id,
            connected: conn.connection == DRM_MODE_CONNECTED,
            encoder_id: conn.encoder_id,
            encoders,
            modes: modes.iter().map(Mode::from).collect(),
        })
    }

    fn get_plane(&self, id: u32) -> Result<Plane, DisplayError> {
        let mut plane = DrmModeGetPlane::new_zeroed();
        plane.plane_id = id;
        // SAFETY: `plane` is a valid `drm_mode_get_plane` with no format array.
        unsafe { drm_ioctl_mode_getplane(self.fd(), &mut plane) }
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_GETPLANE", e))?;

        let mut formats = vec![0u32; plane.count_format_types as usize];
        plane.format_type_ptr = ptr_of(&mut formats);
        // SAFETY: `formats` is as large as the count passed to the kernel.
        unsafe { drm_ioctl_mode_getplane(self.fd(), &mut plane) }
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_GETPLANE", e))?;
        formats.truncate(plane.count_format_types as usize);

        Ok(Plane {
            id,
            possible_crtcs: plane.possible_crtcs,
            formats,
            fb_id: plane.fb_id,
        })
    }

    fn add_framebuffer(&self, fb: &mut DrmModeFbCmd2) -> Result<u32, DisplayError> {
        // SAFETY: `fb` is a valid `drm_mode_fb_cmd2`.
        unsafe { drm_ioctl_mode_addfb2(self.fd(), fb) }
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_ADDFB2", e))?;
        self.framebuffers.lock().insert(fb.fb_id);
        Ok(fb.fb_id)
    }

    fn gem_close(&self, handle: u32) {
        let close = DrmGemClose { handle, pad: 0 };
        // SAFETY: `close` is a valid `drm_gem_close`.
        if let Err(e) = unsafe { drm_ioctl_gem_close(self.fd(), &close) } {
            log::error!("failed to close GEM handle {}: {}", handle, e);
        }
    }

    fn rmfb(&self, fb_id: u32) -> Result<(), Errno> {
        let mut id = fb_id;
        // SAFETY: `id` is a valid framebuffer ID argument.
        unsafe { drm_ioctl_mode_rmfb(self.fd(), &mut id) }.map(|_| ())
    }

    fn destroy_scanout(&self, scanout: Scanout) {
        self.remove_framebuffer(scanout.fb_id);
        let mut destroy = DrmModeDestroyDumb {
            handle: scanout.handle,
        };
        // SAFETY: `destroy` is a valid `drm_mode_destroy_dumb`.
        if let Err(e) = unsafe { drm_ioctl_mode_destroy_dumb(self.fd(), &mut destroy) } {
            log::error!("failed to destroy dumb buffer {}: {}", scanout.handle, e);
        }
    }

    /// Allocate a black XRGB8888 buffer of `width`x`height` and wrap it into a framebuffer.
    fn create_scanout(&self, width: u32, height: u32) -> Result<Scanout, DisplayError> {
        let mut create = DrmModeCreateDumb::new_zeroed();
        create.width = width;
        create.height = height;
        create.bpp = 32;
        // SAFETY: `create` is a valid `drm_mode_create_dumb`.
        unsafe { drm_ioctl_mode_create_dumb(self.fd(), &mut create) }
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_CREATE_DUMB", e))?;

        let mut fb = DrmModeFbCmd2::new_zeroed();
        fb.width = width;
        fb.height = height;
        fb.pixel_format = PixelFormat::Xrgb8888.drm_fourcc();
        fb.handles[0] = create.handle;
        fb.pitches[0] = create.pitch;
        match self.add_framebuffer(&mut fb) {
            Ok(fb_id) => Ok(Scanout {
                handle: create.handle,
                fb_id,
            }),
            Err(e) => {
                let mut destroy = DrmModeDestroyDumb {
                    handle: create.handle,
                };
                // SAFETY: `destroy` is a valid `drm_mode_destroy_dumb`.
                let _ = unsafe { drm_ioctl_mode_destroy_dumb(self.fd(), &mut destroy) };
                Err(e)
            }
        }
    }
}

impl DisplayDevice for DrmDevice {
    fn resources(&self) -> Result<DisplayResources, DisplayError> {
        let mut res = DrmModeCardRes::new_zeroed();
        // SAFETY: `res` is a valid `drm_mode_card_res` with no arrays.
        unsafe { drm_ioctl_mode_getresources(self.fd(), &mut res) }
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_GETRESOURCES", e))?;

        let mut crtc_ids = vec![0u32; res.count_crtcs as usize];
        let mut connector_ids = vec![0u32; res.count_connectors as usize];
        let mut encoder_ids = vec![0u32; res.count_encoders as usize];
        res.count_fbs = 0;
        res.crtc_id_ptr = ptr_of(&mut crtc_ids);
        res.connector_id_ptr = ptr_of(&mut connector_ids);
        res.encoder_id_ptr = ptr_of(&mut encoder_ids);
        // SAFETY: the arrays are as large as the counts passed to the kernel.
        unsafe { drm_ioctl_mode_getresources(self.fd(), &mut res) }
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_GETRESOURCES", e))?;
        crtc_ids.truncate(res.count_crtcs as usize);
        connector_ids.truncate(res.count_connectors as usize);
        encoder_ids.truncate(res.count_encoders as usize);

        let mut plane_res = DrmModeGetPlaneRes::new_zeroed();
        // SAFETY: `plane_res` is a valid `drm_mode_get_plane_res` with no array.
        unsafe { drm_ioctl_mode_getplaneresources(self.fd(), &mut plane_res) }
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_GETPLANERESOURCES", e))?;
        let mut plane_ids = vec![0u32; plane_res.count_planes as usize];
        plane_res.plane_id_ptr = ptr_of(&mut plane_ids);
        // SAFETY: `plane_ids` is as large as the count passed to the kernel.
        unsafe { drm_ioctl_mode_getplaneresources(self.fd(), &mut plane_res) }
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_GETPLANERESOURCES", e))?;
        plane_ids.truncate(plane_res.count_planes as usize);

        Ok(DisplayResources {
            connectors: connector_ids
                .into_iter()
                .map(|id| self.get_connector(id))
                .collect::<Result<_, _>>()?,
            encoders: encoder_ids
                .into_iter()
                .map(|id| self.get_encoder(id))
                .collect::<Result<_, _>>()?,
            crtcs: crtc_ids
                .into_iter()
                .enumerate()
                .map(|(index, id)| self.get_crtc(id, index as u32))
                .collect::<Result<_, _>>()?,
            planes: plane_ids
                .into_iter()
                .map(|id| self.get_plane(id))
                .collect::<Result<_, _>>()?,
        })
    }

    fn set_mode(&self, target: &Target) -> Result<(), DisplayError> {
        let scanout = self.create_scanout(target.mode.width, target.mode.height)?;

        let mut connectors = [target.connector_id];
        let mut crtc = DrmModeCrtc::new_zeroed();
        crtc.set_connectors_ptr = ptr_of(&mut connectors);
        crtc.count_connectors = 1;
        crtc.crtc_id = target.crtc_id;
        crtc.fb_id = scanout.fb_id;
        crtc.mode_valid = 1;
        crtc.mode = DrmModeInfo::from(&target.mode);

        // SAFETY: `crtc` is a valid `drm_mode_crtc` and `connectors` outlives the call.
        if let Err(e) = unsafe { drm_ioctl_mode_setcrtc(self.fd(), &mut crtc) } {
            self.destroy_scanout(scanout);
            return Err(DisplayError::Ioctl("DRM_IOCTL_MODE_SETCRTC", e));
        }

        log::info!(
            "set mode {} ({}x{}@{}) on CRTC {}",
            target.mode.name,
            target.mode.width,
            target.mode.height,
            target.mode.refresh,
            target.crtc_id
        );
        if let Some(previous) = self.scanout.lock().replace(scanout) {
            self.destroy_scanout(previous);
        }

        Ok(())
    }

    fn create_framebuffer(
        &self,
        region: &MemoryRegion,
        layout: &FrameLayout,
    ) -> Result<u32, DisplayError> {
        if layout.planes.len() != layout.format.num_planes() || layout.planes.len() > 4 {
            return Err(DisplayError::InvalidLayout(format!(
                "{} planes for format {:?}",
                layout.planes.len(),
                layout.format
            )));
        }
        if layout.size > region.len() {
            return Err(DisplayError::InvalidLayout(format!(
                "frame of {} bytes in a region of {} bytes",
                layout.size,
                region.len()
            )));
        }

        let mut prime = DrmPrimeHandle::new_zeroed();
        prime.fd = region.as_fd().as_raw_fd();
        // SAFETY: `prime` is a valid `drm_prime_handle`.
        unsafe { drm_ioctl_prime_fd_to_handle(self.fd(), &mut prime) }
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_PRIME_FD_TO_HANDLE", e))?;

        let mut fb = DrmModeFbCmd2::new_zeroed();
        fb.width = layout.width;
        fb.height = layout.height;
        fb.pixel_format = layout.format.drm_fourcc();
        for (i, plane) in layout.planes.iter().enumerate() {
            fb.handles[i] = prime.handle;
            fb.pitches[i] = plane.stride as u32;
            fb.offsets[i] = plane.offset as u32;
        }
        let res = self.add_framebuffer(&mut fb);
        // The framebuffer holds its own reference to the buffer object.
        self.gem_close(prime.handle);

        let fb_id = res?;
        log::trace!("created framebuffer {} for region {}", fb_id, region.id());
        Ok(fb_id)
    }

    fn remove_framebuffer(&self, fb_id: u32) {
        if !self.framebuffers.lock().remove(&fb_id) {
            log::warn!("removing unknown framebuffer {}", fb_id);
            return;
        }
        if let Err(e) = self.rmfb(fb_id) {
            log::error!("failed to remove framebuffer {}: {}", fb_id, e);
        }
    }

    fn set_plane(
        &self,
        target: &Target,
        fb_id: u32,
        src: Rect,
        dst: Rect,
    ) -> Result<(), DisplayError> {
        let mut plane = DrmModeSetPlane {
            plane_id: target.plane_id,
            crtc_id: target.crtc_id,
            fb_id,
            flags: 0,
            crtc_x: dst.x,
            crtc_y: dst.y,
            crtc_w: dst.width,
            crtc_h: dst.height,
            src_x: (src.x as u32) << 16,
            src_y: (src.y as u32) << 16,
            src_h: src.height << 16,
            src_w: src.width << 16,
        };
        // SAFETY: `plane` is a valid `drm_mode_set_plane`.
        unsafe { drm_ioctl_mode_setplane(self.fd(), &mut plane) }
            .map(|_| ())
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_SETPLANE", e))
    }

    fn wait_vblank(&self, crtc_index: u32) -> Result<(), DisplayError> {
        let mut vbl = DrmWaitVblank::new_zeroed();
        vbl.type_ = vblank_type(crtc_index);
        vbl.sequence = 1;
        loop {
            // SAFETY: `vbl` is a valid `drm_wait_vblank`.
            match unsafe { drm_ioctl_wait_vblank(self.fd(), &mut vbl) } {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => {
                    // The kernel may have rewritten the request as absolute.
                    vbl.type_ = vblank_type(crtc_index);
                    vbl.sequence = 1;
                }
                Err(e) => return Err(DisplayError::Ioctl("DRM_IOCTL_WAIT_VBLANK", e)),
            }
        }
    }

    fn disable_plane(&self, target: &Target) -> Result<(), DisplayError> {
        let mut plane = DrmModeSetPlane::new_zeroed();
        plane.plane_id = target.plane_id;
        // SAFETY: `plane` is a valid `drm_mode_set_plane`.
        unsafe { drm_ioctl_mode_setplane(self.fd(), &mut plane) }
            .map(|_| ())
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_SETPLANE", e))
    }
}

impl Drop for DrmDevice {
    fn drop(&mut self) {
        if let Some(scanout) = self.scanout.get_mut().take() {
            self.destroy_scanout(scanout);
        }

        let framebuffers = std::mem::take(self.framebuffers.get_mut());
        if !framebuffers.is_empty() {
            log::debug!("removing {} leftover framebuffers", framebuffers.len());
        }
        for fb_id in framebuffers {
            if let Err(e) = self.rmfb(fb_id) {
                log::error!("failed to remove framebuffer {}: {}", fb_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::*;

    #[test]
    fn uapi_struct_sizes() {
        assert_eq!(size_of::<DrmModeInfo>(), 68);
        assert_eq!(size_of::<DrmModeCardRes>(), 64);
        assert_eq!(size_of::<DrmModeCrtc>(), 104);
        assert_eq!(size_of::<DrmModeGetConnector>(), 80);
        assert_eq!(size_of::<DrmModeGetPlaneRes>(), 16);
        assert_eq!(size_of::<DrmModeGetPlane>(), 32);
        assert_eq!(size_of::<DrmModeSetPlane>(), 48);
        assert_eq!(size_of::<DrmModeFbCmd2>(), 104);
        assert_eq!(size_of::<DrmModeCreateDumb>(), 32);
        if cfg!(target_pointer_width = "64") {
            assert_eq!(size_of::<DrmWaitVblank>(), 24);
        }
    }

    #[test]
    fn mode_info_conversion() {
        let mut info = DrmModeInfo::new_zeroed();
        info.clock = 148_500;
        info.hdisplay = 1920;
        info.htotal = 2200;
        info.vdisplay = 1080;
        info.vtotal = 1125;
        info.type_ = DRM_MODE_TYPE_PREFERRED;
        info.name[..9].copy_from_slice(b"1920x1080");

        // No vrefresh reported, derived from the timings.
        let mode = Mode::from(&info);
        assert_eq!(mode.name, "1920x1080");
        assert_eq!(mode.size(), (1920, 1080));
        assert_eq!(mode.refresh, 60);
        assert!(mode.preferred);

        let back = DrmModeInfo::from(&mode);
        assert_eq!(back.htotal, 2200);
        assert_eq!(back.vrefresh, 60);
        assert_eq!(&back.name[..10], b"1920x1080\0");
    }

    #[test]
    fn vblank_crtc_selection() {
        assert_eq!(vblank_type(0), DRM_VBLANK_RELATIVE);
        assert_eq!(vblank_type(1), DRM_VBLANK_RELATIVE | DRM_VBLANK_SECONDARY);
        assert_eq!(vblank_type(2), DRM_VBLANK_RELATIVE | (2 << 1));
    }

    #[test]
    fn missing_card() {
        let dir = tempfile::tempdir().unwrap();
        let e = DrmDevice::open(dir.path().join("card0")).err().unwrap();
        assert!(matches!(e, DisplayError::Open(..)));
    }
}

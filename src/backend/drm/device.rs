//! Kernel modesetting access and the static device catalogue
//!
//! [`KmsDevice`] is the narrow set of ioctls the planner issues. [`DrmDeviceFd`]
//! implements it on top of `drm-rs`; tests substitute a recording mock.
//! [`DrmDevice`] holds everything probed once at startup: planes with their
//! formats and zpos ranges, crtcs and connectors with their property tables.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::rc::Rc;

use drm::buffer::{self, PlanarBuffer};
use drm::control::{
    atomic::AtomicModeReq, connector, crtc, dumbbuffer::DumbBuffer, framebuffer, plane, property,
    AtomicCommitFlags, Device as ControlDevice, FbCmd2Flags, PlaneType, RawResourceHandle, ResourceHandle,
};
use drm::{ClientCapability, Device as BasicDevice, DriverCapability};
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{debug, info, info_span, trace, warn};

use super::error::{AccessError, Error};
use super::props::{
    in_formats_or_legacy, query_props, ConnectorProp, CrtcProp, ObjectProps, PlaneProp, PlaneTypeTag,
};
use crate::backend::allocator::format::{get_bpp, FormatSet};
use crate::utils::{Physical, Size};

/// Description of the memory backing a framebuffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferDesc {
    /// Width and height in pixels
    pub size: (u32, u32),
    /// Pixel format
    pub format: DrmFourcc,
    /// Layout modifier, `Invalid` if unknown
    pub modifier: DrmModifier,
    /// GEM handles per plane
    pub handles: [Option<buffer::Handle>; 4],
    /// Bytes per row per plane
    pub pitches: [u32; 4],
    /// Offsets per plane
    pub offsets: [u32; 4],
}

impl FramebufferDesc {
    /// Number of memory planes
    pub fn plane_count(&self) -> usize {
        self.handles.iter().take_while(|h| h.is_some()).count()
    }
}

struct PlanarDesc<'a> {
    desc: &'a FramebufferDesc,
    with_modifiers: bool,
}

impl PlanarBuffer for PlanarDesc<'_> {
    fn size(&self) -> (u32, u32) {
        self.desc.size
    }

    fn format(&self) -> DrmFourcc {
        self.desc.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        self.with_modifiers.then_some(self.desc.modifier)
    }

    fn pitches(&self) -> [u32; 4] {
        self.desc.pitches
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        self.desc.handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.desc.offsets
    }
}

struct LegacyDesc<'a> {
    desc: &'a FramebufferDesc,
    handle: buffer::Handle,
}

impl buffer::Buffer for LegacyDesc<'_> {
    fn size(&self) -> (u32, u32) {
        self.desc.size
    }

    fn format(&self) -> DrmFourcc {
        self.desc.format
    }

    fn pitch(&self) -> u32 {
        self.desc.pitches[0]
    }

    fn handle(&self) -> buffer::Handle {
        self.handle
    }
}

/// An atomic request under construction
///
/// Kept as a plain list so it can be inspected before it is handed to the kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    entries: Vec<(RawResourceHandle, property::Handle, u64)>,
}

impl AtomicRequest {
    /// An empty request
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `prop` of `object` to `value`; a later write to the same property wins
    pub fn add(&mut self, object: impl ResourceHandle, prop: property::Handle, value: u64) {
        let object: RawResourceHandle = object.into();
        match self.entries.iter_mut().find(|(o, p, _)| *o == object && *p == prop) {
            Some(entry) => entry.2 = value,
            None => self.entries.push((object, prop, value)),
        }
    }

    /// Value written to `prop` of `object`, if any
    pub fn get(&self, object: impl ResourceHandle, prop: property::Handle) -> Option<u64> {
        let object: RawResourceHandle = object.into();
        self.entries
            .iter()
            .find(|(o, p, _)| *o == object && *p == prop)
            .map(|(_, _, value)| *value)
    }

    /// Every write in insertion order
    pub fn entries(&self) -> &[(RawResourceHandle, property::Handle, u64)] {
        &self.entries
    }

    /// Whether the request writes anything
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn to_mode_req(&self) -> AtomicModeReq {
        let mut req = AtomicModeReq::new();
        for (object, prop, value) in &self.entries {
            req.add_raw_property(*object, *prop, *value);
        }
        req
    }
}

/// The modesetting ioctls used by the planner
pub trait KmsDevice: fmt::Debug {
    /// Path of the device node, used in error messages
    fn dev_path(&self) -> Option<PathBuf> {
        None
    }
    /// Whether `AddFB2` accepts explicit modifiers
    fn supports_fb_modifiers(&self) -> bool;
    /// `AddFB2`, passing the modifier when `with_modifiers` is set
    fn add_framebuffer(&self, desc: &FramebufferDesc, with_modifiers: bool) -> io::Result<framebuffer::Handle>;
    /// Legacy `AddFB` for single plane buffers
    fn add_legacy_framebuffer(
        &self,
        desc: &FramebufferDesc,
        depth: u32,
        bpp: u32,
    ) -> io::Result<framebuffer::Handle>;
    /// `RmFB`
    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()>;
    /// Allocate a zeroed dumb buffer
    fn create_dumb_buffer(&self, size: (u32, u32), format: DrmFourcc) -> io::Result<FramebufferDesc>;
    /// Free a dumb buffer
    fn destroy_dumb_buffer(&self, handle: buffer::Handle) -> io::Result<()>;
    /// Upload a property blob, returning its id
    fn create_property_blob(&self, data: &[u8]) -> io::Result<u64>;
    /// Free a property blob
    fn destroy_property_blob(&self, blob: u64) -> io::Result<()>;
    /// `DRM_IOCTL_MODE_ATOMIC`
    fn atomic_commit(&self, flags: AtomicCommitFlags, req: &AtomicRequest) -> io::Result<()>;
}

/// Open drm node driven through `drm-rs`
pub struct DrmDeviceFd {
    fd: OwnedFd,
    path: Option<PathBuf>,
    supports_modifiers: bool,
    dumb_buffers: RefCell<HashMap<u32, DumbBuffer>>,
}

impl fmt::Debug for DrmDeviceFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmDeviceFd")
            .field("fd", &self.fd)
            .field("path", &self.path)
            .field("supports_modifiers", &self.supports_modifiers)
            .finish_non_exhaustive()
    }
}

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}

impl DrmDeviceFd {
    /// Wrap an open drm node and enable the client caps the planner needs
    pub fn new(fd: OwnedFd) -> Result<Self, Error> {
        let path = std::fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd())).ok();
        let mut dev = DrmDeviceFd {
            fd,
            path,
            supports_modifiers: false,
            dumb_buffers: RefCell::new(HashMap::new()),
        };

        for cap in [ClientCapability::UniversalPlanes, ClientCapability::Atomic] {
            dev.set_client_capability(cap, true).map_err(|source| AccessError {
                errmsg: "Error enabling client capability",
                dev: dev.path.clone(),
                source,
            })?;
        }
        dev.supports_modifiers = dev
            .get_driver_capability(DriverCapability::AddFB2Modifiers)
            .map(|cap| cap == 1)
            .unwrap_or(false);
        info!(path = ?dev.path, modifiers = dev.supports_modifiers, "opened drm device");

        Ok(dev)
    }

    fn cursor_size(&self) -> Size<i32, Physical> {
        let w = self.get_driver_capability(DriverCapability::CursorWidth).unwrap_or(64);
        let h = self.get_driver_capability(DriverCapability::CursorHeight).unwrap_or(64);
        Size::from((w as i32, h as i32))
    }
}

impl KmsDevice for DrmDeviceFd {
    fn dev_path(&self) -> Option<PathBuf> {
        self.path.clone()
    }

    fn supports_fb_modifiers(&self) -> bool {
        self.supports_modifiers
    }

    fn add_framebuffer(&self, desc: &FramebufferDesc, with_modifiers: bool) -> io::Result<framebuffer::Handle> {
        let flags = if with_modifiers {
            FbCmd2Flags::MODIFIERS
        } else {
            FbCmd2Flags::empty()
        };
        self.add_planar_framebuffer(&PlanarDesc { desc, with_modifiers }, flags)
    }

    fn add_legacy_framebuffer(
        &self,
        desc: &FramebufferDesc,
        depth: u32,
        bpp: u32,
    ) -> io::Result<framebuffer::Handle> {
        let handle = desc.handles[0].ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        ControlDevice::add_framebuffer(self, &LegacyDesc { desc, handle }, depth, bpp)
    }

    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()> {
        ControlDevice::destroy_framebuffer(self, fb)
    }

    fn create_dumb_buffer(&self, size: (u32, u32), format: DrmFourcc) -> io::Result<FramebufferDesc> {
        let bpp = get_bpp(format).ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        let dumb = ControlDevice::create_dumb_buffer(self, size, format, bpp)?;
        let desc = FramebufferDesc {
            size,
            format,
            modifier: DrmModifier::Linear,
            handles: [Some(buffer::Buffer::handle(&dumb)), None, None, None],
            pitches: [buffer::Buffer::pitch(&dumb), 0, 0, 0],
            offsets: [0; 4],
        };
        self.dumb_buffers
            .borrow_mut()
            .insert(u32::from(buffer::Buffer::handle(&dumb)), dumb);
        Ok(desc)
    }

    fn destroy_dumb_buffer(&self, handle: buffer::Handle) -> io::Result<()> {
        match self.dumb_buffers.borrow_mut().remove(&u32::from(handle)) {
            Some(dumb) => ControlDevice::destroy_dumb_buffer(self, dumb),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn create_property_blob(&self, data: &[u8]) -> io::Result<u64> {
        let mut data = data.to_vec();
        let blob = drm_ffi::mode::create_property_blob(self.fd.as_fd(), &mut data).map_err(io::Error::from)?;
        Ok(blob.blob_id as u64)
    }

    fn destroy_property_blob(&self, blob: u64) -> io::Result<()> {
        ControlDevice::destroy_property_blob(self, blob)
    }

    fn atomic_commit(&self, flags: AtomicCommitFlags, req: &AtomicRequest) -> io::Result<()> {
        ControlDevice::atomic_commit(self, flags, req.to_mode_req())
    }
}

/// A hardware plane
#[derive(Debug, Clone)]
pub struct PlaneInfo {
    /// Kernel handle
    pub handle: plane::Handle,
    /// Position in the device plane list, used for framebuffer plane masks
    pub index: usize,
    /// Primary, overlay or cursor
    pub kind: PlaneType,
    /// Bitmask of crtc pipes the plane can be bound to
    pub possible_crtcs: u32,
    /// Supported format and modifier pairs
    pub formats: FormatSet,
    /// Lowest zpos the plane accepts
    pub zpos_min: i32,
    /// Highest zpos the plane accepts
    pub zpos_max: i32,
    /// Property table
    pub props: ObjectProps<PlaneProp>,
}

impl PlaneInfo {
    /// Whether the plane takes an `IN_FENCE_FD`
    pub fn supports_fences(&self) -> bool {
        self.props.has(PlaneProp::InFenceFd)
    }

    /// Whether the plane can blend with a global alpha value
    pub fn supports_alpha(&self) -> bool {
        self.props.has(PlaneProp::Alpha)
    }

    /// Whether the zpos can be written
    pub fn has_mutable_zpos(&self) -> bool {
        self.props.get(PlaneProp::Zpos).map(|info| !info.immutable).unwrap_or(false)
    }

    /// Whether the plane can be driven by the crtc at `pipe`
    pub fn is_compatible_with(&self, pipe: usize) -> bool {
        pipe < 32 && self.possible_crtcs & (1 << pipe) != 0
    }
}

/// A crtc
#[derive(Debug, Clone)]
pub struct CrtcInfo {
    /// Kernel handle
    pub handle: crtc::Handle,
    /// Pipe index, the crtc's position in the resource list
    pub pipe: usize,
    /// Property table
    pub props: ObjectProps<CrtcProp>,
}

/// A connector
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    /// Kernel handle
    pub handle: connector::Handle,
    /// Property table
    pub props: ObjectProps<ConnectorProp>,
}

/// Zpos range of a plane, falling back to a fixed stacking when the driver has no `zpos`
pub(crate) fn zpos_range(kind: PlaneType, overlay_ordinal: i32, props: &ObjectProps<PlaneProp>) -> (i32, i32) {
    match props.get(PlaneProp::Zpos) {
        Some(info) if info.immutable => (info.value as i32, info.value as i32),
        Some(info) => info
            .range
            .map(|(min, max)| (min as i32, max.min(i32::MAX as i64) as i32))
            .unwrap_or((info.value as i32, info.value as i32)),
        None => {
            let zpos = match kind {
                PlaneType::Primary => 0,
                PlaneType::Overlay => 1 + overlay_ordinal,
                PlaneType::Cursor => i32::from(u8::MAX),
            };
            (zpos, zpos)
        }
    }
}

/// Static description of a drm device
#[derive(Debug)]
pub struct DrmDevice {
    kms: Rc<dyn KmsDevice>,
    planes: Vec<PlaneInfo>,
    crtcs: Vec<CrtcInfo>,
    connectors: Vec<ConnectorInfo>,
    cursor_size: Size<i32, Physical>,
    pub(crate) span: tracing::Span,
}

impl DrmDevice {
    /// Assemble a device from an already probed catalogue
    pub fn new(
        kms: Rc<dyn KmsDevice>,
        planes: Vec<PlaneInfo>,
        crtcs: Vec<CrtcInfo>,
        connectors: Vec<ConnectorInfo>,
        cursor_size: Size<i32, Physical>,
    ) -> Self {
        let span = info_span!("drm_planner", device = ?kms.dev_path());
        DrmDevice {
            kms,
            planes,
            crtcs,
            connectors,
            cursor_size,
            span,
        }
    }

    /// Query planes, crtcs and connectors of an open device
    pub fn probe(fd: DrmDeviceFd) -> Result<Self, Error> {
        let span = info_span!("drm_probe", path = ?fd.path);
        let _guard = span.enter();

        let access = |errmsg: &'static str| {
            let dev = fd.path.clone();
            move |source| AccessError { errmsg, dev, source }
        };

        let res = fd.resource_handles().map_err(access("Error loading drm resources"))?;
        let crtcs = res
            .crtcs()
            .iter()
            .enumerate()
            .map(|(pipe, handle)| {
                Ok(CrtcInfo {
                    handle: *handle,
                    pipe,
                    props: query_props(&fd, *handle)?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let connectors = res
            .connectors()
            .iter()
            .map(|handle| {
                Ok(ConnectorInfo {
                    handle: *handle,
                    props: query_props(&fd, *handle)?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let mut planes = Vec::new();
        let mut overlays = 0;
        for handle in fd.plane_handles().map_err(access("Error loading planes"))? {
            let info = fd.get_plane(handle).map_err(access("Error loading plane info"))?;
            let props = query_props::<_, _, PlaneProp>(&fd, handle)?;
            let kind = match props.get(PlaneProp::Type).and_then(|p| p.current::<PlaneTypeTag>()) {
                Some(PlaneTypeTag::Primary) => PlaneType::Primary,
                Some(PlaneTypeTag::Overlay) => PlaneType::Overlay,
                Some(PlaneTypeTag::Cursor) => PlaneType::Cursor,
                None => {
                    warn!(?handle, "plane without a known type, ignoring");
                    continue;
                }
            };

            let allowed = res.filter_crtcs(info.possible_crtcs());
            let possible_crtcs = crtcs
                .iter()
                .filter(|crtc| allowed.contains(&crtc.handle))
                .fold(0u32, |mask, crtc| mask | (1 << crtc.pipe));

            let blob = props
                .get(PlaneProp::InFormats)
                .filter(|p| p.value != 0)
                .and_then(|p| fd.get_property_blob(p.value).ok());
            let formats = in_formats_or_legacy(blob.as_deref(), info.formats());

            let (zpos_min, zpos_max) = zpos_range(kind, overlays, &props);
            if kind == PlaneType::Overlay {
                overlays += 1;
            }

            debug!(
                ?handle,
                ?kind,
                zpos_min,
                zpos_max,
                formats = formats.len(),
                "found plane"
            );
            planes.push(PlaneInfo {
                handle,
                index: planes.len(),
                kind,
                possible_crtcs,
                formats,
                zpos_min,
                zpos_max,
                props,
            });
        }

        let cursor_size = fd.cursor_size();
        drop(_guard);
        Ok(DrmDevice::new(Rc::new(fd), planes, crtcs, connectors, cursor_size))
    }

    /// The ioctl interface
    pub fn kms(&self) -> &Rc<dyn KmsDevice> {
        &self.kms
    }

    /// Whether `AddFB2` accepts explicit modifiers
    pub fn supports_fb_modifiers(&self) -> bool {
        self.kms.supports_fb_modifiers()
    }

    /// Every plane of the device
    pub fn planes(&self) -> &[PlaneInfo] {
        &self.planes
    }

    /// Look up a plane
    pub fn plane(&self, handle: plane::Handle) -> Result<&PlaneInfo, Error> {
        self.planes
            .iter()
            .find(|plane| plane.handle == handle)
            .ok_or(Error::UnknownPlane(handle))
    }

    /// Look up a crtc
    pub fn crtc(&self, handle: crtc::Handle) -> Result<&CrtcInfo, Error> {
        self.crtcs
            .iter()
            .find(|crtc| crtc.handle == handle)
            .ok_or(Error::UnknownCrtc(handle))
    }

    /// Look up a connector
    pub fn connector(&self, handle: connector::Handle) -> Option<&ConnectorInfo> {
        self.connectors.iter().find(|conn| conn.handle == handle)
    }

    /// Size of the cursor plane
    pub fn cursor_size(&self) -> Size<i32, Physical> {
        self.cursor_size
    }

    /// Planes the crtc can drive, highest `zpos_max` first.
    ///
    /// Of the primary and cursor planes only the first compatible one is
    /// returned, the kernel binds at most one of each to a crtc.
    pub fn planes_for_crtc(&self, crtc: crtc::Handle) -> Result<Vec<&PlaneInfo>, Error> {
        let pipe = self.crtc(crtc)?.pipe;
        let mut primary = false;
        let mut cursor = false;
        let mut planes = self
            .planes
            .iter()
            .filter(|plane| plane.is_compatible_with(pipe))
            .filter(|plane| match plane.kind {
                PlaneType::Primary => !std::mem::replace(&mut primary, true),
                PlaneType::Cursor => !std::mem::replace(&mut cursor, true),
                PlaneType::Overlay => true,
            })
            .collect::<Vec<_>>();
        planes.sort_by(|a, b| b.zpos_max.cmp(&a.zpos_max).then(a.index.cmp(&b.index)));
        trace!(?crtc, planes = planes.len(), "planes for crtc");
        Ok(planes)
    }
}

//! Recording stand-ins for the kernel and the buffer importer

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::rc::Rc;

use drm::buffer;
use drm::control::{connector, crtc, framebuffer, plane, AtomicCommitFlags, PlaneType};
use drm_fourcc::{DrmFourcc, DrmModifier};

use super::device::{
    zpos_range, AtomicRequest, ConnectorInfo, CrtcInfo, DrmDevice, FramebufferDesc, KmsDevice, PlaneInfo,
};
use super::gbm::{BufferImporter, CursorBuffer, GbmImportError, ImportedBuffer};
use super::props::{ConnectorProp, CrtcProp, ObjectProps, PlaneProp, PropertyInfo, PropertyName};
use crate::backend::allocator::{dmabuf::Dmabuf, format::FormatSet, Format};
use crate::scene::OpaqueBuffer;
use crate::utils::{Physical, Size};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

type RejectFn = Box<dyn Fn(&AtomicRequest) -> bool>;

/// A [`KmsDevice`] keeping every object in memory
pub(crate) struct MockDevice {
    modifiers: bool,
    next_id: Cell<u32>,
    framebuffers: RefCell<HashSet<u32>>,
    framebuffers_added: Cell<usize>,
    legacy_added: Cell<usize>,
    dumb_buffers: RefCell<HashSet<u32>>,
    blobs: RefCell<HashMap<u64, Vec<u8>>>,
    commits: RefCell<Vec<(AtomicCommitFlags, AtomicRequest)>>,
    reject: RefCell<Option<RejectFn>>,
    fail_add: Cell<bool>,
    fail_add2: Cell<bool>,
}

impl fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDevice")
            .field("modifiers", &self.modifiers)
            .field("framebuffers", &self.framebuffers)
            .field("commits", &self.commits.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        MockDevice {
            modifiers: true,
            next_id: Cell::new(500),
            framebuffers: RefCell::default(),
            framebuffers_added: Cell::new(0),
            legacy_added: Cell::new(0),
            dumb_buffers: RefCell::default(),
            blobs: RefCell::default(),
            commits: RefCell::default(),
            reject: RefCell::new(None),
            fail_add: Cell::new(false),
            fail_add2: Cell::new(false),
        }
    }
}

impl MockDevice {
    pub(crate) fn without_modifiers() -> Self {
        MockDevice {
            modifiers: false,
            ..MockDevice::default()
        }
    }

    fn next_id(&self) -> u32 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Reject every commit, test or not, for which `reject` returns true
    pub(crate) fn reject_when(&self, reject: impl Fn(&AtomicRequest) -> bool + 'static) {
        *self.reject.borrow_mut() = Some(Box::new(reject));
    }

    /// Make `AddFB2` and `AddFB` fail
    pub(crate) fn fail_add_framebuffer(&self, fail: bool) {
        self.fail_add.set(fail);
    }

    /// Make only `AddFB2` fail
    pub(crate) fn fail_add_framebuffer2(&self, fail: bool) {
        self.fail_add2.set(fail);
    }

    pub(crate) fn commits(&self) -> Vec<(AtomicCommitFlags, AtomicRequest)> {
        self.commits.borrow().clone()
    }

    pub(crate) fn test_commits(&self) -> usize {
        self.commits
            .borrow()
            .iter()
            .filter(|(flags, _)| flags.contains(AtomicCommitFlags::TEST_ONLY))
            .count()
    }

    pub(crate) fn framebuffers_added(&self) -> usize {
        self.framebuffers_added.get()
    }

    pub(crate) fn legacy_framebuffers_added(&self) -> usize {
        self.legacy_added.get()
    }

    pub(crate) fn live_framebuffers(&self) -> usize {
        self.framebuffers.borrow().len()
    }

    pub(crate) fn live_dumb_buffers(&self) -> usize {
        self.dumb_buffers.borrow().len()
    }

    pub(crate) fn live_blobs(&self) -> usize {
        self.blobs.borrow().len()
    }

    pub(crate) fn blob(&self, id: u64) -> Option<Vec<u8>> {
        self.blobs.borrow().get(&id).cloned()
    }

    fn new_framebuffer(&self) -> io::Result<framebuffer::Handle> {
        let id = self.next_id();
        self.framebuffers.borrow_mut().insert(id);
        drm::control::from_u32(id).ok_or_else(einval)
    }
}

impl KmsDevice for MockDevice {
    fn supports_fb_modifiers(&self) -> bool {
        self.modifiers
    }

    fn add_framebuffer(&self, _desc: &FramebufferDesc, _with_modifiers: bool) -> io::Result<framebuffer::Handle> {
        if self.fail_add.get() || self.fail_add2.get() {
            return Err(einval());
        }
        self.framebuffers_added.set(self.framebuffers_added.get() + 1);
        self.new_framebuffer()
    }

    fn add_legacy_framebuffer(
        &self,
        _desc: &FramebufferDesc,
        _depth: u32,
        _bpp: u32,
    ) -> io::Result<framebuffer::Handle> {
        if self.fail_add.get() {
            return Err(einval());
        }
        self.legacy_added.set(self.legacy_added.get() + 1);
        self.new_framebuffer()
    }

    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()> {
        if self.framebuffers.borrow_mut().remove(&u32::from(fb)) {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::ENOENT))
        }
    }

    fn create_dumb_buffer(&self, size: (u32, u32), format: DrmFourcc) -> io::Result<FramebufferDesc> {
        let id = self.next_id();
        self.dumb_buffers.borrow_mut().insert(id);
        Ok(FramebufferDesc {
            size,
            format,
            modifier: DrmModifier::Linear,
            handles: [drm::control::from_u32(id), None, None, None],
            pitches: [size.0 * 4, 0, 0, 0],
            offsets: [0; 4],
        })
    }

    fn destroy_dumb_buffer(&self, handle: buffer::Handle) -> io::Result<()> {
        if self.dumb_buffers.borrow_mut().remove(&u32::from(handle)) {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::ENOENT))
        }
    }

    fn create_property_blob(&self, data: &[u8]) -> io::Result<u64> {
        let id = self.next_id() as u64;
        self.blobs.borrow_mut().insert(id, data.to_vec());
        Ok(id)
    }

    fn destroy_property_blob(&self, blob: u64) -> io::Result<()> {
        self.blobs
            .borrow_mut()
            .remove(&blob)
            .map(|_| ())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn atomic_commit(&self, flags: AtomicCommitFlags, req: &AtomicRequest) -> io::Result<()> {
        self.commits.borrow_mut().push((flags, req.clone()));
        match &*self.reject.borrow() {
            Some(reject) if reject(req) => Err(einval()),
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
struct MockBuffer(FramebufferDesc);

impl ImportedBuffer for MockBuffer {
    fn describe(&self) -> FramebufferDesc {
        self.0.clone()
    }
}

#[derive(Debug)]
struct MockCursor {
    desc: FramebufferDesc,
    writes: Rc<RefCell<Vec<Vec<u8>>>>,
    fail: Rc<Cell<bool>>,
}

impl ImportedBuffer for MockCursor {
    fn describe(&self) -> FramebufferDesc {
        self.desc.clone()
    }
}

impl CursorBuffer for MockCursor {
    fn write(&mut self, pixels: &[u8]) -> io::Result<()> {
        if self.fail.get() {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        self.writes.borrow_mut().push(pixels.to_vec());
        Ok(())
    }
}

/// A [`BufferImporter`] describing buffers without touching them
#[derive(Debug, Clone)]
pub(crate) struct MockImporter {
    opaque_modifier: DrmModifier,
    cursor_writes: Rc<RefCell<Vec<Vec<u8>>>>,
    fail_writes: Rc<Cell<bool>>,
}

impl Default for MockImporter {
    fn default() -> Self {
        MockImporter {
            opaque_modifier: DrmModifier::Linear,
            cursor_writes: Rc::default(),
            fail_writes: Rc::default(),
        }
    }
}

fn gem_handle() -> Option<buffer::Handle> {
    drm::control::from_u32(1)
}

impl MockImporter {
    pub(crate) fn with_opaque_modifier(modifier: DrmModifier) -> Self {
        MockImporter {
            opaque_modifier: modifier,
            ..MockImporter::default()
        }
    }

    pub(crate) fn cursor_writes(&self) -> Vec<Vec<u8>> {
        self.cursor_writes.borrow().clone()
    }

    pub(crate) fn fail_cursor_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }
}

impl BufferImporter for MockImporter {
    fn import_dmabuf(&self, dmabuf: &Dmabuf, _with_modifiers: bool) -> Result<Box<dyn ImportedBuffer>, GbmImportError> {
        let format = dmabuf.format();
        let mut pitches = [0; 4];
        let mut offsets = [0; 4];
        for (i, (stride, offset)) in dmabuf.strides().zip(dmabuf.offsets()).take(4).enumerate() {
            pitches[i] = stride;
            offsets[i] = offset;
        }
        let mut handles = [None; 4];
        for handle in handles.iter_mut().take(dmabuf.num_planes()) {
            *handle = gem_handle();
        }
        Ok(Box::new(MockBuffer(FramebufferDesc {
            size: (dmabuf.size().w as u32, dmabuf.size().h as u32),
            format: format.code,
            modifier: format.modifier,
            handles,
            pitches,
            offsets,
        })))
    }

    fn import_opaque(&self, buffer: &OpaqueBuffer) -> Result<Box<dyn ImportedBuffer>, GbmImportError> {
        Ok(Box::new(MockBuffer(FramebufferDesc {
            size: (64, 64),
            format: buffer.format,
            modifier: self.opaque_modifier,
            handles: [gem_handle(), None, None, None],
            pitches: [256, 0, 0, 0],
            offsets: [0; 4],
        })))
    }

    fn create_cursor_buffer(&self, size: Size<i32, Physical>) -> Result<Box<dyn CursorBuffer>, GbmImportError> {
        Ok(Box::new(MockCursor {
            desc: FramebufferDesc {
                size: (size.w as u32, size.h as u32),
                format: DrmFourcc::Argb8888,
                modifier: DrmModifier::Linear,
                handles: [gem_handle(), None, None, None],
                pitches: [size.w as u32 * 4, 0, 0, 0],
                offsets: [0; 4],
            },
            writes: self.cursor_writes.clone(),
            fail: self.fail_writes.clone(),
        }))
    }
}

/// Description of a plane of a mock device
#[derive(Debug, Clone)]
pub(crate) struct TestPlane {
    kind: PlaneType,
    formats: Vec<(DrmFourcc, DrmModifier)>,
    zpos: Option<(i32, i32)>,
    fences: bool,
    alpha: bool,
    damage_clips: bool,
}

impl TestPlane {
    fn new(kind: PlaneType, formats: &[(DrmFourcc, DrmModifier)]) -> Self {
        TestPlane {
            kind,
            formats: formats.to_vec(),
            zpos: None,
            fences: false,
            alpha: false,
            damage_clips: false,
        }
    }

    pub(crate) fn primary(formats: &[(DrmFourcc, DrmModifier)]) -> Self {
        Self::new(PlaneType::Primary, formats)
    }

    pub(crate) fn overlay(formats: &[(DrmFourcc, DrmModifier)]) -> Self {
        Self::new(PlaneType::Overlay, formats)
    }

    pub(crate) fn cursor(formats: &[(DrmFourcc, DrmModifier)]) -> Self {
        Self::new(PlaneType::Cursor, formats)
    }

    /// Expose a mutable `zpos` with the given range
    pub(crate) fn zpos(mut self, min: i32, max: i32) -> Self {
        self.zpos = Some((min, max));
        self
    }

    pub(crate) fn fences(mut self) -> Self {
        self.fences = true;
        self
    }

    pub(crate) fn alpha(mut self) -> Self {
        self.alpha = true;
        self
    }

    pub(crate) fn damage_clips(mut self) -> Self {
        self.damage_clips = true;
        self
    }
}

pub(crate) fn test_crtc() -> crtc::Handle {
    drm::control::from_u32(10).unwrap()
}

pub(crate) fn test_connector() -> connector::Handle {
    drm::control::from_u32(20).unwrap()
}

struct PropIds(u32);

impl PropIds {
    fn info(&mut self, value: u64) -> PropertyInfo {
        self.0 += 1;
        PropertyInfo::new(drm::control::from_u32(self.0).unwrap(), false, None, value, [])
    }

    fn insert_all<P: PropertyName>(&mut self, props: &mut ObjectProps<P>, names: &[P]) {
        for prop in names {
            let info = self.info(0);
            props.insert(*prop, info);
        }
    }
}

/// Build a device with one crtc, one connector and `planes`
pub(crate) fn device_from(kms: Rc<MockDevice>, planes: &[TestPlane]) -> DrmDevice {
    init_tracing();
    let mut ids = PropIds(1000);

    let mut overlays = 0;
    let planes = planes
        .iter()
        .enumerate()
        .map(|(index, desc)| {
            let handle: plane::Handle = drm::control::from_u32(100 + index as u32).unwrap();
            let mut props = ObjectProps::new();
            ids.insert_all(
                &mut props,
                &[
                    PlaneProp::FbId,
                    PlaneProp::CrtcId,
                    PlaneProp::SrcX,
                    PlaneProp::SrcY,
                    PlaneProp::SrcW,
                    PlaneProp::SrcH,
                    PlaneProp::CrtcX,
                    PlaneProp::CrtcY,
                    PlaneProp::CrtcW,
                    PlaneProp::CrtcH,
                ],
            );
            if desc.fences {
                ids.insert_all(&mut props, &[PlaneProp::InFenceFd]);
            }
            if desc.alpha {
                ids.insert_all(&mut props, &[PlaneProp::Alpha]);
            }
            if desc.damage_clips {
                ids.insert_all(&mut props, &[PlaneProp::FbDamageClips]);
            }
            if let Some((min, max)) = desc.zpos {
                let info = ids.info(min as u64);
                props.insert(
                    PlaneProp::Zpos,
                    PropertyInfo::new(info.handle, false, Some((min as i64, max as i64)), min as u64, []),
                );
            }

            let (zpos_min, zpos_max) = zpos_range(desc.kind, overlays, &props);
            if desc.kind == PlaneType::Overlay {
                overlays += 1;
            }
            let formats: FormatSet = desc
                .formats
                .iter()
                .map(|(code, modifier)| Format {
                    code: *code,
                    modifier: *modifier,
                })
                .collect();

            PlaneInfo {
                handle,
                index,
                kind: desc.kind,
                possible_crtcs: 1,
                formats,
                zpos_min,
                zpos_max,
                props,
            }
        })
        .collect();

    let mut crtc_props = ObjectProps::new();
    ids.insert_all(&mut crtc_props, &[CrtcProp::ModeId, CrtcProp::Active]);

    let mut conn_props = ObjectProps::new();
    let handle = ids.info(0).handle;
    conn_props.insert(
        ConnectorProp::ContentProtection,
        PropertyInfo::new(
            handle,
            false,
            None,
            0,
            [("Undesired", 0), ("Desired", 1), ("Enabled", 2)],
        ),
    );

    DrmDevice::new(
        kms,
        planes,
        vec![CrtcInfo {
            handle: test_crtc(),
            pipe: 0,
            props: crtc_props,
        }],
        vec![ConnectorInfo {
            handle: test_connector(),
            props: conn_props,
        }],
        Size::from((64, 64)),
    )
}

/// A mock device with `planes`, returning the mock for inspection
pub(crate) fn test_device(planes: &[TestPlane]) -> (Rc<MockDevice>, DrmDevice) {
    let kms = Rc::new(MockDevice::default());
    let device = device_from(kms.clone(), planes);
    (kms, device)
}

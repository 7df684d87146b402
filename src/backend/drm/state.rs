//! Transactional plane, output and pending states
//!
//! Everything the planner decides for a frame lands in a [`PendingState`].
//! Nothing reaches the kernel before [`PendingState::test`] or
//! [`PendingState::apply`]. Plane states hold strong references to their
//! framebuffer and client buffer, so cloning or dropping them is how
//! framebuffer lifetimes are managed.

use std::collections::HashSet;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::Arc;

use drm::control::{connector, crtc, plane, AtomicCommitFlags, PlaneType};
use tracing::{instrument, trace, warn};

use super::device::{AtomicRequest, DrmDevice, KmsDevice, PlaneInfo};
use super::error::{AccessError, Error};
use super::fb::Framebuffer;
use super::output::OutputKey;
use super::props::{ConnectorProp, ContentProtectionTag, CrtcProp, DpmsTag, PlaneProp, DRM_MODE_ROTATE_0};
use crate::scene::{BufferLock, ProtectionLevel, ViewKey};
use crate::utils::{to_fixed, Buffer as BufferCoords, Physical, Rectangle};

/// A property blob owned by the compositor, destroyed on drop
#[derive(Debug)]
pub struct PropertyBlob {
    kms: Rc<dyn KmsDevice>,
    id: u64,
}

impl PropertyBlob {
    /// Upload `data` as a new blob
    pub fn new(kms: &Rc<dyn KmsDevice>, data: &[u8]) -> Result<Self, Error> {
        let id = kms.create_property_blob(data).map_err(|source| AccessError {
            errmsg: "Failed to create property blob",
            dev: kms.dev_path(),
            source,
        })?;
        Ok(PropertyBlob { kms: kms.clone(), id })
    }

    /// Kernel id of the blob
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for PropertyBlob {
    fn drop(&mut self) {
        if let Err(err) = self.kms.destroy_property_blob(self.id) {
            warn!(blob = self.id, ?err, "failed to destroy property blob");
        }
    }
}

/// What one plane shows in a transaction
///
/// `fb == None` turns the plane off. Cloning bumps the framebuffer and
/// buffer references.
#[derive(Debug, Clone)]
pub struct PlaneState {
    /// The plane
    pub plane: plane::Handle,
    /// Index of the plane on its device
    pub index: usize,
    /// Type of the plane
    pub kind: PlaneType,
    /// Framebuffer shown, `None` if the plane is off
    pub fb: Option<Framebuffer>,
    /// Source rectangle inside the framebuffer
    pub src: Rectangle<f64, BufferCoords>,
    /// Destination rectangle on the crtc
    pub dst: Rectangle<i32, Physical>,
    /// Stacking position
    pub zpos: i32,
    /// Plane alpha, `0.0..=1.0`
    pub alpha: f32,
    /// Acquire fence, borrowed from the view
    pub in_fence: Option<Arc<OwnedFd>>,
    /// Damaged parts of the framebuffer
    pub damage: Vec<Rectangle<i32, BufferCoords>>,
    damage_blob: Option<Rc<PropertyBlob>>,
    /// Whether the kernel finished scanning out the previous content
    pub complete: bool,
    /// Keeps the client buffer busy while it is scanned out
    pub buffer: Option<Rc<BufferLock>>,
    /// View shown on the plane
    pub view: Option<ViewKey>,
}

impl PlaneState {
    /// A state turning `plane` off
    pub fn off(plane: &PlaneInfo) -> Self {
        PlaneState {
            plane: plane.handle,
            index: plane.index,
            kind: plane.kind,
            fb: None,
            src: Rectangle::default(),
            dst: Rectangle::default(),
            zpos: plane.zpos_min,
            alpha: 1.0,
            in_fence: None,
            damage: Vec::new(),
            damage_blob: None,
            complete: false,
            buffer: None,
            view: None,
        }
    }

    /// Whether the plane shows something
    pub fn is_on(&self) -> bool {
        self.fb.is_some()
    }

    /// Whether the slot is free for a new assignment
    pub fn is_free(&self) -> bool {
        self.fb.is_none() && self.view.is_none()
    }

    /// Release everything the plane references and turn it off
    pub fn reset(&mut self) {
        self.fb = None;
        self.src = Rectangle::default();
        self.dst = Rectangle::default();
        self.alpha = 1.0;
        self.in_fence = None;
        self.damage.clear();
        self.damage_blob = None;
        self.complete = false;
        self.buffer = None;
        self.view = None;
    }

    fn damage_blob_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.damage.len() * 16);
        for rect in &self.damage {
            let x2 = rect.loc.x.saturating_add(rect.size.w);
            let y2 = rect.loc.y.saturating_add(rect.size.h);
            for v in [rect.loc.x, rect.loc.y, x2, y2] {
                data.extend_from_slice(&v.to_ne_bytes());
            }
        }
        data
    }
}

/// How [`OutputState::duplicate`] treats the planes of the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateMode {
    /// Every plane starts out off
    ClearPlanes,
    /// Every plane keeps its content
    PreservePlanes,
}

/// Per output part of a transaction
#[derive(Debug, Clone)]
pub struct OutputState {
    /// Output the state belongs to
    pub output: OutputKey,
    /// Crtc driving the output
    pub crtc: crtc::Handle,
    /// Connectors of the output
    pub connectors: Vec<connector::Handle>,
    /// Power state wished for
    pub dpms: DpmsTag,
    /// Protection wished for
    pub protection: ProtectionLevel,
    /// One entry per plane the crtc can drive
    pub planes: Vec<PlaneState>,
}

impl OutputState {
    /// A powered state with every plane in `planes` off
    pub fn new(
        output: OutputKey,
        crtc: crtc::Handle,
        connectors: Vec<connector::Handle>,
        planes: &[&PlaneInfo],
    ) -> Self {
        OutputState {
            output,
            crtc,
            connectors,
            dpms: DpmsTag::On,
            protection: ProtectionLevel::Undesired,
            planes: planes.iter().map(|plane| PlaneState::off(plane)).collect(),
        }
    }

    /// Copy the state for a new transaction
    pub fn duplicate(&self, mode: DuplicateMode) -> Self {
        let mut dup = self.clone();
        if mode == DuplicateMode::ClearPlanes {
            dup.planes.iter_mut().for_each(PlaneState::reset);
        }
        for plane in &mut dup.planes {
            // the kernel already has the damage of the source state
            plane.damage.clear();
            plane.damage_blob = None;
            plane.complete = false;
        }
        dup
    }

    /// State of a plane
    pub fn plane(&self, plane: plane::Handle) -> Option<&PlaneState> {
        self.planes.iter().find(|state| state.plane == plane)
    }

    /// Mutable state of a plane
    pub fn plane_mut(&mut self, plane: plane::Handle) -> Option<&mut PlaneState> {
        self.planes.iter_mut().find(|state| state.plane == plane)
    }

    /// State of the first plane of a type
    pub fn plane_of_kind(&self, kind: PlaneType) -> Option<&PlaneState> {
        self.planes.iter().find(|state| state.kind == kind)
    }

    /// Give a tentatively assigned plane back, turning it off
    pub fn put_back(&mut self, plane: plane::Handle) {
        if let Some(state) = self.plane_mut(plane) {
            trace!(?plane, "returning plane");
            state.reset();
        }
    }

    /// Planes that are on
    pub fn active_planes(&self) -> impl Iterator<Item = &PlaneState> {
        self.planes.iter().filter(|state| state.is_on())
    }

    /// Check that no two active planes share a zpos
    pub fn check_zpos(&self) -> Result<(), Error> {
        let active = self.active_planes().collect::<Vec<_>>();
        for (i, a) in active.iter().enumerate() {
            if let Some(b) = active[i + 1..].iter().find(|b| b.zpos == a.zpos) {
                return Err(Error::DuplicateZpos {
                    zpos: a.zpos,
                    planes: (a.plane, b.plane),
                });
            }
        }
        Ok(())
    }
}

/// A test or commit transaction over one or more outputs
#[derive(Debug)]
pub struct PendingState {
    device: Rc<DrmDevice>,
    outputs: Vec<OutputState>,
}

impl PendingState {
    /// An empty transaction
    pub fn new(device: Rc<DrmDevice>) -> Self {
        PendingState {
            device,
            outputs: Vec::new(),
        }
    }

    /// The device the transaction is for
    pub fn device(&self) -> &Rc<DrmDevice> {
        &self.device
    }

    /// Add an output state, replacing any previous one of the same output
    pub fn insert(&mut self, state: OutputState) {
        self.remove_output_state(state.output);
        self.outputs.push(state);
    }

    /// State of an output
    pub fn output_state(&self, output: OutputKey) -> Option<&OutputState> {
        self.outputs.iter().find(|state| state.output == output)
    }

    /// Mutable state of an output
    pub fn output_state_mut(&mut self, output: OutputKey) -> Option<&mut OutputState> {
        self.outputs.iter_mut().find(|state| state.output == output)
    }

    /// Take an output out of the transaction
    pub fn remove_output_state(&mut self, output: OutputKey) -> Option<OutputState> {
        let idx = self.outputs.iter().position(|state| state.output == output)?;
        Some(self.outputs.remove(idx))
    }

    /// Every output state
    pub fn outputs(&self) -> &[OutputState] {
        &self.outputs
    }

    /// Whether `plane` is shown by an output other than `output`
    pub fn plane_claimed_elsewhere(&self, output: OutputKey, plane: plane::Handle) -> bool {
        self.outputs
            .iter()
            .filter(|state| state.output != output)
            .any(|state| state.plane(plane).map(PlaneState::is_on).unwrap_or(false))
    }

    /// Ask the kernel whether the transaction would be accepted
    #[instrument(level = "trace", skip_all, parent = &self.device.span)]
    #[profiling::function]
    pub fn test(&self) -> Result<(), Error> {
        let req = self.build_request()?;
        let flags = self.modeset_flags() | AtomicCommitFlags::TEST_ONLY;
        self.device.kms().atomic_commit(flags, &req).map_err(|source| {
            trace!(?source, "test commit failed");
            match (source.raw_os_error(), self.outputs.first()) {
                (Some(libc::EINVAL), Some(first)) => Error::TestFailed(first.crtc),
                _ => Error::Access(AccessError {
                    errmsg: "Test commit failed",
                    dev: self.device.kms().dev_path(),
                    source,
                }),
            }
        })
    }

    /// Commit without blocking, requesting page-flip events.
    ///
    /// On success the output states are handed back to become the new
    /// current states of their outputs.
    pub fn apply(self) -> Result<Vec<OutputState>, Error> {
        self.commit(AtomicCommitFlags::NONBLOCK | AtomicCommitFlags::PAGE_FLIP_EVENT)
    }

    /// Commit and wait for the kernel to finish
    pub fn apply_sync(self) -> Result<Vec<OutputState>, Error> {
        self.commit(AtomicCommitFlags::empty())
    }

    /// Drop the transaction, releasing every framebuffer and buffer reference it holds
    pub fn free(self) {
        trace!(outputs = self.outputs.len(), "freeing pending state");
    }

    #[instrument(level = "debug", skip_all, fields(?flags), parent = &self.device.span)]
    fn commit(mut self, flags: AtomicCommitFlags) -> Result<Vec<OutputState>, Error> {
        self.upload_damage()?;
        let req = self.build_request()?;
        let flags = flags | self.modeset_flags();
        self.device.kms().atomic_commit(flags, &req).map_err(|source| AccessError {
            errmsg: "Atomic commit failed",
            dev: self.device.kms().dev_path(),
            source,
        })?;
        Ok(std::mem::take(&mut self.outputs))
    }

    fn modeset_flags(&self) -> AtomicCommitFlags {
        if self.outputs.iter().any(|state| state.dpms != DpmsTag::On) {
            AtomicCommitFlags::ALLOW_MODESET
        } else {
            AtomicCommitFlags::empty()
        }
    }

    fn upload_damage(&mut self) -> Result<(), Error> {
        let kms = self.device.kms().clone();
        for state in &mut self.outputs {
            for plane in state.planes.iter_mut() {
                if plane.fb.is_none() || plane.damage.is_empty() || plane.damage_blob.is_some() {
                    continue;
                }
                if !self.device.plane(plane.plane)?.props.has(PlaneProp::FbDamageClips) {
                    continue;
                }
                let blob = PropertyBlob::new(&kms, &plane.damage_blob_data())?;
                trace!(plane = ?plane.plane, blob = blob.id(), "uploaded damage clips");
                plane.damage_blob = Some(Rc::new(blob));
            }
        }
        Ok(())
    }

    /// Translate the transaction into an atomic request
    pub fn build_request(&self) -> Result<AtomicRequest, Error> {
        let mut req = AtomicRequest::new();

        let shown: HashSet<plane::Handle> = self
            .outputs
            .iter()
            .flat_map(|state| state.active_planes().map(|plane| plane.plane))
            .collect();

        for state in &self.outputs {
            let crtc = self.device.crtc(state.crtc)?;
            if let Some(active) = crtc.props.handle(CrtcProp::Active) {
                req.add(state.crtc, active, u64::from(state.dpms == DpmsTag::On));
            }

            for conn in &state.connectors {
                let Some(info) = self.device.connector(*conn) else {
                    continue;
                };
                if let Some(prop) = info.props.get(ConnectorProp::ContentProtection) {
                    let tag = match state.protection {
                        ProtectionLevel::Undesired => ContentProtectionTag::Undesired,
                        ProtectionLevel::Desired | ProtectionLevel::Enabled => ContentProtectionTag::Desired,
                    };
                    if let Some(value) = prop.enum_value(tag) {
                        req.add(*conn, prop.handle, value);
                    }
                }
            }

            for plane in &state.planes {
                match &plane.fb {
                    Some(fb) => self.add_plane(&mut req, state.crtc, plane, fb)?,
                    None if !shown.contains(&plane.plane) => {
                        let info = self.device.plane(plane.plane)?;
                        req.add(plane.plane, info.props.require(plane.plane, PlaneProp::FbId)?, 0);
                        req.add(plane.plane, info.props.require(plane.plane, PlaneProp::CrtcId)?, 0);
                    }
                    None => {}
                }
            }
        }

        Ok(req)
    }

    fn add_plane(
        &self,
        req: &mut AtomicRequest,
        crtc: crtc::Handle,
        plane: &PlaneState,
        fb: &Framebuffer,
    ) -> Result<(), Error> {
        let info = self.device.plane(plane.plane)?;
        let props = &info.props;
        let handle = plane.plane;

        req.add(handle, props.require(handle, PlaneProp::FbId)?, u32::from(fb.handle()) as u64);
        req.add(handle, props.require(handle, PlaneProp::CrtcId)?, u32::from(crtc) as u64);
        req.add(handle, props.require(handle, PlaneProp::SrcX)?, to_fixed(plane.src.loc.x) as u64);
        req.add(handle, props.require(handle, PlaneProp::SrcY)?, to_fixed(plane.src.loc.y) as u64);
        req.add(handle, props.require(handle, PlaneProp::SrcW)?, to_fixed(plane.src.size.w) as u64);
        req.add(handle, props.require(handle, PlaneProp::SrcH)?, to_fixed(plane.src.size.h) as u64);
        req.add(handle, props.require(handle, PlaneProp::CrtcX)?, plane.dst.loc.x as i64 as u64);
        req.add(handle, props.require(handle, PlaneProp::CrtcY)?, plane.dst.loc.y as i64 as u64);
        req.add(handle, props.require(handle, PlaneProp::CrtcW)?, plane.dst.size.w as u64);
        req.add(handle, props.require(handle, PlaneProp::CrtcH)?, plane.dst.size.h as u64);

        if info.has_mutable_zpos() {
            req.add(handle, props.require(handle, PlaneProp::Zpos)?, plane.zpos as u64);
        }
        if let Some(rotation) = props.handle(PlaneProp::Rotation) {
            req.add(handle, rotation, DRM_MODE_ROTATE_0);
        }
        if let Some(alpha) = props.handle(PlaneProp::Alpha) {
            let value = (plane.alpha.clamp(0.0, 1.0) * u16::MAX as f32).round() as u64;
            req.add(handle, alpha, value);
        }

        match &plane.in_fence {
            Some(fence) => {
                let prop = props.require(handle, PlaneProp::InFenceFd)?;
                req.add(handle, prop, fence.as_raw_fd() as u64);
            }
            None => {
                if let Some(prop) = props.handle(PlaneProp::InFenceFd) {
                    req.add(handle, prop, -1i64 as u64);
                }
            }
        }

        if let Some(prop) = props.handle(PlaneProp::FbDamageClips) {
            let blob = plane.damage_blob.as_ref().map(|blob| blob.id()).unwrap_or(0);
            req.add(handle, prop, blob);
        }

        Ok(())
    }
}

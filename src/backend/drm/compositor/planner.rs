use drm::control::{plane, PlaneType};
use tracing::{trace, warn};

use super::ViewDecision;
use crate::backend::allocator::Fourcc;
use crate::backend::drm::cursor::CursorUpdate;
use crate::backend::drm::device::{DrmDevice, PlaneInfo};
use crate::backend::drm::error::Error;
use crate::backend::drm::fb::FramebufferRegistry;
use crate::backend::drm::output::{Output, OutputKey, PlannerMode};
use crate::backend::drm::state::{DuplicateMode, PendingState, PlaneState};
use crate::backend::drm::{FailureReasons, PlannerConfig};
use crate::scene::{Buffer, BufferContent, BufferKey, ProtectionMode, Scene, View, ViewKey};
use crate::utils::{Buffer as BufferCoords, Physical, Rectangle, Region, Size};

/// Cursor image to latch once the mode is chosen
#[derive(Debug, Clone, Copy)]
pub(super) struct CursorPlacement {
    pub(super) view: ViewKey,
    pub(super) update: CursorUpdate,
    pub(super) buffer: BufferKey,
    pub(super) size: Size<i32, BufferCoords>,
}

/// Result of a successful mode
#[derive(Debug, Default)]
pub(super) struct Outcome {
    pub(super) cursor: Option<CursorPlacement>,
}

/// Running state of one walk over the views
struct Frame<'p> {
    planes: Vec<&'p PlaneInfo>,
    geometry: Rectangle<i32, Physical>,
    lowest_zpos: i32,
    primary_zpos: i32,
    renderer_region: Region<i32, Physical>,
    cursor: Option<CursorPlacement>,
}

impl Frame<'_> {
    /// Zpos for a plane stacked right below everything placed so far
    fn next_zpos(&self, plane: &PlaneInfo) -> Option<i32> {
        let zpos = self.lowest_zpos.saturating_sub(1).min(plane.zpos_max);
        (zpos >= plane.zpos_min && zpos > self.primary_zpos).then_some(zpos)
    }
}

pub(super) struct Planner<'a> {
    pub(super) device: &'a DrmDevice,
    pub(super) registry: &'a mut FramebufferRegistry,
    pub(super) config: &'a PlannerConfig,
    pub(super) output: &'a mut Output,
    pub(super) key: OutputKey,
    pub(super) scene: &'a Scene,
}

impl Planner<'_> {
    /// Try to build the output's state for `mode` in `pending`.
    ///
    /// Returns `None` if the mode does not work out. The output state is left
    /// in `pending` either way.
    pub(super) fn run(
        &mut self,
        pending: &mut PendingState,
        mode: PlannerMode,
        views: &[(ViewKey, &View)],
        decisions: &mut [ViewDecision],
    ) -> Result<Option<Outcome>, Error> {
        let device = self.device;
        let mut state = match mode {
            PlannerMode::PlanesOnly | PlannerMode::RendererOnly => {
                self.output.state_cur.duplicate(DuplicateMode::ClearPlanes)
            }
            PlannerMode::Mixed => {
                // keep the renderer framebuffer on the primary plane
                let mut state = self.output.state_cur.duplicate(DuplicateMode::PreservePlanes);
                state
                    .planes
                    .iter_mut()
                    .filter(|plane| plane.kind != PlaneType::Primary)
                    .for_each(PlaneState::reset);
                state
            }
        };
        state.protection = self.output.desired_protection;
        pending.insert(state);

        let planes = device.planes_for_crtc(self.output.crtc())?;
        let primary_zpos = planes
            .iter()
            .find(|plane| plane.kind == PlaneType::Primary)
            .map(|plane| plane.zpos_min)
            .unwrap_or(i32::MIN);
        let mut frame = Frame {
            planes,
            geometry: self.output.geometry(),
            lowest_zpos: i32::MAX,
            primary_zpos,
            renderer_region: Region::new(),
            cursor: None,
        };
        let mut occluded = Region::<i32, Physical>::new();
        let mut placed = Vec::new();

        for (idx, ((key, view), decision)) in views.iter().zip(decisions.iter_mut()).enumerate() {
            if !view.transform.valid {
                trace!(view = ?key, "skipping view without valid transform");
                continue;
            }
            let Some(clipped) = view
                .geometry
                .intersection(frame.geometry)
                .and_then(|rect| match view.scissor {
                    Some(scissor) => rect.intersection(scissor),
                    None => Some(rect),
                })
            else {
                continue;
            };
            if occluded.covers(clipped) {
                trace!(view = ?key, "skipping occluded view");
                continue;
            }

            match self.place_view(pending, mode, *key, view, clipped, &mut frame) {
                Ok(zpos) => {
                    frame.lowest_zpos = zpos;
                    decision.failure_reasons = FailureReasons::empty();
                    placed.push(idx);
                }
                Err(reasons) => {
                    decision.failure_reasons |= reasons;
                    if mode == PlannerMode::PlanesOnly {
                        trace!(view = ?key, ?reasons, "view needs the renderer");
                        return Ok(None);
                    }
                    frame.renderer_region.add_rect(clipped);
                }
            }

            if view.alpha >= 1.0 {
                let mut opaque = view.opaque.clone();
                opaque.intersect_rect(clipped);
                occluded.union(&opaque);
            }
        }

        let state = pending
            .output_state(self.key)
            .ok_or(Error::UnknownOutput(self.key))?;
        match mode {
            PlannerMode::PlanesOnly => {
                if !state.plane_of_kind(PlaneType::Primary).is_some_and(PlaneState::is_on) {
                    trace!("no client buffer for the primary plane");
                    return Ok(None);
                }
            }
            PlannerMode::Mixed => {
                let overlays = state
                    .active_planes()
                    .filter(|plane| plane.kind == PlaneType::Overlay)
                    .count();
                if overlays == 0 {
                    return Ok(None);
                }
            }
            PlannerMode::RendererOnly => {}
        }

        if let Err(err) = state.check_zpos() {
            warn!(?err, "planned state is inconsistent");
            return Ok(None);
        }
        if mode != PlannerMode::RendererOnly {
            if let Err(err) = pending.test() {
                trace!(?err, ?mode, "final test commit failed");
                for idx in placed {
                    decisions[idx].failure_reasons |= FailureReasons::PLANES_REJECTED;
                }
                return Ok(None);
            }
        }

        Ok(Some(Outcome { cursor: frame.cursor }))
    }

    /// Find a plane for one view, returning the zpos it got
    fn place_view(
        &mut self,
        pending: &mut PendingState,
        mode: PlannerMode,
        key: ViewKey,
        view: &View,
        clipped: Rectangle<i32, Physical>,
        frame: &mut Frame<'_>,
    ) -> Result<i32, FailureReasons> {
        let buffer = self.scene.view_buffer(view);

        let mut reasons = FailureReasons::empty();
        if view.output_mask != self.output.mask() {
            reasons |= FailureReasons::FORCE_RENDERER;
        }
        if buffer.map_or(true, |(_, buffer)| matches!(buffer.content, BufferContent::Solid(_))) {
            reasons |= FailureReasons::FORCE_RENDERER;
        }
        if !view.color_transform.is_identity() {
            reasons |= FailureReasons::FORCE_RENDERER;
        }
        if frame.renderer_region.overlaps(clipped) {
            reasons |= FailureReasons::FORCE_RENDERER;
        }
        if view.protection_mode == ProtectionMode::Enforced && view.protection > self.output.current_protection {
            reasons |= FailureReasons::INADEQUATE_CONTENT_PROTECTION;
        }
        if self.registry.importer().is_none() {
            reasons |= FailureReasons::NO_GBM;
        }
        let Some((buffer_key, buffer)) = buffer.filter(|_| reasons.is_empty()) else {
            return Err(reasons);
        };

        if !view.transform.is_axis_aligned() {
            return Err(FailureReasons::INCOMPATIBLE_TRANSFORM);
        }
        if buffer.is_shm() {
            return self.place_cursor(pending, mode, key, view, buffer_key, buffer, frame);
        }
        if mode == PlannerMode::RendererOnly {
            return Err(FailureReasons::empty());
        }

        let fb = self
            .registry
            .import(self.device, buffer_key, buffer, view.is_opaque_over(view.geometry))?;
        let src = source_rect(view, buffer, clipped);
        let dst = Rectangle::new(clipped.loc - frame.geometry.loc, clipped.size);

        for plane in frame.planes.iter().filter(|plane| plane.kind != PlaneType::Cursor) {
            if !fb.supports_plane(plane.index) || !slot_is_free(pending, self.key, plane.handle) {
                continue;
            }
            let zpos = match plane.kind {
                PlaneType::Primary => {
                    if mode != PlannerMode::PlanesOnly
                        || view.geometry != frame.geometry
                        || plane.zpos_min >= frame.lowest_zpos
                    {
                        continue;
                    }
                    plane.zpos_min
                }
                _ => {
                    if !self.config.overlay_planes {
                        continue;
                    }
                    match frame.next_zpos(plane) {
                        Some(zpos) => zpos,
                        None => continue,
                    }
                }
            };
            if view.acquire_fence.is_some() && !plane.supports_fences() {
                trace!(plane = ?plane.handle, "plane cannot wait for fences");
                continue;
            }
            if view.alpha < 1.0 && (plane.kind == PlaneType::Primary || !plane.supports_alpha()) {
                reasons |= FailureReasons::GLOBAL_ALPHA;
                continue;
            }

            let placed = try_plane(pending, self.key, plane.handle, true, |slot| {
                slot.fb = Some(fb.clone());
                slot.src = src;
                slot.dst = dst;
                slot.zpos = zpos;
                slot.alpha = view.alpha;
                slot.in_fence = view.acquire_fence.clone();
                slot.damage = view.damage.rects().to_vec();
                slot.buffer = Some(buffer.lock());
                slot.view = Some(key);
            });
            match placed {
                Ok(()) => {
                    trace!(view = ?key, plane = ?plane.handle, zpos, "view placed on plane");
                    return Ok(zpos);
                }
                Err(rejected) => reasons |= rejected,
            }
        }

        if reasons.is_empty() {
            reasons = FailureReasons::NO_PLANES_AVAILABLE;
        }
        Err(reasons)
    }

    #[allow(clippy::too_many_arguments)]
    fn place_cursor(
        &mut self,
        pending: &mut PendingState,
        mode: PlannerMode,
        key: ViewKey,
        view: &View,
        buffer_key: BufferKey,
        buffer: &Buffer,
        frame: &mut Frame<'_>,
    ) -> Result<i32, FailureReasons> {
        let Some(plane) = frame.planes.iter().copied().find(|plane| plane.kind == PlaneType::Cursor) else {
            return Err(FailureReasons::NO_PLANES_AVAILABLE);
        };
        let Some(ring) = self.output.cursor.as_ref().filter(|_| self.config.cursor_plane) else {
            return Err(FailureReasons::NO_PLANES_AVAILABLE);
        };
        if !slot_is_free(pending, self.key, plane.handle) {
            return Err(FailureReasons::NO_PLANES_AVAILABLE);
        }
        if buffer.format() != Some(Fourcc::Argb8888) {
            return Err(FailureReasons::FB_FORMAT_INCOMPATIBLE);
        }
        let size = ring.size();
        if buffer.size.w > size.w || buffer.size.h > size.h {
            trace!(buffer = ?buffer.size, cursor = ?size, "buffer too large for the cursor plane");
            return Err(FailureReasons::NO_PLANES_AVAILABLE);
        }
        let full = Rectangle::from_size(buffer.size.to_f64());
        if view.geometry.size.w != buffer.size.w
            || view.geometry.size.h != buffer.size.h
            || view.src.is_some_and(|src| src != full)
        {
            return Err(FailureReasons::INCOMPATIBLE_TRANSFORM);
        }
        if view.alpha < 1.0 {
            return Err(FailureReasons::GLOBAL_ALPHA);
        }
        let zpos = frame.next_zpos(plane).ok_or(FailureReasons::NO_PLANES_AVAILABLE)?;

        let update = ring.prepare(key, !view.damage.is_empty());
        let fb = ring.fb(update.slot);
        let dst = Rectangle::new(view.geometry.loc - frame.geometry.loc, size);
        try_plane(pending, self.key, plane.handle, mode != PlannerMode::RendererOnly, |slot| {
            // the whole ring buffer is scanned out, the image is padded on upload
            slot.fb = Some(fb);
            slot.src = Rectangle::from_size((size.w as f64, size.h as f64).into());
            slot.dst = dst;
            slot.zpos = zpos;
            slot.alpha = 1.0;
            slot.view = Some(key);
        })?;

        trace!(view = ?key, slot = update.slot, needs_upload = update.needs_upload, "cursor placed");
        frame.cursor = Some(CursorPlacement {
            view: key,
            update,
            buffer: buffer_key,
            size: buffer.size,
        });
        Ok(zpos)
    }
}

fn slot_is_free(pending: &PendingState, output: OutputKey, plane: plane::Handle) -> bool {
    !pending.plane_claimed_elsewhere(output, plane)
        && pending
            .output_state(output)
            .and_then(|state| state.plane(plane))
            .is_some_and(PlaneState::is_free)
}

/// Fill a plane slot and optionally test the result, giving the slot back on rejection
fn try_plane(
    pending: &mut PendingState,
    output: OutputKey,
    plane: plane::Handle,
    test: bool,
    fill: impl FnOnce(&mut PlaneState),
) -> Result<(), FailureReasons> {
    let slot = pending
        .output_state_mut(output)
        .and_then(|state| state.plane_mut(plane))
        .ok_or(FailureReasons::NO_PLANES_AVAILABLE)?;
    fill(slot);
    if !test {
        return Ok(());
    }
    pending.test().map_err(|err| {
        trace!(?plane, ?err, "plane rejected by test commit");
        if let Some(state) = pending.output_state_mut(output) {
            state.put_back(plane);
        }
        FailureReasons::PLANES_REJECTED
    })
}

/// Part of the buffer visible through `clipped`
fn source_rect(view: &View, buffer: &Buffer, clipped: Rectangle<i32, Physical>) -> Rectangle<f64, BufferCoords> {
    let full = view
        .src
        .unwrap_or_else(|| Rectangle::from_size(buffer.size.to_f64()));
    if clipped == view.geometry {
        return full;
    }
    let sx = full.size.w / view.geometry.size.w as f64;
    let sy = full.size.h / view.geometry.size.h as f64;
    let dx = (clipped.loc.x - view.geometry.loc.x) as f64;
    let dy = (clipped.loc.y - view.geometry.loc.y) as f64;
    Rectangle::new(
        (full.loc.x + dx * sx, full.loc.y + dy * sy).into(),
        (clipped.size.w as f64 * sx, clipped.size.h as f64 * sy).into(),
    )
}

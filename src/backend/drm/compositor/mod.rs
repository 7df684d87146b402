//! Frame by frame plane assignment
//!
//! The [`DrmCompositor`] owns the outputs of a [`DrmDevice`] and drives the
//! repaint transaction: [`repaint_begin`](DrmCompositor::repaint_begin)
//! opens a [`PendingState`], [`assign_planes`](DrmCompositor::assign_planes)
//! plans every output into it and [`repaint_flush`](DrmCompositor::repaint_flush)
//! commits it.
//!
//! Planning tries three strategies per output, from most to least
//! efficient:
//!
//! - [`PlannerMode::PlanesOnly`]: every visible view is put on a plane, the
//!   renderer is not needed at all. Requires a client buffer covering the
//!   whole output for the primary plane.
//! - [`PlannerMode::Mixed`]: the primary plane keeps showing renderer output
//!   and selected views are lifted onto overlay planes above it.
//! - [`PlannerMode::RendererOnly`]: the renderer draws everything, only the
//!   cursor plane may still be used.
//!
//! Every view ends up with a [`ViewDecision`]. Views that went to the
//! renderer carry the [`FailureReasons`] explaining why, which drive the
//! dma-buf feedback of [`update_feedback`](DrmCompositor::update_feedback).

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use drm::control::{plane, PlaneType};
use slotmap::SlotMap;
use tracing::{debug, info_span, instrument, trace, warn};

use super::cursor::CursorRing;
use super::device::DrmDevice;
use super::error::Error;
use super::fb::{Framebuffer, FramebufferRegistry};
use super::feedback::{FeedbackUpdate, ScanoutFeedback};
use super::gbm::BufferImporter;
use super::output::{Output, OutputInfo, OutputKey, PlannerMode};
use super::state::{OutputState, PendingState};
use super::{FailureReasons, PlannerConfig, PresentationFlags};
use crate::backend::allocator::format::FormatSet;
use crate::backend::renderer::RenderDecision;
use crate::scene::{BufferContent, BufferKey, ProtectionLevel, Scene, ViewKey};
use crate::utils::Rectangle;

mod planner;

/// Where a view ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Scanned out from a plane
    Plane {
        /// The plane
        plane: plane::Handle,
        /// Type of the plane
        kind: PlaneType,
    },
    /// Drawn by the renderer into the primary plane
    Renderer,
}

/// Outcome of planning for one view
#[derive(Debug, Clone, PartialEq)]
pub struct ViewDecision {
    /// The view
    pub view: ViewKey,
    /// The output planned for
    pub output: OutputKey,
    /// Where the view is shown
    pub placement: Placement,
    /// Why the view is not on a plane; empty if it is
    pub failure_reasons: FailureReasons,
    /// Presentation-feedback flags for the view
    pub presentation: PresentationFlags,
    /// Instructions for the renderer, `None` for views on planes
    pub render: Option<RenderDecision>,
}

impl ViewDecision {
    fn new(view: ViewKey, output: OutputKey) -> Self {
        ViewDecision {
            view,
            output,
            placement: Placement::Renderer,
            failure_reasons: FailureReasons::empty(),
            presentation: PresentationFlags::empty(),
            render: None,
        }
    }

    /// Whether the view is scanned out from a plane
    pub fn is_on_plane(&self) -> bool {
        matches!(self.placement, Placement::Plane { .. })
    }
}

/// Move a view to a plane or to the renderer, updating its presentation flags.
///
/// Only non-cursor planes scan the client buffer itself, cursor images are copied.
pub fn move_view(decision: &mut ViewDecision, placement: Placement) {
    match placement {
        Placement::Plane { kind, .. } if kind != PlaneType::Cursor => {
            decision.presentation.insert(PresentationFlags::ZERO_COPY)
        }
        _ => decision.presentation.remove(PresentationFlags::ZERO_COPY),
    }
    decision.placement = placement;
}

/// Plane assignment for all outputs of one device
#[derive(Debug)]
pub struct DrmCompositor {
    device: Rc<DrmDevice>,
    registry: FramebufferRegistry,
    outputs: SlotMap<OutputKey, Output>,
    pending: Option<PendingState>,
    config: PlannerConfig,
    renderer_formats: FormatSet,
    feedback: HashMap<ViewKey, ScanoutFeedback>,
    span: tracing::Span,
}

impl DrmCompositor {
    /// Plan for `device`, importing client buffers through `importer`.
    ///
    /// Without an importer every view except shm cursors is drawn by the renderer.
    pub fn new(device: Rc<DrmDevice>, importer: Option<Box<dyn BufferImporter>>, config: PlannerConfig) -> Self {
        let span = info_span!(parent: &device.span, "drm_compositor");
        DrmCompositor {
            device,
            registry: FramebufferRegistry::new(importer),
            outputs: SlotMap::with_key(),
            pending: None,
            config,
            renderer_formats: FormatSet::default(),
            feedback: HashMap::new(),
            span,
        }
    }

    /// The device planned for
    pub fn device(&self) -> &Rc<DrmDevice> {
        &self.device
    }

    /// The tunables
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Change the tunables, effective with the next frame
    pub fn set_config(&mut self, config: PlannerConfig) {
        self.config = config;
    }

    /// Formats the renderer can sample from, advertised in dma-buf feedback
    pub fn set_renderer_formats(&mut self, formats: FormatSet) {
        self.renderer_formats = formats;
        self.feedback.clear();
    }

    /// The framebuffer cache
    pub fn registry(&self) -> &FramebufferRegistry {
        &self.registry
    }

    /// Start driving a crtc
    #[instrument(level = "debug", skip_all, parent = &self.span, fields(crtc = ?info.crtc))]
    pub fn add_output(&mut self, info: OutputInfo) -> Result<OutputKey, Error> {
        let planes = self.device.planes_for_crtc(info.crtc)?;
        let used = self.outputs.values().fold(0u32, |mask, output| mask | output.mask());
        let id = (0..u32::BITS)
            .find(|id| used & (1 << id) == 0)
            .ok_or(Error::TooManyOutputs(u32::BITS))?;

        let cursor = match (self.config.cursor_plane, self.registry.importer()) {
            (true, Some(importer)) if planes.iter().any(|p| p.kind == PlaneType::Cursor) => {
                match CursorRing::new(&self.device, importer) {
                    Ok(ring) => Some(ring),
                    Err(err) => {
                        warn!(?err, "failed to allocate cursor buffers, cursor plane disabled");
                        None
                    }
                }
            }
            _ => None,
        };

        let key = self.outputs.insert_with_key(|key| {
            Output {
                id,
                state_cur: OutputState::new(key, info.crtc, info.connectors.clone(), &planes),
                info,
                state_last: None,
                cursor,
                dummy_fb: None,
                current_protection: ProtectionLevel::Undesired,
                desired_protection: ProtectionLevel::Undesired,
                page_flip_pending: false,
                mode: None,
            }
        });
        debug!(?key, id, planes = planes.len(), "added output");
        Ok(key)
    }

    /// Stop driving an output
    pub fn remove_output(&mut self, output: OutputKey) -> Option<Output> {
        if let Some(pending) = self.pending.as_mut() {
            pending.remove_output_state(output);
        }
        self.outputs.remove(output)
    }

    /// Look up an output
    pub fn output(&self, output: OutputKey) -> Option<&Output> {
        self.outputs.get(output)
    }

    /// Every output
    pub fn outputs(&self) -> impl Iterator<Item = (OutputKey, &Output)> {
        self.outputs.iter()
    }

    fn output_mut(&mut self, output: OutputKey) -> Result<&mut Output, Error> {
        self.outputs.get_mut(output).ok_or(Error::UnknownOutput(output))
    }

    /// Record the protection the link of an output currently provides
    pub fn set_current_protection(&mut self, output: OutputKey, level: ProtectionLevel) -> Result<(), Error> {
        self.output_mut(output)?.current_protection = level;
        Ok(())
    }

    /// Protection to request for an output with the next commit
    pub fn set_desired_protection(&mut self, output: OutputKey, level: ProtectionLevel) -> Result<(), Error> {
        self.output_mut(output)?.desired_protection = level;
        Ok(())
    }

    /// Set or clear the view remembered on an output's cursor plane
    pub fn set_cursor_view(&mut self, output: OutputKey, view: Option<ViewKey>) -> Result<(), Error> {
        if let Some(ring) = self.output_mut(output)?.cursor.as_mut() {
            ring.set_view(view);
        }
        Ok(())
    }

    /// Open a repaint transaction, dropping one left over from a previous frame
    pub fn repaint_begin(&mut self) {
        if let Some(stale) = self.pending.replace(PendingState::new(self.device.clone())) {
            debug!("dropping unfinished repaint");
            stale.free();
        }
    }

    /// Drop the repaint transaction
    pub fn repaint_cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.free();
        }
    }

    /// Plan one output into the open transaction.
    ///
    /// Returns a decision for every view of `scene` touching the output, in
    /// paint order. Per-view failures never fail the call; at worst every
    /// view is left to the renderer.
    #[instrument(level = "trace", skip_all, parent = &self.span, fields(output = ?output))]
    #[profiling::function]
    pub fn assign_planes(&mut self, output: OutputKey, scene: &Scene) -> Result<Vec<ViewDecision>, Error> {
        let pending = self.pending.as_mut().ok_or(Error::NoPendingState)?;
        let out = self.outputs.get_mut(output).ok_or(Error::UnknownOutput(output))?;

        // the cursor view may have been destroyed since the last frame
        if let Some(ring) = out.cursor.as_mut() {
            if ring.view().is_some_and(|view| scene.view(view).is_none()) {
                ring.clear_view();
            }
        }

        let views = scene
            .paint_order()
            .filter(|(_, view)| view.output_mask & out.mask() != 0)
            .collect::<Vec<_>>();
        let mut decisions = views
            .iter()
            .map(|(key, _)| ViewDecision::new(*key, output))
            .collect::<Vec<_>>();

        let modes: &[PlannerMode] = if self.config.direct_scanout {
            &[PlannerMode::PlanesOnly, PlannerMode::Mixed, PlannerMode::RendererOnly]
        } else {
            &[PlannerMode::RendererOnly]
        };

        let mut chosen = None;
        for &mode in modes {
            if mode == PlannerMode::Mixed && !out.has_renderer_primary() {
                trace!("no renderer output on the primary plane, skipping mixed mode");
                continue;
            }
            let mut planner = planner::Planner {
                device: &self.device,
                registry: &mut self.registry,
                config: &self.config,
                output: &mut *out,
                key: output,
                scene,
            };
            match planner.run(pending, mode, &views, &mut decisions)? {
                Some(outcome) => {
                    chosen = Some((mode, outcome));
                    break;
                }
                None => {
                    trace!(?mode, "mode rejected");
                    pending.remove_output_state(output);
                }
            }
        }
        let (mode, outcome) = chosen.ok_or(Error::UnknownOutput(output))?;
        if out.mode != Some(mode) {
            debug!(?mode, "planner mode changed");
        }
        out.mode = Some(mode);

        let state = pending.output_state(output).ok_or(Error::UnknownOutput(output))?;
        for (decision, (_, view)) in decisions.iter_mut().zip(&views) {
            match state.planes.iter().find(|p| p.is_on() && p.view == Some(decision.view)) {
                Some(plane) => {
                    move_view(
                        decision,
                        Placement::Plane {
                            plane: plane.plane,
                            kind: plane.kind,
                        },
                    );
                    decision.failure_reasons = FailureReasons::empty();
                    decision.render = None;
                }
                None => {
                    move_view(decision, Placement::Renderer);
                    let keep_buffer = match scene.view_buffer(view) {
                        Some((_, buffer)) => buffer.is_shm(),
                        None => true,
                    };
                    let censor = decision
                        .failure_reasons
                        .contains(FailureReasons::INADEQUATE_CONTENT_PROTECTION)
                        .then_some(self.config.censor_color);
                    decision.render = Some(RenderDecision { keep_buffer, censor });
                }
            }
        }

        let cursor_shown = state.plane_of_kind(PlaneType::Cursor).is_some_and(|p| p.is_on());
        if let Some(ring) = out.cursor.as_mut() {
            match outcome.cursor {
                Some(cursor) if cursor_shown => {
                    ring.latch(cursor.view, cursor.update);
                    if cursor.update.needs_upload {
                        if let Some(BufferContent::Shm(shm)) =
                            scene.buffer(cursor.buffer).map(|buffer| &buffer.content)
                        {
                            ring.upload(cursor.update.slot, shm, cursor.size);
                        }
                    }
                }
                _ => ring.clear_view(),
            }
        }

        Ok(decisions)
    }

    /// Attach the rendered framebuffers and commit the transaction.
    ///
    /// Outputs planned without [`PlannerMode::PlanesOnly`] show the
    /// framebuffer given for them on the primary plane, or a black one if
    /// the renderer provided none.
    #[instrument(level = "trace", skip_all, parent = &self.span)]
    #[profiling::function]
    pub fn repaint_flush(&mut self, rendered: impl IntoIterator<Item = (OutputKey, Framebuffer)>) -> Result<(), Error> {
        let mut pending = self.pending.take().ok_or(Error::NoPendingState)?;
        let mut rendered = rendered.into_iter().collect::<HashMap<_, _>>();

        let keys = pending.outputs().iter().map(|state| state.output).collect::<Vec<_>>();
        for key in keys {
            let out = self.outputs.get_mut(key).ok_or(Error::UnknownOutput(key))?;
            if out.mode == Some(PlannerMode::PlanesOnly) {
                continue;
            }
            let state = pending.output_state_mut(key).ok_or(Error::UnknownOutput(key))?;
            let Some(primary) = state.planes.iter_mut().find(|p| p.kind == PlaneType::Primary) else {
                continue;
            };
            let fb = match rendered.remove(&key) {
                Some(fb) => fb,
                None if primary.is_on() => continue,
                None => out.dummy_fb(&self.device)?,
            };
            let zpos = self.device.plane(primary.plane)?.zpos_min;
            let size = fb.size();
            primary.reset();
            primary.src = Rectangle::from_size((size.w as f64, size.h as f64).into());
            primary.dst = Rectangle::from_size(out.mode_size());
            primary.zpos = zpos;
            primary.fb = Some(fb);
        }

        let states = pending.apply()?;
        for state in states {
            if let Some(out) = self.outputs.get_mut(state.output) {
                out.state_last = Some(std::mem::replace(&mut out.state_cur, state));
                out.page_flip_pending = true;
            }
        }
        Ok(())
    }

    /// The page flip of an output completed, release the previous frame
    pub fn frame_submitted(&mut self, output: OutputKey) -> Result<(), Error> {
        let out = self.output_mut(output)?;
        out.state_last = None;
        out.page_flip_pending = false;
        for plane in out.state_cur.planes.iter_mut() {
            plane.complete = true;
        }
        Ok(())
    }

    /// A client buffer was destroyed, drop its framebuffer
    pub fn buffer_destroyed(&mut self, buffer: BufferKey) {
        self.registry.evict(buffer);
    }

    /// Feed the decisions of a frame into the dma-buf feedback of their views.
    ///
    /// Returns the feedback to resend for every view whose scanout tranche
    /// changed.
    pub fn update_feedback(
        &mut self,
        scene: &Scene,
        decisions: &[ViewDecision],
        now: Instant,
    ) -> Vec<(ViewKey, FeedbackUpdate)> {
        self.feedback.retain(|view, _| scene.view(*view).is_some());

        let mut updates = Vec::new();
        for decision in decisions {
            let Some(view) = scene.view(decision.view) else {
                continue;
            };
            if !matches!(
                scene.view_buffer(view).map(|(_, buffer)| &buffer.content),
                Some(BufferContent::Dmabuf(_))
            ) {
                continue;
            }

            if !self.feedback.contains_key(&decision.view) {
                let scanout = self.scanout_formats(decision.output);
                let feedback =
                    ScanoutFeedback::new(self.renderer_formats.clone(), scanout, self.config.feedback_debounce);
                self.feedback.insert(decision.view, feedback);
            }
            let Some(feedback) = self.feedback.get_mut(&decision.view) else {
                continue;
            };
            if let Some(update) = feedback.maybe_update(decision.failure_reasons, now) {
                updates.push((decision.view, update));
            }
        }
        updates
    }

    /// Debounce state of a view's feedback
    pub fn feedback(&self, view: ViewKey) -> Option<&ScanoutFeedback> {
        self.feedback.get(&view)
    }

    fn scanout_formats(&self, output: OutputKey) -> FormatSet {
        let Some(out) = self.outputs.get(output) else {
            return FormatSet::default();
        };
        self.device
            .planes_for_crtc(out.crtc())
            .unwrap_or_default()
            .into_iter()
            .filter(|plane| plane.kind != PlaneType::Cursor)
            .flat_map(|plane| plane.formats.iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::OwnedFd;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::time::Duration;

    use drm::control::{plane, PlaneType};

    use super::*;
    use crate::backend::allocator::dmabuf::tests::dmabuf;
    use crate::backend::allocator::{Format, Fourcc, Modifier};
    use crate::backend::drm::feedback::TrancheAction;
    use crate::backend::drm::props::PlaneProp;
    use crate::backend::drm::test_utils::{test_connector, test_crtc, test_device, MockDevice, MockImporter, TestPlane};
    use crate::scene::{MatrixKind, ProtectionMode, ShmBuffer, View, ViewTransform};
    use crate::utils::{Physical, Region};

    const XRGB: (Fourcc, Modifier) = (Fourcc::Xrgb8888, Modifier::Linear);
    const ARGB: (Fourcc, Modifier) = (Fourcc::Argb8888, Modifier::Linear);

    fn plane_handle(index: u32) -> plane::Handle {
        drm::control::from_u32(100 + index).unwrap()
    }

    fn output_info() -> OutputInfo {
        OutputInfo {
            crtc: test_crtc(),
            connectors: vec![test_connector()],
            position: (0, 0).into(),
            mode_size: (1920, 1080).into(),
        }
    }

    struct Setup {
        kms: Rc<MockDevice>,
        importer: MockImporter,
        compositor: DrmCompositor,
        output: OutputKey,
    }

    fn setup_with(planes: &[TestPlane], config: PlannerConfig) -> Setup {
        let (kms, device) = test_device(planes);
        let importer = MockImporter::default();
        let mut compositor = DrmCompositor::new(Rc::new(device), Some(Box::new(importer.clone())), config);
        let output = compositor.add_output(output_info()).unwrap();
        Setup {
            kms,
            importer,
            compositor,
            output,
        }
    }

    fn setup(planes: &[TestPlane]) -> Setup {
        setup_with(planes, PlannerConfig::default())
    }

    fn dmabuf_view(
        scene: &mut Scene,
        geometry: Rectangle<i32, Physical>,
        (format, modifier): (Fourcc, Modifier),
        opaque: bool,
    ) -> ViewKey {
        let size = geometry.size;
        let buffer = scene.add_buffer(
            BufferContent::Dmabuf(dmabuf(size.w, size.h, format, modifier)),
            (size.w, size.h),
        );
        let mut view = View::new(geometry);
        view.buffer = Some(buffer);
        view.output_mask = 1;
        if opaque {
            view.opaque = Region::from_rect(geometry);
        }
        scene.add_view(view)
    }

    fn shm_view(scene: &mut Scene, geometry: Rectangle<i32, Physical>) -> ViewKey {
        let size = geometry.size;
        let buffer = scene.add_buffer(
            BufferContent::Shm(ShmBuffer {
                format: Fourcc::Argb8888,
                stride: size.w as u32 * 4,
                data: vec![0xff; (size.w * size.h * 4) as usize].into(),
            }),
            (size.w, size.h),
        );
        let mut view = View::new(geometry);
        view.buffer = Some(buffer);
        view.output_mask = 1;
        scene.add_view(view)
    }

    fn fullscreen() -> Rectangle<i32, Physical> {
        Rectangle::from_size((1920, 1080).into())
    }

    fn frame(setup: &mut Setup, scene: &Scene) -> Vec<ViewDecision> {
        setup.compositor.repaint_begin();
        let decisions = setup.compositor.assign_planes(setup.output, scene).unwrap();
        setup.compositor.repaint_flush(std::iter::empty()).unwrap();
        setup.compositor.frame_submitted(setup.output).unwrap();
        decisions
    }

    fn mode(setup: &Setup) -> Option<PlannerMode> {
        setup.compositor.output(setup.output).unwrap().mode()
    }

    #[test]
    fn fullscreen_client_goes_on_the_primary_plane() {
        let mut s = setup(&[TestPlane::primary(&[XRGB])]);
        let mut scene = Scene::new();
        let view = dmabuf_view(&mut scene, fullscreen(), XRGB, true);

        let decisions = frame(&mut s, &scene);
        assert_eq!(decisions.len(), 1);
        let decision = &decisions[0];
        assert_eq!(decision.view, view);
        assert_eq!(
            decision.placement,
            Placement::Plane {
                plane: plane_handle(0),
                kind: PlaneType::Primary
            }
        );
        assert!(decision.failure_reasons.is_empty());
        assert!(decision.presentation.contains(PresentationFlags::ZERO_COPY));
        assert!(decision.render.is_none());
        assert_eq!(mode(&s), Some(PlannerMode::PlanesOnly));

        let zpos_min = s.compositor.device().plane(plane_handle(0)).unwrap().zpos_min;
        let output = s.compositor.output(s.output).unwrap();
        let primary = output.state_cur().plane(plane_handle(0)).unwrap();
        assert_eq!(primary.zpos, zpos_min);
        assert_eq!(primary.view, Some(view));
        assert_eq!(primary.dst, fullscreen());
    }

    #[test]
    fn hud_is_stacked_on_an_overlay_above_the_primary() {
        let mut s = setup(&[TestPlane::primary(&[XRGB]), TestPlane::overlay(&[ARGB])]);
        let mut scene = Scene::new();
        let background = dmabuf_view(&mut scene, fullscreen(), XRGB, true);
        let hud = dmabuf_view(&mut scene, Rectangle::new((10, 10).into(), (256, 64).into()), ARGB, false);

        let decisions = frame(&mut s, &scene);
        assert_eq!(mode(&s), Some(PlannerMode::PlanesOnly));
        assert_eq!(decisions[0].view, hud);
        assert_eq!(decisions[1].view, background);
        assert!(decisions.iter().all(|d| d.is_on_plane() && d.failure_reasons.is_empty()));

        let device = s.compositor.device().clone();
        let overlay_info = device.plane(plane_handle(1)).unwrap();
        let state = s.compositor.output(s.output).unwrap().state_cur();
        let primary = state.plane(plane_handle(0)).unwrap();
        let overlay = state.plane(plane_handle(1)).unwrap();
        assert_eq!(overlay.view, Some(hud));
        assert_eq!(overlay.zpos, (i32::MAX - 1).min(overlay_info.zpos_max));
        assert!(overlay.zpos > primary.zpos);
        assert_eq!(overlay.dst, Rectangle::new((10, 10).into(), (256, 64).into()));
        assert!(state.check_zpos().is_ok());
    }

    #[test]
    fn cursor_is_uploaded_once_and_padded_to_the_plane() {
        let mut s = setup(&[TestPlane::primary(&[XRGB]), TestPlane::cursor(&[ARGB])]);
        let mut scene = Scene::new();
        dmabuf_view(&mut scene, fullscreen(), XRGB, true);
        let cursor = shm_view(&mut scene, Rectangle::new((100, 120).into(), (32, 32).into()));

        let decisions = frame(&mut s, &scene);
        assert_eq!(mode(&s), Some(PlannerMode::PlanesOnly));
        let decision = decisions.iter().find(|d| d.view == cursor).unwrap();
        assert_eq!(
            decision.placement,
            Placement::Plane {
                plane: plane_handle(1),
                kind: PlaneType::Cursor
            }
        );
        assert!(!decision.presentation.contains(PresentationFlags::ZERO_COPY));

        let output = s.compositor.output(s.output).unwrap();
        let state = output.state_cur().plane(plane_handle(1)).unwrap();
        assert_eq!(state.src, Rectangle::from_size((64.0, 64.0).into()));
        assert_eq!(state.dst, Rectangle::new((100, 120).into(), (64, 64).into()));
        assert!(state.buffer.is_none());
        let ring = output.cursor().unwrap();
        assert_eq!(ring.current(), 1);
        assert_eq!(ring.view(), Some(cursor));

        let writes = s.importer.cursor_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 64 * 64 * 4);

        // unchanged and undamaged, the image stays where it is
        let again = frame(&mut s, &scene);
        assert_eq!(
            again.iter().map(|d| d.placement).collect::<Vec<_>>(),
            decisions.iter().map(|d| d.placement).collect::<Vec<_>>()
        );
        assert_eq!(s.compositor.output(s.output).unwrap().cursor().unwrap().current(), 1);
        assert_eq!(s.importer.cursor_writes().len(), 1);
    }

    #[test]
    fn cursor_size_is_bounded_by_the_plane() {
        for (size, accepted) in [(64, true), (65, false)] {
            let mut s = setup(&[TestPlane::primary(&[XRGB]), TestPlane::cursor(&[ARGB])]);
            let mut scene = Scene::new();
            dmabuf_view(&mut scene, fullscreen(), XRGB, true);
            let cursor = shm_view(&mut scene, Rectangle::new((0, 0).into(), (size, size).into()));

            let decisions = frame(&mut s, &scene);
            let decision = decisions.iter().find(|d| d.view == cursor).unwrap();
            assert_eq!(decision.is_on_plane(), accepted, "cursor of {size}px");
            if !accepted {
                assert!(decision.failure_reasons.contains(FailureReasons::NO_PLANES_AVAILABLE));
                // a shm buffer left to the renderer is copied
                assert_eq!(decision.render, Some(RenderDecision::content(true)));
            }
        }
    }

    #[test]
    fn invalid_modifier_goes_to_the_renderer_and_asks_for_scanout_formats() {
        let mut s = setup(&[TestPlane::primary(&[XRGB])]);
        s.compositor
            .set_renderer_formats([XRGB].into_iter().map(|(code, modifier)| Format { code, modifier }).collect());
        let mut scene = Scene::new();
        let view = dmabuf_view(&mut scene, fullscreen(), (Fourcc::Xrgb8888, Modifier::Invalid), true);

        let decisions = frame(&mut s, &scene);
        assert_eq!(mode(&s), Some(PlannerMode::RendererOnly));
        let decision = &decisions[0];
        assert_eq!(decision.placement, Placement::Renderer);
        assert!(decision.failure_reasons.contains(FailureReasons::DMABUF_MODIFIER_INVALID));
        assert_eq!(decision.render, Some(RenderDecision::content(false)));

        let start = Instant::now();
        assert!(s.compositor.update_feedback(&scene, &decisions, start).is_empty());
        assert_eq!(
            s.compositor.feedback(view).unwrap().pending_action(),
            Some((TrancheAction::AddScanoutTranche, start))
        );
        assert!(s
            .compositor
            .update_feedback(&scene, &decisions, start + Duration::from_millis(1999))
            .is_empty());
        let updates = s
            .compositor
            .update_feedback(&scene, &decisions, start + Duration::from_secs(2));
        assert_eq!(updates.len(), 1);
        assert!(updates[0].1.tranches[0].scanout);
    }

    #[test]
    fn enforced_protection_is_censored_on_unprotected_outputs() {
        let mut s = setup(&[TestPlane::primary(&[XRGB])]);
        let mut scene = Scene::new();
        let view = dmabuf_view(&mut scene, fullscreen(), XRGB, true);
        {
            let view = scene.view_mut(view).unwrap();
            view.protection = ProtectionLevel::Enabled;
            view.protection_mode = ProtectionMode::Enforced;
        }

        let decisions = frame(&mut s, &scene);
        let decision = &decisions[0];
        assert!(!decision.is_on_plane());
        assert!(decision
            .failure_reasons
            .contains(FailureReasons::INADEQUATE_CONTENT_PROTECTION));
        assert_eq!(decision.render.unwrap().censor, Some([0.40, 0.0, 0.0, 1.0]));

        s.compositor
            .set_current_protection(s.output, ProtectionLevel::Enabled)
            .unwrap();
        let decisions = frame(&mut s, &scene);
        assert!(decisions[0].is_on_plane());
    }

    #[test]
    fn rejected_overlay_falls_back_through_every_mode() {
        let (kms, device) = test_device(&[TestPlane::primary(&[XRGB]), TestPlane::overlay(&[ARGB])]);
        let overlay = plane_handle(1);
        let fb_id = device.plane(overlay).unwrap().props.handle(PlaneProp::FbId).unwrap();
        kms.reject_when(move |req| req.get(overlay, fb_id).is_some_and(|fb| fb != 0));
        let mut compositor = DrmCompositor::new(
            Rc::new(device),
            Some(Box::new(MockImporter::default())),
            PlannerConfig::default(),
        );
        let output = compositor.add_output(output_info()).unwrap();
        let mut s = Setup {
            kms,
            importer: MockImporter::default(),
            compositor,
            output,
        };

        let mut scene = Scene::new();
        let view = dmabuf_view(&mut scene, Rectangle::new((10, 10).into(), (256, 64).into()), ARGB, false);

        // the first frame puts renderer output on the primary plane
        frame(&mut s, &scene);
        assert_eq!(mode(&s), Some(PlannerMode::RendererOnly));
        assert!(s.compositor.output(s.output).unwrap().has_renderer_primary());

        let tests_before = s.kms.test_commits();
        let decisions = frame(&mut s, &scene);
        // one rejected attempt in planes-only mode, one in mixed mode, none after
        assert_eq!(s.kms.test_commits() - tests_before, 2);
        assert_eq!(mode(&s), Some(PlannerMode::RendererOnly));
        let decision = &decisions[0];
        assert_eq!(decision.view, view);
        assert_eq!(decision.placement, Placement::Renderer);
        assert!(decision.failure_reasons.contains(FailureReasons::PLANES_REJECTED));
        assert!(!decision.presentation.contains(PresentationFlags::ZERO_COPY));
    }

    #[test]
    fn overlay_is_used_over_renderer_output() {
        let mut s = setup(&[TestPlane::primary(&[XRGB]), TestPlane::overlay(&[ARGB])]);
        let mut scene = Scene::new();
        let video = dmabuf_view(&mut scene, Rectangle::new((10, 10).into(), (256, 64).into()), ARGB, false);

        frame(&mut s, &scene);
        assert_eq!(mode(&s), Some(PlannerMode::RendererOnly));

        let decisions = frame(&mut s, &scene);
        assert_eq!(mode(&s), Some(PlannerMode::Mixed));
        assert_eq!(decisions[0].view, video);
        assert_eq!(
            decisions[0].placement,
            Placement::Plane {
                plane: plane_handle(1),
                kind: PlaneType::Overlay
            }
        );
        let state = s.compositor.output(s.output).unwrap().state_cur();
        assert!(state.plane(plane_handle(0)).unwrap().is_on());
        assert!(state.check_zpos().is_ok());
    }

    #[test]
    fn only_an_exact_fit_uses_the_primary_plane() {
        for (size, fits) in [((1920, 1080), true), ((1921, 1080), false), ((1919, 1080), false), ((1920, 1079), false)] {
            let mut s = setup(&[TestPlane::primary(&[XRGB])]);
            let mut scene = Scene::new();
            dmabuf_view(&mut scene, Rectangle::from_size(size.into()), XRGB, true);

            let decisions = frame(&mut s, &scene);
            assert_eq!(decisions[0].is_on_plane(), fits, "view of {size:?}");
            if !fits {
                assert_eq!(mode(&s), Some(PlannerMode::RendererOnly));
                assert!(decisions[0]
                    .failure_reasons
                    .contains(FailureReasons::NO_PLANES_AVAILABLE));
            }
        }
    }

    #[test]
    fn disabled_direct_scanout_never_tests() {
        let mut s = setup_with(
            &[TestPlane::primary(&[XRGB])],
            PlannerConfig::default().use_direct_scanout(false),
        );
        let mut scene = Scene::new();
        dmabuf_view(&mut scene, fullscreen(), XRGB, true);

        let decisions = frame(&mut s, &scene);
        assert_eq!(mode(&s), Some(PlannerMode::RendererOnly));
        assert_eq!(decisions[0].placement, Placement::Renderer);
        assert!(decisions[0].failure_reasons.is_empty());
        assert_eq!(s.kms.test_commits(), 0);
        assert_eq!(s.kms.commits().len(), 1);
    }

    #[test]
    fn views_without_scanout_path_are_forced_to_the_renderer() {
        let mut s = setup(&[TestPlane::primary(&[XRGB]), TestPlane::overlay(&[ARGB, XRGB])]);
        let mut scene = Scene::new();
        let solid = scene.add_buffer(BufferContent::Solid([1.0, 0.0, 0.0, 1.0]), (1, 1));
        let mut view = View::new(Rectangle::new((0, 0).into(), (100, 100).into()));
        view.buffer = Some(solid);
        view.output_mask = 1;
        let solid_view = scene.add_view(view);

        let spanning = dmabuf_view(&mut scene, Rectangle::new((500, 500).into(), (64, 64).into()), ARGB, false);
        scene.view_mut(spanning).unwrap().output_mask = 0b11;

        let decisions = frame(&mut s, &scene);
        for key in [solid_view, spanning] {
            let decision = decisions.iter().find(|d| d.view == key).unwrap();
            assert_eq!(decision.placement, Placement::Renderer);
            assert!(decision.failure_reasons.contains(FailureReasons::FORCE_RENDERER));
        }
    }

    #[test]
    fn translucent_views_need_an_alpha_plane() {
        let mut s = setup(&[TestPlane::primary(&[XRGB]), TestPlane::overlay(&[ARGB])]);
        let mut scene = Scene::new();
        let view = dmabuf_view(&mut scene, Rectangle::new((10, 10).into(), (256, 64).into()), ARGB, false);
        scene.view_mut(view).unwrap().alpha = 0.5;

        frame(&mut s, &scene);
        let decisions = frame(&mut s, &scene);
        assert_eq!(decisions[0].placement, Placement::Renderer);
        assert!(decisions[0].failure_reasons.contains(FailureReasons::GLOBAL_ALPHA));

        let mut s = setup(&[TestPlane::primary(&[XRGB]), TestPlane::overlay(&[ARGB]).alpha()]);
        frame(&mut s, &scene);
        let decisions = frame(&mut s, &scene);
        assert!(decisions[0].is_on_plane());
        let state = s.compositor.output(s.output).unwrap().state_cur();
        assert_eq!(state.plane(plane_handle(1)).unwrap().alpha, 0.5);
    }

    #[test]
    fn occluded_views_are_left_alone() {
        let mut s = setup(&[TestPlane::primary(&[XRGB]), TestPlane::overlay(&[ARGB])]);
        let mut scene = Scene::new();
        let hidden = dmabuf_view(&mut scene, Rectangle::new((10, 10).into(), (64, 64).into()), ARGB, false);
        dmabuf_view(&mut scene, fullscreen(), XRGB, true);

        let decisions = frame(&mut s, &scene);
        assert_eq!(mode(&s), Some(PlannerMode::PlanesOnly));
        let hidden = decisions.iter().find(|d| d.view == hidden).unwrap();
        assert_eq!(hidden.placement, Placement::Renderer);
        assert!(hidden.failure_reasons.is_empty());
        let state = s.compositor.output(s.output).unwrap().state_cur();
        assert!(!state.plane(plane_handle(1)).unwrap().is_on());
    }

    #[test]
    fn framebuffers_are_released_with_the_last_state() {
        let mut s = setup(&[TestPlane::primary(&[XRGB])]);
        let mut scene = Scene::new();
        let view = dmabuf_view(&mut scene, fullscreen(), XRGB, true);
        let buffer = scene.view(view).unwrap().buffer.unwrap();

        s.compositor.repaint_begin();
        s.compositor.assign_planes(s.output, &scene).unwrap();
        assert!(scene.buffer(buffer).unwrap().is_busy());
        s.compositor.repaint_flush(std::iter::empty()).unwrap();
        s.compositor.frame_submitted(s.output).unwrap();
        assert_eq!(s.kms.live_framebuffers(), 1);

        scene.remove_view(view);
        s.compositor.repaint_begin();
        s.compositor.assign_planes(s.output, &scene).unwrap();
        s.compositor.repaint_flush(std::iter::empty()).unwrap();
        // the old state waits for the page flip, the dummy framebuffer is shown
        assert_eq!(s.kms.live_framebuffers(), 2);
        assert!(scene.buffer(buffer).unwrap().is_busy());

        s.compositor.frame_submitted(s.output).unwrap();
        assert!(!scene.buffer(buffer).unwrap().is_busy());
        s.compositor.buffer_destroyed(buffer);
        assert!(s.compositor.registry().is_empty());
        assert_eq!(s.kms.live_framebuffers(), 1);
    }

    #[test]
    fn planning_needs_an_open_transaction() {
        let mut s = setup(&[TestPlane::primary(&[XRGB])]);
        let scene = Scene::new();
        assert!(matches!(
            s.compositor.assign_planes(s.output, &scene),
            Err(Error::NoPendingState)
        ));
        s.compositor.repaint_begin();
        s.compositor.repaint_cancel();
        assert!(matches!(
            s.compositor.repaint_flush(std::iter::empty()),
            Err(Error::NoPendingState)
        ));
    }

    #[test]
    fn cursor_planes_never_claim_zero_copy() {
        let mut decision = ViewDecision::new(ViewKey::default(), OutputKey::default());
        move_view(
            &mut decision,
            Placement::Plane {
                plane: plane_handle(0),
                kind: PlaneType::Overlay,
            },
        );
        assert!(decision.presentation.contains(PresentationFlags::ZERO_COPY));
        move_view(
            &mut decision,
            Placement::Plane {
                plane: plane_handle(2),
                kind: PlaneType::Cursor,
            },
        );
        assert!(decision.presentation.is_empty());
        move_view(&mut decision, Placement::Renderer);
        assert!(decision.presentation.is_empty());
    }

    #[test]
    fn fenced_views_need_a_plane_that_waits_for_fences() {
        let mut scene = Scene::new();
        let hud = dmabuf_view(&mut scene, Rectangle::new((10, 10).into(), (256, 64).into()), ARGB, false);
        let fence = std::fs::File::open("/dev/null").unwrap();
        scene.view_mut(hud).unwrap().acquire_fence = Some(Arc::new(OwnedFd::from(fence)));

        let mut s = setup(&[TestPlane::primary(&[XRGB]), TestPlane::overlay(&[ARGB])]);
        frame(&mut s, &scene);
        let decisions = frame(&mut s, &scene);
        assert_eq!(mode(&s), Some(PlannerMode::RendererOnly));
        assert_eq!(decisions[0].placement, Placement::Renderer);
        assert!(decisions[0]
            .failure_reasons
            .contains(FailureReasons::NO_PLANES_AVAILABLE));

        let mut s = setup(&[TestPlane::primary(&[XRGB]), TestPlane::overlay(&[ARGB]).fences()]);
        frame(&mut s, &scene);
        let decisions = frame(&mut s, &scene);
        assert_eq!(mode(&s), Some(PlannerMode::Mixed));
        assert!(decisions[0].is_on_plane());
        let state = s.compositor.output(s.output).unwrap().state_cur();
        assert!(state.plane(plane_handle(1)).unwrap().in_fence.is_some());
    }

    #[test]
    fn rotated_views_are_composited() {
        let mut s = setup(&[TestPlane::primary(&[XRGB])]);
        let mut scene = Scene::new();
        let view = dmabuf_view(&mut scene, fullscreen(), XRGB, true);
        scene.view_mut(view).unwrap().transform = ViewTransform {
            enabled: true,
            kind: MatrixKind::Rotate,
            valid: true,
        };

        let decisions = frame(&mut s, &scene);
        assert_eq!(mode(&s), Some(PlannerMode::RendererOnly));
        assert_eq!(decisions[0].placement, Placement::Renderer);
        assert!(decisions[0]
            .failure_reasons
            .contains(FailureReasons::INCOMPATIBLE_TRANSFORM));
        assert_eq!(s.kms.test_commits(), 0);
    }

    #[test]
    fn scaled_or_cropped_cursors_are_composited() {
        let scale = |view: &mut View| view.geometry.size = (48, 48).into();
        let crop = |view: &mut View| view.src = Some(Rectangle::from_size((16.0, 16.0).into()));
        let adjustments: [&dyn Fn(&mut View); 2] = [&scale, &crop];
        for adjust in adjustments {
            let mut s = setup(&[TestPlane::primary(&[XRGB]), TestPlane::cursor(&[ARGB])]);
            let mut scene = Scene::new();
            dmabuf_view(&mut scene, fullscreen(), XRGB, true);
            let cursor = shm_view(&mut scene, Rectangle::new((100, 120).into(), (32, 32).into()));
            adjust(scene.view_mut(cursor).unwrap());

            let decisions = frame(&mut s, &scene);
            let decision = decisions.iter().find(|d| d.view == cursor).unwrap();
            assert_eq!(decision.placement, Placement::Renderer);
            assert!(decision
                .failure_reasons
                .contains(FailureReasons::INCOMPATIBLE_TRANSFORM));
            assert!(s.importer.cursor_writes().is_empty());
        }
    }

    #[test]
    fn output_ids_run_out_after_32_outputs() {
        let mut s = setup(&[TestPlane::primary(&[XRGB])]);
        let mut last = s.output;
        for _ in 1..32 {
            last = s.compositor.add_output(output_info()).unwrap();
        }
        assert_eq!(s.compositor.output(last).unwrap().mask(), 1 << 31);
        assert!(matches!(
            s.compositor.add_output(output_info()),
            Err(Error::TooManyOutputs(32))
        ));

        s.compositor.remove_output(last);
        let again = s.compositor.add_output(output_info()).unwrap();
        assert_eq!(s.compositor.output(again).unwrap().mask(), 1 << 31);
    }
}

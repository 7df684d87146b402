//! Outputs driven by the compositor
//!
//! An [`Output`] is a crtc with its connectors. It owns the state last
//! applied to the kernel, the one before it while its page flip is pending,
//! and the cursor ring.

use drm::control::{connector, crtc, PlaneType};
use slotmap::new_key_type;

use super::cursor::CursorRing;
use super::device::DrmDevice;
use super::error::Error;
use super::fb::{Framebuffer, FramebufferSource};
use super::state::OutputState;
use crate::backend::allocator::Fourcc;
use crate::scene::{ProtectionLevel, ViewKey};
use crate::utils::{Physical, Point, Rectangle, Size};

new_key_type! {
    /// Generational index of an [`Output`]
    pub struct OutputKey;
}

/// Strategy the planner settled on for an output's frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlannerMode {
    /// Every visible view is on a plane, the renderer is not needed
    PlanesOnly,
    /// The renderer draws into the primary plane, some views are on overlays
    Mixed,
    /// The renderer draws every view except the cursor
    RendererOnly,
}

/// Description of an output to drive
#[derive(Debug, Clone)]
pub struct OutputInfo {
    /// Crtc driving the output
    pub crtc: crtc::Handle,
    /// Connectors fed by the crtc
    pub connectors: Vec<connector::Handle>,
    /// Top left corner in global coordinates
    pub position: Point<i32, Physical>,
    /// Size of the current mode
    pub mode_size: Size<i32, Physical>,
}

/// A driven crtc
#[derive(Debug)]
pub struct Output {
    pub(crate) id: u32,
    pub(crate) info: OutputInfo,
    pub(crate) state_cur: OutputState,
    pub(crate) state_last: Option<OutputState>,
    pub(crate) cursor: Option<CursorRing>,
    pub(crate) dummy_fb: Option<Framebuffer>,
    pub(crate) current_protection: ProtectionLevel,
    pub(crate) desired_protection: ProtectionLevel,
    pub(crate) page_flip_pending: bool,
    pub(crate) mode: Option<PlannerMode>,
}

impl Output {
    /// Index of the output's bit in view output masks
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Bit of the output in view output masks
    pub fn mask(&self) -> u32 {
        1 << self.id
    }

    /// Crtc driving the output
    pub fn crtc(&self) -> crtc::Handle {
        self.info.crtc
    }

    /// Area of the output in global coordinates
    pub fn geometry(&self) -> Rectangle<i32, Physical> {
        Rectangle::new(self.info.position, self.info.mode_size)
    }

    /// Size of the current mode
    pub fn mode_size(&self) -> Size<i32, Physical> {
        self.info.mode_size
    }

    /// State shown by the kernel
    pub fn state_cur(&self) -> &OutputState {
        &self.state_cur
    }

    /// Previous state, kept until the page flip completes
    pub fn state_last(&self) -> Option<&OutputState> {
        self.state_last.as_ref()
    }

    /// Cursor ring, if the output has a usable cursor plane
    pub fn cursor(&self) -> Option<&CursorRing> {
        self.cursor.as_ref()
    }

    /// View shown on the cursor plane
    pub fn cursor_view(&self) -> Option<ViewKey> {
        self.cursor.as_ref().and_then(CursorRing::view)
    }

    /// Protection the link currently provides
    pub fn current_protection(&self) -> ProtectionLevel {
        self.current_protection
    }

    /// Whether a commit waits for its page flip
    pub fn page_flip_pending(&self) -> bool {
        self.page_flip_pending
    }

    /// Strategy used for the last planned frame
    pub fn mode(&self) -> Option<PlannerMode> {
        self.mode
    }

    /// Whether the primary plane currently shows renderer output
    pub fn has_renderer_primary(&self) -> bool {
        self.state_cur
            .plane_of_kind(PlaneType::Primary)
            .and_then(|plane| plane.fb.as_ref())
            .map(|fb| matches!(fb.source(), FramebufferSource::Surface | FramebufferSource::Dumb))
            .unwrap_or(false)
    }

    /// Black framebuffer shown when the renderer provides nothing, created on first use
    pub fn dummy_fb(&mut self, device: &DrmDevice) -> Result<Framebuffer, Error> {
        if let Some(fb) = &self.dummy_fb {
            return Ok(fb.clone());
        }
        let fb = Framebuffer::dumb(device, self.info.mode_size, Fourcc::Xrgb8888).map_err(Error::Framebuffer)?;
        self.dummy_fb = Some(fb.clone());
        Ok(fb)
    }
}

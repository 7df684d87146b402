//! Drm/Kms plane planning
//!
//! This module decides, frame by frame, which views of a [`Scene`](crate::scene::Scene)
//! are scanned out directly from hardware planes and which are left to the
//! renderer.
//!
//! ## How to use it
//!
//! Open the drm node, wrap it in a [`DrmDeviceFd`](device::DrmDeviceFd) and probe
//! it into a [`DrmDevice`]. Hand the device, together with an optional
//! [`BufferImporter`](gbm::BufferImporter), to a [`DrmCompositor`] and add an
//! [`Output`](output::Output) for every crtc you drive.
//!
//! Every repaint then follows the same sequence:
//!
//! 1. [`DrmCompositor::repaint_begin`] opens a transaction.
//! 2. [`DrmCompositor::assign_planes`] is called once per output. It returns a
//!    [`ViewDecision`] per view touching the output, telling whether the view
//!    went to a plane or has to be drawn by the renderer, and why.
//! 3. The renderer draws the views that were left to it.
//! 4. [`DrmCompositor::repaint_flush`] attaches the rendered framebuffers and
//!    commits. [`DrmCompositor::repaint_cancel`] drops the transaction instead.
//! 5. On the page-flip event [`DrmCompositor::frame_submitted`] releases the
//!    buffers of the previous frame.
//!
//! The failure flags of the decisions feed [`DrmCompositor::update_feedback`],
//! which tells clients to reallocate their buffers in a scanout capable format
//! when that would help.
//!
//! ```rust,ignore
//! use std::rc::Rc;
//! use scanout_planner::backend::drm::{device::{DrmDevice, DrmDeviceFd}, DrmCompositor, PlannerConfig};
//!
//! let device = Rc::new(DrmDevice::probe(DrmDeviceFd::new(fd)?)?);
//! let mut compositor = DrmCompositor::new(device, Some(Box::new(importer)), PlannerConfig::default());
//! let output = compositor.add_output(info)?;
//!
//! compositor.repaint_begin();
//! let decisions = compositor.assign_planes(output, &scene)?;
//! // draw every view with `Placement::Renderer` into `fb`
//! compositor.repaint_flush([(output, fb)])?;
//! ```

use std::time::Duration;

pub mod compositor;
pub mod cursor;
pub mod device;
mod error;
pub mod fb;
pub mod feedback;
pub mod gbm;
pub mod output;
pub mod props;
pub mod state;
#[cfg(test)]
pub(crate) mod test_utils;

pub use self::compositor::{move_view, DrmCompositor, Placement, ViewDecision};
pub use self::device::DrmDevice;
pub use self::error::{AccessError, Error};
pub use self::output::{OutputKey, PlannerMode};

bitflags::bitflags! {
    /// Why a view could not be placed on a plane
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FailureReasons: u32 {
        /// A precondition rules out every plane
        const FORCE_RENDERER = 1 << 0;
        /// No plane accepts the buffer's format and modifier
        const FB_FORMAT_INCOMPATIBLE = 1 << 1;
        /// The buffer does not disclose its modifier
        const DMABUF_MODIFIER_INVALID = 1 << 2;
        /// The kernel refused to create a framebuffer
        const ADD_FB_FAILED = 1 << 3;
        /// Every candidate plane was taken or unsuitable
        const NO_PLANES_AVAILABLE = 1 << 4;
        /// The kernel rejected a test commit with the view on a plane
        const PLANES_REJECTED = 1 << 5;
        /// The output does not provide the enforced protection
        const INADEQUATE_CONTENT_PROTECTION = 1 << 6;
        /// The view's transformation cannot be expressed by a plane
        const INCOMPATIBLE_TRANSFORM = 1 << 7;
        /// The view is translucent and no plane can blend it
        const GLOBAL_ALPHA = 1 << 8;
        /// No buffer importer is available
        const NO_GBM = 1 << 9;
        /// Importing the buffer failed
        const GBM_BO_IMPORT_FAILED = 1 << 10;
        /// The imported buffer had no usable handle
        const GBM_BO_GET_HANDLE_FAILED = 1 << 11;
    }
}

bitflags::bitflags! {
    /// Presentation-feedback flags of a view
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PresentationFlags: u32 {
        /// The client buffer was scanned out without a copy
        const ZERO_COPY = 1 << 0;
    }
}

/// Tunables of the [`DrmCompositor`]
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerConfig {
    /// Try to scan out client buffers at all
    pub direct_scanout: bool,
    /// Use overlay planes
    pub overlay_planes: bool,
    /// Use the cursor plane
    pub cursor_plane: bool,
    /// How long a feedback change has to be wanted before it is sent
    pub feedback_debounce: Duration,
    /// Colour protected content is replaced with on unprotected outputs
    pub censor_color: [f32; 4],
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            direct_scanout: true,
            overlay_planes: true,
            cursor_plane: true,
            feedback_debounce: Duration::from_secs(2),
            censor_color: [0.40, 0.0, 0.0, 1.0],
        }
    }
}

impl PlannerConfig {
    /// Enable or disable direct scanout.
    ///
    /// This is mostly useful for debugging purposes.
    pub fn use_direct_scanout(mut self, enabled: bool) -> Self {
        self.direct_scanout = enabled;
        self
    }

    /// Enable or disable overlay planes
    pub fn use_overlay_planes(mut self, enabled: bool) -> Self {
        self.overlay_planes = enabled;
        self
    }

    /// Enable or disable the cursor plane
    pub fn use_cursor_plane(mut self, enabled: bool) -> Self {
        self.cursor_plane = enabled;
        self
    }

    /// Set the feedback debounce delay
    pub fn with_feedback_debounce(mut self, delay: Duration) -> Self {
        self.feedback_debounce = delay;
        self
    }

    /// Set the censor colour
    pub fn with_censor_color(mut self, color: [f32; 4]) -> Self {
        self.censor_color = color;
        self
    }
}

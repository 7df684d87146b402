//! Interface between the plane planner and the renderer
//!
//! Views the planner could not put on a plane come back with a
//! [`RenderDecision`] telling the renderer how to draw them. The
//! [`clip`] module holds the polygon clipping renderers use to draw
//! transformed views.

pub mod clip;

/// How the renderer should treat a view left to it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderDecision {
    /// Whether the renderer has to keep its own reference to the buffer.
    ///
    /// `false` for everything except shared memory, whose pixels the
    /// renderer copies and the client may reuse right away.
    pub keep_buffer: bool,
    /// Draw a solid rectangle in this colour instead of the content
    pub censor: Option<[f32; 4]>,
}

impl RenderDecision {
    /// Draw the content as is
    pub fn content(keep_buffer: bool) -> Self {
        RenderDecision {
            keep_buffer,
            censor: None,
        }
    }
}

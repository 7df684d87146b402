//! Interaction with the graphics stack
//!
//! - [`allocator`] describes buffer formats and dma-bufs
//! - [`drm`] plans and commits plane assignments on a drm device
//! - [`renderer`] is the renderer's side of a plan

pub mod allocator;
pub mod drm;
pub mod renderer;

//! Buffer descriptions and format helpers.
//!
//! - [`dmabuf`] describes client provided dma-bufs,
//! - [`format`] holds the static format tables and [`FormatSet`](format::FormatSet).

pub mod dmabuf;
pub mod format;

pub use drm_fourcc::{DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier};

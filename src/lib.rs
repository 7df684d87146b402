#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # scanout-planner: hardware plane assignment for wayland compositors
//!
//! Every frame a compositor has to decide which surfaces the display
//! hardware can show directly and which it has to draw itself. Showing a
//! client buffer on a drm plane saves a full copy and a shader pass, but the
//! kernel only tells whether a particular combination of planes works by
//! testing it. This crate plans those combinations.
//!
//! ## Structure of the crate
//!
//! - [`scene`] holds the views and buffers a compositor wants to show, in
//!   generational arenas.
//! - [`backend::drm`] probes a drm device, imports client buffers as
//!   framebuffers and assigns views to planes with atomic test commits,
//!   falling back to the renderer where needed.
//! - [`backend::renderer`] holds the contract with the renderer and the
//!   clipping of transformed quads renderers use.
//! - [`backend::allocator`] describes buffer formats and dma-bufs.
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging.
//! Planning decisions are logged at `trace` level, mode changes and feedback
//! updates at `debug` level.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod scene;
pub mod utils;

use drm::control::{crtc, plane, RawResourceHandle};
use std::io;
use std::path::PathBuf;

use crate::backend::drm::fb::ImportError;
use crate::backend::drm::OutputKey;

/// Errors thrown by the [`DrmDevice`](crate::backend::drm::DrmDevice)
/// and the [`DrmCompositor`](crate::backend::drm::DrmCompositor).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The device encountered an access error
    #[error(transparent)]
    Access(#[from] AccessError),
    /// The device is missing a required property
    #[error("The DrmDevice is missing a required property '{name}' for handle ({handle:?})")]
    UnknownProperty {
        /// Object handle
        handle: RawResourceHandle,
        /// Property name
        name: &'static str,
    },
    /// The plane is not known to the device
    #[error("Unknown plane `{0:?}`")]
    UnknownPlane(plane::Handle),
    /// The crtc is not known to the device
    #[error("Unknown crtc `{0:?}`")]
    UnknownCrtc(crtc::Handle),
    /// The output was removed
    #[error("Unknown output `{0:?}`")]
    UnknownOutput(OutputKey),
    /// The kernel rejected a test commit
    #[error("Atomic test failed for crtc `{0:?}`")]
    TestFailed(crtc::Handle),
    /// Two planes of one output were given the same zpos
    #[error("Planes `{planes:?}` share zpos {zpos}")]
    DuplicateZpos {
        /// The shared zpos
        zpos: i32,
        /// The clashing planes
        planes: (plane::Handle, plane::Handle),
    },
    /// Every output id bit is taken
    #[error("Too many outputs, at most {0} are supported")]
    TooManyOutputs(u32),
    /// `repaint_flush` or `repaint_cancel` without `repaint_begin`
    #[error("No repaint is in progress")]
    NoPendingState,
    /// A compositor owned framebuffer could not be created
    #[error("Failed to create framebuffer")]
    Framebuffer(#[source] ImportError),
}

/// Error returned when an ioctl on the device fails
#[derive(Debug, thiserror::Error)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source:})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

impl Error {
    /// Whether the kernel refused the configuration, as opposed to a failing device
    pub fn is_rejection(&self) -> bool {
        match self {
            Error::TestFailed(_) | Error::DuplicateZpos { .. } => true,
            Error::Access(err) => err.source.raw_os_error() == Some(libc::EINVAL),
            _ => false,
        }
    }
}

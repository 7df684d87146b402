//! Turning client buffers into buffer objects the kernel can scan out
//!
//! The registry never talks to libgbm directly. It goes through
//! [`BufferImporter`], which has a libgbm implementation behind the
//! `backend_gbm` feature. Without an importer every client buffer is
//! composited by the renderer.

use std::fmt;
use std::io;

use thiserror::Error;

use super::device::FramebufferDesc;
use crate::backend::allocator::dmabuf::Dmabuf;
use crate::scene::OpaqueBuffer;
use crate::utils::{Physical, Size};

/// Errors of a [`BufferImporter`]
#[derive(Debug, Error)]
pub enum GbmImportError {
    /// Importing the buffer failed
    #[error("failed to import the buffer")]
    Import(#[source] io::Error),
    /// The imported buffer did not report usable handles
    #[error("failed to query the buffer object handles")]
    Handle,
    /// The importer does not know how to import this kind of buffer
    #[error("unsupported buffer")]
    Unsupported,
}

/// A buffer object usable for a framebuffer
pub trait ImportedBuffer: fmt::Debug {
    /// Memory layout for `AddFB2`
    fn describe(&self) -> FramebufferDesc;
}

/// A buffer object the cursor bitmap is written into
pub trait CursorBuffer: ImportedBuffer {
    /// Replace the contents; `pixels` covers the whole buffer at its own stride
    fn write(&mut self, pixels: &[u8]) -> io::Result<()>;
}

/// Source of scanout capable buffer objects
pub trait BufferImporter: fmt::Debug {
    /// Import a client dma-buf with `SCANOUT` usage
    fn import_dmabuf(&self, dmabuf: &Dmabuf, with_modifiers: bool) -> Result<Box<dyn ImportedBuffer>, GbmImportError>;
    /// Import a renderer managed client buffer
    fn import_opaque(&self, buffer: &OpaqueBuffer) -> Result<Box<dyn ImportedBuffer>, GbmImportError>;
    /// Allocate a linear ARGB8888 buffer of the cursor plane size
    fn create_cursor_buffer(&self, size: Size<i32, Physical>) -> Result<Box<dyn CursorBuffer>, GbmImportError>;
}

#[cfg(feature = "backend_gbm")]
pub use self::libgbm::GbmImporter;

#[cfg(feature = "backend_gbm")]
mod libgbm {
    use std::io;
    use std::os::unix::io::AsFd;

    use drm::buffer::PlanarBuffer;
    use drm_fourcc::{DrmFourcc, DrmModifier};
    use gbm::{BufferObject, BufferObjectFlags};
    use tracing::trace;

    use super::{BufferImporter, CursorBuffer, GbmImportError, ImportedBuffer};
    use crate::backend::allocator::dmabuf::{Dmabuf, MAX_PLANES};
    use crate::backend::drm::device::FramebufferDesc;
    use crate::scene::OpaqueBuffer;
    use crate::utils::{Physical, Size};

    type OpaqueResolver = Box<dyn Fn(&OpaqueBuffer) -> Option<Dmabuf>>;

    /// [`BufferImporter`] backed by libgbm
    pub struct GbmImporter<A: AsFd + 'static> {
        gbm: gbm::Device<A>,
        opaque: Option<OpaqueResolver>,
    }

    impl<A: AsFd + 'static> std::fmt::Debug for GbmImporter<A> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("GbmImporter")
                .field("opaque", &self.opaque.is_some())
                .finish_non_exhaustive()
        }
    }

    impl<A: AsFd + 'static> GbmImporter<A> {
        /// Import into `gbm`
        pub fn new(gbm: gbm::Device<A>) -> Self {
            GbmImporter { gbm, opaque: None }
        }

        /// Let renderer managed buffers be imported through the dma-buf the renderer exports for them
        pub fn with_opaque_resolver(mut self, resolver: impl Fn(&OpaqueBuffer) -> Option<Dmabuf> + 'static) -> Self {
            self.opaque = Some(Box::new(resolver));
            self
        }
    }

    #[derive(Debug)]
    struct GbmBuffer {
        bo: BufferObject<()>,
        pitches: Option<[u32; 4]>,
        offsets: Option<[u32; 4]>,
        modifier: DrmModifier,
    }

    impl ImportedBuffer for GbmBuffer {
        fn describe(&self) -> FramebufferDesc {
            FramebufferDesc {
                size: PlanarBuffer::size(&self.bo),
                format: PlanarBuffer::format(&self.bo),
                modifier: self.modifier,
                handles: PlanarBuffer::handles(&self.bo),
                // client provided buffers may report wrong values through the bo
                pitches: self.pitches.unwrap_or_else(|| PlanarBuffer::pitches(&self.bo)),
                offsets: self.offsets.unwrap_or_else(|| PlanarBuffer::offsets(&self.bo)),
            }
        }
    }

    impl CursorBuffer for GbmBuffer {
        fn write(&mut self, pixels: &[u8]) -> io::Result<()> {
            match self.bo.write(pixels) {
                Ok(res) => res,
                Err(_) => Err(io::Error::from_raw_os_error(libc::ENODEV)),
            }
        }
    }

    impl<A: AsFd + 'static> GbmImporter<A> {
        fn import(&self, dmabuf: &Dmabuf, with_modifiers: bool) -> Result<GbmBuffer, GbmImportError> {
            let mut fds = [None; MAX_PLANES];
            for (i, fd) in dmabuf.handles().take(MAX_PLANES).enumerate() {
                fds[i] = Some(fd);
            }
            let mut strides = [0i32; MAX_PLANES];
            let mut pitches = [0u32; MAX_PLANES];
            for (i, stride) in dmabuf.strides().take(MAX_PLANES).enumerate() {
                strides[i] = stride as i32;
                pitches[i] = stride;
            }
            let mut offsets = [0i32; MAX_PLANES];
            let mut offsets_u32 = [0u32; MAX_PLANES];
            for (i, offset) in dmabuf.offsets().take(MAX_PLANES).enumerate() {
                offsets[i] = offset as i32;
                offsets_u32[i] = offset;
            }

            let format = dmabuf.format();
            let (w, h) = (dmabuf.size().w as u32, dmabuf.size().h as u32);
            let bo = if with_modifiers {
                self.gbm.import_buffer_object_from_dma_buf_with_modifiers::<()>(
                    dmabuf.num_planes() as u32,
                    fds,
                    w,
                    h,
                    format.code,
                    BufferObjectFlags::SCANOUT,
                    strides,
                    offsets,
                    format.modifier,
                )
            } else {
                let fd = fds[0].ok_or(GbmImportError::Handle)?;
                if dmabuf.num_planes() > 1 {
                    return Err(GbmImportError::Unsupported);
                }
                self.gbm.import_buffer_object_from_dma_buf::<()>(
                    fd,
                    w,
                    h,
                    strides[0] as u32,
                    format.code,
                    BufferObjectFlags::SCANOUT,
                )
            }
            .map_err(GbmImportError::Import)?;

            let buffer = GbmBuffer {
                bo,
                pitches: Some(pitches),
                offsets: Some(offsets_u32),
                modifier: format.modifier,
            };
            if buffer.describe().handles[0].is_none() {
                return Err(GbmImportError::Handle);
            }
            trace!(?format, "imported dmabuf into gbm");
            Ok(buffer)
        }
    }

    impl<A: AsFd + 'static> BufferImporter for GbmImporter<A> {
        fn import_dmabuf(
            &self,
            dmabuf: &Dmabuf,
            with_modifiers: bool,
        ) -> Result<Box<dyn ImportedBuffer>, GbmImportError> {
            self.import(dmabuf, with_modifiers)
                .map(|buffer| Box::new(buffer) as Box<dyn ImportedBuffer>)
        }

        fn import_opaque(&self, buffer: &OpaqueBuffer) -> Result<Box<dyn ImportedBuffer>, GbmImportError> {
            let resolver = self.opaque.as_ref().ok_or(GbmImportError::Unsupported)?;
            let dmabuf = resolver(buffer).ok_or(GbmImportError::Unsupported)?;
            let with_modifiers = dmabuf.format().modifier != DrmModifier::Invalid;
            self.import(&dmabuf, with_modifiers)
                .map(|buffer| Box::new(buffer) as Box<dyn ImportedBuffer>)
        }

        fn create_cursor_buffer(&self, size: Size<i32, Physical>) -> Result<Box<dyn CursorBuffer>, GbmImportError> {
            let bo = self
                .gbm
                .create_buffer_object::<()>(
                    size.w as u32,
                    size.h as u32,
                    DrmFourcc::Argb8888,
                    BufferObjectFlags::CURSOR | BufferObjectFlags::WRITE | BufferObjectFlags::LINEAR,
                )
                .map_err(GbmImportError::Import)?;
            Ok(Box::new(GbmBuffer {
                bo,
                pitches: None,
                offsets: None,
                modifier: DrmModifier::Linear,
            }))
        }
    }
}

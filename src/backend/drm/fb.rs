//! Scanout framebuffers and the per-buffer import cache
//!
//! A [`Framebuffer`] owns one kernel fb id. It is reference counted: the
//! registry keeps one reference per imported client buffer and every
//! [`PlaneState`](super::state::PlaneState) showing it holds another. The fb
//! id is released once the last reference is gone, before the backing buffer
//! object is freed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use drm::buffer;
use drm::control::framebuffer;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use super::device::{DrmDevice, FramebufferDesc, KmsDevice};
use super::error::AccessError;
use super::gbm::{BufferImporter, CursorBuffer, GbmImportError, ImportedBuffer};
use super::FailureReasons;
use crate::backend::allocator::{
    dmabuf::DmabufFlags,
    format::{get_bpp, get_depth, get_opaque},
    Format, Fourcc, Modifier,
};
use crate::scene::{Buffer, BufferContent, BufferKey};
use crate::utils::{Physical, Size};

/// What a framebuffer was created from; decides how it is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FramebufferSource {
    /// Renderer managed client buffer
    Client,
    /// Client dma-buf
    Dmabuf,
    /// Page of the renderer's output
    Surface,
    /// One of the cursor ring buffers
    Cursor,
    /// Dumb buffer allocated by the compositor
    Dumb,
}

pub(crate) enum Backing {
    Imported(Box<dyn ImportedBuffer>),
    Cursor(Rc<RefCell<Box<dyn CursorBuffer>>>),
    Dumb(buffer::Handle),
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::Imported(bo) => f.debug_tuple("Imported").field(bo).finish(),
            Backing::Cursor(bo) => f.debug_tuple("Cursor").field(bo).finish(),
            Backing::Dumb(handle) => f.debug_tuple("Dumb").field(handle).finish(),
        }
    }
}

#[derive(Debug)]
struct FramebufferInner {
    kms: Rc<dyn KmsDevice>,
    handle: framebuffer::Handle,
    format: Format,
    size: Size<i32, Physical>,
    plane_mask: u64,
    source: FramebufferSource,
    backing: Option<Backing>,
}

impl Drop for FramebufferInner {
    fn drop(&mut self) {
        trace!(fb = ?self.handle, source = ?self.source, "destroying framebuffer");
        if let Err(err) = self.kms.destroy_framebuffer(self.handle) {
            warn!(fb = ?self.handle, ?err, "failed to destroy framebuffer");
        }
        if let Some(Backing::Dumb(handle)) = self.backing.take() {
            if let Err(err) = self.kms.destroy_dumb_buffer(handle) {
                warn!(?handle, ?err, "failed to destroy dumb buffer");
            }
        }
    }
}

/// Reference counted kernel framebuffer
#[derive(Debug, Clone)]
pub struct Framebuffer(Rc<FramebufferInner>);

impl PartialEq for Framebuffer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl AsRef<framebuffer::Handle> for Framebuffer {
    fn as_ref(&self) -> &framebuffer::Handle {
        &self.0.handle
    }
}

impl Framebuffer {
    /// Kernel handle
    pub fn handle(&self) -> framebuffer::Handle {
        self.0.handle
    }

    /// Format and modifier the fb was added with
    pub fn format(&self) -> Format {
        self.0.format
    }

    /// Size in pixels
    pub fn size(&self) -> Size<i32, Physical> {
        self.0.size
    }

    /// Bitmask of plane indices able to scan this fb out
    pub fn plane_mask(&self) -> u64 {
        self.0.plane_mask
    }

    /// Whether the plane at `index` can scan this fb out
    pub fn supports_plane(&self, index: usize) -> bool {
        index < 64 && self.0.plane_mask & (1 << index) != 0
    }

    /// What the fb was created from
    pub fn source(&self) -> FramebufferSource {
        self.0.source
    }

    /// Number of live references
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// Add a framebuffer for `desc`.
    ///
    /// With `opaque` set, formats with alpha are added as their opaque variant.
    #[profiling::function]
    pub(crate) fn add(
        device: &DrmDevice,
        desc: FramebufferDesc,
        backing: Backing,
        source: FramebufferSource,
        opaque: bool,
    ) -> Result<Framebuffer, ImportError> {
        let kms = device.kms();
        let mut desc = desc;
        if opaque {
            desc.format = get_opaque(desc.format).unwrap_or(desc.format);
        }

        let mut modifier = desc.modifier;
        let res = if device.supports_fb_modifiers() && desc.modifier != Modifier::Invalid {
            kms.add_framebuffer(&desc, true)
        } else {
            // the kernel picks the layout implicitly, so only INVALID plane entries apply
            modifier = Modifier::Invalid;
            kms.add_framebuffer(&desc, false).or_else(|source| {
                let (Some(depth), Some(bpp)) = (get_depth(desc.format), get_bpp(desc.format)) else {
                    return Err(source);
                };
                if desc.plane_count() > 1 {
                    return Err(source);
                }
                debug!(format = ?desc.format, "AddFB2 failed, falling back to legacy AddFB");
                kms.add_legacy_framebuffer(&desc, depth, bpp)
            })
        };

        let handle = match res {
            Ok(handle) => handle,
            Err(source) => {
                if let Backing::Dumb(handle) = backing {
                    let _ = kms.destroy_dumb_buffer(handle);
                }
                return Err(ImportError::AddFb(AccessError {
                    errmsg: "Failed to add framebuffer",
                    dev: kms.dev_path(),
                    source,
                }));
            }
        };

        let format = Format {
            code: desc.format,
            modifier,
        };
        let plane_mask = device
            .planes()
            .iter()
            .filter(|plane| plane.formats.contains(&format))
            .fold(0u64, |mask, plane| mask | (1 << plane.index));
        trace!(fb = ?handle, ?format, plane_mask, ?source, "added framebuffer");

        Ok(Framebuffer(Rc::new(FramebufferInner {
            kms: kms.clone(),
            handle,
            format,
            size: Size::from((desc.size.0 as i32, desc.size.1 as i32)),
            plane_mask,
            source,
            backing: Some(backing),
        })))
    }

    /// Allocate a dumb buffer and add a framebuffer for it
    pub fn dumb(device: &DrmDevice, size: Size<i32, Physical>, format: Fourcc) -> Result<Framebuffer, ImportError> {
        let kms = device.kms();
        let desc = kms
            .create_dumb_buffer((size.w as u32, size.h as u32), format)
            .map_err(|source| {
                ImportError::AddFb(AccessError {
                    errmsg: "Failed to create dumb buffer",
                    dev: kms.dev_path(),
                    source,
                })
            })?;
        let handle = desc.handles[0].ok_or(ImportError::Gbm(GbmImportError::Handle))?;
        Framebuffer::add(device, desc, Backing::Dumb(handle), FramebufferSource::Dumb, false)
    }

    /// Add a framebuffer for one page of the renderer's output
    pub fn render_target(device: &DrmDevice, buffer: Box<dyn ImportedBuffer>) -> Result<Framebuffer, ImportError> {
        let desc = buffer.describe();
        Framebuffer::add(device, desc, Backing::Imported(buffer), FramebufferSource::Surface, false)
    }

    pub(crate) fn cursor(
        device: &DrmDevice,
        buffer: Rc<RefCell<Box<dyn CursorBuffer>>>,
    ) -> Result<Framebuffer, ImportError> {
        let desc = buffer.borrow().describe();
        Framebuffer::add(device, desc, Backing::Cursor(buffer), FramebufferSource::Cursor, false)
    }
}

/// Why a buffer could not be turned into a framebuffer
#[derive(Debug, Error)]
pub enum ImportError {
    /// No buffer importer is configured
    #[error("no buffer importer available")]
    NoImporter,
    /// The buffer does not disclose its layout
    #[error("buffer has an invalid modifier")]
    ModifierInvalid,
    /// The buffer uses attributes scanout cannot honour
    #[error("unsupported dmabuf flags {0:?}")]
    UnsupportedFlags(DmabufFlags),
    /// Shared memory and solid colour buffers have no framebuffer
    #[error("buffer type cannot be scanned out")]
    NotScanoutable,
    /// Importing the buffer object failed
    #[error(transparent)]
    Gbm(#[from] GbmImportError),
    /// `AddFB2` and its fallbacks failed
    #[error("failed to add framebuffer")]
    AddFb(#[source] AccessError),
    /// No plane accepts the format and modifier
    #[error("no plane supports format {0:?}")]
    FormatIncompatible(Format),
}

impl ImportError {
    /// The failure flag recorded for this error
    pub fn reason(&self) -> FailureReasons {
        match self {
            ImportError::NoImporter => FailureReasons::NO_GBM,
            ImportError::ModifierInvalid => FailureReasons::DMABUF_MODIFIER_INVALID,
            ImportError::UnsupportedFlags(_) => FailureReasons::GBM_BO_IMPORT_FAILED,
            ImportError::NotScanoutable => FailureReasons::FORCE_RENDERER,
            ImportError::Gbm(GbmImportError::Handle) => FailureReasons::GBM_BO_GET_HANDLE_FAILED,
            ImportError::Gbm(_) => FailureReasons::GBM_BO_IMPORT_FAILED,
            ImportError::AddFb(_) => FailureReasons::ADD_FB_FAILED,
            ImportError::FormatIncompatible(_) => FailureReasons::FB_FORMAT_INCOMPATIBLE,
        }
    }
}

#[derive(Debug)]
struct CachedImport {
    opaque: bool,
    fb: Option<Framebuffer>,
    failure: FailureReasons,
}

/// Cache of framebuffers keyed by client buffer
#[derive(Debug)]
pub struct FramebufferRegistry {
    importer: Option<Box<dyn BufferImporter>>,
    cache: HashMap<BufferKey, CachedImport>,
}

impl FramebufferRegistry {
    /// A registry importing through `importer`, or refusing every import without one
    pub fn new(importer: Option<Box<dyn BufferImporter>>) -> Self {
        FramebufferRegistry {
            importer,
            cache: HashMap::new(),
        }
    }

    /// The buffer importer, if any
    pub fn importer(&self) -> Option<&dyn BufferImporter> {
        self.importer.as_deref()
    }

    /// Framebuffer for a client buffer, importing it on first use.
    ///
    /// Failures are cached as well, so a buffer is imported at most once
    /// per opacity.
    #[instrument(level = "trace", skip_all, fields(buffer = ?key))]
    #[profiling::function]
    pub fn import(
        &mut self,
        device: &DrmDevice,
        key: BufferKey,
        buffer: &Buffer,
        opaque: bool,
    ) -> Result<Framebuffer, FailureReasons> {
        if let Some(cached) = self.cache.get(&key).filter(|cached| cached.opaque == opaque) {
            return match (&cached.fb, cached.failure.is_empty()) {
                (Some(fb), true) => Ok(fb.clone()),
                _ => Err(cached.failure),
            };
        }

        let (fb, failure) = match self.import_uncached(device, buffer, opaque) {
            Ok(fb) if fb.plane_mask() == 0 => {
                trace!(format = ?fb.format(), "no plane supports the framebuffer format");
                (Some(fb), FailureReasons::FB_FORMAT_INCOMPATIBLE)
            }
            Ok(fb) => (Some(fb), FailureReasons::empty()),
            Err(err) => {
                trace!(?err, "import failed");
                (None, err.reason())
            }
        };
        let res = match (&fb, failure.is_empty()) {
            (Some(fb), true) => Ok(fb.clone()),
            _ => Err(failure),
        };
        self.cache.insert(key, CachedImport { opaque, fb, failure });
        res
    }

    fn import_uncached(&self, device: &DrmDevice, buffer: &Buffer, opaque: bool) -> Result<Framebuffer, ImportError> {
        let importer = self.importer.as_deref().ok_or(ImportError::NoImporter)?;
        match &buffer.content {
            BufferContent::Dmabuf(dmabuf) => {
                // without an explicit modifier the layout is unknown to the kernel
                if dmabuf.format().modifier == Modifier::Invalid {
                    return Err(ImportError::ModifierInvalid);
                }
                if !dmabuf.flags().is_empty() {
                    return Err(ImportError::UnsupportedFlags(dmabuf.flags()));
                }
                let bo = importer.import_dmabuf(dmabuf, device.supports_fb_modifiers())?;
                let desc = bo.describe();
                Framebuffer::add(device, desc, Backing::Imported(bo), FramebufferSource::Dmabuf, opaque)
            }
            BufferContent::RendererOpaque(client) => {
                let bo = importer.import_opaque(client)?;
                let desc = bo.describe();
                if desc.modifier == Modifier::Invalid {
                    return Err(ImportError::ModifierInvalid);
                }
                Framebuffer::add(device, desc, Backing::Imported(bo), FramebufferSource::Client, opaque)
            }
            BufferContent::Shm(_) | BufferContent::Solid(_) => Err(ImportError::NotScanoutable),
        }
    }

    /// Failure flags cached for a buffer
    pub fn cached_failure(&self, key: BufferKey) -> Option<FailureReasons> {
        self.cache.get(&key).map(|cached| cached.failure)
    }

    /// Drop the cached framebuffer of a destroyed buffer
    pub fn evict(&mut self, key: BufferKey) -> bool {
        let evicted = self.cache.remove(&key).is_some();
        if evicted {
            trace!(buffer = ?key, "evicted framebuffer");
        }
        evicted
    }

    /// Number of cached buffers
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

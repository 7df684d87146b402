//! Scene model consumed by the plane planner.
//!
//! Views and buffers live in generational arenas ([`slotmap`]); everything
//! the backend remembers about them (cached framebuffers, the cursor memo,
//! feedback timers) is keyed by [`ViewKey`] or [`BufferKey`], so a destroyed
//! view or buffer simply stops resolving instead of leaving a dangling pointer.

use std::os::unix::io::OwnedFd;
use std::rc::Rc;
use std::sync::Arc;

use slotmap::{new_key_type, SlotMap};

use crate::backend::allocator::{dmabuf::Dmabuf, Fourcc};
use crate::utils::{Buffer as BufferCoords, Physical, Rectangle, Region, Size};

new_key_type! {
    /// Generational index of a [`View`]
    pub struct ViewKey;
    /// Generational index of a [`Buffer`]
    pub struct BufferKey;
}

/// Pixels of a shared-memory buffer
#[derive(Debug, Clone)]
pub struct ShmBuffer {
    /// Pixel format
    pub format: Fourcc,
    /// Bytes per row
    pub stride: u32,
    /// Pixel data, `stride * height` bytes
    pub data: Arc<[u8]>,
}

/// A client buffer only the renderer or the buffer importer can interpret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpaqueBuffer {
    /// Importer specific identifier (e.g. the `wl_buffer` resource)
    pub id: u64,
    /// Format the renderer reports for the buffer
    pub format: Fourcc,
}

/// Content backing a [`Buffer`]
#[derive(Debug, Clone)]
pub enum BufferContent {
    /// Shared memory, CPU readable
    Shm(ShmBuffer),
    /// Client dma-buf
    Dmabuf(Dmabuf),
    /// Renderer-managed client buffer
    RendererOpaque(OpaqueBuffer),
    /// Single colour, premultiplied RGBA
    Solid([f32; 4]),
}

/// Guard handed out to plane states so a client cannot reuse a buffer that is still scanned out
#[derive(Debug)]
pub struct BufferLock {
    buffer: BufferKey,
}

impl BufferLock {
    /// The locked buffer
    pub fn buffer(&self) -> BufferKey {
        self.buffer
    }
}

/// A client buffer
#[derive(Debug)]
pub struct Buffer {
    /// Content of the buffer
    pub content: BufferContent,
    /// Size in pixels
    pub size: Size<i32, BufferCoords>,
    lock: Rc<BufferLock>,
}

impl Buffer {
    fn new(key: BufferKey, content: BufferContent, size: Size<i32, BufferCoords>) -> Self {
        Buffer {
            content,
            size,
            lock: Rc::new(BufferLock { buffer: key }),
        }
    }

    /// Pixel format, if the buffer has one
    pub fn format(&self) -> Option<Fourcc> {
        match &self.content {
            BufferContent::Shm(shm) => Some(shm.format),
            BufferContent::Dmabuf(dmabuf) => Some(dmabuf.format().code),
            BufferContent::RendererOpaque(opaque) => Some(opaque.format),
            BufferContent::Solid(_) => None,
        }
    }

    /// Whether this is a shared-memory buffer
    pub fn is_shm(&self) -> bool {
        matches!(self.content, BufferContent::Shm(_))
    }

    /// Take a reference keeping the buffer busy
    pub fn lock(&self) -> Rc<BufferLock> {
        self.lock.clone()
    }

    /// Whether any plane state still references this buffer
    pub fn is_busy(&self) -> bool {
        Rc::strong_count(&self.lock) > 1
    }
}

/// Kind of the view's transformation matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatrixKind {
    /// No transformation
    Identity,
    /// Pure translation
    Translate,
    /// Translation and axis aligned scaling
    Scale,
    /// Includes a rotation
    Rotate,
    /// Arbitrary matrix
    General,
}

/// Surface-to-output transformation of a view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewTransform {
    /// Whether the transform is in effect at all
    pub enabled: bool,
    /// The most complex operation contained in the matrix
    pub kind: MatrixKind,
    /// Whether the transform could be computed for this output
    pub valid: bool,
}

impl ViewTransform {
    /// The identity transform
    pub const IDENTITY: ViewTransform = ViewTransform {
        enabled: false,
        kind: MatrixKind::Identity,
        valid: true,
    };

    /// Whether the transformation maps the buffer onto an axis aligned rectangle
    pub fn is_axis_aligned(&self) -> bool {
        !self.enabled || self.kind <= MatrixKind::Scale
    }
}

impl Default for ViewTransform {
    fn default() -> Self {
        ViewTransform::IDENTITY
    }
}

/// Handle to a colour transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorTransform {
    /// Opaque handle of the transform; `None` when no transform is attached
    pub handle: Option<u64>,
    /// Whether the transform could be built
    pub valid: bool,
    /// Whether the whole pipeline is the identity
    pub identity_pipeline: bool,
}

impl ColorTransform {
    /// No colour transform at all
    pub const NONE: ColorTransform = ColorTransform {
        handle: None,
        valid: true,
        identity_pipeline: true,
    };

    /// Whether the view's pixels can be scanned out unmodified
    pub fn is_identity(&self) -> bool {
        self.handle.is_none() || (self.valid && self.identity_pipeline)
    }
}

/// Content protection level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ProtectionLevel {
    /// No protection requested
    #[default]
    Undesired,
    /// Protection requested but not active
    Desired,
    /// Protection active
    Enabled,
}

/// How strictly protection is enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtectionMode {
    /// Show the content even if the output is not protected
    #[default]
    Relaxed,
    /// Censor the content on unprotected outputs
    Enforced,
}

/// A composable rectangle on screen
#[derive(Debug)]
pub struct View {
    /// Bounding box in global coordinates
    pub geometry: Rectangle<i32, Physical>,
    /// Part of the buffer shown, `None` for the whole buffer
    pub src: Option<Rectangle<f64, BufferCoords>>,
    /// Opaque region in global coordinates
    pub opaque: Region<i32, Physical>,
    /// Surface-to-output transformation
    pub transform: ViewTransform,
    /// Optional clip applied on top of the geometry
    pub scissor: Option<Rectangle<i32, Physical>>,
    /// Global alpha, `0.0..=1.0`
    pub alpha: f32,
    /// Protection requested by the surface
    pub protection: ProtectionLevel,
    /// Enforcement of `protection`
    pub protection_mode: ProtectionMode,
    /// Bitmask of output ids the view touches
    pub output_mask: u32,
    /// Colour transform attached to the surface
    pub color_transform: ColorTransform,
    /// Attached buffer
    pub buffer: Option<BufferKey>,
    /// Fence signalled once the client finished writing the buffer
    pub acquire_fence: Option<Arc<OwnedFd>>,
    /// Surface damage since the last frame, in buffer coordinates
    pub damage: Region<i32, BufferCoords>,
}

impl View {
    /// A fully visible, untransformed view without buffer
    pub fn new(geometry: Rectangle<i32, Physical>) -> Self {
        View {
            geometry,
            src: None,
            opaque: Region::new(),
            transform: ViewTransform::IDENTITY,
            scissor: None,
            alpha: 1.0,
            protection: ProtectionLevel::Undesired,
            protection_mode: ProtectionMode::Relaxed,
            output_mask: 0,
            color_transform: ColorTransform::NONE,
            buffer: None,
            acquire_fence: None,
            damage: Region::new(),
        }
    }

    /// Whether nothing below the view shines through anywhere inside `area`
    pub fn is_opaque_over(&self, area: Rectangle<i32, Physical>) -> bool {
        self.alpha >= 1.0 && self.opaque.covers(area)
    }
}

/// Owner of all views and buffers, and of the stacking order
#[derive(Debug, Default)]
pub struct Scene {
    views: SlotMap<ViewKey, View>,
    buffers: SlotMap<BufferKey, Buffer>,
    stack: Vec<ViewKey>,
}

impl Scene {
    /// An empty scene
    pub fn new() -> Self {
        Scene::default()
    }

    /// Register a buffer
    pub fn add_buffer(&mut self, content: BufferContent, size: impl Into<Size<i32, BufferCoords>>) -> BufferKey {
        let size = size.into();
        self.buffers.insert_with_key(|key| Buffer::new(key, content, size))
    }

    /// Destroy a buffer, detaching it from every view
    pub fn remove_buffer(&mut self, key: BufferKey) -> Option<Buffer> {
        let buffer = self.buffers.remove(key)?;
        for view in self.views.values_mut() {
            if view.buffer == Some(key) {
                view.buffer = None;
            }
        }
        Some(buffer)
    }

    /// Look up a buffer
    pub fn buffer(&self, key: BufferKey) -> Option<&Buffer> {
        self.buffers.get(key)
    }

    /// Mutable access to a buffer
    pub fn buffer_mut(&mut self, key: BufferKey) -> Option<&mut Buffer> {
        self.buffers.get_mut(key)
    }

    /// Add a view on top of the stack
    pub fn add_view(&mut self, view: View) -> ViewKey {
        let key = self.views.insert(view);
        self.stack.insert(0, key);
        key
    }

    /// Destroy a view
    pub fn remove_view(&mut self, key: ViewKey) -> Option<View> {
        self.stack.retain(|k| *k != key);
        self.views.remove(key)
    }

    /// Look up a view
    pub fn view(&self, key: ViewKey) -> Option<&View> {
        self.views.get(key)
    }

    /// Mutable access to a view
    pub fn view_mut(&mut self, key: ViewKey) -> Option<&mut View> {
        self.views.get_mut(key)
    }

    /// Move a view to the top of the stack
    pub fn raise(&mut self, key: ViewKey) {
        if self.views.contains_key(key) {
            self.stack.retain(|k| *k != key);
            self.stack.insert(0, key);
        }
    }

    /// Views in paint order, topmost first
    pub fn paint_order(&self) -> impl Iterator<Item = (ViewKey, &View)> + '_ {
        self.stack.iter().filter_map(|key| self.views.get(*key).map(|view| (*key, view)))
    }

    /// Attached buffer of a view, if it is still alive
    pub fn view_buffer(&self, view: &View) -> Option<(BufferKey, &Buffer)> {
        let key = view.buffer?;
        self.buffers.get(key).map(|buffer| (key, buffer))
    }
}

//! Hardware cursor buffers
//!
//! Each output owns a ring of two cursor sized buffers. A new image is
//! always written into the buffer not currently scanned out, the kernel
//! only flips to it with the next commit.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{trace, warn};

use super::device::DrmDevice;
use super::fb::{Framebuffer, ImportError};
use super::gbm::{BufferImporter, CursorBuffer};
use crate::scene::{ShmBuffer, ViewKey};
use crate::utils::{Buffer as BufferCoords, Physical, Size};

const RING_SIZE: usize = 2;

#[derive(Debug)]
struct CursorSlot {
    buffer: Rc<RefCell<Box<dyn CursorBuffer>>>,
    fb: Framebuffer,
}

/// Which ring buffer a cursor placement uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorUpdate {
    /// Index into the ring
    pub slot: usize,
    /// Whether the image has to be written before the commit
    pub needs_upload: bool,
}

/// Ring of cursor buffers plus the view last shown on the cursor plane
#[derive(Debug)]
pub struct CursorRing {
    slots: Vec<CursorSlot>,
    current: usize,
    view: Option<ViewKey>,
    size: Size<i32, Physical>,
}

impl CursorRing {
    /// Allocate the ring for the device's cursor plane size
    pub fn new(device: &DrmDevice, importer: &dyn BufferImporter) -> Result<Self, ImportError> {
        let size = device.cursor_size();
        let slots = (0..RING_SIZE)
            .map(|_| {
                let buffer = Rc::new(RefCell::new(importer.create_cursor_buffer(size)?));
                let fb = Framebuffer::cursor(device, buffer.clone())?;
                Ok(CursorSlot { buffer, fb })
            })
            .collect::<Result<Vec<_>, ImportError>>()?;
        trace!(?size, "allocated cursor ring");
        Ok(CursorRing {
            slots,
            current: 0,
            view: None,
            size,
        })
    }

    /// Size of every ring buffer
    pub fn size(&self) -> Size<i32, Physical> {
        self.size
    }

    /// Index of the buffer latched last
    pub fn current(&self) -> usize {
        self.current
    }

    /// View currently shown on the cursor plane
    pub fn view(&self) -> Option<ViewKey> {
        self.view
    }

    /// Remember `view` as the cursor plane's content, or forget it
    pub fn set_view(&mut self, view: Option<ViewKey>) {
        self.view = view;
    }

    /// Forget the cursor view, so the next placement writes a fresh image
    pub fn clear_view(&mut self) {
        self.view = None;
    }

    /// Pick the buffer for placing `view` without changing the ring
    pub fn prepare(&self, view: ViewKey, damaged: bool) -> CursorUpdate {
        if self.view != Some(view) || damaged {
            CursorUpdate {
                slot: (self.current + 1) % self.slots.len(),
                needs_upload: true,
            }
        } else {
            CursorUpdate {
                slot: self.current,
                needs_upload: false,
            }
        }
    }

    /// Make a prepared placement current
    pub fn latch(&mut self, view: ViewKey, update: CursorUpdate) {
        self.current = update.slot;
        self.view = Some(view);
    }

    /// Framebuffer of a ring slot
    pub fn fb(&self, slot: usize) -> Framebuffer {
        self.slots[slot % self.slots.len()].fb.clone()
    }

    /// Write `shm` into a ring slot, padded to the cursor size.
    ///
    /// A failed write is logged; the plane then shows the previous content.
    pub fn upload(&self, slot: usize, shm: &ShmBuffer, size: Size<i32, BufferCoords>) {
        let pixels = pad_cursor_image(shm, size, self.size);
        let slot = &self.slots[slot % self.slots.len()];
        if let Err(err) = slot.buffer.borrow_mut().write(&pixels) {
            warn!(?err, "failed to write cursor image");
        }
    }
}

/// Copy an ARGB8888 image into a zeroed buffer of the cursor size
pub fn pad_cursor_image(shm: &ShmBuffer, size: Size<i32, BufferCoords>, cursor: Size<i32, Physical>) -> Vec<u8> {
    let out_stride = cursor.w.max(0) as usize * 4;
    let mut out = vec![0u8; out_stride * cursor.h.max(0) as usize];
    let row_len = size.w.min(cursor.w).max(0) as usize * 4;
    let rows = size.h.min(cursor.h).max(0) as usize;
    for row in 0..rows {
        let start = row * shm.stride as usize;
        let Some(src) = shm.data.get(start..start + row_len) else {
            break;
        };
        out[row * out_stride..row * out_stride + row_len].copy_from_slice(src);
    }
    out
}

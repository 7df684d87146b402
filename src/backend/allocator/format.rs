//! Format info tables for DRM formats.
//!
//! [`get_opaque`] returns the opaque alternative of a DRM format with an alpha channel,
//! which is used to scan out buffers whose surface is fully opaque.
//!
//! ```
//! # use scanout_planner::backend::allocator::Fourcc;
//! # use scanout_planner::backend::allocator::format::get_opaque;
//! assert_eq!(Some(Fourcc::Xrgb8888), get_opaque(Fourcc::Argb8888));
//! ```
//!
//! [`get_bpp`] and [`get_depth`] provide the values legacy `AddFB` expects.
//!
//! ```
//! # use scanout_planner::backend::allocator::Fourcc;
//! # use scanout_planner::backend::allocator::format::{get_bpp, get_depth};
//! assert_eq!(get_bpp(Fourcc::Xrgb8888), Some(32));
//! assert_eq!(get_depth(Fourcc::Xrgb8888), Some(24));
//! ```

use std::sync::Arc;

use super::{Format, Fourcc, Modifier};
use indexmap::IndexSet;

/// Static properties of a single-plane RGB format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    /// The variant with the alpha channel replaced by padding
    pub opaque: Option<Fourcc>,
    /// Whether the format carries an alpha channel
    pub alpha: bool,
    /// Bits per pixel
    pub bpp: u32,
    /// Used bits per pixel, excluding padding
    pub depth: u32,
}

macro_rules! format_tables {
    (@opaque $opaque: ident) => { Some(Fourcc::$opaque) };
    (@opaque) => { None };
    (
        $($fourcc: ident {
            $(opaque: $opaque: ident,)?
            alpha: $alpha: expr,
            bpp: $bpp: expr,
            depth: $depth: expr $(,)?
        }),* $(,)?
    ) => {
        /// Look up the [`FormatInfo`] of a format.
        ///
        /// Unknown formats return [`None`].
        pub const fn format_info(fourcc: Fourcc) -> Option<FormatInfo> {
            match fourcc {
                $(
                    Fourcc::$fourcc => Some(FormatInfo {
                        opaque: format_tables!(@opaque $($opaque)?),
                        alpha: $alpha,
                        bpp: $bpp,
                        depth: $depth,
                    }),
                )*
                _ => None,
            }
        }

        #[cfg(test)]
        fn known_formats() -> &'static [Fourcc] {
            &[$(Fourcc::$fourcc,)*]
        }
    };
}

format_tables! {
    Rgb565 { alpha: false, bpp: 16, depth: 16 },
    Bgr565 { alpha: false, bpp: 16, depth: 16 },

    Argb1555 { opaque: Xrgb1555, alpha: true, bpp: 16, depth: 16 },
    Xrgb1555 { alpha: false, bpp: 16, depth: 15 },

    Rgb888 { alpha: false, bpp: 24, depth: 24 },
    Bgr888 { alpha: false, bpp: 24, depth: 24 },

    Argb8888 { opaque: Xrgb8888, alpha: true, bpp: 32, depth: 32 },
    Xrgb8888 { alpha: false, bpp: 32, depth: 24 },
    Abgr8888 { opaque: Xbgr8888, alpha: true, bpp: 32, depth: 32 },
    Xbgr8888 { alpha: false, bpp: 32, depth: 24 },
    Rgba8888 { opaque: Rgbx8888, alpha: true, bpp: 32, depth: 32 },
    Rgbx8888 { alpha: false, bpp: 32, depth: 24 },
    Bgra8888 { opaque: Bgrx8888, alpha: true, bpp: 32, depth: 32 },
    Bgrx8888 { alpha: false, bpp: 32, depth: 24 },

    Argb2101010 { opaque: Xrgb2101010, alpha: true, bpp: 32, depth: 32 },
    Xrgb2101010 { alpha: false, bpp: 32, depth: 30 },
    Abgr2101010 { opaque: Xbgr2101010, alpha: true, bpp: 32, depth: 32 },
    Xbgr2101010 { alpha: false, bpp: 32, depth: 30 },

    Argb16161616f { opaque: Xrgb16161616f, alpha: true, bpp: 64, depth: 64 },
    Xrgb16161616f { alpha: false, bpp: 64, depth: 48 },
    Abgr16161616f { opaque: Xbgr16161616f, alpha: true, bpp: 64, depth: 64 },
    Xbgr16161616f { alpha: false, bpp: 64, depth: 48 },
}

/// Returns the opaque alternative of the specified format, if it has one
pub const fn get_opaque(fourcc: Fourcc) -> Option<Fourcc> {
    match format_info(fourcc) {
        Some(info) => info.opaque,
        None => None,
    }
}

/// Returns true if the format has an alpha channel
pub const fn has_alpha(fourcc: Fourcc) -> bool {
    match format_info(fourcc) {
        Some(info) => info.alpha,
        None => false,
    }
}

/// Returns the bits per pixel of the specified format
pub const fn get_bpp(fourcc: Fourcc) -> Option<u32> {
    match format_info(fourcc) {
        Some(info) => Some(info.bpp),
        None => None,
    }
}

/// Returns the depth of the specified format
pub const fn get_depth(fourcc: Fourcc) -> Option<u32> {
    match format_info(fourcc) {
        Some(info) => Some(info.depth),
        None => None,
    }
}

/// A set of [`Format`]s, cheap to clone
#[derive(Debug, Default, Clone)]
pub struct FormatSet {
    formats: Arc<IndexSet<Format>>,
}

impl FormatSet {
    /// Return an iterator over the values of the set, in their order
    pub fn iter(&self) -> impl Iterator<Item = &Format> {
        self.formats.iter()
    }

    /// Number of formats in the set
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    /// Whether the set holds no format at all
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// Return `true` if `format` exists in the set
    pub fn contains(&self, format: &Format) -> bool {
        self.formats.contains(format)
    }

    /// Return `true` if the set lists `code` with any modifier
    pub fn contains_code(&self, code: Fourcc) -> bool {
        self.formats.iter().any(|f| f.code == code)
    }

    /// All modifiers listed for `code`
    pub fn modifiers(&self, code: Fourcc) -> impl Iterator<Item = Modifier> + '_ {
        self.formats
            .iter()
            .filter(move |f| f.code == code)
            .map(|f| f.modifier)
    }

    /// The formats contained in both sets, in the order of `self`
    pub fn intersection(&self, other: &FormatSet) -> FormatSet {
        self.formats.intersection(&other.formats).copied().collect()
    }
}

impl FromIterator<Format> for FormatSet {
    #[inline]
    fn from_iter<T: IntoIterator<Item = Format>>(iter: T) -> Self {
        Self {
            formats: Arc::new(IndexSet::from_iter(iter)),
        }
    }
}

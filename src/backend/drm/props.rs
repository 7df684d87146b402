//! KMS property catalogue
//!
//! Property ids are assigned by the kernel and differ between devices, and
//! enum properties map their names to device specific values. On device
//! creation every object we drive is queried once and the result is stored
//! in an [`ObjectProps`] table. A property the driver does not expose is
//! simply absent, so `Option` doubles as feature detection.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use drm::control::{property, Device as ControlDevice, ResourceHandle};
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{trace, warn};

use super::error::{AccessError, Error};
use crate::backend::allocator::{format::FormatSet, Format};

macro_rules! property_names {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $kernel:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)*
        }

        impl PropertyName for $name {
            const ALL: &'static [Self] = &[$($name::$variant,)*];

            fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $kernel,)*
                }
            }
        }
    };
}

macro_rules! enum_tags {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $kernel:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)*
        }

        impl EnumTag for $name {
            const TAGS: &'static [(Self, &'static str)] = &[$(($name::$variant, $kernel),)*];
        }
    };
}

/// A set of kernel property names of one object type
pub trait PropertyName: fmt::Debug + Copy + Eq + Hash + 'static {
    /// Every property of the set
    const ALL: &'static [Self];
    /// Kernel name of the property
    fn name(&self) -> &'static str;

    /// Look up the property by its kernel name
    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|prop| prop.name() == name)
    }
}

/// Stable identifiers for the values of an enum property
pub trait EnumTag: fmt::Debug + Copy + Eq + 'static {
    /// Tag and kernel name pairs
    const TAGS: &'static [(Self, &'static str)];

    /// Kernel name of this tag
    fn kernel_name(&self) -> &'static str {
        Self::TAGS
            .iter()
            .find(|(tag, _)| tag == self)
            .map(|(_, name)| *name)
            .unwrap_or_default()
    }
}

property_names!(
    /// Plane properties used by the planner
    PlaneProp {
        /// `type`
        Type => "type",
        /// `SRC_X`
        SrcX => "SRC_X",
        /// `SRC_Y`
        SrcY => "SRC_Y",
        /// `SRC_W`
        SrcW => "SRC_W",
        /// `SRC_H`
        SrcH => "SRC_H",
        /// `CRTC_X`
        CrtcX => "CRTC_X",
        /// `CRTC_Y`
        CrtcY => "CRTC_Y",
        /// `CRTC_W`
        CrtcW => "CRTC_W",
        /// `CRTC_H`
        CrtcH => "CRTC_H",
        /// `FB_ID`
        FbId => "FB_ID",
        /// `CRTC_ID`
        CrtcId => "CRTC_ID",
        /// `IN_FORMATS`
        InFormats => "IN_FORMATS",
        /// `IN_FENCE_FD`
        InFenceFd => "IN_FENCE_FD",
        /// `FB_DAMAGE_CLIPS`
        FbDamageClips => "FB_DAMAGE_CLIPS",
        /// `zpos`
        Zpos => "zpos",
        /// `rotation`
        Rotation => "rotation",
        /// `alpha`
        Alpha => "alpha",
    }
);

property_names!(
    /// CRTC properties used by the planner
    CrtcProp {
        /// `MODE_ID`
        ModeId => "MODE_ID",
        /// `ACTIVE`
        Active => "ACTIVE",
    }
);

property_names!(
    /// Connector properties used by the planner
    ConnectorProp {
        /// `EDID`
        Edid => "EDID",
        /// `DPMS`
        Dpms => "DPMS",
        /// `CRTC_ID`
        CrtcId => "CRTC_ID",
        /// `Content Protection`
        ContentProtection => "Content Protection",
        /// `HDCP Content Type`
        HdcpContentType => "HDCP Content Type",
        /// `panel orientation`
        PanelOrientation => "panel orientation",
        /// `HDR_OUTPUT_METADATA`
        HdrOutputMetadata => "HDR_OUTPUT_METADATA",
        /// `max bpc`
        MaxBpc => "max bpc",
    }
);

enum_tags!(
    /// Values of the plane `type` property
    PlaneTypeTag {
        /// Overlay plane
        Overlay => "Overlay",
        /// Primary plane
        Primary => "Primary",
        /// Cursor plane
        Cursor => "Cursor",
    }
);

enum_tags!(
    /// Values of the connector `DPMS` property
    DpmsTag {
        /// On
        On => "On",
        /// Standby
        Standby => "Standby",
        /// Suspend
        Suspend => "Suspend",
        /// Off
        Off => "Off",
    }
);

enum_tags!(
    /// Values of the connector `Content Protection` property
    ContentProtectionTag {
        /// No protection wanted
        Undesired => "Undesired",
        /// Protection requested
        Desired => "Desired",
        /// Protection established
        Enabled => "Enabled",
    }
);

enum_tags!(
    /// Values of the connector `HDCP Content Type` property
    HdcpContentTypeTag {
        /// HDCP type 0
        Type0 => "HDCP Type0",
        /// HDCP type 1
        Type1 => "HDCP Type1",
    }
);

enum_tags!(
    /// Values of the connector `panel orientation` property
    PanelOrientationTag {
        /// Normal
        Normal => "Normal",
        /// Upside down
        UpsideDown => "Upside Down",
        /// Left side up
        LeftSideUp => "Left Side Up",
        /// Right side up
        RightSideUp => "Right Side Up",
    }
);

/// `DRM_MODE_ROTATE_0`; `rotation` is a bitmask whose bit names the kernel does not report through the enum api
pub const DRM_MODE_ROTATE_0: u64 = 1 << 0;

/// What the kernel reported for one property of one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    /// Kernel id of the property
    pub handle: property::Handle,
    /// Whether the property can not be changed
    pub immutable: bool,
    /// Value range of range properties
    pub range: Option<(i64, i64)>,
    /// Value read back when the catalogue was built
    pub value: u64,
    enum_values: Vec<(&'static str, u64)>,
}

impl PropertyInfo {
    /// Build the info from what the kernel reported.
    ///
    /// `enum_values` lists kernel names and values; names without a known
    /// tag are dropped.
    pub fn new<'a>(
        handle: property::Handle,
        immutable: bool,
        range: Option<(i64, i64)>,
        value: u64,
        enum_values: impl IntoIterator<Item = (&'a str, u64)>,
    ) -> Self {
        let enum_values = enum_values
            .into_iter()
            .filter_map(|(name, value)| known_enum_name(name).map(|name| (name, value)))
            .collect();
        PropertyInfo {
            handle,
            immutable,
            range,
            value,
            enum_values,
        }
    }

    /// Kernel value of an enum tag, if the driver supports it
    pub fn enum_value<T: EnumTag>(&self, tag: T) -> Option<u64> {
        let name = tag.kernel_name();
        self.enum_values
            .iter()
            .find(|(kernel, _)| *kernel == name)
            .map(|(_, value)| *value)
    }

    /// Translate a kernel value back into a tag
    pub fn decode<T: EnumTag>(&self, value: u64) -> Option<T> {
        let (name, _) = self.enum_values.iter().find(|(_, v)| *v == value)?;
        T::TAGS.iter().find(|(_, kernel)| kernel == name).map(|(tag, _)| *tag)
    }

    /// The tag of the value read back at startup
    pub fn current<T: EnumTag>(&self) -> Option<T> {
        self.decode(self.value)
    }
}

fn known_enum_name(name: &str) -> Option<&'static str> {
    fn lookup<T: EnumTag>(name: &str) -> Option<&'static str> {
        T::TAGS.iter().map(|(_, kernel)| *kernel).find(|kernel| *kernel == name)
    }
    lookup::<PlaneTypeTag>(name)
        .or_else(|| lookup::<DpmsTag>(name))
        .or_else(|| lookup::<ContentProtectionTag>(name))
        .or_else(|| lookup::<HdcpContentTypeTag>(name))
        .or_else(|| lookup::<PanelOrientationTag>(name))
}

/// Properties of a single KMS object
#[derive(Clone)]
pub struct ObjectProps<P: PropertyName> {
    props: HashMap<P, PropertyInfo>,
}

impl<P: PropertyName> fmt::Debug for ObjectProps<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.props.iter().map(|(prop, info)| (prop.name(), info.handle)))
            .finish()
    }
}

impl<P: PropertyName> Default for ObjectProps<P> {
    fn default() -> Self {
        ObjectProps { props: HashMap::new() }
    }
}

impl<P: PropertyName> ObjectProps<P> {
    /// An empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a property
    pub fn insert(&mut self, prop: P, info: PropertyInfo) {
        self.props.insert(prop, info);
    }

    /// Info of a property, `None` if the driver does not expose it
    pub fn get(&self, prop: P) -> Option<&PropertyInfo> {
        self.props.get(&prop)
    }

    /// Kernel id of a property, `None` if the driver does not expose it
    pub fn handle(&self, prop: P) -> Option<property::Handle> {
        self.props.get(&prop).map(|info| info.handle)
    }

    /// Whether the driver exposes a property
    pub fn has(&self, prop: P) -> bool {
        self.props.contains_key(&prop)
    }

    /// Kernel id of a property the caller cannot work without
    pub fn require(&self, object: impl ResourceHandle, prop: P) -> Result<property::Handle, Error> {
        self.handle(prop).ok_or_else(|| Error::UnknownProperty {
            handle: object.into(),
            name: prop.name(),
        })
    }

    /// The read-back value of a property, or `default` if it is missing
    pub fn value_or(&self, prop: P, default: u64) -> u64 {
        self.props.get(&prop).map(|info| info.value).unwrap_or(default)
    }
}

/// Query every property of `P` on `object`
pub fn query_props<D, H, P>(fd: &D, object: H) -> Result<ObjectProps<P>, Error>
where
    D: ControlDevice,
    H: ResourceHandle,
    P: PropertyName,
{
    let props = fd.get_properties(object).map_err(|source| AccessError {
        errmsg: "Error reading properties",
        dev: None,
        source,
    })?;

    let mut table = ObjectProps::new();
    let (handles, values) = props.as_props_and_values();
    for (&handle, &value) in handles.iter().zip(values.iter()) {
        let Ok(info) = fd.get_property(handle) else {
            continue;
        };
        let name = info.name().to_string_lossy();
        let Some(prop) = P::from_name(&name) else {
            continue;
        };

        let (range, enum_values) = match info.value_type() {
            property::ValueType::UnsignedRange(min, max) => (
                Some((min.min(i64::MAX as u64) as i64, max.min(i64::MAX as u64) as i64)),
                Vec::new(),
            ),
            property::ValueType::SignedRange(min, max) => (Some((min, max)), Vec::new()),
            property::ValueType::Enum(values) => {
                let (_, entries) = values.values();
                let entries = entries
                    .iter()
                    .map(|entry| (entry.name().to_string_lossy().into_owned(), entry.value()))
                    .collect::<Vec<_>>();
                (None, entries)
            }
            _ => (None, Vec::new()),
        };

        let entry = PropertyInfo::new(
            handle,
            !info.mutable(),
            range,
            value,
            enum_values.iter().map(|(name, value)| (name.as_str(), *value)),
        );
        trace!(property = prop.name(), ?entry, "found property");
        table.insert(prop, entry);
    }

    Ok(table)
}

/// Error returned for malformed `IN_FORMATS` blobs
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum InFormatsError {
    /// The blob is shorter than its header
    #[error("IN_FORMATS blob is too short for its header")]
    Truncated,
    /// Unknown blob version
    #[error("IN_FORMATS blob has unsupported version {0}")]
    Version(u32),
    /// An array does not fit into the blob
    #[error("IN_FORMATS {0} array does not fit into the blob")]
    OutOfBounds(&'static str),
    /// A modifier references a format index past the format array
    #[error("IN_FORMATS modifier references format index {0} out of bounds")]
    FormatIndex(usize),
}

const FORMAT_BLOB_CURRENT: u32 = 1;
const BLOB_HEADER_SIZE: usize = 24;
const MODIFIER_ENTRY_SIZE: usize = 24;

fn read_u32(blob: &[u8], at: usize) -> Option<u32> {
    blob.get(at..at + 4)
        .map(|bytes| u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(blob: &[u8], at: usize) -> Option<u64> {
    let bytes: [u8; 8] = blob.get(at..at + 8)?.try_into().ok()?;
    Some(u64::from_ne_bytes(bytes))
}

/// Parse the `drm_format_modifier_blob` of a plane's `IN_FORMATS` property.
///
/// Formats unknown to `drm-fourcc` are skipped.
pub fn parse_in_formats(blob: &[u8]) -> Result<FormatSet, InFormatsError> {
    if blob.len() < BLOB_HEADER_SIZE {
        return Err(InFormatsError::Truncated);
    }
    let field = |idx: usize| read_u32(blob, idx * 4).ok_or(InFormatsError::Truncated);
    let version = field(0)?;
    if version != FORMAT_BLOB_CURRENT {
        return Err(InFormatsError::Version(version));
    }
    let count_formats = field(2)? as usize;
    let formats_offset = field(3)? as usize;
    let count_modifiers = field(4)? as usize;
    let modifiers_offset = field(5)? as usize;

    let formats_end = count_formats
        .checked_mul(4)
        .and_then(|len| formats_offset.checked_add(len))
        .filter(|end| *end <= blob.len())
        .ok_or(InFormatsError::OutOfBounds("format"))?;
    let modifiers_end = count_modifiers
        .checked_mul(MODIFIER_ENTRY_SIZE)
        .and_then(|len| modifiers_offset.checked_add(len))
        .filter(|end| *end <= blob.len())
        .ok_or(InFormatsError::OutOfBounds("modifier"))?;

    let codes = blob[formats_offset..formats_end]
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect::<Vec<_>>();

    let mut formats = Vec::new();
    for entry in blob[modifiers_offset..modifiers_end].chunks_exact(MODIFIER_ENTRY_SIZE) {
        let mut indices = read_u64(entry, 0).ok_or(InFormatsError::Truncated)?;
        let offset = read_u32(entry, 8).ok_or(InFormatsError::Truncated)? as usize;
        let modifier = DrmModifier::from(read_u64(entry, 16).ok_or(InFormatsError::Truncated)?);

        while indices != 0 {
            let bit = indices.trailing_zeros() as usize;
            indices &= !(1u64 << bit);
            let idx = offset + bit;
            let code = *codes.get(idx).ok_or(InFormatsError::FormatIndex(idx))?;
            match DrmFourcc::try_from(code) {
                Ok(code) => formats.push(Format { code, modifier }),
                Err(_) => trace!(code, "skipping unknown fourcc in IN_FORMATS"),
            }
        }
    }

    Ok(formats.into_iter().collect())
}

/// Parse a blob, falling back to the legacy plane format list on error
pub fn in_formats_or_legacy(blob: Option<&[u8]>, legacy: &[u32]) -> FormatSet {
    if let Some(blob) = blob {
        match parse_in_formats(blob) {
            Ok(formats) => return formats,
            Err(err) => warn!(?err, "Failed to parse IN_FORMATS, using the legacy format list"),
        }
    }
    legacy
        .iter()
        .filter_map(|code| DrmFourcc::try_from(*code).ok())
        .map(|code| Format {
            code,
            modifier: DrmModifier::Invalid,
        })
        .collect()
}

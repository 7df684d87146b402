//! Various utilities functions and types

mod geometry;
pub mod region;

pub use self::geometry::{to_fixed, Buffer, Coordinate, Physical, Point, Rectangle, Size};
pub use self::region::Region;

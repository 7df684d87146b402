//! Clipping of transformed quads against axis aligned rectangles
//!
//! Renderers draw a view as one quad per damage rectangle. The quad's
//! corners are the transformed buffer corners, the rectangle is the part of
//! the surface to draw. The result is the polygon to emit, in the vertex
//! order of the quad.

use smallvec::SmallVec;

/// Maximum number of vertices a clipped quad can have
pub const MAX_CLIP_VERTICES: usize = 8;

/// A 2d vertex
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClipVertex {
    /// Horizontal coordinate
    pub x: f32,
    /// Vertical coordinate
    pub y: f32,
}

impl ClipVertex {
    /// A vertex at `(x, y)`
    pub const fn new(x: f32, y: f32) -> Self {
        ClipVertex { x, y }
    }
}

/// An axis aligned box given by two corners
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClipBox {
    /// Left edge
    pub x1: f32,
    /// Top edge
    pub y1: f32,
    /// Right edge
    pub x2: f32,
    /// Bottom edge
    pub y2: f32,
}

impl ClipBox {
    /// A box spanning `(x1, y1)` to `(x2, y2)`
    pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        ClipBox { x1, y1, x2, y2 }
    }

    fn misses(&self, other: &ClipBox) -> bool {
        self.x1 >= other.x2 || self.x2 <= other.x1 || self.y1 >= other.y2 || self.y2 <= other.y1
    }
}

/// Four transformed corners, clockwise
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quad {
    /// The corners
    pub vertices: [ClipVertex; 4],
    /// Bounding box of the corners
    pub bbox: ClipBox,
    /// Whether the edges are parallel to the axes
    pub axis_aligned: bool,
}

impl Quad {
    /// A quad from its corners, computing the bounding box
    pub fn new(vertices: [ClipVertex; 4], axis_aligned: bool) -> Self {
        let bbox = vertices.iter().fold(
            ClipBox::new(f32::INFINITY, f32::INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY),
            |b, v| ClipBox::new(b.x1.min(v.x), b.y1.min(v.y), b.x2.max(v.x), b.y2.max(v.y)),
        );
        Quad {
            vertices,
            bbox,
            axis_aligned,
        }
    }

    /// The axis aligned quad covering `rect`
    pub fn from_box(rect: ClipBox) -> Self {
        Quad::new(
            [
                ClipVertex::new(rect.x1, rect.y1),
                ClipVertex::new(rect.x2, rect.y1),
                ClipVertex::new(rect.x2, rect.y2),
                ClipVertex::new(rect.x1, rect.y2),
            ],
            true,
        )
    }
}

/// Vertices of a clipped quad
pub type ClipPolygon = SmallVec<[ClipVertex; MAX_CLIP_VERTICES]>;

/// Clip `quad` against `surf_rect`.
///
/// Returns no vertices when nothing of the quad is left, and otherwise 3 to
/// 8 vertices in the order of the quad.
pub fn clip_quad(quad: &Quad, surf_rect: &ClipBox) -> ClipPolygon {
    if quad.bbox.misses(surf_rect) {
        return ClipPolygon::new();
    }

    let polygon: ClipPolygon = if quad.axis_aligned {
        quad.vertices
            .iter()
            .map(|v| {
                ClipVertex::new(
                    v.x.clamp(surf_rect.x1, surf_rect.x2),
                    v.y.clamp(surf_rect.y1, surf_rect.y2),
                )
            })
            .collect()
    } else {
        sutherland_hodgman(&quad.vertices, surf_rect)
    };

    if polygon.len() < 3 || area(&polygon).abs() <= f32::EPSILON {
        return ClipPolygon::new();
    }
    polygon
}

#[derive(Clone, Copy)]
enum Edge {
    Left(f32),
    Right(f32),
    Top(f32),
    Bottom(f32),
}

impl Edge {
    fn inside(self, v: ClipVertex) -> bool {
        match self {
            Edge::Left(x) => v.x >= x,
            Edge::Right(x) => v.x <= x,
            Edge::Top(y) => v.y >= y,
            Edge::Bottom(y) => v.y <= y,
        }
    }

    fn intersect(self, a: ClipVertex, b: ClipVertex) -> ClipVertex {
        match self {
            Edge::Left(x) | Edge::Right(x) => {
                let t = (x - a.x) / (b.x - a.x);
                ClipVertex::new(x, a.y + t * (b.y - a.y))
            }
            Edge::Top(y) | Edge::Bottom(y) => {
                let t = (y - a.y) / (b.y - a.y);
                ClipVertex::new(a.x + t * (b.x - a.x), y)
            }
        }
    }
}

fn sutherland_hodgman(vertices: &[ClipVertex], rect: &ClipBox) -> ClipPolygon {
    let mut polygon: ClipPolygon = vertices.iter().copied().collect();
    for edge in [
        Edge::Left(rect.x1),
        Edge::Right(rect.x2),
        Edge::Top(rect.y1),
        Edge::Bottom(rect.y2),
    ] {
        let Some(&last) = polygon.last() else {
            break;
        };
        let mut out = ClipPolygon::new();
        let mut prev = last;
        for &cur in polygon.iter() {
            match (edge.inside(prev), edge.inside(cur)) {
                (true, true) => push_vertex(&mut out, cur),
                (true, false) => push_vertex(&mut out, edge.intersect(prev, cur)),
                (false, true) => {
                    push_vertex(&mut out, edge.intersect(prev, cur));
                    push_vertex(&mut out, cur);
                }
                (false, false) => {}
            }
            prev = cur;
        }
        if out.len() > 1 && out.first() == out.last() {
            out.pop();
        }
        polygon = out;
    }
    polygon
}

fn push_vertex(out: &mut ClipPolygon, v: ClipVertex) {
    if out.last() != Some(&v) && out.len() < MAX_CLIP_VERTICES {
        out.push(v);
    }
}

fn area(polygon: &[ClipVertex]) -> f32 {
    let n = polygon.len();
    (0..n)
        .map(|i| {
            let a = polygon[i];
            let b = polygon[(i + 1) % n];
            a.x * b.y - b.x * a.y
        })
        .sum::<f32>()
        / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotated_square(cx: f32, cy: f32, r: f32) -> Quad {
        Quad::new(
            [
                ClipVertex::new(cx, cy - r),
                ClipVertex::new(cx + r, cy),
                ClipVertex::new(cx, cy + r),
                ClipVertex::new(cx - r, cy),
            ],
            false,
        )
    }

    #[test]
    fn disjoint_bbox_yields_nothing() {
        let quad = Quad::from_box(ClipBox::new(0.0, 0.0, 10.0, 10.0));
        assert!(clip_quad(&quad, &ClipBox::new(10.0, 0.0, 20.0, 10.0)).is_empty());
        assert!(clip_quad(&quad, &ClipBox::new(-5.0, 20.0, 5.0, 30.0)).is_empty());
    }

    #[test]
    fn axis_aligned_quads_are_clamped_in_order() {
        let quad = Quad::from_box(ClipBox::new(-5.0, -5.0, 5.0, 5.0));
        let clipped = clip_quad(&quad, &ClipBox::new(0.0, 0.0, 10.0, 10.0));
        assert_eq!(
            clipped.as_slice(),
            &[
                ClipVertex::new(0.0, 0.0),
                ClipVertex::new(5.0, 0.0),
                ClipVertex::new(5.0, 5.0),
                ClipVertex::new(0.0, 5.0),
            ]
        );
    }

    #[test]
    fn contained_rotated_quad_is_unchanged() {
        let quad = rotated_square(50.0, 50.0, 10.0);
        let clipped = clip_quad(&quad, &ClipBox::new(0.0, 0.0, 100.0, 100.0));
        assert_eq!(clipped.as_slice(), &quad.vertices);
    }

    #[test]
    fn rotated_quad_over_every_edge_gives_an_octagon() {
        let quad = rotated_square(5.0, 5.0, 7.0);
        let clipped = clip_quad(&quad, &ClipBox::new(0.0, 0.0, 10.0, 10.0));
        assert_eq!(clipped.len(), 8);
        for v in &clipped {
            assert!((0.0..=10.0).contains(&v.x) && (0.0..=10.0).contains(&v.y), "{v:?}");
        }
    }

    #[test]
    fn rotated_corner_overlap_gives_a_triangle() {
        // only the right corner of the diamond reaches into the rect
        let quad = rotated_square(0.0, 5.0, 4.0);
        let clipped = clip_quad(&quad, &ClipBox::new(2.0, 0.0, 10.0, 10.0));
        assert_eq!(clipped.len(), 3);
        assert!((area(&clipped).abs() - 4.0).abs() < 1e-4);
    }

    #[test]
    fn degenerate_overlap_is_discarded() {
        let quad = Quad::from_box(ClipBox::new(0.0, 0.0, 10.0, 10.0));
        // the bbox test passes, but clamping leaves a zero-height sliver
        let mut thin = quad;
        thin.bbox.y2 = 20.0;
        thin.vertices.iter_mut().for_each(|v| v.y += 15.0);
        thin.bbox.y1 = 5.0;
        assert!(clip_quad(&thin, &ClipBox::new(0.0, 0.0, 10.0, 10.0)).is_empty());
    }
}

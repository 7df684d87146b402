//! Rectangle-set regions
//!
//! A [`Region`] is stored as a list of non-overlapping rectangles, which is
//! all the planner needs to track occluded and renderer-covered areas of an output.

use super::geometry::{Coordinate, Rectangle};

/// A set of non-overlapping rectangles
pub struct Region<N, Kind> {
    rects: Vec<Rectangle<N, Kind>>,
}

impl<N: Coordinate, Kind> Region<N, Kind> {
    /// An empty region
    pub fn new() -> Self {
        Region { rects: Vec::new() }
    }

    /// Region covering a single rectangle
    pub fn from_rect(rect: Rectangle<N, Kind>) -> Self {
        let mut region = Region::new();
        region.add_rect(rect);
        region
    }

    /// The disjoint rectangles making up this region
    pub fn rects(&self) -> &[Rectangle<N, Kind>] {
        &self.rects
    }

    /// Whether the region covers no area
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Remove every rectangle
    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// Add a rectangle to the region
    pub fn add_rect(&mut self, rect: Rectangle<N, Kind>) {
        if rect.is_empty() {
            return;
        }
        let missing = Rectangle::subtract_rects_many_in_place(vec![rect], self.rects.iter().copied());
        self.rects.extend(missing);
    }

    /// Add every rectangle of another region
    pub fn union(&mut self, other: &Region<N, Kind>) {
        for rect in other.rects.iter().copied() {
            self.add_rect(rect);
        }
    }

    /// Remove the area of a rectangle from the region
    pub fn subtract_rect(&mut self, rect: Rectangle<N, Kind>) {
        let rects = std::mem::take(&mut self.rects);
        self.rects = Rectangle::subtract_rects_many_in_place(rects, [rect]);
    }

    /// Remove the area of another region from this one
    pub fn subtract(&mut self, other: &Region<N, Kind>) {
        let rects = std::mem::take(&mut self.rects);
        self.rects = Rectangle::subtract_rects_many_in_place(rects, other.rects.iter().copied());
    }

    /// Restrict the region to a rectangle
    pub fn intersect_rect(&mut self, rect: Rectangle<N, Kind>) {
        self.rects = self
            .rects
            .iter()
            .filter_map(|r| r.intersection(rect))
            .filter(|r| !r.is_empty())
            .collect();
    }

    /// Whether any part of `rect` lies inside the region
    pub fn overlaps(&self, rect: Rectangle<N, Kind>) -> bool {
        self.rects.iter().any(|r| r.overlaps(rect))
    }

    /// Whether all of `rect` lies inside the region
    pub fn covers(&self, rect: Rectangle<N, Kind>) -> bool {
        if rect.is_empty() {
            return true;
        }
        Rectangle::subtract_rects_many_in_place(vec![rect], self.rects.iter().copied()).is_empty()
    }

    /// The smallest rectangle containing the whole region
    pub fn extents(&self) -> Rectangle<N, Kind> {
        Rectangle::bounding_box(
            self.rects
                .iter()
                .flat_map(|rect| [rect.loc, rect.bottom_right()]),
        )
    }
}

impl<N: Coordinate, Kind> Default for Region<N, Kind> {
    fn default() -> Self {
        Region::new()
    }
}

impl<N: Coordinate, Kind> Clone for Region<N, Kind> {
    fn clone(&self) -> Self {
        Region {
            rects: self.rects.clone(),
        }
    }
}

impl<N: Coordinate, Kind> std::fmt::Debug for Region<N, Kind> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.rects.iter()).finish()
    }
}

impl<N: Coordinate, Kind> FromIterator<Rectangle<N, Kind>> for Region<N, Kind> {
    fn from_iter<T: IntoIterator<Item = Rectangle<N, Kind>>>(iter: T) -> Self {
        let mut region = Region::new();
        for rect in iter {
            region.add_rect(rect);
        }
        region
    }
}

//! Axis-aligned bounding boxes and overlap tests

use geo_types::{coord, Polygon, Rect};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Envelope in map units: (min_x, min_y, max_x, max_y)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Envelope of a set of points; non-finite points are ignored
    pub fn from_points<I: IntoIterator<Item = (f64, f64)>>(points: I) -> Self {
        let mut b = Self::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in points {
            if !(x.is_finite() && y.is_finite()) {
                continue;
            }
            b.min_x = b.min_x.min(x);
            b.min_y = b.min_y.min(y);
            b.max_x = b.max_x.max(x);
            b.max_y = b.max_y.max(y);
        }
        b
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Area, zero for empty or inverted boxes
    pub fn area(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.width() * self.height()
        }
    }

    /// True when the box has no extent or holds non-finite values
    pub fn is_empty(&self) -> bool {
        !(self.min_x.is_finite() && self.min_y.is_finite() && self.max_x.is_finite() && self.max_y.is_finite())
            || self.max_x <= self.min_x
            || self.max_y <= self.min_y
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.min_x + self.max_x) / 2.0, (self.min_y + self.max_y) / 2.0)
    }

    /// Grown by `d` on every side
    pub fn buffer(&self, d: f64) -> Self {
        Self::new(self.min_x - d, self.min_y - d, self.max_x + d, self.max_y + d)
    }

    pub fn union(&self, other: &Bounds) -> Self {
        Self::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    /// Overlapping part, `None` when the boxes do not share any area
    pub fn intersection(&self, other: &Bounds) -> Option<Bounds> {
        let b = Self::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        );
        (!b.is_empty()).then_some(b)
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            coord! { x: self.min_x, y: self.min_y },
            coord! { x: self.max_x, y: self.max_y },
        )
    }

    pub fn to_polygon(&self) -> Polygon<f64> {
        self.to_rect().to_polygon()
    }
}

impl From<Rect<f64>> for Bounds {
    fn from(r: Rect<f64>) -> Self {
        Self::new(r.min().x, r.min().y, r.max().x, r.max().y)
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:.3}, {:.3}, {:.3}, {:.3})",
            self.min_x, self.min_y, self.max_x, self.max_y
        )
    }
}

/// Whether two envelopes overlap. Shared edges count as overlap.
pub fn bounds_overlap(a: &Bounds, b: &Bounds) -> bool {
    !(a.max_x < b.min_x || a.min_x > b.max_x || a.max_y < b.min_y || a.min_y > b.max_y)
}

/// Intersection area divided by the smaller of the two areas.
///
/// 0 when the boxes do not intersect or one of them is degenerate.
pub fn overlap_ratio(a: &Bounds, b: &Bounds) -> f64 {
    let smaller = a.area().min(b.area());
    if smaller <= 0.0 {
        return 0.0;
    }
    a.intersection(b).map_or(0.0, |i| i.area() / smaller)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn overlap_counts_touching_edges() {
        let a = Bounds::new(0.0, 0.0, 10.0, 10.0);
        let touching = Bounds::new(10.0, 0.0, 20.0, 10.0);
        let apart = Bounds::new(10.5, 0.0, 20.0, 10.0);
        assert!(bounds_overlap(&a, &touching));
        assert!(!bounds_overlap(&a, &apart));
        assert!(bounds_overlap(&a, &Bounds::new(2.0, 2.0, 3.0, 3.0)));
    }

    #[test]
    fn ratio_uses_smaller_area() {
        let big = Bounds::new(0.0, 0.0, 100.0, 100.0);
        let small = Bounds::new(50.0, 50.0, 150.0, 60.0);
        // intersection 50 x 10 = 500, smaller area 100 x 10 = 1000
        assert_relative_eq!(overlap_ratio(&big, &small), 0.5);
        assert_relative_eq!(overlap_ratio(&big, &Bounds::new(10.0, 10.0, 20.0, 20.0)), 1.0);
        assert_eq!(overlap_ratio(&big, &Bounds::new(200.0, 0.0, 300.0, 10.0)), 0.0);
        assert_eq!(overlap_ratio(&big, &Bounds::new(5.0, 5.0, 5.0, 9.0)), 0.0);
    }

    #[test]
    fn from_points_skips_non_finite() {
        let b = Bounds::from_points([(1.0, 2.0), (f64::NAN, 0.0), (-1.0, 5.0)]);
        assert_eq!(b, Bounds::new(-1.0, 2.0, 1.0, 5.0));
        assert!(Bounds::from_points(std::iter::empty()).is_empty());
    }

    #[test]
    fn buffer_and_union() {
        let b = Bounds::new(0.0, 0.0, 1.0, 1.0).buffer(1000.0);
        assert_eq!(b, Bounds::new(-1000.0, -1000.0, 1001.0, 1001.0));
        let u = Bounds::new(0.0, 0.0, 1.0, 1.0).union(&Bounds::new(2.0, -1.0, 3.0, 0.5));
        assert_eq!(u, Bounds::new(0.0, -1.0, 3.0, 1.0));
    }
}

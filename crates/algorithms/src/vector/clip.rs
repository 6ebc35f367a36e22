//! Clipping polygons to a rectangle (Sutherland-Hodgman)
//!
//! Concave inputs may come out with zero-width bridges along the rectangle
//! edges. Those add no area, so the clipped area stays exact.

use geo::Area;
use geo_types::{Coord, Geometry, LineString, Polygon};
use lakemap_core::geometry::Bounds;

#[derive(Debug, Clone, Copy)]
enum Side {
    Left,
    Right,
    Bottom,
    Top,
}

impl Side {
    fn inside(self, p: Coord<f64>, b: &Bounds) -> bool {
        match self {
            Side::Left => p.x >= b.min_x,
            Side::Right => p.x <= b.max_x,
            Side::Bottom => p.y >= b.min_y,
            Side::Top => p.y <= b.max_y,
        }
    }

    fn crossing(self, p: Coord<f64>, q: Coord<f64>, b: &Bounds) -> Coord<f64> {
        let dx = q.x - p.x;
        let dy = q.y - p.y;
        match self {
            Side::Left => Coord { x: b.min_x, y: p.y + (b.min_x - p.x) / dx * dy },
            Side::Right => Coord { x: b.max_x, y: p.y + (b.max_x - p.x) / dx * dy },
            Side::Bottom => Coord { x: p.x + (b.min_y - p.y) / dy * dx, y: b.min_y },
            Side::Top => Coord { x: p.x + (b.max_y - p.y) / dy * dx, y: b.max_y },
        }
    }
}

fn clip_against(vertices: &[Coord<f64>], side: Side, b: &Bounds) -> Vec<Coord<f64>> {
    let n = vertices.len();
    let mut out = Vec::with_capacity(n + 4);
    for i in 0..n {
        let cur = vertices[i];
        let next = vertices[(i + 1) % n];
        match (side.inside(cur, b), side.inside(next, b)) {
            (true, true) => out.push(next),
            (true, false) => out.push(side.crossing(cur, next, b)),
            (false, true) => {
                out.push(side.crossing(cur, next, b));
                out.push(next);
            }
            (false, false) => {}
        }
    }
    out
}

fn clip_ring(ring: &LineString<f64>, b: &Bounds) -> Option<LineString<f64>> {
    let mut vertices = ring.0.clone();
    if vertices.len() > 1 && vertices.first() == vertices.last() {
        vertices.pop();
    }
    for side in [Side::Left, Side::Right, Side::Bottom, Side::Top] {
        vertices = clip_against(&vertices, side, b);
        if vertices.len() < 3 {
            return None;
        }
    }
    vertices.push(vertices[0]);
    Some(LineString::new(vertices))
}

/// Part of `polygon` inside `bounds`; holes are clipped as well
pub fn clip_polygon(polygon: &Polygon<f64>, bounds: &Bounds) -> Option<Polygon<f64>> {
    let exterior = clip_ring(polygon.exterior(), bounds)?;
    let interiors = polygon.interiors().iter().filter_map(|r| clip_ring(r, bounds)).collect();
    Some(Polygon::new(exterior, interiors))
}

/// Area of the part of a polygonal geometry inside `bounds`.
///
/// Non-polygonal geometries have no area and give 0.
pub fn intersection_area(geometry: &Geometry<f64>, bounds: &Bounds) -> f64 {
    match geometry {
        Geometry::Polygon(p) => clip_polygon(p, bounds).map_or(0.0, |c| c.unsigned_area()),
        Geometry::MultiPolygon(mp) => mp
            .0
            .iter()
            .filter_map(|p| clip_polygon(p, bounds))
            .map(|c| c.unsigned_area())
            .sum(),
        Geometry::Rect(r) => Bounds::from(*r).intersection(bounds).map_or(0.0, |i| i.area()),
        Geometry::GeometryCollection(gc) => gc.0.iter().map(|g| intersection_area(g, bounds)).sum(),
        _ => 0.0,
    }
}

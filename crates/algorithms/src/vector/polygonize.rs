//! Raster to polygon conversion
//!
//! Cells equal to a value are grouped into 4-connected components. Each
//! component's boundary is assembled from the pixel edges it shares with
//! other cells, chained into rings on the vertex lattice and converted to
//! map coordinates through the raster's transform.
//!
//! At a vertex where two cells of a component touch only diagonally, the
//! chain turns towards the cell it is already following. Rings that still
//! visit a vertex twice are split there, so every output ring is simple and
//! holes touch their shell in at most isolated points.

use crate::maybe_rayon::*;
use geo::orient::{Direction, Orient};
use geo_types::{Coord, LineString, Polygon};
use lakemap_core::raster::{GeoTransform, Raster};
use std::collections::HashMap;
use tracing::debug;

type Vertex = (i64, i64);

#[derive(Debug, Clone, Copy)]
struct Edge {
    from: Vertex,
    to: Vertex,
}

impl Edge {
    fn heading(&self) -> (i64, i64) {
        (self.to.0 - self.from.0, self.to.1 - self.from.1)
    }
}

/// Polygons of the 4-connected regions where `mask == value`.
///
/// Exteriors are counter-clockwise and holes clockwise in map coordinates.
pub fn polygonize(mask: &Raster<u8>, value: u8) -> Vec<Polygon<f64>> {
    let labels = label_components(mask, value);
    if labels.count == 0 {
        return Vec::new();
    }
    let edges = boundary_edges(&labels);
    let transform = *mask.transform();

    let polygons: Vec<Vec<Polygon<f64>>> = edges
        .par_iter()
        .map(|component| trace_component(component, &transform))
        .collect();

    let polygons: Vec<Polygon<f64>> = polygons.into_iter().flatten().collect();
    debug!(components = labels.count, polygons = polygons.len(), "polygonized mask");
    polygons
}

/// 4-connected component labels; 0 marks cells not equal to `value`
struct Labels {
    ids: Vec<u32>,
    rows: usize,
    cols: usize,
    count: usize,
}

impl Labels {
    fn at(&self, r: i64, c: i64) -> u32 {
        if r < 0 || c < 0 || r >= self.rows as i64 || c >= self.cols as i64 {
            0
        } else {
            self.ids[r as usize * self.cols + c as usize]
        }
    }
}

fn label_components(mask: &Raster<u8>, value: u8) -> Labels {
    let (rows, cols) = mask.shape();
    let data = mask.data();
    let mut labels = vec![0u32; rows * cols];
    let mut next = 0u32;
    let mut stack = Vec::new();

    for r in 0..rows {
        for c in 0..cols {
            if data[[r, c]] != value || labels[r * cols + c] != 0 {
                continue;
            }
            next += 1;
            labels[r * cols + c] = next;
            stack.push((r, c));

            while let Some((cr, cc)) = stack.pop() {
                let neighbours = [
                    (cr.wrapping_sub(1), cc),
                    (cr + 1, cc),
                    (cr, cc.wrapping_sub(1)),
                    (cr, cc + 1),
                ];
                for (nr, nc) in neighbours {
                    if nr >= rows || nc >= cols {
                        continue;
                    }
                    let idx = nr * cols + nc;
                    if labels[idx] == 0 && data[[nr, nc]] == value {
                        labels[idx] = next;
                        stack.push((nr, nc));
                    }
                }
            }
        }
    }

    Labels {
        ids: labels,
        rows,
        cols,
        count: next as usize,
    }
}

/// Directed boundary edges per component, with the component on the right
/// when walking in pixel space (row axis pointing down).
fn boundary_edges(labels: &Labels) -> Vec<Vec<Edge>> {
    let mut edges: Vec<Vec<Edge>> = vec![Vec::new(); labels.count];
    let label_at = |r: i64, c: i64| labels.at(r, c);

    for r in 0..labels.rows as i64 {
        for c in 0..labels.cols as i64 {
            let l = label_at(r, c);
            if l == 0 {
                continue;
            }
            let out = &mut edges[l as usize - 1];
            if label_at(r - 1, c) != l {
                out.push(Edge { from: (c, r), to: (c + 1, r) });
            }
            if label_at(r, c + 1) != l {
                out.push(Edge { from: (c + 1, r), to: (c + 1, r + 1) });
            }
            if label_at(r + 1, c) != l {
                out.push(Edge { from: (c + 1, r + 1), to: (c, r + 1) });
            }
            if label_at(r, c - 1) != l {
                out.push(Edge { from: (c, r + 1), to: (c, r) });
            }
        }
    }
    edges
}

/// Preference of turning from `heading` into `next`: right, straight, left.
fn turn_rank(heading: (i64, i64), next: (i64, i64)) -> u8 {
    let (dx, dy) = heading;
    if next == (-dy, dx) {
        0
    } else if next == heading {
        1
    } else if next == (dy, -dx) {
        2
    } else {
        3
    }
}

fn trace_component(edges: &[Edge], transform: &GeoTransform) -> Vec<Polygon<f64>> {
    let mut outgoing: HashMap<Vertex, Vec<usize>> = HashMap::with_capacity(edges.len());
    for (i, e) in edges.iter().enumerate() {
        outgoing.entry(e.from).or_default().push(i);
    }

    // successor of each edge, fixed by the turn rule
    let successor: Vec<usize> = edges
        .iter()
        .map(|e| {
            let heading = e.heading();
            outgoing
                .get(&e.to)
                .and_then(|cands| cands.iter().copied().min_by_key(|&j| turn_rank(heading, edges[j].heading())))
                .unwrap_or(usize::MAX)
        })
        .collect();

    let mut visited = vec![false; edges.len()];
    let mut rings: Vec<Vec<Vertex>> = Vec::new();
    for start in 0..edges.len() {
        if visited[start] {
            continue;
        }
        let mut cycle = Vec::new();
        let mut cur = start;
        while cur != usize::MAX && !visited[cur] {
            visited[cur] = true;
            cycle.push(edges[cur].from);
            cur = successor[cur];
        }
        split_at_repeats(cycle, &mut rings);
    }

    let mut shells = Vec::new();
    let mut holes = Vec::new();
    for ring in rings {
        let ring = drop_collinear(ring);
        if ring.len() < 4 {
            continue;
        }
        // y points down in pixel space, so shells have positive area here
        let area = signed_area(&ring);
        if area > 0.0 {
            shells.push((area, ring));
        } else if area < 0.0 {
            holes.push(ring);
        }
    }
    if shells.is_empty() {
        return Vec::new();
    }
    shells.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut shells = shells.into_iter().map(|(_, r)| r);
    let mut out = Vec::with_capacity(1);
    if let Some(exterior) = shells.next() {
        let interiors = holes.iter().map(|h| to_linestring(h, transform)).collect();
        out.push(Polygon::new(to_linestring(&exterior, transform), interiors).orient(Direction::Default));
    }
    out.extend(shells.map(|r| Polygon::new(to_linestring(&r, transform), vec![]).orient(Direction::Default)));
    out
}

/// Split a closed vertex sequence into simple rings at repeated vertices
fn split_at_repeats(cycle: Vec<Vertex>, rings: &mut Vec<Vec<Vertex>>) {
    let mut stack: Vec<Vertex> = Vec::with_capacity(cycle.len());
    let mut seen: HashMap<Vertex, usize> = HashMap::with_capacity(cycle.len());

    for v in cycle {
        if let Some(&pos) = seen.get(&v) {
            let ring: Vec<Vertex> = stack.drain(pos..).collect();
            for p in &ring[1..] {
                seen.remove(p);
            }
            if ring.len() >= 3 {
                rings.push(ring);
            }
            stack.push(v);
            seen.insert(v, pos);
        } else {
            seen.insert(v, stack.len());
            stack.push(v);
        }
    }
    if stack.len() >= 3 {
        rings.push(stack);
    }
}

/// Drop vertices lying on a straight run. Returns a closed ring.
fn drop_collinear(ring: Vec<Vertex>) -> Vec<Vertex> {
    let n = ring.len();
    let mut out: Vec<Vertex> = Vec::with_capacity(n + 1);
    for i in 0..n {
        let prev = ring[(i + n - 1) % n];
        let cur = ring[i];
        let next = ring[(i + 1) % n];
        let d1 = (cur.0 - prev.0, cur.1 - prev.1);
        let d2 = (next.0 - cur.0, next.1 - cur.1);
        if d1.0 * d2.1 - d1.1 * d2.0 != 0 {
            out.push(cur);
        }
    }
    if let Some(&first) = out.first() {
        out.push(first);
    }
    out
}

/// Shoelace area of a closed ring in lattice units
fn signed_area(ring: &[Vertex]) -> f64 {
    let twice: i64 = ring.windows(2).map(|w| w[0].0 * w[1].1 - w[1].0 * w[0].1).sum();
    twice as f64 / 2.0
}

fn to_linestring(ring: &[Vertex], transform: &GeoTransform) -> LineString<f64> {
    ring.iter()
        .map(|&(c, r)| {
            let (x, y) = transform.apply(c as f64, r as f64);
            Coord { x, y }
        })
        .collect()
}

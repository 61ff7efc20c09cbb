//! Planar helpers for projected geometries
//!
//! Lengths, midpoints and the swath buffer all operate on grid coordinates in
//! meters; nothing here is geodesic. The buffer builds the offset outline of
//! a polyline directly: flat end caps, mitered joins, bevel fallback on sharp
//! turns.

use geo::{Coord, LineString, MultiLineString, MultiPolygon, Polygon};

/// Limit on the miter length ratio before a join falls back to a bevel
pub const MITER_LIMIT: f64 = 2.0;

/// Midpoint of two grid coordinates
#[inline]
pub fn midpoint(a: Coord<f64>, b: Coord<f64>) -> Coord<f64> {
    Coord {
        x: (a.x + b.x) / 2.0,
        y: (a.y + b.y) / 2.0,
    }
}

/// Planar distance between two grid coordinates in meters
#[inline]
pub fn distance(a: Coord<f64>, b: Coord<f64>) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    (dx * dx + dy * dy).sqrt()
}

/// Planar length of a line string in meters
pub fn line_length(line: &LineString<f64>) -> f64 {
    line.0.windows(2).map(|w| distance(w[0], w[1])).sum()
}

/// Planar length of every part of a multi line string in meters
pub fn multi_line_length(lines: &MultiLineString<f64>) -> f64 {
    lines.0.iter().map(line_length).sum()
}

/// Buffer a multi line by `offset` meters with flat end caps and mitered joins
///
/// Each part becomes one polygon: the left and right offset outlines of the
/// polyline, joined at the line ends so the caps are flat. Joins whose miter
/// ratio exceeds [`MITER_LIMIT`] are beveled. Parts with fewer than two
/// distinct coordinates contribute nothing.
pub fn buffer_line(lines: &MultiLineString<f64>, offset: f64) -> MultiPolygon<f64> {
    let mut polygons = Vec::new();
    for part in &lines.0 {
        if let Some(polygon) = buffer_part(part, offset) {
            polygons.push(polygon);
        }
    }
    MultiPolygon(polygons)
}

fn buffer_part(line: &LineString<f64>, offset: f64) -> Option<Polygon<f64>> {
    if offset <= 0.0 {
        return None;
    }

    // Collapse repeated coordinates so every segment has a defined normal.
    let mut coords: Vec<Coord<f64>> = Vec::with_capacity(line.0.len());
    for &coord in &line.0 {
        if coords
            .last()
            .is_none_or(|&last| distance(last, coord) > f64::EPSILON)
        {
            coords.push(coord);
        }
    }
    if coords.len() < 2 {
        return None;
    }

    let normals: Vec<Coord<f64>> = coords.windows(2).map(|w| left_normal(w[0], w[1])).collect();

    let left = offset_side(&coords, &normals, offset);
    let right = offset_side(&coords, &normals, -offset);

    let mut ring = left;
    ring.extend(right.into_iter().rev());
    ring.push(ring[0]);
    Some(Polygon::new(LineString(ring), vec![]))
}

/// One side of the offset outline; `offset` is negative for the right side
fn offset_side(coords: &[Coord<f64>], normals: &[Coord<f64>], offset: f64) -> Vec<Coord<f64>> {
    let mut side = Vec::with_capacity(coords.len() + normals.len());
    side.push(scale_add(coords[0], normals[0], offset));

    for i in 1..coords.len() - 1 {
        let prev = normals[i - 1];
        let next = normals[i];
        let sum = Coord {
            x: prev.x + next.x,
            y: prev.y + next.y,
        };
        let len = (sum.x * sum.x + sum.y * sum.y).sqrt();
        if len < 1e-9 {
            // Hairpin turn, the two offsets face opposite ways
            side.push(scale_add(coords[i], prev, offset));
            side.push(scale_add(coords[i], next, offset));
            continue;
        }

        let miter = Coord {
            x: sum.x / len,
            y: sum.y / len,
        };
        // cos of the half turn angle; the miter ratio is its reciprocal
        let cos_half = miter.x * prev.x + miter.y * prev.y;
        if cos_half * MITER_LIMIT < 1.0 {
            side.push(scale_add(coords[i], prev, offset));
            side.push(scale_add(coords[i], next, offset));
        } else {
            side.push(scale_add(coords[i], miter, offset / cos_half));
        }
    }

    side.push(scale_add(coords[coords.len() - 1], normals[normals.len() - 1], offset));
    side
}

/// Unit normal pointing left of the segment direction
#[inline]
fn left_normal(a: Coord<f64>, b: Coord<f64>) -> Coord<f64> {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len = (dx * dx + dy * dy).sqrt();
    Coord {
        x: -dy / len,
        y: dx / len,
    }
}

#[inline]
fn scale_add(point: Coord<f64>, direction: Coord<f64>, scale: f64) -> Coord<f64> {
    Coord {
        x: point.x + direction.x * scale,
        y: point.y + direction.y * scale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Contains, Point};

    fn line(coords: &[(f64, f64)]) -> LineString<f64> {
        LineString(coords.iter().map(|&(x, y)| Coord { x, y }).collect())
    }

    #[test]
    fn test_midpoint() {
        let mid = midpoint(Coord { x: 0.0, y: 0.0 }, Coord { x: 10.0, y: 4.0 });
        assert_eq!(mid, Coord { x: 5.0, y: 2.0 });
    }

    #[test]
    fn test_line_length() {
        let l = line(&[(0.0, 0.0), (3.0, 4.0), (3.0, 14.0)]);
        assert!((line_length(&l) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_multi_line_length() {
        let lines = MultiLineString(vec![
            line(&[(0.0, 0.0), (10.0, 0.0)]),
            line(&[(0.0, 5.0), (0.0, 12.0)]),
        ]);
        assert!((multi_line_length(&lines) - 17.0).abs() < 1e-9);
    }

    #[test]
    fn test_buffer_straight_line_is_flat_capped_rectangle() {
        let lines = MultiLineString(vec![line(&[(0.0, 0.0), (10.0, 0.0)])]);
        let buffered = buffer_line(&lines, 2.0);
        assert_eq!(buffered.0.len(), 1);

        let polygon = &buffered.0[0];
        assert!(polygon.contains(&Point::new(5.0, 1.9)));
        assert!(polygon.contains(&Point::new(5.0, -1.9)));
        assert!(polygon.contains(&Point::new(0.1, 0.0)));
        assert!(polygon.contains(&Point::new(9.9, 0.0)));
        // Flat caps: nothing beyond the line ends
        assert!(!polygon.contains(&Point::new(-0.5, 0.0)));
        assert!(!polygon.contains(&Point::new(10.5, 0.0)));
        // Nothing beyond the offset
        assert!(!polygon.contains(&Point::new(5.0, 2.1)));
    }

    #[test]
    fn test_buffer_right_angle_miters_outer_corner() {
        let lines = MultiLineString(vec![line(&[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0)])]);
        let buffered = buffer_line(&lines, 2.0);
        let polygon = &buffered.0[0];

        // Outer miter corner sits at (12, -2)
        assert!(polygon.contains(&Point::new(11.5, -1.5)));
        assert!(polygon.contains(&Point::new(5.0, 1.0)));
        assert!(polygon.contains(&Point::new(9.0, 5.0)));
        assert!(!polygon.contains(&Point::new(12.5, -2.5)));
    }

    #[test]
    fn test_buffer_sharp_turn_bevels() {
        // A 150 degree direction change has miter ratio ~3.9, above the limit.
        let lines = MultiLineString(vec![line(&[(0.0, 0.0), (10.0, 0.0), (1.34, 5.0)])]);
        let buffered = buffer_line(&lines, 2.0);
        let ring = buffered.0[0].exterior();
        // Bevel adds one extra vertex per side over the mitered form.
        assert_eq!(ring.0.len(), 9);
    }

    #[test]
    fn test_buffer_skips_degenerate_parts() {
        let lines = MultiLineString(vec![
            line(&[(1.0, 1.0), (1.0, 1.0)]),
            line(&[(0.0, 0.0), (4.0, 0.0)]),
        ]);
        let buffered = buffer_line(&lines, 1.0);
        assert_eq!(buffered.0.len(), 1);
    }

    #[test]
    fn test_buffer_rejects_zero_offset() {
        let lines = MultiLineString(vec![line(&[(0.0, 0.0), (4.0, 0.0)])]);
        assert!(buffer_line(&lines, 0.0).0.is_empty());
    }
}

//! Geometric helpers for the floor polygon and point-to-point spacing.
//!
//! The enclosure is a simple polygon in the XY plane extruded to a height.
//! These functions answer the two questions the planner keeps asking: is a
//! point inside the floor plan, and how far is it from the nearest wall.

use crate::types::{EPSILON, Vec2, Vec3};

/// Checks whether a point lies inside a polygon (even-odd rule).
///
/// Casts a horizontal ray to +X and counts edge crossings. Horizontal edges
/// never count as a crossing, so the division is guarded for near-zero
/// vertical extents.
///
/// # Parameters
/// * `point` - The point to test
/// * `polygon` - Polygon vertices in order (open ring)
///
/// # Returns
/// `true` if the point is inside the polygon
pub fn point_in_polygon(point: Vec2, polygon: &[Vec2]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (pi, pj) = (polygon[i], polygon[j]);
        if (pi.y > point.y) != (pj.y > point.y) {
            let dy = pj.y - pi.y;
            let dy = if dy.abs() < EPSILON {
                EPSILON.copysign(dy)
            } else {
                dy
            };
            let crossing_x = (pj.x - pi.x) * (point.y - pi.y) / dy + pi.x;
            if point.x < crossing_x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Distance from a point to a line segment in the plane.
///
/// Degenerate segments (both ends within tolerance) collapse to the distance
/// to their start point.
pub fn distance_to_segment(point: Vec2, a: Vec2, b: Vec2) -> f64 {
    let vx = b.x - a.x;
    let vy = b.y - a.y;
    let wx = point.x - a.x;
    let wy = point.y - a.y;

    let c1 = vx * wx + vy * wy;
    if c1 <= 0.0 {
        return point.distance_to(&a);
    }
    let c2 = vx * vx + vy * vy;
    if c2 <= EPSILON {
        return point.distance_to(&a);
    }
    if c1 >= c2 {
        return point.distance_to(&b);
    }

    let t = c1 / c2;
    let projection = Vec2::new(a.x + t * vx, a.y + t * vy);
    point.distance_to(&projection)
}

/// Smallest distance from a point to any edge of the polygon.
///
/// Returns `f64::INFINITY` for an empty polygon.
pub fn min_distance_to_edges(point: Vec2, polygon: &[Vec2]) -> f64 {
    let n = polygon.len();
    (0..n)
        .map(|i| distance_to_segment(point, polygon[i], polygon[(i + 1) % n]))
        .fold(f64::INFINITY, f64::min)
}

/// Area of a simple polygon (shoelace formula, orientation independent).
pub fn polygon_area(polygon: &[Vec2]) -> f64 {
    let n = polygon.len();
    if n < 3 {
        return 0.0;
    }
    let twice_area: f64 = (0..n)
        .map(|i| {
            let j = (i + 1) % n;
            polygon[i].x * polygon[j].y - polygon[j].x * polygon[i].y
        })
        .sum();
    twice_area.abs() / 2.0
}

/// Axis-aligned bounds in the floor plane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds2 {
    pub min: Vec2,
    pub max: Vec2,
}

/// Bounding box of the polygon, extended to include the origin.
pub fn bounds_with_origin(polygon: &[Vec2]) -> Bounds2 {
    polygon.iter().fold(
        Bounds2 {
            min: Vec2::new(0.0, 0.0),
            max: Vec2::new(0.0, 0.0),
        },
        |acc, v| Bounds2 {
            min: Vec2::new(acc.min.x.min(v.x), acc.min.y.min(v.y)),
            max: Vec2::new(acc.max.x.max(v.x), acc.max.y.max(v.y)),
        },
    )
}

/// Distances between two points projected onto the three coordinate planes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlanarDistances {
    pub xy: f64,
    pub xz: f64,
    pub yz: f64,
}

/// Projected distances between two points on the XY, XZ and YZ planes.
pub fn planar_distances(a: &Vec3, b: &Vec3) -> PlanarDistances {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    let dz = a.z - b.z;
    PlanarDistances {
        xy: dx.hypot(dy),
        xz: dx.hypot(dz),
        yz: dy.hypot(dz),
    }
}

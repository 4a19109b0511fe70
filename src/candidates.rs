//! Candidate space generation.
//!
//! Discretizes the interior of the enclosure into grid points that keep the
//! required margin to every wall, the floor and the ceiling. The search only
//! ever picks measurement points from this set.

use std::collections::BTreeSet;

use crate::model::{Enclosure, ValidationError};
use crate::types::{EPSILON, GRID_STEP, Vec2, Vec3, grid_key, round_to_grid};

/// Valid 3D grid points of an enclosure.
///
/// Points are ordered by X, then Y, then Z, so two builds of the same
/// enclosure always yield the same sequence.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CandidateSpace {
    points: Vec<Vec3>,
    floor_cells: usize,
    z_levels: Vec<f64>,
}

impl CandidateSpace {
    /// Wraps an explicit candidate list (e.g. supplied by a caller).
    ///
    /// Points are snapped onto the grid; duplicates are dropped.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut seen = BTreeSet::new();
        let mut levels = BTreeSet::new();
        let mut cells = BTreeSet::new();
        let points: Vec<Vec3> = points
            .into_iter()
            .map(|p| p.snapped())
            .filter(|p| seen.insert(p.grid_keys()))
            .collect();
        for p in &points {
            levels.insert(grid_key(p.z));
            cells.insert((grid_key(p.x), grid_key(p.y)));
        }
        Self {
            points,
            floor_cells: cells.len(),
            z_levels: levels.into_iter().map(|k| k as f64 / 10.0).collect(),
        }
    }

    /// Like [`CandidateSpace::from_points`], but drops every point that
    /// would break the margin rules of `enclosure`.
    pub fn from_points_within(
        points: impl IntoIterator<Item = Vec3>,
        enclosure: &Enclosure,
        margin: f64,
    ) -> Self {
        Self::from_points(
            points
                .into_iter()
                .map(|p| p.snapped())
                .filter(|p| is_admissible(enclosure, margin, p)),
        )
    }

    pub fn points(&self) -> &[Vec3] {
        &self.points
    }

    pub fn into_points(self) -> Vec<Vec3> {
        self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of valid (x, y) floor cells.
    pub fn floor_cells(&self) -> usize {
        self.floor_cells
    }

    /// Distinct Z levels in ascending order.
    pub fn z_levels(&self) -> &[f64] {
        &self.z_levels
    }
}

/// Builds the candidate space of a validated enclosure.
///
/// A point (x, y, z) is kept when (x, y) lies inside the polygon, its distance
/// to every polygon edge is at least `margin`, and z lies in
/// `[margin, height - margin]`. An empty result is an expected outcome for
/// rooms narrower than twice the margin.
///
/// # Parameters
/// * `enclosure` - The room
/// * `margin` - Minimum distance to every face
/// * `step` - Grid spacing, a positive multiple of 0.1
///
/// # Returns
/// `Err` only for a negative margin or an unusable step
///
/// # Examples
/// ```
/// use measure_planner::candidates::build_candidates;
/// use measure_planner::model::Enclosure;
/// use measure_planner::types::Vec2;
///
/// let closet = Enclosure::new(
///     vec![
///         Vec2::new(0.0, 0.0),
///         Vec2::new(0.6, 0.0),
///         Vec2::new(0.6, 0.6),
///         Vec2::new(0.0, 0.6),
///     ],
///     2.5,
/// )
/// .unwrap();
/// let space = build_candidates(&closet, 0.5, 0.1).unwrap();
/// assert!(space.is_empty());
/// ```
pub fn build_candidates(
    enclosure: &Enclosure,
    margin: f64,
    step: f64,
) -> Result<CandidateSpace, ValidationError> {
    if !margin.is_finite() || margin < 0.0 {
        return Err(ValidationError::InvalidMargin(margin));
    }
    let step_cells = step_in_grid_cells(step)?;

    let bounds = enclosure.bounds();
    let xs = axis_values(bounds.min.x + margin, bounds.max.x - margin, step_cells);
    let ys = axis_values(bounds.min.y + margin, bounds.max.y - margin, step_cells);
    let zs = axis_values(margin, enclosure.height - margin, step_cells);

    let mut floor: Vec<Vec2> = Vec::new();
    for &x in &xs {
        for &y in &ys {
            let cell = Vec2::new(x, y);
            if !enclosure.contains_xy(cell) {
                continue;
            }
            if enclosure.wall_clearance(cell) < margin - EPSILON {
                continue;
            }
            floor.push(cell);
        }
    }

    let points = if zs.is_empty() {
        Vec::new()
    } else {
        floor
            .iter()
            .flat_map(|cell| zs.iter().map(move |&z| Vec3::new(cell.x, cell.y, z)))
            .collect()
    };

    Ok(CandidateSpace {
        points,
        floor_cells: if zs.is_empty() { 0 } else { floor.len() },
        z_levels: if floor.is_empty() { Vec::new() } else { zs },
    })
}

/// `true` when `point` lies inside the polygon and keeps `margin` to every
/// wall, the floor and the ceiling.
pub fn is_admissible(enclosure: &Enclosure, margin: f64, point: &Vec3) -> bool {
    point.z >= margin - EPSILON
        && point.z <= enclosure.height - margin + EPSILON
        && enclosure.contains_xy(point.xy())
        && enclosure.wall_clearance(point.xy()) >= margin - EPSILON
}

/// Validates the raw parts and builds the candidate space.
pub fn build_candidates_from_parts(
    vertices: &[Vec2],
    height: f64,
    margin: f64,
    step: f64,
) -> Result<CandidateSpace, ValidationError> {
    let enclosure = Enclosure::new(vertices.to_vec(), height)?;
    build_candidates(&enclosure, margin, step)
}

/// Converts a step length into a whole number of 0.1 grid cells.
fn step_in_grid_cells(step: f64) -> Result<i64, ValidationError> {
    if !step.is_finite() || step < GRID_STEP - EPSILON {
        return Err(ValidationError::InvalidStep(step));
    }
    let cells = step / GRID_STEP;
    if (cells - cells.round()).abs() > 1e-6 {
        return Err(ValidationError::InvalidStep(step));
    }
    Ok(cells.round() as i64)
}

/// Grid values within `[low, high]` (inclusive, with tolerance) at `step_cells` spacing.
///
/// Values are generated from integer grid indices so no rounding error
/// accumulates along the axis.
fn axis_values(low: f64, high: f64, step_cells: i64) -> Vec<f64> {
    if high < low - EPSILON {
        return Vec::new();
    }
    let step = step_cells as f64 * GRID_STEP;
    let first = ((low - EPSILON) / step).ceil() as i64;
    let last = ((high + EPSILON) / step).floor() as i64;
    (first..=last)
        .map(|i| round_to_grid(i as f64 * step))
        .collect()
}

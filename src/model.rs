//! Data models for measurement-point planning.
//!
//! This module defines the fundamental data structures of a planning session:
//! - `Enclosure`: The room floor polygon plus its height
//! - `SourcePoint`: A fixed emitter location that can be switched off
//! - `LayoutRules`: Margins and minimum distances every layout must honour
//! - `ViolationReport`: Per-point rule violations produced by the validator

use serde::{Deserialize, Serialize};
#[allow(unused_imports)]
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;

use crate::geometry::{
    Bounds2, bounds_with_origin, min_distance_to_edges, point_in_polygon, polygon_area,
};
use crate::types::{EPSILON, GRID_STEP, Vec2, Vec3, validation};

/// Number of measurement points a complete layout contains.
pub const MEASUREMENT_POINT_COUNT: usize = 5;

/// Structural misconfiguration of planner input.
///
/// Distinct from geometric infeasibility, which is never an error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Polygon needs at least 3 vertices, got {0}")]
    TooFewVertices(usize),
    #[error("Height must be positive, got: {0}")]
    NonPositiveHeight(f64),
    #[error("Invalid value: {0}")]
    NonFiniteValue(String),
    #[error("Polygon encloses no area")]
    DegenerateArea,
    #[error("Grid step must be a positive multiple of 0.1, got: {0}")]
    InvalidStep(f64),
    #[error("Margin must be zero or positive, got: {0}")]
    InvalidMargin(f64),
    #[error("Unknown source index {0}")]
    UnknownSource(usize),
    #[error("Unknown measurement point index {0}")]
    UnknownMeasurement(usize),
}

/// The room volume: a simple floor polygon extruded to a height.
///
/// # Fields
/// * `vertices` - Floor polygon in order (at least 3, non-self-intersecting)
/// * `height` - Ceiling height in metres
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "vertices": [
        { "x": 0.0, "y": 0.0 },
        { "x": 3.0, "y": 0.0 },
        { "x": 3.0, "y": 2.0 },
        { "x": 0.0, "y": 2.0 }
    ],
    "height": 2.5
}))]
pub struct Enclosure {
    pub vertices: Vec<Vec2>,
    pub height: f64,
}

impl Enclosure {
    /// Creates a new enclosure after validating its structure.
    ///
    /// Self-intersection is assumed absent and not verified.
    ///
    /// # Examples
    /// ```
    /// use measure_planner::model::Enclosure;
    /// use measure_planner::types::Vec2;
    ///
    /// let room = Enclosure::new(
    ///     vec![
    ///         Vec2::new(0.0, 0.0),
    ///         Vec2::new(3.0, 0.0),
    ///         Vec2::new(3.0, 2.0),
    ///         Vec2::new(0.0, 2.0),
    ///     ],
    ///     2.5,
    /// );
    /// assert!(room.is_ok());
    ///
    /// let flat = Enclosure::new(vec![Vec2::new(0.0, 0.0), Vec2::new(1.0, 0.0)], 2.5);
    /// assert!(flat.is_err());
    /// ```
    pub fn new(vertices: Vec<Vec2>, height: f64) -> Result<Self, ValidationError> {
        let enclosure = Self { vertices, height };
        enclosure.check()?;
        Ok(enclosure)
    }

    /// Re-runs the structural checks, e.g. after deserialization.
    pub fn check(&self) -> Result<(), ValidationError> {
        if self.vertices.len() < 3 {
            return Err(ValidationError::TooFewVertices(self.vertices.len()));
        }
        for (i, v) in self.vertices.iter().enumerate() {
            validation::validate_finite(v.x, &format!("Vertex {} x", i + 1))
                .and_then(|_| validation::validate_finite(v.y, &format!("Vertex {} y", i + 1)))
                .map_err(ValidationError::NonFiniteValue)?;
        }
        validation::validate_finite(self.height, "Height")
            .map_err(ValidationError::NonFiniteValue)?;
        if self.height <= 0.0 {
            return Err(ValidationError::NonPositiveHeight(self.height));
        }
        if self.area() <= EPSILON {
            return Err(ValidationError::DegenerateArea);
        }
        Ok(())
    }

    /// Floor area of the polygon.
    pub fn area(&self) -> f64 {
        polygon_area(&self.vertices)
    }

    /// Room volume (floor area × height).
    pub fn volume(&self) -> f64 {
        self.area() * self.height
    }

    /// Bounding box of the floor polygon including the origin.
    pub fn bounds(&self) -> Bounds2 {
        bounds_with_origin(&self.vertices)
    }

    /// Checks whether the floor projection of a point is inside the polygon.
    #[inline]
    pub fn contains_xy(&self, point: Vec2) -> bool {
        point_in_polygon(point, &self.vertices)
    }

    /// Distance from the floor projection of a point to the nearest wall.
    #[inline]
    pub fn wall_clearance(&self, point: Vec2) -> f64 {
        min_distance_to_edges(point, &self.vertices)
    }
}

/// A fixed emitter location.
///
/// Inactive sources are excluded from every distance and uniqueness check.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SourcePoint {
    pub position: Vec3,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl SourcePoint {
    pub fn active(position: Vec3) -> Self {
        Self {
            position,
            active: true,
        }
    }

    pub fn inactive(position: Vec3) -> Self {
        Self {
            position,
            active: false,
        }
    }
}

/// Display label of a source by its index (`F1`, `F2`, ...).
pub fn source_label(index: usize) -> String {
    format!("F{}", index + 1)
}

/// Display label of a measurement point by its index (`P1`, `P2`, ...).
pub fn measurement_label(index: usize) -> String {
    format!("P{}", index + 1)
}

/// Which points take part in Z-axis uniqueness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ZUniqueness {
    /// Z levels must differ among measurement points only; sources may share them.
    #[default]
    MeasurementsOnly,
    /// Z levels must differ among all active points, sources included.
    AllActivePoints,
}

/// Margins and minimum distances every layout must honour.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LayoutRules {
    /// Minimum distance to every wall, floor and ceiling
    pub margin: f64,
    /// Minimum 3D distance between an active source and a measurement point
    pub min_source_distance: f64,
    /// Minimum 3D distance between two measurement points
    pub min_point_spacing: f64,
    /// Minimum planar distance and per-axis offset between two active sources
    pub min_source_separation: f64,
    /// Tolerance for boundary comparisons
    pub epsilon: f64,
    pub z_uniqueness: ZUniqueness,
}

impl LayoutRules {
    pub const DEFAULT_MARGIN: f64 = 0.5;
    pub const DEFAULT_MIN_SOURCE_DISTANCE: f64 = 1.0;
    pub const DEFAULT_MIN_POINT_SPACING: f64 = 0.7;
    pub const DEFAULT_MIN_SOURCE_SEPARATION: f64 = 0.7;
    pub const DEFAULT_STEP: f64 = GRID_STEP;

    /// Creates a builder for custom rules.
    pub fn builder() -> LayoutRulesBuilder {
        LayoutRulesBuilder::default()
    }

    /// `true` if the Z levels of active sources are reserved as well.
    #[inline]
    pub fn sources_share_z_uniqueness(&self) -> bool {
        self.z_uniqueness == ZUniqueness::AllActivePoints
    }
}

impl Default for LayoutRules {
    fn default() -> Self {
        Self {
            margin: Self::DEFAULT_MARGIN,
            min_source_distance: Self::DEFAULT_MIN_SOURCE_DISTANCE,
            min_point_spacing: Self::DEFAULT_MIN_POINT_SPACING,
            min_source_separation: Self::DEFAULT_MIN_SOURCE_SEPARATION,
            epsilon: EPSILON,
            z_uniqueness: ZUniqueness::default(),
        }
    }
}

/// Builder for `LayoutRules`.
#[derive(Clone, Debug, Default)]
pub struct LayoutRulesBuilder {
    rules: LayoutRules,
}

impl LayoutRulesBuilder {
    pub fn margin(mut self, margin: f64) -> Self {
        self.rules.margin = margin;
        self
    }

    pub fn min_source_distance(mut self, distance: f64) -> Self {
        self.rules.min_source_distance = distance;
        self
    }

    pub fn min_point_spacing(mut self, spacing: f64) -> Self {
        self.rules.min_point_spacing = spacing;
        self
    }

    pub fn min_source_separation(mut self, separation: f64) -> Self {
        self.rules.min_source_separation = separation;
        self
    }

    pub fn z_uniqueness(mut self, policy: ZUniqueness) -> Self {
        self.rules.z_uniqueness = policy;
        self
    }

    pub fn build(self) -> LayoutRules {
        self.rules
    }
}

/// Per-axis violation flags of one point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct AxisFlags {
    pub x: bool,
    pub y: bool,
    pub z: bool,
}

impl AxisFlags {
    pub const ALL: AxisFlags = AxisFlags {
        x: true,
        y: true,
        z: true,
    };

    #[inline]
    pub fn any(&self) -> bool {
        self.x || self.y || self.z
    }
}

/// Violations recorded for one point.
#[derive(Clone, Debug, PartialEq, Serialize, ToSchema)]
pub struct PointReport {
    pub label: String,
    pub flags: AxisFlags,
    pub messages: Vec<String>,
}

impl PointReport {
    pub fn new(label: String) -> Self {
        Self {
            label,
            flags: AxisFlags::default(),
            messages: Vec::new(),
        }
    }

    /// Flags the given axes and appends a message unless already present.
    pub fn flag(&mut self, axes: AxisFlags, message: impl Into<String>) {
        self.flags.x |= axes.x;
        self.flags.y |= axes.y;
        self.flags.z |= axes.z;
        let message = message.into();
        if !self.messages.contains(&message) {
            self.messages.push(message);
        }
    }

    #[inline]
    pub fn is_clean(&self) -> bool {
        !self.flags.any() && self.messages.is_empty()
    }
}

/// Rule violations of a full point set.
///
/// Entries are positional: `sources[i]` belongs to the i-th source (inactive
/// sources always stay clean) and `measurements[i]` to the i-th measurement point.
#[derive(Clone, Debug, PartialEq, Serialize, ToSchema)]
pub struct ViolationReport {
    pub sources: Vec<PointReport>,
    pub measurements: Vec<PointReport>,
}

impl ViolationReport {
    /// Creates an empty report for the given number of points.
    pub fn empty(source_count: usize, measurement_count: usize) -> Self {
        Self {
            sources: (0..source_count)
                .map(|i| PointReport::new(source_label(i)))
                .collect(),
            measurements: (0..measurement_count)
                .map(|i| PointReport::new(measurement_label(i)))
                .collect(),
        }
    }

    /// `true` if no point has any violation.
    pub fn is_clean(&self) -> bool {
        self.sources
            .iter()
            .chain(self.measurements.iter())
            .all(PointReport::is_clean)
    }

    /// Number of measurement points with at least one violation.
    pub fn measurement_violations(&self) -> usize {
        self.measurements.iter().filter(|r| !r.is_clean()).count()
    }

    /// Number of points (sources and measurement points) with at least one violation.
    pub fn violation_count(&self) -> usize {
        self.sources
            .iter()
            .chain(self.measurements.iter())
            .filter(|r| !r.is_clean())
            .count()
    }

    /// Flat, deduplicated list of `"<label>: <message>"` lines.
    pub fn summary(&self) -> Vec<String> {
        let mut lines: Vec<String> = Vec::new();
        for report in self.sources.iter().chain(self.measurements.iter()) {
            for message in &report.messages {
                let line = format!("{}: {}", report.label, message);
                if !lines.contains(&line) {
                    lines.push(line);
                }
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rectangle() -> Vec<Vec2> {
        vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(3.0, 0.0),
            Vec2::new(3.0, 2.0),
            Vec2::new(0.0, 2.0),
        ]
    }

    #[test]
    fn enclosure_metrics() {
        let room = Enclosure::new(rectangle(), 2.5).unwrap();
        assert!((room.area() - 6.0).abs() < EPSILON);
        assert!((room.volume() - 15.0).abs() < EPSILON);
        assert!(room.contains_xy(Vec2::new(1.0, 1.0)));
        assert!((room.wall_clearance(Vec2::new(1.0, 1.0)) - 1.0).abs() < EPSILON);
    }

    #[test]
    fn enclosure_rejects_structural_errors() {
        assert_eq!(
            Enclosure::new(rectangle()[..2].to_vec(), 2.5),
            Err(ValidationError::TooFewVertices(2))
        );
        assert_eq!(
            Enclosure::new(rectangle(), 0.0),
            Err(ValidationError::NonPositiveHeight(0.0))
        );
        assert!(matches!(
            Enclosure::new(rectangle(), f64::NAN),
            Err(ValidationError::NonFiniteValue(_))
        ));
        let collinear = vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(2.0, 0.0),
        ];
        assert_eq!(
            Enclosure::new(collinear, 2.0),
            Err(ValidationError::DegenerateArea)
        );
    }

    #[test]
    fn point_report_deduplicates_messages() {
        let mut report = PointReport::new(measurement_label(0));
        report.flag(
            AxisFlags {
                x: true,
                ..Default::default()
            },
            "X repeated",
        );
        report.flag(
            AxisFlags {
                x: true,
                ..Default::default()
            },
            "X repeated",
        );
        assert_eq!(report.messages, vec!["X repeated".to_string()]);
        assert!(report.flags.x && !report.flags.y && !report.flags.z);
        assert!(!report.is_clean());
    }

    #[test]
    fn report_summary_labels_points() {
        let mut report = ViolationReport::empty(2, 2);
        assert!(report.is_clean());
        report.sources[1].flag(AxisFlags::ALL, "Z outside margins");
        report.measurements[0].flag(AxisFlags::ALL, "P1-P2 below 0.70 m (0.50 m)");
        report.measurements[1].flag(AxisFlags::ALL, "P1-P2 below 0.70 m (0.50 m)");

        assert_eq!(report.violation_count(), 3);
        assert_eq!(report.measurement_violations(), 2);
        assert_eq!(
            report.summary(),
            vec![
                "F2: Z outside margins".to_string(),
                "P1: P1-P2 below 0.70 m (0.50 m)".to_string(),
                "P2: P1-P2 below 0.70 m (0.50 m)".to_string(),
            ]
        );
    }

    #[test]
    fn rules_builder_overrides_defaults() {
        let rules = LayoutRules::builder()
            .margin(0.3)
            .z_uniqueness(ZUniqueness::AllActivePoints)
            .build();
        assert_eq!(rules.margin, 0.3);
        assert_eq!(rules.min_point_spacing, LayoutRules::DEFAULT_MIN_POINT_SPACING);
        assert!(rules.sources_share_z_uniqueness());
        assert!(!LayoutRules::default().sources_share_z_uniqueness());
    }
}

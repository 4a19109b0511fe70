//! Common types for planar and spatial geometry.
//!
//! All coordinates handled by the planner live on a fixed 0.1 grid. The helpers
//! in this module snap values onto that grid and derive exact integer keys so
//! that equality and uniqueness checks never depend on floating-point noise.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Tolerance for boundary comparisons (margins, distances, grid bounds).
pub const EPSILON: f64 = 1e-9;

/// Resolution of the coordinate grid in metres.
pub const GRID_STEP: f64 = 0.1;

/// Number of grid cells per metre, used to derive integer keys.
const GRID_CELLS_PER_UNIT: f64 = 10.0;

/// Snaps a value onto the 0.1 grid (one decimal place).
///
/// # Examples
/// ```
/// use measure_planner::types::round_to_grid;
///
/// assert_eq!(round_to_grid(1.04), 1.0);
/// assert_eq!(round_to_grid(0.1 + 0.2), 0.3);
/// ```
#[inline]
pub fn round_to_grid(value: f64) -> f64 {
    (value * GRID_CELLS_PER_UNIT).round() / GRID_CELLS_PER_UNIT
}

/// Integer key of a value on the 0.1 grid.
///
/// Two values share a key exactly when they round to the same decimal.
#[inline]
pub fn grid_key(value: f64) -> i64 {
    (value * GRID_CELLS_PER_UNIT).round() as i64
}

/// A point in the floor plane.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    #[inline]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another planar point.
    #[inline]
    pub fn distance_to(&self, other: &Self) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    #[inline]
    pub fn snapped(&self) -> Self {
        Self::new(round_to_grid(self.x), round_to_grid(self.y))
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Represents a 3D point in the room volume.
///
/// `x` and `y` span the floor plane, `z` is the height above the floor.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    /// Creates a new 3D point.
    #[inline]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Projection onto the floor plane.
    #[inline]
    pub const fn xy(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }

    /// Calculates the Euclidean distance to another point.
    #[inline]
    pub fn distance_to(&self, other: &Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Returns a copy with every component snapped onto the 0.1 grid.
    #[inline]
    pub fn snapped(&self) -> Self {
        Self::new(
            round_to_grid(self.x),
            round_to_grid(self.y),
            round_to_grid(self.z),
        )
    }

    /// Integer grid keys of all three components.
    #[inline]
    pub fn grid_keys(&self) -> (i64, i64, i64) {
        (grid_key(self.x), grid_key(self.y), grid_key(self.z))
    }

    /// Component along the given axis.
    #[inline]
    pub fn component(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// Checks if all components are finite.
    #[inline]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// One of the three coordinate axes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn label(&self) -> &'static str {
        match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
        }
    }
}

/// Validation helpers shared by the model constructors.
pub mod validation {

    /// Checks that a value is finite.
    ///
    /// # Returns
    /// `Ok(())` for finite values, otherwise error text
    pub fn validate_finite(value: f64, name: &str) -> Result<(), String> {
        if value.is_nan() {
            return Err(format!("{} must not be NaN", name));
        }
        if value.is_infinite() {
            return Err(format!("{} must not be infinite", name));
        }
        Ok(())
    }

}

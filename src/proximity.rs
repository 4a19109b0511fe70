//! Uniform hash grid for neighbour distance queries.
//!
//! Space is divided into cubic cells whose edge equals the minimum required
//! point separation. A query only inspects the 3x3x3 block of cells around
//! the query point, so its cost follows local density instead of the total
//! number of indexed points.

use std::collections::HashMap;

use crate::types::Vec3;

/// Bits reserved per axis in a composed cell key.
const AXIS_BITS: u32 = 21;
const AXIS_MASK: i64 = (1 << AXIS_BITS) - 1;
const AXIS_BIAS: i64 = 1 << (AXIS_BITS - 1);

/// Hash grid over an owned list of points.
///
/// Points are addressed by insertion index. Removal is LIFO (`pop`), which is
/// all the backtracking search needs.
#[derive(Clone, Debug)]
pub struct ProximityIndex {
    cell_size: f64,
    cells: HashMap<i64, Vec<usize>>,
    points: Vec<Vec3>,
}

impl ProximityIndex {
    /// Creates an empty index.
    ///
    /// `cell_size` should equal the separation that queries check against;
    /// non-positive sizes fall back to 1.0.
    pub fn new(cell_size: f64) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            1.0
        };
        Self {
            cell_size,
            cells: HashMap::new(),
            points: Vec::new(),
        }
    }

    /// Creates an index filled with the given points.
    pub fn with_points(cell_size: f64, points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut index = Self::new(cell_size);
        for p in points {
            index.insert(p);
        }
        index
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Vec3] {
        &self.points
    }

    /// Adds a point and returns its index.
    pub fn insert(&mut self, point: Vec3) -> usize {
        let id = self.points.len();
        let (cx, cy, cz) = self.cell_coords(&point);
        self.cells
            .entry(compose_key(cx, cy, cz))
            .or_default()
            .push(id);
        self.points.push(point);
        id
    }

    /// Removes the most recently inserted point.
    pub fn pop(&mut self) -> Option<Vec3> {
        let point = self.points.pop()?;
        let id = self.points.len();
        let (cx, cy, cz) = self.cell_coords(&point);
        let key = compose_key(cx, cy, cz);
        if let Some(bucket) = self.cells.get_mut(&key) {
            bucket.retain(|&other| other != id);
            if bucket.is_empty() {
                self.cells.remove(&key);
            }
        }
        Some(point)
    }

    /// Indexed points in the 3x3x3 cell block around `point`.
    ///
    /// Every indexed point closer than one cell width is returned; farther
    /// points may be returned as well.
    pub fn query<'a>(&'a self, point: &Vec3) -> impl Iterator<Item = (usize, Vec3)> + use<'a> {
        let (cx, cy, cz) = self.cell_coords(point);
        NEIGHBOUR_OFFSETS
            .iter()
            .filter_map(move |&(dx, dy, dz)| self.cells.get(&compose_key(cx + dx, cy + dy, cz + dz)))
            .flatten()
            .map(move |&id| (id, self.points[id]))
    }

    /// `true` if any indexed point is strictly closer than `radius`.
    pub fn any_within(&self, point: &Vec3, radius: f64) -> bool {
        if radius <= self.cell_size {
            self.query(point)
                .any(|(_, other)| point.distance_to(&other) < radius)
        } else {
            self.points.iter().any(|other| point.distance_to(other) < radius)
        }
    }

    /// Distance to the nearest indexed point, `None` when empty.
    ///
    /// A neighbour within one cell width is provably the nearest overall;
    /// otherwise the whole point list is scanned.
    pub fn nearest_distance(&self, point: &Vec3) -> Option<f64> {
        if self.points.is_empty() {
            return None;
        }
        let local = self
            .query(point)
            .map(|(_, other)| point.distance_to(&other))
            .fold(f64::INFINITY, f64::min);
        if local <= self.cell_size {
            return Some(local);
        }
        Some(
            self.points
                .iter()
                .map(|other| point.distance_to(other))
                .fold(f64::INFINITY, f64::min),
        )
    }

    /// All index pairs `(i, j)` with `i < j` closer than `radius`, sorted.
    pub fn pairs_within(&self, radius: f64) -> Vec<(usize, usize)> {
        let mut pairs: Vec<(usize, usize)> = if radius <= self.cell_size {
            self.points
                .iter()
                .enumerate()
                .flat_map(move |(i, p)| {
                    self.query(p)
                        .filter(move |&(j, other)| j > i && p.distance_to(&other) < radius)
                        .map(move |(j, _)| (i, j))
                })
                .collect()
        } else {
            let n = self.points.len();
            (0..n)
                .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
                .filter(|&(i, j)| self.points[i].distance_to(&self.points[j]) < radius)
                .collect()
        };
        pairs.sort_unstable();
        pairs
    }

    #[inline]
    fn cell_coords(&self, p: &Vec3) -> (i64, i64, i64) {
        let discretize = |v: f64| (v / self.cell_size).floor() as i64;
        (discretize(p.x), discretize(p.y), discretize(p.z))
    }
}

/// Packs three cell coordinates into one lookup key.
#[inline]
fn compose_key(cx: i64, cy: i64, cz: i64) -> i64 {
    let pack = |c: i64| (c + AXIS_BIAS) & AXIS_MASK;
    (pack(cx) << (2 * AXIS_BITS)) | (pack(cy) << AXIS_BITS) | pack(cz)
}

const NEIGHBOUR_OFFSETS: [(i64, i64, i64); 27] = {
    let mut offsets = [(0, 0, 0); 27];
    let mut i = 0;
    while i < 27 {
        offsets[i] = ((i / 9) as i64 - 1, ((i / 3) % 3) as i64 - 1, (i % 3) as i64 - 1);
        i += 1;
    }
    offsets
};

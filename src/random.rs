//! Injectable randomness for the point search.
//!
//! The search never touches a global generator. It draws from a
//! `RandomSource`, which is either derived from a seed text (fully
//! reproducible), derived from the regeneration counter (varies per click,
//! still reproducible for a given counter), or replayed from a fixed stream in
//! tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of uniformly distributed values in `[0, 1)`.
pub trait RandomSource {
    fn next_f64(&mut self) -> f64;

    /// Uniform index in `0..len`; `len` must be non-zero.
    fn next_index(&mut self, len: usize) -> usize {
        debug_assert!(len > 0);
        ((self.next_f64() * len as f64) as usize).min(len.saturating_sub(1))
    }
}

/// Mixing constant applied to the regeneration counter.
const GENERATION_MIX: u64 = 0x9e37_79b9;

/// Seed value of a seed text: the sum of its UTF-16 code units.
///
/// # Examples
/// ```
/// use measure_planner::random::seed_value;
///
/// assert_eq!(seed_value("ab"), 97 + 98);
/// ```
pub fn seed_value(text: &str) -> u64 {
    text.encode_utf16().map(u64::from).sum()
}

/// Normalizes an optional seed: empty text counts as no seed.
pub fn effective_seed(seed: Option<&str>) -> Option<&str> {
    seed.filter(|s| !s.is_empty())
}

/// Pseudo-random generator behind the search.
#[derive(Clone, Debug)]
pub struct SeededRandom {
    rng: StdRng,
}

impl SeededRandom {
    pub fn from_u64(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Generator for a user supplied seed text.
    pub fn from_seed_text(text: &str) -> Self {
        Self::from_u64(seed_value(text))
    }

    /// Generator for an unseeded run, keyed by the regeneration counter.
    pub fn from_generation(generation: u64) -> Self {
        Self::from_u64(generation.wrapping_mul(GENERATION_MIX) ^ 0x5eed_0000_0000_0000)
    }

    /// Seed text when present, otherwise the regeneration counter.
    pub fn for_request(seed: Option<&str>, generation: u64) -> Self {
        match effective_seed(seed) {
            Some(text) => Self::from_seed_text(text),
            None => Self::from_generation(generation),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&mut self) -> f64 {
        self.rng.random::<f64>()
    }
}

/// Replays a fixed list of values, cycling when exhausted.
#[derive(Clone, Debug)]
pub struct ReplayRandom {
    values: Vec<f64>,
    cursor: usize,
}

impl ReplayRandom {
    /// Values outside `[0, 1)` are clamped into range; an empty list replays `0.0`.
    pub fn new(values: Vec<f64>) -> Self {
        let values = values
            .into_iter()
            .map(|v| if v.is_finite() { v.clamp(0.0, 1.0 - f64::EPSILON) } else { 0.0 })
            .collect();
        Self { values, cursor: 0 }
    }

    /// A stream that always yields the same value.
    pub fn constant(value: f64) -> Self {
        Self::new(vec![value])
    }
}

impl RandomSource for ReplayRandom {
    fn next_f64(&mut self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let value = self.values[self.cursor % self.values.len()];
        self.cursor = self.cursor.wrapping_add(1);
        value
    }
}

//! Immutable planning session state.
//!
//! A `Scene` bundles the enclosure, the sources, the current measurement
//! points and the randomness inputs. Every edit returns a new scene; the
//! engine functions never keep state between calls.

use serde::{Deserialize, Serialize};
#[allow(unused_imports)]
use serde_json::json;
use utoipa::ToSchema;

use crate::candidates::{CandidateSpace, build_candidates};
use crate::model::{Enclosure, LayoutRules, SourcePoint, ValidationError, ViolationReport};
use crate::optimizer::{SearchConfig, SearchInput, SearchOutcome, select_points};
use crate::random::effective_seed;
use crate::types::{Vec2, Vec3};
use crate::validator::validate;

/// Snapshot of a planning session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "enclosure": {
        "vertices": [
            { "x": 0.0, "y": 0.0 },
            { "x": 3.0, "y": 0.0 },
            { "x": 3.0, "y": 2.0 },
            { "x": 0.0, "y": 2.0 }
        ],
        "height": 2.5
    },
    "sources": [
        { "position": { "x": 0.5, "y": 1.5, "z": 1.8 }, "active": true },
        { "position": { "x": 2.5, "y": 0.5, "z": 1.1 }, "active": true }
    ],
    "measurements": [],
    "seed": null,
    "generation": 0
}))]
pub struct Scene {
    pub enclosure: Enclosure,
    pub sources: Vec<SourcePoint>,
    #[serde(default)]
    pub measurements: Vec<Vec3>,
    #[serde(default)]
    pub seed: Option<String>,
    /// Regeneration counter, advanced after every unseeded generation
    #[serde(default)]
    pub generation: u64,
}

/// How a generated layout should be presented.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    /// Every rule holds
    Valid,
    /// The layout was found but the scene still reports issues (e.g. sources too close)
    ValidWithWarnings,
    /// No valid layout exists within the search budget
    Infeasible,
}

/// Result of `Scene::generate`.
#[derive(Clone, Debug, PartialEq, Serialize, ToSchema)]
pub struct Generation {
    pub scene: Scene,
    pub outcome: SearchOutcome,
    pub report: ViolationReport,
    pub status: GenerationStatus,
    /// Flat list of the remaining issues, empty for a valid layout
    pub issues: Vec<String>,
}

impl Default for Scene {
    /// The reference room: 3 m x 2 m, 2.5 m high, two active sources.
    fn default() -> Self {
        Self {
            enclosure: Enclosure {
                vertices: vec![
                    Vec2::new(0.0, 0.0),
                    Vec2::new(3.0, 0.0),
                    Vec2::new(3.0, 2.0),
                    Vec2::new(0.0, 2.0),
                ],
                height: 2.5,
            },
            sources: vec![
                SourcePoint::active(Vec3::new(0.5, 1.5, 1.8)),
                SourcePoint::active(Vec3::new(2.5, 0.5, 1.1)),
            ],
            measurements: Vec::new(),
            seed: None,
            generation: 0,
        }
    }
}

impl Scene {
    pub fn new(enclosure: Enclosure, sources: Vec<SourcePoint>) -> Self {
        Self {
            enclosure,
            sources,
            ..Self::default()
        }
    }

    /// Replaces the floor polygon; vertices are snapped to the grid.
    pub fn with_vertices(&self, vertices: Vec<Vec2>) -> Result<Self, ValidationError> {
        let vertices = vertices.iter().map(Vec2::snapped).collect();
        let enclosure = Enclosure::new(vertices, self.enclosure.height)?;
        Ok(Self {
            enclosure,
            ..self.clone()
        })
    }

    /// Replaces the ceiling height.
    pub fn with_height(&self, height: f64) -> Result<Self, ValidationError> {
        let enclosure = Enclosure::new(self.enclosure.vertices.clone(), height)?;
        Ok(Self {
            enclosure,
            ..self.clone()
        })
    }

    /// Moves a source; the position is snapped to the grid.
    pub fn with_source(&self, index: usize, position: Vec3) -> Result<Self, ValidationError> {
        let position = checked_position(position)?;
        let mut next = self.clone();
        next.sources
            .get_mut(index)
            .ok_or(ValidationError::UnknownSource(index))?
            .position = position;
        Ok(next)
    }

    /// Switches a source on or off.
    pub fn with_source_active(&self, index: usize, active: bool) -> Result<Self, ValidationError> {
        let mut next = self.clone();
        next.sources
            .get_mut(index)
            .ok_or(ValidationError::UnknownSource(index))?
            .active = active;
        Ok(next)
    }

    /// Moves a measurement point; the position is snapped to the grid.
    pub fn with_measurement(&self, index: usize, position: Vec3) -> Result<Self, ValidationError> {
        let position = checked_position(position)?;
        let mut next = self.clone();
        *next
            .measurements
            .get_mut(index)
            .ok_or(ValidationError::UnknownMeasurement(index))? = position;
        Ok(next)
    }

    /// Sets the seed; empty text clears it.
    pub fn with_seed(&self, seed: Option<&str>) -> Self {
        Self {
            seed: effective_seed(seed).map(str::to_owned),
            ..self.clone()
        }
    }

    /// Removes all measurement points.
    pub fn cleared(&self) -> Self {
        Self {
            measurements: Vec::new(),
            ..self.clone()
        }
    }

    pub fn is_seeded(&self) -> bool {
        effective_seed(self.seed.as_deref()).is_some()
    }

    /// Candidate space of the current enclosure.
    pub fn candidates(&self, rules: &LayoutRules) -> Result<CandidateSpace, ValidationError> {
        self.enclosure.check()?;
        build_candidates(&self.enclosure, rules.margin, LayoutRules::DEFAULT_STEP)
    }

    /// Violations of the current points.
    pub fn validate(&self, rules: &LayoutRules) -> ViolationReport {
        validate(&self.sources, &self.measurements, &self.enclosure, rules)
    }

    /// Replaces the measurement points with a freshly searched layout.
    ///
    /// Unseeded scenes advance their generation counter so the next call
    /// explores a different solution.
    pub fn generate(
        &self,
        rules: &LayoutRules,
        config: &SearchConfig,
    ) -> Result<Generation, ValidationError> {
        let space = self.candidates(rules)?;
        let outcome = select_points(
            &SearchInput {
                sources: &self.sources,
                candidates: space.points(),
                seed: self.seed.as_deref(),
                generation: self.generation,
            },
            rules,
            config,
        );

        let mut scene = Self {
            measurements: outcome.points.clone(),
            ..self.clone()
        };
        if !scene.is_seeded() {
            scene.generation = scene.generation.wrapping_add(1);
        }

        let report = scene.validate(rules);
        let issues = report.summary();
        let status = match (outcome.feasible, issues.is_empty()) {
            (true, true) => GenerationStatus::Valid,
            (true, false) => GenerationStatus::ValidWithWarnings,
            (false, _) => GenerationStatus::Infeasible,
        };

        Ok(Generation {
            scene,
            outcome,
            report,
            status,
            issues,
        })
    }

    /// Skips one generation step before generating, asking for another combination.
    pub fn generate_another(
        &self,
        rules: &LayoutRules,
        config: &SearchConfig,
    ) -> Result<Generation, ValidationError> {
        Self {
            generation: self.generation.wrapping_add(1),
            ..self.clone()
        }
        .generate(rules, config)
    }
}

fn checked_position(position: Vec3) -> Result<Vec3, ValidationError> {
    if !position.is_finite() {
        return Err(ValidationError::NonFiniteValue(format!(
            "Position ({}, {}, {}) must be finite",
            position.x, position.y, position.z
        )));
    }
    Ok(position.snapped())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MEASUREMENT_POINT_COUNT;

    #[test]
    fn default_scene_is_the_reference_room() {
        let scene = Scene::default();
        assert!(scene.enclosure.check().is_ok());
        assert!((scene.enclosure.area() - 6.0).abs() < 1e-9);
        assert_eq!(scene.sources.len(), 2);
        assert!(scene.validate(&LayoutRules::default()).is_clean());
    }

    #[test]
    fn transitions_leave_the_original_untouched() {
        let scene = Scene::default();
        let moved = scene.with_source(0, Vec3::new(0.74, 1.46, 1.81)).unwrap();
        assert_eq!(moved.sources[0].position, Vec3::new(0.7, 1.5, 1.8));
        assert_eq!(scene.sources[0].position, Vec3::new(0.5, 1.5, 1.8));

        let off = scene.with_source_active(1, false).unwrap();
        assert!(!off.sources[1].active);
        assert!(scene.sources[1].active);
    }

    #[test]
    fn transitions_reject_bad_input() {
        let scene = Scene::default();
        assert_eq!(
            scene.with_source(5, Vec3::new(0.0, 0.0, 0.0)),
            Err(ValidationError::UnknownSource(5))
        );
        assert_eq!(
            scene.with_measurement(0, Vec3::new(0.0, 0.0, 0.0)),
            Err(ValidationError::UnknownMeasurement(0))
        );
        assert!(matches!(
            scene.with_source(0, Vec3::new(f64::NAN, 0.0, 0.0)),
            Err(ValidationError::NonFiniteValue(_))
        ));
        assert_eq!(
            scene.with_height(-1.0),
            Err(ValidationError::NonPositiveHeight(-1.0))
        );
        assert_eq!(
            scene.with_vertices(vec![Vec2::new(0.0, 0.0)]),
            Err(ValidationError::TooFewVertices(1))
        );
    }

    #[test]
    fn vertices_are_snapped() {
        let scene = Scene::default()
            .with_vertices(vec![
                Vec2::new(0.01, 0.0),
                Vec2::new(4.04, 0.0),
                Vec2::new(4.0, 3.06),
                Vec2::new(0.0, 2.96),
            ])
            .unwrap();
        assert_eq!(scene.enclosure.vertices[1], Vec2::new(4.0, 0.0));
        assert_eq!(scene.enclosure.vertices[2], Vec2::new(4.0, 3.1));
    }

    #[test]
    fn seeded_generation_is_repeatable() {
        let scene = Scene::default().with_seed(Some("test123"));
        let rules = LayoutRules::default();
        let config = SearchConfig::default();

        let first = scene.generate(&rules, &config).unwrap();
        assert_eq!(first.status, GenerationStatus::Valid);
        assert!(first.issues.is_empty());
        assert_eq!(first.scene.measurements.len(), MEASUREMENT_POINT_COUNT);
        assert_eq!(first.scene.generation, 0);

        let again = first.scene.generate(&rules, &config).unwrap();
        assert_eq!(again.scene.measurements, first.scene.measurements);
    }

    #[test]
    fn unseeded_generation_advances_the_counter() {
        let scene = Scene::default().with_seed(Some(""));
        assert!(!scene.is_seeded());
        let rules = LayoutRules::default();
        let config = SearchConfig::default();

        let first = scene.generate(&rules, &config).unwrap();
        assert_eq!(first.scene.generation, 1);
        let second = first.scene.generate(&rules, &config).unwrap();
        assert_eq!(second.scene.generation, 2);

        let another = scene.generate_another(&rules, &config).unwrap();
        assert_eq!(another.scene.generation, 2);
        assert_eq!(another.scene.measurements, second.scene.measurements);
    }

    #[test]
    fn edits_after_generation_are_revalidated() {
        let rules = LayoutRules::default();
        let generated = Scene::default()
            .with_seed(Some("test123"))
            .generate(&rules, &SearchConfig::default())
            .unwrap()
            .scene;
        let first = generated.measurements[0];
        let edited = generated.with_measurement(1, first).unwrap();
        let report = edited.validate(&rules);
        assert!(!report.measurements[0].is_clean());
        assert!(!report.measurements[1].is_clean());
        assert!(edited.cleared().measurements.is_empty());
    }

    #[test]
    fn tiny_room_is_infeasible_without_error() {
        let scene = Scene::default()
            .with_vertices(vec![
                Vec2::new(0.0, 0.0),
                Vec2::new(0.6, 0.0),
                Vec2::new(0.6, 0.6),
                Vec2::new(0.0, 0.6),
            ])
            .unwrap();
        let generation = scene
            .generate(&LayoutRules::default(), &SearchConfig::default())
            .unwrap();
        assert_eq!(generation.status, GenerationStatus::Infeasible);
        assert!(generation.scene.measurements.is_empty());
    }

    #[test]
    fn close_sources_produce_warnings() {
        let scene = Scene::default()
            .with_source(1, Vec3::new(0.9, 1.4, 1.6))
            .unwrap()
            .with_seed(Some("test123"));
        let generation = scene
            .generate(&LayoutRules::default(), &SearchConfig::default())
            .unwrap();
        assert!(generation.outcome.feasible);
        assert_eq!(generation.status, GenerationStatus::ValidWithWarnings);
        assert!(generation.issues.iter().any(|line| line.starts_with("F1:")));
    }
}

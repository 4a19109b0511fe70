//! Point selection search.
//!
//! Picks the measurement points from a candidate space with a randomized,
//! bounded backtracking search:
//! - Every slot prefers a Z level near `1.0 + 0.1 * slot`
//! - Candidates are ranked by a maximin score against sources and chosen points
//! - Up to `max_solutions` fully valid layouts are collected, one is selected
//!   and locally refined
//! - When no valid layout exists within budget, a greedy fallback with
//!   progressively relaxed rules still returns a complete layout

use std::collections::{BTreeMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;
use utoipa::ToSchema;

use crate::model::{LayoutRules, MEASUREMENT_POINT_COUNT, SourcePoint};
use crate::proximity::ProximityIndex;
use crate::random::{RandomSource, SeededRandom, effective_seed};
use crate::types::{EPSILON, Vec3, grid_key, round_to_grid};

/// Weight of the random tie-breaker added to the maximin score.
const SCORE_JITTER: f64 = 0.05;
/// Additional jitter applied when ranking a slot's pool.
const RANK_JITTER: f64 = 0.02;
/// Jitter applied when ordering Z levels by preference.
const LEVEL_JITTER: f64 = 0.001;
/// Interrupt checks (cancel flag, deadline) run once per this many nodes.
const CHECK_INTERVAL: usize = 256;
/// A progress event is emitted once per this many nodes.
const PROGRESS_INTERVAL: usize = 4096;

/// Tuning parameters of the search.
///
/// The defaults bound a single run to a few tens of milliseconds for rooms of
/// typical size.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SearchConfig {
    /// Maximum number of visited search nodes
    pub node_budget: usize,
    /// Number of valid layouts after which the search stops
    pub max_solutions: usize,
    /// Candidates kept per Z level before scaling
    pub base_top_candidates: usize,
    /// Lower bound for the scaled candidate count
    pub min_top_candidates: usize,
    /// Z levels tried per slot before scaling
    pub base_top_z_levels: usize,
    /// Lower bound for the scaled Z level count
    pub min_top_z_levels: usize,
    /// Candidate count at which branching starts to shrink
    pub scaling_reference: f64,
    /// Hill-climbing passes over the selected layout
    pub refinement_passes: usize,
    /// Number of best candidates the fallback draws from
    pub fallback_pool: usize,
    /// Preferred height of the first slot
    pub preferred_base_z: f64,
    /// Increase of the preferred height per slot
    pub preferred_z_step: f64,
    /// Wall-clock limit, `None` for unlimited
    pub time_limit: Option<Duration>,
}

impl SearchConfig {
    pub const DEFAULT_NODE_BUDGET: usize = 60_000;
    pub const DEFAULT_MAX_SOLUTIONS: usize = 20;
    pub const DEFAULT_BASE_TOP_CANDIDATES: usize = 22;
    pub const DEFAULT_MIN_TOP_CANDIDATES: usize = 8;
    pub const DEFAULT_BASE_TOP_Z_LEVELS: usize = 18;
    pub const DEFAULT_MIN_TOP_Z_LEVELS: usize = 6;
    pub const DEFAULT_SCALING_REFERENCE: f64 = 5000.0;
    pub const DEFAULT_REFINEMENT_PASSES: usize = 2;
    pub const DEFAULT_FALLBACK_POOL: usize = 20;
    pub const DEFAULT_PREFERRED_BASE_Z: f64 = 1.0;
    pub const DEFAULT_PREFERRED_Z_STEP: f64 = 0.1;

    /// Creates a builder for a custom configuration.
    pub fn builder() -> SearchConfigBuilder {
        SearchConfigBuilder::default()
    }

    /// Branching limits `(candidates per level, levels per slot)` for a
    /// candidate space of the given size.
    ///
    /// Both shrink linearly once the space exceeds `scaling_reference`, down
    /// to half their base value, and never below their minimum.
    ///
    /// # Examples
    /// ```
    /// use measure_planner::optimizer::SearchConfig;
    ///
    /// let config = SearchConfig::default();
    /// assert_eq!(config.branching_limits(3_696), (22, 18));
    /// assert_eq!(config.branching_limits(100_000), (11, 9));
    /// ```
    pub fn branching_limits(&self, candidate_count: usize) -> (usize, usize) {
        let scale = (self.scaling_reference / candidate_count.max(1) as f64).clamp(0.5, 1.0);
        let scaled = |base: usize, min: usize| ((base as f64 * scale).floor() as usize).max(min);
        (
            scaled(self.base_top_candidates, self.min_top_candidates),
            scaled(self.base_top_z_levels, self.min_top_z_levels),
        )
    }

    /// Preferred Z level of a slot, snapped to the grid.
    pub fn preferred_z(&self, slot: usize) -> f64 {
        round_to_grid(self.preferred_base_z + self.preferred_z_step * slot as f64)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            node_budget: Self::DEFAULT_NODE_BUDGET,
            max_solutions: Self::DEFAULT_MAX_SOLUTIONS,
            base_top_candidates: Self::DEFAULT_BASE_TOP_CANDIDATES,
            min_top_candidates: Self::DEFAULT_MIN_TOP_CANDIDATES,
            base_top_z_levels: Self::DEFAULT_BASE_TOP_Z_LEVELS,
            min_top_z_levels: Self::DEFAULT_MIN_TOP_Z_LEVELS,
            scaling_reference: Self::DEFAULT_SCALING_REFERENCE,
            refinement_passes: Self::DEFAULT_REFINEMENT_PASSES,
            fallback_pool: Self::DEFAULT_FALLBACK_POOL,
            preferred_base_z: Self::DEFAULT_PREFERRED_BASE_Z,
            preferred_z_step: Self::DEFAULT_PREFERRED_Z_STEP,
            time_limit: None,
        }
    }
}

/// Builder for `SearchConfig`.
#[derive(Clone, Debug, Default)]
pub struct SearchConfigBuilder {
    config: SearchConfig,
}

impl SearchConfigBuilder {
    pub fn node_budget(mut self, budget: usize) -> Self {
        self.config.node_budget = budget;
        self
    }

    /// Sets the solution cap; values below 1 are raised to 1.
    pub fn max_solutions(mut self, max: usize) -> Self {
        self.config.max_solutions = max.max(1);
        self
    }

    pub fn top_candidates(mut self, base: usize, min: usize) -> Self {
        self.config.base_top_candidates = base;
        self.config.min_top_candidates = min;
        self
    }

    pub fn top_z_levels(mut self, base: usize, min: usize) -> Self {
        self.config.base_top_z_levels = base;
        self.config.min_top_z_levels = min;
        self
    }

    pub fn refinement_passes(mut self, passes: usize) -> Self {
        self.config.refinement_passes = passes;
        self
    }

    /// Sets the fallback pool; values below 1 are raised to 1.
    pub fn fallback_pool(mut self, pool: usize) -> Self {
        self.config.fallback_pool = pool.max(1);
        self
    }

    pub fn preferred_z(mut self, base: f64, step: f64) -> Self {
        self.config.preferred_base_z = base;
        self.config.preferred_z_step = step;
        self
    }

    pub fn time_limit(mut self, limit: Option<Duration>) -> Self {
        self.config.time_limit = limit;
        self
    }

    pub fn build(self) -> SearchConfig {
        self.config
    }
}

/// Explicit inputs of one search run.
#[derive(Clone, Copy, Debug)]
pub struct SearchInput<'a> {
    pub sources: &'a [SourcePoint],
    pub candidates: &'a [Vec3],
    /// Seed text; `None` or empty means unseeded
    pub seed: Option<&'a str>,
    /// Regeneration counter, selects among solutions of unseeded runs
    pub generation: u64,
}

/// Shared cancellation signal for a running search.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Why the backtracking phase stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The bounded search tree was fully explored
    Exhausted,
    /// Enough valid layouts were collected
    SolutionCap,
    NodeBudget,
    Deadline,
    Cancelled,
    /// Nothing to choose from
    NoCandidates,
}

/// Rule set a fallback slot was filled under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FallbackTier {
    /// Distances and axis uniqueness
    Strict,
    /// Axis uniqueness only
    Unique,
    /// Any candidate
    Unconstrained,
}

impl FallbackTier {
    pub const ALL: [FallbackTier; 3] = [
        FallbackTier::Strict,
        FallbackTier::Unique,
        FallbackTier::Unconstrained,
    ];
}

/// Counters and decisions of one search run.
#[derive(Clone, Debug, PartialEq, Serialize, ToSchema)]
pub struct SearchDiagnostics {
    pub candidate_count: usize,
    pub top_candidates: usize,
    pub top_z_levels: usize,
    pub nodes_visited: usize,
    pub solutions_found: usize,
    /// Partial layouts cut off because their next slot only had relaxed candidates
    pub relaxed_prunes: usize,
    /// Index of the solution that was returned
    pub selected_solution: Option<usize>,
    /// Point replacements made by the local refinement
    pub refinement_moves: usize,
    pub termination: Termination,
    /// Tier used for each slot when the fallback ran
    pub fallback_tiers: Vec<FallbackTier>,
}

/// Result of a search run.
///
/// `feasible` is `true` only when the points satisfy every layout rule;
/// otherwise they are the best effort of the fallback.
#[derive(Clone, Debug, PartialEq, Serialize, ToSchema)]
pub struct SearchOutcome {
    pub points: Vec<Vec3>,
    pub feasible: bool,
    pub diagnostics: SearchDiagnostics,
}

/// Progress events of a search, for live streaming.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum SearchEvent {
    /// The search starts.
    Started {
        candidate_count: usize,
        top_candidates: usize,
        top_z_levels: usize,
        seeded: bool,
    },
    /// A valid layout was collected.
    SolutionFound {
        index: usize,
        nodes_visited: usize,
        points: Vec<Vec3>,
    },
    /// Periodic heartbeat.
    Progress {
        nodes_visited: usize,
        solutions_found: usize,
    },
    /// No valid layout was found; the greedy fallback takes over.
    FallbackStarted { termination: Termination },
    /// Search finished.
    Finished {
        feasible: bool,
        termination: Termination,
        nodes_visited: usize,
        solutions_found: usize,
        points: Vec<Vec3>,
    },
}

/// Runs the search with the generator implied by the input's seed or generation.
///
/// # Parameters
/// * `input` - Sources, candidates, seed and regeneration counter
/// * `rules` - Distances and uniqueness policy the layout must satisfy
/// * `config` - Search bounds
///
/// # Returns
/// Identical inputs always yield an identical outcome unless a time limit
/// interrupts the search.
pub fn select_points(
    input: &SearchInput<'_>,
    rules: &LayoutRules,
    config: &SearchConfig,
) -> SearchOutcome {
    let mut rng = SeededRandom::for_request(input.seed, input.generation);
    select_points_with(input, rules, config, &mut rng, &CancelFlag::new(), |_| {})
}

/// Runs the search with an injected random source, cancel flag and event callback.
pub fn select_points_with(
    input: &SearchInput<'_>,
    rules: &LayoutRules,
    config: &SearchConfig,
    rng: &mut dyn RandomSource,
    cancel: &CancelFlag,
    mut on_event: impl FnMut(&SearchEvent),
) -> SearchOutcome {
    if input.candidates.is_empty() {
        let (top_candidates, top_z_levels) = config.branching_limits(0);
        let outcome = SearchOutcome {
            points: Vec::new(),
            feasible: false,
            diagnostics: SearchDiagnostics {
                candidate_count: 0,
                top_candidates,
                top_z_levels,
                nodes_visited: 0,
                solutions_found: 0,
                relaxed_prunes: 0,
                selected_solution: None,
                refinement_moves: 0,
                termination: Termination::NoCandidates,
                fallback_tiers: Vec::new(),
            },
        };
        on_event(&SearchEvent::Finished {
            feasible: false,
            termination: Termination::NoCandidates,
            nodes_visited: 0,
            solutions_found: 0,
            points: Vec::new(),
        });
        debug!("Point search skipped: empty candidate space");
        return outcome;
    }

    let mut search = Search::new(input, rules, config, rng, cancel, &mut on_event);
    search.run()
}

/// Candidates addressed by integer index, grouped by Z level.
struct CandidateArena {
    points: Vec<Vec3>,
    keys: Vec<(i64, i64, i64)>,
    by_z: BTreeMap<i64, Vec<usize>>,
}

impl CandidateArena {
    fn new(candidates: &[Vec3]) -> Self {
        let points = candidates.to_vec();
        let keys: Vec<(i64, i64, i64)> = points.iter().map(Vec3::grid_keys).collect();
        let mut by_z: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (id, key) in keys.iter().enumerate() {
            by_z.entry(key.2).or_default().push(id);
        }
        Self { points, keys, by_z }
    }

    fn level(&self, z_key: i64) -> &[usize] {
        self.by_z.get(&z_key).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Maximin score of a candidate.
///
/// `d_chosen` falls back to `d_sources` before the first point is placed;
/// missing distances contribute nothing.
fn maximin_score(d_chosen: Option<f64>, d_sources: Option<f64>) -> f64 {
    match (d_chosen.or(d_sources), d_sources) {
        (Some(b), Some(r)) => 10.0 * b.min(r) + 2.0 * b + r,
        (Some(b), None) => 12.0 * b,
        _ => 0.0,
    }
}

fn min_distance<'p>(point: &Vec3, others: impl IntoIterator<Item = &'p Vec3>) -> Option<f64> {
    others
        .into_iter()
        .map(|other| point.distance_to(other))
        .reduce(f64::min)
}

struct Search<'a> {
    arena: CandidateArena,
    sources: Vec<Vec3>,
    rules: &'a LayoutRules,
    config: &'a SearchConfig,
    rng: &'a mut dyn RandomSource,
    cancel: &'a CancelFlag,
    on_event: &'a mut dyn FnMut(&SearchEvent),
    seeded: bool,
    generation: u64,
    deadline: Option<Instant>,
    top_candidates: usize,
    top_z_levels: usize,
    z_options: Vec<Vec<i64>>,
    reserved: (HashSet<i64>, HashSet<i64>, HashSet<i64>),
    used_x: HashSet<i64>,
    used_y: HashSet<i64>,
    used_z: HashSet<i64>,
    chosen: Vec<usize>,
    chosen_index: ProximityIndex,
    nodes: usize,
    solutions: Vec<Vec<usize>>,
    relaxed_prunes: usize,
}

impl<'a> Search<'a> {
    fn new(
        input: &SearchInput<'_>,
        rules: &'a LayoutRules,
        config: &'a SearchConfig,
        rng: &'a mut dyn RandomSource,
        cancel: &'a CancelFlag,
        on_event: &'a mut dyn FnMut(&SearchEvent),
    ) -> Self {
        let arena = CandidateArena::new(input.candidates);
        let sources: Vec<Vec3> = input
            .sources
            .iter()
            .filter(|s| s.active)
            .map(|s| s.position)
            .collect();

        let reserved_x: HashSet<i64> = sources.iter().map(|s| grid_key(s.x)).collect();
        let reserved_y: HashSet<i64> = sources.iter().map(|s| grid_key(s.y)).collect();
        let reserved_z: HashSet<i64> = if rules.sources_share_z_uniqueness() {
            sources.iter().map(|s| grid_key(s.z)).collect()
        } else {
            HashSet::new()
        };

        let (top_candidates, top_z_levels) = config.branching_limits(arena.points.len());
        let seeded = effective_seed(input.seed).is_some();

        let mut search = Self {
            arena,
            sources,
            rules,
            config,
            rng,
            cancel,
            on_event,
            seeded,
            generation: input.generation,
            deadline: config.time_limit.map(|limit| Instant::now() + limit),
            top_candidates,
            top_z_levels,
            z_options: Vec::new(),
            used_x: reserved_x.clone(),
            used_y: reserved_y.clone(),
            used_z: reserved_z.clone(),
            reserved: (reserved_x, reserved_y, reserved_z),
            chosen: Vec::with_capacity(MEASUREMENT_POINT_COUNT),
            chosen_index: ProximityIndex::new(rules.min_point_spacing),
            nodes: 0,
            solutions: Vec::new(),
            relaxed_prunes: 0,
        };
        let z_options: Vec<Vec<i64>> = (0..MEASUREMENT_POINT_COUNT)
            .map(|slot| search.rank_levels(config.preferred_z(slot)))
            .collect();
        search.z_options = z_options;
        search
    }

    fn run(&mut self) -> SearchOutcome {
        self.emit(SearchEvent::Started {
            candidate_count: self.arena.points.len(),
            top_candidates: self.top_candidates,
            top_z_levels: self.top_z_levels,
            seeded: self.seeded,
        });

        let termination = match self.descend(0) {
            ControlFlow::Break(reason) => reason,
            ControlFlow::Continue(()) => Termination::Exhausted,
        };

        let mut selected_solution = None;
        let mut refinement_moves = 0;
        let mut fallback_tiers = Vec::new();
        let feasible = !self.solutions.is_empty();

        let picked = if feasible {
            let index = if self.seeded {
                0
            } else {
                (self.generation % self.solutions.len() as u64) as usize
            };
            selected_solution = Some(index);
            let mut layout = self.solutions[index].clone();
            refinement_moves = self.refine(&mut layout);
            layout
        } else {
            self.emit(SearchEvent::FallbackStarted { termination });
            let (layout, tiers) = self.fallback();
            fallback_tiers = tiers;
            layout
        };

        let points: Vec<Vec3> = picked.iter().map(|&id| self.arena.points[id]).collect();

        debug!(
            nodes = self.nodes,
            solutions = self.solutions.len(),
            relaxed = self.relaxed_prunes,
            ?termination,
            feasible,
            "Point search finished"
        );
        self.emit(SearchEvent::Finished {
            feasible,
            termination,
            nodes_visited: self.nodes,
            solutions_found: self.solutions.len(),
            points: points.clone(),
        });

        SearchOutcome {
            points,
            feasible,
            diagnostics: SearchDiagnostics {
                candidate_count: self.arena.points.len(),
                top_candidates: self.top_candidates,
                top_z_levels: self.top_z_levels,
                nodes_visited: self.nodes,
                solutions_found: self.solutions.len(),
                relaxed_prunes: self.relaxed_prunes,
                selected_solution,
                refinement_moves,
                termination,
                fallback_tiers,
            },
        }
    }

    /// Z level keys ordered by closeness to `preferred`, with jitter, rotated when unseeded.
    fn rank_levels(&mut self, preferred: f64) -> Vec<i64> {
        let levels: Vec<i64> = self.arena.by_z.keys().copied().collect();
        let mut ranked: Vec<(i64, f64)> = levels
            .into_iter()
            .map(|key| {
                let distance = (key as f64 / 10.0 - preferred).abs();
                (key, distance + self.rng.next_f64() * LEVEL_JITTER)
            })
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        let mut keys: Vec<i64> = ranked.into_iter().map(|(key, _)| key).collect();
        if !self.seeded && !keys.is_empty() {
            let rotation = self.rng.next_index(keys.len());
            keys.rotate_left(rotation);
        }
        keys
    }

    fn descend(&mut self, slot: usize) -> ControlFlow<Termination> {
        self.nodes += 1;
        if self.nodes > self.config.node_budget {
            return ControlFlow::Break(Termination::NodeBudget);
        }
        if (self.nodes - 1) % CHECK_INTERVAL == 0 {
            if let Some(reason) = self.interruption() {
                return ControlFlow::Break(reason);
            }
        }
        if self.nodes % PROGRESS_INTERVAL == 0 {
            self.emit(SearchEvent::Progress {
                nodes_visited: self.nodes,
                solutions_found: self.solutions.len(),
            });
        }

        if slot == MEASUREMENT_POINT_COUNT {
            self.solutions.push(self.chosen.clone());
            let points = self.chosen.iter().map(|&id| self.arena.points[id]).collect();
            self.emit(SearchEvent::SolutionFound {
                index: self.solutions.len() - 1,
                nodes_visited: self.nodes,
                points,
            });
            if self.solutions.len() >= self.config.max_solutions {
                return ControlFlow::Break(Termination::SolutionCap);
            }
            return ControlFlow::Continue(());
        }

        let levels: Vec<i64> = self.z_options[slot]
            .iter()
            .take(self.top_z_levels)
            .copied()
            .collect();
        let mut strict_levels = 0;
        let mut relaxed_levels = 0;
        for z_key in levels {
            if self.used_z.contains(&z_key) {
                continue;
            }
            let pool: Vec<usize> = self
                .arena
                .level(z_key)
                .iter()
                .copied()
                .filter(|&id| self.axes_free(id))
                .collect();
            if pool.is_empty() {
                continue;
            }
            let strict_pool: Vec<usize> = pool
                .into_iter()
                .filter(|&id| self.keeps_distances(id))
                .collect();
            // Relaxed levels are counted, never descended.
            if strict_pool.is_empty() {
                relaxed_levels += 1;
                continue;
            }
            strict_levels += 1;

            let top = self.top_candidates;
            for id in self.rank(&strict_pool, RANK_JITTER, top) {
                self.push(id);
                let flow = self.descend(slot + 1);
                self.pop(id);
                flow?;
            }
        }
        if strict_levels == 0 && relaxed_levels > 0 {
            self.relaxed_prunes += 1;
        }
        ControlFlow::Continue(())
    }

    fn interruption(&self) -> Option<Termination> {
        if self.cancel.is_cancelled() {
            return Some(Termination::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Some(Termination::Deadline);
        }
        None
    }

    /// Scores `pool` with jitter and returns the best `limit` ids, best first.
    fn rank(&mut self, pool: &[usize], extra_jitter: f64, limit: usize) -> Vec<usize> {
        let mut scored: Vec<(usize, f64)> = Vec::with_capacity(pool.len());
        for &id in pool {
            let base = self.score(&self.arena.points[id]);
            let jitter = self.rng.next_f64() * SCORE_JITTER + self.rng.next_f64() * extra_jitter;
            scored.push((id, base + jitter));
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(limit);
        scored.into_iter().map(|(id, _)| id).collect()
    }

    /// Jitter-free maximin score against active sources and chosen points.
    fn score(&self, point: &Vec3) -> f64 {
        maximin_score(
            self.chosen_index.nearest_distance(point),
            min_distance(point, &self.sources),
        )
    }

    fn axes_free(&self, id: usize) -> bool {
        let (x, y, _) = self.arena.keys[id];
        !self.used_x.contains(&x) && !self.used_y.contains(&y)
    }

    fn keeps_distances(&self, id: usize) -> bool {
        let point = self.arena.points[id];
        let source_floor = self.rules.min_source_distance - self.rules.epsilon;
        self.sources
            .iter()
            .all(|source| point.distance_to(source) >= source_floor)
            && !self
                .chosen_index
                .any_within(&point, self.rules.min_point_spacing - self.rules.epsilon)
    }

    fn push(&mut self, id: usize) {
        let (x, y, z) = self.arena.keys[id];
        self.used_x.insert(x);
        self.used_y.insert(y);
        self.used_z.insert(z);
        self.chosen.push(id);
        self.chosen_index.insert(self.arena.points[id]);
    }

    /// Undoes the matching `push`; axis keys of chosen points are never shared.
    fn pop(&mut self, id: usize) {
        let (x, y, z) = self.arena.keys[id];
        self.used_x.remove(&x);
        self.used_y.remove(&y);
        self.used_z.remove(&z);
        self.chosen.pop();
        self.chosen_index.pop();
    }

    /// Bounded hill-climb: moves each point within its Z level while every rule keeps holding.
    ///
    /// Returns the number of replacements made.
    fn refine(&self, layout: &mut [usize]) -> usize {
        let mut moves = 0;
        for _ in 0..self.config.refinement_passes {
            for i in 0..layout.len() {
                let current = layout[i];
                let others: Vec<Vec3> = layout
                    .iter()
                    .enumerate()
                    .filter(|&(k, _)| k != i)
                    .map(|(_, &id)| self.arena.points[id])
                    .collect();
                let other_keys: Vec<(i64, i64)> = layout
                    .iter()
                    .enumerate()
                    .filter(|&(k, _)| k != i)
                    .map(|(_, &id)| (self.arena.keys[id].0, self.arena.keys[id].1))
                    .collect();

                let isolation = |point: &Vec3| {
                    maximin_score(min_distance(point, &others), min_distance(point, &self.sources))
                };

                let mut best = current;
                let mut best_score = isolation(&self.arena.points[current]);
                for &candidate in self.arena.level(self.arena.keys[current].2) {
                    if candidate == current {
                        continue;
                    }
                    let (x, y, _) = self.arena.keys[candidate];
                    if self.reserved.0.contains(&x)
                        || self.reserved.1.contains(&y)
                        || other_keys.iter().any(|&(ox, oy)| ox == x || oy == y)
                    {
                        continue;
                    }
                    let point = self.arena.points[candidate];
                    if !self.clears(&point, &others) {
                        continue;
                    }
                    let score = isolation(&point);
                    if score > best_score + EPSILON {
                        best = candidate;
                        best_score = score;
                    }
                }
                if best != current {
                    layout[i] = best;
                    moves += 1;
                }
            }
        }
        moves
    }

    /// Distance rules of a point against active sources and an explicit point set.
    fn clears(&self, point: &Vec3, others: &[Vec3]) -> bool {
        let source_floor = self.rules.min_source_distance - self.rules.epsilon;
        let spacing_floor = self.rules.min_point_spacing - self.rules.epsilon;
        self.sources.iter().all(|s| point.distance_to(s) >= source_floor)
            && others.iter().all(|o| point.distance_to(o) >= spacing_floor)
    }

    /// Greedy layout under progressively relaxed rules.
    fn fallback(&mut self) -> (Vec<usize>, Vec<FallbackTier>) {
        self.chosen.clear();
        self.chosen_index = ProximityIndex::new(self.rules.min_point_spacing);
        self.used_x = self.reserved.0.clone();
        self.used_y = self.reserved.1.clone();
        self.used_z = self.reserved.2.clone();

        let count = self.arena.points.len();
        let mut order: Vec<usize> = (0..count).collect();
        for i in (1..count).rev() {
            let j = self.rng.next_index(i + 1);
            order.swap(i, j);
        }

        let mut taken = vec![false; count];
        let mut tiers = Vec::with_capacity(MEASUREMENT_POINT_COUNT);
        for _ in 0..MEASUREMENT_POINT_COUNT {
            let mut picked = None;
            for tier in FallbackTier::ALL {
                let eligible: Vec<usize> = order
                    .iter()
                    .copied()
                    .filter(|&id| self.admits(id, tier, &taken))
                    .collect();
                if eligible.is_empty() {
                    continue;
                }
                let best = self.rank(&eligible, 0.0, self.config.fallback_pool.max(1));
                picked = Some((best[self.rng.next_index(best.len())], tier));
                break;
            }
            let (id, tier) = match picked {
                Some(choice) => choice,
                // Every candidate is in use already.
                None => (order[self.rng.next_index(count)], FallbackTier::Unconstrained),
            };
            taken[id] = true;
            tiers.push(tier);
            self.push(id);
        }
        (self.chosen.clone(), tiers)
    }

    fn admits(&self, id: usize, tier: FallbackTier, taken: &[bool]) -> bool {
        if taken[id] {
            return false;
        }
        let unique = || self.axes_free(id) && !self.used_z.contains(&self.arena.keys[id].2);
        match tier {
            FallbackTier::Strict => unique() && self.keeps_distances(id),
            FallbackTier::Unique => unique(),
            FallbackTier::Unconstrained => true,
        }
    }

    fn emit(&mut self, event: SearchEvent) {
        (self.on_event)(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::build_candidates;
    use crate::model::{Enclosure, ZUniqueness};
    use crate::random::ReplayRandom;
    use crate::types::Vec2;
    use crate::validator::validate;

    fn rectangle(w: f64, d: f64, h: f64) -> Enclosure {
        Enclosure::new(
            vec![
                Vec2::new(0.0, 0.0),
                Vec2::new(w, 0.0),
                Vec2::new(w, d),
                Vec2::new(0.0, d),
            ],
            h,
        )
        .unwrap()
    }

    fn default_sources() -> Vec<SourcePoint> {
        vec![
            SourcePoint::active(Vec3::new(0.5, 1.5, 1.8)),
            SourcePoint::active(Vec3::new(2.5, 0.5, 1.1)),
        ]
    }

    fn candidates_of(room: &Enclosure) -> Vec<Vec3> {
        build_candidates(room, 0.5, 0.1).unwrap().into_points()
    }

    fn assert_distance_invariants(outcome: &SearchOutcome, sources: &[SourcePoint]) {
        for p in &outcome.points {
            for s in sources.iter().filter(|s| s.active) {
                assert!(p.distance_to(&s.position) >= 1.0 - 1e-9, "{:?} too close to {:?}", p, s);
            }
        }
        for (i, p) in outcome.points.iter().enumerate() {
            for q in &outcome.points[i + 1..] {
                assert!(p.distance_to(q) >= 0.7 - 1e-9, "{:?} too close to {:?}", p, q);
            }
        }
    }

    #[test]
    fn seeded_search_is_deterministic_and_valid() {
        let room = rectangle(3.0, 2.0, 2.5);
        let sources = default_sources();
        let candidates = candidates_of(&room);
        let input = SearchInput {
            sources: &sources,
            candidates: &candidates,
            seed: Some("test123"),
            generation: 0,
        };
        let rules = LayoutRules::default();
        let config = SearchConfig::default();

        let first = select_points(&input, &rules, &config);
        let second = select_points(&input, &rules, &config);
        assert_eq!(first, second);
        assert!(first.feasible);
        assert_eq!(first.points.len(), MEASUREMENT_POINT_COUNT);
        assert_eq!(first.diagnostics.selected_solution, Some(0));

        for p in &first.points {
            assert!(p.x >= 0.5 - 1e-9 && p.x <= 2.5 + 1e-9);
            assert!(p.y >= 0.5 - 1e-9 && p.y <= 1.5 + 1e-9);
            assert!(p.z >= 0.5 - 1e-9 && p.z <= 2.0 + 1e-9);
        }

        let report = validate(&sources, &first.points, &room, &rules);
        assert_eq!(report.measurement_violations(), 0, "{:?}", report.summary());
        assert_distance_invariants(&first, &sources);
    }

    #[test]
    fn generation_does_not_matter_when_seeded() {
        let room = rectangle(3.0, 2.0, 2.5);
        let sources = default_sources();
        let candidates = candidates_of(&room);
        let run = |generation| {
            select_points(
                &SearchInput {
                    sources: &sources,
                    candidates: &candidates,
                    seed: Some("test123"),
                    generation,
                },
                &LayoutRules::default(),
                &SearchConfig::default(),
            )
        };
        assert_eq!(run(0).points, run(7).points);
    }

    #[test]
    fn unseeded_generations_vary_and_stay_valid() {
        let room = rectangle(3.0, 2.0, 2.5);
        let sources = default_sources();
        let candidates = candidates_of(&room);
        let rules = LayoutRules::default();

        let mut layouts: Vec<Vec<Vec3>> = Vec::new();
        for generation in 0..6 {
            let input = SearchInput {
                sources: &sources,
                candidates: &candidates,
                seed: None,
                generation,
            };
            let outcome = select_points(&input, &rules, &SearchConfig::default());
            assert!(outcome.feasible);
            assert_distance_invariants(&outcome, &sources);
            let report = validate(&sources, &outcome.points, &room, &rules);
            assert_eq!(report.measurement_violations(), 0, "{:?}", report.summary());

            // same generation, same answer
            assert_eq!(outcome, select_points(&input, &rules, &SearchConfig::default()));
            if !layouts.contains(&outcome.points) {
                layouts.push(outcome.points);
            }
        }
        assert!(layouts.len() >= 2, "expected variety, got {:?}", layouts);
    }

    #[test]
    fn relaxed_levels_do_not_eat_the_node_budget() {
        let room = rectangle(3.0, 2.0, 2.5);
        let sources = default_sources();
        let candidates = candidates_of(&room);
        let rules = LayoutRules::default();
        let config = SearchConfig::default();

        let seeded = select_points(
            &SearchInput {
                sources: &sources,
                candidates: &candidates,
                seed: Some("test123"),
                generation: 0,
            },
            &rules,
            &config,
        );
        assert!(seeded.feasible);
        assert_eq!(seeded.diagnostics.termination, Termination::SolutionCap);
        assert!(
            seeded.diagnostics.nodes_visited < 1_000,
            "nodes: {}",
            seeded.diagnostics.nodes_visited
        );

        for generation in 0..100 {
            let outcome = select_points(
                &SearchInput {
                    sources: &sources,
                    candidates: &candidates,
                    seed: None,
                    generation,
                },
                &rules,
                &config,
            );
            assert!(
                outcome.feasible,
                "generation {} infeasible: {:?}",
                generation, outcome.diagnostics
            );
        }
    }

    #[test]
    fn empty_seed_counts_as_unseeded() {
        let room = rectangle(3.0, 2.0, 2.5);
        let sources = default_sources();
        let candidates = candidates_of(&room);
        let with = |seed| {
            select_points(
                &SearchInput {
                    sources: &sources,
                    candidates: &candidates,
                    seed,
                    generation: 3,
                },
                &LayoutRules::default(),
                &SearchConfig::default(),
            )
        };
        assert_eq!(with(Some("")), with(None));
    }

    #[test]
    fn empty_candidate_space_is_infeasible() {
        let sources = default_sources();
        let mut events = Vec::new();
        let outcome = select_points_with(
            &SearchInput {
                sources: &sources,
                candidates: &[],
                seed: Some("test123"),
                generation: 0,
            },
            &LayoutRules::default(),
            &SearchConfig::default(),
            &mut ReplayRandom::constant(0.5),
            &CancelFlag::new(),
            |event| events.push(event.clone()),
        );
        assert!(outcome.points.is_empty());
        assert!(!outcome.feasible);
        assert_eq!(outcome.diagnostics.termination, Termination::NoCandidates);
        assert_eq!(outcome.diagnostics.nodes_visited, 0);
        assert!(matches!(events.as_slice(), [SearchEvent::Finished { feasible: false, .. }]));
    }

    #[test]
    fn cramped_room_falls_back_to_relaxed_layout() {
        // Only three distinct X and Y values fit, so no valid layout exists.
        let room = rectangle(1.2, 1.2, 1.5);
        let candidates = candidates_of(&room);
        let outcome = select_points(
            &SearchInput {
                sources: &[],
                candidates: &candidates,
                seed: Some("cramped"),
                generation: 0,
            },
            &LayoutRules::default(),
            &SearchConfig::default(),
        );
        assert!(!outcome.feasible);
        assert_eq!(outcome.points.len(), MEASUREMENT_POINT_COUNT);
        assert_eq!(outcome.diagnostics.solutions_found, 0);
        assert_eq!(outcome.diagnostics.termination, Termination::Exhausted);
        assert_eq!(outcome.diagnostics.fallback_tiers.len(), MEASUREMENT_POINT_COUNT);
        assert_eq!(outcome.diagnostics.fallback_tiers[0], FallbackTier::Strict);
        assert_eq!(
            outcome.diagnostics.fallback_tiers[4],
            FallbackTier::Unconstrained
        );
        for (i, p) in outcome.points.iter().enumerate() {
            assert!(!outcome.points[i + 1..].contains(p), "duplicate point {:?}", p);
            assert!(candidates.contains(p));
        }
    }

    #[test]
    fn single_candidate_is_reused() {
        let room = rectangle(1.0, 1.0, 1.0);
        let candidates = candidates_of(&room);
        assert_eq!(candidates.len(), 1);
        let outcome = select_points(
            &SearchInput {
                sources: &[],
                candidates: &candidates,
                seed: None,
                generation: 0,
            },
            &LayoutRules::default(),
            &SearchConfig::default(),
        );
        assert!(!outcome.feasible);
        assert_eq!(outcome.points, vec![Vec3::new(0.5, 0.5, 0.5); MEASUREMENT_POINT_COUNT]);
    }

    #[test]
    fn inactive_sources_widen_the_search_space() {
        let room = rectangle(3.0, 2.0, 2.5);
        let sources: Vec<SourcePoint> = default_sources()
            .into_iter()
            .map(|s| SourcePoint::inactive(s.position))
            .collect();
        let candidates = candidates_of(&room);
        let rules = LayoutRules::default();
        let outcome = select_points(
            &SearchInput {
                sources: &sources,
                candidates: &candidates,
                seed: Some("test123"),
                generation: 0,
            },
            &rules,
            &SearchConfig::default(),
        );
        assert!(outcome.feasible);
        assert_distance_invariants(&outcome, &sources);
        let report = validate(&sources, &outcome.points, &room, &rules);
        assert!(report.is_clean(), "{:?}", report.summary());
    }

    #[test]
    fn all_points_policy_reserves_source_levels() {
        let room = rectangle(3.0, 2.0, 2.5);
        let sources = default_sources();
        let candidates = candidates_of(&room);
        let rules = LayoutRules::builder()
            .z_uniqueness(ZUniqueness::AllActivePoints)
            .build();
        for generation in 0..3 {
            let outcome = select_points(
                &SearchInput {
                    sources: &sources,
                    candidates: &candidates,
                    seed: None,
                    generation,
                },
                &rules,
                &SearchConfig::default(),
            );
            assert!(outcome.feasible);
            for p in &outcome.points {
                assert_ne!(grid_key(p.z), grid_key(1.8));
                assert_ne!(grid_key(p.z), grid_key(1.1));
            }
            let report = validate(&sources, &outcome.points, &room, &rules);
            assert_eq!(report.measurement_violations(), 0, "{:?}", report.summary());
        }
    }

    #[test]
    fn injected_stream_drives_the_search() {
        let room = rectangle(3.0, 2.0, 2.5);
        let sources = default_sources();
        let candidates = candidates_of(&room);
        let input = SearchInput {
            sources: &sources,
            candidates: &candidates,
            seed: None,
            generation: 1,
        };
        let run = || {
            let mut rng = ReplayRandom::new(vec![0.1, 0.7, 0.4, 0.9]);
            select_points_with(
                &input,
                &LayoutRules::default(),
                &SearchConfig::default(),
                &mut rng,
                &CancelFlag::new(),
                |_| {},
            )
        };
        let first = run();
        assert_eq!(first, run());
        assert!(first.feasible);
        assert_distance_invariants(&first, &sources);
    }

    #[test]
    fn cancelled_search_still_returns_a_layout() {
        let room = rectangle(3.0, 2.0, 2.5);
        let sources = default_sources();
        let candidates = candidates_of(&room);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let outcome = select_points_with(
            &SearchInput {
                sources: &sources,
                candidates: &candidates,
                seed: Some("test123"),
                generation: 0,
            },
            &LayoutRules::default(),
            &SearchConfig::default(),
            &mut SeededRandom::from_seed_text("test123"),
            &cancel,
            |_| {},
        );
        assert_eq!(outcome.diagnostics.termination, Termination::Cancelled);
        assert_eq!(outcome.diagnostics.solutions_found, 0);
        assert!(!outcome.feasible);
        assert_eq!(outcome.points.len(), MEASUREMENT_POINT_COUNT);
    }

    #[test]
    fn expired_deadline_stops_the_search() {
        let room = rectangle(3.0, 2.0, 2.5);
        let sources = default_sources();
        let candidates = candidates_of(&room);
        let config = SearchConfig::builder()
            .time_limit(Some(Duration::ZERO))
            .build();
        let outcome = select_points(
            &SearchInput {
                sources: &sources,
                candidates: &candidates,
                seed: Some("test123"),
                generation: 0,
            },
            &LayoutRules::default(),
            &config,
        );
        assert_eq!(outcome.diagnostics.termination, Termination::Deadline);
        assert!(!outcome.feasible);
    }

    #[test]
    fn node_budget_and_solution_cap_bound_the_search() {
        let room = rectangle(3.0, 2.0, 2.5);
        let sources = default_sources();
        let candidates = candidates_of(&room);
        let input = SearchInput {
            sources: &sources,
            candidates: &candidates,
            seed: Some("test123"),
            generation: 0,
        };

        let starved = select_points(
            &input,
            &LayoutRules::default(),
            &SearchConfig::builder().node_budget(3).build(),
        );
        assert_eq!(starved.diagnostics.termination, Termination::NodeBudget);
        assert_eq!(starved.diagnostics.nodes_visited, 4);
        assert!(!starved.feasible);

        let capped = select_points(
            &input,
            &LayoutRules::default(),
            &SearchConfig::builder().max_solutions(1).build(),
        );
        assert_eq!(capped.diagnostics.termination, Termination::SolutionCap);
        assert_eq!(capped.diagnostics.solutions_found, 1);
        assert!(capped.feasible);
    }

    #[test]
    fn events_frame_the_run() {
        let room = rectangle(3.0, 2.0, 2.5);
        let sources = default_sources();
        let candidates = candidates_of(&room);
        let mut events = Vec::new();
        let outcome = select_points_with(
            &SearchInput {
                sources: &sources,
                candidates: &candidates,
                seed: Some("test123"),
                generation: 0,
            },
            &LayoutRules::default(),
            &SearchConfig::default(),
            &mut SeededRandom::from_seed_text("test123"),
            &CancelFlag::new(),
            |event| events.push(event.clone()),
        );

        assert!(matches!(events.first(), Some(SearchEvent::Started { seeded: true, .. })));
        match events.last() {
            Some(SearchEvent::Finished {
                feasible, points, ..
            }) => {
                assert_eq!(*feasible, outcome.feasible);
                assert_eq!(points, &outcome.points);
            }
            other => panic!("unexpected last event {:?}", other),
        }
        let found = events
            .iter()
            .filter(|e| matches!(e, SearchEvent::SolutionFound { .. }))
            .count();
        assert_eq!(found, outcome.diagnostics.solutions_found);
    }

    #[test]
    fn branching_limits_scale_with_space_size() {
        let config = SearchConfig::default();
        assert_eq!(config.branching_limits(0), (22, 18));
        assert_eq!(config.branching_limits(5_000), (22, 18));
        assert_eq!(config.branching_limits(10_000), (11, 9));
        assert_eq!(config.branching_limits(7_000), (15, 12));

        let tight = SearchConfig::builder()
            .top_candidates(10, 8)
            .top_z_levels(6, 6)
            .build();
        assert_eq!(tight.branching_limits(1_000_000), (8, 6));
    }

    #[test]
    fn preferred_levels_step_per_slot() {
        let config = SearchConfig::default();
        let levels: Vec<f64> = (0..MEASUREMENT_POINT_COUNT)
            .map(|slot| config.preferred_z(slot))
            .collect();
        assert_eq!(levels, vec![1.0, 1.1, 1.2, 1.3, 1.4]);
    }

    #[test]
    fn maximin_score_handles_missing_terms() {
        assert_eq!(maximin_score(None, None), 0.0);
        assert_eq!(maximin_score(None, Some(2.0)), 26.0);
        assert_eq!(maximin_score(Some(1.0), None), 12.0);
        assert_eq!(maximin_score(Some(1.0), Some(2.0)), 10.0 + 2.0 + 2.0);
    }
}

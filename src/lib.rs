//! Measurement point planning for acoustic room measurements.
//!
//! Builds the grid of admissible positions inside a prismatic room, checks
//! point layouts against the placement rules and searches five measurement
//! points that satisfy them.

pub mod api;
pub mod candidates;
pub mod config;
pub mod geometry;
pub mod model;
pub mod optimizer;
pub mod proximity;
pub mod random;
pub mod scene;
pub mod types;
pub mod validator;

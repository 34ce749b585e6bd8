//! Consolidation - scheduled offline analytics over the store
//!
//! Five phases run on configurable cadences: exponential decay scoring,
//! creative association discovery, DBSCAN clustering, extractive
//! compression into summary memories, and controlled forgetting with an
//! archival grace window.

pub mod cluster;
mod phases;
mod schedule;

pub use phases::{ConsolidationError, Consolidator, Phase, PhaseReport, RunReport};
pub use schedule::Scheduler;

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # loadtune
//!
//! Core library for driving schedulable compute units toward a target
//! utilization percentage and holding them there for a fixed duration.
//!
//! The interesting part is not the synthetic work itself but the feedback
//! loop around it: each unit is owned by a [`UnitController`] which
//! alternates load bursts with idle intervals and adjusts the duty cycle
//! every control cycle from the measured utilization error, using a
//! proportional-integral rule with a dead-band. The [`Coordinator`] runs
//! one controller per requested unit, sequentially or concurrently,
//! propagates cancellation, and collects per-unit summaries.
//!
//! Platform-facing concerns sit behind narrow traits: [`Sampler`] reads a
//! unit's utilization (the provided [`ProcSampler`] uses `/proc/stat`
//! deltas), and [`LoadGenerator`] produces one bounded burst of synthetic
//! work (matrix multiply, arithmetic reduction, ray intersection, or
//! flat-out).

pub mod topology;
pub use topology::Topology;

pub mod sampler;
pub use sampler::ProcSampler;
pub use sampler::Sampler;

pub mod generator;
pub use generator::GenMode;
pub use generator::LoadGenerator;

pub mod controller;
pub use controller::ControllerConfig;
pub use controller::UnitController;

pub mod coordinator;
pub use coordinator::Coordinator;
pub use coordinator::Reporter;

pub mod stats;
pub use stats::RunResult;
pub use stats::Summary;
pub use stats::Target;
pub use stats::UnitSnapshot;

#[cfg(test)]
pub(crate) mod testing;

/// Identifier of one schedulable compute unit (a logical CPU).
pub type UnitId = usize;

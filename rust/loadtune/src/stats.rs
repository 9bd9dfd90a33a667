// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Run statistics.
//!
//! Plain data types exchanged between the controller, coordinator and
//! reporters: per-cycle samples, in-flight snapshots, per-unit summaries
//! and the run-level aggregate, plus their text formatting.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;

use crate::UnitId;

/// One unit's assignment for a run. Immutable once the run starts.
#[derive(Clone, Debug)]
pub struct Target {
    pub unit: UnitId,
    /// Desired utilization percentage, 1-100. Ignored by flat-out
    /// generator variants.
    pub target_pct: f64,
    pub duration: Duration,
}

/// One utilization reading for one unit. Produced by a [`crate::Sampler`],
/// consumed only by the controller that owns the unit, never mutated.
#[derive(Clone, Debug)]
pub struct Sample {
    pub unit: UnitId,
    pub taken_at: Instant,
    /// Busy percentage over the interval since the previous reading, 0-100.
    pub util_pct: f64,
    pub temp_c: Option<f64>,
    pub freq_khz: Option<u64>,
    pub power_w: Option<f64>,
}

/// Controller phase, visible in snapshots.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum Phase {
    Idle,
    Warmup,
    Tracking,
    Draining,
    Stopped,
}

/// In-flight copy of one controller's state, published once per control
/// cycle and read by the coordinator's reporting loop. Deliberately a plain
/// copyable value so that reading it never serializes with burst execution.
#[derive(Clone, Debug, Serialize)]
pub struct UnitSnapshot {
    pub unit: UnitId,
    pub phase: Phase,
    pub target_pct: f64,
    pub duty: f64,
    /// Last observed utilization, 0-100. Zero until the first valid sample.
    pub util_pct: f64,
    pub elapsed_s: f64,
    pub remaining_s: f64,
    pub samples: u64,
    /// Generator operations completed so far.
    pub ops: u64,
}

impl UnitSnapshot {
    pub fn new(unit: UnitId, target_pct: f64, duty: f64, duration_s: f64) -> Self {
        Self {
            unit,
            phase: Phase::Idle,
            target_pct,
            duty,
            util_pct: 0.0,
            elapsed_s: 0.0,
            remaining_s: duration_s,
            samples: 0,
            ops: 0,
        }
    }
}

/// Final per-unit statistics, created once when a controller stops.
#[derive(Clone, Debug, Serialize)]
pub struct Summary {
    pub unit: UnitId,
    pub target_pct: f64,
    pub avg_util: f64,
    pub min_util: f64,
    pub max_util: f64,
    pub samples: u64,
    /// Generator operations completed over the run.
    pub ops: u64,
    /// Peak working-set estimate reported by the generator, in bytes.
    pub mem_bytes: usize,
    pub elapsed_s: f64,
    /// True if the duty cycle was frozen on stale data at any point.
    pub degraded: bool,
    /// True if the unit could not produce load (or never produced a valid
    /// sample) and gave up early.
    pub failed: bool,
}

impl Summary {
    /// Placeholder for a unit whose controller never started because the
    /// run was cancelled first. Keeps the result keyed by every requested
    /// unit; `samples == 0` distinguishes it from a completed unit.
    pub fn never_started(target: &Target) -> Self {
        Self {
            unit: target.unit,
            target_pct: target.target_pct,
            avg_util: 0.0,
            min_util: 0.0,
            max_util: 0.0,
            samples: 0,
            ops: 0,
            mem_bytes: 0,
            elapsed_s: 0.0,
            degraded: false,
            failed: false,
        }
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "  UNIT[{:02}] avg={:5.1}% min={:5.1}% max={:5.1}% target={:5.1}% \
             samples={} ops={} elapsed={:.1}s{}{}",
            self.unit,
            self.avg_util,
            self.min_util,
            self.max_util,
            self.target_pct,
            self.samples,
            self.ops,
            self.elapsed_s,
            if self.degraded { " DEGRADED" } else { "" },
            if self.failed { " FAILED" } else { "" },
        )?;
        Ok(())
    }
}

/// Result of one coordinator invocation: one summary per requested unit,
/// with the request order preserved alongside the id-keyed map.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunResult {
    pub summaries: BTreeMap<UnitId, Summary>,
    pub order: Vec<UnitId>,
}

impl RunResult {
    /// Iterate summaries in request order.
    pub fn iter(&self) -> impl Iterator<Item = &Summary> {
        self.order.iter().filter_map(|id| self.summaries.get(id))
    }

    pub fn any_failed(&self) -> bool {
        self.summaries.values().any(|s| s.failed)
    }

    pub fn any_degraded(&self) -> bool {
        self.summaries.values().any(|s| s.degraded)
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        for summary in self.iter() {
            summary.format(w)?;
        }
        Ok(())
    }
}

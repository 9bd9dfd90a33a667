// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Multi-unit orchestration.
//!
//! The [`Coordinator`] launches one [`UnitController`] worker thread per
//! requested unit, either all at once or strictly one after another,
//! gathers snapshot copies for the reporter on a fixed interval, and
//! collects each controller's final summary over a channel. A single
//! shared shutdown flag propagates cancellation; the coordinator never
//! returns while a controller is still running.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use crossbeam::channel::unbounded;
use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use log::info;
use log::warn;

use crate::controller::ControllerConfig;
use crate::controller::UnitController;
use crate::generator::LoadGenerator;
use crate::sampler::Sampler;
use crate::stats::RunResult;
use crate::stats::Summary;
use crate::stats::Target;
use crate::stats::UnitSnapshot;
use crate::UnitId;

/// Consumes periodic snapshots while a run is in flight and the final
/// aggregate when it completes. Implementations live outside the core.
pub trait Reporter {
    fn periodic(&mut self, snapshots: &[UnitSnapshot]);
    fn finish(&mut self, result: &RunResult);
}

pub type SamplerFactory = Box<dyn Fn(UnitId) -> Box<dyn Sampler> + Send + Sync>;
pub type GeneratorFactory = Box<dyn Fn(UnitId) -> Box<dyn LoadGenerator> + Send + Sync>;

pub struct Coordinator {
    cfg: ControllerConfig,
    report_interval: Duration,
    make_sampler: SamplerFactory,
    make_generator: GeneratorFactory,
    shutdown: Arc<AtomicBool>,
}

impl Coordinator {
    pub fn new(
        cfg: ControllerConfig,
        make_sampler: SamplerFactory,
        make_generator: GeneratorFactory,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cfg,
            report_interval: Duration::from_secs(1),
            make_sampler,
            make_generator,
            shutdown,
        }
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    fn validate(targets: &[Target]) -> Result<()> {
        if targets.is_empty() {
            bail!("No units to drive");
        }
        let mut seen = std::collections::BTreeSet::new();
        for t in targets {
            if !(1.0..=100.0).contains(&t.target_pct) {
                bail!(
                    "Target percentage {} for unit {} out of range 1-100",
                    t.target_pct,
                    t.unit
                );
            }
            if !seen.insert(t.unit) {
                bail!("Unit {} requested more than once", t.unit);
            }
        }
        Ok(())
    }

    fn spawn_controller(
        &self,
        target: &Target,
        tx: crossbeam::channel::Sender<Summary>,
    ) -> Result<(JoinHandle<()>, Arc<Mutex<UnitSnapshot>>)> {
        let ctrl = UnitController::new(
            target.clone(),
            (self.make_sampler)(target.unit),
            (self.make_generator)(target.unit),
            self.cfg,
            self.shutdown.clone(),
        );
        let snapshot = ctrl.snapshot_handle();
        let handle = std::thread::Builder::new()
            .name(format!("loadtune-unit{}", target.unit))
            .spawn(move || {
                let summary = ctrl.run();
                // The receiver only goes away if the coordinator bailed;
                // nothing to do about it from here.
                let _ = tx.send(summary);
            })
            .with_context(|| format!("Failed to spawn worker for unit {}", target.unit))?;
        Ok((handle, snapshot))
    }

    /// Drain `expected` summaries from the workers, emitting a snapshot
    /// report every interval while waiting.
    fn collect(
        &self,
        rx: &Receiver<Summary>,
        expected: usize,
        snapshots: &[Arc<Mutex<UnitSnapshot>>],
        reporter: &mut dyn Reporter,
        result: &mut RunResult,
    ) {
        let mut remaining = expected;
        let mut next_report = Instant::now() + self.report_interval;
        while remaining > 0 {
            let timeout = next_report.saturating_duration_since(Instant::now());
            match rx.recv_timeout(timeout) {
                Ok(summary) => {
                    result.summaries.insert(summary.unit, summary);
                    remaining -= 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    let snaps: Vec<UnitSnapshot> = snapshots
                        .iter()
                        .map(|h| h.lock().expect("snapshot lock poisoned").clone())
                        .collect();
                    reporter.periodic(&snaps);
                    next_report += self.report_interval;
                    if next_report < Instant::now() {
                        next_report = Instant::now() + self.report_interval;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("{} worker(s) exited without reporting a summary", remaining);
                    break;
                }
            }
        }
    }

    /// Run every target to completion and return one summary per unit.
    /// With `parallel` set, all controllers start together; otherwise each
    /// runs for its full duration in request order. Only configuration
    /// errors fail the run as a whole; per-unit trouble lands in the
    /// summaries' flags.
    pub fn run(
        &self,
        targets: &[Target],
        parallel: bool,
        reporter: &mut dyn Reporter,
    ) -> Result<RunResult> {
        Self::validate(targets)?;

        let mut result = RunResult {
            order: targets.iter().map(|t| t.unit).collect(),
            ..Default::default()
        };

        info!(
            "Driving {} unit(s) {}",
            targets.len(),
            if parallel { "in parallel" } else { "sequentially" }
        );

        if parallel {
            let (tx, rx) = unbounded();
            let mut handles = Vec::new();
            let mut snapshots = Vec::new();
            for target in targets {
                let (handle, snapshot) = self.spawn_controller(target, tx.clone())?;
                handles.push(handle);
                snapshots.push(snapshot);
            }
            drop(tx);
            self.collect(&rx, targets.len(), &snapshots, reporter, &mut result);
            for handle in handles {
                if handle.join().is_err() {
                    warn!("A unit worker panicked");
                }
            }
        } else {
            for target in targets {
                if self.shutdown.load(Ordering::Relaxed) {
                    info!("Cancelled before unit {} started, skipping", target.unit);
                    result
                        .summaries
                        .insert(target.unit, Summary::never_started(target));
                    continue;
                }
                let (tx, rx) = unbounded();
                let (handle, snapshot) = self.spawn_controller(target, tx)?;
                self.collect(&rx, 1, &[snapshot], reporter, &mut result);
                if handle.join().is_err() {
                    warn!("Unit {} worker panicked", target.unit);
                }
            }
        }

        reporter.finish(&result);
        Ok(result)
    }
}

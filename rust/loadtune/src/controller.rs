// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-unit control loop.
//!
//! A [`UnitController`] owns one schedulable unit for the length of a run
//! and is the only writer of that unit's control state. Each control cycle
//! it samples utilization, updates the duty cycle with a proportional-
//! integral rule, issues a load burst sized by the duty cycle, and idles
//! for the remainder of the cycle. The phases are
//! Idle -> Warmup -> Tracking -> Draining -> Stopped; cancellation moves
//! any phase directly to Draining.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::info;
use log::warn;

use crate::generator::LoadGenerator;
use crate::sampler::Sampler;
use crate::stats::Phase;
use crate::stats::Sample;
use crate::stats::Summary;
use crate::stats::Target;
use crate::stats::UnitSnapshot;

#[derive(Clone, Copy, Debug)]
pub struct ControllerConfig {
    /// Length of one sample/burst/idle cycle.
    pub cycle_period: Duration,
    /// Upper bound on one generator invocation; also the cancellation
    /// latency bound within a burst.
    pub burst_chunk: Duration,
    /// Proportional gain, duty per percentage point of error.
    pub kp: f64,
    /// Integral gain.
    pub ki: f64,
    /// Error magnitude (percentage points) treated as on-target.
    pub dead_band_pct: f64,
    /// Consecutive unavailable samples tolerated before the unit is
    /// flagged degraded.
    pub max_stale_cycles: u32,
    /// Sampling attempts during warmup before giving up on the unit.
    pub warmup_cycles: u32,
    /// Pin the worker thread to its unit's CPU.
    pub pin_thread: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cycle_period: Duration::from_millis(250),
            burst_chunk: Duration::from_millis(50),
            kp: 0.005,
            ki: 0.0005,
            dead_band_pct: 2.0,
            max_stale_cycles: 5,
            warmup_cycles: 10,
            pin_thread: false,
        }
    }
}

/// One PI update. Inside the dead-band the duty cycle is left alone and
/// the integral does not accumulate, which keeps a settled loop from
/// jittering around the target. The integral is clamped to [-1, 1] so a
/// long excursion cannot wind it up.
fn pi_step(duty: f64, error_pct: f64, integral: &mut f64, cfg: &ControllerConfig) -> f64 {
    if error_pct.abs() <= cfg.dead_band_pct {
        return duty;
    }
    *integral = (*integral + error_pct / 100.0).clamp(-1.0, 1.0);
    (duty + cfg.kp * error_pct + cfg.ki * *integral).clamp(0.0, 1.0)
}

fn pin_to_cpu(cpu: usize) {
    let rc = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if rc != 0 {
        warn!("UNIT[{:02}] failed to set CPU affinity, continuing unpinned", cpu);
    }
}

struct ControlState {
    duty: f64,
    last_error: f64,
    integral: f64,
    samples: u64,
    util_sum: f64,
    min_util: f64,
    max_util: f64,
    size: usize,
    ops: u64,
    mem_bytes: usize,
}

pub struct UnitController {
    target: Target,
    cfg: ControllerConfig,
    sampler: Box<dyn Sampler>,
    gen: Box<dyn LoadGenerator>,
    shutdown: Arc<AtomicBool>,
    snapshot: Arc<Mutex<UnitSnapshot>>,

    state: ControlState,
    phase: Phase,
    stale_cycles: u32,
    degraded: bool,
    failed: bool,
    last_util: f64,
    sampler_err_logged: bool,
}

impl UnitController {
    pub fn new(
        target: Target,
        sampler: Box<dyn Sampler>,
        gen: Box<dyn LoadGenerator>,
        cfg: ControllerConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let duty = if gen.flat_out() {
            1.0
        } else {
            (target.target_pct / 100.0).clamp(0.0, 1.0)
        };
        let snapshot = Arc::new(Mutex::new(UnitSnapshot::new(
            target.unit,
            target.target_pct,
            duty,
            target.duration.as_secs_f64(),
        )));
        Self {
            target,
            cfg,
            sampler,
            gen,
            shutdown,
            snapshot,
            state: ControlState {
                duty,
                last_error: 0.0,
                integral: 0.0,
                samples: 0,
                util_sum: 0.0,
                min_util: f64::MAX,
                max_util: 0.0,
                size: 0,
                ops: 0,
                mem_bytes: 0,
            },
            phase: Phase::Idle,
            stale_cycles: 0,
            degraded: false,
            failed: false,
            last_util: 0.0,
            sampler_err_logged: false,
        }
    }

    /// Handle for the coordinator's reporting loop. Holds only a brief
    /// copy under the lock; the control loop is never serialized with
    /// anything longer than that copy.
    pub fn snapshot_handle(&self) -> Arc<Mutex<UnitSnapshot>> {
        self.snapshot.clone()
    }

    fn cancelled(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.snapshot.lock().expect("snapshot lock poisoned").phase = phase;
    }

    fn publish(&mut self, elapsed: Duration) {
        let mut snap = self.snapshot.lock().expect("snapshot lock poisoned");
        snap.phase = self.phase;
        snap.duty = self.state.duty;
        snap.util_pct = self.last_util;
        snap.elapsed_s = elapsed.as_secs_f64();
        snap.remaining_s = (self.target.duration.saturating_sub(elapsed)).as_secs_f64();
        snap.samples = self.state.samples;
        snap.ops = self.state.ops;
    }

    /// Take one reading, treating errors and over-latency responses as
    /// unavailable. The latency budget is a tenth of the cycle period.
    fn try_sample(&mut self) -> Option<Sample> {
        let budget = self.cfg.cycle_period / 10;
        let started = Instant::now();
        match self.sampler.sample() {
            Ok(Some(sample)) => {
                if started.elapsed() > budget {
                    debug!(
                        "UNIT[{:02}] sample took {:?}, over budget {:?}, discarding",
                        self.target.unit,
                        started.elapsed(),
                        budget
                    );
                    None
                } else {
                    Some(sample)
                }
            }
            Ok(None) => None,
            Err(e) => {
                if !self.sampler_err_logged {
                    warn!("UNIT[{:02}] sampler error: {:#}", self.target.unit, e);
                    self.sampler_err_logged = true;
                }
                None
            }
        }
    }

    fn observe(&mut self, sample: &Sample) {
        self.stale_cycles = 0;
        self.last_util = sample.util_pct;
        self.state.samples += 1;
        self.state.util_sum += sample.util_pct;
        self.state.min_util = self.state.min_util.min(sample.util_pct);
        self.state.max_util = self.state.max_util.max(sample.util_pct);
    }

    /// Settle the generator working-set size: the preferred size, one
    /// halved retry, then give up and mark the unit failed.
    fn negotiate_size(&mut self) -> bool {
        let hint = self.gen.default_size();
        match self.gen.negotiate(hint) {
            Ok(size) => {
                self.state.size = size;
                return true;
            }
            Err(e) => {
                warn!(
                    "UNIT[{:02}] {}, retrying at reduced size",
                    self.target.unit, e
                );
            }
        }

        let reduced = (hint / 2).max(self.gen.min_size());
        match self.gen.negotiate(reduced) {
            Ok(size) => {
                self.state.size = size;
                info!(
                    "UNIT[{:02}] running with reduced working set {}",
                    self.target.unit, size
                );
                true
            }
            Err(e) => {
                warn!("UNIT[{:02}] {}, giving up on this unit", self.target.unit, e);
                false
            }
        }
    }

    fn decide(&mut self) {
        match self.try_sample() {
            Some(sample) => {
                self.observe(&sample);
                if self.gen.flat_out() {
                    self.state.duty = 1.0;
                } else {
                    let error = self.target.target_pct - sample.util_pct;
                    self.state.last_error = error;
                    self.state.duty =
                        pi_step(self.state.duty, error, &mut self.state.integral, &self.cfg);
                    debug!(
                        "UNIT[{:02}] util={:5.1}% err={:+6.1} duty={:.3}",
                        self.target.unit, sample.util_pct, self.state.last_error, self.state.duty
                    );
                }
            }
            None => {
                self.stale_cycles += 1;
                if self.stale_cycles > self.cfg.max_stale_cycles && !self.degraded {
                    warn!(
                        "UNIT[{:02}] no sample for {} cycles, freezing duty cycle at {:.2}",
                        self.target.unit, self.stale_cycles, self.state.duty
                    );
                    self.degraded = true;
                }
                // Duty cycle stays frozen at its last value; oscillating
                // on stale data would be worse than holding steady.
            }
        }
    }

    fn burst_until(&mut self, deadline: Instant) {
        while !self.cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let chunk = (deadline - now).min(self.cfg.burst_chunk);
            let outcome = self.gen.burst(chunk);
            self.state.ops += outcome.ops;
            self.state.mem_bytes = self.state.mem_bytes.max(outcome.mem_bytes);
        }
    }

    /// Run the unit to completion. Always yields a Summary; per-unit
    /// trouble is reported through the `degraded` and `failed` flags
    /// rather than by aborting the run.
    pub fn run(mut self) -> Summary {
        if self.cfg.pin_thread {
            pin_to_cpu(self.target.unit);
        }

        self.set_phase(Phase::Warmup);

        if !self.negotiate_size() {
            self.failed = true;
            return self.drain(Duration::ZERO);
        }

        // Warmup ends on the first valid sample; a sampler that never
        // produces one within the bound means tracking would run blind,
        // so the unit fails fast instead.
        let mut warmed = false;
        for _ in 0..self.cfg.warmup_cycles {
            if self.cancelled() {
                return self.drain(Duration::ZERO);
            }
            if self.try_sample().is_some() {
                warmed = true;
                break;
            }
            std::thread::sleep(self.cfg.cycle_period);
        }
        if !warmed {
            warn!(
                "UNIT[{:02}] no valid sample after {} warmup cycles",
                self.target.unit, self.cfg.warmup_cycles
            );
            self.failed = true;
            return self.drain(Duration::ZERO);
        }

        self.set_phase(Phase::Tracking);
        info!(
            "UNIT[{:02}] tracking {:.1}% for {:.1}s (working set {})",
            self.target.unit,
            self.target.target_pct,
            self.target.duration.as_secs_f64(),
            self.state.size
        );

        let tracking_started = Instant::now();
        loop {
            let elapsed = tracking_started.elapsed();
            if self.cancelled() || elapsed >= self.target.duration {
                return self.drain(elapsed);
            }

            let cycle_started = Instant::now();
            self.decide();

            let burst_budget = self.cfg.cycle_period.mul_f64(self.state.duty);
            self.burst_until(cycle_started + burst_budget);

            self.publish(tracking_started.elapsed());

            let next_cycle = cycle_started + self.cfg.cycle_period;
            let now = Instant::now();
            if now < next_cycle && !self.cancelled() {
                std::thread::sleep(next_cycle - now);
            }
        }
    }

    fn drain(mut self, elapsed: Duration) -> Summary {
        self.set_phase(Phase::Draining);
        self.gen.release();

        let (avg, min, max) = if self.state.samples > 0 {
            (
                self.state.util_sum / self.state.samples as f64,
                self.state.min_util,
                self.state.max_util,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        let summary = Summary {
            unit: self.target.unit,
            target_pct: self.target.target_pct,
            avg_util: avg,
            min_util: min,
            max_util: max,
            samples: self.state.samples,
            ops: self.state.ops,
            mem_bytes: self.state.mem_bytes,
            elapsed_s: elapsed.as_secs_f64(),
            degraded: self.degraded,
            failed: self.failed,
        };

        self.publish(elapsed);
        self.set_phase(Phase::Stopped);
        info!(
            "UNIT[{:02}] stopped: avg={:.1}% over {} samples{}{}",
            summary.unit,
            summary.avg_util,
            summary.samples,
            if summary.degraded { " (degraded)" } else { "" },
            if summary.failed { " (failed)" } else { "" },
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ExhaustedGen;
    use crate::testing::ScriptSampler;
    use crate::testing::SimDevice;
    use crate::testing::SimGen;
    use std::sync::atomic::AtomicU32;

    fn test_cfg() -> ControllerConfig {
        ControllerConfig {
            cycle_period: Duration::from_millis(10),
            burst_chunk: Duration::from_millis(5),
            warmup_cycles: 5,
            ..Default::default()
        }
    }

    fn target(pct: f64, ms: u64) -> Target {
        Target {
            unit: 0,
            target_pct: pct,
            duration: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_pi_step_converges_from_zero_duty() {
        // Perfect, noise-free plant: observed utilization == 100 * duty.
        let cfg = ControllerConfig::default();
        for target in [1.0, 20.0, 50.0, 80.0, 100.0] {
            let mut duty = 0.0;
            let mut integral = 0.0;
            let mut in_band_at = None;
            for cycle in 0..60 {
                let error = target - 100.0 * duty;
                duty = pi_step(duty, error, &mut integral, &cfg);
                let settled = (target - 100.0 * duty).abs() <= cfg.dead_band_pct;
                if settled && in_band_at.is_none() {
                    in_band_at = Some(cycle);
                }
                if !settled && in_band_at.is_some() {
                    panic!("target {} left the dead-band after settling", target);
                }
            }
            let settled_at = in_band_at.expect("never settled");
            assert!(
                settled_at <= 30,
                "target {} took {} cycles to settle",
                target,
                settled_at
            );
        }
    }

    #[test]
    fn test_pi_step_dead_band_suppresses_updates() {
        let cfg = ControllerConfig::default();
        let mut integral = 0.5;
        let duty = pi_step(0.5, 1.9, &mut integral, &cfg);
        assert_eq!(duty, 0.5);
        assert_eq!(integral, 0.5);
    }

    #[test]
    fn test_pi_step_integral_clamped() {
        let cfg = ControllerConfig::default();
        let mut integral = 0.0;
        for _ in 0..1000 {
            pi_step(0.0, 100.0, &mut integral, &cfg);
        }
        assert!(integral <= 1.0);
        let mut integral = 0.0;
        for _ in 0..1000 {
            pi_step(1.0, -100.0, &mut integral, &cfg);
        }
        assert!(integral >= -1.0);
    }

    #[test]
    fn test_tracking_holds_target_with_steady_sampler() {
        // Sampler pinned to exactly the target: the loop must sit in the
        // dead-band the whole run and report the sampled average.
        let shutdown = Arc::new(AtomicBool::new(false));
        let ctrl = UnitController::new(
            target(50.0, 200),
            Box::new(ScriptSampler::repeating(0, vec![Some(50.0)])),
            Box::new(SimGen::new(&SimDevice::default())),
            test_cfg(),
            shutdown,
        );
        let summary = ctrl.run();
        assert!(!summary.failed);
        assert!(!summary.degraded);
        assert!(summary.samples >= 10);
        assert!((summary.avg_util - 50.0).abs() < 1e-9);
        assert!((summary.min_util - 50.0).abs() < 1e-9);
        assert!((summary.max_util - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_tracking_against_simulated_device() {
        // Closed loop against the busy-time-accounting device; measured
        // utilization should settle near the target.
        let dev = SimDevice::default();
        let shutdown = Arc::new(AtomicBool::new(false));
        let ctrl = UnitController::new(
            target(50.0, 400),
            Box::new(dev.sampler(0)),
            Box::new(SimGen::new(&dev)),
            test_cfg(),
            shutdown,
        );
        let summary = ctrl.run();
        assert!(!summary.failed);
        assert!(summary.samples > 10);
        assert!(
            summary.avg_util > 35.0 && summary.avg_util < 65.0,
            "avg_util = {}",
            summary.avg_util
        );
    }

    #[test]
    fn test_summary_accounts_burst_work() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let ctrl = UnitController::new(
            target(50.0, 200),
            Box::new(ScriptSampler::repeating(0, vec![Some(50.0)])),
            Box::new(SimGen::new(&SimDevice::default())),
            test_cfg(),
            shutdown,
        );
        let snapshot = ctrl.snapshot_handle();
        let summary = ctrl.run();
        assert!(summary.ops > 0, "no burst work recorded");
        assert_eq!(summary.mem_bytes, SimGen::MEM_BYTES);
        assert_eq!(snapshot.lock().unwrap().ops, summary.ops);
    }

    #[test]
    fn test_cancellation_latency_bounded() {
        let dev = SimDevice::default();
        let shutdown = Arc::new(AtomicBool::new(false));
        let ctrl = UnitController::new(
            target(50.0, 60_000),
            Box::new(dev.sampler(0)),
            Box::new(SimGen::new(&dev)),
            test_cfg(),
            shutdown.clone(),
        );
        let handle = std::thread::spawn(move || ctrl.run());
        std::thread::sleep(Duration::from_millis(100));
        let cancelled_at = Instant::now();
        shutdown.store(true, Ordering::Relaxed);
        let summary = handle.join().unwrap();
        // Bound: one burst chunk plus one cycle period, with scheduling
        // slack on top.
        assert!(cancelled_at.elapsed() < Duration::from_millis(500));
        assert!(!summary.failed);
    }

    #[test]
    fn test_resource_exhaustion_retries_once_then_fails() {
        let attempts = Arc::new(AtomicU32::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let ctrl = UnitController::new(
            target(50.0, 200),
            Box::new(ScriptSampler::repeating(0, vec![Some(50.0)])),
            Box::new(ExhaustedGen::new(attempts.clone())),
            test_cfg(),
            shutdown,
        );
        let summary = ctrl.run();
        assert_eq!(attempts.load(Ordering::Relaxed), 2);
        assert!(summary.failed);
        assert!(!summary.degraded);
        assert_eq!(summary.samples, 0);
    }

    #[test]
    fn test_short_sampler_outage_is_not_degraded() {
        // Three unavailable cycles, below the bound of five.
        let mut script = vec![Some(50.0), Some(50.0)];
        script.extend([None; 3]);
        script.push(Some(50.0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let ctrl = UnitController::new(
            target(50.0, 200),
            Box::new(ScriptSampler::repeating(0, script)),
            Box::new(SimGen::new(&SimDevice::default())),
            test_cfg(),
            shutdown,
        );
        let summary = ctrl.run();
        assert!(!summary.degraded);
        assert!(!summary.failed);
    }

    #[test]
    fn test_long_sampler_outage_degrades_and_freezes_duty() {
        // One warmup sample, then nothing. Duty must stay at its initial
        // value and the summary must be flagged.
        let shutdown = Arc::new(AtomicBool::new(false));
        let ctrl = UnitController::new(
            target(80.0, 200),
            Box::new(ScriptSampler::repeating(0, vec![Some(80.0), None])),
            Box::new(SimGen::new(&SimDevice::default())),
            test_cfg(),
            shutdown,
        );
        let snapshot = ctrl.snapshot_handle();
        let summary = ctrl.run();
        assert!(summary.degraded);
        assert!(!summary.failed);
        let duty = snapshot.lock().unwrap().duty;
        assert!((duty - 0.8).abs() < 1e-9, "duty = {}", duty);
    }

    #[test]
    fn test_warmup_sampler_failure_fails_fast() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let ctrl = UnitController::new(
            target(50.0, 60_000),
            Box::new(ScriptSampler::repeating(0, vec![None])),
            Box::new(SimGen::new(&SimDevice::default())),
            test_cfg(),
            shutdown,
        );
        let started = Instant::now();
        let summary = ctrl.run();
        assert!(summary.failed);
        assert_eq!(summary.samples, 0);
        // warmup_cycles * cycle_period plus slack, nowhere near the 60s
        // duration.
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_flat_out_pins_duty_regardless_of_samples() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let ctrl = UnitController::new(
            target(30.0, 150),
            Box::new(ScriptSampler::repeating(0, vec![Some(30.0)])),
            Box::new(SimGen::new_flat_out(&SimDevice::default())),
            test_cfg(),
            shutdown,
        );
        let snapshot = ctrl.snapshot_handle();
        assert_eq!(snapshot.lock().unwrap().duty, 1.0);
        let summary = ctrl.run();
        assert_eq!(snapshot.lock().unwrap().duty, 1.0);
        assert!(!summary.failed);
        // The target is accepted but has no effect on the duty cycle.
        assert_eq!(summary.target_pct, 30.0);
    }
}

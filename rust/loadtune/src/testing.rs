// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Deterministic stand-ins for samplers and generators, shared by the
//! controller and coordinator tests.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use anyhow::Result;

use crate::generator::BurstOutcome;
use crate::generator::GenError;
use crate::generator::LoadGenerator;
use crate::sampler::Sampler;
use crate::stats::Sample;
use crate::UnitId;

/// Emulates a CPU's busy-time accounting: stub generators sleep instead of
/// burning cycles and credit the slept time here, and the paired sampler
/// turns busy-time deltas over wall time into a utilization percentage,
/// the same way the procfs sampler does.
#[derive(Clone, Default)]
pub(crate) struct SimDevice {
    busy_ns: Arc<AtomicU64>,
}

impl SimDevice {
    pub fn sampler(&self, unit: UnitId) -> SimSampler {
        SimSampler {
            unit,
            dev: self.clone(),
            prev: None,
        }
    }
}

/// A set of per-unit [`SimDevice`]s, handed out on demand so a unit's
/// sampler and generator share busy-time accounting.
#[derive(Clone, Default)]
pub(crate) struct SimHost {
    devices: Arc<Mutex<std::collections::BTreeMap<UnitId, SimDevice>>>,
}

impl SimHost {
    pub fn device(&self, unit: UnitId) -> SimDevice {
        self.devices
            .lock()
            .expect("sim host lock poisoned")
            .entry(unit)
            .or_default()
            .clone()
    }
}

pub(crate) struct SimGen {
    dev: SimDevice,
    flat_out: bool,
}

impl SimGen {
    /// Working-set size the stub claims in its burst outcomes.
    pub const MEM_BYTES: usize = 4096;
}

impl SimGen {
    pub fn new(dev: &SimDevice) -> Self {
        Self {
            dev: dev.clone(),
            flat_out: false,
        }
    }

    pub fn new_flat_out(dev: &SimDevice) -> Self {
        Self {
            dev: dev.clone(),
            flat_out: true,
        }
    }
}

impl LoadGenerator for SimGen {
    fn negotiate(&mut self, size_hint: usize) -> Result<usize, GenError> {
        Ok(size_hint.max(1))
    }

    fn burst(&mut self, budget: Duration) -> BurstOutcome {
        std::thread::sleep(budget);
        self.dev
            .busy_ns
            .fetch_add(budget.as_nanos() as u64, Ordering::Relaxed);
        BurstOutcome {
            ops: 1,
            ran_for: budget,
            mem_bytes: Self::MEM_BYTES,
        }
    }

    fn release(&mut self) {}

    fn default_size(&self) -> usize {
        1
    }

    fn min_size(&self) -> usize {
        1
    }

    fn flat_out(&self) -> bool {
        self.flat_out
    }
}

pub(crate) struct SimSampler {
    unit: UnitId,
    dev: SimDevice,
    prev: Option<(Instant, u64)>,
}

impl Sampler for SimSampler {
    fn sample(&mut self) -> Result<Option<Sample>> {
        let now = Instant::now();
        let busy = self.dev.busy_ns.load(Ordering::Relaxed);
        let reading = match self.prev {
            Some((prev_at, prev_busy)) => {
                let wall_ns = (now - prev_at).as_nanos() as u64;
                if wall_ns == 0 {
                    None
                } else {
                    let util =
                        (busy.saturating_sub(prev_busy)) as f64 / wall_ns as f64 * 100.0;
                    Some(Sample {
                        unit: self.unit,
                        taken_at: now,
                        util_pct: util.clamp(0.0, 100.0),
                        temp_c: None,
                        freq_khz: None,
                        power_w: None,
                    })
                }
            }
            None => None,
        };
        self.prev = Some((now, busy));
        Ok(reading)
    }
}

/// Sampler driven by a fixed script; the last entry repeats forever.
/// `None` entries model an unavailable sampler.
pub(crate) struct ScriptSampler {
    unit: UnitId,
    script: Vec<Option<f64>>,
    idx: usize,
}

impl ScriptSampler {
    pub fn repeating(unit: UnitId, script: Vec<Option<f64>>) -> Self {
        assert!(!script.is_empty());
        Self {
            unit,
            script,
            idx: 0,
        }
    }
}

impl Sampler for ScriptSampler {
    fn sample(&mut self) -> Result<Option<Sample>> {
        let entry = self.script[self.idx.min(self.script.len() - 1)];
        self.idx += 1;
        Ok(entry.map(|util_pct| Sample {
            unit: self.unit,
            taken_at: Instant::now(),
            util_pct,
            temp_c: None,
            freq_khz: None,
            power_w: None,
        }))
    }
}

/// Sampler whose reading is a pure function of the controller's own duty
/// cycle: `util = min(100, gain * duty * 100)`. The duty reaches it
/// through a shared cell that the test keeps current from published
/// snapshots, closing the loop without any real load.
pub(crate) struct DutyEchoSampler {
    unit: UnitId,
    duty: Arc<Mutex<f64>>,
    gain: f64,
}

impl DutyEchoSampler {
    pub fn new(unit: UnitId, duty: Arc<Mutex<f64>>, gain: f64) -> Self {
        Self { unit, duty, gain }
    }
}

impl Sampler for DutyEchoSampler {
    fn sample(&mut self) -> Result<Option<Sample>> {
        let duty = *self.duty.lock().expect("duty cell lock poisoned");
        Ok(Some(Sample {
            unit: self.unit,
            taken_at: Instant::now(),
            util_pct: (self.gain * duty * 100.0).min(100.0),
            temp_c: None,
            freq_khz: None,
            power_w: None,
        }))
    }
}

/// Generator whose negotiation always fails, counting the attempts so
/// tests can assert the retry policy.
pub(crate) struct ExhaustedGen {
    attempts: Arc<AtomicU32>,
}

impl ExhaustedGen {
    pub fn new(attempts: Arc<AtomicU32>) -> Self {
        Self { attempts }
    }
}

impl LoadGenerator for ExhaustedGen {
    fn negotiate(&mut self, size_hint: usize) -> Result<usize, GenError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(GenError::ResourceExhausted {
            requested_bytes: size_hint,
        })
    }

    fn burst(&mut self, _budget: Duration) -> BurstOutcome {
        BurstOutcome::default()
    }

    fn release(&mut self) {}

    fn default_size(&self) -> usize {
        1024
    }

    fn min_size(&self) -> usize {
        16
    }
}

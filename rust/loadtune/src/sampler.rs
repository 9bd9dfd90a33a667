// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Utilization sampling.
//!
//! A [`Sampler`] reads the current utilization of the one unit it was
//! created for. It must be cheap; the owning controller treats anything
//! slower than a tenth of its cycle period as unavailable. Unavailability
//! is an `Ok(None)`, reserved `Err` for broken plumbing (unreadable
//! procfs, missing stat fields).

use std::path::PathBuf;
use std::time::Instant;

use ::fb_procfs as procfs;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

use crate::stats::Sample;
use crate::UnitId;

pub trait Sampler: Send {
    /// Read the unit's utilization since the previous call. `Ok(None)`
    /// means no reading is available this cycle (e.g. no baseline yet).
    /// Must not perturb the unit being measured.
    fn sample(&mut self) -> Result<Option<Sample>>;
}

fn sub_or_zero(curr: &u64, prev: &u64) -> u64 {
    curr.checked_sub(*prev).unwrap_or(0)
}

fn calc_util(curr: &procfs::CpuStat, prev: &procfs::CpuStat) -> Result<f64> {
    match (curr, prev) {
        (
            procfs::CpuStat {
                user_usec: Some(curr_user),
                nice_usec: Some(curr_nice),
                system_usec: Some(curr_system),
                idle_usec: Some(curr_idle),
                iowait_usec: Some(curr_iowait),
                irq_usec: Some(curr_irq),
                softirq_usec: Some(curr_softirq),
                stolen_usec: Some(curr_stolen),
                ..
            },
            procfs::CpuStat {
                user_usec: Some(prev_user),
                nice_usec: Some(prev_nice),
                system_usec: Some(prev_system),
                idle_usec: Some(prev_idle),
                iowait_usec: Some(prev_iowait),
                irq_usec: Some(prev_irq),
                softirq_usec: Some(prev_softirq),
                stolen_usec: Some(prev_stolen),
                ..
            },
        ) => {
            let idle_usec = sub_or_zero(curr_idle, prev_idle);
            let iowait_usec = sub_or_zero(curr_iowait, prev_iowait);
            let user_usec = sub_or_zero(curr_user, prev_user);
            let system_usec = sub_or_zero(curr_system, prev_system);
            let nice_usec = sub_or_zero(curr_nice, prev_nice);
            let irq_usec = sub_or_zero(curr_irq, prev_irq);
            let softirq_usec = sub_or_zero(curr_softirq, prev_softirq);
            let stolen_usec = sub_or_zero(curr_stolen, prev_stolen);

            let busy_usec =
                user_usec + system_usec + nice_usec + irq_usec + softirq_usec + stolen_usec;
            let total_usec = idle_usec + busy_usec + iowait_usec;
            if total_usec > 0 {
                Ok(((busy_usec as f64) / (total_usec as f64)).clamp(0.0, 1.0))
            } else {
                Ok(1.0)
            }
        }
        _ => {
            bail!("Missing stats in cpustat");
        }
    }
}

/// Samples one logical CPU from `/proc/stat` deltas between consecutive
/// calls. The first call only records the baseline and reports no reading.
pub struct ProcSampler {
    unit: UnitId,
    proc_reader: procfs::ProcReader,
    prev_stat: Option<procfs::CpuStat>,
    freq_path: PathBuf,
}

impl ProcSampler {
    pub fn new(unit: UnitId) -> Self {
        Self {
            unit,
            proc_reader: procfs::ProcReader::new(),
            prev_stat: None,
            freq_path: PathBuf::from(format!(
                "/sys/devices/system/cpu/cpu{}/cpufreq/scaling_cur_freq",
                unit
            )),
        }
    }

    fn read_cur_freq(&self) -> Option<u64> {
        std::fs::read_to_string(&self.freq_path)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
    }
}

impl Sampler for ProcSampler {
    fn sample(&mut self) -> Result<Option<Sample>> {
        let curr = self
            .proc_reader
            .read_stat()
            .context("Failed to read procfs")?
            .cpus_map
            .ok_or_else(|| anyhow!("Expected cpus_map to exist"))?
            .remove(&(self.unit as u32))
            .ok_or_else(|| anyhow!("No stat entry for CPU {}", self.unit))?;

        let util = match &self.prev_stat {
            Some(prev) => Some(calc_util(&curr, prev)?),
            None => None,
        };
        self.prev_stat = Some(curr);

        Ok(util.map(|u| Sample {
            unit: self.unit,
            taken_at: Instant::now(),
            util_pct: u * 100.0,
            temp_c: None,
            freq_khz: self.read_cur_freq(),
            power_w: None,
        }))
    }
}

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Host CPU enumeration.
//!
//! Discovers the logical CPUs available for load generation along with
//! their physical-core grouping, so callers can restrict a run to one
//! logical CPU per physical core (SMT/hyperthread siblings excluded). The
//! topology is read once from sysfs and is read-only afterwards; if the
//! host topology changes (hotplug), build a new one.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;

use anyhow::bail;
use anyhow::Result;
use glob::glob;
use sscanf::sscanf;

use crate::UnitId;

#[derive(Clone, Debug)]
pub struct Cpu {
    id: UnitId,
    core_id: usize,
    package_id: usize,
    max_freq_khz: usize,
}

impl Cpu {
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Physical core this logical CPU belongs to.
    pub fn core_id(&self) -> usize {
        self.core_id
    }

    pub fn package_id(&self) -> usize {
        self.package_id
    }

    /// Maximum scaling frequency in kHz, 0 if cpufreq is unavailable.
    pub fn max_freq_khz(&self) -> usize {
        self.max_freq_khz
    }
}

#[derive(Debug)]
pub struct Topology {
    cpus: BTreeMap<UnitId, Cpu>,
}

fn read_file_usize(path: &Path) -> Result<usize> {
    let val = match std::fs::read_to_string(path) {
        Ok(val) => val,
        Err(_) => {
            bail!("Failed to open or read file {:?}", path);
        }
    };

    match val.trim().parse::<usize>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            bail!("Failed to parse {}", val);
        }
    }
}

/// Parse a kernel CPU list string such as "0-3,8,10-11".
fn parse_cpu_list(list: &str) -> Result<BTreeSet<usize>> {
    let mut cpus = BTreeSet::new();
    for group in list.split(',') {
        let group = group.trim();
        if group.is_empty() {
            continue;
        }
        if let Ok((min, max)) = sscanf!(group, "{usize}-{usize}") {
            if min > max {
                bail!("Invalid CPU range {}", group);
            }
            for i in min..(max + 1) {
                cpus.insert(i);
            }
        } else if let Ok(single) = sscanf!(group, "{usize}") {
            cpus.insert(single);
        } else {
            bail!("Failed to parse online cpus {}", group);
        }
    }
    Ok(cpus)
}

fn online_cpus() -> Result<BTreeSet<usize>> {
    let online = std::fs::read_to_string("/sys/devices/system/cpu/online")?;
    parse_cpu_list(online.trim())
}

impl Topology {
    /// Build the topology from sysfs.
    pub fn new() -> Result<Self> {
        let online = online_cpus()?;
        let mut cpus = BTreeMap::new();

        let cpu_paths = glob("/sys/devices/system/cpu/cpu[0-9]*")?;
        for cpu_path in cpu_paths.filter_map(Result::ok) {
            let cpu_str = cpu_path.to_str().unwrap().trim();
            let id = match sscanf!(cpu_str, "/sys/devices/system/cpu/cpu{usize}") {
                Ok(val) => val,
                Err(_) => {
                    bail!("Failed to parse cpu ID {}", cpu_str);
                }
            };
            if !online.contains(&id) {
                continue;
            }

            let top_path = cpu_path.join("topology");
            let core_id = read_file_usize(&top_path.join("core_id"))?;
            let package_id =
                read_file_usize(&top_path.join("physical_package_id")).unwrap_or(0);

            // If the kernel is not compiled with CONFIG_CPU_FREQ, just
            // assume 0.
            let freq_path = cpu_path.join("cpufreq");
            let max_freq_khz =
                read_file_usize(&freq_path.join("scaling_max_freq")).unwrap_or(0);

            cpus.insert(
                id,
                Cpu {
                    id,
                    core_id,
                    package_id,
                    max_freq_khz,
                },
            );
        }

        if cpus.is_empty() {
            bail!("No online CPUs found under /sys/devices/system/cpu");
        }

        Ok(Self { cpus })
    }

    #[cfg(test)]
    pub(crate) fn from_cpus(cpus: Vec<Cpu>) -> Self {
        Self {
            cpus: cpus.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn test_cpu(id: UnitId, core_id: usize, package_id: usize) -> Cpu {
        Cpu {
            id,
            core_id,
            package_id,
            max_freq_khz: 0,
        }
    }

    pub fn cpus(&self) -> &BTreeMap<UnitId, Cpu> {
        &self.cpus
    }

    /// Number of online logical CPUs.
    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Number of physical cores spanned by the online CPUs.
    pub fn nr_cores(&self) -> usize {
        self.cpus
            .values()
            .map(|c| (c.package_id, c.core_id))
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// One logical CPU per physical core, the lowest-numbered sibling.
    pub fn primary_cpus(&self) -> Vec<UnitId> {
        let mut seen = BTreeSet::new();
        let mut primaries = Vec::new();
        for cpu in self.cpus.values() {
            if seen.insert((cpu.package_id, cpu.core_id)) {
                primaries.push(cpu.id);
            }
        }
        primaries
    }

    /// Resolve the unit set for a run. An explicit list is validated
    /// against the online CPUs; without one, all logical CPUs are used,
    /// or one per physical core when `no_smt` is set.
    pub fn select_units(&self, explicit: Option<&[UnitId]>, no_smt: bool) -> Result<Vec<UnitId>> {
        match explicit {
            Some(list) => {
                let invalid: Vec<UnitId> = list
                    .iter()
                    .copied()
                    .filter(|id| !self.cpus.contains_key(id))
                    .collect();
                if !invalid.is_empty() {
                    bail!(
                        "Invalid core numbers: {:?}. Valid cores: {:?}",
                        invalid,
                        self.cpus.keys().collect::<Vec<_>>()
                    );
                }
                let mut seen = BTreeSet::new();
                let dups: Vec<UnitId> = list
                    .iter()
                    .copied()
                    .filter(|id| !seen.insert(*id))
                    .collect();
                if !dups.is_empty() {
                    bail!("Duplicate core numbers: {:?}", dups);
                }
                Ok(list.to_vec())
            }
            None if no_smt => Ok(self.primary_cpus()),
            None => Ok(self.cpus.keys().copied().collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_core_smt() -> Topology {
        // cpu0/cpu2 share core 0, cpu1/cpu3 share core 1.
        Topology::from_cpus(vec![
            Topology::test_cpu(0, 0, 0),
            Topology::test_cpu(1, 1, 0),
            Topology::test_cpu(2, 0, 0),
            Topology::test_cpu(3, 1, 0),
        ])
    }

    #[test]
    fn test_parse_cpu_list() {
        let cpus = parse_cpu_list("0-3,8,10-11").unwrap();
        assert_eq!(
            cpus.into_iter().collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 8, 10, 11]
        );
        assert_eq!(parse_cpu_list("0").unwrap().len(), 1);
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list("x").is_err());
    }

    #[test]
    fn test_primary_cpus_skip_smt_siblings() {
        let top = two_core_smt();
        assert_eq!(top.nr_cpus(), 4);
        assert_eq!(top.nr_cores(), 2);
        assert_eq!(top.primary_cpus(), vec![0, 1]);
    }

    #[test]
    fn test_select_units_explicit_validation() {
        let top = two_core_smt();
        assert_eq!(top.select_units(Some(&[0, 2]), false).unwrap(), vec![0, 2]);
        assert!(top.select_units(Some(&[0, 9]), false).is_err());
        assert!(top.select_units(Some(&[1, 1]), false).is_err());
        assert_eq!(top.select_units(None, true).unwrap(), vec![0, 1]);
        assert_eq!(top.select_units(None, false).unwrap(), vec![0, 1, 2, 3]);
    }
}

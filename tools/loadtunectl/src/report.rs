// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Terminal reporter with an optional log-file tee.
//!
//! The periodic status is a single carriage-return-refreshed line with a
//! progress bar; the log file gets the same content one line per
//! interval, without the terminal control characters.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Context;
use anyhow::Result;
use log::info;
use log::warn;

use loadtune::stats::Phase;
use loadtune::Reporter;
use loadtune::RunResult;
use loadtune::UnitSnapshot;

/// 20-segment bar, one segment per 5 percentage points.
fn progress_bar(pct: f64) -> String {
    let filled = ((pct / 5.0) as usize).min(20);
    format!("[{}{}]", "=".repeat(filled), "-".repeat(20 - filled))
}

fn resolve_log_path(output: &Path) -> PathBuf {
    if output.is_dir() {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        output.join(format!("loadtune_{}.log", stamp))
    } else {
        output.to_path_buf()
    }
}

pub struct TermReporter {
    log_file: Option<File>,
}

impl TermReporter {
    pub fn new(output: Option<&Path>) -> Result<Self> {
        let log_file = match output {
            Some(path) => {
                let path = resolve_log_path(path);
                let file = File::create(&path)
                    .with_context(|| format!("Failed to create log file {}", path.display()))?;
                info!("Output will be saved to {}", path.display());
                Some(file)
            }
            None => None,
        };
        Ok(Self { log_file })
    }

    fn log_line(&mut self, line: &str) {
        if let Some(file) = &mut self.log_file {
            if writeln!(file, "{}", line).is_err() {
                warn!("Failed to write to log file, disabling it");
                self.log_file = None;
            }
        }
    }
}

impl Reporter for TermReporter {
    fn periodic(&mut self, snapshots: &[UnitSnapshot]) {
        let active: Vec<&UnitSnapshot> = snapshots
            .iter()
            .filter(|s| s.phase != Phase::Stopped)
            .collect();
        if active.is_empty() {
            return;
        }

        let current =
            active.iter().map(|s| s.util_pct).sum::<f64>() / active.len() as f64;
        let target =
            active.iter().map(|s| s.target_pct).sum::<f64>() / active.len() as f64;
        let remaining = active
            .iter()
            .map(|s| s.remaining_s)
            .fold(0.0f64, f64::max);

        let mut status = vec![
            progress_bar(current),
            format!("Current: {:.1}%", current),
            format!("Target: {:.1}%", target),
        ];
        for snap in &active {
            status.push(format!("Core {}: {:.1}%", snap.unit, snap.util_pct));
        }
        status.push(format!("Time: {}s", remaining as u64));

        let line = status.join(" | ");
        print!("\r{}", line);
        let _ = std::io::stdout().flush();
        self.log_line(&line);
    }

    fn finish(&mut self, result: &RunResult) {
        println!();
        let mut block = Vec::new();
        let _ = writeln!(block, "Per-core statistics:");
        let _ = result.format(&mut block);

        let completed: Vec<f64> = result
            .iter()
            .filter(|s| !s.failed && s.samples > 0)
            .map(|s| s.avg_util)
            .collect();
        if !completed.is_empty() {
            let overall = completed.iter().sum::<f64>() / completed.len() as f64;
            let _ = writeln!(block, "Average CPU usage during test: {:.1}%", overall);
        }

        let text = String::from_utf8_lossy(&block).into_owned();
        print!("{}", text);
        for line in text.lines() {
            self.log_line(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_bar_segments() {
        assert_eq!(progress_bar(0.0), format!("[{}]", "-".repeat(20)));
        assert_eq!(progress_bar(100.0), format!("[{}]", "=".repeat(20)));
        assert_eq!(progress_bar(50.0), format!("[{}{}]", "=".repeat(10), "-".repeat(10)));
        // Out-of-range input must not panic the formatter.
        assert_eq!(progress_bar(250.0), format!("[{}]", "=".repeat(20)));
    }

    #[test]
    fn test_resolve_log_path_keeps_explicit_file() {
        let path = resolve_log_path(Path::new("/tmp/does-not-exist/run.log"));
        assert_eq!(path, Path::new("/tmp/does-not-exist/run.log"));
    }
}

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

mod report;
use report::TermReporter;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;

use loadtune::Coordinator;
use loadtune::ControllerConfig;
use loadtune::GenMode;
use loadtune::ProcSampler;
use loadtune::Target;
use loadtune::Topology;

/// loadtunectl: hold CPU cores at a target utilization percentage.
///
/// Each selected core gets its own worker which alternates bursts of
/// synthetic load with idle intervals, adjusting the burst/idle ratio
/// every control cycle from the core's measured utilization. The run
/// lasts for the configured duration and ends with per-core utilization
/// statistics; Ctrl-C stops it early after a bounded drain.
///
/// A run that completes exits 0 even when individual cores degraded or
/// failed; inspect the final per-core block (or the JSON dump) for
/// per-core outcomes. Configuration errors exit non-zero before any
/// load is generated.
#[derive(Debug, Parser)]
struct Opts {
    /// Test duration in seconds.
    #[clap(short = 'd', long, default_value = "60")]
    duration: f64,

    /// Target CPU usage percentage, 1-100. Applied to every selected
    /// core unless --targets is given. Ignored in freq-max mode.
    #[clap(short = 't', long, default_value = "95")]
    target: f64,

    /// Per-core target percentages, one per selected core, e.g.
    /// --targets 70 90 with -c 0 1. The list length must match the
    /// number of selected cores.
    #[clap(long, num_args = 1..)]
    targets: Vec<f64>,

    /// Specific CPU cores to drive, e.g. -c 0 2 4. Defaults to all
    /// online logical CPUs.
    #[clap(short = 'c', long, num_args = 1..)]
    cores: Vec<usize>,

    /// Use only one logical CPU per physical core, leaving SMT /
    /// hyperthread siblings idle. Only applies when -c is not given.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_smt: bool,

    /// Drive the cores one at a time, each for the full duration,
    /// instead of all concurrently.
    #[clap(short = 's', long, action = clap::ArgAction::SetTrue)]
    sequential: bool,

    /// Load kernel: simple (arithmetic loop), matrix (dense matmul),
    /// ray (ray-sphere intersections) or freq-max (flat out, ignores
    /// the target percentage).
    #[clap(short = 'm', long, default_value = "simple")]
    mode: GenMode,

    /// Duplicate the report to a log file. A directory gets a
    /// timestamped file created inside it; any other path is used as
    /// the file name.
    #[clap(short = 'o', long)]
    output: Option<PathBuf>,

    /// Write the final per-core result as JSON to this path.
    #[clap(long)]
    json: Option<PathBuf>,

    /// Memory budget for the matrix working set, in MiB. Negotiation
    /// refuses working sets above this and retries smaller.
    #[clap(long, default_value = "1024")]
    mem_limit_mb: usize,

    /// Reporting interval in seconds.
    #[clap(short = 'i', long, default_value = "1.0")]
    interval: f64,

    /// Control cycle period in milliseconds.
    #[clap(long, default_value = "250")]
    cycle_ms: u64,

    /// Enable verbose output. Specify multiple times to increase
    /// verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    if opts.duration <= 0.0 {
        bail!("Duration must be positive");
    }
    if opts.interval <= 0.0 {
        bail!("Reporting interval must be positive");
    }
    if opts.cycle_ms == 0 {
        bail!("Cycle period must be positive");
    }

    let top = Topology::new()?;
    info!(
        "CPU topology: {} physical cores, {} logical CPUs",
        top.nr_cores(),
        top.nr_cpus()
    );

    let explicit = if opts.cores.is_empty() {
        None
    } else {
        Some(opts.cores.as_slice())
    };
    let units = top.select_units(explicit, opts.no_smt)?;

    let per_unit: Vec<f64> = if opts.targets.is_empty() {
        vec![opts.target; units.len()]
    } else if opts.targets.len() == units.len() {
        opts.targets.clone()
    } else {
        bail!(
            "--targets lists {} values but {} cores are selected",
            opts.targets.len(),
            units.len()
        );
    };

    let duration = Duration::from_secs_f64(opts.duration);
    let targets: Vec<Target> = units
        .iter()
        .zip(per_unit.iter())
        .map(|(&unit, &target_pct)| Target {
            unit,
            target_pct,
            duration,
        })
        .collect();

    info!("Using CPU cores: {:?}", units);
    info!(
        "Mode {}, duration {:.0}s, target(s) {:?}%",
        opts.mode, opts.duration, per_unit
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let cfg = ControllerConfig {
        cycle_period: Duration::from_millis(opts.cycle_ms),
        pin_thread: true,
        ..Default::default()
    };

    let mode = opts.mode;
    let mem_budget = opts.mem_limit_mb * 1024 * 1024;
    let coord = Coordinator::new(
        cfg,
        Box::new(|unit| Box::new(ProcSampler::new(unit))),
        Box::new(move |_| mode.make(mem_budget)),
        shutdown,
    )
    .with_report_interval(Duration::from_secs_f64(opts.interval));

    let mut reporter = TermReporter::new(opts.output.as_deref())?;
    let result = coord.run(&targets, !opts.sequential, &mut reporter)?;

    if let Some(path) = &opts.json {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &result)?;
        info!("JSON result written to {}", path.display());
    }

    if result.summaries.is_empty() {
        bail!("No unit completed the run");
    }
    Ok(())
}

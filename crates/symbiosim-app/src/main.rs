//! Command-line driver: load a run configuration, run the simulation to
//! completion, and optionally write per-symbiont exit records to CSV.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use symbiosim_core::{NullRecorder, Recorder, Simulation, SimulationConfig};
use symbiosim_storage::CsvRecorder;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "symbiosim",
    about = "Discrete-event simulation of symbiotic algae colonizing a grid of host cells"
)]
struct Cli {
    /// TOML run configuration; built-in defaults are used when omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the configured RNG seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Override the configured simulated time bound.
    #[arg(long, value_name = "TIME")]
    max_time: Option<f64>,

    /// Write per-symbiont exit records to this CSV file.
    #[arg(long, value_name = "FILE")]
    csv: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(max_time) = cli.max_time {
        config.max_time = max_time;
    }

    let recorder: Box<dyn Recorder> = match &cli.csv {
        Some(path) => Box::new(
            CsvRecorder::create(path)
                .with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(NullRecorder),
    };

    info!(
        rows = config.rows,
        cols = config.cols,
        clades = config.clades.len(),
        seed = config.seed,
        max_time = config.max_time,
        "starting run"
    );
    let mut sim = Simulation::with_recorder(config, recorder)?;
    let totals = sim.run()?;

    info!(
        events = totals.events_dispatched,
        seeded = totals.seeded,
        arrivals = totals.arrivals_admitted,
        dropped = totals.arrivals_dropped,
        divisions = totals.divisions,
        digestions = totals.digestions,
        escapes = totals.escapes,
        departures = totals.departures,
        evictions = totals.evictions,
        dispersals = totals.dispersals,
        rejections = totals.rejections,
        peak = totals.peak_population,
        residents = totals.final_population,
        t_end = totals.end_time,
        "run complete"
    );
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn load_config(path: Option<&Path>) -> Result<SimulationConfig> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(SimulationConfig::default()),
    }
}

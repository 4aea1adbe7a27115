//! `sysid`: fit local linear models of a simulated system along a nominal trajectory.
//!
//! ```text
//! USAGE:
//!   sysid <model.json> <control_timestep> <stepnum> <noise> <rollouts> [OPTIONS]
//! ```
//!
//! Nominal controls are read from `result0.txt` (override with `--controls`); nominal
//! states are either read with `--states` or simulated from the controls. The fitted
//! matrices and validation score are written to `lnr.txt` (override with `--output`).

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sysid_core::config::SysIdConfig;
use sysid_core::engine::{RunOutcome, Session};
use sysid_core::model::{load_model, ModelDescriptor};
use sysid_core::report::write_report;
use sysid_core::source::{load_controls, load_states};
use sysid_core::trajectory::{NominalTrajectory, StateLayout};
use sysid_core::traits::SimulationOracle;
use sysid_core::variant::VariantRegistry;
use sysid_core::SysIdError;

#[derive(Parser, Debug)]
#[command(
    name = "sysid",
    about = "Monte Carlo linearization along a nominal trajectory",
    version
)]
struct Cli {
    /// Model descriptor (JSON).
    model: PathBuf,
    /// Length of one control interval in seconds.
    control_timestep: f64,
    /// Number of trajectory steps.
    stepnum: usize,
    /// Perturbation coefficient, relative to the largest nominal control.
    noise: f64,
    /// Rollouts per trajectory step.
    rollouts: usize,
    /// Model variant, by name or numeric id.
    #[arg(long, default_value = "identity")]
    variant: String,
    #[arg(long, default_value_t = 1)]
    threads: usize,
    /// Monte Carlo repetitions of the validation pass.
    #[arg(long, default_value_t = 100)]
    test_runs: usize,
    /// Perturbation coefficient of the validation pass.
    #[arg(long, default_value_t = 0.01)]
    validation_noise: f64,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Nominal controls, whitespace separated, step-major.
    #[arg(long, default_value = "result0.txt")]
    controls: PathBuf,
    /// Nominal states; simulated from the controls when omitted.
    #[arg(long)]
    states: Option<PathBuf>,
    #[arg(long, default_value = "lnr.txt")]
    output: PathBuf,
    /// Ordinary degrees of freedom; defaults to the model's velocity count.
    #[arg(long)]
    dof: Option<usize>,
    /// Unit-norm blocks; defaults to positions minus velocities.
    #[arg(long)]
    quaternions: Option<usize>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let class = err
                .chain()
                .find_map(|cause| cause.downcast_ref::<SysIdError>())
                .map(|cause| cause.class().to_string())
                .unwrap_or_else(|| "error".to_string());
            eprintln!("{class}: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let text = fs::read_to_string(&cli.model)
        .with_context(|| format!("reading model {}", cli.model.display()))?;
    let descriptor: ModelDescriptor = serde_json::from_str(&text)
        .with_context(|| format!("parsing model {}", cli.model.display()))?;
    let model = load_model(&descriptor)?;
    info!(model = model.name(), path = %cli.model.display(), "model loaded");

    let dims = model.dimensions();
    let layout = StateLayout::new(
        cli.dof.unwrap_or(dims.velocities),
        cli.quaternions.unwrap_or(dims.positions.saturating_sub(dims.velocities)),
        dims.controls,
    );
    let registry = VariantRegistry::builtin();
    let variant = registry.lookup(&cli.variant);
    let config = SysIdConfig {
        noise_coefficient: cli.noise,
        rollouts: cli.rollouts,
        threads: cli.threads,
        control_timestep: cli.control_timestep,
        test_runs: cli.test_runs,
        validation_noise: cli.validation_noise,
        seed: cli.seed,
    };

    let controls = load_controls(&cli.controls, &layout, cli.stepnum)
        .with_context(|| format!("reading controls {}", cli.controls.display()))?;
    let session = match &cli.states {
        Some(path) => {
            let states = load_states(path, &layout, cli.stepnum)
                .with_context(|| format!("reading states {}", path.display()))?;
            let trajectory = NominalTrajectory::new(layout, cli.stepnum, states, controls)?;
            Session::new(&model, trajectory, variant, config)?
        }
        None => Session::from_controls(&model, layout, variant, config, cli.stepnum, controls)?,
    };

    println!(
        "\nRunning {} rollouts per step at dt_c = {}, dt_s = {} on {} thread(s)\n",
        session.config().rollouts,
        session.config().control_timestep,
        model.timestep(),
        session.workers()
    );
    let outcome = session.run()?;
    print_summary(&outcome);

    let file = File::create(&cli.output)
        .with_context(|| format!("creating report {}", cli.output.display()))?;
    write_report(
        BufWriter::new(file),
        &outcome.transitions,
        outcome.validation.mean_relative_error,
        outcome.noise_coefficient,
    )
    .with_context(|| format!("writing report {}", cli.output.display()))?;
    info!(path = %cli.output.display(), "report written");
    Ok(())
}

fn print_summary(outcome: &RunOutcome) {
    let stats = &outcome.stats;
    if stats.workers.len() > 1 {
        println!("Summary for all {} threads\n", stats.workers.len());
        println!("{}\n", stats.aggregate());
        println!("Details for thread 0");
    }
    if let Some(first) = stats.worker(0) {
        println!("\n{first}");
    }
    println!(" Degrees of freedom   : {}\n", stats.degrees_of_freedom);

    let validation = &outcome.validation;
    println!(
        " Validation error     : {:.4} ({} samples, {} exact-zero skipped, {} runs)",
        validation.mean_relative_error, validation.samples, validation.skipped, validation.runs
    );
}

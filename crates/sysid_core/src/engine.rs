//! One linearization run: fit every step, then validate, then summarize.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::{integration_substeps, SysIdConfig};
use crate::error::Result;
use crate::rollout::{simulate_nominal, RolloutStats};
use crate::sampler::noise_scale;
use crate::scheduler::{linearize, FitPlan, WorkerStats};
use crate::trajectory::{NominalTrajectory, StateLayout, TransitionSet};
use crate::traits::SimulationOracle;
use crate::validation::{validate, ValidationPlan, ValidationReport};
use crate::variant::{ModelVariant, StateMap};

/// A validated run setup. Construction checks the configuration, the timestep ratio and
/// the variant against the oracle, so [`run`](Self::run) only fails on resource errors.
pub struct Session<'a, O: SimulationOracle> {
    oracle: &'a O,
    trajectory: NominalTrajectory,
    variant: &'a ModelVariant,
    map: StateMap,
    config: SysIdConfig,
    substeps: usize,
    workers: usize,
}

impl<'a, O: SimulationOracle> Session<'a, O> {
    pub fn new(
        oracle: &'a O,
        trajectory: NominalTrajectory,
        variant: &'a ModelVariant,
        config: SysIdConfig,
    ) -> Result<Self> {
        let layout = trajectory.layout();
        let (map, substeps) = prepare(oracle, &layout, variant, &config)?;
        let workers = config.worker_count(trajectory.steps());
        Ok(Self {
            oracle,
            trajectory,
            variant,
            map,
            config,
            substeps,
            workers,
        })
    }

    /// Builds the nominal states by rolling `controls` forward from the oracle's initial
    /// keyframe.
    pub fn from_controls(
        oracle: &'a O,
        layout: StateLayout,
        variant: &'a ModelVariant,
        config: SysIdConfig,
        steps: usize,
        controls: Vec<f64>,
    ) -> Result<Self> {
        let (map, substeps) = prepare(oracle, &layout, variant, &config)?;
        let trajectory =
            simulate_nominal(oracle, layout, variant, &map, steps, controls, substeps)?;
        let workers = config.worker_count(trajectory.steps());
        Ok(Self {
            oracle,
            trajectory,
            variant,
            map,
            config,
            substeps,
            workers,
        })
    }

    pub fn trajectory(&self) -> &NominalTrajectory {
        &self.trajectory
    }

    pub fn config(&self) -> &SysIdConfig {
        &self.config
    }

    pub fn substeps(&self) -> usize {
        self.substeps
    }

    /// Worker threads the fit will use, after clamping to `1..=MAX_THREADS` and to the
    /// step count.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Unit-norm blocks are perturbed with the ordinary deviation while fitting.
    fn fit_plan(&self) -> FitPlan<'_, O> {
        let sigma = noise_scale(self.config.noise_coefficient, self.trajectory.ctrl_max());
        FitPlan {
            oracle: self.oracle,
            trajectory: &self.trajectory,
            variant: self.variant,
            map: &self.map,
            substeps: self.substeps,
            rollouts: self.config.rollouts,
            sigma,
            quaternion_sigma: sigma,
            seed: self.config.seed,
        }
    }

    /// Unit-norm blocks use the variant's fixed deviation during validation.
    fn validation_plan(&self) -> ValidationPlan<'_, O> {
        ValidationPlan {
            oracle: self.oracle,
            trajectory: &self.trajectory,
            variant: self.variant,
            map: &self.map,
            substeps: self.substeps,
            test_runs: self.config.test_runs,
            sigma: noise_scale(self.config.validation_noise, self.trajectory.ctrl_max()),
            quaternion_sigma: self.variant.validation_quaternion_noise,
            seed: self.config.seed,
        }
    }

    pub fn run(&self) -> Result<RunOutcome> {
        let started = Instant::now();
        let layout = self.trajectory.layout();
        let ctrl_max = self.trajectory.ctrl_max();
        if ctrl_max == 0.0 {
            warn!("every nominal control is zero; ordinary perturbations vanish");
        }
        info!(
            variant = %self.variant.name,
            dof = layout.dof,
            quaternions = layout.quaternions,
            actuators = layout.actuators,
            ctrl_max,
            "run started"
        );

        let fit = linearize(&self.fit_plan(), self.workers)?;
        let fit_time = started.elapsed();

        let validation = validate(&self.validation_plan(), &fit.transitions)?;

        Ok(RunOutcome {
            transitions: fit.transitions,
            validation,
            noise_coefficient: self.config.noise_coefficient,
            stats: RunStats {
                workers: fit.workers,
                wall_time: fit_time,
                timestep: self.oracle.timestep(),
                degrees_of_freedom: self.oracle.dimensions().velocities,
            },
        })
    }
}

fn prepare<O: SimulationOracle>(
    oracle: &O,
    layout: &StateLayout,
    variant: &ModelVariant,
    config: &SysIdConfig,
) -> Result<(StateMap, usize)> {
    config.validate(layout)?;
    let substeps = integration_substeps(config.control_timestep, oracle.timestep())?;
    let map = variant.state_map(layout, oracle.dimensions())?;
    Ok((map, substeps))
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub transitions: TransitionSet,
    pub validation: ValidationReport,
    pub noise_coefficient: f64,
    pub stats: RunStats,
}

/// Timing and simulator counters of the fitting phase.
#[derive(Debug, Clone)]
pub struct RunStats {
    pub workers: Vec<WorkerStats>,
    /// Wall time from the start of the run until every worker joined.
    pub wall_time: Duration,
    pub timestep: f64,
    pub degrees_of_freedom: usize,
}

impl RunStats {
    pub fn total(&self) -> RolloutStats {
        let mut total = RolloutStats::default();
        for worker in &self.workers {
            total.merge(&worker.rollouts);
        }
        total
    }

    /// Throughput of all workers against the shared wall time.
    pub fn aggregate(&self) -> Throughput {
        Throughput::new(&self.total(), self.wall_time, self.timestep)
    }

    pub fn worker(&self, index: usize) -> Option<Throughput> {
        self.workers
            .get(index)
            .map(|w| Throughput::new(&w.rollouts, w.elapsed, self.timestep))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub sim_steps: usize,
    pub seconds: f64,
    pub steps_per_second: f64,
    /// Simulated time over wall time.
    pub realtime_factor: f64,
    pub ms_per_step: f64,
    pub contacts_per_step: f64,
    pub constraints_per_step: f64,
}

impl Throughput {
    pub fn new(stats: &RolloutStats, elapsed: Duration, timestep: f64) -> Self {
        let seconds = elapsed.as_secs_f64();
        let steps = stats.sim_steps as f64;
        let per_step = |count: usize| {
            if stats.sim_steps == 0 {
                0.0
            } else {
                count as f64 / steps
            }
        };
        let (steps_per_second, realtime_factor) = if seconds > 0.0 {
            (steps / seconds, steps * timestep / seconds)
        } else {
            (0.0, 0.0)
        };
        Self {
            sim_steps: stats.sim_steps,
            seconds,
            steps_per_second,
            realtime_factor,
            ms_per_step: if stats.sim_steps == 0 {
                0.0
            } else {
                1000.0 * seconds / steps
            },
            contacts_per_step: per_step(stats.contacts),
            constraints_per_step: per_step(stats.constraints),
        }
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, " Simulation time      : {:.2} s", self.seconds)?;
        writeln!(f, " Number of steps      : {}", self.sim_steps)?;
        writeln!(f, " Steps per second     : {:.0}", self.steps_per_second)?;
        writeln!(f, " Realtime factor      : {:.2} x", self.realtime_factor)?;
        writeln!(f, " Time per step        : {:.4} ms", self.ms_per_step)?;
        writeln!(f, " Contacts per step    : {:.2}", self.contacts_per_step)?;
        write!(f, " Constraints per step : {:.2}", self.constraints_per_step)
    }
}

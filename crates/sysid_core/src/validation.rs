//! Monte Carlo check of the fitted transition matrices against fresh rollouts.

use nalgebra::DVector;
use tracing::{debug, info, warn};

use crate::error::{Result, SysIdError};
use crate::rollout::{RolloutExecutor, RolloutStats};
use crate::sampler::PerturbationSampler;
use crate::scheduler::step_rng;
use crate::trajectory::{NominalTrajectory, TransitionSet};
use crate::traits::SimulationOracle;
use crate::variant::{ModelVariant, StateMap};

/// First generator stream used by validation runs; fitting uses streams below it.
pub const VALIDATION_STREAM_BASE: u64 = 1 << 63;

/// Running mean of `|predicted - actual| / |actual|`, skipping exact-zero `actual`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RelativeErrorAccumulator {
    sum: f64,
    samples: usize,
    skipped: usize,
}

impl RelativeErrorAccumulator {
    pub fn push(&mut self, predicted: f64, actual: f64) {
        if actual == 0.0 {
            self.skipped += 1;
            return;
        }
        self.sum += ((predicted - actual) / actual).abs();
        self.samples += 1;
    }

    pub fn extend(&mut self, predicted: &[f64], actual: &[f64]) {
        for (&p, &a) in predicted.iter().zip(actual) {
            self.push(p, a);
        }
    }

    /// NaN when nothing was accumulated.
    pub fn mean(&self) -> f64 {
        if self.samples == 0 {
            f64::NAN
        } else {
            self.sum / self.samples as f64
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

pub struct ValidationPlan<'a, O: SimulationOracle> {
    pub oracle: &'a O,
    pub trajectory: &'a NominalTrajectory,
    pub variant: &'a ModelVariant,
    pub map: &'a StateMap,
    pub substeps: usize,
    pub test_runs: usize,
    pub sigma: f64,
    pub quaternion_sigma: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub mean_relative_error: f64,
    pub samples: usize,
    /// Samples left out because the simulated delta was exactly zero.
    pub skipped: usize,
    pub runs: usize,
    pub rollouts: RolloutStats,
}

/// Scores `transitions` on `test_runs` fresh perturbation batches.
///
/// Each run draws one perturbation per step, predicts the next-state delta with that
/// step's matrix and compares it with the simulated delta. Runs single-threaded on one
/// context, after fitting has completed.
pub fn validate<O: SimulationOracle>(
    plan: &ValidationPlan<'_, O>,
    transitions: &TransitionSet,
) -> Result<ValidationReport> {
    let trajectory = plan.trajectory;
    let layout = trajectory.layout();
    let steps = trajectory.steps();
    if transitions.layout() != layout {
        return Err(SysIdError::config(
            "transition matrices were fitted for a different state layout.",
        ));
    }
    if transitions.len() != steps {
        return Err(SysIdError::DimensionMismatch {
            what: "transition set",
            expected: steps,
            got: transitions.len(),
        });
    }

    info!(runs = plan.test_runs, steps, "validation started");
    let context = plan.oracle.make_context()?;
    let mut executor = RolloutExecutor::new(
        context,
        plan.oracle.dimensions(),
        trajectory,
        plan.variant,
        plan.map,
        plan.substeps,
    );
    let sampler = PerturbationSampler::new(layout, &plan.variant.quaternion_offsets);
    let input_dim = layout.input_dim();
    let mut batch = vec![0.0; steps * input_dim];
    let mut actual = vec![0.0; layout.state_dim()];
    let mut errors = RelativeErrorAccumulator::default();

    for run in 0..plan.test_runs {
        let mut rng = step_rng(plan.seed, VALIDATION_STREAM_BASE + run as u64);
        for step in 0..steps {
            let nominal = trajectory.state(step);
            let perturbation = &mut batch[step * input_dim..(step + 1) * input_dim];
            sampler.sample(&mut rng, plan.sigma, plan.quaternion_sigma, nominal, perturbation);
        }

        for (step, matrix) in transitions.iter().enumerate() {
            let perturbation = &batch[step * input_dim..(step + 1) * input_dim];
            executor.rollout(step, perturbation, &mut actual);
            let predicted = matrix * DVector::from_column_slice(perturbation);
            errors.extend(predicted.as_slice(), &actual);
        }
        debug!(run, running_mean = errors.mean(), "validation run finished");
    }

    let report = ValidationReport {
        mean_relative_error: errors.mean(),
        samples: errors.samples(),
        skipped: errors.skipped(),
        runs: plan.test_runs,
        rollouts: executor.stats(),
    };
    if report.samples == 0 {
        warn!(
            skipped = report.skipped,
            "every simulated delta was exactly zero; validation error is undefined"
        );
    } else if report.skipped > 0 {
        debug!(skipped = report.skipped, "exact-zero deltas left out of the score");
    }
    info!(
        error = report.mean_relative_error,
        samples = report.samples,
        skipped = report.skipped,
        "validation finished"
    );
    Ok(report)
}

//! Partitioned, multi-threaded fitting of the transition matrices.
//!
//! The trajectory is cut into contiguous blocks, one per worker. Each worker owns its own
//! simulation context and writes only the matrices of its block; the scope join is the
//! barrier after which the full [`TransitionSet`] may be read.

use std::ops::Range;
use std::thread;
use std::time::{Duration, Instant};

use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::config::MAX_THREADS;
use crate::error::{Result, SysIdError};
use crate::regression;
use crate::rollout::{RolloutExecutor, RolloutStats};
use crate::sampler::PerturbationSampler;
use crate::trajectory::{NominalTrajectory, StepBlock, TransitionSet};
use crate::traits::SimulationOracle;
use crate::variant::{ModelVariant, StateMap};

/// Everything a worker needs to fit its block. Shared read-only across workers.
pub struct FitPlan<'a, O: SimulationOracle> {
    pub oracle: &'a O,
    pub trajectory: &'a NominalTrajectory,
    pub variant: &'a ModelVariant,
    pub map: &'a StateMap,
    pub substeps: usize,
    pub rollouts: usize,
    /// Deviation of ordinary perturbation components.
    pub sigma: f64,
    /// Deviation of the noise added to unit-norm blocks before renormalizing.
    pub quaternion_sigma: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStats {
    pub worker: usize,
    pub steps: Range<usize>,
    pub rollouts: RolloutStats,
    /// Steps whose Gram matrix was rank deficient.
    pub rank_deficient: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct FitOutput {
    pub transitions: TransitionSet,
    pub workers: Vec<WorkerStats>,
}

/// Splits `0..steps` into `workers` contiguous blocks of `⌊steps / workers⌋` steps, the
/// first `steps mod workers` blocks taking one extra step.
pub fn partition(steps: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    let base = steps / workers;
    let extra = steps % workers;
    let mut start = 0;
    (0..workers)
        .map(|worker| {
            let len = base + usize::from(worker < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

/// Generator for fitting step `step`. Independent of which worker fits the step.
pub(crate) fn step_rng(seed: u64, stream: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(stream);
    rng
}

/// Fits one transition matrix per trajectory step. `workers` is capped at [`MAX_THREADS`] and
/// at the step count.
pub fn linearize<O: SimulationOracle>(plan: &FitPlan<'_, O>, workers: usize) -> Result<FitOutput> {
    let layout = plan.trajectory.layout();
    let steps = plan.trajectory.steps();
    let ranges = partition(steps, workers.clamp(1, MAX_THREADS).min(steps.max(1)));
    info!(
        steps,
        workers = ranges.len(),
        rollouts = plan.rollouts,
        substeps = plan.substeps,
        "linearization started"
    );

    let mut transitions = TransitionSet::zeros(layout, steps);
    let blocks = transitions.blocks_mut(&ranges)?;
    let results: Vec<Result<WorkerStats>> = thread::scope(|scope| {
        let handles: Vec<_> = blocks
            .into_iter()
            .enumerate()
            .map(|(worker, block)| {
                thread::Builder::new()
                    .name(format!("sysid-worker-{worker}"))
                    .spawn_scoped(scope, move || fit_block(plan, worker, block))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(worker, handle)| match handle {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|_| Err(SysIdError::WorkerPanicked(worker))),
                Err(err) => Err(SysIdError::ContextAllocation(format!(
                    "could not spawn worker {worker}: {err}"
                ))),
            })
            .collect()
    });
    let workers = results.into_iter().collect::<Result<Vec<_>>>()?;

    info!(steps, "linearization finished");
    Ok(FitOutput {
        transitions,
        workers,
    })
}

fn fit_block<O: SimulationOracle>(
    plan: &FitPlan<'_, O>,
    worker: usize,
    mut block: StepBlock<'_>,
) -> Result<WorkerStats> {
    let started = Instant::now();
    let layout = plan.trajectory.layout();
    let (input_dim, state_dim) = (layout.input_dim(), layout.state_dim());
    let context = plan.oracle.make_context()?;
    let mut executor = RolloutExecutor::new(
        context,
        plan.oracle.dimensions(),
        plan.trajectory,
        plan.variant,
        plan.map,
        plan.substeps,
    );
    let sampler = PerturbationSampler::new(layout, &plan.variant.quaternion_offsets);

    // Column j of each batch is rollout j.
    let mut inputs = DMatrix::zeros(input_dim, plan.rollouts);
    let mut outputs = DMatrix::zeros(state_dim, plan.rollouts);
    let range = block.steps();
    let report_every = (range.len() / 5).max(1);
    let mut rank_deficient = 0;

    for (done, step) in range.clone().enumerate() {
        let mut rng = step_rng(plan.seed, step as u64);
        let nominal = plan.trajectory.state(step);
        for j in 0..plan.rollouts {
            let input = &mut inputs.as_mut_slice()[j * input_dim..(j + 1) * input_dim];
            sampler.sample(&mut rng, plan.sigma, plan.quaternion_sigma, nominal, input);
            let output = &mut outputs.as_mut_slice()[j * state_dim..(j + 1) * state_dim];
            executor.rollout(step, input, output);
        }

        let fitted = regression::fit(&inputs, &outputs)?;
        if !fitted.finite {
            warn!(step, "non-finite rollout data; transition matrix set to NaN");
        } else if fitted.is_rank_deficient() {
            rank_deficient += 1;
            warn!(
                step,
                rank = fitted.rank,
                input_dim,
                "rank-deficient Gram matrix; using the minimum-norm fit"
            );
        }
        debug!(step, worker, rank = fitted.rank, "fitted transition matrix");
        block.set(step, fitted.matrix)?;

        if worker == 0 && ((done + 1) % report_every == 0 || done + 1 == range.len()) {
            info!(worker, percent = (done + 1) * 100 / range.len(), "fitting progress");
        }
    }

    Ok(WorkerStats {
        worker,
        steps: range,
        rollouts: executor.stats(),
        rank_deficient,
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::{linearize, partition, FitPlan};
    use crate::config::MAX_THREADS;
    use crate::rollout::simulate_nominal;
    use crate::testing::AffineOracle;
    use crate::trajectory::StateLayout;
    use crate::traits::SimulationOracle;
    use crate::variant::ModelVariant;

    #[test]
    fn partition_covers_every_step_once() {
        for steps in 0..40 {
            for workers in 1..=8 {
                let ranges = partition(steps, workers);
                assert_eq!(ranges.len(), workers);
                let mut next = 0;
                for range in &ranges {
                    assert_eq!(range.start, next);
                    next = range.end;
                }
                assert_eq!(next, steps);
                let longest = ranges.iter().map(|r| r.len()).max().unwrap_or(0);
                let shortest = ranges.iter().map(|r| r.len()).min().unwrap_or(0);
                assert!(longest - shortest <= 1);
            }
        }
    }

    #[test]
    fn partition_front_loads_the_remainder() {
        assert_eq!(partition(10, 4), vec![0..3, 3..6, 6..8, 8..10]);
        assert_eq!(partition(3, 1), vec![0..3]);
    }

    fn fit_with(workers: usize) -> super::FitOutput {
        fit_over(7, workers)
    }

    fn fit_over(steps: usize, workers: usize) -> super::FitOutput {
        let oracle = AffineOracle::scalar(0.95, 0.2).with_contacts(1);
        let layout = StateLayout::new(1, 0, 1);
        let variant = ModelVariant::identity();
        let map = variant.state_map(&layout, oracle.dimensions()).unwrap();
        let controls: Vec<f64> = (0..steps).map(|k| (k as f64 * 0.7).sin()).collect();
        let trajectory =
            simulate_nominal(&oracle, layout, &variant, &map, steps, controls, 3).unwrap();
        let plan = FitPlan {
            oracle: &oracle,
            trajectory: &trajectory,
            variant: &variant,
            map: &map,
            substeps: 3,
            rollouts: 12,
            sigma: 0.05,
            quaternion_sigma: 0.05,
            seed: 42,
        };
        linearize(&plan, workers).unwrap()
    }

    #[test]
    fn affine_dynamics_are_recovered() {
        let output = fit_with(2);
        // Three micro-steps of x' = 0.95 x + 0.2 u, v' = 0.95 v.
        let a = 0.95_f64;
        let expected_x = [a.powi(3), 0.0, 0.2 * (1.0 + a + a * a)];
        let expected_v = [0.0, a.powi(3), 0.0];
        for matrix in output.transitions.iter() {
            for c in 0..3 {
                assert!((matrix[(0, c)] - expected_x[c]).abs() < 1e-9, "{matrix}");
                assert!((matrix[(1, c)] - expected_v[c]).abs() < 1e-9, "{matrix}");
            }
        }
    }

    #[test]
    fn worker_stats_cover_the_trajectory() {
        let output = fit_with(3);
        assert_eq!(output.workers.len(), 3);
        assert_eq!(output.workers[0].steps, 0..3);
        let rollouts: usize = output.workers.iter().map(|w| w.rollouts.rollouts).sum();
        assert_eq!(rollouts, 7 * 12);
        let sim_steps: usize = output.workers.iter().map(|w| w.rollouts.sim_steps).sum();
        assert_eq!(sim_steps, 7 * 12 * 3);
        let contacts: usize = output.workers.iter().map(|w| w.rollouts.contacts).sum();
        assert_eq!(contacts, 7 * 12);
    }

    #[test]
    fn results_do_not_depend_on_worker_count() {
        let single = fit_with(1);
        let many = fit_with(4);
        for (a, b) in single.transitions.iter().zip(many.transitions.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn more_workers_than_steps_are_clamped() {
        let output = fit_with(32);
        assert_eq!(output.workers.len(), 7);
        assert!(output.workers.iter().all(|w| w.steps.len() == 1));
    }

    #[test]
    fn worker_count_never_exceeds_the_thread_cap() {
        let output = fit_over(20, 32);
        assert_eq!(output.workers.len(), MAX_THREADS);
        assert_eq!(output.transitions.len(), 20);
        assert_eq!(output.workers[0].steps, 0..3);
        assert_eq!(output.workers[7].steps, 18..20);
    }
}

//! Single control-interval rollouts against a private simulation context.

use crate::error::{Result, SysIdError};
use crate::trajectory::{NominalTrajectory, StateLayout};
use crate::traits::{SimContext, SimDimensions, SimulationOracle};
use crate::variant::{ModelVariant, StateMap};

/// Counters accumulated by one executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RolloutStats {
    pub rollouts: usize,
    /// Micro-steps taken, pre-roll included.
    pub sim_steps: usize,
    pub contacts: usize,
    pub constraints: usize,
}

impl RolloutStats {
    pub fn merge(&mut self, other: &RolloutStats) {
        self.rollouts += other.rollouts;
        self.sim_steps += other.sim_steps;
        self.contacts += other.contacts;
        self.constraints += other.constraints;
    }
}

/// Applies perturbed states to a context and measures the state delta one control
/// interval later.
pub struct RolloutExecutor<'a, C: SimContext> {
    context: C,
    trajectory: &'a NominalTrajectory,
    variant: &'a ModelVariant,
    map: &'a StateMap,
    substeps: usize,
    positions: Vec<f64>,
    velocities: Vec<f64>,
    controls: Vec<f64>,
    settle_velocities: Vec<f64>,
    settle_controls: Vec<f64>,
    stats: RolloutStats,
}

impl<'a, C: SimContext> RolloutExecutor<'a, C> {
    pub fn new(
        context: C,
        sim: SimDimensions,
        trajectory: &'a NominalTrajectory,
        variant: &'a ModelVariant,
        map: &'a StateMap,
        substeps: usize,
    ) -> Self {
        Self {
            context,
            trajectory,
            variant,
            map,
            substeps,
            positions: vec![0.0; sim.positions],
            velocities: vec![0.0; sim.velocities],
            controls: vec![0.0; sim.controls],
            settle_velocities: vec![0.0; sim.velocities],
            settle_controls: vec![0.0; sim.controls],
            stats: RolloutStats::default(),
        }
    }

    pub fn stats(&self) -> RolloutStats {
        self.stats
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    /// Rolls `nominal[step] + perturbation` forward one control interval and writes
    /// `state - nominal[step + 1]` into `delta`.
    ///
    /// Non-finite simulator output is passed through unchanged.
    pub fn rollout(&mut self, step: usize, perturbation: &[f64], delta: &mut [f64]) {
        let trajectory = self.trajectory;
        let layout = trajectory.layout();
        debug_assert_eq!(perturbation.len(), layout.input_dim());
        debug_assert_eq!(delta.len(), layout.state_dim());

        let start = trajectory.state(step);
        let nominal_controls = trajectory.control(step);
        let control_offset = layout.state_dim();

        // Unmapped coordinates keep the context's current values.
        self.context.read_state(&mut self.positions, &mut self.velocities);
        self.place_positions(start, perturbation);
        self.place_velocities(&layout, start, perturbation);
        for (k, u) in self.controls.iter_mut().enumerate() {
            *u = nominal_controls[k] + perturbation[control_offset + k];
        }
        self.variant.resolve(&mut self.positions, &mut self.velocities);

        if let Some(iterations) = self.variant.preroll {
            self.settle(&layout, start, perturbation, iterations);
        }

        self.context.write_state(&self.positions, &self.velocities, &self.controls);
        for _ in 0..self.substeps {
            self.context.step();
        }
        self.context.read_state(&mut self.positions, &mut self.velocities);

        let next = trajectory.state(step + 1);
        let velocity_offset = layout.position_dim();
        for (i, &idx) in self.map.positions().iter().enumerate() {
            delta[i] = self.positions[idx] - next[i];
        }
        for (j, &idx) in self.map.velocities().iter().enumerate() {
            delta[velocity_offset + j] = self.velocities[idx] - next[velocity_offset + j];
        }

        let diagnostics = self.context.diagnostics();
        self.stats.rollouts += 1;
        self.stats.sim_steps += self.substeps;
        self.stats.contacts += diagnostics.contacts;
        self.stats.constraints += diagnostics.constraints;
    }

    /// Holds the perturbed positions under zero velocity and control so that coordinates
    /// constrained to them can relax, then restores the perturbed velocities.
    fn settle(
        &mut self,
        layout: &StateLayout,
        start: &[f64],
        perturbation: &[f64],
        iterations: usize,
    ) {
        for _ in 0..iterations {
            self.place_positions(start, perturbation);
            self.settle_velocities.fill(0.0);
            self.variant.resolve(&mut self.positions, &mut self.settle_velocities);
            self.context.write_state(
                &self.positions,
                &self.settle_velocities,
                &self.settle_controls,
            );
            self.context.step();
            self.context.read_state(&mut self.positions, &mut self.settle_velocities);
        }
        self.velocities.copy_from_slice(&self.settle_velocities);
        self.place_velocities(layout, start, perturbation);
        self.variant.resolve(&mut self.positions, &mut self.velocities);
        self.stats.sim_steps += iterations;
    }

    fn place_positions(&mut self, start: &[f64], perturbation: &[f64]) {
        for (i, &idx) in self.map.positions().iter().enumerate() {
            self.positions[idx] = start[i] + perturbation[i];
        }
    }

    fn place_velocities(&mut self, layout: &StateLayout, start: &[f64], perturbation: &[f64]) {
        let offset = layout.position_dim();
        for (j, &idx) in self.map.velocities().iter().enumerate() {
            self.velocities[idx] = start[offset + j] + perturbation[offset + j];
        }
    }
}

/// Builds the nominal trajectory by stepping `controls` forward from the state a fresh
/// context starts in.
pub fn simulate_nominal<O: SimulationOracle>(
    oracle: &O,
    layout: StateLayout,
    variant: &ModelVariant,
    map: &StateMap,
    steps: usize,
    controls: Vec<f64>,
    substeps: usize,
) -> Result<NominalTrajectory> {
    if controls.len() != steps * layout.actuators {
        return Err(SysIdError::MissingData(format!(
            "expected {} nominal control values ({} steps of width {}), got {}",
            steps * layout.actuators,
            steps,
            layout.actuators,
            controls.len()
        )));
    }
    let sim = oracle.dimensions();
    let mut context = oracle.make_context()?;
    let mut positions = vec![0.0; sim.positions];
    let mut velocities = vec![0.0; sim.velocities];
    context.read_state(&mut positions, &mut velocities);
    variant.resolve(&mut positions, &mut velocities);

    let mut states = Vec::with_capacity((steps + 1) * layout.state_dim());
    push_reduced(&mut states, map, &positions, &velocities);
    for step in 0..steps {
        let u = &controls[step * layout.actuators..(step + 1) * layout.actuators];
        context.write_state(&positions, &velocities, u);
        for _ in 0..substeps {
            context.step();
        }
        context.read_state(&mut positions, &mut velocities);
        push_reduced(&mut states, map, &positions, &velocities);
    }

    NominalTrajectory::new(layout, steps, states, controls)
}

fn push_reduced(states: &mut Vec<f64>, map: &StateMap, positions: &[f64], velocities: &[f64]) {
    states.extend(map.positions().iter().map(|&idx| positions[idx]));
    states.extend(map.velocities().iter().map(|&idx| velocities[idx]));
}

#[cfg(test)]
mod tests {
    use super::{simulate_nominal, RolloutExecutor};
    use crate::testing::AffineOracle;
    use crate::trajectory::{NominalTrajectory, StateLayout};
    use crate::traits::SimulationOracle;
    use crate::variant::{ModelVariant, VariantRegistry};

    #[test]
    fn zero_perturbation_reproduces_the_nominal_step() {
        let oracle = AffineOracle::scalar(0.9, 0.5);
        let layout = StateLayout::new(1, 0, 1);
        let variant = ModelVariant::identity();
        let map = variant.state_map(&layout, oracle.dimensions()).unwrap();
        let trajectory =
            simulate_nominal(&oracle, layout, &variant, &map, 3, vec![1.0, -1.0, 0.5], 2).unwrap();
        assert_eq!(trajectory.state(0), &[1.0, 0.0]);

        let context = oracle.make_context().unwrap();
        let mut executor =
            RolloutExecutor::new(context, oracle.dimensions(), &trajectory, &variant, &map, 2);
        let mut delta = vec![1.0; layout.state_dim()];
        for step in 0..3 {
            executor.rollout(step, &[0.0, 0.0, 0.0], &mut delta);
            assert!(delta.iter().all(|d| d.abs() < 1e-12), "step {step}: {delta:?}");
        }
        let stats = executor.stats();
        assert_eq!(stats.rollouts, 3);
        assert_eq!(stats.sim_steps, 6);
    }

    #[test]
    fn control_perturbation_propagates_through_substeps() {
        // x' = 0.9 x + 0.5 u per micro-step, applied twice with u held.
        let oracle = AffineOracle::scalar(0.9, 0.5);
        let layout = StateLayout::new(1, 0, 1);
        let variant = ModelVariant::identity();
        let map = variant.state_map(&layout, oracle.dimensions()).unwrap();
        let trajectory =
            simulate_nominal(&oracle, layout, &variant, &map, 1, vec![1.0], 2).unwrap();

        let context = oracle.make_context().unwrap();
        let mut executor =
            RolloutExecutor::new(context, oracle.dimensions(), &trajectory, &variant, &map, 2);
        let mut delta = vec![0.0; 2];
        executor.rollout(0, &[0.1, 0.0, 0.2], &mut delta);
        let expected = 0.9 * 0.9 * 0.1 + (0.9 + 1.0) * 0.5 * 0.2;
        assert!((delta[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn dependent_coordinates_are_resolved_before_stepping() {
        let oracle = AffineOracle::hold(4, 4, 1);
        let layout = StateLayout::new(4, 0, 1);
        let registry = VariantRegistry::builtin();
        let variant = registry.get("mirrored_linkage").unwrap();
        let map = variant.state_map(&layout, oracle.dimensions()).unwrap();
        let states = vec![0.0; 2 * layout.state_dim()];
        let trajectory = NominalTrajectory::new(layout, 1, states, vec![0.0]).unwrap();

        let context = oracle.make_context().unwrap();
        let mut executor =
            RolloutExecutor::new(context, oracle.dimensions(), &trajectory, variant, &map, 1);
        let mut perturbation = vec![0.0; layout.input_dim()];
        perturbation[1] = 0.4;
        perturbation[2] = 5.0;
        perturbation[3] = 5.0;
        let mut delta = vec![0.0; layout.state_dim()];
        executor.rollout(0, &perturbation, &mut delta);
        let expected = [0.0, 0.4, -0.4, 0.4];
        for (got, want) in delta[..4].iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "{delta:?}");
        }
    }

    #[test]
    fn preroll_settles_unmapped_coordinates() {
        // Simulator coordinate 1 follows coordinate 0 but is not part of the reduced state.
        let oracle = AffineOracle::follower_chain(0.5);
        let layout = StateLayout::new(1, 0, 0);
        let plain = ModelVariant::new(50, "settling", |_, _| {}).with_coordinate_map(&[0], &[0]);
        let settling = plain.clone().with_preroll(30);
        let map = settling.state_map(&layout, oracle.dimensions()).unwrap();
        let trajectory =
            NominalTrajectory::new(layout, 1, vec![0.0, 0.0, 0.0, 0.0], vec![]).unwrap();
        let mut delta = vec![0.0; 2];

        let context = oracle.make_context().unwrap();
        let mut executor =
            RolloutExecutor::new(context, oracle.dimensions(), &trajectory, &settling, &map, 1);
        executor.rollout(0, &[1.0, 0.0], &mut delta);
        let follower = executor.context().positions()[1];
        assert!((follower - 1.0).abs() < 1e-3, "follower {follower}");
        assert_eq!(executor.stats().sim_steps, 31);

        let context = oracle.make_context().unwrap();
        let mut executor =
            RolloutExecutor::new(context, oracle.dimensions(), &trajectory, &plain, &map, 1);
        executor.rollout(0, &[1.0, 0.0], &mut delta);
        assert!((executor.context().positions()[1] - 0.5).abs() < 1e-12);
        assert_eq!(executor.stats().sim_steps, 1);
    }
}

use crate::error::Result;

/// Represents a dynamical system (Flow or Map) evaluated in `f64`.
pub trait DynamicalSystem {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field (flow) or map function.
    /// x: current state
    /// t: current time
    /// out: buffer to write the result (dx/dt or x_{n+1})
    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]);
}

/// A solver that advances a [`DynamicalSystem`] by one fixed step.
pub trait Steppable {
    fn step(&mut self, system: &impl DynamicalSystem, t: &mut f64, state: &mut [f64], dt: f64);
}

/// Sizes of the simulator-side vectors (generalized positions, velocities, controls).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimDimensions {
    pub positions: usize,
    pub velocities: usize,
    pub controls: usize,
}

/// Per-context counters reported after a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContactDiagnostics {
    pub contacts: usize,
    pub constraints: usize,
}

/// One independent, steppable simulator instance.
///
/// Contexts are never shared between threads; each worker allocates its own through
/// [`SimulationOracle::make_context`].
pub trait SimContext {
    /// Advances one fixed micro-timestep.
    fn step(&mut self);

    /// Copies the current state into the provided buffers.
    fn read_state(&self, positions: &mut [f64], velocities: &mut [f64]);

    /// Overwrites the full state and the applied controls.
    fn write_state(&mut self, positions: &[f64], velocities: &[f64], controls: &[f64]);

    /// Contact and constraint counts of the most recent step.
    fn diagnostics(&self) -> ContactDiagnostics;
}

/// A loaded model that can hand out simulation contexts.
///
/// The oracle itself is shared read-only across workers, hence `Sync`.
pub trait SimulationOracle: Sync {
    type Context: SimContext;

    fn dimensions(&self) -> SimDimensions;

    /// Length of one micro-step in seconds.
    fn timestep(&self) -> f64;

    fn make_context(&self) -> Result<Self::Context>;
}

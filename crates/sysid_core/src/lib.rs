//! Monte Carlo linearization of black-box dynamics along a nominal trajectory.
//!
//! At every step of the trajectory the engine perturbs the nominal state and control,
//! rolls each perturbation one control interval forward through a simulation oracle, and
//! fits a local transition matrix by least squares. A separate pass then scores the fitted
//! matrices against fresh perturbations.
//!
//! Key components:
//! - **Traits**: `SimulationOracle` / `SimContext` (the stepping oracle), `DynamicalSystem`
//!   and `Steppable` (the equation-backed reference oracle).
//! - **Fitting**: `sampler`, `rollout`, `regression`, `scheduler`.
//! - **Validation**: `validation`.
//! - **I/O**: `source` (trajectory files), `report` (the transition report).
//! - **Models**: `model` (equation engine + fixed-step solvers), `variant` (dependent
//!   coordinates, unit-norm blocks, coordinate maps).
pub mod config;
pub mod engine;
pub mod equation_engine;
pub mod error;
pub mod model;
pub mod regression;
pub mod report;
pub mod rollout;
pub mod sampler;
pub mod scheduler;
pub mod solvers;
pub mod source;
pub mod trajectory;
pub mod traits;
pub mod validation;
pub mod variant;

#[cfg(test)]
mod testing;

pub use error::{FailureClass, Result, SysIdError};

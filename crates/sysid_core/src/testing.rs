//! Deterministic linear oracles for tests.

use nalgebra::{DMatrix, DVector};

use crate::error::Result;
use crate::traits::{ContactDiagnostics, SimContext, SimDimensions, SimulationOracle};

/// Oracle whose micro-step is `s' = A s + B u` over `s = [positions | velocities]`.
#[derive(Debug, Clone)]
pub(crate) struct AffineOracle {
    dims: SimDimensions,
    transition: DMatrix<f64>,
    control: DMatrix<f64>,
    initial: DVector<f64>,
    timestep: f64,
    contacts: usize,
}

impl AffineOracle {
    pub fn new(
        positions: usize,
        velocities: usize,
        transition: DMatrix<f64>,
        control: DMatrix<f64>,
    ) -> Self {
        let n = positions + velocities;
        assert_eq!(transition.shape(), (n, n));
        assert_eq!(control.nrows(), n);
        Self {
            dims: SimDimensions {
                positions,
                velocities,
                controls: control.ncols(),
            },
            transition,
            control,
            initial: DVector::zeros(n),
            timestep: 0.01,
            contacts: 0,
        }
    }

    /// One position and one velocity: `x' = a x + b u`, `v' = a v`. Starts at `x = 1`.
    pub fn scalar(a: f64, b: f64) -> Self {
        let transition = DMatrix::from_diagonal_element(2, 2, a);
        let control = DMatrix::from_column_slice(2, 1, &[b, 0.0]);
        Self::new(1, 1, transition, control).with_initial(&[1.0, 0.0])
    }

    /// State is held unchanged; controls have no effect.
    pub fn hold(positions: usize, velocities: usize, controls: usize) -> Self {
        let n = positions + velocities;
        Self::new(
            positions,
            velocities,
            DMatrix::identity(n, n),
            DMatrix::zeros(n, controls),
        )
    }

    /// Two positions where the second relaxes toward the first at `rate` per step.
    pub fn follower_chain(rate: f64) -> Self {
        let mut transition = DMatrix::identity(4, 4);
        transition[(1, 0)] = rate;
        transition[(1, 1)] = 1.0 - rate;
        Self::new(2, 2, transition, DMatrix::zeros(4, 0))
    }

    /// One position and one velocity that both become `gain · u`, whatever the state.
    pub fn control_gain(gain: f64) -> Self {
        Self::new(
            1,
            1,
            DMatrix::zeros(2, 2),
            DMatrix::from_element(2, 1, gain),
        )
    }

    pub fn with_initial(mut self, state: &[f64]) -> Self {
        self.initial = DVector::from_column_slice(state);
        self
    }

    pub fn with_timestep(mut self, timestep: f64) -> Self {
        self.timestep = timestep;
        self
    }

    pub fn with_contacts(mut self, contacts: usize) -> Self {
        self.contacts = contacts;
        self
    }
}

impl SimulationOracle for AffineOracle {
    type Context = AffineContext;

    fn dimensions(&self) -> SimDimensions {
        self.dims
    }

    fn timestep(&self) -> f64 {
        self.timestep
    }

    fn make_context(&self) -> Result<AffineContext> {
        Ok(AffineContext {
            positions: self.dims.positions,
            transition: self.transition.clone(),
            control: self.control.clone(),
            state: self.initial.clone(),
            input: DVector::zeros(self.dims.controls),
            contacts: self.contacts,
        })
    }
}

pub(crate) struct AffineContext {
    positions: usize,
    transition: DMatrix<f64>,
    control: DMatrix<f64>,
    state: DVector<f64>,
    input: DVector<f64>,
    contacts: usize,
}

impl AffineContext {
    pub fn positions(&self) -> &[f64] {
        &self.state.as_slice()[..self.positions]
    }
}

impl SimContext for AffineContext {
    fn step(&mut self) {
        self.state = &self.transition * &self.state + &self.control * &self.input;
    }

    fn read_state(&self, positions: &mut [f64], velocities: &mut [f64]) {
        let (q, v) = self.state.as_slice().split_at(self.positions);
        positions.copy_from_slice(q);
        velocities.copy_from_slice(v);
    }

    fn write_state(&mut self, positions: &[f64], velocities: &[f64], controls: &[f64]) {
        let (q, v) = self.state.as_mut_slice().split_at_mut(self.positions);
        q.copy_from_slice(positions);
        v.copy_from_slice(velocities);
        self.input.as_mut_slice().copy_from_slice(controls);
    }

    fn diagnostics(&self) -> ContactDiagnostics {
        ContactDiagnostics {
            contacts: self.contacts,
            constraints: 0,
        }
    }
}

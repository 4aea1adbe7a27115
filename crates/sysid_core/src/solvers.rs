use serde::{Deserialize, Serialize};

use crate::traits::{DynamicalSystem, Steppable};

/// Explicit (forward) Euler.
pub struct Euler {
    rate: Vec<f64>,
}

impl Euler {
    pub fn new(dim: usize) -> Self {
        Self {
            rate: vec![0.0; dim],
        }
    }
}

impl Steppable for Euler {
    fn step(&mut self, system: &impl DynamicalSystem, t: &mut f64, state: &mut [f64], dt: f64) {
        system.apply(*t, state, &mut self.rate);
        for (x, dx) in state.iter_mut().zip(&self.rate) {
            *x += dt * dx;
        }
        *t += dt;
    }
}

/// Classic Runge-Kutta 4th Order Solver
pub struct Rk4 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    stage: Vec<f64>,
}

impl Rk4 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            stage: vec![0.0; dim],
        }
    }

    fn offset(stage: &mut [f64], state: &[f64], slope: &[f64], h: f64) {
        for ((p, x), k) in stage.iter_mut().zip(state).zip(slope) {
            *p = x + h * k;
        }
    }
}

impl Steppable for Rk4 {
    fn step(&mut self, system: &impl DynamicalSystem, t: &mut f64, state: &mut [f64], dt: f64) {
        let t0 = *t;
        let half = 0.5 * dt;

        system.apply(t0, state, &mut self.k1);
        Self::offset(&mut self.stage, state, &self.k1, half);
        system.apply(t0 + half, &self.stage, &mut self.k2);
        Self::offset(&mut self.stage, state, &self.k2, half);
        system.apply(t0 + half, &self.stage, &mut self.k3);
        Self::offset(&mut self.stage, state, &self.k3, dt);
        system.apply(t0 + dt, &self.stage, &mut self.k4);

        for i in 0..state.len() {
            state[i] += dt / 6.0 * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
    }
}

/// Discrete Map Stepper
/// Evaluates x_{n+1} = f(x_n); `t` advances by `dt` so iteration count and time stay in sync.
pub struct DiscreteMap {
    next: Vec<f64>,
}

impl DiscreteMap {
    pub fn new(dim: usize) -> Self {
        Self {
            next: vec![0.0; dim],
        }
    }
}

impl Steppable for DiscreteMap {
    fn step(&mut self, system: &impl DynamicalSystem, t: &mut f64, state: &mut [f64], dt: f64) {
        system.apply(*t, state, &mut self.next);
        state.copy_from_slice(&self.next);
        *t += dt;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemKind {
    Flow,
    Map,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Integrator {
    Euler,
    #[default]
    Rk4,
}

/// Stepper selected at model load time.
pub enum Stepper {
    Euler(Euler),
    Rk4(Rk4),
    Discrete(DiscreteMap),
}

impl Stepper {
    /// Maps ignore the integrator choice.
    pub fn build(kind: SystemKind, integrator: Integrator, dim: usize) -> Self {
        match (kind, integrator) {
            (SystemKind::Map, _) => Stepper::Discrete(DiscreteMap::new(dim)),
            (SystemKind::Flow, Integrator::Euler) => Stepper::Euler(Euler::new(dim)),
            (SystemKind::Flow, Integrator::Rk4) => Stepper::Rk4(Rk4::new(dim)),
        }
    }

    pub fn step(
        &mut self,
        system: &impl DynamicalSystem,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) {
        match self {
            Stepper::Euler(s) => s.step(system, t, state, dt),
            Stepper::Rk4(s) => s.step(system, t, state, dt),
            Stepper::Discrete(s) => s.step(system, t, state, dt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Integrator, Stepper, SystemKind};
    use crate::traits::DynamicalSystem;

    struct Decay {
        rate: f64,
    }

    impl DynamicalSystem for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = self.rate * x[0];
        }
    }

    fn integrate(kind: SystemKind, integrator: Integrator, steps: usize, dt: f64) -> (f64, f64) {
        let system = Decay { rate: -1.0 };
        let mut stepper = Stepper::build(kind, integrator, 1);
        let mut t = 0.0;
        let mut state = [1.0];
        for _ in 0..steps {
            stepper.step(&system, &mut t, &mut state, dt);
        }
        (t, state[0])
    }

    #[test]
    fn rk4_matches_exponential_decay() {
        let (t, x) = integrate(SystemKind::Flow, Integrator::Rk4, 100, 0.01);
        assert!((t - 1.0).abs() < 1e-12);
        assert!((x - (-1.0_f64).exp()).abs() < 1e-9);
    }

    #[test]
    fn euler_is_first_order_accurate() {
        let (_, x) = integrate(SystemKind::Flow, Integrator::Euler, 1000, 0.001);
        assert!((x - (-1.0_f64).exp()).abs() < 1e-3);
        assert!((x - (-1.0_f64).exp()).abs() > 1e-6);
    }

    #[test]
    fn map_kind_iterates_the_update() {
        let (t, x) = integrate(SystemKind::Map, Integrator::Rk4, 3, 1.0);
        assert_eq!(t, 3.0);
        assert_eq!(x, -1.0);
    }
}

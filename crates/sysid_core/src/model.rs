//! Equation-backed simulation oracle.
//!
//! A [`ModelDescriptor`] names the position, velocity and control symbols, constant
//! parameters, and one expression per state coordinate. For a `flow` the expressions are
//! time derivatives integrated with the chosen fixed-step integrator; for a `map` they are
//! the next state. Controls are held constant across a step.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::equation_engine::{Bytecode, Compiler, EquationSystem};
use crate::error::{Result, SysIdError};
use crate::solvers::{Integrator, Stepper, SystemKind};
use crate::traits::{ContactDiagnostics, SimContext, SimDimensions, SimulationOracle};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub kind: SystemKind,
    #[serde(default)]
    pub integrator: Integrator,
    /// Micro-step length in seconds.
    pub timestep: f64,
    pub positions: Vec<String>,
    pub velocities: Vec<String>,
    #[serde(default)]
    pub controls: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
    /// Positions first, then velocities.
    pub equations: Vec<String>,
    /// Keyframe every context starts from; zeros when absent.
    #[serde(default)]
    pub initial_positions: Option<Vec<f64>>,
    #[serde(default)]
    pub initial_velocities: Option<Vec<f64>>,
}

/// A compiled [`ModelDescriptor`]. Shared read-only; contexts own their own evaluator.
#[derive(Debug, Clone)]
pub struct EquationModel {
    name: String,
    kind: SystemKind,
    integrator: Integrator,
    timestep: f64,
    dims: SimDimensions,
    equations: Vec<Bytecode>,
    constants: Vec<f64>,
    initial_state: Vec<f64>,
}

impl EquationModel {
    pub fn name(&self) -> &str {
        &self.name
    }
}

pub fn load_model(descriptor: &ModelDescriptor) -> Result<EquationModel> {
    if !descriptor.timestep.is_finite() || descriptor.timestep <= 0.0 {
        return Err(SysIdError::ModelLoad(format!(
            "{}: timestep must be positive.",
            descriptor.name
        )));
    }
    let dims = SimDimensions {
        positions: descriptor.positions.len(),
        velocities: descriptor.velocities.len(),
        controls: descriptor.controls.len(),
    };
    let state_dim = dims.positions + dims.velocities;
    if descriptor.equations.len() != state_dim {
        return Err(SysIdError::ModelLoad(format!(
            "{}: {} equations given for {} state coordinates.",
            descriptor.name,
            descriptor.equations.len(),
            state_dim
        )));
    }

    let var_names: Vec<String> = descriptor
        .positions
        .iter()
        .chain(&descriptor.velocities)
        .cloned()
        .collect();
    let param_names: Vec<String> = descriptor
        .controls
        .iter()
        .chain(descriptor.parameters.keys())
        .cloned()
        .collect();
    let mut seen = HashSet::new();
    if let Some(duplicate) = var_names
        .iter()
        .chain(&param_names)
        .find(|name| !seen.insert(name.as_str()))
    {
        return Err(SysIdError::ModelLoad(format!(
            "{}: symbol {duplicate:?} is declared twice.",
            descriptor.name
        )));
    }

    let compiler = Compiler::new(&var_names, &param_names);
    let equations = descriptor
        .equations
        .iter()
        .map(|source| compiler.compile_str(source))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut initial_state = vec![0.0; state_dim];
    if let Some(q) = &descriptor.initial_positions {
        check_keyframe("initial_positions", q, dims.positions)?;
        initial_state[..dims.positions].copy_from_slice(q);
    }
    if let Some(v) = &descriptor.initial_velocities {
        check_keyframe("initial_velocities", v, dims.velocities)?;
        initial_state[dims.positions..].copy_from_slice(v);
    }

    Ok(EquationModel {
        name: descriptor.name.clone(),
        kind: descriptor.kind,
        integrator: descriptor.integrator,
        timestep: descriptor.timestep,
        dims,
        equations,
        constants: descriptor.parameters.values().copied().collect(),
        initial_state,
    })
}

fn check_keyframe(what: &'static str, values: &[f64], expected: usize) -> Result<()> {
    if values.len() != expected {
        return Err(SysIdError::DimensionMismatch {
            what,
            expected,
            got: values.len(),
        });
    }
    Ok(())
}

impl SimulationOracle for EquationModel {
    type Context = EquationContext;

    fn dimensions(&self) -> SimDimensions {
        self.dims
    }

    fn timestep(&self) -> f64 {
        self.timestep
    }

    fn make_context(&self) -> Result<EquationContext> {
        let params = vec![0.0; self.dims.controls]
            .into_iter()
            .chain(self.constants.iter().copied())
            .collect();
        Ok(EquationContext {
            system: EquationSystem::new(self.equations.clone(), params),
            stepper: Stepper::build(self.kind, self.integrator, self.initial_state.len()),
            state: self.initial_state.clone(),
            positions: self.dims.positions,
            controls: self.dims.controls,
            time: 0.0,
            timestep: self.timestep,
        })
    }
}

pub struct EquationContext {
    system: EquationSystem,
    stepper: Stepper,
    state: Vec<f64>,
    positions: usize,
    controls: usize,
    time: f64,
    timestep: f64,
}

impl EquationContext {
    pub fn time(&self) -> f64 {
        self.time
    }
}

impl SimContext for EquationContext {
    fn step(&mut self) {
        self.stepper.step(&self.system, &mut self.time, &mut self.state, self.timestep);
    }

    fn read_state(&self, positions: &mut [f64], velocities: &mut [f64]) {
        let (q, v) = self.state.split_at(self.positions);
        positions.copy_from_slice(q);
        velocities.copy_from_slice(v);
    }

    fn write_state(&mut self, positions: &[f64], velocities: &[f64], controls: &[f64]) {
        let (q, v) = self.state.split_at_mut(self.positions);
        q.copy_from_slice(positions);
        v.copy_from_slice(velocities);
        self.system.params[..self.controls].copy_from_slice(controls);
    }

    fn diagnostics(&self) -> ContactDiagnostics {
        ContactDiagnostics::default()
    }
}

//! Nominal trajectory and fitted transition matrices.
//!
//! Both are plain data. The only mutable access to the transition matrices during fitting
//! goes through [`StepBlock`]s, which are disjoint sub-slices handed out once per worker.

use std::ops::Range;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SysIdError};

/// Block sizes of the reduced state `[positions | velocities]` and of the control vector.
///
/// Positions hold `dof` ordinary coordinates plus one extra slot per unit-norm block
/// (a 4-wide orientation spends 4 slots for 3 degrees of freedom).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateLayout {
    pub dof: usize,
    pub quaternions: usize,
    pub actuators: usize,
}

impl StateLayout {
    pub fn new(dof: usize, quaternions: usize, actuators: usize) -> Self {
        Self {
            dof,
            quaternions,
            actuators,
        }
    }

    pub fn position_dim(&self) -> usize {
        self.dof + self.quaternions
    }

    pub fn velocity_dim(&self) -> usize {
        self.dof
    }

    /// Also the row count of every transition matrix.
    pub fn state_dim(&self) -> usize {
        2 * self.dof + self.quaternions
    }

    /// Column count of every transition matrix: state followed by controls.
    pub fn input_dim(&self) -> usize {
        self.state_dim() + self.actuators
    }
}

#[derive(Debug, Clone)]
pub struct NominalTrajectory {
    layout: StateLayout,
    steps: usize,
    // Row-major: state k occupies states[k * state_dim..(k + 1) * state_dim].
    states: Vec<f64>,
    controls: Vec<f64>,
}

impl NominalTrajectory {
    /// `states` must hold `steps + 1` states and `controls` exactly `steps` control vectors,
    /// both flattened step-major.
    pub fn new(
        layout: StateLayout,
        steps: usize,
        states: Vec<f64>,
        controls: Vec<f64>,
    ) -> Result<Self> {
        if steps == 0 {
            return Err(SysIdError::MissingData(
                "the trajectory must contain at least one step".to_string(),
            ));
        }
        let expected_states = (steps + 1) * layout.state_dim();
        if states.len() != expected_states {
            return Err(SysIdError::MissingData(format!(
                "expected {} nominal state values ({} states of width {}), got {}",
                expected_states,
                steps + 1,
                layout.state_dim(),
                states.len()
            )));
        }
        let expected_controls = steps * layout.actuators;
        if controls.len() != expected_controls {
            return Err(SysIdError::MissingData(format!(
                "expected {} nominal control values ({} steps of width {}), got {}",
                expected_controls,
                steps,
                layout.actuators,
                controls.len()
            )));
        }
        Ok(Self {
            layout,
            steps,
            states,
            controls,
        })
    }

    pub fn layout(&self) -> StateLayout {
        self.layout
    }

    /// Number of control intervals (`stepnum`).
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Valid for `step` in `0..=steps`.
    pub fn state(&self, step: usize) -> &[f64] {
        let width = self.layout.state_dim();
        &self.states[step * width..(step + 1) * width]
    }

    /// Valid for `step` in `0..steps`.
    pub fn control(&self, step: usize) -> &[f64] {
        let width = self.layout.actuators;
        &self.controls[step * width..(step + 1) * width]
    }

    /// Largest absolute nominal control; scales every perturbation.
    pub fn ctrl_max(&self) -> f64 {
        self.controls.iter().fold(0.0, |acc: f64, c| acc.max(c.abs()))
    }
}

/// One fitted matrix per trajectory step, `state_dim × input_dim` each.
#[derive(Debug, Clone)]
pub struct TransitionSet {
    layout: StateLayout,
    matrices: Vec<DMatrix<f64>>,
}

impl TransitionSet {
    pub fn zeros(layout: StateLayout, steps: usize) -> Self {
        let matrices = (0..steps)
            .map(|_| DMatrix::zeros(layout.state_dim(), layout.input_dim()))
            .collect();
        Self { layout, matrices }
    }

    pub fn from_matrices(layout: StateLayout, matrices: Vec<DMatrix<f64>>) -> Result<Self> {
        for matrix in &matrices {
            check_shape(&layout, matrix)?;
        }
        Ok(Self { layout, matrices })
    }

    pub fn layout(&self) -> StateLayout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.matrices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrices.is_empty()
    }

    pub fn get(&self, step: usize) -> Option<&DMatrix<f64>> {
        self.matrices.get(step)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DMatrix<f64>> {
        self.matrices.iter()
    }

    /// Splits the set into one writable block per range.
    ///
    /// The ranges must be ascending, contiguous and cover every step exactly once.
    pub fn blocks_mut(&mut self, ranges: &[Range<usize>]) -> Result<Vec<StepBlock<'_>>> {
        let total = self.matrices.len();
        let mut blocks = Vec::with_capacity(ranges.len());
        let mut rest: &mut [DMatrix<f64>] = &mut self.matrices;
        let mut cursor = 0;
        for range in ranges {
            if range.start != cursor || range.end < range.start || range.len() > rest.len() {
                return Err(SysIdError::config(format!(
                    "step blocks must tile 0..{} contiguously; got {:?} at step {}",
                    total, range, cursor
                )));
            }
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(range.len());
            blocks.push(StepBlock {
                start: range.start,
                slots: head,
            });
            rest = tail;
            cursor = range.end;
        }
        if !rest.is_empty() {
            return Err(SysIdError::config(format!(
                "step blocks leave {} step(s) unassigned",
                rest.len()
            )));
        }
        Ok(blocks)
    }
}

/// Exclusive write access to a contiguous run of steps.
#[derive(Debug)]
pub struct StepBlock<'a> {
    start: usize,
    slots: &'a mut [DMatrix<f64>],
}

impl StepBlock<'_> {
    pub fn steps(&self) -> Range<usize> {
        self.start..self.start + self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn set(&mut self, step: usize, matrix: DMatrix<f64>) -> Result<()> {
        let range = self.steps();
        let slot = step
            .checked_sub(self.start)
            .and_then(|offset| self.slots.get_mut(offset))
            .ok_or(SysIdError::StepOutsideBlock {
                step,
                start: range.start,
                end: range.end,
            })?;
        check_dims(slot.nrows(), slot.ncols(), &matrix)?;
        *slot = matrix;
        Ok(())
    }
}

fn check_shape(layout: &StateLayout, matrix: &DMatrix<f64>) -> Result<()> {
    check_dims(layout.state_dim(), layout.input_dim(), matrix)
}

fn check_dims(rows: usize, cols: usize, matrix: &DMatrix<f64>) -> Result<()> {
    if matrix.nrows() != rows {
        return Err(SysIdError::DimensionMismatch {
            what: "transition matrix row",
            expected: rows,
            got: matrix.nrows(),
        });
    }
    if matrix.ncols() != cols {
        return Err(SysIdError::DimensionMismatch {
            what: "transition matrix column",
            expected: cols,
            got: matrix.ncols(),
        });
    }
    Ok(())
}

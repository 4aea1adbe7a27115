//! Model variants: dependent-coordinate rules, unit-norm blocks and settling pre-rolls.
//!
//! A variant is a small bundle of data plus one pure function that overwrites dependent
//! simulator coordinates from independent ones. Adding a model means registering a new
//! [`ModelVariant`]; nothing in the rollout path branches on variant identity.

use std::fmt;

use tracing::warn;

use crate::error::{Result, SysIdError};
use crate::trajectory::StateLayout;
use crate::traits::SimDimensions;

/// Overwrites dependent entries of the simulator position and velocity vectors.
pub type ResolveFn = fn(&mut [f64], &mut [f64]);

/// Number of pre-roll iterations used by models with a settling holonomic constraint.
pub const SETTLING_ITERATIONS: usize = 30;

/// Places reduced coordinates into simulator vectors when they are not a prefix of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinateMap {
    pub positions: Vec<usize>,
    pub velocities: Vec<usize>,
}

#[derive(Clone)]
pub struct ModelVariant {
    pub id: u32,
    pub name: String,
    pub resolve: ResolveFn,
    /// Iterations stepped under zero velocity and control before each rollout.
    pub preroll: Option<usize>,
    /// Offsets of 4-wide unit-norm blocks within the reduced position block.
    pub quaternion_offsets: Vec<usize>,
    /// Absolute standard deviation for unit-norm blocks during validation.
    pub validation_quaternion_noise: f64,
    pub coordinate_map: Option<CoordinateMap>,
    /// Smallest simulator position/velocity vectors `resolve` may index into.
    pub required_positions: usize,
    pub required_velocities: usize,
}

impl fmt::Debug for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelVariant")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("preroll", &self.preroll)
            .field("quaternion_offsets", &self.quaternion_offsets)
            .field("coordinate_map", &self.coordinate_map)
            .finish_non_exhaustive()
    }
}

fn no_dependents(_positions: &mut [f64], _velocities: &mut [f64]) {}

fn mirrored_linkage(positions: &mut [f64], velocities: &mut [f64]) {
    for v in [positions, velocities] {
        v[2] = -v[1];
        v[3] = v[1];
    }
}

fn finger_linkage(positions: &mut [f64], velocities: &mut [f64]) {
    for v in [positions, velocities] {
        v[14] = v[0] + v[1];
        v[15] = -v[1];
        v[16] = v[1] + v[3] + v[4];
        v[17] = -v[4];
        v[18] = v[4] + v[6] + v[7];
        v[19] = -v[7];
        v[20] = v[7] + v[9] + v[10];
        v[21] = -v[10];
    }
}

impl ModelVariant {
    pub fn new(id: u32, name: impl Into<String>, resolve: ResolveFn) -> Self {
        Self {
            id,
            name: name.into(),
            resolve,
            preroll: None,
            quaternion_offsets: Vec::new(),
            validation_quaternion_noise: 0.0,
            coordinate_map: None,
            required_positions: 0,
            required_velocities: 0,
        }
    }

    pub fn identity() -> Self {
        Self::new(0, "identity", no_dependents)
    }

    pub fn with_preroll(mut self, iterations: usize) -> Self {
        self.preroll = Some(iterations);
        self
    }

    pub fn with_quaternions(mut self, offsets: &[usize], validation_noise: f64) -> Self {
        self.quaternion_offsets = offsets.to_vec();
        self.validation_quaternion_noise = validation_noise;
        self
    }

    pub fn with_coordinate_map(mut self, positions: &[usize], velocities: &[usize]) -> Self {
        self.coordinate_map = Some(CoordinateMap {
            positions: positions.to_vec(),
            velocities: velocities.to_vec(),
        });
        self
    }

    pub fn requiring(mut self, positions: usize, velocities: usize) -> Self {
        self.required_positions = positions;
        self.required_velocities = velocities;
        self
    }

    /// Applies the dependent-coordinate rule in place.
    pub fn resolve(&self, positions: &mut [f64], velocities: &mut [f64]) {
        (self.resolve)(positions, velocities);
    }

    /// Checks the variant against the reduced layout and the simulator, and builds the
    /// reduced-to-simulator index map used by every rollout.
    pub fn state_map(&self, layout: &StateLayout, sim: SimDimensions) -> Result<StateMap> {
        if sim.controls != layout.actuators {
            return Err(SysIdError::DimensionMismatch {
                what: "control vector",
                expected: layout.actuators,
                got: sim.controls,
            });
        }
        if sim.positions < self.required_positions || sim.velocities < self.required_velocities
        {
            return Err(SysIdError::config(format!(
                "model variant '{}' needs at least {} positions and {} velocities, \
                 the simulator has {} and {}.",
                self.name,
                self.required_positions,
                self.required_velocities,
                sim.positions,
                sim.velocities
            )));
        }
        for &offset in &self.quaternion_offsets {
            if offset + 4 > layout.position_dim() {
                return Err(SysIdError::config(format!(
                    "model variant '{}' places a unit-norm block at {} but the position \
                     block has only {} entries.",
                    self.name,
                    offset,
                    layout.position_dim()
                )));
            }
        }
        if self.quaternion_offsets.len() != layout.quaternions {
            warn!(
                variant = %self.name,
                declared = layout.quaternions,
                renormalized = self.quaternion_offsets.len(),
                "quaternion count differs from the variant's unit-norm blocks"
            );
        }

        let (positions, velocities) = match &self.coordinate_map {
            Some(map) => {
                if map.positions.len() != layout.position_dim() {
                    return Err(SysIdError::DimensionMismatch {
                        what: "mapped position block",
                        expected: map.positions.len(),
                        got: layout.position_dim(),
                    });
                }
                if map.velocities.len() != layout.velocity_dim() {
                    return Err(SysIdError::DimensionMismatch {
                        what: "mapped velocity block",
                        expected: map.velocities.len(),
                        got: layout.velocity_dim(),
                    });
                }
                (map.positions.clone(), map.velocities.clone())
            }
            None => (
                (0..layout.position_dim()).collect(),
                (0..layout.velocity_dim()).collect(),
            ),
        };
        if let Some(&idx) = positions.iter().find(|&&idx| idx >= sim.positions) {
            return Err(SysIdError::config(format!(
                "reduced position maps to simulator index {idx}, but the simulator has {} \
                 positions.",
                sim.positions
            )));
        }
        if let Some(&idx) = velocities.iter().find(|&&idx| idx >= sim.velocities) {
            return Err(SysIdError::config(format!(
                "reduced velocity maps to simulator index {idx}, but the simulator has {} \
                 velocities.",
                sim.velocities
            )));
        }
        Ok(StateMap {
            positions,
            velocities,
        })
    }
}

/// Reduced-to-simulator index map for positions and velocities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMap {
    positions: Vec<usize>,
    velocities: Vec<usize>,
}

impl StateMap {
    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    pub fn velocities(&self) -> &[usize] {
        &self.velocities
    }
}

/// Lookup table of known variants, keyed by name or numeric id.
#[derive(Debug, Clone)]
pub struct VariantRegistry {
    variants: Vec<ModelVariant>,
}

impl Default for VariantRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl VariantRegistry {
    /// Registry holding only the identity variant.
    pub fn empty() -> Self {
        Self {
            variants: vec![ModelVariant::identity()],
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        let builtins = [
            ModelVariant::new(4, "mirrored_linkage", mirrored_linkage).requiring(4, 4),
            ModelVariant::new(9, "finger_linkage", finger_linkage).requiring(22, 22),
            ModelVariant::new(10, "floating_base", no_dependents).with_quaternions(&[3], 0.0005),
            ModelVariant::new(11, "ball_chain", no_dependents)
                .with_quaternions(&[0, 4, 8], 0.0005)
                .with_coordinate_map(
                    &[0, 1, 2, 3, 8, 9, 10, 11, 16, 17, 18, 19],
                    &[0, 1, 2, 6, 7, 8, 12, 13, 14],
                )
                .with_preroll(SETTLING_ITERATIONS),
            ModelVariant::new(12, "free_orientation", no_dependents)
                .with_quaternions(&[0], 0.0001),
        ];
        registry.variants.extend(builtins);
        registry
    }

    pub fn register(&mut self, variant: ModelVariant) -> Result<()> {
        if let Some(existing) = self
            .variants
            .iter()
            .find(|v| v.id == variant.id || v.name == variant.name)
        {
            return Err(SysIdError::config(format!(
                "model variant '{}' (id {}) clashes with registered variant '{}' (id {}).",
                variant.name, variant.id, existing.name, existing.id
            )));
        }
        self.variants.push(variant);
        Ok(())
    }

    /// Finds a variant by name or by decimal id.
    pub fn get(&self, key: &str) -> Option<&ModelVariant> {
        let key = key.trim();
        let id = key.parse::<u32>().ok();
        self.variants
            .iter()
            .find(|v| v.name == key || Some(v.id) == id)
    }

    /// Like [`get`](Self::get), falling back to the identity variant for unknown keys.
    pub fn lookup(&self, key: &str) -> &ModelVariant {
        match self.get(key) {
            Some(variant) => variant,
            None => {
                warn!(key, "unknown model variant; dependent coordinates are left untouched");
                &self.variants[0]
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelVariant> {
        self.variants.iter()
    }
}

use nalgebra::Vector4;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::trajectory::StateLayout;

/// Standard deviation of ordinary perturbation components.
pub fn noise_scale(noise_coefficient: f64, ctrl_max: f64) -> f64 {
    noise_coefficient * ctrl_max
}

/// Draws input perturbations `[Δpositions | Δvelocities | Δcontrols]` around a nominal state.
pub struct PerturbationSampler<'a> {
    layout: StateLayout,
    quaternion_offsets: &'a [usize],
}

impl<'a> PerturbationSampler<'a> {
    pub fn new(layout: StateLayout, quaternion_offsets: &'a [usize]) -> Self {
        Self {
            layout,
            quaternion_offsets,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.layout.input_dim()
    }

    /// Fills `out` with one perturbation.
    ///
    /// Every component gets `sigma · N(0, 1)`. Each unit-norm block is then redrawn: noise
    /// with deviation `quaternion_sigma` is added to the nominal block, the sum is
    /// renormalized, and the difference to the nominal block is stored, so the perturbed
    /// block stays on the unit sphere.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        sigma: f64,
        quaternion_sigma: f64,
        nominal_state: &[f64],
        out: &mut [f64],
    ) {
        debug_assert_eq!(out.len(), self.input_dim());
        for value in out.iter_mut() {
            let z: f64 = StandardNormal.sample(rng);
            *value = sigma * z;
        }

        for &offset in self.quaternion_offsets {
            let reference = Vector4::from_column_slice(&nominal_state[offset..offset + 4]);
            let noise = Vector4::from_fn(|_, _| {
                let z: f64 = StandardNormal.sample(rng);
                quaternion_sigma * z
            });
            // A zero-length draw keeps the nominal orientation.
            let unit = (reference + noise)
                .try_normalize(f64::EPSILON)
                .unwrap_or(reference);
            for (k, slot) in out[offset..offset + 4].iter_mut().enumerate() {
                *slot = unit[k] - reference[k];
            }
        }
    }
}

//! Least-squares fit of one transition matrix from a batch of rollouts.

use nalgebra::{DMatrix, SVD};

use crate::error::{Result, SysIdError};

#[derive(Debug, Clone)]
pub struct LocalFit {
    /// `state_dim × input_dim`.
    pub matrix: DMatrix<f64>,
    /// Numerical rank of the Gram matrix.
    pub rank: usize,
    /// False when the rollout data held NaN or infinity; `matrix` is then all NaN.
    pub finite: bool,
}

impl LocalFit {
    pub fn is_rank_deficient(&self) -> bool {
        self.finite && self.rank < self.matrix.ncols()
    }
}

/// Solves `A = (Y Xᵗ)(X Xᵗ)⁺` with one rollout per column of `inputs` (X) and `outputs` (Y).
///
/// Singular values of the Gram matrix below `σ_max · n · ε` are dropped, which gives the
/// minimum-norm solution for rank-deficient batches and the zero matrix when every input
/// is zero.
pub fn fit(inputs: &DMatrix<f64>, outputs: &DMatrix<f64>) -> Result<LocalFit> {
    if inputs.ncols() != outputs.ncols() {
        return Err(SysIdError::DimensionMismatch {
            what: "rollout batch",
            expected: inputs.ncols(),
            got: outputs.ncols(),
        });
    }
    if inputs.ncols() == 0 {
        return Err(SysIdError::config("a local fit needs at least one rollout."));
    }

    let (rows, cols) = (outputs.nrows(), inputs.nrows());
    if cols == 0 {
        return Ok(LocalFit {
            matrix: DMatrix::zeros(rows, 0),
            rank: 0,
            finite: true,
        });
    }

    let gram = inputs * inputs.transpose();
    let cross = outputs * inputs.transpose();
    if gram.iter().chain(cross.iter()).any(|v| !v.is_finite()) {
        return Ok(LocalFit {
            matrix: DMatrix::from_element(rows, cols, f64::NAN),
            rank: 0,
            finite: false,
        });
    }

    let svd = SVD::new(gram, true, true);
    let sigma_max = svd.singular_values.max();
    if sigma_max <= 0.0 {
        return Ok(LocalFit {
            matrix: DMatrix::zeros(rows, cols),
            rank: 0,
            finite: true,
        });
    }
    let cutoff = sigma_max * cols as f64 * f64::EPSILON;
    let rank = svd.rank(cutoff);
    let pseudo_inverse = svd
        .pseudo_inverse(cutoff)
        .map_err(|message| SysIdError::config(format!("pseudo-inverse failed: {message}")))?;

    Ok(LocalFit {
        matrix: cross * pseudo_inverse,
        rank,
        finite: true,
    })
}

#[cfg(test)]
mod tests {
    use super::fit;
    use nalgebra::DMatrix;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};

    fn gaussian(rows: usize, cols: usize, seed: u64) -> DMatrix<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        DMatrix::from_fn(rows, cols, |_, _| StandardNormal.sample(&mut rng))
    }

    #[test]
    fn recovers_exact_linear_map() {
        let truth = gaussian(3, 4, 1);
        let inputs = gaussian(4, 12, 2);
        let outputs = &truth * &inputs;
        let fitted = fit(&inputs, &outputs).unwrap();
        assert_eq!(fitted.rank, 4);
        assert!(!fitted.is_rank_deficient());
        assert!((fitted.matrix - truth).amax() < 1e-8);
    }

    #[test]
    fn overdetermined_fit_averages_out_noise() {
        let truth = gaussian(2, 3, 3);
        let inputs = gaussian(3, 4000, 4);
        let noise = gaussian(2, 4000, 5) * 0.01;
        let outputs = &truth * &inputs + noise;
        let fitted = fit(&inputs, &outputs).unwrap();
        assert!((fitted.matrix - truth).amax() < 2e-3);
    }

    #[test]
    fn zero_inputs_give_zero_matrix() {
        let inputs = DMatrix::zeros(3, 10);
        let outputs = DMatrix::zeros(2, 10);
        let fitted = fit(&inputs, &outputs).unwrap();
        assert_eq!(fitted.matrix, DMatrix::zeros(2, 3));
        assert_eq!(fitted.rank, 0);
        assert!(fitted.is_rank_deficient());
    }

    #[test]
    fn rank_deficient_inputs_give_minimum_norm_solution() {
        // The last input never varies, so its column is not identifiable and is left at zero.
        let mut inputs = gaussian(3, 20, 6);
        inputs.row_mut(2).fill(0.0);
        let truth = DMatrix::from_row_slice(1, 3, &[1.0, -2.0, 5.0]);
        let outputs = &truth * &inputs;
        let fitted = fit(&inputs, &outputs).unwrap();
        assert_eq!(fitted.rank, 2);
        assert!(fitted.is_rank_deficient());
        assert!((fitted.matrix[(0, 0)] - 1.0).abs() < 1e-8);
        assert!((fitted.matrix[(0, 1)] + 2.0).abs() < 1e-8);
        assert!(fitted.matrix[(0, 2)].abs() < 1e-8);
    }

    #[test]
    fn non_finite_rollouts_propagate_as_nan() {
        let inputs = gaussian(2, 5, 7);
        let mut outputs = DMatrix::zeros(2, 5);
        outputs[(1, 3)] = f64::INFINITY;
        let fitted = fit(&inputs, &outputs).unwrap();
        assert!(!fitted.finite);
        assert!(fitted.matrix.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn empty_input_block_gives_empty_matrix() {
        let fitted = fit(&DMatrix::zeros(0, 4), &DMatrix::zeros(2, 4)).unwrap();
        assert_eq!(fitted.matrix.shape(), (2, 0));
    }

    #[test]
    fn mismatched_batches_are_rejected() {
        let err = fit(&DMatrix::zeros(2, 4), &DMatrix::zeros(2, 3)).unwrap_err();
        assert!(err.to_string().contains("rollout batch dimension mismatch"));
        assert!(fit(&DMatrix::zeros(2, 0), &DMatrix::zeros(2, 0)).is_err());
    }
}

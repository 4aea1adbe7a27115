use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SysIdError};
use crate::trajectory::StateLayout;

/// Upper bound on the number of fitting workers.
pub const MAX_THREADS: usize = 8;

/// Settings for one linearization run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SysIdConfig {
    /// Perturbation standard deviation relative to the largest nominal control.
    pub noise_coefficient: f64,
    /// Rollouts per trajectory step (`nroll`).
    pub rollouts: usize,
    /// Requested worker threads; clamped to `1..=MAX_THREADS` and to the step count.
    pub threads: usize,
    /// Length of one control interval in seconds.
    pub control_timestep: f64,
    /// Monte Carlo repetitions of the validation pass.
    pub test_runs: usize,
    /// Perturbation coefficient used by the validation pass.
    pub validation_noise: f64,
    pub seed: u64,
}

impl Default for SysIdConfig {
    fn default() -> Self {
        Self {
            noise_coefficient: 0.01,
            rollouts: 200,
            threads: 1,
            control_timestep: 0.01,
            test_runs: 100,
            validation_noise: 0.01,
            seed: 0,
        }
    }
}

impl SysIdConfig {
    pub fn validate(&self, layout: &StateLayout) -> Result<()> {
        if !self.noise_coefficient.is_finite() || self.noise_coefficient < 0.0 {
            return Err(SysIdError::config(
                "noise_coefficient must be finite and non-negative.",
            ));
        }
        if !self.validation_noise.is_finite() || self.validation_noise < 0.0 {
            return Err(SysIdError::config(
                "validation_noise must be finite and non-negative.",
            ));
        }
        if self.rollouts == 0 {
            return Err(SysIdError::config("rollouts must be greater than zero."));
        }
        if self.rollouts < layout.input_dim() {
            return Err(SysIdError::config(format!(
                "rollouts ({}) must be at least the regression input dimension ({}); \
                 the Gram matrix cannot be invertible otherwise.",
                self.rollouts,
                layout.input_dim()
            )));
        }
        if !self.control_timestep.is_finite() || self.control_timestep <= 0.0 {
            return Err(SysIdError::config("control_timestep must be positive."));
        }
        if self.test_runs == 0 {
            return Err(SysIdError::config("test_runs must be greater than zero."));
        }
        Ok(())
    }

    /// Number of workers actually spawned for a trajectory of `steps` steps.
    pub fn worker_count(&self, steps: usize) -> usize {
        let clamped = self.threads.clamp(1, MAX_THREADS);
        if clamped != self.threads {
            warn!(
                requested = self.threads,
                using = clamped,
                "thread count clamped to 1..={MAX_THREADS}"
            );
        }
        clamped.min(steps).max(1)
    }
}

/// Micro-steps per control interval, `control_timestep / simulation_timestep` truncated.
///
/// A relative slack of 1e-9 absorbs representation error, so `0.01 / 0.002` yields 5.
pub fn integration_substeps(control_timestep: f64, simulation_timestep: f64) -> Result<usize> {
    if !simulation_timestep.is_finite() || simulation_timestep <= 0.0 {
        return Err(SysIdError::config(format!(
            "Invalid timestep setting: simulation timestep {simulation_timestep} must be positive."
        )));
    }
    let ratio = control_timestep / simulation_timestep;
    let substeps = (ratio * (1.0 + 1e-9)).floor();
    if !substeps.is_finite() || substeps < 1.0 {
        return Err(SysIdError::config(format!(
            "Invalid timestep setting: control timestep {control_timestep} gives {substeps} \
             integration steps of {simulation_timestep}."
        )));
    }
    Ok(substeps as usize)
}

#[cfg(test)]
mod tests {
    use super::{integration_substeps, SysIdConfig, MAX_THREADS};
    use crate::trajectory::StateLayout;

    fn assert_err_contains<T: std::fmt::Debug>(result: crate::Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn substeps_truncate_ratio() {
        assert_eq!(integration_substeps(0.01, 0.002).unwrap(), 5);
        assert_eq!(integration_substeps(0.03, 0.01).unwrap(), 3);
        assert_eq!(integration_substeps(0.025, 0.01).unwrap(), 2);
        assert_eq!(integration_substeps(0.002, 0.002).unwrap(), 1);
    }

    #[test]
    fn substeps_reject_non_positive_counts() {
        assert_err_contains(integration_substeps(0.001, 0.002), "Invalid timestep");
        assert_err_contains(integration_substeps(0.01, 0.0), "must be positive");
        assert_err_contains(integration_substeps(-0.01, 0.002), "Invalid timestep");
    }

    #[test]
    fn validate_rejects_invalid_settings() {
        let layout = StateLayout::new(1, 0, 1);
        let base = SysIdConfig {
            rollouts: 10,
            ..SysIdConfig::default()
        };
        assert!(base.validate(&layout).is_ok());

        let config = SysIdConfig {
            noise_coefficient: -0.1,
            ..base.clone()
        };
        assert_err_contains(config.validate(&layout), "noise_coefficient");

        let config = SysIdConfig {
            rollouts: 0,
            ..base.clone()
        };
        assert_err_contains(config.validate(&layout), "greater than zero");

        let config = SysIdConfig {
            rollouts: 2,
            ..base.clone()
        };
        assert_err_contains(config.validate(&layout), "input dimension (3)");

        let config = SysIdConfig {
            test_runs: 0,
            ..base.clone()
        };
        assert_err_contains(config.validate(&layout), "test_runs");

        let config = SysIdConfig {
            control_timestep: 0.0,
            ..base
        };
        assert_err_contains(config.validate(&layout), "control_timestep");
    }

    #[test]
    fn zero_noise_is_a_valid_setting() {
        let config = SysIdConfig {
            noise_coefficient: 0.0,
            rollouts: 3,
            ..SysIdConfig::default()
        };
        assert!(config.validate(&StateLayout::new(1, 0, 1)).is_ok());
    }

    #[test]
    fn worker_count_is_clamped() {
        let config = SysIdConfig {
            threads: 0,
            ..SysIdConfig::default()
        };
        assert_eq!(config.worker_count(10), 1);

        let config = SysIdConfig {
            threads: 64,
            ..SysIdConfig::default()
        };
        assert_eq!(config.worker_count(100), MAX_THREADS);
        assert_eq!(config.worker_count(3), 3);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: SysIdConfig =
            serde_json::from_str(r#"{ "rollouts": 40, "threads": 4 }"#).unwrap();
        assert_eq!(config.rollouts, 40);
        assert_eq!(config.threads, 4);
        assert_eq!(config.test_runs, 100);
        assert_eq!(config.validation_noise, 0.01);
    }
}

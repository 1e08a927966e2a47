//! Synthetic processing costs.

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use time::Duration;

use crate::{core::clock::secs_f64, error::ConfigError};

/// How long one modeled operation (a hash, a recomputation) takes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CostModel {
    /// Every operation costs the same.
    Constant { secs: f64 },
    /// Costs are drawn uniformly from `[min_secs, max_secs]`.
    Uniform { min_secs: f64, max_secs: f64 },
}

impl CostModel {
    /// The reference per-hash cost (40 µs).
    pub const HASH: CostModel = CostModel::Constant { secs: 0.00004 };

    pub fn constant(cost: Duration) -> Self {
        CostModel::Constant {
            secs: cost.as_seconds_f64(),
        }
    }

    pub fn zero() -> Self {
        CostModel::Constant { secs: 0.0 }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            CostModel::Constant { secs } if !secs.is_finite() || secs < 0.0 => Err(
                ConfigError::InvalidCost(format!("constant cost must be non-negative, got {secs}")),
            ),
            CostModel::Uniform { min_secs, max_secs }
                if !min_secs.is_finite() || !max_secs.is_finite() || min_secs < 0.0 =>
            {
                Err(ConfigError::InvalidCost(
                    "uniform bounds must be finite and non-negative".to_string(),
                ))
            }
            CostModel::Uniform { min_secs, max_secs } if min_secs > max_secs => {
                Err(ConfigError::InvalidCost(format!(
                    "uniform lower bound {min_secs} exceeds upper bound {max_secs}"
                )))
            }
            _ => Ok(()),
        }
    }
}

impl Default for CostModel {
    fn default() -> Self {
        Self::HASH
    }
}

/// Draws operation costs from a [`CostModel`] with a seeded generator, so that a run with the
/// same seed and the same arrival order models the same delays.
#[derive(Debug, Clone)]
pub struct DelaySampler {
    model: CostModel,
    rng: StdRng,
}

impl DelaySampler {
    pub fn new(model: CostModel, seed: u64) -> Self {
        Self {
            model,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn model(&self) -> CostModel {
        self.model
    }

    /// Samples the cost of one operation.
    pub fn sample(&mut self) -> Duration {
        let secs = match self.model {
            CostModel::Constant { secs } => secs,
            CostModel::Uniform { min_secs, max_secs } if min_secs < max_secs => {
                self.rng.gen_range(min_secs..=max_secs)
            }
            CostModel::Uniform { min_secs, .. } => min_secs,
        };

        secs_f64(secs)
    }
}

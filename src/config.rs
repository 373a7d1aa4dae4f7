/*!
Run configuration for the mixture model, the synthetic data, the sampler and the outputs.

Every field has a default, so a JSON file only needs to list what it overrides:

```rust
use bgmm_hmc::config::Config;

let config = Config::from_json_str(r#"{ "sampler": { "num_results": 500 } }"#).unwrap();
assert_eq!(config.sampler.num_results, 500);
assert_eq!(config.model.components, 3);
```
*/

use crate::error::{BgmmError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub model: ModelConfig,
    pub data: DataConfig,
    pub sampler: SamplerConfig,
    pub output: OutputConfig,
}

/// Priors of the Bayesian mixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// Dimensionality of each observation.
    pub dims: usize,
    /// Number of mixture components.
    pub components: usize,
    /// Symmetric Dirichlet concentration over the mixture weights.
    pub dirichlet_concentration: f64,
    /// Prior mean of each component location, `components × dims`.
    pub loc_prior_mean: Option<Vec<Vec<f64>>>,
    pub loc_prior_scale: f64,
    /// Wishart degrees of freedom for the component precisions.
    pub wishart_df: f64,
    /// The Wishart scale matrix is `wishart_scale * I`.
    pub wishart_scale: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dims: 2,
            components: 3,
            dirichlet_concentration: 0.1,
            loc_prior_mean: None,
            loc_prior_scale: 1.0,
            wishart_df: 5.0,
            wishart_scale: 1.0,
        }
    }
}

/// Synthetic data generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataConfig {
    pub num_observations: usize,
    pub seed: u64,
    /// Locations the observations are drawn around, `components × dims`.
    pub true_loc: Option<Vec<Vec<f64>>>,
    pub noise_scale: f64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            num_observations: 1000,
            seed: 43,
            true_loc: None,
            noise_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplerConfig {
    pub num_results: usize,
    pub num_burnin_steps: usize,
    pub num_chains: usize,
    pub step_size: f64,
    pub num_leapfrog_steps: usize,
    /// Number of transitions (burn-in included) during which the step size adapts.
    pub num_adaptation_steps: usize,
    pub target_accept_prob: f64,
    pub adaptation_rate: f64,
    pub seed: Option<u64>,
    pub progress: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_results: 2000,
            num_burnin_steps: 500,
            num_chains: 4,
            step_size: 0.065,
            num_leapfrog_steps: 5,
            num_adaptation_steps: 400,
            target_accept_prob: 0.75,
            adaptation_rate: 0.01,
            seed: None,
            progress: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub save_csv: bool,
    pub plot: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("bgmm_output"),
            save_csv: true,
            plot: true,
        }
    }
}

impl Config {
    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        if m.dims == 0 {
            return Err(BgmmError::invalid("model.dims", "must be at least 1"));
        }
        if m.components == 0 {
            return Err(BgmmError::invalid("model.components", "must be at least 1"));
        }
        positive("model.dirichlet_concentration", m.dirichlet_concentration)?;
        positive("model.loc_prior_scale", m.loc_prior_scale)?;
        positive("model.wishart_scale", m.wishart_scale)?;
        if !(m.wishart_df > (m.dims - 1) as f64) {
            return Err(BgmmError::invalid(
                "model.wishart_df",
                format!("must exceed dims - 1 = {}", m.dims - 1),
            ));
        }
        check_rows("model.loc_prior_mean", &m.loc_prior_mean, m.components, m.dims)?;

        if self.data.num_observations == 0 {
            return Err(BgmmError::invalid(
                "data.num_observations",
                "must be at least 1",
            ));
        }
        positive("data.noise_scale", self.data.noise_scale)?;
        check_rows("data.true_loc", &self.data.true_loc, m.components, m.dims)?;

        let s = &self.sampler;
        if s.num_results == 0 {
            return Err(BgmmError::invalid("sampler.num_results", "must be at least 1"));
        }
        if s.num_chains == 0 {
            return Err(BgmmError::invalid("sampler.num_chains", "must be at least 1"));
        }
        if s.num_leapfrog_steps == 0 {
            return Err(BgmmError::invalid(
                "sampler.num_leapfrog_steps",
                "must be at least 1",
            ));
        }
        positive("sampler.step_size", s.step_size)?;
        if !(s.target_accept_prob > 0.0 && s.target_accept_prob < 1.0) {
            return Err(BgmmError::invalid(
                "sampler.target_accept_prob",
                "must lie strictly between 0 and 1",
            ));
        }
        if !(s.adaptation_rate >= 0.0) {
            return Err(BgmmError::invalid(
                "sampler.adaptation_rate",
                "must be non-negative",
            ));
        }
        Ok(())
    }

    /// Prior means of the component locations. Defaults to rows spaced evenly in [-1, 1].
    pub fn loc_prior_mean(&self) -> Result<Array2<f64>> {
        resolve_rows(
            &self.model.loc_prior_mean,
            self.model.components,
            self.model.dims,
            1.0,
        )
    }

    /// Locations used to generate data. Defaults to rows spaced evenly in [-2, 2].
    pub fn true_loc(&self) -> Result<Array2<f64>> {
        resolve_rows(
            &self.data.true_loc,
            self.model.components,
            self.model.dims,
            2.0,
        )
    }
}

fn positive(field: &str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(BgmmError::invalid(
            field,
            format!("must be positive and finite, got {value}"),
        ))
    }
}

fn check_rows(
    field: &str,
    rows: &Option<Vec<Vec<f64>>>,
    components: usize,
    dims: usize,
) -> Result<()> {
    let Some(rows) = rows else {
        return Ok(());
    };
    if rows.len() != components {
        return Err(BgmmError::invalid(
            field,
            format!("expected {components} rows, got {}", rows.len()),
        ));
    }
    if let Some(bad) = rows.iter().find(|r| r.len() != dims) {
        return Err(BgmmError::invalid(
            field,
            format!("expected rows of length {dims}, got {}", bad.len()),
        ));
    }
    Ok(())
}

fn resolve_rows(
    rows: &Option<Vec<Vec<f64>>>,
    components: usize,
    dims: usize,
    half_width: f64,
) -> Result<Array2<f64>> {
    match rows {
        Some(rows) => {
            let flat: Vec<f64> = rows.iter().flatten().copied().collect();
            Ok(Array2::from_shape_vec((rows.len(), dims), flat)?)
        }
        None => Ok(Array2::from_shape_fn((components, dims), |(k, _)| {
            spaced(k, components, half_width)
        })),
    }
}

/// Position `k` of `n` points spaced evenly over `[-half_width, half_width]`.
fn spaced(k: usize, n: usize, half_width: f64) -> f64 {
    if n == 1 {
        0.0
    } else {
        -half_width + 2.0 * half_width * k as f64 / (n - 1) as f64
    }
}

/*!
Reference log-densities for the building blocks of the Bayesian mixture, evaluated on the CPU
in `f64`. The sampler itself works on batched `burn` tensors (see [`crate::model`]); these
implementations are the ground truth those tensors are checked against, and they also back
[`crate::model::BayesianGmm::joint_log_prob`].

# Examples

```rust
use bgmm_hmc::distributions::{Dirichlet, MvnCholPrecision};
use ndarray::array;

let dir = Dirichlet::symmetric(3, 1.0);
// A flat Dirichlet over three weights has density Γ(3) = 2 everywhere.
assert!((dir.log_prob(&array![0.2, 0.3, 0.5].view()) - 2f64.ln()).abs() < 1e-12);

let mvn = MvnCholPrecision::new(array![0.0, 0.0], ndarray::Array2::eye(2));
let lp = mvn.log_prob(&array![0.0, 0.0].view());
assert!((lp + (2.0 * std::f64::consts::PI).ln()).abs() < 1e-12);
```
*/

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use statrs::function::gamma::ln_gamma;
use std::f64::consts::PI;

const LN_2PI: f64 = 1.8378770664093453;

/// Dirichlet distribution over the probability simplex.
#[derive(Debug, Clone, PartialEq)]
pub struct Dirichlet {
    pub concentration: Array1<f64>,
    log_normalizer: f64,
}

impl Dirichlet {
    pub fn new(concentration: Array1<f64>) -> Self {
        let total: f64 = concentration.sum();
        let log_normalizer =
            ln_gamma(total) - concentration.iter().map(|&a| ln_gamma(a)).sum::<f64>();
        Self {
            concentration,
            log_normalizer,
        }
    }

    pub fn symmetric(k: usize, alpha: f64) -> Self {
        Self::new(Array1::from_elem(k, alpha))
    }

    /// `lnΓ(Σα) − Σ lnΓ(α_k)`.
    pub fn log_normalizer(&self) -> f64 {
        self.log_normalizer
    }

    pub fn log_prob(&self, p: &ArrayView1<f64>) -> f64 {
        self.concentration
            .iter()
            .zip(p.iter())
            .map(|(&a, &pk)| (a - 1.0) * pk.ln())
            .sum::<f64>()
            + self.log_normalizer
    }
}

/// Univariate normal distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normal {
    pub mean: f64,
    pub scale: f64,
}

impl Normal {
    pub fn new(mean: f64, scale: f64) -> Self {
        Self { mean, scale }
    }

    pub fn log_prob(&self, x: f64) -> f64 {
        let z = (x - self.mean) / self.scale;
        -0.5 * z * z - self.scale.ln() - 0.5 * LN_2PI
    }
}

/// Sum of independent normal log-densities, each entry of `x` against the matching entry of
/// `mean` with a shared `scale`.
pub fn independent_normal_log_prob(x: &ArrayView2<f64>, mean: &ArrayView2<f64>, scale: f64) -> f64 {
    x.iter()
        .zip(mean.iter())
        .map(|(&xi, &mi)| Normal::new(mi, scale).log_prob(xi))
        .sum()
}

/**
Wishart prior over a precision matrix `X = L Lᵀ`, evaluated on the lower Cholesky factor `L`.

The scale matrix is `scale · I`. The density is taken with respect to the free entries of `L`,
so it carries the Jacobian of `X ↦ chol(X)`:

```text
log|dX/dL| = d·ln 2 + Σ_j (d − j)·ln L_jj      (j = 0..d−1)
```
*/
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WishartCholesky {
    pub df: f64,
    pub scale: f64,
    pub dims: usize,
}

impl WishartCholesky {
    pub fn new(df: f64, scale: f64, dims: usize) -> Self {
        Self { df, scale, dims }
    }

    /// Everything in the log-density that does not depend on `L`.
    pub fn log_normalizer(&self) -> f64 {
        let d = self.dims as f64;
        let half_df = 0.5 * self.df;
        let ln_mv_gamma = 0.25 * d * (d - 1.0) * PI.ln()
            + (0..self.dims)
                .map(|j| ln_gamma(half_df - 0.5 * j as f64))
                .sum::<f64>();
        -half_df * d * 2f64.ln() - half_df * d * self.scale.ln() - ln_mv_gamma
            + d * 2f64.ln()
    }

    /// Coefficient of `ln L_jj` for each diagonal index `j`.
    pub fn diag_coefficients(&self) -> Vec<f64> {
        let d = self.dims as f64;
        (0..self.dims)
            .map(|j| (self.df - d - 1.0) + (d - j as f64))
            .collect()
    }

    pub fn log_prob(&self, chol: &ArrayView2<f64>) -> f64 {
        let log_diag: f64 = self
            .diag_coefficients()
            .iter()
            .enumerate()
            .map(|(j, &c)| c * chol[[j, j]].ln())
            .sum();
        let trace: f64 = chol
            .indexed_iter()
            .filter(|((i, j), _)| j <= i)
            .map(|(_, &v)| v * v)
            .sum();
        log_diag - 0.5 * trace / self.scale + self.log_normalizer()
    }
}

/// Multivariate normal parameterized by a location and the lower Cholesky factor of its
/// precision matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct MvnCholPrecision {
    pub loc: Array1<f64>,
    pub chol_precision: Array2<f64>,
}

impl MvnCholPrecision {
    pub fn new(loc: Array1<f64>, chol_precision: Array2<f64>) -> Self {
        Self {
            loc,
            chol_precision,
        }
    }

    pub fn log_prob(&self, x: &ArrayView1<f64>) -> f64 {
        let d = self.loc.len();
        let diff = x - &self.loc;
        // ‖Lᵀ (x − μ)‖²
        let projected = self.chol_precision.t().dot(&diff);
        let log_det: f64 = (0..d).map(|j| self.chol_precision[[j, j]].ln()).sum();
        -0.5 * d as f64 * LN_2PI + log_det - 0.5 * projected.dot(&projected)
    }
}

/**
A categorical distribution over `0..probs.len()`.

The probabilities in `probs` are normalized on construction.

```rust
use bgmm_hmc::distributions::Categorical;

let mut cat = Categorical::new(vec![1.0, 1.0, 2.0]).set_seed(1);
let k = cat.sample();
assert!(k < 3);
assert!((cat.log_prob(2) - 0.5f64.ln()).abs() < 1e-12);
```
*/
#[derive(Debug, Clone)]
pub struct Categorical {
    pub probs: Vec<f64>,
    rng: SmallRng,
}

impl Categorical {
    pub fn new(probs: Vec<f64>) -> Self {
        let sum: f64 = probs.iter().sum();
        Self {
            probs: probs.into_iter().map(|p| p / sum).collect(),
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn uniform(k: usize) -> Self {
        Self::new(vec![1.0; k])
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn sample(&mut self) -> usize {
        let r: f64 = self.rng.gen();
        let mut cum = 0.0;
        for (i, &p) in self.probs.iter().enumerate() {
            cum += p;
            if r < cum {
                return i;
            }
        }
        self.probs.len() - 1
    }

    pub fn log_prob(&self, index: usize) -> f64 {
        self.probs
            .get(index)
            .map_or(f64::NEG_INFINITY, |p| p.ln())
    }
}

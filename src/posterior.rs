//! Reduction of a sampler [`Trace`] into constrained posterior draws and summary statistics.

use crate::error::{BgmmError, Result};
use crate::hmc::Trace;
use crate::model::{Layout, Parameters};
use crate::stats::{effective_sample_size, split_rhat};
use burn::prelude::Backend;
use ndarray::{Array1, Array2, Array3, Axis};
use num_traits::ToPrimitive;
use rayon::prelude::*;
use std::fmt;

/// Every collected draw mapped back to the constrained parameter space.
#[derive(Debug, Clone)]
pub struct PosteriorDraws {
    pub n_results: usize,
    pub n_chains: usize,
    /// Sample-major: draw `s` of chain `c` sits at `s * n_chains + c`.
    pub draws: Vec<Parameters>,
    /// `[n_results, n_chains]`
    pub is_accepted: Array2<bool>,
    /// Step size at the end of sampling.
    pub step_size: f64,
}

impl PosteriorDraws {
    pub fn from_trace<B: Backend, T: ToPrimitive + Copy>(
        trace: &Trace<B, T>,
        layout: &Layout,
    ) -> Result<Self> {
        let samples = trace.samples_array()?;
        let (n_results, n_chains, dim) = samples.dim();
        if dim != layout.dim() {
            return Err(BgmmError::ShapeMismatch {
                what: "sample dimension".to_string(),
                expected: layout.dim(),
                got: dim,
            });
        }
        let flat = samples.into_shape_with_order((n_results * n_chains, dim))?;
        let draws = (0..flat.nrows())
            .into_par_iter()
            .map(|i| layout.constrain(&flat.row(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            n_results,
            n_chains,
            draws,
            is_accepted: trace.is_accepted.clone(),
            step_size: trace.step_size.to_f64().unwrap_or(f64::NAN),
        })
    }

    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    pub fn get(&self, sample: usize, chain: usize) -> Option<&Parameters> {
        if chain >= self.n_chains {
            return None;
        }
        self.draws.get(sample * self.n_chains + chain)
    }

    /// `[n_results, n_chains]` trace of one scalar extracted from each draw.
    pub fn chains_of<F>(&self, f: F) -> Array2<f64>
    where
        F: Fn(&Parameters) -> f64,
    {
        Array2::from_shape_fn((self.n_results, self.n_chains), |(s, c)| {
            f(&self.draws[s * self.n_chains + c])
        })
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.is_accepted.is_empty() {
            return 0.0;
        }
        self.is_accepted.iter().filter(|&&a| a).count() as f64 / self.is_accepted.len() as f64
    }

    /// Element-wise mean of every draw's weights, locations and precision factors.
    pub fn mean_parameters(&self) -> Result<Parameters> {
        let first = self
            .draws
            .first()
            .ok_or_else(|| BgmmError::Stats("no posterior draws to summarize".to_string()))?;
        let n = self.len() as f64;
        let mut mean_mix_probs = Array1::<f64>::zeros(first.mix_probs.raw_dim());
        let mut mean_loc = Array2::<f64>::zeros(first.loc.raw_dim());
        let mut mean_chol = Array3::<f64>::zeros(first.chol_precision.raw_dim());
        for p in &self.draws {
            mean_mix_probs += &p.mix_probs;
            mean_loc += &p.loc;
            mean_chol += &p.chol_precision;
        }
        Ok(Parameters {
            mix_probs: mean_mix_probs / n,
            loc: mean_loc / n,
            chol_precision: mean_chol / n,
        })
    }

    pub fn summary(&self) -> Result<PosteriorSummary> {
        let mean_params = self.mean_parameters()?;
        let precision = mean_params.precision();

        let (k, d) = mean_params.loc.dim();
        let mut loc_rhat = Array2::from_elem((k, d), f64::NAN);
        let mut loc_ess = Array2::from_elem((k, d), f64::NAN);
        for c in 0..k {
            for j in 0..d {
                let chains = self.chains_of(|p| p.loc[[c, j]]);
                match split_rhat(&chains.view()) {
                    Ok(v) => loc_rhat[[c, j]] = v,
                    Err(e) => log::warn!("R-hat unavailable for loc[{c}][{j}]: {e}"),
                }
                match effective_sample_size(&chains.view()) {
                    Ok(v) => loc_ess[[c, j]] = v,
                    Err(e) => log::warn!("ESS unavailable for loc[{c}][{j}]: {e}"),
                }
            }
        }

        Ok(PosteriorSummary {
            num_draws: self.len(),
            acceptance_rate: self.acceptance_rate(),
            step_size: self.step_size,
            mean_mix_probs: mean_params.mix_probs,
            mean_loc: mean_params.loc,
            mean_chol_precision: mean_params.chol_precision,
            precision,
            loc_rhat,
            loc_ess,
        })
    }
}

/// Posterior means and diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorSummary {
    pub num_draws: usize,
    pub acceptance_rate: f64,
    pub step_size: f64,
    pub mean_mix_probs: Array1<f64>,
    pub mean_loc: Array2<f64>,
    pub mean_chol_precision: Array3<f64>,
    /// `L Lᵀ` of the mean Cholesky factor of each component.
    pub precision: Array3<f64>,
    /// Split R-hat of each location coordinate, `[K, d]`.
    pub loc_rhat: Array2<f64>,
    /// Effective sample size of each location coordinate, `[K, d]`.
    pub loc_ess: Array2<f64>,
}

impl fmt::Display for PosteriorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "draws: {}", self.num_draws)?;
        writeln!(f, "acceptance_rate: {:.4}", self.acceptance_rate)?;
        writeln!(f, "step_size: {:.4}", self.step_size)?;
        writeln!(f, "avg mix probs: {:.4}", self.mean_mix_probs)?;
        writeln!(f, "avg loc:\n{:.4}", self.mean_loc)?;
        writeln!(f, "avg chol(precision):")?;
        for chol in self.mean_chol_precision.axis_iter(Axis(0)) {
            writeln!(f, "{:.4}", chol)?;
        }
        writeln!(f, "precision:")?;
        for prec in self.precision.axis_iter(Axis(0)) {
            writeln!(f, "{:.4}", prec)?;
        }
        writeln!(f, "loc split-rhat:\n{:.3}", self.loc_rhat)?;
        write!(f, "loc ess:\n{:.0}", self.loc_ess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::NdArray;
    use burn::tensor::{Tensor, TensorData};
    use ndarray::array;

    type Cpu = NdArray<f64>;

    /// Two draws from two chains of a one-component, one-dimensional model.
    fn tiny_trace() -> Trace<Cpu, f64> {
        // Layout for K = 1, d = 1: [loc, raw_diag].
        let values = vec![
            0.0, 0.0, // sample 0, chain 0
            1.0, 0.0, // sample 0, chain 1
            2.0, 0.0, // sample 1, chain 0
            3.0, 0.0, // sample 1, chain 1
        ];
        Trace {
            samples: Tensor::from_data(TensorData::new(values, [2, 2, 2]), &NdArrayDevice::Cpu),
            is_accepted: array![[true, false], [true, true]],
            step_size: 0.1,
        }
    }

    #[test]
    fn test_from_trace_ordering_and_means() {
        let layout = Layout::new(1, 1);
        let draws = PosteriorDraws::from_trace(&tiny_trace(), &layout).unwrap();
        assert_eq!(draws.len(), 4);
        assert_eq!(draws.get(1, 0).unwrap().loc, array![[2.0]]);
        assert_eq!(draws.get(0, 1).unwrap().loc, array![[1.0]]);
        assert!(draws.get(0, 2).is_none());
        assert_abs_diff_eq!(draws.acceptance_rate(), 0.75);
        assert_eq!(
            draws.chains_of(|p| p.loc[[0, 0]]),
            array![[0.0, 1.0], [2.0, 3.0]]
        );

        let summary = draws.summary().unwrap();
        assert_eq!(draws.mean_parameters().unwrap().loc, summary.mean_loc);
        assert_abs_diff_eq!(summary.mean_loc, array![[1.5]]);
        assert_abs_diff_eq!(summary.mean_mix_probs, array![1.0]);
        let sp0 = 2f64.ln();
        assert_abs_diff_eq!(summary.mean_chol_precision, array![[[sp0]]], epsilon = 1e-12);
        assert_abs_diff_eq!(summary.precision, array![[[sp0 * sp0]]], epsilon = 1e-12);
        // Too few draws for diagnostics.
        assert!(summary.loc_ess[[0, 0]].is_nan());
        assert!(summary.to_string().contains("acceptance_rate: 0.7500"));
    }

    #[test]
    fn test_from_trace_rejects_wrong_layout() {
        let layout = Layout::new(3, 2);
        let err = PosteriorDraws::from_trace(&tiny_trace(), &layout).unwrap_err();
        assert!(matches!(err, BgmmError::ShapeMismatch { got: 2, .. }));
    }

    #[test]
    fn test_mixture_weights_stay_on_simplex() {
        let layout = Layout::new(3, 2);
        let values: Vec<f64> = (0..3 * layout.dim())
            .map(|i| ((i * 37 % 11) as f64 - 5.0) * 0.4)
            .collect();
        let trace = Trace::<Cpu, f64> {
            samples: Tensor::from_data(
                TensorData::new(values, [3, 1, layout.dim()]),
                &NdArrayDevice::Cpu,
            ),
            is_accepted: Array2::from_elem((3, 1), true),
            step_size: 0.1,
        };
        let draws = PosteriorDraws::from_trace(&trace, &layout).unwrap();
        for p in &draws.draws {
            assert!(p.mix_probs.iter().all(|&w| w > 0.0));
            assert_abs_diff_eq!(p.mix_probs.sum(), 1.0, epsilon = 1e-12);
            for chol in p.chol_precision.axis_iter(Axis(0)) {
                assert!(chol[[0, 0]] > 0.0 && chol[[1, 1]] > 0.0);
                assert_eq!(chol[[0, 1]], 0.0);
            }
        }
    }
}

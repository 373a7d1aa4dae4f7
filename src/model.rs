/*!
The Bayesian Gaussian mixture model.

```text
π        ~ Dirichlet(α·1)
μ_k      ~ Normal(m_k, s_μ² I)
L_k L_kᵀ ~ Wishart(ν, s_W I)
x_n      ~ Σ_k π_k · MVN(μ_k, (L_k L_kᵀ)⁻¹)
```

[`BayesianGmm::joint_log_prob`] evaluates the joint density on the CPU for a single set of
[`Parameters`]. [`GmmPosterior`] evaluates the same density, pulled back to the unconstrained
space described by [`Layout`], for a whole batch of chain positions at once using `burn`
tensors so that the sampler can differentiate it.
*/

use crate::bijectors::{FillScaleTriL, SoftmaxCentered};
use crate::config::Config;
use crate::distributions::{
    independent_normal_log_prob, Dirichlet, MvnCholPrecision, WishartCholesky,
};
use crate::error::{BgmmError, Result};
use crate::hmc::GradientTarget;
use burn::prelude::*;
use burn::tensor::activation::{log_sigmoid, log_softmax, softplus};
use burn::tensor::backend::AutodiffBackend;
use ndarray::{s, Array1, Array2, Array3, ArrayView1, Axis};
use num_traits::Float;
use std::ops::Range;

const LN_2PI: f64 = 1.8378770664093453;

/// One point in the constrained parameter space.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    /// Mixture weights, `[K]`.
    pub mix_probs: Array1<f64>,
    /// Component locations, `[K, d]`.
    pub loc: Array2<f64>,
    /// Lower Cholesky factors of the component precisions, `[K, d, d]`.
    pub chol_precision: Array3<f64>,
}

impl Parameters {
    /// The starting state of every chain: uniform weights, locations at the configured
    /// data-generating layout, identity precision factors.
    pub fn initial(config: &Config) -> Result<Self> {
        let (k, d) = (config.model.components, config.model.dims);
        let eye = Array2::<f64>::eye(d);
        let chol_precision = Array3::from_shape_fn((k, d, d), |(_, i, j)| eye[[i, j]]);
        Ok(Self {
            mix_probs: Array1::from_elem(k, 1.0 / k as f64),
            loc: config.true_loc()?,
            chol_precision,
        })
    }

    /// Precision matrices `L_k L_kᵀ`.
    pub fn precision(&self) -> Array3<f64> {
        let mut out = Array3::zeros(self.chol_precision.raw_dim());
        for (chol, mut prec) in self
            .chol_precision
            .axis_iter(Axis(0))
            .zip(out.axis_iter_mut(Axis(0)))
        {
            prec.assign(&chol.dot(&chol.t()));
        }
        out
    }
}

/// How a flat unconstrained vector splits into parameter blocks:
/// `[mix logits (K−1) | loc (K·d) | precision factors (K·d(d+1)/2)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub components: usize,
    pub dims: usize,
    pub tril: FillScaleTriL,
}

impl Layout {
    pub fn new(components: usize, dims: usize) -> Self {
        Self {
            components,
            dims,
            tril: FillScaleTriL::new(dims),
        }
    }

    pub fn mix_range(&self) -> Range<usize> {
        0..self.components - 1
    }

    pub fn loc_range(&self) -> Range<usize> {
        let start = self.components - 1;
        start..start + self.components * self.dims
    }

    pub fn tril_range(&self) -> Range<usize> {
        let start = self.loc_range().end;
        start..start + self.components * self.tril.tril_len()
    }

    /// Total number of unconstrained coordinates.
    pub fn dim(&self) -> usize {
        self.tril_range().end
    }

    fn check_len(&self, z: &ArrayView1<f64>) -> Result<()> {
        if z.len() != self.dim() {
            return Err(BgmmError::ShapeMismatch {
                what: "unconstrained position".to_string(),
                expected: self.dim(),
                got: z.len(),
            });
        }
        Ok(())
    }

    pub fn constrain(&self, z: &ArrayView1<f64>) -> Result<Parameters> {
        self.check_len(z)?;
        let (k, d, m) = (self.components, self.dims, self.tril.tril_len());
        let mix_probs = SoftmaxCentered.forward(&z.slice(s![self.mix_range()]));
        let loc = z
            .slice(s![self.loc_range()])
            .to_owned()
            .into_shape_with_order((k, d))?;
        let tril = z.slice(s![self.tril_range()]);
        let mut chol_precision = Array3::zeros((k, d, d));
        for (c, mut out) in chol_precision.axis_iter_mut(Axis(0)).enumerate() {
            out.assign(&self.tril.forward(&tril.slice(s![c * m..(c + 1) * m])));
        }
        Ok(Parameters {
            mix_probs,
            loc,
            chol_precision,
        })
    }

    pub fn unconstrain(&self, params: &Parameters) -> Result<Array1<f64>> {
        if params.mix_probs.len() != self.components {
            return Err(BgmmError::ShapeMismatch {
                what: "mixture weights".to_string(),
                expected: self.components,
                got: params.mix_probs.len(),
            });
        }
        let mut z = Vec::with_capacity(self.dim());
        z.extend(SoftmaxCentered.inverse(&params.mix_probs.view()));
        z.extend(params.loc.iter().copied());
        for chol in params.chol_precision.axis_iter(Axis(0)) {
            z.extend(self.tril.inverse(&chol));
        }
        let z = Array1::from(z);
        self.check_len(&z.view())?;
        Ok(z)
    }

    /// `ln|det J|` of [`Layout::constrain`] at `z`.
    pub fn log_det_jacobian(&self, z: &ArrayView1<f64>) -> Result<f64> {
        self.check_len(z)?;
        let m = self.tril.tril_len();
        let tril = z.slice(s![self.tril_range()]);
        let ldj_tril: f64 = (0..self.components)
            .map(|c| {
                self.tril
                    .forward_log_det_jacobian(&tril.slice(s![c * m..(c + 1) * m]))
            })
            .sum();
        Ok(SoftmaxCentered.forward_log_det_jacobian(&z.slice(s![self.mix_range()])) + ldj_tril)
    }
}

/// Priors plus the observed data.
#[derive(Debug, Clone)]
pub struct BayesianGmm {
    pub dirichlet: Dirichlet,
    pub loc_prior_mean: Array2<f64>,
    pub loc_prior_scale: f64,
    pub wishart: WishartCholesky,
    /// Observations, `[N, d]`.
    pub observations: Array2<f64>,
}

impl BayesianGmm {
    pub fn from_config(config: &Config, observations: Array2<f64>) -> Result<Self> {
        let m = &config.model;
        if observations.ncols() != m.dims {
            return Err(BgmmError::ShapeMismatch {
                what: "observation dimension".to_string(),
                expected: m.dims,
                got: observations.ncols(),
            });
        }
        if observations.nrows() == 0 {
            return Err(BgmmError::invalid(
                "observations",
                "at least one observation is required",
            ));
        }
        Ok(Self {
            dirichlet: Dirichlet::symmetric(m.components, m.dirichlet_concentration),
            loc_prior_mean: config.loc_prior_mean()?,
            loc_prior_scale: m.loc_prior_scale,
            wishart: WishartCholesky::new(m.wishart_df, m.wishart_scale, m.dims),
            observations,
        })
    }

    pub fn components(&self) -> usize {
        self.loc_prior_mean.nrows()
    }

    pub fn dims(&self) -> usize {
        self.loc_prior_mean.ncols()
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self.components(), self.dims())
    }

    pub fn log_prior(&self, params: &Parameters) -> f64 {
        let lp_mix = self.dirichlet.log_prob(&params.mix_probs.view());
        let lp_loc = independent_normal_log_prob(
            &params.loc.view(),
            &self.loc_prior_mean.view(),
            self.loc_prior_scale,
        );
        let lp_prec: f64 = params
            .chol_precision
            .axis_iter(Axis(0))
            .map(|chol| self.wishart.log_prob(&chol))
            .sum();
        lp_mix + lp_loc + lp_prec
    }

    pub fn log_likelihood(&self, params: &Parameters) -> f64 {
        let components: Vec<(f64, MvnCholPrecision)> = params
            .mix_probs
            .iter()
            .zip(params.loc.axis_iter(Axis(0)))
            .zip(params.chol_precision.axis_iter(Axis(0)))
            .map(|((p, loc), chol)| (p.ln(), MvnCholPrecision::new(loc.to_owned(), chol.to_owned())))
            .collect();
        self.observations
            .axis_iter(Axis(0))
            .map(|x| {
                let lps: Vec<f64> = components
                    .iter()
                    .map(|(log_p, mvn)| log_p + mvn.log_prob(&x))
                    .collect();
                log_sum_exp(&lps)
            })
            .sum()
    }

    /// `log p(π, μ, L, x)` for the observed `x`.
    pub fn joint_log_prob(&self, params: &Parameters) -> f64 {
        self.log_prior(params) + self.log_likelihood(params)
    }

    /// Joint density pulled back to the unconstrained space, Jacobian included.
    pub fn unconstrained_log_prob(&self, z: &ArrayView1<f64>) -> Result<f64> {
        let layout = self.layout();
        let params = layout.constrain(z)?;
        Ok(self.joint_log_prob(&params) + layout.log_det_jacobian(z)?)
    }

    /// Builds the batched, differentiable posterior on `device`.
    pub fn posterior<B: Backend>(&self, device: &B::Device) -> GmmPosterior<B> {
        GmmPosterior::new(self, device)
    }
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

fn tensor2<B: Backend>(a: &Array2<f64>, device: &B::Device) -> Tensor<B, 2> {
    let shape = [a.nrows(), a.ncols()];
    Tensor::from_data(
        TensorData::new(a.iter().copied().collect::<Vec<f64>>(), shape),
        device,
    )
}

/// The unconstrained posterior of a [`BayesianGmm`], evaluated on `[n_chains, D]` batches.
#[derive(Debug, Clone)]
pub struct GmmPosterior<B: Backend> {
    layout: Layout,
    observations: Tensor<B, 2>,
    concentration_minus_one: Tensor<B, 2>,
    dirichlet_log_normalizer: f64,
    loc_prior_mean: Tensor<B, 3>,
    loc_prior_scale: f64,
    wishart_diag_coef: Tensor<B, 2>,
    wishart_scale: f64,
    wishart_log_normalizer: f64,
    diag_select: Tensor<B, 2>,
    offdiag_scatter: Tensor<B, 2>,
    diag_scatter: Tensor<B, 2>,
}

impl<B: Backend> GmmPosterior<B> {
    pub fn new(model: &BayesianGmm, device: &B::Device) -> Self {
        let layout = model.layout();
        let (k, d) = (layout.components, layout.dims);
        let alpha = model.dirichlet.concentration.mapv(|a| a - 1.0);
        let coef = Array1::from(model.wishart.diag_coefficients());
        Self {
            layout,
            observations: tensor2(&model.observations, device),
            concentration_minus_one: tensor2(&alpha.insert_axis(Axis(0)), device),
            dirichlet_log_normalizer: model.dirichlet.log_normalizer(),
            loc_prior_mean: tensor2(&model.loc_prior_mean, device).reshape([1, k, d]),
            loc_prior_scale: model.loc_prior_scale,
            wishart_diag_coef: tensor2(&coef.insert_axis(Axis(0)), device),
            wishart_scale: model.wishart.scale,
            wishart_log_normalizer: model.wishart.log_normalizer(),
            diag_select: tensor2(&layout.tril.diag_select(), device),
            offdiag_scatter: tensor2(&layout.tril.offdiag_scatter(), device),
            diag_scatter: tensor2(&layout.tril.diag_scatter(), device),
        }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Normalized log posterior density of each row of `positions` in the unconstrained space,
    /// `[n, D] → [n]`.
    pub fn log_prob(&self, positions: &Tensor<B, 2>) -> Tensor<B, 1> {
        let device = positions.device();
        let [n, _] = positions.dims();
        let (k, d) = (self.layout.components, self.layout.dims);
        let m = self.layout.tril.tril_len();
        let n_obs = self.observations.dims()[0];

        // Mixture weights, [n, k].
        let log_mix = if k > 1 {
            let logits = positions.clone().slice([0..n, self.layout.mix_range()]);
            let padded = Tensor::cat(vec![logits, Tensor::zeros([n, 1], &device)], 1);
            log_softmax(padded, 1)
        } else {
            Tensor::zeros([n, 1], &device)
        };

        let loc: Tensor<B, 3> = positions
            .clone()
            .slice([0..n, self.layout.loc_range()])
            .reshape([n, k, d]);

        // Precision factors, one row of d·d entries per (chain, component).
        let raw: Tensor<B, 2> = positions
            .clone()
            .slice([0..n, self.layout.tril_range()])
            .reshape([n * k, m]);
        let raw_diag = raw.clone().matmul(self.diag_select.clone());
        let diag = softplus(raw_diag.clone(), 1.0);
        let log_diag = diag.clone().log();
        let chol = raw.matmul(self.offdiag_scatter.clone()) + diag.matmul(self.diag_scatter.clone());

        let log_dirichlet = (log_mix.clone() * self.concentration_minus_one.clone())
            .sum_dim(1)
            .add_scalar(self.dirichlet_log_normalizer);

        let loc_prior_constant =
            -((k * d) as f64) * (self.loc_prior_scale.ln() + 0.5 * LN_2PI);
        let log_loc_prior = (loc.clone() - self.loc_prior_mean.clone())
            .div_scalar(self.loc_prior_scale)
            .powi_scalar(2)
            .reshape([n, k * d])
            .sum_dim(1)
            .mul_scalar(-0.5)
            .add_scalar(loc_prior_constant);

        let log_wishart = ((log_diag.clone() * self.wishart_diag_coef.clone()).sum_dim(1)
            - chol
                .clone()
                .powi_scalar(2)
                .sum_dim(1)
                .div_scalar(2.0 * self.wishart_scale))
        .add_scalar(self.wishart_log_normalizer)
        .reshape([n, k])
        .sum_dim(1);

        // ‖L_kᵀ (x − μ_k)‖² for every chain, component and observation.
        let diff = self
            .observations
            .clone()
            .reshape([1, 1, n_obs, d])
            .expand([n, k, n_obs, d])
            - loc.reshape([n, k, 1, d]).expand([n, k, n_obs, d]);
        let projected = diff
            .reshape([n * k, n_obs, d])
            .matmul(chol.reshape([n * k, d, d]));
        let quad: Tensor<B, 3> = projected.powi_scalar(2).sum_dim(2).reshape([n, k, n_obs]);
        let log_det: Tensor<B, 3> = log_diag.sum_dim(1).reshape([n, k, 1]);

        let component_lp = (quad.mul_scalar(-0.5) + log_det + log_mix.clone().reshape([n, k, 1]))
            .add_scalar(-0.5 * d as f64 * LN_2PI);
        let max = component_lp.clone().max_dim(1).detach();
        let log_lik = ((component_lp - max.clone()).exp().sum_dim(1).log() + max)
            .reshape([n, n_obs])
            .sum_dim(1);

        let ldj_mix = if k > 1 {
            log_mix.sum_dim(1)
        } else {
            Tensor::zeros([n, 1], &device)
        };
        let ldj_tril = log_sigmoid(raw_diag).reshape([n, k * d]).sum_dim(1);

        (log_dirichlet + log_loc_prior + log_wishart + log_lik + ldj_mix + ldj_tril).reshape([n])
    }
}

impl<T, B> GradientTarget<T, B> for GmmPosterior<B>
where
    T: Float,
    B: AutodiffBackend,
{
    fn log_prob_batch(&self, positions: &Tensor<B, 2>) -> Tensor<B, 1> {
        self.log_prob(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data;
    use approx::assert_abs_diff_eq;
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::{Autodiff, NdArray};
    use ndarray::array;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, StandardNormal};

    type Cpu = NdArray<f64>;

    fn small_model(components: usize, dims: usize) -> BayesianGmm {
        let mut config = Config::default();
        config.model.components = components;
        config.model.dims = dims;
        config.data.num_observations = 40;
        let obs = data::generate(&config).unwrap();
        BayesianGmm::from_config(&config, obs.points).unwrap()
    }

    fn random_positions(n: usize, dim: usize, seed: u64) -> Array2<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        Array2::from_shape_fn((n, dim), |_| {
            let v: f64 = StandardNormal.sample(&mut rng);
            0.5 * v
        })
    }

    fn check_tensor_matches_reference(components: usize, dims: usize) {
        let model = small_model(components, dims);
        let layout = model.layout();
        let positions = random_positions(3, layout.dim(), 11);

        let posterior = model.posterior::<Cpu>(&NdArrayDevice::Cpu);
        let lp = posterior
            .log_prob(&tensor2(&positions, &NdArrayDevice::Cpu))
            .into_data()
            .convert::<f64>()
            .to_vec::<f64>()
            .unwrap();

        for (row, got) in positions.axis_iter(Axis(0)).zip(lp) {
            let expected = model.unconstrained_log_prob(&row).unwrap();
            assert_abs_diff_eq!(got, expected, epsilon = 1e-8 * expected.abs().max(1.0));
        }
    }

    #[test]
    fn test_tensor_log_prob_matches_reference() {
        check_tensor_matches_reference(3, 2);
    }

    #[test]
    fn test_tensor_log_prob_matches_reference_three_dims() {
        check_tensor_matches_reference(2, 3);
    }

    #[test]
    fn test_tensor_log_prob_single_component() {
        check_tensor_matches_reference(1, 2);
    }

    #[test]
    fn test_layout_round_trip_through_initial_state() {
        let config = Config::default();
        let layout = Layout::new(3, 2);
        assert_eq!(layout.dim(), 2 + 6 + 9);
        let init = Parameters::initial(&config).unwrap();
        let z = layout.unconstrain(&init).unwrap();
        let back = layout.constrain(&z.view()).unwrap();
        assert_abs_diff_eq!(back.mix_probs, init.mix_probs, epsilon = 1e-12);
        assert_abs_diff_eq!(back.loc, init.loc, epsilon = 1e-12);
        assert_abs_diff_eq!(back.chol_precision, init.chol_precision, epsilon = 1e-12);
    }

    #[test]
    fn test_constrain_rejects_wrong_length() {
        let layout = Layout::new(3, 2);
        let err = layout.constrain(&Array1::zeros(4).view()).unwrap_err();
        assert!(matches!(
            err,
            BgmmError::ShapeMismatch {
                expected: 17,
                got: 4,
                ..
            }
        ));
    }

    #[test]
    fn test_empty_observations_rejected() {
        let config = Config::default();
        let err = BayesianGmm::from_config(&config, Array2::zeros((0, 2))).unwrap_err();
        assert!(matches!(
            err,
            BgmmError::InvalidConfig { ref field, .. } if field == "observations"
        ));
    }

    #[test]
    fn test_precision_from_cholesky() {
        let params = Parameters {
            mix_probs: array![1.0],
            loc: array![[0.0, 0.0]],
            chol_precision: array![[[2.0, 0.0], [1.0, 1.0]]],
        };
        assert_eq!(params.precision(), array![[[4.0, 2.0], [2.0, 2.0]]]);
    }

    #[test]
    fn test_log_likelihood_prefers_true_locations() {
        let config = Config::default();
        let obs = data::generate(&config).unwrap();
        let model = BayesianGmm::from_config(&config, obs.points).unwrap();
        let truth = Parameters::initial(&config).unwrap();
        let mut shifted = truth.clone();
        shifted.loc.mapv_inplace(|v| v + 1.5);
        assert!(model.log_likelihood(&truth) > model.log_likelihood(&shifted));
    }

    #[test]
    fn test_gradient_points_back_to_the_data() {
        type Ad = Autodiff<Cpu>;
        let mut config = Config::default();
        config.model.components = 1;
        config.data.num_observations = 50;
        let obs = data::generate(&config).unwrap();
        let model = BayesianGmm::from_config(&config, obs.points).unwrap();
        let posterior = model.posterior::<Ad>(&NdArrayDevice::Cpu);

        // Location pushed far to the right: the gradient must pull it back.
        let mut z = model
            .layout()
            .unconstrain(&Parameters::initial(&config).unwrap())
            .unwrap();
        z[0] = 5.0;
        z[1] = 5.0;
        let pos = tensor2::<Ad>(&z.insert_axis(Axis(0)), &NdArrayDevice::Cpu).require_grad();
        let lp = GradientTarget::<f64, Ad>::log_prob_batch(&posterior, &pos);
        let grads = pos.grad(&lp.backward()).unwrap();
        let g = grads.into_data().convert::<f64>().to_vec::<f64>().unwrap();
        assert!(g[0] < 0.0 && g[1] < 0.0, "gradient {g:?}");
    }
}

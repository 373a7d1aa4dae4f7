//! Convergence diagnostics for MCMC output.
//!
//! Chains are passed as `[n_draws, n_chains]` views, matching one coordinate of the
//! `[n_collect, n_chains, D]` sample layout produced by [`crate::hmc::HMC::run`].

use crate::error::{BgmmError, Result};
use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use num_traits::Num;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// Online potential scale reduction factor, updated one multi-chain state at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct RhatMulti {
    n: usize,
    mean: Array2<f64>,    // n_chains x n_params
    mean_sq: Array2<f64>, // n_chains x n_params
    n_chains: usize,
    n_params: usize,
}

impl RhatMulti {
    pub fn new(n_chains: usize, n_params: usize) -> Self {
        Self {
            n: 0,
            mean: Array2::<f64>::zeros((n_chains, n_params)),
            mean_sq: Array2::<f64>::zeros((n_chains, n_params)),
            n_chains,
            n_params,
        }
    }

    /// Number of states seen so far.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Adds one state, laid out chain-major as `[n_chains * n_params]`.
    pub fn step<T>(&mut self, x: &[T]) -> Result<()>
    where
        T: Num + num_traits::ToPrimitive + Clone,
    {
        self.n += 1;

        let n = self.n as f64;
        let x_arr = ArrayView2::<T>::from_shape((self.n_chains, self.n_params), x)?
            .mapv(|x| x.to_f64().unwrap_or(f64::NAN));

        self.mean = (self.mean.clone() * (n - 1.0) + &x_arr) / n;
        if self.n == 1 {
            self.mean_sq = x_arr.pow2();
        } else {
            self.mean_sq = (self.mean_sq.clone() * (n - 1.0) + x_arr.pow2()) / n;
        };
        Ok(())
    }

    pub fn all(&self) -> Result<Array1<f64>> {
        let mean_chain = self
            .mean
            .mean_axis(Axis(0))
            .ok_or_else(|| BgmmError::Stats("no chains to average".to_string()))?;
        let n_chains = self.mean.shape()[0] as f64;
        let n = self.n as f64;
        let fac = n / (n_chains - 1.0);
        let between = (self.mean.clone() - mean_chain.insert_axis(Axis(0)))
            .pow2()
            .sum_axis(Axis(0))
            * fac;
        let sm2 = (self.mean_sq.clone() - self.mean.pow2()) * n / (n - 1.0);
        let within = sm2
            .mean_axis(Axis(0))
            .ok_or_else(|| BgmmError::Stats("no chains to average".to_string()))?;
        let var = within.clone() * ((n - 1.0) / n) + between * (1.0 / n);
        Ok((var / within).sqrt())
    }

    pub fn max(&self) -> Result<f64> {
        let all = self.all()?;
        let max = *all.max().map_err(|e| BgmmError::Stats(e.to_string()))?;
        Ok(max)
    }
}

/// Splits each chain in half, dropping the middle draw when the length is odd.
pub fn split_chains(chains: &ArrayView2<f64>) -> Array2<f64> {
    let (n_draws, n_chains) = chains.dim();
    let half = n_draws / 2;
    let mut out = Array2::zeros((half, 2 * n_chains));
    for c in 0..n_chains {
        let chain = chains.column(c);
        out.column_mut(2 * c).assign(&chain.slice(s![..half]));
        out.column_mut(2 * c + 1)
            .assign(&chain.slice(s![n_draws - half..]));
    }
    out
}

/// Split potential scale reduction factor of a single parameter.
pub fn split_rhat(chains: &ArrayView2<f64>) -> Result<f64> {
    let split = split_chains(chains);
    let (n, m) = split.dim();
    if n < 2 {
        return Err(BgmmError::Stats(
            "Must have at least 4 draws to compute split R-hat".to_string(),
        ));
    }
    let n_f = n as f64;
    let means = split
        .mean_axis(Axis(0))
        .ok_or_else(|| BgmmError::Stats("empty chains".to_string()))?;
    let within = split.var_axis(Axis(0), 1.0).mean().unwrap_or(f64::NAN);
    let between_over_n = if m > 1 { means.var(1.0) } else { 0.0 };
    let var_plus = within * (n_f - 1.0) / n_f + between_over_n;
    Ok((var_plus / within).sqrt())
}

/// Biased autocovariance `γ_k = (1/N) Σ_t (x_t − x̄)(x_{t+k} − x̄)` for all lags, via FFT.
pub fn autocovariance(x: &ArrayView1<f64>) -> Vec<f64> {
    let n = x.len();
    if n == 0 {
        return Vec::new();
    }
    let mean = x.sum() / n as f64;
    let m = (2 * n).next_power_of_two();
    let mut buf: Vec<Complex<f64>> = x
        .iter()
        .map(|&v| Complex::new(v - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(m)
        .collect();

    let mut planner = FftPlanner::<f64>::new();
    planner.plan_fft_forward(m).process(&mut buf);
    for c in buf.iter_mut() {
        *c = Complex::new(c.norm_sqr(), 0.0);
    }
    planner.plan_fft_inverse(m).process(&mut buf);

    buf.iter()
        .take(n)
        .map(|c| c.re / (m as f64 * n as f64))
        .collect()
}

/**
Effective sample size of one parameter across chains, following the Stan reference manual:
autocorrelations are combined across chains, truncated with Geyer's initial positive
sequence and made monotone. The result is capped at `N·log10(N)` for `N` total draws.

Fails with fewer than four draws per chain, with non-finite values, or with a constant chain.
*/
pub fn effective_sample_size(chains: &ArrayView2<f64>) -> Result<f64> {
    let (num_draws, num_chains) = chains.dim();
    if num_draws < 4 || num_chains == 0 {
        return Err(BgmmError::Stats(
            "Must have at least 4 draws to compute ESS".to_string(),
        ));
    }
    if chains.iter().any(|x| !x.is_finite()) {
        return Err(BgmmError::Stats(
            "All values must be finite to compute ESS".to_string(),
        ));
    }
    let first = chains[[0, 0]];
    if chains.iter().all(|x| (x - first).abs() < 1e-10) {
        return Err(BgmmError::Stats(format!(
            "No ESS when all draws are constant (value={first})"
        )));
    }

    let n = num_draws as f64;
    let acovs: Vec<Vec<f64>> = chains.columns().into_iter().map(|c| autocovariance(&c)).collect();
    let chain_means = chains
        .mean_axis(Axis(0))
        .ok_or_else(|| BgmmError::Stats("empty chains".to_string()))?;
    let mean_var = acovs.iter().map(|a| a[0] * n / (n - 1.0)).sum::<f64>() / num_chains as f64;
    let mut var_plus = mean_var * (n - 1.0) / n;
    if num_chains > 1 {
        var_plus += chain_means.var(1.0);
    }
    let mean_acov = |lag: usize| acovs.iter().map(|a| a[lag]).sum::<f64>() / num_chains as f64;

    let mut rho_hat_s = vec![0.0; num_draws];
    let mut rho_hat_even = 1.0;
    rho_hat_s[0] = rho_hat_even;
    let mut rho_hat_odd = 1.0 - (mean_var - mean_acov(1)) / var_plus;
    rho_hat_s[1] = rho_hat_odd;

    // Geyer's initial positive sequence. The last pair of autocorrelations is kept as a bias
    // term, so the loop stops at num_draws - 4.
    let mut s = 1;
    while s < num_draws - 4 && rho_hat_even + rho_hat_odd > 0.0 {
        rho_hat_even = 1.0 - (mean_var - mean_acov(s + 1)) / var_plus;
        rho_hat_odd = 1.0 - (mean_var - mean_acov(s + 2)) / var_plus;
        if rho_hat_even + rho_hat_odd >= 0.0 {
            rho_hat_s[s + 1] = rho_hat_even;
            rho_hat_s[s + 2] = rho_hat_odd;
        }
        s += 2;
    }
    let max_s = s;
    if rho_hat_even > 0.0 {
        rho_hat_s[max_s + 1] = rho_hat_even;
    }

    // Initial monotone sequence.
    let mut s = 1;
    while max_s >= 3 && s <= max_s - 3 {
        if rho_hat_s[s + 1] + rho_hat_s[s + 2] > rho_hat_s[s - 1] + rho_hat_s[s] {
            rho_hat_s[s + 1] = (rho_hat_s[s - 1] + rho_hat_s[s]) / 2.0;
            rho_hat_s[s + 2] = rho_hat_s[s + 1];
        }
        s += 2;
    }

    let total = (num_chains * num_draws) as f64;
    let tau_hat = -1.0 + 2.0 * rho_hat_s[..max_s].iter().sum::<f64>() + rho_hat_s[max_s + 1];
    Ok((total / tau_hat).min(total * total.log10()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;
    use std::f64;

    fn run_rhat_test(data0: Array2<f64>, data1: Array2<f64>, expected: Array1<f64>, tol: f64) {
        let mut psr = RhatMulti::new(3, 4);
        psr.step(data0.as_slice().unwrap()).unwrap();
        psr.step(data1.as_slice().unwrap()).unwrap();
        let rhat = psr.all().unwrap();
        let diff = *(rhat.clone() - expected.clone()).abs().max().unwrap();
        assert!(
            diff < tol,
            "Mismatch in Rhat. Got {:?}, expected {:?}, diff = {:?}",
            rhat,
            expected,
            diff
        );
    }

    #[test]
    fn test_rhat_multi_two_states() {
        let data_step_0 = arr2(&[
            [0.0, 1.0, 0.0, 1.0], // chain 0
            [1.0, 2.0, 0.0, 2.0], // chain 1
            [0.0, 0.0, 0.0, 2.0], // chain 2
        ]);
        let data_step_1 = arr2(&[
            [1.0, 2.0, 2.0, 0.0], // chain 0
            [1.0, 1.0, 1.0, 1.0], // chain 1
            [0.0, 1.0, 0.0, 0.0], // chain 2
        ]);
        let expected = array![f64::consts::SQRT_2, 1.08012345, 0.89442719, 0.8660254];
        run_rhat_test(data_step_0, data_step_1, expected, 1e-7);
    }

    #[test]
    fn test_rhat_multi_rejects_wrong_length() {
        let mut psr = RhatMulti::new(2, 2);
        assert!(matches!(psr.step(&[1.0, 2.0, 3.0]), Err(BgmmError::Shape(_))));
    }

    fn iid_chains(n_draws: usize, n_chains: usize, seed: u64) -> Array2<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        Array2::from_shape_fn((n_draws, n_chains), |_| rng.sample(StandardNormal))
    }

    fn ar1_chains(n_draws: usize, n_chains: usize, phi: f64, seed: u64) -> Array2<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut out = Array2::zeros((n_draws, n_chains));
        for c in 0..n_chains {
            let mut x = 0.0;
            for t in 0..n_draws {
                let eps: f64 = rng.sample(StandardNormal);
                x = phi * x + eps;
                out[[t, c]] = x;
            }
        }
        out
    }

    #[test]
    fn test_autocovariance_small_sequence() {
        let acov = autocovariance(&array![1.0, 2.0, 3.0, 4.0].view());
        let expected = [1.25, 0.3125, -0.375, -0.5625];
        for (got, want) in acov.iter().zip(expected) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_ess_iid_close_to_draw_count() {
        let chains = iid_chains(1000, 4, 1);
        let ess = effective_sample_size(&chains.view()).unwrap();
        assert!((3000.0..5500.0).contains(&ess), "ess = {ess}");
    }

    #[test]
    fn test_ess_autocorrelated_much_smaller() {
        // AR(1) with φ = 0.9 has ESS ≈ N (1 − φ) / (1 + φ) ≈ 0.053 N.
        let chains = ar1_chains(2000, 4, 0.9, 2);
        let ess = effective_sample_size(&chains.view()).unwrap();
        assert!((150.0..800.0).contains(&ess), "ess = {ess}");
    }

    #[test]
    fn test_ess_errors() {
        let short = iid_chains(3, 2, 3);
        assert!(matches!(
            effective_sample_size(&short.view()),
            Err(BgmmError::Stats(_))
        ));
        let constant = Array2::from_elem((10, 2), 1.5);
        assert!(effective_sample_size(&constant.view()).is_err());
        let mut bad = iid_chains(10, 2, 4);
        bad[[3, 1]] = f64::NAN;
        assert!(effective_sample_size(&bad.view()).is_err());
    }

    #[test]
    fn test_split_chains_drops_middle() {
        let chains = array![[1.0], [2.0], [3.0], [4.0], [5.0]];
        let split = split_chains(&chains.view());
        assert_eq!(split, array![[1.0, 4.0], [2.0, 5.0]]);
    }

    #[test]
    fn test_split_rhat() {
        let good = iid_chains(1000, 4, 5);
        let rhat = split_rhat(&good.view()).unwrap();
        assert!((rhat - 1.0).abs() < 0.02, "rhat = {rhat}");

        let mut shifted = iid_chains(1000, 4, 6);
        shifted.column_mut(0).mapv_inplace(|x| x + 3.0);
        let rhat = split_rhat(&shifted.view()).unwrap();
        assert!(rhat > 1.2, "rhat = {rhat}");
    }
}

//! A data-parallel Hamiltonian Monte Carlo sampler using the `burn` crate for autodiff.
//!
//! All chains live in one `[n_chains, D]` tensor and are moved together: momenta are drawn,
//! the leapfrog integrator simulates Hamiltonian dynamics, and each chain independently
//! accepts or rejects its proposal with the Metropolis criterion. During warm-up the step size
//! can be tuned towards a target acceptance probability (see [`StepSizeAdaptation`]).

use crate::error::{BgmmError, Result};
use crate::stats::RhatMulti;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array2, Array3};
use num_traits::Float;
use rand::prelude::*;
use rand_distr::StandardNormal;
use std::collections::VecDeque;

/// A batched target trait for computing the unnormalized log probability (and, through
/// autodiff, its gradient) for a collection of positions.
///
/// # Type Parameters
///
/// * `T`: The floating-point type (e.g., f32 or f64).
/// * `B`: The autodiff backend from the `burn` crate.
pub trait GradientTarget<T: Float, B: AutodiffBackend> {
    /// Compute the log probability for a batch of positions.
    ///
    /// # Parameters
    ///
    /// * `positions`: A tensor of shape `[n_chains, D]` representing the current positions for each chain.
    ///
    /// # Returns
    ///
    /// A 1D tensor of shape `[n_chains]` containing the log probabilities for each chain.
    fn log_prob_batch(&self, positions: &Tensor<B, 2>) -> Tensor<B, 1>;
}

/// Multiplicative step-size tuning applied during the first `num_adaptation_steps` transitions.
///
/// After each adapted transition the acceptance probability `min(1, exp(log_accept_ratio))` is
/// averaged over chains. Above `target_accept_prob` the step size grows by a factor
/// `1 + adaptation_rate`, otherwise it shrinks by the same factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSizeAdaptation<T> {
    pub num_adaptation_steps: usize,
    pub target_accept_prob: T,
    pub adaptation_rate: T,
}

/// Outcome of a single transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StepInfo<T> {
    /// Per-chain acceptance decision.
    pub is_accepted: Vec<bool>,
    /// Per-chain `H(current) − H(proposed)`.
    pub log_accept_ratio: Vec<T>,
    /// Step size the transition was integrated with.
    pub step_size: T,
}

/// Collected output of [`HMC::run`].
#[derive(Debug, Clone)]
pub struct Trace<B: Backend, T> {
    /// Positions, `[n_collect, n_chains, D]`.
    pub samples: Tensor<B, 3>,
    /// `[n_collect, n_chains]`
    pub is_accepted: Array2<bool>,
    /// Step size in effect at the end of the run.
    pub step_size: T,
}

impl<B: Backend, T> Trace<B, T> {
    /// Copies the samples to the host as `[n_collect, n_chains, D]`.
    pub fn samples_array(&self) -> Result<Array3<f64>> {
        let [s, c, d] = self.samples.dims();
        let flat = self
            .samples
            .to_data()
            .convert::<f64>()
            .to_vec::<f64>()
            .map_err(|e| BgmmError::Tensor(format!("{e:?}")))?;
        Ok(Array3::from_shape_vec((s, c, d), flat)?)
    }

    /// Fraction of accepted transitions over all collected steps and chains.
    pub fn acceptance_rate(&self) -> f64 {
        if self.is_accepted.is_empty() {
            return 0.0;
        }
        self.is_accepted.iter().filter(|&&a| a).count() as f64 / self.is_accepted.len() as f64
    }
}

/// A data-parallel Hamiltonian Monte Carlo (HMC) sampler.
///
/// # Type Parameters
///
/// * `T`: Floating-point type for numerical calculations.
/// * `B`: Autodiff backend from the `burn` crate.
/// * `GTarget`: The target distribution type implementing the `GradientTarget` trait.
#[derive(Debug, Clone)]
pub struct HMC<T, B, GTarget>
where
    B: AutodiffBackend,
{
    /// The target distribution which provides log probability evaluations and gradients.
    pub target: GTarget,
    /// The step size for the leapfrog integrator.
    pub step_size: T,
    /// The number of leapfrog steps to take per HMC update.
    pub n_leapfrog: usize,
    /// The current positions for all chains, stored as a tensor of shape `[n_chains, D]`.
    pub positions: Tensor<B, 2>,
    /// Optional warm-up tuning of `step_size`.
    pub adaptation: Option<StepSizeAdaptation<T>>,
    /// Source of momenta and acceptance uniforms.
    pub rng: SmallRng,
    n_steps: usize,
}

impl<T, B, GTarget> HMC<T, B, GTarget>
where
    T: Float
        + burn::tensor::ElementConversion
        + burn::tensor::Element
        + rand_distr::uniform::SampleUniform
        + num_traits::FromPrimitive,
    B: AutodiffBackend,
    GTarget: GradientTarget<T, B>,
    StandardNormal: rand::distributions::Distribution<T>,
    rand_distr::Standard: rand_distr::Distribution<T>,
{
    /// Create a new data-parallel HMC sampler.
    ///
    /// # Parameters
    ///
    /// * `target`: The target distribution implementing the `GradientTarget` trait.
    /// * `initial_positions`: Initial position of each chain, with shape `[n_chains][D]`.
    /// * `step_size`: The step size used in the leapfrog integrator.
    /// * `n_leapfrog`: The number of leapfrog steps per update.
    pub fn new(
        target: GTarget,
        initial_positions: Vec<Vec<T>>,
        step_size: T,
        n_leapfrog: usize,
    ) -> Self {
        let n_chains = initial_positions.len();
        let dim = initial_positions.first().map_or(0, Vec::len);
        let td: TensorData = TensorData::new(
            initial_positions.into_iter().flatten().collect::<Vec<T>>(),
            [n_chains, dim],
        );
        let positions = Tensor::<B, 2>::from_data(td, &B::Device::default());
        let rng = SmallRng::seed_from_u64(thread_rng().gen::<u64>());
        Self {
            target,
            step_size,
            n_leapfrog,
            positions,
            adaptation: None,
            rng,
            n_steps: 0,
        }
    }

    /// Sets a new random seed.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Moves the chain positions to `device`. New positions are created on the backend's default
    /// device, so call this when the target's tensors live elsewhere.
    pub fn to_device(mut self, device: &B::Device) -> Self {
        self.positions = self.positions.to_device(device);
        self
    }

    /// Enables step-size adaptation for the first transitions of the run.
    pub fn with_adaptation(mut self, adaptation: StepSizeAdaptation<T>) -> Self {
        self.adaptation = Some(adaptation);
        self
    }

    /// Run the sampler for `n_collect` + `n_discard` steps.
    ///
    /// The first `n_discard` transitions are burn-in and are not recorded. The remaining
    /// positions are returned as a tensor of shape `[n_collect, n_chains, D]` together with the
    /// per-step acceptance decisions.
    pub fn run(&mut self, n_collect: usize, n_discard: usize) -> Result<Trace<B, T>> {
        for _ in 0..n_discard {
            self.step()?;
        }

        let n_chains = self.positions.dims()[0];
        let mut samples = Vec::with_capacity(n_collect);
        let mut accepted = Vec::with_capacity(n_collect * n_chains);
        for _ in 0..n_collect {
            let info = self.step()?;
            accepted.extend(info.is_accepted);
            samples.push(self.positions.clone());
        }
        self.finish(samples, accepted, n_collect, n_chains)
    }

    /// Like [`HMC::run`], but displays a progress bar with the acceptance probability over a
    /// sliding window of 100 iterations, the current step size and, with more than one chain,
    /// the maximum potential scale reduction factor, see [Stan Reference Manual.][1]
    ///
    /// [1]: https://mc-stan.org/docs/2_18/reference-manual/notation-for-samples-chains-and-draws.html
    pub fn run_progress(&mut self, n_collect: usize, n_discard: usize) -> Result<Trace<B, T>> {
        let (n_chains, dim) = (self.positions.dims()[0], self.positions.dims()[1]);

        let pb = ProgressBar::new((n_discard + n_collect) as u64);
        let style = ProgressStyle::default_bar()
            .template("{prefix:8} {bar:40.white} ETA {eta:3} | {msg}")
            .map_err(|e| BgmmError::Stats(e.to_string()))?
            .progress_chars("=>-");
        pb.set_style(style);
        pb.set_prefix("Warmup");

        let window_size = 100;
        let mut accept_window: VecDeque<f64> = VecDeque::with_capacity(window_size);
        let mut push_window = |info: &StepInfo<T>| {
            let rate = info.is_accepted.iter().filter(|&&a| a).count() as f64 / n_chains as f64;
            accept_window.push_front(rate);
            if accept_window.len() > window_size {
                accept_window.pop_back();
            }
            accept_window.iter().sum::<f64>() / accept_window.len() as f64
        };

        for _ in 0..n_discard {
            let info = self.step()?;
            let p_accept = push_window(&info);
            pb.inc(1);
            pb.set_message(format!(
                "p(accept)≈{:.2} step≈{:.4}",
                p_accept,
                as_f64(info.step_size)
            ));
        }

        pb.set_prefix("HMC");
        let mut psr = RhatMulti::new(n_chains, dim);
        let mut samples = Vec::with_capacity(n_collect);
        let mut accepted = Vec::with_capacity(n_collect * n_chains);
        for _ in 0..n_collect {
            let info = self.step()?;
            let p_accept = push_window(&info);
            accepted.extend(info.is_accepted.iter().copied());
            samples.push(self.positions.clone());

            let state = self.positions.to_data().convert::<f64>();
            let state = state
                .as_slice::<f64>()
                .map_err(|e| BgmmError::Tensor(format!("{e:?}")))?;
            psr.step(state)?;

            pb.inc(1);
            if n_chains > 1 && psr.n() > 1 {
                pb.set_message(format!(
                    "p(accept)≈{:.2} max(rhat)≈{:.2}",
                    p_accept,
                    psr.max()?
                ));
            } else {
                pb.set_message(format!("p(accept)≈{:.2}", p_accept));
            }
        }
        pb.finish_with_message("Done!");
        self.finish(samples, accepted, n_collect, n_chains)
    }

    fn finish(
        &self,
        samples: Vec<Tensor<B, 2>>,
        accepted: Vec<bool>,
        n_collect: usize,
        n_chains: usize,
    ) -> Result<Trace<B, T>> {
        let samples = if samples.is_empty() {
            Tensor::<B, 3>::zeros(
                [0, n_chains, self.positions.dims()[1]],
                &self.positions.device(),
            )
        } else {
            Tensor::stack(samples, 0)
        };
        let trace = Trace {
            samples,
            is_accepted: Array2::from_shape_vec((n_collect, n_chains), accepted)?,
            step_size: self.step_size,
        };
        log::info!(
            "HMC collected {} draws from {} chains, acceptance rate {:.3}, final step size {:.4}",
            n_collect,
            n_chains,
            trace.acceptance_rate(),
            as_f64(self.step_size)
        );
        Ok(trace)
    }

    /// Perform one batched HMC update for all chains in parallel.
    ///
    /// The update consists of:
    /// 1) Sampling momenta from a standard normal distribution.
    /// 2) Running the leapfrog integrator to propose new positions.
    /// 3) Performing an accept/reject step for each chain. Proposals whose energy is not finite
    ///    are always rejected.
    /// 4) Adapting the step size, while adaptation is active.
    ///
    /// This method updates `self.positions` in-place.
    pub fn step(&mut self) -> Result<StepInfo<T>> {
        let [n_chains, dim] = self.positions.dims();
        let device = self.positions.device();
        let step_size = self.step_size;

        // 1) Sample momenta: shape [n_chains, D]
        let momentum_0 = self.standard_normal([n_chains, dim], &device);

        // Hamiltonian at the current state: -logp + kinetic energy, shape [n_chains]
        let logp_current = self.target.log_prob_batch(&self.positions).detach();
        let h_current = -logp_current + kinetic_energy(momentum_0.clone());

        // 2) Run the leapfrog integrator.
        let (proposed_positions, proposed_momenta, logp_proposed) =
            self.leapfrog(self.positions.clone(), momentum_0)?;
        let h_proposed = -logp_proposed + kinetic_energy(proposed_momenta);

        // 3) Accept/Reject each proposal.
        let log_accept_ratio: Vec<T> = h_current
            .sub(h_proposed)
            .into_data()
            .convert::<T>()
            .to_vec::<T>()
            .map_err(|e| BgmmError::Tensor(format!("{e:?}")))?;
        let is_accepted: Vec<bool> = log_accept_ratio
            .iter()
            .map(|&a| {
                let u: T = self.rng.gen();
                a.is_finite() && a >= u.ln()
            })
            .collect();

        let accept_mask = Tensor::<B, 1, Bool>::from_data(
            TensorData::new(is_accepted.clone(), [n_chains]),
            &device,
        );
        let accept_mask_big: Tensor<B, 2, Bool> =
            accept_mask.unsqueeze_dim::<2>(1).expand([n_chains, dim]);

        // Update positions: for accepted chains, replace current positions with proposed positions.
        self.positions.inplace(|x| {
            x.mask_where(accept_mask_big, proposed_positions)
                .detach()
        });

        // 4) Tune the step size.
        if let Some(adaptation) = self.adaptation {
            if self.n_steps < adaptation.num_adaptation_steps {
                self.adapt_step_size(&adaptation, &log_accept_ratio);
            }
        }
        self.n_steps += 1;

        Ok(StepInfo {
            is_accepted,
            log_accept_ratio,
            step_size,
        })
    }

    fn adapt_step_size(&mut self, adaptation: &StepSizeAdaptation<T>, log_accept_ratio: &[T]) {
        let n = T::from_usize(log_accept_ratio.len()).unwrap_or_else(T::one);
        let mean_accept = log_accept_ratio
            .iter()
            .map(|&a| {
                if a.is_nan() {
                    T::zero()
                } else {
                    a.min(T::zero()).exp()
                }
            })
            .fold(T::zero(), |acc, p| acc + p)
            / n;
        let factor = T::one() + adaptation.adaptation_rate;
        if mean_accept > adaptation.target_accept_prob {
            self.step_size = self.step_size * factor;
        } else {
            self.step_size = self.step_size / factor;
        }
    }

    fn standard_normal(&mut self, shape: [usize; 2], device: &B::Device) -> Tensor<B, 2> {
        let data: Vec<T> = (0..shape[0] * shape[1])
            .map(|_| self.rng.sample(StandardNormal))
            .collect();
        Tensor::<B, 2>::from_data(TensorData::new(data, shape), device)
    }

    /// Log probability and its gradient at `pos`, both detached from the graph.
    fn log_prob_and_grad(&self, pos: &Tensor<B, 2>) -> Result<(Tensor<B, 1>, Tensor<B, 2>)> {
        let logp = self.target.log_prob_batch(pos);
        let grads = logp.backward();
        let grad = pos
            .grad(&grads)
            .map(Tensor::<B, 2>::from_inner)
            .ok_or(BgmmError::MissingGradient)?;
        Ok((logp.detach(), grad))
    }

    /// Perform the leapfrog integrator steps in a batched manner.
    ///
    /// Each of the `n_leapfrog` iterations is a half-step of the momentum, a full step of the
    /// positions and another half-step of the momentum. The gradient at the end of one
    /// iteration is reused at the start of the next.
    ///
    /// # Returns
    ///
    /// The new positions and momenta (shape `[n_chains, D]`) and the log probability at the
    /// new positions (shape `[n_chains]`).
    fn leapfrog(
        &self,
        pos: Tensor<B, 2>,
        mut mom: Tensor<B, 2>,
    ) -> Result<(Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 1>)> {
        let half_step = self.step_size / (T::one() + T::one());
        let mut pos = pos.detach().require_grad();
        let (mut logp, mut grad) = self.log_prob_and_grad(&pos)?;
        for _ in 0..self.n_leapfrog {
            mom = mom + grad.mul_scalar(half_step);
            pos = (pos.detach() + mom.clone().mul_scalar(self.step_size))
                .detach()
                .require_grad();
            (logp, grad) = self.log_prob_and_grad(&pos)?;
            mom = mom + grad.clone().mul_scalar(half_step);
        }
        Ok((pos.detach(), mom.detach(), logp))
    }
}

fn as_f64<T: num_traits::ToPrimitive>(x: T) -> f64 {
    x.to_f64().unwrap_or(f64::NAN)
}

/// `0.5 * Σ_d p_d²` for each chain.
fn kinetic_energy<B: Backend>(momentum: Tensor<B, 2>) -> Tensor<B, 1> {
    momentum
        .powi_scalar(2)
        .sum_dim(1)
        .squeeze::<1>(1)
        .mul_scalar(0.5)
}

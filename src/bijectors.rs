//! Bijections between the unconstrained space the sampler moves in and the constrained
//! parameter space of the mixture.
//!
//! The `f64` methods here are used to build initial states and to map sampled positions back
//! to parameters. The batched tensor versions used during sampling live in
//! [`crate::model::GmmPosterior`] and are built from the scatter matrices of [`FillScaleTriL`].

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Numerically stable `ln(1 + eˣ)`.
pub fn softplus(x: f64) -> f64 {
    if x > 30.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

/// Inverse of [`softplus`], `ln(eʸ − 1)`, defined for `y > 0`.
pub fn softplus_inverse(y: f64) -> f64 {
    if y > 30.0 {
        y
    } else {
        y.exp_m1().ln()
    }
}

/// Numerically stable `ln σ(x)`, the log-derivative of [`softplus`].
pub fn log_sigmoid(x: f64) -> f64 {
    -softplus(-x)
}

/// Maps `ℝ^{K−1}` onto the `K`-simplex by appending a zero logit and applying softmax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SoftmaxCentered;

impl SoftmaxCentered {
    pub fn forward(&self, z: &ArrayView1<f64>) -> Array1<f64> {
        let max = z.iter().copied().fold(0.0_f64, f64::max);
        let mut p: Array1<f64> = z
            .iter()
            .copied()
            .chain(std::iter::once(0.0))
            .map(|v| (v - max).exp())
            .collect();
        let total = p.sum();
        p.mapv_inplace(|v| v / total);
        p
    }

    pub fn inverse(&self, p: &ArrayView1<f64>) -> Array1<f64> {
        let k = p.len();
        let last = p[k - 1].ln();
        p.iter().take(k - 1).map(|&pk| pk.ln() - last).collect()
    }

    /// `ln|det J|` of the forward map restricted to the first `K − 1` weights, `Σ_k ln p_k`.
    pub fn forward_log_det_jacobian(&self, z: &ArrayView1<f64>) -> f64 {
        if z.is_empty() {
            return 0.0;
        }
        self.forward(z).iter().map(|p| p.ln()).sum()
    }
}

/// Maps `ℝ^{d(d+1)/2}` onto lower-triangular matrices with a positive diagonal.
///
/// The vector fills the lower triangle row by row, `(0,0), (1,0), (1,1), (2,0), …`, and the
/// diagonal is passed through [`softplus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillScaleTriL {
    pub dims: usize,
}

impl FillScaleTriL {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    /// Number of free entries, `d(d+1)/2`.
    pub fn tril_len(&self) -> usize {
        self.dims * (self.dims + 1) / 2
    }

    /// `(row, col)` of each vector entry, in fill order.
    pub fn tril_indices(&self) -> impl Iterator<Item = (usize, usize)> {
        (0..self.dims).flat_map(|i| (0..=i).map(move |j| (i, j)))
    }

    pub fn forward(&self, raw: &ArrayView1<f64>) -> Array2<f64> {
        let mut chol = Array2::zeros((self.dims, self.dims));
        for (v, (i, j)) in raw.iter().zip(self.tril_indices()) {
            chol[[i, j]] = if i == j { softplus(*v) } else { *v };
        }
        chol
    }

    pub fn inverse(&self, chol: &ArrayView2<f64>) -> Array1<f64> {
        self.tril_indices()
            .map(|(i, j)| {
                let v = chol[[i, j]];
                if i == j {
                    softplus_inverse(v)
                } else {
                    v
                }
            })
            .collect()
    }

    pub fn forward_log_det_jacobian(&self, raw: &ArrayView1<f64>) -> f64 {
        raw.iter()
            .zip(self.tril_indices())
            .filter(|(_, (i, j))| i == j)
            .map(|(v, _)| log_sigmoid(*v))
            .sum()
    }

    /// `[m, d]` selector: `raw · S` yields the raw diagonal entries.
    pub fn diag_select(&self) -> Array2<f64> {
        let mut s = Array2::zeros((self.tril_len(), self.dims));
        for (idx, (i, j)) in self.tril_indices().enumerate() {
            if i == j {
                s[[idx, i]] = 1.0;
            }
        }
        s
    }

    /// `[m, d·d]` scatter placing the off-diagonal raw entries at their row-major position.
    pub fn offdiag_scatter(&self) -> Array2<f64> {
        let d = self.dims;
        let mut s = Array2::zeros((self.tril_len(), d * d));
        for (idx, (i, j)) in self.tril_indices().enumerate() {
            if i != j {
                s[[idx, i * d + j]] = 1.0;
            }
        }
        s
    }

    /// `[d, d·d]` scatter placing diagonal values at their row-major position.
    pub fn diag_scatter(&self) -> Array2<f64> {
        let d = self.dims;
        let mut s = Array2::zeros((d, d * d));
        for j in 0..d {
            s[[j, j * d + j]] = 1.0;
        }
        s
    }
}

//! Synthetic observations drawn around known component locations.

use crate::config::Config;
use crate::distributions::Categorical;
use crate::error::Result;
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Generated data together with the hidden component of every point.
#[derive(Debug, Clone, PartialEq)]
pub struct Observations {
    /// `[N, d]`
    pub points: Array2<f64>,
    pub components: Vec<usize>,
}

/// Draws `data.num_observations` points. Each point picks a component uniformly at random and
/// adds isotropic Gaussian noise of scale `data.noise_scale` to that component's true location.
pub fn generate(config: &Config) -> Result<Observations> {
    let true_loc = config.true_loc()?;
    let (n, d) = (config.data.num_observations, config.model.dims);
    let mut rng = SmallRng::seed_from_u64(config.data.seed);
    let mut picker = Categorical::uniform(config.model.components).set_seed(rng.gen());

    let components: Vec<usize> = (0..n).map(|_| picker.sample()).collect();
    let mut points = Array2::zeros((n, d));
    for (mut row, &k) in points.rows_mut().into_iter().zip(&components) {
        for (x, &mu) in row.iter_mut().zip(true_loc.row(k)) {
            let eps: f64 = rng.sample(StandardNormal);
            *x = mu + config.data.noise_scale * eps;
        }
    }
    log::debug!("Generated {n} observations in {d} dimensions");
    Ok(Observations { points, components })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Axis;

    #[test]
    fn test_shapes_and_labels() {
        let config = Config::default();
        let obs = generate(&config).unwrap();
        assert_eq!(obs.points.dim(), (1000, 2));
        assert_eq!(obs.components.len(), 1000);
        assert!(obs.components.iter().all(|&k| k < 3));
        for k in 0..3 {
            let count = obs.components.iter().filter(|&&c| c == k).count();
            assert!((250..420).contains(&count), "component {k}: {count}");
        }
    }

    #[test]
    fn test_seeded_runs_repeat() {
        let config = Config::default();
        assert_eq!(generate(&config).unwrap(), generate(&config).unwrap());

        let mut other = config.clone();
        other.data.seed += 1;
        assert_ne!(generate(&config).unwrap(), generate(&other).unwrap());
    }

    #[test]
    fn test_points_cluster_around_true_locations() {
        let config = Config::default();
        let obs = generate(&config).unwrap();
        let true_loc = config.true_loc().unwrap();
        for k in 0..3 {
            let rows: Vec<usize> = (0..obs.components.len())
                .filter(|&i| obs.components[i] == k)
                .collect();
            let mean = obs
                .points
                .select(Axis(0), &rows)
                .mean_axis(Axis(0))
                .unwrap();
            for j in 0..2 {
                assert!((mean[j] - true_loc[[k, j]]).abs() < 0.2, "mean {mean:?}");
            }
        }
    }
}

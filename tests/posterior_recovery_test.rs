//! End-to-end check: simulate a three-component mixture, sample its posterior with HMC and
//! verify that the posterior means land near the locations the data was drawn from.

use bgmm_hmc::config::Config;
use bgmm_hmc::data;
use bgmm_hmc::hmc::{StepSizeAdaptation, HMC};
use bgmm_hmc::model::{BayesianGmm, Parameters};
use bgmm_hmc::posterior::PosteriorDraws;
use burn::backend::{Autodiff, NdArray};
use ndarray::Axis;

type BackendType = Autodiff<NdArray<f64>>;

const SEED: u64 = 42;

fn small_config() -> Config {
    let mut config = Config::default();
    config.data.num_observations = 300;
    config.sampler.num_results = 300;
    config.sampler.num_burnin_steps = 300;
    config.sampler.num_adaptation_steps = 250;
    config.sampler.num_chains = 2;
    config.sampler.seed = Some(SEED);
    config.sampler.progress = false;
    config.validate().unwrap();
    config
}

fn sample(config: &Config) -> (BayesianGmm, PosteriorDraws) {
    let observations = data::generate(config).unwrap();
    let model = BayesianGmm::from_config(config, observations.points).unwrap();
    let layout = model.layout();
    let initial = layout
        .unconstrain(&Parameters::initial(config).unwrap())
        .unwrap()
        .to_vec();

    let s = &config.sampler;
    let mut hmc = HMC::<f64, BackendType, _>::new(
        model.posterior::<BackendType>(&Default::default()),
        vec![initial; s.num_chains],
        s.step_size,
        s.num_leapfrog_steps,
    )
    .with_adaptation(StepSizeAdaptation {
        num_adaptation_steps: s.num_adaptation_steps,
        target_accept_prob: s.target_accept_prob,
        adaptation_rate: s.adaptation_rate,
    })
    .set_seed(SEED);

    let trace = hmc.run(s.num_results, s.num_burnin_steps).unwrap();
    assert_eq!(trace.is_accepted.dim(), (s.num_results, s.num_chains));
    let draws = PosteriorDraws::from_trace(&trace, &layout).unwrap();
    (model, draws)
}

#[test]
fn test_posterior_recovers_true_locations() {
    let config = small_config();
    let (model, draws) = sample(&config);
    let summary = draws.summary().unwrap();
    println!("{summary}");

    assert_eq!(draws.len(), 600);
    assert!(
        (0.3..=1.0).contains(&summary.acceptance_rate),
        "acceptance rate {}",
        summary.acceptance_rate
    );
    assert!((summary.mean_mix_probs.sum() - 1.0).abs() < 1e-9);
    for &w in summary.mean_mix_probs.iter() {
        assert!((0.15..0.55).contains(&w), "mixture weights {}", summary.mean_mix_probs);
    }

    let true_loc = config.true_loc().unwrap();
    for (mean, truth) in summary
        .mean_loc
        .axis_iter(Axis(0))
        .zip(true_loc.axis_iter(Axis(0)))
    {
        for (m, t) in mean.iter().zip(truth.iter()) {
            assert!((m - t).abs() < 0.5, "posterior mean {mean} vs truth {truth}");
        }
    }

    // Unit-variance noise: every recovered precision should be of order one.
    for prec in summary.precision.axis_iter(Axis(0)) {
        for j in 0..2 {
            assert!((0.4..2.5).contains(&prec[[j, j]]), "precision {prec}");
        }
    }

    // Draws are finite and carry a finite joint density.
    for p in draws.draws.iter().step_by(50) {
        assert!(model.joint_log_prob(p).is_finite());
    }
}

#[test]
fn test_seeded_runs_are_reproducible() {
    let mut config = small_config();
    config.data.num_observations = 60;
    config.sampler.num_results = 20;
    config.sampler.num_burnin_steps = 10;
    config.sampler.num_adaptation_steps = 10;

    let (_, a) = sample(&config);
    let (_, b) = sample(&config);
    assert_eq!(a.is_accepted, b.is_accepted);
    for (pa, pb) in a.draws.iter().zip(&b.draws) {
        assert_eq!(pa, pb);
    }
}

#[test]
fn test_one_dimensional_run_writes_both_plots() {
    let mut config = small_config();
    config.model.dims = 1;
    config.data.num_observations = 50;
    config.sampler.num_results = 10;
    config.sampler.num_burnin_steps = 2;
    config.sampler.num_adaptation_steps = 2;
    config.validate().unwrap();

    let observations = data::generate(&config).unwrap();
    let (_, draws) = sample(&config);
    let dir = tempfile::tempdir().unwrap();
    bgmm_hmc::plot::plot_locations(&observations, &draws, dir.path().join("locations.svg"))
        .unwrap();
    bgmm_hmc::plot::plot_mix_probs(&draws, dir.path().join("mix_probs.svg")).unwrap();
    assert!(dir.path().join("locations.svg").exists());
    assert!(dir.path().join("mix_probs.svg").exists());
}

#[test]
fn test_empty_data_is_an_error_not_a_panic() {
    let mut config = small_config();
    config.data.num_observations = 0;
    assert!(config.validate().is_err());

    let observations = data::generate(&config).unwrap();
    assert!(BayesianGmm::from_config(&config, observations.points).is_err());
}

//! `bgmm`: fits a Bayesian Gaussian mixture to synthetic data with Hamiltonian Monte Carlo.

use anyhow::Context;
use bgmm_hmc::config::Config;
use bgmm_hmc::data;
use bgmm_hmc::hmc::{StepSizeAdaptation, HMC};
use bgmm_hmc::model::{BayesianGmm, Parameters};
use bgmm_hmc::plot;
use bgmm_hmc::posterior::PosteriorDraws;
use burn::backend::{Autodiff, NdArray};
use burn::prelude::Backend;
use std::fs;
use std::path::PathBuf;
use structopt::StructOpt;

type BackendType = Autodiff<NdArray<f64>>;

/// Sample the posterior of a Bayesian Gaussian mixture model with HMC
#[derive(StructOpt, Debug)]
#[structopt(name = "bgmm")]
struct Opt {
    /// JSON configuration file; missing fields take their defaults
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Directory receiving CSV files and plots
    #[structopt(short, long, parse(from_os_str))]
    output_dir: Option<PathBuf>,

    /// Seed of the sampler's random number generator
    #[structopt(short, long)]
    seed: Option<u64>,

    #[structopt(long)]
    num_results: Option<usize>,

    #[structopt(long)]
    num_burnin_steps: Option<usize>,

    #[structopt(long)]
    num_chains: Option<usize>,

    /// Skip writing the SVG plots
    #[structopt(long)]
    no_plot: bool,

    /// Skip writing the CSV files
    #[structopt(long)]
    no_csv: bool,

    /// Only log warnings and hide the progress bar
    #[structopt(short, long)]
    quiet: bool,
}

impl Opt {
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_path(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(dir) = &self.output_dir {
            config.output.directory = dir.clone();
        }
        if let Some(seed) = self.seed {
            config.sampler.seed = Some(seed);
        }
        if let Some(n) = self.num_results {
            config.sampler.num_results = n;
        }
        if let Some(n) = self.num_burnin_steps {
            config.sampler.num_burnin_steps = n;
        }
        if let Some(n) = self.num_chains {
            config.sampler.num_chains = n;
        }
        if self.no_plot {
            config.output.plot = false;
        }
        if self.no_csv {
            config.output.save_csv = false;
        }
        if self.quiet {
            config.sampler.progress = false;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    let default_level = if opt.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let config = opt.load_config()?;
    let sampler = &config.sampler;

    let observations = data::generate(&config)?;
    log::info!(
        "Generated {} observations from {} components",
        observations.points.nrows(),
        config.model.components
    );

    let model = BayesianGmm::from_config(&config, observations.points.clone())?;
    let layout = model.layout();
    let device = <BackendType as Backend>::Device::default();
    let target = model.posterior::<BackendType>(&device);

    let initial = layout.unconstrain(&Parameters::initial(&config)?)?.to_vec();
    let initial_positions = vec![initial; sampler.num_chains];

    let mut hmc = HMC::<f64, BackendType, _>::new(
        target,
        initial_positions,
        sampler.step_size,
        sampler.num_leapfrog_steps,
    )
    .to_device(&device)
    .with_adaptation(StepSizeAdaptation {
        num_adaptation_steps: sampler.num_adaptation_steps,
        target_accept_prob: sampler.target_accept_prob,
        adaptation_rate: sampler.adaptation_rate,
    });
    if let Some(seed) = sampler.seed {
        hmc = hmc.set_seed(seed);
    }

    log::info!(
        "Running {} chains: {} burn-in steps, {} results, {} leapfrog steps",
        sampler.num_chains,
        sampler.num_burnin_steps,
        sampler.num_results,
        sampler.num_leapfrog_steps
    );
    let trace = if sampler.progress {
        hmc.run_progress(sampler.num_results, sampler.num_burnin_steps)?
    } else {
        hmc.run(sampler.num_results, sampler.num_burnin_steps)?
    };

    let draws = PosteriorDraws::from_trace(&trace, &layout)?;
    let summary = draws.summary()?;
    println!("{summary}");

    let out = &config.output.directory;
    if config.output.save_csv || config.output.plot {
        fs::create_dir_all(out)
            .with_context(|| format!("creating output directory {}", out.display()))?;
    }

    if config.output.save_csv {
        #[cfg(feature = "csv")]
        {
            use bgmm_hmc::io::csv::{save_csv_tensor, save_draws_csv, save_observations_csv};
            save_draws_csv(&draws, out.join("draws.csv"))?;
            save_observations_csv(&observations, out.join("observations.csv"))?;
            save_csv_tensor::<BackendType, _, f64, _>(&trace.samples, out.join("unconstrained.csv"))?;
            log::info!("Saved CSV files to {}", out.display());
        }
        #[cfg(not(feature = "csv"))]
        log::warn!("Built without the `csv` feature; skipping CSV output");
    }

    if config.output.plot {
        plot::plot_locations(&observations, &draws, out.join("locations.svg"))?;
        plot::plot_mix_probs(&draws, out.join("mix_probs.svg"))?;
    }

    Ok(())
}

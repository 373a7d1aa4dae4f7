/*!
# CSV export of posterior draws and observations

Enable via the `csv` feature (on by default).
*/

use crate::data::Observations;
use crate::error::{BgmmError, Result};
use crate::posterior::PosteriorDraws;
use burn::prelude::*;
use csv::Writer;
use std::fs::File;
use std::path::Path;

/// Column names of [`save_draws_csv`] for `k` components in `d` dimensions.
pub fn draws_header(k: usize, d: usize) -> Vec<String> {
    let mut header = vec!["sample".to_string(), "chain".to_string()];
    header.extend((0..k).map(|c| format!("mix_probs_{c}")));
    for c in 0..k {
        header.extend((0..d).map(|j| format!("loc_{c}_{j}")));
    }
    for c in 0..k {
        for i in 0..d {
            header.extend((0..=i).map(|j| format!("chol_precision_{c}_{i}_{j}")));
        }
    }
    header
}

/**
Saves constrained posterior draws as a CSV file.

Each row holds one draw of one chain: the sample and chain index, the mixture weights, the
component locations (row-major) and the lower triangle of each component's precision
Cholesky factor (row-major).

# Example

```rust,no_run
# fn main() -> bgmm_hmc::Result<()> {
# let draws: bgmm_hmc::posterior::PosteriorDraws = unimplemented!();
bgmm_hmc::io::csv::save_draws_csv(&draws, "/tmp/draws.csv")?;
# Ok(())
# }
```
*/
pub fn save_draws_csv<P: AsRef<Path>>(draws: &PosteriorDraws, filename: P) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(filename)?);
    let Some(first) = draws.draws.first() else {
        wtr.flush()?;
        return Ok(());
    };
    let (k, d) = first.loc.dim();
    wtr.write_record(draws_header(k, d))?;

    for sample in 0..draws.n_results {
        for chain in 0..draws.n_chains {
            let p = draws
                .get(sample, chain)
                .ok_or_else(|| BgmmError::Stats(format!("missing draw {sample}/{chain}")))?;
            let mut row = vec![sample.to_string(), chain.to_string()];
            row.extend(p.mix_probs.iter().map(|v| v.to_string()));
            row.extend(p.loc.iter().map(|v| v.to_string()));
            for chol in p.chol_precision.outer_iter() {
                for i in 0..d {
                    row.extend((0..=i).map(|j| chol[[i, j]].to_string()));
                }
            }
            wtr.write_record(&row)?;
        }
    }

    wtr.flush()?;
    Ok(())
}

/// Saves the generated observations with their hidden component as a CSV file with columns
/// `component, x_0, x_1, …`.
pub fn save_observations_csv<P: AsRef<Path>>(observations: &Observations, filename: P) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(filename)?);
    let d = observations.points.ncols();
    let mut header = vec!["component".to_string()];
    header.extend((0..d).map(|j| format!("x_{j}")));
    wtr.write_record(&header)?;

    for (point, k) in observations.points.rows().into_iter().zip(&observations.components) {
        let mut row = vec![k.to_string()];
        row.extend(point.iter().map(|v| v.to_string()));
        wtr.write_record(&row)?;
    }

    wtr.flush()?;
    Ok(())
}

/**
Saves a 3D Burn tensor (sample × chain × dimension) as a CSV file.

The header row is `sample, chain, dim_0, dim_1, …`. Coordinate `d` of the draw that chain `c`
produced at sample `s` is read from `tensor[s][c][d]`. This is used for the raw, unconstrained
sampler state.

# Example
```rust
use burn::tensor::Tensor;
use burn::backend::ndarray::{NdArray, NdArrayDevice};
use bgmm_hmc::io::csv::save_csv_tensor;
let tensor = Tensor::<NdArray, 3>::from_floats(
    [
        [[1.0, 2.0], [1.1, 2.1]],
        [[1.01, 2.01], [1.11, 2.11]],
    ],
    &NdArrayDevice::Cpu,
);
let path = std::env::temp_dir().join("bgmm_tensor_doc.csv");
save_csv_tensor::<NdArray, _, f32, _>(&tensor, &path)?;
# Ok::<(), bgmm_hmc::BgmmError>(())
```
*/
pub fn save_csv_tensor<B, K, T, P>(tensor: &Tensor<B, 3, K>, filename: P) -> Result<()>
where
    B: Backend,
    K: burn::tensor::TensorKind<B> + burn::tensor::BasicOps<B>,
    T: burn::tensor::Element,
    P: AsRef<Path>,
{
    let [num_samples, num_chains, num_dims] = tensor.dims();
    let flat = tensor
        .to_data()
        .to_vec::<T>()
        .map_err(|e| BgmmError::Tensor(format!("{e:?}")))?;

    let mut wtr = Writer::from_writer(File::create(filename)?);
    let mut header = vec!["sample".to_string(), "chain".to_string()];
    header.extend((0..num_dims).map(|i| format!("dim_{i}")));
    wtr.write_record(&header)?;

    for sample in 0..num_samples {
        for chain in 0..num_chains {
            let mut row = vec![sample.to_string(), chain.to_string()];
            let offset = (sample * num_chains + chain) * num_dims;
            row.extend(flat[offset..offset + num_dims].iter().map(|v| v.to_string()));
            wtr.write_record(&row)?;
        }
    }

    wtr.flush()?;
    Ok(())
}

//! SVG figures of the data and the posterior.

use crate::data::Observations;
use crate::error::{BgmmError, Result};
use crate::posterior::PosteriorDraws;
use ndarray::{ArrayView1, Axis};
use plotters::prelude::*;
use std::ops::Range;
use std::path::Path;

const SIZE: (u32, u32) = (1000, 800);
const HIST_BINS: usize = 40;
/// Vertical gap between observations and location draws of one strip-plot row.
const STRIP_OFFSET: f64 = 0.15;

fn plot_err<E: std::fmt::Display>(e: E) -> BgmmError {
    BgmmError::Plot(e.to_string())
}

/// Padded range covering every value, or `-1..1` when there is none.
fn padded_range<I: Iterator<Item = f64>>(values: I) -> Range<f64> {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if lo > hi {
        return -1.0..1.0;
    }
    let pad = 0.05 * (hi - lo).max(1.0);
    (lo - pad)..(hi + pad)
}

/// Plot position of `p`: its first two coordinates, or in a strip plot its only coordinate
/// against the row of `component`, shifted by `offset`.
fn place(p: ArrayView1<f64>, component: usize, offset: f64, strip: bool) -> (f64, f64) {
    if strip {
        (p[0], component as f64 + offset)
    } else {
        (p[0], p[1])
    }
}

/// Scatter plot of the first two coordinates: observations colored by their true component,
/// posterior location draws on top, and the posterior mean of each location as a cross.
///
/// One-dimensional data is drawn as a strip plot instead, with one row per component.
pub fn plot_locations<P: AsRef<Path>>(
    observations: &Observations,
    draws: &PosteriorDraws,
    path: P,
) -> Result<()> {
    let mean_loc = draws.mean_parameters()?.loc;
    let points = &observations.points;
    if mean_loc.ncols() != points.ncols() {
        return Err(BgmmError::ShapeMismatch {
            what: "location dimension".to_string(),
            expected: points.ncols(),
            got: mean_loc.ncols(),
        });
    }
    let k = mean_loc.nrows();
    let strip = points.ncols() < 2;

    let obs_coords: Vec<(f64, f64)> = points
        .axis_iter(Axis(0))
        .zip(&observations.components)
        .map(|(p, &c)| place(p, c, -STRIP_OFFSET, strip))
        .collect();
    let draw_coords: Vec<Vec<(f64, f64)>> = (0..k)
        .map(|c| {
            draws
                .draws
                .iter()
                .map(|p| place(p.loc.row(c), c, STRIP_OFFSET, strip))
                .collect()
        })
        .collect();
    let mean_coords: Vec<(f64, f64)> = mean_loc
        .axis_iter(Axis(0))
        .enumerate()
        .map(|(c, m)| place(m, c, STRIP_OFFSET, strip))
        .collect();

    let all = || obs_coords.iter().chain(draw_coords.iter().flatten());
    let x_range = padded_range(all().map(|xy| xy.0));
    let y_range = if strip {
        -0.5..(k as f64 - 0.5)
    } else {
        padded_range(all().map(|xy| xy.1))
    };

    let root = SVGBackend::new(path.as_ref(), SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Posterior component locations", ("sans-serif", 30))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(x_range, y_range)
        .map_err(plot_err)?;

    chart
        .configure_mesh()
        .x_desc("x_0")
        .y_desc(if strip { "component" } else { "x_1" })
        .light_line_style(WHITE.mix(0.8))
        .bold_line_style(BLACK.mix(0.3))
        .draw()
        .map_err(plot_err)?;

    chart
        .draw_series(
            obs_coords
                .iter()
                .zip(&observations.components)
                .map(|(&xy, &c)| Circle::new(xy, 2, Palette99::pick(c).mix(0.25).filled())),
        )
        .map_err(plot_err)?;

    for (c, coords) in draw_coords.iter().enumerate() {
        let color = Palette99::pick(c).to_rgba();
        chart
            .draw_series(
                coords
                    .iter()
                    .map(|&xy| Circle::new(xy, 1, color.mix(0.6).filled())),
            )
            .map_err(plot_err)?
            .label(format!("component {c}"))
            .legend(move |(x, y)| Circle::new((x, y), 5, color.filled()));
    }

    chart
        .draw_series(
            mean_coords
                .iter()
                .map(|&xy| Cross::new(xy, 8, BLACK.stroke_width(3))),
        )
        .map_err(plot_err)?
        .label("posterior mean")
        .legend(|(x, y)| Cross::new((x, y), 5, BLACK.stroke_width(2)));

    chart
        .configure_series_labels()
        .border_style(BLACK)
        .background_style(WHITE.mix(0.9))
        .draw()
        .map_err(plot_err)?;

    root.present().map_err(plot_err)?;
    log::info!("Saved location plot to {}", path.as_ref().display());
    Ok(())
}

/// Normalized histogram of each component's mixture weight over all draws.
pub fn plot_mix_probs<P: AsRef<Path>>(draws: &PosteriorDraws, path: P) -> Result<()> {
    let k = draws
        .draws
        .first()
        .map(|p| p.mix_probs.len())
        .ok_or_else(|| BgmmError::Plot("no draws to plot".to_string()))?;
    let width = 1.0 / HIST_BINS as f64;
    let n = draws.len() as f64;

    let densities: Vec<Vec<f64>> = (0..k)
        .map(|c| {
            let mut counts = vec![0usize; HIST_BINS];
            for p in &draws.draws {
                let bin = ((p.mix_probs[c] / width) as usize).min(HIST_BINS - 1);
                counts[bin] += 1;
            }
            counts.into_iter().map(|m| m as f64 / (n * width)).collect()
        })
        .collect();
    let y_max = densities
        .iter()
        .flatten()
        .fold(0.0f64, |acc, &v| acc.max(v))
        .max(1.0)
        * 1.05;

    let root = SVGBackend::new(path.as_ref(), SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Posterior mixture weights", ("sans-serif", 30))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0.0..1.0, 0.0..y_max)
        .map_err(plot_err)?;

    chart
        .configure_mesh()
        .x_desc("mix_probs")
        .y_desc("density")
        .light_line_style(WHITE.mix(0.8))
        .draw()
        .map_err(plot_err)?;

    for (c, density) in densities.iter().enumerate() {
        let color = Palette99::pick(c).to_rgba();
        chart
            .draw_series(density.iter().enumerate().filter(|(_, &h)| h > 0.0).map(
                |(b, &h)| {
                    let x0 = b as f64 * width;
                    Rectangle::new([(x0, 0.0), (x0 + width, h)], color.mix(0.4).filled())
                },
            ))
            .map_err(plot_err)?
            .label(format!("component {c}"))
            .legend(move |(x, y)| Rectangle::new([(x, y - 5), (x + 10, y + 5)], color.filled()));
    }

    chart
        .configure_series_labels()
        .border_style(BLACK)
        .background_style(WHITE.mix(0.9))
        .draw()
        .map_err(plot_err)?;

    root.present().map_err(plot_err)?;
    log::info!("Saved mixture weight plot to {}", path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Parameters;
    use ndarray::{array, Array2, Array3};
    use std::fs;
    use tempfile::tempdir;

    fn draws() -> PosteriorDraws {
        let draws = (0..6)
            .map(|i| {
                let w = 0.2 + 0.05 * i as f64;
                Parameters {
                    mix_probs: array![w, 0.5, 0.5 - w],
                    loc: array![[-2.0 + 0.1 * i as f64, -2.0], [0.0, 0.1], [2.0, 2.0]],
                    chol_precision: Array2::<f64>::eye(2)
                        .broadcast((3, 2, 2))
                        .unwrap()
                        .to_owned(),
                }
            })
            .collect();
        PosteriorDraws {
            n_results: 3,
            n_chains: 2,
            draws,
            is_accepted: Array2::from_elem((3, 2), true),
            step_size: 0.05,
        }
    }

    #[test]
    fn test_plots_are_written() {
        let obs = Observations {
            points: array![[-2.1, -1.9], [0.2, 0.0], [1.8, 2.3]],
            components: vec![0, 1, 2],
        };
        let dir = tempdir().unwrap();
        let loc_path = dir.path().join("locations.svg");
        let mix_path = dir.path().join("mix_probs.svg");
        plot_locations(&obs, &draws(), &loc_path).unwrap();
        plot_mix_probs(&draws(), &mix_path).unwrap();
        for path in [loc_path, mix_path] {
            let svg = fs::read_to_string(path).unwrap();
            assert!(svg.contains("<svg"));
            assert!(svg.contains("component 2"));
        }
    }

    #[test]
    fn test_one_dimensional_strip_plot() {
        let obs = Observations {
            points: array![[-2.2], [0.1], [1.9], [2.3]],
            components: vec![0, 1, 2, 2],
        };
        let draws = PosteriorDraws {
            n_results: 2,
            n_chains: 1,
            draws: (0..2)
                .map(|i| Parameters {
                    mix_probs: array![0.25, 0.25, 0.5],
                    loc: array![[-2.0], [0.1 * i as f64], [2.0]],
                    chol_precision: Array3::ones((3, 1, 1)),
                })
                .collect(),
            is_accepted: Array2::from_elem((2, 1), true),
            step_size: 0.05,
        };
        let dir = tempdir().unwrap();
        let path = dir.path().join("strip.svg");
        plot_locations(&obs, &draws, &path).unwrap();
        let svg = fs::read_to_string(path).unwrap();
        assert!(svg.contains("posterior mean"));
        assert!(svg.contains("component"));
    }

    #[test]
    fn test_location_dimension_mismatch() {
        let obs = Observations {
            points: array![[0.0], [1.0]],
            components: vec![0, 0],
        };
        let dir = tempdir().unwrap();
        let err = plot_locations(&obs, &draws(), dir.path().join("x.svg")).unwrap_err();
        assert!(matches!(err, BgmmError::ShapeMismatch { expected: 1, got: 2, .. }));
    }

    #[test]
    fn test_padded_range() {
        assert_eq!(padded_range(std::iter::empty()), -1.0..1.0);
        let r = padded_range([0.0, 10.0, f64::NAN].into_iter());
        assert!((r.start + 0.5).abs() < 1e-12 && (r.end - 10.5).abs() < 1e-12);
    }
}

//! Figures of normal densities for the course material.

use std::f64::consts::PI;
use std::path::Path;

use plotters::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlotError {
    #[error("Could not draw figure: {0}")]
    Drawing(String),
}

fn drawing_error<E: std::fmt::Display>(err: E) -> PlotError {
    PlotError::Drawing(err.to_string())
}

/// Density of `N(mu, sigma^2)` at `x`.
pub fn normal_pdf(x: f64, mu: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma;
    (-0.5 * z * z).exp() / (sigma * (2. * PI).sqrt())
}

/// `num` evenly spaced values from `start` to `stop`, both included.
pub fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            (0..num).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Discrete convolution of `a` and `v`, cut to the length of the longer
/// input and centred on the full convolution.
pub fn convolve_same(a: &[f64], v: &[f64]) -> Vec<f64> {
    if a.is_empty() || v.is_empty() {
        return vec![];
    }
    let (long, short) = if a.len() >= v.len() { (a, v) } else { (v, a) };
    let offset = (short.len() - 1) / 2;

    (offset..offset + long.len())
        .map(|k| {
            // full[k] = sum_j short[j] * long[k - j]
            let lo = k.saturating_sub(long.len() - 1);
            let hi = k.min(short.len() - 1);
            (lo..=hi).map(|j| short[j] * long[k - j]).sum()
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct FigureOptions {
    pub width: u32,
    pub height: u32,
    pub x_min: f64,
    pub x_max: f64,
    pub n_points: usize,
    /// Standard deviations of the plotted zero-mean normals. The figure
    /// also shows the convolution of the first two.
    pub sigmas: Vec<f64>,
    /// Axis descriptions, tick labels and legend. Text rendering needs
    /// system fonts.
    pub draw_labels: bool,
}

impl Default for FigureOptions {
    fn default() -> Self {
        FigureOptions {
            width: 1920,
            height: 1440,
            x_min: -4.,
            x_max: 4.,
            n_points: 300,
            sigmas: vec![0.4, 1.0],
            draw_labels: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Curve {
    pub label: String,
    pub points: Vec<(f64, f64)>,
}

/// The curves of the normal figure: one density per sigma and the
/// convolution of the first two densities.
pub fn normal_figure_curves(options: &FigureOptions) -> Vec<Curve> {
    let x = linspace(options.x_min, options.x_max, options.n_points);
    let densities: Vec<Vec<f64>> = options
        .sigmas
        .iter()
        .map(|&sigma| x.iter().map(|&x| normal_pdf(x, 0., sigma)).collect())
        .collect();

    let mut curves: Vec<Curve> = options
        .sigmas
        .iter()
        .zip(densities.iter())
        .map(|(sigma, y)| Curve {
            label: format!("σ = {sigma}"),
            points: x.iter().copied().zip(y.iter().copied()).collect(),
        })
        .collect();

    if let [first, second, ..] = densities.as_slice() {
        curves.push(Curve {
            label: "convolution".into(),
            points: x.iter().copied().zip(convolve_same(first, second)).collect(),
        });
    }
    curves
}

/// Render the normal figure as a PNG file at `path`.
pub fn render_normal_figure(path: &Path, options: &FigureOptions) -> Result<(), PlotError> {
    let curves = normal_figure_curves(options);
    let y_max = curves
        .iter()
        .flat_map(|c| c.points.iter().map(|&(_, y)| y))
        .fold(0f64, f64::max)
        * 1.05;

    let root = BitMapBackend::new(path, (options.width, options.height)).into_drawing_area();
    root.fill(&WHITE).map_err(drawing_error)?;

    let label_area = if options.draw_labels { 80 } else { 0 };
    let mut chart = ChartBuilder::on(&root)
        .margin(20)
        .x_label_area_size(label_area)
        .y_label_area_size(label_area)
        .build_cartesian_2d(options.x_min..options.x_max, 0f64..y_max.max(f64::EPSILON))
        .map_err(drawing_error)?;

    if options.draw_labels {
        chart
            .configure_mesh()
            .disable_mesh()
            .x_desc("y_dep - ŷ_dep")
            .y_desc("N(y_dep | ŷ_dep, σ)")
            .label_style(("sans-serif", 30))
            .axis_desc_style(("sans-serif", 36))
            .draw()
            .map_err(drawing_error)?;
    }

    for (idx, curve) in curves.iter().enumerate() {
        let color = Palette99::pick(idx).to_rgba();
        let series = chart
            .draw_series(LineSeries::new(
                curve.points.iter().copied(),
                color.stroke_width(3),
            ))
            .map_err(drawing_error)?;
        if options.draw_labels {
            series.label(curve.label.as_str()).legend(move |(x, y)| {
                PathElement::new(vec![(x, y), (x + 30, y)], color.stroke_width(3))
            });
        }
    }

    if options.draw_labels {
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.9))
            .label_font(("sans-serif", 30))
            .draw()
            .map_err(drawing_error)?;
    }

    root.present().map_err(drawing_error)?;
    Ok(())
}

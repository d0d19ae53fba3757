//! Training data ingestion

use ndarray::Array1;
use rand::Rng;

use super::network::fit_to_width;

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub input: Array1<f64>,
    pub target: f64,
}

/// Where a training run's samples came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Fetched,
    Synthetic,
}

fn parse_cell(cell: &str) -> f64 {
    match cell.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => 0.0,
    }
}

/// Parse comma-separated rows. The first line is a header; the last column
/// is the target and the rest are fitted to `input_width`.
pub fn parse_csv(text: &str, input_width: usize) -> Vec<Sample> {
    text.trim()
        .lines()
        .skip(1)
        .filter_map(|line| {
            let values: Vec<f64> = line.split(',').map(parse_cell).collect();
            let (target, features) = values.split_last()?;
            if features.is_empty() {
                return None;
            }
            Some(Sample {
                input: fit_to_width(features, input_width),
                target: *target,
            })
        })
        .collect()
}

/// Uniform inputs in [0, 1), target is the mean of the input
pub fn synthetic_samples<R: Rng + ?Sized>(count: usize, width: usize, rng: &mut R) -> Vec<Sample> {
    (0..count)
        .map(|_| {
            let input = Array1::from_shape_fn(width, |_| rng.gen::<f64>());
            let target = input.mean().unwrap_or(0.0);
            Sample { input, target }
        })
        .collect()
}

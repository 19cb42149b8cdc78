use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Robust noise estimate of a signal that contains sparse outliers.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoiseFloor {
    pub mean: f64,
    pub deviation: f64,
    /// Samples left after trimming.
    pub kept: usize,
    pub cut: usize,
}

/// Iterative trimmed standard deviation.
///
/// Samples are dropped one at a time, farthest from the median first, until
/// the deviation changes by less than `stable` (relative) between steps or
/// `max_cut` of the samples are gone. Trimming every sample is a degenerate
/// input.
pub fn trimmed_deviation(data: &[f64], stable: f64, max_cut: f64) -> Result<NoiseFloor> {
    let n = data.len();
    if n == 0 {
        return Err(CoreError::degenerate("noise estimate of an empty signal"));
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let shift = sorted[n / 2];
    // farthest from the median last, so cuts pop from the back
    sorted.sort_by(|a, b| (a - shift).abs().total_cmp(&(b - shift).abs()));

    let mut sum: f64 = sorted.iter().map(|v| v - shift).sum();
    let mut sum_sq: f64 = sorted.iter().map(|v| (v - shift) * (v - shift)).sum();
    let mut kept = n;
    let mut deviation = deviation_of(sum, sum_sq, kept);
    let max_cuts = ((max_cut.clamp(0.0, 1.0) * n as f64).floor() as usize).min(n);

    for _ in 0..max_cuts {
        if deviation == 0.0 && stable > 0.0 {
            break;
        }
        let Some(v) = sorted.pop() else {
            break;
        };
        let d = v - shift;
        sum -= d;
        sum_sq -= d * d;
        kept -= 1;
        if kept == 0 {
            return Err(CoreError::degenerate("noise trimming removed every sample"));
        }
        let next = deviation_of(sum, sum_sq, kept);
        let change = if deviation > 0.0 {
            (next - deviation).abs() / deviation
        } else {
            0.0
        };
        deviation = next;
        if change < stable {
            break;
        }
    }
    Ok(NoiseFloor {
        mean: shift + sum / kept as f64,
        deviation,
        kept,
        cut: n - kept,
    })
}

fn deviation_of(sum: f64, sum_sq: f64, count: usize) -> f64 {
    let mean = sum / count as f64;
    (sum_sq / count as f64 - mean * mean).max(0.0).sqrt()
}

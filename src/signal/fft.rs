use rustfft::{num_complex::Complex64, FftPlanner};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::{CoreError, Result};

/// One-sided power spectral density.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PowerSpectrum {
    pub frequencies_hz: Vec<f64>,
    /// Density such that `sum(power) * bin_width() == mean(x^2)`.
    pub power: Vec<f64>,
}

impl PowerSpectrum {
    pub fn bin_width(&self) -> f64 {
        self.frequencies_hz.get(1).copied().unwrap_or(0.0)
    }

    /// Frequency of the strongest non-DC bin.
    pub fn peak_frequency(&self) -> Option<f64> {
        self.power
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| self.frequencies_hz[k])
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    #[default]
    Rectangular,
    Hann,
}

impl Window {
    fn coefficients(self, n: usize) -> Vec<f64> {
        match self {
            Window::Rectangular => vec![1.0; n],
            Window::Hann if n > 1 => (0..n)
                .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
                .collect(),
            Window::Hann => vec![1.0; n],
        }
    }
}

/// Unitary one-sided power spectrum of the whole trace.
pub fn power_spectrum(data: &[f64], sample_rate_hz: f64) -> Result<PowerSpectrum> {
    check_input(data.len(), sample_rate_hz)?;
    let mut planner = FftPlanner::<f64>::new();
    Ok(windowed_spectrum(&mut planner, data, sample_rate_hz, Window::Rectangular))
}

/// Averages windowed spectra of `chunk_size` segments (half-overlapping when `overlap`).
pub fn averaged_power_spectrum(
    data: &[f64],
    sample_rate_hz: f64,
    chunk_size: usize,
    overlap: bool,
    window: Window,
) -> Result<PowerSpectrum> {
    check_input(data.len(), sample_rate_hz)?;
    if chunk_size < 2 || chunk_size > data.len() {
        return Err(CoreError::degenerate(format!(
            "chunk size {chunk_size} does not fit {} samples",
            data.len()
        )));
    }
    let step = if overlap {
        (chunk_size / 2).max(1)
    } else {
        chunk_size
    };
    let mut planner = FftPlanner::<f64>::new();
    let mut acc: Option<PowerSpectrum> = None;
    let mut count = 0usize;
    let mut start = 0usize;
    while start + chunk_size <= data.len() {
        let chunk = windowed_spectrum(
            &mut planner,
            &data[start..start + chunk_size],
            sample_rate_hz,
            window,
        );
        match acc.as_mut() {
            Some(total) => {
                for (t, p) in total.power.iter_mut().zip(&chunk.power) {
                    *t += p;
                }
            }
            None => acc = Some(chunk),
        }
        count += 1;
        start += step;
    }
    let mut spectrum = acc.ok_or_else(|| CoreError::degenerate("no complete chunk"))?;
    for p in &mut spectrum.power {
        *p /= count as f64;
    }
    Ok(spectrum)
}

fn check_input(len: usize, sample_rate_hz: f64) -> Result<()> {
    if len == 0 {
        return Err(CoreError::degenerate("empty trace"));
    }
    if !(sample_rate_hz > 0.0) {
        return Err(CoreError::degenerate("sample rate must be positive"));
    }
    Ok(())
}

fn windowed_spectrum(
    planner: &mut FftPlanner<f64>,
    data: &[f64],
    sample_rate_hz: f64,
    window: Window,
) -> PowerSpectrum {
    let n = data.len();
    let fft = planner.plan_fft_forward(n);
    let coeffs = window.coefficients(n);
    // Mean window power keeps the density unbiased for windowed chunks.
    let window_power = coeffs.iter().map(|w| w * w).sum::<f64>() / n as f64;
    let mut buffer: Vec<Complex64> = data
        .iter()
        .zip(&coeffs)
        .map(|(v, w)| Complex64::new(v * w, 0.0))
        .collect();
    fft.process(&mut buffer);
    let bin_width = sample_rate_hz / n as f64;
    let bins = n / 2 + 1;
    let norm = (n * n) as f64 * window_power * bin_width;
    let mut frequencies = Vec::with_capacity(bins);
    let mut power = Vec::with_capacity(bins);
    for (k, c) in buffer.iter().take(bins).enumerate() {
        frequencies.push(k as f64 * bin_width);
        let mut p = c.norm_sqr() / norm;
        let nyquist = n % 2 == 0 && k == n / 2;
        if k != 0 && !nyquist {
            p *= 2.0;
        }
        power.push(p);
    }
    PowerSpectrum {
        frequencies_hz: frequencies,
        power,
    }
}

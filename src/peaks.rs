//! Convolution peak finder and the cheaper flat-curve filter.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::{BlindWindow, ConvolutionConfig, FlatFilterConfig};
use crate::error::{check_same_len, CoreError, Result};
use crate::fit::FitResult;
use crate::signal::{convolve_same, derivative, median_filter, trimmed_deviation};

/// Contiguous range `[index, index + length)` of a block's rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub name: String,
    pub index: usize,
    pub length: usize,
    /// Deepest point of the smoothed signal near the edge that was detected.
    pub tip: usize,
    #[serde(default)]
    pub fit: Option<FitResult>,
}

impl Peak {
    pub fn end(&self) -> usize {
        self.index + self.length
    }

    pub fn contains(&self, row: usize) -> bool {
        (self.index..self.end()).contains(&row)
    }
}

fn blind_points(blind: BlindWindow, x: Option<&[f64]>) -> Result<usize> {
    match blind {
        BlindWindow::Points(n) => Ok(n),
        BlindWindow::Distance(d) => {
            let x = x.ok_or_else(|| CoreError::InvalidArguments {
                command: "find peaks".into(),
                reason: "a distance blind window needs the x column".into(),
            })?;
            if x.len() < 2 {
                return Ok(0);
            }
            let spacing = (x[x.len() - 1] - x[0]).abs() / (x.len() - 1) as f64;
            if !(spacing > 0.0) {
                return Ok(0);
            }
            Ok((d.abs() / spacing).round() as usize)
        }
    }
}

/// Finds step-like events in `signal`, sorted by position.
///
/// `x` is only consulted to convert a distance blind window to points.
/// Inputs too short for the blind window, the median window or the kernel
/// have no peaks. Rows within half a kernel plus half a median window of
/// either end are never searched: the filters see a truncated trace there.
///
/// A support level above the threshold is rejected as invalid arguments.
pub fn find_peaks(signal: &[f64], x: Option<&[f64]>, cfg: &ConvolutionConfig) -> Result<Vec<Peak>> {
    if let Some(x) = x {
        check_same_len(signal.len(), x.len())?;
    }
    if cfg.support_deviation > cfg.min_deviation {
        return Err(CoreError::InvalidArguments {
            command: "find peaks".into(),
            reason: format!(
                "support_deviation {} exceeds min_deviation {}",
                cfg.support_deviation, cfg.min_deviation
            ),
        });
    }
    let n = signal.len();
    let blind = blind_points(cfg.blind_window, x)?;
    let margin = cfg.kernel.len() / 2 + cfg.median_window / 2;
    let start = blind.max(margin);
    let stop = n.saturating_sub(margin);
    if start >= stop || n < cfg.median_window || n < cfg.kernel.len() || cfg.kernel.is_empty() {
        debug!("find peaks: {n} samples is too short (blind {blind})");
        return Ok(Vec::new());
    }

    let smoothed = median_filter(signal, cfg.median_window);
    let conv = convolve_same(&smoothed, &cfg.kernel);
    let floor = trimmed_deviation(&conv[start..stop], cfg.stable, cfg.max_cut)?;
    // rounding in the convolution sum, for traces with no noise at all
    let peak_abs = smoothed.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let kernel_abs: f64 = cfg.kernel.iter().map(|w| w.abs()).sum();
    let resolution = f64::EPSILON * cfg.kernel.len() as f64 * kernel_abs * peak_abs;
    let deviation = floor.deviation.max(resolution);
    debug!(
        "find peaks: noise floor {:e} after trimming {} of {} samples",
        deviation,
        floor.cut,
        stop - start
    );

    let level = |v: f64| if cfg.positive_only { v } else { v.abs() };
    let threshold = deviation * cfg.min_deviation;
    let support = deviation * cfg.support_deviation;

    // extents come from the support level only, so raising the threshold can only drop peaks
    let mut extents: Vec<(usize, usize)> = Vec::new();
    for i in start..stop {
        if level(conv[i]) <= support {
            continue;
        }
        match extents.last_mut() {
            Some((_, end)) if i - *end <= cfg.see_double => *end = i,
            _ => extents.push((i, i)),
        }
    }

    let mut peaks = Vec::new();
    for (start, end) in extents {
        let above = (start..=end)
            .filter(|&i| level(conv[i]) > threshold)
            .count();
        if above < cfg.min_peak_length.max(1) {
            continue;
        }
        let edge = (start..=end)
            .max_by(|&a, &b| level(conv[a]).total_cmp(&level(conv[b])))
            .unwrap_or(start);
        let lo = edge.saturating_sub(cfg.refine_window);
        let hi = (edge + cfg.refine_window).min(n - 1);
        let tip = (lo..=hi)
            .min_by(|&a, &b| smoothed[a].total_cmp(&smoothed[b]))
            .unwrap_or(edge);
        peaks.push(Peak {
            name: format!("peak {}", peaks.len()),
            index: start,
            length: end - start + 1,
            tip,
            fit: None,
        });
    }
    debug!("find peaks: {} peaks", peaks.len());
    Ok(peaks)
}

/// Counts abrupt features on the derivative of the median-filtered trace.
///
/// Returns zero when fewer than `min_npks` features are found.
pub fn flat_filter_count(signal: &[f64], cfg: &FlatFilterConfig) -> usize {
    if signal.len() < cfg.median_window.max(2) {
        return 0;
    }
    let smoothed = median_filter(signal, cfg.median_window);
    let slope = derivative(&smoothed, &cfg.stencil);
    let mean_abs = slope.iter().map(|d| d.abs()).sum::<f64>() / slope.len() as f64;
    if !(mean_abs > 0.0) {
        return 0;
    }
    let threshold = cfg.min_deviation * mean_abs;

    let mut features = 0;
    let mut run = 0;
    for d in slope.iter().chain(std::iter::once(&0.0)) {
        if d.abs() > threshold {
            run += 1;
            continue;
        }
        if run > 0 && run >= cfg.min_run_length {
            features += 1;
        }
        run = 0;
    }
    if features < cfg.min_npks {
        0
    } else {
        features
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spikes(n: usize, at: &[usize], depth: f64, width: usize) -> Vec<f64> {
        let mut data = vec![0.0; n];
        for &i in at {
            for v in &mut data[i..i + width] {
                *v = depth;
            }
        }
        data
    }

    #[test]
    fn finds_isolated_spikes() {
        let data = spikes(600, &[150, 400], -50.0, 5);
        let peaks = find_peaks(&data, None, &ConvolutionConfig::default()).unwrap();
        assert_eq!(peaks.len(), 2);
        assert!((150..155).contains(&peaks[0].tip));
        assert!((400..405).contains(&peaks[1].tip));
        assert!(peaks[0].contains(152));
        assert_eq!(peaks[1].name, "peak 1");
    }

    #[test]
    fn blind_window_hides_early_events() {
        let data = spikes(600, &[30, 400], -50.0, 5);
        let cfg = ConvolutionConfig {
            blind_window: BlindWindow::Points(60),
            ..ConvolutionConfig::default()
        };
        let peaks = find_peaks(&data, None, &cfg).unwrap();
        assert_eq!(peaks.len(), 1);
        assert!(peaks[0].index >= 60);

        let x: Vec<f64> = (0..600).map(|i| i as f64 * 2e-9).collect();
        let by_distance = ConvolutionConfig {
            blind_window: BlindWindow::Distance(120e-9),
            ..ConvolutionConfig::default()
        };
        assert_eq!(find_peaks(&data, Some(&x), &by_distance).unwrap(), peaks);
        assert!(find_peaks(&data, None, &by_distance).is_err());
    }

    #[test]
    fn close_spikes_merge() {
        let data = spikes(600, &[300, 312], -50.0, 5);
        let cfg = ConvolutionConfig {
            see_double: 10,
            ..ConvolutionConfig::default()
        };
        assert_eq!(find_peaks(&data, None, &cfg).unwrap().len(), 1);
    }

    #[test]
    fn short_inputs_have_no_peaks() {
        let cfg = ConvolutionConfig::default();
        assert!(find_peaks(&[1.0; 5], None, &cfg).unwrap().is_empty());
        let blind = ConvolutionConfig {
            blind_window: BlindWindow::Points(50),
            ..ConvolutionConfig::default()
        };
        assert!(find_peaks(&[0.0; 40], None, &blind).unwrap().is_empty());
    }

    #[test]
    fn ramps_have_no_peaks() {
        let cfg = ConvolutionConfig::default();
        for step in [0.5, 0.01, -3.0] {
            let ramp: Vec<f64> = (0..1000).map(|i| i as f64 * step).collect();
            let peaks = find_peaks(&ramp, None, &cfg).unwrap();
            assert!(peaks.is_empty(), "step {step}: {peaks:?}");
        }
    }

    #[test]
    fn support_above_threshold_is_rejected() {
        let cfg = ConvolutionConfig {
            min_deviation: 2.0,
            support_deviation: 3.0,
            ..ConvolutionConfig::default()
        };
        let err = find_peaks(&spikes(600, &[300], -50.0, 5), None, &cfg).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArguments { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Contract);
    }

    #[test]
    fn positive_only_ignores_downward_edges() {
        let data = spikes(600, &[300], 50.0, 5);
        let cfg = ConvolutionConfig {
            positive_only: true,
            ..ConvolutionConfig::default()
        };
        // an upward spike convolves to a negative centre, with only small positive shoulders
        let all = find_peaks(&data, None, &ConvolutionConfig::default()).unwrap();
        assert_eq!(all.len(), 1);
        let positive = find_peaks(&data, None, &cfg).unwrap();
        assert!(positive.len() <= all.len());
    }

    #[test]
    fn flat_trace_has_no_features() {
        assert_eq!(flat_filter_count(&[2.0; 500], &FlatFilterConfig::default()), 0);
        assert_eq!(flat_filter_count(&[2.0; 3], &FlatFilterConfig::default()), 0);
    }

    #[test]
    fn steps_are_counted_once_each() {
        let mut data = vec![0.0; 1000];
        for (k, v) in data.iter_mut().enumerate() {
            *v = (k / 150) as f64 * 10.0 + if k % 2 == 0 { 1e-3 } else { -1e-3 };
        }
        // 6 steps at 150, 300, ..., 900
        assert_eq!(flat_filter_count(&data, &FlatFilterConfig::default()), 6);
        let strict = FlatFilterConfig {
            min_npks: 7,
            ..FlatFilterConfig::default()
        };
        assert_eq!(flat_filter_count(&data, &strict), 0);
    }
}

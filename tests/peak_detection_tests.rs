//! Convolution peak finder and flat filter on synthetic traces.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use forcecurve::config::{ConvolutionConfig, FlatFilterConfig};
use forcecurve::peaks::{find_peaks, flat_filter_count};

fn gaussian(n: usize, sigma: f64, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, sigma).unwrap();
    (0..n).map(|_| normal.sample(&mut rng)).collect()
}

fn inject_spikes(data: &mut [f64], at: &[usize], depth: f64, width: usize) {
    for &i in at {
        for v in &mut data[i..i + width] {
            *v += depth;
        }
    }
}

// ============================================================================
// Convolution peak finder
// ============================================================================

fn assert_three_spikes(data: &[f64]) {
    let peaks = find_peaks(data, None, &ConvolutionConfig::default()).unwrap();
    assert_eq!(peaks.len(), 3, "{peaks:?}");
    for (peak, expected) in peaks.iter().zip([200_i64, 500, 800]) {
        let tip = peak.tip as i64;
        assert!((tip - expected).abs() <= 5, "tip {tip} vs {expected}");
    }
    assert!(peaks.windows(2).all(|w| w[0].end() <= w[1].index));
}

#[test]
fn test_three_spikes_in_zeros() {
    let mut data = vec![0.0; 1000];
    inject_spikes(&mut data, &[200, 500, 800], -50.0, 5);
    assert_three_spikes(&data);
}

#[test]
fn test_three_spikes_in_noise() {
    let sigma = 1.0;
    for seed in [1, 2, 3] {
        let mut data = gaussian(1000, sigma, seed);
        inject_spikes(&mut data, &[200, 500, 800], -50.0 * sigma, 5);
        assert_three_spikes(&data);
    }
}

#[test]
fn test_ramps_have_no_peaks() {
    let ramp: Vec<f64> = (0..1000).map(|i| i as f64 * 0.01).collect();
    assert!(find_peaks(&ramp, None, &ConvolutionConfig::default()).unwrap().is_empty());
    // a steep contact ramp into a flat tail leaves only the kink
    let contact: Vec<f64> = (0..1000).map(|i| (200 - i.min(200)) as f64 * 0.5).collect();
    let peaks = find_peaks(&contact, None, &ConvolutionConfig::default()).unwrap();
    assert!(peaks.iter().all(|p| p.index > 150), "{peaks:?}");
}

#[test]
fn test_raising_the_threshold_never_adds_peaks() {
    let mut data = gaussian(2000, 1.0, 7);
    inject_spikes(&mut data, &[300, 900], -40.0, 5);
    inject_spikes(&mut data, &[1300], -12.0, 5);
    inject_spikes(&mut data, &[1700], -6.0, 5);
    let mut previous = usize::MAX;
    for min_deviation in [1.0, 2.0, 3.0, 4.0, 5.0, 8.0, 13.0, 21.0, 34.0, 1e3] {
        // the support level may not exceed the lowest threshold
        let cfg = ConvolutionConfig {
            min_deviation,
            support_deviation: 1.0,
            ..ConvolutionConfig::default()
        };
        let count = find_peaks(&data, None, &cfg).unwrap().len();
        assert!(count <= previous, "{count} peaks at {min_deviation}, {previous} before");
        previous = count;
    }
    assert_eq!(previous, 0);
}

#[test]
fn test_short_signals_have_no_peaks() {
    let peaks = find_peaks(&[0.0, -5.0, 0.0], None, &ConvolutionConfig::default()).unwrap();
    assert!(peaks.is_empty());
}

// ============================================================================
// Flat filter
// ============================================================================

#[test]
fn test_constant_trace_has_no_features() {
    let data = vec![3.0; 800];
    for min_deviation in [1.0, 2.0, 9.0] {
        let cfg = FlatFilterConfig {
            min_deviation,
            ..FlatFilterConfig::default()
        };
        assert_eq!(flat_filter_count(&data, &cfg), 0, "threshold {min_deviation}");
    }
}

#[test]
fn test_flat_noise_has_no_features_at_the_default_threshold() {
    for seed in [21, 22, 23] {
        let data = gaussian(1000, 1.0, seed);
        assert_eq!(flat_filter_count(&data, &FlatFilterConfig::default()), 0, "seed {seed}");
        // low thresholds count the noise itself
        let loose = FlatFilterConfig {
            min_deviation: 1.0,
            ..FlatFilterConfig::default()
        };
        assert!(flat_filter_count(&data, &loose) > 0, "seed {seed}");
    }
}

#[test]
fn test_too_few_features_report_zero() {
    let mut data = vec![0.0; 600];
    for at in [200, 400] {
        for v in &mut data[at..] {
            *v += 1.0;
        }
    }
    assert_eq!(flat_filter_count(&data, &FlatFilterConfig::default()), 0);
    let cfg = FlatFilterConfig {
        min_npks: 2,
        ..FlatFilterConfig::default()
    };
    assert_eq!(flat_filter_count(&data, &cfg), 2);
}

#[test]
fn test_tall_steps_are_counted_once_each() {
    let sigma = 1.0;
    let mut data = gaussian(1000, sigma, 11);
    for step in 0..5 {
        let at = 150 + 150 * step;
        for v in &mut data[at..] {
            *v += 50.0 * sigma;
        }
    }
    assert_eq!(flat_filter_count(&data, &FlatFilterConfig::default()), 5);
}

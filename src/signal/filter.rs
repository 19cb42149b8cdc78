/// Running median over `window` samples centred on each point.
///
/// Even windows are widened by one. Near the ends the window is truncated to
/// the available samples, so constant traces stay constant.
pub fn median_filter(data: &[f64], window: usize) -> Vec<f64> {
    if window <= 1 || data.len() < 2 {
        return data.to_vec();
    }
    let half = window / 2;
    let mut scratch = Vec::with_capacity(2 * half + 1);
    (0..data.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(data.len());
            scratch.clear();
            scratch.extend_from_slice(&data[lo..hi]);
            median(&mut scratch)
        })
        .collect()
}

fn median(values: &mut [f64]) -> f64 {
    let n = values.len();
    let mid = n / 2;
    values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    let upper = values[mid];
    if n % 2 == 1 {
        return upper;
    }
    let lower = values[..mid]
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    0.5 * (lower + upper)
}

/// Discrete convolution returning as many samples as `data`.
///
/// The kernel is centred on each sample; samples beyond the ends repeat the
/// nearest edge value.
pub fn convolve_same(data: &[f64], kernel: &[f64]) -> Vec<f64> {
    let n = data.len();
    if n == 0 || kernel.is_empty() {
        return vec![0.0; n];
    }
    let half = (kernel.len() / 2) as isize;
    let last = n as isize - 1;
    (0..n as isize)
        .map(|i| {
            kernel
                .iter()
                .enumerate()
                .map(|(j, w)| {
                    let idx = (i + half - j as isize).clamp(0, last) as usize;
                    w * data[idx]
                })
                .sum()
        })
        .collect()
}

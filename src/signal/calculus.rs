use serde::{Deserialize, Serialize};

/// Finite-difference stencil as `(offset, weight)` pairs over unit spacing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stencil {
    Forward,
    Backward,
    Central,
    Custom(Vec<(isize, f64)>),
}

impl Stencil {
    pub fn weights(&self) -> Vec<(isize, f64)> {
        match self {
            Stencil::Forward => vec![(0, -1.0), (1, 1.0)],
            Stencil::Backward => vec![(-1, -1.0), (0, 1.0)],
            Stencil::Central => vec![(-1, -0.5), (1, 0.5)],
            Stencil::Custom(w) => w.clone(),
        }
    }
}

/// Discrete derivative with respect to the sample index.
///
/// Where the stencil would reach past either end, the forward (or, at the
/// last sample, backward) difference is used instead, so the output has the
/// same length as the input.
pub fn derivative(data: &[f64], stencil: &Stencil) -> Vec<f64> {
    let n = data.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let weights = stencil.weights();
    let lo = weights.iter().map(|(o, _)| *o).min().unwrap_or(0);
    let hi = weights.iter().map(|(o, _)| *o).max().unwrap_or(0);
    (0..n)
        .map(|i| {
            let i = i as isize;
            if i + lo >= 0 && i + hi < n as isize {
                weights
                    .iter()
                    .map(|(o, w)| w * data[(i + o) as usize])
                    .sum()
            } else if i + 1 < n as isize {
                data[i as usize + 1] - data[i as usize]
            } else {
                data[i as usize] - data[i as usize - 1]
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn central_difference_of_a_parabola_is_exact_inside() {
        let data: Vec<f64> = (0..10).map(|i| (i * i) as f64).collect();
        let d = derivative(&data, &Stencil::Central);
        assert_eq!(d.len(), data.len());
        for (i, v) in d.iter().enumerate().take(9).skip(1) {
            assert_abs_diff_eq!(*v, 2.0 * i as f64, epsilon = 1e-12);
        }
        // edges fall back to one-sided differences
        assert_abs_diff_eq!(d[0], 1.0);
        assert_abs_diff_eq!(d[9], 17.0);
    }

    #[test]
    fn custom_stencil_is_honoured() {
        let data = [0.0, 1.0, 4.0, 9.0, 16.0];
        let d = derivative(&data, &Stencil::Custom(vec![(-2, -0.25), (2, 0.25)]));
        assert_abs_diff_eq!(d[2], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn short_inputs_give_zeros() {
        assert_eq!(derivative(&[3.0], &Stencil::Forward), vec![0.0]);
        assert!(derivative(&[], &Stencil::Central).is_empty());
    }
}

//! Surface contact point from a bilinear fit of the deflection trace.
//!
//! The trace is modelled as a contact line `p0 + p1*i` up to the kink `p2`
//! and a non-contact line of slope `p3` after it. The position column is only
//! used to orient the trace: decreasing positions are reversed before the fit
//! and the contact index is mapped back.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::SurfaceConfig;
use crate::error::{check_same_len, CoreError, Result};
use crate::fit::least_squares;

/// Evaluates the bilinear model at (fractional) index `i`.
pub fn bilinear(params: &[f64; 4], i: f64) -> f64 {
    let [p0, p1, p2, p3] = *params;
    if i <= p2 {
        p0 + p1 * i
    } else {
        p0 + p1 * p2 + p3 * (i - p2)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurfaceContact {
    /// Contact sample in the caller's ordering.
    pub index: usize,
    /// Deflection of the non-contact baseline at the kink.
    pub deflection_offset: f64,
    /// Position at `index`.
    pub position_offset: f64,
    /// Unrounded kink, in the caller's ordering.
    pub kink: f64,
    /// Fitted `[p0, p1, p2, p3]` in fit ordering (reversed when `reversed`).
    pub parameters: [f64; 4],
    pub contact_slope: f64,
    pub non_contact_slope: f64,
    /// Covariance of the free parameters, in `parameters` order.
    pub covariance: Option<Vec<Vec<f64>>>,
    pub reversed: bool,
}

/// Locates the contact point of a single approach or retract trace.
pub fn fit_surface_contact(
    position: &[f64],
    deflection: &[f64],
    cfg: &SurfaceConfig,
) -> Result<SurfaceContact> {
    check_same_len(position.len(), deflection.len())?;
    let n = deflection.len();
    if n < 5 {
        return Err(CoreError::degenerate(format!(
            "{n} samples are too few for a bilinear contact fit"
        )));
    }
    let reversed = position[n - 1] < position[0];
    let y: Vec<f64> = if reversed {
        deflection.iter().rev().copied().collect()
    } else {
        deflection.to_vec()
    };

    let min = y.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = y.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let range_y = max - min;
    if !(range_y > 0.0 && range_y.is_finite()) {
        return Err(CoreError::degenerate("deflection trace has no usable range"));
    }
    let range_i = (n - 1) as f64;
    // the contact line starts from whichever extreme sits at the start of the trace
    let rising = y[0] <= y[n - 1];
    let guess = [
        if rising { min } else { max },
        if rising { 2.0 } else { -2.0 } * range_y / range_i,
        0.5 * range_i,
        0.0,
    ];
    let offset_scale = range_y / 10.0;
    let slope_scale = offset_scale / range_i;
    let scales = [offset_scale, slope_scale, range_i / 10.0, slope_scale / 10.0];

    let free = if cfg.force_zero_non_contact_slope { 3 } else { 4 };
    let expand = |p: &[f64]| -> [f64; 4] { [p[0], p[1], p[2], p.get(3).copied().unwrap_or(0.0)] };
    let outcome = least_squares(
        "surface contact",
        |p| {
            let params = expand(p);
            y.iter()
                .enumerate()
                .map(|(i, yi)| bilinear(&params, i as f64) - yi)
                .collect()
        },
        &guess[..free],
        &scales[..free],
        &cfg.lsq,
    )?;
    let params = expand(&outcome.params);
    let [p0, p1, p2, p3] = params;
    debug!("surface contact fit: p0={p0:e} p1={p1:e} p2={p2:.2} p3={p3:e}");

    if p3.abs() > cfg.max_non_contact_slope_ratio * p1.abs() {
        return Err(reject(format!(
            "non-contact slope {p3:e} is not small against the contact slope {p1:e}"
        )));
    }
    let margin = cfg.min_kink_margin * range_i;
    if !(p2 > margin && p2 < range_i - margin) {
        return Err(reject(format!(
            "kink at {p2:.2} leaves no room on one side of {n} samples"
        )));
    }
    if p1.abs() < cfg.min_slope_ratio * guess[1].abs() {
        return Err(reject(format!(
            "contact slope {p1:e} collapsed from the guess {:e}",
            guess[1]
        )));
    }

    let fitted_index = (p2.round() as usize).min(n - 1);
    let (index, kink) = if reversed {
        (n - 1 - fitted_index, range_i - p2)
    } else {
        (fitted_index, p2)
    };
    Ok(SurfaceContact {
        index,
        deflection_offset: p0 + p1 * p2,
        position_offset: position[index],
        kink,
        parameters: params,
        contact_slope: p1,
        non_contact_slope: p3,
        covariance: outcome.covariance,
        reversed,
    })
}

fn reject(reason: String) -> CoreError {
    warn!("rejecting surface contact fit: {reason}");
    CoreError::poor_fit("surface contact", reason)
}

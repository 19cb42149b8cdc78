//! Entropic-elasticity models and their reciprocal-parameter fits.
//!
//! Fits run on `1/contour_length` and `1/segment_length` (persistence length
//! for the WLC, Kuhn length for the FJC family) in a frame where the contact
//! point is the origin and extension and force are both non-negative away
//! from it.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::{FitConfig, PegConstants};
use crate::error::{check_same_len, CoreError, Result};
use crate::fit::lsq::least_squares;

/// Boltzmann constant in J/K.
pub const BOLTZMANN: f64 = 1.380_649e-23;

/// Generic biopolymer segment length used as the starting guess (3.5 Å).
pub const DEFAULT_SEGMENT_GUESS: f64 = 3.5e-10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolymerModel {
    #[default]
    Wlc,
    Fjc,
    FjcPeg,
    ExtendedFjc,
}

impl PolymerModel {
    pub fn name(self) -> &'static str {
        match self {
            PolymerModel::Wlc => "WLC",
            PolymerModel::Fjc => "FJC",
            PolymerModel::FjcPeg => "FJC-PEG",
            PolymerModel::ExtendedFjc => "eFJC",
        }
    }

    /// The WLC is fitted as F(x); the FJC family as x(F).
    fn fits_extension(self) -> bool {
        !matches!(self, PolymerModel::Wlc)
    }
}

/// WLC interpolation formula: force at extension `x`.
///
/// Returns infinity at or beyond the contour length.
pub fn wlc_force(x: f64, contour_length: f64, persistence_length: f64, temperature: f64) -> f64 {
    let rel = x / contour_length;
    if rel >= 1.0 {
        return f64::INFINITY;
    }
    let kt = BOLTZMANN * temperature;
    kt / persistence_length * (0.25 * ((1.0 - rel).powi(-2) - 1.0) + rel)
}

/// coth(u) - 1/u, with its series near zero.
fn langevin(u: f64) -> f64 {
    if u.abs() < 1e-4 {
        return u / 3.0 - u.powi(3) / 45.0;
    }
    1.0 / u.tanh() - 1.0 / u
}

/// FJC extension at force `force`.
pub fn fjc_extension(force: f64, contour_length: f64, kuhn_length: f64, temperature: f64) -> f64 {
    let kt = BOLTZMANN * temperature;
    contour_length * langevin(force * kuhn_length / kt)
}

/// FJC with linearly stretchable segments; `modulus` in N.
pub fn extended_fjc_extension(
    force: f64,
    contour_length: f64,
    kuhn_length: f64,
    temperature: f64,
    modulus: f64,
) -> f64 {
    fjc_extension(force, contour_length, kuhn_length, temperature) * (1.0 + force / modulus)
}

/// Force-dependent PEG monomer length from the planar/helical two-state equilibrium.
pub fn peg_segment_length(force: f64, temperature: f64, peg: &PegConstants) -> f64 {
    let kt = BOLTZMANN * temperature;
    let delta_g = peg.delta_g_kt * kt - force * (peg.planar_length - peg.helical_length);
    peg.planar_length / (1.0 + (-delta_g / kt).exp())
        + peg.helical_length / (1.0 + (delta_g / kt).exp())
}

/// FJC-PEG extension; `contour_length` is the all-planar length of the chain.
pub fn fjc_peg_extension(
    force: f64,
    contour_length: f64,
    kuhn_length: f64,
    temperature: f64,
    peg: &PegConstants,
    modulus: Option<f64>,
) -> f64 {
    let ratio = peg_segment_length(force, temperature, peg) / peg.planar_length;
    let stretch = modulus.map_or(1.0, |k| 1.0 + force / k);
    fjc_extension(force, contour_length, kuhn_length, temperature) * ratio * stretch
}

/// Contact point in the untransformed trace.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContactPoint {
    pub index: usize,
    pub x: f64,
    pub y: f64,
}

impl ContactPoint {
    pub fn at(index: usize, x: &[f64], y: &[f64]) -> Result<Self> {
        check_same_len(x.len(), y.len())?;
        if index >= x.len() {
            return Err(CoreError::IndexOutOfRange {
                index,
                len: x.len(),
            });
        }
        Ok(Self {
            index,
            x: x[index],
            y: y[index],
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub model: PolymerModel,
    /// Physical values of the free parameters: contour length, then the segment length if free.
    pub parameters: Vec<f64>,
    /// Standard errors of `parameters`; `None` when the covariance is singular.
    pub std_errors: Option<Vec<f64>>,
    pub contour_length: f64,
    /// Persistence (WLC) or Kuhn (FJC family) length, fitted or fixed.
    pub segment_length: f64,
    pub segment_length_fixed: bool,
    pub temperature: f64,
    /// Inclusive window of sample indices that were fitted.
    pub window: (usize, usize),
    pub overlay_x: Vec<f64>,
    pub overlay_y: Vec<f64>,
    /// Force RMS residual over the tail noise of the trace; `None` if that noise is zero.
    pub quality: Option<f64>,
    pub iterations: usize,
}

/// Maps between the stored trace and the fit frame.
#[derive(Clone, Copy, Debug)]
struct Frame {
    origin: (f64, f64),
    sign: (f64, f64),
}

impl Frame {
    fn to_fit(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.sign.0 * (x - self.origin.0),
            self.sign.1 * (y - self.origin.1),
        )
    }

    fn to_trace(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.origin.0 + self.sign.0 * x,
            self.origin.1 + self.sign.1 * y,
        )
    }
}

fn orientation(values: &[f64], origin: f64) -> f64 {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if mean < origin {
        -1.0
    } else {
        1.0
    }
}

/// Evaluates a model in the fit frame: force for the WLC, extension for the rest.
fn evaluate(model: PolymerModel, input: f64, contour: f64, segment: f64, cfg: &FitConfig) -> f64 {
    let t = cfg.temperature;
    match model {
        PolymerModel::Wlc => wlc_force(input, contour, segment, t),
        PolymerModel::Fjc => fjc_extension(input, contour, segment, t),
        PolymerModel::ExtendedFjc => match cfg.segment_elasticity {
            Some(k) => extended_fjc_extension(input, contour, segment, t, k),
            None => fjc_extension(input, contour, segment, t),
        },
        PolymerModel::FjcPeg => {
            fjc_peg_extension(input, contour, segment, t, &cfg.peg, cfg.segment_elasticity)
        }
    }
}

/// Fits `cfg.model` to the samples between `boundaries` (inclusive).
///
/// `x` is extension and `y` force for the whole half-curve, stored
/// tip-to-surface.
pub fn fit_polymer(
    x: &[f64],
    y: &[f64],
    contact: ContactPoint,
    boundaries: (usize, usize),
    cfg: &FitConfig,
) -> Result<FitResult> {
    check_same_len(x.len(), y.len())?;
    for index in [boundaries.0, boundaries.1, contact.index] {
        if index >= x.len() {
            return Err(CoreError::IndexOutOfRange {
                index,
                len: x.len(),
            });
        }
    }
    let (lo, hi) = if boundaries.0 <= boundaries.1 {
        boundaries
    } else {
        (boundaries.1, boundaries.0)
    };
    if hi - lo < 2 {
        return Err(CoreError::DegenerateWindow { start: lo, stop: hi });
    }
    let model = cfg.model;
    let context = format!("{} window [{lo}, {hi}]", model.name());

    let raw_x: Vec<f64> = x[lo..=hi].iter().rev().copied().collect();
    let raw_y: Vec<f64> = y[lo..=hi].iter().rev().copied().collect();
    let frame = Frame {
        origin: (contact.x, contact.y),
        sign: (
            orientation(&raw_x, contact.x),
            orientation(&raw_y, contact.y),
        ),
    };
    let (ext, force): (Vec<f64>, Vec<f64>) = raw_x
        .iter()
        .zip(&raw_y)
        .map(|(&xi, &yi)| frame.to_fit(xi, yi))
        .unzip();

    let max_ext = ext.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !(max_ext > 0.0) {
        return Err(CoreError::degenerate(format!(
            "{context}: no extension beyond the contact point"
        )));
    }
    let (input, target) = if model.fits_extension() {
        (&force, &ext)
    } else {
        (&ext, &force)
    };

    let mut initial = vec![1.0 / (1.1 * max_ext)];
    if cfg.fixed_length.is_none() {
        initial.push(1.0 / DEFAULT_SEGMENT_GUESS);
    }
    if let Some(fixed) = cfg.fixed_length {
        if !(fixed > 0.0) {
            return Err(CoreError::InvalidArguments {
                command: context,
                reason: format!("fixed segment length {fixed} must be positive"),
            });
        }
    }
    let segment_of = |p: &[f64]| cfg.fixed_length.unwrap_or_else(|| 1.0 / p[1]);
    let scales = initial.clone();
    let outcome = least_squares(
        &context,
        |p| {
            let contour = 1.0 / p[0];
            let segment = segment_of(p);
            input
                .iter()
                .zip(target.iter())
                .map(|(i, t)| evaluate(model, *i, contour, segment, cfg) - t)
                .collect()
        },
        &initial,
        &scales,
        &cfg.lsq,
    )?;

    let contour = 1.0 / outcome.params[0];
    let segment = segment_of(&outcome.params);
    if !(contour.is_finite() && contour > 0.0 && segment.is_finite() && segment > 0.0) {
        return Err(CoreError::poor_fit(
            context,
            format!("unphysical lengths L={contour:e}, segment={segment:e}"),
        ));
    }
    let mut parameters = vec![contour];
    if cfg.fixed_length.is_none() {
        parameters.push(segment);
    }
    // first-order propagation through the reciprocal: dL = d(1/L) * L^2
    let std_errors = outcome.std_errors().map(|errs| {
        errs.iter()
            .zip(&parameters)
            .map(|(e, value)| e * value * value)
            .collect()
    });

    let (overlay_x, overlay_y) = overlay(model, &ext, &force, contour, segment, frame, cfg);
    let quality = fit_quality(model, &ext, &force, contour, segment, y, cfg);
    debug!(
        "{context}: L={contour:e} m, segment={segment:e} m, quality={quality:?}, {} iterations",
        outcome.iterations
    );
    Ok(FitResult {
        model,
        parameters,
        std_errors,
        contour_length: contour,
        segment_length: segment,
        segment_length_fixed: cfg.fixed_length.is_some(),
        temperature: cfg.temperature,
        window: (lo, hi),
        overlay_x,
        overlay_y,
        quality,
        iterations: outcome.iterations,
    })
}

/// Model curve from the contact point to a few samples past the window, in trace coordinates.
fn overlay(
    model: PolymerModel,
    ext: &[f64],
    force: &[f64],
    contour: f64,
    segment: f64,
    frame: Frame,
    cfg: &FitConfig,
) -> (Vec<f64>, Vec<f64>) {
    let domain = if model.fits_extension() { force } else { ext };
    let n = domain.len();
    let max = domain.iter().cloned().fold(0.0, f64::max);
    let step = max / (n.max(2) - 1) as f64;
    let count = n + cfg.overlay_extra_samples;
    let mut xs = Vec::with_capacity(count);
    let mut ys = Vec::with_capacity(count);
    for i in 0..count {
        let input = i as f64 * step;
        let value = evaluate(model, input, contour, segment, cfg);
        if !value.is_finite() {
            continue;
        }
        let (e, f) = if model.fits_extension() {
            (value, input)
        } else {
            (input, value)
        };
        let (tx, ty) = frame.to_trace(e, f);
        xs.push(tx);
        ys.push(ty);
    }
    (xs, ys)
}

/// RMS force residual over the standard deviation of the trace's last samples.
fn fit_quality(
    model: PolymerModel,
    ext: &[f64],
    force: &[f64],
    contour: f64,
    segment: f64,
    trace_y: &[f64],
    cfg: &FitConfig,
) -> Option<f64> {
    let tail = &trace_y[trace_y.len().saturating_sub(cfg.noise_samples.max(2))..];
    let mean = tail.iter().sum::<f64>() / tail.len() as f64;
    let noise = (tail.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / tail.len() as f64).sqrt();
    let scale = tail.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    // a spread at rounding level is no noise estimate
    if !(noise > tail.len() as f64 * f64::EPSILON * scale) {
        return None;
    }
    let residuals: Vec<f64> = ext
        .iter()
        .zip(force)
        .filter_map(|(&e, &f)| {
            let predicted = if model.fits_extension() {
                invert_extension(|g| evaluate(model, g, contour, segment, cfg), e, f)?
            } else {
                evaluate(model, e, contour, segment, cfg)
            };
            Some(predicted - f)
        })
        .collect();
    if residuals.is_empty() {
        return None;
    }
    let rms = (residuals.iter().map(|r| r * r).sum::<f64>() / residuals.len() as f64).sqrt();
    rms.is_finite().then_some(rms / noise)
}

/// Solves `extension(F) = target` for a monotone model by bracketing and bisection.
fn invert_extension<G: Fn(f64) -> f64>(extension: G, target: f64, hint: f64) -> Option<f64> {
    let mut span = hint.abs().max(1e-15);
    let (mut lo, mut hi) = (-span, span);
    for _ in 0..200 {
        if extension(lo) <= target && extension(hi) >= target {
            break;
        }
        span *= 2.0;
        lo = -span;
        hi = span;
    }
    if !(extension(lo) <= target && extension(hi) >= target) {
        return None;
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if extension(mid) < target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Some(0.5 * (lo + hi))
}

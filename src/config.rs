use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::fit::PolymerModel;
use crate::signal::Stencil;
use crate::types::Arguments;

/// Levenberg–Marquardt stopping rules.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LsqConfig {
    /// Solver patience: at most `max_iterations * (k + 1)` residual evaluations for `k` parameters.
    pub max_iterations: usize,
    /// Relative reduction of the cost below which the fit is converged.
    pub ftol: f64,
    /// Relative step size (in scaled parameters) below which the fit is converged.
    pub xtol: f64,
    /// Gradient norm relative to the cost below which the fit is converged.
    pub gtol: f64,
}

impl Default for LsqConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            ftol: 1e-12,
            xtol: 1e-12,
            gtol: 1e-12,
        }
    }
}

/// Bilinear contact-point estimator options.
///
/// The three ratio thresholds are heuristics; they reject fits rather than steer them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub force_zero_non_contact_slope: bool,
    /// Largest allowed |non-contact slope| / |contact slope|.
    pub max_non_contact_slope_ratio: f64,
    /// Fraction of the index range the kink must keep from either end.
    pub min_kink_margin: f64,
    /// Smallest allowed |fitted contact slope| / |guessed contact slope|.
    pub min_slope_ratio: f64,
    pub lsq: LsqConfig,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            force_zero_non_contact_slope: true,
            max_non_contact_slope_ratio: 0.1,
            min_kink_margin: 0.02,
            min_slope_ratio: 0.5,
            lsq: LsqConfig::default(),
        }
    }
}

/// Leading region excluded from the peak search.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlindWindow {
    Points(usize),
    /// Physical distance, converted to points with the mean x spacing.
    Distance(f64),
}

impl Default for BlindWindow {
    fn default() -> Self {
        BlindWindow::Points(0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvolutionConfig {
    pub kernel: Vec<f64>,
    pub median_window: usize,
    pub blind_window: BlindWindow,
    /// Peak threshold as a multiple of the noise floor.
    pub min_deviation: f64,
    /// Level (multiple of the noise floor) that delimits the extent of a peak.
    /// Must not exceed `min_deviation`; lower `support_deviation` with it.
    pub support_deviation: f64,
    /// Minimum number of above-threshold samples in a peak.
    pub min_peak_length: usize,
    /// Support runs closer than this many samples belong to the same peak.
    pub see_double: usize,
    pub positive_only: bool,
    /// Relative deviation change that ends noise trimming.
    pub stable: f64,
    /// Largest fraction of samples the noise estimate may trim.
    pub max_cut: f64,
    /// Half-width of the window searched for the deflection minimum.
    pub refine_window: usize,
}

impl Default for ConvolutionConfig {
    fn default() -> Self {
        Self {
            kernel: vec![1.0, 1.0, 1.0, 1.0, 1.0, -10.0, 1.0, 1.0, 1.0, 1.0, 1.0],
            median_window: 7,
            blind_window: BlindWindow::default(),
            min_deviation: 5.0,
            support_deviation: 3.0,
            min_peak_length: 3,
            see_double: 10,
            positive_only: false,
            stable: 0.005,
            max_cut: 0.2,
            refine_window: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatFilterConfig {
    pub median_window: usize,
    /// Threshold as a multiple of the mean absolute derivative.
    pub min_deviation: f64,
    /// Curves with fewer features than this report zero.
    pub min_npks: usize,
    pub min_run_length: usize,
    pub stencil: Stencil,
}

impl Default for FlatFilterConfig {
    fn default() -> Self {
        Self {
            median_window: 7,
            min_deviation: 9.0,
            min_npks: 4,
            min_run_length: 1,
            stencil: Stencil::Forward,
        }
    }
}

/// Two-state PEG monomer constants (lengths in m, free energy in units of kT).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PegConstants {
    pub planar_length: f64,
    pub helical_length: f64,
    pub delta_g_kt: f64,
}

impl Default for PegConstants {
    fn default() -> Self {
        Self {
            planar_length: 0.358e-9,
            helical_length: 0.280e-9,
            delta_g_kt: 3.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub model: PolymerModel,
    /// Kelvin.
    pub temperature: f64,
    /// Fixed persistence/Kuhn length in m; `None` frees it.
    pub fixed_length: Option<f64>,
    pub overlay_extra_samples: usize,
    /// Tail samples of the force trace used as the noise reference.
    pub noise_samples: usize,
    pub peg: PegConstants,
    /// Segment stretch modulus in N (extended FJC and FJC-PEG).
    pub segment_elasticity: Option<f64>,
    pub lsq: LsqConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            model: PolymerModel::Wlc,
            temperature: 293.0,
            fixed_length: None,
            overlay_extra_samples: 5,
            noise_samples: 20,
            peg: PegConstants::default(),
            segment_elasticity: None,
            lsq: LsqConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlattenConfig {
    pub max_degree: usize,
    /// Relative RMS improvement a higher degree must bring to be preferred.
    pub min_improvement: f64,
}

impl Default for FlattenConfig {
    fn default() -> Self {
        Self {
            max_degree: 1,
            min_improvement: 0.01,
        }
    }
}

/// Deserializes a recorded argument map into a typed config; absent keys keep defaults.
pub fn from_arguments<T: DeserializeOwned>(command: &str, arguments: &Arguments) -> Result<T> {
    let object = Value::Object(
        arguments
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    serde_json::from_value(object).map_err(|e| CoreError::InvalidArguments {
        command: command.to_string(),
        reason: e.to_string(),
    })
}

//! Velocity-clamp column derivations.
//!
//! Each operation reads named columns, appends (or replaces) a derived
//! column, and leaves the raw columns alone.

use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::config::{FlattenConfig, SurfaceConfig};
use crate::data::{require_unit, DataBlock};
use crate::error::{CoreError, Result};
use crate::surface::{fit_surface_contact, SurfaceContact};

pub const Z_PIEZO: &str = "z piezo (m)";
pub const DEFLECTION: &str = "deflection (m)";
pub const SURFACE_DISTANCE: &str = "surface distance (m)";
pub const SURFACE_DEFLECTION: &str = "surface deflection (m)";
pub const FORCE: &str = "deflection (N)";
pub const ADJUSTED_EXTENSION: &str = "cantilever adjusted extension (m)";
pub const FLATTENED_FORCE: &str = "flattened deflection (N)";

pub const SPRING_CONSTANT: &str = "spring constant (N/m)";
pub const SURFACE_CONTACT_KEY: &str = "surface contact";
pub const FLATTEN_KEY: &str = "flatten";

/// Fits the contact point and adds surface-relative distance and deflection.
///
/// Distance is zero at contact and positive on the non-contact side.
pub fn zero_surface_contact_point(
    block: &mut DataBlock,
    cfg: &SurfaceConfig,
) -> Result<SurfaceContact> {
    let z = block.column_vec(Z_PIEZO)?;
    let deflection = block.column_vec(DEFLECTION)?;
    let contact = fit_surface_contact(&z, &deflection, cfg)?;
    let distance: Vec<f64> = z.iter().map(|v| v - contact.position_offset).collect();
    let surface_deflection: Vec<f64> = deflection
        .iter()
        .map(|v| v - contact.deflection_offset)
        .collect();
    block.set_column(SURFACE_DISTANCE, &distance)?;
    block.set_column(SURFACE_DEFLECTION, &surface_deflection)?;
    block.set_info_json(SURFACE_CONTACT_KEY, &contact)?;
    debug!(
        "{}: contact at row {} ({:e} m)",
        block.name().unwrap_or("block"),
        contact.index,
        contact.position_offset
    );
    Ok(contact)
}

fn spring_constant(block: &DataBlock) -> Result<f64> {
    let k = block.info_f64(SPRING_CONSTANT)?;
    if !(k > 0.0 && k.is_finite()) {
        return Err(CoreError::InvalidArguments {
            command: "add block force array".into(),
            reason: format!("spring constant {k} must be positive"),
        });
    }
    Ok(k)
}

/// Converts a deflection column in metres into `deflection (N)`.
pub fn add_force_array(block: &mut DataBlock, deflection_column: &str) -> Result<()> {
    require_unit(deflection_column, "m")?;
    let deflection = block.column_vec(deflection_column)?;
    let k = spring_constant(block)?;
    let force: Vec<f64> = deflection.iter().map(|d| d * k).collect();
    block.set_column(FORCE, &force)
}

/// Removes cantilever bending from the surface distance.
pub fn add_cantilever_adjusted_extension_array(block: &mut DataBlock) -> Result<()> {
    let distance = block.column_vec(SURFACE_DISTANCE)?;
    let force = block.column_vec(FORCE)?;
    let k = spring_constant(block)?;
    let extension: Vec<f64> = distance
        .iter()
        .zip(&force)
        .map(|(z, f)| z - f / k)
        .collect();
    block.set_column(ADJUSTED_EXTENSION, &extension)
}

/// Baseline chosen by [`add_flattened_extension_array`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Flattening {
    pub degree: usize,
    /// Polynomial coefficients in extension (m), lowest order first.
    pub coefficients: Vec<f64>,
    pub rms: f64,
    pub samples: usize,
}

impl Flattening {
    pub fn baseline(&self, x: f64) -> f64 {
        self.coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
    }
}

/// Subtracts a polynomial baseline fitted to the off-surface force.
///
/// Degrees `0..=max_degree` are tried; a higher degree wins only if it
/// lowers the residual RMS by more than `min_improvement` (relative).
pub fn add_flattened_extension_array(
    block: &mut DataBlock,
    cfg: &FlattenConfig,
) -> Result<Flattening> {
    let extension = block.column_vec(ADJUSTED_EXTENSION)?;
    let force = block.column_vec(FORCE)?;
    let (xs, ys): (Vec<f64>, Vec<f64>) = extension
        .iter()
        .zip(&force)
        .filter(|(x, _)| **x > 0.0)
        .map(|(x, f)| (*x, *f))
        .unzip();
    if xs.is_empty() {
        return Err(CoreError::degenerate("no off-surface samples to flatten"));
    }

    // improvements below rounding of the force values do not count
    let resolution = f64::EPSILON * ys.iter().fold(0.0_f64, |m, y| m.max(y.abs()));
    let mut best: Option<Flattening> = None;
    for degree in 0..=cfg.max_degree {
        if xs.len() <= degree {
            break;
        }
        let candidate = fit_polynomial(&xs, &ys, degree)?;
        best = match best {
            Some(current)
                if current.rms - candidate.rms
                    <= cfg.min_improvement * current.rms + resolution =>
            {
                Some(current)
            }
            _ => Some(candidate),
        };
    }
    let flattening =
        best.ok_or_else(|| CoreError::degenerate("no polynomial degree could be fitted"))?;
    let flattened: Vec<f64> = extension
        .iter()
        .zip(&force)
        .map(|(x, f)| f - flattening.baseline(*x))
        .collect();
    block.set_column(FLATTENED_FORCE, &flattened)?;
    block.set_info_json(FLATTEN_KEY, &flattening)?;
    debug!(
        "flatten: degree {} over {} samples, rms {:e}",
        flattening.degree, flattening.samples, flattening.rms
    );
    Ok(flattening)
}

fn fit_polynomial(xs: &[f64], ys: &[f64], degree: usize) -> Result<Flattening> {
    // fit in x / scale to keep the Vandermonde matrix conditioned
    let scale = xs.iter().fold(0.0_f64, |m, x| m.max(x.abs()));
    let scale = if scale > 0.0 { scale } else { 1.0 };
    let vander = DMatrix::from_fn(xs.len(), degree + 1, |i, j| (xs[i] / scale).powi(j as i32));
    let rhs = DVector::from_column_slice(ys);
    let solved = vander
        .clone()
        .svd(true, true)
        .solve(&rhs, 1e-14)
        .map_err(|e| CoreError::degenerate(format!("degree {degree} baseline: {e}")))?;
    let residual = &vander * &solved - &rhs;
    let rms = (residual.norm_squared() / xs.len() as f64).sqrt();
    let coefficients = solved
        .iter()
        .enumerate()
        .map(|(j, c)| c / scale.powi(j as i32))
        .collect();
    Ok(Flattening {
        degree,
        coefficients,
        rms,
        samples: xs.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::bilinear;
    use approx::assert_relative_eq;
    use serde_json::json;

    const K: f64 = 0.05;

    fn retract() -> DataBlock {
        let n = 400;
        let params = [0.0, 5e-11, 120.0, 0.0];
        let z: Vec<f64> = (0..n).map(|i| i as f64 * 1e-9).collect();
        let d: Vec<f64> = (0..n).map(|i| 3e-9 + bilinear(&params, i as f64)).collect();
        DataBlock::from_columns(vec![(Z_PIEZO, z), (DEFLECTION, d)])
            .unwrap()
            .with_name("retract")
            .with_info(SPRING_CONSTANT, json!(K))
    }

    #[test]
    fn contact_zeroing_adds_surface_columns() {
        let mut block = retract();
        let contact = zero_surface_contact_point(&mut block, &SurfaceConfig::default()).unwrap();
        assert_eq!(contact.index, 120);
        let distance = block.column_vec(SURFACE_DISTANCE).unwrap();
        assert_relative_eq!(distance[120], 0.0, epsilon = 1e-18);
        assert!(distance[300] > 0.0);
        let flat = block.column_vec(SURFACE_DEFLECTION).unwrap();
        assert_relative_eq!(flat[399], 0.0, epsilon = 1e-13);
        let stored: SurfaceContact = block.info_json(SURFACE_CONTACT_KEY).unwrap();
        assert_eq!(stored, contact);
        // raw columns are untouched
        assert_eq!(block.column_vec(DEFLECTION).unwrap()[0], 3e-9);
    }

    #[test]
    fn force_requires_a_spring_constant_and_metres() {
        let mut block = retract();
        add_force_array(&mut block, DEFLECTION).unwrap();
        assert_relative_eq!(block.column_vec(FORCE).unwrap()[0], 3e-9 * K);

        let mut bare = DataBlock::from_columns(vec![(DEFLECTION, vec![1.0, 2.0])]).unwrap();
        let err = add_force_array(&mut bare, DEFLECTION).unwrap_err();
        assert!(matches!(err, CoreError::MissingInfo { ref key } if key == SPRING_CONSTANT));
        let err = add_force_array(&mut block, FORCE).unwrap_err();
        assert!(matches!(err, CoreError::UnitMismatch { .. }));
    }

    #[test]
    fn adjusted_extension_needs_its_inputs() {
        let mut block = retract();
        let err = add_cantilever_adjusted_extension_array(&mut block).unwrap_err();
        assert!(matches!(err, CoreError::MissingColumn { ref column, .. } if column == SURFACE_DISTANCE));

        zero_surface_contact_point(&mut block, &SurfaceConfig::default()).unwrap();
        add_force_array(&mut block, SURFACE_DEFLECTION).unwrap();
        add_cantilever_adjusted_extension_array(&mut block).unwrap();
        let ext = block.column_vec(ADJUSTED_EXTENSION).unwrap();
        let dist = block.column_vec(SURFACE_DISTANCE).unwrap();
        let force = block.column_vec(FORCE).unwrap();
        assert_relative_eq!(ext[10], dist[10] - force[10] / K, epsilon = 1e-20);
    }

    #[test]
    fn flattening_prefers_the_simplest_adequate_degree() {
        let x: Vec<f64> = (0..100).map(|i| i as f64 * 1e-9 + 1e-10).collect();
        let tilted: Vec<f64> = x.iter().map(|v| 2e-12 + 1e-4 * v).collect();
        let mut block =
            DataBlock::from_columns(vec![(ADJUSTED_EXTENSION, x.clone()), (FORCE, tilted)]).unwrap();

        let constant = add_flattened_extension_array(&mut block, &FlattenConfig {
            max_degree: 0,
            ..FlattenConfig::default()
        })
        .unwrap();
        assert_eq!(constant.degree, 0);

        let linear = add_flattened_extension_array(&mut block, &FlattenConfig::default()).unwrap();
        assert_eq!(linear.degree, 1);
        assert_relative_eq!(linear.coefficients[1], 1e-4, max_relative = 1e-6);
        let flattened = block.column_vec(FLATTENED_FORCE).unwrap();
        assert!(flattened.iter().all(|v| v.abs() < 1e-18));
        assert_eq!(block.info_json::<Flattening>(FLATTEN_KEY).unwrap(), linear);

        // a constant baseline gains nothing from a slope
        let level = vec![4e-12; 100];
        let mut block = DataBlock::from_columns(vec![(ADJUSTED_EXTENSION, x), (FORCE, level)]).unwrap();
        let chosen = add_flattened_extension_array(&mut block, &FlattenConfig::default()).unwrap();
        assert_eq!(chosen.degree, 0);
    }
}

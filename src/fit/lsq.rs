//! Levenberg–Marquardt least squares on scaled parameters.
//!
//! The solver itself is the MINPACK port from the `levenberg-marquardt`
//! crate. This module feeds it `u = p / scale`, so parameters that differ by
//! many orders of magnitude (a sample index next to a deflection in metres,
//! or a reciprocal length of 1e9 m^-1) all move by O(1) amounts, and derives
//! the covariance of the physical parameters afterwards. Derivatives are
//! forward differences in `u`; a residual vector with non-finite entries
//! marks a trial point as infeasible, which the solver sees as a very poor
//! step and rejects.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use log::debug;
use nalgebra::{DMatrix, DVector, Dyn, Owned};
use serde::{Deserialize, Serialize};

use crate::config::LsqConfig;
use crate::error::{CoreError, Result};

const DIFF_STEP: f64 = 1.490_116_119_384_765_6e-8;
/// Residual reported for every sample at an infeasible point.
const INFEASIBLE: f64 = 1e100;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LsqOutcome {
    pub params: Vec<f64>,
    /// Parameter covariance, `None` when the normal matrix is singular.
    pub covariance: Option<Vec<Vec<f64>>>,
    /// Sum of squared residuals at `params`.
    pub ssr: f64,
    pub residual_count: usize,
    /// Residual evaluations spent by the solver.
    pub iterations: usize,
}

impl LsqOutcome {
    pub fn std_errors(&self) -> Option<Vec<f64>> {
        self.covariance.as_ref().map(|cov| {
            cov.iter()
                .enumerate()
                .map(|(i, row)| row[i].max(0.0).sqrt())
                .collect()
        })
    }

    pub fn rms(&self) -> f64 {
        if self.residual_count == 0 {
            return 0.0;
        }
        (self.ssr / self.residual_count as f64).sqrt()
    }
}

/// User residuals seen through the parameter scaling.
struct ScaledProblem<'a, F> {
    residuals: &'a F,
    scales: &'a [f64],
    count: usize,
    u: DVector<f64>,
    r: Option<DVector<f64>>,
}

impl<F> ScaledProblem<'_, F>
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    fn to_params(&self, u: &DVector<f64>) -> Vec<f64> {
        u.iter().zip(self.scales).map(|(ui, s)| ui * s).collect()
    }

    fn eval(&self, u: &DVector<f64>) -> Option<DVector<f64>> {
        let r = (self.residuals)(&self.to_params(u));
        if r.len() == self.count && r.iter().all(|v| v.is_finite()) {
            Some(DVector::from_vec(r))
        } else {
            None
        }
    }
}

impl<F> LeastSquaresProblem<f64, Dyn, Dyn> for ScaledProblem<'_, F>
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, u: &DVector<f64>) {
        self.u = u.clone();
        self.r = self.eval(u);
    }

    fn params(&self) -> DVector<f64> {
        self.u.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(
            self.r
                .clone()
                .unwrap_or_else(|| DVector::from_element(self.count, INFEASIBLE)),
        )
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let r = self.r.as_ref()?;
        jacobian(&|u: &DVector<f64>| self.eval(u), &self.u, r)
    }
}

/// Minimises `sum(residuals(p)^2)` starting from `initial`.
///
/// `scales` gives the natural magnitude of each parameter; zero or
/// non-finite scales fall back to 1. `context` names the fit in errors.
/// `cfg.max_iterations` bounds the residual evaluations at
/// `max_iterations * (k + 1)` for `k` parameters.
pub fn least_squares<F>(
    context: &str,
    residuals: F,
    initial: &[f64],
    scales: &[f64],
    cfg: &LsqConfig,
) -> Result<LsqOutcome>
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    if initial.len() != scales.len() {
        return Err(CoreError::LengthMismatch {
            expected: initial.len(),
            actual: scales.len(),
        });
    }
    let k = initial.len();
    let scales: Vec<f64> = scales
        .iter()
        .map(|s| if s.is_finite() && *s != 0.0 { s.abs() } else { 1.0 })
        .collect();
    let u0 = DVector::from_iterator(k, initial.iter().zip(&scales).map(|(p, s)| p / s));
    let r0 = residuals(initial);
    let m = r0.len();
    if !r0.iter().all(|v| v.is_finite()) {
        return Err(CoreError::poor_fit(
            context,
            "non-finite residuals at the initial guess",
        ));
    }
    if m < k || k == 0 {
        return Err(CoreError::degenerate(format!(
            "{context}: {m} residuals cannot determine {k} parameters"
        )));
    }

    let mut problem = ScaledProblem {
        residuals: &residuals,
        scales: &scales,
        count: m,
        u: u0.clone(),
        r: None,
    };
    problem.set_params(&u0);
    let solver = LevenbergMarquardt::new()
        .with_ftol(cfg.ftol)
        .with_xtol(cfg.xtol)
        .with_gtol(cfg.gtol)
        .with_patience(cfg.max_iterations.max(1));
    let (problem, report) = solver.minimize(problem);
    let iterations = report.number_of_evaluations;

    let settled = matches!(report.termination, TerminationReason::NoImprovementPossible(_));
    if !(report.termination.was_successful() || settled) {
        let reason = match report.termination {
            TerminationReason::LostPatience => {
                format!("no convergence within {iterations} evaluations")
            }
            other => format!("solver stopped: {other:?}"),
        };
        return Err(CoreError::poor_fit(context, reason));
    }
    if settled {
        // tolerances tighter than machine precision
        debug!("{context}: stagnated after {iterations} evaluations");
    }
    let Some(r) = problem.r.clone() else {
        return Err(CoreError::poor_fit(context, "solver ended at an infeasible point"));
    };
    let params = problem.to_params(&problem.u);
    if params.iter().any(|p| !p.is_finite()) {
        return Err(CoreError::poor_fit(context, "non-finite parameters"));
    }
    let cost = r.norm_squared();

    let covariance = problem.jacobian().and_then(|jac| {
        let dof = if m > k { (m - k) as f64 } else { 1.0 };
        let variance = cost / dof;
        (jac.transpose() * &jac).try_inverse().map(|inv| {
            (0..k)
                .map(|i| {
                    (0..k)
                        .map(|j| inv[(i, j)] * variance * scales[i] * scales[j])
                        .collect()
                })
                .collect()
        })
    });
    debug!("{context}: converged after {iterations} evaluations, ssr={cost:e}");
    Ok(LsqOutcome {
        params,
        covariance,
        ssr: cost,
        residual_count: m,
        iterations,
    })
}

fn jacobian<E>(eval: &E, u: &DVector<f64>, r: &DVector<f64>) -> Option<DMatrix<f64>>
where
    E: Fn(&DVector<f64>) -> Option<DVector<f64>>,
{
    let mut jac = DMatrix::zeros(r.len(), u.len());
    for j in 0..u.len() {
        let h = DIFF_STEP * u[j].abs().max(1.0);
        let mut shifted = u.clone();
        shifted[j] += h;
        let column = match eval(&shifted) {
            Some(fwd) => (fwd - r) / h,
            None => {
                // forward step left the feasible region, try the other side
                shifted[j] = u[j] - h;
                (r - eval(&shifted)?) / h
            }
        };
        jac.set_column(j, &column);
    }
    Some(jac)
}

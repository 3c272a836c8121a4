//! Bounded Levenberg-Marquardt solver over a [`LeastSquaresProblem`].
//!
//! Every accepted iterate lies inside the box bounds: trial points are
//! clipped to the box before their cost is evaluated. Running out of
//! iterations is reported as [`Termination::BudgetExhausted`], never as
//! convergence.

use crate::optimization::problem::{check_jacobian, LeastSquaresProblem};
use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const MIN_DAMPING: f64 = 1e-15;
const MIN_DIAGONAL: f64 = 1e-12;

/// Cooperative cancellation flag, checked by the solver at iteration
/// boundaries only.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Box bounds on the parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Bounds {
    pub lower: DVector<f64>,
    pub upper: DVector<f64>,
}

impl Bounds {
    pub fn new(lower: DVector<f64>, upper: DVector<f64>) -> Self {
        Self { lower, upper }
    }

    /// `center ± half_width`, per component.
    pub fn around(center: &DVector<f64>, half_width: &DVector<f64>) -> Self {
        Self {
            lower: center - half_width,
            upper: center + half_width,
        }
    }

    /// Unbounded in every component. Rejected by [`LevenbergMarquardt::solve`],
    /// which requires finite bounds; useful as a starting point for callers.
    pub fn unbounded(len: usize) -> Self {
        Self {
            lower: DVector::from_element(len, f64::NEG_INFINITY),
            upper: DVector::from_element(len, f64::INFINITY),
        }
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    pub fn contains(&self, x: &DVector<f64>) -> bool {
        x.len() == self.len()
            && x
                .iter()
                .zip(self.lower.iter().zip(self.upper.iter()))
                .all(|(v, (lo, hi))| *lo <= *v && *v <= *hi)
    }

    pub fn clamp(&self, x: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            x.len(),
            x.iter()
                .zip(self.lower.iter().zip(self.upper.iter()))
                .map(|(v, (lo, hi))| v.clamp(*lo, *hi)),
        )
    }

    fn validate(&self, x0: &DVector<f64>) -> Result<(), String> {
        if self.lower.len() != self.upper.len() {
            return Err(format!(
                "lower bound has {} entries, upper bound has {}",
                self.lower.len(),
                self.upper.len()
            ));
        }
        if x0.len() != self.len() {
            return Err(format!(
                "initial vector has {} entries, bounds have {}",
                x0.len(),
                self.len()
            ));
        }
        for i in 0..self.len() {
            let (lo, hi) = (self.lower[i], self.upper[i]);
            if !lo.is_finite() || !hi.is_finite() {
                return Err(format!("bound {i} is not finite"));
            }
            if lo > hi {
                return Err(format!("bound {i} has lower {lo} above upper {hi}"));
            }
            if !(lo..=hi).contains(&x0[i]) {
                return Err(format!(
                    "initial value {} of parameter {i} lies outside [{lo}, {hi}]",
                    x0[i]
                ));
            }
        }
        Ok(())
    }
}

/// Tuning knobs of [`LevenbergMarquardt`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub max_iterations: usize,
    /// Converged once an iterate moves less than this (Euclidean norm).
    pub x_tolerance: f64,
    /// Longest step allowed in a single iteration.
    pub max_step: f64,
    pub initial_damping: f64,
    pub damping_increase: f64,
    pub damping_decrease: f64,
    /// Damping above this means no descent direction is left.
    pub max_damping: f64,
    /// Tolerance of the Jacobian check at `x0`; disabled when `None`.
    pub derivative_check: Option<f64>,
    /// Keep every accepted iterate in [`SolverReport::trajectory`].
    pub record_trajectory: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            x_tolerance: 1e-10,
            max_step: 0.5,
            initial_damping: 1e-3,
            damping_increase: 10.0,
            damping_decrease: 10.0,
            max_damping: 1e16,
            derivative_check: None,
            record_trajectory: false,
        }
    }
}

impl SolverOptions {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_x_tolerance(mut self, x_tolerance: f64) -> Self {
        self.x_tolerance = x_tolerance;
        self
    }

    pub fn with_max_step(mut self, max_step: f64) -> Self {
        self.max_step = max_step;
        self
    }

    pub fn with_derivative_check(mut self, tolerance: f64) -> Self {
        self.derivative_check = Some(tolerance);
        self
    }

    pub fn with_trajectory(mut self, record_trajectory: bool) -> Self {
        self.record_trajectory = record_trajectory;
        self
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_iterations == 0 {
            return Err("max_iterations must be at least 1".to_string());
        }
        let positive = [
            ("x_tolerance", self.x_tolerance),
            ("max_step", self.max_step),
            ("initial_damping", self.initial_damping),
            ("max_damping", self.max_damping),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(format!("{name} must be positive and finite, found {value}"));
            }
        }
        if !(self.damping_increase > 1.0 && self.damping_decrease > 1.0) {
            return Err("damping factors must be greater than 1".to_string());
        }
        if let Some(tolerance) = self.derivative_check {
            if !(tolerance.is_finite() && tolerance > 0.0) {
                return Err(format!("derivative check tolerance must be positive, found {tolerance}"));
            }
        }
        Ok(())
    }
}

/// Why a solve stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Converged,
    BudgetExhausted,
    DerivativeCheckFailed {
        residual: usize,
        parameter: usize,
        analytic: f64,
        numeric: f64,
    },
    ConstraintInconsistent(String),
    Cancelled,
    NumericalFailure(String),
}

impl Termination {
    /// Short, stable name of the termination class.
    pub fn class(&self) -> &'static str {
        match self {
            Termination::Converged => "converged",
            Termination::BudgetExhausted => "budget-exhausted",
            Termination::DerivativeCheckFailed { .. } => "derivative-check-failed",
            Termination::ConstraintInconsistent(_) => "constraint-inconsistent",
            Termination::Cancelled => "cancelled",
            Termination::NumericalFailure(_) => "numerical-failure",
        }
    }

    /// `Converged` and `BudgetExhausted` both leave a usable iterate.
    pub fn has_solution(&self) -> bool {
        matches!(self, Termination::Converged | Termination::BudgetExhausted)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::DerivativeCheckFailed {
                residual,
                parameter,
                analytic,
                numeric,
            } => write!(
                f,
                "derivative-check-failed (residual {residual}, parameter {parameter}: analytic {analytic:e}, numeric {numeric:e})"
            ),
            Termination::ConstraintInconsistent(reason) => {
                write!(f, "constraint-inconsistent ({reason})")
            }
            Termination::NumericalFailure(reason) => write!(f, "numerical-failure ({reason})"),
            other => f.write_str(other.class()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationRecord {
    pub iteration: usize,
    /// Cost `½‖r‖²` after the iteration.
    pub cost: f64,
    pub step_norm: f64,
    pub damping: f64,
    pub accepted: bool,
}

/// Diagnostic record of one solve.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverReport {
    pub iterations: usize,
    pub termination: Termination,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub history: Vec<IterationRecord>,
    /// Accepted iterates, starting with `x0`. Empty unless requested.
    pub trajectory: Vec<DVector<f64>>,
}

impl SolverReport {
    fn new(termination: Termination) -> Self {
        Self {
            iterations: 0,
            termination,
            initial_cost: f64::NAN,
            final_cost: f64::NAN,
            history: Vec::new(),
            trajectory: Vec::new(),
        }
    }
}

impl fmt::Display for SolverReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} iterations (cost {:.6e} → {:.6e})",
            self.termination, self.iterations, self.initial_cost, self.final_cost
        )
    }
}

/// A solve that produced no usable iterate.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SolverError {
    #[error("rejected before iterating: {0}")]
    Rejected(SolverReport),
    #[error("{0}")]
    DerivativeCheckFailed(SolverReport),
    #[error("{0}")]
    Cancelled(SolverReport),
    #[error("{0}")]
    NumericalFailure(SolverReport),
}

impl SolverError {
    pub fn report(&self) -> &SolverReport {
        match self {
            SolverError::Rejected(report)
            | SolverError::DerivativeCheckFailed(report)
            | SolverError::Cancelled(report)
            | SolverError::NumericalFailure(report) => report,
        }
    }

    fn from_report(report: SolverReport) -> Self {
        match report.termination {
            Termination::DerivativeCheckFailed { .. } => SolverError::DerivativeCheckFailed(report),
            Termination::Cancelled => SolverError::Cancelled(report),
            Termination::NumericalFailure(_) => SolverError::NumericalFailure(report),
            _ => SolverError::Rejected(report),
        }
    }
}

/// Final iterate and its report.
#[derive(Debug, Clone)]
pub struct SolverOutput {
    pub x: DVector<f64>,
    pub report: SolverReport,
}

#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardt {
    options: SolverOptions,
}

impl LevenbergMarquardt {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Minimises `½‖r(x)‖²` subject to `bounds`, starting from `x0`.
    ///
    /// # Arguments
    ///
    /// * `problem` - Residual and Jacobian of the objective.
    /// * `x0` - Initial parameter vector, must lie inside `bounds`.
    /// * `bounds` - Finite box bounds, never violated by an accepted iterate.
    /// * `cancel` - Optional flag polled once per iteration.
    ///
    /// # Returns
    ///
    /// * `Ok(SolverOutput)` - The solve converged or ran out of iterations.
    /// * `Err(SolverError)` - Inputs were inconsistent, the derivative check
    ///   failed, the solve was cancelled or the arithmetic broke down.
    pub fn solve<P: LeastSquaresProblem + ?Sized>(
        &self,
        problem: &P,
        x0: &DVector<f64>,
        bounds: &Bounds,
        cancel: Option<&CancellationToken>,
    ) -> Result<SolverOutput, SolverError> {
        let options = &self.options;
        let fail = |termination: Termination| SolverError::from_report(SolverReport::new(termination));

        if let Err(reason) = options.validate() {
            return Err(fail(Termination::ConstraintInconsistent(reason)));
        }
        if x0.len() != problem.num_parameters() {
            return Err(fail(Termination::ConstraintInconsistent(format!(
                "problem has {} parameters, initial vector has {}",
                problem.num_parameters(),
                x0.len()
            ))));
        }
        if let Err(reason) = bounds.validate(x0) {
            return Err(fail(Termination::ConstraintInconsistent(reason)));
        }

        if let Some(tolerance) = options.derivative_check {
            if let Some(mismatch) = check_jacobian(problem, x0, tolerance) {
                return Err(fail(Termination::DerivativeCheckFailed {
                    residual: mismatch.residual,
                    parameter: mismatch.parameter,
                    analytic: mismatch.analytic,
                    numeric: mismatch.numeric,
                }));
            }
        }

        let mut x = x0.clone();
        let mut residual = problem.residual(&x);
        let mut cost = 0.5 * residual.norm_squared();
        let mut report = SolverReport::new(Termination::BudgetExhausted);
        report.initial_cost = cost;
        report.final_cost = cost;
        if options.record_trajectory {
            report.trajectory.push(x.clone());
        }
        if !cost.is_finite() {
            report.termination = Termination::NumericalFailure("initial residual is not finite".to_string());
            return Err(SolverError::from_report(report));
        }

        debug!(
            "LM start: {} parameters, {} residuals, cost {:.6e}",
            x.len(),
            residual.len(),
            cost
        );

        let mut damping = options.initial_damping;
        let mut jacobian: Option<DMatrix<f64>> = None;

        for iteration in 1..=options.max_iterations {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                report.termination = Termination::Cancelled;
                break;
            }
            report.iterations = iteration;

            // Reused after a rejected step, the iterate did not move.
            let j = match jacobian.take() {
                Some(j) => j,
                None => problem.jacobian(&x),
            };
            if j.iter().any(|v| !v.is_finite()) {
                report.termination =
                    Termination::NumericalFailure(format!("non-finite Jacobian at iteration {iteration}"));
                break;
            }

            let hessian = j.transpose() * &j;
            let gradient = j.transpose() * &residual;

            let Some(delta) = damped_step(&hessian, &gradient, damping) else {
                report.termination =
                    Termination::NumericalFailure(format!("singular normal equations at iteration {iteration}"));
                break;
            };

            let mut step = -delta;
            let norm = step.norm();
            if norm > options.max_step {
                step *= options.max_step / norm;
            }

            let candidate = bounds.clamp(&(&x + &step));
            let step_norm = (&candidate - &x).norm();
            if step_norm < options.x_tolerance {
                report.history.push(IterationRecord {
                    iteration,
                    cost,
                    step_norm,
                    damping,
                    accepted: false,
                });
                report.termination = Termination::Converged;
                break;
            }

            let candidate_residual = problem.residual(&candidate);
            if candidate_residual.iter().any(|v| !v.is_finite()) {
                report.termination =
                    Termination::NumericalFailure(format!("non-finite residual at iteration {iteration}"));
                break;
            }
            let candidate_cost = 0.5 * candidate_residual.norm_squared();
            let accepted = candidate_cost.is_finite() && candidate_cost < cost;

            if accepted {
                x = candidate;
                residual = candidate_residual;
                cost = candidate_cost;
                damping = (damping / options.damping_decrease).max(MIN_DAMPING);
                if options.record_trajectory {
                    report.trajectory.push(x.clone());
                }
            } else {
                jacobian = Some(j);
                damping *= options.damping_increase;
            }

            report.history.push(IterationRecord {
                iteration,
                cost,
                step_norm,
                damping,
                accepted,
            });

            if damping > options.max_damping {
                report.termination = Termination::NumericalFailure(format!(
                    "damping exceeded {:e} without reducing the cost",
                    options.max_damping
                ));
                break;
            }
        }

        report.final_cost = cost;
        info!("LM {}", report);

        if report.termination.has_solution() {
            Ok(SolverOutput { x, report })
        } else {
            Err(SolverError::from_report(report))
        }
    }
}

/// Solves `(H + λ·diag(H)) δ = g` by Cholesky, raising `λ` until the system is
/// positive definite.
fn damped_step(hessian: &DMatrix<f64>, gradient: &DVector<f64>, damping: f64) -> Option<DVector<f64>> {
    let mut lambda = damping;
    for _ in 0..8 {
        let mut augmented = hessian.clone();
        for i in 0..augmented.nrows() {
            augmented[(i, i)] += lambda * hessian[(i, i)].max(MIN_DIAGONAL);
        }
        if let Some(cholesky) = augmented.cholesky() {
            let delta = cholesky.solve(gradient);
            if delta.iter().all(|v| v.is_finite()) {
                return Some(delta);
            }
        }
        lambda = (lambda * 10.0).max(MIN_DIAGONAL);
    }
    None
}

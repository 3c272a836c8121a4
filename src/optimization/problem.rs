//! The residual/Jacobian pair consumed by the solver.

use nalgebra::{DMatrix, DVector};

/// Step used by [`finite_difference_jacobian`]; central differences with an
/// absolute step of `1e-6` in every parameter.
pub const FINITE_DIFFERENCE_STEP: f64 = 1e-6;

/// A nonlinear least-squares problem `min ½‖r(x)‖²`.
///
/// The residual and its Jacobian live on the same object so they can never be
/// handed to the solver independently. Implementors that do not provide a
/// closed-form Jacobian get central finite differences of their own residual.
pub trait LeastSquaresProblem {
    /// Length of the parameter vector `x`.
    fn num_parameters(&self) -> usize;

    /// Length of the residual vector `r(x)`.
    fn num_residuals(&self) -> usize;

    /// Evaluates `r(x)`.
    fn residual(&self, x: &DVector<f64>) -> DVector<f64>;

    /// Evaluates `∂r/∂x` as a `num_residuals × num_parameters` matrix.
    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        finite_difference_jacobian(self, x)
    }
}

/// Central finite-difference Jacobian of `problem` at `x`, using
/// [`FINITE_DIFFERENCE_STEP`].
pub fn finite_difference_jacobian<P: LeastSquaresProblem + ?Sized>(
    problem: &P,
    x: &DVector<f64>,
) -> DMatrix<f64> {
    let h = FINITE_DIFFERENCE_STEP;
    let mut jacobian = DMatrix::zeros(problem.num_residuals(), x.len());
    let mut probe = x.clone();

    for j in 0..x.len() {
        probe[j] = x[j] + h;
        let forward = problem.residual(&probe);
        probe[j] = x[j] - h;
        let backward = problem.residual(&probe);
        probe[j] = x[j];

        let column = (forward - backward) / (2.0 * h);
        jacobian.set_column(j, &column);
    }

    jacobian
}

/// The largest disagreement between a problem's Jacobian and finite differences.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivativeMismatch {
    pub residual: usize,
    pub parameter: usize,
    pub analytic: f64,
    pub numeric: f64,
}

/// Compares [`LeastSquaresProblem::jacobian`] against
/// [`finite_difference_jacobian`] at `x`.
///
/// An entry fails when `|analytic - numeric| > tolerance · max(1, |numeric|)`.
/// Returns the worst failing entry, or `None` when every entry agrees. A
/// Jacobian of the wrong shape is reported at index `(0, 0)`.
pub fn check_jacobian<P: LeastSquaresProblem + ?Sized>(
    problem: &P,
    x: &DVector<f64>,
    tolerance: f64,
) -> Option<DerivativeMismatch> {
    let analytic = problem.jacobian(x);
    let numeric = finite_difference_jacobian(problem, x);

    if analytic.shape() != numeric.shape() {
        return Some(DerivativeMismatch {
            residual: 0,
            parameter: 0,
            analytic: f64::NAN,
            numeric: numeric.get((0, 0)).copied().unwrap_or(f64::NAN),
        });
    }

    let mut worst: Option<(f64, DerivativeMismatch)> = None;
    for i in 0..numeric.nrows() {
        for j in 0..numeric.ncols() {
            let a = analytic[(i, j)];
            let n = numeric[(i, j)];
            let excess = (a - n).abs() / n.abs().max(1.0);
            let failed = excess > tolerance || !a.is_finite();
            if failed && worst.as_ref().map_or(true, |(w, _)| excess > *w || excess.is_nan()) {
                worst = Some((
                    excess,
                    DerivativeMismatch {
                        residual: i,
                        parameter: j,
                        analytic: a,
                        numeric: n,
                    },
                ));
            }
        }
    }

    worst.map(|(_, mismatch)| mismatch)
}

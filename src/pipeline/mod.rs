//! Calibration orchestration.
//!
//! [`Calibrator`] validates a sample set, builds the gaze residual over it,
//! runs the configured solver inside box bounds around the initial guess and
//! decodes the solved vector into a [`RigidTransform`] and a
//! [`HeadToViewCalibration`]. A solve that runs out of iterations is retried
//! from yaw-rotated initial guesses; the lowest-cost attempt is kept.
//!
//! [`spawn_calibration`] runs the same work on a worker thread and hands the
//! result back over a channel.

pub mod config;

pub use config::{BoundsConfig, CalibrationBackend, CalibrationConfig};

use crate::calibration::{
    CalibrationError, HeadToViewCalibration, HeadToViewParameters, PoseParameters,
    RigidTransform,
};
use crate::optimization::{
    Bounds, CalibrationEstimate, CancellationToken, DisplayCalibrationCost, LeastSquaresProblem,
    LevenbergMarquardt, SolverError, SolverOptions, SolverOutput, SolverReport, Termination,
};
use crate::samples::{validate_samples, CalibrationSample};
use crate::util::ResidualStatistics;
use log::{debug, info, warn};
use nalgebra::{DVector, Matrix3, UnitQuaternion, Vector3};
use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc;
use std::thread;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer, OptimizerOptions};

/// Whether the returned calibration comes from a converged solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStatus {
    Converged,
    /// Every attempt ran out of iterations; the lowest-cost iterate is returned.
    BestEffort,
}

impl fmt::Display for CalibrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationStatus::Converged => f.write_str("converged"),
            CalibrationStatus::BestEffort => f.write_str("best effort"),
        }
    }
}

/// Result of a successful calibration run.
#[derive(Debug, Clone)]
pub struct CalibrationOutcome {
    /// Tracking-to-display transform; `error` is the final RMS residual.
    pub display: RigidTransform,
    pub head_to_view: HeadToViewCalibration,
    /// Report of the attempt that produced the result.
    pub report: SolverReport,
    pub status: CalibrationStatus,
    /// Angular error between predicted and observed gaze, per sample.
    pub residuals: ResidualStatistics,
    /// Bounds the returned attempt was solved in.
    pub bounds: Bounds,
    /// Attempts made after the first.
    pub restarts: usize,
    pub estimate: CalibrationEstimate,
    /// Solved parameter vector, laid out by the configured layout.
    pub solution: DVector<f64>,
}

impl CalibrationOutcome {
    pub fn is_converged(&self) -> bool {
        self.status == CalibrationStatus::Converged
    }
}

/// Solved values next to a known ground truth, with their errors computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecoveryErrors {
    pub display: PoseParameters,
    pub head_to_view: HeadToViewParameters,
}

impl RecoveryErrors {
    /// Display translation error, metres.
    pub fn translation_error(&self) -> f64 {
        self.display.translation.error()
    }

    /// Display rotation error, degrees.
    pub fn rotation_error_deg(&self) -> f64 {
        self.display.rotation.error().to_degrees()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Calibrator {
    config: CalibrationConfig,
}

impl Calibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Calibrates the display from `samples`, starting at `initial`.
    ///
    /// # Arguments
    ///
    /// * `samples` - Observed samples, validated before any solve.
    /// * `initial` - Initial guess; blocks the layout does not estimate are
    ///   held at these values.
    ///
    /// # Returns
    ///
    /// * `Ok(CalibrationOutcome)` - The solve converged or, after all
    ///   restarts, produced a best-effort result.
    /// * `Err(CalibrationError)` - Invalid input or configuration, or a solver
    ///   failure (cancellation, derivative check, numerical breakdown).
    pub fn run(
        &self,
        samples: &[CalibrationSample],
        initial: &CalibrationEstimate,
    ) -> Result<CalibrationOutcome, CalibrationError> {
        self.run_with_cancel(samples, initial, None)
    }

    /// [`Calibrator::run`] with a cancellation flag polled between iterations.
    pub fn run_with_cancel(
        &self,
        samples: &[CalibrationSample],
        initial: &CalibrationEstimate,
        cancel: Option<&CancellationToken>,
    ) -> Result<CalibrationOutcome, CalibrationError> {
        self.config.validate()?;
        validate_samples(samples)?;
        if !initial.is_finite() {
            return Err(CalibrationError::InvalidParams(
                "initial guess is not finite".to_string(),
            ));
        }

        let layout = self.config.layout;
        let cost = DisplayCalibrationCost::new(
            samples,
            self.config.interpupillary_distance,
            layout,
            *initial,
        );
        let half_widths = layout.half_widths(
            self.config.bounds.rotation,
            self.config.bounds.translation,
            self.config.bounds.scale,
        );

        info!(
            "Calibrating from {} samples ({} parameters, {:?} backend)",
            samples.len(),
            layout.len(),
            self.config.backend
        );

        let starts = self.starting_points(initial);
        let mut best: Option<(SolverOutput, Bounds)> = None;
        let mut restarts = 0;

        for (attempt, start) in starts.iter().enumerate() {
            if attempt > 0 {
                restarts = attempt;
                info!(
                    "Restart {attempt}: initial display rotation {:.1}° about +Y",
                    self.config.restart_yaw_deg[attempt - 1]
                );
            }

            let start = if self.config.align_initial_translation {
                align_translation(samples, start, self.config.interpupillary_distance)
            } else {
                *start
            };
            let x0 = layout.encode(&start);
            let bounds = Bounds::around(&x0, &half_widths);

            let output = self.solve(&cost, &x0, &bounds, cancel)?;
            let converged = output.report.termination == Termination::Converged;
            debug!("Attempt {attempt}: {}", output.report);

            let better = best
                .as_ref()
                .map_or(true, |(b, _)| output.report.final_cost < b.report.final_cost);
            if converged || better {
                best = Some((output, bounds));
            }
            if converged {
                break;
            }
            warn!("Attempt {attempt} ran out of iterations");
        }

        let (output, bounds) = best.ok_or_else(|| {
            CalibrationError::InvalidParams("no solver attempt was made".to_string())
        })?;
        let estimate = layout.decode(&output.x, initial);
        let rms = cost.rms(&output.x);
        let residuals = ResidualStatistics::from_errors(&cost.angular_errors(&output.x))?;
        let status = if output.report.termination == Termination::Converged {
            CalibrationStatus::Converged
        } else {
            CalibrationStatus::BestEffort
        };

        info!(
            "Calibration {status} after {restarts} restarts: {}, gaze residual {residuals}",
            output.report
        );

        Ok(CalibrationOutcome {
            display: estimate.to_display_transform(rms),
            head_to_view: estimate.to_head_to_view(rms),
            report: output.report,
            status,
            residuals,
            bounds,
            restarts,
            estimate,
            solution: output.x,
        })
    }

    /// Runs the calibration and compares the result with a known ground truth.
    pub fn run_with_ground_truth(
        &self,
        samples: &[CalibrationSample],
        initial: &CalibrationEstimate,
        display_truth: &RigidTransform,
        head_to_view_truth: &HeadToViewCalibration,
    ) -> Result<(CalibrationOutcome, RecoveryErrors), CalibrationError> {
        let outcome = self.run(samples, initial)?;

        let mut display = PoseParameters::from_ground_truth(
            display_truth.translation(),
            display_truth.rotation(),
        )
        .with_approximation(outcome.display.translation(), outcome.display.rotation());
        let mut head_to_view = HeadToViewParameters::from_ground_truth(
            *head_to_view_truth.offset(),
            *head_to_view_truth.rotation(),
        )
        .with_approximation(*outcome.head_to_view.offset(), *outcome.head_to_view.rotation());

        let (translation_error, rotation_error) = display.compute_errors();
        let (offset_error, view_rotation_error) = head_to_view.compute_errors();
        info!(
            "Recovery error: display {:.3} mm / {:.4}°, head-to-view {:.3} mm / {:.4}°",
            translation_error * 1e3,
            rotation_error.to_degrees(),
            offset_error * 1e3,
            view_rotation_error.to_degrees()
        );

        Ok((
            outcome,
            RecoveryErrors {
                display,
                head_to_view,
            },
        ))
    }

    fn starting_points(&self, initial: &CalibrationEstimate) -> Vec<CalibrationEstimate> {
        let restarts = self.config.max_restarts.min(self.config.restart_yaw_deg.len());
        std::iter::once(*initial)
            .chain(self.config.restart_yaw_deg[..restarts].iter().map(|yaw| {
                let delta = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), yaw.to_radians());
                initial.rotated(&delta)
            }))
            .collect()
    }

    fn solve(
        &self,
        cost: &DisplayCalibrationCost,
        x0: &DVector<f64>,
        bounds: &Bounds,
        cancel: Option<&CancellationToken>,
    ) -> Result<SolverOutput, SolverError> {
        match self.config.backend {
            CalibrationBackend::Bounded => {
                LevenbergMarquardt::new(self.config.solver.clone()).solve(cost, x0, bounds, cancel)
            }
            CalibrationBackend::TinySolver => {
                solve_with_tiny_solver(cost, x0, bounds, &self.config.solver, cancel)
            }
        }
    }
}

/// Iterations of the bounded solver allowed to confirm a `tiny-solver` result.
pub const TINY_SOLVER_CHECK_ITERATIONS: usize = 5;

/// Runs `tiny-solver`'s Levenberg-Marquardt optimizer over the same residual.
///
/// `tiny-solver` returns its last iterate whether it converged or ran out of
/// iterations, so the result is handed to the bounded solver for at most
/// [`TINY_SOLVER_CHECK_ITERATIONS`] iterations. The solve is reported as
/// converged only if that check converges; the report's iteration count and
/// history are those of the check.
fn solve_with_tiny_solver(
    cost: &DisplayCalibrationCost,
    x0: &DVector<f64>,
    bounds: &Bounds,
    options: &SolverOptions,
    cancel: Option<&CancellationToken>,
) -> Result<SolverOutput, SolverError> {
    let initial_cost = 0.5 * cost.residual(x0).norm_squared();
    let report = |termination: Termination, final_cost: f64| SolverReport {
        iterations: 0,
        termination,
        initial_cost,
        final_cost,
        history: Vec::new(),
        trajectory: Vec::new(),
    };

    if cancel.is_some_and(|token| token.is_cancelled()) {
        return Err(SolverError::Cancelled(report(Termination::Cancelled, initial_cost)));
    }
    if !bounds.contains(x0) {
        return Err(SolverError::Rejected(report(
            Termination::ConstraintInconsistent("initial vector lies outside the bounds".to_string()),
            initial_cost,
        )));
    }

    let mut problem = tiny_solver::Problem::new();
    problem.add_residual_block(
        cost.num_residuals(),
        &["params"],
        Box::new(cost.clone()),
        None,
    );
    for i in 0..x0.len() {
        problem.set_variable_bounds("params", i, bounds.lower[i], bounds.upper[i]);
    }

    let mut initial_values = HashMap::new();
    initial_values.insert("params".to_string(), x0.clone());

    let optimizer_options = OptimizerOptions {
        max_iteration: options.max_iterations,
        ..OptimizerOptions::default()
    };
    let optimizer = LevenbergMarquardtOptimizer::default();
    let result = optimizer.optimize(&problem, &initial_values, Some(optimizer_options));

    let Some(x) = result.and_then(|mut values| values.remove("params")) else {
        return Err(SolverError::NumericalFailure(report(
            Termination::NumericalFailure("tiny-solver returned no solution".to_string()),
            initial_cost,
        )));
    };

    let final_cost = 0.5 * cost.residual(&x).norm_squared();
    if !final_cost.is_finite() {
        return Err(SolverError::NumericalFailure(report(
            Termination::NumericalFailure("non-finite residual at the solution".to_string()),
            final_cost,
        )));
    }
    if !bounds.contains(&x) {
        return Err(SolverError::Rejected(report(
            Termination::ConstraintInconsistent("tiny-solver result left the bounds".to_string()),
            final_cost,
        )));
    }
    debug!("tiny-solver stopped at cost {final_cost:.6e}, checking convergence");

    let check = options
        .clone()
        .with_max_iterations(TINY_SOLVER_CHECK_ITERATIONS)
        .with_trajectory(false);
    let mut output = LevenbergMarquardt::new(check).solve(cost, &x, bounds, cancel)?;
    output.report.initial_cost = initial_cost;
    info!("tiny-solver {}", output.report);
    Ok(output)
}

/// Linear estimate of the display translation for fixed rotation, scale and
/// head-to-view calibration.
///
/// Each sample's gaze ray must pass through its target. The translation that
/// minimises the squared distances of the targets to the predicted rays
/// solves `Σ Pᵢ t = Σ Pᵢ (cᵢ - R aᵢ)` with `Pᵢ = I - dᵢ dᵢᵀ`, where `aᵢ` is
/// the eye position before translation and `dᵢ` the predicted ray direction.
/// Falls back to the given translation when the rays are (nearly) parallel.
pub fn align_translation(
    samples: &[CalibrationSample],
    estimate: &CalibrationEstimate,
    interpupillary_distance: f64,
) -> CalibrationEstimate {
    let rotation = estimate.display_rotation();
    let head_to_view = estimate.to_head_to_view(0.0);

    let mut lhs = Matrix3::zeros();
    let mut rhs = Vector3::zeros();
    for sample in samples {
        let eye_offset = head_to_view.eye_offset(sample.anchor, interpupillary_distance);
        let local = estimate.scale.component_mul(&sample.pose.position.coords)
            + sample.pose.rotation * eye_offset;
        let direction = (rotation * sample.pose.rotation * head_to_view.rotation()) * sample.gaze;
        let projector = Matrix3::identity() - direction * direction.transpose();
        lhs += projector;
        rhs += projector * (sample.target.coords - rotation * local);
    }

    match lhs.try_inverse() {
        Some(inverse) if lhs.determinant().abs() > 1e-9 => {
            let translation = inverse * rhs;
            if translation.iter().all(|v| v.is_finite()) {
                debug!("Aligned initial translation to {:?}", translation);
                return CalibrationEstimate {
                    translation,
                    ..*estimate
                };
            }
            *estimate
        }
        _ => *estimate,
    }
}

/// Handle on a calibration running on a worker thread.
pub struct CalibrationHandle {
    receiver: mpsc::Receiver<Result<CalibrationOutcome, CalibrationError>>,
    cancel: CancellationToken,
    worker: thread::JoinHandle<()>,
}

impl CalibrationHandle {
    /// Asks the solver to stop at its next iteration boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns the result if the worker has finished, without blocking.
    pub fn try_result(&self) -> Option<Result<CalibrationOutcome, CalibrationError>> {
        self.receiver.try_recv().ok()
    }

    /// Blocks until the worker delivers its result.
    pub fn wait(self) -> Result<CalibrationOutcome, CalibrationError> {
        let result = self.receiver.recv()?;
        if self.worker.join().is_err() {
            warn!("Calibration worker panicked after sending its result");
        }
        result
    }
}

/// Runs [`Calibrator::run`] on a new thread.
///
/// The result is delivered once over the returned handle's channel.
pub fn spawn_calibration(
    calibrator: Calibrator,
    samples: Vec<CalibrationSample>,
    initial: CalibrationEstimate,
) -> CalibrationHandle {
    let (sender, receiver) = mpsc::channel();
    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();

    let worker = thread::spawn(move || {
        let result = calibrator.run_with_cancel(&samples, &initial, Some(&worker_cancel));
        deliver(&sender, result);
    });

    CalibrationHandle {
        receiver,
        cancel,
        worker,
    }
}

/// Sends a finished result to the handle; returns `false` if the handle is gone.
fn deliver(
    sender: &mpsc::Sender<Result<CalibrationOutcome, CalibrationError>>,
    result: Result<CalibrationOutcome, CalibrationError>,
) -> bool {
    match sender.send(result) {
        Ok(()) => true,
        Err(mpsc::SendError(result)) => {
            debug!(
                "Calibration handle dropped, discarding {} result",
                if result.is_ok() { "successful" } else { "failed" }
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::ParameterLayout;
    use crate::samples::{targets_on_sphere, SampleGenerator};
    use nalgebra::Point3;

    fn truth() -> (RigidTransform, HeadToViewCalibration) {
        (
            RigidTransform::from_parts(
                &Vector3::new(0.1, -1.3, 0.4),
                &UnitQuaternion::from_euler_angles(0.02, 0.3, -0.01),
                &Vector3::new(1.0, 1.0, 1.0),
                0.0,
            ),
            HeadToViewCalibration::new(
                Vector3::new(0.0, -0.06, 0.08),
                UnitQuaternion::from_euler_angles(0.03, -0.02, 0.01),
                0.0,
            ),
        )
    }

    fn samples() -> Vec<CalibrationSample> {
        let (display, head_to_view) = truth();
        SampleGenerator::new(
            display,
            head_to_view,
            0.064,
            targets_on_sphere(12, 0.3, Point3::origin()),
        )
        .generate()
        .unwrap()
        .all()
    }

    #[test]
    fn test_align_translation_is_exact_for_true_rotation() {
        let (display, head_to_view) = truth();
        let exact = CalibrationEstimate::from_calibrations(&display, &head_to_view);
        let shifted = CalibrationEstimate {
            translation: Vector3::zeros(),
            ..exact
        };
        let aligned = align_translation(&samples(), &shifted, 0.064);
        assert!((aligned.translation - exact.translation).norm() < 1e-9);
    }

    #[test]
    fn test_noise_free_recovery() {
        let (display, head_to_view) = truth();
        let calibrator = Calibrator::default();
        let (outcome, errors) = calibrator
            .run_with_ground_truth(
                &samples(),
                &CalibrationEstimate::identity(),
                &display,
                &head_to_view,
            )
            .unwrap();
        assert!(outcome.is_converged());
        assert!(errors.translation_error() < 1e-6);
        assert!(errors.rotation_error_deg() < 1e-4);
        assert!(errors.head_to_view.translation.error() < 1e-6);
        assert!(outcome.display.error() < 1e-6);
        assert!(outcome.display.is_calibrated());
    }

    #[test]
    fn test_invalid_input_is_rejected_before_solving() {
        let calibrator = Calibrator::default();
        assert!(matches!(
            calibrator.run(&[], &CalibrationEstimate::identity()),
            Err(CalibrationError::EmptySampleSet)
        ));

        let mut bad = samples();
        bad[3].gaze = Vector3::new(0.0, 0.0, 0.5);
        assert!(matches!(
            calibrator.run(&bad, &CalibrationEstimate::identity()),
            Err(CalibrationError::InvalidSample { index: 3, .. })
        ));

        let nan_guess = CalibrationEstimate {
            translation: Vector3::new(f64::NAN, 0.0, 0.0),
            ..CalibrationEstimate::identity()
        };
        assert!(calibrator.run(&samples(), &nan_guess).is_err());
    }

    #[test]
    fn test_budget_exhaustion_restarts_and_reports_best_effort() {
        let mut config = CalibrationConfig::default();
        config.solver.max_iterations = 1;
        config.max_restarts = 2;
        let outcome = Calibrator::new(config)
            .run(&samples(), &CalibrationEstimate::identity())
            .unwrap();
        assert_eq!(outcome.status, CalibrationStatus::BestEffort);
        assert_eq!(outcome.report.termination, Termination::BudgetExhausted);
        assert_eq!(outcome.restarts, 2);
        assert!(outcome.bounds.contains(&outcome.solution));
    }

    #[test]
    fn test_fixed_head_to_view_layout() {
        let (display, head_to_view) = truth();
        let config = CalibrationConfig {
            layout: ParameterLayout::new(false, false),
            ..CalibrationConfig::default()
        };
        let initial = CalibrationEstimate {
            head_offset: *head_to_view.offset(),
            view_rotation: head_to_view.rotation().scaled_axis(),
            ..CalibrationEstimate::identity()
        };
        let outcome = Calibrator::new(config).run(&samples(), &initial).unwrap();
        assert!(outcome.is_converged());
        assert!((outcome.display.translation() - display.translation()).norm() < 1e-6);
        assert_eq!(outcome.head_to_view.offset(), head_to_view.offset());
    }

    #[test]
    fn test_worker_delivers_result() {
        let handle = spawn_calibration(
            Calibrator::default(),
            samples(),
            CalibrationEstimate::identity(),
        );
        let outcome = handle.wait().unwrap();
        assert!(outcome.is_converged());
    }

    #[test]
    fn test_precancelled_token_stops_before_iterating() {
        let config = CalibrationConfig {
            solver: crate::optimization::SolverOptions::default().with_max_iterations(100_000),
            ..CalibrationConfig::default()
        };
        let calibrator = Calibrator::new(config);
        let token = CancellationToken::new();
        token.cancel();
        let result =
            calibrator.run_with_cancel(&samples(), &CalibrationEstimate::identity(), Some(&token));
        match result {
            Err(CalibrationError::Solver(SolverError::Cancelled(report))) => {
                assert_eq!(report.iterations, 0)
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_tiny_solver_budget_is_not_convergence() {
        let config = CalibrationConfig {
            backend: CalibrationBackend::TinySolver,
            solver: crate::optimization::SolverOptions::default().with_max_iterations(1),
            align_initial_translation: false,
            max_restarts: 0,
            ..CalibrationConfig::default()
        };
        let far = CalibrationEstimate {
            rotation: Vector3::new(0.0, -1.0, 0.0),
            ..CalibrationEstimate::identity()
        };

        let outcome = Calibrator::new(config).run(&samples(), &far).unwrap();
        assert_eq!(outcome.status, CalibrationStatus::BestEffort);
        assert_eq!(outcome.report.termination, Termination::BudgetExhausted);
        assert_eq!(outcome.report.iterations, TINY_SOLVER_CHECK_ITERATIONS);
        assert_eq!(outcome.restarts, 0);
        assert!(outcome.bounds.contains(&outcome.solution));
    }

    #[test]
    fn test_result_for_dropped_handle_is_discarded() {
        let (sender, receiver) = mpsc::channel();
        assert!(deliver(&sender, Err(CalibrationError::EmptySampleSet)));
        assert!(matches!(receiver.recv(), Ok(Err(CalibrationError::EmptySampleSet))));

        drop(receiver);
        assert!(!deliver(&sender, Err(CalibrationError::EmptySampleSet)));
    }
}

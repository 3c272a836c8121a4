//! The `optimization` module solves for the display calibration.
//!
//! It pairs a residual with its Jacobian in the [`LeastSquaresProblem`] trait,
//! provides a bounded Levenberg-Marquardt solver over that trait, and defines
//! the gaze residual of the display calibration ([`DisplayCalibrationCost`])
//! together with the packing of the unknowns into a parameter vector
//! ([`ParameterLayout`]).
//!
//! The optimization process is:
//! 1. Encode an initial [`CalibrationEstimate`] with a [`ParameterLayout`].
//! 2. Bind the observed samples into a [`DisplayCalibrationCost`].
//! 3. Run [`LevenbergMarquardt::solve`] inside box bounds around the guess.
//! 4. Decode the solved vector back into calibration types.

pub mod display_cost;
pub mod layout;
pub mod problem;
pub mod solver;

pub use display_cost::{DisplayCalibrationCost, RESIDUALS_PER_SAMPLE};
pub use layout::{BlockOffsets, CalibrationEstimate, ParameterLayout};
pub use problem::{
    check_jacobian, finite_difference_jacobian, DerivativeMismatch, LeastSquaresProblem,
    FINITE_DIFFERENCE_STEP,
};
pub use solver::{
    Bounds, CancellationToken, IterationRecord, LevenbergMarquardt, SolverError, SolverOptions,
    SolverOutput, SolverReport, Termination,
};

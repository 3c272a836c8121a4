//! Spheree Calibration Library
//!
//! Tracking-to-display calibration for spherical multi-projector displays.
//! The library solves for the scale, rotation and translation that map a
//! motion-tracking frame into the display frame, together with the offset of
//! the rendering viewpoint from the tracked head anchor, from samples of a
//! subject looking at known display targets.
//!
//! It provides:
//! - Pose, frame and rotation-metric helpers
//! - Calibration result types with JSON persistence
//! - Per-parameter ground truth / approximation / error models
//! - Synthetic sample generation and CSV sample recordings
//! - A bounded Levenberg-Marquardt solver, with the tiny-solver optimizer as
//!   an alternative backend
//! - A calibration pipeline with restarts and an optional worker thread

pub mod calibration;
pub mod geometry;
pub mod optimization;
pub mod pipeline;
pub mod samples;
pub mod util;

// Re-export commonly used types
pub use calibration::{
    CalibrationError, Eye, HeadToViewCalibration, HeadToViewParameters, ParameterModel,
    PoseParameters, RigidTransform, ValueMode, UNCALIBRATED_ERROR,
};

pub use geometry::{geodesic_distance, Frame, Pose};

pub use optimization::{
    Bounds, CalibrationEstimate, CancellationToken, DisplayCalibrationCost, LeastSquaresProblem,
    LevenbergMarquardt, ParameterLayout, SolverError, SolverOptions, SolverReport, Termination,
};

pub use pipeline::{
    spawn_calibration, CalibrationBackend, CalibrationConfig, CalibrationOutcome,
    CalibrationStatus, Calibrator, RecoveryErrors,
};

pub use samples::{CalibrationSample, NoiseModel, SampleGenerator, SyntheticSamples};

//! Calibration result types and the crate-wide error type.
//!
//! A calibration of the display consists of two independent pieces:
//!
//! * [`RigidTransform`] maps poses from tracking space into display space
//!   (scale, rotation and translation, plus the fit error).
//! * [`HeadToViewCalibration`] locates the rendering viewpoint (the eye)
//!   relative to the tracked head anchor.
//!
//! [`ParameterModel`] keeps ground-truth, approximated and error-injected
//! versions of a single parameter side by side for sensitivity studies.

pub mod head_to_view;
pub mod parameter;
pub mod rigid_transform;

pub use head_to_view::{Eye, HeadToViewCalibration};
pub use parameter::{
    HeadToViewParameters, ParameterModel, ParameterValue, PoseParameters, RotationParameter,
    ValueMode, VectorParameter,
};
pub use rigid_transform::{RigidTransform, UNCALIBRATED_ERROR};

use crate::optimization::SolverError;
use crate::util::UtilError;
use std::sync::mpsc;

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("IO Error: {0}")]
    IOError(String),
    #[error("Failed to parse JSON: {0}")]
    JsonError(String),
    #[error("Failed to parse YAML: {0}")]
    YamlError(String),
    #[error("Failed to read or write CSV: {0}")]
    CsvError(String),
    #[error("Invalid calibration file: {0}")]
    InvalidCalibrationFile(String),
    #[error("Invalid parameter mode: {0}")]
    InvalidMode(String),
    #[error("Calibration sample set is empty")]
    EmptySampleSet,
    #[error("Invalid calibration sample {index}: {reason}")]
    InvalidSample { index: usize, reason: String },
    #[error("Invalid calibration parameters: {0}")]
    InvalidParams(String),
    #[error("Numerical error in computation: {0}")]
    NumericalError(String),
    #[error("Calibration worker stopped without sending a result")]
    WorkerDisconnected,
    #[error("Solver failed: {0}")]
    Solver(#[from] SolverError),
}

impl From<std::io::Error> for CalibrationError {
    fn from(err: std::io::Error) -> Self {
        CalibrationError::IOError(err.to_string())
    }
}

impl From<serde_json::Error> for CalibrationError {
    fn from(err: serde_json::Error) -> Self {
        CalibrationError::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CalibrationError {
    fn from(err: serde_yaml::Error) -> Self {
        CalibrationError::YamlError(err.to_string())
    }
}

impl From<csv::Error> for CalibrationError {
    fn from(err: csv::Error) -> Self {
        CalibrationError::CsvError(err.to_string())
    }
}

impl From<UtilError> for CalibrationError {
    fn from(err: UtilError) -> Self {
        CalibrationError::NumericalError(err.to_string())
    }
}

impl From<mpsc::RecvError> for CalibrationError {
    fn from(_: mpsc::RecvError) -> Self {
        CalibrationError::WorkerDisconnected
    }
}

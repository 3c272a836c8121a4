//! Observed calibration samples.
//!
//! A sample pairs the tracked head anchor (tracking space) with the
//! display-space target the subject was looking at and the direction, in the
//! view frame, along which the target appeared.

pub mod generator;
pub mod recording;

pub use generator::{targets_on_sphere, NoiseModel, SampleGenerator, SyntheticSamples};
pub use recording::{load_samples_csv, read_samples, save_samples_csv, write_samples};

use crate::calibration::{CalibrationError, Eye};
use crate::geometry::Pose;
use nalgebra::{Point3, Vector3};

/// Largest deviation of `|gaze|` from one accepted by
/// [`CalibrationSample::validate`].
pub const GAZE_NORM_TOLERANCE: f64 = 1e-6;

/// One observation used by the display calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSample {
    /// Capture index.
    pub frame: usize,
    pub anchor: Eye,
    /// Tracked head anchor, tracking space.
    pub pose: Pose,
    /// Looked-at point, display space.
    pub target: Point3<f64>,
    /// Unit direction towards the target in the view frame; `+Z` is straight ahead.
    pub gaze: Vector3<f64>,
}

impl CalibrationSample {
    pub fn new(
        frame: usize,
        anchor: Eye,
        pose: Pose,
        target: Point3<f64>,
        gaze: Vector3<f64>,
    ) -> Self {
        Self {
            frame,
            anchor,
            pose,
            target,
            gaze,
        }
    }

    /// Checks that every value is finite and the gaze is a unit vector.
    ///
    /// `index` is the position of the sample in its set and is only used in
    /// the error.
    pub fn validate(&self, index: usize) -> Result<(), CalibrationError> {
        let invalid = |reason: &str| CalibrationError::InvalidSample {
            index,
            reason: reason.to_string(),
        };
        if !self.pose.is_finite() {
            return Err(invalid("tracked pose is not finite"));
        }
        if !self.target.iter().all(|v| v.is_finite()) {
            return Err(invalid("target is not finite"));
        }
        if !self.gaze.iter().all(|v| v.is_finite()) {
            return Err(invalid("gaze is not finite"));
        }
        let norm = self.gaze.norm();
        if (norm - 1.0).abs() > GAZE_NORM_TOLERANCE {
            return Err(CalibrationError::InvalidSample {
                index,
                reason: format!("gaze must be a unit vector, found norm {norm}"),
            });
        }
        Ok(())
    }
}

/// Validates a whole sample set; an empty set is an error.
pub fn validate_samples(samples: &[CalibrationSample]) -> Result<(), CalibrationError> {
    if samples.is_empty() {
        return Err(CalibrationError::EmptySampleSet);
    }
    samples
        .iter()
        .enumerate()
        .try_for_each(|(index, sample)| sample.validate(index))
}

//! Per-degree-of-freedom parameter containers for sensitivity studies.
//!
//! A [`ParameterModel`] keeps three values of the same parameter: the ground
//! truth (continuously refreshed from a live or synthetic source), an
//! approximation (typically the solved value) and an error parameter used to
//! inject a known calibration error on top of the ground truth.

use crate::calibration::{CalibrationError, HeadToViewCalibration};
use crate::geometry::geodesic_distance;
use nalgebra::{UnitQuaternion, Vector3};
use std::fmt;
use std::str::FromStr;

/// Type-specific behaviour of a stored parameter value.
pub trait ParameterValue: Copy + fmt::Debug {
    /// Identity rotation or zero vector.
    fn neutral() -> Self;

    /// Geodesic angle for rotations, Euclidean norm for vectors.
    fn distance(a: &Self, b: &Self) -> f64;

    /// Applies `error` on top of `ground_truth`.
    fn compose(ground_truth: &Self, error: &Self) -> Self;
}

impl ParameterValue for Vector3<f64> {
    fn neutral() -> Self {
        Vector3::zeros()
    }

    fn distance(a: &Self, b: &Self) -> f64 {
        (a - b).norm()
    }

    fn compose(ground_truth: &Self, error: &Self) -> Self {
        ground_truth + error
    }
}

impl ParameterValue for UnitQuaternion<f64> {
    fn neutral() -> Self {
        UnitQuaternion::identity()
    }

    fn distance(a: &Self, b: &Self) -> f64 {
        geodesic_distance(a, b)
    }

    /// Ground truth is applied first: `ground_truth * error`.
    fn compose(ground_truth: &Self, error: &Self) -> Self {
        ground_truth * error
    }
}

/// Selects which stored value a [`ParameterModel`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueMode {
    GroundTruth,
    Approximation,
    ErrorParameter,
}

impl ValueMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueMode::GroundTruth => "ground_truth",
            ValueMode::Approximation => "approximation",
            ValueMode::ErrorParameter => "error_parameter",
        }
    }
}

impl fmt::Display for ValueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueMode {
    type Err = CalibrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ground_truth" => Ok(ValueMode::GroundTruth),
            "approximation" => Ok(ValueMode::Approximation),
            "error_parameter" => Ok(ValueMode::ErrorParameter),
            other => Err(CalibrationError::InvalidMode(other.to_string())),
        }
    }
}

impl TryFrom<u8> for ValueMode {
    type Error = CalibrationError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ValueMode::GroundTruth),
            1 => Ok(ValueMode::Approximation),
            2 => Ok(ValueMode::ErrorParameter),
            other => Err(CalibrationError::InvalidMode(format!("mode code {other}"))),
        }
    }
}

/// Ground truth, approximation and error parameter of one parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterModel<T: ParameterValue> {
    ground_truth: T,
    approximation: T,
    error_parameter: T,
    error: f64,
}

pub type RotationParameter = ParameterModel<UnitQuaternion<f64>>;
pub type VectorParameter = ParameterModel<Vector3<f64>>;

impl<T: ParameterValue> ParameterModel<T> {
    /// All three values neutral, error zero.
    pub fn new() -> Self {
        Self {
            ground_truth: T::neutral(),
            approximation: T::neutral(),
            error_parameter: T::neutral(),
            error: 0.0,
        }
    }

    pub fn with_ground_truth(self, ground_truth: T) -> Self {
        Self {
            ground_truth,
            ..self
        }
    }

    pub fn with_approximation(self, approximation: T) -> Self {
        Self {
            approximation,
            ..self
        }
    }

    pub fn with_error_parameter(self, error_parameter: T) -> Self {
        Self {
            error_parameter,
            ..self
        }
    }

    pub fn ground_truth(&self) -> &T {
        &self.ground_truth
    }

    pub fn approximation(&self) -> &T {
        &self.approximation
    }

    pub fn error_parameter(&self) -> &T {
        &self.error_parameter
    }

    /// Error cached by the last [`ParameterModel::compute_error`] call.
    pub fn error(&self) -> f64 {
        self.error
    }

    /// Recomputes the cached error between ground truth and approximation.
    pub fn compute_error(&mut self) -> f64 {
        self.error = T::distance(&self.ground_truth, &self.approximation);
        self.error
    }

    /// Returns the stored value selected by `mode`.
    pub fn get_value(&self, mode: ValueMode) -> T {
        match mode {
            ValueMode::GroundTruth => self.ground_truth,
            ValueMode::Approximation => self.approximation,
            ValueMode::ErrorParameter => self.error_parameter,
        }
    }

    /// Value fed to downstream transforms for `mode`.
    ///
    /// In [`ValueMode::ErrorParameter`] mode this is the ground truth with the
    /// error parameter applied on top, not the raw error parameter.
    pub fn effective_value(&self, mode: ValueMode) -> T {
        match mode {
            ValueMode::ErrorParameter => T::compose(&self.ground_truth, &self.error_parameter),
            other => self.get_value(other),
        }
    }
}

impl<T: ParameterValue> Default for ParameterModel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A translation and a rotation parameter describing one pose-like quantity
/// (the display transform or the head-to-view offset).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PoseParameters {
    pub translation: VectorParameter,
    pub rotation: RotationParameter,
}

impl PoseParameters {
    pub fn from_ground_truth(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self {
            translation: VectorParameter::new().with_ground_truth(translation),
            rotation: RotationParameter::new().with_ground_truth(rotation),
        }
    }

    pub fn with_approximation(
        self,
        translation: Vector3<f64>,
        rotation: UnitQuaternion<f64>,
    ) -> Self {
        Self {
            translation: self.translation.with_approximation(translation),
            rotation: self.rotation.with_approximation(rotation),
        }
    }

    /// Recomputes both errors; returns `(translation error, rotation error)`.
    pub fn compute_errors(&mut self) -> (f64, f64) {
        (
            self.translation.compute_error(),
            self.rotation.compute_error(),
        )
    }

    pub fn effective(&self, mode: ValueMode) -> (Vector3<f64>, UnitQuaternion<f64>) {
        (
            self.translation.effective_value(mode),
            self.rotation.effective_value(mode),
        )
    }

    /// Head-to-view calibration built from the effective values for `mode`.
    pub fn to_head_to_view(&self, mode: ValueMode, error: f64) -> HeadToViewCalibration {
        let (offset, rotation) = self.effective(mode);
        HeadToViewCalibration::new(offset, rotation, error)
    }
}

/// Head-to-view offset (translation) and rotation parameters.
pub type HeadToViewParameters = PoseParameters;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_vector_parameter_modes() {
        let parameter = VectorParameter::new()
            .with_ground_truth(Vector3::new(1.0, 2.0, 3.0))
            .with_approximation(Vector3::new(1.0, 2.0, 3.5))
            .with_error_parameter(Vector3::new(0.1, 0.0, -0.1));

        assert_eq!(parameter.get_value(ValueMode::GroundTruth), Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(parameter.get_value(ValueMode::Approximation), Vector3::new(1.0, 2.0, 3.5));
        assert_eq!(parameter.get_value(ValueMode::ErrorParameter), Vector3::new(0.1, 0.0, -0.1));
        assert_relative_eq!(
            parameter.effective_value(ValueMode::ErrorParameter),
            Vector3::new(1.1, 2.0, 2.9),
            epsilon = 1e-12
        );
        assert_eq!(
            parameter.effective_value(ValueMode::Approximation),
            Vector3::new(1.0, 2.0, 3.5)
        );
    }

    #[test]
    fn test_compute_error() {
        let mut parameter = VectorParameter::new()
            .with_ground_truth(Vector3::new(0.0, 0.0, 0.0))
            .with_approximation(Vector3::new(3.0, 4.0, 0.0));
        assert_eq!(parameter.error(), 0.0);
        assert_relative_eq!(parameter.compute_error(), 5.0);
        assert_relative_eq!(parameter.error(), 5.0);

        let mut rotation = RotationParameter::new()
            .with_approximation(UnitQuaternion::from_euler_angles(0.0, 0.25, 0.0));
        assert_relative_eq!(rotation.compute_error(), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_rotation_composition_applies_ground_truth_first() {
        let ground_truth = UnitQuaternion::from_euler_angles(0.0, 0.5, 0.0);
        let error = UnitQuaternion::from_euler_angles(0.1, 0.0, 0.0);
        let parameter = RotationParameter::new()
            .with_ground_truth(ground_truth)
            .with_error_parameter(error);
        let effective = parameter.effective_value(ValueMode::ErrorParameter);
        assert!(geodesic_distance(&effective, &(ground_truth * error)) < 1e-12);
    }

    #[test]
    fn test_mode_parsing_rejects_unknown() {
        assert_eq!("approximation".parse::<ValueMode>().unwrap(), ValueMode::Approximation);
        assert_eq!(ValueMode::try_from(2u8).unwrap(), ValueMode::ErrorParameter);
        assert!(matches!(
            "best_guess".parse::<ValueMode>(),
            Err(CalibrationError::InvalidMode(_))
        ));
        assert!(matches!(ValueMode::try_from(7u8), Err(CalibrationError::InvalidMode(_))));
        for mode in [ValueMode::GroundTruth, ValueMode::Approximation, ValueMode::ErrorParameter] {
            assert_eq!(mode.to_string().parse::<ValueMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_pose_parameters_errors() {
        let mut parameters = PoseParameters::from_ground_truth(
            Vector3::new(0.0, 1.5, 0.0),
            UnitQuaternion::from_euler_angles(0.0, 0.5, 0.0),
        )
        .with_approximation(
            Vector3::new(0.0, 1.501, 0.0),
            UnitQuaternion::from_euler_angles(0.0, 0.51, 0.0),
        );
        let (translation_error, rotation_error) = parameters.compute_errors();
        assert_relative_eq!(translation_error, 0.001, epsilon = 1e-9);
        assert_relative_eq!(rotation_error, 0.01, epsilon = 1e-9);
        let (t, _) = parameters.effective(ValueMode::GroundTruth);
        assert_eq!(t, Vector3::new(0.0, 1.5, 0.0));
    }

    #[test]
    fn test_head_to_view_from_error_parameters() {
        let mut parameters = HeadToViewParameters::from_ground_truth(
            Vector3::new(0.0, -0.07, 0.09),
            UnitQuaternion::identity(),
        );
        parameters.translation = parameters
            .translation
            .with_error_parameter(Vector3::new(0.0, 0.0, 0.01));
        let calibration = parameters.to_head_to_view(ValueMode::ErrorParameter, 0.0);
        assert_relative_eq!(
            *calibration.offset(),
            Vector3::new(0.0, -0.07, 0.1),
            epsilon = 1e-12
        );
        assert!(calibration.is_calibrated());
    }
}

//! The tracking-to-display transform.
//!
//! A [`RigidTransform`] stores a 4×4 homogeneous matrix composed as
//! `T · R · S` (scale first, then rotation, then translation) together with the
//! scalar fit error of the calibration that produced it. It is immutable once
//! built; a recalibration replaces it wholesale.
//!
//! On disk it is a JSON document with exactly two fields:
//!
//! ```json
//! { "matrix16": [m00, m01, m02, m03, m10, ..., m33], "error": 0.0012 }
//! ```
//!
//! `matrix16` is stored row-major.

use crate::calibration::CalibrationError;
use crate::geometry::{Frame, Pose};
use log::info;
use nalgebra::{Matrix3, Matrix4, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Error value of a transform that has not been calibrated yet.
///
/// `f64::MAX` rather than infinity so the sentinel survives a JSON round trip.
pub const UNCALIBRATED_ERROR: f64 = f64::MAX;

/// Tolerance on the homogeneous row `[0, 0, 0, 1]` when loading a matrix.
const HOMOGENEOUS_ROW_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CalibrationFile {
    matrix16: Vec<f64>,
    error: f64,
}

/// Scale/rotation/translation mapping from tracking space to display space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    matrix: Matrix4<f64>,
    error: f64,
}

impl RigidTransform {
    /// Builds the exact transform relating a tracking anchor to a display anchor.
    ///
    /// * rotation = `display.rotation⁻¹ · tracking.rotation`
    /// * translation = `display.inverse_transform_point(tracking.position)`
    /// * scale = `tracking.scale ⊘ display.scale`
    ///
    /// The result is treated as a ground-truth calibration, so its error is `0`.
    pub fn from_frames(tracking: &Frame, display: &Frame) -> Self {
        let rotation = display.rotation.inverse() * tracking.rotation;
        let translation = display.inverse_transform_point(&tracking.position).coords;
        let scale = tracking.scale.component_div(&display.scale);
        Self::from_parts(&translation, &rotation, &scale, 0.0)
    }

    /// Composes `T · R · S` from its parts.
    pub fn from_parts(
        translation: &Vector3<f64>,
        rotation: &UnitQuaternion<f64>,
        scale: &Vector3<f64>,
        error: f64,
    ) -> Self {
        let matrix = Translation3::from(*translation).to_homogeneous()
            * rotation.to_homogeneous()
            * Matrix4::new_nonuniform_scaling(scale);
        Self { matrix, error }
    }

    /// The "not yet calibrated" transform: identity matrix, error set to
    /// [`UNCALIBRATED_ERROR`].
    pub fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
            error: UNCALIBRATED_ERROR,
        }
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    pub fn error(&self) -> f64 {
        self.error
    }

    /// Returns a copy carrying a different fit error.
    pub fn with_error(self, error: f64) -> Self {
        Self { error, ..self }
    }

    pub fn is_calibrated(&self) -> bool {
        self.error < UNCALIBRATED_ERROR
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.matrix.fixed_view::<3, 1>(0, 3).into_owned()
    }

    /// Per-axis scale, the column norms of the linear part.
    pub fn scale(&self) -> Vector3<f64> {
        let linear = self.linear();
        Vector3::new(
            linear.column(0).norm(),
            linear.column(1).norm(),
            linear.column(2).norm(),
        )
    }

    pub fn rotation(&self) -> UnitQuaternion<f64> {
        let mut linear = self.linear();
        let scale = self.scale();
        for c in 0..3 {
            if scale[c] > 0.0 {
                linear.column_mut(c).unscale_mut(scale[c]);
            }
        }
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(linear))
    }

    fn linear(&self) -> Matrix3<f64> {
        self.matrix.fixed_view::<3, 3>(0, 0).into_owned()
    }

    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        self.matrix.transform_point(point)
    }

    /// Maps a display-space point back into tracking space.
    pub fn inverse_transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        let unrotated = self.rotation().inverse() * (point.coords - self.translation());
        Point3::from(unrotated.component_div(&self.scale()))
    }

    /// Transforms a tracked pose: the position goes through the full matrix,
    /// the stored rotation is left-multiplied onto the orientation.
    pub fn transform_pose(&self, pose: &Pose) -> Pose {
        Pose::new(
            self.transform_point(&pose.position),
            self.rotation() * pose.rotation,
        )
    }

    /// Inverse of [`RigidTransform::transform_pose`].
    pub fn inverse_transform_pose(&self, pose: &Pose) -> Pose {
        Pose::new(
            self.inverse_transform_point(&pose.position),
            self.rotation().inverse() * pose.rotation,
        )
    }

    /// Updates only the position of `anchor`, leaving its rotation untouched.
    ///
    /// Used for tracking sources that report no orientation.
    pub fn transform_position_only(&self, position: &Point3<f64>, anchor: &mut Pose) {
        anchor.position = self.transform_point(position);
    }

    pub fn to_json_string(&self) -> Result<String, CalibrationError> {
        let file = CalibrationFile {
            matrix16: (0..4)
                .flat_map(|r| (0..4).map(move |c| (r, c)))
                .map(|(r, c)| self.matrix[(r, c)])
                .collect(),
            error: self.error,
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    /// Parses a calibration document.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::JsonError`] - the text is not a calibration document.
    /// * [`CalibrationError::InvalidCalibrationFile`] - the matrix does not have
    ///   16 finite entries, is not homogeneous, or the error is NaN/negative.
    pub fn from_json_str(contents: &str) -> Result<Self, CalibrationError> {
        let file: CalibrationFile = serde_json::from_str(contents)?;

        if file.matrix16.len() != 16 {
            return Err(CalibrationError::InvalidCalibrationFile(format!(
                "matrix16 must have 16 entries, found {}",
                file.matrix16.len()
            )));
        }
        if file.matrix16.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::InvalidCalibrationFile(
                "matrix16 contains non-finite values".to_string(),
            ));
        }
        if file.error.is_nan() || file.error < 0.0 {
            return Err(CalibrationError::InvalidCalibrationFile(format!(
                "error must be a non-negative number, found {}",
                file.error
            )));
        }

        let matrix = Matrix4::from_row_slice(&file.matrix16);
        let bottom = [0.0, 0.0, 0.0, 1.0];
        if (0..4).any(|c| (matrix[(3, c)] - bottom[c]).abs() > HOMOGENEOUS_ROW_TOLERANCE) {
            return Err(CalibrationError::InvalidCalibrationFile(
                "last matrix row must be [0, 0, 0, 1]".to_string(),
            ));
        }

        Ok(Self {
            matrix,
            error: file.error,
        })
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), CalibrationError> {
        let path = path.as_ref();
        fs::write(path, self.to_json_string()?)?;
        info!("Saved display calibration to {}", path.display());
        Ok(())
    }

    /// Loads a calibration written by [`RigidTransform::save_json`].
    ///
    /// A missing or malformed file is an error; no identity fallback is
    /// substituted here.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let calibration = Self::from_json_str(&contents)?;
        info!(
            "Loaded display calibration from {} (error {:e})",
            path.display(),
            calibration.error
        );
        Ok(calibration)
    }
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::geodesic_distance;
    use approx::assert_relative_eq;
    use std::io::Write;

    fn sample_transform() -> RigidTransform {
        RigidTransform::from_parts(
            &Vector3::new(0.2, 1.5, -0.4),
            &UnitQuaternion::from_euler_angles(0.1, 0.5, -0.2),
            &Vector3::new(1.0, 1.2, 0.9),
            0.0031,
        )
    }

    #[test]
    fn test_identity_is_uncalibrated() {
        let identity = RigidTransform::identity();
        assert_eq!(identity.error(), UNCALIBRATED_ERROR);
        assert!(!identity.is_calibrated());
        assert_eq!(*identity.matrix(), Matrix4::identity());
        assert_eq!(RigidTransform::default(), identity);
        assert!(sample_transform().is_calibrated());
    }

    #[test]
    fn test_decomposition_recovers_parts() {
        let rotation = UnitQuaternion::from_euler_angles(0.1, 0.5, -0.2);
        let transform = sample_transform();
        assert_relative_eq!(transform.translation(), Vector3::new(0.2, 1.5, -0.4), epsilon = 1e-12);
        assert_relative_eq!(transform.scale(), Vector3::new(1.0, 1.2, 0.9), epsilon = 1e-12);
        assert!(geodesic_distance(&transform.rotation(), &rotation) < 1e-9);
    }

    #[test]
    fn test_from_frames() {
        let display = Frame::new(
            Point3::new(0.0, 1.0, 0.0),
            UnitQuaternion::from_euler_angles(0.0, 0.3, 0.0),
            Vector3::repeat(1.0),
        );
        let tracking = Frame::new(
            Point3::new(0.5, 1.0, 2.0),
            UnitQuaternion::from_euler_angles(0.0, 0.8, 0.1),
            Vector3::new(2.0, 2.0, 2.0),
        );
        let transform = RigidTransform::from_frames(&tracking, &display);

        assert_eq!(transform.error(), 0.0);
        assert_relative_eq!(transform.scale(), Vector3::repeat(2.0), epsilon = 1e-12);
        assert_relative_eq!(
            transform.translation(),
            display.inverse_transform_point(&tracking.position).coords,
            epsilon = 1e-12
        );
        let expected_rotation = display.rotation.inverse() * tracking.rotation;
        assert!(geodesic_distance(&transform.rotation(), &expected_rotation) < 1e-9);
    }

    #[test]
    fn test_transform_pose_and_position_only() {
        let transform = sample_transform();
        let pose = Pose::new(
            Point3::new(0.3, -0.1, 0.8),
            UnitQuaternion::from_euler_angles(0.2, 0.0, 0.4),
        );
        let mapped = transform.transform_pose(&pose);
        assert_relative_eq!(mapped.position, transform.transform_point(&pose.position));
        assert!(geodesic_distance(&mapped.rotation, &(transform.rotation() * pose.rotation)) < 1e-9);

        let back = transform.inverse_transform_pose(&mapped);
        assert_relative_eq!(back.position, pose.position, epsilon = 1e-12);
        assert!(geodesic_distance(&back.rotation, &pose.rotation) < 1e-9);

        let original_rotation = UnitQuaternion::from_euler_angles(0.0, 1.0, 0.0);
        let mut anchor = Pose::new(Point3::origin(), original_rotation);
        transform.transform_position_only(&pose.position, &mut anchor);
        assert_relative_eq!(anchor.position, mapped.position);
        assert_eq!(anchor.rotation, original_rotation);
    }

    #[test]
    fn test_json_round_trip() {
        let transform = sample_transform();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("display_calibration.json");
        transform.save_json(&path).unwrap();
        let loaded = RigidTransform::load_json(&path).unwrap();
        assert_relative_eq!(*loaded.matrix(), *transform.matrix(), epsilon = 1e-15);
        assert_eq!(loaded.error(), transform.error());

        let identity = RigidTransform::from_json_str(&RigidTransform::identity().to_json_string().unwrap()).unwrap();
        assert_eq!(identity.error(), UNCALIBRATED_ERROR);
    }

    #[test]
    fn test_json_layout_is_row_major() {
        let transform = RigidTransform::from_parts(
            &Vector3::new(1.0, 2.0, 3.0),
            &UnitQuaternion::identity(),
            &Vector3::repeat(1.0),
            0.0,
        );
        let value: serde_json::Value = serde_json::from_str(&transform.to_json_string().unwrap()).unwrap();
        let matrix16 = value["matrix16"].as_array().unwrap();
        assert_eq!(matrix16[3].as_f64(), Some(1.0));
        assert_eq!(matrix16[7].as_f64(), Some(2.0));
        assert_eq!(matrix16[11].as_f64(), Some(3.0));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = RigidTransform::load_json(dir.path().join("missing.json"));
        assert!(matches!(result, Err(CalibrationError::IOError(_))));
    }

    #[test]
    fn test_load_malformed_file_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ \"matrix16\": [1.0, 0.0, ").unwrap();
        let result = RigidTransform::load_json(file.path());
        assert!(matches!(result, Err(CalibrationError::JsonError(_))));

        let short = r#"{ "matrix16": [1.0, 0.0, 0.0], "error": 0.0 }"#;
        assert!(matches!(
            RigidTransform::from_json_str(short),
            Err(CalibrationError::InvalidCalibrationFile(_))
        ));

        let projective = r#"{ "matrix16": [1,0,0,0, 0,1,0,0, 0,0,1,0, 0,0,1,1], "error": 0.0 }"#;
        assert!(matches!(
            RigidTransform::from_json_str(projective),
            Err(CalibrationError::InvalidCalibrationFile(_))
        ));
    }
}

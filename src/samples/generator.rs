//! Synthetic calibration samples from a known ground truth.
//!
//! For every target one left-eye and one right-eye sample are produced. The
//! eye is placed at a fixed viewing distance from the target along a
//! direction taken from a Fibonacci spiral, the view is rolled and tilted by
//! deterministic amounts so the target is seen off-axis, and the head pose
//! that produces this view is mapped back into tracking space with the
//! inverse of the ground-truth display transform. Uniform noise is finally
//! added to the tracked pose.

use crate::calibration::{CalibrationError, Eye, HeadToViewCalibration, RigidTransform};
use crate::geometry::Pose;
use crate::samples::CalibrationSample;
use log::debug;
use nalgebra::{Point3, UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const GOLDEN_ANGLE: f64 = 2.399_963_229_728_653;

/// Default distance between a target and the eye looking at it, metres.
pub const DEFAULT_VIEWING_DISTANCE: f64 = 0.6;

/// Per-axis magnitudes of the uniform noise added to tracked poses.
///
/// Each axis of each sample draws independently from `Uniform[-m, m]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseModel {
    /// Position noise, metres.
    pub position: Vector3<f64>,
    /// Rotation noise as a rotation vector, radians.
    pub rotation: Vector3<f64>,
}

impl NoiseModel {
    pub fn none() -> Self {
        Self {
            position: Vector3::zeros(),
            rotation: Vector3::zeros(),
        }
    }

    /// The same magnitude on every axis.
    pub fn uniform(position: f64, rotation: f64) -> Self {
        Self {
            position: Vector3::repeat(position),
            rotation: Vector3::repeat(rotation),
        }
    }

    fn validate(&self) -> Result<(), CalibrationError> {
        let valid = |v: &Vector3<f64>| v.iter().all(|m| m.is_finite() && *m >= 0.0);
        if valid(&self.position) && valid(&self.rotation) {
            Ok(())
        } else {
            Err(CalibrationError::InvalidParams(
                "noise magnitudes must be finite and non-negative".to_string(),
            ))
        }
    }

    fn draw(magnitude: &Vector3<f64>, rng: &mut StdRng) -> Vector3<f64> {
        Vector3::new(
            magnitude.x * rng.gen_range(-1.0..=1.0),
            magnitude.y * rng.gen_range(-1.0..=1.0),
            magnitude.z * rng.gen_range(-1.0..=1.0),
        )
    }
}

impl Default for NoiseModel {
    fn default() -> Self {
        Self::none()
    }
}

/// Left- and right-eye samples, in target order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyntheticSamples {
    pub left: Vec<CalibrationSample>,
    pub right: Vec<CalibrationSample>,
}

impl SyntheticSamples {
    pub fn len(&self) -> usize {
        self.left.len() + self.right.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty()
    }

    /// Both lists interleaved: left, right, left, right, ...
    pub fn all(&self) -> Vec<CalibrationSample> {
        let mut all = Vec::with_capacity(self.len());
        for (left, right) in self.left.iter().zip(self.right.iter()) {
            all.push(*left);
            all.push(*right);
        }
        all
    }
}

/// Produces synthetic samples for a known display and head-to-view calibration.
#[derive(Debug, Clone)]
pub struct SampleGenerator {
    display: RigidTransform,
    head_to_view: HeadToViewCalibration,
    interpupillary_distance: f64,
    targets: Vec<Point3<f64>>,
    noise: NoiseModel,
    seed: u64,
    viewing_distance: f64,
}

impl SampleGenerator {
    /// # Arguments
    ///
    /// * `display` - Ground-truth tracking-to-display transform.
    /// * `head_to_view` - Ground-truth head-to-view calibration.
    /// * `interpupillary_distance` - Eye separation in metres.
    /// * `targets` - Display-space points the subject looks at.
    pub fn new(
        display: RigidTransform,
        head_to_view: HeadToViewCalibration,
        interpupillary_distance: f64,
        targets: Vec<Point3<f64>>,
    ) -> Self {
        Self {
            display,
            head_to_view,
            interpupillary_distance,
            targets,
            noise: NoiseModel::none(),
            seed: 0,
            viewing_distance: DEFAULT_VIEWING_DISTANCE,
        }
    }

    pub fn with_noise(mut self, noise: NoiseModel) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_viewing_distance(mut self, viewing_distance: f64) -> Self {
        self.viewing_distance = viewing_distance;
        self
    }

    pub fn display(&self) -> &RigidTransform {
        &self.display
    }

    pub fn head_to_view(&self) -> &HeadToViewCalibration {
        &self.head_to_view
    }

    pub fn targets(&self) -> &[Point3<f64>] {
        &self.targets
    }

    /// Generates one left and one right sample per target.
    ///
    /// The same seed always yields the same samples.
    pub fn generate(&self) -> Result<SyntheticSamples, CalibrationError> {
        if self.targets.is_empty() {
            return Err(CalibrationError::InvalidParams(
                "at least one target is required".to_string(),
            ));
        }
        if !(self.viewing_distance.is_finite() && self.viewing_distance > 0.0) {
            return Err(CalibrationError::InvalidParams(format!(
                "viewing distance must be positive, found {}",
                self.viewing_distance
            )));
        }
        if !(self.interpupillary_distance.is_finite() && self.interpupillary_distance >= 0.0) {
            return Err(CalibrationError::InvalidParams(format!(
                "interpupillary distance must be non-negative, found {}",
                self.interpupillary_distance
            )));
        }
        if self.display.scale().iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(CalibrationError::InvalidParams(
                "display transform must have a positive scale".to_string(),
            ));
        }
        self.noise.validate()?;

        let mut rng = StdRng::seed_from_u64(self.seed);
        let count = 2 * self.targets.len();
        let mut samples = SyntheticSamples::default();

        for (i, target) in self.targets.iter().enumerate() {
            for (k, eye) in [Eye::Left, Eye::Right].into_iter().enumerate() {
                let n = 2 * i + k;
                let (view, gaze) = self.view_for(target, n, count);
                let head = self.head_to_view.head_pose(&view, eye, self.interpupillary_distance);
                let tracked = self.display.inverse_transform_pose(&head);
                let pose = self.add_noise(&tracked, &mut rng);
                let sample = CalibrationSample::new(i, eye, pose, *target, gaze);
                match eye {
                    Eye::Left => samples.left.push(sample),
                    _ => samples.right.push(sample),
                }
            }
        }

        debug!(
            "Generated {} synthetic samples from {} targets (seed {})",
            samples.len(),
            self.targets.len(),
            self.seed
        );
        Ok(samples)
    }

    /// View pose and view-frame gaze for the `n`-th of `count` samples.
    fn view_for(&self, target: &Point3<f64>, n: usize, count: usize) -> (Pose, Vector3<f64>) {
        let direction = fibonacci_direction(n, count);
        let eye = target + direction * self.viewing_distance;

        let forward = target - eye;
        let up = if forward.normalize().dot(&Vector3::y()).abs() > 0.95 {
            Vector3::x()
        } else {
            Vector3::y()
        };
        let look = UnitQuaternion::face_towards(&forward, &up);

        let t = n as f64;
        let roll = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.6 * (0.9 * t + 0.4).sin());
        let tilt = UnitQuaternion::from_euler_angles(0.3 * (1.7 * t).sin(), 0.3 * (2.3 * t).cos(), 0.0);

        let view = look * roll * tilt;
        let gaze = tilt.inverse() * Vector3::z();
        (Pose::new(eye, view), gaze)
    }

    fn add_noise(&self, pose: &Pose, rng: &mut StdRng) -> Pose {
        let position = NoiseModel::draw(&self.noise.position, rng);
        let rotation = NoiseModel::draw(&self.noise.rotation, rng);
        Pose::new(
            pose.position + position,
            pose.rotation * UnitQuaternion::from_scaled_axis(rotation),
        )
    }
}

/// Unit direction `n` of `count` spread evenly over the sphere.
fn fibonacci_direction(n: usize, count: usize) -> Vector3<f64> {
    let z = 1.0 - 2.0 * (n as f64 + 0.5) / count as f64;
    let radius = (1.0 - z * z).max(0.0).sqrt();
    let phi = n as f64 * GOLDEN_ANGLE;
    Vector3::new(radius * phi.cos(), z, radius * phi.sin())
}

/// `count` targets spread evenly over a sphere of `radius` around `center`.
pub fn targets_on_sphere(count: usize, radius: f64, center: Point3<f64>) -> Vec<Point3<f64>> {
    (0..count)
        .map(|n| center + fibonacci_direction(n, count) * radius)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::geodesic_distance;
    use approx::assert_relative_eq;

    fn generator() -> SampleGenerator {
        let display = RigidTransform::from_parts(
            &Vector3::new(0.0, -1.2, 0.5),
            &UnitQuaternion::from_euler_angles(0.0, 0.5, 0.0),
            &Vector3::new(1.0, 1.0, 1.0),
            0.0,
        );
        let head_to_view = HeadToViewCalibration::new(
            Vector3::new(0.0, -0.07, 0.09),
            UnitQuaternion::from_euler_angles(0.02, -0.03, 0.0),
            0.0,
        );
        SampleGenerator::new(
            display,
            head_to_view,
            0.064,
            targets_on_sphere(10, 0.3, Point3::origin()),
        )
    }

    #[test]
    fn test_targets_on_sphere() {
        let center = Point3::new(0.0, 1.0, 0.0);
        let targets = targets_on_sphere(25, 0.3, center);
        assert_eq!(targets.len(), 25);
        for target in &targets {
            assert_relative_eq!((target - center).norm(), 0.3, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_noise_free_samples_are_exact() {
        let generator = generator();
        let samples = generator.generate().unwrap();
        assert_eq!(samples.left.len(), 10);
        assert_eq!(samples.right.len(), 10);
        assert_eq!(samples.all().len(), 20);
        assert_eq!(samples.all()[1].anchor, Eye::Right);

        for sample in samples.all() {
            assert!(sample.validate(0).is_ok());
            let head = generator.display().transform_pose(&sample.pose);
            let view = generator
                .head_to_view()
                .view_pose(&head, sample.anchor, 0.064);
            let seen = (view.rotation.inverse() * (sample.target - view.position)).normalize();
            assert_relative_eq!(seen, sample.gaze, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_same_seed_same_samples() {
        let noise = NoiseModel::uniform(0.005, 0.01);
        let a = generator().with_noise(noise).with_seed(7).generate().unwrap();
        let b = generator().with_noise(noise).with_seed(7).generate().unwrap();
        let c = generator().with_noise(noise).with_seed(8).generate().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_noise_stays_within_magnitude() {
        let clean = generator().generate().unwrap().all();
        let noise = NoiseModel {
            position: Vector3::new(0.001, 0.002, 0.003),
            rotation: Vector3::repeat(0.01),
        };
        let noisy = generator().with_noise(noise).with_seed(3).generate().unwrap().all();
        for (c, n) in clean.iter().zip(noisy.iter()) {
            let delta = n.pose.position - c.pose.position;
            for axis in 0..3 {
                assert!(delta[axis].abs() <= noise.position[axis] + 1e-12);
            }
            assert!(geodesic_distance(&c.pose.rotation, &n.pose.rotation) <= 0.01 * 3f64.sqrt() + 1e-9);
            assert_eq!(c.gaze, n.gaze);
        }
    }

    #[test]
    fn test_invalid_inputs() {
        let empty = SampleGenerator::new(
            RigidTransform::identity(),
            HeadToViewCalibration::identity(),
            0.064,
            Vec::new(),
        );
        assert!(empty.generate().is_err());
        assert!(generator()
            .with_noise(NoiseModel::uniform(-0.1, 0.0))
            .generate()
            .is_err());
        assert!(generator().with_viewing_distance(0.0).generate().is_err());
    }
}

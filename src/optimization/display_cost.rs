//! Gaze residual of the display calibration.
//!
//! For a sample with tracked head pose `(p, q)` in tracking space, the eye
//! position in display space is
//!
//! ```text
//! e = t + R (s ⊙ p + q · o),    o = h + W · (±ipd/2, 0, 0)
//! ```
//!
//! and the view rotation is `V = R · q · W`, where `(R, t, s)` is the display
//! transform and `(h, W)` the head-to-view calibration. The residual of the
//! sample is the difference between the predicted unit direction towards the
//! target, expressed in the view frame, and the observed gaze direction:
//! `normalize(Vᵀ (c - e)) - g`.

use crate::geometry::rotation::{
    apply_matrix, inverse_rotate_by_rotation_vector, lift, rotate_by_rotation_vector,
};
use crate::optimization::layout::{CalibrationEstimate, ParameterLayout};
use crate::optimization::problem::LeastSquaresProblem;
use crate::samples::CalibrationSample;
use nalgebra::{DVector, Matrix3, RealField, Vector3};
use tiny_solver::factors::Factor;

/// Residual entries per sample.
pub const RESIDUALS_PER_SAMPLE: usize = 3;

#[derive(Debug, Clone)]
struct PreparedSample {
    position: Vector3<f64>,
    rotation: Matrix3<f64>,
    rotation_transpose: Matrix3<f64>,
    /// Signed half interpupillary distance along the view `x` axis.
    lateral: f64,
    target: Vector3<f64>,
    gaze: Vector3<f64>,
}

/// Residual of the display calibration, bound to a fixed sample set.
///
/// Implements [`LeastSquaresProblem`] for the bounded solver and
/// `tiny_solver`'s [`Factor`] for the alternative backend. Both evaluate the
/// same generic residual.
#[derive(Debug, Clone)]
pub struct DisplayCalibrationCost {
    samples: Vec<PreparedSample>,
    layout: ParameterLayout,
    fixed: CalibrationEstimate,
}

impl DisplayCalibrationCost {
    /// Creates the cost for `samples`.
    ///
    /// # Arguments
    ///
    /// * `samples` - Observed samples; assumed validated.
    /// * `interpupillary_distance` - Eye separation in metres.
    /// * `layout` - Which blocks the parameter vector carries.
    /// * `fixed` - Values of the blocks `layout` does not estimate.
    pub fn new(
        samples: &[CalibrationSample],
        interpupillary_distance: f64,
        layout: ParameterLayout,
        fixed: CalibrationEstimate,
    ) -> Self {
        let samples = samples
            .iter()
            .map(|sample| {
                let rotation = *sample.pose.rotation.to_rotation_matrix().matrix();
                PreparedSample {
                    position: sample.pose.position.coords,
                    rotation,
                    rotation_transpose: rotation.transpose(),
                    lateral: sample.anchor.lateral_sign() * 0.5 * interpupillary_distance,
                    target: sample.target.coords,
                    gaze: sample.gaze,
                }
            })
            .collect();
        Self {
            samples,
            layout,
            fixed,
        }
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub fn fixed(&self) -> &CalibrationEstimate {
        &self.fixed
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    fn block<T: RealField>(x: &DVector<T>, offset: usize) -> Vector3<T> {
        Vector3::new(
            x[offset].clone(),
            x[offset + 1].clone(),
            x[offset + 2].clone(),
        )
    }

    /// Evaluates the stacked residual for any scalar type.
    pub fn residual_generic<T: RealField>(&self, x: &DVector<T>) -> DVector<T> {
        let offsets = self.layout.offsets();
        let r_display = Self::block(x, offsets.rotation);
        let t_display = Self::block(x, offsets.translation);
        let scale = offsets
            .scale
            .map_or_else(|| lift(&self.fixed.scale), |i| Self::block(x, i));
        let head_offset = offsets
            .head_offset
            .map_or_else(|| lift(&self.fixed.head_offset), |i| Self::block(x, i));
        let r_view = offsets
            .view_rotation
            .map_or_else(|| lift(&self.fixed.view_rotation), |i| Self::block(x, i));

        let min_norm: T = nalgebra::convert(1e-12);
        let mut residuals = DVector::zeros(self.samples.len() * RESIDUALS_PER_SAMPLE);

        for (i, sample) in self.samples.iter().enumerate() {
            let lateral = Vector3::new(nalgebra::convert(sample.lateral), T::zero(), T::zero());
            let eye_offset = head_offset.clone() + rotate_by_rotation_vector(&r_view, &lateral);

            let local = scale.component_mul(&lift(&sample.position))
                + apply_matrix(&sample.rotation, &eye_offset);
            let eye = t_display.clone() + rotate_by_rotation_vector(&r_display, &local);

            // Vᵀ (c - e) = Wᵀ qᵀ Rᵀ (c - e)
            let to_target = lift::<T>(&sample.target) - eye;
            let in_head = apply_matrix(
                &sample.rotation_transpose,
                &inverse_rotate_by_rotation_vector(&r_display, &to_target),
            );
            let in_view = inverse_rotate_by_rotation_vector(&r_view, &in_head);

            let norm = in_view.norm();
            let direction = if norm > min_norm {
                in_view / norm
            } else {
                Vector3::zeros()
            };
            let residual = direction - lift::<T>(&sample.gaze);

            let row = i * RESIDUALS_PER_SAMPLE;
            residuals[row] = residual.x.clone();
            residuals[row + 1] = residual.y.clone();
            residuals[row + 2] = residual.z.clone();
        }

        residuals
    }

    /// Angle in radians between predicted and observed gaze, per sample.
    pub fn angular_errors(&self, x: &DVector<f64>) -> Vec<f64> {
        let residual = self.residual_generic(x);
        residual
            .as_slice()
            .chunks_exact(RESIDUALS_PER_SAMPLE)
            .map(|chunk| {
                // Chord between two unit vectors: |a - b| = 2 sin(θ/2).
                let chord = Vector3::new(chunk[0], chunk[1], chunk[2]).norm();
                2.0 * (0.5 * chord).min(1.0).asin()
            })
            .collect()
    }

    /// Root mean square of the residual vector, per sample.
    pub fn rms(&self, x: &DVector<f64>) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        (self.residual_generic(x).norm_squared() / self.samples.len() as f64).sqrt()
    }
}

impl LeastSquaresProblem for DisplayCalibrationCost {
    fn num_parameters(&self) -> usize {
        self.layout.len()
    }

    fn num_residuals(&self) -> usize {
        self.samples.len() * RESIDUALS_PER_SAMPLE
    }

    fn residual(&self, x: &DVector<f64>) -> DVector<f64> {
        self.residual_generic(x)
    }
}

impl<T: RealField> Factor<T> for DisplayCalibrationCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        self.residual_generic(&params[0])
    }
}

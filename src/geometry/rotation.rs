//! Rotation helpers shared by the calibration types and the residual functions.
//!
//! Rotations are exchanged as [`UnitQuaternion`]s everywhere outside the
//! optimizer. Inside the optimizer they are parameterized as absolute rotation
//! vectors (unit axis scaled by the angle in radians), and the generic helpers
//! here apply such a vector to a point for any [`RealField`] scalar so the same
//! code can be evaluated with `f64` or with the dual numbers used by
//! `tiny-solver`.

use nalgebra::{Matrix3, RealField, UnitQuaternion, Vector3};

/// Squared rotation angle below which the Rodrigues formula is replaced by its
/// second order expansion.
const SMALL_ANGLE_SQ: f64 = 1e-12;

/// Geodesic distance between two orientations, in radians.
///
/// This is the rotation angle of the relative rotation `a⁻¹ · b`. The result
/// is symmetric, lies in `[0, π]` and is exactly zero for identical inputs.
///
/// # Arguments
///
/// * `a` - First orientation.
/// * `b` - Second orientation.
///
/// # Examples
///
/// ```rust
/// use nalgebra::UnitQuaternion;
/// use spheree_calib::geometry::geodesic_distance;
///
/// let a = UnitQuaternion::from_euler_angles(0.0, 0.3, 0.0);
/// let b = UnitQuaternion::from_euler_angles(0.0, -0.2, 0.0);
/// assert!((geodesic_distance(&a, &b) - 0.5).abs() < 1e-12);
/// assert_eq!(geodesic_distance(&a, &a), 0.0);
/// ```
pub fn geodesic_distance(a: &UnitQuaternion<f64>, b: &UnitQuaternion<f64>) -> f64 {
    let qa = a.quaternion();
    let qb = b.quaternion();

    // conj(a) * b, with the vector part grouped in pairs that cancel exactly when a == b
    let w = qa.w * qb.w + qa.i * qb.i + qa.j * qb.j + qa.k * qb.k;
    let x = (qa.w * qb.i - qa.i * qb.w) + (qa.k * qb.j - qa.j * qb.k);
    let y = (qa.w * qb.j - qa.j * qb.w) + (qa.i * qb.k - qa.k * qb.i);
    let z = (qa.w * qb.k - qa.k * qb.w) + (qa.j * qb.i - qa.i * qb.j);

    let v = (x * x + y * y + z * z).sqrt();
    2.0 * v.atan2(w.abs())
}

/// [`geodesic_distance`] expressed in degrees, for reporting.
pub fn geodesic_distance_deg(a: &UnitQuaternion<f64>, b: &UnitQuaternion<f64>) -> f64 {
    geodesic_distance(a, b).to_degrees()
}

/// Geodesic distance computed from the quaternion dot product, `2·acos(|⟨a, b⟩|)`.
///
/// Round-off can push the dot product of two unit quaternions slightly above
/// one, so the argument is clamped to `[-1, 1]` before the arccosine.
/// Less accurate than [`geodesic_distance`] for small angles.
pub fn geodesic_distance_acos(a: &UnitQuaternion<f64>, b: &UnitQuaternion<f64>) -> f64 {
    let dot = a.coords.dot(&b.coords).abs().clamp(-1.0, 1.0);
    2.0 * dot.acos()
}

/// Converts a rotation vector (axis scaled by angle) into a unit quaternion.
pub fn rotation_vector_to_quaternion(rotation_vector: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*rotation_vector)
}

/// Converts a unit quaternion into its rotation vector, with angle in `[0, π]`.
pub fn quaternion_to_rotation_vector(rotation: &UnitQuaternion<f64>) -> Vector3<f64> {
    rotation.scaled_axis()
}

/// Rotates `v` by the rotation vector `w` using the Rodrigues formula.
///
/// Small angles use the expansion `v + w×v + ½ w×(w×v)` so the derivative
/// stays finite at the identity.
pub fn rotate_by_rotation_vector<T: RealField>(w: &Vector3<T>, v: &Vector3<T>) -> Vector3<T> {
    let theta_sq = w.norm_squared();
    if theta_sq > nalgebra::convert(SMALL_ANGLE_SQ) {
        let theta = theta_sq.sqrt();
        let axis = w / theta.clone();
        let (sin, cos) = theta.sin_cos();
        let along = axis.dot(v) * (T::one() - cos.clone());
        v * cos + axis.cross(v) * sin + axis * along
    } else {
        let wxv = w.cross(v);
        let half: T = nalgebra::convert(0.5);
        let second = w.cross(&wxv) * half;
        v + wxv + second
    }
}

/// Rotates `v` by the inverse of the rotation vector `w`.
pub fn inverse_rotate_by_rotation_vector<T: RealField>(
    w: &Vector3<T>,
    v: &Vector3<T>,
) -> Vector3<T> {
    rotate_by_rotation_vector(&(-w), v)
}

/// Applies a fixed `f64` rotation matrix to a generic vector.
pub fn apply_matrix<T: RealField>(m: &Matrix3<f64>, v: &Vector3<T>) -> Vector3<T> {
    let row = |r: usize| -> T {
        let a: T = nalgebra::convert(m[(r, 0)]);
        let b: T = nalgebra::convert(m[(r, 1)]);
        let c: T = nalgebra::convert(m[(r, 2)]);
        a * v.x.clone() + b * v.y.clone() + c * v.z.clone()
    };
    Vector3::new(row(0), row(1), row(2))
}

/// Lifts an `f64` vector into the generic scalar type.
pub fn lift<T: RealField>(v: &Vector3<f64>) -> Vector3<T> {
    Vector3::new(
        nalgebra::convert(v.x),
        nalgebra::convert(v.y),
        nalgebra::convert(v.z),
    )
}

//! Plane3D: infinite plane in Hessian normal form.
//!
//! A plane is stored as `π = [n, d]` with `|n| = 1` and `n·p + d = 0` for
//! every point `p` on the plane. The manifold has three degrees of freedom:
//! azimuth and elevation of the normal plus the signed distance `-d`.
//!
//! ```text
//! ominus(a, b) = [azimuth(R_a^T n_b), elevation(R_a^T n_b), dist(a) - dist(b)]
//! ```
//!
//! where `R_a` is the rotation bringing `(1, 0, 0)` onto `n_a`.

use nalgebra::{Rotation3, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use super::SE3;

/// Plane with unit normal and offset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Plane3D {
    coeffs: Vector4<f64>,
}

impl Plane3D {
    /// Construct from raw coefficients `[a, b, c, d]`, normalizing the normal.
    pub fn new(coeffs: Vector4<f64>) -> Self {
        Self {
            coeffs: normalize(coeffs),
        }
    }

    pub fn from_normal_offset(normal: Vector3<f64>, d: f64) -> Self {
        Self::new(Vector4::new(normal.x, normal.y, normal.z, d))
    }

    /// Normalized coefficients `[n, d]`.
    pub fn coeffs(&self) -> &Vector4<f64> {
        &self.coeffs
    }

    pub fn normal(&self) -> Vector3<f64> {
        self.coeffs.fixed_rows::<3>(0).into_owned()
    }

    /// The `d` coefficient of `n·p + d = 0`.
    pub fn offset(&self) -> f64 {
        self.coeffs[3]
    }

    /// Signed distance of the plane from the origin along its normal.
    pub fn distance(&self) -> f64 {
        -self.coeffs[3]
    }

    /// Signed distance of `p` to the plane.
    pub fn signed_distance(&self, p: &Vector3<f64>) -> f64 {
        self.normal().dot(p) + self.coeffs[3]
    }

    /// Express this plane in the frame mapped by `pose`, i.e. `pose * π`.
    pub fn transform(&self, pose: &SE3) -> Self {
        let normal = pose.rotate_vector(&self.normal());
        let d = self.coeffs[3] - pose.translation.dot(&normal);
        Self::new(Vector4::new(normal.x, normal.y, normal.z, d))
    }

    /// Minimal 3-vector error between `self` and `other`.
    pub fn ominus(&self, other: &Plane3D) -> Vector3<f64> {
        let r = normal_rotation(&self.normal()).transpose();
        let n = r * other.normal();
        Vector3::new(azimuth(&n), elevation(&n), self.distance() - other.distance())
    }

    /// Apply a minimal increment `[azimuth, elevation, distance]`.
    pub fn oplus(&self, delta: &[f64]) -> Self {
        let (s, c) = delta[1].sin_cos();
        let n = Vector3::new(c * delta[0].cos(), c * delta[0].sin(), s);
        let normal = normal_rotation(&self.normal()) * n;
        let distance = self.distance() + delta[2];
        Self::new(Vector4::new(normal.x, normal.y, normal.z, -distance))
    }
}

impl Default for Plane3D {
    fn default() -> Self {
        Self::new(Vector4::new(1.0, 0.0, 0.0, 1.0))
    }
}

pub fn azimuth(v: &Vector3<f64>) -> f64 {
    v.y.atan2(v.x)
}

pub fn elevation(v: &Vector3<f64>) -> f64 {
    v.z.atan2(v.xy().norm())
}

/// Rotation that maps the x axis onto `n`.
fn normal_rotation(n: &Vector3<f64>) -> Rotation3<f64> {
    Rotation3::from_axis_angle(&Vector3::z_axis(), azimuth(n))
        * Rotation3::from_axis_angle(&Vector3::y_axis(), -elevation(n))
}

fn normalize(coeffs: Vector4<f64>) -> Vector4<f64> {
    let n = coeffs.fixed_rows::<3>(0).norm();
    if n > f64::EPSILON {
        coeffs / n
    } else {
        coeffs
    }
}

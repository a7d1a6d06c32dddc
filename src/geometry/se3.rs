//! SE3: 6-DOF rigid body transformation (rotation + translation).
//!
//! Transforms points as: p' = R * p + t
//!
//! The tangent parameterization used by the optimizer is the "split" one:
//! `[ω, v]` where `ω` is an axis-angle rotation increment applied on the
//! right and `v` a translation increment in the parent frame.

use nalgebra::{Matrix3, Matrix4, Rotation3, Unit, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

/// Angles below this are treated as zero when building rotations.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-10;

/// Rigid body transformation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Pure translation.
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    /// Construct from quaternion (w, x, y, z) and translation.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(qw, qx, qy, qz));
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from a rotation matrix and translation.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix(&rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Homogeneous 4x4 matrix [R | t; 0 0 0 1].
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut mat = Matrix4::identity();
        mat.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.to_rotation_matrix().matrix());
        mat.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        mat
    }

    /// Construct from a homogeneous 4x4 matrix.
    pub fn from_matrix(mat: &Matrix4<f64>) -> Self {
        let rotation = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let translation = Vector3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]);
        Self::from_rt(rotation, translation)
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// Composition: (self * other)(p) = self(other(p)).
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn rotate_vector(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * v
    }

    /// Rotation angle in radians.
    pub fn angle(&self) -> f64 {
        self.rotation.angle()
    }

    /// Split tangent vector `[ω, t]` of this transform.
    pub fn to_tangent(&self) -> Vector6<f64> {
        let w = self.rotation.scaled_axis();
        Vector6::new(
            w.x,
            w.y,
            w.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        )
    }

    /// Inverse of [`SE3::to_tangent`].
    pub fn from_tangent(tangent: &Vector6<f64>) -> Self {
        let w = Vector3::new(tangent[0], tangent[1], tangent[2]);
        Self {
            rotation: rotation_from_axis_angle(&w),
            translation: Vector3::new(tangent[3], tangent[4], tangent[5]),
        }
    }

    /// Apply a split increment: R' = R * exp(ω), t' = t + v.
    pub fn oplus(&self, delta: &[f64]) -> Self {
        let w = Vector3::new(delta[0], delta[1], delta[2]);
        let v = Vector3::new(delta[3], delta[4], delta[5]);
        Self {
            rotation: self.rotation * rotation_from_axis_angle(&w),
            translation: self.translation + v,
        }
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        self.compose(&rhs)
    }
}

/// Exponential map of SO(3) from an axis-angle vector.
pub fn rotation_from_axis_angle(w: &Vector3<f64>) -> UnitQuaternion<f64> {
    let angle = w.norm();
    if angle > SMALL_ANGLE_THRESHOLD {
        UnitQuaternion::from_axis_angle(&Unit::new_normalize(*w / angle), angle)
    } else {
        UnitQuaternion::identity()
    }
}

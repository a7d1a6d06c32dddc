//! Geometry primitives: SE3 transforms and Hessian-form planes.

pub mod plane;
pub mod se3;

pub use plane::Plane3D;
pub use se3::{rotation_from_axis_angle, SE3};

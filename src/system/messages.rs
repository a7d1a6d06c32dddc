//! Sensor messages accepted by the orchestrator.
//!
//! All stamps are nanoseconds on the sensor clock shared by every stream.

use nalgebra::{UnitQuaternion, Vector3, Vector4};

use crate::geometry::SE3;
use crate::keyframe::{PlaneSegment, PointCloud};

/// Odometry pose with the scan taken at the same instant.
#[derive(Debug, Clone)]
pub struct OdometryCloud {
    pub stamp_ns: u64,
    /// Pose in the odometry frame.
    pub odom: SE3,
    /// Scan in the body frame.
    pub cloud: PointCloud,
}

/// Floor plane detected in the body frame of the keyframe with the same stamp.
#[derive(Debug, Clone)]
pub struct FloorCoefficients {
    pub stamp_ns: u64,
    pub coeffs: Vector4<f64>,
}

/// GPS fix already converted to UTM.
#[derive(Debug, Clone)]
pub struct GpsFix {
    pub stamp_ns: u64,
    /// Easting, northing and altitude. Altitude is NaN when unknown.
    pub utm: Vector3<f64>,
}

/// Orientation and linear acceleration expressed in the IMU frame.
#[derive(Debug, Clone)]
pub struct ImuSample {
    pub stamp_ns: u64,
    pub frame_id: String,
    pub orientation: UnitQuaternion<f64>,
    pub acceleration: Vector3<f64>,
}

/// Plane segments extracted from the scan of one keyframe.
#[derive(Debug, Clone)]
pub struct SegmentedPlanes {
    pub stamp_ns: u64,
    pub segments: Vec<PlaneSegment>,
}

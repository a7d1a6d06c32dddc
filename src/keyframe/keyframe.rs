//! Keyframe - an accepted odometry sample attached to the pose graph.
//!
//! Keyframes hold:
//! - Sensor data (raw odometry pose, point cloud, optional plane segments)
//! - Priors matched during flushes (UTM coordinate, IMU orientation and
//!   acceleration, floor coefficients)
//! - The id of the pose node that owns their estimate
//!
//! Point data is immutable once created and shared through `Arc` so that
//! snapshots do not copy clouds.

use std::sync::Arc;

use nalgebra::{UnitQuaternion, Vector3, Vector4};

use crate::geometry::SE3;
use crate::graph::{KeyframeId, NodeId, PoseGraph};

use super::point_cloud::{PlaneSegment, PointCloud};

/// A keyframe of the trajectory.
#[derive(Debug, Clone)]
pub struct Keyframe {
    pub id: KeyframeId,

    /// Timestamp in nanoseconds.
    pub stamp_ns: u64,

    /// Raw odometry pose (odom frame).
    pub odom: SE3,

    /// Travel distance accumulated by the keyframe updater up to this keyframe.
    pub accum_distance: f64,

    pub cloud: Arc<PointCloud>,

    /// Plane segments assigned during the segmented-cloud flush.
    pub plane_segments: Vec<PlaneSegment>,

    // ─────────────────────────────────────────────────────────────────────────
    // Priors
    // ─────────────────────────────────────────────────────────────────────────
    /// GPS position relative to the first fix.
    pub utm_coord: Option<Vector3<f64>>,
    /// IMU orientation in the base frame.
    pub orientation: Option<UnitQuaternion<f64>>,
    /// IMU acceleration in the base frame.
    pub acceleration: Option<Vector3<f64>>,
    pub floor_coeffs: Option<Vector4<f64>>,

    /// Pose node, set when the keyframe is flushed into the graph.
    pub node: Option<NodeId>,
}

impl Keyframe {
    pub fn new(
        id: KeyframeId,
        stamp_ns: u64,
        odom: SE3,
        accum_distance: f64,
        cloud: Arc<PointCloud>,
    ) -> Self {
        Self {
            id,
            stamp_ns,
            odom,
            accum_distance,
            cloud,
            plane_segments: Vec::new(),
            utm_coord: None,
            orientation: None,
            acceleration: None,
            floor_coeffs: None,
            node: None,
        }
    }

    /// Current graph estimate of this keyframe's pose.
    pub fn estimate(&self, graph: &PoseGraph) -> Option<SE3> {
        self.node.and_then(|node| graph.pose(node))
    }
}

/// Read-only copy of a keyframe for consumers outside the main lock.
#[derive(Debug, Clone)]
pub struct KeyframeSnapshot {
    pub stamp_ns: u64,
    pub pose: SE3,
    pub cloud: Arc<PointCloud>,
}

impl KeyframeSnapshot {
    /// Snapshot at the keyframe's current estimate; `None` before it has a node.
    pub fn new(keyframe: &Keyframe, graph: &PoseGraph) -> Option<Self> {
        Some(Self {
            stamp_ns: keyframe.stamp_ns,
            pose: keyframe.estimate(graph)?,
            cloud: Arc::clone(&keyframe.cloud),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_uses_graph_estimate() {
        let mut graph = PoseGraph::new();
        let pose = SE3::from_translation(Vector3::new(1.0, 2.0, 0.0));
        let mut keyframe = Keyframe::new(
            KeyframeId::new(0),
            5,
            SE3::identity(),
            0.0,
            Arc::new(PointCloud::default()),
        );
        assert!(KeyframeSnapshot::new(&keyframe, &graph).is_none());

        keyframe.node = Some(graph.add_se3_node(pose));
        let snapshot = KeyframeSnapshot::new(&keyframe, &graph).unwrap();
        assert_eq!(snapshot.pose, pose);
        assert_eq!(snapshot.stamp_ns, 5);
        assert!(Arc::ptr_eq(&snapshot.cloud, &keyframe.cloud));
    }
}

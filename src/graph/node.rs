//! Graph nodes: one tagged estimate per node.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::{Plane3D, SE3};

use super::types::NodeId;

/// Estimate held by a node, tagged by node type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NodeEstimate {
    /// Robot pose (keyframe or anchor).
    Pose(SE3),
    /// Map-frame plane.
    Plane(Plane3D),
    /// Corridor centre; the coordinate across the corridor lives in the
    /// plane-offset convention of its bounding walls.
    Corridor(Vector3<f64>),
    /// Room centre in the xy plane.
    Room(Vector2<f64>),
}

impl NodeEstimate {
    /// Degrees of freedom of the estimate's tangent space.
    pub fn dimension(&self) -> usize {
        match self {
            Self::Pose(_) => 6,
            Self::Plane(_) => 3,
            Self::Corridor(_) => 3,
            Self::Room(_) => 2,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Pose(_) => "pose",
            Self::Plane(_) => "plane",
            Self::Corridor(_) => "corridor",
            Self::Room(_) => "room",
        }
    }

    /// Apply a tangent increment of length [`NodeEstimate::dimension`].
    pub fn oplus(&self, delta: &[f64]) -> Self {
        match self {
            Self::Pose(pose) => Self::Pose(pose.oplus(delta)),
            Self::Plane(plane) => Self::Plane(plane.oplus(delta)),
            Self::Corridor(c) => Self::Corridor(c + Vector3::new(delta[0], delta[1], delta[2])),
            Self::Room(r) => Self::Room(r + Vector2::new(delta[0], delta[1])),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub estimate: NodeEstimate,
    /// Fixed nodes are held constant by the optimizer.
    pub fixed: bool,
}

impl Node {
    pub fn new(id: NodeId, estimate: NodeEstimate) -> Self {
        Self {
            id,
            estimate,
            fixed: false,
        }
    }

    pub fn pose(&self) -> Option<SE3> {
        match self.estimate {
            NodeEstimate::Pose(pose) => Some(pose),
            _ => None,
        }
    }

    pub fn plane(&self) -> Option<Plane3D> {
        match self.estimate {
            NodeEstimate::Plane(plane) => Some(plane),
            _ => None,
        }
    }

    pub fn corridor(&self) -> Option<Vector3<f64>> {
        match self.estimate {
            NodeEstimate::Corridor(c) => Some(c),
            _ => None,
        }
    }

    pub fn room(&self) -> Option<Vector2<f64>> {
        match self.estimate {
            NodeEstimate::Room(r) => Some(r),
            _ => None,
        }
    }
}

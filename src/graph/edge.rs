//! Graph edges as a tagged variant.
//!
//! Every edge carries its measurement in an [`EdgeKind`] payload, an
//! information matrix sized to the residual, and an optional robust kernel.
//! Residual evaluation is a single match over the kind, so dump, render and
//! optimization code never has to discover edge types at runtime.

use nalgebra::{DMatrix, DVector, Matrix4, UnitQuaternion, Vector2, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::geometry::{Plane3D, SE3};
use crate::planes::class::{structure_plane_measurement, PlaneClass};

use super::node::NodeEstimate;
use super::robust_kernel::RobustKernel;
use super::types::{EdgeId, NodeId};

/// Measurement payload, one variant per constraint type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Relative pose `a⁻¹ · b` (odometry, loop closure, anchor).
    Se3 { measurement: SE3 },
    /// Plane observed in the pose's body frame.
    Se3Plane { measurement: Plane3D },
    /// Outer-product sum `Σ p pᵀ` of homogeneous body-frame plane points.
    Se3PointToPlane { points_outer: Matrix4<f64> },
    PriorXy { measurement: Vector2<f64> },
    PriorXyz { measurement: Vector3<f64> },
    PriorQuat { measurement: UnitQuaternion<f64> },
    /// Map-frame `direction` expected to appear as `measurement` in the body frame.
    PriorVec {
        direction: Vector3<f64>,
        measurement: Vector3<f64>,
    },
    PlaneParallel,
    PlanePerpendicular,
    /// Corridor centre in the anchoring keyframe's frame.
    Se3Corridor { measurement: Vector3<f64> },
    CorridorPlane { axis: PlaneClass, measurement: f64 },
    /// Room centre in the anchoring keyframe's frame.
    Se3Room { measurement: Vector2<f64> },
    RoomPlane { axis: PlaneClass, measurement: f64 },
}

impl EdgeKind {
    /// Residual dimension.
    pub fn dimension(&self) -> usize {
        match self {
            Self::Se3 { .. } => 6,
            Self::Se3Plane { .. } => 3,
            Self::Se3PointToPlane { .. } => 1,
            Self::PriorXy { .. } => 2,
            Self::PriorXyz { .. } => 3,
            Self::PriorQuat { .. } => 3,
            Self::PriorVec { .. } => 3,
            Self::PlaneParallel => 3,
            Self::PlanePerpendicular => 1,
            Self::Se3Corridor { .. } => 3,
            Self::CorridorPlane { .. } => 1,
            Self::Se3Room { .. } => 2,
            Self::RoomPlane { .. } => 1,
        }
    }

    /// Number of nodes the edge connects.
    pub fn arity(&self) -> usize {
        match self {
            Self::PriorXy { .. }
            | Self::PriorXyz { .. }
            | Self::PriorQuat { .. }
            | Self::PriorVec { .. } => 1,
            _ => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Se3 { .. } => "se3",
            Self::Se3Plane { .. } => "se3_plane",
            Self::Se3PointToPlane { .. } => "se3_point_to_plane",
            Self::PriorXy { .. } => "prior_xy",
            Self::PriorXyz { .. } => "prior_xyz",
            Self::PriorQuat { .. } => "prior_quat",
            Self::PriorVec { .. } => "prior_vec",
            Self::PlaneParallel => "plane_parallel",
            Self::PlanePerpendicular => "plane_perpendicular",
            Self::Se3Corridor { .. } => "se3_corridor",
            Self::CorridorPlane { .. } => "corridor_plane",
            Self::Se3Room { .. } => "se3_room",
            Self::RoomPlane { .. } => "room_plane",
        }
    }

    /// Expected node types, in connection order.
    pub fn expected_kinds(&self) -> &'static [&'static str] {
        match self {
            Self::Se3 { .. } => &["pose", "pose"],
            Self::Se3Plane { .. } | Self::Se3PointToPlane { .. } => &["pose", "plane"],
            Self::PriorXy { .. }
            | Self::PriorXyz { .. }
            | Self::PriorQuat { .. }
            | Self::PriorVec { .. } => &["pose"],
            Self::PlaneParallel | Self::PlanePerpendicular => &["plane", "plane"],
            Self::Se3Corridor { .. } => &["pose", "corridor"],
            Self::CorridorPlane { .. } => &["corridor", "plane"],
            Self::Se3Room { .. } => &["pose", "room"],
            Self::RoomPlane { .. } => &["room", "plane"],
        }
    }

    /// Raw (unweighted) residual for the given node estimates.
    ///
    /// Returns `None` if the estimates do not match the edge's node types.
    pub fn error(&self, estimates: &[NodeEstimate]) -> Option<DVector<f64>> {
        use NodeEstimate as E;

        let err = match (self, estimates) {
            (Self::Se3 { measurement }, [E::Pose(a), E::Pose(b)]) => {
                let delta = measurement.inverse().compose(&a.inverse().compose(b));
                let w = delta.rotation.scaled_axis();
                let t = delta.translation;
                DVector::from_column_slice(&[t.x, t.y, t.z, w.x, w.y, w.z])
            }
            (Self::Se3Plane { measurement }, [E::Pose(pose), E::Plane(plane)]) => {
                let local = plane.transform(&pose.inverse());
                let e = local.ominus(measurement);
                DVector::from_column_slice(e.as_slice())
            }
            (Self::Se3PointToPlane { points_outer }, [E::Pose(pose), E::Plane(plane)]) => {
                let t = pose.to_matrix();
                let pi: &Vector4<f64> = plane.coeffs();
                let e = (pi.transpose() * t * points_outer * t.transpose() * pi)[(0, 0)];
                DVector::from_element(1, e)
            }
            (Self::PriorXy { measurement }, [E::Pose(pose)]) => {
                let e = pose.translation.xy() - measurement;
                DVector::from_column_slice(e.as_slice())
            }
            (Self::PriorXyz { measurement }, [E::Pose(pose)]) => {
                let e = pose.translation - measurement;
                DVector::from_column_slice(e.as_slice())
            }
            (Self::PriorQuat { measurement }, [E::Pose(pose)]) => {
                let e = (measurement.inverse() * pose.rotation).scaled_axis();
                DVector::from_column_slice(e.as_slice())
            }
            (
                Self::PriorVec {
                    direction,
                    measurement,
                },
                [E::Pose(pose)],
            ) => {
                let e = pose.rotation.inverse() * direction - measurement;
                DVector::from_column_slice(e.as_slice())
            }
            (Self::PlaneParallel, [E::Plane(a), E::Plane(b)]) => {
                let n1 = a.normal();
                let mut n2 = b.normal();
                if n1.dot(&n2) < 0.0 {
                    n2 = -n2;
                }
                let e = n2 - n1;
                DVector::from_column_slice(e.as_slice())
            }
            (Self::PlanePerpendicular, [E::Plane(a), E::Plane(b)]) => {
                DVector::from_element(1, a.normal().dot(&b.normal()))
            }
            (Self::Se3Corridor { measurement }, [E::Pose(pose), E::Corridor(c)]) => {
                let e = pose.inverse().transform_point(c) - measurement;
                DVector::from_column_slice(e.as_slice())
            }
            (Self::CorridorPlane { axis, measurement }, [E::Corridor(c), E::Plane(plane)]) => {
                let offset = axis.corrected_offset(plane.coeffs());
                let est = structure_plane_measurement(c[axis.axis_index()], offset);
                DVector::from_element(1, est - measurement)
            }
            (Self::Se3Room { measurement }, [E::Pose(pose), E::Room(r)]) => {
                let local = pose.inverse().transform_point(&Vector3::new(r.x, r.y, 0.0));
                let e = local.xy() - measurement;
                DVector::from_column_slice(e.as_slice())
            }
            (Self::RoomPlane { axis, measurement }, [E::Room(r), E::Plane(plane)]) => {
                let offset = axis.corrected_offset(plane.coeffs());
                let est = structure_plane_measurement(r[axis.axis_index()], offset);
                DVector::from_element(1, est - measurement)
            }
            _ => return None,
        };
        Some(err)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub nodes: Vec<NodeId>,
    pub kind: EdgeKind,
    /// Square information matrix of size `kind.dimension()`.
    pub information: DMatrix<f64>,
    pub kernel: Option<RobustKernel>,
}

impl Edge {
    pub fn connects(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    /// Squared Mahalanobis error `rᵀ Ω r`, before the robust kernel.
    pub fn chi2(&self, estimates: &[NodeEstimate]) -> Option<f64> {
        let r = self.kind.error(estimates)?;
        Some((r.transpose() * &self.information * &r)[(0, 0)])
    }
}

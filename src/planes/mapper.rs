//! Plane mapper: turns segmented planes of a keyframe into graph landmarks.
//!
//! For every segment the mapper
//! 1. recovers the plane from the segment's last point and moves it to the map frame
//! 2. classifies it by orientation
//! 3. associates it with a registered plane or creates a new plane node
//! 4. adds the observation edge (plane-coefficient or point-to-plane)
//! 5. for new planes, adds parallel/perpendicular regularization edges

use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SlamError};
use crate::geometry::{Plane3D, SE3};
use crate::graph::{NodeId, PoseGraph};
use crate::keyframe::PlaneSegment;

use super::association::{associate_plane, AssociationConfig};
use super::class::{ClassificationMode, PlaneClass};
use super::registry::PlaneLandmark;

/// Kernel attached to every plane edge.
const PLANE_EDGE_KERNEL: &str = "Huber";
const PLANE_EDGE_KERNEL_SIZE: f64 = 1.0;

/// Points farther than this from the detected plane are dropped in
/// point-to-plane mode.
const POINT_TO_PLANE_MAX_DIST: f64 = 0.1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaneMapperConfig {
    /// Use point-to-plane edges instead of plane-coefficient edges.
    pub use_point_to_plane: bool,
    /// Diagonal information of plane-coefficient edges.
    pub plane_information: f64,
    pub point_to_plane_information: f64,
    /// Segments with fewer points are ignored.
    pub min_plane_points: usize,
    pub classification: ClassificationMode,
    pub association: AssociationConfig,
    pub use_parallel_plane_constraint: bool,
    pub use_perpendicular_plane_constraint: bool,
    /// Information of parallel/perpendicular edges.
    pub regularization_information: f64,
}

impl Default for PlaneMapperConfig {
    fn default() -> Self {
        Self {
            use_point_to_plane: false,
            plane_information: 0.1,
            point_to_plane_information: 0.001,
            min_plane_points: 100,
            classification: ClassificationMode::default(),
            association: AssociationConfig::default(),
            use_parallel_plane_constraint: true,
            use_perpendicular_plane_constraint: true,
            regularization_information: 0.001,
        }
    }
}

/// A segment that was mapped to a plane landmark during this flush.
#[derive(Debug, Clone)]
pub struct ObservedPlane {
    pub plane_id: NodeId,
    pub class: PlaneClass,
    /// Detected plane in the map frame.
    pub map_plane: Plane3D,
    /// Support points in the keyframe body frame (after any filtering).
    pub points_body: Vec<Vector3<f64>>,
    pub keyframe_node: NodeId,
    pub keyframe_pose: SE3,
    pub is_new: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PlaneMapper {
    config: PlaneMapperConfig,
}

impl PlaneMapper {
    pub fn new(config: PlaneMapperConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlaneMapperConfig {
        &self.config
    }

    /// Map every segment seen from `keyframe_node`.
    ///
    /// Segments that are too small or fit no orientation class are skipped.
    pub fn map_extracted_planes(
        &self,
        graph: &mut PoseGraph,
        keyframe_node: NodeId,
        segments: &[PlaneSegment],
    ) -> Result<Vec<ObservedPlane>> {
        let mut observed = Vec::new();
        for segment in segments {
            if segment.len() < self.config.min_plane_points {
                continue;
            }
            if let Some(plane) = self.add_plane_to_graph(graph, keyframe_node, segment)? {
                observed.push(plane);
            }
        }
        Ok(observed)
    }

    fn add_plane_to_graph(
        &self,
        graph: &mut PoseGraph,
        keyframe_node: NodeId,
        segment: &PlaneSegment,
    ) -> Result<Option<ObservedPlane>> {
        let Some(coeffs) = segment.coefficients() else {
            return Ok(None);
        };
        let keyframe_pose = graph
            .pose(keyframe_node)
            .ok_or(SlamError::UnknownNode(keyframe_node))?;

        let det_body = Plane3D::new(coeffs);
        let det_map = det_body.transform(&keyframe_pose);
        let Some(class) = self.config.classification.classify(&det_map.normal()) else {
            debug!("Plane {:?} fits no orientation class", det_map.coeffs());
            return Ok(None);
        };

        let mut points_body = segment.positions();
        let points_outer = if self.config.use_point_to_plane {
            filter_point_to_plane(&mut points_body, &det_map, &keyframe_pose)
        } else {
            Matrix4::zeros()
        };
        let segment_map: Vec<Vector3<f64>> = points_body
            .iter()
            .map(|p| keyframe_pose.transform_point(p))
            .collect();

        let matched = associate_plane(
            graph,
            class,
            &keyframe_pose,
            &det_body,
            &segment_map,
            &self.config.association,
        );

        let (plane_id, is_new) = match matched {
            Some(id) => {
                debug!("Matched {} plane {} from {}", class, id, keyframe_node);
                (id, false)
            }
            None => {
                let id = graph.add_plane_node(det_map);
                let color = rand::thread_rng().gen::<[u8; 3]>();
                graph
                    .planes_mut()
                    .insert(PlaneLandmark::new(id, class, color));
                info!("Added {} plane {} with coeffs {:?}", class, id, det_map.coeffs());
                (id, true)
            }
        };

        if let Some(landmark) = graph.planes_mut().get_mut(plane_id) {
            landmark.add_observation(keyframe_node, points_body.clone());
        }

        let edge = if self.config.use_point_to_plane {
            graph.add_se3_point_to_plane_edge(
                keyframe_node,
                plane_id,
                points_outer,
                self.config.point_to_plane_information,
            )?
        } else {
            graph.add_se3_plane_edge(
                keyframe_node,
                plane_id,
                det_body,
                Matrix3::identity() * self.config.plane_information,
            )?
        };
        graph.add_robust_kernel(edge, PLANE_EDGE_KERNEL, PLANE_EDGE_KERNEL_SIZE)?;

        if is_new {
            self.add_regularization_edges(graph, plane_id, class)?;
        }

        Ok(Some(ObservedPlane {
            plane_id,
            class,
            map_plane: det_map,
            points_body,
            keyframe_node,
            keyframe_pose,
            is_new,
        }))
    }

    /// Parallel edges to same-class planes and perpendicular edges to planes
    /// of the other classes.
    fn add_regularization_edges(
        &self,
        graph: &mut PoseGraph,
        plane_id: NodeId,
        class: PlaneClass,
    ) -> Result<()> {
        let info = self.config.regularization_information;
        let others: Vec<(NodeId, PlaneClass)> = graph
            .planes()
            .iter()
            .filter(|p| p.id != plane_id)
            .map(|p| (p.id, p.class))
            .collect();

        for (other, other_class) in others {
            let edge = if other_class == class {
                if !self.config.use_parallel_plane_constraint {
                    continue;
                }
                graph.add_plane_parallel_edge(other, plane_id, info)?
            } else {
                if !self.config.use_perpendicular_plane_constraint {
                    continue;
                }
                graph.add_plane_perpendicular_edge(other, plane_id, info)?
            };
            graph.add_robust_kernel(edge, PLANE_EDGE_KERNEL, PLANE_EDGE_KERNEL_SIZE)?;
        }
        Ok(())
    }
}

/// Keep only body points within [`POINT_TO_PLANE_MAX_DIST`] of the map-frame
/// plane and return `Σ p pᵀ` over the survivors (homogeneous coordinates).
pub fn filter_point_to_plane(
    points_body: &mut Vec<Vector3<f64>>,
    plane_map: &Plane3D,
    keyframe_pose: &SE3,
) -> Matrix4<f64> {
    let mut outer = Matrix4::zeros();
    points_body.retain(|p| {
        let d = plane_map.signed_distance(&keyframe_pose.transform_point(p));
        if d.abs() < POINT_TO_PLANE_MAX_DIST {
            let h = Vector4::new(p.x, p.y, p.z, 1.0);
            outer += h * h.transpose();
            true
        } else {
            false
        }
    });
    outer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyframe::SegmentedPoint;
    use approx::assert_relative_eq;

    /// A 15 × 10 grid on the body-frame plane `n·p + d = 0` spanned by `u`, `v`.
    fn segment(normal: Vector3<f64>, d: f64, u: Vector3<f64>, v: Vector3<f64>) -> PlaneSegment {
        let origin = -normal * d;
        let mut points = Vec::new();
        for i in 0..15 {
            for j in 0..10 {
                points.push(SegmentedPoint {
                    position: origin + u * (i as f64 * 0.2) + v * (j as f64 * 0.2),
                    normal,
                    curvature: d,
                });
            }
        }
        PlaneSegment { points }
    }

    fn x_wall(d: f64) -> PlaneSegment {
        segment(Vector3::x(), d, Vector3::y(), Vector3::z())
    }

    #[test]
    fn test_new_plane_creates_node_and_edge() {
        let mut graph = PoseGraph::new();
        let kf = graph.add_se3_node(SE3::identity());
        let mapper = PlaneMapper::default();

        let observed = mapper.map_extracted_planes(&mut graph, kf, &[x_wall(-2.0)]).unwrap();

        assert_eq!(observed.len(), 1);
        assert!(observed[0].is_new);
        assert_eq!(observed[0].class, PlaneClass::X);
        assert_eq!(graph.planes().len(), 1);
        assert_eq!(graph.num_edges(), 1);
        let landmark = graph.planes().get(observed[0].plane_id).unwrap();
        assert_eq!(landmark.num_points(), 150);
        assert_eq!(landmark.covariance, Matrix3::identity());
    }

    #[test]
    fn test_reobservation_resolves_to_same_plane() {
        let mut graph = PoseGraph::new();
        let kf1 = graph.add_se3_node(SE3::identity());
        let kf2 = graph.add_se3_node(SE3::from_translation(Vector3::new(0.5, 0.0, 0.0)));
        let mapper = PlaneMapper::default();

        let first = mapper.map_extracted_planes(&mut graph, kf1, &[x_wall(-2.0)]).unwrap();
        let second = mapper.map_extracted_planes(&mut graph, kf2, &[x_wall(-1.5)]).unwrap();

        assert_eq!(first[0].plane_id, second[0].plane_id);
        assert!(!second[0].is_new);
        assert_eq!(graph.planes().len(), 1);
        assert_eq!(graph.planes().get(first[0].plane_id).unwrap().observations.len(), 2);
    }

    #[test]
    fn test_small_segment_is_skipped() {
        let mut graph = PoseGraph::new();
        let kf = graph.add_se3_node(SE3::identity());
        let mut small = x_wall(-2.0);
        small.points.truncate(50);

        let observed = PlaneMapper::default()
            .map_extracted_planes(&mut graph, kf, &[small])
            .unwrap();
        assert!(observed.is_empty());
        assert_eq!(graph.num_nodes(), 1);
    }

    #[test]
    fn test_new_planes_get_regularization_edges() {
        let mut graph = PoseGraph::new();
        let kf = graph.add_se3_node(SE3::identity());
        let mapper = PlaneMapper::default();
        let y_wall = segment(Vector3::y(), -3.0, Vector3::x(), Vector3::z());
        let far_x_wall = x_wall(4.0);

        mapper
            .map_extracted_planes(&mut graph, kf, &[x_wall(-2.0), y_wall, far_x_wall])
            .unwrap();

        assert_eq!(graph.planes().len(), 3);
        // 3 observations, 1 perpendicular (y to x), 1 perpendicular + 1 parallel (x2)
        assert_eq!(graph.num_edges(), 6);
    }

    #[test]
    fn test_point_to_plane_filters_outliers() {
        let plane = Plane3D::new(Vector4::new(1.0, 0.0, 0.0, -2.0));
        let mut points = vec![
            Vector3::new(2.0, 0.0, 0.0),
            Vector3::new(2.05, 1.0, 0.0),
            Vector3::new(2.5, 0.0, 1.0),
        ];
        let outer = filter_point_to_plane(&mut points, &plane, &SE3::identity());
        assert_eq!(points.len(), 2);
        assert_relative_eq!(outer[(3, 3)], 2.0);
        assert_relative_eq!(outer[(0, 3)], 4.05, epsilon = 1e-12);
    }
}

//! Room inference: one opposing wall pair on each horizontal axis.

use nalgebra::{Matrix2, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SlamError};
use crate::graph::{NodeId, PoseGraph};
use crate::planes::{structure_plane_measurement, PlaneClass};

use super::candidates::{offset_midpoint, pair_candidates, PlaneCandidate, StructurePair};
use super::Room;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    pub use_room_constraint: bool,
    pub room_plane_length_diff_threshold: f64,
    pub room_dist_threshold: f64,
    pub room_min_plane_length: f64,
    pub room_max_plane_length: f64,
    pub room_min_width: f64,
    /// Largest accepted difference between the x and y widths.
    pub room_width_tolerance: f64,
    pub room_information: f64,
    pub room_kernel: String,
    pub room_kernel_size: f64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            use_room_constraint: false,
            room_plane_length_diff_threshold: 0.3,
            room_dist_threshold: 1.0,
            room_min_plane_length: 3.0,
            room_max_plane_length: 6.0,
            room_min_width: 2.5,
            room_width_tolerance: 2.5,
            room_information: 0.01,
            room_kernel: "Huber".to_string(),
            room_kernel_size: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoomMapper {
    config: RoomConfig,
}

impl RoomMapper {
    pub fn new(config: RoomConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn sort_rooms(&self, candidates: &[PlaneCandidate]) -> Vec<StructurePair> {
        let c = &self.config;
        pair_candidates(candidates, |width, length_diff| {
            width > c.room_min_width && length_diff < c.room_plane_length_diff_threshold
        })
    }

    /// The x/y pair combination with the closest widths, within tolerance.
    pub fn refine_rooms<'a>(
        &self,
        x_pairs: &'a [StructurePair],
        y_pairs: &'a [StructurePair],
    ) -> Option<(&'a StructurePair, &'a StructurePair)> {
        x_pairs
            .iter()
            .flat_map(|x| y_pairs.iter().map(move |y| (x, y)))
            .map(|(x, y)| (x, y, (x.width - y.width).abs()))
            .filter(|(_, _, diff)| *diff < self.config.room_width_tolerance)
            .min_by(|a, b| a.2.total_cmp(&b.2))
            .map(|(x, y, _)| (x, y))
    }

    /// Pair, associate and link a room from this flush's candidates.
    ///
    /// Nothing happens unless both axes yield an admissible pair.
    pub fn map_rooms(
        &self,
        graph: &mut PoseGraph,
        x_candidates: &[PlaneCandidate],
        y_candidates: &[PlaneCandidate],
    ) -> Result<Option<NodeId>> {
        let x_pairs = self.sort_rooms(x_candidates);
        let y_pairs = self.sort_rooms(y_candidates);
        let Some((x_pair, y_pair)) = self.refine_rooms(&x_pairs, &y_pairs) else {
            debug!(
                "No room from {} x and {} y pairs",
                x_pairs.len(),
                y_pairs.len()
            );
            return Ok(None);
        };

        let pose = room_pose(x_pair, y_pair);
        let id = match self.associate_room(graph, &pose) {
            Some(id) => {
                debug!("Matched room {} at ({:.3}, {:.3})", id, pose.x, pose.y);
                id
            }
            None => {
                let id = graph.add_room_node(pose);
                graph.add_room(Room {
                    id,
                    x_planes: [x_pair.plane1.plane_id, x_pair.plane2.plane_id],
                    y_planes: [y_pair.plane1.plane_id, y_pair.plane2.plane_id],
                });
                info!(
                    "New room {} at ({:.2}, {:.2}), {:.2} x {:.2}",
                    id, pose.x, pose.y, x_pair.width, y_pair.width
                );
                id
            }
        };

        self.add_room_edges(graph, id, &pose, x_pair, y_pair)?;
        Ok(Some(id))
    }

    /// Closest room within the distance threshold.
    pub fn associate_room(&self, graph: &PoseGraph, pose: &Vector2<f64>) -> Option<NodeId> {
        graph
            .rooms()
            .iter()
            .filter_map(|r| Some((r.id, (graph.room_pose(r.id)? - pose).norm())))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .filter(|(_, dist)| *dist < self.config.room_dist_threshold)
            .map(|(id, _)| id)
    }

    fn add_room_edges(
        &self,
        graph: &mut PoseGraph,
        room: NodeId,
        pose: &Vector2<f64>,
        x_pair: &StructurePair,
        y_pair: &StructurePair,
    ) -> Result<()> {
        let c = &self.config;
        let keyframe = x_pair.plane1.keyframe_node;
        let kf_pose = graph.pose(keyframe).ok_or(SlamError::UnknownNode(keyframe))?;
        let estimate = graph.room_pose(room).ok_or(SlamError::UnknownNode(room))?;

        let local = kf_pose
            .inverse()
            .transform_point(&Vector3::new(estimate.x, estimate.y, 0.0))
            .xy();
        let edge = graph.add_se3_room_edge(
            keyframe,
            room,
            local,
            Matrix2::identity() * c.room_information,
        )?;
        graph.add_robust_kernel(edge, &c.room_kernel, c.room_kernel_size)?;

        for (axis, pair) in [(PlaneClass::X, x_pair), (PlaneClass::Y, y_pair)] {
            let coordinate = pose[axis.axis_index()];
            for plane in [&pair.plane1, &pair.plane2] {
                let measurement = structure_plane_measurement(coordinate, plane.offset());
                let edge = graph.add_room_plane_edge(
                    room,
                    plane.plane_id,
                    axis,
                    measurement,
                    c.room_information,
                )?;
                graph.add_robust_kernel(edge, &c.room_kernel, c.room_kernel_size)?;
            }
        }
        Ok(())
    }
}

/// Room centre from one pair per axis; offsets are negated into map
/// coordinates.
pub fn room_pose(x_pair: &StructurePair, y_pair: &StructurePair) -> Vector2<f64> {
    Vector2::new(
        -offset_midpoint(x_pair.plane1.offset(), x_pair.plane2.offset()),
        -offset_midpoint(y_pair.plane1.offset(), y_pair.plane2.offset()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Plane3D, SE3};
    use crate::structures::candidates::tests::candidate;
    use approx::assert_relative_eq;
    use nalgebra::Vector4;

    fn walls() -> [Vector4<f64>; 4] {
        [
            Vector4::new(1.0, 0.0, 0.0, 1.0),
            Vector4::new(-1.0, 0.0, 0.0, 2.0),
            Vector4::new(0.0, 1.0, 0.0, 1.0),
            Vector4::new(0.0, -1.0, 0.0, 3.0),
        ]
    }

    fn setup() -> (PoseGraph, Vec<PlaneCandidate>, Vec<PlaneCandidate>) {
        let mut graph = PoseGraph::new();
        graph.add_se3_node(SE3::from_translation(Vector3::new(0.3, 0.4, 0.0)));
        for coeffs in walls() {
            graph.add_plane_node(Plane3D::new(coeffs));
        }
        let [x1, x2, y1, y2] = walls();
        let xs = vec![
            candidate(1, PlaneClass::X, x1, 4.0),
            candidate(2, PlaneClass::X, x2, 4.1),
        ];
        let ys = vec![
            candidate(3, PlaneClass::Y, y1, 4.0),
            candidate(4, PlaneClass::Y, y2, 4.0),
        ];
        (graph, xs, ys)
    }

    #[test]
    fn test_room_from_both_axes() {
        let (mut graph, xs, ys) = setup();
        let mapper = RoomMapper::default();

        let id = mapper.map_rooms(&mut graph, &xs, &ys).unwrap().unwrap();

        // walls at x = -1, 2 and y = -1, 3
        assert_relative_eq!(graph.room_pose(id).unwrap(), Vector2::new(0.5, 1.0), epsilon = 1e-12);
        assert_eq!(graph.rooms().len(), 1);
        assert_eq!(graph.rooms()[0].x_planes, [NodeId::new(1), NodeId::new(2)]);
        assert_eq!(graph.num_edges(), 5);

        let se3_room = graph.edges().find(|e| e.kind.name() == "se3_room").unwrap();
        assert_eq!(se3_room.nodes, vec![NodeId::new(0), id]);
    }

    #[test]
    fn test_single_axis_gives_no_room() {
        let (mut graph, xs, _) = setup();
        let result = RoomMapper::default().map_rooms(&mut graph, &xs, &[]).unwrap();
        assert!(result.is_none());
        assert!(graph.rooms().is_empty());
        assert_eq!(graph.num_edges(), 0);
    }

    #[test]
    fn test_mismatched_widths_give_no_room() {
        let (mut graph, xs, _) = setup();
        // 7 m wide against 3 m
        let y1 = Vector4::new(0.0, 1.0, 0.0, 1.0);
        let y2 = Vector4::new(0.0, -1.0, 0.0, 6.0);
        let ys = vec![
            candidate(3, PlaneClass::Y, y1, 4.0),
            candidate(4, PlaneClass::Y, y2, 4.0),
        ];
        let result = RoomMapper::default().map_rooms(&mut graph, &xs, &ys).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_nearby_room_is_reused() {
        let (mut graph, xs, ys) = setup();
        let mapper = RoomMapper::default();
        let first = mapper.map_rooms(&mut graph, &xs, &ys).unwrap();
        let second = mapper.map_rooms(&mut graph, &xs, &ys).unwrap();
        assert_eq!(first, second);
        assert_eq!(graph.rooms().len(), 1);
        assert_eq!(graph.num_edges(), 10);
    }
}

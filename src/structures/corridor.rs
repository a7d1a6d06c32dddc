//! Corridor inference from pairs of opposing walls on one axis.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SlamError};
use crate::graph::{NodeId, PoseGraph};
use crate::planes::{structure_plane_measurement, PlaneClass};

use super::candidates::{offset_midpoint, pair_candidates, PlaneCandidate, StructurePair};
use super::Corridor;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorridorConfig {
    pub use_corridor_constraint: bool,
    pub corridor_dist_threshold: f64,
    pub corridor_min_plane_length: f64,
    pub corridor_min_width: f64,
    pub corridor_max_width: f64,
    pub corridor_plane_length_diff_threshold: f64,
    pub corridor_information: f64,
    pub corridor_kernel: String,
    pub corridor_kernel_size: f64,
}

impl Default for CorridorConfig {
    fn default() -> Self {
        Self {
            use_corridor_constraint: false,
            corridor_dist_threshold: 1.0,
            corridor_min_plane_length: 10.0,
            corridor_min_width: 1.5,
            corridor_max_width: 2.5,
            corridor_plane_length_diff_threshold: 0.3,
            corridor_information: 0.01,
            corridor_kernel: "Huber".to_string(),
            corridor_kernel_size: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CorridorMapper {
    config: CorridorConfig,
}

impl CorridorMapper {
    pub fn new(config: CorridorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CorridorConfig {
        &self.config
    }

    /// Opposing pairs whose gap lies strictly inside the width band.
    pub fn sort_corridors(&self, candidates: &[PlaneCandidate]) -> Vec<StructurePair> {
        let c = &self.config;
        pair_candidates(candidates, |width, length_diff| {
            width > c.corridor_min_width
                && width < c.corridor_max_width
                && length_diff < c.corridor_plane_length_diff_threshold
        })
    }

    /// Run pairing, association and edge creation for one axis.
    ///
    /// Returns the corridor node that received edges, if any pair survived.
    pub fn map_corridors(
        &self,
        graph: &mut PoseGraph,
        axis: PlaneClass,
        candidates: &[PlaneCandidate],
    ) -> Result<Option<NodeId>> {
        let pairs = self.sort_corridors(candidates);
        let Some(pair) = refine_corridors(&pairs) else {
            return Ok(None);
        };

        let coordinate = offset_midpoint(pair.plane1.offset(), pair.plane2.offset());
        let id = match self.associate_corridor(graph, axis, coordinate) {
            Some(id) => {
                debug!("Matched {} corridor {} at {:.3}", axis, id, coordinate);
                id
            }
            None => {
                let pose = corridor_pose(axis, coordinate, &pair.plane1.keyframe_translation);
                let id = graph.add_corridor_node(pose);
                graph.add_corridor(Corridor {
                    id,
                    axis,
                    plane1: pair.plane1.plane_id,
                    plane2: pair.plane2.plane_id,
                });
                info!(
                    "New {} corridor {} between planes {} and {} (width {:.2})",
                    axis, id, pair.plane1.plane_id, pair.plane2.plane_id, pair.width
                );
                id
            }
        };

        self.add_corridor_edges(graph, axis, id, pair)?;
        Ok(Some(id))
    }

    /// Closest corridor on `axis` within the distance threshold.
    pub fn associate_corridor(
        &self,
        graph: &PoseGraph,
        axis: PlaneClass,
        coordinate: f64,
    ) -> Option<NodeId> {
        let index = axis.axis_index();
        graph
            .corridors()
            .iter()
            .filter(|c| c.axis == axis)
            .filter_map(|c| {
                let pose = graph.corridor_pose(c.id)?;
                Some((c.id, (pose[index] - coordinate).abs()))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .filter(|(_, dist)| *dist < self.config.corridor_dist_threshold)
            .map(|(id, _)| id)
    }

    fn add_corridor_edges(
        &self,
        graph: &mut PoseGraph,
        axis: PlaneClass,
        corridor: NodeId,
        pair: &StructurePair,
    ) -> Result<()> {
        let c = &self.config;
        let keyframe = pair.plane1.keyframe_node;
        let kf_pose = graph.pose(keyframe).ok_or(SlamError::UnknownNode(keyframe))?;
        let estimate = graph
            .corridor_pose(corridor)
            .ok_or(SlamError::UnknownNode(corridor))?;

        let local = kf_pose.inverse().transform_point(&estimate);
        let edge = graph.add_se3_corridor_edge(
            keyframe,
            corridor,
            local,
            Matrix3::identity() * c.corridor_information,
        )?;
        graph.add_robust_kernel(edge, &c.corridor_kernel, c.corridor_kernel_size)?;

        for plane in [&pair.plane1, &pair.plane2] {
            let measurement = structure_plane_measurement(estimate[axis.axis_index()], plane.offset());
            let edge = graph.add_corridor_plane_edge(
                corridor,
                plane.plane_id,
                axis,
                measurement,
                c.corridor_information,
            )?;
            graph.add_robust_kernel(edge, &c.corridor_kernel, c.corridor_kernel_size)?;
        }
        Ok(())
    }
}

/// Pair with the most similar wall lengths.
pub fn refine_corridors(pairs: &[StructurePair]) -> Option<&StructurePair> {
    pairs.iter().min_by(|a, b| a.length_diff.total_cmp(&b.length_diff))
}

/// Corridor position: `coordinate` across the corridor, the keyframe's
/// translation along it.
pub fn corridor_pose(axis: PlaneClass, coordinate: f64, keyframe: &Vector3<f64>) -> Vector3<f64> {
    match axis {
        PlaneClass::X => Vector3::new(coordinate, keyframe.y, keyframe.z),
        _ => Vector3::new(keyframe.x, coordinate, keyframe.z),
    }
}

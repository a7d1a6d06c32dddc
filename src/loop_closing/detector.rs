//! Distance-gated loop detection verified by scan registration.
//!
//! A new keyframe is compared against committed keyframes that are close in
//! space but far apart along the trajectory. Each candidate is registered
//! against the new keyframe's cloud, and the best fitness below the
//! threshold becomes a loop edge.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::geometry::SE3;
use crate::graph::{KeyframeId, NodeId, PoseGraph};
use crate::keyframe::Keyframe;

use super::registration::ScanRegistration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectorConfig {
    /// Largest distance between estimated positions of a candidate pair.
    pub distance_thresh: f64,
    /// Smallest accumulated-travel gap between a candidate pair.
    pub accum_distance_thresh: f64,
    /// Travel required since the last accepted loop edge.
    pub distance_from_last_edge_thresh: f64,
    pub fitness_score_thresh: f64,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            distance_thresh: 5.0,
            accum_distance_thresh: 8.0,
            distance_from_last_edge_thresh: 5.0,
            fitness_score_thresh: 0.5,
        }
    }
}

/// An accepted loop between a new keyframe and an older one.
#[derive(Debug, Clone)]
pub struct LoopCandidate {
    pub new_keyframe: KeyframeId,
    pub new_node: NodeId,
    pub old_keyframe: KeyframeId,
    pub old_node: NodeId,
    /// `new⁻¹ · old` as refined by registration.
    pub relative_pose: SE3,
    pub fitness: f64,
}

/// Finds loop closures among keyframes.
pub trait LoopDetector: Send {
    /// Check every keyframe of `new` against `committed`.
    fn detect(
        &mut self,
        committed: &[Keyframe],
        new: &[Keyframe],
        graph: &PoseGraph,
    ) -> Vec<LoopCandidate>;
}

pub struct DistanceLoopDetector<R: ScanRegistration> {
    config: LoopDetectorConfig,
    registration: R,
    last_edge_accum_distance: f64,
}

impl<R: ScanRegistration> DistanceLoopDetector<R> {
    pub fn new(config: LoopDetectorConfig, registration: R) -> Self {
        Self {
            config,
            registration,
            last_edge_accum_distance: 0.0,
        }
    }

    /// Committed keyframes that may close a loop with `new`.
    fn find_candidates<'a>(
        &self,
        committed: &'a [Keyframe],
        new: &Keyframe,
        new_pose: &SE3,
        graph: &PoseGraph,
    ) -> Vec<(&'a Keyframe, SE3)> {
        if new.accum_distance - self.last_edge_accum_distance
            < self.config.distance_from_last_edge_thresh
        {
            return Vec::new();
        }

        committed
            .iter()
            .filter(|k| new.accum_distance - k.accum_distance >= self.config.accum_distance_thresh)
            .filter_map(|k| Some((k, k.estimate(graph)?)))
            .filter(|(_, pose)| {
                (pose.translation - new_pose.translation).norm() <= self.config.distance_thresh
            })
            .collect()
    }

    fn match_candidates(
        &mut self,
        new: &Keyframe,
        new_node: NodeId,
        new_pose: &SE3,
        candidates: &[(&Keyframe, SE3)],
    ) -> Option<LoopCandidate> {
        let mut best: Option<(&Keyframe, SE3, f64)> = None;
        for (candidate, pose) in candidates {
            let guess = new_pose.inverse().compose(pose);
            let Some(result) = self.registration.align(&new.cloud, &candidate.cloud, &guess) else {
                continue;
            };
            if !result.converged {
                continue;
            }
            if best.as_ref().map_or(true, |(_, _, f)| result.fitness < *f) {
                best = Some((*candidate, result.transform, result.fitness));
            }
        }

        let (old, relative_pose, fitness) = best?;
        if fitness > self.config.fitness_score_thresh {
            debug!(
                "Loop rejected for keyframe {}: best fitness {:.3}",
                new.id, fitness
            );
            return None;
        }

        let old_node = old.node?;
        info!(
            "Loop found between keyframes {} and {} (fitness {:.3})",
            new.id, old.id, fitness
        );
        self.last_edge_accum_distance = new.accum_distance;
        Some(LoopCandidate {
            new_keyframe: new.id,
            new_node,
            old_keyframe: old.id,
            old_node,
            relative_pose,
            fitness,
        })
    }
}

impl<R: ScanRegistration> LoopDetector for DistanceLoopDetector<R> {
    fn detect(
        &mut self,
        committed: &[Keyframe],
        new: &[Keyframe],
        graph: &PoseGraph,
    ) -> Vec<LoopCandidate> {
        let mut loops = Vec::new();
        for keyframe in new {
            let (Some(node), Some(pose)) = (keyframe.node, keyframe.estimate(graph)) else {
                continue;
            };
            let candidates = self.find_candidates(committed, keyframe, &pose, graph);
            if candidates.is_empty() {
                continue;
            }
            if let Some(found) = self.match_candidates(keyframe, node, &pose, &candidates) {
                loops.push(found);
            }
        }
        loops
    }
}

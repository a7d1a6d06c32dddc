//! Plane registry: map planes grouped by orientation class.
//!
//! Entries are keyed by the id of the plane node that owns their estimate.
//! The plane coefficients themselves live only in the graph, so a registry
//! entry never goes stale after optimization.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::graph::{NodeId, PoseGraph};

use super::class::PlaneClass;

/// Points of one plane segment seen from one keyframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaneObservation {
    pub keyframe_node: NodeId,
    pub points_body: Vec<Vector3<f64>>,
}

/// A map plane and its accumulated support.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaneLandmark {
    pub id: NodeId,
    pub class: PlaneClass,
    pub observations: Vec<PlaneObservation>,
    /// Marginal covariance on the plane manifold, refreshed after optimization.
    pub covariance: Matrix3<f64>,
    pub color: [u8; 3],
}

impl PlaneLandmark {
    pub fn new(id: NodeId, class: PlaneClass, color: [u8; 3]) -> Self {
        Self {
            id,
            class,
            observations: Vec::new(),
            covariance: Matrix3::identity(),
            color,
        }
    }

    pub fn add_observation(&mut self, keyframe_node: NodeId, points_body: Vec<Vector3<f64>>) {
        self.observations.push(PlaneObservation {
            keyframe_node,
            points_body,
        });
    }

    /// Support points in the map frame under the current keyframe estimates.
    pub fn map_points(&self, graph: &PoseGraph) -> Vec<Vector3<f64>> {
        let mut points = Vec::new();
        for obs in &self.observations {
            let Some(pose) = graph.pose(obs.keyframe_node) else {
                continue;
            };
            points.extend(obs.points_body.iter().map(|p| pose.transform_point(p)));
        }
        points
    }

    pub fn num_points(&self) -> usize {
        self.observations.iter().map(|o| o.points_body.len()).sum()
    }
}

/// X, Y and horizontal plane collections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaneRegistry {
    x_planes: Vec<PlaneLandmark>,
    y_planes: Vec<PlaneLandmark>,
    horizontal_planes: Vec<PlaneLandmark>,
}

impl PlaneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_class(&self, class: PlaneClass) -> &[PlaneLandmark] {
        match class {
            PlaneClass::X => &self.x_planes,
            PlaneClass::Y => &self.y_planes,
            PlaneClass::Horizontal => &self.horizontal_planes,
        }
    }

    fn of_class_mut(&mut self, class: PlaneClass) -> &mut Vec<PlaneLandmark> {
        match class {
            PlaneClass::X => &mut self.x_planes,
            PlaneClass::Y => &mut self.y_planes,
            PlaneClass::Horizontal => &mut self.horizontal_planes,
        }
    }

    pub fn insert(&mut self, landmark: PlaneLandmark) {
        self.of_class_mut(landmark.class).push(landmark);
    }

    pub fn get(&self, id: NodeId) -> Option<&PlaneLandmark> {
        self.iter().find(|p| p.id == id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut PlaneLandmark> {
        self.iter_mut().find(|p| p.id == id)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<PlaneLandmark> {
        for class in [PlaneClass::X, PlaneClass::Y, PlaneClass::Horizontal] {
            let planes = self.of_class_mut(class);
            if let Some(pos) = planes.iter().position(|p| p.id == id) {
                return Some(planes.remove(pos));
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlaneLandmark> {
        self.x_planes
            .iter()
            .chain(self.y_planes.iter())
            .chain(self.horizontal_planes.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PlaneLandmark> {
        self.x_planes
            .iter_mut()
            .chain(self.y_planes.iter_mut())
            .chain(self.horizontal_planes.iter_mut())
    }

    pub fn len(&self) -> usize {
        self.x_planes.len() + self.y_planes.len() + self.horizontal_planes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

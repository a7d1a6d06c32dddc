//! Data association of detected planes against the registry.
//!
//! A detection is compared with every registered plane of the same class in
//! the observing keyframe's frame:
//!
//! ```text
//! π_local = T_kf⁻¹ · π_map
//! e       = π_local ⊟ π_detected
//! d_M     = sqrt(eᵀ Σ⁻¹ e)
//! ```
//!
//! The closest plane under the threshold wins. Vertical planes additionally
//! need spatial overlap between the detected segment and the plane's
//! accumulated support, otherwise two coplanar walls far apart would merge.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::{Plane3D, SE3};
use crate::graph::{NodeId, PoseGraph};

use super::class::PlaneClass;

/// Upper bound a match distance is compared against before any threshold.
const INITIAL_MIN_DISTANCE: f64 = 100.0;

/// Association thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    /// Maximum Mahalanobis distance for a match.
    pub plane_dist_threshold: f64,
    /// Support points that must have a detected neighbour.
    pub min_neighbour_points: usize,
    /// Squared neighbourhood radius for the overlap test.
    pub neighbour_sq_dist: f64,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            plane_dist_threshold: 0.15,
            min_neighbour_points: 100,
            neighbour_sq_dist: 0.5,
        }
    }
}

/// Covariance-weighted norm of a plane-manifold error.
///
/// Falls back to the Euclidean norm when the covariance cannot be inverted or
/// the weighted distance is NaN or vanishing. The fallback is not stored.
pub fn mahalanobis_distance(error: &Vector3<f64>, covariance: &Matrix3<f64>) -> f64 {
    let weighted = covariance
        .try_inverse()
        .map(|inv| (error.transpose() * inv * error)[(0, 0)].sqrt())
        .unwrap_or(f64::NAN);
    if weighted.is_nan() || weighted < 1e-3 {
        error.norm()
    } else {
        weighted
    }
}

/// True when more than `min_points` support points have a detected point
/// within the squared radius.
pub fn has_point_neighbours(
    support: &[Vector3<f64>],
    detected: &[Vector3<f64>],
    sq_dist: f64,
    min_points: usize,
) -> bool {
    let mut count = 0;
    for p in support {
        if detected.iter().any(|q| (p - q).norm_squared() < sq_dist) {
            count += 1;
            if count > min_points {
                return true;
            }
        }
    }
    false
}

/// Find the registered plane matching a detection, if any.
///
/// `detected_body` is the plane in the keyframe frame, `segment_map` its
/// points already transformed into the map frame.
pub fn associate_plane(
    graph: &PoseGraph,
    class: PlaneClass,
    keyframe_pose: &SE3,
    detected_body: &Plane3D,
    segment_map: &[Vector3<f64>],
    config: &AssociationConfig,
) -> Option<NodeId> {
    let map_to_body = keyframe_pose.inverse();

    let mut best: Option<NodeId> = None;
    let mut min_distance = INITIAL_MIN_DISTANCE;
    for landmark in graph.planes().of_class(class) {
        let Some(map_plane) = graph.plane(landmark.id) else {
            continue;
        };
        let error = map_plane.transform(&map_to_body).ominus(detected_body);
        let distance = mahalanobis_distance(&error, &landmark.covariance);
        debug!("{} plane {}: mahalanobis distance {:.4}", class, landmark.id, distance);
        if distance < min_distance {
            min_distance = distance;
            best = Some(landmark.id);
        }
    }

    let candidate = best.filter(|_| min_distance < config.plane_dist_threshold)?;

    if class.is_vertical() {
        let support = graph
            .planes()
            .get(candidate)
            .map(|landmark| landmark.map_points(graph))
            .unwrap_or_default();
        if !support.is_empty()
            && !has_point_neighbours(
                &support,
                segment_map,
                config.neighbour_sq_dist,
                config.min_neighbour_points,
            )
        {
            debug!("{} plane {} rejected: no spatial overlap", class, candidate);
            return None;
        }
    }

    Some(candidate)
}

//! Scan registration used to verify loop candidates.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::SE3;
use crate::keyframe::{indexed_fitness_score, PointCloud};

/// Outcome of aligning one cloud onto another.
#[derive(Debug, Clone)]
pub struct RegistrationResult {
    /// Maps source points into the target frame.
    pub transform: SE3,
    /// Mean squared nearest-neighbour distance after alignment.
    pub fitness: f64,
    pub converged: bool,
}

/// Rigid registration of two point clouds.
pub trait ScanRegistration: Send + Sync {
    /// Align `source` onto `target` starting from `guess`.
    ///
    /// Returns `None` when too few correspondences exist to estimate a pose.
    fn align(&self, target: &PointCloud, source: &PointCloud, guess: &SE3)
        -> Option<RegistrationResult>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IcpConfig {
    pub max_iterations: usize,
    /// Pairs farther apart than this are not used.
    pub max_correspondence_distance: f64,
    /// Stop once the per-iteration update moves less than this
    /// (translation norm plus rotation angle).
    pub convergence_threshold: f64,
    pub min_correspondences: usize,
    pub fitness_score_max_range: f64,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 64,
            max_correspondence_distance: 1.0,
            convergence_threshold: 1e-6,
            min_correspondences: 10,
            fitness_score_max_range: f64::MAX,
        }
    }
}

/// Point-to-point ICP with R-tree correspondences and a closed-form
/// SVD update per iteration.
#[derive(Debug, Clone, Default)]
pub struct PointToPointIcp {
    config: IcpConfig,
}

impl PointToPointIcp {
    pub fn new(config: IcpConfig) -> Self {
        Self { config }
    }
}

impl ScanRegistration for PointToPointIcp {
    fn align(
        &self,
        target: &PointCloud,
        source: &PointCloud,
        guess: &SE3,
    ) -> Option<RegistrationResult> {
        let max_sq = self.config.max_correspondence_distance.powi(2);
        let index = target.index();
        let mut current = *guess;
        let mut converged = false;

        for iteration in 0..self.config.max_iterations {
            let mut moved = Vec::with_capacity(source.len());
            let mut matched = Vec::with_capacity(source.len());
            for p in &source.points {
                let q = current.transform_point(p);
                if let Some((t, d2)) = index.nearest(&q) {
                    if d2 <= max_sq {
                        moved.push(q);
                        matched.push(*t);
                    }
                }
            }

            if moved.len() < self.config.min_correspondences {
                debug!(
                    "ICP: {} correspondences at iteration {}",
                    moved.len(),
                    iteration
                );
                return None;
            }

            let delta = rigid_alignment(&moved, &matched)?;
            current = delta.compose(&current);

            if delta.translation.norm() + delta.angle() < self.config.convergence_threshold {
                converged = true;
                break;
            }
        }

        let fitness =
            indexed_fitness_score(&index, source, &current, self.config.fitness_score_max_range);
        Some(RegistrationResult {
            transform: current,
            fitness,
            converged,
        })
    }
}

/// Least-squares rigid transform taking `from[i]` onto `to[i]`.
fn rigid_alignment(from: &[Vector3<f64>], to: &[Vector3<f64>]) -> Option<SE3> {
    if from.len() < 3 || from.len() != to.len() {
        return None;
    }

    let n = from.len() as f64;
    let c_from: Vector3<f64> = from.iter().sum::<Vector3<f64>>() / n;
    let c_to: Vector3<f64> = to.iter().sum::<Vector3<f64>>() / n;

    let mut h = Matrix3::zeros();
    for (a, b) in from.iter().zip(to) {
        h += (a - c_from) * (b - c_to).transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut r = v_t.transpose() * u.transpose();
    if r.determinant() < 0.0 {
        let mut v = v_t.transpose();
        for i in 0..3 {
            v[(i, 2)] = -v[(i, 2)];
        }
        r = v * u.transpose();
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
    let translation = c_to - rotation * c_from;
    Some(SE3::new(rotation, translation))
}

//! Information matrices for relative-pose edges.
//!
//! Registration confidence is measured by the fitness score, the mean squared
//! nearest-neighbour distance after aligning one cloud onto the other. It is
//! mapped to a variance by
//!
//! ```text
//! w(f) = w_min + (w_max - w_min) · (1 - e^{-a f}) / (1 - e^{-a f_max})
//! ```
//!
//! and the translation and rotation blocks of the identity are divided by
//! their variances.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

use super::point_cloud::{PointCloud, PointIndex};

/// Produces 6×6 information matrices for relative-pose edges.
pub trait InformationMatrixCalculator: Send + Sync {
    /// `relative_pose` maps `source` points into the frame of `target`.
    fn information_matrix(
        &self,
        target: &PointCloud,
        source: &PointCloud,
        relative_pose: &SE3,
    ) -> DMatrix<f64>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InformationConfig {
    pub use_const_inf_matrix: bool,
    pub const_stddev_x: f64,
    pub const_stddev_q: f64,
    pub var_gain_a: f64,
    pub min_stddev_x: f64,
    pub max_stddev_x: f64,
    pub min_stddev_q: f64,
    pub max_stddev_q: f64,
    pub fitness_score_thresh: f64,
    /// Correspondences farther than this (squared) are ignored.
    pub fitness_score_max_range: f64,
}

impl Default for InformationConfig {
    fn default() -> Self {
        Self {
            use_const_inf_matrix: false,
            const_stddev_x: 0.5,
            const_stddev_q: 0.1,
            var_gain_a: 20.0,
            min_stddev_x: 0.1,
            max_stddev_x: 5.0,
            min_stddev_q: 0.05,
            max_stddev_q: 0.2,
            fitness_score_thresh: 0.5,
            fitness_score_max_range: f64::MAX,
        }
    }
}

/// Constant or fitness-weighted information matrices.
#[derive(Debug, Clone, Default)]
pub struct FitnessInformationCalculator {
    config: InformationConfig,
}

impl FitnessInformationCalculator {
    pub fn new(config: InformationConfig) -> Self {
        Self { config }
    }

    /// Information matrix with fixed translation and rotation weights.
    pub fn constant(&self) -> DMatrix<f64> {
        weighted_identity(self.config.const_stddev_x, self.config.const_stddev_q)
    }

    fn weight(&self, max_x: f64, min_y: f64, max_y: f64, x: f64) -> f64 {
        let a = self.config.var_gain_a;
        let y = (1.0 - (-a * x).exp()) / (1.0 - (-a * max_x).exp());
        min_y + (max_y - min_y) * y
    }
}

impl InformationMatrixCalculator for FitnessInformationCalculator {
    fn information_matrix(
        &self,
        target: &PointCloud,
        source: &PointCloud,
        relative_pose: &SE3,
    ) -> DMatrix<f64> {
        if self.config.use_const_inf_matrix {
            return self.constant();
        }

        let fitness = fitness_score(target, source, relative_pose, self.config.fitness_score_max_range);

        let min_var_x = self.config.min_stddev_x.powi(2);
        let max_var_x = self.config.max_stddev_x.powi(2);
        let min_var_q = self.config.min_stddev_q.powi(2);
        let max_var_q = self.config.max_stddev_q.powi(2);

        let thresh = self.config.fitness_score_thresh;
        let w_x = self.weight(thresh, min_var_x, max_var_x, fitness);
        let w_q = self.weight(thresh, min_var_q, max_var_q, fitness);
        weighted_identity(w_x, w_q)
    }
}

/// Identity with the translation block divided by `w_x` and the rotation
/// block by `w_q`.
fn weighted_identity(w_x: f64, w_q: f64) -> DMatrix<f64> {
    let mut inf = DMatrix::identity(6, 6);
    for i in 0..3 {
        inf[(i, i)] /= w_x;
        inf[(i + 3, i + 3)] /= w_q;
    }
    inf
}

/// Mean squared nearest-neighbour distance of `source` mapped by `relative_pose`
/// onto `target`, ignoring pairs beyond `max_range`.
///
/// Returns `f64::MAX` when nothing is in range.
pub fn fitness_score(
    target: &PointCloud,
    source: &PointCloud,
    relative_pose: &SE3,
    max_range: f64,
) -> f64 {
    indexed_fitness_score(&target.index(), source, relative_pose, max_range)
}

/// [`fitness_score`] against an index that is already built.
pub fn indexed_fitness_score(
    target: &PointIndex<'_>,
    source: &PointCloud,
    relative_pose: &SE3,
    max_range: f64,
) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for p in &source.points {
        let q = relative_pose.transform_point(p);
        let Some(d2) = target.nearest_sq_distance(&q) else {
            continue;
        };
        if d2 <= max_range {
            sum += d2;
            count += 1;
        }
    }

    if count > 0 {
        sum / count as f64
    } else {
        f64::MAX
    }
}

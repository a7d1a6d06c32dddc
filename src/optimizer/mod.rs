//! Graph optimization.
//!
//! The pose graph is solved by a backend implementing [`GraphOptimizer`].
//! The bundled backend is a dense Levenberg-Marquardt solver over tangent-space
//! increments, with the same backend supplying marginal covariances.

pub mod levenberg;
pub mod marginals;
pub mod problem;

use std::collections::HashMap;

use nalgebra::DMatrix;

use crate::graph::{NodeId, PoseGraph};

pub use levenberg::{LevenbergMarquardtConfig, LevenbergMarquardtOptimizer};
pub use marginals::sanitize_covariance;
pub use problem::GraphProblem;

/// Outcome of one optimization call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OptimizationReport {
    pub iterations: usize,
    /// Iterations whose step lowered the cost and was kept.
    pub accepted_steps: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
}

impl OptimizationReport {
    /// True only if at least one step moved the estimates.
    pub fn succeeded(&self) -> bool {
        self.accepted_steps > 0
    }
}

/// Nonlinear least-squares backend for a [`PoseGraph`].
pub trait GraphOptimizer: Send + Sync {
    /// Optimize all non-fixed nodes in place.
    fn optimize(&self, graph: &mut PoseGraph, max_iterations: usize) -> OptimizationReport;

    /// Marginal covariance blocks of the requested nodes at the current estimate.
    fn marginal_covariances(
        &self,
        graph: &PoseGraph,
        nodes: &[NodeId],
    ) -> Option<HashMap<NodeId, DMatrix<f64>>>;
}

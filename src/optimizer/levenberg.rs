//! Levenberg-Marquardt pose graph solver.
//!
//! Three-phase pattern:
//! 1. COLLECT: snapshot free nodes and edges into a [`GraphProblem`]
//! 2. SOLVE: damped Gauss-Newton iterations on the tangent increments
//! 3. APPLY: write the optimized estimates back into the graph
//!
//! The damped system solved each iteration is
//!
//! ```text
//! (JᵀJ + λ diag(JᵀJ)) δ = -Jᵀr
//! ```
//!
//! with `λ` decreased after an accepted step and increased after a rejected one.

use std::collections::HashMap;

use levenberg_marquardt::LeastSquaresProblem;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::graph::{NodeId, PoseGraph};

use super::marginals::marginal_blocks;
use super::problem::GraphProblem;
use super::{GraphOptimizer, OptimizationReport};

/// Configuration for the LM solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LevenbergMarquardtConfig {
    /// Convergence threshold on the relative step size.
    pub param_tolerance: f64,
    /// Convergence threshold on the gradient norm.
    pub gradient_tolerance: f64,
    /// Initial damping factor.
    pub initial_lambda: f64,
    /// Stop after this many consecutive rejected steps.
    pub max_rejections: usize,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            param_tolerance: 1e-8,
            gradient_tolerance: 1e-8,
            initial_lambda: 1e-3,
            max_rejections: 10,
        }
    }
}

/// Dense LM solver over numerically differentiated residuals.
#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardtOptimizer {
    config: LevenbergMarquardtConfig,
}

impl LevenbergMarquardtOptimizer {
    pub fn new(config: LevenbergMarquardtConfig) -> Self {
        Self { config }
    }

    /// PHASE 2: iterate on `problem` in place; returns iterations performed
    /// and how many of their steps were accepted.
    fn solve(&self, problem: &mut GraphProblem, max_iterations: usize) -> (usize, usize) {
        let num_params = problem.num_params();
        let lambda_up = 10.0;
        let lambda_down = 0.1;
        let min_lambda = 1e-10;
        let max_lambda = 1e10;

        let mut lambda = self.config.initial_lambda;
        let mut rejections = 0;
        let mut iterations = 0;
        let mut accepted = 0;

        for iter in 0..max_iterations {
            iterations = iter + 1;

            let (Some(residuals), Some(jacobian)) = (problem.residuals(), problem.jacobian())
            else {
                break;
            };
            let current_params = problem.params();
            let current_error = residuals.norm_squared();

            let gradient = jacobian.transpose() * &residuals;
            let jtj = jacobian.transpose() * &jacobian;

            if gradient.norm() < self.config.gradient_tolerance {
                break;
            }

            let mut damped_jtj = jtj;
            for i in 0..num_params {
                damped_jtj[(i, i)] += lambda * damped_jtj[(i, i)].max(1e-6);
            }

            let delta: DVector<f64> = match damped_jtj.lu().solve(&(-&gradient)) {
                Some(d) => d,
                None => break,
            };

            if delta.norm()
                < self.config.param_tolerance * (current_params.norm() + self.config.param_tolerance)
            {
                break;
            }

            let trial_params = &current_params + &delta;
            let trial_error = problem.cost_at(&trial_params);

            if trial_error < current_error {
                problem.set_params(&trial_params);
                lambda = (lambda * lambda_down).max(min_lambda);
                rejections = 0;
                accepted += 1;
            } else {
                lambda = (lambda * lambda_up).min(max_lambda);
                rejections += 1;
                if rejections >= self.config.max_rejections {
                    break;
                }
            }
        }

        (iterations, accepted)
    }
}

impl GraphOptimizer for LevenbergMarquardtOptimizer {
    fn optimize(&self, graph: &mut PoseGraph, max_iterations: usize) -> OptimizationReport {
        let Some(mut problem) = GraphProblem::collect(graph) else {
            debug!("Nothing to optimize ({} nodes, {} edges)", graph.num_nodes(), graph.num_edges());
            return OptimizationReport::default();
        };

        let initial_cost = problem.cost_at(&problem.params());
        let (iterations, accepted_steps) = self.solve(&mut problem, max_iterations);
        let final_cost = problem.cost_at(&problem.params());

        // PHASE 3: apply
        if accepted_steps > 0 {
            for (id, estimate) in problem.solution() {
                // ids come from the graph itself, so this cannot miss
                let _ = graph.set_estimate(id, estimate);
            }
        }

        info!(
            "Optimized {} nodes / {} edges in {} iterations ({} accepted): cost {:.6} -> {:.6}",
            graph.num_nodes(),
            graph.num_edges(),
            iterations,
            accepted_steps,
            initial_cost,
            final_cost
        );

        OptimizationReport {
            iterations,
            accepted_steps,
            initial_cost,
            final_cost,
        }
    }

    fn marginal_covariances(
        &self,
        graph: &PoseGraph,
        nodes: &[NodeId],
    ) -> Option<HashMap<NodeId, DMatrix<f64>>> {
        let problem = GraphProblem::collect(graph)?;
        let jacobian = problem.jacobian()?;
        marginal_blocks(&problem, &jacobian, nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Plane3D, SE3};
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector3, Vector4};

    #[test]
    fn test_optimize_empty_graph_reports_failure() {
        let mut graph = PoseGraph::new();
        let report = LevenbergMarquardtOptimizer::default().optimize(&mut graph, 10);
        assert!(!report.succeeded());
    }

    #[test]
    fn test_odometry_chain_converges_to_measurements() {
        let mut graph = PoseGraph::new();
        let a = graph.add_se3_node(SE3::identity());
        let b = graph.add_se3_node(SE3::from_translation(Vector3::new(0.7, 0.2, 0.0)));
        let c = graph.add_se3_node(SE3::from_translation(Vector3::new(2.4, -0.3, 0.1)));
        graph.set_fixed(a, true).unwrap();
        let step = SE3::from_translation(Vector3::new(1.0, 0.0, 0.0));
        graph.add_se3_edge(a, b, step, DMatrix::identity(6, 6)).unwrap();
        graph.add_se3_edge(b, c, step, DMatrix::identity(6, 6)).unwrap();

        let report = LevenbergMarquardtOptimizer::default().optimize(&mut graph, 50);

        assert!(report.succeeded());
        assert!(report.final_cost < 1e-8);
        assert_relative_eq!(
            graph.pose(c).unwrap().translation,
            Vector3::new(2.0, 0.0, 0.0),
            epsilon = 1e-4
        );
    }

    #[test]
    fn test_converged_graph_is_not_a_success() {
        let mut graph = PoseGraph::new();
        let a = graph.add_se3_node(SE3::identity());
        let b = graph.add_se3_node(SE3::from_translation(Vector3::new(1.0, 0.0, 0.0)));
        graph.set_fixed(a, true).unwrap();
        let step = SE3::from_translation(Vector3::new(1.0, 0.0, 0.0));
        graph.add_se3_edge(a, b, step, DMatrix::identity(6, 6)).unwrap();

        let report = LevenbergMarquardtOptimizer::default().optimize(&mut graph, 50);

        assert!(report.iterations > 0);
        assert_eq!(report.accepted_steps, 0);
        assert!(!report.succeeded());
        assert_eq!(graph.pose(b).unwrap(), SE3::from_translation(Vector3::new(1.0, 0.0, 0.0)));
    }

    #[test]
    fn test_plane_observation_pulls_plane() {
        let mut graph = PoseGraph::new();
        let kf = graph.add_se3_node(SE3::from_translation(Vector3::new(1.0, 0.0, 0.0)));
        graph.set_fixed(kf, true).unwrap();
        let plane = graph.add_plane_node(Plane3D::new(Vector4::new(1.0, 0.05, 0.0, -2.7)));
        // body-frame observation of the wall x = 3
        let observed = Plane3D::new(Vector4::new(1.0, 0.0, 0.0, -2.0));
        graph
            .add_se3_plane_edge(kf, plane, observed, Matrix3::identity())
            .unwrap();

        LevenbergMarquardtOptimizer::default().optimize(&mut graph, 50);

        let estimate = graph.plane(plane).unwrap();
        assert_relative_eq!(estimate.normal(), Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-4);
        assert_relative_eq!(estimate.offset(), -3.0, epsilon = 1e-4);
    }
}

//! Least-squares view of a [`PoseGraph`].
//!
//! Parameters are tangent increments around the estimates captured at
//! collection time, one block per free node:
//!
//! ```text
//! x_i = base_i ⊞ δ_i
//! r_e = s(e²) · Lᵀ · err_e(x)        with Ω_e = L Lᵀ,  e² = errᵀ Ω err
//! ```
//!
//! where `s` is the robust-kernel scale. The Jacobian is evaluated by
//! central differences edge by edge, touching only the columns of the
//! edge's own nodes.

use std::collections::HashMap;

use levenberg_marquardt::LeastSquaresProblem;
use nalgebra::{DMatrix, DVector, Dyn, Owned};

use crate::graph::{EdgeKind, NodeEstimate, NodeId, PoseGraph, RobustKernel};

/// Step used for numerical differentiation.
const JACOBIAN_EPS: f64 = 1e-6;

/// A free node and its parameter block.
#[derive(Debug, Clone)]
struct Variable {
    id: NodeId,
    base: NodeEstimate,
    offset: usize,
    dim: usize,
}

/// An edge with its whitening factor and residual row.
#[derive(Debug, Clone)]
struct ProblemEdge {
    nodes: Vec<NodeId>,
    kind: EdgeKind,
    /// `Lᵀ` where `Ω = L Lᵀ`.
    sqrt_information: DMatrix<f64>,
    kernel: Option<RobustKernel>,
    row: usize,
    dim: usize,
}

/// Snapshot of a pose graph ready for solving without touching the graph.
#[derive(Debug, Clone)]
pub struct GraphProblem {
    variables: Vec<Variable>,
    variable_index: HashMap<NodeId, usize>,
    fixed: HashMap<NodeId, NodeEstimate>,
    edges: Vec<ProblemEdge>,
    params: DVector<f64>,
    num_residuals: usize,
}

impl GraphProblem {
    /// PHASE 1: collect nodes and edges from the graph.
    ///
    /// Returns `None` when there is nothing to optimize.
    pub fn collect(graph: &PoseGraph) -> Option<Self> {
        let mut variables = Vec::new();
        let mut variable_index = HashMap::new();
        let mut fixed = HashMap::new();
        let mut offset = 0;

        for node in graph.nodes() {
            if node.fixed {
                fixed.insert(node.id, node.estimate);
                continue;
            }
            let dim = node.estimate.dimension();
            variable_index.insert(node.id, variables.len());
            variables.push(Variable {
                id: node.id,
                base: node.estimate,
                offset,
                dim,
            });
            offset += dim;
        }

        let mut edges = Vec::new();
        let mut row = 0;
        for edge in graph.edges() {
            let dim = edge.kind.dimension();
            edges.push(ProblemEdge {
                nodes: edge.nodes.clone(),
                kind: edge.kind.clone(),
                sqrt_information: sqrt_information(&edge.information),
                kernel: edge.kernel,
                row,
                dim,
            });
            row += dim;
        }

        if offset == 0 || edges.is_empty() {
            return None;
        }

        Some(Self {
            variables,
            variable_index,
            fixed,
            edges,
            params: DVector::zeros(offset),
            num_residuals: row,
        })
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn num_residuals(&self) -> usize {
        self.num_residuals
    }

    /// Parameter block `(offset, dim)` of a free node.
    pub fn block(&self, node: NodeId) -> Option<(usize, usize)> {
        let var = &self.variables[*self.variable_index.get(&node)?];
        Some((var.offset, var.dim))
    }

    fn estimate(&self, params: &DVector<f64>, node: NodeId) -> Option<NodeEstimate> {
        if let Some(&idx) = self.variable_index.get(&node) {
            let var = &self.variables[idx];
            return Some(var.base.oplus(&block_of(params, var)));
        }
        self.fixed.get(&node).copied()
    }

    fn edge_estimates(&self, params: &DVector<f64>, edge: &ProblemEdge) -> Option<Vec<NodeEstimate>> {
        edge.nodes.iter().map(|n| self.estimate(params, *n)).collect()
    }

    /// Whitened, kernel-scaled residual of one edge.
    fn edge_residual(edge: &ProblemEdge, estimates: &[NodeEstimate]) -> DVector<f64> {
        let Some(raw) = edge.kind.error(estimates) else {
            return DVector::zeros(edge.dim);
        };
        let whitened = &edge.sqrt_information * raw;
        match edge.kernel {
            Some(kernel) => {
                let scale = kernel.residual_scale(whitened.norm_squared());
                whitened * scale
            }
            None => whitened,
        }
    }

    pub fn residuals_at(&self, params: &DVector<f64>) -> DVector<f64> {
        let mut residuals = DVector::zeros(self.num_residuals);
        for edge in &self.edges {
            if let Some(estimates) = self.edge_estimates(params, edge) {
                let r = Self::edge_residual(edge, &estimates);
                residuals.rows_mut(edge.row, edge.dim).copy_from(&r);
            }
        }
        residuals
    }

    pub fn jacobian_at(&self, params: &DVector<f64>) -> DMatrix<f64> {
        let mut jacobian = DMatrix::zeros(self.num_residuals, self.num_params());

        for edge in &self.edges {
            let Some(mut estimates) = self.edge_estimates(params, edge) else {
                continue;
            };

            for (slot, node) in edge.nodes.iter().enumerate() {
                let Some(&idx) = self.variable_index.get(node) else {
                    continue;
                };
                let var = &self.variables[idx];
                let original = estimates[slot];
                let mut delta = block_of(params, var);

                for k in 0..var.dim {
                    let center = delta[k];

                    delta[k] = center + JACOBIAN_EPS;
                    estimates[slot] = var.base.oplus(&delta);
                    let r_plus = Self::edge_residual(edge, &estimates);

                    delta[k] = center - JACOBIAN_EPS;
                    estimates[slot] = var.base.oplus(&delta);
                    let r_minus = Self::edge_residual(edge, &estimates);

                    delta[k] = center;
                    let column = (r_plus - r_minus) / (2.0 * JACOBIAN_EPS);
                    jacobian
                        .view_mut((edge.row, var.offset + k), (edge.dim, 1))
                        .copy_from(&column);
                }
                estimates[slot] = original;
            }
        }

        jacobian
    }

    /// Sum of squared residuals.
    pub fn cost_at(&self, params: &DVector<f64>) -> f64 {
        self.residuals_at(params).norm_squared()
    }

    /// PHASE 3 input: optimized estimates of all free nodes.
    pub fn solution(&self) -> Vec<(NodeId, NodeEstimate)> {
        self.variables
            .iter()
            .map(|var| (var.id, var.base.oplus(&block_of(&self.params, var))))
            .collect()
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for GraphProblem {
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;
    type ResidualStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.params.copy_from(params);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals_at(&self.params))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        Some(self.jacobian_at(&self.params))
    }
}

fn block_of(params: &DVector<f64>, var: &Variable) -> Vec<f64> {
    params.rows(var.offset, var.dim).iter().copied().collect()
}

/// Upper factor `Lᵀ` of the information matrix.
///
/// Falls back to the square root of the absolute diagonal when the matrix is
/// not positive definite.
fn sqrt_information(information: &DMatrix<f64>) -> DMatrix<f64> {
    match information.clone().cholesky() {
        Some(chol) => chol.l().transpose(),
        None => DMatrix::from_diagonal(&information.diagonal().map(|v| v.abs().sqrt())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn two_pose_graph() -> (PoseGraph, NodeId, NodeId) {
        let mut graph = PoseGraph::new();
        let a = graph.add_se3_node(SE3::identity());
        let b = graph.add_se3_node(SE3::from_translation(Vector3::new(0.8, 0.1, 0.0)));
        graph.set_fixed(a, true).unwrap();
        graph
            .add_se3_edge(
                a,
                b,
                SE3::from_translation(Vector3::new(1.0, 0.0, 0.0)),
                DMatrix::identity(6, 6) * 4.0,
            )
            .unwrap();
        (graph, a, b)
    }

    #[test]
    fn test_collect_skips_fixed_nodes() {
        let (graph, a, b) = two_pose_graph();
        let problem = GraphProblem::collect(&graph).unwrap();
        assert_eq!(problem.num_params(), 6);
        assert_eq!(problem.num_residuals(), 6);
        assert!(problem.block(a).is_none());
        assert_eq!(problem.block(b), Some((0, 6)));
    }

    #[test]
    fn test_residual_is_whitened() {
        let (graph, _, _) = two_pose_graph();
        let problem = GraphProblem::collect(&graph).unwrap();
        let r = problem.residuals().unwrap();
        // error in x is -0.2 and the information 4 whitens by 2
        assert_relative_eq!(r[0], -0.4, epsilon = 1e-12);
        assert_relative_eq!(r[1], 0.2, epsilon = 1e-12);
    }

    #[test]
    fn test_numerical_jacobian_translation_block() {
        let (graph, _, _) = two_pose_graph();
        let problem = GraphProblem::collect(&graph).unwrap();
        let j = problem.jacobian().unwrap();
        assert_eq!(j.shape(), (6, 6));
        // translation increments map one to one (times the whitening factor)
        assert_relative_eq!(j[(0, 3)], 2.0, epsilon = 1e-6);
        assert_relative_eq!(j[(1, 4)], 2.0, epsilon = 1e-6);
        assert_relative_eq!(j[(2, 5)], 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_collect_empty_graph() {
        let mut graph = PoseGraph::new();
        graph.add_se3_node(SE3::identity());
        assert!(GraphProblem::collect(&graph).is_none());
    }
}

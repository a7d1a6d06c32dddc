//! Marginal covariances from the Gauss-Newton Hessian.

use std::collections::HashMap;

use nalgebra::{DMatrix, Matrix3};

use crate::graph::NodeId;

use super::problem::GraphProblem;

/// Diagonal covariance blocks `(JᵀJ)⁻¹` for the requested free nodes.
///
/// Returns `None` if the Hessian is not positive definite. Fixed or unknown
/// nodes are left out of the map.
pub fn marginal_blocks(
    problem: &GraphProblem,
    jacobian: &DMatrix<f64>,
    nodes: &[NodeId],
) -> Option<HashMap<NodeId, DMatrix<f64>>> {
    let hessian = jacobian.transpose() * jacobian;
    let chol = hessian.cholesky()?;
    let n = problem.num_params();

    let mut blocks = HashMap::new();
    for &node in nodes {
        let Some((offset, dim)) = problem.block(node) else {
            continue;
        };
        let mut rhs = DMatrix::zeros(n, dim);
        for k in 0..dim {
            rhs[(offset + k, k)] = 1.0;
        }
        let columns = chol.solve(&rhs);
        blocks.insert(node, columns.rows(offset, dim).into_owned());
    }
    Some(blocks)
}

/// Turn a raw 3×3 marginal block into a usable plane covariance.
///
/// Anything non-finite, of the wrong shape, or not positive definite becomes
/// identity.
pub fn sanitize_covariance(block: &DMatrix<f64>) -> Matrix3<f64> {
    if block.shape() != (3, 3) || block.iter().any(|v| !v.is_finite()) {
        return Matrix3::identity();
    }
    let cov = Matrix3::from_iterator(block.iter().copied());
    if (0..3).any(|i| cov[(i, i)] <= 0.0) || cov.cholesky().is_none() {
        return Matrix3::identity();
    }
    cov
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::graph::PoseGraph;
    use approx::assert_relative_eq;
    use nalgebra::{DVector, Vector3};

    #[test]
    fn test_sanitize_keeps_valid_block() {
        let block = DMatrix::from_diagonal_element(3, 3, 0.25);
        assert_relative_eq!(sanitize_covariance(&block), Matrix3::identity() * 0.25);
    }

    #[test]
    fn test_sanitize_singular_is_identity() {
        let block = DMatrix::zeros(3, 3);
        assert_eq!(sanitize_covariance(&block), Matrix3::identity());
    }

    #[test]
    fn test_sanitize_nan_is_identity() {
        let mut block = DMatrix::identity(3, 3);
        block[(1, 2)] = f64::NAN;
        assert_eq!(sanitize_covariance(&block), Matrix3::identity());
    }

    #[test]
    fn test_prior_marginal_is_inverse_information() {
        let mut graph = PoseGraph::new();
        let a = graph.add_se3_node(SE3::identity());
        let b = graph.add_se3_node(SE3::from_translation(Vector3::new(1.0, 0.0, 0.0)));
        graph.set_fixed(a, true).unwrap();
        graph
            .add_se3_edge(
                a,
                b,
                SE3::from_translation(Vector3::new(1.0, 0.0, 0.0)),
                DMatrix::identity(6, 6) * 4.0,
            )
            .unwrap();

        let problem = GraphProblem::collect(&graph).unwrap();
        let jacobian = problem.jacobian_at(&DVector::zeros(6));
        let blocks = marginal_blocks(&problem, &jacobian, &[a, b]).unwrap();

        assert!(!blocks.contains_key(&a));
        let cov = &blocks[&b];
        // translation entries invert the information exactly at the optimum
        assert_relative_eq!(cov[(3, 3)], 0.25, epsilon = 1e-5);
        assert_relative_eq!(cov[(4, 4)], 0.25, epsilon = 1e-5);
    }
}

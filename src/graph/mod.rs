//! Pose graph: typed nodes, typed edges and the owning store.

pub mod edge;
pub mod node;
pub mod robust_kernel;
pub mod store;
pub mod types;

pub use edge::{Edge, EdgeKind};
pub use node::{Node, NodeEstimate};
pub use robust_kernel::RobustKernel;
pub use store::PoseGraph;
pub use types::{EdgeId, KeyframeId, NodeId};

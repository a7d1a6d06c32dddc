//! PoseGraph - owner of all nodes, edges and landmark registries.
//!
//! The graph holds:
//! - SE3 pose nodes (keyframes plus an optional anchor)
//! - Plane, corridor and room landmark nodes
//! - Tagged edges between them
//! - The plane/corridor/room registries that refer to landmark nodes by id
//!
//! Every mutation goes through `&mut self`, so the single-writer discipline is
//! enforced by whoever owns the graph (the orchestrator under its main lock).
//! Edge insertion validates that every referenced node exists and has the
//! expected type.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use nalgebra::{DMatrix, Matrix2, Matrix3, Matrix4, UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SlamError};
use crate::geometry::{Plane3D, SE3};
use crate::optimizer::{sanitize_covariance, GraphOptimizer, OptimizationReport};
use crate::planes::{PlaneClass, PlaneRegistry};
use crate::structures::{Corridor, Room};

use super::edge::{Edge, EdgeKind};
use super::node::{Node, NodeEstimate};
use super::robust_kernel::RobustKernel;
use super::types::{EdgeId, NodeId};

/// The pose graph with its landmark registries.
#[derive(Debug, Clone, Default)]
pub struct PoseGraph {
    /// Ordered so that parameter layouts are deterministic.
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<EdgeId, Edge>,
    next_node_id: u64,
    next_edge_id: u64,
    planes: PlaneRegistry,
    corridors: Vec<Corridor>,
    rooms: Vec<Room>,
}

/// On-disk form of a [`PoseGraph`].
#[derive(Serialize, Deserialize)]
struct GraphCheckpoint {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    next_node_id: u64,
    next_edge_id: u64,
    planes: PlaneRegistry,
    corridors: Vec<Corridor>,
    rooms: Vec<Room>,
}

impl PoseGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Nodes
    // ─────────────────────────────────────────────────────────────────────────

    fn insert_node(&mut self, estimate: NodeEstimate) -> NodeId {
        let id = NodeId::new(self.next_node_id);
        self.next_node_id += 1;
        self.nodes.insert(id, Node::new(id, estimate));
        id
    }

    pub fn add_se3_node(&mut self, pose: SE3) -> NodeId {
        self.insert_node(NodeEstimate::Pose(pose))
    }

    pub fn add_plane_node(&mut self, plane: Plane3D) -> NodeId {
        self.insert_node(NodeEstimate::Plane(plane))
    }

    pub fn add_corridor_node(&mut self, pose: Vector3<f64>) -> NodeId {
        self.insert_node(NodeEstimate::Corridor(pose))
    }

    pub fn add_room_node(&mut self, pose: Vector2<f64>) -> NodeId {
        self.insert_node(NodeEstimate::Room(pose))
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn pose(&self, id: NodeId) -> Option<SE3> {
        self.nodes.get(&id).and_then(Node::pose)
    }

    pub fn plane(&self, id: NodeId) -> Option<Plane3D> {
        self.nodes.get(&id).and_then(Node::plane)
    }

    pub fn corridor_pose(&self, id: NodeId) -> Option<Vector3<f64>> {
        self.nodes.get(&id).and_then(Node::corridor)
    }

    pub fn room_pose(&self, id: NodeId) -> Option<Vector2<f64>> {
        self.nodes.get(&id).and_then(Node::room)
    }

    pub fn set_fixed(&mut self, id: NodeId, fixed: bool) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(SlamError::UnknownNode(id))?;
        node.fixed = fixed;
        Ok(())
    }

    /// Overwrite a node estimate; the node type must not change.
    pub fn set_estimate(&mut self, id: NodeId, estimate: NodeEstimate) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(SlamError::UnknownNode(id))?;
        if node.estimate.kind_name() != estimate.kind_name() {
            return Err(SlamError::NodeKind {
                node: id,
                expected: node.estimate.kind_name(),
            });
        }
        node.estimate = estimate;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Edges
    // ─────────────────────────────────────────────────────────────────────────

    fn insert_edge(
        &mut self,
        kind: EdgeKind,
        nodes: Vec<NodeId>,
        information: DMatrix<f64>,
    ) -> Result<EdgeId> {
        if nodes.len() != kind.arity() {
            return Err(SlamError::Dimension {
                expected: kind.arity(),
                actual: nodes.len(),
            });
        }
        for (node_id, &expected) in nodes.iter().zip(kind.expected_kinds()) {
            let node = self
                .nodes
                .get(node_id)
                .ok_or(SlamError::UnknownNode(*node_id))?;
            if node.estimate.kind_name() != expected {
                return Err(SlamError::NodeKind {
                    node: *node_id,
                    expected,
                });
            }
        }
        let dim = kind.dimension();
        if information.nrows() != dim || information.ncols() != dim {
            return Err(SlamError::Dimension {
                expected: dim,
                actual: information.nrows(),
            });
        }

        let id = EdgeId::new(self.next_edge_id);
        self.next_edge_id += 1;
        self.edges.insert(
            id,
            Edge {
                id,
                nodes,
                kind,
                information,
                kernel: None,
            },
        );
        Ok(id)
    }

    /// Relative pose edge; `relative` is `a⁻¹ · b`.
    pub fn add_se3_edge(
        &mut self,
        a: NodeId,
        b: NodeId,
        relative: SE3,
        information: DMatrix<f64>,
    ) -> Result<EdgeId> {
        self.insert_edge(EdgeKind::Se3 { measurement: relative }, vec![a, b], information)
    }

    pub fn add_se3_plane_edge(
        &mut self,
        pose: NodeId,
        plane: NodeId,
        measurement: Plane3D,
        information: Matrix3<f64>,
    ) -> Result<EdgeId> {
        self.insert_edge(
            EdgeKind::Se3Plane { measurement },
            vec![pose, plane],
            dynamic(&information),
        )
    }

    pub fn add_se3_point_to_plane_edge(
        &mut self,
        pose: NodeId,
        plane: NodeId,
        points_outer: Matrix4<f64>,
        information: f64,
    ) -> Result<EdgeId> {
        self.insert_edge(
            EdgeKind::Se3PointToPlane { points_outer },
            vec![pose, plane],
            DMatrix::from_element(1, 1, information),
        )
    }

    pub fn add_se3_prior_xy_edge(
        &mut self,
        pose: NodeId,
        xy: Vector2<f64>,
        information: Matrix2<f64>,
    ) -> Result<EdgeId> {
        self.insert_edge(
            EdgeKind::PriorXy { measurement: xy },
            vec![pose],
            dynamic(&information),
        )
    }

    pub fn add_se3_prior_xyz_edge(
        &mut self,
        pose: NodeId,
        xyz: Vector3<f64>,
        information: Matrix3<f64>,
    ) -> Result<EdgeId> {
        self.insert_edge(
            EdgeKind::PriorXyz { measurement: xyz },
            vec![pose],
            dynamic(&information),
        )
    }

    pub fn add_se3_prior_quat_edge(
        &mut self,
        pose: NodeId,
        orientation: UnitQuaternion<f64>,
        information: Matrix3<f64>,
    ) -> Result<EdgeId> {
        self.insert_edge(
            EdgeKind::PriorQuat {
                measurement: orientation,
            },
            vec![pose],
            dynamic(&information),
        )
    }

    /// `direction` is a map-frame vector, `measurement` the same vector as
    /// sensed in the body frame; both are normalized.
    pub fn add_se3_prior_vec_edge(
        &mut self,
        pose: NodeId,
        direction: Vector3<f64>,
        measurement: Vector3<f64>,
        information: Matrix3<f64>,
    ) -> Result<EdgeId> {
        self.insert_edge(
            EdgeKind::PriorVec {
                direction: direction.normalize(),
                measurement: measurement.normalize(),
            },
            vec![pose],
            dynamic(&information),
        )
    }

    pub fn add_plane_parallel_edge(
        &mut self,
        a: NodeId,
        b: NodeId,
        information: f64,
    ) -> Result<EdgeId> {
        self.insert_edge(
            EdgeKind::PlaneParallel,
            vec![a, b],
            DMatrix::identity(3, 3) * information,
        )
    }

    pub fn add_plane_perpendicular_edge(
        &mut self,
        a: NodeId,
        b: NodeId,
        information: f64,
    ) -> Result<EdgeId> {
        self.insert_edge(
            EdgeKind::PlanePerpendicular,
            vec![a, b],
            DMatrix::from_element(1, 1, information),
        )
    }

    pub fn add_se3_corridor_edge(
        &mut self,
        pose: NodeId,
        corridor: NodeId,
        local: Vector3<f64>,
        information: Matrix3<f64>,
    ) -> Result<EdgeId> {
        self.insert_edge(
            EdgeKind::Se3Corridor { measurement: local },
            vec![pose, corridor],
            dynamic(&information),
        )
    }

    pub fn add_corridor_plane_edge(
        &mut self,
        corridor: NodeId,
        plane: NodeId,
        axis: PlaneClass,
        measurement: f64,
        information: f64,
    ) -> Result<EdgeId> {
        self.insert_edge(
            EdgeKind::CorridorPlane { axis, measurement },
            vec![corridor, plane],
            DMatrix::from_element(1, 1, information),
        )
    }

    pub fn add_se3_room_edge(
        &mut self,
        pose: NodeId,
        room: NodeId,
        local: Vector2<f64>,
        information: Matrix2<f64>,
    ) -> Result<EdgeId> {
        self.insert_edge(
            EdgeKind::Se3Room { measurement: local },
            vec![pose, room],
            dynamic(&information),
        )
    }

    pub fn add_room_plane_edge(
        &mut self,
        room: NodeId,
        plane: NodeId,
        axis: PlaneClass,
        measurement: f64,
        information: f64,
    ) -> Result<EdgeId> {
        self.insert_edge(
            EdgeKind::RoomPlane { axis, measurement },
            vec![room, plane],
            DMatrix::from_element(1, 1, information),
        )
    }

    /// Attach a robust kernel by configuration name; `"NONE"` clears it.
    pub fn add_robust_kernel(&mut self, edge: EdgeId, kernel_type: &str, size: f64) -> Result<()> {
        let kernel = RobustKernel::from_name(kernel_type, size)?;
        let edge = self.edges.get_mut(&edge).ok_or(SlamError::UnknownEdge(edge))?;
        edge.kernel = kernel;
        Ok(())
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(&id)
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    /// Edges incident to `node`.
    pub fn edges_of(&self, node: NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.values().filter(move |e| e.connects(node))
    }

    pub fn remove_edge(&mut self, id: EdgeId) -> Result<Edge> {
        self.edges.remove(&id).ok_or(SlamError::UnknownEdge(id))
    }

    /// Remove a plane node, every edge touching it, and its registry entry.
    ///
    /// Corridor and room nodes bounded by the plane stay in the graph with
    /// their remaining edges, but their registry entries are dropped so no
    /// later association refers to the removed plane.
    pub fn remove_plane_node(&mut self, id: NodeId) -> Result<()> {
        match self.nodes.get(&id) {
            None => return Err(SlamError::UnknownNode(id)),
            Some(node) if node.plane().is_none() => {
                return Err(SlamError::NodeKind {
                    node: id,
                    expected: "plane",
                })
            }
            Some(_) => {}
        }

        let before = self.edges.len();
        self.edges.retain(|_, e| !e.connects(id));
        self.nodes.remove(&id);
        self.planes.remove(id);
        let structures = self.corridors.len() + self.rooms.len();
        self.corridors.retain(|c| c.plane1 != id && c.plane2 != id);
        self.rooms.retain(|r| !r.x_planes.contains(&id) && !r.y_planes.contains(&id));
        debug!(
            "Removed plane {} with {} dependent edges and {} structures",
            id,
            before - self.edges.len(),
            structures - self.corridors.len() - self.rooms.len()
        );
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn planes(&self) -> &PlaneRegistry {
        &self.planes
    }

    pub fn planes_mut(&mut self) -> &mut PlaneRegistry {
        &mut self.planes
    }

    pub fn corridors(&self) -> &[Corridor] {
        &self.corridors
    }

    pub fn add_corridor(&mut self, corridor: Corridor) {
        self.corridors.push(corridor);
    }

    pub fn rooms(&self) -> &[Room] {
        &self.rooms
    }

    pub fn add_room(&mut self, room: Room) {
        self.rooms.push(room);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Optimization
    // ─────────────────────────────────────────────────────────────────────────

    /// Run at most `max_iterations` solver iterations in place.
    pub fn optimize(
        &mut self,
        optimizer: &dyn GraphOptimizer,
        max_iterations: usize,
    ) -> OptimizationReport {
        optimizer.optimize(self, max_iterations)
    }

    /// Marginal covariance blocks for the requested nodes.
    pub fn compute_marginals(
        &self,
        optimizer: &dyn GraphOptimizer,
        nodes: &[NodeId],
    ) -> Option<HashMap<NodeId, DMatrix<f64>>> {
        optimizer.marginal_covariances(self, nodes)
    }

    /// Refresh every registered plane's covariance from the solver.
    ///
    /// Blocks that are missing or fail the positive-definite check are
    /// replaced with identity.
    pub fn refresh_plane_covariances(&mut self, optimizer: &dyn GraphOptimizer) {
        let ids: Vec<NodeId> = self.planes.iter().map(|p| p.id).collect();
        if ids.is_empty() {
            return;
        }
        let marginals = self.compute_marginals(optimizer, &ids);
        if marginals.is_none() {
            warn!("Marginal computation failed, resetting plane covariances to identity");
        }

        for plane in self.planes.iter_mut() {
            let block = marginals.as_ref().and_then(|m| m.get(&plane.id));
            plane.covariance = match block {
                Some(block) => sanitize_covariance(block),
                None => Matrix3::identity(),
            };
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────────

    /// Write the whole graph, registries included, as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let checkpoint = GraphCheckpoint {
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
            next_node_id: self.next_node_id,
            next_edge_id: self.next_edge_id,
            planes: self.planes.clone(),
            corridors: self.corridors.clone(),
            rooms: self.rooms.clone(),
        };
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &checkpoint)?;
        Ok(())
    }

    /// Restore a graph written by [`PoseGraph::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let checkpoint: GraphCheckpoint = serde_json::from_reader(reader)?;
        Ok(Self {
            nodes: checkpoint.nodes.into_iter().map(|n| (n.id, n)).collect(),
            edges: checkpoint.edges.into_iter().map(|e| (e.id, e)).collect(),
            next_node_id: checkpoint.next_node_id,
            next_edge_id: checkpoint.next_edge_id,
            planes: checkpoint.planes,
            corridors: checkpoint.corridors,
            rooms: checkpoint.rooms,
        })
    }
}

fn dynamic<const N: usize>(m: &nalgebra::SMatrix<f64, N, N>) -> DMatrix<f64> {
    DMatrix::from_column_slice(N, N, m.as_slice())
}

//! The optimization orchestrator.
//!
//! Sensor producers push into per-stream queues; a periodic cycle drains
//! them into the graph under the main lock, closes loops, optimizes and
//! publishes a snapshot plus the odom→map correction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nalgebra::UnitQuaternion;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SlamError};
use crate::geometry::SE3;
use crate::graph::{KeyframeId, NodeEstimate};
use crate::io::config::SlamConfig;
use crate::io::{dump, map_cloud};
use crate::keyframe::{
    FitnessInformationCalculator, InformationMatrixCalculator, Keyframe, KeyframeSnapshot,
    KeyframeUpdater, MotionKeyframeUpdater, PointCloud,
};
use crate::loop_closing::{DistanceLoopDetector, LoopDetector, PointToPointIcp};
use crate::optimizer::{GraphOptimizer, LevenbergMarquardtOptimizer};
use crate::planes::PlaneMapper;
use crate::structures::{CorridorMapper, RoomMapper};

use super::messages::{FloorCoefficients, GpsFix, ImuSample, OdometryCloud, SegmentedPlanes};
use super::queues::SensorQueues;
use super::shared_state::{GraphState, SharedState};

const NANOS_PER_SEC: u64 = 1_000_000_000;
/// Watermark lead after keyframes were processed.
pub(super) const READ_AHEAD_NS: u64 = 10 * NANOS_PER_SEC;
/// Watermark lead when a cycle flushed no keyframe.
const IDLE_READ_AHEAD_NS: u64 = 30 * NANOS_PER_SEC;

/// Robust kernel selection by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RobustKernelConfig {
    pub kernel: String,
    pub size: f64,
}

impl Default for RobustKernelConfig {
    fn default() -> Self {
        Self {
            kernel: "NONE".to_string(),
            size: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub base_frame_id: String,
    pub max_keyframes_per_update: usize,
    /// Seconds between optimization cycles.
    pub graph_update_interval: f64,
    /// Seconds between map cloud renders.
    pub map_cloud_update_interval: f64,
    pub map_cloud_resolution: f64,
    pub solver_num_iterations: usize,

    pub fix_first_node: bool,
    pub fix_first_node_stddev: [f64; 6],
    pub fix_first_node_adaptive: bool,
    pub odometry_edge_robust_kernel: RobustKernelConfig,
    pub loop_closure_edge_robust_kernel: RobustKernelConfig,

    pub enable_gps: bool,
    pub gps_edge_stddev_xy: f64,
    pub gps_edge_stddev_z: f64,
    pub gps_edge_robust_kernel: RobustKernelConfig,

    pub enable_imu_orientation: bool,
    pub enable_imu_acceleration: bool,
    pub imu_orientation_edge_stddev: f64,
    pub imu_acceleration_edge_stddev: f64,
    pub imu_orientation_edge_robust_kernel: RobustKernelConfig,
    pub imu_acceleration_edge_robust_kernel: RobustKernelConfig,

    pub floor_edge_stddev: f64,
    pub floor_edge_robust_kernel: RobustKernelConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_frame_id: "base_link".to_string(),
            max_keyframes_per_update: 10,
            graph_update_interval: 3.0,
            map_cloud_update_interval: 10.0,
            map_cloud_resolution: 0.05,
            solver_num_iterations: 1024,
            fix_first_node: false,
            fix_first_node_stddev: [1.0; 6],
            fix_first_node_adaptive: true,
            odometry_edge_robust_kernel: RobustKernelConfig::default(),
            loop_closure_edge_robust_kernel: RobustKernelConfig::default(),
            enable_gps: true,
            gps_edge_stddev_xy: 10000.0,
            gps_edge_stddev_z: 10.0,
            gps_edge_robust_kernel: RobustKernelConfig::default(),
            enable_imu_orientation: false,
            enable_imu_acceleration: false,
            imu_orientation_edge_stddev: 0.1,
            imu_acceleration_edge_stddev: 3.0,
            imu_orientation_edge_robust_kernel: RobustKernelConfig::default(),
            imu_acceleration_edge_robust_kernel: RobustKernelConfig::default(),
            floor_edge_stddev: 10.0,
            floor_edge_robust_kernel: RobustKernelConfig::default(),
        }
    }
}

/// Looks up rotations between sensor frames.
pub trait FrameTransformer: Send + Sync {
    /// Rotation taking vectors expressed in `from` into `to`.
    fn rotation(&self, from: &str, to: &str) -> Result<UnitQuaternion<f64>>;
}

/// Fixed sensor mounting rotations relative to one base frame.
#[derive(Debug, Clone, Default)]
pub struct StaticFrameTransformer {
    base_frame_id: String,
    to_base: HashMap<String, UnitQuaternion<f64>>,
}

impl StaticFrameTransformer {
    pub fn new(base_frame_id: impl Into<String>) -> Self {
        Self {
            base_frame_id: base_frame_id.into(),
            to_base: HashMap::new(),
        }
    }

    pub fn with_frame(mut self, frame_id: impl Into<String>, to_base: UnitQuaternion<f64>) -> Self {
        self.to_base.insert(frame_id.into(), to_base);
        self
    }
}

impl FrameTransformer for StaticFrameTransformer {
    fn rotation(&self, from: &str, to: &str) -> Result<UnitQuaternion<f64>> {
        if from == to {
            return Ok(UnitQuaternion::identity());
        }
        let missing = || SlamError::Transform {
            from: from.to_string(),
            to: to.to_string(),
        };
        let from_base = |frame: &str| -> Option<UnitQuaternion<f64>> {
            if frame == self.base_frame_id {
                Some(UnitQuaternion::identity())
            } else {
                self.to_base.get(frame).copied()
            }
        };
        let from_rot = from_base(from).ok_or_else(missing)?;
        let to_rot = from_base(to).ok_or_else(missing)?;
        Ok(to_rot.inverse() * from_rot)
    }
}

/// Drains sensor queues into the pose graph and keeps it optimized.
pub struct GraphOrchestrator {
    pub(super) config: SlamConfig,
    pub(super) queues: SensorQueues,
    pub(super) shared: Arc<SharedState>,
    keyframe_updater: Mutex<Box<dyn KeyframeUpdater>>,
    next_keyframe_id: AtomicU64,
    pub(super) information: Box<dyn InformationMatrixCalculator>,
    optimizer: Box<dyn GraphOptimizer>,
    pub(super) transformer: Box<dyn FrameTransformer>,
    pub(super) plane_mapper: PlaneMapper,
    pub(super) corridor_mapper: CorridorMapper,
    pub(super) room_mapper: RoomMapper,
}

impl GraphOrchestrator {
    /// Orchestrator with the bundled collaborators.
    pub fn new(config: SlamConfig) -> Self {
        let loop_detector = DistanceLoopDetector::new(
            config.loop_detector.clone(),
            PointToPointIcp::new(config.registration.clone()),
        );
        let transformer = StaticFrameTransformer::new(config.graph.base_frame_id.clone());

        Self {
            queues: SensorQueues::new(),
            shared: SharedState::new(Box::new(loop_detector)),
            keyframe_updater: Mutex::new(Box::new(MotionKeyframeUpdater::new(
                config.keyframe.clone(),
            ))),
            next_keyframe_id: AtomicU64::new(0),
            information: Box::new(FitnessInformationCalculator::new(config.information.clone())),
            optimizer: Box::new(LevenbergMarquardtOptimizer::new(config.solver.clone())),
            transformer: Box::new(transformer),
            plane_mapper: PlaneMapper::new(config.planes.clone()),
            corridor_mapper: CorridorMapper::new(config.corridor.clone()),
            room_mapper: RoomMapper::new(config.room.clone()),
            config,
        }
    }

    pub fn with_frame_transformer(mut self, transformer: Box<dyn FrameTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn with_loop_detector(self, detector: Box<dyn LoopDetector>) -> Self {
        self.shared.main.lock().loop_detector = detector;
        self
    }

    pub fn with_information_calculator(
        mut self,
        calculator: Box<dyn InformationMatrixCalculator>,
    ) -> Self {
        self.information = calculator;
        self
    }

    pub fn with_keyframe_updater(self, updater: Box<dyn KeyframeUpdater>) -> Self {
        *self.keyframe_updater.lock() = updater;
        self
    }

    pub fn with_optimizer(mut self, optimizer: Box<dyn GraphOptimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn config(&self) -> &SlamConfig {
        &self.config
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Producers
    // ─────────────────────────────────────────────────────────────────────────

    /// Offer an odometry sample; returns true if it became a keyframe.
    ///
    /// A rejected sample with no keyframe pending moves the read-until
    /// watermark past it.
    pub fn on_odometry(&self, msg: OdometryCloud) -> bool {
        self.shared
            .latest_stamp_ns
            .fetch_max(msg.stamp_ns, Ordering::SeqCst);

        let mut updater = self.keyframe_updater.lock();
        if !updater.update(&msg.odom) {
            if self.queues.keyframes.lock().is_empty() {
                self.shared.set_read_until(msg.stamp_ns + READ_AHEAD_NS);
            }
            return false;
        }

        let id = KeyframeId::new(self.next_keyframe_id.fetch_add(1, Ordering::SeqCst));
        let keyframe = Keyframe::new(
            id,
            msg.stamp_ns,
            msg.odom,
            updater.accum_distance(),
            Arc::new(msg.cloud),
        );
        debug!("Keyframe {} queued at {}", id, msg.stamp_ns);
        self.queues.keyframes.lock().push_back(keyframe);
        true
    }

    pub fn on_floor(&self, msg: FloorCoefficients) {
        self.queues.floor.lock().push_back(msg);
    }

    pub fn on_gps(&self, msg: GpsFix) {
        if self.config.graph.enable_gps {
            self.queues.gps.lock().push_back(msg);
        }
    }

    pub fn on_imu(&self, msg: ImuSample) {
        let cfg = &self.config.graph;
        if cfg.enable_imu_orientation || cfg.enable_imu_acceleration {
            self.queues.imu.lock().push_back(msg);
        }
    }

    pub fn on_segmented_planes(&self, msg: SegmentedPlanes) {
        self.queues.segmented.lock().push_back(msg);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Optimization cycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Drain every queue, then close loops, optimize and publish if any
    /// of them changed the graph. Returns whether the graph changed.
    pub fn optimization_cycle(&self) -> bool {
        let mut guard = self.shared.main.lock();
        let state = &mut *guard;

        let keyframes_updated = self.flush_keyframe_queue(state);
        if !keyframes_updated {
            let latest = self.shared.latest_stamp_ns.load(Ordering::SeqCst);
            self.shared.set_read_until(latest + IDLE_READ_AHEAD_NS);
        }
        let floor_updated = self.flush_floor_queue(state);
        let gps_updated = self.flush_gps_queue(state);
        let imu_updated = self.flush_imu_queue(state);
        let planes_updated = self.flush_segmented_queue(state);

        if !(keyframes_updated || floor_updated || gps_updated || imu_updated || planes_updated) {
            return false;
        }

        self.close_loops(state);
        state.committed = state.keyframes.len();
        self.recenter_anchor(state);

        let report = state
            .graph
            .optimize(self.optimizer.as_ref(), self.config.graph.solver_num_iterations);
        if report.succeeded() {
            state.graph.refresh_plane_covariances(self.optimizer.as_ref());
        }

        self.publish(state);
        info!(
            "Graph cycle: {} keyframes, {} nodes, {} edges, {} planes, {} corridors, {} rooms, cost {:.4} -> {:.4}",
            state.keyframes.len(),
            state.graph.num_nodes(),
            state.graph.num_edges(),
            state.graph.planes().len(),
            state.graph.corridors().len(),
            state.graph.rooms().len(),
            report.initial_cost,
            report.final_cost
        );
        true
    }

    fn close_loops(&self, state: &mut GraphState) {
        let GraphState {
            graph,
            keyframes,
            committed,
            loop_detector,
            ..
        } = state;
        let (old, new) = keyframes.split_at(*committed);
        let loops = loop_detector.detect(old, new, graph);

        let kernel = &self.config.graph.loop_closure_edge_robust_kernel;
        for found in loops {
            let find = |id| keyframes.iter().find(|k| k.id == id);
            let (Some(new_kf), Some(old_kf)) = (find(found.new_keyframe), find(found.old_keyframe))
            else {
                continue;
            };
            let information =
                self.information
                    .information_matrix(&new_kf.cloud, &old_kf.cloud, &found.relative_pose);
            let added = graph
                .add_se3_edge(found.new_node, found.old_node, found.relative_pose, information)
                .and_then(|edge| graph.add_robust_kernel(edge, &kernel.kernel, kernel.size));
            if let Err(err) = added {
                warn!("Failed to add loop edge: {}", err);
            }
        }
    }

    /// Move the anchor onto the current estimate of the node it anchors.
    fn recenter_anchor(&self, state: &mut GraphState) {
        if !self.config.graph.fix_first_node_adaptive {
            return;
        }
        let (Some(anchor), Some(edge)) = (state.anchor_node, state.anchor_edge) else {
            return;
        };
        let Some(target) = state.graph.edge(edge).and_then(|e| e.nodes.get(1).copied()) else {
            return;
        };
        if let Some(pose) = state.graph.pose(target) {
            if let Err(err) = state.graph.set_estimate(anchor, NodeEstimate::Pose(pose)) {
                warn!("Failed to move anchor: {}", err);
            }
        }
    }

    fn publish(&self, state: &GraphState) {
        if let Some(last) = state.keyframes.last() {
            if let Some(estimate) = last.estimate(&state.graph) {
                *self.shared.odom2map.lock() = estimate.compose(&last.odom.inverse());
            }
        }

        let snapshot: Vec<KeyframeSnapshot> = state
            .keyframes
            .iter()
            .filter_map(|k| KeyframeSnapshot::new(k, &state.graph))
            .collect();
        *self.shared.snapshot.lock() = Arc::new(snapshot);
        self.shared.graph_updated.store(true, Ordering::SeqCst);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outputs
    // ─────────────────────────────────────────────────────────────────────────

    pub fn odom2map(&self) -> SE3 {
        *self.shared.odom2map.lock()
    }

    pub fn snapshot(&self) -> Arc<Vec<KeyframeSnapshot>> {
        Arc::clone(&self.shared.snapshot.lock())
    }

    pub fn read_until(&self) -> u64 {
        self.shared.read_until()
    }

    /// Run `f` on the graph state under the main lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&GraphState) -> R) -> R {
        f(&self.shared.main.lock())
    }

    /// Latest rendered map cloud.
    pub fn map_cloud(&self) -> Option<Arc<PointCloud>> {
        self.shared.map_cloud.lock().clone()
    }

    /// Re-render the map cloud from the snapshot if the graph changed since
    /// the last render.
    pub fn update_map_cloud(&self) -> bool {
        if !self.shared.take_graph_updated() {
            return false;
        }
        let snapshot = self.snapshot();
        let cloud =
            map_cloud::generate_map_cloud(&snapshot, self.config.graph.map_cloud_resolution);
        debug!("Map cloud rendered with {} points", cloud.len());
        *self.shared.map_cloud.lock() = Some(Arc::new(cloud));
        true
    }

    /// Plane support points at the current keyframe estimates.
    pub fn plane_cloud(&self, resolution: f64) -> PointCloud {
        let state = self.shared.main.lock();
        map_cloud::plane_support_cloud(&state.graph, resolution)
    }

    /// Write the graph, keyframes and special node ids under `directory`.
    pub fn dump(&self, directory: &Path) -> bool {
        let state = self.shared.main.lock();
        match dump::dump_graph(directory, &state) {
            Ok(()) => {
                info!("Graph dumped to {}", directory.display());
                true
            }
            Err(err) => {
                warn!("Graph dump failed: {:#}", err);
                false
            }
        }
    }

    /// Save the map cloud at `resolution`, optionally shifted back to UTM.
    pub fn save_map(&self, path: &Path, resolution: f64, utm: bool) -> bool {
        let snapshot = self.snapshot();
        let zero_utm = if utm {
            self.shared.main.lock().zero_utm
        } else {
            None
        };

        let cloud = map_cloud::generate_map_cloud(&snapshot, resolution);
        match map_cloud::save_map(path, &cloud, zero_utm.as_ref()) {
            Ok(()) => {
                info!("Map with {} points saved to {}", cloud.len(), path.display());
                true
            }
            Err(err) => {
                warn!("Saving map failed: {:#}", err);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeKind;
    use crate::keyframe::{PlaneSegment, SegmentedPoint};
    use crate::graph::{NodeId, PoseGraph};
    use crate::loop_closing::registration::tests::corner_cloud;
    use crate::optimizer::OptimizationReport;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, Matrix3, Vector3, Vector4};
    use std::sync::atomic::AtomicUsize;

    const SEC: u64 = NANOS_PER_SEC;

    fn odometry(stamp_ns: u64, x: f64, yaw: f64) -> OdometryCloud {
        OdometryCloud {
            stamp_ns,
            odom: SE3::new(
                UnitQuaternion::from_euler_angles(0.0, 0.0, yaw),
                Vector3::new(x, 0.0, 0.0),
            ),
            cloud: corner_cloud(),
        }
    }

    /// A 15 × 10 wall at body-frame `x = -d`.
    fn x_wall(stamp_ns: u64, d: f64) -> SegmentedPlanes {
        let normal = Vector3::x();
        let mut points = Vec::new();
        for i in 0..15 {
            for j in 0..10 {
                points.push(SegmentedPoint {
                    position: Vector3::new(-d, i as f64 * 0.2, j as f64 * 0.2),
                    normal,
                    curvature: d,
                });
            }
        }
        SegmentedPlanes {
            stamp_ns,
            segments: vec![PlaneSegment { points }],
        }
    }

    fn orchestrator(config: SlamConfig) -> GraphOrchestrator {
        GraphOrchestrator::new(config)
    }

    fn counts(orchestrator: &GraphOrchestrator) -> (usize, usize) {
        orchestrator.with_state(|s| (s.graph.num_nodes(), s.graph.num_edges()))
    }

    #[test]
    fn test_odometry_edge_is_relative_odom() {
        let orch = orchestrator(SlamConfig::default());
        let a = odometry(0, 0.0, 0.0);
        let b = odometry(SEC, 3.0, 0.4);
        let (a_odom, b_odom) = (a.odom, b.odom);
        assert!(orch.on_odometry(a));
        assert!(orch.on_odometry(b));

        assert!(orch.optimization_cycle());

        orch.with_state(|s| {
            assert_eq!(s.keyframes.len(), 2);
            assert_eq!(s.committed, 2);
            let edges: Vec<_> = s.graph.edges().collect();
            assert_eq!(edges.len(), 1);
            assert_eq!(edges[0].nodes, vec![s.keyframes[1].node.unwrap(), s.keyframes[0].node.unwrap()]);
            let EdgeKind::Se3 { measurement } = &edges[0].kind else {
                panic!("expected an odometry edge");
            };
            let expected = b_odom.inverse().compose(&a_odom);
            assert_relative_eq!(measurement.translation, expected.translation, epsilon = 1e-12);
            assert!(measurement.rotation.angle_to(&expected.rotation) < 1e-9);
        });
        assert_eq!(orch.snapshot().len(), 2);
    }

    #[test]
    fn test_empty_cycle_changes_nothing() {
        let orch = orchestrator(SlamConfig::default());
        assert!(!orch.optimization_cycle());
        assert_eq!(counts(&orch), (0, 0));

        orch.on_odometry(odometry(0, 0.0, 0.0));
        assert!(orch.optimization_cycle());
        let before = counts(&orch);
        let snapshot = orch.snapshot();
        let correction = orch.odom2map();

        assert!(!orch.optimization_cycle());
        assert_eq!(counts(&orch), before);
        assert!(Arc::ptr_eq(&snapshot, &orch.snapshot()));
        assert_eq!(orch.odom2map(), correction);
    }

    #[test]
    fn test_first_node_is_anchored() {
        let mut config = SlamConfig::default();
        config.graph.fix_first_node = true;
        let orch = orchestrator(config);
        orch.on_odometry(odometry(0, 0.0, 0.0));
        assert!(orch.optimization_cycle());

        orch.with_state(|s| {
            let anchor = s.anchor_node.unwrap();
            assert!(s.graph.node(anchor).unwrap().fixed);
            assert_eq!(s.graph.num_nodes(), 2);
            let edge = s.graph.edge(s.anchor_edge.unwrap()).unwrap();
            assert_eq!(edge.nodes, vec![anchor, s.keyframes[0].node.unwrap()]);
        });
    }

    #[test]
    fn test_keyframe_batch_is_capped() {
        let mut config = SlamConfig::default();
        config.graph.max_keyframes_per_update = 2;
        let orch = orchestrator(config);
        for i in 0..3 {
            assert!(orch.on_odometry(odometry(i * SEC, i as f64 * 3.0, 0.0)));
        }

        assert!(orch.optimization_cycle());
        assert_eq!(orch.with_state(|s| s.keyframes.len()), 2);
        assert_eq!(orch.queues.keyframes.lock().len(), 1);
        assert_eq!(orch.read_until(), SEC + READ_AHEAD_NS);

        assert!(orch.optimization_cycle());
        assert_eq!(orch.with_state(|s| s.keyframes.len()), 3);
    }

    #[test]
    fn test_rejected_odometry_advances_watermark() {
        let orch = orchestrator(SlamConfig::default());
        assert!(orch.on_odometry(odometry(0, 0.0, 0.0)));
        orch.optimization_cycle();
        assert!(!orch.on_odometry(odometry(5 * SEC, 0.5, 0.0)));
        assert_eq!(orch.read_until(), 5 * SEC + READ_AHEAD_NS);
    }

    #[test]
    fn test_gps_fixes_become_priors() {
        let orch = orchestrator(SlamConfig::default());
        orch.on_odometry(odometry(SEC, 0.0, 0.0));
        orch.on_odometry(odometry(10 * SEC, 3.0, 0.0));
        orch.optimization_cycle();

        orch.on_gps(GpsFix {
            stamp_ns: SEC - SEC / 20,
            utm: Vector3::new(500.0, 300.0, 20.0),
        });
        orch.on_gps(GpsFix {
            stamp_ns: 10 * SEC + SEC / 10,
            utm: Vector3::new(503.0, 300.0, f64::NAN),
        });
        assert!(orch.optimization_cycle());

        orch.with_state(|s| {
            assert_eq!(s.zero_utm.unwrap().xy(), nalgebra::Vector2::new(500.0, 300.0));
            assert_eq!(s.keyframes[0].utm_coord, Some(Vector3::zeros()));
            let second = s.keyframes[1].utm_coord.unwrap();
            assert_relative_eq!(second.x, 3.0);
            assert!(second.z.is_nan());
            let names: Vec<_> = s.graph.edges().map(|e| e.kind.name()).collect();
            assert!(names.contains(&"prior_xyz"));
            assert!(names.contains(&"prior_xy"));
        });
        // fixes after the latest keyframe stay queued
        assert_eq!(orch.queues.gps.lock().len(), 1);
    }

    #[test]
    fn test_gps_outside_window_is_dropped() {
        let orch = orchestrator(SlamConfig::default());
        orch.on_odometry(odometry(SEC, 0.0, 0.0));
        orch.optimization_cycle();
        orch.on_gps(GpsFix {
            stamp_ns: SEC / 2,
            utm: Vector3::zeros(),
        });
        orch.on_gps(GpsFix {
            stamp_ns: 2 * SEC,
            utm: Vector3::zeros(),
        });

        assert!(!orch.optimization_cycle());
        orch.with_state(|s| {
            assert!(s.keyframes[0].utm_coord.is_none());
            assert!(s.zero_utm.is_none());
        });
    }

    #[test]
    fn test_imu_without_transform_aborts_flush() {
        let mut config = SlamConfig::default();
        config.graph.enable_imu_orientation = true;
        let orch = orchestrator(config);
        orch.on_odometry(odometry(0, 0.0, 0.0));
        orch.optimization_cycle();
        let before = counts(&orch);

        orch.on_imu(ImuSample {
            stamp_ns: 0,
            frame_id: "imu_link".to_string(),
            orientation: UnitQuaternion::identity(),
            acceleration: Vector3::new(0.0, 0.0, 9.81),
        });
        assert!(!orch.optimization_cycle());
        assert_eq!(counts(&orch), before);
    }

    #[test]
    fn test_imu_transform_failure_keeps_earlier_priors() {
        let mut config = SlamConfig::default();
        config.graph.enable_imu_orientation = true;
        let orch = orchestrator(config).with_frame_transformer(Box::new(
            StaticFrameTransformer::new("base_link")
                .with_frame("imu_link", UnitQuaternion::identity()),
        ));
        orch.on_odometry(odometry(0, 0.0, 0.0));
        orch.on_odometry(odometry(SEC, 3.0, 0.0));
        orch.optimization_cycle();

        for (stamp_ns, frame_id) in [(0, "imu_link"), (SEC, "unknown_link")] {
            orch.on_imu(ImuSample {
                stamp_ns,
                frame_id: frame_id.to_string(),
                orientation: UnitQuaternion::identity(),
                acceleration: Vector3::new(0.0, 0.0, 9.81),
            });
        }
        assert!(orch.optimization_cycle());

        orch.with_state(|s| {
            assert!(s.keyframes[0].orientation.is_some());
            assert!(s.keyframes[1].orientation.is_none());
            assert!(s.graph.edges().any(|e| e.kind.name() == "prior_quat"));
        });
        assert_eq!(orch.queues.imu.lock().len(), 2);
    }

    #[test]
    fn test_imu_orientation_prior() {
        let mut config = SlamConfig::default();
        config.graph.enable_imu_orientation = true;
        config.graph.enable_imu_acceleration = true;
        let mount = UnitQuaternion::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_2);
        let orch = orchestrator(config).with_frame_transformer(Box::new(
            StaticFrameTransformer::new("base_link").with_frame("imu_link", mount),
        ));
        orch.on_odometry(odometry(0, 0.0, 0.0));
        orch.optimization_cycle();

        // w < 0 before the sign flip
        let raw = UnitQuaternion::new_unchecked(-UnitQuaternion::<f64>::identity().into_inner());
        orch.on_imu(ImuSample {
            stamp_ns: 0,
            frame_id: "imu_link".to_string(),
            orientation: raw,
            acceleration: Vector3::new(1.0, 0.0, 0.0),
        });
        assert!(orch.optimization_cycle());

        orch.with_state(|s| {
            let orientation = s.keyframes[0].orientation.unwrap();
            assert!(orientation.w >= 0.0);
            assert!(orientation.angle_to(&mount) < 1e-9);
            let acc = s.keyframes[0].acceleration.unwrap();
            assert_relative_eq!(acc, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
            let names: Vec<_> = s.graph.edges().map(|e| e.kind.name()).collect();
            assert!(names.contains(&"prior_quat"));
            assert!(names.contains(&"prior_vec"));
        });
    }

    #[test]
    fn test_floor_uses_fixed_plane() {
        let orch = orchestrator(SlamConfig::default());
        orch.on_odometry(odometry(0, 0.0, 0.0));
        orch.optimization_cycle();
        orch.on_floor(FloorCoefficients {
            stamp_ns: 0,
            coeffs: Vector4::new(0.0, 0.0, 1.0, 1.2),
        });
        orch.on_floor(FloorCoefficients {
            stamp_ns: 7,
            coeffs: Vector4::new(0.0, 0.0, 1.0, 1.2),
        });
        assert!(orch.optimization_cycle());

        orch.with_state(|s| {
            let floor = s.floor_plane_node.unwrap();
            assert!(s.graph.node(floor).unwrap().fixed);
            assert_eq!(s.graph.edges_of(floor).count(), 1);
            assert!(s.keyframes[0].floor_coeffs.is_some());
        });
        assert_eq!(orch.queues.floor.lock().len(), 1);
    }

    /// Reports a fixed number of accepted steps and counts covariance requests.
    struct CountingOptimizer {
        accepted_steps: usize,
        marginal_calls: Arc<AtomicUsize>,
    }

    impl GraphOptimizer for CountingOptimizer {
        fn optimize(&self, _graph: &mut PoseGraph, _max_iterations: usize) -> OptimizationReport {
            OptimizationReport {
                iterations: 1,
                accepted_steps: self.accepted_steps,
                ..Default::default()
            }
        }

        fn marginal_covariances(
            &self,
            _graph: &PoseGraph,
            _nodes: &[NodeId],
        ) -> Option<HashMap<NodeId, DMatrix<f64>>> {
            self.marginal_calls.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    fn covariance_refreshes(accepted_steps: usize) -> usize {
        let marginal_calls = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(SlamConfig::default()).with_optimizer(Box::new(CountingOptimizer {
            accepted_steps,
            marginal_calls: Arc::clone(&marginal_calls),
        }));
        orch.on_odometry(odometry(0, 0.0, 0.0));
        orch.optimization_cycle();
        orch.on_segmented_planes(x_wall(0, -5.0));
        assert!(orch.optimization_cycle());
        assert_eq!(orch.with_state(|s| s.graph.planes().len()), 1);
        marginal_calls.load(Ordering::SeqCst)
    }

    #[test]
    fn test_converged_optimization_skips_covariance_refresh() {
        assert_eq!(covariance_refreshes(0), 0);
        assert!(covariance_refreshes(3) > 0);
    }

    #[test]
    fn test_segmented_planes_survive_singular_covariance() {
        let orch = orchestrator(SlamConfig::default());
        orch.on_odometry(odometry(0, 0.0, 0.0));
        orch.on_odometry(odometry(SEC, 3.0, 0.0));
        orch.optimization_cycle();

        orch.on_segmented_planes(x_wall(0, -5.0));
        assert!(orch.optimization_cycle());
        let plane = orch.with_state(|s| {
            assert_eq!(s.graph.planes().len(), 1);
            assert_eq!(s.keyframes[0].plane_segments.len(), 1);
            s.graph.planes().iter().next().unwrap().id
        });
        assert_eq!(orch.plane_cloud(0.0).len(), 150);

        orch.shared.main.lock().graph.planes_mut().get_mut(plane).unwrap().covariance =
            Matrix3::zeros();

        // same wall, seen from the second keyframe
        orch.on_segmented_planes(x_wall(SEC, -2.0));
        assert!(orch.optimization_cycle());
        orch.with_state(|s| {
            assert_eq!(s.graph.planes().len(), 1);
            assert_eq!(s.graph.planes().get(plane).unwrap().observations.len(), 2);
        });
    }

    #[test]
    fn test_static_transformer() {
        let mount = UnitQuaternion::from_euler_angles(0.1, 0.0, 0.0);
        let tf = StaticFrameTransformer::new("base").with_frame("imu", mount);
        assert!(tf.rotation("imu", "base").unwrap().angle_to(&mount) < 1e-12);
        assert!(tf.rotation("base", "imu").unwrap().angle_to(&mount.inverse()) < 1e-12);
        assert!(tf.rotation("lidar", "base").is_err());
    }
}

//! State shared between sensor producers and the periodic workers.
//!
//! The `SharedState` struct holds everything more than one thread touches.
//! Graph mutation happens only under `main`; the snapshot, map cloud and
//! odom→map correction each have their own small lock so readers never wait
//! on an optimization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use nalgebra::Vector3;
use parking_lot::Mutex;

use crate::geometry::SE3;
use crate::graph::{EdgeId, NodeId, PoseGraph};
use crate::keyframe::{Keyframe, KeyframeSnapshot, PointCloud};
use crate::loop_closing::LoopDetector;

/// Everything guarded by the main lock.
pub struct GraphState {
    pub graph: PoseGraph,
    /// Flushed keyframes; entries from `committed` on have not been through
    /// loop detection yet.
    pub keyframes: Vec<Keyframe>,
    pub committed: usize,
    /// Keyframe index by stamp.
    pub keyframe_index: HashMap<u64, usize>,
    pub anchor_node: Option<NodeId>,
    pub anchor_edge: Option<EdgeId>,
    pub floor_plane_node: Option<NodeId>,
    /// First GPS fix; every later fix is stored relative to it.
    pub zero_utm: Option<Vector3<f64>>,
    pub loop_detector: Box<dyn LoopDetector>,
}

impl GraphState {
    pub fn new(loop_detector: Box<dyn LoopDetector>) -> Self {
        Self {
            graph: PoseGraph::new(),
            keyframes: Vec::new(),
            committed: 0,
            keyframe_index: HashMap::new(),
            anchor_node: None,
            anchor_edge: None,
            floor_plane_node: None,
            zero_utm: None,
            loop_detector,
        }
    }

    pub fn committed_keyframes(&self) -> &[Keyframe] {
        &self.keyframes[..self.committed]
    }

    /// Latest committed keyframe.
    pub fn latest_committed(&self) -> Option<&Keyframe> {
        self.committed_keyframes().last()
    }

    pub fn push_keyframe(&mut self, keyframe: Keyframe) {
        self.keyframe_index.insert(keyframe.stamp_ns, self.keyframes.len());
        self.keyframes.push(keyframe);
    }
}

/// Shared state accessible from producers and both worker threads.
pub struct SharedState {
    pub main: Mutex<GraphState>,
    pub snapshot: Mutex<Arc<Vec<KeyframeSnapshot>>>,
    pub map_cloud: Mutex<Option<Arc<PointCloud>>>,
    pub odom2map: Mutex<SE3>,

    /// Set by each successful cycle, cleared when a map cloud is rendered.
    pub graph_updated: AtomicBool,

    /// Upstream may discard buffered data stamped before this.
    pub read_until_ns: AtomicU64,

    /// Newest odometry stamp seen by the producer.
    pub latest_stamp_ns: AtomicU64,

    pub shutdown_requested: AtomicBool,
}

impl SharedState {
    pub fn new(loop_detector: Box<dyn LoopDetector>) -> Arc<Self> {
        Arc::new(Self {
            main: Mutex::new(GraphState::new(loop_detector)),
            snapshot: Mutex::new(Arc::new(Vec::new())),
            map_cloud: Mutex::new(None),
            odom2map: Mutex::new(SE3::identity()),
            graph_updated: AtomicBool::new(false),
            read_until_ns: AtomicU64::new(0),
            latest_stamp_ns: AtomicU64::new(0),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    pub fn read_until(&self) -> u64 {
        self.read_until_ns.load(Ordering::SeqCst)
    }

    pub fn set_read_until(&self, stamp_ns: u64) {
        self.read_until_ns.store(stamp_ns, Ordering::SeqCst);
    }

    /// Clear the update flag, returning whether it was set.
    pub fn take_graph_updated(&self) -> bool {
        self.graph_updated.swap(false, Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

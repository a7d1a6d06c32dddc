//! Graph orchestration and thread management.
//!
//! This module contains the `GraphOrchestrator` that turns queued sensor
//! data into graph structure, the top-level `SlamSystem` that drives it
//! periodically, and the shared state both of them work on.

mod flush;
pub mod messages;
pub mod orchestrator;
pub mod queues;
pub mod shared_state;
mod slam_system;

pub use messages::{FloorCoefficients, GpsFix, ImuSample, OdometryCloud, SegmentedPlanes};
pub use orchestrator::{
    FrameTransformer, GraphOrchestrator, OrchestratorConfig, RobustKernelConfig,
    StaticFrameTransformer,
};
pub use shared_state::{GraphState, SharedState};
pub use slam_system::SlamSystem;

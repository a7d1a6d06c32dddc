//! Corridors and rooms inferred from pairs of opposing walls.
//!
//! Candidates flow through three stages each flush: walls long enough to
//! bound a structure are collected, opposing same-axis walls are paired and
//! scored, and the best pairing is associated with an existing structure or
//! committed as a new node. Rejections are silent; the next flush retries
//! with fresh observations.

pub mod candidates;
pub mod corridor;
pub mod room;

use serde::{Deserialize, Serialize};

use crate::graph::NodeId;
use crate::planes::PlaneClass;

pub use candidates::{plane_length, PlaneCandidate, StructureCandidates, StructurePair};
pub use corridor::{CorridorConfig, CorridorMapper};
pub use room::{RoomConfig, RoomMapper};

/// A corridor node and the two walls that first bounded it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Corridor {
    pub id: NodeId,
    pub axis: PlaneClass,
    pub plane1: NodeId,
    pub plane2: NodeId,
}

/// A room node and its bounding wall pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: NodeId,
    pub x_planes: [NodeId; 2],
    pub y_planes: [NodeId; 2],
}

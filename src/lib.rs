pub mod error;
pub mod geometry;
pub mod graph;
pub mod io;
pub mod keyframe;
pub mod loop_closing;
pub mod optimizer;
pub mod planes;
pub mod structures;
pub mod system;

//! File formats: configuration, graph dumps, map clouds and replay logs.

pub mod config;
pub mod dump;
pub mod map_cloud;
pub mod replay;

pub use config::SlamConfig;
pub use replay::{OdometryEntry, OdometryLog};

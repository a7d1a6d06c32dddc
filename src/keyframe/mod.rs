//! Keyframes, their point data, and the policies that create and weight them.

pub mod information;
pub mod keyframe;
pub mod point_cloud;
pub mod updater;

pub use information::{
    fitness_score, indexed_fitness_score, FitnessInformationCalculator, InformationConfig,
    InformationMatrixCalculator,
};
pub use keyframe::{Keyframe, KeyframeSnapshot};
pub use point_cloud::{PlaneSegment, PointCloud, PointIndex, SegmentedPoint};
pub use updater::{KeyframeUpdater, KeyframeUpdaterConfig, MotionKeyframeUpdater};

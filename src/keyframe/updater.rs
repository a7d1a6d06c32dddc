//! Keyframe acceptance based on travelled distance and rotation.

use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

/// Decides which odometry samples become keyframes.
pub trait KeyframeUpdater: Send {
    /// Returns true if `pose` should become a keyframe.
    fn update(&mut self, pose: &SE3) -> bool;

    /// Distance travelled between accepted keyframes so far.
    fn accum_distance(&self) -> f64;
}

/// Thresholds for [`MotionKeyframeUpdater`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyframeUpdaterConfig {
    /// Minimum translation (m) since the last keyframe.
    pub keyframe_delta_trans: f64,
    /// Minimum rotation (rad) since the last keyframe.
    pub keyframe_delta_angle: f64,
}

impl Default for KeyframeUpdaterConfig {
    fn default() -> Self {
        Self {
            keyframe_delta_trans: 2.0,
            keyframe_delta_angle: 2.0,
        }
    }
}

/// Accepts a keyframe once translation or rotation since the previous one
/// exceeds its threshold. The first pose is always accepted.
#[derive(Debug, Clone)]
pub struct MotionKeyframeUpdater {
    config: KeyframeUpdaterConfig,
    prev_pose: Option<SE3>,
    accum_distance: f64,
}

impl MotionKeyframeUpdater {
    pub fn new(config: KeyframeUpdaterConfig) -> Self {
        Self {
            config,
            prev_pose: None,
            accum_distance: 0.0,
        }
    }
}

impl KeyframeUpdater for MotionKeyframeUpdater {
    fn update(&mut self, pose: &SE3) -> bool {
        let Some(prev) = self.prev_pose else {
            self.prev_pose = Some(*pose);
            return true;
        };

        let delta = prev.inverse() * *pose;
        let dx = delta.translation.norm();
        let da = delta.angle();

        // Too close to the previous keyframe
        if dx < self.config.keyframe_delta_trans && da < self.config.keyframe_delta_angle {
            return false;
        }

        self.accum_distance += dx;
        self.prev_pose = Some(*pose);
        true
    }

    fn accum_distance(&self) -> f64 {
        self.accum_distance
    }
}

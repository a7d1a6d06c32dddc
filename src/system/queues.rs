//! Per-stream input queues, each behind its own lock.
//!
//! Producers only ever append; the optimization cycle drains.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::keyframe::Keyframe;

use super::messages::{FloorCoefficients, GpsFix, ImuSample, SegmentedPlanes};

/// Largest stamp difference accepted when matching a prior to a keyframe.
pub const MATCH_WINDOW_NS: u64 = 200_000_000;

#[derive(Debug, Default)]
pub struct SensorQueues {
    pub keyframes: Mutex<VecDeque<Keyframe>>,
    pub floor: Mutex<VecDeque<FloorCoefficients>>,
    pub gps: Mutex<VecDeque<GpsFix>>,
    pub imu: Mutex<VecDeque<ImuSample>>,
    pub segmented: Mutex<VecDeque<SegmentedPlanes>>,
}

impl SensorQueues {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Something carrying a sensor stamp.
pub trait Stamped {
    fn stamp_ns(&self) -> u64;
}

impl Stamped for GpsFix {
    fn stamp_ns(&self) -> u64 {
        self.stamp_ns
    }
}

impl Stamped for ImuSample {
    fn stamp_ns(&self) -> u64 {
        self.stamp_ns
    }
}

impl Stamped for FloorCoefficients {
    fn stamp_ns(&self) -> u64 {
        self.stamp_ns
    }
}

impl Stamped for SegmentedPlanes {
    fn stamp_ns(&self) -> u64 {
        self.stamp_ns
    }
}

/// Scan forward from `cursor` for the entry closest to `stamp_ns`.
///
/// The queue is time ordered, so the scan stops as soon as the gap starts
/// growing. Returns the index of the closest entry.
pub fn closest_from<T: Stamped>(queue: &VecDeque<T>, cursor: usize, stamp_ns: u64) -> Option<usize> {
    let mut closest = cursor;
    let gap = |i: usize| queue[i].stamp_ns().abs_diff(stamp_ns);
    if closest >= queue.len() {
        return None;
    }
    for i in cursor + 1..queue.len() {
        if gap(closest) < gap(i) {
            break;
        }
        closest = i;
    }
    Some(closest)
}

/// Drop every entry stamped at or before `stamp_ns`.
pub fn drain_through<T: Stamped>(queue: &mut VecDeque<T>, stamp_ns: u64) {
    let keep_from = queue.partition_point(|m| m.stamp_ns() <= stamp_ns);
    queue.drain(..keep_from);
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn fixes(stamps: &[u64]) -> VecDeque<GpsFix> {
        stamps
            .iter()
            .map(|&stamp_ns| GpsFix {
                stamp_ns,
                utm: Vector3::zeros(),
            })
            .collect()
    }

    #[test]
    fn test_closest_stops_when_gap_grows() {
        let queue = fixes(&[100, 200, 300, 400]);
        assert_eq!(closest_from(&queue, 0, 290), Some(2));
        assert_eq!(closest_from(&queue, 0, 0), Some(0));
        assert_eq!(closest_from(&queue, 3, 100), Some(3));
        assert_eq!(closest_from(&queue, 4, 100), None);
    }

    #[test]
    fn test_drain_through_keeps_later_entries() {
        let mut queue = fixes(&[100, 200, 300]);
        drain_through(&mut queue, 200);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].stamp_ns, 300);
    }
}

//! Queue flushes run at the start of each optimization cycle.
//!
//! Each flush reports whether it changed the graph. GPS, IMU and floor
//! priors attach only to keyframes committed by an earlier cycle.

use nalgebra::{DMatrix, Matrix2, Matrix3, UnitQuaternion, Vector3, Vector4};
use tracing::{debug, warn};

use crate::error::Result;
use crate::geometry::{Plane3D, SE3};
use crate::graph::{NodeId, PoseGraph};
use crate::planes::{ObservedPlane, PlaneClass};
use crate::structures::StructureCandidates;

use super::orchestrator::{GraphOrchestrator, RobustKernelConfig, READ_AHEAD_NS};
use super::queues::{closest_from, drain_through, MATCH_WINDOW_NS};
use super::shared_state::GraphState;

impl GraphOrchestrator {
    /// Turn up to `max_keyframes_per_update` queued keyframes into pose nodes
    /// chained by odometry edges.
    pub(super) fn flush_keyframe_queue(&self, state: &mut GraphState) -> bool {
        let mut queue = self.queues.keyframes.lock();
        if queue.is_empty() {
            return false;
        }

        let odom2map = *self.shared.odom2map.lock();
        let count = queue.len().min(self.config.graph.max_keyframes_per_update);
        let mut last_stamp = 0;

        for mut keyframe in queue.drain(..count) {
            let node = state.graph.add_se3_node(odom2map.compose(&keyframe.odom));
            keyframe.node = Some(node);
            last_stamp = keyframe.stamp_ns;

            let previous = state
                .keyframes
                .last()
                .and_then(|prev| Some((prev.node?, prev.odom, prev.cloud.clone())));
            let added = match previous {
                Some((prev_node, prev_odom, prev_cloud)) => {
                    let relative = keyframe.odom.inverse().compose(&prev_odom);
                    let information =
                        self.information
                            .information_matrix(&keyframe.cloud, &prev_cloud, &relative);
                    let kernel = &self.config.graph.odometry_edge_robust_kernel;
                    state
                        .graph
                        .add_se3_edge(node, prev_node, relative, information)
                        .and_then(|edge| add_kernel(&mut state.graph, edge, kernel))
                }
                None if self.config.graph.fix_first_node => self.add_anchor(state, node),
                None => Ok(()),
            };
            if let Err(err) = added {
                warn!("Keyframe {} edge not added: {}", keyframe.id, err);
            }

            state.push_keyframe(keyframe);
        }

        self.shared.set_read_until(last_stamp + READ_AHEAD_NS);
        debug!("Flushed {} keyframes, {} still queued", count, queue.len());
        true
    }

    /// Fixed identity node tied to the first keyframe.
    fn add_anchor(&self, state: &mut GraphState, first: NodeId) -> Result<()> {
        let anchor = state.graph.add_se3_node(SE3::identity());
        state.graph.set_fixed(anchor, true)?;

        let stddev = &self.config.graph.fix_first_node_stddev;
        let mut information = DMatrix::identity(6, 6);
        for (i, s) in stddev.iter().enumerate() {
            information[(i, i)] = 1.0 / s;
        }
        let edge = state
            .graph
            .add_se3_edge(anchor, first, SE3::identity(), information)?;

        state.anchor_node = Some(anchor);
        state.anchor_edge = Some(edge);
        Ok(())
    }

    /// Attach floor observations to keyframes with the same stamp.
    pub(super) fn flush_floor_queue(&self, state: &mut GraphState) -> bool {
        let mut queue = self.queues.floor.lock();
        let Some(latest) = state.latest_committed().map(|k| k.stamp_ns) else {
            return false;
        };

        let mut updated = false;
        for msg in queue.iter() {
            if msg.stamp_ns > latest {
                break;
            }
            let Some(&index) = state.keyframe_index.get(&msg.stamp_ns) else {
                continue;
            };
            let Some(node) = state.keyframes[index].node else {
                continue;
            };

            match self.add_floor_edge(state, node, &msg.coeffs) {
                Ok(()) => {
                    state.keyframes[index].floor_coeffs = Some(msg.coeffs);
                    updated = true;
                }
                Err(err) => warn!("Floor edge not added: {}", err),
            }
        }

        drain_through(&mut *queue, latest);
        updated
    }

    fn add_floor_edge(&self, state: &mut GraphState, node: NodeId, coeffs: &Vector4<f64>) -> Result<()> {
        let floor = match state.floor_plane_node {
            Some(floor) => floor,
            None => {
                let floor = state
                    .graph
                    .add_plane_node(Plane3D::new(Vector4::new(0.0, 0.0, 1.0, 0.0)));
                state.graph.set_fixed(floor, true)?;
                state.floor_plane_node = Some(floor);
                floor
            }
        };

        let cfg = &self.config.graph;
        let information = Matrix3::identity() * (1.0 / cfg.floor_edge_stddev);
        let edge = state
            .graph
            .add_se3_plane_edge(node, floor, Plane3D::new(*coeffs), information)?;
        add_kernel(&mut state.graph, edge, &cfg.floor_edge_robust_kernel)
    }

    /// Match committed keyframes to the closest GPS fix within the window.
    pub(super) fn flush_gps_queue(&self, state: &mut GraphState) -> bool {
        let mut queue = self.queues.gps.lock();
        let Some(last_fix) = queue.back().map(|f| f.stamp_ns) else {
            return false;
        };
        if state.committed == 0 {
            return false;
        }

        let mut cursor = 0;
        let mut updated = false;
        for index in 0..state.committed {
            let keyframe = &state.keyframes[index];
            let stamp = keyframe.stamp_ns;
            if stamp > last_fix {
                break;
            }
            if stamp < queue[cursor].stamp_ns || keyframe.utm_coord.is_some() {
                continue;
            }
            let Some(node) = keyframe.node else {
                continue;
            };
            let Some(closest) = closest_from(&*queue, cursor, stamp) else {
                break;
            };
            cursor = closest;
            if queue[closest].stamp_ns.abs_diff(stamp) > MATCH_WINDOW_NS {
                continue;
            }

            let utm = queue[closest].utm;
            let zero = *state.zero_utm.get_or_insert(utm);
            let xyz = utm - zero;
            state.keyframes[index].utm_coord = Some(xyz);

            match self.add_gps_edge(&mut state.graph, node, &xyz) {
                Ok(()) => updated = true,
                Err(err) => warn!("GPS edge not added: {}", err),
            }
        }

        if let Some(latest) = state.latest_committed().map(|k| k.stamp_ns) {
            drain_through(&mut *queue, latest);
        }
        updated
    }

    fn add_gps_edge(&self, graph: &mut PoseGraph, node: NodeId, xyz: &Vector3<f64>) -> Result<()> {
        let cfg = &self.config.graph;
        let edge = if xyz.z.is_nan() {
            let information = Matrix2::identity() / cfg.gps_edge_stddev_xy;
            graph.add_se3_prior_xy_edge(node, xyz.xy(), information)?
        } else {
            let information = Matrix3::from_diagonal(&Vector3::new(
                1.0 / cfg.gps_edge_stddev_xy,
                1.0 / cfg.gps_edge_stddev_xy,
                1.0 / cfg.gps_edge_stddev_z,
            ));
            graph.add_se3_prior_xyz_edge(node, *xyz, information)?
        };
        add_kernel(graph, edge, &cfg.gps_edge_robust_kernel)
    }

    /// Match committed keyframes to IMU samples, rotate them into the base
    /// frame and add the enabled priors.
    ///
    /// A missing frame transform stops the flush and leaves the queue as is.
    /// Keyframes matched before the failing sample keep their priors.
    pub(super) fn flush_imu_queue(&self, state: &mut GraphState) -> bool {
        let mut queue = self.queues.imu.lock();
        let Some(last_sample) = queue.back().map(|s| s.stamp_ns) else {
            return false;
        };
        if state.committed == 0 {
            return false;
        }

        let cfg = &self.config.graph;
        let mut cursor = 0;
        let mut updated = false;
        for index in 0..state.committed {
            let keyframe = &state.keyframes[index];
            let stamp = keyframe.stamp_ns;
            if stamp > last_sample {
                break;
            }
            if stamp < queue[cursor].stamp_ns || keyframe.acceleration.is_some() {
                continue;
            }
            let Some(node) = keyframe.node else {
                continue;
            };
            let Some(closest) = closest_from(&*queue, cursor, stamp) else {
                break;
            };
            cursor = closest;
            let sample = &queue[closest];
            if sample.stamp_ns.abs_diff(stamp) > MATCH_WINDOW_NS {
                continue;
            }

            let rotation = match self.transformer.rotation(&sample.frame_id, &cfg.base_frame_id) {
                Ok(rotation) => rotation,
                Err(err) => {
                    warn!("IMU flush aborted: {}", err);
                    return updated;
                }
            };

            let mut orientation = rotation * sample.orientation;
            if orientation.w < 0.0 {
                orientation = UnitQuaternion::new_unchecked(-orientation.into_inner());
            }
            let acceleration = rotation * sample.acceleration;

            let keyframe = &mut state.keyframes[index];
            keyframe.orientation = Some(orientation);
            keyframe.acceleration = Some(acceleration);

            if let Err(err) = self.add_imu_edges(&mut state.graph, node, orientation, acceleration) {
                warn!("IMU edge not added: {}", err);
            }
            updated = true;
        }

        if let Some(latest) = state.latest_committed().map(|k| k.stamp_ns) {
            drain_through(&mut *queue, latest);
        }
        updated
    }

    fn add_imu_edges(
        &self,
        graph: &mut PoseGraph,
        node: NodeId,
        orientation: UnitQuaternion<f64>,
        acceleration: Vector3<f64>,
    ) -> Result<()> {
        let cfg = &self.config.graph;
        if cfg.enable_imu_orientation {
            let information = Matrix3::identity() / cfg.imu_orientation_edge_stddev;
            let edge = graph.add_se3_prior_quat_edge(node, orientation, information)?;
            add_kernel(graph, edge, &cfg.imu_orientation_edge_robust_kernel)?;
        }
        if cfg.enable_imu_acceleration {
            let information = Matrix3::identity() / cfg.imu_acceleration_edge_stddev;
            let down = Vector3::new(0.0, 0.0, -1.0);
            let edge = graph.add_se3_prior_vec_edge(node, down, acceleration, information)?;
            add_kernel(graph, edge, &cfg.imu_acceleration_edge_robust_kernel)?;
        }
        Ok(())
    }

    /// Map segmented planes onto their keyframes and infer structures from
    /// each batch.
    pub(super) fn flush_segmented_queue(&self, state: &mut GraphState) -> bool {
        let mut queue = self.queues.segmented.lock();
        let Some(latest) = state.latest_committed().map(|k| k.stamp_ns) else {
            return false;
        };

        let min_points = self.plane_mapper.config().min_plane_points;
        let mut updated = false;
        for msg in queue.iter() {
            if msg.stamp_ns > latest {
                break;
            }
            let Some(&index) = state.keyframe_index.get(&msg.stamp_ns) else {
                continue;
            };
            let Some(node) = state.keyframes[index].node else {
                continue;
            };

            let observed = match self
                .plane_mapper
                .map_extracted_planes(&mut state.graph, node, &msg.segments)
            {
                Ok(observed) => observed,
                Err(err) => {
                    warn!("Plane mapping failed for keyframe {}: {}", state.keyframes[index].id, err);
                    continue;
                }
            };
            state.keyframes[index].plane_segments.extend(
                msg.segments
                    .iter()
                    .filter(|s| s.len() >= min_points)
                    .cloned(),
            );
            if observed.is_empty() {
                continue;
            }

            updated = true;
            self.infer_structures(&mut state.graph, &observed);
        }

        drain_through(&mut *queue, latest);
        updated
    }

    fn infer_structures(&self, graph: &mut PoseGraph, observed: &[ObservedPlane]) {
        let corridor = self.corridor_mapper.config();
        let room = self.room_mapper.config();
        if !corridor.use_corridor_constraint && !room.use_room_constraint {
            return;
        }

        let candidates = StructureCandidates::collect(
            observed,
            corridor.corridor_min_plane_length,
            room.room_min_plane_length,
            room.room_max_plane_length,
        );
        if candidates.is_empty() {
            return;
        }

        if corridor.use_corridor_constraint {
            for axis in [PlaneClass::X, PlaneClass::Y] {
                if let Err(err) =
                    self.corridor_mapper
                        .map_corridors(graph, axis, candidates.corridor(axis))
                {
                    warn!("Corridor inference failed: {}", err);
                }
            }
        }
        if room.use_room_constraint {
            if let Err(err) =
                self.room_mapper
                    .map_rooms(graph, &candidates.x_room, &candidates.y_room)
            {
                warn!("Room inference failed: {}", err);
            }
        }
    }
}

fn add_kernel(graph: &mut PoseGraph, edge: crate::graph::EdgeId, kernel: &RobustKernelConfig) -> Result<()> {
    graph.add_robust_kernel(edge, &kernel.kernel, kernel.size)
}

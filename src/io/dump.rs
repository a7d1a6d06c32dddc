//! Graph dump directory.
//!
//! Layout:
//! ```text
//! <dir>/graph.json           graph checkpoint
//! <dir>/NNNNNN/data.json     keyframe stamp, estimate, odometry and priors
//! <dir>/NNNNNN/cloud.csv     keyframe scan, one x,y,z row per point
//! <dir>/planes.csv           plane id, class, coefficients, support size
//! <dir>/zero_utm             first GPS fix, when one was received
//! <dir>/special_nodes.csv    anchor node, anchor edge, floor node (-1 when absent)
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use nalgebra::{UnitQuaternion, Vector3, Vector4};
use serde::Serialize;

use crate::geometry::SE3;
use crate::graph::KeyframeId;
use crate::keyframe::{Keyframe, PointCloud};
use crate::system::GraphState;

#[derive(Serialize)]
struct KeyframeRecord<'a> {
    id: KeyframeId,
    stamp_ns: u64,
    estimate: Option<SE3>,
    odom: &'a SE3,
    accum_distance: f64,
    node: Option<u64>,
    utm_coord: Option<&'a Vector3<f64>>,
    orientation: Option<&'a UnitQuaternion<f64>>,
    acceleration: Option<&'a Vector3<f64>>,
    floor_coeffs: Option<&'a Vector4<f64>>,
    num_plane_segments: usize,
}

/// Write the whole graph state under `directory`.
pub fn dump_graph(directory: &Path, state: &GraphState) -> Result<()> {
    fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create {}", directory.display()))?;

    state
        .graph
        .save(&directory.join("graph.json"))
        .context("Failed to write graph checkpoint")?;

    for (index, keyframe) in state.keyframes.iter().enumerate() {
        let kf_dir = directory.join(format!("{:06}", index));
        dump_keyframe(&kf_dir, keyframe, state)
            .with_context(|| format!("Failed to dump keyframe {}", keyframe.id))?;
    }

    dump_planes(&directory.join("planes.csv"), state)?;

    if let Some(zero) = &state.zero_utm {
        fs::write(
            directory.join("zero_utm"),
            format!("{} {} {}\n", zero.x, zero.y, zero.z),
        )
        .context("Failed to write zero_utm")?;
    }

    let id_or_none = |id: Option<u64>| id.map_or(-1, |id| id as i64);
    fs::write(
        directory.join("special_nodes.csv"),
        format!(
            "anchor_node {}\nanchor_edge {}\nfloor_node {}\n",
            id_or_none(state.anchor_node.map(|n| n.0)),
            id_or_none(state.anchor_edge.map(|e| e.0)),
            id_or_none(state.floor_plane_node.map(|n| n.0)),
        ),
    )
    .context("Failed to write special_nodes.csv")?;

    Ok(())
}

fn dump_keyframe(directory: &Path, keyframe: &Keyframe, state: &GraphState) -> Result<()> {
    fs::create_dir_all(directory)?;

    let record = KeyframeRecord {
        id: keyframe.id,
        stamp_ns: keyframe.stamp_ns,
        estimate: keyframe.estimate(&state.graph),
        odom: &keyframe.odom,
        accum_distance: keyframe.accum_distance,
        node: keyframe.node.map(|n| n.0),
        utm_coord: keyframe.utm_coord.as_ref(),
        orientation: keyframe.orientation.as_ref(),
        acceleration: keyframe.acceleration.as_ref(),
        floor_coeffs: keyframe.floor_coeffs.as_ref(),
        num_plane_segments: keyframe.plane_segments.len(),
    };
    let writer = BufWriter::new(File::create(directory.join("data.json"))?);
    serde_json::to_writer_pretty(writer, &record)?;

    write_cloud_csv(&directory.join("cloud.csv"), &keyframe.cloud)
}

fn dump_planes(path: &Path, state: &GraphState) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(["id", "class", "a", "b", "c", "d", "points"])?;
    for landmark in state.graph.planes().iter() {
        let Some(plane) = state.graph.plane(landmark.id) else {
            continue;
        };
        let c = plane.coeffs();
        writer.write_record([
            landmark.id.0.to_string(),
            landmark.class.to_string(),
            c[0].to_string(),
            c[1].to_string(),
            c[2].to_string(),
            c[3].to_string(),
            landmark.num_points().to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// One `x,y,z` row per point, with a fourth `intensity` column when the
/// cloud carries one.
pub fn write_cloud_csv(path: &Path, cloud: &PointCloud) -> Result<()> {
    let mut writer = BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
    );
    for (i, p) in cloud.points.iter().enumerate() {
        if cloud.has_intensity() {
            writeln!(writer, "{},{},{},{}", p.x, p.y, p.z, cloud.intensity(i))?;
        } else {
            writeln!(writer, "{},{},{}", p.x, p.y, p.z)?;
        }
    }
    writer.flush()?;
    Ok(())
}

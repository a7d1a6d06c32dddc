//! Map cloud generation and ASCII PCD export.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use nalgebra::Vector3;

use crate::graph::PoseGraph;
use crate::keyframe::{KeyframeSnapshot, PointCloud};

/// Concatenate every snapshot cloud in the map frame and downsample it.
pub fn generate_map_cloud(snapshot: &[KeyframeSnapshot], resolution: f64) -> PointCloud {
    let mut map = PointCloud::default();
    for keyframe in snapshot {
        map.extend_from(&keyframe.cloud.transformed(&keyframe.pose));
    }
    map.voxel_downsample(resolution)
}

/// Support points of every plane under the current keyframe estimates.
pub fn plane_support_cloud(graph: &PoseGraph, resolution: f64) -> PointCloud {
    let points = graph
        .planes()
        .iter()
        .flat_map(|landmark| landmark.map_points(graph))
        .collect();
    PointCloud::new(points).voxel_downsample(resolution)
}

/// Write `cloud` as an ASCII PCD file, creating missing parent directories.
///
/// An `intensity` field is written when the cloud carries one. With
/// `zero_utm` the cloud is shifted back into UTM and the offset is also
/// written to a `.utm` file next to it.
pub fn save_map(path: &Path, cloud: &PointCloud, zero_utm: Option<&Vector3<f64>>) -> Result<()> {
    let shift = zero_utm.copied().unwrap_or_else(Vector3::zeros);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let (fields, size, kind, count) = if cloud.has_intensity() {
        ("x y z intensity", "4 4 4 4", "F F F F", "1 1 1 1")
    } else {
        ("x y z", "4 4 4", "F F F", "1 1 1")
    };
    let mut writer = BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
    );
    write!(
        writer,
        "# .PCD v0.7 - Point Cloud Data file format\n\
         VERSION 0.7\n\
         FIELDS {fields}\n\
         SIZE {size}\n\
         TYPE {kind}\n\
         COUNT {count}\n\
         WIDTH {n}\n\
         HEIGHT 1\n\
         VIEWPOINT 0 0 0 1 0 0 0\n\
         POINTS {n}\n\
         DATA ascii\n",
        n = cloud.len()
    )?;
    for (i, p) in cloud.points.iter().enumerate() {
        let q = p + shift;
        if cloud.has_intensity() {
            let intensity = cloud.intensity(i);
            writeln!(writer, "{} {} {} {}", q.x as f32, q.y as f32, q.z as f32, intensity)?;
        } else {
            writeln!(writer, "{} {} {}", q.x as f32, q.y as f32, q.z as f32)?;
        }
    }
    writer.flush()?;

    if let Some(zero) = zero_utm {
        let utm_path = path.with_extension("utm");
        fs::write(&utm_path, format!("{} {} {}\n", zero.x, zero.y, zero.z))
            .with_context(|| format!("Failed to write {}", utm_path.display()))?;
    }
    Ok(())
}

//! CSV odometry logs for offline replay.
//!
//! Odometry rows are `stamp_ns, x, y, z, qx, qy, qz, qw`; lines starting
//! with `#` are comments. Scans are optional: `<cloud_dir>/<stamp_ns>.csv`
//! holds one `x,y,z` row per point with an optional fourth intensity column,
//! the same format the dump writes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use nalgebra::Vector3;

use crate::geometry::SE3;
use crate::keyframe::PointCloud;
use crate::system::OdometryCloud;

#[derive(Debug, Clone)]
pub struct OdometryEntry {
    pub stamp_ns: u64,
    pub pose: SE3,
}

#[derive(Debug)]
pub struct OdometryLog {
    pub entries: Vec<OdometryEntry>,
    cloud_dir: Option<PathBuf>,
}

impl OdometryLog {
    pub fn new<P: AsRef<Path>>(csv_path: P, cloud_dir: Option<PathBuf>) -> Result<Self> {
        Ok(Self {
            entries: load_odometry(csv_path.as_ref())?,
            cloud_dir,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Odometry message for entry `idx`, with its scan if one exists.
    pub fn message(&self, idx: usize) -> Result<OdometryCloud> {
        let entry = self
            .entries
            .get(idx)
            .with_context(|| format!("No odometry entry at index {}", idx))?;
        let cloud = match &self.cloud_dir {
            Some(dir) => {
                let path = dir.join(format!("{}.csv", entry.stamp_ns));
                if path.exists() {
                    load_cloud(&path)?
                } else {
                    PointCloud::default()
                }
            }
            None => PointCloud::default(),
        };
        Ok(OdometryCloud {
            stamp_ns: entry.stamp_ns,
            odom: entry.pose,
            cloud,
        })
    }
}

fn load_odometry(csv_path: &Path) -> Result<Vec<OdometryEntry>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 8 {
            continue;
        }
        let stamp_ns: u64 = rec[0].trim().parse()?;
        let position = Vector3::new(
            rec[1].trim().parse()?,
            rec[2].trim().parse()?,
            rec[3].trim().parse()?,
        );
        let qx: f64 = rec[4].trim().parse()?;
        let qy: f64 = rec[5].trim().parse()?;
        let qz: f64 = rec[6].trim().parse()?;
        let qw: f64 = rec[7].trim().parse()?;
        entries.push(OdometryEntry {
            stamp_ns,
            pose: SE3::from_quaternion(qw, qx, qy, qz, position),
        });
    }
    entries.sort_by_key(|e| e.stamp_ns);
    Ok(entries)
}

/// Read an `x,y,z[,intensity]` point file.
///
/// Intensities are kept only when every row has one.
pub fn load_cloud(path: &Path) -> Result<PointCloud> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut points = Vec::new();
    let mut intensities = Vec::new();
    let mut every_row_lit = true;
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 3 {
            continue;
        }
        points.push(Vector3::new(
            rec[0].trim().parse()?,
            rec[1].trim().parse()?,
            rec[2].trim().parse()?,
        ));
        match rec.get(3) {
            Some(field) if every_row_lit => intensities.push(field.trim().parse::<f32>()?),
            _ => every_row_lit = false,
        }
    }

    if every_row_lit && !points.is_empty() {
        Ok(PointCloud::with_intensities(points, intensities)?)
    } else {
        Ok(PointCloud::new(points))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::dump::write_cloud_csv;
    use approx::assert_relative_eq;
    use std::fs;

    #[test]
    fn test_odometry_rows_are_sorted_and_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odom.csv");
        fs::write(
            &path,
            "# stamp,x,y,z,qx,qy,qz,qw\n\
             2000,1.0,0.0,0.0,0.0,0.0,0.7071068,0.7071068\n\
             1000,0.0,0.0,0.0,0.0,0.0,0.0,1.0\n",
        )
        .unwrap();

        let log = OdometryLog::new(&path, None).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries[0].stamp_ns, 1000);
        let second = &log.entries[1].pose;
        assert_relative_eq!(second.translation.x, 1.0);
        assert_relative_eq!(second.rotation.angle(), std::f64::consts::FRAC_PI_2, epsilon = 1e-6);
        assert!(log.message(0).unwrap().cloud.is_empty());
        assert!(log.message(2).is_err());
    }

    #[test]
    fn test_scan_is_loaded_by_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odom.csv");
        fs::write(&path, "5,0,0,0,0,0,0,1\n").unwrap();
        let cloud = PointCloud::new(vec![Vector3::new(1.5, -2.0, 0.25)]);
        write_cloud_csv(&dir.path().join("5.csv"), &cloud).unwrap();

        let log = OdometryLog::new(&path, Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(log.message(0).unwrap().cloud, cloud);
    }

    #[test]
    fn test_scan_intensity_column() {
        let dir = tempfile::tempdir().unwrap();
        let lit = dir.path().join("lit.csv");
        let cloud = PointCloud::with_intensities(
            vec![Vector3::new(1.0, 2.0, 3.0), Vector3::new(4.0, 5.0, 6.0)],
            vec![0.5, 12.0],
        )
        .unwrap();
        write_cloud_csv(&lit, &cloud).unwrap();
        assert_eq!(load_cloud(&lit).unwrap(), cloud);

        let partial = dir.path().join("partial.csv");
        fs::write(&partial, "1,2,3,9\n4,5,6\n").unwrap();
        let loaded = load_cloud(&partial).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(!loaded.has_intensity());
    }
}

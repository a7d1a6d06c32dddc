//! Point clouds carried by keyframes and plane segments.

use std::collections::BTreeMap;

use nalgebra::Vector3;
use rstar::primitives::GeomWithData;
use rstar::RTree;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SlamError};
use crate::geometry::SE3;

/// An unordered set of 3D points in one frame.
///
/// `intensities` is either empty or holds one return strength per point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    pub points: Vec<Vector3<f64>>,
    #[serde(default)]
    pub intensities: Vec<f32>,
}

impl PointCloud {
    pub fn new(points: Vec<Vector3<f64>>) -> Self {
        Self {
            points,
            intensities: Vec::new(),
        }
    }

    /// Cloud with one intensity per point.
    pub fn with_intensities(points: Vec<Vector3<f64>>, intensities: Vec<f32>) -> Result<Self> {
        if intensities.len() != points.len() {
            return Err(SlamError::Dimension {
                expected: points.len(),
                actual: intensities.len(),
            });
        }
        Ok(Self {
            points,
            intensities,
        })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn has_intensity(&self) -> bool {
        !self.points.is_empty() && self.intensities.len() == self.points.len()
    }

    /// Intensity of point `i`, or 0 when the cloud carries none.
    pub fn intensity(&self, i: usize) -> f32 {
        if self.has_intensity() {
            self.intensities[i]
        } else {
            0.0
        }
    }

    /// Copy of the cloud with every point mapped through `pose`.
    pub fn transformed(&self, pose: &SE3) -> Self {
        Self {
            points: self.points.iter().map(|p| pose.transform_point(p)).collect(),
            intensities: self.intensities.clone(),
        }
    }

    /// Append `other`, dropping the intensity channel unless both carry one.
    pub fn extend_from(&mut self, other: &PointCloud) {
        let keep = (self.is_empty() || self.has_intensity()) && other.has_intensity();
        self.points.extend_from_slice(&other.points);
        if keep {
            self.intensities.extend_from_slice(&other.intensities);
        } else {
            self.intensities.clear();
        }
    }

    /// Replace every occupied voxel of side `resolution` by its centroid.
    ///
    /// Intensities are averaged per voxel. Output order follows the voxel
    /// index, so the result is deterministic. A non-positive resolution
    /// returns the cloud unchanged.
    pub fn voxel_downsample(&self, resolution: f64) -> Self {
        if resolution <= 0.0 {
            return self.clone();
        }

        let with_intensity = self.has_intensity();
        let mut voxels: BTreeMap<(i64, i64, i64), (Vector3<f64>, f64, usize)> = BTreeMap::new();
        for (i, p) in self.points.iter().enumerate() {
            let key = (
                (p.x / resolution).floor() as i64,
                (p.y / resolution).floor() as i64,
                (p.z / resolution).floor() as i64,
            );
            let entry = voxels.entry(key).or_insert((Vector3::zeros(), 0.0, 0));
            entry.0 += p;
            entry.1 += f64::from(self.intensity(i));
            entry.2 += 1;
        }

        let mut points = Vec::with_capacity(voxels.len());
        let mut intensities = Vec::new();
        for (sum, intensity, count) in voxels.into_values() {
            points.push(sum / count as f64);
            if with_intensity {
                intensities.push((intensity / count as f64) as f32);
            }
        }
        Self {
            points,
            intensities,
        }
    }

    /// Spatial index over the points for nearest-neighbour queries.
    pub fn index(&self) -> PointIndex<'_> {
        PointIndex::new(self)
    }
}

type IndexedPoint = GeomWithData<[f64; 3], usize>;

/// R-tree over the points of one cloud.
///
/// Build once per target cloud and query it for every source point.
pub struct PointIndex<'a> {
    cloud: &'a PointCloud,
    tree: RTree<IndexedPoint>,
}

impl<'a> PointIndex<'a> {
    pub fn new(cloud: &'a PointCloud) -> Self {
        let entries = cloud
            .points
            .iter()
            .enumerate()
            .map(|(i, p)| GeomWithData::new([p.x, p.y, p.z], i))
            .collect();
        Self {
            cloud,
            tree: RTree::bulk_load(entries),
        }
    }

    /// Closest point to `query` and its squared distance.
    pub fn nearest(&self, query: &Vector3<f64>) -> Option<(&'a Vector3<f64>, f64)> {
        let hit = self.tree.nearest_neighbor(&[query.x, query.y, query.z])?;
        let point = self.cloud.points.get(hit.data)?;
        Some((point, (point - query).norm_squared()))
    }

    pub fn nearest_sq_distance(&self, query: &Vector3<f64>) -> Option<f64> {
        self.nearest(query).map(|(_, d2)| d2)
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}

/// A point of a segmented plane with the detector's normal estimate.
///
/// The segmenter writes the full plane equation into the last point of each
/// segment: `normal` holds `[a, b, c]` and `curvature` holds `d`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentedPoint {
    pub position: Vector3<f64>,
    pub normal: Vector3<f64>,
    pub curvature: f64,
}

/// One planar segment in the body frame of its keyframe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaneSegment {
    pub points: Vec<SegmentedPoint>,
}

impl PlaneSegment {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Plane coefficients encoded in the last point.
    pub fn coefficients(&self) -> Option<nalgebra::Vector4<f64>> {
        self.points.last().map(|p| {
            nalgebra::Vector4::new(p.normal.x, p.normal.y, p.normal.z, p.curvature)
        })
    }

    pub fn positions(&self) -> Vec<Vector3<f64>> {
        self.points.iter().map(|p| p.position).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_voxel_downsample_merges_close_points() {
        let cloud = PointCloud::new(vec![
            Vector3::new(0.01, 0.01, 0.01),
            Vector3::new(0.03, 0.03, 0.03),
            Vector3::new(1.01, 0.0, 0.0),
        ]);
        let down = cloud.voxel_downsample(0.1);
        assert_eq!(down.len(), 2);
        assert_relative_eq!(down.points[0], Vector3::new(0.02, 0.02, 0.02), epsilon = 1e-12);
    }

    #[test]
    fn test_voxel_downsample_zero_resolution_is_identity() {
        let cloud = PointCloud::new(vec![Vector3::new(1.0, 2.0, 3.0), Vector3::new(1.0, 2.0, 3.0)]);
        assert_eq!(cloud.voxel_downsample(0.0), cloud);
    }

    #[test]
    fn test_segment_coefficients_from_last_point() {
        let point = |x: f64, d: f64| SegmentedPoint {
            position: Vector3::new(x, 0.0, 0.0),
            normal: Vector3::new(1.0, 0.0, 0.0),
            curvature: d,
        };
        let segment = PlaneSegment {
            points: vec![point(0.0, 0.0), point(2.0, -2.0)],
        };
        assert_eq!(
            segment.coefficients(),
            Some(nalgebra::Vector4::new(1.0, 0.0, 0.0, -2.0))
        );
        assert!(PlaneSegment::default().coefficients().is_none());
    }

    #[test]
    fn test_index_nearest_sq_distance() {
        let cloud = PointCloud::new(vec![Vector3::new(0.0, 0.0, 0.0), Vector3::new(2.0, 0.0, 0.0)]);
        let index = cloud.index();
        assert_eq!(index.len(), 2);
        assert_relative_eq!(
            index.nearest_sq_distance(&Vector3::new(1.5, 0.0, 0.0)).unwrap(),
            0.25
        );
        let (point, _) = index.nearest(&Vector3::new(-1.0, 0.5, 0.0)).unwrap();
        assert_eq!(*point, Vector3::zeros());

        let empty = PointCloud::default();
        assert!(empty.index().is_empty());
        assert!(empty.index().nearest_sq_distance(&Vector3::zeros()).is_none());
    }

    #[test]
    fn test_index_matches_linear_scan_on_repeated_coordinates() {
        // a wall at x = 0 sampled on a regular grid
        let mut points = Vec::new();
        for j in 0..40 {
            for k in 0..40 {
                points.push(Vector3::new(0.0, j as f64 * 0.1, k as f64 * 0.1));
            }
        }
        let cloud = PointCloud::new(points);
        let index = cloud.index();

        for query in [
            Vector3::new(0.3, 1.23, 2.07),
            Vector3::new(-2.0, -1.0, 5.0),
            Vector3::new(0.0, 3.9, 3.9),
        ] {
            let brute = cloud
                .points
                .iter()
                .map(|p| (p - query).norm_squared())
                .fold(f64::MAX, f64::min);
            assert_relative_eq!(index.nearest_sq_distance(&query).unwrap(), brute, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_with_intensities_checks_length() {
        let points = vec![Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0)];
        assert!(PointCloud::with_intensities(points.clone(), vec![1.0]).is_err());
        let cloud = PointCloud::with_intensities(points, vec![1.0, 3.0]).unwrap();
        assert!(cloud.has_intensity());
        assert_eq!(cloud.intensity(1), 3.0);
        assert!(!PointCloud::new(vec![Vector3::zeros()]).has_intensity());
    }

    #[test]
    fn test_voxel_downsample_averages_intensity() {
        let cloud = PointCloud::with_intensities(
            vec![
                Vector3::new(0.01, 0.01, 0.01),
                Vector3::new(0.03, 0.03, 0.03),
                Vector3::new(1.01, 0.0, 0.0),
            ],
            vec![10.0, 20.0, 7.0],
        )
        .unwrap();
        let down = cloud.voxel_downsample(0.1);
        assert_eq!(down.intensities, vec![15.0, 7.0]);

        let plain = PointCloud::new(cloud.points.clone()).voxel_downsample(0.1);
        assert!(plain.intensities.is_empty());
    }

    #[test]
    fn test_extend_drops_intensity_from_mixed_clouds() {
        let lit = PointCloud::with_intensities(vec![Vector3::zeros()], vec![5.0]).unwrap();
        let mut merged = PointCloud::default();
        merged.extend_from(&lit);
        merged.extend_from(&lit);
        assert_eq!(merged.intensities, vec![5.0, 5.0]);

        merged.extend_from(&PointCloud::new(vec![Vector3::new(1.0, 0.0, 0.0)]));
        assert_eq!(merged.len(), 3);
        assert!(!merged.has_intensity());
    }
}

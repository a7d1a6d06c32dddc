//! Structure candidates: planes long enough to bound a corridor or a room,
//! and the admissible pairs they form.

use nalgebra::{Vector3, Vector4};

use crate::graph::NodeId;
use crate::planes::{ObservedPlane, PlaneClass};

/// A wall observed in this flush that may bound a structure.
#[derive(Debug, Clone)]
pub struct PlaneCandidate {
    pub plane_id: NodeId,
    pub class: PlaneClass,
    /// Map-frame coefficients with the sign-corrected offset.
    pub coeffs: Vector4<f64>,
    /// Extent of the supporting segment in the horizontal plane.
    pub length: f64,
    pub keyframe_node: NodeId,
    pub keyframe_translation: Vector3<f64>,
}

impl PlaneCandidate {
    pub fn from_observed(plane: &ObservedPlane) -> Self {
        Self {
            plane_id: plane.plane_id,
            class: plane.class,
            coeffs: plane.class.corrected(plane.map_plane.coeffs()),
            length: plane_length(&plane.points_body),
            keyframe_node: plane.keyframe_node,
            keyframe_translation: plane.keyframe_pose.translation,
        }
    }

    pub fn normal(&self) -> Vector3<f64> {
        self.coeffs.fixed_rows::<3>(0).into_owned()
    }

    /// Sign-corrected offset.
    pub fn offset(&self) -> f64 {
        self.coeffs[3]
    }
}

/// Two same-axis candidates facing each other.
#[derive(Debug, Clone)]
pub struct StructurePair {
    pub plane1: PlaneCandidate,
    pub plane2: PlaneCandidate,
    pub width: f64,
    pub length_diff: f64,
}

/// Candidates of one flush, split by axis and structure type.
#[derive(Debug, Clone, Default)]
pub struct StructureCandidates {
    pub x_corridor: Vec<PlaneCandidate>,
    pub y_corridor: Vec<PlaneCandidate>,
    pub x_room: Vec<PlaneCandidate>,
    pub y_room: Vec<PlaneCandidate>,
}

impl StructureCandidates {
    /// Sort vertical planes into corridor and room candidates by length.
    /// A plane may land in both.
    pub fn collect(
        observed: &[ObservedPlane],
        corridor_min_length: f64,
        room_min_length: f64,
        room_max_length: f64,
    ) -> Self {
        let mut out = Self::default();
        for plane in observed.iter().filter(|p| p.class.is_vertical()) {
            let candidate = PlaneCandidate::from_observed(plane);
            let is_x = candidate.class == PlaneClass::X;

            if candidate.length >= corridor_min_length {
                if is_x {
                    out.x_corridor.push(candidate.clone());
                } else {
                    out.y_corridor.push(candidate.clone());
                }
            }
            if candidate.length >= room_min_length && candidate.length <= room_max_length {
                if is_x {
                    out.x_room.push(candidate);
                } else {
                    out.y_room.push(candidate);
                }
            }
        }
        out
    }

    pub fn corridor(&self, axis: PlaneClass) -> &[PlaneCandidate] {
        match axis {
            PlaneClass::X => &self.x_corridor,
            _ => &self.y_corridor,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.x_corridor.is_empty()
            && self.y_corridor.is_empty()
            && self.x_room.is_empty()
            && self.y_room.is_empty()
    }
}

/// Horizontal span of the two points farthest apart in 3D.
///
/// Points whose farthest bounding-box corner is closer than the best pair of
/// axis extremes cannot be an end of the farthest pair and are dropped before
/// the pairwise search. That search is still O(m²) in the m survivors, which
/// for a wall segment are the points near its two ends.
pub fn plane_length(points: &[Vector3<f64>]) -> f64 {
    let Some(first) = points.first() else {
        return 0.0;
    };
    let (mut lo, mut hi) = (*first, *first);
    for p in points {
        lo = lo.inf(p);
        hi = hi.sup(p);
    }

    let mut extremes: Vec<&Vector3<f64>> = Vec::with_capacity(6);
    for axis in 0..3 {
        let by_axis = |a: &&Vector3<f64>, b: &&Vector3<f64>| a[axis].total_cmp(&b[axis]);
        extremes.extend(points.iter().min_by(by_axis));
        extremes.extend(points.iter().max_by(by_axis));
    }
    let mut bound: f64 = 0.0;
    for a in &extremes {
        for b in &extremes {
            bound = bound.max((*a - *b).norm_squared());
        }
    }

    let reach = |p: &Vector3<f64>| {
        Vector3::new(
            (p.x - lo.x).max(hi.x - p.x),
            (p.y - lo.y).max(hi.y - p.y),
            (p.z - lo.z).max(hi.z - p.z),
        )
        .norm_squared()
    };
    let slack = bound * 1e-9;
    let survivors: Vec<&Vector3<f64>> = points.iter().filter(|p| reach(p) + slack >= bound).collect();

    let mut best = 0.0;
    let mut ends = None;
    for (i, p) in survivors.iter().enumerate() {
        for q in &survivors[i + 1..] {
            let d = (*p - *q).norm_squared();
            if d > best {
                best = d;
                ends = Some((*p, *q));
            }
        }
    }
    ends.map_or(0.0, |(p, q)| (p.xy() - q.xy()).norm())
}

/// Gap between two sign-corrected offsets.
pub fn width_between_planes(d1: f64, d2: f64) -> f64 {
    (d1 - d2).abs()
}

/// Midpoint of two sign-corrected offsets.
pub fn offset_midpoint(d1: f64, d2: f64) -> f64 {
    if d1.abs() > d2.abs() {
        (d1 - d2) / 2.0 + d2
    } else {
        (d2 - d1) / 2.0 + d1
    }
}

/// Every unordered pair of opposing candidates that `admissible(width,
/// length_diff)` accepts.
pub fn pair_candidates<F>(candidates: &[PlaneCandidate], admissible: F) -> Vec<StructurePair>
where
    F: Fn(f64, f64) -> bool,
{
    let mut pairs = Vec::new();
    for (i, a) in candidates.iter().enumerate() {
        for b in &candidates[i + 1..] {
            if a.normal().dot(&b.normal()) >= 0.0 {
                continue;
            }
            let width = width_between_planes(a.offset(), b.offset());
            let length_diff = (a.length - b.length).abs();
            if admissible(width, length_diff) {
                pairs.push(StructurePair {
                    plane1: a.clone(),
                    plane2: b.clone(),
                    width,
                    length_diff,
                });
            }
        }
    }
    pairs
}

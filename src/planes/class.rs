//! Orientation classes of map planes and their sign conventions.

use nalgebra::{Vector3, Vector4};
use serde::{Deserialize, Serialize};

/// Dominant axis of a plane normal in the map frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaneClass {
    /// Wall whose normal points along map x.
    X,
    /// Wall whose normal points along map y.
    Y,
    /// Floor, ceiling or table top.
    Horizontal,
}

impl PlaneClass {
    pub fn is_vertical(&self) -> bool {
        !matches!(self, Self::Horizontal)
    }

    /// Index of the dominant normal component.
    pub fn axis_index(&self) -> usize {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::Horizontal => 2,
        }
    }

    /// Plane offset with its sign normalized so that planes on the same
    /// axis compare in one convention regardless of normal direction.
    ///
    /// The offset is negated when the dominant normal component is negative;
    /// the normal itself is left untouched.
    pub fn corrected_offset(&self, coeffs: &Vector4<f64>) -> f64 {
        if coeffs[self.axis_index()] < 0.0 {
            -coeffs[3]
        } else {
            coeffs[3]
        }
    }

    /// Coefficients with [`PlaneClass::corrected_offset`] applied.
    pub fn corrected(&self, coeffs: &Vector4<f64>) -> Vector4<f64> {
        let mut out = *coeffs;
        out[3] = self.corrected_offset(coeffs);
        out
    }
}

impl std::fmt::Display for PlaneClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::X => write!(f, "x"),
            Self::Y => write!(f, "y"),
            Self::Horizontal => write!(f, "horizontal"),
        }
    }
}

/// How a map-frame normal is assigned to a [`PlaneClass`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum ClassificationMode {
    /// Class of the component whose magnitude exceeds the threshold;
    /// planes matching none are ignored.
    Threshold(f64),
    /// Class of the largest-magnitude component.
    DominantAxis,
}

impl Default for ClassificationMode {
    fn default() -> Self {
        Self::Threshold(0.98)
    }
}

impl ClassificationMode {
    pub fn classify(&self, normal: &Vector3<f64>) -> Option<PlaneClass> {
        let abs = normal.abs();
        match *self {
            Self::Threshold(threshold) => {
                if abs.x > threshold {
                    Some(PlaneClass::X)
                } else if abs.y > threshold {
                    Some(PlaneClass::Y)
                } else if abs.z > threshold {
                    Some(PlaneClass::Horizontal)
                } else {
                    None
                }
            }
            Self::DominantAxis => {
                if abs.x >= abs.y && abs.x >= abs.z {
                    Some(PlaneClass::X)
                } else if abs.y >= abs.z {
                    Some(PlaneClass::Y)
                } else {
                    Some(PlaneClass::Horizontal)
                }
            }
        }
    }
}

/// Signed offset between a structure coordinate and a corrected plane
/// offset, ordered by which one is larger in magnitude.
pub fn structure_plane_measurement(coordinate: f64, plane_offset: f64) -> f64 {
    if coordinate.abs() > plane_offset.abs() {
        coordinate - plane_offset
    } else {
        plane_offset - coordinate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_threshold_classification() {
        let mode = ClassificationMode::Threshold(0.98);
        assert_eq!(mode.classify(&Vector3::new(-1.0, 0.0, 0.0)), Some(PlaneClass::X));
        assert_eq!(mode.classify(&Vector3::new(0.0, 0.99, 0.1)), Some(PlaneClass::Y));
        assert_eq!(mode.classify(&Vector3::new(0.0, 0.0, 1.0)), Some(PlaneClass::Horizontal));
        assert_eq!(mode.classify(&Vector3::new(0.7, 0.7, 0.0)), None);
    }

    #[test]
    fn test_dominant_axis_classification() {
        let mode = ClassificationMode::DominantAxis;
        assert_eq!(mode.classify(&Vector3::new(0.7, 0.6, 0.1)), Some(PlaneClass::X));
        assert_eq!(mode.classify(&Vector3::new(0.2, -0.9, 0.1)), Some(PlaneClass::Y));
        assert_eq!(mode.classify(&Vector3::new(0.1, 0.2, -0.9)), Some(PlaneClass::Horizontal));
    }

    #[test]
    fn test_corrected_offset_flips_negative_normals() {
        // x = 1 seen from both sides
        let facing_neg = Vector4::new(-1.0, 0.0, 0.0, 1.0);
        let facing_pos = Vector4::new(1.0, 0.0, 0.0, -1.0);
        assert_relative_eq!(PlaneClass::X.corrected_offset(&facing_neg), -1.0);
        assert_relative_eq!(PlaneClass::X.corrected_offset(&facing_pos), -1.0);
        assert_relative_eq!(PlaneClass::Y.corrected_offset(&facing_neg), 1.0);
    }

    #[test]
    fn test_structure_plane_measurement_sign() {
        assert_relative_eq!(structure_plane_measurement(-0.95, 0.2), -1.15, epsilon = 1e-12);
        assert_relative_eq!(structure_plane_measurement(-0.95, -2.1), -1.15, epsilon = 1e-12);
    }
}

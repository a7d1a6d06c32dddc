//! YAML configuration for the whole system.
//!
//! Every section and field falls back to its default, so a config file only
//! needs to name what it changes.

use std::fs::File;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::keyframe::{InformationConfig, KeyframeUpdaterConfig};
use crate::loop_closing::{IcpConfig, LoopDetectorConfig};
use crate::optimizer::LevenbergMarquardtConfig;
use crate::planes::PlaneMapperConfig;
use crate::structures::{CorridorConfig, RoomConfig};
use crate::system::OrchestratorConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlamConfig {
    pub graph: OrchestratorConfig,
    pub keyframe: KeyframeUpdaterConfig,
    pub information: InformationConfig,
    pub planes: PlaneMapperConfig,
    pub corridor: CorridorConfig,
    pub room: RoomConfig,
    pub loop_detector: LoopDetectorConfig,
    pub registration: IcpConfig,
    pub solver: LevenbergMarquardtConfig,
}

impl SlamConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open config {}", path.display()))?;
        let config: Self = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Worker periods must be finite and positive.
    pub fn validate(&self) -> Result<()> {
        for (name, seconds) in [
            ("graph_update_interval", self.graph.graph_update_interval),
            ("map_cloud_update_interval", self.graph.map_cloud_update_interval),
        ] {
            ensure!(
                seconds.is_finite() && seconds > 0.0,
                "graph.{} must be a positive number of seconds, got {}",
                name,
                seconds
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planes::ClassificationMode;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = SlamConfig::from_yaml("{}").unwrap();
        assert_eq!(config.graph.max_keyframes_per_update, 10);
        assert_eq!(config.graph.graph_update_interval, 3.0);
        assert_eq!(config.graph.gps_edge_stddev_xy, 10000.0);
        assert_eq!(config.graph.odometry_edge_robust_kernel.kernel, "NONE");
        assert!(config.graph.enable_gps);
        assert!(!config.graph.fix_first_node);
        assert!(!config.planes.use_point_to_plane);
        assert_eq!(config.planes.min_plane_points, 100);
        assert_eq!(config.planes.classification, ClassificationMode::Threshold(0.98));
        assert!(!config.corridor.use_corridor_constraint);
        assert_eq!(config.room.room_min_width, 2.5);
    }

    #[test]
    fn test_partial_override() {
        let config = SlamConfig::from_yaml(
            r#"
graph:
  fix_first_node: true
  gps_edge_robust_kernel:
    kernel: Huber
planes:
  classification:
    mode: dominant_axis
corridor:
  use_corridor_constraint: true
  corridor_min_width: 1.0
"#,
        )
        .unwrap();

        assert!(config.graph.fix_first_node);
        assert_eq!(config.graph.gps_edge_robust_kernel.kernel, "Huber");
        assert_eq!(config.graph.gps_edge_robust_kernel.size, 1.0);
        assert_eq!(config.graph.max_keyframes_per_update, 10);
        assert_eq!(config.planes.classification, ClassificationMode::DominantAxis);
        assert!(config.corridor.use_corridor_constraint);
        assert_eq!(config.corridor.corridor_min_width, 1.0);
        assert_eq!(config.corridor.corridor_max_width, 2.5);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "room:\n  use_room_constraint: true").unwrap();
        let config = SlamConfig::load(file.path()).unwrap();
        assert!(config.room.use_room_constraint);
    }

    #[test]
    fn test_rejects_unusable_intervals() {
        let err = SlamConfig::from_yaml("graph:\n  graph_update_interval: -1.0").unwrap_err();
        assert!(err.to_string().contains("graph_update_interval"));
        let err = SlamConfig::from_yaml("graph:\n  map_cloud_update_interval: .inf").unwrap_err();
        assert!(err.to_string().contains("map_cloud_update_interval"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "graph:\n  graph_update_interval: 0").unwrap();
        let err = SlamConfig::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("graph_update_interval"));
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = SlamConfig::load("/nonexistent/slam.yaml").unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/slam.yaml"));
    }
}

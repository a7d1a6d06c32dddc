use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rust_structural_slam::io::{OdometryLog, SlamConfig};
use rust_structural_slam::system::SlamSystem;

const USAGE: &str =
    "usage: structural_slam_replay <config.yaml|-> <odometry.csv> [cloud_dir] [output_dir]";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rust_structural_slam=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_arg = args.first().context(USAGE)?;
    let odometry_path = args.get(1).context(USAGE)?;
    let cloud_dir = args.get(2).map(PathBuf::from);
    let output_dir = args.get(3).map(PathBuf::from);

    let config = if config_arg == "-" {
        SlamConfig::default()
    } else {
        SlamConfig::load(config_arg)?
    };
    let resolution = config.graph.map_cloud_resolution;

    let log = OdometryLog::new(odometry_path, cloud_dir)?;
    info!("Loaded {} odometry entries from {}", log.len(), odometry_path);

    let mut system = SlamSystem::new(config);
    let mut keyframes = 0usize;
    for i in 0..log.len() {
        if system.on_odometry(log.message(i)?) {
            keyframes += 1;
        }
    }
    info!("{} of {} entries became keyframes", keyframes, log.len());

    // drain whatever the periodic worker has not reached yet
    while system.orchestrator().optimization_cycle() {}
    system.orchestrator().update_map_cloud();

    let correction = system.odom2map();
    info!(
        "Final odom->map translation [{:.3}, {:.3}, {:.3}], {} keyframes in snapshot",
        correction.translation.x,
        correction.translation.y,
        correction.translation.z,
        system.snapshot().len()
    );

    if let Some(dir) = output_dir {
        system.dump(&dir.join("graph"));
        system.save_map(&dir.join("map.pcd"), resolution, true);
    }

    system.shutdown();
    Ok(())
}

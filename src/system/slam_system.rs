//! SLAM System - owns the orchestrator and its two periodic workers.
//!
//! One thread runs the optimization cycle every `graph_update_interval`
//! seconds, the other re-renders the map cloud every
//! `map_cloud_update_interval` seconds. Sensor producers call straight into
//! the orchestrator from whatever thread they run on.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::geometry::SE3;
use crate::io::config::SlamConfig;
use crate::keyframe::{KeyframeSnapshot, PointCloud};

use super::messages::{FloorCoefficients, GpsFix, ImuSample, OdometryCloud, SegmentedPlanes};
use super::orchestrator::{GraphOrchestrator, OrchestratorConfig};

/// Main SLAM system driving the graph orchestrator.
pub struct SlamSystem {
    orchestrator: Arc<GraphOrchestrator>,

    /// Dropping the sender wakes both workers.
    shutdown_tx: Option<Sender<()>>,

    handles: Vec<JoinHandle<()>>,
}

impl SlamSystem {
    /// Start the workers for an orchestrator built from `config`.
    pub fn new(config: SlamConfig) -> Self {
        Self::with_orchestrator(GraphOrchestrator::new(config))
    }

    /// Start the workers for an already configured orchestrator.
    pub fn with_orchestrator(orchestrator: GraphOrchestrator) -> Self {
        let orchestrator = Arc::new(orchestrator);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let graph = &orchestrator.config().graph;
        let defaults = OrchestratorConfig::default();
        let optimize_every = interval(
            "graph_update_interval",
            graph.graph_update_interval,
            defaults.graph_update_interval,
        );
        let render_every = interval(
            "map_cloud_update_interval",
            graph.map_cloud_update_interval,
            defaults.map_cloud_update_interval,
        );

        let handles = vec![
            Self::spawn_worker(
                "optimization",
                Arc::clone(&orchestrator),
                shutdown_rx.clone(),
                optimize_every,
                |o| {
                    o.optimization_cycle();
                },
            ),
            Self::spawn_worker(
                "map_cloud",
                Arc::clone(&orchestrator),
                shutdown_rx,
                render_every,
                |o| {
                    o.update_map_cloud();
                },
            ),
        ];

        info!(
            "SLAM system started (optimize every {:?}, render every {:?})",
            optimize_every, render_every
        );
        Self {
            orchestrator,
            shutdown_tx: Some(shutdown_tx),
            handles,
        }
    }

    fn spawn_worker(
        name: &'static str,
        orchestrator: Arc<GraphOrchestrator>,
        shutdown_rx: Receiver<()>,
        period: Duration,
        work: fn(&GraphOrchestrator),
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let ticker = tick(period);
            loop {
                select! {
                    recv(ticker) -> _ => work(&orchestrator),
                    recv(shutdown_rx) -> _ => break,
                }
                if orchestrator.shared().is_shutdown_requested() {
                    break;
                }
            }
            debug!("{} worker stopped", name);
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Producers
    // ─────────────────────────────────────────────────────────────────────────

    pub fn on_odometry(&self, msg: OdometryCloud) -> bool {
        self.orchestrator.on_odometry(msg)
    }

    pub fn on_floor(&self, msg: FloorCoefficients) {
        self.orchestrator.on_floor(msg);
    }

    pub fn on_gps(&self, msg: GpsFix) {
        self.orchestrator.on_gps(msg);
    }

    pub fn on_imu(&self, msg: ImuSample) {
        self.orchestrator.on_imu(msg);
    }

    pub fn on_segmented_planes(&self, msg: SegmentedPlanes) {
        self.orchestrator.on_segmented_planes(msg);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outputs
    // ─────────────────────────────────────────────────────────────────────────

    pub fn orchestrator(&self) -> &Arc<GraphOrchestrator> {
        &self.orchestrator
    }

    pub fn odom2map(&self) -> SE3 {
        self.orchestrator.odom2map()
    }

    pub fn snapshot(&self) -> Arc<Vec<KeyframeSnapshot>> {
        self.orchestrator.snapshot()
    }

    pub fn map_cloud(&self) -> Option<Arc<PointCloud>> {
        self.orchestrator.map_cloud()
    }

    pub fn plane_cloud(&self, resolution: f64) -> PointCloud {
        self.orchestrator.plane_cloud(resolution)
    }

    pub fn read_until(&self) -> u64 {
        self.orchestrator.read_until()
    }

    pub fn dump(&self, directory: &Path) -> bool {
        self.orchestrator.dump(directory)
    }

    pub fn save_map(&self, path: &Path, resolution: f64, utm: bool) -> bool {
        self.orchestrator.save_map(path, resolution, utm)
    }

    /// Stop both workers and wait for them.
    ///
    /// A cycle that is already running completes first.
    pub fn shutdown(&mut self) {
        self.orchestrator.shared().request_shutdown();
        self.shutdown_tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker period of at least 1 ms. Values no `Duration` can hold fall back
/// to `default`.
fn interval(name: &str, seconds: f64, default: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(1e-3)).unwrap_or_else(|err| {
        warn!("{} of {} s is unusable ({}), using {} s", name, seconds, err, default);
        Duration::from_secs_f64(default)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_closing::registration::tests::corner_cloud;
    use std::time::Instant;

    #[test]
    fn test_workers_optimize_and_render() {
        let mut config = SlamConfig::default();
        config.graph.graph_update_interval = 0.01;
        config.graph.map_cloud_update_interval = 0.01;
        let mut system = SlamSystem::new(config);

        assert!(system.on_odometry(OdometryCloud {
            stamp_ns: 0,
            odom: SE3::identity(),
            cloud: corner_cloud(),
        }));

        let deadline = Instant::now() + Duration::from_secs(5);
        while system.map_cloud().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(system.snapshot().len(), 1);
        assert!(system.map_cloud().is_some_and(|cloud| !cloud.is_empty()));
        system.shutdown();
        assert!(system.handles.is_empty());
    }

    #[test]
    fn test_interval_never_panics() {
        assert_eq!(interval("t", 0.5, 3.0), Duration::from_millis(500));
        assert_eq!(interval("t", -2.0, 3.0), Duration::from_millis(1));
        assert_eq!(interval("t", f64::NAN, 3.0), Duration::from_millis(1));
        assert_eq!(interval("t", f64::INFINITY, 3.0), Duration::from_secs(3));
        assert_eq!(interval("t", 1e300, 3.0), Duration::from_secs(3));
    }

    #[test]
    fn test_unvalidated_config_still_starts() {
        let mut config = SlamConfig::default();
        config.graph.graph_update_interval = f64::INFINITY;
        config.graph.map_cloud_update_interval = -1.0;
        let mut system = SlamSystem::new(config);
        system.shutdown();
        assert!(system.handles.is_empty());
    }

    #[test]
    fn test_drop_joins_idle_workers() {
        let mut config = SlamConfig::default();
        config.graph.graph_update_interval = 60.0;
        config.graph.map_cloud_update_interval = 60.0;
        let started = Instant::now();
        drop(SlamSystem::new(config));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

//! `vigil-monitor` – keeps a planning scene in sync with the running robot.
//!
//! Two cooperating components, both cheap to clone and safe to share across
//! tasks:
//!
//! # Modules
//!
//! - [`state_tracker`] – [`StateTracker`][state_tracker::StateTracker]:
//!   consumes joint-state messages, keeps the latest joint values with
//!   per-joint timestamps, polls multi-DOF joints from a
//!   [`TransformSource`][vigil_perception::TransformSource], and answers
//!   completeness and freshness queries (blocking waits included).
//! - [`scene_monitor`] – [`SceneMonitor`][scene_monitor::SceneMonitor]:
//!   owns the authoritative [`SceneChain`][vigil_scene::SceneChain] behind a
//!   read/write lock, applies joint, object, world, scene and occupancy
//!   updates to it, classifies each change as a
//!   [`ChangeCategory`][vigil_types::ChangeCategory], notifies observers and
//!   republishes rate-limited diffs on the bus.
//! - [`shape_exclusion`] – [`ShapeExclusionCache`][shape_exclusion::ShapeExclusionCache]:
//!   the robot, attached and world shapes excluded from occupancy, and where
//!   each one is anchored.
//! - [`config`] – [`MonitorConfig`][config::MonitorConfig]: TOML
//!   configuration with `VIGIL_*` environment overrides.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable trace export.
//!
//! # Wiring
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use vigil_monitor::{MonitorConfig, SceneMonitor};
//! # use vigil_scene::RobotModel;
//! # async fn run(model: Arc<RobotModel>) -> Result<(), vigil_types::VigilError> {
//! let config = MonitorConfig::default();
//! let monitor = SceneMonitor::builder()
//!     .model(model)
//!     .config(config.clone())
//!     .build()?;
//! monitor.start_state_monitor(&config.joint_states_topic, &config.attached_collision_object_topic);
//! monitor.start_world_geometry_monitor(
//!     &config.collision_object_topic,
//!     &config.planning_scene_world_topic,
//!     false,
//! );
//! monitor.start_republishing(config.publish_categories, config.publish_hz)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod scene_monitor;
pub mod shape_exclusion;
pub mod state_tracker;
pub mod telemetry;

pub use config::{CollisionOperation, MonitorConfig};
pub use scene_monitor::{
    SceneMonitor, SceneMonitorBuilder, SceneReadGuard, SceneUpdateObserver, SceneWriteGuard,
    classify_scene_msg,
};
pub use shape_exclusion::{ExclusionEntry, ShapeExclusionCache};
pub use state_tracker::{JointStateObserver, Snapshot, StateTracker, StateTrackerBuilder};
pub use telemetry::{TracerProviderGuard, init_tracing};

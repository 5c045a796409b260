//! Monitor configuration, read from a TOML file with `VIGIL_*` overrides.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration:
//!
//! ```toml
//! name = "arm_scene"
//! publish_hz = 5.0
//! publish_categories = "STATE | GEOMETRY"
//! state_update_hz = 0.0   # never throttle state refreshes
//!
//! [link_padding]
//! gripper = 0.02
//!
//! [[default_collision_operations]]
//! object1 = "gripper"
//! object2 = "table"
//! allowed = true
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_middleware::topics;
use vigil_types::{ChangeCategory, VigilError};

/// One default allowed-collision-matrix entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollisionOperation {
    pub object1: String,
    pub object2: String,
    pub allowed: bool,
}

/// Everything a [`SceneMonitor`][crate::SceneMonitor] and its
/// [`StateTracker`][crate::StateTracker] are configured with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Name of the monitored scene.
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_joint_states_topic")]
    pub joint_states_topic: String,
    #[serde(default = "default_attached_collision_object_topic")]
    pub attached_collision_object_topic: String,
    #[serde(default = "default_collision_object_topic")]
    pub collision_object_topic: String,
    #[serde(default = "default_planning_scene_world_topic")]
    pub planning_scene_world_topic: String,
    #[serde(default = "default_planning_scene_topic")]
    pub planning_scene_topic: String,
    /// Where the republished scene goes.
    #[serde(default = "default_monitored_planning_scene_topic")]
    pub monitored_planning_scene_topic: String,
    #[serde(default = "default_get_planning_scene_service")]
    pub get_planning_scene_service: String,

    /// Upper bound on republished messages per second.
    #[serde(default = "default_publish_hz")]
    pub publish_hz: f64,
    /// Categories that trigger a republication.
    #[serde(default = "default_publish_categories")]
    pub publish_categories: ChangeCategory,
    /// Upper bound on scene refreshes from the joint feed per second.
    /// `0` refreshes on every tracker update.
    #[serde(default = "default_state_update_hz")]
    pub state_update_hz: f64,
    /// How long a shape pose lookup may wait for its transform.
    #[serde(default = "default_shape_transform_lookup_wait_secs")]
    pub shape_transform_lookup_wait_secs: f64,

    #[serde(default)]
    pub default_robot_padding: f64,
    #[serde(default = "default_robot_scale")]
    pub default_robot_scale: f64,
    /// Inflation of world objects excluded from occupancy.
    #[serde(default)]
    pub default_object_padding: f64,
    /// Inflation of attached bodies excluded from occupancy.
    #[serde(default)]
    pub default_attached_padding: f64,
    #[serde(default)]
    pub link_padding: BTreeMap<String, f64>,
    #[serde(default)]
    pub link_scale: BTreeMap<String, f64>,
    #[serde(default)]
    pub default_collision_operations: Vec<CollisionOperation>,

    /// Joint positions this close outside a bound are clamped onto it.
    #[serde(default = "default_joint_bounds_tolerance")]
    pub joint_bounds_tolerance: f64,
    /// Copy velocities and efforts from the joint feed.
    #[serde(default = "default_copy_dynamics")]
    pub copy_dynamics: bool,
}

fn default_name() -> String {
    "planning_scene_monitor".to_string()
}
fn default_joint_states_topic() -> String {
    topics::JOINT_STATES.to_string()
}
fn default_attached_collision_object_topic() -> String {
    topics::ATTACHED_COLLISION_OBJECT.to_string()
}
fn default_collision_object_topic() -> String {
    topics::COLLISION_OBJECT.to_string()
}
fn default_planning_scene_world_topic() -> String {
    topics::PLANNING_SCENE_WORLD.to_string()
}
fn default_planning_scene_topic() -> String {
    topics::PLANNING_SCENE.to_string()
}
fn default_monitored_planning_scene_topic() -> String {
    topics::MONITORED_PLANNING_SCENE.to_string()
}
fn default_get_planning_scene_service() -> String {
    topics::GET_PLANNING_SCENE.to_string()
}
fn default_publish_hz() -> f64 {
    2.0
}
fn default_publish_categories() -> ChangeCategory {
    ChangeCategory::all()
}
fn default_state_update_hz() -> f64 {
    10.0
}
fn default_shape_transform_lookup_wait_secs() -> f64 {
    0.05
}
fn default_robot_scale() -> f64 {
    1.0
}
fn default_joint_bounds_tolerance() -> f64 {
    f64::EPSILON
}
fn default_copy_dynamics() -> bool {
    true
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            joint_states_topic: default_joint_states_topic(),
            attached_collision_object_topic: default_attached_collision_object_topic(),
            collision_object_topic: default_collision_object_topic(),
            planning_scene_world_topic: default_planning_scene_world_topic(),
            planning_scene_topic: default_planning_scene_topic(),
            monitored_planning_scene_topic: default_monitored_planning_scene_topic(),
            get_planning_scene_service: default_get_planning_scene_service(),
            publish_hz: default_publish_hz(),
            publish_categories: default_publish_categories(),
            state_update_hz: default_state_update_hz(),
            shape_transform_lookup_wait_secs: default_shape_transform_lookup_wait_secs(),
            default_robot_padding: 0.0,
            default_robot_scale: default_robot_scale(),
            default_object_padding: 0.0,
            default_attached_padding: 0.0,
            link_padding: BTreeMap::new(),
            link_scale: BTreeMap::new(),
            default_collision_operations: Vec::new(),
            joint_bounds_tolerance: default_joint_bounds_tolerance(),
            copy_dynamics: default_copy_dynamics(),
        }
    }
}

impl MonitorConfig {
    /// Load from `path`.  Returns `None` if the file does not exist.
    pub fn load_from(path: &Path) -> Result<Option<Self>, VigilError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)
            .map_err(|e| VigilError::Config(format!("failed to read {}: {e}", path.display())))?;
        let mut cfg = Self::from_toml(&raw)?;
        cfg.apply_env_overrides();
        Ok(Some(cfg))
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml(raw: &str) -> Result<Self, VigilError> {
        let cfg: Self =
            toml::from_str(raw).map_err(|e| VigilError::Config(format!("failed to parse: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `VIGIL_*` environment variable overrides.
    ///
    /// | Variable | Config field |
    /// |---|---|
    /// | `VIGIL_JOINT_STATES_TOPIC` | `joint_states_topic` |
    /// | `VIGIL_PUBLISH_HZ` | `publish_hz` |
    /// | `VIGIL_STATE_UPDATE_HZ` | `state_update_hz` |
    ///
    /// Unparsable or negative rates are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VIGIL_JOINT_STATES_TOPIC") {
            self.joint_states_topic = v;
        }
        if let Ok(v) = std::env::var("VIGIL_PUBLISH_HZ")
            && let Ok(hz) = v.parse::<f64>()
            && hz.is_finite()
            && hz > 0.0
        {
            self.publish_hz = hz;
        }
        if let Ok(v) = std::env::var("VIGIL_STATE_UPDATE_HZ")
            && let Ok(hz) = v.parse::<f64>()
            && hz.is_finite()
            && hz >= 0.0
        {
            self.state_update_hz = hz;
        }
    }

    pub fn validate(&self) -> Result<(), VigilError> {
        if !self.publish_hz.is_finite() || self.publish_hz <= 0.0 {
            return Err(VigilError::InvalidRate(self.publish_hz));
        }
        if !self.state_update_hz.is_finite() || self.state_update_hz < 0.0 {
            return Err(VigilError::InvalidRate(self.state_update_hz));
        }
        if !(self.shape_transform_lookup_wait_secs >= 0.0) {
            return Err(VigilError::Config(format!(
                "shape_transform_lookup_wait_secs must be non-negative, got {}",
                self.shape_transform_lookup_wait_secs
            )));
        }
        Ok(())
    }

    /// Minimum spacing between scene refreshes from the joint feed.
    pub fn state_update_interval(&self) -> Duration {
        rate_to_interval(self.state_update_hz)
    }

    pub fn shape_transform_lookup_wait(&self) -> Duration {
        secs_to_duration(self.shape_transform_lookup_wait_secs.max(0.0))
    }
}

/// Longest interval or wait the monitor schedules.  Larger values, including
/// infinity, are clamped to it.
pub const MAX_INTERVAL: Duration = Duration::from_secs(86_400 * 365);

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).map_or(MAX_INTERVAL, |d| d.min(MAX_INTERVAL))
}

/// `1 / hz`, or zero for rates that do not describe a finite interval.
pub(crate) fn rate_to_interval(hz: f64) -> Duration {
    if hz.is_finite() && hz > 0.0 {
        secs_to_duration(1.0 / hz)
    } else {
        Duration::ZERO
    }
}

//! Wire messages exchanged with the outside world.
//!
//! Joint states use parallel arrays (one entry per joint name), so a message
//! whose `position` array length differs from `name` is malformed.  Scene
//! messages come in two flavours: full (`is_diff == false`, every field is
//! authoritative) and diff (`is_diff == true`, only non-empty fields apply).

use serde::{Deserialize, Serialize};

use crate::Stamp;
use crate::geometry::{Pose, Shape, StampedTransform, Vec3};

// ────────────────────────────────────────────────────────────────────────────
// Joint state
// ────────────────────────────────────────────────────────────────────────────

/// A timestamped batch of single-variable joint readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointStateMsg {
    pub stamp: Stamp,
    pub name: Vec<String>,
    pub position: Vec<f64>,
    #[serde(default)]
    pub velocity: Vec<f64>,
    #[serde(default)]
    pub effort: Vec<f64>,
}

impl Default for JointStateMsg {
    fn default() -> Self {
        Self {
            stamp: Stamp::UNIX_EPOCH,
            name: Vec::new(),
            position: Vec::new(),
            velocity: Vec::new(),
            effort: Vec::new(),
        }
    }
}

impl JointStateMsg {
    /// Positions only, from `(name, position)` pairs.
    pub fn from_positions<'a>(
        stamp: Stamp,
        joints: impl IntoIterator<Item = (&'a str, f64)>,
    ) -> Self {
        let (name, position) = joints
            .into_iter()
            .map(|(n, p)| (n.to_string(), p))
            .unzip();
        Self {
            stamp,
            name,
            position,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
            && self.position.is_empty()
            && self.velocity.is_empty()
            && self.effort.is_empty()
    }
}

/// Pose of one multi-DOF joint (planar or floating).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiDofJointValue {
    pub joint_name: String,
    pub transform: Pose,
}

// ────────────────────────────────────────────────────────────────────────────
// World geometry
// ────────────────────────────────────────────────────────────────────────────

/// What a [`CollisionObjectMsg`] asks the scene to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectOperation {
    /// Add the object, replacing any object with the same id.
    #[default]
    Add,
    /// Remove the object (an empty id removes every object).
    Remove,
    /// Add the shapes to an existing object, creating it if needed.
    Append,
    /// Move an existing object's shapes to the given poses.
    Move,
}

/// A collision object edit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CollisionObjectMsg {
    pub id: String,
    /// Frame the `poses` are expressed in.
    pub frame_id: String,
    #[serde(default)]
    pub shapes: Vec<Shape>,
    #[serde(default)]
    pub poses: Vec<Pose>,
    #[serde(default)]
    pub operation: ObjectOperation,
}

/// Attach/detach an object to/from a robot link.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttachedCollisionObjectMsg {
    pub link_name: String,
    pub object: CollisionObjectMsg,
    /// Links allowed to touch the attached object.
    #[serde(default)]
    pub touch_links: Vec<String>,
}

/// Sensor-derived occupancy overlay, as a flat list of occupied points.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OctomapMsg {
    pub frame_id: String,
    pub resolution: f64,
    #[serde(default)]
    pub points: Vec<Vec3>,
}

/// World part of a scene: collision objects plus the occupancy overlay.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorldMsg {
    #[serde(default)]
    pub collision_objects: Vec<CollisionObjectMsg>,
    #[serde(default)]
    pub octomap: Option<OctomapMsg>,
}

impl WorldMsg {
    pub fn is_empty(&self) -> bool {
        self.collision_objects.is_empty() && self.octomap_is_empty()
    }

    /// True when no occupancy data is carried.
    pub fn octomap_is_empty(&self) -> bool {
        self.octomap.as_ref().is_none_or(|o| o.points.is_empty())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Robot state
// ────────────────────────────────────────────────────────────────────────────

/// Robot state part of a scene message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotStateMsg {
    #[serde(default)]
    pub joint_state: JointStateMsg,
    #[serde(default)]
    pub multi_dof_joints: Vec<MultiDofJointValue>,
    #[serde(default)]
    pub attached_collision_objects: Vec<AttachedCollisionObjectMsg>,
    /// `false` means the message is a complete robot state.
    #[serde(default = "default_true")]
    pub is_diff: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RobotStateMsg {
    fn default() -> Self {
        Self {
            joint_state: JointStateMsg::default(),
            multi_dof_joints: Vec::new(),
            attached_collision_objects: Vec::new(),
            is_diff: true,
        }
    }
}

impl RobotStateMsg {
    /// A non-diff robot state is never empty: it resets the whole state.
    pub fn is_empty(&self) -> bool {
        self.is_diff
            && self.joint_state.is_empty()
            && self.multi_dof_joints.is_empty()
            && self.attached_collision_objects.is_empty()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Scene
// ────────────────────────────────────────────────────────────────────────────

/// One allowed-collision-matrix entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmEntry {
    pub first: String,
    pub second: String,
    pub allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkPadding {
    pub link_name: String,
    pub padding: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkScale {
    pub link_name: String,
    pub scale: f64,
}

/// A full scene or a scene diff.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SceneMsg {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub robot_model_name: String,
    #[serde(default)]
    pub robot_state: RobotStateMsg,
    #[serde(default)]
    pub fixed_frame_transforms: Vec<StampedTransform>,
    #[serde(default)]
    pub allowed_collision_matrix: Vec<AcmEntry>,
    #[serde(default)]
    pub link_padding: Vec<LinkPadding>,
    #[serde(default)]
    pub link_scale: Vec<LinkScale>,
    #[serde(default)]
    pub world: WorldMsg,
    #[serde(default)]
    pub is_diff: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_robot_state_is_an_empty_diff() {
        assert!(RobotStateMsg::default().is_empty());
    }

    #[test]
    fn full_robot_state_is_never_empty() {
        let msg = RobotStateMsg {
            is_diff: false,
            ..RobotStateMsg::default()
        };
        assert!(!msg.is_empty());
    }

    #[test]
    fn world_with_empty_octomap_is_empty() {
        let world = WorldMsg {
            collision_objects: vec![],
            octomap: Some(OctomapMsg::default()),
        };
        assert!(world.is_empty());
    }

    #[test]
    fn scene_msg_deserializes_with_defaults() {
        let msg: SceneMsg = serde_json::from_str(r#"{"name":"lab","is_diff":true}"#).unwrap();
        assert_eq!(msg.name, "lab");
        assert!(msg.robot_state.is_diff);
        assert!(msg.world.is_empty());
    }
}

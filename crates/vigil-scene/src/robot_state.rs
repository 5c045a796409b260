//! Robot state: joint values and attached bodies for one [`RobotModel`].
//!
//! Values are stored per joint (one vector entry per joint variable).
//! Setting a joint also updates every joint that mimics it.  Link poses are
//! not computed here; [`RobotState::update`] only marks the derived
//! transforms as refreshed for the consumers that compute them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use vigil_types::{
    AttachedCollisionObjectMsg, CollisionObjectMsg, JointStateMsg, MultiDofJointValue,
    ObjectOperation, Pose, Shape, Stamp,
};

use crate::model::RobotModel;

/// Position plus optional dynamics of one joint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JointValue {
    pub position: Vec<f64>,
    pub velocity: Option<Vec<f64>>,
    pub effort: Option<Vec<f64>>,
    pub acceleration: Option<Vec<f64>>,
}

/// A rigid body carried by a robot link.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachedBody {
    pub id: String,
    pub link_name: String,
    pub shapes: Vec<Shape>,
    /// Pose of each shape in the link frame.
    pub poses: Vec<Pose>,
    /// Links allowed to touch the body.
    pub touch_links: BTreeSet<String>,
}

impl AttachedBody {
    pub fn to_msg(&self) -> AttachedCollisionObjectMsg {
        AttachedCollisionObjectMsg {
            link_name: self.link_name.clone(),
            object: CollisionObjectMsg {
                id: self.id.clone(),
                frame_id: self.link_name.clone(),
                shapes: self.shapes.clone(),
                poses: self.poses.clone(),
                operation: ObjectOperation::Add,
            },
            touch_links: self.touch_links.iter().cloned().collect(),
        }
    }
}

/// Joint values and attached bodies of a robot.
#[derive(Debug, Clone)]
pub struct RobotState {
    model: Arc<RobotModel>,
    values: BTreeMap<String, JointValue>,
    attached: BTreeMap<String, AttachedBody>,
    dirty: bool,
}

impl PartialEq for RobotState {
    fn eq(&self, other: &Self) -> bool {
        self.model.name() == other.model.name()
            && self.values == other.values
            && self.attached == other.attached
    }
}

impl RobotState {
    /// A state with every joint at its default position.
    pub fn new(model: Arc<RobotModel>) -> Self {
        let values = model
            .joints()
            .filter(|j| j.variable_count() > 0)
            .map(|j| {
                (
                    j.name.clone(),
                    JointValue {
                        position: j.default_positions(),
                        ..JointValue::default()
                    },
                )
            })
            .collect();
        Self {
            model,
            values,
            attached: BTreeMap::new(),
            dirty: true,
        }
    }

    pub fn model(&self) -> &Arc<RobotModel> {
        &self.model
    }

    pub fn joint_value(&self, joint: &str) -> Option<&JointValue> {
        self.values.get(joint)
    }

    pub fn positions(&self, joint: &str) -> Option<&[f64]> {
        self.values.get(joint).map(|v| v.position.as_slice())
    }

    /// Position of a single-variable joint.
    pub fn position(&self, joint: &str) -> Option<f64> {
        match self.positions(joint)? {
            [p] => Some(*p),
            _ => None,
        }
    }

    /// Set every variable of `joint`.  Returns `false` for unknown joints or
    /// a wrong number of values.
    pub fn set_positions(&mut self, joint: &str, positions: &[f64]) -> bool {
        let Some(value) = self.values.get_mut(joint) else {
            return false;
        };
        if value.position.len() != positions.len() {
            return false;
        }
        value.position.copy_from_slice(positions);
        self.dirty = true;
        self.update_mimics(joint);
        true
    }

    pub fn set_position(&mut self, joint: &str, position: f64) -> bool {
        self.set_positions(joint, &[position])
    }

    pub fn set_velocities(&mut self, joint: &str, velocity: &[f64]) -> bool {
        self.set_dynamics(joint, velocity, |v| &mut v.velocity)
    }

    pub fn set_efforts(&mut self, joint: &str, effort: &[f64]) -> bool {
        self.set_dynamics(joint, effort, |v| &mut v.effort)
    }

    pub fn set_accelerations(&mut self, joint: &str, acceleration: &[f64]) -> bool {
        self.set_dynamics(joint, acceleration, |v| &mut v.acceleration)
    }

    /// Copy position and dynamics of `joint` from `value`.
    pub fn set_joint_value(&mut self, joint: &str, value: &JointValue) -> bool {
        if !self.set_positions(joint, &value.position) {
            return false;
        }
        if let Some(v) = self.values.get_mut(joint) {
            v.velocity.clone_from(&value.velocity);
            v.effort.clone_from(&value.effort);
            v.acceleration.clone_from(&value.acceleration);
        }
        true
    }

    fn set_dynamics(
        &mut self,
        joint: &str,
        values: &[f64],
        field: impl FnOnce(&mut JointValue) -> &mut Option<Vec<f64>>,
    ) -> bool {
        match self.values.get_mut(joint) {
            Some(v) if v.position.len() == values.len() => {
                *field(v) = Some(values.to_vec());
                true
            }
            _ => false,
        }
    }

    fn update_mimics(&mut self, source: &str) {
        let Some(source_value) = self.position(source) else {
            return;
        };
        let followers: Vec<(String, f64)> = self
            .model
            .joints()
            .filter_map(|j| {
                let mimic = j.mimic.as_ref()?;
                (mimic.joint == source)
                    .then(|| (j.name.clone(), mimic.multiplier * source_value + mimic.offset))
            })
            .collect();
        for (name, value) in followers {
            if let Some(v) = self.values.get_mut(&name) {
                if let [p] = v.position.as_mut_slice() {
                    *p = value;
                }
            }
        }
    }

    /// Every variable value, keyed by variable name.
    pub fn variable_values(&self) -> BTreeMap<String, f64> {
        self.model
            .joints()
            .filter_map(|j| self.values.get(&j.name).map(|v| (j, v)))
            .flat_map(|(j, v)| j.variable_names().into_iter().zip(v.position.clone()))
            .collect()
    }

    /// Copy the positions (and dynamics, when the arrays line up) of known
    /// single-variable joints.  Returns the number of joints updated.
    pub fn apply_joint_state(&mut self, msg: &JointStateMsg) -> usize {
        let with_velocity = msg.velocity.len() == msg.name.len();
        let with_effort = msg.effort.len() == msg.name.len();
        let mut updated = 0;
        for (i, (name, position)) in msg.name.iter().zip(&msg.position).enumerate() {
            if self.model.joint(name).map(|j| j.variable_count()) != Some(1) {
                continue;
            }
            if self.set_position(name, *position) {
                updated += 1;
                if with_velocity {
                    self.set_velocities(name, &msg.velocity[i..=i]);
                }
                if with_effort {
                    self.set_efforts(name, &msg.effort[i..=i]);
                }
            }
        }
        updated
    }

    /// Place multi-DOF joints at the given poses.  Returns the number of
    /// joints updated.
    pub fn apply_multi_dof(&mut self, joints: &[MultiDofJointValue]) -> usize {
        let mut updated = 0;
        for value in joints {
            let positions = self
                .model
                .joint(&value.joint_name)
                .and_then(|j| j.values_from_pose(&value.transform));
            if let Some(positions) = positions {
                if self.set_positions(&value.joint_name, &positions) {
                    updated += 1;
                }
            }
        }
        updated
    }

    /// Single-variable joints as a joint-state message.
    pub fn to_joint_state_msg(&self, stamp: Stamp) -> JointStateMsg {
        let mut msg = JointStateMsg {
            stamp,
            ..JointStateMsg::default()
        };
        for joint in self.model.joints().filter(|j| j.variable_count() == 1) {
            if let Some(p) = self.position(&joint.name) {
                msg.name.push(joint.name.clone());
                msg.position.push(p);
            }
        }
        msg
    }

    /// Multi-DOF joints as poses.
    pub fn multi_dof_msg(&self) -> Vec<MultiDofJointValue> {
        self.model
            .joints()
            .filter(|j| j.is_multi_dof())
            .filter_map(|j| {
                let pose = j.pose_from_values(self.positions(&j.name)?)?;
                Some(MultiDofJointValue {
                    joint_name: j.name.clone(),
                    transform: pose,
                })
            })
            .collect()
    }

    // ── Attached bodies ─────────────────────────────────────────────────────

    /// Attach `body`, returning a previously attached body with the same id.
    pub fn attach_body(&mut self, body: AttachedBody) -> Option<AttachedBody> {
        self.dirty = true;
        self.attached.insert(body.id.clone(), body)
    }

    pub fn detach_body(&mut self, id: &str) -> Option<AttachedBody> {
        let body = self.attached.remove(id);
        self.dirty |= body.is_some();
        body
    }

    pub fn attached_body(&self, id: &str) -> Option<&AttachedBody> {
        self.attached.get(id)
    }

    pub fn attached_bodies(&self) -> impl Iterator<Item = &AttachedBody> {
        self.attached.values()
    }

    /// Ids of bodies attached to `link`.
    pub fn attached_ids_on_link(&self, link: &str) -> Vec<String> {
        self.attached
            .values()
            .filter(|b| b.link_name == link)
            .map(|b| b.id.clone())
            .collect()
    }

    // ── Derived transforms ──────────────────────────────────────────────────

    /// True when joint values changed since the last [`update`][Self::update].
    pub fn needs_update(&self) -> bool {
        self.dirty
    }

    /// Mark derived link transforms as current.
    pub fn update(&mut self) {
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigil_types::{Quaternion, Vec3};

    fn model() -> Arc<RobotModel> {
        Arc::new(
            RobotModel::builder("bot")
                .link("odom")
                .link("base_link")
                .link("arm")
                .link("finger_l")
                .link("finger_r")
                .planar("base_joint", "odom", "base_link")
                .revolute("shoulder", "base_link", "arm", -1.0, 1.0)
                .prismatic("finger_left", "arm", "finger_l", 0.0, 0.04)
                .prismatic("finger_right", "arm", "finger_r", -0.04, 0.0)
                .mimic("finger_right", "finger_left", -1.0, 0.0)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn defaults_respect_bounds() {
        let state = RobotState::new(model());
        assert_eq!(state.position("shoulder"), Some(0.0));
        assert_eq!(state.positions("base_joint"), Some(&[0.0, 0.0, 0.0][..]));
        assert!(state.needs_update());
    }

    #[test]
    fn mimic_joints_follow_their_source() {
        let mut state = RobotState::new(model());
        assert!(state.set_position("finger_left", 0.03));
        assert_eq!(state.position("finger_right"), Some(-0.03));
    }

    #[test]
    fn apply_joint_state_ignores_unknown_and_multi_dof() {
        let mut state = RobotState::new(model());
        let msg = JointStateMsg::from_positions(
            Utc::now(),
            [("shoulder", 0.5), ("base_joint", 2.0), ("ghost", 1.0)],
        );
        assert_eq!(state.apply_joint_state(&msg), 1);
        assert_eq!(state.position("shoulder"), Some(0.5));
    }

    #[test]
    fn dynamics_copied_when_arrays_line_up() {
        let mut state = RobotState::new(model());
        let mut msg = JointStateMsg::from_positions(Utc::now(), [("shoulder", 0.5)]);
        msg.velocity = vec![0.1];
        state.apply_joint_state(&msg);
        let value = state.joint_value("shoulder").unwrap();
        assert_eq!(value.velocity.as_deref(), Some(&[0.1][..]));
        assert!(value.effort.is_none());
    }

    #[test]
    fn multi_dof_roundtrip_through_poses() {
        let mut state = RobotState::new(model());
        let pose = Pose::new(Vec3::new(1.0, -1.0, 0.0), Quaternion::from_yaw(0.5));
        let n = state.apply_multi_dof(&[MultiDofJointValue {
            joint_name: "base_joint".into(),
            transform: pose,
        }]);
        assert_eq!(n, 1);
        let back = state.multi_dof_msg();
        assert_eq!(back.len(), 1);
        assert!(back[0].transform.translation.distance(pose.translation) < 1e-12);
    }

    #[test]
    fn attach_and_detach() {
        let mut state = RobotState::new(model());
        state.update();
        let body = AttachedBody {
            id: "cup".into(),
            link_name: "arm".into(),
            shapes: vec![Shape::Sphere { radius: 0.05 }],
            poses: vec![Pose::identity()],
            touch_links: BTreeSet::new(),
        };
        assert!(state.attach_body(body).is_none());
        assert_eq!(state.attached_ids_on_link("arm"), vec!["cup".to_string()]);
        assert!(state.needs_update());
        assert!(state.detach_body("cup").is_some());
        assert!(state.detach_body("cup").is_none());
    }

    #[test]
    fn variable_values_use_variable_names() {
        let state = RobotState::new(model());
        let values = state.variable_values();
        assert!(values.contains_key("base_joint/theta"));
        assert!(values.contains_key("shoulder"));
    }
}

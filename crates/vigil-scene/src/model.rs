//! Robot model.
//!
//! A [`RobotModel`] is the immutable description of a robot: a tree of links
//! connected by joints, the bounds of every joint variable, which joints are
//! passive or mimic others, and named joint groups.  It carries collision
//! geometry per link but no kinematics solver.
//!
//! Models are assembled with [`RobotModelBuilder`], which rejects
//! inconsistent trees with [`VigilError::RobotModel`].

use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use vigil_types::{Pose, Quaternion, Shape, Vec3, VigilError};

// ────────────────────────────────────────────────────────────────────────────
// Joints
// ────────────────────────────────────────────────────────────────────────────

/// Kind of motion a joint allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointKind {
    Fixed,
    /// Rotation about one axis; `continuous` joints wrap around and have no
    /// position limits.
    Revolute { continuous: bool },
    Prismatic,
    /// Motion in the plane: `x`, `y`, `theta`.
    Planar,
    /// Free motion: `trans_x`, `trans_y`, `trans_z`, `rot_x`, `rot_y`,
    /// `rot_z`, `rot_w`.
    Floating,
}

impl JointKind {
    /// Number of scalar variables describing this joint.
    pub fn variable_count(self) -> usize {
        match self {
            JointKind::Fixed => 0,
            JointKind::Revolute { .. } | JointKind::Prismatic => 1,
            JointKind::Planar => 3,
            JointKind::Floating => 7,
        }
    }

    fn variable_suffixes(self) -> &'static [&'static str] {
        match self {
            JointKind::Planar => &["x", "y", "theta"],
            JointKind::Floating => &[
                "trans_x", "trans_y", "trans_z", "rot_x", "rot_y", "rot_z", "rot_w",
            ],
            _ => &[],
        }
    }
}

/// Position limits of one joint variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VariableBounds {
    pub min: f64,
    pub max: f64,
}

impl VariableBounds {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn unbounded() -> Self {
        Self::new(f64::NEG_INFINITY, f64::INFINITY)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// A joint whose position follows another joint: `multiplier * x + offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MimicSpec {
    pub joint: String,
    pub multiplier: f64,
    pub offset: f64,
}

/// One joint of a [`RobotModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointModel {
    pub name: String,
    pub kind: JointKind,
    pub parent_link: String,
    pub child_link: String,
    /// Pose of the child link in the parent link at the zero position.
    pub origin: Pose,
    /// One entry per variable.
    pub bounds: Vec<VariableBounds>,
    /// Not actuated; its state is not required to be known.
    pub passive: bool,
    pub mimic: Option<MimicSpec>,
}

impl JointModel {
    pub fn variable_count(&self) -> usize {
        self.kind.variable_count()
    }

    pub fn is_continuous(&self) -> bool {
        matches!(self.kind, JointKind::Revolute { continuous: true })
    }

    pub fn is_multi_dof(&self) -> bool {
        self.variable_count() > 1
    }

    /// Non-fixed joints that do not mimic another joint.
    pub fn is_active(&self) -> bool {
        self.kind != JointKind::Fixed && self.mimic.is_none()
    }

    /// Joints whose state must be known for a robot state to be complete.
    pub fn requires_state(&self) -> bool {
        self.is_active() && !self.passive
    }

    /// Variable names: the joint name itself for single-variable joints,
    /// `<joint>/<variable>` otherwise.
    pub fn variable_names(&self) -> Vec<String> {
        match self.variable_count() {
            0 => Vec::new(),
            1 => vec![self.name.clone()],
            _ => self
                .kind
                .variable_suffixes()
                .iter()
                .map(|suffix| format!("{}/{suffix}", self.name))
                .collect(),
        }
    }

    /// Default variable values: zero when zero is within bounds, the middle
    /// of the bounds otherwise, identity orientation for floating joints.
    pub fn default_positions(&self) -> Vec<f64> {
        match self.kind {
            JointKind::Fixed => Vec::new(),
            JointKind::Floating => vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
            _ => self
                .bounds
                .iter()
                .map(|b| {
                    if b.contains(0.0) {
                        0.0
                    } else if b.min.is_finite() && b.max.is_finite() {
                        (b.min + b.max) / 2.0
                    } else if b.min.is_finite() {
                        b.min
                    } else {
                        b.max
                    }
                })
                .collect(),
        }
    }

    /// Pull values lying outside their bounds by at most `tolerance` onto
    /// the bound.  Values further out are left alone; continuous joints are
    /// never touched.  Returns `true` if anything moved.
    pub fn clamp_near_bounds(&self, values: &mut [f64], tolerance: f64) -> bool {
        if self.is_continuous() {
            return false;
        }
        let mut changed = false;
        for (v, b) in values.iter_mut().zip(&self.bounds) {
            if *v < b.min && *v >= b.min - tolerance {
                *v = b.min;
                changed = true;
            } else if *v > b.max && *v <= b.max + tolerance {
                *v = b.max;
                changed = true;
            }
        }
        changed
    }

    pub fn satisfies_bounds(&self, values: &[f64], tolerance: f64) -> bool {
        self.is_continuous()
            || values
                .iter()
                .zip(&self.bounds)
                .all(|(v, b)| *v >= b.min - tolerance && *v <= b.max + tolerance)
    }

    /// Distance between two value vectors of this joint.
    ///
    /// Multi-DOF joints sum the translational distance and the rotation
    /// angle between the two poses.
    pub fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        match self.kind {
            JointKind::Fixed => 0.0,
            JointKind::Revolute { continuous: true } => match (a.first(), b.first()) {
                (Some(x), Some(y)) => {
                    let d = (x - y).rem_euclid(2.0 * PI);
                    d.min(2.0 * PI - d)
                }
                _ => f64::INFINITY,
            },
            JointKind::Revolute { .. } | JointKind::Prismatic => match (a.first(), b.first()) {
                (Some(x), Some(y)) => (x - y).abs(),
                _ => f64::INFINITY,
            },
            JointKind::Planar | JointKind::Floating => {
                match (self.pose_from_values(a), self.pose_from_values(b)) {
                    (Some(p), Some(q)) => {
                        p.translation.distance(q.translation) + p.rotation.angle_to(q.rotation)
                    }
                    _ => f64::INFINITY,
                }
            }
        }
    }

    /// Variable values of a multi-DOF joint placed at `pose`.
    pub fn values_from_pose(&self, pose: &Pose) -> Option<Vec<f64>> {
        let t = pose.translation;
        let q = pose.rotation;
        match self.kind {
            JointKind::Planar => Some(vec![t.x, t.y, q.yaw()]),
            JointKind::Floating => Some(vec![t.x, t.y, t.z, q.x, q.y, q.z, q.w]),
            _ => None,
        }
    }

    /// Pose described by the variable values of a multi-DOF joint.
    pub fn pose_from_values(&self, values: &[f64]) -> Option<Pose> {
        match (self.kind, values) {
            (JointKind::Planar, [x, y, theta]) => {
                Some(Pose::new(Vec3::new(*x, *y, 0.0), Quaternion::from_yaw(*theta)))
            }
            (JointKind::Floating, [x, y, z, qx, qy, qz, qw]) => Some(Pose::new(
                Vec3::new(*x, *y, *z),
                Quaternion::new(*qw, *qx, *qy, *qz),
            )),
            _ => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Links and groups
// ────────────────────────────────────────────────────────────────────────────

/// One link of a [`RobotModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkModel {
    pub name: String,
    /// `None` for the root link.
    pub parent_joint: Option<String>,
    pub collision_shapes: Vec<Shape>,
    /// Pose of each collision shape in the link frame.
    pub collision_origins: Vec<Pose>,
}

impl LinkModel {
    pub fn has_collision_geometry(&self) -> bool {
        !self.collision_shapes.is_empty()
    }
}

/// A named subset of joints, e.g. an arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointGroup {
    pub name: String,
    pub joints: Vec<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// RobotModel
// ────────────────────────────────────────────────────────────────────────────

/// Immutable description of a robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotModel {
    name: String,
    model_frame: String,
    root_link: String,
    links: BTreeMap<String, LinkModel>,
    joints: BTreeMap<String, JointModel>,
    groups: BTreeMap<String, JointGroup>,
}

impl RobotModel {
    pub fn builder(name: impl Into<String>) -> RobotModelBuilder {
        RobotModelBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frame in which the scene expresses world geometry.
    pub fn model_frame(&self) -> &str {
        &self.model_frame
    }

    pub fn root_link(&self) -> &str {
        &self.root_link
    }

    pub fn joint(&self, name: &str) -> Option<&JointModel> {
        self.joints.get(name)
    }

    pub fn link(&self, name: &str) -> Option<&LinkModel> {
        self.links.get(name)
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.links.contains_key(name)
    }

    pub fn joints(&self) -> impl Iterator<Item = &JointModel> {
        self.joints.values()
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkModel> {
        self.links.values()
    }

    /// Joints whose state must be known for the robot state to be complete.
    pub fn required_joints(&self) -> impl Iterator<Item = &JointModel> {
        self.joints.values().filter(|j| j.requires_state())
    }

    /// Active planar and floating joints.
    pub fn multi_dof_joints(&self) -> impl Iterator<Item = &JointModel> {
        self.joints
            .values()
            .filter(|j| j.is_multi_dof() && j.is_active())
    }

    /// Every variable name, in joint-name order.
    pub fn variable_names(&self) -> Vec<String> {
        self.joints.values().flat_map(JointModel::variable_names).collect()
    }

    pub fn group(&self, name: &str) -> Option<&JointGroup> {
        self.groups.get(name)
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RobotModelBuilder
// ────────────────────────────────────────────────────────────────────────────

/// Assembles a [`RobotModel`] and validates it on [`build`][Self::build].
#[derive(Debug, Clone)]
pub struct RobotModelBuilder {
    name: String,
    model_frame: Option<String>,
    links: Vec<LinkModel>,
    joints: Vec<JointModel>,
    groups: Vec<JointGroup>,
}

impl RobotModelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_frame: None,
            links: Vec::new(),
            joints: Vec::new(),
            groups: Vec::new(),
        }
    }

    /// Defaults to the root link.
    pub fn model_frame(mut self, frame: impl Into<String>) -> Self {
        self.model_frame = Some(frame.into());
        self
    }

    pub fn link(mut self, name: impl Into<String>) -> Self {
        self.links.push(LinkModel {
            name: name.into(),
            parent_joint: None,
            collision_shapes: Vec::new(),
            collision_origins: Vec::new(),
        });
        self
    }

    /// Add collision geometry to an already declared link.
    pub fn collision(mut self, link: &str, shape: Shape, origin: Pose) -> Self {
        if let Some(l) = self.links.iter_mut().find(|l| l.name == link) {
            l.collision_shapes.push(shape);
            l.collision_origins.push(origin);
        }
        self
    }

    pub fn joint(mut self, joint: JointModel) -> Self {
        self.joints.push(joint);
        self
    }

    pub fn fixed(self, name: &str, parent: &str, child: &str, origin: Pose) -> Self {
        self.joint(Self::make(name, JointKind::Fixed, parent, child, origin, Vec::new()))
    }

    pub fn revolute(self, name: &str, parent: &str, child: &str, min: f64, max: f64) -> Self {
        self.joint(Self::make(
            name,
            JointKind::Revolute { continuous: false },
            parent,
            child,
            Pose::identity(),
            vec![VariableBounds::new(min, max)],
        ))
    }

    pub fn continuous(self, name: &str, parent: &str, child: &str) -> Self {
        self.joint(Self::make(
            name,
            JointKind::Revolute { continuous: true },
            parent,
            child,
            Pose::identity(),
            vec![VariableBounds::new(-PI, PI)],
        ))
    }

    pub fn prismatic(self, name: &str, parent: &str, child: &str, min: f64, max: f64) -> Self {
        self.joint(Self::make(
            name,
            JointKind::Prismatic,
            parent,
            child,
            Pose::identity(),
            vec![VariableBounds::new(min, max)],
        ))
    }

    pub fn planar(self, name: &str, parent: &str, child: &str) -> Self {
        self.joint(Self::make(
            name,
            JointKind::Planar,
            parent,
            child,
            Pose::identity(),
            vec![VariableBounds::unbounded(); 3],
        ))
    }

    pub fn floating(self, name: &str, parent: &str, child: &str) -> Self {
        self.joint(Self::make(
            name,
            JointKind::Floating,
            parent,
            child,
            Pose::identity(),
            vec![VariableBounds::unbounded(); 7],
        ))
    }

    /// Mark an already declared joint passive.
    pub fn passive(mut self, joint: &str) -> Self {
        if let Some(j) = self.joints.iter_mut().find(|j| j.name == joint) {
            j.passive = true;
        }
        self
    }

    /// Make an already declared joint follow `of`.
    pub fn mimic(mut self, joint: &str, of: &str, multiplier: f64, offset: f64) -> Self {
        if let Some(j) = self.joints.iter_mut().find(|j| j.name == joint) {
            j.mimic = Some(MimicSpec {
                joint: of.to_string(),
                multiplier,
                offset,
            });
        }
        self
    }

    pub fn group<'a>(mut self, name: &str, joints: impl IntoIterator<Item = &'a str>) -> Self {
        self.groups.push(JointGroup {
            name: name.to_string(),
            joints: joints.into_iter().map(str::to_string).collect(),
        });
        self
    }

    fn make(
        name: &str,
        kind: JointKind,
        parent: &str,
        child: &str,
        origin: Pose,
        bounds: Vec<VariableBounds>,
    ) -> JointModel {
        JointModel {
            name: name.to_string(),
            kind,
            parent_link: parent.to_string(),
            child_link: child.to_string(),
            origin,
            bounds,
            passive: false,
            mimic: None,
        }
    }

    pub fn build(self) -> Result<RobotModel, VigilError> {
        let invalid = |msg: String| VigilError::RobotModel(format!("{}: {msg}", self.name));

        let mut links: BTreeMap<String, LinkModel> = BTreeMap::new();
        for link in &self.links {
            if links.insert(link.name.clone(), link.clone()).is_some() {
                return Err(invalid(format!("link '{}' declared twice", link.name)));
            }
        }
        if links.is_empty() {
            return Err(invalid("model has no links".into()));
        }

        let mut joints: BTreeMap<String, JointModel> = BTreeMap::new();
        for joint in &self.joints {
            for link in [&joint.parent_link, &joint.child_link] {
                if !links.contains_key(link) {
                    return Err(invalid(format!(
                        "joint '{}' references unknown link '{link}'",
                        joint.name
                    )));
                }
            }
            if joint.bounds.len() != joint.variable_count() {
                return Err(invalid(format!(
                    "joint '{}' has {} bounds for {} variables",
                    joint.name,
                    joint.bounds.len(),
                    joint.variable_count()
                )));
            }
            if joint.bounds.iter().any(|b| b.min > b.max) {
                return Err(invalid(format!("joint '{}' has inverted bounds", joint.name)));
            }
            let child = links
                .get_mut(&joint.child_link)
                .ok_or_else(|| invalid(format!("unknown link '{}'", joint.child_link)))?;
            if let Some(existing) = &child.parent_joint {
                return Err(invalid(format!(
                    "link '{}' has two parent joints: '{existing}' and '{}'",
                    joint.child_link, joint.name
                )));
            }
            child.parent_joint = Some(joint.name.clone());
            if joints.insert(joint.name.clone(), joint.clone()).is_some() {
                return Err(invalid(format!("joint '{}' declared twice", joint.name)));
            }
        }

        for joint in joints.values() {
            if let Some(mimic) = &joint.mimic {
                if !joints.contains_key(&mimic.joint) || mimic.joint == joint.name {
                    return Err(invalid(format!(
                        "joint '{}' mimics unknown joint '{}'",
                        joint.name, mimic.joint
                    )));
                }
            }
        }

        let roots: Vec<&String> = links
            .values()
            .filter(|l| l.parent_joint.is_none())
            .map(|l| &l.name)
            .collect();
        let root_link = match roots.as_slice() {
            [root] => (*root).clone(),
            [] => return Err(invalid("kinematic tree has a cycle".into())),
            many => {
                return Err(invalid(format!(
                    "kinematic tree has {} roots",
                    many.len()
                )));
            }
        };

        // Every link must reach the root by walking parent joints.
        for link in links.values() {
            let mut seen = BTreeSet::new();
            let mut current = link;
            while let Some(joint) = current.parent_joint.as_ref().and_then(|j| joints.get(j)) {
                if !seen.insert(current.name.clone()) {
                    return Err(invalid(format!("link '{}' is part of a cycle", link.name)));
                }
                match links.get(&joint.parent_link) {
                    Some(parent) => current = parent,
                    None => break,
                }
            }
        }

        let mut groups = BTreeMap::new();
        for group in self.groups.iter().cloned() {
            if let Some(unknown) = group.joints.iter().find(|j| !joints.contains_key(*j)) {
                return Err(invalid(format!(
                    "group '{}' references unknown joint '{unknown}'",
                    group.name
                )));
            }
            groups.insert(group.name.clone(), group);
        }

        Ok(RobotModel {
            model_frame: self.model_frame.clone().unwrap_or_else(|| root_link.clone()),
            name: self.name.clone(),
            root_link,
            links,
            joints,
            groups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arm() -> RobotModel {
        RobotModel::builder("arm")
            .link("base_link")
            .link("upper")
            .link("lower")
            .link("finger")
            .revolute("shoulder", "base_link", "upper", -1.5, 1.5)
            .continuous("wrist", "upper", "lower")
            .prismatic("gripper", "lower", "finger", 0.0, 0.04)
            .passive("gripper")
            .group("manipulator", ["shoulder", "wrist"])
            .build()
            .unwrap()
    }

    #[test]
    fn model_survives_json() {
        let model = arm();
        let json = serde_json::to_string(&model).unwrap();
        let back: RobotModel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, model);
        assert!(back.joint("wrist").unwrap().is_continuous());
    }

    #[test]
    fn model_frame_defaults_to_root() {
        let model = arm();
        assert_eq!(model.root_link(), "base_link");
        assert_eq!(model.model_frame(), "base_link");
    }

    #[test]
    fn passive_joints_are_not_required() {
        let model = arm();
        let required: Vec<&str> = model.required_joints().map(|j| j.name.as_str()).collect();
        assert_eq!(required, vec!["shoulder", "wrist"]);
    }

    #[test]
    fn multi_dof_variable_names() {
        let model = RobotModel::builder("base")
            .link("odom")
            .link("base_link")
            .planar("base_joint", "odom", "base_link")
            .build()
            .unwrap();
        assert_eq!(
            model.variable_names(),
            vec!["base_joint/x", "base_joint/y", "base_joint/theta"]
        );
    }

    #[test]
    fn default_position_is_midpoint_when_zero_out_of_bounds() {
        let model = RobotModel::builder("lift")
            .link("base_link")
            .link("carriage")
            .prismatic("lift", "base_link", "carriage", 0.2, 0.6)
            .build()
            .unwrap();
        let defaults = model.joint("lift").unwrap().default_positions();
        assert!((defaults[0] - 0.4).abs() < 1e-12);
    }

    #[test]
    fn clamp_only_within_tolerance() {
        let model = arm();
        let shoulder = model.joint("shoulder").unwrap();
        let mut near = [1.5 + 5e-7];
        assert!(shoulder.clamp_near_bounds(&mut near, 1e-6));
        assert_eq!(near[0], 1.5);

        let mut far = [1.6];
        assert!(!shoulder.clamp_near_bounds(&mut far, 1e-6));
        assert_eq!(far[0], 1.6);
    }

    #[test]
    fn continuous_joints_are_never_clamped() {
        let model = arm();
        let wrist = model.joint("wrist").unwrap();
        let mut v = [PI + 1e-9];
        assert!(!wrist.clamp_near_bounds(&mut v, 1e-6));
        assert!(wrist.distance(&[PI - 0.1], &[-PI + 0.1]) < 0.2 + 1e-9);
    }

    #[test]
    fn planar_pose_roundtrip() {
        let model = RobotModel::builder("base")
            .link("odom")
            .link("base_link")
            .planar("base_joint", "odom", "base_link")
            .build()
            .unwrap();
        let joint = model.joint("base_joint").unwrap();
        let pose = Pose::new(Vec3::new(1.0, 2.0, 0.0), Quaternion::from_yaw(0.3));
        let values = joint.values_from_pose(&pose).unwrap();
        assert!(joint.distance(&values, &joint.values_from_pose(&pose).unwrap()) < 1e-12);
        assert!((values[2] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn unknown_link_is_rejected() {
        let err = RobotModel::builder("broken")
            .link("base_link")
            .revolute("j", "base_link", "ghost", -1.0, 1.0)
            .build()
            .unwrap_err();
        assert!(matches!(err, VigilError::RobotModel(msg) if msg.contains("ghost")));
    }

    #[test]
    fn two_roots_are_rejected() {
        let err = RobotModel::builder("broken")
            .link("a")
            .link("b")
            .build()
            .unwrap_err();
        assert!(matches!(err, VigilError::RobotModel(_)));
    }

    #[test]
    fn unknown_group_joint_is_rejected() {
        let err = RobotModel::builder("broken")
            .link("base_link")
            .group("arm", ["elbow"])
            .build()
            .unwrap_err();
        assert!(matches!(err, VigilError::RobotModel(msg) if msg.contains("elbow")));
    }
}

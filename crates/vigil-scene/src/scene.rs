//! Scene content and the diff chain.
//!
//! [`SceneData`] is one complete snapshot: robot state, world objects,
//! collision configuration, fixed frames and the occupancy overlay.
//!
//! [`SceneChain`] owns a root snapshot and, while *coupled*, a diff overlay
//! on top of it.  Every mutation goes to the overlay (or to the root when
//! decoupled) and is recorded, so the chain can produce a diff message
//! describing exactly what changed since the overlay was last folded into
//! the root.
//!
//! ```text
//!   decoupled:  root  <- mutations
//!   coupled:    root  <- overlay <- mutations
//!                        (changes recorded)
//! ```
//!
//! Attach/detach and world-object changes are reported to registered
//! [`SceneObjectObserver`]s unless the registry is
//! [`ObserverState::Suppressed`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use vigil_types::{
    AttachedCollisionObjectMsg, CollisionObjectMsg, ObjectOperation, OctomapMsg, RobotStateMsg,
    SceneMsg, Stamp, StampedTransform, VigilError, WorldMsg,
};

use crate::collision::{AllowedCollisionMatrix, CollisionPadding};
use crate::model::RobotModel;
use crate::robot_state::{AttachedBody, RobotState};
use crate::world::{CollisionObject, World};

/// Id under which the occupancy overlay is known to the outside world.
pub const OCTOMAP_ID: &str = "<octomap>";

// ────────────────────────────────────────────────────────────────────────────
// SceneData
// ────────────────────────────────────────────────────────────────────────────

/// One complete scene snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneData {
    pub name: String,
    pub robot_state: RobotState,
    pub world: World,
    pub acm: AllowedCollisionMatrix,
    pub padding: CollisionPadding,
    /// Fixed transforms keyed by child frame.
    pub fixed_transforms: BTreeMap<String, StampedTransform>,
    pub octomap: Option<OctomapMsg>,
}

impl SceneData {
    pub fn new(model: Arc<RobotModel>) -> Self {
        Self {
            name: String::new(),
            robot_state: RobotState::new(model),
            world: World::new(),
            acm: AllowedCollisionMatrix::new(),
            padding: CollisionPadding::default(),
            fixed_transforms: BTreeMap::new(),
            octomap: None,
        }
    }

    pub fn model(&self) -> &Arc<RobotModel> {
        self.robot_state.model()
    }

    /// Frames geometry may be expressed in: the model frame, robot links,
    /// fixed frames, attached bodies and world objects.  The empty frame
    /// means the model frame.
    pub fn knows_frame(&self, frame: &str) -> bool {
        let model = self.model();
        frame.is_empty()
            || frame == model.model_frame()
            || model.has_link(frame)
            || self
                .fixed_transforms
                .values()
                .any(|t| t.child_frame == frame || t.parent_frame == frame)
            || self.robot_state.attached_body(frame).is_some()
            || self.world.contains(frame)
    }

    /// Full (non-diff) message describing this snapshot.
    pub fn to_msg(&self, stamp: Stamp) -> SceneMsg {
        SceneMsg {
            name: self.name.clone(),
            robot_model_name: self.model().name().to_string(),
            robot_state: RobotStateMsg {
                joint_state: self.robot_state.to_joint_state_msg(stamp),
                multi_dof_joints: self.robot_state.multi_dof_msg(),
                attached_collision_objects: self
                    .robot_state
                    .attached_bodies()
                    .map(AttachedBody::to_msg)
                    .collect(),
                is_diff: false,
            },
            fixed_frame_transforms: self.fixed_transforms.values().cloned().collect(),
            allowed_collision_matrix: self.acm.to_msg(),
            link_padding: self.padding.padding_msg(),
            link_scale: self.padding.scale_msg(),
            world: WorldMsg {
                collision_objects: self.world.objects().map(CollisionObject::to_msg).collect(),
                octomap: self.octomap.clone(),
            },
            is_diff: false,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Observers
// ────────────────────────────────────────────────────────────────────────────

/// A change to the set of rigid bodies in the scene.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneObjectEvent {
    BodyAttached(AttachedBody),
    BodyDetached(AttachedBody),
    /// Created, extended or moved.
    WorldObjectUpdated(CollisionObject),
    WorldObjectRemoved(CollisionObject),
}

pub type SceneObjectObserver = Arc<dyn Fn(&SceneObjectEvent) + Send + Sync>;

/// Whether object observers are called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObserverState {
    #[default]
    Active,
    /// Events are dropped, e.g. while the chain is being restructured.
    Suppressed,
}

// ────────────────────────────────────────────────────────────────────────────
// SceneChain
// ────────────────────────────────────────────────────────────────────────────

/// Parts of the overlay that differ from the root.
#[derive(Debug, Clone, Default, PartialEq)]
struct DiffRecord {
    name: bool,
    robot_state: bool,
    attached: BTreeSet<String>,
    world: BTreeSet<String>,
    acm: bool,
    padding: bool,
    transforms: bool,
    octomap: bool,
}

impl DiffRecord {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// The owned `{root, optional diff overlay}` pair.
pub struct SceneChain {
    root: SceneData,
    overlay: Option<SceneData>,
    changes: DiffRecord,
    observers: Vec<SceneObjectObserver>,
    observer_state: ObserverState,
}

impl fmt::Debug for SceneChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneChain")
            .field("name", &self.current().name)
            .field("coupled", &self.is_coupled())
            .field("observers", &self.observers.len())
            .field("observer_state", &self.observer_state)
            .finish_non_exhaustive()
    }
}

impl SceneChain {
    /// A decoupled chain whose root is `root`.
    pub fn new(root: SceneData) -> Self {
        Self {
            root,
            overlay: None,
            changes: DiffRecord::default(),
            observers: Vec::new(),
            observer_state: ObserverState::Active,
        }
    }

    /// The live scene: the overlay when coupled, the root otherwise.
    pub fn current(&self) -> &SceneData {
        self.overlay.as_ref().unwrap_or(&self.root)
    }

    /// The root the overlay is a diff against, when coupled.
    pub fn parent(&self) -> Option<&SceneData> {
        self.overlay.as_ref().map(|_| &self.root)
    }

    pub fn is_coupled(&self) -> bool {
        self.overlay.is_some()
    }

    /// True when the overlay holds changes not yet pushed to the root.
    pub fn has_diffs(&self) -> bool {
        self.is_coupled() && !self.changes.is_empty()
    }

    /// Wrap the root in a fresh, empty overlay.  No-op when coupled.
    pub fn couple(&mut self) {
        if self.overlay.is_none() {
            self.overlay = Some(self.root.clone());
            self.changes = DiffRecord::default();
        }
    }

    /// Fold the overlay into a new standalone root.  No-op when decoupled.
    pub fn decouple(&mut self) {
        if let Some(overlay) = self.overlay.take() {
            self.root = overlay;
            self.changes = DiffRecord::default();
        }
    }

    /// Copy the recorded changes from the overlay into the root.
    pub fn push_diffs(&mut self) {
        let Some(overlay) = self.overlay.as_ref() else {
            return;
        };
        let changes = std::mem::take(&mut self.changes);
        let root = &mut self.root;
        if changes.name {
            root.name = overlay.name.clone();
        }
        if changes.robot_state || !changes.attached.is_empty() {
            root.robot_state = overlay.robot_state.clone();
        }
        for id in &changes.world {
            match overlay.world.get(id) {
                Some(object) => {
                    root.world.insert(object.clone());
                }
                None => {
                    root.world.remove(id);
                }
            }
        }
        if changes.acm {
            root.acm = overlay.acm.clone();
        }
        if changes.padding {
            root.padding = overlay.padding.clone();
        }
        if changes.transforms {
            root.fixed_transforms = overlay.fixed_transforms.clone();
        }
        if changes.octomap {
            root.octomap = overlay.octomap.clone();
        }
    }

    /// Drop the overlay's changes, resetting it to the root.
    pub fn clear_diffs(&mut self) {
        if let Some(overlay) = self.overlay.as_mut() {
            *overlay = self.root.clone();
            self.changes = DiffRecord::default();
        }
    }

    // ── Observers ───────────────────────────────────────────────────────────

    pub fn add_observer(&mut self, observer: SceneObjectObserver) {
        self.observers.push(observer);
    }

    pub fn clear_observers(&mut self) {
        self.observers.clear();
    }

    pub fn observer_state(&self) -> ObserverState {
        self.observer_state
    }

    pub fn set_observer_state(&mut self, state: ObserverState) {
        self.observer_state = state;
    }

    /// Run `f` with observers suppressed, restoring the previous state after.
    pub fn with_observers_suppressed<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let previous = std::mem::replace(&mut self.observer_state, ObserverState::Suppressed);
        let result = f(self);
        self.observer_state = previous;
        result
    }

    fn emit(&self, events: Vec<SceneObjectEvent>) {
        if self.observer_state == ObserverState::Suppressed || events.is_empty() {
            return;
        }
        for observer in &self.observers {
            for event in &events {
                observer(event);
            }
        }
    }

    // ── Mutation ────────────────────────────────────────────────────────────

    fn parts(&mut self) -> (&mut SceneData, &mut DiffRecord) {
        let data = match self.overlay.as_mut() {
            Some(overlay) => overlay,
            None => &mut self.root,
        };
        (data, &mut self.changes)
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        let (data, changes) = self.parts();
        data.name = name.into();
        changes.name = true;
    }

    /// Mutate the live robot state.
    pub fn modify_robot_state<R>(&mut self, f: impl FnOnce(&mut RobotState) -> R) -> R {
        let (data, changes) = self.parts();
        changes.robot_state = true;
        f(&mut data.robot_state)
    }

    pub fn modify_acm<R>(&mut self, f: impl FnOnce(&mut AllowedCollisionMatrix) -> R) -> R {
        let (data, changes) = self.parts();
        changes.acm = true;
        f(&mut data.acm)
    }

    pub fn modify_padding<R>(&mut self, f: impl FnOnce(&mut CollisionPadding) -> R) -> R {
        let (data, changes) = self.parts();
        changes.padding = true;
        f(&mut data.padding)
    }

    /// Replace every fixed frame transform.
    pub fn set_fixed_transforms(&mut self, transforms: impl IntoIterator<Item = StampedTransform>) {
        let (data, changes) = self.parts();
        data.fixed_transforms = transforms
            .into_iter()
            .map(|t| (t.child_frame.clone(), t))
            .collect();
        changes.transforms = true;
    }

    pub fn set_octomap(&mut self, octomap: Option<OctomapMsg>) {
        let (data, changes) = self.parts();
        data.octomap = octomap;
        changes.octomap = true;
    }

    /// Remove every world object.
    pub fn clear_world_objects(&mut self) {
        let mut events = Vec::new();
        self.drain_world(&mut events);
        self.emit(events);
    }

    /// Apply one collision-object edit.
    ///
    /// Returns `Ok(false)` when the edit referred to an object that does not
    /// exist, and an error when it was rejected.
    pub fn process_collision_object(&mut self, msg: &CollisionObjectMsg) -> Result<bool, VigilError> {
        let mut events = Vec::new();
        let result = self.apply_collision_object(msg, &mut events);
        self.emit(events);
        result
    }

    /// Apply one attach/detach edit.
    pub fn process_attached_object(
        &mut self,
        msg: &AttachedCollisionObjectMsg,
    ) -> Result<bool, VigilError> {
        let mut events = Vec::new();
        let result = self.apply_attached_object(msg, &mut events);
        self.emit(events);
        result
    }

    /// Replace the world with `msg`: every object is removed, then the
    /// message's objects and occupancy overlay are applied.
    pub fn process_world_msg(&mut self, msg: &WorldMsg) -> Result<(), VigilError> {
        let mut events = Vec::new();
        let mut first_error = None;
        self.replace_world(msg, &mut events, &mut first_error);
        self.emit(events);
        first_error.map_or(Ok(()), Err)
    }

    /// Apply a full or diff scene message.
    ///
    /// A full message replaces all content; when coupled it becomes the new
    /// root and the overlay is reset to it.  A diff message merges its
    /// non-empty parts.  Parts that fail are skipped and the first failure
    /// is returned after the rest of the message was applied.
    pub fn apply_scene_msg(&mut self, msg: &SceneMsg) -> Result<(), VigilError> {
        let mut events = Vec::new();
        let mut first_error = None;
        if msg.is_diff {
            self.apply_diff(msg, &mut events, &mut first_error);
        } else {
            self.apply_full(msg, &mut events, &mut first_error);
            if let Some(overlay) = &self.overlay {
                self.root = overlay.clone();
                self.changes = DiffRecord::default();
            }
        }
        self.emit(events);
        first_error.map_or(Ok(()), Err)
    }

    fn apply_full(
        &mut self,
        msg: &SceneMsg,
        events: &mut Vec<SceneObjectEvent>,
        errors: &mut Option<VigilError>,
    ) {
        self.set_name(msg.name.clone());
        self.set_fixed_transforms(msg.fixed_frame_transforms.iter().cloned());
        self.apply_robot_state(&msg.robot_state, true, events, errors);
        self.modify_acm(|acm| *acm = AllowedCollisionMatrix::from_msg(&msg.allowed_collision_matrix));
        self.modify_padding(|p| p.apply_msg(&msg.link_padding, &msg.link_scale, true));
        self.replace_world(&msg.world, events, errors);
    }

    fn apply_diff(
        &mut self,
        msg: &SceneMsg,
        events: &mut Vec<SceneObjectEvent>,
        errors: &mut Option<VigilError>,
    ) {
        if !msg.name.is_empty() {
            self.set_name(msg.name.clone());
        }
        if !msg.fixed_frame_transforms.is_empty() {
            self.set_fixed_transforms(msg.fixed_frame_transforms.iter().cloned());
        }
        if !msg.robot_state.is_empty() {
            self.apply_robot_state(&msg.robot_state, false, events, errors);
        }
        if !msg.allowed_collision_matrix.is_empty() {
            self.modify_acm(|acm| acm.merge_msg(&msg.allowed_collision_matrix));
        }
        if !msg.link_padding.is_empty() || !msg.link_scale.is_empty() {
            self.modify_padding(|p| p.apply_msg(&msg.link_padding, &msg.link_scale, false));
        }
        for object in &msg.world.collision_objects {
            keep_first(errors, self.apply_collision_object(object, events));
        }
        if !msg.world.octomap_is_empty() {
            self.set_octomap(msg.world.octomap.clone());
        }
    }

    fn apply_robot_state(
        &mut self,
        msg: &RobotStateMsg,
        replace: bool,
        events: &mut Vec<SceneObjectEvent>,
        errors: &mut Option<VigilError>,
    ) {
        let replace = replace || !msg.is_diff;
        let (data, changes) = self.parts();
        data.robot_state.apply_joint_state(&msg.joint_state);
        data.robot_state.apply_multi_dof(&msg.multi_dof_joints);
        changes.robot_state = true;
        if replace {
            let ids: Vec<String> = data.robot_state.attached_bodies().map(|b| b.id.clone()).collect();
            for id in ids {
                if let Some(body) = data.robot_state.detach_body(&id) {
                    changes.attached.insert(id);
                    events.push(SceneObjectEvent::BodyDetached(body));
                }
            }
        }
        for attached in &msg.attached_collision_objects {
            keep_first(errors, self.apply_attached_object(attached, events));
        }
    }

    fn replace_world(
        &mut self,
        msg: &WorldMsg,
        events: &mut Vec<SceneObjectEvent>,
        errors: &mut Option<VigilError>,
    ) {
        self.drain_world(events);
        let octomap = (!msg.octomap_is_empty()).then(|| msg.octomap.clone()).flatten();
        self.set_octomap(octomap);
        for object in &msg.collision_objects {
            keep_first(errors, self.apply_collision_object(object, events));
        }
    }

    fn drain_world(&mut self, events: &mut Vec<SceneObjectEvent>) {
        let (data, changes) = self.parts();
        for object in data.world.drain() {
            changes.world.insert(object.id.clone());
            events.push(SceneObjectEvent::WorldObjectRemoved(object));
        }
    }

    fn apply_collision_object(
        &mut self,
        msg: &CollisionObjectMsg,
        events: &mut Vec<SceneObjectEvent>,
    ) -> Result<bool, VigilError> {
        let (data, changes) = self.parts();
        if msg.id == OCTOMAP_ID {
            return Err(VigilError::InvalidObject(format!(
                "'{OCTOMAP_ID}' is reserved for the occupancy overlay"
            )));
        }
        if msg.operation != ObjectOperation::Remove && !data.knows_frame(&msg.frame_id) {
            return Err(VigilError::UnknownFrame(msg.frame_id.clone()));
        }
        let frame_id = if msg.frame_id.is_empty() {
            data.model().model_frame().to_string()
        } else {
            msg.frame_id.clone()
        };

        match msg.operation {
            ObjectOperation::Add | ObjectOperation::Append => {
                check_shapes(&msg.id, msg.shapes.len(), msg.poses.len())?;
                if msg.operation == ObjectOperation::Append {
                    if let Some(existing) = data.world.get_mut(&msg.id) {
                        if existing.frame_id != frame_id {
                            return Err(VigilError::InvalidObject(format!(
                                "cannot append to '{}' in a different frame",
                                msg.id
                            )));
                        }
                        existing.shapes.extend(msg.shapes.iter().cloned());
                        existing.poses.extend(msg.poses.iter().cloned());
                        let object = existing.clone();
                        changes.world.insert(msg.id.clone());
                        events.push(SceneObjectEvent::WorldObjectUpdated(object));
                        return Ok(true);
                    }
                }
                if let Some(old) = data.world.remove(&msg.id) {
                    events.push(SceneObjectEvent::WorldObjectRemoved(old));
                }
                let object = CollisionObject {
                    id: msg.id.clone(),
                    frame_id,
                    shapes: msg.shapes.clone(),
                    poses: msg.poses.clone(),
                };
                data.world.insert(object.clone());
                changes.world.insert(msg.id.clone());
                events.push(SceneObjectEvent::WorldObjectUpdated(object));
                Ok(true)
            }
            ObjectOperation::Remove if msg.id.is_empty() => {
                for object in data.world.drain() {
                    changes.world.insert(object.id.clone());
                    events.push(SceneObjectEvent::WorldObjectRemoved(object));
                }
                Ok(true)
            }
            ObjectOperation::Remove => match data.world.remove(&msg.id) {
                Some(object) => {
                    changes.world.insert(msg.id.clone());
                    data.acm.remove_body(&msg.id);
                    changes.acm = true;
                    events.push(SceneObjectEvent::WorldObjectRemoved(object));
                    Ok(true)
                }
                None => Ok(false),
            },
            ObjectOperation::Move => {
                let Some(existing) = data.world.get_mut(&msg.id) else {
                    return Ok(false);
                };
                if msg.poses.len() != existing.shapes.len() {
                    return Err(VigilError::InvalidObject(format!(
                        "move of '{}' carries {} poses for {} shapes",
                        msg.id,
                        msg.poses.len(),
                        existing.shapes.len()
                    )));
                }
                existing.poses = msg.poses.clone();
                if !msg.frame_id.is_empty() {
                    existing.frame_id = frame_id;
                }
                let object = existing.clone();
                changes.world.insert(msg.id.clone());
                events.push(SceneObjectEvent::WorldObjectUpdated(object));
                Ok(true)
            }
        }
    }

    fn apply_attached_object(
        &mut self,
        msg: &AttachedCollisionObjectMsg,
        events: &mut Vec<SceneObjectEvent>,
    ) -> Result<bool, VigilError> {
        let (data, changes) = self.parts();
        let object = &msg.object;

        match object.operation {
            ObjectOperation::Add | ObjectOperation::Append => {
                if !data.model().has_link(&msg.link_name) {
                    return Err(VigilError::UnknownFrame(msg.link_name.clone()));
                }
                let append = object.operation == ObjectOperation::Append;
                let (shapes, poses) = if object.shapes.is_empty() {
                    match data.world.remove(&object.id) {
                        Some(world_object) => {
                            changes.world.insert(object.id.clone());
                            events.push(SceneObjectEvent::WorldObjectRemoved(world_object.clone()));
                            (world_object.shapes, world_object.poses)
                        }
                        None if append && data.robot_state.attached_body(&object.id).is_some() => {
                            (Vec::new(), Vec::new())
                        }
                        None => {
                            return Err(VigilError::InvalidObject(format!(
                                "attaching '{}' without shapes, and no world object of that name",
                                object.id
                            )));
                        }
                    }
                } else {
                    check_shapes(&object.id, object.shapes.len(), object.poses.len())?;
                    if let Some(world_object) = data.world.remove(&object.id) {
                        changes.world.insert(object.id.clone());
                        events.push(SceneObjectEvent::WorldObjectRemoved(world_object));
                    }
                    (object.shapes.clone(), object.poses.clone())
                };
                let touch_links: BTreeSet<String> = msg.touch_links.iter().cloned().collect();

                let previous = data.robot_state.detach_body(&object.id);
                let body = match previous {
                    Some(mut existing) if append && existing.link_name == msg.link_name => {
                        events.push(SceneObjectEvent::BodyDetached(existing.clone()));
                        existing.shapes.extend(shapes);
                        existing.poses.extend(poses);
                        existing.touch_links.extend(touch_links);
                        existing
                    }
                    previous => {
                        if let Some(previous) = previous {
                            events.push(SceneObjectEvent::BodyDetached(previous));
                        }
                        AttachedBody {
                            id: object.id.clone(),
                            link_name: msg.link_name.clone(),
                            shapes,
                            poses,
                            touch_links,
                        }
                    }
                };
                data.robot_state.attach_body(body.clone());
                changes.attached.insert(object.id.clone());
                changes.robot_state = true;
                events.push(SceneObjectEvent::BodyAttached(body));
                Ok(true)
            }
            ObjectOperation::Remove => {
                let ids = match (object.id.is_empty(), msg.link_name.is_empty()) {
                    (false, _) => vec![object.id.clone()],
                    (true, false) => data.robot_state.attached_ids_on_link(&msg.link_name),
                    (true, true) => data.robot_state.attached_bodies().map(|b| b.id.clone()).collect(),
                };
                let mut detached = false;
                for id in ids {
                    if let Some(body) = data.robot_state.detach_body(&id) {
                        changes.attached.insert(id);
                        changes.robot_state = true;
                        events.push(SceneObjectEvent::BodyDetached(body));
                        detached = true;
                    }
                }
                Ok(detached)
            }
            ObjectOperation::Move => Err(VigilError::InvalidObject(format!(
                "moving attached object '{}' is not supported",
                object.id
            ))),
        }
    }

    // ── Messages ────────────────────────────────────────────────────────────

    /// Full message describing the live scene.
    pub fn full_msg(&self, stamp: Stamp) -> SceneMsg {
        self.current().to_msg(stamp)
    }

    /// Diff message describing the overlay's changes against the root.
    ///
    /// Empty when decoupled or when nothing changed.
    pub fn diff_msg(&self, stamp: Stamp) -> SceneMsg {
        let mut msg = SceneMsg {
            is_diff: true,
            ..SceneMsg::default()
        };
        let Some(data) = self.overlay.as_ref() else {
            return msg;
        };
        let changes = &self.changes;
        msg.robot_model_name = data.model().name().to_string();

        if changes.name {
            msg.name = data.name.clone();
        }
        if changes.robot_state {
            msg.robot_state.joint_state = data.robot_state.to_joint_state_msg(stamp);
            msg.robot_state.multi_dof_joints = data.robot_state.multi_dof_msg();
        }
        for id in &changes.attached {
            let attached = match data.robot_state.attached_body(id) {
                Some(body) => body.to_msg(),
                None => AttachedCollisionObjectMsg {
                    link_name: self
                        .root
                        .robot_state
                        .attached_body(id)
                        .map(|b| b.link_name.clone())
                        .unwrap_or_default(),
                    object: removal(id),
                    touch_links: Vec::new(),
                },
            };
            msg.robot_state.attached_collision_objects.push(attached);
        }
        if changes.transforms {
            msg.fixed_frame_transforms = data.fixed_transforms.values().cloned().collect();
        }
        if changes.acm {
            msg.allowed_collision_matrix = data.acm.to_msg();
        }
        if changes.padding {
            msg.link_padding = data.padding.padding_msg();
            msg.link_scale = data.padding.scale_msg();
        }
        for id in &changes.world {
            msg.world.collision_objects.push(match data.world.get(id) {
                Some(object) => object.to_msg(),
                None => removal(id),
            });
        }
        if changes.octomap {
            msg.world.octomap = Some(data.octomap.clone().unwrap_or_default());
        }
        msg
    }
}

fn removal(id: &str) -> CollisionObjectMsg {
    CollisionObjectMsg {
        id: id.to_string(),
        operation: ObjectOperation::Remove,
        ..CollisionObjectMsg::default()
    }
}

fn check_shapes(id: &str, shapes: usize, poses: usize) -> Result<(), VigilError> {
    if shapes != poses {
        return Err(VigilError::InvalidObject(format!(
            "'{id}' has {shapes} shapes but {poses} poses"
        )));
    }
    Ok(())
}

fn keep_first(slot: &mut Option<VigilError>, result: Result<bool, VigilError>) {
    if let Err(e) = result {
        slot.get_or_insert(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;
    use vigil_types::{JointStateMsg, Pose, Shape, Vec3};

    fn model() -> Arc<RobotModel> {
        Arc::new(
            RobotModel::builder("bot")
                .link("base_link")
                .link("arm")
                .link("hand")
                .revolute("shoulder", "base_link", "arm", -2.0, 2.0)
                .revolute("wrist", "arm", "hand", -2.0, 2.0)
                .build()
                .unwrap(),
        )
    }

    fn chain() -> SceneChain {
        SceneChain::new(SceneData::new(model()))
    }

    fn add(id: &str, frame: &str) -> CollisionObjectMsg {
        CollisionObjectMsg {
            id: id.into(),
            frame_id: frame.into(),
            shapes: vec![Shape::Box {
                size: Vec3::new(0.2, 0.2, 0.2),
            }],
            poses: vec![Pose::from_translation(1.0, 0.0, 0.0)],
            operation: ObjectOperation::Add,
        }
    }

    fn attach(id: &str, link: &str) -> AttachedCollisionObjectMsg {
        AttachedCollisionObjectMsg {
            link_name: link.into(),
            object: CollisionObjectMsg {
                id: id.into(),
                ..CollisionObjectMsg::default()
            },
            touch_links: vec![link.into()],
        }
    }

    fn recorder(chain: &mut SceneChain) -> Arc<Mutex<Vec<SceneObjectEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        chain.add_observer(Arc::new(move |e: &SceneObjectEvent| {
            sink.lock().unwrap().push(e.clone());
        }));
        log
    }

    #[test]
    fn couple_then_decouple_keeps_coupled_content() {
        let mut chain = chain();
        chain.couple();
        chain.process_collision_object(&add("crate", "base_link")).unwrap();
        chain.modify_robot_state(|s| s.set_position("shoulder", 0.7));
        let coupled_content = chain.current().clone();

        chain.decouple();
        assert!(!chain.is_coupled());
        assert!(chain.parent().is_none());
        assert_eq!(chain.current(), &coupled_content);
    }

    #[test]
    fn push_diffs_makes_root_match_overlay() {
        let mut chain = chain();
        chain.couple();
        chain.process_collision_object(&add("crate", "base_link")).unwrap();
        chain.set_name("kitchen");
        assert!(chain.has_diffs());
        assert!(chain.parent().unwrap().world.is_empty());

        chain.push_diffs();
        assert!(!chain.has_diffs());
        assert_eq!(chain.parent().unwrap(), chain.current());
    }

    #[test]
    fn push_diffs_propagates_removals() {
        let mut chain = chain();
        chain.process_collision_object(&add("crate", "base_link")).unwrap();
        chain.couple();
        let remove = CollisionObjectMsg {
            operation: ObjectOperation::Remove,
            ..add("crate", "")
        };
        assert!(chain.process_collision_object(&remove).unwrap());
        chain.push_diffs();
        assert!(chain.parent().unwrap().world.is_empty());
    }

    #[test]
    fn clear_diffs_discards_changes() {
        let mut chain = chain();
        chain.couple();
        chain.process_collision_object(&add("crate", "base_link")).unwrap();
        chain.clear_diffs();
        assert!(chain.current().world.is_empty());
        assert!(!chain.has_diffs());
    }

    #[test]
    fn diff_msg_only_carries_changes() {
        let mut chain = chain();
        chain.couple();
        chain.process_collision_object(&add("crate", "base_link")).unwrap();

        let diff = chain.diff_msg(Utc::now());
        assert!(diff.is_diff);
        assert_eq!(diff.world.collision_objects.len(), 1);
        assert!(diff.robot_state.is_empty());
        assert!(diff.allowed_collision_matrix.is_empty());
        assert!(diff.name.is_empty());
    }

    #[test]
    fn diff_msg_replays_onto_parent() {
        let mut chain = chain();
        chain.couple();
        chain.process_collision_object(&add("crate", "base_link")).unwrap();
        chain.modify_robot_state(|s| s.set_position("wrist", 0.3));
        let diff = chain.diff_msg(Utc::now());

        let mut replica = SceneChain::new(chain.parent().unwrap().clone());
        replica.apply_scene_msg(&diff).unwrap();
        assert_eq!(replica.current().world, chain.current().world);
        assert_eq!(replica.current().robot_state.position("wrist"), Some(0.3));
    }

    #[test]
    fn unknown_frame_is_rejected() {
        let mut chain = chain();
        let err = chain.process_collision_object(&add("crate", "mars")).unwrap_err();
        assert_eq!(err, VigilError::UnknownFrame("mars".into()));
        assert!(chain.current().world.is_empty());
    }

    #[test]
    fn empty_remove_clears_world() {
        let mut chain = chain();
        chain.process_collision_object(&add("a", "base_link")).unwrap();
        chain.process_collision_object(&add("b", "base_link")).unwrap();
        let remove_all = CollisionObjectMsg {
            operation: ObjectOperation::Remove,
            ..CollisionObjectMsg::default()
        };
        assert!(chain.process_collision_object(&remove_all).unwrap());
        assert!(chain.current().world.is_empty());
    }

    #[test]
    fn move_updates_poses() {
        let mut chain = chain();
        chain.process_collision_object(&add("crate", "base_link")).unwrap();
        let mv = CollisionObjectMsg {
            shapes: Vec::new(),
            poses: vec![Pose::from_translation(3.0, 0.0, 0.0)],
            operation: ObjectOperation::Move,
            ..add("crate", "base_link")
        };
        assert!(chain.process_collision_object(&mv).unwrap());
        let moved = chain.current().world.get("crate").unwrap();
        assert_eq!(moved.poses[0].translation.x, 3.0);
    }

    #[test]
    fn attach_takes_shapes_from_world_object() {
        let mut chain = chain();
        let events = recorder(&mut chain);
        chain.process_collision_object(&add("cup", "base_link")).unwrap();
        assert!(chain.process_attached_object(&attach("cup", "hand")).unwrap());

        let scene = chain.current();
        assert!(!scene.world.contains("cup"));
        let body = scene.robot_state.attached_body("cup").unwrap();
        assert_eq!(body.shapes.len(), 1);
        assert_eq!(body.link_name, "hand");

        let events = events.lock().unwrap();
        assert!(matches!(events.last(), Some(SceneObjectEvent::BodyAttached(b)) if b.id == "cup"));
        assert!(events
            .iter()
            .any(|e| matches!(e, SceneObjectEvent::WorldObjectRemoved(o) if o.id == "cup")));
    }

    #[test]
    fn attach_to_unknown_link_fails() {
        let mut chain = chain();
        chain.process_collision_object(&add("cup", "base_link")).unwrap();
        let err = chain.process_attached_object(&attach("cup", "tentacle")).unwrap_err();
        assert_eq!(err, VigilError::UnknownFrame("tentacle".into()));
        assert!(chain.current().world.contains("cup"));
    }

    #[test]
    fn detach_all_on_link() {
        let mut chain = chain();
        chain.process_collision_object(&add("a", "base_link")).unwrap();
        chain.process_collision_object(&add("b", "base_link")).unwrap();
        chain.process_attached_object(&attach("a", "hand")).unwrap();
        chain.process_attached_object(&attach("b", "arm")).unwrap();

        let mut detach = attach("", "hand");
        detach.object.operation = ObjectOperation::Remove;
        assert!(chain.process_attached_object(&detach).unwrap());
        let state = &chain.current().robot_state;
        assert!(state.attached_body("a").is_none());
        assert!(state.attached_body("b").is_some());
    }

    #[test]
    fn suppressed_observers_see_nothing() {
        let mut chain = chain();
        let events = recorder(&mut chain);
        chain.with_observers_suppressed(|c| {
            c.process_collision_object(&add("crate", "base_link")).unwrap();
        });
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(chain.observer_state(), ObserverState::Active);

        chain.process_collision_object(&add("shelf", "base_link")).unwrap();
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn full_msg_while_coupled_becomes_new_root() {
        let mut source = chain();
        source.process_collision_object(&add("crate", "base_link")).unwrap();
        source.set_name("warehouse");
        let full = source.full_msg(Utc::now());

        let mut chain = chain();
        chain.couple();
        chain.process_collision_object(&add("stale", "base_link")).unwrap();
        chain.apply_scene_msg(&full).unwrap();

        assert!(chain.is_coupled());
        assert!(!chain.has_diffs());
        assert_eq!(chain.parent().unwrap().name, "warehouse");
        assert!(chain.current().world.contains("crate"));
        assert!(!chain.current().world.contains("stale"));
    }

    #[test]
    fn diff_msg_with_only_joints_keeps_world() {
        let mut chain = chain();
        chain.process_collision_object(&add("crate", "base_link")).unwrap();
        let mut msg = SceneMsg {
            is_diff: true,
            ..SceneMsg::default()
        };
        msg.robot_state.joint_state = JointStateMsg::from_positions(Utc::now(), [("shoulder", 1.0)]);
        chain.apply_scene_msg(&msg).unwrap();
        assert!(chain.current().world.contains("crate"));
        assert_eq!(chain.current().robot_state.position("shoulder"), Some(1.0));
    }

    #[test]
    fn scene_msg_reports_first_failure_but_applies_the_rest() {
        let mut chain = chain();
        let mut msg = SceneMsg {
            is_diff: true,
            ..SceneMsg::default()
        };
        msg.world.collision_objects = vec![add("lost", "mars"), add("crate", "base_link")];
        assert!(chain.apply_scene_msg(&msg).is_err());
        assert!(chain.current().world.contains("crate"));
    }

    #[test]
    fn full_msg_with_empty_octomap_clears_it() {
        let mut chain = chain();
        chain.set_octomap(Some(OctomapMsg {
            frame_id: "base_link".into(),
            resolution: 0.1,
            points: vec![Vec3::new(1.0, 0.0, 0.0)],
        }));
        let full = SceneMsg {
            is_diff: false,
            ..SceneMsg::default()
        };
        chain.apply_scene_msg(&full).unwrap();
        assert!(chain.current().octomap.is_none());
    }
}

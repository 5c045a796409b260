//! World geometry: collision objects not attached to the robot.

use std::collections::BTreeMap;

use vigil_types::{CollisionObjectMsg, ObjectOperation, Pose, Shape};

/// A rigid body in the world, made of one or more shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct CollisionObject {
    pub id: String,
    /// Frame the shape poses are expressed in.
    pub frame_id: String,
    pub shapes: Vec<Shape>,
    pub poses: Vec<Pose>,
}

impl CollisionObject {
    pub fn new(id: impl Into<String>, frame_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            frame_id: frame_id.into(),
            shapes: Vec::new(),
            poses: Vec::new(),
        }
    }

    pub fn with_shape(mut self, shape: Shape, pose: Pose) -> Self {
        self.shapes.push(shape);
        self.poses.push(pose);
        self
    }

    /// Message re-creating this object from scratch.
    pub fn to_msg(&self) -> CollisionObjectMsg {
        CollisionObjectMsg {
            id: self.id.clone(),
            frame_id: self.frame_id.clone(),
            shapes: self.shapes.clone(),
            poses: self.poses.clone(),
            operation: ObjectOperation::Add,
        }
    }
}

/// Collision objects keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct World {
    objects: BTreeMap<String, CollisionObject>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&CollisionObject> {
        self.objects.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut CollisionObject> {
        self.objects.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.objects.contains_key(id)
    }

    /// Insert or replace, returning the replaced object.
    pub fn insert(&mut self, object: CollisionObject) -> Option<CollisionObject> {
        self.objects.insert(object.id.clone(), object)
    }

    pub fn remove(&mut self, id: &str) -> Option<CollisionObject> {
        self.objects.remove(id)
    }

    /// Remove every object, returning them.
    pub fn drain(&mut self) -> Vec<CollisionObject> {
        std::mem::take(&mut self.objects).into_values().collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    pub fn objects(&self) -> impl Iterator<Item = &CollisionObject> {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::Vec3;

    fn crate_box() -> CollisionObject {
        CollisionObject::new("crate", "world").with_shape(
            Shape::Box {
                size: Vec3::new(0.4, 0.4, 0.4),
            },
            Pose::from_translation(1.0, 0.0, 0.2),
        )
    }

    #[test]
    fn insert_replaces_by_id() {
        let mut world = World::new();
        assert!(world.insert(crate_box()).is_none());
        assert!(world.insert(crate_box()).is_some());
        assert_eq!(world.len(), 1);
    }

    #[test]
    fn drain_empties_world() {
        let mut world = World::new();
        world.insert(crate_box());
        world.insert(CollisionObject::new("shelf", "world"));
        let drained = world.drain();
        assert_eq!(drained.len(), 2);
        assert!(world.is_empty());
    }

    #[test]
    fn to_msg_is_an_add() {
        let msg = crate_box().to_msg();
        assert_eq!(msg.operation, ObjectOperation::Add);
        assert_eq!(msg.shapes.len(), msg.poses.len());
    }
}

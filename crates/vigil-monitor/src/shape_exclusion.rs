//! Bookkeeping of the shapes kept out of sensor-derived occupancy.
//!
//! Every rigid body the scene knows about (robot link, attached body or
//! world object) can have its collision shapes registered with the
//! occupancy subsystem, which then drops sensor points falling inside them.
//! [`ShapeExclusionCache`] remembers, per body, the handles the subsystem
//! returned together with the frame and pose each shape sits at, so the
//! shapes can be forgotten again and their current poses resolved.
//!
//! "Include" means "stop excluding".  Including a body without entries is a
//! no-op, and excluding an already excluded body replaces its entries.

use std::collections::BTreeMap;

use vigil_perception::{OccupancyMonitor, ShapeHandle};
use vigil_scene::{AttachedBody, CollisionObject, CollisionPadding, RobotModel};
use vigil_types::{Pose, Shape, Vec3};

/// Mesh vertices closer than this are merged before a link is excluded.
pub const MESH_MERGE_TOLERANCE: f64 = 1e-4;

/// One excluded shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ExclusionEntry {
    pub handle: ShapeHandle,
    /// Frame `pose` is expressed in.
    pub frame: String,
    pub pose: Pose,
}

/// Excluded shapes, keyed by link name, attached-body id and world-object id.
#[derive(Debug, Clone, Default)]
pub struct ShapeExclusionCache {
    links: BTreeMap<String, Vec<ExclusionEntry>>,
    attached: BTreeMap<String, Vec<ExclusionEntry>>,
    world: BTreeMap<String, Vec<ExclusionEntry>>,
}

impl ShapeExclusionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry, links first.
    pub fn entries(&self) -> impl Iterator<Item = &ExclusionEntry> {
        self.links
            .values()
            .chain(self.attached.values())
            .chain(self.world.values())
            .flatten()
    }

    /// Number of excluded shapes.
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty() && self.attached.is_empty() && self.world.is_empty()
    }

    pub fn has_link(&self, link: &str) -> bool {
        self.links.contains_key(link)
    }

    pub fn has_attached_body(&self, id: &str) -> bool {
        self.attached.contains_key(id)
    }

    pub fn has_world_object(&self, id: &str) -> bool {
        self.world.contains_key(id)
    }

    // ── Robot links ─────────────────────────────────────────────────────────

    /// Exclude the collision geometry of every link, replacing previous link
    /// entries.  Returns the number of shapes excluded.
    pub fn exclude_robot_links(
        &mut self,
        model: &RobotModel,
        padding: &CollisionPadding,
        occupancy: &dyn OccupancyMonitor,
    ) -> usize {
        self.include_robot_links(occupancy);
        let mut count = 0;
        for link in model.links() {
            let inflate = padding.padding(&link.name);
            let entries: Vec<ExclusionEntry> = link
                .collision_shapes
                .iter()
                .zip(&link.collision_origins)
                .filter_map(|(shape, origin)| {
                    let shape = padded(&shape.with_merged_vertices(MESH_MERGE_TOLERANCE), inflate);
                    exclude(occupancy, &shape, &link.name, *origin)
                })
                .collect();
            count += entries.len();
            if !entries.is_empty() {
                self.links.insert(link.name.clone(), entries);
            }
        }
        count
    }

    pub fn include_robot_links(&mut self, occupancy: &dyn OccupancyMonitor) {
        forget_all(&mut self.links, occupancy);
    }

    // ── Attached bodies ─────────────────────────────────────────────────────

    /// Exclude one attached body.  Returns `false` when none of its shapes
    /// could be excluded.
    pub fn exclude_attached_body(
        &mut self,
        body: &AttachedBody,
        padding: f64,
        occupancy: &dyn OccupancyMonitor,
    ) -> bool {
        self.include_attached_body(&body.id, occupancy);
        let entries = exclude_shapes(
            occupancy,
            &body.shapes,
            &body.poses,
            &body.link_name,
            padding,
        );
        insert_entries(&mut self.attached, &body.id, entries)
    }

    pub fn include_attached_body(&mut self, id: &str, occupancy: &dyn OccupancyMonitor) -> bool {
        forget(&mut self.attached, id, occupancy)
    }

    /// Re-derive the attached-body entries from `bodies`.
    pub fn exclude_attached_bodies<'a>(
        &mut self,
        bodies: impl IntoIterator<Item = &'a AttachedBody>,
        padding: f64,
        occupancy: &dyn OccupancyMonitor,
    ) {
        self.include_attached_bodies(occupancy);
        for body in bodies {
            self.exclude_attached_body(body, padding, occupancy);
        }
    }

    pub fn include_attached_bodies(&mut self, occupancy: &dyn OccupancyMonitor) {
        forget_all(&mut self.attached, occupancy);
    }

    // ── World objects ───────────────────────────────────────────────────────

    pub fn exclude_world_object(
        &mut self,
        object: &CollisionObject,
        padding: f64,
        occupancy: &dyn OccupancyMonitor,
    ) -> bool {
        self.include_world_object(&object.id, occupancy);
        let entries = exclude_shapes(
            occupancy,
            &object.shapes,
            &object.poses,
            &object.frame_id,
            padding,
        );
        insert_entries(&mut self.world, &object.id, entries)
    }

    pub fn include_world_object(&mut self, id: &str, occupancy: &dyn OccupancyMonitor) -> bool {
        forget(&mut self.world, id, occupancy)
    }

    /// Re-derive the world-object entries from `objects`.
    pub fn exclude_world_objects<'a>(
        &mut self,
        objects: impl IntoIterator<Item = &'a CollisionObject>,
        padding: f64,
        occupancy: &dyn OccupancyMonitor,
    ) {
        self.include_world_objects(occupancy);
        for object in objects {
            self.exclude_world_object(object, padding, occupancy);
        }
    }

    pub fn include_world_objects(&mut self, occupancy: &dyn OccupancyMonitor) {
        forget_all(&mut self.world, occupancy);
    }

    /// Forget every entry.
    pub fn include_all(&mut self, occupancy: &dyn OccupancyMonitor) {
        self.include_robot_links(occupancy);
        self.include_attached_bodies(occupancy);
        self.include_world_objects(occupancy);
    }
}

fn exclude(
    occupancy: &dyn OccupancyMonitor,
    shape: &Shape,
    frame: &str,
    pose: Pose,
) -> Option<ExclusionEntry> {
    if !shape.is_excludable() {
        return None;
    }
    occupancy.exclude_shape(shape).map(|handle| ExclusionEntry {
        handle,
        frame: frame.to_string(),
        pose,
    })
}

fn exclude_shapes(
    occupancy: &dyn OccupancyMonitor,
    shapes: &[Shape],
    poses: &[Pose],
    frame: &str,
    padding: f64,
) -> Vec<ExclusionEntry> {
    shapes
        .iter()
        .zip(poses)
        .filter_map(|(shape, pose)| exclude(occupancy, &padded(shape, padding), frame, *pose))
        .collect()
}

fn insert_entries(
    map: &mut BTreeMap<String, Vec<ExclusionEntry>>,
    id: &str,
    entries: Vec<ExclusionEntry>,
) -> bool {
    if entries.is_empty() {
        return false;
    }
    map.insert(id.to_string(), entries);
    true
}

fn forget(
    map: &mut BTreeMap<String, Vec<ExclusionEntry>>,
    id: &str,
    occupancy: &dyn OccupancyMonitor,
) -> bool {
    let Some(entries) = map.remove(id) else {
        return false;
    };
    for entry in entries {
        occupancy.forget_shape(entry.handle);
    }
    true
}

fn forget_all(map: &mut BTreeMap<String, Vec<ExclusionEntry>>, occupancy: &dyn OccupancyMonitor) {
    for entry in std::mem::take(map).into_values().flatten() {
        occupancy.forget_shape(entry.handle);
    }
}

/// `shape` grown by `padding` in every direction.
fn padded(shape: &Shape, padding: f64) -> Shape {
    if padding <= 0.0 {
        return shape.clone();
    }
    match shape {
        Shape::Box { size } => Shape::Box {
            size: Vec3::new(
                size.x + 2.0 * padding,
                size.y + 2.0 * padding,
                size.z + 2.0 * padding,
            ),
        },
        Shape::Sphere { radius } => Shape::Sphere {
            radius: radius + padding,
        },
        Shape::Cylinder { radius, length } => Shape::Cylinder {
            radius: radius + padding,
            length: length + 2.0 * padding,
        },
        Shape::Mesh {
            vertices,
            triangles,
        } => Shape::Mesh {
            vertices: vertices
                .iter()
                .map(|v| {
                    let n = v.norm();
                    if n > 0.0 { v.scale((n + padding) / n) } else { *v }
                })
                .collect(),
            triangles: triangles.clone(),
        },
        Shape::Plane { .. } | Shape::Octree => shape.clone(),
    }
}

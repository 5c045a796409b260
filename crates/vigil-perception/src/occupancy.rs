//! Occupancy-map coordination.
//!
//! The occupancy subsystem ingests sensor data on its own and keeps a voxel
//! tree.  Scene monitors coordinate with it through [`OccupancyMonitor`]:
//!
//! - they register rigid bodies whose footprint must not show up as
//!   obstacles ([`OccupancyMonitor::exclude_shape`]) and receive an opaque
//!   [`ShapeHandle`] back;
//! - they supply a [`TransformCacheProvider`] that tells the subsystem where
//!   every excluded shape currently is;
//! - they get told through an [`UpdateCallback`] whenever the tree changed;
//! - they read the tree under its own lock ([`OccupancyTree`]), always after
//!   taking their own scene lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{Span, debug, info, info_span, warn};
use vigil_types::{Pose, Shape, Stamp, Vec3};

use crate::octree::{Aabb, Octree};

/// Opaque identifier of a shape excluded from occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeHandle(pub u64);

/// Pose of every excluded shape in `target_frame` at `time`, or `None` when
/// the poses cannot be resolved yet.
pub type TransformCacheProvider =
    Arc<dyn Fn(&str, Stamp) -> Option<HashMap<ShapeHandle, Pose>> + Send + Sync>;

/// Invoked after every change to the occupancy tree.
pub type UpdateCallback = Arc<dyn Fn() + Send + Sync>;

// ────────────────────────────────────────────────────────────────────────────
// OccupancyTree
// ────────────────────────────────────────────────────────────────────────────

/// A voxel tree shared between the occupancy subsystem and its readers.
#[derive(Debug)]
pub struct OccupancyTree {
    frame_id: String,
    octree: RwLock<Octree>,
}

impl OccupancyTree {
    pub fn new(frame_id: impl Into<String>, bounds: Aabb, resolution: f64) -> Self {
        Self {
            frame_id: frame_id.into(),
            octree: RwLock::new(Octree::new(bounds, resolution)),
        }
    }

    pub fn frame_id(&self) -> &str {
        &self.frame_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Octree> {
        self.octree.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Octree> {
        self.octree.write()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// OccupancyMonitor
// ────────────────────────────────────────────────────────────────────────────

/// The interface a scene monitor coordinates with.
pub trait OccupancyMonitor: Send + Sync {
    /// Frame the tree is expressed in.
    fn map_frame(&self) -> String;

    fn tree(&self) -> Arc<OccupancyTree>;

    /// Start filtering sensor points through `shape`.  `None` when the shape
    /// cannot be excluded (planes, octrees).
    fn exclude_shape(&self, shape: &Shape) -> Option<ShapeHandle>;

    /// Stop excluding a shape.  Unknown handles are ignored.
    fn forget_shape(&self, handle: ShapeHandle);

    fn set_update_callback(&self, callback: Option<UpdateCallback>);

    fn set_transform_cache_provider(&self, provider: Option<TransformCacheProvider>);

    fn start(&self);

    fn stop(&self);

    fn is_active(&self) -> bool;
}

// ────────────────────────────────────────────────────────────────────────────
// OccupancyMapMonitor
// ────────────────────────────────────────────────────────────────────────────

/// An in-process occupancy subsystem.
///
/// Sensor points are pushed with [`OccupancyMapMonitor::insert_points`];
/// points falling inside any excluded shape (at the pose reported by the
/// transform cache provider, inflated by `padding`) are dropped before they
/// reach the tree.
pub struct OccupancyMapMonitor {
    tree: Arc<OccupancyTree>,
    padding: f64,
    shapes: Mutex<HashMap<ShapeHandle, Shape>>,
    next_handle: AtomicU64,
    update_callback: RwLock<Option<UpdateCallback>>,
    transform_provider: RwLock<Option<TransformCacheProvider>>,
    active: AtomicBool,
    span: Span,
}

impl OccupancyMapMonitor {
    pub fn new(tree: Arc<OccupancyTree>, padding: f64) -> Self {
        Self {
            tree,
            padding,
            shapes: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            update_callback: RwLock::new(None),
            transform_provider: RwLock::new(None),
            active: AtomicBool::new(false),
            span: info_span!("occupancy_monitor"),
        }
    }

    /// Use `span` as the parent of every event this monitor logs.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Number of shapes currently excluded.
    pub fn excluded_shape_count(&self) -> usize {
        self.shapes.lock().len()
    }

    /// Integrate a batch of sensor points expressed in the map frame.
    ///
    /// Returns the number of newly occupied voxels.  Nothing is integrated
    /// while the monitor is stopped or while excluded shapes cannot be
    /// located.
    pub fn insert_points(&self, stamp: Stamp, points: &[Vec3]) -> usize {
        if !self.is_active() {
            return 0;
        }
        let excluded: Vec<(Shape, Pose)> = {
            let shapes = self.shapes.lock().clone();
            if shapes.is_empty() {
                Vec::new()
            } else {
                let provider = self.transform_provider.read().clone();
                let poses = provider.and_then(|p| p(self.tree.frame_id(), stamp));
                let Some(poses) = poses else {
                    warn!(parent: &self.span, "excluded shape poses unavailable; dropping sensor batch");
                    return 0;
                };
                shapes
                    .into_iter()
                    .filter_map(|(h, s)| poses.get(&h).map(|pose| (s, *pose)))
                    .collect()
            }
        };

        let inserted = {
            let mut octree = self.tree.write();
            points
                .iter()
                .filter(|p| {
                    !excluded.iter().any(|(shape, pose)| {
                        shape.contains_local(pose.inverse().transform_point(**p), self.padding)
                    })
                })
                .filter(|p| octree.insert(**p))
                .count()
        };
        debug!(parent: &self.span, points = points.len(), inserted, "sensor batch integrated");

        if inserted > 0 {
            self.notify_update();
        }
        inserted
    }

    /// Free voxels that now fall inside an excluded shape.
    pub fn clear_excluded(&self, stamp: Stamp) -> usize {
        let shapes = self.shapes.lock().clone();
        let provider = self.transform_provider.read().clone();
        let Some(poses) = provider.and_then(|p| p(self.tree.frame_id(), stamp)) else {
            return 0;
        };
        let excluded: Vec<(Shape, Pose)> = shapes
            .into_iter()
            .filter_map(|(h, s)| poses.get(&h).map(|pose| (s, *pose)))
            .collect();
        let freed = self.tree.write().retain(|v| {
            !excluded
                .iter()
                .any(|(shape, pose)| shape.contains_local(pose.inverse().transform_point(v), self.padding))
        });
        if freed > 0 {
            self.notify_update();
        }
        freed
    }

    fn notify_update(&self) {
        let callback = self.update_callback.read().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl OccupancyMonitor for OccupancyMapMonitor {
    fn map_frame(&self) -> String {
        self.tree.frame_id().to_string()
    }

    fn tree(&self) -> Arc<OccupancyTree> {
        Arc::clone(&self.tree)
    }

    fn exclude_shape(&self, shape: &Shape) -> Option<ShapeHandle> {
        if !shape.is_excludable() {
            return None;
        }
        let handle = ShapeHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.shapes.lock().insert(handle, shape.clone());
        debug!(parent: &self.span, handle = handle.0, "shape excluded");
        Some(handle)
    }

    fn forget_shape(&self, handle: ShapeHandle) {
        if self.shapes.lock().remove(&handle).is_some() {
            debug!(parent: &self.span, handle = handle.0, "shape no longer excluded");
        }
    }

    fn set_update_callback(&self, callback: Option<UpdateCallback>) {
        *self.update_callback.write() = callback;
    }

    fn set_transform_cache_provider(&self, provider: Option<TransformCacheProvider>) {
        *self.transform_provider.write() = provider;
    }

    fn start(&self) {
        if !self.active.swap(true, Ordering::AcqRel) {
            info!(parent: &self.span, frame = %self.tree.frame_id(), "occupancy monitor started");
        }
    }

    fn stop(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            info!(parent: &self.span, "occupancy monitor stopped");
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    fn monitor() -> OccupancyMapMonitor {
        let tree = Arc::new(OccupancyTree::new(
            "world",
            Aabb::around(Vec3::zero(), 5.0),
            0.1,
        ));
        let m = OccupancyMapMonitor::new(tree, 0.0);
        m.start();
        m
    }

    #[test]
    fn stopped_monitor_ignores_points() {
        let m = monitor();
        m.stop();
        assert_eq!(m.insert_points(Utc::now(), &[Vec3::new(1.0, 0.0, 0.0)]), 0);
        assert!(m.tree().read().is_empty());
    }

    #[test]
    fn planes_cannot_be_excluded() {
        let m = monitor();
        assert!(m.exclude_shape(&Shape::Plane { coefficients: [0.0, 0.0, 1.0, 0.0] }).is_none());
        assert!(m.exclude_shape(&Shape::Sphere { radius: 0.2 }).is_some());
        assert_eq!(m.excluded_shape_count(), 1);
    }

    #[test]
    fn points_inside_excluded_shape_are_dropped() {
        let m = monitor();
        let handle = m.exclude_shape(&Shape::Sphere { radius: 0.5 }).unwrap();
        m.set_transform_cache_provider(Some(Arc::new(move |_frame: &str, _t: Stamp| {
            Some(HashMap::from([(handle, Pose::from_translation(2.0, 0.0, 0.0))]))
        })));

        let inserted = m.insert_points(
            Utc::now(),
            &[Vec3::new(2.1, 0.0, 0.0), Vec3::new(-2.0, 0.0, 0.0)],
        );
        assert_eq!(inserted, 1);
        let tree = m.tree();
        let octree = tree.read();
        assert!(octree.is_occupied(Vec3::new(-2.0, 0.0, 0.0)));
        assert!(!octree.is_occupied(Vec3::new(2.1, 0.0, 0.0)));
    }

    #[test]
    fn batch_dropped_when_poses_unavailable() {
        let m = monitor();
        m.exclude_shape(&Shape::Sphere { radius: 0.5 });
        m.set_transform_cache_provider(Some(Arc::new(|_: &str, _: Stamp| None)));
        assert_eq!(m.insert_points(Utc::now(), &[Vec3::new(1.0, 1.0, 1.0)]), 0);
    }

    #[test]
    fn update_callback_fires_on_change() {
        let m = monitor();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        m.set_update_callback(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        m.insert_points(Utc::now(), &[Vec3::new(1.0, 1.0, 1.0)]);
        m.insert_points(Utc::now(), &[Vec3::new(1.0, 1.0, 1.0)]);
        assert_eq!(fired.load(Ordering::SeqCst), 1, "second batch changed nothing");
    }

    #[test]
    fn forgetting_shape_lets_points_through() {
        let m = monitor();
        let handle = m.exclude_shape(&Shape::Box { size: Vec3::new(1.0, 1.0, 1.0) }).unwrap();
        m.set_transform_cache_provider(Some(Arc::new(move |_: &str, _: Stamp| {
            Some(HashMap::from([(handle, Pose::identity())]))
        })));
        assert_eq!(m.insert_points(Utc::now(), &[Vec3::new(0.1, 0.1, 0.1)]), 0);

        m.forget_shape(handle);
        assert_eq!(m.insert_points(Utc::now(), &[Vec3::new(0.1, 0.1, 0.1)]), 1);
    }
}

//! The scene monitor: one authoritative scene fed by many sources.
//!
//! [`SceneMonitor`] owns a [`SceneChain`] behind a single read/write lock and
//! serialises every mutation through it:
//!
//! | Source | Entry point | Category |
//! |---|---|---|
//! | joint feed (via [`StateTracker`]) | [`refresh_state_from_tracker`][SceneMonitor::refresh_state_from_tracker] | `STATE` |
//! | collision-object edits | [`apply_collision_object_edit`][SceneMonitor::apply_collision_object_edit] | `GEOMETRY` |
//! | attached-object edits | [`apply_attached_object_edit`][SceneMonitor::apply_attached_object_edit] | `GEOMETRY` |
//! | world replacements | [`apply_world_delta`][SceneMonitor::apply_world_delta] | `FULL_SCENE` |
//! | scene messages | [`apply_external_scene_message`][SceneMonitor::apply_external_scene_message] | classified |
//! | occupancy updates | [`apply_occupancy_update`][SceneMonitor::apply_occupancy_update] | `GEOMETRY` |
//!
//! After each mutation the category is handed to [`notify`][SceneMonitor::notify],
//! which runs the update observers and wakes the republishing task.
//!
//! # Lock order
//!
//! scene lock → shape-exclusion cache → occupancy tree.  The pending-state,
//! dirty-category and publisher locks are leaves.  No lock is held across an
//! `.await`.  Object observers run while the scene lock is held, so they only
//! touch the shape-exclusion cache.

use std::cell::RefCell;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::{Mutex, ReentrantMutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::runtime::Handle;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{Span, debug, info, info_span, warn};
use vigil_middleware::{EventBus, SceneService, TopicReceiver};
use vigil_perception::{OccupancyMonitor, OccupancyTree, Octree, ShapeHandle, TransformSource};
use vigil_scene::{
    OCTOMAP_ID, RobotModel, SceneChain, SceneData, SceneObjectEvent, SceneObjectObserver,
};
use vigil_types::{
    AttachedCollisionObjectMsg, ChangeCategory, CollisionObjectMsg, Event, EventPayload,
    OctomapMsg, Pose, SceneMsg, Stamp, StampedTransform, VigilError, WorldMsg,
};

use crate::config::{MonitorConfig, rate_to_interval};
use crate::shape_exclusion::ShapeExclusionCache;
use crate::state_tracker::StateTracker;

/// Called with the category of every scene change.
pub type SceneUpdateObserver = Arc<dyn Fn(ChangeCategory) + Send + Sync>;

/// How long the tracker may run before an incomplete state is reported.
const INCOMPLETE_STATE_GRACE: Duration = Duration::from_secs(1);

/// Minimum spacing of incomplete-state warnings.
const INCOMPLETE_STATE_WARN_PERIOD: Duration = Duration::from_secs(1);

const PUBLISHER_SOURCE: &str = "vigil-monitor::publisher";

// ────────────────────────────────────────────────────────────────────────────
// Builder
// ────────────────────────────────────────────────────────────────────────────

/// Assembles a [`SceneMonitor`].  A robot model (directly or through an
/// initial scene) is required.
#[derive(Default)]
pub struct SceneMonitorBuilder {
    model: Option<Arc<RobotModel>>,
    scene: Option<SceneData>,
    config: MonitorConfig,
    bus: Option<EventBus>,
    transforms: Option<Arc<dyn TransformSource>>,
    occupancy: Option<Arc<dyn OccupancyMonitor>>,
    tracker: Option<StateTracker>,
    span: Option<Span>,
}

impl SceneMonitorBuilder {
    pub fn model(mut self, model: Arc<RobotModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Start from `scene` instead of an empty one.
    pub fn scene(mut self, scene: SceneData) -> Self {
        self.scene = Some(scene);
        self
    }

    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn transform_source(mut self, source: Arc<dyn TransformSource>) -> Self {
        self.transforms = Some(source);
        self
    }

    pub fn occupancy(mut self, occupancy: Arc<dyn OccupancyMonitor>) -> Self {
        self.occupancy = Some(occupancy);
        self
    }

    /// Use an existing tracker instead of creating one on
    /// [`start_state_monitor`][SceneMonitor::start_state_monitor].
    pub fn tracker(mut self, tracker: StateTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> Result<SceneMonitor, VigilError> {
        let model = self
            .model
            .or_else(|| self.scene.as_ref().map(|s| s.model().clone()))
            .ok_or_else(|| VigilError::Construction("no robot model supplied".to_string()))?;
        if let Some(scene) = &self.scene
            && scene.model().name() != model.name()
        {
            return Err(VigilError::Construction(format!(
                "scene is for robot '{}', monitor for '{}'",
                scene.model().name(),
                model.name()
            )));
        }
        if let Some(tracker) = &self.tracker
            && tracker.model().name() != model.name()
        {
            return Err(VigilError::Construction(format!(
                "tracker is for robot '{}', monitor for '{}'",
                tracker.model().name(),
                model.name()
            )));
        }
        self.config
            .validate()
            .map_err(|e| VigilError::Construction(e.to_string()))?;

        let config = self.config;
        let mut root = self.scene.unwrap_or_else(|| SceneData::new(model.clone()));
        configure_scene(&mut root, &config);

        let span = self
            .span
            .unwrap_or_else(|| info_span!("scene_monitor", name = %config.name));
        let tree = self.occupancy.as_ref().map(|o| o.tree());
        let (robot_motion, _) = watch::channel(Stamp::UNIX_EPOCH);
        let state_interval = config.state_update_interval();
        let publish_hz = Arc::new(AtomicU64::new(config.publish_hz.to_bits()));

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let mut chain = SceneChain::new(root);
            chain.add_observer(object_observer(weak.clone()));
            Inner {
                model,
                bus: self.bus.unwrap_or_default(),
                transforms: self.transforms,
                occupancy: self.occupancy,
                tree,
                span,
                scene: RwLock::new(SceneSlot {
                    chain,
                    last_update: None,
                    last_robot_motion: Stamp::UNIX_EPOCH,
                }),
                tracker: Mutex::new(self.tracker),
                tracker_hooked: AtomicBool::new(false),
                observers: ReentrantMutex::new(RefCell::new(Vec::new())),
                shapes: ReentrantMutex::new(RefCell::new(ShapeExclusionCache::new())),
                pending: Mutex::new(PendingState {
                    pending: false,
                    last_refresh: None,
                    interval: state_interval,
                    timer_enabled: false,
                    timer: None,
                }),
                dirty: Mutex::new(ChangeCategory::empty()),
                wake: Arc::new(Notify::new()),
                robot_motion,
                publisher: Mutex::new(Publisher {
                    task: None,
                    hz: publish_hz,
                    categories: Arc::new(AtomicU8::new(config.publish_categories.bits())),
                }),
                feeds: Mutex::new(Feeds::default()),
                incomplete_warned_at: Mutex::new(None),
                config,
            }
        });
        Ok(SceneMonitor { inner })
    }
}

/// Apply name, padding and default collision entries from `config`.
fn configure_scene(data: &mut SceneData, config: &MonitorConfig) {
    if data.name.is_empty() {
        data.name = config.name.clone();
    }
    data.padding.default_padding = config.default_robot_padding;
    data.padding.default_scale = config.default_robot_scale;
    for (link, padding) in &config.link_padding {
        data.padding.set_link_padding(link, *padding);
    }
    for (link, scale) in &config.link_scale {
        data.padding.set_link_scale(link, *scale);
    }
    for op in &config.default_collision_operations {
        data.acm.set_entry(&op.object1, &op.object2, op.allowed);
    }
}

fn object_observer(weak: Weak<Inner>) -> SceneObjectObserver {
    Arc::new(move |event| {
        if let Some(monitor) = upgrade(&weak) {
            monitor.on_scene_object_event(event);
        }
    })
}

// ────────────────────────────────────────────────────────────────────────────
// State
// ────────────────────────────────────────────────────────────────────────────

struct SceneSlot {
    chain: SceneChain,
    /// Wall-clock time of the latest mutation.
    last_update: Option<Stamp>,
    /// Stamp of the latest robot state that reached the scene.
    last_robot_motion: Stamp,
}

struct PendingState {
    /// A tracker update arrived inside the throttle window.
    pending: bool,
    last_refresh: Option<Instant>,
    /// Minimum spacing of refreshes; zero never throttles.
    interval: Duration,
    timer_enabled: bool,
    timer: Option<JoinHandle<()>>,
}

impl PendingState {
    fn interval_elapsed(&self, now: Instant) -> bool {
        self.last_refresh
            .is_none_or(|last| now.duration_since(last) >= self.interval)
    }
}

struct Publisher {
    task: Option<JoinHandle<()>>,
    /// Rate in Hz, as `f64` bits; read by the task on every cycle.
    hz: Arc<AtomicU64>,
    /// `ChangeCategory` bits the task publishes on.
    categories: Arc<AtomicU8>,
}

impl Publisher {
    fn categories(&self) -> ChangeCategory {
        ChangeCategory::from_bits_truncate(self.categories.load(Ordering::Relaxed))
    }
}

struct Subscription {
    topic: String,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Feeds {
    scene: Option<Subscription>,
    collision: Option<Subscription>,
    world: Option<Subscription>,
    attached: Option<Subscription>,
}

struct Inner {
    config: MonitorConfig,
    model: Arc<RobotModel>,
    bus: EventBus,
    transforms: Option<Arc<dyn TransformSource>>,
    occupancy: Option<Arc<dyn OccupancyMonitor>>,
    tree: Option<Arc<OccupancyTree>>,
    span: Span,
    scene: RwLock<SceneSlot>,
    tracker: Mutex<Option<StateTracker>>,
    tracker_hooked: AtomicBool,
    observers: ReentrantMutex<RefCell<Vec<SceneUpdateObserver>>>,
    shapes: ReentrantMutex<RefCell<ShapeExclusionCache>>,
    pending: Mutex<PendingState>,
    /// Categories changed since the last publication.
    dirty: Mutex<ChangeCategory>,
    wake: Arc<Notify>,
    robot_motion: watch::Sender<Stamp>,
    publisher: Mutex<Publisher>,
    feeds: Mutex<Feeds>,
    incomplete_warned_at: Mutex<Option<Instant>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.publisher.get_mut().task.take() {
            task.abort();
        }
        if let Some(timer) = self.pending.get_mut().timer.take() {
            timer.abort();
        }
        let feeds = self.feeds.get_mut();
        for sub in [
            feeds.scene.take(),
            feeds.collision.take(),
            feeds.world.take(),
            feeds.attached.take(),
        ]
        .into_iter()
        .flatten()
        {
            sub.task.abort();
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Lock guards
// ────────────────────────────────────────────────────────────────────────────

/// Shared access to the scene (and the occupancy tree, when present).
/// Released on drop.
pub struct SceneReadGuard<'a> {
    // Declared first: released before the scene.
    _occupancy: Option<RwLockReadGuard<'a, Octree>>,
    slot: RwLockReadGuard<'a, SceneSlot>,
}

impl Deref for SceneReadGuard<'_> {
    type Target = SceneChain;

    fn deref(&self) -> &SceneChain {
        &self.slot.chain
    }
}

/// Exclusive access to the scene (and the occupancy tree, when present).
///
/// Changes made through this guard are not classified or announced; call
/// [`SceneMonitor::notify`] after releasing it.
pub struct SceneWriteGuard<'a> {
    _occupancy: Option<RwLockWriteGuard<'a, Octree>>,
    slot: RwLockWriteGuard<'a, SceneSlot>,
}

impl Deref for SceneWriteGuard<'_> {
    type Target = SceneChain;

    fn deref(&self) -> &SceneChain {
        &self.slot.chain
    }
}

impl DerefMut for SceneWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut SceneChain {
        &mut self.slot.chain
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SceneMonitor
// ────────────────────────────────────────────────────────────────────────────

/// Shared handle to a monitored scene.
#[derive(Clone)]
pub struct SceneMonitor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SceneMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneMonitor")
            .field("name", &self.inner.config.name)
            .field("model", &self.inner.model.name())
            .field("publishing", &self.is_publishing())
            .finish_non_exhaustive()
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<SceneMonitor> {
    weak.upgrade().map(|inner| SceneMonitor { inner })
}

impl SceneMonitor {
    pub fn builder() -> SceneMonitorBuilder {
        SceneMonitorBuilder::default()
    }

    pub fn model(&self) -> &Arc<RobotModel> {
        &self.inner.model
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// The attached state tracker, if any.
    pub fn tracker(&self) -> Option<StateTracker> {
        self.inner.tracker.lock().clone()
    }

    pub fn occupancy(&self) -> Option<&Arc<dyn OccupancyMonitor>> {
        self.inner.occupancy.as_ref()
    }

    // ── Locking ─────────────────────────────────────────────────────────────

    /// Lock the scene for reading.  Readers run concurrently with each other
    /// but never with a writer.
    pub fn lock_read(&self) -> SceneReadGuard<'_> {
        let slot = self.inner.scene.read();
        SceneReadGuard {
            _occupancy: self.inner.tree.as_ref().map(|t| t.read()),
            slot,
        }
    }

    /// Lock the scene for writing.
    pub fn lock_write(&self) -> SceneWriteGuard<'_> {
        let slot = self.inner.scene.write();
        SceneWriteGuard {
            _occupancy: self.inner.tree.as_ref().map(|t| t.write()),
            slot,
        }
    }

    /// Copy of the live scene.
    pub fn scene_snapshot(&self) -> SceneData {
        self.inner.scene.read().chain.current().clone()
    }

    /// Full message describing the live scene.
    pub fn scene_msg(&self) -> SceneMsg {
        let slot = self.inner.scene.read();
        slot.chain.full_msg(slot.last_robot_motion)
    }

    pub fn scene_name(&self) -> String {
        self.inner.scene.read().chain.current().name.clone()
    }

    /// Wall-clock time of the latest scene mutation.
    pub fn last_update_time(&self) -> Option<Stamp> {
        self.inner.scene.read().last_update
    }

    /// Stamp of the latest robot state that reached the scene.
    pub fn last_robot_motion_time(&self) -> Stamp {
        self.inner.scene.read().last_robot_motion
    }

    fn set_robot_motion(&self, slot: &mut SceneSlot, stamp: Stamp) {
        slot.last_robot_motion = stamp;
        self.inner.robot_motion.send_replace(stamp);
    }

    // ── Diff mode ───────────────────────────────────────────────────────────

    /// Couple (`true`) or decouple (`false`) the scene from a diff overlay.
    ///
    /// Decoupling while republishing stops the publisher first, since there
    /// are no diffs left to publish.
    pub fn monitor_diffs(&self, enable: bool) {
        if !enable && self.is_publishing() {
            warn!(parent: &self.inner.span, "diff monitoring disabled while publishing; stopping publisher");
            self.stop_republishing();
        }
        self.set_coupled(enable);
    }

    fn set_coupled(&self, enable: bool) {
        let mut slot = self.inner.scene.write();
        slot.chain.with_observers_suppressed(|chain| {
            if enable {
                chain.couple();
            } else {
                chain.decouple();
            }
        });
        debug!(parent: &self.inner.span, coupled = enable, "diff monitoring toggled");
    }

    pub fn is_monitoring_diffs(&self) -> bool {
        self.inner.scene.read().chain.is_coupled()
    }

    // ── Mutation entry points ───────────────────────────────────────────────

    /// Apply a full or diff scene message and announce its category.
    ///
    /// Returns `false` when part of the message was rejected; the rest is
    /// still applied.
    pub fn apply_external_scene_message(&self, msg: &SceneMsg) -> bool {
        let inner = &self.inner;
        let (result, old_name) = {
            let mut slot = inner.scene.write();
            let shapes = inner.shapes.lock();
            slot.last_update = Some(Utc::now());
            self.set_robot_motion(&mut slot, msg.robot_state.joint_state.stamp);
            let old_name = slot.chain.current().name.clone();
            let result = slot.chain.apply_scene_msg(msg);
            if let Some(tree) = &inner.tree
                && !msg.is_diff
                && msg.world.octomap_is_empty()
            {
                tree.write().clear();
            }
            self.rederive_body_exclusions(&shapes, slot.chain.current());
            (result, old_name)
        };
        if let Err(e) = &result {
            warn!(parent: &inner.span, error = %e, "scene message partially rejected");
        }
        self.notify(classify_scene_msg(msg, &old_name));
        result.is_ok()
    }

    /// Replace the world geometry.
    pub fn apply_world_delta(&self, msg: &WorldMsg) -> bool {
        self.refresh_frame_transforms();
        let inner = &self.inner;
        let result = {
            let mut slot = inner.scene.write();
            slot.last_update = Some(Utc::now());
            let result = slot.chain.process_world_msg(msg);
            if let Some(tree) = &inner.tree
                && msg.octomap_is_empty()
            {
                tree.write().clear();
            }
            result
        };
        if let Err(e) = &result {
            warn!(parent: &inner.span, error = %e, "world message partially rejected");
        }
        self.notify(ChangeCategory::FULL_SCENE);
        result.is_ok()
    }

    pub fn apply_collision_object_edit(&self, msg: &CollisionObjectMsg) -> bool {
        self.refresh_frame_transforms();
        let result = {
            let mut slot = self.inner.scene.write();
            slot.last_update = Some(Utc::now());
            slot.chain.process_collision_object(msg)
        };
        self.finish_object_edit(&msg.id, result)
    }

    pub fn apply_attached_object_edit(&self, msg: &AttachedCollisionObjectMsg) -> bool {
        self.refresh_frame_transforms();
        let result = {
            let mut slot = self.inner.scene.write();
            slot.last_update = Some(Utc::now());
            slot.chain.process_attached_object(msg)
        };
        self.finish_object_edit(&msg.object.id, result)
    }

    fn finish_object_edit(&self, id: &str, result: Result<bool, VigilError>) -> bool {
        let applied = match result {
            Ok(applied) => applied,
            Err(e) => {
                warn!(parent: &self.inner.span, object = id, error = %e, "object edit rejected");
                false
            }
        };
        self.notify(ChangeCategory::GEOMETRY);
        applied
    }

    /// Copy the occupancy tree into the scene's occupancy overlay.
    pub fn apply_occupancy_update(&self) {
        let Some(tree) = &self.inner.tree else {
            return;
        };
        self.refresh_frame_transforms();
        {
            let mut slot = self.inner.scene.write();
            slot.last_update = Some(Utc::now());
            let octree = tree.read();
            let octomap = OctomapMsg {
                frame_id: tree.frame_id().to_string(),
                resolution: octree.resolution(),
                points: octree.occupied_voxels(),
            };
            slot.chain.set_octomap(Some(octomap));
        }
        self.notify(ChangeCategory::GEOMETRY);
    }

    /// Drop the occupancy overlay and empty the occupancy tree.
    pub fn clear_occupancy(&self) {
        let removed = {
            let mut slot = self.inner.scene.write();
            let removed = slot.chain.current().octomap.is_some();
            if removed {
                slot.chain.set_octomap(None);
            }
            match &self.inner.tree {
                Some(tree) => tree.write().clear(),
                None => warn!(parent: &self.inner.span, "no occupancy monitor to clear"),
            }
            removed
        };
        if removed {
            self.notify(ChangeCategory::GEOMETRY);
        }
    }

    /// Pull every non-robot frame known to the transform source into the
    /// scene's fixed transforms.  Announces `TRANSFORMS` if they changed.
    pub fn refresh_frame_transforms(&self) {
        let Some(source) = &self.inner.transforms else {
            return;
        };
        let model = &self.inner.model;
        let model_frame = model.model_frame();
        let transforms: Vec<StampedTransform> = source
            .frame_names()
            .into_iter()
            .filter(|frame| frame != model_frame && !model.has_link(frame))
            .filter_map(|frame| source.lookup(model_frame, &frame, None).ok())
            .collect();

        let changed = {
            let mut slot = self.inner.scene.write();
            let unchanged = slot
                .chain
                .current()
                .fixed_transforms
                .values()
                .eq(transforms.iter());
            if !unchanged {
                slot.chain.set_fixed_transforms(transforms);
                slot.last_update = Some(Utc::now());
            }
            !unchanged
        };
        if changed {
            self.notify(ChangeCategory::TRANSFORMS);
        }
    }

    // ── Robot state ─────────────────────────────────────────────────────────

    /// Refresh the scene's robot state from the tracker, at most once per
    /// state-update interval.  A refresh skipped by the throttle is kept
    /// pending and flushed by the background timer.
    pub fn refresh_state_from_tracker(&self) {
        let run = {
            let mut pending = self.inner.pending.lock();
            let now = Instant::now();
            if pending.interval_elapsed(now) {
                pending.pending = false;
                pending.last_refresh = Some(now);
                true
            } else {
                pending.pending = true;
                false
            }
        };
        if run {
            self.update_scene_with_current_state();
        }
    }

    /// Refresh now if a throttled refresh is pending and due.
    fn flush_pending_state(&self, force: bool) -> bool {
        let run = {
            let mut pending = self.inner.pending.lock();
            let now = Instant::now();
            if pending.pending && (force || pending.interval_elapsed(now)) {
                pending.pending = false;
                pending.last_refresh = Some(now);
                true
            } else {
                false
            }
        };
        if run {
            self.update_scene_with_current_state();
        }
        run
    }

    /// Copy the tracker's joint values into the scene, ignoring the
    /// throttle, and announce `STATE`.
    pub fn update_scene_with_current_state(&self) {
        let Some(tracker) = self.tracker() else {
            return;
        };
        self.warn_if_incomplete(&tracker);
        {
            let mut slot = self.inner.scene.write();
            if let Some(stamp) = tracker.current_state_time() {
                slot.last_update = Some(stamp);
                self.set_robot_motion(&mut slot, stamp);
            }
            slot.chain.modify_robot_state(|state| {
                tracker.set_to_current_state(state);
                state.update();
            });
        }
        self.notify(ChangeCategory::STATE);
    }

    fn warn_if_incomplete(&self, tracker: &StateTracker) {
        let missing = tracker.missing_joints();
        if missing.is_empty() {
            return;
        }
        let started = tracker.monitor_start_time().unwrap_or_else(Utc::now);
        let running = (Utc::now() - started).to_std().unwrap_or_default();
        if running <= INCOMPLETE_STATE_GRACE {
            return;
        }
        let mut warned = self.inner.incomplete_warned_at.lock();
        if warned.is_some_and(|t| t.elapsed() < INCOMPLETE_STATE_WARN_PERIOD) {
            return;
        }
        *warned = Some(Instant::now());
        warn!(parent: &self.inner.span, missing = ?missing, "robot state is not yet complete");
    }

    /// Wait until a robot state stamped at or after `target` reached the
    /// scene.
    ///
    /// With a tracker this waits on the tracker and then flushes a pending
    /// throttled refresh.  Without one, state only arrives through scene
    /// messages, so this waits for one carrying a recent enough stamp.
    pub async fn wait_for_current_robot_state(&self, target: Stamp, timeout: Duration) -> bool {
        if target == Stamp::UNIX_EPOCH {
            return false;
        }
        if let Some(tracker) = self.tracker() {
            if tracker.wait_for_current_state(target, timeout).await {
                self.flush_pending_state(true);
                return true;
            }
            warn!(parent: &self.inner.span, "failed to fetch current robot state");
            return false;
        }

        let mut rx = self.inner.robot_motion.subscribe();
        let before = *rx.borrow();
        let success = tokio::time::timeout(timeout, rx.wait_for(|t| *t >= target))
            .await
            .is_ok_and(|reached| reached.is_ok());
        if !success {
            let last = *rx.borrow();
            if last != before {
                warn!(parent: &self.inner.span, lag_secs = (target - last).num_milliseconds() as f64 / 1e3, "robot state may not be current");
            }
        }
        success
    }

    /// Minimum spacing of scene refreshes from the tracker.  `0` refreshes
    /// on every tracker update and flushes a pending refresh immediately.
    pub fn set_state_update_frequency(&self, hz: f64) -> Result<(), VigilError> {
        if !hz.is_finite() || hz < 0.0 {
            return Err(VigilError::InvalidRate(hz));
        }
        let flush = {
            let mut pending = self.inner.pending.lock();
            pending.interval = rate_to_interval(hz);
            self.restart_state_timer(&mut pending);
            pending.interval.is_zero() && pending.pending
        };
        if flush {
            self.flush_pending_state(true);
        }
        info!(parent: &self.inner.span, hz, "state update frequency set");
        Ok(())
    }

    pub fn state_update_interval(&self) -> Duration {
        self.inner.pending.lock().interval
    }

    /// Whether a throttled state refresh is waiting to be flushed.
    pub fn has_pending_state_update(&self) -> bool {
        self.inner.pending.lock().pending
    }

    fn restart_state_timer(&self, pending: &mut PendingState) {
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        if !pending.timer_enabled || pending.interval.is_zero() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(parent: &self.inner.span, "no async runtime, pending state updates flush on the next update");
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let period = pending.interval;
        pending.timer = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = upgrade(&weak) else {
                    break;
                };
                monitor.flush_pending_state(false);
            }
        }));
    }

    // ── Observers ───────────────────────────────────────────────────────────

    pub fn add_update_observer(&self, observer: SceneUpdateObserver) {
        let observers = self.inner.observers.lock();
        observers.borrow_mut().push(observer);
    }

    pub fn clear_update_observers(&self) {
        let observers = self.inner.observers.lock();
        observers.borrow_mut().clear();
    }

    /// Run the update observers with `category`, then mark it dirty for
    /// the publisher.
    pub fn notify(&self, category: ChangeCategory) {
        {
            let guard = self.inner.observers.lock();
            let observers = guard.borrow().clone();
            for observer in &observers {
                observer(category);
            }
        }
        if !category.is_empty() {
            *self.inner.dirty.lock() |= category;
            self.inner.wake.notify_one();
        }
        debug!(parent: &self.inner.span, ?category, "scene updated");
    }

    // ── Republishing ────────────────────────────────────────────────────────

    /// Publish the scene on the monitored-scene topic: one full message now,
    /// then a diff (or full message after a `FULL_SCENE` change) whenever a
    /// change in `categories` happens, at most `hz` times per second.
    ///
    /// Couples the scene to a diff overlay.  When already publishing, only
    /// the categories and rate change.
    pub fn start_republishing(&self, categories: ChangeCategory, hz: f64) -> Result<(), VigilError> {
        if !hz.is_finite() || hz <= 0.0 {
            return Err(VigilError::InvalidRate(hz));
        }
        let runtime = Handle::try_current()
            .map_err(|e| VigilError::Channel(format!("cannot start publisher: {e}")))?;
        self.set_coupled(true);
        let mut publisher = self.inner.publisher.lock();
        publisher.hz.store(hz.to_bits(), Ordering::Relaxed);
        publisher
            .categories
            .store(categories.bits(), Ordering::Relaxed);
        if publisher.task.is_some() {
            debug!(parent: &self.inner.span, ?categories, hz, "publisher updated");
            return Ok(());
        }

        publisher.task = Some(runtime.spawn(republish(
            Arc::downgrade(&self.inner),
            self.inner.wake.clone(),
            publisher.hz.clone(),
            publisher.categories.clone(),
        )));
        info!(
            parent: &self.inner.span,
            topic = %self.inner.config.monitored_planning_scene_topic,
            ?categories,
            hz,
            "publishing scene"
        );
        Ok(())
    }

    /// Stop the publisher.  Changes already marked dirty are published once
    /// more, then the scene is decoupled from its diff overlay.
    pub fn stop_republishing(&self) {
        let (task, categories) = {
            let mut publisher = self.inner.publisher.lock();
            let Some(task) = publisher.task.take() else {
                return;
            };
            (task, publisher.categories())
        };
        task.abort();
        if let Some(msg) = self.take_publication(categories) {
            self.publish(msg);
        }
        self.set_coupled(false);
        info!(parent: &self.inner.span, "stopped publishing scene");
    }

    pub fn is_publishing(&self) -> bool {
        self.inner.publisher.lock().task.is_some()
    }

    pub fn set_publishing_frequency(&self, hz: f64) -> Result<(), VigilError> {
        if !hz.is_finite() || hz <= 0.0 {
            return Err(VigilError::InvalidRate(hz));
        }
        self.inner
            .publisher
            .lock()
            .hz
            .store(hz.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    pub fn publishing_frequency(&self) -> f64 {
        f64::from_bits(self.inner.publisher.lock().hz.load(Ordering::Relaxed))
    }

    /// Consume the dirty categories and, if they call for it, fold the
    /// overlay into the root and build the message describing the change.
    fn take_publication(&self, categories: ChangeCategory) -> Option<SceneMsg> {
        let inner = &self.inner;
        let mut slot = inner.scene.write();
        let dirty = std::mem::take(&mut *inner.dirty.lock());
        if !dirty.is_full_scene() && !dirty.intersects(categories) {
            return None;
        }
        let stamp = slot.last_robot_motion;
        let full = dirty.is_full_scene();
        let diff = {
            let _octree = inner.tree.as_ref().map(|t| t.read());
            (!full).then(|| slot.chain.diff_msg(stamp))
        };
        {
            let shapes = inner.shapes.lock();
            slot.chain.with_observers_suppressed(|chain| {
                chain.push_diffs();
                chain.clear_diffs();
            });
            self.rederive_body_exclusions(&shapes, slot.chain.current());
        }
        let mut msg = match diff {
            Some(diff) => diff,
            None => {
                let _octree = inner.tree.as_ref().map(|t| t.read());
                slot.chain.full_msg(stamp)
            }
        };
        msg.robot_state.joint_state.stamp = stamp;
        Some(msg)
    }

    fn publish_full_scene(&self) {
        let msg = {
            let slot = self.inner.scene.read();
            let _octree = self.inner.tree.as_ref().map(|t| t.read());
            slot.chain.full_msg(slot.last_robot_motion)
        };
        self.publish(msg);
    }

    fn publish(&self, msg: SceneMsg) {
        let topic = &self.inner.config.monitored_planning_scene_topic;
        let is_diff = msg.is_diff;
        let event = Event::new(PUBLISHER_SOURCE, EventPayload::Scene(Box::new(msg)));
        match self.inner.bus.publish_to(topic, event) {
            Ok(receivers) => debug!(parent: &self.inner.span, topic = %topic, is_diff, receivers, "scene published"),
            Err(e) => debug!(parent: &self.inner.span, topic = %topic, error = %e, "scene not delivered"),
        }
    }

    // ── Feeds ───────────────────────────────────────────────────────────────

    /// Apply scene messages arriving on `topic`.  Replaces a previous scene
    /// subscription; an empty topic only stops it.
    pub fn start_scene_monitor(&self, topic: &str) {
        self.stop_scene_monitor();
        if topic.is_empty() {
            return;
        }
        let Some(sub) = self.subscribe(topic, |monitor, payload| {
            if let EventPayload::Scene(msg) = payload {
                monitor.apply_external_scene_message(&msg);
            }
        }) else {
            return;
        };
        self.inner.feeds.lock().scene = Some(sub);
        info!(parent: &self.inner.span, topic, "listening to scene messages");
    }

    pub fn stop_scene_monitor(&self) {
        let sub = self.inner.feeds.lock().scene.take();
        if let Some(sub) = sub {
            sub.task.abort();
            info!(parent: &self.inner.span, topic = %sub.topic, "stopped listening to scene messages");
        }
    }

    /// Apply collision-object edits from `collision_topic` and world
    /// replacements from `world_topic` (either may be empty).  With
    /// `load_occupancy`, the occupancy monitor is started with the robot
    /// and every known body excluded from it.
    pub fn start_world_geometry_monitor(
        &self,
        collision_topic: &str,
        world_topic: &str,
        load_occupancy: bool,
    ) {
        self.stop_world_geometry_monitor();
        let collision = (!collision_topic.is_empty())
            .then(|| {
                self.subscribe(collision_topic, |monitor, payload| {
                    if let EventPayload::CollisionObject(msg) = payload {
                        monitor.apply_collision_object_edit(&msg);
                    }
                })
            })
            .flatten();
        let world = (!world_topic.is_empty())
            .then(|| {
                self.subscribe(world_topic, |monitor, payload| {
                    if let EventPayload::World(msg) = payload {
                        monitor.apply_world_delta(&msg);
                    }
                })
            })
            .flatten();
        {
            let mut feeds = self.inner.feeds.lock();
            feeds.collision = collision;
            feeds.world = world;
        }
        info!(parent: &self.inner.span, collision_topic, world_topic, "listening to world geometry");

        if load_occupancy {
            match &self.inner.occupancy {
                Some(occupancy) => self.start_occupancy(occupancy.as_ref()),
                None => warn!(parent: &self.inner.span, "occupancy requested but no occupancy monitor configured"),
            }
        }
    }

    fn start_occupancy(&self, occupancy: &dyn OccupancyMonitor) {
        let weak = Arc::downgrade(&self.inner);
        occupancy.set_transform_cache_provider(Some(Arc::new(move |frame: &str, time: Stamp| {
            upgrade(&weak)?.shape_transform_cache(frame, time)
        })));
        let weak = Arc::downgrade(&self.inner);
        occupancy.set_update_callback(Some(Arc::new(move || {
            if let Some(monitor) = upgrade(&weak) {
                monitor.apply_occupancy_update();
            }
        })));
        self.exclude_robot_links_from_occupancy();
        {
            let slot = self.inner.scene.read();
            let shapes = self.inner.shapes.lock();
            self.rederive_body_exclusions(&shapes, slot.chain.current());
        }
        occupancy.start();
    }

    pub fn stop_world_geometry_monitor(&self) {
        let (collision, world) = {
            let mut feeds = self.inner.feeds.lock();
            (feeds.collision.take(), feeds.world.take())
        };
        let stopped = collision.is_some() || world.is_some();
        for sub in [collision, world].into_iter().flatten() {
            sub.task.abort();
        }
        if let Some(occupancy) = &self.inner.occupancy {
            occupancy.stop();
        }
        if stopped {
            info!(parent: &self.inner.span, "stopped listening to world geometry");
        }
    }

    /// Track joint states from `joint_topic` and attach/detach edits from
    /// `attached_topic` (may be empty).  Creates a tracker when none was
    /// supplied.
    pub fn start_state_monitor(&self, joint_topic: &str, attached_topic: &str) {
        self.stop_state_monitor();
        let tracker = self.ensure_tracker();
        if !self.inner.tracker_hooked.swap(true, Ordering::AcqRel) {
            let weak = Arc::downgrade(&self.inner);
            tracker.add_update_observer(Arc::new(move |_| {
                if let Some(monitor) = upgrade(&weak) {
                    monitor.refresh_state_from_tracker();
                }
            }));
        }
        tracker.start_monitoring(&self.inner.bus, joint_topic);
        {
            let mut pending = self.inner.pending.lock();
            pending.timer_enabled = true;
            self.restart_state_timer(&mut pending);
        }
        if !attached_topic.is_empty() {
            let sub = self.subscribe(attached_topic, |monitor, payload| {
                if let EventPayload::AttachedCollisionObject(msg) = payload {
                    monitor.apply_attached_object_edit(&msg);
                }
            });
            self.inner.feeds.lock().attached = sub;
        }
    }

    pub fn stop_state_monitor(&self) {
        if let Some(tracker) = self.tracker() {
            tracker.stop_monitoring();
        }
        let attached = self.inner.feeds.lock().attached.take();
        if let Some(sub) = attached {
            sub.task.abort();
        }
        let mut pending = self.inner.pending.lock();
        pending.timer_enabled = false;
        pending.pending = false;
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
    }

    fn ensure_tracker(&self) -> StateTracker {
        let mut slot = self.inner.tracker.lock();
        if let Some(tracker) = slot.as_ref() {
            return tracker.clone();
        }
        let mut builder = StateTracker::builder(self.inner.model.clone())
            .copy_dynamics(self.inner.config.copy_dynamics)
            .bounds_tolerance(self.inner.config.joint_bounds_tolerance)
            .span(info_span!(parent: &self.inner.span, "state_tracker"));
        if let Some(source) = &self.inner.transforms {
            builder = builder.transform_source(source.clone());
        }
        let tracker = builder.build();
        *slot = Some(tracker.clone());
        tracker
    }

    /// Topics currently consumed.
    pub fn monitored_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .tracker()
            .and_then(|t| t.monitored_feed())
            .into_iter()
            .collect();
        let feeds = self.inner.feeds.lock();
        topics.extend(
            [&feeds.scene, &feeds.collision, &feeds.world, &feeds.attached]
                .into_iter()
                .flatten()
                .map(|sub| sub.topic.clone()),
        );
        topics
    }

    fn subscribe(
        &self,
        topic: &str,
        handle: impl Fn(&SceneMonitor, EventPayload) + Send + 'static,
    ) -> Option<Subscription> {
        let Ok(runtime) = Handle::try_current() else {
            warn!(parent: &self.inner.span, topic, "no async runtime, not subscribing");
            return None;
        };
        let rx: TopicReceiver = self.inner.bus.subscribe_to(topic);
        let weak = Arc::downgrade(&self.inner);
        let task = runtime.spawn(consume(rx, weak, handle));
        Some(Subscription {
            topic: topic.to_string(),
            task,
        })
    }

    /// Seed the scene from `service`.
    pub async fn request_scene_state(&self, service: &dyn SceneService) -> bool {
        match service.get_planning_scene().await {
            Ok(msg) => {
                info!(parent: &self.inner.span, service = service.name(), "scene fetched");
                self.apply_external_scene_message(&msg)
            }
            Err(e) => {
                warn!(parent: &self.inner.span, service = service.name(), error = %e, "failed to fetch scene");
                false
            }
        }
    }

    // ── Occupancy exclusion ─────────────────────────────────────────────────

    fn on_scene_object_event(&self, event: &SceneObjectEvent) {
        let Some(occupancy) = &self.inner.occupancy else {
            return;
        };
        let occupancy = occupancy.as_ref();
        let config = &self.inner.config;
        let guard = self.inner.shapes.lock();
        let mut cache = guard.borrow_mut();
        match event {
            SceneObjectEvent::BodyAttached(body) => {
                cache.exclude_attached_body(body, config.default_attached_padding, occupancy);
            }
            SceneObjectEvent::BodyDetached(body) => {
                cache.include_attached_body(&body.id, occupancy);
            }
            SceneObjectEvent::WorldObjectUpdated(object) if object.id != OCTOMAP_ID => {
                cache.exclude_world_object(object, config.default_object_padding, occupancy);
            }
            SceneObjectEvent::WorldObjectRemoved(object) => {
                cache.include_world_object(&object.id, occupancy);
            }
            SceneObjectEvent::WorldObjectUpdated(_) => {}
        }
    }

    /// Exclude the collision geometry of every robot link.
    pub fn exclude_robot_links_from_occupancy(&self) {
        let Some(occupancy) = &self.inner.occupancy else {
            return;
        };
        let slot = self.inner.scene.read();
        let guard = self.inner.shapes.lock();
        let count = guard.borrow_mut().exclude_robot_links(
            &self.inner.model,
            &slot.chain.current().padding,
            occupancy.as_ref(),
        );
        debug!(parent: &self.inner.span, shapes = count, "robot links excluded from occupancy");
    }

    pub fn include_robot_links_in_occupancy(&self) {
        if let Some(occupancy) = &self.inner.occupancy {
            let guard = self.inner.shapes.lock();
            guard.borrow_mut().include_robot_links(occupancy.as_ref());
        }
    }

    /// Re-derive attached-body and world-object exclusions from `data`.
    /// The caller holds the scene lock and the shape lock.
    fn rederive_body_exclusions(
        &self,
        shapes: &RefCell<ShapeExclusionCache>,
        data: &SceneData,
    ) {
        let Some(occupancy) = &self.inner.occupancy else {
            return;
        };
        let config = &self.inner.config;
        let mut cache = shapes.borrow_mut();
        cache.exclude_attached_bodies(
            data.robot_state.attached_bodies(),
            config.default_attached_padding,
            occupancy.as_ref(),
        );
        cache.exclude_world_objects(
            data.world.objects().filter(|o| o.id != OCTOMAP_ID),
            config.default_object_padding,
            occupancy.as_ref(),
        );
    }

    /// Number of shapes currently excluded from occupancy.
    pub fn excluded_shape_count(&self) -> usize {
        self.inner.shapes.lock().borrow().len()
    }

    /// Pose in `target_frame` of every excluded shape.
    ///
    /// `None` when any shape's frame cannot be resolved, so the caller can
    /// skip the sensor batch rather than integrate the robot into the map.
    /// Transforms are resolved at their latest known value.
    pub fn shape_transform_cache(
        &self,
        target_frame: &str,
        time: Stamp,
    ) -> Option<HashMap<ShapeHandle, Pose>> {
        let guard = self.inner.shapes.lock();
        let cache = guard.borrow();
        if cache.is_empty() {
            return Some(HashMap::new());
        }
        let wait = self.inner.config.shape_transform_lookup_wait();
        let mut frames: HashMap<&str, Pose> = HashMap::new();
        let mut poses = HashMap::new();
        for entry in cache.entries() {
            let frame_pose = match frames.get(entry.frame.as_str()) {
                Some(pose) => *pose,
                None => {
                    let pose = if entry.frame == target_frame {
                        Pose::identity()
                    } else {
                        let Some(source) = &self.inner.transforms else {
                            warn!(parent: &self.inner.span, frame = %entry.frame, "no transform source to locate excluded shape");
                            return None;
                        };
                        source.can_transform(target_frame, &entry.frame, None, wait);
                        match source.lookup(target_frame, &entry.frame, None) {
                            Ok(t) => t.transform,
                            Err(e) => {
                                warn!(parent: &self.inner.span, %time, error = %e, "cannot locate excluded shape");
                                return None;
                            }
                        }
                    };
                    frames.insert(entry.frame.as_str(), pose);
                    pose
                }
            };
            poses.insert(entry.handle, frame_pose.compose(entry.pose));
        }
        Some(poses)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Background tasks
// ────────────────────────────────────────────────────────────────────────────

async fn consume(
    mut rx: TopicReceiver,
    weak: Weak<Inner>,
    handle: impl Fn(&SceneMonitor, EventPayload),
) {
    while let Some(event) = rx.recv().await {
        let Some(monitor) = upgrade(&weak) else {
            break;
        };
        handle(&monitor, event.payload);
    }
}

fn rate_limiter(hz: f64) -> DefaultDirectRateLimiter {
    let quota = Quota::with_period(rate_to_interval(hz))
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN));
    RateLimiter::direct(quota)
}

async fn republish(
    weak: Weak<Inner>,
    wake: Arc<Notify>,
    hz: Arc<AtomicU64>,
    categories: Arc<AtomicU8>,
) {
    let mut current_hz = f64::from_bits(hz.load(Ordering::Relaxed));
    let mut limiter = rate_limiter(current_hz);
    match upgrade(&weak) {
        Some(monitor) => monitor.publish_full_scene(),
        None => return,
    }
    let _ = limiter.check();

    loop {
        wake.notified().await;
        let requested = f64::from_bits(hz.load(Ordering::Relaxed));
        if requested != current_hz {
            current_hz = requested;
            limiter = rate_limiter(current_hz);
        }
        limiter.until_ready().await;
        let Some(monitor) = upgrade(&weak) else {
            break;
        };
        let categories = ChangeCategory::from_bits_truncate(categories.load(Ordering::Relaxed));
        if let Some(msg) = monitor.take_publication(categories) {
            monitor.publish(msg);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Classification
// ────────────────────────────────────────────────────────────────────────────

/// Category of the change a scene message makes to a scene named
/// `old_name`.
///
/// Full messages, and diffs touching the name, collision matrix or padding,
/// are `FULL_SCENE`.  Other diffs report what they carry.
pub fn classify_scene_msg(msg: &SceneMsg, old_name: &str) -> ChangeCategory {
    if !msg.is_diff {
        return ChangeCategory::FULL_SCENE;
    }
    let other_changes = !(msg.name.is_empty() || msg.name == old_name)
        || !msg.allowed_collision_matrix.is_empty()
        || !msg.link_padding.is_empty()
        || !msg.link_scale.is_empty();
    if other_changes {
        return ChangeCategory::FULL_SCENE;
    }

    let mut category = ChangeCategory::empty();
    if !msg.world.is_empty() {
        category |= ChangeCategory::GEOMETRY;
    }
    if !msg.fixed_frame_transforms.is_empty() {
        category |= ChangeCategory::TRANSFORMS;
    }
    if !msg.robot_state.is_empty() {
        category |= ChangeCategory::STATE;
        if !msg.robot_state.attached_collision_objects.is_empty() || !msg.robot_state.is_diff {
            category |= ChangeCategory::GEOMETRY;
        }
    }
    category
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use chrono::TimeZone;
    use vigil_middleware::{StaticSceneService, topics};
    use vigil_perception::{Aabb, OccupancyMapMonitor, TransformBuffer};
    use vigil_types::{JointStateMsg, ObjectOperation, Shape, Vec3};

    use super::*;
    use crate::config::MAX_INTERVAL;

    fn at(secs: i64) -> Stamp {
        Utc.timestamp_opt(secs, 0).single().expect("valid stamp")
    }

    fn model() -> Arc<RobotModel> {
        Arc::new(
            RobotModel::builder("arm")
                .link("base_link")
                .link("hand")
                .collision(
                    "hand",
                    Shape::Sphere { radius: 0.05 },
                    Pose::identity(),
                )
                .revolute("wrist", "base_link", "hand", -1.0, 1.0)
                .build()
                .expect("model"),
        )
    }

    fn monitor() -> SceneMonitor {
        SceneMonitor::builder().model(model()).build().expect("monitor")
    }

    fn cube(id: &str, frame: &str) -> CollisionObjectMsg {
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

    fn recording_observer(monitor: &SceneMonitor) -> Arc<Mutex<Vec<ChangeCategory>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        monitor.add_update_observer(Arc::new(move |c| s.lock().push(c)));
        seen
    }

    #[test]
    fn build_without_model_fails() {
        let err = SceneMonitor::builder().build().unwrap_err();
        assert!(matches!(err, VigilError::Construction(_)));
    }

    #[test]
    fn config_seeds_scene() {
        let mut config = MonitorConfig::default();
        config.name = "cell".into();
        config.default_robot_padding = 0.01;
        config.link_padding.insert("hand".into(), 0.03);
        config.default_collision_operations.push(crate::config::CollisionOperation {
            object1: "hand".into(),
            object2: "table".into(),
            allowed: true,
        });
        let monitor = SceneMonitor::builder()
            .model(model())
            .config(config)
            .build()
            .expect("monitor");
        let scene = monitor.scene_snapshot();
        assert_eq!(scene.name, "cell");
        assert_eq!(scene.padding.padding("hand"), 0.03);
        assert_eq!(scene.padding.padding("base_link"), 0.01);
        assert_eq!(scene.acm.entry("table", "hand"), Some(true));
    }

    #[test]
    fn collision_edit_reports_geometry() {
        let monitor = monitor();
        let seen = recording_observer(&monitor);
        assert!(monitor.apply_collision_object_edit(&cube("crate", "base_link")));
        assert_eq!(*seen.lock(), vec![ChangeCategory::GEOMETRY]);
        assert!(monitor.scene_snapshot().world.contains("crate"));
        assert!(monitor.last_update_time().is_some());
    }

    #[test]
    fn rejected_edit_still_notifies() {
        let monitor = monitor();
        let seen = recording_observer(&monitor);
        assert!(!monitor.apply_collision_object_edit(&cube("crate", "nowhere")));
        assert_eq!(seen.lock().len(), 1);
        assert!(monitor.scene_snapshot().world.is_empty());
    }

    #[test]
    fn world_delta_is_full_scene() {
        let monitor = monitor();
        let seen = recording_observer(&monitor);
        monitor.apply_world_delta(&WorldMsg {
            collision_objects: vec![cube("crate", "base_link")],
            octomap: None,
        });
        assert_eq!(*seen.lock(), vec![ChangeCategory::FULL_SCENE]);
    }

    #[test]
    fn classification_of_diffs() {
        let mut msg = SceneMsg {
            is_diff: true,
            ..SceneMsg::default()
        };
        msg.fixed_frame_transforms.push(StampedTransform {
            parent_frame: "base_link".into(),
            child_frame: "camera".into(),
            stamp: at(1),
            transform: Pose::identity(),
        });
        assert_eq!(classify_scene_msg(&msg, ""), ChangeCategory::TRANSFORMS);

        msg.name = "same".into();
        assert_eq!(classify_scene_msg(&msg, "same"), ChangeCategory::TRANSFORMS);
        assert_eq!(classify_scene_msg(&msg, "other"), ChangeCategory::FULL_SCENE);

        let full = SceneMsg::default();
        assert_eq!(classify_scene_msg(&full, ""), ChangeCategory::FULL_SCENE);
    }

    #[test]
    fn full_robot_state_in_diff_is_geometry_too() {
        let mut msg = SceneMsg {
            is_diff: true,
            ..SceneMsg::default()
        };
        msg.robot_state.is_diff = false;
        assert_eq!(
            classify_scene_msg(&msg, ""),
            ChangeCategory::STATE | ChangeCategory::GEOMETRY
        );
    }

    #[test]
    fn external_message_records_robot_motion() {
        let monitor = monitor();
        let mut msg = SceneMsg {
            is_diff: true,
            ..SceneMsg::default()
        };
        msg.robot_state.joint_state = JointStateMsg::from_positions(at(42), [("wrist", 0.5)]);
        assert!(monitor.apply_external_scene_message(&msg));
        assert_eq!(monitor.last_robot_motion_time(), at(42));
        assert_eq!(monitor.scene_snapshot().robot_state.position("wrist"), Some(0.5));
    }

    #[test]
    fn monitor_diffs_toggles_coupling() {
        let monitor = monitor();
        monitor.monitor_diffs(true);
        assert!(monitor.is_monitoring_diffs());
        monitor.apply_collision_object_edit(&cube("crate", "base_link"));
        let coupled = monitor.scene_snapshot();
        monitor.monitor_diffs(false);
        assert!(!monitor.is_monitoring_diffs());
        let guard = monitor.lock_read();
        assert!(guard.parent().is_none());
        assert_eq!(*guard.current(), coupled);
    }

    #[test]
    fn lock_write_allows_direct_edits() {
        let monitor = monitor();
        {
            let mut scene = monitor.lock_write();
            scene.set_name("edited");
        }
        assert_eq!(monitor.scene_name(), "edited");
    }

    #[test]
    fn readers_share_the_lock() {
        let monitor = monitor();
        let a = monitor.lock_read();
        let b = monitor.lock_read();
        assert_eq!(a.current().name, b.current().name);
    }

    #[test]
    fn occupancy_update_copies_the_tree() {
        let tree = Arc::new(OccupancyTree::new(
            "base_link",
            Aabb::around(Vec3::zero(), 2.0),
            0.25,
        ));
        let occupancy = Arc::new(OccupancyMapMonitor::new(tree.clone(), 0.0));
        let monitor = SceneMonitor::builder()
            .model(model())
            .occupancy(occupancy)
            .build()
            .expect("monitor");
        tree.write().insert(Vec3::new(0.6, 0.6, 0.6));
        let seen = recording_observer(&monitor);
        monitor.apply_occupancy_update();
        let octomap = monitor.scene_snapshot().octomap.expect("octomap");
        assert_eq!(octomap.points.len(), 1);
        assert_eq!(*seen.lock(), vec![ChangeCategory::GEOMETRY]);

        monitor.clear_occupancy();
        assert!(monitor.scene_snapshot().octomap.is_none());
        assert!(tree.read().is_empty());
    }

    #[test]
    fn world_objects_are_excluded_from_occupancy() {
        let tree = Arc::new(OccupancyTree::new(
            "base_link",
            Aabb::around(Vec3::zero(), 2.0),
            0.1,
        ));
        let occupancy = Arc::new(OccupancyMapMonitor::new(tree, 0.0));
        let monitor = SceneMonitor::builder()
            .model(model())
            .occupancy(occupancy.clone())
            .build()
            .expect("monitor");
        monitor.apply_collision_object_edit(&cube("crate", "base_link"));
        assert_eq!(occupancy.excluded_shape_count(), 1);

        let poses = monitor
            .shape_transform_cache("base_link", at(1))
            .expect("poses");
        let pose = poses.values().next().expect("one pose");
        assert_eq!(pose.translation, Vec3::new(1.0, 0.0, 0.0));

        let mut remove = cube("crate", "base_link");
        remove.operation = ObjectOperation::Remove;
        monitor.apply_collision_object_edit(&remove);
        assert_eq!(occupancy.excluded_shape_count(), 0);
        assert_eq!(monitor.excluded_shape_count(), 0);
    }

    #[test]
    fn shape_cache_resolves_link_frames() {
        let tree = Arc::new(OccupancyTree::new(
            "world",
            Aabb::around(Vec3::zero(), 2.0),
            0.1,
        ));
        let occupancy = Arc::new(OccupancyMapMonitor::new(tree, 0.0));
        let transforms = Arc::new(TransformBuffer::new());
        let monitor = SceneMonitor::builder()
            .model(model())
            .occupancy(occupancy)
            .transform_source(transforms.clone())
            .build()
            .expect("monitor");
        monitor.exclude_robot_links_from_occupancy();
        assert_eq!(monitor.excluded_shape_count(), 1);
        assert!(monitor.shape_transform_cache("world", at(1)).is_none());

        transforms.set_static_transform("world", "hand", Pose::from_translation(0.0, 0.0, 1.0));
        let poses = monitor.shape_transform_cache("world", at(1)).expect("poses");
        let pose = poses.values().next().expect("one pose");
        assert_eq!(pose.translation, Vec3::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn frame_transforms_skip_robot_links() {
        let transforms = Arc::new(TransformBuffer::new());
        transforms.set_static_transform("base_link", "hand", Pose::identity());
        transforms.set_static_transform("base_link", "camera", Pose::from_translation(0.0, 0.0, 1.0));
        let monitor = SceneMonitor::builder()
            .model(model())
            .transform_source(transforms)
            .build()
            .expect("monitor");
        let seen = recording_observer(&monitor);
        monitor.refresh_frame_transforms();
        monitor.refresh_frame_transforms();
        let scene = monitor.scene_snapshot();
        assert_eq!(scene.fixed_transforms.len(), 1);
        assert!(scene.fixed_transforms.contains_key("camera"));
        assert_eq!(*seen.lock(), vec![ChangeCategory::TRANSFORMS]);
    }

    #[test]
    fn state_refresh_is_throttled() {
        let tracker = StateTracker::new(model());
        let monitor = SceneMonitor::builder()
            .model(model())
            .tracker(tracker.clone())
            .build()
            .expect("monitor");
        monitor.set_state_update_frequency(1.0).expect("rate");
        let refreshes = Arc::new(AtomicUsize::new(0));
        let r = refreshes.clone();
        monitor.add_update_observer(Arc::new(move |c| {
            if c == ChangeCategory::STATE {
                r.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tracker
            .ingest(&JointStateMsg::from_positions(at(1), [("wrist", 0.1)]))
            .expect("ingest");
        monitor.refresh_state_from_tracker();
        tracker
            .ingest(&JointStateMsg::from_positions(at(2), [("wrist", 0.2)]))
            .expect("ingest");
        monitor.refresh_state_from_tracker();
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert!(monitor.has_pending_state_update());
        assert_eq!(monitor.scene_snapshot().robot_state.position("wrist"), Some(0.1));

        // Dropping the throttle flushes the pending refresh.
        monitor.set_state_update_frequency(0.0).expect("rate");
        assert!(!monitor.has_pending_state_update());
        assert_eq!(refreshes.load(Ordering::SeqCst), 2);
        assert_eq!(monitor.scene_snapshot().robot_state.position("wrist"), Some(0.2));
        assert_eq!(monitor.last_robot_motion_time(), at(2));
    }

    #[test]
    fn invalid_rates_are_rejected() {
        let monitor = monitor();
        assert_eq!(
            monitor.set_state_update_frequency(-1.0),
            Err(VigilError::InvalidRate(-1.0))
        );
        assert!(monitor.set_publishing_frequency(0.0).is_err());
        assert!(monitor.set_publishing_frequency(5.0).is_ok());
        assert_eq!(monitor.publishing_frequency(), 5.0);
    }

    #[test]
    fn vanishing_state_rate_clamps_the_interval() {
        let monitor = monitor();
        monitor.set_state_update_frequency(1e-30).expect("rate");
        assert_eq!(monitor.state_update_interval(), MAX_INTERVAL);
    }

    #[test]
    fn observers_may_read_the_scene() {
        let monitor = monitor();
        let reader = monitor.clone();
        let names = Arc::new(Mutex::new(Vec::new()));
        let n = names.clone();
        monitor.add_update_observer(Arc::new(move |_| {
            n.lock().push(reader.lock_read().current().name.clone());
        }));
        monitor.apply_collision_object_edit(&cube("crate", "base_link"));
        assert_eq!(names.lock().len(), 1);
    }

    #[tokio::test]
    async fn wait_without_tracker_follows_scene_messages() {
        let monitor = monitor();
        assert!(!monitor.wait_for_current_robot_state(Stamp::UNIX_EPOCH, Duration::from_millis(10)).await);
        assert!(!monitor.wait_for_current_robot_state(at(5), Duration::from_millis(10)).await);
        let mut msg = SceneMsg {
            is_diff: true,
            ..SceneMsg::default()
        };
        msg.robot_state.joint_state.stamp = at(5);
        monitor.apply_external_scene_message(&msg);
        assert!(monitor.wait_for_current_robot_state(at(5), Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn wait_with_tracker_flushes_pending_refresh() {
        let tracker = StateTracker::new(model());
        let monitor = SceneMonitor::builder()
            .model(model())
            .tracker(tracker.clone())
            .build()
            .expect("monitor");
        monitor.set_state_update_frequency(0.5).expect("rate");
        tracker
            .ingest(&JointStateMsg::from_positions(at(1), [("wrist", 0.1)]))
            .expect("ingest");
        monitor.refresh_state_from_tracker();
        tracker
            .ingest(&JointStateMsg::from_positions(at(2), [("wrist", 0.3)]))
            .expect("ingest");
        monitor.refresh_state_from_tracker();
        assert!(monitor.has_pending_state_update());

        assert!(monitor.wait_for_current_robot_state(at(2), Duration::from_millis(50)).await);
        assert!(!monitor.has_pending_state_update());
        assert_eq!(monitor.scene_snapshot().robot_state.position("wrist"), Some(0.3));
    }

    #[tokio::test]
    async fn request_scene_state_seeds_the_scene() {
        let monitor = monitor();
        let mut seed = monitor.scene_msg();
        seed.name = "seeded".into();
        seed.world.collision_objects.push(cube("crate", "base_link"));
        let service = StaticSceneService::new(topics::GET_PLANNING_SCENE, seed);
        assert!(monitor.request_scene_state(&service).await);
        assert_eq!(monitor.scene_name(), "seeded");

        let unavailable = StaticSceneService::unavailable(topics::GET_PLANNING_SCENE);
        assert!(!monitor.request_scene_state(&unavailable).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn republishing_sends_full_scene_then_diffs() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(topics::MONITORED_PLANNING_SCENE);
        let monitor = SceneMonitor::builder()
            .model(model())
            .bus(bus)
            .build()
            .expect("monitor");
        monitor
            .start_republishing(ChangeCategory::all(), 50.0)
            .expect("start");
        assert!(monitor.is_monitoring_diffs());

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("first message")
            .expect("event");
        let EventPayload::Scene(first) = first.payload else {
            panic!("expected a scene");
        };
        assert!(!first.is_diff);

        monitor.apply_collision_object_edit(&cube("crate", "base_link"));
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("second message")
            .expect("event");
        let EventPayload::Scene(second) = second.payload else {
            panic!("expected a scene");
        };
        assert!(second.is_diff);
        assert_eq!(second.world.collision_objects.len(), 1);
        assert!(!monitor.lock_read().has_diffs());

        monitor.stop_republishing();
        assert!(!monitor.is_publishing());
    }

    #[tokio::test]
    async fn stopping_flushes_dirty_changes() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(topics::MONITORED_PLANNING_SCENE);
        let monitor = SceneMonitor::builder()
            .model(model())
            .bus(bus)
            .build()
            .expect("monitor");
        monitor
            .start_republishing(ChangeCategory::GEOMETRY, 1.0)
            .expect("start");
        monitor.apply_collision_object_edit(&cube("crate", "base_link"));
        monitor.stop_republishing();
        assert!(!monitor.is_monitoring_diffs());
        assert!(monitor.scene_snapshot().world.contains("crate"));

        let mut diffs = 0;
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
            if let EventPayload::Scene(msg) = event.payload
                && msg.is_diff
            {
                diffs += 1;
                assert!(msg.world.collision_objects.iter().any(|o| o.id == "crate"));
            }
        }
        assert_eq!(diffs, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restarting_the_publisher_updates_its_settings() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(topics::MONITORED_PLANNING_SCENE);
        let monitor = SceneMonitor::builder()
            .model(model())
            .bus(bus)
            .build()
            .expect("monitor");
        monitor
            .start_republishing(ChangeCategory::STATE, 50.0)
            .expect("start");
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("first message")
            .expect("event");
        assert!(matches!(first.payload, EventPayload::Scene(ref msg) if !msg.is_diff));

        monitor
            .start_republishing(ChangeCategory::GEOMETRY, 100.0)
            .expect("restart");
        assert!(monitor.is_publishing());
        assert_eq!(monitor.publishing_frequency(), 100.0);

        monitor.apply_collision_object_edit(&cube("crate", "base_link"));
        let diff = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("geometry published")
            .expect("event");
        let EventPayload::Scene(diff) = diff.payload else {
            panic!("expected a scene");
        };
        assert!(diff.is_diff);
        assert_eq!(diff.world.collision_objects.len(), 1);
        monitor.stop_republishing();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn feeds_route_bus_messages() {
        let bus = EventBus::default();
        let monitor = SceneMonitor::builder()
            .model(model())
            .bus(bus.clone())
            .build()
            .expect("monitor");
        monitor.start_world_geometry_monitor(topics::COLLISION_OBJECT, topics::PLANNING_SCENE_WORLD, false);
        monitor.start_scene_monitor(topics::PLANNING_SCENE);
        monitor.start_state_monitor(topics::JOINT_STATES, topics::ATTACHED_COLLISION_OBJECT);
        let topics_now = monitor.monitored_topics();
        assert_eq!(topics_now.len(), 5);
        assert_eq!(topics_now[0], topics::JOINT_STATES);

        bus.publish_to(
            topics::COLLISION_OBJECT,
            Event::new("test", EventPayload::CollisionObject(cube("crate", "base_link"))),
        )
        .expect("publish");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !monitor.scene_snapshot().world.contains("crate") {
            assert!(tokio::time::Instant::now() < deadline, "edit never applied");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        monitor.stop_world_geometry_monitor();
        monitor.stop_scene_monitor();
        monitor.stop_state_monitor();
        assert!(monitor.monitored_topics().is_empty());
    }
}

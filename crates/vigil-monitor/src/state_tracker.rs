//! Joint state tracking.
//!
//! [`StateTracker`] keeps one authoritative [`RobotState`] fed from a
//! joint-state topic, remembers when each joint was last heard from, and
//! answers completeness and freshness queries.  Multi-DOF joints (planar,
//! floating) are not carried by joint-state messages; they are refreshed
//! from a [`TransformSource`] instead.
//!
//! Ordering within one ingested message: every joint is merged, then the
//! update observers run, then tasks blocked in
//! [`wait_for_current_state`][StateTracker::wait_for_current_state] are woken.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Span, debug, info, info_span, warn};
use vigil_middleware::EventBus;
use vigil_perception::TransformSource;
use vigil_scene::{RobotModel, RobotState};
use vigil_types::{EventPayload, JointStateMsg, STATIC_STAMP, Stamp, VigilError};

/// Called with each joint-state message that changed a position.  Multi-DOF
/// refreshes pass an empty message.
pub type JointStateObserver = Arc<dyn Fn(&JointStateMsg) + Send + Sync>;

/// Smallest change of a multi-DOF joint that counts as motion.
const MULTI_DOF_MOTION_THRESHOLD: f64 = 1e-5;

/// How often the transform source is checked for new data.
const TRANSFORM_POLL_PERIOD: Duration = Duration::from_millis(20);

/// Upper bound on the completeness polling step.
const COMPLETE_STATE_POLL_STEP: Duration = Duration::from_millis(50);

/// A copy of the tracked state and the stamp of the latest update.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub state: RobotState,
    pub stamp: Option<Stamp>,
}

// ────────────────────────────────────────────────────────────────────────────
// Builder
// ────────────────────────────────────────────────────────────────────────────

pub struct StateTrackerBuilder {
    model: Arc<RobotModel>,
    transforms: Option<Arc<dyn TransformSource>>,
    copy_dynamics: bool,
    bounds_tolerance: f64,
    span: Option<Span>,
}

impl StateTrackerBuilder {
    /// Source of multi-DOF joint poses.
    pub fn transform_source(mut self, source: Arc<dyn TransformSource>) -> Self {
        self.transforms = Some(source);
        self
    }

    pub fn copy_dynamics(mut self, copy: bool) -> Self {
        self.copy_dynamics = copy;
        self
    }

    /// Positions at most this far outside a bound are clamped onto it.
    pub fn bounds_tolerance(mut self, tolerance: f64) -> Self {
        self.bounds_tolerance = tolerance;
        self
    }

    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> StateTracker {
        let (latest, _) = watch::channel(None);
        StateTracker {
            inner: Arc::new(Inner {
                state: Mutex::new(Tracked {
                    robot_state: RobotState::new(self.model.clone()),
                    joint_time: BTreeMap::new(),
                    state_time: None,
                    lookup_failures: BTreeSet::new(),
                }),
                model: self.model,
                transforms: self.transforms,
                copy_dynamics: self.copy_dynamics,
                bounds_tolerance: self.bounds_tolerance,
                span: self.span.unwrap_or_else(|| info_span!("state_tracker")),
                observers: RwLock::new(Vec::new()),
                latest,
                feed: Mutex::new(Feed::default()),
            }),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// StateTracker
// ────────────────────────────────────────────────────────────────────────────

struct Tracked {
    robot_state: RobotState,
    /// Last time each joint was heard from.
    joint_time: BTreeMap<String, Stamp>,
    /// Stamp of the latest joint-state message.
    state_time: Option<Stamp>,
    /// Multi-DOF joints whose last lookup failed (warned once).
    lookup_failures: BTreeSet<String>,
}

#[derive(Default)]
struct Feed {
    topic: Option<String>,
    started_at: Option<Stamp>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    model: Arc<RobotModel>,
    transforms: Option<Arc<dyn TransformSource>>,
    copy_dynamics: bool,
    bounds_tolerance: f64,
    span: Span,
    state: Mutex<Tracked>,
    observers: RwLock<Vec<JointStateObserver>>,
    /// Newest ingested message stamp, watched by waiters.
    latest: watch::Sender<Option<Stamp>>,
    feed: Mutex<Feed>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.feed.get_mut().tasks.drain(..) {
            task.abort();
        }
    }
}

/// Shared handle to the tracked joint state.
#[derive(Clone)]
pub struct StateTracker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTracker")
            .field("model", &self.inner.model.name())
            .field("feed", &self.monitored_feed())
            .finish_non_exhaustive()
    }
}

impl StateTracker {
    /// A tracker with default settings and no transform source.
    pub fn new(model: Arc<RobotModel>) -> Self {
        Self::builder(model).build()
    }

    pub fn builder(model: Arc<RobotModel>) -> StateTrackerBuilder {
        StateTrackerBuilder {
            model,
            transforms: None,
            copy_dynamics: true,
            bounds_tolerance: f64::EPSILON,
            span: None,
        }
    }

    pub fn model(&self) -> &Arc<RobotModel> {
        &self.inner.model
    }

    // ── Ingest ──────────────────────────────────────────────────────────────

    /// Merge one joint-state message.
    ///
    /// Returns whether any position changed.  A message whose name and
    /// position arrays differ in length is rejected without touching the
    /// state.
    pub fn ingest(&self, msg: &JointStateMsg) -> Result<bool, VigilError> {
        let inner = &self.inner;
        if msg.name.len() != msg.position.len() {
            warn!(
                parent: &inner.span,
                names = msg.name.len(),
                positions = msg.position.len(),
                "joint state rejected: name and position counts differ"
            );
            return Err(VigilError::MalformedJointState {
                names: msg.name.len(),
                positions: msg.position.len(),
            });
        }

        let copy_velocity = inner.copy_dynamics && msg.velocity.len() == msg.name.len();
        let copy_effort = copy_velocity && msg.effort.len() == msg.name.len();

        let mut update = false;
        {
            let mut tracked = inner.state.lock();
            for (i, name) in msg.name.iter().enumerate() {
                let Some(joint) = inner.model.joint(name) else {
                    continue;
                };
                if joint.variable_count() != 1 {
                    continue;
                }
                tracked.joint_time.insert(name.clone(), msg.stamp);

                let mut position = [msg.position[i]];
                joint.clamp_near_bounds(&mut position, inner.bounds_tolerance);
                if tracked.robot_state.position(name) != Some(position[0]) {
                    tracked.robot_state.set_positions(name, &position);
                    update = true;
                }
                if copy_velocity {
                    tracked.robot_state.set_velocities(name, &[msg.velocity[i]]);
                }
                if copy_effort {
                    tracked.robot_state.set_efforts(name, &[msg.effort[i]]);
                }
            }
            if tracked.state_time.is_none_or(|t| msg.stamp > t) {
                tracked.state_time = Some(msg.stamp);
            }
        }

        if update {
            self.notify_observers(msg);
        }
        inner.latest.send_modify(|latest| {
            if latest.is_none_or(|t| msg.stamp > t) {
                *latest = Some(msg.stamp);
            }
        });
        debug!(parent: &inner.span, joints = msg.name.len(), update, "joint state ingested");
        Ok(update)
    }

    fn notify_observers(&self, msg: &JointStateMsg) {
        let observers = self.inner.observers.read().clone();
        for observer in &observers {
            observer(msg);
        }
    }

    // ── Multi-DOF joints ────────────────────────────────────────────────────

    /// Refresh planar and floating joints from the transform source.
    ///
    /// A joint whose lookup fails keeps its value.  A result older than the
    /// last applied one is ignored unless it is static.  Returns whether any
    /// joint moved.
    pub fn update_multi_dof_joints(&self) -> bool {
        let inner = &self.inner;
        let Some(transforms) = &inner.transforms else {
            return false;
        };

        let mut moved = false;
        let mut newest: Option<Stamp> = None;
        {
            let mut tracked = inner.state.lock();
            for joint in inner.model.multi_dof_joints() {
                let lookup = transforms.lookup(&joint.parent_link, &joint.child_link, None);
                let t = match lookup {
                    Ok(t) => {
                        tracked.lookup_failures.remove(&joint.name);
                        t
                    }
                    Err(e) => {
                        if tracked.lookup_failures.insert(joint.name.clone()) {
                            warn!(parent: &inner.span, joint = %joint.name, error = %e, "multi-DOF joint lookup failed");
                        }
                        continue;
                    }
                };

                let newer = tracked
                    .joint_time
                    .get(&joint.name)
                    .is_none_or(|last| t.stamp > *last);
                if !newer && t.stamp != STATIC_STAMP {
                    continue;
                }
                tracked.joint_time.insert(joint.name.clone(), t.stamp);

                let motion = joint.origin.inverse().compose(t.transform);
                let Some(values) = joint.values_from_pose(&motion) else {
                    continue;
                };
                let current = tracked.robot_state.positions(&joint.name).unwrap_or_default();
                if joint.distance(current, &values) > MULTI_DOF_MOTION_THRESHOLD {
                    tracked.robot_state.set_positions(&joint.name, &values);
                    moved = true;
                    if t.stamp != STATIC_STAMP && newest.is_none_or(|n| t.stamp > n) {
                        newest = Some(t.stamp);
                    }
                }
            }
        }

        if moved {
            self.notify_observers(&JointStateMsg::default());
        }
        if let Some(stamp) = newest {
            inner.latest.send_if_modified(|latest| {
                let advance = latest.is_none_or(|t| stamp > t);
                if advance {
                    *latest = Some(stamp);
                }
                advance
            });
        }
        moved
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub fn get_snapshot(&self) -> Snapshot {
        let tracked = self.inner.state.lock();
        Snapshot {
            state: tracked.robot_state.clone(),
            stamp: tracked.state_time,
        }
    }

    /// Copy of the tracked robot state.
    pub fn current_state(&self) -> RobotState {
        self.inner.state.lock().robot_state.clone()
    }

    /// Every variable value, keyed by variable name.
    pub fn current_state_values(&self) -> BTreeMap<String, f64> {
        self.inner.state.lock().robot_state.variable_values()
    }

    /// Stamp of the latest joint-state message.
    pub fn current_state_time(&self) -> Option<Stamp> {
        self.inner.state.lock().state_time
    }

    /// Copy joint values (not attached bodies) into `target`.
    pub fn set_to_current_state(&self, target: &mut RobotState) {
        let tracked = self.inner.state.lock();
        for joint in self.inner.model.joints() {
            if let Some(value) = tracked.robot_state.joint_value(&joint.name) {
                target.set_joint_value(&joint.name, value);
            }
        }
    }

    /// Last time `joint` was heard from.
    pub fn joint_time(&self, joint: &str) -> Option<Stamp> {
        self.inner.state.lock().joint_time.get(joint).copied()
    }

    /// True when every active, non-passive joint has been heard from.
    pub fn have_complete_state(&self) -> bool {
        self.missing_joints().is_empty()
    }

    /// Required joints never heard from.
    pub fn missing_joints(&self) -> Vec<String> {
        let tracked = self.inner.state.lock();
        self.inner
            .model
            .required_joints()
            .filter(|j| !tracked.joint_time.contains_key(&j.name))
            .map(|j| j.name.clone())
            .collect()
    }

    /// True when every required joint has been heard from within `max_age`.
    pub fn have_complete_state_within(&self, max_age: Duration) -> bool {
        self.stale_joints(max_age).is_empty()
    }

    /// Required joints never heard from or last heard from more than
    /// `max_age` ago.
    pub fn stale_joints(&self, max_age: Duration) -> Vec<String> {
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
        let oldest = Utc::now().checked_sub_signed(max_age).unwrap_or(Stamp::MIN_UTC);
        let tracked = self.inner.state.lock();
        self.inner
            .model
            .required_joints()
            .filter(|j| tracked.joint_time.get(&j.name).is_none_or(|t| *t < oldest))
            .map(|j| j.name.clone())
            .collect()
    }

    // ── Waiting ─────────────────────────────────────────────────────────────

    /// Wait until the state is complete or `timeout` elapses.  Returns the
    /// final completeness.
    pub async fn wait_for_complete_state(&self, timeout: Duration) -> bool {
        let step = COMPLETE_STATE_POLL_STEP
            .min(timeout / 10)
            .max(Duration::from_millis(1));
        let poll = async {
            while !self.have_complete_state() {
                tokio::time::sleep(step).await;
            }
        };
        let _ = tokio::time::timeout(timeout, poll).await;
        self.have_complete_state()
    }

    /// Like [`wait_for_complete_state`][Self::wait_for_complete_state], but
    /// also succeeds when the joints of `group` are all known.
    pub async fn wait_for_complete_state_for_group(&self, group: &str, timeout: Duration) -> bool {
        if self.wait_for_complete_state(timeout).await {
            return true;
        }
        let Some(group) = self.inner.model.group(group) else {
            return false;
        };
        let missing = self.missing_joints();
        !group.joints.iter().any(|j| missing.contains(j))
    }

    /// Wait until a message stamped at or after `target` has been ingested.
    pub async fn wait_for_current_state(&self, target: Stamp, timeout: Duration) -> bool {
        let mut rx = self.inner.latest.subscribe();
        let reached = tokio::time::timeout(
            timeout,
            rx.wait_for(|latest| latest.is_some_and(|t| t >= target)),
        )
        .await;
        matches!(reached, Ok(Ok(_)))
    }

    // ── Observers ───────────────────────────────────────────────────────────

    pub fn add_update_observer(&self, observer: JointStateObserver) {
        self.inner.observers.write().push(observer);
    }

    pub fn clear_update_observers(&self) {
        self.inner.observers.write().clear();
    }

    // ── Feed lifecycle ──────────────────────────────────────────────────────

    /// Start consuming joint states from `topic` on `bus`.
    ///
    /// No-op when already monitoring.  With a transform source, multi-DOF
    /// joints are refreshed whenever the source changes.  Must be called
    /// from within a Tokio runtime.
    pub fn start_monitoring(&self, bus: &EventBus, topic: &str) {
        let inner = &self.inner;
        if topic.is_empty() {
            warn!(parent: &inner.span, "joint state topic is empty, not monitoring");
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(parent: &inner.span, "no async runtime, not monitoring");
            return;
        };

        let mut feed = inner.feed.lock();
        if feed.topic.is_some() {
            return;
        }

        let mut rx = bus.subscribe_to(topic);
        let weak = Arc::downgrade(inner);
        feed.tasks.push(runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                let EventPayload::JointState(msg) = event.payload else {
                    continue;
                };
                let Some(tracker) = upgrade(&weak) else {
                    break;
                };
                // Rejections are logged by `ingest`.
                let _ = tracker.ingest(&msg);
            }
        }));

        if let Some(transforms) = inner.transforms.clone()
            && inner.model.multi_dof_joints().next().is_some()
        {
            let weak = Arc::downgrade(inner);
            feed.tasks.push(runtime.spawn(async move {
                let mut seen = None;
                let mut ticker = tokio::time::interval(TRANSFORM_POLL_PERIOD);
                loop {
                    ticker.tick().await;
                    let revision = transforms.revision();
                    if seen == Some(revision) {
                        continue;
                    }
                    seen = Some(revision);
                    let Some(tracker) = upgrade(&weak) else {
                        break;
                    };
                    tracker.update_multi_dof_joints();
                }
            }));
        }

        feed.topic = Some(topic.to_string());
        feed.started_at = Some(Utc::now());
        info!(parent: &inner.span, topic, "listening to joint states");
    }

    /// Stop consuming joint states.  No-op when not monitoring.
    pub fn stop_monitoring(&self) {
        let tasks = {
            let mut feed = self.inner.feed.lock();
            if feed.topic.take().is_none() {
                return;
            }
            std::mem::take(&mut feed.tasks)
        };
        for task in tasks {
            task.abort();
        }
        info!(parent: &self.inner.span, "no longer listening to joint states");
    }

    pub fn is_active(&self) -> bool {
        self.inner.feed.lock().topic.is_some()
    }

    pub fn monitored_feed(&self) -> Option<String> {
        self.inner.feed.lock().topic.clone()
    }

    /// When the current feed subscription started.
    pub fn monitor_start_time(&self) -> Option<Stamp> {
        self.inner.feed.lock().started_at
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<StateTracker> {
    weak.upgrade().map(|inner| StateTracker { inner })
}

//! Transform resolution.
//!
//! Maintains a tree of named reference frames and the rigid-body transforms
//! (translation + quaternion rotation) that relate them.  Given any two frame
//! names the buffer composes a chain of transforms via BFS, walking edges in
//! either direction, to produce the pose of one frame in the other.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use vigil_perception::transform::{TransformBuffer, TransformSource};
//! use vigil_types::Pose;
//!
//! let tf = TransformBuffer::new();
//!
//! // base_link is 1 m forward of world origin, same orientation.
//! tf.set_transform("world", "base_link", Pose::from_translation(1.0, 0.0, 0.0), Utc::now());
//!
//! // camera is 0.5 m forward of base_link, same orientation.
//! tf.set_static_transform("base_link", "camera", Pose::from_translation(0.5, 0.0, 0.0));
//!
//! let t = tf.lookup("world", "camera", None).unwrap();
//! assert!((t.transform.translation.x - 1.5).abs() < 1e-9);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use vigil_types::{Pose, STATIC_STAMP, Stamp, StampedTransform, VigilError};

/// Poll period used by the default [`TransformSource::can_transform`].
const AVAILABILITY_POLL: Duration = Duration::from_millis(5);

// ────────────────────────────────────────────────────────────────────────────
// TransformSource
// ────────────────────────────────────────────────────────────────────────────

/// The transform-resolution interface consumed by the monitors.
///
/// # Contract
///
/// * `lookup` – pose of `source_frame` expressed in `target_frame`.  `time`
///   of `None` requests the latest available data.  The returned stamp is the
///   oldest non-static stamp along the chain, or [`STATIC_STAMP`] when every
///   link in the chain is static.
/// * `revision` – a counter that changes whenever any transform changes, so
///   pollers can skip work when nothing moved.
pub trait TransformSource: Send + Sync {
    fn lookup(
        &self,
        target_frame: &str,
        source_frame: &str,
        time: Option<Stamp>,
    ) -> Result<StampedTransform, VigilError>;

    /// Every frame the source currently knows about.
    fn frame_names(&self) -> Vec<String>;

    fn revision(&self) -> u64;

    /// Wait up to `timeout` for the transform to become available.
    fn can_transform(
        &self,
        target_frame: &str,
        source_frame: &str,
        time: Option<Stamp>,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.lookup(target_frame, source_frame, time).is_ok() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(AVAILABILITY_POLL.min(deadline - now));
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TransformBuffer
// ────────────────────────────────────────────────────────────────────────────

/// A tree of frames keeping the latest transform for every parent → child
/// edge.
///
/// Each child frame has exactly one parent; setting a transform for a child
/// under a new parent re-parents it.  The buffer is internally synchronised
/// so it can be shared as `Arc<dyn TransformSource>` while a producer keeps
/// updating it.
#[derive(Debug, Default)]
pub struct TransformBuffer {
    /// `edges[parent][child]`
    edges: RwLock<HashMap<String, HashMap<String, StampedTransform>>>,
    revision: AtomicU64,
}

impl TransformBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update the pose of `child_frame` in `parent_frame`.
    pub fn set_transform(&self, parent_frame: &str, child_frame: &str, pose: Pose, stamp: Stamp) {
        self.insert(StampedTransform {
            parent_frame: parent_frame.to_string(),
            child_frame: child_frame.to_string(),
            stamp,
            transform: pose,
        });
    }

    /// Register a transform that never changes.
    pub fn set_static_transform(&self, parent_frame: &str, child_frame: &str, pose: Pose) {
        self.set_transform(parent_frame, child_frame, pose, STATIC_STAMP);
    }

    /// Insert a fully formed stamped transform.
    pub fn insert(&self, transform: StampedTransform) {
        let mut edges = self.edges.write();
        for children in edges.values_mut() {
            children.remove(&transform.child_frame);
        }
        edges
            .entry(transform.parent_frame.clone())
            .or_default()
            .insert(transform.child_frame.clone(), transform);
        self.revision.fetch_add(1, Ordering::Release);
    }

    /// Remove every transform.
    pub fn clear(&self) {
        self.edges.write().clear();
        self.revision.fetch_add(1, Ordering::Release);
    }
}

impl TransformSource for TransformBuffer {
    fn lookup(
        &self,
        target_frame: &str,
        source_frame: &str,
        time: Option<Stamp>,
    ) -> Result<StampedTransform, VigilError> {
        let fail = |reason: String| VigilError::TransformLookup {
            target: target_frame.to_string(),
            source_frame: source_frame.to_string(),
            reason,
        };

        let edges = self.edges.read();
        let known = |frame: &str| {
            edges.contains_key(frame)
                || edges.values().any(|children| children.contains_key(frame))
        };
        if target_frame == source_frame {
            if !known(target_frame) {
                return Err(fail(format!("frame '{target_frame}' does not exist")));
            }
            return Ok(StampedTransform {
                parent_frame: target_frame.to_string(),
                child_frame: source_frame.to_string(),
                stamp: STATIC_STAMP,
                transform: Pose::identity(),
            });
        }
        for frame in [target_frame, source_frame] {
            if !known(frame) {
                return Err(fail(format!("frame '{frame}' does not exist")));
            }
        }

        // child -> (parent, edge) for walking edges backwards.
        let parents: HashMap<&str, &StampedTransform> = edges
            .values()
            .flat_map(|children| children.iter().map(|(c, t)| (c.as_str(), t)))
            .collect();

        // BFS from the target frame; each queue item carries the pose of the
        // current node in the target frame and the oldest dynamic stamp seen.
        let mut queue: VecDeque<(&str, Pose, Option<Stamp>)> = VecDeque::new();
        let mut visited: HashSet<&str> = HashSet::new();
        queue.push_back((target_frame, Pose::identity(), None));
        visited.insert(target_frame);

        let oldest = |acc: Option<Stamp>, edge: &StampedTransform| {
            if edge.stamp == STATIC_STAMP {
                acc
            } else {
                Some(acc.map_or(edge.stamp, |s| s.min(edge.stamp)))
            }
        };

        while let Some((current, accumulated, stamp)) = queue.pop_front() {
            let forward = edges
                .get(current)
                .into_iter()
                .flat_map(|children| children.iter())
                .map(|(child, edge)| (child.as_str(), edge.transform, edge));
            let backward = parents
                .get(current)
                .map(|edge| (edge.parent_frame.as_str(), edge.transform.inverse(), *edge));

            for (next, step, edge) in forward.chain(backward) {
                if !visited.insert(next) {
                    continue;
                }
                let composed = accumulated.compose(step);
                let stamp = oldest(stamp, edge);
                if next == source_frame {
                    let stamp = stamp.unwrap_or(STATIC_STAMP);
                    if let Some(requested) = time {
                        if stamp != STATIC_STAMP && stamp > requested {
                            return Err(fail(format!(
                                "requested {requested} but oldest data in chain is {stamp}"
                            )));
                        }
                    }
                    return Ok(StampedTransform {
                        parent_frame: target_frame.to_string(),
                        child_frame: source_frame.to_string(),
                        stamp,
                        transform: composed,
                    });
                }
                queue.push_back((next, composed, stamp));
            }
        }

        Err(fail("frames are not connected".to_string()))
    }

    fn frame_names(&self) -> Vec<String> {
        let edges = self.edges.read();
        let mut names: Vec<String> = edges
            .iter()
            .flat_map(|(parent, children)| {
                std::iter::once(parent.clone()).chain(children.keys().cloned())
            })
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        names.sort();
        names
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::f64::consts::FRAC_PI_2;
    use vigil_types::{Quaternion, Vec3};

    fn at(secs: i64) -> Stamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn lookup_same_frame_returns_identity() {
        let tf = TransformBuffer::new();
        tf.set_static_transform("world", "base_link", Pose::identity());
        let t = tf.lookup("world", "world", None).unwrap();
        assert!(t.transform.is_identity(1e-12));
    }

    #[test]
    fn lookup_unknown_frame_fails() {
        let tf = TransformBuffer::new();
        tf.set_static_transform("world", "base_link", Pose::identity());
        let err = tf.lookup("world", "ghost", None).unwrap_err();
        assert!(matches!(err, VigilError::TransformLookup { .. }));
    }

    #[test]
    fn lookup_composed_chain() {
        let tf = TransformBuffer::new();
        tf.set_transform("world", "base_link", Pose::from_translation(1.0, 0.0, 0.0), at(10));
        tf.set_transform("base_link", "camera", Pose::from_translation(0.5, 0.0, 0.0), at(12));

        let t = tf.lookup("world", "camera", None).unwrap();
        assert!((t.transform.translation.x - 1.5).abs() < 1e-9);
        assert_eq!(t.stamp, at(10), "stamp is the oldest in the chain");
    }

    #[test]
    fn lookup_walks_edges_backwards() {
        let tf = TransformBuffer::new();
        tf.set_static_transform("world", "base_link", Pose::from_translation(2.0, 0.0, 0.0));

        let t = tf.lookup("base_link", "world", None).unwrap();
        assert!((t.transform.translation.x + 2.0).abs() < 1e-9);
        assert_eq!(t.stamp, STATIC_STAMP);
    }

    #[test]
    fn lookup_between_siblings() {
        let tf = TransformBuffer::new();
        tf.set_static_transform("base_link", "left", Pose::from_translation(0.0, 1.0, 0.0));
        tf.set_static_transform("base_link", "right", Pose::from_translation(0.0, -1.0, 0.0));

        let t = tf.lookup("left", "right", None).unwrap();
        assert!((t.transform.translation.y + 2.0).abs() < 1e-9);
    }

    #[test]
    fn lookup_respects_rotation_in_chain() {
        let tf = TransformBuffer::new();
        tf.set_static_transform(
            "world",
            "base_link",
            Pose::new(Vec3::zero(), Quaternion::from_yaw(FRAC_PI_2)),
        );
        tf.set_static_transform("base_link", "camera", Pose::from_translation(1.0, 0.0, 0.0));

        let t = tf.lookup("world", "camera", None).unwrap();
        assert!(t.transform.translation.x.abs() < 1e-9);
        assert!((t.transform.translation.y - 1.0).abs() < 1e-9);
    }

    #[test]
    fn lookup_rejects_data_newer_than_requested() {
        let tf = TransformBuffer::new();
        tf.set_transform("world", "base_link", Pose::identity(), at(50));
        assert!(tf.lookup("world", "base_link", Some(at(40))).is_err());
        assert!(tf.lookup("world", "base_link", Some(at(60))).is_ok());
    }

    #[test]
    fn reparenting_replaces_old_edge() {
        let tf = TransformBuffer::new();
        tf.set_static_transform("world", "tool", Pose::from_translation(1.0, 0.0, 0.0));
        tf.set_static_transform("base_link", "tool", Pose::from_translation(0.2, 0.0, 0.0));
        tf.set_static_transform("world", "base_link", Pose::from_translation(5.0, 0.0, 0.0));

        let t = tf.lookup("world", "tool", None).unwrap();
        assert!((t.transform.translation.x - 5.2).abs() < 1e-9);
    }

    #[test]
    fn revision_advances_on_every_write() {
        let tf = TransformBuffer::new();
        let r0 = tf.revision();
        tf.set_static_transform("world", "base_link", Pose::identity());
        assert!(tf.revision() > r0);
        assert_eq!(tf.frame_names(), vec!["base_link".to_string(), "world".to_string()]);
    }

    #[test]
    fn can_transform_times_out() {
        let tf = TransformBuffer::new();
        assert!(!tf.can_transform("world", "camera", None, Duration::from_millis(10)));
        tf.set_static_transform("world", "camera", Pose::identity());
        assert!(tf.can_transform("world", "camera", None, Duration::from_millis(10)));
    }
}

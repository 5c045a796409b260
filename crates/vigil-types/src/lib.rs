//! `vigil-types` – shared vocabulary of the scene-monitoring workspace.
//!
//! # Modules
//!
//! - [`geometry`] – vectors, quaternions, poses, stamped transforms and
//!   collision shapes.
//! - [`msg`] – joint-state, scene, world and object-edit messages.
//!
//! The crate root holds the cross-cutting types: [`ChangeCategory`], the
//! [`Event`] envelope routed over the bus and the global [`VigilError`].

pub mod geometry;
pub mod msg;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use geometry::{Pose, Quaternion, STATIC_STAMP, Shape, StampedTransform, Vec3};
pub use msg::{
    AcmEntry, AttachedCollisionObjectMsg, CollisionObjectMsg, JointStateMsg, LinkPadding,
    LinkScale, MultiDofJointValue, ObjectOperation, OctomapMsg, RobotStateMsg, SceneMsg, WorldMsg,
};

/// Timestamps carried by messages and kept per joint.
pub type Stamp = DateTime<Utc>;

bitflags::bitflags! {
    /// What kind of content a scene mutation affected.
    ///
    /// `FULL_SCENE` includes every other category plus its own bit, so a
    /// full-scene change intersects any publication mask while a union of
    /// the three partial categories is still distinguishable from it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ChangeCategory: u8 {
        /// Robot joint state changed.
        const STATE = 0b0001;
        /// Fixed frame transforms changed.
        const TRANSFORMS = 0b0010;
        /// World or attached geometry changed.
        const GEOMETRY = 0b0100;
        /// The scene was replaced wholesale.
        const FULL_SCENE = 0b1111;
    }
}

impl ChangeCategory {
    /// True when the accumulated changes require a full-scene publication.
    pub fn is_full_scene(self) -> bool {
        self.contains(Self::FULL_SCENE)
    }
}

/// Envelope for everything routed over the in-process bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"vigil-monitor::publisher"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap `payload` in a fresh envelope stamped now.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    JointState(JointStateMsg),
    Scene(Box<SceneMsg>),
    World(WorldMsg),
    CollisionObject(CollisionObjectMsg),
    AttachedCollisionObject(AttachedCollisionObjectMsg),
}

/// Global error type for the workspace.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VigilError {
    #[error("Malformed joint state: {names} names but {positions} positions")]
    MalformedJointState { names: usize, positions: usize },

    #[error("Transform lookup {target} <- {source_frame} failed: {reason}")]
    TransformLookup {
        target: String,
        source_frame: String,
        reason: String,
    },

    #[error("Robot model error: {0}")]
    RobotModel(String),

    #[error("Scene construction failed: {0}")]
    Construction(String),

    #[error("Unknown frame '{0}'")]
    UnknownFrame(String),

    #[error("Invalid object edit: {0}")]
    InvalidObject(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid rate {0} Hz")]
    InvalidRate(f64),

    #[error("Service error: {0}")]
    Service(String),
}

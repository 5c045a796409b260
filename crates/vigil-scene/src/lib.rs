//! `vigil-scene` – the data a planning scene is made of.
//!
//! This crate owns no locks and runs no tasks; it describes the robot and its
//! surroundings and knows how to apply scene messages to them.  Concurrency
//! is the monitor's job.
//!
//! # Modules
//!
//! - [`model`] – [`RobotModel`][model::RobotModel]: immutable kinematic
//!   description (links, joints, bounds, groups) and its builder.
//! - [`robot_state`] – [`RobotState`][robot_state::RobotState]: joint values
//!   and attached bodies for one robot model.
//! - [`world`] – [`World`][world::World]: collision objects keyed by id.
//! - [`collision`] – [`AllowedCollisionMatrix`][collision::AllowedCollisionMatrix]
//!   and [`CollisionPadding`][collision::CollisionPadding].
//! - [`scene`] – [`SceneData`][scene::SceneData] and
//!   [`SceneChain`][scene::SceneChain], the owned `{root, diff overlay}` pair
//!   with change recording and object observers.

pub mod collision;
pub mod model;
pub mod robot_state;
pub mod scene;
pub mod world;

pub use collision::{AllowedCollisionMatrix, CollisionPadding};
pub use model::{JointGroup, JointKind, JointModel, LinkModel, RobotModel, RobotModelBuilder, VariableBounds};
pub use robot_state::{AttachedBody, JointValue, RobotState};
pub use scene::{
    ObserverState, SceneChain, SceneData, SceneObjectEvent, SceneObjectObserver, OCTOMAP_ID,
};
pub use world::{CollisionObject, World};

//! `vigil-middleware` – transport collaborators.
//!
//! Routes scene, geometry and joint-state traffic between producers and the
//! monitor without caring about the data's meaning.
//!
//! # Modules
//!
//! - [`bus`] – headless, named-topic publish/subscribe event bus built on
//!   Tokio broadcast channels.
//! - [`service`] – [`SceneService`][service::SceneService]: the one-shot
//!   "fetch the full scene" request/response exchange used at startup.

pub mod bus;
pub mod service;

pub use bus::{EventBus, TopicReceiver, topics};
pub use service::{SceneService, StaticSceneService};

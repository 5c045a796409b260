//! One-shot "fetch the full scene" exchange.
//!
//! A monitor that starts after the authoritative scene owner has been running
//! for a while seeds itself once through a [`SceneService`] before it begins
//! consuming incremental updates.

use async_trait::async_trait;
use parking_lot::RwLock;
use vigil_types::{SceneMsg, VigilError};

/// Anything that can answer a full-scene request.
///
/// # Contract
///
/// * `get_planning_scene` – returns a complete (`is_diff == false`) scene, or
///   [`VigilError::Service`] when the remote end is unavailable.
/// * `name` – the service identifier used in logs.
#[async_trait]
pub trait SceneService: Send + Sync {
    async fn get_planning_scene(&self) -> Result<SceneMsg, VigilError>;

    fn name(&self) -> &str;
}

/// A service answering with a scene held in memory.
///
/// Useful for seeding a monitor from a scene loaded off disk, and for tests.
pub struct StaticSceneService {
    name: String,
    scene: RwLock<Option<SceneMsg>>,
}

impl StaticSceneService {
    pub fn new(name: impl Into<String>, scene: SceneMsg) -> Self {
        Self {
            name: name.into(),
            scene: RwLock::new(Some(scene)),
        }
    }

    /// A service that fails every request.
    pub fn unavailable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scene: RwLock::new(None),
        }
    }

    /// Replace the scene served to later requests.
    pub fn set_scene(&self, scene: SceneMsg) {
        *self.scene.write() = Some(scene);
    }
}

#[async_trait]
impl SceneService for StaticSceneService {
    async fn get_planning_scene(&self) -> Result<SceneMsg, VigilError> {
        let scene = self
            .scene
            .read()
            .clone()
            .ok_or_else(|| VigilError::Service(format!("'{}' has no scene to serve", self.name)))?;
        Ok(SceneMsg {
            is_diff: false,
            ..scene
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

//! `vigil-perception` – spatial collaborators of the scene monitor.
//!
//! Neither subsystem here is owned by the monitor; the monitor only reads
//! from them and coordinates with them.
//!
//! # Modules
//!
//! - [`transform`] – [`TransformSource`][transform::TransformSource]: the
//!   transform-resolution interface, and
//!   [`TransformBuffer`][transform::TransformBuffer], an in-memory frame tree
//!   implementing it.
//! - [`octree`] – [`Octree`][octree::Octree]: voxel index partitioning 3-D
//!   space into occupied cells.
//! - [`occupancy`] – [`OccupancyMonitor`][occupancy::OccupancyMonitor]: the
//!   occupancy-map interface (shape exclusion, update notification, shared
//!   tree lock) and [`OccupancyMapMonitor`][occupancy::OccupancyMapMonitor],
//!   which filters sensor points through excluded shapes.

pub mod occupancy;
pub mod octree;
pub mod transform;

pub use occupancy::{
    OccupancyMapMonitor, OccupancyMonitor, OccupancyTree, ShapeHandle, TransformCacheProvider,
    UpdateCallback,
};
pub use octree::{Aabb, Octree};
pub use transform::{TransformBuffer, TransformSource};

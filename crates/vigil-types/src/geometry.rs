//! Rigid-body geometry primitives shared by every layer.
//!
//! Poses follow the usual robotics convention: a [`Pose`] of frame B
//! expressed in frame A converts a point given in B into A by rotating it
//! with `rotation` and then adding `translation`.

use serde::{Deserialize, Serialize};

use crate::Stamp;

// ────────────────────────────────────────────────────────────────────────────
// Vec3 / Quaternion
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D vector or point.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn scale(self, k: f64) -> Self {
        Self::new(self.x * k, self.y * k, self.z * k)
    }

    pub fn norm(self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn distance(self, other: Self) -> f64 {
        self.sub(other).norm()
    }
}

/// A unit quaternion (w, x, y, z convention).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::identity()
    }
}

impl Quaternion {
    /// The caller is responsible for providing a unit quaternion.
    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    /// Rotation of `yaw` radians around +Z.
    pub fn from_yaw(yaw: f64) -> Self {
        let half = yaw * 0.5;
        Self::new(half.cos(), 0.0, 0.0, half.sin())
    }

    /// Heading around +Z extracted from this rotation.
    pub fn yaw(self) -> f64 {
        let siny = 2.0 * (self.w * self.z + self.x * self.y);
        let cosy = 1.0 - 2.0 * (self.y * self.y + self.z * self.z);
        siny.atan2(cosy)
    }

    /// Hamilton product: `self` followed by `rhs`.
    pub fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        )
    }

    /// Conjugate (== inverse for a unit quaternion).
    pub fn conjugate(self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }

    /// Rotate a vector: p' = q * p * q*.
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let p = Self::new(0.0, v.x, v.y, v.z);
        let r = self.mul(p).mul(self.conjugate());
        Vec3::new(r.x, r.y, r.z)
    }

    /// Smallest angle (radians) between the two rotations.
    pub fn angle_to(self, other: Self) -> f64 {
        let dot = (self.w * other.w + self.x * other.x + self.y * other.y + self.z * other.z).abs();
        2.0 * dot.min(1.0).acos()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pose
// ────────────────────────────────────────────────────────────────────────────

/// A rigid-body transform: rotation followed by translation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub translation: Vec3,
    pub rotation: Quaternion,
}

impl Pose {
    pub fn new(translation: Vec3, rotation: Quaternion) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Vec3::zero(), Quaternion::identity())
    }

    pub fn from_translation(x: f64, y: f64, z: f64) -> Self {
        Self::new(Vec3::new(x, y, z), Quaternion::identity())
    }

    /// True when this transform is the identity within `tolerance`.
    pub fn is_identity(&self, tolerance: f64) -> bool {
        self.translation.norm() <= tolerance
            && self.rotation.angle_to(Quaternion::identity()) <= tolerance
    }

    /// If `self` = T_A_B and `other` = T_B_C, the result is T_A_C.
    pub fn compose(self, other: Self) -> Self {
        let translation = self.translation.add(self.rotation.rotate(other.translation));
        Self::new(translation, self.rotation.mul(other.rotation))
    }

    /// T_B_A from T_A_B.
    pub fn inverse(self) -> Self {
        let inv_rot = self.rotation.conjugate();
        Self::new(inv_rot.rotate(self.translation.scale(-1.0)), inv_rot)
    }

    pub fn transform_point(&self, p: Vec3) -> Vec3 {
        self.translation.add(self.rotation.rotate(p))
    }
}

/// A [`Pose`] of `child_frame` expressed in `parent_frame`, valid at `stamp`.
///
/// A stamp equal to [`STATIC_STAMP`] marks a static transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedTransform {
    pub parent_frame: String,
    pub child_frame: String,
    pub stamp: Stamp,
    pub transform: Pose,
}

/// Timestamp carried by static transforms.
pub const STATIC_STAMP: Stamp = Stamp::UNIX_EPOCH;

// ────────────────────────────────────────────────────────────────────────────
// Shapes
// ────────────────────────────────────────────────────────────────────────────

/// Collision geometry of a link, attached body or world object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Shape {
    Box { size: Vec3 },
    Sphere { radius: f64 },
    Cylinder { radius: f64, length: f64 },
    Mesh { vertices: Vec<Vec3>, triangles: Vec<[u32; 3]> },
    /// Infinite plane `a*x + b*y + c*z + d = 0`.
    Plane { coefficients: [f64; 4] },
    /// A reference to occupancy data; never excluded from itself.
    Octree,
}

impl Shape {
    /// Shapes the occupancy subsystem can filter sensor points against.
    pub fn is_excludable(&self) -> bool {
        !matches!(self, Shape::Plane { .. } | Shape::Octree)
    }

    /// Radius of a sphere centred at the shape origin that encloses it.
    ///
    /// Unbounded shapes report `f64::INFINITY`.
    pub fn bounding_radius(&self) -> f64 {
        match self {
            Shape::Box { size } => size.scale(0.5).norm(),
            Shape::Sphere { radius } => *radius,
            Shape::Cylinder { radius, length } => (radius * radius + length * length / 4.0).sqrt(),
            Shape::Mesh { vertices, .. } => vertices.iter().map(|v| v.norm()).fold(0.0, f64::max),
            Shape::Plane { .. } | Shape::Octree => f64::INFINITY,
        }
    }

    /// True when `p`, given in the shape frame, lies inside the shape.
    ///
    /// Meshes are approximated by their bounding sphere.
    pub fn contains_local(&self, p: Vec3, padding: f64) -> bool {
        match self {
            Shape::Box { size } => {
                p.x.abs() <= size.x * 0.5 + padding
                    && p.y.abs() <= size.y * 0.5 + padding
                    && p.z.abs() <= size.z * 0.5 + padding
            }
            Shape::Sphere { radius } => p.norm() <= radius + padding,
            Shape::Cylinder { radius, length } => {
                (p.x * p.x + p.y * p.y).sqrt() <= radius + padding
                    && p.z.abs() <= length * 0.5 + padding
            }
            Shape::Mesh { .. } => p.norm() <= self.bounding_radius() + padding,
            Shape::Plane { .. } | Shape::Octree => false,
        }
    }

    /// Copy of this shape with mesh vertices closer than `tolerance` merged.
    ///
    /// Non-mesh shapes are returned unchanged.
    pub fn with_merged_vertices(&self, tolerance: f64) -> Shape {
        let Shape::Mesh { vertices, triangles } = self else {
            return self.clone();
        };
        let mut merged: Vec<Vec3> = Vec::with_capacity(vertices.len());
        let mut remap: Vec<u32> = Vec::with_capacity(vertices.len());
        for v in vertices {
            match merged.iter().position(|m| m.distance(*v) <= tolerance) {
                Some(i) => remap.push(i as u32),
                None => {
                    remap.push(merged.len() as u32);
                    merged.push(*v);
                }
            }
        }
        let triangles = triangles
            .iter()
            .filter_map(|t| {
                let mapped = t.map(|i| remap.get(i as usize).copied().unwrap_or(i));
                let degenerate =
                    mapped[0] == mapped[1] || mapped[1] == mapped[2] || mapped[0] == mapped[2];
                (!degenerate).then_some(mapped)
            })
            .collect();
        Shape::Mesh {
            vertices: merged,
            triangles,
        }
    }
}

//! Voxel occupancy index.
//!
//! Partitions 3-D space using a recursive **Octree** whose leaves hold the
//! centres of occupied voxels.  Sensor points are snapped to the voxel grid
//! on insertion, so inserting the same region twice does not grow the tree.
//!
//! # Key types
//!
//! | Type | Role |
//! |------|------|
//! | [`Aabb`]     | An axis-aligned bounding box.                          |
//! | [`Octree`]   | Spatial index; mark voxels, query for occupancy.       |
//!
//! # Example
//!
//! ```rust
//! use vigil_perception::octree::{Aabb, Octree};
//! use vigil_types::Vec3;
//!
//! let bounds = Aabb::new(Vec3::new(-10.0, -10.0, -10.0), Vec3::new(10.0, 10.0, 10.0));
//! let mut tree = Octree::new(bounds, 0.25);
//!
//! tree.insert(Vec3::new(1.1, 2.1, 3.1));
//!
//! assert!(tree.is_occupied(Vec3::new(1.0, 2.0, 3.0)));
//! assert!(!tree.is_occupied(Vec3::new(0.0, 0.0, 0.0)));
//! ```

use vigil_types::Vec3;

/// Occupied voxels per leaf before the leaf is split.
const LEAF_CAPACITY: usize = 8;
/// Subdivision stops at this depth regardless of leaf size.
const MAX_DEPTH: usize = 16;

// ────────────────────────────────────────────────────────────────────────────
// Aabb
// ────────────────────────────────────────────────────────────────────────────

/// An axis-aligned bounding box, defined by its minimum and maximum corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create a bounding box from two opposite corners, normalised so that
    /// `min ≤ max` per axis.
    pub fn new(a: Vec3, b: Vec3) -> Self {
        Self {
            min: Vec3::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Vec3::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    /// Cube of half-width `half_extent` centred at `centre`.
    pub fn around(centre: Vec3, half_extent: f64) -> Self {
        let h = Vec3::new(half_extent, half_extent, half_extent);
        Self::new(centre.sub(h), centre.add(h))
    }

    pub fn centre(&self) -> Vec3 {
        self.min.add(self.max).scale(0.5)
    }

    /// True when the point lies inside or on the boundary of the box.
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    /// True when `other` overlaps (intersects or touches) this box.
    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    fn octants(&self) -> [Aabb; 8] {
        let c = self.centre();
        let (min, max) = (self.min, self.max);
        [
            Aabb::new(min, c),
            Aabb::new(Vec3::new(c.x, min.y, min.z), Vec3::new(max.x, c.y, c.z)),
            Aabb::new(Vec3::new(min.x, c.y, min.z), Vec3::new(c.x, max.y, c.z)),
            Aabb::new(Vec3::new(c.x, c.y, min.z), Vec3::new(max.x, max.y, c.z)),
            Aabb::new(Vec3::new(min.x, min.y, c.z), Vec3::new(c.x, c.y, max.z)),
            Aabb::new(Vec3::new(c.x, min.y, c.z), Vec3::new(max.x, c.y, max.z)),
            Aabb::new(Vec3::new(min.x, c.y, c.z), Vec3::new(c.x, max.y, max.z)),
            Aabb::new(c, max),
        ]
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Octree
// ────────────────────────────────────────────────────────────────────────────

/// A recursive spatial index of occupied voxels.
///
/// Construct with [`Octree::new`], mark voxels with [`Octree::insert`], then
/// query with [`Octree::is_occupied`] or [`Octree::query_aabb`].
#[derive(Debug)]
pub struct Octree {
    root: OctreeNode,
    resolution: f64,
}

impl Octree {
    /// Create an empty tree covering `bounds` with voxels of edge
    /// `resolution` metres.
    pub fn new(bounds: Aabb, resolution: f64) -> Self {
        Self {
            root: OctreeNode::new(bounds),
            resolution: resolution.max(f64::MIN_POSITIVE),
        }
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn bounds(&self) -> Aabb {
        self.root.bounds
    }

    /// Mark the voxel containing `point` as occupied.
    ///
    /// Returns `true` when the voxel was previously free.  Points outside the
    /// root bounding box are ignored.
    pub fn insert(&mut self, point: Vec3) -> bool {
        let voxel = self.voxel_centre(point);
        if !self.root.bounds.contains_point(voxel) || self.root.contains(voxel) {
            return false;
        }
        self.root.insert(voxel, 0);
        true
    }

    /// Number of occupied voxels.
    pub fn len(&self) -> usize {
        self.root.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the voxel containing `p` is occupied.
    pub fn is_occupied(&self, p: Vec3) -> bool {
        self.root.contains(self.voxel_centre(p))
    }

    /// True when any occupied voxel centre lies inside `region`.
    pub fn query_aabb(&self, region: &Aabb) -> bool {
        self.root.query_aabb(region)
    }

    /// Centres of all occupied voxels.
    pub fn occupied_voxels(&self) -> Vec<Vec3> {
        let mut voxels = Vec::new();
        self.root.collect(&mut voxels);
        voxels
    }

    /// Free every voxel for which `keep` returns `false`.
    ///
    /// Returns the number of voxels freed.
    pub fn retain(&mut self, mut keep: impl FnMut(Vec3) -> bool) -> usize {
        let before = self.len();
        let kept: Vec<Vec3> = self.occupied_voxels().into_iter().filter(|v| keep(*v)).collect();
        self.root = OctreeNode::new(self.root.bounds);
        for v in kept {
            self.root.insert(v, 0);
        }
        before - self.len()
    }

    /// Free every voxel.
    pub fn clear(&mut self) {
        self.root = OctreeNode::new(self.root.bounds);
    }

    fn voxel_centre(&self, p: Vec3) -> Vec3 {
        let snap = |v: f64| ((v / self.resolution).floor() + 0.5) * self.resolution;
        Vec3::new(snap(p.x), snap(p.y), snap(p.z))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// OctreeNode – internal implementation
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct OctreeNode {
    bounds: Aabb,
    /// Voxel centres stored at this node (only non-empty while a leaf).
    voxels: Vec<Vec3>,
    /// Eight children; `None` while this node is a leaf.
    children: Option<Box<[OctreeNode; 8]>>,
}

impl OctreeNode {
    fn new(bounds: Aabb) -> Self {
        Self {
            bounds,
            voxels: Vec::new(),
            children: None,
        }
    }

    fn count(&self) -> usize {
        match &self.children {
            None => self.voxels.len(),
            Some(children) => children.iter().map(OctreeNode::count).sum(),
        }
    }

    fn insert(&mut self, voxel: Vec3, depth: usize) {
        match self.children.as_mut() {
            None => {
                self.voxels.push(voxel);
                if self.voxels.len() > LEAF_CAPACITY && depth < MAX_DEPTH {
                    self.subdivide(depth);
                }
            }
            Some(children) => {
                if let Some(child) = children.iter_mut().find(|c| c.bounds.contains_point(voxel)) {
                    child.insert(voxel, depth + 1);
                }
            }
        }
    }

    fn contains(&self, voxel: Vec3) -> bool {
        if !self.bounds.contains_point(voxel) {
            return false;
        }
        match &self.children {
            None => self.voxels.iter().any(|v| v.distance(voxel) < 1e-9),
            Some(children) => children.iter().any(|c| c.contains(voxel)),
        }
    }

    fn query_aabb(&self, region: &Aabb) -> bool {
        if !self.bounds.overlaps(region) {
            return false;
        }
        match &self.children {
            None => self.voxels.iter().any(|v| region.contains_point(*v)),
            Some(children) => children.iter().any(|c| c.query_aabb(region)),
        }
    }

    fn collect(&self, out: &mut Vec<Vec3>) {
        match &self.children {
            None => out.extend_from_slice(&self.voxels),
            Some(children) => children.iter().for_each(|c| c.collect(out)),
        }
    }

    /// Split this leaf into eight children and redistribute its voxels.
    fn subdivide(&mut self, depth: usize) {
        let mut children = Box::new(self.bounds.octants().map(OctreeNode::new));
        for v in std::mem::take(&mut self.voxels) {
            if let Some(child) = children.iter_mut().find(|c| c.bounds.contains_point(v)) {
                child.insert(v, depth + 1);
            }
        }
        self.children = Some(children);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn room(resolution: f64) -> Octree {
        Octree::new(
            Aabb::new(Vec3::new(-5.0, -5.0, -5.0), Vec3::new(5.0, 5.0, 5.0)),
            resolution,
        )
    }

    // ── Aabb ────────────────────────────────────────────────────────────────

    #[test]
    fn aabb_contains_boundary_point() {
        let b = Aabb::new(Vec3::zero(), Vec3::new(1.0, 1.0, 1.0));
        assert!(b.contains_point(Vec3::zero()));
        assert!(b.contains_point(Vec3::new(1.0, 1.0, 1.0)));
        assert!(!b.contains_point(Vec3::new(2.0, 0.0, 0.0)));
    }

    #[test]
    fn aabb_normalises_min_max() {
        let b = Aabb::new(Vec3::new(2.0, 2.0, 2.0), Vec3::zero());
        assert_eq!(b.min, Vec3::zero());
        assert_eq!(b.max, Vec3::new(2.0, 2.0, 2.0));
    }

    #[test]
    fn aabb_overlap() {
        let a = Aabb::new(Vec3::zero(), Vec3::new(1.0, 1.0, 1.0));
        assert!(a.overlaps(&Aabb::new(Vec3::new(1.0, 0.0, 0.0), Vec3::new(2.0, 1.0, 1.0))));
        assert!(!a.overlaps(&Aabb::new(Vec3::new(2.0, 0.0, 0.0), Vec3::new(3.0, 1.0, 1.0))));
    }

    // ── Octree ──────────────────────────────────────────────────────────────

    #[test]
    fn points_in_same_voxel_are_deduplicated() {
        let mut tree = room(0.1);
        assert!(tree.insert(Vec3::new(0.51, 0.51, 0.51)));
        assert!(!tree.insert(Vec3::new(0.52, 0.53, 0.54)));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn insert_outside_bounds_is_ignored() {
        let mut tree = room(0.1);
        assert!(!tree.insert(Vec3::new(50.0, 0.0, 0.0)));
        assert!(tree.is_empty());
    }

    #[test]
    fn subdivision_preserves_all_voxels() {
        let mut tree = room(0.25);
        let mut inserted = 0;
        for ix in -4..4 {
            for iy in -4..4 {
                tree.insert(Vec3::new(ix as f64 * 0.5, iy as f64 * 0.5, 1.0));
                inserted += 1;
            }
        }
        assert_eq!(tree.len(), inserted);
        assert!(tree.is_occupied(Vec3::new(-2.0, -2.0, 1.0)));
        assert!(tree.is_occupied(Vec3::new(1.5, 1.5, 1.0)));
    }

    #[test]
    fn query_aabb_path_clear_scenario() {
        let mut tree = room(0.1);
        tree.insert(Vec3::new(3.0, 0.0, 0.0));

        let clear = Aabb::new(Vec3::new(0.0, -0.5, -0.5), Vec3::new(2.0, 0.5, 0.5));
        assert!(!tree.query_aabb(&clear));
        let blocked = Aabb::new(Vec3::new(0.0, -0.5, -0.5), Vec3::new(4.0, 0.5, 0.5));
        assert!(tree.query_aabb(&blocked));
    }

    #[test]
    fn retain_frees_rejected_voxels() {
        let mut tree = room(0.1);
        tree.insert(Vec3::new(1.0, 0.0, 0.0));
        tree.insert(Vec3::new(-1.0, 0.0, 0.0));

        let freed = tree.retain(|v| v.x < 0.0);
        assert_eq!(freed, 1);
        assert!(!tree.is_occupied(Vec3::new(1.0, 0.0, 0.0)));
        assert!(tree.is_occupied(Vec3::new(-1.0, 0.0, 0.0)));
    }

    #[test]
    fn clear_frees_everything() {
        let mut tree = room(0.1);
        tree.insert(Vec3::new(1.0, 1.0, 1.0));
        tree.clear();
        assert!(tree.is_empty());
        assert!(tree.occupied_voxels().is_empty());
    }
}

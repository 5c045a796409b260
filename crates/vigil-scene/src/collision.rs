//! Collision configuration carried by a scene: which body pairs may touch,
//! and how much links are inflated.

use std::collections::BTreeMap;

use vigil_types::{AcmEntry, LinkPadding, LinkScale};

// ────────────────────────────────────────────────────────────────────────────
// AllowedCollisionMatrix
// ────────────────────────────────────────────────────────────────────────────

/// Symmetric table of body pairs whose contact is allowed (or explicitly
/// forbidden).  Pairs without an entry fall back to "not allowed".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllowedCollisionMatrix {
    entries: BTreeMap<(String, String), bool>,
}

impl AllowedCollisionMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    pub fn set_entry(&mut self, a: &str, b: &str, allowed: bool) {
        self.entries.insert(Self::key(a, b), allowed);
    }

    pub fn entry(&self, a: &str, b: &str) -> Option<bool> {
        self.entries.get(&Self::key(a, b)).copied()
    }

    pub fn remove_entry(&mut self, a: &str, b: &str) -> bool {
        self.entries.remove(&Self::key(a, b)).is_some()
    }

    /// Remove every entry mentioning `name`.
    pub fn remove_body(&mut self, name: &str) {
        self.entries.retain(|(a, b), _| a != name && b != name);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_msg(&self) -> Vec<AcmEntry> {
        self.entries
            .iter()
            .map(|((first, second), allowed)| AcmEntry {
                first: first.clone(),
                second: second.clone(),
                allowed: *allowed,
            })
            .collect()
    }

    /// Merge `entries` into the matrix, overriding existing pairs.
    pub fn merge_msg(&mut self, entries: &[AcmEntry]) {
        for e in entries {
            self.set_entry(&e.first, &e.second, e.allowed);
        }
    }

    pub fn from_msg(entries: &[AcmEntry]) -> Self {
        let mut acm = Self::new();
        acm.merge_msg(entries);
        acm
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CollisionPadding
// ────────────────────────────────────────────────────────────────────────────

/// Per-link padding and scaling, with defaults for links without an
/// override.
#[derive(Debug, Clone, PartialEq)]
pub struct CollisionPadding {
    pub default_padding: f64,
    pub default_scale: f64,
    link_padding: BTreeMap<String, f64>,
    link_scale: BTreeMap<String, f64>,
}

impl Default for CollisionPadding {
    fn default() -> Self {
        Self::new(0.0, 1.0)
    }
}

impl CollisionPadding {
    pub fn new(default_padding: f64, default_scale: f64) -> Self {
        Self {
            default_padding,
            default_scale,
            link_padding: BTreeMap::new(),
            link_scale: BTreeMap::new(),
        }
    }

    pub fn padding(&self, link: &str) -> f64 {
        self.link_padding.get(link).copied().unwrap_or(self.default_padding)
    }

    pub fn scale(&self, link: &str) -> f64 {
        self.link_scale.get(link).copied().unwrap_or(self.default_scale)
    }

    pub fn set_link_padding(&mut self, link: &str, padding: f64) {
        self.link_padding.insert(link.to_string(), padding);
    }

    pub fn set_link_scale(&mut self, link: &str, scale: f64) {
        self.link_scale.insert(link.to_string(), scale);
    }

    pub fn padding_msg(&self) -> Vec<LinkPadding> {
        self.link_padding
            .iter()
            .map(|(link_name, padding)| LinkPadding {
                link_name: link_name.clone(),
                padding: *padding,
            })
            .collect()
    }

    pub fn scale_msg(&self) -> Vec<LinkScale> {
        self.link_scale
            .iter()
            .map(|(link_name, scale)| LinkScale {
                link_name: link_name.clone(),
                scale: *scale,
            })
            .collect()
    }

    /// Apply per-link overrides; with `replace` every existing override is
    /// dropped first.
    pub fn apply_msg(&mut self, padding: &[LinkPadding], scale: &[LinkScale], replace: bool) {
        if replace {
            self.link_padding.clear();
            self.link_scale.clear();
        }
        for p in padding {
            self.set_link_padding(&p.link_name, p.padding);
        }
        for s in scale {
            self.set_link_scale(&s.link_name, s.scale);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acm_is_symmetric() {
        let mut acm = AllowedCollisionMatrix::new();
        acm.set_entry("gripper", "table", true);
        assert_eq!(acm.entry("table", "gripper"), Some(true));
        assert_eq!(acm.entry("gripper", "wall"), None);
        assert_eq!(acm.len(), 1);
    }

    #[test]
    fn acm_merge_overrides() {
        let mut acm = AllowedCollisionMatrix::new();
        acm.set_entry("a", "b", true);
        acm.merge_msg(&[AcmEntry {
            first: "b".into(),
            second: "a".into(),
            allowed: false,
        }]);
        assert_eq!(acm.entry("a", "b"), Some(false));
    }

    #[test]
    fn acm_remove_body_drops_all_pairs() {
        let mut acm = AllowedCollisionMatrix::new();
        acm.set_entry("box", "gripper", true);
        acm.set_entry("box", "table", true);
        acm.set_entry("gripper", "table", false);
        acm.remove_body("box");
        assert_eq!(acm.len(), 1);
    }

    #[test]
    fn padding_falls_back_to_default() {
        let mut padding = CollisionPadding::new(0.01, 1.0);
        padding.set_link_padding("gripper", 0.05);
        assert_eq!(padding.padding("gripper"), 0.05);
        assert_eq!(padding.padding("base_link"), 0.01);
        assert_eq!(padding.scale("base_link"), 1.0);
    }

    #[test]
    fn replacing_msg_drops_previous_overrides() {
        let mut padding = CollisionPadding::default();
        padding.set_link_padding("a", 0.1);
        padding.apply_msg(
            &[LinkPadding {
                link_name: "b".into(),
                padding: 0.2,
            }],
            &[],
            true,
        );
        assert_eq!(padding.padding("a"), 0.0);
        assert_eq!(padding.padding("b"), 0.2);
    }
}

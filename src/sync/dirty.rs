//! Per-entity dirty-state classification.
//!
//! Every renderable entity carries a bitmask describing which attribute
//! categories changed since the last sync. The sync engine consumes the mask
//! category by category; a mask that survives a full sync cycle indicates a
//! bug and trips a debug assertion in the engine.

use crate::scene::EntityId;
use std::collections::HashMap;
use std::fmt;

/// Bitmask of attribute categories that changed since the last sync.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DirtyBits(u32);

impl DirtyBits {
    pub const TRANSFORM: Self = Self(1 << 0);
    pub const TOPOLOGY: Self = Self(1 << 1);
    pub const POINTS: Self = Self(1 << 2);
    pub const NORMALS: Self = Self(1 << 3);
    pub const TEXCOORDS: Self = Self(1 << 4);
    pub const MATERIAL: Self = Self(1 << 5);
    pub const INSTANCE: Self = Self(1 << 6);

    /// Initial mask for a freshly inserted entity: everything is dirty.
    pub const ALL: Self = Self(0x7f);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every flag in `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any flag in `other` is set in `self`.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl fmt::Debug for DirtyBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(DirtyBits, &str); 7] = [
            (DirtyBits::TRANSFORM, "TRANSFORM"),
            (DirtyBits::TOPOLOGY, "TOPOLOGY"),
            (DirtyBits::POINTS, "POINTS"),
            (DirtyBits::NORMALS, "NORMALS"),
            (DirtyBits::TEXCOORDS, "TEXCOORDS"),
            (DirtyBits::MATERIAL, "MATERIAL"),
            (DirtyBits::INSTANCE, "INSTANCE"),
        ];

        if self.is_empty() {
            return write!(f, "DirtyBits(empty)");
        }

        write!(f, "DirtyBits(")?;
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        write!(f, ")")
    }
}

/// Accumulates application-driven change notifications between sync cycles.
///
/// The scene delegate reports its own dirty mask per sync call; this tracker
/// lets the embedding application flag additional invalidation (for example
/// after an out-of-band edit). Both masks are unioned by the engine and then
/// consumed together.
#[derive(Default)]
pub struct DirtyTracker {
    pending: HashMap<EntityId, DirtyBits>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `bits` into the pending mask for `id`.
    pub fn mark(&mut self, id: &EntityId, bits: DirtyBits) {
        if bits.is_empty() {
            return;
        }
        self.pending.entry(id.clone()).or_default().insert(bits);
    }

    /// Take and clear the pending mask for `id`.
    pub fn take(&mut self, id: &EntityId) -> DirtyBits {
        self.pending.remove(id).unwrap_or_default()
    }

    /// Drop all pending state for a removed entity.
    pub fn forget(&mut self, id: &EntityId) {
        self.pending.remove(id);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_operations() {
        let mut bits = DirtyBits::empty();
        assert!(bits.is_empty());

        bits.insert(DirtyBits::POINTS);
        bits.insert(DirtyBits::TRANSFORM);
        assert!(bits.contains(DirtyBits::POINTS));
        assert!(bits.contains(DirtyBits::TRANSFORM));
        assert!(!bits.contains(DirtyBits::TOPOLOGY));
        assert!(bits.intersects(DirtyBits::POINTS.union(DirtyBits::NORMALS)));
        assert!(!bits.contains(DirtyBits::POINTS.union(DirtyBits::NORMALS)));

        bits.remove(DirtyBits::POINTS);
        assert!(!bits.contains(DirtyBits::POINTS));
        assert!(bits.contains(DirtyBits::TRANSFORM));
    }

    #[test]
    fn all_covers_every_category() {
        for flag in [
            DirtyBits::TRANSFORM,
            DirtyBits::TOPOLOGY,
            DirtyBits::POINTS,
            DirtyBits::NORMALS,
            DirtyBits::TEXCOORDS,
            DirtyBits::MATERIAL,
            DirtyBits::INSTANCE,
        ] {
            assert!(DirtyBits::ALL.contains(flag));
        }
    }

    #[test]
    fn debug_format_lists_flag_names() {
        let bits = DirtyBits::POINTS.union(DirtyBits::MATERIAL);
        let text = format!("{:?}", bits);
        assert!(text.contains("POINTS"));
        assert!(text.contains("MATERIAL"));
        assert!(!text.contains("TOPOLOGY"));
    }

    #[test]
    fn tracker_take_clears_pending() {
        let id = EntityId::new("/scene/mesh");
        let mut tracker = DirtyTracker::new();
        tracker.mark(&id, DirtyBits::POINTS);
        tracker.mark(&id, DirtyBits::TRANSFORM);

        let taken = tracker.take(&id);
        assert!(taken.contains(DirtyBits::POINTS));
        assert!(taken.contains(DirtyBits::TRANSFORM));
        assert!(tracker.take(&id).is_empty());
    }
}

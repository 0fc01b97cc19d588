//! Material-binding notification toward the shading-graph emitter.
//!
//! The sync core only tracks which material an entity is bound to; when the
//! binding changes it tells the emitter and moves on. Shader internals are
//! the emitter's business.

use crate::scene::EntityId;

/// Consumer of per-entity material-binding changes.
pub trait ShadingEmitter {
    /// Called once per sync in which the binding actually changed.
    /// `binding` is `None` when the entity lost its material.
    fn material_changed(&mut self, entity: &EntityId, binding: Option<&EntityId>);
}

/// Emitter that ignores all notifications.
#[derive(Default)]
pub struct NullEmitter;

impl ShadingEmitter for NullEmitter {
    fn material_changed(&mut self, _entity: &EntityId, _binding: Option<&EntityId>) {}
}

/// Emitter that records notifications, for tests.
#[derive(Default)]
pub struct RecordingEmitter {
    pub changes: Vec<(EntityId, Option<EntityId>)>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ShadingEmitter for RecordingEmitter {
    fn material_changed(&mut self, entity: &EntityId, binding: Option<&EntityId>) {
        self.changes.push((entity.clone(), binding.cloned()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_emitter_keeps_order() {
        let mut emitter = RecordingEmitter::new();
        let mesh = EntityId::new("/scene/mesh");
        let red = EntityId::new("/materials/red");

        emitter.material_changed(&mesh, Some(&red));
        emitter.material_changed(&mesh, None);

        assert_eq!(emitter.changes.len(), 2);
        assert_eq!(emitter.changes[0].1.as_ref(), Some(&red));
        assert_eq!(emitter.changes[1].1, None);
    }
}

// src/accel/mod.rs
// Acceleration structure lifecycle: per-entity bottom-level structures with a
// rebuild-vs-refit decision, and a top-level structure that batches all
// placement changes into one rebuild per frame.

use crate::error::RenderResult;
use crate::rhi::{BlasGeometry, BlasId, RenderBackend, TlasId, TlasInstance};
use crate::scene::EntityId;
use std::collections::BTreeMap;

/// What changed for an entity this sync, as far as acceleration structures
/// are concerned.
#[derive(Clone, Copy, Debug, Default)]
pub struct AccelDirty {
    pub topology_changed: bool,
    pub count_changed: bool,
    pub points_moved: bool,
    pub transform_changed: bool,
}

impl AccelDirty {
    pub fn any(&self) -> bool {
        self.topology_changed || self.count_changed || self.points_moved || self.transform_changed
    }
}

/// Bottom-level update decision.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlasUpdate {
    /// Full rebuild; may reallocate.
    Rebuild,
    /// In-place bounds update; never allocates.
    Refit,
}

/// Decide how to bring an entity's bottom-level structure up to date.
///
/// Topology or count changes force a rebuild. Moved positions with identical
/// topology and count refit in place. A transform-only change touches neither:
/// placement lives in the top-level structure.
pub fn classify_blas_update(has_blas: bool, dirty: &AccelDirty) -> Option<BlasUpdate> {
    if !has_blas {
        return Some(BlasUpdate::Rebuild);
    }
    if dirty.topology_changed || dirty.count_changed {
        return Some(BlasUpdate::Rebuild);
    }
    if dirty.points_moved {
        return Some(BlasUpdate::Refit);
    }
    None
}

struct BlasRecord {
    id: BlasId,
    vertex_count: u32,
    triangle_count: u32,
}

#[derive(Clone, Copy, PartialEq)]
struct InstanceRecord {
    transform: [[f32; 4]; 4],
    slot: u32,
}

/// Owns every BLAS and the scene TLAS.
///
/// Entities feed per-sync change summaries in; the TLAS is rebuilt at most
/// once per frame from `flush`, never mid-frame.
#[derive(Default)]
pub struct AccelManager {
    blas: BTreeMap<EntityId, BlasRecord>,
    instances: BTreeMap<EntityId, InstanceRecord>,
    tlas: Option<TlasId>,
    tlas_dirty: bool,
    rebuild_count: u64,
    refit_count: u64,
    tlas_build_count: u64,
}

impl AccelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the entity's BLAS up to date for the given change summary.
    pub fn sync_blas(
        &mut self,
        backend: &mut dyn RenderBackend,
        id: &EntityId,
        positions: &[[f32; 3]],
        triangles: &[[u32; 3]],
        dirty: &AccelDirty,
    ) -> RenderResult<()> {
        match classify_blas_update(self.blas.contains_key(id), dirty) {
            Some(BlasUpdate::Rebuild) => {
                let new_id = backend.build_blas(&BlasGeometry {
                    positions,
                    triangles,
                })?;
                if let Some(old) = self.blas.insert(
                    id.clone(),
                    BlasRecord {
                        id: new_id,
                        vertex_count: positions.len() as u32,
                        triangle_count: triangles.len() as u32,
                    },
                ) {
                    backend.destroy_blas(old.id);
                }
                self.rebuild_count += 1;
                self.tlas_dirty = true;
                log::debug!(
                    "rebuilt BLAS for {}: {} vertices, {} triangles",
                    id,
                    positions.len(),
                    triangles.len()
                );
            }
            Some(BlasUpdate::Refit) => {
                // Same handle, same counts; only bounds move.
                let record = &self.blas[id];
                debug_assert_eq!(record.vertex_count as usize, positions.len());
                debug_assert_eq!(record.triangle_count as usize, triangles.len());
                backend.refit_blas(record.id, positions)?;
                self.refit_count += 1;
                log::debug!("refit BLAS for {}", id);
            }
            None => {}
        }
        Ok(())
    }

    /// Record the entity's placement. Marks the TLAS for the next flush when
    /// anything actually changed.
    pub fn set_instance(&mut self, id: &EntityId, transform: [[f32; 4]; 4], slot: u32) {
        let record = InstanceRecord { transform, slot };
        if self.instances.get(id) != Some(&record) {
            self.instances.insert(id.clone(), record);
            self.tlas_dirty = true;
        }
    }

    /// Release everything the entity owns; the TLAS drops it on next flush.
    pub fn remove_entity(&mut self, backend: &mut dyn RenderBackend, id: &EntityId) {
        if let Some(record) = self.blas.remove(id) {
            backend.destroy_blas(record.id);
            self.tlas_dirty = true;
        }
        if self.instances.remove(id).is_some() {
            self.tlas_dirty = true;
        }
    }

    /// Rebuild the TLAS if any placement or BLAS changed this frame.
    /// Multiple entity changes batch into this single update.
    pub fn flush(&mut self, backend: &mut dyn RenderBackend) -> RenderResult<()> {
        if !self.tlas_dirty {
            return Ok(());
        }

        if let Some(old) = self.tlas.take() {
            backend.destroy_tlas(old);
        }

        if !self.instances.is_empty() {
            let entries: Vec<TlasInstance> = self
                .instances
                .iter()
                .filter_map(|(id, instance)| {
                    self.blas.get(id).map(|record| TlasInstance {
                        blas: record.id,
                        transform: instance.transform,
                        instance_slot: instance.slot,
                    })
                })
                .collect();
            if !entries.is_empty() {
                self.tlas = Some(backend.build_tlas(&entries)?);
                self.tlas_build_count += 1;
                log::debug!("rebuilt TLAS with {} instances", entries.len());
            }
        }

        self.tlas_dirty = false;
        Ok(())
    }

    pub fn tlas(&self) -> Option<TlasId> {
        self.tlas
    }

    pub fn blas(&self, id: &EntityId) -> Option<BlasId> {
        self.blas.get(id).map(|r| r.id)
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuild_count
    }

    pub fn refit_count(&self) -> u64 {
        self.refit_count
    }

    pub fn tlas_build_count(&self) -> u64 {
        self.tlas_build_count
    }

    /// Tear down all owned structures.
    pub fn destroy(&mut self, backend: &mut dyn RenderBackend) {
        for (_, record) in std::mem::take(&mut self.blas) {
            backend.destroy_blas(record.id);
        }
        self.instances.clear();
        if let Some(tlas) = self.tlas.take() {
            backend.destroy_tlas(tlas);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sync_is_a_rebuild() {
        let dirty = AccelDirty::default();
        assert_eq!(classify_blas_update(false, &dirty), Some(BlasUpdate::Rebuild));
    }

    #[test]
    fn transform_only_touches_no_blas() {
        let dirty = AccelDirty {
            transform_changed: true,
            ..AccelDirty::default()
        };
        assert_eq!(classify_blas_update(true, &dirty), None);
    }

    #[test]
    fn moved_points_refit() {
        let dirty = AccelDirty {
            points_moved: true,
            ..AccelDirty::default()
        };
        assert_eq!(classify_blas_update(true, &dirty), Some(BlasUpdate::Refit));
    }

    #[test]
    fn count_change_rebuilds_even_with_moved_points() {
        let dirty = AccelDirty {
            points_moved: true,
            count_changed: true,
            ..AccelDirty::default()
        };
        assert_eq!(classify_blas_update(true, &dirty), Some(BlasUpdate::Rebuild));
    }

    #[test]
    fn topology_change_rebuilds() {
        let dirty = AccelDirty {
            topology_changed: true,
            ..AccelDirty::default()
        };
        assert_eq!(classify_blas_update(true, &dirty), Some(BlasUpdate::Rebuild));
    }
}

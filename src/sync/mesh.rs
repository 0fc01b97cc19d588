//! Per-entity mesh synchronization.
//!
//! Each renderable mesh walks the state machine
//! `Uninitialized -> Synced -> (Dirty -> Synced)* -> Finalized`. A sync
//! consumes the dirty mask category by category; every category commits by
//! writing a fresh pool region and swapping the handle, so a failed category
//! leaves the previous GPU data intact. Redundant notifications (flagged but
//! value unchanged) clear their bit without touching the GPU.

use super::dirty::DirtyBits;
use super::primvar::PrimvarCache;
use super::RenderSync;
use crate::accel::AccelDirty;
use crate::error::{RenderError, RenderResult};
use crate::geometry::{
    compute_smooth_normals, face_varying_corners, triangulate_fan, validate_topology,
    Triangulation, VertexAdjacency,
};
use crate::memory::{DeviceMemoryPool, MemoryHandle};
use crate::rhi::RenderBackend;
use crate::scene::{
    EntityId, Interpolation, MeshTopology, SceneDelegate, PRIMVAR_NORMALS, PRIMVAR_TEXCOORDS,
};
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use std::sync::Arc;

/// Lifecycle of a renderable entity.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncState {
    Uninitialized,
    Synced,
    /// Terminal; any further sync is an error.
    Finalized,
}

/// Per-instance record the render kernels index by instance slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceData {
    pub transform: [[f32; 4]; 4],
    pub mesh_slot: u32,
    pub material_slot: u32,
    pub _pad: [u32; 2],
}

/// One renderable mesh and everything it owns on the GPU.
pub struct MeshEntity {
    id: EntityId,
    slot: u32,
    state: SyncState,
    transform: Mat4,
    topology: Option<Arc<MeshTopology>>,
    topology_version: u64,
    points_version: u64,
    triangulation: Triangulation,
    adjacency: Option<VertexAdjacency>,
    points: Vec<[f32; 3]>,
    computed_normals: Vec<[f32; 3]>,
    primvars: PrimvarCache,
    normals_valid: bool,
    adjacency_valid: bool,
    has_authored_normals: bool,
    material: Option<EntityId>,
    material_slot: u32,
    instance_cache: Option<InstanceData>,
    index_region: Option<MemoryHandle>,
    position_region: Option<MemoryHandle>,
    normal_region: Option<MemoryHandle>,
    texcoord_region: Option<MemoryHandle>,
    instance_region: Option<MemoryHandle>,
}

impl MeshEntity {
    fn new(id: EntityId, slot: u32) -> Self {
        Self {
            id,
            slot,
            state: SyncState::Uninitialized,
            transform: Mat4::IDENTITY,
            topology: None,
            topology_version: 0,
            points_version: 0,
            triangulation: Triangulation::default(),
            adjacency: None,
            points: Vec::new(),
            computed_normals: Vec::new(),
            primvars: PrimvarCache::new(),
            normals_valid: false,
            adjacency_valid: false,
            has_authored_normals: false,
            material: None,
            material_slot: 0,
            instance_cache: None,
            index_region: None,
            position_region: None,
            normal_region: None,
            texcoord_region: None,
            instance_region: None,
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// Stable slot render kernels use to address this entity's instance data.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn transform(&self) -> Mat4 {
        self.transform
    }

    pub fn points(&self) -> &[[f32; 3]] {
        &self.points
    }

    pub fn computed_normals(&self) -> &[[f32; 3]] {
        &self.computed_normals
    }

    pub fn triangulation(&self) -> &Triangulation {
        &self.triangulation
    }

    pub fn material(&self) -> Option<&EntityId> {
        self.material.as_ref()
    }

    pub fn index_region(&self) -> Option<MemoryHandle> {
        self.index_region
    }

    pub fn position_region(&self) -> Option<MemoryHandle> {
        self.position_region
    }

    pub fn normal_region(&self) -> Option<MemoryHandle> {
        self.normal_region
    }

    pub fn texcoord_region(&self) -> Option<MemoryHandle> {
        self.texcoord_region
    }

    pub fn instance_region(&self) -> Option<MemoryHandle> {
        self.instance_region
    }
}

impl<B: RenderBackend> RenderSync<B> {
    /// Synchronize one entity against the scene delegate.
    ///
    /// Unknown ids are created in `Uninitialized` state and receive a full
    /// first sync. Only flagged categories are processed; each consumed flag
    /// is cleared, and a mask that survives the cycle trips a debug
    /// assertion.
    pub fn sync_entity(&mut self, delegate: &dyn SceneDelegate, id: &EntityId) -> RenderResult<()> {
        if !self.entities.contains_key(id) {
            let slot = self.next_slot;
            self.next_slot += 1;
            self.entities.insert(id.clone(), MeshEntity::new(id.clone(), slot));
        }

        let Self {
            entities,
            pools,
            backend,
            accel,
            emitter,
            tracker,
            material_slots,
            ..
        } = self;
        let entity = entities.get_mut(id).expect("entity inserted above");

        if entity.state == SyncState::Finalized {
            return Err(RenderError::invalid_state(format!(
                "sync on finalized entity {}",
                id
            )));
        }

        let first = entity.state == SyncState::Uninitialized;
        let mut dirty = delegate.dirty_bits(id).union(tracker.take(id));
        if first {
            dirty = DirtyBits::ALL;
        }
        if dirty.is_empty() {
            return Ok(());
        }
        log::debug!("syncing {} with {:?}", id, dirty);

        let mut accel_dirty = AccelDirty::default();

        // Pull flagged snapshots up front so validation sees the combined
        // picture before anything commits.
        let topo_snapshot = dirty
            .contains(DirtyBits::TOPOLOGY)
            .then(|| delegate.topology(id));
        let points_snapshot = dirty
            .contains(DirtyBits::POINTS)
            .then(|| delegate.points(id));

        let topo_changed = topo_snapshot
            .as_ref()
            .map_or(false, |t| first || t.version != entity.topology_version);
        let points_changed = points_snapshot
            .as_ref()
            .map_or(false, |p| first || p.version != entity.points_version);

        if topo_changed || points_changed {
            let topology: &MeshTopology = if topo_changed {
                &*topo_snapshot.as_ref().expect("topo_changed").value
            } else {
                match entity.topology.as_deref() {
                    Some(t) => t,
                    None => &EMPTY_TOPOLOGY,
                }
            };
            let point_count = if points_changed {
                points_snapshot.as_ref().expect("points_changed").value.len()
            } else {
                entity.points.len()
            };
            validate_topology(topology, point_count)?;
        }

        // --- topology ---
        if let Some(snapshot) = topo_snapshot {
            if topo_changed {
                let triangulation = triangulate_fan(&snapshot.value);
                let flat: Vec<u32> = triangulation
                    .indices
                    .iter()
                    .flat_map(|t| t.iter().copied())
                    .collect();
                upload_region(&mut pools.indices, backend, &mut entity.index_region, &flat)?;

                log::debug!(
                    "{}: {} faces -> {} triangles",
                    id,
                    snapshot.value.face_count(),
                    triangulation.triangle_count()
                );

                entity.topology_version = snapshot.version;
                entity.topology = Some(Arc::clone(&snapshot.value));
                entity.triangulation = triangulation;
                entity.adjacency_valid = false;
                entity.normals_valid = false;
                // Face-varying primvars are indexed through the
                // triangulation; force their re-expansion.
                for (name, bit) in [
                    (PRIMVAR_TEXCOORDS, DirtyBits::TEXCOORDS),
                    (PRIMVAR_NORMALS, DirtyBits::NORMALS),
                ] {
                    if entity
                        .primvars
                        .get(name)
                        .map_or(false, |p| p.interpolation == Interpolation::FaceVarying)
                    {
                        entity.primvars.remove(name);
                        dirty.insert(bit);
                    }
                }
                accel_dirty.topology_changed = true;
            }
            dirty.remove(DirtyBits::TOPOLOGY);
        }

        // --- points ---
        if let Some(snapshot) = points_snapshot {
            if points_changed {
                let new_points: &[[f32; 3]] = &snapshot.value;
                upload_region(
                    &mut pools.positions,
                    backend,
                    &mut entity.position_region,
                    new_points,
                )?;

                accel_dirty.points_moved = true;
                if !first && new_points.len() != entity.points.len() {
                    accel_dirty.count_changed = true;
                }

                entity.points_version = snapshot.version;
                entity.points = (*snapshot.value).clone();
                if !entity.has_authored_normals {
                    entity.normals_valid = false;
                }
            }
            dirty.remove(DirtyBits::POINTS);
        }

        // --- normals ---
        if dirty.contains(DirtyBits::NORMALS) || !entity.normals_valid {
            match delegate.primvar(id, PRIMVAR_NORMALS) {
                Some(authored) => {
                    entity.has_authored_normals = true;
                    if entity.primvars.apply(PRIMVAR_NORMALS, &authored) {
                        let values = authored.data.value.as_vec3s().ok_or_else(|| {
                            RenderError::device("normals primvar must be vec3")
                        })?;
                        let flattened;
                        let upload: &[[f32; 3]] =
                            if authored.interpolation == Interpolation::FaceVarying {
                                let corners = face_varying_corners(topology_of(entity));
                                flattened = flatten_face_varying(&corners, values)?;
                                &flattened
                            } else {
                                values
                            };
                        upload_region(
                            &mut pools.normals,
                            backend,
                            &mut entity.normal_region,
                            upload,
                        )?;
                    }
                    entity.normals_valid = true;
                }
                None => {
                    entity.has_authored_normals = false;
                    if !entity.normals_valid {
                        if let Some(topology) = entity.topology.clone() {
                            if !entity.adjacency_valid {
                                entity.adjacency = Some(VertexAdjacency::build(
                                    &topology,
                                    entity.points.len(),
                                ));
                                entity.adjacency_valid = true;
                            }
                            let adjacency =
                                entity.adjacency.as_ref().expect("adjacency built above");
                            let normals =
                                compute_smooth_normals(&entity.points, &topology, adjacency);
                            upload_region(
                                &mut pools.normals,
                                backend,
                                &mut entity.normal_region,
                                &normals,
                            )?;
                            entity.computed_normals = normals;
                            entity.normals_valid = true;
                        }
                    }
                }
            }
            dirty.remove(DirtyBits::NORMALS);
        }

        // --- texcoords ---
        if dirty.contains(DirtyBits::TEXCOORDS) {
            match delegate.primvar(id, PRIMVAR_TEXCOORDS) {
                Some(primvar) => {
                    if entity.primvars.apply(PRIMVAR_TEXCOORDS, &primvar) {
                        let values = primvar.data.value.as_vec2s().ok_or_else(|| {
                            RenderError::device("texcoord primvar must be vec2")
                        })?;
                        let flattened;
                        let upload: &[[f32; 2]] =
                            if primvar.interpolation == Interpolation::FaceVarying {
                                let corners = face_varying_corners(topology_of(entity));
                                flattened = flatten_face_varying(&corners, values)?;
                                &flattened
                            } else {
                                values
                            };
                        upload_region(
                            &mut pools.texcoords,
                            backend,
                            &mut entity.texcoord_region,
                            upload,
                        )?;
                    }
                }
                None => {
                    // Primvar withdrawn: drop the cached snapshot and region.
                    if entity.primvars.remove(PRIMVAR_TEXCOORDS).is_some() {
                        if let Some(old) = entity.texcoord_region.take() {
                            pools.texcoords.release(old)?;
                        }
                    }
                }
            }
            dirty.remove(DirtyBits::TEXCOORDS);
        }

        // --- transform ---
        if dirty.contains(DirtyBits::TRANSFORM) {
            let matrix = delegate.transform(id);
            if first || matrix != entity.transform {
                entity.transform = matrix;
                accel_dirty.transform_changed = true;
            }
            dirty.remove(DirtyBits::TRANSFORM);
        }

        // --- material binding ---
        let mut material_changed = false;
        if dirty.contains(DirtyBits::MATERIAL) {
            let binding = delegate.material_binding(id);
            if first || binding != entity.material {
                entity.material_slot = match &binding {
                    Some(material) => {
                        let next = material_slots.len() as u32 + 1;
                        *material_slots.entry(material.clone()).or_insert(next)
                    }
                    None => 0,
                };
                entity.material = binding.clone();
                emitter.material_changed(id, binding.as_ref());
                material_changed = true;
            }
            dirty.remove(DirtyBits::MATERIAL);
        }

        // --- instance record ---
        if first
            || material_changed
            || accel_dirty.transform_changed
            || dirty.contains(DirtyBits::INSTANCE)
        {
            let record = InstanceData {
                transform: entity.transform.to_cols_array_2d(),
                mesh_slot: entity.slot,
                material_slot: entity.material_slot,
                _pad: [0; 2],
            };
            // A redundantly flagged instance compares equal and uploads
            // nothing.
            if entity.instance_cache != Some(record) {
                if entity.instance_region.is_none() {
                    entity.instance_region = Some(pools.instances.acquire(backend, 1)?);
                }
                let region = entity.instance_region.expect("instance region set above");
                pools.instances.write(backend, region, 0, &[record])?;
                entity.instance_cache = Some(record);
            }
        }
        dirty.remove(DirtyBits::INSTANCE);

        // --- acceleration structures ---
        if first
            || accel_dirty.topology_changed
            || accel_dirty.count_changed
            || accel_dirty.points_moved
        {
            accel.sync_blas(
                backend,
                id,
                &entity.points,
                &entity.triangulation.indices,
                &accel_dirty,
            )?;
        }
        accel.set_instance(id, entity.transform.to_cols_array_2d(), entity.slot);

        debug_assert!(
            dirty.is_empty(),
            "unconsumed dirty bits {:?} for {}",
            dirty,
            id
        );
        entity.state = SyncState::Synced;
        Ok(())
    }

    /// Scene removal notification: release everything the entity owns and
    /// make its state terminal.
    pub fn remove_entity(&mut self, id: &EntityId) -> RenderResult<()> {
        let Self {
            entities,
            pools,
            backend,
            accel,
            tracker,
            ..
        } = self;

        let entity = entities.get_mut(id).ok_or_else(|| {
            RenderError::invalid_state(format!("remove of unknown entity {}", id))
        })?;
        if entity.state == SyncState::Finalized {
            return Err(RenderError::invalid_state(format!(
                "remove of already finalized entity {}",
                id
            )));
        }

        if let Some(handle) = entity.index_region.take() {
            pools.indices.release(handle)?;
        }
        if let Some(handle) = entity.position_region.take() {
            pools.positions.release(handle)?;
        }
        if let Some(handle) = entity.normal_region.take() {
            pools.normals.release(handle)?;
        }
        if let Some(handle) = entity.texcoord_region.take() {
            pools.texcoords.release(handle)?;
        }
        if let Some(handle) = entity.instance_region.take() {
            pools.instances.release(handle)?;
        }

        accel.remove_entity(backend, id);
        tracker.forget(id);

        entity.primvars.clear();
        entity.points.clear();
        entity.computed_normals.clear();
        entity.adjacency = None;
        entity.state = SyncState::Finalized;
        log::debug!("finalized {}", id);
        Ok(())
    }
}

static EMPTY_TOPOLOGY: MeshTopology = MeshTopology {
    face_vertex_counts: Vec::new(),
    face_vertex_indices: Vec::new(),
};

fn topology_of(entity: &MeshEntity) -> &MeshTopology {
    entity.topology.as_deref().unwrap_or(&EMPTY_TOPOLOGY)
}

/// Commit one category: write a fresh region, then swap the handle. The old
/// region is released into the retirement queue only after the new one is
/// fully written, so a failure leaves the previous GPU data intact.
fn upload_region<T: Pod>(
    pool: &mut DeviceMemoryPool<T>,
    backend: &mut dyn RenderBackend,
    slot: &mut Option<MemoryHandle>,
    data: &[T],
) -> RenderResult<()> {
    let fresh = pool.acquire(backend, data.len().max(1) as u64)?;
    if !data.is_empty() {
        if let Err(err) = pool.write(backend, fresh, 0, data) {
            let _ = pool.release(fresh);
            return Err(err);
        }
    }
    if let Some(old) = slot.replace(fresh) {
        pool.release(old)?;
    }
    Ok(())
}

/// Gather a face-varying primvar into per-triangle-corner order.
fn flatten_face_varying<T: Copy>(corners: &[u32], values: &[T]) -> RenderResult<Vec<T>> {
    let mut out = Vec::with_capacity(corners.len());
    for &corner in corners {
        let value = values.get(corner as usize).ok_or_else(|| {
            RenderError::device(format!(
                "face-varying primvar has {} values but corner {} is referenced",
                values.len(),
                corner
            ))
        })?;
        out.push(*value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_data_layout_matches_gpu_struct() {
        assert_eq!(std::mem::size_of::<InstanceData>(), 80);
        assert_eq!(std::mem::align_of::<InstanceData>(), 4);
    }

    #[test]
    fn flatten_face_varying_gathers_in_corner_order() {
        let corners = [2u32, 0, 1];
        let values = [[0.0f32, 0.0], [0.5, 0.5], [1.0, 1.0]];
        let flat = flatten_face_varying(&corners, &values).unwrap();
        assert_eq!(flat, vec![[1.0, 1.0], [0.0, 0.0], [0.5, 0.5]]);
    }

    #[test]
    fn flatten_face_varying_rejects_short_data() {
        let corners = [0u32, 3];
        let values = [[0.0f32, 0.0]];
        assert!(flatten_face_varying(&corners, &values).is_err());
    }
}

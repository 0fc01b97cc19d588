// src/sync/mod.rs
// The sync engine: translates scene-delegate state into GPU-resident
// geometry through the typed memory pools, keeps acceleration structures
// current, and drives the frame clock that retires released GPU regions.

pub mod dirty;
pub mod mesh;
pub mod primvar;

pub use dirty::{DirtyBits, DirtyTracker};
pub use mesh::{InstanceData, MeshEntity, SyncState};
pub use primvar::PrimvarCache;

use crate::accel::AccelManager;
use crate::error::RenderResult;
use crate::material::{NullEmitter, ShadingEmitter};
use crate::memory::DeviceMemoryPool;
use crate::rhi::{FenceId, RenderBackend};
use crate::scene::EntityId;
use std::collections::{HashMap, VecDeque};

/// Engine configuration.
#[derive(Clone, Copy, Debug)]
pub struct SyncConfig {
    /// Frames the GPU may run behind before we warn; released pool regions
    /// re-enter circulation only after their frame's fence signals.
    pub pipeline_depth: usize,
    /// Initial per-pool capacity in elements.
    pub initial_pool_capacity: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: 2,
            initial_pool_capacity: 1024,
        }
    }
}

/// The typed pools geometry categories upload through. Column-wise: one pool
/// per attribute category, so a transform-only change never touches vertex
/// data.
pub struct GeometryPools {
    pub indices: DeviceMemoryPool<u32>,
    pub positions: DeviceMemoryPool<[f32; 3]>,
    pub normals: DeviceMemoryPool<[f32; 3]>,
    pub texcoords: DeviceMemoryPool<[f32; 2]>,
    pub instances: DeviceMemoryPool<InstanceData>,
}

impl GeometryPools {
    fn new(backend: &mut dyn RenderBackend, capacity: u64) -> RenderResult<Self> {
        Ok(Self {
            indices: DeviceMemoryPool::new(backend, "mesh-indices", capacity)?,
            positions: DeviceMemoryPool::new(backend, "mesh-positions", capacity)?,
            normals: DeviceMemoryPool::new(backend, "mesh-normals", capacity)?,
            texcoords: DeviceMemoryPool::new(backend, "mesh-texcoords", capacity)?,
            instances: DeviceMemoryPool::new(backend, "mesh-instances", capacity.min(256))?,
        })
    }

    fn begin_frame(&mut self, frame: u64) {
        self.indices.begin_frame(frame);
        self.positions.begin_frame(frame);
        self.normals.begin_frame(frame);
        self.texcoords.begin_frame(frame);
        self.instances.begin_frame(frame);
    }

    fn retire_through(&mut self, backend: &mut dyn RenderBackend, completed_frame: u64) {
        self.indices.retire_through(backend, completed_frame);
        self.positions.retire_through(backend, completed_frame);
        self.normals.retire_through(backend, completed_frame);
        self.texcoords.retire_through(backend, completed_frame);
        self.instances.retire_through(backend, completed_frame);
    }

    fn destroy(self, backend: &mut dyn RenderBackend) {
        self.indices.destroy(backend);
        self.positions.destroy(backend);
        self.normals.destroy(backend);
        self.texcoords.destroy(backend);
        self.instances.destroy(backend);
    }
}

/// Retained sync engine: owns the backend, the entity table, the pools, and
/// the acceleration structure manager.
///
/// Single-threaded by design; GPU completion is observed through fences
/// polled at `begin_frame`, never by blocking.
pub struct RenderSync<B: RenderBackend> {
    backend: B,
    config: SyncConfig,
    frame: u64,
    completed_frame: u64,
    frame_fences: VecDeque<(u64, FenceId)>,
    entities: HashMap<EntityId, MeshEntity>,
    pools: GeometryPools,
    accel: AccelManager,
    emitter: Box<dyn ShadingEmitter>,
    tracker: DirtyTracker,
    next_slot: u32,
    material_slots: HashMap<EntityId, u32>,
}

impl<B: RenderBackend> RenderSync<B> {
    pub fn new(backend: B) -> RenderResult<Self> {
        Self::with_config(backend, SyncConfig::default())
    }

    pub fn with_config(mut backend: B, config: SyncConfig) -> RenderResult<Self> {
        let pools = GeometryPools::new(&mut backend, config.initial_pool_capacity)?;
        Ok(Self {
            backend,
            config,
            frame: 0,
            completed_frame: 0,
            frame_fences: VecDeque::new(),
            entities: HashMap::new(),
            pools,
            accel: AccelManager::new(),
            emitter: Box::new(NullEmitter),
            tracker: DirtyTracker::new(),
            next_slot: 0,
            material_slots: HashMap::new(),
        })
    }

    /// Install the shading-graph emitter notified of material rebinds.
    pub fn set_emitter(&mut self, emitter: Box<dyn ShadingEmitter>) {
        self.emitter = emitter;
    }

    /// Application-driven invalidation, unioned with the delegate's reported
    /// mask at the next `sync_entity`.
    pub fn mark_dirty(&mut self, id: &EntityId, bits: DirtyBits) {
        self.tracker.mark(id, bits);
    }

    /// Open a sync cycle: advance the frame clock, poll in-flight frame
    /// fences, and feed retirement into the pools.
    pub fn begin_frame(&mut self) {
        self.frame += 1;

        while let Some(&(frame, fence)) = self.frame_fences.front() {
            if !self.backend.fence_signaled(fence) {
                break;
            }
            self.backend.destroy_fence(fence);
            self.frame_fences.pop_front();
            self.completed_frame = frame;
        }

        self.pools
            .retire_through(&mut self.backend, self.completed_frame);
        self.pools.begin_frame(self.frame);

        if self.frame_fences.len() > self.config.pipeline_depth {
            log::debug!(
                "GPU is {} frames behind (pipeline depth {})",
                self.frame_fences.len(),
                self.config.pipeline_depth
            );
        }
    }

    /// Close the cycle: batch-flush the top-level acceleration structure and
    /// arm this frame's retirement fence.
    pub fn end_frame(&mut self) -> RenderResult<()> {
        self.accel.flush(&mut self.backend)?;

        let fence = self.backend.create_fence();
        self.backend.signal_fence(fence);
        self.frame_fences.push_back((self.frame, fence));
        Ok(())
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Last frame whose fence has signaled.
    pub fn completed_frame(&self) -> u64 {
        self.completed_frame
    }

    pub fn entity(&self, id: &EntityId) -> Option<&MeshEntity> {
        self.entities.get(id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn pools(&self) -> &GeometryPools {
        &self.pools
    }

    pub fn accel(&self) -> &AccelManager {
        &self.accel
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Tear everything down, returning the backend.
    pub fn destroy(mut self) -> B {
        let ids: Vec<EntityId> = self.entities.keys().cloned().collect();
        for id in &ids {
            // Finalized entities are already empty; ignore their errors.
            let _ = self.remove_entity(id);
        }

        let Self {
            mut backend,
            mut accel,
            pools,
            mut frame_fences,
            ..
        } = self;
        accel.destroy(&mut backend);
        pools.destroy(&mut backend);
        for (_, fence) in frame_fences.drain(..) {
            backend.destroy_fence(fence);
        }
        backend
    }
}

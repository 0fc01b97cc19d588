//! Recording backend for tests.
//!
//! Buffers live in host memory, fences signal only when the test says GPU
//! work completed, and every trait call is counted so tests can assert which
//! categories of GPU state a sync actually touched.

use super::{BlasGeometry, BlasId, BufferDesc, BufferId, BufferKind, FenceId, RenderBackend, TlasId, TlasInstance};
use crate::error::{RenderError, RenderResult};
use crate::stats::STAT_LANES;
use std::collections::HashMap;

/// Per-method call counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MockCallCounts {
    pub buffer_creates: u32,
    pub buffer_destroys: u32,
    pub buffer_writes: u32,
    pub buffer_copies: u32,
    pub buffer_zeroes: u32,
    pub buffer_reads: u32,
    pub fence_creates: u32,
    pub fence_signals: u32,
    pub blas_builds: u32,
    pub blas_refits: u32,
    pub blas_destroys: u32,
    pub tlas_builds: u32,
    pub tlas_destroys: u32,
    pub reductions: u32,
}

struct MockBuffer {
    label: String,
    kind: BufferKind,
    data: Vec<u8>,
    writes: u32,
}

struct MockFence {
    armed: bool,
    signaled: bool,
}

struct MockBlas {
    vertex_count: usize,
    triangle_count: usize,
}

/// Host-memory backend with manual fence control.
#[derive(Default)]
pub struct MockBackend {
    next_id: u64,
    buffers: HashMap<u64, MockBuffer>,
    fences: HashMap<u64, MockFence>,
    blas: HashMap<u64, MockBlas>,
    tlas: HashMap<u64, Vec<TlasInstance>>,
    counts: MockCallCounts,
    budget: Option<u64>,
    allocated: u64,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail buffer creation with `OutOfMemory` once `budget` bytes are live.
    pub fn with_budget(budget: u64) -> Self {
        Self {
            budget: Some(budget),
            ..Self::default()
        }
    }

    /// Mark all armed fences signaled, as if the GPU drained its queue.
    pub fn complete_gpu_work(&mut self) {
        for fence in self.fences.values_mut() {
            if fence.armed {
                fence.signaled = true;
            }
        }
    }

    pub fn counts(&self) -> &MockCallCounts {
        &self.counts
    }

    /// Number of `write_buffer` calls that targeted `buffer`.
    pub fn write_count(&self, buffer: BufferId) -> u32 {
        self.buffers.get(&buffer.0).map(|b| b.writes).unwrap_or(0)
    }

    pub fn buffer_data(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|b| b.data.as_slice())
    }

    pub fn buffer_label(&self, buffer: BufferId) -> Option<&str> {
        self.buffers.get(&buffer.0).map(|b| b.label.as_str())
    }

    pub fn buffer_kind(&self, buffer: BufferId) -> Option<BufferKind> {
        self.buffers.get(&buffer.0).map(|b| b.kind)
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_blas_count(&self) -> usize {
        self.blas.len()
    }

    pub fn live_tlas_count(&self) -> usize {
        self.tlas.len()
    }

    /// Instances of the most recently built TLAS, if one is live.
    pub fn tlas_instances(&self, tlas: TlasId) -> Option<&[TlasInstance]> {
        self.tlas.get(&tlas.0).map(|v| v.as_slice())
    }

    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn buffer_mut(&mut self, buffer: BufferId) -> RenderResult<&mut MockBuffer> {
        self.buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| RenderError::stale_handle(format!("buffer {:?}", buffer)))
    }
}

impl RenderBackend for MockBackend {
    fn create_buffer(&mut self, desc: &BufferDesc) -> RenderResult<BufferId> {
        self.counts.buffer_creates += 1;

        if let Some(budget) = self.budget {
            if self.allocated + desc.size > budget {
                return Err(RenderError::out_of_memory(format!(
                    "mock budget exceeded: {} + {} > {}",
                    self.allocated, desc.size, budget
                )));
            }
        }

        let id = self.fresh_id();
        self.allocated += desc.size;
        self.buffers.insert(
            id,
            MockBuffer {
                label: desc.label.to_string(),
                kind: desc.kind,
                data: vec![0u8; desc.size as usize],
                writes: 0,
            },
        );
        Ok(BufferId(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.counts.buffer_destroys += 1;
        if let Some(b) = self.buffers.remove(&buffer.0) {
            self.allocated -= b.data.len() as u64;
        }
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> RenderResult<()> {
        self.counts.buffer_writes += 1;
        let b = self.buffer_mut(buffer)?;
        let end = offset as usize + data.len();
        if end > b.data.len() {
            return Err(RenderError::device(format!(
                "write of {} bytes at {} exceeds buffer '{}' ({} bytes)",
                data.len(),
                offset,
                b.label,
                b.data.len()
            )));
        }
        b.data[offset as usize..end].copy_from_slice(data);
        b.writes += 1;
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) -> RenderResult<()> {
        self.counts.buffer_copies += 1;

        let chunk = {
            let s = self
                .buffers
                .get(&src.0)
                .ok_or_else(|| RenderError::stale_handle(format!("buffer {:?}", src)))?;
            let end = (src_offset + size) as usize;
            if end > s.data.len() {
                return Err(RenderError::device("copy source out of range"));
            }
            s.data[src_offset as usize..end].to_vec()
        };

        let d = self.buffer_mut(dst)?;
        let end = (dst_offset + size) as usize;
        if end > d.data.len() {
            return Err(RenderError::device("copy destination out of range"));
        }
        d.data[dst_offset as usize..end].copy_from_slice(&chunk);
        Ok(())
    }

    fn zero_buffer(&mut self, buffer: BufferId) -> RenderResult<()> {
        self.counts.buffer_zeroes += 1;
        let b = self.buffer_mut(buffer)?;
        b.data.fill(0);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferId, out: &mut [u8]) -> RenderResult<()> {
        self.counts.buffer_reads += 1;
        let b = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| RenderError::stale_handle(format!("buffer {:?}", buffer)))?;
        if out.len() > b.data.len() {
            return Err(RenderError::device("readback larger than buffer"));
        }
        out.copy_from_slice(&b.data[..out.len()]);
        Ok(())
    }

    fn create_fence(&mut self) -> FenceId {
        self.counts.fence_creates += 1;
        let id = self.fresh_id();
        self.fences.insert(
            id,
            MockFence {
                armed: false,
                signaled: false,
            },
        );
        FenceId(id)
    }

    fn signal_fence(&mut self, fence: FenceId) {
        self.counts.fence_signals += 1;
        if let Some(f) = self.fences.get_mut(&fence.0) {
            f.armed = true;
        }
    }

    fn fence_signaled(&mut self, fence: FenceId) -> bool {
        self.fences.get(&fence.0).map(|f| f.signaled).unwrap_or(false)
    }

    fn destroy_fence(&mut self, fence: FenceId) {
        self.fences.remove(&fence.0);
    }

    fn build_blas(&mut self, geometry: &BlasGeometry) -> RenderResult<BlasId> {
        self.counts.blas_builds += 1;
        let id = self.fresh_id();
        self.blas.insert(
            id,
            MockBlas {
                vertex_count: geometry.positions.len(),
                triangle_count: geometry.triangles.len(),
            },
        );
        Ok(BlasId(id))
    }

    fn refit_blas(&mut self, blas: BlasId, positions: &[[f32; 3]]) -> RenderResult<()> {
        self.counts.blas_refits += 1;
        let entry = self
            .blas
            .get(&blas.0)
            .ok_or_else(|| RenderError::stale_handle(format!("blas {:?}", blas)))?;
        if entry.vertex_count != positions.len() {
            return Err(RenderError::device(format!(
                "refit with {} positions against a {}-vertex structure",
                positions.len(),
                entry.vertex_count
            )));
        }
        Ok(())
    }

    fn destroy_blas(&mut self, blas: BlasId) {
        self.counts.blas_destroys += 1;
        self.blas.remove(&blas.0);
    }

    fn build_tlas(&mut self, instances: &[TlasInstance]) -> RenderResult<TlasId> {
        self.counts.tlas_builds += 1;
        for instance in instances {
            if !self.blas.contains_key(&instance.blas.0) {
                return Err(RenderError::stale_handle(format!(
                    "tlas references destroyed {:?}",
                    instance.blas
                )));
            }
        }
        let id = self.fresh_id();
        self.tlas.insert(id, instances.to_vec());
        Ok(TlasId(id))
    }

    fn destroy_tlas(&mut self, tlas: TlasId) {
        self.counts.tlas_destroys += 1;
        self.tlas.remove(&tlas.0);
    }

    fn dispatch_stats_reduction(
        &mut self,
        counters: BufferId,
        pixel_count: u32,
        result: BufferId,
    ) -> RenderResult<()> {
        self.counts.reductions += 1;

        let totals = {
            let src = self
                .buffers
                .get(&counters.0)
                .ok_or_else(|| RenderError::stale_handle(format!("buffer {:?}", counters)))?;
            let needed = pixel_count as usize * STAT_LANES;
            if src.data.len() / 4 < needed {
                return Err(RenderError::device("counter buffer smaller than frame"));
            }

            let mut totals = [0u32; STAT_LANES];
            for (index, chunk) in src.data.chunks_exact(4).take(needed).enumerate() {
                let value = u32::from_le_bytes(chunk.try_into().expect("4-byte chunk"));
                totals[index % STAT_LANES] = totals[index % STAT_LANES].wrapping_add(value);
            }
            totals
        };

        let bytes: &[u8] = bytemuck::cast_slice(&totals);
        let dst = self.buffer_mut(result)?;
        if dst.data.len() < bytes.len() {
            return Err(RenderError::device("reduction result buffer too small"));
        }
        dst.data[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_desc(label: &str, size: u64) -> BufferDesc<'_> {
        BufferDesc {
            label,
            size,
            kind: BufferKind::Storage,
        }
    }

    #[test]
    fn budget_produces_out_of_memory() {
        let mut backend = MockBackend::with_budget(128);
        assert!(backend.create_buffer(&storage_desc("a", 64)).is_ok());
        let err = backend.create_buffer(&storage_desc("b", 128)).unwrap_err();
        assert!(matches!(err, RenderError::OutOfMemory(_)));
    }

    #[test]
    fn fences_need_explicit_completion() {
        let mut backend = MockBackend::new();
        let fence = backend.create_fence();
        assert!(!backend.fence_signaled(fence));

        backend.signal_fence(fence);
        assert!(!backend.fence_signaled(fence));

        backend.complete_gpu_work();
        assert!(backend.fence_signaled(fence));
    }

    #[test]
    fn refit_rejects_count_mismatch() {
        let mut backend = MockBackend::new();
        let positions = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let triangles = [[0u32, 1, 2]];
        let blas = backend
            .build_blas(&BlasGeometry {
                positions: &positions,
                triangles: &triangles,
            })
            .unwrap();

        assert!(backend.refit_blas(blas, &positions).is_ok());
        assert!(backend.refit_blas(blas, &positions[..2]).is_err());
    }

    #[test]
    fn reduction_sums_lanes() {
        let mut backend = MockBackend::new();
        let counters = backend
            .create_buffer(&storage_desc("counters", (2 * STAT_LANES * 4) as u64))
            .unwrap();
        let result = backend
            .create_buffer(&storage_desc("result", (STAT_LANES * 4) as u64))
            .unwrap();

        let records: [u32; 8] = [1, 2, 3, 4, 10, 20, 30, 40];
        backend
            .write_buffer(counters, 0, bytemuck::cast_slice(&records))
            .unwrap();
        backend.dispatch_stats_reduction(counters, 2, result).unwrap();

        let mut totals = [0u32; STAT_LANES];
        backend
            .read_buffer(result, bytemuck::cast_slice_mut(&mut totals))
            .unwrap();
        assert_eq!(totals, [11, 22, 33, 44]);
    }
}

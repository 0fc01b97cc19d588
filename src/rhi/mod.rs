// src/rhi/mod.rs
// Narrow render-backend contract the sync core depends on: buffers, fences,
// acceleration structures, and the statistics reduction dispatch. The core
// never talks to a graphics API directly; it goes through this trait so tests
// run against the mock and production runs against the wgpu adapter.

pub mod bvh;
pub mod mock;
pub mod wgpu_backend;

pub use mock::MockBackend;
pub use wgpu_backend::WgpuBackend;

use crate::error::RenderResult;

/// Opaque buffer token.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BufferId(pub u64);

/// Opaque fence token. Signals when GPU work submitted before the signal
/// request has completed; observed only by non-blocking polls.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FenceId(pub u64);

/// Opaque bottom-level acceleration structure token.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BlasId(pub u64);

/// Opaque top-level acceleration structure token.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TlasId(pub u64);

/// What a buffer is for. Kept coarse on purpose; the adapter maps this to
/// API-specific usage flags.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BufferKind {
    /// Device-local storage read by render/compute passes.
    Storage,
    /// CPU-mappable target for readback copies.
    Readback,
}

/// Buffer creation request.
#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub kind: BufferKind,
}

/// Triangle geometry a bottom-level structure is built over.
#[derive(Clone, Copy, Debug)]
pub struct BlasGeometry<'a> {
    pub positions: &'a [[f32; 3]],
    pub triangles: &'a [[u32; 3]],
}

/// One entry of a top-level structure build.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct TlasInstance {
    pub blas: BlasId,
    pub transform: [[f32; 4]; 4],
    /// Slot the renderer uses to look up per-instance data.
    pub instance_slot: u32,
}

/// The backend contract.
///
/// Everything here is non-blocking from the caller's point of view except
/// `read_buffer`, which the core only issues after the guarding fence has
/// signaled (the data is already resident by then).
pub trait RenderBackend {
    fn create_buffer(&mut self, desc: &BufferDesc) -> RenderResult<BufferId>;

    fn destroy_buffer(&mut self, buffer: BufferId);

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> RenderResult<()>;

    fn copy_buffer(
        &mut self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) -> RenderResult<()>;

    /// Fill an entire buffer with zeroes.
    fn zero_buffer(&mut self, buffer: BufferId) -> RenderResult<()>;

    /// Copy buffer contents to CPU memory. Only legal once the fence guarding
    /// the producing work has signaled.
    fn read_buffer(&mut self, buffer: BufferId, out: &mut [u8]) -> RenderResult<()>;

    fn create_fence(&mut self) -> FenceId;

    /// Arm the fence: it signals once all GPU work submitted so far retires.
    fn signal_fence(&mut self, fence: FenceId);

    /// Non-blocking completion poll.
    fn fence_signaled(&mut self, fence: FenceId) -> bool;

    fn destroy_fence(&mut self, fence: FenceId);

    fn build_blas(&mut self, geometry: &BlasGeometry) -> RenderResult<BlasId>;

    /// Update an existing structure in place for moved vertex positions.
    /// Must not allocate; position count must match the build.
    fn refit_blas(&mut self, blas: BlasId, positions: &[[f32; 3]]) -> RenderResult<()>;

    fn destroy_blas(&mut self, blas: BlasId);

    fn build_tlas(&mut self, instances: &[TlasInstance]) -> RenderResult<TlasId>;

    fn destroy_tlas(&mut self, tlas: TlasId);

    /// Dispatch the parallel reduction summing `pixel_count` per-pixel
    /// counter records in `counters` into one totals record in `result`.
    fn dispatch_stats_reduction(
        &mut self,
        counters: BufferId,
        pixel_count: u32,
        result: BufferId,
    ) -> RenderResult<()>;
}

//! trace3d — scene synchronization and GPU resource lifecycle core for a
//! wgpu path tracer.
//!
//! The crate sits between a retained-mode scene delegate and the GPU: it
//! classifies per-entity dirty state, pulls changed primvars through a
//! copy-on-write cache, uploads geometry through typed memory pools with
//! frame-keyed retirement, keeps bottom/top-level acceleration structures
//! current with a rebuild-vs-refit policy, and collects per-pixel path
//! tracing statistics with double-buffered fenced readback.
//!
//! Nothing here blocks: GPU completion is observed through fences polled at
//! frame boundaries.

pub mod accel;
pub mod error;
pub mod geometry;
pub mod material;
pub mod memory;
pub mod rhi;
pub mod scene;
pub mod stats;
pub mod sync;

pub use error::{RenderError, RenderResult};
pub use scene::{EntityId, SceneDelegate};
pub use sync::{DirtyBits, RenderSync, SyncConfig};

// src/stats/mod.rs
// Per-pixel path tracing statistics: double-buffered GPU counter collection
// with a parallel-reduction pass and asynchronous fenced readback. Purely
// advisory telemetry; nothing here ever blocks the render loop.

use crate::error::{RenderError, RenderResult};
use crate::rhi::{BufferDesc, BufferId, BufferKind, FenceId, RenderBackend};
use bytemuck::{Pod, Zeroable};

/// u32 lanes per pixel in the counter buffer.
pub const STAT_LANES: usize = 4;

/// Per-pixel counter record the tracing kernels write.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PixelCounters {
    pub visibility_rays: u32,
    pub closest_hit_rays: u32,
    pub path_vertices: u32,
    pub volume_lookups: u32,
}

/// Reduced frame statistics with derived averages.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stats {
    pub visibility_rays: u32,
    pub closest_hit_rays: u32,
    pub total_rays: u32,
    pub path_vertices: u32,
    pub volume_lookups: u32,
    pub avg_visibility_rays: f32,
    pub avg_closest_hit_rays: f32,
    pub avg_path_vertices: f32,
    pub avg_volume_lookups: f32,
    /// Average rays traced per path vertex.
    pub avg_rays_per_path: f32,
}

/// Collection state machine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StatsState {
    Idle,
    Collecting,
    Reducing,
    Available,
}

struct StatsFrame {
    counters: BufferId,
    result: BufferId,
    fence: Option<FenceId>,
}

struct PendingReadback {
    frame: usize,
    pixel_count: u32,
}

/// Double-buffered pixel statistics pipeline.
///
/// One buffer of the pair collects the current frame while the other drains
/// through reduction and readback; the pair swaps at `end_frame`, so the
/// buffer being read back is never the one being written.
pub struct PixelStats {
    enabled: bool,
    state: StatsState,
    frame_dim: (u32, u32),
    frames: [StatsFrame; 2],
    write_index: usize,
    pending: Option<PendingReadback>,
    stats: Stats,
    stats_valid: bool,
}

impl PixelStats {
    pub fn new(
        backend: &mut dyn RenderBackend,
        width: u32,
        height: u32,
    ) -> RenderResult<Self> {
        let frames = [
            Self::create_frame(backend, width, height, 0)?,
            Self::create_frame(backend, width, height, 1)?,
        ];
        Ok(Self {
            enabled: true,
            state: StatsState::Idle,
            frame_dim: (width, height),
            frames,
            write_index: 0,
            pending: None,
            stats: Stats::default(),
            stats_valid: false,
        })
    }

    fn create_frame(
        backend: &mut dyn RenderBackend,
        width: u32,
        height: u32,
        index: usize,
    ) -> RenderResult<StatsFrame> {
        let pixel_count = width as u64 * height as u64;
        let counters = backend.create_buffer(&BufferDesc {
            label: if index == 0 {
                "pixel-stats-counters-0"
            } else {
                "pixel-stats-counters-1"
            },
            size: pixel_count.max(1) * std::mem::size_of::<PixelCounters>() as u64,
            kind: BufferKind::Storage,
        })?;
        let result = backend.create_buffer(&BufferDesc {
            label: if index == 0 {
                "pixel-stats-result-0"
            } else {
                "pixel-stats-result-1"
            },
            size: (STAT_LANES * std::mem::size_of::<u32>()) as u64,
            kind: BufferKind::Storage,
        })?;
        Ok(StatsFrame {
            counters,
            result,
            fence: None,
        })
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> StatsState {
        self.state
    }

    /// Counter buffer the tracing kernels write this frame.
    pub fn counters_buffer(&self) -> BufferId {
        self.frames[self.write_index].counters
    }

    /// Start collecting for a frame of `width * height` pixels.
    ///
    /// Nested collection is a programming error; a pending readback from the
    /// previous frame is fine and keeps draining on the other buffer.
    pub fn begin_frame(
        &mut self,
        backend: &mut dyn RenderBackend,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.state == StatsState::Collecting {
            return Err(RenderError::invalid_state(
                "begin_frame while already collecting",
            ));
        }

        if self.frame_dim != (width, height) {
            self.recreate_buffers(backend, width, height)?;
        }

        backend.zero_buffer(self.frames[self.write_index].counters)?;
        self.state = StatsState::Collecting;
        Ok(())
    }

    /// Stop collecting: dispatch the reduction, arm the readback fence, and
    /// swap the buffer pair.
    pub fn end_frame(&mut self, backend: &mut dyn RenderBackend) -> RenderResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.state != StatsState::Collecting {
            return Err(RenderError::invalid_state("end_frame without begin_frame"));
        }

        let pixel_count = self.frame_dim.0 * self.frame_dim.1;
        let frame = &mut self.frames[self.write_index];
        backend.dispatch_stats_reduction(frame.counters, pixel_count, frame.result)?;

        if let Some(old) = frame.fence.take() {
            backend.destroy_fence(old);
        }
        let fence = backend.create_fence();
        backend.signal_fence(fence);
        frame.fence = Some(fence);

        self.pending = Some(PendingReadback {
            frame: self.write_index,
            pixel_count,
        });
        self.write_index ^= 1;
        self.state = StatsState::Reducing;
        Ok(())
    }

    /// Non-blocking poll for the latest reduced stats.
    ///
    /// Returns `None` while no reduction has landed yet; once a readback
    /// completes the most recent stats stay available.
    pub fn get_stats(&mut self, backend: &mut dyn RenderBackend) -> RenderResult<Option<Stats>> {
        if let Some(pending) = &self.pending {
            let frame = &self.frames[pending.frame];
            let fence = frame
                .fence
                .ok_or_else(|| RenderError::invalid_state("pending readback without fence"))?;
            if backend.fence_signaled(fence) {
                let mut totals = [0u32; STAT_LANES];
                backend.read_buffer(frame.result, bytemuck::cast_slice_mut(&mut totals))?;
                self.stats = compute_stats(&totals, pending.pixel_count);
                self.stats_valid = true;
                self.pending = None;
                if self.state == StatsState::Reducing {
                    self.state = StatsState::Available;
                }
            }
        }

        if self.stats_valid {
            Ok(Some(self.stats.clone()))
        } else {
            Ok(None)
        }
    }

    /// Tear down both frames.
    pub fn destroy(mut self, backend: &mut dyn RenderBackend) {
        for frame in &mut self.frames {
            backend.destroy_buffer(frame.counters);
            backend.destroy_buffer(frame.result);
            if let Some(fence) = frame.fence.take() {
                backend.destroy_fence(fence);
            }
        }
    }

    fn recreate_buffers(
        &mut self,
        backend: &mut dyn RenderBackend,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        if self.pending.take().is_some() {
            log::debug!("resized stats buffers with a readback in flight; frame dropped");
        }
        for (index, frame) in self.frames.iter_mut().enumerate() {
            backend.destroy_buffer(frame.counters);
            backend.destroy_buffer(frame.result);
            if let Some(fence) = frame.fence.take() {
                backend.destroy_fence(fence);
            }
            *frame = Self::create_frame(backend, width, height, index)?;
        }
        self.frame_dim = (width, height);
        Ok(())
    }
}

fn compute_stats(totals: &[u32], pixel_count: u32) -> Stats {
    let visibility_rays = totals[0];
    let closest_hit_rays = totals[1];
    let path_vertices = totals[2];
    let volume_lookups = totals[3];
    let total_rays = visibility_rays.wrapping_add(closest_hit_rays);

    let per_pixel = |value: u32| {
        if pixel_count > 0 {
            value as f32 / pixel_count as f32
        } else {
            0.0
        }
    };

    Stats {
        visibility_rays,
        closest_hit_rays,
        total_rays,
        path_vertices,
        volume_lookups,
        avg_visibility_rays: per_pixel(visibility_rays),
        avg_closest_hit_rays: per_pixel(closest_hit_rays),
        avg_path_vertices: per_pixel(path_vertices),
        avg_volume_lookups: per_pixel(volume_lookups),
        avg_rays_per_path: if path_vertices > 0 {
            total_rays as f32 / path_vertices as f32
        } else {
            0.0
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_guard_division_by_zero() {
        let stats = compute_stats(&[0, 0, 0, 0], 0);
        assert_eq!(stats.avg_rays_per_path, 0.0);
        assert_eq!(stats.avg_path_vertices, 0.0);

        let stats = compute_stats(&[6, 4, 5, 0], 2);
        assert_eq!(stats.total_rays, 10);
        assert_eq!(stats.avg_rays_per_path, 2.0);
        assert_eq!(stats.avg_visibility_rays, 3.0);
    }

    #[test]
    fn counter_record_is_tightly_packed() {
        assert_eq!(
            std::mem::size_of::<PixelCounters>(),
            STAT_LANES * std::mem::size_of::<u32>()
        );
    }
}

//! Typed arena allocator over one device buffer.
//!
//! Regions are handed out as stable, generation-checked handles. Freed
//! regions go through a retirement queue keyed by frame index: a region
//! released in frame N re-enters the free list only once the fence for frame
//! N has signaled, so the GPU can never observe a reused range. The same
//! deferral applies to the old backing buffer after growth.

use crate::error::{RenderError, RenderResult};
use crate::memory::metrics::global_metrics;
use crate::rhi::{BufferDesc, BufferId, BufferKind, RenderBackend};
use bytemuck::Pod;
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::ops::Range;

/// Smallest region granularity, in elements.
pub const MIN_CLASS_ELEMENTS: u64 = 16;

/// Stable token for a region inside a pool.
///
/// Valid between `acquire` and `release`; any use after release fails with
/// `StaleHandle`. Handles survive pool growth and `resize`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MemoryHandle {
    slot: u32,
    generation: u32,
}

/// Raw storage: a size-class-aligned span of the backing buffer.
#[derive(Clone, Copy, Debug)]
struct Storage {
    /// Offset in elements.
    offset: u64,
    /// Region spans `1 << class` elements.
    class: u32,
}

struct Region {
    storage: Storage,
    count: u64,
    generation: u32,
    live: bool,
}

/// Arena of typed GPU regions with free-after-retirement reuse.
pub struct DeviceMemoryPool<T: Pod> {
    label: &'static str,
    backing: BufferId,
    /// Capacity and cursor are in elements.
    capacity: u64,
    cursor: u64,
    regions: Vec<Region>,
    free_slots: Vec<u32>,
    /// Size class -> storage offsets ready for reuse.
    free_storage: HashMap<u32, Vec<u64>>,
    /// Released regions waiting for their frame to retire.
    retired_storage: VecDeque<(u64, Storage)>,
    /// Old backings waiting for in-flight frames that still reference them.
    retired_backings: VecDeque<(u64, BufferId)>,
    frame: u64,
    _marker: PhantomData<T>,
}

impl<T: Pod> DeviceMemoryPool<T> {
    pub fn new(
        backend: &mut dyn RenderBackend,
        label: &'static str,
        initial_capacity: u64,
    ) -> RenderResult<Self> {
        let capacity = initial_capacity.max(MIN_CLASS_ELEMENTS).next_power_of_two();
        let backing = backend.create_buffer(&BufferDesc {
            label,
            size: capacity * Self::element_size(),
            kind: BufferKind::Storage,
        })?;
        global_metrics().track_allocation(capacity * Self::element_size());

        Ok(Self {
            label,
            backing,
            capacity,
            cursor: 0,
            regions: Vec::new(),
            free_slots: Vec::new(),
            free_storage: HashMap::new(),
            retired_storage: VecDeque::new(),
            retired_backings: VecDeque::new(),
            frame: 0,
            _marker: PhantomData,
        })
    }

    const fn element_size() -> u64 {
        std::mem::size_of::<T>() as u64
    }

    fn class_for(count: u64) -> u32 {
        count
            .max(MIN_CLASS_ELEMENTS)
            .next_power_of_two()
            .trailing_zeros()
    }

    const fn class_elements(class: u32) -> u64 {
        1u64 << class
    }

    /// Record the frame index releases are keyed by.
    pub fn begin_frame(&mut self, frame: u64) {
        self.frame = frame;
    }

    /// Reserve a contiguous region of `count` elements.
    pub fn acquire(
        &mut self,
        backend: &mut dyn RenderBackend,
        count: u64,
    ) -> RenderResult<MemoryHandle> {
        let class = Self::class_for(count);
        let storage = self.take_storage(backend, class)?;

        if let Some(slot) = self.free_slots.pop() {
            let region = &mut self.regions[slot as usize];
            region.storage = storage;
            region.count = count;
            region.live = true;
            return Ok(MemoryHandle {
                slot,
                generation: region.generation,
            });
        }

        let slot = self.regions.len() as u32;
        self.regions.push(Region {
            storage,
            count,
            generation: 0,
            live: true,
        });
        Ok(MemoryHandle { slot, generation: 0 })
    }

    /// Return a region. The storage is reusable only after the current
    /// frame retires.
    pub fn release(&mut self, handle: MemoryHandle) -> RenderResult<()> {
        let frame = self.frame;
        let region = self.checked_region_mut(handle)?;
        region.live = false;
        region.generation = region.generation.wrapping_add(1);
        let storage = region.storage;

        self.retired_storage.push_back((frame, storage));
        self.free_slots.push(handle.slot);
        Ok(())
    }

    /// Grow or shrink a region, keeping the handle stable. Stays in place
    /// while the size class covers `new_count`; otherwise reallocates and
    /// copies the surviving prefix on the GPU.
    pub fn resize(
        &mut self,
        backend: &mut dyn RenderBackend,
        handle: MemoryHandle,
        new_count: u64,
    ) -> RenderResult<()> {
        let (old_storage, old_count) = {
            let region = self.checked_region(handle)?;
            (region.storage, region.count)
        };

        let new_class = Self::class_for(new_count);
        if new_class == old_storage.class {
            self.regions[handle.slot as usize].count = new_count;
            return Ok(());
        }

        let new_storage = self.take_storage(backend, new_class)?;
        let copy_elements = old_count.min(new_count);
        if copy_elements > 0 {
            backend.copy_buffer(
                self.backing,
                old_storage.offset * Self::element_size(),
                self.backing,
                new_storage.offset * Self::element_size(),
                copy_elements * Self::element_size(),
            )?;
        }

        let frame = self.frame;
        let region = &mut self.regions[handle.slot as usize];
        region.storage = new_storage;
        region.count = new_count;
        self.retired_storage.push_back((frame, old_storage));
        Ok(())
    }

    /// Upload elements into a region, starting at `element_offset`.
    pub fn write(
        &mut self,
        backend: &mut dyn RenderBackend,
        handle: MemoryHandle,
        element_offset: u64,
        data: &[T],
    ) -> RenderResult<()> {
        let region = self.checked_region(handle)?;
        if element_offset + data.len() as u64 > region.count {
            return Err(RenderError::device(format!(
                "write of {} elements at {} exceeds region of {} in '{}' pool",
                data.len(),
                element_offset,
                region.count,
                self.label
            )));
        }

        let byte_offset = (region.storage.offset + element_offset) * Self::element_size();
        backend.write_buffer(self.backing, byte_offset, bytemuck::cast_slice(data))
    }

    /// Move retired storage and backings whose frame has completed back into
    /// circulation.
    pub fn retire_through(&mut self, backend: &mut dyn RenderBackend, completed_frame: u64) {
        while let Some(&(frame, storage)) = self.retired_storage.front() {
            if frame > completed_frame {
                break;
            }
            self.retired_storage.pop_front();
            self.free_storage
                .entry(storage.class)
                .or_default()
                .push(storage.offset);
        }

        while let Some(&(frame, backing)) = self.retired_backings.front() {
            if frame > completed_frame {
                break;
            }
            self.retired_backings.pop_front();
            backend.destroy_buffer(backing);
        }
    }

    /// The backing buffer render passes bind.
    pub fn backing(&self) -> BufferId {
        self.backing
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn live_region_count(&self) -> usize {
        self.regions.iter().filter(|r| r.live).count()
    }

    /// Element count of a live region.
    pub fn count(&self, handle: MemoryHandle) -> RenderResult<u64> {
        Ok(self.checked_region(handle)?.count)
    }

    /// Byte span of a live region within the backing buffer.
    pub fn byte_range(&self, handle: MemoryHandle) -> RenderResult<Range<u64>> {
        let region = self.checked_region(handle)?;
        let start = region.storage.offset * Self::element_size();
        Ok(start..start + region.count * Self::element_size())
    }

    /// Tear down the pool, destroying the backing and anything still queued.
    pub fn destroy(mut self, backend: &mut dyn RenderBackend) {
        for (_, backing) in self.retired_backings.drain(..) {
            backend.destroy_buffer(backing);
        }
        backend.destroy_buffer(self.backing);
        global_metrics().track_free(self.capacity * Self::element_size());
    }

    fn take_storage(
        &mut self,
        backend: &mut dyn RenderBackend,
        class: u32,
    ) -> RenderResult<Storage> {
        if let Some(offset) = self.free_storage.get_mut(&class).and_then(Vec::pop) {
            return Ok(Storage { offset, class });
        }

        let size = Self::class_elements(class);
        if self.cursor + size > self.capacity {
            self.grow(backend, self.cursor + size)?;
        }

        let offset = self.cursor;
        self.cursor += size;
        Ok(Storage { offset, class })
    }

    /// Double the backing until `required_elements` fit, copying live
    /// content and deferring destruction of the old backing.
    fn grow(&mut self, backend: &mut dyn RenderBackend, required_elements: u64) -> RenderResult<()> {
        let mut new_capacity = self.capacity.max(MIN_CLASS_ELEMENTS);
        while new_capacity < required_elements {
            new_capacity *= 2;
        }

        let new_backing = backend.create_buffer(&BufferDesc {
            label: self.label,
            size: new_capacity * Self::element_size(),
            kind: BufferKind::Storage,
        })?;
        global_metrics().track_allocation(new_capacity * Self::element_size());

        if self.cursor > 0 {
            backend.copy_buffer(
                self.backing,
                0,
                new_backing,
                0,
                self.cursor * Self::element_size(),
            )?;
        }

        log::info!(
            "'{}' pool grew {} -> {} elements",
            self.label,
            self.capacity,
            new_capacity
        );

        global_metrics().track_free(self.capacity * Self::element_size());
        self.retired_backings.push_back((self.frame, self.backing));
        self.backing = new_backing;
        self.capacity = new_capacity;
        Ok(())
    }

    fn checked_region(&self, handle: MemoryHandle) -> RenderResult<&Region> {
        let region = self
            .regions
            .get(handle.slot as usize)
            .ok_or_else(|| self.stale(handle))?;
        if !region.live || region.generation != handle.generation {
            return Err(self.stale(handle));
        }
        Ok(region)
    }

    fn checked_region_mut(&mut self, handle: MemoryHandle) -> RenderResult<&mut Region> {
        let label = self.label;
        let region = self
            .regions
            .get_mut(handle.slot as usize)
            .ok_or_else(|| stale_handle_error(handle, label))?;
        if !region.live || region.generation != handle.generation {
            return Err(stale_handle_error(handle, label));
        }
        Ok(region)
    }

    fn stale(&self, handle: MemoryHandle) -> RenderError {
        stale_handle_error(handle, self.label)
    }
}

fn stale_handle_error(handle: MemoryHandle, label: &str) -> RenderError {
    RenderError::stale_handle(format!("{:?} in '{}' pool", handle, label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::MockBackend;

    fn ranges_overlap(a: &Range<u64>, b: &Range<u64>) -> bool {
        a.start < b.end && b.start < a.end
    }

    #[test]
    fn live_handles_never_overlap() {
        let mut backend = MockBackend::new();
        let mut pool = DeviceMemoryPool::<u32>::new(&mut backend, "test", 64).unwrap();

        let a = pool.acquire(&mut backend, 10).unwrap();
        let b = pool.acquire(&mut backend, 30).unwrap();
        let c = pool.acquire(&mut backend, 100).unwrap();

        let ra = pool.byte_range(a).unwrap();
        let rb = pool.byte_range(b).unwrap();
        let rc = pool.byte_range(c).unwrap();
        assert!(!ranges_overlap(&ra, &rb));
        assert!(!ranges_overlap(&ra, &rc));
        assert!(!ranges_overlap(&rb, &rc));
    }

    #[test]
    fn release_defers_reuse_until_retirement() {
        let mut backend = MockBackend::new();
        let mut pool = DeviceMemoryPool::<u32>::new(&mut backend, "test", 256).unwrap();

        pool.begin_frame(1);
        let a = pool.acquire(&mut backend, 32).unwrap();
        let a_range = pool.byte_range(a).unwrap();
        pool.release(a).unwrap();

        // Frame 1 has not retired: same-size acquire must not reuse.
        let b = pool.acquire(&mut backend, 32).unwrap();
        assert_ne!(pool.byte_range(b).unwrap(), a_range);

        // After frame 1 retires the freed storage is reissued.
        pool.retire_through(&mut backend, 1);
        let c = pool.acquire(&mut backend, 32).unwrap();
        assert_eq!(pool.byte_range(c).unwrap(), a_range);
    }

    #[test]
    fn stale_handle_is_rejected() {
        let mut backend = MockBackend::new();
        let mut pool = DeviceMemoryPool::<u32>::new(&mut backend, "test", 64).unwrap();

        let handle = pool.acquire(&mut backend, 8).unwrap();
        pool.release(handle).unwrap();

        assert!(matches!(
            pool.write(&mut backend, handle, 0, &[1, 2, 3]),
            Err(RenderError::StaleHandle(_))
        ));
        assert!(matches!(
            pool.release(handle),
            Err(RenderError::StaleHandle(_))
        ));
    }

    #[test]
    fn growth_copies_and_defers_old_backing() {
        let mut backend = MockBackend::new();
        let mut pool = DeviceMemoryPool::<u32>::new(&mut backend, "test", 16).unwrap();
        pool.begin_frame(3);

        let a = pool.acquire(&mut backend, 16).unwrap();
        pool.write(&mut backend, a, 0, &[7u32; 16]).unwrap();
        let first_backing = pool.backing();

        // Second region does not fit: backing doubles, content is copied.
        let _b = pool.acquire(&mut backend, 16).unwrap();
        assert_ne!(pool.backing(), first_backing);
        assert!(pool.capacity() >= 32);
        assert_eq!(backend.counts().buffer_copies, 1);

        // Old backing stays alive until frame 3 completes.
        assert_eq!(backend.live_buffer_count(), 2);
        pool.retire_through(&mut backend, 3);
        assert_eq!(backend.live_buffer_count(), 1);

        let data = backend.buffer_data(pool.backing()).unwrap();
        for chunk in data[..16 * 4].chunks_exact(4) {
            assert_eq!(u32::from_le_bytes(chunk.try_into().unwrap()), 7);
        }
    }

    #[test]
    fn resize_within_class_is_in_place() {
        let mut backend = MockBackend::new();
        let mut pool = DeviceMemoryPool::<u32>::new(&mut backend, "test", 64).unwrap();

        let handle = pool.acquire(&mut backend, 20).unwrap();
        let before = pool.byte_range(handle).unwrap().start;

        pool.resize(&mut backend, handle, 30).unwrap();
        assert_eq!(pool.byte_range(handle).unwrap().start, before);
        assert_eq!(pool.count(handle).unwrap(), 30);
        assert_eq!(backend.counts().buffer_copies, 0);
    }

    #[test]
    fn resize_across_class_copies_and_keeps_handle() {
        let mut backend = MockBackend::new();
        let mut pool = DeviceMemoryPool::<u32>::new(&mut backend, "test", 256).unwrap();

        let handle = pool.acquire(&mut backend, 16).unwrap();
        pool.write(&mut backend, handle, 0, &[9u32; 16]).unwrap();

        pool.resize(&mut backend, handle, 64).unwrap();
        assert_eq!(pool.count(handle).unwrap(), 64);
        assert_eq!(backend.counts().buffer_copies, 1);

        // Surviving prefix moved with the region.
        let range = pool.byte_range(handle).unwrap();
        let data = backend.buffer_data(pool.backing()).unwrap();
        let moved = &data[range.start as usize..range.start as usize + 16 * 4];
        for chunk in moved.chunks_exact(4) {
            assert_eq!(u32::from_le_bytes(chunk.try_into().unwrap()), 9);
        }
    }

    #[test]
    fn out_of_memory_propagates() {
        let mut backend = MockBackend::with_budget(256);
        let mut pool = DeviceMemoryPool::<u32>::new(&mut backend, "test", 16).unwrap();

        // Growth beyond the budget surfaces the device failure.
        let mut handles = Vec::new();
        let mut failed = false;
        for _ in 0..8 {
            match pool.acquire(&mut backend, 16) {
                Ok(h) => handles.push(h),
                Err(RenderError::OutOfMemory(_)) => {
                    failed = true;
                    break;
                }
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        assert!(failed, "budgeted backend should run out of memory");
    }

    #[test]
    fn write_bounds_are_checked() {
        let mut backend = MockBackend::new();
        let mut pool = DeviceMemoryPool::<u32>::new(&mut backend, "test", 64).unwrap();

        let handle = pool.acquire(&mut backend, 4).unwrap();
        assert!(pool.write(&mut backend, handle, 2, &[1, 2, 3]).is_err());
        assert!(pool.write(&mut backend, handle, 0, &[1, 2, 3, 4]).is_ok());
    }
}

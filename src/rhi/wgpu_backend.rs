//! wgpu adapter for the render backend contract.
//!
//! Acceleration structures are CPU-built BVHs uploaded into storage buffers
//! (wgpu exposes no ray-tracing API); refit rewrites node bounds in place.
//! Fences are completion flags armed through `Queue::on_submitted_work_done`
//! and observed by non-blocking `Device::poll` calls. The statistics
//! reduction is a WGSL compute pass.

use super::bvh::{build_bvh, refit_bvh, CpuBvh};
use super::{
    BlasGeometry, BlasId, BufferDesc, BufferId, BufferKind, FenceId, RenderBackend, TlasId,
    TlasInstance,
};
use crate::error::{RenderError, RenderResult};
use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use wgpu::util::DeviceExt;
use wgpu::{Buffer, BufferUsages, Device, Queue};

struct BufferEntry {
    buffer: Buffer,
    size: u64,
}

struct FenceEntry {
    flag: Arc<AtomicBool>,
}

struct BlasEntry {
    bvh: CpuBvh,
    triangles: Vec<[u32; 3]>,
    node_buffer: Buffer,
    #[allow(dead_code)]
    order_buffer: Buffer,
}

struct TlasEntry {
    #[allow(dead_code)]
    instance_buffer: Buffer,
    #[allow(dead_code)]
    instance_count: u32,
}

/// GPU instance record of a top-level build.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct TlasInstanceGpu {
    transform: [[f32; 4]; 4],
    /// Dense index into the per-build BLAS table.
    blas_index: u32,
    instance_slot: u32,
    _pad: [u32; 2],
}

struct ReducePipeline {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    params: Buffer,
}

/// Backend over a wgpu device/queue pair.
pub struct WgpuBackend {
    device: Arc<Device>,
    queue: Arc<Queue>,
    buffers: HashMap<u64, BufferEntry>,
    fences: HashMap<u64, FenceEntry>,
    blas: HashMap<u64, BlasEntry>,
    tlas: HashMap<u64, TlasEntry>,
    reduce: Option<ReducePipeline>,
    next_id: u64,
}

impl WgpuBackend {
    pub fn new(device: Arc<Device>, queue: Arc<Queue>) -> Self {
        Self {
            device,
            queue,
            buffers: HashMap::new(),
            fences: HashMap::new(),
            blas: HashMap::new(),
            tlas: HashMap::new(),
            reduce: None,
            next_id: 0,
        }
    }

    /// Acquire an adapter and device without a surface.
    pub fn create_headless() -> RenderResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| RenderError::device("no suitable GPU adapter"))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("trace3d-device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
            },
            None,
        ))
        .map_err(|err| RenderError::device(format!("request_device failed: {err}")))?;

        Ok(Self::new(Arc::new(device), Arc::new(queue)))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// The wgpu buffer behind an id, for bind-group assembly by the renderer.
    pub fn raw_buffer(&self, buffer: BufferId) -> Option<&Buffer> {
        self.buffers.get(&buffer.0).map(|entry| &entry.buffer)
    }

    /// BLAS node storage for the traversal shader.
    pub fn blas_nodes(&self, blas: BlasId) -> Option<&Buffer> {
        self.blas.get(&blas.0).map(|entry| &entry.node_buffer)
    }

    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn entry(&self, buffer: BufferId) -> RenderResult<&BufferEntry> {
        self.buffers
            .get(&buffer.0)
            .ok_or_else(|| RenderError::stale_handle(format!("buffer {:?}", buffer)))
    }

    fn usage_for(kind: BufferKind) -> BufferUsages {
        match kind {
            BufferKind::Storage => {
                BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC
            }
            BufferKind::Readback => BufferUsages::COPY_DST | BufferUsages::MAP_READ,
        }
    }

    fn ensure_reduce_pipeline(&mut self) {
        if self.reduce.is_none() {
            let shader = self
                .device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("stats-reduce"),
                    source: wgpu::ShaderSource::Wgsl(
                        include_str!("../shaders/stats_reduce.wgsl").into(),
                    ),
                });

            let layout = self
                .device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("stats-reduce-layout"),
                    entries: &[
                        wgpu::BindGroupLayoutEntry {
                            binding: 0,
                            visibility: wgpu::ShaderStages::COMPUTE,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Storage { read_only: true },
                                has_dynamic_offset: false,
                                min_binding_size: None,
                            },
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: 1,
                            visibility: wgpu::ShaderStages::COMPUTE,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Storage { read_only: false },
                                has_dynamic_offset: false,
                                min_binding_size: None,
                            },
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: 2,
                            visibility: wgpu::ShaderStages::COMPUTE,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Uniform,
                                has_dynamic_offset: false,
                                min_binding_size: None,
                            },
                            count: None,
                        },
                    ],
                });

            let pipeline_layout =
                self.device
                    .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                        label: Some("stats-reduce-pipeline-layout"),
                        bind_group_layouts: &[&layout],
                        push_constant_ranges: &[],
                    });

            let pipeline =
                self.device
                    .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                        label: Some("stats-reduce-pipeline"),
                        layout: Some(&pipeline_layout),
                        module: &shader,
                        entry_point: "reduce",
                    });

            let params = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("stats-reduce-params"),
                size: 16,
                usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });

            self.reduce = Some(ReducePipeline {
                pipeline,
                layout,
                params,
            });
        }
    }
}

impl RenderBackend for WgpuBackend {
    fn create_buffer(&mut self, desc: &BufferDesc) -> RenderResult<BufferId> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size: desc.size.max(4),
            usage: Self::usage_for(desc.kind),
            mapped_at_creation: false,
        });

        let id = self.fresh_id();
        self.buffers.insert(
            id,
            BufferEntry {
                buffer,
                size: desc.size.max(4),
            },
        );
        Ok(BufferId(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if let Some(entry) = self.buffers.remove(&buffer.0) {
            entry.buffer.destroy();
        }
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> RenderResult<()> {
        let entry = self.entry(buffer)?;
        if offset + data.len() as u64 > entry.size {
            return Err(RenderError::device(format!(
                "write of {} bytes at {} exceeds buffer of {}",
                data.len(),
                offset,
                entry.size
            )));
        }
        self.queue.write_buffer(&entry.buffer, offset, data);
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
        let src_entry = self.entry(src)?;
        let dst_entry = self.entry(dst)?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("trace3d-copy"),
            });
        encoder.copy_buffer_to_buffer(
            &src_entry.buffer,
            src_offset,
            &dst_entry.buffer,
            dst_offset,
            size,
        );
        self.queue.submit([encoder.finish()]);
        Ok(())
    }

    fn zero_buffer(&mut self, buffer: BufferId) -> RenderResult<()> {
        let entry = self.entry(buffer)?;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("trace3d-zero"),
            });
        encoder.clear_buffer(&entry.buffer, 0, None);
        self.queue.submit([encoder.finish()]);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferId, out: &mut [u8]) -> RenderResult<()> {
        let entry = self.entry(buffer)?;
        if out.len() as u64 > entry.size {
            return Err(RenderError::device("readback larger than buffer"));
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("trace3d-readback-staging"),
            size: out.len() as u64,
            usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("trace3d-readback"),
            });
        encoder.copy_buffer_to_buffer(&entry.buffer, 0, &staging, 0, out.len() as u64);
        self.queue.submit([encoder.finish()]);

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);

        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                return Err(RenderError::device(format!("map_async failed: {err:?}")))
            }
            Err(_) => return Err(RenderError::device("map_async callback dropped")),
        }

        let data = slice.get_mapped_range();
        out.copy_from_slice(&data[..out.len()]);
        drop(data);
        staging.unmap();
        Ok(())
    }

    fn create_fence(&mut self) -> FenceId {
        let id = self.fresh_id();
        self.fences.insert(
            id,
            FenceEntry {
                flag: Arc::new(AtomicBool::new(false)),
            },
        );
        FenceId(id)
    }

    fn signal_fence(&mut self, fence: FenceId) {
        if let Some(entry) = self.fences.get(&fence.0) {
            let flag = Arc::clone(&entry.flag);
            self.queue.on_submitted_work_done(move || {
                flag.store(true, Ordering::Release);
            });
        }
    }

    fn fence_signaled(&mut self, fence: FenceId) -> bool {
        let _ = self.device.poll(wgpu::Maintain::Poll);
        self.fences
            .get(&fence.0)
            .map(|entry| entry.flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn destroy_fence(&mut self, fence: FenceId) {
        self.fences.remove(&fence.0);
    }

    fn build_blas(&mut self, geometry: &BlasGeometry) -> RenderResult<BlasId> {
        let bvh = build_bvh(geometry.positions, geometry.triangles);

        let node_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("blas-nodes"),
                contents: bytemuck::cast_slice(&bvh.nodes),
                usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
            });
        const EMPTY_ORDER: [u8; 4] = [0; 4];
        let order_contents: &[u8] = if bvh.tri_order.is_empty() {
            &EMPTY_ORDER
        } else {
            bytemuck::cast_slice(&bvh.tri_order)
        };
        let order_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("blas-triangle-order"),
                contents: order_contents,
                usage: BufferUsages::STORAGE,
            });

        log::debug!(
            "built BLAS: {} triangles, {} nodes",
            geometry.triangles.len(),
            bvh.node_count()
        );

        let id = self.fresh_id();
        self.blas.insert(
            id,
            BlasEntry {
                bvh,
                triangles: geometry.triangles.to_vec(),
                node_buffer,
                order_buffer,
            },
        );
        Ok(BlasId(id))
    }

    fn refit_blas(&mut self, blas: BlasId, positions: &[[f32; 3]]) -> RenderResult<()> {
        let entry = self
            .blas
            .get_mut(&blas.0)
            .ok_or_else(|| RenderError::stale_handle(format!("blas {:?}", blas)))?;

        refit_bvh(&mut entry.bvh, positions, &entry.triangles);
        self.queue
            .write_buffer(&entry.node_buffer, 0, bytemuck::cast_slice(&entry.bvh.nodes));
        Ok(())
    }

    fn destroy_blas(&mut self, blas: BlasId) {
        if let Some(entry) = self.blas.remove(&blas.0) {
            entry.node_buffer.destroy();
            entry.order_buffer.destroy();
        }
    }

    fn build_tlas(&mut self, instances: &[TlasInstance]) -> RenderResult<TlasId> {
        // Dense per-build BLAS table; instances reference it by index.
        let mut table: Vec<BlasId> = Vec::new();
        let mut records: Vec<TlasInstanceGpu> = Vec::with_capacity(instances.len());
        for instance in instances {
            let blas_index = match table.iter().position(|&id| id == instance.blas) {
                Some(index) => index,
                None => {
                    table.push(instance.blas);
                    table.len() - 1
                }
            };
            records.push(TlasInstanceGpu {
                transform: instance.transform,
                blas_index: blas_index as u32,
                instance_slot: instance.instance_slot,
                _pad: [0; 2],
            });
        }

        for blas in &table {
            if !self.blas.contains_key(&blas.0) {
                return Err(RenderError::stale_handle(format!(
                    "tlas references destroyed {:?}",
                    blas
                )));
            }
        }

        let instance_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("tlas-instances"),
                contents: bytemuck::cast_slice(&records),
                usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
            });

        let id = self.fresh_id();
        self.tlas.insert(
            id,
            TlasEntry {
                instance_buffer,
                instance_count: instances.len() as u32,
            },
        );
        Ok(TlasId(id))
    }

    fn destroy_tlas(&mut self, tlas: TlasId) {
        self.tlas.remove(&tlas.0);
    }

    fn dispatch_stats_reduction(
        &mut self,
        counters: BufferId,
        pixel_count: u32,
        result: BufferId,
    ) -> RenderResult<()> {
        self.ensure_reduce_pipeline();

        let counters_entry = self.entry(counters)?;
        let result_entry = self.entry(result)?;
        let reduce = self.reduce.as_ref().expect("pipeline initialized above");

        self.queue.write_buffer(
            &reduce.params,
            0,
            bytemuck::cast_slice(&[pixel_count, 0u32, 0u32, 0u32]),
        );

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("stats-reduce-bind"),
            layout: &reduce.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: counters_entry.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: result_entry.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: reduce.params.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("stats-reduce"),
            });
        encoder.clear_buffer(&result_entry.buffer, 0, None);
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("stats-reduce-pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&reduce.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(pixel_count.div_ceil(256).max(1), 1, 1);
        }
        self.queue.submit([encoder.finish()]);
        Ok(())
    }
}

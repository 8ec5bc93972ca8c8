//! Billboards expanded on the GPU
//!
//! Two strategies share this drawer:
//!
//! - **Vertex shader**: the vertex shader builds the quad corners from raw
//!   particle fields. Main-memory particles are packed into a flat float
//!   buffer first; GPU-stored particles are read straight from their
//!   simulation buffer, drawn indirectly with the live count copied into an
//!   argument buffer by a small compute task.
//! - **Compute shader**: a compute task writes full vertex buffers per view
//!   from the GPU simulation buffer, then a plain indexed draw consumes them.

use crate::config::DrawCallSort;
use crate::render::api::{
    ComputeDispatch, DrawPrimitive, GpuBufferHandle, ParticleUniforms, VertexSemantic, VertexStream,
};
use crate::render::buffer_pool::{BufferError, MappedBuffer, MappedIndices, PooledBuffer};
use crate::render::drawers::additional_inputs::{AdditionalInputKind, SimDataLayout};
use crate::render::drawers::geometry::{pass_particles, sort_back_to_front, GeometryShape, QUAD_INDICES};
use crate::render::drawers::{geometry_can_render, DrawCallDesc, DrawContext, DrawerError, DrawerResult, DrawerStages};
use crate::render::frame_collector::DrawPass;
use crate::render::renderer_cache::BillboardingFlags;
use crate::simulation::{fields, FieldDefinition, GpuParticleStream, StorageClass};

/// Indirect indexed draw arguments: index count, instance count, first index,
/// base vertex, first instance
const INDIRECT_ARGS_WORDS: u32 = 5;
const INDIRECT_ARGS_STRIDE: u32 = INDIRECT_ARGS_WORDS * 4;

/// Where billboard corners are computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BillboardMode {
    /// Corners built in the vertex shader
    VertexShader,
    /// Vertex buffers written by a compute task
    ComputeShader,
}

/// Uniform offsets of a GPU stream, in floats
fn gpu_uniforms(stream: &GpuParticleStream, inputs: &[FieldDefinition]) -> ParticleUniforms {
    let mut uniforms = ParticleUniforms {
        positions_offset: stream.float_offset(fields::POSITION),
        sizes_offset: stream.float_offset(fields::SIZE),
        rotations_offset: stream.float_offset(fields::ROTATION),
        axis0s_offset: stream.float_offset(fields::AXIS0),
        axis1s_offset: stream.float_offset(fields::AXIS1),
        ..ParticleUniforms::default()
    };
    for input in inputs {
        let offset = stream.float_offset(&input.name);
        match AdditionalInputKind::classify(input) {
            Some(AdditionalInputKind::Color) => uniforms.colors_offset = offset,
            Some(AdditionalInputKind::EmissiveColor) => uniforms.emissive_colors_offset = offset,
            Some(AdditionalInputKind::AlphaCursor) => uniforms.alpha_cursors_offset = offset,
            Some(AdditionalInputKind::TextureId) => uniforms.texture_ids_offset = offset,
            Some(AdditionalInputKind::DynamicParameter(slot)) => {
                if let Some(dst) = uniforms.dyn_param_offsets.get_mut(slot as usize) {
                    *dst = offset;
                }
            }
            None => {}
        }
    }
    uniforms
}

fn sim_stream(buffer: GpuBufferHandle) -> VertexStream {
    VertexStream {
        semantic: VertexSemantic::SimulationData,
        buffer,
        offset_in_bytes: 0,
        stride: 4,
    }
}

#[derive(Debug, Default)]
struct IndexSet {
    view_index: u32,
    indices: PooledBuffer,
}

/// Compute-written vertex buffers of one view
#[derive(Debug, Default)]
struct ComputeOutputs {
    view_index: u32,
    positions: PooledBuffer,
    normals: PooledBuffer,
    tangents: PooledBuffer,
    uv0: PooledBuffer,
    indices: PooledBuffer,
}

#[derive(Debug, Default)]
struct Mapped {
    sim_data: Option<MappedBuffer<f32>>,
    indices: Vec<MappedIndices>,
}

/// GPU billboarding of one pass
#[derive(Debug)]
pub struct BillboardGpuDrawer {
    mode: BillboardMode,
    storage: StorageClass,
    flags: BillboardingFlags,
    layout: SimDataLayout,
    request_offsets: Vec<u32>,
    sim_data: PooledBuffer,
    index_sets: Vec<IndexSet>,
    indirect_args: PooledBuffer,
    outputs: Vec<ComputeOutputs>,
    mapped: Option<Mapped>,
}

impl BillboardGpuDrawer {
    /// Drawer using `mode`
    pub fn new(mode: BillboardMode) -> Self {
        Self {
            mode,
            storage: StorageClass::MainMemory,
            flags: BillboardingFlags::default(),
            layout: SimDataLayout::default(),
            request_offsets: Vec::new(),
            sim_data: PooledBuffer::new(),
            index_sets: Vec::new(),
            indirect_args: PooledBuffer::new(),
            outputs: Vec::new(),
            mapped: None,
        }
    }

    /// Billboarding strategy
    pub const fn mode(&self) -> BillboardMode {
        self.mode
    }

    fn views(ctx: &DrawContext<'_>) -> Vec<u32> {
        let views: Vec<u32> = ctx.sub_view.bb_views().iter().map(|v| v.view_index).collect();
        if views.is_empty() {
            vec![0]
        } else {
            views
        }
    }

    fn gpu_streams(pass: &DrawPass) -> impl Iterator<Item = (usize, &GpuParticleStream)> + '_ {
        pass.requests
            .iter()
            .enumerate()
            .filter_map(|(index, request)| request.request.stream.gpu().map(|stream| (index, stream)))
    }

    fn alloc_main_memory(&mut self, ctx: &mut DrawContext<'_>, pass: &DrawPass) -> DrawerResult<()> {
        let desc = ctx.desc(pass.leader())?;
        let count = pass.total_particle_count;
        let layout = SimDataLayout::billboard(pass.pages().next(), &desc.additional_inputs, count);
        let persistent = self.layout.signature() == layout.signature() && self.flags == desc.flags;
        let views = Self::views(ctx);
        let index_views = if desc.flags.need_sort { views } else { vec![views[0]] };
        let index_count = count
            .checked_mul(GeometryShape::Billboard.indices_per_particle())
            .ok_or(BufferError::SizeOverflow)?;

        let (pools, backend) = ctx.gpu()?;
        pools
            .vb_vertex_bb
            .allocate(backend, &mut self.sim_data, layout.float_count(), 4, persistent)?;
        while self.index_sets.len() > index_views.len() {
            if let Some(mut set) = self.index_sets.pop() {
                pools.ib.release(&mut set.indices);
            }
        }
        self.index_sets.resize_with(index_views.len(), IndexSet::default);
        for (set, view_index) in self.index_sets.iter_mut().zip(&index_views) {
            set.view_index = *view_index;
            pools.ib.allocate_indices(backend, &mut set.indices, index_count, persistent)?;
        }
        self.layout = layout;
        self.flags = desc.flags;
        Ok(())
    }

    fn alloc_gpu(&mut self, ctx: &mut DrawContext<'_>, pass: &DrawPass) -> DrawerResult<()> {
        let desc = ctx.desc(pass.leader())?;
        self.flags = desc.flags;
        let capacity = pass.total_particle_count;
        let index_count = capacity
            .checked_mul(GeometryShape::Billboard.indices_per_particle())
            .ok_or(BufferError::SizeOverflow)?;
        let vertex_count = capacity
            .checked_mul(GeometryShape::Billboard.vertices_per_particle())
            .ok_or(BufferError::SizeOverflow)?;
        let views = Self::views(ctx);
        let flags = self.flags;
        let (pools, backend) = ctx.gpu()?;

        match self.mode {
            BillboardMode::VertexShader => {
                let requests = pass.requests.len() as u32;
                pools.vb_gpu.allocate(
                    backend,
                    &mut self.indirect_args,
                    requests * INDIRECT_ARGS_WORDS,
                    4,
                    false,
                )?;
                // Requests share one unsorted quad index buffer sized for the largest
                let largest = Self::gpu_streams(pass)
                    .map(|(_, stream)| stream.particle_capacity)
                    .max()
                    .unwrap_or(0);
                self.index_sets.resize_with(1, IndexSet::default);
                pools
                    .ib
                    .allocate_indices(backend, &mut self.index_sets[0].indices, largest * 6, true)?;
            }
            BillboardMode::ComputeShader => {
                while self.outputs.len() > views.len() {
                    if let Some(mut outputs) = self.outputs.pop() {
                        for view in [&mut outputs.positions, &mut outputs.normals, &mut outputs.tangents, &mut outputs.uv0] {
                            pools.vb_gpu.release(view);
                        }
                        pools.ib_gpu.release(&mut outputs.indices);
                    }
                }
                self.outputs.resize_with(views.len(), ComputeOutputs::default);
                for (outputs, view_index) in self.outputs.iter_mut().zip(&views) {
                    outputs.view_index = *view_index;
                    pools.vb_gpu.allocate(backend, &mut outputs.positions, vertex_count, 16, false)?;
                    pools
                        .vb_gpu
                        .allocate_if(flags.has_normal, backend, &mut outputs.normals, vertex_count, 16, false)?;
                    pools
                        .vb_gpu
                        .allocate_if(flags.has_tangent, backend, &mut outputs.tangents, vertex_count, 16, false)?;
                    pools
                        .vb_gpu
                        .allocate_if(flags.has_uv, backend, &mut outputs.uv0, vertex_count, 8, false)?;
                    pools
                        .ib_gpu
                        .allocate_indices(backend, &mut outputs.indices, index_count, false)?;
                }
            }
        }
        Ok(())
    }

    fn emit_vertex_shader(&self, ctx: &mut DrawContext<'_>, pass: &DrawPass, call: &DrawCallDesc) -> DrawerResult<()> {
        let index_set = self
            .index_sets
            .iter()
            .find(|set| set.view_index == call.view_index)
            .or_else(|| self.index_sets.first())
            .ok_or(DrawerError::OutOfOrder("emit_draw_call"))?;
        let index_buffer = index_set.indices.handle().ok_or(BufferError::NotAllocated)?;
        let format = index_set.indices.index_format();

        if self.storage == StorageClass::Gpu {
            let args_buffer = self.indirect_args.handle().ok_or(BufferError::NotAllocated)?;
            let desc = ctx.desc(pass.leader())?;
            for (index, stream) in Self::gpu_streams(pass).filter(|(index, _)| call.requests.contains(index)) {
                let mut draw = ctx.draw_call(
                    pass,
                    call,
                    stream.particle_capacity,
                    vec![sim_stream(stream.simulation_buffer)],
                    DrawPrimitive::IndexedIndirect {
                        index_buffer,
                        format,
                        args_buffer,
                        args_offset_in_bytes: index as u32 * INDIRECT_ARGS_STRIDE,
                    },
                )?;
                draw.uniforms = ParticleUniforms {
                    draw_request_id: draw.uniforms.draw_request_id,
                    ..gpu_uniforms(stream, &desc.additional_inputs)
                };
                ctx.backend()?.submit_draw(draw)?;
            }
            return Ok(());
        }

        let sim_buffer = self.sim_data.handle().ok_or(BufferError::NotAllocated)?;
        let (Some(&first), Some(&last)) = (
            self.request_offsets.get(call.requests.start),
            self.request_offsets.get(call.requests.end),
        ) else {
            return Err(DrawerError::OutOfOrder("emit_draw_call"));
        };
        if last <= first {
            return Ok(());
        }
        let mut draw = ctx.draw_call(
            pass,
            call,
            last - first,
            vec![sim_stream(sim_buffer)],
            DrawPrimitive::Indexed {
                index_buffer,
                format,
                first_index: first * 6,
                index_count: (last - first) * 6,
            },
        )?;
        self.layout.apply(&mut draw.uniforms);
        draw.uniforms.has_sorted_indices = i32::from(self.flags.need_sort);
        ctx.backend()?.submit_draw(draw)?;
        Ok(())
    }

    fn emit_compute(&self, ctx: &mut DrawContext<'_>, pass: &DrawPass, call: &DrawCallDesc) -> DrawerResult<()> {
        let outputs = self
            .outputs
            .iter()
            .find(|outputs| outputs.view_index == call.view_index)
            .or_else(|| self.outputs.first())
            .ok_or(DrawerError::OutOfOrder("emit_draw_call"))?;
        let index_buffer = outputs.indices.handle().ok_or(BufferError::NotAllocated)?;
        let (Some(&first), Some(&last)) = (
            self.request_offsets.get(call.requests.start),
            self.request_offsets.get(call.requests.end),
        ) else {
            return Err(DrawerError::OutOfOrder("emit_draw_call"));
        };
        if last <= first {
            return Ok(());
        }
        let streams = Self::output_streams(outputs, 0);
        let draw = ctx.draw_call(
            pass,
            call,
            last - first,
            streams,
            DrawPrimitive::Indexed {
                index_buffer,
                format: outputs.indices.index_format(),
                first_index: first * 6,
                index_count: (last - first) * 6,
            },
        )?;
        ctx.backend()?.submit_draw(draw)?;
        Ok(())
    }

    fn output_streams(outputs: &ComputeOutputs, first_particle: u32) -> Vec<VertexStream> {
        [
            (VertexSemantic::Position, &outputs.positions),
            (VertexSemantic::Normal, &outputs.normals),
            (VertexSemantic::Tangent, &outputs.tangents),
            (VertexSemantic::Uv0, &outputs.uv0),
        ]
        .into_iter()
        .filter_map(|(semantic, view)| {
            view.handle().map(|buffer| VertexStream {
                semantic,
                buffer,
                offset_in_bytes: first_particle * 4 * view.stride(),
                stride: view.stride(),
            })
        })
        .collect()
    }
}

impl DrawerStages for BillboardGpuDrawer {
    fn can_render(&self, ctx: &DrawContext<'_>, pass: &DrawPass) -> bool {
        geometry_can_render(ctx, pass, true)
    }

    fn begin_frame(&mut self, ctx: &mut DrawContext<'_>, pass: &DrawPass) -> DrawerResult<()> {
        if self.storage != pass.storage {
            self.release(ctx);
        }
        if self.mode == BillboardMode::ComputeShader && pass.storage == StorageClass::MainMemory {
            return Err(DrawerError::Unsupported(
                "compute billboarding reads GPU-stored particles only".to_string(),
            ));
        }
        self.storage = pass.storage;
        self.request_offsets = pass.request_offsets();
        Ok(())
    }

    fn alloc_buffers(&mut self, ctx: &mut DrawContext<'_>, pass: &DrawPass) -> DrawerResult<()> {
        match self.storage {
            StorageClass::MainMemory => self.alloc_main_memory(ctx, pass),
            StorageClass::Gpu => self.alloc_gpu(ctx, pass),
        }
    }

    fn map_buffers(&mut self, ctx: &mut DrawContext<'_>, _pass: &DrawPass) -> DrawerResult<()> {
        if self.mode == BillboardMode::ComputeShader {
            return Ok(());
        }
        let (pools, _) = ctx.gpu()?;
        let mut mapped = Mapped::default();
        if self.storage == StorageClass::MainMemory {
            mapped.sim_data = Some(pools.vb_vertex_bb.map(&self.sim_data)?);
        }
        for set in &self.index_sets {
            mapped.indices.push(pools.ib.map_indices(&set.indices)?);
        }
        self.mapped = Some(mapped);
        Ok(())
    }

    fn fill_buffers(&mut self, ctx: &mut DrawContext<'_>, pass: &DrawPass) -> DrawerResult<()> {
        if self.mode == BillboardMode::ComputeShader {
            return Ok(());
        }
        let mapped = self.mapped.as_mut().ok_or(DrawerError::OutOfOrder("fill_buffers"))?;
        if let Some(sim_data) = mapped.sim_data.as_mut() {
            self.layout.fill(pass.pages(), sim_data.as_mut_slice());
        }

        let sort = self.flags.need_sort && self.storage == StorageClass::MainMemory;
        let centers: Vec<_> = if sort {
            let scale = ctx.sub_view.global_scale();
            pass_particles(pass)
                .map(|(page, index)| GeometryShape::Billboard.center(page, index, scale))
                .collect()
        } else {
            Vec::new()
        };
        let per_request = ctx.settings.draw_call_sort == DrawCallSort::Slices && self.flags.slicable;

        for (set, indices) in self.index_sets.iter().zip(mapped.indices.iter_mut()) {
            let particle_count = indices.len() / QUAD_INDICES.len();
            let view = ctx.sub_view.bb_views().iter().find(|v| v.view_index == set.view_index);
            let order: Vec<u32> = match view {
                Some(view) if sort => {
                    let offsets = per_request.then_some(self.request_offsets.as_slice());
                    sort_back_to_front(&centers, view, offsets)
                }
                _ => (0..particle_count as u32).collect(),
            };
            for (slot, particle) in order.iter().enumerate() {
                for (corner, offset) in QUAD_INDICES.iter().enumerate() {
                    indices.set(slot * QUAD_INDICES.len() + corner, particle * 4 + offset);
                }
            }
        }
        Ok(())
    }

    fn unmap_buffers(&mut self, ctx: &mut DrawContext<'_>, _pass: &DrawPass) -> DrawerResult<()> {
        let Some(mapped) = self.mapped.take() else {
            return Ok(());
        };
        let (pools, backend) = ctx.gpu()?;
        if let Some(sim_data) = mapped.sim_data {
            pools.vb_vertex_bb.unmap(backend, sim_data);
        }
        for indices in mapped.indices {
            pools.ib.unmap_indices(backend, indices);
        }
        Ok(())
    }

    fn launch_custom_tasks(&mut self, ctx: &mut DrawContext<'_>, pass: &DrawPass) -> DrawerResult<()> {
        if self.storage != StorageClass::Gpu {
            return Ok(());
        }
        let desc = ctx.desc(pass.leader())?;
        let backend = ctx.backend()?;
        match self.mode {
            BillboardMode::VertexShader => {
                let args_buffer = self.indirect_args.handle().ok_or(BufferError::NotAllocated)?;
                for (index, stream) in Self::gpu_streams(pass) {
                    backend.dispatch(&ComputeDispatch::CopySizeToIndirectArgs {
                        size_buffer: stream.size_buffer,
                        args_buffer,
                        args_offset_in_bytes: index as u32 * INDIRECT_ARGS_STRIDE,
                        indices_per_particle: 6,
                    })?;
                }
            }
            BillboardMode::ComputeShader => {
                for outputs in &self.outputs {
                    let index_buffer = outputs.indices.handle().ok_or(BufferError::NotAllocated)?;
                    for (index, stream) in Self::gpu_streams(pass) {
                        let first_particle = self.request_offsets.get(index).copied().unwrap_or(0);
                        backend.dispatch(&ComputeDispatch::BillboardParticles {
                            simulation_buffer: stream.simulation_buffer,
                            size_buffer: stream.size_buffer,
                            view_index: outputs.view_index,
                            uniforms: ParticleUniforms {
                                draw_request_id: index as i32,
                                ..gpu_uniforms(stream, &desc.additional_inputs)
                            },
                            outputs: Self::output_streams(outputs, first_particle),
                            index_buffer,
                            particle_capacity: stream.particle_capacity,
                        })?;
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_draw_call(&mut self, ctx: &mut DrawContext<'_>, pass: &DrawPass, desc: &DrawCallDesc) -> DrawerResult<()> {
        match self.mode {
            BillboardMode::VertexShader => self.emit_vertex_shader(ctx, pass, desc),
            BillboardMode::ComputeShader => self.emit_compute(ctx, pass, desc),
        }
    }

    fn abort(&mut self, ctx: &mut DrawContext<'_>) {
        self.mapped = None;
        self.layout = SimDataLayout::default();
        let Some(pools) = ctx.pools.as_deref_mut() else {
            return;
        };
        pools.vb_vertex_bb.unmap_view(&self.sim_data);
        for set in &self.index_sets {
            pools.ib.unmap_view(&set.indices);
        }
    }

    fn release(&mut self, ctx: &mut DrawContext<'_>) {
        self.abort(ctx);
        let Some(pools) = ctx.pools.as_deref_mut() else {
            return;
        };
        pools.vb_vertex_bb.release(&mut self.sim_data);
        pools.vb_gpu.release(&mut self.indirect_args);
        for mut set in self.index_sets.drain(..) {
            pools.ib.release(&mut set.indices);
        }
        for mut outputs in self.outputs.drain(..) {
            for view in [&mut outputs.positions, &mut outputs.normals, &mut outputs.tangents, &mut outputs.uv0] {
                pools.vb_gpu.release(view);
            }
            pools.ib_gpu.release(&mut outputs.indices);
        }
        self.request_offsets.clear();
    }
}

//! Instanced mesh drawer
//!
//! Every particle becomes one instance of the renderer's mesh. Instance
//! transforms are packed as column-major 4x4 matrices; each section of the
//! first LOD is one instanced draw over the instances of the call's requests.

use crate::foundation::math::{Mat4, Quat, Quaternion, Vec3};
use crate::render::api::{DrawPrimitive, IndexFormat, VertexSemantic, VertexStream};
use crate::render::buffer_pool::{BufferError, MappedBuffer, PooledBuffer};
use crate::render::drawers::additional_inputs::SimDataLayout;
use crate::render::drawers::geometry::pass_particles;
use crate::render::drawers::{geometry_can_render, DrawCallDesc, DrawContext, DrawerError, DrawerResult, DrawerStages};
use crate::render::frame_collector::DrawPass;
use crate::simulation::{fields, ParticlePage};

const MATRIX_STRIDE: u32 = 64;

/// World transform of one mesh particle
pub fn instance_transform(page: &ParticlePage, particle: usize, global_scale: f32) -> Mat4 {
    if !page.is_enabled(particle) {
        return Mat4::zeros();
    }
    let position = page
        .float3s(fields::POSITION)
        .and_then(|values| values.get(particle))
        .map_or_else(Vec3::zeros, |p| Vec3::new(p[0], p[1], p[2]));
    let rotation = page
        .float4s(fields::ORIENTATION)
        .and_then(|values| values.get(particle))
        .map_or_else(Quat::identity, |q| {
            Quat::new_normalize(Quaternion::new(q[3], q[0], q[1], q[2]))
        });
    let scale = page
        .float3s(fields::SCALE)
        .and_then(|values| values.get(particle))
        .map(|s| Vec3::new(s[0], s[1], s[2]))
        .or_else(|| {
            page.floats(fields::SIZE)
                .and_then(|values| values.get(particle))
                .map(|s| Vec3::repeat(*s))
        })
        .unwrap_or_else(|| Vec3::repeat(1.0));

    Mat4::new_translation(&(position * global_scale))
        * rotation.to_homogeneous()
        * Mat4::new_nonuniform_scaling(&(scale * global_scale))
}

#[derive(Debug, Default)]
struct Mapped {
    transforms: Option<MappedBuffer<[[f32; 4]; 4]>>,
    inputs: Option<MappedBuffer<f32>>,
}

/// Mesh instances of one pass
#[derive(Debug)]
pub struct MeshDrawer {
    transforms: PooledBuffer,
    inputs: PooledBuffer,
    layout: SimDataLayout,
    request_offsets: Vec<u32>,
    mapped: Option<Mapped>,
}

impl Default for MeshDrawer {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshDrawer {
    /// Drawer without buffers
    pub fn new() -> Self {
        Self {
            transforms: PooledBuffer::new(),
            inputs: PooledBuffer::new(),
            layout: SimDataLayout::default(),
            request_offsets: Vec::new(),
            mapped: None,
        }
    }
}

impl DrawerStages for MeshDrawer {
    fn can_render(&self, ctx: &DrawContext<'_>, pass: &DrawPass) -> bool {
        geometry_can_render(ctx, pass, true)
    }

    fn begin_frame(&mut self, _ctx: &mut DrawContext<'_>, pass: &DrawPass) -> DrawerResult<()> {
        self.request_offsets = pass.request_offsets();
        Ok(())
    }

    fn alloc_buffers(&mut self, ctx: &mut DrawContext<'_>, pass: &DrawPass) -> DrawerResult<()> {
        let desc = ctx.desc(pass.leader())?;
        let count = pass.total_particle_count;
        let layout = SimDataLayout::additional_inputs(&desc.additional_inputs, count, false);
        let persistent = layout.signature() == self.layout.signature();

        let (pools, backend) = ctx.gpu()?;
        pools
            .vb
            .allocate(backend, &mut self.transforms, count, MATRIX_STRIDE, persistent)?;
        pools
            .vb
            .allocate_if(!layout.is_empty(), backend, &mut self.inputs, layout.float_count(), 4, persistent)?;
        self.layout = layout;
        Ok(())
    }

    fn map_buffers(&mut self, ctx: &mut DrawContext<'_>, _pass: &DrawPass) -> DrawerResult<()> {
        let (pools, _) = ctx.gpu()?;
        let transforms = pools.vb.map(&self.transforms)?;
        let inputs = self.inputs.is_valid().then(|| pools.vb.map(&self.inputs)).transpose()?;
        self.mapped = Some(Mapped {
            transforms: Some(transforms),
            inputs,
        });
        Ok(())
    }

    fn fill_buffers(&mut self, ctx: &mut DrawContext<'_>, pass: &DrawPass) -> DrawerResult<()> {
        let mapped = self.mapped.as_mut().ok_or(DrawerError::OutOfOrder("fill_buffers"))?;
        let scale = ctx.sub_view.global_scale();
        if let Some(transforms) = mapped.transforms.as_mut() {
            for (dst, (page, particle)) in transforms.as_mut_slice().iter_mut().zip(pass_particles(pass)) {
                *dst = instance_transform(page, particle, scale).into();
            }
        }
        if let Some(inputs) = mapped.inputs.as_mut() {
            self.layout.fill(pass.pages(), inputs.as_mut_slice());
        }
        Ok(())
    }

    fn unmap_buffers(&mut self, ctx: &mut DrawContext<'_>, _pass: &DrawPass) -> DrawerResult<()> {
        let Some(mapped) = self.mapped.take() else {
            return Ok(());
        };
        let (pools, backend) = ctx.gpu()?;
        if let Some(transforms) = mapped.transforms {
            pools.vb.unmap(backend, transforms);
        }
        if let Some(inputs) = mapped.inputs {
            pools.vb.unmap(backend, inputs);
        }
        Ok(())
    }

    fn emit_draw_call(&mut self, ctx: &mut DrawContext<'_>, pass: &DrawPass, call: &DrawCallDesc) -> DrawerResult<()> {
        let desc = ctx.desc(pass.leader())?;
        let mesh = desc
            .mesh
            .as_ref()
            .ok_or_else(|| DrawerError::Unsupported("mesh renderer without a mesh".to_string()))?;
        let index_buffer = mesh
            .index_buffer
            .ok_or_else(|| DrawerError::Unsupported(format!("mesh {:?} has no index buffer", mesh.id)))?;
        let (Some(&first), Some(&last)) = (
            self.request_offsets.get(call.requests.start),
            self.request_offsets.get(call.requests.end),
        ) else {
            return Err(DrawerError::OutOfOrder("emit_draw_call"));
        };
        if last <= first {
            return Ok(());
        }
        let transforms = self.transforms.handle().ok_or(BufferError::NotAllocated)?;

        let Some(lod) = mesh.lods.first() else {
            return Ok(());
        };
        for section in &lod.sections {
            let mut streams = vec![VertexStream {
                semantic: VertexSemantic::InstanceTransform,
                buffer: transforms,
                offset_in_bytes: 0,
                stride: MATRIX_STRIDE,
            }];
            if let Some(buffer) = self.inputs.handle() {
                streams.push(VertexStream {
                    semantic: VertexSemantic::AdditionalInputs,
                    buffer,
                    offset_in_bytes: 0,
                    stride: 4,
                });
            }
            let mut draw = ctx.draw_call(
                pass,
                call,
                last - first,
                streams,
                DrawPrimitive::IndexedInstanced {
                    index_buffer,
                    format: IndexFormat::U32,
                    first_index: section.first_index,
                    index_count: section.index_count,
                    first_instance: first,
                    instance_count: last - first,
                },
            )?;
            self.layout.apply(&mut draw.uniforms);
            ctx.backend()?.submit_draw(draw)?;
        }
        Ok(())
    }

    fn abort(&mut self, ctx: &mut DrawContext<'_>) {
        self.mapped = None;
        self.layout = SimDataLayout::default();
        if let Some(pools) = ctx.pools.as_deref_mut() {
            pools.vb.unmap_view(&self.transforms);
            pools.vb.unmap_view(&self.inputs);
        }
    }

    fn release(&mut self, ctx: &mut DrawContext<'_>) {
        self.abort(ctx);
        if let Some(pools) = ctx.pools.as_deref_mut() {
            pools.vb.release(&mut self.transforms);
            pools.vb.release(&mut self.inputs);
        }
        self.request_offsets.clear();
    }
}

//! CPU particle geometry
//!
//! Expands main-memory particles into camera-facing quads or free triangles and
//! packs them into pooled vertex and index buffers. Billboard, ribbon and
//! triangle drawers share [`CpuGeometryBatch`] and only differ by
//! [`GeometryShape`].
//!
//! View-dependent shapes get one set of vertex buffers per billboarding view.
//! Sorted passes get one index buffer per view, ordered back to front.

use std::cmp::Ordering;

use crate::config::DrawCallSort;
use crate::foundation::math::{Mat4, Vec3};
use crate::render::api::{DrawPrimitive, VertexSemantic, VertexStream};
use crate::render::buffer_pool::{BufferError, MappedBuffer, MappedIndices, PooledBuffer};
use crate::render::drawers::additional_inputs::{LayoutSignature, SimDataLayout};
use crate::render::drawers::{DrawCallDesc, DrawContext, DrawerError, DrawerResult};
use crate::render::frame_collector::DrawPass;
use crate::render::renderer_cache::BillboardingFlags;
use crate::render::sub_view::BillboardingView;
use crate::simulation::{fields, ParticlePage};

/// Index pattern of one quad
pub const QUAD_INDICES: [u32; 6] = [0, 1, 2, 0, 2, 3];

/// Index pattern of one triangle
pub const TRIANGLE_INDICES: [u32; 3] = [0, 1, 2];

/// Quad facing the camera, rotated in the view plane
///
/// `half_size` holds the half extents along the rotated right and up axes.
pub fn screen_aligned_corners(right: Vec3, up: Vec3, position: Vec3, half_size: [f32; 2], rotation: f32) -> [Vec3; 4] {
    let (sin, cos) = rotation.sin_cos();
    let r = (right * cos + up * sin) * half_size[0];
    let u = (up * cos - right * sin) * half_size[1];
    [position - r - u, position + r - u, position + r + u, position - r + u]
}

/// Quad stretched along `axis`, turned toward the camera
///
/// The axis gives the full length of the quad; `half_width` is measured
/// across it.
pub fn axis_aligned_corners(camera_position: Vec3, position: Vec3, axis: Vec3, half_width: f32) -> [Vec3; 4] {
    let length = axis.norm();
    if length <= f32::EPSILON {
        return [position; 4];
    }
    let direction = axis / length;

    // Side vector perpendicular to both the axis and the camera direction
    let to_camera = camera_position - position;
    let side = to_camera.cross(&direction);
    let side = if side.norm() > f32::EPSILON {
        side.normalize()
    } else {
        let helper = if direction.x.abs() < 0.9 { Vec3::x() } else { Vec3::y() };
        direction.cross(&helper).normalize()
    };

    let half = axis * 0.5;
    let w = side * half_width;
    [position - half - w, position + half - w, position + half + w, position - half + w]
}

/// Expanded corners of one particle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleCorners {
    /// Corners; triangles only use the first three
    pub corners: [Vec3; 4],
    /// Face normal
    pub normal: Vec3,
    /// Face tangent (along the first edge)
    pub tangent: Vec3,
}

impl ParticleCorners {
    fn from_corners(corners: [Vec3; 4], last: usize, fallback_normal: Vec3) -> Self {
        let edge_u = corners[1] - corners[0];
        let edge_v = corners[last] - corners[0];
        let normal = edge_u.cross(&edge_v);
        let normal = if normal.norm() > f32::EPSILON {
            normal.normalize()
        } else {
            fallback_normal
        };
        let tangent = if edge_u.norm() > f32::EPSILON {
            edge_u.normalize()
        } else {
            Vec3::x()
        };
        Self {
            corners,
            normal,
            tangent,
        }
    }
}

fn vec3_at(page: &ParticlePage, name: &str, particle: usize) -> Option<Vec3> {
    page.float3s(name)
        .and_then(|values| values.get(particle))
        .map(|v| Vec3::new(v[0], v[1], v[2]))
}

fn float_at(page: &ParticlePage, name: &str, particle: usize) -> Option<f32> {
    page.floats(name).and_then(|values| values.get(particle)).copied()
}

fn size_at(page: &ParticlePage, particle: usize) -> [f32; 2] {
    if let Some(size) = page.float2s(fields::SIZE).and_then(|v| v.get(particle)) {
        return *size;
    }
    float_at(page, fields::SIZE, particle).map_or([1.0, 1.0], |size| [size, size])
}

/// Geometry generated per particle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryShape {
    /// Camera-facing quad, or axis-aligned when the particle has a free axis
    Billboard,
    /// Quad along the particle's axis (velocity when absent)
    Ribbon,
    /// Triangle from three particle positions
    Triangle,
}

impl GeometryShape {
    /// Vertices per particle
    pub const fn vertices_per_particle(self) -> u32 {
        match self {
            Self::Triangle => 3,
            Self::Billboard | Self::Ribbon => 4,
        }
    }

    /// Indices per particle
    pub const fn indices_per_particle(self) -> u32 {
        self.index_pattern().len() as u32
    }

    /// Indices of one particle, relative to its first vertex
    pub const fn index_pattern(self) -> &'static [u32] {
        match self {
            Self::Triangle => &TRIANGLE_INDICES,
            Self::Billboard | Self::Ribbon => &QUAD_INDICES,
        }
    }

    /// Whether the vertices depend on the camera
    pub const fn is_view_dependent(self) -> bool {
        !matches!(self, Self::Triangle)
    }

    /// World-space center used for sorting
    pub fn center(self, page: &ParticlePage, particle: usize, scale: f32) -> Vec3 {
        match self {
            Self::Triangle => {
                let sum = fields::TRIANGLE_POSITIONS
                    .iter()
                    .filter_map(|name| vec3_at(page, name, particle))
                    .fold(Vec3::zeros(), |acc, p| acc + p);
                sum / 3.0 * scale
            }
            Self::Billboard | Self::Ribbon => {
                vec3_at(page, fields::POSITION, particle).unwrap_or_else(Vec3::zeros) * scale
            }
        }
    }

    /// Expand one particle for `view`; disabled particles collapse to a point
    pub fn expand(self, page: &ParticlePage, particle: usize, view: &BillboardingView, scale: f32) -> ParticleCorners {
        let center = self.center(page, particle, scale);
        if !page.is_enabled(particle) {
            return ParticleCorners {
                corners: [center; 4],
                normal: view.backward(),
                tangent: view.right(),
            };
        }

        let size = size_at(page, particle);
        let half_size = [size[0] * scale, size[1] * scale];
        match self {
            Self::Billboard => {
                let corners = match vec3_at(page, fields::AXIS0, particle) {
                    Some(axis) => axis_aligned_corners(view.position(), center, axis * scale, half_size[1]),
                    None => {
                        let rotation = float_at(page, fields::ROTATION, particle).unwrap_or(0.0);
                        screen_aligned_corners(view.right(), view.up(), center, half_size, rotation)
                    }
                };
                ParticleCorners::from_corners(corners, 3, view.backward())
            }
            Self::Ribbon => {
                let axis = vec3_at(page, fields::AXIS0, particle)
                    .map(|axis| axis * scale)
                    .or_else(|| {
                        vec3_at(page, fields::VELOCITY, particle)
                            .filter(|v| v.norm() > f32::EPSILON)
                            .map(|v| v.normalize() * half_size[0] * 2.0)
                    })
                    .unwrap_or_else(|| view.up() * half_size[0] * 2.0);
                let corners = axis_aligned_corners(view.position(), center, axis, half_size[1]);
                ParticleCorners::from_corners(corners, 3, view.backward())
            }
            Self::Triangle => {
                let mut corners = [center; 4];
                for (corner, name) in corners.iter_mut().zip(fields::TRIANGLE_POSITIONS) {
                    if let Some(p) = vec3_at(page, name, particle) {
                        *corner = p * scale;
                    }
                }
                ParticleCorners::from_corners(corners, 2, view.backward())
            }
        }
    }

    /// Texture coordinates of the corners
    pub fn uvs(self, flags: &BillboardingFlags) -> [[f32; 2]; 4] {
        let base = match self {
            Self::Triangle => [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 0.0]],
            Self::Billboard | Self::Ribbon => [[0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]],
        };
        base.map(|[u, v]| {
            let (mut u, mut v) = if flags.rotate_texture { (v, 1.0 - u) } else { (u, v) };
            if flags.flip_u {
                u = 1.0 - u;
            }
            if flags.flip_v {
                v = 1.0 - v;
            }
            [u, v]
        })
    }
}

/// Particle order drawing back to front from `view`
///
/// With `request_offsets`, particles are only reordered inside each request so
/// per-request draw calls keep their index ranges.
pub fn sort_back_to_front(centers: &[Vec3], view: &BillboardingView, request_offsets: Option<&[u32]>) -> Vec<u32> {
    let forward = -view.backward();
    let eye = view.position();
    let depths: Vec<f32> = centers.iter().map(|c| (c - eye).dot(&forward)).collect();
    let by_depth = |a: &u32, b: &u32| {
        depths[*b as usize]
            .partial_cmp(&depths[*a as usize])
            .unwrap_or(Ordering::Equal)
    };

    let mut order: Vec<u32> = (0..centers.len() as u32).collect();
    match request_offsets {
        Some(offsets) => {
            for window in offsets.windows(2) {
                let start = (window[0] as usize).min(order.len());
                let end = (window[1] as usize).min(order.len());
                order[start..end].sort_by(by_depth);
            }
        }
        None => order.sort_by(by_depth),
    }
    order
}

/// Every particle of the pass with its page, in request order
pub fn pass_particles(pass: &DrawPass) -> impl Iterator<Item = (&ParticlePage, usize)> + '_ {
    pass.pages()
        .flat_map(|page| (0..page.particle_count() as usize).map(move |particle| (page, particle)))
}

fn stream(semantic: VertexSemantic, view: &PooledBuffer) -> Option<VertexStream> {
    view.handle().map(|buffer| VertexStream {
        semantic,
        buffer,
        offset_in_bytes: 0,
        stride: view.stride(),
    })
}

#[derive(Debug, Default)]
struct GeometrySet {
    view_index: u32,
    positions: PooledBuffer,
    normals: PooledBuffer,
    tangents: PooledBuffer,
}

#[derive(Debug, Default)]
struct IndexSet {
    view_index: u32,
    indices: PooledBuffer,
}

#[derive(Debug)]
struct MappedGeometry {
    positions: MappedBuffer<[f32; 4]>,
    normals: Option<MappedBuffer<[f32; 4]>>,
    tangents: Option<MappedBuffer<[f32; 4]>>,
}

#[derive(Debug, Default)]
struct MappedBatch {
    geometry: Vec<MappedGeometry>,
    indices: Vec<MappedIndices>,
    uv0: Option<MappedBuffer<[f32; 2]>>,
    uv1: Option<MappedBuffer<[f32; 2]>>,
    atlas_ids: Option<MappedBuffer<f32>>,
    inputs: Option<MappedBuffer<f32>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BatchSignature {
    layout: LayoutSignature,
    flags: BillboardingFlags,
    geometry_views: Vec<u32>,
    index_views: Vec<u32>,
}

/// Vertex and index buffers of one CPU-expanded pass
#[derive(Debug)]
pub struct CpuGeometryBatch {
    shape: GeometryShape,
    flags: BillboardingFlags,
    particle_count: u32,
    request_offsets: Vec<u32>,
    signature: Option<BatchSignature>,
    layout: SimDataLayout,
    geometry: Vec<GeometrySet>,
    index_sets: Vec<IndexSet>,
    uv0: PooledBuffer,
    uv1: PooledBuffer,
    atlas_ids: PooledBuffer,
    inputs: PooledBuffer,
    mapped: Option<MappedBatch>,
}

impl CpuGeometryBatch {
    /// Empty batch generating `shape`
    pub fn new(shape: GeometryShape) -> Self {
        Self {
            shape,
            flags: BillboardingFlags::default(),
            particle_count: 0,
            request_offsets: Vec::new(),
            signature: None,
            layout: SimDataLayout::default(),
            geometry: Vec::new(),
            index_sets: Vec::new(),
            uv0: PooledBuffer::new(),
            uv1: PooledBuffer::new(),
            atlas_ids: PooledBuffer::new(),
            inputs: PooledBuffer::new(),
            mapped: None,
        }
    }

    /// Generated shape
    pub const fn shape(&self) -> GeometryShape {
        self.shape
    }

    /// Particles covered by the current allocation
    pub const fn particle_count(&self) -> u32 {
        self.particle_count
    }

    /// Number of vertex buffer sets (one per view for camera-facing shapes)
    pub fn geometry_set_count(&self) -> usize {
        self.geometry.len()
    }

    /// Number of index buffers (one per view when sorted)
    pub fn index_set_count(&self) -> usize {
        self.index_sets.len()
    }

    /// Size the buffers for `pass`
    ///
    /// Buffers are kept when the particle count, the field set and the views
    /// are unchanged; any change reallocates them as new.
    pub fn alloc(&mut self, ctx: &mut DrawContext<'_>, pass: &DrawPass) -> DrawerResult<()> {
        let desc = ctx.desc(pass.leader())?;
        let flags = desc.flags;
        let count = pass.total_particle_count;

        let mut views: Vec<u32> = ctx.sub_view.bb_views().iter().map(|v| v.view_index).collect();
        if views.is_empty() {
            views.push(0);
        }
        let geometry_views = if self.shape.is_view_dependent() {
            views.clone()
        } else {
            vec![views[0]]
        };
        let index_views = if flags.need_sort { views } else { vec![geometry_views[0]] };

        let layout = SimDataLayout::additional_inputs(&desc.additional_inputs, count, false);
        let signature = BatchSignature {
            layout: layout.signature(),
            flags,
            geometry_views: geometry_views.clone(),
            index_views: index_views.clone(),
        };
        let persistent = self.signature.as_ref() == Some(&signature);
        self.signature = None;

        let vertex_count = count
            .checked_mul(self.shape.vertices_per_particle())
            .ok_or(BufferError::SizeOverflow)?;
        let index_count = count
            .checked_mul(self.shape.indices_per_particle())
            .ok_or(BufferError::SizeOverflow)?;

        let (pools, backend) = ctx.gpu()?;
        while self.geometry.len() > geometry_views.len() {
            if let Some(mut set) = self.geometry.pop() {
                pools.vb.release(&mut set.positions);
                pools.vb.release(&mut set.normals);
                pools.vb.release(&mut set.tangents);
            }
        }
        self.geometry.resize_with(geometry_views.len(), GeometrySet::default);
        for (set, view_index) in self.geometry.iter_mut().zip(&geometry_views) {
            set.view_index = *view_index;
            pools.vb.allocate(backend, &mut set.positions, vertex_count, 16, persistent)?;
            pools
                .vb
                .allocate_if(flags.has_normal, backend, &mut set.normals, vertex_count, 16, persistent)?;
            pools
                .vb
                .allocate_if(flags.has_tangent, backend, &mut set.tangents, vertex_count, 16, persistent)?;
        }

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

        pools
            .vb
            .allocate_if(flags.has_uv, backend, &mut self.uv0, vertex_count, 8, persistent)?;
        pools
            .vb
            .allocate_if(flags.has_atlas_blending, backend, &mut self.uv1, vertex_count, 8, persistent)?;
        pools
            .vb
            .allocate_if(flags.has_atlas_blending, backend, &mut self.atlas_ids, vertex_count, 4, persistent)?;
        pools
            .vb
            .allocate_if(!layout.is_empty(), backend, &mut self.inputs, layout.float_count(), 4, persistent)?;

        self.flags = flags;
        self.particle_count = count;
        self.request_offsets = pass.request_offsets();
        self.layout = layout;
        self.signature = Some(signature);
        Ok(())
    }

    /// Map every allocated buffer
    pub fn map(&mut self, ctx: &mut DrawContext<'_>) -> DrawerResult<()> {
        if self.mapped.is_some() {
            return Err(BufferError::AlreadyMapped.into());
        }
        let (pools, _) = ctx.gpu()?;
        let mut mapped = MappedBatch::default();
        for set in &self.geometry {
            mapped.geometry.push(MappedGeometry {
                positions: pools.vb.map(&set.positions)?,
                normals: set.normals.is_valid().then(|| pools.vb.map(&set.normals)).transpose()?,
                tangents: set.tangents.is_valid().then(|| pools.vb.map(&set.tangents)).transpose()?,
            });
        }
        for set in &self.index_sets {
            mapped.indices.push(pools.ib.map_indices(&set.indices)?);
        }
        mapped.uv0 = self.uv0.is_valid().then(|| pools.vb.map(&self.uv0)).transpose()?;
        mapped.uv1 = self.uv1.is_valid().then(|| pools.vb.map(&self.uv1)).transpose()?;
        mapped.atlas_ids = self.atlas_ids.is_valid().then(|| pools.vb.map(&self.atlas_ids)).transpose()?;
        mapped.inputs = self.inputs.is_valid().then(|| pools.vb.map(&self.inputs)).transpose()?;
        self.mapped = Some(mapped);
        Ok(())
    }

    /// Expand the particles of `pass` into the mapped buffers
    pub fn fill(&mut self, ctx: &DrawContext<'_>, pass: &DrawPass) -> DrawerResult<()> {
        let mapped = self.mapped.as_mut().ok_or(DrawerError::OutOfOrder("fill_buffers"))?;
        let scale = ctx.sub_view.global_scale();
        let fallback = BillboardingView::new(0, &Mat4::identity());
        let view_of = |index: u32| {
            ctx.sub_view
                .bb_views()
                .iter()
                .find(|view| view.view_index == index)
                .unwrap_or(&fallback)
        };
        let capacity = self.particle_count as usize;
        let vpp = self.shape.vertices_per_particle() as usize;

        for (set, out) in self.geometry.iter().zip(mapped.geometry.iter_mut()) {
            let view = view_of(set.view_index);
            let positions = out.positions.as_mut_slice();
            let mut normals = out.normals.as_mut().map(MappedBuffer::as_mut_slice);
            let mut tangents = out.tangents.as_mut().map(MappedBuffer::as_mut_slice);

            for (particle, (page, index)) in pass_particles(pass).take(capacity).enumerate() {
                let quad = self.shape.expand(page, index, view, scale);
                let n = quad.normal;
                let t = quad.tangent;
                for (corner, p) in quad.corners.iter().take(vpp).enumerate() {
                    let vertex = particle * vpp + corner;
                    positions[vertex] = [p.x, p.y, p.z, 1.0];
                    if let Some(normals) = normals.as_deref_mut() {
                        normals[vertex] = [n.x, n.y, n.z, 0.0];
                    }
                    if let Some(tangents) = tangents.as_deref_mut() {
                        tangents[vertex] = [t.x, t.y, t.z, 1.0];
                    }
                }
            }
        }

        if let Some(uv0) = mapped.uv0.as_mut() {
            let uvs = self.shape.uvs(&self.flags);
            for (vertex, uv) in uv0.as_mut_slice().iter_mut().enumerate() {
                *uv = uvs[vertex % vpp];
            }
            if let Some(uv1) = mapped.uv1.as_mut() {
                uv1.as_mut_slice().copy_from_slice(uv0.as_mut_slice());
            }
        }
        if let Some(atlas_ids) = mapped.atlas_ids.as_mut() {
            let atlas_ids = atlas_ids.as_mut_slice();
            for (particle, (page, index)) in pass_particles(pass).take(capacity).enumerate() {
                let blend = float_at(page, fields::TEXTURE_ID, index).map_or(0.0, f32::fract);
                atlas_ids[particle * vpp..(particle + 1) * vpp].fill(blend);
            }
        }

        let centers: Vec<Vec3> = pass_particles(pass)
            .take(capacity)
            .map(|(page, index)| self.shape.center(page, index, scale))
            .collect();
        let per_request = ctx.settings.draw_call_sort == DrawCallSort::Slices && self.flags.slicable;
        let pattern = self.shape.index_pattern();
        for (set, indices) in self.index_sets.iter().zip(mapped.indices.iter_mut()) {
            let order: Vec<u32> = if self.flags.need_sort {
                let offsets = per_request.then_some(self.request_offsets.as_slice());
                sort_back_to_front(&centers, view_of(set.view_index), offsets)
            } else {
                (0..centers.len() as u32).collect()
            };
            for (slot, particle) in order.iter().enumerate() {
                for (corner, offset) in pattern.iter().enumerate() {
                    indices.set(slot * pattern.len() + corner, particle * vpp as u32 + offset);
                }
            }
        }

        if let Some(inputs) = mapped.inputs.as_mut() {
            self.layout.fill(pass.pages(), inputs.as_mut_slice());
        }
        Ok(())
    }

    /// Upload and unmap
    pub fn unmap(&mut self, ctx: &mut DrawContext<'_>) -> DrawerResult<()> {
        let Some(mapped) = self.mapped.take() else {
            return Ok(());
        };
        let (pools, backend) = ctx.gpu()?;
        for geometry in mapped.geometry {
            pools.vb.unmap(backend, geometry.positions);
            for buffer in [geometry.normals, geometry.tangents].into_iter().flatten() {
                pools.vb.unmap(backend, buffer);
            }
        }
        for indices in mapped.indices {
            pools.ib.unmap_indices(backend, indices);
        }
        for buffer in [mapped.uv0, mapped.uv1].into_iter().flatten() {
            pools.vb.unmap(backend, buffer);
        }
        for buffer in [mapped.atlas_ids, mapped.inputs].into_iter().flatten() {
            pools.vb.unmap(backend, buffer);
        }
        Ok(())
    }

    /// Submit the draw call covering `call`
    pub fn emit(&self, ctx: &mut DrawContext<'_>, pass: &DrawPass, call: &DrawCallDesc) -> DrawerResult<()> {
        let geometry = self
            .geometry
            .iter()
            .find(|set| set.view_index == call.view_index)
            .or_else(|| self.geometry.first())
            .ok_or(DrawerError::OutOfOrder("emit_draw_call"))?;
        let index_set = self
            .index_sets
            .iter()
            .find(|set| set.view_index == call.view_index)
            .or_else(|| self.index_sets.first())
            .ok_or(DrawerError::OutOfOrder("emit_draw_call"))?;
        let (Some(&first), Some(&last)) = (
            self.request_offsets.get(call.requests.start),
            self.request_offsets.get(call.requests.end),
        ) else {
            return Err(DrawerError::OutOfOrder("emit_draw_call"));
        };
        if last <= first {
            return Ok(());
        }

        let index_buffer = index_set.indices.handle().ok_or(BufferError::NotAllocated)?;
        let ipp = self.shape.indices_per_particle();
        let streams = [
            stream(VertexSemantic::Position, &geometry.positions),
            stream(VertexSemantic::Normal, &geometry.normals),
            stream(VertexSemantic::Tangent, &geometry.tangents),
            stream(VertexSemantic::Uv0, &self.uv0),
            stream(VertexSemantic::Uv1, &self.uv1),
            stream(VertexSemantic::AtlasId, &self.atlas_ids),
            stream(VertexSemantic::AdditionalInputs, &self.inputs),
        ]
        .into_iter()
        .flatten()
        .collect();

        let mut draw = ctx.draw_call(
            pass,
            call,
            last - first,
            streams,
            DrawPrimitive::Indexed {
                index_buffer,
                format: index_set.indices.index_format(),
                first_index: first * ipp,
                index_count: (last - first) * ipp,
            },
        )?;
        self.layout.apply(&mut draw.uniforms);
        ctx.backend()?.submit_draw(draw)?;
        Ok(())
    }

    /// Drop mapped memory without uploading
    pub fn abort(&mut self, ctx: &mut DrawContext<'_>) {
        self.mapped = None;
        self.signature = None;
        let Some(pools) = ctx.pools.as_deref_mut() else {
            return;
        };
        for set in &self.geometry {
            for view in [&set.positions, &set.normals, &set.tangents] {
                pools.vb.unmap_view(view);
            }
        }
        for set in &self.index_sets {
            pools.ib.unmap_view(&set.indices);
        }
        for view in [&self.uv0, &self.uv1, &self.atlas_ids, &self.inputs] {
            pools.vb.unmap_view(view);
        }
    }

    /// Give every buffer back to the pools
    pub fn release(&mut self, ctx: &mut DrawContext<'_>) {
        self.abort(ctx);
        let Some(pools) = ctx.pools.as_deref_mut() else {
            return;
        };
        for mut set in self.geometry.drain(..) {
            pools.vb.release(&mut set.positions);
            pools.vb.release(&mut set.normals);
            pools.vb.release(&mut set.tangents);
        }
        for mut set in self.index_sets.drain(..) {
            pools.ib.release(&mut set.indices);
        }
        for view in [&mut self.uv0, &mut self.uv1, &mut self.atlas_ids, &mut self.inputs] {
            pools.vb.release(view);
        }
        self.particle_count = 0;
        self.request_offsets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::drawers::test_support::{self, Fixture};
    use crate::render::sub_view::{RenderPassKind, RendererSubView};
    use crate::simulation::{FieldData, RendererDecl, RendererKind, RendererProperties};
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    fn camera_at(z: f32) -> BillboardingView {
        let view = Mat4::look_at_rh(&Point3::new(0.0, 0.0, z), &Point3::origin(), &Vec3::y());
        BillboardingView::new(0, &view)
    }

    #[test]
    fn test_screen_aligned_quad_faces_camera() {
        let view = camera_at(5.0);
        let page = test_support::page(&[[0.0, 0.0, 0.0]]);
        let quad = GeometryShape::Billboard.expand(&page, 0, &view, 1.0);

        assert_relative_eq!(quad.normal, Vec3::z(), epsilon = 1e-5);
        assert_relative_eq!(quad.corners[0], Vec3::new(-1.0, -1.0, 0.0), epsilon = 1e-5);
        assert_relative_eq!(quad.corners[2], Vec3::new(1.0, 1.0, 0.0), epsilon = 1e-5);
    }

    #[test]
    fn test_axis_aligned_quad_keeps_axis() {
        let corners = axis_aligned_corners(Vec3::new(5.0, 0.0, 0.0), Vec3::zeros(), Vec3::new(0.0, 0.0, 2.0), 0.5);
        let along = corners[1] - corners[0];
        assert_relative_eq!(along, Vec3::new(0.0, 0.0, 2.0), epsilon = 1e-5);
        assert_relative_eq!((corners[3] - corners[0]).norm(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_disabled_particle_collapses() {
        let page = test_support::page(&[[1.0, 2.0, 3.0]])
            .with_field(fields::ENABLED, FieldData::Bool(vec![false]));
        let quad = GeometryShape::Billboard.expand(&page, 0, &camera_at(5.0), 1.0);
        assert!(quad.corners.iter().all(|c| *c == Vec3::new(1.0, 2.0, 3.0)));
    }

    #[test]
    fn test_back_to_front_order() {
        let view = camera_at(10.0);
        let centers = [Vec3::new(0.0, 0.0, 5.0), Vec3::new(0.0, 0.0, -5.0), Vec3::zeros()];
        assert_eq!(sort_back_to_front(&centers, &view, None), vec![1, 2, 0]);

        // Sorting inside each request keeps the requests apart
        let offsets = [0, 1, 3];
        assert_eq!(sort_back_to_front(&centers, &view, Some(&offsets)), vec![0, 1, 2]);
    }

    #[test]
    fn test_uv_flips() {
        let flags = BillboardingFlags {
            flip_u: true,
            ..BillboardingFlags::default()
        };
        let uvs = GeometryShape::Billboard.uvs(&flags);
        assert_eq!(uvs[0], [1.0, 1.0]);
        assert_eq!(uvs[2], [0.0, 0.0]);
    }

    #[test]
    fn test_batch_expands_quads_and_submits_one_call() {
        let mut fixture = Fixture::new();
        let decl = RendererDecl::new(RendererKind::Billboard).with_material("opaque");
        let pass = fixture.pass(
            decl,
            vec![test_support::main_memory(vec![test_support::page(&[[0.0, 0.0, 0.0], [2.0, 0.0, 0.0]])])],
        );
        let sub_view = test_support::main_view();
        let mut batch = CpuGeometryBatch::new(GeometryShape::Billboard);

        {
            let mut ctx = fixture.context(&sub_view);
            batch.alloc(&mut ctx, &pass).expect("Should allocate");
            batch.map(&mut ctx).expect("Should map");
            batch.fill(&ctx, &pass).expect("Should fill");
            batch.unmap(&mut ctx).expect("Should unmap");
            batch
                .emit(&mut ctx, &pass, &DrawCallDesc::whole_pass(0, &pass))
                .expect("Should emit");
        }

        let draws = fixture.recording.lock().take_draws();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].particle_count, 2);
        match draws[0].primitive {
            DrawPrimitive::Indexed { index_count, first_index, .. } => {
                assert_eq!(index_count, 12);
                assert_eq!(first_index, 0);
            }
            other => panic!("unexpected primitive {:?}", other),
        }
        assert!(draws[0]
            .streams
            .iter()
            .any(|s| s.semantic == VertexSemantic::Uv0));
        assert_eq!(batch.geometry_set_count(), 1);
        assert_eq!(batch.index_set_count(), 1);
    }

    #[test]
    fn test_sorted_pass_gets_index_buffer_per_view() {
        let mut fixture = Fixture::new();
        let decl = RendererDecl::new(RendererKind::Billboard)
            .with_material("smoke")
            .with_properties(RendererProperties {
                needs_sort: true,
                ..RendererProperties::default()
            });
        let pass = fixture.pass(
            decl,
            vec![test_support::main_memory(vec![test_support::page(&[[0.0, 0.0, 0.0]])])],
        );
        let sub_view = RendererSubView::render(
            RenderPassKind::Main,
            &[test_support::scene_view(5.0), test_support::scene_view(-5.0)],
            1.0,
        );
        let mut batch = CpuGeometryBatch::new(GeometryShape::Billboard);
        let mut ctx = fixture.context(&sub_view);
        batch.alloc(&mut ctx, &pass).expect("Should allocate");

        assert_eq!(batch.geometry_set_count(), 2);
        assert_eq!(batch.index_set_count(), 2);
        batch.release(&mut ctx);
        assert_eq!(batch.geometry_set_count(), 0);
    }

    #[test]
    fn test_unchanged_pass_keeps_buffers() {
        let mut fixture = Fixture::new();
        let decl = RendererDecl::new(RendererKind::Triangle).with_material("opaque");
        let pass = fixture.pass(
            decl,
            vec![test_support::main_memory(vec![test_support::page(&[[0.0, 0.0, 0.0]])])],
        );
        let sub_view = test_support::main_view();
        let mut batch = CpuGeometryBatch::new(GeometryShape::Triangle);

        let mut ctx = fixture.context(&sub_view);
        batch.alloc(&mut ctx, &pass).expect("Should allocate");
        let first = batch.geometry[0].positions.handle();
        batch.alloc(&mut ctx, &pass).expect("Should allocate again");
        assert_eq!(batch.geometry[0].positions.handle(), first);
        assert!(ctx.pools.as_deref().map_or(0, |p| p.vb.stats().kept) > 0);
    }
}

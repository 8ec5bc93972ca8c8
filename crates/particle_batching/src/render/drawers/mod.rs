//! Batch drawers
//!
//! One drawer per batch turns the draw requests of a [`DrawPass`] into buffers
//! and draw calls. Every drawer runs the same stage machine, driven by the
//! batch renderer:
//!
//! ```text
//! begin_frame → alloc_buffers → map_buffers → fill_buffers → unmap_buffers
//!             → launch_custom_tasks → emit_draw_call (per view / slice)
//! ```
//!
//! A failing stage only drops the pass for this frame; the batch renderer then
//! calls [`DrawerStages::abort`], which leaves every pooled buffer unmapped.
//!
//! The set of drawers is closed, so dispatch goes through the [`BatchDrawer`]
//! enum rather than boxed trait objects.

pub mod additional_inputs;
pub mod billboard_cpu;
pub mod billboard_gpu;
pub mod decal;
pub mod geometry;
pub mod light;
pub mod mesh;
pub mod ribbon;
pub mod sound;
#[cfg(test)]
pub(crate) mod test_support;
pub mod triangle;

use std::ops::Range;

use crate::assets::MaterialDomain;
use crate::audio::{AudioError, AudioSink};
use crate::config::{BillboardingLocation, FrameSettings};
use crate::foundation::collections::CacheKey;
use crate::render::api::{
    BackendError, DrawCall, DrawPrimitive, GraphicsBackend, ParticleUniforms, VertexStream,
};
use crate::render::buffer_pool::{BufferError, BufferPools};
use crate::render::frame_collector::DrawPass;
use crate::render::renderer_cache::{CacheLookup, MaterialDesc};
use crate::render::sub_view::{RenderPassKind, RendererSubView};
use crate::simulation::{MediumEvent, MediumId, RendererKind, StorageClass};

pub use billboard_cpu::BillboardCpuDrawer;
pub use billboard_gpu::{BillboardGpuDrawer, BillboardMode};
pub use decal::{DecalDrawer, DecalInstance, DecalProxyId, DecalSink, RecordingDecalSink};
pub use light::{LightDrawer, SimpleLight};
pub use mesh::MeshDrawer;
pub use ribbon::RibbonDrawer;
pub use sound::SoundDrawer;
pub use triangle::TriangleDrawer;

/// Result type for drawer stages
pub type DrawerResult<T> = Result<T, DrawerError>;

/// Errors that abort one pass for one frame
#[derive(thiserror::Error, Debug)]
pub enum DrawerError {
    /// Pooled buffer failure
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Graphics backend failure
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Audio failure
    #[error(transparent)]
    Audio(#[from] AudioError),

    /// The context lacks a service this drawer needs
    #[error("{0} service is not available in this pass")]
    MissingService(&'static str),

    /// A cache of the pass was not published to this thread yet
    #[error("Renderer cache {0:?} is not ready")]
    CacheNotReady(CacheKey),

    /// The renderer setup has no drawer
    #[error("Unsupported renderer setup: {0}")]
    Unsupported(String),

    /// A stage ran out of order
    #[error("Stage '{0}' ran before its buffers were prepared")]
    OutOfOrder(&'static str),
}

/// Everything a drawer may touch while drawing one pass
pub struct DrawContext<'a> {
    /// Settings of the frame being drawn
    pub settings: &'a FrameSettings,
    /// Pass and views being drawn
    pub sub_view: &'a RendererSubView,
    /// Caches published to this thread
    pub caches: &'a dyn CacheLookup,
    /// Buffer pools (render thread)
    pub pools: Option<&'a mut BufferPools>,
    /// Graphics backend (render thread)
    pub backend: Option<&'a mut dyn GraphicsBackend>,
    /// Audio output (update thread)
    pub audio: Option<&'a mut dyn AudioSink>,
    /// Decal output (update thread)
    pub decals: Option<&'a mut dyn DecalSink>,
    /// Lights gathered this frame (render thread)
    pub lights: Option<&'a mut Vec<SimpleLight>>,
}

impl<'a> DrawContext<'a> {
    /// Context without any output service
    pub fn new(settings: &'a FrameSettings, sub_view: &'a RendererSubView, caches: &'a dyn CacheLookup) -> Self {
        Self {
            settings,
            sub_view,
            caches,
            pools: None,
            backend: None,
            audio: None,
            decals: None,
            lights: None,
        }
    }

    /// Pools and backend together
    pub fn gpu(&mut self) -> DrawerResult<(&mut BufferPools, &mut (dyn GraphicsBackend + 'a))> {
        match (self.pools.as_deref_mut(), self.backend.as_deref_mut()) {
            (Some(pools), Some(backend)) => Ok((pools, backend)),
            _ => Err(DrawerError::MissingService("graphics")),
        }
    }

    /// Graphics backend alone
    pub fn backend(&mut self) -> DrawerResult<&mut (dyn GraphicsBackend + 'a)> {
        self.backend
            .as_deref_mut()
            .ok_or(DrawerError::MissingService("graphics"))
    }

    /// Description of a cache published to this thread
    pub fn desc(&self, key: CacheKey) -> DrawerResult<&'a MaterialDesc> {
        let caches: &'a dyn CacheLookup = self.caches;
        caches.desc(key).ok_or(DrawerError::CacheNotReady(key))
    }

    /// Draw call skeleton for `call`, bound to the pass's leader material
    pub fn draw_call(
        &self,
        pass: &DrawPass,
        call: &DrawCallDesc,
        particle_count: u32,
        streams: Vec<VertexStream>,
        primitive: DrawPrimitive,
    ) -> DrawerResult<DrawCall> {
        let desc = self.desc(pass.leader())?;
        Ok(DrawCall {
            pass: self.sub_view.pass(),
            view_index: call.view_index,
            renderer_kind: pass.kind,
            material: desc.material_id(),
            blend_mode: desc.blend_mode(),
            particle_count,
            streams,
            primitive,
            uniforms: ParticleUniforms {
                draw_request_id: call.draw_request_id,
                ..ParticleUniforms::default()
            },
            cast_shadows: pass.cast_shadows,
        })
    }
}

/// One draw call to emit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawCallDesc {
    /// Scene view index
    pub view_index: u32,
    /// Requests of the pass covered by the call
    pub requests: Range<usize>,
    /// Request index for sliced calls, `-1` for the whole pass
    pub draw_request_id: i32,
}

impl DrawCallDesc {
    /// Call covering every request of a pass
    pub fn whole_pass(view_index: u32, pass: &DrawPass) -> Self {
        Self {
            view_index,
            requests: 0..pass.requests.len(),
            draw_request_id: -1,
        }
    }

    /// Call covering a single request
    pub fn slice(view_index: u32, request: usize) -> Self {
        Self {
            view_index,
            requests: request..request + 1,
            draw_request_id: request as i32,
        }
    }
}

/// Stage machine shared by every drawer
pub trait DrawerStages {
    /// Whether the drawer has output in the current pass
    fn can_render(&self, ctx: &DrawContext<'_>, pass: &DrawPass) -> bool;

    /// Reset per-frame state
    fn begin_frame(&mut self, _ctx: &mut DrawContext<'_>, _pass: &DrawPass) -> DrawerResult<()> {
        Ok(())
    }

    /// Size and request buffers
    fn alloc_buffers(&mut self, _ctx: &mut DrawContext<'_>, _pass: &DrawPass) -> DrawerResult<()> {
        Ok(())
    }

    /// Map allocated buffers
    fn map_buffers(&mut self, _ctx: &mut DrawContext<'_>, _pass: &DrawPass) -> DrawerResult<()> {
        Ok(())
    }

    /// Write particle data into mapped buffers
    fn fill_buffers(&mut self, _ctx: &mut DrawContext<'_>, _pass: &DrawPass) -> DrawerResult<()> {
        Ok(())
    }

    /// Upload and unmap
    fn unmap_buffers(&mut self, _ctx: &mut DrawContext<'_>, _pass: &DrawPass) -> DrawerResult<()> {
        Ok(())
    }

    /// Issue compute work needed before drawing
    fn launch_custom_tasks(&mut self, _ctx: &mut DrawContext<'_>, _pass: &DrawPass) -> DrawerResult<()> {
        Ok(())
    }

    /// Emit one draw call
    fn emit_draw_call(
        &mut self,
        ctx: &mut DrawContext<'_>,
        pass: &DrawPass,
        desc: &DrawCallDesc,
    ) -> DrawerResult<()>;

    /// Drop mapped memory without uploading; safe to call at any point
    fn abort(&mut self, _ctx: &mut DrawContext<'_>) {}

    /// Give every resource back
    fn release(&mut self, _ctx: &mut DrawContext<'_>) {}

    /// React to a medium being paused or destroyed
    fn on_medium_event(&mut self, _ctx: &mut DrawContext<'_>, _medium: MediumId, _event: MediumEvent) {}
}

/// Drawer picked for a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawerChoice {
    /// Billboards expanded on the CPU
    BillboardCpu,
    /// Billboards expanded on the GPU
    BillboardGpu(BillboardMode),
    /// Ribbons
    Ribbon,
    /// Instanced meshes
    Mesh,
    /// Triangles
    Triangle,
    /// Simple lights
    Light,
    /// Sounds
    Sound,
    /// Decals
    Decal,
}

/// Pick the drawer of a batch
pub fn select_drawer(
    kind: RendererKind,
    storage: StorageClass,
    domain: Option<MaterialDomain>,
    settings: &FrameSettings,
) -> DrawerResult<DrawerChoice> {
    let volumetric = domain == Some(MaterialDomain::Volume);
    if volumetric && !settings.vertex_billboarding_supported {
        return Err(DrawerError::Unsupported(format!(
            "{:?} renderers with volume materials need vertex billboarding",
            kind
        )));
    }

    if storage == StorageClass::Gpu {
        return match kind {
            RendererKind::Billboard if volumetric || settings.vertex_billboarding_supported => {
                Ok(DrawerChoice::BillboardGpu(BillboardMode::VertexShader))
            }
            RendererKind::Billboard => Ok(DrawerChoice::BillboardGpu(BillboardMode::ComputeShader)),
            _ => Err(DrawerError::Unsupported(format!(
                "{:?} renderers cannot draw GPU-stored particles",
                kind
            ))),
        };
    }

    Ok(match kind {
        RendererKind::Billboard
            if volumetric || settings.billboarding_location == BillboardingLocation::GpuVertexShader =>
        {
            DrawerChoice::BillboardGpu(BillboardMode::VertexShader)
        }
        RendererKind::Billboard => DrawerChoice::BillboardCpu,
        RendererKind::Ribbon => DrawerChoice::Ribbon,
        RendererKind::Mesh => DrawerChoice::Mesh,
        RendererKind::Triangle => DrawerChoice::Triangle,
        RendererKind::Light => DrawerChoice::Light,
        RendererKind::Sound => DrawerChoice::Sound,
        RendererKind::Decal => DrawerChoice::Decal,
    })
}

/// Drawer of one batch
#[derive(Debug)]
pub enum BatchDrawer {
    /// CPU billboards
    BillboardCpu(BillboardCpuDrawer),
    /// GPU billboards
    BillboardGpu(BillboardGpuDrawer),
    /// Ribbons
    Ribbon(RibbonDrawer),
    /// Meshes
    Mesh(MeshDrawer),
    /// Triangles
    Triangle(TriangleDrawer),
    /// Lights
    Light(LightDrawer),
    /// Sounds
    Sound(SoundDrawer),
    /// Decals
    Decal(DecalDrawer),
}

impl BatchDrawer {
    /// Instantiate the drawer for `choice`
    pub fn new(choice: DrawerChoice) -> Self {
        match choice {
            DrawerChoice::BillboardCpu => Self::BillboardCpu(BillboardCpuDrawer::new()),
            DrawerChoice::BillboardGpu(mode) => Self::BillboardGpu(BillboardGpuDrawer::new(mode)),
            DrawerChoice::Ribbon => Self::Ribbon(RibbonDrawer::new()),
            DrawerChoice::Mesh => Self::Mesh(MeshDrawer::new()),
            DrawerChoice::Triangle => Self::Triangle(TriangleDrawer::new()),
            DrawerChoice::Light => Self::Light(LightDrawer::new()),
            DrawerChoice::Sound => Self::Sound(SoundDrawer::new()),
            DrawerChoice::Decal => Self::Decal(DecalDrawer::new()),
        }
    }

    /// Which drawer this is
    pub const fn choice(&self) -> DrawerChoice {
        match self {
            Self::BillboardCpu(_) => DrawerChoice::BillboardCpu,
            Self::BillboardGpu(drawer) => DrawerChoice::BillboardGpu(drawer.mode()),
            Self::Ribbon(_) => DrawerChoice::Ribbon,
            Self::Mesh(_) => DrawerChoice::Mesh,
            Self::Triangle(_) => DrawerChoice::Triangle,
            Self::Light(_) => DrawerChoice::Light,
            Self::Sound(_) => DrawerChoice::Sound,
            Self::Decal(_) => DrawerChoice::Decal,
        }
    }

    /// Stage machine of the drawer
    pub fn stages(&mut self) -> &mut dyn DrawerStages {
        match self {
            Self::BillboardCpu(drawer) => drawer,
            Self::BillboardGpu(drawer) => drawer,
            Self::Ribbon(drawer) => drawer,
            Self::Mesh(drawer) => drawer,
            Self::Triangle(drawer) => drawer,
            Self::Light(drawer) => drawer,
            Self::Sound(drawer) => drawer,
            Self::Decal(drawer) => drawer,
        }
    }
}

/// Whether two renderers can share a batch
///
/// The predicate is symmetric. Sounds and lights only merge with themselves;
/// geometry merges on identical material, flags and inputs.
pub fn are_renderers_compatible(a_key: CacheKey, a: &MaterialDesc, b_key: CacheKey, b: &MaterialDesc) -> bool {
    if a.kind != b.kind {
        return false;
    }
    if a_key == b_key {
        return true;
    }
    if matches!(a.kind, RendererKind::Light | RendererKind::Sound) {
        return false;
    }
    if a.flags.cast_shadows != b.flags.cast_shadows {
        return false;
    }
    let (Some(material_a), Some(material_b)) = (&a.material, &b.material) else {
        return false;
    };
    if material_a.id != material_b.id {
        return false;
    }
    match a.kind {
        RendererKind::Decal => true,
        RendererKind::Mesh => {
            a.flags == b.flags
                && a.additional_inputs == b.additional_inputs
                && a.mesh.as_ref().map(|m| m.id) == b.mesh.as_ref().map(|m| m.id)
        }
        _ => a.flags == b.flags && a.additional_inputs == b.additional_inputs,
    }
}

/// Geometry passes: main, shadow when casting, ray tracing when requested
pub(crate) fn geometry_can_render(ctx: &DrawContext<'_>, pass: &DrawPass, raytracing: bool) -> bool {
    match ctx.sub_view.pass() {
        RenderPassKind::Main => true,
        RenderPassKind::Shadow => pass.cast_shadows,
        RenderPassKind::RtAccelStructs => {
            raytracing && ctx.desc(pass.leader()).is_ok_and(|desc| desc.flags.raytraced)
        }
        RenderPassKind::PostUpdate => false,
    }
}

//! Shared fixtures for drawer tests

use std::sync::Arc;

use nalgebra::Point3;
use parking_lot::Mutex;

use crate::assets::{AssetRegistry, BlendMode, MaterialAsset};
use crate::config::{BatchingConfig, FrameSettings};
use crate::foundation::math::{Aabb, Mat4, Vec3};
use crate::render::api::{HeadlessBackend, HeadlessRecording};
use crate::render::buffer_pool::BufferPools;
use crate::render::drawers::DrawContext;
use crate::render::frame_collector::{DrawPass, PassRequest};
use crate::render::renderer_cache::{PendingCaches, RenderCacheTable, RendererCacheArena};
use crate::render::sub_view::{RenderPassKind, RendererSubView, SceneView};
use crate::simulation::{
    fields, DrawRequest, FieldData, MediumId, ParticlePage, ParticleStream, RendererDecl, StreamToRender,
};

/// Page of particles with unit size at `positions`
pub(crate) fn page(positions: &[[f32; 3]]) -> ParticlePage {
    ParticlePage::new(positions.len() as u32)
        .with_field(fields::POSITION, FieldData::Float3(positions.to_vec()))
        .with_field(fields::SIZE, FieldData::Float(vec![1.0; positions.len()]))
}

pub(crate) fn main_memory(pages: Vec<ParticlePage>) -> StreamToRender {
    StreamToRender::MainMemory(Arc::new(ParticleStream::new(pages)))
}

/// Camera on the +z axis looking at the origin
pub(crate) fn scene_view(z: f32) -> SceneView {
    let view = Mat4::look_at_rh(&Point3::new(0.0, 0.0, z), &Point3::origin(), &Vec3::y());
    let projection = Mat4::new_perspective(16.0 / 9.0, std::f32::consts::FRAC_PI_3, 0.1, 100.0);
    SceneView::new(view, projection)
}

pub(crate) fn main_view() -> RendererSubView {
    RendererSubView::render(RenderPassKind::Main, &[scene_view(5.0)], 1.0)
}

/// Assets, caches and a headless backend wired together
pub(crate) struct Fixture {
    pub assets: AssetRegistry,
    pub arena: RendererCacheArena,
    pub pending: PendingCaches,
    pub table: RenderCacheTable,
    pub pools: BufferPools,
    pub backend: HeadlessBackend,
    pub recording: Arc<Mutex<HeadlessRecording>>,
    pub settings: FrameSettings,
    next_medium: u64,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let assets = AssetRegistry::new();
        assets.insert_material(MaterialAsset::new(1, "smoke", BlendMode::Translucent));
        assets.insert_material(MaterialAsset::new(2, "fire", BlendMode::Additive));
        assets.insert_material(MaterialAsset::new(3, "opaque", BlendMode::Opaque));

        let pending = PendingCaches::new();
        let backend = HeadlessBackend::new();
        let recording = backend.recording();
        Self {
            assets,
            arena: RendererCacheArena::new(pending.clone()),
            pending,
            table: RenderCacheTable::new(),
            pools: BufferPools::new(),
            backend,
            recording,
            settings: BatchingConfig::default().resolve(true),
            next_medium: 1,
        }
    }

    /// One pass holding a request per stream, every request from its own medium
    pub(crate) fn pass(&mut self, decl: RendererDecl, streams: Vec<StreamToRender>) -> DrawPass {
        let decl = Arc::new(decl);
        let kind = decl.kind;
        let cast_shadows = decl.properties.cast_shadows;
        let mut pass: Option<DrawPass> = None;

        for stream in streams {
            let medium = MediumId(self.next_medium);
            self.next_medium += 1;
            let cache = self
                .arena
                .resolve(medium, 0, &decl, &self.assets)
                .expect("Should resolve the renderer cache");
            let request = PassRequest {
                medium,
                renderer_index: 0,
                cache,
                request: DrawRequest::new(0, stream, Aabb::invalid()),
            };
            match pass.as_mut() {
                Some(pass) => pass.push(request),
                None => pass = Some(DrawPass::new(kind, cast_shadows, request)),
            }
        }
        self.table.drain_pending(&self.pending);
        pass.expect("Should have at least one stream")
    }

    /// Render-thread context over the fixture's pools and backend
    pub(crate) fn context<'a>(&'a mut self, sub_view: &'a RendererSubView) -> DrawContext<'a> {
        let mut ctx = DrawContext::new(&self.settings, sub_view, &self.table);
        ctx.pools = Some(&mut self.pools);
        ctx.backend = Some(&mut self.backend);
        ctx
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.pools.destroy_all(&mut self.backend);
    }
}

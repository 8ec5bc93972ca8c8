//! # Render Batch Manager
//!
//! Glues the frame collectors to the render thread. The host drives it from
//! the update thread:
//!
//! 1. [`RenderBatchManager::pre_update`] resolves the frame settings
//! 2. [`RenderBatchManager::end_update`] collects both frames and runs the
//!    post-update pass (sounds, decals) right away
//! 3. [`RenderBatchManager::concurrent_send_render_dynamic_data`] hands the
//!    render frame over to the render thread
//! 4. [`RenderBatchManager::draw_calls`] is queued once per render pass
//!
//! ## Frame handoff
//!
//! The render thread keeps the last published frame in a slot shared with the
//! update thread. Publishing a new frame drops the previous one, which returns
//! it to the collector's pool. With early release enabled the update thread
//! may drop the slot's frame sooner, once it was drawn as many times as the
//! frame before it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::assets::{AssetResolver, MaterialId};
use crate::audio::AudioSink;
use crate::config::{BatchingConfig, FrameSettings};
use crate::foundation::time::Stopwatch;
use crate::render::api::GraphicsBackend;
use crate::render::batch_renderer::{BatchRenderer, BatchStats};
use crate::render::buffer_pool::BufferPools;
use crate::render::drawers::{DecalSink, DrawContext, SimpleLight};
use crate::render::frame_collector::{FrameCollector, FrameRef};
use crate::render::render_thread::{RenderThread, RenderThreadError};
use crate::render::renderer_cache::{PendingCaches, RenderCacheTable};
use crate::render::sub_view::RendererSubView;
use crate::simulation::{MediumCollection, RendererKind, RendererKindMask};

/// Kinds drawn on the render thread
pub fn render_kinds() -> RendererKindMask {
    RendererKind::Billboard.mask()
        | RendererKind::Ribbon.mask()
        | RendererKind::Mesh.mask()
        | RendererKind::Triangle.mask()
        | RendererKind::Light.mask()
}

/// Kinds handled on the update thread
pub fn update_kinds() -> RendererKindMask {
    RendererKind::Sound.mask() | RendererKind::Decal.mask()
}

/// Frame published to the render thread
#[derive(Debug, Default)]
pub struct CollectedSlot {
    frame: Option<FrameRef>,
    last_draw_called_count: u32,
}

impl CollectedSlot {
    /// Frame currently drawn by the render thread
    pub const fn frame(&self) -> Option<&FrameRef> {
        self.frame.as_ref()
    }

    /// Draw-call collections the previous frame went through
    pub const fn last_draw_called_count(&self) -> u32 {
        self.last_draw_called_count
    }
}

type SharedSlot = Arc<Mutex<CollectedSlot>>;

/// State owned by the render thread
pub struct RenderWorld {
    backend: Box<dyn GraphicsBackend>,
    pools: BufferPools,
    caches: RenderCacheTable,
    pending: PendingCaches,
    renderer: BatchRenderer,
    collected: SharedSlot,
    settings: FrameSettings,
    lights: Vec<SimpleLight>,
    gc_timer: Stopwatch,
}

impl std::fmt::Debug for RenderWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderWorld")
            .field("live_buffers", &self.pools.live_buffers())
            .field("caches", &self.caches.len())
            .field("batches", &self.renderer.batch_count())
            .field("lights", &self.lights.len())
            .finish()
    }
}

impl RenderWorld {
    fn new(
        backend: Box<dyn GraphicsBackend>,
        pending: PendingCaches,
        collected: SharedSlot,
        settings: FrameSettings,
    ) -> Self {
        Self {
            backend,
            pools: BufferPools::new(),
            caches: RenderCacheTable::new(),
            pending,
            renderer: BatchRenderer::new("render", false),
            collected,
            settings,
            lights: Vec::new(),
            gc_timer: Stopwatch::start_new(),
        }
    }

    /// Draw the published frame for one render pass
    ///
    /// Pending caches are drained first so every cache referenced by the frame
    /// is visible. Returns `None` when there is nothing to draw.
    pub fn draw_calls(&mut self, sub_view: &RendererSubView) -> Option<BatchStats> {
        self.garbage_buffer_pools();
        if sub_view.bb_views().is_empty() {
            return None;
        }
        self.caches.drain_pending(&self.pending);

        // Held for the whole pass: the update thread must not release the frame mid-draw
        let collected = Arc::clone(&self.collected);
        let slot = collected.lock();
        let frame = slot.frame.as_ref()?;

        let mut ctx = DrawContext::new(&self.settings, sub_view, &self.caches);
        ctx.pools = Some(&mut self.pools);
        ctx.backend = Some(&mut *self.backend);
        ctx.lights = Some(&mut self.lights);
        let stats = self.renderer.render_frame(frame, &mut ctx).clone();
        frame.mark_rendered();
        Some(stats)
    }

    /// Tick the pools and collect idle buffers once the interval elapsed
    pub fn garbage_buffer_pools(&mut self) -> usize {
        self.pools.frame_tick();
        if !self.gc_timer.lap_if_elapsed(self.settings.gc_interval_secs) {
            return 0;
        }
        let collected = self.pools.garbage_collect(&mut *self.backend);
        if collected > 0 {
            log::debug!("Garbage collected {} particle buffers", collected);
        }
        collected
    }

    /// Lights gathered by the main passes of the current frame
    pub fn gather_simple_lights(&self) -> &[SimpleLight] {
        &self.lights
    }

    /// Buffer pools
    pub const fn pools(&self) -> &BufferPools {
        &self.pools
    }

    /// Caches visible to the render thread
    pub const fn caches(&self) -> &RenderCacheTable {
        &self.caches
    }

    /// Drawers and their last statistics
    pub const fn renderer(&self) -> &BatchRenderer {
        &self.renderer
    }

    fn publish_frame(&mut self, frame: FrameRef, settings: FrameSettings) {
        self.settings = settings;
        self.lights.clear();
        let previous = {
            let mut slot = self.collected.lock();
            let previous = slot.frame.replace(frame);
            if let Some(previous) = &previous {
                slot.last_draw_called_count = previous.rendered_count();
            }
            previous
        };
        // Dropped outside the lock; this hands the slot back to the collector pool
        drop(previous);
    }

    fn destroy_batches(&mut self) {
        let sub_view = RendererSubView::post_update(1.0);
        let mut ctx = DrawContext::new(&self.settings, &sub_view, &self.caches);
        ctx.pools = Some(&mut self.pools);
        ctx.backend = Some(&mut *self.backend);
        self.renderer.destroy_batches(&mut ctx);
        self.collected.lock().frame = None;
        self.lights.clear();
        self.caches.clear();
    }

    fn destroy_pools(&mut self) {
        self.pools.destroy_all(&mut *self.backend);
    }
}

/// Update-thread side of the particle renderer
pub struct RenderBatchManager {
    settings: FrameSettings,
    backend_vertex_billboarding: bool,
    assets: Arc<dyn AssetResolver>,
    mediums: Option<Arc<dyn MediumCollection>>,
    render_collector: FrameCollector,
    update_collector: FrameCollector,
    update_caches: RenderCacheTable,
    update_renderer: BatchRenderer,
    audio: Option<Box<dyn AudioSink>>,
    decals: Option<Box<dyn DecalSink>>,
    last_collected: Option<FrameRef>,
    collected: SharedSlot,
    used_materials: Vec<MaterialId>,
    materials_changed: bool,
    render_thread: RenderThread<RenderWorld>,
}

impl std::fmt::Debug for RenderBatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderBatchManager")
            .field("set_up", &self.mediums.is_some())
            .field("render_collector", &self.render_collector)
            .field("update_collector", &self.update_collector)
            .field("used_materials", &self.used_materials.len())
            .field("render_thread", &self.render_thread)
            .finish()
    }
}

impl RenderBatchManager {
    /// Start the render thread; `backend` moves onto it
    pub fn new(
        config: &BatchingConfig,
        backend: Box<dyn GraphicsBackend>,
        assets: Arc<dyn AssetResolver>,
    ) -> Result<Self, RenderThreadError> {
        let backend_vertex_billboarding = backend.supports_vertex_billboarding();
        let settings = config.resolve(backend_vertex_billboarding);
        let render_pending = PendingCaches::new();
        let collected = SharedSlot::default();

        let world = RenderWorld::new(backend, render_pending.clone(), Arc::clone(&collected), settings);
        let render_thread = RenderThread::spawn("particle-render", world)?;
        log::info!(
            "Particle batch manager ready (frame pool {}, vertex billboarding {})",
            config.frame_pool_size,
            backend_vertex_billboarding
        );

        Ok(Self {
            settings,
            backend_vertex_billboarding,
            assets,
            mediums: None,
            render_collector: FrameCollector::new(
                "render",
                render_kinds(),
                false,
                config.frame_pool_size,
                render_pending,
            ),
            update_collector: FrameCollector::new(
                "update",
                update_kinds(),
                true,
                config.frame_pool_size,
                PendingCaches::new(),
            ),
            update_caches: RenderCacheTable::new(),
            update_renderer: BatchRenderer::new("update", true),
            audio: None,
            decals: None,
            last_collected: None,
            collected,
            used_materials: Vec::new(),
            materials_changed: false,
            render_thread,
        })
    }

    /// Route sound particles to `sink`
    #[must_use]
    pub fn with_audio_sink(mut self, sink: Box<dyn AudioSink>) -> Self {
        self.audio = Some(sink);
        self
    }

    /// Route decal particles to `sink`
    #[must_use]
    pub fn with_decal_sink(mut self, sink: Box<dyn DecalSink>) -> Self {
        self.decals = Some(sink);
        self
    }

    /// Start collecting from `mediums`
    pub fn setup(&mut self, mediums: Arc<dyn MediumCollection>) {
        if self.mediums.is_some() {
            log::warn!("Particle batch manager set up twice; replacing the medium collection");
            self.clean();
        }
        self.mediums = Some(mediums);
        self.render_collector.install();
        self.update_collector.install();
    }

    /// Whether [`Self::setup`] ran and [`Self::clean`] did not
    pub const fn is_set_up(&self) -> bool {
        self.mediums.is_some()
    }

    /// Settings of the current frame
    pub const fn settings(&self) -> &FrameSettings {
        &self.settings
    }

    /// Collector of render-thread kinds
    pub const fn render_collector(&self) -> &FrameCollector {
        &self.render_collector
    }

    /// Collector of update-thread kinds
    pub const fn update_collector(&self) -> &FrameCollector {
        &self.update_collector
    }

    /// Statistics of the last post-update pass
    pub const fn update_stats(&self) -> &BatchStats {
        self.update_renderer.stats()
    }

    /// Materials referenced by the last render frame, in first-use order
    pub fn used_materials(&self) -> &[MaterialId] {
        &self.used_materials
    }

    /// Whether the used material set changed during the last update
    pub const fn should_mark_render_state_dirty(&self) -> bool {
        self.materials_changed
    }

    /// Start a new update
    pub fn pre_update(&mut self, config: &BatchingConfig) {
        self.materials_changed = false;
        self.settings = config.resolve(self.backend_vertex_billboarding);
        if self.settings.early_frame_release {
            self.release_rendered_frame_ifp();
        }
    }

    /// Collect this tick's frames and run the post-update pass
    pub fn end_update(&mut self, update_view: &RendererSubView) {
        let Some(mediums) = self.mediums.clone() else {
            return;
        };

        if let Some(frame) = self
            .render_collector
            .collect_frame(&*mediums, &*self.assets, &self.settings)
        {
            self.track_used_materials(&frame);
            self.last_collected = Some(frame);
        }

        let Some(frame) = self
            .update_collector
            .collect_frame(&*mediums, &*self.assets, &self.settings)
        else {
            return;
        };
        self.update_caches.drain_pending(self.update_collector.pending());
        let mut ctx = DrawContext::new(&self.settings, update_view, &self.update_caches);
        ctx.audio = self.audio.as_deref_mut().map(|sink| sink as &mut dyn AudioSink);
        ctx.decals = self.decals.as_deref_mut().map(|sink| sink as &mut dyn DecalSink);
        self.update_renderer.render_frame(&frame, &mut ctx);
        frame.mark_rendered();
    }

    /// Hand the last collected frame to the render thread
    ///
    /// Returns `false` when no new frame was collected since the last call.
    pub fn concurrent_send_render_dynamic_data(&mut self) -> Result<bool, RenderThreadError> {
        let Some(frame) = self.last_collected.take() else {
            return Ok(false);
        };
        let settings = self.settings;
        self.render_thread
            .enqueue(move |world| world.publish_frame(frame, settings))?;
        Ok(true)
    }

    /// Queue the draw calls of one render pass
    pub fn draw_calls(&self, sub_view: RendererSubView) -> Result<(), RenderThreadError> {
        self.render_thread.enqueue(move |world| {
            world.draw_calls(&sub_view);
        })
    }

    /// Queue arbitrary work on the render thread
    pub fn enqueue_render(
        &self,
        task: impl FnOnce(&mut RenderWorld) + Send + 'static,
    ) -> Result<(), RenderThreadError> {
        self.render_thread.enqueue(task)
    }

    /// Run work on the render thread and wait for its result
    pub fn query_render<R, F>(&self, task: F) -> Result<R, RenderThreadError>
    where
        R: Send + 'static,
        F: FnOnce(&mut RenderWorld) -> R + Send + 'static,
    {
        self.render_thread.query(task)
    }

    /// Wait for every queued render command
    pub fn flush(&self) -> Result<(), RenderThreadError> {
        self.render_thread.flush()
    }

    /// Copy of the lights gathered so far this frame
    pub fn gather_simple_lights(&self) -> Result<Vec<SimpleLight>, RenderThreadError> {
        self.render_thread
            .query(|world| world.gather_simple_lights().to_vec())
    }

    /// Drop the published frame if it was drawn as often as the frame before it
    ///
    /// Never waits: when the render thread holds the frame nothing happens.
    pub fn release_rendered_frame_ifp(&self) -> bool {
        let Some(mut slot) = self.collected.try_lock() else {
            return false;
        };
        let expected = slot.last_draw_called_count.max(1);
        let Some(rendered) = slot
            .frame
            .as_ref()
            .filter(|frame| frame.is_fully_rendered(expected))
            .map(|frame| frame.rendered_count())
        else {
            return false;
        };
        slot.last_draw_called_count = rendered;
        slot.frame = None;
        log::trace!("Released collected frame after {} draw-call collections", rendered);
        true
    }

    /// Stop collecting and drop every batch on both threads
    pub fn clean(&mut self) {
        if let Err(error) = self
            .render_thread
            .enqueue(RenderWorld::destroy_batches)
            .and_then(|()| self.render_thread.flush())
        {
            log::error!("Failed to destroy render batches: {}", error);
        }

        self.last_collected = None;
        self.render_collector.uninstall();
        self.update_collector.uninstall();

        let sub_view = RendererSubView::post_update(1.0);
        let mut ctx = DrawContext::new(&self.settings, &sub_view, &self.update_caches);
        ctx.audio = self.audio.as_deref_mut().map(|sink| sink as &mut dyn AudioSink);
        ctx.decals = self.decals.as_deref_mut().map(|sink| sink as &mut dyn DecalSink);
        self.update_renderer.destroy_batches(&mut ctx);
        self.update_caches.clear();

        self.used_materials.clear();
        self.mediums = None;
        log::debug!("Particle batch manager cleaned");
    }

    fn track_used_materials(&mut self, frame: &FrameRef) {
        let arena = self.render_collector.arena();
        let mut materials: Vec<MaterialId> = Vec::new();
        for pass in frame.passes() {
            for key in pass.caches() {
                let Some(id) = arena.get(key).and_then(|cache| cache.desc().material_id()) else {
                    continue;
                };
                if !materials.contains(&id) {
                    materials.push(id);
                }
            }
        }
        if materials != self.used_materials {
            self.used_materials = materials;
            self.materials_changed = true;
        }
    }
}

impl Drop for RenderBatchManager {
    fn drop(&mut self) {
        if self.is_set_up() {
            self.clean();
        }
        if let Err(error) = self
            .render_thread
            .enqueue(RenderWorld::destroy_pools)
            .and_then(|()| self.render_thread.flush())
        {
            log::error!("Failed to destroy particle buffer pools: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{AssetRegistry, BlendMode, MaterialAsset};
    use crate::audio::RecordingAudioSink;
    use crate::foundation::math::Aabb;
    use crate::render::api::{HeadlessBackend, HeadlessRecording};
    use crate::render::drawers::test_support;
    use crate::simulation::{
        fields, DrawRequest, FieldData, MediumFrame, MediumId, MediumRegistry, ParticlePage, RendererDecl,
    };

    struct Harness {
        manager: RenderBatchManager,
        registry: Arc<MediumRegistry>,
        recording: Arc<Mutex<HeadlessRecording>>,
        config: BatchingConfig,
    }

    impl Harness {
        fn new(config: BatchingConfig) -> Self {
            let assets = AssetRegistry::new();
            assets.insert_material(MaterialAsset::new(1, "smoke", BlendMode::Translucent));
            assets.insert_material(MaterialAsset::new(2, "fire", BlendMode::Additive));
            let backend = HeadlessBackend::new();
            let recording = backend.recording();
            let registry = Arc::new(MediumRegistry::new());
            let mut manager = RenderBatchManager::new(&config, Box::new(backend), Arc::new(assets))
                .expect("Should start the render thread");
            manager.setup(Arc::clone(&registry) as Arc<dyn MediumCollection>);
            Self {
                manager,
                registry,
                recording,
                config,
            }
        }

        fn add_medium(&self, id: u64, decl: RendererDecl, page: ParticlePage) {
            let stream = test_support::main_memory(vec![page]);
            self.registry.set_medium(MediumFrame {
                id: MediumId(id),
                renderers: vec![Arc::new(decl)],
                requests: vec![DrawRequest::new(0, stream, Aabb::invalid())],
            });
        }

        fn update(&mut self) {
            self.manager.pre_update(&self.config);
            self.manager.end_update(&RendererSubView::post_update(1.0));
            self.manager
                .concurrent_send_render_dynamic_data()
                .expect("Should send the frame");
        }

        fn draw_main(&self) {
            self.manager
                .draw_calls(test_support::main_view())
                .expect("Should queue draw calls");
            self.manager.flush().expect("Should flush");
        }
    }

    fn billboards() -> RendererDecl {
        RendererDecl::new(RendererKind::Billboard).with_material("smoke")
    }

    #[test]
    fn test_frame_drawn_on_render_thread() {
        let mut harness = Harness::new(BatchingConfig::default());
        harness.add_medium(1, billboards(), test_support::page(&[[0.0; 3], [1.0, 0.0, 0.0]]));

        harness.update();
        harness.draw_main();

        assert_eq!(harness.recording.lock().draws.len(), 1);
        let caches = harness
            .manager
            .query_render(|world| world.caches().len())
            .expect("Should answer");
        assert_eq!(caches, 1);
    }

    #[test]
    fn test_nothing_drawn_before_first_send() {
        let harness = Harness::new(BatchingConfig::default());
        harness.add_medium(1, billboards(), test_support::page(&[[0.0; 3]]));
        harness.draw_main();
        assert!(harness.recording.lock().draws.is_empty());
    }

    #[test]
    fn test_release_waits_for_draw_calls() {
        let mut harness = Harness::new(BatchingConfig::default());
        harness.add_medium(1, billboards(), test_support::page(&[[0.0; 3]]));
        harness.update();
        harness.manager.flush().expect("Should flush");

        // published but never drawn
        assert!(!harness.manager.release_rendered_frame_ifp());

        harness.draw_main();
        assert!(harness.manager.release_rendered_frame_ifp());
        assert!(!harness.manager.release_rendered_frame_ifp());
        assert_eq!(harness.manager.render_collector().skipped_frames(), 0);
    }

    #[test]
    fn test_release_expects_previous_draw_count() {
        let mut harness = Harness::new(BatchingConfig::default());
        harness.add_medium(1, billboards(), test_support::page(&[[0.0; 3]]));
        harness.update();
        harness.draw_main();
        harness.draw_main();

        // The second frame must be drawn twice, like the first
        harness.update();
        harness.draw_main();
        assert!(!harness.manager.release_rendered_frame_ifp());
        harness.draw_main();
        assert!(harness.manager.release_rendered_frame_ifp());
    }

    #[test]
    fn test_lights_gathered_by_main_pass() {
        let mut harness = Harness::new(BatchingConfig::default());
        let page = test_support::page(&[[0.0; 3], [1.0, 0.0, 0.0]])
            .with_field(fields::RANGE, FieldData::Float(vec![1.0, 2.0]));
        harness.add_medium(1, RendererDecl::new(RendererKind::Light), page);

        harness.update();
        harness.draw_main();
        let lights = harness.manager.gather_simple_lights().expect("Should answer");
        assert_eq!(lights.len(), 2);

        // A new frame starts with an empty light list
        harness.update();
        harness.manager.flush().expect("Should flush");
        assert!(harness.manager.gather_simple_lights().expect("Should answer").is_empty());
    }

    #[test]
    fn test_sounds_played_on_update() {
        let config = BatchingConfig::default();
        let assets = AssetRegistry::new();
        let sink = RecordingAudioSink::new(["hum"]);
        let voices = sink.recording();
        let registry = Arc::new(MediumRegistry::new());
        let mut manager = RenderBatchManager::new(&config, Box::new(HeadlessBackend::new()), Arc::new(assets))
            .expect("Should start the render thread")
            .with_audio_sink(Box::new(sink));
        manager.setup(Arc::clone(&registry) as Arc<dyn MediumCollection>);

        let page = test_support::page(&[[0.0; 3], [1.0, 0.0, 0.0]])
            .with_field(fields::SELF_ID, FieldData::Int2(vec![[1, 0], [2, 0]]));
        registry.set_medium(MediumFrame {
            id: MediumId(1),
            renderers: vec![Arc::new(RendererDecl::new(RendererKind::Sound).with_sound("hum"))],
            requests: vec![DrawRequest::new(0, test_support::main_memory(vec![page]), Aabb::invalid())],
        });

        manager.pre_update(&config);
        manager.end_update(&RendererSubView::post_update(1.0));
        assert_eq!(voices.lock().playing_count(), 2);
        assert_eq!(manager.update_stats().drawn_passes, 1);

        manager.clean();
        assert_eq!(voices.lock().playing_count(), 0);
    }

    #[test]
    fn test_material_changes_mark_render_state_dirty() {
        let mut harness = Harness::new(BatchingConfig::default());
        harness.add_medium(1, billboards(), test_support::page(&[[0.0; 3]]));

        harness.update();
        assert!(harness.manager.should_mark_render_state_dirty());
        assert_eq!(harness.manager.used_materials(), &[MaterialId(1)]);

        harness.update();
        assert!(!harness.manager.should_mark_render_state_dirty());

        harness.add_medium(
            2,
            RendererDecl::new(RendererKind::Billboard).with_material("fire"),
            test_support::page(&[[0.0; 3]]),
        );
        harness.update();
        assert!(harness.manager.should_mark_render_state_dirty());
        assert_eq!(harness.manager.used_materials(), &[MaterialId(1), MaterialId(2)]);
    }

    #[test]
    fn test_idle_buffers_collected() {
        let mut harness = Harness::new(BatchingConfig::default().with_gc_interval(0.0));
        harness.add_medium(1, billboards(), test_support::page(&[[0.0; 3]]));
        harness.update();
        harness.draw_main();
        assert!(harness.recording.lock().live_buffer_count() > 0);

        // Without requests the batch is dropped and its buffers go idle
        harness.registry.set_requests(MediumId(1), Vec::new());
        harness.update();
        for _ in 0..8 {
            harness.draw_main();
        }
        assert_eq!(harness.recording.lock().live_buffer_count(), 0);
    }

    #[test]
    fn test_drop_destroys_every_buffer() {
        let mut harness = Harness::new(BatchingConfig::default());
        harness.add_medium(1, billboards(), test_support::page(&[[0.0; 3]]));
        harness.update();
        harness.draw_main();
        let recording = Arc::clone(&harness.recording);
        assert!(recording.lock().created_buffers > 0);

        drop(harness);
        assert_eq!(recording.lock().live_buffer_count(), 0);
    }
}

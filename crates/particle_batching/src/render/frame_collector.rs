//! Per-tick collection of draw passes
//!
//! A [`FrameCollector`] walks every live medium once per update tick, resolves
//! the renderer cache of each draw request it handles and greedily merges
//! compatible requests into [`DrawPass`]es. The result is an immutable
//! [`CollectedFrame`] shared with whoever renders it.
//!
//! ## Frame lifetime
//!
//! Frames live in a bounded [`FramePool`]. A slot is handed out again only when
//! the pool holds the last reference to it, so a frame still captured by a
//! pending render command is never overwritten. When every slot is in flight
//! the tick is skipped instead of waiting.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::assets::AssetResolver;
use crate::config::FrameSettings;
use crate::foundation::collections::CacheKey;
use crate::foundation::math::Aabb;
use crate::render::drawers;
use crate::render::renderer_cache::{PendingCaches, RendererCacheArena};
use crate::render::sub_view::{RenderPassKind, RendererSubView, SceneView};
use crate::simulation::{
    DrawRequest, MediumCollection, MediumEvent, MediumId, ParticlePage, RendererKind, RendererKindMask,
    StorageClass,
};

/// Identity of a batch across frames: the cache that opened it and its storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchKey {
    /// Cache of the first renderer merged into the batch
    pub leader: CacheKey,
    /// Storage class of every request of the batch
    pub storage: StorageClass,
}

/// One renderer's draw request inside a pass
#[derive(Debug, Clone)]
pub struct PassRequest {
    /// Owning medium
    pub medium: MediumId,
    /// Renderer index inside the medium
    pub renderer_index: u32,
    /// Renderer cache
    pub cache: CacheKey,
    /// Particles to draw
    pub request: DrawRequest,
}

/// Compatible draw requests merged into one batch
#[derive(Debug, Clone)]
pub struct DrawPass {
    /// Renderer kind of every request
    pub kind: RendererKind,
    /// Storage class of every request
    pub storage: StorageClass,
    /// Batch identity
    pub batch: BatchKey,
    /// Requests in collection order
    pub requests: Vec<PassRequest>,
    /// Particles across every request
    pub total_particle_count: u32,
    /// Whether the batch casts shadows
    pub cast_shadows: bool,
    /// Union of the valid request bounds
    pub bounds: Aabb,
}

impl DrawPass {
    /// Pass opened by `request`, which becomes its leader
    pub fn new(kind: RendererKind, cast_shadows: bool, request: PassRequest) -> Self {
        let storage = request.request.storage_class();
        let mut pass = Self {
            kind,
            storage,
            batch: BatchKey {
                leader: request.cache,
                storage,
            },
            requests: Vec::new(),
            total_particle_count: 0,
            cast_shadows,
            bounds: Aabb::invalid(),
        };
        pass.push(request);
        pass
    }

    /// Append a compatible request
    ///
    /// The total saturates, so oversized passes fail buffer allocation instead
    /// of wrapping.
    pub fn push(&mut self, request: PassRequest) {
        self.total_particle_count = self
            .total_particle_count
            .saturating_add(request.request.particle_count());
        if request.request.bounds.is_valid() {
            self.bounds.union(&request.request.bounds);
        }
        self.requests.push(request);
    }

    /// Cache of the first request
    pub const fn leader(&self) -> CacheKey {
        self.batch.leader
    }

    /// Caches of every request, in request order
    pub fn caches(&self) -> impl Iterator<Item = CacheKey> + '_ {
        self.requests.iter().map(|r| r.cache)
    }

    /// Main-memory pages of every request, in request order
    pub fn pages(&self) -> impl Iterator<Item = &ParticlePage> + Clone + '_ {
        self.requests
            .iter()
            .filter_map(|r| r.request.stream.main_memory())
            .flat_map(|stream| stream.pages.iter())
    }

    /// First particle of every request in the flattened pass, plus the total
    pub fn request_offsets(&self) -> Vec<u32> {
        let mut offsets = Vec::with_capacity(self.requests.len() + 1);
        let mut offset = 0_u32;
        for request in &self.requests {
            offsets.push(offset);
            offset = offset.saturating_add(request.request.particle_count());
        }
        offsets.push(offset);
        offsets
    }
}

/// Immutable snapshot of one tick's passes
#[derive(Debug, Default)]
pub struct CollectedFrame {
    frame_id: u64,
    passes: Vec<DrawPass>,
    medium_events: Vec<(MediumId, MediumEvent)>,
    rendered_count: AtomicU32,
}

impl CollectedFrame {
    fn reset(&mut self, frame_id: u64) {
        self.frame_id = frame_id;
        self.passes.clear();
        self.medium_events.clear();
        *self.rendered_count.get_mut() = 0;
    }

    #[cfg(test)]
    pub(crate) fn set_passes(&mut self, passes: Vec<DrawPass>) {
        self.passes = passes;
    }

    /// Monotonic id of the tick that built the frame
    pub const fn frame_id(&self) -> u64 {
        self.frame_id
    }

    /// Passes in collection order
    pub fn passes(&self) -> &[DrawPass] {
        &self.passes
    }

    /// Medium notifications received since the previous frame
    pub fn medium_events(&self) -> &[(MediumId, MediumEvent)] {
        &self.medium_events
    }

    /// Number of draw-call collections that consumed the frame
    pub fn rendered_count(&self) -> u32 {
        self.rendered_count.load(Ordering::Acquire)
    }

    /// Record one draw-call collection
    pub fn mark_rendered(&self) -> u32 {
        self.rendered_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether the frame was consumed `expected` times
    pub fn is_fully_rendered(&self, expected: u32) -> bool {
        self.rendered_count() >= expected
    }
}

/// Shared handle on a collected frame
pub type FrameRef = Arc<CollectedFrame>;

/// Bounded pool of collected frames
#[derive(Debug)]
pub struct FramePool {
    slots: Vec<FrameRef>,
    next_frame_id: u64,
}

impl FramePool {
    /// Pool of `size` frames (at least one)
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size.max(1)).map(|_| Arc::new(CollectedFrame::default())).collect(),
            next_frame_id: 1,
        }
    }

    /// Fill the first free slot and share it; `None` when every slot is in flight
    pub fn build(&mut self, fill: impl FnOnce(&mut CollectedFrame)) -> Option<FrameRef> {
        let index = self
            .slots
            .iter_mut()
            .position(|slot| Arc::get_mut(slot).is_some())?;
        let frame = Arc::get_mut(&mut self.slots[index])?;
        frame.reset(self.next_frame_id);
        fill(frame);
        self.next_frame_id += 1;
        Some(Arc::clone(&self.slots[index]))
    }

    /// Frames referenced outside the pool
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| Arc::strong_count(slot) > 1).count()
    }

    /// Slot count
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Whether `bounds`, scaled to world space, can be seen from `view`
pub fn is_visible_in_view(
    bounds: &Aabb,
    view: &SceneView,
    sub_view: &RendererSubView,
    settings: &FrameSettings,
) -> bool {
    if !bounds.is_valid() {
        return true;
    }
    match sub_view.pass() {
        RenderPassKind::RtAccelStructs | RenderPassKind::PostUpdate => true,
        RenderPassKind::Shadow if !settings.enable_shadow_late_cull => true,
        RenderPassKind::Main | RenderPassKind::Shadow => {
            view.visible && view.frustum().intersects_aabb(&bounds.scaled(sub_view.global_scale()))
        }
    }
}

/// Whether `bounds` is hidden from every view of the pass
pub fn is_late_culled(bounds: &Aabb, sub_view: &RendererSubView, settings: &FrameSettings) -> bool {
    if sub_view.views().is_empty() || !bounds.is_valid() {
        return false;
    }
    !sub_view
        .views()
        .iter()
        .any(|view| is_visible_in_view(bounds, view, sub_view, settings))
}

/// Walks the mediums once per tick and builds collected frames
pub struct FrameCollector {
    name: &'static str,
    kinds: RendererKindMask,
    release_on_cull: bool,
    installed: bool,
    arena: RendererCacheArena,
    pending: PendingCaches,
    frames: FramePool,
    subscribed: HashSet<MediumId>,
    events: Arc<Mutex<Vec<(MediumId, MediumEvent)>>>,
    skipped_frames: u64,
}

impl std::fmt::Debug for FrameCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCollector")
            .field("name", &self.name)
            .field("kinds", &self.kinds)
            .field("installed", &self.installed)
            .field("caches", &self.arena.len())
            .field("frames_in_flight", &self.frames.in_flight())
            .finish()
    }
}

impl FrameCollector {
    /// Collector for `kinds`, publishing its caches into `pending`
    pub fn new(
        name: &'static str,
        kinds: RendererKindMask,
        release_on_cull: bool,
        frame_pool_size: usize,
        pending: PendingCaches,
    ) -> Self {
        Self {
            name,
            kinds,
            release_on_cull,
            installed: false,
            arena: RendererCacheArena::new(pending.clone()),
            pending,
            frames: FramePool::new(frame_pool_size),
            subscribed: HashSet::new(),
            events: Arc::new(Mutex::new(Vec::new())),
            skipped_frames: 0,
        }
    }

    /// Collector name used in logs
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Renderer kinds handled
    pub const fn kinds(&self) -> RendererKindMask {
        self.kinds
    }

    /// Whether culled passes release their drawer resources
    pub const fn release_on_cull(&self) -> bool {
        self.release_on_cull
    }

    /// Queue the render side drains before drawing
    pub const fn pending(&self) -> &PendingCaches {
        &self.pending
    }

    /// Update-side caches
    pub const fn arena(&self) -> &RendererCacheArena {
        &self.arena
    }

    /// Whether the collector is installed
    pub const fn is_installed(&self) -> bool {
        self.installed
    }

    /// Ticks skipped because every frame was in flight
    pub const fn skipped_frames(&self) -> u64 {
        self.skipped_frames
    }

    /// Start collecting
    pub fn install(&mut self) {
        self.installed = true;
        log::debug!("Installed frame collector '{}' ({:?})", self.name, self.kinds);
    }

    /// Stop collecting and forget every cache
    pub fn uninstall(&mut self) {
        if !self.installed {
            return;
        }
        self.installed = false;
        let mediums: Vec<MediumId> = self.subscribed.drain().collect();
        for medium in mediums {
            self.arena.remove_medium(medium);
        }
        self.events.lock().clear();
        log::debug!("Uninstalled frame collector '{}'", self.name);
    }

    /// Forget resolved caches so they pick up changed assets
    pub fn invalidate_caches(&mut self) {
        self.arena.invalidate_all();
    }

    /// Collect this tick's passes
    ///
    /// Returns `None` when the collector is not installed or every frame of the
    /// pool is still referenced.
    pub fn collect_frame(
        &mut self,
        mediums: &dyn MediumCollection,
        assets: &dyn AssetResolver,
        settings: &FrameSettings,
    ) -> Option<FrameRef> {
        if !self.installed {
            return None;
        }

        let snapshot = mediums.mediums();
        for medium in &snapshot {
            if self.subscribed.insert(medium.id) {
                let events = Arc::clone(&self.events);
                mediums.subscribe(
                    medium.id,
                    Arc::new(move |id, event| events.lock().push((id, event))),
                );
            }
        }

        let events = std::mem::take(&mut *self.events.lock());
        for (medium, event) in &events {
            if *event == MediumEvent::Destroyed {
                self.arena.remove_medium(*medium);
                self.subscribed.remove(medium);
            }
        }

        let mut passes: Vec<DrawPass> = Vec::new();
        for medium in &snapshot {
            for request in &medium.requests {
                let Some(decl) = medium.renderers.get(request.renderer_index as usize) else {
                    log::debug!(
                        "Medium {:?} has no renderer {}",
                        medium.id,
                        request.renderer_index
                    );
                    continue;
                };
                if !self.kinds.contains_kind(decl.kind) || request.particle_count() == 0 {
                    continue;
                }
                if decl.kind == RendererKind::Sound && !settings.enable_audio {
                    continue;
                }
                let Some(cache) = self
                    .arena
                    .resolve(medium.id, request.renderer_index, decl, assets)
                else {
                    continue;
                };
                let Some(desc) = self.arena.get(cache).map(|c| c.desc()) else {
                    continue;
                };

                let entry = PassRequest {
                    medium: medium.id,
                    renderer_index: request.renderer_index,
                    cache,
                    request: request.clone(),
                };
                let storage = request.storage_class();
                let arena = &self.arena;
                let target = passes.iter_mut().find(|pass| {
                    pass.kind == decl.kind
                        && pass.storage == storage
                        && arena.get(pass.leader()).is_some_and(|leader| {
                            drawers::are_renderers_compatible(pass.leader(), leader.desc(), cache, desc)
                        })
                });
                match target {
                    Some(pass) => pass.push(entry),
                    None => passes.push(DrawPass::new(decl.kind, desc.flags.cast_shadows, entry)),
                }
            }
        }

        let frame = self.frames.build(|frame| {
            frame.passes = passes;
            frame.medium_events = events;
        });
        match &frame {
            Some(frame) => log::trace!(
                "Collector '{}' built frame {} with {} passes",
                self.name,
                frame.frame_id(),
                frame.passes().len()
            ),
            None => {
                self.skipped_frames += 1;
                log::debug!(
                    "Collector '{}' skipped a tick: all {} frames in flight",
                    self.name,
                    self.frames.capacity()
                );
            }
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{AssetRegistry, BlendMode, MaterialAsset};
    use crate::foundation::math::{Mat4, Vec3};
    use crate::render::api::GpuBufferHandle;
    use crate::simulation::{
        GpuParticleStream, MediumFrame, MediumRegistry, ParticlePage, ParticleStream, RendererDecl,
        StreamToRender,
    };
    use nalgebra::Point3;
    use std::collections::HashMap;

    fn assets() -> AssetRegistry {
        let assets = AssetRegistry::new();
        assets.insert_material(MaterialAsset::new(1, "smoke", BlendMode::Translucent));
        assets.insert_material(MaterialAsset::new(2, "fire", BlendMode::Additive));
        assets
    }

    fn cpu(count: u32) -> StreamToRender {
        StreamToRender::MainMemory(Arc::new(ParticleStream::new(vec![ParticlePage::new(count)])))
    }

    fn gpu(capacity: u32) -> StreamToRender {
        StreamToRender::Gpu(Arc::new(GpuParticleStream {
            simulation_buffer: GpuBufferHandle(1),
            size_buffer: GpuBufferHandle(2),
            particle_capacity: capacity,
            field_offsets: HashMap::new(),
        }))
    }

    fn medium(id: u64, renderers: Vec<RendererDecl>, requests: Vec<DrawRequest>) -> MediumFrame {
        MediumFrame {
            id: MediumId(id),
            renderers: renderers.into_iter().map(Arc::new).collect(),
            requests,
        }
    }

    fn collector(kinds: RendererKindMask) -> FrameCollector {
        let mut collector = FrameCollector::new("test", kinds, false, 4, PendingCaches::new());
        collector.install();
        collector
    }

    #[test]
    fn test_same_material_merges_into_one_pass() {
        let registry = MediumRegistry::new();
        let decl = RendererDecl::new(RendererKind::Billboard).with_material("smoke");
        registry.set_medium(medium(1, vec![decl.clone()], vec![DrawRequest::new(0, cpu(10), Aabb::invalid())]));
        registry.set_medium(medium(2, vec![decl], vec![DrawRequest::new(0, cpu(5), Aabb::invalid())]));

        let mut collector = collector(RendererKindMask::all());
        let frame = collector
            .collect_frame(&registry, &assets(), &FrameSettings::default())
            .expect("Should collect");

        assert_eq!(frame.passes().len(), 1);
        let pass = &frame.passes()[0];
        assert_eq!(pass.requests.len(), 2);
        assert_eq!(pass.total_particle_count, 15);
        assert_eq!(pass.requests[0].medium, MediumId(1));
    }

    #[test]
    fn test_particle_total_saturates_on_huge_gpu_passes() {
        let request = |capacity| PassRequest {
            medium: MediumId(1),
            renderer_index: 0,
            cache: CacheKey::default(),
            request: DrawRequest::new(0, gpu(capacity), Aabb::invalid()),
        };
        let mut pass = DrawPass::new(RendererKind::Billboard, false, request(0x8000_0000));
        pass.push(request(0x8000_0000));

        assert_eq!(pass.total_particle_count, u32::MAX);
        assert_eq!(pass.request_offsets(), vec![0, 0x8000_0000, u32::MAX]);
    }

    #[test]
    fn test_storage_classes_never_merge() {
        let registry = MediumRegistry::new();
        let decl = RendererDecl::new(RendererKind::Billboard).with_material("smoke");
        registry.set_medium(medium(
            1,
            vec![decl.clone(), decl],
            vec![
                DrawRequest::new(0, cpu(10), Aabb::invalid()),
                DrawRequest::new(1, gpu(64), Aabb::invalid()),
            ],
        ));

        let mut collector = collector(RendererKindMask::all());
        let frame = collector
            .collect_frame(&registry, &assets(), &FrameSettings::default())
            .expect("Should collect");

        assert_eq!(frame.passes().len(), 2);
        for pass in frame.passes() {
            assert!(pass.requests.iter().all(|r| r.request.storage_class() == pass.storage));
        }
    }

    #[test]
    fn test_kinds_outside_the_mask_are_ignored() {
        let registry = MediumRegistry::new();
        registry.set_medium(medium(
            1,
            vec![
                RendererDecl::new(RendererKind::Billboard).with_material("smoke"),
                RendererDecl::new(RendererKind::Light),
            ],
            vec![
                DrawRequest::new(0, cpu(10), Aabb::invalid()),
                DrawRequest::new(1, cpu(3), Aabb::invalid()),
            ],
        ));

        let mut collector = collector(RendererKind::Light.mask());
        let frame = collector
            .collect_frame(&registry, &assets(), &FrameSettings::default())
            .expect("Should collect");
        assert_eq!(frame.passes().len(), 1);
        assert_eq!(frame.passes()[0].kind, RendererKind::Light);
    }

    #[test]
    fn test_unresolved_renderer_is_skipped() {
        let registry = MediumRegistry::new();
        registry.set_medium(medium(
            1,
            vec![
                RendererDecl::new(RendererKind::Billboard).with_material("missing"),
                RendererDecl::new(RendererKind::Billboard).with_material("fire"),
            ],
            vec![
                DrawRequest::new(0, cpu(10), Aabb::invalid()),
                DrawRequest::new(1, cpu(4), Aabb::invalid()),
            ],
        ));

        let mut collector = collector(RendererKindMask::all());
        let frame = collector
            .collect_frame(&registry, &assets(), &FrameSettings::default())
            .expect("Should collect");
        assert_eq!(frame.passes().len(), 1);
        assert_eq!(frame.passes()[0].total_particle_count, 4);
    }

    #[test]
    fn test_frame_pool_never_hands_out_referenced_frames() {
        let registry = MediumRegistry::new();
        let mut collector = FrameCollector::new("test", RendererKindMask::all(), false, 2, PendingCaches::new());
        collector.install();
        let settings = FrameSettings::default();

        let first = collector.collect_frame(&registry, &assets(), &settings).expect("first");
        let second = collector.collect_frame(&registry, &assets(), &settings).expect("second");
        assert!(collector.collect_frame(&registry, &assets(), &settings).is_none());
        assert_eq!(collector.skipped_frames(), 1);

        drop(first);
        let third = collector.collect_frame(&registry, &assets(), &settings).expect("third");
        assert_ne!(third.frame_id(), second.frame_id());
        assert_eq!(third.rendered_count(), 0);
    }

    #[test]
    fn test_rendered_count_fence() {
        let mut pool = FramePool::new(1);
        let frame = pool.build(|_| {}).expect("Should build");
        assert!(!frame.is_fully_rendered(2));
        frame.mark_rendered();
        frame.mark_rendered();
        assert!(frame.is_fully_rendered(2));
        assert_eq!(pool.in_flight(), 1);
    }

    #[test]
    fn test_destroyed_medium_drops_caches() {
        let registry = MediumRegistry::new();
        registry.set_medium(medium(
            7,
            vec![RendererDecl::new(RendererKind::Billboard).with_material("smoke")],
            vec![DrawRequest::new(0, cpu(10), Aabb::invalid())],
        ));
        let mut collector = collector(RendererKindMask::all());
        let settings = FrameSettings::default();

        drop(collector.collect_frame(&registry, &assets(), &settings));
        assert_eq!(collector.arena().len(), 1);

        registry.destroy_medium(MediumId(7));
        let frame = collector.collect_frame(&registry, &assets(), &settings).expect("Should collect");
        assert_eq!(frame.medium_events(), &[(MediumId(7), MediumEvent::Destroyed)]);
        assert!(collector.arena().is_empty());
    }

    #[test]
    fn test_late_cull_rules() {
        let view = Mat4::look_at_rh(
            &Point3::new(0.0, 0.0, 10.0),
            &Point3::origin(),
            &Vec3::y(),
        );
        let projection = Mat4::new_perspective(1.0, 1.0, 0.1, 100.0);
        let views = [SceneView::new(view, projection)];
        let settings = FrameSettings::default();
        let behind = Aabb::from_center_extents(Vec3::new(0.0, 0.0, 50.0), Vec3::repeat(1.0));
        let ahead = Aabb::from_center_extents(Vec3::zeros(), Vec3::repeat(1.0));

        let main = RendererSubView::render(RenderPassKind::Main, &views, 1.0);
        assert!(is_late_culled(&behind, &main, &settings));
        assert!(!is_late_culled(&ahead, &main, &settings));
        assert!(!is_late_culled(&Aabb::invalid(), &main, &settings));

        let rt = RendererSubView::render(RenderPassKind::RtAccelStructs, &views, 1.0);
        assert!(!is_late_culled(&behind, &rt, &settings));

        let shadow = RendererSubView::render(RenderPassKind::Shadow, &views, 1.0);
        let no_shadow_cull = FrameSettings {
            enable_shadow_late_cull: false,
            ..settings
        };
        assert!(is_late_culled(&behind, &shadow, &settings));
        assert!(!is_late_culled(&behind, &shadow, &no_shadow_cull));

        let empty = RendererSubView::render(RenderPassKind::Main, &[], 1.0);
        assert!(!is_late_culled(&behind, &empty, &settings));
    }
}

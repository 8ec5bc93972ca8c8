//! # Batch Renderer
//!
//! Hosts the drawers of one frame collector and runs every pass of a
//! [`CollectedFrame`] through its drawer's stage machine.
//!
//! ## Architecture
//!
//! - **BatchRenderer**: keeps one [`BatchDrawer`] per batch across frames, keyed
//!   by [`BatchKey`], so pooled buffers survive from one frame to the next
//! - **BatchStats**: per-render counters for monitoring
//!
//! ## Failure handling
//!
//! A pass whose caches are not published yet, whose drawer cannot be chosen or
//! whose stages fail is skipped for the current render only. A failing pass is
//! aborted so no buffer stays mapped.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::config::DrawCallSort;
use crate::render::drawers::{self, BatchDrawer, DrawCallDesc, DrawContext, DrawerResult, DrawerStages};
use crate::render::frame_collector::{self, BatchKey, CollectedFrame, DrawPass};
use crate::simulation::{MediumEvent, MediumId};

/// Statistics of the last render for performance monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Passes in the rendered frame
    pub total_passes: usize,
    /// Drawers alive after the render
    pub batch_count: usize,
    /// Passes whose draw calls were emitted
    pub drawn_passes: usize,
    /// Passes hidden from every view
    pub culled_passes: usize,
    /// Passes skipped because a cache was not ready or no drawer fits
    pub skipped_passes: usize,
    /// Passes aborted by a failing stage
    pub failed_passes: usize,
    /// Draw call descriptions emitted
    pub draw_calls: usize,
    /// Time spent running drawers (microseconds)
    pub submission_time_us: u64,
}

impl BatchStats {
    /// Average draw calls per drawn pass
    pub fn avg_draw_calls_per_pass(&self) -> f32 {
        if self.drawn_passes == 0 {
            0.0
        } else {
            self.draw_calls as f32 / self.drawn_passes as f32
        }
    }
}

#[derive(Debug)]
struct BatchSlot {
    drawer: BatchDrawer,
    last_frame: u64,
}

/// Drawer host of one frame collector
#[derive(Debug)]
pub struct BatchRenderer {
    name: &'static str,
    release_on_cull: bool,
    batches: HashMap<BatchKey, BatchSlot>,
    unsupported: HashSet<BatchKey>,
    current_frame: u64,
    stats: BatchStats,
}

impl BatchRenderer {
    /// Renderer for the collector `name`
    pub fn new(name: &'static str, release_on_cull: bool) -> Self {
        Self {
            name,
            release_on_cull,
            batches: HashMap::new(),
            unsupported: HashSet::new(),
            current_frame: 0,
            stats: BatchStats::default(),
        }
    }

    /// Statistics of the last render
    pub const fn stats(&self) -> &BatchStats {
        &self.stats
    }

    /// Live drawers
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// Drawer of a batch, if one is alive
    pub fn drawer(&self, key: &BatchKey) -> Option<&BatchDrawer> {
        self.batches.get(key).map(|slot| &slot.drawer)
    }

    /// Draw every pass of `frame` for the pass and views of `ctx`
    ///
    /// May be called several times per frame, once per render pass. Medium
    /// events and per-frame drawer bookkeeping only run for the first call.
    pub fn render_frame(&mut self, frame: &CollectedFrame, ctx: &mut DrawContext<'_>) -> &BatchStats {
        let start_time = Instant::now();
        self.stats = BatchStats {
            total_passes: frame.passes().len(),
            ..BatchStats::default()
        };

        let new_frame = frame.frame_id() != self.current_frame;
        if new_frame {
            self.begin_new_frame(frame, ctx);
        }

        for pass in frame.passes() {
            self.render_pass(pass, ctx);
        }
        if new_frame {
            self.drop_stale_batches(ctx);
        }

        self.stats.batch_count = self.batches.len();
        self.stats.submission_time_us = start_time.elapsed().as_micros() as u64;
        log::trace!(
            "Batch renderer '{}': {} passes, {} drawn, {} culled, {} skipped, {} failed, {} draw calls",
            self.name,
            self.stats.total_passes,
            self.stats.drawn_passes,
            self.stats.culled_passes,
            self.stats.skipped_passes,
            self.stats.failed_passes,
            self.stats.draw_calls
        );
        &self.stats
    }

    /// Forward a medium notification to every drawer
    pub fn on_medium_event(&mut self, ctx: &mut DrawContext<'_>, medium: MediumId, event: MediumEvent) {
        for slot in self.batches.values_mut() {
            slot.drawer.stages().on_medium_event(ctx, medium, event);
        }
    }

    /// Release and drop every drawer
    pub fn destroy_batches(&mut self, ctx: &mut DrawContext<'_>) {
        for (_, mut slot) in self.batches.drain() {
            slot.drawer.stages().release(ctx);
        }
        log::debug!("Batch renderer '{}' destroyed its batches", self.name);
    }

    fn begin_new_frame(&mut self, frame: &CollectedFrame, ctx: &mut DrawContext<'_>) {
        self.current_frame = frame.frame_id();
        for (medium, event) in frame.medium_events() {
            self.on_medium_event(ctx, *medium, *event);
        }
        if ctx.settings.stateless_collect {
            self.destroy_batches(ctx);
        }
    }

    /// Drop the batches the current frame did not visit
    fn drop_stale_batches(&mut self, ctx: &mut DrawContext<'_>) {
        let name = self.name;
        let current_frame = self.current_frame;
        self.batches.retain(|key, slot| {
            if slot.last_frame == current_frame {
                return true;
            }
            log::debug!("Batch renderer '{}' dropping stale batch {:?}", name, key);
            slot.drawer.stages().release(ctx);
            false
        });
    }

    fn render_pass(&mut self, pass: &DrawPass, ctx: &mut DrawContext<'_>) {
        if let Some(slot) = self.batches.get_mut(&pass.batch) {
            slot.last_frame = self.current_frame;
        }
        // Caches become visible here only after the pending queue was drained
        if let Some(cache) = pass.caches().find(|key| ctx.caches.desc(*key).is_none()) {
            log::debug!("Batch renderer '{}' skipping a pass: cache {:?} is not ready", self.name, cache);
            self.stats.skipped_passes += 1;
            return;
        }
        if !ctx.caches.is_material_valid(pass.leader()) {
            self.stats.skipped_passes += 1;
            return;
        }
        let current_frame = self.current_frame;
        let release_on_cull = self.release_on_cull;
        let name = self.name;
        let Some(slot) = self.slot_for(pass, ctx) else {
            self.stats.skipped_passes += 1;
            return;
        };
        slot.last_frame = current_frame;
        let drawer = slot.drawer.stages();

        if !drawer.can_render(ctx, pass) {
            return;
        }
        if frame_collector::is_late_culled(&pass.bounds, ctx.sub_view, ctx.settings) {
            if release_on_cull {
                drawer.release(ctx);
            }
            self.stats.culled_passes += 1;
            return;
        }

        let calls = draw_call_descs(pass, ctx);
        let result = run_stages(drawer, ctx, pass, &calls);
        if let Err(err) = &result {
            drawer.abort(ctx);
            log::warn!(
                "Batch renderer '{}' dropped a {:?} pass of {} particles: {}",
                name,
                pass.kind,
                pass.total_particle_count,
                err
            );
        }

        match result {
            Ok(()) => {
                self.stats.drawn_passes += 1;
                self.stats.draw_calls += calls.len();
            }
            Err(_) => self.stats.failed_passes += 1,
        }
    }

    fn slot_for(&mut self, pass: &DrawPass, ctx: &mut DrawContext<'_>) -> Option<&mut BatchSlot> {
        let desc = ctx.desc(pass.leader()).ok()?;
        let domain = desc.material.as_ref().map(|material| material.domain);
        let choice = match drawers::select_drawer(pass.kind, pass.storage, domain, ctx.settings) {
            Ok(choice) => choice,
            Err(err) => {
                if self.unsupported.insert(pass.batch) {
                    log::warn!("Batch renderer '{}' cannot draw batch {:?}: {}", self.name, pass.batch, err);
                }
                return None;
            }
        };

        let slot = self.batches.entry(pass.batch).or_insert_with(|| BatchSlot {
            drawer: BatchDrawer::new(choice),
            last_frame: 0,
        });
        if slot.drawer.choice() != choice {
            log::debug!(
                "Batch {:?} switches drawer from {:?} to {:?}",
                pass.batch,
                slot.drawer.choice(),
                choice
            );
            slot.drawer.stages().release(ctx);
            slot.drawer = BatchDrawer::new(choice);
        }
        Some(slot)
    }
}

/// Draw calls of a pass: per view, and per request when slices are sorted
fn draw_call_descs(pass: &DrawPass, ctx: &DrawContext<'_>) -> Vec<DrawCallDesc> {
    let views: Vec<u32> = if ctx.sub_view.bb_views().is_empty() {
        vec![0]
    } else {
        ctx.sub_view.bb_views().iter().map(|view| view.view_index).collect()
    };

    let sliced = ctx.settings.draw_call_sort == DrawCallSort::Slices;
    views
        .into_iter()
        .flat_map(|view_index| {
            if sliced {
                (0..pass.requests.len())
                    .map(|request| DrawCallDesc::slice(view_index, request))
                    .collect::<Vec<_>>()
            } else {
                vec![DrawCallDesc::whole_pass(view_index, pass)]
            }
        })
        .collect()
}

fn run_stages(
    drawer: &mut dyn DrawerStages,
    ctx: &mut DrawContext<'_>,
    pass: &DrawPass,
    calls: &[DrawCallDesc],
) -> DrawerResult<()> {
    drawer.begin_frame(ctx, pass)?;
    drawer.alloc_buffers(ctx, pass)?;
    drawer.map_buffers(ctx, pass)?;
    drawer.fill_buffers(ctx, pass)?;
    drawer.unmap_buffers(ctx, pass)?;
    drawer.launch_custom_tasks(ctx, pass)?;
    for call in calls {
        drawer.emit_draw_call(ctx, pass, call)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameSettings;
    use crate::foundation::math::{Aabb, Vec3};
    use crate::render::drawers::test_support::{self, Fixture};
    use crate::render::drawers::DrawerChoice;
    use crate::render::frame_collector::{FramePool, FrameRef};
    use crate::render::renderer_cache::RenderCacheTable;
    use crate::render::sub_view::{RenderPassKind, RendererSubView};
    use crate::simulation::{RendererDecl, RendererKind};

    fn frame_with(pool: &mut FramePool, passes: Vec<DrawPass>) -> FrameRef {
        pool.build(|frame| frame.set_passes(passes)).expect("Should build a frame")
    }

    fn billboard_pass(fixture: &mut Fixture, material: &str) -> DrawPass {
        fixture.pass(
            RendererDecl::new(RendererKind::Billboard).with_material(material),
            vec![test_support::main_memory(vec![test_support::page(&[[0.0; 3], [0.5, 0.0, 0.0]])])],
        )
    }

    #[test]
    fn test_batch_stats() {
        let stats = BatchStats {
            drawn_passes: 4,
            draw_calls: 10,
            ..BatchStats::default()
        };
        assert_eq!(stats.avg_draw_calls_per_pass(), 2.5);
        assert_eq!(BatchStats::default().avg_draw_calls_per_pass(), 0.0);
    }

    #[test]
    fn test_renders_every_pass_once_per_view() {
        let mut fixture = Fixture::new();
        let smoke = billboard_pass(&mut fixture, "smoke");
        let fire = billboard_pass(&mut fixture, "fire");
        let mut pool = FramePool::new(2);
        let frame = frame_with(&mut pool, vec![smoke, fire]);
        let sub_view = RendererSubView::render(
            RenderPassKind::Main,
            &[test_support::scene_view(5.0), test_support::scene_view(8.0)],
            1.0,
        );
        let mut renderer = BatchRenderer::new("render", false);

        let stats = {
            let mut ctx = fixture.context(&sub_view);
            let stats = renderer.render_frame(&frame, &mut ctx).clone();
            renderer.destroy_batches(&mut ctx);
            stats
        };

        assert_eq!(stats.drawn_passes, 2);
        assert_eq!(stats.draw_calls, 4);
        assert_eq!(stats.batch_count, 2);
        assert_eq!(fixture.recording.lock().draws.len(), 4);
    }

    #[test]
    fn test_unpublished_cache_is_never_drawn() {
        let mut fixture = Fixture::new();
        let pass = billboard_pass(&mut fixture, "smoke");
        let mut pool = FramePool::new(1);
        let frame = frame_with(&mut pool, vec![pass]);
        let sub_view = test_support::main_view();
        let empty = RenderCacheTable::new();
        let mut renderer = BatchRenderer::new("render", false);

        let mut ctx = fixture.context(&sub_view);
        ctx.caches = &empty;
        let stats = renderer.render_frame(&frame, &mut ctx).clone();
        drop(ctx);

        assert_eq!(stats.skipped_passes, 1);
        assert_eq!(stats.drawn_passes, 0);
        assert!(fixture.recording.lock().draws.is_empty());
    }

    #[test]
    fn test_sliced_sort_emits_a_call_per_request() {
        let mut fixture = Fixture::new();
        fixture.settings = FrameSettings {
            draw_call_sort: DrawCallSort::Slices,
            ..fixture.settings
        };
        let pass = fixture.pass(
            RendererDecl::new(RendererKind::Billboard).with_material("smoke"),
            vec![
                test_support::main_memory(vec![test_support::page(&[[0.0; 3]])]),
                test_support::main_memory(vec![test_support::page(&[[1.0, 0.0, 0.0]])]),
                test_support::main_memory(vec![test_support::page(&[[2.0, 0.0, 0.0]])]),
            ],
        );
        let mut pool = FramePool::new(1);
        let frame = frame_with(&mut pool, vec![pass]);
        let sub_view = test_support::main_view();
        let mut renderer = BatchRenderer::new("render", false);

        let mut ctx = fixture.context(&sub_view);
        let draw_calls = renderer.render_frame(&frame, &mut ctx).draw_calls;
        renderer.destroy_batches(&mut ctx);
        assert_eq!(draw_calls, 3);
    }

    #[test]
    fn test_failing_pass_does_not_stop_the_frame() {
        let mut fixture = Fixture::new();
        // Lights need a light list; a context without one fails the pass
        let light = fixture.pass(
            RendererDecl::new(RendererKind::Light),
            vec![test_support::main_memory(vec![test_support::page(&[[0.0; 3]])])],
        );
        let smoke = billboard_pass(&mut fixture, "smoke");
        let mut pool = FramePool::new(1);
        let frame = frame_with(&mut pool, vec![light, smoke]);
        let sub_view = test_support::main_view();
        let mut renderer = BatchRenderer::new("render", false);

        let mut ctx = fixture.context(&sub_view);
        let stats = renderer.render_frame(&frame, &mut ctx).clone();
        renderer.destroy_batches(&mut ctx);
        drop(ctx);

        assert_eq!(stats.failed_passes, 1);
        assert_eq!(stats.drawn_passes, 1);
        assert_eq!(fixture.recording.lock().draws.len(), 1);
    }

    #[test]
    fn test_stale_batches_are_released() {
        let mut fixture = Fixture::new();
        let first = billboard_pass(&mut fixture, "smoke");
        let key = first.batch;
        let mut pool = FramePool::new(2);
        let sub_view = test_support::main_view();
        let mut renderer = BatchRenderer::new("render", false);

        let mut ctx = fixture.context(&sub_view);
        let frame = frame_with(&mut pool, vec![first]);
        renderer.render_frame(&frame, &mut ctx);
        assert_eq!(
            renderer.drawer(&key).map(BatchDrawer::choice),
            Some(DrawerChoice::BillboardCpu)
        );
        drop(frame);

        let empty = frame_with(&mut pool, Vec::new());
        renderer.render_frame(&empty, &mut ctx);

        assert!(renderer.drawer(&key).is_none());
        let in_use = ctx.pools.as_deref().map_or(usize::MAX, |pools| pools.vb.stats().in_use);
        assert_eq!(in_use, 0);
    }

    #[test]
    fn test_culled_pass_releases_when_asked() {
        let mut fixture = Fixture::new();
        let mut pass = billboard_pass(&mut fixture, "smoke");
        pass.bounds = Aabb::from_center_extents(Vec3::new(0.0, 0.0, 50.0), Vec3::repeat(1.0));
        let mut pool = FramePool::new(1);
        let frame = frame_with(&mut pool, vec![pass]);
        let sub_view = test_support::main_view();
        let mut renderer = BatchRenderer::new("render", true);

        let mut ctx = fixture.context(&sub_view);
        let stats = renderer.render_frame(&frame, &mut ctx).clone();
        renderer.destroy_batches(&mut ctx);
        drop(ctx);

        assert_eq!(stats.culled_passes, 1);
        assert!(fixture.recording.lock().draws.is_empty());
    }
}

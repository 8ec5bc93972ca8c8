//! Billboards expanded on the CPU

use crate::render::drawers::geometry::{CpuGeometryBatch, GeometryShape};
use crate::render::drawers::{geometry_can_render, DrawCallDesc, DrawContext, DrawerResult, DrawerStages};
use crate::render::frame_collector::DrawPass;

/// Camera-facing quads built into pooled vertex buffers
#[derive(Debug)]
pub struct BillboardCpuDrawer {
    batch: CpuGeometryBatch,
}

impl Default for BillboardCpuDrawer {
    fn default() -> Self {
        Self::new()
    }
}

impl BillboardCpuDrawer {
    /// Drawer without buffers
    pub fn new() -> Self {
        Self {
            batch: CpuGeometryBatch::new(GeometryShape::Billboard),
        }
    }

    /// Geometry of the last frame
    pub const fn batch(&self) -> &CpuGeometryBatch {
        &self.batch
    }
}

impl DrawerStages for BillboardCpuDrawer {
    fn can_render(&self, ctx: &DrawContext<'_>, pass: &DrawPass) -> bool {
        geometry_can_render(ctx, pass, false)
    }

    fn alloc_buffers(&mut self, ctx: &mut DrawContext<'_>, pass: &DrawPass) -> DrawerResult<()> {
        self.batch.alloc(ctx, pass)
    }

    fn map_buffers(&mut self, ctx: &mut DrawContext<'_>, _pass: &DrawPass) -> DrawerResult<()> {
        self.batch.map(ctx)
    }

    fn fill_buffers(&mut self, ctx: &mut DrawContext<'_>, pass: &DrawPass) -> DrawerResult<()> {
        self.batch.fill(ctx, pass)
    }

    fn unmap_buffers(&mut self, ctx: &mut DrawContext<'_>, _pass: &DrawPass) -> DrawerResult<()> {
        self.batch.unmap(ctx)
    }

    fn emit_draw_call(&mut self, ctx: &mut DrawContext<'_>, pass: &DrawPass, desc: &DrawCallDesc) -> DrawerResult<()> {
        self.batch.emit(ctx, pass, desc)
    }

    fn abort(&mut self, ctx: &mut DrawContext<'_>) {
        self.batch.abort(ctx);
    }

    fn release(&mut self, ctx: &mut DrawContext<'_>) {
        self.batch.release(ctx);
    }
}

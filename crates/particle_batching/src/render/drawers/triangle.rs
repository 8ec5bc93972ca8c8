//! Triangle drawer
//!
//! Triangles come straight from three simulated positions, so one vertex set
//! serves every view; only the sorted index buffers are per view.

use crate::render::drawers::geometry::{CpuGeometryBatch, GeometryShape};
use crate::render::drawers::{geometry_can_render, DrawCallDesc, DrawContext, DrawerResult, DrawerStages};
use crate::render::frame_collector::DrawPass;

/// Free triangles built on the CPU
#[derive(Debug)]
pub struct TriangleDrawer {
    batch: CpuGeometryBatch,
}

impl Default for TriangleDrawer {
    fn default() -> Self {
        Self::new()
    }
}

impl TriangleDrawer {
    /// Drawer without buffers
    pub fn new() -> Self {
        Self {
            batch: CpuGeometryBatch::new(GeometryShape::Triangle),
        }
    }
}

impl DrawerStages for TriangleDrawer {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::DrawPrimitive;
    use crate::render::drawers::test_support::{self, Fixture};
    use crate::simulation::{fields, FieldData, RendererDecl, RendererKind};

    #[test]
    fn test_three_indices_per_triangle() {
        let mut fixture = Fixture::new();
        let corners = |x: f32| FieldData::Float3(vec![[x, 0.0, 0.0], [x + 1.0, 0.0, 0.0]]);
        let page = test_support::page(&[[0.0; 3], [0.0; 3]])
            .with_field(fields::TRIANGLE_POSITIONS[0], corners(0.0))
            .with_field(fields::TRIANGLE_POSITIONS[1], corners(1.0))
            .with_field(fields::TRIANGLE_POSITIONS[2], corners(2.0));
        let pass = fixture.pass(
            RendererDecl::new(RendererKind::Triangle).with_material("opaque"),
            vec![test_support::main_memory(vec![page])],
        );
        let sub_view = test_support::main_view();
        let mut drawer = TriangleDrawer::new();
        {
            let mut ctx = fixture.context(&sub_view);
            drawer.alloc_buffers(&mut ctx, &pass).expect("Should allocate");
            drawer.map_buffers(&mut ctx, &pass).expect("Should map");
            drawer.fill_buffers(&mut ctx, &pass).expect("Should fill");
            drawer.unmap_buffers(&mut ctx, &pass).expect("Should unmap");
            drawer
                .emit_draw_call(&mut ctx, &pass, &DrawCallDesc::whole_pass(0, &pass))
                .expect("Should emit");
        }

        let draws = fixture.recording.lock().take_draws();
        assert!(matches!(
            draws[0].primitive,
            DrawPrimitive::Indexed { index_count: 6, first_index: 0, .. }
        ));
    }

    #[test]
    fn test_abort_leaves_nothing_mapped() {
        let mut fixture = Fixture::new();
        let pass = fixture.pass(
            RendererDecl::new(RendererKind::Triangle).with_material("opaque"),
            vec![test_support::main_memory(vec![test_support::page(&[[0.0; 3]])])],
        );
        let sub_view = test_support::main_view();
        let mut drawer = TriangleDrawer::new();
        let mut ctx = fixture.context(&sub_view);
        drawer.alloc_buffers(&mut ctx, &pass).expect("Should allocate");
        drawer.map_buffers(&mut ctx, &pass).expect("Should map");
        drawer.abort(&mut ctx);

        // Mapping again only works when the abort unmapped everything
        drawer.map_buffers(&mut ctx, &pass).expect("Should map after abort");
    }
}

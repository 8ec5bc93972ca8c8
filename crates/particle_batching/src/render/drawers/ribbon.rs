//! Ribbon drawer
//!
//! Each particle becomes a quad stretched along its `Axis0` field, or along its
//! velocity when no axis is simulated, turned toward every billboarding view.

use crate::render::drawers::geometry::{CpuGeometryBatch, GeometryShape};
use crate::render::drawers::{geometry_can_render, DrawCallDesc, DrawContext, DrawerResult, DrawerStages};
use crate::render::frame_collector::DrawPass;

/// Axis-aligned quads built on the CPU
#[derive(Debug)]
pub struct RibbonDrawer {
    batch: CpuGeometryBatch,
}

impl Default for RibbonDrawer {
    fn default() -> Self {
        Self::new()
    }
}

impl RibbonDrawer {
    /// Drawer without buffers
    pub fn new() -> Self {
        Self {
            batch: CpuGeometryBatch::new(GeometryShape::Ribbon),
        }
    }
}

impl DrawerStages for RibbonDrawer {
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
    use crate::render::api::VertexSemantic;
    use crate::render::drawers::test_support::{self, Fixture};
    use crate::simulation::{fields, FieldData, RendererDecl, RendererKind};

    #[test]
    fn test_ribbon_follows_axis() {
        let mut fixture = Fixture::new();
        let page = test_support::page(&[[0.0; 3]])
            .with_field(fields::AXIS0, FieldData::Float3(vec![[0.0, 2.0, 0.0]]));
        let pass = fixture.pass(
            RendererDecl::new(RendererKind::Ribbon).with_material("fire"),
            vec![test_support::main_memory(vec![page])],
        );
        let sub_view = test_support::main_view();
        let mut drawer = RibbonDrawer::new();
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

        let mut recording = fixture.recording.lock();
        let draws = recording.take_draws();
        let positions = draws[0]
            .streams
            .iter()
            .find(|s| s.semantic == VertexSemantic::Position)
            .expect("Should bind positions");
        let data = recording.buffer_data(positions.buffer).expect("Should upload positions");
        let floats: Vec<f32> = data[..32]
            .chunks_exact(4)
            .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .collect();

        // First edge runs along the axis: y from -1 to +1
        assert_eq!(floats[1], -1.0);
        assert_eq!(floats[5], 1.0);
    }
}

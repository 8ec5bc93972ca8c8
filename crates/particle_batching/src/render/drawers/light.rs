//! Simple light drawer
//!
//! Light particles produce no geometry. Each enabled particle becomes a
//! [`SimpleLight`] appended to the frame's light list, once per pass whatever
//! the number of views.

use crate::foundation::math::Vec3;
use crate::render::drawers::geometry::pass_particles;
use crate::render::drawers::{DrawCallDesc, DrawContext, DrawerError, DrawerResult, DrawerStages};
use crate::render::frame_collector::DrawPass;
use crate::render::sub_view::RenderPassKind;
use crate::simulation::fields;

/// Lights smaller than this are dropped
pub const MIN_LIGHT_RADIUS: f32 = 1e-3;

/// Falloff exponent of every particle light
pub const LIGHT_EXPONENT: f32 = 16.0;

const RADIUS_MULTIPLIER: f32 = 3.0;
const ATTENUATION_MULTIPLIER: f32 = 4.32;
const ATTENUATION_MINIMUM: f32 = 1.07;

/// Point light emitted by one particle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimpleLight {
    /// World position
    pub position: Vec3,
    /// Influence radius
    pub radius: f32,
    /// Linear color, intensity included
    pub color: Vec3,
    /// Falloff exponent
    pub exponent: f32,
    /// Whether translucent surfaces receive the light
    pub affects_translucent: bool,
}

/// Color intensity for a light falloff steepness; non-positive steepness turns lights off
pub fn color_multiplier(attenuation_steepness: f32) -> f32 {
    if attenuation_steepness > 0.0 {
        attenuation_steepness * ATTENUATION_MULTIPLIER + ATTENUATION_MINIMUM
    } else {
        0.0
    }
}

/// Gathers the lights of one pass
#[derive(Debug, Default)]
pub struct LightDrawer {
    emitted: usize,
}

impl LightDrawer {
    /// Drawer with no lights gathered yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Lights appended by the last pass
    pub const fn emitted(&self) -> usize {
        self.emitted
    }
}

impl DrawerStages for LightDrawer {
    fn can_render(&self, ctx: &DrawContext<'_>, _pass: &DrawPass) -> bool {
        ctx.sub_view.pass() == RenderPassKind::Main
    }

    fn begin_frame(&mut self, _ctx: &mut DrawContext<'_>, _pass: &DrawPass) -> DrawerResult<()> {
        self.emitted = 0;
        Ok(())
    }

    fn fill_buffers(&mut self, ctx: &mut DrawContext<'_>, pass: &DrawPass) -> DrawerResult<()> {
        let desc = ctx.desc(pass.leader())?;
        let scale = ctx.sub_view.global_scale();
        let multiplier = color_multiplier(desc.attenuation_steepness);
        let affects_translucent = ctx.settings.force_lights_translucent || desc.flags.light_translucent;
        let lights = ctx
            .lights
            .as_deref_mut()
            .ok_or(DrawerError::MissingService("light"))?;

        let before = lights.len();
        for (page, particle) in pass_particles(pass) {
            if !page.is_enabled(particle) {
                continue;
            }
            let range = page
                .floats(fields::RANGE)
                .and_then(|values| values.get(particle))
                .copied()
                .unwrap_or(0.0);
            let radius = range * scale * RADIUS_MULTIPLIER;
            if radius < MIN_LIGHT_RADIUS {
                continue;
            }
            let Some(position) = page.float3s(fields::POSITION).and_then(|values| values.get(particle)) else {
                continue;
            };
            let color = page
                .float4s(fields::LIGHT_COLOR)
                .and_then(|values| values.get(particle))
                .map_or_else(|| Vec3::repeat(1.0), |c| Vec3::new(c[0], c[1], c[2]));

            lights.push(SimpleLight {
                position: Vec3::new(position[0], position[1], position[2]) * scale,
                radius,
                color: color * multiplier,
                exponent: LIGHT_EXPONENT,
                affects_translucent,
            });
        }
        self.emitted += lights.len() - before;
        Ok(())
    }

    fn emit_draw_call(&mut self, _ctx: &mut DrawContext<'_>, _pass: &DrawPass, _desc: &DrawCallDesc) -> DrawerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::drawers::test_support::{self, Fixture};
    use crate::render::renderer_cache::CacheLookup;
    use crate::simulation::{FieldData, RendererDecl, RendererKind, RendererProperties};
    use approx::assert_relative_eq;

    fn light_decl(steepness: f32) -> RendererDecl {
        RendererDecl::new(RendererKind::Light).with_properties(RendererProperties {
            attenuation_steepness: steepness,
            ..RendererProperties::default()
        })
    }

    #[test]
    fn test_color_multiplier() {
        assert_relative_eq!(color_multiplier(1.0), 5.39, epsilon = 1e-5);
        assert_eq!(color_multiplier(0.0), 0.0);
        assert_eq!(color_multiplier(-2.0), 0.0);
    }

    #[test]
    fn test_lights_from_particles() {
        let mut fixture = Fixture::new();
        let page = test_support::page(&[[1.0, 0.0, 0.0], [2.0, 0.0, 0.0], [3.0, 0.0, 0.0]])
            .with_field(fields::RANGE, FieldData::Float(vec![2.0, 0.0, 1.0]))
            .with_field(fields::ENABLED, FieldData::Bool(vec![true, true, false]))
            .with_field(
                fields::LIGHT_COLOR,
                FieldData::Float4(vec![[1.0, 0.5, 0.0, 1.0]; 3]),
            );
        let pass = fixture.pass(light_decl(1.0), vec![test_support::main_memory(vec![page])]);
        let sub_view = test_support::main_view();
        let mut lights = Vec::new();
        let mut drawer = LightDrawer::new();
        {
            let mut ctx = DrawContext::new(&fixture.settings, &sub_view, &fixture.table);
            ctx.lights = Some(&mut lights);
            assert!(drawer.can_render(&ctx, &pass));
            drawer.begin_frame(&mut ctx, &pass).expect("Should begin");
            drawer.fill_buffers(&mut ctx, &pass).expect("Should gather");
        }

        // zero range and disabled particles are skipped
        assert_eq!(lights.len(), 1);
        assert_eq!(drawer.emitted(), 1);
        assert_relative_eq!(lights[0].radius, 6.0);
        assert_relative_eq!(lights[0].color, Vec3::new(5.39, 2.695, 0.0), epsilon = 1e-4);
        assert_eq!(lights[0].exponent, LIGHT_EXPONENT);
        assert!(!lights[0].affects_translucent);
        assert!(fixture.table.desc(pass.leader()).is_some());
    }

    #[test]
    fn test_forced_translucent_lights() {
        let mut fixture = Fixture::new();
        fixture.settings.force_lights_translucent = true;
        let page = test_support::page(&[[0.0; 3]]).with_field(fields::RANGE, FieldData::Float(vec![1.0]));
        let pass = fixture.pass(light_decl(0.5), vec![test_support::main_memory(vec![page])]);
        let sub_view = test_support::main_view();
        let mut lights = Vec::new();
        let mut drawer = LightDrawer::new();
        let mut ctx = DrawContext::new(&fixture.settings, &sub_view, &fixture.table);
        ctx.lights = Some(&mut lights);
        drawer.fill_buffers(&mut ctx, &pass).expect("Should gather");
        drop(ctx);

        assert!(lights[0].affects_translucent);
    }

    #[test]
    fn test_no_light_list_is_an_error() {
        let mut fixture = Fixture::new();
        let page = test_support::page(&[[0.0; 3]]).with_field(fields::RANGE, FieldData::Float(vec![1.0]));
        let pass = fixture.pass(light_decl(1.0), vec![test_support::main_memory(vec![page])]);
        let sub_view = test_support::main_view();
        let mut drawer = LightDrawer::new();
        let mut ctx = DrawContext::new(&fixture.settings, &sub_view, &fixture.table);
        assert!(matches!(
            drawer.fill_buffers(&mut ctx, &pass),
            Err(DrawerError::MissingService("light"))
        ));
    }
}

//! Sound drawer
//!
//! Runs in the post-update pass on the update thread. Every enabled particle
//! keeps a voice in the renderer's sound pools; voices follow the particle's
//! position and stop once the particle is gone.

use crate::audio::{SoundInsert, SoundParams, SoundPoolCollection};
use crate::foundation::math::Vec3;
use crate::render::drawers::geometry::pass_particles;
use crate::render::drawers::{DrawCallDesc, DrawContext, DrawerError, DrawerResult, DrawerStages};
use crate::render::frame_collector::DrawPass;
use crate::render::sub_view::RenderPassKind;
use crate::simulation::{fields, MediumEvent, MediumId, ParticlePage};

fn float_or(page: &ParticlePage, name: &str, particle: usize, default: f32) -> f32 {
    page.floats(name)
        .and_then(|values| values.get(particle))
        .copied()
        .unwrap_or(default)
}

fn vec3_or_zero(page: &ParticlePage, name: &str, particle: usize) -> Vec3 {
    page.float3s(name)
        .and_then(|values| values.get(particle))
        .map_or_else(Vec3::zeros, |v| Vec3::new(v[0], v[1], v[2]))
}

/// Voice parameters of one particle
pub fn sound_params(page: &ParticlePage, particle: usize, global_scale: f32, doppler_factor: f32) -> SoundParams {
    let inv_life = float_or(page, fields::INV_LIFE, particle, 0.0);
    let life_ratio = float_or(page, fields::LIFE_RATIO, particle, 0.0);
    SoundParams {
        position: vec3_or_zero(page, fields::POSITION, particle) * global_scale,
        velocity: vec3_or_zero(page, fields::VELOCITY, particle) * global_scale,
        volume: float_or(page, fields::VOLUME, particle, 1.0),
        radius: float_or(page, fields::RANGE, particle, 1.0) * global_scale,
        doppler_factor,
        age: if inv_life > 0.0 { life_ratio / inv_life } else { 0.0 },
    }
}

/// Voices of one sound renderer
#[derive(Debug, Default)]
pub struct SoundDrawer {
    pools: Option<SoundPoolCollection>,
}

impl SoundDrawer {
    /// Drawer whose pools are created on first use
    pub fn new() -> Self {
        Self::default()
    }

    /// Voices playing after the last update
    pub fn playing(&self) -> usize {
        self.pools.as_ref().map_or(0, SoundPoolCollection::playing)
    }

    fn clear(&mut self, ctx: &mut DrawContext<'_>) {
        if let (Some(pools), Some(sink)) = (self.pools.as_mut(), ctx.audio.as_deref_mut()) {
            pools.clear(sink);
        }
    }
}

impl DrawerStages for SoundDrawer {
    fn can_render(&self, ctx: &DrawContext<'_>, _pass: &DrawPass) -> bool {
        ctx.sub_view.pass() == RenderPassKind::PostUpdate
            && ctx.settings.enable_audio
            && ctx.audio.as_deref().is_some_and(|sink| sink.is_enabled())
    }

    fn fill_buffers(&mut self, ctx: &mut DrawContext<'_>, pass: &DrawPass) -> DrawerResult<()> {
        let desc = ctx.desc(pass.leader())?;
        let scale = ctx.sub_view.global_scale();
        let sink = ctx.audio.as_deref_mut().ok_or(DrawerError::MissingService("audio"))?;

        if self.pools.is_none() {
            self.pools = Some(SoundPoolCollection::new(&desc.sounds, sink)?);
        }
        let Some(pools) = self.pools.as_mut() else {
            return Ok(());
        };

        pools.begin_insert();
        for (page, particle) in pass_particles(pass) {
            if !page.is_enabled(particle) {
                continue;
            }
            let Some(self_id) = page.int2s(fields::SELF_ID).and_then(|ids| ids.get(particle)) else {
                continue;
            };
            pools.insert(
                sink,
                0,
                SoundInsert {
                    self_id: *self_id,
                    params: sound_params(page, particle, scale, desc.doppler_factor),
                },
            );
        }
        pools.end_insert(sink);
        log::trace!("Sound batch: {} voices playing", pools.playing());
        Ok(())
    }

    fn emit_draw_call(&mut self, _ctx: &mut DrawContext<'_>, _pass: &DrawPass, _desc: &DrawCallDesc) -> DrawerResult<()> {
        Ok(())
    }

    fn release(&mut self, ctx: &mut DrawContext<'_>) {
        self.clear(ctx);
        self.pools = None;
    }

    fn on_medium_event(&mut self, ctx: &mut DrawContext<'_>, medium: MediumId, event: MediumEvent) {
        match event {
            MediumEvent::Destroyed | MediumEvent::ActiveStateChanged(false) => {
                log::debug!("Silencing sounds after {:?} on medium {:?}", event, medium);
                self.clear(ctx);
            }
            MediumEvent::ActiveStateChanged(true) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::RecordingAudioSink;
    use crate::render::drawers::test_support::{self, Fixture};
    use crate::render::sub_view::RendererSubView;
    use crate::simulation::{FieldData, RendererDecl, RendererKind};

    fn sound_page(ids: &[i32]) -> ParticlePage {
        let positions: Vec<[f32; 3]> = ids.iter().map(|id| [*id as f32, 0.0, 0.0]).collect();
        test_support::page(&positions)
            .with_field(fields::SELF_ID, FieldData::Int2(ids.iter().map(|id| [*id, 0]).collect()))
            .with_field(fields::LIFE_RATIO, FieldData::Float(vec![0.5; ids.len()]))
            .with_field(fields::INV_LIFE, FieldData::Float(vec![0.25; ids.len()]))
    }

    #[test]
    fn test_sound_params_age() {
        let params = sound_params(&sound_page(&[1]), 0, 2.0, 0.5);
        assert_eq!(params.age, 2.0);
        assert_eq!(params.position, Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(params.radius, 2.0);
        assert_eq!(params.doppler_factor, 0.5);
    }

    #[test]
    fn test_voices_follow_particles() {
        let mut fixture = Fixture::new();
        fixture.settings.enable_audio = true;
        let decl = RendererDecl::new(RendererKind::Sound).with_sound("hum");
        let first = fixture.pass(decl.clone(), vec![test_support::main_memory(vec![sound_page(&[1, 2])])]);
        let sub_view = RendererSubView::post_update(1.0);
        let mut sink = RecordingAudioSink::new(["hum"]);
        let recording = sink.recording();
        let mut drawer = SoundDrawer::new();

        let mut ctx = DrawContext::new(&fixture.settings, &sub_view, &fixture.table);
        ctx.audio = Some(&mut sink);
        assert!(drawer.can_render(&ctx, &first));
        drawer.fill_buffers(&mut ctx, &first).expect("Should play");
        assert_eq!(drawer.playing(), 2);

        drawer.on_medium_event(&mut ctx, MediumId(1), MediumEvent::Destroyed);
        assert!(recording.lock().voices.is_empty());
    }

    #[test]
    fn test_sounds_only_after_update() {
        let mut fixture = Fixture::new();
        fixture.settings.enable_audio = true;
        let pass = fixture.pass(
            RendererDecl::new(RendererKind::Sound).with_sound("hum"),
            vec![test_support::main_memory(vec![sound_page(&[1])])],
        );
        let sub_view = test_support::main_view();
        let mut sink = RecordingAudioSink::new(["hum"]);
        let drawer = SoundDrawer::new();
        let mut ctx = DrawContext::new(&fixture.settings, &sub_view, &fixture.table);
        ctx.audio = Some(&mut sink);
        assert!(!drawer.can_render(&ctx, &pass));
    }

    #[test]
    fn test_unknown_sound_fails_the_pass() {
        let mut fixture = Fixture::new();
        let pass = fixture.pass(
            RendererDecl::new(RendererKind::Sound).with_sound("buzz"),
            vec![test_support::main_memory(vec![sound_page(&[1])])],
        );
        let sub_view = RendererSubView::post_update(1.0);
        let mut sink = RecordingAudioSink::new(["hum"]);
        let mut drawer = SoundDrawer::new();
        let mut ctx = DrawContext::new(&fixture.settings, &sub_view, &fixture.table);
        ctx.audio = Some(&mut sink);
        assert!(matches!(drawer.fill_buffers(&mut ctx, &pass), Err(DrawerError::Audio(_))));
    }
}

//! Deferred decal drawer
//!
//! Decal particles become proxies in a [`DecalSink`] owned by the host. The
//! drawer keeps one proxy per enabled particle, reusing last frame's proxies in
//! order and removing the ones left over.
//!
//! Decal materials only receive a single color parameter, so the additional
//! inputs are packed into the bit patterns of its four floats:
//!
//! ```text
//! x: diffuse RGBA, 8 bits per channel (R in the low byte)
//! y: emissive R | emissive G << 16    (half floats)
//! z: emissive B | alpha cursor << 16  (half floats)
//! w: atlas texture id                 (plain float)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use half::f16;
use parking_lot::Mutex;

use crate::assets::MaterialId;
use crate::foundation::math::{Quat, Quaternion, Vec3, Vec4};
use crate::render::drawers::geometry::pass_particles;
use crate::render::drawers::{DrawCallDesc, DrawContext, DrawerError, DrawerResult, DrawerStages};
use crate::render::frame_collector::DrawPass;
use crate::render::sub_view::RenderPassKind;
use crate::simulation::{fields, MediumEvent, MediumId, ParticlePage, StorageClass};

/// Handle to a decal proxy owned by a [`DecalSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DecalProxyId(pub u64);

/// Placement and packed color of one decal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecalInstance {
    /// World position
    pub position: Vec3,
    /// World rotation
    pub rotation: Quat,
    /// Projection box extents
    pub scale: Vec3,
    /// Packed color parameter, see [`pack_decal_color`]
    pub color: [f32; 4],
    /// Radius of the bounding sphere around `position`
    pub bounds_radius: f32,
}

/// Decal service the decal drawer places proxies through
///
/// Only the update thread touches the sink.
pub trait DecalSink: Send {
    /// Add a proxy to the scene
    fn create(&mut self, material: Option<MaterialId>, instance: &DecalInstance) -> DecalProxyId;

    /// Move an existing proxy
    fn update(&mut self, proxy: DecalProxyId, instance: &DecalInstance);

    /// Remove a proxy from the scene
    fn remove(&mut self, proxy: DecalProxyId);
}

/// Unpacked decal inputs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecalColor {
    /// Diffuse RGBA, quantized to 8 bits per channel
    pub diffuse: [u8; 4],
    /// Emissive RGB, alpha already applied
    pub emissive: Vec3,
    /// Alpha remap cursor
    pub alpha_cursor: f32,
    /// Atlas texture id
    pub atlas_id: f32,
}

fn quantize(channel: f32) -> u32 {
    u32::from((channel.clamp(0.0, 1.0) * 255.0) as u8)
}

fn pack_halves(low: f32, high: f32) -> u32 {
    u32::from(f16::from_f32(low).to_bits()) | (u32::from(f16::from_f32(high).to_bits()) << 16)
}

fn unpack_halves(bits: u32) -> (f32, f32) {
    (
        f16::from_bits((bits & 0xFFFF) as u16).to_f32(),
        f16::from_bits((bits >> 16) as u16).to_f32(),
    )
}

/// Pack diffuse, emissive, alpha cursor and atlas id into a decal color
pub fn pack_decal_color(diffuse: Vec4, emissive: Vec3, alpha_cursor: f32, atlas_id: f32) -> [f32; 4] {
    let packed_diffuse = quantize(diffuse.x)
        | (quantize(diffuse.y) << 8)
        | (quantize(diffuse.z) << 16)
        | (quantize(diffuse.w) << 24);
    [
        f32::from_bits(packed_diffuse),
        f32::from_bits(pack_halves(emissive.x, emissive.y)),
        f32::from_bits(pack_halves(emissive.z, alpha_cursor)),
        atlas_id,
    ]
}

/// Inverse of [`pack_decal_color`]
pub fn unpack_decal_color(color: [f32; 4]) -> DecalColor {
    let diffuse = color[0].to_bits().to_le_bytes();
    let (emissive_r, emissive_g) = unpack_halves(color[1].to_bits());
    let (emissive_b, alpha_cursor) = unpack_halves(color[2].to_bits());
    DecalColor {
        diffuse,
        emissive: Vec3::new(emissive_r, emissive_g, emissive_b),
        alpha_cursor,
        atlas_id: color[3],
    }
}

fn float_or_zero(page: &ParticlePage, name: &str, particle: usize) -> f32 {
    page.floats(name)
        .and_then(|values| values.get(particle))
        .copied()
        .unwrap_or(0.0)
}

/// Decal placement of one particle
pub fn decal_instance(page: &ParticlePage, particle: usize, global_scale: f32) -> DecalInstance {
    let position = page
        .float3s(fields::POSITION)
        .and_then(|values| values.get(particle))
        .map_or_else(Vec3::zeros, |p| Vec3::new(p[0], p[1], p[2]));
    let rotation = page
        .float4s(fields::ORIENTATION)
        .and_then(|values| values.get(particle))
        .map_or_else(Quat::identity, |q| {
            Quat::new_normalize(Quaternion::new(q[3], q[0], q[1], q[2]))
        });
    let scale = page
        .float3s(fields::SCALE)
        .and_then(|values| values.get(particle))
        .map(|s| Vec3::new(s[0], s[1], s[2]))
        .or_else(|| {
            page.floats(fields::SIZE)
                .and_then(|values| values.get(particle))
                .map(|s| Vec3::repeat(*s))
        })
        .unwrap_or_else(|| Vec3::repeat(1.0))
        * global_scale;

    let diffuse = page
        .float4s(fields::DIFFUSE_COLOR)
        .and_then(|values| values.get(particle))
        .map_or_else(Vec4::zeros, |c| Vec4::new(c[0], c[1], c[2], c[3]));
    // Emissive alpha is baked into the color
    let emissive = page
        .float4s(fields::EMISSIVE_COLOR)
        .and_then(|values| values.get(particle))
        .map(|c| Vec3::new(c[0], c[1], c[2]) * c[3])
        .or_else(|| {
            page.float3s(fields::EMISSIVE_COLOR)
                .and_then(|values| values.get(particle))
                .map(|c| Vec3::new(c[0], c[1], c[2]))
        })
        .unwrap_or_else(Vec3::zeros);

    DecalInstance {
        position: position * global_scale,
        rotation,
        scale,
        color: pack_decal_color(
            diffuse,
            emissive,
            float_or_zero(page, fields::ALPHA_REMAP_CURSOR, particle),
            float_or_zero(page, fields::TEXTURE_ID, particle),
        ),
        bounds_radius: scale.abs().max() * 2.0,
    }
}

/// Proxies of one decal batch
#[derive(Debug, Default)]
pub struct DecalDrawer {
    proxies: Vec<DecalProxyId>,
}

impl DecalDrawer {
    /// Drawer without proxies
    pub fn new() -> Self {
        Self::default()
    }

    /// Proxies alive after the last update
    pub fn active_proxies(&self) -> usize {
        self.proxies.len()
    }

    fn remove_all(&mut self, ctx: &mut DrawContext<'_>) {
        if self.proxies.is_empty() {
            return;
        }
        let Some(sink) = ctx.decals.as_deref_mut() else {
            log::warn!("Dropping {} decal proxies without a decal service", self.proxies.len());
            self.proxies.clear();
            return;
        };
        for proxy in self.proxies.drain(..) {
            sink.remove(proxy);
        }
    }
}

impl DrawerStages for DecalDrawer {
    fn can_render(&self, ctx: &DrawContext<'_>, _pass: &DrawPass) -> bool {
        ctx.sub_view.pass() == RenderPassKind::PostUpdate
    }

    fn begin_frame(&mut self, _ctx: &mut DrawContext<'_>, pass: &DrawPass) -> DrawerResult<()> {
        if pass.storage != StorageClass::MainMemory {
            return Err(DrawerError::Unsupported(
                "decals read main-memory particles only".to_string(),
            ));
        }
        Ok(())
    }

    fn fill_buffers(&mut self, ctx: &mut DrawContext<'_>, pass: &DrawPass) -> DrawerResult<()> {
        let material = ctx.desc(pass.leader())?.material_id();
        let scale = ctx.sub_view.global_scale();
        let sink = ctx.decals.as_deref_mut().ok_or(DrawerError::MissingService("decal"))?;

        let mut used = 0;
        for (page, particle) in pass_particles(pass) {
            if !page.is_enabled(particle) {
                continue;
            }
            let instance = decal_instance(page, particle, scale);
            match self.proxies.get(used) {
                Some(proxy) => sink.update(*proxy, &instance),
                None => self.proxies.push(sink.create(material, &instance)),
            }
            used += 1;
        }
        for proxy in self.proxies.drain(used..) {
            sink.remove(proxy);
        }
        log::trace!("Decal batch: {} proxies", self.proxies.len());
        Ok(())
    }

    fn emit_draw_call(&mut self, _ctx: &mut DrawContext<'_>, _pass: &DrawPass, _desc: &DrawCallDesc) -> DrawerResult<()> {
        Ok(())
    }

    fn release(&mut self, ctx: &mut DrawContext<'_>) {
        self.remove_all(ctx);
    }

    fn on_medium_event(&mut self, ctx: &mut DrawContext<'_>, medium: MediumId, event: MediumEvent) {
        match event {
            MediumEvent::Destroyed | MediumEvent::ActiveStateChanged(false) => {
                log::debug!("Removing decals after {:?} on medium {:?}", event, medium);
                self.remove_all(ctx);
            }
            MediumEvent::ActiveStateChanged(true) => {}
        }
    }
}

/// Decal proxy as seen by a [`RecordingDecalSink`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedDecal {
    /// Material the proxy was created with
    pub material: Option<MaterialId>,
    /// Latest placement
    pub instance: DecalInstance,
}

/// What a [`RecordingDecalSink`] saw
#[derive(Debug, Default)]
pub struct DecalRecording {
    /// Live proxies
    pub proxies: HashMap<DecalProxyId, RecordedDecal>,
    /// Proxies created so far
    pub created: u64,
    /// Proxy updates so far
    pub updated: u64,
    /// Proxies removed so far
    pub removed: u64,
}

/// Decal sink that records proxies instead of placing them
#[derive(Debug, Default)]
pub struct RecordingDecalSink {
    next_proxy: u64,
    recording: Arc<Mutex<DecalRecording>>,
}

impl RecordingDecalSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the recording
    pub fn recording(&self) -> Arc<Mutex<DecalRecording>> {
        Arc::clone(&self.recording)
    }
}

impl DecalSink for RecordingDecalSink {
    fn create(&mut self, material: Option<MaterialId>, instance: &DecalInstance) -> DecalProxyId {
        let proxy = DecalProxyId(self.next_proxy);
        self.next_proxy += 1;
        let mut recording = self.recording.lock();
        recording.proxies.insert(
            proxy,
            RecordedDecal {
                material,
                instance: *instance,
            },
        );
        recording.created += 1;
        proxy
    }

    fn update(&mut self, proxy: DecalProxyId, instance: &DecalInstance) {
        let mut recording = self.recording.lock();
        if let Some(recorded) = recording.proxies.get_mut(&proxy) {
            recorded.instance = *instance;
            recording.updated += 1;
        }
    }

    fn remove(&mut self, proxy: DecalProxyId) {
        let mut recording = self.recording.lock();
        if recording.proxies.remove(&proxy).is_some() {
            recording.removed += 1;
        }
    }
}

//! Data handed in by the particle simulation
//!
//! Every update tick the simulation exposes its live mediums, the renderers
//! they declare and one draw request per renderer that has particles to show.
//! Draw requests never outlive the frame they were collected for.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::foundation::math::Aabb;
use crate::render::api::GpuBufferHandle;

/// Well-known particle field names
pub mod fields {
    /// Particle position (float3)
    pub const POSITION: &str = "Position";
    /// Billboard size (float or float2)
    pub const SIZE: &str = "Size";
    /// Billboard rotation in radians (float)
    pub const ROTATION: &str = "Rotation";
    /// First free billboarding axis (float3)
    pub const AXIS0: &str = "Axis0";
    /// Second free billboarding axis (float3)
    pub const AXIS1: &str = "Axis1";
    /// Mesh and decal orientation quaternion (float4, xyzw)
    pub const ORIENTATION: &str = "Orientation";
    /// Mesh and decal scale (float or float3)
    pub const SCALE: &str = "Scale";
    /// Triangle corners (float3 each)
    pub const TRIANGLE_POSITIONS: [&str; 3] = ["Position1", "Position2", "Position3"];
    /// Per-particle enable flag (bool)
    pub const ENABLED: &str = "Enabled";
    /// Unique particle id (int2)
    pub const SELF_ID: &str = "SelfID";
    /// Normalized age (float)
    pub const LIFE_RATIO: &str = "LifeRatio";
    /// Inverse of the lifetime (float)
    pub const INV_LIFE: &str = "InvLife";
    /// Velocity (float3)
    pub const VELOCITY: &str = "Velocity";
    /// Sound volume (float)
    pub const VOLUME: &str = "Volume";
    /// Sound audible range (float)
    pub const RANGE: &str = "Range";
    /// Light color (float4, alpha ignored)
    pub const LIGHT_COLOR: &str = "Light.Color";
    /// Diffuse color (float4)
    pub const DIFFUSE_COLOR: &str = "Diffuse.Color";
    /// Distortion color (float4)
    pub const DISTORTION_COLOR: &str = "Distortion.Color";
    /// Emissive color (float3, float4 for decals)
    pub const EMISSIVE_COLOR: &str = "Emissive.EmissiveColor";
    /// Alpha remap cursor (float)
    pub const ALPHA_REMAP_CURSOR: &str = "AlphaRemap.Cursor";
    /// Atlas sub-rect index (float)
    pub const TEXTURE_ID: &str = "Atlas.TextureID";
    /// Generic shader inputs (float4)
    pub const SHADER_INPUTS: [&str; 3] = ["ShaderInput1.Input1", "ShaderInput2.Input2", "ShaderInput3.Input3"];
}

/// Identifier of a live simulation medium
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MediumId(pub u64);

/// Closed set of renderer kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RendererKind {
    /// Camera-facing quads
    Billboard,
    /// Quads stretched along a trail
    Ribbon,
    /// Instanced meshes
    Mesh,
    /// Free triangles
    Triangle,
    /// Simple point lights
    Light,
    /// Audio sources
    Sound,
    /// Deferred decals
    Decal,
}

bitflags! {
    /// Set of renderer kinds handled by a collector
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RendererKindMask: u32 {
        /// Billboards
        const BILLBOARD = 1 << 0;
        /// Ribbons
        const RIBBON = 1 << 1;
        /// Meshes
        const MESH = 1 << 2;
        /// Triangles
        const TRIANGLE = 1 << 3;
        /// Lights
        const LIGHT = 1 << 4;
        /// Sounds
        const SOUND = 1 << 5;
        /// Decals
        const DECAL = 1 << 6;
    }
}

impl RendererKind {
    /// Every kind, in declaration order
    pub const ALL: [Self; 7] = [
        Self::Billboard,
        Self::Ribbon,
        Self::Mesh,
        Self::Triangle,
        Self::Light,
        Self::Sound,
        Self::Decal,
    ];

    /// Whether renderers of this kind bind a material
    pub const fn has_material(self) -> bool {
        !matches!(self, Self::Light | Self::Sound)
    }

    /// Single-kind mask
    pub const fn mask(self) -> RendererKindMask {
        match self {
            Self::Billboard => RendererKindMask::BILLBOARD,
            Self::Ribbon => RendererKindMask::RIBBON,
            Self::Mesh => RendererKindMask::MESH,
            Self::Triangle => RendererKindMask::TRIANGLE,
            Self::Light => RendererKindMask::LIGHT,
            Self::Sound => RendererKindMask::SOUND,
            Self::Decal => RendererKindMask::DECAL,
        }
    }
}

impl RendererKindMask {
    /// Whether `kind` is part of the mask
    pub const fn contains_kind(self, kind: RendererKind) -> bool {
        self.contains(kind.mask())
    }
}

/// Where particle data lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageClass {
    /// Paged host memory
    MainMemory,
    /// Device buffers written by GPU simulation
    Gpu,
}

/// Base type of a particle field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// bool
    Bool,
    /// f32
    Float,
    /// [f32; 2]
    Float2,
    /// [f32; 3]
    Float3,
    /// [f32; 4]
    Float4,
    /// [i32; 2]
    Int2,
}

impl FieldType {
    /// Size of one element in bytes
    pub const fn size_in_bytes(self) -> u32 {
        match self {
            Self::Bool => 1,
            Self::Float => 4,
            Self::Float2 | Self::Int2 => 8,
            Self::Float3 => 12,
            Self::Float4 => 16,
        }
    }
}

/// Declared particle field forwarded to shaders
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDefinition {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
}

impl FieldDefinition {
    /// Create a field definition
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Values of one field over a page
#[derive(Debug, Clone, PartialEq)]
pub enum FieldData {
    /// bool values
    Bool(Vec<bool>),
    /// f32 values
    Float(Vec<f32>),
    /// [f32; 2] values
    Float2(Vec<[f32; 2]>),
    /// [f32; 3] values
    Float3(Vec<[f32; 3]>),
    /// [f32; 4] values
    Float4(Vec<[f32; 4]>),
    /// [i32; 2] values
    Int2(Vec<[i32; 2]>),
}

impl FieldData {
    /// Element count
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Float2(v) => v.len(),
            Self::Float3(v) => v.len(),
            Self::Float4(v) => v.len(),
            Self::Int2(v) => v.len(),
        }
    }

    /// Whether the field holds no element
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element type
    pub const fn field_type(&self) -> FieldType {
        match self {
            Self::Bool(_) => FieldType::Bool,
            Self::Float(_) => FieldType::Float,
            Self::Float2(_) => FieldType::Float2,
            Self::Float3(_) => FieldType::Float3,
            Self::Float4(_) => FieldType::Float4,
            Self::Int2(_) => FieldType::Int2,
        }
    }

    /// Values flattened to floats; `None` for bool and integer fields
    pub fn as_floats(&self) -> Option<&[f32]> {
        match self {
            Self::Float(v) => Some(v.as_slice()),
            Self::Float2(v) => Some(bytemuck::cast_slice(v)),
            Self::Float3(v) => Some(bytemuck::cast_slice(v)),
            Self::Float4(v) => Some(bytemuck::cast_slice(v)),
            Self::Bool(_) | Self::Int2(_) => None,
        }
    }
}

/// One page of main-memory particles
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticlePage {
    particle_count: u32,
    fields: HashMap<String, FieldData>,
}

impl ParticlePage {
    /// Create an empty page of `particle_count` particles
    pub fn new(particle_count: u32) -> Self {
        Self {
            particle_count,
            fields: HashMap::new(),
        }
    }

    /// Attach a field; fields whose length differs from the page are ignored on read
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, data: FieldData) -> Self {
        self.fields.insert(name.into(), data);
        self
    }

    /// Particle count of the page
    pub const fn particle_count(&self) -> u32 {
        self.particle_count
    }

    /// Field by name, only when it covers the whole page
    pub fn field(&self, name: &str) -> Option<&FieldData> {
        self.fields
            .get(name)
            .filter(|data| data.len() == self.particle_count as usize)
    }

    /// Float field
    pub fn floats(&self, name: &str) -> Option<&[f32]> {
        match self.field(name)? {
            FieldData::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Float2 field
    pub fn float2s(&self, name: &str) -> Option<&[[f32; 2]]> {
        match self.field(name)? {
            FieldData::Float2(v) => Some(v),
            _ => None,
        }
    }

    /// Float3 field
    pub fn float3s(&self, name: &str) -> Option<&[[f32; 3]]> {
        match self.field(name)? {
            FieldData::Float3(v) => Some(v),
            _ => None,
        }
    }

    /// Float4 field
    pub fn float4s(&self, name: &str) -> Option<&[[f32; 4]]> {
        match self.field(name)? {
            FieldData::Float4(v) => Some(v),
            _ => None,
        }
    }

    /// Int2 field
    pub fn int2s(&self, name: &str) -> Option<&[[i32; 2]]> {
        match self.field(name)? {
            FieldData::Int2(v) => Some(v),
            _ => None,
        }
    }

    /// Enable flags, all enabled when the page has no such field
    pub fn is_enabled(&self, particle: usize) -> bool {
        match self.field(fields::ENABLED) {
            Some(FieldData::Bool(v)) => v.get(particle).copied().unwrap_or(true),
            _ => true,
        }
    }
}

/// Paged main-memory stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticleStream {
    /// Pages in simulation order
    pub pages: Vec<ParticlePage>,
}

impl ParticleStream {
    /// Create a stream from pages
    pub const fn new(pages: Vec<ParticlePage>) -> Self {
        Self { pages }
    }

    /// Particles across every page
    pub fn particle_count(&self) -> u32 {
        self.pages.iter().map(ParticlePage::particle_count).sum()
    }
}

/// Device-resident particle data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuParticleStream {
    /// Buffer holding every simulated field
    pub simulation_buffer: GpuBufferHandle,
    /// Buffer holding the live particle count
    pub size_buffer: GpuBufferHandle,
    /// Upper bound on the particle count, used to size outputs
    pub particle_capacity: u32,
    /// Byte offset of each field inside `simulation_buffer`
    pub field_offsets: HashMap<String, u32>,
}

impl GpuParticleStream {
    /// Offset of a field in floats, `-1` when absent
    pub fn float_offset(&self, name: &str) -> i32 {
        self.field_offsets
            .get(name)
            .map_or(-1, |offset| (*offset / 4) as i32)
    }
}

/// Particle data of one draw request
#[derive(Debug, Clone)]
pub enum StreamToRender {
    /// Host pages
    MainMemory(Arc<ParticleStream>),
    /// Device buffers
    Gpu(Arc<GpuParticleStream>),
}

impl StreamToRender {
    /// Storage class of the stream
    pub const fn storage_class(&self) -> StorageClass {
        match self {
            Self::MainMemory(_) => StorageClass::MainMemory,
            Self::Gpu(_) => StorageClass::Gpu,
        }
    }

    /// Particle count (capacity for GPU streams)
    pub fn particle_count(&self) -> u32 {
        match self {
            Self::MainMemory(stream) => stream.particle_count(),
            Self::Gpu(stream) => stream.particle_capacity,
        }
    }

    /// Host pages, if any
    pub fn main_memory(&self) -> Option<&ParticleStream> {
        match self {
            Self::MainMemory(stream) => Some(stream),
            Self::Gpu(_) => None,
        }
    }

    /// Device stream, if any
    pub fn gpu(&self) -> Option<&GpuParticleStream> {
        match self {
            Self::MainMemory(_) => None,
            Self::Gpu(stream) => Some(stream),
        }
    }
}

/// Renderer properties read while building the renderer cache
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RendererProperties {
    /// Lit shading (needs normals and tangents)
    pub lit: bool,
    /// Casts shadows
    pub cast_shadows: bool,
    /// Included in ray-tracing acceleration structures
    pub raytraced: bool,
    /// Translucent particles want back-to-front sorting
    pub needs_sort: bool,
    /// Billboard texture flip
    pub flip_uvs: bool,
    /// Ribbon texture flip along U
    pub ribbon_flip_u: bool,
    /// Ribbon texture flip along V
    pub ribbon_flip_v: bool,
    /// Ribbon texture rotation
    pub ribbon_rotate_texture: bool,
    /// Ribbon deformation correction
    pub correct_deformation: bool,
    /// Soft atlas animation blending
    pub soft_animation_blending: bool,
    /// Motion-vector atlas blending
    pub motion_vectors_blending: bool,
    /// Alpha remapping
    pub alpha_remapper: bool,
    /// Mesh LOD chosen per particle
    pub per_particle_lod: bool,
    /// Mesh motion blur
    pub motion_blur: bool,
    /// Mesh atlas
    pub mesh_atlas: bool,
    /// Light affects translucent surfaces
    pub light_translucent: bool,
    /// Light falloff steepness
    pub attenuation_steepness: f32,
    /// Sound doppler factor
    pub doppler_factor: f32,
}

/// Renderer declared by a medium
#[derive(Debug, Clone, PartialEq)]
pub struct RendererDecl {
    /// Renderer kind
    pub kind: RendererKind,
    /// Material asset path
    pub material: Option<String>,
    /// Mesh asset path (mesh renderers)
    pub mesh: Option<String>,
    /// Sound asset paths (sound renderers)
    pub sounds: Vec<String>,
    /// Rendering properties
    pub properties: RendererProperties,
    /// Fields forwarded to shaders
    pub additional_inputs: Vec<FieldDefinition>,
}

impl RendererDecl {
    /// Declaration with default properties
    pub fn new(kind: RendererKind) -> Self {
        Self {
            kind,
            material: None,
            mesh: None,
            sounds: Vec::new(),
            properties: RendererProperties::default(),
            additional_inputs: Vec::new(),
        }
    }

    /// Set the material path
    #[must_use]
    pub fn with_material(mut self, path: impl Into<String>) -> Self {
        self.material = Some(path.into());
        self
    }

    /// Set the mesh path
    #[must_use]
    pub fn with_mesh(mut self, path: impl Into<String>) -> Self {
        self.mesh = Some(path.into());
        self
    }

    /// Add a sound path
    #[must_use]
    pub fn with_sound(mut self, path: impl Into<String>) -> Self {
        self.sounds.push(path.into());
        self
    }

    /// Replace the properties
    #[must_use]
    pub fn with_properties(mut self, properties: RendererProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Declare an additional input
    #[must_use]
    pub fn with_additional_input(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.additional_inputs.push(FieldDefinition::new(name, field_type));
        self
    }
}

/// One renderer's particles for one frame
#[derive(Debug, Clone)]
pub struct DrawRequest {
    /// Index of the renderer inside its medium
    pub renderer_index: u32,
    /// Particle data
    pub stream: StreamToRender,
    /// World-space bounds, possibly invalid
    pub bounds: Aabb,
    /// View the request is limited to; `None` renders in every view
    pub view_index: Option<u32>,
}

impl DrawRequest {
    /// Request visible in every view
    pub const fn new(renderer_index: u32, stream: StreamToRender, bounds: Aabb) -> Self {
        Self {
            renderer_index,
            stream,
            bounds,
            view_index: None,
        }
    }

    /// Storage class of the particles
    pub const fn storage_class(&self) -> StorageClass {
        self.stream.storage_class()
    }

    /// Particle count
    pub fn particle_count(&self) -> u32 {
        self.stream.particle_count()
    }
}

/// Snapshot of one medium for the current tick
#[derive(Debug, Clone)]
pub struct MediumFrame {
    /// Medium id
    pub id: MediumId,
    /// Declared renderers, indexed by `DrawRequest::renderer_index`
    pub renderers: Vec<Arc<RendererDecl>>,
    /// Draw requests in renderer order
    pub requests: Vec<DrawRequest>,
}

/// Lifecycle notification of a medium
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediumEvent {
    /// The medium was paused or resumed
    ActiveStateChanged(bool),
    /// The medium is gone
    Destroyed,
}

/// Callback invoked on medium events
pub type MediumListener = Arc<dyn Fn(MediumId, MediumEvent) + Send + Sync>;

/// Live simulation mediums
pub trait MediumCollection: Send + Sync {
    /// Snapshot of every live medium
    fn mediums(&self) -> Vec<MediumFrame>;

    /// Register a listener for events of `medium`
    fn subscribe(&self, medium: MediumId, listener: MediumListener);
}

/// In-process medium collection driven by the host
#[derive(Default)]
pub struct MediumRegistry {
    mediums: Mutex<Vec<MediumFrame>>,
    listeners: Mutex<HashMap<MediumId, Vec<MediumListener>>>,
}

impl std::fmt::Debug for MediumRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediumRegistry")
            .field("mediums", &self.mediums.lock().len())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl MediumRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the snapshot of a medium
    pub fn set_medium(&self, frame: MediumFrame) {
        let mut mediums = self.mediums.lock();
        match mediums.iter_mut().find(|m| m.id == frame.id) {
            Some(existing) => *existing = frame,
            None => mediums.push(frame),
        }
    }

    /// Replace the draw requests of a medium
    pub fn set_requests(&self, medium: MediumId, requests: Vec<DrawRequest>) {
        if let Some(existing) = self.mediums.lock().iter_mut().find(|m| m.id == medium) {
            existing.requests = requests;
        }
    }

    /// Notify listeners that a medium was paused or resumed
    pub fn set_active(&self, medium: MediumId, active: bool) {
        self.notify(medium, MediumEvent::ActiveStateChanged(active));
    }

    /// Remove a medium and notify its listeners
    pub fn destroy_medium(&self, medium: MediumId) {
        self.mediums.lock().retain(|m| m.id != medium);
        self.notify(medium, MediumEvent::Destroyed);
        self.listeners.lock().remove(&medium);
    }

    fn notify(&self, medium: MediumId, event: MediumEvent) {
        let listeners = self.listeners.lock().get(&medium).cloned().unwrap_or_default();
        for listener in listeners {
            listener(medium, event);
        }
    }
}

impl MediumCollection for MediumRegistry {
    fn mediums(&self) -> Vec<MediumFrame> {
        self.mediums.lock().clone()
    }

    fn subscribe(&self, medium: MediumId, listener: MediumListener) {
        self.listeners.lock().entry(medium).or_default().push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_page_ignores_short_fields() {
        let page = ParticlePage::new(2)
            .with_field(fields::SIZE, FieldData::Float(vec![1.0, 2.0]))
            .with_field(fields::ROTATION, FieldData::Float(vec![1.0]));

        assert_eq!(page.floats(fields::SIZE), Some(&[1.0, 2.0][..]));
        assert!(page.floats(fields::ROTATION).is_none());
        assert!(page.float3s(fields::SIZE).is_none());
    }

    #[test]
    fn test_stream_particle_count_sums_pages() {
        let stream = ParticleStream::new(vec![ParticlePage::new(3), ParticlePage::new(5)]);
        let request = DrawRequest::new(0, StreamToRender::MainMemory(Arc::new(stream)), Aabb::invalid());
        assert_eq!(request.particle_count(), 8);
        assert_eq!(request.storage_class(), StorageClass::MainMemory);
    }

    #[test]
    fn test_enabled_defaults_to_true() {
        let page = ParticlePage::new(2);
        assert!(page.is_enabled(1));
        let page = page.with_field(fields::ENABLED, FieldData::Bool(vec![true, false]));
        assert!(!page.is_enabled(1));
    }

    #[test]
    fn test_kind_mask() {
        let mask = RendererKind::Sound.mask() | RendererKind::Decal.mask();
        assert!(mask.contains_kind(RendererKind::Decal));
        assert!(!mask.contains_kind(RendererKind::Billboard));
        assert!(!RendererKind::Light.has_material());
    }

    #[test]
    fn test_registry_notifies_listeners_until_destroyed() {
        let registry = MediumRegistry::new();
        let medium = MediumId(7);
        registry.set_medium(MediumFrame {
            id: medium,
            renderers: Vec::new(),
            requests: Vec::new(),
        });

        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        registry.subscribe(
            medium,
            Arc::new(move |_, _| {
                seen.fetch_add(1, Ordering::Relaxed);
            }),
        );

        registry.set_active(medium, false);
        registry.destroy_medium(medium);
        registry.set_active(medium, true);

        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert!(registry.mediums().is_empty());
    }
}

//! Renderer caches
//!
//! Each declared renderer gets a cache resolving its material and mesh and the
//! billboarding flags derived from its properties. Caches are built on the
//! update thread inside [`RendererCacheArena`] and published to the render
//! thread through [`PendingCaches`]; the render thread only ever sees caches it
//! drained into its own [`RenderCacheTable`].
//!
//! ```text
//! Unresolved ──resolve──> GameThreadResolved ──setup──> Published
//!                                                          │ pending queue
//!                                                          v
//!                                      RenderCacheTable (RenderThreadReady)
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::assets::{AssetResolver, BlendMode, MaterialAsset, MaterialDomain, MaterialId, MeshAsset};
use crate::foundation::collections::{CacheKey, SecondaryMap, SlotMap};
use crate::foundation::math::Aabb;
use crate::simulation::{fields, FieldDefinition, MediumId, RendererDecl, RendererKind};

/// Renderer cache errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The renderer needs a material but declares none
    #[error("Renderer declares no material")]
    NoMaterial,

    /// The material path does not resolve
    #[error("Material '{0}' not found")]
    MaterialNotFound(String),

    /// The material domain is unusable and there is no default material
    #[error("Material '{path}' ({domain:?}) is not usable by {kind:?} renderers")]
    UnsupportedDomain {
        /// Material path
        path: String,
        /// Material domain
        domain: MaterialDomain,
        /// Renderer kind
        kind: RendererKind,
    },

    /// A mesh renderer declares no mesh
    #[error("Mesh renderer declares no mesh")]
    NoMesh,

    /// The mesh path does not resolve
    #[error("Mesh '{0}' not found")]
    MeshNotFound(String),

    /// The mesh has no render data yet
    #[error("Mesh '{0}' has no render data yet")]
    MeshNotReady(String),

    /// Setup ran before resolution
    #[error("Renderer cache is not resolved")]
    NotResolved,
}

/// Whether `kind` renderers can draw with a material of `domain`
pub const fn is_domain_supported(kind: RendererKind, domain: MaterialDomain) -> bool {
    match kind {
        RendererKind::Billboard => matches!(domain, MaterialDomain::Surface | MaterialDomain::Volume),
        RendererKind::Ribbon | RendererKind::Mesh | RendererKind::Triangle => {
            matches!(domain, MaterialDomain::Surface)
        }
        RendererKind::Decal => matches!(domain, MaterialDomain::Surface | MaterialDomain::DeferredDecal),
        RendererKind::Light | RendererKind::Sound => true,
    }
}

/// Flags steering geometry generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BillboardingFlags {
    /// Generate texture coordinates
    pub has_uv: bool,
    /// Generate normals
    pub has_normal: bool,
    /// Generate tangents
    pub has_tangent: bool,
    /// Flip U
    pub flip_u: bool,
    /// Flip V
    pub flip_v: bool,
    /// Rotate the texture a quarter turn
    pub rotate_texture: bool,
    /// Draw calls may be split per draw request
    pub slicable: bool,
    /// Particles are sorted back to front
    pub need_sort: bool,
    /// Blend two atlas frames
    pub has_atlas_blending: bool,
    /// Alpha remapping
    pub has_alpha_remapper: bool,
    /// Ribbon deformation correction
    pub correct_deformation: bool,
    /// Lit shading
    pub lit: bool,
    /// Casts shadows
    pub cast_shadows: bool,
    /// Ray traced
    pub raytraced: bool,
    /// Mesh LOD per particle
    pub per_particle_lod: bool,
    /// Mesh motion blur
    pub motion_blur: bool,
    /// Mesh atlas
    pub has_mesh_atlas: bool,
    /// Light affects translucent surfaces
    pub light_translucent: bool,
    /// Volume material; forces vertex-shader billboarding
    pub volumetric: bool,
    /// Bit `i` is set when generic shader input `i` is declared
    pub dynamic_parameter_mask: u8,
}

/// Resolved rendering description of one renderer
#[derive(Debug, Clone)]
pub struct MaterialDesc {
    /// Renderer kind
    pub kind: RendererKind,
    /// Bound material
    pub material: Option<Arc<MaterialAsset>>,
    /// Bound mesh
    pub mesh: Option<Arc<MeshAsset>>,
    /// Geometry flags
    pub flags: BillboardingFlags,
    /// Mesh bounds
    pub mesh_bounds: Aabb,
    /// Bounds of every section of every LOD
    pub section_bounds: Vec<Vec<Aabb>>,
    /// Sound assets
    pub sounds: Vec<String>,
    /// Light falloff steepness
    pub attenuation_steepness: f32,
    /// Sound doppler factor
    pub doppler_factor: f32,
    /// Fields forwarded to shaders
    pub additional_inputs: Vec<FieldDefinition>,
}

impl MaterialDesc {
    /// Empty description
    pub fn new(kind: RendererKind) -> Self {
        Self {
            kind,
            material: None,
            mesh: None,
            flags: BillboardingFlags::default(),
            mesh_bounds: Aabb::invalid(),
            section_bounds: Vec::new(),
            sounds: Vec::new(),
            attenuation_steepness: 0.0,
            doppler_factor: 0.0,
            additional_inputs: Vec::new(),
        }
    }

    /// Id of the bound material
    pub fn material_id(&self) -> Option<MaterialId> {
        self.material.as_ref().map(|m| m.id)
    }

    /// Blend mode of the bound material
    pub fn blend_mode(&self) -> Option<BlendMode> {
        self.material.as_ref().map(|m| m.blend_mode)
    }

    /// Whether a material is bound
    pub const fn has_material(&self) -> bool {
        self.material.is_some()
    }

    /// Whether the material can render now (always for material-less kinds)
    pub fn is_material_valid(&self) -> bool {
        !self.kind.has_material() || self.material.as_ref().is_some_and(|m| m.ready)
    }
}

/// Publication state of an update-side cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Nothing resolved, or the last attempt failed
    Unresolved,
    /// Assets bound and flags computed
    GameThreadResolved,
    /// Snapshot queued for the render thread
    Published,
}

/// Update-side cache of one renderer
#[derive(Debug)]
pub struct RendererCache {
    medium: MediumId,
    renderer_index: u32,
    decl: Arc<RendererDecl>,
    state: CacheState,
    desc: MaterialDesc,
}

impl RendererCache {
    /// Unresolved cache for a renderer declaration
    pub fn new(medium: MediumId, renderer_index: u32, decl: Arc<RendererDecl>) -> Self {
        let desc = MaterialDesc::new(decl.kind);
        Self {
            medium,
            renderer_index,
            decl,
            state: CacheState::Unresolved,
            desc,
        }
    }

    /// Owning medium
    pub const fn medium(&self) -> MediumId {
        self.medium
    }

    /// Renderer index inside the medium
    pub const fn renderer_index(&self) -> u32 {
        self.renderer_index
    }

    /// Renderer declaration
    pub fn decl(&self) -> &RendererDecl {
        &self.decl
    }

    /// Current state
    pub const fn state(&self) -> CacheState {
        self.state
    }

    /// Resolved description
    pub const fn desc(&self) -> &MaterialDesc {
        &self.desc
    }

    /// Bind the material and mesh of the declaration
    pub fn game_thread_resolve(&mut self, assets: &dyn AssetResolver) -> Result<(), CacheError> {
        self.state = CacheState::Unresolved;
        let kind = self.decl.kind;
        let mut desc = MaterialDesc::new(kind);

        if kind.has_material() {
            let path = self.decl.material.as_deref().ok_or(CacheError::NoMaterial)?;
            let material = assets
                .material(path)
                .ok_or_else(|| CacheError::MaterialNotFound(path.to_string()))?;
            desc.material = Some(if is_domain_supported(kind, material.domain) {
                material
            } else {
                let fallback = assets
                    .default_material(kind)
                    .filter(|m| is_domain_supported(kind, m.domain))
                    .ok_or_else(|| CacheError::UnsupportedDomain {
                        path: path.to_string(),
                        domain: material.domain,
                        kind,
                    })?;
                log::warn!(
                    "Material '{}' ({:?}) cannot be used by {:?} renderers, falling back to '{}'",
                    path,
                    material.domain,
                    kind,
                    fallback.path
                );
                fallback
            });
        }

        if kind == RendererKind::Mesh {
            let path = self.decl.mesh.as_deref().ok_or(CacheError::NoMesh)?;
            desc.mesh = Some(
                assets
                    .mesh(path)
                    .ok_or_else(|| CacheError::MeshNotFound(path.to_string()))?,
            );
        }

        let properties = &self.decl.properties;
        desc.sounds = self.decl.sounds.clone();
        desc.attenuation_steepness = properties.attenuation_steepness;
        desc.doppler_factor = properties.doppler_factor;
        desc.additional_inputs = self.decl.additional_inputs.clone();

        self.desc = desc;
        self.state = CacheState::GameThreadResolved;
        Ok(())
    }

    /// Compute billboarding flags and mesh bounds
    pub fn game_thread_setup(&mut self) -> Result<(), CacheError> {
        if self.state == CacheState::Unresolved {
            return Err(CacheError::NotResolved);
        }
        let kind = self.decl.kind;
        let props = &self.decl.properties;
        let mut flags = BillboardingFlags::default();

        if !kind.has_material() {
            flags.light_translucent = props.light_translucent;
            flags.cast_shadows = props.cast_shadows;
            self.desc.flags = flags;
            return Ok(());
        }

        flags.dynamic_parameter_mask = self
            .decl
            .additional_inputs
            .iter()
            .filter_map(|field| fields::SHADER_INPUTS.iter().position(|name| *name == field.name))
            .fold(0, |mask, slot| mask | (1 << slot));
        flags.raytraced = props.raytraced;
        flags.cast_shadows = props.cast_shadows;
        flags.correct_deformation = kind == RendererKind::Ribbon && props.correct_deformation;
        flags.lit = props.lit;

        if kind == RendererKind::Mesh {
            let mesh = self.desc.mesh.clone().ok_or(CacheError::NoMesh)?;
            let ready = if mesh.skeletal {
                mesh.has_animation_texture
            } else {
                mesh.has_render_data
            };
            if !ready {
                return Err(CacheError::MeshNotReady(self.decl.mesh.clone().unwrap_or_default()));
            }
            flags.per_particle_lod = props.per_particle_lod;
            flags.motion_blur = props.motion_blur;
            flags.has_mesh_atlas = props.mesh_atlas;
            self.desc.mesh_bounds = mesh.bounds;
            self.desc.section_bounds = mesh
                .lods
                .iter()
                .map(|lod| vec![mesh.bounds; lod.sections.len()])
                .collect();
        } else {
            flags.need_sort = props.needs_sort;
            flags.has_atlas_blending = props.soft_animation_blending || props.motion_vectors_blending;
            flags.has_alpha_remapper = props.alpha_remapper;
        }

        flags.has_uv = true;
        flags.has_normal = flags.lit;
        flags.has_tangent = flags.lit;
        if matches!(kind, RendererKind::Billboard | RendererKind::Ribbon | RendererKind::Triangle) {
            flags.slicable = self
                .desc
                .blend_mode()
                .is_some_and(BlendMode::is_order_dependent);
        }
        if !flags.slicable {
            flags.need_sort = false;
        }
        match kind {
            RendererKind::Billboard => {
                flags.flip_u = props.flip_uvs;
                flags.flip_v = props.flip_uvs;
            }
            RendererKind::Ribbon => {
                flags.flip_u = props.ribbon_flip_u;
                flags.flip_v = props.ribbon_flip_v;
                flags.rotate_texture = props.ribbon_rotate_texture;
            }
            _ => {}
        }
        flags.volumetric = self
            .desc
            .material
            .as_ref()
            .is_some_and(|m| m.domain == MaterialDomain::Volume);

        self.desc.flags = flags;
        Ok(())
    }

    fn reset(&mut self, decl: Arc<RendererDecl>) {
        self.desc = MaterialDesc::new(decl.kind);
        self.decl = decl;
        self.state = CacheState::Unresolved;
    }
}

/// Cross-thread operation on the render-side cache table
#[derive(Debug, Clone)]
pub enum PendingCacheOp {
    /// Publish or replace a snapshot
    Publish {
        /// Cache key
        key: CacheKey,
        /// Snapshot taken on the update thread
        desc: MaterialDesc,
    },
    /// Forget a cache
    Remove(CacheKey),
}

/// Queue of cache operations, written by the update thread and drained by the render thread
#[derive(Debug, Clone, Default)]
pub struct PendingCaches {
    queue: Arc<Mutex<Vec<PendingCacheOp>>>,
}

impl PendingCaches {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a snapshot
    pub fn publish(&self, key: CacheKey, desc: MaterialDesc) {
        self.queue.lock().push(PendingCacheOp::Publish { key, desc });
    }

    /// Queue a removal
    pub fn remove(&self, key: CacheKey) {
        self.queue.lock().push(PendingCacheOp::Remove(key));
    }

    /// Take every queued operation
    pub fn drain(&self) -> Vec<PendingCacheOp> {
        std::mem::take(&mut *self.queue.lock())
    }

    /// Queued operation count
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read access to finalized caches
pub trait CacheLookup {
    /// Description of a cache ready for drawing
    fn desc(&self, key: CacheKey) -> Option<&MaterialDesc>;

    /// Whether the material of a ready cache can render
    fn is_material_valid(&self, key: CacheKey) -> bool {
        self.desc(key).is_some_and(MaterialDesc::is_material_valid)
    }
}

/// Render-thread copy of a cache
#[derive(Debug, Clone)]
pub struct RenderThreadCache {
    /// Snapshot
    pub desc: MaterialDesc,
    /// Material resolved to a usable render proxy
    pub material_valid: bool,
}

/// Finalize a snapshot on the render thread
pub fn render_thread_setup(desc: MaterialDesc) -> RenderThreadCache {
    let material_valid = desc.is_material_valid();
    if !material_valid {
        log::warn!(
            "{:?} renderer material {:?} has no usable render proxy",
            desc.kind,
            desc.material.as_ref().map(|m| m.path.as_str())
        );
    }
    RenderThreadCache { desc, material_valid }
}

/// Caches the render thread may reference
#[derive(Debug, Default)]
pub struct RenderCacheTable {
    entries: SecondaryMap<CacheKey, RenderThreadCache>,
}

impl RenderCacheTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every pending operation; returns how many were applied
    pub fn drain_pending(&mut self, pending: &PendingCaches) -> usize {
        let ops = pending.drain();
        let count = ops.len();
        for op in ops {
            match op {
                PendingCacheOp::Publish { key, desc } => {
                    self.entries.insert(key, render_thread_setup(desc));
                }
                PendingCacheOp::Remove(key) => {
                    self.entries.remove(key);
                }
            }
        }
        if count > 0 {
            log::trace!("Applied {} pending renderer cache operations", count);
        }
        count
    }

    /// Render-thread cache
    pub fn get(&self, key: CacheKey) -> Option<&RenderThreadCache> {
        self.entries.get(key)
    }

    /// Ready cache count
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no cache is ready
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every cache
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl CacheLookup for RenderCacheTable {
    fn desc(&self, key: CacheKey) -> Option<&MaterialDesc> {
        self.entries.get(key).map(|entry| &entry.desc)
    }

    fn is_material_valid(&self, key: CacheKey) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.material_valid)
    }
}

/// Update-thread arena of renderer caches keyed by medium and renderer index
#[derive(Debug)]
pub struct RendererCacheArena {
    caches: SlotMap<CacheKey, RendererCache>,
    by_renderer: HashMap<(MediumId, u32), CacheKey>,
    failures_logged: HashSet<CacheKey>,
    pending: PendingCaches,
}

impl RendererCacheArena {
    /// Arena publishing into `pending`
    pub fn new(pending: PendingCaches) -> Self {
        Self {
            caches: SlotMap::with_key(),
            by_renderer: HashMap::new(),
            failures_logged: HashSet::new(),
            pending,
        }
    }

    /// Find or lazily build the cache of a renderer
    ///
    /// Returns `None` when the cache cannot be resolved this frame; the failure
    /// is logged once and resolution is retried on the next call.
    pub fn resolve(
        &mut self,
        medium: MediumId,
        renderer_index: u32,
        decl: &Arc<RendererDecl>,
        assets: &dyn AssetResolver,
    ) -> Option<CacheKey> {
        let key = match self.by_renderer.get(&(medium, renderer_index)) {
            Some(&key) => key,
            None => {
                let key = self
                    .caches
                    .insert(RendererCache::new(medium, renderer_index, Arc::clone(decl)));
                self.by_renderer.insert((medium, renderer_index), key);
                key
            }
        };
        let cache = self.caches.get_mut(key)?;
        if !Arc::ptr_eq(&cache.decl, decl) && *cache.decl != **decl {
            cache.reset(Arc::clone(decl));
        }
        if cache.state == CacheState::Published {
            return Some(key);
        }

        match cache.game_thread_resolve(assets).and_then(|()| cache.game_thread_setup()) {
            Ok(()) => {
                cache.state = CacheState::Published;
                self.pending.publish(key, cache.desc.clone());
                self.failures_logged.remove(&key);
                Some(key)
            }
            Err(err) => {
                cache.state = CacheState::Unresolved;
                if self.failures_logged.insert(key) {
                    log::warn!(
                        "Skipping {:?} renderer {} of medium {:?}: {}",
                        cache.decl.kind,
                        renderer_index,
                        medium,
                        err
                    );
                }
                None
            }
        }
    }

    /// Cache by key
    pub fn get(&self, key: CacheKey) -> Option<&RendererCache> {
        self.caches.get(key)
    }

    /// Key of a renderer's cache
    pub fn key_of(&self, medium: MediumId, renderer_index: u32) -> Option<CacheKey> {
        self.by_renderer.get(&(medium, renderer_index)).copied()
    }

    /// Destroy the cache of one renderer
    pub fn remove_renderer(&mut self, medium: MediumId, renderer_index: u32) {
        if let Some(key) = self.by_renderer.remove(&(medium, renderer_index)) {
            self.caches.remove(key);
            self.failures_logged.remove(&key);
            self.pending.remove(key);
        }
    }

    /// Destroy every cache of a medium
    pub fn remove_medium(&mut self, medium: MediumId) {
        let indices: Vec<u32> = self
            .by_renderer
            .keys()
            .filter(|(m, _)| *m == medium)
            .map(|(_, index)| *index)
            .collect();
        for index in indices {
            self.remove_renderer(medium, index);
        }
    }

    /// Force every cache to resolve again, e.g. after assets changed
    pub fn invalidate_all(&mut self) {
        for (_, cache) in &mut self.caches {
            cache.state = CacheState::Unresolved;
        }
    }

    /// Live cache count
    pub fn len(&self) -> usize {
        self.caches.len()
    }

    /// Whether the arena is empty
    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}

impl CacheLookup for RendererCacheArena {
    fn desc(&self, key: CacheKey) -> Option<&MaterialDesc> {
        self.caches
            .get(key)
            .filter(|cache| cache.state == CacheState::Published)
            .map(RendererCache::desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{AssetRegistry, MeshId, MeshLod, MeshSection};
    use crate::foundation::math::Vec3;
    use crate::simulation::{FieldType, RendererProperties};

    fn registry() -> AssetRegistry {
        let registry = AssetRegistry::new();
        registry.insert_material(MaterialAsset::new(1, "smoke", BlendMode::Translucent));
        registry.insert_material(MaterialAsset::new(2, "rock", BlendMode::Opaque));
        registry.insert_material(
            MaterialAsset::new(3, "fog", BlendMode::Translucent).with_domain(MaterialDomain::Volume),
        );
        registry
    }

    fn mesh(skeletal: bool, ready: bool) -> MeshAsset {
        MeshAsset {
            id: MeshId(1),
            skeletal,
            has_render_data: ready,
            has_animation_texture: ready,
            bounds: Aabb::new(Vec3::repeat(-1.0), Vec3::repeat(1.0)),
            lods: vec![
                MeshLod {
                    sections: vec![
                        MeshSection { index_count: 36, first_index: 0 },
                        MeshSection { index_count: 12, first_index: 36 },
                    ],
                },
                MeshLod {
                    sections: vec![MeshSection { index_count: 12, first_index: 48 }],
                },
            ],
            index_buffer: None,
        }
    }

    fn resolved(decl: RendererDecl, assets: &AssetRegistry) -> Result<RendererCache, CacheError> {
        let mut cache = RendererCache::new(MediumId(1), 0, Arc::new(decl));
        cache.game_thread_resolve(assets)?;
        cache.game_thread_setup()?;
        Ok(cache)
    }

    #[test]
    fn test_translucent_billboard_flags() {
        let decl = RendererDecl::new(RendererKind::Billboard)
            .with_material("smoke")
            .with_properties(RendererProperties {
                lit: true,
                needs_sort: true,
                flip_uvs: true,
                soft_animation_blending: true,
                ..RendererProperties::default()
            })
            .with_additional_input(fields::SHADER_INPUTS[0], FieldType::Float4)
            .with_additional_input(fields::SHADER_INPUTS[2], FieldType::Float4);
        let cache = resolved(decl, &registry()).expect("Should resolve");
        let flags = cache.desc().flags;

        assert!(flags.has_uv && flags.has_normal && flags.has_tangent);
        assert!(flags.slicable && flags.need_sort);
        assert!(flags.flip_u && flags.flip_v);
        assert!(flags.has_atlas_blending);
        assert_eq!(flags.dynamic_parameter_mask, 0b101);
    }

    #[test]
    fn test_opaque_material_is_not_sorted() {
        let decl = RendererDecl::new(RendererKind::Billboard)
            .with_material("rock")
            .with_properties(RendererProperties {
                needs_sort: true,
                ..RendererProperties::default()
            });
        let flags = resolved(decl, &registry()).expect("Should resolve").desc().flags;
        assert!(!flags.slicable);
        assert!(!flags.need_sort);
    }

    #[test]
    fn test_missing_material_fails() {
        let decl = RendererDecl::new(RendererKind::Ribbon).with_material("missing");
        assert_eq!(
            resolved(decl, &registry()).err(),
            Some(CacheError::MaterialNotFound("missing".to_string()))
        );
        let decl = RendererDecl::new(RendererKind::Ribbon);
        assert_eq!(resolved(decl, &registry()).err(), Some(CacheError::NoMaterial));
    }

    #[test]
    fn test_unsupported_domain_falls_back_to_default() {
        let assets = registry();
        let decl = RendererDecl::new(RendererKind::Ribbon).with_material("fog");
        assert!(matches!(
            resolved(decl.clone(), &assets),
            Err(CacheError::UnsupportedDomain { .. })
        ));

        assets.set_default_material(
            RendererKind::Ribbon,
            MaterialAsset::new(9, "default_ribbon", BlendMode::Additive),
        );
        let cache = resolved(decl, &assets).expect("Should fall back");
        assert_eq!(cache.desc().material_id(), Some(MaterialId(9)));
    }

    #[test]
    fn test_volume_billboard_is_volumetric() {
        let decl = RendererDecl::new(RendererKind::Billboard).with_material("fog");
        let cache = resolved(decl, &registry()).expect("Should resolve");
        assert!(cache.desc().flags.volumetric);
    }

    #[test]
    fn test_mesh_bounds_per_section() {
        let assets = registry();
        assets.insert_mesh("cube", mesh(false, true));
        let decl = RendererDecl::new(RendererKind::Mesh)
            .with_material("rock")
            .with_mesh("cube");
        let cache = resolved(decl, &assets).expect("Should resolve");
        let desc = cache.desc();

        assert_eq!(desc.section_bounds.len(), 2);
        assert_eq!(desc.section_bounds[0].len(), 2);
        assert_eq!(desc.section_bounds[1][0], desc.mesh_bounds);
    }

    #[test]
    fn test_mesh_without_render_data_fails_setup() {
        let assets = registry();
        assets.insert_mesh("pending", mesh(true, false));
        let decl = RendererDecl::new(RendererKind::Mesh)
            .with_material("rock")
            .with_mesh("pending");
        assert!(matches!(resolved(decl, &assets), Err(CacheError::MeshNotReady(_))));
    }

    #[test]
    fn test_light_reads_properties_without_material() {
        let decl = RendererDecl::new(RendererKind::Light).with_properties(RendererProperties {
            light_translucent: true,
            cast_shadows: true,
            ..RendererProperties::default()
        });
        let cache = resolved(decl, &registry()).expect("Should resolve");
        assert!(cache.desc().flags.light_translucent);
        assert!(cache.desc().is_material_valid());
    }

    #[test]
    fn test_setup_before_resolve_fails() {
        let mut cache = RendererCache::new(
            MediumId(1),
            0,
            Arc::new(RendererDecl::new(RendererKind::Billboard).with_material("smoke")),
        );
        assert_eq!(cache.game_thread_setup(), Err(CacheError::NotResolved));
    }

    #[test]
    fn test_render_table_only_sees_drained_caches() {
        let assets = registry();
        let pending = PendingCaches::new();
        let mut arena = RendererCacheArena::new(pending.clone());
        let mut table = RenderCacheTable::new();
        let decl = Arc::new(RendererDecl::new(RendererKind::Billboard).with_material("smoke"));

        let key = arena.resolve(MediumId(1), 0, &decl, &assets).expect("Should resolve");
        assert!(table.desc(key).is_none());
        assert_eq!(pending.len(), 1);

        assert_eq!(table.drain_pending(&pending), 1);
        assert!(table.desc(key).is_some());
        assert!(table.is_material_valid(key));

        assert_eq!(arena.resolve(MediumId(1), 0, &decl, &assets), Some(key));
        assert!(pending.is_empty());

        arena.remove_medium(MediumId(1));
        table.drain_pending(&pending);
        assert!(table.desc(key).is_none());
        assert!(arena.is_empty());
    }

    #[test]
    fn test_failed_cache_retries_until_assets_appear() {
        let assets = AssetRegistry::new();
        let mut arena = RendererCacheArena::new(PendingCaches::new());
        let decl = Arc::new(RendererDecl::new(RendererKind::Triangle).with_material("late"));

        assert!(arena.resolve(MediumId(2), 3, &decl, &assets).is_none());
        assert!(arena.resolve(MediumId(2), 3, &decl, &assets).is_none());
        assets.insert_material(MaterialAsset::new(5, "late", BlendMode::Opaque));
        assert!(arena.resolve(MediumId(2), 3, &decl, &assets).is_some());
    }

    #[test]
    fn test_not_ready_material_is_flagged_invalid() {
        let assets = AssetRegistry::new();
        assets.insert_material(MaterialAsset::new(5, "compiling", BlendMode::Opaque).not_ready());
        let pending = PendingCaches::new();
        let mut arena = RendererCacheArena::new(pending.clone());
        let mut table = RenderCacheTable::new();
        let decl = Arc::new(RendererDecl::new(RendererKind::Billboard).with_material("compiling"));

        let key = arena.resolve(MediumId(1), 0, &decl, &assets).expect("Should resolve");
        table.drain_pending(&pending);
        assert!(table.desc(key).is_some());
        assert!(!table.is_material_valid(key));
    }

    #[test]
    fn test_changed_declaration_is_republished() {
        let assets = registry();
        let pending = PendingCaches::new();
        let mut arena = RendererCacheArena::new(pending.clone());
        let first = Arc::new(RendererDecl::new(RendererKind::Billboard).with_material("smoke"));
        let second = Arc::new(RendererDecl::new(RendererKind::Billboard).with_material("rock"));

        let key = arena.resolve(MediumId(1), 0, &first, &assets).expect("Should resolve");
        assert_eq!(arena.resolve(MediumId(1), 0, &second, &assets), Some(key));
        assert_eq!(pending.len(), 2);
        assert_eq!(
            arena.get(key).and_then(|c| c.desc().material_id()),
            Some(MaterialId(2))
        );
    }
}

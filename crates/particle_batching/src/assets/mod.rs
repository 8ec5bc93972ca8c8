//! Material and mesh assets
//!
//! Renderer caches resolve asset paths through an [`AssetResolver`] injected at
//! setup. [`AssetRegistry`] is a ready-made in-memory resolver.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::foundation::math::Aabb;
use crate::simulation::RendererKind;

/// Identifier of a material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub u64);

/// Identifier of a mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u64);

/// Material domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterialDomain {
    /// Regular surface shading
    Surface,
    /// Volumetric fog particles
    Volume,
    /// Deferred decal
    DeferredDecal,
    /// Full-screen post process
    PostProcess,
}

/// Blend mode of a material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    /// Opaque
    Opaque,
    /// Alpha tested
    Masked,
    /// Alpha blended
    Translucent,
    /// Additive
    Additive,
    /// Premultiplied alpha
    AlphaComposite,
    /// Multiplicative
    Modulate,
}

impl BlendMode {
    /// Whether draw order changes the result
    pub const fn is_order_dependent(self) -> bool {
        matches!(
            self,
            Self::Translucent | Self::Additive | Self::AlphaComposite | Self::Modulate
        )
    }
}

/// Material asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialAsset {
    /// Material id
    pub id: MaterialId,
    /// Asset path
    pub path: String,
    /// Shading domain
    pub domain: MaterialDomain,
    /// Blend mode
    pub blend_mode: BlendMode,
    /// Render proxy is compiled and usable
    pub ready: bool,
}

impl MaterialAsset {
    /// Ready surface material
    pub fn new(id: u64, path: impl Into<String>, blend_mode: BlendMode) -> Self {
        Self {
            id: MaterialId(id),
            path: path.into(),
            domain: MaterialDomain::Surface,
            blend_mode,
            ready: true,
        }
    }

    /// Set the shading domain
    #[must_use]
    pub const fn with_domain(mut self, domain: MaterialDomain) -> Self {
        self.domain = domain;
        self
    }

    /// Mark the render proxy as not ready
    #[must_use]
    pub const fn not_ready(mut self) -> Self {
        self.ready = false;
        self
    }
}

/// One drawable section of a mesh LOD
#[derive(Debug, Clone, PartialEq)]
pub struct MeshSection {
    /// Index count of the section
    pub index_count: u32,
    /// First index in the mesh index buffer
    pub first_index: u32,
}

/// One level of detail
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeshLod {
    /// Sections of the LOD
    pub sections: Vec<MeshSection>,
}

/// Mesh asset
#[derive(Debug, Clone, PartialEq)]
pub struct MeshAsset {
    /// Mesh id
    pub id: MeshId,
    /// Skeletal meshes are drawn through a baked animation texture
    pub skeletal: bool,
    /// Static render data is uploaded
    pub has_render_data: bool,
    /// Baked animation texture is available
    pub has_animation_texture: bool,
    /// Object-space bounds
    pub bounds: Aabb,
    /// Levels of detail
    pub lods: Vec<MeshLod>,
    /// Shared index buffer of every section
    pub index_buffer: Option<crate::render::api::GpuBufferHandle>,
}

/// Material and mesh lookup service
pub trait AssetResolver: Send + Sync {
    /// Material by path
    fn material(&self, path: &str) -> Option<Arc<MaterialAsset>>;

    /// Fallback material for a renderer kind
    fn default_material(&self, kind: RendererKind) -> Option<Arc<MaterialAsset>>;

    /// Mesh by path
    fn mesh(&self, path: &str) -> Option<Arc<MeshAsset>>;
}

/// In-memory asset resolver
#[derive(Debug, Default)]
pub struct AssetRegistry {
    materials: RwLock<HashMap<String, Arc<MaterialAsset>>>,
    defaults: RwLock<HashMap<RendererKind, Arc<MaterialAsset>>>,
    meshes: RwLock<HashMap<String, Arc<MeshAsset>>>,
}

impl AssetRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a material under its path
    pub fn insert_material(&self, material: MaterialAsset) -> Arc<MaterialAsset> {
        let material = Arc::new(material);
        self.materials
            .write()
            .insert(material.path.clone(), Arc::clone(&material));
        material
    }

    /// Register the fallback material of a renderer kind
    pub fn set_default_material(&self, kind: RendererKind, material: MaterialAsset) {
        self.defaults.write().insert(kind, Arc::new(material));
    }

    /// Register or replace a mesh
    pub fn insert_mesh(&self, path: impl Into<String>, mesh: MeshAsset) -> Arc<MeshAsset> {
        let mesh = Arc::new(mesh);
        self.meshes.write().insert(path.into(), Arc::clone(&mesh));
        mesh
    }
}

impl AssetResolver for AssetRegistry {
    fn material(&self, path: &str) -> Option<Arc<MaterialAsset>> {
        self.materials.read().get(path).cloned()
    }

    fn default_material(&self, kind: RendererKind) -> Option<Arc<MaterialAsset>> {
        self.defaults.read().get(&kind).cloned()
    }

    fn mesh(&self, path: &str) -> Option<Arc<MeshAsset>> {
        self.meshes.read().get(path).cloned()
    }
}

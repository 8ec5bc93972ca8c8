//! Batching settings
//!
//! [`BatchingConfig`] is what hosts author. At the start of every update the
//! manager resolves it into an immutable [`FrameSettings`] snapshot that both
//! threads read for the rest of the frame.

use serde::{Deserialize, Serialize};

use super::Config;

/// How draw calls are sorted for translucent passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortMethod {
    /// No sorting
    None,
    /// Sort whole draw calls back to front
    #[default]
    PerDrawCall,
    /// Split draw calls per draw request and sort the slices
    PerSlicedDrawCall,
    /// Per-page sorting; renders like [`SortMethod::PerDrawCall`]
    PerPageDrawCall,
}

/// Where billboard geometry is expanded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BillboardingLocation {
    /// Vertices are generated on the CPU
    #[default]
    Cpu,
    /// Particles are uploaded and expanded in the vertex shader
    GpuVertexShader,
    /// Expanded by a compute pass; chosen automatically for GPU storage without
    /// vertex billboarding support
    #[serde(skip)]
    ComputeShader,
}

/// Internal sort mode derived from [`SortMethod`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DrawCallSort {
    /// Draw calls keep collection order
    #[default]
    None,
    /// One draw call per pass, passes sorted by distance
    DrawCalls,
    /// One draw call per draw request, sorted by distance
    Slices,
}

impl From<SortMethod> for DrawCallSort {
    fn from(method: SortMethod) -> Self {
        match method {
            SortMethod::None => Self::None,
            SortMethod::PerDrawCall | SortMethod::PerPageDrawCall => Self::DrawCalls,
            SortMethod::PerSlicedDrawCall => Self::Slices,
        }
    }
}

/// Batching settings authored by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Draw call sorting for translucent materials
    pub sort_method: SortMethod,
    /// Billboarding location for CPU-simulated billboards
    pub billboarding_location: BillboardingLocation,
    /// Rebuild drawers every frame instead of keeping them across frames
    pub stateless_collect: bool,
    /// Seconds between buffer pool garbage collections
    pub gc_interval_secs: f32,
    /// Release the collected frame as soon as every view drew it
    pub early_frame_release: bool,
    /// Drop draw requests outside the shadow views during late culling
    pub enable_shadow_late_cull: bool,
    /// Make every particle light affect translucent surfaces
    pub force_lights_translucent: bool,
    /// Number of collected frames that may be in flight at once
    pub frame_pool_size: usize,
    /// Whether the graphics backend can expand billboards in the vertex shader
    pub vertex_billboarding_supported: bool,
    /// Emit sound particles
    pub enable_audio: bool,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            sort_method: SortMethod::PerDrawCall,
            billboarding_location: BillboardingLocation::Cpu,
            stateless_collect: false,
            gc_interval_secs: 2.0,
            early_frame_release: false,
            enable_shadow_late_cull: true,
            force_lights_translucent: false,
            frame_pool_size: 4,
            vertex_billboarding_supported: true,
            enable_audio: true,
        }
    }
}

impl Config for BatchingConfig {}

impl BatchingConfig {
    /// Set the translucent sort method
    #[must_use]
    pub const fn with_sort_method(mut self, sort_method: SortMethod) -> Self {
        self.sort_method = sort_method;
        self
    }

    /// Set the billboarding location
    #[must_use]
    pub const fn with_billboarding_location(mut self, location: BillboardingLocation) -> Self {
        self.billboarding_location = location;
        self
    }

    /// Set the garbage collection interval in seconds
    #[must_use]
    pub const fn with_gc_interval(mut self, seconds: f32) -> Self {
        self.gc_interval_secs = seconds;
        self
    }

    /// Enable or disable early frame release
    #[must_use]
    pub const fn with_early_frame_release(mut self, enabled: bool) -> Self {
        self.early_frame_release = enabled;
        self
    }

    /// Enable or disable stateless collection
    #[must_use]
    pub const fn with_stateless_collect(mut self, enabled: bool) -> Self {
        self.stateless_collect = enabled;
        self
    }

    /// Force particle lights to affect translucency
    #[must_use]
    pub const fn with_force_lights_translucent(mut self, enabled: bool) -> Self {
        self.force_lights_translucent = enabled;
        self
    }

    /// Set how many collected frames may be in flight
    #[must_use]
    pub const fn with_frame_pool_size(mut self, size: usize) -> Self {
        self.frame_pool_size = size;
        self
    }

    /// Declare vertex billboarding support of the backend
    #[must_use]
    pub const fn with_vertex_billboarding(mut self, supported: bool) -> Self {
        self.vertex_billboarding_supported = supported;
        self
    }

    /// Enable or disable sound particles
    #[must_use]
    pub const fn with_audio(mut self, enabled: bool) -> Self {
        self.enable_audio = enabled;
        self
    }

    /// Resolve the per-frame snapshot
    ///
    /// `backend_vertex_billboarding` is what the graphics backend reports; vertex
    /// billboarding is only used when both sides allow it.
    pub fn resolve(&self, backend_vertex_billboarding: bool) -> FrameSettings {
        let vertex_billboarding = self.vertex_billboarding_supported && backend_vertex_billboarding;
        let billboarding_location = match self.billboarding_location {
            BillboardingLocation::GpuVertexShader if vertex_billboarding => {
                BillboardingLocation::GpuVertexShader
            }
            _ => BillboardingLocation::Cpu,
        };
        FrameSettings {
            draw_call_sort: self.sort_method.into(),
            billboarding_location,
            vertex_billboarding_supported: vertex_billboarding,
            stateless_collect: self.stateless_collect,
            early_frame_release: self.early_frame_release,
            enable_shadow_late_cull: self.enable_shadow_late_cull,
            force_lights_translucent: self.force_lights_translucent,
            enable_audio: self.enable_audio,
            gc_interval_secs: self.gc_interval_secs.max(0.0),
        }
    }
}

/// Immutable settings snapshot shared by both threads for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSettings {
    /// Draw call sort mode
    pub draw_call_sort: DrawCallSort,
    /// Billboarding location for main-memory billboards
    pub billboarding_location: BillboardingLocation,
    /// Vertex billboarding usable this frame
    pub vertex_billboarding_supported: bool,
    /// Drawers are rebuilt every frame
    pub stateless_collect: bool,
    /// Release frames once every view drew them
    pub early_frame_release: bool,
    /// Late-cull shadow passes
    pub enable_shadow_late_cull: bool,
    /// Lights always affect translucency
    pub force_lights_translucent: bool,
    /// Sound particles are emitted
    pub enable_audio: bool,
    /// Seconds between pool garbage collections
    pub gc_interval_secs: f32,
}

impl Default for FrameSettings {
    fn default() -> Self {
        BatchingConfig::default().resolve(true)
    }
}

//! Backend abstraction traits for the batching system
//!
//! This module defines the trait that graphics backends implement so batch
//! drawers can create buffers, upload data and submit work without knowing the
//! native API underneath.

use bitflags::bitflags;

use crate::assets::{BlendMode, MaterialId};
use crate::render::sub_view::RenderPassKind;
use crate::simulation::RendererKind;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer owned by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuBufferHandle(pub u64);

/// Graphics backend errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend could not create a buffer
    #[error("Buffer creation failed ({size_in_bytes} bytes): {reason}")]
    BufferCreation {
        /// Requested size
        size_in_bytes: u64,
        /// Backend specific reason
        reason: String,
    },

    /// The handle does not name a live buffer
    #[error("Unknown buffer handle {0:?}")]
    UnknownBuffer(GpuBufferHandle),

    /// A write went past the end of a buffer
    #[error("Write of {len} bytes at offset {offset} overflows buffer {buffer:?}")]
    WriteOutOfBounds {
        /// Target buffer
        buffer: GpuBufferHandle,
        /// Write offset in bytes
        offset: u32,
        /// Write length in bytes
        len: usize,
    },

    /// The device is gone
    #[error("Device lost")]
    DeviceLost,
}

bitflags! {
    /// How a buffer is bound by the GPU
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Vertex input
        const VERTEX = 1 << 0;
        /// Index input
        const INDEX = 1 << 1;
        /// Writable from compute shaders; never CPU-mapped
        const UNORDERED_ACCESS = 1 << 2;
        /// Readable from shaders
        const SHADER_RESOURCE = 1 << 3;
        /// Raw byte-address view
        const BYTE_ADDRESS = 1 << 4;
        /// Holds indirect draw arguments
        const INDIRECT_ARGS = 1 << 5;
    }
}

/// Buffer creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    /// Size in bytes, always 16-byte aligned
    pub size_in_bytes: u32,
    /// Binding flags
    pub usage: BufferUsage,
    /// Element stride in bytes
    pub stride: u32,
}

/// Index element format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    /// 16-bit indices
    U16,
    /// 32-bit indices
    U32,
}

impl IndexFormat {
    /// Size of one index
    pub const fn size_in_bytes(self) -> u32 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// What a bound buffer feeds into the shader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexSemantic {
    /// Vertex or particle positions
    Position,
    /// Vertex normals
    Normal,
    /// Vertex tangents
    Tangent,
    /// First texture coordinate set
    Uv0,
    /// Second texture coordinate set (atlas blending)
    Uv1,
    /// Atlas frame blend factor
    AtlasId,
    /// Per-instance transform matrices
    InstanceTransform,
    /// Flat float buffer holding the additional inputs
    AdditionalInputs,
    /// Raw particle simulation data read by vertex billboarding
    SimulationData,
    /// Per-particle sort indices
    SortIndices,
}

/// A buffer bound to a draw call or dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexStream {
    /// Shader input fed by this buffer
    pub semantic: VertexSemantic,
    /// Bound buffer
    pub buffer: GpuBufferHandle,
    /// Byte offset of the first element
    pub offset_in_bytes: u32,
    /// Element stride in bytes
    pub stride: u32,
}

/// Signed float offsets consumed by particle shaders, `-1` when a field is absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticleUniforms {
    /// Particle positions (float4)
    pub positions_offset: i32,
    /// Particle sizes (float)
    pub sizes_offset: i32,
    /// Particle 2D sizes (float2)
    pub size2s_offset: i32,
    /// Particle rotations (float)
    pub rotations_offset: i32,
    /// First free axis (float3)
    pub axis0s_offset: i32,
    /// Second free axis (float3)
    pub axis1s_offset: i32,
    /// Atlas texture ids (float)
    pub texture_ids_offset: i32,
    /// Diffuse colors (float4)
    pub colors_offset: i32,
    /// Emissive colors (float3)
    pub emissive_colors_offset: i32,
    /// Alpha remap cursors (float)
    pub alpha_cursors_offset: i32,
    /// Generic dynamic parameters (float4 each)
    pub dyn_param_offsets: [i32; 3],
    /// Index of the draw request inside the pass, `-1` for whole passes
    pub draw_request_id: i32,
    /// Non-zero when a sort index buffer is bound
    pub has_sorted_indices: i32,
}

impl Default for ParticleUniforms {
    fn default() -> Self {
        Self {
            positions_offset: -1,
            sizes_offset: -1,
            size2s_offset: -1,
            rotations_offset: -1,
            axis0s_offset: -1,
            axis1s_offset: -1,
            texture_ids_offset: -1,
            colors_offset: -1,
            emissive_colors_offset: -1,
            alpha_cursors_offset: -1,
            dyn_param_offsets: [-1; 3],
            draw_request_id: -1,
            has_sorted_indices: 0,
        }
    }
}

/// How a draw call consumes its geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawPrimitive {
    /// Plain indexed draw
    Indexed {
        /// Index buffer
        index_buffer: GpuBufferHandle,
        /// Index format
        format: IndexFormat,
        /// First index
        first_index: u32,
        /// Number of indices
        index_count: u32,
    },
    /// Indexed draw repeated per instance
    IndexedInstanced {
        /// Index buffer
        index_buffer: GpuBufferHandle,
        /// Index format
        format: IndexFormat,
        /// First index
        first_index: u32,
        /// Indices per instance
        index_count: u32,
        /// First instance
        first_instance: u32,
        /// Number of instances
        instance_count: u32,
    },
    /// Indexed draw whose arguments live in a GPU buffer
    IndexedIndirect {
        /// Index buffer
        index_buffer: GpuBufferHandle,
        /// Index format
        format: IndexFormat,
        /// Buffer holding the arguments
        args_buffer: GpuBufferHandle,
        /// Byte offset of the five argument words
        args_offset_in_bytes: u32,
    },
}

/// One engine draw call
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCall {
    /// Pass the call belongs to
    pub pass: RenderPassKind,
    /// Scene view index
    pub view_index: u32,
    /// Kind of renderer that produced the call
    pub renderer_kind: RendererKind,
    /// Resolved material
    pub material: Option<MaterialId>,
    /// Blend mode of the material
    pub blend_mode: Option<BlendMode>,
    /// Particles covered by the call
    pub particle_count: u32,
    /// Bound buffers
    pub streams: Vec<VertexStream>,
    /// Geometry submission
    pub primitive: DrawPrimitive,
    /// Shader offsets
    pub uniforms: ParticleUniforms,
    /// Whether the call casts shadows
    pub cast_shadows: bool,
}

/// Compute work issued before draw calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeDispatch {
    /// Copy the simulated particle count of one draw request into indirect arguments
    CopySizeToIndirectArgs {
        /// Simulation size buffer
        size_buffer: GpuBufferHandle,
        /// Destination indirect arguments
        args_buffer: GpuBufferHandle,
        /// Byte offset of the destination slot
        args_offset_in_bytes: u32,
        /// Indices emitted per particle
        indices_per_particle: u32,
    },
    /// Expand GPU-stored particles into vertex buffers
    BillboardParticles {
        /// Simulation data buffer
        simulation_buffer: GpuBufferHandle,
        /// Simulation size buffer
        size_buffer: GpuBufferHandle,
        /// Billboarding view
        view_index: u32,
        /// Offsets into the simulation buffer
        uniforms: ParticleUniforms,
        /// Output vertex buffers
        outputs: Vec<VertexStream>,
        /// Output index buffer
        index_buffer: GpuBufferHandle,
        /// Particles the outputs can hold
        particle_capacity: u32,
    },
}

/// Main graphics backend trait
///
/// Only the render thread calls into the backend; implementations must be
/// `Send` so the render thread can own them.
pub trait GraphicsBackend: Send {
    /// Create a buffer and return its handle
    fn create_buffer(&mut self, desc: &BufferDesc) -> BackendResult<GpuBufferHandle>;

    /// Destroy a buffer; unknown handles are ignored
    fn release_buffer(&mut self, handle: GpuBufferHandle);

    /// Upload bytes into a buffer
    fn write_buffer(&mut self, handle: GpuBufferHandle, offset: u32, data: &[u8]) -> BackendResult<()>;

    /// Run a compute pre-pass
    fn dispatch(&mut self, dispatch: &ComputeDispatch) -> BackendResult<()>;

    /// Submit one draw call
    fn submit_draw(&mut self, draw: DrawCall) -> BackendResult<()>;

    /// Whether billboards can be expanded in the vertex shader
    fn supports_vertex_billboarding(&self) -> bool;
}

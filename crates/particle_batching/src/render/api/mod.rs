//! Graphics API abstraction
//!
//! The batching core never talks to a native graphics API. Drawers describe
//! buffers, compute dispatches and draw calls through [`GraphicsBackend`];
//! [`HeadlessBackend`] records them for tests and tools.

pub mod headless;
pub mod render_backend;

pub use headless::{HeadlessBackend, HeadlessRecording};
pub use render_backend::{
    BackendError, BackendResult, BufferDesc, BufferUsage, ComputeDispatch, DrawCall, DrawPrimitive,
    GpuBufferHandle, GraphicsBackend, IndexFormat, ParticleUniforms, VertexSemantic, VertexStream,
};

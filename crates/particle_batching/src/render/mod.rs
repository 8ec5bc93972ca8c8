//! # Particle Rendering
//!
//! Turns the particles of every live medium into batched draw calls.
//!
//! ## Architecture
//!
//! - **Frame collector**: walks the mediums each update tick and merges
//!   compatible draw requests into passes
//! - **Renderer caches**: resolved material and mesh state per renderer,
//!   published to the render thread through a pending queue
//! - **Batch drawers**: one stage machine per renderer kind that fills pooled
//!   buffers and emits draw calls
//! - **Buffer pools**: size-bucketed GPU buffers reused across frames
//! - **Batch manager**: the update/render thread handoff tying it together
//!
//! Nothing here talks to a native graphics API; see [`api::GraphicsBackend`].

pub mod api;
pub mod batch_manager;
pub mod batch_renderer;
pub mod buffer_pool;
pub mod drawers;
pub mod frame_collector;
pub mod render_thread;
pub mod renderer_cache;
pub mod sub_view;

pub use batch_manager::{RenderBatchManager, RenderWorld};
pub use batch_renderer::{BatchRenderer, BatchStats};
pub use buffer_pool::{BufferPool, BufferPools};
pub use frame_collector::{BatchKey, CollectedFrame, DrawPass, FrameCollector, FrameRef};
pub use render_thread::{RenderThread, RenderThreadError};
pub use renderer_cache::{MaterialDesc, PendingCaches, RenderCacheTable, RendererCacheArena};
pub use sub_view::{RenderPassKind, RendererSubView, SceneView};

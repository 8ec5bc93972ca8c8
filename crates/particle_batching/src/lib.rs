//! # Particle Batching
//!
//! Render batching core for particle systems: collects the particles of every
//! simulation medium once per update, merges compatible renderers into batches
//! and turns each batch into pooled GPU buffers and draw calls on a dedicated
//! render thread.
//!
//! ## Features
//!
//! - **Batching**: renderers sharing a material and storage class draw together
//! - **Buffer Pools**: size-bucketed buffers reused across frames, collected when idle
//! - **Billboarding**: CPU, vertex-shader or compute-shader expansion
//! - **Update-Thread Outputs**: sound voices and decals driven after each update
//! - **Headless Backend**: every buffer and draw call recorded for tests and tools
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use particle_batching::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BatchingConfig::default();
//!     let mediums = Arc::new(MediumRegistry::new());
//!     let mut manager = RenderBatchManager::new(
//!         &config,
//!         Box::new(HeadlessBackend::new()),
//!         Arc::new(AssetRegistry::new()),
//!     )?;
//!     manager.setup(mediums);
//!
//!     manager.pre_update(&config);
//!     manager.end_update(&RendererSubView::post_update(1.0));
//!     manager.concurrent_send_render_dynamic_data()?;
//!     manager.draw_calls(RendererSubView::render(RenderPassKind::Main, &[], 1.0))?;
//!     manager.flush()?;
//!     Ok(())
//! }
//! ```

pub mod assets;
pub mod audio;
pub mod config;
pub mod foundation;
pub mod render;
pub mod simulation;

/// Common imports for hosts
pub mod prelude {
    pub use crate::{
        assets::{AssetRegistry, AssetResolver, BlendMode, MaterialAsset, MaterialId},
        audio::{AudioSink, RecordingAudioSink},
        config::{BatchingConfig, BillboardingLocation, Config, FrameSettings, SortMethod},
        render::{
            api::{GraphicsBackend, HeadlessBackend},
            drawers::{DecalSink, RecordingDecalSink, SimpleLight},
            BatchStats, RenderBatchManager, RenderPassKind, RendererSubView, SceneView,
        },
        simulation::{
            DrawRequest, MediumCollection, MediumFrame, MediumId, MediumRegistry, ParticlePage, ParticleStream,
            RendererDecl, RendererKind, StreamToRender,
        },
    };
}

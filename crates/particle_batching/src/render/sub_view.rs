//! Render passes and views
//!
//! A [`RendererSubView`] describes what the render thread is drawing right now:
//! the pass kind, up to [`MAX_VIEWS`] scene views and the billboarding basis of
//! each view.

use crate::foundation::math::{Frustum, Mat4, Vec3};

/// Maximum number of scene views per pass
pub const MAX_VIEWS: usize = 8;

/// Kind of pass being drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderPassKind {
    /// Update-thread pass for audio and decals
    PostUpdate,
    /// Ray-tracing acceleration structure build
    RtAccelStructs,
    /// Main color pass
    Main,
    /// Shadow depth pass
    Shadow,
}

impl RenderPassKind {
    /// Whether the pass runs on the render thread
    pub const fn is_render_pass(self) -> bool {
        !matches!(self, Self::PostUpdate)
    }
}

/// A camera the pass renders from
#[derive(Debug, Clone, PartialEq)]
pub struct SceneView {
    /// World to view transform
    pub view: Mat4,
    /// Projection
    pub projection: Mat4,
    /// Whether the view is drawn this pass
    pub visible: bool,
}

impl SceneView {
    /// Visible view
    pub const fn new(view: Mat4, projection: Mat4) -> Self {
        Self {
            view,
            projection,
            visible: true,
        }
    }

    /// Combined view-projection
    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }

    /// Clip planes of the view
    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(&self.view_projection())
    }
}

/// Camera basis used to orient billboards of one view
#[derive(Debug, Clone, PartialEq)]
pub struct BillboardingView {
    /// Scene view index
    pub view_index: u32,
    /// View to world transform
    pub inv_view: Mat4,
}

impl BillboardingView {
    /// Build the basis of a view matrix
    pub fn new(view_index: u32, view: &Mat4) -> Self {
        Self {
            view_index,
            inv_view: view.try_inverse().unwrap_or_else(Mat4::identity),
        }
    }

    /// Camera right axis in world space
    pub fn right(&self) -> Vec3 {
        self.inv_view.fixed_view::<3, 1>(0, 0).into_owned()
    }

    /// Camera up axis in world space
    pub fn up(&self) -> Vec3 {
        self.inv_view.fixed_view::<3, 1>(0, 1).into_owned()
    }

    /// Direction from the scene toward the camera
    pub fn backward(&self) -> Vec3 {
        self.inv_view.fixed_view::<3, 1>(0, 2).into_owned()
    }

    /// Camera position in world space
    pub fn position(&self) -> Vec3 {
        self.inv_view.fixed_view::<3, 1>(0, 3).into_owned()
    }
}

/// What is being drawn right now
#[derive(Debug, Clone, PartialEq)]
pub struct RendererSubView {
    pass: RenderPassKind,
    global_scale: f32,
    views: Vec<SceneView>,
    bb_views: Vec<BillboardingView>,
}

impl RendererSubView {
    /// Render-thread pass over `views`; only the first [`MAX_VIEWS`] are kept
    pub fn render(pass: RenderPassKind, views: &[SceneView], global_scale: f32) -> Self {
        let views: Vec<SceneView> = views.iter().take(MAX_VIEWS).cloned().collect();
        let bb_views = views
            .iter()
            .enumerate()
            .filter(|(_, view)| view.visible)
            .map(|(i, view)| BillboardingView::new(i as u32, &view.view))
            .collect();
        Self {
            pass,
            global_scale,
            views,
            bb_views,
        }
    }

    /// Update-thread pass without views
    pub const fn post_update(global_scale: f32) -> Self {
        Self {
            pass: RenderPassKind::PostUpdate,
            global_scale,
            views: Vec::new(),
            bb_views: Vec::new(),
        }
    }

    /// Pass kind
    pub const fn pass(&self) -> RenderPassKind {
        self.pass
    }

    /// World scale applied to particle positions and sizes
    pub const fn global_scale(&self) -> f32 {
        self.global_scale
    }

    /// Scene views
    pub fn views(&self) -> &[SceneView] {
        &self.views
    }

    /// Billboarding views of the visible scene views
    pub fn bb_views(&self) -> &[BillboardingView] {
        &self.bb_views
    }

    /// Whether a view index is drawn this pass
    pub fn renders_view(&self, view_index: u32) -> bool {
        self.bb_views.iter().any(|bb| bb.view_index == view_index)
    }
}

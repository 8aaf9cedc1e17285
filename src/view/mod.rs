//! Presentable views
//!
//! A presentable view is the host-visible element bound 1:1 to a client
//! surface: it owns the displayable image, the touch-capture state, a
//! visibility hint, and mirrored client metadata. The host learns about
//! views through exactly-once added/deleted signals drained from the
//! compositor root.
//!
//! Views live in an id-keyed arena. Destruction of the backing surface
//! leaves an inert record (surface cleared, last image retained) that the
//! host may keep querying until it lets go of the id.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use log::debug;

use crate::shell::SurfaceKey;

/// Identifier of a presentable view.
pub type ViewId = u64;

/// Protocol identity of a client buffer, used for rebind memoization.
pub type BufferId = u32;

/// One plane of an imported GPU buffer.
#[derive(Debug)]
pub struct GpuPlane {
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
}

/// Displayable image produced from a client buffer.
///
/// A view holds at most one of these at a time, so a stale image of the
/// other kind can never remain on screen after a kind switch.
#[derive(Debug, Clone)]
pub enum ImageHandle {
    /// Tightly packed RGBA8888 pixels copied out of a shared-memory buffer
    Shm {
        pixels: Arc<Vec<u8>>,
        width: u32,
        height: u32,
    },
    /// GPU buffer planes for the host renderer to import
    Gpu {
        planes: Arc<Vec<GpuPlane>>,
        fourcc: u32,
        modifier: u64,
        width: u32,
        height: u32,
    },
}

impl ImageHandle {
    pub fn size(&self) -> (u32, u32) {
        match self {
            ImageHandle::Shm { width, height, .. } => (*width, *height),
            ImageHandle::Gpu { width, height, .. } => (*width, *height),
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, ImageHandle::Gpu { .. })
    }
}

/// Host-visible lifecycle signals, drained in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewSignal {
    Added(ViewId),
    Deleted(ViewId),
}

/// Touch point currently owned by a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TouchCapture {
    point_id: i32,
}

/// Per-surface view record.
#[derive(Debug)]
pub struct PresentableView {
    pub id: ViewId,
    surface: Option<SurfaceKey>,
    image: Option<ImageHandle>,
    image_generation: u64,
    last_gpu_buffer: Option<BufferId>,
    size: (u32, u32),
    touch: Option<TouchCapture>,
    visible: bool,
    title: String,
    app_id: String,
    pid: Option<i32>,
    added_signalled: bool,
    deleted_signalled: bool,
}

impl PresentableView {
    fn new(id: ViewId, surface: SurfaceKey) -> Self {
        Self {
            id,
            surface: Some(surface),
            image: None,
            image_generation: 0,
            last_gpu_buffer: None,
            size: (0, 0),
            touch: None,
            visible: true,
            title: String::new(),
            app_id: String::new(),
            pid: None,
            added_signalled: false,
            deleted_signalled: false,
        }
    }

    pub fn surface(&self) -> Option<SurfaceKey> {
        self.surface
    }

    pub fn image(&self) -> Option<&ImageHandle> {
        self.image.as_ref()
    }

    /// Bumped every time a new image is constructed; a rebind of the same
    /// GPU buffer leaves it unchanged.
    pub fn image_generation(&self) -> u64 {
        self.image_generation
    }

    pub fn last_gpu_buffer(&self) -> Option<BufferId> {
        self.last_gpu_buffer
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn has_touch_down(&self) -> bool {
        self.touch.is_some()
    }
}

/// Arena of presentable views plus the surface association table.
pub struct ViewManager {
    views: HashMap<ViewId, PresentableView>,
    by_surface: HashMap<SurfaceKey, ViewId>,
    signals: Vec<ViewSignal>,
    next_view_id: ViewId,
}

impl Default for ViewManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewManager {
    pub fn new() -> Self {
        Self {
            views: HashMap::new(),
            by_surface: HashMap::new(),
            signals: Vec::new(),
            next_view_id: 1,
        }
    }

    /// Resolves the view for a surface, creating it lazily on first use.
    /// Creation alone does not emit the added-signal; that waits for the
    /// first successful image bind (`mark_added`).
    pub fn ensure_view(&mut self, surface: SurfaceKey) -> ViewId {
        if let Some(id) = self.by_surface.get(&surface) {
            return *id;
        }
        let id = self.next_view_id;
        self.next_view_id += 1;
        self.views.insert(id, PresentableView::new(id, surface));
        self.by_surface.insert(surface, id);
        debug!("View {} created for surface {}", id, surface);
        id
    }

    /// Emits the added-signal for a view, exactly once over its lifetime.
    pub fn mark_added(&mut self, id: ViewId) {
        if let Some(view) = self.views.get_mut(&id) {
            if !view.added_signalled {
                view.added_signalled = true;
                self.signals.push(ViewSignal::Added(id));
                debug!("View {} announced to host", id);
            }
        }
    }

    /// Tears down the view for a destroyed surface: emits the deleted-signal
    /// (once, and only if the host ever saw the view), clears the surface,
    /// and leaves the inert record queriable.
    pub fn destroy_surface(&mut self, surface: SurfaceKey) -> Option<ViewId> {
        let id = self.by_surface.remove(&surface)?;
        let view = self.views.get_mut(&id)?;
        view.surface = None;
        view.last_gpu_buffer = None;
        if view.added_signalled && !view.deleted_signalled {
            view.deleted_signalled = true;
            self.signals.push(ViewSignal::Deleted(id));
            debug!("View {} removed from host", id);
        }
        Some(id)
    }

    /// Swaps in a freshly constructed image and bumps the generation.
    pub fn set_image(&mut self, id: ViewId, image: ImageHandle) {
        if let Some(view) = self.views.get_mut(&id) {
            view.last_gpu_buffer = match &image {
                ImageHandle::Gpu { .. } => view.last_gpu_buffer,
                ImageHandle::Shm { .. } => None,
            };
            view.image = Some(image);
            view.image_generation += 1;
        }
    }

    /// Records the identity of the GPU buffer backing the current image.
    pub fn set_last_gpu_buffer(&mut self, id: ViewId, buffer: Option<BufferId>) {
        if let Some(view) = self.views.get_mut(&id) {
            view.last_gpu_buffer = buffer;
        }
    }

    /// Clears memoized identity on every view referencing a destroyed
    /// buffer, so a later rebind of a recycled id reconstructs the image.
    pub fn buffer_destroyed(&mut self, buffer: BufferId) {
        for view in self.views.values_mut() {
            if view.last_gpu_buffer == Some(buffer) {
                view.last_gpu_buffer = None;
            }
        }
    }

    /// Updates the view's extent; returns true when it changed.
    pub fn set_size(&mut self, id: ViewId, width: u32, height: u32) -> bool {
        if let Some(view) = self.views.get_mut(&id) {
            if view.size != (width, height) {
                view.size = (width, height);
                return true;
            }
        }
        false
    }

    /// Updates the visibility hint; returns true when it changed.
    pub fn set_visible(&mut self, id: ViewId, visible: bool) -> bool {
        if let Some(view) = self.views.get_mut(&id) {
            if view.visible != visible {
                view.visible = visible;
                return true;
            }
        }
        false
    }

    pub fn set_metadata(
        &mut self,
        surface: SurfaceKey,
        title: Option<&str>,
        app_id: Option<&str>,
        pid: Option<i32>,
    ) {
        if let Some(view) = self
            .by_surface
            .get(&surface)
            .and_then(|id| self.views.get_mut(id))
        {
            if let Some(title) = title {
                view.title = title.to_string();
            }
            if let Some(app_id) = app_id {
                view.app_id = app_id.to_string();
            }
            if pid.is_some() {
                view.pid = pid;
            }
        }
    }

    /// Begins a touch capture. Dropped (false) when the backing surface is
    /// already gone.
    pub fn touch_down(&mut self, id: ViewId, point_id: i32) -> bool {
        match self.views.get_mut(&id) {
            Some(view) if view.surface.is_some() => {
                view.touch = Some(TouchCapture { point_id });
                true
            }
            _ => false,
        }
    }

    /// True only while the same point is captured and the surface is live.
    pub fn touch_matches(&self, id: ViewId, point_id: i32) -> bool {
        self.views
            .get(&id)
            .map(|v| v.surface.is_some() && v.touch == Some(TouchCapture { point_id }))
            .unwrap_or(false)
    }

    /// Ends a touch capture on up. False when the point was never down here
    /// or the surface is gone.
    pub fn touch_up(&mut self, id: ViewId, point_id: i32) -> bool {
        match self.views.get_mut(&id) {
            Some(view)
                if view.surface.is_some() && view.touch == Some(TouchCapture { point_id }) =>
            {
                view.touch = None;
                true
            }
            _ => false,
        }
    }

    /// Cancels a touch capture, exactly once per capture. Succeeds even when
    /// the surface is already gone so host gesture bookkeeping converges;
    /// the captured point id is returned for deregistration.
    pub fn cancel_touch(&mut self, id: ViewId) -> Option<i32> {
        let view = self.views.get_mut(&id)?;
        let capture = view.touch.take()?;
        Some(capture.point_id)
    }

    /// Drains pending added/deleted signals in emission order.
    pub fn take_signals(&mut self) -> Vec<ViewSignal> {
        std::mem::take(&mut self.signals)
    }

    pub fn view(&self, id: ViewId) -> Option<&PresentableView> {
        self.views.get(&id)
    }

    pub fn view_by_surface(&self, surface: SurfaceKey) -> Option<&PresentableView> {
        self.by_surface
            .get(&surface)
            .and_then(|id| self.views.get(id))
    }

    pub fn view_id_for_surface(&self, surface: SurfaceKey) -> Option<ViewId> {
        self.by_surface.get(&surface).copied()
    }

    pub fn surface_for_view(&self, id: ViewId) -> Option<SurfaceKey> {
        self.views.get(&id).and_then(|v| v.surface)
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }
}

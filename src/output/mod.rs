//! Host output and frame synchronization
//!
//! The output side of the compositor is a thin mirror of the host window:
//! one output, one fixed mode derived from the live host size, one primary
//! plane that every visible view lands on. No drawing happens here. Repaint
//! completion is driven by the host's post-render hook, with a single-shot
//! fallback deadline so clients waiting on wl_surface.frame callbacks are
//! never starved when the host skips frames.

use log::{debug, info, trace};
use thiserror::Error;
use wayland_server::protocol::wl_output::Subpixel;

use crate::shell::SurfaceKey;
use crate::view::ViewId;

pub const MAKER: &str = "Alcove";
pub const MODEL: &str = "Alcove";

/// The advertised display mode. Always reported with CURRENT and
/// PREFERRED flags; there is only ever one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputMode {
    pub width: u32,
    pub height: u32,
    pub refresh_mhz: u32,
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output has a single fixed mode")]
    ModeFixed,
}

/// What a repaint request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepaintAction {
    /// A repaint was already pending; the earlier fallback stands.
    AlreadyPending,
    /// Pending flag set; the caller must arm the fallback timer.
    ArmFallback { delay_ms: u64 },
}

/// Backend contract for an output the compositor presents into.
pub trait OutputBackend {
    fn maker(&self) -> &str;
    fn model(&self) -> &str;
    fn subpixel(&self) -> Subpixel;
    fn mode_count(&self) -> usize;
    /// Mode at `index`. Derived from the live size on every call; resize
    /// between calls is visible immediately.
    fn mode(&self, index: usize) -> Option<OutputMode>;
    fn set_mode(&mut self, mode: OutputMode) -> Result<(), OutputError>;
    /// Called once per repaint cycle with every view visible this frame.
    fn assign_planes(&mut self, views: &[ViewId]);
    /// Called once at startup. Must finish the first frame immediately so
    /// the repaint scheduler never waits for a frame that will not come.
    fn start_repaint_loop(&mut self);
    fn repaint(&mut self) -> RepaintAction;
    /// Buffer retention is decided elsewhere; pass-through.
    fn flush_surface(&mut self, surface: SurfaceKey);
}

/// The single host-window output.
#[derive(Debug)]
pub struct HostOutput {
    width: u32,
    height: u32,
    refresh_mhz: u32,
    fallback_ms: u64,
    pending_repaint: bool,
    fallback_armed: bool,
    frames_finished: u64,
    primary_plane: Vec<ViewId>,
}

impl HostOutput {
    pub fn new(width: u32, height: u32, refresh_mhz: u32, fallback_ms: u64) -> Self {
        info!(
            "🖥️  Output online: {}x{} @ {} mHz, fallback {} ms",
            width, height, refresh_mhz, fallback_ms
        );
        Self {
            width,
            height,
            refresh_mhz,
            fallback_ms,
            pending_repaint: false,
            fallback_armed: false,
            frames_finished: 0,
            primary_plane: Vec::new(),
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Host window resized. Views keep their place; only the advertised
    /// mode changes.
    pub fn resize(&mut self, width: u32, height: u32) {
        if (self.width, self.height) == (width, height) {
            return;
        }
        info!("🖥️  Output resized to {}x{}", width, height);
        self.width = width;
        self.height = height;
    }

    pub fn pending_repaint(&self) -> bool {
        self.pending_repaint
    }

    pub fn fallback_armed(&self) -> bool {
        self.fallback_armed
    }

    pub fn frames_finished(&self) -> u64 {
        self.frames_finished
    }

    /// Views assigned to the primary plane by the last `assign_planes`.
    pub fn planned_views(&self) -> &[ViewId] {
        &self.primary_plane
    }

    /// Completes the current frame. Returns true when a fallback timer was
    /// armed and must now be disarmed by the caller.
    pub fn finish_frame(&mut self) -> bool {
        let disarm = self.fallback_armed;
        self.pending_repaint = false;
        self.fallback_armed = false;
        self.frames_finished += 1;
        trace!("Frame {} finished", self.frames_finished);
        disarm
    }

    /// Host post-render hook. Completes a pending repaint; a hook call with
    /// nothing pending is a no-op returning false.
    pub fn frame_rendered(&mut self) -> Option<bool> {
        if !self.pending_repaint {
            return None;
        }
        Some(self.finish_frame())
    }

    /// Fallback deadline hit. Completes the pending repaint if the host
    /// never called back.
    pub fn fallback_fired(&mut self) -> bool {
        self.fallback_armed = false;
        if !self.pending_repaint {
            return false;
        }
        debug!("Repaint fallback fired, finishing frame without the host");
        self.finish_frame();
        true
    }
}

impl OutputBackend for HostOutput {
    fn maker(&self) -> &str {
        MAKER
    }

    fn model(&self) -> &str {
        MODEL
    }

    fn subpixel(&self) -> Subpixel {
        Subpixel::Unknown
    }

    fn mode_count(&self) -> usize {
        1
    }

    fn mode(&self, index: usize) -> Option<OutputMode> {
        if index != 0 {
            debug!("Mode query for nonexistent index {}", index);
            return None;
        }
        Some(OutputMode {
            width: self.width,
            height: self.height,
            refresh_mhz: self.refresh_mhz,
        })
    }

    fn set_mode(&mut self, _mode: OutputMode) -> Result<(), OutputError> {
        Err(OutputError::ModeFixed)
    }

    fn assign_planes(&mut self, views: &[ViewId]) {
        self.primary_plane.clear();
        self.primary_plane.extend_from_slice(views);
        trace!("{} views on the primary plane", self.primary_plane.len());
    }

    fn start_repaint_loop(&mut self) {
        debug!("Repaint loop started");
        self.finish_frame();
    }

    fn repaint(&mut self) -> RepaintAction {
        if self.pending_repaint {
            return RepaintAction::AlreadyPending;
        }
        self.pending_repaint = true;
        self.fallback_armed = true;
        RepaintAction::ArmFallback {
            delay_ms: self.fallback_ms,
        }
    }

    fn flush_surface(&mut self, _surface: SurfaceKey) {}
}

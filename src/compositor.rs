//! Compositor root
//!
//! [`AlcoveCompositor`] is the embedding host's single handle: it owns the
//! display, the listening socket and the event loop, and wires the managers
//! together behind the pumped host-facing API. Nothing here runs on its own
//! thread; the host calls [`AlcoveCompositor::pump`] on socket readiness
//! or once per tick, and [`AlcoveCompositor::frame_rendered`] after its
//! render pass.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, RegistrationToken};
use log::{debug, info, trace};
use parking_lot::RwLock;
use wayland_protocols::wp::linux_dmabuf::zv1::server::zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1;
use wayland_protocols::xdg::shell::server::xdg_wm_base::XdgWmBase;
use wayland_server::protocol::{
    wl_compositor::WlCompositor, wl_output::WlOutput, wl_seat::WlSeat, wl_shm::WlShm,
};
use wayland_server::{Display, ListeningSocket};

use crate::config::AlcoveConfig;
use crate::logging;
use crate::output::{HostOutput, OutputBackend};
use crate::policy::{PolicyRegistry, SubscriberId, Visibility, VisibilityNotice};
use crate::server::{ServerClientData, ServerState};
use crate::shell::{ConfigureCallback, ShellSessionManager};
use crate::view::{ImageHandle, ViewId, ViewManager, ViewSignal};

/// Host-visible lifecycle events, drained via [`AlcoveCompositor::poll_events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlcoveEvent {
    /// A view produced its first presentable image.
    ViewAdded { view: ViewId },
    /// The view's surface is gone; its record is inert but still queriable.
    ViewRemoved { view: ViewId },
}

/// The embedded compositor instance. One per embedding root; several may
/// coexist in one process.
pub struct AlcoveCompositor {
    config: AlcoveConfig,
    display: Display<ServerState>,
    listening: ListeningSocket,
    socket_name: String,
    event_loop: EventLoop<'static, ServerState>,
    fallback_token: Option<RegistrationToken>,
    state: ServerState,
    sessions: Arc<RwLock<ShellSessionManager>>,
    views: Arc<RwLock<ViewManager>>,
    output: Arc<RwLock<HostOutput>>,
    policy: Arc<RwLock<PolicyRegistry>>,
}

impl AlcoveCompositor {
    /// Creates the instance: binds an auto-named wayland socket, registers
    /// the globals, and starts the repaint loop. Fatal setup failures come
    /// back as errors; nothing after this can take the instance down.
    pub fn new(config: AlcoveConfig) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        logging::init(&config.logging)?;

        info!("🚀 Alcove {} starting", crate::VERSION);

        let display: Display<ServerState> =
            Display::new().context("Failed to create wayland display")?;
        let dh = display.handle();
        dh.create_global::<ServerState, WlCompositor, ()>(4, ());
        dh.create_global::<ServerState, WlShm, ()>(1, ());
        dh.create_global::<ServerState, ZwpLinuxDmabufV1, ()>(3, ());
        dh.create_global::<ServerState, WlSeat, ()>(7, ());
        dh.create_global::<ServerState, WlOutput, ()>(3, ());
        dh.create_global::<ServerState, XdgWmBase, ()>(3, ());

        let listening = ListeningSocket::bind_auto("wayland", 1..32)
            .context("Failed to bind a wayland socket")?;
        let socket_name = listening
            .socket_name()
            .and_then(|n| n.to_str())
            .unwrap_or("wayland-0")
            .to_string();
        if config.socket.set_env {
            std::env::set_var("WAYLAND_DISPLAY", &socket_name);
            debug!("Exported WAYLAND_DISPLAY={}", socket_name);
        }

        let sessions = Arc::new(RwLock::new(ShellSessionManager::new()));
        let views = Arc::new(RwLock::new(ViewManager::new()));
        let output = Arc::new(RwLock::new(HostOutput::new(
            config.output.width,
            config.output.height,
            config.output.refresh_mhz,
            config.repaint.fallback_ms,
        )));
        let policy = Arc::new(RwLock::new(PolicyRegistry::new()));

        // The repaint scheduler must never stall waiting for a first frame
        // nobody will produce before the first commit.
        output.write().start_repaint_loop();

        let event_loop: EventLoop<'static, ServerState> =
            EventLoop::try_new().context("Failed to create event loop")?;

        let state = ServerState::new(
            config.input.seat_name.clone(),
            config.input.keycode_offset,
            sessions.clone(),
            views.clone(),
            output.clone(),
            policy.clone(),
        );

        info!("🖼️  Compositor ready on {}", socket_name);

        Ok(Self {
            config,
            display,
            listening,
            socket_name,
            event_loop,
            fallback_token: None,
            state,
            sessions,
            views,
            output,
            policy,
        })
    }

    /// One cooperative pump: accept pending clients, dispatch their
    /// requests, run due timers, drain the internal event bus, flush.
    pub fn pump(&mut self) -> Result<()> {
        while let Some(stream) = self
            .listening
            .accept()
            .context("Listening socket failed")?
        {
            let client = self
                .display
                .handle()
                .insert_client(stream, Arc::new(ServerClientData))
                .context("Failed to insert client")?;
            debug!("🔌 Client connected: {:?}", client.id());
        }

        self.display
            .dispatch_clients(&mut self.state)
            .context("Client dispatch failed")?;
        self.event_loop
            .dispatch(Some(Duration::ZERO), &mut self.state)
            .context("Event loop dispatch failed")?;
        self.state.process_events();

        if self.state.take_fallback_disarm() {
            self.disarm_fallback();
        }
        if let Some(delay_ms) = self.state.take_fallback_arm() {
            self.arm_fallback(delay_ms)?;
        }

        self.display
            .flush_clients()
            .context("Client flush failed")?;
        Ok(())
    }

    /// Pollable fd for readiness-driven hosts: becomes readable when
    /// dispatch work is pending. New connections arrive on [`Self::listen_fd`].
    pub fn connection_fd(&mut self) -> RawFd {
        self.display.backend().poll_fd().as_raw_fd()
    }

    /// Fd of the listening socket; readable when a client is waiting to
    /// connect.
    pub fn listen_fd(&self) -> RawFd {
        self.listening.as_raw_fd()
    }

    /// View lifecycle events in emission order, each exactly once.
    pub fn poll_events(&mut self) -> Vec<AlcoveEvent> {
        self.views
            .write()
            .take_signals()
            .into_iter()
            .map(|signal| match signal {
                ViewSignal::Added(view) => AlcoveEvent::ViewAdded { view },
                ViewSignal::Deleted(view) => AlcoveEvent::ViewRemoved { view },
            })
            .collect()
    }

    /// Host post-render hook: completes a pending repaint and lets waiting
    /// clients draw their next frame.
    pub fn frame_rendered(&mut self) {
        let completed = self.output.write().frame_rendered();
        match completed {
            Some(disarm) => {
                self.state.complete_frame_callbacks();
                if disarm {
                    self.disarm_fallback();
                }
                let _ = self.display.flush_clients();
            }
            None => trace!("frame_rendered with no repaint pending"),
        }
    }

    /// Host resize notification. Updates the advertised mode; mapped views
    /// keep their size until the host reconfigures them.
    pub fn notify_resize(&mut self, width: u32, height: u32) {
        self.output.write().resize(width, height);
        self.state.broadcast_mode();
        let _ = self.display.flush_clients();
    }

    /// Proposes a size to the view's client. The callback (if any) fires
    /// exactly once when the client acknowledges, with the proposed size.
    ///
    /// The callback runs inside [`Self::pump`] while the session table is
    /// borrowed. Hand the result off to the host loop from it; calling back
    /// into the compositor from the callback deadlocks.
    pub fn configure_view(
        &mut self,
        view: ViewId,
        width: u32,
        height: u32,
        callback: Option<ConfigureCallback>,
    ) -> Result<()> {
        let session = self
            .views
            .read()
            .surface_for_view(view)
            .and_then(|key| self.sessions.read().session_id_for_surface(key))
            .ok_or_else(|| anyhow!("view {} has no live session", view))?;
        self.state.send_configure(session, width, height, callback)?;
        self.display
            .flush_clients()
            .context("Client flush failed")?;
        Ok(())
    }

    // View accessors. All stay valid on an inert (destroyed) view until the
    // host drops the id.

    pub fn view_image(&self, view: ViewId) -> Option<ImageHandle> {
        self.views.read().view(view).and_then(|v| v.image().cloned())
    }

    pub fn view_size(&self, view: ViewId) -> Option<(u32, u32)> {
        self.views.read().view(view).map(|v| v.size())
    }

    pub fn view_title(&self, view: ViewId) -> Option<String> {
        self.views.read().view(view).map(|v| v.title().to_string())
    }

    pub fn view_app_id(&self, view: ViewId) -> Option<String> {
        self.views.read().view(view).map(|v| v.app_id().to_string())
    }

    pub fn view_pid(&self, view: ViewId) -> Option<i32> {
        self.views.read().view(view).and_then(|v| v.pid())
    }

    pub fn view_visible(&self, view: ViewId) -> Option<bool> {
        self.views.read().view(view).map(|v| v.is_visible())
    }

    pub fn view_count(&self) -> usize {
        self.views.read().view_count()
    }

    // Visibility policy. Records exist only while subscribed; pushes for an
    // unsubscribed surface fall through to the view hint alone.

    /// Subscribes to visibility changes of a view's surface.
    pub fn subscribe_visibility(&mut self, view: ViewId) -> Option<SubscriberId> {
        let key = self.views.read().surface_for_view(view)?;
        Some(self.policy.write().get_or_ref(key))
    }

    pub fn unsubscribe_visibility(&mut self, view: ViewId, subscriber: SubscriberId) -> bool {
        let Some(key) = self.views.read().surface_for_view(view) else {
            return false;
        };
        self.policy.write().unref(key, subscriber)
    }

    /// Pushes a visibility state for a view. Returns how many subscribers
    /// were notified (zero when deduplicated or unsubscribed).
    pub fn set_visibility(&mut self, view: ViewId, state: Visibility) -> usize {
        let Some(key) = self.views.read().surface_for_view(view) else {
            return 0;
        };
        self.views
            .write()
            .set_visible(view, state != Visibility::FullyObscured);
        self.policy.write().set_visibility(key, state)
    }

    /// Queued visibility notifications, oldest first.
    pub fn take_visibility_notices(&mut self) -> Vec<VisibilityNotice> {
        self.policy.write().take_notifications()
    }

    // Input injection. Coordinates are view-local; timestamps are host
    // milliseconds.

    pub fn touch_down(&mut self, view: ViewId, point: i32, x: f64, y: f64, time_ms: u32) -> bool {
        let handled = self.state.touch_down(view, point, x, y, time_ms);
        if handled {
            let _ = self.display.flush_clients();
        }
        handled
    }

    pub fn touch_motion(&mut self, point: i32, x: f64, y: f64, time_ms: u32) -> bool {
        let handled = self.state.touch_motion(point, x, y, time_ms);
        if handled {
            let _ = self.display.flush_clients();
        }
        handled
    }

    pub fn touch_up(&mut self, point: i32, time_ms: u32) -> bool {
        let handled = self.state.touch_up(point, time_ms);
        if handled {
            let _ = self.display.flush_clients();
        }
        handled
    }

    pub fn cancel_touch(&mut self, view: ViewId) -> bool {
        let handled = self.state.cancel_touch(view);
        if handled {
            let _ = self.display.flush_clients();
        }
        handled
    }

    pub fn forward_key(&mut self, keycode: u32, pressed: bool, time_ms: u32) -> bool {
        let handled = self.state.forward_key(keycode, pressed, time_ms);
        if handled {
            let _ = self.display.flush_clients();
        }
        handled
    }

    pub fn set_key_focus(&mut self, view: Option<ViewId>) {
        self.state.set_key_focus(view);
        let _ = self.display.flush_clients();
    }

    pub fn key_focus(&self) -> Option<ViewId> {
        self.state.key_focused_view()
    }

    /// Name of the bound socket (e.g. `wayland-1`).
    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    pub fn config(&self) -> &AlcoveConfig {
        &self.config
    }

    fn arm_fallback(&mut self, delay_ms: u64) -> Result<()> {
        self.disarm_fallback();
        let timer = Timer::from_duration(Duration::from_millis(delay_ms));
        let token = self
            .event_loop
            .handle()
            .insert_source(timer, |_deadline, _, state: &mut ServerState| {
                debug!("⏲️  Repaint fallback fired");
                if state.output.write().fallback_fired() {
                    state.complete_frame_callbacks();
                }
                TimeoutAction::Drop
            })
            .map_err(|e| anyhow!("Failed to arm the repaint fallback: {}", e))?;
        self.fallback_token = Some(token);
        Ok(())
    }

    fn disarm_fallback(&mut self) {
        if let Some(token) = self.fallback_token.take() {
            self.event_loop.handle().remove(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AlcoveConfig {
        let mut config = AlcoveConfig::default();
        config.socket.set_env = false;
        config
    }

    #[test]
    fn test_socket_comes_up_with_auto_name() {
        let runtime_dir = tempfile::tempdir().unwrap();
        std::env::set_var("XDG_RUNTIME_DIR", runtime_dir.path());

        let compositor = AlcoveCompositor::new(test_config()).unwrap();
        assert!(compositor.socket_name().starts_with("wayland-"));
        assert!(compositor.listen_fd() >= 0);
    }

    #[test]
    fn test_pump_runs_without_clients() {
        let runtime_dir = tempfile::tempdir().unwrap();
        std::env::set_var("XDG_RUNTIME_DIR", runtime_dir.path());

        let mut compositor = AlcoveCompositor::new(test_config()).unwrap();
        compositor.pump().unwrap();
        assert!(compositor.poll_events().is_empty());
        assert_eq!(compositor.view_count(), 0);
    }

    #[test]
    fn test_resize_updates_the_advertised_mode() {
        let runtime_dir = tempfile::tempdir().unwrap();
        std::env::set_var("XDG_RUNTIME_DIR", runtime_dir.path());

        let mut compositor = AlcoveCompositor::new(test_config()).unwrap();
        compositor.notify_resize(1920, 1080);
        assert_eq!(compositor.output.read().size(), (1920, 1080));
    }
}

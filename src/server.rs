//! Wayland server state and protocol dispatch
//!
//! Owns every bound protocol resource and translates client requests into
//! manager operations. Dispatch handlers stay thin: anything that mutates
//! session or view state is pushed onto an internal event bus and drained
//! by [`ServerState::process_events`] between dispatch rounds, so protocol
//! callbacks never re-enter the managers mid-request.
//!
//! Globals advertised: wl_compositor, wl_shm, zwp_linux_dmabuf_v1 (v3),
//! wl_seat, wl_output and xdg_wm_base.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsFd, OwnedFd};
#[cfg(target_os = "linux")]
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};
use std::sync::Arc;

use log::{debug, trace, warn};
use memmap2::Mmap;
use parking_lot::RwLock;
use wayland_protocols::wp::linux_dmabuf::zv1::server::{
    zwp_linux_buffer_params_v1, zwp_linux_dmabuf_v1,
};
use wayland_protocols::xdg::shell::server::{
    xdg_popup, xdg_positioner, xdg_surface, xdg_toplevel, xdg_wm_base,
};
use wayland_server::{
    backend::{ClientData, ClientId},
    protocol::{
        wl_buffer, wl_callback, wl_compositor, wl_keyboard, wl_output, wl_pointer, wl_region,
        wl_seat, wl_shm, wl_shm_pool, wl_surface, wl_touch,
    },
    Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource,
};

use crate::input::{KeyFocus, TouchRegistry};
use crate::output::{HostOutput, OutputBackend, RepaintAction};
use crate::policy::PolicyRegistry;
use crate::presenter::{self, BufferRecord, BufferSource, DmabufPlane};
use crate::shell::{
    ClientCreds, ClientKey, ConfigureCallback, SessionError, SessionId, ShellSessionManager,
    SurfaceKey,
};
use crate::view::{ViewId, ViewManager};

const DRM_FORMAT_XRGB8888: u32 = 0x34325258;
const DRM_FORMAT_ARGB8888: u32 = 0x34325241;
const DRM_FORMAT_XBGR8888: u32 = 0x34324258;
const DRM_FORMAT_ABGR8888: u32 = 0x34324241;
const DRM_FORMAT_NV12: u32 = 0x3231564E;
const DRM_MOD_LINEAR: u64 = 0;

/// Minimal keymap shipped to clients. Key events carry raw evdev codes;
/// layout interpretation is the client's business.
const DEFAULT_KEYMAP: &str = "xkb_keymap {
    xkb_keycodes  { minimum = 8; maximum = 255; };
    xkb_types     { };
    xkb_compat    { };
    xkb_symbols   { };
};
";

/// One client surface with its shell role resources.
pub struct SurfaceEntry {
    pub key: SurfaceKey,
    pub wl_surface: wl_surface::WlSurface,
    pub xdg_surface: Option<xdg_surface::XdgSurface>,
    pub xdg_toplevel: Option<xdg_toplevel::XdgToplevel>,
    pub xdg_popup: Option<xdg_popup::XdgPopup>,
    pub pending_buffer_id: Option<u32>,
}

/// A buffer record plus the wire handle its releases go out on.
pub(crate) struct TrackedBuffer {
    pub(crate) record: BufferRecord,
    pub(crate) buffer: wl_buffer::WlBuffer,
}

/// Shared mapping of one wl_shm pool. `None` when the client fd could not
/// be mapped; buffers cut from such a pool are simply never presentable.
struct ShmPoolData {
    map: Option<Arc<Mmap>>,
}

/// Plane staging area for one zwp_linux_buffer_params_v1.
#[derive(Default)]
struct DmabufParamsData {
    // (fd, offset, stride, modifier_hi, modifier_lo, plane_idx)
    planes: std::sync::Mutex<Vec<(OwnedFd, u32, u32, u32, u32, u32)>>,
}

// Internal event bus messages produced by dispatch and drained between
// dispatch rounds.
#[derive(Debug, Clone)]
enum ServerEvent {
    Commit { surface: wl_surface::WlSurface },
    Destroy { surface: wl_surface::WlSurface },
    TitleChanged { surface: wl_surface::WlSurface, title: String },
    AppIdChanged { surface: wl_surface::WlSurface, app_id: String },
    ClientGone { client: ClientKey },
}

/// Protocol-facing state. The compositor root owns one of these and pumps
/// it; manager handles are shared with the root.
pub struct ServerState {
    seat_name: String,
    serial_counter: u32,
    next_surface_key: SurfaceKey,
    next_client_key: ClientKey,
    client_keys: HashMap<ClientId, ClientKey>,
    surfaces: Vec<SurfaceEntry>,
    buffers: HashMap<u32, TrackedBuffer>,
    pending_callbacks: Vec<wl_callback::WlCallback>,
    keyboards: Vec<wl_keyboard::WlKeyboard>,
    touches: Vec<wl_touch::WlTouch>,
    bound_outputs: Vec<wl_output::WlOutput>,
    dmabuf_formats: Vec<(u32, u64)>,
    events: Vec<ServerEvent>,
    touch_points: TouchRegistry,
    key_focus: KeyFocus,
    // Directives for the pump: arm or disarm the repaint fallback timer
    fallback_arm: Option<u64>,
    fallback_disarm: bool,
    pub(crate) sessions: Arc<RwLock<ShellSessionManager>>,
    pub(crate) views: Arc<RwLock<ViewManager>>,
    pub(crate) output: Arc<RwLock<HostOutput>>,
    pub(crate) policy: Arc<RwLock<PolicyRegistry>>,
}

impl ServerState {
    pub fn new(
        seat_name: String,
        keycode_offset: u32,
        sessions: Arc<RwLock<ShellSessionManager>>,
        views: Arc<RwLock<ViewManager>>,
        output: Arc<RwLock<HostOutput>>,
        policy: Arc<RwLock<PolicyRegistry>>,
    ) -> Self {
        Self {
            seat_name,
            serial_counter: 0,
            next_surface_key: 0,
            next_client_key: 0,
            client_keys: HashMap::new(),
            surfaces: Vec::new(),
            buffers: HashMap::new(),
            pending_callbacks: Vec::new(),
            keyboards: Vec::new(),
            touches: Vec::new(),
            bound_outputs: Vec::new(),
            dmabuf_formats: vec![
                (DRM_FORMAT_XRGB8888, DRM_MOD_LINEAR),
                (DRM_FORMAT_ARGB8888, DRM_MOD_LINEAR),
                (DRM_FORMAT_XBGR8888, DRM_MOD_LINEAR),
                (DRM_FORMAT_ABGR8888, DRM_MOD_LINEAR),
                (DRM_FORMAT_NV12, DRM_MOD_LINEAR),
            ],
            events: Vec::new(),
            touch_points: TouchRegistry::new(),
            key_focus: KeyFocus::new(keycode_offset),
            fallback_arm: None,
            fallback_disarm: false,
            sessions,
            views,
            output,
            policy,
        }
    }

    fn next_serial(&mut self) -> u32 {
        let s = self.serial_counter;
        self.serial_counter = self.serial_counter.wrapping_add(1);
        s
    }

    fn now_ms() -> u32 {
        (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            & 0xFFFF_FFFF) as u32
    }

    fn client_key(&mut self, client: &Client) -> ClientKey {
        let id = client.id();
        if let Some(key) = self.client_keys.get(&id) {
            return *key;
        }
        self.next_client_key += 1;
        self.client_keys.insert(id, self.next_client_key);
        self.next_client_key
    }

    fn entry_for_surface(&self, surface: &wl_surface::WlSurface) -> Option<&SurfaceEntry> {
        self.surfaces.iter().find(|e| &e.wl_surface == surface)
    }

    fn entry_for_key(&self, key: SurfaceKey) -> Option<&SurfaceEntry> {
        self.surfaces.iter().find(|e| e.key == key)
    }

    /// Directive accessors for the pump.
    pub(crate) fn take_fallback_arm(&mut self) -> Option<u64> {
        self.fallback_arm.take()
    }

    pub(crate) fn take_fallback_disarm(&mut self) -> bool {
        std::mem::take(&mut self.fallback_disarm)
    }

    /// Completes every queued wl_surface.frame callback with the current
    /// timestamp.
    pub(crate) fn complete_frame_callbacks(&mut self) {
        if self.pending_callbacks.is_empty() {
            return;
        }
        let now = Self::now_ms();
        for cb in std::mem::take(&mut self.pending_callbacks) {
            cb.done(now);
        }
    }

    /// Finishes the current frame: wire callbacks complete and the output's
    /// pending/fallback state clears.
    pub(crate) fn finish_frame(&mut self) {
        if self.output.write().finish_frame() {
            self.fallback_disarm = true;
        }
        self.complete_frame_callbacks();
    }

    /// Drains the event bus. Called once per pump after client dispatch.
    pub fn process_events(&mut self) {
        let mut events = Vec::new();
        events.append(&mut self.events);

        for ev in events {
            match ev {
                ServerEvent::Commit { surface } => self.handle_commit(&surface),
                ServerEvent::Destroy { surface } => self.handle_destroy(&surface),
                ServerEvent::TitleChanged { surface, title } => {
                    if let Some(entry) = self.entry_for_surface(&surface) {
                        let key = entry.key;
                        self.sessions.write().set_title(key, title.clone());
                        self.views
                            .write()
                            .set_metadata(key, Some(&title), None, None);
                    }
                }
                ServerEvent::AppIdChanged { surface, app_id } => {
                    if let Some(entry) = self.entry_for_surface(&surface) {
                        let key = entry.key;
                        self.sessions.write().set_app_id(key, app_id.clone());
                        self.views
                            .write()
                            .set_metadata(key, None, Some(&app_id), None);
                    }
                }
                ServerEvent::ClientGone { client } => {
                    let torn_down = self.sessions.write().disconnect_client(client);
                    if !torn_down.is_empty() {
                        debug!(
                            "Client {} gone, {} sessions torn down",
                            client,
                            torn_down.len()
                        );
                    }
                }
            }
        }
    }

    fn handle_commit(&mut self, surface: &wl_surface::WlSurface) {
        let Some(entry) = self.entry_for_surface(surface) else {
            return;
        };
        let key = entry.key;

        let outcome = self.sessions.write().commit(key);
        if outcome == crate::shell::CommitOutcome::Ignored {
            // Surface without a shell role; nothing to present.
            trace!("Commit on roleless surface {}", key);
            return;
        }

        let (width, height) = self.attach_surface(key);
        if width == 0 && height == 0 {
            debug!("Surface {} commit carried no presentable buffer", key);
        }
        // The frame is finished only after the bind attempt completed.
        self.finish_frame();
        self.schedule_repaint();
    }

    /// Resolves the surface's view, binds the committed buffer and writes
    /// the resulting size back. (0, 0) reports bind failure.
    fn attach_surface(&mut self, key: SurfaceKey) -> (u32, u32) {
        let Some(entry) = self.entry_for_key(key) else {
            return (0, 0);
        };
        let pending = entry.pending_buffer_id;

        let mut views = self.views.write();
        let view_id = views.ensure_view(key);
        let record = pending
            .and_then(|id| self.buffers.get(&id))
            .map(|t| &t.record);

        match presenter::bind_buffer(&mut views, view_id, record) {
            Ok(outcome) => {
                let (title, app_id, pid) = {
                    let sessions = self.sessions.read();
                    match sessions.session_by_surface(key) {
                        Some(s) => (s.title().to_string(), s.app_id().to_string(), s.pid()),
                        None => (String::new(), String::new(), None),
                    }
                };
                views.set_metadata(key, Some(&title), Some(&app_id), pid);
                views.mark_added(view_id);
                drop(views);
                for id in outcome.release {
                    if let Some(tracked) = self.buffers.get(&id) {
                        tracked.buffer.release();
                    }
                }
                self.output.write().flush_surface(key);
                (outcome.width, outcome.height)
            }
            Err(err) => {
                debug!("Buffer rejected for surface {}: {}", key, err);
                (0, 0)
            }
        }
    }

    fn schedule_repaint(&mut self) {
        let planes: Vec<ViewId> = {
            let sessions = self.sessions.read();
            let views = self.views.read();
            sessions
                .mapped_sessions()
                .into_iter()
                .filter_map(|sid| sessions.session(sid).and_then(|s| s.surface()))
                .filter_map(|key| views.view_id_for_surface(key))
                .filter(|vid| {
                    views
                        .view(*vid)
                        .map(|v| v.is_visible() && v.image().is_some())
                        .unwrap_or(false)
                })
                .collect()
        };
        let mut output = self.output.write();
        output.assign_planes(&planes);
        if let RepaintAction::ArmFallback { delay_ms } = output.repaint() {
            self.fallback_arm = Some(delay_ms);
        }
    }

    fn handle_destroy(&mut self, surface: &wl_surface::WlSurface) {
        let Some(idx) = self.surfaces.iter().position(|e| &e.wl_surface == surface) else {
            return;
        };
        let entry = self.surfaces.remove(idx);
        let key = entry.key;

        let mut views = self.views.write();
        if let Some(view_id) = views.view_id_for_surface(key) {
            // Give a held GPU buffer back before the view record goes inert.
            if let Some(held) = views.view(view_id).and_then(|v| v.last_gpu_buffer()) {
                if let Some(tracked) = self.buffers.get(&held) {
                    tracked.buffer.release();
                }
            }
            self.key_focus.clear_if_focused(view_id);
        }
        views.destroy_surface(key);
        drop(views);

        self.sessions.write().destroy_surface(key);
        self.policy.write().surface_destroyed(key);
        debug!("Surface {} torn down", key);
    }

    /// Sends a configure for a session: xdg_toplevel.configure with the
    /// proposed size plus the activated state, then xdg_surface.configure
    /// with the handshake serial.
    pub fn send_configure(
        &mut self,
        session: SessionId,
        width: u32,
        height: u32,
        callback: Option<ConfigureCallback>,
    ) -> Result<(), SessionError> {
        let pending = self
            .sessions
            .write()
            .configure(session, width, height, callback)?;
        let key = self
            .sessions
            .read()
            .session(session)
            .and_then(|s| s.surface())
            .ok_or(SessionError::SurfaceGone(session))?;
        if let Some(entry) = self.entry_for_key(key) {
            if let (Some(toplevel), Some(xdg)) = (&entry.xdg_toplevel, &entry.xdg_surface) {
                let states: Vec<u8> = (xdg_toplevel::State::Activated as u32)
                    .to_ne_bytes()
                    .to_vec();
                toplevel.configure(width as i32, height as i32, states);
                xdg.configure(pending.serial);
            } else if let (Some(popup), Some(xdg)) = (&entry.xdg_popup, &entry.xdg_surface) {
                popup.configure(0, 0, width as i32, height as i32);
                xdg.configure(pending.serial);
            }
        }
        Ok(())
    }

    /// Rebroadcasts the current mode to every bound wl_output after a host
    /// resize.
    pub fn broadcast_mode(&mut self) {
        let Some(mode) = self.output.read().mode(0) else {
            return;
        };
        for out in &self.bound_outputs {
            out.mode(
                wl_output::Mode::Current | wl_output::Mode::Preferred,
                mode.width as i32,
                mode.height as i32,
                mode.refresh_mhz as i32,
            );
            if out.version() >= 2 {
                out.done();
            }
        }
    }

    fn touches_for_client(&self, surface: &wl_surface::WlSurface) -> Vec<&wl_touch::WlTouch> {
        let client = surface.client().map(|c| c.id());
        self.touches
            .iter()
            .filter(|t| t.client().map(|c| c.id()) == client)
            .collect()
    }

    fn keyboards_for_client(
        &self,
        surface: &wl_surface::WlSurface,
    ) -> Vec<&wl_keyboard::WlKeyboard> {
        let client = surface.client().map(|c| c.id());
        self.keyboards
            .iter()
            .filter(|k| k.client().map(|c| c.id()) == client)
            .collect()
    }

    /// Injects a touch down on a view. Spurious points and dead surfaces
    /// are dropped.
    pub fn touch_down(&mut self, view: ViewId, point: i32, x: f64, y: f64, time_ms: u32) -> bool {
        if self.touch_points.route(point).is_some() {
            debug!("Touch point {} already down, dropping", point);
            return false;
        }
        if !self.views.write().touch_down(view, point) {
            return false;
        }
        self.touch_points.register(point, view);

        let Some(key) = self.views.read().surface_for_view(view) else {
            return false;
        };
        let Some(entry) = self.entry_for_key(key) else {
            return false;
        };
        let wl_surface = entry.wl_surface.clone();
        let serial = self.next_serial();
        for touch in self.touches_for_client(&wl_surface) {
            touch.down(serial, time_ms, &wl_surface, point, x, y);
            touch.frame();
        }
        true
    }

    /// Forwards motion for a registered point; unregistered points are
    /// spurious and dropped.
    pub fn touch_motion(&mut self, point: i32, x: f64, y: f64, time_ms: u32) -> bool {
        let Some(view) = self.touch_points.route(point) else {
            return false;
        };
        if !self.views.read().touch_matches(view, point) {
            // Surface died under the capture; swallow the event.
            return false;
        }
        let Some(key) = self.views.read().surface_for_view(view) else {
            return false;
        };
        let Some(entry) = self.entry_for_key(key) else {
            return false;
        };
        let wl_surface = entry.wl_surface.clone();
        for touch in self.touches_for_client(&wl_surface) {
            touch.motion(time_ms, point, x, y);
            touch.frame();
        }
        true
    }

    pub fn touch_up(&mut self, point: i32, time_ms: u32) -> bool {
        let Some(view) = self.touch_points.deregister(point) else {
            return false;
        };
        if !self.views.write().touch_up(view, point) {
            return false;
        }
        let Some(key) = self.views.read().surface_for_view(view) else {
            return false;
        };
        let Some(entry) = self.entry_for_key(key) else {
            return false;
        };
        let wl_surface = entry.wl_surface.clone();
        let serial = self.next_serial();
        for touch in self.touches_for_client(&wl_surface) {
            touch.up(serial, time_ms, point);
            touch.frame();
        }
        true
    }

    /// Cancels a view's captured touch. Reports true exactly once per
    /// capture, even when the surface is already gone.
    pub fn cancel_touch(&mut self, view: ViewId) -> bool {
        let Some(point) = self.views.write().cancel_touch(view) else {
            return false;
        };
        self.touch_points.deregister(point);

        let surface = self
            .views
            .read()
            .surface_for_view(view)
            .and_then(|key| self.entry_for_key(key).map(|e| e.wl_surface.clone()));
        if let Some(wl_surface) = surface {
            for touch in self.touches_for_client(&wl_surface) {
                touch.cancel();
            }
        }
        true
    }

    /// Forwards a host key event to the focused view's client, translating
    /// the host keycode to the evdev code clients expect.
    pub fn forward_key(&mut self, keycode: u32, pressed: bool, time_ms: u32) -> bool {
        let Some(view) = self.key_focus.focused() else {
            return false;
        };
        let Some(code) = self.key_focus.translate(keycode) else {
            trace!("Keycode {} below the translation offset, dropped", keycode);
            return false;
        };
        let Some(key) = self.views.read().surface_for_view(view) else {
            return false;
        };
        let Some(entry) = self.entry_for_key(key) else {
            return false;
        };
        let wl_surface = entry.wl_surface.clone();
        let serial = self.next_serial();
        let state = if pressed {
            wl_keyboard::KeyState::Pressed
        } else {
            wl_keyboard::KeyState::Released
        };
        for kb in self.keyboards_for_client(&wl_surface) {
            kb.key(serial, time_ms, code, state);
        }
        true
    }

    /// Host-assigned key focus, with wl_keyboard enter/leave bookkeeping.
    pub fn set_key_focus(&mut self, view: Option<ViewId>) {
        let Some(change) = self.key_focus.set_focus(view) else {
            return;
        };
        if let Some(leaving) = change.leave {
            let surface = self
                .views
                .read()
                .surface_for_view(leaving)
                .and_then(|key| self.entry_for_key(key).map(|e| e.wl_surface.clone()));
            if let Some(wl_surface) = surface {
                let serial = self.next_serial();
                for kb in self.keyboards_for_client(&wl_surface) {
                    kb.leave(serial, &wl_surface);
                }
            }
        }
        if let Some(entering) = change.enter {
            let surface = self
                .views
                .read()
                .surface_for_view(entering)
                .and_then(|key| self.entry_for_key(key).map(|e| e.wl_surface.clone()));
            if let Some(wl_surface) = surface {
                let serial = self.next_serial();
                for kb in self.keyboards_for_client(&wl_surface) {
                    kb.enter(serial, &wl_surface, Vec::new());
                }
            }
        }
    }

    pub fn key_focused_view(&self) -> Option<ViewId> {
        self.key_focus.focused()
    }
}

/// Per-client connection data. Cleanup rides on resource destruction
/// hooks, so nothing is needed here.
pub struct ServerClientData;
impl ClientData for ServerClientData {}

// wl_compositor global

impl GlobalDispatch<wl_compositor::WlCompositor, ()> for ServerState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_compositor::WlCompositor>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl Dispatch<wl_compositor::WlCompositor, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_compositor::WlCompositor,
        request: wl_compositor::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_compositor::Request::CreateSurface { id } => {
                let surface = data_init.init(id, ());
                state.next_surface_key += 1;
                let key = state.next_surface_key;
                state.surfaces.push(SurfaceEntry {
                    key,
                    wl_surface: surface,
                    xdg_surface: None,
                    xdg_toplevel: None,
                    xdg_popup: None,
                    pending_buffer_id: None,
                });
                trace!("Surface {} created", key);
            }
            wl_compositor::Request::CreateRegion { id } => {
                data_init.init(id, ());
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_region::WlRegion, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_region::WlRegion,
        _request: wl_region::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }
}

// wl_surface

impl Dispatch<wl_surface::WlSurface, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_surface::WlSurface,
        request: wl_surface::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_surface::Request::Attach { buffer, .. } => {
                // Attach offsets are ignored; the host scene graph owns
                // placement.
                if let Some(entry) = state
                    .surfaces
                    .iter_mut()
                    .find(|e| &e.wl_surface == resource)
                {
                    entry.pending_buffer_id = buffer.as_ref().map(|b| b.id().protocol_id());
                }
            }
            wl_surface::Request::Commit => {
                state.events.push(ServerEvent::Commit {
                    surface: resource.clone(),
                });
            }
            wl_surface::Request::Destroy => {
                state.events.push(ServerEvent::Destroy {
                    surface: resource.clone(),
                });
            }
            wl_surface::Request::Frame { callback } => {
                let cb: wl_callback::WlCallback = data_init.init(callback, ());
                state.pending_callbacks.push(cb);
            }
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        resource: &wl_surface::WlSurface,
        _data: &(),
    ) {
        // Covers client disconnects that never sent an explicit destroy.
        state.events.push(ServerEvent::Destroy {
            surface: resource.clone(),
        });
    }
}

impl Dispatch<wl_callback::WlCallback, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_callback::WlCallback,
        _request: wl_callback::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }
}

// wl_shm global

impl GlobalDispatch<wl_shm::WlShm, ()> for ServerState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_shm::WlShm>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        let shm = data_init.init(resource, ());
        shm.format(wl_shm::Format::Argb8888);
        shm.format(wl_shm::Format::Xrgb8888);
        shm.format(wl_shm::Format::Abgr8888);
        shm.format(wl_shm::Format::Xbgr8888);
    }
}

impl Dispatch<wl_shm::WlShm, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_shm::WlShm,
        request: wl_shm::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_shm::Request::CreatePool { id, fd, size } = request {
            let file: File = fd.into();
            let map = match unsafe { Mmap::map(&file) } {
                Ok(map) => Some(Arc::new(map)),
                Err(err) => {
                    warn!("Failed to map shm pool ({} bytes): {}", size, err);
                    None
                }
            };
            data_init.init(id, ShmPoolData { map });
        }
    }
}

impl Dispatch<wl_shm_pool::WlShmPool, ShmPoolData> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_shm_pool::WlShmPool,
        request: wl_shm_pool::Request,
        data: &ShmPoolData,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_shm_pool::Request::CreateBuffer {
                id,
                offset,
                width,
                height,
                stride,
                format,
            } => {
                let buf = data_init.init(id, ());
                let Some(map) = data.map.clone() else {
                    debug!("Buffer from an unmapped pool, never presentable");
                    return;
                };
                let record = BufferRecord {
                    id: buf.id().protocol_id(),
                    width,
                    height,
                    source: BufferSource::Shm {
                        map,
                        stride,
                        offset,
                        format,
                    },
                };
                state.buffers.insert(
                    record.id,
                    TrackedBuffer {
                        record,
                        buffer: buf,
                    },
                );
            }
            wl_shm_pool::Request::Resize { .. } => {
                // The original pool mapping stays; growth is not supported.
            }
            wl_shm_pool::Request::Destroy => {}
            _ => {}
        }
    }
}

impl Dispatch<wl_buffer::WlBuffer, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_buffer::WlBuffer,
        request: wl_buffer::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_buffer::Request::Destroy = request {
            let id = resource.id().protocol_id();
            state.buffers.remove(&id);
            // Drop memoized identities so a recycled id can never alias.
            state.views.write().buffer_destroyed(id);
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        resource: &wl_buffer::WlBuffer,
        _data: &(),
    ) {
        // Covers buffers reaped by a client disconnect.
        let id = resource.id().protocol_id();
        state.buffers.remove(&id);
        state.views.write().buffer_destroyed(id);
    }
}

// zwp_linux_dmabuf_v1 global (v3, linear modifier only)

impl GlobalDispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, ()> for ServerState {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        let dmabuf = data_init.init(resource, ());
        let ver = dmabuf.version();
        for (fmt, modifier) in &state.dmabuf_formats {
            if ver >= 3 {
                let hi = (modifier >> 32) as u32;
                let lo = (*modifier & 0xFFFF_FFFF) as u32;
                dmabuf.modifier(*fmt, hi, lo);
            } else {
                dmabuf.format(*fmt);
            }
        }
    }
}

impl Dispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
        request: zwp_linux_dmabuf_v1::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            zwp_linux_dmabuf_v1::Request::CreateParams { params_id } => {
                data_init.init(params_id, DmabufParamsData::default());
            }
            zwp_linux_dmabuf_v1::Request::Destroy => {}
            _ => {}
        }
    }
}

/// Validates staged planes against the declared format. The host consumes
/// linear layouts only.
fn collect_dmabuf_planes(
    staged: &mut Vec<(OwnedFd, u32, u32, u32, u32, u32)>,
    format: u32,
) -> Option<Vec<DmabufPlane>> {
    for &(_, _, _, mhi, mlo, _) in staged.iter() {
        if mhi != 0 || mlo != 0 {
            return None;
        }
    }
    staged.sort_by_key(|p| p.5);
    let expected = match format {
        DRM_FORMAT_XRGB8888 | DRM_FORMAT_ARGB8888 | DRM_FORMAT_XBGR8888 | DRM_FORMAT_ABGR8888 => 1,
        DRM_FORMAT_NV12 => 2,
        _ => return None,
    };
    if staged.len() != expected {
        return None;
    }
    let mut planes = Vec::with_capacity(expected);
    for (idx, (fd, offset, stride, _mhi, _mlo, plane_idx)) in staged.drain(..).enumerate() {
        if plane_idx as usize != idx {
            return None;
        }
        planes.push(DmabufPlane { fd, offset, stride });
    }
    Some(planes)
}

impl Dispatch<zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1, DmabufParamsData>
    for ServerState
{
    fn request(
        state: &mut Self,
        client: &Client,
        resource: &zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1,
        request: zwp_linux_buffer_params_v1::Request,
        data: &DmabufParamsData,
        dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            zwp_linux_buffer_params_v1::Request::Add {
                fd,
                plane_idx,
                offset,
                stride,
                modifier_hi,
                modifier_lo,
            } => {
                if let Ok(mut planes) = data.planes.lock() {
                    planes.push((fd, offset, stride, modifier_hi, modifier_lo, plane_idx));
                }
            }
            zwp_linux_buffer_params_v1::Request::CreateImmed {
                buffer_id,
                width,
                height,
                format,
                flags: _,
            } => {
                // The buffer object exists either way; an import that fails
                // validation just never becomes presentable.
                let buf = data_init.init(buffer_id, ());
                let mut staged = match data.planes.lock() {
                    Ok(mut guard) => guard.drain(..).collect::<Vec<_>>(),
                    Err(_) => Vec::new(),
                };
                let Some(planes) = collect_dmabuf_planes(&mut staged, format) else {
                    warn!("Rejected dmabuf import (format {:#010x})", format);
                    return;
                };
                let record = BufferRecord {
                    id: buf.id().protocol_id(),
                    width,
                    height,
                    source: BufferSource::Dmabuf {
                        planes,
                        fourcc: format,
                        modifier: DRM_MOD_LINEAR,
                    },
                };
                state.buffers.insert(
                    record.id,
                    TrackedBuffer {
                        record,
                        buffer: buf,
                    },
                );
            }
            zwp_linux_buffer_params_v1::Request::Create {
                width,
                height,
                format,
                flags: _,
            } => {
                let mut staged = match data.planes.lock() {
                    Ok(mut guard) => guard.drain(..).collect::<Vec<_>>(),
                    Err(_) => Vec::new(),
                };
                let Some(planes) = collect_dmabuf_planes(&mut staged, format) else {
                    resource.failed();
                    return;
                };
                let buf = match client.create_resource::<wl_buffer::WlBuffer, (), ServerState>(
                    dhandle,
                    1,
                    (),
                ) {
                    Ok(b) => b,
                    Err(_) => {
                        resource.failed();
                        return;
                    }
                };
                let record = BufferRecord {
                    id: buf.id().protocol_id(),
                    width,
                    height,
                    source: BufferSource::Dmabuf {
                        planes,
                        fourcc: format,
                        modifier: DRM_MOD_LINEAR,
                    },
                };
                state.buffers.insert(
                    record.id,
                    TrackedBuffer {
                        record,
                        buffer: buf.clone(),
                    },
                );
                resource.created(&buf);
            }
            zwp_linux_buffer_params_v1::Request::Destroy => {}
            _ => {}
        }
    }
}

// wl_seat global

impl GlobalDispatch<wl_seat::WlSeat, ()> for ServerState {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_seat::WlSeat>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        let seat = data_init.init(resource, ());
        seat.capabilities(wl_seat::Capability::Touch | wl_seat::Capability::Keyboard);
        if seat.version() >= 2 {
            seat.name(state.seat_name.clone());
        }
    }
}

impl Dispatch<wl_seat::WlSeat, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_seat::WlSeat,
        request: wl_seat::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_seat::Request::GetTouch { id } => {
                let touch = data_init.init(id, ());
                state.touches.push(touch);
            }
            wl_seat::Request::GetKeyboard { id } => {
                let kb = data_init.init(id, ());
                match create_memfd_and_write(DEFAULT_KEYMAP) {
                    Ok(fd) => {
                        kb.keymap(
                            wl_keyboard::KeymapFormat::XkbV1,
                            fd.as_fd(),
                            DEFAULT_KEYMAP.len() as u32,
                        );
                    }
                    Err(err) => warn!("Keymap delivery failed: {}", err),
                }
                if kb.version() >= 4 {
                    kb.repeat_info(25, 600);
                }
                state.keyboards.push(kb);
            }
            wl_seat::Request::GetPointer { id } => {
                // No pointer capability is advertised; init and ignore.
                let _ = data_init.init(id, ());
            }
            wl_seat::Request::Release => {}
            _ => {}
        }
    }
}

impl Dispatch<wl_keyboard::WlKeyboard, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_keyboard::WlKeyboard,
        request: wl_keyboard::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_keyboard::Request::Release = request {
            state.keyboards.retain(|k| k != resource);
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        resource: &wl_keyboard::WlKeyboard,
        _data: &(),
    ) {
        state.keyboards.retain(|k| k != resource);
    }
}

impl Dispatch<wl_touch::WlTouch, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_touch::WlTouch,
        request: wl_touch::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_touch::Request::Release = request {
            state.touches.retain(|t| t != resource);
        }
    }

    fn destroyed(state: &mut Self, _client: ClientId, resource: &wl_touch::WlTouch, _data: &()) {
        state.touches.retain(|t| t != resource);
    }
}

impl Dispatch<wl_pointer::WlPointer, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_pointer::WlPointer,
        _request: wl_pointer::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }
}

// wl_output global

impl GlobalDispatch<wl_output::WlOutput, ()> for ServerState {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_output::WlOutput>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        let wl_out = data_init.init(resource, ());
        let (maker, model, subpixel, mode) = {
            let out = state.output.read();
            (
                out.maker().to_string(),
                out.model().to_string(),
                out.subpixel(),
                out.mode(0),
            )
        };
        wl_out.geometry(
            0,
            0,
            0,
            0,
            subpixel,
            maker,
            model,
            wl_output::Transform::Normal,
        );
        if let Some(mode) = mode {
            wl_out.mode(
                wl_output::Mode::Current | wl_output::Mode::Preferred,
                mode.width as i32,
                mode.height as i32,
                mode.refresh_mhz as i32,
            );
        }
        if wl_out.version() >= 2 {
            wl_out.scale(1);
            wl_out.done();
        }
        state.bound_outputs.push(wl_out);
    }
}

impl Dispatch<wl_output::WlOutput, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_output::WlOutput,
        request: wl_output::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_output::Request::Release = request {
            state.bound_outputs.retain(|o| o != resource);
        }
    }

    fn destroyed(state: &mut Self, _client: ClientId, resource: &wl_output::WlOutput, _data: &()) {
        state.bound_outputs.retain(|o| o != resource);
    }
}

// xdg_wm_base global

impl GlobalDispatch<xdg_wm_base::XdgWmBase, ()> for ServerState {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        client: &Client,
        resource: New<xdg_wm_base::XdgWmBase>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        let client_key = state.client_key(client);
        data_init.init(resource, client_key);
        let session = state.sessions.write().bind_client(client_key);
        debug!("Client {} bound the shell as session {}", client_key, session);
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, ClientKey> for ServerState {
    fn request(
        state: &mut Self,
        client: &Client,
        resource: &xdg_wm_base::XdgWmBase,
        request: xdg_wm_base::Request,
        data: &ClientKey,
        dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_wm_base::Request::GetXdgSurface { id, surface } => {
                let xdg = data_init.init(id, ());
                let Some(entry) = state
                    .surfaces
                    .iter_mut()
                    .find(|e| e.wl_surface == surface)
                else {
                    resource.post_error(
                        xdg_wm_base::Error::InvalidSurfaceState,
                        "unknown wl_surface",
                    );
                    return;
                };
                let key = entry.key;
                entry.xdg_surface = Some(xdg);
                match state.sessions.write().request_surface(*data, key) {
                    Ok(session) => {
                        if let Ok(creds) = client.get_credentials(dhandle) {
                            state.sessions.write().set_creds(
                                session,
                                ClientCreds {
                                    pid: creds.pid,
                                    uid: creds.uid,
                                    gid: creds.gid,
                                },
                            );
                        }
                        debug!("Session {} requested surface {}", session, key);
                    }
                    Err(err) => {
                        // Roll back: the protocol error tears the client and
                        // its half-created resources down.
                        warn!("Surface request rejected: {}", err);
                        resource.post_error(xdg_wm_base::Error::Role, err.to_string());
                    }
                }
            }
            xdg_wm_base::Request::CreatePositioner { id } => {
                data_init.init(id, ());
            }
            xdg_wm_base::Request::Pong { .. } => {}
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &xdg_wm_base::XdgWmBase,
        data: &ClientKey,
    ) {
        state.events.push(ServerEvent::ClientGone { client: *data });
    }
}

impl Dispatch<xdg_positioner::XdgPositioner, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &xdg_positioner::XdgPositioner,
        _request: xdg_positioner::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        // The host scene graph owns placement; positioner hints are unused.
    }
}

impl Dispatch<xdg_surface::XdgSurface, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &xdg_surface::XdgSurface,
        request: xdg_surface::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_surface::Request::GetToplevel { id } => {
                let toplevel = data_init.init(id, ());
                let session = {
                    let Some(entry) = state
                        .surfaces
                        .iter_mut()
                        .find(|e| e.xdg_surface.as_ref() == Some(resource))
                    else {
                        return;
                    };
                    entry.xdg_toplevel = Some(toplevel);
                    state.sessions.read().session_id_for_surface(entry.key)
                };
                // Initial configure: zero size lets the client choose.
                if let Some(session) = session {
                    if let Err(err) = state.send_configure(session, 0, 0, None) {
                        warn!("Initial configure for session {} failed: {}", session, err);
                    }
                }
            }
            xdg_surface::Request::GetPopup { id, .. } => {
                let popup = data_init.init(id, ());
                let session = {
                    let Some(entry) = state
                        .surfaces
                        .iter_mut()
                        .find(|e| e.xdg_surface.as_ref() == Some(resource))
                    else {
                        return;
                    };
                    entry.xdg_popup = Some(popup);
                    state.sessions.read().session_id_for_surface(entry.key)
                };
                if let Some(session) = session {
                    if let Err(err) = state.send_configure(session, 0, 0, None) {
                        warn!("Popup configure for session {} failed: {}", session, err);
                    }
                }
            }
            xdg_surface::Request::AckConfigure { serial } => {
                let key = state
                    .surfaces
                    .iter()
                    .find(|e| e.xdg_surface.as_ref() == Some(resource))
                    .map(|e| e.key);
                if let Some(key) = key {
                    state.sessions.write().ack_configure(key, serial);
                }
            }
            xdg_surface::Request::SetWindowGeometry { .. } => {}
            xdg_surface::Request::Destroy => {}
            _ => {}
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &xdg_toplevel::XdgToplevel,
        request: xdg_toplevel::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_toplevel::Request::SetTitle { title } => {
                if let Some(entry) = state
                    .surfaces
                    .iter()
                    .find(|e| e.xdg_toplevel.as_ref() == Some(resource))
                {
                    state.events.push(ServerEvent::TitleChanged {
                        surface: entry.wl_surface.clone(),
                        title,
                    });
                }
            }
            xdg_toplevel::Request::SetAppId { app_id } => {
                if let Some(entry) = state
                    .surfaces
                    .iter()
                    .find(|e| e.xdg_toplevel.as_ref() == Some(resource))
                {
                    state.events.push(ServerEvent::AppIdChanged {
                        surface: entry.wl_surface.clone(),
                        app_id,
                    });
                }
            }
            xdg_toplevel::Request::Destroy => {
                if let Some(entry) = state
                    .surfaces
                    .iter()
                    .find(|e| e.xdg_toplevel.as_ref() == Some(resource))
                {
                    state.events.push(ServerEvent::Destroy {
                        surface: entry.wl_surface.clone(),
                    });
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<xdg_popup::XdgPopup, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &xdg_popup::XdgPopup,
        request: xdg_popup::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let xdg_popup::Request::Destroy = request {
            if let Some(entry) = state
                .surfaces
                .iter()
                .find(|e| e.xdg_popup.as_ref() == Some(resource))
            {
                state.events.push(ServerEvent::Destroy {
                    surface: entry.wl_surface.clone(),
                });
            }
        }
    }
}

/// Sealed, anonymous fd carrying the keymap text. Clients mmap it
/// read-only, so the contents must never change under them.
#[cfg(target_os = "linux")]
fn create_memfd_and_write(data: &str) -> std::io::Result<OwnedFd> {
    let raw = unsafe {
        libc::memfd_create(
            c"alcove-keymap".as_ptr(),
            libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING,
        )
    };
    if raw < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let mut file = unsafe { File::from_raw_fd(raw) };
    file.write_all(data.as_bytes())?;
    let fd = unsafe { OwnedFd::from_raw_fd(file.into_raw_fd()) };
    let seals = libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE | libc::F_SEAL_SEAL;
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_ADD_SEALS, seals) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}

#[cfg(not(target_os = "linux"))]
fn create_memfd_and_write(data: &str) -> std::io::Result<OwnedFd> {
    let path = std::env::temp_dir().join(format!("alcove-keymap-{}", std::process::id()));
    let mut file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    file.write_all(data.as_bytes())?;
    let _ = std::fs::remove_file(&path);
    Ok(file.into())
}

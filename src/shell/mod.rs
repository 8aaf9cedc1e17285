//! Shell surface sessions
//!
//! Implements the window-negotiation side of the embedded server as an
//! explicit state machine. Each client toplevel is tracked by a
//! [`ShellSession`] walking `Unbound → SurfaceRequested → Configuring →
//! Mapped → Destroyed`, and the configure/ack-configure handshake carries an
//! at-most-once completion callback that fires only after the client's ack.
//!
//! Sessions are an id-keyed arena. Surface destruction is delivered as an
//! event that looks the session up by its surface key and marks it torn
//! down; nothing here holds live resource handles.

use std::collections::HashMap;

use log::{debug, warn};
use thiserror::Error;

/// Stable key for a client surface, allocated by the server arena.
pub type SurfaceKey = u64;

/// Identifier of a shell session.
pub type SessionId = u64;

/// Key grouping sessions by the client connection that owns them.
pub type ClientKey = u64;

/// Callback invoked once the client acknowledges a configure.
pub type ConfigureCallback = Box<dyn FnOnce(u32, u32) + Send>;

/// Errors raised by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("surface {0} is already bound to a session")]
    SurfaceAlreadyBound(SurfaceKey),
    #[error("session {0} has no live surface")]
    SurfaceGone(SessionId),
}

/// Lifecycle states of a shell surface session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Shell binding exists but no surface was requested yet
    Unbound,
    /// Surface requested and bound; no configure sent so far
    SurfaceRequested,
    /// At least one configure is in flight
    Configuring,
    /// First commit observed; the view is mapped
    Mapped,
    /// Surface destroyed; the session is inert
    Destroyed,
}

/// A configure awaiting the client's acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingConfigure {
    pub serial: u32,
    pub width: u32,
    pub height: u32,
}

/// Client credentials captured from the socket at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCreds {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Per-toplevel session record.
#[derive(Debug)]
pub struct ShellSession {
    pub id: SessionId,
    pub client: ClientKey,
    pub state: SessionState,
    surface: Option<SurfaceKey>,
    title: String,
    app_id: String,
    creds: Option<ClientCreds>,
    pending: Option<PendingConfigure>,
    acked: bool,
    last_acked_serial: Option<u32>,
}

impl ShellSession {
    fn new(id: SessionId, client: ClientKey) -> Self {
        Self {
            id,
            client,
            state: SessionState::Unbound,
            surface: None,
            title: String::new(),
            app_id: String::new(),
            creds: None,
            pending: None,
            acked: false,
            last_acked_serial: None,
        }
    }

    pub fn surface(&self) -> Option<SurfaceKey> {
        self.surface
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn pid(&self) -> Option<i32> {
        self.creds.map(|c| c.pid)
    }

    pub fn creds(&self) -> Option<ClientCreds> {
        self.creds
    }

    /// Last configure sent and not yet superseded.
    pub fn pending_configure(&self) -> Option<PendingConfigure> {
        self.pending
    }

    pub fn is_acked(&self) -> bool {
        self.acked
    }

    pub fn last_acked_serial(&self) -> Option<u32> {
        self.last_acked_serial
    }

    pub fn is_mapped(&self) -> bool {
        self.state == SessionState::Mapped
    }
}

/// Outcome of a surface commit notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// First commit; the session just mapped
    Mapped,
    /// Session was already mapped; nothing to do for the lifecycle
    AlreadyMapped,
    /// No live session for this surface
    Ignored,
}

/// Arena of shell sessions plus the surface association table.
///
/// Completion callbacks are stored beside the arena so session records stay
/// plain data; a callback is removed (and dropped uninvoked) the moment its
/// session is torn down.
pub struct ShellSessionManager {
    sessions: HashMap<SessionId, ShellSession>,
    by_surface: HashMap<SurfaceKey, SessionId>,
    callbacks: HashMap<SessionId, ConfigureCallback>,
    next_session_id: SessionId,
    configure_serial: u32,
}

impl Default for ShellSessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellSessionManager {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            by_surface: HashMap::new(),
            callbacks: HashMap::new(),
            next_session_id: 1,
            configure_serial: 0,
        }
    }

    /// Creates an unbound session for a client that bound the shell global.
    pub fn bind_client(&mut self, client: ClientKey) -> SessionId {
        let id = self.next_session_id;
        self.next_session_id += 1;
        self.sessions.insert(id, ShellSession::new(id, client));
        debug!("Shell session {} created for client {}", id, client);
        id
    }

    /// Attaches a surface to a session, entering `SurfaceRequested`.
    ///
    /// Reuses the client's unbound session if one exists; otherwise a fresh
    /// session is allocated so one client can own several toplevels. Fails
    /// when the surface already belongs to another session.
    pub fn request_surface(
        &mut self,
        client: ClientKey,
        surface: SurfaceKey,
    ) -> Result<SessionId, SessionError> {
        if self.by_surface.contains_key(&surface) {
            return Err(SessionError::SurfaceAlreadyBound(surface));
        }

        let id = self
            .sessions
            .values()
            .find(|s| s.client == client && s.state == SessionState::Unbound)
            .map(|s| s.id)
            .unwrap_or_else(|| self.bind_client(client));

        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?;
        session.surface = Some(surface);
        session.state = SessionState::SurfaceRequested;
        self.by_surface.insert(surface, id);
        debug!("Session {} bound surface {}", id, surface);
        Ok(id)
    }

    /// Sends a configure: assigns a fresh serial, records the proposed size,
    /// resets the ack flag, and stores the completion callback (replacing any
    /// unfired one from a superseded configure).
    ///
    /// The caller is responsible for emitting the matching wire events with
    /// the returned serial. Configuring a destroyed session fails: there is
    /// nothing left to send to.
    pub fn configure(
        &mut self,
        id: SessionId,
        width: u32,
        height: u32,
        callback: Option<ConfigureCallback>,
    ) -> Result<PendingConfigure, SessionError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?;
        if session.state == SessionState::Destroyed || session.surface.is_none() {
            return Err(SessionError::SurfaceGone(id));
        }

        self.configure_serial = self.configure_serial.wrapping_add(1);
        let pending = PendingConfigure {
            serial: self.configure_serial,
            width,
            height,
        };
        session.pending = Some(pending);
        session.acked = false;
        if session.state == SessionState::SurfaceRequested {
            session.state = SessionState::Configuring;
        }

        match callback {
            Some(cb) => {
                self.callbacks.insert(id, cb);
            }
            None => {
                self.callbacks.remove(&id);
            }
        }

        debug!(
            "Session {} configure {}x{} serial {}",
            id, width, height, pending.serial
        );
        Ok(pending)
    }

    /// Handles the client's ack_configure.
    ///
    /// Sets the ack flag and fires the stored callback exactly once with the
    /// size of the most recent configure. Acks without a pending configure,
    /// or repeated acks, are safe no-ops for the callback.
    pub fn ack_configure(&mut self, surface: SurfaceKey, serial: u32) -> Option<(u32, u32)> {
        let id = *self.by_surface.get(&surface)?;
        let session = self.sessions.get_mut(&id)?;
        let pending = match session.pending {
            Some(p) => p,
            None => {
                debug!("Session {} ack serial {} with no pending configure", id, serial);
                return None;
            }
        };

        session.acked = true;
        session.last_acked_serial = Some(serial);
        if serial != pending.serial {
            // Stale ack for a superseded configure; the callback waits for
            // the latest one.
            debug!(
                "Session {} acked stale serial {} (latest {})",
                id, serial, pending.serial
            );
            return None;
        }

        if let Some(cb) = self.callbacks.remove(&id) {
            debug!(
                "Session {} ack serial {}; completing at {}x{}",
                id, serial, pending.width, pending.height
            );
            cb(pending.width, pending.height);
            return Some((pending.width, pending.height));
        }
        None
    }

    /// Handles a surface commit. The first commit while unmapped maps the
    /// session; later commits leave the lifecycle untouched.
    pub fn commit(&mut self, surface: SurfaceKey) -> CommitOutcome {
        let id = match self.by_surface.get(&surface) {
            Some(id) => *id,
            None => return CommitOutcome::Ignored,
        };
        let session = match self.sessions.get_mut(&id) {
            Some(s) => s,
            None => return CommitOutcome::Ignored,
        };
        match session.state {
            SessionState::SurfaceRequested | SessionState::Configuring => {
                session.state = SessionState::Mapped;
                debug!("Session {} mapped on first commit", id);
                CommitOutcome::Mapped
            }
            SessionState::Mapped => CommitOutcome::AlreadyMapped,
            SessionState::Unbound | SessionState::Destroyed => CommitOutcome::Ignored,
        }
    }

    /// Tears a session down after its surface was destroyed.
    ///
    /// The surface association is removed first so no further notification
    /// can reach the session, then the pending callback is dropped uninvoked
    /// and the metadata cleared. The inert record stays queriable.
    pub fn destroy_surface(&mut self, surface: SurfaceKey) -> Option<SessionId> {
        let id = self.by_surface.remove(&surface)?;
        self.callbacks.remove(&id);
        let session = self.sessions.get_mut(&id)?;
        session.pending = None;
        session.acked = false;
        session.title.clear();
        session.app_id.clear();
        session.surface = None;
        session.state = SessionState::Destroyed;
        debug!("Session {} destroyed with surface {}", id, surface);
        Some(id)
    }

    /// Tears down every session owned by a disconnecting client.
    pub fn disconnect_client(&mut self, client: ClientKey) -> Vec<SessionId> {
        let surfaces: Vec<SurfaceKey> = self
            .sessions
            .values()
            .filter(|s| s.client == client)
            .filter_map(|s| s.surface)
            .collect();
        let mut destroyed = Vec::with_capacity(surfaces.len());
        for surface in surfaces {
            if let Some(id) = self.destroy_surface(surface) {
                destroyed.push(id);
            }
        }
        // Unbound sessions have nothing to tear down; drop the records.
        self.sessions
            .retain(|_, s| !(s.client == client && s.state == SessionState::Unbound));
        if !destroyed.is_empty() {
            debug!("Client {} disconnect tore down {} sessions", client, destroyed.len());
        }
        destroyed
    }

    pub fn set_title(&mut self, surface: SurfaceKey, title: String) -> Option<SessionId> {
        let id = *self.by_surface.get(&surface)?;
        let session = self.sessions.get_mut(&id)?;
        session.title = title;
        Some(id)
    }

    pub fn set_app_id(&mut self, surface: SurfaceKey, app_id: String) -> Option<SessionId> {
        let id = *self.by_surface.get(&surface)?;
        let session = self.sessions.get_mut(&id)?;
        session.app_id = app_id;
        Some(id)
    }

    pub fn set_creds(&mut self, id: SessionId, creds: ClientCreds) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.creds = Some(creds);
        } else {
            warn!("Credentials for unknown session {}", id);
        }
    }

    pub fn session(&self, id: SessionId) -> Option<&ShellSession> {
        self.sessions.get(&id)
    }

    pub fn session_by_surface(&self, surface: SurfaceKey) -> Option<&ShellSession> {
        self.by_surface
            .get(&surface)
            .and_then(|id| self.sessions.get(id))
    }

    pub fn session_id_for_surface(&self, surface: SurfaceKey) -> Option<SessionId> {
        self.by_surface.get(&surface).copied()
    }

    /// Sessions that are currently mapped, for plane assignment.
    pub fn mapped_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.state == SessionState::Mapped)
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn live_session_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state != SessionState::Destroyed)
            .count()
    }
}


#[cfg(test)]
mod property_tests;

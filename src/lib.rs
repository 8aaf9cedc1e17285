//! # Alcove Embedded Wayland Compositor Library
//!
//! Alcove runs a nested Wayland server inside a host application and exposes
//! each client window as a presentable view the host's scene graph can place,
//! resize, and deliver input to.
//!
//! ## Architecture
//!
//! Alcove is built on a modular architecture:
//! - `compositor`: compositor root, host-facing pump and event API
//! - `server`: Wayland globals and protocol dispatch
//! - `shell`: xdg-shell session state machine (configure/ack handshake)
//! - `view`: presentable views bound 1:1 to client surfaces
//! - `presenter`: client buffer classification and image binding
//! - `output`: output backend contract and frame synchronization
//! - `input`: touch point registry and key forwarding
//! - `policy`: per-surface visibility side table
//! - `config`: configuration parsing and management
//!
//! ## Usage
//!
//! ```rust,no_run
//! use alcove::{AlcoveCompositor, AlcoveConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = AlcoveConfig::default();
//!     let mut compositor = AlcoveCompositor::new(config)?;
//!     // Pump from the host's tick or fd-readiness callback.
//!     compositor.pump()?;
//!     for event in compositor.poll_events() {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod compositor;
pub mod config;
pub mod input;
pub mod logging;
pub mod output;
pub mod policy;
pub mod presenter;
pub mod server;
pub mod shell;
pub mod view;

// Re-export main types for easy access
pub use compositor::{AlcoveCompositor, AlcoveEvent};
pub use config::AlcoveConfig;
pub use shell::ShellSessionManager;
pub use view::{ImageHandle, ViewId, ViewManager};

// Re-export common error types
pub use anyhow::{Context, Error, Result};

/// Version information for Alcove
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
pub const BUILD_DATE: &str = env!("ALCOVE_BUILD_DATE");
pub const GIT_COMMIT: &str = env!("ALCOVE_GIT_COMMIT");

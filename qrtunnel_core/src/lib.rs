//! Share local files through a public tunnel.
//!
//! A session validates the files into a [`manifest::Manifest`], serves them on
//! a loopback HTTP server and exposes that server through a reverse tunnel.
//! Front-ends drive it with [`session::run_session`] and watch [`AppEvent`]s.

pub mod archive;
pub mod config;
pub mod error;
pub mod http_share;
pub mod manifest;
pub mod session;
pub mod tunnel;

pub use archive::{Archive, ArchiveBuilder};
pub use config::ShareConfig;
pub use error::{ArchiveError, Result, ShareError, exit_code};
pub use manifest::{Manifest, ManifestEntry, format_size};
pub use session::{SessionContext, run_session};
pub use tunnel::{SshTunnelLauncher, TunnelLauncher, check_tunnel_binary};

/// Progress reports from a session to the front-end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    Status(String),

    /// Local server is accepting connections
    HttpServerStarted {
        port: u16,
    },

    /// Public URL is live and can be shown to the user
    ShareUrlReady {
        url: String,
    },

    TunnelClosed,
    Error(String),
}

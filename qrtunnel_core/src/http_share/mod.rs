//! HTTP file sharing module
//!
//! Serves the session's files to browsers through the tunnel.

pub mod page;
pub mod server;

pub use server::{ARCHIVE_ROUTE, FileServer, ServerPhase, ShareState, create_router};

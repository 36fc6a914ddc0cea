//! Error taxonomy for a sharing session.

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Process exit codes, one per failure category.
pub mod exit_code {
    pub const OK: u8 = 0;
    pub const OTHER: u8 = 1;
    pub const INVALID_INPUT: u8 = 2;
    pub const PORT_UNAVAILABLE: u8 = 3;
    pub const TUNNEL_FAILURE: u8 = 4;
    pub const SERVER_FAILURE: u8 = 5;
}

/// Archive build failure. Cloneable so every waiter gets the same result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ArchiveError(pub String);

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("invalid path '{}': {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error("could not bind local port {port}: {source}")]
    PortInUse {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("tunnel process could not start: {0}")]
    TunnelStart(String),

    #[error("tunnel did not report a URL in time ({}s){}", timeout.as_secs(), format_diagnostic(diagnostic))]
    TunnelTimeout {
        timeout: Duration,
        diagnostic: String,
    },

    #[error("tunnel exited unexpectedly ({status}){}", format_diagnostic(diagnostic))]
    TunnelExit { status: String, diagnostic: String },

    #[error("archive unavailable: {0}")]
    Archive(#[from] ArchiveError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("local file server failed: {0}")]
    Server(String),

    #[error("configuration error: {0}")]
    Config(String),
}

fn format_diagnostic(diagnostic: &str) -> String {
    if diagnostic.trim().is_empty() {
        String::new()
    } else {
        format!("\n\ntunnel output:\n{}", diagnostic)
    }
}

impl ShareError {
    /// Exit code for the failure category.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidPath { .. } => exit_code::INVALID_INPUT,
            Self::PortInUse { .. } => exit_code::PORT_UNAVAILABLE,
            Self::TunnelStart(_) | Self::TunnelTimeout { .. } | Self::TunnelExit { .. } => {
                exit_code::TUNNEL_FAILURE
            }
            Self::Archive(_) | Self::NotFound(_) | Self::Server(_) => exit_code::SERVER_FAILURE,
            Self::Config(_) => exit_code::OTHER,
        }
    }

    /// HTTP status for request-scoped errors.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ShareError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        let body = match self {
            Self::NotFound(_) => crate::http_share::page::not_found_page(),
            _ => crate::http_share::page::error_page("Something went wrong while preparing the download."),
        };
        (status, Html(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ShareError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_messages_are_distinct() {
        let port = ShareError::PortInUse {
            port: 8000,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        let start = ShareError::TunnelStart("ssh: not found".to_string());
        let timeout = ShareError::TunnelTimeout {
            timeout: Duration::from_secs(35),
            diagnostic: String::new(),
        };
        let exit = ShareError::TunnelExit {
            status: "exit status: 255".to_string(),
            diagnostic: String::new(),
        };

        assert!(port.to_string().starts_with("could not bind local port"));
        assert!(start.to_string().starts_with("tunnel process could not start"));
        assert!(timeout.to_string().starts_with("tunnel did not report a URL in time"));
        assert!(exit.to_string().starts_with("tunnel exited unexpectedly"));
    }

    #[test]
    fn test_exit_codes_per_category() {
        let invalid = ShareError::InvalidPath {
            path: PathBuf::from("missing.txt"),
            reason: "not found".to_string(),
        };
        assert_eq!(invalid.exit_code(), exit_code::INVALID_INPUT);
        assert_eq!(
            ShareError::TunnelStart(String::new()).exit_code(),
            exit_code::TUNNEL_FAILURE
        );
        assert_eq!(
            ShareError::Server("boom".to_string()).exit_code(),
            exit_code::SERVER_FAILURE
        );
    }

    #[test]
    fn test_diagnostic_is_appended() {
        let err = ShareError::TunnelExit {
            status: "exit status: 255".to_string(),
            diagnostic: "Permission denied (publickey).".to_string(),
        };
        assert!(err.to_string().contains("Permission denied (publickey)."));
    }
}

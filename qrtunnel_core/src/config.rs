use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ShareError};

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "qrtunnel";
const APP_NAME: &str = "qrtunnel";
const CONFIG_FILE: &str = "config.json";

/// Overrides the config directory (used by tests).
pub const CONFIG_DIR_ENV: &str = "QRTUNNEL_CONFIG_DIR";
pub const PORT_ENV: &str = "QRTUNNEL_PORT";
pub const TUNNEL_TIMEOUT_ENV: &str = "QRTUNNEL_TUNNEL_TIMEOUT_SECS";
pub const SSH_BIN_ENV: &str = "QRTUNNEL_SSH_BIN";

/// Placeholder substituted with the local port in tunnel arguments
pub const PORT_PLACEHOLDER: &str = "{port}";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks an ephemeral port
    pub port: u16,
    pub shutdown_grace_secs: u64,
    pub archive_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            shutdown_grace_secs: 3,
            archive_name: "files.zip".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TunnelConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Public URLs must be served under this domain
    pub provider_domain: String,
    pub url_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Case-insensitive substrings that mean the tunnel was refused
    pub fatal_patterns: Vec<String>,
    /// How many trailing output lines to keep for error reports
    pub diagnostic_lines: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            args: [
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "ServerAliveInterval=60",
                "-o",
                "ServerAliveCountMax=3",
                "-o",
                "ExitOnForwardFailure=yes",
                "-o",
                "ConnectTimeout=15",
                "-T",
                "-R",
                "80:localhost:{port}",
                "nokey@localhost.run",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            provider_domain: "lhr.life".to_string(),
            url_timeout_secs: 35,
            shutdown_grace_secs: 5,
            fatal_patterns: [
                "permission denied",
                "could not resolve hostname",
                "connection refused",
                "connection timed out",
                "no route to host",
                "host key verification failed",
                "remote port forwarding failed",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            diagnostic_lines: 20,
        }
    }
}

impl TunnelConfig {
    /// Tunnel arguments with the local port filled in.
    pub fn args_for_port(&self, local_port: u16) -> Vec<String> {
        let port = local_port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }

    pub fn url_timeout(&self) -> Duration {
        Duration::from_secs(self.url_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShareConfig {
    pub server: ServerConfig,
    pub tunnel: TunnelConfig,
}

impl ShareConfig {
    /// Get the config file path
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(test_path) = std::env::var(CONFIG_DIR_ENV) {
            return Some(PathBuf::from(test_path).join(CONFIG_FILE));
        }

        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load config from the default location, or defaults when absent or unreadable
    pub fn load() -> Self {
        let path = match Self::default_path() {
            Some(p) => p,
            None => return Self::default(),
        };

        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed config {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Load an explicitly requested config file; unlike `load`, failures are errors
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ShareError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| ShareError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Apply `QRTUNNEL_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup(PORT_ENV) {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| ShareError::Config(format!("{PORT_ENV}: invalid port '{port}'")))?;
        }
        if let Some(secs) = lookup(TUNNEL_TIMEOUT_ENV) {
            self.tunnel.url_timeout_secs = secs.trim().parse().map_err(|_| {
                ShareError::Config(format!("{TUNNEL_TIMEOUT_ENV}: invalid seconds '{secs}'"))
            })?;
        }
        if let Some(program) = lookup(SSH_BIN_ENV) {
            if !program.trim().is_empty() {
                self.tunnel.program = program;
            }
        }
        Ok(())
    }

    /// Reject values that would make a session unable to start.
    pub fn validate(&self) -> Result<()> {
        if self.tunnel.program.trim().is_empty() {
            return Err(ShareError::Config("tunnel.program is empty".to_string()));
        }
        if !self.tunnel.args.iter().any(|a| a.contains(PORT_PLACEHOLDER)) {
            return Err(ShareError::Config(format!(
                "tunnel.args must reference the local port as {PORT_PLACEHOLDER}"
            )));
        }
        if self.tunnel.url_timeout_secs == 0 {
            return Err(ShareError::Config(
                "tunnel.url_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.server.archive_name.trim().is_empty() || self.server.archive_name.contains('/') {
            return Err(ShareError::Config(format!(
                "server.archive_name '{}' is not a plain file name",
                self.server.archive_name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_args_substitute_port() {
        let config = TunnelConfig::default();
        let args = config.args_for_port(41234);
        assert!(args.contains(&"80:localhost:41234".to_string()));
        assert!(!args.iter().any(|a| a.contains(PORT_PLACEHOLDER)));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ShareConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{"tunnel":{"url_timeout_secs":10}}"#;
        let config: ShareConfig = serde_json::from_str(json).expect("Should deserialize");
        assert_eq!(config.tunnel.url_timeout_secs, 10);
        assert_eq!(config.tunnel.program, "ssh");
        assert_eq!(config.server, ServerConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (PORT_ENV, "8123"),
            (TUNNEL_TIMEOUT_ENV, "12"),
            (SSH_BIN_ENV, "/usr/local/bin/ssh"),
        ]
        .into_iter()
        .collect();

        let mut config = ShareConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .expect("overrides should apply");

        assert_eq!(config.server.port, 8123);
        assert_eq!(config.tunnel.url_timeout_secs, 12);
        assert_eq!(config.tunnel.program, "/usr/local/bin/ssh");
    }

    #[test]
    fn test_invalid_env_port_is_rejected() {
        let mut config = ShareConfig::default();
        let result = config.apply_overrides(|k| (k == PORT_ENV).then(|| "http".to_string()));
        assert!(matches!(result, Err(ShareError::Config(_))));
    }

    #[test]
    fn test_args_without_port_are_rejected() {
        let mut config = ShareConfig::default();
        config.tunnel.args = vec!["nokey@localhost.run".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_missing_file_fails() {
        let result = ShareConfig::load_from(Path::new("/definitely/not/here/config.json"));
        assert!(matches!(result, Err(ShareError::Config(_))));
    }
}

use clap::Parser;
use std::path::PathBuf;

use qrtunnel_core::ShareConfig;

/// Share local files through a temporary public URL and a QR code.
#[derive(Parser, Debug)]
#[command(name = "qrtunnel", version, about)]
pub struct Args {
    /// Files to share. Opens a file picker when omitted.
    pub paths: Vec<PathBuf>,

    /// Local port for the file server (0 picks a free one)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Seconds to wait for the tunnel URL
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Read configuration from this file instead of the default location
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "QRTUNNEL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Print the URL only, without the QR code
    #[arg(long)]
    pub no_qr: bool,

    /// File name offered for the "download all" archive
    #[arg(long, value_name = "NAME")]
    pub archive_name: Option<String>,
}

impl Args {
    /// Command-line flags win over the config file and environment.
    pub fn apply_to(&self, config: &mut ShareConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(secs) = self.timeout {
            config.tunnel.url_timeout_secs = secs;
        }
        if let Some(name) = &self.archive_name {
            config.server.archive_name = name.clone();
        }
    }
}

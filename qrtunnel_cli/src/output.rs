//! Terminal output: startup banner and the share block with the QR code.

use anyhow::{Context, Result};
use qrcode::QrCode;
use qrcode::render::unicode;

use qrtunnel_core::{Manifest, format_size};

const SEPARATOR: &str = "============================================================";

pub fn generate_qr(url: &str) -> Result<String> {
    let code = QrCode::new(url.as_bytes()).context("Failed to generate QR code")?;

    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}

/// Files being shared and their total size
pub fn banner(manifest: &Manifest) -> String {
    let mut out = format!("Sharing {} file(s):\n", manifest.len());
    for entry in manifest {
        out.push_str(&format!(
            "  - {} ({})\n",
            entry.display_name,
            format_size(entry.size_bytes)
        ));
    }
    out.push_str(&format!("Total size: {}\n", format_size(manifest.total_size())));
    out
}

/// QR code (unless disabled) framed by separators, then the URL and the stop hint.
///
/// A QR failure is logged and the URL is still shown.
pub fn share_block(url: &str, show_qr: bool) -> String {
    let mut out = String::new();
    out.push_str(SEPARATOR);
    out.push('\n');

    if show_qr {
        match generate_qr(url) {
            Ok(qr) => {
                out.push_str("Scan to download:\n\n");
                out.push_str(&qr);
                out.push('\n');
            }
            Err(e) => tracing::warn!("{:#}", e),
        }
    }

    out.push_str(&format!("\nPublic URL: {}\n", url));
    out.push_str(SEPARATOR);
    out.push_str("\nPress 'q' + Enter or Ctrl+C to stop sharing.\n");
    out
}

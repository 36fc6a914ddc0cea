use std::path::PathBuf;

use qrtunnel_core::ShareError;

/// Open the native file picker. Cancelling or picking nothing is invalid input.
pub fn pick_files() -> Result<Vec<PathBuf>, ShareError> {
    tracing::info!("No files given, opening file picker");

    let picked = rfd::FileDialog::new()
        .set_title("Select files to share")
        .pick_files()
        .unwrap_or_default();

    require_selection(picked)
}

fn require_selection(picked: Vec<PathBuf>) -> Result<Vec<PathBuf>, ShareError> {
    if picked.is_empty() {
        return Err(ShareError::InvalidPath {
            path: PathBuf::new(),
            reason: "no files selected".to_string(),
        });
    }
    Ok(picked)
}

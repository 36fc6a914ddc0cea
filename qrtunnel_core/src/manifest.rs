//! Validated, ordered set of files shared in one session.

use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{Result, ShareError};

/// One servable file
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub display_name: String,
    /// Never serialized; the path stays on this machine
    #[serde(skip)]
    pub absolute_path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Validate every path and build the manifest.
    ///
    /// All-or-nothing: the first invalid path fails the whole call.
    pub fn build<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        if paths.is_empty() {
            return Err(ShareError::InvalidPath {
                path: PathBuf::new(),
                reason: "no files selected".to_string(),
            });
        }

        let mut entries = Vec::with_capacity(paths.len());
        let mut taken = HashSet::new();

        for path in paths {
            let path = path.as_ref();
            let (absolute_path, size_bytes) = validate_file(path)?;

            // name as the user gave it; a symlink target's name stays private
            let base_name = path
                .file_name()
                .or_else(|| absolute_path.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| invalid(path, "path has no file name"))?;
            let display_name = unique_display_name(&base_name, &mut taken);

            entries.push(ManifestEntry {
                display_name,
                absolute_path,
                size_bytes,
            });
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ManifestEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by display name
    pub fn get(&self, display_name: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.display_name == display_name)
    }

    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }
}

impl<'a> IntoIterator for &'a Manifest {
    type Item = &'a ManifestEntry;
    type IntoIter = std::slice::Iter<'a, ManifestEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

fn invalid(path: &Path, reason: impl Into<String>) -> ShareError {
    ShareError::InvalidPath {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Resolve a path to an existing, readable regular file.
fn validate_file(path: &Path) -> Result<(PathBuf, u64)> {
    let absolute = path.canonicalize().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => invalid(path, "file not found"),
        _ => invalid(path, e.to_string()),
    })?;

    let metadata = absolute
        .metadata()
        .map_err(|e| invalid(path, e.to_string()))?;
    if metadata.is_dir() {
        return Err(invalid(path, "is a directory"));
    }
    if !metadata.is_file() {
        return Err(invalid(path, "is not a regular file"));
    }

    File::open(&absolute).map_err(|e| invalid(path, format!("not readable: {}", e)))?;

    Ok((absolute, metadata.len()))
}

/// `name.ext`, then `name (1).ext`, `name (2).ext`, ...
fn unique_display_name(base_name: &str, taken: &mut HashSet<String>) -> String {
    if taken.insert(base_name.to_string()) {
        return base_name.to_string();
    }

    let path = Path::new(base_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| base_name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n = 1usize;
    loop {
        let candidate = match &ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Format bytes to a human-readable size
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{:.1} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1} TB", size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_display_name_suffixes() {
        let mut taken = HashSet::new();
        assert_eq!(unique_display_name("report.pdf", &mut taken), "report.pdf");
        assert_eq!(unique_display_name("report.pdf", &mut taken), "report (1).pdf");
        assert_eq!(unique_display_name("report.pdf", &mut taken), "report (2).pdf");
        assert_eq!(unique_display_name("Makefile", &mut taken), "Makefile");
        assert_eq!(unique_display_name("Makefile", &mut taken), "Makefile (1)");
    }

    #[test]
    fn test_suffix_never_collides_with_real_name() {
        let mut taken = HashSet::new();
        unique_display_name("x.txt", &mut taken);
        unique_display_name("x.txt", &mut taken);
        // a real file literally named "x (1).txt"
        assert_eq!(unique_display_name("x (1).txt", &mut taken), "x (1) (1).txt");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(12), "12.0 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024 * 1024), "3.0 TB");
    }

    #[test]
    fn test_empty_input_is_rejected() {
        let paths: Vec<PathBuf> = Vec::new();
        assert!(matches!(
            Manifest::build(&paths),
            Err(ShareError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_serialize_skips_path() {
        let entry = ManifestEntry {
            display_name: "test.txt".to_string(),
            absolute_path: PathBuf::from("/secret/path/test.txt"),
            size_bytes: 500,
        };
        let json = serde_json::to_string(&entry).expect("Should serialize");
        assert!(!json.contains("secret"));
        assert!(json.contains("test.txt"));
        assert!(json.contains("500"));
    }
}

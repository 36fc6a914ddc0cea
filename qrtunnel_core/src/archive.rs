//! Lazily built ZIP of the whole manifest.
//!
//! The first request starts the build on a blocking worker. Every other
//! request, whether it arrives during or after the build, awaits the same
//! shared future and gets the same `Arc<Archive>` or the same error.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::error::ArchiveError;
use crate::manifest::Manifest;

type BuildResult = Result<Arc<Archive>, ArchiveError>;
type SharedBuild = Shared<BoxFuture<'static, BuildResult>>;

const COPY_CHUNK: usize = 64 * 1024;

/// Finished archive on disk; the file is removed on drop.
#[derive(Debug)]
pub struct Archive {
    path: PathBuf,
    size_bytes: u64,
    removed: AtomicBool,
}

impl Archive {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Remove the backing file. Safe to call more than once.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed temp archive"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove temp archive")
            }
        }
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        self.remove();
    }
}

enum ArchiveState {
    NotBuilt,
    Building(SharedBuild),
    Ready(Arc<Archive>),
    Failed(ArchiveError),
    Discarded,
}

pub struct ArchiveBuilder {
    manifest: Arc<Manifest>,
    temp_dir: PathBuf,
    state: Mutex<ArchiveState>,
    builds: AtomicUsize,
    /// Set by `discard`; a running build stops at the next chunk
    cancelled: Arc<AtomicBool>,
}

impl ArchiveBuilder {
    pub fn new(manifest: Arc<Manifest>) -> Self {
        Self::with_temp_dir(manifest, std::env::temp_dir())
    }

    pub fn with_temp_dir(manifest: Arc<Manifest>, temp_dir: PathBuf) -> Self {
        Self {
            manifest,
            temp_dir,
            state: Mutex::new(ArchiveState::NotBuilt),
            builds: AtomicUsize::new(0),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of builds ever started (0 or 1).
    pub fn builds_started(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Get the archive, building it on first use.
    pub async fn get_archive(&self) -> BuildResult {
        let build = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| ArchiveError("archive state poisoned".to_string()))?;
            match &*state {
                ArchiveState::Ready(archive) => return Ok(archive.clone()),
                ArchiveState::Failed(err) => return Err(err.clone()),
                ArchiveState::Discarded => {
                    return Err(ArchiveError("session is shutting down".to_string()));
                }
                ArchiveState::Building(build) => build.clone(),
                ArchiveState::NotBuilt => {
                    let build = self.start_build();
                    *state = ArchiveState::Building(build.clone());
                    build
                }
            }
        };

        let result = build.await;
        self.settle(&result);
        result
    }

    fn start_build(&self) -> SharedBuild {
        self.builds.fetch_add(1, Ordering::SeqCst);

        let manifest = self.manifest.clone();
        let path = self
            .temp_dir
            .join(format!("qrtunnel-{}.zip", Uuid::new_v4().simple()));

        tracing::info!(
            files = manifest.len(),
            path = %path.display(),
            "Building archive"
        );

        // spawned eagerly so the build finishes even if every requester disconnects
        let cancelled = self.cancelled.clone();
        let task =
            tokio::task::spawn_blocking(move || write_archive(&manifest, &path, &cancelled));

        async move {
            match task.await {
                Ok(Ok(archive)) => {
                    tracing::info!(bytes = archive.size_bytes(), "Archive ready");
                    Ok(Arc::new(archive))
                }
                Ok(Err(e)) => {
                    tracing::error!("Archive build failed: {}", e);
                    Err(e)
                }
                Err(e) => Err(ArchiveError(format!("archive task failed: {}", e))),
            }
        }
        .boxed()
        .shared()
    }

    fn settle(&self, result: &BuildResult) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if matches!(*state, ArchiveState::Building(_)) {
            *state = match result {
                Ok(archive) => ArchiveState::Ready(archive.clone()),
                Err(err) => ArchiveState::Failed(err.clone()),
            };
        }
    }

    /// Drop the cached archive, stop a running build and delete the temp file. Idempotent.
    pub fn discard(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let previous = match self.state.lock() {
            Ok(mut state) => std::mem::replace(&mut *state, ArchiveState::Discarded),
            Err(_) => return,
        };
        if let ArchiveState::Ready(archive) = previous {
            archive.remove();
        }
    }
}

/// Write every manifest entry, in order, under its display name.
fn write_archive(
    manifest: &Manifest,
    path: &Path,
    cancelled: &AtomicBool,
) -> Result<Archive, ArchiveError> {
    let result = write_zip(manifest, path, cancelled);
    if let Err(e) = &result {
        let _ = fs::remove_file(path);
        return Err(ArchiveError(e.to_string()));
    }

    let size_bytes = fs::metadata(path)
        .map_err(|e| ArchiveError(format!("cannot stat {}: {}", path.display(), e)))?
        .len();

    Ok(Archive {
        path: path.to_path_buf(),
        size_bytes,
        removed: AtomicBool::new(false),
    })
}

fn write_zip(manifest: &Manifest, path: &Path, cancelled: &AtomicBool) -> io::Result<()> {
    let file = File::create(path)?;
    let mut writer = ZipWriter::new(BufWriter::new(file));

    for entry in manifest {
        check_cancelled(cancelled)?;
        // fixed timestamp keeps the output identical for the same inputs
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default())
            .large_file(entry.size_bytes >= u32::MAX as u64);

        let mut source = File::open(&entry.absolute_path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("cannot open {}: {}", entry.absolute_path.display(), e),
            )
        })?;
        writer
            .start_file(entry.display_name.as_str(), options)
            .map_err(io::Error::other)?;
        copy_until_cancelled(&mut source, &mut writer, cancelled)?;
    }

    let mut inner = writer.finish().map_err(io::Error::other)?;
    inner.flush()?;
    Ok(())
}

fn check_cancelled(cancelled: &AtomicBool) -> io::Result<()> {
    if cancelled.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "archive build cancelled",
        ));
    }
    Ok(())
}

fn copy_until_cancelled(
    source: &mut impl Read,
    dest: &mut impl Write,
    cancelled: &AtomicBool,
) -> io::Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        check_cancelled(cancelled)?;
        let n = match source.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        dest.write_all(&buf[..n])?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_in(dir: &Path, files: &[(&str, &[u8])]) -> Arc<Manifest> {
        let paths: Vec<PathBuf> = files
            .iter()
            .map(|(name, content)| {
                let path = dir.join(name);
                fs::write(&path, content).expect("write fixture");
                path
            })
            .collect();
        Arc::new(Manifest::build(&paths).expect("valid manifest"))
    }

    #[tokio::test]
    async fn test_archive_contains_entries_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_in(dir.path(), &[("b.txt", b"second"), ("a.txt", b"first")]);
        let builder = ArchiveBuilder::with_temp_dir(manifest, dir.path().to_path_buf());

        let archive = builder.get_archive().await.expect("archive builds");
        let mut zip = zip::ZipArchive::new(File::open(archive.path()).unwrap()).unwrap();

        assert_eq!(zip.len(), 2);
        assert_eq!(zip.by_index(0).unwrap().name(), "b.txt");
        assert_eq!(zip.by_index(1).unwrap().name(), "a.txt");

        let mut content = String::new();
        zip.by_name("a.txt").unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "first");
    }

    #[tokio::test]
    async fn test_second_call_reuses_result() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_in(dir.path(), &[("a.txt", b"hello")]);
        let builder = ArchiveBuilder::with_temp_dir(manifest, dir.path().to_path_buf());

        let first = builder.get_archive().await.unwrap();
        let second = builder.get_archive().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builder.builds_started(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_in(dir.path(), &[("gone.txt", b"bytes")]);
        fs::remove_file(dir.path().join("gone.txt")).unwrap();
        let builder = ArchiveBuilder::with_temp_dir(manifest, dir.path().to_path_buf());

        let first = builder.get_archive().await.unwrap_err();
        // recreating the source must not trigger a rebuild
        fs::write(dir.path().join("gone.txt"), b"bytes").unwrap();
        let second = builder.get_archive().await.unwrap_err();

        assert_eq!(first, second);
        assert_eq!(builder.builds_started(), 1);
    }

    #[tokio::test]
    async fn test_discard_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_in(dir.path(), &[("a.txt", b"hello")]);
        let builder = ArchiveBuilder::with_temp_dir(manifest, dir.path().to_path_buf());

        let path = builder.get_archive().await.unwrap().path().to_path_buf();
        assert!(path.exists());

        builder.discard();
        builder.discard();

        assert!(!path.exists());
        assert!(builder.get_archive().await.is_err());
    }

    #[test]
    fn test_cancelled_build_stops_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_in(dir.path(), &[("a.txt", b"hello")]);
        let path = dir.path().join("out.zip");

        let cancelled = AtomicBool::new(true);
        let err = write_archive(&manifest, &path, &cancelled).unwrap_err();

        assert!(err.0.contains("cancelled"));
        assert!(!path.exists());
    }

    #[test]
    fn test_copy_stops_between_chunks() {
        let cancelled = AtomicBool::new(false);
        let source = vec![7u8; COPY_CHUNK * 3];
        let mut dest = Vec::new();
        let copied = copy_until_cancelled(&mut source.as_slice(), &mut dest, &cancelled).unwrap();
        assert_eq!(copied, source.len() as u64);
        assert_eq!(dest, source);

        cancelled.store(true, Ordering::SeqCst);
        let mut dest = Vec::new();
        let err = copy_until_cancelled(&mut source.as_slice(), &mut dest, &cancelled).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert!(dest.is_empty());
    }

    #[tokio::test]
    async fn test_discard_during_build_fails_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let big = vec![1u8; 8 * 1024 * 1024];
        let manifest = manifest_in(dir.path(), &[("big.bin", big.as_slice())]);
        let builder = Arc::new(ArchiveBuilder::with_temp_dir(manifest, dir.path().to_path_buf()));

        let waiter = {
            let builder = builder.clone();
            tokio::spawn(async move { builder.get_archive().await })
        };
        tokio::task::yield_now().await;
        builder.discard();

        // the waiter settles promptly whichever way the race went
        let settled = tokio::time::timeout(std::time::Duration::from_secs(10), waiter).await;
        assert!(settled.is_ok());
        assert!(builder.get_archive().await.is_err());
    }
}

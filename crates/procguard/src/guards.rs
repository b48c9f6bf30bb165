use crate::registry::{self, CleanupRegistry};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// RAII guard for an output file that must not outlive a failed run.
///
/// The path is registered for removal on signal while the guard lives.
/// Dropping the guard deletes the file; [`keep`](Self::keep) commits it.
#[derive(Debug)]
pub struct RemoveFileOnSignal<'a> {
    registry: &'a CleanupRegistry,
    path: PathBuf,
    active: bool,
}

impl RemoveFileOnSignal<'static> {
    /// Guard `path` against the process-wide registry.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_registry(registry::global(), path)
    }
}

impl<'a> RemoveFileOnSignal<'a> {
    pub fn with_registry(registry: &'a CleanupRegistry, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        registry.register_file_for_removal(&path);
        Self {
            registry,
            path,
            active: true,
        }
    }

    /// Keep the file and stop guarding it. Returns the path.
    pub fn keep(mut self) -> PathBuf {
        self.active = false;
        self.registry.unregister_file_for_removal(&self.path);
        std::mem::take(&mut self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RemoveFileOnSignal<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.registry.unregister_file_for_removal(&self.path);
        match fs::symlink_metadata(&self.path) {
            Ok(meta) if meta.is_file() => {
                if let Err(err) = fs::remove_file(&self.path) {
                    log::warn!(
                        "output guard failed to remove {}: {}",
                        self.path.display(),
                        err
                    );
                }
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("output guard cannot stat {}: {}", self.path.display(), err),
        }
    }
}

//! Write-once artifact store for one component build.
//!
//! Rendered content is keyed by logical output path relative to the write-to
//! directory. Entries are write-once: a second `set` for the same path is an
//! error signalling a misconfigured plan. The store belongs exclusively to a
//! single component build, so one coarse read/write lock is sufficient.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Errors from artifact store operations.
#[derive(Debug, Error)]
pub enum StoreError {
  /// A second `set` for a path that already holds content.
  #[error("could not set artifact {path}: already set")]
  AlreadySet { path: String },

  /// `save` was asked to persist a path with no stored content.
  #[error("missing key: {path}")]
  MissingKey { path: String },

  /// Filesystem failure while saving or loading an entry.
  #[error("could not {action} {}: {source}", path.display())]
  Io {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// In-memory map of logical output path to rendered file content.
#[derive(Debug, Default)]
pub struct ArtifactStore {
  m: RwLock<HashMap<String, Vec<u8>>>,
}

impl ArtifactStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the content stored under `path`, if any.
  pub fn get(&self, path: &str) -> Option<Vec<u8>> {
    self.read().get(path).cloned()
  }

  /// Stores `data` under `path`. Errors if the path was previously set.
  pub fn set(&self, path: &str, data: Vec<u8>) -> Result<(), StoreError> {
    let mut m = self.write();
    if m.contains_key(path) {
      return Err(StoreError::AlreadySet { path: path.to_string() });
    }
    m.insert(path.to_string(), data);
    Ok(())
  }

  /// Returns all stored paths, unordered.
  pub fn keys(&self) -> Vec<String> {
    self.read().keys().cloned().collect()
  }

  /// Writes the content stored under `path` to `base/path`, creating parent
  /// directories as needed.
  pub fn save(&self, base: &Path, path: &str) -> Result<(), StoreError> {
    let data = self
      .get(path)
      .ok_or_else(|| StoreError::MissingKey { path: path.to_string() })?;

    let target = base.join(path);
    if let Some(dir) = target.parent() {
      std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
        action: "create directory",
        path: dir.to_path_buf(),
        source,
      })?;
    }
    std::fs::write(&target, data).map_err(|source| StoreError::Io {
      action: "write",
      path: target.clone(),
      source,
    })?;
    debug!(path = %target.display(), "wrote");
    Ok(())
  }

  /// Reads `base/path` back into the store under `path`. When `base/path` is
  /// a directory the whole subtree is loaded, one entry per file, keyed by
  /// the file's path relative to `base`. Used when an external command
  /// writes its output to a known location instead of standard output.
  pub fn load(&self, base: &Path, path: &str) -> Result<(), StoreError> {
    let source_path = base.join(path);
    if source_path.is_dir() {
      for entry in WalkDir::new(&source_path) {
        let entry = entry.map_err(|e| StoreError::Io {
          action: "walk",
          path: source_path.clone(),
          source: io::Error::other(e),
        })?;
        if entry.file_type().is_file() {
          let rel = entry
            .path()
            .strip_prefix(base)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
          self.load_file(entry.path(), &rel)?;
        }
      }
      Ok(())
    } else {
      self.load_file(&source_path, path)
    }
  }

  fn load_file(&self, file: &Path, key: &str) -> Result<(), StoreError> {
    let data = std::fs::read(file).map_err(|source| StoreError::Io {
      action: "read",
      path: file.to_path_buf(),
      source,
    })?;
    self.set(key, data)
  }

  fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<u8>>> {
    match self.m.read() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<u8>>> {
    match self.m.write() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}

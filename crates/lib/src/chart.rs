//! On-disk chart cache with single-flight fetching.
//!
//! Charts are cached under `<component dir>/vendor/<version>/<base name>` so
//! repeated builds render from local content. Concurrent builds of the same
//! component, possibly in separate processes, coordinate through an atomic
//! `create_dir` lock next to the cache entry: the lock holder fetches into a
//! private temp directory and renames it into place while everyone else polls
//! until the entry appears.
//!
//! Locks left behind by an abnormal exit are not reclaimed automatically;
//! the escalating warnings name the lock path so an operator can remove it.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::plan::Chart;
use crate::runner::{CommandRunner, RunError, RunRequest};

const LOCK_POLL: Duration = Duration::from_millis(100);
const WARN_AFTER: Duration = Duration::from_secs(5);
const WARN_AGAIN_AFTER: Duration = Duration::from_secs(10);

/// Bound on one `ensure_cached` call, lock waiting included.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors from chart cache operations.
#[derive(Debug, Error)]
pub enum ChartError {
  #[error("could not {action} {}: {source}", path.display())]
  Io {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("could not fetch chart {chart}: {source}")]
  Fetch {
    chart: String,
    #[source]
    source: RunError,
  },

  /// The fetch completed but the expected chart directory is absent.
  #[error("chart fetch produced no directory at {}", path.display())]
  Missing { path: PathBuf },

  #[error("timed out after {timeout:?} waiting for chart cache {}", path.display())]
  Timeout { timeout: Duration, path: PathBuf },
}

/// Downloads one chart into a destination directory.
///
/// The fetched chart must land at `<dest>/<chart base name>`.
#[async_trait]
pub trait ChartFetcher: Send + Sync {
  async fn fetch(&self, chart: &Chart, dest: &Path) -> Result<(), ChartError>;
}

/// Caches charts for one component directory.
pub struct ChartCache {
  root: PathBuf,
  fetcher: Arc<dyn ChartFetcher>,
  timeout: Duration,
}

impl ChartCache {
  pub fn new(root: impl Into<PathBuf>, fetcher: Arc<dyn ChartFetcher>) -> Self {
    Self {
      root: root.into(),
      fetcher,
      timeout: DEFAULT_TIMEOUT,
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Cache location for `chart`, whether or not it exists yet.
  pub fn path_for(&self, chart: &Chart) -> PathBuf {
    self
      .root
      .join("vendor")
      .join(&chart.version)
      .join(chart.base_name())
  }

  /// Returns the cached chart directory, fetching it first when absent.
  ///
  /// At most one caller fetches; the rest wait for the cache entry to
  /// appear. The whole operation is bounded by the configured timeout.
  pub async fn ensure_cached(&self, chart: &Chart) -> Result<PathBuf, ChartError> {
    let path = self.path_for(chart);
    if path.exists() {
      debug!(chart = %chart.name, path = %path.display(), "chart cache hit");
      return Ok(path);
    }

    match tokio::time::timeout(self.timeout, self.cache_once(chart, &path)).await {
      Ok(result) => result,
      Err(_) => Err(ChartError::Timeout {
        timeout: self.timeout,
        path,
      }),
    }
  }

  async fn cache_once(&self, chart: &Chart, path: &Path) -> Result<PathBuf, ChartError> {
    let parent = path.parent().unwrap_or(path);
    std::fs::create_dir_all(parent).map_err(|source| ChartError::Io {
      action: "create directory",
      path: parent.to_path_buf(),
      source,
    })?;

    let lock_path = lock_path(path);
    loop {
      if path.exists() {
        return Ok(path.to_path_buf());
      }

      match std::fs::create_dir(&lock_path) {
        Ok(()) => {
          let _guard = LockGuard {
            path: lock_path.clone(),
          };
          // Another process may have finished between our stat and the lock.
          if path.exists() {
            return Ok(path.to_path_buf());
          }
          self.fetch_into(chart, path, parent).await?;
          return Ok(path.to_path_buf());
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
          self.wait_for_lock(&lock_path).await;
        }
        Err(source) => {
          return Err(ChartError::Io {
            action: "create lock",
            path: lock_path,
            source,
          });
        }
      }
    }
  }

  /// Polls until the lock directory disappears, warning as the wait grows.
  async fn wait_for_lock(&self, lock_path: &Path) {
    let started = tokio::time::Instant::now();
    let mut warned_slow = false;
    let mut warned_stale = false;
    while lock_path.exists() {
      let waited = started.elapsed();
      if waited >= WARN_AGAIN_AFTER && !warned_stale {
        warned_stale = true;
        warn!(
          lock = %lock_path.display(),
          ?waited,
          "still waiting on chart lock, remove it manually if no other build is running"
        );
      } else if waited >= WARN_AFTER && !warned_slow {
        warned_slow = true;
        warn!(lock = %lock_path.display(), ?waited, "waiting on chart lock held by another build");
      }
      tokio::time::sleep(LOCK_POLL).await;
    }
  }

  /// Fetches into a private staging directory, then renames into place.
  async fn fetch_into(&self, chart: &Chart, path: &Path, parent: &Path) -> Result<(), ChartError> {
    let staging = tempfile::tempdir_in(parent).map_err(|source| ChartError::Io {
      action: "create staging directory",
      path: parent.to_path_buf(),
      source,
    })?;

    info!(chart = %chart.name, version = %chart.version, "fetching chart");
    self.fetcher.fetch(chart, staging.path()).await?;

    let fetched = staging.path().join(chart.base_name());
    if !fetched.exists() {
      return Err(ChartError::Missing { path: fetched });
    }

    if let Err(source) = std::fs::rename(&fetched, path) {
      // A concurrent process that slipped past the lock may have won the
      // rename; the cached content is equivalent either way.
      if !path.exists() {
        return Err(ChartError::Io {
          action: "rename",
          path: path.to_path_buf(),
          source,
        });
      }
      debug!(path = %path.display(), "lost rename race, using existing cache entry");
    }
    Ok(())
  }
}

/// Lock directory guarding one cache entry, named by appending `.lock` to
/// the entry's file name so dotted chart names keep distinct locks.
fn lock_path(path: &Path) -> PathBuf {
  let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
  name.push(".lock");
  path.with_file_name(name)
}

struct LockGuard {
  path: PathBuf,
}

impl Drop for LockGuard {
  fn drop(&mut self) {
    if let Err(err) = std::fs::remove_dir(&self.path) {
      warn!(lock = %self.path.display(), %err, "could not remove chart lock");
    }
  }
}

/// Fetches charts with the `helm` CLI.
///
/// Non-OCI repositories are registered with `helm repo add` (credentials
/// resolved from the auth sources) and refreshed with `helm repo update`
/// before pulling. OCI references are pulled directly.
pub struct HelmFetcher {
  runner: Arc<dyn CommandRunner>,
}

impl HelmFetcher {
  pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
    Self { runner }
  }

  fn pull_reference(chart: &Chart) -> String {
    let repo = &chart.repository;
    if chart.name.contains("://") || repo.name.is_empty() {
      chart.name.clone()
    } else {
      format!("{}/{}", repo.name, chart.name)
    }
  }
}

#[async_trait]
impl ChartFetcher for HelmFetcher {
  async fn fetch(&self, chart: &Chart, dest: &Path) -> Result<(), ChartError> {
    let repo = &chart.repository;
    if !repo.url.is_empty() && !repo.is_oci() {
      let mut add = RunRequest::new("helm").args(["repo", "add"]);
      if let Some(username) = repo.auth.username.resolve() {
        add = add.arg("--username").arg(username);
      }
      if let Some(password) = repo.auth.password.resolve() {
        add = add.arg("--password").arg(password);
      }
      add = add.arg("--force-update").arg(&repo.name).arg(&repo.url);
      self.runner.run(add).await.map_err(|source| ChartError::Fetch {
        chart: chart.name.clone(),
        source,
      })?;

      let update = RunRequest::new("helm").args(["repo", "update", &repo.name]);
      self
        .runner
        .run(update)
        .await
        .map_err(|source| ChartError::Fetch {
          chart: chart.name.clone(),
          source,
        })?;
    }

    let pull = RunRequest::new("helm")
      .arg("pull")
      .arg(Self::pull_reference(chart))
      .arg("--version")
      .arg(&chart.version)
      .arg("--untar")
      .arg("--untardir")
      .arg(dest.to_string_lossy().into_owned());
    self.runner.run(pull).await.map_err(|source| ChartError::Fetch {
      chart: chart.name.clone(),
      source,
    })?;
    Ok(())
  }
}

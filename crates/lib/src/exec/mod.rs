//! BuildPlan execution.
//!
//! One build renders every artifact of one plan. Artifact pipelines run
//! concurrently in a `JoinSet`; the leaf tasks inside them (generators, the
//! transformer sequence, validators) each hold one permit from a shared
//! semaphore, so the concurrency ceiling bounds real work without the
//! pipelines themselves competing for slots. The first failure aborts every
//! other pipeline.

mod generate;
mod pipeline;
mod transform;
mod validate;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::chart::{ChartCache, ChartError};
use crate::plan::BuildPlan;
use crate::runner::{CommandRunner, RunError};
use crate::store::{ArtifactStore, StoreError};

/// Ceiling when no explicit concurrency is configured.
pub fn default_concurrency() -> usize {
  std::thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(4)
    .min(8)
}

/// Failure of one leaf task inside a pipeline.
#[derive(Debug, Error)]
pub enum TaskError {
  /// A generator, transformer, or validator with a kind this engine does
  /// not implement.
  #[error("unrecognized step kind")]
  UnknownKind,

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Chart(#[from] ChartError),

  #[error(transparent)]
  Run(#[from] RunError),

  #[error("could not encode yaml: {0}")]
  Yaml(#[from] serde_yaml::Error),

  /// A transformer or validator input with no store entry.
  #[error("missing input: {path}")]
  MissingInput { path: String },

  #[error("could not {action} {}: {source}", path.display())]
  Io {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Failure of one plan build.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error("{id}: {source}")]
  Task {
    /// `component:plan/artifact/N/phase/M`, locating the failed step.
    id: String,
    #[source]
    source: TaskError,
  },

  #[error("could not persist {artifact}: {source}")]
  Persist {
    artifact: String,
    #[source]
    source: StoreError,
  },

  /// The build was aborted because a sibling task failed.
  #[error("build canceled")]
  Canceled,

  #[error("build task panicked: {0}")]
  Panic(String),
}

/// Collaborators and paths for one component build.
#[derive(Clone)]
pub struct BuildOpts {
  pub store: Arc<ArtifactStore>,
  pub runner: Arc<dyn CommandRunner>,
  pub charts: Arc<ChartCache>,
  /// Working directory for external commands.
  pub root: PathBuf,
  /// Component path relative to `root`; prefixes task ids.
  pub leaf: String,
  /// Base directory final artifacts are written under.
  pub write_to: PathBuf,
  /// Scratch directory for intermediate files, private to this build.
  pub scratch: PathBuf,
  pub concurrency: usize,
}

impl BuildOpts {
  /// Absolute component directory.
  pub fn leaf_dir(&self) -> PathBuf {
    self.root.join(&self.leaf)
  }
}

/// Renders every artifact of `plan` and persists the results.
///
/// # Arguments
///
/// * `plan` - the plan to execute; `disabled` plans are a logged no-op.
/// * `opts` - collaborators, paths, and the task concurrency ceiling.
///
/// # Returns
///
/// `Ok(())` once every artifact is rendered, validated, and persisted, or
/// the first failure. After a failure the output directory may hold a
/// partial set of artifacts.
pub async fn build(plan: &BuildPlan, opts: &BuildOpts) -> Result<(), BuildError> {
  if plan.spec.disabled {
    warn!(plan = %plan.metadata.name, "plan is disabled, skipping");
    return Ok(());
  }

  let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
  let mut pipelines = JoinSet::new();
  for (index, artifact) in plan.spec.artifacts.iter().enumerate() {
    if artifact.skip {
      debug!(artifact = %artifact.artifact, "skipping artifact");
      continue;
    }
    let pipeline = pipeline::Pipeline {
      artifact: artifact.clone(),
      index,
      plan: plan.metadata.name.clone(),
      opts: opts.clone(),
      semaphore: semaphore.clone(),
    };
    pipelines.spawn(pipeline.run());
  }

  drain_failfast(pipelines, &semaphore).await
}

/// Joins every task, aborting the rest as soon as one fails.
///
/// The semaphore is closed on first failure so leaf tasks queued behind the
/// ceiling return [`BuildError::Canceled`] instead of starting new work.
pub(crate) async fn drain_failfast(
  mut tasks: JoinSet<Result<(), BuildError>>,
  semaphore: &Semaphore,
) -> Result<(), BuildError> {
  let mut first: Option<BuildError> = None;
  while let Some(joined) = tasks.join_next().await {
    match joined {
      Ok(Ok(())) => {}
      Ok(Err(err)) => {
        if first.is_none() {
          first = Some(err);
          semaphore.close();
          tasks.abort_all();
        }
      }
      Err(err) if err.is_cancelled() => {}
      Err(err) => {
        if first.is_none() {
          first = Some(BuildError::Panic(err.to_string()));
          semaphore.close();
          tasks.abort_all();
        }
      }
    }
  }
  match first {
    Some(err) => Err(err),
    None => Ok(()),
  }
}

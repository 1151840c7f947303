//! Per-artifact pipeline: generate, transform, validate, persist.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::{BuildError, BuildOpts, drain_failfast, generate, transform, validate};
use crate::plan::Artifact;
use crate::store::StoreError;

/// One artifact's pipeline, moving through its phases in order.
///
/// Leaf tasks take a semaphore permit inside the spawned task, so a large
/// pipeline never deadlocks the executor by holding permits while queued.
pub(crate) struct Pipeline {
  pub(crate) artifact: Artifact,
  pub(crate) index: usize,
  pub(crate) plan: String,
  pub(crate) opts: BuildOpts,
  pub(crate) semaphore: Arc<Semaphore>,
}

impl Pipeline {
  pub(crate) async fn run(self) -> Result<(), BuildError> {
    self.generate().await?;
    self.transform().await?;
    self.validate().await?;
    self.persist()
  }

  fn task_id(&self, phase: &str, step: usize) -> String {
    format!(
      "{}:{}/artifact/{}/{}/{}",
      self.opts.leaf, self.plan, self.index, phase, step
    )
  }

  /// Runs every generator concurrently and waits for all of them.
  async fn generate(&self) -> Result<(), BuildError> {
    let mut tasks = JoinSet::new();
    for (step, generator) in self.artifact.generators.iter().cloned().enumerate() {
      let id = self.task_id("generator", step);
      let opts = self.opts.clone();
      let semaphore = self.semaphore.clone();
      tasks.spawn(async move {
        let _permit = semaphore
          .acquire_owned()
          .await
          .map_err(|_| BuildError::Canceled)?;
        debug!(task = %id, "generating");
        generate::run(&generator, &opts)
          .await
          .map_err(|source| BuildError::Task { id, source })
      });
    }
    drain_failfast(tasks, &self.semaphore).await
  }

  /// Runs transformers strictly in declared order under one permit.
  async fn transform(&self) -> Result<(), BuildError> {
    if self.artifact.transformers.is_empty() {
      return Ok(());
    }
    let _permit = self
      .semaphore
      .clone()
      .acquire_owned()
      .await
      .map_err(|_| BuildError::Canceled)?;
    for (step, transformer) in self.artifact.transformers.iter().enumerate() {
      let id = self.task_id("transformer", step);
      debug!(task = %id, "transforming");
      transform::run(transformer, &self.opts)
        .await
        .map_err(|source| BuildError::Task { id, source })?;
    }
    Ok(())
  }

  /// Runs every validator concurrently; all must pass.
  async fn validate(&self) -> Result<(), BuildError> {
    let mut tasks = JoinSet::new();
    for (step, validator) in self.artifact.validators.iter().cloned().enumerate() {
      let id = self.task_id("validator", step);
      let opts = self.opts.clone();
      let semaphore = self.semaphore.clone();
      tasks.spawn(async move {
        let _permit = semaphore
          .acquire_owned()
          .await
          .map_err(|_| BuildError::Canceled)?;
        debug!(task = %id, "validating");
        validate::run(&validator, &opts)
          .await
          .map_err(|source| BuildError::Task { id, source })
      });
    }
    drain_failfast(tasks, &self.semaphore).await
  }

  /// Writes the final artifact from the store to the write-to directory.
  fn persist(&self) -> Result<(), BuildError> {
    let path = &self.artifact.artifact;
    if path.is_empty() {
      debug!(plan = %self.plan, index = self.index, "artifact has no output path, nothing to persist");
      return Ok(());
    }
    match self.opts.store.save(&self.opts.write_to, path) {
      Ok(()) => {
        info!(artifact = %path, "wrote");
        Ok(())
      }
      Err(StoreError::MissingKey { .. }) if self.sole_generator_owns_artifact() => {
        // The one generator targeting the artifact path materialized its
        // output out of band, possibly as a directory tree of store
        // entries. Persist whatever landed under the artifact prefix.
        let prefix = format!("{path}/");
        let mut nested: Vec<String> = self
          .opts
          .store
          .keys()
          .into_iter()
          .filter(|key| key.starts_with(&prefix))
          .collect();
        nested.sort();
        for key in &nested {
          self
            .opts
            .store
            .save(&self.opts.write_to, key)
            .map_err(|source| BuildError::Persist {
              artifact: key.clone(),
              source,
            })?;
        }
        debug!(artifact = %path, entries = nested.len(), "no store entry at artifact path, persisted nested entries");
        Ok(())
      }
      Err(source) => Err(BuildError::Persist {
        artifact: path.clone(),
        source,
      }),
    }
  }

  fn sole_generator_owns_artifact(&self) -> bool {
    self.artifact.generators.len() == 1
      && self.artifact.generators[0].output() == Some(self.artifact.artifact.as_str())
  }
}

//! Serialized façade over the configuration-evaluation engine.
//!
//! The engine is an external command producing BuildPlan JSON on stdout. It
//! is not safe to invoke reentrantly, so all evaluations in one process go
//! through a single [`Evaluator`] that serializes calls behind an async
//! mutex.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::plan::{BuildPlan, PlanError};
use crate::runner::{CommandRunner, RunError, RunRequest};

/// Tag key carrying the [`BuildContext`] into the evaluation.
pub const BUILD_CONTEXT_TAG: &str = "build_context";

#[derive(Debug, Error)]
pub enum EvalError {
  #[error("could not evaluate {component}: {source}")]
  Run {
    component: String,
    #[source]
    source: RunError,
  },

  #[error("could not parse plan for {component}: {source}")]
  Parse {
    component: String,
    #[source]
    source: PlanError,
  },

  #[error("could not encode build context: {0}")]
  Encode(#[from] serde_json::Error),
}

/// Runtime context the engine owns but the plan needs to reference.
///
/// Injected into the evaluation as a JSON-valued tag so plans can embed the
/// engine-managed scratch directory in Command argument lists; Command steps
/// that skip stdout capture write their output there and the engine loads it
/// back by the declared output path.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildContext {
  pub temp_dir: String,
}

impl BuildContext {
  pub fn new(temp_dir: &Path) -> Self {
    Self {
      temp_dir: temp_dir.to_string_lossy().into_owned(),
    }
  }

  /// `key=json` tag form, e.g. `build_context={"tempDir":"/tmp/x"}`.
  pub fn tag(&self) -> Result<String, EvalError> {
    Ok(format!("{BUILD_CONTEXT_TAG}={}", serde_json::to_string(self)?))
  }
}

/// Runs the evaluation engine for one component at a time.
pub struct Evaluator {
  program: String,
  args: Vec<String>,
  runner: Arc<dyn CommandRunner>,
  gate: Mutex<()>,
}

impl Evaluator {
  pub fn new(program: impl Into<String>, args: Vec<String>, runner: Arc<dyn CommandRunner>) -> Self {
    Self {
      program: program.into(),
      args,
      runner,
      gate: Mutex::new(()),
    }
  }

  /// Evaluates the component at `path` (relative to `root`), injecting each
  /// tag as a `--inject key=value` argument, and parses stdout as a
  /// BuildPlan.
  pub async fn evaluate(&self, root: &Path, path: &str, tags: &[String]) -> Result<BuildPlan, EvalError> {
    let mut req = RunRequest::new(&self.program)
      .args(self.args.clone())
      .cwd(root)
      .arg(path);
    for tag in tags {
      req = req.arg("--inject").arg(tag);
    }

    // One evaluation at a time: the engine is not reentrant.
    let _serialized = self.gate.lock().await;
    debug!(component = %path, "evaluating");
    let output = self.runner.run(req).await.map_err(|source| EvalError::Run {
      component: path.to_string(),
      source,
    })?;

    BuildPlan::from_json_slice(&output.stdout).map_err(|source| EvalError::Parse {
      component: path.to_string(),
      source,
    })
  }
}

//! Validator tasks: check rendered content without producing new outputs.

use super::{BuildOpts, TaskError};
use crate::plan::Validator;
use crate::runner::RunRequest;

pub(super) async fn run(validator: &Validator, opts: &BuildOpts) -> Result<(), TaskError> {
  match validator {
    Validator::Command { inputs, command } => {
      let Some((program, args)) = command.args.split_first() else {
        return Err(TaskError::MissingInput {
          path: "command args".to_string(),
        });
      };

      // Inputs are materialized under the shared scratch directory; the
      // plan's argv already points there via the build-context tag, so the
      // command line runs untouched from the platform root.
      for input in inputs {
        if opts.store.get(input).is_none() {
          return Err(TaskError::MissingInput {
            path: input.clone(),
          });
        }
        opts.store.save(&opts.scratch, input)?;
      }

      let req = RunRequest::new(program)
        .args(args.iter().cloned())
        .cwd(&opts.root);
      opts.runner.run(req).await?;
      Ok(())
    }
    Validator::Unknown => Err(TaskError::UnknownKind),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chart::{ChartCache, ChartError, ChartFetcher};
  use crate::plan::CommandSpec;
  use crate::runner::mock::MockRunner;
  use crate::runner::{CommandRunner, RunError, RunOutput, RunRequest};
  use crate::store::ArtifactStore;
  use async_trait::async_trait;
  use std::sync::Arc;
  use tempfile::TempDir;

  struct NoFetcher;

  #[async_trait]
  impl ChartFetcher for NoFetcher {
    async fn fetch(
      &self,
      _chart: &crate::plan::Chart,
      _dest: &std::path::Path,
    ) -> Result<(), ChartError> {
      panic!("unexpected chart fetch");
    }
  }

  fn opts(temp: &TempDir, runner: Arc<dyn CommandRunner>) -> BuildOpts {
    let root = temp.path().join("root");
    let scratch = temp.path().join("scratch");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::create_dir_all(&scratch).unwrap();
    BuildOpts {
      store: Arc::new(ArtifactStore::new()),
      runner,
      charts: Arc::new(ChartCache::new(&root, Arc::new(NoFetcher))),
      root,
      leaf: "c".to_string(),
      write_to: temp.path().join("deploy"),
      scratch,
      concurrency: 2,
    }
  }

  #[tokio::test]
  async fn validator_runs_from_root_with_inputs_in_scratch() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    let scratch = temp.path().join("scratch");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::create_dir_all(&scratch).unwrap();

    let expect_cwd = root.clone();
    let expect_input = scratch.join("out.yaml");
    let runner = Arc::new(MockRunner::new(move |req: &RunRequest| {
      assert_eq!(req.cwd.as_deref(), Some(expect_cwd.as_path()));
      assert!(expect_input.exists());
      Ok(RunOutput::default())
    }));

    let opts = BuildOpts {
      store: Arc::new(ArtifactStore::new()),
      runner: runner.clone(),
      charts: Arc::new(crate::chart::ChartCache::new(&root, Arc::new(NoFetcher))),
      root,
      leaf: "c".to_string(),
      write_to: temp.path().join("deploy"),
      scratch,
      concurrency: 2,
    };
    opts.store.set("out.yaml", b"kind: Pod\n".to_vec()).unwrap();

    let validator = Validator::Command {
      inputs: vec!["out.yaml".to_string()],
      command: CommandSpec {
        display_name: String::new(),
        args: vec!["kubeconform".to_string(), "-strict".to_string()],
        is_stdout_output: false,
      },
    };
    run(&validator, &opts).await.unwrap();

    // The declared command line runs untouched.
    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], "kubeconform '-strict'");
  }

  #[tokio::test]
  async fn failing_validator_surfaces_run_error() {
    let temp = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::new(|req: &RunRequest| {
      Err(RunError::Failed {
        command: req.display(),
        code: Some(1),
        detail: "\n\tError: invalid manifest".to_string(),
        stderr: "Error: invalid manifest\n".to_string(),
      })
    }));
    let opts = opts(&temp, runner);
    opts.store.set("out.yaml", b"bad".to_vec()).unwrap();

    let validator = Validator::Command {
      inputs: vec!["out.yaml".to_string()],
      command: CommandSpec {
        display_name: String::new(),
        args: vec!["kubeconform".to_string()],
        is_stdout_output: false,
      },
    };
    let err = run(&validator, &opts).await.unwrap_err();
    assert!(matches!(err, TaskError::Run(RunError::Failed { .. })));
  }

  #[tokio::test]
  async fn validator_missing_input_errors() {
    let temp = TempDir::new().unwrap();
    let opts = opts(&temp, Arc::new(MockRunner::ok()));

    let validator = Validator::Command {
      inputs: vec!["absent.yaml".to_string()],
      command: CommandSpec {
        display_name: String::new(),
        args: vec!["kubeconform".to_string()],
        is_stdout_output: false,
      },
    };
    let err = run(&validator, &opts).await.unwrap_err();
    assert!(matches!(err, TaskError::MissingInput { .. }));
  }
}

//! Transformer tasks: combine prior named outputs into new ones.

use std::path::Path;

use super::{BuildOpts, TaskError, generate};
use crate::plan::{Kustomize, Transformer};
use crate::runner::RunRequest;

pub(super) async fn run(transformer: &Transformer, opts: &BuildOpts) -> Result<(), TaskError> {
  match transformer {
    Transformer::Join { inputs, output, join } => {
      let mut parts = Vec::with_capacity(inputs.len());
      for input in inputs {
        let data = opts.store.get(input).ok_or_else(|| TaskError::MissingInput {
          path: input.clone(),
        })?;
        parts.push(data);
      }
      let content = parts.join(join.separator.as_bytes());
      opts.store.set(output, content)?;
      Ok(())
    }
    Transformer::Kustomize {
      inputs,
      output,
      kustomize,
    } => {
      let content = run_kustomize(inputs, kustomize, opts).await?;
      opts.store.set(output, content)?;
      Ok(())
    }
    Transformer::Command {
      inputs,
      output,
      command,
    } => {
      // Commands read their inputs as files under the scratch directory.
      for input in inputs {
        opts.store.save(&opts.scratch, input)?;
      }
      generate::run_command(output, command, opts).await
    }
    Transformer::Unknown => Err(TaskError::UnknownKind),
  }
}

/// Materializes inputs, the kustomization, and auxiliary files into a
/// private directory, then captures `kubectl kustomize` stdout.
async fn run_kustomize(inputs: &[String], kustomize: &Kustomize, opts: &BuildOpts) -> Result<Vec<u8>, TaskError> {
  let dir = tempfile::tempdir_in(&opts.scratch).map_err(|err| TaskError::Io {
    action: "create directory",
    path: opts.scratch.clone(),
    source: err,
  })?;

  for input in inputs {
    if opts.store.get(input).is_none() {
      return Err(TaskError::MissingInput {
        path: input.clone(),
      });
    }
    opts.store.save(dir.path(), input)?;
  }

  let kustomization = serde_yaml::to_string(&kustomize.kustomization)?;
  write_file(&dir.path().join("kustomization.yaml"), kustomization.as_bytes())?;
  for (name, content) in &kustomize.files {
    write_file(&dir.path().join(name), content.as_bytes())?;
  }

  let req = RunRequest::new("kubectl")
    .arg("kustomize")
    .arg(dir.path().to_string_lossy().into_owned())
    .cwd(&opts.root);
  let output = opts.runner.run(req).await?;
  Ok(output.stdout)
}

fn write_file(path: &Path, data: &[u8]) -> Result<(), TaskError> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).map_err(|err| TaskError::Io {
      action: "create directory",
      path: parent.to_path_buf(),
      source: err,
    })?;
  }
  std::fs::write(path, data).map_err(|err| TaskError::Io {
    action: "write",
    path: path.to_path_buf(),
    source: err,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chart::{ChartCache, ChartError, ChartFetcher};
  use crate::plan::Join;
  use crate::runner::mock::MockRunner;
  use crate::runner::{CommandRunner, RunOutput, RunRequest};
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
  async fn join_concatenates_with_separator() {
    let temp = TempDir::new().unwrap();
    let opts = opts(&temp, Arc::new(MockRunner::ok()));
    opts.store.set("x", b"X".to_vec()).unwrap();
    opts.store.set("y", b"Y".to_vec()).unwrap();

    let transformer = Transformer::Join {
      inputs: vec!["x".to_string(), "y".to_string()],
      output: "joined".to_string(),
      join: Join {
        separator: "-".to_string(),
      },
    };
    run(&transformer, &opts).await.unwrap();
    assert_eq!(opts.store.get("joined").unwrap(), b"X-Y");
  }

  #[tokio::test]
  async fn join_missing_input_errors() {
    let temp = TempDir::new().unwrap();
    let opts = opts(&temp, Arc::new(MockRunner::ok()));
    opts.store.set("x", b"X".to_vec()).unwrap();

    let transformer = Transformer::Join {
      inputs: vec!["x".to_string(), "absent".to_string()],
      output: "joined".to_string(),
      join: Join::default(),
    };
    let err = run(&transformer, &opts).await.unwrap_err();
    match err {
      TaskError::MissingInput { path } => assert_eq!(path, "absent"),
      other => panic!("unexpected error: {other}"),
    }
  }

  #[tokio::test]
  async fn kustomize_materializes_build_directory() {
    let temp = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::new(|req: &RunRequest| {
      let dir = std::path::Path::new(req.args.last().unwrap());
      assert!(dir.join("kustomization.yaml").exists());
      assert!(dir.join("manifest.yaml").exists());
      assert!(dir.join("patches/labels.yaml").exists());
      Ok(RunOutput {
        stdout: b"kustomized\n".to_vec(),
        stderr: Vec::new(),
      })
    }));
    let opts = opts(&temp, runner.clone());
    opts.store.set("manifest.yaml", b"kind: Pod\n".to_vec()).unwrap();

    let transformer: Transformer = serde_json::from_value(serde_json::json!({
      "kind": "Kustomize",
      "inputs": ["manifest.yaml"],
      "output": "out.yaml",
      "kustomize": {
        "kustomization": {"resources": ["manifest.yaml"], "commonLabels": {"app": "x"}},
        "files": {"patches/labels.yaml": "kind: Patch\n"}
      }
    }))
    .unwrap();

    run(&transformer, &opts).await.unwrap();
    assert_eq!(opts.store.get("out.yaml").unwrap(), b"kustomized\n");
    assert!(runner.calls()[0].starts_with("kubectl 'kustomize'"));
  }

  #[tokio::test]
  async fn command_transformer_sees_inputs_on_disk() {
    let temp = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::new(|_| {
      Ok(RunOutput {
        stdout: b"combined\n".to_vec(),
        stderr: Vec::new(),
      })
    }));
    let opts = opts(&temp, runner);
    opts.store.set("in.yaml", b"input\n".to_vec()).unwrap();

    let transformer = Transformer::Command {
      inputs: vec!["in.yaml".to_string()],
      output: "out.yaml".to_string(),
      command: crate::plan::CommandSpec {
        display_name: String::new(),
        args: vec!["combine".to_string()],
        is_stdout_output: true,
      },
    };
    run(&transformer, &opts).await.unwrap();

    assert_eq!(std::fs::read(opts.scratch.join("in.yaml")).unwrap(), b"input\n");
    assert_eq!(opts.store.get("out.yaml").unwrap(), b"combined\n");
  }
}

//! Generator tasks: produce named intermediate content into the store.

use std::path::Path;

use tracing::debug;

use super::{BuildOpts, TaskError};
use crate::plan::{CommandSpec, Generator, Helm, Resources};
use crate::runner::RunRequest;

pub(super) async fn run(generator: &Generator, opts: &BuildOpts) -> Result<(), TaskError> {
  match generator {
    Generator::Resources { output, resources } => {
      let content = render_resources(resources)?;
      opts.store.set(output, content.into_bytes())?;
      Ok(())
    }
    Generator::File { output, file } => {
      let source = opts.leaf_dir().join(&file.source);
      let data = std::fs::read(&source).map_err(|err| TaskError::Io {
        action: "read",
        path: source,
        source: err,
      })?;
      opts.store.set(output, data)?;
      Ok(())
    }
    Generator::Helm { output, helm } => {
      let content = render_helm(helm, opts).await?;
      opts.store.set(output, content)?;
      Ok(())
    }
    Generator::Command { output, command } => run_command(output, command, opts).await,
    Generator::Unknown => Err(TaskError::UnknownKind),
  }
}

/// Flattens the kind → label → object table into a multi-document YAML
/// stream. BTreeMap iteration keeps the order deterministic.
fn render_resources(resources: &Resources) -> Result<String, TaskError> {
  let mut docs = Vec::new();
  for objects in resources.values() {
    for object in objects.values() {
      docs.push(serde_yaml::to_string(object)?);
    }
  }
  Ok(docs.join("---\n"))
}

/// Renders a chart with `helm template` against the cached chart directory.
///
/// Values files are written into a private scratch directory and passed in
/// declared order, the inline values last so they take precedence.
async fn render_helm(helm: &Helm, opts: &BuildOpts) -> Result<Vec<u8>, TaskError> {
  let chart_dir = opts.charts.ensure_cached(&helm.chart).await?;

  let values_dir = tempfile::tempdir_in(&opts.scratch).map_err(|err| TaskError::Io {
    action: "create directory",
    path: opts.scratch.clone(),
    source: err,
  })?;

  let mut req = RunRequest::new("helm").arg("template").arg("--include-crds");
  if !helm.enable_hooks {
    req = req.arg("--no-hooks");
  }
  for version in &helm.api_versions {
    req = req.arg("--api-versions").arg(version);
  }
  if !helm.kube_version.is_empty() {
    req = req.arg("--kube-version").arg(&helm.kube_version);
  }
  for value_file in &helm.value_files {
    let path = values_dir.path().join(&value_file.name);
    write_yaml(&path, &value_file.values)?;
    req = req.arg("--values").arg(path.to_string_lossy().into_owned());
  }
  let inline = values_dir.path().join("values.yaml");
  write_yaml(&inline, &helm.values)?;
  req = req.arg("--values").arg(inline.to_string_lossy().into_owned());
  if !helm.namespace.is_empty() {
    req = req.arg("--namespace").arg(&helm.namespace);
  }
  // Rendering must not touch a live cluster.
  req = req
    .arg("--kubeconfig")
    .arg("/dev/null")
    .arg("--version")
    .arg(&helm.chart.version)
    .arg(helm.chart.release())
    .arg(chart_dir.to_string_lossy().into_owned())
    .cwd(&opts.root);

  let output = opts.runner.run(req).await?;
  Ok(output.stdout)
}

fn write_yaml(path: &Path, value: &serde_json::Value) -> Result<(), TaskError> {
  let content = serde_yaml::to_string(value)?;
  std::fs::write(path, content).map_err(|err| TaskError::Io {
    action: "write",
    path: path.to_path_buf(),
    source: err,
  })
}

/// Runs an arbitrary command. Output either comes from stdout or from files
/// the command wrote under the scratch directory at the declared path.
pub(super) async fn run_command(output: &str, command: &CommandSpec, opts: &BuildOpts) -> Result<(), TaskError> {
  let Some((program, args)) = command.args.split_first() else {
    return Err(TaskError::MissingInput {
      path: "command args".to_string(),
    });
  };
  let name = if command.display_name.is_empty() {
    program.as_str()
  } else {
    command.display_name.as_str()
  };
  debug!(command = %name, %output, "running command step");

  let req = RunRequest::new(program).args(args.iter().cloned()).cwd(&opts.root);
  let out = opts.runner.run(req).await?;

  if command.is_stdout_output {
    opts.store.set(output, out.stdout)?;
  } else {
    opts.store.load(&opts.scratch, output)?;
  }
  Ok(())
}

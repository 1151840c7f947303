//! BuildPlan schema types.
//!
//! Wire format produced by the external configuration-evaluation engine.
//! Generators, transformers, and validators are tagged unions discriminated
//! on `kind`; unrecognized kinds deserialize to an `Unknown` variant and are
//! rejected at dispatch time so the error can name the offending artifact
//! and step.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading or discriminating a build plan.
#[derive(Debug, Error)]
pub enum PlanError {
  #[error("could not read {}: {source}", path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("could not parse build plan: {0}")]
  ParseJson(#[from] serde_json::Error),

  #[error("could not parse build plan: {0}")]
  ParseYaml(#[from] serde_yaml::Error),

  #[error("unsupported kind: {kind}, want BuildPlan")]
  UnsupportedKind { kind: String },
}

/// One component's unit of work: the artifacts to render.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildPlan {
  pub kind: String,
  pub api_version: String,
  pub metadata: Metadata,
  #[serde(default)]
  pub spec: BuildPlanSpec,
}

impl BuildPlan {
  /// Parses a plan from JSON, rejecting non-BuildPlan documents.
  pub fn from_json_slice(data: &[u8]) -> Result<Self, PlanError> {
    let plan: Self = serde_json::from_slice(data)?;
    plan.check_kind()
  }

  /// Loads a plan from a JSON or YAML file, selected by extension.
  pub fn from_file(path: &Path) -> Result<Self, PlanError> {
    let data = std::fs::read(path).map_err(|source| PlanError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let plan: Self = match path.extension().and_then(|e| e.to_str()) {
      Some("yaml") | Some("yml") => serde_yaml::from_slice(&data)?,
      _ => serde_json::from_slice(&data)?,
    };
    plan.check_kind()
  }

  fn check_kind(self) -> Result<Self, PlanError> {
    if self.kind != "BuildPlan" {
      return Err(PlanError::UnsupportedKind { kind: self.kind });
    }
    Ok(self)
  }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Metadata {
  pub name: String,
  #[serde(default)]
  pub labels: BTreeMap<String, String>,
  #[serde(default)]
  pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BuildPlanSpec {
  #[serde(default)]
  pub disabled: bool,
  #[serde(default)]
  pub artifacts: Vec<Artifact>,
}

/// One target output file plus the pipeline producing it.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Artifact {
  /// Output path of the final rendered content, relative to the write-to
  /// directory.
  #[serde(default)]
  pub artifact: String,
  #[serde(default)]
  pub skip: bool,
  #[serde(default)]
  pub generators: Vec<Generator>,
  #[serde(default)]
  pub transformers: Vec<Transformer>,
  #[serde(default)]
  pub validators: Vec<Validator>,
}

/// Kind → label → object table, flattened to a list in deterministic order.
pub type Resources = BTreeMap<String, BTreeMap<String, serde_json::Value>>;

/// Pipeline step producing one named output.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind")]
pub enum Generator {
  Resources {
    output: String,
    #[serde(default)]
    resources: Resources,
  },
  Helm {
    output: String,
    helm: Helm,
  },
  File {
    output: String,
    file: FileSource,
  },
  Command {
    output: String,
    command: CommandSpec,
  },
  #[serde(other)]
  Unknown,
}

impl Generator {
  pub fn output(&self) -> Option<&str> {
    match self {
      Self::Resources { output, .. }
      | Self::Helm { output, .. }
      | Self::File { output, .. }
      | Self::Command { output, .. } => Some(output),
      Self::Unknown => None,
    }
  }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileSource {
  /// Path to copy, relative to the component directory.
  pub source: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Helm {
  pub chart: Chart,
  #[serde(default = "empty_object")]
  pub values: serde_json::Value,
  #[serde(default)]
  pub value_files: Vec<ValueFile>,
  #[serde(default)]
  pub enable_hooks: bool,
  #[serde(default)]
  pub namespace: String,
  #[serde(default)]
  pub api_versions: Vec<String>,
  #[serde(default)]
  pub kube_version: String,
}

fn empty_object() -> serde_json::Value {
  serde_json::Value::Object(serde_json::Map::new())
}

/// An extra values file passed to the renderer before the final values.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValueFile {
  pub name: String,
  pub kind: String,
  #[serde(default = "empty_object")]
  pub values: serde_json::Value,
}

/// Chart identity: cache entries are keyed by (name, version).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Chart {
  pub name: String,
  pub version: String,
  #[serde(default)]
  pub release: String,
  #[serde(default)]
  pub repository: Repository,
}

impl Chart {
  /// Base name of the chart, the final path segment of `name`.
  pub fn base_name(&self) -> &str {
    self.name.rsplit('/').next().unwrap_or(&self.name)
  }

  /// Release name, defaulting to the chart base name.
  pub fn release(&self) -> &str {
    if self.release.is_empty() {
      self.base_name()
    } else {
      &self.release
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Repository {
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub url: String,
  #[serde(default)]
  pub auth: Auth,
}

impl Repository {
  /// OCI repositories are pulled directly, without repo registration.
  pub fn is_oci(&self) -> bool {
    self.url.starts_with("oci://")
  }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Auth {
  #[serde(default)]
  pub username: AuthSource,
  #[serde(default)]
  pub password: AuthSource,
}

/// Credential source: an inline value or an environment variable name.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSource {
  #[serde(default)]
  pub value: String,
  #[serde(default)]
  pub from_env: String,
}

impl AuthSource {
  pub fn resolve(&self) -> Option<String> {
    if !self.value.is_empty() {
      return Some(self.value.clone());
    }
    if !self.from_env.is_empty() {
      return std::env::var(&self.from_env).ok();
    }
    None
  }
}

/// Pipeline step combining prior named outputs into a new one.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind")]
pub enum Transformer {
  Kustomize {
    #[serde(default)]
    inputs: Vec<String>,
    output: String,
    kustomize: Kustomize,
  },
  Join {
    #[serde(default)]
    inputs: Vec<String>,
    output: String,
    #[serde(default)]
    join: Join,
  },
  Command {
    #[serde(default)]
    inputs: Vec<String>,
    output: String,
    command: CommandSpec,
  },
  #[serde(other)]
  Unknown,
}

impl Transformer {
  pub fn output(&self) -> Option<&str> {
    match self {
      Self::Kustomize { output, .. } | Self::Join { output, .. } | Self::Command { output, .. } => Some(output),
      Self::Unknown => None,
    }
  }
}

/// Post-processing manifest plus auxiliary files materialized next to it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Kustomize {
  pub kustomization: serde_json::Value,
  #[serde(default)]
  pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Join {
  #[serde(default = "default_separator")]
  pub separator: String,
}

impl Default for Join {
  fn default() -> Self {
    Self {
      separator: default_separator(),
    }
  }
}

fn default_separator() -> String {
  "---\n".to_string()
}

/// Pipeline step checking prior outputs without producing new ones.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind")]
pub enum Validator {
  Command {
    #[serde(default)]
    inputs: Vec<String>,
    command: CommandSpec,
  },
  #[serde(other)]
  Unknown,
}

/// External command line for Command generators/transformers/validators.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
  #[serde(default)]
  pub display_name: String,
  #[serde(default)]
  pub args: Vec<String>,
  /// When set, standard output is written to the declared output path in
  /// the build temp directory before loading it into the store.
  #[serde(default)]
  pub is_stdout_output: bool,
}

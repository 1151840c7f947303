//! Platform schema and the component build scheduler.
//!
//! A platform lists components, each pointing at a directory the evaluation
//! engine turns into a BuildPlan. Rendering filters components through
//! label selectors, then runs one isolated build per selected component
//! under a concurrency ceiling. A build failure aborts the remaining
//! builds.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::chart::{ChartCache, ChartFetcher};
use crate::eval::{BuildContext, EvalError, Evaluator};
use crate::exec::{self, BuildError, BuildOpts};
use crate::plan::PlanError;
use crate::runner::CommandRunner;
use crate::store::ArtifactStore;

/// Errors from platform loading or rendering.
#[derive(Debug, Error)]
pub enum PlatformError {
  #[error("could not read {}: {source}", path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("could not parse platform: {0}")]
  Parse(#[from] serde_yaml::Error),

  #[error("unsupported kind: {kind}, want Platform")]
  UnsupportedKind { kind: String },

  #[error("invalid selector term: {term}")]
  Selector { term: String },

  #[error("could not evaluate component {name}: {source}")]
  Eval {
    name: String,
    #[source]
    source: EvalError,
  },

  #[error("could not load plan: {0}")]
  Plan(#[from] PlanError),

  #[error("could not build component {name}: {source}")]
  Component {
    name: String,
    #[source]
    source: BuildError,
  },

  #[error("could not {action} {}: {source}", path.display())]
  Io {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  /// The render was aborted because a sibling component failed.
  #[error("platform render canceled")]
  Canceled,

  #[error("component build panicked: {0}")]
  Panic(String),
}

/// Collection of components rendered together.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
  pub kind: String,
  pub api_version: String,
  pub metadata: crate::plan::Metadata,
  #[serde(default)]
  pub spec: PlatformSpec,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PlatformSpec {
  #[serde(default)]
  pub components: Vec<Component>,
}

/// One component: a directory the evaluation engine renders a plan from.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Component {
  pub name: String,
  /// Directory relative to the platform root.
  pub path: String,
  /// Key/value pairs injected into the evaluation as tags.
  #[serde(default)]
  pub parameters: BTreeMap<String, String>,
  #[serde(default)]
  pub labels: BTreeMap<String, String>,
  #[serde(default)]
  pub annotations: BTreeMap<String, String>,
}

impl Component {
  /// Tags forwarded to the evaluation engine: declared parameters plus the
  /// component's own name and path.
  pub fn tags(&self) -> Vec<String> {
    let mut tags: Vec<String> = self
      .parameters
      .iter()
      .map(|(k, v)| format!("{k}={v}"))
      .collect();
    tags.push(format!("component_name={}", self.name));
    tags.push(format!("component_path={}", self.path));
    tags
  }
}

impl Platform {
  /// Loads a platform from a JSON or YAML file, selected by extension.
  pub fn from_file(path: &Path) -> Result<Self, PlatformError> {
    let data = std::fs::read(path).map_err(|source| PlatformError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    // YAML is a superset of JSON, so one parser covers both extensions.
    let platform: Self = serde_yaml::from_slice(&data)?;
    if platform.kind != "Platform" {
      return Err(PlatformError::UnsupportedKind {
        kind: platform.kind,
      });
    }
    Ok(platform)
  }

  /// Components matching every selector. No selectors selects everything.
  pub fn select<'a>(&'a self, selectors: &[Selector]) -> Vec<&'a Component> {
    self
      .spec
      .components
      .iter()
      .filter(|c| selectors.iter().all(|s| s.is_selected(&c.labels)))
      .collect()
  }
}

/// Label selector: comma-separated `k=v`, `k==v`, and `k!=v` terms.
#[derive(Debug, Clone, Default)]
pub struct Selector {
  positive: BTreeMap<String, String>,
  negative: BTreeMap<String, String>,
}

impl Selector {
  /// True when every positive term matches and no negative term does.
  /// An absent label satisfies a negative term.
  pub fn is_selected(&self, labels: &BTreeMap<String, String>) -> bool {
    let positive = self
      .positive
      .iter()
      .all(|(k, v)| labels.get(k) == Some(v));
    let negative = self
      .negative
      .iter()
      .all(|(k, v)| labels.get(k) != Some(v));
    positive && negative
  }
}

impl FromStr for Selector {
  type Err = PlatformError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut selector = Self::default();
    for term in s.split(',') {
      let term = term.trim();
      if term.is_empty() {
        continue;
      }
      if let Some((k, v)) = term.split_once("!=") {
        selector.negative.insert(k.trim().to_string(), v.trim().to_string());
      } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
        if k.is_empty() || v.contains('=') {
          return Err(PlatformError::Selector {
            term: term.to_string(),
          });
        }
        selector.positive.insert(k.trim().to_string(), v.trim().to_string());
      } else {
        return Err(PlatformError::Selector {
          term: term.to_string(),
        });
      }
    }
    Ok(selector)
  }
}

/// Collaborators and limits for one platform render.
pub struct RenderOpts {
  pub runner: Arc<dyn CommandRunner>,
  pub evaluator: Arc<Evaluator>,
  pub fetcher: Arc<dyn ChartFetcher>,
  /// Platform root directory, resolved to an absolute path by the caller.
  pub root: PathBuf,
  pub write_to: PathBuf,
  pub selectors: Vec<Selector>,
  /// Component builds in flight at once.
  pub build_concurrency: usize,
  /// Leaf task ceiling inside each component build.
  pub task_concurrency: usize,
}

/// Renders every selected component of `platform`.
///
/// Each component gets a fresh store and scratch directory; the chart
/// cache lives in the component directory so it persists across renders.
pub async fn render(platform: &Platform, opts: &RenderOpts) -> Result<(), PlatformError> {
  let started = Instant::now();
  let selected = platform.select(&opts.selectors);
  info!(
    platform = %platform.metadata.name,
    components = platform.spec.components.len(),
    selected = selected.len(),
    "rendering platform"
  );

  let semaphore = Arc::new(Semaphore::new(opts.build_concurrency.max(1)));
  let mut builds = JoinSet::new();
  for component in selected.into_iter().cloned() {
    let semaphore = semaphore.clone();
    let runner = opts.runner.clone();
    let evaluator = opts.evaluator.clone();
    let fetcher = opts.fetcher.clone();
    let root = opts.root.clone();
    let write_to = opts.write_to.clone();
    let task_concurrency = opts.task_concurrency;
    builds.spawn(async move {
      let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|_| PlatformError::Canceled)?;
      build_component(
        component,
        runner,
        evaluator,
        fetcher,
        root,
        write_to,
        task_concurrency,
      )
      .await
    });
  }

  let mut first: Option<PlatformError> = None;
  while let Some(joined) = builds.join_next().await {
    match joined {
      Ok(Ok(())) => {}
      Ok(Err(err)) => {
        if first.is_none() {
          first = Some(err);
          semaphore.close();
          builds.abort_all();
        }
      }
      Err(err) if err.is_cancelled() => {}
      Err(err) => {
        if first.is_none() {
          first = Some(PlatformError::Panic(err.to_string()));
          semaphore.close();
          builds.abort_all();
        }
      }
    }
  }
  if let Some(err) = first {
    return Err(err);
  }

  info!(platform = %platform.metadata.name, duration = ?started.elapsed(), "rendered platform");
  Ok(())
}

async fn build_component(
  component: Component,
  runner: Arc<dyn CommandRunner>,
  evaluator: Arc<Evaluator>,
  fetcher: Arc<dyn ChartFetcher>,
  root: PathBuf,
  write_to: PathBuf,
  task_concurrency: usize,
) -> Result<(), PlatformError> {
  let started = Instant::now();
  debug!(component = %component.name, path = %component.path, "building component");

  // Scratch exists before evaluation so the plan can reference it through
  // the build-context tag, e.g. in Command argument lists.
  let scratch = tempfile::tempdir().map_err(|source| PlatformError::Io {
    action: "create scratch directory",
    path: std::env::temp_dir(),
    source,
  })?;

  let eval_err = |source| PlatformError::Eval {
    name: component.name.clone(),
    source,
  };
  let mut tags = component.tags();
  tags.push(BuildContext::new(scratch.path()).tag().map_err(eval_err)?);

  let plan = evaluator
    .evaluate(&root, &component.path, &tags)
    .await
    .map_err(|source| PlatformError::Eval {
      name: component.name.clone(),
      source,
    })?;

  let build_opts = BuildOpts {
    store: Arc::new(ArtifactStore::new()),
    runner,
    charts: Arc::new(ChartCache::new(root.join(&component.path), fetcher)),
    root,
    leaf: component.path.clone(),
    write_to,
    scratch: scratch.path().to_path_buf(),
    concurrency: task_concurrency,
  };
  exec::build(&plan, &build_opts)
    .await
    .map_err(|source| PlatformError::Component {
      name: component.name.clone(),
      source,
    })?;

  info!(component = %component.name, duration = ?started.elapsed(), "rendered component");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chart::ChartError;
  use crate::runner::mock::MockRunner;
  use crate::runner::{RunOutput, RunRequest};
  use async_trait::async_trait;
  use tempfile::TempDir;

  struct NoFetcher;

  #[async_trait]
  impl ChartFetcher for NoFetcher {
    async fn fetch(&self, _chart: &crate::plan::Chart, _dest: &Path) -> Result<(), ChartError> {
      panic!("unexpected chart fetch");
    }
  }

  fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect()
  }

  #[test]
  fn selector_parses_all_operator_forms() {
    let selector: Selector = "app=web, tier==frontend, env!=prod".parse().unwrap();
    assert!(selector.is_selected(&labels(&[("app", "web"), ("tier", "frontend"), ("env", "dev")])));
    assert!(!selector.is_selected(&labels(&[("app", "web"), ("tier", "frontend"), ("env", "prod")])));
    assert!(!selector.is_selected(&labels(&[("app", "api"), ("tier", "frontend")])));
  }

  #[test]
  fn negative_term_matches_absent_label() {
    let selector: Selector = "env!=prod".parse().unwrap();
    assert!(selector.is_selected(&BTreeMap::new()));
  }

  #[test]
  fn bare_word_is_an_invalid_selector() {
    let err = "justaword".parse::<Selector>().unwrap_err();
    assert!(matches!(err, PlatformError::Selector { .. }));
  }

  #[test]
  fn select_filters_components_by_all_selectors() {
    let platform = Platform {
      kind: "Platform".to_string(),
      api_version: "v1".to_string(),
      metadata: crate::plan::Metadata::default(),
      spec: PlatformSpec {
        components: vec![
          Component {
            name: "web".to_string(),
            path: "components/web".to_string(),
            labels: labels(&[("app", "web"), ("env", "dev")]),
            ..Component::default()
          },
          Component {
            name: "db".to_string(),
            path: "components/db".to_string(),
            labels: labels(&[("app", "db"), ("env", "prod")]),
            ..Component::default()
          },
        ],
      },
    };

    let selectors = vec!["env!=prod".parse().unwrap()];
    let selected = platform.select(&selectors);
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].name, "web");

    assert_eq!(platform.select(&[]).len(), 2);
  }

  #[test]
  fn component_tags_include_identity() {
    let component = Component {
      name: "web".to_string(),
      path: "components/web".to_string(),
      parameters: labels(&[("cluster", "dev")]),
      ..Component::default()
    };
    let tags = component.tags();
    assert!(tags.contains(&"cluster=dev".to_string()));
    assert!(tags.contains(&"component_name=web".to_string()));
    assert!(tags.contains(&"component_path=components/web".to_string()));
  }

  #[test]
  fn from_file_rejects_non_platform_kind() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("platform.yaml");
    std::fs::write(&path, "kind: BuildPlan\napiVersion: v1\nmetadata:\n  name: x\n").unwrap();
    let err = Platform::from_file(&path).unwrap_err();
    assert!(matches!(err, PlatformError::UnsupportedKind { .. }));
  }

  fn plan_json(name: &str) -> String {
    serde_json::json!({
      "kind": "BuildPlan",
      "apiVersion": "v1",
      "metadata": {"name": name},
      "spec": {"artifacts": [{
        "artifact": format!("{name}.yaml"),
        "generators": [{"kind": "Resources", "output": format!("{name}.yaml"), "resources": {
          "Namespace": {name: {"kind": "Namespace", "metadata": {"name": name}}}
        }}]
      }]}
    })
    .to_string()
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn command_generator_writes_through_build_context_temp_dir() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("platform");
    let write_to = temp.path().join("deploy");
    std::fs::create_dir_all(root.join("components/app")).unwrap();

    // The evaluation engine reads the injected build context and embeds the
    // managed temp dir in the generator's argv; the command writes its
    // output there instead of capturing stdout.
    let runner = Arc::new(MockRunner::new(|req: &RunRequest| {
      if req.program == "render-plan" {
        let tag = req
          .args
          .iter()
          .find_map(|a| a.strip_prefix("build_context="))
          .expect("missing build context tag");
        let context: serde_json::Value = serde_json::from_str(tag).unwrap();
        let out = format!("{}/out.yaml", context["tempDir"].as_str().unwrap());
        let plan = serde_json::json!({
          "kind": "BuildPlan",
          "apiVersion": "v1",
          "metadata": {"name": "app"},
          "spec": {"artifacts": [{
            "artifact": "out.yaml",
            "generators": [{"kind": "Command", "output": "out.yaml",
              "command": {"args": ["write-out", out], "isStdoutOutput": false}}]
          }]}
        });
        Ok(RunOutput {
          stdout: plan.to_string().into_bytes(),
          stderr: Vec::new(),
        })
      } else {
        std::fs::write(&req.args[0], b"written out of band\n").unwrap();
        Ok(RunOutput::default())
      }
    }));

    let platform = Platform {
      kind: "Platform".to_string(),
      api_version: "v1".to_string(),
      metadata: crate::plan::Metadata {
        name: "test".to_string(),
        ..crate::plan::Metadata::default()
      },
      spec: PlatformSpec {
        components: vec![Component {
          name: "app".to_string(),
          path: "components/app".to_string(),
          ..Component::default()
        }],
      },
    };

    let opts = RenderOpts {
      runner: runner.clone(),
      evaluator: Arc::new(Evaluator::new("render-plan", Vec::new(), runner.clone())),
      fetcher: Arc::new(NoFetcher),
      root,
      write_to: write_to.clone(),
      selectors: Vec::new(),
      build_concurrency: 1,
      task_concurrency: 1,
    };

    render(&platform, &opts).await.unwrap();
    assert_eq!(
      std::fs::read(write_to.join("out.yaml")).unwrap(),
      b"written out of band\n"
    );
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn render_builds_selected_components() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("platform");
    let write_to = temp.path().join("deploy");
    std::fs::create_dir_all(root.join("components/web")).unwrap();
    std::fs::create_dir_all(root.join("components/db")).unwrap();

    // The evaluator runs with the component path as its final positional
    // argument before any injected tags.
    let runner = Arc::new(MockRunner::new(|req: &RunRequest| {
      let name = if req.args.iter().any(|a| a.contains("web")) {
        "web"
      } else {
        "db"
      };
      Ok(RunOutput {
        stdout: plan_json(name).into_bytes(),
        stderr: Vec::new(),
      })
    }));

    let platform = Platform {
      kind: "Platform".to_string(),
      api_version: "v1".to_string(),
      metadata: crate::plan::Metadata {
        name: "test".to_string(),
        ..crate::plan::Metadata::default()
      },
      spec: PlatformSpec {
        components: vec![
          Component {
            name: "web".to_string(),
            path: "components/web".to_string(),
            labels: labels(&[("env", "dev")]),
            ..Component::default()
          },
          Component {
            name: "db".to_string(),
            path: "components/db".to_string(),
            labels: labels(&[("env", "prod")]),
            ..Component::default()
          },
        ],
      },
    };

    let opts = RenderOpts {
      runner: runner.clone(),
      evaluator: Arc::new(Evaluator::new("render-plan", Vec::new(), runner.clone())),
      fetcher: Arc::new(NoFetcher),
      root,
      write_to: write_to.clone(),
      selectors: vec!["env=dev".parse().unwrap()],
      build_concurrency: 2,
      task_concurrency: 2,
    };

    render(&platform, &opts).await.unwrap();
    assert!(write_to.join("web.yaml").exists());
    assert!(!write_to.join("db.yaml").exists());
  }
}

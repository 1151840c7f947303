use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use owo_colors::OwoColorize;
use tracing::debug;

use manifold_lib::chart::{ChartCache, HelmFetcher};
use manifold_lib::eval::Evaluator;
use manifold_lib::exec::{self, BuildError, BuildOpts};
use manifold_lib::platform::{self, PlatformError, RenderOpts, Selector};
use manifold_lib::runner::ExecRunner;
use manifold_lib::store::ArtifactStore;
use manifold_lib::{BuildPlan, Platform, build};

#[derive(Subcommand)]
pub enum RenderCommand {
  /// Render every selected component of a platform
  Platform(PlatformArgs),

  /// Render one component from a BuildPlan file
  Component(ComponentArgs),
}

#[derive(Args)]
pub struct PlatformArgs {
  /// Platform manifest (json or yaml)
  #[arg(default_value = "platform.yaml")]
  platform: PathBuf,

  /// Label selector (k=v, k==v, k!=v terms, comma separated), repeatable
  #[arg(short = 'l', long = "selector")]
  selectors: Vec<String>,

  /// Directory rendered artifacts are written under, relative to the
  /// platform root
  #[arg(long, env = "MANIFOLD_WRITE_TO", default_value = "deploy")]
  write_to: PathBuf,

  /// Concurrent component builds
  #[arg(long, default_value_t = exec::default_concurrency())]
  build_concurrency: usize,

  /// Concurrent tasks within one component build
  #[arg(long, default_value_t = exec::default_concurrency())]
  concurrency: usize,

  /// Evaluation engine producing BuildPlan JSON on stdout
  #[arg(long, env = "MANIFOLD_EVALUATOR", default_value = "manifold-eval")]
  evaluator: String,

  /// Extra key=value tag injected into every evaluation, repeatable
  #[arg(long = "inject", value_name = "KEY=VALUE")]
  injects: Vec<String>,
}

#[derive(Args)]
pub struct ComponentArgs {
  /// BuildPlan file (json or yaml)
  plan: PathBuf,

  /// Directory rendered artifacts are written under
  #[arg(long, env = "MANIFOLD_WRITE_TO", default_value = "deploy")]
  write_to: PathBuf,

  /// Concurrent tasks within the build
  #[arg(long, default_value_t = exec::default_concurrency())]
  concurrency: usize,
}

pub async fn run(command: RenderCommand) -> Result<()> {
  match command {
    RenderCommand::Platform(args) => render_platform(args).await,
    RenderCommand::Component(args) => render_component(args).await,
  }
}

async fn render_platform(args: PlatformArgs) -> Result<()> {
  let started = Instant::now();

  let platform_file = std::path::absolute(&args.platform)
    .with_context(|| format!("could not resolve {}", args.platform.display()))?;
  let root = platform_file
    .parent()
    .map(Path::to_path_buf)
    .unwrap_or_else(|| PathBuf::from("/"));

  debug!(root = %root.display(), "resolved platform root");
  let platform = Platform::from_file(&platform_file)?;
  let selectors = args
    .selectors
    .iter()
    .map(|s| s.parse::<Selector>())
    .collect::<Result<Vec<_>, _>>()?;

  let runner = Arc::new(ExecRunner);
  let evaluator_args = args
    .injects
    .iter()
    .flat_map(|tag| ["--inject".to_string(), tag.clone()])
    .collect();
  let opts = RenderOpts {
    runner: runner.clone(),
    evaluator: Arc::new(Evaluator::new(&args.evaluator, evaluator_args, runner.clone())),
    fetcher: Arc::new(HelmFetcher::new(runner)),
    root: root.clone(),
    write_to: absolute_under(&root, &args.write_to),
    selectors,
    build_concurrency: args.build_concurrency,
    task_concurrency: args.concurrency,
  };

  let selected = platform.select(&opts.selectors).len();
  match platform::render(&platform, &opts).await {
    Ok(()) => {
      eprintln!(
        "{} Rendered {} component(s) in {}",
        "::".green().bold(),
        selected,
        humantime::format_duration(round_ms(started.elapsed()))
      );
      Ok(())
    }
    Err(PlatformError::Canceled) => canceled(),
    Err(err) => Err(err.into()),
  }
}

async fn render_component(args: ComponentArgs) -> Result<()> {
  let started = Instant::now();

  let plan_file = std::path::absolute(&args.plan)
    .with_context(|| format!("could not resolve {}", args.plan.display()))?;
  let plan = BuildPlan::from_file(&plan_file)?;

  let root = std::path::absolute(".").context("could not resolve working directory")?;
  let leaf_dir = plan_file
    .parent()
    .map(Path::to_path_buf)
    .unwrap_or_else(|| root.clone());
  let leaf = leaf_dir
    .strip_prefix(&root)
    .unwrap_or(&leaf_dir)
    .to_string_lossy()
    .into_owned();

  let runner = Arc::new(ExecRunner);
  let scratch = tempfile::tempdir().context("could not create scratch directory")?;
  let opts = BuildOpts {
    store: Arc::new(ArtifactStore::new()),
    runner: runner.clone(),
    charts: Arc::new(ChartCache::new(&leaf_dir, Arc::new(HelmFetcher::new(runner)))),
    root: root.clone(),
    leaf,
    write_to: absolute_under(&root, &args.write_to),
    scratch: scratch.path().to_path_buf(),
    concurrency: args.concurrency,
  };

  match build(&plan, &opts).await {
    Ok(()) => {
      eprintln!(
        "{} Rendered {} in {}",
        "::".green().bold(),
        plan.metadata.name,
        humantime::format_duration(round_ms(started.elapsed()))
      );
      Ok(())
    }
    Err(BuildError::Canceled) => canceled(),
    Err(err) => Err(err.into()),
  }
}

fn absolute_under(root: &Path, path: &Path) -> PathBuf {
  if path.is_absolute() {
    path.to_path_buf()
  } else {
    root.join(path)
  }
}

fn round_ms(duration: Duration) -> Duration {
  Duration::from_millis(duration.as_millis() as u64)
}

/// Cancellation gets its own exit code so wrappers can tell an aborted
/// render from a failed one.
fn canceled() -> Result<()> {
  eprintln!("{} Render canceled", "::".yellow().bold());
  std::process::exit(2);
}

/// Ctrl-C takes the same exit path as an internally canceled render.
pub fn interrupted() -> Result<()> {
  canceled()
}

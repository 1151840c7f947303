use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;

/// manifold - render platform BuildPlans into GitOps artifacts
#[derive(Parser)]
#[command(name = "manifold")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Render a platform or a single component
  Render {
    #[command(subcommand)]
    target: cmd::render::RenderCommand,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_filter = if cli.verbose { "debug" } else { "info" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let runtime = tokio::runtime::Runtime::new()?;
  match cli.command {
    Commands::Render { target } => runtime.block_on(async {
      tokio::select! {
        result = cmd::render::run(target) => result,
        _ = tokio::signal::ctrl_c() => cmd::render::interrupted(),
      }
    }),
  }
}

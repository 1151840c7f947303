//! Subprocess execution with captured output.
//!
//! Every external renderer invocation goes through the [`CommandRunner`]
//! trait so tests can inject a mock. The production [`ExecRunner`] captures
//! stdout and stderr, logs the argv at debug level, and folds conventional
//! `Error:`-prefixed stderr lines into the failure message.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors from running an external command.
#[derive(Debug, Error)]
pub enum RunError {
  #[error("could not run {command}: {source}")]
  Spawn {
    command: String,
    #[source]
    source: std::io::Error,
  },

  /// Non-zero exit. `detail` holds `Error:`-prefixed stderr lines, when any.
  #[error("command failed:\n\t{command}\n\texit {code:?}{detail}")]
  Failed {
    command: String,
    code: Option<i32>,
    detail: String,
    stderr: String,
  },
}

/// A command to run: program, arguments, optional working directory.
#[derive(Debug, Clone)]
pub struct RunRequest {
  pub program: String,
  pub args: Vec<String>,
  pub cwd: Option<PathBuf>,
}

impl RunRequest {
  pub fn new(program: impl Into<String>) -> Self {
    Self {
      program: program.into(),
      args: Vec::new(),
      cwd: None,
    }
  }

  pub fn arg(mut self, arg: impl Into<String>) -> Self {
    self.args.push(arg.into());
    self
  }

  pub fn args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.args.extend(args.into_iter().map(Into::into));
    self
  }

  pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
    self.cwd = Some(dir.into());
    self
  }

  /// Single-quoted argv for log and error messages.
  pub fn display(&self) -> String {
    if self.args.is_empty() {
      self.program.clone()
    } else {
      format!("{} '{}'", self.program, self.args.join("' '"))
    }
  }
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
  pub stdout: Vec<u8>,
  pub stderr: Vec<u8>,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
  async fn run(&self, req: RunRequest) -> Result<RunOutput, RunError>;
}

/// Runs commands as real child processes.
#[derive(Debug, Default)]
pub struct ExecRunner;

#[async_trait]
impl CommandRunner for ExecRunner {
  async fn run(&self, req: RunRequest) -> Result<RunOutput, RunError> {
    let command = req.display();
    debug!(%command, cwd = ?req.cwd, "running command");

    let mut cmd = Command::new(&req.program);
    cmd.args(&req.args).stdin(Stdio::null()).kill_on_drop(true);
    if let Some(dir) = &req.cwd {
      cmd.current_dir(dir);
    }

    let output = cmd.output().await.map_err(|source| RunError::Spawn {
      command: command.clone(),
      source,
    })?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
      let detail = fold_error_lines(&stderr);
      return Err(RunError::Failed {
        command,
        code: output.status.code(),
        detail,
        stderr,
      });
    }

    Ok(RunOutput {
      stdout: output.stdout,
      stderr: output.stderr,
    })
  }
}

/// Collects conventional `Error:` lines from stderr for the failure message.
fn fold_error_lines(stderr: &str) -> String {
  let mut detail = String::new();
  for line in stderr.lines() {
    debug!("{line}");
    if line.starts_with("Error:") {
      detail.push_str("\n\t");
      detail.push_str(line);
    }
  }
  detail
}

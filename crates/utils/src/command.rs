//! Helpers for running external programs.

use std::ffi::OsStr;
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Render a program plus arguments the way a shell would accept them.
fn join_pretty<'a>(parts: impl IntoIterator<Item = &'a OsStr>) -> String {
    let parts: Vec<String> = parts
        .into_iter()
        .map(|s| s.to_string_lossy().into_owned())
        .collect();
    shlex::try_join(parts.iter().map(|s| s.as_str())).unwrap_or_else(|_| parts.join(" "))
}

/// Extension trait for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process and return its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, parsing its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;

    /// The commandline quoted for display.
    fn to_string_pretty(&self) -> String;
}

fn output_checked(cmd: &mut Command) -> Result<Output> {
    let pretty = cmd.to_string_pretty();
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("Spawning {pretty}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{pretty} failed: {}: {}", output.status, stderr.trim());
    }
    Ok(output)
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run_get_string(&mut self) -> Result<String> {
        let output = output_checked(self)?;
        String::from_utf8(output.stdout).context("Decoding command output as UTF-8")
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let pretty = self.to_string_pretty();
        let buf = self.run_get_string()?;
        serde_json::from_str(&buf).with_context(|| format!("Parsing JSON output of {pretty}"))
    }

    fn to_string_pretty(&self) -> String {
        join_pretty(std::iter::once(self.get_program()).chain(self.get_args()))
    }
}

/// A command did not finish within its time budget.
#[derive(Debug, thiserror::Error)]
#[error("{command} did not complete within {}s", timeout.as_secs_f32())]
pub struct CommandTimeout {
    /// The commandline, quoted for display
    pub command: String,
    /// The budget that was exceeded
    pub timeout: Duration,
}

/// The result of running an external program via an [`Executor`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    /// Exit code; `None` if the process was killed by a signal
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CmdOutput {
    /// Whether the program exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

impl From<Output> for CmdOutput {
    fn from(o: Output) -> Self {
        Self {
            exit_code: o.status.code(),
            stdout: String::from_utf8_lossy(&o.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&o.stderr).into_owned(),
        }
    }
}

/// Runs external programs on behalf of the disk-mutating code.
///
/// A non-zero exit is *not* an error here; callers decide whether
/// a failure is fatal or just aggregated. Failing to spawn the
/// program, or exceeding the time budget, is an error.
pub trait Executor: std::fmt::Debug {
    /// Run `program` with `args`, waiting for it to exit.
    fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput>;
}

/// An [`Executor`] running commands on the host, each bounded by a timeout.
#[derive(Debug)]
pub struct HostExecutor {
    runtime: tokio::runtime::Runtime,
    timeout: Duration,
}

impl HostExecutor {
    /// Create an executor killing any child still running after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Creating command runtime")?;
        Ok(Self { runtime, timeout })
    }
}

impl Executor for HostExecutor {
    fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        let pretty = join_pretty(
            std::iter::once(program)
                .chain(args.iter().copied())
                .map(OsStr::new),
        );
        tracing::debug!("exec: {pretty}");
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        let r = self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, cmd.output()).await });
        let output = match r {
            Ok(r) => r.with_context(|| format!("Spawning {pretty}"))?,
            Err(_) => {
                return Err(CommandTimeout {
                    command: pretty,
                    timeout: self.timeout,
                }
                .into())
            }
        };
        let output = CmdOutput::from(output);
        tracing::debug!(
            "{pretty}: exit={:?} stdout={:?} stderr={:?}",
            output.exit_code,
            output.stdout.trim(),
            output.stderr.trim()
        );
        Ok(output)
    }
}

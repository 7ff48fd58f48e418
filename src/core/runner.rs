//! Command execution facility
//!
//! Every privileged invocation (pfctl, at, atq, atrm) goes through a
//! [`CommandRunner`]. The production [`SystemRunner`] spawns through the
//! elevation layer; tests substitute a scripted runner.

use crate::core::error::{Error, Result};
use std::future::Future;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Converts a non-zero exit into [`Error::Execution`] carrying stderr verbatim.
    pub fn into_result(self, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::Execution {
                command: command.to_string(),
                stderr: self.stderr.trim_end().to_string(),
                exit_code: self.exit_code,
            })
        }
    }
}

/// Renders a program and its arguments for log and error messages.
pub fn display_command(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs an external program to completion. No timeout is imposed here.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> impl Future<Output = Result<CommandOutput>> + Send;
}

/// Spawns real processes, elevated as needed
#[derive(Debug, Clone, Copy)]
pub struct SystemRunner {
    elevate: bool,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self { elevate: true }
    }

    /// Runs programs as the current user, never through doas/sudo
    pub fn direct() -> Self {
        Self { elevate: false }
    }

    fn command(&self, program: &str, args: &[&str]) -> Result<tokio::process::Command> {
        if self.elevate {
            return Ok(crate::elevation::create_elevated_command(program, args)?);
        }
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<CommandOutput> {
        debug!("Running {}", display_command(program, args));

        let mut child = self
            .command(program, args)?
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn {program}: {e}");
                Error::Spawn {
                    program: program.to_string(),
                    source: e,
                }
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

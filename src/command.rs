// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! External command execution.
//!
//! Both appliers drive host tools (`iptables`, `systemctl`). They do so
//! through [`CommandRunner`] so tests can substitute a recording runner.

use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Errors that can occur when running an external command.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },
}

impl CommandError {
    /// Returns the captured stderr, if the command ran at all.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            CommandError::Spawn { .. } => None,
            CommandError::Failed { stderr, .. } => Some(stderr),
        }
    }
}

/// A command to run: program, arguments and optional stdin payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program path or name.
    pub program: String,
    /// Arguments, not including the program.
    pub args: Vec<String>,
    /// Bytes written to the child's stdin before it is closed.
    pub stdin: Option<Vec<u8>>,
}

impl Invocation {
    /// Creates an invocation with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the stdin payload.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

/// Shared handle to a runner.
pub type BoxedRunner = Arc<dyn CommandRunner>;

/// Runs external commands.
///
/// A non-zero exit status is reported as [`CommandError::Failed`].
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    /// Runs the command to completion and returns its output.
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError>;
}

/// Runs commands on the host via `tokio::process`.
#[derive(Debug, Default)]
pub struct HostCommandRunner {
    counter: AtomicU64,
}

impl HostCommandRunner {
    /// Creates a new host runner.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(id, command = %invocation, "running command");

        let spawn_err = |source| CommandError::Spawn {
            command: invocation.to_string(),
            source,
        };

        let mut command = tokio::process::Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(spawn_err)?;

        if let Some(input) = &invocation.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input).await.map_err(spawn_err)?;
                // Dropping stdin closes the pipe so the child sees EOF.
                drop(stdin);
            }
        }

        let output = child.wait_with_output().await.map_err(spawn_err)?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        tracing::debug!(
            id,
            status = %output.status,
            result = if output.status.success() { "OK" } else { "ERROR" },
            "finished command"
        );

        if !output.status.success() {
            return Err(CommandError::Failed {
                command: invocation.to_string(),
                status: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stdout,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }
}

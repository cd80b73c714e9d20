//! External tool execution.
//!
//! Every driver operation is shaped into one or more invocations of the
//! storage technology's management tools. The [`CommandRunner`] trait is the
//! only place those processes are started, so tests can swap in a model of
//! the tools.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use silo_common::{SiloError, SiloResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::Command;

/// Bounded retry with a fixed backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Run once, never retry.
    #[must_use]
    pub const fn once() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            delay: Duration::from_millis(500),
        }
    }
}

/// Which standard stream of a streaming process the caller drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipe {
    /// The caller reads the process's stdout (e.g. `zfs send`).
    Stdout,
    /// The caller writes the process's stdin (e.g. `zfs receive`).
    Stdin,
}

/// A running tool process whose stdin or stdout is piped to the caller.
pub struct PipedCommand {
    stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    completion: BoxFuture<'static, SiloResult<()>>,
}

impl PipedCommand {
    /// Assemble a piped command from its streams and completion future.
    pub fn new(
        stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
        stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
        completion: BoxFuture<'static, SiloResult<()>>,
    ) -> Self {
        Self {
            stdout,
            stdin,
            completion,
        }
    }

    /// Take the process's stdout.
    pub fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.stdout.take()
    }

    /// Take the process's stdin. Dropping it signals end of input.
    pub fn take_stdin(&mut self) -> Option<Box<dyn AsyncWrite + Send + Unpin>> {
        self.stdin.take()
    }

    /// Close any remaining pipes and wait for the process to exit.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Tool`] if the process exits unsuccessfully.
    pub async fn wait(mut self) -> SiloResult<()> {
        self.stdin.take();
        self.stdout.take();
        self.completion.await
    }
}

impl fmt::Debug for PipedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipedCommand")
            .field("stdout", &self.stdout.is_some())
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

/// Runs the storage technology's command-line tools.
#[async_trait]
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Run a tool to completion and return its stdout.
    ///
    /// A non-zero exit becomes [`SiloError::Tool`] carrying the command line
    /// and the combined stdout and stderr.
    async fn run(&self, tool: &str, args: &[&str]) -> SiloResult<String>;

    /// Start a tool with one of its standard streams piped to the caller.
    async fn spawn_piped(&self, tool: &str, args: &[&str], pipe: Pipe) -> SiloResult<PipedCommand>;

    /// Run a tool, retrying failures according to `policy`.
    async fn try_run(&self, policy: RetryPolicy, tool: &str, args: &[&str]) -> SiloResult<String> {
        let attempts = policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.run(tool, args).await {
                Ok(output) => return Ok(output),
                Err(err) if attempt < attempts => {
                    tracing::debug!(
                        command = %render(tool, args),
                        attempt,
                        error = %err,
                        "Tool failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(policy.delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Render a command line for logs and errors.
#[must_use]
pub fn render(tool: &str, args: &[&str]) -> String {
    std::iter::once(tool)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs tools as child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolRunner;

impl ToolRunner {
    /// Create a runner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ToolRunner {
    async fn run(&self, tool: &str, args: &[&str]) -> SiloResult<String> {
        let command = render(tool, args);
        tracing::debug!(%command, "Running tool");

        let output = Command::new(tool)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SiloError::Tool {
                command: command.clone(),
                status: None,
                output: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let mut combined = stdout;
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            let combined = combined.trim().to_string();
            tracing::error!(%command, status = ?output.status.code(), output = %combined, "Tool failed");
            return Err(SiloError::Tool {
                command,
                status: output.status.code(),
                output: combined,
            });
        }

        Ok(stdout)
    }

    async fn spawn_piped(&self, tool: &str, args: &[&str], pipe: Pipe) -> SiloResult<PipedCommand> {
        let command = render(tool, args);
        tracing::debug!(%command, ?pipe, "Spawning streaming tool");

        let mut cmd = Command::new(tool);
        cmd.args(args).stderr(Stdio::piped()).kill_on_drop(true);
        match pipe {
            Pipe::Stdout => cmd.stdin(Stdio::null()).stdout(Stdio::piped()),
            Pipe::Stdin => cmd.stdin(Stdio::piped()).stdout(Stdio::null()),
        };

        let mut child = cmd.spawn().map_err(|e| SiloError::Tool {
            command: command.clone(),
            status: None,
            output: e.to_string(),
        })?;

        let stdout = child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);
        let stdin = child
            .stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncWrite + Send + Unpin>);
        let stderr = child.stderr.take();

        let completion = async move {
            let mut output = String::new();
            if let Some(mut stderr) = stderr {
                stderr.read_to_string(&mut output).await?;
            }
            let status = child.wait().await?;
            if status.success() {
                Ok(())
            } else {
                let output = output.trim().to_string();
                tracing::error!(%command, status = ?status.code(), %output, "Streaming tool failed");
                Err(SiloError::Tool {
                    command,
                    status: status.code(),
                    output,
                })
            }
        }
        .boxed();

        Ok(PipedCommand::new(stdout, stdin, completion))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Default)]
    struct Flaky {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl CommandRunner for Flaky {
        async fn run(&self, tool: &str, args: &[&str]) -> SiloResult<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok("ok".to_string())
            } else {
                Err(SiloError::Tool {
                    command: render(tool, args),
                    status: Some(1),
                    output: "dataset is busy".to_string(),
                })
            }
        }

        async fn spawn_piped(&self, _: &str, _: &[&str], _: Pipe) -> SiloResult<PipedCommand> {
            Err(SiloError::Unsupported {
                feature: "streams".to_string(),
            })
        }
    }

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 20);
        assert_eq!(policy.delay, Duration::from_millis(500));
    }

    #[test]
    fn render_command_line() {
        assert_eq!(
            render("zfs", &["destroy", "-r", "tank/containers/c1"]),
            "zfs destroy -r tank/containers/c1"
        );
    }

    #[tokio::test]
    async fn try_run_retries_until_success() {
        let runner = Flaky {
            succeed_on: 3,
            ..Flaky::default()
        };
        let out = runner.try_run(fast(5), "zfs", &["destroy"]).await.unwrap();
        assert_eq!(out, "ok");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn try_run_gives_up_with_last_error() {
        let runner = Flaky {
            succeed_on: 10,
            ..Flaky::default()
        };
        let err = runner.try_run(fast(2), "zfs", &["destroy"]).await.unwrap_err();
        assert!(matches!(err, SiloError::Tool { status: Some(1), .. }));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn tool_runner_captures_failure_output() {
        let err = ToolRunner::new()
            .run("sh", &["-c", "echo nope >&2; exit 3"])
            .await
            .unwrap_err();
        match err {
            SiloError::Tool { status, output, .. } => {
                assert_eq!(status, Some(3));
                assert_eq!(output, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn tool_runner_streams_stdout() {
        let mut cmd = ToolRunner::new()
            .spawn_piped("sh", &["-c", "printf hello"], Pipe::Stdout)
            .await
            .unwrap();
        let mut stdout = cmd.take_stdout().unwrap();
        let mut buf = String::new();
        stdout.read_to_string(&mut buf).await.unwrap();
        cmd.wait().await.unwrap();
        assert_eq!(buf, "hello");
    }
}

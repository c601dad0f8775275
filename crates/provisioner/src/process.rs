//! External process execution.
//!
//! Every tool the engine drives (terraform, ansible-playbook, nix, ssh, the
//! artifact renderer) goes through [`CommandRunner`]. The production
//! implementation streams child output line by line into the tracing sink,
//! enforces optional deadlines, and kills children when the run is cancelled.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};

/// Number of trailing output lines kept for failure diagnostics.
const OUTPUT_TAIL_LINES: usize = 20;

/// A command to run: program, arguments, working directory, extra env.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Add an environment variable on top of the inherited environment.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn envs(mut self, vars: &[(String, String)]) -> Self {
        self.env.extend(vars.iter().cloned());
        self
    }

    /// Kill the command if it runs longer than `timeout`.
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[must_use]
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    #[must_use]
    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether the first argument (the subcommand) equals `sub`.
    #[must_use]
    pub fn is_subcommand(&self, program: &str, sub: &str) -> bool {
        self.program == program && self.args.first().is_some_and(|a| a == sub)
    }

    /// Shell-like rendering for logs and error messages.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Output of a captured command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or -1 if the child was killed by a signal.
    pub exit_code: i32,
}

impl CapturedOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Seam between the engine and the operating system's process table.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command, streaming its output to the log.
    ///
    /// Fails with [`ProvisionError::CommandFailed`] on a non-zero exit.
    async fn run(&self, cmd: &CommandSpec) -> Result<()>;

    /// Run a command and collect its output. A non-zero exit is not an error.
    async fn capture(&self, cmd: &CommandSpec) -> Result<CapturedOutput>;
}

/// [`CommandRunner`] backed by real child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    cancel: CancellationToken,
}

enum Finished<T> {
    Exited(std::io::Result<T>),
    TimedOut(Duration),
    Cancelled,
}

impl ProcessRunner {
    /// Create a runner whose children are killed when `cancel` fires.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    fn spawn(cmd: &CommandSpec) -> Result<Child> {
        debug!(command = %cmd.display(), cwd = ?cmd.cwd(), "Spawning command");
        cmd.to_command().spawn().map_err(|source| ProvisionError::Spawn {
            command: cmd.display(),
            source,
        })
    }

    /// Drive `work` to completion unless the deadline or cancellation wins.
    async fn supervise<T, F>(&self, cmd: &CommandSpec, work: F) -> Finished<T>
    where
        F: std::future::Future<Output = std::io::Result<T>>,
    {
        let deadline = async {
            match cmd.timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = work => Finished::Exited(result),
            limit = deadline => Finished::TimedOut(limit),
            () = self.cancel.cancelled() => Finished::Cancelled,
        }
    }

    async fn terminate(child: &mut Child, cmd: &CommandSpec) {
        // kill() also waits, so the child is reaped here.
        if let Err(e) = child.kill().await {
            warn!(command = %cmd.display(), error = %e, "Failed to kill child process");
        }
    }

    fn settle<T>(finished: Finished<T>, cmd: &CommandSpec) -> Result<T> {
        match finished {
            Finished::Exited(result) => {
                result.map_err(|e| ProvisionError::io(PathBuf::from(&cmd.program), e))
            }
            Finished::TimedOut(timeout) => Err(ProvisionError::CommandTimedOut {
                command: cmd.display(),
                timeout,
            }),
            Finished::Cancelled => Err(ProvisionError::Cancelled {
                command: cmd.display(),
            }),
        }
    }
}

/// Forwards child output lines to the log and remembers the last few.
struct OutputSink<'a> {
    tool: &'a str,
    tail: VecDeque<String>,
}

impl<'a> OutputSink<'a> {
    fn new(tool: &'a str) -> Self {
        Self {
            tool,
            tail: VecDeque::with_capacity(OUTPUT_TAIL_LINES),
        }
    }

    fn line(&mut self, line: String) {
        info!(tool = self.tool, "{line}");
        if self.tail.len() == OUTPUT_TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }

    /// Log a completed read. Returns whether the pipe is still open.
    fn forward(&mut self, read: std::io::Result<usize>, buf: &mut Vec<u8>) -> bool {
        match read {
            Ok(0) => false,
            Ok(_) => {
                let line = String::from_utf8_lossy(buf);
                self.line(line.trim_end_matches(['\n', '\r']).to_string());
                buf.clear();
                true
            }
            Err(e) => {
                warn!(tool = self.tool, error = %e, "Failed to read child output");
                false
            }
        }
    }

    fn tail(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

async fn stream_to_exit<O, E>(
    child: &mut Child,
    stdout: O,
    stderr: E,
    sink: &mut OutputSink<'_>,
) -> std::io::Result<ExitStatus>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    // Raw bytes, not `lines()`: tools may print invalid UTF-8 and a pipe that
    // stops being drained blocks the child.
    let mut out = BufReader::new(stdout);
    let mut err = BufReader::new(stderr);
    let (mut out_buf, mut err_buf) = (Vec::new(), Vec::new());
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        tokio::select! {
            read = out.read_until(b'\n', &mut out_buf), if out_open => {
                out_open = sink.forward(read, &mut out_buf);
            }
            read = err.read_until(b'\n', &mut err_buf), if err_open => {
                err_open = sink.forward(read, &mut err_buf);
            }
        }
    }

    child.wait().await
}

async fn collect_to_exit<O, E>(
    child: &mut Child,
    mut stdout: O,
    mut stderr: E,
) -> std::io::Result<(ExitStatus, Vec<u8>, Vec<u8>)>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut err = Vec::new();
    let (out_res, err_res) = tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
    out_res?;
    err_res?;
    let status = child.wait().await?;
    Ok((status, out, err))
}

fn take_pipes(
    child: &mut Child,
    cmd: &CommandSpec,
) -> Result<(tokio::process::ChildStdout, tokio::process::ChildStderr)> {
    let missing = |what: &str| ProvisionError::Spawn {
        command: cmd.display(),
        source: std::io::Error::other(format!("{what} was not captured")),
    };
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
    Ok((stdout, stderr))
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled {
                command: cmd.display(),
            });
        }

        let mut child = Self::spawn(cmd)?;
        let (stdout, stderr) = take_pipes(&mut child, cmd)?;
        let mut sink = OutputSink::new(&cmd.program);

        let finished = self
            .supervise(cmd, stream_to_exit(&mut child, stdout, stderr, &mut sink))
            .await;
        if !matches!(finished, Finished::Exited(_)) {
            Self::terminate(&mut child, cmd).await;
        }

        let status = Self::settle(finished, cmd)?;
        if status.success() {
            Ok(())
        } else {
            Err(ProvisionError::CommandFailed {
                command: cmd.display(),
                exit_code: status.code().unwrap_or(-1),
                output_tail: sink.tail(),
            })
        }
    }

    async fn capture(&self, cmd: &CommandSpec) -> Result<CapturedOutput> {
        if self.cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled {
                command: cmd.display(),
            });
        }

        let mut child = Self::spawn(cmd)?;
        let (stdout, stderr) = take_pipes(&mut child, cmd)?;

        let finished = self
            .supervise(cmd, collect_to_exit(&mut child, stdout, stderr))
            .await;
        if !matches!(finished, Finished::Exited(_)) {
            Self::terminate(&mut child, cmd).await;
        }

        let (status, stdout, stderr) = Self::settle(finished, cmd)?;
        Ok(CapturedOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

/// Sleep for `duration` unless the run is cancelled first.
///
/// # Errors
///
/// Returns [`ProvisionError::Cancelled`] naming `what` if cancellation wins.
pub async fn pause(duration: Duration, cancel: &CancellationToken, what: &str) -> Result<()> {
    tokio::select! {
        () = tokio::time::sleep(duration) => Ok(()),
        () = cancel.cancelled() => Err(ProvisionError::Cancelled {
            command: what.to_string(),
        }),
    }
}

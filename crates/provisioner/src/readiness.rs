//! Host readiness probing over SSH.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{OsKind, ProbeSettings};
use crate::process::{pause, CommandRunner, CommandSpec};

/// Token echoed back by the liveness command.
const LIVENESS_TOKEN: &str = "SSH OK";

/// Who and where to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub address: String,
    pub host_name: String,
    pub ssh_user: String,
    pub identity: Option<PathBuf>,
    pub os: OsKind,
}

/// Outcome of [`ReadinessProber::wait_until_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessResult {
    pub ready: bool,
    pub elapsed: Duration,
}

/// Polls a host until it accepts SSH and, where applicable, has finished
/// first-boot initialisation.
pub struct ReadinessProber {
    runner: Arc<dyn CommandRunner>,
    settings: ProbeSettings,
    ssh: String,
    cancel: CancellationToken,
}

impl ReadinessProber {
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        settings: ProbeSettings,
        ssh: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            settings,
            ssh: ssh.into(),
            cancel,
        }
    }

    /// Poll until ready or the probe timeout elapses.
    ///
    /// Never fails: errors from individual attempts mean "not ready yet", and
    /// timing out or cancellation yields `ready = false`.
    pub async fn wait_until_ready(&self, target: &ProbeTarget) -> ReadinessResult {
        let start = Instant::now();
        let timeout = self.settings.timeout;
        info!(
            address = %target.address,
            user = %target.ssh_user,
            "Waiting for host to become ready (timeout: {}s)",
            timeout.as_secs()
        );

        loop {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                warn!(
                    host = %target.host_name,
                    elapsed_secs = elapsed.as_secs(),
                    "Host not ready before timeout, continuing"
                );
                return ReadinessResult {
                    ready: false,
                    elapsed,
                };
            }

            if self.check_once(target, start + timeout).await {
                let elapsed = start.elapsed();
                info!(elapsed_secs = elapsed.as_secs(), "Host is ready");
                return ReadinessResult {
                    ready: true,
                    elapsed,
                };
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            let wait = self.settings.poll_interval.min(remaining);
            if pause(wait, &self.cancel, "readiness poll").await.is_err() {
                return ReadinessResult {
                    ready: false,
                    elapsed: start.elapsed(),
                };
            }
        }
    }

    /// One liveness pass. Each remote call gets only the time left before
    /// `deadline`.
    async fn check_once(&self, target: &ProbeTarget, deadline: Instant) -> bool {
        if !self
            .remote(target, &format!("echo '{LIVENESS_TOKEN}'"), deadline)
            .await
            .is_some_and(|stdout| stdout.contains(LIVENESS_TOKEN))
        {
            return false;
        }

        if !target.os.runs_first_boot_agent() {
            return true;
        }

        match self
            .remote(target, "cloud-init status --wait || cloud-init status", deadline)
            .await
        {
            Some(stdout) if stdout.contains("done") || stdout.contains("disabled") => true,
            Some(stdout) => {
                debug!(status = %stdout.trim(), "cloud-init still running");
                false
            }
            None => false,
        }
    }

    /// Run `command` on the target, returning stdout on a zero exit.
    async fn remote(&self, target: &ProbeTarget, command: &str, deadline: Instant) -> Option<String> {
        let budget = deadline.saturating_duration_since(Instant::now());
        if budget.is_zero() {
            return None;
        }
        let cmd = self.ssh_command(target, command).timeout(Some(budget));
        match self.runner.capture(&cmd).await {
            Ok(output) if output.success() => Some(output.stdout),
            Ok(output) => {
                debug!(exit_code = output.exit_code, stderr = %output.stderr.trim(), "SSH attempt failed");
                None
            }
            Err(e) => {
                debug!(error = %e, "SSH attempt failed");
                None
            }
        }
    }

    fn ssh_command(&self, target: &ProbeTarget, command: &str) -> CommandSpec {
        let connect_timeout = format!("ConnectTimeout={}", self.settings.connect_timeout.as_secs());
        let mut cmd = CommandSpec::new(&self.ssh).args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            connect_timeout.as_str(),
            "-o",
            "BatchMode=yes",
        ]);
        if let Some(identity) = &target.identity {
            cmd = cmd.arg("-i").arg(identity.to_string_lossy());
        }
        cmd.arg(format!("{}@{}", target.ssh_user, target.address))
            .arg(command)
    }
}

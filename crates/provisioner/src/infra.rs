//! Infrastructure apply engine.
//!
//! Drives Terraform through init, validate, plan and apply inside a host's
//! rendered `tf/` directory. Plan+apply is retried with a linear backoff and a
//! best-effort `destroy` between attempts; init and validate run once because
//! their failures point at configuration defects, not transient faults.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::{ProvisionError, Result};
use crate::process::{pause, CommandRunner, CommandSpec};

/// Terraform output holding the host address.
pub const ADDRESS_OUTPUT: &str = "vm_ip";

/// Plan file written by `terraform plan` and consumed by `terraform apply`.
const PLAN_FILE: &str = "tfplan";

/// Rough category of an apply failure, used only to word log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Timeout,
    GuestAgent,
    ResourceLock,
    Other,
}

impl FailureClass {
    /// Classify from an error message and captured tool output.
    #[must_use]
    pub fn classify(text: &str) -> Self {
        let text = text.to_lowercase();
        if text.contains("timeout") || text.contains("timed out") {
            Self::Timeout
        } else if text.contains("agent") {
            Self::GuestAgent
        } else if text.contains("lock") {
            Self::ResourceLock
        } else {
            Self::Other
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::Timeout => "Terraform timeout detected",
            Self::GuestAgent => "QEMU guest agent issue detected",
            Self::ResourceLock => "Resource lock detected",
            Self::Other => "Terraform error",
        }
    }
}

/// Wait inserted after failed attempt `attempt` (1-based).
#[must_use]
pub fn backoff_delay(step: Duration, attempt: u32) -> Duration {
    step * attempt
}

/// Result of a successful [`InfraEngine::apply`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// False when only a plan was produced.
    pub applied: bool,
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// Address reported by the `vm_ip` output, if any.
    pub address: Option<String>,
}

impl ApplyOutcome {
    /// Parse `terraform output -json`.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the document does not parse.
    pub fn parse_outputs(json: &str) -> serde_json::Result<Option<String>> {
        if json.trim().is_empty() {
            return Ok(None);
        }
        let outputs: serde_json::Map<String, Value> = serde_json::from_str(json)?;
        let address = outputs
            .get(ADDRESS_OUTPUT)
            .and_then(|output| output.get("value"))
            .and_then(|value| match value {
                Value::String(s) => Some(s.clone()),
                Value::Array(items) => items.iter().find_map(|v| v.as_str().map(str::to_string)),
                _ => None,
            });
        Ok(address)
    }
}

/// Infra engine settings.
#[derive(Debug, Clone)]
pub struct InfraSettings {
    pub terraform: String,
    pub max_retries: u32,
    pub backoff_step: Duration,
    pub command_timeout: Option<Duration>,
    pub debug: bool,
    pub plan_only: bool,
}

impl From<&EngineConfig> for InfraSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            terraform: config.tools.terraform.clone(),
            max_retries: config.infra_max_retries,
            backoff_step: config.backoff_step,
            command_timeout: config.command_timeout,
            debug: config.debug,
            plan_only: config.plan_only,
        }
    }
}

/// Runs Terraform for one host directory.
pub struct InfraEngine {
    runner: Arc<dyn CommandRunner>,
    settings: InfraSettings,
    cancel: CancellationToken,
}

impl InfraEngine {
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        settings: InfraSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            settings,
            cancel,
        }
    }

    fn max_attempts(&self) -> u32 {
        self.settings.max_retries.max(1)
    }

    fn terraform(&self, dir: &Path, args: &[&str]) -> CommandSpec {
        let mut cmd = CommandSpec::new(&self.settings.terraform)
            .args(args.iter().copied())
            .current_dir(dir)
            .timeout(self.settings.command_timeout);
        if self.settings.debug {
            cmd = cmd.env("TF_LOG", "DEBUG").env(
                "TF_LOG_PATH",
                dir.join("terraform-debug.log").to_string_lossy(),
            );
        }
        cmd
    }

    /// Materialize the infrastructure described in `dir`.
    ///
    /// # Errors
    ///
    /// Returns the init/validate failure immediately, a non-retryable error
    /// immediately, or the last apply failure once attempts are exhausted.
    pub async fn apply(&self, dir: &Path) -> Result<ApplyOutcome> {
        info!(dir = %dir.display(), "Initializing Terraform");
        self.runner
            .run(&self.terraform(dir, &["init", "-upgrade", "-input=false"]))
            .await?;

        info!("Validating Terraform configuration");
        self.runner.run(&self.terraform(dir, &["validate"])).await?;

        if self.settings.plan_only {
            info!("Plan-only mode: planning without apply");
            self.plan(dir).await?;
            return Ok(ApplyOutcome {
                applied: false,
                attempts: 1,
                address: None,
            });
        }

        let max_attempts = self.max_attempts();
        let mut attempt = 1;
        loop {
            match self.plan_and_apply(dir, attempt, max_attempts).await {
                Ok(()) => {
                    info!(attempt, "Terraform apply completed");
                    return Ok(ApplyOutcome {
                        applied: true,
                        attempts: attempt,
                        address: self.fetch_address(dir).await,
                    });
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    let class = FailureClass::classify(&err.diagnostic_text());
                    warn!(attempt, max_attempts, error = %err, "{} on attempt {attempt}", class.describe());

                    if attempt >= max_attempts {
                        error!(attempts = max_attempts, "Terraform apply failed after {max_attempts} attempts");
                        return Err(err);
                    }

                    self.destroy(dir).await;
                    let wait = backoff_delay(self.settings.backoff_step, attempt);
                    info!(wait_secs = wait.as_secs(), "Waiting before retry");
                    pause(wait, &self.cancel, "terraform retry backoff").await?;
                    attempt += 1;
                }
            }
        }
    }

    async fn plan(&self, dir: &Path) -> Result<()> {
        let out = format!("-out={PLAN_FILE}");
        self.runner
            .run(&self.terraform(dir, &["plan", "-input=false", out.as_str()]))
            .await
    }

    async fn plan_and_apply(&self, dir: &Path, attempt: u32, max_attempts: u32) -> Result<()> {
        info!("Planning infrastructure (attempt {attempt}/{max_attempts})");
        self.plan(dir).await?;

        info!("Applying infrastructure (attempt {attempt}/{max_attempts})");
        self.runner
            .run(&self.terraform(dir, &["apply", "-auto-approve", "-input=false", PLAN_FILE]))
            .await
    }

    /// Tear down whatever a failed attempt left behind. Failures are logged.
    async fn destroy(&self, dir: &Path) {
        info!("Cleaning up partial infrastructure before retry");
        if let Err(e) = self
            .runner
            .run(&self.terraform(dir, &["destroy", "-auto-approve", "-input=false"]))
            .await
        {
            warn!(error = %e, "Cleanup failed, continuing with retry");
        }
    }

    /// Read the address output. Failures yield `None`.
    async fn fetch_address(&self, dir: &Path) -> Option<String> {
        let cmd = self.terraform(dir, &["output", "-json"]);
        let output = match self.runner.capture(&cmd).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "Could not get Terraform outputs");
                return None;
            }
        };
        if !output.success() {
            warn!(
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "Could not get Terraform outputs"
            );
            return None;
        }
        match ApplyOutcome::parse_outputs(&output.stdout) {
            Ok(address) => address,
            Err(e) => {
                warn!(error = %e, "Terraform outputs are not valid JSON");
                None
            }
        }
    }
}

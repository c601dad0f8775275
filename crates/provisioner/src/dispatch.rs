//! Configuration stage dispatch.
//!
//! Runs the pxe, os and post stages for one host in fixed order. NixOS hosts
//! are installed with nixos-anywhere first; if that fails for any reason the
//! Ansible install playbook runs instead and only its failure is fatal.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{EngineConfig, HostSpec, OsKind, Stage, StageSet};
use crate::error::{ProvisionError, Result};
use crate::lock::Workspace;
use crate::process::{CommandRunner, CommandSpec};

const PXE_PLAYBOOK: &str = "pxe_server.yml";
const UBUNTU_PLAYBOOK: &str = "ubuntu_install.yml";
const NIXOS_PLAYBOOK: &str = "nixos_install.yml";
const POST_PLAYBOOK: &str = "post_config_common.yml";

const NIXOS_ANYWHERE: &str = "github:nix-community/nixos-anywhere";

/// What happened to one configuration stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    /// Selected but not applicable to this host.
    Skipped,
    /// The primary strategy failed and the fallback succeeded.
    CompletedViaFallback { primary_error: String },
}

/// Per-stage outcomes in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub stages: Vec<(Stage, StageOutcome)>,
}

impl DispatchReport {
    #[must_use]
    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, outcome)| outcome)
    }
}

/// A host ready for configuration.
#[derive(Debug, Clone, Copy)]
pub struct DispatchTarget<'a> {
    pub host: &'a HostSpec,
    pub workspace: &'a Workspace,
    /// Connectable address, when one is known. Passed to Ansible as
    /// `ansible_host` and required by nixos-anywhere.
    pub address: Option<&'a str>,
    pub identity: Option<&'a Path>,
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub ansible_playbook: String,
    pub nix: String,
    pub playbook_dir: PathBuf,
    pub nixos_flake: PathBuf,
    pub command_timeout: Option<Duration>,
    pub debug: bool,
}

impl From<&EngineConfig> for DispatchSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            ansible_playbook: config.tools.ansible_playbook.clone(),
            nix: config.tools.nix.clone(),
            playbook_dir: config.playbook_dir.clone(),
            nixos_flake: config.nixos_flake.clone(),
            command_timeout: config.command_timeout,
            debug: config.debug,
        }
    }
}

/// Runs configuration stages through Ansible and nixos-anywhere.
pub struct ConfigDispatcher {
    runner: Arc<dyn CommandRunner>,
    settings: DispatchSettings,
}

impl ConfigDispatcher {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, settings: DispatchSettings) -> Self {
        Self { runner, settings }
    }

    /// Run the selected configuration stages.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the rendered inventory or host vars
    /// are missing, otherwise the first stage failure.
    pub async fn dispatch(
        &self,
        target: DispatchTarget<'_>,
        stages: &StageSet,
    ) -> Result<DispatchReport> {
        let config_stages: Vec<Stage> = stages.iter().filter(|s| *s != Stage::Infra).collect();
        let mut report = DispatchReport::default();
        if config_stages.is_empty() {
            return Ok(report);
        }

        for path in [target.workspace.inventory(), target.workspace.host_vars()] {
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(ProvisionError::config(format!(
                    "Rendered file missing: {}",
                    path.display()
                )));
            }
        }

        for stage in config_stages {
            let outcome = match stage {
                Stage::Pxe if !target.host.needs_pxe() => {
                    info!("Skipping pxe stage: host does not boot over PXE");
                    StageOutcome::Skipped
                }
                Stage::Pxe => {
                    info!("Preparing PXE boot environment");
                    self.playbook(target, PXE_PLAYBOOK).await?;
                    StageOutcome::Completed
                }
                Stage::Os => self.install_os(target).await?,
                Stage::Post => {
                    info!("Running post-install configuration");
                    self.playbook(target, POST_PLAYBOOK).await?;
                    StageOutcome::Completed
                }
                Stage::Infra => continue,
            };
            report.stages.push((stage, outcome));
        }

        Ok(report)
    }

    async fn install_os(&self, target: DispatchTarget<'_>) -> Result<StageOutcome> {
        match target.host.os {
            OsKind::Ubuntu => {
                info!(version = %target.host.os_version, "Installing Ubuntu");
                self.playbook(target, UBUNTU_PLAYBOOK).await?;
                Ok(StageOutcome::Completed)
            }
            OsKind::Nixos => {
                info!("Installing NixOS with nixos-anywhere");
                match self.nixos_anywhere(target).await {
                    Ok(()) => Ok(StageOutcome::Completed),
                    Err(primary) => {
                        warn!(error = %primary, "nixos-anywhere failed, falling back to Ansible install");
                        self.playbook(target, NIXOS_PLAYBOOK).await?;
                        Ok(StageOutcome::CompletedViaFallback {
                            primary_error: primary.to_string(),
                        })
                    }
                }
            }
        }
    }

    async fn nixos_anywhere(&self, target: DispatchTarget<'_>) -> Result<()> {
        let flake = &self.settings.nixos_flake;
        if !tokio::fs::try_exists(flake).await.unwrap_or(false) {
            return Err(ProvisionError::config(format!(
                "NixOS flake not found at {}",
                flake.display()
            )));
        }
        let address = target.address.ok_or_else(|| {
            ProvisionError::config(format!("No target address for {}", target.host.name))
        })?;

        let mut cmd = CommandSpec::new(&self.settings.nix)
            .args(["run", NIXOS_ANYWHERE, "--", "--flake"])
            .arg(format!("{}#{}", flake.display(), target.host.name))
            .arg("--target-host")
            .arg(format!("root@{address}"));
        if let Some(identity) = target.identity {
            cmd = cmd
                .arg("--ssh-option")
                .arg(format!("IdentityFile={}", identity.display()));
        }
        cmd = cmd.args([
            "--ssh-option",
            "StrictHostKeyChecking=no",
            "--ssh-option",
            "UserKnownHostsFile=/dev/null",
        ]);
        if self.settings.debug {
            cmd = cmd.arg("--debug");
        }

        self.runner
            .run(&cmd.timeout(self.settings.command_timeout))
            .await
    }

    /// The rendered inventory predates address resolution, so a known
    /// address overrides it through `ansible_host`.
    fn playbook_command(&self, target: DispatchTarget<'_>, playbook: &str) -> CommandSpec {
        let mut cmd = CommandSpec::new(&self.settings.ansible_playbook);
        if self.settings.debug {
            cmd = cmd.arg("-vvv");
        }
        cmd = cmd
            .arg("-i")
            .arg(target.workspace.inventory().to_string_lossy())
            .arg(self.settings.playbook_dir.join(playbook).to_string_lossy())
            .arg("--extra-vars")
            .arg(format!("@{}", target.workspace.host_vars().display()));
        if let Some(address) = target.address {
            cmd = cmd
                .arg("--extra-vars")
                .arg(format!("ansible_host={address}"));
        }
        cmd.timeout(self.settings.command_timeout)
    }

    async fn playbook(&self, target: DispatchTarget<'_>, playbook: &str) -> Result<()> {
        self.runner
            .run(&self.playbook_command(target, playbook))
            .await
    }
}

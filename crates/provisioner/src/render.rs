//! Artifact rendering.
//!
//! The engine does not generate Terraform or Ansible files itself. It hands
//! the resolved host to an [`ArtifactRenderer`], which must leave `tf/` and
//! the Ansible inventory and host vars in the workspace.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::HostSpec;
use crate::error::{ProvisionError, Result};
use crate::lock::Workspace;
use crate::process::{CommandRunner, CommandSpec};

/// Produces a host's infra and configuration artifacts.
#[async_trait]
pub trait ArtifactRenderer: Send + Sync {
    /// Render artifacts for `host` into `workspace`.
    async fn render(&self, host: &HostSpec, workspace: &Workspace) -> Result<()>;
}

/// Renders by running an external command.
///
/// The host spec is written to `host.json` in the workspace first. The
/// command's arguments may contain `{host}` and `{workspace}`, and it runs with
/// `PROVISION_HOST_SPEC`, `PROVISION_WORKSPACE` and, when known,
/// `PROVISION_INFRA_ENDPOINT` set.
pub struct CommandRenderer {
    runner: Arc<dyn CommandRunner>,
    command: Vec<String>,
    endpoint: Option<String>,
}

impl CommandRenderer {
    /// # Errors
    ///
    /// Returns a configuration error if `command` is empty.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        command: Vec<String>,
        endpoint: Option<String>,
    ) -> Result<Self> {
        if command.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(ProvisionError::config("renderer.command must name a program"));
        }
        Ok(Self {
            runner,
            command,
            endpoint,
        })
    }

    fn command_for(&self, host: &HostSpec, workspace: &Workspace) -> CommandSpec {
        let root = workspace.root().display().to_string();
        let expand = |part: &String| part.replace("{host}", &host.name).replace("{workspace}", &root);

        let mut parts = self.command.iter().map(expand);
        let program = parts.next().unwrap_or_default();
        let mut cmd = CommandSpec::new(program)
            .args(parts)
            .env(
                "PROVISION_HOST_SPEC",
                workspace.host_spec_file().display().to_string(),
            )
            .env("PROVISION_WORKSPACE", root.clone());
        if let Some(endpoint) = &self.endpoint {
            cmd = cmd.env("PROVISION_INFRA_ENDPOINT", endpoint.clone());
        }
        cmd
    }
}

#[async_trait]
impl ArtifactRenderer for CommandRenderer {
    async fn render(&self, host: &HostSpec, workspace: &Workspace) -> Result<()> {
        let spec_path = workspace.host_spec_file();
        let json = serde_json::to_vec_pretty(host)
            .map_err(|e| ProvisionError::io(&spec_path, std::io::Error::other(e)))?;
        tokio::fs::write(&spec_path, json)
            .await
            .map_err(|e| ProvisionError::io(&spec_path, e))?;

        info!(workspace = %workspace.root().display(), "Rendering artifacts");
        self.runner.run(&self.command_for(host, workspace)).await
    }
}

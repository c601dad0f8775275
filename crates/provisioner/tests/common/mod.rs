//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use provisioner::config::{
    BootMethod, Defaults, InstallSpec, MachineSpec, NetworkMode, OsKind, Placement,
};
use provisioner::lock::Workspace;
use provisioner::{
    ArtifactRenderer, CapturedOutput, CommandRunner, CommandSpec, EngineConfig, HostSpec,
    Orchestrator, ProvisionError, Result, RunConfig,
};

type Handler = dyn Fn(&CommandSpec) -> CapturedOutput + Send + Sync;

/// Command runner that answers from a closure and records every call.
pub struct FakeRunner {
    handler: Box<Handler>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl FakeRunner {
    pub fn new(handler: impl Fn(&CommandSpec) -> CapturedOutput + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&CommandSpec) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn answer(&self, cmd: &CommandSpec) -> CapturedOutput {
        self.calls.lock().unwrap().push(cmd.clone());
        (self.handler)(cmd)
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<()> {
        let out = self.answer(cmd);
        if out.success() {
            Ok(())
        } else {
            Err(ProvisionError::CommandFailed {
                command: cmd.display(),
                exit_code: out.exit_code,
                output_tail: out.stderr,
            })
        }
    }

    async fn capture(&self, cmd: &CommandSpec) -> Result<CapturedOutput> {
        Ok(self.answer(cmd))
    }
}

/// Renderer that lays out the expected artifact tree and tracks overlap.
#[derive(Default)]
pub struct FakeRenderer {
    active: AtomicUsize,
    peak: AtomicUsize,
    rendered: Mutex<Vec<String>>,
}

impl FakeRenderer {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn rendered(&self) -> Vec<String> {
        self.rendered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactRenderer for FakeRenderer {
    async fn render(&self, host: &HostSpec, workspace: &Workspace) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        std::fs::create_dir_all(workspace.infra_dir()).unwrap();
        std::fs::create_dir_all(workspace.ansible_dir()).unwrap();
        std::fs::write(workspace.inventory(), format!("all:\n  hosts:\n    {}: {{}}\n", host.name)).unwrap();
        std::fs::write(workspace.host_vars(), format!("hostname: {}\n", host.name)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        self.rendered.lock().unwrap().push(host.name.clone());
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn ok(stdout: impl Into<String>) -> CapturedOutput {
    CapturedOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code: 0,
    }
}

pub fn fail(stderr: &str) -> CapturedOutput {
    CapturedOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: 1,
    }
}

/// Host name of the workspace a terraform call runs in (`<root>/<host>/tf`).
pub fn workspace_host(cmd: &CommandSpec) -> Option<String> {
    cmd.cwd()?
        .parent()?
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

pub fn vm_ip_output(address: &str) -> String {
    format!(r#"{{"vm_ip":{{"sensitive":false,"type":"string","value":"{address}"}}}}"#)
}

/// Healthy tool behaviour: every command succeeds, hosts report `addresses`.
pub fn healthy(cmd: &CommandSpec, addresses: &HashMap<String, String>) -> CapturedOutput {
    match cmd.program() {
        "terraform" if cmd.is_subcommand("terraform", "output") => {
            let host = workspace_host(cmd).unwrap_or_default();
            ok(addresses
                .get(&host)
                .map(|a| vm_ip_output(a))
                .unwrap_or_else(|| "{}".to_string()))
        }
        "ssh" => {
            let remote = cmd.get_args().last().cloned().unwrap_or_default();
            if remote.contains("cloud-init") {
                ok("status: done\n")
            } else {
                ok("SSH OK\n")
            }
        }
        _ => ok(""),
    }
}

pub fn is_playbook_for(cmd: &CommandSpec, host: &str) -> bool {
    cmd.program() == "ansible-playbook"
        && cmd
            .get_args()
            .iter()
            .any(|a| a.contains(&format!("/{host}/ansible/")))
}

pub fn machine(name: &str, placement: Placement) -> MachineSpec {
    MachineSpec {
        name: name.to_string(),
        tenant: "default".to_string(),
        placement,
        boot_method: BootMethod::Image,
        cpus: 2,
        memory_mb: 2048,
        disk_gb: 20,
    }
}

pub fn install(os: OsKind, network: NetworkMode) -> InstallSpec {
    InstallSpec {
        os,
        version: String::new(),
        network,
        users: vec![],
        packages: vec![],
    }
}

pub fn run_config(hosts: &[(&str, Placement, OsKind)]) -> RunConfig {
    RunConfig {
        defaults: Defaults {
            infra_endpoint: Some("https://pve.example:8006/api2/json".to_string()),
            renderer: None,
        },
        vms: hosts
            .iter()
            .map(|(name, placement, _)| machine(name, *placement))
            .collect(),
        installs: hosts
            .iter()
            .map(|(name, _, os)| (name.to_string(), install(*os, NetworkMode::Dhcp)))
            .collect(),
    }
}

/// Temporary build root, flake and tenants directories.
pub struct TestEnv {
    pub dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("flake")).unwrap();
        Self { dir }
    }

    pub fn build_root(&self) -> PathBuf {
        self.dir.path().join("build")
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            build_root: self.build_root(),
            tenants_dir: self.dir.path().join("tenants"),
            nixos_flake: self.dir.path().join("flake"),
            playbook_dir: Path::new("playbooks").to_path_buf(),
            ..EngineConfig::default()
        }
    }
}

pub fn orchestrator(
    config: EngineConfig,
    runner: &Arc<FakeRunner>,
    renderer: &Arc<FakeRenderer>,
) -> Orchestrator {
    cancellable_orchestrator(config, runner, renderer, CancellationToken::new())
}

pub fn cancellable_orchestrator(
    config: EngineConfig,
    runner: &Arc<FakeRunner>,
    renderer: &Arc<FakeRenderer>,
    cancel: CancellationToken,
) -> Orchestrator {
    Orchestrator::new(config, runner.clone(), renderer.clone(), cancel)
}

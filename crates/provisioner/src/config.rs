//! Configuration types for fleet provisioning.
//!
//! This module defines the host data model, the pipeline stage set, the
//! engine settings, and the loader for the YAML run configuration.

use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;

/// A selectable pipeline stage. Variant order is execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Materialize infrastructure with the infra-apply tool.
    Infra,
    /// Prepare the PXE boot environment.
    Pxe,
    /// Install the operating system.
    Os,
    /// Common post-install hardening.
    Post,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 4] = [Stage::Infra, Stage::Pxe, Stage::Os, Stage::Post];
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Infra => write!(f, "infra"),
            Self::Pxe => write!(f, "pxe"),
            Self::Os => write!(f, "os"),
            Self::Post => write!(f, "post"),
        }
    }
}

/// The set of stages selected for a run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StageSet(BTreeSet<Stage>);

impl StageSet {
    /// Every stage.
    #[must_use]
    pub fn all() -> Self {
        Stage::ALL.into_iter().collect()
    }

    #[must_use]
    pub fn contains(&self, stage: Stage) -> bool {
        self.0.contains(&stage)
    }

    /// Selected stages in execution order.
    pub fn iter(&self) -> impl Iterator<Item = Stage> + '_ {
        self.0.iter().copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Stage> for StageSet {
    fn from_iter<I: IntoIterator<Item = Stage>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl std::fmt::Display for StageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", names.join(","))
    }
}

/// Where a host runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Placement {
    /// A Proxmox virtual machine created by the infra-apply tool.
    #[default]
    #[serde(rename = "virtualized", alias = "proxmox")]
    Virtualized,
    /// A physical machine installed over PXE.
    #[serde(rename = "baremetal", alias = "bare-metal")]
    BareMetal,
}

impl Placement {
    #[must_use]
    pub fn is_virtualized(self) -> bool {
        self == Self::Virtualized
    }
}

/// How the host boots its installer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BootMethod {
    #[default]
    Iso,
    Image,
    Pxe,
}

/// Supported operating systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsKind {
    Ubuntu,
    Nixos,
}

impl OsKind {
    /// Whether images of this OS run cloud-init on first boot.
    ///
    /// NixOS templates are initialised through Proxmox NoCloud instead, so
    /// SSH liveness is the only readiness signal available for them.
    #[must_use]
    pub fn runs_first_boot_agent(self) -> bool {
        matches!(self, Self::Ubuntu)
    }
}

impl std::fmt::Display for OsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ubuntu => write!(f, "ubuntu"),
            Self::Nixos => write!(f, "nixos"),
        }
    }
}

/// Host addressing.
///
/// Written as `{mode: dhcp}` or `{mode: static, address_cidr, ...}`. The older
/// `{dhcp: bool, address_cidr, gateway, dns, hostname, domain, interfaces}`
/// layout is still accepted when reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "lowercase", try_from = "NetworkRepr")]
pub enum NetworkMode {
    /// Address assigned at boot and reported back by the infra tool.
    #[default]
    Dhcp,
    /// Fixed address from configuration.
    Static {
        /// Address with prefix length, e.g. `10.0.0.5/24`.
        address_cidr: String,
        #[serde(default)]
        gateway: Option<String>,
        #[serde(default)]
        dns: Vec<String>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NetworkRepr {
    Tagged(TaggedNetwork),
    Flagged(FlaggedNetwork),
}

#[derive(Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
enum TaggedNetwork {
    Dhcp,
    Static {
        address_cidr: String,
        #[serde(default)]
        gateway: Option<String>,
        #[serde(default)]
        dns: Vec<String>,
    },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FlaggedNetwork {
    #[serde(default = "default_true")]
    dhcp: bool,
    #[serde(default)]
    address_cidr: Option<String>,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    dns: Vec<String>,
    // Naming and interface layout belong to the rendered artifacts.
    #[serde(default)]
    hostname: Option<serde::de::IgnoredAny>,
    #[serde(default)]
    domain: Option<serde::de::IgnoredAny>,
    #[serde(default)]
    interfaces: Option<serde::de::IgnoredAny>,
}

impl TryFrom<NetworkRepr> for NetworkMode {
    type Error = String;

    fn try_from(repr: NetworkRepr) -> Result<Self, Self::Error> {
        match repr {
            NetworkRepr::Tagged(TaggedNetwork::Dhcp) => Ok(Self::Dhcp),
            NetworkRepr::Tagged(TaggedNetwork::Static {
                address_cidr,
                gateway,
                dns,
            }) => Ok(Self::Static {
                address_cidr,
                gateway,
                dns,
            }),
            NetworkRepr::Flagged(FlaggedNetwork { dhcp: true, .. }) => Ok(Self::Dhcp),
            NetworkRepr::Flagged(FlaggedNetwork {
                address_cidr,
                gateway,
                dns,
                ..
            }) => match address_cidr {
                Some(address_cidr) if !address_cidr.trim().is_empty() => Ok(Self::Static {
                    address_cidr,
                    gateway,
                    dns,
                }),
                _ => Err("static network requires address_cidr".to_string()),
            },
        }
    }
}

/// An OS user created during installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    pub username: String,
    #[serde(default)]
    pub ssh_authorized_keys: Vec<String>,
    #[serde(default = "default_true")]
    pub sudo: bool,
}

fn default_true() -> bool {
    true
}

fn default_tenant() -> String {
    "default".to_string()
}

fn default_cpus() -> u32 {
    2
}

fn default_memory_mb() -> u32 {
    4096
}

fn default_disk_gb() -> u32 {
    50
}

/// Machine entry from `vm_specs.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSpec {
    pub name: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default, alias = "hypervisor")]
    pub placement: Placement,
    #[serde(default)]
    pub boot_method: BootMethod,
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: u32,
}

/// Install entry from `install_config.yaml`, keyed by host name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSpec {
    pub os: OsKind,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub network: NetworkMode,
    #[serde(default)]
    pub users: Vec<UserSpec>,
    #[serde(default)]
    pub packages: Vec<String>,
}

/// A fully resolved host: machine entry paired with its install entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub name: String,
    pub tenant: String,
    pub placement: Placement,
    pub boot_method: BootMethod,
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub os: OsKind,
    pub os_version: String,
    pub network: NetworkMode,
    pub users: Vec<UserSpec>,
    pub packages: Vec<String>,
}

impl HostSpec {
    /// Pair a machine entry with its install entry.
    #[must_use]
    pub fn from_parts(machine: &MachineSpec, install: &InstallSpec) -> Self {
        Self {
            name: machine.name.clone(),
            tenant: machine.tenant.clone(),
            placement: machine.placement,
            boot_method: machine.boot_method,
            cpus: machine.cpus,
            memory_mb: machine.memory_mb,
            disk_gb: machine.disk_gb,
            os: install.os,
            os_version: install.version.clone(),
            network: install.network.clone(),
            users: install.users.clone(),
            packages: install.packages.clone(),
        }
    }

    /// The static address without its prefix length, if addressing is static.
    #[must_use]
    pub fn static_address(&self) -> Option<&str> {
        match &self.network {
            NetworkMode::Static { address_cidr, .. } => address_cidr
                .split('/')
                .next()
                .map(str::trim)
                .filter(|addr| !addr.is_empty()),
            NetworkMode::Dhcp => None,
        }
    }

    #[must_use]
    pub fn uses_dhcp(&self) -> bool {
        matches!(self.network, NetworkMode::Dhcp)
    }

    /// Whether the PXE stage applies to this host.
    #[must_use]
    pub fn needs_pxe(&self) -> bool {
        self.placement == Placement::BareMetal || self.boot_method == BootMethod::Pxe
    }

    /// The user the engine connects as.
    #[must_use]
    pub fn ssh_user(&self, username_override: Option<&str>) -> String {
        match self.os {
            OsKind::Nixos => "root".to_string(),
            OsKind::Ubuntu => username_override
                .map(str::to_string)
                .or_else(|| self.users.first().map(|u| u.username.clone()))
                .unwrap_or_else(|| "ubuntu".to_string()),
        }
    }
}

/// External renderer invocation from `defaults.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Program and arguments; `{host}` and `{workspace}` are substituted.
    pub command: Vec<String>,
}

/// Fleet-wide defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Defaults {
    /// Infra provider API endpoint.
    #[serde(default, alias = "pm_api_url")]
    pub infra_endpoint: Option<String>,
    #[serde(default)]
    pub renderer: Option<RendererConfig>,
}

impl Defaults {
    /// Resolve the infra endpoint, falling back to the legacy env vars.
    #[must_use]
    pub fn resolve_endpoint(&self, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        self.infra_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .or_else(|| env("PM_API_URL").filter(|e| !e.is_empty()))
            .or_else(|| env("PROXMOX_VE_ENDPOINT").filter(|e| !e.is_empty()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct VmSpecsFile {
    #[serde(default)]
    vms: Vec<MachineSpec>,
}

#[derive(Debug, Default, Deserialize)]
struct InstallsFile {
    #[serde(default)]
    installs: HashMap<String, InstallSpec>,
}

/// Everything a run needs to know about the fleet.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub defaults: Defaults,
    pub vms: Vec<MachineSpec>,
    pub installs: HashMap<String, InstallSpec>,
}

impl RunConfig {
    /// Load the three YAML inputs. Any one path may be `-` for stdin.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read, does not parse, or fails
    /// validation.
    pub fn load(defaults: &Path, vm_specs: &Path, installs: &Path) -> anyhow::Result<Self> {
        let stdin_inputs = [defaults, vm_specs, installs]
            .iter()
            .filter(|p| is_stdin(p))
            .count();
        if stdin_inputs > 1 {
            bail!("Only one input may be read from stdin");
        }

        let defaults: Defaults = load_yaml(defaults)?;
        let vm_specs: VmSpecsFile = load_yaml(vm_specs)?;
        let install_file: InstallsFile = load_yaml(installs)?;

        let config = Self {
            defaults,
            vms: vm_specs.vms,
            installs: install_file.installs,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the type system does not cover.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending entry.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = BTreeSet::new();
        for vm in &self.vms {
            if !seen.insert(vm.name.as_str()) {
                bail!("Duplicate host name: {}", vm.name);
            }
            if vm.cpus < 1 {
                bail!("{}: cpus must be at least 1", vm.name);
            }
            if vm.memory_mb < 512 {
                bail!("{}: memory_mb must be at least 512", vm.name);
            }
            if vm.disk_gb < 8 {
                bail!("{}: disk_gb must be at least 8", vm.name);
            }
        }
        for (name, install) in &self.installs {
            if let NetworkMode::Static { address_cidr, .. } = &install.network {
                if address_cidr.trim().is_empty() {
                    bail!("{name}: static network requires address_cidr");
                }
            }
        }
        Ok(())
    }

    /// Keep only the named hosts. An empty selection keeps everything.
    pub fn retain_hosts(&mut self, names: &[String]) {
        if !names.is_empty() {
            self.vms.retain(|vm| names.contains(&vm.name));
        }
    }

    /// Resolve a machine entry into a full host spec.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the host has no install entry.
    pub fn resolve(&self, machine: &MachineSpec) -> Result<HostSpec, ProvisionError> {
        let install = self.installs.get(&machine.name).ok_or_else(|| {
            ProvisionError::config(format!("Missing install_config for host {}", machine.name))
        })?;
        Ok(HostSpec::from_parts(machine, install))
    }
}

fn is_stdin(path: &Path) -> bool {
    path.as_os_str() == "-"
}

fn load_yaml<T: serde::de::DeserializeOwned + Default>(path: &Path) -> anyhow::Result<T> {
    let content = if is_stdin(path) {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read configuration from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?
    };

    if content.trim().is_empty() {
        return Ok(T::default());
    }

    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Program names for the external tools.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub terraform: String,
    pub ansible_playbook: String,
    pub nix: String,
    pub ssh: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            terraform: "terraform".to_string(),
            ansible_playbook: "ansible-playbook".to_string(),
            nix: "nix".to_string(),
            ssh: "ssh".to_string(),
        }
    }
}

/// Readiness polling settings.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Total time budget for a probe.
    pub timeout: Duration,
    /// Delay between attempts.
    pub poll_interval: Duration,
    /// SSH connect timeout for each attempt.
    pub connect_timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Engine settings, passed explicitly to every component.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Parent directory of all host workspaces and their lock files.
    pub build_root: PathBuf,
    /// Directory holding `<tenant>/id_ed25519` keys.
    pub tenants_dir: PathBuf,
    /// Directory holding the Ansible playbooks.
    pub playbook_dir: PathBuf,
    /// Flake directory used by nixos-anywhere.
    pub nixos_flake: PathBuf,
    pub tools: ToolPaths,
    /// Maximum number of hosts processed at once.
    pub concurrency: usize,
    /// Maximum infra apply attempts per host.
    pub infra_max_retries: u32,
    /// Backoff unit; the wait after attempt k is `k * backoff_step`.
    pub backoff_step: Duration,
    /// Wait between a successful apply and the first readiness probe.
    pub boot_grace: Duration,
    pub probe: ProbeSettings,
    /// Optional deadline for every streamed tool invocation.
    pub command_timeout: Option<Duration>,
    /// Verbose tool output (TF_LOG, ansible -vvv, nixos-anywhere --debug).
    pub debug: bool,
    /// Stop after `terraform plan`.
    pub plan_only: bool,
    /// Replaces the SSH user for Ubuntu hosts.
    pub username_override: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            build_root: PathBuf::from("build"),
            tenants_dir: PathBuf::from("ms-config/tenants"),
            playbook_dir: PathBuf::from("ansible/playbooks"),
            nixos_flake: PathBuf::from("nix-solution/nixos-anywhere"),
            tools: ToolPaths::default(),
            concurrency: 4,
            infra_max_retries: 2,
            backoff_step: Duration::from_secs(15),
            boot_grace: Duration::from_secs(30),
            probe: ProbeSettings::default(),
            command_timeout: None,
            debug: false,
            plan_only: false,
            username_override: None,
        }
    }
}

impl EngineConfig {
    /// Private key for a tenant, if one has been issued.
    #[must_use]
    pub fn tenant_identity(&self, tenant: &str) -> Option<PathBuf> {
        let path = self.tenants_dir.join(tenant).join("id_ed25519");
        path.exists().then_some(path)
    }
}

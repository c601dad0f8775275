//! Provision CLI.
//!
//! Loads the fleet configuration and provisions the selected hosts.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use provisioner::config::{EngineConfig, RunConfig, Stage, StageSet};
use provisioner::orchestrator::Orchestrator;
use provisioner::process::ProcessRunner;
use provisioner::render::CommandRenderer;
use provisioner::ui;

/// Fleet provisioning for Proxmox VMs and bare metal hosts.
#[derive(Parser)]
#[command(
    name = "provision",
    version,
    about = "Provision a fleet of virtual and bare metal hosts",
    long_about = "Provision a fleet of hosts.\n\n\
                  Each host's infrastructure is applied with Terraform, the host is\n\
                  probed over SSH, then OS installation and post-configuration run\n\
                  through Ansible or nixos-anywhere."
)]
struct Cli {
    /// Fleet defaults (infra endpoint, renderer command).
    #[arg(long, default_value = "configs/defaults.yaml")]
    defaults: PathBuf,

    /// Machine entries; `-` reads stdin.
    #[arg(long, default_value = "configs/vm_specs.yaml")]
    vm_specs: PathBuf,

    /// Install entries keyed by host name; `-` reads stdin.
    #[arg(long, default_value = "configs/install_config.yaml")]
    install_config: PathBuf,

    /// Only provision these hosts.
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    hosts: Vec<String>,

    /// Stages to run (default: all).
    #[arg(long, value_enum, num_args = 1.., value_delimiter = ',')]
    targets: Vec<Stage>,

    /// Maximum hosts provisioned at once.
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Maximum Terraform apply attempts per host.
    #[arg(long, default_value_t = 2)]
    max_retries: u32,

    /// Directory for host workspaces and lock files.
    #[arg(long, default_value = "build")]
    build_root: PathBuf,

    /// Stop after `terraform plan`.
    #[arg(long)]
    plan_only: bool,

    /// SSH user for Ubuntu hosts.
    #[arg(long)]
    username: Option<String>,

    /// Verbose logging and tool output.
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    fn stages(&self) -> StageSet {
        if self.targets.is_empty() {
            StageSet::all()
        } else {
            self.targets.iter().copied().collect()
        }
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            build_root: self.build_root.clone(),
            concurrency: self.concurrency,
            infra_max_retries: self.max_retries,
            debug: self.debug,
            plan_only: self.plan_only,
            username_override: self.username.clone(),
            ..EngineConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over --debug
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut run = match RunConfig::load(&cli.defaults, &cli.vm_specs, &cli.install_config) {
        Ok(run) => run,
        Err(e) => {
            ui::print_error(&format!("{e:#}"));
            return ExitCode::from(2);
        }
    };

    run.retain_hosts(&cli.hosts);
    if run.vms.is_empty() {
        ui::print_error("No hosts matched the selection");
        return ExitCode::from(1);
    }

    match provision(&cli, &run).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            ui::print_error(&format!("{e:#}"));
            ExitCode::from(2)
        }
    }
}

async fn provision(cli: &Cli, run: &RunConfig) -> Result<u8> {
    let stages = cli.stages();
    let endpoint = run.defaults.resolve_endpoint(|key| std::env::var(key).ok());
    let renderer_command = run
        .defaults
        .renderer
        .as_ref()
        .map(|r| r.command.clone())
        .context("defaults.renderer.command is required")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let runner = Arc::new(ProcessRunner::new(cancel.clone()));
    let renderer = Arc::new(
        CommandRenderer::new(runner.clone(), renderer_command, endpoint.clone())
            .context("Invalid renderer configuration")?,
    );

    ui::print_section("Fleet Provisioning");
    ui::print_info(&format!("Hosts: {}", run.vms.len()));
    ui::print_info(&format!("Stages: {stages}"));
    if cli.plan_only {
        ui::print_warning("Plan-only mode: infrastructure will not be applied");
    }
    info!(build_root = %cli.build_root.display(), "Using build root");

    let orchestrator = Orchestrator::new(cli.engine_config(), runner, renderer, cancel);
    let summary = orchestrator
        .run_with_endpoint(run, &stages, endpoint)
        .await;

    ui::print_summary(&summary);
    Ok(summary.exit_code())
}

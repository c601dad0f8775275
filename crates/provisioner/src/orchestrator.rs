//! Pipeline orchestration.
//!
//! Each host runs `lock -> render -> infra -> address -> probe -> dispatch`
//! inside its own task. Hosts are admitted through a semaphore so at most
//! `concurrency` pipelines are active, and results are collected from a
//! [`JoinSet`]. A host's failure is recorded in its [`HostResult`] and never
//! reaches another host.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{EngineConfig, HostSpec, RunConfig, Stage, StageSet};
use crate::dispatch::{ConfigDispatcher, DispatchSettings, DispatchTarget, StageOutcome};
use crate::error::{ProvisionError, Result};
use crate::infra::{InfraEngine, InfraSettings};
use crate::lock::{Workspace, WorkspaceLocks};
use crate::process::{pause, CommandRunner};
use crate::readiness::{ProbeTarget, ReadinessProber};
use crate::render::ArtifactRenderer;
use crate::ui;

/// Address values the infra tool reports before a DHCP lease exists.
const PLACEHOLDER_ADDRESSES: [&str; 2] = ["dhcp", "dhcp-pending"];

/// What a successful pipeline did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostReport {
    /// Address the host was reached at, when infra ran.
    pub address: Option<String>,
    /// Probe result, when the host was probed.
    pub ready: Option<bool>,
    /// Infra apply attempts, when infra ran.
    pub infra_attempts: Option<u32>,
    /// True when the run stopped after `terraform plan`.
    pub planned_only: bool,
    pub stages: Vec<(Stage, StageOutcome)>,
}

/// Final state of one host.
#[derive(Debug)]
pub struct HostResult {
    pub host: String,
    pub elapsed: Duration,
    pub outcome: Result<HostReport>,
}

impl HostResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Results of a run, in input order.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub results: Vec<HostResult>,
}

impl RunSummary {
    #[must_use]
    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| !r.is_ok()).count()
    }

    /// Process exit code: 0 when every host succeeded.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        u8::from(self.failures() > 0)
    }

    #[must_use]
    pub fn get(&self, host: &str) -> Option<&HostResult> {
        self.results.iter().find(|r| r.host == host)
    }
}

/// Turn the reported address into a connectable one, failing closed.
///
/// # Errors
///
/// Returns [`ProvisionError::AddressResolution`] when no usable address is
/// known.
pub fn resolve_address(host: &HostSpec, reported: Option<&str>) -> Result<String> {
    if let Some(address) = host.static_address() {
        return Ok(address.to_string());
    }
    if !host.uses_dhcp() {
        return Err(ProvisionError::AddressResolution {
            host: host.name.clone(),
            reason: "static network without an address".into(),
        });
    }

    match reported.map(str::trim) {
        None => Err(ProvisionError::AddressResolution {
            host: host.name.clone(),
            reason: "infra outputs carry no address".into(),
        }),
        Some(addr) if addr.is_empty() || PLACEHOLDER_ADDRESSES.contains(&addr) => {
            Err(ProvisionError::AddressResolution {
                host: host.name.clone(),
                reason: format!("DHCP address not yet assigned ('{addr}')"),
            })
        }
        Some(addr) => Ok(addr.to_string()),
    }
}

/// Components shared by every host task.
struct Pipeline {
    config: EngineConfig,
    renderer: Arc<dyn ArtifactRenderer>,
    locks: WorkspaceLocks,
    infra: InfraEngine,
    prober: ReadinessProber,
    dispatcher: ConfigDispatcher,
    cancel: CancellationToken,
}

impl Pipeline {
    async fn provision(
        &self,
        host: HostSpec,
        stages: &StageSet,
        endpoint: Option<&str>,
    ) -> Result<HostReport> {
        if host.placement.is_virtualized() && endpoint.is_none() {
            return Err(ProvisionError::config(format!(
                "{}: virtualized host needs an infra endpoint (infra_endpoint, PM_API_URL or PROXMOX_VE_ENDPOINT)",
                host.name
            )));
        }

        self.locks
            .with_host_lock(&host.name, |ws| self.run_locked(&host, ws, stages))
            .await?
    }

    async fn run_locked(
        &self,
        host: &HostSpec,
        ws: Workspace,
        stages: &StageSet,
    ) -> Result<HostReport> {
        let mut report = HostReport::default();

        self.renderer.render(host, &ws).await?;

        if host.placement.is_virtualized() && stages.contains(Stage::Infra) {
            let outcome = self.infra.apply(&ws.infra_dir()).await?;
            report.infra_attempts = Some(outcome.attempts);
            if !outcome.applied {
                report.planned_only = true;
                return Ok(report);
            }

            let address = resolve_address(host, outcome.address.as_deref())?;
            info!(%address, "Resolved host address");

            pause(self.config.boot_grace, &self.cancel, "boot grace period").await?;
            let identity = self.config.tenant_identity(&host.tenant);
            let probe = self
                .prober
                .wait_until_ready(&ProbeTarget {
                    address: address.clone(),
                    host_name: host.name.clone(),
                    ssh_user: host.ssh_user(self.config.username_override.as_deref()),
                    identity,
                    os: host.os,
                })
                .await;
            if !probe.ready {
                warn!(
                    elapsed_secs = probe.elapsed.as_secs(),
                    "Host did not report ready, continuing with configuration"
                );
                ui::print_warning(&format!("{}: not ready after probe timeout", host.name));
            }
            report.ready = Some(probe.ready);
            report.address = Some(address);
        }

        let address = report
            .address
            .clone()
            .or_else(|| host.static_address().map(str::to_string));
        let identity = self.config.tenant_identity(&host.tenant);
        let dispatched = self
            .dispatcher
            .dispatch(
                DispatchTarget {
                    host,
                    workspace: &ws,
                    address: address.as_deref(),
                    identity: identity.as_deref(),
                },
                stages,
            )
            .await?;
        report.stages = dispatched.stages;
        Ok(report)
    }
}

/// Provisions a fleet of hosts.
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        config: EngineConfig,
        runner: Arc<dyn CommandRunner>,
        renderer: Arc<dyn ArtifactRenderer>,
        cancel: CancellationToken,
    ) -> Self {
        let infra = InfraEngine::new(
            Arc::clone(&runner),
            InfraSettings::from(&config),
            cancel.clone(),
        );
        let prober = ReadinessProber::new(
            Arc::clone(&runner),
            config.probe.clone(),
            config.tools.ssh.clone(),
            cancel.clone(),
        );
        let dispatcher = ConfigDispatcher::new(runner, DispatchSettings::from(&config));
        let locks = WorkspaceLocks::new(config.build_root.clone());

        Self {
            pipeline: Arc::new(Pipeline {
                config,
                renderer,
                locks,
                infra,
                prober,
                dispatcher,
                cancel,
            }),
        }
    }

    /// Provision every host in `run`.
    ///
    /// Never fails as a whole; per-host errors are reported in the summary.
    pub async fn run(&self, run: &RunConfig, stages: &StageSet) -> RunSummary {
        let endpoint = run
            .defaults
            .resolve_endpoint(|key| std::env::var(key).ok());
        self.run_with_endpoint(run, stages, endpoint).await
    }

    /// Like [`Orchestrator::run`] with an already resolved infra endpoint.
    pub async fn run_with_endpoint(
        &self,
        run: &RunConfig,
        stages: &StageSet,
        endpoint: Option<String>,
    ) -> RunSummary {
        let concurrency = self.pipeline.config.concurrency.max(1);
        let cancel = &self.pipeline.cancel;
        info!(
            hosts = run.vms.len(),
            concurrency,
            stages = %stages,
            "Starting provisioning run"
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let endpoint: Arc<Option<String>> = Arc::new(endpoint);
        let mut slots: Vec<Option<HostResult>> = run.vms.iter().map(|_| None).collect();
        let mut tasks = JoinSet::new();

        for (idx, machine) in run.vms.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                warn!(host = %machine.name, "Run cancelled before host started");
                slots[idx] = Some(HostResult {
                    host: machine.name.clone(),
                    elapsed: Duration::ZERO,
                    outcome: Err(ProvisionError::Cancelled {
                        command: format!("provision {}", machine.name),
                    }),
                });
                continue;
            };

            let name = machine.name.clone();
            let resolved = run.resolve(machine);
            let pipeline = Arc::clone(&self.pipeline);
            let endpoint = Arc::clone(&endpoint);
            let stages = stages.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                ui::print_step(&format!("{name}: provisioning started"));

                let span = info_span!("host", host = %name);
                let worker = tokio::spawn(
                    async move {
                        let host = resolved?;
                        pipeline
                            .provision(host, &stages, endpoint.as_deref())
                            .await
                    }
                    .instrument(span),
                );
                let outcome = match worker.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(host = %name, error = %e, "Provisioning task aborted");
                        Err(ProvisionError::TaskPanicked { host: name.clone() })
                    }
                };

                let elapsed = started.elapsed();
                match &outcome {
                    Ok(_) => ui::print_success(&format!("{name}: provisioned")),
                    Err(e) => ui::print_error(&format!("{name}: {e}")),
                }
                (
                    idx,
                    HostResult {
                        host: name,
                        elapsed,
                        outcome,
                    },
                )
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(e) => error!(error = %e, "Host task failed to report"),
            }
        }

        let results = slots
            .into_iter()
            .zip(&run.vms)
            .map(|(slot, machine)| {
                slot.unwrap_or_else(|| HostResult {
                    host: machine.name.clone(),
                    elapsed: Duration::ZERO,
                    outcome: Err(ProvisionError::TaskPanicked {
                        host: machine.name.clone(),
                    }),
                })
            })
            .collect();

        let summary = RunSummary { results };
        info!(
            hosts = summary.results.len(),
            failed = summary.failures(),
            "Provisioning run finished"
        );
        summary
    }
}

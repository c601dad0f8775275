//! Fleet provisioning engine.
//!
//! Brings up virtual (Proxmox) and bare-metal hosts concurrently: each host's
//! workspace is locked, its artifacts rendered, infrastructure applied with
//! bounded retries, the host probed over SSH, and the OS installation and
//! post-configuration stages dispatched through Ansible or nixos-anywhere.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use provisioner::{CommandRenderer, EngineConfig, Orchestrator, ProcessRunner, RunConfig, StageSet};
//! use tokio_util::sync::CancellationToken;
//!
//! let run = RunConfig::load("defaults.yaml".as_ref(), "vm_specs.yaml".as_ref(), "install_config.yaml".as_ref())?;
//! let cancel = CancellationToken::new();
//! let runner = Arc::new(ProcessRunner::new(cancel.clone()));
//! let renderer = Arc::new(CommandRenderer::new(runner.clone(), vec!["./render".into()], None)?);
//! let summary = Orchestrator::new(EngineConfig::default(), runner, renderer, cancel)
//!     .run(&run, &StageSet::all())
//!     .await;
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]
// Allow imports after statements in functions
#![allow(clippy::items_after_statements)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod infra;
pub mod lock;
pub mod orchestrator;
pub mod process;
pub mod readiness;
pub mod render;
pub mod ui;

// Re-export commonly used types at the crate root
pub use config::{EngineConfig, HostSpec, RunConfig, Stage, StageSet};
pub use error::{ProvisionError, Result};
pub use orchestrator::{HostReport, HostResult, Orchestrator, RunSummary};
pub use process::{CapturedOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use render::{ArtifactRenderer, CommandRenderer};

//! Per-host workspace locking.
//!
//! Each host owns `<build_root>/<host>/` for the duration of its pipeline.
//! Exclusivity comes from `flock(LOCK_EX)` on `<build_root>/<host>.lock`, which
//! lives next to the workspace rather than inside it so wiping the workspace
//! never drops the lock. `flock` locks belong to the open file description, so
//! two tasks in one process contend exactly like two separate processes.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::error::{ProvisionError, Result};

/// Paths inside a host's workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    host: String,
    root: PathBuf,
}

impl Workspace {
    #[must_use]
    pub fn new(host: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            root: root.into(),
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rendered infra-apply tool configuration.
    #[must_use]
    pub fn infra_dir(&self) -> PathBuf {
        self.root.join("tf")
    }

    #[must_use]
    pub fn ansible_dir(&self) -> PathBuf {
        self.root.join("ansible")
    }

    /// Rendered Ansible inventory.
    #[must_use]
    pub fn inventory(&self) -> PathBuf {
        self.ansible_dir().join("inventory.yaml")
    }

    /// Rendered per-host variables file.
    #[must_use]
    pub fn host_vars(&self) -> PathBuf {
        self.ansible_dir().join(format!("{}.vars.yaml", self.host))
    }

    /// Host spec handed to the renderer.
    #[must_use]
    pub fn host_spec_file(&self) -> PathBuf {
        self.root.join("host.json")
    }
}

/// Holds the exclusive lock until dropped.
struct HostLockGuard {
    _lock: Flock<File>,
    host: String,
}

impl Drop for HostLockGuard {
    fn drop(&mut self) {
        debug!(host = %self.host, "Released workspace lock");
    }
}

/// Hands out exclusive, freshly reset workspaces under a build root.
#[derive(Debug, Clone)]
pub struct WorkspaceLocks {
    build_root: PathBuf,
}

impl WorkspaceLocks {
    #[must_use]
    pub fn new(build_root: impl Into<PathBuf>) -> Self {
        Self {
            build_root: build_root.into(),
        }
    }

    #[must_use]
    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    /// Workspace for `host`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the name cannot be a directory name.
    pub fn workspace(&self, host: &str) -> Result<Workspace> {
        validate_host_name(host)?;
        Ok(Workspace::new(host, self.build_root.join(host)))
    }

    /// Lock file guarding `host`'s workspace.
    #[must_use]
    pub fn lock_path(&self, host: &str) -> PathBuf {
        self.build_root.join(format!("{host}.lock"))
    }

    /// Run `f` with exclusive ownership of `host`'s workspace.
    ///
    /// Blocks until the lock is free, then empties the workspace before
    /// calling `f`. The lock is released however `f` ends, including panics
    /// and the returned future being dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken or the workspace cannot be
    /// reset. Errors from `f` are part of its own output `T`.
    pub async fn with_host_lock<F, Fut, T>(&self, host: &str, f: F) -> Result<T>
    where
        F: FnOnce(Workspace) -> Fut,
        Fut: Future<Output = T>,
    {
        let workspace = self.workspace(host)?;
        let _guard = self.acquire(host).await?;
        reset_dir(workspace.root()).await?;
        debug!(host, workspace = %workspace.root().display(), "Workspace ready");
        Ok(f(workspace).await)
    }

    async fn acquire(&self, host: &str) -> Result<HostLockGuard> {
        let path = self.lock_path(host);
        let lock = tokio::task::spawn_blocking(move || -> std::io::Result<Flock<File>> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| errno.into())
        })
        .await
        .map_err(|e| ProvisionError::Lock {
            host: host.to_string(),
            source: std::io::Error::other(e),
        })?
        .map_err(|source| ProvisionError::Lock {
            host: host.to_string(),
            source,
        })?;

        debug!(host, "Acquired workspace lock");
        Ok(HostLockGuard {
            _lock: lock,
            host: host.to_string(),
        })
    }
}

/// Remove `path` if present and recreate it empty.
async fn reset_dir(path: &Path) -> Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path)
            .await
            .map_err(|e| ProvisionError::io(path, e))?,
        Ok(_) => tokio::fs::remove_file(path)
            .await
            .map_err(|e| ProvisionError::io(path, e))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(ProvisionError::io(path, e)),
    }
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| ProvisionError::io(path, e))
}

fn validate_host_name(host: &str) -> Result<()> {
    let bad = host.is_empty()
        || host.starts_with('.')
        || host.contains("..")
        || host.contains(['/', '\\'])
        || host.contains('\0');
    if bad {
        return Err(ProvisionError::config(format!(
            "Host name '{host}' cannot be used as a workspace directory"
        )));
    }
    Ok(())
}

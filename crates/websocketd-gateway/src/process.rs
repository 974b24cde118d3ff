//! Pre-forked worker pool.
//!
//! The supervisor re-executes its own binary with the hidden `--worker`
//! flag; each worker runs a full WebSocket server on the shared
//! `SO_REUSEPORT` port. The master-tenant cell path travels through the
//! environment so a bootstrap that completes after the workers started is
//! still observed.

use std::path::Path;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use websocketd_core::error::{Result, WebsocketdError};

use crate::auth::master_tenant::MASTER_TENANT_PATH_ENV;
use crate::config::{Cli, Config};

const STOP_GRACE: Duration = Duration::from_secs(10);

pub struct ProcessPool {
    children: Vec<Child>,
}

impl ProcessPool {
    /// Spawn `process_workers` worker processes.
    pub fn spawn(config: &Config, cli: &Cli, master_tenant_path: &Path) -> Result<Self> {
        let workers = config.process_workers.resolve();
        tracing::info!("starting {workers} worker process(es)");

        let exe = std::env::current_exe()
            .map_err(|e| WebsocketdError::Internal(format!("unable to find own binary: {e}")))?;

        let mut children = Vec::with_capacity(workers);
        for _ in 0..workers {
            let mut command = Command::new(&exe);
            command.arg("--worker");
            if let Some(config_file) = &cli.config_file {
                command.arg("--config-file").arg(config_file);
            }
            if config.debug {
                command.arg("--debug");
            }
            command.env(MASTER_TENANT_PATH_ENV, master_tenant_path);

            let child = command.spawn().map_err(|e| {
                WebsocketdError::Internal(format!("unable to spawn worker process: {e}"))
            })?;
            children.push(child);
        }

        Ok(Self { children })
    }

    /// SIGTERM every worker, wait for the grace period, then kill stragglers.
    pub async fn stop(mut self) {
        for child in &self.children {
            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        for mut child in self.children.drain(..) {
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!("worker process did not exit gracefully, killing it");
                    let _ = child.kill().await;
                }
            }
        }
        tracing::info!("worker processes stopped");
    }
}

/// Drop privileges to the configured service user. Skipped when not root.
pub fn change_user(name: &str) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        tracing::debug!("not running as root, keeping current user");
        return Ok(());
    }

    let user = nix::unistd::User::from_name(name)
        .map_err(|e| WebsocketdError::Internal(format!("unable to look up user {name}: {e}")))?
        .ok_or_else(|| WebsocketdError::Internal(format!("unknown user {name}")))?;

    nix::unistd::setgid(user.gid)
        .and_then(|_| nix::unistd::setuid(user.uid))
        .map_err(|e| WebsocketdError::Internal(format!("unable to change user to {name}: {e}")))
}

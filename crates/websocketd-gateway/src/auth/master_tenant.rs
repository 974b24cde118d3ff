//! Cross-process master-tenant cell.
//!
//! The supervisor learns the master tenant UUID once from the first service
//! token and publishes it through a small file (tmpfs in production); the
//! worker processes read it on demand. A worker must observe a write that
//! happens after it started, so the value is handed over by path, not by
//! inheritance. Single writer, many readers, immutable once set.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use websocketd_core::error::{Result, WebsocketdError};

use super::Token;

/// Environment variable carrying the cell path to worker processes.
pub const MASTER_TENANT_PATH_ENV: &str = "WAZO_WEBSOCKETD_MASTER_TENANT_FILE";

pub struct MasterTenantCell {
    path: PathBuf,
    cached: OnceLock<String>,
}

impl MasterTenantCell {
    /// Supervisor side: create an empty cell.
    pub fn create() -> Result<Self> {
        let path = std::env::temp_dir().join(format!(
            "wazo-websocketd-master-tenant.{}",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        Ok(Self {
            path,
            cached: OnceLock::new(),
        })
    }

    /// Worker side: attach to the cell published by the supervisor.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(MASTER_TENANT_PATH_ENV).map_err(|_| {
            WebsocketdError::Internal(format!("{MASTER_TENANT_PATH_ENV} is not set"))
        })?;
        Ok(Self::at(PathBuf::from(path)))
    }

    pub fn at(path: PathBuf) -> Self {
        Self {
            path,
            cached: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One-shot subscriber for the service-token renewer: stores the master
    /// tenant UUID from the first token's metadata.
    pub fn set_master_tenant(&self, token: &Token) {
        let tenant_uuid = match &token.metadata {
            Some(metadata) if !metadata.tenant_uuid.is_empty() => &metadata.tenant_uuid,
            _ => {
                tracing::error!("invalid token, contains no tenant_uuid");
                return;
            }
        };
        tracing::info!("setting master_tenant_uuid to '{tenant_uuid}'");
        if let Err(e) = self.write(tenant_uuid) {
            tracing::error!("unable to store master tenant uuid: {e}");
        }
    }

    pub fn get_master_tenant(&self) -> Option<String> {
        if let Some(cached) = self.cached.get() {
            return Some(cached.clone());
        }
        let value = std::fs::read_to_string(&self.path).ok()?;
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        // Written once, then immutable; safe to cache for the process life.
        let _ = self.cached.set(value.to_string());
        Some(value.to_string())
    }

    pub fn has_master_tenant(&self) -> bool {
        self.get_master_tenant().is_some()
    }

    /// Supervisor teardown.
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    fn write(&self, tenant_uuid: &str) -> std::io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, tenant_uuid)?;
        std::fs::rename(&tmp, &self.path)
    }
}

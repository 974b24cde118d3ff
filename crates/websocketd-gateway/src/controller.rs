//! Top-level lifecycle.
//!
//! Declares the upstream exchange, starts the service-token renewer with
//! its one-shot master-tenant subscriber, spawns the worker pool, then waits
//! for SIGINT/SIGTERM and tears everything down in order.

use std::sync::Arc;

use tokio::signal::unix::{signal, Signal, SignalKind};

use websocketd_core::error::{Result, WebsocketdError};

use crate::auth::{MasterTenantCell, ServiceTokenRenewer};
use crate::bus::BusService;
use crate::config::{Cli, Config};
use crate::process::ProcessPool;

pub struct Controller {
    config: Config,
}

impl Controller {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self, cli: &Cli) -> Result<()> {
        tracing::info!("wazo-websocketd starting...");

        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| WebsocketdError::Internal(format!("unable to install handler: {e}")))?;
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| WebsocketdError::Internal(format!("unable to install handler: {e}")))?;

        let master_tenant = Arc::new(MasterTenantCell::create()?);

        let interrupted = self
            .initialize(master_tenant.clone(), &mut sigint, &mut sigterm)
            .await;

        if !interrupted {
            let renewer = ServiceTokenRenewer::new(&self.config);
            let cell = master_tenant.clone();
            renewer.subscribe(
                Box::new(move |token| cell.set_master_tenant(token)),
                true, // one-shot
            );
            renewer.start().await?;

            let pool = ProcessPool::spawn(&self.config, cli, master_tenant.path())?;
            wait_shutdown(&mut sigint, &mut sigterm).await;

            pool.stop().await;
            renewer.stop().await;
        }

        master_tenant.cleanup();
        tracing::info!("wazo-websocketd stopped");
        Ok(())
    }

    /// Declare exchanges with a short-lived bus service, raced against the
    /// shutdown signal. Returns whether a signal arrived.
    async fn initialize(
        &self,
        master_tenant: Arc<MasterTenantCell>,
        sigint: &mut Signal,
        sigterm: &mut Signal,
    ) -> bool {
        let service = BusService::new(&self.config, master_tenant);
        service.start().await;

        let interrupted = tokio::select! {
            result = service.initialize_exchanges() => {
                if let Err(e) = result {
                    tracing::warn!("exchange initialization failed: {e}");
                }
                false
            }
            _ = wait_shutdown(sigint, sigterm) => true,
        };

        service.stop().await;
        interrupted
    }
}

async fn wait_shutdown(sigint: &mut Signal, sigterm: &mut Signal) {
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

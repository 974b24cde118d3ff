//! Shared per-worker state handed to the WebSocket handler.
//!
//! Everything is `Arc`-friendly and cloneable.

use std::sync::Arc;

use crate::auth::{Authenticator, MasterTenantCell};
use crate::bus::BusService;
use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    authenticator: Authenticator,
    bus: BusService,
    master_tenant: Arc<MasterTenantCell>,
}

impl AppState {
    pub fn new(config: Config, master_tenant: Arc<MasterTenantCell>) -> Self {
        let authenticator = Authenticator::new(&config);
        let bus = BusService::new(&config, master_tenant.clone());
        Self {
            inner: Arc::new(AppStateInner {
                config,
                authenticator,
                bus,
                master_tenant,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.inner.authenticator
    }

    pub fn bus(&self) -> &BusService {
        &self.inner.bus
    }

    pub fn master_tenant(&self) -> &MasterTenantCell {
        &self.inner.master_tenant
    }
}

//! Application state

use std::sync::Arc;

use storefront_billing::BillingService;

use crate::auth::JwtManager;
use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub billing: Arc<BillingService>,
    pub jwt_manager: JwtManager,
}

impl AppState {
    pub fn new(config: Config, billing: BillingService) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret);
        Self {
            config: Arc::new(config),
            billing: Arc::new(billing),
            jwt_manager,
        }
    }
}

pub mod types;
pub mod error;
pub mod config;
pub mod store;
pub mod signing;
pub mod session;
pub mod permissions;
pub mod families;
pub mod selector;
pub mod backfill;
pub mod email;
pub mod invitations;
pub mod users;
pub mod resources;
pub mod dashboard;
pub mod http;

use std::sync::Arc;

use config::AppConfig;
use email::Mailer;
use signing::Signer;
use store::Store;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub mailer: Arc<dyn Mailer>,
    pub signer: Signer,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, mailer: Arc<dyn Mailer>, config: AppConfig) -> Arc<Self> {
        let signer = Signer::new(&config.session_secret);
        Arc::new(Self {
            store,
            mailer,
            signer,
            config,
        })
    }
}

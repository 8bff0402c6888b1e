use std::sync::Arc;

use config::Config;
use notify::Notifier;
use store::Store;

pub mod config;
pub mod error;
pub mod middleware;
pub mod models;
pub mod notify;
pub mod router;
pub mod routes;
pub mod store;
pub mod timestamp;
pub mod utils;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Config,
    pub notifier: Notifier,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        Self {
            notifier: Notifier::new(config.notification_url.clone()),
            store,
            config,
            http: reqwest::Client::new(),
        }
    }
}

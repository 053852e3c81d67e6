use std::sync::Arc;

use chrono::Duration;

use chatty_db::Database;
use chatty_gateway::dispatcher::Dispatcher;

use crate::error::ApiError;
use crate::notify::{EmailSender, SmsSender};
use crate::storage::Storage;

pub type AppState = Arc<AppStateInner>;

pub struct AuthConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    /// Mark auth cookies `Secure` (production deployments behind TLS).
    pub secure_cookies: bool,
}

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub storage: Storage,
    pub auth: AuthConfig,
    pub mailer: Arc<dyn EmailSender>,
    pub sms: Arc<dyn SmsSender>,
    /// Prefix put in front of the stored 10-digit contact when texting.
    pub sms_country_code: String,
}

impl AppStateInner {
    /// Run a blocking DB call off the async runtime.
    pub async fn run_db<F, T>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let result = tokio::task::spawn_blocking(move || f(&db)).await?;
        Ok(result?)
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use chatty_db::Database;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Hourly sweep of OTP request timestamps outside the 24 h window and of
/// codes that have expired.
pub fn spawn(db: Arc<Database>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            let db = db.clone();
            let result = tokio::task::spawn_blocking(move || {
                let now = Utc::now();
                let pruned = db.prune_otp_requests(now - chrono::Duration::hours(24))?;
                let cleared = db.clear_expired_otps(now)?;
                anyhow::Ok((pruned, cleared))
            })
            .await;
            match result {
                Ok(Ok((pruned, cleared))) => {
                    debug!("OTP cleanup: {} request records pruned, {} codes cleared", pruned, cleared)
                }
                Ok(Err(e)) => warn!("OTP cleanup failed: {:#}", e),
                Err(e) => warn!("OTP cleanup task panicked: {}", e),
            }
        }
    })
}

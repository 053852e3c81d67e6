mod cleanup;
mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{HeaderValue, Method, header};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use chatty_api::notify::{
    EmailSender, LogEmailSender, LogSmsSender, SmsSender, SmtpEmailSender, WebhookSmsSender,
};
use chatty_api::routes::build_router;
use chatty_api::state::{AppState, AppStateInner, AuthConfig};
use chatty_api::storage::Storage;
use chatty_gateway::dispatcher::Dispatcher;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatty=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(chatty_db::Database::open(&config.db_path)?);
    let storage = Storage::new(config.upload_dir.clone(), &config.public_url).await?;

    let mailer: Arc<dyn EmailSender> = match &config.smtp {
        Some(smtp) => {
            info!("Sending email through {}:{}", smtp.host, smtp.port);
            let sender = SmtpEmailSender::new(&smtp.host, smtp.port, smtp.credentials.clone(), &smtp.from)
                .map_err(|e| anyhow::anyhow!("SMTP setup failed: {}", e))?;
            Arc::new(sender)
        }
        None => {
            warn!("SMTP_HOST not set; emails will only be logged");
            Arc::new(LogEmailSender)
        }
    };
    let sms: Arc<dyn SmsSender> = match &config.sms_webhook_url {
        Some(url) => Arc::new(WebhookSmsSender::new(url)),
        None => {
            warn!("SMS_WEBHOOK_URL not set; text messages will only be logged");
            Arc::new(LogSmsSender)
        }
    };

    let state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        dispatcher: Dispatcher::new(),
        storage,
        auth: AuthConfig {
            access_secret: config.access_secret.clone(),
            refresh_secret: config.refresh_secret.clone(),
            access_ttl: chrono::Duration::seconds(config.access_ttl_secs),
            refresh_ttl: chrono::Duration::seconds(config.refresh_ttl_secs),
            secure_cookies: config.production,
        },
        mailer,
        sms,
        sms_country_code: config.sms_country_code.clone(),
    });

    cleanup::spawn(db);

    let app = build_router(state)
        .layer(cors_layer(&config)?)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Chatty server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Chatty server stopped");
    Ok(())
}

/// Cookies carry the session, so a concrete origin list allows credentials;
/// the wildcard cannot.
fn cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Ok(match &config.cors_origins {
        None => layer.allow_origin(Any),
        Some(origins) => {
            let origins = origins
                .iter()
                .map(|o| HeaderValue::from_str(o))
                .collect::<Result<Vec<_>, _>>()?;
            layer
                .allow_origin(AllowOrigin::list(origins))
                .allow_credentials(true)
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

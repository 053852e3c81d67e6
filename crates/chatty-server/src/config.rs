use std::path::PathBuf;

use anyhow::{Context, Result, bail};

/// Values that ship in sample env files and must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &["", "changeme", "change-me", "secret", "dev-secret-change-me"];

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    /// `None` means any origin.
    pub cors_origins: Option<Vec<String>>,
    pub upload_dir: PathBuf,
    pub public_url: String,
    pub production: bool,
    pub smtp: Option<SmtpConfig>,
    pub sms_webhook_url: Option<String>,
    pub sms_country_code: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());
        let optional = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let access_secret = secret(&get, "ACCESS_TOKEN_SECRET")?;
        let refresh_secret = secret(&get, "REFRESH_TOKEN_SECRET")?;
        if access_secret == refresh_secret {
            bail!("ACCESS_TOKEN_SECRET and REFRESH_TOKEN_SECRET must differ");
        }

        let cors = var("CORS_ORIGIN", "*");
        let cors_origins = if cors.trim() == "*" {
            None
        } else {
            Some(
                cors.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect(),
            )
        };

        let smtp = match optional("SMTP_HOST") {
            Some(host) => {
                let port = var("SMTP_PORT", "587")
                    .parse()
                    .context("SMTP_PORT must be a port number")?;
                let credentials = optional("SMTP_USER").map(|user| (user, var("SMTP_PASS", "")));
                let from = optional("SMTP_FROM")
                    .context("SMTP_FROM is required when SMTP_HOST is set")?;
                Some(SmtpConfig {
                    host,
                    port,
                    credentials,
                    from,
                })
            }
            None => None,
        };

        Ok(Self {
            host: var("CHATTY_HOST", "0.0.0.0"),
            port: var("CHATTY_PORT", "8000")
                .parse()
                .context("CHATTY_PORT must be a port number")?,
            db_path: PathBuf::from(var("CHATTY_DB_PATH", "chatty.db")),
            access_secret,
            refresh_secret,
            access_ttl_secs: var("ACCESS_TOKEN_EXPIRY_SECS", "86400")
                .parse()
                .context("ACCESS_TOKEN_EXPIRY_SECS must be a number of seconds")?,
            refresh_ttl_secs: var("REFRESH_TOKEN_EXPIRY_SECS", "864000")
                .parse()
                .context("REFRESH_TOKEN_EXPIRY_SECS must be a number of seconds")?,
            cors_origins,
            upload_dir: PathBuf::from(var("CHATTY_UPLOAD_DIR", "./uploads")),
            public_url: var("CHATTY_PUBLIC_URL", "http://localhost:8000"),
            production: var("CHATTY_ENV", "development") == "production",
            smtp,
            sms_webhook_url: optional("SMS_WEBHOOK_URL"),
            sms_country_code: var("SMS_COUNTRY_CODE", "+91"),
        })
    }
}

fn secret(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    let value = get(key).with_context(|| format!("{key} must be set"))?;
    if PLACEHOLDER_SECRETS.contains(&value.trim()) {
        bail!("{key} is a placeholder; set a real secret");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const SECRETS: [(&str, &str); 2] = [
        ("ACCESS_TOKEN_SECRET", "a-real-access-secret"),
        ("REFRESH_TOKEN_SECRET", "a-real-refresh-secret"),
    ];

    #[test]
    fn defaults() {
        let config = Config::from_lookup(lookup(&SECRETS)).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.access_ttl_secs, 86400);
        assert_eq!(config.refresh_ttl_secs, 864000);
        assert!(config.cors_origins.is_none());
        assert!(config.smtp.is_none());
        assert!(!config.production);
        assert_eq!(config.sms_country_code, "+91");
    }

    #[test]
    fn missing_or_placeholder_secret_is_rejected() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
        let err = Config::from_lookup(lookup(&[
            ("ACCESS_TOKEN_SECRET", "changeme"),
            ("REFRESH_TOKEN_SECRET", "a-real-refresh-secret"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("placeholder"));
    }

    #[test]
    fn cors_list_and_smtp() {
        let mut pairs = SECRETS.to_vec();
        pairs.extend([
            ("CORS_ORIGIN", "http://a.test, http://b.test"),
            ("SMTP_HOST", "smtp.test"),
            ("SMTP_USER", "bot"),
            ("SMTP_PASS", "pw"),
            ("SMTP_FROM", "Chatty <bot@chatty.test>"),
            ("CHATTY_ENV", "production"),
        ]);
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(
            config.cors_origins.unwrap(),
            vec!["http://a.test".to_string(), "http://b.test".to_string()]
        );
        let smtp = config.smtp.unwrap();
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.credentials, Some(("bot".into(), "pw".into())));
        assert!(config.production);
    }
}

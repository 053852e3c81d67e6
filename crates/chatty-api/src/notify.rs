//! Outbound delivery of OTP codes: email over SMTP, SMS over a generic
//! webhook, with log-only fallbacks when neither is configured.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor, message::header::ContentType,
};
use serde::Serialize;
use tracing::{info, warn};

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> Result<(), String>;
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    /// `to` already carries the country prefix.
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), String>;
}

// -- Email --

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: Message) -> Result<(), String>;
}

#[async_trait]
impl Mailer for AsyncSmtpTransport<Tokio1Executor> {
    async fn send(&self, email: Message) -> Result<(), String> {
        AsyncTransport::send(self, email)
            .await
            .map(|_resp| ())
            .map_err(|e| e.to_string())
    }
}

pub struct SmtpEmailSender {
    mailer: Box<dyn Mailer>,
    from_email: String,
}

impl SmtpEmailSender {
    pub fn new_with_mailer(mailer: Box<dyn Mailer>, from_email: &str) -> Self {
        Self {
            mailer,
            from_email: from_email.to_string(),
        }
    }

    /// STARTTLS relay with credentials when a user is given, plain
    /// unauthenticated SMTP (Mailpit, MailHog) otherwise.
    pub fn new(
        host: &str,
        port: u16,
        credentials: Option<(String, String)>,
        from_email: &str,
    ) -> Result<Self, String> {
        let transport = match credentials {
            Some((user, pass)) => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| e.to_string())?
                .port(port)
                .credentials(Credentials::new(user, pass))
                .build(),
            None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
                .port(port)
                .build(),
        };
        Ok(Self::new_with_mailer(Box::new(transport), from_email))
    }
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> Result<(), String> {
        let email = Message::builder()
            .from(self.from_email.parse().map_err(|e| format!("{:?}", e))?)
            .to(to.parse().map_err(|e| format!("{:?}", e))?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())
            .map_err(|e| e.to_string())?;

        self.mailer.send(email).await
    }
}

/// Writes emails to the log instead of sending them.
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> Result<(), String> {
        info!("[email] to={} subject={:?}\n{}", to, subject, html);
        Ok(())
    }
}

// -- SMS --

#[derive(Serialize)]
struct SmsPayload<'a> {
    to: &'a str,
    body: &'a str,
}

/// POSTs `{"to": ..., "body": ...}` to a configured URL.
pub struct WebhookSmsSender {
    client: reqwest::Client,
    url: String,
}

impl WebhookSmsSender {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl SmsSender for WebhookSmsSender {
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), String> {
        let resp = self
            .client
            .post(&self.url)
            .json(&SmsPayload { to, body })
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            warn!("SMS webhook answered {}", resp.status());
            return Err(format!("SMS webhook returned {}", resp.status()));
        }
        Ok(())
    }
}

pub struct LogSmsSender;

#[async_trait]
impl SmsSender for LogSmsSender {
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), String> {
        info!("[sms] to={} body={:?}", to, body);
        Ok(())
    }
}

// -- Templates --

pub fn verification_email(username: &str, otp: &str) -> (String, String) {
    let subject = "Verify your email".to_string();
    let html = format!(
        "<p>Hi {username},</p>\
         <p>Your Chatty verification code is <b>{otp}</b>.</p>\
         <p>It expires in five minutes.</p>"
    );
    (subject, html)
}

pub fn password_reset_email(username: &str, otp: &str) -> (String, String) {
    let subject = "Reset your password".to_string();
    let html = format!(
        "<p>Hi {username},</p>\
         <p>Use <b>{otp}</b> to reset your Chatty password.</p>\
         <p>It expires in five minutes. If you did not ask for this, ignore this email.</p>"
    );
    (subject, html)
}

pub fn verification_sms(otp: &str) -> String {
    format!("Your Chatty verification code is {otp}. It expires in five minutes.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct CapturingMailer {
        sent: Arc<Mutex<Vec<Message>>>,
    }

    #[async_trait]
    impl Mailer for CapturingMailer {
        async fn send(&self, email: Message) -> Result<(), String> {
            self.sent.lock().unwrap().push(email);
            Ok(())
        }
    }

    #[tokio::test]
    async fn smtp_sender_builds_html_message() {
        let mailer = CapturingMailer::default();
        let sender = SmtpEmailSender::new_with_mailer(Box::new(mailer.clone()), "chatty@example.com");

        let (subject, html) = verification_email("alice", "123456");
        sender.send_email("alice@example.com", &subject, &html).await.unwrap();

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let raw = String::from_utf8(sent[0].formatted()).unwrap();
        assert!(raw.contains("Subject: Verify your email"));
        assert!(raw.contains("text/html"));
    }

    #[tokio::test]
    async fn smtp_sender_rejects_bad_recipient() {
        let mailer = CapturingMailer::default();
        let sender = SmtpEmailSender::new_with_mailer(Box::new(mailer.clone()), "chatty@example.com");

        let result = sender.send_email("not-an-email", "s", "<p>b</p>").await;
        assert!(result.is_err());
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn templates_carry_the_code() {
        let (_, html) = password_reset_email("bob", "654321");
        assert!(html.contains("654321"));
        assert!(verification_sms("111222").contains("111222"));
    }
}

//! Outbound reset-link e-mail.
//!
//! `NotificationGateway::send` hands the message to a detached task and returns at once.
//! Delivery is attempted once; failures are logged and never reach the caller.
mod smtp;
mod templates;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::config::ui_link;

pub use smtp::SmtpMailer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, mail: OutboundMail) -> anyhow::Result<()>;
}

/// Used when no SMTP relay is configured; writes the message to the log instead.
pub struct LogMailer;

#[async_trait]
impl MailTransport for LogMailer {
    async fn deliver(&self, mail: OutboundMail) -> anyhow::Result<()> {
        info!(to = %mail.to, subject = %mail.subject, body = %mail.html, "mail not sent: no SMTP relay configured");
        Ok(())
    }
}

#[derive(Clone)]
pub struct NotificationGateway {
    transport: Arc<dyn MailTransport>,
    ui_url: String,
}

impl NotificationGateway {
    pub fn new(transport: Arc<dyn MailTransport>, ui_url: &str) -> Self {
        Self {
            transport,
            ui_url: ui_url.to_string(),
        }
    }

    pub fn reset_link(&self, reset_token: &str) -> String {
        ui_link(&self.ui_url, "/reset-password", reset_token)
    }

    /// Fire-and-forget.
    pub fn send(&self, to_email: &str, reset_token: &str) {
        let mail = OutboundMail {
            to: to_email.to_string(),
            subject: templates::RESET_SUBJECT.to_string(),
            html: templates::reset_email_html(&self.reset_link(reset_token)),
        };
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let to = mail.to.clone();
            match transport.deliver(mail).await {
                Ok(()) => info!(to = %to, "password reset email sent"),
                Err(e) => error!(to = %to, error = ?e, "failed to send password reset email"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingMailer;
    use std::time::Duration;

    #[tokio::test]
    async fn send_delivers_reset_link_in_background() {
        let (mailer, mut rx) = RecordingMailer::new();
        let gateway = NotificationGateway::new(Arc::new(mailer), "https://ui.example.com");

        gateway.send("ada@example.com", "tok123");

        let mail = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery in time")
            .expect("one mail");
        assert_eq!(mail.to, "ada@example.com");
        assert!(mail
            .html
            .contains("https://ui.example.com/reset-password?token=tok123"));
        assert!(mail.html.contains("15 minutes"));
    }

    #[tokio::test]
    async fn failing_transport_does_not_panic_caller() {
        struct Broken;
        #[async_trait]
        impl MailTransport for Broken {
            async fn deliver(&self, _mail: OutboundMail) -> anyhow::Result<()> {
                anyhow::bail!("relay down")
            }
        }
        let gateway = NotificationGateway::new(Arc::new(Broken), "https://ui.example.com");
        gateway.send("ada@example.com", "tok123");
        tokio::task::yield_now().await;
    }
}

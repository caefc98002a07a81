//! Notification fan-out: SMTP email and JSON webhook, each independently
//! gated by configuration and by the per-level on_error/on_completion
//! switches. Delivery failures are logged and swallowed; a dead SMTP server
//! must never fail a compression session.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde_json::json;
use tracing::{info, warn};

use crate::press_core::catalog::Catalog;
use crate::press_core::config::{Config, EmailConfig};
use crate::press_core::domain::{Severity, SessionStats};
use crate::press_core::resources;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    /// Session completion and other good news; gated by `on_completion`.
    Info,
    /// Worker and session failures; gated by `on_error`.
    Error,
}

impl NotifyLevel {
    fn as_str(self) -> &'static str {
        match self {
            NotifyLevel::Info => "info",
            NotifyLevel::Error => "error",
        }
    }

    fn severity(self) -> Severity {
        match self {
            NotifyLevel::Info => Severity::Info,
            NotifyLevel::Error => Severity::Error,
        }
    }
}

pub struct Notifier {
    catalog: Arc<Catalog>,
    http: reqwest::blocking::Client,
}

impl Notifier {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            http: reqwest::blocking::Client::new(),
        }
    }

    /// Fan a message out to every enabled sink and record it as an event.
    pub fn notify(&self, config: &Config, message: &str, level: NotifyLevel) {
        let email = &config.notifications.email;
        if email.enabled && level_enabled(level, email.on_error, email.on_completion) {
            if let Err(err) = send_email(email, level, message) {
                warn!(error = %err, "error sending email notification");
            } else {
                info!("email notification sent");
            }
        }

        let webhook = &config.notifications.webhook;
        if webhook.enabled && level_enabled(level, webhook.on_error, webhook.on_completion) {
            if let Err(err) = self.send_webhook(config, message, level) {
                warn!(error = %err, "error sending webhook notification");
            } else {
                info!("webhook notification sent");
            }
        }

        self.catalog.log_event(
            &format!("notification_{}", level.as_str()),
            message,
            level.severity(),
        );
    }

    /// Summarize a finished session and notify at info level.
    pub fn send_completion(&self, config: &Config, stats: &SessionStats) {
        let email_wants = config.notifications.email.enabled && config.notifications.email.on_completion;
        let webhook_wants =
            config.notifications.webhook.enabled && config.notifications.webhook.on_completion;
        if !email_wants && !webhook_wants {
            return;
        }

        let savings_text = if stats.total_original_size > 0 {
            let saved_gb = (stats.total_original_size - stats.total_compressed_size) as f64
                / (1024.0 * 1024.0 * 1024.0);
            format!("{saved_gb:.2}GB ({:.2}%)", stats.savings_percentage)
        } else {
            "0 GB (0%)".to_string()
        };

        self.notify(
            config,
            &format!(
                "Compression session completed. Files processed: {}, Errors: {}, Space saved: {savings_text}",
                stats.files_processed, stats.errors
            ),
            NotifyLevel::Info,
        );
    }

    fn send_webhook(&self, config: &Config, message: &str, level: NotifyLevel) -> Result<()> {
        let url = &config.notifications.webhook.url;
        let free_space_gb = resources::free_space_mb(Path::new(&config.temp_dir))
            .map(|mb| mb as f64 / 1024.0)
            .unwrap_or(0.0);
        let payload = json!({
            "level": level.as_str(),
            "message": message,
            "timestamp": chrono::Local::now().to_rfc3339(),
            "system_info": {
                "hostname": sysinfo::System::host_name().unwrap_or_default(),
                "free_space_gb": free_space_gb,
            },
        });

        let response = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .with_context(|| format!("webhook POST to {url} failed"))?;
        if !response.status().is_success() {
            anyhow::bail!("webhook response error: {}", response.status());
        }
        Ok(())
    }
}

fn level_enabled(level: NotifyLevel, on_error: bool, on_completion: bool) -> bool {
    match level {
        NotifyLevel::Error => on_error,
        NotifyLevel::Info => on_completion,
    }
}

fn send_email(config: &EmailConfig, level: NotifyLevel, body: &str) -> Result<()> {
    let from: Mailbox = config
        .from_addr
        .parse()
        .with_context(|| format!("invalid from address {}", config.from_addr))?;
    let to: Mailbox = config
        .to_addr
        .parse()
        .with_context(|| format!("invalid to address {}", config.to_addr))?;

    let subject = match level {
        NotifyLevel::Info => "Mediapress Info",
        NotifyLevel::Error => "Mediapress Error",
    };
    let email = Message::builder()
        .from(from)
        .to(to)
        .subject(subject)
        .body(body.to_string())
        .context("failed to build email message")?;

    let mailer = SmtpTransport::starttls_relay(&config.smtp_server)
        .context("failed to configure SMTP relay")?
        .port(config.smtp_port)
        .credentials(Credentials::new(
            config.username.clone(),
            config.password.clone(),
        ))
        .build();
    mailer.send(&email).context("SMTP send failed")?;
    Ok(())
}

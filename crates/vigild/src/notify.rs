//! Alert transports used by the dispatcher thread.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use lettre::address::AddressError;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use vigil_core::{Alert, Notifier, NotifyError};

/// Alerts buffered for slow SSE subscribers before they start lagging.
pub const EVENT_CAPACITY: usize = 64;

#[derive(Serialize)]
struct WebhookPayload<'a> {
    #[serde(flatten)]
    alert: &'a Alert,
    subject: String,
    /// Base64 JPEG of the face crop.
    snapshot: Option<String>,
}

/// POSTs each alert as JSON to a relay (mail gateway, chat hook, ...).
pub struct WebhookNotifier {
    url: String,
    timeout: Duration,
    client: reqwest::blocking::Client,
}

impl WebhookNotifier {
    /// Must not be called from inside a tokio runtime.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vigild/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            url: url.into(),
            timeout,
            client,
        })
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        let payload = WebhookPayload {
            alert,
            subject: alert.subject(),
            snapshot: alert.snapshot.as_deref().map(|jpeg| STANDARD.encode(jpeg)),
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    NotifyError::Timeout(self.timeout)
                } else {
                    NotifyError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        tracing::debug!(url = %self.url, alert = %alert.id, "webhook accepted alert");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailSettings {
    pub host: String,
    pub port: u16,
    pub from: String,
    pub to: String,
    /// `(user, password)` for SMTP AUTH.
    pub credentials: Option<(String, String)>,
}

#[derive(Error, Debug)]
pub enum EmailError {
    #[error("invalid mail address {address:?}: {source}")]
    Address {
        address: String,
        source: AddressError,
    },
    #[error("smtp setup failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Mails each alert over SMTP with STARTTLS, attaching the face snapshot.
pub struct EmailNotifier {
    from: Mailbox,
    to: Mailbox,
    relay: String,
    timeout: Duration,
    transport: SmtpTransport,
}

impl EmailNotifier {
    pub fn new(settings: EmailSettings, timeout: Duration) -> Result<Self, EmailError> {
        let from = mailbox(&settings.from)?;
        let to = mailbox(&settings.to)?;

        let mut builder = SmtpTransport::starttls_relay(&settings.host)?
            .port(settings.port)
            .timeout(Some(timeout));
        if let Some((user, pass)) = settings.credentials {
            builder = builder.credentials(Credentials::new(user, pass));
        }

        Ok(Self {
            from,
            to,
            relay: settings.host,
            timeout,
            transport: builder.build(),
        })
    }
}

fn mailbox(address: &str) -> Result<Mailbox, EmailError> {
    address.parse().map_err(|source| EmailError::Address {
        address: address.to_string(),
        source,
    })
}

fn message_body(alert: &Alert) -> String {
    let confidence = alert
        .distance
        .map(|d| format!("{d:.1}"))
        .unwrap_or_else(|| "-".into());
    format!(
        "Detected: {}\nConfidence: {}\nNotes: {}\nTime: {}\n",
        alert.name,
        confidence,
        alert.notes.as_deref().unwrap_or(""),
        alert.timestamp.to_rfc3339(),
    )
}

fn build_message(from: &Mailbox, to: &Mailbox, alert: &Alert) -> Result<Message, NotifyError> {
    let builder = Message::builder()
        .from(from.clone())
        .to(to.clone())
        .subject(alert.subject());
    let text = SinglePart::plain(message_body(alert));

    let message = match &alert.snapshot {
        Some(jpeg) => {
            let jpeg_type = ContentType::parse("image/jpeg")
                .map_err(|e| NotifyError::Transport(e.to_string()))?;
            let attachment = Attachment::new(format!("vigil-{}.jpg", alert.id)).body(jpeg.clone(), jpeg_type);
            builder.multipart(MultiPart::mixed().singlepart(text).singlepart(attachment))
        }
        None => builder.singlepart(text),
    };
    message.map_err(|e| NotifyError::Transport(format!("failed to build message: {e}")))
}

impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        let message = build_message(&self.from, &self.to, alert)?;
        self.transport.send(&message).map_err(|e| {
            if e.is_timeout() {
                NotifyError::Timeout(self.timeout)
            } else {
                NotifyError::Transport(e.to_string())
            }
        })?;
        tracing::debug!(relay = %self.relay, alert = %alert.id, "alert mail sent");
        Ok(())
    }
}

/// Publishes alerts to in-process subscribers (the `/events` SSE feed).
pub struct EventBusNotifier {
    tx: broadcast::Sender<Arc<Alert>>,
}

impl EventBusNotifier {
    pub fn new(tx: broadcast::Sender<Arc<Alert>>) -> Self {
        Self { tx }
    }
}

impl Notifier for EventBusNotifier {
    fn name(&self) -> &str {
        "events"
    }

    fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        // No subscribers is not a failure.
        if self.tx.send(Arc::new(alert.clone())).is_err() {
            tracing::trace!(alert = %alert.id, "no event subscribers");
        }
        Ok(())
    }
}

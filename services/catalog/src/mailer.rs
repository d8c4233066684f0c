use crate::change_feed::ChangeHandler;
use crate::config::MailConfig;
use crate::store::{ChangeKind, ChangeRecord};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised by a mail transport
#[derive(Error, Debug)]
pub enum MailError {
    #[error("Mail transport failure: {0}")]
    Transport(String),
}

/// A fully composed mail, ready for a transport
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

/// Boundary to the mail provider
#[async_trait::async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: OutboundMail) -> Result<(), MailError>;
}

/// Transport that writes mail to the log instead of the wire.
///
/// The default backend for local runs, where no provider credentials exist.
#[derive(Debug, Default)]
pub struct LogMailer;

impl LogMailer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl MailTransport for LogMailer {
    async fn send(&self, mail: OutboundMail) -> Result<(), MailError> {
        info!(
            from = %mail.from,
            to = %mail.to,
            subject = %mail.subject,
            "Mail delivered to log"
        );
        debug!(body = %mail.html_body, "Mail body");
        Ok(())
    }
}

/// Transport that records sent mail for assertions
#[derive(Debug, Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<OutboundMail>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl MailTransport for MemoryMailer {
    async fn send(&self, mail: OutboundMail) -> Result<(), MailError> {
        self.sent.lock().unwrap().push(mail);
        Ok(())
    }
}

/// Mails an upload confirmation for every cataloged image.
///
/// Fed by the catalog change feed: inserts and metadata edits both confirm,
/// removals never reach the transport. The feed is at-least-once, so a
/// duplicate change simply mails twice.
pub struct SuccessNotifier {
    transport: Arc<dyn MailTransport>,
    mail: MailConfig,
}

impl SuccessNotifier {
    pub fn new(transport: Arc<dyn MailTransport>, mail: MailConfig) -> Self {
        Self { transport, mail }
    }

    fn compose(&self, filename: &str) -> OutboundMail {
        let message = format!(
            "We received your Image. Its URL is {}/{}",
            self.mail.album_location, filename
        );
        OutboundMail {
            from: self.mail.sender.clone(),
            to: self.mail.recipient.clone(),
            subject: self.mail.subject.clone(),
            html_body: render_body(&self.mail.album_name, &self.mail.sender, &message),
        }
    }
}

#[async_trait::async_trait]
impl ChangeHandler for SuccessNotifier {
    fn name(&self) -> &str {
        "success-notifier"
    }

    async fn on_change(&self, record: &ChangeRecord) -> anyhow::Result<()> {
        if record.kind == ChangeKind::Remove {
            debug!(filename = %record.filename, "No mail for removals");
            return Ok(());
        }

        let mail = self.compose(&record.filename);
        if let Err(error) = self.transport.send(mail).await {
            metrics::counter!("catalog.mail.failed").increment(1);
            return Err(error.into());
        }

        info!(filename = %record.filename, "Confirmation mail sent");
        metrics::counter!("catalog.mail.sent").increment(1);
        Ok(())
    }
}

/// Render the confirmation body
pub fn render_body(name: &str, email: &str, message: &str) -> String {
    format!(
        "<html><body><h2>Sent from: </h2><ul><li>👤 {name}</li><li>✉️ {email}</li></ul>\
         <p>{message}</p></body></html>"
    )
}

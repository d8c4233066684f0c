use crate::config::MailConfig;
use crate::mailer::{render_body, MailTransport, OutboundMail};
use darkroom_pipeline::{
    ConsumerError, Envelope, ItemHandler, UploadNotice, DEAD_LETTER_REASON_ATTRIBUTE,
    SOURCE_QUEUE_ATTRIBUTE,
};
use std::sync::Arc;
use tracing::{error, instrument, warn};

/// Subject line for failure mail
const FAILURE_SUBJECT: &str = "Image processing failed";

/// Terminal consumer for dead-lettered uploads.
///
/// This is the last tier: nothing re-queues what it sees, so it must settle
/// every item. It names the failed uploads in the log, mails a best-effort
/// failure notice, and swallows every internal error.
pub struct FailureNotifier {
    transport: Arc<dyn MailTransport>,
    mail: MailConfig,
}

impl FailureNotifier {
    pub fn new(transport: Arc<dyn MailTransport>, mail: MailConfig) -> Self {
        Self { transport, mail }
    }

    fn compose(&self, filenames: &str, reason: &str) -> OutboundMail {
        let message = format!(
            "We could not process your upload {filenames}. Reason: {reason}"
        );
        OutboundMail {
            from: self.mail.sender.clone(),
            to: self.mail.recipient.clone(),
            subject: FAILURE_SUBJECT.to_string(),
            html_body: render_body(&self.mail.album_name, &self.mail.sender, &message),
        }
    }
}

#[async_trait::async_trait]
impl ItemHandler for FailureNotifier {
    #[instrument(skip(self, envelope), fields(message_id = %envelope.message_id))]
    async fn handle_item(&self, envelope: &Envelope) -> Result<(), ConsumerError> {
        let reason = envelope
            .message
            .attribute(DEAD_LETTER_REASON_ATTRIBUTE)
            .unwrap_or("unknown");
        let source = envelope
            .message
            .attribute(SOURCE_QUEUE_ATTRIBUTE)
            .unwrap_or("unknown");

        let filenames = match UploadNotice::from_message(&envelope.message) {
            Ok(notice) => notice
                .records
                .iter()
                .map(|r| r.object_key.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            Err(decode_error) => {
                warn!(error = %decode_error, "Dead-lettered body is not an upload notice");
                String::new()
            }
        };
        let filenames = if filenames.is_empty() {
            "unknown".to_string()
        } else {
            filenames
        };

        error!(
            filenames = %filenames,
            reason = %reason,
            source_queue = %source,
            "Upload abandoned after retries"
        );
        metrics::counter!("catalog.dead_letters.handled").increment(1);

        if let Err(mail_error) = self.transport.send(self.compose(&filenames, reason)).await {
            warn!(error = %mail_error, "Failure mail not sent");
            metrics::counter!("catalog.mail.failed").increment(1);
        } else {
            metrics::counter!("catalog.mail.sent").increment(1);
        }
        Ok(())
    }
}

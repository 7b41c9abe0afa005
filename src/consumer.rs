//! Consumer: decides the disposition of each queued ticket and sends the
//! automated reply.
//!
//! Flow per delivery:
//! 1. Parse the payload; malformed → discard
//! 2. Reply to a reply? → ack, no send (loop prevention)
//! 3. Empty or unusable sender, or our own domain → ack, no send
//! 4. Knowledge-base lookup (failure substitutes a "try again later" text)
//! 5. Send; success → ack, transport failure → requeue, any other
//!    failure → discard

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::kb::{KnowledgeBase, UNAVAILABLE_SOLUTION};
use crate::mailer::MailSender;
use crate::queue::amqp::DeliveryHandler;
use crate::queue::{DeliveryOutcome, QueueMessage};

pub struct Consumer {
    kb: Arc<dyn KnowledgeBase>,
    mailer: Arc<dyn MailSender>,
    sender_domain: String,
}

impl Consumer {
    pub fn new(
        kb: Arc<dyn KnowledgeBase>,
        mailer: Arc<dyn MailSender>,
        sender_domain: impl Into<String>,
    ) -> Self {
        Self {
            kb,
            mailer,
            sender_domain: sender_domain.into().to_lowercase(),
        }
    }

    /// Process one delivery body. Never panics on bad input.
    pub async fn handle(&self, body: &[u8]) -> DeliveryOutcome {
        let message = match QueueMessage::parse(body) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Discarding malformed queue message");
                return DeliveryOutcome::RejectDiscard;
            }
        };

        let address = extract_sender_address(&message.from);
        info!(from = %address, subject = %message.subject, "Processing queued email");

        if message.is_reply {
            info!("Skipping reply email to avoid loops");
            return DeliveryOutcome::Acknowledge;
        }

        if !is_valid_address(address) || is_own_domain(address, &self.sender_domain) {
            info!(from = %address, "Skipping internal email or invalid sender");
            return DeliveryOutcome::Acknowledge;
        }

        let solution = match self.kb.lookup(&message.summary).await {
            Ok(solution) => solution,
            Err(e) => {
                warn!(error = %e, "Knowledge-base lookup failed");
                UNAVAILABLE_SOLUTION.to_string()
            }
        };

        let subject = reply_subject(&message.subject);
        let body = compose_reply(&message.summary, &solution);
        match self.mailer.send(address, &subject, &body).await {
            Ok(()) => {
                info!(to = %address, "Responded to ticket");
                DeliveryOutcome::Acknowledge
            }
            Err(e) if e.is_transient() => {
                warn!(to = %address, error = %e, "Reply failed, requeueing");
                DeliveryOutcome::RejectRequeue
            }
            Err(e) => {
                warn!(to = %address, error = %e, "Reply cannot be built, discarding");
                DeliveryOutcome::RejectDiscard
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for Consumer {
    async fn handle(&self, body: &[u8]) -> DeliveryOutcome {
        Consumer::handle(self, body).await
    }
}

/// Bare address from `"Name <addr>"`, or the whole trimmed field.
pub fn extract_sender_address(from: &str) -> &str {
    let from = from.trim();
    match (from.rfind('<'), from.rfind('>')) {
        (Some(start), Some(end)) if start < end => from[start + 1..end].trim(),
        _ => from,
    }
}

/// Whether `address` is a bare `local@domain` mailbox we can send to.
pub fn is_valid_address(address: &str) -> bool {
    address.parse::<lettre::Address>().is_ok()
}

/// Loose suffix match of the address against our sending domain.
///
/// `bot@support.example.com` matches `support.example.com`, and so does
/// `x@mysupport.example.com`.
pub fn is_own_domain(address: &str, sender_domain: &str) -> bool {
    !sender_domain.is_empty() && address.to_lowercase().ends_with(sender_domain)
}

/// `Re: <subject>`, unless the subject already starts with `re:`.
pub fn reply_subject(subject: &str) -> String {
    let already = subject
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("re:"));
    if already {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

pub fn compose_reply(query: &str, solution: &str) -> String {
    format!(
        "Hi there,

Thank you for contacting our support team. We've received your request and here's our response:

Your Query: {query}

Our Solution:
{solution}

If you need further assistance, please don't hesitate to reach out to us.

Best regards,
Support Team

---
This is an automated response. Please do not reply to this email.
"
    )
}

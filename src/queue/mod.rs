//! Queue message contract shared by producer and consumer.

pub mod amqp;

pub use amqp::AmqpBroker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::normalize::EmailRecord;

/// One triage ticket on the `email_summaries` queue.
///
/// `from`, `subject`, `summary` and `is_reply` are required; a payload
/// missing any of them fails to parse. The rest default to empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    #[serde(default)]
    pub message_id: String,
    pub from: String,
    pub subject: String,
    #[serde(default)]
    pub original_content: String,
    pub summary: String,
    pub is_reply: bool,
    #[serde(default)]
    pub in_reply_to: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl QueueMessage {
    pub fn from_record(record: &EmailRecord, summary: String) -> Self {
        Self {
            message_id: record.message_id.clone(),
            from: record.from.clone(),
            subject: record.subject.clone(),
            original_content: record.content.clone(),
            summary,
            is_reply: record.is_reply,
            in_reply_to: record.in_reply_to.clone(),
            attachments: record.attachments.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BrokerError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// Terminal disposition of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Done; remove from the queue.
    Acknowledge,
    /// Malformed; remove without redelivery.
    RejectDiscard,
    /// Transient failure; return to the queue.
    RejectRequeue,
}

impl DeliveryOutcome {
    pub fn label(self) -> &'static str {
        match self {
            Self::Acknowledge => "ack",
            Self::RejectDiscard => "discard",
            Self::RejectRequeue => "requeue",
        }
    }
}

/// Producer-side view of the broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Declare the durable queue. Safe to call repeatedly.
    async fn declare(&self) -> Result<(), BrokerError>;

    /// Publish one persistent message; returns once the broker has accepted it.
    async fn publish(&self, message: &QueueMessage) -> Result<(), BrokerError>;
}

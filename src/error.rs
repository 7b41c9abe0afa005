//! Error types for the triage pipeline.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Normalize error: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("Summarizer error: {0}")]
    Summarize(#[from] SummarizeError),

    #[error("Knowledge base error: {0}")]
    Kb(#[from] KbError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// IMAP mailbox errors. All of these are hard failures for the run;
/// an empty search result is not an error.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IMAP login rejected for {username}")]
    AuthFailed { username: String },

    #[error("IMAP command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("IMAP connection closed by server")]
    Closed,

    #[error("IMAP {what} exceeds {limit} bytes")]
    Oversized { what: &'static str, limit: usize },

    #[error("Mailbox task panicked: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-message decode failures. The message is dropped, the batch continues.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("Message {uid} is not a parseable RFC 5322 message")]
    Unparseable { uid: u32 },

    #[error("Message {uid} has no MIME parts")]
    Empty { uid: u32 },
}

/// Summarization adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum SummarizeError {
    #[error("Summarizer request failed: {0}")]
    Request(String),

    #[error("Invalid summarizer response: {0}")]
    InvalidResponse(String),
}

/// Knowledge-base errors.
#[derive(Debug, thiserror::Error)]
pub enum KbError {
    #[error("Knowledge base unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Invalid import file: {0}")]
    Import(String),
}

/// Message broker errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Failed to connect to broker at {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Queue {queue} declaration failed: {reason}")]
    Declare { queue: String, reason: String },

    #[error("Publish to {queue} failed: {reason}")]
    Publish { queue: String, reason: String },

    #[error("Broker rejected message for {queue}")]
    Nacked { queue: String },

    #[error("Consume from {queue} failed: {reason}")]
    Consume { queue: String, reason: String },

    #[error("Failed to settle delivery {delivery_tag}: {reason}")]
    Settle { delivery_tag: u64, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outbound mail errors.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("SMTP transport error: {0}")]
    Transport(String),

    #[error("Mail task panicked: {0}")]
    Task(String),
}

impl SendError {
    /// Failures that a later attempt may not hit. Address and build errors
    /// come from the message itself and will never succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Task(_))
    }
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;

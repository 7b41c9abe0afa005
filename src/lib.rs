//! Mail triage: support inbox → summary queue → automated replies.

pub mod config;
pub mod consumer;
pub mod error;
pub mod kb;
pub mod mailbox;
pub mod mailer;
pub mod normalize;
pub mod producer;
pub mod queue;
pub mod summarize;
pub mod telemetry;

//! Producer: mailbox → normalizer → summarizer → queue, for one bounded batch.
//!
//! Per-item failures (an undecodable message, a failed summary, a failed
//! publish) are logged and the batch moves on. Only an unreachable mailbox
//! or broker aborts the run.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::mailbox::MailboxReader;
use crate::normalize::{self, EmailRecord};
use crate::queue::{Publisher, QueueMessage};
use crate::summarize::Summarizer;

/// Content shorter than this (trimmed, in characters) is published as its
/// own summary.
pub const MIN_SUMMARY_CHARS: usize = 100;

/// Counts for one producer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Identifiers returned by the mailbox search.
    pub candidates: usize,
    /// Messages decoded into records.
    pub decoded: usize,
    /// Messages accepted by the broker.
    pub published: usize,
    /// Messages whose publish failed after the retry.
    pub failed: usize,
}

pub struct Producer {
    mailbox: Arc<dyn MailboxReader>,
    summarizer: Arc<dyn Summarizer>,
    publisher: Arc<dyn Publisher>,
}

impl Producer {
    pub fn new(
        mailbox: Arc<dyn MailboxReader>,
        summarizer: Arc<dyn Summarizer>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            mailbox,
            summarizer,
            publisher,
        }
    }

    /// Publish a summary of the first `batch_size` candidate messages.
    pub async fn run(&self, batch_size: usize) -> Result<BatchReport> {
        self.publisher.declare().await?;

        let uids = self.mailbox.fetch_candidate_ids().await?;
        let mut report = BatchReport {
            candidates: uids.len(),
            ..BatchReport::default()
        };
        if uids.is_empty() {
            info!("No messages to process");
            return Ok(report);
        }

        let records = normalize::decode_range(self.mailbox.as_ref(), &uids, 0..batch_size).await?;
        report.decoded = records.len();

        for record in &records {
            info!(uid = record.uid, from = %record.from, subject = %record.subject, "Processing email");
            let summary = self.summary_for(record).await;
            let message = QueueMessage::from_record(record, summary);

            match self.publisher.publish(&message).await {
                Ok(()) => {
                    report.published += 1;
                    debug!(uid = record.uid, "Published to queue");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(uid = record.uid, error = %e, "Failed to publish, skipping message");
                }
            }
        }

        info!(
            candidates = report.candidates,
            decoded = report.decoded,
            published = report.published,
            failed = report.failed,
            "Batch complete"
        );
        Ok(report)
    }

    async fn summary_for(&self, record: &EmailRecord) -> String {
        if record.content.trim().chars().count() < MIN_SUMMARY_CHARS {
            return record.content.clone();
        }
        match self.summarizer.summarize(&record.content).await {
            Ok(summary) if !summary.is_empty() => summary,
            Ok(_) => record.content.clone(),
            Err(e) => {
                warn!(uid = record.uid, error = %e, "Summarization failed, using raw content");
                record.content.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::{BrokerError, Error, MailboxError, SummarizeError};
    use crate::mailbox::{MessageUid, RawMessage};

    struct FakeMailbox {
        messages: Vec<RawMessage>,
        fail_search: bool,
    }

    #[async_trait]
    impl MailboxReader for FakeMailbox {
        async fn fetch_candidate_ids(&self) -> std::result::Result<Vec<MessageUid>, MailboxError> {
            if self.fail_search {
                return Err(MailboxError::AuthFailed {
                    username: "support@example.com".into(),
                });
            }
            Ok(self.messages.iter().rev().map(|m| m.uid).collect())
        }

        async fn fetch_raw(
            &self,
            uids: &[MessageUid],
        ) -> std::result::Result<Vec<RawMessage>, MailboxError> {
            Ok(uids
                .iter()
                .filter_map(|uid| self.messages.iter().find(|m| m.uid == *uid).cloned())
                .collect())
        }
    }

    #[derive(Default)]
    struct CountingSummarizer {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Summarizer for CountingSummarizer {
        async fn summarize(&self, _text: &str) -> std::result::Result<String, SummarizeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SummarizeError::Request("model offline".into()));
            }
            Ok("short summary".into())
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<QueueMessage>>,
        declares: AtomicUsize,
        reject_subject: Option<&'static str>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn declare(&self) -> std::result::Result<(), BrokerError> {
            self.declares.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn publish(&self, message: &QueueMessage) -> std::result::Result<(), BrokerError> {
            if self.reject_subject == Some(message.subject.as_str()) {
                return Err(BrokerError::Nacked {
                    queue: "email_summaries".into(),
                });
            }
            self.published.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn email(uid: MessageUid, subject: &str, body: &str) -> RawMessage {
        RawMessage {
            uid,
            bytes: format!(
                "From: Customer <c{uid}@customer.org>\r\nSubject: {subject}\r\nMessage-ID: <{uid}@customer.org>\r\n\r\n{body}\r\n"
            )
            .into_bytes(),
        }
    }

    fn producer(
        mailbox: FakeMailbox,
        summarizer: Arc<CountingSummarizer>,
        publisher: Arc<RecordingPublisher>,
    ) -> Producer {
        Producer::new(Arc::new(mailbox), summarizer, publisher)
    }

    #[tokio::test]
    async fn short_content_is_its_own_summary() {
        let body = "Where is my order?? It is two days late.";
        assert_eq!(body.chars().count(), 40);
        let summarizer = Arc::new(CountingSummarizer::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let mailbox = FakeMailbox {
            messages: vec![email(1, "Late order", body)],
            fail_search: false,
        };

        let report = producer(mailbox, summarizer.clone(), publisher.clone())
            .run(5)
            .await
            .unwrap();

        assert_eq!(report.published, 1);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);
        let published = publisher.published.lock().unwrap();
        assert_eq!(published[0].summary.trim(), body);
        assert_eq!(published[0].summary, published[0].original_content);
    }

    #[tokio::test]
    async fn long_content_is_summarized() {
        let body = "word ".repeat(40);
        let summarizer = Arc::new(CountingSummarizer::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let mailbox = FakeMailbox {
            messages: vec![email(1, "Long", &body)],
            fail_search: false,
        };

        producer(mailbox, summarizer.clone(), publisher.clone())
            .run(5)
            .await
            .unwrap();

        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.published.lock().unwrap()[0].summary, "short summary");
    }

    #[tokio::test]
    async fn summarizer_failure_falls_back_to_content() {
        let body = "x".repeat(150);
        let summarizer = Arc::new(CountingSummarizer {
            fail: true,
            ..CountingSummarizer::default()
        });
        let publisher = Arc::new(RecordingPublisher::default());
        let mailbox = FakeMailbox {
            messages: vec![email(1, "Long", &body)],
            fail_search: false,
        };

        let report = producer(mailbox, summarizer, publisher.clone())
            .run(5)
            .await
            .unwrap();

        assert_eq!(report.published, 1);
        assert_eq!(publisher.published.lock().unwrap()[0].summary.trim(), body);
    }

    #[tokio::test]
    async fn batch_is_bounded_and_newest_first() {
        let messages = (1..=8).map(|uid| email(uid, &format!("Ticket {uid}"), "help")).collect();
        let publisher = Arc::new(RecordingPublisher::default());
        let mailbox = FakeMailbox {
            messages,
            fail_search: false,
        };

        let report = producer(mailbox, Arc::new(CountingSummarizer::default()), publisher.clone())
            .run(3)
            .await
            .unwrap();

        assert_eq!(report.candidates, 8);
        assert_eq!(report.decoded, 3);
        let subjects: Vec<_> = publisher
            .published
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.subject.clone())
            .collect();
        assert_eq!(subjects, vec!["Ticket 8", "Ticket 7", "Ticket 6"]);
    }

    #[tokio::test]
    async fn publish_failure_does_not_block_the_rest() {
        let publisher = Arc::new(RecordingPublisher {
            reject_subject: Some("Ticket 2"),
            ..RecordingPublisher::default()
        });
        let mailbox = FakeMailbox {
            messages: (1..=3).map(|uid| email(uid, &format!("Ticket {uid}"), "help")).collect(),
            fail_search: false,
        };

        let report = producer(mailbox, Arc::new(CountingSummarizer::default()), publisher.clone())
            .run(5)
            .await
            .unwrap();

        assert_eq!(report.published, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(publisher.declares.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mailbox_failure_is_hard() {
        let mailbox = FakeMailbox {
            messages: vec![],
            fail_search: true,
        };
        let result = producer(
            mailbox,
            Arc::new(CountingSummarizer::default()),
            Arc::new(RecordingPublisher::default()),
        )
        .run(5)
        .await;
        assert!(matches!(result, Err(Error::Mailbox(MailboxError::AuthFailed { .. }))));
    }

    #[tokio::test]
    async fn empty_mailbox_publishes_nothing() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mailbox = FakeMailbox {
            messages: vec![],
            fail_search: false,
        };
        let report = producer(mailbox, Arc::new(CountingSummarizer::default()), publisher.clone())
            .run(5)
            .await
            .unwrap();
        assert_eq!(report, BatchReport::default());
        assert!(publisher.published.lock().unwrap().is_empty());
    }
}

//! Mailbox reader: finds candidate messages in the support inbox.
//!
//! Search strategy, first non-empty result wins:
//! 1. Primary category + unread (Gmail `X-GM-RAW`)
//! 2. Unread anywhere in the inbox
//! 3. Everything in the inbox
//!
//! The mailbox is only ever opened read-only; nothing here changes flags.

pub mod imap;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::MailboxConfig;
use crate::error::MailboxError;

/// IMAP UID of a message in the selected mailbox.
pub type MessageUid = u32;

/// Full RFC 5322 source of one fetched message.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub uid: MessageUid,
    pub bytes: Vec<u8>,
}

/// One step of the search fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchCriteria {
    PrimaryUnread,
    Unread,
    All,
}

impl SearchCriteria {
    /// Order in which searches are attempted.
    pub const FALLBACK_ORDER: [SearchCriteria; 3] = [
        SearchCriteria::PrimaryUnread,
        SearchCriteria::Unread,
        SearchCriteria::All,
    ];

    /// Search keys as sent after `UID SEARCH`.
    pub fn imap_query(self) -> &'static str {
        match self {
            Self::PrimaryUnread => "X-GM-RAW \"category:primary\" UNSEEN",
            Self::Unread => "UNSEEN",
            Self::All => "ALL",
        }
    }

    /// Whether the criteria relies on a provider extension that other
    /// servers may reject.
    pub fn is_provider_specific(self) -> bool {
        matches!(self, Self::PrimaryUnread)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::PrimaryUnread => "primary-unread",
            Self::Unread => "unread",
            Self::All => "all",
        }
    }
}

/// Anything that can run a UID search against the selected mailbox.
pub trait Searcher {
    fn search(&mut self, criteria: SearchCriteria) -> Result<Vec<MessageUid>, MailboxError>;
}

/// Run the fallback chain and return UIDs newest first.
///
/// A server refusing the provider-specific search counts as "no results" for
/// that step. Any other error aborts the chain.
pub fn search_with_fallback(searcher: &mut impl Searcher) -> Result<Vec<MessageUid>, MailboxError> {
    for criteria in SearchCriteria::FALLBACK_ORDER {
        let mut uids = match searcher.search(criteria) {
            Ok(uids) => uids,
            Err(MailboxError::Command { reason, .. }) if criteria.is_provider_specific() => {
                debug!(criteria = criteria.label(), %reason, "Search not supported by server");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        if uids.is_empty() {
            debug!(criteria = criteria.label(), "Search returned no messages");
            continue;
        }

        uids.sort_unstable();
        uids.dedup();
        uids.reverse();
        info!(criteria = criteria.label(), count = uids.len(), "Found candidate messages");
        return Ok(uids);
    }

    Ok(Vec::new())
}

/// Read side of the mailbox as seen by the producer.
#[async_trait]
pub trait MailboxReader: Send + Sync {
    /// Candidate UIDs, newest first. Empty is not an error.
    async fn fetch_candidate_ids(&self) -> Result<Vec<MessageUid>, MailboxError>;

    /// Fetch the raw source of each UID in one session. UIDs the server has
    /// no body for are skipped.
    async fn fetch_raw(&self, uids: &[MessageUid]) -> Result<Vec<RawMessage>, MailboxError>;
}

/// IMAP-over-TLS mailbox. Each call opens its own session.
pub struct ImapMailbox {
    config: MailboxConfig,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailboxReader for ImapMailbox {
    async fn fetch_candidate_ids(&self) -> Result<Vec<MessageUid>, MailboxError> {
        let cfg = self.config.clone();
        tokio::task::spawn_blocking(move || imap::candidate_ids(&cfg))
            .await
            .map_err(|e| MailboxError::Task(e.to_string()))?
    }

    async fn fetch_raw(&self, uids: &[MessageUid]) -> Result<Vec<RawMessage>, MailboxError> {
        let cfg = self.config.clone();
        let uids = uids.to_vec();
        tokio::task::spawn_blocking(move || imap::fetch_raw(&cfg, &uids))
            .await
            .map_err(|e| MailboxError::Task(e.to_string()))?
    }
}

/// Log in and straight back out. Used to validate credentials.
pub async fn verify_login(config: &MailboxConfig) -> Result<(), MailboxError> {
    let cfg = config.clone();
    tokio::task::spawn_blocking(move || imap::verify_login(&cfg))
        .await
        .map_err(|e| MailboxError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    /// Canned search results per criteria, recording the order of calls.
    struct FakeSearcher {
        results: HashMap<&'static str, Result<Vec<MessageUid>, &'static str>>,
        calls: Vec<SearchCriteria>,
    }

    impl FakeSearcher {
        fn new(entries: &[(SearchCriteria, Result<Vec<MessageUid>, &'static str>)]) -> Self {
            Self {
                results: entries
                    .iter()
                    .map(|(c, r)| (c.label(), r.clone()))
                    .collect(),
                calls: Vec::new(),
            }
        }
    }

    impl Searcher for FakeSearcher {
        fn search(&mut self, criteria: SearchCriteria) -> Result<Vec<MessageUid>, MailboxError> {
            self.calls.push(criteria);
            match self.results.get(criteria.label()) {
                Some(Ok(uids)) => Ok(uids.clone()),
                Some(Err("closed")) => Err(MailboxError::Closed),
                Some(Err(reason)) => Err(MailboxError::Command {
                    command: "UID".into(),
                    reason: reason.to_string(),
                }),
                None => Ok(Vec::new()),
            }
        }
    }

    #[test]
    fn primary_results_win() {
        let mut s = FakeSearcher::new(&[
            (SearchCriteria::PrimaryUnread, Ok(vec![4, 9, 2])),
            (SearchCriteria::Unread, Ok(vec![1])),
        ]);
        assert_eq!(search_with_fallback(&mut s).unwrap(), vec![9, 4, 2]);
        assert_eq!(s.calls, vec![SearchCriteria::PrimaryUnread]);
    }

    #[test]
    fn falls_back_to_unread_then_all() {
        let mut s = FakeSearcher::new(&[(SearchCriteria::All, Ok(vec![1, 2, 3]))]);
        assert_eq!(search_with_fallback(&mut s).unwrap(), vec![3, 2, 1]);
        assert_eq!(s.calls, SearchCriteria::FALLBACK_ORDER.to_vec());
    }

    #[test]
    fn unsupported_primary_search_is_not_fatal() {
        let mut s = FakeSearcher::new(&[
            (SearchCriteria::PrimaryUnread, Err("BAD unknown search key")),
            (SearchCriteria::Unread, Ok(vec![5])),
        ]);
        assert_eq!(search_with_fallback(&mut s).unwrap(), vec![5]);
    }

    #[test]
    fn rejected_plain_search_is_fatal() {
        let mut s = FakeSearcher::new(&[(SearchCriteria::Unread, Err("NO mailbox gone"))]);
        assert!(matches!(
            search_with_fallback(&mut s),
            Err(MailboxError::Command { .. })
        ));
    }

    #[test]
    fn connection_loss_propagates() {
        let mut s = FakeSearcher::new(&[(SearchCriteria::PrimaryUnread, Err("closed"))]);
        assert!(matches!(search_with_fallback(&mut s), Err(MailboxError::Closed)));
        assert_eq!(s.calls.len(), 1);
    }

    #[test]
    fn empty_mailbox_is_empty_not_error() {
        let mut s = FakeSearcher::new(&[]);
        assert!(search_with_fallback(&mut s).unwrap().is_empty());
    }

    #[test]
    fn duplicate_uids_collapse() {
        let mut s = FakeSearcher::new(&[(SearchCriteria::Unread, Ok(vec![3, 3, 1]))]);
        assert_eq!(search_with_fallback(&mut s).unwrap(), vec![3, 1]);
    }
}

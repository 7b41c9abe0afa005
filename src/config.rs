//! Configuration types, built from environment variables.
//!
//! Every section has a `from_source` constructor taking a key lookup so it can
//! be built from a map in tests; `from_env` just wires that to `std::env`.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Name of the durable work queue shared by producer and consumer.
pub const QUEUE_NAME: &str = "email_summaries";

/// Default summarization endpoint (hosted distilbart-cnn).
const DEFAULT_SUMMARIZER_URL: &str =
    "https://api-inference.huggingface.co/models/sshleifer/distilbart-cnn-12-6";

/// Default number of messages handled per producer run.
const DEFAULT_BATCH_SIZE: usize = 5;

fn var_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_or<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, ConfigError> {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

// ── Broker ──────────────────────────────────────────────────────────

/// AMQP broker connection settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub queue: String,
    pub heartbeat: Duration,
}

impl BrokerConfig {
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            host: var_or(&lookup, "RABBITMQ_HOST", "localhost"),
            port: parse_or(&lookup, "RABBITMQ_PORT", 5672),
            username: var_or(&lookup, "RABBITMQ_USER", "admin"),
            password: SecretString::from(var_or(&lookup, "RABBITMQ_PASSWORD", "admin123")),
            queue: QUEUE_NAME.to_string(),
            heartbeat: Duration::from_secs(600),
        }
    }

    pub fn from_env() -> Self {
        Self::from_source(env_lookup)
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

/// IMAP mailbox settings. Credentials are mandatory.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    pub read_timeout: Duration,
}

impl MailboxConfig {
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            host: var_or(&lookup, "IMAP_HOST", "imap.gmail.com"),
            port: parse_or(&lookup, "IMAP_PORT", 993),
            username: required(&lookup, "EMAIL_USERNAME")?,
            password: SecretString::from(required(&lookup, "EMAIL_PASSWORD")?),
            mailbox: "INBOX".to_string(),
            read_timeout: Duration::from_secs(30),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(env_lookup)
    }
}

// ── SMTP ────────────────────────────────────────────────────────────

/// Outbound SMTP settings. The sender address doubles as the login.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub sender: String,
    pub password: SecretString,
}

impl SmtpConfig {
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let sender = required(&lookup, "SENDER_EMAIL")?;
        if sender_domain_of(&sender).is_none() {
            return Err(ConfigError::InvalidValue {
                key: "SENDER_EMAIL".into(),
                message: format!("'{sender}' has no domain part"),
            });
        }
        Ok(Self {
            host: var_or(&lookup, "SMTP_SERVER", "smtp.gmail.com"),
            port: parse_or(&lookup, "SMTP_PORT", 587),
            sender,
            password: SecretString::from(required(&lookup, "SENDER_PASSWORD")?),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(env_lookup)
    }

    /// Domain of the sending address, e.g. `support.example.com`.
    pub fn sender_domain(&self) -> &str {
        sender_domain_of(&self.sender).unwrap_or_default()
    }
}

fn sender_domain_of(address: &str) -> Option<&str> {
    address
        .split_once('@')
        .map(|(_, domain)| domain.trim())
        .filter(|d| !d.is_empty())
}

// ── Adapters ────────────────────────────────────────────────────────

/// Summarization endpoint settings.
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub url: String,
    pub token: Option<SecretString>,
    pub timeout: Duration,
}

impl SummarizerConfig {
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            url: var_or(&lookup, "SUMMARIZER_URL", DEFAULT_SUMMARIZER_URL),
            token: lookup("SUMMARIZER_TOKEN")
                .filter(|t| !t.trim().is_empty())
                .map(SecretString::from),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Knowledge-base store location.
#[derive(Debug, Clone)]
pub struct KbConfig {
    pub path: PathBuf,
}

impl KbConfig {
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            path: PathBuf::from(var_or(&lookup, "KB_PATH", "./data/support_kb.db")),
        }
    }
}

// ── Settings ────────────────────────────────────────────────────────

/// Process-wide settings shared by every role.
///
/// Mailbox and SMTP sections are loaded by the role that needs them
/// (`MailboxConfig::from_env`, `SmtpConfig::from_env`) so that a consumer
/// host does not need mailbox credentials and vice versa.
#[derive(Debug, Clone)]
pub struct Settings {
    pub broker: BrokerConfig,
    pub summarizer: SummarizerConfig,
    pub kb: KbConfig,
    pub batch_size: usize,
    pub log_dir: Option<PathBuf>,
}

impl Settings {
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            broker: BrokerConfig::from_source(&lookup),
            summarizer: SummarizerConfig::from_source(&lookup),
            kb: KbConfig::from_source(&lookup),
            batch_size: parse_or(&lookup, "PRODUCER_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            log_dir: lookup("TRIAGE_LOG_DIR")
                .filter(|d| !d.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn from_env() -> Self {
        Self::from_source(env_lookup)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn source(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn broker_defaults() {
        let cfg = BrokerConfig::from_source(source(&[]));
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.port, 5672);
        assert_eq!(cfg.username, "admin");
        assert_eq!(cfg.password.expose_secret(), "admin123");
        assert_eq!(cfg.queue, "email_summaries");
    }

    #[test]
    fn broker_overrides_and_bad_port_falls_back() {
        let cfg = BrokerConfig::from_source(source(&[
            ("RABBITMQ_HOST", "mq.internal"),
            ("RABBITMQ_PORT", "not-a-port"),
        ]));
        assert_eq!(cfg.host, "mq.internal");
        assert_eq!(cfg.port, 5672);
    }

    #[test]
    fn mailbox_requires_credentials() {
        let err = MailboxConfig::from_source(source(&[("EMAIL_PASSWORD", "pw")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "EMAIL_USERNAME"));

        let err = MailboxConfig::from_source(source(&[
            ("EMAIL_USERNAME", "me@example.com"),
            ("EMAIL_PASSWORD", "   "),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "EMAIL_PASSWORD"));
    }

    #[test]
    fn mailbox_defaults_to_gmail_inbox() {
        let cfg = MailboxConfig::from_source(source(&[
            ("EMAIL_USERNAME", "me@example.com"),
            ("EMAIL_PASSWORD", "pw"),
        ]))
        .unwrap();
        assert_eq!(cfg.host, "imap.gmail.com");
        assert_eq!(cfg.port, 993);
        assert_eq!(cfg.mailbox, "INBOX");
    }

    #[test]
    fn smtp_requires_credentials() {
        let err = SmtpConfig::from_source(source(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "SENDER_EMAIL"));
    }

    #[test]
    fn smtp_rejects_sender_without_domain() {
        let err = SmtpConfig::from_source(source(&[
            ("SENDER_EMAIL", "support"),
            ("SENDER_PASSWORD", "pw"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn smtp_sender_domain() {
        let cfg = SmtpConfig::from_source(source(&[
            ("SENDER_EMAIL", "bot@support.example.com"),
            ("SENDER_PASSWORD", "pw"),
        ]))
        .unwrap();
        assert_eq!(cfg.sender_domain(), "support.example.com");
        assert_eq!(cfg.host, "smtp.gmail.com");
        assert_eq!(cfg.port, 587);
    }

    #[test]
    fn settings_batch_size_and_log_dir() {
        let settings = Settings::from_source(source(&[
            ("PRODUCER_BATCH_SIZE", "12"),
            ("TRIAGE_LOG_DIR", "/var/log/triage"),
        ]));
        assert_eq!(settings.batch_size, 12);
        assert_eq!(settings.log_dir, Some(PathBuf::from("/var/log/triage")));
        assert!(settings.summarizer.token.is_none());

        let settings = Settings::from_source(source(&[]));
        assert_eq!(settings.batch_size, 5);
        assert!(settings.log_dir.is_none());
    }
}

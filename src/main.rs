use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use tracing::info;

use mail_triage::config::{MailboxConfig, Settings, SmtpConfig};
use mail_triage::consumer::Consumer;
use mail_triage::kb::LibSqlKnowledgeBase;
use mail_triage::mailbox::{self, ImapMailbox};
use mail_triage::mailer::SmtpMailer;
use mail_triage::producer::Producer;
use mail_triage::queue::AmqpBroker;
use mail_triage::summarize::HttpSummarizer;
use mail_triage::telemetry;

#[derive(Parser)]
#[command(name = "mail-triage")]
#[command(about = "Support inbox triage: summarize, queue, auto-respond", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Summarize a batch of inbox messages onto the queue, then exit
    Produce {
        /// Messages to take from the inbox (default: PRODUCER_BATCH_SIZE)
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Answer queued tickets until Ctrl-C
    Consume,
    /// Print the number of messages waiting in the queue
    QueueDepth,
    /// Log in to the mailbox and log out again
    CheckLogin,
    /// Load question/answer pairs from a JSON file into the knowledge base
    KbImport { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    let settings = Settings::from_env();
    let _log_guard = telemetry::init(settings.log_dir.as_deref());

    match cli.cmd {
        Command::Produce { batch_size } => {
            produce(&settings, batch_size.unwrap_or(settings.batch_size)).await
        }
        Command::Consume => consume(&settings).await,
        Command::QueueDepth => {
            let broker = AmqpBroker::new(settings.broker.clone());
            let depth = broker
                .queue_depth()
                .await
                .context("Failed to read queue depth")?;
            println!("{}: {depth} message(s) waiting", broker.queue());
            Ok(())
        }
        Command::CheckLogin => {
            let config = MailboxConfig::from_env()?;
            mailbox::verify_login(&config)
                .await
                .with_context(|| format!("Login failed for {}", config.username))?;
            println!("Login OK for {}", config.username);
            Ok(())
        }
        Command::KbImport { file } => {
            let kb = LibSqlKnowledgeBase::new_local(&settings.kb.path).await?;
            let added = kb.import_file(&file).await?;
            println!("Imported {added} entries into {}", settings.kb.path.display());
            Ok(())
        }
    }
}

async fn produce(settings: &Settings, batch_size: usize) -> anyhow::Result<()> {
    let mailbox_config = MailboxConfig::from_env()?;
    eprintln!("📬 mail-triage producer v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mailbox: {}@{}", mailbox_config.username, mailbox_config.host);
    eprintln!("   Queue: {}", settings.broker.queue);
    eprintln!("   Batch size: {batch_size}\n");

    let broker = Arc::new(AmqpBroker::new(settings.broker.clone()));
    let producer = Producer::new(
        Arc::new(ImapMailbox::new(mailbox_config)),
        Arc::new(HttpSummarizer::new(settings.summarizer.clone())?),
        broker.clone(),
    );

    let result = producer.run(batch_size).await;
    broker.close().await;
    let report = result.context("Producer run failed")?;
    info!(published = report.published, failed = report.failed, "Producer finished");
    Ok(())
}

async fn consume(settings: &Settings) -> anyhow::Result<()> {
    let smtp_config = SmtpConfig::from_env()?;
    let kb = LibSqlKnowledgeBase::new_local(&settings.kb.path)
        .await
        .with_context(|| format!("Failed to open knowledge base at {}", settings.kb.path.display()))?;

    eprintln!("📨 mail-triage consumer v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Queue: {}", settings.broker.queue);
    eprintln!("   Sender: {}", smtp_config.sender);
    eprintln!("   Knowledge base: {}", settings.kb.path.display());
    eprintln!("   Press Ctrl-C to stop.\n");

    let sender_domain = smtp_config.sender_domain().to_string();
    let consumer = Consumer::new(
        Arc::new(kb),
        Arc::new(SmtpMailer::new(smtp_config)),
        sender_domain,
    );

    let broker = AmqpBroker::new(settings.broker.clone());
    broker
        .consume(&consumer, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::debug!(error = %e, "Ctrl-C handler unavailable");
            }
        })
        .await
        .context("Consumer stopped with an error")?;
    Ok(())
}

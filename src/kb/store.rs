//! libSQL-backed knowledge base.

use std::path::Path;

use async_trait::async_trait;
use libsql::{Connection, params};
use tracing::{debug, info};

use super::{KbEntry, KnowledgeBase, NO_MATCH_SOLUTION, best_match, migrations};
use crate::error::KbError;

/// Question/answer store with top-1 term-overlap retrieval.
pub struct LibSqlKnowledgeBase {
    #[allow(dead_code)]
    db: libsql::Database,
    conn: Connection,
}

impl LibSqlKnowledgeBase {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, KbError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                KbError::Unavailable(format!("Failed to create database directory: {e}"))
            })?;
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| KbError::Unavailable(format!("Failed to open knowledge base: {e}")))?;
        let kb = Self::from_database(db).await?;
        info!(path = %path.display(), "Knowledge base opened");
        Ok(kb)
    }

    /// In-memory store (for tests).
    pub async fn new_memory() -> Result<Self, KbError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| KbError::Unavailable(format!("Failed to create in-memory database: {e}")))?;
        Self::from_database(db).await
    }

    async fn from_database(db: libsql::Database) -> Result<Self, KbError> {
        let conn = db
            .connect()
            .map_err(|e| KbError::Unavailable(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self { db, conn })
    }

    pub async fn add_entry(&self, entry: &KbEntry) -> Result<(), KbError> {
        self.conn
            .execute(
                "INSERT INTO kb_entries (question, answer) VALUES (?1, ?2)",
                params![entry.question.as_str(), entry.answer.as_str()],
            )
            .await
            .map_err(|e| KbError::Query(format!("add_entry: {e}")))?;
        Ok(())
    }

    /// Load `[{"question": ..., "answer": ...}]` from a JSON file.
    /// Returns the number of entries added.
    pub async fn import_file(&self, path: &Path) -> Result<usize, KbError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| KbError::Import(format!("{}: {e}", path.display())))?;
        let entries: Vec<KbEntry> = serde_json::from_str(&raw)
            .map_err(|e| KbError::Import(format!("{}: {e}", path.display())))?;
        for entry in &entries {
            self.add_entry(entry).await?;
        }
        info!(count = entries.len(), path = %path.display(), "Imported knowledge-base entries");
        Ok(entries.len())
    }

    pub async fn entries(&self) -> Result<Vec<KbEntry>, KbError> {
        let mut rows = self
            .conn
            .query("SELECT question, answer FROM kb_entries ORDER BY id", ())
            .await
            .map_err(|e| KbError::Query(format!("entries: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| KbError::Query(format!("entries: {e}")))?
        {
            entries.push(KbEntry {
                question: row
                    .get(0)
                    .map_err(|e| KbError::Query(format!("entries row parse: {e}")))?,
                answer: row
                    .get(1)
                    .map_err(|e| KbError::Query(format!("entries row parse: {e}")))?,
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl KnowledgeBase for LibSqlKnowledgeBase {
    async fn lookup(&self, query: &str) -> Result<String, KbError> {
        let entries = self.entries().await?;
        match best_match(query, &entries) {
            Some(entry) => {
                debug!(question = %entry.question, "Knowledge-base match");
                Ok(entry.answer.clone())
            }
            None => {
                debug!(entries = entries.len(), "No knowledge-base match");
                Ok(NO_MATCH_SOLUTION.to_string())
            }
        }
    }
}

//! Ledger implementations.
//!
//! [`SqliteLedger`] is the durable store used in production. The table's primary key
//! is `(document_kind, document_id)`, so a second insert for the same document is
//! rejected by the database itself and surfaces as [`LedgerError::DuplicateKey`].
//!
//! [`MemoryLedger`] has the same semantics without persistence; it backs dry runs and
//! tests.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use crate::contract::{DocumentKey, DocumentKind, Ledger, LedgerEntry, LedgerError};

fn storage(e: sqlx::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

/// SQLite-backed ledger.
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Builds a lazily-connecting pool from a `sqlite:` URL. Nothing touches the
    /// database until [`Ledger::prepare`] runs.
    pub fn connect_lazy(url: &str) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(storage)?
            .create_if_missing(true);
        Ok(Self::with_options(options))
    }

    /// Same as [`SqliteLedger::connect_lazy`] for a database file path.
    pub fn open_file(path: &Path) -> Self {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::with_options(options)
    }

    fn with_options(options: SqliteConnectOptions) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(15))
            .connect_lazy_with(options);
        Self { pool }
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn prepare(&self) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS document_ledger (
                document_kind TEXT NOT NULL,
                document_id INTEGER NOT NULL,
                subject_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                page_count INTEGER NOT NULL,
                subject_display_name TEXT NOT NULL,
                exception_flag INTEGER NOT NULL DEFAULT 0,
                attachment_type TEXT,
                delivered_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (document_kind, document_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        tracing::info!("[LEDGER] Ledger schema ready");
        Ok(())
    }

    async fn exists(&self, key: &DocumentKey) -> Result<bool, LedgerError> {
        let row = sqlx::query(
            "SELECT 1 FROM document_ledger WHERE document_kind = ? AND document_id = ?",
        )
        .bind(key.kind.as_str())
        .bind(key.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.is_some())
    }

    async fn entry(&self, key: &DocumentKey) -> Result<Option<LedgerEntry>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT document_kind, document_id, subject_id, title, page_count,
                   subject_display_name, exception_flag, attachment_type
            FROM document_ledger
            WHERE document_kind = ? AND document_id = ?
            "#,
        )
        .bind(key.kind.as_str())
        .bind(key.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let kind: String = row.try_get("document_kind").map_err(storage)?;
        let kind = DocumentKind::parse(&kind)
            .ok_or_else(|| LedgerError::Storage(format!("unknown document kind {kind:?}")))?;
        let page_count: i64 = row.try_get("page_count").map_err(storage)?;
        let exception_flag: i64 = row.try_get("exception_flag").map_err(storage)?;

        Ok(Some(LedgerEntry {
            key: DocumentKey {
                kind,
                id: row.try_get("document_id").map_err(storage)?,
            },
            subject_id: row.try_get("subject_id").map_err(storage)?,
            title: row.try_get("title").map_err(storage)?,
            page_count: u32::try_from(page_count).unwrap_or_default(),
            subject_display_name: row.try_get("subject_display_name").map_err(storage)?,
            exception_flag: exception_flag != 0,
            attachment_type: row.try_get("attachment_type").map_err(storage)?,
        }))
    }

    async fn record(&self, entry: LedgerEntry) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO document_ledger (
                document_kind, document_id, subject_id, title, page_count,
                subject_display_name, exception_flag, attachment_type
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.key.kind.as_str())
        .bind(entry.key.id)
        .bind(entry.subject_id)
        .bind(&entry.title)
        .bind(i64::from(entry.page_count))
        .bind(&entry.subject_display_name)
        .bind(i64::from(entry.exception_flag))
        .bind(entry.attachment_type.as_deref())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if db.is_unique_violation() || db.message().contains("UNIQUE constraint") =>
            {
                Err(LedgerError::DuplicateKey(entry.key))
            }
            Err(e) => Err(storage(e)),
        }
    }

    async fn close(&self) -> Result<(), LedgerError> {
        self.pool.close().await;
        tracing::info!("[LEDGER] Closed ledger connection pool");
        Ok(())
    }
}

/// Non-durable ledger with the same duplicate-key semantics.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: Mutex<HashMap<DocumentKey, LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DocumentKey, LedgerEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn prepare(&self) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn exists(&self, key: &DocumentKey) -> Result<bool, LedgerError> {
        Ok(self.lock().contains_key(key))
    }

    async fn entry(&self, key: &DocumentKey) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn record(&self, entry: LedgerEntry) -> Result<(), LedgerError> {
        let mut entries = self.lock();
        if entries.contains_key(&entry.key) {
            return Err(LedgerError::DuplicateKey(entry.key));
        }
        entries.insert(entry.key, entry);
        Ok(())
    }

    async fn close(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

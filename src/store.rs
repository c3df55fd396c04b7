//! SQLite-backed service ledger: processed emails, digests, and action items.
//!
//! The store is the sole persistence authority. Every public operation is a
//! single committed unit; storage failures propagate to the caller as
//! `DbError` and are never swallowed here.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::models::{
    ActionItem, ActionItemStatus, Classification, Digest, DigestStatus, EmailPriority,
    ProcessedEmail, Relevance,
};

/// Sentinel digest link for records deliberately excluded from a digest
/// (promotional/spam/newsletter). A record carrying this value no longer
/// appears in the undigested query but is distinguishable from records
/// included in a real digest, whose digest_id is a UUID.
pub const FILTERED_DIGEST_ID: &str = "filtered";

/// Errors specific to ledger operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Corrupt ledger value: {0}")]
    Corrupt(String),
}

/// Compute the stable dedup identity for a message.
///
/// When a transport Message-ID is present the hash covers that header alone,
/// so the same physical message seen via two sources collapses to one
/// record. Otherwise the hash covers `source:folder:email_id`.
pub fn email_hash(email_id: &str, source: &str, folder: &str, message_id: Option<&str>) -> String {
    let data = match message_id {
        Some(mid) if !mid.is_empty() => mid.to_string(),
        _ => format!("{source}:{folder}:{email_id}"),
    };
    let digest = Sha256::digest(data.as_bytes());
    hex::encode(digest)
}

/// Per-family deletion counts from a retention cleanup pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CleanupCounts {
    pub processed_emails: usize,
    pub digests: usize,
    pub action_items: usize,
}

/// Aggregate service statistics.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerStats {
    pub total_processed_emails: i64,
    pub total_digests: i64,
    pub total_action_items: i64,
    pub action_items_by_status: HashMap<String, i64>,
    pub emails_last_24h: i64,
    pub last_digest: Option<DateTime<Utc>>,
}

/// Filters for `list_processed`.
#[derive(Debug, Clone, Default)]
pub struct ProcessedFilter {
    pub source: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Filters for `list_action_items`.
#[derive(Debug, Clone, Default)]
pub struct ActionItemFilter {
    pub status: Option<ActionItemStatus>,
    pub priority: Option<EmailPriority>,
    pub relevance: Option<Relevance>,
    pub email_id: Option<String>,
}

/// Handle shared between the monitor, digest generator, and CLI handlers.
pub type SharedStore = Arc<Mutex<LedgerStore>>;

pub fn new_shared_store(store: LedgerStore) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// SQLite connection wrapper for the service ledger.
///
/// Intentionally not `Clone` or `Sync`; callers that share it across tasks
/// hold it behind a mutex. Single-writer-per-database-file is assumed;
/// cross-process concurrent writers are not supported.
pub struct LedgerStore {
    conn: Connection,
}

impl LedgerStore {
    /// Open (or create) the ledger at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory ledger. Useful for testing.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        // WAL keeps reads cheap while a write is in flight
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self { conn })
    }

    /// Run raw SQL against the ledger. Test fixtures use this to install
    /// triggers and backdated rows.
    #[cfg(test)]
    pub(crate) fn execute_sql(&self, sql: &str) -> Result<(), DbError> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    // =========================================================================
    // Processed emails
    // =========================================================================

    /// Check whether a message has already been processed. Absence is a
    /// normal outcome, not an error.
    pub fn is_processed(
        &self,
        email_id: &str,
        source: &str,
        folder: &str,
        message_id: Option<&str>,
    ) -> Result<bool, DbError> {
        let hash = email_hash(email_id, source, folder, message_id);
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM processed_emails WHERE id = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Record a message as processed. Upsert semantics: a second call with
    /// the same identity overwrites the row rather than duplicating it.
    #[allow(clippy::too_many_arguments)]
    pub fn mark_processed(
        &self,
        email_id: &str,
        source: &str,
        folder: &str,
        message_id: Option<&str>,
        classification: Option<Classification>,
        llm_analysis: Option<&serde_json::Value>,
        digest_id: Option<&str>,
        subject: Option<&str>,
        from_addr: Option<&str>,
        date: Option<DateTime<Utc>>,
    ) -> Result<ProcessedEmail, DbError> {
        let record = ProcessedEmail {
            id: email_hash(email_id, source, folder, message_id),
            message_id: message_id.map(str::to_string),
            email_id: email_id.to_string(),
            source: source.to_string(),
            folder: folder.to_string(),
            processed_at: Utc::now(),
            digest_id: digest_id.map(str::to_string),
            classification,
            llm_analysis: llm_analysis.cloned(),
            subject: subject.map(str::to_string),
            from_addr: from_addr.map(str::to_string),
            date,
        };

        let classification_json = record
            .classification
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DbError::Corrupt(e.to_string()))?;
        let analysis_json = record
            .llm_analysis
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DbError::Corrupt(e.to_string()))?;

        self.conn.execute(
            "INSERT OR REPLACE INTO processed_emails (
                id, message_id, email_id, source, folder, processed_at,
                digest_id, classification, llm_analysis, subject, from_addr, date
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id,
                record.message_id,
                record.email_id,
                record.source,
                record.folder,
                record.processed_at.to_rfc3339(),
                record.digest_id,
                classification_json,
                analysis_json,
                record.subject,
                record.from_addr,
                record.date.map(|d| d.to_rfc3339()),
            ],
        )?;

        Ok(record)
    }

    /// Query processed emails with optional filters, newest first.
    pub fn list_processed(
        &self,
        filter: &ProcessedFilter,
        limit: usize,
    ) -> Result<Vec<ProcessedEmail>, DbError> {
        let mut query = String::from(
            "SELECT id, message_id, email_id, source, folder, processed_at,
                    digest_id, classification, llm_analysis, subject, from_addr, date
             FROM processed_emails WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();

        if let Some(source) = &filter.source {
            query.push_str(&format!(" AND source = ?{}", args.len() + 1));
            args.push(source.clone());
        }
        if let Some(since) = filter.since {
            query.push_str(&format!(" AND processed_at >= ?{}", args.len() + 1));
            args.push(since.to_rfc3339());
        }
        if let Some(until) = filter.until {
            query.push_str(&format!(" AND processed_at <= ?{}", args.len() + 1));
            args.push(until.to_rfc3339());
        }
        query.push_str(&format!(" ORDER BY processed_at DESC LIMIT {limit}"));

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_processed)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Processed emails not yet linked to any digest (including the filtered
    /// sentinel), oldest first so digest rendering reads chronologically.
    pub fn undigested_since(&self, since: DateTime<Utc>) -> Result<Vec<ProcessedEmail>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, message_id, email_id, source, folder, processed_at,
                    digest_id, classification, llm_analysis, subject, from_addr, date
             FROM processed_emails
             WHERE digest_id IS NULL AND processed_at >= ?1
             ORDER BY processed_at ASC",
        )?;

        let rows = stmt.query_map(params![since.to_rfc3339()], row_to_processed)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Link a processed record to a digest (or to `FILTERED_DIGEST_ID`).
    /// Safe to call on an already-linked record; the link is overwritten.
    pub fn link_to_digest(&self, record_id: &str, digest_id: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE processed_emails SET digest_id = ?1 WHERE id = ?2",
            params![digest_id, record_id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Digests
    // =========================================================================

    /// Create a new digest record with delivery status `pending`.
    pub fn create_digest(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        email_count: i64,
        summary: &str,
        raw_content: Option<&str>,
    ) -> Result<Digest, DbError> {
        let digest = Digest {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            period_start,
            period_end,
            email_count,
            summary: summary.to_string(),
            raw_content: raw_content.map(str::to_string),
            delivery_status: DigestStatus::Pending,
        };

        self.conn.execute(
            "INSERT INTO digests (
                id, created_at, period_start, period_end,
                email_count, summary, raw_content, delivery_status
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                digest.id,
                digest.created_at.to_rfc3339(),
                digest.period_start.to_rfc3339(),
                digest.period_end.to_rfc3339(),
                digest.email_count,
                digest.summary,
                digest.raw_content,
                digest.delivery_status.as_str(),
            ],
        )?;

        Ok(digest)
    }

    /// Get a digest by ID.
    pub fn get_digest(&self, digest_id: &str) -> Result<Option<Digest>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, created_at, period_start, period_end, email_count,
                    summary, raw_content, delivery_status
             FROM digests WHERE id = ?1",
        )?;
        let digest = stmt
            .query_row(params![digest_id], row_to_digest)
            .optional()?;
        Ok(digest)
    }

    /// List recent digests, newest first.
    pub fn list_digests(&self, limit: usize) -> Result<Vec<Digest>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, created_at, period_start, period_end, email_count,
                    summary, raw_content, delivery_status
             FROM digests ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_digest)?;
        let mut digests = Vec::new();
        for row in rows {
            digests.push(row?);
        }
        Ok(digests)
    }

    /// Update a digest's delivery status. Returns false when no digest with
    /// that ID exists.
    pub fn update_digest_status(
        &self,
        digest_id: &str,
        status: DigestStatus,
    ) -> Result<bool, DbError> {
        let updated = self.conn.execute(
            "UPDATE digests SET delivery_status = ?1 WHERE id = ?2",
            params![status.as_str(), digest_id],
        )?;
        Ok(updated > 0)
    }

    // =========================================================================
    // Action items
    // =========================================================================

    /// Create a new action item with status `pending`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_action_item(
        &self,
        email_id: &str,
        title: &str,
        description: Option<&str>,
        priority: EmailPriority,
        urgency: &str,
        due_date: Option<DateTime<Utc>>,
        relevance: Relevance,
        digest_id: Option<&str>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<ActionItem, DbError> {
        let item = ActionItem {
            id: uuid::Uuid::new_v4().to_string(),
            email_id: email_id.to_string(),
            digest_id: digest_id.map(str::to_string),
            created_at: Utc::now(),
            title: title.to_string(),
            description: description.map(str::to_string),
            priority,
            urgency: urgency.to_string(),
            due_date,
            status: ActionItemStatus::Pending,
            completed_at: None,
            relevance,
            metadata,
        };

        let metadata_json = serde_json::to_string(&item.metadata)
            .map_err(|e| DbError::Corrupt(e.to_string()))?;

        self.conn.execute(
            "INSERT INTO action_items (
                id, email_id, digest_id, created_at, title, description,
                priority, urgency, due_date, status, completed_at, relevance, metadata
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                item.id,
                item.email_id,
                item.digest_id,
                item.created_at.to_rfc3339(),
                item.title,
                item.description,
                item.priority.as_str(),
                item.urgency,
                item.due_date.map(|d| d.to_rfc3339()),
                item.status.as_str(),
                Option::<String>::None,
                item.relevance.as_str(),
                metadata_json,
            ],
        )?;

        Ok(item)
    }

    /// Get an action item by ID.
    pub fn get_action_item(&self, item_id: &str) -> Result<Option<ActionItem>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, email_id, digest_id, created_at, title, description,
                    priority, urgency, due_date, status, completed_at, relevance, metadata
             FROM action_items WHERE id = ?1",
        )?;
        let item = stmt
            .query_row(params![item_id], row_to_action_item)
            .optional()?;
        Ok(item)
    }

    /// List action items, due date ascending with nulls last, then newest
    /// created first.
    pub fn list_action_items(
        &self,
        filter: &ActionItemFilter,
        limit: usize,
    ) -> Result<Vec<ActionItem>, DbError> {
        let mut query = String::from(
            "SELECT id, email_id, digest_id, created_at, title, description,
                    priority, urgency, due_date, status, completed_at, relevance, metadata
             FROM action_items WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            query.push_str(&format!(" AND status = ?{}", args.len() + 1));
            args.push(status.as_str().to_string());
        }
        if let Some(priority) = filter.priority {
            query.push_str(&format!(" AND priority = ?{}", args.len() + 1));
            args.push(priority.as_str().to_string());
        }
        if let Some(relevance) = filter.relevance {
            query.push_str(&format!(" AND relevance = ?{}", args.len() + 1));
            args.push(relevance.as_str().to_string());
        }
        if let Some(email_id) = &filter.email_id {
            query.push_str(&format!(" AND email_id = ?{}", args.len() + 1));
            args.push(email_id.clone());
        }
        query.push_str(&format!(
            " ORDER BY due_date ASC NULLS LAST, created_at DESC LIMIT {limit}"
        ));

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_action_item)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// Update an action item's status. Returns false when no item with that
    /// ID exists.
    ///
    /// `completed_at` is stamped when transitioning to completed; once set
    /// it is append-only. A later transition to a non-completed status
    /// keeps the old timestamp (COALESCE).
    pub fn update_action_status(
        &self,
        item_id: &str,
        status: ActionItemStatus,
    ) -> Result<bool, DbError> {
        let completed_at = if status == ActionItemStatus::Completed {
            Some(Utc::now().to_rfc3339())
        } else {
            None
        };

        let updated = self.conn.execute(
            "UPDATE action_items
             SET status = ?1, completed_at = COALESCE(?2, completed_at)
             WHERE id = ?3",
            params![status.as_str(), completed_at, item_id],
        )?;
        Ok(updated > 0)
    }

    // =========================================================================
    // Cleanup & stats
    // =========================================================================

    /// Remove data older than `days`. Processed emails and digests are
    /// deleted by their timestamp; action items only when in a terminal
    /// status (completed/dismissed). Non-terminal items are kept regardless
    /// of age.
    pub fn cleanup(&self, days: u32) -> Result<CleanupCounts, DbError> {
        let cutoff = (Utc::now() - Duration::days(i64::from(days))).to_rfc3339();
        let mut counts = CleanupCounts::default();

        counts.processed_emails = self.conn.execute(
            "DELETE FROM processed_emails WHERE processed_at < ?1",
            params![cutoff],
        )?;
        counts.digests = self
            .conn
            .execute("DELETE FROM digests WHERE created_at < ?1", params![cutoff])?;
        counts.action_items = self.conn.execute(
            "DELETE FROM action_items
             WHERE status IN ('completed', 'dismissed') AND created_at < ?1",
            params![cutoff],
        )?;

        Ok(counts)
    }

    /// Aggregate counts and recent-activity statistics.
    pub fn stats(&self) -> Result<LedgerStats, DbError> {
        let total_processed_emails: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM processed_emails", [], |row| row.get(0))?;
        let total_digests: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM digests", [], |row| row.get(0))?;
        let total_action_items: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM action_items", [], |row| row.get(0))?;

        let mut action_items_by_status = HashMap::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT status, COUNT(*) FROM action_items GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                action_items_by_status.insert(status, count);
            }
        }

        let yesterday = (Utc::now() - Duration::days(1)).to_rfc3339();
        let emails_last_24h: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM processed_emails WHERE processed_at >= ?1",
            params![yesterday],
            |row| row.get(0),
        )?;

        let last_digest: Option<String> = self
            .conn
            .query_row(
                "SELECT created_at FROM digests ORDER BY created_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let last_digest = match last_digest {
            Some(ts) => Some(parse_ts_value(&ts)?),
            None => None,
        };

        Ok(LedgerStats {
            total_processed_emails,
            total_digests,
            total_action_items,
            action_items_by_status,
            emails_last_24h,
            last_digest,
        })
    }
}

// =============================================================================
// Row converters
// =============================================================================

fn parse_ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_ts_value(value: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::Corrupt(format!("bad timestamp {value:?}: {e}")))
}

fn row_to_processed(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessedEmail> {
    let processed_at: String = row.get(5)?;
    let digest_id: Option<String> = row.get(6)?;
    let classification: Option<String> = row.get(7)?;
    let llm_analysis: Option<String> = row.get(8)?;
    let date: Option<String> = row.get(11)?;

    Ok(ProcessedEmail {
        id: row.get(0)?,
        message_id: row.get(1)?,
        email_id: row.get(2)?,
        source: row.get(3)?,
        folder: row.get(4)?,
        processed_at: parse_ts(5, &processed_at)?,
        digest_id,
        // Tolerate malformed stored enrichment rather than failing the read
        classification: classification
            .as_deref()
            .and_then(|c| serde_json::from_str::<Classification>(c).ok()),
        llm_analysis: llm_analysis
            .as_deref()
            .and_then(|a| serde_json::from_str(a).ok()),
        subject: row.get(9)?,
        from_addr: row.get(10)?,
        date: match date {
            Some(d) => Some(parse_ts(11, &d)?),
            None => None,
        },
    })
}

fn row_to_digest(row: &rusqlite::Row<'_>) -> rusqlite::Result<Digest> {
    let created_at: String = row.get(1)?;
    let period_start: String = row.get(2)?;
    let period_end: String = row.get(3)?;
    let status: String = row.get(7)?;

    Ok(Digest {
        id: row.get(0)?,
        created_at: parse_ts(1, &created_at)?,
        period_start: parse_ts(2, &period_start)?,
        period_end: parse_ts(3, &period_end)?,
        email_count: row.get(4)?,
        summary: row.get(5)?,
        raw_content: row.get(6)?,
        delivery_status: DigestStatus::parse(&status),
    })
}

fn row_to_action_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActionItem> {
    let created_at: String = row.get(3)?;
    let priority: String = row.get(6)?;
    let due_date: Option<String> = row.get(8)?;
    let status: String = row.get(9)?;
    let completed_at: Option<String> = row.get(10)?;
    let relevance: String = row.get(11)?;
    let metadata: Option<String> = row.get(12)?;

    Ok(ActionItem {
        id: row.get(0)?,
        email_id: row.get(1)?,
        digest_id: row.get(2)?,
        created_at: parse_ts(3, &created_at)?,
        title: row.get(4)?,
        description: row.get(5)?,
        priority: EmailPriority::parse(&priority),
        urgency: row.get(7)?,
        due_date: match due_date {
            Some(d) => Some(parse_ts(8, &d)?),
            None => None,
        },
        status: ActionItemStatus::parse(&status),
        completed_at: match completed_at {
            Some(c) => Some(parse_ts(10, &c)?),
            None => None,
        },
        relevance: Relevance::parse(&relevance),
        metadata: metadata
            .as_deref()
            .and_then(|m| serde_json::from_str(m).ok())
            .unwrap_or_default(),
    })
}

// =============================================================================
// Tests
// =============================================================================

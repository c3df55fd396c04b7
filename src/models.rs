//! Core data types shared across the service: messages, ledger records,
//! digests, and action items.
//!
//! Enum values are stored in SQLite as their lowercase string form, so every
//! enum here has an infallible `parse` that maps unknown strings to a safe
//! default rather than erroring.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority levels used for both emails and action items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl EmailPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailPriority::Low => "low",
            EmailPriority::Normal => "normal",
            EmailPriority::High => "high",
            EmailPriority::Urgent => "urgent",
        }
    }

    /// Parse a priority string, defaulting to `Normal` for unknown values.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "low" => EmailPriority::Low,
            "high" => EmailPriority::High,
            "urgent" => EmailPriority::Urgent,
            _ => EmailPriority::Normal,
        }
    }
}

/// Email categories for classification.
///
/// The first four are displayed in digests; newsletter/promotional/spam are
/// the digest exclusion set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailCategory {
    Personal,
    WorkClients,
    WorkAdmin,
    Other,
    Newsletter,
    Promotional,
    Spam,
}

impl EmailCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailCategory::Personal => "personal",
            EmailCategory::WorkClients => "work_clients",
            EmailCategory::WorkAdmin => "work_admin",
            EmailCategory::Other => "other",
            EmailCategory::Newsletter => "newsletter",
            EmailCategory::Promotional => "promotional",
            EmailCategory::Spam => "spam",
        }
    }

    /// Parse a category string. Legacy names from older classifier prompts
    /// ("work", "transactional", "miscellaneous") map onto current
    /// categories; anything unrecognized falls back to `Other`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "personal" | "transactional" => EmailCategory::Personal,
            "work_clients" => EmailCategory::WorkClients,
            "work_admin" | "work" => EmailCategory::WorkAdmin,
            "newsletter" => EmailCategory::Newsletter,
            "promotional" => EmailCategory::Promotional,
            "spam" => EmailCategory::Spam,
            _ => EmailCategory::Other,
        }
    }

    /// True for categories excluded from digest content (still recorded in
    /// the ledger, linked to the filtered sentinel).
    pub fn is_digest_excluded(&self) -> bool {
        matches!(
            self,
            EmailCategory::Newsletter | EmailCategory::Promotional | EmailCategory::Spam
        )
    }
}

/// Status of an action item.
///
/// `Completed` and `Dismissed` are terminal for normal operation; retention
/// cleanup only ever deletes items in a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionItemStatus {
    Pending,
    InProgress,
    Completed,
    Dismissed,
}

impl ActionItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionItemStatus::Pending => "pending",
            ActionItemStatus::InProgress => "in_progress",
            ActionItemStatus::Completed => "completed",
            ActionItemStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "in_progress" => ActionItemStatus::InProgress,
            "completed" => ActionItemStatus::Completed,
            "dismissed" => ActionItemStatus::Dismissed,
            _ => ActionItemStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionItemStatus::Completed | ActionItemStatus::Dismissed
        )
    }
}

/// Delivery status of a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestStatus {
    Pending,
    Delivered,
    Failed,
}

impl DigestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestStatus::Pending => "pending",
            DigestStatus::Delivered => "delivered",
            DigestStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "delivered" => DigestStatus::Delivered,
            "failed" => DigestStatus::Failed,
            _ => DigestStatus::Pending,
        }
    }
}

/// Whether an action item was directed at the user personally ("direct")
/// or is informational/general.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relevance {
    #[default]
    Direct,
    Informational,
}

impl Relevance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relevance::Direct => "direct",
            Relevance::Informational => "informational",
        }
    }

    /// Parse relevance, defaulting to `Direct` when absent or unrecognized.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "informational" => Relevance::Informational,
            _ => Relevance::Direct,
        }
    }
}

/// Attachment metadata carried on a message (content is never fetched here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
}

/// A message yielded by a mail source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Source-local identifier (IMAP UID, maildir filename, notmuch id).
    pub id: String,
    /// Which source connector provided this message.
    pub source: String,
    /// Transport-level Message-ID header, if available.
    pub message_id: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub from_addr: String,
    #[serde(default)]
    pub to_addrs: Vec<String>,
    #[serde(default)]
    pub cc_addrs: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub body_text: String,
    pub body_html: Option<String>,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

fn default_folder() -> String {
    "INBOX".to_string()
}

impl Message {
    /// Minimal constructor for sources that only know id/source/folder up
    /// front; remaining fields are filled as parsing proceeds.
    pub fn new(id: impl Into<String>, source: impl Into<String>, folder: impl Into<String>) -> Self {
        Message {
            id: id.into(),
            source: source.into(),
            message_id: None,
            subject: String::new(),
            from_addr: String::new(),
            to_addrs: Vec::new(),
            cc_addrs: Vec::new(),
            date: None,
            body_text: String::new(),
            body_html: None,
            folder: folder.into(),
            flags: Vec::new(),
            attachments: Vec::new(),
        }
    }
}

/// Classification result attached to a processed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: EmailCategory,
    pub priority: EmailPriority,
}

/// Ledger record of one processed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEmail {
    /// Content-derived hash identity (see `store::email_hash`).
    pub id: String,
    pub message_id: Option<String>,
    pub email_id: String,
    pub source: String,
    pub folder: String,
    pub processed_at: DateTime<Utc>,
    pub digest_id: Option<String>,
    pub classification: Option<Classification>,
    pub llm_analysis: Option<serde_json::Value>,
    pub subject: Option<String>,
    pub from_addr: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

/// A compiled summary over a time window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub email_count: i64,
    pub summary: String,
    pub raw_content: Option<String>,
    pub delivery_status: DigestStatus,
}

/// A follow-up task derived from a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionItem {
    pub id: String,
    /// Dedup identity of the owning processed record.
    pub email_id: String,
    pub digest_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub description: Option<String>,
    pub priority: EmailPriority,
    pub urgency: String,
    pub due_date: Option<DateTime<Utc>>,
    pub status: ActionItemStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub relevance: Relevance,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A reply drafted by the LLM. Always pending review; never auto-sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftReply {
    pub id: String,
    pub original_email_id: String,
    pub original_subject: String,
    pub recipient: String,
    pub draft_body: String,
    pub created_at: DateTime<Utc>,
    pub instructions: Option<String>,
}

/// Outcome of processing a single message through the monitor pipeline.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingOutcome {
    pub email_id: String,
    pub source: String,
    pub folder: String,
    pub classification: Option<Classification>,
    pub llm_analysis: Option<serde_json::Value>,
    pub rules_applied: Vec<String>,
    /// Labels contributed by matched rules.
    pub labels: Vec<String>,
    pub action_items: Vec<String>,
    pub errors: Vec<String>,
}

/// Statistics for one monitoring cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleStats {
    pub started_at: DateTime<Utc>,
    pub emails_found: usize,
    pub emails_processed: usize,
    pub errors: usize,
    pub action_items_created: usize,
    pub duration_seconds: f64,
}

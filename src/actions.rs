//! Action item extraction and lifecycle.
//!
//! Extraction proposes items from a message via the LLM, filters them by
//! confidence, and persists the survivors keyed to the message's ledger
//! identity. Lifecycle operations are thin wrappers over the store.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::EmmaError;
use crate::llm::LlmProcessor;
use crate::models::{ActionItem, ActionItemStatus, EmailPriority, Message, Relevance};
use crate::store::{email_hash, ActionItemFilter, SharedStore};

pub struct ActionItemManager {
    store: SharedStore,
    confidence_threshold: f64,
}

impl ActionItemManager {
    pub fn new(store: SharedStore, confidence_threshold: f64) -> Self {
        Self {
            store,
            confidence_threshold,
        }
    }

    /// Extract and persist action items for a message. Returns the created
    /// items. With no LLM available this is a no-op.
    pub async fn extract_from_email(
        &self,
        llm: Option<&LlmProcessor>,
        message: &Message,
    ) -> Result<Vec<ActionItem>, EmmaError> {
        let Some(llm) = llm else {
            return Ok(Vec::new());
        };

        let candidates = llm.extract_action_items(message).await?;
        let record_id = email_hash(
            &message.id,
            &message.source,
            &message.folder,
            message.message_id.as_deref(),
        );

        let mut created = Vec::new();
        for candidate in candidates {
            if candidate.confidence < self.confidence_threshold {
                log::debug!(
                    "Dropping low-confidence ({:.2}) candidate: {}",
                    candidate.confidence,
                    candidate.title
                );
                continue;
            }

            let mut metadata = HashMap::new();
            metadata.insert(
                "email_subject".to_string(),
                serde_json::Value::String(message.subject.clone()),
            );
            metadata.insert(
                "email_from".to_string(),
                serde_json::Value::String(message.from_addr.clone()),
            );
            if let Some(confidence) = serde_json::Number::from_f64(candidate.confidence) {
                metadata.insert(
                    "confidence".to_string(),
                    serde_json::Value::Number(confidence),
                );
            }

            let store = self.store.lock().expect("store lock");
            let item = store.create_action_item(
                &record_id,
                candidate.title.trim(),
                candidate.description.as_deref(),
                candidate
                    .priority
                    .as_deref()
                    .map(EmailPriority::parse)
                    .unwrap_or(EmailPriority::Normal),
                candidate.urgency.as_deref().unwrap_or("normal"),
                candidate.due_date.as_deref().and_then(parse_due_date),
                candidate
                    .relevance
                    .as_deref()
                    .map(Relevance::parse)
                    .unwrap_or_default(),
                None,
                metadata,
            )?;
            created.push(item);
        }

        if !created.is_empty() {
            log::info!(
                "Extracted {} action item(s) from '{}'",
                created.len(),
                message.subject
            );
        }
        Ok(created)
    }

    /// Manually create an action item, unattached to a processed message.
    pub fn create_manual(
        &self,
        title: &str,
        description: Option<&str>,
        priority: EmailPriority,
        due_date: Option<DateTime<Utc>>,
    ) -> Result<ActionItem, EmmaError> {
        let store = self.store.lock().expect("store lock");
        let item = store.create_action_item(
            "manual",
            title,
            description,
            priority,
            "normal",
            due_date,
            Relevance::Direct,
            None,
            HashMap::new(),
        )?;
        Ok(item)
    }

    pub fn list(&self, filter: &ActionItemFilter, limit: usize) -> Result<Vec<ActionItem>, EmmaError> {
        let store = self.store.lock().expect("store lock");
        Ok(store.list_action_items(filter, limit)?)
    }

    pub fn get(&self, item_id: &str) -> Result<Option<ActionItem>, EmmaError> {
        let store = self.store.lock().expect("store lock");
        Ok(store.get_action_item(item_id)?)
    }

    pub fn complete(&self, item_id: &str) -> Result<bool, EmmaError> {
        self.transition(item_id, ActionItemStatus::Completed)
    }

    pub fn dismiss(&self, item_id: &str) -> Result<bool, EmmaError> {
        self.transition(item_id, ActionItemStatus::Dismissed)
    }

    pub fn start(&self, item_id: &str) -> Result<bool, EmmaError> {
        self.transition(item_id, ActionItemStatus::InProgress)
    }

    fn transition(&self, item_id: &str, status: ActionItemStatus) -> Result<bool, EmmaError> {
        let store = self.store.lock().expect("store lock");
        Ok(store.update_action_status(item_id, status)?)
    }
}

/// Parse a model-provided due date: RFC3339 first, then a bare date taken
/// as midnight UTC.
fn parse_due_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("null") {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}

//! Inbox monitor.
//!
//! One cycle polls every configured source, screens fetched messages
//! against the ledger, and runs each new message through the processing
//! pipeline. Failures are contained at the smallest scope that can make
//! progress: a dead source skips that source, a failed enrichment step
//! records an error on the message's outcome, and the message is marked
//! processed regardless so it is never re-fetched into a retry loop.

use chrono::Utc;

use crate::actions::ActionItemManager;
use crate::config::MonitorConfig;
use crate::error::EmmaError;
use crate::llm::LlmProcessor;
use crate::models::{CycleStats, Message, ProcessingOutcome};
use crate::rules::RulesEngine;
use crate::sources::MailSource;
use crate::store::SharedStore;

/// Poll lookback window in hours.
const LOOKBACK_HOURS: u32 = 24;

pub struct Monitor {
    store: SharedStore,
    sources: Vec<MailSource>,
    config: MonitorConfig,
    batch_size: usize,
    rules: RulesEngine,
}

impl Monitor {
    pub fn new(
        store: SharedStore,
        sources: Vec<MailSource>,
        config: MonitorConfig,
        batch_size: usize,
        rules: RulesEngine,
    ) -> Self {
        Self {
            store,
            sources,
            config,
            batch_size,
            rules,
        }
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    fn source_enabled(&self, source: &MailSource) -> bool {
        self.config.sources.is_empty()
            || self.config.sources.iter().any(|name| name == source.name())
    }

    /// Fetch the unhandled messages one source currently has. An indexed
    /// source answers with one query and its processed tag is trusted; a
    /// scanned source is read per folder and every candidate is screened
    /// against the ledger.
    async fn poll_source(&self, source: &MailSource) -> Result<Vec<Message>, EmmaError> {
        // A dead account must surface as an error, not as an empty inbox
        source.connect().await?;

        if source.is_indexed() {
            return Ok(source
                .fetch_unprocessed("", LOOKBACK_HOURS, self.batch_size)
                .await?);
        }

        let mut fetched = Vec::new();
        for folder in &self.config.folders {
            fetched.extend(
                source
                    .fetch_unprocessed(folder, LOOKBACK_HOURS, self.batch_size)
                    .await?,
            );
        }

        let store = self.store.lock().expect("store lock");
        let mut new_messages = Vec::new();
        for message in fetched {
            let seen = store.is_processed(
                &message.id,
                &message.source,
                &message.folder,
                message.message_id.as_deref(),
            )?;
            if !seen {
                new_messages.push(message);
            }
        }
        Ok(new_messages)
    }

    /// Run one message through the pipeline: rules, classification,
    /// analysis, action extraction, then the ledger write. Enrichment
    /// failures are recorded on the outcome; only the ledger write itself
    /// can fail the call.
    pub async fn process_one(
        &self,
        llm: Option<&LlmProcessor>,
        actions: &ActionItemManager,
        message: &Message,
    ) -> Result<ProcessingOutcome, EmmaError> {
        let mut outcome = ProcessingOutcome {
            email_id: message.id.clone(),
            source: message.source.clone(),
            folder: message.folder.clone(),
            classification: None,
            llm_analysis: None,
            rules_applied: Vec::new(),
            labels: Vec::new(),
            action_items: Vec::new(),
            errors: Vec::new(),
        };

        if self.config.apply_rules && !self.rules.is_empty() {
            let rules_outcome = self.rules.process_message(message);
            outcome.rules_applied = rules_outcome.rules_matched;
            outcome.labels = rules_outcome.labels;
            outcome.errors.extend(rules_outcome.errors);
        }

        if self.config.auto_classify {
            if let Some(llm) = llm {
                match llm.classify(message).await {
                    Ok(classification) => outcome.classification = Some(classification),
                    Err(err) => {
                        log::warn!("Classification failed for '{}': {err}", message.subject);
                        outcome.errors.push(format!("classify: {err}"));
                    }
                }
                match llm.analyze(message).await {
                    Ok(analysis) => outcome.llm_analysis = Some(analysis),
                    Err(err) => {
                        log::debug!("Analysis failed for '{}': {err}", message.subject);
                        outcome.errors.push(format!("analyze: {err}"));
                    }
                }
            }
        }

        if self.config.extract_actions {
            match actions.extract_from_email(llm, message).await {
                Ok(items) => {
                    outcome.action_items = items.into_iter().map(|i| i.id).collect();
                }
                Err(err) => {
                    log::warn!("Action extraction failed for '{}': {err}", message.subject);
                    outcome.errors.push(format!("actions: {err}"));
                }
            }
        }

        // The ledger write happens whatever the enrichment did; a message
        // must never be re-fetched because a collaborator was down
        {
            let store = self.store.lock().expect("store lock");
            store.mark_processed(
                &message.id,
                &message.source,
                &message.folder,
                message.message_id.as_deref(),
                outcome.classification,
                outcome.llm_analysis.as_ref(),
                None,
                Some(&message.subject),
                Some(&message.from_addr),
                message.date,
            )?;
        }

        Ok(outcome)
    }

    async fn process_batch(
        &self,
        source: &MailSource,
        messages: &[Message],
        llm: Option<&LlmProcessor>,
        actions: &ActionItemManager,
        stats: &mut CycleStats,
    ) {
        stats.emails_found += messages.len();

        for message in messages {
            match self.process_one(llm, actions, message).await {
                Ok(outcome) => {
                    stats.emails_processed += 1;
                    stats.action_items_created += outcome.action_items.len();
                    stats.errors += outcome.errors.len();
                    // Index tagging is best effort; the ledger already has
                    // the record
                    if let Err(err) = source.mark_processed(message).await {
                        log::warn!(
                            "Source '{}' could not record handled state: {err}",
                            source.name()
                        );
                    }
                }
                Err(err) => {
                    log::error!(
                        "Processing '{}' from '{}' failed: {err}",
                        message.subject,
                        source.name()
                    );
                    stats.errors += 1;
                }
            }
        }
    }

    /// Run one full monitoring cycle. Never fails: source and per-message
    /// errors are counted in the returned stats.
    pub async fn run_cycle(
        &self,
        llm: Option<&LlmProcessor>,
        actions: &ActionItemManager,
    ) -> CycleStats {
        let started_at = Utc::now();
        let mut stats = CycleStats {
            started_at,
            emails_found: 0,
            emails_processed: 0,
            errors: 0,
            action_items_created: 0,
            duration_seconds: 0.0,
        };

        // Indexed sources are preferred; per-account sources only run when
        // no indexed source produced a usable answer this cycle
        let mut indexed_ok = false;
        for source in self.sources.iter().filter(|s| s.is_indexed()) {
            if !self.source_enabled(source) {
                continue;
            }
            match self.poll_source(source).await {
                Ok(messages) => {
                    indexed_ok = true;
                    self.process_batch(source, &messages, llm, actions, &mut stats)
                        .await;
                }
                Err(err) => {
                    log::error!("Polling source '{}' failed: {err}", source.name());
                    stats.errors += 1;
                }
            }
        }

        if !indexed_ok {
            for source in self.sources.iter().filter(|s| !s.is_indexed()) {
                if !self.source_enabled(source) {
                    continue;
                }
                match self.poll_source(source).await {
                    Ok(messages) => {
                        self.process_batch(source, &messages, llm, actions, &mut stats)
                            .await;
                    }
                    Err(err) => {
                        log::error!("Polling source '{}' failed: {err}", source.name());
                        stats.errors += 1;
                    }
                }
            }
        }

        stats.duration_seconds = (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0;
        log::info!(
            "Cycle done: {} found, {} processed, {} action item(s), {} error(s) in {:.2}s",
            stats.emails_found,
            stats.emails_processed,
            stats.action_items_created,
            stats.errors,
            stats.duration_seconds
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use crate::llm::test_support::ScriptedClient;
    use crate::models::{ActionItemStatus, EmailCategory};
    use crate::sources::MemorySource;
    use crate::store::{new_shared_store, ActionItemFilter, LedgerStore, ProcessedFilter};

    fn shared() -> SharedStore {
        new_shared_store(LedgerStore::open_in_memory().expect("open"))
    }

    fn message(id: &str, subject: &str) -> Message {
        let mut m = Message::new(id, "mem", "INBOX");
        m.subject = subject.to_string();
        m.from_addr = "billing@example.com".to_string();
        m.body_text = "Please pay invoice #42 by Friday.".to_string();
        m
    }

    fn monitor_with(store: SharedStore, messages: Vec<Message>, config: MonitorConfig) -> Monitor {
        let source = MailSource::Memory(MemorySource::new("mem", messages));
        Monitor::new(store, vec![source], config, 50, RulesEngine::default())
    }

    fn plain_config() -> MonitorConfig {
        MonitorConfig {
            auto_classify: false,
            extract_actions: false,
            ..MonitorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_cycle_without_llm_marks_processed() {
        let store = shared();
        let monitor = monitor_with(
            store.clone(),
            vec![message("1", "Hello"), message("2", "World")],
            plain_config(),
        );
        let manager = ActionItemManager::new(store.clone(), 0.7);

        let stats = monitor.run_cycle(None, &manager).await;
        assert_eq!(stats.emails_found, 2);
        assert_eq!(stats.emails_processed, 2);
        assert_eq!(stats.errors, 0);

        let s = store.lock().expect("lock");
        assert_eq!(
            s.list_processed(&ProcessedFilter::default(), 10)
                .expect("list")
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_cycle_skips_already_processed() {
        let store = shared();
        let monitor = monitor_with(
            store.clone(),
            vec![message("1", "Hello"), message("2", "World")],
            plain_config(),
        );
        let manager = ActionItemManager::new(store.clone(), 0.7);

        {
            let s = store.lock().expect("lock");
            s.mark_processed("1", "mem", "INBOX", None, None, None, None, None, None, None)
                .expect("mark");
        }

        let stats = monitor.run_cycle(None, &manager).await;
        assert_eq!(stats.emails_found, 1);
        assert_eq!(stats.emails_processed, 1);
    }

    #[tokio::test]
    async fn test_second_cycle_is_a_noop() {
        let store = shared();
        let monitor = monitor_with(store.clone(), vec![message("1", "Hello")], plain_config());
        let manager = ActionItemManager::new(store.clone(), 0.7);

        let first = monitor.run_cycle(None, &manager).await;
        assert_eq!(first.emails_processed, 1);

        let second = monitor.run_cycle(None, &manager).await;
        assert_eq!(second.emails_found, 0);
        assert_eq!(second.emails_processed, 0);
    }

    #[tokio::test]
    async fn test_full_pipeline_with_llm() {
        let store = shared();
        let config = MonitorConfig::default();
        let monitor = monitor_with(
            store.clone(),
            vec![message("1", "Invoice due Friday")],
            config,
        );
        let manager = ActionItemManager::new(store.clone(), 0.7);

        // classify, analyze, extract in that order
        let llm = LlmProcessor::new(
            Box::new(ScriptedClient::new(vec![
                Ok(r#"{"category": "work_admin", "priority": "high"}"#.to_string()),
                Ok(r#"{"summary": "Invoice reminder", "requires_response": true}"#.to_string()),
                Ok(r#"[{"title": "Pay invoice #42", "confidence": 0.9, "due_date": "2026-08-28"}]"#
                    .to_string()),
            ])),
            &LlmConfig::default(),
        );

        let stats = monitor.run_cycle(Some(&llm), &manager).await;
        assert_eq!(stats.emails_processed, 1);
        assert_eq!(stats.action_items_created, 1);
        assert_eq!(stats.errors, 0);

        let s = store.lock().expect("lock");
        let records = s
            .list_processed(&ProcessedFilter::default(), 10)
            .expect("list");
        let c = records[0].classification.expect("classification");
        assert_eq!(c.category, EmailCategory::WorkAdmin);
        assert!(records[0].llm_analysis.is_some());

        let items = s
            .list_action_items(&ActionItemFilter::default(), 10)
            .expect("items");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Pay invoice #42");
        assert_eq!(items[0].status, ActionItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_llm_failure_still_marks_processed() {
        let store = shared();
        let monitor = monitor_with(
            store.clone(),
            vec![message("1", "Hello")],
            MonitorConfig::default(),
        );
        let manager = ActionItemManager::new(store.clone(), 0.7);

        // Scripted responses exhausted immediately: every call errors
        let llm = LlmProcessor::new(
            Box::new(ScriptedClient::new(vec![])),
            &LlmConfig::default(),
        );

        let stats = monitor.run_cycle(Some(&llm), &manager).await;
        assert_eq!(stats.emails_processed, 1);
        assert!(stats.errors > 0);

        let s = store.lock().expect("lock");
        assert!(s.is_processed("1", "mem", "INBOX", None).expect("query"));
    }

    #[tokio::test]
    async fn test_failed_ledger_write_does_not_abort_batch() {
        let store = shared();
        {
            let s = store.lock().expect("lock");
            s.execute_sql(
                "CREATE TRIGGER reject_poisoned BEFORE INSERT ON processed_emails
                 WHEN NEW.email_id = 'poison'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .expect("trigger");
        }
        let monitor = monitor_with(
            store.clone(),
            vec![message("poison", "Bad"), message("ok", "Good")],
            plain_config(),
        );
        let manager = ActionItemManager::new(store.clone(), 0.7);

        let stats = monitor.run_cycle(None, &manager).await;
        assert_eq!(stats.emails_found, 2);
        assert_eq!(stats.emails_processed, 1);
        assert_eq!(stats.errors, 1);

        let s = store.lock().expect("lock");
        assert!(s.is_processed("ok", "mem", "INBOX", None).expect("query"));
        assert!(!s.is_processed("poison", "mem", "INBOX", None).expect("query"));
    }

    #[tokio::test]
    async fn test_maildir_message_without_message_id_not_reprocessed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let base = tmp.path().join("account");
        std::fs::create_dir_all(base.join("new")).expect("mkdir new");
        std::fs::create_dir_all(base.join("cur")).expect("mkdir cur");
        std::fs::write(
            base.join("new").join("1692612000.m1"),
            "From: billing@example.com\r\nSubject: Invoice due Friday\r\n\
             Content-Type: text/plain\r\n\r\nPlease pay invoice #42.\r\n",
        )
        .expect("write");

        let store = shared();
        let source = MailSource::Maildir(crate::sources::MaildirSource::new("personal", &base));
        let monitor = Monitor::new(
            store.clone(),
            vec![source],
            plain_config(),
            50,
            RulesEngine::default(),
        );
        let manager = ActionItemManager::new(store.clone(), 0.7);

        let first = monitor.run_cycle(None, &manager).await;
        assert_eq!(first.emails_processed, 1);

        // The file is untouched; the ledger alone must screen the repeat
        let second = monitor.run_cycle(None, &manager).await;
        assert_eq!(second.emails_found, 0);
        assert_eq!(second.emails_processed, 0);

        let s = store.lock().expect("lock");
        assert_eq!(
            s.list_processed(&ProcessedFilter::default(), 10)
                .expect("list")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_dead_source_does_not_abort_cycle() {
        let store = shared();
        let dead = MailSource::Maildir(crate::sources::MaildirSource::new(
            "dead",
            std::path::Path::new("/does/not/exist"),
        ));
        let live = MailSource::Memory(MemorySource::new("mem", vec![message("1", "Hello")]));
        let monitor = Monitor::new(
            store.clone(),
            vec![dead, live],
            plain_config(),
            50,
            RulesEngine::default(),
        );
        let manager = ActionItemManager::new(store.clone(), 0.7);

        let stats = monitor.run_cycle(None, &manager).await;
        assert_eq!(stats.emails_processed, 1);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn test_source_name_filter() {
        let store = shared();
        let config = MonitorConfig {
            sources: vec!["other".to_string()],
            ..plain_config()
        };
        let monitor = monitor_with(store.clone(), vec![message("1", "Hello")], config);
        let manager = ActionItemManager::new(store.clone(), 0.7);

        let stats = monitor.run_cycle(None, &manager).await;
        assert_eq!(stats.emails_found, 0);
    }

    #[tokio::test]
    async fn test_rules_recorded_on_outcome() {
        let store = shared();
        let rules = RulesEngine::new(vec![crate::rules::Rule {
            name: "invoices".to_string(),
            enabled: true,
            conditions: vec![crate::rules::RuleCondition {
                field: "subject".to_string(),
                operator: "contains".to_string(),
                value: serde_json::json!("invoice"),
            }],
            labels: vec!["finance".to_string()],
        }]);
        let config = MonitorConfig {
            apply_rules: true,
            ..plain_config()
        };
        let source = MailSource::Memory(MemorySource::new("mem", vec![]));
        let monitor = Monitor::new(store.clone(), vec![source], config, 50, rules);
        let manager = ActionItemManager::new(store.clone(), 0.7);

        let outcome = monitor
            .process_one(None, &manager, &message("1", "Invoice due Friday"))
            .await
            .expect("process");
        assert_eq!(outcome.rules_applied, vec!["invoices".to_string()]);
        assert_eq!(outcome.labels, vec!["finance".to_string()]);
    }
}

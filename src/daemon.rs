//! Long-running service: the monitor interval job, cron-scheduled digests,
//! and the daily retention cleanup, all driven by one loop.
//!
//! A single driver task owns every job, so jobs never overlap and there is
//! no cross-task locking beyond the shared store handle. Stop requests are
//! honored at the next wakeup; an in-flight job finishes first.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use tokio::sync::Notify;

use crate::actions::ActionItemManager;
use crate::config::Settings;
use crate::digest::DigestGenerator;
use crate::error::EmmaError;
use crate::llm::{self, LlmProcessor};
use crate::models::{CycleStats, Digest};
use crate::monitor::Monitor;
use crate::rules::{load_rules_from, RulesEngine};
use crate::sources::{MaildirSource, MailSource, NotmuchSource};
use crate::store::{new_shared_store, LedgerStore, LedgerStats, SharedStore};

const CLEANUP_CRON: &str = "0 0 3 * * *";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Snapshot returned by `status`.
#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub sources: Vec<String>,
    pub llm_backend: Option<String>,
    pub polling_interval: u64,
    pub digest_schedule: Vec<String>,
    pub last_cycle: Option<CycleStats>,
    pub stats: LedgerStats,
}

pub struct EmmaService {
    settings: Settings,
    store: SharedStore,
    monitor: Monitor,
    digest: DigestGenerator,
    actions: ActionItemManager,
    llm: Option<LlmProcessor>,
    state: Mutex<ServiceState>,
    last_cycle: Mutex<Option<CycleStats>>,
    shutdown: Arc<Notify>,
}

impl EmmaService {
    /// Build the full service from settings: store, sources, rules, and the
    /// optional LLM collaborator.
    pub fn from_settings(settings: Settings) -> Result<Self, EmmaError> {
        let db_path = settings.db_path()?;
        let store = new_shared_store(LedgerStore::open(&db_path)?);
        log::info!("Ledger open at {}", db_path.display());

        let mut sources = Vec::new();
        if settings.notmuch.enabled {
            sources.push(MailSource::Notmuch(NotmuchSource::new(
                &settings.notmuch.processed_tag,
                settings.notmuch.exclude_tags.clone(),
                settings
                    .notmuch
                    .config_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
            )));
        }
        for account in &settings.maildir_accounts {
            sources.push(MailSource::Maildir(MaildirSource::new(
                &account.name,
                &account.path,
            )));
        }
        if sources.is_empty() {
            log::warn!("No mail sources configured; monitor cycles will find nothing");
        }

        let rules = if settings.service.monitor.apply_rules {
            let rules_path = crate::config::config_path()?
                .parent()
                .map(|dir| dir.join("rules.json"))
                .ok_or_else(|| EmmaError::Config("Bad config path".to_string()))?;
            RulesEngine::new(load_rules_from(&rules_path)?)
        } else {
            RulesEngine::default()
        };

        let llm = llm::build_client(&settings.llm, settings.anthropic_api_key())
            .map(|client| LlmProcessor::new(client, &settings.llm));
        match &llm {
            Some(processor) => log::info!("LLM backend: {}", processor.backend_name()),
            None => log::info!("No LLM backend; classification and extraction disabled"),
        }

        Ok(Self::assemble(settings, store, sources, rules, llm))
    }

    /// Wire the service from already-built parts.
    pub fn assemble(
        settings: Settings,
        store: SharedStore,
        sources: Vec<MailSource>,
        rules: RulesEngine,
        llm: Option<LlmProcessor>,
    ) -> Self {
        let data_dir = settings
            .data_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."));
        let monitor = Monitor::new(
            store.clone(),
            sources,
            settings.service.monitor.clone(),
            settings.batch_size,
            rules,
        );
        let digest = DigestGenerator::new(store.clone(), settings.service.digest.clone(), &data_dir);
        let actions = ActionItemManager::new(
            store.clone(),
            settings.service.action_items.confidence_threshold,
        );

        Self {
            settings,
            store,
            monitor,
            digest,
            actions,
            llm,
            state: Mutex::new(ServiceState::Stopped),
            last_cycle: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
        }
    }

    async fn run_monitor_cycle(&self) -> CycleStats {
        let stats = self.monitor.run_cycle(self.llm.as_ref(), &self.actions).await;
        *self.last_cycle.lock().expect("cycle lock") = Some(stats.clone());
        stats
    }

    /// Generate and deliver a digest now. `force` bypasses the minimum
    /// email count.
    pub async fn generate_digest(&self, force: bool) -> Result<Option<Digest>, EmmaError> {
        self.digest.generate(self.llm.as_ref(), force).await
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock().expect("state lock")
    }

    fn set_state(&self, state: ServiceState) {
        *self.state.lock().expect("state lock") = state;
    }

    pub fn actions(&self) -> &ActionItemManager {
        &self.actions
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Request a stop. Idempotent; safe to call from another task or a
    /// signal handler.
    pub fn stop(&self) {
        let mut state = self.state.lock().expect("state lock");
        if matches!(*state, ServiceState::Running | ServiceState::Starting) {
            *state = ServiceState::Stopping;
            log::info!("Stop requested");
        }
        self.shutdown.notify_waiters();
    }

    fn digest_schedules(&self) -> Result<Vec<Schedule>, EmmaError> {
        self.settings
            .service
            .digest
            .schedule
            .iter()
            .map(|time| schedule_from_time(time))
            .collect()
    }

    fn next_digest_fire(&self, schedules: &[Schedule], after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.settings.service.digest.enabled {
            return None;
        }
        schedules
            .iter()
            .filter_map(|s| s.after(&after).next())
            .min()
    }

    /// Run the service until stopped.
    pub async fn run(&self) -> Result<(), EmmaError> {
        self.set_state(ServiceState::Starting);

        let digest_schedules = self.digest_schedules()?;
        let cleanup_schedule =
            Schedule::from_str(CLEANUP_CRON).map_err(|e| EmmaError::Config(e.to_string()))?;
        let interval = chrono::Duration::seconds(self.settings.service.polling_interval as i64);

        let now = Utc::now();
        // First monitor cycle runs immediately on startup
        let mut next_monitor = now;
        let mut next_digest = self.next_digest_fire(&digest_schedules, now);
        let mut next_cleanup = cleanup_schedule.after(&now).next();

        self.set_state(ServiceState::Running);
        log::info!(
            "Service running: monitor every {}s, digests at {:?}",
            self.settings.service.polling_interval,
            self.settings.service.digest.schedule
        );

        loop {
            if self.state() == ServiceState::Stopping {
                break;
            }

            let now = Utc::now();
            let mut wakeup = next_monitor;
            if let Some(t) = next_digest {
                wakeup = wakeup.min(t);
            }
            if let Some(t) = next_cleanup {
                wakeup = wakeup.min(t);
            }

            if wakeup > now {
                let sleep = (wakeup - now).to_std().unwrap_or_default();
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = self.shutdown.notified() => break,
                }
            }

            let now = Utc::now();
            if self.state() == ServiceState::Stopping {
                break;
            }

            if now >= next_monitor {
                if self.settings.service.monitor.enabled {
                    self.run_monitor_cycle().await;
                }
                next_monitor = Utc::now() + interval;
            }

            if next_digest.is_some_and(|t| now >= t) {
                if let Err(err) = self.generate_digest(false).await {
                    log::error!("Scheduled digest failed: {err}");
                }
                next_digest = self.next_digest_fire(&digest_schedules, Utc::now());
            }

            if next_cleanup.is_some_and(|t| now >= t) {
                self.run_cleanup(self.settings.service.retention_days);
                next_cleanup = cleanup_schedule.after(&Utc::now()).next();
            }
        }

        self.set_state(ServiceState::Stopped);
        log::info!("Service stopped");
        Ok(())
    }

    /// Run selected jobs once and return, sharing the scheduled code paths.
    pub async fn run_once(
        &self,
        monitor: bool,
        digest: bool,
    ) -> Result<(Option<CycleStats>, Option<Digest>), EmmaError> {
        let mut cycle = None;
        let mut generated = None;

        if monitor {
            cycle = Some(self.run_monitor_cycle().await);
        }
        if digest {
            generated = self.generate_digest(false).await?;
            if generated.is_none() {
                log::info!("No digest produced (below minimum email count)");
            }
        }
        Ok((cycle, generated))
    }

    pub fn run_cleanup(&self, days: u32) {
        let store = self.store.lock().expect("store lock");
        match store.cleanup(days) {
            Ok(counts) => log::info!(
                "Cleanup removed {} email record(s), {} digest(s), {} action item(s)",
                counts.processed_emails,
                counts.digests,
                counts.action_items
            ),
            Err(err) => log::error!("Cleanup failed: {err}"),
        }
    }

    pub fn status(&self) -> Result<ServiceStatus, EmmaError> {
        let stats = {
            let store = self.store.lock().expect("store lock");
            store.stats()?
        };
        Ok(ServiceStatus {
            state: self.state(),
            sources: self.monitor.source_names(),
            llm_backend: self.llm.as_ref().map(|p| p.backend_name().to_string()),
            polling_interval: self.settings.service.polling_interval,
            digest_schedule: self.settings.service.digest.schedule.clone(),
            last_cycle: self.last_cycle.lock().expect("cycle lock").clone(),
            stats,
        })
    }
}

/// Turn a wall-clock "HH:MM" into a daily cron schedule.
fn schedule_from_time(time: &str) -> Result<Schedule, EmmaError> {
    let (hours, minutes) = time
        .split_once(':')
        .ok_or_else(|| EmmaError::Config(format!("Bad schedule time '{time}', expected HH:MM")))?;
    let hours: u8 = hours
        .parse()
        .map_err(|_| EmmaError::Config(format!("Bad hour in '{time}'")))?;
    let minutes: u8 = minutes
        .parse()
        .map_err(|_| EmmaError::Config(format!("Bad minute in '{time}'")))?;
    if hours > 23 || minutes > 59 {
        return Err(EmmaError::Config(format!("Out-of-range time '{time}'")));
    }

    let expr = format!("0 {minutes} {hours} * * *");
    Schedule::from_str(&expr).map_err(|e| EmmaError::Config(format!("Bad schedule: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use crate::sources::MemorySource;

    fn test_settings() -> Settings {
        Settings {
            data_dir: Some(std::env::temp_dir().join("emma-daemon-test")),
            ..Settings::default()
        }
    }

    fn memory_service(messages: Vec<Message>) -> EmmaService {
        let store = new_shared_store(LedgerStore::open_in_memory().expect("open"));
        let mut settings = test_settings();
        settings.service.monitor.auto_classify = false;
        settings.service.monitor.extract_actions = false;
        EmmaService::assemble(
            settings,
            store,
            vec![MailSource::Memory(MemorySource::new("mem", messages))],
            RulesEngine::default(),
            None,
        )
    }

    fn sample_message(id: &str) -> Message {
        let mut m = Message::new(id, "mem", "INBOX");
        m.subject = format!("Message {id}");
        m.from_addr = "someone@example.com".to_string();
        m
    }

    #[test]
    fn test_schedule_from_time() {
        let schedule = schedule_from_time("08:30").expect("parse");
        let next = schedule.upcoming(Utc).next().expect("next");
        assert_eq!(next.format("%H:%M:%S").to_string(), "08:30:00");

        assert!(schedule_from_time("8am").is_err());
        assert!(schedule_from_time("25:00").is_err());
        assert!(schedule_from_time("08:75").is_err());
    }

    #[tokio::test]
    async fn test_run_once_monitor() {
        let service = memory_service(vec![sample_message("1"), sample_message("2")]);
        let (cycle, digest) = service.run_once(true, false).await.expect("run once");
        let cycle = cycle.expect("cycle stats");
        assert_eq!(cycle.emails_processed, 2);
        assert!(digest.is_none());
    }

    #[tokio::test]
    async fn test_run_once_monitor_then_digest() {
        let service = memory_service(vec![sample_message("1")]);
        let (_, digest) = service.run_once(true, true).await.expect("run once");
        let digest = digest.expect("digest");
        assert_eq!(digest.email_count, 1);

        let status = service.status().expect("status");
        assert_eq!(status.stats.total_digests, 1);
        assert_eq!(status.stats.total_processed_emails, 1);
    }

    #[tokio::test]
    async fn test_end_to_end_invoice_scenario() {
        use crate::config::LlmConfig;
        use crate::llm::{test_support::ScriptedClient, LlmProcessor};
        use crate::models::ActionItemStatus;
        use crate::store::ActionItemFilter;

        let mut invoice = sample_message("inv-1");
        invoice.subject = "Invoice due Friday".to_string();
        invoice.from_addr = "billing@example.com".to_string();
        invoice.body_text = "Please pay invoice #42 by Friday.".to_string();

        let store = new_shared_store(LedgerStore::open_in_memory().expect("open"));
        let mut settings = test_settings();
        settings.service.digest.delivery = vec![crate::config::DeliveryConfig {
            delivery_type: "file".to_string(),
            output_dir: Some(settings.data_dir.clone().expect("dir")),
            format: "markdown".to_string(),
        }];

        // classify, analyze, extract, then the digest summary
        let llm = LlmProcessor::new(
            Box::new(ScriptedClient::new(vec![
                Ok(r#"{"category": "work_admin", "priority": "high"}"#.to_string()),
                Ok(r#"{"summary": "Invoice reminder", "requires_response": true}"#.to_string()),
                Ok(r#"[{"title": "Pay invoice #42", "confidence": 0.9,
                        "due_date": "2026-08-28", "relevance": "direct"}]"#
                    .to_string()),
                Ok("One invoice from billing needs payment by Friday.".to_string()),
            ])),
            &LlmConfig::default(),
        );

        let service = EmmaService::assemble(
            settings,
            store.clone(),
            vec![MailSource::Memory(MemorySource::new("mem", vec![invoice]))],
            RulesEngine::default(),
            Some(llm),
        );

        let (cycle, digest) = service.run_once(true, true).await.expect("run once");
        let cycle = cycle.expect("cycle");
        assert_eq!(cycle.emails_processed, 1);
        assert_eq!(cycle.action_items_created, 1);
        assert_eq!(cycle.errors, 0);

        let digest = digest.expect("digest");
        assert_eq!(digest.email_count, 1);
        assert_eq!(digest.summary, "One invoice from billing needs payment by Friday.");
        let content = digest.raw_content.expect("content");
        assert!(content.contains("Invoice due Friday"));
        assert!(content.contains("Pay invoice #42"));

        let status = service.status().expect("status");
        assert_eq!(status.stats.total_processed_emails, 1);
        assert_eq!(status.stats.total_digests, 1);
        assert_eq!(status.stats.total_action_items, 1);
        assert_eq!(status.last_cycle.expect("cycle").emails_processed, 1);

        {
            let s = store.lock().expect("lock");
            let items = s
                .list_action_items(&ActionItemFilter::default(), 10)
                .expect("items");
            assert_eq!(items[0].status, ActionItemStatus::Pending);
            assert!(items[0].due_date.is_some());
        }

        // A second pass finds nothing new
        let (cycle, _) = service.run_once(true, false).await.expect("run once");
        assert_eq!(cycle.expect("cycle").emails_found, 0);
    }

    #[tokio::test]
    async fn test_service_stops_cleanly() {
        let service = Arc::new(memory_service(vec![]));
        let runner = {
            let service = service.clone();
            tokio::spawn(async move { service.run().await })
        };

        // Give the loop a moment to enter Running, then stop it
        for _ in 0..50 {
            if service.state() == ServiceState::Running {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        service.stop();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), runner)
            .await
            .expect("service did not stop")
            .expect("join");
        assert!(result.is_ok());
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let service = memory_service(vec![]);
        service.stop();
        service.stop();
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[test]
    fn test_next_digest_fire_disabled() {
        let mut settings = test_settings();
        settings.service.digest.enabled = false;
        let store = new_shared_store(LedgerStore::open_in_memory().expect("open"));
        let service =
            EmmaService::assemble(settings, store, vec![], RulesEngine::default(), None);
        let schedules = service.digest_schedules().expect("schedules");
        assert!(service.next_digest_fire(&schedules, Utc::now()).is_none());
    }

    #[test]
    fn test_status_reports_sources() {
        let service = memory_service(vec![]);
        let status = service.status().expect("status");
        assert_eq!(status.sources, vec!["mem".to_string()]);
        assert_eq!(status.state, ServiceState::Stopped);
        assert!(status.llm_backend.is_none());
    }
}

//! Digest generation and delivery.
//!
//! A digest covers one period of processed mail. Records in excluded
//! categories (promotional, spam, newsletter) are linked to the filtered
//! sentinel so they never reappear, then the remainder is summarized,
//! rendered, persisted, and delivered to the configured targets.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use crate::config::{DeliveryConfig, DigestConfig};
use crate::error::EmmaError;
use crate::llm::LlmProcessor;
use crate::models::{
    ActionItem, ActionItemStatus, Digest, DigestStatus, EmailCategory, ProcessedEmail, Relevance,
};
use crate::store::{ActionItemFilter, SharedStore, FILTERED_DIGEST_ID};

/// Most emails the LLM sees when summarizing a period.
const SUMMARY_SAMPLE: usize = 20;

/// Most action items rendered into a digest.
const ACTION_ITEM_LIMIT: usize = 20;

pub struct DigestGenerator {
    store: SharedStore,
    config: DigestConfig,
    data_dir: PathBuf,
}

impl DigestGenerator {
    pub fn new(store: SharedStore, config: DigestConfig, data_dir: &Path) -> Self {
        Self {
            store,
            config,
            data_dir: data_dir.to_path_buf(),
        }
    }

    /// Generate a digest for the trailing period. Returns None when too few
    /// digest-worthy emails accumulated; excluded-category records are still
    /// marked filtered in that case. `force` bypasses the minimum-count gate
    /// so an explicit request always produces a digest.
    pub async fn generate(
        &self,
        llm: Option<&LlmProcessor>,
        force: bool,
    ) -> Result<Option<Digest>, EmmaError> {
        let period_end = Utc::now();
        let period_start = period_end - Duration::hours(i64::from(self.config.period_hours));

        let undigested = {
            let store = self.store.lock().expect("store lock");
            store.undigested_since(period_start)?
        };
        log::debug!("Digest window has {} undigested email(s)", undigested.len());

        let mut included = Vec::new();
        {
            let store = self.store.lock().expect("store lock");
            for record in undigested {
                let excluded = record
                    .classification
                    .is_some_and(|c| c.category.is_digest_excluded());
                if excluded {
                    store.link_to_digest(&record.id, FILTERED_DIGEST_ID)?;
                } else {
                    included.push(record);
                }
            }
        }

        if !force && included.len() < self.config.min_emails {
            log::info!(
                "Skipping digest: {} email(s), minimum is {}",
                included.len(),
                self.config.min_emails
            );
            return Ok(None);
        }

        let summary = self.summarize(llm, &included).await;

        let action_items = if self.config.include_action_items {
            let store = self.store.lock().expect("store lock");
            store.list_action_items(
                &ActionItemFilter {
                    status: Some(ActionItemStatus::Pending),
                    relevance: Some(Relevance::Direct),
                    ..Default::default()
                },
                ACTION_ITEM_LIMIT,
            )?
        } else {
            Vec::new()
        };

        let content = render_markdown(&included, &action_items, &summary, period_start, period_end);

        let digest = {
            let store = self.store.lock().expect("store lock");
            let digest = store.create_digest(
                period_start,
                period_end,
                included.len() as i64,
                &summary,
                Some(&content),
            )?;
            for record in &included {
                store.link_to_digest(&record.id, &digest.id)?;
            }
            digest
        };

        log::info!(
            "Generated digest {} covering {} email(s)",
            digest.id,
            digest.email_count
        );

        self.deliver(&digest)?;
        Ok(Some(digest))
    }

    async fn summarize(&self, llm: Option<&LlmProcessor>, records: &[ProcessedEmail]) -> String {
        if let Some(llm) = llm {
            let sample = &records[..records.len().min(SUMMARY_SAMPLE)];
            match llm.summarize(sample).await {
                Ok(summary) if !summary.is_empty() => return summary,
                Ok(_) => log::warn!("LLM summary was empty, using fallback"),
                Err(err) => log::warn!("LLM summary failed, using fallback: {err}"),
            }
        }
        format!("Digest contains {} emails.", records.len())
    }

    /// Write a persisted digest's stored content to every configured target
    /// (one default file target when none are configured), then record the
    /// outcome exactly once: delivered when at least one target succeeded.
    /// Callable again later to re-deliver; the recorded status is
    /// overwritten. A digest without stored content returns false and the
    /// status is left untouched.
    pub fn deliver(&self, digest: &Digest) -> Result<bool, EmmaError> {
        let Some(content) = digest.raw_content.as_deref() else {
            log::error!("Digest {} has no stored content to deliver", digest.id);
            return Ok(false);
        };

        let default_target = [DeliveryConfig::default()];
        let targets: &[DeliveryConfig] = if self.config.delivery.is_empty() {
            &default_target
        } else {
            &self.config.delivery
        };

        let mut delivered = 0usize;
        for target in targets {
            match self.deliver_to(target, digest, content) {
                Ok(path) => {
                    log::info!("Delivered digest {} to {}", digest.id, path.display());
                    delivered += 1;
                }
                Err(err) => log::error!("Delivery of digest {} failed: {err}", digest.id),
            }
        }

        let status = if delivered > 0 {
            DigestStatus::Delivered
        } else {
            DigestStatus::Failed
        };
        let store = self.store.lock().expect("store lock");
        store.update_digest_status(&digest.id, status)?;
        Ok(delivered > 0)
    }

    fn deliver_to(
        &self,
        target: &DeliveryConfig,
        digest: &Digest,
        content: &str,
    ) -> Result<PathBuf, EmmaError> {
        if target.delivery_type != "file" {
            return Err(EmmaError::Config(format!(
                "unknown delivery type '{}'",
                target.delivery_type
            )));
        }

        let dir = target
            .output_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("digests"));
        std::fs::create_dir_all(&dir)?;

        let (rendered, ext) = match target.format.as_str() {
            "html" => (markdown_to_html(content), "html"),
            "text" => (markdown_to_text(content), "txt"),
            _ => (content.to_string(), "md"),
        };

        let filename = format!("digest_{}.{ext}", digest.created_at.format("%Y%m%d_%H%M%S"));
        let path = dir.join(filename);
        std::fs::write(&path, rendered)?;
        Ok(path)
    }
}

fn category_heading(category: EmailCategory) -> &'static str {
    match category {
        EmailCategory::WorkClients => "Work: Clients",
        EmailCategory::WorkAdmin => "Work: Admin",
        EmailCategory::Personal => "Personal",
        _ => "Other",
    }
}

fn render_markdown(
    records: &[ProcessedEmail],
    action_items: &[ActionItem],
    summary: &str,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "# Email Digest\n\n{} to {}\n\n**Total Emails:** {}\n\n## Summary\n\n{}\n",
        period_start.format("%Y-%m-%d %H:%M UTC"),
        period_end.format("%Y-%m-%d %H:%M UTC"),
        records.len(),
        summary,
    ));

    let sections = [
        EmailCategory::WorkClients,
        EmailCategory::WorkAdmin,
        EmailCategory::Personal,
        EmailCategory::Other,
    ];
    for section in sections {
        let in_section: Vec<&ProcessedEmail> = records
            .iter()
            .filter(|r| {
                let category = r
                    .classification
                    .map(|c| c.category)
                    .unwrap_or(EmailCategory::Other);
                category == section || (section == EmailCategory::Other && !sections[..3].contains(&category))
            })
            .collect();
        if in_section.is_empty() {
            continue;
        }

        out.push_str(&format!("\n## {} ({})\n\n", category_heading(section), in_section.len()));
        for record in in_section {
            let marker = match record.classification.map(|c| c.priority) {
                Some(p) if p == crate::models::EmailPriority::Urgent => "🔴 ",
                Some(p) if p == crate::models::EmailPriority::High => "🟡 ",
                _ => "",
            };
            out.push_str(&format!(
                "- {marker}**{}** — {}\n",
                record.subject.as_deref().unwrap_or("(no subject)"),
                record.from_addr.as_deref().unwrap_or("(unknown sender)"),
            ));
        }
    }

    if !action_items.is_empty() {
        out.push_str(&format!("\n## Action Items ({})\n\n", action_items.len()));
        for item in action_items {
            let marker = match item.priority {
                crate::models::EmailPriority::Urgent => "🔴 ",
                crate::models::EmailPriority::High => "🟡 ",
                _ => "",
            };
            let due = item
                .due_date
                .map(|d| format!(" (due {})", d.format("%Y-%m-%d")))
                .unwrap_or_default();
            out.push_str(&format!("- [ ] {marker}{}{due}\n", item.title));
            if let Some(description) = &item.description {
                out.push_str(&format!("  {description}\n"));
            }
        }
    }

    out
}

/// Structural markdown-to-HTML conversion, enough for digest content.
fn markdown_to_html(markdown: &str) -> String {
    let bold = Regex::new(r"\*\*(.+?)\*\*").expect("static regex");
    let mut out = String::from("<html><body>\n");
    let mut in_list = false;

    for line in markdown.lines() {
        let line = bold.replace_all(line, "<strong>$1</strong>");
        let line = line.as_ref();

        if let Some(item) = line.strip_prefix("- ") {
            if !in_list {
                out.push_str("<ul>\n");
                in_list = true;
            }
            out.push_str(&format!("<li>{item}</li>\n"));
            continue;
        }
        if in_list {
            out.push_str("</ul>\n");
            in_list = false;
        }

        if let Some(h) = line.strip_prefix("## ") {
            out.push_str(&format!("<h2>{h}</h2>\n"));
        } else if let Some(h) = line.strip_prefix("# ") {
            out.push_str(&format!("<h1>{h}</h1>\n"));
        } else if !line.trim().is_empty() {
            out.push_str(&format!("<p>{line}</p>\n"));
        }
    }
    if in_list {
        out.push_str("</ul>\n");
    }
    out.push_str("</body></html>\n");
    out
}

/// Strip markdown markers for plain-text delivery.
fn markdown_to_text(markdown: &str) -> String {
    markdown
        .lines()
        .map(|line| {
            line.trim_start_matches('#')
                .trim_start()
                .replace("**", "")
                .replace("- [ ] ", "* ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

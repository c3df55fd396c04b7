//! Configuration stored in `~/.config/emma/config.json`.
//!
//! Every knob has a serde default so a minimal config file (or none at all,
//! via `Settings::default()`) still yields a working setup. API keys are
//! never stored in the file; they come from the environment.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::EmmaError;

/// Top-level application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Settings {
    /// Data directory. Defaults to `~/.local/share/emma`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// SQLite database path. Defaults to `<data_dir>/emma.db`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    #[serde(default)]
    pub notmuch: NotmuchConfig,

    /// Named Maildir accounts, polled when the indexed source is
    /// unavailable or disabled.
    #[serde(default)]
    pub maildir_accounts: Vec<MaildirConfig>,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub service: ServiceConfig,

    /// Messages fetched per source per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    50
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_dir: None,
            db_path: None,
            notmuch: NotmuchConfig::default(),
            maildir_accounts: Vec::new(),
            llm: LlmConfig::default(),
            service: ServiceConfig::default(),
            batch_size: default_batch_size(),
        }
    }
}

/// Indexed mail store (notmuch) configuration. Preferred source when enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NotmuchConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Tag applied to messages this system has processed.
    #[serde(default = "default_processed_tag")]
    pub processed_tag: String,
    /// Explicit notmuch config path; uses the notmuch default when absent.
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    /// Additional tags excluded from the unprocessed query.
    #[serde(default)]
    pub exclude_tags: Vec<String>,
}

fn default_processed_tag() -> String {
    "emma-processed".to_string()
}

impl Default for NotmuchConfig {
    fn default() -> Self {
        NotmuchConfig {
            enabled: false,
            processed_tag: default_processed_tag(),
            config_path: None,
            exclude_tags: Vec::new(),
        }
    }
}

/// A local Maildir account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MaildirConfig {
    pub name: String,
    pub path: PathBuf,
}

/// LLM backend selection and generation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LlmConfig {
    /// "ollama" or "anthropic"; empty disables the LLM collaborator.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_ollama_url")]
    pub ollama_base_url: String,
}

fn default_provider() -> String {
    "ollama".to_string()
}
fn default_model() -> String {
    "gpt-oss:20b".to_string()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f32 {
    0.3
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            provider: default_provider(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            ollama_base_url: default_ollama_url(),
        }
    }
}

/// Service daemon configuration: monitor, digest, action items, retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServiceConfig {
    /// Monitor cycle interval in seconds.
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub digest: DigestConfig,
    #[serde(default)]
    pub action_items: ActionItemConfig,
    /// Days of ledger history kept by the daily cleanup job.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_polling_interval() -> u64 {
    300
}
fn default_retention_days() -> u32 {
    30
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            polling_interval: default_polling_interval(),
            monitor: MonitorConfig::default(),
            digest: DigestConfig::default(),
            action_items: ActionItemConfig::default(),
            retention_days: default_retention_days(),
        }
    }
}

/// Monitor cycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Restrict polling to these source names; empty means all configured.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Folders polled on the per-account fallback path.
    #[serde(default = "default_folders")]
    pub folders: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_classify: bool,
    #[serde(default)]
    pub apply_rules: bool,
    #[serde(default = "default_true")]
    pub extract_actions: bool,
}

fn default_true() -> bool {
    true
}
fn default_folders() -> Vec<String> {
    vec!["INBOX".to_string()]
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            enabled: true,
            sources: Vec::new(),
            folders: default_folders(),
            auto_classify: true,
            apply_rules: false,
            extract_actions: true,
        }
    }
}

/// Digest generation and delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DigestConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Wall-clock times ("HH:MM") at which the daemon generates digests.
    #[serde(default = "default_digest_schedule")]
    pub schedule: Vec<String>,
    /// Lookback window in hours for each digest.
    #[serde(default = "default_period_hours")]
    pub period_hours: u32,
    /// Minimum relevant emails before a digest is produced (unless forced).
    #[serde(default = "default_min_emails")]
    pub min_emails: usize,
    #[serde(default = "default_true")]
    pub include_action_items: bool,
    /// Delivery targets; a single file target is assumed when empty.
    #[serde(default)]
    pub delivery: Vec<DeliveryConfig>,
}

fn default_digest_schedule() -> Vec<String> {
    vec!["08:00".to_string(), "20:00".to_string()]
}
fn default_period_hours() -> u32 {
    24
}
fn default_min_emails() -> usize {
    1
}

impl Default for DigestConfig {
    fn default() -> Self {
        DigestConfig {
            enabled: true,
            schedule: default_digest_schedule(),
            period_hours: default_period_hours(),
            min_emails: default_min_emails(),
            include_action_items: true,
            delivery: Vec::new(),
        }
    }
}

/// One digest delivery target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DeliveryConfig {
    /// Delivery kind; "file" is the only built-in.
    #[serde(rename = "type", default = "default_delivery_type")]
    pub delivery_type: String,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// "markdown", "html", or "text".
    #[serde(default = "default_delivery_format")]
    pub format: String,
}

fn default_delivery_type() -> String {
    "file".to_string()
}
fn default_delivery_format() -> String {
    "markdown".to_string()
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            delivery_type: default_delivery_type(),
            output_dir: None,
            format: default_delivery_format(),
        }
    }
}

/// Action item extraction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ActionItemConfig {
    /// Candidates below this confidence are discarded.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

fn default_confidence_threshold() -> f64 {
    0.7
}

impl Default for ActionItemConfig {
    fn default() -> Self {
        ActionItemConfig {
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

impl Settings {
    /// Resolve the data directory, defaulting to `~/.local/share/emma`.
    pub fn data_dir(&self) -> Result<PathBuf, EmmaError> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| EmmaError::Config("Could not find home directory".to_string()))?;
        Ok(home.join(".local").join("share").join("emma"))
    }

    /// Resolve the database path, defaulting to `<data_dir>/emma.db`.
    pub fn db_path(&self) -> Result<PathBuf, EmmaError> {
        if let Some(path) = &self.db_path {
            return Ok(path.clone());
        }
        Ok(self.data_dir()?.join("emma.db"))
    }

    /// Anthropic API key from the environment (`EMMA_ANTHROPIC_API_KEY`
    /// or `ANTHROPIC_API_KEY`). Never read from the config file.
    pub fn anthropic_api_key(&self) -> Option<String> {
        std::env::var("EMMA_ANTHROPIC_API_KEY")
            .or_else(|_| std::env::var("ANTHROPIC_API_KEY"))
            .ok()
            .filter(|k| !k.is_empty())
    }
}

/// Default config file path: `~/.config/emma/config.json`.
pub fn config_path() -> Result<PathBuf, EmmaError> {
    let home = dirs::home_dir()
        .ok_or_else(|| EmmaError::Config("Could not find home directory".to_string()))?;
    Ok(home.join(".config").join("emma").join("config.json"))
}

/// Load settings from the default config path. A missing file yields
/// defaults; a malformed file is a configuration error.
pub fn load_settings() -> Result<Settings, EmmaError> {
    let path = config_path()?;
    load_settings_from(&path)
}

/// Load settings from an explicit path. Useful for testing.
pub fn load_settings_from(path: &std::path::Path) -> Result<Settings, EmmaError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| EmmaError::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

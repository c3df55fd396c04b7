//! Mail source connectors.
//!
//! All connectors are local: notmuch (indexed, preferred), raw Maildir
//! (per-account fallback), and an in-memory fixture for tests and demos.
//! The set is closed on purpose; the monitor dispatches over the enum
//! rather than a trait object.

pub mod maildir;
pub mod notmuch;

use std::collections::HashSet;
use std::sync::Mutex;

use thiserror::Error;

use crate::error::EmmaError;
use crate::models::Message;

pub use maildir::MaildirSource;
pub use notmuch::NotmuchSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("notmuch: {0}")]
    Notmuch(String),

    #[error("Failed to parse message: {0}")]
    Parse(String),

    #[error("Source not available: {0}")]
    NotAvailable(String),
}

impl From<SourceError> for EmmaError {
    fn from(err: SourceError) -> Self {
        EmmaError::Source(err.to_string())
    }
}

/// A configured mail source.
pub enum MailSource {
    Notmuch(NotmuchSource),
    Maildir(MaildirSource),
    Memory(MemorySource),
}

impl MailSource {
    /// Source name as recorded in the ledger.
    pub fn name(&self) -> &str {
        match self {
            MailSource::Notmuch(s) => s.name(),
            MailSource::Maildir(s) => s.name(),
            MailSource::Memory(s) => s.name(),
        }
    }

    /// True when the source maintains its own processed-state index, so a
    /// single query already excludes handled messages.
    pub fn is_indexed(&self) -> bool {
        matches!(self, MailSource::Notmuch(_))
    }

    /// Verify the source is reachable.
    pub async fn connect(&self) -> Result<(), SourceError> {
        match self {
            MailSource::Notmuch(s) => s.connect().await,
            MailSource::Maildir(s) => s.connect(),
            MailSource::Memory(_) => Ok(()),
        }
    }

    pub async fn list_folders(&self) -> Result<Vec<String>, SourceError> {
        match self {
            MailSource::Notmuch(s) => s.list_folders().await,
            MailSource::Maildir(s) => s.list_folders(),
            MailSource::Memory(s) => s.list_folders(),
        }
    }

    /// Fetch messages the source considers unhandled, newest window first.
    /// For non-indexed sources this may include messages the ledger has
    /// already seen; the caller screens against the ledger.
    pub async fn fetch_unprocessed(
        &self,
        folder: &str,
        hours: u32,
        limit: usize,
    ) -> Result<Vec<Message>, SourceError> {
        match self {
            MailSource::Notmuch(s) => s.fetch_unprocessed(hours, limit).await,
            MailSource::Maildir(s) => s.fetch_messages(folder, limit),
            MailSource::Memory(s) => s.fetch_unprocessed(folder, limit),
        }
    }

    /// Record handled state in the source's own index. Best effort; the
    /// ledger remains the authority and callers log failures without
    /// propagating them. Raw Maildir has no index and its files are never
    /// touched, so the ledger alone screens repeats there.
    pub async fn mark_processed(&self, message: &Message) -> Result<(), SourceError> {
        match self {
            MailSource::Notmuch(s) => s.mark_processed(message).await,
            MailSource::Maildir(_) => Ok(()),
            MailSource::Memory(s) => s.mark_processed(message),
        }
    }
}

/// In-memory source holding a fixed set of messages. Used by tests and the
/// demo configuration.
pub struct MemorySource {
    name: String,
    messages: Mutex<Vec<Message>>,
    handled: Mutex<HashSet<String>>,
}

impl MemorySource {
    pub fn new(name: &str, messages: Vec<Message>) -> Self {
        Self {
            name: name.to_string(),
            messages: Mutex::new(messages),
            handled: Mutex::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&self, message: Message) {
        self.messages.lock().expect("messages lock").push(message);
    }

    fn list_folders(&self) -> Result<Vec<String>, SourceError> {
        let messages = self.messages.lock().expect("messages lock");
        let mut folders: Vec<String> = messages.iter().map(|m| m.folder.clone()).collect();
        folders.sort();
        folders.dedup();
        Ok(folders)
    }

    fn fetch_unprocessed(&self, folder: &str, limit: usize) -> Result<Vec<Message>, SourceError> {
        let messages = self.messages.lock().expect("messages lock");
        let handled = self.handled.lock().expect("handled lock");
        Ok(messages
            .iter()
            .filter(|m| m.folder == folder && !handled.contains(&m.id))
            .take(limit)
            .cloned()
            .collect())
    }

    fn mark_processed(&self, message: &Message) -> Result<(), SourceError> {
        self.handled
            .lock()
            .expect("handled lock")
            .insert(message.id.clone());
        Ok(())
    }
}

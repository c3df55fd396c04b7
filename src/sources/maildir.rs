//! Raw Maildir source.
//!
//! Per-account fallback when no notmuch index is available. Scans new/ and
//! cur/ directly and parses messages with mailparse. Carries no processed
//! state of its own and never renames or moves files, so the source-local
//! id (the filename) stays stable across polls; the caller screens fetched
//! messages against the ledger.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use mailparse::{dateparse, parse_mail, MailHeaderMap, ParsedMail};
use walkdir::WalkDir;

use super::SourceError;
use crate::models::{Attachment, Message};

pub struct MaildirSource {
    name: String,
    base: PathBuf,
}

impl MaildirSource {
    pub fn new(name: &str, base: &Path) -> Self {
        Self {
            name: name.to_string(),
            base: base.to_path_buf(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connect(&self) -> Result<(), SourceError> {
        if !self.base.exists() {
            return Err(SourceError::NotAvailable(format!(
                "maildir path does not exist: {}",
                self.base.display()
            )));
        }
        Ok(())
    }

    /// List folders: INBOX plus direct subdirectories that look like
    /// maildirs, plus Maildir++ dot-folders.
    pub fn list_folders(&self) -> Result<Vec<String>, SourceError> {
        let mut folders = vec!["INBOX".to_string()];

        for entry in WalkDir::new(&self.base)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            let path = entry.path();
            if name.starts_with('.') {
                let stripped = name.trim_start_matches('.');
                if !stripped.is_empty() {
                    folders.push(stripped.to_string());
                }
            } else if path.join("cur").exists() || path.join("new").exists() {
                folders.push(name.to_string());
            }
        }

        folders.sort();
        folders.dedup();
        Ok(folders)
    }

    fn folder_path(&self, folder: &str) -> PathBuf {
        let direct = self.base.join(folder);
        if direct.join("cur").exists() || direct.join("new").exists() {
            return direct;
        }
        if folder == "INBOX" && (self.base.join("cur").exists() || self.base.join("new").exists()) {
            return self.base.clone();
        }
        let maildir_plus = self.base.join(format!(".{folder}"));
        if maildir_plus.exists() {
            return maildir_plus;
        }
        direct
    }

    /// Fetch messages from a folder, newest first by file modification time.
    pub fn fetch_messages(&self, folder: &str, limit: usize) -> Result<Vec<Message>, SourceError> {
        let folder_path = self.folder_path(folder);
        let mut files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();

        for sub in ["new", "cur"] {
            let dir = folder_path.join(sub);
            if !dir.exists() {
                continue;
            }
            for entry in WalkDir::new(&dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(Result::ok)
            {
                if entry.file_type().is_file() {
                    let mtime = entry
                        .metadata()
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                    files.push((entry.into_path(), mtime));
                }
            }
        }

        files.sort_by(|a, b| b.1.cmp(&a.1));
        files.truncate(limit);

        let mut messages = Vec::new();
        for (path, _) in files {
            match self.parse_file(&path, folder) {
                Ok(message) => messages.push(message),
                Err(err) => log::warn!("Skipping unparseable message {}: {err}", path.display()),
            }
        }
        Ok(messages)
    }

    fn parse_file(&self, path: &Path, folder: &str) -> Result<Message, SourceError> {
        let raw = std::fs::read(path)?;
        let parsed = parse_mail(&raw).map_err(|e| SourceError::Parse(e.to_string()))?;

        let filename = path
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| SourceError::Parse("non-utf8 filename".to_string()))?;

        let mut message = Message::new(filename, &self.name, folder);
        message.message_id = parsed
            .headers
            .get_first_value("Message-ID")
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());
        message.subject = parsed.headers.get_first_value("Subject").unwrap_or_default();
        message.from_addr = parsed.headers.get_first_value("From").unwrap_or_default();
        message.to_addrs = split_addrs(parsed.headers.get_first_value("To"));
        message.cc_addrs = split_addrs(parsed.headers.get_first_value("Cc"));
        message.date = parsed
            .headers
            .get_first_value("Date")
            .and_then(|d| dateparse(&d).ok())
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
        message.flags = flags_from_filename(filename);

        collect_parts(&parsed, &mut message).map_err(|e| SourceError::Parse(e.to_string()))?;
        if message.body_text.is_empty() && parsed.subparts.is_empty() {
            message.body_text = parsed
                .get_body()
                .map_err(|e| SourceError::Parse(e.to_string()))?;
        }
        Ok(message)
    }
}

fn split_addrs(value: Option<String>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect()
}

/// Maildir flags are encoded after ":2," in the filename (S=seen, R=replied,
/// F=flagged, T=trashed).
fn flags_from_filename(filename: &str) -> Vec<String> {
    let Some((_, flags)) = filename.split_once(":2,") else {
        return Vec::new();
    };
    flags
        .chars()
        .filter_map(|c| match c {
            'S' => Some("seen".to_string()),
            'R' => Some("replied".to_string()),
            'F' => Some("flagged".to_string()),
            'T' => Some("trashed".to_string()),
            'D' => Some("draft".to_string()),
            _ => None,
        })
        .collect()
}

fn collect_parts(part: &ParsedMail<'_>, message: &mut Message) -> Result<(), mailparse::MailParseError> {
    if part.subparts.is_empty() {
        let mimetype = part.ctype.mimetype.to_lowercase();
        let disposition = part.get_content_disposition();
        if disposition.disposition == mailparse::DispositionType::Attachment {
            message.attachments.push(Attachment {
                filename: disposition
                    .params
                    .get("filename")
                    .cloned()
                    .unwrap_or_else(|| "unnamed".to_string()),
                content_type: part.ctype.mimetype.clone(),
                size: part.get_body_raw().map(|b| b.len() as u64).unwrap_or(0),
            });
        } else if mimetype == "text/plain" && message.body_text.is_empty() {
            message.body_text = part.get_body()?;
        } else if mimetype == "text/html" && message.body_html.is_none() {
            message.body_html = Some(part.get_body()?);
        }
        return Ok(());
    }

    for sub in &part.subparts {
        collect_parts(sub, message)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_MAIL: &str = "Message-ID: <m1@example.com>\r\n\
From: billing@example.com\r\n\
To: me@example.com\r\n\
Subject: Invoice due Friday\r\n\
Date: Fri, 21 Aug 2026 10:00:00 +0000\r\n\
Content-Type: text/plain\r\n\
\r\n\
Please pay invoice #42 by Friday.\r\n";

    fn make_maildir(dir: &Path) {
        std::fs::create_dir_all(dir.join("new")).expect("mkdir new");
        std::fs::create_dir_all(dir.join("cur")).expect("mkdir cur");
    }

    #[test]
    fn test_fetch_and_parse() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let base = tmp.path().join("account");
        make_maildir(&base);
        std::fs::write(base.join("new").join("1692612000.m1"), SIMPLE_MAIL).expect("write");

        let source = MaildirSource::new("personal", &base);
        source.connect().expect("connect");
        let messages = source.fetch_messages("INBOX", 10).expect("fetch");

        assert_eq!(messages.len(), 1);
        let m = &messages[0];
        assert_eq!(m.id, "1692612000.m1");
        assert_eq!(m.message_id.as_deref(), Some("<m1@example.com>"));
        assert_eq!(m.subject, "Invoice due Friday");
        assert_eq!(m.source, "personal");
        assert!(m.body_text.contains("invoice #42"));
        assert!(m.date.is_some());
    }

    #[test]
    fn test_repeated_fetch_keeps_ids_stable() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let base = tmp.path().join("account");
        make_maildir(&base);
        std::fs::write(base.join("new").join("msg-a"), SIMPLE_MAIL).expect("write");

        let source = MaildirSource::new("personal", &base);
        let first = source.fetch_messages("INBOX", 10).expect("fetch");
        let second = source.fetch_messages("INBOX", 10).expect("fetch again");

        assert_eq!(first[0].id, second[0].id);
        assert!(base.join("new").join("msg-a").exists());
    }

    #[test]
    fn test_list_folders() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let base = tmp.path().join("account");
        make_maildir(&base);
        make_maildir(&base.join("Archive"));
        std::fs::create_dir_all(base.join(".Sent").join("cur")).expect("mkdir");
        std::fs::create_dir_all(base.join("notes")).expect("mkdir plain dir");

        let source = MaildirSource::new("personal", &base);
        let folders = source.list_folders().expect("folders");

        assert!(folders.contains(&"INBOX".to_string()));
        assert!(folders.contains(&"Archive".to_string()));
        assert!(folders.contains(&"Sent".to_string()));
        assert!(!folders.contains(&"notes".to_string()));
    }

    #[test]
    fn test_flags_from_filename() {
        assert_eq!(
            flags_from_filename("123:2,SF"),
            vec!["seen".to_string(), "flagged".to_string()]
        );
        assert!(flags_from_filename("123").is_empty());
    }

    #[test]
    fn test_connect_missing_path() {
        let source = MaildirSource::new("gone", Path::new("/does/not/exist"));
        assert!(source.connect().is_err());
    }
}

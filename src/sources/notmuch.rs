//! Notmuch source, driven through the `notmuch` CLI.
//!
//! Preferred over raw Maildir scanning when available: the index answers
//! "unhandled mail in the last N hours" in one query, and the processed tag
//! keeps already-handled mail out of subsequent queries entirely.

use chrono::{DateTime, Duration, Utc};
use tokio::process::Command;

use super::SourceError;
use crate::models::{Attachment, Message};

pub struct NotmuchSource {
    name: String,
    processed_tag: String,
    exclude_tags: Vec<String>,
    config_path: Option<String>,
}

impl NotmuchSource {
    pub fn new(processed_tag: &str, exclude_tags: Vec<String>, config_path: Option<String>) -> Self {
        Self {
            name: "notmuch".to_string(),
            processed_tag: processed_tag.to_string(),
            exclude_tags,
            config_path,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, args: &[&str]) -> Result<String, SourceError> {
        let mut cmd = Command::new("notmuch");
        if let Some(config) = &self.config_path {
            cmd.arg("--config").arg(config);
        }
        cmd.args(args);

        let output = cmd.output().await.map_err(|e| {
            SourceError::NotAvailable(format!("failed to run notmuch: {e}"))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SourceError::Notmuch(format!(
                "notmuch {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Verify the binary and database are reachable.
    pub async fn connect(&self) -> Result<(), SourceError> {
        self.run(&["count", "*"]).await?;
        Ok(())
    }

    /// Distinct folder names known to the index.
    pub async fn list_folders(&self) -> Result<Vec<String>, SourceError> {
        let stdout = self
            .run(&["search", "--output=files", "--format=text", "*"])
            .await?;

        let mut folders: Vec<String> = stdout
            .lines()
            .filter_map(folder_from_path)
            .collect();
        folders.sort();
        folders.dedup();
        Ok(folders)
    }

    fn unprocessed_query(&self, since: DateTime<Utc>) -> String {
        // Explicit date is more reliable than notmuch relative syntax
        let mut parts = vec![
            format!("date:{}..", since.format("%Y-%m-%d")),
            format!("NOT tag:{}", self.processed_tag),
        ];
        for tag in &self.exclude_tags {
            parts.push(format!("NOT tag:{tag}"));
        }
        parts.join(" AND ")
    }

    /// Fetch messages from the last `hours` that do not carry the processed
    /// tag.
    pub async fn fetch_unprocessed(
        &self,
        hours: u32,
        limit: usize,
    ) -> Result<Vec<Message>, SourceError> {
        let since = Utc::now() - Duration::hours(i64::from(hours));
        let query = self.unprocessed_query(since);
        let limit_arg = limit.to_string();

        let stdout = self
            .run(&[
                "show",
                "--format=json",
                "--include-html",
                "--body=true",
                "--entire-thread=false",
                "--limit",
                &limit_arg,
                &query,
            ])
            .await;

        let stdout = match stdout {
            Ok(s) => s,
            // An empty result set is not an error
            Err(SourceError::Notmuch(msg)) if msg.contains("No messages") => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }

        let data: serde_json::Value = serde_json::from_str(&stdout)
            .map_err(|e| SourceError::Parse(format!("notmuch show output: {e}")))?;

        // show output nests messages in thread structure; walk it
        let mut messages = Vec::new();
        collect_messages(&data, &self.name, &mut messages);
        messages.truncate(limit);
        Ok(messages)
    }

    /// Tag the message as handled in the index.
    pub async fn mark_processed(&self, message: &Message) -> Result<(), SourceError> {
        let tag = format!("+{}", self.processed_tag);
        let query = format!("id:{}", message.id);
        self.run(&["tag", &tag, "--", &query]).await?;
        Ok(())
    }
}

fn folder_from_path(path: &str) -> Option<String> {
    // Paths look like .../Maildir/<folder>/{cur,new}/<file>
    let parent = std::path::Path::new(path).parent()?;
    let leaf = parent.file_name()?.to_str()?;
    if leaf == "cur" || leaf == "new" || leaf == "tmp" {
        let folder = parent.parent()?.file_name()?.to_str()?;
        return Some(folder.trim_start_matches('.').to_string());
    }
    None
}

/// Recursively collect message objects from notmuch show's nested thread
/// structure (arrays of arrays with message dicts at the leaves).
fn collect_messages(value: &serde_json::Value, source: &str, out: &mut Vec<Message>) {
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                collect_messages(item, source, out);
            }
        }
        serde_json::Value::Object(obj) => {
            if obj.contains_key("id") && obj.contains_key("headers") {
                if let Some(message) = parse_message(value, source) {
                    out.push(message);
                }
            }
        }
        _ => {}
    }
}

fn parse_message(data: &serde_json::Value, source: &str) -> Option<Message> {
    let id = data["id"].as_str()?;
    let headers = &data["headers"];

    let mut message = Message::new(id, source, "INBOX");
    // notmuch ids are Message-IDs without the angle brackets
    message.message_id = Some(format!("<{id}>"));
    message.subject = headers["Subject"].as_str().unwrap_or_default().to_string();
    message.from_addr = headers["From"].as_str().unwrap_or_default().to_string();
    message.to_addrs = split_addrs(headers["To"].as_str());
    message.cc_addrs = split_addrs(headers["Cc"].as_str());
    message.date = headers["Date"]
        .as_str()
        .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
        .map(|d| d.with_timezone(&Utc));

    if let Some(tags) = data["tags"].as_array() {
        message.flags = tags
            .iter()
            .filter_map(|t| t.as_str().map(str::to_string))
            .collect();
    }

    if let Some(filename) = data["filename"]
        .as_array()
        .and_then(|f| f.first())
        .and_then(|f| f.as_str())
        .or_else(|| data["filename"].as_str())
    {
        if let Some(folder) = folder_from_path(filename) {
            message.folder = folder;
        }
    }

    collect_body(&data["body"], &mut message);
    Some(message)
}

fn split_addrs(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect()
}

fn collect_body(value: &serde_json::Value, message: &mut Message) {
    match value {
        serde_json::Value::Array(parts) => {
            for part in parts {
                collect_body(part, message);
            }
        }
        serde_json::Value::Object(obj) => {
            let content_type = obj
                .get("content-type")
                .and_then(|c| c.as_str())
                .unwrap_or_default();
            match obj.get("content") {
                Some(serde_json::Value::String(content)) => {
                    if content_type == "text/plain" && message.body_text.is_empty() {
                        message.body_text = content.clone();
                    } else if content_type == "text/html" && message.body_html.is_none() {
                        message.body_html = Some(content.clone());
                    }
                }
                Some(nested) => collect_body(nested, message),
                None => {
                    // A part without inline content is an attachment
                    if let Some(filename) = obj.get("filename").and_then(|f| f.as_str()) {
                        message.attachments.push(Attachment {
                            filename: filename.to_string(),
                            content_type: content_type.to_string(),
                            size: obj
                                .get("content-length")
                                .and_then(|s| s.as_u64())
                                .unwrap_or(0),
                        });
                    }
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unprocessed_query_shape() {
        let source = NotmuchSource::new(
            "emma-processed",
            vec!["spam".to_string(), "deleted".to_string()],
            None,
        );
        let since = Utc::now() - Duration::hours(24);
        let query = source.unprocessed_query(since);

        assert!(query.starts_with("date:"));
        assert!(query.contains("NOT tag:emma-processed"));
        assert!(query.contains("NOT tag:spam"));
        assert!(query.contains("NOT tag:deleted"));
    }

    #[test]
    fn test_folder_from_path() {
        assert_eq!(
            folder_from_path("/home/u/Maildir/Archive/cur/12345:2,S"),
            Some("Archive".to_string())
        );
        assert_eq!(
            folder_from_path("/home/u/Maildir/.Sent/new/12345"),
            Some("Sent".to_string())
        );
        assert_eq!(folder_from_path("/home/u/notes.txt"), None);
    }

    #[test]
    fn test_parse_show_output() {
        let raw = serde_json::json!([[[
            {
                "id": "msg-1@example.com",
                "tags": ["inbox", "unread"],
                "filename": ["/home/u/Maildir/INBOX/new/1"],
                "headers": {
                    "Subject": "Invoice due Friday",
                    "From": "billing@example.com",
                    "To": "me@example.com, you@example.com",
                    "Date": "Fri, 21 Aug 2026 10:00:00 +0000"
                },
                "body": [
                    {"id": 1, "content-type": "text/plain", "content": "Pay invoice #42."}
                ]
            },
            []
        ]]]);

        let mut messages = Vec::new();
        collect_messages(&raw, "notmuch", &mut messages);

        assert_eq!(messages.len(), 1);
        let m = &messages[0];
        assert_eq!(m.id, "msg-1@example.com");
        assert_eq!(m.message_id.as_deref(), Some("<msg-1@example.com>"));
        assert_eq!(m.subject, "Invoice due Friday");
        assert_eq!(m.to_addrs.len(), 2);
        assert_eq!(m.body_text, "Pay invoice #42.");
        assert_eq!(m.folder, "INBOX");
        assert!(m.date.is_some());
        assert!(m.flags.contains(&"unread".to_string()));
    }

    #[test]
    fn test_parse_multipart_with_attachment() {
        let raw = serde_json::json!([[[
            {
                "id": "msg-2@example.com",
                "headers": {"Subject": "Report", "From": "a@b.c", "Date": "bad date"},
                "body": [{
                    "id": 1,
                    "content-type": "multipart/mixed",
                    "content": [
                        {"id": 2, "content-type": "text/plain", "content": "See attached."},
                        {"id": 3, "content-type": "application/pdf",
                         "filename": "report.pdf", "content-length": 1024}
                    ]
                }]
            },
            []
        ]]]);

        let mut messages = Vec::new();
        collect_messages(&raw, "notmuch", &mut messages);

        assert_eq!(messages.len(), 1);
        let m = &messages[0];
        assert_eq!(m.body_text, "See attached.");
        assert!(m.date.is_none());
        assert_eq!(m.attachments.len(), 1);
        assert_eq!(m.attachments[0].filename, "report.pdf");
        assert_eq!(m.attachments[0].size, 1024);
    }
}

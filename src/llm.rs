//! LLM backends and the prompt layer built on them.
//!
//! `ChatClient` is the seam: a backend only has to turn a prompt into text.
//! `LlmProcessor` owns the prompts and the defensive parsing of whatever the
//! model sends back. Model output is never trusted; every parse has a
//! fallback that degrades to a conservative default instead of failing the
//! calling operation.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::models::{
    Classification, DraftReply, EmailCategory, EmailPriority, Message, ProcessedEmail,
};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// How many times to re-ask a backend that returned an empty completion.
const EMPTY_RESPONSE_RETRIES: u32 = 2;

/// Maximum body characters included in a prompt.
const BODY_SNIPPET_LEN: usize = 2000;

/// A text-completion backend.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(&self, prompt: &str, max_tokens: u32, temperature: f32)
        -> Result<String, LlmError>;

    /// Human-readable backend name for logs.
    fn name(&self) -> &str;
}

/// Build the configured backend. Returns None when the provider is "none"
/// or unrecognized, which disables enrichment rather than failing startup.
pub fn build_client(config: &LlmConfig, api_key: Option<String>) -> Option<Box<dyn ChatClient>> {
    match config.provider.as_str() {
        "ollama" => Some(Box::new(OllamaClient::new(
            &config.ollama_base_url,
            &config.model,
        ))),
        "anthropic" => match api_key {
            Some(key) => Some(Box::new(AnthropicClient::new(&config.model, key))),
            None => {
                log::warn!("Anthropic provider selected but no API key found; LLM disabled");
                None
            }
        },
        "none" => None,
        other => {
            log::warn!("Unknown LLM provider '{other}'; LLM disabled");
            None
        }
    }
}

// =============================================================================
// Ollama
// =============================================================================

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

/// Local Ollama backend.
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, LlmError> {
        let request = OllamaRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: OllamaOptions {
                num_predict: max_tokens,
                temperature,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: OllamaResponse = response.json().await?;
        Ok(body.response)
    }
}

#[async_trait]
impl ChatClient for OllamaClient {
    async fn chat(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, LlmError> {
        // Local models occasionally return an empty completion; re-ask a
        // bounded number of times before giving up
        for attempt in 0..=EMPTY_RESPONSE_RETRIES {
            let text = self.generate(prompt, max_tokens, temperature).await?;
            if !text.trim().is_empty() {
                return Ok(text);
            }
            log::debug!(
                "Empty response from {} (attempt {}/{})",
                self.model,
                attempt + 1,
                EMPTY_RESPONSE_RETRIES + 1
            );
        }
        Err(LlmError::EmptyResponse)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

// =============================================================================
// Anthropic
// =============================================================================

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: String,
}

/// Anthropic Messages API backend.
pub struct AnthropicClient {
    client: reqwest::Client,
    model: String,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(model: &str, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            model: model.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl ChatClient for AnthropicClient {
    async fn chat(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, LlmError> {
        let request = AnthropicRequest {
            model: &self.model,
            max_tokens,
            temperature,
            messages: vec![AnthropicMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: AnthropicResponse = response.json().await?;
        let text = body
            .content
            .first()
            .map(|c| c.text.clone())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(text)
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

// =============================================================================
// JSON extraction
// =============================================================================

/// Extract a JSON value from model output. Tries a direct parse, then a
/// fenced ```json block, then the first bare object or array in the text.
pub fn parse_json(text: &str) -> Result<serde_json::Value, LlmError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    let fenced = Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("static regex");
    if let Some(caps) = fenced.captures(trimmed) {
        if let Ok(value) = serde_json::from_str(caps[1].trim()) {
            return Ok(value);
        }
    }

    let bare = Regex::new(r"(?s)(\{.*\}|\[.*\])").expect("static regex");
    if let Some(caps) = bare.captures(trimmed) {
        if let Ok(value) = serde_json::from_str(caps[1].trim()) {
            return Ok(value);
        }
    }

    Err(LlmError::Parse(format!(
        "no JSON found in {} chars of model output",
        text.len()
    )))
}

// =============================================================================
// Processor
// =============================================================================

/// A raw action item proposed by the model, before the confidence filter.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionCandidate {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub urgency: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub relevance: Option<String>,
}

fn default_confidence() -> f64 {
    1.0
}

#[derive(Deserialize)]
struct ClassifyResponse {
    #[serde(default)]
    category: String,
    #[serde(default)]
    priority: String,
}

/// Prompt layer over a `ChatClient`.
pub struct LlmProcessor {
    client: Box<dyn ChatClient>,
    max_tokens: u32,
    temperature: f32,
}

impl LlmProcessor {
    pub fn new(client: Box<dyn ChatClient>, config: &LlmConfig) -> Self {
        Self {
            client,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.client.name()
    }

    fn body_snippet(message: &Message) -> &str {
        let body = message.body_text.as_str();
        match body.char_indices().nth(BODY_SNIPPET_LEN) {
            Some((idx, _)) => &body[..idx],
            None => body,
        }
    }

    /// Classify a message into a category and priority. Unparseable output
    /// degrades to Other/Normal rather than failing.
    pub async fn classify(&self, message: &Message) -> Result<Classification, LlmError> {
        let prompt = format!(
            "Classify this email into exactly one category and one priority.\n\
             Categories: personal, work_clients, work_admin, other, newsletter, promotional, spam\n\
             Priorities: low, normal, high, urgent\n\n\
             From: {}\nSubject: {}\n\nBody:\n{}\n\n\
             Respond with JSON only: {{\"category\": \"...\", \"priority\": \"...\"}}",
            message.from_addr,
            message.subject,
            Self::body_snippet(message),
        );

        let text = self
            .client
            .chat(&prompt, self.max_tokens, self.temperature)
            .await?;

        match parse_json(&text).and_then(|v| {
            serde_json::from_value::<ClassifyResponse>(v)
                .map_err(|e| LlmError::Parse(e.to_string()))
        }) {
            Ok(parsed) => Ok(Classification {
                category: EmailCategory::parse(&parsed.category),
                priority: EmailPriority::parse(&parsed.priority),
            }),
            Err(err) => {
                log::warn!("Classification parse failed, using defaults: {err}");
                Ok(Classification {
                    category: EmailCategory::Other,
                    priority: EmailPriority::Normal,
                })
            }
        }
    }

    /// Free-form structured analysis of a message, stored alongside the
    /// processed record as opaque JSON.
    pub async fn analyze(&self, message: &Message) -> Result<serde_json::Value, LlmError> {
        let prompt = format!(
            "Analyze this email and respond with JSON only:\n\
             {{\"summary\": \"one sentence\", \"sentiment\": \"positive|neutral|negative\",\n\
              \"requires_response\": true|false, \"topics\": [\"...\"]}}\n\n\
             From: {}\nSubject: {}\n\nBody:\n{}",
            message.from_addr,
            message.subject,
            Self::body_snippet(message),
        );

        let text = self
            .client
            .chat(&prompt, self.max_tokens, self.temperature)
            .await?;
        parse_json(&text)
    }

    /// Summarize a batch of processed emails for a digest.
    pub async fn summarize(&self, records: &[ProcessedEmail]) -> Result<String, LlmError> {
        let lines: Vec<String> = records
            .iter()
            .map(|r| {
                format!(
                    "- From: {} | Subject: {}",
                    r.from_addr.as_deref().unwrap_or("(unknown)"),
                    r.subject.as_deref().unwrap_or("(no subject)"),
                )
            })
            .collect();

        let prompt = format!(
            "Summarize this batch of {} emails in 2-4 sentences. Mention the\n\
             most important senders and themes. Plain prose, no lists.\n\n{}",
            records.len(),
            lines.join("\n"),
        );

        let text = self
            .client
            .chat(&prompt, self.max_tokens, self.temperature)
            .await?;
        Ok(text.trim().to_string())
    }

    /// Extract candidate action items from a message. Unparseable output
    /// yields an empty list, never an error.
    pub async fn extract_action_items(
        &self,
        message: &Message,
    ) -> Result<Vec<ActionCandidate>, LlmError> {
        let prompt = format!(
            "Extract action items from this email that require something from\n\
             the recipient. Respond with a JSON array (possibly empty):\n\
             [{{\"title\": \"...\", \"description\": \"...\", \"priority\": \"low|normal|high|urgent\",\n\
               \"urgency\": \"low|normal|high\", \"due_date\": \"RFC3339 or null\",\n\
               \"confidence\": 0.0-1.0, \"relevance\": \"direct|informational\"}}]\n\n\
             From: {}\nSubject: {}\n\nBody:\n{}",
            message.from_addr,
            message.subject,
            Self::body_snippet(message),
        );

        let text = self
            .client
            .chat(&prompt, self.max_tokens, self.temperature)
            .await?;

        match parse_json(&text) {
            Ok(serde_json::Value::Array(items)) => {
                let mut candidates = Vec::new();
                for item in items {
                    match serde_json::from_value::<ActionCandidate>(item) {
                        Ok(candidate) if !candidate.title.trim().is_empty() => {
                            candidates.push(candidate)
                        }
                        Ok(_) => log::debug!("Dropped untitled action candidate"),
                        Err(err) => log::debug!("Dropped malformed action candidate: {err}"),
                    }
                }
                Ok(candidates)
            }
            Ok(_) => {
                log::warn!("Action extraction returned non-array JSON, ignoring");
                Ok(Vec::new())
            }
            Err(err) => {
                log::warn!("Action extraction parse failed, ignoring: {err}");
                Ok(Vec::new())
            }
        }
    }

    /// Draft a reply to a message. The draft is returned for review and
    /// never sent anywhere by this layer.
    pub async fn draft_reply(
        &self,
        message: &Message,
        instructions: Option<&str>,
    ) -> Result<DraftReply, LlmError> {
        let guidance = instructions.unwrap_or("polite and concise");
        let prompt = format!(
            "Draft a reply to this email ({guidance}). Return only the reply\n\
             body, no subject line and no commentary.\n\n\
             From: {}\nSubject: {}\n\nBody:\n{}",
            message.from_addr,
            message.subject,
            Self::body_snippet(message),
        );

        let text = self
            .client
            .chat(&prompt, self.max_tokens, self.temperature)
            .await?;
        Ok(DraftReply {
            id: uuid::Uuid::new_v4().to_string(),
            original_email_id: message.id.clone(),
            original_subject: message.subject.clone(),
            recipient: message.from_addr.clone(),
            draft_body: text.trim().to_string(),
            created_at: chrono::Utc::now(),
            instructions: instructions.map(str::to_string),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ScriptedClient;
    use super::*;

    fn processor(client: ScriptedClient) -> LlmProcessor {
        LlmProcessor::new(Box::new(client), &LlmConfig::default())
    }

    fn sample_message() -> Message {
        let mut m = Message::new("1", "test", "INBOX");
        m.subject = "Invoice due Friday".to_string();
        m.from_addr = "billing@example.com".to_string();
        m.body_text = "Please pay invoice #42 by Friday.".to_string();
        m
    }

    #[test]
    fn test_parse_json_direct() {
        let value = parse_json(r#"{"a": 1}"#).expect("parse");
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_parse_json_fenced_block() {
        let text = "Here you go:\n```json\n{\"category\": \"spam\"}\n```\nDone.";
        let value = parse_json(text).expect("parse");
        assert_eq!(value["category"], "spam");
    }

    #[test]
    fn test_parse_json_bare_object_in_prose() {
        let text = "The answer is {\"priority\": \"high\"} as requested.";
        let value = parse_json(text).expect("parse");
        assert_eq!(value["priority"], "high");
    }

    #[test]
    fn test_parse_json_array() {
        let text = "```\n[{\"title\": \"Pay invoice\"}]\n```";
        let value = parse_json(text).expect("parse");
        assert!(value.is_array());
    }

    #[test]
    fn test_parse_json_failure() {
        assert!(parse_json("I could not find any tasks.").is_err());
    }

    #[tokio::test]
    async fn test_classify_happy_path() {
        let p = processor(ScriptedClient::always(
            r#"{"category": "work_admin", "priority": "high"}"#,
        ));
        let c = p.classify(&sample_message()).await.expect("classify");
        assert_eq!(c.category, EmailCategory::WorkAdmin);
        assert_eq!(c.priority, EmailPriority::High);
    }

    #[tokio::test]
    async fn test_classify_legacy_category_mapping() {
        let p = processor(ScriptedClient::always(
            r#"{"category": "work", "priority": "normal"}"#,
        ));
        let c = p.classify(&sample_message()).await.expect("classify");
        assert_eq!(c.category, EmailCategory::WorkAdmin);
    }

    #[tokio::test]
    async fn test_classify_garbage_degrades_to_defaults() {
        let p = processor(ScriptedClient::always("no json here at all"));
        let c = p.classify(&sample_message()).await.expect("classify");
        assert_eq!(c.category, EmailCategory::Other);
        assert_eq!(c.priority, EmailPriority::Normal);
    }

    #[tokio::test]
    async fn test_extract_action_items_drops_untitled() {
        let p = processor(ScriptedClient::always(
            r#"[{"title": "Pay invoice", "confidence": 0.9},
                {"title": "", "confidence": 0.9},
                {"description": "no title at all"}]"#,
        ));
        let items = p
            .extract_action_items(&sample_message())
            .await
            .expect("extract");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Pay invoice");
    }

    #[tokio::test]
    async fn test_extract_action_items_garbage_is_empty() {
        let p = processor(ScriptedClient::always("nothing to do here"));
        let items = p
            .extract_action_items(&sample_message())
            .await
            .expect("extract");
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_draft_reply_is_pending_review() {
        let p = processor(ScriptedClient::always(
            "Thanks for the reminder, payment is on its way.",
        ));
        let draft = p
            .draft_reply(&sample_message(), Some("brief"))
            .await
            .expect("draft");
        assert_eq!(draft.recipient, "billing@example.com");
        assert_eq!(draft.original_subject, "Invoice due Friday");
        assert!(draft.draft_body.contains("payment"));
        assert_eq!(draft.instructions.as_deref(), Some("brief"));
    }

    #[tokio::test]
    async fn test_extract_confidence_defaults_to_one() {
        let p = processor(ScriptedClient::always(r#"[{"title": "Reply"}]"#));
        let items = p
            .extract_action_items(&sample_message())
            .await
            .expect("extract");
        assert_eq!(items[0].confidence, 1.0);
    }
}

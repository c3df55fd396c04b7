//! Declarative per-message rules.
//!
//! Rules are condition lists evaluated against message fields. Matching is
//! case-insensitive. A failing rule never aborts processing; its error is
//! recorded on the outcome and evaluation continues with the next rule.

use std::path::Path;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::error::EmmaError;
use crate::models::Message;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// All conditions must hold for the rule to match.
    pub conditions: Vec<RuleCondition>,
    /// Labels applied to the processing outcome when the rule matches.
    #[serde(default)]
    pub labels: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

/// Result of running the rule set against one message.
#[derive(Debug, Clone, Default)]
pub struct RulesOutcome {
    pub rules_matched: Vec<String>,
    pub labels: Vec<String>,
    pub errors: Vec<String>,
}

/// Load rules from a JSON file. A missing file yields no rules; a
/// malformed one is a configuration error.
pub fn load_rules_from(path: &Path) -> Result<Vec<Rule>, EmmaError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| EmmaError::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

#[derive(Default)]
pub struct RulesEngine {
    rules: Vec<Rule>,
}

impl RulesEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn process_message(&self, message: &Message) -> RulesOutcome {
        let mut outcome = RulesOutcome::default();

        for rule in self.rules.iter().filter(|r| r.enabled) {
            match self.evaluate_rule(rule, message) {
                Ok(true) => {
                    outcome.rules_matched.push(rule.name.clone());
                    outcome.labels.extend(rule.labels.iter().cloned());
                }
                Ok(false) => {}
                Err(err) => {
                    log::warn!("Rule '{}' failed: {err}", rule.name);
                    outcome.errors.push(format!("rule '{}': {err}", rule.name));
                }
            }
        }

        outcome
    }

    fn evaluate_rule(&self, rule: &Rule, message: &Message) -> Result<bool, String> {
        for condition in &rule.conditions {
            if !evaluate_condition(condition, message)? {
                return Ok(false);
            }
        }
        Ok(!rule.conditions.is_empty())
    }
}

fn field_value(message: &Message, field: &str) -> Option<String> {
    match field {
        "from" | "from_addr" => Some(message.from_addr.clone()),
        "to" => Some(message.to_addrs.join(", ")),
        "cc" => Some(message.cc_addrs.join(", ")),
        "subject" => Some(message.subject.clone()),
        "body" => Some(message.body_text.clone()),
        "folder" => Some(message.folder.clone()),
        "source" => Some(message.source.clone()),
        // Sender domain, the part after '@' stripped of a closing '>'
        "domain" => message
            .from_addr
            .rsplit_once('@')
            .map(|(_, domain)| domain.trim_end_matches('>').to_string()),
        "has_attachments" => Some((!message.attachments.is_empty()).to_string()),
        _ => None,
    }
}

fn expected_str(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn evaluate_condition(condition: &RuleCondition, message: &Message) -> Result<bool, String> {
    let field = field_value(message, &condition.field);
    let operator = condition.operator.to_lowercase();

    // Existence checks apply before the missing-field bailout
    match operator.as_str() {
        "exists" => return Ok(field.is_some_and(|v| !v.is_empty())),
        "not_exists" => return Ok(!field.is_some_and(|v| !v.is_empty())),
        _ => {}
    }

    let Some(field) = field else {
        return Err(format!("unknown field '{}'", condition.field));
    };
    let field = field.to_lowercase();
    let expected = expected_str(&condition.value).to_lowercase();

    match operator.as_str() {
        "equals" => Ok(field == expected),
        "contains" => Ok(field.contains(&expected)),
        "starts_with" => Ok(field.starts_with(&expected)),
        "ends_with" => Ok(field.ends_with(&expected)),
        "matches" => {
            let re = RegexBuilder::new(&expected_str(&condition.value))
                .case_insensitive(true)
                .build()
                .map_err(|e| format!("bad pattern: {e}"))?;
            Ok(re.is_match(&field))
        }
        "in" => match &condition.value {
            serde_json::Value::Array(values) => Ok(values
                .iter()
                .any(|v| expected_str(v).to_lowercase() == field)),
            _ => Err("'in' expects an array value".to_string()),
        },
        "not_in" => match &condition.value {
            serde_json::Value::Array(values) => Ok(!values
                .iter()
                .any(|v| expected_str(v).to_lowercase() == field)),
            _ => Err("'not_in' expects an array value".to_string()),
        },
        other => Err(format!("unknown operator '{other}'")),
    }
}

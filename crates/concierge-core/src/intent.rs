//! LLM-based intent analysis
//!
//! Classifies a raw user message into domain(s) and, when it carries several
//! independent goals, decomposes it into dependency-linked sub-tasks. One
//! completion call with a fixed classification prompt; the response is
//! expected to contain a JSON object `{intent_type, domains, sub_tasks}`.
//!
//! The contract is fail-open-to-simplicity: any failure (transport error,
//! missing JSON, malformed fields) yields a single-intent fallback spanning
//! all domains. Ambiguity never blocks the user, it just forfeits
//! decomposition.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::api::{CompletionClient, CompletionConfig, PromptMessage};
use crate::types::{Domain, IntentAnalysis, IntentType, SubTask};

/// Configuration for the intent analyzer
#[derive(Debug, Clone)]
pub struct IntentConfig {
    /// Whether classification is enabled at all
    pub enabled: bool,
    /// Minimum message length (chars) before a completion call is attempted.
    /// Very short messages (greetings, "ok", etc.) skip the call.
    pub min_length: usize,
    /// Sampling temperature for the classification call
    pub temperature: f32,
    /// Token budget for the classification call
    pub max_tokens: u32,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_length: 10,
            temperature: 0.2,
            max_tokens: 1024,
        }
    }
}

/// Classifies user messages via a pluggable completion call
pub struct IntentAnalyzer {
    client: Arc<dyn CompletionClient>,
    config: IntentConfig,
}

impl IntentAnalyzer {
    pub fn new(client: Arc<dyn CompletionClient>, config: IntentConfig) -> Self {
        Self { client, config }
    }

    /// Classify a raw user message. Never fails: every error path collapses
    /// into `IntentAnalysis::fallback`.
    pub async fn analyze(&self, user_message: &str) -> IntentAnalysis {
        if !self.config.enabled || user_message.len() < self.config.min_length {
            debug!(
                "Intent analysis skipped (enabled={}, len={})",
                self.config.enabled,
                user_message.len()
            );
            return IntentAnalysis::fallback(user_message);
        }

        let messages = vec![
            PromptMessage::system(
                "You are an intent classification system. Output only valid JSON.",
            ),
            PromptMessage::user(classification_prompt(user_message)),
        ];
        let config = CompletionConfig {
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        match self.client.complete(&messages, &config).await {
            Ok(completion) => match parse_analysis(&completion.content, user_message) {
                Some(analysis) => {
                    debug!(
                        "Classified intent: type={:?}, domains={:?}, sub_tasks={}",
                        analysis.intent_type,
                        analysis.domains,
                        analysis.sub_tasks.len()
                    );
                    analysis
                }
                None => {
                    warn!("No usable JSON in classification response, using fallback");
                    IntentAnalysis::fallback(user_message)
                }
            },
            Err(e) => {
                warn!("Intent classification call failed, using fallback: {}", e);
                IntentAnalysis::fallback(user_message)
            }
        }
    }
}

/// The fixed classification prompt
fn classification_prompt(message: &str) -> String {
    format!(
        r#"Classify this user message. Respond with ONLY valid JSON, no explanation.

User message: {message}

JSON schema to follow:
{{
  "intent_type": "<single or multi>",
  "domains": ["<one or more of: communication, productivity, lifestyle, travel, general>"],
  "sub_tasks": [
    {{"id": 1, "description": "<what to do>", "domain": "<domain>", "depends_on": []}}
  ]
}}

Rules:
- intent_type is "multi" only when the message contains two or more genuinely independent goals
- domains must come from the fixed set: communication, productivity, lifestyle, travel, general
- sub_tasks is empty for single-intent messages
- depends_on lists the ids of sub-tasks whose output this one needs
- descriptions must be self-contained so each sub-task can run on its own

JSON:"#,
    )
}

/// Extract the first well-formed JSON object from a completion response,
/// tolerating surrounding prose and code fences.
fn extract_first_json_object(text: &str) -> Option<Value> {
    for (idx, _) in text.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&text[idx..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    None
}

/// Parse and validate the classifier's JSON. Returns `None` only when no
/// JSON object can be extracted at all; field-level problems are repaired
/// (dropped domains, defaulted sub-task domains, downgraded intent type).
fn parse_analysis(text: &str, raw_message: &str) -> Option<IntentAnalysis> {
    let value = extract_first_json_object(text)?;

    let mut intent_type = match value.get("intent_type").and_then(|v| v.as_str()) {
        Some("multi") => IntentType::Multi,
        _ => IntentType::Single,
    };

    // Unknown domains are dropped; an empty survivor list means "all"
    let mut domains: Vec<String> = value
        .get("domains")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|d| d.as_str())
                .filter_map(Domain::parse)
                .map(|d| d.to_string())
                .collect()
        })
        .unwrap_or_default();
    if domains.is_empty() {
        domains.push("all".to_string());
    }

    let mut sub_tasks: Vec<SubTask> = Vec::new();
    if let Some(raw_tasks) = value.get("sub_tasks").and_then(|v| v.as_array()) {
        for (index, raw) in raw_tasks.iter().enumerate() {
            let Some(description) = raw
                .get("description")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
            else {
                debug!("Dropping sub-task {} without a description", index);
                continue;
            };

            let id = raw
                .get("id")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
                .unwrap_or(index as u32 + 1);

            // Sub-task domains outside the taxonomy default to general
            let domain = raw
                .get("domain")
                .and_then(|v| v.as_str())
                .and_then(Domain::parse)
                .unwrap_or(Domain::General);

            let depends_on: BTreeSet<u32> = raw
                .get("depends_on")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|d| d.as_u64())
                        .map(|d| d as u32)
                        .collect()
                })
                .unwrap_or_default();

            sub_tasks.push(SubTask {
                id,
                description: description.to_string(),
                domain,
                depends_on,
            });
        }
    }

    // Multi-intent is only meaningful with at least two surviving sub-tasks
    if sub_tasks.len() < 2 {
        if intent_type == IntentType::Multi {
            debug!(
                "Downgrading multi intent with {} surviving sub-tasks to single",
                sub_tasks.len()
            );
        }
        intent_type = IntentType::Single;
        sub_tasks.clear();
    }
    if intent_type == IntentType::Single {
        sub_tasks.clear();
    }

    Some(IntentAnalysis {
        intent_type,
        domains,
        sub_tasks,
        raw_message: raw_message.to_string(),
    })
}

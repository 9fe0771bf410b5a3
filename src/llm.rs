//! LLM fallback classifier against an OpenAI-compatible chat endpoint.
//!
//! Used for messages the rule bank cannot classify with confidence. The
//! model is pinned to the same taxonomy as the rules and instructed to
//! reply with JSON only; the parser tolerates markdown fences and
//! surrounding prose.

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::Result;
use crate::models::Urgency;

/// Per-attempt timeout.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
/// Sleep between attempts, indexed by the attempt that just failed.
const RETRY_BACKOFF_SECS: [u64; 3] = [1, 2, 4];
const MAX_ATTEMPTS: usize = 3;

/// Body handed to the model is capped at this many characters.
pub const BODY_LIMIT: usize = 2_000;
const BODY_HEAD: usize = 1_500;
const BODY_TAIL: usize = 500;
const TRUNCATION_MARKER: &str = "\n[...truncated...]\n";

const SYSTEM_PROMPT: &str = "\
You are an email analysis assistant for a DoorDash Dasher account management platform.
Analyze the given email and classify it. Respond ONLY with valid JSON, no other text.

Categories and sub-categories:
- bgc: submitted, pending, clear, consider, identity_verified
- account: welcome, activation, deactivation, reactivation
- earnings: weekly_pay, direct_deposit, earnings_summary, tax_document
- operational: dash_opportunity, rating_update, policy_update, promotion
- warning: contract_violation, low_rating_warning
- unknown: unclassified

Urgency levels: critical, high, medium, low, info

JSON format:
{
  \"category\": \"string\",
  \"sub_category\": \"string\",
  \"summary\": \"1-2 sentence summary\",
  \"urgency\": \"string\",
  \"action_required\": true/false,
  \"confidence\": 0.0-1.0,
  \"key_details\": {\"any\": \"relevant details\"}
}";

/// Result of a successful LLM classification.
#[derive(Debug, Clone)]
pub struct LlmClassification {
    pub category: String,
    pub sub_category: String,
    pub summary: String,
    pub urgency: Urgency,
    pub action_required: bool,
    /// Model-reported confidence, clamped to [0, 1]; 0 when absent
    pub confidence: f32,
    pub key_details: Option<Value>,
    pub raw: Value,
}

pub struct LlmClassifier {
    client: Option<Client<OpenAIConfig>>,
    model: String,
}

impl LlmClassifier {
    /// Build from configuration. An empty API key disables the tier.
    pub fn from_config(config: &LlmConfig) -> Self {
        let client = if config.api_key.is_empty() {
            None
        } else {
            let openai_config = OpenAIConfig::new()
                .with_api_key(config.api_key.clone())
                .with_api_base(config.api_base.clone());
            Some(Client::with_config(openai_config))
        };

        Self {
            client,
            model: config.model.clone(),
        }
    }

    /// A classifier that never answers, for pipelines running rules-only.
    pub fn disabled() -> Self {
        Self {
            client: None,
            model: String::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Classify one message. Returns `Ok(None)` when the tier is disabled
    /// or all attempts failed; the pipeline then routes the message to the
    /// manual review queue.
    pub async fn classify(
        &self,
        subject: &str,
        sender: &str,
        body: &str,
    ) -> Result<Option<LlmClassification>> {
        let Some(client) = &self.client else {
            debug!("LLM tier disabled, skipping classification");
            return Ok(None);
        };

        let mut user_content = format!("Subject: {subject}\nFrom: {sender}\n");
        if !body.is_empty() {
            user_content.push_str("\nBody:\n");
            user_content.push_str(&smart_truncate(body));
        }

        for attempt in 1..=MAX_ATTEMPTS {
            match tokio::time::timeout(
                ATTEMPT_TIMEOUT,
                self.attempt(client, &user_content),
            )
            .await
            {
                Ok(Ok(result)) => return Ok(Some(result)),
                Ok(Err(e)) => {
                    warn!("LLM classification attempt {attempt}/{MAX_ATTEMPTS} failed: {e}");
                }
                Err(_) => {
                    warn!(
                        "LLM classification attempt {attempt}/{MAX_ATTEMPTS} timed out after {:?}",
                        ATTEMPT_TIMEOUT
                    );
                }
            }

            if attempt < MAX_ATTEMPTS {
                let backoff = RETRY_BACKOFF_SECS[attempt - 1];
                tokio::time::sleep(Duration::from_secs(backoff)).await;
            }
        }

        warn!("LLM classification exhausted {MAX_ATTEMPTS} attempts for subject: {subject}");
        Ok(None)
    }

    async fn attempt(
        &self,
        client: &Client<OpenAIConfig>,
        user_content: &str,
    ) -> Result<LlmClassification> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(SYSTEM_PROMPT)
                    .build()
                    .map_err(|e| crate::error::MonitorError::Llm(e.to_string()))?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user_content)
                    .build()
                    .map_err(|e| crate::error::MonitorError::Llm(e.to_string()))?
                    .into(),
            ])
            .temperature(0.1)
            .max_tokens(500u32)
            .build()
            .map_err(|e| crate::error::MonitorError::Llm(e.to_string()))?;

        let response = client
            .chat()
            .create(request)
            .await
            .map_err(|e| crate::error::MonitorError::Llm(e.to_string()))?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| {
                crate::error::MonitorError::LlmParse("empty completion".to_string())
            })?;

        parse_classification(&content)
    }
}

/// Cap a body at [`BODY_LIMIT`] characters: first 1500 + marker + last 500.
/// Bodies at or under the limit pass through unchanged.
pub fn smart_truncate(body: &str) -> String {
    let chars: Vec<char> = body.chars().collect();
    if chars.len() <= BODY_LIMIT {
        return body.to_string();
    }

    let head: String = chars[..BODY_HEAD].iter().collect();
    let tail: String = chars[chars.len() - BODY_TAIL..].iter().collect();
    format!("{head}{TRUNCATION_MARKER}{tail}")
}

/// Extract the first balanced `{…}` object from text that may wrap it in
/// markdown fences or prose.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_classification(content: &str) -> Result<LlmClassification> {
    let json_text = extract_json(content).ok_or_else(|| {
        crate::error::MonitorError::LlmParse(format!(
            "no JSON object in response: {}",
            content.chars().take(120).collect::<String>()
        ))
    })?;

    let raw: Value = serde_json::from_str(json_text)
        .map_err(|e| crate::error::MonitorError::LlmParse(e.to_string()))?;

    let str_field = |key: &str, default: &str| -> String {
        raw.get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    };

    let confidence = raw
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .clamp(0.0, 1.0) as f32;

    Ok(LlmClassification {
        category: str_field("category", "unknown"),
        sub_category: str_field("sub_category", "unclassified"),
        summary: str_field("summary", ""),
        urgency: Urgency::parse_lenient(
            raw.get("urgency").and_then(Value::as_str).unwrap_or(""),
        ),
        action_required: raw
            .get("action_required")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        confidence,
        key_details: raw.get("key_details").cloned(),
        raw,
    })
}

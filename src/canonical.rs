//! The canonical chat-completion vocabulary shared by every adapter.
//!
//! Requests arrive in this shape, adapters translate it to their vendor dialect,
//! and every vendor answer is translated back into [`CanonicalChatResponse`] (or a
//! stream of [`CanonicalChatChunk`]s) before it leaves the broker.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BrokerError, Result};

/// Outgoing model parameters, keyed by wire name.
pub type Params = Map<String, Value>;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<Value>),
}

impl MessageContent {
    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.trim().is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }

    /// Concatenated text of the content, ignoring non-text parts.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl CanonicalMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

/// Parameter fields are `Option<Option<_>>`: `None` when absent, `Some(None)`
/// for an explicit `null`, which still overrides a binding default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanonicalChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<CanonicalMessage>,
    #[serde(default, deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Option<f64>>,
    #[serde(default, deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<Option<f64>>,
    #[serde(default, deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub n: Option<Option<i64>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub stop: Option<Option<Value>>,
    #[serde(default, deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<Option<i64>>,
    #[serde(default, deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<Option<f64>>,
    #[serde(default, deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<Option<f64>>,
    #[serde(default, deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<Option<Map<String, Value>>>,
    #[serde(default, deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub user: Option<Option<String>>,
    #[serde(default, deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub tools: Option<Option<Vec<Value>>>,
    #[serde(default, deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Option<Value>>,
    #[serde(default, deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Option<Value>>,
    /// Unrecognized top-level fields, forwarded to the vendor as parameters.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanonicalCompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Option<f64>>,
    #[serde(default, deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<Option<f64>>,
    #[serde(default, deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub n: Option<Option<i64>>,
    #[serde(default, deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<Option<i64>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Recompute `total_tokens` when a vendor-reported total disagrees with the parts.
    #[must_use]
    pub fn reconciled(self) -> Self {
        let expected = self.prompt_tokens + self.completion_tokens;
        if self.total_tokens != expected {
            tracing::debug!(
                reported = self.total_tokens,
                expected,
                "vendor usage total mismatch, recomputing"
            );
        }
        Self {
            total_tokens: expected,
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalChatResponse {
    pub id: String,
    #[serde(default = "chat_completion_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub usage: Usage,
    #[serde(rename = "x-proxy-info", default, skip_serializing_if = "Option::is_none")]
    pub proxy_info: Option<Value>,
    /// Vendor fields outside the canonical shape (e.g. `system_fingerprint`).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn explicit_null<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn chat_completion_object() -> String {
    "chat.completion".to_string()
}

impl CanonicalChatResponse {
    /// Single-choice assistant response, the shape most dialects produce.
    pub fn single(
        id: impl Into<String>,
        model: impl Into<String>,
        content: Option<String>,
        finish_reason: Option<String>,
        usage: Usage,
    ) -> Self {
        Self {
            id: id.into(),
            object: chat_completion_object(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: Role::Assistant,
                    content,
                    tool_calls: None,
                },
                finish_reason,
            }],
            usage,
            proxy_info: None,
            extra: Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalChatChunk {
    pub id: String,
    #[serde(default = "chunk_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

fn chunk_object() -> String {
    "chat.completion.chunk".to_string()
}

impl CanonicalChatChunk {
    pub fn new(id: impl Into<String>, model: impl Into<String>, delta: ChunkDelta) -> Self {
        Self {
            id: id.into(),
            object: chunk_object(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: None,
            }],
            usage: None,
        }
    }

    #[must_use]
    pub fn with_finish_reason(mut self, reason: impl Into<String>) -> Self {
        if let Some(choice) = self.choices.first_mut() {
            choice.finish_reason = Some(reason.into());
        }
        self
    }

    #[must_use]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage.reconciled());
        self
    }
}

// ---------------------------------------------------------------------------
// Validation and policy
// ---------------------------------------------------------------------------

/// Check the invariants of a chat request before it is dispatched.
pub fn validate(request: &CanonicalChatRequest) -> Result<()> {
    if request.messages.is_empty() {
        return Err(BrokerError::validation("request is missing `messages`"));
    }

    for (i, msg) in request.messages.iter().enumerate() {
        if msg.role != Role::System && msg.content.is_empty() {
            return Err(BrokerError::validation(format!(
                "messages[{i}] ({}) has empty content",
                msg.role.as_str()
            )));
        }
    }

    check_sampling(
        request.temperature.flatten(),
        request.top_p.flatten(),
        request.n.flatten(),
        request.max_tokens.flatten(),
    )
}

/// Completion counterpart of [`validate`].
pub fn validate_completion(request: &CanonicalCompletionRequest) -> Result<()> {
    if request.prompt.trim().is_empty() {
        return Err(BrokerError::validation("request is missing `prompt`"));
    }

    check_sampling(
        request.temperature.flatten(),
        request.top_p.flatten(),
        request.n.flatten(),
        request.max_tokens.flatten(),
    )
}

fn check_sampling(
    temperature: Option<f64>,
    top_p: Option<f64>,
    n: Option<i64>,
    max_tokens: Option<i64>,
) -> Result<()> {
    if let Some(t) = temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(BrokerError::validation(format!(
                "temperature must be within [0, 2], got {t}"
            )));
        }
    }
    if let Some(p) = top_p {
        if !(0.0..=1.0).contains(&p) {
            return Err(BrokerError::validation(format!(
                "top_p must be within [0, 1], got {p}"
            )));
        }
    }
    if let Some(n) = n {
        if n < 1 {
            return Err(BrokerError::validation(format!("n must be >= 1, got {n}")));
        }
    }
    if let Some(max) = max_tokens {
        if max < 1 {
            return Err(BrokerError::validation(format!(
                "max_tokens must be >= 1, got {max}"
            )));
        }
    }
    Ok(())
}

/// Prepend `prompt` as a system message unless the conversation already has one.
pub fn inject_default_system_prompt(
    mut messages: Vec<CanonicalMessage>,
    prompt: &str,
) -> Vec<CanonicalMessage> {
    if messages.iter().any(|m| m.role == Role::System) {
        return messages;
    }
    messages.insert(0, CanonicalMessage::system(prompt));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chat(messages: Vec<CanonicalMessage>) -> CanonicalChatRequest {
        CanonicalChatRequest {
            model: Some("gpt-3.5-turbo".to_string()),
            messages,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_wire_request() {
        let req: CanonicalChatRequest = serde_json::from_value(json!({
            "model": "gpt-4",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [{"type": "text", "text": "hello"}]}
            ],
            "temperature": 0.3,
            "stop": ["\n"],
            "seed": 42
        }))
        .unwrap();

        assert_eq!(req.model.as_deref(), Some("gpt-4"));
        assert!(!req.stream);
        assert_eq!(req.messages[1].content.as_text(), "hello");
        assert_eq!(req.extra.get("seed"), Some(&json!(42)));
    }

    #[test]
    fn test_explicit_null_is_kept_apart_from_absent() {
        let req: CanonicalChatRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": null,
            "temperature": 0.2
        }))
        .unwrap();

        assert_eq!(req.max_tokens, Some(None));
        assert_eq!(req.temperature, Some(Some(0.2)));
        assert_eq!(req.top_p, None);
        assert!(validate(&req).is_ok());

        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back["max_tokens"], Value::Null);
        assert!(back.as_object().unwrap().contains_key("max_tokens"));
        assert!(!back.as_object().unwrap().contains_key("top_p"));
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let parsed = serde_json::from_value::<CanonicalChatRequest>(json!({
            "messages": [{"role": "wizard", "content": "hi"}]
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validate_ranges() {
        let ok = chat(vec![CanonicalMessage::user("hi")]);
        assert!(validate(&ok).is_ok());

        let mut hot = ok.clone();
        hot.temperature = Some(Some(2.5));
        assert!(matches!(validate(&hot), Err(BrokerError::Validation { .. })));

        let mut bad_top_p = ok.clone();
        bad_top_p.top_p = Some(Some(1.1));
        assert!(validate(&bad_top_p).is_err());

        let mut zero_n = ok.clone();
        zero_n.n = Some(Some(0));
        assert!(validate(&zero_n).is_err());

        let mut zero_max = ok;
        zero_max.max_tokens = Some(Some(0));
        assert!(validate(&zero_max).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_messages_and_content() {
        assert!(validate(&chat(vec![])).is_err());
        assert!(validate(&chat(vec![CanonicalMessage::user("  ")])).is_err());
        assert!(validate(&chat(vec![
            CanonicalMessage::system(""),
            CanonicalMessage::user("hi")
        ]))
        .is_ok());
    }

    #[test]
    fn test_validate_completion() {
        let mut req = CanonicalCompletionRequest {
            prompt: "Once upon a time".to_string(),
            ..Default::default()
        };
        assert!(validate_completion(&req).is_ok());

        req.prompt = "   ".to_string();
        assert!(validate_completion(&req).is_err());
    }

    #[test]
    fn test_inject_prepends_when_missing() {
        let messages = vec![CanonicalMessage::user("hi")];
        let injected = inject_default_system_prompt(messages, "You are helpful.");

        assert_eq!(injected.len(), 2);
        assert_eq!(injected[0], CanonicalMessage::system("You are helpful."));
        assert_eq!(injected[1], CanonicalMessage::user("hi"));
    }

    #[test]
    fn test_inject_is_idempotent() {
        let messages = vec![CanonicalMessage::user("a"), CanonicalMessage::user("b")];
        let once = inject_default_system_prompt(messages, "sys");
        let twice = inject_default_system_prompt(once.clone(), "sys");
        assert_eq!(once, twice);

        let existing = vec![CanonicalMessage::system("mine"), CanonicalMessage::user("a")];
        assert_eq!(
            inject_default_system_prompt(existing.clone(), "sys"),
            existing
        );
    }

    #[test]
    fn test_usage_reconciled() {
        let usage = Usage {
            prompt_tokens: 7,
            completion_tokens: 5,
            total_tokens: 99,
        }
        .reconciled();
        assert_eq!(usage.total_tokens, 12);
    }

    #[test]
    fn test_response_keeps_vendor_extras() {
        let resp: CanonicalChatResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            "system_fingerprint": "fp_1"
        }))
        .unwrap();

        assert_eq!(resp.usage, Usage::default());
        assert_eq!(resp.extra.get("system_fingerprint"), Some(&json!("fp_1")));

        let back = serde_json::to_value(&resp).unwrap();
        assert_eq!(back["system_fingerprint"], "fp_1");
        assert!(back.get("x-proxy-info").is_none());
    }
}

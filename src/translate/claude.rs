//! The Claude-style dialect (Anthropic Messages API).
//!
//! System turns are hoisted into the top-level `system` field, `max_tokens` is
//! mandatory on the wire, and responses carry a `content` block array with
//! `input_tokens` / `output_tokens` usage.

use eventsource_stream::Event;
use serde::Deserialize;
use serde_json::{json, Value};

use super::flatten_params;
use super::streaming::{parse_event, ChunkDecoder, Decoded};
use crate::canonical::{
    CanonicalChatChunk, CanonicalChatResponse, CanonicalMessage, ChunkDelta, MessageContent,
    Params, Role, Usage,
};
use crate::error::{BrokerError, Result};

pub const API_VERSION: &str = "2023-06-01";

/// Used when neither the caller nor the binding sets `max_tokens`.
pub const DEFAULT_MAX_TOKENS: u64 = 1000;

/// Build the `/messages` body.
pub fn request_body(
    model_name: &str,
    messages: &[CanonicalMessage],
    params: &Params,
    stream: bool,
) -> Value {
    let mut body = flatten_params(params);

    let system = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_text())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>();
    if !system.is_empty() {
        body.insert("system".to_string(), Value::String(system.join("\n\n")));
    }

    let turns: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            json!({
                "role": m.role.as_str(),
                "content": content_to_claude(&m.content),
            })
        })
        .collect();

    body.insert("model".to_string(), Value::String(model_name.to_string()));
    body.insert("messages".to_string(), Value::Array(turns));
    body.entry("max_tokens".to_string())
        .or_insert_with(|| Value::from(DEFAULT_MAX_TOKENS));

    if let Some(stop) = body.remove("stop") {
        let sequences = match stop {
            Value::String(s) => Value::Array(vec![Value::String(s)]),
            other => other,
        };
        body.insert("stop_sequences".to_string(), sequences);
    }

    if let Some(user) = body.remove("user") {
        body.insert("metadata".to_string(), json!({ "user_id": user }));
    }

    if let Some(Value::Array(tools)) = body.remove("tools") {
        let tools = tools.iter().map(tool_to_claude).collect();
        body.insert("tools".to_string(), Value::Array(tools));
    }

    if let Some(choice) = body.remove("tool_choice") {
        body.insert("tool_choice".to_string(), tool_choice_to_claude(&choice));
    }

    if stream {
        body.insert("stream".to_string(), Value::Bool(true));
    } else {
        body.remove("stream");
    }

    Value::Object(body)
}

fn content_to_claude(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Parts(parts) => Value::Array(parts.iter().map(part_to_claude).collect()),
    }
}

fn part_to_claude(part: &Value) -> Value {
    if part.get("type").and_then(Value::as_str) != Some("image_url") {
        return part.clone();
    }

    let url = part
        .pointer("/image_url/url")
        .and_then(Value::as_str)
        .unwrap_or_default();

    // data:image/png;base64,....
    if let Some((meta, data)) = url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
    {
        return json!({
            "type": "image",
            "source": {"type": "base64", "media_type": meta, "data": data},
        });
    }

    json!({
        "type": "image",
        "source": {"type": "url", "url": url},
    })
}

/// `{"type": "function", "function": {...}}` becomes `{name, description,
/// input_schema}`. Tools already in Claude shape pass through.
fn tool_to_claude(tool: &Value) -> Value {
    let Some(function) = tool.get("function") else {
        return tool.clone();
    };

    let mut out = serde_json::Map::new();
    out.insert(
        "name".to_string(),
        function.get("name").cloned().unwrap_or(Value::Null),
    );
    if let Some(description) = function.get("description") {
        out.insert("description".to_string(), description.clone());
    }
    out.insert(
        "input_schema".to_string(),
        function
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object"})),
    );
    Value::Object(out)
}

/// Claude has no "none" mode, so it maps to "auto" like the default.
fn tool_choice_to_claude(choice: &Value) -> Value {
    match choice {
        Value::String(mode) if mode == "required" => json!({"type": "any"}),
        Value::String(_) => json!({"type": "auto"}),
        Value::Object(obj) => match obj.get("function").and_then(|f| f.get("name")) {
            Some(name) => json!({"type": "tool", "name": name}),
            None => choice.clone(),
        },
        other => other.clone(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ClaudeResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Option<Vec<ContentBlock>>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<ClaudeUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
pub struct ClaudeUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl From<ClaudeUsage> for Usage {
    fn from(u: ClaudeUsage) -> Self {
        Usage::new(u.input_tokens, u.output_tokens)
    }
}

/// Map a Claude `stop_reason` onto the canonical `finish_reason`.
pub fn map_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        "tool_use" => "tool_calls".to_string(),
        other => other.to_string(),
    }
}

/// Translate a `/messages` response body into the canonical shape.
pub fn parse_response(body: &str, model_name: &str) -> Result<CanonicalChatResponse> {
    let resp: ClaudeResponse = serde_json::from_str(body).map_err(|e| {
        BrokerError::translation(format!("malformed Claude response: {e}"))
    })?;

    let blocks = resp
        .content
        .ok_or_else(|| BrokerError::translation("Claude response has no content array"))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": input.to_string()},
            })),
            ContentBlock::Other => {}
        }
    }

    let content = if text.is_empty() && !tool_calls.is_empty() {
        None
    } else {
        Some(text)
    };

    let mut out = CanonicalChatResponse::single(
        resp.id.unwrap_or_else(|| super::generated_id("claude")),
        resp.model.unwrap_or_else(|| model_name.to_string()),
        content,
        Some(
            resp.stop_reason
                .as_deref()
                .map_or_else(|| "stop".to_string(), map_stop_reason),
        ),
        resp.usage.unwrap_or_default().into(),
    );
    if !tool_calls.is_empty() {
        out.choices[0].message.tool_calls = Some(tool_calls);
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamPayload {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockStart {
        #[serde(default)]
        content_block: Value,
    },
    ContentBlockDelta {
        #[serde(default)]
        delta: Value,
    },
    MessageDelta {
        #[serde(default)]
        delta: Value,
        #[serde(default)]
        usage: Option<ClaudeUsage>,
    },
    MessageStop,
    Error {
        #[serde(default)]
        error: Value,
    },
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<ClaudeUsage>,
}

/// Decoder for the Messages API event stream.
#[derive(Debug)]
pub struct ClaudeChunkDecoder {
    id: String,
    model: String,
    input_tokens: u64,
    /// Index of the tool call currently being streamed.
    tool_index: Option<u64>,
    tool_calls: u64,
}

impl ClaudeChunkDecoder {
    pub fn new(model_name: &str) -> Self {
        Self {
            id: super::generated_id("claude"),
            model: model_name.to_string(),
            input_tokens: 0,
            tool_index: None,
            tool_calls: 0,
        }
    }

    fn chunk(&self, delta: ChunkDelta) -> CanonicalChatChunk {
        CanonicalChatChunk::new(self.id.clone(), self.model.clone(), delta)
    }

    fn tool_call_chunk(&self, call: Value) -> CanonicalChatChunk {
        self.chunk(ChunkDelta {
            tool_calls: Some(vec![call]),
            ..Default::default()
        })
    }

    fn start_block(&mut self, block: &Value) -> Vec<CanonicalChatChunk> {
        if block.get("type").and_then(Value::as_str) != Some("tool_use") {
            self.tool_index = None;
            return Vec::new();
        }

        let index = self.tool_calls;
        self.tool_calls += 1;
        self.tool_index = Some(index);
        vec![self.tool_call_chunk(json!({
            "index": index,
            "id": block.get("id").cloned().unwrap_or(Value::Null),
            "type": "function",
            "function": {
                "name": block.get("name").cloned().unwrap_or(Value::Null),
                "arguments": "",
            },
        }))]
    }

    fn block_delta(&self, delta: &Value) -> Vec<CanonicalChatChunk> {
        match delta.get("type").and_then(Value::as_str) {
            Some("input_json_delta") => {
                let (Some(index), Some(partial)) = (
                    self.tool_index,
                    delta.get("partial_json").and_then(Value::as_str),
                ) else {
                    return Vec::new();
                };
                vec![self.tool_call_chunk(json!({
                    "index": index,
                    "function": {"arguments": partial},
                }))]
            }
            _ => match delta.get("text").and_then(Value::as_str) {
                Some(text) => vec![self.chunk(ChunkDelta {
                    content: Some(text.to_string()),
                    ..Default::default()
                })],
                None => Vec::new(),
            },
        }
    }
}

impl ChunkDecoder for ClaudeChunkDecoder {
    fn decode(&mut self, event: &Event) -> Result<Decoded> {
        let payload: StreamPayload = parse_event(event)?;

        let chunks = match payload {
            StreamPayload::MessageStart { message } => {
                if let Some(id) = message.id {
                    self.id = id;
                }
                if let Some(model) = message.model {
                    self.model = model;
                }
                self.input_tokens = message.usage.unwrap_or_default().input_tokens;
                vec![self.chunk(ChunkDelta {
                    role: Some(Role::Assistant.as_str().to_string()),
                    ..Default::default()
                })]
            }
            StreamPayload::ContentBlockStart { content_block } => self.start_block(&content_block),
            StreamPayload::ContentBlockDelta { delta } => self.block_delta(&delta),
            StreamPayload::MessageDelta { delta, usage } => {
                let reason = delta
                    .get("stop_reason")
                    .and_then(Value::as_str)
                    .map_or_else(|| "stop".to_string(), map_stop_reason);
                let output_tokens = usage.unwrap_or_default().output_tokens;
                vec![self
                    .chunk(ChunkDelta::default())
                    .with_finish_reason(reason)
                    .with_usage(Usage::new(self.input_tokens, output_tokens))]
            }
            StreamPayload::MessageStop => return Ok(Decoded::Finished(Vec::new())),
            StreamPayload::Error { error } => {
                return Err(BrokerError::upstream(
                    200,
                    json!({ "error": error }).to_string(),
                ));
            }
            StreamPayload::Ignored => Vec::new(),
        };

        Ok(Decoded::Continue(chunks))
    }
}

//! The Qwen-style dialect (DashScope text-generation).
//!
//! Requests nest messages under `input` and sampling options under
//! `parameters`. Responses come back either as `output.text` or, with
//! `result_format = "message"`, as `output.choices[].message`.

use eventsource_stream::Event;
use serde::Deserialize;
use serde_json::{json, Value};

use super::flatten_params;
use super::streaming::{parse_event, ChunkDecoder, Decoded};
use crate::canonical::{
    CanonicalChatChunk, CanonicalChatResponse, CanonicalMessage, ChunkDelta, Params, Role, Usage,
};
use crate::error::{BrokerError, Result};

/// Header that switches DashScope into SSE mode.
pub const SSE_HEADER: &str = "X-DashScope-SSE";

/// Build the text-generation body.
pub fn request_body(
    model_name: &str,
    messages: &[CanonicalMessage],
    params: &Params,
    stream: bool,
) -> Result<Value> {
    let mut parameters = flatten_params(params);
    parameters.remove("stream");
    if stream {
        parameters.insert("incremental_output".to_string(), Value::Bool(true));
    }

    Ok(json!({
        "model": model_name,
        "input": {"messages": serde_json::to_value(messages)?},
        "parameters": parameters,
    }))
}

#[derive(Debug, Deserialize)]
pub struct QwenResponse {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub output: Option<QwenOutput>,
    #[serde(default)]
    pub usage: Option<QwenUsage>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QwenOutput {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub choices: Option<Vec<QwenChoice>>,
}

#[derive(Debug, Deserialize)]
pub struct QwenChoice {
    #[serde(default)]
    pub message: Option<QwenMessage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct QwenMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
pub struct QwenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl From<QwenUsage> for Usage {
    fn from(u: QwenUsage) -> Self {
        Usage::new(u.input_tokens, u.output_tokens)
    }
}

impl QwenOutput {
    /// Text and finish reason, whichever result format the vendor used.
    fn into_parts(self) -> (Option<String>, Option<String>) {
        if let Some(choice) = self.choices.and_then(|c| c.into_iter().next()) {
            let text = choice.message.and_then(|m| m.content);
            return (text, finish_reason(choice.finish_reason));
        }
        (self.text, finish_reason(self.finish_reason))
    }
}

/// DashScope reports an unfinished generation as the string `"null"`.
fn finish_reason(raw: Option<String>) -> Option<String> {
    raw.filter(|r| r != "null" && !r.is_empty())
}

/// Translate a text-generation response body into the canonical shape.
pub fn parse_response(body: &str, model_name: &str) -> Result<CanonicalChatResponse> {
    let resp: QwenResponse = serde_json::from_str(body)
        .map_err(|e| BrokerError::translation(format!("malformed Qwen response: {e}")))?;

    if resp.code.as_deref().is_some_and(|c| !c.is_empty()) && resp.output.is_none() {
        let detail = json!({
            "error": {"code": resp.code, "message": resp.message},
        });
        return Err(BrokerError::upstream(200, detail.to_string()));
    }

    let (text, finish) = resp.output.unwrap_or_default().into_parts();
    let text = text.ok_or_else(|| BrokerError::translation("Qwen response has no output text"))?;

    Ok(CanonicalChatResponse::single(
        resp.request_id
            .unwrap_or_else(|| super::generated_id("qwen")),
        model_name,
        Some(text),
        Some(finish.unwrap_or_else(|| "stop".to_string())),
        resp.usage.unwrap_or_default().into(),
    ))
}

/// Decoder for DashScope SSE streams.
///
/// DashScope sends no end marker; generation is over once an event carries a
/// finish reason.
#[derive(Debug)]
pub struct QwenChunkDecoder {
    model: String,
    started: bool,
}

impl QwenChunkDecoder {
    pub fn new(model_name: &str) -> Self {
        Self {
            model: model_name.to_string(),
            started: false,
        }
    }
}

impl ChunkDecoder for QwenChunkDecoder {
    fn decode(&mut self, event: &Event) -> Result<Decoded> {
        let resp: QwenResponse = parse_event(event)?;

        if resp.output.is_none() && resp.code.as_deref().is_some_and(|c| !c.is_empty()) {
            return Err(BrokerError::upstream(200, event.data.clone()));
        }

        let id = resp
            .request_id
            .unwrap_or_else(|| super::generated_id("qwen"));
        let (text, finish) = resp.output.unwrap_or_default().into_parts();

        let role = if self.started {
            None
        } else {
            self.started = true;
            Some(Role::Assistant.as_str().to_string())
        };

        let mut chunk = CanonicalChatChunk::new(
            id,
            self.model.clone(),
            ChunkDelta {
                role,
                content: text.filter(|t| !t.is_empty()),
                ..Default::default()
            },
        );

        match finish {
            Some(reason) => {
                chunk = chunk
                    .with_finish_reason(reason)
                    .with_usage(resp.usage.unwrap_or_default().into());
                Ok(Decoded::Finished(vec![chunk]))
            }
            None => Ok(Decoded::Continue(vec![chunk])),
        }
    }
}

//! The OpenAI-style dialect: flat request bodies, bearer auth, and responses that
//! already match the canonical chat shape.
//!
//! The legacy `/completions` endpoint answers with `choices[].text`; those
//! responses are folded into the chat shape so callers only ever see one.

use eventsource_stream::Event;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::flatten_params;
use super::streaming::{parse_event, ChunkDecoder, Decoded};
use crate::canonical::{
    CanonicalChatChunk, CanonicalChatResponse, CanonicalMessage, Choice, ChunkChoice, ChunkDelta,
    Params, ResponseMessage, Role, Usage,
};
use crate::error::{BrokerError, Result};

const STREAM_DONE: &str = "[DONE]";

/// Build the `/chat/completions` body.
pub fn chat_request_body(
    model_name: &str,
    messages: &[CanonicalMessage],
    params: &Params,
    stream: bool,
) -> Result<Value> {
    let mut body = flatten_params(params);
    body.insert("model".to_string(), Value::String(model_name.to_string()));
    body.insert("messages".to_string(), serde_json::to_value(messages)?);
    set_stream(&mut body, stream);
    Ok(Value::Object(body))
}

/// Build the legacy `/completions` body.
pub fn completion_request_body(
    model_name: &str,
    prompt: &str,
    params: &Params,
    stream: bool,
) -> Value {
    let mut body = flatten_params(params);
    body.insert("model".to_string(), Value::String(model_name.to_string()));
    body.insert("prompt".to_string(), Value::String(prompt.to_string()));
    set_stream(&mut body, stream);
    Value::Object(body)
}

fn set_stream(body: &mut Map<String, Value>, stream: bool) {
    if stream {
        body.insert("stream".to_string(), Value::Bool(true));
    } else {
        body.remove("stream");
    }
}

/// Parse a `/chat/completions` response body.
pub fn parse_chat_response(body: &str) -> Result<CanonicalChatResponse> {
    let mut resp: CanonicalChatResponse = serde_json::from_str(body).map_err(|e| {
        BrokerError::translation(format!("malformed chat completion response: {e}"))
    })?;

    if resp.choices.is_empty() {
        return Err(BrokerError::translation(
            "chat completion response has no choices",
        ));
    }

    resp.usage = resp.usage.reconciled();
    Ok(resp)
}

#[derive(Debug, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub model: Option<String>,
    pub choices: Vec<CompletionChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Parse a legacy `/completions` response into the canonical chat shape.
pub fn parse_completion_response(body: &str, model_name: &str) -> Result<CanonicalChatResponse> {
    let resp: CompletionResponse = serde_json::from_str(body).map_err(|e| {
        BrokerError::translation(format!("malformed completion response: {e}"))
    })?;

    if resp.choices.is_empty() {
        return Err(BrokerError::translation("completion response has no choices"));
    }

    let choices = resp
        .choices
        .into_iter()
        .map(|c| {
            let text = c.text.ok_or_else(|| {
                BrokerError::translation(format!("completion choice {} has no text", c.index))
            })?;
            Ok(Choice {
                index: c.index,
                message: ResponseMessage {
                    role: Role::Assistant,
                    content: Some(text),
                    tool_calls: None,
                },
                finish_reason: c.finish_reason,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CanonicalChatResponse {
        id: resp.id.unwrap_or_else(|| super::generated_id("cmpl")),
        object: "chat.completion".to_string(),
        created: resp
            .created
            .unwrap_or_else(|| chrono::Utc::now().timestamp()),
        model: resp.model.unwrap_or_else(|| model_name.to_string()),
        choices,
        usage: resp.usage.unwrap_or_default().reconciled(),
        proxy_info: None,
        extra: Map::new(),
    })
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

/// Decoder for OpenAI-style SSE streams (`data: {...}` ... `data: [DONE]`).
#[derive(Debug)]
pub struct OpenAiChunkDecoder {
    model_name: String,
    legacy_completions: bool,
}

impl OpenAiChunkDecoder {
    pub fn chat(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            legacy_completions: false,
        }
    }

    pub fn completions(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            legacy_completions: true,
        }
    }

    fn decode_completion_chunk(&self, event: &Event) -> Result<CanonicalChatChunk> {
        let chunk: CompletionChunk = parse_event(event)?;
        Ok(CanonicalChatChunk {
            id: chunk.id.unwrap_or_else(|| super::generated_id("cmpl")),
            object: "chat.completion.chunk".to_string(),
            created: chunk
                .created
                .unwrap_or_else(|| chrono::Utc::now().timestamp()),
            model: chunk.model.unwrap_or_else(|| self.model_name.clone()),
            choices: chunk
                .choices
                .into_iter()
                .map(|c| ChunkChoice {
                    index: c.index,
                    delta: ChunkDelta {
                        content: c.text,
                        ..Default::default()
                    },
                    finish_reason: c.finish_reason,
                })
                .collect(),
            usage: chunk.usage.map(Usage::reconciled),
        })
    }
}

impl ChunkDecoder for OpenAiChunkDecoder {
    fn decode(&mut self, event: &Event) -> Result<Decoded> {
        if event.data.trim() == STREAM_DONE {
            return Ok(Decoded::Finished(Vec::new()));
        }

        let raw: Value = parse_event(event)?;
        if raw.get("error").is_some() && raw.get("choices").is_none() {
            return Err(BrokerError::upstream(200, event.data.clone()));
        }

        let chunk = if self.legacy_completions {
            self.decode_completion_chunk(event)?
        } else {
            let mut chunk: CanonicalChatChunk = serde_json::from_value(raw).map_err(|e| {
                BrokerError::translation(format!("malformed chat completion chunk: {e}"))
            })?;
            chunk.usage = chunk.usage.map(Usage::reconciled);
            chunk
        };

        Ok(Decoded::Continue(vec![chunk]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn event(data: &str) -> Event {
        Event {
            data: data.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_chat_body_is_flat() {
        let body = chat_request_body(
            "gpt-4",
            &[CanonicalMessage::user("hi")],
            &params(json!({"temperature": 0.3, "extra_body": {"seed": 7}})),
            false,
        )
        .unwrap();

        assert_eq!(
            body,
            json!({
                "temperature": 0.3,
                "seed": 7,
                "model": "gpt-4",
                "messages": [{"role": "user", "content": "hi"}]
            })
        );
    }

    #[test]
    fn test_stream_flag_set_only_when_streaming() {
        let body = completion_request_body("davinci", "Say hi", &Params::new(), true);
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["prompt"], json!("Say hi"));
    }

    #[test]
    fn test_parse_chat_response_reconciles_usage() {
        let body = json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 10,
            "model": "gpt-4",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 11, "completion_tokens": 4, "total_tokens": 99}
        })
        .to_string();

        let resp = parse_chat_response(&body).unwrap();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("Hello"));
        assert_eq!(resp.usage, Usage::new(11, 4));
        assert_eq!(resp.usage.total_tokens, 15);
    }

    #[test]
    fn test_parse_chat_response_without_choices_is_translation_error() {
        let err = parse_chat_response(r#"{"id": "x", "choices": []}"#).unwrap_err();
        assert!(matches!(err, BrokerError::Translation { .. }));

        let err = parse_chat_response(r#"{"id": "x"}"#).unwrap_err();
        assert!(matches!(err, BrokerError::Translation { .. }));
    }

    #[test]
    fn test_parse_completion_response() {
        let body = json!({
            "id": "cmpl-1",
            "object": "text_completion",
            "created": 5,
            "model": "gpt-3.5-turbo-instruct",
            "choices": [{"text": "Hi there", "index": 0, "finish_reason": "length"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        })
        .to_string();

        let resp = parse_completion_response(&body, "fallback").unwrap();
        assert_eq!(resp.object, "chat.completion");
        assert_eq!(resp.choices[0].message.role, Role::Assistant);
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("Hi there"));
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("length"));
        assert_eq!(resp.usage.total_tokens, 5);
    }

    #[test]
    fn test_completion_usage_defaults_to_zero() {
        let resp =
            parse_completion_response(r#"{"choices": [{"text": "x"}]}"#, "instruct").unwrap();
        assert_eq!(resp.usage, Usage::default());
        assert_eq!(resp.model, "instruct");
    }

    #[test]
    fn test_chat_decoder() {
        let mut decoder = OpenAiChunkDecoder::chat("gpt-4");
        let decoded = decoder
            .decode(&event(
                r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#,
            ))
            .unwrap();
        match decoded {
            Decoded::Continue(chunks) => {
                assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("Hi"));
            }
            Decoded::Finished(_) => panic!("expected continue"),
        }

        assert!(matches!(
            decoder.decode(&event("[DONE]")).unwrap(),
            Decoded::Finished(_)
        ));
    }

    #[test]
    fn test_completion_decoder_maps_text_to_delta() {
        let mut decoder = OpenAiChunkDecoder::completions("instruct");
        let decoded = decoder
            .decode(&event(r#"{"id":"cmpl-1","choices":[{"text":"Once","index":0}]}"#))
            .unwrap();
        let Decoded::Continue(chunks) = decoded else {
            panic!("expected continue");
        };
        assert_eq!(chunks[0].object, "chat.completion.chunk");
        assert_eq!(chunks[0].model, "instruct");
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("Once"));
    }

    #[test]
    fn test_error_event_is_upstream_error() {
        let mut decoder = OpenAiChunkDecoder::chat("gpt-4");
        let err = decoder
            .decode(&event(r#"{"error":{"message":"overloaded"}}"#))
            .unwrap_err();
        assert!(matches!(err, BrokerError::Upstream { .. }));
    }
}

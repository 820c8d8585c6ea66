//! The request pipeline: resolve the model, merge and normalize parameters,
//! dispatch to the adapter, then stamp provenance or build the error envelope.

use std::pin::Pin;
use std::time::Instant;

use chrono::Utc;
use futures::{Stream, StreamExt};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapters::VendorAdapter;
use crate::canonical::{
    inject_default_system_prompt, validate, validate_completion, CanonicalChatChunk,
    CanonicalChatRequest, CanonicalChatResponse, CanonicalCompletionRequest, CanonicalMessage,
    Params,
};
use crate::config::ProxySettings;
use crate::error::{BrokerError, Result};
use crate::logging::{mask_api_key, RequestKind, RequestLog, RequestOutcome, RequestRecord};
use crate::snapshot::{BrokerSnapshot, SnapshotHandle};
use crate::translate::streaming::StreamEvent;

const ERROR_TYPE: &str = "proxy_error";

/// Pipeline position of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    ModelResolved,
    ParamsMerged,
    ParamsNormalized,
    Dispatched,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::ModelResolved => "model_resolved",
            Stage::ParamsMerged => "params_merged",
            Stage::ParamsNormalized => "params_normalized",
            Stage::Dispatched => "dispatched",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorProvenance {
    pub proxy_name: String,
    /// Seconds.
    pub processing_time: f64,
    pub timestamp: String,
    pub status: String,
}

/// The uniform failure body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
    #[serde(rename = "x-proxy-info")]
    pub proxy_info: ErrorProvenance,
}

impl ErrorEnvelope {
    pub fn new(err: &BrokerError, proxy_name: &str, started: Instant) -> Self {
        Self {
            error: ErrorBody {
                message: err.public_message(),
                kind: ERROR_TYPE.to_string(),
                code: err.code().to_string(),
            },
            proxy_info: ErrorProvenance {
                proxy_name: proxy_name.to_string(),
                processing_time: started.elapsed().as_secs_f64(),
                timestamp: Utc::now().to_rfc3339(),
                status: "error".to_string(),
            },
        }
    }
}

/// Provenance attached to successful responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub proxy_name: String,
    pub model_alias: String,
    pub processing_time: f64,
    pub timestamp: String,
}

/// A request that ended before a response was produced.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub envelope: ErrorEnvelope,
    pub status: u16,
    pub failed_at: Stage,
}

#[derive(Debug)]
pub enum ProxyOutcome {
    Completed(CanonicalChatResponse),
    Failed(Rejection),
}

/// One frame of a proxied stream.
#[derive(Debug)]
pub enum ProxyFrame {
    Chunk(CanonicalChatChunk),
    /// Terminal.
    Error(ErrorEnvelope),
    /// Terminal.
    Done,
}

pub type FrameStream = Pin<Box<dyn Stream<Item = ProxyFrame> + Send>>;

/// Public view of a configured model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub alias: String,
    pub provider: String,
    pub model_name: String,
    pub base_url: Option<String>,
    pub api_key_masked: String,
    pub default_params: Params,
}

enum Payload {
    Chat(Vec<CanonicalMessage>),
    Prompt(String),
}

#[derive(Debug, Clone)]
struct JobMeta {
    kind: RequestKind,
    stream: bool,
    request_size: usize,
    message_count: Option<usize>,
    prompt_length: Option<usize>,
}

/// A request broken into what the pipeline needs.
struct Job {
    meta: JobMeta,
    model: Option<String>,
    payload: Payload,
    /// Caller parameters, or the reason the request was refused on receipt.
    params: Result<Params>,
}

impl Job {
    fn chat(request: CanonicalChatRequest) -> Self {
        let params = validate(&request).and_then(|()| request_params(&request));
        Self {
            meta: JobMeta {
                kind: RequestKind::ChatCompletion,
                stream: request.stream,
                request_size: serialized_len(&request),
                message_count: Some(request.messages.len()),
                prompt_length: None,
            },
            model: request.model,
            payload: Payload::Chat(request.messages),
            params,
        }
    }

    fn completion(request: CanonicalCompletionRequest) -> Self {
        let params = validate_completion(&request).and_then(|()| request_params(&request));
        Self {
            meta: JobMeta {
                kind: RequestKind::TextCompletion,
                stream: request.stream,
                request_size: serialized_len(&request),
                message_count: None,
                prompt_length: Some(request.prompt.chars().count()),
            },
            model: request.model,
            payload: Payload::Prompt(request.prompt),
            params,
        }
    }
}

struct Prepared<'s> {
    alias: String,
    adapter: &'s dyn VendorAdapter,
    params: Params,
    payload: Payload,
}

struct Failure {
    error: BrokerError,
    stage: Stage,
    alias: String,
}

/// The orchestrator. Cheap to clone; every clone sees the same snapshot.
#[derive(Debug, Clone)]
pub struct LlmProxy {
    snapshot: SnapshotHandle,
    request_log: Option<RequestLog>,
}

impl LlmProxy {
    pub fn new(snapshot: SnapshotHandle) -> Self {
        Self {
            snapshot,
            request_log: None,
        }
    }

    pub fn with_request_log(mut self, log: RequestLog) -> Self {
        self.request_log = Some(log);
        self
    }

    pub fn snapshot(&self) -> &SnapshotHandle {
        &self.snapshot
    }

    pub fn request_log(&self) -> Option<&RequestLog> {
        self.request_log.as_ref()
    }

    pub async fn handle_chat(&self, request: CanonicalChatRequest) -> ProxyOutcome {
        self.complete(Job::chat(request)).await
    }

    pub async fn handle_completion(&self, request: CanonicalCompletionRequest) -> ProxyOutcome {
        self.complete(Job::completion(request)).await
    }

    pub async fn handle_chat_stream(
        &self,
        request: CanonicalChatRequest,
    ) -> std::result::Result<FrameStream, Rejection> {
        self.stream(Job::chat(request)).await
    }

    pub async fn handle_completion_stream(
        &self,
        request: CanonicalCompletionRequest,
    ) -> std::result::Result<FrameStream, Rejection> {
        self.stream(Job::completion(request)).await
    }

    /// Configured aliases in declaration order.
    pub fn available_models(&self) -> Vec<String> {
        self.snapshot.load().registry.list_aliases()
    }

    pub fn describe_models(&self) -> Vec<ModelInfo> {
        let snapshot = self.snapshot.load();
        snapshot
            .registry
            .list_aliases()
            .into_iter()
            .filter_map(|alias| {
                let binding = snapshot.registry.binding(&alias)?;
                Some(ModelInfo {
                    provider: binding.provider.clone(),
                    model_name: binding.model_name.clone(),
                    base_url: binding.base_url.clone(),
                    api_key_masked: mask_api_key(binding.api_key.expose_secret()),
                    default_params: binding.default_params.clone(),
                    alias,
                })
            })
            .collect()
    }

    async fn complete(&self, job: Job) -> ProxyOutcome {
        let started = Instant::now();
        let snapshot = self.snapshot.load();
        let meta = job.meta.clone();

        let prepared = match prepare(&snapshot, job) {
            Ok(prepared) => prepared,
            Err(failure) => {
                return ProxyOutcome::Failed(self.reject(&snapshot.settings, &meta, failure, started))
            }
        };

        let result = match &prepared.payload {
            Payload::Chat(messages) => {
                prepared
                    .adapter
                    .chat_completion(messages, &prepared.params)
                    .await
            }
            Payload::Prompt(prompt) => {
                prepared
                    .adapter
                    .text_completion(prompt, &prepared.params)
                    .await
            }
        };

        match result {
            Ok(mut response) => {
                attach_provenance(&mut response, &snapshot.settings.name, &prepared.alias, started);
                tracing::info!(
                    model = %prepared.alias,
                    vendor = %prepared.adapter.vendor(),
                    prompt_tokens = response.usage.prompt_tokens,
                    completion_tokens = response.usage.completion_tokens,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request completed"
                );
                self.record(&snapshot.settings, &meta, &prepared.alias, completed(started));
                ProxyOutcome::Completed(response)
            }
            Err(error) => ProxyOutcome::Failed(self.reject(
                &snapshot.settings,
                &meta,
                Failure {
                    error,
                    stage: Stage::Dispatched,
                    alias: prepared.alias,
                },
                started,
            )),
        }
    }

    async fn stream(&self, job: Job) -> std::result::Result<FrameStream, Rejection> {
        let started = Instant::now();
        let snapshot = self.snapshot.load();
        let meta = job.meta.clone();

        let prepared = prepare(&snapshot, job)
            .map_err(|failure| self.reject(&snapshot.settings, &meta, failure, started))?;

        let opened = match &prepared.payload {
            Payload::Chat(messages) => {
                prepared
                    .adapter
                    .chat_completion_stream(messages, &prepared.params)
                    .await
            }
            Payload::Prompt(prompt) => {
                prepared
                    .adapter
                    .text_completion_stream(prompt, &prepared.params)
                    .await
            }
        };

        let chunks = match opened {
            Ok(chunks) => chunks,
            Err(error) => {
                return Err(self.reject(
                    &snapshot.settings,
                    &meta,
                    Failure {
                        error,
                        stage: Stage::Dispatched,
                        alias: prepared.alias,
                    },
                    started,
                ))
            }
        };

        tracing::info!(
            model = %prepared.alias,
            vendor = %prepared.adapter.vendor(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "stream opened"
        );

        let proxy_name = snapshot.settings.name.clone();
        let alias = prepared.alias;
        let mut outcome = StreamRecord {
            log: self
                .request_log
                .clone()
                .filter(|_| snapshot.settings.enable_request_logging),
            meta,
            alias: alias.clone(),
            started,
            written: false,
        };
        Ok(Box::pin(chunks.map(move |event| match event {
            StreamEvent::Chunk(chunk) => ProxyFrame::Chunk(chunk),
            StreamEvent::Done => {
                outcome.finish(completed(started));
                ProxyFrame::Done
            }
            StreamEvent::Error(err) => {
                tracing::warn!(model = %alias, error = %err, "stream failed after start");
                outcome.finish(RequestOutcome::Failed {
                    code: err.code().to_string(),
                    stage: Stage::Dispatched.as_str().to_string(),
                });
                ProxyFrame::Error(ErrorEnvelope::new(&err, &proxy_name, started))
            }
        })))
    }

    fn reject(
        &self,
        settings: &ProxySettings,
        meta: &JobMeta,
        failure: Failure,
        started: Instant,
    ) -> Rejection {
        let Failure {
            error,
            stage,
            alias,
        } = failure;

        if matches!(error, BrokerError::Transport { .. } | BrokerError::Upstream { .. }) {
            tracing::error!(model = %alias, stage = %stage, error = %error, "request failed");
        } else {
            tracing::warn!(model = %alias, stage = %stage, error = %error, "request rejected");
        }

        self.record(
            settings,
            meta,
            &alias,
            RequestOutcome::Failed {
                code: error.code().to_string(),
                stage: stage.as_str().to_string(),
            },
        );

        Rejection {
            envelope: ErrorEnvelope::new(&error, &settings.name, started),
            status: error.http_status(),
            failed_at: stage,
        }
    }

    fn record(&self, settings: &ProxySettings, meta: &JobMeta, alias: &str, outcome: RequestOutcome) {
        if !settings.enable_request_logging {
            return;
        }
        if let Some(log) = &self.request_log {
            log.record(request_record(meta, alias, outcome));
        }
    }
}

/// Writes a stream's log record once, when its terminal frame passes. A
/// stream dropped before that is recorded as cancelled.
struct StreamRecord {
    log: Option<RequestLog>,
    meta: JobMeta,
    alias: String,
    started: Instant,
    written: bool,
}

impl StreamRecord {
    fn finish(&mut self, outcome: RequestOutcome) {
        if self.written {
            return;
        }
        self.written = true;
        if let Some(log) = &self.log {
            log.record(request_record(&self.meta, &self.alias, outcome));
        }
    }
}

impl Drop for StreamRecord {
    fn drop(&mut self) {
        if !self.written {
            tracing::debug!(
                model = %self.alias,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "stream dropped before completion"
            );
            self.finish(RequestOutcome::Failed {
                code: "cancelled".to_string(),
                stage: Stage::Dispatched.as_str().to_string(),
            });
        }
    }
}

fn request_record(meta: &JobMeta, alias: &str, outcome: RequestOutcome) -> RequestRecord {
    RequestRecord {
        timestamp: Utc::now(),
        request_type: meta.kind,
        model_alias: alias.to_string(),
        stream: meta.stream,
        request_size: meta.request_size,
        message_count: meta.message_count,
        prompt_length: meta.prompt_length,
        outcome,
    }
}

/// Walk a job through resolution, merging and normalization.
fn prepare(snapshot: &BrokerSnapshot, job: Job) -> std::result::Result<Prepared<'_>, Failure> {
    let settings = &snapshot.settings;
    let alias = extract_model(job.model.as_deref(), &settings.default_model);

    let caller_params = job.params.map_err(|error| Failure {
        error,
        stage: Stage::Received,
        alias: alias.clone(),
    })?;

    let adapter = snapshot.registry.resolve(&alias).map_err(|error| Failure {
        error,
        stage: Stage::ModelResolved,
        alias: alias.clone(),
    })?;

    let binding = adapter.binding();
    let merged = if settings.enable_parameter_injection {
        merge_parameters(&binding.default_params, caller_params)
    } else {
        caller_params
    };

    let vendor = adapter.vendor();
    let params = snapshot.normalizer.apply(&vendor, merged);
    tracing::debug!(
        model = %alias,
        vendor = %vendor,
        params = %serde_json::Value::Object(params.clone()),
        "parameters normalized"
    );

    let payload = match job.payload {
        Payload::Chat(messages) => Payload::Chat(
            match settings
                .default_system_prompt
                .as_deref()
                .filter(|p| !p.trim().is_empty())
            {
                Some(prompt) => inject_default_system_prompt(messages, prompt),
                None => messages,
            },
        ),
        prompt => prompt,
    };

    Ok(Prepared {
        alias,
        adapter,
        params,
        payload,
    })
}

/// The requested alias, or `fallback` when none (or a blank one) was given.
pub fn extract_model(requested: Option<&str>, fallback: &str) -> String {
    requested
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

/// Overlay caller parameters on binding defaults. The caller wins.
pub fn merge_parameters(defaults: &Params, overrides: Params) -> Params {
    let mut merged = defaults.clone();
    for (key, value) in overrides {
        merged.insert(key, value);
    }
    merged
}

/// Caller parameters of a request: every field except the routing and
/// payload ones.
pub fn request_params<T: Serialize>(request: &T) -> Result<Params> {
    match serde_json::to_value(request)? {
        Value::Object(mut map) => {
            for key in ["model", "messages", "prompt", "stream"] {
                map.remove(key);
            }
            Ok(map)
        }
        other => Err(BrokerError::validation(format!(
            "request must be a JSON object, got {other}"
        ))),
    }
}

/// Add provenance unless the vendor already supplied the field.
pub fn attach_provenance(
    response: &mut CanonicalChatResponse,
    proxy_name: &str,
    model_alias: &str,
    started: Instant,
) {
    if response.proxy_info.is_some() {
        return;
    }
    let provenance = Provenance {
        proxy_name: proxy_name.to_string(),
        model_alias: model_alias.to_string(),
        processing_time: started.elapsed().as_secs_f64(),
        timestamp: Utc::now().to_rfc3339(),
    };
    response.proxy_info = serde_json::to_value(provenance).ok();
}

fn completed(started: Instant) -> RequestOutcome {
    RequestOutcome::Completed {
        processing_ms: started.elapsed().as_millis() as u64,
    }
}

fn serialized_len<T: Serialize>(value: &T) -> usize {
    serde_json::to_vec(value).map_or(0, |bytes| bytes.len())
}

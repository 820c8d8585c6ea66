//! Vendor adapters: one per wire dialect, bound to a model alias at load time.
//!
//! An adapter owns the transport for its binding. The payload translation lives
//! in [`crate::translate`]; adapters add the URL, auth headers, timeout and
//! status handling around it.

pub mod claude;
pub mod openai;
pub mod qwen;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};

use crate::canonical::{CanonicalChatResponse, CanonicalMessage, Params};
use crate::config::ModelBinding;
use crate::error::{BrokerError, Result};
use crate::providers::{ProviderKind, VendorPreset};
use crate::translate::streaming::{decode_sse, ChunkDecoder, ChunkStream};

pub use claude::ClaudeAdapter;
pub use openai::OpenAiAdapter;
pub use qwen::QwenAdapter;

/// A backend that speaks one vendor dialect.
#[async_trait]
pub trait VendorAdapter: Send + Sync {
    fn dialect(&self) -> ProviderKind;

    /// The configuration this adapter was built from.
    fn binding(&self) -> &ModelBinding;

    /// Key used to look up the normalizer rule for this backend.
    fn vendor(&self) -> String {
        self.binding().vendor_key()
    }

    async fn chat_completion(
        &self,
        messages: &[CanonicalMessage],
        params: &Params,
    ) -> Result<CanonicalChatResponse>;

    /// Single-turn completion. Unless the dialect has a native endpoint the
    /// prompt is sent as one user message.
    async fn text_completion(&self, prompt: &str, params: &Params) -> Result<CanonicalChatResponse> {
        self.chat_completion(&[CanonicalMessage::user(prompt)], params)
            .await
    }

    /// Open a chunk stream. Failures before the first byte are returned as
    /// `Err`; later failures arrive as the stream's terminal error item.
    async fn chat_completion_stream(
        &self,
        messages: &[CanonicalMessage],
        params: &Params,
    ) -> Result<ChunkStream>;

    async fn text_completion_stream(&self, prompt: &str, params: &Params) -> Result<ChunkStream> {
        self.chat_completion_stream(&[CanonicalMessage::user(prompt)], params)
            .await
    }
}

/// State shared by every dialect: the binding, the resolved base URL and the
/// HTTP client.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    binding: Arc<ModelBinding>,
    base_url: String,
    client: Client,
    timeout: Duration,
}

impl AdapterContext {
    pub fn new(
        binding: Arc<ModelBinding>,
        preset: &VendorPreset,
        client: Client,
        timeout: Duration,
    ) -> Self {
        let base_url = binding
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or(preset.base_url)
            .trim_end_matches('/')
            .to_string();

        Self {
            binding,
            base_url,
            client,
            timeout,
        }
    }

    pub fn binding(&self) -> &ModelBinding {
        &self.binding
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model_name(&self) -> &str {
        &self.binding.model_name
    }

    pub(crate) fn post(&self, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(
            vendor = %self.binding.vendor_key(),
            model = %self.binding.model_name,
            url = %url,
            "dispatching upstream request"
        );
        self.client
            .post(url)
            .header("Content-Type", "application/json")
    }

    /// Send a non-streaming request and return the success body as text.
    pub(crate) async fn send_json(&self, request: RequestBuilder) -> Result<String> {
        let vendor = self.binding.vendor_key();

        let response = request.timeout(self.timeout).send().await.map_err(|e| {
            tracing::error!(vendor = %vendor, error = %e, "upstream request failed");
            BrokerError::from_reqwest(&e)
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            tracing::error!(vendor = %vendor, error = %e, "failed to read upstream body");
            BrokerError::from_reqwest(&e)
        })?;

        if !status.is_success() {
            tracing::warn!(
                vendor = %vendor,
                status = status.as_u16(),
                body = %truncate(&body, 300),
                "upstream returned error"
            );
            return Err(BrokerError::upstream(status.as_u16(), body));
        }

        tracing::debug!(vendor = %vendor, body_len = body.len(), "upstream response received");
        Ok(body)
    }

    /// Send a streaming request. Only the wait for response headers is bounded
    /// by the timeout; the body is consumed by the caller.
    pub(crate) async fn open_stream(&self, request: RequestBuilder) -> Result<Response> {
        let vendor = self.binding.vendor_key();

        let response = match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::error!(vendor = %vendor, error = %e, "streaming request failed");
                return Err(BrokerError::from_reqwest(&e));
            }
            Err(_) => {
                tracing::error!(vendor = %vendor, timeout = ?self.timeout, "streaming request timed out");
                return Err(BrokerError::transport("upstream request timed out"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = match tokio::time::timeout(self.timeout, response.text()).await {
                Ok(Ok(body)) => body,
                Ok(Err(e)) => {
                    tracing::warn!(vendor = %vendor, error = %e, "failed to read refused stream body");
                    String::new()
                }
                Err(_) => {
                    tracing::warn!(vendor = %vendor, timeout = ?self.timeout, "timed out reading refused stream body");
                    String::new()
                }
            };
            tracing::warn!(
                vendor = %vendor,
                status = status.as_u16(),
                body = %truncate(&body, 300),
                "upstream refused stream"
            );
            return Err(BrokerError::upstream(status.as_u16(), body));
        }

        Ok(response)
    }

    /// Decode an opened stream. Each event must arrive within the timeout.
    pub(crate) fn decode_stream<D: ChunkDecoder>(&self, response: Response, decoder: D) -> ChunkStream {
        decode_sse(
            response.bytes_stream(),
            decoder,
            &self.binding.vendor_key(),
            self.timeout,
        )
    }
}

/// Build the adapter for `binding`, failing on an unknown provider.
pub fn build_adapter(
    binding: Arc<ModelBinding>,
    client: &Client,
    timeout: Duration,
) -> Result<Box<dyn VendorAdapter>> {
    let preset = VendorPreset::from_name(&binding.provider).ok_or_else(|| {
        BrokerError::config(format!(
            "unknown provider '{}' (known: {})",
            binding.provider,
            VendorPreset::known_names()
        ))
    })?;

    let ctx = AdapterContext::new(binding, preset, client.clone(), timeout);
    let adapter: Box<dyn VendorAdapter> = match preset.dialect {
        ProviderKind::OpenAi => Box::new(OpenAiAdapter::new(ctx)),
        ProviderKind::Claude => Box::new(ClaudeAdapter::new(ctx)),
        ProviderKind::Qwen => Box::new(QwenAdapter::new(ctx)),
    };
    Ok(adapter)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

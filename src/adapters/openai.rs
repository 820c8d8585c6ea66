//! OpenAI-compatible backends (OpenAI itself and the preset vendors that clone
//! its API).

use async_trait::async_trait;
use secrecy::ExposeSecret;

use super::{AdapterContext, VendorAdapter};
use crate::canonical::{CanonicalChatResponse, CanonicalMessage, Params};
use crate::config::ModelBinding;
use crate::error::Result;
use crate::providers::ProviderKind;
use crate::translate::openai::{self as wire, OpenAiChunkDecoder};
use crate::translate::streaming::ChunkStream;

pub struct OpenAiAdapter {
    ctx: AdapterContext,
}

impl OpenAiAdapter {
    pub fn new(ctx: AdapterContext) -> Self {
        Self { ctx }
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        self.ctx.post(path).bearer_auth(self.ctx.binding().api_key.expose_secret())
    }
}

#[async_trait]
impl VendorAdapter for OpenAiAdapter {
    fn dialect(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn binding(&self) -> &ModelBinding {
        self.ctx.binding()
    }

    async fn chat_completion(
        &self,
        messages: &[CanonicalMessage],
        params: &Params,
    ) -> Result<CanonicalChatResponse> {
        let body = wire::chat_request_body(self.ctx.model_name(), messages, params, false)?;
        let text = self
            .ctx
            .send_json(self.request("/chat/completions").json(&body))
            .await?;
        wire::parse_chat_response(&text)
    }

    async fn text_completion(&self, prompt: &str, params: &Params) -> Result<CanonicalChatResponse> {
        let body = wire::completion_request_body(self.ctx.model_name(), prompt, params, false);
        let text = self
            .ctx
            .send_json(self.request("/completions").json(&body))
            .await?;
        wire::parse_completion_response(&text, self.ctx.model_name())
    }

    async fn chat_completion_stream(
        &self,
        messages: &[CanonicalMessage],
        params: &Params,
    ) -> Result<ChunkStream> {
        let body = wire::chat_request_body(self.ctx.model_name(), messages, params, true)?;
        let response = self
            .ctx
            .open_stream(self.request("/chat/completions").json(&body))
            .await?;
        Ok(self.ctx.decode_stream(response, OpenAiChunkDecoder::chat(self.ctx.model_name())))
    }

    async fn text_completion_stream(&self, prompt: &str, params: &Params) -> Result<ChunkStream> {
        let body = wire::completion_request_body(self.ctx.model_name(), prompt, params, true);
        let response = self
            .ctx
            .open_stream(self.request("/completions").json(&body))
            .await?;
        Ok(self.ctx.decode_stream(response, OpenAiChunkDecoder::completions(self.ctx.model_name())))
    }
}

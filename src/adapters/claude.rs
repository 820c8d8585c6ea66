//! Anthropic Messages API backends.

use async_trait::async_trait;
use secrecy::ExposeSecret;

use super::{AdapterContext, VendorAdapter};
use crate::canonical::{CanonicalChatResponse, CanonicalMessage, Params};
use crate::config::ModelBinding;
use crate::error::Result;
use crate::providers::ProviderKind;
use crate::translate::claude::{self as wire, ClaudeChunkDecoder, API_VERSION};
use crate::translate::streaming::ChunkStream;

pub struct ClaudeAdapter {
    ctx: AdapterContext,
}

impl ClaudeAdapter {
    pub fn new(ctx: AdapterContext) -> Self {
        Self { ctx }
    }

    fn request(&self) -> reqwest::RequestBuilder {
        self.ctx
            .post("/messages")
            .header("x-api-key", self.ctx.binding().api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
    }
}

#[async_trait]
impl VendorAdapter for ClaudeAdapter {
    fn dialect(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    fn binding(&self) -> &ModelBinding {
        self.ctx.binding()
    }

    async fn chat_completion(
        &self,
        messages: &[CanonicalMessage],
        params: &Params,
    ) -> Result<CanonicalChatResponse> {
        let body = wire::request_body(self.ctx.model_name(), messages, params, false);
        let text = self.ctx.send_json(self.request().json(&body)).await?;
        wire::parse_response(&text, self.ctx.model_name())
    }

    async fn chat_completion_stream(
        &self,
        messages: &[CanonicalMessage],
        params: &Params,
    ) -> Result<ChunkStream> {
        let body = wire::request_body(self.ctx.model_name(), messages, params, true);
        let response = self.ctx.open_stream(self.request().json(&body)).await?;
        Ok(self.ctx.decode_stream(response, ClaudeChunkDecoder::new(self.ctx.model_name())))
    }
}

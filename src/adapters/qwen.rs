//! DashScope (Qwen) backends.

use async_trait::async_trait;
use secrecy::ExposeSecret;

use super::{AdapterContext, VendorAdapter};
use crate::canonical::{CanonicalChatResponse, CanonicalMessage, Params};
use crate::config::ModelBinding;
use crate::error::Result;
use crate::providers::ProviderKind;
use crate::translate::qwen::{self as wire, QwenChunkDecoder, SSE_HEADER};
use crate::translate::streaming::ChunkStream;

const GENERATION_PATH: &str = "/services/aigc/text-generation/generation";

pub struct QwenAdapter {
    ctx: AdapterContext,
}

impl QwenAdapter {
    pub fn new(ctx: AdapterContext) -> Self {
        Self { ctx }
    }

    fn request(&self) -> reqwest::RequestBuilder {
        self.ctx
            .post(GENERATION_PATH)
            .bearer_auth(self.ctx.binding().api_key.expose_secret())
    }
}

#[async_trait]
impl VendorAdapter for QwenAdapter {
    fn dialect(&self) -> ProviderKind {
        ProviderKind::Qwen
    }

    fn binding(&self) -> &ModelBinding {
        self.ctx.binding()
    }

    async fn chat_completion(
        &self,
        messages: &[CanonicalMessage],
        params: &Params,
    ) -> Result<CanonicalChatResponse> {
        let body = wire::request_body(self.ctx.model_name(), messages, params, false)?;
        let text = self.ctx.send_json(self.request().json(&body)).await?;
        wire::parse_response(&text, self.ctx.model_name())
    }

    async fn chat_completion_stream(
        &self,
        messages: &[CanonicalMessage],
        params: &Params,
    ) -> Result<ChunkStream> {
        let body = wire::request_body(self.ctx.model_name(), messages, params, true)?;
        let request = self
            .request()
            .header(SSE_HEADER, "enable")
            .header("Accept", "text/event-stream")
            .json(&body);
        let response = self.ctx.open_stream(request).await?;
        Ok(self.ctx.decode_stream(response, QwenChunkDecoder::new(self.ctx.model_name())))
    }
}

//! HTTP client for the model gateway.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as ReqwestClient;
use std::time::Duration;
use tracing::debug;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::config::GatewayConfig;
use crate::domain::ports::model_gateway::{
    ChatMessage, ChunkStream, CompletionRequest, CompletionResponse, ModelGateway, ModelInfo,
};

use super::rate_limiter::TokenBucketRateLimiter;
use super::streaming::chunk_stream;
use super::types::{ChatCompletionRequest, ChatCompletionResponse, ModelListResponse};
use crate::infrastructure::logging::redact;

/// Production gateway client: connection pooling, token-bucket rate
/// limiting, status mapping into the error taxonomy, SSE streaming.
pub struct HttpModelGateway {
    http: ReqwestClient,
    base_url: String,
    api_key: String,
    rate_limiter: TokenBucketRateLimiter,
}

impl HttpModelGateway {
    pub fn new(config: &GatewayConfig) -> CoreResult<Self> {
        let http = ReqwestClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(10)
            .tcp_nodelay(true)
            .build()
            .map_err(|err| CoreError::Internal(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            rate_limiter: TokenBucketRateLimiter::new(config.rate_limit_rps),
        })
    }

    fn completion_body(request: &CompletionRequest, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: request.model_id.clone(),
            messages: request.messages.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
        }
    }

    async fn post_completion(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> CoreResult<reqwest::Response> {
        self.rate_limiter.acquire().await;

        let mut builder = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&Self::completion_body(request, stream));
        if let Some(timeout_ms) = request.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }

        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            let mut err = CoreError::from_status(status.as_u16(), redact(&body));
            if let CoreError::RateLimit { retry_after_ms: slot, .. } = &mut err {
                *slot = retry_after_ms;
            }
            return Err(err);
        }
        Ok(response)
    }
}

fn map_transport_error(err: reqwest::Error) -> CoreError {
    if err.is_timeout() {
        CoreError::TransientUpstream {
            message: "gateway deadline exceeded".to_string(),
            status: Some(408),
        }
    } else if err.is_connect() {
        CoreError::TransientUpstream {
            message: format!("gateway connection failed: {err}"),
            status: None,
        }
    } else {
        CoreError::Internal(format!("gateway request failed: {err}"))
    }
}

#[async_trait]
impl ModelGateway for HttpModelGateway {
    async fn list_models(&self) -> CoreResult<Vec<ModelInfo>> {
        let response = self
            .http
            .get(format!("{}/v1/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::from_status(status.as_u16(), redact(&body)));
        }

        let list: ModelListResponse = response
            .json()
            .await
            .map_err(|err| CoreError::Internal(format!("unparseable model catalog: {err}")))?;
        let models: Vec<ModelInfo> = list.data.into_iter().map(Into::into).collect();
        debug!(count = models.len(), "model catalog fetched");
        Ok(models)
    }

    async fn complete(&self, request: CompletionRequest) -> CoreResult<CompletionResponse> {
        let response = self.post_completion(&request, false).await?;
        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| CoreError::Internal(format!("unparseable completion: {err}")))?;

        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| CoreError::Internal("completion had no choices".into()))?;
        Ok(CompletionResponse {
            model_id: request.model_id,
            content,
            tokens_used: parsed.usage.map_or(0, |u| u.total_tokens),
        })
    }

    async fn complete_stream(&self, request: CompletionRequest) -> CoreResult<ChunkStream> {
        let response = self.post_completion(&request, true).await?;
        Ok(chunk_stream(response.bytes_stream()).boxed())
    }

    async fn health_check(&self) -> CoreResult<bool> {
        let probe = CompletionRequest::new(
            "openrouter/auto",
            vec![ChatMessage::user("ping")],
        )
        .with_max_tokens(1);

        match self.complete(probe).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_retryable() => Err(err),
            Err(_) => Ok(false),
        }
    }
}

//! Provider gateway for OpenRouter chat completions.

pub mod error;
pub mod openrouter;
pub mod types;
pub mod usage;

use std::sync::Arc;

use openrouter::{ChatProvider, OpenRouterAdapter};
use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{CallStatus, NoopUsageSink, StderrUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Routes chat requests to a provider and records each call.
///
/// Makes exactly one provider call per request. Retries are the caller's
/// decision, see [`crate::annotate::TransientRetry`].
pub struct ProviderGateway<U: UsageSinkTrait, P: ChatProvider = OpenRouterAdapter> {
    provider: P,
    usage_sink: Arc<U>,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait, P: ChatProvider> ChatGateway for ProviderGateway<U, P> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U, OpenRouterAdapter> {
    pub fn from_env(usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let openrouter = OpenRouterAdapter::from_env()?;
        Ok(Self::new(openrouter, usage_sink))
    }
}

impl<U: UsageSinkTrait, P: ChatProvider> ProviderGateway<U, P> {
    pub fn new(provider: P, usage_sink: Arc<U>) -> Self {
        Self {
            provider,
            usage_sink,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let result = self.provider.chat(&req).await;
        match &result {
            Ok(resp) => self.record_usage(&req, resp, None).await,
            Err(err) => {
                self.record_usage(&req, &ChatResponse::empty(), Some(err))
                    .await
            }
        }
        result
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: &ChatResponse,
        error: Option<&ProviderError>,
    ) {
        let record = ProviderCallRecord::new(
            req.model.provider(),
            req.model.model_id(),
            req.attribution.caller,
        )
        .tokens(resp.input_tokens, resp.output_tokens)
        .cost(resp.cost_nanodollars)
        .run(req.attribution.run_id)
        .batch(req.attribution.batch_index)
        .latency(resp.latency.as_millis() as u64);

        let record = match error {
            Some(err) => record
                .error(err.code())
                .request_id(err.request_id().map(str::to_string)),
            None => record,
        };

        self.usage_sink.record(record).await;
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::backends::{HttpAdapter, LoopbackAdapter};
use crate::error::{BackendError, Result};
use crate::models::{BackendConfig, OperationOutput, OperationType, ProcessingRequest, ProviderKind, TokenUsage};
use crate::platform::credentials;

pub type AdapterResult = std::result::Result<AdapterResponse, BackendError>;

/// Uniform interface every third-party backend implements.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    async fn initialize(&self) -> std::result::Result<(), BackendError> {
        Ok(())
    }

    async fn classify(&self, request: &AdapterRequest) -> AdapterResult;
    async fn generate(&self, request: &AdapterRequest) -> AdapterResult;
    async fn analyze_sentiment(&self, request: &AdapterRequest) -> AdapterResult;
    async fn extract_entities(&self, request: &AdapterRequest) -> AdapterResult;
    async fn detect_language(&self, request: &AdapterRequest) -> AdapterResult;
    async fn translate(&self, request: &AdapterRequest) -> AdapterResult;
    async fn summarize(&self, request: &AdapterRequest) -> AdapterResult;
    async fn moderate(&self, request: &AdapterRequest) -> AdapterResult;

    async fn health_check(&self) -> bool;

    fn adapter_name(&self) -> &str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterRequest {
    pub request_id: String,
    pub operation: OperationType,
    pub model: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl AdapterRequest {
    pub fn for_model(request: &ProcessingRequest, model: &str) -> Self {
        Self {
            request_id: request.id.clone(),
            operation: request.operation,
            model: model.to_string(),
            text: request.input.text.clone(),
            context: request.input.context.clone(),
            max_output_tokens: request.options.max_output_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterResponse {
    pub output: OperationOutput,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl AdapterResponse {
    pub fn new(output: OperationOutput) -> Self {
        Self { output, usage: None }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

pub async fn invoke_operation(adapter: &dyn BackendAdapter, request: &AdapterRequest) -> AdapterResult {
    match request.operation {
        OperationType::Classify => adapter.classify(request).await,
        OperationType::Generate => adapter.generate(request).await,
        OperationType::AnalyzeSentiment => adapter.analyze_sentiment(request).await,
        OperationType::ExtractEntities => adapter.extract_entities(request).await,
        OperationType::DetectLanguage => adapter.detect_language(request).await,
        OperationType::Translate => adapter.translate(request).await,
        OperationType::Summarize => adapter.summarize(request).await,
        OperationType::Moderate => adapter.moderate(request).await,
    }
}

pub trait AdapterFactory: Send + Sync {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn BackendAdapter>>;
}

#[derive(Debug, Clone)]
pub struct DefaultAdapterFactory {
    pub http_timeout: Duration,
}

impl Default for DefaultAdapterFactory {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(60),
        }
    }
}

impl AdapterFactory for DefaultAdapterFactory {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn BackendAdapter>> {
        match config.provider {
            ProviderKind::Loopback => {
                debug!("Creating loopback adapter for backend '{}'", config.id);
                Ok(Arc::new(LoopbackAdapter::new(config.id.clone())))
            }
            _ => {
                let secret = credentials::resolve(&config.credential)?;
                let adapter = HttpAdapter::new(config, secret, self.http_timeout)?;
                debug!("Creating HTTP adapter for backend '{}' ({:?})", config.id, config.provider);
                Ok(Arc::new(adapter))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::capability::Capability;

    #[tokio::test]
    async fn test_invoke_routes_by_operation() {
        let adapter = LoopbackAdapter::new("loop");
        for op in OperationType::ALL {
            let request = AdapterRequest::for_model(
                &ProcessingRequest::new(op, "The weather in Paris is lovely today."),
                "echo",
            );
            let response = invoke_operation(&adapter, &request).await.unwrap();
            assert_eq!(response.output.operation(), op);
        }
    }

    #[test]
    fn test_default_factory_builds_loopback() {
        let factory = DefaultAdapterFactory::default();
        let config = BackendConfig::new("local", ProviderKind::Loopback, [Capability::Generation]);
        let adapter = factory.create(&config).unwrap();
        assert_eq!(adapter.adapter_name(), "local");
    }

    #[test]
    fn test_default_factory_builds_http() {
        let factory = DefaultAdapterFactory::default();
        let config = BackendConfig::new("remote", ProviderKind::Custom, [Capability::Generation])
            .with_endpoint("http://127.0.0.1:9/api");
        let adapter = factory.create(&config).unwrap();
        assert_eq!(adapter.adapter_name(), "remote");
    }

    #[test]
    fn test_adapter_request_copies_request_fields() {
        let request = ProcessingRequest::new(OperationType::Translate, "hola")
            .with_context(serde_json::json!({"target_language": "en"}))
            .with_max_output_tokens(32);
        let call = AdapterRequest::for_model(&request, "nmt-1");
        assert_eq!(call.request_id, request.id);
        assert_eq!(call.model, "nmt-1");
        assert_eq!(call.max_output_tokens, Some(32));
        assert!(call.context.is_some());
    }
}

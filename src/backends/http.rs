use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error};
use url::Url;

use crate::backends::adapter::{AdapterRequest, AdapterResponse, AdapterResult, BackendAdapter};
use crate::backends::circuit_breaker::CircuitBreaker;
use crate::error::{BackendError, Error, Result};
use crate::models::{BackendConfig, OperationOutput, OperationType, ProviderKind, TokenUsage};

const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_RECOVERY: Duration = Duration::from_secs(30);

/// Adapter speaking the router's generic JSON contract over HTTP.
///
/// `POST {endpoint}/v1/{operation}` with an [`OperationCall`] body, answered by
/// an [`OperationReply`]; `GET {endpoint}/health` for the probe. Only the
/// authentication style differs between provider kinds.
pub struct HttpAdapter {
    backend_id: String,
    provider: ProviderKind,
    client: Client,
    base_url: Url,
    secret: Option<String>,
    circuit_breaker: CircuitBreaker,
}

#[derive(Debug, Serialize)]
struct OperationCall<'a> {
    request_id: &'a str,
    model: &'a str,
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OperationReply {
    output: OperationOutput,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

impl HttpAdapter {
    pub fn new(config: &BackendConfig, secret: Option<String>, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(&config.endpoint).map_err(|e| {
            Error::configuration(format!("backend '{}' endpoint: {}", config.id, e))
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            backend_id: config.id.clone(),
            provider: config.provider,
            client,
            base_url,
            secret,
            circuit_breaker: CircuitBreaker::new(config.id.clone(), BREAKER_FAILURE_THRESHOLD, BREAKER_RECOVERY),
        })
    }

    fn url(&self, path: &str) -> std::result::Result<Url, BackendError> {
        self.base_url
            .join(path)
            .map_err(|e| BackendError::transport(format!("invalid request path '{}': {}", path, e)))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let Some(secret) = self.secret.as_deref() else {
            return builder;
        };
        match self.provider {
            ProviderKind::Anthropic => builder
                .header("x-api-key", secret)
                .header("anthropic-version", "2023-06-01"),
            ProviderKind::AzureOpenAi => builder.header("api-key", secret),
            ProviderKind::Gemini => builder.query(&[("key", secret)]),
            _ => builder.bearer_auth(secret),
        }
    }

    async fn send(&self, operation: OperationType, request: &AdapterRequest) -> AdapterResult {
        let url = self.url(&format!("v1/{}", operation.as_str()))?;
        let body = OperationCall {
            request_id: &request.request_id,
            model: &request.model,
            input: &request.text,
            context: request.context.as_ref(),
            max_output_tokens: request.max_output_tokens,
        };

        debug!(
            "Sending {} to backend '{}': model={}, request={}",
            operation, self.backend_id, request.model, request.request_id
        );
        let start_time = Instant::now();

        let response = self
            .authorize(self.client.post(url).json(&body))
            .send()
            .await
            .map_err(BackendError::from)?;

        debug!("Backend '{}' answered in {:?}", self.backend_id, start_time.elapsed());

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            error!("Backend '{}' API error: {} - {}", self.backend_id, status, message);
            return Err(BackendError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let reply: OperationReply = response
            .json()
            .await
            .map_err(|e| BackendError::invalid_response(format!("Failed to parse response: {}", e)))?;

        Ok(AdapterResponse {
            output: reply.output,
            usage: reply.usage,
        })
    }

    async fn execute(&self, operation: OperationType, request: &AdapterRequest) -> AdapterResult {
        self.circuit_breaker
            .call(|| async { self.send(operation, request).await })
            .await
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }
}

impl fmt::Debug for HttpAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAdapter")
            .field("backend_id", &self.backend_id)
            .field("provider", &self.provider)
            .field("base_url", &self.base_url.as_str())
            .field("authenticated", &self.secret.is_some())
            .finish()
    }
}

#[async_trait]
impl BackendAdapter for HttpAdapter {
    async fn initialize(&self) -> std::result::Result<(), BackendError> {
        if self.health_check().await {
            Ok(())
        } else {
            Err(BackendError::unavailable(format!("{} did not pass its health probe", self.base_url)))
        }
    }

    async fn classify(&self, request: &AdapterRequest) -> AdapterResult {
        self.execute(OperationType::Classify, request).await
    }

    async fn generate(&self, request: &AdapterRequest) -> AdapterResult {
        self.execute(OperationType::Generate, request).await
    }

    async fn analyze_sentiment(&self, request: &AdapterRequest) -> AdapterResult {
        self.execute(OperationType::AnalyzeSentiment, request).await
    }

    async fn extract_entities(&self, request: &AdapterRequest) -> AdapterResult {
        self.execute(OperationType::ExtractEntities, request).await
    }

    async fn detect_language(&self, request: &AdapterRequest) -> AdapterResult {
        self.execute(OperationType::DetectLanguage, request).await
    }

    async fn translate(&self, request: &AdapterRequest) -> AdapterResult {
        self.execute(OperationType::Translate, request).await
    }

    async fn summarize(&self, request: &AdapterRequest) -> AdapterResult {
        self.execute(OperationType::Summarize, request).await
    }

    async fn moderate(&self, request: &AdapterRequest) -> AdapterResult {
        self.execute(OperationType::Moderate, request).await
    }

    async fn health_check(&self) -> bool {
        let url = match self.url("health") {
            Ok(url) => url,
            Err(_) => return false,
        };

        match self.authorize(self.client.get(url)).send().await {
            Ok(response) if response.status().is_success() => {
                self.circuit_breaker.reset();
                true
            }
            Ok(response) => {
                debug!("Health probe for '{}' returned {}", self.backend_id, response.status());
                false
            }
            Err(e) => {
                debug!("Health probe for '{}' failed: {}", self.backend_id, e);
                false
            }
        }
    }

    fn adapter_name(&self) -> &str {
        &self.backend_id
    }
}

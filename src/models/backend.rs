use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use validator::{Validate, ValidationError};

use crate::error::{Error, Result};
use crate::routing::capability::Capability;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    Cohere,
    HuggingFace,
    AzureOpenAi,
    Custom,
    Loopback,
}

impl ProviderKind {
    pub fn requires_endpoint(&self) -> bool {
        !matches!(self, ProviderKind::Loopback)
    }
}

/// Opaque handle naming where a backend's secret lives.
///
/// Accepted forms are `env:VAR_NAME`, `keyring:service/account` and `none`.
/// The handle is never printed; `Debug` is redacted.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct CredentialRef(String);

#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSource {
    None,
    Env(String),
    Keyring { service: String, account: String },
}

impl CredentialRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn none() -> Self {
        Self("none".to_string())
    }

    pub fn source(&self) -> Result<CredentialSource> {
        let raw = self.0.trim();
        if raw.is_empty() || raw == "none" {
            return Ok(CredentialSource::None);
        }
        if let Some(var) = raw.strip_prefix("env:") {
            if var.is_empty() {
                return Err(Error::credential("empty environment variable name"));
            }
            return Ok(CredentialSource::Env(var.to_string()));
        }
        if let Some(rest) = raw.strip_prefix("keyring:") {
            return match rest.split_once('/') {
                Some((service, account)) if !service.is_empty() && !account.is_empty() => {
                    Ok(CredentialSource::Keyring {
                        service: service.to_string(),
                        account: account.to_string(),
                    })
                }
                _ => Err(Error::credential("keyring reference must be keyring:service/account")),
            };
        }
        Err(Error::credential("unrecognized credential reference scheme"))
    }
}

impl fmt::Debug for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialRef(<redacted>)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct ModelSpec {
    #[validate(length(min = 1, message = "model name must not be empty"))]
    pub name: String,
    pub capabilities: BTreeSet<Capability>,
    #[validate(custom(function = "validate_price"))]
    pub cost_per_1k_input: Decimal,
    #[validate(custom(function = "validate_price"))]
    pub cost_per_1k_output: Decimal,
    pub avg_latency_ms: u64,
    #[validate(custom(function = "validate_quality"))]
    pub quality_score: f64,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.into_iter().collect(),
            cost_per_1k_input: Decimal::ZERO,
            cost_per_1k_output: Decimal::ZERO,
            avg_latency_ms: 1000,
            quality_score: 50.0,
            active: true,
        }
    }

    pub fn with_pricing(mut self, input: Decimal, output: Decimal) -> Self {
        self.cost_per_1k_input = input;
        self.cost_per_1k_output = output;
        self
    }

    pub fn with_latency(mut self, avg_latency_ms: u64) -> Self {
        self.avg_latency_ms = avg_latency_ms;
        self
    }

    pub fn with_quality(mut self, quality_score: f64) -> Self {
        self.quality_score = quality_score;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Saturates at `Decimal::MAX` for absurd prices.
    pub fn cost_for(&self, input_tokens: u32, output_tokens: u32) -> Decimal {
        let part = |tokens: u32, price: Decimal| {
            (Decimal::from(tokens) / Decimal::ONE_THOUSAND)
                .checked_mul(price)
                .unwrap_or(Decimal::MAX)
        };
        part(input_tokens, self.cost_per_1k_input)
            .checked_add(part(output_tokens, self.cost_per_1k_output))
            .unwrap_or(Decimal::MAX)
    }

    pub fn nominal_cost(&self) -> Decimal {
        self.cost_per_1k_input
            .checked_add(self.cost_per_1k_output)
            .unwrap_or(Decimal::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct BackendConfig {
    #[validate(length(min = 1, message = "backend id must not be empty"))]
    pub id: String,
    pub name: String,
    pub provider: ProviderKind,
    /// Tie-break ordinal, lower wins.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub credential: CredentialRef,
    #[validate(custom(function = "validate_capabilities"))]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub models: Vec<ModelSpec>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl BackendConfig {
    pub fn new(
        id: impl Into<String>,
        provider: ProviderKind,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            provider,
            priority: 0,
            endpoint: String::new(),
            credential: CredentialRef::none(),
            capabilities: capabilities.into_iter().collect(),
            models: Vec::new(),
            active: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_credential(mut self, credential: CredentialRef) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_model(mut self, model: ModelSpec) -> Self {
        self.models.push(model);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn check(&self) -> Result<()> {
        self.validate()?;
        for model in &self.models {
            model.validate()?;
        }

        if self.provider.requires_endpoint() {
            url::Url::parse(&self.endpoint).map_err(|e| {
                Error::configuration(format!(
                    "backend '{}' has invalid endpoint '{}': {}",
                    self.id, self.endpoint, e
                ))
            })?;
        }

        self.credential.source().map_err(|e| {
            Error::configuration(format!("backend '{}' credential: {}", self.id, e))
        })?;

        Ok(())
    }
}

fn validate_price(price: &Decimal) -> std::result::Result<(), ValidationError> {
    if price.is_sign_negative() && !price.is_zero() {
        let mut err = ValidationError::new("negative_price");
        err.message = Some("cost per 1000 tokens must not be negative".into());
        return Err(err);
    }
    Ok(())
}

fn validate_quality(score: f64) -> std::result::Result<(), ValidationError> {
    if !score.is_finite() || !(0.0..=100.0).contains(&score) {
        let mut err = ValidationError::new("quality_range");
        err.message = Some("quality score must be within [0, 100]".into());
        return Err(err);
    }
    Ok(())
}

fn validate_capabilities(
    capabilities: &BTreeSet<Capability>,
) -> std::result::Result<(), ValidationError> {
    if capabilities.is_empty() {
        let mut err = ValidationError::new("empty_capabilities");
        err.message = Some("backend must declare at least one capability".into());
        return Err(err);
    }
    Ok(())
}

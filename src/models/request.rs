use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    #[serde(alias = "classify_message")]
    Classify,
    Generate,
    AnalyzeSentiment,
    ExtractEntities,
    DetectLanguage,
    Translate,
    Summarize,
    Moderate,
}

impl OperationType {
    pub const ALL: [OperationType; 8] = [
        OperationType::Classify,
        OperationType::Generate,
        OperationType::AnalyzeSentiment,
        OperationType::ExtractEntities,
        OperationType::DetectLanguage,
        OperationType::Translate,
        OperationType::Summarize,
        OperationType::Moderate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Classify => "classify",
            OperationType::Generate => "generate",
            OperationType::AnalyzeSentiment => "analyze_sentiment",
            OperationType::ExtractEntities => "extract_entities",
            OperationType::DetectLanguage => "detect_language",
            OperationType::Translate => "translate",
            OperationType::Summarize => "summarize",
            OperationType::Moderate => "moderate",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "classify" | "classify_message" | "classification" => Ok(OperationType::Classify),
            "generate" | "generation" => Ok(OperationType::Generate),
            "analyze_sentiment" | "sentiment" => Ok(OperationType::AnalyzeSentiment),
            "extract_entities" | "entities" => Ok(OperationType::ExtractEntities),
            "detect_language" | "language" => Ok(OperationType::DetectLanguage),
            "translate" | "translation" => Ok(OperationType::Translate),
            "summarize" | "summarization" => Ok(OperationType::Summarize),
            "moderate" | "moderation" => Ok(OperationType::Moderate),
            other => Err(format!("unknown operation type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestInput {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestOptions {
    #[serde(default)]
    pub preferred_backend: Option<String>,
    #[serde(default)]
    pub preferred_model: Option<String>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default = "default_fallback_enabled")]
    pub fallback_enabled: bool,
    /// Per-attempt timeout override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_fallback_enabled() -> bool {
    true
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            preferred_backend: None,
            preferred_model: None,
            max_output_tokens: None,
            fallback_enabled: true,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingRequest {
    pub id: String,
    pub operation: OperationType,
    pub input: RequestInput,
    #[serde(default)]
    pub options: RequestOptions,
}

impl ProcessingRequest {
    pub fn new(operation: OperationType, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation,
            input: RequestInput {
                text: text.into(),
                context: None,
            },
            options: RequestOptions::default(),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.input.context = Some(context);
        self
    }

    pub fn with_preferred_backend(mut self, backend_id: impl Into<String>) -> Self {
        self.options.preferred_backend = Some(backend_id.into());
        self
    }

    pub fn with_preferred_model(mut self, model: impl Into<String>) -> Self {
        self.options.preferred_model = Some(model.into());
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.options.max_output_tokens = Some(max_output_tokens);
        self
    }

    pub fn without_fallback(mut self) -> Self {
        self.options.fallback_enabled = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.options.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelScore {
    pub label: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub text: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
}

/// Normalized output payload; the variant always matches the request's operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationOutput {
    Classification {
        label: String,
        confidence: f64,
        #[serde(default)]
        alternatives: Vec<LabelScore>,
    },
    Generation {
        text: String,
    },
    Sentiment {
        label: String,
        score: f64,
    },
    Entities {
        entities: Vec<Entity>,
    },
    Language {
        code: String,
        confidence: f64,
    },
    Translation {
        text: String,
        target_language: String,
    },
    Summary {
        text: String,
    },
    Moderation {
        flagged: bool,
        #[serde(default)]
        categories: Vec<String>,
    },
}

impl OperationOutput {
    pub fn operation(&self) -> OperationType {
        match self {
            OperationOutput::Classification { .. } => OperationType::Classify,
            OperationOutput::Generation { .. } => OperationType::Generate,
            OperationOutput::Sentiment { .. } => OperationType::AnalyzeSentiment,
            OperationOutput::Entities { .. } => OperationType::ExtractEntities,
            OperationOutput::Language { .. } => OperationType::DetectLanguage,
            OperationOutput::Translation { .. } => OperationType::Translate,
            OperationOutput::Summary { .. } => OperationType::Summarize,
            OperationOutput::Moderation { .. } => OperationType::Moderate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchAttempt {
    pub backend_id: String,
    pub model: String,
    pub attempt_number: usize,
    pub success: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub request_id: String,
    pub operation: OperationType,
    pub output: OperationOutput,
    pub backend_id: String,
    pub backend_name: String,
    pub model: String,
    pub cost: Decimal,
    /// Sum over `attempts`.
    pub latency_ms: u64,
    pub usage: Option<TokenUsage>,
    pub fell_back: bool,
    pub attempts: Vec<DispatchAttempt>,
    pub completed_at: DateTime<Utc>,
}

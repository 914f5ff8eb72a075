use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::backends::adapter::{AdapterRequest, AdapterResponse, AdapterResult, BackendAdapter};
use crate::error::BackendError;
use crate::models::{Entity, LabelScore, OperationOutput, OperationType, TokenUsage};

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "love", "lovely", "excellent", "happy", "wonderful", "fantastic", "nice", "amazing",
];
const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "hate", "awful", "sad", "poor", "horrible", "angry", "worst", "broken",
];
const FLAGGED_WORDS: &[&str] = &["kill", "attack", "spam", "scam", "abuse"];

#[derive(Debug, Clone, PartialEq)]
pub enum LoopbackBehavior {
    Respond,
    RespondWith(OperationOutput),
    Fail(BackendError),
    Delay(Duration),
}

/// In-process backend that answers every operation locally.
#[derive(Debug)]
pub struct LoopbackAdapter {
    name: String,
    default_behavior: LoopbackBehavior,
    script: Mutex<VecDeque<LoopbackBehavior>>,
    unsupported: BTreeSet<OperationType>,
    healthy: AtomicBool,
    init_failure: Option<BackendError>,
    calls: AtomicUsize,
}

impl LoopbackAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_behavior: LoopbackBehavior::Respond,
            script: Mutex::new(VecDeque::new()),
            unsupported: BTreeSet::new(),
            healthy: AtomicBool::new(true),
            init_failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self, error: BackendError) -> Self {
        self.default_behavior = LoopbackBehavior::Fail(error);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_behavior = LoopbackBehavior::Delay(delay);
        self
    }

    pub fn with_script(self, behaviors: impl IntoIterator<Item = LoopbackBehavior>) -> Self {
        self.script.lock().extend(behaviors);
        self
    }

    pub fn without_operation(mut self, operation: OperationType) -> Self {
        self.unsupported.insert(operation);
        self
    }

    pub fn unhealthy(self) -> Self {
        self.healthy.store(false, Ordering::Release);
        self
    }

    pub fn failing_initialization(mut self, error: BackendError) -> Self {
        self.init_failure = Some(error);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn push_behavior(&self, behavior: LoopbackBehavior) {
        self.script.lock().push_back(behavior);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    async fn answer(&self, operation: OperationType, request: &AdapterRequest) -> AdapterResult {
        self.calls.fetch_add(1, Ordering::AcqRel);

        if self.unsupported.contains(&operation) {
            return Err(BackendError::Unsupported(operation));
        }

        let behavior = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_behavior.clone());
        debug!("Loopback '{}' handling {} with {:?}", self.name, operation, behavior);

        let output = match behavior {
            LoopbackBehavior::Respond => heuristic_output(operation, request),
            LoopbackBehavior::RespondWith(output) => output,
            LoopbackBehavior::Fail(error) => return Err(error),
            LoopbackBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                heuristic_output(operation, request)
            }
        };

        let usage = TokenUsage::new(approximate_tokens(&request.text), approximate_tokens(&output_text(&output)));
        Ok(AdapterResponse::new(output).with_usage(usage))
    }
}

#[async_trait]
impl BackendAdapter for LoopbackAdapter {
    async fn initialize(&self) -> Result<(), BackendError> {
        match &self.init_failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn classify(&self, request: &AdapterRequest) -> AdapterResult {
        self.answer(OperationType::Classify, request).await
    }

    async fn generate(&self, request: &AdapterRequest) -> AdapterResult {
        self.answer(OperationType::Generate, request).await
    }

    async fn analyze_sentiment(&self, request: &AdapterRequest) -> AdapterResult {
        self.answer(OperationType::AnalyzeSentiment, request).await
    }

    async fn extract_entities(&self, request: &AdapterRequest) -> AdapterResult {
        self.answer(OperationType::ExtractEntities, request).await
    }

    async fn detect_language(&self, request: &AdapterRequest) -> AdapterResult {
        self.answer(OperationType::DetectLanguage, request).await
    }

    async fn translate(&self, request: &AdapterRequest) -> AdapterResult {
        self.answer(OperationType::Translate, request).await
    }

    async fn summarize(&self, request: &AdapterRequest) -> AdapterResult {
        self.answer(OperationType::Summarize, request).await
    }

    async fn moderate(&self, request: &AdapterRequest) -> AdapterResult {
        self.answer(OperationType::Moderate, request).await
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    fn adapter_name(&self) -> &str {
        &self.name
    }
}

fn approximate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(4).max(1)
}

fn output_text(output: &OperationOutput) -> String {
    match output {
        OperationOutput::Classification { label, .. } | OperationOutput::Sentiment { label, .. } => label.clone(),
        OperationOutput::Generation { text }
        | OperationOutput::Translation { text, .. }
        | OperationOutput::Summary { text } => text.clone(),
        OperationOutput::Entities { entities } => entities
            .iter()
            .map(|e| e.text.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        OperationOutput::Language { code, .. } => code.clone(),
        OperationOutput::Moderation { categories, .. } => categories.join(" "),
    }
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

fn context_str<'a>(request: &'a AdapterRequest, key: &str) -> Option<&'a str> {
    request.context.as_ref()?.get(key)?.as_str()
}

fn heuristic_output(operation: OperationType, request: &AdapterRequest) -> OperationOutput {
    let text = request.text.trim();
    match operation {
        OperationType::Classify => classify(request),
        OperationType::Generate => {
            let mut generated = format!("Response to: {}", text);
            if let Some(max) = request.max_output_tokens {
                let limit = (max as usize).saturating_mul(4);
                if generated.chars().count() > limit {
                    generated = generated.chars().take(limit).collect();
                }
            }
            OperationOutput::Generation { text: generated }
        }
        OperationType::AnalyzeSentiment => {
            let (mut positive, mut negative) = (0i32, 0i32);
            for word in words(text) {
                if POSITIVE_WORDS.contains(&word.as_str()) {
                    positive += 1;
                } else if NEGATIVE_WORDS.contains(&word.as_str()) {
                    negative += 1;
                }
            }
            let total = positive + negative;
            let score = if total == 0 {
                0.0
            } else {
                f64::from(positive - negative) / f64::from(total)
            };
            let label = if score > 0.0 {
                "positive"
            } else if score < 0.0 {
                "negative"
            } else {
                "neutral"
            };
            OperationOutput::Sentiment {
                label: label.to_string(),
                score,
            }
        }
        OperationType::ExtractEntities => OperationOutput::Entities {
            entities: extract_entities(text),
        },
        OperationType::DetectLanguage => detect_language(text),
        OperationType::Translate => {
            let target = context_str(request, "target_language").unwrap_or("en");
            OperationOutput::Translation {
                text: format!("[{}] {}", target, text),
                target_language: target.to_string(),
            }
        }
        OperationType::Summarize => {
            let first_sentence = text
                .split_inclusive(['.', '!', '?'])
                .next()
                .unwrap_or(text)
                .trim();
            let summary: Vec<&str> = first_sentence.split_whitespace().take(30).collect();
            OperationOutput::Summary {
                text: summary.join(" "),
            }
        }
        OperationType::Moderate => {
            let mut categories: Vec<String> = words(text)
                .filter(|w| FLAGGED_WORDS.contains(&w.as_str()))
                .collect();
            categories.sort();
            categories.dedup();
            OperationOutput::Moderation {
                flagged: !categories.is_empty(),
                categories,
            }
        }
    }
}

fn classify(request: &AdapterRequest) -> OperationOutput {
    let labels: Vec<String> = request
        .context
        .as_ref()
        .and_then(|c| c.get("labels"))
        .and_then(|l| l.as_array())
        .map(|labels| labels.iter().filter_map(|l| l.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    if labels.is_empty() {
        let label = if request.text.trim_end().ends_with('?') {
            "question"
        } else {
            "statement"
        };
        return OperationOutput::Classification {
            label: label.to_string(),
            confidence: 0.6,
            alternatives: Vec::new(),
        };
    }

    let lowered = request.text.to_lowercase();
    let mut scored: Vec<LabelScore> = labels
        .iter()
        .map(|label| LabelScore {
            label: label.clone(),
            score: if lowered.contains(&label.to_lowercase()) { 0.9 } else { 0.1 },
        })
        .collect();
    // Stable sort keeps configured order among equal scores.
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));

    let best = scored.remove(0);
    OperationOutput::Classification {
        label: best.label,
        confidence: best.score,
        alternatives: scored,
    }
}

fn extract_entities(text: &str) -> Vec<Entity> {
    let mut entities = Vec::new();
    let mut sentence_start = true;
    let mut offset = 0;

    for token in text.split_inclusive(char::is_whitespace) {
        let start = offset;
        offset += token.len();
        let word = token.trim();
        let cleaned = word.trim_matches(|c: char| !c.is_alphanumeric());
        if cleaned.is_empty() {
            continue;
        }

        let capitalized = cleaned.chars().next().is_some_and(char::is_uppercase);
        if capitalized && !sentence_start {
            let lead = token.find(cleaned).unwrap_or(0);
            entities.push(Entity {
                text: cleaned.to_string(),
                kind: "proper_noun".to_string(),
                start: Some(start + lead),
                end: Some(start + lead + cleaned.len()),
            });
        }
        sentence_start = word.ends_with(['.', '!', '?']);
    }
    entities
}

fn detect_language(text: &str) -> OperationOutput {
    const MARKERS: &[(&str, &[&str])] = &[
        ("en", &["the", "and", "is", "of", "to"]),
        ("es", &["el", "la", "es", "y", "de", "que"]),
        ("fr", &["le", "les", "est", "et", "une", "des"]),
        ("de", &["der", "die", "und", "ist", "das"]),
    ];

    let tokens: Vec<String> = words(text).collect();
    let mut best = ("en", 0usize);
    for (code, markers) in MARKERS {
        let hits = tokens.iter().filter(|t| markers.contains(&t.as_str())).count();
        if hits > best.1 {
            best = (*code, hits);
        }
    }

    let confidence = if tokens.is_empty() || best.1 == 0 {
        0.3
    } else {
        (0.5 + best.1 as f64 / tokens.len() as f64).min(0.99)
    };
    OperationOutput::Language {
        code: best.0.to_string(),
        confidence,
    }
}

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::models::{BackendConfig, ModelSpec, OperationType};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Classification,
    Generation,
    SentimentAnalysis,
    EntityExtraction,
    LanguageDetection,
    Translation,
    Summarization,
    Moderation,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Classification => "classification",
            Capability::Generation => "generation",
            Capability::SentimentAnalysis => "sentiment_analysis",
            Capability::EntityExtraction => "entity_extraction",
            Capability::LanguageDetection => "language_detection",
            Capability::Translation => "translation",
            Capability::Summarization => "summarization",
            Capability::Moderation => "moderation",
        };
        f.write_str(name)
    }
}

pub fn required_capability(operation: OperationType) -> Capability {
    match operation {
        OperationType::Classify => Capability::Classification,
        OperationType::Generate => Capability::Generation,
        OperationType::AnalyzeSentiment => Capability::SentimentAnalysis,
        OperationType::ExtractEntities => Capability::EntityExtraction,
        OperationType::DetectLanguage => Capability::LanguageDetection,
        OperationType::Translate => Capability::Translation,
        OperationType::Summarize => Capability::Summarization,
        OperationType::Moderate => Capability::Moderation,
    }
}

/// Models of `backend` able to serve `operation`, best first.
pub fn eligible_models<'a>(
    backend: &'a BackendConfig,
    operation: OperationType,
    preferred_model: Option<&str>,
) -> Vec<&'a ModelSpec> {
    let capability = required_capability(operation);

    let mut models: Vec<&ModelSpec> = backend
        .models
        .iter()
        .filter(|m| m.active && m.capabilities.contains(&capability))
        .collect();

    models.sort_by(|a, b| {
        let a_preferred = preferred_model == Some(a.name.as_str());
        let b_preferred = preferred_model == Some(b.name.as_str());
        b_preferred
            .cmp(&a_preferred)
            .then_with(|| {
                b.quality_score
                    .partial_cmp(&a.quality_score)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| {
                (a.cost_per_1k_input + a.cost_per_1k_output)
                    .cmp(&(b.cost_per_1k_input + b.cost_per_1k_output))
            })
    });

    models
}

pub fn best_model<'a>(
    backend: &'a BackendConfig,
    operation: OperationType,
    preferred_model: Option<&str>,
) -> Option<&'a ModelSpec> {
    eligible_models(backend, operation, preferred_model)
        .into_iter()
        .next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;
    use rust_decimal::Decimal;

    fn backend() -> BackendConfig {
        BackendConfig::new(
            "multi",
            ProviderKind::Loopback,
            [Capability::Classification, Capability::Generation],
        )
        .with_model(
            ModelSpec::new("small", [Capability::Classification])
                .with_quality(70.0)
                .with_pricing(Decimal::new(1, 1), Decimal::new(1, 1)),
        )
        .with_model(
            ModelSpec::new("large", [Capability::Classification, Capability::Generation])
                .with_quality(90.0)
                .with_pricing(Decimal::new(30, 1), Decimal::new(60, 1)),
        )
        .with_model(
            ModelSpec::new("large-cheap", [Capability::Classification])
                .with_quality(90.0)
                .with_pricing(Decimal::new(10, 1), Decimal::new(20, 1)),
        )
        .with_model(ModelSpec::new("retired", [Capability::Classification]).with_quality(99.0).inactive())
    }

    #[test]
    fn test_every_operation_has_a_capability() {
        for op in OperationType::ALL {
            let _ = required_capability(op);
        }
        assert_eq!(required_capability(OperationType::Translate), Capability::Translation);
        assert_eq!(required_capability(OperationType::Classify), Capability::Classification);
    }

    #[test]
    fn test_sorted_by_quality_then_cost() {
        let backend = backend();
        let names: Vec<_> = eligible_models(&backend, OperationType::Classify, None)
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(names, vec!["large-cheap", "large", "small"]);
    }

    #[test]
    fn test_preferred_model_first_when_valid() {
        let backend = backend();
        let best = best_model(&backend, OperationType::Classify, Some("small")).unwrap();
        assert_eq!(best.name, "small");

        // Preferred name that cannot serve the operation is ignored.
        let best = best_model(&backend, OperationType::Generate, Some("small")).unwrap();
        assert_eq!(best.name, "large");

        // Inactive models never qualify, even when preferred.
        let best = best_model(&backend, OperationType::Classify, Some("retired")).unwrap();
        assert_eq!(best.name, "large-cheap");
    }

    #[test]
    fn test_no_capable_model_yields_empty() {
        let backend = backend();
        assert!(eligible_models(&backend, OperationType::Moderate, None).is_empty());
        assert!(best_model(&backend, OperationType::Moderate, None).is_none());
    }
}

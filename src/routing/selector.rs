use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::models::{ModelSpec, OperationType, ProcessingRequest};
use crate::routing::capability::{best_model, required_capability};
use crate::routing::ledger::PerformanceLedger;
use crate::routing::registry::{BackendEntry, BackendHandle, RegistrySnapshot};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringWeights {
    pub cost: f64,
    pub latency: f64,
    pub confidence: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            cost: 0.3,
            latency: 0.3,
            confidence: 0.4,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<()> {
        let weights = [self.cost, self.latency, self.confidence];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::configuration("scoring weights must be finite and non-negative"));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(Error::configuration("scoring weights must not all be zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingMode {
    Composite,
    /// Smoothed success rate first. Used for the fallback attempt; ignores a
    /// preferred backend since the point is to recover service.
    ReliabilityFirst,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub backend: Arc<BackendEntry>,
    pub model: ModelSpec,
    pub estimated_input_tokens: u32,
    pub estimated_output_tokens: u32,
    pub estimated_cost: Decimal,
    pub estimated_latency_ms: f64,
    pub success_rate: f64,
    pub confidence: f64,
    pub composite_score: f64,
}

impl Candidate {
    pub fn handle(&self) -> BackendHandle {
        self.backend.handle()
    }

    pub fn backend_id(&self) -> &str {
        self.backend.id()
    }

    pub fn summary(&self) -> RankedCandidate {
        RankedCandidate {
            backend_id: self.backend.id().to_string(),
            backend_name: self.backend.config().name.clone(),
            model: self.model.name.clone(),
            estimated_cost: self.estimated_cost,
            estimated_latency_ms: self.estimated_latency_ms,
            success_rate: self.success_rate,
            confidence: self.confidence,
            composite_score: self.composite_score,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedCandidate {
    pub backend_id: String,
    pub backend_name: String,
    pub model: String,
    pub estimated_cost: Decimal,
    pub estimated_latency_ms: f64,
    pub success_rate: f64,
    pub confidence: f64,
    pub composite_score: f64,
}

pub fn estimate_input_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(4)
}

pub fn estimate_output_tokens(operation: OperationType, max_output_hint: Option<u32>) -> u32 {
    match operation {
        OperationType::Classify => 50,
        OperationType::Generate => max_output_hint.unwrap_or(500),
        OperationType::Summarize => 200,
        _ => 100,
    }
}

/// `1 - value / max`; every value scores 1.0 when the max is zero.
fn normalized(value: f64, max: f64) -> f64 {
    if max <= 0.0 {
        1.0
    } else {
        (1.0 - value / max).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Selector {
    weights: ScoringWeights,
}

impl Selector {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn rank(
        &self,
        snapshot: &RegistrySnapshot,
        ledger: &PerformanceLedger,
        request: &ProcessingRequest,
        exclude: &HashSet<BackendHandle>,
        mode: RankingMode,
    ) -> Vec<Candidate> {
        let operation = request.operation;
        let capability = required_capability(operation);
        let preferred_backend = match mode {
            RankingMode::Composite => request.options.preferred_backend.as_deref(),
            RankingMode::ReliabilityFirst => None,
        };
        let preferred_model = request.options.preferred_model.as_deref();

        let input_tokens = estimate_input_tokens(&request.input.text);
        let output_tokens = estimate_output_tokens(operation, request.options.max_output_tokens);

        let mut candidates: Vec<Candidate> = snapshot
            .iter()
            .filter(|entry| entry.config().active && entry.is_healthy())
            .filter(|entry| !exclude.contains(&entry.handle()))
            .filter(|entry| entry.config().capabilities.contains(&capability))
            .filter(|entry| preferred_backend.map_or(true, |id| entry.id() == id))
            .filter_map(|entry| {
                let model = best_model(entry.config(), operation, preferred_model)?;
                let estimate = ledger.estimate(entry.handle(), model);
                let confidence = (model.quality_score / 100.0 + estimate.success_rate * 0.2).clamp(0.0, 1.0);

                Some(Candidate {
                    backend: Arc::clone(entry),
                    model: model.clone(),
                    estimated_input_tokens: input_tokens,
                    estimated_output_tokens: output_tokens,
                    estimated_cost: model.cost_for(input_tokens, output_tokens),
                    estimated_latency_ms: estimate.latency_ms,
                    success_rate: estimate.success_rate,
                    confidence,
                    composite_score: 0.0,
                })
            })
            .collect();

        if candidates.is_empty() {
            debug!("No candidate can serve {} (excluded {})", operation, exclude.len());
            return candidates;
        }

        let max_cost = candidates
            .iter()
            .filter_map(|c| c.estimated_cost.to_f64())
            .fold(0.0_f64, f64::max);
        let max_latency = candidates
            .iter()
            .map(|c| c.estimated_latency_ms)
            .fold(0.0_f64, f64::max);

        for candidate in &mut candidates {
            let cost = candidate.estimated_cost.to_f64().unwrap_or(max_cost);
            let cost_score = normalized(cost, max_cost);
            let latency_score = normalized(candidate.estimated_latency_ms, max_latency);
            candidate.composite_score = self.weights.cost * cost_score
                + self.weights.latency * latency_score
                + self.weights.confidence * candidate.confidence;
            trace!(
                "Candidate {}/{}: cost_score={:.3} latency_score={:.3} confidence={:.3} composite={:.3}",
                candidate.backend_id(),
                candidate.model.name,
                cost_score,
                latency_score,
                candidate.confidence,
                candidate.composite_score
            );
        }

        candidates.sort_by(|a, b| {
            let primary = match mode {
                RankingMode::Composite => Ordering::Equal,
                RankingMode::ReliabilityFirst => b.success_rate.total_cmp(&a.success_rate),
            };
            primary
                .then_with(|| b.composite_score.total_cmp(&a.composite_score))
                .then_with(|| a.backend.config().priority.cmp(&b.backend.config().priority))
                .then_with(|| a.backend_id().cmp(b.backend_id()))
        });

        debug!(
            "Ranked {} candidate(s) for {} ({:?}), top: {}/{}",
            candidates.len(),
            operation,
            mode,
            candidates[0].backend_id(),
            candidates[0].model.name
        );
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::LoopbackAdapter;
    use crate::models::{BackendConfig, ProviderKind};
    use crate::routing::capability::Capability;
    use crate::routing::ledger::Outcome;
    use crate::routing::registry::BackendRegistry;

    fn backend(id: &str, cost: i64, quality: f64) -> BackendConfig {
        BackendConfig::new(id, ProviderKind::Loopback, [Capability::Classification])
            .with_model(
                ModelSpec::new(format!("{}-model", id), [Capability::Classification])
                    .with_pricing(Decimal::new(cost, 0), Decimal::new(cost, 0))
                    .with_quality(quality)
                    .with_latency(500),
            )
    }

    fn registry(configs: Vec<BackendConfig>) -> BackendRegistry {
        let registry = BackendRegistry::new();
        for config in configs {
            registry
                .insert(config, Arc::new(LoopbackAdapter::new("test")), true)
                .unwrap();
        }
        registry
    }

    fn classify() -> ProcessingRequest {
        ProcessingRequest::new(OperationType::Classify, "Is this message about billing or shipping?")
    }

    fn ids(candidates: &[Candidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.backend_id()).collect()
    }

    #[test]
    fn test_output_size_defaults() {
        assert_eq!(estimate_output_tokens(OperationType::Classify, Some(900)), 50);
        assert_eq!(estimate_output_tokens(OperationType::Generate, None), 500);
        assert_eq!(estimate_output_tokens(OperationType::Generate, Some(64)), 64);
        assert_eq!(estimate_output_tokens(OperationType::Summarize, None), 200);
        assert_eq!(estimate_output_tokens(OperationType::Translate, None), 100);
        assert_eq!(estimate_input_tokens("abcdefghi"), 3);
    }

    #[test]
    fn test_cheaper_comparable_backend_ranks_first() {
        let registry = registry(vec![backend("y", 5, 95.0), backend("x", 1, 90.0)]);
        let ledger = PerformanceLedger::default();
        let ranked = Selector::default().rank(
            &registry.snapshot(),
            &ledger,
            &classify(),
            &HashSet::new(),
            RankingMode::Composite,
        );

        assert_eq!(ids(&ranked), vec!["x", "y"]);
        assert!(ranked[0].composite_score > ranked[1].composite_score);
        // Most expensive candidate scores zero on the cost axis.
        assert!((ranked[1].composite_score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let registry = registry(vec![
            backend("c", 2, 80.0).with_priority(1),
            backend("b", 2, 80.0).with_priority(0),
            backend("a", 2, 80.0).with_priority(1),
        ]);
        let ledger = PerformanceLedger::default();
        let selector = Selector::default();
        let request = classify();

        let first = selector.rank(&registry.snapshot(), &ledger, &request, &HashSet::new(), RankingMode::Composite);
        let second = selector.rank(&registry.snapshot(), &ledger, &request, &HashSet::new(), RankingMode::Composite);

        // Equal scores: priority ascending, then id.
        assert_eq!(ids(&first), vec!["b", "a", "c"]);
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn test_filters_inactive_unhealthy_incapable_and_excluded() {
        let registry = registry(vec![
            backend("ok", 1, 80.0),
            backend("off", 1, 80.0).inactive(),
            backend("sick", 1, 80.0),
            BackendConfig::new("writer", ProviderKind::Loopback, [Capability::Generation])
                .with_model(ModelSpec::new("w", [Capability::Generation])),
            backend("gone", 1, 80.0),
        ]);
        let snapshot = registry.snapshot();
        snapshot.find("sick").unwrap().set_healthy(false);
        let exclude: HashSet<_> = [snapshot.find("gone").unwrap().handle()].into_iter().collect();

        let ranked = Selector::default().rank(
            &snapshot,
            &PerformanceLedger::default(),
            &classify(),
            &exclude,
            RankingMode::Composite,
        );
        assert_eq!(ids(&ranked), vec!["ok"]);
    }

    #[test]
    fn test_backend_without_capable_model_is_skipped() {
        // Declares the capability but no active model offers it.
        let hollow = BackendConfig::new("hollow", ProviderKind::Loopback, [Capability::Classification])
            .with_model(ModelSpec::new("old", [Capability::Classification]).inactive());
        let registry = registry(vec![hollow]);
        let ranked = Selector::default().rank(
            &registry.snapshot(),
            &PerformanceLedger::default(),
            &classify(),
            &HashSet::new(),
            RankingMode::Composite,
        );
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_preferred_backend_only_applies_to_composite() {
        let registry = registry(vec![backend("x", 1, 90.0), backend("y", 5, 95.0)]);
        let ledger = PerformanceLedger::default();
        let request = classify().with_preferred_backend("y");

        let primary = Selector::default().rank(&registry.snapshot(), &ledger, &request, &HashSet::new(), RankingMode::Composite);
        assert_eq!(ids(&primary), vec!["y"]);

        let fallback = Selector::default().rank(
            &registry.snapshot(),
            &ledger,
            &request,
            &HashSet::new(),
            RankingMode::ReliabilityFirst,
        );
        assert_eq!(fallback.len(), 2);
    }

    #[test]
    fn test_reliability_first_prefers_success_rate() {
        let registry = registry(vec![backend("cheap-flaky", 1, 90.0), backend("pricey-solid", 5, 90.0)]);
        let snapshot = registry.snapshot();
        let ledger = PerformanceLedger::default();
        for _ in 0..10 {
            ledger.record_outcome(snapshot.find("cheap-flaky").unwrap(), Outcome::failure(None));
        }

        let selector = Selector::default();
        let composite = selector.rank(&snapshot, &ledger, &classify(), &HashSet::new(), RankingMode::Composite);
        assert_eq!(composite[0].backend_id(), "cheap-flaky");

        let reliable = selector.rank(&snapshot, &ledger, &classify(), &HashSet::new(), RankingMode::ReliabilityFirst);
        assert_eq!(reliable[0].backend_id(), "pricey-solid");
    }

    #[test]
    fn test_extreme_price_ranks_last_without_overflow() {
        let mut pricey = backend("pricey", 0, 90.0);
        pricey.models[0] = pricey.models[0].clone().with_pricing(Decimal::MAX, Decimal::ZERO);
        assert!(pricey.check().is_ok());

        let registry = registry(vec![pricey, backend("normal", 1, 90.0)]);
        let ranked = Selector::default().rank(
            &registry.snapshot(),
            &PerformanceLedger::default(),
            &classify(),
            &HashSet::new(),
            RankingMode::Composite,
        );
        assert_eq!(ids(&ranked), vec!["normal", "pricey"]);
        assert!(ranked[1].estimated_cost > ranked[0].estimated_cost);
        assert!(ranked.iter().all(|c| c.composite_score.is_finite()));
    }

    #[test]
    fn test_zero_cost_axis_scores_full() {
        let registry = registry(vec![backend("free-a", 0, 50.0), backend("free-b", 0, 50.0)]);
        let ranked = Selector::default().rank(
            &registry.snapshot(),
            &PerformanceLedger::default(),
            &classify(),
            &HashSet::new(),
            RankingMode::Composite,
        );
        // cost 1.0, latency 0.0 (equal, max > 0), confidence 0.5 + 0.16
        let expected = 0.3 + 0.4 * 0.66;
        assert!((ranked[0].composite_score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_weights_validation() {
        assert!(ScoringWeights::default().validate().is_ok());
        assert!(ScoringWeights { cost: -0.1, ..Default::default() }.validate().is_err());
        assert!(ScoringWeights { cost: 0.0, latency: 0.0, confidence: 0.0 }.validate().is_err());
    }
}

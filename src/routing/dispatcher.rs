use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backends::{invoke_operation, AdapterRequest, AdapterResponse};
use crate::error::{BackendError, Error, Result};
use crate::models::{DispatchAttempt, ProcessingRequest, ProcessingResult};
use crate::routing::ledger::{Outcome, PerformanceLedger};
use crate::routing::registry::RegistrySnapshot;
use crate::routing::selector::{Candidate, RankingMode, Selector};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Bound on a single adapter invocation.
    pub request_timeout_ms: u64,
    /// Global switch; a request can only narrow it.
    pub fallback_enabled: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            fallback_enabled: true,
        }
    }
}

impl DispatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

struct AttemptOutcome {
    record: DispatchAttempt,
    result: std::result::Result<AdapterResponse, BackendError>,
}

#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    config: DispatchConfig,
    selector: Selector,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, selector: Selector) -> Self {
        Self { config, selector }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub async fn dispatch(
        &self,
        snapshot: &RegistrySnapshot,
        ledger: &PerformanceLedger,
        request: &ProcessingRequest,
    ) -> Result<ProcessingResult> {
        let primary = self
            .selector
            .rank(snapshot, ledger, request, &HashSet::new(), RankingMode::Composite)
            .into_iter()
            .next()
            .ok_or(Error::NoProviderAvailable {
                operation: request.operation,
            })?;

        let mut attempts = Vec::with_capacity(2);
        let first = self.attempt(&primary, ledger, request, 1).await;
        attempts.push(first.record);

        let primary_error = match first.result {
            Ok(response) => return Ok(self.finish(request, &primary, response, attempts, false)),
            Err(e) => e,
        };

        if !(self.config.fallback_enabled && request.options.fallback_enabled) {
            debug!("Fallback disabled for request {}", request.id);
            return Err(Error::backend(primary.backend_id(), primary_error));
        }

        let exclude: HashSet<_> = [primary.handle()].into_iter().collect();
        let Some(fallback) = self
            .selector
            .rank(snapshot, ledger, request, &exclude, RankingMode::ReliabilityFirst)
            .into_iter()
            .next()
        else {
            warn!(
                "No fallback available for {} after '{}' failed",
                request.operation,
                primary.backend_id()
            );
            return Err(Error::backend(primary.backend_id(), primary_error));
        };

        info!(
            "Falling back from '{}' to '{}' for request {}",
            primary.backend_id(),
            fallback.backend_id(),
            request.id
        );
        let second = self.attempt(&fallback, ledger, request, 2).await;
        attempts.push(second.record);

        match second.result {
            Ok(response) => Ok(self.finish(request, &fallback, response, attempts, true)),
            Err(fallback_error) => {
                warn!(
                    "Fallback '{}' also failed ({}); surfacing primary error",
                    fallback.backend_id(),
                    fallback_error
                );
                Err(Error::backend(primary.backend_id(), primary_error))
            }
        }
    }

    async fn attempt(
        &self,
        candidate: &Candidate,
        ledger: &PerformanceLedger,
        request: &ProcessingRequest,
        attempt_number: usize,
    ) -> AttemptOutcome {
        let timeout = request.timeout().unwrap_or_else(|| self.config.request_timeout());
        let call = AdapterRequest::for_model(request, &candidate.model.name);
        let adapter = candidate.backend.adapter();

        debug!(
            "Attempt {} for request {}: {} via '{}' model={} timeout={:?}",
            attempt_number,
            request.id,
            request.operation,
            candidate.backend_id(),
            candidate.model.name,
            timeout
        );

        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, invoke_operation(adapter.as_ref(), &call)).await {
            Ok(Ok(response)) if response.output.operation() != request.operation => {
                Err(BackendError::invalid_response(format!(
                    "expected {} output, got {}",
                    request.operation,
                    response.output.operation()
                )))
            }
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                after_ms: timeout.as_millis() as u64,
            }),
        };
        let latency_ms = start.elapsed().as_millis() as u64;

        let outcome = match &result {
            Ok(response) => Outcome::success(latency_ms, realized_cost(candidate, response)),
            // A timed-out call says nothing about how fast the backend is.
            Err(BackendError::Timeout { .. }) => Outcome::failure(None),
            Err(_) => Outcome::failure(Some(latency_ms)),
        };
        ledger.record_outcome(&candidate.backend, outcome);

        if let Err(e) = &result {
            warn!(
                "Backend '{}' failed request {} after {}ms: {}",
                candidate.backend_id(),
                request.id,
                latency_ms,
                e
            );
        }

        AttemptOutcome {
            record: DispatchAttempt {
                backend_id: candidate.backend_id().to_string(),
                model: candidate.model.name.clone(),
                attempt_number,
                success: result.is_ok(),
                latency_ms,
                error: result.as_ref().err().map(ToString::to_string),
            },
            result,
        }
    }

    fn finish(
        &self,
        request: &ProcessingRequest,
        candidate: &Candidate,
        response: AdapterResponse,
        attempts: Vec<DispatchAttempt>,
        fell_back: bool,
    ) -> ProcessingResult {
        let cost = realized_cost(candidate, &response);
        // What the caller waited, across every attempt.
        let latency_ms: u64 = attempts.iter().map(|a| a.latency_ms).sum();

        info!(
            "Request {} served by '{}' model={} cost={} latency={}ms fell_back={}",
            request.id,
            candidate.backend_id(),
            candidate.model.name,
            cost,
            latency_ms,
            fell_back
        );

        ProcessingResult {
            request_id: request.id.clone(),
            operation: request.operation,
            output: response.output,
            backend_id: candidate.backend_id().to_string(),
            backend_name: candidate.backend.config().name.clone(),
            model: candidate.model.name.clone(),
            cost,
            latency_ms,
            usage: response.usage,
            fell_back,
            attempts,
            completed_at: Utc::now(),
        }
    }
}

/// Cost from reported usage at the model's prices, else the pre-call estimate.
fn realized_cost(candidate: &Candidate, response: &AdapterResponse) -> rust_decimal::Decimal {
    match response.usage {
        Some(usage) => candidate.model.cost_for(usage.input_tokens, usage.output_tokens),
        None => candidate.estimated_cost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendAdapter, LoopbackAdapter, LoopbackBehavior};
    use crate::models::{BackendConfig, ModelSpec, OperationOutput, OperationType, ProviderKind, TokenUsage};
    use crate::routing::capability::Capability;
    use crate::routing::registry::BackendRegistry;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn config(id: &str, cost: i64) -> BackendConfig {
        BackendConfig::new(id, ProviderKind::Loopback, [Capability::Classification])
            .with_model(
                ModelSpec::new(format!("{}-m", id), [Capability::Classification])
                    .with_pricing(Decimal::new(cost, 0), Decimal::new(cost, 0))
                    .with_quality(90.0),
            )
    }

    struct Fixture {
        registry: BackendRegistry,
        ledger: PerformanceLedger,
        dispatcher: Dispatcher,
    }

    impl Fixture {
        fn new(backends: Vec<(BackendConfig, LoopbackAdapter)>) -> (Self, Vec<Arc<LoopbackAdapter>>) {
            let registry = BackendRegistry::new();
            let mut adapters = Vec::new();
            for (config, adapter) in backends {
                let adapter = Arc::new(adapter);
                registry
                    .insert(config, Arc::clone(&adapter) as Arc<dyn BackendAdapter>, true)
                    .unwrap();
                adapters.push(adapter);
            }
            let fixture = Self {
                registry,
                ledger: PerformanceLedger::default(),
                dispatcher: Dispatcher::default(),
            };
            (fixture, adapters)
        }

        async fn run(&self, request: &ProcessingRequest) -> Result<ProcessingResult> {
            self.dispatcher
                .dispatch(&self.registry.snapshot(), &self.ledger, request)
                .await
        }

        fn observations(&self, id: &str) -> u64 {
            let handle = self.registry.snapshot().find(id).unwrap().handle();
            self.ledger.sample(handle).map(|s| s.observations).unwrap_or(0)
        }
    }

    fn classify() -> ProcessingRequest {
        ProcessingRequest::new(OperationType::Classify, "Where is my parcel?")
    }

    #[tokio::test]
    async fn test_primary_success() {
        let (fx, adapters) = Fixture::new(vec![
            (config("x", 1), LoopbackAdapter::new("x")),
            (config("y", 5), LoopbackAdapter::new("y")),
        ]);

        let result = fx.run(&classify()).await.unwrap();
        assert_eq!(result.backend_id, "x");
        assert_eq!(result.model, "x-m");
        assert!(!result.fell_back);
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(adapters[1].call_count(), 0);
        assert_eq!(fx.observations("x"), 1);
        assert_eq!(fx.observations("y"), 0);
    }

    #[tokio::test]
    async fn test_fallback_on_primary_failure() {
        let (fx, adapters) = Fixture::new(vec![
            (config("x", 1), LoopbackAdapter::new("x").failing(BackendError::transport("refused"))),
            (config("y", 5), LoopbackAdapter::new("y")),
        ]);

        let result = fx.run(&classify()).await.unwrap();
        assert_eq!(result.backend_id, "y");
        assert!(result.fell_back);
        assert_eq!(result.attempts.len(), 2);
        assert!(!result.attempts[0].success);
        assert_eq!(result.attempts[0].backend_id, "x");
        assert!(result.attempts[1].success);
        assert_eq!(adapters[0].call_count(), 1);
        assert_eq!(
            result.latency_ms,
            result.attempts[0].latency_ms + result.attempts[1].latency_ms
        );
        assert_eq!(fx.observations("x"), 1);
        assert_eq!(fx.observations("y"), 1);
    }

    #[tokio::test]
    async fn test_both_fail_surfaces_primary_error() {
        let (fx, _) = Fixture::new(vec![
            (config("x", 1), LoopbackAdapter::new("x").failing(BackendError::transport("x is down"))),
            (config("y", 5), LoopbackAdapter::new("y").failing(BackendError::unavailable("y is down"))),
        ]);

        let err = fx.run(&classify()).await.unwrap_err();
        match err {
            Error::Backend { backend_id, cause } => {
                assert_eq!(backend_id, "x");
                assert_eq!(cause, BackendError::transport("x is down"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(fx.observations("x"), 1);
        assert_eq!(fx.observations("y"), 1);
    }

    #[tokio::test]
    async fn test_only_one_fallback_attempt() {
        let (fx, adapters) = Fixture::new(vec![
            (config("a", 1), LoopbackAdapter::new("a").failing(BackendError::transport("a"))),
            (config("b", 2), LoopbackAdapter::new("b").failing(BackendError::transport("b"))),
            (config("c", 3), LoopbackAdapter::new("c").failing(BackendError::transport("c"))),
        ]);

        assert!(fx.run(&classify()).await.is_err());
        let total: usize = adapters.iter().map(|a| a.call_count()).sum();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_fallback_disabled_by_request() {
        let (fx, adapters) = Fixture::new(vec![
            (config("x", 1), LoopbackAdapter::new("x").failing(BackendError::transport("refused"))),
            (config("y", 5), LoopbackAdapter::new("y")),
        ]);

        let err = fx.run(&classify().without_fallback()).await.unwrap_err();
        assert_eq!(err.backend_id(), Some("x"));
        assert_eq!(adapters[1].call_count(), 0);
    }

    #[tokio::test]
    async fn test_no_provider_leaves_ledger_untouched() {
        let (fx, _) = Fixture::new(vec![(config("x", 1), LoopbackAdapter::new("x"))]);
        let err = fx
            .run(&ProcessingRequest::new(OperationType::Translate, "hola"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NoProviderAvailable {
                operation: OperationType::Translate
            }
        ));
        assert_eq!(fx.ledger.tracked(), 0);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let (fx, _) = Fixture::new(vec![
            (config("slow", 1), LoopbackAdapter::new("slow").with_delay(Duration::from_millis(500))),
            (config("fast", 5), LoopbackAdapter::new("fast")),
        ]);

        let request = classify().with_timeout(Duration::from_millis(20));
        let result = fx.run(&request).await.unwrap();
        assert_eq!(result.backend_id, "fast");
        assert!(result.latency_ms >= 20);
        assert!(result.attempts[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("timed out")));

        let slow = fx.registry.snapshot().find("slow").unwrap().handle();
        let sample = fx.ledger.sample(slow).unwrap();
        assert!(sample.success_rate < 0.8);
        assert!(sample.latency_ms.is_none());
    }

    #[tokio::test]
    async fn test_wrong_output_shape_is_a_failure() {
        let wrong = LoopbackAdapter::new("x").with_script([LoopbackBehavior::RespondWith(OperationOutput::Summary {
            text: "nope".to_string(),
        })]);
        let (fx, _) = Fixture::new(vec![(config("x", 1), wrong)]);

        let err = fx.run(&classify()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Backend {
                cause: BackendError::InvalidResponse(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_realized_cost_from_usage() {
        let (fx, _) = Fixture::new(vec![(config("x", 2), LoopbackAdapter::new("x"))]);
        let result = fx.run(&classify()).await.unwrap();
        let usage = result.usage.unwrap();
        let expected = Decimal::from(usage.input_tokens + usage.output_tokens) * Decimal::new(2, 0) / Decimal::from(1000);
        assert_eq!(result.cost, expected);
    }

    #[test]
    fn test_realized_cost_falls_back_to_estimate() {
        let registry = BackendRegistry::new();
        registry
            .insert(config("x", 2), Arc::new(LoopbackAdapter::new("x")), true)
            .unwrap();
        let ranked = Selector::default().rank(
            &registry.snapshot(),
            &PerformanceLedger::default(),
            &classify(),
            &HashSet::new(),
            RankingMode::Composite,
        );
        let candidate = &ranked[0];
        let output = OperationOutput::Classification {
            label: "question".to_string(),
            confidence: 0.6,
            alternatives: Vec::new(),
        };

        let without_usage = AdapterResponse::new(output.clone());
        assert_eq!(realized_cost(candidate, &without_usage), candidate.estimated_cost);

        let with_usage = AdapterResponse::new(output).with_usage(TokenUsage::new(1000, 0));
        assert_eq!(realized_cost(candidate, &with_usage), Decimal::new(2, 0));
    }
}

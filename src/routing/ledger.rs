use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::models::ModelSpec;
use crate::routing::registry::{BackendEntry, BackendHandle};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerConfig {
    pub smoothing_factor: f64,
    pub default_success_rate: f64,
    /// Seed used when a backend's adapter fails to initialize.
    pub degraded_success_rate: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            smoothing_factor: 0.1,
            default_success_rate: 0.8,
            degraded_success_rate: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    pub succeeded: bool,
    pub latency_ms: Option<u64>,
    pub cost: Option<Decimal>,
}

impl Outcome {
    pub fn success(latency_ms: u64, cost: Decimal) -> Self {
        Self {
            succeeded: true,
            latency_ms: Some(latency_ms),
            cost: Some(cost),
        }
    }

    pub fn failure(latency_ms: Option<u64>) -> Self {
        Self {
            succeeded: false,
            latency_ms,
            cost: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoricalStats {
    pub backend_id: String,
    #[serde(default)]
    pub avg_latency_ms: Option<f64>,
    #[serde(default)]
    pub success_rate: Option<f64>,
    #[serde(default)]
    pub avg_cost: Option<Decimal>,
    #[serde(default)]
    pub sample_count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PerformanceSample {
    /// `None` until a latency has been observed.
    pub latency_ms: Option<f64>,
    pub success_rate: f64,
    pub avg_cost: Option<Decimal>,
    pub observations: u64,
    pub last_updated: DateTime<Utc>,
}

impl PerformanceSample {
    fn fresh(success_rate: f64) -> Self {
        Self {
            latency_ms: None,
            success_rate,
            avg_cost: None,
            observations: 0,
            last_updated: Utc::now(),
        }
    }

    fn apply(&mut self, outcome: &Outcome, alpha: f64) {
        if let Some(observed) = outcome.latency_ms {
            let observed = observed as f64;
            self.latency_ms = Some(match self.latency_ms {
                Some(previous) => previous * (1.0 - alpha) + observed * alpha,
                None => observed,
            });
        }

        if let Some(observed) = outcome.cost {
            self.avg_cost = Some(match self.avg_cost {
                Some(previous) => {
                    let alpha = Decimal::from_f64(alpha).unwrap_or(Decimal::ZERO);
                    previous
                        .checked_mul(Decimal::ONE - alpha)
                        .zip(observed.checked_mul(alpha))
                        .and_then(|(kept, added)| kept.checked_add(added))
                        .unwrap_or(Decimal::MAX)
                }
                None => observed,
            });
        }

        let observed = if outcome.succeeded { 1.0 } else { 0.0 };
        self.success_rate = (self.success_rate * (1.0 - alpha) + observed * alpha).clamp(0.0, 1.0);
        self.observations += 1;
        self.last_updated = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub latency_ms: f64,
    pub success_rate: f64,
    pub avg_cost: Decimal,
}

/// One sample per backend, each behind its own mutex. The table itself is
/// only write-locked to create, seed or forget a sample.
pub struct PerformanceLedger {
    config: LedgerConfig,
    samples: RwLock<HashMap<BackendHandle, Arc<Mutex<PerformanceSample>>>>,
}

impl PerformanceLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            samples: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn slot(&self, handle: BackendHandle) -> Option<Arc<Mutex<PerformanceSample>>> {
        self.samples.read().get(&handle).cloned()
    }

    pub fn estimate(&self, handle: BackendHandle, model: &ModelSpec) -> Estimate {
        let nominal_latency = model.avg_latency_ms as f64;
        let nominal_cost = model.nominal_cost();

        match self.slot(handle) {
            Some(slot) => {
                let sample = slot.lock();
                Estimate {
                    latency_ms: sample.latency_ms.unwrap_or(nominal_latency),
                    success_rate: sample.success_rate,
                    avg_cost: sample.avg_cost.unwrap_or(nominal_cost),
                }
            }
            None => Estimate {
                latency_ms: nominal_latency,
                success_rate: self.config.default_success_rate,
                avg_cost: nominal_cost,
            },
        }
    }

    /// Outcomes for a removed backend are dropped.
    pub fn record_outcome(&self, backend: &BackendEntry, outcome: Outcome) {
        let handle = backend.handle();
        let slot = match self.slot(handle) {
            Some(slot) => slot,
            None => {
                let mut samples = self.samples.write();
                if backend.is_retired() {
                    debug!("Dropping outcome for removed backend {}", handle);
                    return;
                }
                let default_success_rate = self.config.default_success_rate;
                Arc::clone(
                    samples
                        .entry(handle)
                        .or_insert_with(|| Arc::new(Mutex::new(PerformanceSample::fresh(default_success_rate)))),
                )
            }
        };

        let mut sample = slot.lock();
        sample.apply(&outcome, self.config.smoothing_factor);
        trace!(
            "Ledger {} -> latency={:?} success_rate={:.3} cost={:?}",
            handle,
            sample.latency_ms,
            sample.success_rate,
            sample.avg_cost
        );
    }

    pub fn seed(&self, backend: &BackendEntry, stats: &HistoricalStats) {
        let sample = PerformanceSample {
            latency_ms: stats.avg_latency_ms,
            success_rate: stats
                .success_rate
                .unwrap_or(self.config.default_success_rate)
                .clamp(0.0, 1.0),
            avg_cost: stats.avg_cost,
            observations: stats.sample_count,
            last_updated: Utc::now(),
        };
        self.install(backend, sample);
    }

    pub fn mark_degraded(&self, backend: &BackendEntry) {
        self.install(backend, PerformanceSample::fresh(self.config.degraded_success_rate));
    }

    fn install(&self, backend: &BackendEntry, sample: PerformanceSample) {
        let mut samples = self.samples.write();
        if backend.is_retired() {
            return;
        }
        samples.insert(backend.handle(), Arc::new(Mutex::new(sample)));
    }

    /// Drops the sample. Called from the registry's removal hook, after the
    /// entry is marked retired, so no later outcome can recreate it.
    pub fn forget(&self, handle: BackendHandle) {
        self.samples.write().remove(&handle);
    }

    pub fn sample(&self, handle: BackendHandle) -> Option<PerformanceSample> {
        self.slot(handle).map(|slot| slot.lock().clone())
    }

    pub fn tracked(&self) -> usize {
        self.samples.read().len()
    }
}

impl Default for PerformanceLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

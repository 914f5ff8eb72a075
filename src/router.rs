use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::app::RouterConfig;
use crate::backends::{AdapterFactory, BackendAdapter, DefaultAdapterFactory};
use crate::error::{Error, Result};
use crate::models::{BackendConfig, ProcessingRequest, ProcessingResult, ProviderKind};
use crate::routing::{
    BackendEntry, BackendHandle, BackendRegistry, Candidate, DispatchConfig, Dispatcher, HistoricalStats,
    LedgerConfig, PerformanceLedger, PerformanceSample, RankingMode, ScoringWeights, Selector,
};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub active: bool,
    pub healthy: bool,
    pub metrics: Option<PerformanceSample>,
}

pub struct Router {
    registry: BackendRegistry,
    ledger: PerformanceLedger,
    dispatcher: Dispatcher,
    factory: Arc<dyn AdapterFactory>,
    probe_timeout: Duration,
    initialized: AtomicBool,
}

impl Router {
    pub fn new(
        scoring: ScoringWeights,
        ledger: LedgerConfig,
        dispatch: DispatchConfig,
        factory: Arc<dyn AdapterFactory>,
    ) -> Self {
        Self {
            registry: BackendRegistry::new(),
            ledger: PerformanceLedger::new(ledger),
            dispatcher: Dispatcher::new(dispatch, Selector::new(scoring)),
            factory,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub async fn from_config(config: RouterConfig) -> Result<Self> {
        let factory = DefaultAdapterFactory {
            http_timeout: config.dispatch.request_timeout(),
        };
        Self::from_config_with_factory(config, Arc::new(factory)).await
    }

    pub async fn from_config_with_factory(config: RouterConfig, factory: Arc<dyn AdapterFactory>) -> Result<Self> {
        config.validate()?;

        let router = Self::new(config.scoring, config.ledger, config.dispatch, factory);
        for backend in config.backends {
            router.add_backend(backend).await?;
        }
        router.seed_history(&config.history);

        info!("Router ready with {} backend(s)", router.registry.snapshot().len());
        Ok(router)
    }

    pub async fn process(&self, request: ProcessingRequest) -> Result<ProcessingResult> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(Error::configuration("no backend has been registered"));
        }

        debug!("Processing request {} ({})", request.id, request.operation);
        let snapshot = self.registry.snapshot();
        self.dispatcher.dispatch(&snapshot, &self.ledger, &request).await
    }

    pub fn rank(&self, request: &ProcessingRequest) -> Vec<Candidate> {
        self.dispatcher.selector().rank(
            &self.registry.snapshot(),
            &self.ledger,
            request,
            &HashSet::new(),
            RankingMode::Composite,
        )
    }

    pub async fn add_backend(&self, config: BackendConfig) -> Result<BackendHandle> {
        config.check()?;
        if self.registry.contains(&config.id) {
            return Err(Error::configuration(format!("backend id '{}' is already registered", config.id)));
        }

        let adapter = self.factory.create(&config)?;
        self.add_backend_with_adapter(config, adapter).await
    }

    /// An adapter that fails to initialize is still registered, but starts
    /// unhealthy with a degraded ledger sample until a probe passes.
    pub async fn add_backend_with_adapter(
        &self,
        config: BackendConfig,
        adapter: Arc<dyn BackendAdapter>,
    ) -> Result<BackendHandle> {
        config.check()?;

        let initialized = match tokio::time::timeout(self.probe_timeout, adapter.initialize()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("initialization timed out after {:?}", self.probe_timeout)),
        };

        let id = config.id.clone();
        let entry = self.registry.insert(config, adapter, initialized.is_ok())?;
        if let Err(reason) = initialized {
            warn!("Backend '{}' failed to initialize: {}; registered as unhealthy", id, reason);
            self.ledger.mark_degraded(&entry);
        }

        self.initialized.store(true, Ordering::Release);
        Ok(entry.handle())
    }

    /// Removes the backend together with its ledger sample. Returns whether
    /// it was registered.
    pub fn remove_backend(&self, id: &str) -> bool {
        let removed = self
            .registry
            .remove_with(id, |entry| self.ledger.forget(entry.handle()))
            .is_some();
        if removed {
            info!("Removed backend '{}'", id);
        } else {
            debug!("Remove requested for unknown backend '{}'", id);
        }
        removed
    }

    pub async fn status(&self) -> Vec<BackendStatus> {
        let snapshot = self.registry.snapshot();
        let entries: Vec<Arc<BackendEntry>> = snapshot.iter().cloned().collect();
        let health = self.probe_all(&entries).await;

        entries
            .iter()
            .zip(health)
            .map(|(entry, healthy)| BackendStatus {
                id: entry.id().to_string(),
                name: entry.config().name.clone(),
                provider: entry.config().provider,
                active: entry.config().active,
                healthy,
                metrics: self.ledger.sample(entry.handle()),
            })
            .collect()
    }

    pub async fn refresh_health(&self) -> usize {
        let snapshot = self.registry.snapshot();
        let entries: Vec<Arc<BackendEntry>> = snapshot.iter().cloned().collect();
        self.probe_all(&entries).await.into_iter().filter(|h| *h).count()
    }

    async fn probe_all(&self, entries: &[Arc<BackendEntry>]) -> Vec<bool> {
        let probes = entries.iter().map(|entry| async move {
            let healthy = tokio::time::timeout(self.probe_timeout, entry.adapter().health_check())
                .await
                .unwrap_or(false);
            let was_healthy = entry.set_healthy(healthy);
            if was_healthy != healthy {
                info!(
                    "Backend '{}' is now {}",
                    entry.id(),
                    if healthy { "healthy" } else { "unhealthy" }
                );
            }
            healthy
        });
        join_all(probes).await
    }

    pub fn seed_history(&self, history: &[HistoricalStats]) -> usize {
        let snapshot = self.registry.snapshot();
        let mut applied = 0;
        for stats in history {
            match snapshot.find(&stats.backend_id) {
                Some(entry) => {
                    self.ledger.seed(entry, stats);
                    applied += 1;
                }
                None => warn!("Ignoring history for unknown backend '{}'", stats.backend_id),
            }
        }
        if applied > 0 {
            info!("Seeded {} backend(s) from history", applied);
        }
        applied
    }

    pub fn ledger(&self) -> &PerformanceLedger {
        &self.ledger
    }

    pub fn backend(&self, id: &str) -> Option<Arc<BackendEntry>> {
        self.registry.snapshot().find(id).cloned()
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.registry.snapshot().iter().map(|e| e.id().to_string()).collect()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(
            ScoringWeights::default(),
            LedgerConfig::default(),
            DispatchConfig::default(),
            Arc::new(DefaultAdapterFactory::default()),
        )
    }
}

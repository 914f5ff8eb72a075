use config::{Config, Environment, File, FileFormat};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models::{BackendConfig, ModelSpec, ProviderKind};
use crate::routing::{Capability, DispatchConfig, HistoricalStats, LedgerConfig, ScoringWeights};

const ENV_PREFIX: &str = "AI_ROUTER";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RouterConfig {
    pub scoring: ScoringWeights,
    pub ledger: LedgerConfig,
    pub dispatch: DispatchConfig,
    pub backends: Vec<BackendConfig>,
    pub history: Vec<HistoricalStats>,
}

impl RouterConfig {
    /// Loads `path` (if it exists) layered with `AI_ROUTER__*` environment
    /// overrides, then validates the result.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from: {:?}", path);
        } else {
            info!("Config file {:?} not found, using defaults", path);
        }

        let config: RouterConfig = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        info!(
            "Configuration loaded: {} backend(s), {} history record(s)",
            config.backends.len(),
            config.history.len()
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RouterConfig = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        info!("Saving configuration to: {:?}", path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, self.to_toml()?).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.scoring.validate()?;

        let ledger = &self.ledger;
        if !(ledger.smoothing_factor > 0.0 && ledger.smoothing_factor <= 1.0) {
            return Err(Error::configuration("ledger.smoothing_factor must be within (0, 1]"));
        }
        for (name, rate) in [
            ("default_success_rate", ledger.default_success_rate),
            ("degraded_success_rate", ledger.degraded_success_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(Error::configuration(format!("ledger.{} must be within [0, 1]", name)));
            }
        }

        if self.dispatch.request_timeout_ms == 0 {
            return Err(Error::configuration("dispatch.request_timeout_ms must be greater than 0"));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            backend.check()?;
            if !seen.insert(backend.id.as_str()) {
                return Err(Error::configuration(format!("duplicate backend id '{}'", backend.id)));
            }
        }

        for stats in &self.history {
            if !seen.contains(stats.backend_id.as_str()) {
                warn!("History for unknown backend '{}' will be ignored", stats.backend_id);
            }
        }

        Ok(())
    }

    pub fn sample() -> Self {
        let price = |input: i64, output: i64| (Decimal::new(input, 2), Decimal::new(output, 2));
        let (local_in, local_out) = price(0, 0);
        let (mini_in, mini_out) = price(15, 60);

        Self {
            backends: vec![
                BackendConfig::new(
                    "local",
                    ProviderKind::Loopback,
                    [
                        Capability::Classification,
                        Capability::SentimentAnalysis,
                        Capability::LanguageDetection,
                        Capability::Moderation,
                    ],
                )
                .with_name("Local heuristics")
                .with_priority(10)
                .with_model(
                    ModelSpec::new(
                        "heuristic",
                        [
                            Capability::Classification,
                            Capability::SentimentAnalysis,
                            Capability::LanguageDetection,
                            Capability::Moderation,
                        ],
                    )
                    .with_pricing(local_in, local_out)
                    .with_latency(5)
                    .with_quality(40.0),
                ),
                BackendConfig::new(
                    "openai",
                    ProviderKind::OpenAi,
                    [Capability::Classification, Capability::Generation, Capability::Summarization],
                )
                .with_name("OpenAI")
                .with_endpoint("https://router-gateway.example.com/openai")
                .with_credential(crate::models::CredentialRef::new("env:OPENAI_API_KEY"))
                .with_model(
                    ModelSpec::new(
                        "gpt-4o-mini",
                        [Capability::Classification, Capability::Generation, Capability::Summarization],
                    )
                    .with_pricing(mini_in, mini_out)
                    .with_latency(800)
                    .with_quality(82.0),
                ),
            ],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[scoring]
cost = 0.5
latency = 0.2
confidence = 0.3

[dispatch]
request_timeout_ms = 1500

[[backends]]
id = "fast-local"
name = "Fast local"
provider = "loopback"
priority = 1
capabilities = ["classification", "moderation"]

[[backends.models]]
name = "tiny"
capabilities = ["classification"]
cost_per_1k_input = "0.01"
cost_per_1k_output = "0.02"
avg_latency_ms = 20
quality_score = 55.0

[[history]]
backend_id = "fast-local"
avg_latency_ms = 18.5
success_rate = 0.97
sample_count = 420
"#;

    #[test]
    fn test_parse_toml() {
        let config = RouterConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.scoring.cost, 0.5);
        assert_eq!(config.dispatch.request_timeout_ms, 1500);
        assert!(config.dispatch.fallback_enabled);
        assert_eq!(config.ledger, LedgerConfig::default());

        let backend = &config.backends[0];
        assert_eq!(backend.provider, ProviderKind::Loopback);
        assert!(backend.active);
        assert_eq!(backend.models[0].cost_per_1k_output, Decimal::new(2, 2));
        assert_eq!(config.history[0].sample_count, 420);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = RouterConfig::load(file.path()).unwrap();
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].id, "fast-local");
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RouterConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert!(config.backends.is_empty());
        assert_eq!(config.scoring, ScoringWeights::default());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut config = RouterConfig::from_toml_str(SAMPLE).unwrap();
        config.backends.push(config.backends[0].clone());
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_range_checks() {
        let mut config = RouterConfig::default();
        config.ledger.smoothing_factor = 0.0;
        assert!(config.validate().is_err());

        let mut config = RouterConfig::default();
        config.ledger.default_success_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = RouterConfig::default();
        config.dispatch.request_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = RouterConfig::default();
        config.scoring.confidence = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_backend_rejected_at_load() {
        let broken = SAMPLE.replace("quality_score = 55.0", "quality_score = 140.0");
        assert!(RouterConfig::from_toml_str(&broken).is_err());
    }

    #[tokio::test]
    async fn test_sample_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("router.toml");

        let sample = RouterConfig::sample();
        sample.validate().unwrap();
        sample.save(&path).await.unwrap();

        let loaded = RouterConfig::load(&path).unwrap();
        assert_eq!(loaded.backends.len(), 2);
        assert_eq!(loaded.backends[1].models[0].cost_per_1k_input, Decimal::new(15, 2));
    }
}

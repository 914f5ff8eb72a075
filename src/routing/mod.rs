pub mod capability;
pub mod dispatcher;
pub mod ledger;
pub mod registry;
pub mod selector;

pub use capability::{best_model, eligible_models, required_capability, Capability};
pub use dispatcher::{DispatchConfig, Dispatcher};
pub use ledger::{Estimate, HistoricalStats, LedgerConfig, Outcome, PerformanceLedger, PerformanceSample};
pub use registry::{BackendEntry, BackendHandle, BackendRegistry, RegistrySnapshot};
pub use selector::{Candidate, RankedCandidate, RankingMode, ScoringWeights, Selector};

pub mod backend;
pub mod request;

pub use backend::{BackendConfig, CredentialRef, CredentialSource, ModelSpec, ProviderKind};
pub use request::{
    DispatchAttempt, Entity, LabelScore, OperationOutput, OperationType, ProcessingRequest, ProcessingResult,
    RequestInput, RequestOptions, TokenUsage,
};

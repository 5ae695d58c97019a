mod root;
mod runtime;
mod security;
mod workflow;

pub use root::Config;
pub use runtime::{BusConfig, DatabaseConfig, ObservabilityConfig};
pub use security::{
    AuditConfig, GuardrailConfig, SecretsConfig, Sensitivity, TrustedKey, WiseAuthorityConfig,
};
pub use workflow::{AgentProfile, StatesConfig, WorkflowConfig};

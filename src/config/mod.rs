pub mod hot_reload;
pub mod schema;

pub use hot_reload::ConfigHandle;
pub use schema::{
    AgentProfile, AuditConfig, BusConfig, Config, DatabaseConfig, GuardrailConfig,
    ObservabilityConfig, SecretsConfig, Sensitivity, StatesConfig, TrustedKey,
    WiseAuthorityConfig, WorkflowConfig,
};

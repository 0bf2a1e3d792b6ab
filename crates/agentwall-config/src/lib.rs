pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    AgentWallConfig, BudgetConfig, ConfigWarning, DlpConfig, LoggingConfig, LoopDetectionConfig,
    ProviderEntry, ProvidersConfig, RunConfig, ServerConfig, StoreConfig, TelemetryConfig,
    WarningSeverity,
};

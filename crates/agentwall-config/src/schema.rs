use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Root configuration — maps to `agentwall.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentWallConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub providers: ProvidersConfig,
    pub budget: BudgetConfig,
    pub dlp: DlpConfig,
    pub loop_detection: LoopDetectionConfig,
    pub run: RunConfig,
    pub store: StoreConfig,
    pub telemetry: TelemetryConfig,
}

// ── Server ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address.
    pub listen: String,
    /// Enable permissive CORS (for dashboard development).
    pub cors: bool,
    /// Static API key the gateway itself requires on `Authorization: Bearer`.
    /// `None` disables the check (identity comes entirely from the identity service).
    pub api_key: Option<String>,
    /// Base URL of the identity/policy service consulted before admission.
    /// `None` runs in standalone mode: team/user default to "default".
    pub identity_service_url: Option<String>,
    /// Token-bucket burst size per caller IP.
    pub rate_limit_burst: u32,
    /// Token-bucket refill rate, tokens per second, per caller IP.
    pub rate_limit_refill_per_sec: f64,
    /// Upstream request timeout, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            cors: true,
            api_key: None,
            identity_service_url: None,
            rate_limit_burst: 60,
            rate_limit_refill_per_sec: 1.0,
            request_timeout_secs: 120,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
    /// Log file path (None = stdout only).
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
            file: None,
        }
    }
}

// ── Providers ──────────────────────────────────────────────────

/// One upstream provider's connection details.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEntry {
    pub base_url: String,
    /// API key, normally left unset here and filled from the provider's
    /// standard environment variable (`OPENAI_API_KEY`, etc).
    pub api_key: Option<String>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

impl Default for ProviderEntry {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            extra_headers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider name -> connection config. Pre-populated with sane defaults
    /// for openai/anthropic/groq/deepseek/mistral/ollama/qwen/openrouter;
    /// entries here override or add to those defaults.
    pub entries: HashMap<String, ProviderEntry>,
    /// Model-alias -> fully-qualified `provider/model` string, checked
    /// before prefix-based routing (e.g. "gpt4" -> "openai/gpt-4").
    pub aliases: HashMap<String, String>,
    /// Provider used when no alias or prefix match is found.
    pub default_provider: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            aliases: HashMap::new(),
            default_provider: "openai".into(),
        }
    }
}

// ── Budget ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub per_run_limit_usd: f64,
    pub daily_limit_usd: f64,
    pub monthly_limit_usd: f64,
    pub alert_threshold_usd: f64,
    pub auto_kill_enabled: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            per_run_limit_usd: 10.0,
            daily_limit_usd: 100.0,
            monthly_limit_usd: 3000.0,
            alert_threshold_usd: 5.0,
            auto_kill_enabled: true,
        }
    }
}

// ── DLP ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlpConfig {
    pub enabled: bool,
    /// "mask", "block", or "shadow_log".
    pub mode: String,
    /// Shannon-entropy threshold above which a high-entropy token is
    /// treated as a likely secret by the advisory heuristic scan.
    pub entropy_threshold: f64,
}

impl Default for DlpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: "mask".into(),
            entropy_threshold: 3.5,
        }
    }
}

// ── Loop detection ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectionConfig {
    pub enabled: bool,
    /// Jaccard word-set similarity above which two prompts count as a loop.
    pub jaccard_threshold: f64,
    /// Size of the recent-prompt/recent-response rings kept per run.
    pub ring_capacity: usize,
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jaccard_threshold: 0.95,
            ring_capacity: 5,
        }
    }
}

// ── Run ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub default_max_steps: u32,
    pub default_timeout_seconds: u64,
    pub default_max_budget_usd: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            default_max_steps: 30,
            default_timeout_seconds: 120,
            default_max_budget_usd: 10.0,
        }
    }
}

// ── Store ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Run-state entry time-to-live, in seconds.
    pub ttl_seconds: u64,
    /// If true, a store read/write error degrades to "allow" rather than
    /// failing the request (availability over strict enforcement).
    pub degraded_mode_allowed: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 86_400,
            degraded_mode_allowed: true,
        }
    }
}

// ── Telemetry ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    pub queue_capacity: usize,
    pub requeue_cap: usize,
    pub dashboard_queue_cap: usize,
    pub export_url: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_secs: 5,
            queue_capacity: 10_000,
            requeue_cap: 10_000,
            dashboard_queue_cap: 1_000,
            export_url: None,
        }
    }
}

// ── Default for root ───────────────────────────────────────────

impl Default for AgentWallConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            providers: ProvidersConfig::default(),
            budget: BudgetConfig::default(),
            dlp: DlpConfig::default(),
            loop_detection: LoopDetectionConfig::default(),
            run: RunConfig::default(),
            store: StoreConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let icon = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "[{}] {}: {}", icon, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, " ({})", h)?;
        }
        Ok(())
    }
}

impl AgentWallConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            warnings.push(ConfigWarning {
                field: "server.listen".into(),
                message: format!("'{}' is not a valid socket address", self.server.listen),
                severity: WarningSeverity::Error,
                hint: Some("use host:port, e.g. '0.0.0.0:8080'".into()),
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("valid values: {}", valid_levels.join(", "))),
            });
        }

        let valid_modes = ["mask", "block", "shadow_log"];
        if !valid_modes.contains(&self.dlp.mode.as_str()) {
            warnings.push(ConfigWarning {
                field: "dlp.mode".into(),
                message: format!("unknown dlp mode '{}'", self.dlp.mode),
                severity: WarningSeverity::Error,
                hint: Some(format!("valid values: {}", valid_modes.join(", "))),
            });
        }

        if self.loop_detection.jaccard_threshold < 0.0 || self.loop_detection.jaccard_threshold > 1.0 {
            warnings.push(ConfigWarning {
                field: "loop_detection.jaccard_threshold".into(),
                message: format!(
                    "{} is out of range",
                    self.loop_detection.jaccard_threshold
                ),
                severity: WarningSeverity::Error,
                hint: Some("jaccard_threshold must be between 0.0 and 1.0".into()),
            });
        }

        if self.budget.per_run_limit_usd <= 0.0 {
            warnings.push(ConfigWarning {
                field: "budget.per_run_limit_usd".into(),
                message: "per_run_limit_usd must be positive".into(),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }

        if self.budget.alert_threshold_usd > self.budget.per_run_limit_usd {
            warnings.push(ConfigWarning {
                field: "budget.alert_threshold_usd".into(),
                message: "alert threshold is above the per-run limit, it will never fire".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        if self.telemetry.batch_size == 0 {
            warnings.push(ConfigWarning {
                field: "telemetry.batch_size".into(),
                message: "batch_size is 0, telemetry would never flush on size".into(),
                severity: WarningSeverity::Warning,
                hint: Some("rely on flush_interval_secs or set a positive batch size".into()),
            });
        }

        if self.store.ttl_seconds == 0 {
            warnings.push(ConfigWarning {
                field: "store.ttl_seconds".into(),
                message: "ttl_seconds is 0, run state would expire immediately".into(),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }

        if warnings.iter().any(|w| w.severity == WarningSeverity::Error) {
            let joined = warnings
                .iter()
                .filter(|w| w.severity == WarningSeverity::Error)
                .map(|w| w.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(joined);
        }

        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_clean() {
        let cfg = AgentWallConfig::default();
        let warnings = cfg.validate().expect("defaults must validate");
        assert!(warnings.is_empty());
    }

    #[test]
    fn bad_listen_address_is_an_error() {
        let mut cfg = AgentWallConfig::default();
        cfg.server.listen = "not-an-address".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_dlp_mode_is_an_error() {
        let mut cfg = AgentWallConfig::default();
        cfg.dlp.mode = "delete_everything".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn alert_above_limit_is_a_warning_not_an_error() {
        let mut cfg = AgentWallConfig::default();
        cfg.budget.alert_threshold_usd = cfg.budget.per_run_limit_usd + 1.0;
        let warnings = cfg.validate().expect("should still validate");
        assert!(!warnings.is_empty());
    }
}

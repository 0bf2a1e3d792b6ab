use thiserror::Error;

/// Unified error type for the AgentWall gateway.
///
/// Each variant maps to exactly one HTTP status and `error.type` string at
/// the server boundary — see `agentwall_server::pipeline::error_response`.
#[derive(Error, Debug)]
pub enum AgentWallError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("run limit exceeded: {kind}: {reason}")]
    RunLimit {
        kind: RunLimitKind,
        reason: String,
        /// Populated only for `LoopDetected`: the typed loop classification
        /// (`"exact_prompt"`, `"oscillation"`, …) surfaced as
        /// `error.loop_type` on the wire.
        loop_type: Option<String>,
        /// Populated only for `LoopDetected`: the detector's confidence,
        /// surfaced as `error.confidence` on the wire.
        confidence: Option<f64>,
    },

    #[error("upstream error {status} from {provider}: {body}")]
    UpstreamStatus {
        status: u16,
        body: String,
        provider: String,
    },

    #[error("upstream network error: {0}")]
    UpstreamNetwork(String),

    #[error("request blocked by data-loss-prevention policy")]
    DlpBlocked,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// The specific ceiling that tripped a `RunLimit` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLimitKind {
    Killed,
    StepLimit,
    Timeout,
    BudgetExceeded,
    LoopDetected,
}

impl std::fmt::Display for RunLimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunLimitKind::Killed => "killed",
            RunLimitKind::StepLimit => "step_limit_exceeded",
            RunLimitKind::Timeout => "timeout",
            RunLimitKind::BudgetExceeded => "budget_exceeded",
            RunLimitKind::LoopDetected => "loop_detected",
        };
        write!(f, "{s}")
    }
}

pub type Result<T> = std::result::Result<T, AgentWallError>;

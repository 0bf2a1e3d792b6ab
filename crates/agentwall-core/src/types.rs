use crate::money::Money;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Opaque caller-supplied or server-generated run identifier, <=128 bytes.
pub type RunId = String;

/// Status of a [`Run`]. Once a run leaves `Running` it never returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

/// A fixed-capacity ring buffer holding the last `N` entries, evicting the
/// oldest on overflow. Used for the recent-prompts/recent-responses rings
/// that back loop detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ring<T> {
    capacity: usize,
    entries: VecDeque<T>,
}

impl<T> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(item);
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most recent `n` entries, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<&T> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).collect()
    }
}

impl<T> Default for Ring<T> {
    fn default() -> Self {
        Self::new(5)
    }
}

/// The per-run effective ceilings, resolved from the identity service's
/// `limits` payload and/or the server's configured defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RunLimits {
    pub max_steps: u32,
    pub max_budget: Money,
    pub timeout_seconds: u64,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_steps: 30,
            max_budget: Money::from_dollars_f64(10.0),
            timeout_seconds: 120,
        }
    }
}

/// A causally linked sequence of model invocations forming one agent task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub team_id: String,
    pub user_id: String,
    pub agent_id: Option<String>,

    pub step_count: u32,
    pub total_tokens: u64,
    pub total_cost: Money,

    pub started_at: chrono::DateTime<chrono::Utc>,
    pub last_activity: chrono::DateTime<chrono::Utc>,

    pub status: RunStatus,
    pub kill_reason: Option<String>,

    pub loop_detected: bool,
    pub budget_exceeded: bool,

    pub recent_prompts: Ring<String>,
    pub recent_responses: Ring<String>,

    pub limits: RunLimits,
}

impl Run {
    pub fn new(run_id: RunId, team_id: String, user_id: String, limits: RunLimits) -> Self {
        let now = chrono::Utc::now();
        Self {
            run_id,
            team_id,
            user_id,
            agent_id: None,
            step_count: 0,
            total_tokens: 0,
            total_cost: Money::ZERO,
            started_at: now,
            last_activity: now,
            status: RunStatus::Running,
            kill_reason: None,
            loop_detected: false,
            budget_exceeded: false,
            recent_prompts: Ring::new(5),
            recent_responses: Ring::new(5),
            limits,
        }
    }

    pub fn kill(&mut self, reason: impl Into<String>) {
        self.status = RunStatus::Killed;
        self.kill_reason = Some(reason.into());
    }
}

/// Immutable row pushed to the telemetry queue after each completed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub run_id: RunId,
    pub step: u32,
    pub request_id: uuid::Uuid,
    pub team_id: String,
    pub user_id: String,
    pub api_key_id: Option<String>,
    pub model: String,
    pub endpoint: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: Money,
    pub total_latency_ms: f64,
    pub proxy_overhead_ms: f64,
    pub time_to_first_byte_ms: Option<f64>,
    pub http_status: u16,
    pub error_text: Option<String>,
    pub loop_detected: bool,
    pub similarity_score: Option<f64>,
    pub dlp_triggered: bool,
    pub dlp_action: Option<String>,
    pub message_preview: String,
    pub response_preview: String,
    pub caller_ip: Option<String>,
    pub caller_user_agent: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Three ceilings plus an alert threshold and an auto-kill flag. All
/// monetary comparisons are strict `>` — equality does not exceed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetPolicy {
    pub per_run_limit: Money,
    pub daily_limit: Money,
    pub monthly_limit: Money,
    pub alert_threshold: Money,
    pub auto_kill_enabled: bool,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            per_run_limit: Money::from_dollars_f64(10.0),
            daily_limit: Money::from_dollars_f64(100.0),
            monthly_limit: Money::from_dollars_f64(3000.0),
            alert_threshold: Money::from_dollars_f64(5.0),
            auto_kill_enabled: true,
        }
    }
}

/// Canonical upstream provider configuration: base URL, credential
/// reference, and any extra headers the provider's wire protocol expects
/// (e.g. OpenRouter's `HTTP-Referer`/`X-Title`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default)]
    pub extra_headers: Vec<(String, String)>,
}

/// Identity extracted from the identity service's verdict on a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub team_id: String,
    pub api_key_id: Option<String>,
    pub max_steps: Option<u32>,
    pub daily_budget: Option<Money>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_on_overflow() {
        let mut ring: Ring<i32> = Ring::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        let vals: Vec<i32> = ring.iter().copied().collect();
        assert_eq!(vals, vec![2, 3, 4]);
    }

    #[test]
    fn ring_last_n_is_newest_first_order_preserving() {
        let mut ring: Ring<i32> = Ring::new(5);
        for i in 0..5 {
            ring.push(i);
        }
        let last3: Vec<i32> = ring.last_n(3).into_iter().copied().collect();
        assert_eq!(last3, vec![2, 3, 4]);
    }
}

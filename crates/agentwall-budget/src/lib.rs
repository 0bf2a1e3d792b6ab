//! Budget gate (component C5): a pure decision function, no I/O, no
//! suspension. Everything the gate needs — the incremental cost, the
//! team's daily/monthly running totals, and the policy — is supplied by
//! the caller; the gate itself holds no state.

use agentwall_core::{BudgetPolicy, Money};
use serde::{Deserialize, Serialize};

/// Which ceiling tripped, if any. Precedence when evaluating is
/// per-run, then daily, then monthly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceededLimit {
    PerRun,
    Daily,
    Monthly,
}

impl std::fmt::Display for ExceededLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExceededLimit::PerRun => "per_run",
            ExceededLimit::Daily => "daily",
            ExceededLimit::Monthly => "monthly",
        };
        write!(f, "{s}")
    }
}

/// Outcome of evaluating a budget check.
#[derive(Debug, Clone)]
pub struct BudgetDecision {
    /// Whether the pipeline should kill the run. `false` even when a
    /// limit is exceeded if `policy.auto_kill_enabled` is off — in that
    /// case the caller should still warn, just not kill.
    pub should_kill: bool,
    pub exceeded: Option<ExceededLimit>,
    pub reason: Option<String>,
    pub current_cost: Money,
    pub limit: Option<Money>,
}

impl BudgetDecision {
    fn allow(current_cost: Money) -> Self {
        Self {
            should_kill: false,
            exceeded: None,
            reason: None,
            current_cost,
            limit: None,
        }
    }

    pub fn exceeded_any(&self) -> bool {
        self.exceeded.is_some()
    }
}

/// Evaluate one step's incremental cost against a run's cumulative cost
/// and the team's running daily/monthly totals. Comparisons are strict
/// `>` throughout — equality does not exceed.
///
/// Precedence: per-run first, then `daily_spent + incremental`, then
/// `monthly_spent + incremental`.
pub fn evaluate(
    run_cost: Money,
    incremental_cost: Money,
    daily_spent: Money,
    monthly_spent: Money,
    policy: &BudgetPolicy,
) -> BudgetDecision {
    let total_run_cost = run_cost + incremental_cost;

    if total_run_cost > policy.per_run_limit {
        return BudgetDecision {
            should_kill: policy.auto_kill_enabled,
            exceeded: Some(ExceededLimit::PerRun),
            reason: Some(format!(
                "per-run budget exceeded: {total_run_cost} > {}",
                policy.per_run_limit
            )),
            current_cost: total_run_cost,
            limit: Some(policy.per_run_limit),
        };
    }

    let projected_daily = daily_spent + incremental_cost;
    if projected_daily > policy.daily_limit {
        return BudgetDecision {
            should_kill: policy.auto_kill_enabled,
            exceeded: Some(ExceededLimit::Daily),
            reason: Some(format!(
                "daily budget exceeded: {projected_daily} > {}",
                policy.daily_limit
            )),
            current_cost: total_run_cost,
            limit: Some(policy.daily_limit),
        };
    }

    let projected_monthly = monthly_spent + incremental_cost;
    if projected_monthly > policy.monthly_limit {
        return BudgetDecision {
            should_kill: policy.auto_kill_enabled,
            exceeded: Some(ExceededLimit::Monthly),
            reason: Some(format!(
                "monthly budget exceeded: {projected_monthly} > {}",
                policy.monthly_limit
            )),
            current_cost: total_run_cost,
            limit: Some(policy.monthly_limit),
        };
    }

    BudgetDecision::allow(total_run_cost)
}

/// Whether `cost` crosses the policy's alert threshold — advisory only,
/// never gates admission.
pub fn should_alert(cost: Money, policy: &BudgetPolicy) -> bool {
    cost > policy.alert_threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BudgetPolicy {
        BudgetPolicy {
            per_run_limit: Money::from_dollars_f64(10.0),
            daily_limit: Money::from_dollars_f64(100.0),
            monthly_limit: Money::from_dollars_f64(3000.0),
            alert_threshold: Money::from_dollars_f64(5.0),
            auto_kill_enabled: true,
        }
    }

    #[test]
    fn within_all_limits_is_not_kill() {
        let decision = evaluate(
            Money::ZERO,
            Money::from_dollars_f64(1.0),
            Money::from_dollars_f64(10.0),
            Money::from_dollars_f64(100.0),
            &policy(),
        );
        assert!(!decision.should_kill);
        assert!(!decision.exceeded_any());
    }

    #[test]
    fn equality_does_not_exceed() {
        let p = policy();
        let decision = evaluate(Money::ZERO, p.per_run_limit, Money::ZERO, Money::ZERO, &p);
        assert!(!decision.exceeded_any());
    }

    #[test]
    fn per_run_limit_takes_precedence() {
        let p = policy();
        let over_run = p.per_run_limit + Money::from_dollars_f64(0.01);
        let decision = evaluate(Money::ZERO, over_run, Money::ZERO, Money::ZERO, &p);
        assert_eq!(decision.exceeded, Some(ExceededLimit::PerRun));
        assert!(decision.should_kill);
    }

    #[test]
    fn daily_limit_checked_after_per_run_passes() {
        let p = policy();
        let decision = evaluate(
            Money::ZERO,
            Money::from_dollars_f64(1.0),
            p.daily_limit,
            Money::ZERO,
            &p,
        );
        assert_eq!(decision.exceeded, Some(ExceededLimit::Daily));
    }

    #[test]
    fn monthly_limit_checked_last() {
        let p = policy();
        let decision = evaluate(
            Money::ZERO,
            Money::from_dollars_f64(1.0),
            Money::ZERO,
            p.monthly_limit,
            &p,
        );
        assert_eq!(decision.exceeded, Some(ExceededLimit::Monthly));
    }

    #[test]
    fn auto_kill_disabled_still_reports_exceeded_but_does_not_kill() {
        let mut p = policy();
        p.auto_kill_enabled = false;
        let over_run = p.per_run_limit + Money::from_dollars_f64(0.01);
        let decision = evaluate(Money::ZERO, over_run, Money::ZERO, Money::ZERO, &p);
        assert!(decision.exceeded_any());
        assert!(!decision.should_kill);
    }

    #[test]
    fn alert_threshold_is_advisory() {
        let p = policy();
        assert!(should_alert(Money::from_dollars_f64(6.0), &p));
        assert!(!should_alert(Money::from_dollars_f64(1.0), &p));
    }
}

//! Safety gate for mutating actions
//!
//! Order of evaluation:
//!
//! 1. the compiled-in [`Guard`]: a hit is DANGEROUS, no model is asked;
//! 2. the fast classifier;
//! 3. for a non-SAFE fast verdict, the escalation classifier, whose verdict
//!    replaces the fast one.
//!
//! A classifier that errors yields SUSPICIOUS rather than failing open or
//! closed. Classifier spend is recorded in the ledger as `model` cost.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::BackendError;
use crate::config::{SafetyConfig, SuspiciousPolicy};
use crate::event::digest;
use crate::guard::Guard;
use crate::ledger::CostLedger;
use crate::types::{truncate_chars, CostCategory, TaskId, Verdict};

/// A tool call awaiting a verdict
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedAction {
    pub tool: String,
    pub args: Value,
}

impl ProposedAction {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }

    pub fn describe(&self) -> String {
        format!("{}({})", self.tool, truncate_chars(&self.args.to_string(), 2_000))
    }
}

/// One classifier's answer
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub verdict: Verdict,
    pub reasoning: String,
    pub model: String,
    pub cost: Decimal,
}

/// A model that labels proposed actions
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        context: &str,
        action: &ProposedAction,
    ) -> Result<Assessment, BackendError>;
}

/// Spend incurred while evaluating
#[derive(Debug, Clone, PartialEq)]
pub struct Charge {
    pub model: String,
    pub amount: Decimal,
}

/// Gate outcome for one action
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub verdict: Verdict,
    pub reasoning: String,
    /// The escalation tier produced the final verdict.
    pub escalated: bool,
    /// Blocked by the built-in guard.
    pub guarded: bool,
    pub charges: Vec<Charge>,
}

impl Decision {
    pub fn permits(&self, policy: SuspiciousPolicy) -> bool {
        match self.verdict {
            Verdict::Safe => true,
            Verdict::Suspicious => policy == SuspiciousPolicy::WarnThenProceed,
            Verdict::Dangerous => false,
        }
    }
}

/// Proof that the gate approved one exact call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clearance {
    tool: String,
    args_digest: String,
}

impl Clearance {
    pub(crate) fn issue(tool: &str, args: &Value) -> Self {
        Self {
            tool: tool.to_string(),
            args_digest: digest(&args.to_string()),
        }
    }

    pub(crate) fn covers(&self, tool: &str, args: &Value) -> bool {
        self.tool == tool && self.args_digest == digest(&args.to_string())
    }
}

pub struct SafetyGate {
    fast: Arc<dyn Classifier>,
    deep: Option<Arc<dyn Classifier>>,
    guard: Guard,
    policy: SuspiciousPolicy,
    escalate: bool,
    ledger: Arc<CostLedger>,
}

impl SafetyGate {
    pub fn new(fast: Arc<dyn Classifier>, ledger: Arc<CostLedger>, config: &SafetyConfig) -> Self {
        Self {
            fast,
            deep: None,
            guard: Guard::new(&config.extra_protected),
            policy: config.suspicious_policy,
            escalate: config.escalate,
            ledger,
        }
    }

    pub fn with_escalation(mut self, deep: Arc<dyn Classifier>) -> Self {
        self.deep = Some(deep);
        self
    }

    pub fn policy(&self) -> SuspiciousPolicy {
        self.policy
    }

    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    /// Classify `action`. Never fails; an unreachable evaluator is SUSPICIOUS.
    pub async fn evaluate(
        &self,
        task_id: Option<TaskId>,
        context: &str,
        action: &ProposedAction,
    ) -> Decision {
        if let Some(hit) = self.guard.violation(&action.args) {
            warn!(tool = %action.tool, protected = hit, "action blocked by built-in guard");
            return Decision {
                verdict: Verdict::Dangerous,
                reasoning: format!("action touches protected resource '{hit}'"),
                escalated: false,
                guarded: true,
                charges: Vec::new(),
            };
        }

        let mut charges = Vec::new();
        let (mut verdict, mut reasoning) = match self.fast.classify(context, action).await {
            Ok(a) => {
                self.charge(task_id, &a, &mut charges);
                (a.verdict, a.reasoning)
            }
            Err(e) => {
                warn!(tool = %action.tool, error = %e, "fast safety check failed");
                (Verdict::Suspicious, format!("safety check unavailable: {e}"))
            }
        };
        debug!(tool = %action.tool, %verdict, "fast safety verdict");

        let mut escalated = false;
        if verdict != Verdict::Safe && self.escalate {
            if let Some(deep) = &self.deep {
                match deep.classify(context, action).await {
                    Ok(a) => {
                        self.charge(task_id, &a, &mut charges);
                        if a.verdict != verdict {
                            info!(tool = %action.tool, from = %verdict, to = %a.verdict, "escalation revised verdict");
                        }
                        verdict = a.verdict;
                        reasoning = a.reasoning;
                        escalated = true;
                    }
                    Err(e) => {
                        warn!(tool = %action.tool, error = %e, "escalation safety check failed");
                        reasoning = format!("{reasoning} (escalation unavailable: {e})");
                    }
                }
            }
        }

        Decision {
            verdict,
            reasoning,
            escalated,
            guarded: false,
            charges,
        }
    }

    /// Clearance for `action` if `decision` permits it under the policy.
    pub fn clear(&self, decision: &Decision, action: &ProposedAction) -> Option<Clearance> {
        decision
            .permits(self.policy)
            .then(|| Clearance::issue(&action.tool, &action.args))
    }

    fn charge(&self, task_id: Option<TaskId>, a: &Assessment, charges: &mut Vec<Charge>) {
        if a.cost.is_zero() {
            return;
        }
        if let Err(e) = self.ledger.record(&a.model, CostCategory::Model, a.cost, task_id) {
            warn!(model = %a.model, error = %e, "failed to record safety check cost");
            return;
        }
        charges.push(Charge {
            model: a.model.clone(),
            amount: a.cost,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedClassifier;
    use serde_json::json;
    use std::str::FromStr;

    fn build_gate(fast: ScriptedClassifier, deep: Option<ScriptedClassifier>) -> (SafetyGate, Arc<CostLedger>) {
        let ledger = Arc::new(CostLedger::in_memory(Decimal::from(10)));
        let mut gate = SafetyGate::new(Arc::new(fast), Arc::clone(&ledger), &SafetyConfig::default());
        if let Some(deep) = deep {
            gate = gate.with_escalation(Arc::new(deep));
        }
        (gate, ledger)
    }

    fn rm() -> ProposedAction {
        ProposedAction::new("run_shell", json!({"cmd": "rm -rf /"}))
    }

    #[tokio::test]
    async fn test_safe_fast_verdict_skips_escalation() {
        let deep = ScriptedClassifier::verdict(Verdict::Dangerous);
        let deep_calls = deep.calls();
        let (gate, ledger) = build_gate(ScriptedClassifier::verdict(Verdict::Safe), Some(deep));

        let d = gate.evaluate(None, "", &ProposedAction::new("run_shell", json!({"cmd": "ls"}))).await;
        assert_eq!(d.verdict, Verdict::Safe);
        assert!(!d.escalated);
        assert_eq!(deep_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(ledger.spent_by_category(CostCategory::Model), Decimal::from_str("0.001").unwrap());
    }

    #[tokio::test]
    async fn test_escalation_can_overturn_false_positive() {
        let (gate, ledger) = build_gate(
            ScriptedClassifier::verdict(Verdict::Suspicious),
            Some(ScriptedClassifier::verdict(Verdict::Safe)),
        );
        let d = gate.evaluate(Some(TaskId::new()), "", &rm()).await;
        assert_eq!(d.verdict, Verdict::Safe);
        assert!(d.escalated);
        assert_eq!(d.charges.len(), 2);
        assert_eq!(ledger.totals().entries, 2);
    }

    #[tokio::test]
    async fn test_errors_yield_suspicious() {
        let (gate, _) = build_gate(ScriptedClassifier::failing(), None);
        let d = gate.evaluate(None, "", &rm()).await;
        assert_eq!(d.verdict, Verdict::Suspicious);
        assert!(d.reasoning.contains("unavailable"));

        let (gate, _) = build_gate(
            ScriptedClassifier::verdict(Verdict::Dangerous),
            Some(ScriptedClassifier::failing()),
        );
        let d = gate.evaluate(None, "", &rm()).await;
        assert_eq!(d.verdict, Verdict::Dangerous);
        assert!(!d.escalated);
    }

    #[tokio::test]
    async fn test_guard_wins_over_safe_model() {
        let fast = ScriptedClassifier::verdict(Verdict::Safe);
        let calls = fast.calls();
        let (gate, _) = build_gate(fast, None);
        let action = ProposedAction::new("claude_code_edit", json!({"path": "BIBLE.md", "content": ""}));

        let d = gate.evaluate(None, "", &action).await;
        assert_eq!(d.verdict, Verdict::Dangerous);
        assert!(d.guarded);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(gate.clear(&d, &action).is_none());
    }

    #[test]
    fn test_policy() {
        let suspicious = Decision {
            verdict: Verdict::Suspicious,
            reasoning: String::new(),
            escalated: false,
            guarded: false,
            charges: Vec::new(),
        };
        assert!(suspicious.permits(SuspiciousPolicy::WarnThenProceed));
        assert!(!suspicious.permits(SuspiciousPolicy::BlockThenConfirm));
    }
}

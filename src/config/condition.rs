//! Condition evaluation (spec §3.6 `Condition` action, §9 Open Question 2).
//!
//! The condition-expression *grammar and evaluator* (matching headers,
//! request fields, IPs, regex back-references against a parsed directive
//! like `req.path =~ "^/api"`) is an explicitly out-of-scope external
//! collaborator (spec §1): the core only needs a narrow seam to evaluate
//! whatever condition a plugin compiled, and to thread the resulting regex
//! captures onto the VR's regex stack (spec §3.6).
//!
//! Spec §9 Open Question 2 flags that the source's `condition_check_eval_ip`
//! has unintentional-looking fall-through between its `IP` and `NOTIP`
//! arms. [`ConditionEval`] sidesteps the whole class of bug by returning a
//! single `bool` per evaluation — there is no shared mutable match state for
//! an `IP`/`NOTIP` pair to fall through between; each condition is its own
//! independent evaluation.

use std::fmt;
use std::sync::Arc;

use crate::vrequest::VRequest;

/// A `(start, end)` byte-offset capture from a regex-bearing condition, or
/// `None` for an unmatched optional group (spec: "regex captures pushed to
/// regex stack, popped on frame exit").
pub type Capture = Option<(usize, usize)>;

/// The result of evaluating a [`Condition`] against a VR.
pub struct ConditionOutcome {
    pub matched: bool,
    pub captures: Vec<Capture>,
}

impl ConditionOutcome {
    /// A plain boolean outcome with no captures.
    pub fn simple(matched: bool) -> ConditionOutcome {
        ConditionOutcome {
            matched,
            captures: Vec::new(),
        }
    }
}

/// Pluggable condition evaluator, supplied by the (out-of-scope)
/// condition-expression compiler (spec §3.6 `Condition` action kind).
pub trait ConditionEval: Send + Sync {
    /// Evaluate this condition against `vr`, producing a match verdict and
    /// any regex captures to push onto the VR's regex stack.
    fn evaluate(&self, vr: &VRequest) -> ConditionOutcome;

    /// A short, diagnostic-only label (e.g. `"req.path =~ ..."`).
    fn describe(&self) -> &str {
        "condition"
    }
}

/// A compiled condition node (spec `liCondition`): a named evaluator plus
/// the `target`/`target_else` branch wiring lives on the owning
/// [`super::action::Action::Condition`], not here — `Condition` itself is
/// just the predicate.
pub struct Condition {
    eval: Arc<dyn ConditionEval>,
}

impl Condition {
    pub fn new(eval: Arc<dyn ConditionEval>) -> Condition {
        Condition { eval }
    }

    pub fn evaluate(&self, vr: &VRequest) -> ConditionOutcome {
        self.eval.evaluate(vr)
    }

    pub fn evaluator(&self) -> &Arc<dyn ConditionEval> {
        &self.eval
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Condition({})", self.eval.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysTrue;
    impl ConditionEval for AlwaysTrue {
        fn evaluate(&self, _vr: &VRequest) -> ConditionOutcome {
            ConditionOutcome::simple(true)
        }
    }

    #[test]
    fn simple_outcome_carries_no_captures() {
        let outcome = ConditionOutcome::simple(true);
        assert!(outcome.matched);
        assert!(outcome.captures.is_empty());
    }
}

//! Action tree (spec §3.6): the compiled form of the configuration
//! language, executed by a VR's [`super::action_stack::ActionStack`].
//!
//! Every node kind from spec §3.6 is a variant here. `Function` and
//! `Condition` are the two genuinely pluggable seams (spec §9 "Dynamic
//! dispatch... these become traits"): the core supplies the execution
//! contract (`ActionResult`, the action-stack bookkeeping), and individual
//! content handlers / condition compilers (explicitly out of scope, spec
//! §1) supply the trait implementations.

use std::fmt;
use std::sync::Arc;

use super::condition::Condition;
use super::value::Value;
use crate::balancer::Balancer;
use crate::vrequest::VRequest;

/// Outcome of running one [`ActionFunc`] (spec §3.6, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionResult {
    /// Done; advance to the next action.
    GoOn,
    /// Re-run this same action immediately (same loop turn).
    Comeback,
    /// Suspend; the VR will be re-posted by a collaborator calling
    /// `joblist_append` (spec §4.5).
    WaitForEvent,
    /// Unwind the action stack (spec §4.5 `Error`).
    Error,
}

/// A user-defined handler installed at an [`Action::Function`] node (spec
/// §3.6 `(func, cleanup, free, param)`).
pub trait ActionFunc: Send + Sync {
    /// Run once per visit to this action node. `param` is the action's own
    /// configuration payload (the source's `void *param`).
    fn execute(&self, vr: &mut VRequest, param: &Value) -> ActionResult;

    /// Run when the action stack unwinds through this frame on error (spec
    /// §7 "VR cleanup invokes every action's cleanup callback").
    fn cleanup(&self, _vr: &mut VRequest, _param: &Value) {}

    /// Diagnostic name (the source's `ri->name`).
    fn name(&self) -> &str {
        "function"
    }
}

/// A node in the compiled action tree (spec §3.6 `Action`).
pub enum Action {
    /// Assign an option value into the VR directly.
    Setting { index: usize, value: Value },
    /// Assign a ref-counted option value into the VR (acquire/release on
    /// install/reset).
    SettingPtr { index: usize, value: Arc<Value> },
    /// A user-defined handler.
    Function {
        func: Arc<dyn ActionFunc>,
        param: Value,
    },
    /// Evaluate `cond`; continue into `target` on match, `target_else`
    /// (if any) otherwise.
    Condition {
        cond: Arc<Condition>,
        target: Arc<Action>,
        target_else: Option<Arc<Action>>,
    },
    /// Children executed in order.
    List(Vec<Arc<Action>>),
    /// Select among backend sub-actions (spec §4.11).
    Balancer(Arc<Balancer>),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Setting { index, .. } => write!(f, "Setting(#{})", index),
            Action::SettingPtr { index, .. } => write!(f, "SettingPtr(#{})", index),
            Action::Function { func, .. } => write!(f, "Function({})", func.name()),
            Action::Condition { cond, .. } => write!(f, "Condition({:?})", cond),
            Action::List(children) => write!(f, "List[{}]", children.len()),
            Action::Balancer(_) => write!(f, "Balancer"),
        }
    }
}

impl Action {
    /// Build a `List` action from already-compiled children.
    pub fn list(children: Vec<Arc<Action>>) -> Arc<Action> {
        Arc::new(Action::List(children))
    }

    /// Build a `Setting` action.
    pub fn setting(index: usize, value: Value) -> Arc<Action> {
        Arc::new(Action::Setting { index, value })
    }

    /// Build a `Function` action.
    pub fn function(func: Arc<dyn ActionFunc>, param: Value) -> Arc<Action> {
        Arc::new(Action::Function { func, param })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl ActionFunc for Noop {
        fn execute(&self, _vr: &mut VRequest, _param: &Value) -> ActionResult {
            ActionResult::GoOn
        }
    }

    #[test]
    fn list_constructor_holds_children_in_order() {
        let a = Action::setting(0, Value::Number(1));
        let b = Action::setting(1, Value::Number(2));
        let list = Action::list(vec![a, b]);
        match &*list {
            Action::List(children) => assert_eq!(children.len(), 2),
            _ => panic!("expected a list"),
        }
    }

    #[test]
    fn function_action_carries_its_name() {
        let action = Action::function(Arc::new(Noop), Value::None);
        match &*action {
            Action::Function { func, .. } => assert_eq!(func.name(), "function"),
            _ => panic!("expected a function action"),
        }
    }
}

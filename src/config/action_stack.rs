//! Action stack (spec §3.6, §4.5): the per-VR execution state for the
//! compiled action tree, plus the regex-capture stack that rides alongside
//! it across nested conditions.
//!
//! Modeled as an explicit `Vec`-backed stack rather than recursion so a
//! [`ActionResult::WaitForEvent`]/`Comeback` can suspend mid-tree and a
//! later re-entry resumes exactly where it left off (spec invariant: "at
//! any suspension point the action stack accurately represents the VR's
//! remaining config work; re-entry resumes where it left off").

use std::sync::Arc;
use std::time::Instant;

use super::action::{Action, ActionFunc, ActionResult};
use super::condition::Capture;
use crate::balancer::{BackendError, Balancer, SelectOutcome};
use crate::event_loop::job::JobRef;
use crate::vrequest::VRequest;

enum Entry {
    /// An action node plus, for `List`, the index of the next child to run.
    Node(Arc<Action>, usize),
    /// Marks the point at which a `Condition`'s capture frame should be
    /// popped off the regex stack (spec: "popped on frame exit").
    PopRegex,
    /// Marks the point at which a dispatched backend's balancer frame
    /// should be told the request finished (spec §4.11 `finished()`,
    /// §3.6 "backend stack kept alive until backend finishes").
    PopBackend(Arc<Balancer>, usize),
}

/// Per-VR action-execution state (spec §3.6 `liActionStack`).
pub struct ActionStack {
    entries: Vec<Entry>,
    regex_stack: Vec<Vec<Capture>>,
}

impl Default for ActionStack {
    fn default() -> Self {
        ActionStack::new()
    }
}

impl ActionStack {
    pub fn new() -> ActionStack {
        ActionStack {
            entries: Vec::new(),
            regex_stack: Vec::new(),
        }
    }

    /// Push a fresh root action (spec: entering `HandleRequestHeaders`
    /// pushes the compiled `main_action` tree's root).
    pub fn push_root(&mut self, action: Arc<Action>) {
        self.entries.push(Entry::Node(action, 0));
    }

    /// True once every frame has completed (no config work remains).
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discard all state, e.g. on VR reset for keep-alive reuse.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.regex_stack.clear();
    }

    /// The innermost active regex capture group, if any condition with
    /// captures is currently in scope.
    pub fn current_captures(&self) -> Option<&[Capture]> {
        self.regex_stack.last().map(|v| v.as_slice())
    }

    /// Run (or resume) the action stack until it suspends, errors, or
    /// drains (spec §4.5 action-execution rules).
    pub fn run(&mut self, vr: &mut VRequest, now: Instant, job: &JobRef) -> ActionResult {
        loop {
            let top = match self.entries.pop() {
                Some(entry) => entry,
                None => return ActionResult::GoOn,
            };
            match top {
                Entry::PopRegex => {
                    self.regex_stack.pop();
                }
                Entry::PopBackend(bal, idx) => {
                    bal.finished(idx);
                }
                Entry::Node(action, list_pos) => match self.run_node(vr, now, job, &action, list_pos) {
                    NodeOutcome::Continue => {}
                    NodeOutcome::Suspend(result) => return result,
                },
            }
        }
    }

    fn run_node(
        &mut self,
        vr: &mut VRequest,
        now: Instant,
        job: &JobRef,
        action: &Arc<Action>,
        list_pos: usize,
    ) -> NodeOutcome {
        match &**action {
            Action::List(children) => {
                if let Some(child) = children.get(list_pos) {
                    self.entries.push(Entry::Node(action.clone(), list_pos + 1));
                    self.entries.push(Entry::Node(child.clone(), 0));
                }
                NodeOutcome::Continue
            }
            Action::Setting { index, value } => {
                vr.set_option(*index, value.clone());
                NodeOutcome::Continue
            }
            Action::SettingPtr { index, value } => {
                vr.set_option_ptr(*index, value.clone());
                NodeOutcome::Continue
            }
            Action::Function { func, param } => self.run_function(vr, action, list_pos, func, param),
            Action::Condition {
                cond,
                target,
                target_else,
            } => {
                let outcome = cond.evaluate(vr);
                if outcome.matched {
                    self.regex_stack.push(outcome.captures);
                    self.entries.push(Entry::PopRegex);
                    self.entries.push(Entry::Node(target.clone(), 0));
                } else if let Some(else_branch) = target_else {
                    self.entries.push(Entry::Node(else_branch.clone(), 0));
                }
                NodeOutcome::Continue
            }
            Action::Balancer(bal) => self.run_balancer(vr, action, bal, job),
        }
    }

    fn run_function(
        &mut self,
        vr: &mut VRequest,
        action: &Arc<Action>,
        list_pos: usize,
        func: &Arc<dyn ActionFunc>,
        param: &super::value::Value,
    ) -> NodeOutcome {
        match func.execute(vr, param) {
            ActionResult::GoOn => NodeOutcome::Continue,
            ActionResult::Comeback => {
                self.entries.push(Entry::Node(action.clone(), list_pos));
                NodeOutcome::Suspend(ActionResult::Comeback)
            }
            ActionResult::WaitForEvent => {
                self.entries.push(Entry::Node(action.clone(), list_pos));
                NodeOutcome::Suspend(ActionResult::WaitForEvent)
            }
            ActionResult::Error => {
                // A backend dispatched by a balancer reporting failure is
                // routed back into `fallback()` + re-select rather than a
                // full stack unwind (spec §4.11).
                if let (Some(err), Some(&Entry::PopBackend(..))) =
                    (vr.take_pending_backend_error(), self.entries.last())
                {
                    if let Entry::PopBackend(bal, idx) = self.entries.pop().unwrap() {
                        bal.fallback(idx, err, Instant::now());
                        self.entries.push(Entry::Node(Arc::new(Action::Balancer(bal)), 0));
                        return NodeOutcome::Continue;
                    }
                }
                NodeOutcome::Suspend(ActionResult::Error)
            }
        }
    }

    fn run_balancer(&mut self, vr: &mut VRequest, action: &Arc<Action>, bal: &Arc<Balancer>, job: &JobRef) -> NodeOutcome {
        match bal.select(job.clone()) {
            SelectOutcome::Dispatch(idx) => {
                vr.set_selected_backend(idx);
                self.entries.push(Entry::PopBackend(bal.clone(), idx));
                self.entries.push(Entry::Node(bal.backend_action(idx), 0));
                NodeOutcome::Continue
            }
            SelectOutcome::Parked => {
                // Re-push this same node so the wake-up triggered by
                // `Balancer::tick`'s backlog drain (spec §4.11) resumes by
                // re-running `select`, not by falling off the stack into a
                // spurious `GoOn`.
                self.entries.push(Entry::Node(action.clone(), 0));
                NodeOutcome::Suspend(ActionResult::WaitForEvent)
            }
            SelectOutcome::Rejected => {
                vr.fail_backend(if bal.backend_count() == 0 {
                    BackendError::Dead
                } else {
                    BackendError::Overload
                });
                NodeOutcome::Suspend(ActionResult::Error)
            }
        }
    }

    /// Unwind every remaining frame on error, running each `Function`
    /// frame's `cleanup` callback (spec §7: "VR cleanup invokes every
    /// action's cleanup callback").
    pub fn unwind_error(&mut self, vr: &mut VRequest) {
        for entry in self.entries.drain(..).rev() {
            if let Entry::Node(action, _) = entry {
                if let Action::Function { func, param } = &*action {
                    func.cleanup(vr, param);
                }
            }
        }
        self.regex_stack.clear();
    }
}

enum NodeOutcome {
    Continue,
    Suspend(ActionResult),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::value::Value;
    use std::cell::Cell;
    use std::rc::Rc;

    struct SetAndGoOn(usize);
    impl ActionFunc for SetAndGoOn {
        fn execute(&self, vr: &mut VRequest, _param: &Value) -> ActionResult {
            vr.set_option(self.0, Value::Number(1));
            ActionResult::GoOn
        }
    }

    struct WaitOnce {
        waited: Cell<bool>,
    }
    impl ActionFunc for WaitOnce {
        fn execute(&self, _vr: &mut VRequest, _param: &Value) -> ActionResult {
            if self.waited.replace(true) {
                ActionResult::GoOn
            } else {
                ActionResult::WaitForEvent
            }
        }
    }

    fn make_job() -> JobRef {
        let q = crate::event_loop::job::JobQueue::new(std::sync::Arc::new(tokio::sync::Notify::new()));
        struct Noop;
        impl crate::event_loop::job::Job for Noop {
            fn run(&self) {}
        }
        q.register(Rc::new(Noop))
    }

    #[test]
    fn list_runs_children_in_order() {
        let mut vr = VRequest::new_for_test();
        let mut stack = ActionStack::new();
        let list = Action::list(vec![Action::setting(0, Value::Number(1)), Action::setting(1, Value::Number(2))]);
        stack.push_root(list);
        let job = make_job();
        assert_eq!(stack.run(&mut vr, Instant::now(), &job), ActionResult::GoOn);
        assert!(stack.is_empty());
        assert_eq!(vr.option(0).as_number(), Some(1));
        assert_eq!(vr.option(1).as_number(), Some(2));
    }

    #[test]
    fn function_wait_for_event_suspends_and_resumes_at_the_same_node() {
        let mut vr = VRequest::new_for_test();
        let mut stack = ActionStack::new();
        let action = Action::function(Arc::new(WaitOnce { waited: Cell::new(false) }), Value::None);
        stack.push_root(action);
        let job = make_job();

        assert_eq!(stack.run(&mut vr, Instant::now(), &job), ActionResult::WaitForEvent);
        assert!(!stack.is_empty());
        assert_eq!(stack.run(&mut vr, Instant::now(), &job), ActionResult::GoOn);
        assert!(stack.is_empty());
    }

    #[test]
    fn unwind_runs_cleanup_on_a_frame_still_parked_on_wait_for_event() {
        struct WaitForeverWithCleanup(Rc<Cell<bool>>);
        impl ActionFunc for WaitForeverWithCleanup {
            fn execute(&self, _vr: &mut VRequest, _param: &Value) -> ActionResult {
                ActionResult::WaitForEvent
            }
            fn cleanup(&self, _vr: &mut VRequest, _param: &Value) {
                self.0.set(true);
            }
        }

        let mut vr = VRequest::new_for_test();
        let mut stack = ActionStack::new();
        let cleaned = Rc::new(Cell::new(false));
        stack.push_root(Action::function(Arc::new(WaitForeverWithCleanup(cleaned.clone())), Value::None));
        let job = make_job();

        assert_eq!(stack.run(&mut vr, Instant::now(), &job), ActionResult::WaitForEvent);
        assert!(!stack.is_empty());

        stack.unwind_error(&mut vr);
        assert!(cleaned.get());
        assert!(stack.is_empty());
    }

    #[test]
    fn parked_balancer_reselects_on_resume_instead_of_falling_through() {
        use crate::balancer::{BalancePolicy, BackendError, Balancer};

        let backend = Action::function(Arc::new(SetAndGoOn(0)), Value::None);
        let bal = Arc::new(Balancer::new(BalancePolicy::Sqf, vec![backend], 8));
        bal.fallback(0, BackendError::Dead, std::time::Instant::now());

        let mut vr = VRequest::new_for_test();
        let mut stack = ActionStack::new();
        stack.push_root(Arc::new(Action::Balancer(bal.clone())));
        let job = make_job();

        assert_eq!(stack.run(&mut vr, Instant::now(), &job), ActionResult::WaitForEvent);
        assert!(!stack.is_empty(), "the balancer node must stay on the stack while parked");
        assert_eq!(bal.backlog_len(), 1);

        // The backend recovers and the backlog drains (spec §4.11 `tick`).
        let now = Instant::now() + crate::balancer::DEAD_WAKE;
        let woken = bal.tick(now);
        assert_eq!(woken.len(), 1);

        // Resuming must re-run `select` and actually dispatch the backend,
        // not drain to a spurious `GoOn` with the request unhandled.
        assert_eq!(stack.run(&mut vr, now, &job), ActionResult::GoOn);
        assert_eq!(vr.option(0).as_number(), Some(1));
        assert_eq!(vr.selected_backend(), Some(0));
    }
}

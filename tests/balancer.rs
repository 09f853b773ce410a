//! End-to-end balancer backlog scenario (spec §8 S3, testable property 5):
//! two backends start `Down`; once both recover, every VR parked on the
//! backlog is dispatched — driven through the real [`ActionStack`] rather
//! than calling [`Balancer`] methods directly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use lighttpd2_core::balancer::{BackendError, BalancePolicy, Balancer, DEAD_WAKE};
use lighttpd2_core::config::value::Value;
use lighttpd2_core::config::{Action, ActionFunc, ActionResult, ActionStack};
use lighttpd2_core::event_loop::job::{Job, JobQueue};
use lighttpd2_core::vrequest::VRequest;

struct CountingBackend(Arc<AtomicUsize>);
impl ActionFunc for CountingBackend {
    fn execute(&self, _vr: &mut VRequest, _param: &Value) -> ActionResult {
        self.0.fetch_add(1, Ordering::SeqCst);
        ActionResult::GoOn
    }
}

struct Noop;
impl Job for Noop {
    fn run(&self) {}
}

fn make_job() -> lighttpd2_core::event_loop::job::JobRef {
    let queue = JobQueue::new(Arc::new(tokio::sync::Notify::new()));
    let job = queue.register(std::rc::Rc::new(Noop));
    // The test only needs the `JobRef` handle, not the queue it came from.
    std::mem::forget(queue);
    job
}

#[test]
fn s3_two_parked_requests_dispatch_once_both_backends_recover() {
    let served = Arc::new(AtomicUsize::new(0));
    let backend = Action::function(Arc::new(CountingBackend(served.clone())), Value::None);
    let balancer = Arc::new(Balancer::new(BalancePolicy::Sqf, vec![backend.clone(), backend], 8));

    let start = Instant::now();
    balancer.fallback(0, BackendError::Dead, start);
    balancer.fallback(1, BackendError::Dead, start);

    // Two requests arrive while both backends are down; both must park.
    let mut vr_a = VRequest::new_for_test();
    let mut stack_a = ActionStack::new();
    stack_a.push_root(Arc::new(Action::Balancer(balancer.clone())));
    let job_a = make_job();
    assert_eq!(stack_a.run(&mut vr_a, start, &job_a), ActionResult::WaitForEvent);

    let mut vr_b = VRequest::new_for_test();
    let mut stack_b = ActionStack::new();
    stack_b.push_root(Arc::new(Action::Balancer(balancer.clone())));
    let job_b = make_job();
    assert_eq!(stack_b.run(&mut vr_b, start, &job_b), ActionResult::WaitForEvent);

    assert_eq!(balancer.backlog_len(), 2);
    assert_eq!(served.load(Ordering::SeqCst), 0);

    // 1 second later both backends recover; the reactivation tick wakes
    // both parked requests (spec: "reactivating n = max(1, backends/2)").
    let recovered_at = start + DEAD_WAKE;
    let woken = balancer.tick(recovered_at);
    assert_eq!(woken.len(), 2, "both backlog entries should be released in one sweep");
    assert_eq!(balancer.backlog_len(), 0);

    assert_eq!(stack_a.run(&mut vr_a, recovered_at, &job_a), ActionResult::GoOn);
    assert_eq!(stack_b.run(&mut vr_b, recovered_at, &job_b), ActionResult::GoOn);

    assert_eq!(served.load(Ordering::SeqCst), 2, "both parked requests must actually reach the backend");
    assert!(vr_a.selected_backend().is_some());
    assert!(vr_b.selected_backend().is_some());
}

//! Virtual request (spec §3.4, §4.5): the per-request state machine that
//! drives one request/response pair through the compiled action tree and
//! the stream graph.
//!
//! A VR does not own a socket; it owns request/response metadata, the
//! option vectors a config action tree writes into, and the handful of
//! stream endpoints (backend source/drain, filter chain) that get wired
//! together as the request progresses. [`Connection`](crate::connection)
//! is the thing that owns a VR and feeds it bytes.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use crate::balancer::BackendError;
use crate::config::{Action, ActionResult, ActionStack, Value};
use crate::event_loop::job::JobRef;
use crate::stat_cache::StatResult;
use crate::stream::StreamRef;

/// Method + version + URI + headers, as handed off by the (out-of-scope,
/// spec §1) HTTP parser.
#[derive(Debug, Clone, Default)]
pub struct RequestData {
    pub method: String,
    pub http_version_11: bool,
    pub uri_raw: String,
    pub uri_path: String,
    pub uri_query: String,
    pub headers: Vec<(String, String)>,
    pub content_length: Option<u64>,
}

impl RequestData {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status + headers to be written back, assembled either by core catch-all
/// handling (spec §4.5 "unhandled request" path) or by a content handler.
#[derive(Debug, Clone, Default)]
pub struct ResponseData {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// Resolved filesystem mapping for this request (spec §4.9).
#[derive(Debug, Clone, Default)]
pub struct PhysicalData {
    pub doc_root: String,
    pub path: String,
    pub pathinfo: String,
}

/// A case-insensitive string environment (spec §3.4 `vr->env`, CGI-style
/// `REQUEST_METHOD`/`SCRIPT_NAME` entries handed to a backend).
#[derive(Debug, Clone, Default)]
pub struct Environment(HashMap<String, String>);

impl Environment {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_uppercase()).map(|s| s.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_ascii_uppercase(), value.into());
    }

    pub fn remove(&mut self, key: &str) {
        self.0.remove(&key.to_ascii_uppercase());
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// The connection-level facts a VR reads but does not own (spec §3.4
/// `coninfo`): remote/local address, TLS-ness, and the keep-alive request
/// counter the core decrements into `Connection-close` decisions.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub remote_addr: String,
    pub local_addr: String,
    pub is_ssl: bool,
    pub keep_alive_requests: u64,
}

impl Default for ConnInfo {
    fn default() -> ConnInfo {
        ConnInfo {
            remote_addr: String::new(),
            local_addr: String::new(),
            is_ssl: false,
            keep_alive_requests: 0,
        }
    }
}

/// Where a VR is in its lifecycle (spec §4.5 state diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VrState {
    /// Reset and awaiting a parsed request.
    Clean,
    /// Running the action tree against request headers.
    HandleRequestHeaders,
    /// Request body streaming to whichever backend claimed the VR.
    ReadContent,
    /// Wiring the output filter chain against the (now known) response.
    HandleResponseHeaders,
    /// Response body streaming back to the connection.
    WriteContent,
    /// Terminal: the action stack has been unwound.
    Error,
}

/// A single virtual request (spec §3.4 `liVRequest`).
pub struct VRequest {
    pub state: VrState,
    pub request: RequestData,
    pub response: ResponseData,
    pub physical: PhysicalData,
    pub env: Environment,
    pub coninfo: Option<Rc<RefCell<ConnInfo>>>,

    options: Vec<Value>,
    option_ptrs: Vec<Option<Arc<Value>>>,
    plugin_contexts: Vec<Option<Box<dyn Any>>>,

    is_direct: bool,
    is_indirect: bool,
    upgraded: bool,
    headers_ready: bool,
    backend_plugin: Option<usize>,
    selected_backend: Option<usize>,
    pending_backend_error: Option<BackendError>,

    pub backend_source: Option<StreamRef>,
    pub backend_drain: Option<StreamRef>,
    filters_in_first: Option<StreamRef>,
    filters_in_last: Option<StreamRef>,
    filters_out_first: Option<StreamRef>,
    filters_out_last: Option<StreamRef>,

    stat_cache_entries: Vec<Rc<StatResult>>,
    action_stack: ActionStack,
    job: JobRef,
}

impl VRequest {
    /// Build a fresh VR, already registered on `job` so collaborators can
    /// `joblist_append` it back onto the worker's queue (spec §4.5).
    pub fn new(job: JobRef) -> VRequest {
        VRequest {
            state: VrState::Clean,
            request: RequestData::default(),
            response: ResponseData::default(),
            physical: PhysicalData::default(),
            env: Environment::default(),
            coninfo: None,
            options: Vec::new(),
            option_ptrs: Vec::new(),
            plugin_contexts: Vec::new(),
            is_direct: false,
            is_indirect: false,
            upgraded: false,
            headers_ready: false,
            backend_plugin: None,
            selected_backend: None,
            pending_backend_error: None,
            backend_source: None,
            backend_drain: None,
            filters_in_first: None,
            filters_in_last: None,
            filters_out_first: None,
            filters_out_last: None,
            stat_cache_entries: Vec::new(),
            action_stack: ActionStack::new(),
            job,
        }
    }

    /// A VR with a throwaway job registration, for unit tests that never
    /// exercise cross-thread wakeups.
    pub fn new_for_test() -> VRequest {
        let queue = crate::event_loop::job::JobQueue::new(std::sync::Arc::new(tokio::sync::Notify::new()));
        struct Noop;
        impl crate::event_loop::job::Job for Noop {
            fn run(&self) {}
        }
        let job = queue.register(Rc::new(Noop));
        // Leak the queue deliberately: `JobRef::async_signal` only needs the
        // channel sender to stay alive, and this constructor exists purely
        // for short-lived unit tests.
        std::mem::forget(queue);
        VRequest::new(job)
    }

    /// Reset to `Clean` for keep-alive reuse (spec §4.7): request/response
    /// state and the action stack are discarded, the owning connection's
    /// TCP state is untouched.
    pub fn reset(&mut self) {
        self.state = VrState::Clean;
        self.request = RequestData::default();
        self.response = ResponseData::default();
        self.physical = PhysicalData::default();
        self.env.clear();
        self.options.clear();
        self.option_ptrs.clear();
        self.plugin_contexts.clear();
        self.is_direct = false;
        self.is_indirect = false;
        self.upgraded = false;
        self.headers_ready = false;
        self.backend_plugin = None;
        self.selected_backend = None;
        self.pending_backend_error = None;
        self.backend_source = None;
        self.backend_drain = None;
        self.filters_in_first = None;
        self.filters_in_last = None;
        self.filters_out_first = None;
        self.filters_out_last = None;
        self.stat_cache_entries.clear();
        self.action_stack.clear();
    }

    pub fn job(&self) -> &JobRef {
        &self.job
    }

    pub fn selected_backend(&self) -> Option<usize> {
        self.selected_backend
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }

    // -- option vectors (spec §3.4 `options`/`optionptrs`) --------------

    pub fn set_option(&mut self, index: usize, value: Value) {
        if self.options.len() <= index {
            self.options.resize(index + 1, Value::None);
        }
        self.options[index] = value;
    }

    pub fn option(&self, index: usize) -> &Value {
        self.options.get(index).unwrap_or(&Value::None)
    }

    pub fn set_option_ptr(&mut self, index: usize, value: Arc<Value>) {
        if self.option_ptrs.len() <= index {
            self.option_ptrs.resize(index + 1, None);
        }
        self.option_ptrs[index] = Some(value);
    }

    pub fn option_ptr(&self, index: usize) -> Option<&Arc<Value>> {
        self.option_ptrs.get(index).and_then(|o| o.as_ref())
    }

    // -- plugin context vector (spec §3.4 `plugin_ctx`) ------------------

    pub fn plugin_context<T: 'static>(&self, plugin_id: usize) -> Option<&T> {
        self.plugin_contexts.get(plugin_id).and_then(|slot| slot.as_ref()).and_then(|boxed| boxed.downcast_ref())
    }

    pub fn set_plugin_context<T: 'static>(&mut self, plugin_id: usize, value: T) {
        if self.plugin_contexts.len() <= plugin_id {
            self.plugin_contexts.resize_with(plugin_id + 1, || None);
        }
        self.plugin_contexts[plugin_id] = Some(Box::new(value));
    }

    pub fn clear_plugin_context(&mut self, plugin_id: usize) {
        if let Some(slot) = self.plugin_contexts.get_mut(plugin_id) {
            *slot = None;
        }
    }

    // -- stat cache handles held open for this request's lifetime -------

    pub fn hold_stat_entry(&mut self, entry: Rc<StatResult>) {
        self.stat_cache_entries.push(entry);
    }

    // -- request ownership (spec §4.5 "handled directly / indirectly") --

    /// Take ownership of the response directly (core catch-all handling,
    /// or a plugin answering without a backend stream).
    pub fn handle_direct(&mut self) -> Result<(), crate::Error> {
        if self.is_indirect {
            return Err(crate::Error::internal("vrequest already claimed indirectly"));
        }
        self.is_direct = true;
        self.headers_ready = true;
        Ok(())
    }

    /// Hand ownership to a backend plugin (spec: `handle_indirect`); the
    /// plugin must later call [`indirect_connect`](Self::indirect_connect)
    /// and [`indirect_headers_ready`](Self::indirect_headers_ready).
    pub fn handle_indirect(&mut self, plugin_id: usize) -> Result<(), crate::Error> {
        if self.is_direct || self.is_indirect {
            return Err(crate::Error::internal("vrequest already claimed"));
        }
        self.is_indirect = true;
        self.backend_plugin = Some(plugin_id);
        Ok(())
    }

    /// Wire the backend's drain/source streams in (request body flows into
    /// `drain`, response body flows out of `source`).
    pub fn indirect_connect(&mut self, drain: StreamRef, source: StreamRef) {
        self.backend_drain = Some(drain);
        self.backend_source = Some(source);
    }

    /// The backend has produced response headers; the VR may advance past
    /// `HandleRequestHeaders`/`ReadContent`.
    pub fn indirect_headers_ready(&mut self) {
        self.headers_ready = true;
    }

    /// Promote this VR to a raw bidirectional byte pipe (spec: protocol
    /// upgrade, e.g. WebSocket); bypasses further response-header handling.
    pub fn connection_upgrade(&mut self, drain: StreamRef, source: StreamRef) {
        self.upgraded = true;
        self.backend_drain = Some(drain);
        self.backend_source = Some(source);
        self.headers_ready = true;
    }

    pub fn is_handled(&self) -> bool {
        self.is_direct || self.is_indirect
    }

    // -- filter chain (spec §4.6) ----------------------------------------

    pub fn add_input_filter(&mut self, filter: StreamRef) {
        match self.filters_in_last.take() {
            Some(last) => {
                StreamRef::connect(&last, &filter);
                self.filters_in_last = Some(filter);
            }
            None => {
                self.filters_in_first = Some(filter.clone());
                self.filters_in_last = Some(filter);
            }
        }
    }

    pub fn add_output_filter(&mut self, filter: StreamRef) {
        match self.filters_out_last.take() {
            Some(last) => {
                StreamRef::connect(&last, &filter);
                self.filters_out_last = Some(filter);
            }
            None => {
                self.filters_out_first = Some(filter.clone());
                self.filters_out_last = Some(filter);
            }
        }
    }

    pub fn input_filter_head(&self) -> Option<StreamRef> {
        self.filters_in_first.clone()
    }

    /// The stream a connection should actually read the response body
    /// from: the end of the output filter chain if any filters were
    /// added, otherwise the backend's source directly.
    pub fn effective_output(&self) -> Option<StreamRef> {
        self.filters_out_last.clone().or_else(|| self.backend_source.clone())
    }

    fn connect_output_chain(&mut self) {
        if let (Some(source), Some(first)) = (self.backend_source.clone(), self.filters_out_first.clone()) {
            StreamRef::connect(&source, &first);
        }
    }

    // -- balancer integration (spec §4.11) -------------------------------

    pub fn set_selected_backend(&mut self, idx: usize) {
        self.selected_backend = Some(idx);
    }

    pub fn fail_backend(&mut self, error: BackendError) {
        self.pending_backend_error = Some(error);
    }

    pub fn take_pending_backend_error(&mut self) -> Option<BackendError> {
        self.pending_backend_error.take()
    }

    // -- action tree driving ----------------------------------------------

    /// Start a fresh pass through the compiled action tree (spec: entering
    /// `HandleRequestHeaders` pushes the root of `main_action`).
    pub fn start_request(&mut self, root: Arc<Action>) {
        self.state = VrState::HandleRequestHeaders;
        self.action_stack.push_root(root);
    }

    /// Drive the VR's state machine until it suspends, errors, or fully
    /// drains (spec §4.5). Safe to call repeatedly; re-entry after
    /// `WaitForEvent` resumes exactly where the action stack left off.
    pub fn run_state_machine(&mut self, now: Instant) -> ActionResult {
        loop {
            match self.state {
                VrState::Clean => return ActionResult::GoOn,
                VrState::HandleRequestHeaders => match self.run_action_stack(now) {
                    ActionResult::GoOn => {
                        if !self.is_handled() {
                            self.apply_catch_all();
                        }
                        if self.is_indirect && !self.headers_ready {
                            return ActionResult::GoOn;
                        }
                        self.state = VrState::ReadContent;
                    }
                    ActionResult::Comeback => continue,
                    ActionResult::WaitForEvent => return ActionResult::WaitForEvent,
                    ActionResult::Error => {
                        self.enter_error();
                        return ActionResult::Error;
                    }
                },
                VrState::ReadContent => {
                    // The request body (if any) flows straight into
                    // `backend_drain`; no further action-tree re-entry
                    // happens until the backend signals response headers.
                    if self.headers_ready {
                        self.state = VrState::HandleResponseHeaders;
                    } else {
                        return ActionResult::GoOn;
                    }
                }
                VrState::HandleResponseHeaders => {
                    self.connect_output_chain();
                    self.state = VrState::WriteContent;
                }
                VrState::WriteContent => return ActionResult::GoOn,
                VrState::Error => return ActionResult::Error,
            }
        }
    }

    fn run_action_stack(&mut self, now: Instant) -> ActionResult {
        let job = self.job.clone();
        let mut stack = std::mem::take(&mut self.action_stack);
        let result = stack.run(self, now, &job);
        self.action_stack = stack;
        result
    }

    /// Unhandled after the action tree drained: synthesize a response the
    /// way the source's core does (spec §4.5 "204/404 for unmatched
    /// requests, `OPTIONS *` answered directly").
    fn apply_catch_all(&mut self) {
        if self.request.method.eq_ignore_ascii_case("OPTIONS") && self.request.uri_path == "*" {
            self.response.status = 200;
            self.response.headers.push(("Allow".to_string(), "OPTIONS, GET, HEAD, POST".to_string()));
        } else {
            self.response.status = 404;
        }
        let _ = self.handle_direct();
    }

    fn enter_error(&mut self) {
        self.state = VrState::Error;
        let mut stack = std::mem::take(&mut self.action_stack);
        stack.unwind_error(self);
        self.action_stack = stack;
        if let Some(source) = self.backend_source.take() {
            StreamRef::reset(&source);
        }
        if let Some(drain) = self.backend_drain.take() {
            StreamRef::reset(&drain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::value::Value;

    #[test]
    fn fresh_vr_starts_clean_and_unhandled() {
        let vr = VRequest::new_for_test();
        assert_eq!(vr.state, VrState::Clean);
        assert!(!vr.is_handled());
    }

    #[test]
    fn option_vector_grows_to_fit_sparse_indices() {
        let mut vr = VRequest::new_for_test();
        vr.set_option(4, Value::Number(9));
        assert_eq!(vr.option(4).as_number(), Some(9));
        assert_eq!(vr.option(0).as_number(), None);
    }

    #[test]
    fn handle_direct_then_indirect_is_rejected() {
        let mut vr = VRequest::new_for_test();
        vr.handle_direct().unwrap();
        assert!(vr.handle_indirect(0).is_err());
    }

    #[test]
    fn unhandled_options_star_gets_a_200_with_allow() {
        let mut vr = VRequest::new_for_test();
        vr.request.method = "OPTIONS".to_string();
        vr.request.uri_path = "*".to_string();
        vr.start_request(Action::list(vec![]));
        let result = vr.run_state_machine(Instant::now());
        assert_eq!(result, ActionResult::GoOn);
        assert_eq!(vr.response.status, 200);
        assert_eq!(vr.state, VrState::WriteContent);
    }

    #[test]
    fn unhandled_plain_request_gets_a_404() {
        let mut vr = VRequest::new_for_test();
        vr.request.method = "GET".to_string();
        vr.request.uri_path = "/missing".to_string();
        vr.start_request(Action::list(vec![]));
        vr.run_state_machine(Instant::now());
        assert_eq!(vr.response.status, 404);
    }

    #[test]
    fn indirect_handler_parks_the_vr_until_headers_ready() {
        let mut vr = VRequest::new_for_test();
        vr.start_request(Action::function(
            Arc::new(ClaimIndirect),
            Value::None,
        ));
        let result = vr.run_state_machine(Instant::now());
        assert_eq!(result, ActionResult::GoOn);
        assert_eq!(vr.state, VrState::HandleRequestHeaders);

        vr.indirect_headers_ready();
        let result = vr.run_state_machine(Instant::now());
        assert_eq!(result, ActionResult::GoOn);
        assert_eq!(vr.state, VrState::WriteContent);
    }

    struct ClaimIndirect;
    impl crate::config::ActionFunc for ClaimIndirect {
        fn execute(&self, vr: &mut VRequest, _param: &Value) -> ActionResult {
            vr.handle_indirect(0).unwrap();
            ActionResult::GoOn
        }
    }

    #[test]
    fn reset_clears_request_state_for_keep_alive_reuse() {
        let mut vr = VRequest::new_for_test();
        vr.request.method = "GET".to_string();
        vr.set_option(0, Value::Number(1));
        vr.handle_direct().unwrap();
        vr.reset();
        assert_eq!(vr.state, VrState::Clean);
        assert_eq!(vr.request.method, "");
        assert_eq!(vr.option(0).as_number(), None);
        assert!(!vr.is_handled());
    }
}

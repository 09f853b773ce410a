//! Connection (spec §3.5, §4.7): per-TCP-connection state — the socket, the
//! optional PROXY-protocol/SNI/TLS filter stages in front of it, and the one
//! [`VRequest`] it hosts at a time.
//!
//! The HTTP/1.1 request-line/header parser is an out-of-scope external
//! collaborator (spec §1: "assumed to exist as a 'given string → parsed
//! request' service"). [`RequestDecoder`] is the contract this module
//! requires from it: feed it the bytes that have made it through the
//! filter chain, get back "need more", a parsed [`RequestData`], or a
//! protocol error. This crate does not ship an RFC 7230 implementation of
//! that trait; callers plug one in.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use crate::chunk::ChunkQueue;
use crate::config::{Action, ActionResult};
use crate::error::Error;
use crate::event_loop::job::JobRef;
use crate::io_stream::IoStream;
use crate::proxy_protocol;
use crate::sni::SniFilter;
use crate::stream::{StreamRef, plug::Plug};
use crate::vrequest::{ConnInfo, RequestData, VRequest, VrState};

#[cfg(feature = "tls")]
use crate::tls_filter::TlsFilter;
#[cfg(feature = "tls")]
use rustls::ServerConfig;

/// A sensible floor for how many requests one connection serves before the
/// core forces a close regardless of what the request/response headers ask
/// for. The source makes this a config directive (`keep_alive_requests`);
/// the exact default is implementation-defined, so we pick the commonly
/// used 1000 (spec §3.5 `info.keep_alive_requests`).
pub const DEFAULT_KEEP_ALIVE_REQUESTS: u64 = 1000;

/// Connection-level lifecycle state (spec §3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Dead,
    KeepAlive,
    RequestStart,
    ReadRequestHeader,
    HandleMainVR,
    Write,
}

/// What the external HTTP/1.1 parser hands back each time [`Connection`]
/// feeds it newly arrived, already-filtered bytes.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// Not enough bytes yet to determine anything; call again once more
    /// data has arrived.
    NeedMoreData,
    /// A full request line + header block was recognized. `consumed` bytes
    /// should be skipped off the front of the input queue; anything left
    /// over is the start of the request body (or the next pipelined
    /// request, if `content_length` is `None`/zero and more bytes follow).
    Complete { request: RequestData, consumed: u64 },
    /// The bytes seen so far can never form a valid request (spec §7
    /// `ProtocolInvalid`).
    Error(&'static str),
}

/// The boundary `Connection` requires from the (out-of-scope) HTTP/1.1
/// request-line/header parser service.
pub trait RequestDecoder {
    /// Attempt to decode a request head from whatever is resident in
    /// `input`. Must not consume bytes itself — `Connection` does that
    /// based on `consumed` once a `Complete` comes back, after copying out
    /// anything the decoder needs.
    fn decode(&mut self, input: &mut ChunkQueue) -> DecodeOutcome;

    /// Drop any partial-parse state for keep-alive reuse (spec §4.7
    /// "per-connection parser state is reset; TCP socket is retained").
    fn reset(&mut self);
}

/// Worker keep-alive deque linkage + per-connection idle timer (spec §3.5
/// `keep_alive_data`). The deque itself lives on the worker; this is the
/// per-connection half of that link.
#[derive(Debug, Clone, Copy)]
pub struct KeepAliveData {
    pub deadline: Instant,
}

/// 5-second rolling `bytes_in`/`bytes_out` (supplemented feature, spec §4.8
/// stats watcher + `original_source/src/connection.c` `info.stats`):
/// an exponentially-windowed counter, refreshed once per second by the
/// worker's stats watcher, not by the connection itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnStats {
    pub bytes_in_total: u64,
    pub bytes_out_total: u64,
    avg_in_per_sec: f64,
    avg_out_per_sec: f64,
}

impl ConnStats {
    /// 1Hz decay constant for a 5-second rolling window.
    const DECAY: f64 = 0.2;

    pub fn record_in(&mut self, n: u64) {
        self.bytes_in_total += n;
    }

    pub fn record_out(&mut self, n: u64) {
        self.bytes_out_total += n;
    }

    /// Called once per second by the worker's stats watcher with the bytes
    /// moved since the previous tick.
    pub fn tick(&mut self, in_since_last: u64, out_since_last: u64) {
        self.avg_in_per_sec += (in_since_last as f64 - self.avg_in_per_sec) * Self::DECAY;
        self.avg_out_per_sec += (out_since_last as f64 - self.avg_out_per_sec) * Self::DECAY;
    }

    pub fn bytes_in_per_5s(&self) -> f64 {
        self.avg_in_per_sec * 5.0
    }

    pub fn bytes_out_per_5s(&self) -> f64 {
        self.avg_out_per_sec * 5.0
    }
}

/// A single TCP connection and the one [`VRequest`] it hosts at a time
/// (spec §3.5 `liConnection`).
pub struct Connection {
    pub io: IoStream,
    proxy_filter: Option<StreamRef>,
    sni_filter: Option<SniFilter>,
    #[cfg(feature = "tls")]
    tls_filter: Option<TlsFilter>,
    /// End of the input filter chain: decrypted, PROXY/SNI-stripped bytes
    /// land here (spec §4.7 read path).
    read_head: StreamRef,
    /// A stable `Plug` that always forwards into whatever the write side of
    /// the transport is (`io.stream_out`, or a TLS filter's `plain_drain`).
    /// Status-line/header bytes are pushed directly into it; the VR's
    /// response body is connected as its source per request.
    response_head: StreamRef,

    pub mainvr: VRequest,
    pub info: Rc<RefCell<ConnInfo>>,
    pub stats: ConnStats,
    pub state: ConnState,
    pub keep_alive: Option<KeepAliveData>,
    io_timeout_token: Rc<()>,

    decoder: Box<dyn RequestDecoder>,
    response_head_sent: bool,
    pending_keep_alive: bool,
    request_body_remaining: u64,
}

impl Connection {
    fn assemble(
        socket: TcpStream,
        job: JobRef,
        decoder: Box<dyn RequestDecoder>,
        use_proxy_protocol: bool,
        is_ssl: bool,
    ) -> (Connection, StreamRef, StreamRef) {
        let io = IoStream::new(socket);
        let mut head = io.stream_in.clone();

        let proxy_filter = if use_proxy_protocol {
            let filter = proxy_protocol::new_filter(None);
            StreamRef::connect(&head, &filter);
            head = filter.clone();
            Some(filter)
        } else {
            None
        };

        let mut info = ConnInfo::default();
        info.is_ssl = is_ssl;
        info.keep_alive_requests = DEFAULT_KEEP_ALIVE_REQUESTS;
        let info = Rc::new(RefCell::new(info));

        let response_head = Plug::new("connection-response-head");
        let mut mainvr = VRequest::new(job);
        mainvr.coninfo = Some(info.clone());

        let conn = Connection {
            io,
            proxy_filter,
            sni_filter: None,
            #[cfg(feature = "tls")]
            tls_filter: None,
            read_head: head.clone(),
            response_head: response_head.clone(),
            mainvr,
            info,
            stats: ConnStats::default(),
            state: ConnState::RequestStart,
            keep_alive: None,
            io_timeout_token: IoStream::new_io_timeout_token(),
            decoder,
            response_head_sent: false,
            pending_keep_alive: false,
            request_body_remaining: 0,
        };
        (conn, head, response_head)
    }

    /// Build a plaintext (or PROXY-protocol-wrapped) connection (spec §4.7
    /// read path, non-TLS branch).
    pub fn new(socket: TcpStream, job: JobRef, decoder: Box<dyn RequestDecoder>, use_proxy_protocol: bool) -> Connection {
        let (mut conn, _head, response_head) = Self::assemble(socket, job, decoder, use_proxy_protocol, false);
        StreamRef::connect(&response_head, &conn.io.stream_out);
        conn
    }

    /// Build a TLS connection: bytes flow PROXY-filter (optional) → SNI
    /// scan → TLS decrypt → `read_head`, and responses flow the other way
    /// through the TLS encrypt stage (spec §4.7, §4.14).
    #[cfg(feature = "tls")]
    pub fn new_tls(
        socket: TcpStream,
        job: JobRef,
        decoder: Box<dyn RequestDecoder>,
        use_proxy_protocol: bool,
        tls_config: Arc<ServerConfig>,
        on_sni: impl Fn(&str) + 'static,
    ) -> Result<Connection, rustls::Error> {
        let (mut conn, head, response_head) = Self::assemble(socket, job, decoder, use_proxy_protocol, true);

        let sni = SniFilter::new(on_sni);
        StreamRef::connect(&head, &sni.stream);

        let tls = TlsFilter::new(tls_config, |_source: &StreamRef, _drain: &StreamRef| {})?;
        StreamRef::connect(&sni.stream, &tls.cipher_drain);
        StreamRef::connect(&tls.cipher_source, &conn.io.stream_out);
        StreamRef::connect(&response_head, &tls.plain_drain);

        conn.read_head = tls.plain_source.clone();
        conn.sni_filter = Some(sni);
        conn.tls_filter = Some(tls);
        Ok(conn)
    }

    /// The wait-queue token this connection registers on the worker's
    /// IO-timeout queue (spec §3.5 `io_timeout_elem`); every read/write
    /// should retract and re-push it (spec §4.7).
    pub fn io_timeout_token(&self) -> Rc<()> {
        self.io_timeout_token.clone()
    }

    /// Record the peer's address once the worker has it from `accept()`.
    pub fn set_remote_addr(&self, remote_addr: String, local_addr: String) {
        let mut info = self.info.borrow_mut();
        info.remote_addr = remote_addr;
        info.local_addr = local_addr;
    }

    /// Pump one read-readiness event off the socket, tracking stats.
    /// Returns `Ok(0)` on EOF.
    pub async fn pump_read(&mut self) -> std::io::Result<usize> {
        let n = self.io.pump_read().await?;
        self.stats.record_in(n as u64);
        Ok(n)
    }

    /// Pump one write-readiness event, tracking stats.
    pub async fn pump_write(&mut self) -> std::io::Result<usize> {
        let n = self.io.pump_write().await?;
        self.stats.record_out(n as u64);
        Ok(n)
    }

    /// Try to decode a request head out of whatever has arrived so far
    /// (spec §4.7 read path: "IOStream.stream_in delivers bytes to a
    /// parser"). Returns `Ok(true)` once a full request head is ready for
    /// [`begin_request`](Self::begin_request), `Ok(false)` if more bytes
    /// are needed.
    pub fn feed_parser(&mut self) -> Result<bool, Error> {
        if self.state == ConnState::KeepAlive {
            self.wake_from_keep_alive();
        }
        if !matches!(self.state, ConnState::RequestStart | ConnState::ReadRequestHeader) {
            return Ok(false);
        }
        self.state = ConnState::ReadRequestHeader;

        let outcome = {
            let mut input = self.read_head.out();
            self.decoder.decode(&mut input)
        };
        match outcome {
            DecodeOutcome::NeedMoreData => Ok(false),
            DecodeOutcome::Error(reason) => Err(Error::protocol_invalid(reason)),
            DecodeOutcome::Complete { request, consumed } => {
                self.read_head.out().skip(consumed);
                self.request_body_remaining = request.content_length.unwrap_or(0);
                self.mainvr.request = request;
                Ok(true)
            }
        }
    }

    /// Start the action tree against the now-parsed request (spec §4.7
    /// "ReadRequestHeader → HandleMainVR").
    pub fn begin_request(&mut self, root_action: Arc<Action>, now: Instant) -> ActionResult {
        self.state = ConnState::HandleMainVR;
        self.mainvr.start_request(root_action);
        self.drive(now)
    }

    /// Re-enter the VR state machine after a suspended action resumes
    /// (spec §4.2 `joblist_append` re-entry), also forwarding any request
    /// body bytes that have arrived in the meantime.
    pub fn resume(&mut self, now: Instant) -> ActionResult {
        self.pump_request_body();
        self.drive(now)
    }

    fn drive(&mut self, now: Instant) -> ActionResult {
        let result = self.mainvr.run_state_machine(now);
        self.pump_request_body();
        if self.mainvr.state == VrState::WriteContent && !self.response_head_sent {
            self.state = ConnState::Write;
            self.send_response_head();
        }
        result
    }

    /// Forward request-body bytes sitting in `read_head` to the backend's
    /// drain, up to `Content-Length` (spec §4.5 `ReadContent`: "request body
    /// flows... handled by the backend selected during HandleRequestHeaders").
    /// Chunked request bodies are not demarcated here — only `Content-Length`
    /// framing (the HTTP parser contract doesn't hand back chunk boundaries).
    fn pump_request_body(&mut self) {
        let Some(drain) = self.mainvr.backend_drain.clone() else {
            return;
        };
        if self.request_body_remaining == 0 {
            if !drain.out().is_closed {
                drain.out().is_closed = true;
                StreamRef::notify(&drain);
            }
            return;
        }
        let moved = {
            let mut src = self.read_head.out();
            let available = src.length().min(self.request_body_remaining);
            if available == 0 {
                return;
            }
            let mut dst = drain.out();
            ChunkQueue::steal_len(&mut dst, &mut src, available)
        };
        self.request_body_remaining -= moved;
        StreamRef::notify(&drain);
        if self.request_body_remaining == 0 {
            drain.out().is_closed = true;
            StreamRef::notify(&drain);
        }
    }

    /// Write the status line + headers directly into `response_head`, then
    /// wire the VR's body stream in as its source (spec §4.5
    /// `HandleResponseHeaders`: "connect backend_source -> filters_out_first
    /// ... if direct response: backend_source.out is pre-closed").
    fn send_response_head(&mut self) {
        let keep_alive = self.decide_keep_alive();
        self.pending_keep_alive = keep_alive;

        let head_bytes = encode_response_head(&self.mainvr.response, self.mainvr.request.http_version_11, keep_alive);
        self.response_head.out().append_mem(head_bytes);
        StreamRef::notify(&self.response_head);

        match self.mainvr.effective_output() {
            Some(body) => StreamRef::connect(&body, &self.response_head),
            None => {
                self.response_head.out().is_closed = true;
                StreamRef::notify(&self.response_head);
            }
        }
        self.response_head_sent = true;
    }

    fn decide_keep_alive(&self) -> bool {
        if self.mainvr.is_upgraded() {
            return false;
        }
        if self.info.borrow().keep_alive_requests == 0 {
            return false;
        }
        let request_wants_it = request_wants_keep_alive(&self.mainvr.request);
        let response_refuses_it = self
            .mainvr
            .response
            .headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("connection") && v.eq_ignore_ascii_case("close"));
        request_wants_it && !response_refuses_it
    }

    /// True once every byte of the response (headers + body) has made it
    /// all the way through the filter/TLS chain onto the socket's own
    /// write stream (spec §4.7 "response completion").
    pub fn is_write_complete(&self) -> bool {
        self.response_head_sent && self.io.stream_out.out().is_closed && self.io.stream_out.out().is_empty()
    }

    /// On response completion: either re-enter `KeepAlive` with a fresh
    /// idle timer, or mark the connection `Dead` for the worker to close
    /// (spec §4.7 "Connection re-enters KeepAlive... or close").
    pub fn try_enter_keep_alive(&mut self, now: Instant, idle_timeout: Duration) -> bool {
        if !self.pending_keep_alive {
            self.state = ConnState::Dead;
            return false;
        }
        {
            let mut info = self.info.borrow_mut();
            info.keep_alive_requests = info.keep_alive_requests.saturating_sub(1);
        }
        self.reset_for_reuse();
        self.state = ConnState::KeepAlive;
        self.keep_alive = Some(KeepAliveData { deadline: now + idle_timeout });
        true
    }

    fn reset_for_reuse(&mut self) {
        self.mainvr.reset();
        self.decoder.reset();
        self.response_head_sent = false;
        self.pending_keep_alive = false;
        self.request_body_remaining = 0;
        StreamRef::disconnect_source(&self.response_head);
        self.response_head.out().is_closed = false;
    }

    /// Bytes (possibly the next pipelined request) arrived while idle;
    /// fall out of `KeepAlive` back into the read path (spec §4.7).
    pub fn wake_from_keep_alive(&mut self) {
        self.keep_alive = None;
        self.state = ConnState::RequestStart;
    }

    /// The VR's state machine unwound with [`ActionResult::Error`] (spec §7
    /// "On unrecoverable action error: if response headers have not yet
    /// been sent, synthesize a 500 and send it; otherwise the connection
    /// cannot be salvaged and is closed"). `enter_error` already unwound the
    /// action stack's cleanup handlers; this is purely about what the peer
    /// sees on the wire.
    pub fn handle_error(&mut self, now: Instant) -> ActionResult {
        if self.response_head_sent {
            self.state = ConnState::Dead;
            return ActionResult::Error;
        }
        self.mainvr.response.status = 500;
        self.mainvr.response.headers.clear();
        if self.mainvr.handle_direct().is_err() {
            self.state = ConnState::Dead;
            return ActionResult::Error;
        }
        self.mainvr.state = VrState::HandleResponseHeaders;
        self.drive(now)
    }
}

fn request_wants_keep_alive(req: &RequestData) -> bool {
    match req.header("connection") {
        Some(v) if v.eq_ignore_ascii_case("close") => false,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
        _ => req.http_version_11,
    }
}

fn encode_response_head(resp: &crate::vrequest::ResponseData, http_version_11: bool, keep_alive: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(if http_version_11 { b"HTTP/1.1 " } else { b"HTTP/1.0 " });
    out.extend_from_slice(resp.status.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(reason_phrase(resp.status).as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in &resp.headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(if keep_alive { b"Connection: keep-alive\r\n" } else { b"Connection: close\r\n" });
    out.extend_from_slice(b"\r\n");
    out
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::value::Value;
    use crate::config::ActionFunc;
    use tokio::net::{TcpListener, TcpStream};

    /// A test-only stand-in for the out-of-scope HTTP parser: requests are
    /// delimited by a blank line, `METHOD PATH VERSION` on the first line,
    /// `Name: value` after, exactly like real HTTP/1.1 but without any of
    /// the edge cases a real parser must handle (folding, obs-fold, etc).
    /// Exercises the `RequestDecoder` contract only; not a production parser.
    #[derive(Default)]
    struct FixtureDecoder;

    impl RequestDecoder for FixtureDecoder {
        fn decode(&mut self, input: &mut ChunkQueue) -> DecodeOutcome {
            let available = input.length();
            let buf = match input.extract_to_memory(available) {
                Ok(b) => b,
                Err(_) => return DecodeOutcome::NeedMoreData,
            };
            let text = match std::str::from_utf8(&buf) {
                Ok(t) => t,
                Err(_) => return DecodeOutcome::Error("non-utf8 request"),
            };
            let marker = "\r\n\r\n";
            let Some(end) = text.find(marker) else {
                return DecodeOutcome::NeedMoreData;
            };
            let mut lines = text[..end].split("\r\n");
            let Some(first) = lines.next() else {
                return DecodeOutcome::Error("empty request");
            };
            let mut parts = first.split(' ');
            let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
                return DecodeOutcome::Error("malformed request line");
            };
            let mut headers = Vec::new();
            for line in lines {
                if let Some((name, value)) = line.split_once(':') {
                    headers.push((name.trim().to_string(), value.trim().to_string()));
                }
            }
            let content_length = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.parse().ok());
            let request = RequestData {
                method: method.to_string(),
                http_version_11: version == "HTTP/1.1",
                uri_raw: path.to_string(),
                uri_path: path.to_string(),
                uri_query: String::new(),
                headers,
                content_length,
            };
            DecodeOutcome::Complete {
                request,
                consumed: (end + marker.len()) as u64,
            }
        }

        fn reset(&mut self) {}
    }

    struct RespondDirect(u16);
    impl ActionFunc for RespondDirect {
        fn execute(&self, vr: &mut VRequest, _param: &Value) -> ActionResult {
            vr.response.status = self.0;
            vr.handle_direct().unwrap();
            ActionResult::GoOn
        }
    }

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (server, _) = tokio::try_join!(async { Ok::<_, std::io::Error>(listener.accept().await?.0) }, async {
            connect.await
        })
        .unwrap();
        (server, TcpStream::connect(addr).await.unwrap_err_or_panic())
    }

    trait UnwrapErrOrPanic<T> {
        fn unwrap_err_or_panic(self) -> T;
    }
    impl<T> UnwrapErrOrPanic<T> for std::io::Result<T> {
        fn unwrap_err_or_panic(self) -> T {
            self.unwrap()
        }
    }

    fn make_job() -> JobRef {
        let queue = crate::event_loop::job::JobQueue::new(std::sync::Arc::new(tokio::sync::Notify::new()));
        struct Noop;
        impl crate::event_loop::job::Job for Noop {
            fn run(&self) {}
        }
        let job = queue.register(Rc::new(Noop));
        std::mem::forget(queue);
        job
    }

    #[tokio::test]
    async fn parses_a_request_head_and_runs_the_action_tree() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (server, mut client) = tokio::join!(async { listener.accept().await.unwrap().0 }, client);
        let mut client = client.unwrap();

        use tokio::io::AsyncWriteExt;
        client
            .write_all(b"GET /hello HTTP/1.1\r\nHost: example\r\n\r\n")
            .await
            .unwrap();

        let mut conn = Connection::new(server, make_job(), Box::new(FixtureDecoder), false);
        conn.pump_read().await.unwrap();
        assert!(conn.feed_parser().unwrap());
        assert_eq!(conn.mainvr.request.method, "GET");
        assert_eq!(conn.mainvr.request.uri_path, "/hello");
        assert_eq!(conn.state, ConnState::ReadRequestHeader);

        let root = Action::function(std::sync::Arc::new(RespondDirect(200)), Value::None);
        let now = Instant::now();
        let result = conn.begin_request(root, now);
        assert_eq!(result, ActionResult::GoOn);
        assert_eq!(conn.state, ConnState::Write);
        assert!(conn.response_head_sent);
    }

    #[tokio::test]
    async fn keep_alive_reuse_resets_the_vr_and_decrements_the_counter() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (server, client) = tokio::join!(async { listener.accept().await.unwrap().0 }, client);
        let _client = client.unwrap();

        let mut conn = Connection::new(server, make_job(), Box::new(FixtureDecoder), false);
        conn.mainvr.request.http_version_11 = true;
        let root = Action::function(std::sync::Arc::new(RespondDirect(200)), Value::None);
        conn.begin_request(root, Instant::now());
        assert!(conn.decide_keep_alive());

        // Pretend the socket finished flushing.
        conn.io.stream_out.out().is_closed = true;
        let before = conn.info.borrow().keep_alive_requests;
        let reused = conn.try_enter_keep_alive(Instant::now(), Duration::from_secs(5));
        assert!(reused);
        assert_eq!(conn.state, ConnState::KeepAlive);
        assert_eq!(conn.info.borrow().keep_alive_requests, before - 1);
        assert_eq!(conn.mainvr.state, VrState::Clean);
        assert!(!conn.response_head_sent);
    }

    #[tokio::test]
    async fn connection_close_header_forces_the_connection_dead() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (server, client) = tokio::join!(async { listener.accept().await.unwrap().0 }, client);
        let _client = client.unwrap();

        let mut conn = Connection::new(server, make_job(), Box::new(FixtureDecoder), false);
        conn.mainvr.request.http_version_11 = true;
        conn.mainvr.request.headers.push(("Connection".to_string(), "close".to_string()));
        let root = Action::function(std::sync::Arc::new(RespondDirect(200)), Value::None);
        conn.begin_request(root, Instant::now());

        conn.io.stream_out.out().is_closed = true;
        let reused = conn.try_enter_keep_alive(Instant::now(), Duration::from_secs(5));
        assert!(!reused);
        assert_eq!(conn.state, ConnState::Dead);
    }
}

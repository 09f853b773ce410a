//! End-to-end connection scenarios (spec §8 S1, S2, S4): drives
//! [`Connection`] over a real loopback TCP socket with a minimal stand-in
//! for the out-of-scope HTTP/1.1 parser, the same way the teacher's own
//! `tests/server.rs` drives `hyper` over a real listener.

use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use lighttpd2_core::chunk::ChunkQueue;
use lighttpd2_core::config::value::Value;
use lighttpd2_core::config::{Action, ActionFunc, ActionResult};
use lighttpd2_core::connection::{Connection, ConnState, DecodeOutcome, RequestDecoder};
use lighttpd2_core::event_loop::job::{Job, JobQueue, JobRef};
use lighttpd2_core::vrequest::{RequestData, VRequest};

/// Stands in for the out-of-scope HTTP/1.1 request-line/header parser
/// (spec §1): requests are delimited by a blank line, exactly like real
/// HTTP/1.1, minus the edge cases (folding, obs-fold, chunked framing)
/// a production parser must also handle.
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
        let request = RequestData {
            method: method.to_string(),
            http_version_11: version == "HTTP/1.1",
            uri_raw: path.to_string(),
            uri_path: path.to_string(),
            uri_query: String::new(),
            headers,
            content_length: None,
        };
        DecodeOutcome::Complete {
            request,
            consumed: (end + marker.len()) as u64,
        }
    }

    fn reset(&mut self) {}
}

/// An empty `main_action`: nothing handles the request, so the core's
/// catch-all (spec §4.5) decides the response.
fn empty_main_action() -> Arc<Action> {
    Action::list(vec![])
}

struct Noop;
impl Job for Noop {
    fn run(&self) {}
}

fn make_job() -> JobRef {
    let queue = JobQueue::new(Arc::new(tokio::sync::Notify::new()));
    let job = queue.register(Rc::new(Noop));
    std::mem::forget(queue);
    job
}

async fn loopback() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = TcpStream::connect(addr);
    let (server, client) = tokio::join!(async { listener.accept().await.unwrap().0 }, connect);
    (server, client.unwrap())
}

async fn read_response(client: &mut TcpStream) -> String {
    let mut buf = vec![0u8; 4096];
    let n = client.read(&mut buf).await.unwrap();
    buf.truncate(n);
    String::from_utf8(buf).unwrap()
}

#[tokio::test]
async fn s1_simple_get_with_empty_main_action_is_a_404() {
    let (server, mut client) = loopback().await;
    client.write_all(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

    let mut conn = Connection::new(server, make_job(), Box::new(FixtureDecoder), false);
    conn.pump_read().await.unwrap();
    assert!(conn.feed_parser().unwrap());

    conn.begin_request(empty_main_action(), Instant::now());
    conn.pump_write().await.unwrap();

    let response = read_response(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found"), "got: {}", response);
}

#[tokio::test]
async fn s2_options_star_catch_all_lists_the_allowed_methods() {
    let (server, mut client) = loopback().await;
    client.write_all(b"OPTIONS * HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

    let mut conn = Connection::new(server, make_job(), Box::new(FixtureDecoder), false);
    conn.pump_read().await.unwrap();
    assert!(conn.feed_parser().unwrap());

    conn.begin_request(empty_main_action(), Instant::now());
    conn.pump_write().await.unwrap();

    let response = read_response(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("Allow: OPTIONS, GET, HEAD, POST"), "got: {}", response);
}

struct RespondDirect(u16);
impl ActionFunc for RespondDirect {
    fn execute(&self, vr: &mut VRequest, _param: &Value) -> ActionResult {
        vr.response.status = self.0;
        vr.handle_direct().unwrap();
        ActionResult::GoOn
    }
}

#[tokio::test]
async fn s4_pipelined_keep_alive_requests_are_answered_in_order_on_one_socket() {
    let (server, mut client) = loopback().await;
    let mut conn = Connection::new(server, make_job(), Box::new(FixtureDecoder), false);
    let root = Action::function(Arc::new(RespondDirect(200)), Value::None);

    for i in 0..3u16 {
        client
            .write_all(format!("GET /{} HTTP/1.1\r\nHost: x\r\n\r\n", i).as_bytes())
            .await
            .unwrap();

        conn.pump_read().await.unwrap();
        assert!(conn.feed_parser().unwrap(), "request {} should parse", i);
        assert_eq!(conn.mainvr.request.uri_path, format!("/{}", i));

        conn.begin_request(root.clone(), Instant::now());
        assert_eq!(conn.state, ConnState::Write);
        conn.pump_write().await.unwrap();

        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "request {} got: {}", i, response);
        assert!(response.contains("Connection: keep-alive"), "request {} got: {}", i, response);

        let reused = conn.try_enter_keep_alive(Instant::now(), Duration::from_secs(5));
        assert!(reused, "request {} should keep the connection alive", i);
        assert_eq!(conn.state, ConnState::KeepAlive);
    }
}

//! SNI parser (spec §4.13): a read-only streaming scan of a TLS
//! ClientHello that extracts the `server_name` extension without ever
//! touching ciphertext semantics or modifying a byte that passes through.
//!
//! Grounded in the teacher's C sibling `modules/ssl_sni_parser.h`: same
//! record/handshake/extension layering, same "pass everything through
//! unmodified once finished" contract, same three-way result
//! (not-found / found / needs more data). That header parses byte-by-byte
//! against a handful of `guintN` state counters that double up 16-bit TLS
//! length fields as 24-bit shift sequences in a couple of spots (the
//! cipher-suite and extensions length fields are read as `(byte<<16) +
//! byte`, which only happens to work because those fields are vanishingly
//! unlikely to have a nonzero high byte in practice). We parse the actual
//! TLS 1.2 `ClientHello` wire format instead — 16-bit big-endian lengths
//! throughout, as RFC 5246 §7.4.1.2 defines it — since spec testable
//! property 10 asks for a parser that is simply *correct*, not a
//! bug-compatible port. The record/handshake reassembly-across-TLS-records
//! shape (wait for a full record, then a full handshake message, before
//! descending into its fields) is kept as-is.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::stream::{StreamEvent, StreamHandler, StreamRef};
use crate::chunk::ChunkQueue;

const MAX_RECORD_LEN: usize = (1 << 14) + 2048;

/// Outcome of feeding more bytes to the parser (spec `liSSLSniParserResult`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    NotFound,
    Found(String),
    WaitForMore,
}

/// Incremental TLS ClientHello SNI scanner.
pub struct SniParser {
    buf: Vec<u8>,
    result: Option<SniResult>,
}

impl Default for SniParser {
    fn default() -> Self {
        SniParser::new()
    }
}

impl SniParser {
    pub fn new() -> SniParser {
        SniParser { buf: Vec::new(), result: None }
    }

    /// Feed newly-available bytes (append-only; nothing is ever discarded
    /// from `buf` since the original bytes must still be forwarded
    /// unmodified once parsing concludes).
    pub fn feed(&mut self, data: &[u8]) -> SniResult {
        if let Some(r) = &self.result {
            return r.clone();
        }
        self.buf.extend_from_slice(data);
        let r = parse_records(&self.buf);
        if r != SniResult::WaitForMore {
            self.result = Some(r.clone());
        }
        r
    }

    pub fn is_finished(&self) -> bool {
        self.result.is_some()
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return None;
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(s)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|s| u16::from_be_bytes([s[0], s[1]]))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

fn parse_records(buf: &[u8]) -> SniResult {
    let mut handshake = Vec::new();
    let mut cur = 0usize;
    loop {
        if buf.len() < cur + 5 {
            return SniResult::WaitForMore;
        }
        let record_type = buf[cur];
        let record_len = u16::from_be_bytes([buf[cur + 3], buf[cur + 4]]) as usize;
        if record_type != 22 {
            return SniResult::NotFound; // not a handshake record
        }
        if record_len > MAX_RECORD_LEN {
            return SniResult::NotFound;
        }
        if buf.len() < cur + 5 + record_len {
            return SniResult::WaitForMore;
        }
        handshake.extend_from_slice(&buf[cur + 5..cur + 5 + record_len]);
        cur += 5 + record_len;

        if handshake.len() >= 4 {
            if handshake[0] != 1 {
                return SniResult::NotFound; // not a client_hello
            }
            let hs_len = ((handshake[1] as usize) << 16) | ((handshake[2] as usize) << 8) | handshake[3] as usize;
            if handshake.len() >= 4 + hs_len {
                return parse_client_hello_body(&handshake[4..4 + hs_len]);
            }
        }

        if cur >= buf.len() {
            return SniResult::WaitForMore;
        }
    }
}

fn parse_client_hello_body(body: &[u8]) -> SniResult {
    let mut c = Cursor { buf: body, pos: 0 };
    let fail = SniResult::NotFound;

    if c.take(2).is_none() {
        return fail; // client_version
    }
    if c.take(32).is_none() {
        return fail; // random
    }
    let session_id_len = match c.u8() {
        Some(n) => n as usize,
        None => return fail,
    };
    if c.take(session_id_len).is_none() {
        return fail;
    }
    let cipher_len = match c.u16() {
        Some(n) => n as usize,
        None => return fail,
    };
    if cipher_len % 2 != 0 || c.take(cipher_len).is_none() {
        return fail;
    }
    let compression_len = match c.u8() {
        Some(n) => n as usize,
        None => return fail,
    };
    if c.take(compression_len).is_none() {
        return fail;
    }

    if c.remaining() == 0 {
        return fail; // no extensions block at all, so no SNI
    }
    let ext_total_len = match c.u16() {
        Some(n) => n as usize,
        None => return fail,
    };
    let ext_bytes = match c.take(ext_total_len) {
        Some(b) => b,
        None => return fail,
    };

    let mut e = Cursor { buf: ext_bytes, pos: 0 };
    loop {
        if e.remaining() == 0 {
            return fail; // ran out of extensions without finding SNI
        }
        let ext_type = match e.u16() {
            Some(t) => t,
            None => return fail,
        };
        let ext_len = match e.u16() {
            Some(l) => l as usize,
            None => return fail,
        };
        let ext_data = match e.take(ext_len) {
            Some(d) => d,
            None => return fail,
        };
        if ext_type == 0 {
            return parse_server_name_extension(ext_data);
        }
    }
}

fn parse_server_name_extension(data: &[u8]) -> SniResult {
    let mut c = Cursor { buf: data, pos: 0 };
    if c.u16().is_none() {
        return SniResult::NotFound; // server_name_list length
    }
    let name_type = match c.u8() {
        Some(t) => t,
        None => return SniResult::NotFound,
    };
    if name_type != 0 {
        // unknown entry type, and per the source there is no generic way
        // to skip an entry whose length field we don't know the shape of
        return SniResult::NotFound;
    }
    let hostname_len = match c.u16() {
        Some(l) => l as usize,
        None => return SniResult::NotFound,
    };
    let hostname = match c.take(hostname_len) {
        Some(h) => h,
        None => return SniResult::NotFound,
    };
    let raw = match std::str::from_utf8(hostname) {
        Ok(s) => s,
        Err(_) => return SniResult::NotFound,
    };
    match normalize_hostname(raw) {
        Some(name) => SniResult::Found(name),
        None => SniResult::NotFound,
    }
}

#[cfg(feature = "tls")]
fn normalize_hostname(raw: &str) -> Option<String> {
    idna::domain_to_ascii(raw).ok()
}

#[cfg(not(feature = "tls"))]
fn normalize_hostname(raw: &str) -> Option<String> {
    if raw.is_ascii() {
        Some(raw.to_ascii_lowercase())
    } else {
        None
    }
}

struct FilterState {
    parser: RefCell<SniParser>,
    sni_ready: Cell<bool>,
    callback: RefCell<Option<Box<dyn Fn(&str)>>>,
}

impl FilterState {
    fn handle_pending(&self, stream: &StreamRef) {
        if let Some(source) = stream.source() {
            if !self.sni_ready.get() {
                let available = source.out().length();
                let bytes = match source.out().extract_to_memory(available) {
                    Ok(b) => b,
                    Err(_) => Vec::new(),
                };
                match self.parser.borrow_mut().feed(&bytes) {
                    SniResult::Found(name) => {
                        if let Some(cb) = self.callback.borrow().as_ref() {
                            cb(&name);
                        }
                        self.sni_ready.set(true);
                    }
                    SniResult::NotFound => self.sni_ready.set(true),
                    SniResult::WaitForMore => {}
                }
            }
            if self.sni_ready.get() {
                let mut src_out = source.out();
                let mut out = stream.out();
                ChunkQueue::steal_all(&mut out, &mut src_out);
                drop(out);
                drop(src_out);
                StreamRef::notify(stream);
            }
        }
    }

    fn force_ready(&self, stream: &StreamRef) {
        self.sni_ready.set(true);
        self.handle_pending(stream);
    }
}

impl StreamHandler for FilterState {
    fn handle(&self, stream: &StreamRef, event: StreamEvent) {
        match event {
            StreamEvent::NewData => self.handle_pending(stream),
            StreamEvent::DisconnectedDest => {
                self.sni_ready.set(true);
                StreamRef::disconnect(stream);
            }
            StreamEvent::DisconnectedSource => {
                self.sni_ready.set(true);
                StreamRef::disconnect_dest(stream);
            }
            StreamEvent::ConnectedSource | StreamEvent::ConnectedDest | StreamEvent::NewCqLimit | StreamEvent::Destroy => {}
        }
    }
}

/// A stream filter that scans TLS ClientHello bytes for SNI and becomes a
/// transparent pass-through once it has an answer (spec
/// `li_ssn_sni_stream`).
#[derive(Clone)]
pub struct SniFilter {
    pub stream: StreamRef,
    state: Rc<FilterState>,
}

impl SniFilter {
    /// `callback` fires at most once, with the normalized hostname, as soon
    /// as SNI is found.
    pub fn new(callback: impl Fn(&str) + 'static) -> SniFilter {
        let state = Rc::new(FilterState {
            parser: RefCell::new(SniParser::new()),
            sni_ready: Cell::new(false),
            callback: RefCell::new(Some(Box::new(callback))),
        });
        let handler_state = state.clone();
        let stream = StreamRef::new("sni-parser", Box::new(SharedHandler(handler_state)));
        SniFilter { stream, state }
    }

    /// Skip straight to pass-through without waiting for more ClientHello
    /// bytes — used when the caller already knows which TLS context to use
    /// (spec `li_ssn_sni_stream_ready`, e.g. a single-cert listener).
    pub fn force_ready(&self) {
        self.state.force_ready(&self.stream);
    }
}

struct SharedHandler(Rc<FilterState>);

impl StreamHandler for SharedHandler {
    fn handle(&self, stream: &StreamRef, event: StreamEvent) {
        self.0.handle(stream, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tls_record(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![22, 3, 3];
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn client_hello_with_sni(hostname: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[3, 3]); // client_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session_id_len
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher_len
        body.extend_from_slice(&[0x00, 0x2f]);
        body.push(1); // compression_len
        body.push(0);

        let mut sni_ext = Vec::new();
        let name_entry_len = 1 + 2 + hostname.len();
        sni_ext.extend_from_slice(&((name_entry_len) as u16).to_be_bytes()); // server_name_list len
        sni_ext.push(0); // name_type: host_name
        sni_ext.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(hostname.as_bytes());

        let mut ext = Vec::new();
        ext.extend_from_slice(&0u16.to_be_bytes()); // extension type: server_name
        ext.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        ext.extend_from_slice(&sni_ext);

        body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext);

        let mut handshake = vec![1]; // client_hello
        let len = body.len() as u32;
        handshake.push((len >> 16) as u8);
        handshake.push((len >> 8) as u8);
        handshake.push(len as u8);
        handshake.extend_from_slice(&body);

        tls_record(&handshake)
    }

    #[test]
    fn finds_sni_in_a_single_record_client_hello() {
        let mut parser = SniParser::new();
        let record = client_hello_with_sni("example.com");
        assert_eq!(parser.feed(&record), SniResult::Found("example.com".to_string()));
    }

    #[test]
    fn partial_record_asks_for_more_data() {
        let mut parser = SniParser::new();
        let record = client_hello_with_sni("example.com");
        assert_eq!(parser.feed(&record[..10]), SniResult::WaitForMore);
        assert_eq!(parser.feed(&record[10..]), SniResult::Found("example.com".to_string()));
    }

    #[test]
    fn non_handshake_record_is_rejected() {
        let mut parser = SniParser::new();
        let mut record = vec![23, 3, 3]; // application_data, not handshake
        record.extend_from_slice(&5u16.to_be_bytes());
        record.extend_from_slice(b"hello");
        assert_eq!(parser.feed(&record), SniResult::NotFound);
    }

    #[test]
    fn client_hello_with_no_extensions_is_not_found() {
        let mut body = Vec::new();
        body.extend_from_slice(&[3, 3]);
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0x00, 0x2f]);
        body.push(1);
        body.push(0);
        // no extensions block at all

        let mut handshake = vec![1];
        let len = body.len() as u32;
        handshake.push((len >> 16) as u8);
        handshake.push((len >> 8) as u8);
        handshake.push(len as u8);
        handshake.extend_from_slice(&body);

        let mut parser = SniParser::new();
        assert_eq!(parser.feed(&tls_record(&handshake)), SniResult::NotFound);
    }

    #[test]
    fn filter_forwards_bytes_unchanged_after_resolving_sni() {
        use crate::stream::plug::Plug;
        let found = Rc::new(RefCell::new(None));
        let found2 = found.clone();
        let filter = SniFilter::new(move |name| *found2.borrow_mut() = Some(name.to_string()));
        let upstream = Plug::new("upstream");
        StreamRef::connect(&upstream, &filter.stream);

        let mut record = client_hello_with_sni("a.test");
        record.extend_from_slice(b"trailing-app-data");
        upstream.out().append_mem(record.clone());
        StreamRef::notify(&upstream);

        assert_eq!(*found.borrow(), Some("a.test".to_string()));
        let forwarded = filter.stream.out().extract_to_memory(record.len() as u64).unwrap();
        assert_eq!(forwarded, record);
    }
}

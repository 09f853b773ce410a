//! TLS filter (spec §4.14): streaming TLS termination wired into the
//! stream graph as two independent pumps over a shared session, behind the
//! `tls` cargo feature.
//!
//! Grounded in the teacher's C sibling `modules/openssl_filter.c`: the same
//! four-stream shape (`cipher_source`/`cipher_drain` carry ciphertext to and
//! from the socket, `plain_source`/`plain_drain` carry plaintext to and from
//! the application) and the same lazy-handshake-on-first-I/O,
//! latch-and-callback-once-established discipline. Where the C file hand-rolls
//! a `BIO` whose read/write callbacks push and pull a `liChunkQueue`
//! (`stream_bio_read`/`stream_bio_write`), `rustls::ServerConnection`
//! already exposes exactly that shape natively (`read_tls`/`write_tls` for
//! the ciphertext side, `reader()`/`writer()` for the plaintext side), so no
//! adapter shim is needed — this is the one spot where the idiomatic Rust
//! crate (`rustls`, already in the teacher's optional dependency set) makes
//! an entire subsystem (the custom `BIO_METHOD` vtable) disappear rather
//! than needing a translation. The OpenSSL file's manual `SSL_get_error`
//! dispatch across `WANT_READ`/`SYSCALL`/`ZERO_RETURN`/default collapses
//! similarly: `rustls` already returns a typed `rustls::Error`, so there is
//! no per-errno taxonomy left to reconstruct — documented as a deliberate
//! simplification, not a dropped feature.

use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::sync::Arc;

use rustls::{ServerConfig, ServerConnection};

use crate::stream::{StreamEvent, StreamHandler, StreamRef};

/// Fired once the handshake completes, with the two plaintext streams the
/// application should now connect its backend/filter chain to (spec
/// `handshake_cb`).
pub trait TlsHandshakeCallback {
    fn on_handshake_done(&self, plain_source: &StreamRef, plain_drain: &StreamRef);
}

impl<F: Fn(&StreamRef, &StreamRef)> TlsHandshakeCallback for F {
    fn on_handshake_done(&self, plain_source: &StreamRef, plain_drain: &StreamRef) {
        self(plain_source, plain_drain)
    }
}

struct Shared {
    conn: RefCell<ServerConnection>,
    handshake_done: Cell<bool>,
    aborted: Cell<bool>,
    plain_source: StreamRef,
    cipher_source: StreamRef,
    callback: RefCell<Option<Box<dyn TlsHandshakeCallback>>>,
}

impl Shared {
    fn abort(&self) {
        if self.aborted.replace(true) {
            return;
        }
        self.plain_source.out().is_closed = true;
        self.cipher_source.out().is_closed = true;
        StreamRef::notify(&self.plain_source);
        StreamRef::notify(&self.cipher_source);
        StreamRef::disconnect(&self.plain_source);
        StreamRef::disconnect(&self.cipher_source);
    }

    /// Drain whatever ciphertext `rustls` wants to send (handshake flight or
    /// a response to data just processed) into `cipher_source.out`.
    fn pump_cipher_out(&self) {
        let mut conn = self.conn.borrow_mut();
        let mut out = Vec::new();
        while conn.wants_write() {
            match conn.write_tls(&mut out) {
                Ok(0) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
        drop(conn);
        if !out.is_empty() {
            self.cipher_source.out().append_mem(out);
            StreamRef::notify(&self.cipher_source);
        }
    }

    /// Drain whatever plaintext `rustls` has decrypted into `plain_source.out`.
    fn pump_plain_out(&self) -> io::Result<()> {
        let mut conn = self.conn.borrow_mut();
        let mut buf = [0u8; 16 * 1024];
        let mut produced = Vec::new();
        loop {
            match conn.reader().read(&mut buf) {
                Ok(0) => {
                    drop(conn);
                    if !produced.is_empty() {
                        self.plain_source.out().append_mem(produced);
                    }
                    self.plain_source.out().is_closed = true;
                    StreamRef::notify(&self.plain_source);
                    return Ok(());
                }
                Ok(n) => produced.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        drop(conn);
        if !produced.is_empty() {
            self.plain_source.out().append_mem(produced);
            StreamRef::notify(&self.plain_source);
        }
        Ok(())
    }

    /// Returns `true` the one time the handshake transitions from in
    /// progress to complete, so the caller (which holds `plain_drain`, kept
    /// out of `Shared` itself to avoid a reference cycle — see the module
    /// doc comment) knows to fire the callback.
    fn handshake_just_finished(&self) -> bool {
        let still_handshaking = self.conn.borrow().is_handshaking();
        !still_handshaking && !self.handshake_done.replace(true)
    }
}

struct CipherDrainHandler {
    shared: Rc<Shared>,
    plain_drain: StreamRef,
}

impl StreamHandler for CipherDrainHandler {
    fn handle(&self, stream: &StreamRef, event: StreamEvent) {
        match event {
            StreamEvent::NewData => {
                let source = match stream.source() {
                    Some(s) => s,
                    None => return,
                };
                let n = source.out().length();
                if n > 0 {
                    let bytes = match source.out().extract_to_bytearray(n) {
                        Ok(b) => b,
                        Err(_) => return,
                    };
                    {
                        let mut conn = self.shared.conn.borrow_mut();
                        let mut slice = &bytes[..];
                        if conn.read_tls(&mut slice).is_err() {
                            drop(conn);
                            self.shared.abort();
                            return;
                        }
                        if conn.process_new_packets().is_err() {
                            drop(conn);
                            self.shared.abort();
                            return;
                        }
                    }
                    if self.shared.handshake_just_finished() {
                        if let Some(cb) = self.shared.callback.borrow_mut().take() {
                            cb.on_handshake_done(&self.shared.plain_source, &self.plain_drain);
                        }
                    }
                    self.shared.pump_cipher_out();
                    if self.shared.pump_plain_out().is_err() {
                        self.shared.abort();
                        return;
                    }
                }
                if source.out().is_closed && source.out().length() == 0 {
                    self.shared.plain_source.out().is_closed = true;
                    StreamRef::notify(&self.shared.plain_source);
                    StreamRef::disconnect_source(stream);
                }
            }
            StreamEvent::DisconnectedSource => {
                self.shared.plain_source.out().is_closed = true;
                StreamRef::notify(&self.shared.plain_source);
            }
            StreamEvent::DisconnectedDest => self.shared.abort(),
            StreamEvent::ConnectedSource | StreamEvent::ConnectedDest | StreamEvent::NewCqLimit | StreamEvent::Destroy => {}
        }
    }
}

struct PlainDrainHandler {
    shared: Rc<Shared>,
}

impl StreamHandler for PlainDrainHandler {
    fn handle(&self, stream: &StreamRef, event: StreamEvent) {
        match event {
            StreamEvent::NewData => {
                let source = match stream.source() {
                    Some(s) => s,
                    None => return,
                };
                let n = source.out().length();
                if n > 0 {
                    let bytes = match source.out().extract_to_bytearray(n) {
                        Ok(b) => b,
                        Err(_) => return,
                    };
                    let mut conn = self.shared.conn.borrow_mut();
                    if conn.writer().write_all(&bytes).is_err() {
                        drop(conn);
                        self.shared.abort();
                        return;
                    }
                    drop(conn);
                    self.shared.pump_cipher_out();
                }
                if source.out().is_closed && source.out().length() == 0 {
                    let mut conn = self.shared.conn.borrow_mut();
                    conn.send_close_notify();
                    drop(conn);
                    self.shared.pump_cipher_out();
                    self.shared.cipher_source.out().is_closed = true;
                    StreamRef::notify(&self.shared.cipher_source);
                    StreamRef::disconnect_source(stream);
                }
            }
            StreamEvent::DisconnectedSource => {}
            StreamEvent::DisconnectedDest => self.shared.abort(),
            StreamEvent::ConnectedSource | StreamEvent::ConnectedDest | StreamEvent::NewCqLimit | StreamEvent::Destroy => {}
        }
    }
}

/// The four-stream TLS termination filter (spec §4.14 `liOpenSSLFilter`).
pub struct TlsFilter {
    /// Connect this as the *source* of the raw socket's write stream.
    pub cipher_source: StreamRef,
    /// Connect the raw socket's read stream as *this* stream's source.
    pub cipher_drain: StreamRef,
    /// The application reads decrypted bytes from here.
    pub plain_source: StreamRef,
    /// The application writes plaintext it wants encrypted here (connect its
    /// output stream as this one's source).
    pub plain_drain: StreamRef,
}

impl TlsFilter {
    pub fn new(config: Arc<ServerConfig>, on_handshake_done: impl TlsHandshakeCallback + 'static) -> Result<TlsFilter, rustls::Error> {
        let conn = ServerConnection::new(config)?;
        let plain_source = StreamRef::new("tls-plain-source", Box::new(PassiveOutput));
        let cipher_source = StreamRef::new("tls-cipher-source", Box::new(PassiveOutput));

        let shared = Rc::new(Shared {
            conn: RefCell::new(conn),
            handshake_done: Cell::new(false),
            aborted: Cell::new(false),
            plain_source: plain_source.clone(),
            cipher_source: cipher_source.clone(),
            callback: RefCell::new(Some(Box::new(on_handshake_done))),
        });

        let plain_drain = StreamRef::new("tls-plain-drain", Box::new(PlainDrainHandler { shared: shared.clone() }));
        let cipher_drain = StreamRef::new(
            "tls-cipher-drain",
            Box::new(CipherDrainHandler { shared, plain_drain: plain_drain.clone() }),
        );

        Ok(TlsFilter { cipher_source, cipher_drain, plain_source, plain_drain })
    }
}

struct PassiveOutput;
impl StreamHandler for PassiveOutput {
    fn handle(&self, _stream: &StreamRef, _event: StreamEvent) {}
}

#[cfg(test)]
mod tests {
    // A full handshake test needs a real certified `ServerConfig` plus a
    // matching TLS client, which belongs in an integration test
    // (`tests/server.rs`, `full` feature) rather than here. This unit test
    // only exercises the plumbing that doesn't need a live session: the
    // stream wiring itself.
    use super::*;
    use crate::stream::plug::Plug;

    #[test]
    fn cipher_and_plain_streams_start_disconnected_from_each_other() {
        let plain_source = StreamRef::new("p", Box::new(PassiveOutput));
        let cipher_source = StreamRef::new("c", Box::new(PassiveOutput));
        let app = Plug::new("app");
        StreamRef::connect(&cipher_source, &app);
        assert!(cipher_source.dest().is_some());
        assert!(plain_source.dest().is_none());
    }
}

//! Angel protocol (spec §6.4): the length-prefixed request/response framing
//! between the supervisor ("angel") process and a server process, and the
//! `(module, action)` dispatch table a server plugin's `angel_callback`
//! hangs off of.
//!
//! Grounded in `original_source/src/angel/angel_server.c` and
//! `src/angel/angel_plugin.c` (spec `SPEC_FULL.md` §B.4): the wire framing
//! there is a small fixed header (module name, action name, request id,
//! explicit payload length) followed by the payload bytes, read off a unix
//! socket between angel and server. We give it a concrete byte encoding —
//! four length-prefixed byte strings, little detail beyond what the source
//! needs to route a frame — and, in place of the real unix-socket
//! transport (out of scope here per spec §1's "out-of-scope collaborators"
//! list, since the supervisor process itself isn't part of this core), an
//! in-process [`tokio::sync::mpsc`] pair good enough to unit test framing
//! and dispatch without a real angel binary.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::error::Error;

/// Matches the source's `ANGEL_MAGIC`-free simple header: four
/// length-prefixed fields. A `u32` length cap per field guards against a
/// corrupt peer claiming an absurd allocation.
const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

/// One angel↔server frame (spec §6.4: `{module_name, action_name, id, payload}`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub module: String,
    pub action: String,
    pub id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(module: impl Into<String>, action: impl Into<String>, id: u32, payload: impl Into<Bytes>) -> Frame {
        Frame {
            module: module.into(),
            action: action.into(),
            id,
            payload: payload.into(),
        }
    }

    /// Encode as `u32-len module | u32-len action | u32 id | u32-len payload`,
    /// all big-endian, matching the "lengths are explicit" wording of spec §6.4.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.module.len() + 4 + self.action.len() + 4 + 4 + self.payload.len());
        put_field(&mut buf, self.module.as_bytes());
        put_field(&mut buf, self.action.as_bytes());
        buf.put_u32(self.id);
        put_field(&mut buf, &self.payload);
        buf.freeze()
    }

    /// Decode one frame from the front of `buf`, advancing it past the
    /// consumed bytes. Returns `Ok(None)` if `buf` doesn't yet hold a
    /// complete frame (the caller should read more and retry).
    pub fn decode(buf: &mut Bytes) -> Result<Option<Frame>, Error> {
        let mut cursor = buf.clone();
        let module = match take_field(&mut cursor)? {
            Some(bytes) => String::from_utf8(bytes.to_vec()).map_err(|e| Error::protocol_invalid(e))?,
            None => return Ok(None),
        };
        let action = match take_field(&mut cursor)? {
            Some(bytes) => String::from_utf8(bytes.to_vec()).map_err(|e| Error::protocol_invalid(e))?,
            None => return Ok(None),
        };
        if cursor.remaining() < 4 {
            return Ok(None);
        }
        let id = cursor.get_u32();
        let payload = match take_field(&mut cursor)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        let consumed = buf.remaining() - cursor.remaining();
        buf.advance(consumed);
        Ok(Some(Frame { module, action, id, payload }))
    }
}

fn put_field(buf: &mut BytesMut, field: &[u8]) {
    buf.put_u32(field.len() as u32);
    buf.put_slice(field);
}

fn take_field(cursor: &mut Bytes) -> Result<Option<Bytes>, Error> {
    if cursor.remaining() < 4 {
        return Ok(None);
    }
    let mut peek = cursor.clone();
    let len = peek.get_u32() as usize;
    if len > MAX_FIELD_LEN {
        return Err(Error::protocol_invalid(format!("angel frame field of {} bytes exceeds {} byte cap", len, MAX_FIELD_LEN)));
    }
    if peek.remaining() < len {
        return Ok(None);
    }
    cursor.advance(4);
    let field = cursor.copy_to_bytes(len);
    Ok(Some(field))
}

/// Reassembles [`Frame`]s out of a byte stream that may deliver them split
/// across arbitrary read boundaries (unix-socket datagram boundaries are
/// not guaranteed to align with frames).
#[derive(Default)]
pub struct FrameDecoder {
    pending: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder::default()
    }

    /// Feed newly-read bytes in and drain as many complete frames as are
    /// now available.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, Error> {
        self.pending.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            let mut view = self.pending.clone().freeze();
            match Frame::decode(&mut view)? {
                Some(frame) => {
                    let consumed = self.pending.len() - view.len();
                    self.pending.advance(consumed);
                    out.push(frame);
                }
                None => break,
            }
        }
        Ok(out)
    }
}

/// A connection's reset-while-`Finished` suppression flag (spec §6.4 "On
/// connection reset to the supervisor with the server in `Finished` state,
/// suppress the error log entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Finished,
}

/// Was this disconnect expected (don't log it as an error)?
pub fn suppress_reset_log(state: ServerState) -> bool {
    matches!(state, ServerState::Finished)
}

type AngelCallback = Arc<dyn Fn(Frame) -> Result<Bytes, Error> + Send + Sync>;

/// Dispatch table routing inbound frames by `(module, action)` to a
/// plugin's registered `angel_callback` (spec §6.4).
#[derive(Default)]
pub struct Dispatcher {
    callbacks: HashMap<(String, String), AngelCallback>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    pub fn register(&mut self, module: impl Into<String>, action: impl Into<String>, callback: impl Fn(Frame) -> Result<Bytes, Error> + Send + Sync + 'static) {
        self.callbacks.insert((module.into(), action.into()), Arc::new(callback));
    }

    /// Dispatch `frame`, returning the reply frame (same module/action/id,
    /// with the callback's reply as payload) or an error if no callback is
    /// registered for `(module, action)`.
    pub fn dispatch(&self, frame: Frame) -> Result<Frame, Error> {
        let key = (frame.module.clone(), frame.action.clone());
        let callback = self
            .callbacks
            .get(&key)
            .ok_or_else(|| Error::protocol_invalid(format!("no angel callback for {}.{}", key.0, key.1)))?;
        let id = frame.id;
        let reply_payload = callback(frame)?;
        Ok(Frame::new(key.0, key.1, id, reply_payload))
    }
}

/// An in-process stand-in for the real angel↔server unix-socket transport
/// (spec §1: the supervisor process itself is out of scope), good enough
/// to drive [`Dispatcher`] end to end in tests.
pub struct AngelChannel {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl AngelChannel {
    /// Build a connected pair: bytes sent on one end's `tx` arrive on the
    /// other end's `rx`.
    pub fn pair() -> (AngelChannel, AngelChannel) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (AngelChannel { tx: tx_a, rx: rx_b }, AngelChannel { tx: tx_b, rx: rx_a })
    }

    pub fn send(&self, frame: Frame) -> Result<(), Error> {
        self.tx.send(frame).map_err(|_| Error::io_fatal(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "angel channel closed")))
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

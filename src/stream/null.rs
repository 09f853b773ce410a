//! The "null sink" standard stream (spec §3.2): discards everything and
//! closes its own `out`.

use super::{StreamEvent, StreamHandler, StreamRef};

struct NullSinkHandler;

impl StreamHandler for NullSinkHandler {
    fn handle(&self, stream: &StreamRef, event: StreamEvent) {
        match event {
            StreamEvent::NewData => {
                if let Some(source) = stream.source() {
                    let len = source.out().length();
                    source.out().skip(len);
                    if source.out().is_closed {
                        StreamRef::disconnect_source(stream);
                    }
                }
            }
            StreamEvent::ConnectedSource
            | StreamEvent::ConnectedDest
            | StreamEvent::DisconnectedSource
            | StreamEvent::DisconnectedDest
            | StreamEvent::NewCqLimit
            | StreamEvent::Destroy => {}
        }
    }
}

/// Construct a new null-sink stream: its `out` is always closed, and
/// anything written to a connected source is discarded.
pub struct NullSink;

impl NullSink {
    /// Create a new null sink.
    pub fn new() -> StreamRef {
        let stream = StreamRef::new("null-sink", Box::new(NullSinkHandler));
        stream.out().is_closed = true;
        stream
    }
}

//! The "plug" standard stream (spec §3.2): a pass-through forwarder.
//!
//! On `NewData` it steals everything out of its source's `out` into its own
//! `out` (zero-copy — chunks move, not bytes) and propagates closure, then
//! notifies its own dest so the forwarding cascades through an arbitrarily
//! long chain from a single upstream `notify` call.

use super::{StreamEvent, StreamHandler, StreamRef};
use crate::chunk::ChunkQueue;

struct PlugHandler;

impl StreamHandler for PlugHandler {
    fn handle(&self, stream: &StreamRef, event: StreamEvent) {
        match event {
            StreamEvent::NewData => {
                if let Some(source) = stream.source() {
                    {
                        let mut src_out = source.out();
                        let mut self_out = stream.out();
                        ChunkQueue::steal_all(&mut self_out, &mut src_out);
                    }
                    StreamRef::notify(stream);
                }
                if stream.out().is_closed {
                    StreamRef::disconnect_source(stream);
                }
            }
            StreamEvent::DisconnectedSource => {
                // Upstream is gone; close out once drained so our own dest
                // sees EOF (spec §3.2 invariant).
                if stream.out().length() == 0 {
                    stream.out().is_closed = true;
                    StreamRef::notify(stream);
                }
            }
            StreamEvent::DisconnectedDest => {
                StreamRef::disconnect_source(stream);
            }
            StreamEvent::ConnectedSource
            | StreamEvent::ConnectedDest
            | StreamEvent::NewCqLimit
            | StreamEvent::Destroy => {}
        }
    }
}

/// Construct a new plug stream.
pub struct Plug;

impl Plug {
    /// Create a new plug stream with the given diagnostic name.
    pub fn new(name: &'static str) -> StreamRef {
        StreamRef::new(name, Box::new(PlugHandler))
    }
}

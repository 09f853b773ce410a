//! Closing-socket list (spec §4.1, supplemented from
//! `original_source/src/common/events.c` `li_event_add_closing_socket`).
//!
//! For a graceful close the core calls `shutdown(WR)` and schedules a
//! 10-second read-drain: consume and discard incoming bytes until EOF,
//! error, or the budget expires. `Loop::end()` fast-paths every entry to an
//! immediate close instead of waiting out the drain.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Budget for the read-drain after a graceful `shutdown(WR)` (spec §4.1).
pub const DRAIN_BUDGET: Duration = Duration::from_secs(10);

/// Tracks sockets that are shutting down for write but still need their
/// remaining input drained before the fd can be released.
#[derive(Default)]
pub struct ClosingSockets {
    count: Mutex<usize>,
}

impl ClosingSockets {
    pub(crate) fn new() -> ClosingSockets {
        ClosingSockets::default()
    }

    /// Half-close `stream` for writes and spawn the read-drain. Matches the
    /// source: bytes are discarded, not delivered anywhere; completion is
    /// EOF, error, or timeout, whichever comes first.
    pub async fn close_gracefully(&self, mut stream: TcpStream) {
        {
            let mut count = self.count.lock().await;
            *count += 1;
        }
        let _ = stream.shutdown().await;
        let mut buf = [0u8; 4096];
        let drain = async {
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        };
        let _ = timeout(DRAIN_BUDGET, drain).await;
        let mut count = self.count.lock().await;
        *count -= 1;
    }

    /// `Loop::end()` fast-path: drop `stream` immediately rather than
    /// draining it.
    pub fn force_close(&self, stream: TcpStream) {
        drop(stream);
    }

    /// Number of sockets currently in the drain window.
    pub async fn pending(&self) -> usize {
        *self.count.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_count_starts_at_zero() {
        // The full drain-to-EOF behavior needs a real TcpStream pair and is
        // covered end-to-end in tests/server.rs against a loopback
        // listener; this unit test only exercises the bookkeeping contract.
        let closing = ClosingSockets::new();
        assert_eq!(closing.pending().await, 0);
    }
}

//! ChunkQueue (spec §3.1, §4.4): an ordered list of [`Chunk`]s plus byte
//! counters and an optional shared [`CqLimit`].
//!
//! Invariant (spec §8.1, testable property 1): `bytes_in - bytes_out ==
//! length == Σ chunk.length()` at every observation.

use std::collections::VecDeque;
use std::io;

use bytes::Bytes;

use super::chunk::{Chunk, FileRef, SharedBuf};
use super::limit::CqLimit;
use crate::error::Error;

/// An ordered, zero-copy byte pipeline (spec §3.1 `ChunkQueue`).
#[derive(Debug, Default)]
pub struct ChunkQueue {
    chunks: VecDeque<Chunk>,
    bytes_in: u64,
    bytes_out: u64,
    /// Writer-side EOF flag: once set and `length() == 0`, no further data
    /// will ever arrive.
    pub is_closed: bool,
    limit: Option<CqLimit>,
}

impl ChunkQueue {
    /// An empty, unlimited queue.
    pub fn new() -> ChunkQueue {
        ChunkQueue::default()
    }

    /// Attach (or replace) the shared back-pressure limit.
    pub fn set_limit(&mut self, limit: Option<CqLimit>) {
        self.limit = limit;
    }

    /// The attached limit, if any.
    pub fn limit(&self) -> Option<&CqLimit> {
        self.limit.as_ref()
    }

    /// Total bytes ever appended.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Total bytes ever consumed (via `skip`/`steal_*`).
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Bytes currently resident in the queue. Invariant: always equals
    /// `bytes_in - bytes_out` and the sum of every chunk's `length()`.
    pub fn length(&self) -> u64 {
        self.bytes_in - self.bytes_out
    }

    /// True if there are no chunks queued (regardless of `is_closed`).
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn account_append(&mut self, n: u64) {
        self.bytes_in += n;
        if let Some(limit) = &self.limit {
            limit.apply_delta(n as i64);
        }
    }

    fn account_consume(&mut self, n: u64) {
        self.bytes_out += n;
        if let Some(limit) = &self.limit {
            limit.apply_delta(-(n as i64));
        }
    }

    /// Append an owned byte string.
    pub fn append_string(&mut self, data: impl Into<Bytes>) {
        let chunk = Chunk::from_string(data);
        let n = chunk.length();
        self.chunks.push_back(chunk);
        self.account_append(n);
    }

    /// Append an owned, shareable memory buffer.
    pub fn append_mem(&mut self, data: Vec<u8>) {
        let chunk = Chunk::from_memory(data);
        let n = chunk.length();
        self.chunks.push_back(chunk);
        self.account_append(n);
    }

    /// Append a shared buffer view `[start, end)`.
    pub fn append_buffer(&mut self, data: SharedBuf, start: usize, end: usize) {
        let chunk = Chunk::from_buffer(data, start, end);
        let n = chunk.length();
        self.chunks.push_back(chunk);
        self.account_append(n);
    }

    /// Append a file region.
    pub fn append_file_fd(&mut self, fd: FileRef, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let chunk = Chunk::from_file(fd, offset, length);
        self.chunks.push_back(chunk);
        self.account_append(length);
    }

    /// Advance past `n` bytes without copying them anywhere, closing (and
    /// dropping) any chunk fully consumed in the process.
    pub fn skip(&mut self, n: u64) -> u64 {
        let mut remaining = n.min(self.length());
        let total = remaining;
        while remaining > 0 {
            let front_len = match self.chunks.front() {
                Some(c) => c.length(),
                None => break,
            };
            if front_len <= remaining {
                self.chunks.pop_front();
                remaining -= front_len;
            } else {
                self.chunks.front_mut().unwrap().advance(remaining);
                remaining = 0;
            }
        }
        self.account_consume(total);
        total
    }

    /// Skip everything currently queued.
    pub fn skip_all(&mut self) -> u64 {
        let len = self.length();
        self.skip(len)
    }

    /// Transfer everything from `src` into `dst`, without copying
    /// file/buffer/memory payloads. Propagates `src.is_closed`.
    pub fn steal_all(dst: &mut ChunkQueue, src: &mut ChunkQueue) {
        let n = src.length();
        ChunkQueue::steal_len(dst, src, n);
        if src.is_closed {
            dst.is_closed = true;
        }
    }

    /// Transfer up to `n` bytes from `src` to `dst`, splitting the leading
    /// chunk if `n` falls in its middle. Returns bytes actually moved.
    pub fn steal_len(dst: &mut ChunkQueue, src: &mut ChunkQueue, n: u64) -> u64 {
        let mut remaining = n.min(src.length());
        let total = remaining;
        while remaining > 0 {
            let front_len = match src.chunks.front() {
                Some(c) => c.length(),
                None => break,
            };
            if front_len <= remaining {
                let chunk = src.chunks.pop_front().unwrap();
                remaining -= front_len;
                dst.chunks.push_back(chunk);
            } else {
                let head = src.chunks.front_mut().unwrap().split_off_front(remaining);
                dst.chunks.push_back(head);
                remaining = 0;
            }
        }
        src.account_consume(total);
        dst.account_append(total);
        total
    }

    /// Copy the next `n` bytes into a flat buffer without consuming them.
    /// Fails with `ShortRead`-equivalent (an `Error::protocol_invalid`-free
    /// plain `io::Error`) if fewer are available and the queue isn't
    /// closed yet — the caller should treat that as "need more data", not
    /// an error.
    pub fn extract_to_memory(&mut self, n: u64) -> Result<Vec<u8>, ShortRead> {
        if self.length() < n {
            return Err(if self.is_closed {
                ShortRead::Eof
            } else {
                ShortRead::NeedMoreData
            });
        }
        let mut out = Vec::with_capacity(n as usize);
        let mut remaining = n;
        for chunk in self.iter() {
            if remaining == 0 {
                break;
            }
            if let Some(slice) = chunk.as_slice(remaining) {
                out.extend_from_slice(slice);
                remaining -= slice.len() as u64;
            } else {
                // file chunk not yet cached; caller must `cache_read` first
                return Err(ShortRead::NotResident);
            }
        }
        Ok(out)
    }

    /// Copy the next `n` bytes into a flat buffer, consuming them from the
    /// queue (extract + skip in one step; mirrors
    /// `li_chunkqueue_extract_to_bytearr`).
    pub fn extract_to_bytearray(&mut self, n: u64) -> Result<Vec<u8>, ShortRead> {
        let out = self.extract_to_memory(n)?;
        self.skip(n);
        Ok(out)
    }

    /// A cheap cursor over the queued chunks, front to back.
    pub fn iter(&self) -> std::collections::vec_deque::Iter<'_, Chunk> {
        self.chunks.iter()
    }

    /// For every `Chunk::File` entry, eagerly populate its in-memory cache
    /// by reading through the fd. Used before `extract_to_memory` when the
    /// caller knows it needs a flat view (e.g. PROXY-protocol header scan,
    /// spec §4.12).
    pub fn cache_file_reads(&mut self) -> io::Result<()> {
        for chunk in self.chunks.iter_mut() {
            chunk.cache_read()?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn assert_invariant(&self) {
        let summed: u64 = self.chunks.iter().map(Chunk::length).sum();
        assert_eq!(self.bytes_in - self.bytes_out, self.length());
        assert_eq!(summed, self.length());
    }
}

/// Why [`ChunkQueue::extract_to_memory`] couldn't produce a full view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortRead {
    /// Not enough bytes yet, but the writer side may still append more.
    NeedMoreData,
    /// Not enough bytes and the queue is already closed: this is final.
    Eof,
    /// Enough bytes are queued but a file chunk hasn't been cached into
    /// memory yet; call `cache_file_reads` first.
    NotResident,
}

impl From<ShortRead> for Error {
    fn from(s: ShortRead) -> Error {
        match s {
            ShortRead::NeedMoreData => Error::protocol_invalid("short read: need more data"),
            ShortRead::Eof => Error::protocol_invalid("short read: queue closed"),
            ShortRead::NotResident => Error::internal("chunk not cached into memory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_conservation_holds_across_append_and_skip() {
        let mut q = ChunkQueue::new();
        q.append_string("hello ");
        q.append_mem(b"world".to_vec());
        q.assert_invariant();
        assert_eq!(q.length(), 11);

        q.skip(3);
        q.assert_invariant();
        assert_eq!(q.length(), 8);
    }

    #[test]
    fn steal_len_splits_the_leading_chunk_without_copying() {
        let mut src = ChunkQueue::new();
        src.append_string("0123456789");
        let mut dst = ChunkQueue::new();

        let moved = ChunkQueue::steal_len(&mut dst, &mut src, 4);
        assert_eq!(moved, 4);
        src.assert_invariant();
        dst.assert_invariant();
        assert_eq!(dst.length(), 4);
        assert_eq!(src.length(), 6);

        let extracted = dst.extract_to_memory(4).unwrap();
        assert_eq!(&extracted, b"0123");
    }

    #[test]
    fn steal_all_propagates_closed_flag() {
        let mut src = ChunkQueue::new();
        src.append_string("x");
        src.is_closed = true;
        let mut dst = ChunkQueue::new();
        ChunkQueue::steal_all(&mut dst, &mut src);
        assert!(dst.is_closed);
        assert_eq!(src.length(), 0);
    }

    #[test]
    fn extract_to_memory_reports_need_more_data_when_open() {
        let mut q = ChunkQueue::new();
        q.append_string("ab");
        assert_eq!(q.extract_to_memory(5), Err(ShortRead::NeedMoreData));
    }

    #[test]
    fn extract_to_memory_reports_eof_when_closed() {
        let mut q = ChunkQueue::new();
        q.append_string("ab");
        q.is_closed = true;
        assert_eq!(q.extract_to_memory(5), Err(ShortRead::Eof));
    }

    #[test]
    fn cqlimit_tracks_net_deltas_across_append_and_skip() {
        let limit = CqLimit::new(10);
        let mut q = ChunkQueue::new();
        q.set_limit(Some(limit.clone()));

        q.append_mem(vec![0u8; 10]);
        assert!(limit.is_full());

        q.skip(6);
        assert_eq!(limit.current(), 4);
        assert!(!limit.is_full());
    }

    #[test]
    fn random_sequence_of_operations_preserves_invariant() {
        let mut q = ChunkQueue::new();
        let ops: &[(&str, u64)] = &[
            ("append", 5),
            ("append", 3),
            ("skip", 4),
            ("append", 10),
            ("skip", 2),
            ("skip", 12),
        ];
        for (op, n) in ops {
            match *op {
                "append" => q.append_mem(vec![1u8; *n as usize]),
                "skip" => {
                    q.skip(*n);
                }
                _ => unreachable!(),
            }
            q.assert_invariant();
        }
    }
}

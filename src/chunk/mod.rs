//! Chunk and ChunkQueue (spec §3.1, §4.4): the zero-copy byte pipeline
//! every stream, filter, and connection in this crate moves bytes through.

mod chunk;
mod limit;
mod queue;

pub use self::chunk::{Chunk, FileRef, SharedBuf};
pub use self::limit::{CqLimit, LimitNotify};
pub use self::queue::{ChunkQueue, ShortRead};

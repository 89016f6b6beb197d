//! Durable FIFO of relay sessions.
//!
//! Entries are byte-serialized [`RelaySession`] records in an append-oriented
//! log; the store survives restart and recovers from a crash by truncating
//! the last partial record. The queue owns a companion directory of envelope
//! files: they move in on enqueue and are deleted once delivery succeeds.

pub mod entry;
pub mod store;

pub use entry::{QueueProtocol, RelaySession};
pub use store::FileQueue;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to encode queue entry: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("unable to decode queue entry: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("file {0} is not owned by the queue")]
    NotOwned(std::path::PathBuf),
}

pub type Result<T> = std::result::Result<T, QueueError>;

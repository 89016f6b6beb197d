use std::fmt::Debug;

use async_trait::async_trait;

use robin_common::{session::Session, status::Status};

/// Reply produced by the storage pipeline for an accepted or rejected
/// message.
#[derive(Clone, Debug)]
pub struct SinkReply {
    pub status: Status,
    pub message: String,
}

impl SinkReply {
    #[must_use]
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn accepted(&self) -> bool {
        self.status.is_success()
    }
}

/// Where accepted messages go: the storage-processor chain, or a test
/// double. The session hands over the raw message bytes after the final dot
/// (or last BDAT chunk) and writes the returned reply verbatim.
#[async_trait]
pub trait MessageSink: Send + Sync + Debug {
    /// Runs the current envelope through the pipeline. Implementations
    /// mutate the envelope (stored path, scan results) in place.
    async fn deliver(&self, session: &mut Session, data: Vec<u8>) -> SinkReply;

    /// Called exactly once when the session ends, for per-session cleanup.
    async fn session_closed(&self, session: &Session) {
        let _ = session;
    }
}

/// Accepts everything without storing it; the default when no pipeline is
/// wired up (benchmarks, protocol tests).
#[derive(Debug, Default)]
pub struct AcceptingSink;

#[async_trait]
impl MessageSink for AcceptingSink {
    async fn deliver(&self, session: &mut Session, _data: Vec<u8>) -> SinkReply {
        SinkReply::new(Status::Ok, format!("Ok: queued as {}", session.uid()))
    }
}

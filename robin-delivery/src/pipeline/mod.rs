//! The storage pipeline: an ordered chain of processors deciding the fate
//! of each accepted message.
//!
//! Execution is strictly sequential; the first processor that rejects or
//! discards ends the chain. The default order is AV scan, spam scan, Dovecot
//! delivery, local disk writer. A test configuration may enable the chaos
//! header, which short-circuits a named processor to a fixed verdict.

pub mod clamav;
pub mod dovecot;
pub mod rspamd;
pub mod store;

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use robin_common::{
    envelope::{Envelope, HEADER_CHAOS},
    session::Session,
    status::Status,
};

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("scanner unreachable: {0}")]
    ScannerUnavailable(String),

    #[error("scanner protocol error: {0}")]
    ScannerProtocol(String),
}

/// What one processor decided.
#[derive(Debug, PartialEq)]
pub enum ProcessorVerdict {
    /// Hand the message to the next processor.
    Continue,
    /// Report success to the client and drop the message silently.
    Discard,
    /// Reject with the given reply; nothing later in the chain runs.
    Reject { status: Status, message: String },
}

/// What the whole pipeline decided.
#[derive(Debug, PartialEq)]
pub enum PipelineVerdict {
    Accepted,
    Discarded,
    Rejected { status: Status, message: String },
}

#[async_trait]
pub trait Processor: Send + Sync + Debug {
    /// Stable name, also the key the chaos header addresses.
    fn name(&self) -> &'static str;

    /// Inspects or delivers the message. Implementations may read the
    /// envelope file, append scan results and perform network calls.
    async fn process(
        &self,
        session: &mut Session,
        data: &[u8],
    ) -> Result<ProcessorVerdict, ProcessorError>;
}

/// Parses `X-Robin-Chaos: <processor>; return=<bool>` for the given
/// processor name.
fn chaos_override(envelope: &Envelope, processor: &str) -> Option<bool> {
    let value = envelope.header(HEADER_CHAOS)?;
    let (target, outcome) = value.split_once(';')?;

    if !target.trim().eq_ignore_ascii_case(processor) {
        return None;
    }

    outcome
        .trim()
        .strip_prefix("return=")
        .and_then(|flag| flag.trim().parse::<bool>().ok())
}

#[derive(Debug)]
pub struct Pipeline {
    processors: Vec<Arc<dyn Processor>>,
    /// Only test configurations consult the chaos header.
    chaos_enabled: bool,
}

impl Pipeline {
    #[must_use]
    pub fn new(processors: Vec<Arc<dyn Processor>>) -> Self {
        Self {
            processors,
            chaos_enabled: false,
        }
    }

    #[must_use]
    pub const fn with_chaos(mut self, enabled: bool) -> Self {
        self.chaos_enabled = enabled;
        self
    }

    /// Runs the chain over the session's current envelope.
    pub async fn run(&self, session: &mut Session, data: &[u8]) -> PipelineVerdict {
        for processor in &self.processors {
            if self.chaos_enabled {
                let short_circuit = session
                    .current_envelope()
                    .and_then(|envelope| chaos_override(envelope, processor.name()));

                match short_circuit {
                    Some(true) => {
                        tracing::info!(processor = processor.name(), "chaos: forced success");
                        continue;
                    }
                    Some(false) => {
                        tracing::info!(processor = processor.name(), "chaos: forced failure");
                        Self::cleanup(session).await;
                        return PipelineVerdict::Rejected {
                            status: Status::Error,
                            message: format!("5.3.0 {} rejected", processor.name()),
                        };
                    }
                    None => {}
                }
            }

            match processor.process(session, data).await {
                Ok(ProcessorVerdict::Continue) => {}
                Ok(ProcessorVerdict::Discard) => {
                    tracing::info!(processor = processor.name(), "message discarded");
                    Self::cleanup(session).await;
                    return PipelineVerdict::Discarded;
                }
                Ok(ProcessorVerdict::Reject { status, message }) => {
                    Self::cleanup(session).await;
                    return PipelineVerdict::Rejected { status, message };
                }
                Err(error) => {
                    tracing::error!(processor = processor.name(), %error, "processor failure");
                    Self::cleanup(session).await;
                    return PipelineVerdict::Rejected {
                        status: Status::ActionAborted,
                        message: "4.3.0 Message processing failed, try again later".to_string(),
                    };
                }
            }
        }

        PipelineVerdict::Accepted
    }

    /// Removes the stored envelope file of a message the chain did not
    /// accept.
    async fn cleanup(session: &mut Session) {
        let Some(envelope) = session.current_envelope_mut() else {
            return;
        };

        if let Some(path) = envelope.file_path().cloned() {
            if let Err(error) = tokio::fs::remove_file(&path).await {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), %error, "unable to remove stored file");
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::{chaos_override, Pipeline, PipelineVerdict, Processor, ProcessorVerdict};
    use robin_common::{
        envelope::{Envelope, HEADER_CHAOS},
        session::Session,
        status::Status,
    };

    #[derive(Debug)]
    struct Fixed(&'static str, fn() -> ProcessorVerdict);

    #[async_trait]
    impl Processor for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn process(
            &self,
            _session: &mut Session,
            _data: &[u8],
        ) -> Result<ProcessorVerdict, super::ProcessorError> {
            Ok((self.1)())
        }
    }

    fn session() -> Session {
        let mut session = Session::inbound("127.0.0.1:25".parse().unwrap());
        session.open_envelope(Envelope::default());
        session
    }

    #[tokio::test]
    async fn first_reject_stops_the_chain() {
        let pipeline = Pipeline::new(vec![
            Arc::new(Fixed("first", || ProcessorVerdict::Continue)),
            Arc::new(Fixed("second", || ProcessorVerdict::Reject {
                status: Status::Error,
                message: "5.7.1 no".to_string(),
            })),
            Arc::new(Fixed("third", || panic!("must not run"))),
        ]);

        let mut session = session();
        let verdict = pipeline.run(&mut session, b"mail").await;
        assert!(matches!(verdict, PipelineVerdict::Rejected { .. }));
    }

    #[tokio::test]
    async fn all_continue_accepts() {
        let pipeline = Pipeline::new(vec![
            Arc::new(Fixed("first", || ProcessorVerdict::Continue)),
            Arc::new(Fixed("second", || ProcessorVerdict::Continue)),
        ]);

        let mut session = session();
        assert_eq!(
            pipeline.run(&mut session, b"mail").await,
            PipelineVerdict::Accepted
        );
    }

    #[tokio::test]
    async fn chaos_header_short_circuits_named_processor() {
        let pipeline = Pipeline::new(vec![Arc::new(Fixed("clamav", || {
            panic!("chaos must skip this")
        }))])
        .with_chaos(true);

        let mut session = session();
        session
            .current_envelope_mut()
            .unwrap()
            .set_header(HEADER_CHAOS, "clamav; return=true");

        assert_eq!(
            pipeline.run(&mut session, b"mail").await,
            PipelineVerdict::Accepted
        );
    }

    #[tokio::test]
    async fn chaos_header_is_ignored_in_production() {
        let pipeline = Pipeline::new(vec![Arc::new(Fixed("clamav", || {
            ProcessorVerdict::Continue
        }))]);

        let mut session = session();
        session
            .current_envelope_mut()
            .unwrap()
            .set_header(HEADER_CHAOS, "clamav; return=false");

        assert_eq!(
            pipeline.run(&mut session, b"mail").await,
            PipelineVerdict::Accepted
        );
    }

    #[test]
    fn chaos_parsing() {
        let mut envelope = Envelope::default();
        envelope.set_header(HEADER_CHAOS, "rspamd; return=false");

        assert_eq!(chaos_override(&envelope, "rspamd"), Some(false));
        assert_eq!(chaos_override(&envelope, "clamav"), None);

        envelope.set_header(HEADER_CHAOS, "garbage");
        assert_eq!(chaos_override(&envelope, "rspamd"), None);
    }
}

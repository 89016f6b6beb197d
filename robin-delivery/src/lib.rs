//! Delivery side of the Robin MTA: the storage-processor chain that decides
//! the fate of each accepted message, the retry scheduler draining the
//! durable queue, the outbound ESMTP/LMTP exchange, DANE/MTA-STS policy
//! enforcement and RFC 3464 bounce synthesis.

pub mod dns;
pub mod dsn;
pub mod error;
pub mod lda;
pub mod outbound;
pub mod pipeline;
pub mod policy;
pub mod scheduler;
pub mod sink;

pub use error::{DeliveryError, PermanentError, SystemError, TemporaryError};
pub use pipeline::{Pipeline, Processor, ProcessorVerdict};
pub use scheduler::RetryScheduler;
pub use sink::PipelineSink;

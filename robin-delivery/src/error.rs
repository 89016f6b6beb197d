//! Typed error handling for delivery operations.
//!
//! Three kinds drive the retry logic: permanent failures (5xx, policy) are
//! never retried, temporary failures (4xx, network) go back on the queue,
//! system errors park the offending item and the service continues.

use thiserror::Error;

use crate::{dns::DnsError, policy::PolicyError};
use robin_smtp::error::ClientError;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    #[error("system error: {0}")]
    System(#[from] SystemError),
}

/// Failures that should not be retried.
#[derive(Debug, Error)]
pub enum PermanentError {
    #[error("recipient rejected: {0}")]
    RecipientRejected(String),

    #[error("message rejected: {0}")]
    MessageRejected(String),

    #[error("no mail servers for domain {0}")]
    NoMailServers(String),

    #[error("domain not found: {0}")]
    DomainNotFound(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("security policy requires TLS: {0}")]
    TlsRequired(String),
}

/// Failures worth another attempt after backoff.
#[derive(Debug, Error)]
pub enum TemporaryError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("command timed out: {0}")]
    Timeout(String),

    #[error("temporary SMTP error: {0}")]
    SmtpTemporary(String),

    #[error("DNS lookup failed: {0}")]
    DnsLookupFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),
}

/// Internal problems; the offending item is parked, the service continues.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue error: {0}")]
    Queue(#[from] robin_queue::QueueError),

    #[error("missing delivery data: {0}")]
    MissingData(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }
}

impl From<DnsError> for DeliveryError {
    fn from(error: DnsError) -> Self {
        match error {
            DnsError::NoMailServers(domain) => {
                Self::Permanent(PermanentError::NoMailServers(domain))
            }
            DnsError::DomainNotFound(domain) => {
                Self::Permanent(PermanentError::DomainNotFound(domain))
            }
            DnsError::LookupFailed(message) => {
                Self::Temporary(TemporaryError::DnsLookupFailed(message))
            }
        }
    }
}

/// Outbound client failures are categorised by reply code: 4xx retries, 5xx
/// does not, everything transport-level is considered transient.
impl From<ClientError> for DeliveryError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::UnexpectedResponse { code, message } if (500..600).contains(&code) => {
                Self::Permanent(PermanentError::MessageRejected(format!("{code} {message}")))
            }
            ClientError::UnexpectedResponse { code, message } => {
                Self::Temporary(TemporaryError::SmtpTemporary(format!("{code} {message}")))
            }
            ClientError::Io(error) => {
                Self::Temporary(TemporaryError::ConnectionFailed(error.to_string()))
            }
            ClientError::ConnectionClosed => Self::Temporary(TemporaryError::ConnectionFailed(
                "connection closed unexpectedly".to_string(),
            )),
            ClientError::Timeout => {
                Self::Temporary(TemporaryError::Timeout("command exchange".to_string()))
            }
            ClientError::Tls(message) => {
                Self::Temporary(TemporaryError::TlsHandshakeFailed(message))
            }
            ClientError::PoolExhausted => Self::Temporary(TemporaryError::ConnectionFailed(
                "LMTP pool exhausted".to_string(),
            )),
            ClientError::Parse(message) => Self::System(SystemError::Internal(format!(
                "SMTP protocol parse error: {message}"
            ))),
        }
    }
}

impl From<PolicyError> for DeliveryError {
    fn from(error: PolicyError) -> Self {
        match error {
            PolicyError::TlsUnavailable(host) => Self::Permanent(PermanentError::TlsRequired(
                format!("{host} does not offer STARTTLS"),
            )),
            PolicyError::MxNotPermitted(host) => Self::Permanent(PermanentError::TlsRequired(
                format!("{host} is not in the MTA-STS policy"),
            )),
            PolicyError::NoTlsaMatch(host) => Self::Permanent(PermanentError::TlsRequired(
                format!("no TLSA record matched for {host}"),
            )),
            PolicyError::Lookup(message) => {
                Self::Temporary(TemporaryError::DnsLookupFailed(message))
            }
            PolicyError::Fetch(message) => {
                Self::Temporary(TemporaryError::ConnectionFailed(message))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{DeliveryError, PermanentError, TemporaryError};
    use robin_smtp::error::ClientError;

    #[test]
    fn classification() {
        let permanent =
            DeliveryError::Permanent(PermanentError::MessageRejected("550 no".to_string()));
        assert!(permanent.is_permanent());
        assert!(!permanent.is_temporary());

        let temporary =
            DeliveryError::Temporary(TemporaryError::Timeout("EHLO".to_string()));
        assert!(temporary.is_temporary());
    }

    #[test]
    fn client_5xx_is_permanent() {
        let error: DeliveryError = ClientError::UnexpectedResponse {
            code: 550,
            message: "User unknown".to_string(),
        }
        .into();
        assert!(error.is_permanent());
    }

    #[test]
    fn client_4xx_and_transport_errors_are_temporary() {
        let error: DeliveryError = ClientError::UnexpectedResponse {
            code: 421,
            message: "Busy".to_string(),
        }
        .into();
        assert!(error.is_temporary());

        let error: DeliveryError = ClientError::ConnectionClosed.into();
        assert!(error.is_temporary());
    }

    #[test]
    fn policy_violations_are_permanent() {
        let error: DeliveryError =
            crate::policy::PolicyError::TlsUnavailable("mx.example.com".to_string()).into();
        assert!(error.is_permanent());
    }
}

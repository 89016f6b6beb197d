use thiserror::Error;

pub type CodecResult<T> = Result<T, CodecError>;
pub type ClientResult<T> = Result<T, ClientError>;

/// Failures surfaced by the wire codec. Nothing is ever silently truncated;
/// a short read or oversized line is always reported.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("connection closed mid-read")]
    UnexpectedEof,

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("unable to load certificate {path}: {reason}")]
    CertificateLoad { path: String, reason: String },

    #[error("unable to load key {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error("TLS configuration: {0}")]
    Config(#[from] tokio_rustls::rustls::Error),

    #[error("TLS handshake: {0}")]
    Handshake(std::io::Error),

    #[error("negotiated connection is missing {0}")]
    ProtocolInfoMissing(&'static str),
}

/// Failures that end an inbound session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("session idle timeout")]
    IdleTimeout,

    #[error("transfer below minimum data rate")]
    SlowTransfer,

    #[error("transfer exceeded the absolute data timeout")]
    DataTimeout,

    #[error("error budget exhausted")]
    TooManyErrors,

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// A verb was looked up in the dispatch registry without the required half
/// being registered.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no server handler registered for {0}")]
    MissingServer(String),

    #[error("no client handler registered for {0}")]
    MissingClient(String),
}

/// Failures that stop a listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid listen address {0}")]
    Address(String),

    #[error("unable to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Failures from the outbound SMTP/LMTP client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("unable to parse response: {0}")]
    Parse(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("unexpected response: {code} {message}")]
    UnexpectedResponse { code: u16, message: String },

    #[error("command timed out")]
    Timeout,

    #[error("pool exhausted: no connection within the borrow timeout")]
    PoolExhausted,
}

/// Failures raised by the proxy engine.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid proxy rule pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("no reachable host among {0:?}")]
    NoReachableHost(Vec<String>),

    #[error("proxy handshake failed: {0}")]
    Handshake(String),

    #[error("destination previously failed in this session")]
    Memoised,

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Failures from the authentication backend.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("I/O error talking to the authenticator: {0}")]
    Io(#[from] std::io::Error),

    #[error("authenticator protocol violation: {0}")]
    Protocol(String),

    #[error("mechanism {0} is not supported")]
    UnsupportedMechanism(String),

    #[error("malformed credentials: {0}")]
    Malformed(String),
}

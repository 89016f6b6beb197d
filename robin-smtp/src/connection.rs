//! Line-oriented wire codec shared by every inbound session.
//!
//! Lines are CRLF-terminated; a lone LF is accepted on read but CRLF is
//! always emitted on write. Multiline responses are written as one logical
//! unit. BDAT chunks bypass line framing via [`Connection::read_exact_into`].

use std::{fs::File, io::BufReader, sync::Arc};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer},
        ProtocolVersion, ServerConfig, ServerConnection, SupportedCipherSuite,
    },
    server::TlsStream,
    TlsAcceptor,
};

use robin_common::config::TlsConfig;

use crate::error::{CodecError, CodecResult, TlsError};

/// Read buffer size, chosen to cover a full command pipeline in one syscall.
const BUFFER_SIZE: usize = 8192;

/// Upper bound on a single line; anything longer is a protocol violation.
const MAX_LINE: usize = 64 * 1024;

/// Details of a negotiated TLS session, recorded on the session context.
#[derive(Debug)]
pub struct TlsInfo {
    version: ProtocolVersion,
    cipher: SupportedCipherSuite,
}

impl TlsInfo {
    pub(crate) fn of(conn: &ServerConnection) -> Result<Self, TlsError> {
        Ok(Self {
            version: conn
                .protocol_version()
                .ok_or(TlsError::ProtocolInfoMissing("protocol version"))?,
            cipher: conn
                .negotiated_cipher_suite()
                .ok_or(TlsError::ProtocolInfoMissing("cipher suite"))?,
        })
    }

    #[must_use]
    pub fn protocol(&self) -> String {
        self.version.as_str().unwrap_or("unknown").to_string()
    }

    #[must_use]
    pub fn cipher(&self) -> String {
        self.cipher.suite().as_str().unwrap_or("unknown").to_string()
    }
}

enum Inner<Stream> {
    Plain(Stream),
    Tls(Box<TlsStream<Stream>>),
    /// Placeholder while the stream is being upgraded; any use is an error.
    Closed,
}

pub struct Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    inner: Inner<Stream>,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_len: usize,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Connection<Stream> {
    pub fn plain(stream: Stream) -> Self {
        Self {
            inner: Inner::Plain(stream),
            read_buf: Vec::new(),
            read_pos: 0,
            read_len: 0,
        }
    }

    pub fn tls(stream: TlsStream<Stream>) -> Self {
        Self {
            inner: Inner::Tls(Box::new(stream)),
            read_buf: Vec::new(),
            read_pos: 0,
            read_len: 0,
        }
    }

    /// Refills the internal buffer. Returns the number of bytes read; zero
    /// means the peer closed the connection.
    async fn fill(&mut self) -> CodecResult<usize> {
        if self.read_buf.is_empty() {
            self.read_buf.resize(BUFFER_SIZE, 0);
        }

        let bytes_read = match &mut self.inner {
            Inner::Plain(stream) => stream.read(&mut self.read_buf).await?,
            Inner::Tls(stream) => stream.read(&mut self.read_buf).await?,
            Inner::Closed => return Err(CodecError::UnexpectedEof),
        };

        self.read_pos = 0;
        self.read_len = bytes_read;
        Ok(bytes_read)
    }

    /// Reads one line, stripping the terminator. A lone LF terminates a line
    /// as well as CRLF. Returns `None` on a clean end of stream.
    pub async fn read_line(&mut self) -> CodecResult<Option<String>> {
        let mut line: Vec<u8> = Vec::new();

        loop {
            while self.read_pos < self.read_len {
                let byte = self.read_buf[self.read_pos];
                self.read_pos += 1;

                if byte == b'\n' {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                }

                line.push(byte);
                if line.len() > MAX_LINE {
                    return Err(CodecError::LineTooLong(MAX_LINE));
                }
            }

            if self.fill().await? == 0 {
                if line.is_empty() {
                    return Ok(None);
                }
                return Err(CodecError::UnexpectedEof);
            }
        }
    }

    /// Reads exactly `count` bytes (BDAT chunks), appending them to `out`.
    pub async fn read_exact_into(
        &mut self,
        mut count: usize,
        out: &mut Vec<u8>,
    ) -> CodecResult<()> {
        while count > 0 {
            if self.read_pos == self.read_len && self.fill().await? == 0 {
                return Err(CodecError::UnexpectedEof);
            }

            let available = (self.read_len - self.read_pos).min(count);
            out.extend_from_slice(&self.read_buf[self.read_pos..self.read_pos + available]);
            self.read_pos += available;
            count -= available;
        }

        Ok(())
    }

    /// Writes one response line, CRLF-terminated, as a single write.
    pub async fn send_line(&mut self, line: &str) -> CodecResult<()> {
        let mut buffer = String::with_capacity(line.len() + 2);
        buffer.push_str(line);
        buffer.push_str("\r\n");
        self.send_raw(buffer.as_bytes()).await
    }

    /// Writes a whole (possibly multiline) response as one logical unit.
    pub async fn send_lines(&mut self, lines: &[String]) -> CodecResult<()> {
        let mut buffer = String::new();
        for line in lines {
            buffer.push_str(line);
            buffer.push_str("\r\n");
        }
        self.send_raw(buffer.as_bytes()).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> CodecResult<()> {
        match &mut self.inner {
            Inner::Plain(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await?;
            }
            Inner::Tls(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await?;
            }
            Inner::Closed => return Err(CodecError::UnexpectedEof),
        }
        Ok(())
    }

    fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        let mut reader =
            BufReader::new(File::open(path).map_err(|e| TlsError::CertificateLoad {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?);

        rustls_pemfile::certs(&mut reader)
            .collect::<Result<_, _>>()
            .map_err(|e| TlsError::CertificateLoad {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    fn load_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, TlsError> {
        let mut reader = BufReader::new(File::open(path).map_err(|e| TlsError::KeyLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?);

        match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
            _ => Err(TlsError::KeyLoad {
                path: path.display().to_string(),
                reason: "expected a PKCS1, PKCS8 or SEC1 private key".to_string(),
            }),
        }
    }

    /// Builds a TLS acceptor from on-disk PEM material.
    pub fn acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
        let certs = Self::load_certs(&tls.certificate)?;
        let key = Self::load_key(&tls.key)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Upgrades a plaintext connection in place (STARTTLS).
    ///
    /// Any bytes buffered before the upgrade are discarded; a client that
    /// pipelines past STARTTLS violates RFC 3207 and loses them.
    pub async fn upgrade(&mut self, tls: &TlsConfig) -> CodecResult<TlsInfo> {
        let acceptor = Self::acceptor(tls)?;

        match std::mem::replace(&mut self.inner, Inner::Closed) {
            Inner::Plain(stream) => {
                let stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(TlsError::Handshake)?;
                let info = TlsInfo::of(stream.get_ref().1)?;

                self.inner = Inner::Tls(Box::new(stream));
                self.read_pos = 0;
                self.read_len = 0;
                Ok(info)
            }
            other => {
                self.inner = other;
                Err(CodecError::Tls(TlsError::ProtocolInfoMissing(
                    "plaintext stream to upgrade",
                )))
            }
        }
    }
}

//! Outbound ESMTP/LMTP client.
//!
//! Drives the banner/EHLO/STARTTLS/AUTH/MAIL/RCPT/DATA exchange for the
//! relay engine, the proxy engine and the retry scheduler. LMTP differs in
//! the LHLO greeting and in returning one DATA reply per accepted recipient.

pub mod pool;
pub mod response;

use std::{net::IpAddr, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
};
use tokio_rustls::{
    rustls::{
        client::danger::ServerCertVerifier, pki_types::ServerName, ClientConfig, RootCertStore,
    },
    TlsConnector,
};

pub use response::Response;

use crate::error::{ClientError, ClientResult};

/// Options for establishing the TCP leg of an outbound connection.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// Source address to bind before connecting.
    pub bind: Option<IpAddr>,
    pub timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            bind: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// TLS behaviour for a STARTTLS upgrade.
#[derive(Clone, Default)]
pub struct TlsOptions {
    /// Skip certificate verification entirely (tests only).
    pub accept_invalid_certs: bool,
    /// Replacement verifier, used for DANE TLSA pinning.
    pub verifier: Option<Arc<dyn ServerCertVerifier>>,
}

impl std::fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsOptions")
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("verifier", &self.verifier.is_some())
            .finish()
    }
}

enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> ClientResult<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> ClientResult<usize> {
        let read = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };

        if read == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(read)
    }

    async fn upgrade(self, server_name: &str, options: &TlsOptions) -> ClientResult<Self> {
        let Self::Plain(stream) = self else {
            return Err(ClientError::Tls("connection is already TLS".to_string()));
        };

        let mut root_store = RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            root_store
                .add(cert)
                .map_err(|e| ClientError::Tls(format!("unable to add root: {e}")))?;
        }
        if !certs.errors.is_empty() {
            tracing::warn!(errors = ?certs.errors, "some native roots could not be loaded");
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if let Some(verifier) = &options.verifier {
            config
                .dangerous()
                .set_certificate_verifier(verifier.clone());
        } else if options.accept_invalid_certs {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerifier));
        }

        let connector = TlsConnector::from(Arc::new(config));
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| ClientError::Tls(format!("invalid server name: {e}")))?;

        let stream = connector
            .connect(name, stream)
            .await
            .map_err(|e| ClientError::Tls(e.to_string()))?;

        Ok(Self::Tls(Box::new(stream)))
    }
}

/// A certificate verifier that accepts everything. Tests only.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}

/// An SMTP/LMTP client connection.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    server_name: String,
    capabilities: Vec<String>,
}

impl SmtpClient {
    /// Connects the TCP leg; the caller reads the banner next.
    pub async fn connect(
        addr: &str,
        server_name: impl Into<String>,
        options: &ConnectOptions,
    ) -> ClientResult<Self> {
        let connect = async {
            match options.bind {
                Some(source) => {
                    let target = tokio::net::lookup_host(addr)
                        .await?
                        .next()
                        .ok_or_else(|| {
                            std::io::Error::new(
                                std::io::ErrorKind::NotFound,
                                format!("no address for {addr}"),
                            )
                        })?;

                    let socket = if source.is_ipv4() {
                        TcpSocket::new_v4()?
                    } else {
                        TcpSocket::new_v6()?
                    };
                    socket.bind(std::net::SocketAddr::new(source, 0))?;
                    socket.connect(target).await
                }
                None => TcpStream::connect(addr).await,
            }
        };

        let stream = tokio::time::timeout(options.timeout, connect)
            .await
            .map_err(|_| ClientError::Timeout)??;

        Ok(Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: Vec::new(),
            server_name: server_name.into(),
            capabilities: Vec::new(),
        })
    }

    fn connection(&mut self) -> ClientResult<&mut ClientConnection> {
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)
    }

    /// Reads one complete (possibly multiline) reply.
    pub async fn read_response(&mut self) -> ClientResult<Response> {
        let mut chunk = [0u8; 4096];

        loop {
            if let Some((response, consumed)) = Response::parse(&self.buffer)? {
                self.buffer.drain(..consumed);
                return Ok(response);
            }

            let read = self.connection()?.read(&mut chunk).await?;
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    /// The server banner after connecting.
    pub async fn read_greeting(&mut self) -> ClientResult<Response> {
        self.read_response().await
    }

    /// Sends one command line and reads its reply.
    pub async fn command(&mut self, line: &str) -> ClientResult<Response> {
        tracing::trace!(command = %line, server = %self.server_name, "sending");
        let wire = format!("{line}\r\n");
        self.connection()?.send(wire.as_bytes()).await?;
        self.read_response().await
    }

    /// EHLO; the advertised capabilities are retained for [`Self::supports`].
    pub async fn ehlo(&mut self, name: &str) -> ClientResult<Response> {
        let response = self.command(&format!("EHLO {name}")).await?;
        self.remember_capabilities(&response);
        Ok(response)
    }

    /// LHLO, the LMTP greeting (RFC 2033).
    pub async fn lhlo(&mut self, name: &str) -> ClientResult<Response> {
        let response = self.command(&format!("LHLO {name}")).await?;
        self.remember_capabilities(&response);
        Ok(response)
    }

    pub async fn helo(&mut self, name: &str) -> ClientResult<Response> {
        self.command(&format!("HELO {name}")).await
    }

    fn remember_capabilities(&mut self, response: &Response) {
        if response.is_success() {
            self.capabilities = response
                .lines
                .iter()
                .filter_map(|line| line.split_whitespace().next())
                .map(str::to_ascii_uppercase)
                .collect();
        }
    }

    /// Whether the last EHLO/LHLO advertised the given capability.
    #[must_use]
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|cap| cap.eq_ignore_ascii_case(capability))
    }

    /// Sends STARTTLS and upgrades the stream on a 220 go-ahead.
    pub async fn starttls(&mut self, options: &TlsOptions) -> ClientResult<Response> {
        let response = self.command("STARTTLS").await?;
        if response.code != 220 {
            return Ok(response);
        }

        let connection = self
            .connection
            .take()
            .ok_or(ClientError::ConnectionClosed)?;

        // Host name without the port for SNI.
        let host = self
            .server_name
            .rsplit_once(':')
            .map_or(self.server_name.as_str(), |(host, _)| host)
            .to_string();

        self.connection = Some(connection.upgrade(&host, options).await?);
        self.buffer.clear();
        Ok(response)
    }

    pub async fn auth_plain(&mut self, username: &str, password: &str) -> ClientResult<Response> {
        let payload = BASE64.encode(format!("\0{username}\0{password}"));
        self.command(&format!("AUTH PLAIN {payload}")).await
    }

    pub async fn auth_login(&mut self, username: &str, password: &str) -> ClientResult<Response> {
        let challenge = self.command("AUTH LOGIN").await?;
        if challenge.code != 334 {
            return Ok(challenge);
        }

        let challenge = self.command(&BASE64.encode(username)).await?;
        if challenge.code != 334 {
            return Ok(challenge);
        }

        self.command(&BASE64.encode(password)).await
    }

    /// Sends DATA; a 354 go-ahead means the payload may follow.
    pub async fn data_begin(&mut self) -> ClientResult<Response> {
        self.command("DATA").await
    }

    fn stuffed(data: &[u8]) -> Vec<u8> {
        let mut wire = Vec::with_capacity(data.len() + 8);
        let mut at_line_start = true;

        for byte in data {
            if at_line_start && *byte == b'.' {
                wire.push(b'.');
            }
            wire.push(*byte);
            at_line_start = *byte == b'\n';
        }

        if !wire.ends_with(b"\r\n") {
            wire.extend_from_slice(b"\r\n");
        }
        wire.extend_from_slice(b".\r\n");
        wire
    }

    /// Streams the dot-stuffed payload and reads the single SMTP reply.
    pub async fn send_payload(&mut self, data: &[u8]) -> ClientResult<Response> {
        let wire = Self::stuffed(data);
        self.connection()?.send(&wire).await?;
        self.read_response().await
    }

    /// Streams the payload over LMTP: one reply per accepted recipient.
    pub async fn send_payload_lmtp(
        &mut self,
        data: &[u8],
        recipients: usize,
    ) -> ClientResult<Vec<Response>> {
        let wire = Self::stuffed(data);
        self.connection()?.send(&wire).await?;

        let mut replies = Vec::with_capacity(recipients);
        for _ in 0..recipients {
            replies.push(self.read_response().await?);
        }
        Ok(replies)
    }

    pub async fn rset(&mut self) -> ClientResult<Response> {
        self.command("RSET").await
    }

    /// Polite close; errors are ignored, the peer may hang up first.
    pub async fn quit(&mut self) {
        if let Ok(connection) = self.connection() {
            let _ = connection.send(b"QUIT\r\n").await;
        }
        self.connection = None;
    }
}

impl std::fmt::Debug for SmtpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpClient")
            .field("server_name", &self.server_name)
            .field("connected", &self.connection.is_some())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::SmtpClient;

    #[test]
    fn dot_stuffing() {
        let wire = SmtpClient::stuffed(b"one\r\n.two\r\nthree");
        assert_eq!(wire, b"one\r\n..two\r\nthree\r\n.\r\n".to_vec());
    }

    #[test]
    fn terminator_not_doubled() {
        let wire = SmtpClient::stuffed(b"body\r\n");
        assert_eq!(wire, b"body\r\n.\r\n".to_vec());
    }

    #[test]
    fn lone_dot_body_is_stuffed() {
        let wire = SmtpClient::stuffed(b".\r\n");
        assert_eq!(wire, b"..\r\n.\r\n".to_vec());
    }
}

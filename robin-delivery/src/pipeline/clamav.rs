//! ClamAV scanning over the INSTREAM TCP protocol.
//!
//! The whole message is streamed as length-prefixed chunks; with
//! `scan_parts` every non-text MIME part is additionally scanned on its own.
//! `stream: <name> FOUND` triggers the configured disposition: reject with
//! `550 5.7.1`, or report success and drop silently.

use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use robin_common::{
    config::{ClamavConfig, ScanDisposition},
    counter,
    session::Session,
    status::Status,
};

use super::{Processor, ProcessorError, ProcessorVerdict};

#[derive(Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    Clean,
    Found(String),
}

#[derive(Debug)]
pub struct ClamavScanner {
    config: ClamavConfig,
}

impl ClamavScanner {
    #[must_use]
    pub const fn new(config: ClamavConfig) -> Self {
        Self { config }
    }

    /// One INSTREAM exchange: `zINSTREAM\0`, length-prefixed chunks, a zero
    /// terminator, then the single reply line.
    async fn scan_bytes(&self, data: &[u8]) -> Result<ScanOutcome, ProcessorError> {
        let address = format!("{}:{}", self.config.host, self.config.port);
        let timeout = Duration::from_secs(self.config.timeout_seconds.max(1));

        let exchange = async {
            let mut stream = TcpStream::connect(&address)
                .await
                .map_err(|e| ProcessorError::ScannerUnavailable(format!("{address}: {e}")))?;

            stream.write_all(b"zINSTREAM\0").await?;
            stream
                .write_all(&u32::try_from(data.len()).unwrap_or(u32::MAX).to_be_bytes())
                .await?;
            stream.write_all(data).await?;
            stream.write_all(&0u32.to_be_bytes()).await?;
            stream.flush().await?;

            let mut reply = Vec::new();
            let mut chunk = [0u8; 512];
            loop {
                let read = stream.read(&mut chunk).await?;
                if read == 0 {
                    break;
                }
                reply.extend_from_slice(&chunk[..read]);
                if reply.contains(&0) {
                    break;
                }
            }

            Ok::<_, ProcessorError>(String::from_utf8_lossy(&reply).into_owned())
        };

        let reply = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ProcessorError::ScannerUnavailable(format!("{address}: timed out")))??;
        let reply = reply.trim_end_matches(['\0', '\n']).trim();

        if let Some(found) = reply.strip_suffix(" FOUND") {
            let name = found.rsplit(' ').next().unwrap_or(found).to_string();
            return Ok(ScanOutcome::Found(name));
        }

        if reply.ends_with("OK") {
            return Ok(ScanOutcome::Clean);
        }

        Err(ProcessorError::ScannerProtocol(format!(
            "unexpected ClamAV reply: {reply}"
        )))
    }

    /// Scans the whole message, then each non-text MIME part when
    /// configured.
    async fn scan(&self, data: &[u8]) -> Result<ScanOutcome, ProcessorError> {
        if let found @ ScanOutcome::Found(_) = self.scan_bytes(data).await? {
            return Ok(found);
        }

        if self.config.scan_parts {
            if let Ok(parsed) = mailparse::parse_mail(data) {
                for part in &parsed.subparts {
                    if part.ctype.mimetype.starts_with("text/") {
                        continue;
                    }

                    let body = part.get_body_raw().map_err(|e| {
                        ProcessorError::ScannerProtocol(format!("unable to decode part: {e}"))
                    })?;

                    if let found @ ScanOutcome::Found(_) = self.scan_bytes(&body).await? {
                        return Ok(found);
                    }
                }
            }
        }

        Ok(ScanOutcome::Clean)
    }
}

#[async_trait]
impl Processor for ClamavScanner {
    fn name(&self) -> &'static str {
        "clamav"
    }

    async fn process(
        &self,
        session: &mut Session,
        data: &[u8],
    ) -> Result<ProcessorVerdict, ProcessorError> {
        let outcome = self.scan(data).await?;
        let uid = session.uid().clone();

        let Some(envelope) = session.current_envelope_mut() else {
            return Ok(ProcessorVerdict::Continue);
        };

        match outcome {
            ScanOutcome::Clean => {
                envelope.record_scan("clamav", "clean");
                Ok(ProcessorVerdict::Continue)
            }
            ScanOutcome::Found(name) => {
                envelope.record_scan("clamav", format!("found: {name}"));
                tracing::info!(session = %uid, virus = %name, "virus detected");

                match self.config.policy {
                    ScanDisposition::Reject => {
                        counter::increment(counter::VIRUS_REJECTION);
                        Ok(ProcessorVerdict::Reject {
                            status: Status::Error,
                            message: format!("5.7.1 Virus detected ({name})"),
                        })
                    }
                    ScanDisposition::Discard => Ok(ProcessorVerdict::Discard),
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::{ClamavScanner, ScanOutcome};
    use robin_common::config::{ClamavConfig, ScanDisposition};

    /// Minimal INSTREAM responder: consumes chunks, answers per content.
    async fn mock_clamd() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut data = Vec::new();
                    let mut chunk = [0u8; 4096];

                    loop {
                        let Ok(read) = socket.read(&mut chunk).await else {
                            return;
                        };
                        if read == 0 {
                            return;
                        }
                        data.extend_from_slice(&chunk[..read]);

                        // The stream terminator is a zero-length chunk.
                        if data.len() >= 4 && data.ends_with(&[0, 0, 0, 0]) {
                            break;
                        }
                    }

                    let reply: &[u8] = if data.windows(5).any(|w| w == b"EICAR") {
                        b"stream: Eicar-Test-Signature FOUND\0"
                    } else {
                        b"stream: OK\0"
                    };
                    let _ = socket.write_all(reply).await;
                });
            }
        });

        addr
    }

    fn scanner(addr: std::net::SocketAddr) -> ClamavScanner {
        ClamavScanner::new(ClamavConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            policy: ScanDisposition::Reject,
            scan_parts: false,
            timeout_seconds: 5,
        })
    }

    #[tokio::test]
    async fn clean_message_passes() {
        let addr = mock_clamd().await;
        let outcome = scanner(addr)
            .scan_bytes(b"Subject: hi\r\n\r\nhello\r\n")
            .await
            .unwrap();
        assert_eq!(outcome, ScanOutcome::Clean);
    }

    #[tokio::test]
    async fn eicar_is_found() {
        let addr = mock_clamd().await;
        let outcome = scanner(addr).scan_bytes(b"EICAR test body").await.unwrap();
        assert_eq!(
            outcome,
            ScanOutcome::Found("Eicar-Test-Signature".to_string())
        );
    }

    #[tokio::test]
    async fn unreachable_daemon_is_an_error() {
        let scanner = ClamavScanner::new(robin_common::config::ClamavConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            policy: ScanDisposition::Reject,
            scan_parts: false,
            timeout_seconds: 1,
        });

        assert!(scanner.scan_bytes(b"x").await.is_err());
    }
}

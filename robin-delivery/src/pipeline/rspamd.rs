//! Spam scoring through Rspamd's HTTP interface.
//!
//! The message is POSTed to `/checkv2`; the returned score is compared to
//! the configured thresholds (`discard_threshold >= reject_threshold`). A
//! rejected message gets `550 5.7.1`, a discarded one reports success to
//! the client and disappears.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};

use robin_common::{config::RspamdConfig, counter, session::Session, status::Status};

use super::{Processor, ProcessorError, ProcessorVerdict};

type ScanClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

pub struct RspamdScanner {
    config: RspamdConfig,
    client: ScanClient,
}

impl std::fmt::Debug for RspamdScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RspamdScanner")
            .field("url", &self.config.url)
            .finish()
    }
}

impl RspamdScanner {
    pub fn new(config: RspamdConfig) -> Result<Self, ProcessorError> {
        let connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| ProcessorError::ScannerUnavailable(e.to_string()))?
            .https_or_http()
            .enable_http1()
            .build();

        Ok(Self {
            config,
            client: Client::builder(TokioExecutor::new()).build(connector),
        })
    }

    async fn score(&self, session: &Session, data: &[u8]) -> Result<f64, ProcessorError> {
        let url = format!("{}/checkv2", self.config.url.trim_end_matches('/'));

        let mut request = Request::post(url.as_str()).header("content-type", "message/rfc822");
        if let Some(peer) = session.peer() {
            request = request.header("IP", peer.ip().to_string());
        }
        if let Some(ehlo) = session.ehlo() {
            request = request.header("Helo", ehlo);
        }

        let request = request
            .body(Full::new(Bytes::copy_from_slice(data)))
            .map_err(|e| ProcessorError::ScannerProtocol(e.to_string()))?;

        let timeout = Duration::from_secs(self.config.timeout_seconds.max(1));
        let response = tokio::time::timeout(timeout, self.client.request(request))
            .await
            .map_err(|_| ProcessorError::ScannerUnavailable(format!("{url}: timed out")))?
            .map_err(|e| ProcessorError::ScannerUnavailable(format!("{url}: {e}")))?;

        if !response.status().is_success() {
            return Err(ProcessorError::ScannerProtocol(format!(
                "rspamd returned HTTP {}",
                response.status()
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ProcessorError::ScannerProtocol(e.to_string()))?
            .to_bytes();

        let parsed: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| ProcessorError::ScannerProtocol(format!("bad rspamd reply: {e}")))?;

        parsed
            .get("score")
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| {
                ProcessorError::ScannerProtocol("rspamd reply is missing the score".to_string())
            })
    }
}

#[async_trait]
impl Processor for RspamdScanner {
    fn name(&self) -> &'static str {
        "rspamd"
    }

    async fn process(
        &self,
        session: &mut Session,
        data: &[u8],
    ) -> Result<ProcessorVerdict, ProcessorError> {
        let score = self.score(session, data).await?;
        let uid = session.uid().clone();

        if let Some(envelope) = session.current_envelope_mut() {
            envelope.record_scan("rspamd", format!("score={score:.2}"));
        }

        // Discard sits at or above reject; check it first.
        if score >= self.config.discard_threshold {
            tracing::info!(session = %uid, score, "spam score above discard threshold");
            return Ok(ProcessorVerdict::Discard);
        }

        if score >= self.config.reject_threshold {
            tracing::info!(session = %uid, score, "spam score above reject threshold");
            counter::increment(counter::SPAM_REJECTION);
            return Ok(ProcessorVerdict::Reject {
                status: Status::Error,
                message: format!("5.7.1 Spam rejected (score {score:.1})"),
            });
        }

        Ok(ProcessorVerdict::Continue)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::RspamdScanner;
    use crate::pipeline::{Processor, ProcessorVerdict};
    use robin_common::{config::RspamdConfig, envelope::Envelope, session::Session};

    /// One-shot HTTP responder returning a fixed rspamd JSON body.
    async fn mock_rspamd(score: f64) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let body = format!("{{\"score\":{score},\"symbols\":{{}}}}");
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 16 * 1024];
                    let _ = socket.read(&mut buf).await;
                    let reply = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(reply.as_bytes()).await;
                });
            }
        });

        addr
    }

    fn scanner(addr: std::net::SocketAddr) -> RspamdScanner {
        RspamdScanner::new(RspamdConfig {
            url: format!("http://{addr}"),
            reject_threshold: 10.0,
            discard_threshold: 20.0,
            timeout_seconds: 5,
        })
        .unwrap()
    }

    fn session() -> Session {
        let mut session = Session::inbound("127.0.0.1:25".parse().unwrap());
        session.open_envelope(Envelope::default());
        session
    }

    #[tokio::test]
    async fn low_score_continues() {
        let addr = mock_rspamd(1.5).await;
        let mut session = session();

        let verdict = scanner(addr)
            .process(&mut session, b"Subject: ham\r\n\r\nhi\r\n")
            .await
            .unwrap();

        assert_eq!(verdict, ProcessorVerdict::Continue);
        assert_eq!(
            session.envelopes()[0].scan_results()[0].verdict,
            "score=1.50"
        );
    }

    #[tokio::test]
    async fn reject_threshold_rejects() {
        let addr = mock_rspamd(12.0).await;
        let mut session = session();

        let verdict = scanner(addr)
            .process(&mut session, b"spam")
            .await
            .unwrap();

        assert!(matches!(verdict, ProcessorVerdict::Reject { .. }));
    }

    #[tokio::test]
    async fn discard_threshold_wins_over_reject() {
        let addr = mock_rspamd(25.0).await;
        let mut session = session();

        let verdict = scanner(addr)
            .process(&mut session, b"very spam")
            .await
            .unwrap();

        assert_eq!(verdict, ProcessorVerdict::Discard);
    }
}

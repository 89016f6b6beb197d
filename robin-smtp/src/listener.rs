//! Bound TCP acceptor with admission control and a bounded worker pool.
//!
//! Secure listeners wrap each socket in TLS on accept; plain and submission
//! listeners upgrade via STARTTLS inside the session. When the pool is
//! saturated the accept task runs the session itself, which stops it
//! accepting further sockets until the session ends — backpressure instead
//! of rejection. Shutdown closes the accept socket and drains the pool.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use futures_util::future::join_all;
use tokio::{net::TcpListener, sync::broadcast};
use tokio_rustls::TlsAcceptor;

use robin_common::{
    config::{ListenerConfig, ListenerKind},
    Signal,
};

use crate::{
    connection::{Connection, TlsInfo},
    error::{ListenerError, TlsError},
    session::{ServerSession, SessionConfig},
    tracker::ConnectionTracker,
};

/// How long in-flight sessions get to drain before they are aborted.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(30);

/// Supplies the session configuration for each accepted connection.
///
/// A plain [`SessionConfig`] is a fixed source. The binary installs a source
/// that re-derives the hot-reloadable knobs from the current configuration
/// snapshot, so sessions accepted after a reload see the new values;
/// structural state (the bound socket, TLS material, the shared tracker) is
/// fixed at startup.
pub trait SessionConfigSource: Send + Sync {
    fn session_config(&self) -> SessionConfig;
}

impl SessionConfigSource for SessionConfig {
    fn session_config(&self) -> SessionConfig {
        self.clone()
    }
}

/// Health statistics published by a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pool_size: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
}

impl ListenerStats {
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Sessions that would currently have to run on the accept task.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.active
            .load(Ordering::Relaxed)
            .saturating_sub(self.pool_size.load(Ordering::Relaxed))
    }
}

pub struct Listener {
    address: SocketAddr,
    kind: ListenerKind,
    acceptor: Option<TlsAcceptor>,
    workers: Arc<tokio::sync::Semaphore>,
    stats: Arc<ListenerStats>,
    source: Arc<dyn SessionConfigSource>,
}

impl Listener {
    /// Builds a listener; secure listeners require loadable TLS material.
    pub fn from_config(
        config: &ListenerConfig,
        source: impl SessionConfigSource + 'static,
    ) -> Result<Self, ListenerError> {
        let source: Arc<dyn SessionConfigSource> = Arc::new(source);
        let template = source.session_config();

        let address: SocketAddr = format!("{}:{}", config.address, config.port)
            .parse()
            .map_err(|_| ListenerError::Address(format!("{}:{}", config.address, config.port)))?;

        let acceptor = if config.kind == ListenerKind::Secure {
            let tls = template
                .tls
                .as_ref()
                .ok_or(TlsError::ProtocolInfoMissing("TLS material"))?;
            Some(Connection::<tokio::net::TcpStream>::acceptor(tls)?)
        } else {
            None
        };

        let stats = Arc::new(ListenerStats::default());
        stats.pool_size.store(config.workers, Ordering::Relaxed);

        Ok(Self {
            address,
            kind: config.kind,
            acceptor,
            workers: Arc::new(tokio::sync::Semaphore::new(config.workers.max(1))),
            stats,
            source,
        })
    }

    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    #[must_use]
    pub fn stats(&self) -> Arc<ListenerStats> {
        self.stats.clone()
    }

    /// Accept loop. Returns when a shutdown signal arrives and all in-flight
    /// sessions have drained.
    pub async fn serve(&self, shutdown: broadcast::Sender<Signal>) -> Result<(), ListenerError> {
        let listener =
            TcpListener::bind(self.address)
                .await
                .map_err(|source| ListenerError::Bind {
                    address: self.address.to_string(),
                    source,
                })?;

        tracing::info!(address = %self.address, kind = ?self.kind, "listening");

        let mut receiver = shutdown.subscribe();
        let mut sessions: Vec<tokio::task::JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                signal = receiver.recv() => {
                    if matches!(signal, Ok(Signal::Shutdown) | Err(_)) {
                        tracing::info!(address = %self.address, "draining sessions");
                        let drained = tokio::time::timeout(
                            SHUTDOWN_GRACE,
                            join_all(sessions.iter_mut()),
                        )
                        .await;

                        if drained.is_err() {
                            tracing::warn!(address = %self.address, "grace period over, aborting sessions");
                            for session in &sessions {
                                session.abort();
                            }
                        }
                        return Ok(());
                    }
                }

                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    sessions.retain(|handle: &tokio::task::JoinHandle<()>| !handle.is_finished());

                    // Fresh per accept, so a configuration reload applies to
                    // every session from here on.
                    let session_config = self.source.session_config();

                    let tracker = session_config.tracker.clone();
                    if !tracker.connection_opened(peer.ip()).admitted() {
                        tracing::info!(peer = %peer, "admission rejected, closing without greeting");
                        drop(stream);
                        continue;
                    }

                    let task = SessionTask {
                        kind: self.kind,
                        acceptor: self.acceptor.clone(),
                        config: session_config,
                        stats: self.stats.clone(),
                        shutdown: shutdown.subscribe(),
                    };

                    match self.workers.clone().try_acquire_owned() {
                        Ok(permit) => {
                            sessions.push(tokio::spawn(async move {
                                task.run(stream, peer).await;
                                drop(permit);
                            }));
                        }
                        Err(_) => {
                            // Saturated: run on the accept task for natural
                            // backpressure.
                            tracing::debug!(peer = %peer, "worker pool saturated, running on caller");
                            task.run(stream, peer).await;
                        }
                    }
                }
            }
        }
    }
}

struct SessionTask {
    kind: ListenerKind,
    acceptor: Option<TlsAcceptor>,
    config: SessionConfig,
    stats: Arc<ListenerStats>,
    shutdown: broadcast::Receiver<Signal>,
}

impl SessionTask {
    async fn run(self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        self.stats.active.fetch_add(1, Ordering::Relaxed);
        let tracker = self.config.tracker.clone();
        let stats = self.stats.clone();

        let result = self.run_inner(stream, peer).await;

        if let Err(error) = result {
            tracing::debug!(peer = %peer, %error, "session ended with error");
        }

        tracker.connection_closed(peer.ip());
        stats.active.fetch_sub(1, Ordering::Relaxed);
        stats.completed.fetch_add(1, Ordering::Relaxed);
    }

    async fn run_inner(
        self,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
    ) -> Result<(), crate::error::SessionError> {
        match (&self.kind, &self.acceptor) {
            (ListenerKind::Secure, Some(acceptor)) => {
                let stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(error) => {
                        tracing::debug!(peer = %peer, %error, "TLS accept failed");
                        return Ok(());
                    }
                };

                let info = TlsInfo::of(stream.get_ref().1).ok();
                let mut session =
                    ServerSession::create(Connection::tls(stream), peer, self.config);
                if let Some(info) = info {
                    session.set_tls_info(info.protocol(), info.cipher());
                }
                session.run(self.shutdown).await
            }
            _ => {
                let session = ServerSession::create(Connection::plain(stream), peer, self.config);
                session.run(self.shutdown).await
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use std::sync::Arc;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        sync::broadcast,
    };

    use super::Listener;
    use crate::{session::SessionConfig, tracker::ConnectionTracker};
    use robin_common::{
        config::{DosConfig, ListenerConfig, ListenerKind},
        Signal,
    };

    fn listener_config(port: u16) -> ListenerConfig {
        ListenerConfig {
            address: "127.0.0.1".to_string(),
            port,
            kind: ListenerKind::Inbound,
            tls: None,
            workers: 4,
        }
    }

    async fn bind_ephemeral(
        session_config: SessionConfig,
    ) -> (std::net::SocketAddr, broadcast::Sender<Signal>) {
        // Bind port 0 via the std listener first to find a free port.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let listener = Listener::from_config(&listener_config(port), session_config).unwrap();
        let address = listener.address();
        let (shutdown, _) = broadcast::channel(4);
        let sender = shutdown.clone();

        tokio::spawn(async move {
            let _ = listener.serve(sender).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        (address, shutdown)
    }

    #[tokio::test]
    async fn greets_and_serves_a_session() {
        let config = SessionConfig::builder().with_banner("mx.robin.test").build();
        let (address, _shutdown) = bind_ephemeral(config).await;

        let mut stream = TcpStream::connect(address).await.unwrap();
        let mut buf = vec![0u8; 512];
        let read = stream.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..read]).starts_with("220 mx.robin.test"));

        stream.write_all(b"QUIT\r\n").await.unwrap();
        let read = stream.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..read]).starts_with("221"));
    }

    #[tokio::test]
    async fn source_is_consulted_per_accept() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingSource {
            template: SessionConfig,
            accepts: AtomicUsize,
        }

        impl super::SessionConfigSource for CountingSource {
            fn session_config(&self) -> SessionConfig {
                let accept = self.accepts.fetch_add(1, Ordering::SeqCst);
                let mut config = self.template.clone();
                config.banner = format!("mx{accept}.robin.test");
                config
            }
        }

        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let source = CountingSource {
            template: SessionConfig::builder().with_banner("template").build(),
            accepts: AtomicUsize::new(0),
        };
        let listener = Listener::from_config(&listener_config(port), source).unwrap();
        let address = listener.address();
        let (shutdown, _) = broadcast::channel(4);
        let sender = shutdown.clone();
        tokio::spawn(async move {
            let _ = listener.serve(sender).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // from_config took snapshot zero; the accepts see one and two.
        let mut buf = vec![0u8; 512];
        for expected in ["220 mx1.robin.test", "220 mx2.robin.test"] {
            let mut stream = TcpStream::connect(address).await.unwrap();
            let read = stream.read(&mut buf).await.unwrap();
            let greeting = String::from_utf8_lossy(&buf[..read]).into_owned();
            assert!(greeting.starts_with(expected), "{greeting}");
        }
    }

    #[tokio::test]
    async fn admission_reject_closes_without_greeting() {
        let tracker = Arc::new(ConnectionTracker::new(DosConfig {
            max_connections_per_ip: 1,
            ..DosConfig::default()
        }));

        let config = SessionConfig::builder()
            .with_banner("mx.robin.test")
            .with_tracker(tracker)
            .build();
        let (address, _shutdown) = bind_ephemeral(config).await;

        // First connection is admitted and greeted.
        let mut first = TcpStream::connect(address).await.unwrap();
        let mut buf = vec![0u8; 512];
        let read = first.read(&mut buf).await.unwrap();
        assert!(read > 0);

        // Second from the same IP is closed with no greeting.
        let mut second = TcpStream::connect(address).await.unwrap();
        let read = second.read(&mut buf).await.unwrap();
        assert_eq!(read, 0);
    }
}

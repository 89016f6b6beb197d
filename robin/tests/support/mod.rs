//! Shared test support: an in-process listener harness, a scripted SMTP
//! dialogue client, and mock upstream servers.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader, AsyncBufReadExt},
    net::{TcpListener, TcpStream},
    sync::broadcast,
};

use robin_common::{config::ListenerConfig, Signal};
use robin_smtp::{listener::Listener, session::SessionConfig};

/// Reserves an ephemeral port. Racy in principle, fine for tests.
pub fn free_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe");
    let port = probe.local_addr().expect("probe addr").port();
    drop(probe);
    port
}

/// Starts a listener with the given session configuration and returns its
/// address plus the shutdown sender keeping it alive.
pub async fn start_listener(
    session_config: SessionConfig,
    workers: usize,
) -> (SocketAddr, broadcast::Sender<Signal>) {
    let listener_config = ListenerConfig {
        address: "127.0.0.1".to_string(),
        port: free_port(),
        kind: robin_common::config::ListenerKind::Inbound,
        tls: None,
        workers,
    };

    let listener =
        Listener::from_config(&listener_config, session_config).expect("listener config");
    let address = listener.address();

    let (shutdown, _) = broadcast::channel(8);
    let sender = shutdown.clone();
    tokio::spawn(async move {
        let _ = listener.serve(sender).await;
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    (address, shutdown)
}

/// A line-oriented SMTP dialogue driver.
pub struct Dialogue {
    stream: TcpStream,
}

impl Dialogue {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self { stream }
    }

    /// Reads whatever the server has to say (one or more reply lines).
    pub async fn read(&mut self) -> String {
        let mut buf = vec![0u8; 8192];
        let read = self.stream.read(&mut buf).await.expect("read reply");
        String::from_utf8_lossy(&buf[..read]).into_owned()
    }

    /// Reads until the connection closes; empty means an immediate close.
    pub async fn read_to_end(&mut self) -> String {
        let mut collected = Vec::new();
        let _ = self.stream.read_to_end(&mut collected).await;
        String::from_utf8_lossy(&collected).into_owned()
    }

    pub async fn send(&mut self, line: &str) -> String {
        self.stream
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("write command");
        self.read().await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write raw");
    }
}

/// What a mock upstream observed, for proxy assertions.
#[derive(Debug, Default)]
pub struct UpstreamLog {
    pub connections: AtomicUsize,
    pub commands: Mutex<Vec<String>>,
}

impl UpstreamLog {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock").clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.commands()
            .iter()
            .filter(|line| line.to_ascii_uppercase().starts_with(verb))
            .count()
    }
}

/// A minimal upstream SMTP server accepting everything, recording the
/// dialogue.
pub async fn mock_upstream() -> (SocketAddr, Arc<UpstreamLog>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    let log = Arc::new(UpstreamLog::default());

    let server_log = log.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            server_log.connections.fetch_add(1, Ordering::SeqCst);
            let log = server_log.clone();

            tokio::spawn(async move {
                let (read_half, mut write_half) = socket.into_split();
                let mut lines = BufReader::new(read_half).lines();

                if write_half.write_all(b"220 upstream ready\r\n").await.is_err() {
                    return;
                }

                let mut in_data = false;
                while let Ok(Some(line)) = lines.next_line().await {
                    if in_data {
                        if line == "." {
                            in_data = false;
                            if write_half.write_all(b"250 queued\r\n").await.is_err() {
                                return;
                            }
                        }
                        continue;
                    }

                    log.commands
                        .lock()
                        .expect("commands lock")
                        .push(line.clone());

                    let upper = line.to_ascii_uppercase();
                    let reply: &[u8] = if upper.starts_with("EHLO") {
                        b"250-upstream\r\n250 PIPELINING\r\n"
                    } else if upper.starts_with("DATA") {
                        in_data = true;
                        b"354 go ahead\r\n"
                    } else if upper.starts_with("QUIT") {
                        let _ = write_half.write_all(b"221 bye\r\n").await;
                        return;
                    } else {
                        b"250 ok\r\n"
                    };

                    if write_half.write_all(reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    (addr, log)
}

/// A mock clamd speaking just enough INSTREAM: anything containing the
/// EICAR marker is reported FOUND.
pub async fn mock_clamd() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind clamd");
    let addr = listener.local_addr().expect("clamd addr");

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut data = Vec::new();
                let mut chunk = [0u8; 8192];

                loop {
                    let Ok(read) = socket.read(&mut chunk).await else {
                        return;
                    };
                    if read == 0 {
                        return;
                    }
                    data.extend_from_slice(&chunk[..read]);
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

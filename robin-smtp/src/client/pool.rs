//! Bounded pool of live LMTP connections, keyed by destination.
//!
//! `borrow` hands out an idle connection when one is fresh enough, opens a
//! new one while under the size cap, and otherwise waits up to the borrow
//! timeout. Returned connections are RSET and re-parked; invalidated ones
//! are dropped. Closing the pool QUITs politely.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use robin_common::config::PoolConfig;

use super::{ConnectOptions, SmtpClient};
use crate::error::{ClientError, ClientResult};

struct Idle {
    client: SmtpClient,
    created: Instant,
    parked: Instant,
}

/// A connection borrowed from the pool. Give it back with
/// [`LmtpPool::give_back`] or drop it via [`LmtpPool::invalidate`]; either
/// way the pool slot is released.
pub struct PooledLmtp {
    client: SmtpClient,
    created: Instant,
    _permit: OwnedSemaphorePermit,
}

impl PooledLmtp {
    pub fn client(&mut self) -> &mut SmtpClient {
        &mut self.client
    }
}

#[derive(Debug)]
pub struct LmtpPool {
    target: String,
    lhlo_name: String,
    config: PoolConfig,
    idle: Mutex<Vec<Idle>>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for Idle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Idle").field("created", &self.created).finish()
    }
}

impl LmtpPool {
    #[must_use]
    pub fn new(target: impl Into<String>, lhlo_name: impl Into<String>, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_size.max(1)));
        Self {
            target: target.into(),
            lhlo_name: lhlo_name.into(),
            config,
            idle: Mutex::new(Vec::new()),
            permits,
        }
    }

    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn fresh(&self, idle: &Idle) -> bool {
        idle.parked.elapsed() <= Duration::from_secs(self.config.idle_timeout_seconds)
            && idle.created.elapsed() <= Duration::from_secs(self.config.max_lifetime_seconds)
    }

    /// Borrows a live connection, validating freshness, opening a new one
    /// under the cap, or waiting up to the borrow timeout.
    pub async fn borrow(&self) -> ClientResult<PooledLmtp> {
        let permit = tokio::time::timeout(
            Duration::from_secs(self.config.borrow_timeout_seconds),
            self.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| ClientError::PoolExhausted)?
        .map_err(|_| ClientError::PoolExhausted)?;

        // Reuse the freshest idle connection; retire stale ones.
        let mut stale = Vec::new();
        let reusable = {
            let mut idle = self.idle.lock();
            let mut found = None;
            while let Some(candidate) = idle.pop() {
                if self.fresh(&candidate) {
                    found = Some(candidate);
                    break;
                }
                stale.push(candidate);
            }
            found
        };

        for mut candidate in stale {
            candidate.client.quit().await;
        }

        if let Some(idle) = reusable {
            return Ok(PooledLmtp {
                client: idle.client,
                created: idle.created,
                _permit: permit,
            });
        }

        let mut client =
            SmtpClient::connect(&self.target, self.target.clone(), &ConnectOptions::default())
                .await?;

        let greeting = client.read_greeting().await?;
        if !greeting.is_success() {
            return Err(ClientError::UnexpectedResponse {
                code: greeting.code,
                message: greeting.message(),
            });
        }

        let lhlo = client.lhlo(&self.lhlo_name).await?;
        if !lhlo.is_success() {
            return Err(ClientError::UnexpectedResponse {
                code: lhlo.code,
                message: lhlo.message(),
            });
        }

        Ok(PooledLmtp {
            client,
            created: Instant::now(),
            _permit: permit,
        })
    }

    /// Returns a healthy connection to the pool after an RSET.
    pub async fn give_back(&self, mut pooled: PooledLmtp) {
        if pooled.created.elapsed() > Duration::from_secs(self.config.max_lifetime_seconds) {
            pooled.client.quit().await;
            return;
        }

        match pooled.client.rset().await {
            Ok(response) if response.is_success() => {
                self.idle.lock().push(Idle {
                    client: pooled.client,
                    created: pooled.created,
                    parked: Instant::now(),
                });
            }
            _ => pooled.client.quit().await,
        }
    }

    /// Drops a connection after an error; the slot frees immediately.
    pub fn invalidate(&self, pooled: PooledLmtp) {
        drop(pooled);
    }

    /// QUITs every idle connection.
    pub async fn close(&self) {
        let drained: Vec<Idle> = std::mem::take(&mut *self.idle.lock());
        for mut idle in drained {
            idle.client.quit().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use std::net::SocketAddr;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::LmtpPool;
    use robin_common::config::PoolConfig;

    async fn mock_lmtp_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    socket.write_all(b"220 mock LMTP ready\r\n").await.ok();
                    let mut buf = vec![0u8; 1024];

                    loop {
                        let Ok(read) = socket.read(&mut buf).await else {
                            break;
                        };
                        if read == 0 {
                            break;
                        }

                        let command = String::from_utf8_lossy(&buf[..read]);
                        let reply: &[u8] = if command.starts_with("LHLO") {
                            b"250-mock\r\n250 PIPELINING\r\n"
                        } else if command.starts_with("QUIT") {
                            b"221 Bye\r\n"
                        } else {
                            b"250 Ok\r\n"
                        };

                        if socket.write_all(reply).await.is_err() || command.starts_with("QUIT") {
                            break;
                        }
                    }
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn borrow_give_back_reuses_the_connection() {
        let addr = mock_lmtp_server().await;
        let pool = LmtpPool::new(addr.to_string(), "robin.test", PoolConfig::default());

        let borrowed = pool.borrow().await.unwrap();
        assert_eq!(pool.idle_count(), 0);

        pool.give_back(borrowed).await;
        assert_eq!(pool.idle_count(), 1);

        let _again = pool.borrow().await.unwrap();
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn invalidate_discards_the_connection() {
        let addr = mock_lmtp_server().await;
        let pool = LmtpPool::new(addr.to_string(), "robin.test", PoolConfig::default());

        let borrowed = pool.borrow().await.unwrap();
        pool.invalidate(borrowed);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn close_drains_idle_connections() {
        let addr = mock_lmtp_server().await;
        let pool = LmtpPool::new(addr.to_string(), "robin.test", PoolConfig::default());

        let borrowed = pool.borrow().await.unwrap();
        pool.give_back(borrowed).await;
        assert_eq!(pool.idle_count(), 1);

        pool.close().await;
        assert_eq!(pool.idle_count(), 0);
    }
}

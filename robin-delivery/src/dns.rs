//! MX resolution for outbound routing.
//!
//! MX records sorted by preference, with A/AAAA fallback per RFC 5321
//! section 5.1, behind a TTL'd cache.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
    TokioAsyncResolver,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("no mail servers found for domain {0}")]
    NoMailServers(String),

    #[error("domain does not exist: {0}")]
    DomainNotFound(String),

    #[error("lookup failed: {0}")]
    LookupFailed(String),
}

/// A resolved mail server with its MX preference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailServer {
    pub host: String,
    pub preference: u16,
}

struct CachedServers {
    servers: Arc<Vec<MailServer>>,
    expires_at: Instant,
}

pub struct MxResolver {
    resolver: TokioAsyncResolver,
    cache: DashMap<String, CachedServers>,
    cache_ttl: Duration,
}

impl std::fmt::Debug for MxResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MxResolver")
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl MxResolver {
    #[must_use]
    pub fn new(timeout: Duration, cache_ttl: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;

        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
            cache: DashMap::new(),
            cache_ttl,
        }
    }

    /// Resolves the mail servers for `domain`, preference-sorted.
    pub async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
        if let Some(cached) = self.cache.get(domain) {
            if cached.expires_at > Instant::now() {
                return Ok(cached.servers.clone());
            }
        }

        let servers = Arc::new(self.resolve_uncached(domain).await?);
        self.cache.insert(
            domain.to_string(),
            CachedServers {
                servers: servers.clone(),
                expires_at: Instant::now() + self.cache_ttl,
            },
        );

        Ok(servers)
    }

    async fn resolve_uncached(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let mut servers: Vec<MailServer> = lookup
                    .iter()
                    .map(|mx| MailServer {
                        host: mx.exchange().to_utf8().trim_end_matches('.').to_string(),
                        preference: mx.preference(),
                    })
                    .collect();

                if servers.is_empty() {
                    return self.fallback(domain).await;
                }

                servers.sort_by_key(|server| server.preference);
                Ok(servers)
            }
            Err(error) => {
                if matches!(error.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                    self.fallback(domain).await
                } else {
                    Err(DnsError::LookupFailed(error.to_string()))
                }
            }
        }
    }

    /// Implicit MX: the domain's own A/AAAA records at preference zero.
    async fn fallback(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => {
                let servers: Vec<MailServer> = lookup
                    .iter()
                    .map(|ip| MailServer {
                        host: ip.to_string(),
                        preference: 0,
                    })
                    .collect();

                if servers.is_empty() {
                    Err(DnsError::NoMailServers(domain.to_string()))
                } else {
                    Ok(servers)
                }
            }
            Err(error) => {
                if matches!(error.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                    Err(DnsError::DomainNotFound(domain.to_string()))
                } else {
                    Err(DnsError::LookupFailed(error.to_string()))
                }
            }
        }
    }
}

impl Default for MxResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }
}

#[cfg(test)]
mod test {
    use super::MailServer;

    #[test]
    fn preference_sorting() {
        let mut servers = [
            MailServer {
                host: "mx3.example.com".to_string(),
                preference: 30,
            },
            MailServer {
                host: "mx1.example.com".to_string(),
                preference: 10,
            },
            MailServer {
                host: "mx2.example.com".to_string(),
                preference: 20,
            },
        ];

        servers.sort_by_key(|server| server.preference);

        assert_eq!(servers[0].host, "mx1.example.com");
        assert_eq!(servers[2].host, "mx3.example.com");
    }
}

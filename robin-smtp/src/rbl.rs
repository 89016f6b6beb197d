//! DNSBL (realtime blackhole list) lookups and reverse DNS.
//!
//! Inbound plaintext peers are checked before the greeting; on TLS-wrapped
//! listeners the check is deferred to the first MAIL. Lookups fail open: a
//! resolver error or timeout never rejects a client.

use std::{net::IpAddr, time::Duration};

use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};

use robin_common::config::RblConfig;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RblVerdict {
    NotListed,
    Listed { provider: String },
}

impl RblVerdict {
    #[must_use]
    pub const fn is_listed(&self) -> bool {
        matches!(self, Self::Listed { .. })
    }
}

#[derive(Debug)]
pub struct RblClient {
    resolver: TokioAsyncResolver,
    config: RblConfig,
}

impl RblClient {
    #[must_use]
    pub fn new(config: RblConfig) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_seconds.max(1));

        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
            config,
        }
    }

    /// Whether a listing should reject the client, per configuration.
    #[must_use]
    pub const fn rejects(&self) -> bool {
        self.config.reject_enabled
    }

    #[must_use]
    pub fn has_providers(&self) -> bool {
        !self.config.providers.is_empty()
    }

    /// The reversed-octet query name for `ip` under `provider`.
    fn query_name(ip: IpAddr, provider: &str) -> String {
        match ip {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                format!(
                    "{}.{}.{}.{}.{provider}",
                    octets[3], octets[2], octets[1], octets[0]
                )
            }
            IpAddr::V6(v6) => {
                let mut nibbles = String::new();
                for byte in v6.octets().iter().rev() {
                    nibbles.push_str(&format!("{:x}.{:x}.", byte & 0x0f, byte >> 4));
                }
                format!("{nibbles}{provider}")
            }
        }
    }

    /// Checks `ip` against every configured provider, first listing wins.
    pub async fn check(&self, ip: IpAddr) -> RblVerdict {
        let timeout = Duration::from_secs(self.config.timeout_seconds.max(1));

        for provider in &self.config.providers {
            let name = Self::query_name(ip, provider);

            match tokio::time::timeout(timeout, self.resolver.lookup_ip(name.clone())).await {
                Ok(Ok(lookup)) if lookup.iter().next().is_some() => {
                    tracing::info!(ip = %ip, provider = %provider, "peer is listed");
                    return RblVerdict::Listed {
                        provider: provider.clone(),
                    };
                }
                Ok(_) => {}
                Err(_) => {
                    tracing::debug!(provider = %provider, "DNSBL lookup timed out");
                }
            }
        }

        RblVerdict::NotListed
    }

    /// Best-effort reverse DNS for the greeting line.
    pub async fn reverse_dns(&self, ip: IpAddr) -> Option<String> {
        let timeout = Duration::from_secs(self.config.timeout_seconds.max(1));

        match tokio::time::timeout(timeout, self.resolver.reverse_lookup(ip)).await {
            Ok(Ok(lookup)) => lookup
                .iter()
                .next()
                .map(|name| name.to_utf8().trim_end_matches('.').to_string()),
            _ => None,
        }
    }
}

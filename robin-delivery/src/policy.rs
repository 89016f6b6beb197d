//! Transport security policy: DANE (RFC 6698) and MTA-STS (RFC 8461).
//!
//! DANE pins the destination's certificate chain to its TLSA records: usage
//! 2/3 selects trust-anchor vs leaf, selector 0/1 full certificate vs
//! SubjectPublicKeyInfo, matching 0/1/2 exact vs SHA-256 vs SHA-512. The
//! first matching record wins; none aborts the connection. MTA-STS is an
//! HTTPS-published policy that requires TLS and constrains acceptable MX
//! hosts. A policy that demands TLS against a server without STARTTLS is a
//! typed, permanent failure.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
    proto::rr::{
        rdata::tlsa::{CertUsage, Matching, Selector},
        RData, RecordType,
    },
    TokioAsyncResolver,
};
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use tokio_rustls::rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    DigitallySignedStruct, SignatureScheme,
};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy lookup failed: {0}")]
    Lookup(String),

    #[error("unable to fetch MTA-STS policy: {0}")]
    Fetch(String),

    #[error("{0} does not offer STARTTLS but the policy requires TLS")]
    TlsUnavailable(String),

    #[error("{0} is not permitted by the MTA-STS policy")]
    MxNotPermitted(String),

    #[error("no TLSA record matched the presented chain for {0}")]
    NoTlsaMatch(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsaMatching {
    Exact,
    Sha256,
    Sha512,
}

/// One usable TLSA record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsaEntry {
    /// Usage 3 (DANE-EE) pins the leaf; usage 2 (DANE-TA) pins an anchor
    /// anywhere in the chain.
    pub is_end_entity: bool,
    /// Selector 1 matches the SubjectPublicKeyInfo, selector 0 the full
    /// certificate.
    pub is_spki: bool,
    pub matching: TlsaMatching,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct DanePolicy {
    pub entries: Vec<TlsaEntry>,
}

impl DanePolicy {
    fn material(cert: &CertificateDer<'_>, spki: bool) -> Option<Vec<u8>> {
        if spki {
            x509_parser::parse_x509_certificate(cert.as_ref())
                .ok()
                .map(|(_, parsed)| parsed.public_key().raw.to_vec())
        } else {
            Some(cert.as_ref().to_vec())
        }
    }

    fn entry_matches(entry: &TlsaEntry, cert: &CertificateDer<'_>) -> bool {
        let Some(material) = Self::material(cert, entry.is_spki) else {
            return false;
        };

        match entry.matching {
            TlsaMatching::Exact => material == entry.data,
            TlsaMatching::Sha256 => Sha256::digest(&material).as_slice() == entry.data,
            TlsaMatching::Sha512 => Sha512::digest(&material).as_slice() == entry.data,
        }
    }

    /// First-match-wins validation of a presented chain.
    #[must_use]
    pub fn matches_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> bool {
        for entry in &self.entries {
            if entry.is_end_entity {
                if Self::entry_matches(entry, end_entity) {
                    return true;
                }
            } else {
                // Trust-anchor usage may match anywhere in the chain.
                if Self::entry_matches(entry, end_entity)
                    || intermediates
                        .iter()
                        .any(|cert| Self::entry_matches(entry, cert))
                {
                    return true;
                }
            }
        }

        false
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StsMode {
    Enforce,
    Testing,
    #[default]
    None,
}

#[derive(Clone, Debug)]
pub struct StsPolicy {
    pub mode: StsMode,
    pub mx: Vec<String>,
    pub max_age: u64,
}

impl StsPolicy {
    /// Parses the `mta-sts.txt` key/value body.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let mut version_ok = false;
        let mut mode = StsMode::None;
        let mut mx = Vec::new();
        let mut max_age = 0;

        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match key.trim() {
                "version" => version_ok = value == "STSv1",
                "mode" => {
                    mode = match value {
                        "enforce" => StsMode::Enforce,
                        "testing" => StsMode::Testing,
                        _ => StsMode::None,
                    };
                }
                "mx" => mx.push(value.to_ascii_lowercase()),
                "max_age" => max_age = value.parse().unwrap_or(0),
                _ => {}
            }
        }

        version_ok.then_some(Self { mode, mx, max_age })
    }

    /// Whether the policy allows delivering to `host`.
    #[must_use]
    pub fn permits_mx(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();

        self.mx.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix("*.") {
                host.split_once('.')
                    .is_some_and(|(_, domain)| domain == suffix)
            } else {
                host == *pattern
            }
        })
    }
}

/// The security policy attached to an outbound session.
#[derive(Clone, Debug)]
pub enum SecurityPolicy {
    Dane(DanePolicy),
    MtaSts(StsPolicy),
}

impl SecurityPolicy {
    /// Whether delivery must abort rather than continue on plaintext.
    #[must_use]
    pub fn demands_tls(&self) -> bool {
        match self {
            Self::Dane(policy) => !policy.entries.is_empty(),
            Self::MtaSts(policy) => policy.mode == StsMode::Enforce,
        }
    }
}

type PolicyHttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Empty<Bytes>>;

/// Fetches TLSA records and MTA-STS policies for outbound destinations.
pub struct PolicyResolver {
    resolver: TokioAsyncResolver,
    http: Option<PolicyHttpClient>,
    timeout: Duration,
}

impl std::fmt::Debug for PolicyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyResolver")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PolicyResolver {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;

        let http = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map(|builder| {
                let connector = builder.https_only().enable_http1().build();
                Client::builder(TokioExecutor::new()).build(connector)
            })
            .map_err(|error| {
                tracing::warn!(%error, "native roots unavailable, MTA-STS fetching disabled");
            })
            .ok();

        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
            http,
            timeout,
        }
    }

    /// Looks up `_<port>._tcp.<host>` TLSA records. `Ok(None)` means the
    /// destination publishes none and DANE does not apply.
    pub async fn tlsa(&self, host: &str, port: u16) -> Result<Option<DanePolicy>, PolicyError> {
        let name = format!("_{port}._tcp.{host}.");

        let lookup = match self.resolver.lookup(name, RecordType::TLSA).await {
            Ok(lookup) => lookup,
            Err(error) => {
                return if matches!(error.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                    Ok(None)
                } else {
                    Err(PolicyError::Lookup(error.to_string()))
                };
            }
        };

        let mut entries = Vec::new();
        for record in lookup.iter() {
            let RData::TLSA(tlsa) = record else {
                continue;
            };

            let is_end_entity = match tlsa.cert_usage() {
                CertUsage::DomainIssued => true,
                CertUsage::TrustAnchor => false,
                // PKIX usages need web-PKI validation on top; out of scope.
                _ => continue,
            };

            let is_spki = match tlsa.selector() {
                Selector::Spki => true,
                Selector::Full => false,
                _ => continue,
            };

            let matching = match tlsa.matching() {
                Matching::Raw => TlsaMatching::Exact,
                Matching::Sha256 => TlsaMatching::Sha256,
                Matching::Sha512 => TlsaMatching::Sha512,
                _ => continue,
            };

            entries.push(TlsaEntry {
                is_end_entity,
                is_spki,
                matching,
                data: tlsa.cert_data().to_vec(),
            });
        }

        if entries.is_empty() {
            Ok(None)
        } else {
            Ok(Some(DanePolicy { entries }))
        }
    }

    /// Discovers and fetches the MTA-STS policy for `domain`. `Ok(None)`
    /// means the domain does not publish one.
    pub async fn mta_sts(&self, domain: &str) -> Result<Option<StsPolicy>, PolicyError> {
        // Discovery: the _mta-sts TXT record must exist.
        match self
            .resolver
            .txt_lookup(format!("_mta-sts.{domain}."))
            .await
        {
            Ok(lookup) => {
                let advertised = lookup
                    .iter()
                    .any(|txt| txt.to_string().starts_with("v=STSv1"));
                if !advertised {
                    return Ok(None);
                }
            }
            Err(error) => {
                return if matches!(error.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                    Ok(None)
                } else {
                    Err(PolicyError::Lookup(error.to_string()))
                };
            }
        }

        let Some(http) = &self.http else {
            return Err(PolicyError::Fetch("no HTTPS client available".to_string()));
        };

        let url = format!("https://mta-sts.{domain}/.well-known/mta-sts.txt");
        let request = Request::get(url.as_str())
            .body(Empty::new())
            .map_err(|e| PolicyError::Fetch(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, http.request(request))
            .await
            .map_err(|_| PolicyError::Fetch(format!("{url}: timed out")))?
            .map_err(|e| PolicyError::Fetch(format!("{url}: {e}")))?;

        if !response.status().is_success() {
            return Err(PolicyError::Fetch(format!(
                "{url}: HTTP {}",
                response.status()
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| PolicyError::Fetch(e.to_string()))?
            .to_bytes();

        Ok(StsPolicy::parse(&String::from_utf8_lossy(&body)))
    }
}

/// rustls certificate verifier enforcing a DANE policy.
///
/// TLSA pinning replaces web-PKI chain building: the chain is accepted if
/// and only if a TLSA record matches it.
#[derive(Debug)]
pub struct DaneVerifier {
    policy: DanePolicy,
    host: String,
}

impl DaneVerifier {
    #[must_use]
    pub fn new(policy: DanePolicy, host: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            policy,
            host: host.into(),
        })
    }
}

impl ServerCertVerifier for DaneVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        if self.policy.matches_chain(end_entity, intermediates) {
            Ok(ServerCertVerified::assertion())
        } else {
            tracing::warn!(host = %self.host, "TLSA validation failed, aborting");
            Err(tokio_rustls::rustls::Error::General(format!(
                "no TLSA record matched for {}",
                self.host
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use sha2::{Digest, Sha256};
    use tokio_rustls::rustls::pki_types::CertificateDer;

    use super::{DanePolicy, StsMode, StsPolicy, TlsaEntry, TlsaMatching};

    fn cert(bytes: &[u8]) -> CertificateDer<'static> {
        CertificateDer::from(bytes.to_vec())
    }

    #[test]
    fn exact_full_cert_match() {
        let der = b"certificate-bytes".to_vec();
        let policy = DanePolicy {
            entries: vec![TlsaEntry {
                is_end_entity: true,
                is_spki: false,
                matching: TlsaMatching::Exact,
                data: der.clone(),
            }],
        };

        assert!(policy.matches_chain(&cert(&der), &[]));
        assert!(!policy.matches_chain(&cert(b"other"), &[]));
    }

    #[test]
    fn sha256_full_cert_match() {
        let der = b"certificate-bytes".to_vec();
        let policy = DanePolicy {
            entries: vec![TlsaEntry {
                is_end_entity: true,
                is_spki: false,
                matching: TlsaMatching::Sha256,
                data: Sha256::digest(&der).to_vec(),
            }],
        };

        assert!(policy.matches_chain(&cert(&der), &[]));
    }

    #[test]
    fn trust_anchor_matches_intermediates() {
        let anchor = b"anchor-cert".to_vec();
        let policy = DanePolicy {
            entries: vec![TlsaEntry {
                is_end_entity: false,
                is_spki: false,
                matching: TlsaMatching::Exact,
                data: anchor.clone(),
            }],
        };

        assert!(policy.matches_chain(&cert(b"leaf"), &[cert(&anchor)]));
        assert!(!policy.matches_chain(&cert(b"leaf"), &[cert(b"unrelated")]));
    }

    #[test]
    fn first_match_wins_across_entries() {
        let der = b"leaf".to_vec();
        let policy = DanePolicy {
            entries: vec![
                TlsaEntry {
                    is_end_entity: true,
                    is_spki: false,
                    matching: TlsaMatching::Exact,
                    data: b"never".to_vec(),
                },
                TlsaEntry {
                    is_end_entity: true,
                    is_spki: false,
                    matching: TlsaMatching::Exact,
                    data: der.clone(),
                },
            ],
        };

        assert!(policy.matches_chain(&cert(&der), &[]));
    }

    #[test]
    fn sts_policy_parsing() {
        let policy = StsPolicy::parse(
            "version: STSv1\nmode: enforce\nmx: mail.example.com\nmx: *.backup.example.com\nmax_age: 86400\n",
        )
        .unwrap();

        assert_eq!(policy.mode, StsMode::Enforce);
        assert_eq!(policy.max_age, 86400);
        assert!(policy.permits_mx("mail.example.com"));
        assert!(policy.permits_mx("MX1.backup.example.com"));
        assert!(!policy.permits_mx("deep.mx1.backup.example.com"));
        assert!(!policy.permits_mx("evil.example.com"));

        assert!(StsPolicy::parse("version: STSv2\nmode: enforce\n").is_none());
    }

    #[test]
    fn testing_mode_does_not_demand_tls() {
        let enforce = super::SecurityPolicy::MtaSts(
            StsPolicy::parse("version: STSv1\nmode: enforce\nmx: a.b\nmax_age: 1").unwrap(),
        );
        let testing = super::SecurityPolicy::MtaSts(
            StsPolicy::parse("version: STSv1\nmode: testing\nmx: a.b\nmax_age: 1").unwrap(),
        );

        assert!(enforce.demands_tls());
        assert!(!testing.demands_tls());
    }
}

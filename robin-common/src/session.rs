//! Per-connection session context.
//!
//! A [`Session`] is created on socket accept (inbound) or when the router
//! builds an outbound delivery, and is exclusively owned by its handling
//! task. It is serialisable so the queue can persist outbound sessions
//! between retry attempts.

use std::net::{IpAddr, SocketAddr};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{envelope::Envelope, transaction::TransactionList};

/// Server-assigned identifier tagging all log, counter and response lines
/// for one connection: a UTC timestamp plus five random alphanumerics.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionUid(String);

impl SessionUid {
    #[must_use]
    pub fn generate() -> Self {
        let suffix: String = rand::rng()
            .sample_iter(rand::distr::Alphanumeric)
            .take(5)
            .map(char::from)
            .collect();

        Self(format!("{}{}", Utc::now().format("%Y%m%d%H%M%S"), suffix))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthState {
    #[default]
    Anonymous,
    User(String),
}

impl AuthState {
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self, Self::User(_))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsState {
    /// Plaintext connection.
    #[default]
    None,
    /// Upgraded mid-session via STARTTLS.
    StartTls,
    /// Accepted on a TLS-wrapped listener.
    SecurePort,
}

impl TlsState {
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// TLS requirement attached to an outbound route.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePolicy {
    /// Plaintext only.
    None,
    /// STARTTLS when offered, plaintext otherwise.
    #[default]
    Opportunistic,
    /// STARTTLS must succeed.
    Required,
    /// TLS with certificate pinned to the destination's TLSA records.
    Dane,
    /// TLS required by the destination domain's MTA-STS policy.
    MtaSts,
}

impl RoutePolicy {
    /// Whether this policy refuses to proceed on a plaintext channel.
    #[must_use]
    pub const fn demands_tls(&self) -> bool {
        matches!(self, Self::Required | Self::Dane | Self::MtaSts)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub mechanism: Mechanism,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mechanism {
    #[default]
    Plain,
    Login,
}

/// Outbound routing attached to a session destined for delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Route {
    /// Destination hosts, tried in order.
    pub hosts: Vec<String>,
    pub port: u16,
    /// Source address to bind, when the host is multi-homed.
    #[serde(default)]
    pub bind: Option<IpAddr>,
    /// Connection attempts per host before moving on.
    #[serde(default = "default_route_retry")]
    pub retry: u32,
    /// Seconds to sleep between connection attempts.
    #[serde(default = "default_route_delay")]
    pub delay_secs: u64,
    #[serde(default)]
    pub tls: RoutePolicy,
    #[serde(default)]
    pub auth: Option<Credentials>,
    /// Authenticate before the TLS upgrade (some submission hosts want this).
    #[serde(default)]
    pub auth_before_tls: bool,
}

const fn default_route_retry() -> u32 {
    1
}

const fn default_route_delay() -> u64 {
    5
}

impl Route {
    #[must_use]
    pub fn to_host(host: impl Into<String>, port: u16) -> Self {
        Self {
            hosts: vec![host.into()],
            port,
            bind: None,
            retry: default_route_retry(),
            delay_secs: default_route_delay(),
            tls: RoutePolicy::Opportunistic,
            auth: None,
            auth_before_tls: false,
        }
    }

    /// A route whose hosts are resolved from the recipient domain's MX
    /// records at delivery time.
    #[must_use]
    pub fn via_mx(port: u16) -> Self {
        Self {
            hosts: Vec::new(),
            ..Self::to_host("", port)
        }
    }

    /// Applies the administrator's `[outbound]` settings to this route:
    /// source bind, connection attempts per host, and the sleep between
    /// attempts.
    #[must_use]
    pub fn with_outbound(mut self, outbound: &crate::config::OutboundConfig) -> Self {
        self.bind = self.bind.or(outbound.bind);
        self.retry = outbound.retry.max(1);
        self.delay_secs = outbound.delay;
        self
    }
}

/// Ephemeral per-connection context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    uid: SessionUid,
    direction: Direction,
    peer: Option<SocketAddr>,
    rdns: Option<String>,
    ehlo: Option<String>,
    auth: AuthState,
    tls: TlsState,
    protocol: Option<String>,
    cipher: Option<String>,
    route: Option<Route>,
    envelopes: Vec<Envelope>,
    transactions: Vec<TransactionList>,
}

impl Session {
    #[must_use]
    pub fn inbound(peer: SocketAddr) -> Self {
        Self {
            uid: SessionUid::generate(),
            direction: Direction::Inbound,
            peer: Some(peer),
            rdns: None,
            ehlo: None,
            auth: AuthState::default(),
            tls: TlsState::default(),
            protocol: None,
            cipher: None,
            route: None,
            envelopes: Vec::new(),
            transactions: Vec::new(),
        }
    }

    #[must_use]
    pub fn outbound(route: Route) -> Self {
        Self {
            uid: SessionUid::generate(),
            direction: Direction::Outbound,
            peer: None,
            rdns: None,
            ehlo: None,
            auth: AuthState::default(),
            tls: TlsState::default(),
            protocol: None,
            cipher: None,
            route: Some(route),
            envelopes: Vec::new(),
            transactions: Vec::new(),
        }
    }

    #[must_use]
    pub const fn uid(&self) -> &SessionUid {
        &self.uid
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub const fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[must_use]
    pub fn rdns(&self) -> Option<&str> {
        self.rdns.as_deref()
    }

    pub fn set_rdns(&mut self, rdns: impl Into<String>) {
        self.rdns = Some(rdns.into());
    }

    #[must_use]
    pub fn ehlo(&self) -> Option<&str> {
        self.ehlo.as_deref()
    }

    pub fn set_ehlo(&mut self, ehlo: impl Into<String>) {
        self.ehlo = Some(ehlo.into());
    }

    #[must_use]
    pub const fn auth(&self) -> &AuthState {
        &self.auth
    }

    pub fn set_auth(&mut self, auth: AuthState) {
        self.auth = auth;
    }

    #[must_use]
    pub const fn tls(&self) -> TlsState {
        self.tls
    }

    pub fn set_tls(&mut self, tls: TlsState, protocol: Option<String>, cipher: Option<String>) {
        self.tls = tls;
        self.protocol = protocol;
        self.cipher = cipher;
    }

    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    #[must_use]
    pub fn cipher(&self) -> Option<&str> {
        self.cipher.as_deref()
    }

    #[must_use]
    pub const fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn set_route(&mut self, route: Route) {
        self.route = Some(route);
    }

    /// Begins a new envelope and its transaction log; returns its index.
    pub fn open_envelope(&mut self, envelope: Envelope) -> usize {
        self.envelopes.push(envelope);
        self.transactions.push(TransactionList::new());
        self.envelopes.len() - 1
    }

    /// Drops the most recently opened envelope (RSET mid-transaction).
    pub fn abort_envelope(&mut self) {
        self.envelopes.pop();
        self.transactions.pop();
    }

    #[must_use]
    pub fn envelopes(&self) -> &[Envelope] {
        &self.envelopes
    }

    #[must_use]
    pub fn current_envelope(&self) -> Option<&Envelope> {
        self.envelopes.last()
    }

    pub fn current_envelope_mut(&mut self) -> Option<&mut Envelope> {
        self.envelopes.last_mut()
    }

    pub fn current_transactions_mut(&mut self) -> Option<&mut TransactionList> {
        self.transactions.last_mut()
    }

    #[must_use]
    pub fn transactions(&self) -> &[TransactionList] {
        &self.transactions
    }

    /// Iterates envelope/transaction pairs mutably; the retry scheduler walks
    /// this after each delivery attempt.
    pub fn attempts_mut(
        &mut self,
    ) -> impl Iterator<Item = (&mut Envelope, &mut TransactionList)> {
        self.envelopes.iter_mut().zip(self.transactions.iter_mut())
    }

    /// Removes envelopes (and their logs) the given predicate rejects.
    pub fn retain_envelopes<F: FnMut(&Envelope) -> bool>(&mut self, mut keep: F) {
        let mut kept_envelopes = Vec::with_capacity(self.envelopes.len());
        let mut kept_transactions = Vec::with_capacity(self.transactions.len());

        for (envelope, transactions) in
            self.envelopes.drain(..).zip(self.transactions.drain(..))
        {
            if keep(&envelope) {
                kept_envelopes.push(envelope);
                kept_transactions.push(transactions);
            }
        }

        self.envelopes = kept_envelopes;
        self.transactions = kept_transactions;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::{Session, SessionUid};
    use crate::{address::parse_one, envelope::Envelope};

    #[test]
    fn uid_is_time_prefixed_and_unique() {
        let a = SessionUid::generate();
        let b = SessionUid::generate();

        assert_eq!(a.as_str().len(), 14 + 5);
        assert!(a.as_str()[..14].chars().all(|c| c.is_ascii_digit()));
        assert_ne!(a, b);
    }

    #[test]
    fn envelopes_and_transactions_stay_paired() {
        let mut session = Session::inbound("127.0.0.1:2525".parse().unwrap());

        let mut envelope = Envelope::new(Some(parse_one("a@ex.com").unwrap()));
        envelope.add_recipient(parse_one("b@ex.com").unwrap());
        session.open_envelope(envelope);
        session.open_envelope(Envelope::default());

        assert_eq!(session.envelopes().len(), 2);
        assert_eq!(session.transactions().len(), 2);

        session.retain_envelopes(|envelope| !envelope.is_terminal());
        assert_eq!(session.envelopes().len(), 1);
        assert_eq!(session.transactions().len(), 1);
    }

    #[test]
    fn abort_envelope_drops_latest() {
        let mut session = Session::inbound("127.0.0.1:2525".parse().unwrap());
        session.open_envelope(Envelope::default());
        session.abort_envelope();
        assert!(session.is_empty());
    }

    #[test]
    fn route_takes_outbound_settings() {
        let outbound = crate::config::OutboundConfig {
            bind: Some("192.0.2.9".parse().unwrap()),
            retry: 4,
            delay: 11,
            ..crate::config::OutboundConfig::default()
        };

        let route = super::Route::to_host("mx.example.com", 25).with_outbound(&outbound);
        assert_eq!(route.retry, 4);
        assert_eq!(route.delay_secs, 11);
        assert_eq!(route.bind, Some("192.0.2.9".parse().unwrap()));

        // An explicit per-route bind wins over the global one.
        let mut bound = super::Route::via_mx(25);
        bound.bind = Some("198.51.100.1".parse().unwrap());
        let bound = bound.with_outbound(&outbound);
        assert_eq!(bound.bind, Some("198.51.100.1".parse().unwrap()));
    }
}

//! Per-envelope proxy routing.
//!
//! Rules are evaluated in declared order; the first rule whose patterns,
//! direction filter and recipient policy all admit the recipient selects the
//! destination. Within a session, one live channel is kept per destination
//! tuple and reused by every envelope that routes to it; all channels are
//! closed exactly once when the session ends. A destination that failed once
//! is memoised for the rest of the session to avoid retry storms.

use ahash::{AHashMap, AHashSet};
use regex::Regex;

use robin_common::{
    config::{NonMatchingAction, ProxyProtocol, ProxyRuleConfig, RuleDirection},
    session::{Credentials, Mechanism, Session},
};

use crate::{
    client::{ConnectOptions, SmtpClient, TlsOptions},
    error::ProxyError,
};

#[derive(Debug)]
pub struct CompiledRule {
    pub index: usize,
    ip: Option<Regex>,
    ehlo: Option<Regex>,
    mail_from: Option<Regex>,
    rcpt: Option<Regex>,
    pub direction: RuleDirection,
    pub hosts: Vec<String>,
    pub port: u16,
    pub protocol: ProxyProtocol,
    pub tls: bool,
    pub auth: Option<Credentials>,
    pub non_matching: NonMatchingAction,
}

impl CompiledRule {
    /// Rule identity for connection reuse: the destination tuple.
    #[must_use]
    pub fn destination_key(&self) -> String {
        format!(
            "{}:{}:{:?}:{}:{}",
            self.hosts.join(","),
            self.port,
            self.protocol,
            self.tls,
            self.auth
                .as_ref()
                .map(|auth| auth.username.as_str())
                .unwrap_or_default(),
        )
    }

    fn session_matches(&self, session: &Session) -> bool {
        if !self.direction.matches(session.direction()) {
            return false;
        }

        let ip = session
            .peer()
            .map(|peer| peer.ip().to_string())
            .unwrap_or_default();
        let ehlo = session.ehlo().unwrap_or_default();
        let mail = session
            .current_envelope()
            .and_then(|envelope| envelope.sender())
            .and_then(|sender| sender.email())
            .unwrap_or_default();

        matches_or_wildcard(self.ip.as_ref(), &ip)
            && matches_or_wildcard(self.ehlo.as_ref(), ehlo)
            && matches_or_wildcard(self.mail_from.as_ref(), mail)
    }

    fn rcpt_matches(&self, rcpt: &str) -> bool {
        matches_or_wildcard(self.rcpt.as_ref(), rcpt)
    }
}

fn matches_or_wildcard(pattern: Option<&Regex>, value: &str) -> bool {
    pattern.is_none_or(|pattern| pattern.is_match(value))
}

/// Anchors a configured pattern so it matches the full string.
fn compile(pattern: Option<&String>) -> Result<Option<Regex>, regex::Error> {
    pattern
        .filter(|pattern| !pattern.is_empty())
        .map(|pattern| Regex::new(&format!("^(?:{pattern})$")))
        .transpose()
}

/// Routing decision for one recipient.
#[derive(Debug)]
pub enum Selection<'a> {
    /// No rule applies; normal local handling.
    NoMatch,
    /// A rule admitted the recipient without proxying it.
    Accept,
    /// A rule rejected the recipient.
    Reject,
    Proxy(&'a CompiledRule),
}

#[derive(Debug)]
pub struct ProxyEngine {
    rules: Vec<CompiledRule>,
    ehlo_name: String,
    connect: ConnectOptions,
}

impl ProxyEngine {
    pub fn compile(
        configs: &[ProxyRuleConfig],
        ehlo_name: impl Into<String>,
    ) -> Result<Self, ProxyError> {
        let mut rules = Vec::with_capacity(configs.len());

        for (index, config) in configs.iter().enumerate() {
            rules.push(CompiledRule {
                index,
                ip: compile(config.ip.as_ref())?,
                ehlo: compile(config.ehlo.as_ref())?,
                mail_from: compile(config.mail_from.as_ref())?,
                rcpt: compile(config.rcpt.as_ref())?,
                direction: config.direction,
                hosts: config.hosts.clone(),
                port: config.port,
                protocol: config.protocol,
                tls: config.tls,
                auth: config.auth.clone(),
                non_matching: config.non_matching,
            });
        }

        Ok(Self {
            rules,
            ehlo_name: ehlo_name.into(),
            connect: ConnectOptions::default(),
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluates the rule set for one recipient, in declared order.
    #[must_use]
    pub fn select(&self, session: &Session, rcpt: &str) -> Selection<'_> {
        let mut selected: Option<&CompiledRule> = None;

        for rule in &self.rules {
            if !rule.session_matches(session) {
                continue;
            }

            if rule.rcpt_matches(rcpt) {
                if let Some(first) = selected {
                    tracing::info!(
                        first = first.index,
                        ignored = rule.index,
                        rcpt,
                        "additional proxy rule match ignored"
                    );
                } else {
                    selected = Some(rule);
                }
                continue;
            }

            if selected.is_none() {
                match rule.non_matching {
                    NonMatchingAction::None => {}
                    NonMatchingAction::Accept => return Selection::Accept,
                    NonMatchingAction::Reject => return Selection::Reject,
                }
            }
        }

        selected.map_or(Selection::NoMatch, Selection::Proxy)
    }

    /// Opens the channel for a rule: TCP to the first reachable host, then
    /// EHLO/LHLO, STARTTLS when the rule says so, AUTH when configured.
    async fn open_channel(&self, rule: &CompiledRule) -> Result<ProxyChannel, ProxyError> {
        let mut client = None;

        for host in &rule.hosts {
            let address = format!("{host}:{}", rule.port);
            match SmtpClient::connect(&address, address.clone(), &self.connect).await {
                Ok(connected) => {
                    client = Some(connected);
                    break;
                }
                Err(error) => {
                    tracing::warn!(%error, host = %address, "proxy host unreachable");
                }
            }
        }

        let Some(mut client) = client else {
            return Err(ProxyError::NoReachableHost(rule.hosts.clone()));
        };

        let greeting = client.read_greeting().await?;
        if !greeting.is_success() {
            return Err(ProxyError::Handshake(greeting.summary()));
        }

        let hello = match rule.protocol {
            ProxyProtocol::Lmtp => client.lhlo(&self.ehlo_name).await?,
            ProxyProtocol::Esmtp => client.ehlo(&self.ehlo_name).await?,
            ProxyProtocol::Smtp => client.helo(&self.ehlo_name).await?,
        };
        if !hello.is_success() {
            return Err(ProxyError::Handshake(hello.summary()));
        }

        if rule.tls {
            let response = client.starttls(&TlsOptions::default()).await?;
            if response.code != 220 {
                return Err(ProxyError::Handshake(response.summary()));
            }
            let hello = client.ehlo(&self.ehlo_name).await?;
            if !hello.is_success() {
                return Err(ProxyError::Handshake(hello.summary()));
            }
        }

        if let Some(auth) = &rule.auth {
            let response = match auth.mechanism {
                Mechanism::Plain => client.auth_plain(&auth.username, &auth.password).await?,
                Mechanism::Login => client.auth_login(&auth.username, &auth.password).await?,
            };
            if response.code != 235 {
                return Err(ProxyError::Handshake(response.summary()));
            }
        }

        Ok(ProxyChannel {
            client,
            protocol: rule.protocol,
            mail_sent: false,
            pending_rcpts: 0,
        })
    }

    /// Forwards one RCPT over the rule's channel, opening it (and sending
    /// MAIL FROM for the current envelope) on first use. The proxy's reply
    /// is returned verbatim for the client.
    pub async fn forward_rcpt(
        &self,
        connections: &mut ProxyConnections,
        rule: &CompiledRule,
        session: &Session,
        rcpt: &str,
    ) -> Result<String, ProxyError> {
        let key = rule.destination_key();

        if connections.failed.contains(&key) {
            return Err(ProxyError::Memoised);
        }

        if !connections.channels.contains_key(&key) {
            match self.open_channel(rule).await {
                Ok(channel) => {
                    connections.channels.insert(key.clone(), channel);
                }
                Err(error) => {
                    connections.failed.insert(key);
                    return Err(error);
                }
            }
        }

        let channel = connections
            .channels
            .get_mut(&key)
            .ok_or(ProxyError::Memoised)?;

        if !channel.mail_sent {
            let sender = session
                .current_envelope()
                .and_then(|envelope| envelope.sender())
                .and_then(|sender| sender.email())
                .unwrap_or_default();

            let response = channel
                .client
                .command(&format!("MAIL FROM:<{sender}>"))
                .await?;
            if !response.is_success() {
                return Err(ProxyError::Handshake(response.summary()));
            }
            channel.mail_sent = true;
        }

        let response = channel.client.command(&format!("RCPT TO:<{rcpt}>")).await?;
        if response.is_success() {
            channel.pending_rcpts += 1;
        }

        Ok(response.summary())
    }

    /// Streams the accepted message over every channel that forwarded
    /// recipients for this envelope. The channels stay open for reuse.
    pub async fn stream_data(
        &self,
        connections: &mut ProxyConnections,
        data: &[u8],
    ) -> Vec<(String, Result<String, ProxyError>)> {
        let mut results = Vec::new();

        for (key, channel) in &mut connections.channels {
            if channel.pending_rcpts == 0 {
                channel.mail_sent = false;
                continue;
            }

            let result = Self::stream_one(channel, data).await;
            if result.is_err() {
                connections.failed.insert(key.clone());
            }
            results.push((key.clone(), result));

            channel.mail_sent = false;
            channel.pending_rcpts = 0;
        }

        // Channels that failed mid-stream are torn down.
        let failed = connections.failed.clone();
        for key in failed {
            if let Some(mut channel) = connections.channels.remove(&key) {
                channel.client.quit().await;
            }
        }

        results
    }

    async fn stream_one(channel: &mut ProxyChannel, data: &[u8]) -> Result<String, ProxyError> {
        let go_ahead = channel.client.data_begin().await?;
        if !go_ahead.is_intermediate() {
            return Err(ProxyError::Handshake(go_ahead.summary()));
        }

        match channel.protocol {
            ProxyProtocol::Lmtp => {
                let replies = channel
                    .client
                    .send_payload_lmtp(data, channel.pending_rcpts)
                    .await?;
                let failed = replies.iter().find(|reply| reply.is_error());
                match failed {
                    Some(reply) => Err(ProxyError::Handshake(reply.summary())),
                    None => Ok(replies
                        .first()
                        .map(super::client::Response::summary)
                        .unwrap_or_default()),
                }
            }
            ProxyProtocol::Esmtp | ProxyProtocol::Smtp => {
                let reply = channel.client.send_payload(data).await?;
                if reply.is_error() {
                    Err(ProxyError::Handshake(reply.summary()))
                } else {
                    Ok(reply.summary())
                }
            }
        }
    }
}

#[derive(Debug)]
struct ProxyChannel {
    client: SmtpClient,
    protocol: ProxyProtocol,
    mail_sent: bool,
    pending_rcpts: usize,
}

/// Live proxy channels for one session, keyed by destination tuple.
#[derive(Debug, Default)]
pub struct ProxyConnections {
    channels: AHashMap<String, ProxyChannel>,
    failed: AHashSet<String>,
    closed: bool,
}

impl ProxyConnections {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.channels.len()
    }

    /// Closes every channel. Guarded so the session's finally path closes
    /// each connection exactly once.
    pub async fn close_all(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for (_, mut channel) in self.channels.drain() {
            channel.client.quit().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::{ProxyEngine, Selection};
    use robin_common::{
        address::parse_one,
        config::{NonMatchingAction, ProxyRuleConfig},
        envelope::Envelope,
        session::Session,
    };

    fn rule(rcpt: Option<&str>, non_matching: NonMatchingAction) -> ProxyRuleConfig {
        ProxyRuleConfig {
            ip: None,
            ehlo: None,
            mail_from: None,
            rcpt: rcpt.map(str::to_string),
            direction: robin_common::config::RuleDirection::Both,
            hosts: vec!["relay.example.com".to_string()],
            port: 25,
            protocol: robin_common::config::ProxyProtocol::Esmtp,
            tls: false,
            auth: None,
            non_matching,
        }
    }

    fn session_with_envelope() -> Session {
        let mut session = Session::inbound("192.0.2.1:12345".parse().unwrap());
        session.open_envelope(Envelope::new(Some(parse_one("a@ex.com").unwrap())));
        session
    }

    #[test]
    fn first_matching_rule_wins() {
        let engine = ProxyEngine::compile(
            &[
                rule(Some(".*@one\\.example"), NonMatchingAction::None),
                rule(Some(".*@.*\\.example"), NonMatchingAction::None),
            ],
            "mx.robin.test",
        )
        .unwrap();

        let session = session_with_envelope();
        let selection = engine.select(&session, "user@one.example");
        let Selection::Proxy(rule) = selection else {
            panic!("expected a proxy selection, got {selection:?}");
        };
        assert_eq!(rule.index, 0);
    }

    #[test]
    fn patterns_are_full_string_matches() {
        let engine = ProxyEngine::compile(
            &[rule(Some("user@relay\\.example"), NonMatchingAction::None)],
            "mx.robin.test",
        )
        .unwrap();

        let session = session_with_envelope();
        assert!(matches!(
            engine.select(&session, "user@relay.example.com"),
            Selection::NoMatch
        ));
        assert!(matches!(
            engine.select(&session, "user@relay.example"),
            Selection::Proxy(_)
        ));
    }

    #[test]
    fn non_matching_action_applies() {
        let engine = ProxyEngine::compile(
            &[rule(Some(".*@relay\\.example"), NonMatchingAction::Reject)],
            "mx.robin.test",
        )
        .unwrap();

        let session = session_with_envelope();
        assert!(matches!(
            engine.select(&session, "other@elsewhere.example"),
            Selection::Reject
        ));
    }

    #[test]
    fn invalid_pattern_is_a_compile_error() {
        assert!(ProxyEngine::compile(
            &[rule(Some("(unclosed"), NonMatchingAction::None)],
            "mx.robin.test"
        )
        .is_err());
    }
}

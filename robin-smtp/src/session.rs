//! The inbound per-connection session loop.
//!
//! Commands are processed strictly in receive order: read a line, consult
//! the webhook seam, dispatch to the verb handler, write the reply as one
//! unit, then perform whatever follow-up I/O the handler asked for
//! (TLS upgrade, DATA intake, BDAT chunk, AUTH exchange). The proxy
//! channels opened on behalf of this session are closed exactly once on the
//! way out.

use std::{sync::Arc, time::Duration};

use mailparse::MailHeaderMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use robin_common::{
    config::{ListenerKind, ServerConfig, TlsConfig},
    counter,
    envelope::{self, MailData},
    session::{AuthState, Session, TlsState},
    status::Status,
    transaction::Transaction,
    Signal,
};

use crate::{
    auth::{decode_login_field, decode_plain, Authenticator, Credentials},
    command::Command,
    connection::Connection,
    dispatch::{Action, Registry, Reply, VerbContext},
    error::{CodecError, SessionError},
    extensions::Extension,
    proxy::{ProxyConnections, ProxyEngine},
    rbl::RblClient,
    sink::{MessageSink, SinkReply},
    state::State,
    tracker::{ConnectionTracker, TransferVerdict},
    verbs,
    webhook::{WebhookOutcome, WebhookSet},
};

/// Per-session resource limits, derived from the server configuration.
#[derive(Clone, Debug)]
pub struct Limits {
    /// Commands accepted before the connection is closed.
    pub transactions: u32,
    /// Syntax errors tolerated before the session is terminated.
    pub errors: u32,
    /// Envelopes per connection; zero disables.
    pub envelopes: u32,
    /// RCPT attempts per envelope; zero disables.
    pub recipients: u32,
    /// Message size ceiling in bytes; zero disables.
    pub size: usize,
    /// Idle read timeout.
    pub timeout: Duration,
}

impl Limits {
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            transactions: config.transactions_limit,
            errors: config.error_limit,
            envelopes: config.envelope_limit,
            recipients: config.recipients_limit,
            size: config.email_size_limit,
            timeout: Duration::from_secs(config.session_timeout.max(1)),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Everything a session needs beyond its socket.
#[derive(Clone)]
pub struct SessionConfig {
    pub banner: String,
    pub kind: ListenerKind,
    pub tls: Option<TlsConfig>,
    pub limits: Limits,
    pub sink: Option<Arc<dyn MessageSink>>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub rbl: Option<Arc<RblClient>>,
    pub tracker: Arc<ConnectionTracker>,
    pub webhooks: Arc<WebhookSet>,
    pub proxy: Arc<ProxyEngine>,
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("banner", &self.banner)
            .field("kind", &self.kind)
            .field("tls", &self.tls.is_some())
            .field("limits", &self.limits)
            .finish()
    }
}

impl SessionConfig {
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// The extension list advertised to this session right now; STARTTLS
    /// disappears once the channel is secure, AUTH only shows up with a
    /// configured authenticator.
    #[must_use]
    pub fn advertised_extensions(&self, session: &Session) -> Vec<Extension> {
        extensions_for(
            self.limits.size,
            self.tls.is_some() && !session.tls().is_secure(),
            self.authenticator.is_some(),
        )
    }
}

fn extensions_for(size: usize, tls: bool, auth: bool) -> Vec<Extension> {
    crate::extensions::default_set(size, tls, auth)
}

/// Builder for [`SessionConfig`].
#[derive(Default)]
pub struct SessionConfigBuilder {
    banner: String,
    kind: ListenerKind,
    tls: Option<TlsConfig>,
    limits: Option<Limits>,
    sink: Option<Arc<dyn MessageSink>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    rbl: Option<Arc<RblClient>>,
    tracker: Option<Arc<ConnectionTracker>>,
    webhooks: Option<Arc<WebhookSet>>,
    proxy: Option<Arc<ProxyEngine>>,
    registry: Option<Arc<Registry>>,
}

impl SessionConfigBuilder {
    #[must_use]
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = banner.into();
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: ListenerKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: Option<TlsConfig>) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = Some(limits);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    #[must_use]
    pub fn with_rbl(mut self, rbl: Arc<RblClient>) -> Self {
        self.rbl = Some(rbl);
        self
    }

    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<ConnectionTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    #[must_use]
    pub fn with_webhooks(mut self, webhooks: Arc<WebhookSet>) -> Self {
        self.webhooks = Some(webhooks);
        self
    }

    #[must_use]
    pub fn with_proxy(mut self, proxy: Arc<ProxyEngine>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn build(self) -> SessionConfig {
        SessionConfig {
            banner: if self.banner.is_empty() {
                std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
            } else {
                self.banner
            },
            kind: self.kind,
            tls: self.tls,
            limits: self.limits.unwrap_or_default(),
            sink: self.sink,
            authenticator: self.authenticator,
            rbl: self.rbl,
            tracker: self
                .tracker
                .unwrap_or_else(|| Arc::new(ConnectionTracker::disabled())),
            webhooks: self.webhooks.unwrap_or_default(),
            proxy: self.proxy.unwrap_or_else(|| {
                Arc::new(
                    ProxyEngine::compile(&[], "localhost").unwrap_or_else(|_| unreachable!()),
                )
            }),
            registry: self.registry.unwrap_or_else(verbs::builtin_registry),
        }
    }
}

/// Mutable protocol state threaded through the verb handlers.
#[derive(Debug)]
pub struct SmtpState {
    pub session: Session,
    pub state: State,
    pub errors_remaining: u32,
    pub commands: u32,
    pub tarpit_violations: u32,
    pub rbl_checked: bool,
    /// Accumulated BDAT payload.
    pub chunks: Vec<u8>,
    /// A BDAT transfer is in progress.
    pub chunking: bool,
    /// DATA was used in this transaction, excluding BDAT.
    pub used_data_verb: bool,
}

enum DataOutcome {
    Complete(Vec<u8>),
    Oversize,
}

pub struct ServerSession<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    connection: Connection<Stream>,
    config: SessionConfig,
    smtp: SmtpState,
    proxy: ProxyConnections,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> ServerSession<Stream> {
    #[must_use]
    pub fn create(
        connection: Connection<Stream>,
        peer: std::net::SocketAddr,
        config: SessionConfig,
    ) -> Self {
        let mut session = Session::inbound(peer);
        if config.kind == ListenerKind::Secure {
            session.set_tls(TlsState::SecurePort, None, None);
        }

        Self {
            connection,
            smtp: SmtpState {
                session,
                state: State::Connected,
                errors_remaining: config.limits.errors,
                commands: 0,
                tarpit_violations: 0,
                rbl_checked: false,
                chunks: Vec::new(),
                chunking: false,
                used_data_verb: false,
            },
            config,
            proxy: ProxyConnections::new(),
        }
    }

    /// Records the TLS parameters of a secure-port accept.
    pub fn set_tls_info(&mut self, protocol: String, cipher: String) {
        self.smtp
            .session
            .set_tls(TlsState::SecurePort, Some(protocol), Some(cipher));
    }

    #[must_use]
    pub fn uid(&self) -> String {
        self.smtp.session.uid().to_string()
    }

    /// Runs the session to completion. The proxy channels and the sink's
    /// per-session state are released exactly once, whatever the outcome.
    pub async fn run(
        mut self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        let uid = self.uid();
        tracing::debug!(session = %uid, peer = ?self.smtp.session.peer(), "connected");

        let result = self.serve(&mut shutdown).await;

        self.proxy.close_all().await;
        if let Some(sink) = &self.config.sink {
            sink.session_closed(&self.smtp.session).await;
        }

        match &result {
            Ok(()) => tracing::debug!(session = %uid, "closed"),
            Err(error) => tracing::info!(session = %uid, %error, "closed with error"),
        }

        result
    }

    async fn serve(
        &mut self,
        shutdown: &mut tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        if !self.greet().await? {
            return Ok(());
        }

        loop {
            if self.smtp.state.is_closing() {
                return Ok(());
            }

            if self.smtp.commands >= self.config.limits.transactions {
                self.reply_line(&format!(
                    "{} 4.7.0 Too many commands [{}]",
                    Status::Unavailable,
                    self.smtp.session.uid()
                ))
                .await?;
                return Ok(());
            }

            let read = tokio::select! {
                _ = shutdown.recv() => None,
                line = tokio::time::timeout(
                    self.config.limits.timeout,
                    self.connection.read_line(),
                ) => Some(line),
            };

            let Some(read) = read else {
                self.reply_line(&format!("{} Server shutting down", Status::Unavailable))
                    .await?;
                return Ok(());
            };

            let Some(line) = read.map_err(|_| SessionError::IdleTimeout)?? else {
                // Peer closed the connection.
                return Ok(());
            };

            if line.trim().is_empty() {
                continue;
            }

            self.smtp.commands += 1;
            tracing::trace!(session = %self.smtp.session.uid(), command = %line, "received");

            if !self.tarpit().await? {
                return Ok(());
            }

            let command = Command::try_from(line.as_str()).unwrap_or_else(|invalid| invalid);

            if let Command::Invalid(reason) = &command {
                if !self.syntax_error(reason).await? {
                    return Err(SessionError::TooManyErrors);
                }
                continue;
            }

            let key = command.key();

            match self.config.webhooks.intercept(&key, &self.smtp.session).await {
                WebhookOutcome::Proceed => {}
                WebhookOutcome::Reply(reply) => {
                    self.reply_line(&reply).await?;
                    continue;
                }
                WebhookOutcome::Deny => {
                    self.reply_line(&format!(
                        "{} 4.3.0 Hook failure [{}]",
                        Status::ActionAborted,
                        self.smtp.session.uid()
                    ))
                    .await?;
                    continue;
                }
            }

            let Ok(handler) = self.config.registry.server(&key) else {
                self.reply_line(&format!(
                    "{} 5.3.3 Unrecognized command [{}]",
                    Status::SyntaxError,
                    self.smtp.session.uid()
                ))
                .await?;
                continue;
            };

            let outcome = {
                let mut ctx = VerbContext {
                    state: &mut self.smtp,
                    config: &self.config,
                    proxy: &mut self.proxy,
                };
                handler.handle(&mut ctx, &command).await
            };

            if let Some(reply) = &outcome.reply {
                self.connection.send_lines(&reply.lines).await?;
            }

            match outcome.action {
                Action::None => {}
                Action::Close => return Ok(()),
                Action::StartTls => self.upgrade_tls().await?,
                Action::BeginData => self.receive_data_transaction().await?,
                Action::BeginChunk { size, last } => self.receive_chunk(size, last).await?,
                Action::Authenticate { mechanism, initial } => {
                    self.authenticate(&mechanism, initial).await?;
                }
            }
        }
    }

    /// Pre-greeting policy and the banner. Returns `false` when the peer was
    /// rejected before the greeting.
    async fn greet(&mut self) -> Result<bool, SessionError> {
        let peer_ip = self.smtp.session.peer().map(|peer| peer.ip());
        let rbl = self.config.rbl.clone();

        if let Some(rbl) = &rbl {
            if let Some(ip) = peer_ip {
                if let Some(rdns) = rbl.reverse_dns(ip).await {
                    self.smtp.session.set_rdns(rdns);
                }

                // Plaintext listeners check the DNSBL before the banner; on
                // TLS-wrapped ports the check is deferred to the first MAIL.
                if self.config.kind != ListenerKind::Secure {
                    self.smtp.rbl_checked = true;
                    if rbl.has_providers() && rbl.rejects() && rbl.check(ip).await.is_listed() {
                        counter::increment(counter::RBL_REJECTION);
                        self.reply_line(&format!(
                            "{} listed client [{}]",
                            Status::Error,
                            self.smtp.session.uid()
                        ))
                        .await?;
                        return Ok(false);
                    }
                }
            }
        } else if self.config.kind != ListenerKind::Secure {
            self.smtp.rbl_checked = true;
        }

        let rdns = self.smtp.session.rdns().unwrap_or("unknown").to_string();
        self.reply_line(&format!(
            "{} {} {rdns} ready [{}]",
            Status::ServiceReady,
            self.config.banner,
            self.smtp.session.uid()
        ))
        .await?;

        Ok(true)
    }

    /// Command-rate tarpit. Returns `false` when the session must close.
    async fn tarpit(&mut self) -> Result<bool, SessionError> {
        let Some(ip) = self.smtp.session.peer().map(|peer| peer.ip()) else {
            return Ok(true);
        };

        if !self.config.tracker.command_observed(ip) {
            return Ok(true);
        }

        self.smtp.tarpit_violations += 1;

        if self.smtp.tarpit_violations >= 3 {
            counter::increment(counter::TARPIT_DISCONNECT);
            tracing::info!(session = %self.smtp.session.uid(), "tarpit disconnect");
            self.reply_line(&format!(
                "{} {} closing [{}]",
                Status::GoodBye,
                self.config.banner,
                self.smtp.session.uid()
            ))
            .await?;
            return Ok(false);
        }

        let delay = self.config.tracker.tarpit_delay(self.smtp.tarpit_violations);
        tracing::debug!(
            session = %self.smtp.session.uid(),
            violations = self.smtp.tarpit_violations,
            ?delay,
            "tarpit delay"
        );
        tokio::time::sleep(delay).await;
        Ok(true)
    }

    /// Replies `500` and burns error budget. Returns `false` once the budget
    /// is exhausted and the termination notice has been sent.
    async fn syntax_error(&mut self, reason: &str) -> Result<bool, SessionError> {
        tracing::debug!(session = %self.smtp.session.uid(), reason, "syntax error");

        self.reply_line(&format!(
            "{} Syntax error [{}]",
            Status::SyntaxError,
            self.smtp.session.uid()
        ))
        .await?;

        self.smtp.errors_remaining = self.smtp.errors_remaining.saturating_sub(1);
        if self.smtp.errors_remaining == 0 {
            counter::increment(counter::ERROR_LIMIT_DISCONNECT);
            tracing::info!(session = %self.smtp.session.uid(), "error budget exhausted");
            self.reply_line(&format!(
                "{} 4.7.0 Too many errors [{}]",
                Status::Unavailable,
                self.smtp.session.uid()
            ))
            .await?;
            return Ok(false);
        }

        Ok(true)
    }

    async fn upgrade_tls(&mut self) -> Result<(), SessionError> {
        let Some(tls) = self.config.tls.clone() else {
            // The handler verified this; a missing context here is fatal.
            return Err(SessionError::Codec(CodecError::UnexpectedEof));
        };

        let info = self.connection.upgrade(&tls).await?;
        self.smtp.session.set_tls(
            TlsState::StartTls,
            Some(info.protocol()),
            Some(info.cipher()),
        );

        // RFC 3207: back to the start, the client must greet again.
        self.smtp.state = State::Connected;
        self.smtp.chunks.clear();
        self.smtp.chunking = false;

        tracing::debug!(
            session = %self.smtp.session.uid(),
            protocol = self.smtp.session.protocol(),
            "connection upgraded"
        );
        Ok(())
    }

    /// DATA intake: dot-terminated, dot-unstuffed, rate-guarded.
    async fn receive_data_transaction(&mut self) -> Result<(), SessionError> {
        match self.receive_data().await? {
            DataOutcome::Complete(body) => self.finalize_message(body).await,
            DataOutcome::Oversize => {
                self.reply_line(&format!(
                    "{} 5.3.4 Message exceeds maximum size [{}]",
                    Status::ExceededStorage,
                    self.smtp.session.uid()
                ))
                .await?;
                self.smtp.session.abort_envelope();
                self.smtp.state = State::Greeted;
                self.smtp.used_data_verb = false;
                Ok(())
            }
        }
    }

    async fn receive_data(&mut self) -> Result<DataOutcome, SessionError> {
        let started = Instant::now().into_std();
        let ip = self.smtp.session.peer().map(|peer| peer.ip());
        let mut body: Vec<u8> = Vec::new();
        let mut received: u64 = 0;
        let mut oversize = false;

        loop {
            let line = tokio::time::timeout(
                self.config.limits.timeout,
                self.connection.read_line(),
            )
            .await
            .map_err(|_| SessionError::IdleTimeout)??
            .ok_or(CodecError::UnexpectedEof)?;

            received += line.len() as u64 + 2;
            if let Some(ip) = ip {
                self.config.tracker.record_data_bytes(ip, line.len() as u64 + 2);
            }

            match self.config.tracker.transfer_verdict(started, received) {
                TransferVerdict::Ok => {}
                TransferVerdict::TooSlow => return Err(SessionError::SlowTransfer),
                TransferVerdict::TimedOut => return Err(SessionError::DataTimeout),
            }

            if line == "." {
                break;
            }

            let unstuffed = line.strip_prefix('.').unwrap_or(&line);

            if self.config.limits.size > 0
                && body.len() + unstuffed.len() + 2 > self.config.limits.size
            {
                // Keep draining to the dot, but stop buffering.
                oversize = true;
                body.clear();
            }

            if !oversize {
                body.extend_from_slice(unstuffed.as_bytes());
                body.extend_from_slice(b"\r\n");
            }
        }

        if oversize {
            Ok(DataOutcome::Oversize)
        } else {
            Ok(DataOutcome::Complete(body))
        }
    }

    /// One BDAT chunk: read exactly `size` bytes, then acknowledge. LAST
    /// finalizes the accumulated message.
    async fn receive_chunk(&mut self, size: usize, last: bool) -> Result<(), SessionError> {
        let started = Instant::now().into_std();

        tokio::time::timeout(
            self.config.limits.timeout.max(Duration::from_secs(30)),
            self.connection.read_exact_into(size, &mut self.smtp.chunks),
        )
        .await
        .map_err(|_| SessionError::IdleTimeout)??;

        if let Some(ip) = self.smtp.session.peer().map(|peer| peer.ip()) {
            self.config.tracker.record_data_bytes(ip, size as u64);
        }
        if self.config.tracker.transfer_verdict(started, size as u64)
            == TransferVerdict::TimedOut
        {
            return Err(SessionError::DataTimeout);
        }

        if self.config.limits.size > 0 && self.smtp.chunks.len() > self.config.limits.size {
            self.reply_line(&format!(
                "{} 5.3.4 Message exceeds maximum size [{}]",
                Status::ExceededStorage,
                self.smtp.session.uid()
            ))
            .await?;
            self.smtp.chunks.clear();
            self.smtp.chunking = false;
            self.smtp.session.abort_envelope();
            self.smtp.state = State::Greeted;
            return Ok(());
        }

        if last {
            let body = std::mem::take(&mut self.smtp.chunks);
            self.smtp.chunking = false;
            self.reply_line(&format!("{} Message OK, {size} octets received", Status::Ok))
                .await?;
            self.finalize_message(body).await
        } else {
            self.reply_line(&format!("{} {size} octets received", Status::Ok))
                .await
                .map_err(SessionError::from)
        }
    }

    /// Annotates the envelope, runs the storage pipeline, then streams the
    /// accepted message over any proxy channels with forwarded recipients.
    async fn finalize_message(&mut self, body: Vec<u8>) -> Result<(), SessionError> {
        self.annotate_envelope(&body);

        let reply = match &self.config.sink {
            Some(sink) => sink.deliver(&mut self.smtp.session, body.clone()).await,
            None => SinkReply::new(
                Status::Ok,
                format!("Ok: queued as {}", self.smtp.session.uid()),
            ),
        };

        let accepted = reply.accepted();

        if accepted && self.proxy.open_count() > 0 {
            for (destination, result) in self
                .config
                .proxy
                .stream_data(&mut self.proxy, &body)
                .await
            {
                match result {
                    Ok(_) => {
                        tracing::debug!(session = %self.smtp.session.uid(), destination, "proxied")
                    }
                    Err(error) => tracing::warn!(
                        session = %self.smtp.session.uid(),
                        destination,
                        %error,
                        "proxy stream failed"
                    ),
                }
            }
        }

        let line = format!("{} {}", reply.status, reply.message);
        if let Some(transactions) = self.smtp.session.current_transactions_mut() {
            transactions.record_data(Transaction::new("DATA", line.clone(), !accepted));
        }
        self.reply_line(&line).await?;

        if !accepted {
            self.smtp.session.abort_envelope();
        }

        self.smtp.state = State::Greeted;
        self.smtp.used_data_verb = false;
        Ok(())
    }

    /// Captures parsed header values and stamps message-id and date.
    fn annotate_envelope(&mut self, body: &[u8]) {
        let uid = self.smtp.session.uid().as_str().to_string();
        let hostname = self.config.banner.clone();

        let Some(current) = self.smtp.session.current_envelope_mut() else {
            return;
        };

        if let Ok(parsed) = mailparse::parse_mail(body) {
            for (header, key) in [
                ("From", envelope::HEADER_PARSED_FROM),
                ("Reply-To", envelope::HEADER_PARSED_REPLY_TO),
                (envelope::HEADER_FILENAME, envelope::HEADER_FILENAME),
                (envelope::HEADER_RELAY, envelope::HEADER_RELAY),
                (envelope::HEADER_CHAOS, envelope::HEADER_CHAOS),
            ] {
                if let Some(value) = parsed.headers.get_first_value(header) {
                    current.set_header(key, value);
                }
            }

            if let Some(message_id) = parsed.headers.get_first_value("Message-ID") {
                current.set_message_id(message_id);
            }
        }

        if current.message_id().is_none() {
            current.set_message_id(format!("<{uid}@{hostname}>"));
        }
        if current.date().is_none() {
            current.set_date(chrono::Utc::now().to_rfc2822());
        }
        current.set_data(MailData::Bytes(body.to_vec()));
    }

    /// Drives the AUTH PLAIN/LOGIN exchange after the verb handler accepted
    /// the mechanism.
    async fn authenticate(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<(), SessionError> {
        let credentials = match mechanism {
            "PLAIN" => {
                let payload = match initial {
                    Some(payload) => payload,
                    None => {
                        self.reply_line("334 ").await?;
                        match self.read_auth_line().await? {
                            Some(line) => line,
                            None => return Ok(()),
                        }
                    }
                };
                decode_plain(&payload)
            }
            "LOGIN" => {
                // Base64 "Username:" then "Password:".
                self.reply_line("334 VXNlcm5hbWU6").await?;
                let Some(username) = self.read_auth_line().await? else {
                    return Ok(());
                };
                self.reply_line("334 UGFzc3dvcmQ6").await?;
                let Some(password) = self.read_auth_line().await? else {
                    return Ok(());
                };

                decode_login_field(&username).and_then(|username| {
                    decode_login_field(&password).map(|password| Credentials {
                        username,
                        password,
                    })
                })
            }
            _ => {
                self.reply_line(&format!(
                    "504 5.5.4 Unrecognized authentication type {mechanism}"
                ))
                .await?;
                return Ok(());
            }
        };

        let credentials = match credentials {
            Ok(credentials) => credentials,
            Err(error) => {
                tracing::debug!(session = %self.smtp.session.uid(), %error, "bad AUTH payload");
                self.reply_line(&format!(
                    "{} 5.5.2 Cannot decode response [{}]",
                    Status::ArgumentError,
                    self.smtp.session.uid()
                ))
                .await?;
                return Ok(());
            }
        };

        let Some(authenticator) = &self.config.authenticator else {
            self.reply_line(&format!(
                "{} 5.5.1 Authentication not available",
                Status::NotImplemented
            ))
            .await?;
            return Ok(());
        };

        match authenticator.authenticate(&credentials).await {
            Ok(true) => {
                self.smtp
                    .session
                    .set_auth(AuthState::User(credentials.username.clone()));
                tracing::info!(
                    session = %self.smtp.session.uid(),
                    user = %credentials.username,
                    "authenticated"
                );
                self.reply_line(&format!(
                    "{} 2.7.0 Authentication successful",
                    Status::AuthSuccessful
                ))
                .await?;
            }
            Ok(false) => {
                self.reply_line(&format!(
                    "{} 5.7.8 Authentication credentials invalid [{}]",
                    Status::AuthFailed,
                    self.smtp.session.uid()
                ))
                .await?;
            }
            Err(error) => {
                tracing::warn!(session = %self.smtp.session.uid(), %error, "authenticator failure");
                self.reply_line(&format!(
                    "{} 4.7.0 Temporary authentication failure [{}]",
                    Status::ActionAborted,
                    self.smtp.session.uid()
                ))
                .await?;
            }
        }

        Ok(())
    }

    /// Reads one line of an AUTH exchange; `*` cancels per RFC 4954.
    async fn read_auth_line(&mut self) -> Result<Option<String>, SessionError> {
        let line = tokio::time::timeout(self.config.limits.timeout, self.connection.read_line())
            .await
            .map_err(|_| SessionError::IdleTimeout)??
            .ok_or(CodecError::UnexpectedEof)?;

        if line.trim() == "*" {
            self.reply_line(&format!(
                "{} 5.7.0 Authentication cancelled",
                Status::ArgumentError
            ))
            .await?;
            return Ok(None);
        }

        Ok(Some(line))
    }

    async fn reply_line(&mut self, line: &str) -> Result<(), CodecError> {
        tracing::trace!(session = %self.smtp.session.uid(), reply = %line, "sending");
        self.connection.send_line(line).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use std::sync::Arc;

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::{Limits, ServerSession, SessionConfig};
    use crate::{auth::StaticAuthenticator, connection::Connection, sink::AcceptingSink};
    use robin_common::{config::ListenerKind, Signal};

    async fn spawn_session(
        config: SessionConfig,
    ) -> (DuplexStream, tokio::task::JoinHandle<()>) {
        let (client, server) = duplex(64 * 1024);
        let session = ServerSession::create(
            Connection::plain(server),
            "127.0.0.1:12345".parse().unwrap(),
            config,
        );

        let (shutdown, _) = tokio::sync::broadcast::channel::<Signal>(1);
        let receiver = shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let _ = session.run(receiver).await;
            drop(shutdown);
        });

        (client, handle)
    }

    async fn read_reply(client: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 4096];
        let read = client.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..read]).into_owned()
    }

    fn config() -> SessionConfig {
        SessionConfig::builder()
            .with_banner("mx.robin.test")
            .with_sink(Arc::new(AcceptingSink))
            .build()
    }

    #[tokio::test]
    async fn clean_single_recipient_transaction() {
        let (mut client, handle) = spawn_session(config()).await;

        assert!(read_reply(&mut client).await.starts_with("220 mx.robin.test"));

        client.write_all(b"EHLO test\r\n").await.unwrap();
        let ehlo = read_reply(&mut client).await;
        assert!(ehlo.starts_with("250-mx.robin.test Hello test"));
        assert!(ehlo.contains("SIZE"));
        assert!(ehlo.contains("PIPELINING"));
        assert!(ehlo.contains("CHUNKING"));
        assert!(ehlo.contains("8BITMIME"));
        assert!(ehlo.contains("HELP"));

        client.write_all(b"MAIL FROM:<a@ex.com>\r\n").await.unwrap();
        assert!(read_reply(&mut client).await.starts_with("250"));

        client.write_all(b"RCPT TO:<b@ex.com>\r\n").await.unwrap();
        assert!(read_reply(&mut client).await.starts_with("250"));

        client.write_all(b"DATA\r\n").await.unwrap();
        assert!(read_reply(&mut client).await.starts_with("354"));

        client
            .write_all(b"Subject: hi\r\n\r\nbody line\r\n.\r\n")
            .await
            .unwrap();
        assert!(read_reply(&mut client).await.starts_with("250 Ok: queued as"));

        client.write_all(b"QUIT\r\n").await.unwrap();
        assert!(read_reply(&mut client).await.starts_with("221"));

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_verb_is_rejected_without_closing() {
        let (mut client, _handle) = spawn_session(config()).await;
        read_reply(&mut client).await;

        client.write_all(b"XCLIENT ADDR=1.2.3.4\r\n").await.unwrap();
        assert!(read_reply(&mut client).await.starts_with("500 5.3.3"));

        client.write_all(b"EHLO still-here\r\n").await.unwrap();
        assert!(read_reply(&mut client).await.starts_with("250"));
    }

    #[tokio::test]
    async fn error_budget_terminates_session() {
        let (mut client, handle) = spawn_session(config()).await;
        read_reply(&mut client).await;

        for _ in 0..2 {
            client.write_all(b"MAIL FROM:\r\n").await.unwrap();
            assert!(read_reply(&mut client).await.starts_with("500"));
        }

        client.write_all(b"MAIL FROM:\r\n").await.unwrap();
        let last = read_reply(&mut client).await;
        assert!(last.contains("500"));
        assert!(last.contains("421"));

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn rcpt_before_mail_is_a_bad_sequence() {
        let (mut client, _handle) = spawn_session(config()).await;
        read_reply(&mut client).await;

        client.write_all(b"EHLO test\r\n").await.unwrap();
        read_reply(&mut client).await;

        client.write_all(b"RCPT TO:<b@ex.com>\r\n").await.unwrap();
        assert!(read_reply(&mut client).await.starts_with("503"));
    }

    #[tokio::test]
    async fn duplicate_rcpt_is_deduped() {
        let sink = Arc::new(crate::sink::AcceptingSink);
        let config = SessionConfig::builder()
            .with_banner("mx.robin.test")
            .with_sink(sink)
            .build();

        let (mut client, _handle) = spawn_session(config).await;
        read_reply(&mut client).await;

        client.write_all(b"EHLO t\r\n").await.unwrap();
        read_reply(&mut client).await;
        client.write_all(b"MAIL FROM:<a@ex.com>\r\n").await.unwrap();
        read_reply(&mut client).await;
        client.write_all(b"RCPT TO:<b@ex.com>\r\n").await.unwrap();
        assert!(read_reply(&mut client).await.starts_with("250"));
        client.write_all(b"RCPT TO:<b@ex.com>\r\n").await.unwrap();
        // Accepted on the wire, deduped in the envelope.
        assert!(read_reply(&mut client).await.starts_with("250"));
    }

    #[tokio::test]
    async fn bdat_chunks_accumulate_and_finalize() {
        let (mut client, _handle) = spawn_session(config()).await;
        read_reply(&mut client).await;

        client.write_all(b"EHLO t\r\n").await.unwrap();
        read_reply(&mut client).await;
        client.write_all(b"MAIL FROM:<a@ex.com>\r\n").await.unwrap();
        read_reply(&mut client).await;
        client.write_all(b"RCPT TO:<b@ex.com>\r\n").await.unwrap();
        read_reply(&mut client).await;

        client.write_all(b"BDAT 6\r\nhello\n").await.unwrap();
        assert!(read_reply(&mut client).await.starts_with("250 6 octets"));

        client.write_all(b"BDAT 5 LAST\r\nworld").await.unwrap();
        let reply = read_reply(&mut client).await;
        assert!(reply.contains("250 Message OK"));
        assert!(reply.contains("queued as"));
    }

    #[tokio::test]
    async fn submission_requires_auth_before_mail() {
        let config = SessionConfig::builder()
            .with_banner("mx.robin.test")
            .with_kind(ListenerKind::Submission)
            .with_authenticator(Arc::new(
                StaticAuthenticator::default().with_user("user", "secret"),
            ))
            .build();

        let (mut client, _handle) = spawn_session(config).await;
        read_reply(&mut client).await;

        client.write_all(b"EHLO t\r\n").await.unwrap();
        let ehlo = read_reply(&mut client).await;
        assert!(ehlo.contains("AUTH PLAIN LOGIN"));

        client.write_all(b"MAIL FROM:<a@ex.com>\r\n").await.unwrap();
        assert!(read_reply(&mut client).await.starts_with("530 5.7.57"));

        // \0user\0secret
        client
            .write_all(b"AUTH PLAIN AHVzZXIAc2VjcmV0\r\n")
            .await
            .unwrap();
        assert!(read_reply(&mut client).await.starts_with("235"));

        client.write_all(b"MAIL FROM:<a@ex.com>\r\n").await.unwrap();
        assert!(read_reply(&mut client).await.starts_with("250"));
    }

    #[tokio::test]
    async fn size_limit_rejects_oversized_data() {
        let mut limits = Limits::default();
        limits.size = 64;
        let config = SessionConfig::builder()
            .with_banner("mx.robin.test")
            .with_limits(limits)
            .build();

        let (mut client, _handle) = spawn_session(config).await;
        read_reply(&mut client).await;

        client.write_all(b"EHLO t\r\n").await.unwrap();
        read_reply(&mut client).await;
        client.write_all(b"MAIL FROM:<a@ex.com>\r\n").await.unwrap();
        read_reply(&mut client).await;
        client.write_all(b"RCPT TO:<b@ex.com>\r\n").await.unwrap();
        read_reply(&mut client).await;
        client.write_all(b"DATA\r\n").await.unwrap();
        read_reply(&mut client).await;

        let long = vec![b'x'; 200];
        client.write_all(&long).await.unwrap();
        client.write_all(b"\r\n.\r\n").await.unwrap();
        assert!(read_reply(&mut client).await.starts_with("552"));
    }

    #[tokio::test]
    async fn declared_size_above_limit_is_rejected_at_mail() {
        let mut limits = Limits::default();
        limits.size = 1000;
        let config = SessionConfig::builder()
            .with_banner("mx.robin.test")
            .with_limits(limits)
            .build();

        let (mut client, _handle) = spawn_session(config).await;
        read_reply(&mut client).await;

        client.write_all(b"EHLO t\r\n").await.unwrap();
        read_reply(&mut client).await;
        client
            .write_all(b"MAIL FROM:<a@ex.com> SIZE=2000\r\n")
            .await
            .unwrap();
        assert!(read_reply(&mut client).await.starts_with("552"));
    }
}

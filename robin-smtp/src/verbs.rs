//! Built-in verb handlers, registered into the dispatch registry at startup.
//!
//! Each server handler validates sequencing against the session state,
//! mutates the session and produces the reply plus any follow-up action the
//! session loop must perform. Plugins replace or extend these through
//! [`Registry::register`].

use std::sync::Arc;

use async_trait::async_trait;

use robin_common::{
    config::ListenerKind,
    counter,
    envelope::Envelope,
    status::Status,
    transaction::Transaction,
};

use crate::{
    command::Command,
    dispatch::{Action, ClientVerb, Registry, Reply, ServerVerb, VerbContext, VerbOutcome},
    proxy::Selection,
    state::State,
};

fn bad_sequence(state: State) -> VerbOutcome {
    VerbOutcome::reply(Reply::status(
        Status::InvalidCommandSequence,
        format!("5.5.1 Bad sequence of commands in state {state}"),
    ))
}

#[derive(Debug)]
struct HeloVerb;

#[async_trait]
impl ServerVerb for HeloVerb {
    async fn handle(&self, ctx: &mut VerbContext<'_>, command: &Command) -> VerbOutcome {
        let (name, extended) = match command {
            Command::Helo(name) => (name, false),
            Command::Ehlo(name) => (name, true),
            _ => return bad_sequence(ctx.state.state),
        };

        if ctx.state.state == State::Reading {
            return bad_sequence(ctx.state.state);
        }

        // A new greeting aborts any open transaction.
        if ctx.state.state.in_transaction() {
            ctx.state.session.abort_envelope();
        }

        ctx.state.session.set_ehlo(name.clone());
        ctx.state.state = State::Greeted;
        ctx.state.chunks.clear();
        ctx.state.chunking = false;

        if !extended {
            return VerbOutcome::reply(Reply::status(
                Status::Ok,
                format!("{} Hello {name}", ctx.config.banner),
            ));
        }

        let extensions = ctx.config.advertised_extensions(&ctx.state.session);
        let mut lines = vec![format!("250-{} Hello {name}", ctx.config.banner)];
        for (idx, extension) in extensions.iter().enumerate() {
            let separator = if idx == extensions.len() - 1 { ' ' } else { '-' };
            lines.push(format!("250{separator}{extension}"));
        }
        if extensions.is_empty() {
            lines = vec![format!("250 {} Hello {name}", ctx.config.banner)];
        }

        VerbOutcome::reply(Reply::multi(lines))
    }
}

#[derive(Debug)]
struct StartTlsVerb;

#[async_trait]
impl ServerVerb for StartTlsVerb {
    async fn handle(&self, ctx: &mut VerbContext<'_>, _command: &Command) -> VerbOutcome {
        if ctx.state.session.tls().is_secure() {
            return VerbOutcome::reply(Reply::status(
                Status::InvalidCommandSequence,
                "5.5.1 TLS already active",
            ));
        }

        if ctx.state.state.in_transaction() {
            return VerbOutcome::reply(Reply::status(
                Status::InvalidCommandSequence,
                "5.5.1 STARTTLS not allowed during a mail transaction",
            ));
        }

        if ctx.config.tls.is_none() {
            return VerbOutcome::reply(Reply::raw("454 4.7.0 TLS not available"));
        }

        VerbOutcome::with_action(
            Some(Reply::status(Status::ServiceReady, "Ready to start TLS")),
            Action::StartTls,
        )
    }
}

#[derive(Debug)]
struct AuthVerb;

#[async_trait]
impl ServerVerb for AuthVerb {
    async fn handle(&self, ctx: &mut VerbContext<'_>, command: &Command) -> VerbOutcome {
        let Command::Auth { mechanism, initial } = command else {
            return bad_sequence(ctx.state.state);
        };

        if ctx.config.authenticator.is_none() {
            return VerbOutcome::reply(Reply::status(
                Status::NotImplemented,
                "5.5.1 Authentication not available",
            ));
        }

        if ctx.state.session.auth().is_authenticated() {
            return VerbOutcome::reply(Reply::status(
                Status::InvalidCommandSequence,
                "5.5.1 Already authenticated",
            ));
        }

        if ctx.state.state.in_transaction() {
            return bad_sequence(ctx.state.state);
        }

        if mechanism != "PLAIN" && mechanism != "LOGIN" {
            return VerbOutcome::reply(Reply::raw(format!(
                "504 5.5.4 Unrecognized authentication type {mechanism}"
            )));
        }

        VerbOutcome::with_action(
            None,
            Action::Authenticate {
                mechanism: mechanism.clone(),
                initial: initial.clone(),
            },
        )
    }
}

#[derive(Debug)]
struct MailVerb;

#[async_trait]
impl ServerVerb for MailVerb {
    async fn handle(&self, ctx: &mut VerbContext<'_>, command: &Command) -> VerbOutcome {
        let Command::MailFrom { sender, size } = command else {
            return bad_sequence(ctx.state.state);
        };

        if !ctx.state.state.can_mail() {
            return bad_sequence(ctx.state.state);
        }

        // Submission listeners require an authenticated user before MAIL.
        if ctx.config.kind == ListenerKind::Submission
            && !ctx.state.session.auth().is_authenticated()
        {
            return VerbOutcome::reply(Reply::status(
                Status::AuthRequired,
                format!("5.7.57 Authentication required [{}]", ctx.state.session.uid()),
            ));
        }

        // On TLS-wrapped listeners the RBL check was deferred to this point.
        if !ctx.state.rbl_checked {
            ctx.state.rbl_checked = true;
            if let (Some(rbl), Some(peer)) = (&ctx.config.rbl, ctx.state.session.peer()) {
                if rbl.has_providers() && rbl.rejects() {
                    let verdict = rbl.check(peer.ip()).await;
                    if verdict.is_listed() {
                        counter::increment(counter::RBL_REJECTION);
                        return VerbOutcome::with_action(
                            Some(Reply::status(
                                Status::Error,
                                format!("listed client [{}]", ctx.state.session.uid()),
                            )),
                            Action::Close,
                        );
                    }
                }
            }
        }

        let envelope_limit = ctx.config.limits.envelopes;
        if envelope_limit > 0 && ctx.state.session.envelopes().len() >= envelope_limit as usize {
            return VerbOutcome::reply(Reply::status(
                Status::InsufficientStorage,
                format!("4.5.3 Too many transactions [{}]", ctx.state.session.uid()),
            ));
        }

        if ctx.config.limits.size > 0 {
            if let Some(declared) = size {
                if *declared > ctx.config.limits.size {
                    return VerbOutcome::reply(Reply::status(
                        Status::ExceededStorage,
                        format!(
                            "5.3.4 Declared size {declared} exceeds maximum {} [{}]",
                            ctx.config.limits.size,
                            ctx.state.session.uid()
                        ),
                    ));
                }
            }
        }

        ctx.state.session.open_envelope(Envelope::new(sender.clone()));
        ctx.state.state = State::Mail;
        ctx.state.used_data_verb = false;

        if let Some(transactions) = ctx.state.session.current_transactions_mut() {
            transactions.record_mail(Transaction::new(command.to_string(), "250 Ok", false));
        }

        VerbOutcome::reply(Reply::status(Status::Ok, "Ok"))
    }
}

#[derive(Debug)]
struct RcptVerb;

#[async_trait]
impl ServerVerb for RcptVerb {
    async fn handle(&self, ctx: &mut VerbContext<'_>, command: &Command) -> VerbOutcome {
        let Command::RcptTo(recipient) = command else {
            return bad_sequence(ctx.state.state);
        };

        if !matches!(ctx.state.state, State::Mail | State::Rcpt) {
            return bad_sequence(ctx.state.state);
        }

        let limit = ctx.config.limits.recipients;
        let attempted = ctx
            .state
            .session
            .transactions()
            .last()
            .map_or(0, |transactions| transactions.rcpt().len());
        if limit > 0 && attempted >= limit as usize {
            return VerbOutcome::reply(Reply::status(
                Status::InsufficientStorage,
                format!("4.5.3 Too many recipients [{}]", ctx.state.session.uid()),
            ));
        }

        let Some(rcpt) = recipient.email().map(str::to_string) else {
            return VerbOutcome::reply(Reply::status(
                Status::ArgumentError,
                "5.1.3 Group addresses are not deliverable",
            ));
        };

        let uid = ctx.state.session.uid().clone();
        let (reply_line, error) = match ctx.config.proxy.select(&ctx.state.session, &rcpt) {
            Selection::Reject => (
                format!("{} 5.7.1 Recipient not permitted [{uid}]", Status::Error),
                true,
            ),
            Selection::NoMatch | Selection::Accept => {
                if let Some(envelope) = ctx.state.session.current_envelope_mut() {
                    envelope.add_recipient(recipient.clone());
                }
                (format!("{} Ok", Status::Ok), false)
            }
            Selection::Proxy(rule) => {
                let forwarded = ctx
                    .config
                    .proxy
                    .forward_rcpt(ctx.proxy, rule, &ctx.state.session, &rcpt)
                    .await;

                match forwarded {
                    // A proxied recipient is owned by the upstream channel;
                    // it is not added to the local envelope.
                    Ok(line) => {
                        let accepted = line.starts_with('2');
                        (line, !accepted)
                    }
                    Err(error) => {
                        tracing::warn!(%error, rcpt, "proxy forward failed");
                        (
                            format!(
                                "{} 4.4.1 Upstream unavailable [{uid}]",
                                Status::ActionAborted
                            ),
                            true,
                        )
                    }
                }
            }
        };

        if let Some(transactions) = ctx.state.session.current_transactions_mut() {
            transactions.record_rcpt(
                rcpt,
                Transaction::new(command.to_string(), reply_line.clone(), error),
            );
        }

        if !error {
            ctx.state.state = State::Rcpt;
        }

        VerbOutcome::reply(Reply::raw(reply_line))
    }
}

#[derive(Debug)]
struct DataVerb;

#[async_trait]
impl ServerVerb for DataVerb {
    async fn handle(&self, ctx: &mut VerbContext<'_>, _command: &Command) -> VerbOutcome {
        if ctx.state.chunking {
            return VerbOutcome::reply(Reply::status(
                Status::InvalidCommandSequence,
                "5.5.1 DATA may not follow BDAT",
            ));
        }

        match ctx.state.state {
            State::Rcpt => {
                ctx.state.state = State::Reading;
                ctx.state.used_data_verb = true;
                VerbOutcome::with_action(
                    Some(Reply::status(
                        Status::StartMailInput,
                        "End data with <CR><LF>.<CR><LF>",
                    )),
                    Action::BeginData,
                )
            }
            State::Mail => VerbOutcome::reply(Reply::status(
                Status::TransactionFailed,
                "5.5.1 No valid recipients",
            )),
            state => bad_sequence(state),
        }
    }
}

#[derive(Debug)]
struct BdatVerb;

#[async_trait]
impl ServerVerb for BdatVerb {
    async fn handle(&self, ctx: &mut VerbContext<'_>, command: &Command) -> VerbOutcome {
        let Command::Bdat { size, last } = command else {
            return bad_sequence(ctx.state.state);
        };

        if ctx.state.used_data_verb {
            return VerbOutcome::reply(Reply::status(
                Status::InvalidCommandSequence,
                "5.5.1 BDAT may not follow DATA",
            ));
        }

        let acceptable = matches!(ctx.state.state, State::Rcpt)
            || (ctx.state.state == State::Reading && ctx.state.chunking);
        if !acceptable {
            return bad_sequence(ctx.state.state);
        }

        ctx.state.state = State::Reading;
        ctx.state.chunking = true;

        // The reply follows once the chunk has been consumed.
        VerbOutcome::with_action(
            None,
            Action::BeginChunk {
                size: *size,
                last: *last,
            },
        )
    }
}

#[derive(Debug)]
struct RsetVerb;

#[async_trait]
impl ServerVerb for RsetVerb {
    async fn handle(&self, ctx: &mut VerbContext<'_>, _command: &Command) -> VerbOutcome {
        if ctx.state.state.in_transaction() {
            ctx.state.session.abort_envelope();
        }

        ctx.state.chunks.clear();
        ctx.state.chunking = false;
        ctx.state.used_data_verb = false;

        // TLS and authentication survive a reset.
        if ctx.state.state != State::Connected {
            ctx.state.state = State::Greeted;
        }

        VerbOutcome::reply(Reply::status(Status::Ok, "Ok"))
    }
}

#[derive(Debug)]
struct HelpVerb;

#[async_trait]
impl ServerVerb for HelpVerb {
    async fn handle(&self, ctx: &mut VerbContext<'_>, _command: &Command) -> VerbOutcome {
        let _ = ctx;
        VerbOutcome::reply(Reply::multi(vec![
            "214-Commands supported:".to_string(),
            "214 HELO EHLO STARTTLS AUTH MAIL RCPT DATA BDAT RSET HELP QUIT".to_string(),
        ]))
    }
}

#[derive(Debug)]
struct QuitVerb;

#[async_trait]
impl ServerVerb for QuitVerb {
    async fn handle(&self, ctx: &mut VerbContext<'_>, _command: &Command) -> VerbOutcome {
        ctx.state.state = State::Quit;
        VerbOutcome::with_action(
            Some(Reply::status(
                Status::GoodBye,
                format!("{} closing [{}]", ctx.config.banner, ctx.state.session.uid()),
            )),
            Action::Close,
        )
    }
}

/// Client-side formatting for a verb taking one argument in angle brackets.
#[derive(Debug)]
struct PathClient(&'static str);

impl ClientVerb for PathClient {
    fn format(&self, argument: &str) -> String {
        format!("{}:<{argument}>", self.0)
    }
}

/// Client-side formatting for a verb taking a bare argument.
#[derive(Debug)]
struct WordClient(&'static str);

impl ClientVerb for WordClient {
    fn format(&self, argument: &str) -> String {
        if argument.is_empty() {
            self.0.to_string()
        } else {
            format!("{} {argument}", self.0)
        }
    }
}

/// Priority of the built-in handlers; plugins register lower to replace.
pub const BUILTIN_PRIORITY: i32 = 100;

/// Builds the registry with both halves of every built-in verb.
#[must_use]
pub fn builtin_registry() -> Arc<Registry> {
    let registry = Registry::empty();
    let helo: Arc<dyn ServerVerb> = Arc::new(HeloVerb);

    registry.register(
        "HELO",
        BUILTIN_PRIORITY,
        Some(helo.clone()),
        Some(Arc::new(WordClient("HELO"))),
    );
    registry.register(
        "EHLO",
        BUILTIN_PRIORITY,
        Some(helo),
        Some(Arc::new(WordClient("EHLO"))),
    );
    // LHLO has no server half; inbound LMTP arrives via dedicated listeners.
    registry.register(
        "LHLO",
        BUILTIN_PRIORITY,
        None,
        Some(Arc::new(WordClient("LHLO"))),
    );
    registry.register(
        "STARTTLS",
        BUILTIN_PRIORITY,
        Some(Arc::new(StartTlsVerb)),
        Some(Arc::new(WordClient("STARTTLS"))),
    );
    registry.register(
        "AUTH",
        BUILTIN_PRIORITY,
        Some(Arc::new(AuthVerb)),
        Some(Arc::new(WordClient("AUTH"))),
    );
    registry.register(
        "MAIL",
        BUILTIN_PRIORITY,
        Some(Arc::new(MailVerb)),
        Some(Arc::new(PathClient("MAIL FROM"))),
    );
    registry.register(
        "RCPT",
        BUILTIN_PRIORITY,
        Some(Arc::new(RcptVerb)),
        Some(Arc::new(PathClient("RCPT TO"))),
    );
    registry.register(
        "DATA",
        BUILTIN_PRIORITY,
        Some(Arc::new(DataVerb)),
        Some(Arc::new(WordClient("DATA"))),
    );
    registry.register(
        "BDAT",
        BUILTIN_PRIORITY,
        Some(Arc::new(BdatVerb)),
        Some(Arc::new(WordClient("BDAT"))),
    );
    registry.register(
        "RSET",
        BUILTIN_PRIORITY,
        Some(Arc::new(RsetVerb)),
        Some(Arc::new(WordClient("RSET"))),
    );
    registry.register(
        "HELP",
        BUILTIN_PRIORITY,
        Some(Arc::new(HelpVerb)),
        Some(Arc::new(WordClient("HELP"))),
    );
    registry.register(
        "QUIT",
        BUILTIN_PRIORITY,
        Some(Arc::new(QuitVerb)),
        Some(Arc::new(WordClient("QUIT"))),
    );

    Arc::new(registry)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::builtin_registry;

    #[test]
    fn builtins_cover_both_halves() {
        let registry = builtin_registry();

        for verb in [
            "HELO", "EHLO", "STARTTLS", "AUTH", "MAIL", "RCPT", "DATA", "BDAT", "RSET", "HELP",
            "QUIT",
        ] {
            assert!(registry.server(verb).is_ok(), "server half missing for {verb}");
            assert!(registry.client(verb).is_ok(), "client half missing for {verb}");
        }

        // LHLO is client-only by design.
        assert!(registry.client("LHLO").is_ok());
        assert!(registry.server("LHLO").is_err());
    }

    #[test]
    fn client_halves_format_wire_commands() {
        let registry = builtin_registry();

        assert_eq!(
            registry.client("MAIL").unwrap().format("a@example.com"),
            "MAIL FROM:<a@example.com>"
        );
        assert_eq!(
            registry.client("RCPT").unwrap().format("b@example.com"),
            "RCPT TO:<b@example.com>"
        );
        assert_eq!(registry.client("EHLO").unwrap().format("mx"), "EHLO mx");
        assert_eq!(registry.client("DATA").unwrap().format(""), "DATA");
    }
}

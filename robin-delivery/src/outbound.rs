//! The outbound ESMTP/LMTP exchange for a queued relay session.
//!
//! Connects across the route's hosts with retry and delay, negotiates
//! STARTTLS and AUTH, then runs MAIL/RCPT/DATA per envelope with RSET
//! between envelopes on connection reuse. Every reply is captured in the
//! envelope's transaction list with its error bit; connection-level and
//! policy-level failures surface as typed [`DeliveryError`]s instead.

use std::time::Duration;

use robin_common::{
    config::OutboundConfig,
    envelope::{Envelope, MailData},
    session::{Mechanism, RoutePolicy, Route},
    transaction::{Transaction, TransactionList},
};
use robin_queue::{QueueProtocol, RelaySession};
use robin_smtp::{
    client::{ConnectOptions, Response, SmtpClient, TlsOptions},
    dispatch::Registry,
};

use crate::{
    dns::MxResolver,
    error::{DeliveryError, PermanentError, SystemError, TemporaryError},
    policy::{DaneVerifier, PolicyError, PolicyResolver, SecurityPolicy},
};

pub struct OutboundContext<'a> {
    pub registry: &'a Registry,
    pub policies: &'a PolicyResolver,
    pub mx: &'a MxResolver,
    pub options: &'a OutboundConfig,
    /// Our EHLO/LHLO name.
    pub hostname: &'a str,
    pub outbound_mx_enabled: bool,
}

async fn timed<T>(
    limit: Duration,
    what: &str,
    fut: impl std::future::Future<Output = Result<T, robin_smtp::error::ClientError>>,
) -> Result<T, DeliveryError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(DeliveryError::from),
        Err(_) => Err(TemporaryError::Timeout(what.to_string()).into()),
    }
}

/// The destination hosts for a route: explicit, or the recipient domain's
/// MX records.
async fn destination_hosts(
    entry: &RelaySession,
    route: &Route,
    ctx: &OutboundContext<'_>,
) -> Result<Vec<String>, DeliveryError> {
    if !route.hosts.is_empty() {
        return Ok(route.hosts.clone());
    }

    if !ctx.outbound_mx_enabled {
        return Err(SystemError::Internal(
            "route has no hosts and MX routing is disabled".to_string(),
        )
        .into());
    }

    let domain = entry
        .session
        .envelopes()
        .first()
        .and_then(|envelope| envelope.recipients().first())
        .and_then(|rcpt| rcpt.domain())
        .ok_or_else(|| SystemError::MissingData("no recipient domain to resolve".to_string()))?
        .to_string();

    let servers = ctx.mx.resolve(&domain).await?;
    Ok(servers.iter().map(|server| server.host.clone()).collect())
}

/// Resolves the security policy the route asks for.
async fn resolve_policy(
    route: &Route,
    host: &str,
    ctx: &OutboundContext<'_>,
) -> Result<Option<SecurityPolicy>, DeliveryError> {
    match route.tls {
        RoutePolicy::Dane => {
            let policy = ctx.policies.tlsa(host, route.port).await?;
            Ok(policy.map(SecurityPolicy::Dane))
        }
        RoutePolicy::MtaSts => {
            let domain = host.split_once('.').map_or(host, |(_, domain)| domain);
            let policy = ctx.policies.mta_sts(domain).await?;
            Ok(policy.map(SecurityPolicy::MtaSts))
        }
        _ => Ok(None),
    }
}

async fn connect(
    hosts: &[String],
    route: &Route,
    ctx: &OutboundContext<'_>,
) -> Result<(SmtpClient, String), DeliveryError> {
    let options = ConnectOptions {
        bind: route.bind.or(ctx.options.bind),
        timeout: Duration::from_secs(ctx.options.connect_timeout),
    };

    let retries = route.retry.max(1);
    let delay = Duration::from_secs(route.delay_secs);
    let mut last_error = None;

    for host in hosts {
        let address = format!("{host}:{}", route.port);

        for attempt in 1..=retries {
            match SmtpClient::connect(&address, host.clone(), &options).await {
                Ok(client) => return Ok((client, host.clone())),
                Err(error) => {
                    tracing::warn!(host = %address, attempt, %error, "connect failed");
                    last_error = Some(error);
                }
            }

            if attempt < retries {
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(last_error.map_or_else(
        || TemporaryError::ConnectionFailed("no destination hosts".to_string()).into(),
        DeliveryError::from,
    ))
}

fn record_envelope_failure(transactions: &mut TransactionList, envelope: &Envelope, reply: &str) {
    for recipient in envelope.recipients().iter() {
        if let Some(email) = recipient.email() {
            transactions.record_rcpt(
                email,
                Transaction::new(format!("RCPT TO:<{email}>"), reply.to_string(), true),
            );
        }
    }
}

fn classify(response: &Response, what: &str) -> DeliveryError {
    if response.is_permanent_error() {
        PermanentError::MessageRejected(format!("{what}: {}", response.summary())).into()
    } else {
        TemporaryError::SmtpTemporary(format!("{what}: {}", response.summary())).into()
    }
}

async fn authenticate(
    client: &mut SmtpClient,
    auth: Option<&robin_common::session::Credentials>,
) -> Result<(), DeliveryError> {
    let Some(auth) = auth else {
        return Ok(());
    };

    let response = match auth.mechanism {
        Mechanism::Plain => client.auth_plain(&auth.username, &auth.password).await,
        Mechanism::Login => client.auth_login(&auth.username, &auth.password).await,
    }
    .map_err(DeliveryError::from)?;

    if response.code == 235 {
        Ok(())
    } else {
        Err(PermanentError::AuthenticationFailed(response.summary()).into())
    }
}

/// Delivers every envelope of a queued relay session over one connection.
///
/// Per-recipient outcomes land in the transaction lists; the returned error
/// reflects connection- or policy-level failure of the whole attempt.
pub async fn deliver(
    entry: &mut RelaySession,
    ctx: &OutboundContext<'_>,
) -> Result<(), DeliveryError> {
    let route = entry
        .session
        .route()
        .cloned()
        .ok_or_else(|| SystemError::MissingData("queued session has no route".to_string()))?;

    let lmtp = entry.protocol == QueueProtocol::Lmtp;
    let hosts = destination_hosts(entry, &route, ctx).await?;
    let command_timeout = Duration::from_secs(ctx.options.command_timeout);

    let (mut client, host) = connect(&hosts, &route, ctx).await?;
    let policy = resolve_policy(&route, &host, ctx).await?;

    // MTA-STS constrains which MX hosts are acceptable at all.
    if let Some(SecurityPolicy::MtaSts(sts)) = &policy {
        if sts.mode == crate::policy::StsMode::Enforce && !sts.permits_mx(&host) {
            return Err(PolicyError::MxNotPermitted(host).into());
        }
    }

    let greeting = timed(command_timeout, "banner", client.read_greeting()).await?;
    if !greeting.is_success() {
        return Err(classify(&greeting, "greeting"));
    }

    let hello_verb = if lmtp { "LHLO" } else { "EHLO" };
    let hello_line = ctx
        .registry
        .client(hello_verb)
        .map_err(|e| SystemError::Internal(e.to_string()))?
        .format(ctx.hostname);

    let hello = timed(command_timeout, hello_verb, client.command(&hello_line)).await?;
    if !hello.is_success() {
        return Err(classify(&hello, hello_verb));
    }
    let supports_starttls = hello.advertises("STARTTLS");

    if route.auth_before_tls {
        authenticate(&mut client, route.auth.as_ref()).await?;
    }

    let tls_required =
        route.tls.demands_tls() || policy.as_ref().is_some_and(SecurityPolicy::demands_tls);

    if tls_required && !supports_starttls {
        // A policy-mandated TLS failure is typed and permanent, never a
        // soft failure.
        return Err(PolicyError::TlsUnavailable(host).into());
    }

    if supports_starttls && route.tls != RoutePolicy::None {
        let tls_options = match &policy {
            Some(SecurityPolicy::Dane(dane)) => TlsOptions {
                accept_invalid_certs: false,
                verifier: Some(DaneVerifier::new(dane.clone(), host.clone())),
            },
            _ => TlsOptions::default(),
        };

        let response = timed(command_timeout, "STARTTLS", client.starttls(&tls_options)).await?;
        if response.code != 220 {
            if tls_required {
                return Err(PolicyError::TlsUnavailable(host).into());
            }
            tracing::warn!(host = %host, reply = %response.summary(), "continuing without TLS");
        } else {
            // RFC 3207: greet again on the fresh channel.
            let hello = timed(command_timeout, hello_verb, client.command(&hello_line)).await?;
            if !hello.is_success() {
                return Err(classify(&hello, hello_verb));
            }
        }
    }

    if !route.auth_before_tls {
        authenticate(&mut client, route.auth.as_ref()).await?;
    }

    let mail_format = ctx
        .registry
        .client("MAIL")
        .map_err(|e| SystemError::Internal(e.to_string()))?;
    let rcpt_format = ctx
        .registry
        .client("RCPT")
        .map_err(|e| SystemError::Internal(e.to_string()))?;

    let mut first = true;
    for (envelope, transactions) in entry.session.attempts_mut() {
        if envelope.is_terminal() {
            continue;
        }

        if !first {
            let _ = timed(command_timeout, "RSET", client.rset()).await?;
        }
        first = false;

        let sender = envelope
            .sender()
            .and_then(|sender| sender.email())
            .unwrap_or_default();
        let mail_line = mail_format.format(sender);

        let response = timed(command_timeout, "MAIL", client.command(&mail_line)).await?;
        transactions.record_mail(Transaction::new(
            mail_line.clone(),
            response.summary(),
            !response.is_success(),
        ));

        if !response.is_success() {
            record_envelope_failure(transactions, envelope, &response.summary());
            continue;
        }

        let mut accepted = Vec::new();
        for recipient in envelope.recipients().iter() {
            let Some(email) = recipient.email() else {
                continue;
            };

            let rcpt_line = rcpt_format.format(email);
            let response = timed(command_timeout, "RCPT", client.command(&rcpt_line)).await?;
            let failed = !response.is_success();

            transactions.record_rcpt(
                email,
                Transaction::new(rcpt_line, response.summary(), failed),
            );

            if !failed {
                accepted.push(email.to_string());
            }
        }

        if accepted.is_empty() {
            continue;
        }

        let data = message_bytes(envelope)?;

        let response = timed(command_timeout, "DATA", client.data_begin()).await?;
        if !response.is_intermediate() {
            transactions.record_data(Transaction::new("DATA", response.summary(), true));
            continue;
        }

        if lmtp {
            // One reply per accepted recipient.
            let replies = timed(
                command_timeout,
                "message content",
                client.send_payload_lmtp(&data, accepted.len()),
            )
            .await?;

            for (email, reply) in accepted.iter().zip(replies.iter()) {
                transactions.record_rcpt(
                    email.clone(),
                    Transaction::new("DATA", reply.summary(), reply.is_error()),
                );
            }
            transactions.record_data(Transaction::new(
                "DATA",
                replies
                    .first()
                    .map(Response::summary)
                    .unwrap_or_default(),
                false,
            ));
        } else {
            let reply = timed(
                command_timeout,
                "message content",
                client.send_payload(&data),
            )
            .await?;
            transactions.record_data(Transaction::new(
                "DATA",
                reply.summary(),
                reply.is_error(),
            ));
        }
    }

    client.quit().await;
    Ok(())
}

/// The message bytes for an envelope's configured DATA source.
fn message_bytes(envelope: &Envelope) -> Result<Vec<u8>, DeliveryError> {
    match envelope.data() {
        Some(MailData::Bytes(bytes)) => Ok(bytes.clone()),
        Some(MailData::File(path)) => std::fs::read(path).map_err(|error| {
            SystemError::Io(std::io::Error::new(
                error.kind(),
                format!("{}: {error}", path.display()),
            ))
            .into()
        }),
        Some(MailData::Composed { subject, body }) => Ok(format!(
            "Subject: {subject}\r\nDate: {}\r\n\r\n{body}\r\n",
            chrono::Utc::now().to_rfc2822()
        )
        .into_bytes()),
        None => Err(SystemError::MissingData("envelope has no DATA source".to_string()).into()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::message_bytes;
    use robin_common::{
        address::parse_one,
        envelope::{Envelope, MailData},
    };

    #[test]
    fn message_bytes_from_each_source() {
        let mut envelope = Envelope::new(Some(parse_one("a@ex.com").unwrap()));
        assert!(message_bytes(&envelope).is_err());

        envelope.set_data(MailData::Bytes(b"raw".to_vec()));
        assert_eq!(message_bytes(&envelope).unwrap(), b"raw".to_vec());

        envelope.set_data(MailData::Composed {
            subject: "hello".to_string(),
            body: "world".to_string(),
        });
        let bytes = message_bytes(&envelope).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("Subject: hello\r\n"));
        assert!(text.ends_with("world\r\n"));
    }
}

//! The bridge between the inbound session and the delivery machinery: runs
//! the storage pipeline over each accepted message and turns the outcome
//! into queue entries.
//!
//! After the pipeline accepts a message this sink:
//! - queues a retry (or an immediate bounce) for recipients local delivery
//!   failed for,
//! - honours `X-Robin-Relay` by queueing a one-shot relay session,
//! - for submission (outbound) mail, saves the sender's copy and queues
//!   one relay session per recipient domain.

use std::sync::Arc;

use async_trait::async_trait;

use robin_common::{
    config::{FailureBehaviour, ListenerKind, OutboundConfig, RelayConfig},
    envelope::{Envelope, MailData, HEADER_RELAY},
    session::{Route, Session},
    status::Status,
};
use robin_queue::{FileQueue, QueueProtocol, RelaySession};
use robin_smtp::sink::{MessageSink, SinkReply};

use crate::{
    dsn,
    pipeline::{dovecot::DovecotDelivery, Pipeline, PipelineVerdict},
};

pub struct PipelineSink {
    pipeline: Arc<Pipeline>,
    queue: Arc<FileQueue>,
    relay: RelayConfig,
    outbound: OutboundConfig,
    kind: ListenerKind,
    hostname: String,
    failure_behaviour: FailureBehaviour,
    dovecot: Option<Arc<DovecotDelivery>>,
}

impl std::fmt::Debug for PipelineSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineSink")
            .field("kind", &self.kind)
            .field("hostname", &self.hostname)
            .finish()
    }
}

impl PipelineSink {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: Arc<Pipeline>,
        queue: Arc<FileQueue>,
        relay: RelayConfig,
        outbound: OutboundConfig,
        kind: ListenerKind,
        hostname: impl Into<String>,
        failure_behaviour: FailureBehaviour,
        dovecot: Option<Arc<DovecotDelivery>>,
    ) -> Self {
        Self {
            pipeline,
            queue,
            relay,
            outbound,
            kind,
            hostname: hostname.into(),
            failure_behaviour,
            dovecot,
        }
    }

    fn now_epoch() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Builds a queue entry delivering `envelope` with the given protocol.
    /// The route picks up the administrator's `[outbound]` settings.
    fn relay_entry(
        &self,
        envelope: Envelope,
        route: Route,
        protocol: QueueProtocol,
        mailbox: Option<String>,
    ) -> RelaySession {
        let mut session = Session::outbound(route.with_outbound(&self.outbound));
        session.open_envelope(envelope);
        RelaySession::new(session, protocol, self.relay.max_retry_count).with_mailbox(mailbox)
    }

    /// Queues the failed subset of local delivery for retry, or bounces it
    /// immediately, per `failure_behaviour`.
    fn handle_local_failures(&self, session: &mut Session) {
        if self.dovecot.is_none() {
            return;
        }

        let failed: Vec<String> = session
            .transactions()
            .last()
            .map(robin_common::transaction::TransactionList::failed_recipients)
            .unwrap_or_default();
        if failed.is_empty() {
            return;
        }

        let Some(envelope) = session.current_envelope() else {
            return;
        };

        let mut retry_envelope = envelope.clone();
        retry_envelope.keep_recipients(&failed);
        if retry_envelope.is_terminal() {
            return;
        }

        // The queue takes ownership of the stored file.
        if let Some(path) = retry_envelope.file_path().cloned() {
            match self.queue.import_file(&path) {
                Ok(owned) => retry_envelope.set_data(MailData::File(owned)),
                Err(error) => {
                    tracing::error!(%error, "unable to move envelope file into the queue");
                }
            }
        }

        let mut entry = self.relay_entry(
            retry_envelope,
            Route::via_mx(25),
            QueueProtocol::DovecotLda,
            self.relay.mailbox.clone(),
        );
        entry.record_attempt(Self::now_epoch());

        match self.failure_behaviour {
            FailureBehaviour::Retry => {
                tracing::info!(
                    session = %session.uid(),
                    failed = failed.len(),
                    retry = entry.retry_count(),
                    "queueing failed local deliveries for retry"
                );
                if let Err(error) = self.queue.enqueue(&entry) {
                    tracing::error!(%error, "unable to enqueue local retry");
                }
            }
            FailureBehaviour::Bounce => {
                let (envelope, transactions) = (
                    entry.session.envelopes().first().cloned(),
                    entry.session.transactions().first().cloned(),
                );
                if let (Some(envelope), Some(transactions)) = (envelope, transactions) {
                    if let Some(bounce) = dsn::generate(
                        &entry,
                        &envelope,
                        &transactions,
                        &self.hostname,
                        &self.outbound,
                    ) {
                        if let Err(error) = self.queue.enqueue(&bounce) {
                            tracing::error!(%error, "unable to enqueue bounce");
                        }
                    }
                }
            }
        }
    }

    /// `X-Robin-Relay: host[:port]` injects a one-shot relay session.
    fn handle_relay_header(&self, session: &Session, data: &[u8]) {
        if !self.relay.enabled || self.relay.disable_relay_header {
            return;
        }

        let Some(envelope) = session.current_envelope() else {
            return;
        };
        let Some(target) = envelope.header(HEADER_RELAY) else {
            return;
        };

        let (host, port) = match target.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(25)),
            None => (target.to_string(), 25),
        };

        if host.is_empty() || envelope.recipients().is_empty() {
            return;
        }

        let mut relay_envelope = envelope.clone();
        // The relay copy travels inside the queue entry itself.
        relay_envelope.set_data(MailData::Bytes(data.to_vec()));

        let entry = self.relay_entry(
            relay_envelope,
            Route::to_host(host.clone(), port),
            QueueProtocol::Esmtp,
            None,
        );

        tracing::info!(session = %session.uid(), host, port, "relay header queued");
        if let Err(error) = self.queue.enqueue(&entry) {
            tracing::error!(%error, "unable to enqueue relay-header session");
        }
    }

    /// Submission mail: save the sender's copy and queue one relay session
    /// per recipient domain.
    async fn handle_outbound(&self, session: &Session, data: &[u8]) {
        let Some(envelope) = session.current_envelope() else {
            return;
        };

        let sender = envelope
            .sender()
            .and_then(|sender| sender.email())
            .unwrap_or_default()
            .to_string();

        // The sender's own copy; failure here is logged, never fatal.
        if let Some(dovecot) = &self.dovecot {
            if !sender.is_empty() {
                if let Err(reason) = dovecot
                    .deliver_copy(
                        &sender,
                        data,
                        &self.relay.outbox,
                        envelope.file_path().map(std::path::PathBuf::as_path),
                    )
                    .await
                {
                    tracing::warn!(session = %session.uid(), %reason, "unable to save outbox copy");
                }
            }
        }

        // One queue entry per recipient domain.
        let mut domains: Vec<(String, Vec<String>)> = Vec::new();
        for recipient in envelope.recipients().iter() {
            let (Some(email), Some(domain)) = (recipient.email(), recipient.domain()) else {
                continue;
            };

            match domains.iter_mut().find(|(d, _)| d == domain) {
                Some((_, emails)) => emails.push(email.to_string()),
                None => domains.push((domain.to_string(), vec![email.to_string()])),
            }
        }

        for (domain, emails) in domains {
            let mut domain_envelope = envelope.clone();
            domain_envelope.keep_recipients(&emails);
            domain_envelope.set_data(MailData::Bytes(data.to_vec()));

            let entry = self.relay_entry(
                domain_envelope,
                Route::via_mx(25),
                QueueProtocol::Esmtp,
                None,
            );

            tracing::info!(session = %session.uid(), domain, "outbound mail queued");
            if let Err(error) = self.queue.enqueue(&entry) {
                tracing::error!(%error, "unable to enqueue outbound session");
            }
        }
    }
}

#[async_trait]
impl MessageSink for PipelineSink {
    async fn deliver(&self, session: &mut Session, data: Vec<u8>) -> SinkReply {
        let uid = session.uid().clone();

        match self.pipeline.run(session, &data).await {
            PipelineVerdict::Accepted => {
                if self.kind == ListenerKind::Submission {
                    self.handle_outbound(session, &data).await;
                } else {
                    self.handle_local_failures(session);
                }
                self.handle_relay_header(session, &data);

                SinkReply::new(Status::Ok, format!("Ok: queued as {uid}"))
            }
            PipelineVerdict::Discarded => {
                // Deliberately indistinguishable from acceptance.
                SinkReply::new(Status::Ok, format!("Ok: queued as {uid}"))
            }
            PipelineVerdict::Rejected { status, message } => {
                SinkReply::new(status, format!("{message} [{uid}]"))
            }
        }
    }
}

//! The retry scheduler: a single consumer draining the durable queue.
//!
//! Ticks every `queue_interval` seconds after `queue_initial_delay`. Each
//! tick dequeues up to `max_dequeue_per_tick` entries, gates them on the
//! exponential backoff, attempts delivery, and walks the per-envelope
//! transaction results: fully delivered envelopes drop (and their files are
//! deleted the same tick), partial failures shrink the recipient list to the
//! failed subset, exhausted entries turn into bounces. A bad entry never
//! kills the tick.

use std::{sync::Arc, time::Duration};

use rand::Rng;

use robin_common::{
    config::{OutboundConfig, RelayConfig},
    transaction::{Transaction, TransactionList},
    Signal,
};
use robin_queue::{FileQueue, QueueProtocol, RelaySession};
use robin_smtp::{client::pool::LmtpPool, dispatch::Registry};

use crate::{
    dns::MxResolver,
    dsn,
    error::DeliveryError,
    lda::LdaRunner,
    outbound::{self, OutboundContext},
    pipeline::store::remove_stored,
    policy::PolicyResolver,
};

/// Backoff jitter, applied multiplicatively.
const JITTER_FACTOR: f64 = 0.1;

/// Supplies the relay and outbound settings for one tick. The binary wires
/// this to the current configuration snapshot so a reload takes effect on
/// the next tick; without a source the startup values apply.
pub type SettingsSource = Arc<dyn Fn() -> (RelayConfig, OutboundConfig) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub max_dequeue_per_tick: usize,
    pub hostname: String,
    pub relay: RelayConfig,
    pub outbound: OutboundConfig,
}

pub struct RetryScheduler {
    queue: Arc<FileQueue>,
    registry: Arc<Registry>,
    policies: PolicyResolver,
    mx: MxResolver,
    lda: Arc<LdaRunner>,
    lmtp_pool: Arc<LmtpPool>,
    config: SchedulerConfig,
    settings: Option<SettingsSource>,
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("config", &self.config)
            .finish()
    }
}

impl RetryScheduler {
    #[must_use]
    pub fn new(
        queue: Arc<FileQueue>,
        registry: Arc<Registry>,
        lda: Arc<LdaRunner>,
        lmtp_pool: Arc<LmtpPool>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            policies: PolicyResolver::new(Duration::from_secs(10)),
            mx: MxResolver::default(),
            lda,
            lmtp_pool,
            config,
            settings: None,
        }
    }

    /// Installs a live settings source; each tick re-reads it.
    #[must_use]
    pub fn with_settings_source(mut self, settings: SettingsSource) -> Self {
        self.settings = Some(settings);
        self
    }

    /// The relay and outbound settings this tick runs with.
    fn effective(&self) -> (RelayConfig, OutboundConfig) {
        self.settings.as_ref().map_or_else(
            || (self.config.relay.clone(), self.config.outbound.clone()),
            |settings| settings(),
        )
    }

    /// Runs ticks until shutdown. The pool and the queue are closed on the
    /// way out.
    pub async fn serve(&self, mut shutdown: tokio::sync::broadcast::Receiver<Signal>) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.initial_delay) => {}
            _ = shutdown.recv() => return,
        }

        let mut timer = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = timer.tick() => self.tick().await,
                _ = shutdown.recv() => break,
            }
        }

        self.lmtp_pool.close().await;
        if let Err(error) = self.queue.close() {
            tracing::error!(%error, "unable to flush the queue on shutdown");
        }
    }

    fn now_epoch() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// The wait before retry number `retry_count + 1`, with jitter.
    #[allow(clippy::cast_precision_loss)]
    fn backoff_secs(relay: &RelayConfig, retry_count: u32) -> u64 {
        let base = relay.first_wait_minutes.saturating_mul(60) as f64;
        let factor = relay.growth_factor.max(1.0);
        let wait = base * factor.powi(i32::try_from(retry_count).unwrap_or(i32::MAX));

        let jitter = rand::rng().random_range(-JITTER_FACTOR..=JITTER_FACTOR);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let jittered = (wait * (1.0 + jitter)).max(0.0) as u64;
        jittered
    }

    fn due(relay: &RelayConfig, entry: &RelaySession) -> bool {
        if entry.retry_count() == 0 {
            return true;
        }
        let next_allowed = entry.last_attempt + Self::backoff_secs(relay, entry.retry_count() - 1);
        Self::now_epoch() >= next_allowed
    }

    /// One scheduler tick. Any failure is contained here; the scheduler
    /// never dies from a bad entry.
    pub async fn tick(&self) {
        // One settings read per tick; a reload applies from the next tick.
        let (relay, outbound) = self.effective();

        for _ in 0..self.config.max_dequeue_per_tick {
            let entry = match self.queue.dequeue() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    tracing::error!(%error, "queue dequeue failed");
                    break;
                }
            };

            if !Self::due(&relay, &entry) {
                // Not yet allowed: back to the tail.
                if let Err(error) = self.queue.enqueue(&entry) {
                    tracing::error!(%error, "unable to re-enqueue waiting entry");
                }
                continue;
            }

            let uid = entry.session.uid().clone();
            if let Err(error) = self.attempt(entry, &relay, &outbound).await {
                tracing::error!(session = %uid, %error, "delivery attempt failed internally");
            }
        }
    }

    async fn attempt(
        &self,
        mut entry: RelaySession,
        relay: &RelayConfig,
        outbound: &OutboundConfig,
    ) -> Result<(), DeliveryError> {
        // A fresh attempt starts from a clean transcript.
        for (_, transactions) in entry.session.attempts_mut() {
            transactions.clear();
        }

        let result = match entry.protocol {
            QueueProtocol::DovecotLda => {
                self.deliver_lda(&mut entry).await;
                Ok(())
            }
            QueueProtocol::Esmtp | QueueProtocol::Smtp | QueueProtocol::Lmtp => {
                let ctx = OutboundContext {
                    registry: &self.registry,
                    policies: &self.policies,
                    mx: &self.mx,
                    options: outbound,
                    hostname: &self.config.hostname,
                    outbound_mx_enabled: relay.outbound_mx_enabled,
                };
                outbound::deliver(&mut entry, &ctx).await
            }
        };

        match result {
            Ok(()) => self.settle(entry, relay, outbound).await,
            Err(error) if error.is_permanent() => {
                tracing::info!(
                    session = %entry.session.uid(),
                    %error,
                    "permanent failure, bouncing without further retries"
                );
                self.mark_all_failed(&mut entry, &error.to_string());
                self.bounce_remaining(entry, relay, outbound).await;
                Ok(())
            }
            Err(error) => {
                tracing::info!(
                    session = %entry.session.uid(),
                    retry = entry.retry_count(),
                    %error,
                    "attempt failed"
                );
                self.mark_all_failed(&mut entry, &error.to_string());
                self.requeue_or_bounce(entry, relay, outbound).await;
                Ok(())
            }
        }
    }

    /// Local delivery through the LDA, one invocation per recipient.
    async fn deliver_lda(&self, entry: &mut RelaySession) {
        let mailbox = entry.mailbox.clone();

        for (envelope, transactions) in entry.session.attempts_mut() {
            let Some(path) = envelope.file_path().cloned() else {
                for recipient in envelope.recipients().iter() {
                    if let Some(email) = recipient.email() {
                        transactions.record_rcpt(
                            email,
                            Transaction::new(
                                format!("DELIVER {email}"),
                                "550 5.3.0 stored message file is missing",
                                true,
                            ),
                        );
                    }
                }
                continue;
            };

            for recipient in envelope.recipients().iter() {
                let Some(email) = recipient.email() else {
                    continue;
                };

                let (reply, error) = match self
                    .lda
                    .deliver(email, &path, mailbox.as_deref())
                    .await
                {
                    Ok(()) => ("250 2.0.0 Delivered".to_string(), false),
                    Err(failure) => (format!("550 {failure}"), true),
                };

                transactions.record_rcpt(
                    email,
                    Transaction::new(format!("DELIVER {email}"), reply, error),
                );
            }
        }
    }

    /// Failed recipients of one attempt: every recipient whose RCPT (or
    /// per-recipient DATA) reply errored, or all of them when the single
    /// DATA reply did.
    fn failed_subset(transactions: &TransactionList) -> Vec<String> {
        if transactions.data().is_some_and(|data| data.error) {
            transactions
                .rcpt()
                .iter()
                .map(|(recipient, _)| recipient.clone())
                .collect()
        } else {
            transactions.failed_recipients()
        }
    }

    /// Records a session-level failure against every remaining recipient so
    /// the bookkeeping (and an eventual bounce) has a reply to cite.
    fn mark_all_failed(&self, entry: &mut RelaySession, reason: &str) {
        let reply = format!("451 4.4.0 {reason}");
        for (envelope, transactions) in entry.session.attempts_mut() {
            for recipient in envelope.recipients().iter() {
                if let Some(email) = recipient.email() {
                    transactions.record_rcpt(
                        email,
                        Transaction::new(format!("RCPT TO:<{email}>"), reply.clone(), true),
                    );
                }
            }
        }
    }

    /// Walks the attempt results and decides the fate of the entry.
    async fn settle(
        &self,
        mut entry: RelaySession,
        relay: &RelayConfig,
        outbound: &OutboundConfig,
    ) -> Result<(), DeliveryError> {
        let mut delivered_files = Vec::new();

        for (envelope, transactions) in entry.session.attempts_mut() {
            let failed = Self::failed_subset(transactions);

            if failed.is_empty() {
                if let Some(path) = envelope.file_path().cloned() {
                    delivered_files.push(path);
                }
                envelope.keep_recipients(&[]);
            } else {
                envelope.keep_recipients(&failed);
            }
        }

        // Delivered envelope files go within the same tick.
        for path in delivered_files {
            if self.queue.discard_file(&path).is_err() {
                remove_stored(&path).await;
            }
        }

        entry.session.retain_envelopes(|envelope| !envelope.is_terminal());

        if entry.session.is_empty() {
            tracing::info!(session = %entry.session.uid(), "delivered");
            return Ok(());
        }

        self.requeue_or_bounce(entry, relay, outbound).await;
        Ok(())
    }

    async fn requeue_or_bounce(
        &self,
        mut entry: RelaySession,
        relay: &RelayConfig,
        outbound: &OutboundConfig,
    ) {
        if entry.retry_count() < entry.max_retries {
            entry.record_attempt(Self::now_epoch());
            tracing::info!(
                session = %entry.session.uid(),
                retry = entry.retry_count(),
                max = entry.max_retries,
                "re-enqueued for retry"
            );
            if let Err(error) = self.queue.enqueue(&entry) {
                tracing::error!(%error, "unable to re-enqueue entry");
            }
            return;
        }

        self.bounce_remaining(entry, relay, outbound).await;
    }

    /// Retries are exhausted: synthesise one bounce per failed envelope (in
    /// recipient order), then drop the entry and its files.
    async fn bounce_remaining(
        &self,
        entry: RelaySession,
        relay: &RelayConfig,
        outbound: &OutboundConfig,
    ) {
        let bounce_enabled = relay.bounce;

        for (envelope, transactions) in entry.session.envelopes().iter().zip(entry.session.transactions())
        {
            if envelope.is_terminal() {
                continue;
            }

            if bounce_enabled {
                if let Some(bounce) = dsn::generate(
                    &entry,
                    envelope,
                    transactions,
                    &self.config.hostname,
                    outbound,
                ) {
                    if let Err(error) = self.queue.enqueue(&bounce) {
                        tracing::error!(%error, "unable to enqueue bounce");
                    }
                }
            }

            if let Some(path) = envelope.file_path() {
                if self.queue.discard_file(path).is_err() {
                    remove_stored(path).await;
                }
            }
        }

        tracing::info!(
            session = %entry.session.uid(),
            bounced = bounce_enabled,
            "entry dropped after exhausting retries"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use std::{sync::Arc, time::Duration};

    use super::{RetryScheduler, SchedulerConfig};
    use robin_common::{
        address::parse_one,
        config::{DovecotConfig, OutboundConfig, PoolConfig, RelayConfig},
        envelope::{Envelope, MailData},
        session::{Route, Session},
        transaction::Transaction,
    };
    use robin_queue::{FileQueue, QueueProtocol, RelaySession};
    use robin_smtp::client::pool::LmtpPool;

    fn scheduler(queue: Arc<FileQueue>, relay: RelayConfig) -> RetryScheduler {
        RetryScheduler::new(
            queue,
            robin_smtp::verbs::builtin_registry(),
            Arc::new(crate::lda::LdaRunner::new(&DovecotConfig::default())),
            Arc::new(LmtpPool::new("127.0.0.1:24", "robin.test", PoolConfig::default())),
            SchedulerConfig {
                initial_delay: Duration::from_secs(0),
                interval: Duration::from_secs(1),
                max_dequeue_per_tick: 16,
                hostname: "mx.robin.test".to_string(),
                relay,
                outbound: OutboundConfig::default(),
            },
        )
    }

    fn entry_with_recipients(rcpts: &[&str], max_retries: u32) -> RelaySession {
        let mut session = Session::outbound(Route::to_host("127.0.0.1", 1));
        let mut envelope = Envelope::new(Some(parse_one("sender@ex.com").unwrap()));
        for rcpt in rcpts {
            envelope.add_recipient(parse_one(rcpt).unwrap());
        }
        envelope.set_data(MailData::Bytes(b"Subject: t\r\n\r\nbody\r\n".to_vec()));
        session.open_envelope(envelope);
        RelaySession::new(session, QueueProtocol::Esmtp, max_retries)
    }

    #[test]
    fn backoff_grows_geometrically() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(FileQueue::open(dir.path().join("q")).unwrap());
        let scheduler = scheduler(
            queue,
            RelayConfig {
                first_wait_minutes: 5,
                growth_factor: 2.0,
                ..RelayConfig::default()
            },
        );

        let (relay, _) = scheduler.effective();
        let first = RetryScheduler::backoff_secs(&relay, 0);
        let second = RetryScheduler::backoff_secs(&relay, 1);
        let third = RetryScheduler::backoff_secs(&relay, 2);

        // 300s, 600s, 1200s, each within the 10% jitter band.
        assert!((270..=330).contains(&first), "first wait was {first}");
        assert!((540..=660).contains(&second), "second wait was {second}");
        assert!((1080..=1320).contains(&third), "third wait was {third}");
    }

    #[test]
    fn fresh_entries_are_due_retried_ones_wait() {
        let relay = RelayConfig::default();

        let mut entry = entry_with_recipients(&["a@ex.com"], 3);
        assert!(RetryScheduler::due(&relay, &entry));

        entry.record_attempt(RetryScheduler::now_epoch());
        assert!(!RetryScheduler::due(&relay, &entry));

        // An attempt far in the past is due again.
        let mut old = entry_with_recipients(&["a@ex.com"], 3);
        old.record_attempt(1);
        assert!(RetryScheduler::due(&relay, &old));
    }

    #[test]
    fn settings_source_overrides_startup_values() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(FileQueue::open(dir.path().join("q")).unwrap());

        let scheduler = scheduler(queue, RelayConfig::default()).with_settings_source(Arc::new(
            || {
                (
                    RelayConfig {
                        first_wait_minutes: 1,
                        bounce: false,
                        ..RelayConfig::default()
                    },
                    OutboundConfig {
                        retry: 9,
                        ..OutboundConfig::default()
                    },
                )
            },
        ));

        let (relay, outbound) = scheduler.effective();
        assert_eq!(relay.first_wait_minutes, 1);
        assert!(!relay.bounce);
        assert_eq!(outbound.retry, 9);
    }

    #[tokio::test]
    async fn partial_failure_requeues_the_failed_subset() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(FileQueue::open(dir.path().join("q")).unwrap());
        let scheduler = scheduler(queue.clone(), RelayConfig::default());

        let mut entry = entry_with_recipients(&["ok@ex.com", "fail@ex.com"], 3);

        // Simulate the attempt results scenario: one delivered, one not.
        for (_, transactions) in entry.session.attempts_mut() {
            transactions.record_rcpt(
                "ok@ex.com",
                Transaction::new("RCPT TO:<ok@ex.com>", "250 Ok", false),
            );
            transactions.record_rcpt(
                "fail@ex.com",
                Transaction::new("RCPT TO:<fail@ex.com>", "550 No such user", true),
            );
        }

        let (relay, outbound) = scheduler.effective();
        scheduler.settle(entry, &relay, &outbound).await.unwrap();

        let requeued = queue.dequeue().unwrap().unwrap();
        assert_eq!(requeued.retry_count(), 1);
        let recipients = requeued.session.envelopes()[0].recipients();
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].email(), Some("fail@ex.com"));
    }

    #[tokio::test]
    async fn fully_delivered_entries_leave_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(FileQueue::open(dir.path().join("q")).unwrap());
        let scheduler = scheduler(queue.clone(), RelayConfig::default());

        let mut entry = entry_with_recipients(&["ok@ex.com"], 3);
        for (_, transactions) in entry.session.attempts_mut() {
            transactions.record_rcpt(
                "ok@ex.com",
                Transaction::new("RCPT TO:<ok@ex.com>", "250 Ok", false),
            );
        }

        let (relay, outbound) = scheduler.effective();
        scheduler.settle(entry, &relay, &outbound).await.unwrap();
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn delivered_file_is_deleted_within_the_tick() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(FileQueue::open(dir.path().join("q")).unwrap());
        let scheduler = scheduler(queue.clone(), RelayConfig::default());

        let file = queue.spool_dir().join("delivered.eml");
        std::fs::write(&file, b"mail").unwrap();

        let mut entry = entry_with_recipients(&["ok@ex.com"], 3);
        entry.session.current_envelope_mut().unwrap().set_data(MailData::File(file.clone()));
        for (_, transactions) in entry.session.attempts_mut() {
            transactions.record_rcpt(
                "ok@ex.com",
                Transaction::new("RCPT TO:<ok@ex.com>", "250 Ok", false),
            );
        }

        let (relay, outbound) = scheduler.effective();
        scheduler.settle(entry, &relay, &outbound).await.unwrap();
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn exhausted_retries_become_a_bounce() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(FileQueue::open(dir.path().join("q")).unwrap());
        let scheduler = scheduler(queue.clone(), RelayConfig::default());

        let mut entry = entry_with_recipients(&["fail@ex.com"], 2);
        entry.record_attempt(1);
        entry.record_attempt(2);
        assert!(entry.retries_exhausted());

        for (_, transactions) in entry.session.attempts_mut() {
            transactions.record_rcpt(
                "fail@ex.com",
                Transaction::new("RCPT TO:<fail@ex.com>", "550 5.1.1 No such user", true),
            );
        }

        let (relay, outbound) = scheduler.effective();
        scheduler.settle(entry, &relay, &outbound).await.unwrap();

        // No re-enqueue of the original; exactly one bounce entry.
        assert_eq!(queue.size(), 1);
        let bounce = queue.dequeue().unwrap().unwrap();
        let envelope = &bounce.session.envelopes()[0];
        assert_eq!(
            envelope.sender().unwrap().email(),
            Some("mailer-daemon@mx.robin.test")
        );
        assert_eq!(envelope.recipients()[0].email(), Some("sender@ex.com"));
    }

    #[tokio::test]
    async fn bounce_disabled_drops_silently() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(FileQueue::open(dir.path().join("q")).unwrap());
        let scheduler = scheduler(
            queue.clone(),
            RelayConfig {
                bounce: false,
                ..RelayConfig::default()
            },
        );

        let mut entry = entry_with_recipients(&["fail@ex.com"], 0);
        for (_, transactions) in entry.session.attempts_mut() {
            transactions.record_rcpt(
                "fail@ex.com",
                Transaction::new("RCPT TO:<fail@ex.com>", "550 nope", true),
            );
        }

        let (relay, outbound) = scheduler.effective();
        scheduler.settle(entry, &relay, &outbound).await.unwrap();
        assert_eq!(queue.size(), 0);
    }
}

//! Component assembly for the Robin MTA binary.
//!
//! Builds the shared connection tracker, the durable queue, the storage
//! pipeline per listener kind, the retry scheduler and every configured
//! listener from one configuration snapshot, and drives them until a
//! shutdown signal arrives.

pub mod settings;

use std::{sync::Arc, time::Duration};

use tokio::sync::broadcast;

use robin_common::{
    config::{Config, ListenerKind},
    Signal,
};
use robin_delivery::{
    pipeline::{
        clamav::ClamavScanner,
        dovecot::DovecotDelivery,
        rspamd::RspamdScanner,
        store::{StoreParams, StoreProcessor},
    },
    scheduler::SchedulerConfig,
    Pipeline, PipelineSink, Processor, RetryScheduler,
};
use robin_queue::FileQueue;
use robin_smtp::{
    auth::DovecotSasl,
    listener::{Listener, SessionConfigSource},
    proxy::ProxyEngine,
    rbl::RblClient,
    session::{Limits, SessionConfig},
    tracker::ConnectionTracker,
    verbs,
    webhook::WebhookSet,
};

/// Per-accept session configuration backed by the current snapshot.
///
/// The hot-reloadable knobs (banner hostname, session limits) are re-read
/// from [`settings::current`] for every accepted connection; the structural
/// services built at startup (sink, tracker, proxy rules, RBL, registry,
/// TLS material) come from the template.
struct ReloadingSessionConfig {
    template: SessionConfig,
}

impl SessionConfigSource for ReloadingSessionConfig {
    fn session_config(&self) -> SessionConfig {
        let current = settings::current();
        let mut config = self.template.clone();
        config.banner = current.server.hostname.clone();
        config.limits = Limits::from_config(&current.server);
        config
    }
}

pub struct Server {
    config: Arc<Config>,
    queue: Arc<FileQueue>,
    tracker: Arc<ConnectionTracker>,
    listeners: Vec<Listener>,
    scheduler: Arc<RetryScheduler>,
}

impl Server {
    /// Assembles every component from the configuration snapshot.
    pub fn from_config(config: Arc<Config>) -> anyhow::Result<Self> {
        let queue = Arc::new(FileQueue::open(&config.server.queue_file)?);
        let tracker = Arc::new(ConnectionTracker::new(config.dos.clone()));
        let registry = verbs::builtin_registry();

        let store = StoreParams {
            store_path: config.server.store_path.clone(),
            hostname: config.server.hostname.clone(),
        };

        let dovecot = config.dovecot.enabled.then(|| {
            Arc::new(DovecotDelivery::new(
                config.dovecot.clone(),
                store.clone(),
                config.relay.mailbox.clone(),
            ))
        });

        let rbl = (!config.rbl.providers.is_empty())
            .then(|| Arc::new(RblClient::new(config.rbl.clone())));

        let proxy = Arc::new(ProxyEngine::compile(
            &config.proxy.rules,
            config.server.hostname.clone(),
        )?);

        let webhooks = Arc::new(WebhookSet::new(config.webhooks.clone()));

        let authenticator = config
            .dovecot
            .auth_socket
            .clone()
            .map(|socket| Arc::new(DovecotSasl::new(socket)));

        let mut listeners = Vec::with_capacity(config.listeners.len());
        for listener_config in &config.listeners {
            let pipeline = Arc::new(Pipeline::new(Self::processors(
                config.as_ref(),
                &store,
                dovecot.as_ref(),
                listener_config.kind,
            )?));

            let sink = Arc::new(PipelineSink::new(
                pipeline,
                queue.clone(),
                config.relay.clone(),
                config.outbound.clone(),
                listener_config.kind,
                config.server.hostname.clone(),
                config.dovecot.failure_behaviour,
                dovecot.clone(),
            ));

            let mut session_config = SessionConfig::builder()
                .with_banner(config.server.hostname.clone())
                .with_kind(listener_config.kind)
                .with_tls(listener_config.tls.clone())
                .with_limits(Limits::from_config(&config.server))
                .with_sink(sink)
                .with_tracker(tracker.clone())
                .with_webhooks(webhooks.clone())
                .with_proxy(proxy.clone())
                .with_registry(registry.clone());

            if let Some(rbl) = &rbl {
                session_config = session_config.with_rbl(rbl.clone());
            }
            if let Some(authenticator) = &authenticator {
                session_config = session_config.with_authenticator(authenticator.clone());
            }

            listeners.push(Listener::from_config(
                listener_config,
                ReloadingSessionConfig {
                    template: session_config.build(),
                },
            )?);
        }

        let (lda, lmtp_pool) = match &dovecot {
            Some(dovecot) => (dovecot.lda(), dovecot.pool()),
            None => {
                let fallback = DovecotDelivery::new(
                    config.dovecot.clone(),
                    store.clone(),
                    config.relay.mailbox.clone(),
                );
                (fallback.lda(), fallback.pool())
            }
        };

        let scheduler = Arc::new(
            RetryScheduler::new(
                queue.clone(),
                registry,
                lda,
                lmtp_pool,
                SchedulerConfig {
                    initial_delay: Duration::from_secs(config.server.queue_initial_delay),
                    interval: Duration::from_secs(config.server.queue_interval.max(1)),
                    max_dequeue_per_tick: config.server.max_dequeue_per_tick.max(1),
                    hostname: config.server.hostname.clone(),
                    relay: config.relay.clone(),
                    outbound: config.outbound.clone(),
                },
            )
            // Relay and outbound settings follow the current snapshot, so a
            // reload applies from the next tick.
            .with_settings_source(Arc::new(|| {
                let current = settings::current();
                (current.relay.clone(), current.outbound.clone())
            })),
        );

        Ok(Self {
            config,
            queue,
            tracker,
            listeners,
            scheduler,
        })
    }

    /// The processor chain for a listener kind: AV scan, spam scan, local
    /// Dovecot delivery (inbound only), then the disk writer.
    fn processors(
        config: &Config,
        store: &StoreParams,
        dovecot: Option<&Arc<DovecotDelivery>>,
        kind: ListenerKind,
    ) -> anyhow::Result<Vec<Arc<dyn Processor>>> {
        let mut chain: Vec<Arc<dyn Processor>> = Vec::new();

        if let Some(clamav) = &config.clamav {
            chain.push(Arc::new(ClamavScanner::new(clamav.clone())));
        }

        if let Some(rspamd) = &config.rspamd {
            chain.push(Arc::new(
                RspamdScanner::new(rspamd.clone()).map_err(|e| anyhow::anyhow!("{e}"))?,
            ));
        }

        // Submission mail is relayed out, not delivered locally.
        if kind != ListenerKind::Submission {
            if let Some(dovecot) = dovecot {
                chain.push(dovecot.clone());
            }
        }

        chain.push(Arc::new(StoreProcessor::new(store.clone())));

        Ok(chain)
    }

    #[must_use]
    pub fn queue(&self) -> Arc<FileQueue> {
        self.queue.clone()
    }

    /// Runs listeners, the tracker janitor and the retry scheduler until
    /// the shutdown broadcast fires, then drains and flushes.
    pub async fn serve(self, shutdown: broadcast::Sender<Signal>) -> anyhow::Result<()> {
        tracing::info!(
            hostname = %self.config.server.hostname,
            listeners = self.listeners.len(),
            queued = self.queue.size(),
            "robin starting"
        );

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn({
            let tracker = self.tracker.clone();
            let receiver = shutdown.subscribe();
            async move {
                tracker.run_janitor(receiver).await;
                Ok::<(), anyhow::Error>(())
            }
        }));

        tasks.push(tokio::spawn({
            let scheduler = self.scheduler.clone();
            let receiver = shutdown.subscribe();
            async move {
                scheduler.serve(receiver).await;
                Ok(())
            }
        }));

        for listener in self.listeners {
            let sender = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                listener.serve(sender).await.map_err(anyhow::Error::from)
            }));
        }

        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => tracing::error!(%error, "component failed"),
                Err(error) => tracing::error!(%error, "component panicked"),
            }
        }

        self.queue.close()?;
        tracing::info!("robin stopped");
        Ok(())
    }
}

//! Local delivery into Dovecot, by LDA subprocess or pooled LMTP.
//!
//! Inbound mail is delivered once per recipient; failures are recorded in
//! the transaction list and the sink turns the failed subset into a queued
//! retry (or an immediate bounce, per `failure_behaviour`). The processor
//! itself never rejects the message.

use std::sync::Arc;

use async_trait::async_trait;

use robin_common::{config::DovecotConfig, session::Session, transaction::Transaction};
use robin_smtp::client::pool::LmtpPool;

use super::{
    store::{ensure_stored, StoreParams},
    Processor, ProcessorError, ProcessorVerdict,
};
use crate::lda::LdaRunner;

#[derive(Debug)]
pub struct DovecotDelivery {
    config: DovecotConfig,
    lda: Arc<LdaRunner>,
    pool: Arc<LmtpPool>,
    store: StoreParams,
    /// Mailbox folder hint for inbound deliveries.
    mailbox: Option<String>,
}

impl DovecotDelivery {
    #[must_use]
    pub fn new(config: DovecotConfig, store: StoreParams, mailbox: Option<String>) -> Self {
        let lda = Arc::new(LdaRunner::new(&config));
        let pool = Arc::new(LmtpPool::new(
            format!("{}:{}", config.lmtp_host, config.lmtp_port),
            store.hostname.clone(),
            config.pool.clone(),
        ));

        Self {
            config,
            lda,
            pool,
            store,
            mailbox,
        }
    }

    #[must_use]
    pub fn pool(&self) -> Arc<LmtpPool> {
        self.pool.clone()
    }

    #[must_use]
    pub fn lda(&self) -> Arc<LdaRunner> {
        self.lda.clone()
    }

    /// Delivers one message to one mailbox over pooled LMTP.
    pub async fn lmtp_deliver(
        &self,
        sender: &str,
        recipient: &str,
        data: &[u8],
    ) -> Result<(), String> {
        let mut borrowed = self
            .pool
            .borrow()
            .await
            .map_err(|e| format!("LMTP unavailable: {e}"))?;

        let result = async {
            let client = borrowed.client();

            let reply = client
                .command(&format!("MAIL FROM:<{sender}>"))
                .await
                .map_err(|e| e.to_string())?;
            if !reply.is_success() {
                return Err(reply.summary());
            }

            let reply = client
                .command(&format!("RCPT TO:<{recipient}>"))
                .await
                .map_err(|e| e.to_string())?;
            if !reply.is_success() {
                return Err(reply.summary());
            }

            let reply = client.data_begin().await.map_err(|e| e.to_string())?;
            if !reply.is_intermediate() {
                return Err(reply.summary());
            }

            let replies = client
                .send_payload_lmtp(data, 1)
                .await
                .map_err(|e| e.to_string())?;
            match replies.first() {
                Some(reply) if reply.is_success() => Ok(()),
                Some(reply) => Err(reply.summary()),
                None => Err("no LMTP delivery reply".to_string()),
            }
        }
        .await;

        match &result {
            Ok(()) => self.pool.give_back(borrowed).await,
            Err(_) => self.pool.invalidate(borrowed),
        }

        result
    }

    /// Single delivery of an outbound copy into the sender's folder.
    pub async fn deliver_copy(
        &self,
        sender: &str,
        data: &[u8],
        folder: &str,
        file: Option<&std::path::Path>,
    ) -> Result<(), String> {
        if self.config.save_to_dovecot_lda {
            let Some(file) = file else {
                return Err("no stored file for LDA copy".to_string());
            };
            self.lda
                .deliver(sender, file, Some(folder))
                .await
                .map_err(|e| e.to_string())
        } else {
            self.lmtp_deliver(sender, sender, data).await
        }
    }
}

#[async_trait]
impl Processor for DovecotDelivery {
    fn name(&self) -> &'static str {
        "dovecot"
    }

    async fn process(
        &self,
        session: &mut Session,
        data: &[u8],
    ) -> Result<ProcessorVerdict, ProcessorError> {
        let recipients: Vec<String> = session
            .current_envelope()
            .map(|envelope| {
                envelope
                    .recipients()
                    .iter()
                    .filter_map(|rcpt| rcpt.email().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        if recipients.is_empty() {
            return Ok(ProcessorVerdict::Continue);
        }

        // The LDA needs the message on disk; store it now either way so the
        // path exists for later retries.
        let path = ensure_stored(session, data, &self.store).await?;

        let sender = session
            .current_envelope()
            .and_then(|envelope| envelope.sender())
            .and_then(|sender| sender.email())
            .unwrap_or_default()
            .to_string();

        for recipient in recipients {
            let result = if self.config.save_to_dovecot_lda {
                self.lda
                    .deliver(&recipient, &path, self.mailbox.as_deref())
                    .await
                    .map_err(|e| e.to_string())
            } else {
                self.lmtp_deliver(&sender, &recipient, data).await
            };

            let (reply, error) = match result {
                Ok(()) => ("250 2.0.0 Delivered".to_string(), false),
                Err(reason) => {
                    tracing::warn!(recipient = %recipient, %reason, "local delivery failed");
                    let reply = if reason.starts_with(|c: char| c.is_ascii_digit()) {
                        reason
                    } else {
                        format!("550 {reason}")
                    };
                    (reply, true)
                }
            };

            if let Some(transactions) = session.current_transactions_mut() {
                transactions.record_rcpt(
                    recipient.clone(),
                    Transaction::new(format!("DELIVER {recipient}"), reply, error),
                );
            }
        }

        Ok(ProcessorVerdict::Continue)
    }
}

use serde::{Deserialize, Serialize};

use robin_common::{config::ProxyProtocol, session::Session};

use crate::Result;

/// Wire protocol a queued session will be delivered with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueProtocol {
    Esmtp,
    Smtp,
    Lmtp,
    /// Local delivery through the Dovecot LDA subprocess.
    DovecotLda,
}

impl From<ProxyProtocol> for QueueProtocol {
    fn from(protocol: ProxyProtocol) -> Self {
        match protocol {
            ProxyProtocol::Esmtp => Self::Esmtp,
            ProxyProtocol::Smtp => Self::Smtp,
            ProxyProtocol::Lmtp => Self::Lmtp,
        }
    }
}

/// Durable wrapper around a [`Session`] queued for delivery.
///
/// The retry count only ever grows; `last_attempt` is epoch seconds of the
/// most recent delivery attempt, zero before the first one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelaySession {
    pub session: Session,
    pub protocol: QueueProtocol,
    /// Mailbox folder hint for local delivery (`-m` to the LDA).
    pub mailbox: Option<String>,
    retry_count: u32,
    pub last_attempt: u64,
    pub max_retries: u32,
}

impl RelaySession {
    #[must_use]
    pub const fn new(session: Session, protocol: QueueProtocol, max_retries: u32) -> Self {
        Self {
            session,
            protocol,
            mailbox: None,
            retry_count: 0,
            last_attempt: 0,
            max_retries,
        }
    }

    #[must_use]
    pub fn with_mailbox(mut self, mailbox: Option<String>) -> Self {
        self.mailbox = mailbox;
        self
    }

    #[must_use]
    pub const fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Records a failed attempt: bumps the count and stamps the time.
    pub fn record_attempt(&mut self, now_epoch: u64) {
        self.retry_count += 1;
        self.last_attempt = now_epoch;
    }

    #[must_use]
    pub const fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (entry, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(entry)
    }
}

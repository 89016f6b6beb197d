//! Extension dispatch: a process-wide registry mapping verb keys to a
//! server-side handler (inbound sessions) and a client-side handler
//! (outbound formatting).
//!
//! Registration carries a priority; on conflict the lower priority wins and
//! replacement is intentional — test doubles and feature plugins override the
//! built-ins. Looking up a missing half is a runtime error at first use.

use std::{fmt::Debug, sync::Arc};

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::RwLock;

use robin_common::status::Status;

use crate::{
    command::Command,
    error::DispatchError,
    proxy::ProxyConnections,
    session::{SessionConfig, SmtpState},
};

/// A fully formatted response, written as one logical unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<String>,
}

impl Reply {
    #[must_use]
    pub fn status(status: Status, text: impl Into<String>) -> Self {
        Self {
            lines: vec![format!("{status} {}", text.into())],
        }
    }

    /// A preformatted reply line, written verbatim (webhook overrides).
    #[must_use]
    pub fn raw(line: impl Into<String>) -> Self {
        Self {
            lines: vec![line.into()],
        }
    }

    #[must_use]
    pub const fn multi(lines: Vec<String>) -> Self {
        Self { lines }
    }

    /// The reply code of the first line, when one is present.
    #[must_use]
    pub fn code(&self) -> Option<u16> {
        self.lines
            .first()
            .and_then(|line| line.get(..3))
            .and_then(|code| code.parse().ok())
    }
}

/// What the session loop must do after writing a handler's reply.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    None,
    Close,
    /// Perform the TLS upgrade; the 220 go-ahead has already been written.
    StartTls,
    /// Enter DATA mode and read until the lone dot.
    BeginData,
    /// Read exactly `size` bytes of BDAT chunk.
    BeginChunk {
        size: usize,
        last: bool,
    },
    /// Drive the AUTH exchange for the given mechanism.
    Authenticate {
        mechanism: String,
        initial: Option<String>,
    },
}

#[derive(Debug)]
pub struct VerbOutcome {
    pub reply: Option<Reply>,
    pub action: Action,
}

impl VerbOutcome {
    #[must_use]
    pub fn reply(reply: Reply) -> Self {
        Self {
            reply: Some(reply),
            action: Action::None,
        }
    }

    #[must_use]
    pub fn with_action(reply: Option<Reply>, action: Action) -> Self {
        Self { reply, action }
    }
}

/// Mutable view handed to a server-side verb handler.
pub struct VerbContext<'a> {
    pub state: &'a mut SmtpState,
    pub config: &'a SessionConfig,
    pub proxy: &'a mut ProxyConnections,
}

/// Server half of a verb: validates sequencing, mutates the session and
/// produces the reply plus any follow-up I/O action.
#[async_trait]
pub trait ServerVerb: Send + Sync + Debug {
    async fn handle(&self, ctx: &mut VerbContext<'_>, command: &Command) -> VerbOutcome;
}

/// Client half of a verb: the wire form the outbound engine sends.
pub trait ClientVerb: Send + Sync + Debug {
    fn format(&self, argument: &str) -> String;
}

struct Entry {
    priority: i32,
    server: Option<Arc<dyn ServerVerb>>,
    client: Option<Arc<dyn ClientVerb>>,
}

/// The verb registry. Write-at-startup, read-mostly.
#[derive(Default)]
pub struct Registry {
    verbs: RwLock<AHashMap<String, Entry>>,
}

impl Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.verbs.read().keys().cloned().collect();
        keys.sort();
        f.debug_struct("Registry").field("verbs", &keys).finish()
    }
}

impl Registry {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registers both halves of a verb. An existing registration is replaced
    /// only when the new priority is lower or equal; a losing registration
    /// is logged and dropped.
    pub fn register(
        &self,
        verb: impl Into<String>,
        priority: i32,
        server: Option<Arc<dyn ServerVerb>>,
        client: Option<Arc<dyn ClientVerb>>,
    ) {
        let verb = verb.into().to_ascii_uppercase();
        let mut verbs = self.verbs.write();

        if let Some(existing) = verbs.get(&verb) {
            if existing.priority < priority {
                tracing::debug!(
                    verb,
                    existing = existing.priority,
                    offered = priority,
                    "registration ignored, existing entry has priority"
                );
                return;
            }
        }

        verbs.insert(
            verb,
            Entry {
                priority,
                server,
                client,
            },
        );
    }

    pub fn server(&self, verb: &str) -> Result<Arc<dyn ServerVerb>, DispatchError> {
        self.verbs
            .read()
            .get(verb)
            .and_then(|entry| entry.server.clone())
            .ok_or_else(|| DispatchError::MissingServer(verb.to_string()))
    }

    pub fn client(&self, verb: &str) -> Result<Arc<dyn ClientVerb>, DispatchError> {
        self.verbs
            .read()
            .get(verb)
            .and_then(|entry| entry.client.clone())
            .ok_or_else(|| DispatchError::MissingClient(verb.to_string()))
    }

    /// Whether any handler is registered for the verb.
    #[must_use]
    pub fn knows(&self, verb: &str) -> bool {
        self.verbs.read().contains_key(verb)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use std::sync::Arc;

    use super::{ClientVerb, Registry, Reply};
    use robin_common::status::Status;

    #[derive(Debug)]
    struct Fixed(&'static str);

    impl ClientVerb for Fixed {
        fn format(&self, _argument: &str) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn lower_priority_wins() {
        let registry = Registry::empty();
        registry.register("NOOP", 100, None, Some(Arc::new(Fixed("default"))));
        registry.register("NOOP", 10, None, Some(Arc::new(Fixed("plugin"))));
        registry.register("NOOP", 50, None, Some(Arc::new(Fixed("loser"))));

        assert_eq!(registry.client("NOOP").unwrap().format(""), "plugin");
    }

    #[test]
    fn missing_half_is_a_runtime_error() {
        let registry = Registry::empty();
        registry.register("NOOP", 0, None, Some(Arc::new(Fixed("client-only"))));

        assert!(registry.client("NOOP").is_ok());
        assert!(registry.server("NOOP").is_err());
        assert!(registry.server("XCLIENT").is_err());
    }

    #[test]
    fn reply_code_extraction() {
        assert_eq!(Reply::status(Status::Ok, "fine").code(), Some(250));
        assert_eq!(Reply::raw("550 5.7.1 no").code(), Some(550));
        assert_eq!(Reply::raw("bogus").code(), None);
    }
}

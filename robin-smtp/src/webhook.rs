//! Verb webhooks: a general-purpose interception seam.
//!
//! Before any verb handler runs, a webhook configured for that verb is
//! POSTed a snapshot of the session. A response body that starts with an
//! SMTP reply line is written to the client verbatim and the handler is
//! skipped; a failing HTTP exchange yields `451` unless the hook is marked
//! `ignore_errors`.

use std::time::Duration;

use ahash::AHashMap;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};

use robin_common::{config::WebhookConfig, session::Session};

type HookConnector = hyper_rustls::HttpsConnector<HttpConnector>;
type HookClient = Client<HookConnector, Full<Bytes>>;

/// What the session loop does with the verb after the hook ran.
#[derive(Debug, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Run the verb handler normally.
    Proceed,
    /// Write this reply line verbatim and skip the handler.
    Reply(String),
    /// The hook failed; reply `451` and skip the handler.
    Deny,
}

#[derive(Debug, Default)]
pub struct WebhookSet {
    hooks: AHashMap<String, WebhookConfig>,
    client: Option<HookClient>,
}

impl WebhookSet {
    #[must_use]
    pub fn new(configs: Vec<WebhookConfig>) -> Self {
        if configs.is_empty() {
            return Self::default();
        }

        let client = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => {
                let connector = builder.https_or_http().enable_http1().build();
                Some(Client::builder(TokioExecutor::new()).build(connector))
            }
            Err(error) => {
                tracing::error!(%error, "native TLS roots unavailable, webhooks disabled");
                None
            }
        };

        Self {
            hooks: configs
                .into_iter()
                .map(|hook| (hook.verb.to_ascii_uppercase(), hook))
                .collect(),
            client,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    fn snapshot(verb: &str, session: &Session) -> String {
        let envelope = session.current_envelope();

        serde_json::json!({
            "uid": session.uid().as_str(),
            "verb": verb,
            "peer": session.peer().map(|peer| peer.to_string()),
            "ehlo": session.ehlo(),
            "tls": session.tls().is_secure(),
            "authenticated": session.auth().is_authenticated(),
            "mail_from": envelope
                .and_then(|envelope| envelope.sender())
                .and_then(|sender| sender.email()),
            "recipients": envelope.map(|envelope| {
                envelope
                    .recipients()
                    .iter()
                    .filter_map(|rcpt| rcpt.email())
                    .collect::<Vec<_>>()
            }),
        })
        .to_string()
    }

    /// Invokes the webhook configured for `verb`, when there is one.
    pub async fn intercept(&self, verb: &str, session: &Session) -> WebhookOutcome {
        let Some(hook) = self.hooks.get(verb) else {
            return WebhookOutcome::Proceed;
        };
        let Some(client) = &self.client else {
            return WebhookOutcome::Proceed;
        };

        let payload = Self::snapshot(verb, session);
        let request = Request::post(hook.url.as_str())
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(payload)));

        let request = match request {
            Ok(request) => request,
            Err(error) => {
                tracing::error!(%error, url = %hook.url, "unable to build webhook request");
                return self.failure(hook);
            }
        };

        let timeout = Duration::from_secs(hook.timeout_seconds.max(1));
        let response = match tokio::time::timeout(timeout, client.request(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                tracing::warn!(%error, url = %hook.url, "webhook request failed");
                return self.failure(hook);
            }
            Err(_) => {
                tracing::warn!(url = %hook.url, "webhook timed out");
                return self.failure(hook);
            }
        };

        let http_ok = response.status().is_success();
        let body = match response.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(error) => {
                tracing::warn!(%error, url = %hook.url, "unable to read webhook response");
                return self.failure(hook);
            }
        };

        if !http_ok {
            return self.failure(hook);
        }

        let text = String::from_utf8_lossy(&body);
        let line = text.lines().next().unwrap_or_default().trim();

        // A body beginning with a reply code overrides the verb handler.
        if line.len() >= 3 && line[..3].chars().all(|c| c.is_ascii_digit()) {
            return WebhookOutcome::Reply(line.to_string());
        }

        WebhookOutcome::Proceed
    }

    fn failure(&self, hook: &WebhookConfig) -> WebhookOutcome {
        if hook.ignore_errors {
            WebhookOutcome::Proceed
        } else {
            WebhookOutcome::Deny
        }
    }
}

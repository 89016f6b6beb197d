//! Configuration records for every subsystem.
//!
//! Each subsystem owns an immutable serde record; the binary assembles one
//! [`Config`] snapshot at startup and hot-reload swaps the `Arc` it lives
//! behind. A zero value means the corresponding limit is disabled.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::session::{Credentials, Direction};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration snapshot.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dos: DosConfig,
    #[serde(default)]
    pub rbl: RblConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub dovecot: DovecotConfig,
    #[serde(default)]
    pub clamav: Option<ClamavConfig>,
    #[serde(default)]
    pub rspamd: Option<RspamdConfig>,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
    #[serde(default)]
    pub outbound: OutboundConfig,
}

impl Config {
    /// Loads and parses a TOML configuration file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

/// Shared pointer to the current configuration snapshot.
///
/// Readers clone the inner `Arc` and never observe a torn config; a reload
/// parses the file first and swaps the pointer under the write lock only on
/// success, so a bad file leaves the old snapshot in place.
#[derive(Clone, Debug)]
pub struct ConfigHandle {
    inner: std::sync::Arc<std::sync::RwLock<std::sync::Arc<Config>>>,
}

impl ConfigHandle {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::RwLock::new(std::sync::Arc::new(config))),
        }
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> std::sync::Arc<Config> {
        match self.inner.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replaces the snapshot atomically.
    pub fn swap(&self, config: Config) -> std::sync::Arc<Config> {
        let config = std::sync::Arc::new(config);
        match self.inner.write() {
            Ok(mut current) => *current = config.clone(),
            Err(poisoned) => *poisoned.into_inner() = config.clone(),
        }
        config
    }

    /// Re-reads the file and swaps the snapshot on success.
    pub fn reload_from(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<std::sync::Arc<Config>, ConfigError> {
        let config = Config::from_file(path)?;
        Ok(self.swap(config))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    /// Hostname used in banners, Received headers and bounce senders.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Directory envelope files are stored under.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Path of the durable queue log; its companion directory sits beside it.
    #[serde(default = "default_queue_file")]
    pub queue_file: PathBuf,

    /// Seconds before the first scheduler tick.
    #[serde(default = "default_queue_initial_delay")]
    pub queue_initial_delay: u64,

    /// Seconds between scheduler ticks.
    #[serde(default = "default_queue_interval")]
    pub queue_interval: u64,

    /// Queue entries examined per tick.
    #[serde(default = "default_max_dequeue_per_tick")]
    pub max_dequeue_per_tick: usize,

    /// Commands accepted per connection before the session is closed.
    #[serde(default = "default_transactions_limit")]
    pub transactions_limit: u32,

    /// Syntax errors tolerated before the session is terminated.
    #[serde(default = "default_error_limit")]
    pub error_limit: u32,

    /// Envelopes accepted per connection. Zero disables the limit.
    #[serde(default)]
    pub envelope_limit: u32,

    /// Recipients accepted per envelope. Zero disables the limit.
    #[serde(default = "default_recipients_limit")]
    pub recipients_limit: u32,

    /// Maximum message size in bytes, advertised via SIZE. Zero disables.
    #[serde(default = "default_email_size_limit")]
    pub email_size_limit: usize,

    /// Idle timeout for session reads, seconds.
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            store_path: default_store_path(),
            queue_file: default_queue_file(),
            queue_initial_delay: default_queue_initial_delay(),
            queue_interval: default_queue_interval(),
            max_dequeue_per_tick: default_max_dequeue_per_tick(),
            transactions_limit: default_transactions_limit(),
            error_limit: default_error_limit(),
            envelope_limit: 0,
            recipients_limit: default_recipients_limit(),
            email_size_limit: default_email_size_limit(),
            session_timeout: default_session_timeout(),
        }
    }
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_store_path() -> PathBuf {
    PathBuf::from("store")
}

fn default_queue_file() -> PathBuf {
    PathBuf::from("queue/relay.q")
}

const fn default_queue_initial_delay() -> u64 {
    10
}

const fn default_queue_interval() -> u64 {
    30
}

const fn default_max_dequeue_per_tick() -> usize {
    32
}

const fn default_transactions_limit() -> u32 {
    1000
}

const fn default_error_limit() -> u32 {
    3
}

const fn default_recipients_limit() -> u32 {
    100
}

const fn default_email_size_limit() -> usize {
    50 * 1024 * 1024
}

const fn default_session_timeout() -> u64 {
    60
}

/// DoS admission controls shared by all listeners.
#[derive(Clone, Debug, Deserialize)]
pub struct DosConfig {
    /// Disabling this bypasses the connection tracker entirely.
    #[serde(default = "default_true")]
    pub dos_protection_enabled: bool,

    /// Concurrent connections per source IP. Zero disables.
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: u32,

    /// Concurrent connections across all listeners. Zero disables.
    #[serde(default)]
    pub max_total_connections: u32,

    /// Width of the connection-rate window, seconds.
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_seconds: u64,

    /// New connections admitted per IP within the window. Zero disables.
    #[serde(default = "default_max_connections_per_window")]
    pub max_connections_per_window: u32,

    /// Commands per minute before the tarpit engages. Zero disables.
    #[serde(default = "default_max_commands_per_minute")]
    pub max_commands_per_minute: u32,

    /// Minimum DATA transfer rate, bytes per second. Zero disables.
    #[serde(default = "default_min_data_rate")]
    pub min_data_rate_bytes_per_second: u64,

    /// Absolute ceiling on a DATA transfer, seconds. Zero disables.
    #[serde(default = "default_max_data_timeout")]
    pub max_data_timeout_seconds: u64,

    /// Base tarpit delay, multiplied by the violation count.
    #[serde(default = "default_tarpit_delay")]
    pub tarpit_delay_millis: u64,
}

impl Default for DosConfig {
    fn default() -> Self {
        Self {
            dos_protection_enabled: true,
            max_connections_per_ip: default_max_connections_per_ip(),
            max_total_connections: 0,
            rate_limit_window_seconds: default_rate_limit_window(),
            max_connections_per_window: default_max_connections_per_window(),
            max_commands_per_minute: default_max_commands_per_minute(),
            min_data_rate_bytes_per_second: default_min_data_rate(),
            max_data_timeout_seconds: default_max_data_timeout(),
            tarpit_delay_millis: default_tarpit_delay(),
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_max_connections_per_ip() -> u32 {
    16
}

const fn default_rate_limit_window() -> u64 {
    60
}

const fn default_max_connections_per_window() -> u32 {
    60
}

const fn default_max_commands_per_minute() -> u32 {
    120
}

const fn default_min_data_rate() -> u64 {
    64
}

const fn default_max_data_timeout() -> u64 {
    600
}

const fn default_tarpit_delay() -> u64 {
    500
}

/// Realtime blackhole list lookups applied before the greeting.
#[derive(Clone, Debug, Deserialize)]
pub struct RblConfig {
    /// DNSBL provider suffixes, e.g. `zen.spamhaus.org`.
    #[serde(default)]
    pub providers: Vec<String>,

    #[serde(default = "default_rbl_timeout")]
    pub timeout_seconds: u64,

    /// When false, listings are logged but clients are not rejected.
    #[serde(default)]
    pub reject_enabled: bool,
}

impl Default for RblConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            timeout_seconds: default_rbl_timeout(),
            reject_enabled: false,
        }
    }
}

const fn default_rbl_timeout() -> u64 {
    5
}

/// Relay/queue behaviour.
#[derive(Clone, Debug, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Mailbox folder hint for queued inbound deliveries.
    #[serde(default)]
    pub mailbox: Option<String>,

    /// Mailbox folder the sender's copy of outbound mail lands in.
    #[serde(default = "default_outbox")]
    pub outbox: String,

    /// Ignore the X-Robin-Relay header when set.
    #[serde(default)]
    pub disable_relay_header: bool,

    /// Generate bounces once retries are exhausted.
    #[serde(default = "default_true")]
    pub bounce: bool,

    /// Route outbound mail via MX resolution of the recipient domain.
    #[serde(default)]
    pub outbound_mx_enabled: bool,

    /// First retry wait, minutes.
    #[serde(default = "default_first_wait_minutes")]
    pub first_wait_minutes: u64,

    /// Multiplier applied to the wait per retry.
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,

    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mailbox: None,
            outbox: default_outbox(),
            disable_relay_header: false,
            bounce: true,
            outbound_mx_enabled: false,
            first_wait_minutes: default_first_wait_minutes(),
            growth_factor: default_growth_factor(),
            max_retry_count: default_max_retry_count(),
        }
    }
}

fn default_outbox() -> String {
    "Sent".to_string()
}

const fn default_first_wait_minutes() -> u64 {
    5
}

const fn default_growth_factor() -> f64 {
    2.0
}

const fn default_max_retry_count() -> u32 {
    5
}

/// Dovecot delivery, either by LDA subprocess or pooled LMTP.
#[derive(Clone, Debug, Deserialize)]
pub struct DovecotConfig {
    /// Deliver inbound mail into Dovecot at all.
    #[serde(default)]
    pub enabled: bool,

    /// Prefer the LDA subprocess over LMTP.
    #[serde(default)]
    pub save_to_dovecot_lda: bool,

    #[serde(default = "default_lda_binary")]
    pub lda_binary: PathBuf,

    /// Wall-clock ceiling for one LDA invocation, seconds.
    #[serde(default = "default_lda_timeout")]
    pub lda_timeout_seconds: u64,

    #[serde(default = "default_inline_save_max_attempts")]
    pub inline_save_max_attempts: u32,

    /// Seconds between inline LDA attempts.
    #[serde(default = "default_inline_save_retry_delay")]
    pub inline_save_retry_delay: u64,

    #[serde(default)]
    pub failure_behaviour: FailureBehaviour,

    #[serde(default = "default_lmtp_host")]
    pub lmtp_host: String,

    #[serde(default = "default_lmtp_port")]
    pub lmtp_port: u16,

    /// Path of the Dovecot SASL authentication socket.
    #[serde(default)]
    pub auth_socket: Option<PathBuf>,

    #[serde(default)]
    pub pool: PoolConfig,
}

impl Default for DovecotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            save_to_dovecot_lda: false,
            lda_binary: default_lda_binary(),
            lda_timeout_seconds: default_lda_timeout(),
            inline_save_max_attempts: default_inline_save_max_attempts(),
            inline_save_retry_delay: default_inline_save_retry_delay(),
            failure_behaviour: FailureBehaviour::default(),
            lmtp_host: default_lmtp_host(),
            lmtp_port: default_lmtp_port(),
            auth_socket: None,
            pool: PoolConfig::default(),
        }
    }
}

fn default_lda_binary() -> PathBuf {
    PathBuf::from("/usr/lib/dovecot/dovecot-lda")
}

const fn default_lda_timeout() -> u64 {
    30
}

const fn default_inline_save_max_attempts() -> u32 {
    3
}

const fn default_inline_save_retry_delay() -> u64 {
    2
}

fn default_lmtp_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_lmtp_port() -> u16 {
    24
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureBehaviour {
    /// Bounce immediately on local delivery failure.
    Bounce,
    /// Leave the envelope queued for the next scheduler tick.
    #[default]
    Retry,
}

/// Bounded LMTP connection pool.
#[derive(Clone, Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,

    /// Seconds an idle connection stays borrowable.
    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_seconds: u64,

    /// Seconds after which a connection is retired regardless of use.
    #[serde(default = "default_pool_max_lifetime")]
    pub max_lifetime_seconds: u64,

    /// Seconds a borrower waits for a free connection.
    #[serde(default = "default_pool_borrow_timeout")]
    pub borrow_timeout_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_pool_max_size(),
            idle_timeout_seconds: default_pool_idle_timeout(),
            max_lifetime_seconds: default_pool_max_lifetime(),
            borrow_timeout_seconds: default_pool_borrow_timeout(),
        }
    }
}

const fn default_pool_max_size() -> usize {
    8
}

const fn default_pool_idle_timeout() -> u64 {
    60
}

const fn default_pool_max_lifetime() -> u64 {
    600
}

const fn default_pool_borrow_timeout() -> u64 {
    10
}

/// ClamAV INSTREAM scanning.
#[derive(Clone, Debug, Deserialize)]
pub struct ClamavConfig {
    pub host: String,

    #[serde(default = "default_clamav_port")]
    pub port: u16,

    #[serde(default)]
    pub policy: ScanDisposition,

    /// Also scan each non-text MIME part individually.
    #[serde(default)]
    pub scan_parts: bool,

    #[serde(default = "default_scan_timeout")]
    pub timeout_seconds: u64,
}

const fn default_clamav_port() -> u16 {
    3310
}

const fn default_scan_timeout() -> u64 {
    30
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanDisposition {
    /// Reject with a 5xx.
    #[default]
    Reject,
    /// Report success to the client and drop the message silently.
    Discard,
}

/// Rspamd spam scoring over HTTP.
#[derive(Clone, Debug, Deserialize)]
pub struct RspamdConfig {
    /// Base URL, e.g. `http://127.0.0.1:11333`.
    pub url: String,

    /// Score at or above which the message is rejected.
    #[serde(default = "default_reject_threshold")]
    pub reject_threshold: f64,

    /// Score at or above which the message is silently discarded.
    /// Must be >= `reject_threshold`.
    #[serde(default = "default_discard_threshold")]
    pub discard_threshold: f64,

    #[serde(default = "default_scan_timeout")]
    pub timeout_seconds: u64,
}

const fn default_reject_threshold() -> f64 {
    15.0
}

const fn default_discard_threshold() -> f64 {
    30.0
}

/// Static proxy routing rule. All present patterns must match for the rule to
/// apply; an absent pattern is a wildcard.
#[derive(Clone, Debug, Deserialize)]
pub struct ProxyRuleConfig {
    /// Full-string regex over the peer IP.
    #[serde(default)]
    pub ip: Option<String>,

    /// Full-string regex over the EHLO name.
    #[serde(default)]
    pub ehlo: Option<String>,

    /// Full-string regex over the MAIL FROM mailbox.
    #[serde(default)]
    pub mail_from: Option<String>,

    /// Full-string regex over the RCPT TO mailbox.
    #[serde(default)]
    pub rcpt: Option<String>,

    #[serde(default)]
    pub direction: RuleDirection,

    pub hosts: Vec<String>,

    #[serde(default = "default_proxy_port")]
    pub port: u16,

    #[serde(default)]
    pub protocol: ProxyProtocol,

    #[serde(default)]
    pub tls: bool,

    #[serde(default)]
    pub auth: Option<Credentials>,

    /// What happens to recipients this rule does not match.
    #[serde(default)]
    pub non_matching: NonMatchingAction,
}

const fn default_proxy_port() -> u16 {
    25
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    Inbound,
    Outbound,
    #[default]
    Both,
}

impl RuleDirection {
    #[must_use]
    pub const fn matches(self, direction: Direction) -> bool {
        match self {
            Self::Both => true,
            Self::Inbound => matches!(direction, Direction::Inbound),
            Self::Outbound => matches!(direction, Direction::Outbound),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    Esmtp,
    Smtp,
    Lmtp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NonMatchingAction {
    /// Leave the recipient to normal local handling.
    #[default]
    None,
    /// Accept the recipient without proxying it.
    Accept,
    /// Reject the recipient outright.
    Reject,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub rules: Vec<ProxyRuleConfig>,
}

/// One bound listener.
#[derive(Clone, Debug, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_listen_address")]
    pub address: String,

    pub port: u16,

    #[serde(default)]
    pub kind: ListenerKind,

    /// TLS material; required for `secure` listeners, enables STARTTLS on
    /// the others.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Concurrent sessions handled before accepts run on the caller.
    #[serde(default = "default_listener_workers")]
    pub workers: usize,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

const fn default_listener_workers() -> usize {
    256
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerKind {
    /// Port 25 style: auth optional, RBL checked before the greeting.
    #[default]
    Inbound,
    /// Port 587 style: MAIL requires authentication.
    Submission,
    /// Port 465 style: sockets are TLS-wrapped on accept.
    Secure,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TlsConfig {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// Webhook intercepting a verb before its handler runs.
#[derive(Clone, Debug, Deserialize)]
pub struct WebhookConfig {
    /// Verb key, e.g. `MAIL` or `RCPT`.
    pub verb: String,

    pub url: String,

    /// Treat HTTP failures as advisory instead of replying 451.
    #[serde(default)]
    pub ignore_errors: bool,

    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: u64,
}

const fn default_webhook_timeout() -> u64 {
    5
}

/// Outbound client behaviour.
#[derive(Clone, Debug, Deserialize)]
pub struct OutboundConfig {
    /// Source address to bind outbound sockets to.
    #[serde(default)]
    pub bind: Option<std::net::IpAddr>,

    /// Connection attempts per destination host.
    #[serde(default = "default_outbound_retry")]
    pub retry: u32,

    /// Seconds between connection attempts.
    #[serde(default = "default_outbound_delay")]
    pub delay: u64,

    /// Seconds allowed for connection establishment.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Seconds allowed per command exchange.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            bind: None,
            retry: default_outbound_retry(),
            delay: default_outbound_delay(),
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
        }
    }
}

const fn default_outbound_retry() -> u32 {
    2
}

const fn default_outbound_delay() -> u64 {
    5
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_command_timeout() -> u64 {
    120
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::Config;

    #[test]
    fn defaults_apply_to_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.queue_interval, 30);
        assert_eq!(config.server.error_limit, 3);
        assert_eq!(config.server.transactions_limit, 1000);
        assert!(config.dos.dos_protection_enabled);
        assert!(config.relay.bounce);
        assert!(config.clamav.is_none());
    }

    #[test]
    fn handle_swap_is_visible_to_readers() {
        let handle = super::ConfigHandle::new(Config::default());
        assert_eq!(handle.snapshot().server.queue_interval, 30);

        let mut changed = Config::default();
        changed.server.queue_interval = 5;
        changed.server.hostname = "swapped.example.com".to_string();
        handle.swap(changed);

        let current = handle.snapshot();
        assert_eq!(current.server.queue_interval, 5);
        assert_eq!(current.server.hostname, "swapped.example.com");
    }

    #[test]
    fn listener_and_rule_sections_parse() {
        let config: Config = toml::from_str(
            r#"
            [server]
            hostname = "mx.example.com"
            recipients_limit = 10

            [[listeners]]
            port = 25

            [[listeners]]
            port = 465
            kind = "secure"

            [[proxy.rules]]
            rcpt = ".*@relay\\.example\\.com"
            hosts = ["10.0.0.1"]
            port = 2525
            tls = true
            non_matching = "reject"
            "#,
        )
        .unwrap();

        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[1].kind, super::ListenerKind::Secure);
        assert_eq!(config.proxy.rules.len(), 1);
        assert!(config.proxy.rules[0].tls);
        assert_eq!(
            config.proxy.rules[0].non_matching,
            super::NonMatchingAction::Reject
        );
    }
}

//! DoS admission control, shared across all listeners.
//!
//! Tracks, per source IP: the concurrent connection count, a sliding window
//! of connection-open timestamps, per-minute command timestamps and a byte
//! counter. A janitor prunes entries idle longer than the widest configured
//! window. Every limit treats zero as disabled, and disabling
//! `dos_protection_enabled` bypasses the tracker entirely.

use std::{
    collections::VecDeque,
    net::IpAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use robin_common::{config::DosConfig, counter, Signal};

const COMMAND_WINDOW: Duration = Duration::from_secs(60);
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// The slow-transfer guard only engages after this grace period.
const DATA_RATE_GRACE: Duration = Duration::from_secs(5);

/// Verdict for a connection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// Global concurrent-connection ceiling reached.
    RejectTotal,
    /// Per-IP concurrent-connection ceiling reached.
    RejectPerIp,
    /// Too many opens from this IP inside the rate window.
    RejectWindow,
}

impl Admission {
    #[must_use]
    pub const fn admitted(self) -> bool {
        matches!(self, Self::Admit)
    }
}

/// Verdict for an in-flight DATA/BDAT transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferVerdict {
    Ok,
    /// Below the minimum byte rate after the grace period.
    TooSlow,
    /// Past the absolute transfer ceiling.
    TimedOut,
}

#[derive(Debug)]
struct IpEntry {
    connections: u32,
    opens: VecDeque<Instant>,
    commands: VecDeque<Instant>,
    bytes: u64,
    last_activity: Instant,
}

impl IpEntry {
    fn new(now: Instant) -> Self {
        Self {
            connections: 0,
            opens: VecDeque::new(),
            commands: VecDeque::new(),
            bytes: 0,
            last_activity: now,
        }
    }
}

#[derive(Debug)]
pub struct ConnectionTracker {
    config: DosConfig,
    total: AtomicU32,
    per_ip: DashMap<IpAddr, Mutex<IpEntry>>,
}

impl ConnectionTracker {
    #[must_use]
    pub fn new(config: DosConfig) -> Self {
        Self {
            config,
            total: AtomicU32::new(0),
            per_ip: DashMap::new(),
        }
    }

    /// A tracker that admits everything and records nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(DosConfig {
            dos_protection_enabled: false,
            ..DosConfig::default()
        })
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.config.dos_protection_enabled
    }

    /// Admission check at socket accept. Violations are counted and the
    /// caller closes the socket with no greeting.
    pub fn connection_opened(&self, ip: IpAddr) -> Admission {
        if !self.enabled() {
            return Admission::Admit;
        }

        let now = Instant::now();

        if self.config.max_total_connections > 0
            && self.total.load(Ordering::Acquire) >= self.config.max_total_connections
        {
            counter::increment(counter::CONNLIMIT_REJECTION);
            return Admission::RejectTotal;
        }

        let entry = self
            .per_ip
            .entry(ip)
            .or_insert_with(|| Mutex::new(IpEntry::new(now)));
        let mut entry = entry.lock();
        entry.last_activity = now;

        if self.config.max_connections_per_ip > 0
            && entry.connections >= self.config.max_connections_per_ip
        {
            counter::increment(counter::CONNLIMIT_REJECTION);
            return Admission::RejectPerIp;
        }

        let window = Duration::from_secs(self.config.rate_limit_window_seconds);
        while entry
            .opens
            .front()
            .is_some_and(|opened| now.duration_since(*opened) > window)
        {
            entry.opens.pop_front();
        }

        entry.opens.push_back(now);
        if self.config.max_connections_per_window > 0
            && entry.opens.len() > self.config.max_connections_per_window as usize
        {
            counter::increment(counter::RATELIMIT_REJECTION);
            return Admission::RejectWindow;
        }

        entry.connections += 1;
        self.total.fetch_add(1, Ordering::AcqRel);
        Admission::Admit
    }

    pub fn connection_closed(&self, ip: IpAddr) {
        if !self.enabled() {
            return;
        }

        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                Some(total.saturating_sub(1))
            })
            .ok();

        if let Some(entry) = self.per_ip.get(&ip) {
            let mut entry = entry.lock();
            entry.connections = entry.connections.saturating_sub(1);
            entry.last_activity = Instant::now();
        }
    }

    /// Records one command; returns `true` when the per-minute rate is
    /// exceeded and the caller should apply the tarpit.
    pub fn command_observed(&self, ip: IpAddr) -> bool {
        if !self.enabled() || self.config.max_commands_per_minute == 0 {
            return false;
        }

        let now = Instant::now();
        let entry = self
            .per_ip
            .entry(ip)
            .or_insert_with(|| Mutex::new(IpEntry::new(now)));
        let mut entry = entry.lock();
        entry.last_activity = now;

        while entry
            .commands
            .front()
            .is_some_and(|seen| now.duration_since(*seen) > COMMAND_WINDOW)
        {
            entry.commands.pop_front();
        }

        entry.commands.push_back(now);
        entry.commands.len() > self.config.max_commands_per_minute as usize
    }

    /// The progressive tarpit delay for the given violation count.
    #[must_use]
    pub const fn tarpit_delay(&self, violations: u32) -> Duration {
        Duration::from_millis(self.config.tarpit_delay_millis * violations as u64)
    }

    pub fn record_data_bytes(&self, ip: IpAddr, bytes: u64) {
        if !self.enabled() {
            return;
        }

        if let Some(entry) = self.per_ip.get(&ip) {
            let mut entry = entry.lock();
            entry.bytes += bytes;
            entry.last_activity = Instant::now();
        }
    }

    /// Slow-transfer guard for an in-flight DATA/BDAT transfer.
    #[must_use]
    pub fn transfer_verdict(&self, started: Instant, bytes: u64) -> TransferVerdict {
        if !self.enabled() {
            return TransferVerdict::Ok;
        }

        let elapsed = started.elapsed();

        if self.config.max_data_timeout_seconds > 0
            && elapsed > Duration::from_secs(self.config.max_data_timeout_seconds)
        {
            counter::increment(counter::SLOW_TRANSFER_DISCONNECT);
            return TransferVerdict::TimedOut;
        }

        if self.config.min_data_rate_bytes_per_second > 0 && elapsed > DATA_RATE_GRACE {
            let rate = bytes / elapsed.as_secs().max(1);
            if rate < self.config.min_data_rate_bytes_per_second {
                counter::increment(counter::SLOW_TRANSFER_DISCONNECT);
                return TransferVerdict::TooSlow;
            }
        }

        TransferVerdict::Ok
    }

    /// Drops per-IP entries idle longer than the widest configured window
    /// with no live connections.
    pub fn sweep(&self) {
        let widest = Duration::from_secs(self.config.rate_limit_window_seconds)
            .max(COMMAND_WINDOW);
        let now = Instant::now();

        self.per_ip.retain(|_, entry| {
            let entry = entry.lock();
            entry.connections > 0 || now.duration_since(entry.last_activity) <= widest
        });
    }

    /// Runs the janitor until shutdown, sweeping every 60 seconds.
    pub async fn run_janitor(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        let mut timer = tokio::time::interval(JANITOR_INTERVAL);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => self.sweep(),
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Number of IPs currently tracked, for the management surface.
    #[must_use]
    pub fn tracked_ips(&self) -> usize {
        self.per_ip.len()
    }
}

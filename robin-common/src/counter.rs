//! Process-wide counter registry.
//!
//! Rejections, tarpit disconnects and scanner verdicts increment named
//! counters here; tests and the management surface read them back. There is
//! no exporter, the registry is in-process state only.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use once_cell::sync::Lazy;

pub const VIRUS_REJECTION: &str = "email.virus.rejection";
pub const SPAM_REJECTION: &str = "email.spam.rejection";
pub const RATELIMIT_REJECTION: &str = "robin.dos.ratelimit.rejection";
pub const CONNLIMIT_REJECTION: &str = "robin.dos.connlimit.rejection";
pub const TARPIT_DISCONNECT: &str = "robin.dos.tarpit.disconnect";
pub const SLOW_TRANSFER_DISCONNECT: &str = "robin.dos.slowtransfer.disconnect";
pub const RBL_REJECTION: &str = "smtp.rbl.rejection";
pub const ERROR_LIMIT_DISCONNECT: &str = "smtp.session.error-limit";
pub const BOUNCE_GENERATED: &str = "queue.bounce.generated";

static COUNTERS: Lazy<DashMap<String, AtomicU64>> = Lazy::new(DashMap::new);

/// Adds one to the named counter, creating it at zero first if needed.
pub fn increment(name: &str) {
    add(name, 1);
}

pub fn add(name: &str, amount: u64) {
    if let Some(counter) = COUNTERS.get(name) {
        counter.fetch_add(amount, Ordering::Relaxed);
        return;
    }

    COUNTERS
        .entry(name.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(amount, Ordering::Relaxed);
}

/// Current value of the named counter; absent counters read as zero.
#[must_use]
pub fn value(name: &str) -> u64 {
    COUNTERS
        .get(name)
        .map_or(0, |counter| counter.load(Ordering::Relaxed))
}

/// Snapshot of every counter, for the management surface.
#[must_use]
pub fn snapshot() -> Vec<(String, u64)> {
    let mut all: Vec<_> = COUNTERS
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
        .collect();
    all.sort();
    all
}

#[cfg(test)]
mod test {
    use super::{add, increment, value};

    #[test]
    fn increments_are_visible() {
        let name = "test.counter.increments";
        assert_eq!(value(name), 0);

        increment(name);
        increment(name);
        add(name, 3);

        assert_eq!(value(name), 5);
    }
}

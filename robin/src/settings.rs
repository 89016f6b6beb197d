//! The current-configuration pointer.
//!
//! Configuration is an immutable snapshot behind one process-wide
//! [`ConfigHandle`]: readers clone the `Arc` and never observe a torn
//! config, a reload parses the file and swaps the pointer atomically. This
//! is the only global in the binary. SIGHUP triggers [`reload`]; listeners
//! consult [`current`] per accepted session and the retry scheduler per
//! tick, so both pick a reload up without a restart.

use std::sync::{Arc, OnceLock};

use robin_common::config::{Config, ConfigError, ConfigHandle};

static CURRENT: OnceLock<ConfigHandle> = OnceLock::new();

fn handle() -> &'static ConfigHandle {
    CURRENT.get_or_init(|| ConfigHandle::new(Config::default()))
}

/// Installs a snapshot, replacing any existing one.
pub fn install(config: Config) -> Arc<Config> {
    handle().swap(config)
}

/// The current snapshot. Defaults apply before `install` has run.
#[must_use]
pub fn current() -> Arc<Config> {
    handle().snapshot()
}

/// Re-reads the file and swaps the snapshot. A parse failure leaves the old
/// snapshot in place.
pub fn reload(path: impl AsRef<std::path::Path>) -> Result<Arc<Config>, ConfigError> {
    handle().reload_from(path)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::{current, install};
    use robin_common::config::Config;

    #[test]
    fn install_swaps_and_readers_see_it() {
        let mut config = Config::default();
        config.server.hostname = "swap.robin.test".to_string();
        install(config);
        assert_eq!(current().server.hostname, "swap.robin.test");

        let mut config = Config::default();
        config.server.hostname = "swap-again.robin.test".to_string();
        install(config);
        assert_eq!(current().server.hostname, "swap-again.robin.test");
    }
}

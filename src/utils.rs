//! Small shared helpers: idle/reconnect backoff and logging setup.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

const BACKOFF_BASE_MS: u64 = 50;
const BACKOFF_MAX_MS: u64 = 5_000;

/// Backoff in milliseconds after `attempt` consecutive empty polls or
/// connection failures.
///
/// Doubles from 50ms up to 5s. `seed` (usually the worker id) spreads the
/// loops apart by a few milliseconds so they do not poll in lockstep.
pub fn calculate_backoff(attempt: u32, seed: u64) -> u64 {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = BACKOFF_BASE_MS.saturating_mul(1u64 << exp);
    let spread = (seed.wrapping_mul(7919) % 17) * 3;
    delay.saturating_add(spread).min(BACKOFF_MAX_MS)
}

/// Install a global `tracing` subscriber built from [`LoggingConfig`].
///
/// `RUST_LOG` takes precedence over the configured level. Calling this twice
/// is harmless; the second install is ignored.
pub fn init_logging(config: &LoggingConfig) {
    let level: tracing::Level = config.level.into();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_targets);

    let result = match (config.json_format, config.include_timestamps) {
        (true, true) => builder.json().try_init(),
        (true, false) => builder.json().without_time().try_init(),
        (false, true) => builder.with_ansi(config.colored).try_init(),
        (false, false) => builder.with_ansi(config.colored).without_time().try_init(),
    };

    if result.is_err() {
        tracing::debug!("Global subscriber already installed, keeping it");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(calculate_backoff(1, 0), 50);
        assert_eq!(calculate_backoff(2, 0), 100);
        assert_eq!(calculate_backoff(4, 0), 400);
        assert_eq!(calculate_backoff(100, 0), BACKOFF_MAX_MS);
    }

    #[test]
    fn test_backoff_spreads_workers() {
        let a = calculate_backoff(1, 1);
        let b = calculate_backoff(1, 2);
        assert_ne!(a, b);
        assert!(a < 100 && b < 100);
    }

    #[test]
    fn test_init_logging_twice() {
        let config = LoggingConfig::default();
        init_logging(&config);
        init_logging(&config);
    }
}

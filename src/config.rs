//! Tunables for the messaging core.
//!
//! The embedding shell normally passes a [`MessengerConfig`] explicitly;
//! `from_env` exists for the standalone binary and for operators who want to
//! tweak timings without a rebuild.

/// Retry and timeout knobs for the supervisor and request channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessengerConfig {
    /// First restart delay after a crash, in milliseconds.
    pub restart_base_delay_ms: u64,
    /// Ceiling for the exponential restart delay, in milliseconds.
    pub restart_max_delay_ms: u64,
    /// Per-request timeout for worker RPCs, in milliseconds.
    pub request_timeout_ms: u64,
    /// How long a graceful stop waits for the worker to exit before the
    /// process is killed, in milliseconds.
    pub kill_timeout_ms: u64,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            restart_base_delay_ms: 500,
            restart_max_delay_ms: 10_000,
            request_timeout_ms: 15_000,
            kill_timeout_ms: 2_000,
        }
    }
}

impl MessengerConfig {
    /// Defaults overridden by `COURIER_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but with an injectable lookup,
    /// so tests do not touch process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            restart_base_delay_ms: read_ms(
                &lookup,
                "COURIER_RESTART_BASE_MS",
                defaults.restart_base_delay_ms,
            ),
            restart_max_delay_ms: read_ms(
                &lookup,
                "COURIER_RESTART_MAX_MS",
                defaults.restart_max_delay_ms,
            ),
            request_timeout_ms: read_ms(
                &lookup,
                "COURIER_REQUEST_TIMEOUT_MS",
                defaults.request_timeout_ms,
            ),
            kill_timeout_ms: read_ms(&lookup, "COURIER_KILL_TIMEOUT_MS", defaults.kill_timeout_ms),
        }
    }
}

fn read_ms(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

//! Detection settings.

use core::time::Duration;
use std::env;

use tracing::warn;

use crate::types::CandidateKind;

/// Polling period override in milliseconds.
pub const ENV_TICK_MS: &str = "ASDF_PRESENT_TICK_MS";

/// Default detection timeout override in milliseconds.
pub const ENV_TIMEOUT_MS: &str = "ASDF_PRESENT_TIMEOUT_MS";

/// Comma separated list of enabled candidates.
pub const ENV_CANDIDATES: &str = "ASDF_PRESENT_CANDIDATES";

#[derive(Debug, Clone, PartialEq)]
pub struct DetectConfig {
    /// Period of a probing tick.
    pub tick: Duration,

    /// Timeout used when the caller does not pass one.
    pub timeout: Duration,

    /// Upper bound `cancel` waits for the probing loop to exit.
    pub cancel_timeout: Duration,

    /// Upper bound waited for running replacements after hooks are removed.
    pub drain_timeout: Duration,

    /// Lowest `GL_VERSION` confirming an OpenGL candidate.
    pub min_gl_version: (u32, u32),

    /// Candidates probed, in probing order.
    pub candidates: Vec<CandidateKind>,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
            cancel_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_millis(500),
            min_gl_version: (3, 1),
            candidates: CandidateKind::ALL.to_vec(),
        }
    }
}

impl DetectConfig {
    /// Default config with overrides from the process environment.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides read from `lookup`. Malformed values are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn millis(key: &str, value: &str) -> Option<Duration> {
            match value.trim().parse::<u64>() {
                Ok(ms) => Some(Duration::from_millis(ms)),
                Err(err) => {
                    warn!("ignoring {key}={value}. {err}");
                    None
                }
            }
        }

        if let Some(tick) = lookup(ENV_TICK_MS).and_then(|value| millis(ENV_TICK_MS, &value)) {
            self.tick = tick.max(Duration::from_millis(1));
        }

        if let Some(timeout) =
            lookup(ENV_TIMEOUT_MS).and_then(|value| millis(ENV_TIMEOUT_MS, &value))
        {
            self.timeout = timeout;
        }

        if let Some(list) = lookup(ENV_CANDIDATES) {
            let mut candidates = Vec::new();
            for name in list.split(',').filter(|name| !name.trim().is_empty()) {
                match name.parse::<CandidateKind>() {
                    Ok(kind) if !candidates.contains(&kind) => candidates.push(kind),
                    Ok(_) => {}
                    Err(err) => warn!("ignoring candidate. {err}"),
                }
            }

            self.candidates = candidates;
        }

        self
    }
}

//! Analyzer configuration.
//!
//! All knobs are collected once at startup into an immutable [`Config`] that
//! is threaded through construction of the analyzer. There is no mutable
//! global state.

use std::time::Duration;

use regex::Regex;

// Debugging is controlled by the five least significant bits of the debug
// pattern.
pub const DEBUG_WARNING: u32 = 1;
pub const DEBUG_TRACE: u32 = 2;
pub const DEBUG_TRACE1: u32 = 4;
pub const DEBUG_TRACE2: u32 = 8;
pub const DEBUG_DATA: u32 = 16;

/// The maximum user time allowed for handling one request. This is a critical
/// parameter because all caches are reset if it is exceeded, and a fresh
/// cache makes the next request slower still.
pub const USER_TIME_QUOTA: Duration = Duration::from_millis(3800);

#[derive(Debug, Clone)]
pub struct Config {
    /// Bitmask selecting warning, trace, and data diagnostics.
    pub debug_pattern: u32,
    /// Tolerate absolute includepaths by silently skipping them during
    /// resolution instead of rejecting the whole compilation.
    pub unsafe_absolute_includes: bool,
    /// Skip emission of the placeholder files that force pass-through
    /// directories to exist on the server.
    pub no_force_dirs: bool,
    /// Glob expressions re-evaluated before each request; any change flushes
    /// all caches.
    pub stat_reset_triggers: Vec<String>,
    /// Warn whenever a resolved realpath matches this expression.
    pub path_observation_re: Option<Regex>,
    /// Additionally run the real preprocessor and compare dependency sets.
    pub verify: bool,
    /// Write the computed (and, with `verify`, the exact) closure to disk.
    pub write_include_closure: bool,
    /// Per-request user-time bound.
    pub user_time_quota: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug_pattern: DEBUG_WARNING,
            unsafe_absolute_includes: false,
            no_force_dirs: false,
            stat_reset_triggers: Vec::new(),
            path_observation_re: None,
            verify: false,
            write_include_closure: false,
            user_time_quota: USER_TIME_QUOTA,
        }
    }
}

impl Config {
    /// Whether any of the given debug bits is enabled.
    pub fn debug(&self, bits: u32) -> bool {
        self.debug_pattern & bits != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_enables_warnings_only() {
        let config = Config::default();
        assert!(config.debug(DEBUG_WARNING));
        assert!(!config.debug(DEBUG_TRACE));
        assert!(!config.debug(DEBUG_DATA));
        assert_eq!(config.user_time_quota, USER_TIME_QUOTA);
    }
}

//! Tunables for sessions, the response framer and the output sanitizer.
//!
//! Every field has a default so a partial TOML table deserializes cleanly.
//! Durations are stored as milliseconds and exposed as `Duration` accessors.

use serde::Deserialize;
use std::time::Duration;

/// Per-session timing and sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Upper bound on the wait for a startup banner.
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Quiet period after which a banner is considered complete.
    #[serde(default = "default_banner_settle_ms")]
    pub banner_settle_ms: u64,
    /// Time between SIGTERM and SIGKILL on stop.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_health_period_ms")]
    pub health_period_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Record request/response pairs in memory.
    #[serde(default)]
    pub transcript: bool,
    #[serde(default = "default_transcript_max_entries")]
    pub transcript_max_entries: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Sessions idle longer than this are reaped by `SessionRegistry::gc`.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub framer: FramerRules,
    #[serde(default)]
    pub sanitizer: SanitizeRules,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            startup_grace_ms: default_startup_grace_ms(),
            banner_settle_ms: default_banner_settle_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            health_period_ms: default_health_period_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            cols: default_cols(),
            rows: default_rows(),
            transcript: false,
            transcript_max_entries: default_transcript_max_entries(),
            max_sessions: default_max_sessions(),
            idle_timeout_secs: default_idle_timeout_secs(),
            framer: FramerRules::default(),
            sanitizer: SanitizeRules::default(),
        }
    }
}

impl SessionConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn banner_settle(&self) -> Duration {
        Duration::from_millis(self.banner_settle_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn health_period(&self) -> Duration {
        Duration::from_millis(self.health_period_ms.max(1))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Rule table for the response framer.
#[derive(Debug, Clone, Deserialize)]
pub struct FramerRules {
    /// Quiet period that triggers an idle-flush.
    #[serde(default = "default_idle_window_ms")]
    pub idle_window_ms: u64,
    /// Minimum cleaned length (in chars) for an idle-flush.
    #[serde(default = "default_min_content_chars")]
    pub min_content_chars: usize,
    /// Flush as soon as the last non-empty cleaned line ends in `.`, `!` or `?`.
    #[serde(default = "default_true")]
    pub sentence_punctuation: bool,
    /// Extra "likely complete" regexes matched against the cleaned text.
    #[serde(default = "default_completion_patterns")]
    pub completion_patterns: Vec<String>,
    /// Quiet period after which anything buffered is flushed as-is.
    #[serde(default = "default_desperate_window_ms")]
    pub desperate_window_ms: u64,
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
}

impl Default for FramerRules {
    fn default() -> Self {
        Self {
            idle_window_ms: default_idle_window_ms(),
            min_content_chars: default_min_content_chars(),
            sentence_punctuation: true,
            completion_patterns: default_completion_patterns(),
            desperate_window_ms: default_desperate_window_ms(),
            max_buffer_bytes: default_max_buffer_bytes(),
        }
    }
}

impl FramerRules {
    pub fn idle_window(&self) -> Duration {
        Duration::from_millis(self.idle_window_ms)
    }

    pub fn desperate_window(&self) -> Duration {
        Duration::from_millis(self.desperate_window_ms)
    }
}

/// Rule table for the output sanitizer.
#[derive(Debug, Clone, Deserialize)]
pub struct SanitizeRules {
    /// Lines matching any of these regexes are dropped.
    #[serde(default)]
    pub noise_patterns: Vec<String>,
    /// Lines shorter than this with no alphanumeric characters are dropped.
    #[serde(default = "default_min_fragment_chars")]
    pub min_fragment_chars: usize,
    #[serde(default = "default_true")]
    pub collapse_spaces: bool,
    /// Minimum non-whitespace chars in the raw chunk before the
    /// escape-stripped fallback is used for an otherwise empty result.
    #[serde(default = "default_fallback_min_chars")]
    pub fallback_min_chars: usize,
}

impl Default for SanitizeRules {
    fn default() -> Self {
        Self {
            noise_patterns: Vec::new(),
            min_fragment_chars: default_min_fragment_chars(),
            collapse_spaces: true,
            fallback_min_chars: default_fallback_min_chars(),
        }
    }
}

fn default_startup_grace_ms() -> u64 {
    3000
}
fn default_banner_settle_ms() -> u64 {
    400
}
fn default_stop_grace_ms() -> u64 {
    2000
}
fn default_health_period_ms() -> u64 {
    1000
}
fn default_send_timeout_ms() -> u64 {
    60_000
}
fn default_cols() -> u16 {
    120
}
fn default_rows() -> u16 {
    40
}
fn default_transcript_max_entries() -> usize {
    1000
}
fn default_max_sessions() -> usize {
    64
}
fn default_idle_timeout_secs() -> u64 {
    3600
}
fn default_idle_window_ms() -> u64 {
    1500
}
fn default_min_content_chars() -> usize {
    2
}
fn default_completion_patterns() -> Vec<String> {
    vec![
        r"(?i)\(y/n\)\s*$".to_string(),
        r"(?i)\[y/n\]\s*$".to_string(),
        r"(?i)do you want to proceed".to_string(),
        r"(?i)press enter to continue".to_string(),
    ]
}
fn default_desperate_window_ms() -> u64 {
    8000
}
fn default_max_buffer_bytes() -> usize {
    1024 * 1024
}
fn default_min_fragment_chars() -> usize {
    3
}
fn default_fallback_min_chars() -> usize {
    8
}
fn default_true() -> bool {
    true
}

//! Response framer: decides when the bytes accumulated for a request form a
//! complete response.
//!
//! The child speaks no protocol, so completion is guessed from the stream.
//! Rules are tried in order, first match wins:
//!
//! 1. idle: quiet for `idle_window` and enough cleaned content
//! 2. pattern: cleaned text looks finished (sentence punctuation on the last
//!    line, or a configured completion phrase); flushes at once
//! 3. desperate: quiet for `desperate_window`, flush whatever is there
//! 4. overflow: buffer grew past `max_buffer_bytes`
//!
//! Occasional merged or split responses are an accepted outcome.
//!
//! The framer never reads a clock; callers pass `now` in, which keeps every
//! rule testable with synthetic instants.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::FramerRules;
use crate::error::PatternError;
use crate::sanitize::Sanitizer;

/// `.`, `!` or `?` at the end of a line, optionally followed by closing
/// quotes/brackets. An ellipsis does not count.
static SENTENCE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:^|[^.])[.!?]["')\]]*$"#).unwrap());

/// Why a flush happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    Idle,
    Pattern,
    Desperate,
    Overflow,
}

/// One framed response.
#[derive(Debug, Clone)]
pub struct Flush {
    pub reason: FlushReason,
    /// Everything buffered since the previous flush.
    pub raw: Vec<u8>,
    /// `raw` passed through the sanitizer, including its raw fallback.
    pub text: String,
}

/// Compiled framer rule table.
#[derive(Debug, Clone)]
pub struct FramePolicy {
    idle_window: Duration,
    min_content_chars: usize,
    sentence_punctuation: bool,
    completion: Vec<Regex>,
    desperate_window: Duration,
    max_buffer_bytes: usize,
}

impl Default for FramePolicy {
    fn default() -> Self {
        Self::new(&FramerRules::default()).expect("built-in completion patterns compile")
    }
}

impl FramePolicy {
    pub fn new(rules: &FramerRules) -> Result<Self, PatternError> {
        let completion = rules
            .completion_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|source| PatternError {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            idle_window: rules.idle_window(),
            min_content_chars: rules.min_content_chars,
            sentence_punctuation: rules.sentence_punctuation,
            completion,
            desperate_window: rules.desperate_window(),
            max_buffer_bytes: rules.max_buffer_bytes,
        })
    }

    fn looks_complete(&self, cleaned: &str) -> bool {
        if cleaned.is_empty() {
            return false;
        }
        if self.sentence_punctuation {
            let last = cleaned.lines().rev().find(|l| !l.trim().is_empty());
            if last.is_some_and(|l| SENTENCE_END.is_match(l.trim_end())) {
                return true;
            }
        }
        self.completion.iter().any(|re| re.is_match(cleaned))
    }
}

/// Byte accumulator plus flush decision for one session.
pub struct Framer {
    policy: Arc<FramePolicy>,
    sanitizer: Arc<Sanitizer>,
    buf: Vec<u8>,
    echo: Option<String>,
    last_activity: Instant,
    /// Cleaned view of `buf`; `None` after the buffer changed.
    cleaned: Option<String>,
}

impl Framer {
    pub fn new(policy: Arc<FramePolicy>, sanitizer: Arc<Sanitizer>, now: Instant) -> Self {
        Self {
            policy,
            sanitizer,
            buf: Vec::new(),
            echo: None,
            last_activity: now,
            cleaned: None,
        }
    }

    /// Arm for a new request. Restarts the quiet clock and records the text
    /// the child will echo; bytes left over from an earlier request stay.
    pub fn begin(&mut self, now: Instant, echo: Option<&str>) {
        self.echo = echo.map(str::to_string);
        self.last_activity = now;
        self.cleaned = None;
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8], now: Instant) {
        if bytes.is_empty() {
            return;
        }
        self.buf.extend_from_slice(bytes);
        self.last_activity = now;
        self.cleaned = None;
    }

    /// Enforce `max_buffer_bytes` while nobody is waiting for a response.
    /// The oldest bytes go first, cut at a line boundary when one exists in
    /// the excess tail. Returns how many bytes were dropped.
    pub fn trim_to_cap(&mut self) -> usize {
        let max = self.policy.max_buffer_bytes;
        if self.buf.len() <= max {
            return 0;
        }
        let excess = self.buf.len() - max;
        let cut = self.buf[excess..]
            .iter()
            .position(|b| *b == b'\n')
            .map_or(excess, |p| excess + p + 1);
        self.buf.drain(..cut);
        self.cleaned = None;
        cut
    }

    /// Drop everything buffered (used to discard a startup banner).
    pub fn clear(&mut self) {
        self.buf.clear();
        self.cleaned = None;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Quiet time since the last byte or the last `begin`.
    pub fn quiet_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Apply the rule table. On a match the buffer is drained into the
    /// returned `Flush`.
    pub fn poll(&mut self, now: Instant) -> Option<Flush> {
        if self.buf.is_empty() {
            return None;
        }
        let quiet = self.quiet_for(now);
        let policy = Arc::clone(&self.policy);
        let cleaned = self.cleaned();

        let reason = if quiet >= policy.idle_window
            && cleaned.chars().count() >= policy.min_content_chars
        {
            FlushReason::Idle
        } else if policy.looks_complete(cleaned) {
            FlushReason::Pattern
        } else if quiet >= policy.desperate_window {
            FlushReason::Desperate
        } else if self.buf.len() > policy.max_buffer_bytes {
            FlushReason::Overflow
        } else {
            return None;
        };

        Some(self.take(reason))
    }

    fn cleaned(&mut self) -> &str {
        if self.cleaned.is_none() {
            self.cleaned = Some(self.sanitizer.content(&self.buf, self.echo.as_deref()));
        }
        self.cleaned.as_deref().unwrap_or_default()
    }

    fn take(&mut self, reason: FlushReason) -> Flush {
        let raw = std::mem::take(&mut self.buf);
        self.cleaned = None;
        let text = self.sanitizer.sanitize(&raw, self.echo.as_deref());
        Flush { reason, raw, text }
    }
}

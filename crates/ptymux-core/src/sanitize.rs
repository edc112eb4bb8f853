//! Output sanitizer: raw terminal bytes in, readable text out.
//!
//! Stateless. Carriage-return overwrites are resolved per line, escape
//! sequences are stripped, noise lines (prompts, the echoed request, spinner
//! frames, separators) are dropped and whitespace is normalized. When the
//! filters eat everything although the child clearly printed something, the
//! escape-stripped text is returned instead so callers never get an empty
//! answer for real output.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::SanitizeRules;
use crate::error::PatternError;

/// CSI fragments that survive when the leading ESC was split off or mangled.
static RESIDUAL_CSI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\??\d+(?:;\d+)*[A-HJKSTfhlmnsu]").unwrap());

/// Everything a shell or REPL prints before the cursor: `$`, `#`, `>>>`,
/// `user@host:~$`, `bash-5.1$`, `❯`.
static PROMPT_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w.@:~/\-]*\s?[$#%❯»>]{1,3}\s*").unwrap());

/// A prompt standing alone on a line. The prefix must look like a host or
/// path (`@`, `:` or `~` in it) or a shell version tag (`bash-5.1`), so
/// single words such as `100%` or `done>` stay content.
static BARE_PROMPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:(?:[\w.\-/]*[@:~][\w.@:~/\-]*|[A-Za-z]+-\d+(?:\.\d+)*)\s?)?[$#%❯»>]{1,3}$",
    )
    .unwrap()
});

static SPINNER_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[·✻✽✶✳✢\u{2800}-\u{28FF}|/\\\-\s]+$").unwrap());

static SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[─━═]+$").unwrap());

static SPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r" {2,}").unwrap());

/// Compiled sanitizer rule table.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    noise: Vec<Regex>,
    min_fragment_chars: usize,
    collapse_spaces: bool,
    fallback_min_chars: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self {
            noise: Vec::new(),
            min_fragment_chars: SanitizeRules::default().min_fragment_chars,
            collapse_spaces: true,
            fallback_min_chars: SanitizeRules::default().fallback_min_chars,
        }
    }
}

impl Sanitizer {
    pub fn new(rules: &SanitizeRules) -> Result<Self, PatternError> {
        let noise = rules
            .noise_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|source| PatternError {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            noise,
            min_fragment_chars: rules.min_fragment_chars,
            collapse_spaces: rules.collapse_spaces,
            fallback_min_chars: rules.fallback_min_chars,
        })
    }

    /// Clean one flushed chunk. `echo` is the request text that was written
    /// to the child; lines that merely repeat one of its lines are dropped.
    pub fn sanitize(&self, raw: &[u8], echo: Option<&str>) -> String {
        let stripped = strip_control(raw);
        let cleaned = self.filter_lines(&stripped, echo);
        if !cleaned.is_empty() {
            return cleaned;
        }

        let visible = stripped.chars().filter(|c| !c.is_whitespace()).count();
        if self.fallback_min_chars > 0 && visible >= self.fallback_min_chars {
            return stripped.trim().to_string();
        }
        String::new()
    }

    /// Like `sanitize` but without the raw fallback: noise-only input yields
    /// an empty string. Used for framing decisions.
    pub fn content(&self, raw: &[u8], echo: Option<&str>) -> String {
        self.filter_lines(&strip_control(raw), echo)
    }

    fn filter_lines(&self, stripped: &str, echo: Option<&str>) -> String {
        // A multi-line request comes back from the terminal one line at a time.
        let echo: Vec<String> = echo
            .into_iter()
            .flat_map(str::lines)
            .map(|l| self.normalize(l.trim()))
            .filter(|l| !l.is_empty())
            .collect();

        let mut out = String::with_capacity(stripped.len());
        let mut pending_blank = false;
        for line in stripped.lines() {
            let line = self.normalize(line.trim_end());
            if line.is_empty() {
                pending_blank = !out.is_empty();
                continue;
            }
            // Noise is judged on the emitted form.
            if self.is_noise(&line, &echo) {
                continue;
            }
            if pending_blank {
                out.push('\n');
                pending_blank = false;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&line);
        }

        out.trim().to_string()
    }

    fn normalize(&self, line: &str) -> String {
        if self.collapse_spaces {
            collapse_interior_spaces(line)
        } else {
            line.to_string()
        }
    }

    fn is_noise(&self, line: &str, echo: &[String]) -> bool {
        let trimmed = line.trim();
        if BARE_PROMPT.is_match(trimmed) || SPINNER_ONLY.is_match(trimmed) {
            return true;
        }
        if SEPARATOR.is_match(trimmed) {
            return true;
        }
        if !echo.is_empty() {
            let unprompted = PROMPT_PREFIX.replace(trimmed, "");
            if echo.iter().any(|e| e == trimmed || *e == unprompted) {
                return true;
            }
        }
        if trimmed.chars().count() < self.min_fragment_chars
            && !trimmed.chars().any(char::is_alphanumeric)
        {
            return true;
        }
        self.noise.iter().any(|re| re.is_match(trimmed))
    }
}

/// Escape-sequence stripping only: carriage returns resolved, ANSI/OSC
/// sequences and stray control characters removed. Newlines and tabs stay.
pub fn strip_control(raw: &[u8]) -> String {
    let resolved = resolve_carriage_returns(raw);
    let stripped = strip_ansi_escapes::strip(&resolved);
    let text = String::from_utf8_lossy(&stripped);
    let text = RESIDUAL_CSI.replace_all(&text, "");
    text.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Emulate `\r` overwrites: within each line only the text after the last
/// carriage return survives. Trailing `\r` of `\r\n` endings is dropped first.
fn resolve_carriage_returns(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    for (i, segment) in raw.split(|b| *b == b'\n').enumerate() {
        if i > 0 {
            out.push(b'\n');
        }
        let mut end = segment.len();
        while end > 0 && segment[end - 1] == b'\r' {
            end -= 1;
        }
        let segment = &segment[..end];
        let start = segment
            .iter()
            .rposition(|b| *b == b'\r')
            .map_or(0, |p| p + 1);
        out.extend_from_slice(&segment[start..]);
    }
    out
}

/// Collapse runs of spaces inside a line, keeping leading indentation.
fn collapse_interior_spaces(line: &str) -> String {
    let body = line.trim_start_matches(' ');
    let indent = &line[..line.len() - body.len()];
    format!("{indent}{}", SPACE_RUN.replace_all(body, " "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean(raw: &str) -> String {
        Sanitizer::default().sanitize(raw.as_bytes(), None)
    }

    #[test]
    fn strips_color_and_cursor_sequences() {
        let raw = "\x1b[1;32mpod/web-1\x1b[0m is \x1b[33mRunning\x1b[0m.\r\n\x1b[2K\x1b[?25h";
        assert_eq!(clean(raw), "pod/web-1 is Running.");
    }

    #[test]
    fn strips_osc_title() {
        let raw = "\x1b]0;kubectl-ai\x07Deployment scaled to 3 replicas.\r\n";
        assert_eq!(clean(raw), "Deployment scaled to 3 replicas.");
    }

    #[test]
    fn carriage_return_overwrites_spinner() {
        let raw = "⠋ Thinking...\r⠙ Thinking...\r\x1b[KThere are 4 pods.\r\n";
        assert_eq!(clean(raw), "There are 4 pods.");
    }

    #[test]
    fn residual_csi_fragments_removed() {
        assert_eq!(clean("[?2004hready to go\n[0m"), "ready to go");
    }

    #[test]
    fn drops_prompts_echo_and_fragments() {
        let raw = "$ get pods\r\nget pods\r\nNAME    READY\r\nweb-1   1/1\r\n|\r\n>>> \r\nroot@box:/# \r\n";
        let out = Sanitizer::default().sanitize(raw.as_bytes(), Some("get pods"));
        assert_eq!(out, "NAME READY\nweb-1 1/1");
    }

    #[test]
    fn echo_after_prompt_is_dropped() {
        let out = Sanitizer::default().sanitize(b">>> hello\r\nhello world.\r\n", Some("hello"));
        assert_eq!(out, "hello world.");
    }

    #[test]
    fn collapses_blank_lines_and_spaces_but_keeps_indent() {
        let raw = "first   line\n\n\n\nsecond\n    indented   value\n";
        assert_eq!(clean(raw), "first line\n\nsecond\n    indented value");
    }

    #[test]
    fn space_collapsing_can_be_disabled() {
        let rules = SanitizeRules {
            collapse_spaces: false,
            ..SanitizeRules::default()
        };
        let s = Sanitizer::new(&rules).unwrap();
        assert_eq!(s.sanitize(b"NAME    READY\n", None), "NAME    READY");
    }

    #[test]
    fn configured_noise_patterns() {
        let rules = SanitizeRules {
            noise_patterns: vec![r"^Loading model".to_string()],
            ..SanitizeRules::default()
        };
        let s = Sanitizer::new(&rules).unwrap();
        assert_eq!(s.sanitize(b"Loading model gemini...\nDone.\n", None), "Done.");
    }

    #[test]
    fn invalid_noise_pattern_is_reported() {
        let rules = SanitizeRules {
            noise_patterns: vec!["(unclosed".to_string()],
            ..SanitizeRules::default()
        };
        let err = Sanitizer::new(&rules).unwrap_err();
        assert_eq!(err.pattern, "(unclosed");
    }

    #[test]
    fn falls_back_to_raw_when_filters_eat_everything() {
        // Every line looks like a prompt, but there is clearly content.
        let raw = "\x1b[32mcluster-admin@prod:~$\x1b[0m\r\nroot@web-1:/app#\r\n";
        let out = clean(raw);
        assert_eq!(out, "cluster-admin@prod:~$\nroot@web-1:/app#");
    }

    #[test]
    fn single_words_ending_in_prompt_glyphs_are_kept() {
        let raw = "Pulling image\r\n100%\r\ndone>\r\nbash-5.1$ \r\n~ %\r\n";
        assert_eq!(clean(raw), "Pulling image\n100%\ndone>");
    }

    #[test]
    fn multi_line_echo_is_dropped_line_by_line() {
        let s = Sanitizer::default();
        let echo = Some("first line.\nsecond   question?");
        let raw = b"first line.\r\n> second question?\r\n";
        assert_eq!(s.content(raw, echo), "");

        let raw = b"first line.\r\nsecond question?\r\nBoth answered.\r\n";
        assert_eq!(s.sanitize(raw, echo), "Both answered.");
    }

    #[test]
    fn content_never_falls_back() {
        let s = Sanitizer::default();
        let raw = b"list all pods in kube-system\r\n";
        assert_eq!(s.content(raw, Some("list all pods in kube-system")), "");
        assert_eq!(
            s.sanitize(raw, Some("list all pods in kube-system")),
            "list all pods in kube-system"
        );
    }

    #[test]
    fn tiny_noise_stays_empty() {
        assert_eq!(clean("\x1b[2J\x1b[H$ \r\n"), "");
        assert_eq!(clean(""), "");
    }

    #[test]
    fn plain_text_passes_through() {
        let text = "The deployment nginx has 3 replicas.\nAll of them are ready!";
        assert_eq!(clean(text), text);
    }

    #[test]
    fn sanitizing_is_idempotent() {
        let samples = [
            "plain answer.",
            "a   b    c\n\n\n  d  e",
            "\x1b[1mbold\x1b[0m text\r\n$ \r\nmore text\r\n",
            "⠋ working\r done.\n",
            "user@host:~$\n>>>\n",
            "NAME  READY  STATUS\nweb   1/1    Running\n\n\n\nEnd.",
            "note  >\nfoo bar.\n",
            "ops@bastion:~  $\nfoo bar.\n",
            "done   #\nok.",
        ];
        let s = Sanitizer::default();
        for raw in samples {
            let once = s.sanitize(raw.as_bytes(), None);
            let twice = s.sanitize(once.as_bytes(), None);
            assert_eq!(once, twice, "not idempotent for {raw:?}");
        }
    }
}

//! Byte classification and packet boundary rules.
//!
//! A [`FramingPolicy`] is built once per listener from its configuration and
//! consulted by the session read loop for every byte: terminator membership,
//! ignore/backspace handling, effective length bounds, and the optional
//! prompt. [`PatternMatcher`] implements multi-byte terminator detection for
//! binary listeners.

use crate::config::FramingConfig;

/// Default maximum packet length for text-mode listeners.
pub const DEFAULT_TEXT_MAX_LENGTH: usize = 2048;

/// Default maximum packet length for binary-mode listeners.
pub const DEFAULT_BINARY_MAX_LENGTH: usize = 1024;

/// Per-listener framing rules, resolved from configuration.
#[derive(Debug, Clone)]
pub struct FramingPolicy {
    text: bool,
    line_terminators: Vec<u8>,
    ignore: Vec<u8>,
    backspace: Vec<u8>,
    include_terminator: bool,
    min_length: usize,
    max_length: usize,
    pattern: Option<Vec<u8>>,
    prompt: Option<String>,
    auto_prompt: bool,
}

impl FramingPolicy {
    pub fn new(framing: &FramingConfig, prompt: Option<String>, auto_prompt: bool) -> Self {
        Self {
            text: framing.text,
            line_terminators: framing.line_terminators.clone(),
            ignore: framing.ignore.clone(),
            backspace: framing.backspace.clone(),
            include_terminator: framing.include_terminator,
            min_length: framing.min_length,
            max_length: framing.max_length,
            pattern: framing.terminator_pattern.clone(),
            prompt,
            auto_prompt,
        }
    }

    pub fn is_text(&self) -> bool {
        self.text
    }

    pub fn is_line_terminator(&self, b: u8) -> bool {
        self.line_terminators.contains(&b)
    }

    pub fn is_ignored(&self, b: u8) -> bool {
        self.ignore.contains(&b)
    }

    /// Backspace editing applies only to interactive (prompted) sessions.
    pub fn is_backspace(&self, b: u8) -> bool {
        self.has_prompt() && self.backspace.contains(&b)
    }

    pub fn include_terminator(&self) -> bool {
        self.include_terminator
    }

    pub fn terminator_pattern(&self) -> Option<&[u8]> {
        self.pattern.as_deref()
    }

    pub fn has_prompt(&self) -> bool {
        self.prompt.is_some() || self.auto_prompt
    }

    /// The prompt to write before reading packet number `index` (0-based).
    /// An explicit prompt wins; auto-prompt renders a 1-based counter and
    /// only makes sense for interactive text sessions.
    pub fn prompt(&self, index: u64) -> Option<Vec<u8>> {
        if let Some(p) = &self.prompt {
            Some(p.as_bytes().to_vec())
        } else if self.auto_prompt && self.text {
            Some(format!("{}> ", index + 1).into_bytes())
        } else {
            None
        }
    }

    /// Effective maximum packet length, honoring a handler override, then
    /// the listener configuration, then the per-mode default.
    pub fn max_length(&self, handler_override: Option<usize>) -> usize {
        if let Some(n) = handler_override {
            if n > 0 {
                return n;
            }
        }
        if self.max_length > 0 {
            self.max_length
        } else if self.text {
            DEFAULT_TEXT_MAX_LENGTH
        } else {
            DEFAULT_BINARY_MAX_LENGTH
        }
    }

    /// Effective minimum packet length. With nothing configured, text mode
    /// reads at least one byte while binary mode reads to the maximum
    /// (fixed-size packets unless the handler says otherwise).
    pub fn min_length(&self, handler_override: Option<usize>, max: usize) -> usize {
        let min = if let Some(n) = handler_override {
            n
        } else if self.min_length > 0 {
            self.min_length
        } else if self.text {
            1
        } else {
            max
        };
        min.min(max)
    }
}

/// Incremental matcher for a multi-byte terminator sequence.
///
/// On mismatch the match position restarts at zero (or one, when the
/// offending byte equals the first pattern byte); overlapping prefixes are
/// not tracked, so e.g. pattern `##!` does not fire on input `###!`.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    pattern: Vec<u8>,
    matched: usize,
}

impl PatternMatcher {
    pub fn new(pattern: &[u8]) -> Self {
        Self {
            pattern: pattern.to_vec(),
            matched: 0,
        }
    }

    /// Feed one byte; returns true when the full pattern has just matched.
    pub fn push(&mut self, b: u8) -> bool {
        if b == self.pattern[self.matched] {
            self.matched += 1;
            if self.matched == self.pattern.len() {
                self.matched = 0;
                return true;
            }
        } else if b == self.pattern[0] {
            self.matched = 1;
        } else {
            self.matched = 0;
        }
        false
    }

    pub fn reset(&mut self) {
        self.matched = 0;
    }
}

use regex::bytes::{Regex, RegexBuilder};

use crate::mailbox::{BoundaryFlags, MailboxError, Result};

/// Offsets of one separator line inside the decode window.
/// `end` stops before the line terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    pub start: usize,
    pub end: usize,
}

impl Boundary {

    pub fn shift_left(self, by: usize) -> Self {
        Self { start: self.start - by, end: self.end - by }
    }

}

#[derive(Debug, Clone)]
pub struct BoundaryMatcher {
    regex: Regex,
}

impl BoundaryMatcher {

    pub fn new(pattern: &str, flags: BoundaryFlags) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .multi_line(flags.multi_line)
            .case_insensitive(flags.case_insensitive)
            .crlf(flags.crlf)
            .build()
            .map_err(|e| MailboxError::InvalidConfiguration(format!("invalid separator pattern: {e}")))?;
        Ok(Self { regex })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Next separator starting at or after `from`. Anchors look behind `from`,
    /// so a search resumed mid-text only matches at real line starts.
    pub fn find_at(&self, text: &[u8], from: usize) -> Option<Boundary> {
        if from > text.len() {
            return None;
        }
        self.regex.find_at(text, from)
            .map(|m| Boundary { start: m.start(), end: m.end() })
    }

    /// Offset right after the line terminator following `end`, if decoded yet.
    pub fn line_end(text: &[u8], end: usize) -> Option<usize> {
        let end = end.min(text.len());
        text[end..].iter()
            .position(|&b| b == b'\n')
            .map(|nl| end + nl + 1)
    }

}

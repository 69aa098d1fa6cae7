//! CI reporting protocol.
//!
//! Emits the line-oriented `##teamcity[...]` service messages that delimit
//! named blocks and record per-test outcomes. Structural characters inside
//! free-text fields are escaped with the pipe rule. When reporting is
//! disabled the emitter stays silent, so call sites never need to branch.

use std::io::{self, Write};

/// Escapes structural characters inside a service-message value.
#[must_use]
pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '|' => escaped.push_str("||"),
            '\'' => escaped.push_str("|'"),
            '\n' => escaped.push_str("|n"),
            '\r' => escaped.push_str("|r"),
            '[' => escaped.push_str("|["),
            ']' => escaped.push_str("|]"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Formats a block-opened marker.
#[must_use]
pub fn block_opened(name: &str) -> String {
    format!("##teamcity[blockOpened name='{}']", escape(name))
}

/// Formats a block-closed marker.
#[must_use]
pub fn block_closed(name: &str) -> String {
    format!("##teamcity[blockClosed name='{}']", escape(name))
}

/// Formats a test-started record.
#[must_use]
pub fn test_started(name: &str) -> String {
    format!("##teamcity[testStarted name='{}']", escape(name))
}

/// Formats a test-failed record.
#[must_use]
pub fn test_failed(name: &str, message: &str, details: &str) -> String {
    format!(
        "##teamcity[testFailed name='{}' message='{}' details='{}']",
        escape(name),
        escape(message),
        escape(details)
    )
}

/// Formats a test-finished record.
#[must_use]
pub fn test_finished(name: &str) -> String {
    format!("##teamcity[testFinished name='{}']", escape(name))
}

/// Emits service messages to standard output when enabled.
#[derive(Clone, Copy, Debug)]
pub struct Reporter {
    enabled: bool,
}

impl Reporter {
    /// Creates a reporter; a disabled reporter swallows every message.
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    fn emit(self, line: &str) {
        if self.enabled {
            writeln!(io::stdout(), "{line}").ok();
        }
    }

    /// Opens a named block.
    pub fn block_opened(self, name: &str) {
        self.emit(&block_opened(name));
    }

    /// Closes a named block.
    pub fn block_closed(self, name: &str) {
        self.emit(&block_closed(name));
    }

    /// Records the start of a test.
    pub fn test_started(self, name: &str) {
        self.emit(&test_started(name));
    }

    /// Records a test failure.
    pub fn test_failed(self, name: &str, message: &str, details: &str) {
        self.emit(&test_failed(name, message, details));
    }

    /// Records the end of a test.
    pub fn test_finished(self, name: &str) {
        self.emit(&test_finished(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("plain", "plain")]
    #[case("a|b", "a||b")]
    #[case("it's", "it|'s")]
    #[case("line\nbreak", "line|nbreak")]
    #[case("cr\rhere", "cr|rhere")]
    #[case("[tag]", "|[tag|]")]
    fn escape_covers_structural_characters(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(escape(input), expected);
    }

    #[test]
    fn block_markers_carry_the_escaped_name() {
        assert_eq!(
            block_opened("TEST: write [smoke]"),
            "##teamcity[blockOpened name='TEST: write |[smoke|]']"
        );
        assert_eq!(block_closed("done"), "##teamcity[blockClosed name='done']");
    }

    #[test]
    fn test_failed_escapes_every_field() {
        let line = test_failed("write_setup", "it's broken", "trace|detail");
        assert_eq!(
            line,
            "##teamcity[testFailed name='write_setup' message='it|'s broken' details='trace||detail']"
        );
    }
}

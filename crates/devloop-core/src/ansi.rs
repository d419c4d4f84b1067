//! ANSI escape code handling for child diagnostics
//!
//! TypeScript compilers and test runners color their stderr. Reflection
//! failures carry that text into log files and error values, where the escape
//! sequences are noise.

use regex::Regex;
use std::sync::LazyLock;

/// CSI sequences, OSC sequences (BEL or ST terminated) and simple escapes
static ANSI_ESCAPE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \x1b\[[0-9;?]*[A-Za-z]                # CSI sequences
        | \x1b\][^\x07\x1b]*(?:\x07|\x1b\\)   # OSC sequences
        | \x1b[A-Za-z]                        # Simple escapes
        ",
    )
    .expect("ANSI regex pattern is valid")
});

/// Strip all ANSI escape sequences from a string.
///
/// # Examples
///
/// ```
/// use devloop_core::strip_ansi_codes;
///
/// let input = "\x1b[31merror\x1b[0m TS2304: Cannot find name 'x'";
/// assert_eq!(strip_ansi_codes(input), "error TS2304: Cannot find name 'x'");
/// ```
pub fn strip_ansi_codes(input: &str) -> String {
    ANSI_ESCAPE_PATTERN.replace_all(input, "").into_owned()
}

/// Check if a string contains ANSI escape sequences.
pub fn contains_ansi_codes(input: &str) -> bool {
    ANSI_ESCAPE_PATTERN.is_match(input)
}

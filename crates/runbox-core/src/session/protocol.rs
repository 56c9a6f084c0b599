//! The sentinel command protocol
//!
//! A command is sent as `sh -c '<command>; echo <sentinel>'`. The terminal
//! echoes the line back, so the sentinel shows up once in the echo and once
//! more when the command finishes.

use uuid::Uuid;

use crate::error::{Result, RunboxError};

/// Occurrences of the sentinel that mark a finished command
pub const COMPLETION_COUNT: usize = 2;

/// A fresh, never reused end-of-command token
pub fn new_sentinel() -> String {
    format!("__END_SIG_{}__", Uuid::new_v4().simple())
}

/// Single-quote escaping: `'` becomes `'\''`
pub fn escape_single_quotes(command: &str) -> String {
    command.replace('\'', r"'\''")
}

/// Build the line written to the terminal (without the trailing `\r`)
pub fn wrap_command(command: &str, sentinel: &str) -> Result<String> {
    let trimmed = command.trim().trim_end_matches(';').trim_end();
    if trimmed.is_empty() {
        return Err(RunboxError::InvalidInput("command is empty".to_string()));
    }
    // `cmd &; echo` is a syntax error; a backgrounded command is joined with a space
    let body = if trimmed.ends_with('&') && !trimmed.ends_with("&&") {
        format!("{} echo {}", trimmed, sentinel)
    } else {
        format!("{}; echo {}", trimmed, sentinel)
    };
    Ok(format!("sh -c '{}'", escape_single_quotes(&body)))
}

/// Byte offsets of every occurrence of `needle` in `haystack`
fn occurrences(haystack: &str, needle: &str) -> Vec<usize> {
    haystack.match_indices(needle).map(|(i, _)| i).collect()
}

/// The command's own output: everything between the echoed command line and
/// the line carrying the final sentinel. `transcript` must be ANSI-stripped.
pub fn extract_output(transcript: &str, sentinel: &str) -> String {
    let text = transcript.replace("\r\n", "\n");
    let hits = occurrences(&text, sentinel);

    let start = match hits.as_slice() {
        [first, _, ..] => text[*first..].find('\n').map_or(text.len(), |n| first + n + 1),
        _ => 0,
    };
    let end = match hits.last() {
        Some(last) => text[..*last].rfind('\n').map_or(0, |n| n + 1),
        None => text.len(),
    };
    if start >= end {
        return String::new();
    }
    text[start..end].trim_end_matches(['\n', '\r']).to_string()
}

//! Identifier generation and validation
//!
//! Sandbox IDs end up in filesystem paths, container names, runtime argv and
//! hostnames, so anything outside `[A-Za-z0-9_-]` is rejected before it
//! reaches those. An ID must start alphanumeric and may not end in
//! `-<digits>`: that suffix is reserved for service hostnames
//! (`<id>-<port>`), which keeps every hostname owned by exactly one sandbox.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{Result, RunboxError};

const SANDBOX_ID_LEN: usize = 16;
const MIN_ID_LEN: usize = 2;
const MAX_ID_LEN: usize = 64;
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

static VALID_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]+$").expect("static regex is valid")
});

static PORT_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-[0-9]+$").expect("static regex is valid"));

/// New random sandbox ID
pub fn generate_sandbox_id() -> String {
    uuid::Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(SANDBOX_ID_LEN)
        .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
        .collect()
}

/// New session ID
pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Reject IDs that are too short or too long, contain anything but
/// `[A-Za-z0-9_-]`, start with `-`/`_`, or end in `-<digits>`
pub fn validate_id(id: &str) -> Result<()> {
    if id.len() < MIN_ID_LEN {
        return Err(RunboxError::InvalidInput(format!(
            "ID must be at least {} characters",
            MIN_ID_LEN
        )));
    }
    if id.len() > MAX_ID_LEN {
        return Err(RunboxError::InvalidInput(format!(
            "ID is longer than {} characters",
            MAX_ID_LEN
        )));
    }
    if !VALID_ID.is_match(id) {
        return Err(RunboxError::InvalidInput(format!(
            "ID '{}' must start with a letter or digit and contain only letters, digits, '-' and '_'",
            id
        )));
    }
    if PORT_SUFFIX.is_match(id) {
        return Err(RunboxError::InvalidInput(format!(
            "ID '{}' cannot end in '-<digits>'",
            id
        )));
    }
    Ok(())
}

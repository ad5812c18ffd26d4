//! Hierarchical subject matching.
//!
//! Subjects are dot-separated tokens (`conversation.update_last_message_id`).
//! Patterns may use `*` for exactly one token and a trailing `>` for one or
//! more remaining tokens.

use crate::{BusError, BusResult};

pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether some concrete subject could match both patterns.
pub fn overlaps(a: &str, b: &str) -> bool {
    let a_tokens: Vec<&str> = a.split('.').collect();
    let b_tokens: Vec<&str> = b.split('.').collect();

    for i in 0..a_tokens.len().max(b_tokens.len()) {
        match (a_tokens.get(i), b_tokens.get(i)) {
            (Some(&">"), Some(_)) | (Some(_), Some(&">")) => return true,
            (Some(&"*"), Some(_)) | (Some(_), Some(&"*")) => {}
            (Some(x), Some(y)) if x == y => {}
            _ => return false,
        }
    }
    true
}

pub fn validate_pattern(pattern: &str) -> BusResult<()> {
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(BusError::InvalidConfig(format!(
                "empty token in subject {pattern}"
            )));
        }
        if *token == ">" && i != tokens.len() - 1 {
            return Err(BusError::InvalidConfig(format!(
                "'>' must be the last token in {pattern}"
            )));
        }
    }
    Ok(())
}

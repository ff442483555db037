//! Command parser
//!
//! Turns loosely formatted purchase commands into intents. The parser looks
//! for an `<amount><unit>` pair anywhere in the text and takes the word next
//! to it as the category alias, so "YouTube 2GB", "buy general 500 mb" and
//! "2GB for TikTok" are all accepted.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::ParseError;
use crate::models::{Category, ParsedIntent};

/// Bytes per MB (binary)
pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// Bytes per GB (binary)
pub const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Words allowed between the amount and a trailing alias
const FILLER_WORDS: [&str; 2] = ["of", "for"];

fn amount_regex() -> &'static Regex {
    static AMOUNT: OnceLock<Regex> = OnceLock::new();
    AMOUNT.get_or_init(|| {
        Regex::new(r"(?i)\b(\d+)\s*(gb|mb)\b").expect("amount pattern is valid")
    })
}

fn word_regex() -> &'static Regex {
    static WORD: OnceLock<Regex> = OnceLock::new();
    WORD.get_or_init(|| Regex::new(r"[A-Za-z][A-Za-z0-9_]*").expect("word pattern is valid"))
}

/// Parse a free-text purchase command into a top-up intent
pub fn parse_command(text: &str) -> Result<ParsedIntent, ParseError> {
    let captures = amount_regex()
        .captures(text)
        .ok_or(ParseError::UnrecognizedFormat)?;

    let whole = captures.get(0).ok_or(ParseError::UnrecognizedFormat)?;
    let digits = captures.get(1).ok_or(ParseError::UnrecognizedFormat)?.as_str();
    let unit = captures.get(2).ok_or(ParseError::UnrecognizedFormat)?.as_str();

    // "buy 2GB for YouTube": a verb before the amount must not shadow the
    // alias after it, so the first candidate that resolves wins.
    let candidates: Vec<&str> = [
        alias_before(&text[..whole.start()]),
        alias_after(&text[whole.end()..]),
    ]
    .into_iter()
    .flatten()
    .collect();

    let first = candidates.first().ok_or(ParseError::UnrecognizedFormat)?;
    let category = candidates
        .iter()
        .find_map(|alias| Category::from_alias(alias))
        .ok_or_else(|| ParseError::UnknownCategory(first.to_string()))?;

    let amount_bytes = to_bytes(digits, unit)?;

    Ok(ParsedIntent::TopUp {
        category,
        amount_bytes,
    })
}

/// Scale a decimal amount by its unit
fn to_bytes(digits: &str, unit: &str) -> Result<u64, ParseError> {
    let amount: u64 = digits
        .parse()
        .map_err(|_| ParseError::InvalidAmount(format!("{}{}", digits, unit)))?;

    let multiplier = if unit.eq_ignore_ascii_case("gb") {
        BYTES_PER_GB
    } else {
        BYTES_PER_MB
    };

    amount
        .checked_mul(multiplier)
        .ok_or_else(|| ParseError::InvalidAmount(format!("{}{}", digits, unit)))
}

/// Whitespace, ':' or '-' may sit between an alias and its amount
fn is_separator(c: char) -> bool {
    c.is_whitespace() || c == ':' || c == '-'
}

/// Last word of the text preceding the amount, if it ends right there
fn alias_before(prefix: &str) -> Option<&str> {
    let trimmed = prefix.trim_end_matches(is_separator);
    if trimmed.len() == prefix.len() && !prefix.is_empty() {
        // No separator: "abc2GB" is not "<alias> <amount>"
        return None;
    }
    let word = word_regex().find_iter(trimmed).last()?;
    (word.end() == trimmed.len()).then(|| word.as_str())
}

/// First meaningful word after the amount, skipping fillers
fn alias_after(suffix: &str) -> Option<&str> {
    let mut rest = suffix;
    loop {
        let trimmed = rest.trim_start_matches(is_separator);
        if trimmed.len() == rest.len() && !rest.is_empty() {
            return None;
        }
        let word = word_regex().find(trimmed)?;
        if word.start() != 0 {
            return None;
        }
        if FILLER_WORDS
            .iter()
            .any(|f| f.eq_ignore_ascii_case(word.as_str()))
        {
            rest = &trimmed[word.end()..];
            continue;
        }
        return Some(word.as_str());
    }
}

// ============================================================================
// Tests
// ============================================================================

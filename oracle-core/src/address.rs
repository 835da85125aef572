//! EVM address helpers

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static EVM_ADDRESS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0x[a-fA-F0-9]{40}\b").unwrap());

static EVM_ADDRESS_EXACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x[a-fA-F0-9]{40}$").unwrap());

/// `0x` followed by exactly 40 hex digits
pub fn is_evm_address(value: &str) -> bool {
    EVM_ADDRESS_EXACT.is_match(value.trim())
}

/// The all-zero address (or an empty string, which encodes to it)
pub fn is_zero_address(value: &str) -> bool {
    let hex = value.trim().trim_start_matches("0x").trim_start_matches("0X");
    hex.chars().all(|c| c == '0')
}

/// Unique addresses in order of first appearance, compared case-insensitively
pub fn extract_addresses(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    EVM_ADDRESS_REGEX
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|addr| seen.insert(addr.to_ascii_lowercase()))
        .collect()
}

//! Memory key generation.
//!
//! Keys are `memory_` + a compact UTC timestamp with second precision.
//! Two creates within the same second disambiguate with a numeric suffix.

use chrono::{DateTime, Utc};

pub const KEY_PREFIX: &str = "memory_";

/// Suffixes tried before a same-second create gives up with a conflict.
pub const MAX_KEY_ATTEMPTS: u32 = 99;

/// Base key for a creation instant: `memory_YYYYmmddHHMMSS`.
pub fn base_key(now: DateTime<Utc>) -> String {
    format!("{KEY_PREFIX}{}", now.format("%Y%m%d%H%M%S"))
}

/// `n`-th fallback candidate for a taken base key.
pub fn disambiguated(base: &str, n: u32) -> String {
    format!("{base}_{n}")
}

/// Selectors that name a key directly are never routed through semantic
/// search — a miss on a key-shaped selector is a plain not-found, not an
/// invitation to act on the nearest semantic match.
pub fn is_key_selector(selector: &str) -> bool {
    selector.starts_with(KEY_PREFIX)
}

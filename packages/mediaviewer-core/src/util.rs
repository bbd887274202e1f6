//! General utilities shared across the application.

use std::time::{SystemTime, UNIX_EPOCH};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Boolean-ish environment string coercion
// ─────────────────────────────────────────────────────────────────────────────

/// Parses the boolean-ish string tokens accepted throughout configuration:
/// `0/1/true/false/yes/no/on/off`, case-insensitive. Returns `None` for
/// anything else so callers can fall back to a default rather than panic.
#[must_use]
pub fn parse_boolish(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FNV-1a 32-bit hash
// ─────────────────────────────────────────────────────────────────────────────

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes the FNV-1a 32-bit hash of a byte string, as required by DeoVR's
/// numeric `id` field. Always returns a positive `i64` (the sign bit of the
/// 32-bit hash is masked off) so it round-trips cleanly through JSON numbers.
#[must_use]
pub fn fnv1a_32_positive(input: &str) -> i64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in input.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    i64::from(hash & 0x7FFF_FFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_boolish_accepts_all_tokens() {
        for tok in ["1", "true", "TRUE", "yes", "YES", "on", "On"] {
            assert_eq!(parse_boolish(tok), Some(true), "token: {tok}");
        }
        for tok in ["0", "false", "FALSE", "no", "NO", "off", "Off"] {
            assert_eq!(parse_boolish(tok), Some(false), "token: {tok}");
        }
    }

    #[test]
    fn parse_boolish_rejects_garbage() {
        assert_eq!(parse_boolish("maybe"), None);
        assert_eq!(parse_boolish(""), None);
    }

    #[test]
    fn fnv1a_is_stable_and_positive() {
        let a = fnv1a_32_positive("media-item-123");
        let b = fnv1a_32_positive("media-item-123");
        assert_eq!(a, b);
        assert!(a >= 0);
    }

    #[test]
    fn fnv1a_differs_for_different_inputs() {
        assert_ne!(fnv1a_32_positive("a"), fnv1a_32_positive("b"));
    }

    #[test]
    fn fnv1a_known_vector() {
        // FNV-1a 32-bit of the empty string is the offset basis itself.
        assert_eq!(
            fnv1a_32_positive(""),
            i64::from(FNV_OFFSET_BASIS & 0x7FFF_FFFF)
        );
    }
}

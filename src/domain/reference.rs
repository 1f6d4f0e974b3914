//! Transaction reference generation.
//!
//! References have the shape `{PREFIX}_{unix-seconds}_{hex}` so support staff can
//! tell the network and the time of purchase at a glance. The fulfillment provider
//! only accepts references between 6 and 25 characters.

use chrono::Utc;

pub const REFERENCE_MIN_LEN: usize = 6;
pub const REFERENCE_MAX_LEN: usize = 25;

/// Bytes of randomness appended to every reference (rendered as hex).
const RANDOM_BYTES: usize = 2;

/// Generates a new reference for the given prefix.
///
/// The prefix is upper-cased, stripped to `[A-Z0-9_]` and truncated so the whole
/// reference never exceeds [`REFERENCE_MAX_LEN`].
pub fn generate_reference(prefix: &str) -> String {
    let timestamp = Utc::now().timestamp().to_string();
    let random = hex::encode(rand::random::<[u8; RANDOM_BYTES]>());

    let budget = REFERENCE_MAX_LEN - timestamp.len() - random.len() - 2;
    let mut prefix: String = prefix
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .map(|ch| ch.to_ascii_uppercase())
        .collect();
    prefix.truncate(budget);
    if prefix.is_empty() {
        prefix.push_str("TXN");
    }

    format!("{}_{}_{}", prefix, timestamp, random)
}

/// Returns true if `reference` is something this service could have issued.
pub fn is_valid_reference(reference: &str) -> bool {
    (REFERENCE_MIN_LEN..=REFERENCE_MAX_LEN).contains(&reference.len())
        && reference
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_shape() {
        let reference = generate_reference("MTN_DATA");
        assert!(reference.starts_with("MTN_DATA_"));

        let parts: Vec<&str> = reference.rsplitn(3, '_').collect();
        assert_eq!(parts[0].len(), RANDOM_BYTES * 2);
        assert!(parts[0].chars().all(|c| c.is_ascii_hexdigit()));
        assert!(parts[1].parse::<i64>().is_ok());
    }

    #[test]
    fn test_reference_respects_provider_length_limits() {
        for prefix in ["AT_DATA", "MTN_DATA", "A_VERY_LONG_PREFIX_FOR_TESTING", ""] {
            let reference = generate_reference(prefix);
            assert!(reference.len() >= REFERENCE_MIN_LEN, "{}", reference);
            assert!(reference.len() <= REFERENCE_MAX_LEN, "{}", reference);
            assert!(is_valid_reference(&reference));
        }
    }

    #[test]
    fn test_references_differ() {
        let a = generate_reference("MTN_DATA");
        let b = generate_reference("MTN_DATA");
        let c = generate_reference("MTN_DATA");
        // Same second, 16 bits of randomness: three-way collision is vanishingly unlikely.
        assert!(a != b || b != c);
    }

    #[test]
    fn test_is_valid_reference_rejects_garbage() {
        assert!(!is_valid_reference("abc"));
        assert!(!is_valid_reference("../../etc/passwd"));
        assert!(!is_valid_reference(&"A".repeat(26)));
        assert!(is_valid_reference("MTN_DATA_1700000000_ab12"));
    }
}

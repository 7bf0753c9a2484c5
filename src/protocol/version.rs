//! Dotted-numeric version comparison.
//!
//! Native host and extension versions are dotted decimal strings such as
//! `2.17.1`. Comparison is numeric, part by part, with missing parts
//! treated as zero. A part that is not purely digits makes the comparison
//! unknown, never a panic.

// ============================================================================
// Imports
// ============================================================================

use std::cmp::Ordering;

// ============================================================================
// Comparison
// ============================================================================

/// Compares two dotted version strings numerically.
///
/// Returns `None` when either version contains a non-numeric part.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    let a_parts = parse_parts(a)?;
    let b_parts = parse_parts(b)?;

    let len = a_parts.len().max(b_parts.len());
    for i in 0..len {
        let x = a_parts.get(i).copied().unwrap_or(0);
        let y = b_parts.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => {}
            other => return Some(other),
        }
    }
    Some(Ordering::Equal)
}

/// Returns `true` if `actual` is at least `required`, `false` when it is
/// older or either version is malformed.
#[must_use]
pub fn is_at_least(actual: &str, required: &str) -> bool {
    matches!(
        compare_versions(actual, required),
        Some(Ordering::Greater | Ordering::Equal)
    )
}

fn parse_parts(version: &str) -> Option<Vec<u64>> {
    version
        .split('.')
        .map(|part| {
            if !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) {
                part.parse().ok()
            } else {
                None
            }
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_versions() {
        assert_eq!(compare_versions("2.17.1", "2.17.1"), Some(Ordering::Equal));
    }

    #[test]
    fn test_numeric_not_lexicographic() {
        assert_eq!(compare_versions("2.9", "2.10"), Some(Ordering::Less));
        assert_eq!(compare_versions("10.0", "9.9.9"), Some(Ordering::Greater));
    }

    #[test]
    fn test_missing_parts_are_zero() {
        assert_eq!(compare_versions("2.17", "2.17.0"), Some(Ordering::Equal));
        assert_eq!(compare_versions("2.17", "2.17.1"), Some(Ordering::Less));
    }

    #[test]
    fn test_malformed_is_unknown() {
        assert_eq!(compare_versions("2.x", "2.0"), None);
        assert_eq!(compare_versions("2.0", ""), None);
        assert!(!is_at_least("2.x", "2.0"));
    }

    #[test]
    fn test_is_at_least() {
        assert!(is_at_least("2.17.1", "2.14.0"));
        assert!(!is_at_least("2.13.9", "2.14.0"));
    }

    proptest::proptest! {
        #[test]
        fn prop_comparison_is_antisymmetric(
            a in proptest::collection::vec(0u64..1000, 1..5),
            b in proptest::collection::vec(0u64..1000, 1..5),
        ) {
            let a = a.iter().map(u64::to_string).collect::<Vec<_>>().join(".");
            let b = b.iter().map(u64::to_string).collect::<Vec<_>>().join(".");
            let forward = compare_versions(&a, &b).expect("numeric");
            let backward = compare_versions(&b, &a).expect("numeric");
            proptest::prop_assert_eq!(forward, backward.reverse());
        }

        #[test]
        fn prop_version_equals_itself(
            parts in proptest::collection::vec(0u64..1000, 1..5),
        ) {
            let v = parts.iter().map(u64::to_string).collect::<Vec<_>>().join(".");
            proptest::prop_assert!(is_at_least(&v, &v));
        }
    }
}

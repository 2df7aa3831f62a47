//! Assertions for pipeline output.

use std::fmt::Debug;

/// Returns `items` sorted, for comparing output whose order is unspecified.
#[must_use]
pub fn sorted<T: Ord>(mut items: Vec<T>) -> Vec<T> {
    items.sort();
    items
}

/// Asserts that both collections hold the same items, ignoring order.
pub fn assert_same_multiset<T: Ord + Debug>(actual: Vec<T>, expected: Vec<T>) {
    let actual = sorted(actual);
    let expected = sorted(expected);
    assert_eq!(
        actual, expected,
        "Expected the same items in any order, got {actual:?} instead of {expected:?}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_multiset_ignores_order() {
        assert_same_multiset(vec![3, 1, 2, 1], vec![1, 1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "Expected the same items")]
    fn test_same_multiset_counts_duplicates() {
        assert_same_multiset(vec![1, 2], vec![1, 1, 2]);
    }
}

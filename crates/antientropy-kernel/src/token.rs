//! Token ranges on the signed 64-bit ring.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Half-open interval `[start, end)` of tokens.
///
/// `start == end` covers the full ring and `end < start` wraps past
/// `i64::MAX`. Ranges are compared by their endpoints only; ordering is
/// `(start, end)` lexicographic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenRange {
    pub start: i64,
    pub end: i64,
}

impl TokenRange {
    pub const fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn is_full_ring(&self) -> bool {
        self.start == self.end
    }

    pub fn is_wrapping(&self) -> bool {
        self.end < self.start
    }

    /// Number of tokens in the range. The full ring reports `2^64`.
    pub fn size(&self) -> u128 {
        if self.is_full_ring() {
            return 1u128 << 64;
        }
        let diff = (self.end as i128) - (self.start as i128);
        if diff > 0 {
            diff as u128
        } else {
            (diff + (1i128 << 64)) as u128
        }
    }

    /// Decimal encodings of the endpoints, as persisted in `range_begin`/`range_end`.
    pub fn to_columns(&self) -> (String, String) {
        (self.start.to_string(), self.end.to_string())
    }

    pub fn from_columns(begin: &str, end: &str) -> Option<Self> {
        Some(Self {
            start: begin.trim().parse().ok()?,
            end: end.trim().parse().ok()?,
        })
    }
}

impl fmt::Display for TokenRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_range_size_crosses_max_token() {
        let range = TokenRange::new(i64::MAX - 1, i64::MIN + 1);
        assert!(range.is_wrapping());
        assert_eq!(range.size(), 3);
    }

    #[test]
    fn full_ring_is_start_equal_end() {
        let range = TokenRange::new(7, 7);
        assert!(range.is_full_ring());
        assert!(!range.is_wrapping());
        assert_eq!(range.size(), 1u128 << 64);
    }

    #[test]
    fn columns_use_decimal_encoding() {
        let range = TokenRange::new(-9_000, 42);
        let (begin, end) = range.to_columns();
        assert_eq!(begin, "-9000");
        assert_eq!(end, "42");
        assert_eq!(TokenRange::from_columns(&begin, &end), Some(range));
        assert_eq!(TokenRange::from_columns("x", "1"), None);
    }

    #[test]
    fn ordering_is_start_then_end() {
        let mut ranges = vec![
            TokenRange::new(5, 9),
            TokenRange::new(1, 4),
            TokenRange::new(1, 2),
        ];
        ranges.sort();
        assert_eq!(
            ranges,
            vec![
                TokenRange::new(1, 2),
                TokenRange::new(1, 4),
                TokenRange::new(5, 9)
            ]
        );
    }
}

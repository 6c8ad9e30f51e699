//! Dotted numeric version comparison.
//!
//! Both sides are split on `.`, the shorter one is padded with zeros, and
//! fields are compared left to right; the first differing field decides.
//! `"9"` and `"9.0"` are therefore equal.

use std::cmp::Ordering;

fn fields(version: &str) -> Vec<u64> {
    let trimmed = version.trim().trim_start_matches(['v', 'V']);
    if trimmed.is_empty() {
        return vec![0];
    }
    trimmed
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// Compare two dotted versions.
pub fn compare(a: &str, b: &str) -> Ordering {
    let mut left = fields(a);
    let mut right = fields(b);
    let len = left.len().max(right.len());
    left.resize(len, 0);
    right.resize(len, 0);

    left.iter()
        .zip(right.iter())
        .map(|(l, r)| l.cmp(r))
        .find(|ord| ord.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// `true` when data produced by `stored` predates the `threshold` version,
/// i.e. the format introduced at `threshold` is breaking for it.
///
/// An empty `stored` version counts as `"0"`.
pub fn is_breaking(stored: &str, threshold: &str) -> bool {
    compare(threshold, stored) == Ordering::Greater
}

/// `true` when `candidate` is strictly newer than `current`.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare(candidate, current) == Ordering::Greater
}

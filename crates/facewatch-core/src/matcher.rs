//! Exhaustive best-descriptor matching against a snapshot.

use crate::descriptor::Descriptor;
use crate::store::IdentityStore;
use serde::Serialize;
use std::fmt;

/// Name reported when no identity is accepted.
pub const UNKNOWN: &str = "unknown";

/// Outcome of matching one face against the identity database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Identity name, or [`UNKNOWN`].
    pub name: String,
    /// Best cosine similarity found, reported even when rejected.
    pub score: f32,
}

impl MatchResult {
    pub fn new(name: impl Into<String>, score: f32) -> Self {
        Self {
            name: name.into(),
            score,
        }
    }

    /// `("unknown", 0.0)`: no comparison was possible.
    pub fn unknown() -> Self {
        Self::new(UNKNOWN, 0.0)
    }

    pub fn is_unknown(&self) -> bool {
        self.name.eq_ignore_ascii_case(UNKNOWN)
    }
}

impl fmt::Display for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} ({:.2})", self.name, self.score)
        }
    }
}

/// Match `query` against every descriptor of every identity in `store`.
///
/// An identity scores as its single best reference photo. On equal scores
/// the identity enumerated first (lexicographic by name) wins. The best
/// score is returned even when it falls below `threshold`.
pub fn match_one(query: &Descriptor, store: &IdentityStore, threshold: f32) -> MatchResult {
    if store.is_empty() {
        return MatchResult::unknown();
    }

    let mut best_score = f32::NEG_INFINITY;
    let mut best_name: Option<&str> = None;

    for identity in store.iter() {
        for reference in identity.descriptors() {
            let score = query.similarity(reference);
            tracing::trace!(identity = identity.name(), score, "compared descriptor");
            // Strict comparison keeps the first identity on ties.
            if score > best_score {
                best_score = score;
                best_name = Some(identity.name());
            }
        }
    }

    match best_name {
        Some(name) if best_score >= threshold => MatchResult::new(name, best_score),
        Some(_) => MatchResult::new(UNKNOWN, best_score),
        None => MatchResult::unknown(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Identity;

    fn d(v: &[f32]) -> Descriptor {
        Descriptor::new(v.to_vec())
    }

    fn store(entries: &[(&str, &[&[f32]])]) -> IdentityStore {
        IdentityStore::new(
            1,
            entries.iter().map(|(name, descs)| {
                Identity::new(*name, descs.iter().map(|v| d(v)).collect()).unwrap()
            }),
        )
    }

    #[test]
    fn test_empty_store_is_unknown() {
        let result = match_one(&d(&[1.0, 0.0]), &IdentityStore::empty(0), -1.0);
        assert_eq!(result, MatchResult::unknown());
    }

    #[test]
    fn test_best_match_accepted() {
        let s = store(&[
            ("alice", &[&[0.0, 1.0, 0.0]]),
            ("bob", &[&[1.0, 0.0, 0.0]]),
            ("carol", &[&[0.0, 0.0, 1.0]]),
        ]);
        let result = match_one(&d(&[1.0, 0.0, 0.0]), &s, 0.5);
        assert_eq!(result.name, "bob");
        assert!((result.score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_rejection_reports_best_score() {
        let s = store(&[("alice", &[&[1.0, 1.0]])]);
        let result = match_one(&d(&[1.0, 0.0]), &s, 0.9);
        assert!(result.is_unknown());
        let expected = std::f32::consts::FRAC_1_SQRT_2;
        assert!((result.score - expected).abs() < 1e-5, "score {}", result.score);
    }

    #[test]
    fn test_single_good_photo_carries_identity() {
        // alice has one perfect photo and two poor ones; bob has two decent ones.
        // An average would favour bob, the best photo favours alice.
        let s = store(&[
            ("alice", &[&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0], &[0.0, 0.0, 1.0]]),
            ("bob", &[&[0.9, 0.3, 0.0], &[0.9, 0.0, 0.3]]),
        ]);
        let result = match_one(&d(&[1.0, 0.0, 0.0]), &s, 0.5);
        assert_eq!(result.name, "alice");
    }

    #[test]
    fn test_tie_breaks_by_name() {
        let s = store(&[
            ("zoe", &[&[1.0, 0.0]]),
            ("adam", &[&[1.0, 0.0]]),
            ("mia", &[&[1.0, 0.0]]),
        ]);
        for _ in 0..10 {
            assert_eq!(match_one(&d(&[2.0, 0.0]), &s, 0.5).name, "adam");
        }
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let s = store(&[("alice", &[&[1.0, 0.0]])]);
        assert_eq!(match_one(&d(&[1.0, 0.0]), &s, 1.0).name, "alice");
    }

    #[test]
    fn test_monotonic_acceptance() {
        let s = store(&[("alice", &[&[1.0, 0.2]]), ("bob", &[&[0.2, 1.0]])]);
        let q = d(&[1.0, 0.5]);
        let thresholds = [-1.0, 0.0, 0.3, 0.6, 0.9, 0.95, 0.99, 1.0];
        for (i, &t2) in thresholds.iter().enumerate() {
            let high = match_one(&q, &s, t2);
            if high.is_unknown() {
                continue;
            }
            for &t1 in &thresholds[..i] {
                assert_eq!(match_one(&q, &s, t1), high, "t1={t1} t2={t2}");
            }
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(MatchResult::new("alice", 0.876).to_string(), "alice (0.88)");
        assert_eq!(MatchResult::new(UNKNOWN, 0.3).to_string(), "unknown");
        assert!(MatchResult::new("Unknown", 0.0).is_unknown());
    }

    #[test]
    fn test_serializes_as_object() {
        let json = serde_json::to_value(MatchResult::new("alice", 0.5)).unwrap();
        assert_eq!(json, serde_json::json!({ "name": "alice", "score": 0.5 }));
    }
}

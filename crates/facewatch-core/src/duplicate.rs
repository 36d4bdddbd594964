//! Duplicate-registration guard.
//!
//! Linear scan over every registered embedding. Registration is rare and
//! identity stores hold tens to low hundreds of people, so no index is kept;
//! a nearest-neighbour index is the upgrade path if that stops holding.

use crate::comparator::{confidence, distance, CompareError};
use crate::types::{Embedding, IdentitySnapshot};

/// Outcome of a duplicate check.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    /// Identity owning the first embedding found under the threshold.
    pub identity: Option<String>,
    pub confidence: f32,
}

impl DuplicateCheck {
    fn clear() -> Self {
        Self {
            is_duplicate: false,
            identity: None,
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DuplicateGuard {
    threshold: f32,
}

impl DuplicateGuard {
    pub const DEFAULT_THRESHOLD: f32 = 0.4;

    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Compare `candidate` against registered `(identity, embedding)` pairs.
    ///
    /// Short-circuits on the first pair strictly closer than the threshold.
    /// Stored embeddings that cannot be compared are skipped; an invalid
    /// candidate is an error.
    pub fn check<'a, I>(&self, candidate: &Embedding, registered: I) -> Result<DuplicateCheck, CompareError>
    where
        I: IntoIterator<Item = (&'a str, &'a Embedding)>,
    {
        candidate.validate()?;

        let mut scanned = 0usize;
        for (identity, stored) in registered {
            scanned += 1;
            let d = match distance(candidate, stored) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(identity, error = %e, "skipping unreadable stored embedding");
                    continue;
                }
            };

            if d < self.threshold {
                let conf = confidence(d);
                tracing::info!(
                    identity,
                    distance = d,
                    confidence = conf,
                    "duplicate face detected"
                );
                return Ok(DuplicateCheck {
                    is_duplicate: true,
                    identity: Some(identity.to_string()),
                    confidence: conf,
                });
            }
        }

        tracing::debug!(scanned, threshold = self.threshold, "no duplicate found");
        Ok(DuplicateCheck::clear())
    }

    /// Check against every embedding in a snapshot.
    pub fn check_snapshot(
        &self,
        candidate: &Embedding,
        snapshot: &IdentitySnapshot,
    ) -> Result<DuplicateCheck, CompareError> {
        self.check(candidate, snapshot.embeddings())
    }
}

impl Default for DuplicateGuard {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KnownIdentity;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_flags_close_embedding() {
        let snapshot = IdentitySnapshot::new(vec![
            KnownIdentity::new("alice", vec![emb(&[1.0, 0.0])]),
            KnownIdentity::new("bob", vec![emb(&[0.0, 0.25])]),
        ]);
        let check = DuplicateGuard::default()
            .check_snapshot(&emb(&[0.0, 0.0]), &snapshot)
            .unwrap();
        assert!(check.is_duplicate);
        assert_eq!(check.identity.as_deref(), Some("bob"));
        assert!((check.confidence - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_no_duplicate() {
        let snapshot = IdentitySnapshot::new(vec![KnownIdentity::new("alice", vec![emb(&[1.0, 0.0])])]);
        let check = DuplicateGuard::default()
            .check_snapshot(&emb(&[0.0, 0.0]), &snapshot)
            .unwrap();
        assert_eq!(check, DuplicateCheck::clear());
    }

    #[test]
    fn test_threshold_is_strict() {
        let stored = emb(&[0.5, 0.0]);
        let guard = DuplicateGuard::new(0.5);
        let check = guard.check(&emb(&[0.0, 0.0]), [("alice", &stored)]).unwrap();
        assert!(!check.is_duplicate);
    }

    #[test]
    fn test_first_hit_short_circuits() {
        let snapshot = IdentitySnapshot::new(vec![
            KnownIdentity::new("alice", vec![emb(&[0.0, 0.3])]),
            KnownIdentity::new("bob", vec![emb(&[0.0, 0.0])]),
        ]);
        let check = DuplicateGuard::default()
            .check_snapshot(&emb(&[0.0, 0.0]), &snapshot)
            .unwrap();
        assert_eq!(check.identity.as_deref(), Some("alice"));
    }

    #[test]
    fn test_symmetric() {
        let a = emb(&[0.1, 0.2, 0.3]);
        let b = emb(&[0.2, 0.1, 0.35]);
        let guard = DuplicateGuard::new(0.4);
        let a_vs_b = guard.check(&a, [("b", &b)]).unwrap();
        let b_vs_a = guard.check(&b, [("a", &a)]).unwrap();
        assert!(a_vs_b.is_duplicate);
        assert_eq!(a_vs_b.is_duplicate, b_vs_a.is_duplicate);
        assert_eq!(a_vs_b.confidence, b_vs_a.confidence);
    }

    #[test]
    fn test_skips_corrupt_stored_embedding() {
        let corrupt = emb(&[0.0, 0.0, 0.0]);
        let close = emb(&[0.1, 0.0]);
        let check = DuplicateGuard::default()
            .check(&emb(&[0.0, 0.0]), [("broken", &corrupt), ("alice", &close)])
            .unwrap();
        assert_eq!(check.identity.as_deref(), Some("alice"));
    }

    #[test]
    fn test_invalid_candidate_is_error() {
        let stored = emb(&[0.0, 0.0]);
        let result = DuplicateGuard::default().check(&emb(&[f32::NAN, 0.0]), [("alice", &stored)]);
        assert_eq!(result, Err(CompareError::NonFinite { index: 0 }));
    }
}

//! Identity matching: nearest known identity for one observed embedding.

use crate::comparator::{confidence, distance_to_set};
use crate::settings::EngineSettings;
use crate::types::{Embedding, IdentitySnapshot, MatchResult};

/// Thresholds a match must clear.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    /// Maximum accepted distance (inclusive).
    pub recognition_threshold: f32,
    /// Minimum accepted confidence (inclusive).
    pub min_confidence: f32,
    /// When > 0, reject a best match whose runner-up identity is closer
    /// than this gap. 0 keeps first-evaluated-wins on ties.
    pub ambiguity_gap: f32,
}

impl MatchPolicy {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            recognition_threshold: settings.recognition_threshold,
            min_confidence: settings.min_confidence,
            ambiguity_gap: settings.match_ambiguity_gap,
        }
    }
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

/// Strategy for comparing a probe embedding against the identity snapshot.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        snapshot: &IdentitySnapshot,
        policy: &MatchPolicy,
    ) -> MatchResult;
}

/// Min-of-set matcher.
///
/// An identity's distance is the minimum over its reference embeddings, so a
/// face matches when it is close to *any* enrolled sample. The globally
/// nearest identity is accepted only if it is within the recognition
/// threshold and meets the confidence floor. Equal distances resolve to the
/// identity evaluated first.
pub struct MinDistanceMatcher;

impl Matcher for MinDistanceMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        snapshot: &IdentitySnapshot,
        policy: &MatchPolicy,
    ) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;
        let mut runner_up = f32::INFINITY;

        for (i, identity) in snapshot.identities().iter().enumerate() {
            let set = distance_to_set(probe, &identity.embeddings);
            if set.skipped > 0 {
                tracing::warn!(
                    identity = %identity.name,
                    skipped = set.skipped,
                    error = ?set.first_error,
                    "skipped unreadable reference embeddings"
                );
            }
            let Some((_, d)) = set.nearest else {
                continue;
            };

            match best {
                Some((_, best_d)) if d >= best_d => runner_up = runner_up.min(d),
                _ => {
                    if let Some((_, prev)) = best {
                        runner_up = runner_up.min(prev);
                    }
                    best = Some((i, d));
                }
            }
        }

        let Some((idx, best_d)) = best else {
            return MatchResult::no_candidates();
        };

        let conf = confidence(best_d);
        let within = best_d <= policy.recognition_threshold && conf >= policy.min_confidence;
        let ambiguous = policy.ambiguity_gap > 0.0 && runner_up - best_d < policy.ambiguity_gap;

        if ambiguous && within {
            tracing::debug!(
                identity = %snapshot.identities()[idx].name,
                distance = best_d,
                runner_up,
                "ambiguous match rejected"
            );
        }

        if within && !ambiguous {
            MatchResult {
                matched_identity: Some(snapshot.identities()[idx].name.clone()),
                confidence: conf,
                distance: best_d,
                is_match: true,
            }
        } else {
            MatchResult {
                matched_identity: None,
                confidence: conf,
                distance: best_d,
                is_match: false,
            }
        }
    }
}

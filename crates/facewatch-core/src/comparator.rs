//! Embedding distance and confidence.
//!
//! Distance is Euclidean, the metric dlib-style face encoders are trained
//! against: same-person pairs typically fall below 0.6. Confidence is the
//! linear complement `clamp(1 - distance, 0, 1)`.

use crate::types::Embedding;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompareError {
    #[error("embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("embedding is empty")]
    Empty,
    #[error("embedding value at index {index} is not finite")]
    NonFinite { index: usize },
}

/// Euclidean distance between two embeddings.
///
/// Symmetric, and exactly zero for identical vectors.
pub fn distance(a: &Embedding, b: &Embedding) -> Result<f32, CompareError> {
    if a.len() != b.len() {
        return Err(CompareError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    a.validate()?;
    b.validate()?;

    Ok(a.values
        .iter()
        .zip(b.values.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt())
}

/// Map a distance onto `[0, 1]`. Infinite distance yields 0.
pub fn confidence(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

/// Nearest member of a reference set, plus how many members were unusable.
#[derive(Debug, Clone, PartialEq)]
pub struct SetDistance {
    /// `(index, distance)` of the closest comparable member.
    pub nearest: Option<(usize, f32)>,
    pub skipped: usize,
    pub first_error: Option<CompareError>,
}

/// Minimum distance from `probe` to any member of `set`.
///
/// Members that cannot be compared (wrong length, NaN) are skipped, so one
/// corrupt reference never hides the rest of the set. Ties keep the earlier
/// member.
pub fn distance_to_set(probe: &Embedding, set: &[Embedding]) -> SetDistance {
    let mut result = SetDistance {
        nearest: None,
        skipped: 0,
        first_error: None,
    };

    for (i, reference) in set.iter().enumerate() {
        match distance(probe, reference) {
            Ok(d) => {
                if result.nearest.map_or(true, |(_, best)| d < best) {
                    result.nearest = Some((i, d));
                }
            }
            Err(e) => {
                result.skipped += 1;
                result.first_error.get_or_insert(e);
            }
        }
    }

    result
}

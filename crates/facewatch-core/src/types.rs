use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::comparator::CompareError;

/// Face bounding box in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
}

impl FaceBox {
    pub fn new(top: f32, right: f32, bottom: f32, left: f32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    /// Center point as `(x, y)`.
    pub fn center(&self) -> (f32, f32) {
        (
            (self.left + self.right) / 2.0,
            (self.top + self.bottom) / 2.0,
        )
    }
}

/// Face embedding vector (128-dimensional for dlib-style encoders).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Reject empty vectors and vectors containing NaN or infinity.
    pub fn validate(&self) -> Result<(), CompareError> {
        if self.values.is_empty() {
            return Err(CompareError::Empty);
        }
        match self.values.iter().position(|v| !v.is_finite()) {
            Some(index) => Err(CompareError::NonFinite { index }),
            None => Ok(()),
        }
    }

    /// True when every component is (numerically) zero. Encoders emit this
    /// for crops they could not read; such vectors sit close to everything.
    pub fn is_degenerate(&self) -> bool {
        self.values.iter().all(|v| v.abs() < 1e-9)
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// One detected face in one frame.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub bbox: FaceBox,
    pub embedding: Embedding,
    pub captured_at: DateTime<Utc>,
}

/// Frame-level metadata shared by every observation in the frame.
#[derive(Debug, Clone)]
pub struct FrameContext {
    pub camera: String,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    /// Opaque reference to the source image (path, URI, object key).
    pub image_ref: Option<String>,
}

/// A registered person and their reference embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownIdentity {
    pub name: String,
    pub embeddings: Vec<Embedding>,
}

impl KnownIdentity {
    pub fn new(name: impl Into<String>, embeddings: Vec<Embedding>) -> Self {
        Self {
            name: name.into(),
            embeddings,
        }
    }
}

/// Immutable view of the identity store taken at session start or reload.
///
/// Iteration order is the order the store returned, and it is the
/// tie-break order for equal match distances.
#[derive(Debug, Clone)]
pub struct IdentitySnapshot {
    identities: Vec<KnownIdentity>,
    dimension: Option<usize>,
}

impl IdentitySnapshot {
    /// Build a snapshot, dropping identities that have no embeddings.
    pub fn new(identities: Vec<KnownIdentity>) -> Self {
        let identities: Vec<KnownIdentity> = identities
            .into_iter()
            .filter(|identity| {
                if identity.embeddings.is_empty() {
                    tracing::warn!(
                        identity = %identity.name,
                        "identity has no embeddings; excluded from matching"
                    );
                    false
                } else {
                    true
                }
            })
            .collect();

        let dimension = dominant_dimension(&identities);

        Self {
            identities,
            dimension,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn identities(&self) -> &[KnownIdentity] {
        &self.identities
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Total reference embeddings across all identities.
    pub fn embedding_count(&self) -> usize {
        self.identities.iter().map(|i| i.embeddings.len()).sum()
    }

    /// Embedding length shared by the majority of valid references.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Iterate every `(identity name, embedding)` pair in snapshot order.
    pub fn embeddings(&self) -> impl Iterator<Item = (&str, &Embedding)> {
        self.identities.iter().flat_map(|identity| {
            identity
                .embeddings
                .iter()
                .map(move |embedding| (identity.name.as_str(), embedding))
        })
    }
}

fn dominant_dimension(identities: &[KnownIdentity]) -> Option<usize> {
    let mut counts: HashMap<usize, usize> = HashMap::new();
    for embedding in identities.iter().flat_map(|i| i.embeddings.iter()) {
        if embedding.validate().is_ok() {
            *counts.entry(embedding.len()).or_default() += 1;
        }
    }
    // Highest count wins; ties go to the larger dimension so the choice is stable.
    counts
        .into_iter()
        .max_by_key(|&(dim, count)| (count, dim))
        .map(|(dim, _)| dim)
}

/// Result of matching a probe embedding against the identity snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched_identity: Option<String>,
    /// `clamp(1 - distance, 0, 1)` of the nearest identity.
    pub confidence: f32,
    /// Distance to the nearest identity; infinite when nothing was comparable.
    pub distance: f32,
    pub is_match: bool,
}

impl MatchResult {
    /// Result for a probe that had nothing to compare against.
    pub fn no_candidates() -> Self {
        Self {
            matched_identity: None,
            confidence: 0.0,
            distance: f32::INFINITY,
            is_match: false,
        }
    }
}

/// Kind of persisted detection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Recognized,
    Unknown,
    Multiple,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Recognized => "recognized",
            EventKind::Unknown => "unknown",
            EventKind::Multiple => "multiple",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "recognized" => Some(EventKind::Recognized),
            "unknown" => Some(EventKind::Unknown),
            "multiple" => Some(EventKind::Multiple),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-face context attached to an event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceSummary {
    pub bbox: FaceBox,
    /// Identity name, or `"Unknown"`.
    pub label: String,
    /// `None` when the face had no comparable identity.
    pub distance: Option<f32>,
    pub confidence: f32,
}

impl FaceSummary {
    pub const UNKNOWN_LABEL: &'static str = "Unknown";

    pub fn from_match(bbox: FaceBox, result: &MatchResult) -> Self {
        Self {
            bbox,
            label: result
                .matched_identity
                .clone()
                .unwrap_or_else(|| Self::UNKNOWN_LABEL.to_string()),
            distance: result.distance.is_finite().then_some(result.distance),
            confidence: result.confidence,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub image_ref: Option<String>,
    pub faces: Vec<FaceSummary>,
}

/// An emitted detection. Ownership moves to the event sink on emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub id: Uuid,
    /// Camera / session that produced the event.
    pub source: String,
    pub kind: EventKind,
    pub subject: Option<String>,
    pub confidence: Option<f32>,
    pub payload: EventPayload,
    pub notes: String,
    pub timestamp: DateTime<Utc>,
}

impl DetectionEvent {
    pub fn new(
        source: impl Into<String>,
        kind: EventKind,
        subject: Option<String>,
        confidence: Option<f32>,
        payload: EventPayload,
        notes: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            kind,
            subject,
            confidence,
            payload,
            notes,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_box_center() {
        let b = FaceBox::new(10.0, 60.0, 50.0, 20.0);
        assert_eq!(b.center(), (40.0, 30.0));
    }

    #[test]
    fn test_validate_rejects_nan() {
        let e = Embedding::new(vec![0.1, f32::NAN, 0.2]);
        assert_eq!(e.validate(), Err(CompareError::NonFinite { index: 1 }));
        assert_eq!(Embedding::new(vec![]).validate(), Err(CompareError::Empty));
    }

    #[test]
    fn test_degenerate_embedding() {
        assert!(Embedding::new(vec![0.0; 4]).is_degenerate());
        assert!(!Embedding::new(vec![0.0, 0.1]).is_degenerate());
    }

    #[test]
    fn test_snapshot_drops_empty_identities() {
        let snapshot = IdentitySnapshot::new(vec![
            KnownIdentity::new("alice", vec![Embedding::new(vec![0.0, 1.0])]),
            KnownIdentity::new("ghost", vec![]),
        ]);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.identities()[0].name, "alice");
        assert_eq!(snapshot.embedding_count(), 1);
    }

    #[test]
    fn test_snapshot_dimension_ignores_outliers() {
        let snapshot = IdentitySnapshot::new(vec![
            KnownIdentity::new(
                "alice",
                vec![Embedding::new(vec![0.0; 3]), Embedding::new(vec![1.0; 3])],
            ),
            KnownIdentity::new("bob", vec![Embedding::new(vec![0.5; 7])]),
        ]);
        assert_eq!(snapshot.dimension(), Some(3));
        assert_eq!(IdentitySnapshot::empty().dimension(), None);
    }

    #[test]
    fn test_summary_for_unmatched_face() {
        let summary = FaceSummary::from_match(
            FaceBox::new(0.0, 10.0, 10.0, 0.0),
            &MatchResult::no_candidates(),
        );
        assert_eq!(summary.label, "Unknown");
        assert_eq!(summary.distance, None);
    }

    #[test]
    fn test_event_kind_roundtrip_names() {
        for kind in [EventKind::Recognized, EventKind::Unknown, EventKind::Multiple] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("error"), None);
    }
}

//! facewatch-core: Face match and detection-event engine.
//!
//! Classifies each observed face embedding against a snapshot of known
//! identities, tracks unknown sightings over time, and decides which
//! observations become persisted detection events. Face detection and
//! embedding extraction happen upstream; this crate only consumes their
//! output.

pub mod alert;
pub mod comparator;
pub mod duplicate;
pub mod extractor;
pub mod matcher;
pub mod provider;
pub mod session;
pub mod settings;
pub mod tracker;
pub mod types;

pub use alert::{AlertCoordinator, AlertPolicy, ClassifiedFace};
pub use comparator::CompareError;
pub use duplicate::{DuplicateCheck, DuplicateGuard};
pub use extractor::{EmbeddingExtractor, ExtractedFace, ExtractedFrame, JsonLinesExtractor};
pub use matcher::{MatchPolicy, Matcher, MinDistanceMatcher};
pub use provider::{EventSink, IdentityStore, ProviderError, SettingsProvider, SinkError};
pub use session::{Session, SessionError, SessionStats};
pub use settings::EngineSettings;
pub use tracker::{BucketGrid, SightingTracker};
pub use types::{
    DetectionEvent, Embedding, EventKind, EventPayload, FaceBox, FaceObservation, FaceSummary,
    FrameContext, IdentitySnapshot, KnownIdentity, MatchResult,
};

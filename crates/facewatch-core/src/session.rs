//! One camera session: match, track and alert, frame by frame.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::alert::{AlertCoordinator, ClassifiedFace};
use crate::comparator::CompareError;
use crate::extractor::ExtractedFrame;
use crate::matcher::{MatchPolicy, Matcher, MinDistanceMatcher};
use crate::provider::{IdentityStore, ProviderError, SettingsProvider};
use crate::settings::EngineSettings;
use crate::tracker::BucketGrid;
use crate::types::{DetectionEvent, Embedding, IdentitySnapshot};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("identity store unavailable at session start: {0}")]
    Identities(#[source] ProviderError),
    #[error("settings unavailable at session start: {0}")]
    Settings(#[source] ProviderError),
}

/// Running counters for a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub frames: u64,
    pub faces: u64,
    pub recognized: u64,
    pub unknown: u64,
    /// Observations dropped for malformed or mismatched embeddings.
    pub skipped: u64,
    pub events: u64,
}

pub struct Session {
    name: String,
    snapshot: Arc<IdentitySnapshot>,
    settings: EngineSettings,
    policy: MatchPolicy,
    matcher: Box<dyn Matcher + Send>,
    coordinator: AlertCoordinator,
    stats: SessionStats,
    last_frame_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Start a session from live providers. Either provider failing is fatal.
    pub fn start(
        name: impl Into<String>,
        identities: &dyn IdentityStore,
        settings: &dyn SettingsProvider,
        grid: BucketGrid,
    ) -> Result<Self, SessionError> {
        let settings = EngineSettings::load(settings).map_err(SessionError::Settings)?;
        let snapshot = identities
            .list_identities()
            .map(IdentitySnapshot::new)
            .map_err(SessionError::Identities)?;
        Ok(Self::with_state(name, Arc::new(snapshot), settings, grid))
    }

    pub fn with_state(
        name: impl Into<String>,
        snapshot: Arc<IdentitySnapshot>,
        settings: EngineSettings,
        grid: BucketGrid,
    ) -> Self {
        let name = name.into();
        tracing::info!(
            session = %name,
            identities = snapshot.len(),
            embeddings = snapshot.embedding_count(),
            threshold = settings.recognition_threshold,
            "session started"
        );
        Self {
            coordinator: AlertCoordinator::new(name.clone(), &settings, grid),
            policy: MatchPolicy::from_settings(&settings),
            matcher: Box::new(MinDistanceMatcher),
            name,
            snapshot,
            settings,
            stats: SessionStats::default(),
            last_frame_at: None,
        }
    }

    /// Replace the matching strategy.
    pub fn with_matcher(mut self, matcher: Box<dyn Matcher + Send>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn snapshot(&self) -> &Arc<IdentitySnapshot> {
        &self.snapshot
    }

    /// Unknown sightings currently tracked.
    pub fn tracked_sightings(&self) -> usize {
        self.coordinator.tracked_sightings()
    }

    /// Match every face in the frame and return the events it produced.
    pub fn process_frame(&mut self, frame: ExtractedFrame) -> Vec<DetectionEvent> {
        let (context, observations) = frame.into_observations();
        self.stats.frames += 1;
        // The tracker ignores frames older than the newest one.
        if self.last_frame_at.map_or(true, |last| context.captured_at >= last) {
            self.last_frame_at = Some(context.captured_at);
        }

        let mut classified = Vec::with_capacity(observations.len());
        for (index, obs) in observations.into_iter().enumerate() {
            self.stats.faces += 1;

            if let Err(e) = self.check_embedding(&obs.embedding) {
                self.stats.skipped += 1;
                tracing::warn!(
                    session = %self.name,
                    sequence = context.sequence,
                    face = index,
                    captured_at = %obs.captured_at,
                    error = %e,
                    "skipping face with unusable embedding"
                );
                continue;
            }

            let result = self.matcher.compare(&obs.embedding, &self.snapshot, &self.policy);
            if result.is_match {
                self.stats.recognized += 1;
                tracing::debug!(
                    session = %self.name,
                    identity = ?result.matched_identity,
                    confidence = result.confidence,
                    distance = result.distance,
                    "face recognized"
                );
            } else {
                self.stats.unknown += 1;
                tracing::debug!(session = %self.name, distance = result.distance, "face unknown");
            }
            classified.push(ClassifiedFace {
                bbox: obs.bbox,
                result,
            });
        }

        let events = self.coordinator.on_frame(&context, &classified);
        self.stats.events += events.len() as u64;
        events
    }

    fn check_embedding(&self, embedding: &Embedding) -> Result<(), CompareError> {
        embedding.validate()?;
        match self.snapshot.dimension() {
            Some(dim) if dim != embedding.len() => Err(CompareError::DimensionMismatch {
                left: embedding.len(),
                right: dim,
            }),
            _ => Ok(()),
        }
    }

    /// Swap in a new identity snapshot. Frames already matched are unaffected.
    pub fn install_snapshot(&mut self, snapshot: Arc<IdentitySnapshot>) {
        tracing::info!(
            session = %self.name,
            identities = snapshot.len(),
            "identity snapshot installed"
        );
        self.snapshot = snapshot;
    }

    /// Reload identities; on failure the previous snapshot stays in place.
    pub fn reload_identities(&mut self, store: &dyn IdentityStore) -> Result<usize, ProviderError> {
        match store.list_identities() {
            Ok(identities) => {
                let snapshot = IdentitySnapshot::new(identities);
                let count = snapshot.len();
                self.install_snapshot(Arc::new(snapshot));
                Ok(count)
            }
            Err(e) => {
                tracing::warn!(session = %self.name, error = %e, "identity reload failed; keeping previous snapshot");
                Err(e)
            }
        }
    }

    /// Re-read settings; on failure the current settings stay in place.
    pub fn reload_settings(&mut self, provider: &dyn SettingsProvider) -> Result<(), ProviderError> {
        match EngineSettings::load(provider) {
            Ok(settings) => {
                self.apply_settings(settings);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session = %self.name, error = %e, "settings reload failed; keeping previous settings");
                Err(e)
            }
        }
    }

    pub fn apply_settings(&mut self, settings: EngineSettings) {
        self.policy = MatchPolicy::from_settings(&settings);
        self.coordinator.reconfigure(&settings);
        self.settings = settings;
        tracing::info!(session = %self.name, "settings applied");
    }

    /// Stop the session: flush eligible sightings and drop all state.
    pub fn stop(self) -> Vec<DetectionEvent> {
        let now = self.last_frame_at.unwrap_or_else(Utc::now);
        let events = self.coordinator.finish(now);
        tracing::info!(
            session = %self.name,
            frames = self.stats.frames,
            flushed = events.len(),
            "session stopped"
        );
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::ExtractedFace;
    use crate::types::{EventKind, FaceBox, KnownIdentity};
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn at(secs: f64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + (secs * 1000.0).round() as i64)
            .unwrap()
    }

    fn face(values: &[f32], x: f32) -> ExtractedFace {
        ExtractedFace {
            bbox: FaceBox::new(0.0, x + 40.0, 40.0, x),
            embedding: Embedding::new(values.to_vec()),
        }
    }

    fn frame(secs: f64, faces: Vec<ExtractedFace>) -> ExtractedFrame {
        ExtractedFrame {
            camera: "door".into(),
            sequence: (secs * 10.0) as u64,
            captured_at: at(secs),
            image_ref: None,
            faces,
        }
    }

    fn identities() -> Vec<KnownIdentity> {
        vec![
            KnownIdentity::new("alice", vec![Embedding::new(vec![0.0, 0.3])]),
            KnownIdentity::new("bob", vec![Embedding::new(vec![0.6, 0.0])]),
        ]
    }

    fn settings() -> HashMap<String, String> {
        HashMap::from([("recognized_sample_every".to_string(), "1".to_string())])
    }

    struct FlakyStore {
        fail: Mutex<bool>,
    }

    impl IdentityStore for FlakyStore {
        fn list_identities(&self) -> Result<Vec<KnownIdentity>, ProviderError> {
            if *self.fail.lock().unwrap() {
                Err(ProviderError::Unavailable("connection refused".into()))
            } else {
                Ok(identities())
            }
        }
    }

    #[test]
    fn test_start_fails_without_identities() {
        let store = FlakyStore {
            fail: Mutex::new(true),
        };
        let result = Session::start("door", &store, &settings(), BucketGrid::default());
        assert!(matches!(result, Err(SessionError::Identities(_))));
    }

    struct DownSettings;

    impl SettingsProvider for DownSettings {
        fn get(&self, _name: &str, _default: &str) -> Result<String, ProviderError> {
            Err(ProviderError::Unavailable("settings table locked".into()))
        }
    }

    #[test]
    fn test_start_fails_without_settings() {
        let result = Session::start("door", &identities(), &DownSettings, BucketGrid::default());
        assert!(matches!(result, Err(SessionError::Settings(_))));
    }

    #[test]
    fn test_recognized_face_produces_event() {
        let mut session = Session::start("door", &identities(), &settings(), BucketGrid::default()).unwrap();
        let events = session.process_frame(frame(0.0, vec![face(&[0.0, 0.0], 0.0)]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Recognized);
        assert_eq!(events[0].subject.as_deref(), Some("alice"));
        assert_eq!(session.stats().recognized, 1);
        assert_eq!(session.stats().events, 1);
    }

    #[test]
    fn test_bad_embeddings_skipped_not_fatal() {
        let mut session = Session::start("door", &identities(), &settings(), BucketGrid::default()).unwrap();
        let events = session.process_frame(frame(
            0.0,
            vec![
                face(&[f32::NAN, 0.0], 0.0),
                face(&[0.0, 0.0, 0.0], 100.0),
                face(&[0.0, 0.0], 200.0),
            ],
        ));
        assert_eq!(session.stats().skipped, 2);
        assert_eq!(session.stats().faces, 3);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_unknown_flow_and_stop_flush() {
        let mut session = Session::with_state(
            "door",
            Arc::new(IdentitySnapshot::new(identities())),
            EngineSettings::default(),
            BucketGrid::default(),
        );
        let stranger = [5.0, 5.0];
        assert!(session.process_frame(frame(0.0, vec![face(&stranger, 0.0)])).is_empty());
        let events = session.process_frame(frame(1.0, vec![face(&stranger, 0.0)]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Unknown);

        // Neighbouring cell: eligible at t=3, held back until the window ends.
        assert!(session.process_frame(frame(2.0, vec![face(&stranger, 60.0)])).is_empty());
        assert!(session.process_frame(frame(5.5, vec![face(&stranger, 60.0)])).is_empty());
        assert_eq!(session.process_frame(frame(6.5, vec![face(&stranger, 60.0)])).len(), 1);
        assert_eq!(session.stats().events, 2);

        assert!(session.stop().is_empty());
    }

    #[test]
    fn test_stop_flushes_sighting_eligible_under_new_dwell() {
        let mut session = Session::with_state(
            "door",
            Arc::new(IdentitySnapshot::empty()),
            EngineSettings::default(),
            BucketGrid::default(),
        );
        session.process_frame(frame(0.0, vec![face(&[1.0], 0.0)]));
        session.process_frame(frame(0.5, vec![face(&[1.0], 0.0)]));

        session.apply_settings(EngineSettings {
            dwell_threshold_seconds: 0.2,
            ..EngineSettings::default()
        });
        let stopped = session.stop();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].kind, EventKind::Unknown);
        assert_eq!(stopped[0].timestamp, at(0.5));
        assert!(stopped[0].notes.contains("distance: n/a"));
    }

    #[test]
    fn test_late_frame_does_not_rewind_stop_time() {
        let mut session = Session::with_state(
            "door",
            Arc::new(IdentitySnapshot::new(identities())),
            EngineSettings::default(),
            BucketGrid::default(),
        );
        let stranger = [5.0, 5.0];
        session.process_frame(frame(0.0, vec![face(&stranger, 0.0)]));
        assert_eq!(session.process_frame(frame(1.0, vec![face(&stranger, 0.0)])).len(), 1);

        // Same cooldown area, seen too briefly to alert before stop.
        assert!(session.process_frame(frame(6.0, vec![face(&stranger, 60.0)])).is_empty());
        assert!(session.process_frame(frame(6.5, vec![face(&stranger, 60.0)])).is_empty());
        // A stale frame from before the first alert arrives late.
        assert!(session.process_frame(frame(0.5, Vec::new())).is_empty());

        session.apply_settings(EngineSettings {
            dwell_threshold_seconds: 0.2,
            ..EngineSettings::default()
        });
        let stopped = session.stop();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].kind, EventKind::Unknown);
        assert_eq!(stopped[0].timestamp, at(6.5));
    }

    struct AlwaysCarol;

    impl Matcher for AlwaysCarol {
        fn compare(&self, _probe: &Embedding, _snapshot: &IdentitySnapshot, _policy: &MatchPolicy) -> crate::types::MatchResult {
            crate::types::MatchResult {
                matched_identity: Some("carol".into()),
                confidence: 1.0,
                distance: 0.0,
                is_match: true,
            }
        }
    }

    #[test]
    fn test_custom_matcher() {
        let mut session = Session::start("door", &identities(), &settings(), BucketGrid::default())
            .unwrap()
            .with_matcher(Box::new(AlwaysCarol));
        let events = session.process_frame(frame(0.0, vec![face(&[0.0, 0.0], 0.0)]));
        assert_eq!(events[0].subject.as_deref(), Some("carol"));
    }

    #[test]
    fn test_reload_failure_keeps_snapshot() {
        let store = FlakyStore {
            fail: Mutex::new(false),
        };
        let mut session = Session::start("door", &store, &settings(), BucketGrid::default()).unwrap();
        *store.fail.lock().unwrap() = true;
        assert!(session.reload_identities(&store).is_err());
        assert_eq!(session.snapshot().len(), 2);

        *store.fail.lock().unwrap() = false;
        assert_eq!(session.reload_identities(&store).unwrap(), 2);
    }

    #[test]
    fn test_reload_settings_changes_threshold() {
        let mut session = Session::start("door", &identities(), &settings(), BucketGrid::default()).unwrap();
        // 0.3 from alice: a 0.25 threshold rejects it.
        let mut strict = settings();
        strict.insert("recognition_threshold".into(), "0.25".into());
        session.reload_settings(&strict).unwrap();
        assert!((session.settings().recognition_threshold - 0.25).abs() < 1e-6);

        let events = session.process_frame(frame(0.0, vec![face(&[0.0, 0.0], 0.0)]));
        assert!(events.is_empty());
        assert_eq!(session.stats().unknown, 1);
        assert_eq!(session.settings().dwell(), Duration::seconds(1));
    }
}

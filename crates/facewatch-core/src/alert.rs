//! Turns classified faces into detection events.
//!
//! - Recognised faces are sampled every Nth frame.
//! - Unknown faces go through the [`SightingTracker`] and become `unknown`
//!   events when it says so.
//! - Frames with two or more faces raise one `multiple` event when at least
//!   one unknown face is clearly separated from the recognition threshold.

use chrono::{DateTime, Duration, Utc};

use crate::settings::EngineSettings;
use crate::tracker::{BucketGrid, SightingAlert, SightingTracker, TrackerTimings, UnknownSighting};
use crate::types::{
    DetectionEvent, EventKind, EventPayload, FaceBox, FaceSummary, FrameContext, MatchResult,
};

const NOTE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A face after identity matching.
#[derive(Debug, Clone)]
pub struct ClassifiedFace {
    pub bbox: FaceBox,
    pub result: MatchResult,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertPolicy {
    /// Unmatched faces farther than this are clearly unknown.
    pub clear_unknown_distance: f32,
    pub recognized_sample_every: u64,
    /// Minimum spacing between `multiple` events.
    pub cooldown: Duration,
}

impl AlertPolicy {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            clear_unknown_distance: settings.clear_unknown_distance(),
            recognized_sample_every: settings.recognized_sample_every.max(1),
            cooldown: settings.cooldown(),
        }
    }

    fn clearly_unknown(&self, result: &MatchResult) -> bool {
        !result.is_match && result.distance > self.clear_unknown_distance
    }
}

pub struct AlertCoordinator {
    source: String,
    policy: AlertPolicy,
    tracker: SightingTracker,
    frames_seen: u64,
    last_composite: Option<DateTime<Utc>>,
}

impl AlertCoordinator {
    pub fn new(source: impl Into<String>, settings: &EngineSettings, grid: BucketGrid) -> Self {
        Self {
            source: source.into(),
            policy: AlertPolicy::from_settings(settings),
            tracker: SightingTracker::new(grid, timings(settings)),
            frames_seen: 0,
            last_composite: None,
        }
    }

    pub fn reconfigure(&mut self, settings: &EngineSettings) {
        self.policy = AlertPolicy::from_settings(settings);
        self.tracker.reconfigure(timings(settings));
    }

    pub fn tracked_sightings(&self) -> usize {
        self.tracker.tracked_count()
    }

    /// Decide the events for one frame. Must be called for every frame,
    /// including frames without faces, so disappearances are noticed.
    pub fn on_frame(&mut self, frame: &FrameContext, faces: &[ClassifiedFace]) -> Vec<DetectionEvent> {
        self.frames_seen += 1;
        let now = frame.captured_at;
        let mut events = Vec::new();

        if self.frames_seen % self.policy.recognized_sample_every == 0 {
            for face in faces.iter().filter(|f| f.result.is_match) {
                events.push(self.recognized_event(frame, face));
            }
        }

        let unknowns: Vec<UnknownSighting> = faces
            .iter()
            .filter(|f| !f.result.is_match)
            .map(|f| UnknownSighting {
                bbox: f.bbox,
                distance: f.result.distance,
                confidence: f.result.confidence,
                image_ref: frame.image_ref.clone(),
            })
            .collect();

        for alert in self.tracker.update(now, &unknowns) {
            events.push(unknown_event(&self.source, &alert, now));
        }

        if faces.len() >= 2 {
            if let Some(event) = self.composite_event(frame, faces) {
                events.push(event);
            }
        }

        events
    }

    /// End of session: flush eligible sightings and drop all tracking state.
    pub fn finish(self, now: DateTime<Utc>) -> Vec<DetectionEvent> {
        let source = self.source;
        self.tracker
            .finish(now)
            .iter()
            .map(|alert| unknown_event(&source, alert, now))
            .collect()
    }

    fn recognized_event(&self, frame: &FrameContext, face: &ClassifiedFace) -> DetectionEvent {
        let name = face
            .result
            .matched_identity
            .clone()
            .unwrap_or_default();
        let notes = format!(
            "Recognized {} (confidence: {:.3}, distance: {:.3})",
            name, face.result.confidence, face.result.distance
        );
        tracing::debug!(camera = %self.source, identity = %name, "recognized face sampled");

        DetectionEvent::new(
            self.source.clone(),
            EventKind::Recognized,
            Some(name),
            Some(face.result.confidence),
            EventPayload {
                image_ref: frame.image_ref.clone(),
                faces: vec![FaceSummary::from_match(face.bbox, &face.result)],
            },
            notes,
            frame.captured_at,
        )
    }

    fn composite_event(&mut self, frame: &FrameContext, faces: &[ClassifiedFace]) -> Option<DetectionEvent> {
        let known: Vec<&str> = faces
            .iter()
            .filter_map(|f| f.result.matched_identity.as_deref())
            .collect();
        let unknown_count = faces.len() - known.len();
        let summary = format!(
            "Multiple faces: {} known ({}), {} unknown",
            known.len(),
            known.join(", "),
            unknown_count
        );
        tracing::info!(camera = %self.source, faces = faces.len(), "{summary}");

        if !faces.iter().any(|f| self.policy.clearly_unknown(&f.result)) {
            return None;
        }

        let now = frame.captured_at;
        if let Some(last) = self.last_composite {
            if now - last < self.policy.cooldown {
                tracing::debug!(camera = %self.source, "multiple-face event suppressed by cooldown");
                return None;
            }
        }
        self.last_composite = Some(now);

        let notes = format!(
            "Multiple faces: {} known, {} unknown at {} - {}",
            known.len(),
            unknown_count,
            now.format(NOTE_TIME_FORMAT),
            summary
        );

        Some(DetectionEvent::new(
            self.source.clone(),
            EventKind::Multiple,
            None,
            None,
            EventPayload {
                image_ref: frame.image_ref.clone(),
                faces: faces
                    .iter()
                    .map(|f| FaceSummary::from_match(f.bbox, &f.result))
                    .collect(),
            },
            notes,
            now,
        ))
    }
}

fn timings(settings: &EngineSettings) -> TrackerTimings {
    TrackerTimings {
        dwell: settings.dwell(),
        cooldown: settings.cooldown(),
    }
}

fn unknown_event(source: &str, alert: &SightingAlert, now: DateTime<Utc>) -> DetectionEvent {
    let distance = if alert.distance.is_finite() {
        format!("{:.3}", alert.distance)
    } else {
        "n/a".to_string()
    };
    let dwell_secs = alert.dwell().num_milliseconds() as f64 / 1000.0;
    let notes = format!(
        "Unknown face detected (distance: {}, dwell: {:.1}s) at {}",
        distance,
        dwell_secs,
        now.format(NOTE_TIME_FORMAT)
    );

    tracing::warn!(
        camera = source,
        distance = alert.distance,
        dwell_secs,
        flushed = alert.flushed,
        "unknown face alert"
    );

    DetectionEvent::new(
        source,
        EventKind::Unknown,
        None,
        Some(alert.confidence),
        EventPayload {
            image_ref: alert.image_ref.clone(),
            faces: vec![FaceSummary {
                bbox: alert.bbox,
                label: FaceSummary::UNKNOWN_LABEL.to_string(),
                distance: alert.distance.is_finite().then_some(alert.distance),
                confidence: alert.confidence,
            }],
        },
        notes,
        now,
    )
}
